//! A conformance suite for [Directory] implementations.
//!
//! Every backend runs the same suite so the trait semantics cannot drift
//! between the in-memory reference and the durable stores.

use std::collections::HashMap;

use crate::{Directory, DirectoryError, NodeId, VirtualNode};

/// Asserts that the given ring snapshot forms exactly one directed cycle
/// containing exactly `expected` (in any rotation).
pub fn assert_single_cycle(ring: &[VirtualNode], expected: &[NodeId]) {
    assert_eq!(
        ring.len(),
        expected.len(),
        "ring size mismatch: {ring:?}",
    );

    let successors: HashMap<NodeId, NodeId> = ring
        .iter()
        .map(|node| {
            let successor = node
                .successor_id
                .unwrap_or_else(|| panic!("node {} has no successor", node.node_id));
            (node.node_id, successor)
        })
        .collect();

    for id in expected {
        assert!(successors.contains_key(id), "node {id} missing from ring");
    }

    // Walk the successor pointers; a single cycle visits every member once
    // before returning to the start.
    let start = expected[0];
    let mut current = start;
    let mut visited = 0;
    loop {
        current = successors[&current];
        visited += 1;
        if current == start {
            break;
        }
        assert!(
            visited <= expected.len(),
            "successor walk did not close after {visited} hops: {successors:?}",
        );
    }

    assert_eq!(visited, expected.len(), "cycle skips members: {successors:?}");
}

fn seed_nodes() -> Vec<VirtualNode> {
    vec![
        VirtualNode::new(1, "127.0.0.1", 9101, 9201),
        VirtualNode::new(2, "127.0.0.1", 9102, 9202),
        VirtualNode::new(6, "127.0.0.1", 9106, 9206),
    ]
}

/// Runs the full conformance suite against `directory`.
///
/// The store must be empty when handed in.
pub async fn run_directory_suite<D: Directory>(directory: D) {
    let seed = seed_nodes();
    directory.initialize(&seed).await.expect("initialize store");

    // Seeding is idempotent once populated.
    directory
        .initialize(&[VirtualNode::new(9, "10.0.0.9", 9, 9)])
        .await
        .expect("re-initialize store");

    let all = directory.get_all_nodes().await.expect("get all nodes");
    assert_eq!(all.len(), 3);
    assert!(all.iter().all(|node| node.successor_id.is_none()));
    assert!(all.iter().all(|node| !node.is_coordinator));
    assert!(!all.iter().any(|node| node.node_id == 9));

    assert_eq!(directory.ring_size().await.unwrap(), 0);
    assert!(directory
        .get_all_nodes_with_successors()
        .await
        .unwrap()
        .is_empty());

    // Bootstrap claim: first claimer wins, the loser sees the winner.
    assert!(directory.try_claim_coordinator(6).await.unwrap());
    assert!(!directory.try_claim_coordinator(1).await.unwrap());
    assert!(directory.try_claim_coordinator(6).await.unwrap());

    let all = directory.get_all_nodes().await.unwrap();
    let coordinator = crate::find_coordinator(&all).expect("coordinator recorded");
    assert_eq!(coordinator.node_id, 6);

    // Ring of one: 6 is its own successor.
    directory.set_node_successor(6, 6).await.unwrap();
    assert_eq!(directory.ring_size().await.unwrap(), 1);

    // Join 1 between 6 and 6, then 2 between 1 and 6.
    directory.insert_into_ring(6, 6, 1).await.unwrap();
    directory.insert_into_ring(1, 6, 2).await.unwrap();

    let ring = directory.get_all_nodes_with_successors().await.unwrap();
    assert_single_cycle(&ring, &[1, 2, 6]);
    assert_eq!(directory.ring_size().await.unwrap(), 3);

    let higher = directory
        .nodes_in_ring_with_id_greater_than(2)
        .await
        .unwrap();
    assert_eq!(higher.len(), 1);
    assert_eq!(higher[0].node_id, 6);
    assert!(directory
        .nodes_in_ring_with_id_greater_than(6)
        .await
        .unwrap()
        .is_empty());

    // Unknown IDs are rejected without touching the ring.
    let err = directory.insert_into_ring(1, 2, 42).await.unwrap_err();
    assert!(matches!(err, DirectoryError::UnknownNode(42)));
    let ring = directory.get_all_nodes_with_successors().await.unwrap();
    assert_single_cycle(&ring, &[1, 2, 6]);

    // Removing 2 re-links 1 -> 6 and clears 2's successor.
    directory.remove_from_ring(1, 6, 2).await.unwrap();
    let ring = directory.get_all_nodes_with_successors().await.unwrap();
    assert_single_cycle(&ring, &[1, 6]);
    assert!(!ring.iter().any(|node| node.node_id == 2));

    // A re-elected coordinator replaces the old flag atomically.
    directory.update_coordinator(1).await.unwrap();
    let all = directory.get_all_nodes().await.unwrap();
    let flagged: Vec<NodeId> = all
        .iter()
        .filter(|node| node.is_coordinator)
        .map(|node| node.node_id)
        .collect();
    assert_eq!(flagged, vec![1]);

    // The claim CAS respects an existing flag.
    assert!(!directory.try_claim_coordinator(6).await.unwrap());
    assert!(directory.try_claim_coordinator(1).await.unwrap());

    // Graceful departure: clear the last successors one by one.
    directory.remove_node_successor(1).await.unwrap();
    directory.remove_node_successor(6).await.unwrap();
    assert_eq!(directory.ring_size().await.unwrap(), 0);

    let err = directory.set_node_successor(42, 1).await.unwrap_err();
    assert!(matches!(err, DirectoryError::UnknownNode(42)));
}
