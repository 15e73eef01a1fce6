use std::sync::Arc;
use std::time::Duration;

use tokenring_directory::test_suite::assert_single_cycle;
use tokenring_directory::{find_coordinator, Directory, MemDirectory, NodeId, VirtualNode};
use tokenring_node::{ElectionMethod, NodeConfig, RingNode, RingNodeBuilder};

const WAIT: Duration = Duration::from_secs(30);
const REPAIR_WAIT: Duration = Duration::from_secs(60);

fn seed_rows(ids: &[NodeId]) -> Vec<VirtualNode> {
    ids.iter()
        .map(|id| {
            let addr = test_helper::get_unused_udp_addr();
            VirtualNode::new(*id, addr.ip().to_string(), addr.port(), 0)
        })
        .collect()
}

fn test_config(node_id: NodeId, method: ElectionMethod) -> NodeConfig {
    NodeConfig::new(node_id, method)
        .with_token_hold(Duration::from_millis(100))
        .with_base_timeout(Duration::from_millis(800))
}

async fn connect_node(
    node_id: NodeId,
    method: ElectionMethod,
    directory: &Arc<MemDirectory>,
    seed: &[VirtualNode],
) -> RingNode {
    RingNodeBuilder::new(test_config(node_id, method), directory.clone())
        .with_seed_nodes(seed.to_vec())
        .connect()
        .await
        .expect("node should connect")
}

/// Waits until the node's application loop holds the token, so a peer can
/// be killed while the token is provably elsewhere.
async fn wait_until_holding(node: &RingNode) -> anyhow::Result<()> {
    let mut watcher = node.token_watcher();
    tokio::time::timeout(WAIT, async move {
        loop {
            if *watcher.borrow() {
                return;
            }
            if watcher.changed().await.is_err() {
                return;
            }
        }
    })
    .await?;
    Ok(())
}

async fn wait_for_coordinator(
    directory: &Arc<MemDirectory>,
    expected: NodeId,
) -> anyhow::Result<()> {
    tokio::time::timeout(REPAIR_WAIT, async move {
        loop {
            let nodes = directory.get_all_nodes().await.expect("directory read");
            if find_coordinator(&nodes).map(|node| node.node_id) == Some(expected) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    })
    .await?;
    Ok(())
}

#[tokio::test]
async fn test_single_node_runs_a_closed_loop() {
    let _ = tracing_subscriber::fmt::try_init();

    let directory = Arc::new(MemDirectory::new());
    let seed = seed_rows(&[6]);

    let node = connect_node(6, ElectionMethod::RingBased, &directory, &seed).await;

    node.wait_for_ring_size(1, WAIT)
        .await
        .expect("ring of one should form");

    // The bootstrap coordinator originates the token and keeps it moving
    // through its own loopback.
    node.wait_for_tokens(3, WAIT)
        .await
        .expect("token should circulate through the self-loop");

    let stats = node.statistics();
    assert!(stats.tokens_forwarded() >= 2);

    node.shutdown().await;
}

#[tokio::test]
async fn test_three_members_form_one_cycle_and_circulate() {
    let _ = tracing_subscriber::fmt::try_init();

    let directory = Arc::new(MemDirectory::new());
    let seed = seed_rows(&[1, 2, 6]);

    // The first node up claims the coordinator flag; the others join
    // through it.
    let node_6 = connect_node(6, ElectionMethod::RingBased, &directory, &seed).await;
    let node_1 = connect_node(1, ElectionMethod::RingBased, &directory, &seed).await;
    let node_2 = connect_node(2, ElectionMethod::RingBased, &directory, &seed).await;

    node_6
        .wait_for_ring_size(3, WAIT)
        .await
        .expect("all three members should be in the ring");

    let ring = directory.get_all_nodes_with_successors().await.unwrap();
    assert_single_cycle(&ring, &[1, 2, 6]);

    // Token liveness: every member keeps receiving the token.
    for node in [&node_6, &node_1, &node_2] {
        node.wait_for_tokens(2, WAIT)
            .await
            .expect("token should reach every member repeatedly");
    }

    for node in [node_6, node_1, node_2] {
        node.shutdown().await;
    }
}

#[tokio::test]
async fn test_dead_member_is_cut_out_of_the_ring() {
    let _ = tracing_subscriber::fmt::try_init();

    let directory = Arc::new(MemDirectory::new());
    let seed = seed_rows(&[1, 2, 6]);

    let node_6 = connect_node(6, ElectionMethod::RingBased, &directory, &seed).await;
    let node_1 = connect_node(1, ElectionMethod::RingBased, &directory, &seed).await;
    let node_2 = connect_node(2, ElectionMethod::RingBased, &directory, &seed).await;

    node_6.wait_for_ring_size(3, WAIT).await.unwrap();
    node_2.wait_for_tokens(1, WAIT).await.unwrap();

    // Kill 2 while the coordinator holds the token, so the token provably
    // does not die with it.
    wait_until_holding(&node_6).await.unwrap();
    node_2.shutdown().await;

    // Whoever pointed at 2 notices on the next forward and asks the
    // coordinator for a repair.
    node_6
        .wait_for_ring_size(2, REPAIR_WAIT)
        .await
        .expect("dead member should be removed from the ring");

    let ring = directory.get_all_nodes_with_successors().await.unwrap();
    assert_single_cycle(&ring, &[1, 6]);
    assert!(!ring.iter().any(|node| node.node_id == 2));

    // The survivors keep circulating.
    let received = node_1.statistics().tokens_received();
    node_1
        .wait_for_tokens(received + 2, REPAIR_WAIT)
        .await
        .expect("token should keep circulating after the repair");

    node_6.shutdown().await;
    node_1.shutdown().await;
}

#[tokio::test]
async fn test_bully_election_after_coordinator_death() {
    let _ = tracing_subscriber::fmt::try_init();

    let directory = Arc::new(MemDirectory::new());
    let seed = seed_rows(&[1, 2, 6]);

    let node_6 = connect_node(6, ElectionMethod::Bully, &directory, &seed).await;
    let node_1 = connect_node(1, ElectionMethod::Bully, &directory, &seed).await;
    let node_2 = connect_node(2, ElectionMethod::Bully, &directory, &seed).await;

    node_6.wait_for_ring_size(3, WAIT).await.unwrap();
    node_1.wait_for_tokens(1, WAIT).await.unwrap();

    // Kill the coordinator while a survivor holds the token.
    wait_until_holding(&node_1).await.unwrap();
    node_6.shutdown().await;

    // The node whose successor was 6 repairs as a provisional proxy and the
    // bully election crowns the highest surviving ID.
    wait_for_coordinator(&directory, 2)
        .await
        .expect("node 2 should win the bully election");

    node_1.wait_for_ring_size(2, REPAIR_WAIT).await.unwrap();
    let ring = directory.get_all_nodes_with_successors().await.unwrap();
    assert_single_cycle(&ring, &[1, 2]);

    let received = node_2.statistics().tokens_received();
    node_2
        .wait_for_tokens(received + 2, REPAIR_WAIT)
        .await
        .expect("token should survive the coordinator change");

    node_1.shutdown().await;
    node_2.shutdown().await;
}

#[tokio::test]
async fn test_chang_roberts_election_after_coordinator_death() {
    let _ = tracing_subscriber::fmt::try_init();

    let directory = Arc::new(MemDirectory::new());
    let seed = seed_rows(&[3, 5, 8]);

    let node_8 = connect_node(8, ElectionMethod::ChangRoberts, &directory, &seed).await;
    let node_3 = connect_node(3, ElectionMethod::ChangRoberts, &directory, &seed).await;
    let node_5 = connect_node(5, ElectionMethod::ChangRoberts, &directory, &seed).await;

    node_8.wait_for_ring_size(3, WAIT).await.unwrap();
    node_5.wait_for_tokens(1, WAIT).await.unwrap();

    wait_until_holding(&node_3).await.unwrap();
    node_8.shutdown().await;

    // The election circulates over the repaired ring links.
    wait_for_coordinator(&directory, 5)
        .await
        .expect("node 5 should win the chang roberts election");

    node_3.wait_for_ring_size(2, REPAIR_WAIT).await.unwrap();
    let ring = directory.get_all_nodes_with_successors().await.unwrap();
    assert_single_cycle(&ring, &[3, 5]);

    node_3.shutdown().await;
    node_5.shutdown().await;
}
