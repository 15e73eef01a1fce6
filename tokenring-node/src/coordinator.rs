//! The coordinator role: logic run only by the elected node.
//!
//! Both handlers mutate the ring through the directory's atomic multi-row
//! operations and return the successor assignments to announce. They must
//! never interleave; the state-machine task runs them one at a time, which
//! is the serialisation the directory's per-call atomicity relies on.

use std::sync::Arc;

use rand::seq::SliceRandom;
use tokenring_directory::{Directory, NodeId};
use tracing::{info, warn};

use crate::error::NodeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// A successor assignment to deliver: `node_id`'s successor is now
/// `successor_id`.
pub(crate) struct SuccessorAssignment {
    pub node_id: NodeId,
    pub successor_id: NodeId,
}

pub(crate) struct CoordinatorRole {
    self_id: NodeId,
    directory: Arc<dyn Directory>,
}

impl CoordinatorRole {
    pub(crate) fn new(self_id: NodeId, directory: Arc<dyn Directory>) -> Self {
        Self { self_id, directory }
    }

    /// Admits a node into the ring.
    ///
    /// An empty ring makes the requester its own successor. Otherwise the
    /// insertion point is an existing member picked uniformly at random, and
    /// both the requester and its new predecessor get fresh assignments.
    pub(crate) async fn handle_join_request(
        &self,
        requester_id: NodeId,
    ) -> Result<Vec<SuccessorAssignment>, NodeError> {
        let ring = self.directory.get_all_nodes_with_successors().await?;

        if ring.is_empty() {
            info!(requester_id = requester_id, "First member; closing the ring on itself.");
            self.directory
                .set_node_successor(requester_id, requester_id)
                .await?;
            return Ok(vec![SuccessorAssignment {
                node_id: requester_id,
                successor_id: requester_id,
            }]);
        }

        // JOIN rides the unreliable control plane, so retries can duplicate
        // it. A member that asks again just gets its recorded successor.
        if let Some(member) = ring.iter().find(|node| node.node_id == requester_id) {
            let successor_id = member
                .successor_id
                .expect("ring snapshot only contains nodes with successors");
            warn!(requester_id = requester_id, "Join request from a node already in the ring.");
            return Ok(vec![SuccessorAssignment {
                node_id: requester_id,
                successor_id,
            }]);
        }

        let predecessor = {
            let mut rng = rand::thread_rng();
            ring.choose(&mut rng)
                .cloned()
                .expect("ring is non-empty here")
        };
        let successor_id = predecessor
            .successor_id
            .expect("ring snapshot only contains nodes with successors");

        self.directory
            .insert_into_ring(predecessor.node_id, successor_id, requester_id)
            .await?;

        info!(
            coordinator_id = self.self_id,
            requester_id = requester_id,
            predecessor_id = predecessor.node_id,
            successor_id = successor_id,
            "Spliced node into the ring.",
        );

        Ok(vec![
            SuccessorAssignment {
                node_id: requester_id,
                successor_id,
            },
            SuccessorAssignment {
                node_id: predecessor.node_id,
                successor_id: requester_id,
            },
        ])
    }

    /// Repairs the ring after a node reported its successor dead.
    ///
    /// The reporter's recorded successor is unlinked and the reporter is
    /// re-pointed at the dead node's own successor.
    pub(crate) async fn handle_successor_loss(
        &self,
        reporter_id: NodeId,
    ) -> Result<Vec<SuccessorAssignment>, NodeError> {
        let ring = self.directory.get_all_nodes_with_successors().await?;

        let reporter = ring
            .iter()
            .find(|node| node.node_id == reporter_id)
            .ok_or(NodeError::UnknownPeer(reporter_id))?;
        let dead_id = reporter
            .successor_id
            .expect("ring snapshot only contains nodes with successors");

        let dead = ring
            .iter()
            .find(|node| node.node_id == dead_id)
            .ok_or(NodeError::UnknownPeer(dead_id))?;
        let successor_id = dead
            .successor_id
            .expect("ring snapshot only contains nodes with successors");

        self.directory
            .remove_from_ring(reporter_id, successor_id, dead_id)
            .await?;

        info!(
            coordinator_id = self.self_id,
            reporter_id = reporter_id,
            dead_id = dead_id,
            successor_id = successor_id,
            "Removed dead node from the ring.",
        );

        Ok(vec![SuccessorAssignment {
            node_id: reporter_id,
            successor_id,
        }])
    }
}

#[cfg(test)]
mod tests {
    use tokenring_directory::test_suite::assert_single_cycle;
    use tokenring_directory::{MemDirectory, VirtualNode};

    use super::*;

    async fn directory_with(ids: &[NodeId]) -> Arc<MemDirectory> {
        let seed: Vec<VirtualNode> = ids
            .iter()
            .map(|id| VirtualNode::new(*id, "127.0.0.1", 9100 + *id as u16, 9200 + *id as u16))
            .collect();

        let directory = Arc::new(MemDirectory::new());
        directory.initialize(&seed).await.unwrap();
        directory
    }

    #[tokio::test]
    async fn test_sequential_joins_form_one_cycle() {
        let directory = directory_with(&[1, 2, 6]).await;
        let role = CoordinatorRole::new(6, directory.clone());

        // 6 pre-seeded as coordinator; joins in order 1, 2, 6 are served the
        // same way regardless of which node asks first.
        directory.update_coordinator(6).await.unwrap();

        let assigned = role.handle_join_request(1).await.unwrap();
        assert_eq!(
            assigned,
            vec![SuccessorAssignment {
                node_id: 1,
                successor_id: 1,
            }],
        );

        role.handle_join_request(2).await.unwrap();
        role.handle_join_request(6).await.unwrap();

        let ring = directory.get_all_nodes_with_successors().await.unwrap();
        assert_single_cycle(&ring, &[1, 2, 6]);
    }

    #[tokio::test]
    async fn test_duplicate_join_is_idempotent() {
        let directory = directory_with(&[1, 2]).await;
        let role = CoordinatorRole::new(1, directory.clone());

        role.handle_join_request(1).await.unwrap();
        role.handle_join_request(2).await.unwrap();
        let ring_before = directory.get_all_nodes_with_successors().await.unwrap();

        // A retried JOIN re-announces the recorded successor without
        // touching the ring.
        let assigned = role.handle_join_request(2).await.unwrap();
        let successor_id = ring_before
            .iter()
            .find(|node| node.node_id == 2)
            .and_then(|node| node.successor_id)
            .unwrap();
        assert_eq!(
            assigned,
            vec![SuccessorAssignment {
                node_id: 2,
                successor_id,
            }],
        );

        let ring_after = directory.get_all_nodes_with_successors().await.unwrap();
        assert_eq!(ring_before, ring_after);
    }

    #[tokio::test]
    async fn test_successor_loss_relinks_around_the_dead_node() {
        let directory = directory_with(&[1, 2, 6]).await;
        let role = CoordinatorRole::new(6, directory.clone());

        // Build the ring 6 -> 1 -> 2 -> 6 deterministically.
        directory.set_node_successor(6, 1).await.unwrap();
        directory.set_node_successor(1, 2).await.unwrap();
        directory.set_node_successor(2, 6).await.unwrap();

        // 1 reports its successor (2) dead.
        let assigned = role.handle_successor_loss(1).await.unwrap();
        assert_eq!(
            assigned,
            vec![SuccessorAssignment {
                node_id: 1,
                successor_id: 6,
            }],
        );

        let ring = directory.get_all_nodes_with_successors().await.unwrap();
        assert_single_cycle(&ring, &[1, 6]);
        assert!(!ring.iter().any(|node| node.node_id == 2));
    }

    #[tokio::test]
    async fn test_two_member_ring_collapses_to_self_loop() {
        let directory = directory_with(&[3, 7]).await;
        let role = CoordinatorRole::new(3, directory.clone());

        directory.set_node_successor(3, 7).await.unwrap();
        directory.set_node_successor(7, 3).await.unwrap();

        role.handle_successor_loss(3).await.unwrap();

        let ring = directory.get_all_nodes_with_successors().await.unwrap();
        assert_single_cycle(&ring, &[3]);
    }

    #[tokio::test]
    async fn test_loss_report_from_unknown_reporter_fails() {
        let directory = directory_with(&[1]).await;
        let role = CoordinatorRole::new(1, directory.clone());

        let err = role.handle_successor_loss(1).await.unwrap_err();
        assert!(matches!(err, NodeError::UnknownPeer(1)));
    }
}
