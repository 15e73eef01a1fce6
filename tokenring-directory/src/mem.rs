use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{Directory, DirectoryError, NodeId, VirtualNode};

#[derive(Debug, Clone, Default)]
/// An in-memory [Directory] implementation.
///
/// This is the reference semantics for the trait and the backend used by the
/// node tests: several in-process nodes share one `MemDirectory` the way
/// separate processes would share one database.
pub struct MemDirectory {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    nodes: BTreeMap<NodeId, StoredNode>,
    coordinator_id: Option<NodeId>,
}

#[derive(Debug, Clone)]
struct StoredNode {
    address: String,
    coordination_port: u16,
    client_port: u16,
    successor_id: Option<NodeId>,
}

impl Inner {
    fn row(&self, node_id: NodeId, stored: &StoredNode) -> VirtualNode {
        VirtualNode {
            node_id,
            address: stored.address.clone(),
            coordination_port: stored.coordination_port,
            client_port: stored.client_port,
            successor_id: stored.successor_id,
            is_coordinator: self.coordinator_id == Some(node_id),
        }
    }

    fn set_successor(
        &mut self,
        node_id: NodeId,
        successor_id: Option<NodeId>,
    ) -> Result<(), DirectoryError> {
        if let Some(id) = successor_id {
            if !self.nodes.contains_key(&id) {
                return Err(DirectoryError::UnknownNode(id));
            }
        }

        let stored = self
            .nodes
            .get_mut(&node_id)
            .ok_or(DirectoryError::UnknownNode(node_id))?;
        stored.successor_id = successor_id;
        Ok(())
    }
}

impl MemDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Directory for MemDirectory {
    async fn initialize(&self, seed: &[VirtualNode]) -> Result<(), DirectoryError> {
        let mut inner = self.inner.lock();

        if !inner.nodes.is_empty() {
            return Ok(());
        }

        for node in seed {
            inner.nodes.insert(
                node.node_id,
                StoredNode {
                    address: node.address.clone(),
                    coordination_port: node.coordination_port,
                    client_port: node.client_port,
                    successor_id: None,
                },
            );
        }

        Ok(())
    }

    async fn get_all_nodes(&self) -> Result<Vec<VirtualNode>, DirectoryError> {
        let inner = self.inner.lock();
        Ok(inner
            .nodes
            .iter()
            .map(|(id, stored)| inner.row(*id, stored))
            .collect())
    }

    async fn get_all_nodes_with_successors(&self) -> Result<Vec<VirtualNode>, DirectoryError> {
        let inner = self.inner.lock();
        Ok(inner
            .nodes
            .iter()
            .filter(|(_, stored)| stored.successor_id.is_some())
            .map(|(id, stored)| inner.row(*id, stored))
            .collect())
    }

    async fn ring_size(&self) -> Result<usize, DirectoryError> {
        let inner = self.inner.lock();
        Ok(inner
            .nodes
            .values()
            .filter(|stored| stored.successor_id.is_some())
            .count())
    }

    async fn set_node_successor(
        &self,
        node_id: NodeId,
        successor_id: NodeId,
    ) -> Result<(), DirectoryError> {
        self.inner.lock().set_successor(node_id, Some(successor_id))
    }

    async fn remove_node_successor(&self, node_id: NodeId) -> Result<(), DirectoryError> {
        self.inner.lock().set_successor(node_id, None)
    }

    async fn insert_into_ring(
        &self,
        predecessor_id: NodeId,
        successor_id: NodeId,
        new_node_id: NodeId,
    ) -> Result<(), DirectoryError> {
        let mut inner = self.inner.lock();

        // Validate every row first so the mutation applies fully or not at
        // all under the single lock.
        for id in [predecessor_id, successor_id, new_node_id] {
            if !inner.nodes.contains_key(&id) {
                return Err(DirectoryError::UnknownNode(id));
            }
        }

        inner.set_successor(new_node_id, Some(successor_id))?;
        inner.set_successor(predecessor_id, Some(new_node_id))?;
        Ok(())
    }

    async fn remove_from_ring(
        &self,
        predecessor_id: NodeId,
        successor_id: NodeId,
        removed_id: NodeId,
    ) -> Result<(), DirectoryError> {
        let mut inner = self.inner.lock();

        for id in [predecessor_id, successor_id, removed_id] {
            if !inner.nodes.contains_key(&id) {
                return Err(DirectoryError::UnknownNode(id));
            }
        }

        inner.set_successor(predecessor_id, Some(successor_id))?;
        inner.set_successor(removed_id, None)?;
        Ok(())
    }

    async fn update_coordinator(&self, new_coordinator_id: NodeId) -> Result<(), DirectoryError> {
        let mut inner = self.inner.lock();

        if !inner.nodes.contains_key(&new_coordinator_id) {
            return Err(DirectoryError::UnknownNode(new_coordinator_id));
        }

        inner.coordinator_id = Some(new_coordinator_id);
        Ok(())
    }

    async fn try_claim_coordinator(&self, candidate_id: NodeId) -> Result<bool, DirectoryError> {
        let mut inner = self.inner.lock();

        if !inner.nodes.contains_key(&candidate_id) {
            return Err(DirectoryError::UnknownNode(candidate_id));
        }

        if inner.coordinator_id.is_none() {
            inner.coordinator_id = Some(candidate_id);
        }

        Ok(inner.coordinator_id == Some(candidate_id))
    }

    async fn nodes_in_ring_with_id_greater_than(
        &self,
        min_id: NodeId,
    ) -> Result<Vec<VirtualNode>, DirectoryError> {
        let inner = self.inner.lock();
        Ok(inner
            .nodes
            .iter()
            .filter(|(id, stored)| **id > min_id && stored.successor_id.is_some())
            .map(|(id, stored)| inner.row(*id, stored))
            .collect())
    }
}
