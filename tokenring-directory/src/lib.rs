mod mem;
pub mod node_list;
pub mod test_suite;
mod translator;

use async_trait::async_trait;
pub use mem::MemDirectory;
use serde::{Deserialize, Serialize};
use thiserror::Error;
pub use translator::{AddressTranslator, NodeEndpoint};

/// A unique ID for a given node in the ring.
pub type NodeId = u32;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("unknown node: {0}")]
    /// The operation referenced a node ID the directory has never seen.
    UnknownNode(NodeId),

    #[error("store error: {0}")]
    /// The backing store failed. The in-progress ring mutation must be
    /// treated as failed; no partial success may be assumed.
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// One ring member's durable record.
///
/// A node with `successor_id == None` is known but not currently in the ring.
pub struct VirtualNode {
    pub node_id: NodeId,
    /// Host name or address the node is reachable on.
    pub address: String,
    /// UDP port for coordination traffic. The ring's TCP listener uses the
    /// same port number.
    pub coordination_port: u16,
    /// TCP port the node serves clients on.
    pub client_port: u16,
    pub successor_id: Option<NodeId>,
    pub is_coordinator: bool,
}

impl VirtualNode {
    pub fn new(
        node_id: NodeId,
        address: impl Into<String>,
        coordination_port: u16,
        client_port: u16,
    ) -> Self {
        Self {
            node_id,
            address: address.into(),
            coordination_port,
            client_port,
            successor_id: None,
            is_coordinator: false,
        }
    }
}

/// Returns the recorded coordinator from a directory snapshot, if any.
pub fn find_coordinator(nodes: &[VirtualNode]) -> Option<&VirtualNode> {
    nodes.iter().find(|node| node.is_coordinator)
}

#[async_trait]
/// The membership directory: a durable mapping of node ID to its address,
/// ports, successor pointer and coordinator flag.
///
/// The set of nodes with a non-null successor forms exactly one directed
/// cycle. The multi-row operations (`insert_into_ring`, `remove_from_ring`,
/// `update_coordinator`) are atomic per call: they must never be observable
/// in a half-applied state. They do *not* provide isolation across a
/// read-then-write sequence; serialising those sequences is the single
/// active coordinator's job.
pub trait Directory: Send + Sync + 'static {
    /// Creates the backing schema if needed and seeds the known population
    /// from `seed` when the store holds no nodes yet.
    async fn initialize(&self, seed: &[VirtualNode]) -> Result<(), DirectoryError>;

    /// The full known population, including nodes not currently in the ring.
    async fn get_all_nodes(&self) -> Result<Vec<VirtualNode>, DirectoryError>;

    /// Current ring members only.
    async fn get_all_nodes_with_successors(&self) -> Result<Vec<VirtualNode>, DirectoryError>;

    /// Number of nodes currently in the ring.
    async fn ring_size(&self) -> Result<usize, DirectoryError>;

    /// Assigns `successor_id` as the successor of `node_id`.
    async fn set_node_successor(
        &self,
        node_id: NodeId,
        successor_id: NodeId,
    ) -> Result<(), DirectoryError>;

    /// Clears the successor of `node_id`, taking it out of the ring.
    async fn remove_node_successor(&self, node_id: NodeId) -> Result<(), DirectoryError>;

    /// Splices `new_node_id` between `predecessor_id` and `successor_id`:
    /// sets succ(new) = successor and succ(predecessor) = new in one atomic
    /// step.
    async fn insert_into_ring(
        &self,
        predecessor_id: NodeId,
        successor_id: NodeId,
        new_node_id: NodeId,
    ) -> Result<(), DirectoryError>;

    /// Unlinks `removed_id` from the ring: sets succ(predecessor) =
    /// successor and clears succ(removed) in one atomic step.
    async fn remove_from_ring(
        &self,
        predecessor_id: NodeId,
        successor_id: NodeId,
        removed_id: NodeId,
    ) -> Result<(), DirectoryError>;

    /// Clears any prior coordinator flag and records `new_coordinator_id` as
    /// the coordinator, atomically.
    async fn update_coordinator(&self, new_coordinator_id: NodeId) -> Result<(), DirectoryError>;

    /// Compare-and-set coordinator claim used at bootstrap: records
    /// `candidate_id` iff no coordinator is currently recorded.
    ///
    /// Returns whether `candidate_id` holds the flag afterwards, so a racing
    /// claimer that lost observes `false` and re-reads the winner.
    async fn try_claim_coordinator(&self, candidate_id: NodeId) -> Result<bool, DirectoryError>;

    /// Ring members with an ID strictly greater than `min_id`.
    async fn nodes_in_ring_with_id_greater_than(
        &self,
        min_id: NodeId,
    ) -> Result<Vec<VirtualNode>, DirectoryError>;
}
