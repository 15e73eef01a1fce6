mod coordinator;
mod election;
mod error;
mod net;
mod node;
mod statistics;
pub mod wire;

use std::sync::Arc;
use std::time::Duration;

pub use error::NodeError;
use net::control::ControlChannel;
use net::ring::SuccessorLink;
pub use node::NodeState;
use node::{NodeWorker, Token};
pub use statistics::RingStatistics;
use tokenring_directory::find_coordinator;
pub use tokenring_directory::{
    AddressTranslator,
    Directory,
    DirectoryError,
    MemDirectory,
    NodeId,
    VirtualNode,
};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
pub use wire::ElectionMethod;

use crate::coordinator::CoordinatorRole;
use crate::election::ElectionHandler;

#[derive(Debug, Clone)]
/// Configuration for a single ring node. Every timeout and retry bound the
/// node uses lives here; there is no process-wide tuning state.
pub struct NodeConfig {
    /// This node's unique ID.
    pub node_id: NodeId,
    /// Which election algorithm the node runs.
    pub election_method: ElectionMethod,
    /// Base wait for control-plane replies; jittered per attempt.
    pub control_timeout: Duration,
    /// Base wait for a TOKEN_ACK after forwarding; jittered per attempt.
    pub ack_timeout: Duration,
    /// Attempts before a join or successor request is given up on.
    pub successor_retries: u32,
    /// How long the application holds the token per round.
    pub token_hold: Duration,
    /// Bully T1: how long a starter waits in silence before assuming victory.
    pub victory_timeout: Duration,
    /// Bully T2: how long to wait for the announcement after an OK.
    pub coordinator_wait: Duration,
    /// Cadence of the liveness beacon towards the coordinator.
    pub keepalive_interval: Duration,
}

impl NodeConfig {
    pub fn new(node_id: NodeId, election_method: ElectionMethod) -> Self {
        Self {
            node_id,
            election_method,
            control_timeout: Duration::from_secs(3),
            ack_timeout: Duration::from_secs(3),
            successor_retries: 3,
            token_hold: Duration::from_secs(3),
            victory_timeout: Duration::from_secs(3),
            coordinator_wait: Duration::from_secs(5),
            keepalive_interval: Duration::from_secs(5),
        }
    }

    /// Set how long the application holds the token per round.
    pub fn with_token_hold(mut self, hold: Duration) -> Self {
        self.token_hold = hold;
        self
    }

    /// Set the base timeout used for control-plane waits and token ACKs.
    pub fn with_base_timeout(mut self, timeout: Duration) -> Self {
        self.control_timeout = timeout;
        self.ack_timeout = timeout;
        self
    }
}

/// Build a ring node using provided settings.
pub struct RingNodeBuilder {
    config: NodeConfig,
    directory: Arc<dyn Directory>,
    seed_nodes: Vec<VirtualNode>,
}

impl RingNodeBuilder {
    /// Create a new node builder over the given membership directory.
    pub fn new(config: NodeConfig, directory: Arc<dyn Directory>) -> Self {
        Self {
            config,
            directory,
            seed_nodes: Vec::new(),
        }
    }

    /// Seed rows (typically from the node-list file) inserted into the
    /// directory when it is still empty. The node's own row must be present
    /// either here or in the directory already.
    pub fn with_seed_nodes(mut self, seed_nodes: Vec<VirtualNode>) -> Self {
        self.seed_nodes = seed_nodes;
        self
    }

    /// Starts the node: binds both transports, resolves (or claims) the
    /// coordinator, joins the ring and spawns the runtime tasks.
    ///
    /// The `node_id` **must be unique** across the ring; the directory's
    /// ring topology breaks down if two live nodes share one ID.
    pub async fn connect(self) -> Result<RingNode, NodeError> {
        let node_id = self.config.node_id;

        self.directory.initialize(&self.seed_nodes).await?;

        let snapshot = self.directory.get_all_nodes().await?;
        let translator = Arc::new(AddressTranslator::from_snapshot(&snapshot));
        if translator.endpoint(node_id).is_none() {
            return Err(NodeError::UnknownPeer(node_id));
        }

        // Bind both transports up front; failing to bind is the one fatal
        // startup error.
        let control = ControlChannel::bind(node_id, translator.clone()).await?;
        let ring_listener = TcpListener::bind(translator.coordination_addr(node_id)?).await?;

        // Resolve the coordinator, claiming the flag when nobody holds it.
        // The compare-and-set settles concurrent bootstraps: exactly one
        // claimer wins and the losers read the winner back.
        let mut claimed = false;
        let coordinator_id = match find_coordinator(&snapshot) {
            Some(coordinator) => Some(coordinator.node_id),
            None => {
                if self.directory.try_claim_coordinator(node_id).await? {
                    info!(node_id = node_id, "Claimed the coordinator role at bootstrap.");
                    claimed = true;
                    Some(node_id)
                } else {
                    let snapshot = self.directory.get_all_nodes().await?;
                    find_coordinator(&snapshot).map(|coordinator| coordinator.node_id)
                }
            },
        };

        let (events_tx, events_rx) = flume::bounded(64);
        let (ring_events_tx, ring_events_rx) = flume::bounded(64);
        let (predecessor_tx, predecessor_rx) = flume::bounded(4);
        // Both token hand-offs are capacity 1 and block the producer: the
        // token cannot duplicate or vanish between tasks.
        let (token_usable_tx, token_usable_rx) = flume::bounded::<Token>(1);
        let (token_forwardable_tx, token_forwardable_rx) = flume::bounded::<Token>(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (holding_tx, holding_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(NodeState::Bootstrapping);

        let statistics = RingStatistics::default();

        let mut handles: Vec<JoinHandle<()>> = Vec::new();
        handles.push(net::ring::spawn_predecessor_task(
            node_id,
            ring_listener,
            ring_events_tx,
            predecessor_rx,
            shutdown_rx.clone(),
        ));
        handles.push(node::spawn_control_reader(
            control.clone(),
            events_tx.clone(),
            shutdown_rx.clone(),
        ));
        handles.push(node::spawn_application_task(
            token_usable_rx,
            token_forwardable_tx,
            holding_tx,
            self.config.token_hold,
            shutdown_rx.clone(),
        ));

        let role = if coordinator_id == Some(node_id) {
            info!(node_id = node_id, "Running as coordinator.");
            Some(CoordinatorRole::new(node_id, self.directory.clone()))
        } else {
            None
        };

        let mut worker = NodeWorker {
            config: self.config.clone(),
            directory: self.directory.clone(),
            control,
            successor: SuccessorLink::new(node_id, translator),
            predecessor_commands: predecessor_tx,
            ring_events: ring_events_rx,
            events: events_rx,
            events_tx,
            token_usable: token_usable_tx.clone(),
            token_forwardable: token_forwardable_rx,
            state_tx,
            shutdown: shutdown_rx,
            statistics: statistics.clone(),
            election: ElectionHandler::new(self.config.election_method, node_id),
            role,
            coordinator_id,
        };

        // Join before handing control to the worker loop, so a returned
        // handle is always a ring member.
        worker.join_ring().await?;
        worker.state_tx.send_replace(NodeState::Active);

        // The bootstrap coordinator originates the token.
        if claimed && token_usable_tx.try_send(Token).is_err() {
            warn!("Token slot unexpectedly occupied at bootstrap.");
        }

        handles.push(tokio::spawn(worker.run()));

        info!(
            node_id = node_id,
            coordinator_id = ?coordinator_id,
            election_method = ?self.config.election_method,
            "Ring node connected.",
        );

        Ok(RingNode {
            node_id,
            directory: self.directory,
            statistics,
            shutdown: shutdown_tx,
            handles,
            holding: holding_rx,
            state: state_rx,
        })
    }
}

/// A live ring node. Dropping the handle does not stop the node; call
/// [RingNode::shutdown] for a clean exit.
pub struct RingNode {
    node_id: NodeId,
    directory: Arc<dyn Directory>,
    statistics: RingStatistics,
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
    holding: watch::Receiver<bool>,
    state: watch::Receiver<NodeState>,
}

impl RingNode {
    #[inline]
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    #[inline]
    /// Gets the live ring statistics.
    pub fn statistics(&self) -> RingStatistics {
        self.statistics.clone()
    }

    #[inline]
    /// The node's current lifecycle state.
    pub fn state(&self) -> NodeState {
        *self.state.borrow()
    }

    #[inline]
    /// Whether the application loop currently holds the token.
    pub fn is_holding_token(&self) -> bool {
        *self.holding.borrow()
    }

    #[inline]
    /// A watcher flipping to `true` for the duration of each token hold.
    pub fn token_watcher(&self) -> watch::Receiver<bool> {
        self.holding.clone()
    }

    #[inline]
    /// The membership directory this node runs against.
    pub fn directory(&self) -> Arc<dyn Directory> {
        self.directory.clone()
    }

    /// Waits until the directory's ring reaches the given size.
    pub async fn wait_for_ring_size(
        &self,
        size: usize,
        timeout_after: Duration,
    ) -> Result<(), anyhow::Error> {
        let directory = self.directory.clone();
        tokio::time::timeout(timeout_after, async move {
            loop {
                match directory.ring_size().await {
                    Ok(current) if current == size => return,
                    Ok(_) => {},
                    Err(error) => warn!(error = %error, "Directory poll failed."),
                }
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
        })
        .await?;
        Ok(())
    }

    /// Waits until this node has received the token at least `count` times.
    pub async fn wait_for_tokens(
        &self,
        count: u64,
        timeout_after: Duration,
    ) -> Result<(), anyhow::Error> {
        let statistics = self.statistics.clone();
        tokio::time::timeout(timeout_after, async move {
            while statistics.tokens_received() < count {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await?;
        Ok(())
    }

    /// Stops every task and closes all sockets and links.
    ///
    /// The coordinator claim is not touched: peers detect the departure
    /// through their own timeouts, exactly as for a crash.
    pub async fn shutdown(self) {
        info!(node_id = self.node_id, "Shutting down ring node.");
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}
