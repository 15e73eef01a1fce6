//! The node state machine.
//!
//! One worker task owns the election handler, the coordinator role and the
//! successor link, and drives everything off four event sources: ring frames
//! from the predecessor task, control-plane messages from the reader task,
//! election timers, and the application's token hand-back queue. Keeping all
//! protocol state on a single task is what serialises coordinator-role ring
//! mutations and keeps every socket with exactly one owner.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokenring_directory::{Directory, NodeId, VirtualNode};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

use crate::coordinator::{CoordinatorRole, SuccessorAssignment};
use crate::election::{Directive, ElectionHandler, ElectionTimer};
use crate::error::NodeError;
use crate::net::control::ControlChannel;
use crate::net::ring::{PredecessorCommand, RingEvent, SuccessorLink};
use crate::statistics::{increment, RingStatistics};
use crate::wire::{ElectionHeader, Message, Payload};
use crate::NodeConfig;

/// The content-free mutual-exclusion credential. At most one instance
/// logically exists per ring; it is only ever moved, never cloned.
pub(crate) struct Token;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Lifecycle of a ring node.
pub enum NodeState {
    Bootstrapping,
    Joining,
    Active,
    /// The coordinator is believed lost and an election is in flight.
    Electing,
    Shutdown,
}

#[derive(Debug)]
pub(crate) enum Event {
    Control(Message),
    Timer(ElectionTimer),
}

pub(crate) struct NodeWorker {
    pub(crate) config: NodeConfig,
    pub(crate) directory: Arc<dyn Directory>,
    pub(crate) control: ControlChannel,
    pub(crate) successor: SuccessorLink,
    pub(crate) predecessor_commands: flume::Sender<PredecessorCommand>,
    pub(crate) ring_events: flume::Receiver<RingEvent>,
    pub(crate) events: flume::Receiver<Event>,
    pub(crate) events_tx: flume::Sender<Event>,
    pub(crate) token_usable: flume::Sender<Token>,
    pub(crate) token_forwardable: flume::Receiver<Token>,
    pub(crate) state_tx: watch::Sender<NodeState>,
    pub(crate) shutdown: watch::Receiver<bool>,
    pub(crate) statistics: RingStatistics,
    pub(crate) election: ElectionHandler,
    pub(crate) role: Option<CoordinatorRole>,
    pub(crate) coordinator_id: Option<NodeId>,
}

impl NodeWorker {
    /// Joins the ring through the coordinator. Called once before the main
    /// loop takes over.
    pub(crate) async fn join_ring(&mut self) -> Result<(), NodeError> {
        self.state_tx.send_replace(NodeState::Joining);
        self.request_successor(true).await
    }

    pub(crate) async fn run(mut self) {
        let mut keepalive = tokio::time::interval(self.config.keepalive_interval);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = self.events.recv_async() => match event {
                    Ok(event) => self.handle_event(event).await,
                    Err(_closed) => break,
                },
                ring_event = self.ring_events.recv_async() => match ring_event {
                    Ok(event) => self.handle_ring_event(event).await,
                    Err(_closed) => break,
                },
                token = self.token_forwardable.recv_async() => match token {
                    Ok(token) => self.forward_token(token).await,
                    Err(_closed) => break,
                },
                _ = keepalive.tick() => self.send_keepalive().await,
                _ = self.shutdown.changed() => break,
            }
        }

        self.state_tx.send_replace(NodeState::Shutdown);
        debug!("Node worker stopped.");
    }

    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::Control(message) => match message.payload {
                Payload::Successor { successor_id } => {
                    // Unsolicited assignment: the coordinator spliced a new
                    // node in behind us.
                    if let Err(error) = self.apply_successor(successor_id).await {
                        error!(error = %error, "Failed to apply successor assignment.");
                    }
                },
                Payload::Election(header) => {
                    self.handle_election_header(message.src_id, header, true).await;
                },
                _ => self.handle_control_basic(message).await,
            },
            Event::Timer(timer) => {
                let directives = self.election.handle_timer(timer);
                self.execute_directives(directives).await;
                self.observe_election();
            },
        }
    }

    async fn handle_ring_event(&mut self, event: RingEvent) {
        match event {
            RingEvent::Frame(message) => match message.payload {
                Payload::Token => {
                    increment(&self.statistics.tokens_received);
                    debug!(src_id = message.src_id, "Received token.");

                    // No ACK for a self-delivered token: in a closed loop
                    // nobody ever reads the acknowledgement stream.
                    if message.src_id != self.config.node_id {
                        let command = PredecessorCommand::SendTokenAck;
                        if self.predecessor_commands.send_async(command).await.is_err() {
                            warn!("Predecessor task is gone; token left unacknowledged.");
                        }
                    }

                    // Capacity-1 hand-off: blocks until the application has
                    // drained the previous slot, so the token can neither
                    // duplicate nor vanish between tasks.
                    if self.token_usable.send_async(Token).await.is_err() {
                        warn!("Application loop is gone; dropping token.");
                    }
                },
                Payload::Election(header) => {
                    self.handle_election_header(message.src_id, header, true).await;
                },
                Payload::TokenAck => {
                    debug!("Stray token ACK outside an ACK wait.");
                },
                other => {
                    debug!(payload = ?other, "Ignoring unexpected ring frame.");
                },
            },
            RingEvent::PredecessorConnected(remote) => {
                debug!(remote = %remote, "Predecessor attached.");
            },
            RingEvent::PredecessorLost => {
                // The accept task is already re-accepting; the ring heals
                // from this side without any directory mutation.
                info!("Predecessor link lost; awaiting replacement.");
            },
        }
    }

    /// Control traffic that is safe to service anywhere, including while a
    /// successor wait is in progress (no recovery is ever triggered here).
    async fn handle_control_basic(&mut self, message: Message) {
        match message.payload {
            Payload::Join => self.serve_ring_request(message.src_id, true).await,
            Payload::SuccessorRequest => self.serve_ring_request(message.src_id, false).await,
            Payload::Election(header) => {
                self.handle_election_header(message.src_id, header, false).await;
            },
            Payload::Keepalive => {
                trace!(src_id = message.src_id, "Keepalive received.");
            },
            other => {
                debug!(payload = ?other, "Ignoring unexpected control message.");
            },
        }
    }

    async fn handle_election_header(
        &mut self,
        src_id: NodeId,
        header: ElectionHeader,
        allow_recovery: bool,
    ) {
        let directives = self.election.handle_header(src_id, header);
        if allow_recovery {
            self.execute_directives(directives).await;
        } else {
            self.execute_directives_basic(directives).await;
        }
        self.observe_election();
    }

    /// Dispatches a JOIN or SUCCESSOR_REQUEST to the coordinator role.
    async fn serve_ring_request(&mut self, requester_id: NodeId, joining: bool) {
        let result = match self.role.as_ref() {
            None => {
                debug!(requester_id = requester_id, "Ignoring ring request: not the coordinator.");
                return;
            },
            Some(role) => {
                if joining {
                    role.handle_join_request(requester_id).await
                } else {
                    role.handle_successor_loss(requester_id).await
                }
            },
        };

        match result {
            Ok(assignments) => {
                if let Err(error) = self.dispatch_assignments(assignments).await {
                    error!(error = %error, "Failed to dispatch successor assignments.");
                }
            },
            Err(error) => {
                error!(
                    requester_id = requester_id,
                    error = %error,
                    "Failed to serve ring request.",
                );
            },
        }
    }

    /// Applies a local assignment or announces a remote one.
    async fn dispatch_assignments(
        &mut self,
        assignments: Vec<SuccessorAssignment>,
    ) -> Result<(), NodeError> {
        for assignment in assignments {
            if assignment.node_id == self.config.node_id {
                self.apply_successor(assignment.successor_id).await?;
            } else {
                let message = Message::new(
                    self.config.node_id,
                    Payload::Successor {
                        successor_id: assignment.successor_id,
                    },
                );
                if let Err(error) = self.control.send(&message, assignment.node_id).await {
                    // The peer retries its request; the next round resends.
                    warn!(
                        dest_id = assignment.node_id,
                        error = %error,
                        "Failed to announce successor assignment.",
                    );
                }
            }
        }
        Ok(())
    }

    async fn apply_successor(&mut self, successor_id: NodeId) -> Result<(), NodeError> {
        info!(successor_id = successor_id, "Assigned new successor.");
        self.successor.connect(successor_id).await
    }

    /// Requests a successor from the coordinator, locally when this node
    /// holds the role. Bounded retries with jittered timeouts.
    async fn request_successor(&mut self, joining: bool) -> Result<(), NodeError> {
        if let Some(role) = self.role.as_ref() {
            let assignments = if joining {
                role.handle_join_request(self.config.node_id).await?
            } else {
                role.handle_successor_loss(self.config.node_id).await?
            };
            return self.dispatch_assignments(assignments).await;
        }

        let payload = if joining {
            Payload::Join
        } else {
            Payload::SuccessorRequest
        };

        let tries = self.config.successor_retries;
        for attempt in 1..=tries {
            let coordinator_id = self.coordinator_id.ok_or(NodeError::NoCoordinator)?;
            let request = Message::new(self.config.node_id, payload.clone());
            info!(
                coordinator_id = coordinator_id,
                joining = joining,
                "Requesting successor from coordinator.",
            );

            if let Err(error) = self.control.send(&request, coordinator_id).await {
                warn!(error = %error, "Failed to send successor request.");
            }

            match self.await_successor(jittered(self.config.control_timeout)).await {
                Some(successor_id) => return self.apply_successor(successor_id).await,
                None => warn!(attempt = attempt, "No successor assignment arrived; retrying."),
            }
        }

        Err(NodeError::SuccessorTimeout { tries })
    }

    /// Waits for a SUCCESSOR assignment, servicing unrelated control
    /// traffic inline while it waits.
    async fn await_successor(&mut self, timeout: Duration) -> Option<NodeId> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let event = match tokio::time::timeout_at(deadline, self.events.recv_async()).await {
                Err(_elapsed) => return None,
                Ok(Err(_closed)) => return None,
                Ok(Ok(event)) => event,
            };

            match event {
                Event::Control(message) => {
                    if let Payload::Successor { successor_id } = message.payload {
                        return Some(successor_id);
                    }
                    self.handle_control_basic(message).await;
                },
                Event::Timer(timer) => {
                    let directives = self.election.handle_timer(timer);
                    self.execute_directives_basic(directives).await;
                    self.observe_election();
                },
            }
        }
    }

    /// Forwards the token, repairing the ring when the successor is gone.
    ///
    /// On persistent failure the token is handed back to the application,
    /// so the forward is retried after another hold rather than looping
    /// here unboundedly.
    async fn forward_token(&mut self, token: Token) {
        let tries = self.config.successor_retries;
        for attempt in 1..=tries {
            if self.successor.forward_token(jittered(self.config.ack_timeout)).await {
                increment(&self.statistics.tokens_forwarded);
                return;
            }

            warn!(attempt = attempt, "Disconnected from successor.");
            match self.recover_successor().await {
                Ok(()) => info!("Retrying token send."),
                Err(error) => {
                    error!(error = %error, "Successor recovery failed.");
                    tokio::time::sleep(jittered(Duration::from_millis(250))).await;
                },
            }
        }

        error!(tries = tries, "Token forward failed; holding it for another round.");
        if self.token_usable.send_async(token).await.is_err() {
            warn!("Application loop is gone; dropping token.");
        }
    }

    /// Replaces a lost successor.
    ///
    /// When the lost successor is the coordinator itself there is nobody to
    /// ask, so this node repairs the directory as a provisional proxy and an
    /// election follows as soon as the ring link is back.
    async fn recover_successor(&mut self) -> Result<(), NodeError> {
        increment(&self.statistics.successor_repairs);

        let lost = self.successor.successor_id();
        let coordinator_lost =
            lost.is_some() && lost == self.coordinator_id && lost != Some(self.config.node_id);

        if coordinator_lost {
            warn!(
                dead_id = ?lost,
                "Lost successor held the coordinator role; repairing as provisional proxy.",
            );
            self.repair_as_proxy().await?;
            self.begin_election().await;
            return Ok(());
        }

        match Box::pin(self.request_successor(false)).await {
            Ok(()) => Ok(()),
            Err(NodeError::SuccessorTimeout { tries }) => {
                warn!(
                    tries = tries,
                    "Coordinator unresponsive during repair; acting as provisional proxy.",
                );
                self.repair_as_proxy().await?;
                self.begin_election().await;
                Ok(())
            },
            Err(NodeError::NoCoordinator) => {
                warn!("No coordinator recorded; repairing as provisional proxy.");
                self.repair_as_proxy().await?;
                self.begin_election().await;
                Ok(())
            },
            Err(other) => Err(other),
        }
    }

    /// Performs the coordinator's successor-loss repair on the directory
    /// without holding the role.
    async fn repair_as_proxy(&mut self) -> Result<(), NodeError> {
        let proxy = CoordinatorRole::new(self.config.node_id, self.directory.clone());
        let assignments = proxy.handle_successor_loss(self.config.node_id).await?;
        self.dispatch_assignments(assignments).await
    }

    async fn begin_election(&mut self) {
        increment(&self.statistics.elections_started);
        if *self.state_tx.borrow() == NodeState::Active {
            self.state_tx.send_replace(NodeState::Electing);
        }

        let directives = self.election.start_election();
        self.execute_directives_basic(directives).await;
        self.observe_election();
    }

    /// Executes directives; a failed ring forward triggers one recovery
    /// round before the message is given up on.
    async fn execute_directives(&mut self, directives: Vec<Directive>) {
        for directive in directives {
            match directive {
                Directive::ForwardToSuccessor(header) => {
                    let message =
                        Message::new(self.config.node_id, Payload::Election(header.clone()));
                    if self.successor.send(&message).await.is_ok() {
                        continue;
                    }

                    warn!("Successor link failed while forwarding election message.");
                    if let Err(error) = self.recover_successor().await {
                        error!(error = %error, "Recovery failed; election message dropped.");
                        continue;
                    }
                    if let Err(error) = self.successor.send(&message).await {
                        warn!(error = %error, "Election message dropped after repair.");
                    }
                },
                other => self.execute_directive_basic(other).await,
            }
        }
    }

    async fn execute_directives_basic(&mut self, directives: Vec<Directive>) {
        for directive in directives {
            self.execute_directive_basic(directive).await;
        }
    }

    async fn execute_directive_basic(&mut self, directive: Directive) {
        match directive {
            Directive::ForwardToSuccessor(header) => {
                let message = Message::new(self.config.node_id, Payload::Election(header));
                if let Err(error) = self.successor.send(&message).await {
                    warn!(error = %error, "Failed to forward election message.");
                }
            },
            Directive::Reply { dest_id, header } => {
                let message = Message::new(self.config.node_id, Payload::Election(header));
                if let Err(error) = self.control.send(&message, dest_id).await {
                    warn!(dest_id = dest_id, error = %error, "Failed to send election reply.");
                }
            },
            Directive::BroadcastToHigherIds(header) => {
                match self
                    .directory
                    .nodes_in_ring_with_id_greater_than(self.config.node_id)
                    .await
                {
                    Ok(nodes) => self.send_election_to_all(nodes, header).await,
                    Err(error) => {
                        error!(error = %error, "Directory failed; cannot target higher IDs.");
                    },
                }
            },
            Directive::BroadcastToRing(header) => {
                match self.directory.get_all_nodes_with_successors().await {
                    Ok(nodes) => self.send_election_to_all(nodes, header).await,
                    Err(error) => {
                        error!(error = %error, "Directory failed; cannot broadcast to ring.");
                    },
                }
            },
            Directive::StartTimer(timer) => self.arm_timer(timer),
            Directive::RecordCoordinator(winner) => {
                if let Err(error) = self.directory.update_coordinator(winner).await {
                    // Peers still learn the winner from the announcement;
                    // the directory flag catches up on the next election.
                    error!(error = %error, "Failed to record elected coordinator.");
                }
                self.adopt_coordinator(winner);
            },
        }
    }

    async fn send_election_to_all(&self, nodes: Vec<VirtualNode>, header: ElectionHeader) {
        for node in nodes {
            if node.node_id == self.config.node_id {
                continue;
            }

            let message = Message::new(self.config.node_id, Payload::Election(header.clone()));
            if let Err(error) = self.control.send(&message, node.node_id).await {
                warn!(dest_id = node.node_id, error = %error, "Failed to send election message.");
            }
        }
    }

    fn arm_timer(&self, timer: ElectionTimer) {
        let delay = match timer {
            ElectionTimer::AssumeVictory => self.config.victory_timeout,
            ElectionTimer::AwaitCoordinator => self.config.coordinator_wait,
        };

        let events = self.events_tx.clone();
        let mut shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    let _ = events.send_async(Event::Timer(timer)).await;
                },
                _ = shutdown.changed() => {},
            }
        });
    }

    /// Picks up a freshly agreed winner once the handler settles.
    fn observe_election(&mut self) {
        if !self.election.concluded() {
            return;
        }
        if let Some(winner) = self.election.result() {
            self.adopt_coordinator(winner);
        }
    }

    fn adopt_coordinator(&mut self, winner: NodeId) {
        if self.coordinator_id != Some(winner) {
            info!(coordinator_id = winner, "Adopting new coordinator.");
            increment(&self.statistics.elections_concluded);
            self.coordinator_id = Some(winner);
        }

        if winner == self.config.node_id {
            if self.role.is_none() {
                info!("Assuming the coordinator role.");
                self.role = Some(CoordinatorRole::new(
                    self.config.node_id,
                    self.directory.clone(),
                ));
            }
        } else if self.role.take().is_some() {
            info!("Standing down from the coordinator role.");
        }

        if *self.state_tx.borrow() == NodeState::Electing {
            self.state_tx.send_replace(NodeState::Active);
        }
    }

    async fn send_keepalive(&self) {
        let Some(coordinator_id) = self.coordinator_id else {
            return;
        };
        if coordinator_id == self.config.node_id {
            return;
        }

        let message = Message::new(self.config.node_id, Payload::Keepalive);
        if let Err(error) = self.control.send(&message, coordinator_id).await {
            debug!(error = %error, "Keepalive send failed.");
        }
    }
}

/// Forwards well-formed control datagrams into the worker's event queue.
pub(crate) fn spawn_control_reader(
    control: ControlChannel,
    events: flume::Sender<Event>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                message = control.recv(Duration::from_millis(500)) => {
                    if let Some(message) = message {
                        if events.send_async(Event::Control(message)).await.is_err() {
                            return;
                        }
                    }
                },
                _ = shutdown.changed() => return,
            }
        }
    })
}

/// The application loop: wait for the token, perform the guarded action for
/// the configured hold duration, then hand the token back for forwarding.
pub(crate) fn spawn_application_task(
    token_usable: flume::Receiver<Token>,
    token_forwardable: flume::Sender<Token>,
    holding: watch::Sender<bool>,
    hold: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let token = tokio::select! {
                token = token_usable.recv_async() => match token {
                    Ok(token) => token,
                    Err(_closed) => return,
                },
                _ = shutdown.changed() => return,
            };

            debug!("Holding token.");
            holding.send_replace(true);
            tokio::select! {
                _ = tokio::time::sleep(hold) => {},
                _ = shutdown.changed() => {
                    holding.send_replace(false);
                    return;
                },
            }
            holding.send_replace(false);

            if token_forwardable.send_async(token).await.is_err() {
                return;
            }
        }
    })
}

/// Adds up to a third of the base as random jitter so retries across nodes
/// do not synchronise.
pub(crate) fn jittered(base: Duration) -> Duration {
    let third = (base.as_millis() as u64) / 3;
    let jitter = rand::thread_rng().gen_range(0..=third.max(1));
    base + Duration::from_millis(jitter)
}
