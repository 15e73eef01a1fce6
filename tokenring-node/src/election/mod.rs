//! Coordinator election.
//!
//! Three interchangeable algorithms behind one contract. All of them settle
//! on the maximum participating node ID; they differ in messaging pattern
//! and transport. Handlers are pure transition cores: every step returns
//! [Directive]s which the node's state-machine task executes against the
//! ring link, the control channel and the directory. That keeps each socket
//! with its single owning task and makes the protocols testable without I/O.

mod bully;
mod chang_roberts;
mod ring_based;

pub(crate) use bully::BullyElection;
pub(crate) use chang_roberts::ChangRobertsElection;
pub(crate) use ring_based::RingBasedElection;
use tokenring_directory::NodeId;
use tracing::warn;

use crate::wire::{ElectionHeader, ElectionMethod};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Protocol timers used by the Bully method.
pub(crate) enum ElectionTimer {
    /// No OK and no COORDINATOR arrived in time; the starter may assume
    /// victory.
    AssumeVictory,
    /// An OK arrived; wait for the higher-ID node's COORDINATOR
    /// announcement before retrying.
    AwaitCoordinator,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// An action requested by an election handler, executed by the owning task.
pub(crate) enum Directive {
    /// Forward over the ring link to the successor.
    ForwardToSuccessor(ElectionHeader),
    /// Send to one node over the control plane.
    Reply {
        dest_id: NodeId,
        header: ElectionHeader,
    },
    /// Send to every ring member with a strictly greater ID.
    BroadcastToHigherIds(ElectionHeader),
    /// Send to every ring member.
    BroadcastToRing(ElectionHeader),
    /// Arm a protocol timer.
    StartTimer(ElectionTimer),
    /// This node computed the winner: record it in the directory before the
    /// announcement goes out.
    RecordCoordinator(NodeId),
}

/// The configured election algorithm for one node.
///
/// A tagged enum rather than trait objects: the variant is chosen once from
/// configuration and never changes at runtime.
pub(crate) enum ElectionHandler {
    RingBased(RingBasedElection),
    ChangRoberts(ChangRobertsElection),
    Bully(BullyElection),
}

impl ElectionHandler {
    pub(crate) fn new(method: ElectionMethod, self_id: NodeId) -> Self {
        match method {
            ElectionMethod::RingBased => Self::RingBased(RingBasedElection::new(self_id)),
            ElectionMethod::ChangRoberts => Self::ChangRoberts(ChangRobertsElection::new(self_id)),
            ElectionMethod::Bully => Self::Bully(BullyElection::new(self_id)),
        }
    }

    pub(crate) fn method(&self) -> ElectionMethod {
        match self {
            Self::RingBased(_) => ElectionMethod::RingBased,
            Self::ChangRoberts(_) => ElectionMethod::ChangRoberts,
            Self::Bully(_) => ElectionMethod::Bully,
        }
    }

    pub(crate) fn start_election(&mut self) -> Vec<Directive> {
        match self {
            Self::RingBased(handler) => handler.start_election(),
            Self::ChangRoberts(handler) => handler.start_election(),
            Self::Bully(handler) => handler.start_election(),
        }
    }

    pub(crate) fn handle_header(&mut self, src_id: NodeId, header: ElectionHeader) -> Vec<Directive> {
        if header.method != self.method() {
            warn!(
                src_id = src_id,
                method = ?header.method,
                configured = ?self.method(),
                "Dropping election message for a different method.",
            );
            return Vec::new();
        }

        match self {
            Self::RingBased(handler) => handler.handle_body(header.body),
            Self::ChangRoberts(handler) => handler.handle_body(header.body),
            Self::Bully(handler) => handler.handle_body(src_id, header.body),
        }
    }

    pub(crate) fn handle_timer(&mut self, timer: ElectionTimer) -> Vec<Directive> {
        match self {
            // Ring-based and Chang-Roberts rely on link-loss detection
            // instead of timers.
            Self::RingBased(_) | Self::ChangRoberts(_) => Vec::new(),
            Self::Bully(handler) => handler.handle_timer(timer),
        }
    }

    /// Whether no election is currently in flight on this node.
    pub(crate) fn concluded(&self) -> bool {
        match self {
            Self::RingBased(handler) => handler.concluded(),
            Self::ChangRoberts(handler) => handler.concluded(),
            Self::Bully(handler) => handler.concluded(),
        }
    }

    /// The last agreed coordinator, once any election concluded.
    pub(crate) fn result(&self) -> Option<NodeId> {
        match self {
            Self::RingBased(handler) => handler.result(),
            Self::ChangRoberts(handler) => handler.result(),
            Self::Bully(handler) => handler.result(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, VecDeque};

    use super::*;
    use crate::wire::ElectionBody;

    /// Delivers directives between a ring of handlers, recording directory
    /// writes and armed timers instead of performing them.
    struct RingSim {
        order: Vec<NodeId>,
        handlers: BTreeMap<NodeId, ElectionHandler>,
        records: Vec<(NodeId, NodeId)>,
        timers: Vec<(NodeId, ElectionTimer)>,
        delivered: usize,
    }

    impl RingSim {
        fn new(method: ElectionMethod, order: &[NodeId]) -> Self {
            let handlers = order
                .iter()
                .map(|id| (*id, ElectionHandler::new(method, *id)))
                .collect();
            Self {
                order: order.to_vec(),
                handlers,
                records: Vec::new(),
                timers: Vec::new(),
                delivered: 0,
            }
        }

        fn successor_of(&self, id: NodeId) -> NodeId {
            let pos = self.order.iter().position(|other| *other == id).unwrap();
            self.order[(pos + 1) % self.order.len()]
        }

        fn start(&mut self, starter: NodeId) {
            self.start_many(&[starter]);
        }

        /// Starts elections on several nodes "at once": all start directives
        /// enter one queue before any message is delivered, interleaving the
        /// rounds the way concurrent detection would.
        fn start_many(&mut self, starters: &[NodeId]) {
            let mut directives = Vec::new();
            for starter in starters {
                let out = self.handlers.get_mut(starter).unwrap().start_election();
                directives.extend(out.into_iter().map(|d| (*starter, d)));
            }
            self.drain_queue(directives.into());
        }

        fn fire_timer(&mut self, node: NodeId, timer: ElectionTimer) {
            let directives = self.handlers.get_mut(&node).unwrap().handle_timer(timer);
            self.drain_queue(directives.into_iter().map(|d| (node, d)).collect());
        }

        fn drain_queue(&mut self, mut queue: VecDeque<(NodeId, Directive)>) {
            while let Some((actor, directive)) = queue.pop_front() {
                self.delivered += 1;
                assert!(self.delivered < 10_000, "directive storm: protocol looping");

                let deliveries: Vec<(NodeId, ElectionHeader)> = match directive {
                    Directive::ForwardToSuccessor(header) => {
                        vec![(self.successor_of(actor), header)]
                    },
                    Directive::Reply { dest_id, header } => vec![(dest_id, header)],
                    Directive::BroadcastToHigherIds(header) => self
                        .order
                        .iter()
                        .filter(|id| **id > actor)
                        .map(|id| (*id, header.clone()))
                        .collect(),
                    Directive::BroadcastToRing(header) => self
                        .order
                        .iter()
                        .filter(|id| **id != actor)
                        .map(|id| (*id, header.clone()))
                        .collect(),
                    Directive::StartTimer(timer) => {
                        self.timers.push((actor, timer));
                        continue;
                    },
                    Directive::RecordCoordinator(winner) => {
                        self.records.push((actor, winner));
                        continue;
                    },
                };

                for (dest, header) in deliveries {
                    let out = self
                        .handlers
                        .get_mut(&dest)
                        .unwrap()
                        .handle_header(actor, header);
                    queue.extend(out.into_iter().map(|d| (dest, d)));
                }
            }
        }

        fn assert_all_agree_on(&self, winner: NodeId) {
            for (id, handler) in &self.handlers {
                assert!(handler.concluded(), "node {id} still mid-election");
                assert_eq!(
                    handler.result(),
                    Some(winner),
                    "node {id} disagrees on the winner",
                );
            }
        }
    }

    #[test]
    fn test_ring_based_agreement() {
        // Ring order deliberately not sorted by ID.
        let mut sim = RingSim::new(ElectionMethod::RingBased, &[1, 4, 2, 6, 3]);
        sim.start(1);

        sim.assert_all_agree_on(6);
        // Only the originator computed the winner and wrote the directory.
        assert_eq!(sim.records, vec![(1, 6)]);
    }

    #[test]
    fn test_ring_based_coordinator_circulates_once() {
        let mut sim = RingSim::new(ElectionMethod::RingBased, &[1, 2, 3]);
        sim.start(2);

        sim.assert_all_agree_on(3);

        // Re-delivering the announcement is absorbed, not forwarded again.
        let header = ElectionHeader::new(
            ElectionMethod::RingBased,
            ElectionBody::Coordinator { coordinator_id: 3 },
        );
        let out = sim.handlers.get_mut(&1).unwrap().handle_header(3, header);
        assert!(out.is_empty());
    }

    #[test]
    fn test_chang_roberts_agreement() {
        let mut sim = RingSim::new(ElectionMethod::ChangRoberts, &[5, 1, 6, 2]);
        sim.start(2);

        sim.assert_all_agree_on(6);
        // The winner is the node that sees its own ID return.
        assert_eq!(sim.records, vec![(6, 6)]);
    }

    #[test]
    fn test_chang_roberts_concurrent_starters_converge() {
        let order = [3, 1, 4, 2];
        let mut sim = RingSim::new(ElectionMethod::ChangRoberts, &order);

        // Two nodes detect the loss at the same time.
        sim.start_many(&[1, 2]);

        sim.assert_all_agree_on(4);
        assert_eq!(sim.records, vec![(4, 4)]);
    }

    #[test]
    fn test_chang_roberts_participant_absorbs_lower_candidate() {
        let mut handler = ChangRobertsElection::new(5);

        // Promoting its own ID makes the node a participant.
        let out = handler.handle_body(ElectionBody::Candidate { candidate_id: 3 });
        assert_eq!(
            out,
            vec![Directive::ForwardToSuccessor(ElectionHeader::new(
                ElectionMethod::ChangRoberts,
                ElectionBody::Candidate { candidate_id: 5 },
            ))],
        );
        assert!(!handler.concluded());

        // A second, smaller candidate is absorbed outright.
        let out = handler.handle_body(ElectionBody::Candidate { candidate_id: 2 });
        assert!(out.is_empty());

        // A greater candidate is always forwarded unchanged.
        let out = handler.handle_body(ElectionBody::Candidate { candidate_id: 7 });
        assert_eq!(
            out,
            vec![Directive::ForwardToSuccessor(ElectionHeader::new(
                ElectionMethod::ChangRoberts,
                ElectionBody::Candidate { candidate_id: 7 },
            ))],
        );
    }

    #[test]
    fn test_bully_highest_id_assumes_victory() {
        let order = [1, 2, 6];
        let mut sim = RingSim::new(ElectionMethod::Bully, &order);

        sim.start(1);

        // 1's broadcast reached 2 and 6; both bullied 1 with an OK and
        // started their own rounds, so every starter armed a T1 timer.
        let armed: Vec<NodeId> = sim
            .timers
            .iter()
            .filter(|(_, timer)| *timer == ElectionTimer::AssumeVictory)
            .map(|(id, _)| *id)
            .collect();
        assert!(armed.contains(&6));

        // 1 received OKs and is waiting on the winner's announcement.
        assert!(sim
            .timers
            .iter()
            .any(|entry| *entry == (1, ElectionTimer::AwaitCoordinator)));

        // Nothing above 6, so its victory timer fires unopposed.
        sim.fire_timer(6, ElectionTimer::AssumeVictory);
        sim.assert_all_agree_on(6);
        assert_eq!(sim.records, vec![(6, 6)]);

        // Lower nodes' stale timers are no-ops after the announcement.
        sim.fire_timer(1, ElectionTimer::AwaitCoordinator);
        sim.fire_timer(2, ElectionTimer::AssumeVictory);
        sim.assert_all_agree_on(6);
        assert_eq!(sim.records, vec![(6, 6)]);
    }

    #[test]
    fn test_bully_await_coordinator_timeout_restarts() {
        let mut handler = BullyElection::new(2);

        let out = handler.start_election();
        assert!(out.contains(&Directive::StartTimer(ElectionTimer::AssumeVictory)));

        // A higher node replied OK but its announcement never arrives.
        let out = handler.handle_body(6, ElectionBody::Ok);
        assert_eq!(out, vec![Directive::StartTimer(ElectionTimer::AwaitCoordinator)]);

        let out = handler.handle_timer(ElectionTimer::AwaitCoordinator);
        assert!(
            out.contains(&Directive::BroadcastToHigherIds(ElectionHeader::new(
                ElectionMethod::Bully,
                ElectionBody::Election,
            ))),
            "timeout without a coordinator must restart the election",
        );
    }

    #[test]
    fn test_bully_victory_timer_suppressed_by_ok() {
        let mut handler = BullyElection::new(2);
        handler.start_election();
        handler.handle_body(6, ElectionBody::Ok);

        // OK arrived first: assuming victory now would split the ring.
        assert!(handler.handle_timer(ElectionTimer::AssumeVictory).is_empty());
        assert!(!handler.concluded());
    }
}
