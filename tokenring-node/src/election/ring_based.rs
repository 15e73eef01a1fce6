use tokenring_directory::NodeId;
use tracing::{debug, info, warn};

use super::Directive;
use crate::wire::{ElectionBody, ElectionHeader, ElectionMethod};

/// Ring-based election: the originator circulates a growing roster of
/// candidate IDs; when the roster returns, the maximum ID wins and a
/// COORDINATOR announcement makes one lap of the ring.
pub(crate) struct RingBasedElection {
    self_id: NodeId,
    ongoing: bool,
    elected: Option<NodeId>,
}

impl RingBasedElection {
    pub(crate) fn new(self_id: NodeId) -> Self {
        Self {
            self_id,
            ongoing: false,
            elected: None,
        }
    }

    pub(crate) fn start_election(&mut self) -> Vec<Directive> {
        info!("Starting ring based election.");
        self.ongoing = true;

        let header = ElectionHeader::new(
            ElectionMethod::RingBased,
            ElectionBody::Roster {
                originator: self.self_id,
                candidates: vec![self.self_id],
            },
        );
        vec![Directive::ForwardToSuccessor(header)]
    }

    pub(crate) fn handle_body(&mut self, body: ElectionBody) -> Vec<Directive> {
        match body {
            ElectionBody::Roster {
                originator,
                mut candidates,
            } => {
                if originator == self.self_id {
                    // The roster came back around; conclude the election.
                    self.conclude(&candidates)
                } else {
                    // Append self and keep it moving.
                    candidates.push(self.self_id);
                    self.ongoing = true;

                    let header = ElectionHeader::new(
                        ElectionMethod::RingBased,
                        ElectionBody::Roster {
                            originator,
                            candidates,
                        },
                    );
                    vec![Directive::ForwardToSuccessor(header)]
                }
            },
            ElectionBody::Coordinator { coordinator_id } => {
                // Forward only if not already aware of this coordinator;
                // that is what stops the announcement after one full lap.
                let to_be_forwarded = self.elected != Some(coordinator_id);
                self.elected = Some(coordinator_id);
                self.ongoing = false;

                if to_be_forwarded {
                    vec![Directive::ForwardToSuccessor(coordinator_header(
                        coordinator_id,
                    ))]
                } else {
                    debug!(coordinator_id = coordinator_id, "Announcement completed its lap.");
                    Vec::new()
                }
            },
            other => {
                warn!(body = ?other, "Unexpected ring based election message.");
                Vec::new()
            },
        }
    }

    fn conclude(&mut self, candidates: &[NodeId]) -> Vec<Directive> {
        let winner = candidates.iter().copied().max().unwrap_or(self.self_id);
        info!(winner = winner, candidates = ?candidates, "Ring based election concluded.");

        self.elected = Some(winner);
        self.ongoing = false;

        vec![
            Directive::RecordCoordinator(winner),
            Directive::ForwardToSuccessor(coordinator_header(winner)),
        ]
    }

    pub(crate) fn concluded(&self) -> bool {
        !self.ongoing
    }

    pub(crate) fn result(&self) -> Option<NodeId> {
        self.elected
    }
}

fn coordinator_header(coordinator_id: NodeId) -> ElectionHeader {
    ElectionHeader::new(
        ElectionMethod::RingBased,
        ElectionBody::Coordinator { coordinator_id },
    )
}
