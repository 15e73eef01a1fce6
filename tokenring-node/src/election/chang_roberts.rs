use tokenring_directory::NodeId;
use tracing::{debug, info, warn};

use super::Directive;
use crate::wire::{ElectionBody, ElectionHeader, ElectionMethod};

/// Chang-Roberts election: only the current best candidate circulates.
///
/// A participant absorbs any candidate that is not strictly greater than
/// its own ID, which is what bounds the number of live candidates compared
/// to circulating a full roster.
pub(crate) struct ChangRobertsElection {
    self_id: NodeId,
    participant: bool,
    elected: Option<NodeId>,
}

impl ChangRobertsElection {
    pub(crate) fn new(self_id: NodeId) -> Self {
        Self {
            self_id,
            participant: false,
            elected: None,
        }
    }

    pub(crate) fn start_election(&mut self) -> Vec<Directive> {
        info!("Starting chang roberts election.");
        self.participant = true;
        vec![Directive::ForwardToSuccessor(candidate_header(self.self_id))]
    }

    pub(crate) fn handle_body(&mut self, body: ElectionBody) -> Vec<Directive> {
        match body {
            ElectionBody::Candidate { candidate_id } => self.handle_candidate(candidate_id),
            ElectionBody::Coordinator { coordinator_id } => {
                let to_be_forwarded = self.elected != Some(coordinator_id);
                self.elected = Some(coordinator_id);
                self.participant = false;

                if to_be_forwarded {
                    vec![Directive::ForwardToSuccessor(coordinator_header(
                        coordinator_id,
                    ))]
                } else {
                    Vec::new()
                }
            },
            other => {
                warn!(body = ?other, "Unexpected chang roberts election message.");
                Vec::new()
            },
        }
    }

    /// The comparison is only ever against this node's own ID, never against
    /// a remembered intermediate candidate.
    fn handle_candidate(&mut self, candidate_id: NodeId) -> Vec<Directive> {
        if candidate_id == self.self_id {
            // The message has circled back; this node wins.
            return self.conclude();
        }

        if candidate_id > self.self_id {
            // Always forward a greater candidate.
            self.participant = true;
            return vec![Directive::ForwardToSuccessor(candidate_header(candidate_id))];
        }

        if !self.participant {
            // Promote self over the smaller candidate.
            self.participant = true;
            return vec![Directive::ForwardToSuccessor(candidate_header(self.self_id))];
        }

        debug!(candidate_id = candidate_id, "Absorbing candidate: already participating.");
        Vec::new()
    }

    fn conclude(&mut self) -> Vec<Directive> {
        info!(winner = self.self_id, "Chang roberts election concluded.");
        self.elected = Some(self.self_id);
        self.participant = false;

        vec![
            Directive::RecordCoordinator(self.self_id),
            Directive::ForwardToSuccessor(coordinator_header(self.self_id)),
        ]
    }

    pub(crate) fn concluded(&self) -> bool {
        !self.participant
    }

    pub(crate) fn result(&self) -> Option<NodeId> {
        self.elected
    }
}

fn candidate_header(candidate_id: NodeId) -> ElectionHeader {
    ElectionHeader::new(
        ElectionMethod::ChangRoberts,
        ElectionBody::Candidate { candidate_id },
    )
}

fn coordinator_header(coordinator_id: NodeId) -> ElectionHeader {
    ElectionHeader::new(
        ElectionMethod::ChangRoberts,
        ElectionBody::Coordinator { coordinator_id },
    )
}
