use tokenring_directory::NodeId;
use tracing::{debug, info, warn};

use super::{Directive, ElectionTimer};
use crate::wire::{ElectionBody, ElectionHeader, ElectionMethod};

/// Bully election: timeout-driven, all traffic over the control plane.
///
/// The starter announces itself to every higher-ID ring member. A higher
/// node bullies it with OK and takes over; a starter that hears nothing
/// within the victory timeout declares itself coordinator to the whole
/// membership.
pub(crate) struct BullyElection {
    self_id: NodeId,
    ongoing: bool,
    ok_arrived: bool,
    coordinator_arrived: bool,
    elected: Option<NodeId>,
}

impl BullyElection {
    pub(crate) fn new(self_id: NodeId) -> Self {
        Self {
            self_id,
            ongoing: false,
            ok_arrived: false,
            coordinator_arrived: false,
            elected: None,
        }
    }

    pub(crate) fn start_election(&mut self) -> Vec<Directive> {
        info!("Starting bully election.");
        self.ok_arrived = false;
        self.coordinator_arrived = false;
        self.ongoing = true;

        vec![
            Directive::BroadcastToHigherIds(header(ElectionBody::Election)),
            Directive::StartTimer(ElectionTimer::AssumeVictory),
        ]
    }

    pub(crate) fn handle_body(&mut self, src_id: NodeId, body: ElectionBody) -> Vec<Directive> {
        match body {
            ElectionBody::Election => self.handle_election(src_id),
            ElectionBody::Ok => self.handle_ok(src_id),
            ElectionBody::Coordinator { coordinator_id } => {
                // An announcement settles the election regardless of local
                // participation state.
                self.coordinator_arrived = true;
                self.elected = Some(coordinator_id);
                self.ongoing = false;
                Vec::new()
            },
            other => {
                warn!(body = ?other, "Unexpected bully election message.");
                Vec::new()
            },
        }
    }

    /// A lower-ID node called an election: bully it with an OK and, unless
    /// already mid-election, take over with an election of our own.
    fn handle_election(&mut self, src_id: NodeId) -> Vec<Directive> {
        if src_id >= self.self_id {
            return Vec::new();
        }

        let mut directives = vec![Directive::Reply {
            dest_id: src_id,
            header: header(ElectionBody::Ok),
        }];

        if !self.ongoing {
            directives.extend(self.start_election());
        }

        directives
    }

    /// A higher-ID node took over; wait for its COORDINATOR announcement.
    fn handle_ok(&mut self, src_id: NodeId) -> Vec<Directive> {
        if src_id <= self.self_id {
            return Vec::new();
        }

        self.ok_arrived = true;
        vec![Directive::StartTimer(ElectionTimer::AwaitCoordinator)]
    }

    pub(crate) fn handle_timer(&mut self, timer: ElectionTimer) -> Vec<Directive> {
        match timer {
            ElectionTimer::AssumeVictory => {
                if self.ongoing && !self.ok_arrived && !self.coordinator_arrived {
                    self.assume_self_won()
                } else {
                    debug!("Victory timer lapsed after the election moved on.");
                    Vec::new()
                }
            },
            ElectionTimer::AwaitCoordinator => {
                if self.coordinator_arrived {
                    Vec::new()
                } else {
                    // The higher node that bullied us died before announcing.
                    info!("No coordinator announcement arrived; retrying election.");
                    self.start_election()
                }
            },
        }
    }

    fn assume_self_won(&mut self) -> Vec<Directive> {
        info!("Electing self as coordinator.");
        self.elected = Some(self.self_id);
        self.ongoing = false;

        vec![
            Directive::RecordCoordinator(self.self_id),
            Directive::BroadcastToRing(header(ElectionBody::Coordinator {
                coordinator_id: self.self_id,
            })),
        ]
    }

    pub(crate) fn concluded(&self) -> bool {
        !self.ongoing
    }

    pub(crate) fn result(&self) -> Option<NodeId> {
        self.elected
    }
}

fn header(body: ElectionBody) -> ElectionHeader {
    ElectionHeader::new(ElectionMethod::Bully, body)
}
