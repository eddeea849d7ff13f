//! Master coordinator.
//!
//! Tracks which device holds tie-breaking authority for the session and
//! validates how that authority moves.
//!
//! # State Diagram
//!
//! ```text
//! ┌──────────┐   assign (initial /     ┌───────────────┐
//! │ NoMaster │──────────────────────▶ │ MasterElected │◀─────────┐
//! └──────────┘   failure-recovery)     └───────┬───────┘          │
//!      ▲                                       │ begin_transfer   │ assign
//!      │ master_lost                           ▼                  │ (transfer)
//!      │                              ┌────────────────────┐      │
//!      └──────────────────────────────│ MasterTransferring │──────┘
//!                                     └────────────────────┘
//! ```
//!
//! The hub runs one coordinator as the session authority. Each device runs one
//! as its local view, fed by `master-assignment` broadcasts.

use std::fmt;

use super::device::DeviceId;
use super::message::{AssignmentReason, MasterAssignment, Priority, RequestReason};

/// Where the session stands on mastership.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum MasterState {
    #[default]
    NoMaster,

    Elected(MasterAssignment),

    /// Current master accepted a hand-off that has not been broadcast back yet
    Transferring {
        current: MasterAssignment,
        candidate: DeviceId,
    },
}

impl MasterState {
    pub fn master(&self) -> Option<&str> {
        match self {
            Self::NoMaster => None,
            Self::Elected(a) | Self::Transferring { current: a, .. } => {
                Some(&a.master_device_id)
            }
        }
    }

    pub fn assignment(&self) -> Option<&MasterAssignment> {
        match self {
            Self::NoMaster => None,
            Self::Elected(a) | Self::Transferring { current: a, .. } => Some(a),
        }
    }
}

impl fmt::Display for MasterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoMaster => write!(f, "NoMaster"),
            Self::Elected(a) => write!(f, "MasterElected({})", a.master_device_id),
            Self::Transferring { current, candidate } => {
                write!(f, "MasterTransferring({} -> {})", current.master_device_id, candidate)
            }
        }
    }
}

/// Master state transition events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MasterEvent {
    Assign(MasterAssignment),
    BeginTransfer { candidate: DeviceId },
    CancelTransfer,
    MasterLost,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: MasterState,
    pub event: MasterEvent,
    pub reason: &'static str,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Invalid master transition from {} via {:?}: {}",
            self.from, self.event, self.reason
        )
    }
}

impl std::error::Error for InvalidTransition {}

/// A device asking for the master role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterRequest {
    pub device_id: DeviceId,
    pub reason: RequestReason,
    pub priority: Priority,
}

/// Master state machine plus election policy.
#[derive(Debug, Clone, Default)]
pub struct MasterCoordinator {
    state: MasterState,
}

impl MasterCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &MasterState {
        &self.state
    }

    pub fn current_master(&self) -> Option<&str> {
        self.state.master()
    }

    pub fn assignment(&self) -> Option<&MasterAssignment> {
        self.state.assignment()
    }

    pub fn is_master(&self, device_id: &str) -> bool {
        self.current_master() == Some(device_id)
    }

    pub fn has_master(&self) -> bool {
        self.current_master().is_some()
    }

    pub fn apply_mut(&mut self, event: MasterEvent) -> Result<(), InvalidTransition> {
        self.state = self.transition(&event)?;
        Ok(())
    }

    fn transition(&self, event: &MasterEvent) -> Result<MasterState, InvalidTransition> {
        use MasterEvent::*;
        use MasterState::*;

        let invalid = |reason: &'static str| InvalidTransition {
            from: self.state.clone(),
            event: event.clone(),
            reason,
        };

        match (&self.state, event) {
            (_, Assign(a)) => Ok(Elected(a.clone())),

            (NoMaster, BeginTransfer { .. }) => Err(invalid("No master to transfer from")),
            (Transferring { .. }, BeginTransfer { .. }) => {
                Err(invalid("Transfer already in progress"))
            }
            (Elected(a), BeginTransfer { candidate }) if a.master_device_id == *candidate => {
                Err(invalid("Candidate is already master"))
            }
            (Elected(a), BeginTransfer { candidate }) => Ok(Transferring {
                current: a.clone(),
                candidate: candidate.clone(),
            }),

            (Transferring { current, .. }, CancelTransfer) => Ok(Elected(current.clone())),
            (_, CancelTransfer) => Err(invalid("No transfer in progress")),

            (NoMaster, MasterLost) => Err(invalid("No master to lose")),
            (_, MasterLost) => Ok(NoMaster),
        }
    }

    /// Elect `device_id` if nobody holds the role yet.
    pub fn on_device_joined(&mut self, device_id: &str, now: i64) -> Option<MasterAssignment> {
        if self.has_master() {
            return None;
        }
        let assignment = MasterAssignment::new(device_id, now, AssignmentReason::Initial);
        self.apply_mut(MasterEvent::Assign(assignment.clone())).ok()?;
        tracing::info!(master = %device_id, "initial master elected");
        Some(assignment)
    }

    /// React to a device leaving.
    ///
    /// Losing the master re-runs election among `remaining`; the lexically
    /// smallest id wins. Losing a transfer candidate cancels the transfer.
    pub fn on_device_left<'a>(
        &mut self,
        device_id: &str,
        remaining: impl IntoIterator<Item = &'a DeviceId>,
        now: i64,
    ) -> Option<MasterAssignment> {
        self.on_candidate_left(device_id);

        if !self.is_master(device_id) {
            return None;
        }

        if let Err(err) = self.apply_mut(MasterEvent::MasterLost) {
            tracing::warn!(error = %err, "master loss not applicable");
            return None;
        }
        tracing::warn!(master = %device_id, "master left the session");

        let successor = remaining
            .into_iter()
            .filter(|id| id.as_str() != device_id)
            .min()?
            .clone();
        let assignment = MasterAssignment::new(successor, now, AssignmentReason::FailureRecovery);
        self.apply_mut(MasterEvent::Assign(assignment.clone())).ok()?;
        tracing::info!(master = %assignment.master_device_id, "master re-elected after failure");
        Some(assignment)
    }

    /// Cancel a pending hand-off whose candidate is `device_id`.
    ///
    /// Returns whether a transfer was cancelled.
    pub fn on_candidate_left(&mut self, device_id: &str) -> bool {
        let candidate_left = matches!(
            &self.state,
            MasterState::Transferring { candidate, .. } if candidate == device_id
        );
        if !candidate_left {
            return false;
        }
        match self.apply_mut(MasterEvent::CancelTransfer) {
            Ok(()) => {
                tracing::info!(candidate = %device_id, "transfer cancelled, candidate left");
                true
            }
            Err(err) => {
                tracing::warn!(error = %err, "transfer cancel not applicable");
                false
            }
        }
    }

    /// Evaluate a hand-off request on behalf of the current master.
    ///
    /// Accepted only for `device_failure` or `high` priority. Anything else is
    /// ignored without telling the requester.
    pub fn evaluate_request(
        &mut self,
        request: &MasterRequest,
        now: i64,
    ) -> Option<MasterAssignment> {
        let accepted =
            request.reason == RequestReason::DeviceFailure || request.priority == Priority::High;
        if !accepted {
            tracing::debug!(
                requester = %request.device_id,
                reason = ?request.reason,
                priority = ?request.priority,
                "master request ignored"
            );
            return None;
        }

        if let Err(err) = self.apply_mut(MasterEvent::BeginTransfer {
            candidate: request.device_id.clone(),
        }) {
            tracing::debug!(error = %err, "master request not applicable");
            return None;
        }

        Some(MasterAssignment::new(
            request.device_id.clone(),
            now,
            AssignmentReason::Transfer,
        ))
    }

    /// Adopt a broadcast assignment. Returns whether the master changed.
    pub fn apply_assignment(&mut self, assignment: MasterAssignment) -> bool {
        let changed = self.current_master() != Some(assignment.master_device_id.as_str())
            || matches!(self.state, MasterState::Transferring { .. });
        self.state = MasterState::Elected(assignment);
        changed
    }

    /// Forget the master, e.g. when the session ends.
    pub fn reset(&mut self) {
        self.state = MasterState::NoMaster;
    }
}
