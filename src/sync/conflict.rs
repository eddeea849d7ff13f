//! Conflict detection and resolution.
//!
//! Two updates for the same fight less than the conflict window apart count as
//! simultaneous input. If they disagree, the master's state wins; without the
//! master the later timestamp wins, ties going to the lexically greater device
//! id. Resolution always produces an answer.

use super::config::DEFAULT_CONFLICT_WINDOW_MS;
use super::fight::FightState;
use super::message::SyncMessage;

/// Verdict of the detector for one incoming update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detection {
    /// Unambiguously newer, apply as is
    Apply,
    /// Older than the local state by at least the window
    Stale,
    /// Within the window and carrying the values already held
    Duplicate,
    /// Within the window and disagreeing
    Conflict,
}

impl Detection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Apply => "apply",
            Self::Stale => "stale",
            Self::Duplicate => "duplicate",
            Self::Conflict => "conflict",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConflictDetector {
    window_ms: i64,
}

impl Default for ConflictDetector {
    fn default() -> Self {
        Self::new(DEFAULT_CONFLICT_WINDOW_MS)
    }
}

impl ConflictDetector {
    pub fn new(window_ms: i64) -> Self {
        Self { window_ms }
    }

    pub fn detect(&self, current: &FightState, incoming: &SyncMessage) -> Detection {
        if current.is_pristine() {
            return Detection::Apply;
        }

        let delta = (incoming.timestamp - current.last_update).abs();
        if delta >= self.window_ms {
            return if incoming.timestamp > current.last_update {
                Detection::Apply
            } else {
                Detection::Stale
            };
        }

        if incoming.state.differs_from(current) {
            Detection::Conflict
        } else {
            Detection::Duplicate
        }
    }
}

/// How a conflict was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Local device is master; its state stands and is broadcast
    MasterPriority,
    /// Recency picked the incoming update
    AcceptIncoming,
    /// Recency picked the local state
    KeepLocal,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MasterPriority => "master_priority",
            Self::AcceptIncoming => "accept_incoming",
            Self::KeepLocal => "keep_local",
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictResolver;

impl ConflictResolver {
    pub fn new() -> Self {
        Self
    }

    pub fn resolve(
        &self,
        current: &FightState,
        incoming: &SyncMessage,
        local_is_master: bool,
    ) -> Resolution {
        if local_is_master {
            Resolution::MasterPriority
        } else if Self::incoming_is_newer(current, incoming) {
            Resolution::AcceptIncoming
        } else {
            Resolution::KeepLocal
        }
    }

    /// Strictly later timestamp, or equal timestamp and greater device id.
    pub fn incoming_is_newer(current: &FightState, incoming: &SyncMessage) -> bool {
        match incoming.timestamp.cmp(&current.last_update) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => {
                current.last_update_origin.as_deref() < Some(incoming.device_id.as_str())
            }
        }
    }
}
