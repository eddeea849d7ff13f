//! Wire messages exchanged between devices and the session hub.
//!
//! Every message is a JSON object tagged by `type`:
//!
//! | type                  | direction              |
//! |-----------------------|------------------------|
//! | `authenticate`        | device -> hub          |
//! | `register-device`     | device -> hub          |
//! | `devices-updated`     | hub -> all             |
//! | `master-assignment`   | hub -> all             |
//! | `sync-state`          | device -> hub -> peers |
//! | `sync-command`        | device -> hub -> peers |
//! | `conflict-resolution` | master -> hub -> all   |

use serde::{Deserialize, Serialize};

use super::device::{Capabilities, Device, DeviceId, DeviceType};
use super::fight::{FightId, FightStatePatch};

/// Delivery priority of a sync message.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    /// Authoritative snapshot from the master
    Critical,
}

/// Why a master was assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AssignmentReason {
    Initial,
    Transfer,
    FailureRecovery,
}

impl AssignmentReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Transfer => "transfer",
            Self::FailureRecovery => "failure-recovery",
        }
    }
}

/// The single authoritative master of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterAssignment {
    pub master_device_id: DeviceId,
    pub assigned_at: i64,
    pub reason: AssignmentReason,
}

impl MasterAssignment {
    pub fn new(master_device_id: impl Into<DeviceId>, assigned_at: i64, reason: AssignmentReason) -> Self {
        Self {
            master_device_id: master_device_id.into(),
            assigned_at,
            reason,
        }
    }
}

/// Reason given by a device asking for the master role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestReason {
    DeviceFailure,
    UserRequest,
    #[default]
    #[serde(other)]
    Unspecified,
}

/// A state update for one fight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMessage {
    pub fight_id: FightId,

    /// Origin device
    pub device_id: DeviceId,

    pub state: FightStatePatch,
    pub timestamp: i64,

    #[serde(default)]
    pub priority: Priority,

    /// Checksum of the sender's full state after applying `state`
    pub checksum: String,
}

/// Commands a device can issue to its peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncCommand {
    #[serde(rename_all = "camelCase")]
    LockFight { fight_id: FightId },

    #[serde(rename_all = "camelCase")]
    UnlockFight { fight_id: FightId },

    #[serde(rename_all = "camelCase")]
    RequestMaster {
        reason: RequestReason,
        #[serde(default)]
        priority: Priority,
        #[serde(default)]
        capabilities: Capabilities,
    },

    /// Ask the master to re-broadcast its full state for a fight
    #[serde(rename_all = "camelCase")]
    ForceSync { fight_id: FightId },
}

impl SyncCommand {
    pub fn fight_id(&self) -> Option<&str> {
        match self {
            Self::LockFight { fight_id }
            | Self::UnlockFight { fight_id }
            | Self::ForceSync { fight_id } => Some(fight_id),
            Self::RequestMaster { .. } => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::LockFight { .. } => "lock_fight",
            Self::UnlockFight { .. } => "unlock_fight",
            Self::RequestMaster { .. } => "request_master",
            Self::ForceSync { .. } => "force_sync",
        }
    }
}

/// A command with its origin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandEnvelope {
    pub command: SyncCommand,
    pub source_device: DeviceId,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionKind {
    MasterPriority,
}

/// Master's verdict on a conflicted fight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictResolution {
    pub fight_id: FightId,
    pub resolution: ResolutionKind,

    /// Full state of the master, lock excluded
    pub state: FightStatePatch,

    /// The master that resolved the conflict
    pub device_id: DeviceId,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Authenticate {
    pub token: String,
    pub user_type: String,
    pub device_id: DeviceId,
    #[serde(default)]
    pub capabilities: Capabilities,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterDevice {
    pub device_id: DeviceId,
    pub device_type: DeviceType,
    #[serde(default)]
    pub capabilities: Capabilities,
    pub timestamp: i64,
}

impl RegisterDevice {
    /// Registry entry for this request, connected at `timestamp`.
    pub fn to_device(&self) -> Device {
        let mut device = Device::new(self.device_id.clone(), self.device_type)
            .with_capabilities(self.capabilities.clone());
        if let Some(at) = chrono::DateTime::from_timestamp_millis(self.timestamp) {
            device.connected_at = at;
        }
        device
    }
}

/// Everything that travels over the session channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WireMessage {
    Authenticate(Authenticate),
    RegisterDevice(RegisterDevice),
    DevicesUpdated { devices: Vec<Device> },
    MasterAssignment(MasterAssignment),
    SyncState(SyncMessage),
    SyncCommand(CommandEnvelope),
    ConflictResolution(ConflictResolution),
}

/// A message on its way to the hub, tagged with the sending device.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub from: DeviceId,
    pub message: WireMessage,
}

impl WireMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Authenticate(_) => "authenticate",
            Self::RegisterDevice(_) => "register-device",
            Self::DevicesUpdated { .. } => "devices-updated",
            Self::MasterAssignment(_) => "master-assignment",
            Self::SyncState(_) => "sync-state",
            Self::SyncCommand(_) => "sync-command",
            Self::ConflictResolution(_) => "conflict-resolution",
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}
