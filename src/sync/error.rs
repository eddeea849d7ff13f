//! Error types for the sync layer.
//!
//! Lock contention and ignored master requests are not errors; they are
//! reported as outcomes. Everything here is recoverable.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Authentication rejected for device {0}")]
    Unauthorized(String),

    #[error("Device {0} is not connected to the session")]
    NotConnected(String),

    #[error("Update for fight {0} carries no fields")]
    EmptyPatch(String),

    #[error("Fight {fight_id} is locked by {holder}")]
    FightLocked { fight_id: String, holder: String },

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("Configuration error: {0}")]
    Config(String),
}
