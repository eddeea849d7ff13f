//! Sync configuration.

use serde::{Deserialize, Serialize};

use super::error::SyncError;

/// Updates closer together than this are treated as simultaneous input.
pub const DEFAULT_CONFLICT_WINDOW_MS: i64 = 1_000;

/// Tunables for a device's sync coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncConfig {
    /// Conflict detection window in milliseconds
    pub conflict_window_ms: i64,

    /// Release locks held by a device once it leaves the session
    pub auto_unlock_on_disconnect: bool,

    /// Ask the master for a full snapshot when a checksum disagrees
    pub force_sync_on_mismatch: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            conflict_window_ms: DEFAULT_CONFLICT_WINDOW_MS,
            auto_unlock_on_disconnect: true,
            force_sync_on_mismatch: true,
        }
    }
}

impl SyncConfig {
    /// Parse from JSON. Missing fields take their defaults.
    pub fn from_json(raw: &str) -> Result<Self, SyncError> {
        let config: Self =
            serde_json::from_str(raw).map_err(|e| SyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `FIGHT_SYNC_*` environment variables.
    ///
    /// - `FIGHT_SYNC_CONFLICT_WINDOW_MS`
    /// - `FIGHT_SYNC_AUTO_UNLOCK`
    /// - `FIGHT_SYNC_FORCE_SYNC_ON_MISMATCH`
    pub fn from_env() -> Result<Self, SyncError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, SyncError> {
        let mut config = Self::default();

        if let Some(raw) = lookup("FIGHT_SYNC_CONFLICT_WINDOW_MS") {
            config.conflict_window_ms = raw
                .trim()
                .parse()
                .map_err(|_| SyncError::Config(format!("invalid conflict window: {raw}")))?;
        }
        if let Some(raw) = lookup("FIGHT_SYNC_AUTO_UNLOCK") {
            config.auto_unlock_on_disconnect = parse_flag("FIGHT_SYNC_AUTO_UNLOCK", &raw)?;
        }
        if let Some(raw) = lookup("FIGHT_SYNC_FORCE_SYNC_ON_MISMATCH") {
            config.force_sync_on_mismatch =
                parse_flag("FIGHT_SYNC_FORCE_SYNC_ON_MISMATCH", &raw)?;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), SyncError> {
        if self.conflict_window_ms < 0 {
            return Err(SyncError::Config(format!(
                "conflict window must not be negative, got {}",
                self.conflict_window_ms
            )));
        }
        Ok(())
    }
}

fn parse_flag(key: &str, raw: &str) -> Result<bool, SyncError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(SyncError::Config(format!("{key}: expected a boolean, got {raw}"))),
    }
}
