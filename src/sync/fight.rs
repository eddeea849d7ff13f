//! Fight state and the fight state store.
//!
//! The store holds this device's replica of every fight it has heard of. It is
//! the only writer of [`FightState`]; the conflict pipeline and the lock
//! manager go through its methods.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::checksum::checksum;
use super::device::DeviceId;

/// Identifier of a scheduled match.
pub type FightId = String;

/// Fight status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FightStatus {
    #[default]
    Ready,
    Running,
    Paused,
    Finished,
}

impl FightStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Finished => "finished",
        }
    }
}

/// Lock fields carried by authoritative snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockSnapshot {
    pub locked_by: Option<DeviceId>,
    pub locked_at: Option<i64>,
}

/// Replica of one fight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FightState {
    pub fight_id: FightId,
    pub fighter1_points: u32,
    pub fighter2_points: u32,
    pub status: FightStatus,

    /// Milliseconds since epoch of the update this state reflects
    pub last_update: i64,

    /// Device that produced `last_update`; `None` until the first update
    pub last_update_origin: Option<DeviceId>,

    pub checksum: String,

    pub locked: bool,
    pub locked_by: Option<DeviceId>,
    pub locked_at: Option<i64>,
}

impl FightState {
    /// A fight nobody has touched yet.
    pub fn new(fight_id: impl Into<FightId>) -> Self {
        let status = FightStatus::default();
        Self {
            fight_id: fight_id.into(),
            fighter1_points: 0,
            fighter2_points: 0,
            status,
            last_update: 0,
            last_update_origin: None,
            checksum: checksum(0, 0, status),
            locked: false,
            locked_by: None,
            locked_at: None,
        }
    }

    /// No update has ever been applied.
    pub fn is_pristine(&self) -> bool {
        self.last_update_origin.is_none()
    }

    pub fn compute_checksum(&self) -> String {
        checksum(self.fighter1_points, self.fighter2_points, self.status)
    }

    pub fn lock_snapshot(&self) -> LockSnapshot {
        LockSnapshot {
            locked_by: self.locked_by.clone(),
            locked_at: self.locked_at,
        }
    }

    fn merge(&mut self, patch: &FightStatePatch) {
        if let Some(points) = patch.fighter1_points {
            self.fighter1_points = points;
        }
        if let Some(points) = patch.fighter2_points {
            self.fighter2_points = points;
        }
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(lock) = &patch.lock {
            self.set_lock(lock.locked_by.clone(), lock.locked_at);
        }
        self.checksum = self.compute_checksum();
    }

    fn set_lock(&mut self, holder: Option<DeviceId>, at: Option<i64>) {
        self.locked = holder.is_some();
        self.locked_at = holder.as_ref().and(at);
        self.locked_by = holder;
    }
}

/// Partial fight state carried by sync messages.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FightStatePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fighter1_points: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub fighter2_points: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<FightStatus>,

    /// Only set on full snapshots
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock: Option<LockSnapshot>,
}

impl FightStatePatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every field of `state`, lock included.
    pub fn snapshot(state: &FightState) -> Self {
        Self {
            fighter1_points: Some(state.fighter1_points),
            fighter2_points: Some(state.fighter2_points),
            status: Some(state.status),
            lock: Some(state.lock_snapshot()),
        }
    }

    pub fn fighter1_points(mut self, points: u32) -> Self {
        self.fighter1_points = Some(points);
        self
    }

    pub fn fighter2_points(mut self, points: u32) -> Self {
        self.fighter2_points = Some(points);
        self
    }

    pub fn status(mut self, status: FightStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// No mutable field is set. A lock snapshot alone still counts as empty.
    pub fn is_empty(&self) -> bool {
        self.fighter1_points.is_none() && self.fighter2_points.is_none() && self.status.is_none()
    }

    /// Any present mutable field differs from `state`.
    pub fn differs_from(&self, state: &FightState) -> bool {
        self.fighter1_points.is_some_and(|p| p != state.fighter1_points)
            || self.fighter2_points.is_some_and(|p| p != state.fighter2_points)
            || self.status.is_some_and(|s| s != state.status)
    }
}

/// Fight states by id.
#[derive(Debug, Default)]
pub struct FightStateStore {
    fights: HashMap<FightId, FightState>,
}

impl FightStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, fight_id: &str) -> Option<&FightState> {
        self.fights.get(fight_id)
    }

    /// Get a fight, creating a pristine entry on first reference.
    pub fn get_or_create(&mut self, fight_id: &str) -> &FightState {
        self.entry(fight_id)
    }

    fn entry(&mut self, fight_id: &str) -> &mut FightState {
        self.fights
            .entry(fight_id.to_string())
            .or_insert_with(|| FightState::new(fight_id))
    }

    /// Merge a patch and stamp it with its timestamp and origin.
    pub fn apply_patch(
        &mut self,
        fight_id: &str,
        patch: &FightStatePatch,
        timestamp: i64,
        origin: &str,
    ) -> &FightState {
        let state = self.entry(fight_id);
        state.merge(patch);
        state.last_update = timestamp;
        state.last_update_origin = Some(origin.to_string());
        state
    }

    /// Keep the current fields but move the update metadata forward.
    pub fn restamp(&mut self, fight_id: &str, timestamp: i64, origin: &str) -> &FightState {
        let state = self.entry(fight_id);
        state.last_update = timestamp;
        state.last_update_origin = Some(origin.to_string());
        state
    }

    /// Set or clear the lock holder.
    pub fn set_lock(&mut self, fight_id: &str, holder: Option<DeviceId>, at: Option<i64>) {
        self.entry(fight_id).set_lock(holder, at);
    }

    /// Fights currently locked by `device_id`, sorted.
    pub fn locks_held_by(&self, device_id: &str) -> Vec<FightId> {
        let mut held: Vec<FightId> = self
            .fights
            .values()
            .filter(|f| f.locked_by.as_deref() == Some(device_id))
            .map(|f| f.fight_id.clone())
            .collect();
        held.sort();
        held
    }

    pub fn fight_ids(&self) -> impl Iterator<Item = &FightId> {
        self.fights.keys()
    }

    pub fn count(&self) -> usize {
        self.fights.len()
    }

    /// Drop all fights. Only called when the session ends.
    pub fn clear(&mut self) {
        self.fights.clear();
    }
}
