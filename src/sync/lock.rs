//! Advisory fight locks.
//!
//! A lock tells well-behaved clients not to submit updates for a fight while
//! another device holds it. It never blocks delivery; the conflict detector
//! still handles whatever arrives. Locks do not expire.

use super::device::DeviceId;
use super::fight::{FightId, FightStateStore};

/// Result of a lock request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    Acquired,
    /// The requester already held it
    AlreadyHeld,
    AlreadyLocked { holder: DeviceId },
}

/// Result of an unlock request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnlockOutcome {
    Released,
    /// No-op: the requester does not hold the lock
    NotLockHolder { holder: Option<DeviceId> },
}

/// Lock policy over the fight store.
#[derive(Debug, Clone, Copy)]
pub struct LockManager {
    auto_unlock_on_disconnect: bool,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new(true)
    }
}

impl LockManager {
    pub fn new(auto_unlock_on_disconnect: bool) -> Self {
        Self {
            auto_unlock_on_disconnect,
        }
    }

    pub fn lock(
        &self,
        store: &mut FightStateStore,
        fight_id: &str,
        device_id: &str,
        now: i64,
    ) -> LockOutcome {
        let holder = store.get_or_create(fight_id).locked_by.clone();
        match holder {
            Some(holder) if holder == device_id => LockOutcome::AlreadyHeld,
            Some(holder) => LockOutcome::AlreadyLocked { holder },
            None => {
                store.set_lock(fight_id, Some(device_id.to_string()), Some(now));
                tracing::debug!(fight = %fight_id, device = %device_id, "fight locked");
                LockOutcome::Acquired
            }
        }
    }

    pub fn unlock(&self, store: &mut FightStateStore, fight_id: &str, device_id: &str) -> UnlockOutcome {
        let holder = store.get(fight_id).and_then(|f| f.locked_by.clone());
        match holder {
            Some(holder) if holder == device_id => {
                store.set_lock(fight_id, None, None);
                tracing::debug!(fight = %fight_id, device = %device_id, "fight unlocked");
                UnlockOutcome::Released
            }
            holder => UnlockOutcome::NotLockHolder { holder },
        }
    }

    pub fn holder<'a>(&self, store: &'a FightStateStore, fight_id: &str) -> Option<&'a str> {
        store.get(fight_id).and_then(|f| f.locked_by.as_deref())
    }

    /// Release every lock `device_id` holds, if disconnect auto-unlock is on.
    ///
    /// Returns the released fights.
    pub fn on_device_departed(&self, store: &mut FightStateStore, device_id: &str) -> Vec<FightId> {
        if !self.auto_unlock_on_disconnect {
            let held = store.locks_held_by(device_id);
            if !held.is_empty() {
                tracing::warn!(device = %device_id, fights = ?held, "departed device still holds locks");
            }
            return Vec::new();
        }

        let released = store.locks_held_by(device_id);
        for fight_id in &released {
            store.set_lock(fight_id, None, None);
        }
        if !released.is_empty() {
            tracing::info!(device = %device_id, fights = ?released, "released locks of departed device");
        }
        released
    }
}
