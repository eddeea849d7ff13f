//! Sync coordinator.
//!
//! One per device. Owns the device's registry view, master view and fight
//! replicas, and runs every inbound message through the conflict pipeline.
//! Handlers run one at a time on the device's event loop, so nothing here is
//! shared or locked.
//!
//! # Flow
//!
//! ```text
//! local change ──▶ store (optimistic) ──▶ sync-state ──▶ hub ──▶ peers
//!
//! sync-state ──▶ detector ──┬─ apply ─────────▶ store ──▶ checksum check
//!                           ├─ stale/duplicate ▶ dropped
//!                           └─ conflict ──▶ resolver ──┬─ master: keep + conflict-resolution
//!                                                      └─ recency: newer wins
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;

use super::clock::Clock;
use super::config::SyncConfig;
use super::conflict::{ConflictDetector, ConflictResolver, Detection, Resolution};
use super::device::{Device, DeviceId, DeviceRegistry};
use super::error::SyncError;
use super::fight::{FightId, FightState, FightStatePatch, FightStateStore};
use super::hub::HUB_DEVICE_ID;
use super::lock::{LockManager, LockOutcome, UnlockOutcome};
use super::master::{MasterCoordinator, MasterRequest};
use super::message::{
    AssignmentReason, CommandEnvelope, ConflictResolution, Envelope, MasterAssignment, Priority,
    RegisterDevice, RequestReason, ResolutionKind, SyncCommand, SyncMessage, WireMessage,
};

/// Notifications for whoever drives the device (UI, logs, tests).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    StateChanged {
        fight_id: FightId,
        checksum: String,
    },
    ConflictResolved {
        fight_id: FightId,
        resolution: Resolution,
    },
    /// A master-priority verdict from another device was adopted
    ResolutionAccepted {
        fight_id: FightId,
        master: DeviceId,
    },
    MessageDropped {
        fight_id: FightId,
        reason: Detection,
    },
    ChecksumMismatch {
        fight_id: FightId,
        expected: String,
        actual: String,
    },
    LockChanged {
        fight_id: FightId,
        holder: Option<DeviceId>,
    },
    /// A lock or unlock request was refused; advisory only
    LockRejected {
        fight_id: FightId,
        requester: DeviceId,
        holder: Option<DeviceId>,
    },
    MasterChanged {
        master: DeviceId,
        is_local: bool,
    },
    DevicesChanged {
        count: usize,
    },
}

pub struct SyncCoordinator {
    device: Device,
    config: SyncConfig,
    clock: Arc<dyn Clock>,
    outbox: UnboundedSender<Envelope>,

    registry: DeviceRegistry,
    master: MasterCoordinator,
    locks: LockManager,
    store: FightStateStore,
    detector: ConflictDetector,
    resolver: ConflictResolver,

    /// Fights settled by recency while no master was known
    unresolved: BTreeSet<FightId>,
}

impl SyncCoordinator {
    pub fn new(
        device: Device,
        config: SyncConfig,
        clock: Arc<dyn Clock>,
        outbox: UnboundedSender<Envelope>,
    ) -> Self {
        Self {
            locks: LockManager::new(config.auto_unlock_on_disconnect),
            detector: ConflictDetector::new(config.conflict_window_ms),
            resolver: ConflictResolver::new(),
            device,
            config,
            clock,
            outbox,
            registry: DeviceRegistry::new(),
            master: MasterCoordinator::new(),
            store: FightStateStore::new(),
            unresolved: BTreeSet::new(),
        }
    }

    /// Id of the local device.
    pub fn device_id(&self) -> &str {
        &self.device.device_id
    }

    /// The local device as it registers with the hub.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Check if the local device holds the master role.
    pub fn is_master(&self) -> bool {
        self.master.is_master(&self.device.device_id)
    }

    /// Master as last announced to this device.
    pub fn master(&self) -> Option<&str> {
        self.master.current_master()
    }

    /// Device list from the latest `devices-updated`.
    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Local replica of a fight, if this device has heard of it.
    pub fn fight(&self, fight_id: &str) -> Option<&FightState> {
        self.store.get(fight_id)
    }

    /// Device holding the advisory lock on a fight.
    pub fn lock_holder(&self, fight_id: &str) -> Option<&str> {
        self.locks.holder(&self.store, fight_id)
    }

    /// Fights with a recency verdict still waiting for a master.
    pub fn unresolved(&self) -> impl Iterator<Item = &FightId> {
        self.unresolved.iter()
    }

    /// Point the coordinator at a new hub connection.
    pub fn set_outbox(&mut self, outbox: UnboundedSender<Envelope>) {
        self.outbox = outbox;
    }

    fn publish(&self, message: WireMessage) -> Result<(), SyncError> {
        let kind = message.kind();
        self.outbox
            .send(Envelope {
                from: self.device.device_id.clone(),
                message,
            })
            .map_err(|_| SyncError::ChannelClosed(format!("hub unreachable for {kind}")))
    }

    fn publish_or_warn(&self, message: WireMessage) {
        if let Err(err) = self.publish(message) {
            tracing::warn!(device = %self.device.device_id, error = %err, "publish failed");
        }
    }

    /// Announce this device to the hub (first join or reconnect).
    pub fn register(&self) -> Result<(), SyncError> {
        self.publish(WireMessage::RegisterDevice(RegisterDevice {
            device_id: self.device.device_id.clone(),
            device_type: self.device.device_type,
            capabilities: self.device.capabilities.clone(),
            timestamp: self.clock.now_millis(),
        }))
    }

    /// Apply a local edit optimistically and publish it.
    pub fn on_local_change(
        &mut self,
        fight_id: &str,
        patch: FightStatePatch,
        priority: Priority,
    ) -> Result<SyncMessage, SyncError> {
        if patch.is_empty() {
            return Err(SyncError::EmptyPatch(fight_id.to_string()));
        }
        if let Some(holder) = self.locks.holder(&self.store, fight_id) {
            if holder != self.device.device_id {
                return Err(SyncError::FightLocked {
                    fight_id: fight_id.to_string(),
                    holder: holder.to_string(),
                });
            }
        }

        // Critical is reserved for master snapshots
        let priority = if priority == Priority::Critical {
            tracing::debug!(fight = %fight_id, "critical local change downgraded to high");
            Priority::High
        } else {
            priority
        };

        // Locks only move through lock commands
        let patch = FightStatePatch { lock: None, ..patch };
        let now = self.clock.now_millis();
        let state = self
            .store
            .apply_patch(fight_id, &patch, now, &self.device.device_id);

        let message = SyncMessage {
            fight_id: fight_id.to_string(),
            device_id: self.device.device_id.clone(),
            state: patch,
            timestamp: now,
            priority,
            checksum: state.checksum.clone(),
        };
        tracing::debug!(fight = %fight_id, checksum = %message.checksum, "local change");

        self.publish(WireMessage::SyncState(message.clone()))?;
        Ok(message)
    }

    /// Issue a command to the session. Outcomes arrive later as events.
    pub fn on_sync_command(&mut self, command: SyncCommand) -> Result<(), SyncError> {
        match &command {
            SyncCommand::RequestMaster { .. } if self.is_master() => {
                tracing::debug!(device = %self.device.device_id, "already master, request skipped");
                return Ok(());
            }
            SyncCommand::ForceSync { fight_id } if self.is_master() => {
                return self.broadcast_snapshot(fight_id);
            }
            _ => {}
        }

        self.publish(WireMessage::SyncCommand(CommandEnvelope {
            command,
            source_device: self.device.device_id.clone(),
            timestamp: self.clock.now_millis(),
        }))
    }

    /// Ask for the lock on a fight. The outcome arrives as a `LockChanged`
    /// or `LockRejected` event.
    pub fn lock_fight(&mut self, fight_id: &str) -> Result<(), SyncError> {
        self.on_sync_command(SyncCommand::LockFight {
            fight_id: fight_id.to_string(),
        })
    }

    /// Release a lock held by this device.
    pub fn unlock_fight(&mut self, fight_id: &str) -> Result<(), SyncError> {
        self.on_sync_command(SyncCommand::UnlockFight {
            fight_id: fight_id.to_string(),
        })
    }

    /// Ask the current master to hand over the role.
    pub fn request_master(&mut self, reason: RequestReason, priority: Priority) -> Result<(), SyncError> {
        self.on_sync_command(SyncCommand::RequestMaster {
            reason,
            priority,
            capabilities: self.device.capabilities.clone(),
        })
    }

    /// Ask the master for its full state of a fight.
    pub fn force_sync(&mut self, fight_id: &str) -> Result<(), SyncError> {
        self.on_sync_command(SyncCommand::ForceSync {
            fight_id: fight_id.to_string(),
        })
    }

    /// Ask for a fresh snapshot of every known fight, e.g. after reconnecting.
    pub fn resync_all(&mut self) -> Result<(), SyncError> {
        let mut fights: Vec<FightId> = self.store.fight_ids().cloned().collect();
        fights.sort();
        for fight_id in fights {
            self.force_sync(&fight_id)?;
        }
        Ok(())
    }

    /// Dispatch one inbound message.
    pub fn handle(&mut self, message: WireMessage) -> Vec<SyncEvent> {
        match message {
            WireMessage::DevicesUpdated { devices } => self.on_devices_updated(devices),
            WireMessage::MasterAssignment(assignment) => self.on_master_assignment(assignment),
            WireMessage::SyncState(message) => self.on_remote_message(message),
            WireMessage::SyncCommand(envelope) => self.on_remote_command(envelope),
            WireMessage::ConflictResolution(resolution) => self.on_conflict_resolution(resolution),
            other @ (WireMessage::Authenticate(_) | WireMessage::RegisterDevice(_)) => {
                tracing::warn!(kind = other.kind(), "hub-bound message delivered to device");
                Vec::new()
            }
        }
    }

    /// Run a peer's update through detection and resolution.
    pub fn on_remote_message(&mut self, message: SyncMessage) -> Vec<SyncEvent> {
        let mut events = Vec::new();
        if message.device_id == self.device.device_id {
            return events;
        }

        let fight_id = message.fight_id.clone();

        if self.is_authoritative(&message) {
            let state = self.store.apply_patch(
                &fight_id,
                &message.state,
                message.timestamp,
                &message.device_id,
            );
            tracing::debug!(fight = %fight_id, from = %message.device_id, "authoritative snapshot applied");
            events.push(SyncEvent::StateChanged {
                fight_id,
                checksum: state.checksum.clone(),
            });
            return events;
        }

        // Plain updates never carry lock changes
        let patch = FightStatePatch {
            lock: None,
            ..message.state.clone()
        };
        let current = self.store.get_or_create(&fight_id).clone();

        match self.detector.detect(&current, &message) {
            Detection::Apply => {
                let state =
                    self.store
                        .apply_patch(&fight_id, &patch, message.timestamp, &message.device_id);
                let actual = state.checksum.clone();
                events.push(SyncEvent::StateChanged {
                    fight_id: fight_id.clone(),
                    checksum: actual.clone(),
                });
                if actual != message.checksum {
                    self.on_checksum_mismatch(&fight_id, &message.checksum, actual, &mut events);
                }
            }
            reason @ (Detection::Stale | Detection::Duplicate) => {
                tracing::debug!(
                    fight = %fight_id,
                    from = %message.device_id,
                    reason = reason.as_str(),
                    "update dropped"
                );
                events.push(SyncEvent::MessageDropped { fight_id, reason });
            }
            Detection::Conflict => {
                let resolution = self.resolver.resolve(&current, &message, self.is_master());
                tracing::info!(
                    fight = %fight_id,
                    from = %message.device_id,
                    resolution = resolution.as_str(),
                    "conflict"
                );

                match resolution {
                    Resolution::MasterPriority => {
                        let floor = current.last_update.max(message.timestamp) + 1;
                        self.broadcast_resolution(&fight_id, floor);
                    }
                    Resolution::AcceptIncoming => {
                        let state = self.store.apply_patch(
                            &fight_id,
                            &patch,
                            message.timestamp,
                            &message.device_id,
                        );
                        events.push(SyncEvent::StateChanged {
                            fight_id: fight_id.clone(),
                            checksum: state.checksum.clone(),
                        });
                    }
                    Resolution::KeepLocal => {}
                }

                if !self.master.has_master() {
                    self.unresolved.insert(fight_id.clone());
                }
                events.push(SyncEvent::ConflictResolved {
                    fight_id,
                    resolution,
                });
            }
        }

        events
    }

    /// Critical snapshots from the known master, or served by the hub from
    /// its archive, bypass detection.
    fn is_authoritative(&self, message: &SyncMessage) -> bool {
        message.priority == Priority::Critical
            && (message.device_id == HUB_DEVICE_ID
                || self.master.is_master(&message.device_id))
    }

    fn on_checksum_mismatch(
        &mut self,
        fight_id: &str,
        expected: &str,
        actual: String,
        events: &mut Vec<SyncEvent>,
    ) {
        tracing::warn!(fight = %fight_id, %expected, %actual, "checksum mismatch");
        events.push(SyncEvent::ChecksumMismatch {
            fight_id: fight_id.to_string(),
            expected: expected.to_string(),
            actual,
        });

        if !self.config.force_sync_on_mismatch {
            return;
        }
        if !self.master.has_master() {
            tracing::debug!(fight = %fight_id, "no master to heal divergence");
            return;
        }
        if let Err(err) = self.force_sync(fight_id) {
            tracing::warn!(fight = %fight_id, error = %err, "force sync request failed");
        }
    }

    /// Stamp the local state past `floor` and announce it as the verdict.
    fn broadcast_resolution(&mut self, fight_id: &str, floor: i64) {
        let timestamp = self.clock.now_millis().max(floor);
        let state = self
            .store
            .restamp(fight_id, timestamp, &self.device.device_id);
        let resolution = ConflictResolution {
            fight_id: fight_id.to_string(),
            resolution: ResolutionKind::MasterPriority,
            state: FightStatePatch {
                lock: None,
                ..FightStatePatch::snapshot(state)
            },
            device_id: self.device.device_id.clone(),
            timestamp,
        };
        self.publish_or_warn(WireMessage::ConflictResolution(resolution));
    }

    /// Re-broadcast the full local state of a fight as the authority.
    fn broadcast_snapshot(&mut self, fight_id: &str) -> Result<(), SyncError> {
        let Some(last_update) = self.store.get(fight_id).map(|f| f.last_update) else {
            tracing::debug!(fight = %fight_id, "force sync for unknown fight");
            return Ok(());
        };

        let timestamp = self.clock.now_millis().max(last_update);
        let state = self
            .store
            .restamp(fight_id, timestamp, &self.device.device_id);
        let message = SyncMessage {
            fight_id: fight_id.to_string(),
            device_id: self.device.device_id.clone(),
            state: FightStatePatch::snapshot(state),
            timestamp,
            priority: Priority::Critical,
            checksum: state.checksum.clone(),
        };
        tracing::debug!(fight = %fight_id, checksum = %message.checksum, "snapshot broadcast");
        self.publish(WireMessage::SyncState(message))
    }

    fn on_conflict_resolution(&mut self, resolution: ConflictResolution) -> Vec<SyncEvent> {
        if self.is_master() {
            tracing::warn!(
                fight = %resolution.fight_id,
                from = %resolution.device_id,
                "resolution from another device while master, ignored"
            );
            return Vec::new();
        }

        let state = self.store.apply_patch(
            &resolution.fight_id,
            &FightStatePatch {
                lock: None,
                ..resolution.state
            },
            resolution.timestamp,
            &resolution.device_id,
        );
        let checksum = state.checksum.clone();
        self.unresolved.remove(&resolution.fight_id);

        vec![
            SyncEvent::StateChanged {
                fight_id: resolution.fight_id.clone(),
                checksum,
            },
            SyncEvent::ResolutionAccepted {
                fight_id: resolution.fight_id,
                master: resolution.device_id,
            },
        ]
    }

    fn on_remote_command(&mut self, envelope: CommandEnvelope) -> Vec<SyncEvent> {
        let CommandEnvelope {
            command,
            source_device,
            timestamp,
        } = envelope;

        match command {
            SyncCommand::LockFight { fight_id } => {
                match self
                    .locks
                    .lock(&mut self.store, &fight_id, &source_device, timestamp)
                {
                    LockOutcome::Acquired => vec![SyncEvent::LockChanged {
                        fight_id,
                        holder: Some(source_device),
                    }],
                    LockOutcome::AlreadyHeld => Vec::new(),
                    LockOutcome::AlreadyLocked { holder } => vec![SyncEvent::LockRejected {
                        fight_id,
                        requester: source_device,
                        holder: Some(holder),
                    }],
                }
            }
            SyncCommand::UnlockFight { fight_id } => {
                match self.locks.unlock(&mut self.store, &fight_id, &source_device) {
                    UnlockOutcome::Released => vec![SyncEvent::LockChanged {
                        fight_id,
                        holder: None,
                    }],
                    UnlockOutcome::NotLockHolder { holder } => vec![SyncEvent::LockRejected {
                        fight_id,
                        requester: source_device,
                        holder,
                    }],
                }
            }
            SyncCommand::RequestMaster {
                reason, priority, ..
            } => {
                if !self.is_master() {
                    return Vec::new();
                }
                let request = MasterRequest {
                    device_id: source_device,
                    reason,
                    priority,
                };
                let now = self.clock.now_millis();
                if let Some(assignment) = self.master.evaluate_request(&request, now) {
                    tracing::info!(to = %assignment.master_device_id, "handing over master role");
                    self.publish_or_warn(WireMessage::MasterAssignment(assignment));
                }
                Vec::new()
            }
            SyncCommand::ForceSync { fight_id } => {
                if self.is_master() {
                    if let Err(err) = self.broadcast_snapshot(&fight_id) {
                        tracing::warn!(fight = %fight_id, error = %err, "snapshot broadcast failed");
                    }
                }
                Vec::new()
            }
        }
    }

    fn on_devices_updated(&mut self, devices: Vec<Device>) -> Vec<SyncEvent> {
        let departed = self.registry.replace_all(devices);
        self.registry.set_master(self.master.current_master());

        let mut events = Vec::new();
        for device_id in departed {
            self.master.on_candidate_left(&device_id);
            for fight_id in self.locks.on_device_departed(&mut self.store, &device_id) {
                events.push(SyncEvent::LockChanged {
                    fight_id,
                    holder: None,
                });
            }
        }
        events.push(SyncEvent::DevicesChanged {
            count: self.registry.count(),
        });
        events
    }

    fn on_master_assignment(&mut self, assignment: MasterAssignment) -> Vec<SyncEvent> {
        let was_master = self.is_master();
        let reason = assignment.reason;
        let changed = self.master.apply_assignment(assignment);
        self.registry.set_master(self.master.current_master());

        let Some(master) = self.master.current_master().map(str::to_string) else {
            return Vec::new();
        };
        if !changed {
            return Vec::new();
        }

        let is_local = master == self.device.device_id;
        tracing::info!(
            device = %self.device.device_id,
            %master,
            reason = reason.as_str(),
            "master assignment applied"
        );

        let gap = std::mem::take(&mut self.unresolved);
        if is_local && !was_master && reason == AssignmentReason::FailureRecovery {
            for fight_id in &gap {
                self.broadcast_resolution(fight_id, 0);
            }
        }

        vec![SyncEvent::MasterChanged { master, is_local }]
    }

    /// End of session: forget everything.
    pub fn clear(&mut self) {
        self.store.clear();
        self.registry.clear();
        self.master.reset();
        self.unresolved.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::clock::ManualClock;
    use crate::sync::device::DeviceType;
    use crate::sync::fight::FightStatus;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    fn coordinator(id: &str, clock: &ManualClock) -> (SyncCoordinator, UnboundedReceiver<Envelope>) {
        let (tx, rx) = unbounded_channel();
        let coordinator = SyncCoordinator::new(
            Device::new(id, DeviceType::Tablet),
            SyncConfig::default(),
            Arc::new(clock.clone()),
            tx,
        );
        (coordinator, rx)
    }

    fn assign(coordinator: &mut SyncCoordinator, master: &str) {
        coordinator.handle(WireMessage::MasterAssignment(MasterAssignment::new(
            master,
            0,
            AssignmentReason::Initial,
        )));
    }

    fn drain(rx: &mut UnboundedReceiver<Envelope>) -> Vec<WireMessage> {
        let mut out = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            out.push(envelope.message);
        }
        out
    }

    #[test]
    fn test_local_change_publishes() {
        let clock = ManualClock::new(1_000);
        let (mut coord, mut rx) = coordinator("tab-a", &clock);

        let message = coord
            .on_local_change("K-101", FightStatePatch::new().fighter1_points(3), Priority::Normal)
            .unwrap();

        assert_eq!(message.timestamp, 1_000);
        assert_eq!(message.checksum, coord.fight("K-101").unwrap().checksum);
        assert_eq!(drain(&mut rx), vec![WireMessage::SyncState(message)]);
    }

    #[test]
    fn test_local_change_rejections() {
        let clock = ManualClock::new(1_000);
        let (mut coord, _rx) = coordinator("tab-a", &clock);

        let empty = coord.on_local_change("K-101", FightStatePatch::new(), Priority::Normal);
        assert!(matches!(empty, Err(SyncError::EmptyPatch(_))));

        coord.handle(WireMessage::SyncCommand(CommandEnvelope {
            command: SyncCommand::LockFight {
                fight_id: "K-101".to_string(),
            },
            source_device: "tab-b".to_string(),
            timestamp: 900,
        }));
        let locked =
            coord.on_local_change("K-101", FightStatePatch::new().fighter1_points(1), Priority::Normal);
        assert!(matches!(locked, Err(SyncError::FightLocked { .. })));
    }

    #[test]
    fn test_idempotent_apply() {
        let clock = ManualClock::new(5_000);
        let (mut coord, _rx) = coordinator("tab-c", &clock);
        let patch = FightStatePatch::new().fighter2_points(2);
        let message = SyncMessage {
            fight_id: "K-101".to_string(),
            device_id: "tab-a".to_string(),
            checksum: crate::sync::checksum::checksum(0, 2, FightStatus::Ready),
            state: patch,
            timestamp: 4_000,
            priority: Priority::Normal,
        };

        coord.on_remote_message(message.clone());
        let once = coord.fight("K-101").unwrap().clone();

        let events = coord.on_remote_message(message);
        assert_eq!(coord.fight("K-101").unwrap(), &once);
        assert!(matches!(
            events.as_slice(),
            [SyncEvent::MessageDropped {
                reason: Detection::Duplicate,
                ..
            }]
        ));
    }

    #[test]
    fn test_master_keeps_state_and_broadcasts() {
        let clock = ManualClock::new(1_000);
        let (mut coord, mut rx) = coordinator("tab-a", &clock);
        assign(&mut coord, "tab-a");

        coord
            .on_local_change("K-101", FightStatePatch::new().fighter1_points(3), Priority::Normal)
            .unwrap();
        drain(&mut rx);

        clock.set(1_150);
        let incoming = SyncMessage {
            fight_id: "K-101".to_string(),
            device_id: "tab-b".to_string(),
            state: FightStatePatch::new().fighter1_points(5),
            timestamp: 1_150,
            priority: Priority::Normal,
            checksum: String::new(),
        };
        coord.on_remote_message(incoming);

        let state = coord.fight("K-101").unwrap();
        assert_eq!(state.fighter1_points, 3);
        assert_eq!(state.last_update, 1_151);

        let sent = drain(&mut rx);
        let [WireMessage::ConflictResolution(resolution)] = sent.as_slice() else {
            panic!("expected a single conflict-resolution, got {sent:?}");
        };
        assert_eq!(resolution.resolution, ResolutionKind::MasterPriority);
        assert_eq!(resolution.state.fighter1_points, Some(3));
        assert_eq!(resolution.timestamp, 1_151);
    }

    #[test]
    fn test_checksum_mismatch_requests_force_sync() {
        let clock = ManualClock::new(1_000);
        let (mut coord, mut rx) = coordinator("tab-c", &clock);
        assign(&mut coord, "tab-a");

        let events = coord.on_remote_message(SyncMessage {
            fight_id: "K-101".to_string(),
            device_id: "tab-b".to_string(),
            state: FightStatePatch::new().fighter1_points(1),
            timestamp: 900,
            priority: Priority::Normal,
            checksum: "0000000000000000".to_string(),
        });

        assert!(events
            .iter()
            .any(|e| matches!(e, SyncEvent::ChecksumMismatch { .. })));
        let sent = drain(&mut rx);
        assert!(matches!(
            sent.as_slice(),
            [WireMessage::SyncCommand(CommandEnvelope {
                command: SyncCommand::ForceSync { .. },
                ..
            })]
        ));
    }

    #[test]
    fn test_non_master_ignores_request_master() {
        let clock = ManualClock::new(0);
        let (mut coord, mut rx) = coordinator("tab-c", &clock);
        assign(&mut coord, "tab-a");

        coord.handle(WireMessage::SyncCommand(CommandEnvelope {
            command: SyncCommand::RequestMaster {
                reason: RequestReason::DeviceFailure,
                priority: Priority::High,
                capabilities: Default::default(),
            },
            source_device: "tab-b".to_string(),
            timestamp: 0,
        }));
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_departed_device_releases_locks() {
        let clock = ManualClock::new(0);
        let (mut coord, _rx) = coordinator("tab-c", &clock);

        coord.handle(WireMessage::DevicesUpdated {
            devices: vec![
                Device::new("tab-b", DeviceType::Tablet),
                Device::new("tab-c", DeviceType::Tablet),
            ],
        });
        coord.handle(WireMessage::SyncCommand(CommandEnvelope {
            command: SyncCommand::LockFight {
                fight_id: "K-101".to_string(),
            },
            source_device: "tab-b".to_string(),
            timestamp: 10,
        }));
        assert_eq!(coord.lock_holder("K-101"), Some("tab-b"));

        let events = coord.handle(WireMessage::DevicesUpdated {
            devices: vec![Device::new("tab-c", DeviceType::Tablet)],
        });
        assert_eq!(coord.lock_holder("K-101"), None);
        assert!(events.contains(&SyncEvent::LockChanged {
            fight_id: "K-101".to_string(),
            holder: None,
        }));
    }

    fn request(from: &str, reason: RequestReason, priority: Priority) -> WireMessage {
        WireMessage::SyncCommand(CommandEnvelope {
            command: SyncCommand::RequestMaster {
                reason,
                priority,
                capabilities: Default::default(),
            },
            source_device: from.to_string(),
            timestamp: 0,
        })
    }

    fn devices(ids: &[&str]) -> WireMessage {
        WireMessage::DevicesUpdated {
            devices: ids.iter().map(|id| Device::new(*id, DeviceType::Tablet)).collect(),
        }
    }

    #[test]
    fn test_departed_candidate_cancels_transfer() {
        let clock = ManualClock::new(0);
        let (mut coord, mut rx) = coordinator("tab-a", &clock);
        assign(&mut coord, "tab-a");
        coord.handle(devices(&["tab-a", "tab-b", "tab-c"]));

        coord.handle(request("tab-b", RequestReason::UserRequest, Priority::High));
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [WireMessage::MasterAssignment(a)] if a.master_device_id == "tab-b"
        ));

        // Candidate leaves before the hand-off is broadcast back
        coord.handle(devices(&["tab-a", "tab-c"]));
        assert!(coord.is_master());

        coord.handle(request("tab-c", RequestReason::DeviceFailure, Priority::Normal));
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [WireMessage::MasterAssignment(a)] if a.master_device_id == "tab-c"
        ));
    }

    #[test]
    fn test_critical_local_change_downgraded() {
        let clock = ManualClock::new(1_000);
        let (mut coord, _rx) = coordinator("tab-b", &clock);

        let message = coord
            .on_local_change("K-101", FightStatePatch::new().fighter1_points(1), Priority::Critical)
            .unwrap();
        assert_eq!(message.priority, Priority::High);
    }

    #[test]
    fn test_critical_needs_master_or_hub_origin() {
        let clock = ManualClock::new(5_000);
        let (mut coord, _rx) = coordinator("tab-c", &clock);
        coord
            .on_local_change("K-101", FightStatePatch::new().fighter1_points(2), Priority::Normal)
            .unwrap();

        // No master known: an old critical update from a peer is still stale
        let peer = SyncMessage {
            fight_id: "K-101".to_string(),
            device_id: "tab-x".to_string(),
            state: FightStatePatch::new().fighter1_points(9),
            timestamp: 1_000,
            priority: Priority::Critical,
            checksum: String::new(),
        };
        let events = coord.on_remote_message(peer.clone());
        assert_eq!(coord.fight("K-101").unwrap().fighter1_points, 2);
        assert!(matches!(
            events.as_slice(),
            [SyncEvent::MessageDropped {
                reason: Detection::Stale,
                ..
            }]
        ));

        let archived = SyncMessage {
            device_id: HUB_DEVICE_ID.to_string(),
            checksum: crate::sync::checksum::checksum(9, 0, FightStatus::Ready),
            ..peer
        };
        coord.on_remote_message(archived);
        assert_eq!(coord.fight("K-101").unwrap().fighter1_points, 9);
    }
}
