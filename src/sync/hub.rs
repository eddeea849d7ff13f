//! Session hub.
//!
//! In-process stand-in for the publish/subscribe channel of a session. The hub
//! authenticates devices, keeps the authoritative registry and master
//! assignment, and fans messages out to subscriber channels. Of fight state it
//! only tracks lock holders, in the order it relayed lock commands, so that a
//! joining device can be brought up to date.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use super::clock::Clock;
use super::device::{Device, DeviceId, DeviceRegistry};
use super::error::SyncError;
use super::fight::{FightState, FightStatePatch, FightStateStore};
use super::lock::LockManager;
use super::master::MasterCoordinator;
use super::message::{
    AssignmentReason, Authenticate, CommandEnvelope, Envelope, MasterAssignment, Priority,
    SyncCommand, SyncMessage, WireMessage,
};

/// Origin id used for snapshots the hub serves from its archive.
pub const HUB_DEVICE_ID: &str = "hub";

/// Validates bearer tokens issued by the external auth provider.
pub trait TokenValidator: Send + Sync {
    fn validate(&self, token: &str, user_type: &str) -> bool;
}

/// Accepts every token. For closed networks and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl TokenValidator for AllowAll {
    fn validate(&self, _token: &str, _user_type: &str) -> bool {
        true
    }
}

/// Fixed set of accepted tokens.
#[derive(Debug, Clone, Default)]
pub struct StaticTokens {
    tokens: HashSet<String>,
}

impl StaticTokens {
    pub fn new(tokens: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
        }
    }
}

impl TokenValidator for StaticTokens {
    fn validate(&self, token: &str, _user_type: &str) -> bool {
        self.tokens.contains(token)
    }
}

/// Last known fight states kept by the external persistence layer.
pub trait FightArchive: Send + Sync {
    fn last_known(&self, fight_id: &str) -> Option<FightState>;
}

/// What a device gets back from `connect`.
#[derive(Debug)]
pub struct DeviceLink {
    pub device_id: DeviceId,
    /// Hub -> device
    pub inbox: UnboundedReceiver<WireMessage>,
    /// Device -> hub
    pub outbox: UnboundedSender<Envelope>,
}

pub struct SessionHub {
    clock: Arc<dyn Clock>,
    validator: Box<dyn TokenValidator>,
    archive: Option<Box<dyn FightArchive>>,

    registry: DeviceRegistry,
    master: MasterCoordinator,
    subscribers: BTreeMap<DeviceId, UnboundedSender<WireMessage>>,

    /// Lock holders as relayed so far; only the lock fields are used
    locks: LockManager,
    lock_table: FightStateStore,

    inbound_tx: UnboundedSender<Envelope>,
    inbound_rx: UnboundedReceiver<Envelope>,
}

impl SessionHub {
    pub fn new(clock: Arc<dyn Clock>, validator: Box<dyn TokenValidator>) -> Self {
        let (inbound_tx, inbound_rx) = unbounded_channel();
        Self {
            clock,
            validator,
            archive: None,
            registry: DeviceRegistry::new(),
            master: MasterCoordinator::new(),
            subscribers: BTreeMap::new(),
            locks: LockManager::default(),
            lock_table: FightStateStore::new(),
            inbound_tx,
            inbound_rx,
        }
    }

    pub fn with_archive(mut self, archive: Box<dyn FightArchive>) -> Self {
        self.archive = Some(archive);
        self
    }

    /// Must match the devices' `auto_unlock_on_disconnect` setting.
    pub fn with_auto_unlock(mut self, auto_unlock_on_disconnect: bool) -> Self {
        self.locks = LockManager::new(auto_unlock_on_disconnect);
        self
    }

    /// Authoritative device list.
    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Current master, if one is assigned.
    pub fn master(&self) -> Option<&str> {
        self.master.current_master()
    }

    /// Check if a device has an open channel.
    pub fn is_connected(&self, device_id: &str) -> bool {
        self.subscribers.contains_key(device_id)
    }

    /// Lock holder of a fight as last relayed by the hub.
    pub fn lock_holder(&self, fight_id: &str) -> Option<&str> {
        self.locks.holder(&self.lock_table, fight_id)
    }

    /// Authenticate a device and open its channels.
    ///
    /// A second connect for the same id replaces the old channel, which closes.
    pub fn connect(&mut self, auth: Authenticate) -> Result<DeviceLink, SyncError> {
        if auth.device_id == HUB_DEVICE_ID {
            tracing::warn!(device = %auth.device_id, "reserved device id rejected");
            return Err(SyncError::Unauthorized(auth.device_id));
        }
        if !self.validator.validate(&auth.token, &auth.user_type) {
            tracing::warn!(device = %auth.device_id, user_type = %auth.user_type, "authentication rejected");
            return Err(SyncError::Unauthorized(auth.device_id));
        }

        let (tx, rx) = unbounded_channel();
        if self.subscribers.insert(auth.device_id.clone(), tx).is_some() {
            tracing::info!(device = %auth.device_id, "device reconnected, old channel replaced");
        } else {
            tracing::info!(device = %auth.device_id, "device connected");
        }

        Ok(DeviceLink {
            device_id: auth.device_id,
            inbox: rx,
            outbox: self.inbound_tx.clone(),
        })
    }

    /// Drop a device: unregister it and re-elect if it was master.
    pub fn disconnect(&mut self, device_id: &str) -> Result<(), SyncError> {
        if self.subscribers.remove(device_id).is_none() {
            return Err(SyncError::NotConnected(device_id.to_string()));
        }
        tracing::info!(device = %device_id, "device disconnected");

        if self.registry.unregister(device_id).is_none() {
            return Ok(());
        }
        self.locks.on_device_departed(&mut self.lock_table, device_id);

        let now = self.clock.now_millis();
        let assignment = self
            .master
            .on_device_left(device_id, self.registry.ids(), now);
        self.registry.set_master(self.master.current_master());

        self.broadcast_devices();
        if let Some(assignment) = assignment {
            self.broadcast(&WireMessage::MasterAssignment(assignment));
        }
        Ok(())
    }

    /// Route every queued inbound message. Returns how many were handled.
    pub fn pump(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(envelope) = self.inbound_rx.try_recv() {
            self.route(envelope);
            handled += 1;
        }
        handled
    }

    fn route(&mut self, envelope: Envelope) {
        let Envelope { from, message } = envelope;
        if !self.subscribers.contains_key(&from) {
            tracing::debug!(device = %from, kind = message.kind(), "message from disconnected device dropped");
            return;
        }

        match message {
            WireMessage::RegisterDevice(request) => {
                if request.device_id != from {
                    tracing::warn!(device = %from, claimed = %request.device_id, "register for another device dropped");
                    return;
                }
                self.on_register(request.to_device());
            }
            WireMessage::SyncState(_) => self.broadcast_except(&from, &message),
            WireMessage::SyncCommand(envelope) => self.on_command(&from, envelope),
            WireMessage::MasterAssignment(assignment) => self.on_assignment(&from, assignment),
            WireMessage::ConflictResolution(_) => {
                if self.master.is_master(&from) {
                    self.broadcast_except(&from, &message);
                } else {
                    tracing::warn!(device = %from, "conflict resolution from non-master dropped");
                }
            }
            WireMessage::Authenticate(_) | WireMessage::DevicesUpdated { .. } => {
                tracing::debug!(device = %from, kind = message.kind(), "unexpected message dropped");
            }
        }
    }

    fn on_register(&mut self, device: Device) {
        let device_id = device.device_id.clone();
        let device_type = device.device_type.as_str();
        let registration = self.registry.register(device);
        tracing::debug!(device = %device_id, device_type, ?registration, "device registered");

        let elected = self
            .master
            .on_device_joined(&device_id, self.clock.now_millis());
        self.registry.set_master(self.master.current_master());
        self.broadcast_devices();

        match elected {
            Some(assignment) => self.broadcast(&WireMessage::MasterAssignment(assignment)),
            None => {
                if let Some(current) = self.master.assignment().cloned() {
                    self.send_to(&device_id, WireMessage::MasterAssignment(current));
                }
            }
        }
        self.replay_locks(&device_id);
    }

    /// Send a joining device one lock command per held lock, ahead of any
    /// lock traffic relayed after its registration.
    fn replay_locks(&self, device_id: &str) {
        let mut fights: Vec<_> = self.lock_table.fight_ids().collect();
        fights.sort();
        for fight_id in fights {
            let Some(state) = self.lock_table.get(fight_id) else {
                continue;
            };
            let Some(holder) = state.locked_by.clone() else {
                continue;
            };
            tracing::debug!(device = %device_id, fight = %fight_id, %holder, "replaying lock");
            self.send_to(
                device_id,
                WireMessage::SyncCommand(CommandEnvelope {
                    command: SyncCommand::LockFight {
                        fight_id: fight_id.clone(),
                    },
                    source_device: holder,
                    timestamp: state.locked_at.unwrap_or_default(),
                }),
            );
        }
    }

    fn on_command(&mut self, from: &str, envelope: CommandEnvelope) {
        if envelope.source_device != from {
            tracing::warn!(device = %from, claimed = %envelope.source_device, "spoofed command dropped");
            return;
        }

        tracing::debug!(
            device = %from,
            command = envelope.command.name(),
            fight = ?envelope.command.fight_id(),
            "command relayed"
        );

        let lock_command = match &envelope.command {
            SyncCommand::LockFight { fight_id } => {
                self.locks.lock(
                    &mut self.lock_table,
                    fight_id,
                    &envelope.source_device,
                    envelope.timestamp,
                );
                true
            }
            SyncCommand::UnlockFight { fight_id } => {
                self.locks
                    .unlock(&mut self.lock_table, fight_id, &envelope.source_device);
                true
            }
            _ => false,
        };
        let archive_fight = match &envelope.command {
            SyncCommand::ForceSync { fight_id } if !self.master.has_master() => {
                Some(fight_id.clone())
            }
            _ => None,
        };

        if lock_command {
            // Everyone, sender included, applies lock requests in hub order
            self.broadcast(&WireMessage::SyncCommand(envelope));
        } else if let Some(fight_id) = archive_fight {
            self.serve_from_archive(from, &fight_id);
        } else {
            self.broadcast_except(from, &WireMessage::SyncCommand(envelope));
        }
    }

    fn on_assignment(&mut self, from: &str, assignment: MasterAssignment) {
        let valid = assignment.reason == AssignmentReason::Transfer
            && self.master.is_master(from)
            && self.registry.contains(&assignment.master_device_id);
        if !valid {
            tracing::warn!(
                device = %from,
                to = %assignment.master_device_id,
                reason = assignment.reason.as_str(),
                "master assignment rejected"
            );
            return;
        }

        tracing::info!(from = %from, to = %assignment.master_device_id, "master transferred");
        self.master.apply_assignment(assignment.clone());
        self.registry.set_master(self.master.current_master());
        self.broadcast_devices();
        self.broadcast(&WireMessage::MasterAssignment(assignment));
    }

    /// Answer a force sync while nobody is master.
    fn serve_from_archive(&self, to: &str, fight_id: &str) {
        let Some(state) = self.archive.as_ref().and_then(|a| a.last_known(fight_id)) else {
            tracing::debug!(fight = %fight_id, "force sync without master or archive");
            return;
        };

        let message = SyncMessage {
            fight_id: fight_id.to_string(),
            device_id: HUB_DEVICE_ID.to_string(),
            state: FightStatePatch::snapshot(&state),
            timestamp: state.last_update,
            priority: Priority::Critical,
            checksum: state.compute_checksum(),
        };
        self.send_to(to, WireMessage::SyncState(message));
    }

    fn broadcast_devices(&self) {
        self.broadcast(&WireMessage::DevicesUpdated {
            devices: self.registry.list(),
        });
    }

    fn send_to(&self, device_id: &str, message: WireMessage) {
        if let Some(tx) = self.subscribers.get(device_id) {
            if tx.send(message).is_err() {
                tracing::warn!(device = %device_id, "subscriber channel closed");
            }
        }
    }

    fn broadcast(&self, message: &WireMessage) {
        for device_id in self.subscribers.keys() {
            self.send_to(device_id, message.clone());
        }
    }

    fn broadcast_except(&self, skip: &str, message: &WireMessage) {
        for device_id in self.subscribers.keys().filter(|id| id.as_str() != skip) {
            self.send_to(device_id, message.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::clock::ManualClock;
    use crate::sync::device::{Capabilities, DeviceType};
    use crate::sync::fight::FightStatus;
    use crate::sync::message::RegisterDevice;

    fn auth(id: &str, token: &str) -> Authenticate {
        Authenticate {
            token: token.to_string(),
            user_type: "scorekeeper".to_string(),
            device_id: id.to_string(),
            capabilities: Capabilities::default(),
        }
    }

    fn hub() -> SessionHub {
        SessionHub::new(Arc::new(ManualClock::new(100)), Box::new(AllowAll))
    }

    fn join(hub: &mut SessionHub, id: &str) -> DeviceLink {
        let link = hub.connect(auth(id, "t")).unwrap();
        link.outbox
            .send(Envelope {
                from: id.to_string(),
                message: WireMessage::RegisterDevice(RegisterDevice {
                    device_id: id.to_string(),
                    device_type: DeviceType::Tablet,
                    capabilities: Capabilities::default(),
                    timestamp: 100,
                }),
            })
            .unwrap();
        hub.pump();
        link
    }

    fn drain(link: &mut DeviceLink) -> Vec<WireMessage> {
        let mut out = Vec::new();
        while let Ok(message) = link.inbox.try_recv() {
            out.push(message);
        }
        out
    }

    #[test]
    fn test_rejects_bad_token() {
        let mut hub = SessionHub::new(
            Arc::new(ManualClock::new(0)),
            Box::new(StaticTokens::new(["judge-token"])),
        );
        assert!(matches!(
            hub.connect(auth("tab-a", "nope")),
            Err(SyncError::Unauthorized(_))
        ));
        assert!(hub.connect(auth("tab-a", "judge-token")).is_ok());
    }

    #[test]
    fn test_first_registration_elects_master() {
        let mut hub = hub();
        let mut a = join(&mut hub, "tab-a");

        assert_eq!(hub.master(), Some("tab-a"));
        let received = drain(&mut a);
        assert!(matches!(received[0], WireMessage::DevicesUpdated { .. }));
        assert!(matches!(
            &received[1],
            WireMessage::MasterAssignment(MasterAssignment {
                reason: AssignmentReason::Initial,
                ..
            })
        ));
    }

    #[test]
    fn test_late_joiner_learns_master() {
        let mut hub = hub();
        let _a = join(&mut hub, "tab-a");
        let mut b = join(&mut hub, "tab-b");

        let received = drain(&mut b);
        assert!(received.iter().any(|m| matches!(
            m,
            WireMessage::MasterAssignment(a) if a.master_device_id == "tab-a"
        )));
    }

    #[test]
    fn test_master_disconnect_reelects() {
        let mut hub = hub();
        let _m = join(&mut hub, "tab-m");
        let mut c = join(&mut hub, "tab-c");
        let _z = join(&mut hub, "tab-z");
        drain(&mut c);

        hub.disconnect("tab-m").unwrap();
        assert_eq!(hub.master(), Some("tab-c"));
        assert!(hub.registry().get("tab-c").unwrap().is_master());

        let received = drain(&mut c);
        assert!(received.iter().any(|m| matches!(
            m,
            WireMessage::MasterAssignment(a) if a.reason == AssignmentReason::FailureRecovery
        )));
        assert!(hub.disconnect("tab-m").is_err());
    }

    #[test]
    fn test_transfer_only_from_master() {
        let mut hub = hub();
        let a = join(&mut hub, "tab-a");
        let b = join(&mut hub, "tab-b");

        b.outbox
            .send(Envelope {
                from: "tab-b".to_string(),
                message: WireMessage::MasterAssignment(MasterAssignment::new(
                    "tab-b",
                    1,
                    AssignmentReason::Transfer,
                )),
            })
            .unwrap();
        hub.pump();
        assert_eq!(hub.master(), Some("tab-a"));

        a.outbox
            .send(Envelope {
                from: "tab-a".to_string(),
                message: WireMessage::MasterAssignment(MasterAssignment::new(
                    "tab-b",
                    2,
                    AssignmentReason::Transfer,
                )),
            })
            .unwrap();
        hub.pump();
        assert_eq!(hub.master(), Some("tab-b"));
    }

    #[test]
    fn test_lock_commands_echo_to_sender() {
        let mut hub = hub();
        let mut a = join(&mut hub, "tab-a");
        let mut b = join(&mut hub, "tab-b");
        drain(&mut a);
        drain(&mut b);

        a.outbox
            .send(Envelope {
                from: "tab-a".to_string(),
                message: WireMessage::SyncCommand(CommandEnvelope {
                    command: SyncCommand::LockFight {
                        fight_id: "K-101".to_string(),
                    },
                    source_device: "tab-a".to_string(),
                    timestamp: 5,
                }),
            })
            .unwrap();
        hub.pump();

        assert_eq!(drain(&mut a).len(), 1);
        assert_eq!(drain(&mut b).len(), 1);
    }

    struct OneFight;

    impl FightArchive for OneFight {
        fn last_known(&self, fight_id: &str) -> Option<FightState> {
            let mut state = FightState::new(fight_id);
            state.fighter1_points = 7;
            state.status = FightStatus::Finished;
            state.last_update = 50;
            state.checksum = state.compute_checksum();
            Some(state)
        }
    }

    #[test]
    fn test_force_sync_served_from_archive_without_master() {
        let mut hub = SessionHub::new(Arc::new(ManualClock::new(0)), Box::new(AllowAll))
            .with_archive(Box::new(OneFight));
        let mut d = hub.connect(auth("tab-d", "t")).unwrap();
        // Connected but never registered, so no master exists
        d.outbox
            .send(Envelope {
                from: "tab-d".to_string(),
                message: WireMessage::SyncCommand(CommandEnvelope {
                    command: SyncCommand::ForceSync {
                        fight_id: "K-101".to_string(),
                    },
                    source_device: "tab-d".to_string(),
                    timestamp: 0,
                }),
            })
            .unwrap();
        hub.pump();

        let received = drain(&mut d);
        let [WireMessage::SyncState(snapshot)] = received.as_slice() else {
            panic!("expected archived snapshot, got {received:?}");
        };
        assert_eq!(snapshot.device_id, HUB_DEVICE_ID);
        assert_eq!(snapshot.priority, Priority::Critical);
        assert_eq!(snapshot.state.fighter1_points, Some(7));
    }

    fn lock(link: &DeviceLink, fight_id: &str) {
        link.outbox
            .send(Envelope {
                from: link.device_id.clone(),
                message: WireMessage::SyncCommand(CommandEnvelope {
                    command: SyncCommand::LockFight {
                        fight_id: fight_id.to_string(),
                    },
                    source_device: link.device_id.clone(),
                    timestamp: 7,
                }),
            })
            .unwrap();
    }

    #[test]
    fn test_late_joiner_receives_held_locks() {
        let mut hub = hub();
        let _a = join(&mut hub, "tab-a");
        let b = join(&mut hub, "tab-b");
        lock(&b, "K-101");
        hub.pump();
        assert_eq!(hub.lock_holder("K-101"), Some("tab-b"));

        let mut c = join(&mut hub, "tab-c");
        let replayed: Vec<CommandEnvelope> = drain(&mut c)
            .into_iter()
            .filter_map(|m| match m {
                WireMessage::SyncCommand(envelope) => Some(envelope),
                _ => None,
            })
            .collect();
        assert_eq!(
            replayed,
            vec![CommandEnvelope {
                command: SyncCommand::LockFight {
                    fight_id: "K-101".to_string()
                },
                source_device: "tab-b".to_string(),
                timestamp: 7,
            }]
        );
    }

    #[test]
    fn test_disconnect_clears_lock_table() {
        let mut hub = hub();
        let _a = join(&mut hub, "tab-a");
        let b = join(&mut hub, "tab-b");
        lock(&b, "K-101");
        hub.pump();

        hub.disconnect("tab-b").unwrap();
        assert_eq!(hub.lock_holder("K-101"), None);

        let mut c = join(&mut hub, "tab-c");
        assert!(!drain(&mut c)
            .iter()
            .any(|m| matches!(m, WireMessage::SyncCommand(_))));
    }

    #[test]
    fn test_rejects_reserved_device_id() {
        let mut hub = hub();
        assert!(matches!(
            hub.connect(auth(HUB_DEVICE_ID, "t")),
            Err(SyncError::Unauthorized(_))
        ));
    }
}
