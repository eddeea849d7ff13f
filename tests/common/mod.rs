//! Shared harness: one hub, a set of device nodes and a manual clock.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use fight_sync::{
    AllowAll, Credentials, Device, DeviceNode, DeviceType, FightArchive, ManualClock, SessionHub,
    SyncConfig, SyncCoordinator, SyncEvent,
};

const MAX_ROUNDS: usize = 1_000;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub struct Session {
    pub clock: ManualClock,
    pub hub: SessionHub,
    pub credentials: Credentials,
    nodes: BTreeMap<String, DeviceNode>,
}

impl Session {
    pub fn new(start: i64) -> Self {
        init_tracing();
        let clock = ManualClock::new(start);
        let hub = SessionHub::new(Arc::new(clock.clone()), Box::new(AllowAll));
        Self {
            clock,
            hub,
            credentials: Credentials::new("judge-token", "scorekeeper"),
            nodes: BTreeMap::new(),
        }
    }

    pub fn with_archive(mut self, archive: Box<dyn FightArchive>) -> Self {
        self.hub = SessionHub::new(Arc::new(self.clock.clone()), Box::new(AllowAll)).with_archive(archive);
        self
    }

    /// Join a device and let the session settle.
    pub fn join(&mut self, device_id: &str) {
        let node = DeviceNode::join(
            &mut self.hub,
            Device::new(device_id, DeviceType::Tablet),
            &self.credentials,
            SyncConfig::default(),
            Arc::new(self.clock.clone()),
        )
        .unwrap();
        self.nodes.insert(device_id.to_string(), node);
        self.settle();
    }

    /// Cut a device off the hub. Its node keeps its local state.
    pub fn drop_link(&mut self, device_id: &str) {
        self.hub.disconnect(device_id).unwrap();
        self.settle();
    }

    pub fn reconnect(&mut self, device_id: &str) {
        let node = self.nodes.get_mut(device_id).unwrap();
        node.reconnect(&mut self.hub, &self.credentials).unwrap();
        self.settle();
    }

    /// Pump the hub and every node until no message is in flight.
    pub fn settle(&mut self) {
        for _ in 0..MAX_ROUNDS {
            let mut handled = self.hub.pump();
            for node in self.nodes.values_mut() {
                handled += node.pump();
            }
            if handled == 0 {
                return;
            }
        }
        panic!("session did not settle after {MAX_ROUNDS} rounds");
    }

    /// Handle what is queued for one device only.
    pub fn pump_node(&mut self, device_id: &str) -> usize {
        self.nodes.get_mut(device_id).unwrap().pump()
    }

    pub fn node(&self, device_id: &str) -> &SyncCoordinator {
        self.nodes[device_id].coordinator()
    }

    pub fn node_mut(&mut self, device_id: &str) -> &mut SyncCoordinator {
        self.nodes.get_mut(device_id).unwrap().coordinator_mut()
    }

    pub fn events(&mut self, device_id: &str) -> Vec<SyncEvent> {
        self.nodes.get_mut(device_id).unwrap().take_events()
    }

    pub fn device_ids(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    /// Checksums of `fight_id` on every connected node, keyed by device.
    pub fn checksums(&self, fight_id: &str) -> BTreeMap<String, Option<String>> {
        self.nodes
            .iter()
            .filter(|(id, _)| self.hub.is_connected(id))
            .map(|(id, node)| {
                let checksum = node.coordinator().fight(fight_id).map(|f| f.checksum.clone());
                (id.clone(), checksum)
            })
            .collect()
    }
}
