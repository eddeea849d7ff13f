//! Device event loop.
//!
//! A node pairs a coordinator with the device's single inbound queue. Every
//! inbound message and every local action runs on the node one at a time.

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;

use super::clock::Clock;
use super::config::SyncConfig;
use super::coordinator::{SyncCoordinator, SyncEvent};
use super::device::Device;
use super::error::SyncError;
use super::hub::SessionHub;
use super::message::{Authenticate, WireMessage};

/// Bearer credentials presented on `authenticate`.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub token: String,
    pub user_type: String,
}

impl Credentials {
    pub fn new(token: impl Into<String>, user_type: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            user_type: user_type.into(),
        }
    }

    fn authenticate(&self, device: &Device) -> Authenticate {
        Authenticate {
            token: self.token.clone(),
            user_type: self.user_type.clone(),
            device_id: device.device_id.clone(),
            capabilities: device.capabilities.clone(),
        }
    }
}

pub struct DeviceNode {
    coordinator: SyncCoordinator,
    inbox: UnboundedReceiver<WireMessage>,
    events: Vec<SyncEvent>,
}

impl DeviceNode {
    /// Authenticate with the hub and register the device.
    pub fn join(
        hub: &mut SessionHub,
        device: Device,
        credentials: &Credentials,
        config: SyncConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, SyncError> {
        let link = hub.connect(credentials.authenticate(&device))?;
        let coordinator = SyncCoordinator::new(device, config, clock, link.outbox);
        coordinator.register()?;

        Ok(Self {
            coordinator,
            inbox: link.inbox,
            events: Vec::new(),
        })
    }

    /// Rejoin after an outage and ask the master for every known fight.
    pub fn reconnect(&mut self, hub: &mut SessionHub, credentials: &Credentials) -> Result<(), SyncError> {
        let link = hub.connect(credentials.authenticate(self.coordinator.device()))?;
        self.coordinator.set_outbox(link.outbox);
        self.inbox = link.inbox;
        tracing::info!(device = %self.coordinator.device_id(), "rejoining session");

        self.coordinator.register()?;
        self.coordinator.resync_all()
    }

    pub fn coordinator(&self) -> &SyncCoordinator {
        &self.coordinator
    }

    pub fn coordinator_mut(&mut self) -> &mut SyncCoordinator {
        &mut self.coordinator
    }

    /// Events collected since the last call.
    pub fn take_events(&mut self) -> Vec<SyncEvent> {
        std::mem::take(&mut self.events)
    }

    /// Handle everything queued right now. Returns how many messages ran.
    pub fn pump(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(message) = self.inbox.try_recv() {
            self.dispatch(message);
            handled += 1;
        }
        handled
    }

    /// Process messages until the hub closes this device's channel.
    pub async fn run(mut self) -> Self {
        while let Some(message) = self.inbox.recv().await {
            self.dispatch(message);
        }
        tracing::debug!(device = %self.coordinator.device_id(), "inbox closed");
        self
    }

    fn dispatch(&mut self, message: WireMessage) {
        tracing::trace!(device = %self.coordinator.device_id(), kind = message.kind(), "inbound");
        let events = self.coordinator.handle(message);
        self.events.extend(events);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::clock::ManualClock;
    use crate::sync::device::DeviceType;
    use crate::sync::hub::AllowAll;

    #[tokio::test]
    async fn test_run_drains_until_disconnect() {
        let clock = Arc::new(ManualClock::new(0));
        let mut hub = SessionHub::new(clock.clone(), Box::new(AllowAll));
        let credentials = Credentials::new("t", "scorekeeper");

        let node = DeviceNode::join(
            &mut hub,
            Device::new("tab-a", DeviceType::Tablet),
            &credentials,
            SyncConfig::default(),
            clock,
        )
        .unwrap();
        hub.pump();
        hub.disconnect("tab-a").unwrap();

        let mut node = node.run().await;
        assert!(node.coordinator().is_master());
        assert!(node
            .take_events()
            .iter()
            .any(|e| matches!(e, SyncEvent::MasterChanged { is_local: true, .. })));
    }
}
