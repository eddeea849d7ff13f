//! Fight state synchronization for a judging session.
//!
//! This module provides the sync types and managers:
//!
//! - `device` - Device registry (who is in the session, who is master)
//! - `master` - Master role state machine and election policy
//! - `fight` - Fight state replicas and the store that owns them
//! - `lock` - Advisory per-fight locks
//! - `conflict` - Conflict detection and resolution
//! - `coordinator` - Per-device pipeline tying the above together
//! - `hub` - Session fan-out, authentication and master authority
//! - `node` - Device event loop
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                            SessionHub                                 │
//! │   registry (authoritative) · master election · fan-out · archive     │
//! └───────▲──────────────────────────┬───────────────────────────────────┘
//!         │ Envelope (one queue)     │ WireMessage (one queue per device)
//! ┌───────┴──────────────────────────▼───────────────────────────────────┐
//! │                    DeviceNode ─▶ SyncCoordinator                      │
//! │                                                                      │
//! │  ┌────────────────┐  ┌──────────────────┐  ┌──────────────────────┐  │
//! │  │ DeviceRegistry │  │ MasterCoordinator│  │   FightStateStore    │  │
//! │  │ device_id →    │  │ NoMaster         │  │ fight_id →           │  │
//! │  │   Device       │  │   ▶ Elected      │  │   FightState         │  │
//! │  │                │  │   ▶ Transferring │  │ (scores, lock, csum) │  │
//! │  └────────────────┘  └──────────────────┘  └──────────▲───────────┘  │
//! │                                                       │              │
//! │            ConflictDetector ─▶ ConflictResolver ──────┤              │
//! │                                      LockManager ─────┘              │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! let mut hub = SessionHub::new(clock.clone(), Box::new(AllowAll));
//! let mut node = DeviceNode::join(&mut hub, device, &credentials, SyncConfig::default(), clock)?;
//! hub.pump();
//! node.pump();
//!
//! node.coordinator_mut()
//!     .on_local_change("K-101", FightStatePatch::new().fighter1_points(3), Priority::Normal)?;
//! ```

pub mod checksum;
pub mod clock;
pub mod config;
pub mod conflict;
pub mod coordinator;
pub mod device;
pub mod error;
pub mod fight;
pub mod hub;
pub mod lock;
pub mod master;
pub mod message;
pub mod node;

// Re-export commonly used types
pub use checksum::checksum;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{SyncConfig, DEFAULT_CONFLICT_WINDOW_MS};
pub use conflict::{ConflictDetector, ConflictResolver, Detection, Resolution};
pub use coordinator::{SyncCoordinator, SyncEvent};
pub use device::{
    Capabilities, Device, DeviceId, DeviceRegistry, DeviceRole, DeviceType, Registration, Viewport,
};
pub use error::SyncError;
pub use fight::{FightId, FightState, FightStatePatch, FightStateStore, FightStatus, LockSnapshot};
pub use hub::{AllowAll, DeviceLink, FightArchive, SessionHub, StaticTokens, TokenValidator, HUB_DEVICE_ID};
pub use lock::{LockManager, LockOutcome, UnlockOutcome};
pub use master::{InvalidTransition, MasterCoordinator, MasterEvent, MasterRequest, MasterState};
pub use message::{
    AssignmentReason, Authenticate, CommandEnvelope, ConflictResolution, Envelope,
    MasterAssignment, Priority, RegisterDevice, RequestReason, ResolutionKind, SyncCommand,
    SyncMessage, WireMessage,
};
pub use node::{Credentials, DeviceNode};
