//! Fight Sync Library
//!
//! This crate keeps every scoring device at a combat-sports event in agreement
//! on the state of each fight.
//!
//! # Overview
//!
//! The sync module provides:
//!
//! - **Device Registry** - Tracks which devices are in the session and which
//!   one currently holds the master role.
//!
//! - **Master Coordination** - Elects the first device as master, hands the
//!   role over on request and re-elects when the master drops out.
//!
//! - **Fight State Replicas** - Scores, status and lock per fight, with a
//!   content checksum for divergence detection.
//!
//! - **Conflict Handling** - Near-simultaneous updates are detected and
//!   settled by master priority, or by recency when no master is known.
//!
//! - **Session Hub** - In-process fan-out standing in for the session's
//!   publish/subscribe channel.
//!
//! # Design Principles
//!
//! 1. **Eventual consistency** - Replicas converge; there is no consensus round.
//!
//! 2. **One writer per replica** - Only the fight store mutates fight state.
//!
//! 3. **No shared memory** - Devices talk only through channels.
//!
//! 4. **Serialization-ready** - Every wire type round-trips through JSON.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use fight_sync::{
//!     AllowAll, Credentials, Device, DeviceNode, DeviceType, FightStatePatch, ManualClock,
//!     Priority, SessionHub, SyncConfig,
//! };
//!
//! let clock = Arc::new(ManualClock::new(1_000));
//! let mut hub = SessionHub::new(clock.clone(), Box::new(AllowAll));
//! let credentials = Credentials::new("token", "scorekeeper");
//!
//! let mut a = DeviceNode::join(
//!     &mut hub,
//!     Device::new("tab-a", DeviceType::Tablet),
//!     &credentials,
//!     SyncConfig::default(),
//!     clock.clone(),
//! )
//! .unwrap();
//! let mut b = DeviceNode::join(
//!     &mut hub,
//!     Device::new("tab-b", DeviceType::Tablet),
//!     &credentials,
//!     SyncConfig::default(),
//!     clock.clone(),
//! )
//! .unwrap();
//! hub.pump();
//! a.pump();
//! b.pump();
//! assert!(a.coordinator().is_master());
//!
//! a.coordinator_mut()
//!     .on_local_change("K-101", FightStatePatch::new().fighter1_points(3), Priority::Normal)
//!     .unwrap();
//! hub.pump();
//! b.pump();
//!
//! assert_eq!(b.coordinator().fight("K-101").unwrap().fighter1_points, 3);
//! ```

pub mod sync;

pub use sync::*;
