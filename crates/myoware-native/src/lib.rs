//! MyoWare Native - Host-side coordinator for wireless EMG shields
//!
//! This crate runs on the central and drives a fleet of MyoWare wireless
//! shields from discovery to aggregated samples:
//! - Clock anchoring against a network time source
//! - One-shot remote configuration fetch with fallback defaults
//! - BLE discovery, connection with bounded retries, notification subscription
//! - Per-sample timestamp reconstruction
//! - Cross-shield reporting-cycle aggregation or host forwarding
//!
//! # Modules
//!
//! - [`bridge`]: Link layer abstraction, shield registry, connection manager
//! - [`clock`]: Clock anchor and time sources
//! - [`config`]: Remote configuration sources and coordinator settings
//! - [`processing`]: Notification decoding, aggregation barrier, mode routing
//! - [`streaming`]: Outbound event publishing for host-forwarding mode
//! - [`coordinator`]: Startup sequence and event loop tying it all together

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod bridge;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod processing;
pub mod streaming;

// Re-export key types
pub use bridge::{
    ConnectionManager, LinkEvent, LinkLayer, LinkState, LinkTable, RetryPolicy, ShieldId,
    ShieldRegistry, SimulatedLink,
};
pub use clock::{ClockAnchor, Timestamp};
pub use config::{CoordinatorConfig, RemoteConfigFetcher};
pub use coordinator::{Coordinator, Summary};
pub use processing::{AggregationBarrier, ModeRouter, NotificationDecoder, ReportingCycle, Sample};
pub use streaming::{BroadcastPublisher, EmgEvent, EventPublisher};
