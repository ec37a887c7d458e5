//! Link-layer bridges and connection management
//!
//! This module owns everything between the radio and the decoder:
//! - [`link`]: The [`LinkLayer`] trait, shield identifiers and link events
//! - [`ble`]: Bluetooth Low Energy transport via btleplug (requires `ble` feature)
//! - [`simulated`]: In-process shields for tests and offline runs
//! - [`registry`]: Shields discovered during the scan window
//! - [`connection`]: Connect-with-retry and subscription bookkeeping
//!
//! # Event Flow
//!
//! Link layers never call back into the coordinator. Advertisements,
//! notifications and disconnects are pushed as [`LinkEvent`]s onto the
//! channel handed out when the link layer is created:
//!
//! ```rust,ignore
//! use myoware_native::bridge::{ConnectionManager, LinkEvent, ShieldRegistry, SimulatedLink};
//!
//! let (link, mut events) = SimulatedLink::builder().emg_shields(2).build();
//! let registry = ShieldRegistry::new();
//!
//! link.start_scan(EMG_SERVICE).await?;
//! while let Some(LinkEvent::Advertisement { shield, services, .. }) = events.recv().await {
//!     registry.on_advertisement(&shield, &services);
//! }
//! ```

#[cfg(feature = "ble")]
pub mod ble;

pub mod connection;
pub mod link;
pub mod registry;
pub mod simulated;

// Re-export key types
pub use connection::{ConnectionManager, Link, LinkState, LinkTable, RetryPolicy};
pub use link::{
    LinkError, LinkEvent, LinkLayer, LinkResult, ShieldId, EMG_CHARACTERISTIC, EMG_SERVICE,
    EVENT_CHANNEL_CAPACITY,
};
pub use registry::ShieldRegistry;
pub use simulated::{ShieldScript, SimulatedLink, SimulatedLinkBuilder};

#[cfg(feature = "ble")]
pub use ble::BleLink;
