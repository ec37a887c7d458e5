//! MyoWare Core - `no_std` compatible types and wire helpers
//!
//! This crate provides the pieces of the MyoWare central that do not need an
//! allocator or an operating system: the well-known GATT identifiers shared
//! with shield firmware, the notification payload layout, the per-sample
//! capture-time math, and the remote configuration document.
//!
//! # Modules
//!
//! - [`protocol`]: GATT identifiers and notification payload decoding
//! - [`types`]: Running mode, connection parameters, remote configuration
//! - [`error`]: Error types for parsing configuration values
//!
//! # Example
//!
//! ```rust
//! use myoware_core::protocol::{timed_samples, PERIPHERAL_INTERVAL_MS};
//!
//! // Three big-endian samples received 1000 ms after boot
//! let payload = [0x00, 10, 0x00, 20, 0x00, 30];
//! let samples: Vec<(i64, u16)> =
//!     timed_samples(&payload, 1000, PERIPHERAL_INTERVAL_MS).collect();
//!
//! assert_eq!(samples, vec![(980, 10), (990, 20), (1000, 30)]);
//! ```

#![no_std]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

#[cfg(feature = "std")]
extern crate std;

pub mod error;
pub mod protocol;
pub mod types;

// Re-export commonly used types at crate root
pub use error::ModeParseError;
pub use protocol::{
    EMG_CHARACTERISTIC_UUID, EMG_SERVICE_UUID, PERIPHERAL_INTERVAL_MS, SAMPLE_WIDTH,
};
pub use types::{ConnectionParams, RemoteConfig, RunningMode};
