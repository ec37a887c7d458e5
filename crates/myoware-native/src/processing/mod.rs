//! Sample processing pipeline
//!
//! Notifications flow through three stages:
//! - [`decoder`]: Raw payload to timestamped samples
//! - [`barrier`]: Cross-shield reporting-cycle aggregation (standalone mode)
//! - [`router`]: Dispatch to the barrier or to the forwarding publisher

pub mod barrier;
pub mod decoder;
pub mod router;

pub use barrier::{AggregationBarrier, BarrierConfig, BarrierError, BarrierStats, ReportingCycle};
pub use decoder::{NotificationDecoder, Sample};
pub use router::{ModeRouter, RouteOutcome, RouterStats};
