//! Outbound event streaming
//!
//! In host-forwarding mode every decoded sample leaves the central as one
//! [`EmgEvent`] through an [`EventPublisher`]:
//!
//! - [`BroadcastPublisher`]: fans events out over a tokio broadcast channel,
//!   from which the app's WebSocket server feeds connected clients
//! - [`TracingPublisher`]: writes events to the log, for runs without a
//!   consumer
//!
//! # Wire Format
//!
//! ```json
//! {"event":"emg_data","data":{"timestamp":"2024-02-25 12:34:56.789","deviceId":"AA:BB:CC:DD:EE:FF","value":1234}}
//! ```

pub mod publisher;

pub use publisher::{
    BroadcastPublisher, EmgEvent, EventEnvelope, EventPublisher, PublishError, PublishResult,
    TracingPublisher, EMG_EVENT_NAME,
};
