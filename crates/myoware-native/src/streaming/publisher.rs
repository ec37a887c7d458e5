//! Event publishers.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::processing::Sample;

/// Event name used on the wire.
pub const EMG_EVENT_NAME: &str = "emg_data";

/// One forwarded sample.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmgEvent {
    /// Capture time, `YYYY-MM-DD HH:MM:SS.mmm`
    pub timestamp: String,
    /// Originating shield
    #[serde(rename = "deviceId")]
    pub device_id: String,
    /// Raw ADC value
    pub value: u16,
}

impl From<&Sample> for EmgEvent {
    fn from(sample: &Sample) -> Self {
        Self {
            timestamp: sample.timestamp.to_string(),
            device_id: sample.shield.to_string(),
            value: sample.value,
        }
    }
}

/// Named event wrapper sent to WebSocket clients.
#[derive(Clone, Debug, Serialize)]
pub struct EventEnvelope<'a> {
    /// Event name
    pub event: &'static str,
    /// Event payload
    pub data: &'a EmgEvent,
}

impl<'a> EventEnvelope<'a> {
    /// Wrap an EMG event.
    pub fn emg(data: &'a EmgEvent) -> Self {
        Self {
            event: EMG_EVENT_NAME,
            data,
        }
    }
}

/// Publishing errors.
#[derive(Debug, Error)]
pub enum PublishError {
    /// Nobody is listening
    #[error("No subscribers")]
    NoSubscribers,
}

/// Result type for publishing.
pub type PublishResult<T> = Result<T, PublishError>;

/// Fire-and-forget sink for forwarded samples.
pub trait EventPublisher: Send + Sync {
    /// Hand one event to the consumer. Must not block.
    ///
    /// # Errors
    ///
    /// Returns an error if the event could not be delivered.
    fn publish(&self, event: EmgEvent) -> PublishResult<()>;
}

/// Fans events out to every current subscriber.
#[derive(Clone, Debug)]
pub struct BroadcastPublisher {
    tx: broadcast::Sender<EmgEvent>,
}

impl BroadcastPublisher {
    /// Create a publisher buffering up to `capacity` events per lagging subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to future events.
    pub fn subscribe(&self) -> broadcast::Receiver<EmgEvent> {
        self.tx.subscribe()
    }

    /// Current subscriber count.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for BroadcastPublisher {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventPublisher for BroadcastPublisher {
    fn publish(&self, event: EmgEvent) -> PublishResult<()> {
        self.tx
            .send(event)
            .map(|_| ())
            .map_err(|_| PublishError::NoSubscribers)
    }
}

/// Logs events at `info` instead of sending them anywhere.
#[derive(Copy, Clone, Debug, Default)]
pub struct TracingPublisher;

impl EventPublisher for TracingPublisher {
    fn publish(&self, event: EmgEvent) -> PublishResult<()> {
        tracing::info!(
            device = %event.device_id,
            timestamp = %event.timestamp,
            value = event.value,
            "EMG sample"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::ShieldId;
    use crate::clock::Timestamp;

    fn event(value: u16) -> EmgEvent {
        EmgEvent {
            timestamp: "2024-02-25 12:34:56.789".to_string(),
            device_id: "AA:BB".to_string(),
            value,
        }
    }

    #[test]
    fn test_event_from_sample() {
        let sample = Sample {
            timestamp: Timestamp::from_epoch_millis(1_708_864_496_789),
            elapsed_ms: 0,
            value: 512,
            shield: ShieldId::from("AA:BB"),
        };

        assert_eq!(EmgEvent::from(&sample), event(512));
    }

    #[test]
    fn test_envelope_json() {
        let data = event(7);
        let json = serde_json::to_value(EventEnvelope::emg(&data)).unwrap();

        assert_eq!(json["event"], "emg_data");
        assert_eq!(json["data"]["deviceId"], "AA:BB");
        assert_eq!(json["data"]["timestamp"], "2024-02-25 12:34:56.789");
        assert_eq!(json["data"]["value"], 7);
    }

    #[test]
    fn test_broadcast_without_subscribers_fails() {
        let publisher = BroadcastPublisher::new(4);
        assert!(matches!(publisher.publish(event(1)), Err(PublishError::NoSubscribers)));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_subscriber() {
        let publisher = BroadcastPublisher::new(4);
        let mut rx = publisher.subscribe();

        publisher.publish(event(9)).unwrap();

        assert_eq!(rx.recv().await.unwrap(), event(9));
        assert_eq!(publisher.subscriber_count(), 1);
    }
}
