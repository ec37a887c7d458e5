//! Notification decoding.

use std::time::Instant;

use myoware_core::protocol::{sample_count, timed_samples};

use crate::bridge::ShieldId;
use crate::clock::{ClockAnchor, Timestamp};

/// One decoded EMG sample.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sample {
    /// Absolute capture time
    pub timestamp: Timestamp,
    /// Capture time as milliseconds since the clock anchor
    pub elapsed_ms: i64,
    /// Raw ADC value
    pub value: u16,
    /// Originating shield
    pub shield: ShieldId,
}

/// Turns notification payloads into timestamped samples.
///
/// The last sample of a payload is stamped with the receive time; earlier
/// samples step back one peripheral interval each.
#[derive(Copy, Clone, Debug)]
pub struct NotificationDecoder {
    anchor: ClockAnchor,
    interval_ms: u32,
}

impl NotificationDecoder {
    /// Create a decoder for shields sampling every `interval_ms`.
    pub fn new(anchor: ClockAnchor, interval_ms: u32) -> Self {
        Self {
            anchor,
            interval_ms,
        }
    }

    /// Clock anchor used for timestamps.
    pub fn anchor(&self) -> &ClockAnchor {
        &self.anchor
    }

    /// Decode a payload received at the local instant `received_at`.
    pub fn decode_at(
        &self,
        shield: &ShieldId,
        payload: &[u8],
        received_at: Instant,
    ) -> Vec<Sample> {
        self.decode(shield, payload, self.anchor.elapsed_millis(received_at))
    }

    /// Decode a payload received `received_elapsed_ms` after the anchor.
    ///
    /// A trailing odd byte is dropped.
    pub fn decode(
        &self,
        shield: &ShieldId,
        payload: &[u8],
        received_elapsed_ms: i64,
    ) -> Vec<Sample> {
        if payload.len() % 2 != 0 {
            tracing::trace!(%shield, len = payload.len(), "Dropping trailing odd byte");
        }

        let mut out = Vec::with_capacity(sample_count(payload.len()));
        let timed = timed_samples(payload, received_elapsed_ms, self.interval_ms);
        out.extend(timed.map(|(elapsed_ms, value)| Sample {
            timestamp: self.anchor.resolve(elapsed_ms),
            elapsed_ms,
            value,
            shield: shield.clone(),
        }));
        out
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn decoder() -> NotificationDecoder {
        NotificationDecoder::new(ClockAnchor::new(1_708_864_496_000, Instant::now()), 10)
    }

    fn be(values: &[u16]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_be_bytes()).collect()
    }

    #[test]
    fn test_three_samples_step_back_from_receive_time() {
        let shield = ShieldId::from("A");
        let samples = decoder().decode(&shield, &be(&[10, 20, 30]), 1000);

        let pairs: Vec<(i64, u16)> = samples.iter().map(|s| (s.elapsed_ms, s.value)).collect();
        assert_eq!(pairs, vec![(980, 10), (990, 20), (1000, 30)]);

        assert_eq!(samples[0].timestamp.to_string(), "2024-02-25 12:34:56.980");
        assert_eq!(samples[2].timestamp.to_string(), "2024-02-25 12:34:57.000");
        assert!(samples.iter().all(|s| s.shield == shield));
    }

    #[test]
    fn test_odd_byte_dropped() {
        let mut payload = be(&[1, 2]);
        payload.push(0xFF);

        let samples = decoder().decode(&ShieldId::from("A"), &payload, 500);

        assert_eq!(samples.len(), 2);
        assert_eq!(samples[1].value, 2);
    }

    #[test]
    fn test_empty_and_single_byte_payloads() {
        let d = decoder();
        assert!(d.decode(&ShieldId::from("A"), &[], 0).is_empty());
        assert!(d.decode(&ShieldId::from("A"), &[7], 0).is_empty());
    }

    #[test]
    fn test_decode_is_deterministic() {
        let d = decoder();
        let payload = be(&[4095, 0, 1234, 77]);
        let shield = ShieldId::from("A");

        assert_eq!(d.decode(&shield, &payload, 250), d.decode(&shield, &payload, 250));
    }

    #[test]
    fn test_timestamps_strictly_increase_by_interval() {
        let payload = be(&[1; 16]);
        let samples = decoder().decode(&ShieldId::from("A"), &payload, 10_000);

        for pair in samples.windows(2) {
            let step = pair[1].timestamp.epoch_millis() - pair[0].timestamp.epoch_millis();
            assert_eq!(step, 10);
        }
    }

    #[test]
    fn test_decode_at_uses_anchor_elapsed_time() {
        let boot = Instant::now();
        let d = NotificationDecoder::new(ClockAnchor::new(0, boot), 10);

        let received_at = boot + Duration::from_millis(2000);
        let samples = d.decode_at(&ShieldId::from("A"), &be(&[5, 6]), received_at);

        assert_eq!(samples[0].elapsed_ms, 1990);
        assert_eq!(samples[1].elapsed_ms, 2000);
    }
}
