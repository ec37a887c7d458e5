//! Wire protocol for MyoWare shield notifications
//!
//! Shields expose a single custom GATT service with one notify
//! characteristic. Every notification carries a batch of 16-bit samples:
//!
//! ```text
//! +--------+--------+--------+--------+-----+
//! | s0 hi  | s0 lo  | s1 hi  | s1 lo  | ... |
//! +--------+--------+--------+--------+-----+
//! ```
//!
//! - Samples are unsigned, big-endian, oldest first
//! - Samples are taken at a fixed peripheral interval (10 ms)
//! - The newest sample was taken at the moment the batch was received
//! - A trailing odd byte is not a sample and is ignored

use core::slice::ChunksExact;

// ============================================================================
// GATT Identifiers
// ============================================================================

/// MyoWare EMG service UUID (`ec3af789-2154-49f4-a9fc-bc6c88e9e930`).
///
/// Must match shield firmware bit for bit.
pub const EMG_SERVICE_UUID: u128 = 0xec3a_f789_2154_49f4_a9fc_bc6c_88e9_e930;

/// MyoWare EMG notify characteristic UUID (`f3a56edf-8f1e-4533-93bf-5601b2e91308`).
pub const EMG_CHARACTERISTIC_UUID: u128 = 0xf3a5_6edf_8f1e_4533_93bf_5601_b2e9_1308;

// ============================================================================
// Payload Layout
// ============================================================================

/// Bytes per sample in a notification payload.
pub const SAMPLE_WIDTH: usize = 2;

/// Spacing between consecutive samples on the shield, in milliseconds.
pub const PERIPHERAL_INTERVAL_MS: u32 = 10;

/// Number of whole samples in a payload of `len` bytes.
#[inline]
#[must_use]
pub const fn sample_count(len: usize) -> usize {
    len / SAMPLE_WIDTH
}

/// Elapsed local time at which sample `index` of a `count`-sample batch was
/// captured, given the batch arrived at `received_ms`.
///
/// Index 0 is the oldest sample; index `count - 1` maps to `received_ms`.
#[inline]
#[must_use]
#[allow(clippy::cast_possible_wrap)]
pub const fn capture_elapsed_ms(
    received_ms: i64,
    count: usize,
    index: usize,
    interval_ms: u32,
) -> i64 {
    let steps_back = count.saturating_sub(1).saturating_sub(index) as i64;
    received_ms - steps_back * interval_ms as i64
}

/// Iterator over the big-endian samples of a notification payload.
#[derive(Clone, Debug)]
pub struct PayloadSamples<'a> {
    chunks: ChunksExact<'a, u8>,
}

impl Iterator for PayloadSamples<'_> {
    type Item = u16;

    fn next(&mut self) -> Option<u16> {
        self.chunks
            .next()
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.chunks.size_hint()
    }
}

impl ExactSizeIterator for PayloadSamples<'_> {}

/// Decode the raw samples of a payload, dropping a trailing odd byte.
#[must_use]
pub fn samples(payload: &[u8]) -> PayloadSamples<'_> {
    PayloadSamples {
        chunks: payload.chunks_exact(SAMPLE_WIDTH),
    }
}

/// Decode a payload into `(capture_elapsed_ms, value)` pairs, oldest first.
pub fn timed_samples(
    payload: &[u8],
    received_ms: i64,
    interval_ms: u32,
) -> impl Iterator<Item = (i64, u16)> + '_ {
    let count = sample_count(payload.len());
    samples(payload)
        .enumerate()
        .map(move |(i, value)| (capture_elapsed_ms(received_ms, count, i, interval_ms), value))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use std::vec::Vec;

    #[test]
    fn test_uuid_constants_match_firmware() {
        assert_eq!(EMG_SERVICE_UUID, 0xEC3AF789_2154_49F4_A9FC_BC6C88E9E930);
        assert_eq!(EMG_CHARACTERISTIC_UUID, 0xF3A56EDF_8F1E_4533_93BF_5601B2E91308);
    }

    #[test]
    fn test_samples_big_endian() {
        let payload = [0x01, 0x02, 0xFF, 0xFF, 0x00, 0x00];
        let values: Vec<u16> = samples(&payload).collect();
        assert_eq!(values, [0x0102, 0xFFFF, 0x0000]);
    }

    #[test]
    fn test_odd_trailing_byte_dropped() {
        let payload = [0x00, 0x0A, 0x00, 0x14, 0x7F];
        let values: Vec<u16> = samples(&payload).collect();
        assert_eq!(values, [10, 20]);
        assert_eq!(samples(&payload).len(), sample_count(payload.len()));
    }

    #[test]
    fn test_empty_and_single_byte_payloads() {
        assert_eq!(samples(&[]).count(), 0);
        assert_eq!(samples(&[0xAB]).count(), 0);
        assert_eq!(timed_samples(&[0xAB], 500, 10).count(), 0);
    }

    #[test]
    fn test_timed_samples_reference_batch() {
        let payload = [0x00, 10, 0x00, 20, 0x00, 30];
        let timed: Vec<(i64, u16)> =
            timed_samples(&payload, 1000, PERIPHERAL_INTERVAL_MS).collect();
        assert_eq!(timed, [(980, 10), (990, 20), (1000, 30)]);
    }

    #[test]
    fn test_capture_times_strictly_increase_by_interval() {
        let payload: Vec<u8> = (0u16..40).flat_map(u16::to_be_bytes).collect();
        let times: Vec<i64> = timed_samples(&payload, 5_000, 10).map(|(t, _)| t).collect();

        assert_eq!(times.len(), 40);
        assert_eq!(*times.last().unwrap(), 5_000);
        for pair in times.windows(2) {
            assert_eq!(pair[1] - pair[0], 10);
        }
    }

    #[test]
    fn test_capture_times_may_precede_anchor() {
        // A batch arriving right after boot reaches back before the anchor
        let payload = [0, 1, 0, 2, 0, 3];
        let first = timed_samples(&payload, 5, 10).next().unwrap();
        assert_eq!(first, (-15, 1));
    }
}
