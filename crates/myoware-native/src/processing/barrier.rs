//! Cross-shield aggregation barrier.
//!
//! One slot per connected shield. A reporting cycle completes the moment
//! every slot has been written since the last completion; the filled
//! samples are handed out and the slots reset under the same lock, so each
//! cycle is emitted exactly once.
//!
//! A shield that writes twice before the cycle completes overwrites its
//! earlier value. A shield that never writes holds the cycle open
//! indefinitely unless [`BarrierConfig::cycle_timeout`] is set.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;

use super::decoder::Sample;

/// Barrier settings.
#[derive(Copy, Clone, Debug, Default)]
pub struct BarrierConfig {
    /// Discard a partial cycle that has been open this long
    pub cycle_timeout: Option<Duration>,
}

/// Errors from the aggregation barrier.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BarrierError {
    /// Slot index beyond the barrier size
    #[error("Slot index {index} out of range for {size} slots")]
    IndexOutOfRange {
        /// Requested slot
        index: usize,
        /// Number of slots
        size: usize,
    },
}

/// Result type for barrier operations.
pub type BarrierResult<T> = Result<T, BarrierError>;

/// One complete reporting cycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReportingCycle {
    /// Completed cycles before this one
    pub sequence: u64,
    /// One sample per slot, in slot order
    pub samples: Vec<Sample>,
}

impl ReportingCycle {
    /// Sample values in slot order.
    pub fn values(&self) -> Vec<u16> {
        self.samples.iter().map(|s| s.value).collect()
    }
}

/// Barrier counters.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BarrierStats {
    /// Cycles emitted
    pub completed_cycles: u64,
    /// Partial cycles discarded by the timeout
    pub abandoned_cycles: u64,
    /// Writes that replaced a value in the same cycle
    pub overwrites: u64,
}

#[derive(Debug)]
struct BarrierState {
    slots: Vec<Option<Sample>>,
    filled: usize,
    opened_at: Option<Instant>,
    stats: BarrierStats,
}

impl BarrierState {
    fn reset(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
        self.filled = 0;
        self.opened_at = None;
    }
}

/// Per-cycle completion tracker across all connected shields.
#[derive(Debug)]
pub struct AggregationBarrier {
    config: BarrierConfig,
    state: Mutex<BarrierState>,
}

impl AggregationBarrier {
    /// Create a barrier with `size` slots.
    pub fn new(size: usize, config: BarrierConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BarrierState {
                slots: vec![None; size],
                filled: 0,
                opened_at: None,
                stats: BarrierStats::default(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BarrierState> {
        // Every critical section leaves the state consistent before it can panic
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of slots.
    pub fn size(&self) -> usize {
        self.lock().slots.len()
    }

    /// Slots written in the open cycle.
    pub fn filled(&self) -> usize {
        self.lock().filled
    }

    /// Counters so far.
    pub fn stats(&self) -> BarrierStats {
        self.lock().stats
    }

    /// Record `sample` in slot `index`.
    ///
    /// Returns the completed cycle if this write filled the last empty slot.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError::IndexOutOfRange`] if `index` is not a slot.
    pub fn record(&self, index: usize, sample: Sample) -> BarrierResult<Option<ReportingCycle>> {
        self.record_at(index, sample, Instant::now())
    }

    /// Record with an explicit current instant for the cycle timeout.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError::IndexOutOfRange`] if `index` is not a slot.
    pub fn record_at(
        &self,
        index: usize,
        sample: Sample,
        now: Instant,
    ) -> BarrierResult<Option<ReportingCycle>> {
        let mut state = self.lock();
        let size = state.slots.len();
        if index >= size {
            return Err(BarrierError::IndexOutOfRange { index, size });
        }

        if let (Some(timeout), Some(opened)) = (self.config.cycle_timeout, state.opened_at) {
            if now.saturating_duration_since(opened) > timeout {
                tracing::warn!(
                    filled = state.filled,
                    size,
                    "Reporting cycle timed out, discarding partial samples"
                );
                state.stats.abandoned_cycles += 1;
                state.reset();
            }
        }

        if state.opened_at.is_none() {
            state.opened_at = Some(now);
        }

        if state.slots[index].replace(sample).is_some() {
            state.stats.overwrites += 1;
        } else {
            state.filled += 1;
        }

        if state.filled < size {
            return Ok(None);
        }

        let samples = state.slots.iter_mut().filter_map(Option::take).collect();
        let cycle = ReportingCycle {
            sequence: state.stats.completed_cycles,
            samples,
        };
        state.stats.completed_cycles += 1;
        state.reset();
        Ok(Some(cycle))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::bridge::ShieldId;
    use crate::clock::Timestamp;

    fn sample(value: u16) -> Sample {
        Sample {
            timestamp: Timestamp::from_epoch_millis(0),
            elapsed_ms: 0,
            value,
            shield: ShieldId::from("test"),
        }
    }

    #[test]
    fn test_two_slot_cycle() {
        let barrier = AggregationBarrier::new(2, BarrierConfig::default());

        assert_eq!(barrier.record(0, sample(100)).unwrap(), None);
        let cycle = barrier.record(1, sample(200)).unwrap().unwrap();
        assert_eq!(cycle.values(), vec![100, 200]);
        assert_eq!(cycle.sequence, 0);

        // Slots were reset: one write alone does not complete
        assert_eq!(barrier.record(0, sample(300)).unwrap(), None);
        assert_eq!(barrier.filled(), 1);
        assert_eq!(barrier.stats().completed_cycles, 1);
    }

    #[test]
    fn test_latest_value_wins() {
        let barrier = AggregationBarrier::new(3, BarrierConfig::default());

        barrier.record(0, sample(1)).unwrap();
        barrier.record(0, sample(2)).unwrap();
        barrier.record(2, sample(30)).unwrap();
        barrier.record(0, sample(3)).unwrap();
        let cycle = barrier.record(1, sample(20)).unwrap().unwrap();

        assert_eq!(cycle.values(), vec![3, 20, 30]);
        assert_eq!(barrier.stats().overwrites, 2);
    }

    #[test]
    fn test_out_of_range_is_error() {
        let barrier = AggregationBarrier::new(2, BarrierConfig::default());
        assert_eq!(
            barrier.record(2, sample(1)),
            Err(BarrierError::IndexOutOfRange { index: 2, size: 2 })
        );

        let empty = AggregationBarrier::new(0, BarrierConfig::default());
        assert!(empty.record(0, sample(1)).is_err());
    }

    #[test]
    fn test_single_slot_completes_every_write() {
        let barrier = AggregationBarrier::new(1, BarrierConfig::default());
        for i in 0..5 {
            let cycle = barrier.record(0, sample(i)).unwrap().unwrap();
            assert_eq!(cycle.sequence, u64::from(i));
        }
    }

    #[test]
    fn test_fires_exactly_once_under_concurrency() {
        const SLOTS: usize = 4;
        const ROUNDS: usize = 250;

        let barrier = Arc::new(AggregationBarrier::new(SLOTS, BarrierConfig::default()));
        let gate = Arc::new(std::sync::Barrier::new(SLOTS));

        let handles: Vec<_> = (0..SLOTS)
            .map(|slot| {
                let barrier = Arc::clone(&barrier);
                let gate = Arc::clone(&gate);
                std::thread::spawn(move || {
                    let mut completions = 0usize;
                    for round in 0..ROUNDS {
                        gate.wait();
                        let value = u16::try_from(round).unwrap();
                        if barrier.record(slot, sample(value)).unwrap().is_some() {
                            completions += 1;
                        }
                        gate.wait();
                    }
                    completions
                })
            })
            .collect();

        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

        assert_eq!(total, ROUNDS);
        assert_eq!(barrier.stats().completed_cycles, ROUNDS as u64);
        assert_eq!(barrier.filled(), 0);
    }

    #[test]
    fn test_cycle_timeout_discards_partial_cycle() {
        let config = BarrierConfig {
            cycle_timeout: Some(Duration::from_millis(50)),
        };
        let barrier = AggregationBarrier::new(2, config);
        let t0 = Instant::now();

        barrier.record_at(0, sample(1), t0).unwrap();
        // Slot 0 from the stale cycle must not leak into the new one
        assert_eq!(
            barrier.record_at(1, sample(2), t0 + Duration::from_millis(100)).unwrap(),
            None
        );
        assert_eq!(barrier.stats().abandoned_cycles, 1);

        let cycle = barrier
            .record_at(0, sample(3), t0 + Duration::from_millis(110))
            .unwrap()
            .unwrap();
        assert_eq!(cycle.values(), vec![3, 2]);
    }

    #[test]
    fn test_no_timeout_keeps_partial_cycle_open() {
        let barrier = AggregationBarrier::new(2, BarrierConfig::default());
        let t0 = Instant::now();

        barrier.record_at(0, sample(1), t0).unwrap();
        let cycle = barrier
            .record_at(1, sample(2), t0 + Duration::from_secs(3600))
            .unwrap()
            .unwrap();

        assert_eq!(cycle.values(), vec![1, 2]);
        assert_eq!(barrier.stats().abandoned_cycles, 0);
    }
}
