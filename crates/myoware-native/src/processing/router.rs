//! Mode routing.
//!
//! Decoded samples go one of two ways, fixed for the lifetime of the run:
//! - standalone: the latest sample of each notification lands in the
//!   shield's barrier slot
//! - host forwarding: every sample is published as an [`EmgEvent`]

use std::collections::HashMap;

use myoware_core::types::RunningMode;

use super::barrier::{AggregationBarrier, BarrierConfig, ReportingCycle};
use super::decoder::Sample;
use crate::bridge::ShieldId;
use crate::streaming::{EmgEvent, EventPublisher};

/// What happened to one notification's samples.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Notification carried no whole sample
    Empty,
    /// Shield has no barrier slot
    UnknownShield,
    /// Sample recorded, cycle still open
    Recorded,
    /// Sample recorded and it completed a cycle
    CycleCompleted(ReportingCycle),
    /// Samples handed to the publisher
    Forwarded {
        /// Events accepted by the publisher
        published: usize,
        /// Events the publisher rejected
        failed: usize,
    },
}

/// Router counters.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RouterStats {
    /// Notifications routed
    pub notifications: u64,
    /// Samples seen
    pub samples: u64,
    /// Cycles completed (standalone)
    pub completed_cycles: u64,
    /// Events published (host forwarding)
    pub forwarded: u64,
    /// Events the publisher rejected
    pub publish_failures: u64,
    /// Runs of consecutive rejections, each logged once
    pub publish_outages: u64,
    /// Notifications dropped for unknown shields
    pub dropped: u64,
}

enum Route {
    Standalone {
        barrier: AggregationBarrier,
        slots: HashMap<ShieldId, usize>,
    },
    HostForwarding {
        publisher: Box<dyn EventPublisher>,
        buffer: Vec<EmgEvent>,
        failing: bool,
    },
}

/// Dispatches decoded samples according to the running mode.
pub struct ModeRouter {
    route: Route,
    stats: RouterStats,
}

impl ModeRouter {
    /// Standalone router with one barrier slot per shield, in the given order.
    pub fn standalone(slot_order: &[ShieldId], config: BarrierConfig) -> Self {
        let slots = slot_order
            .iter()
            .enumerate()
            .map(|(index, shield)| (shield.clone(), index))
            .collect();

        Self {
            route: Route::Standalone {
                barrier: AggregationBarrier::new(slot_order.len(), config),
                slots,
            },
            stats: RouterStats::default(),
        }
    }

    /// Host-forwarding router publishing through `publisher`.
    pub fn host_forwarding(publisher: Box<dyn EventPublisher>) -> Self {
        Self {
            route: Route::HostForwarding {
                publisher,
                buffer: Vec::new(),
                failing: false,
            },
            stats: RouterStats::default(),
        }
    }

    /// Router for `mode`.
    pub fn for_mode(
        mode: RunningMode,
        slot_order: &[ShieldId],
        config: BarrierConfig,
        publisher: Box<dyn EventPublisher>,
    ) -> Self {
        match mode {
            RunningMode::Standalone => Self::standalone(slot_order, config),
            RunningMode::HostForwarding => Self::host_forwarding(publisher),
        }
    }

    /// Mode this router was built for.
    pub fn mode(&self) -> RunningMode {
        match self.route {
            Route::Standalone { .. } => RunningMode::Standalone,
            Route::HostForwarding { .. } => RunningMode::HostForwarding,
        }
    }

    /// Counters so far.
    pub fn stats(&self) -> RouterStats {
        self.stats
    }

    /// Barrier slot of a shield (standalone only).
    pub fn slot_of(&self, shield: &ShieldId) -> Option<usize> {
        match &self.route {
            Route::Standalone { slots, .. } => slots.get(shield).copied(),
            Route::HostForwarding { .. } => None,
        }
    }

    /// Route the samples of one notification from `shield`.
    pub fn route(&mut self, shield: &ShieldId, samples: Vec<Sample>) -> RouteOutcome {
        self.stats.notifications += 1;
        self.stats.samples += samples.len() as u64;

        match &mut self.route {
            Route::Standalone { barrier, slots } => {
                let Some(&index) = slots.get(shield) else {
                    tracing::warn!(%shield, "Notification from shield without a slot, dropping");
                    self.stats.dropped += 1;
                    return RouteOutcome::UnknownShield;
                };
                let Some(latest) = samples.into_iter().last() else {
                    return RouteOutcome::Empty;
                };

                match barrier.record(index, latest) {
                    Ok(Some(cycle)) => {
                        self.stats.completed_cycles += 1;
                        tracing::info!(
                            sequence = cycle.sequence,
                            values = ?cycle.values(),
                            "All shields reported"
                        );
                        RouteOutcome::CycleCompleted(cycle)
                    }
                    Ok(None) => RouteOutcome::Recorded,
                    Err(e) => {
                        tracing::warn!(%shield, error = %e, "Barrier rejected sample");
                        self.stats.dropped += 1;
                        RouteOutcome::UnknownShield
                    }
                }
            }
            Route::HostForwarding {
                publisher,
                buffer,
                failing,
            } => {
                if samples.is_empty() {
                    return RouteOutcome::Empty;
                }

                buffer.extend(samples.iter().map(EmgEvent::from));
                if tracing::enabled!(tracing::Level::DEBUG) {
                    if let Ok(json) = serde_json::to_string(&*buffer) {
                        tracing::debug!(%shield, buffer = %json, "Forwarding samples");
                    }
                }

                let mut published = 0;
                let mut failed = 0;
                for event in buffer.drain(..) {
                    match publisher.publish(event) {
                        Ok(()) => {
                            published += 1;
                            if std::mem::take(failing) {
                                tracing::info!(%shield, "Publishing resumed");
                            }
                            tracing::trace!(%shield, "Data sent successfully");
                        }
                        Err(e) if *failing => {
                            failed += 1;
                            tracing::debug!(%shield, error = %e, "Error sending data");
                        }
                        Err(e) => {
                            failed += 1;
                            *failing = true;
                            self.stats.publish_outages += 1;
                            tracing::warn!(
                                %shield,
                                error = %e,
                                "Error sending data; further failures logged at debug"
                            );
                        }
                    }
                }

                self.stats.forwarded += published as u64;
                self.stats.publish_failures += failed as u64;
                RouteOutcome::Forwarded { published, failed }
            }
        }
    }

    /// Events waiting in the forwarding buffer (always empty between calls).
    pub fn pending(&self) -> usize {
        match &self.route {
            Route::Standalone { .. } => 0,
            Route::HostForwarding { buffer, .. } => buffer.len(),
        }
    }
}
