//! Simulated link layer.
//!
//! Stands in for a BLE stack with a scripted set of shields. Used by the
//! test suite and by the `--device simulate` mode of the app.
//!
//! Each [`ShieldScript`] controls how a shield behaves:
//! - which services it advertises
//! - how many connect attempts fail before one succeeds
//! - whether enabling notifications fails
//!
//! When an emit interval is configured, every subscribed shield produces a
//! batch of synthetic envelope samples at that interval.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use myoware_core::protocol::SAMPLE_WIDTH;

use super::link::{
    LinkError, LinkEvent, LinkLayer, LinkResult, ShieldId, EMG_CHARACTERISTIC, EMG_SERVICE,
    EVENT_CHANNEL_CAPACITY,
};

// ============================================================================
// Shield Scripts
// ============================================================================

/// Scripted behaviour of one simulated shield.
#[derive(Clone, Debug)]
pub struct ShieldScript {
    /// Shield identifier
    pub id: ShieldId,
    /// Services included in advertisements
    pub services: Vec<Uuid>,
    /// Reported signal strength
    pub rssi: i16,
    /// Connect attempts that fail before the first success
    pub connect_failures: u32,
    /// Enabling notifications always fails
    pub subscribe_fails: bool,
}

impl ShieldScript {
    /// A well-behaved shield advertising the EMG service.
    pub fn emg(id: impl Into<String>) -> Self {
        Self {
            id: ShieldId::new(id),
            services: vec![EMG_SERVICE],
            rssi: -60,
            connect_failures: 0,
            subscribe_fails: false,
        }
    }

    /// A peripheral that does not advertise the EMG service.
    pub fn foreign(id: impl Into<String>) -> Self {
        Self {
            services: Vec::new(),
            ..Self::emg(id)
        }
    }

    /// Fail the first `count` connect attempts.
    #[must_use]
    pub fn failing_connects(mut self, count: u32) -> Self {
        self.connect_failures = count;
        self
    }

    /// Fail every subscribe.
    #[must_use]
    pub fn failing_subscribe(mut self) -> Self {
        self.subscribe_fails = true;
        self
    }
}

#[derive(Debug)]
struct ShieldSlot {
    script: ShieldScript,
    remaining_failures: u32,
    connect_attempts: u32,
    connected: bool,
    subscribed: bool,
    emitter: Option<JoinHandle<()>>,
}

/// Synthetic notification stream settings.
#[derive(Copy, Clone, Debug)]
struct EmitConfig {
    interval: Duration,
    samples_per_batch: usize,
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`SimulatedLink`].
#[derive(Debug, Default)]
pub struct SimulatedLinkBuilder {
    shields: Vec<ShieldScript>,
    emit: Option<EmitConfig>,
    advertisement_repeats: usize,
}

impl SimulatedLinkBuilder {
    /// Add a scripted shield.
    #[must_use]
    pub fn shield(mut self, script: ShieldScript) -> Self {
        self.shields.push(script);
        self
    }

    /// Add `count` well-behaved shields named `shield-0`, `shield-1`, ...
    #[must_use]
    pub fn emg_shields(mut self, count: usize) -> Self {
        let start = self.shields.len();
        for i in start..start + count {
            self.shields.push(ShieldScript::emg(format!("shield-{i}")));
        }
        self
    }

    /// Emit `samples_per_batch` samples per shield every `interval` once subscribed.
    #[must_use]
    pub fn emit_every(mut self, interval: Duration, samples_per_batch: usize) -> Self {
        self.emit = Some(EmitConfig {
            interval,
            samples_per_batch,
        });
        self
    }

    /// Send each advertisement this many times per scan.
    #[must_use]
    pub fn advertisement_repeats(mut self, repeats: usize) -> Self {
        self.advertisement_repeats = repeats;
        self
    }

    /// Build the link layer and its event receiver.
    pub fn build(self) -> (SimulatedLink, mpsc::Receiver<LinkEvent>) {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let order = self.shields.iter().map(|s| s.id.clone()).collect();
        let shields = self
            .shields
            .into_iter()
            .map(|script| {
                let slot = ShieldSlot {
                    remaining_failures: script.connect_failures,
                    script,
                    connect_attempts: 0,
                    connected: false,
                    subscribed: false,
                    emitter: None,
                };
                (slot.script.id.clone(), slot)
            })
            .collect();

        (
            SimulatedLink {
                order,
                shields: Mutex::new(shields),
                event_tx,
                emit: self.emit,
                advertisement_repeats: self.advertisement_repeats.max(1),
                scan_task: Mutex::new(None),
            },
            event_rx,
        )
    }
}

// ============================================================================
// Simulated Link
// ============================================================================

/// In-process link layer with scripted shields.
#[derive(Debug)]
pub struct SimulatedLink {
    order: Vec<ShieldId>,
    shields: Mutex<HashMap<ShieldId, ShieldSlot>>,
    event_tx: mpsc::Sender<LinkEvent>,
    emit: Option<EmitConfig>,
    advertisement_repeats: usize,
    scan_task: Mutex<Option<JoinHandle<()>>>,
}

impl SimulatedLink {
    /// Start building a simulated link layer.
    #[must_use]
    pub fn builder() -> SimulatedLinkBuilder {
        SimulatedLinkBuilder::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ShieldId, ShieldSlot>> {
        self.shields.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Connect attempts made against a shield so far.
    #[must_use]
    pub fn connect_attempts(&self, shield: &ShieldId) -> u32 {
        self.lock().get(shield).map_or(0, |s| s.connect_attempts)
    }

    /// Whether a shield currently has notifications armed.
    #[must_use]
    pub fn is_subscribed(&self, shield: &ShieldId) -> bool {
        self.lock().get(shield).is_some_and(|s| s.subscribed)
    }

    /// Push a notification as if `shield` had just sent `payload`.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::NotConnected`] if the event receiver is gone.
    pub async fn inject_notification(&self, shield: &ShieldId, payload: Vec<u8>) -> LinkResult<()> {
        self.inject_notification_at(shield, payload, Instant::now()).await
    }

    /// Push a notification with an explicit receive instant.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::NotConnected`] if the event receiver is gone.
    pub async fn inject_notification_at(
        &self,
        shield: &ShieldId,
        payload: Vec<u8>,
        received_at: Instant,
    ) -> LinkResult<()> {
        self.event_tx
            .send(LinkEvent::Notification {
                shield: shield.clone(),
                payload,
                received_at,
            })
            .await
            .map_err(|_| LinkError::NotConnected(shield.clone()))
    }

    fn spawn_emitter(&self, shield: ShieldId, emit: EmitConfig, seed: usize) -> JoinHandle<()> {
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(emit.interval);
            let mut phase = seed * 37;

            loop {
                ticker.tick().await;

                let mut payload = Vec::with_capacity(emit.samples_per_batch * SAMPLE_WIDTH);
                for _ in 0..emit.samples_per_batch {
                    payload.extend_from_slice(&envelope_value(phase).to_be_bytes());
                    phase = phase.wrapping_add(1);
                }

                let event = LinkEvent::Notification {
                    shield: shield.clone(),
                    payload,
                    received_at: Instant::now(),
                };
                if event_tx.send(event).await.is_err() {
                    break;
                }
            }
        })
    }
}

/// Triangle-wave envelope in the 12-bit ADC range.
fn envelope_value(phase: usize) -> u16 {
    const PERIOD: usize = 200;
    const PEAK: usize = 4095;

    let pos = phase % PERIOD;
    let half = PERIOD / 2;
    let level = if pos < half { pos } else { PERIOD - pos };
    u16::try_from(level * PEAK / half).unwrap_or(u16::MAX)
}

impl LinkLayer for SimulatedLink {
    async fn start_scan(&self, service: Uuid) -> LinkResult<()> {
        let adverts: Vec<LinkEvent> = {
            let shields = self.lock();
            self.order
                .iter()
                .filter_map(|id| shields.get(id))
                .map(|slot| LinkEvent::Advertisement {
                    shield: slot.script.id.clone(),
                    services: slot.script.services.clone(),
                    rssi: Some(slot.script.rssi),
                })
                .collect()
        };

        if self.event_tx.is_closed() {
            return Err(LinkError::Ble("event receiver closed".to_string()));
        }

        tracing::debug!(%service, peripherals = adverts.len(), "Simulated scan started");

        // Advertise from a task; the caller drains the channel only after
        // this returns
        let event_tx = self.event_tx.clone();
        let repeats = self.advertisement_repeats;
        let pump = tokio::spawn(async move {
            for _ in 0..repeats {
                for advert in &adverts {
                    if event_tx.send(advert.clone()).await.is_err() {
                        return;
                    }
                }
            }
        });
        let previous = self
            .scan_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(pump);
        if let Some(old) = previous {
            old.abort();
        }
        Ok(())
    }

    async fn stop_scan(&self) -> LinkResult<()> {
        let pump = self
            .scan_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(pump) = pump {
            pump.abort();
        }
        tracing::debug!("Simulated scan stopped");
        Ok(())
    }

    async fn connect(&self, shield: &ShieldId) -> LinkResult<bool> {
        let mut shields = self.lock();
        let slot = shields
            .get_mut(shield)
            .ok_or_else(|| LinkError::NotFound(shield.clone()))?;

        slot.connect_attempts += 1;
        if slot.remaining_failures > 0 {
            slot.remaining_failures -= 1;
            return Err(LinkError::ConnectionFailed {
                shield: shield.clone(),
                reason: "simulated connect failure".to_string(),
            });
        }

        slot.connected = true;
        Ok(true)
    }

    async fn subscribe(&self, shield: &ShieldId, characteristic: Uuid) -> LinkResult<()> {
        let seed = self.order.iter().position(|s| s == shield).unwrap_or(0);
        let mut shields = self.lock();
        let slot = shields
            .get_mut(shield)
            .ok_or_else(|| LinkError::NotFound(shield.clone()))?;

        if !slot.connected {
            return Err(LinkError::NotConnected(shield.clone()));
        }
        if characteristic != EMG_CHARACTERISTIC {
            return Err(LinkError::CharacteristicNotFound {
                shield: shield.clone(),
                characteristic,
            });
        }
        if slot.script.subscribe_fails {
            return Err(LinkError::SubscribeFailed {
                shield: shield.clone(),
                reason: "simulated subscribe failure".to_string(),
            });
        }

        slot.subscribed = true;
        if let Some(emit) = self.emit {
            let emitter = self.spawn_emitter(shield.clone(), emit, seed);
            if let Some(old) = slot.emitter.replace(emitter) {
                old.abort();
            }
        }
        Ok(())
    }

    async fn disconnect(&self, shield: &ShieldId) -> LinkResult<()> {
        {
            let mut shields = self.lock();
            let slot = shields
                .get_mut(shield)
                .ok_or_else(|| LinkError::NotFound(shield.clone()))?;
            if !slot.connected {
                return Ok(());
            }
            slot.connected = false;
            slot.subscribed = false;
            if let Some(emitter) = slot.emitter.take() {
                emitter.abort();
            }
        }

        let _ = self
            .event_tx
            .send(LinkEvent::Disconnected {
                shield: shield.clone(),
                reason: Some("disconnected by central".to_string()),
            })
            .await;
        Ok(())
    }
}

impl Drop for SimulatedLink {
    fn drop(&mut self) {
        let pump = self
            .scan_task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(pump) = pump {
            pump.abort();
        }
        for slot in self.lock().values_mut() {
            if let Some(emitter) = slot.emitter.take() {
                emitter.abort();
            }
        }
    }
}
