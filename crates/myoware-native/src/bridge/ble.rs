//! BLE link layer for MyoWare wireless shields
//!
//! Uses the platform Bluetooth stack through btleplug.
//!
//! # GATT Layout
//!
//! Each shield exposes one custom service:
//! - `ec3af789-2154-49f4-a9fc-bc6c88e9e930` - MyoWare EMG service
//!
//! with one characteristic:
//! - `f3a56edf-8f1e-4533-93bf-5601b2e91308` - EMG samples (notify)
//!
//! Shields are identified by the platform peripheral id (a MAC address on
//! Linux and Windows, a CoreBluetooth UUID on macOS).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use uuid::Uuid;

use myoware_core::types::ConnectionParams;

use super::link::{
    LinkError, LinkEvent, LinkLayer, LinkResult, ShieldId, EVENT_CHANNEL_CAPACITY,
};

fn ble_err(e: &btleplug::Error) -> LinkError {
    LinkError::Ble(e.to_string())
}

/// btleplug-backed link layer.
pub struct BleLink {
    /// BLE adapter
    adapter: Adapter,
    /// Peripherals seen while scanning, by shield id
    peripherals: Arc<RwLock<HashMap<ShieldId, Peripheral>>>,
    /// Event sender
    event_tx: mpsc::Sender<LinkEvent>,
    /// Advertisement pump while scanning
    scan_task: Mutex<Option<JoinHandle<()>>>,
}

impl BleLink {
    /// Open the first Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns error if Bluetooth is not available
    pub async fn new() -> LinkResult<(Self, mpsc::Receiver<LinkEvent>)> {
        let manager = Manager::new().await.map_err(|e| ble_err(&e))?;
        let adapters = manager.adapters().await.map_err(|e| ble_err(&e))?;

        let adapter = adapters.into_iter().next().ok_or(LinkError::NoAdapter)?;

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        Ok((
            Self {
                adapter,
                peripherals: Arc::new(RwLock::new(HashMap::new())),
                event_tx,
                scan_task: Mutex::new(None),
            },
            event_rx,
        ))
    }

    async fn peripheral(&self, shield: &ShieldId) -> LinkResult<Peripheral> {
        if let Some(p) = self.peripherals.read().await.get(shield) {
            return Ok(p.clone());
        }

        // Not seen by our scan task; ask the adapter directly
        let peripherals = self.adapter.peripherals().await.map_err(|e| ble_err(&e))?;
        let peripheral = peripherals
            .into_iter()
            .find(|p| p.id().to_string() == shield.as_str())
            .ok_or_else(|| LinkError::NotFound(shield.clone()))?;

        self.peripherals
            .write()
            .await
            .insert(shield.clone(), peripheral.clone());
        Ok(peripheral)
    }

    /// Turn adapter events into advertisement events.
    async fn pump_advertisements(
        adapter: Adapter,
        peripherals: Arc<RwLock<HashMap<ShieldId, Peripheral>>>,
        event_tx: mpsc::Sender<LinkEvent>,
    ) {
        let mut events = match adapter.events().await {
            Ok(events) => events,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to get adapter event stream");
                return;
            }
        };

        while let Some(event) = events.next().await {
            let id: PeripheralId = match event {
                CentralEvent::DeviceDiscovered(id)
                | CentralEvent::DeviceUpdated(id)
                | CentralEvent::ServicesAdvertisement { id, .. } => id,
                _ => continue,
            };

            let Ok(peripheral) = adapter.peripheral(&id).await else {
                continue;
            };
            let properties = match peripheral.properties().await {
                Ok(Some(props)) => props,
                Ok(None) => continue,
                Err(e) => {
                    tracing::debug!(error = %e, "Failed to read peripheral properties");
                    continue;
                }
            };

            let shield = ShieldId::new(id.to_string());
            tracing::trace!(
                %shield,
                rssi = ?properties.rssi,
                name = ?properties.local_name,
                "Detected device"
            );

            peripherals.write().await.insert(shield.clone(), peripheral);

            let advert = LinkEvent::Advertisement {
                shield,
                services: properties.services,
                rssi: properties.rssi,
            };
            if event_tx.send(advert).await.is_err() {
                break;
            }
        }
    }

    /// Forward notifications from one peripheral until its stream ends.
    fn spawn_notification_handler(
        &self,
        shield: ShieldId,
        peripheral: Peripheral,
        characteristic: Uuid,
    ) {
        let event_tx = self.event_tx.clone();
        let peripherals = Arc::clone(&self.peripherals);

        tokio::spawn(async move {
            let mut stream = match peripheral.notifications().await {
                Ok(s) => s,
                Err(e) => {
                    let _ = event_tx
                        .send(LinkEvent::Disconnected {
                            shield,
                            reason: Some(format!("Failed to get notification stream: {e}")),
                        })
                        .await;
                    return;
                }
            };

            while let Some(notification) = stream.next().await {
                if notification.uuid != characteristic {
                    continue;
                }
                let received_at = Instant::now();
                let event = LinkEvent::Notification {
                    shield: shield.clone(),
                    payload: notification.value,
                    received_at,
                };
                if event_tx.send(event).await.is_err() {
                    return;
                }
            }

            // Stream ended, shield disconnected
            peripherals.write().await.remove(&shield);

            let _ = event_tx
                .send(LinkEvent::Disconnected {
                    shield,
                    reason: Some("Notification stream ended".to_string()),
                })
                .await;
        });
    }
}

impl LinkLayer for BleLink {
    async fn start_scan(&self, service: Uuid) -> LinkResult<()> {
        tracing::info!(%service, "Scanning for MyoWare wireless shields");

        // Subscribe to adapter events before scanning so nothing is missed
        let pump = tokio::spawn(Self::pump_advertisements(
            self.adapter.clone(),
            Arc::clone(&self.peripherals),
            self.event_tx.clone(),
        ));
        let previous = self
            .scan_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(pump);
        if let Some(old) = previous {
            old.abort();
        }

        let filter = ScanFilter {
            services: vec![service],
        };
        self.adapter.start_scan(filter).await.map_err(|e| ble_err(&e))
    }

    async fn stop_scan(&self) -> LinkResult<()> {
        self.adapter.stop_scan().await.map_err(|e| ble_err(&e))?;

        let pump = self
            .scan_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(pump) = pump {
            pump.abort();
        }
        Ok(())
    }

    async fn connect(&self, shield: &ShieldId) -> LinkResult<bool> {
        let peripheral = self.peripheral(shield).await?;

        peripheral
            .connect()
            .await
            .map_err(|e| LinkError::ConnectionFailed {
                shield: shield.clone(),
                reason: e.to_string(),
            })?;

        peripheral.is_connected().await.map_err(|e| ble_err(&e))
    }

    async fn subscribe(&self, shield: &ShieldId, characteristic: Uuid) -> LinkResult<()> {
        let peripheral = self.peripheral(shield).await?;

        peripheral
            .discover_services()
            .await
            .map_err(|e| LinkError::SubscribeFailed {
                shield: shield.clone(),
                reason: e.to_string(),
            })?;

        let target = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic)
            .ok_or_else(|| LinkError::CharacteristicNotFound {
                shield: shield.clone(),
                characteristic,
            })?;

        peripheral
            .subscribe(&target)
            .await
            .map_err(|e| LinkError::SubscribeFailed {
                shield: shield.clone(),
                reason: e.to_string(),
            })?;

        self.spawn_notification_handler(shield.clone(), peripheral, characteristic);
        Ok(())
    }

    async fn disconnect(&self, shield: &ShieldId) -> LinkResult<()> {
        let peripheral = self.peripherals.write().await.remove(shield);

        if let Some(peripheral) = peripheral {
            peripheral.disconnect().await.map_err(|e| ble_err(&e))?;
            tracing::info!(%shield, "Disconnected");
        }
        Ok(())
    }

    fn apply_connection_params(&self, params: &ConnectionParams) -> LinkResult<()> {
        // btleplug leaves connection timing to the host stack
        tracing::info!(
            min_interval = params.min_interval,
            max_interval = params.max_interval,
            latency = params.latency,
            timeout = params.timeout,
            "Connection parameters requested; negotiated by the host BLE stack"
        );
        Ok(())
    }
}
