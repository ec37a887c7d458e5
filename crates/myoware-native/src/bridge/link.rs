//! Link-layer abstraction
//!
//! A [`LinkLayer`] provides the scan, connect and subscribe primitives the
//! coordinator needs. Everything it observes asynchronously (advertisements,
//! notifications, disconnects) is delivered as a [`LinkEvent`] on an mpsc
//! channel created together with the link layer.

use std::fmt;
use std::future::Future;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use myoware_core::protocol::{EMG_CHARACTERISTIC_UUID, EMG_SERVICE_UUID};
use myoware_core::types::ConnectionParams;

/// MyoWare EMG service UUID
pub const EMG_SERVICE: Uuid = Uuid::from_u128(EMG_SERVICE_UUID);

/// MyoWare EMG notify characteristic UUID
pub const EMG_CHARACTERISTIC: Uuid = Uuid::from_u128(EMG_CHARACTERISTIC_UUID);

/// Capacity of the link event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

// ============================================================================
// Shield Identifier
// ============================================================================

/// Stable identifier of one shield (BLE address or platform peripheral id).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShieldId(String);

impl ShieldId {
    /// Create an identifier from an address string.
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    /// The address string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShieldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ShieldId {
    fn from(address: &str) -> Self {
        Self::new(address)
    }
}

impl From<String> for ShieldId {
    fn from(address: String) -> Self {
        Self(address)
    }
}

// ============================================================================
// Events
// ============================================================================

/// Events delivered by a link layer.
#[derive(Clone, Debug)]
pub enum LinkEvent {
    /// An advertisement was received while scanning
    Advertisement {
        /// Advertising peripheral
        shield: ShieldId,
        /// Service UUIDs in the advertisement
        services: Vec<Uuid>,
        /// Signal strength in dBm, if reported
        rssi: Option<i16>,
    },
    /// A notification arrived on a subscribed characteristic
    Notification {
        /// Notifying shield
        shield: ShieldId,
        /// Raw characteristic value
        payload: Vec<u8>,
        /// Local instant the notification was received
        received_at: Instant,
    },
    /// A connected shield went away
    Disconnected {
        /// Shield that disconnected
        shield: ShieldId,
        /// Reason, if the stack reported one
        reason: Option<String>,
    },
}

// ============================================================================
// Errors
// ============================================================================

/// Errors raised by link layers.
#[derive(Debug, Error)]
pub enum LinkError {
    /// No Bluetooth adapter available
    #[error("No Bluetooth adapter found")]
    NoAdapter,

    /// Shield unknown to the link layer
    #[error("Shield not found: {0}")]
    NotFound(ShieldId),

    /// Shield is not connected
    #[error("Shield not connected: {0}")]
    NotConnected(ShieldId),

    /// A connect attempt failed
    #[error("Connection to {shield} failed: {reason}")]
    ConnectionFailed {
        /// Target shield
        shield: ShieldId,
        /// Failure description
        reason: String,
    },

    /// The shield does not expose the requested characteristic
    #[error("Characteristic {characteristic} not found on {shield}")]
    CharacteristicNotFound {
        /// Target shield
        shield: ShieldId,
        /// Requested characteristic
        characteristic: Uuid,
    },

    /// Enabling notifications failed
    #[error("Subscribe on {shield} failed: {reason}")]
    SubscribeFailed {
        /// Target shield
        shield: ShieldId,
        /// Failure description
        reason: String,
    },

    /// BLE stack error
    #[error("BLE error: {0}")]
    Ble(String),
}

/// Result type for link-layer operations.
pub type LinkResult<T> = Result<T, LinkError>;

// ============================================================================
// Link Layer
// ============================================================================

/// Scan / connect / subscribe primitives over some wireless transport.
pub trait LinkLayer: Send + Sync + 'static {
    /// Start scanning for peripherals advertising `service`.
    ///
    /// Advertisements are delivered as [`LinkEvent::Advertisement`].
    fn start_scan(&self, service: Uuid) -> impl Future<Output = LinkResult<()>> + Send;

    /// Stop scanning.
    fn stop_scan(&self) -> impl Future<Output = LinkResult<()>> + Send;

    /// Attempt one connection. `Ok(false)` means the call completed but the
    /// link is not up.
    fn connect(&self, shield: &ShieldId) -> impl Future<Output = LinkResult<bool>> + Send;

    /// Enable notifications on `characteristic`.
    ///
    /// Values are delivered as [`LinkEvent::Notification`].
    fn subscribe(
        &self,
        shield: &ShieldId,
        characteristic: Uuid,
    ) -> impl Future<Output = LinkResult<()>> + Send;

    /// Drop the connection to a shield.
    fn disconnect(&self, shield: &ShieldId) -> impl Future<Output = LinkResult<()>> + Send;

    /// Request connection timing for subsequent connections.
    ///
    /// Link layers that cannot influence timing accept and ignore it.
    fn apply_connection_params(&self, params: &ConnectionParams) -> LinkResult<()> {
        tracing::debug!(?params, "Connection parameters not supported by this link layer");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gatt_uuids_match_firmware() {
        assert_eq!(
            EMG_SERVICE.to_string(),
            "ec3af789-2154-49f4-a9fc-bc6c88e9e930"
        );
        assert_eq!(
            EMG_CHARACTERISTIC.to_string(),
            "f3a56edf-8f1e-4533-93bf-5601b2e91308"
        );
    }

    #[test]
    fn test_shield_id_display_and_eq() {
        let a = ShieldId::from("AA:BB:CC:DD:EE:FF");
        let b = ShieldId::new(String::from("AA:BB:CC:DD:EE:FF"));
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "AA:BB:CC:DD:EE:FF");
        assert_eq!(a.as_str(), b.as_str());
    }
}
