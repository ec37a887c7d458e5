//! Configuration types shared between the central and its config endpoint
//!
//! The central fetches one JSON document at startup. Its field names are
//! fixed by the deployed endpoint, so the serde renames below are part of
//! the wire contract:
//!
//! ```json
//! {
//!   "runningMode": "standalone",
//!   "enableconnectionParams": false,
//!   "NeededClientNumbers": 8,
//!   "minInterval": 12, "maxInterval": 12, "latency": 0, "timeout": 100,
//!   "scanInterval": 100, "scanWindow": 99
//! }
//! ```

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ModeParseError;

// ============================================================================
// Running Mode
// ============================================================================

/// Where decoded samples go.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunningMode {
    /// Aggregate one sample per shield per reporting cycle on the central
    #[default]
    #[serde(rename = "standalone")]
    Standalone,
    /// Forward every sample to a remote consumer
    #[serde(rename = "up-to-host")]
    HostForwarding,
}

impl RunningMode {
    /// Wire name of the mode.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Standalone => "standalone",
            Self::HostForwarding => "up-to-host",
        }
    }
}

impl fmt::Display for RunningMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunningMode {
    type Err = ModeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standalone" => Ok(Self::Standalone),
            "up-to-host" => Ok(Self::HostForwarding),
            _ => Err(ModeParseError),
        }
    }
}

// ============================================================================
// Connection Parameters
// ============================================================================

/// BLE connection and scan timing, in controller units.
///
/// Intervals are in 1.25 ms units, supervision timeout in 10 ms units and
/// scan timing in 0.625 ms units, as the controller expects them.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionParams {
    /// Minimum connection interval
    #[serde(rename = "minInterval")]
    pub min_interval: u16,
    /// Maximum connection interval
    #[serde(rename = "maxInterval")]
    pub max_interval: u16,
    /// Peripheral latency (connection events the shield may skip)
    pub latency: u16,
    /// Supervision timeout
    pub timeout: u16,
    /// Scan interval
    #[serde(rename = "scanInterval")]
    pub scan_interval: u16,
    /// Scan window
    #[serde(rename = "scanWindow")]
    pub scan_window: u16,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            min_interval: 12, // 15 ms
            max_interval: 12,
            latency: 0,
            timeout: 100, // 1 s
            scan_interval: 100,
            scan_window: 99,
        }
    }
}

// ============================================================================
// Remote Configuration
// ============================================================================

/// Default number of shields the central waits for.
pub const DEFAULT_NEEDED_CLIENTS: usize = 8;

/// The configuration document fetched once at startup.
///
/// Every field is required. A document missing any of them fails to parse
/// as a whole; there is no partial apply.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RemoteConfigDocument", into = "RemoteConfigDocument")]
pub struct RemoteConfig {
    /// Standalone aggregation or host forwarding
    pub running_mode: RunningMode,
    /// Hand `connection_params` to the link layer before connecting
    pub enable_connection_params: bool,
    /// Number of connected shields to wait for
    pub needed_client_numbers: usize,
    /// Link timing
    pub connection_params: ConnectionParams,
}

/// Flat JSON layout of [`RemoteConfig`].
///
/// Timing fields take any JSON number and are narrowed to controller units
/// when converted.
#[derive(Copy, Clone, Serialize, Deserialize)]
struct RemoteConfigDocument {
    #[serde(rename = "runningMode")]
    running_mode: RunningMode,
    #[serde(rename = "enableconnectionParams")]
    enable_connection_params: bool,
    #[serde(rename = "NeededClientNumbers")]
    needed_client_numbers: usize,
    #[serde(rename = "minInterval")]
    min_interval: f64,
    #[serde(rename = "maxInterval")]
    max_interval: f64,
    latency: f64,
    timeout: f64,
    #[serde(rename = "scanInterval")]
    scan_interval: f64,
    #[serde(rename = "scanWindow")]
    scan_window: f64,
}

/// Round to the nearest controller unit, saturating at the `u16` range.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn controller_units(value: f64) -> u16 {
    (value + 0.5) as u16
}

impl From<RemoteConfigDocument> for RemoteConfig {
    fn from(doc: RemoteConfigDocument) -> Self {
        Self {
            running_mode: doc.running_mode,
            enable_connection_params: doc.enable_connection_params,
            needed_client_numbers: doc.needed_client_numbers,
            connection_params: ConnectionParams {
                min_interval: controller_units(doc.min_interval),
                max_interval: controller_units(doc.max_interval),
                latency: controller_units(doc.latency),
                timeout: controller_units(doc.timeout),
                scan_interval: controller_units(doc.scan_interval),
                scan_window: controller_units(doc.scan_window),
            },
        }
    }
}

impl From<RemoteConfig> for RemoteConfigDocument {
    fn from(config: RemoteConfig) -> Self {
        let params = config.connection_params;
        Self {
            running_mode: config.running_mode,
            enable_connection_params: config.enable_connection_params,
            needed_client_numbers: config.needed_client_numbers,
            min_interval: f64::from(params.min_interval),
            max_interval: f64::from(params.max_interval),
            latency: f64::from(params.latency),
            timeout: f64::from(params.timeout),
            scan_interval: f64::from(params.scan_interval),
            scan_window: f64::from(params.scan_window),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            running_mode: RunningMode::Standalone,
            enable_connection_params: false,
            needed_client_numbers: DEFAULT_NEEDED_CLIENTS,
            connection_params: ConnectionParams::default(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_DOCUMENT: &str = r#"{
        "runningMode": "up-to-host",
        "enableconnectionParams": true,
        "NeededClientNumbers": 3,
        "minInterval": 6,
        "maxInterval": 24,
        "latency": 2,
        "timeout": 400,
        "scanInterval": 80,
        "scanWindow": 40
    }"#;

    #[test]
    fn test_remote_config_parses_full_document() {
        let config: RemoteConfig = serde_json::from_str(FULL_DOCUMENT).unwrap();

        assert_eq!(config.running_mode, RunningMode::HostForwarding);
        assert!(config.enable_connection_params);
        assert_eq!(config.needed_client_numbers, 3);
        assert_eq!(config.connection_params.min_interval, 6);
        assert_eq!(config.connection_params.max_interval, 24);
        assert_eq!(config.connection_params.latency, 2);
        assert_eq!(config.connection_params.timeout, 400);
        assert_eq!(config.connection_params.scan_interval, 80);
        assert_eq!(config.connection_params.scan_window, 40);
    }

    #[test]
    fn test_remote_config_rejects_partial_document() {
        let partial = r#"{
            "runningMode": "standalone",
            "enableconnectionParams": false,
            "NeededClientNumbers": 2,
            "minInterval": 6
        }"#;
        assert!(serde_json::from_str::<RemoteConfig>(partial).is_err());
    }

    #[test]
    fn test_remote_config_accepts_any_numeric_timing() {
        let doc = r#"{
            "runningMode": "up-to-host",
            "enableconnectionParams": true,
            "NeededClientNumbers": 2,
            "minInterval": 7.5, "maxInterval": 70000, "latency": -1, "timeout": 99.4,
            "scanInterval": 100, "scanWindow": 99
        }"#;
        let config: RemoteConfig = serde_json::from_str(doc).unwrap();

        assert_eq!(config.running_mode, RunningMode::HostForwarding);
        assert_eq!(config.connection_params.min_interval, 8);
        assert_eq!(config.connection_params.max_interval, u16::MAX);
        assert_eq!(config.connection_params.latency, 0);
        assert_eq!(config.connection_params.timeout, 99);
        assert_eq!(config.connection_params.scan_interval, 100);
    }

    #[test]
    fn test_remote_config_rejects_unknown_mode() {
        let doc = r#"{
            "runningMode": "broadcast",
            "enableconnectionParams": false,
            "NeededClientNumbers": 2,
            "minInterval": 6, "maxInterval": 6, "latency": 0, "timeout": 100,
            "scanInterval": 100, "scanWindow": 99
        }"#;
        assert!(serde_json::from_str::<RemoteConfig>(doc).is_err());
    }

    #[test]
    fn test_running_mode_from_str() {
        assert_eq!("standalone".parse::<RunningMode>(), Ok(RunningMode::Standalone));
        assert_eq!("up-to-host".parse::<RunningMode>(), Ok(RunningMode::HostForwarding));
        assert_eq!("sideways".parse::<RunningMode>(), Err(ModeParseError));
        assert_eq!("host".parse::<RunningMode>(), Err(ModeParseError));
    }

    #[test]
    fn test_defaults() {
        let config = RemoteConfig::default();
        assert_eq!(config.running_mode, RunningMode::Standalone);
        assert!(!config.enable_connection_params);
        assert_eq!(config.needed_client_numbers, DEFAULT_NEEDED_CLIENTS);
    }
}
