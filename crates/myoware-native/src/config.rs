//! Configuration
//!
//! Two layers:
//! - [`RemoteConfig`], fetched once at startup from an HTTP endpoint
//!   through a [`ConfigSource`], with built-in defaults when every attempt
//!   fails
//! - [`CoordinatorConfig`], the local settings (timeouts, retry policy,
//!   overrides) the binary assembles from its command line

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

use myoware_core::protocol::PERIPHERAL_INTERVAL_MS;
use myoware_core::types::{RemoteConfig, RunningMode};

use crate::bridge::RetryPolicy;
use crate::processing::BarrierConfig;

/// Default configuration host.
pub const DEFAULT_CONFIG_HOST: &str = "cdn.1f2.net";

/// Default configuration port.
pub const DEFAULT_CONFIG_PORT: u16 = 80;

/// Default configuration path.
pub const DEFAULT_CONFIG_PATH: &str = "/emg_central_connect_config.json";

// ============================================================================
// Errors
// ============================================================================

/// Errors from configuration sources.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// HTTP request failed
    #[error("Config request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Server answered with a non-success status
    #[error("Config server returned status {0}")]
    Status(u16),

    /// Document is not a complete configuration
    #[error("Invalid config document: {0}")]
    Parse(#[from] serde_json::Error),

    /// Source did not answer within the request timeout
    #[error("Config request timed out after {0:?}")]
    Timeout(Duration),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

// ============================================================================
// Sources
// ============================================================================

/// Source of the remote configuration document.
pub trait ConfigSource: Send + Sync {
    /// Fetch and parse the document once.
    fn fetch(&self) -> impl Future<Output = ConfigResult<RemoteConfig>> + Send;
}

/// Plain HTTP configuration endpoint.
#[derive(Clone, Debug)]
pub struct HttpConfigSource {
    client: reqwest::Client,
    url: String,
}

impl HttpConfigSource {
    /// Source for `http://{host}:{port}{path}`. Each request gives up
    /// after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Http`] if the HTTP client cannot be built.
    pub fn new(host: &str, port: u16, path: &str, timeout: Duration) -> ConfigResult<Self> {
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: format!("http://{host}:{port}{path}"),
        })
    }

    /// Full request URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl ConfigSource for HttpConfigSource {
    async fn fetch(&self) -> ConfigResult<RemoteConfig> {
        let response = self.client.get(&self.url).send().await?;
        if !response.status().is_success() {
            return Err(ConfigError::Status(response.status().as_u16()));
        }

        let body = response.text().await?;
        tracing::debug!(len = body.len(), "Config document received");
        Ok(serde_json::from_str(&body)?)
    }
}

/// Fixed configuration, for offline runs.
#[derive(Copy, Clone, Debug, Default)]
pub struct StaticConfigSource(pub RemoteConfig);

impl ConfigSource for StaticConfigSource {
    async fn fetch(&self) -> ConfigResult<RemoteConfig> {
        Ok(self.0)
    }
}

/// Either of the built-in config sources, chosen at runtime.
#[derive(Clone, Debug)]
pub enum AnyConfigSource {
    /// HTTP endpoint
    Http(HttpConfigSource),
    /// Fixed document
    Static(StaticConfigSource),
}

impl ConfigSource for AnyConfigSource {
    async fn fetch(&self) -> ConfigResult<RemoteConfig> {
        match self {
            Self::Http(source) => source.fetch().await,
            Self::Static(source) => source.fetch().await,
        }
    }
}

// ============================================================================
// Fetcher
// ============================================================================

/// Attempt budget for the startup config fetch.
#[derive(Copy, Clone, Debug)]
pub struct FetchPolicy {
    /// Total attempts before falling back to defaults
    pub attempts: u32,
    /// Delay between attempts
    pub backoff: Duration,
    /// Upper bound on a single attempt
    pub request_timeout: Duration,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            backoff: Duration::from_secs(1),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Where the running configuration came from.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConfigOrigin {
    /// Parsed from the remote document
    Remote,
    /// Built-in defaults after every attempt failed
    Defaults,
}

/// Bounded-retry fetch with fallback to [`RemoteConfig::default`].
#[derive(Debug)]
pub struct RemoteConfigFetcher<C> {
    source: C,
    policy: FetchPolicy,
}

impl<C: ConfigSource> RemoteConfigFetcher<C> {
    /// Wrap a source.
    pub fn new(source: C, policy: FetchPolicy) -> Self {
        Self { source, policy }
    }

    /// Fetch the document, falling back to defaults after the attempt budget.
    pub async fn fetch_or_default(&self) -> (RemoteConfig, ConfigOrigin) {
        let attempts = self.policy.attempts.max(1);

        for attempt in 1..=attempts {
            let result = tokio::time::timeout(self.policy.request_timeout, self.source.fetch())
                .await
                .unwrap_or(Err(ConfigError::Timeout(self.policy.request_timeout)));

            match result {
                Ok(config) => {
                    tracing::info!(
                        mode = %config.running_mode,
                        needed = config.needed_client_numbers,
                        enable_connection_params = config.enable_connection_params,
                        "Remote config loaded"
                    );
                    return (config, ConfigOrigin::Remote);
                }
                Err(e) => {
                    tracing::warn!(attempt, attempts, error = %e, "Failed to fetch remote config");
                    if attempt < attempts {
                        tokio::time::sleep(self.policy.backoff).await;
                    }
                }
            }
        }

        let defaults = RemoteConfig::default();
        tracing::warn!(
            mode = %defaults.running_mode,
            needed = defaults.needed_client_numbers,
            "Using default config"
        );
        (defaults, ConfigOrigin::Defaults)
    }
}

// ============================================================================
// Coordinator Settings
// ============================================================================

/// Local settings for one coordinator run.
#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    /// How long to collect advertisements
    pub scan_window: Duration,

    /// Connect retry policy
    pub retry: RetryPolicy,

    /// Remote config fetch budget
    pub config_fetch: FetchPolicy,

    /// Delay between time-source attempts
    pub time_backoff: Duration,

    /// Spacing of samples within one notification
    pub peripheral_interval_ms: u32,

    /// Aggregation barrier settings
    pub barrier: BarrierConfig,

    /// Replaces the remote `NeededClientNumbers`
    pub target_override: Option<usize>,

    /// Replaces the remote `runningMode`
    pub mode_override: Option<RunningMode>,

    /// Stop processing after this long (`None` runs until the link closes)
    pub run_for: Option<Duration>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            scan_window: Duration::from_secs(20),
            retry: RetryPolicy::default(),
            config_fetch: FetchPolicy::default(),
            time_backoff: Duration::from_secs(1),
            peripheral_interval_ms: PERIPHERAL_INTERVAL_MS,
            barrier: BarrierConfig::default(),
            target_override: None,
            mode_override: None,
            run_for: None,
        }
    }
}

impl CoordinatorConfig {
    /// Apply local overrides to a fetched document.
    #[must_use]
    pub fn effective(&self, mut remote: RemoteConfig) -> RemoteConfig {
        if let Some(target) = self.target_override {
            remote.needed_client_numbers = target;
        }
        if let Some(mode) = self.mode_override {
            remote.running_mode = mode;
        }
        remote
    }
}
