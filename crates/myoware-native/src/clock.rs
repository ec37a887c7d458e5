//! Clock anchoring.
//!
//! Shields have no notion of wall-clock time. The central fetches an
//! absolute time once at startup, pairs it with a local monotonic
//! [`Instant`], and from then on derives every timestamp from elapsed
//! local time:
//!
//! ```text
//! absolute(t) = anchor_epoch_ms + (t - anchor_instant)
//! ```

use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

/// Default world-time endpoint.
pub const DEFAULT_TIME_URL: &str = "http://worldtimeapi.org/api/timezone/Asia/Hong_Kong";

/// Per-request timeout for the world-time endpoint.
pub const DEFAULT_TIME_TIMEOUT: Duration = Duration::from_secs(10);

/// Rendering used for sample timestamps.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

// ============================================================================
// Errors
// ============================================================================

/// Errors from time sources.
#[derive(Debug, Error)]
pub enum ClockError {
    /// HTTP request failed
    #[error("Time request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Server answered with a non-success status
    #[error("Time server returned status {0}")]
    Status(u16),

    /// Response could not be interpreted as a time
    #[error("Invalid time value: {0}")]
    Invalid(String),

    /// Host clock is before the Unix epoch
    #[error("System clock is before the Unix epoch")]
    SystemClock,
}

/// Result type for clock operations.
pub type ClockResult<T> = Result<T, ClockError>;

// ============================================================================
// Time Sources
// ============================================================================

/// Source of absolute time.
pub trait TimeSource: Send + Sync {
    /// Current time in seconds since the Unix epoch.
    fn epoch_seconds(&self) -> impl Future<Output = ClockResult<f64>> + Send;
}

/// World-time HTTP API source.
#[derive(Clone, Debug)]
pub struct HttpTimeSource {
    client: reqwest::Client,
    url: String,
}

#[derive(Deserialize)]
struct WorldTimeResponse {
    datetime: String,
}

impl HttpTimeSource {
    /// Create a source for a world-time style endpoint. Each request gives
    /// up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`ClockError::Http`] if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>, timeout: Duration) -> ClockResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    /// Endpoint URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl TimeSource for HttpTimeSource {
    async fn epoch_seconds(&self) -> ClockResult<f64> {
        let response = self.client.get(&self.url).send().await?;
        if !response.status().is_success() {
            return Err(ClockError::Status(response.status().as_u16()));
        }

        let body: WorldTimeResponse = response.json().await?;
        parse_rfc3339_seconds(&body.datetime)
    }
}

/// Convert an RFC 3339 date-time to epoch seconds.
#[allow(clippy::cast_precision_loss)]
fn parse_rfc3339_seconds(value: &str) -> ClockResult<f64> {
    let parsed = DateTime::parse_from_rfc3339(value)
        .map_err(|e| ClockError::Invalid(format!("{value}: {e}")))?;
    Ok(parsed.timestamp_millis() as f64 / 1000.0)
}

/// Host wall clock.
#[derive(Copy, Clone, Debug, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    async fn epoch_seconds(&self) -> ClockResult<f64> {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .map_err(|_| ClockError::SystemClock)
    }
}

/// Either of the built-in time sources, chosen at runtime.
#[derive(Clone, Debug)]
pub enum AnyTimeSource {
    /// World-time HTTP API
    Http(HttpTimeSource),
    /// Host wall clock
    System(SystemTimeSource),
}

impl TimeSource for AnyTimeSource {
    async fn epoch_seconds(&self) -> ClockResult<f64> {
        match self {
            Self::Http(source) => source.epoch_seconds().await,
            Self::System(source) => source.epoch_seconds().await,
        }
    }
}

// ============================================================================
// Timestamps
// ============================================================================

/// Absolute time with millisecond resolution.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    epoch_ms: i64,
}

impl Timestamp {
    /// Timestamp from milliseconds since the Unix epoch.
    #[must_use]
    pub const fn from_epoch_millis(epoch_ms: i64) -> Self {
        Self { epoch_ms }
    }

    /// Milliseconds since the Unix epoch.
    #[must_use]
    pub const fn epoch_millis(self) -> i64 {
        self.epoch_ms
    }

    /// UTC date-time, if representable.
    #[must_use]
    pub fn to_utc(self) -> Option<DateTime<Utc>> {
        DateTime::<Utc>::from_timestamp_millis(self.epoch_ms)
    }
}

impl fmt::Display for Timestamp {
    /// Renders as `YYYY-MM-DD HH:MM:SS.mmm` in UTC.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_utc() {
            Some(dt) => write!(f, "{}", dt.format(TIMESTAMP_FORMAT)),
            None => write!(f, "@{}ms", self.epoch_ms),
        }
    }
}

// ============================================================================
// Clock Anchor
// ============================================================================

/// Absolute time paired with a local monotonic instant.
#[derive(Copy, Clone, Debug)]
pub struct ClockAnchor {
    epoch_ms: i64,
    boot: Instant,
}

impl ClockAnchor {
    /// Anchor `epoch_ms` to the local instant `boot`.
    #[must_use]
    pub const fn new(epoch_ms: i64, boot: Instant) -> Self {
        Self { epoch_ms, boot }
    }

    /// Anchor fractional epoch seconds to `boot`.
    ///
    /// # Errors
    ///
    /// Returns [`ClockError::Invalid`] for non-finite or out-of-range values.
    #[allow(clippy::cast_possible_truncation)]
    pub fn from_epoch_seconds(seconds: f64, boot: Instant) -> ClockResult<Self> {
        let millis = (seconds * 1000.0).round();
        if !millis.is_finite() || millis.abs() > 8.64e15 {
            return Err(ClockError::Invalid(format!("{seconds} seconds")));
        }
        Ok(Self::new(millis as i64, boot))
    }

    /// Query `source` until it answers, sleeping `backoff` between failures.
    ///
    /// Never gives up: timestamps are meaningless without an anchor.
    pub async fn initialize<T: TimeSource>(source: &T, backoff: Duration) -> Self {
        let mut attempts = 0u64;
        loop {
            attempts += 1;
            let result = source
                .epoch_seconds()
                .await
                .and_then(|secs| Self::from_epoch_seconds(secs, Instant::now()));

            match result {
                Ok(anchor) => {
                    tracing::info!(attempts, time = %anchor.resolve(0), "Network time obtained");
                    return anchor;
                }
                Err(e) => {
                    tracing::warn!(attempts, error = %e, "Error fetching network time, retrying");
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    /// Absolute time at the anchor, in epoch milliseconds.
    #[must_use]
    pub const fn epoch_millis(&self) -> i64 {
        self.epoch_ms
    }

    /// Local instant of the anchor.
    #[must_use]
    pub const fn boot_instant(&self) -> Instant {
        self.boot
    }

    /// Milliseconds from the anchor to `at` (zero for earlier instants).
    #[must_use]
    pub fn elapsed_millis(&self, at: Instant) -> i64 {
        let elapsed = at.saturating_duration_since(self.boot).as_millis();
        i64::try_from(elapsed).unwrap_or(i64::MAX)
    }

    /// Absolute timestamp `elapsed_ms` after the anchor.
    #[must_use]
    pub const fn resolve(&self, elapsed_ms: i64) -> Timestamp {
        Timestamp::from_epoch_millis(self.epoch_ms.saturating_add(elapsed_ms))
    }
}
