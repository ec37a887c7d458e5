//! Coordinator
//!
//! Owns every component of a run and executes the startup sequence:
//!
//! 1. Anchor the clock (retries until the time source answers)
//! 2. Fetch the remote configuration (bounded retries, defaults on failure)
//! 3. Scan for shields for the scan window, then seal the registry
//! 4. Connect and subscribe until the target count is live
//! 5. Decode and route notifications until the link closes or the run
//!    duration elapses
//!
//! # Example
//!
//! ```rust,ignore
//! use myoware_native::clock::SystemTimeSource;
//! use myoware_native::config::{CoordinatorConfig, StaticConfigSource};
//! use myoware_native::{Coordinator, SimulatedLink};
//!
//! let (link, events) = SimulatedLink::builder().emg_shields(2).build();
//! let summary = Coordinator::new(
//!     Arc::new(link),
//!     events,
//!     SystemTimeSource,
//!     StaticConfigSource::default(),
//!     CoordinatorConfig::default(),
//! )
//! .run()
//! .await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;

use myoware_core::types::{RemoteConfig, RunningMode};

use crate::bridge::{
    ConnectionManager, LinkError, LinkEvent, LinkLayer, LinkResult, LinkTable, ShieldId,
    ShieldRegistry, EMG_SERVICE,
};
use crate::clock::{ClockAnchor, TimeSource};
use crate::config::{ConfigOrigin, ConfigSource, CoordinatorConfig, RemoteConfigFetcher};
use crate::processing::{ModeRouter, NotificationDecoder};
use crate::streaming::{EventPublisher, TracingPublisher};

/// Coordinator errors.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// Link layer failed during setup
    #[error("Link error: {0}")]
    Link(#[from] LinkError),
}

/// Result type for coordinator operations.
pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

/// Outcome of one coordinator run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Summary {
    /// Running mode in effect
    pub mode: RunningMode,
    /// Whether the remote document or the defaults were used
    pub config_origin: ConfigOrigin,
    /// Shields discovered during the scan window
    pub registry_size: usize,
    /// Connected links at the end of the connection phase
    pub live_links: usize,
    /// Links with notifications armed at the end of the connection phase
    pub subscribed_links: usize,
    /// Notifications processed
    pub notifications: u64,
    /// Reporting cycles completed (standalone)
    pub completed_cycles: u64,
    /// Events published (host forwarding)
    pub forwarded_events: u64,
    /// Links lost while running
    pub disconnects: usize,
}

/// Collect advertisements into `registry` for `window`, then seal it.
///
/// # Errors
///
/// Returns the link layer's error if scanning cannot start.
pub async fn discover<L: LinkLayer>(
    link: &L,
    events: &mut mpsc::Receiver<LinkEvent>,
    registry: &ShieldRegistry,
    window: Duration,
) -> LinkResult<usize> {
    link.start_scan(EMG_SERVICE).await?;

    let deadline = tokio::time::sleep(window);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            () = &mut deadline => break,
            event = events.recv() => match event {
                Some(LinkEvent::Advertisement { shield, services, rssi }) => {
                    tracing::trace!(%shield, ?rssi, "Advertisement");
                    registry.on_advertisement(&shield, &services);
                }
                Some(other) => tracing::trace!(?other, "Ignoring event while scanning"),
                None => break,
            },
        }
    }

    if let Err(e) = link.stop_scan().await {
        tracing::warn!(error = %e, "Failed to stop scan");
    }
    registry.seal();

    tracing::info!(discovered = registry.len(), "Scan finished");
    Ok(registry.len())
}

/// Runs the whole pipeline against one link layer.
pub struct Coordinator<L: LinkLayer, T: TimeSource, C: ConfigSource> {
    link: Arc<L>,
    events: mpsc::Receiver<LinkEvent>,
    time_source: T,
    fetcher: RemoteConfigFetcher<C>,
    config: CoordinatorConfig,
    publisher: Box<dyn EventPublisher>,
}

impl<L: LinkLayer, T: TimeSource, C: ConfigSource> Coordinator<L, T, C> {
    /// Create a coordinator. Host-forwarding output goes to the log until
    /// [`with_publisher`](Self::with_publisher) is called.
    pub fn new(
        link: Arc<L>,
        events: mpsc::Receiver<LinkEvent>,
        time_source: T,
        config_source: C,
        config: CoordinatorConfig,
    ) -> Self {
        let fetcher = RemoteConfigFetcher::new(config_source, config.config_fetch);
        Self {
            link,
            events,
            time_source,
            fetcher,
            config,
            publisher: Box::new(TracingPublisher),
        }
    }

    /// Publish host-forwarding events through `publisher`.
    #[must_use]
    pub fn with_publisher(mut self, publisher: Box<dyn EventPublisher>) -> Self {
        self.publisher = publisher;
        self
    }

    /// Run to completion.
    ///
    /// # Errors
    ///
    /// Returns an error only if scanning cannot be started.
    pub async fn run(self) -> CoordinatorResult<Summary> {
        let Self {
            link,
            mut events,
            time_source,
            fetcher,
            config,
            publisher,
        } = self;

        let anchor = ClockAnchor::initialize(&time_source, config.time_backoff).await;

        let (fetched, config_origin) = fetcher.fetch_or_default().await;
        let remote = config.effective(fetched);

        let mut summary = Summary {
            mode: remote.running_mode,
            config_origin,
            registry_size: 0,
            live_links: 0,
            subscribed_links: 0,
            notifications: 0,
            completed_cycles: 0,
            forwarded_events: 0,
            disconnects: 0,
        };

        let registry = ShieldRegistry::new();
        summary.registry_size = discover(&*link, &mut events, &registry, config.scan_window).await?;
        if registry.is_empty() {
            tracing::warn!("No MyoWare wireless shields found");
            return Ok(summary);
        }

        let manager = ConnectionManager::new(Arc::clone(&link), config.retry.clone());
        apply_connection_params(&manager, &remote);

        let mut table = manager.run(&registry, remote.needed_client_numbers).await;
        summary.live_links = table.live_count();
        summary.subscribed_links = table.subscribed_count();

        let slot_order: Vec<ShieldId> =
            table.live_links().iter().map(|l| l.shield.clone()).collect();
        if remote.running_mode == RunningMode::Standalone
            && table.subscribed_count() < table.live_count()
        {
            tracing::warn!(
                live = table.live_count(),
                subscribed = table.subscribed_count(),
                "Connected shield without notifications; reporting cycles cannot complete"
            );
        }

        let decoder = NotificationDecoder::new(anchor, config.peripheral_interval_ms);
        let mut router = ModeRouter::for_mode(
            remote.running_mode,
            &slot_order,
            config.barrier,
            publisher,
        );

        tracing::info!(
            mode = %remote.running_mode,
            shields = slot_order.len(),
            "Processing notifications"
        );

        summary.disconnects =
            process_events(&mut events, &mut table, &decoder, &mut router, config.run_for).await;

        let stats = router.stats();
        summary.notifications = stats.notifications;
        summary.completed_cycles = stats.completed_cycles;
        summary.forwarded_events = stats.forwarded;

        tracing::info!(?summary, "Coordinator finished");
        Ok(summary)
    }
}

fn apply_connection_params<L: LinkLayer>(manager: &ConnectionManager<L>, remote: &RemoteConfig) {
    if !remote.enable_connection_params {
        return;
    }
    if let Err(e) = manager.apply_connection_params(&remote.connection_params) {
        tracing::warn!(error = %e, "Link layer rejected connection parameters");
    }
}

/// Event loop. Returns the number of links lost.
async fn process_events(
    events: &mut mpsc::Receiver<LinkEvent>,
    table: &mut LinkTable,
    decoder: &NotificationDecoder,
    router: &mut ModeRouter,
    run_for: Option<Duration>,
) -> usize {
    let deadline = run_for.map(|d| tokio::time::Instant::now() + d);
    let mut disconnects = 0;

    loop {
        let event = match deadline {
            Some(at) => match tokio::time::timeout_at(at, events.recv()).await {
                Ok(event) => event,
                Err(_) => {
                    tracing::debug!("Run duration elapsed");
                    break;
                }
            },
            None => events.recv().await,
        };
        let Some(event) = event else {
            tracing::info!("Link event channel closed");
            break;
        };

        match event {
            LinkEvent::Notification {
                shield,
                payload,
                received_at,
            } => {
                if !table.is_subscribed(&shield) {
                    tracing::trace!(%shield, "Notification from shield without subscription");
                    continue;
                }
                table.record_notification(&shield);
                let samples = decoder.decode_at(&shield, &payload, received_at);
                router.route(&shield, samples);
            }
            LinkEvent::Disconnected { shield, reason } => {
                if table.remove(&shield).is_some() {
                    disconnects += 1;
                    tracing::warn!(%shield, ?reason, "Shield disconnected");
                }
            }
            LinkEvent::Advertisement { shield, .. } => {
                tracing::trace!(%shield, "Ignoring advertisement after scan");
            }
        }
    }

    disconnects
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use myoware_core::types::ConnectionParams;

    use super::*;
    use crate::bridge::{RetryPolicy, ShieldScript, SimulatedLink};
    use crate::clock::SystemTimeSource;
    use crate::config::StaticConfigSource;
    use crate::streaming::{EmgEvent, PublishResult};

    #[derive(Clone, Default)]
    struct Recorder {
        events: Arc<Mutex<Vec<EmgEvent>>>,
    }

    impl EventPublisher for Recorder {
        fn publish(&self, event: EmgEvent) -> PublishResult<()> {
            self.events.lock().unwrap().push(event);
            Ok(())
        }
    }

    fn remote(mode: RunningMode, needed: usize) -> StaticConfigSource {
        StaticConfigSource(RemoteConfig {
            running_mode: mode,
            enable_connection_params: true,
            needed_client_numbers: needed,
            connection_params: ConnectionParams::default(),
        })
    }

    fn fast_config(run_for: Duration) -> CoordinatorConfig {
        CoordinatorConfig {
            scan_window: Duration::from_millis(30),
            retry: RetryPolicy {
                max_attempts: 5,
                backoff: Duration::from_millis(1),
                pass_delay: Duration::from_millis(1),
                max_passes: Some(3),
            },
            time_backoff: Duration::from_millis(1),
            run_for: Some(run_for),
            ..CoordinatorConfig::default()
        }
    }

    #[tokio::test]
    async fn test_discover_fills_and_seals_registry() {
        let (link, mut events) = SimulatedLink::builder()
            .emg_shields(3)
            .shield(ShieldScript::foreign("uart"))
            .advertisement_repeats(3)
            .build();
        let registry = ShieldRegistry::new();

        let found = discover(&link, &mut events, &registry, Duration::from_millis(30))
            .await
            .unwrap();

        assert_eq!(found, 3);
        assert!(registry.is_sealed());
        assert_eq!(registry.index_of(&ShieldId::from("shield-2")), Some(2));
    }

    #[tokio::test]
    async fn test_discover_outlasts_full_event_channel() {
        let (link, mut events) = SimulatedLink::builder().emg_shields(300).build();
        let registry = ShieldRegistry::new();

        let found = tokio::time::timeout(
            Duration::from_secs(3),
            discover(&link, &mut events, &registry, Duration::from_millis(200)),
        )
        .await
        .expect("scan window should elapse")
        .unwrap();

        assert_eq!(found, 300);
        assert_eq!(registry.index_of(&ShieldId::from("shield-299")), Some(299));
    }

    #[tokio::test]
    async fn test_standalone_cycles_complete() {
        let (link, events) = SimulatedLink::builder()
            .emg_shields(2)
            .emit_every(Duration::from_millis(5), 3)
            .build();

        let summary = Coordinator::new(
            Arc::new(link),
            events,
            SystemTimeSource,
            remote(RunningMode::Standalone, 2),
            fast_config(Duration::from_millis(200)),
        )
        .run()
        .await
        .unwrap();

        assert_eq!(summary.mode, RunningMode::Standalone);
        assert_eq!(summary.config_origin, ConfigOrigin::Remote);
        assert_eq!(summary.registry_size, 2);
        assert_eq!(summary.subscribed_links, 2);
        assert!(summary.completed_cycles > 0);
        assert_eq!(summary.forwarded_events, 0);
    }

    #[tokio::test]
    async fn test_injected_notifications_complete_one_cycle() {
        let (link, events) = SimulatedLink::builder().emg_shields(2).build();
        let link = Arc::new(link);
        let coordinator = Coordinator::new(
            Arc::clone(&link),
            events,
            SystemTimeSource,
            remote(RunningMode::Standalone, 2),
            fast_config(Duration::from_millis(300)),
        );
        let handle = tokio::spawn(coordinator.run());

        let a = ShieldId::from("shield-0");
        let b = ShieldId::from("shield-1");
        while !(link.is_subscribed(&a) && link.is_subscribed(&b)) {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        link.inject_notification(&a, vec![0, 1, 0, 100]).await.unwrap();
        link.inject_notification(&b, vec![0, 200]).await.unwrap();
        link.inject_notification(&a, vec![1, 44]).await.unwrap();

        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.notifications, 3);
        assert_eq!(summary.completed_cycles, 1);
    }

    #[tokio::test]
    async fn test_host_mode_forwards_samples() {
        let (link, events) = SimulatedLink::builder()
            .emg_shields(1)
            .emit_every(Duration::from_millis(5), 4)
            .build();
        let recorder = Recorder::default();

        let summary = Coordinator::new(
            Arc::new(link),
            events,
            SystemTimeSource,
            remote(RunningMode::HostForwarding, 1),
            fast_config(Duration::from_millis(100)),
        )
        .with_publisher(Box::new(recorder.clone()))
        .run()
        .await
        .unwrap();

        let forwarded = recorder.events.lock().unwrap();
        assert_eq!(summary.mode, RunningMode::HostForwarding);
        assert!(summary.forwarded_events > 0);
        assert_eq!(forwarded.len() as u64, summary.forwarded_events);
        assert_eq!(forwarded.len() % 4, 0);
        assert!(forwarded.iter().all(|e| e.device_id == "shield-0"));
        assert_eq!(summary.completed_cycles, 0);
    }

    #[tokio::test]
    async fn test_empty_registry_returns_without_links() {
        let (link, events) = SimulatedLink::builder()
            .shield(ShieldScript::foreign("uart"))
            .build();
        let link = Arc::new(link);

        let summary = Coordinator::new(
            Arc::clone(&link),
            events,
            SystemTimeSource,
            remote(RunningMode::Standalone, 8),
            fast_config(Duration::from_millis(50)),
        )
        .run()
        .await
        .unwrap();

        assert_eq!(summary.registry_size, 0);
        assert_eq!(summary.live_links, 0);
        assert_eq!(link.connect_attempts(&ShieldId::from("uart")), 0);
    }

    #[tokio::test]
    async fn test_disconnect_removes_link() {
        let (link, events) = SimulatedLink::builder().emg_shields(2).build();
        let link = Arc::new(link);
        let coordinator = Coordinator::new(
            Arc::clone(&link),
            events,
            SystemTimeSource,
            remote(RunningMode::Standalone, 2),
            fast_config(Duration::from_millis(200)),
        );
        let handle = tokio::spawn(coordinator.run());

        let a = ShieldId::from("shield-0");
        while !link.is_subscribed(&a) || !link.is_subscribed(&ShieldId::from("shield-1")) {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        link.disconnect(&a).await.unwrap();
        // Dropped: link is gone from the table
        link.inject_notification(&a, vec![0, 1]).await.unwrap();

        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.disconnects, 1);
        assert_eq!(summary.notifications, 0);
    }
}
