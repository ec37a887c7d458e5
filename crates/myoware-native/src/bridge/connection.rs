//! Connection manager.
//!
//! Walks the sealed [`ShieldRegistry`] establishing links until a target
//! number of shields is connected:
//!
//! - Each shield gets up to [`RetryPolicy::max_attempts`] connect attempts
//!   per pass, [`RetryPolicy::backoff`] apart
//! - A connected shield is immediately subscribed to the EMG characteristic
//! - A failed subscribe leaves the link connected but silent
//! - Shields that exhaust their attempts are retried on the next pass
//! - Every pass visits each shield not yet connected, so a pass can leave
//!   more than the target live
//! - The target is checked between passes; passes repeat until it is met,
//!   optionally capped by [`RetryPolicy::max_passes`]
//!
//! The [`LinkTable`] is owned by the task running the manager, so every
//! change to the live-link count happens on one task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use myoware_core::types::ConnectionParams;

use super::link::{LinkLayer, LinkResult, ShieldId, EMG_CHARACTERISTIC};
use super::registry::ShieldRegistry;

// ============================================================================
// Retry Policy
// ============================================================================

/// Retry and pacing settings for the connection phase.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Connect attempts per shield per pass
    pub max_attempts: u32,
    /// Delay between attempts on the same shield
    pub backoff: Duration,
    /// Delay between passes over the registry
    pub pass_delay: Duration,
    /// Stop after this many passes (`None` retries for as long as the process runs)
    pub max_passes: Option<usize>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Duration::from_millis(200),
            pass_delay: Duration::from_secs(1),
            max_passes: None,
        }
    }
}

// ============================================================================
// Links
// ============================================================================

/// State of one link.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LinkState {
    /// Connect attempts in progress
    Connecting,
    /// Connected, notifications not armed
    Connected,
    /// Connected and notifications armed
    SubscriptionActive,
    /// Attempts exhausted for the current pass
    Failed,
}

impl LinkState {
    /// Whether the link is connected (subscribed or not).
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Connected | Self::SubscriptionActive)
    }
}

/// One link to one shield.
#[derive(Clone, Debug)]
pub struct Link {
    /// Shield this link targets
    pub shield: ShieldId,
    /// Position of the shield in the registry
    pub registry_index: usize,
    /// Current state
    pub state: LinkState,
    /// Connect attempts made across all passes
    pub attempts: u32,
    /// When the link came up
    pub connected_at: Option<Instant>,
    /// Notifications received over this link
    pub notifications: u64,
}

impl Link {
    fn new(shield: ShieldId, registry_index: usize) -> Self {
        Self {
            shield,
            registry_index,
            state: LinkState::Connecting,
            attempts: 0,
            connected_at: None,
            notifications: 0,
        }
    }

    /// Time since the link came up.
    #[must_use]
    pub fn connection_duration(&self) -> Option<Duration> {
        self.connected_at.map(|t| t.elapsed())
    }
}

/// All links, at most one per shield.
#[derive(Debug, Default)]
pub struct LinkTable {
    links: HashMap<ShieldId, Link>,
}

impl LinkTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Link for a shield.
    #[must_use]
    pub fn get(&self, shield: &ShieldId) -> Option<&Link> {
        self.links.get(shield)
    }

    /// Total number of entries, in any state.
    #[must_use]
    pub fn len(&self) -> usize {
        self.links.len()
    }

    /// Whether the table has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Whether the shield has a connected link.
    #[must_use]
    pub fn is_live(&self, shield: &ShieldId) -> bool {
        self.links.get(shield).is_some_and(|l| l.state.is_live())
    }

    /// Whether notifications from the shield should be processed.
    #[must_use]
    pub fn is_subscribed(&self, shield: &ShieldId) -> bool {
        self.links
            .get(shield)
            .is_some_and(|l| l.state == LinkState::SubscriptionActive)
    }

    /// Number of connected links.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.links.values().filter(|l| l.state.is_live()).count()
    }

    /// Number of links with notifications armed.
    #[must_use]
    pub fn subscribed_count(&self) -> usize {
        self.links
            .values()
            .filter(|l| l.state == LinkState::SubscriptionActive)
            .count()
    }

    /// Connected links ordered by registry index.
    #[must_use]
    pub fn live_links(&self) -> Vec<&Link> {
        let mut live: Vec<&Link> = self.links.values().filter(|l| l.state.is_live()).collect();
        live.sort_by_key(|l| l.registry_index);
        live
    }

    /// Iterate over all links in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &Link> {
        self.links.values()
    }

    /// Count a notification against a link.
    pub fn record_notification(&mut self, shield: &ShieldId) {
        if let Some(link) = self.links.get_mut(shield) {
            link.notifications += 1;
        }
    }

    /// Remove a link after a disconnect.
    pub fn remove(&mut self, shield: &ShieldId) -> Option<Link> {
        self.links.remove(shield)
    }

    /// Get or create the single entry for a shield and mark it connecting.
    fn begin(&mut self, shield: &ShieldId, registry_index: usize) -> &mut Link {
        let link = self
            .links
            .entry(shield.clone())
            .or_insert_with(|| Link::new(shield.clone(), registry_index));
        link.state = LinkState::Connecting;
        link
    }

    fn set_state(&mut self, shield: &ShieldId, state: LinkState) {
        if let Some(link) = self.links.get_mut(shield) {
            link.state = state;
            if state == LinkState::Connected {
                link.connected_at = Some(Instant::now());
            }
        }
    }
}

// ============================================================================
// Connection Manager
// ============================================================================

/// Drives connection attempts against registry entries.
pub struct ConnectionManager<L: LinkLayer> {
    link: Arc<L>,
    policy: RetryPolicy,
}

impl<L: LinkLayer> ConnectionManager<L> {
    /// Create a manager over a link layer.
    pub fn new(link: Arc<L>, policy: RetryPolicy) -> Self {
        Self { link, policy }
    }

    /// Retry policy in use.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Forward connection timing to the link layer.
    ///
    /// # Errors
    ///
    /// Returns the link layer's error if it rejects the parameters.
    pub fn apply_connection_params(&self, params: &ConnectionParams) -> LinkResult<()> {
        self.link.apply_connection_params(params)
    }

    /// Connect until `target` shields are live.
    ///
    /// Returns early if the pass cap is reached or if every registry entry
    /// is already connected and the target still cannot be met.
    pub async fn run(&self, registry: &ShieldRegistry, target: usize) -> LinkTable {
        let mut table = LinkTable::new();
        let shields = registry.ids();
        let mut pass = 0usize;

        tracing::info!(
            target,
            discovered = shields.len(),
            "Start connecting to MyoWare wireless shields"
        );

        while table.live_count() < target {
            if self.policy.max_passes.is_some_and(|max| pass >= max) {
                tracing::warn!(
                    passes = pass,
                    connected = table.live_count(),
                    target,
                    "Connection pass limit reached"
                );
                break;
            }
            if shields.iter().all(|s| table.is_live(s)) {
                tracing::warn!(
                    connected = table.live_count(),
                    target,
                    "Every discovered shield is connected; target not reachable"
                );
                break;
            }
            if pass > 0 {
                tokio::time::sleep(self.policy.pass_delay).await;
            }
            pass += 1;

            tracing::debug!(pass, connected = table.live_count(), target, "Connection pass");

            for (index, shield) in shields.iter().enumerate() {
                if table.is_live(shield) {
                    continue;
                }
                self.establish(&mut table, index, shield).await;
            }
        }

        tracing::info!(
            connected = table.live_count(),
            subscribed = table.subscribed_count(),
            "Connection phase finished"
        );
        table
    }

    /// Connect one shield with retries, then subscribe.
    async fn establish(&self, table: &mut LinkTable, index: usize, shield: &ShieldId) {
        tracing::debug!(%shield, "Trying to connect");
        table.begin(shield, index);

        let max_attempts = self.policy.max_attempts.max(1);
        let mut connected = false;

        for attempt in 1..=max_attempts {
            if let Some(link) = table.links.get_mut(shield) {
                link.attempts += 1;
            }

            match self.link.connect(shield).await {
                Ok(true) => {
                    connected = true;
                    break;
                }
                Ok(false) => {
                    tracing::debug!(%shield, attempt, "Connect returned without a live link");
                }
                Err(e) => {
                    tracing::debug!(%shield, attempt, error = %e, "Connect attempt failed");
                }
            }

            if attempt < max_attempts {
                tokio::time::sleep(self.policy.backoff).await;
            }
        }

        if !connected {
            table.set_state(shield, LinkState::Failed);
            tracing::warn!(
                %shield,
                attempts = max_attempts,
                "Connect attempts exhausted, giving up on shield for this pass"
            );
            return;
        }

        table.set_state(shield, LinkState::Connected);
        tracing::info!(%shield, "Connected");

        match self.link.subscribe(shield, EMG_CHARACTERISTIC).await {
            Ok(()) => {
                table.set_state(shield, LinkState::SubscriptionActive);
                tracing::info!(%shield, "Subscribed to notifications");
            }
            Err(e) => {
                tracing::warn!(
                    %shield,
                    error = %e,
                    "Subscribe failed; shield stays connected but sends no samples"
                );
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::link::EMG_SERVICE;
    use crate::bridge::simulated::{ShieldScript, SimulatedLink};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            backoff: Duration::from_millis(1),
            pass_delay: Duration::from_millis(1),
            max_passes: None,
        }
    }

    fn registry_of(ids: &[&str]) -> ShieldRegistry {
        let registry = ShieldRegistry::new();
        for id in ids {
            registry.on_advertisement(&ShieldId::from(*id), &[EMG_SERVICE]);
        }
        registry.seal();
        registry
    }

    #[tokio::test]
    async fn test_two_shields_connect_and_subscribe() {
        let (link, _events) = SimulatedLink::builder()
            .shield(ShieldScript::emg("A"))
            .shield(ShieldScript::emg("B"))
            .build();
        let link = Arc::new(link);
        let manager = ConnectionManager::new(Arc::clone(&link), fast_policy());

        let table = manager.run(&registry_of(&["A", "B"]), 2).await;

        assert_eq!(table.len(), 2);
        assert_eq!(table.subscribed_count(), 2);
        for id in ["A", "B"] {
            let entry = table.get(&ShieldId::from(id)).unwrap();
            assert_eq!(entry.state, LinkState::SubscriptionActive);
            assert_eq!(entry.attempts, 1);
        }
    }

    #[tokio::test]
    async fn test_exhausted_shield_retried_on_next_pass() {
        // Fails a whole pass of 5 attempts, then succeeds on the 6th
        let (link, _events) = SimulatedLink::builder()
            .shield(ShieldScript::emg("A").failing_connects(5))
            .shield(ShieldScript::emg("B"))
            .build();
        let link = Arc::new(link);
        let manager = ConnectionManager::new(Arc::clone(&link), fast_policy());

        let table = manager.run(&registry_of(&["A", "B"]), 2).await;

        assert_eq!(table.live_count(), 2);
        assert_eq!(link.connect_attempts(&ShieldId::from("A")), 6);
        assert_eq!(link.connect_attempts(&ShieldId::from("B")), 1);
        assert_eq!(table.get(&ShieldId::from("A")).unwrap().attempts, 6);
    }

    #[tokio::test]
    async fn test_subscribe_failure_leaves_link_connected() {
        let (link, _events) = SimulatedLink::builder()
            .shield(ShieldScript::emg("A").failing_subscribe())
            .shield(ShieldScript::emg("B"))
            .build();
        let manager = ConnectionManager::new(Arc::new(link), fast_policy());

        let table = manager.run(&registry_of(&["A", "B"]), 2).await;

        assert_eq!(table.live_count(), 2);
        assert_eq!(table.subscribed_count(), 1);
        assert_eq!(table.get(&ShieldId::from("A")).unwrap().state, LinkState::Connected);
        assert!(!table.is_subscribed(&ShieldId::from("A")));
    }

    #[tokio::test]
    async fn test_never_two_links_per_shield() {
        let (link, _events) = SimulatedLink::builder()
            .shield(ShieldScript::emg("A").failing_connects(12))
            .shield(ShieldScript::emg("B"))
            .build();
        let manager = ConnectionManager::new(Arc::new(link), fast_policy());

        let table = manager.run(&registry_of(&["A", "B"]), 2).await;

        assert_eq!(table.len(), 2);
        assert_eq!(table.iter().filter(|l| l.shield == ShieldId::from("A")).count(), 1);
    }

    #[tokio::test]
    async fn test_pass_cap_stops_unreachable_shield() {
        let (link, _events) = SimulatedLink::builder()
            .shield(ShieldScript::emg("A").failing_connects(u32::MAX))
            .shield(ShieldScript::emg("B"))
            .build();
        let link = Arc::new(link);
        let policy = RetryPolicy {
            max_passes: Some(3),
            ..fast_policy()
        };
        let manager = ConnectionManager::new(Arc::clone(&link), policy);

        let table = manager.run(&registry_of(&["A", "B"]), 2).await;

        assert_eq!(table.live_count(), 1);
        assert_eq!(table.get(&ShieldId::from("A")).unwrap().state, LinkState::Failed);
        assert_eq!(link.connect_attempts(&ShieldId::from("A")), 15);
    }

    #[tokio::test]
    async fn test_stops_when_registry_smaller_than_target() {
        let (link, _events) = SimulatedLink::builder().emg_shields(2).build();
        let registry = registry_of(&["shield-0", "shield-1"]);
        let manager = ConnectionManager::new(Arc::new(link), fast_policy());

        let table = manager.run(&registry, 8).await;

        assert_eq!(table.live_count(), 2);
    }

    #[tokio::test]
    async fn test_pass_visits_every_shield_past_target() {
        let (link, _events) = SimulatedLink::builder().emg_shields(3).build();
        let link = Arc::new(link);
        let registry = registry_of(&["shield-0", "shield-1", "shield-2"]);
        let manager = ConnectionManager::new(Arc::clone(&link), fast_policy());

        let table = manager.run(&registry, 2).await;

        assert_eq!(table.live_count(), 3);
        assert_eq!(link.connect_attempts(&ShieldId::from("shield-2")), 1);
        let order: Vec<usize> = table.live_links().iter().map(|l| l.registry_index).collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_no_second_pass_once_target_met() {
        // A exhausts its first pass; B and C reach the target of 2
        let (link, _events) = SimulatedLink::builder()
            .shield(ShieldScript::emg("A").failing_connects(5))
            .shield(ShieldScript::emg("B"))
            .shield(ShieldScript::emg("C"))
            .build();
        let link = Arc::new(link);
        let manager = ConnectionManager::new(Arc::clone(&link), fast_policy());

        let table = manager.run(&registry_of(&["A", "B", "C"]), 2).await;

        assert_eq!(table.live_count(), 2);
        assert_eq!(table.get(&ShieldId::from("A")).unwrap().state, LinkState::Failed);
        assert_eq!(link.connect_attempts(&ShieldId::from("A")), 5);
    }

    #[tokio::test]
    async fn test_zero_target_returns_immediately() {
        let (link, _events) = SimulatedLink::builder().emg_shields(1).build();
        let manager = ConnectionManager::new(Arc::new(link), fast_policy());

        let table = manager.run(&registry_of(&["shield-0"]), 0).await;
        assert!(table.is_empty());
    }
}
