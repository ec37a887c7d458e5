//! Registry of shields discovered during the scan window.
//!
//! The registry is append-only while scanning and read-only once sealed.
//! Insertion order is stable and gives every shield a registry index.

use std::sync::{Mutex, MutexGuard, PoisonError};

use uuid::Uuid;

use super::link::{ShieldId, EMG_SERVICE};

#[derive(Debug, Default)]
struct RegistryInner {
    shields: Vec<ShieldId>,
    discovered: usize,
    sealed: bool,
}

/// Insertion-ordered set of discovered shields.
#[derive(Debug)]
pub struct ShieldRegistry {
    service: Uuid,
    inner: Mutex<RegistryInner>,
}

impl ShieldRegistry {
    /// Create a registry accepting advertisements for the EMG service.
    #[must_use]
    pub fn new() -> Self {
        Self::for_service(EMG_SERVICE)
    }

    /// Create a registry accepting advertisements for `service`.
    #[must_use]
    pub fn for_service(service: Uuid) -> Self {
        Self {
            service,
            inner: Mutex::new(RegistryInner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        // The inner state stays consistent under panic (single push + counter)
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Handle one advertisement.
    ///
    /// Returns `true` if the shield was newly added. Advertisements without
    /// the service, repeats, and anything after [`seal`](Self::seal) are
    /// ignored.
    pub fn on_advertisement(&self, shield: &ShieldId, advertised: &[Uuid]) -> bool {
        if !advertised.contains(&self.service) {
            return false;
        }

        let mut inner = self.lock();
        if inner.sealed {
            tracing::trace!(%shield, "Registry sealed, ignoring advertisement");
            return false;
        }
        if inner.shields.contains(shield) {
            tracing::debug!(%shield, "Duplicate shield found");
            return false;
        }

        inner.shields.push(shield.clone());
        inner.discovered += 1;
        tracing::info!(%shield, count = inner.discovered, "Found MyoWare wireless shield");
        true
    }

    /// End the discovery phase.
    pub fn seal(&self) {
        self.lock().sealed = true;
    }

    /// Whether discovery has ended.
    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.lock().sealed
    }

    /// Number of shields in the registry.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().shields.len()
    }

    /// Whether no shield has been discovered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().shields.is_empty()
    }

    /// Number of distinct shields accepted so far.
    #[must_use]
    pub fn discovered_count(&self) -> usize {
        self.lock().discovered
    }

    /// Snapshot of the shields in registry order.
    #[must_use]
    pub fn ids(&self) -> Vec<ShieldId> {
        self.lock().shields.clone()
    }

    /// Registry index of a shield.
    #[must_use]
    pub fn index_of(&self, shield: &ShieldId) -> Option<usize> {
        self.lock().shields.iter().position(|s| s == shield)
    }
}

impl Default for ShieldRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_accepts_emg_advertisement() {
        let registry = ShieldRegistry::new();
        let shield = ShieldId::from("A");

        assert!(registry.on_advertisement(&shield, &[EMG_SERVICE]));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.discovered_count(), 1);
        assert_eq!(registry.index_of(&shield), Some(0));
    }

    #[test]
    fn test_ignores_foreign_service() {
        let registry = ShieldRegistry::new();
        let other = Uuid::from_u128(0x6E40_0001_B5A3_F393_E0A9_E50E_24DC_CA9E);

        assert!(!registry.on_advertisement(&ShieldId::from("uart"), &[other]));
        assert!(!registry.on_advertisement(&ShieldId::from("bare"), &[]));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_duplicates_never_stored() {
        let registry = ShieldRegistry::new();
        let ids = ["A", "B", "A", "C", "B", "A", "A"];

        for id in ids {
            registry.on_advertisement(&ShieldId::from(id), &[EMG_SERVICE]);
        }

        let stored = registry.ids();
        assert_eq!(stored, vec![ShieldId::from("A"), ShieldId::from("B"), ShieldId::from("C")]);
        assert_eq!(registry.discovered_count(), 3);
    }

    #[test]
    fn test_concurrent_advertisements_keep_set_unique() {
        let registry = Arc::new(ShieldRegistry::new());

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let id = ShieldId::new(format!("shield-{}", (i + t) % 10));
                        registry.on_advertisement(&id, &[EMG_SERVICE]);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let mut ids = registry.ids();
        assert_eq!(ids.len(), 10);
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 10);
    }

    #[test]
    fn test_sealed_registry_is_read_only() {
        let registry = ShieldRegistry::new();
        registry.on_advertisement(&ShieldId::from("A"), &[EMG_SERVICE]);
        registry.seal();

        assert!(registry.is_sealed());
        assert!(!registry.on_advertisement(&ShieldId::from("B"), &[EMG_SERVICE]));
        assert_eq!(registry.ids(), vec![ShieldId::from("A")]);
    }
}
