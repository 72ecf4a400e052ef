//! `ActiveLinkRegistry`: tracks every live link and its refresh timer,
//! unregistering on link close (spec.md §4.5).
//!
//! Backed by [`dashmap::DashMap`] — a sharded, lock-free-from-the-caller's-
//! perspective concurrent map — per the design note in spec.md §9: "use a
//! lock-free map plus an atomic remove-and-return; never inspect the map to
//! decide to dispose the timer — the removal itself authorises disposal."

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{trace, warn};

use crate::error::{Result, ScopeError};
use crate::refresh::RefreshTimerHandle;

/// Unique identity of a registered link. Object identity, not link name —
/// two links could in principle share a name across reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LinkHandleId(u64);

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

impl LinkHandleId {
    pub fn next() -> Self {
        LinkHandleId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Tracks every link currently attached on the scope's connection.
///
/// Management links are tracked with no timer (`None`); producer/consumer
/// links always carry a [`RefreshTimerHandle`].
#[derive(Debug, Default)]
pub struct ActiveLinkRegistry {
    entries: DashMap<LinkHandleId, Option<RefreshTimerHandle>>,
}

impl ActiveLinkRegistry {
    pub fn new() -> Self {
        ActiveLinkRegistry {
            entries: DashMap::new(),
        }
    }

    /// Registers a freshly attached link. Duplicate insertion (the same id
    /// registered twice) is a fatal construction error, per spec.md §4.5 —
    /// retained for parity even though it can only happen as a programming
    /// error (`LinkHandleId` is always freshly minted).
    pub fn insert(&self, id: LinkHandleId, timer: Option<RefreshTimerHandle>) -> Result<()> {
        match self.entries.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(ScopeError::link_creation("could not create link"))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(timer);
                trace!(?id, "link registered");
                Ok(())
            }
        }
    }

    /// Atomically removes the entry and returns its timer, disarming and
    /// disposing it. No-op if the link was already removed (close handlers
    /// may fire more than once in theory; removal itself is idempotent).
    pub async fn remove_and_dispose(&self, id: LinkHandleId) {
        let removed = self.entries.remove(&id);
        match removed {
            Some((_, Some(timer))) => {
                timer.dispose().await;
                trace!(?id, "link unregistered, timer disposed");
            }
            Some((_, None)) => {
                trace!(?id, "link unregistered (no timer)");
            }
            None => {
                warn!(?id, "link close observed for an id no longer in the registry");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of every currently tracked id, for `CloseCoordinator` to
    /// iterate without holding the map locked while it closes links.
    pub fn snapshot_ids(&self) -> Vec<LinkHandleId> {
        self.entries.iter().map(|entry| *entry.key()).collect()
    }
}

pub type SharedRegistry = Arc<ActiveLinkRegistry>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refresh::{arm_refresh_timer, TokenRefresher};
    use async_trait::async_trait;
    use chrono::Utc;

    #[derive(Debug)]
    struct NeverRefresher;

    #[async_trait]
    impl TokenRefresher for NeverRefresher {
        async fn refresh(&self) -> Result<chrono::DateTime<Utc>, String> {
            Ok(Utc::now() + chrono::Duration::hours(1))
        }
    }

    #[test]
    fn insert_then_duplicate_insert_fails() {
        let registry = ActiveLinkRegistry::new();
        let id = LinkHandleId::next();
        registry.insert(id, None).unwrap();
        let err = registry.insert(id, None);
        assert!(matches!(err, Err(ScopeError::LinkCreation(_))));
    }

    #[tokio::test]
    async fn remove_and_dispose_clears_entry_and_disposes_timer() {
        let registry = ActiveLinkRegistry::new();
        let id = LinkHandleId::next();
        let timer = arm_refresh_timer("link".into(), Arc::new(NeverRefresher), Utc::now());
        registry.insert(id, Some(timer.clone())).unwrap();
        assert_eq!(registry.len(), 1);

        registry.remove_and_dispose(id).await;

        assert_eq!(registry.len(), 0);
        assert!(timer.is_disarmed());
    }

    #[tokio::test]
    async fn remove_and_dispose_is_idempotent_for_missing_id() {
        let registry = ActiveLinkRegistry::new();
        let id = LinkHandleId::next();
        // Never inserted; must not panic.
        registry.remove_and_dispose(id).await;
        assert!(registry.is_empty());
    }

    #[test]
    fn management_links_are_tracked_without_a_timer() {
        let registry = ActiveLinkRegistry::new();
        let id = LinkHandleId::next();
        registry.insert(id, None).unwrap();
        assert_eq!(registry.len(), 1);
    }
}
