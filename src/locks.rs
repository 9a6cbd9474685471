//! In-process implementation of the advisory cooperative lock service.
//!
//! Peers in one process space coordinate through named locks held in shared
//! or exclusive mode. The registry supports polling and blocking (optionally
//! timed) acquisition, a prefix snapshot used to scan the held `view@` locks,
//! and releases everything an owner holds when its [LockOwner] is dropped,
//! which is what bounds the damage of a peer dying mid-transaction.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sql_vfs::locks::{LockMode, LockService};
use tokio::sync::Notify;
use tokio::time::{self, Instant};

#[derive(Debug, Default)]
struct Entry {
    exclusive: Option<u64>,
    /// Shared holders with acquisition counts; an owner may pin the same
    /// name more than once (e.g. a presence hold next to a protocol hold).
    shared: HashMap<u64, u32>,
}

impl Entry {
    fn is_free(&self) -> bool {
        self.exclusive.is_none() && self.shared.is_empty()
    }
}

#[derive(Default)]
pub struct LockRegistry {
    entries: Mutex<HashMap<String, Entry>>,
    released: Notify,
    next_owner: AtomicU64,
}

impl LockRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(LockRegistry::default())
    }

    /// Allocate a lock owner for one connection context. Dropping the owner
    /// releases everything it still holds.
    pub fn owner(self: &Arc<Self>) -> LockOwner {
        LockOwner {
            registry: self.clone(),
            id: self.next_owner.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn release_all(&self, owner: u64) {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|_, entry| {
            if entry.exclusive == Some(owner) {
                entry.exclusive = None;
            }
            entry.shared.remove(&owner);
            !entry.is_free()
        });
        drop(entries);
        self.released.notify_waiters();
    }

    /// The lowest transaction id pinned by any held `view@` lock of `path`.
    pub fn lowest_view(&self, path: &str) -> Option<u64> {
        self.held(&sql_vfs::locks::view_lock_prefix(path))
            .iter()
            .filter_map(|name| sql_vfs::locks::parse_view_lock(name))
            .min()
    }
}

impl LockService for LockRegistry {
    fn try_acquire(&self, owner: u64, name: &str, mode: LockMode) -> bool {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.entry(name.to_string()).or_default();
        match mode {
            LockMode::Shared => {
                if entry.exclusive.map_or(false, |holder| holder != owner) {
                    return false;
                }
                *entry.shared.entry(owner).or_insert(0) += 1;
                true
            }
            LockMode::Exclusive => {
                if entry.exclusive == Some(owner) {
                    return true;
                }
                let foreign_share = entry.shared.keys().any(|holder| *holder != owner);
                if entry.exclusive.is_some() || foreign_share {
                    return false;
                }
                // Upgrading consumes the owner's own shares.
                entry.shared.remove(&owner);
                entry.exclusive = Some(owner);
                true
            }
        }
    }

    async fn acquire(
        &self,
        owner: u64,
        name: &str,
        mode: LockMode,
        timeout: Option<Duration>,
    ) -> bool {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        loop {
            // Subscribe before probing so a release between the probe and the
            // await cannot be missed.
            let released = self.released.notified();
            if self.try_acquire(owner, name, mode) {
                return true;
            }
            match deadline {
                Some(deadline) => {
                    if time::timeout_at(deadline, released).await.is_err() {
                        return false;
                    }
                }
                None => released.await,
            }
        }
    }

    fn release(&self, owner: u64, name: &str) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(name) {
            if entry.exclusive == Some(owner) {
                entry.exclusive = None;
            } else if let Some(count) = entry.shared.get_mut(&owner) {
                *count -= 1;
                if *count == 0 {
                    entry.shared.remove(&owner);
                }
            }
            if entry.is_free() {
                entries.remove(name);
            }
        }
        drop(entries);
        self.released.notify_waiters();
    }

    fn held(&self, prefix: &str) -> Vec<String> {
        let entries = self.entries.lock().unwrap();
        entries
            .iter()
            .filter(|(name, entry)| name.starts_with(prefix) && !entry.is_free())
            .map(|(name, _)| name.clone())
            .collect()
    }
}

/// RAII identity of one connection in the lock service.
pub struct LockOwner {
    registry: Arc<LockRegistry>,
    id: u64,
}

impl LockOwner {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for LockOwner {
    fn drop(&mut self) {
        self.registry.release_all(self.id);
    }
}

#[cfg(test)]
mod tests {
    use sql_vfs::locks::view_lock_name;

    use super::*;

    #[test]
    fn shared_and_exclusive_exclude_each_other() {
        let registry = LockRegistry::new();
        assert!(registry.try_acquire(1, "a", LockMode::Shared));
        assert!(registry.try_acquire(2, "a", LockMode::Shared));
        assert!(!registry.try_acquire(3, "a", LockMode::Exclusive));

        registry.release(1, "a");
        registry.release(2, "a");
        assert!(registry.try_acquire(3, "a", LockMode::Exclusive));
        assert!(!registry.try_acquire(1, "a", LockMode::Shared));
        assert!(registry.try_acquire(3, "a", LockMode::Shared), "own shares stack");
    }

    #[test]
    fn upgrade_requires_sole_ownership() {
        let registry = LockRegistry::new();
        assert!(registry.try_acquire(1, "a", LockMode::Shared));
        assert!(registry.try_acquire(1, "a", LockMode::Shared));
        assert!(registry.try_acquire(2, "a", LockMode::Shared));

        assert!(!registry.try_acquire(1, "a", LockMode::Exclusive));
        registry.release(2, "a");
        assert!(registry.try_acquire(1, "a", LockMode::Exclusive));

        // The upgrade consumed the shares; one release frees the name.
        registry.release(1, "a");
        assert!(registry.held("a").is_empty());
    }

    #[test]
    fn shared_counts_nest() {
        let registry = LockRegistry::new();
        assert!(registry.try_acquire(1, "a", LockMode::Shared));
        assert!(registry.try_acquire(1, "a", LockMode::Shared));
        registry.release(1, "a");
        assert_eq!(registry.held("a"), vec!["a".to_string()]);
        registry.release(1, "a");
        assert!(registry.held("a").is_empty());
    }

    #[tokio::test]
    async fn blocking_acquire_times_out_busy() {
        let registry = LockRegistry::new();
        assert!(registry.try_acquire(1, "a", LockMode::Exclusive));
        assert!(
            !registry
                .acquire(2, "a", LockMode::Shared, Some(Duration::from_millis(20)))
                .await
        );

        registry.release(1, "a");
        assert!(
            registry
                .acquire(2, "a", LockMode::Shared, Some(Duration::from_millis(20)))
                .await
        );
    }

    #[tokio::test]
    async fn blocking_acquire_wakes_on_release() {
        let registry = LockRegistry::new();
        assert!(registry.try_acquire(1, "a", LockMode::Exclusive));

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.acquire(2, "a", LockMode::Exclusive, None).await })
        };
        tokio::task::yield_now().await;
        registry.release(1, "a");
        assert!(waiter.await.unwrap());
    }

    #[test]
    fn owner_drop_releases_everything() {
        let registry = LockRegistry::new();
        let owner = registry.owner();
        assert!(registry.try_acquire(owner.id(), "a", LockMode::Exclusive));
        assert!(registry.try_acquire(owner.id(), "b", LockMode::Shared));

        drop(owner);
        assert!(registry.held("").is_empty());
    }

    #[test]
    fn lowest_view_scans_held_locks() {
        let registry = LockRegistry::new();
        assert_eq!(registry.lowest_view("/db"), None);

        assert!(registry.try_acquire(1, &view_lock_name("/db", 9), LockMode::Shared));
        assert!(registry.try_acquire(2, &view_lock_name("/db", 4), LockMode::Shared));
        assert!(registry.try_acquire(3, &view_lock_name("/other", 1), LockMode::Shared));
        assert_eq!(registry.lowest_view("/db"), Some(4));
    }
}
