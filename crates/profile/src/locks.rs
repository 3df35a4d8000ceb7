//! Per-profile critical sections.
//!
//! Every read-then-write of a customer runs while holding that customer's
//! guard. Operations spanning several profiles take all guards through
//! [`ProfileLocks::acquire_many`], which always locks in ascending id order
//! so two multi-profile operations can never deadlock each other.

use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{ArcMutexGuard, Mutex, RawMutex};

/// Exclusive access to one profile id, released on drop.
pub struct ProfileGuard {
    id: String,
    _guard: ArcMutexGuard<RawMutex, ()>,
}

impl ProfileGuard {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl std::fmt::Debug for ProfileGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProfileGuard").field("id", &self.id).finish()
    }
}

/// Guards for several profiles, held in ascending id order.
#[derive(Debug, Default)]
pub struct LockSet {
    guards: Vec<ProfileGuard>,
}

impl LockSet {
    pub fn ids(&self) -> BTreeSet<String> {
        self.guards.iter().map(|g| g.id.clone()).collect()
    }

    pub fn holds(&self, id: &str) -> bool {
        self.guards.iter().any(|g| g.id == id)
    }

    pub fn guard(&self, id: &str) -> Option<&ProfileGuard> {
        self.guards.iter().find(|g| g.id == id)
    }

    pub fn len(&self) -> usize {
        self.guards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }
}

#[derive(Default)]
pub struct ProfileLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ProfileLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the profile's critical section is free. Not re-entrant:
    /// a thread must not acquire an id it already holds.
    pub fn acquire(&self, id: &str) -> ProfileGuard {
        // Clone the Arc out so the DashMap shard is not held while blocking.
        let mutex = self.locks.entry(id.to_string()).or_default().clone();
        ProfileGuard {
            id: id.to_string(),
            _guard: mutex.lock_arc(),
        }
    }

    pub fn acquire_many<I, S>(&self, ids: I) -> LockSet
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ordered: BTreeSet<String> = ids.into_iter().map(Into::into).collect();
        LockSet {
            guards: ordered.iter().map(|id| self.acquire(id)).collect(),
        }
    }

    /// Drop lock entries nobody holds or waits on. Returns how many went.
    pub fn prune_idle(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);
        before - self.locks.len()
    }

    /// Drop the lock entry for `id` if nobody holds or waits on it.
    pub fn prune(&self, id: &str) -> bool {
        self.locks
            .remove_if(id, |_, mutex| Arc::strong_count(mutex) == 1)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_acquire_many_orders_and_dedups() {
        let locks = ProfileLocks::new();
        let set = locks.acquire_many(["c3", "c1", "c2", "c1"]);
        assert_eq!(set.len(), 3);
        let ids: Vec<String> = set.ids().into_iter().collect();
        assert_eq!(ids, vec!["c1", "c2", "c3"]);
        assert!(set.holds("c2"));
        assert_eq!(set.guard("c3").map(|g| g.id()), Some("c3"));
    }

    #[test]
    fn test_prune_idle_keeps_held_locks() {
        let locks = ProfileLocks::new();
        let held = locks.acquire("c1");
        drop(locks.acquire("c2"));
        assert_eq!(locks.len(), 2);

        assert_eq!(locks.prune_idle(), 1);
        assert_eq!(locks.len(), 1);
        drop(held);
        assert_eq!(locks.prune_idle(), 1);
        assert!(locks.is_empty());
    }

    #[test]
    fn test_prune_single_entry() {
        let locks = ProfileLocks::new();
        let held = locks.acquire("c1");
        assert!(!locks.prune("c1"));
        drop(held);
        assert!(locks.prune("c1"));
        assert!(!locks.prune("c1"));
        assert!(locks.is_empty());
    }

    #[test]
    fn test_same_profile_is_serialized() {
        let locks = Arc::new(ProfileLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let locks = locks.clone();
                let inside = inside.clone();
                let max_seen = max_seen.clone();
                thread::spawn(move || {
                    for _ in 0..50 {
                        let _guard = locks.acquire("shared");
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }
}
