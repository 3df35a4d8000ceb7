//! Profile store: the single owner of `Customer` records.
//!
//! Writes go through a per-profile critical section. The `*_locked`
//! variants take a [`ProfileGuard`] so a caller composing several steps
//! (resolve identity, write, recompute derived state) can hold one
//! critical section across all of them.
//!
//! Writes here are raw: they do not recompute segments or predictions.
//! Callers that need the derived-state invariant go through the pipeline.

use std::sync::Arc;

use customer_core::{CdpError, CdpResult, Customer, ProfileView};
use tracing::{debug, info};

use crate::backend::{InMemoryBackend, ProfileBackend};
use crate::locks::{LockSet, ProfileGuard, ProfileLocks};

pub struct ProfileStore {
    backend: Arc<dyn ProfileBackend>,
    locks: ProfileLocks,
}

impl std::fmt::Debug for ProfileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProfileStore")
            .field("locks", &self.locks.len())
            .finish()
    }
}

impl ProfileStore {
    pub fn new(backend: Arc<dyn ProfileBackend>) -> Self {
        Self {
            backend,
            locks: ProfileLocks::new(),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryBackend::new()))
    }

    // ── Critical sections ─────────────────────────────────────────────

    pub fn lock(&self, id: &str) -> ProfileGuard {
        self.locks.acquire(id)
    }

    pub fn lock_many<I, S>(&self, ids: I) -> LockSet
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.locks.acquire_many(ids)
    }

    pub fn prune_idle_locks(&self) -> usize {
        self.locks.prune_idle()
    }

    pub fn prune_lock(&self, id: &str) -> bool {
        self.locks.prune(id)
    }

    /// Lock entries currently tracked, held or idle.
    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }

    // ── Reads ─────────────────────────────────────────────────────────

    pub fn get(&self, id: &str) -> CdpResult<Option<Customer>> {
        self.backend.get(id)
    }

    pub fn contains(&self, id: &str) -> CdpResult<bool> {
        Ok(self.backend.get(id)?.is_some())
    }

    /// Read-only snapshot for external callers. An unknown id is an expected
    /// outcome and yields `None`.
    pub fn get_360_view(&self, id: &str) -> CdpResult<Option<ProfileView>> {
        Ok(self.backend.get(id)?.as_ref().map(ProfileView::from))
    }

    pub fn ids(&self) -> CdpResult<Vec<String>> {
        self.backend.ids()
    }

    pub fn len(&self) -> CdpResult<usize> {
        Ok(self.backend.ids()?.len())
    }

    // ── Writes ────────────────────────────────────────────────────────

    pub fn create(&self, customer: Customer) -> CdpResult<String> {
        let guard = self.lock(&customer.id);
        self.create_locked(&guard, customer)
    }

    pub fn create_locked(&self, guard: &ProfileGuard, customer: Customer) -> CdpResult<String> {
        if customer.id.trim().is_empty() {
            return Err(CdpError::invalid("id", "profile id must not be empty"));
        }
        check_guard(guard, &customer.id)?;
        validate(&customer)?;
        if self.backend.get(&customer.id)?.is_some() {
            return Err(CdpError::invalid(
                "id",
                format!("profile {} already exists", customer.id),
            ));
        }
        let id = customer.id.clone();
        self.backend.put(&id, customer)?;
        info!(customer_id = %id, "Created profile");
        Ok(id)
    }

    /// Apply a mutation under the profile's critical section.
    pub fn update<F>(&self, id: &str, mutator: F) -> CdpResult<Customer>
    where
        F: FnOnce(&mut Customer) -> CdpResult<()>,
    {
        let guard = self.lock(id);
        self.update_locked(&guard, mutator)
    }

    pub fn update_locked<F>(&self, guard: &ProfileGuard, mutator: F) -> CdpResult<Customer>
    where
        F: FnOnce(&mut Customer) -> CdpResult<()>,
    {
        let current = self
            .backend
            .get(guard.id())?
            .ok_or_else(|| CdpError::not_found("customer", guard.id()))?;
        let mut updated = current.clone();
        mutator(&mut updated)?;
        check_transition(&current, &updated)?;
        self.backend.put(guard.id(), updated.clone())?;
        debug!(customer_id = %guard.id(), "Updated profile");
        Ok(updated)
    }

    /// Overwrite a profile the caller already built under `guard`.
    pub fn put_locked(&self, guard: &ProfileGuard, customer: Customer) -> CdpResult<()> {
        check_guard(guard, &customer.id)?;
        validate(&customer)?;
        if let Some(current) = self.backend.get(guard.id())? {
            check_transition(&current, &customer)?;
        }
        self.backend.put(guard.id(), customer)
    }

    pub fn delete(&self, id: &str) -> CdpResult<bool> {
        let guard = self.lock(id);
        self.delete_locked(&guard)
    }

    pub fn delete_locked(&self, guard: &ProfileGuard) -> CdpResult<bool> {
        let removed = self.backend.delete(guard.id())?;
        if removed {
            info!(customer_id = %guard.id(), "Deleted profile");
        }
        Ok(removed)
    }
}

fn check_guard(guard: &ProfileGuard, id: &str) -> CdpResult<()> {
    if guard.id() != id {
        return Err(CdpError::ConsistencyViolation(format!(
            "write to profile {id} attempted under the lock for {}",
            guard.id()
        )));
    }
    Ok(())
}

fn validate(customer: &Customer) -> CdpResult<()> {
    if !customer.lifetime_value.is_finite() || customer.lifetime_value < 0.0 {
        return Err(CdpError::invalid(
            "lifetime_value",
            format!("must be a non-negative number, got {}", customer.lifetime_value),
        ));
    }
    Ok(())
}

fn check_transition(current: &Customer, updated: &Customer) -> CdpResult<()> {
    if updated.id != current.id {
        return Err(CdpError::invalid("id", "profile id is immutable"));
    }
    if updated.created_at != current.created_at {
        return Err(CdpError::invalid("created_at", "creation time is immutable"));
    }
    if updated.events.len() < current.events.len()
        || updated.events[..current.events.len()] != current.events[..]
    {
        return Err(CdpError::invalid("events", "event history is append-only"));
    }
    validate(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use customer_core::types::CustomerEvent;
    use std::collections::HashMap;

    fn customer(id: &str) -> Customer {
        Customer::new(id, format!("{id}@example.com"), id.to_uppercase(), Utc::now())
    }

    #[test]
    fn test_create_get_and_view() {
        let store = ProfileStore::in_memory();
        let id = store
            .create(customer("cust-0").with_lifetime_value(1000.0))
            .unwrap();
        assert_eq!(id, "cust-0");

        let view = store.get_360_view("cust-0").unwrap().unwrap();
        assert_eq!(view.email, "cust-0@example.com");
        assert_eq!(view.lifetime_value, 1000.0);
        assert_eq!(view.total_events, 0);
        assert!(store.get_360_view("missing").unwrap().is_none());
    }

    #[test]
    fn test_create_rejects_duplicates_and_empty_ids() {
        let store = ProfileStore::in_memory();
        store.create(customer("c1")).unwrap();

        let err = store.create(customer("c1")).unwrap_err();
        assert!(matches!(err, CdpError::InvalidArgument { ref field, .. } if field == "id"));

        let err = store.create(customer("  ")).unwrap_err();
        assert!(matches!(err, CdpError::InvalidArgument { .. }));

        let err = store
            .create(customer("c2").with_lifetime_value(f64::NAN))
            .unwrap_err();
        assert!(
            matches!(err, CdpError::InvalidArgument { ref field, .. } if field == "lifetime_value")
        );
    }

    #[test]
    fn test_update_applies_mutation() {
        let store = ProfileStore::in_memory();
        store.create(customer("c1")).unwrap();

        let updated = store
            .update("c1", |c| {
                c.attributes.insert("plan".into(), serde_json::json!("pro"));
                c.record_event(CustomerEvent {
                    name: "login".into(),
                    properties: HashMap::new(),
                    timestamp: Utc::now(),
                });
                Ok(())
            })
            .unwrap();

        assert_eq!(updated.attributes["plan"], "pro");
        assert_eq!(store.get("c1").unwrap().unwrap().event_count(), 1);
    }

    #[test]
    fn test_update_unknown_profile_is_not_found() {
        let store = ProfileStore::in_memory();
        let err = store.update("ghost", |_| Ok(())).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_update_guards_immutable_fields() {
        let store = ProfileStore::in_memory();
        store.create(customer("c1")).unwrap();

        let err = store
            .update("c1", |c| {
                c.created_at -= Duration::days(1);
                Ok(())
            })
            .unwrap_err();
        assert!(
            matches!(err, CdpError::InvalidArgument { ref field, .. } if field == "created_at")
        );

        store
            .update("c1", |c| {
                c.record_event(CustomerEvent {
                    name: "login".into(),
                    properties: HashMap::new(),
                    timestamp: Utc::now(),
                });
                Ok(())
            })
            .unwrap();
        let err = store
            .update("c1", |c| {
                c.events.clear();
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, CdpError::InvalidArgument { ref field, .. } if field == "events"));
        assert_eq!(store.get("c1").unwrap().unwrap().event_count(), 1);
    }

    #[test]
    fn test_failed_mutator_writes_nothing() {
        let store = ProfileStore::in_memory();
        store.create(customer("c1")).unwrap();

        let err = store
            .update("c1", |c| {
                c.name = "changed".into();
                Err(CdpError::invalid("name", "rejected"))
            })
            .unwrap_err();
        assert!(matches!(err, CdpError::InvalidArgument { .. }));
        assert_eq!(store.get("c1").unwrap().unwrap().name, "C1");
    }

    #[test]
    fn test_put_locked_requires_matching_guard() {
        let store = ProfileStore::in_memory();
        let guard = store.lock("c1");
        let err = store.put_locked(&guard, customer("c2")).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_delete() {
        let store = ProfileStore::in_memory();
        store.create(customer("c1")).unwrap();
        assert!(store.delete("c1").unwrap());
        assert!(!store.delete("c1").unwrap());
        assert_eq!(store.len().unwrap(), 0);
        assert_eq!(store.prune_idle_locks(), 1);
    }
}
