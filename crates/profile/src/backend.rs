//! Persistence boundary for customer profiles.

use customer_core::{CdpResult, Customer};
use dashmap::DashMap;

/// Key-value profile persistence. Each call must be atomic for the single
/// record it touches; cross-record consistency is the store's job.
pub trait ProfileBackend: Send + Sync {
    fn get(&self, id: &str) -> CdpResult<Option<Customer>>;

    fn put(&self, id: &str, customer: Customer) -> CdpResult<()>;

    /// Returns `true` if a record was removed.
    fn delete(&self, id: &str) -> CdpResult<bool>;

    fn ids(&self) -> CdpResult<Vec<String>>;
}

/// Concurrent in-process backend backed by DashMap.
#[derive(Default)]
pub struct InMemoryBackend {
    profiles: DashMap<String, Customer>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

impl ProfileBackend for InMemoryBackend {
    fn get(&self, id: &str) -> CdpResult<Option<Customer>> {
        Ok(self.profiles.get(id).map(|c| c.clone()))
    }

    fn put(&self, id: &str, customer: Customer) -> CdpResult<()> {
        self.profiles.insert(id.to_string(), customer);
        Ok(())
    }

    fn delete(&self, id: &str) -> CdpResult<bool> {
        Ok(self.profiles.remove(id).is_some())
    }

    fn ids(&self) -> CdpResult<Vec<String>> {
        let mut ids: Vec<String> = self.profiles.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        Ok(ids)
    }
}
