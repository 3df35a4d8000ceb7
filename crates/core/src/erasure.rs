//! Contract between the privacy manager and every component that holds a
//! back-reference to a customer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A component holding derived state keyed by customer id.
///
/// `erase` runs after the profile itself has been removed from the store,
/// inside the customer's critical section. It must be infallible: the
/// profile deletion is the commit point of a cascading erasure and nothing
/// after it may leave the cascade half-applied.
pub trait ErasureParticipant: Send + Sync {
    /// Short component name used in logs and erasure reports.
    fn component(&self) -> &'static str;

    /// Whether this component currently holds any state for the customer.
    fn holds(&self, customer_id: &str) -> bool;

    fn erase(&self, customer_id: &str);
}

/// Cooperative cancellation handle. Cancellation is honoured only before a
/// cascading erasure reaches its commit point.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_flag_is_shared_between_clones() {
        let flag = CancelFlag::new();
        let observer = flag.clone();
        assert!(!observer.is_cancelled());
        flag.cancel();
        assert!(observer.is_cancelled());
    }
}
