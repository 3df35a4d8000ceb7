//! Consent ledger: current decision per (customer, purpose) plus an
//! append-only audit log of every decision ever recorded.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use customer_core::{CdpError, CdpResult};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

/// The current consent decision for one purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentDecision {
    pub granted: bool,
    pub timestamp: DateTime<Utc>,
}

/// Audit entry appended for every recorded decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentEvent {
    pub customer_id: String,
    pub purpose: String,
    pub granted: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Default)]
pub struct ConsentLedger {
    current: DashMap<String, BTreeMap<String, ConsentDecision>>,
    log: Mutex<Vec<ConsentEvent>>,
}

impl std::fmt::Debug for ConsentLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsentLedger")
            .field("customers", &self.current.len())
            .field("log_entries", &self.log.lock().len())
            .finish()
    }
}

impl ConsentLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert the decision for `purpose`. Last write wins; recording the same
    /// decision twice leaves the current state unchanged apart from its
    /// timestamp.
    pub fn record(
        &self,
        customer_id: &str,
        purpose: &str,
        granted: bool,
        timestamp: DateTime<Utc>,
    ) -> CdpResult<ConsentDecision> {
        if customer_id.trim().is_empty() {
            return Err(CdpError::invalid("customer_id", "must not be empty"));
        }
        let purpose = purpose.trim();
        if purpose.is_empty() {
            return Err(CdpError::invalid("purpose", "must not be empty"));
        }

        let decision = ConsentDecision { granted, timestamp };
        {
            let mut purposes = self.current.entry(customer_id.to_string()).or_default();
            purposes.insert(purpose.to_string(), decision);
            // Appended while the customer's entry is held so the log order
            // matches the order decisions took effect.
            self.log.lock().push(ConsentEvent {
                customer_id: customer_id.to_string(),
                purpose: purpose.to_string(),
                granted,
                timestamp,
            });
        }

        info!(customer_id, purpose, granted, "Consent recorded");
        Ok(decision)
    }

    pub fn consent_for(&self, customer_id: &str, purpose: &str) -> Option<ConsentDecision> {
        self.current
            .get(customer_id)
            .and_then(|purposes| purposes.get(purpose.trim()).copied())
    }

    /// Absent decisions count as not granted.
    pub fn has_consent(&self, customer_id: &str, purpose: &str) -> bool {
        self.consent_for(customer_id, purpose)
            .map(|d| d.granted)
            .unwrap_or(false)
    }

    pub fn consents_of(&self, customer_id: &str) -> BTreeMap<String, ConsentDecision> {
        self.current
            .get(customer_id)
            .map(|purposes| purposes.clone())
            .unwrap_or_default()
    }

    pub fn history(&self) -> Vec<ConsentEvent> {
        self.log.lock().clone()
    }

    /// Number of customers with at least one decision on record.
    pub fn customer_count(&self) -> usize {
        self.current.len()
    }
}
