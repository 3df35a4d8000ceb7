//! Privacy manager: consent recording and cascading erasure.
//!
//! Erasure runs inside the customer's critical section. Removing the
//! profile from the store is the commit point: cancellation is honoured up
//! to it, and every participant cleanup after it is infallible, so a
//! cascade is either not started or fully applied.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use customer_core::types::DeletionRecord;
use customer_core::{CancelFlag, CdpError, CdpResult, ErasureParticipant};
use customer_profile::{ProfileGuard, ProfileStore};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use crate::consent::{ConsentDecision, ConsentEvent, ConsentLedger};

/// Result of a deletion request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum ErasureOutcome {
    Erased {
        record: DeletionRecord,
        /// Components that held state for the customer when the cascade ran.
        components: Vec<String>,
    },
    /// The customer was already gone. Retried requests land here.
    AlreadyAbsent,
}

impl ErasureOutcome {
    pub fn is_erased(&self) -> bool {
        matches!(self, ErasureOutcome::Erased { .. })
    }
}

#[derive(Default)]
pub struct PrivacyManager {
    consents: ConsentLedger,
    deletions: Mutex<Vec<DeletionRecord>>,
}

impl std::fmt::Debug for PrivacyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivacyManager")
            .field("consents", &self.consents)
            .field("deletions", &self.deletions.lock().len())
            .finish()
    }
}

impl PrivacyManager {
    pub fn new() -> Self {
        Self::default()
    }

    // ─── Consent ────────────────────────────────────────────────────────

    pub fn record_consent(
        &self,
        customer_id: &str,
        purpose: &str,
        granted: bool,
        now: DateTime<Utc>,
    ) -> CdpResult<ConsentDecision> {
        self.consents.record(customer_id, purpose, granted, now)
    }

    pub fn consent_for(&self, customer_id: &str, purpose: &str) -> Option<ConsentDecision> {
        self.consents.consent_for(customer_id, purpose)
    }

    pub fn has_consent(&self, customer_id: &str, purpose: &str) -> bool {
        self.consents.has_consent(customer_id, purpose)
    }

    pub fn consents_of(&self, customer_id: &str) -> BTreeMap<String, ConsentDecision> {
        self.consents.consents_of(customer_id)
    }

    pub fn consent_log(&self) -> Vec<ConsentEvent> {
        self.consents.history()
    }

    pub fn consent_customer_count(&self) -> usize {
        self.consents.customer_count()
    }

    // ─── Erasure ────────────────────────────────────────────────────────

    /// Erase a customer from the store and from every participant.
    pub fn process_deletion(
        &self,
        store: &ProfileStore,
        customer_id: &str,
        participants: &[&dyn ErasureParticipant],
        cancel: &CancelFlag,
        now: DateTime<Utc>,
    ) -> CdpResult<ErasureOutcome> {
        let guard = store.lock(customer_id);
        self.process_deletion_locked(store, &guard, participants, cancel, now)
    }

    /// As [`process_deletion`](Self::process_deletion), for callers already
    /// holding the customer's critical section.
    pub fn process_deletion_locked(
        &self,
        store: &ProfileStore,
        guard: &ProfileGuard,
        participants: &[&dyn ErasureParticipant],
        cancel: &CancelFlag,
        now: DateTime<Utc>,
    ) -> CdpResult<ErasureOutcome> {
        let customer_id = guard.id();

        if store.get(customer_id)?.is_none() {
            // Derived state must not outlive its profile; sweep anything a
            // crashed earlier cascade left behind.
            for participant in participants {
                if participant.holds(customer_id) {
                    warn!(
                        customer_id,
                        component = participant.component(),
                        "Sweeping state left for an absent customer"
                    );
                    participant.erase(customer_id);
                }
            }
            warn!(customer_id, "Deletion requested for unknown customer; nothing to do");
            return Ok(ErasureOutcome::AlreadyAbsent);
        }

        if cancel.is_cancelled() {
            info!(customer_id, "Deletion cancelled before commit");
            return Err(CdpError::Cancelled(format!(
                "deletion of {customer_id} cancelled before commit"
            )));
        }

        let components: Vec<String> = participants
            .iter()
            .filter(|p| p.holds(customer_id))
            .map(|p| p.component().to_string())
            .collect();

        if !store.delete_locked(guard)? {
            return Err(CdpError::ConsistencyViolation(format!(
                "profile {customer_id} vanished while its lock was held"
            )));
        }

        for participant in participants {
            participant.erase(customer_id);
        }

        let record = DeletionRecord {
            customer_id: customer_id.to_string(),
            processed_at: now,
        };
        self.deletions.lock().push(record.clone());

        info!(customer_id, components = ?components, "Deleted data for customer");
        Ok(ErasureOutcome::Erased { record, components })
    }

    /// Append-only deletion log.
    pub fn deletion_log(&self) -> Vec<DeletionRecord> {
        self.deletions.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use customer_core::config::{ScoringConfig, SegmentationConfig};
    use customer_core::{Customer, Segment};
    use customer_journey::{EnrollmentState, JourneyOrchestrator, JourneyStage};
    use customer_scoring::PredictiveEngine;
    use customer_segmentation::SegmentationEngine;

    struct Fixture {
        store: ProfileStore,
        segmentation: SegmentationEngine,
        scoring: PredictiveEngine,
        journeys: JourneyOrchestrator,
        privacy: PrivacyManager,
    }

    impl Fixture {
        fn new() -> Self {
            let fixture = Self {
                store: ProfileStore::in_memory(),
                segmentation: SegmentationEngine::new(&SegmentationConfig::default()),
                scoring: PredictiveEngine::new(&ScoringConfig::default()),
                journeys: JourneyOrchestrator::new(),
                privacy: PrivacyManager::new(),
            };
            fixture
                .journeys
                .define_journey(
                    "onboarding",
                    vec![JourneyStage::new("welcome", "send_email")],
                    Utc::now(),
                )
                .unwrap();
            fixture
        }

        fn seed(&self, id: &str) {
            let now = Utc::now();
            let mut customer = Customer::new(id, format!("{id}@example.com"), id, now)
                .with_lifetime_value(20_000.0)
                .with_last_activity(now);
            self.segmentation.recompute(&mut customer, now);
            self.scoring.recompute(&customer, now);
            self.store.create(customer).unwrap();
            self.journeys.enroll(id, "onboarding", now).unwrap();
        }

        fn participants(&self) -> Vec<&dyn ErasureParticipant> {
            vec![
                &self.segmentation as &dyn ErasureParticipant,
                &self.scoring,
                &self.journeys,
            ]
        }

        fn delete(&self, id: &str, cancel: &CancelFlag) -> CdpResult<ErasureOutcome> {
            self.privacy.process_deletion(
                &self.store,
                id,
                &self.participants(),
                cancel,
                Utc::now(),
            )
        }
    }

    #[test]
    fn test_erasure_cascades_to_every_component() {
        let fixture = Fixture::new();
        fixture.seed("cust-0");
        fixture.seed("cust-1");

        let outcome = fixture.delete("cust-0", &CancelFlag::new()).unwrap();
        match outcome {
            ErasureOutcome::Erased { record, components } => {
                assert_eq!(record.customer_id, "cust-0");
                assert_eq!(components, vec!["segmentation", "predictive_scoring", "journey"]);
            }
            other => panic!("unexpected outcome {other:?}"),
        }

        assert!(fixture.store.get_360_view("cust-0").unwrap().is_none());
        for segment in Segment::ALL {
            assert!(!fixture.segmentation.members(segment).contains("cust-0"));
        }
        assert!(fixture.scoring.prediction("cust-0").is_none());
        assert!(matches!(
            fixture.journeys.state("cust-0"),
            EnrollmentState::Withdrawn { .. }
        ));

        // The other customer is untouched.
        assert!(fixture.segmentation.members(Segment::HighValue).contains("cust-1"));
        assert!(fixture.scoring.prediction("cust-1").is_some());
    }

    #[test]
    fn test_second_deletion_is_a_noop() {
        let fixture = Fixture::new();
        fixture.seed("cust-0");

        assert!(fixture.delete("cust-0", &CancelFlag::new()).unwrap().is_erased());
        assert_eq!(
            fixture.delete("cust-0", &CancelFlag::new()).unwrap(),
            ErasureOutcome::AlreadyAbsent
        );
        assert_eq!(fixture.privacy.deletion_log().len(), 1);
    }

    #[test]
    fn test_cancelled_deletion_changes_nothing() {
        let fixture = Fixture::new();
        fixture.seed("cust-0");

        let cancel = CancelFlag::new();
        cancel.cancel();
        let err = fixture.delete("cust-0", &cancel).unwrap_err();
        assert!(matches!(err, CdpError::Cancelled(_)));

        assert!(fixture.store.contains("cust-0").unwrap());
        assert!(fixture.segmentation.holds("cust-0"));
        assert!(fixture.scoring.holds("cust-0"));
        assert!(fixture.journeys.holds("cust-0"));
        assert!(fixture.privacy.deletion_log().is_empty());
    }

    #[test]
    fn test_absent_customer_sweeps_leftovers() {
        let fixture = Fixture::new();
        fixture.journeys.enroll("ghost", "onboarding", Utc::now()).unwrap();

        let outcome = fixture.delete("ghost", &CancelFlag::new()).unwrap();
        assert_eq!(outcome, ErasureOutcome::AlreadyAbsent);
        assert!(!fixture.journeys.holds("ghost"));
        assert!(fixture.privacy.deletion_log().is_empty());
    }

    #[test]
    fn test_consent_survives_erasure() {
        let fixture = Fixture::new();
        fixture.seed("cust-0");
        fixture
            .privacy
            .record_consent("cust-0", "marketing", true, Utc::now())
            .unwrap();

        fixture.delete("cust-0", &CancelFlag::new()).unwrap();
        assert!(fixture.privacy.has_consent("cust-0", "marketing"));
        assert_eq!(fixture.privacy.consent_log().len(), 1);
    }
}
