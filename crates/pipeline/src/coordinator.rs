//! Coordinator: owns every component of one service instance and runs the
//! fixed pipeline: identity graph, profile store write, segmentation,
//! predictive scoring.
//!
//! Derived state is computed on the in-memory copy before the store write
//! and published to the segment index and prediction table only after the
//! write commits. A failed write therefore leaves no trace in derived state.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use customer_core::clock::system_clock;
use customer_core::event_bus::{make_event, noop_sink, EventSink};
use customer_core::types::ProfileEventType::{
    self, ConsentRecorded, IdentityMerged, JourneyAdvanced, JourneyCompleted, JourneyEnrolled,
    ProfileCreated, ProfileErased, ProfileUpdated, SegmentsChanged,
};
use customer_core::types::DeletionRecord;
use customer_core::{
    Alias, AppConfig, CancelFlag, CdpError, CdpResult, Clock, Customer, ErasureParticipant,
    ProfileView, Segment,
};
use customer_journey::{EnrollmentState, JourneyOrchestrator, JourneyStage, JourneyTemplate};
use customer_privacy::{ConsentDecision, ErasureOutcome, PrivacyManager};
use customer_profile::{
    IdentityGraph, InMemoryBackend, LockSet, ProfileBackend, ProfileStore, Resolution,
    ResolveAttempt,
};
use customer_scoring::{PredictionRecord, PredictiveEngine};
use customer_segmentation::{SegmentChange, SegmentationEngine};
use serde_json::json;
use tracing::{debug, info, warn};

/// Upper bound on lock-then-resolve rounds. Each round only grows the lock
/// set, so running out means the graph keeps changing under us.
const MAX_RESOLVE_ATTEMPTS: usize = 16;

/// Locks held for an identity-touching write, plus whatever the caller read
/// once they were held.
pub(crate) struct IdentityLocks<T> {
    pub locks: LockSet,
    pub resolution: Option<Resolution>,
    pub prior: T,
}

pub struct Coordinator {
    config: AppConfig,
    clock: Arc<dyn Clock>,
    store: ProfileStore,
    identity: IdentityGraph,
    segmentation: SegmentationEngine,
    scoring: PredictiveEngine,
    journeys: JourneyOrchestrator,
    privacy: PrivacyManager,
    event_sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("node_id", &self.config.node_id)
            .field("store", &self.store)
            .field("identity_groups", &self.identity.group_count())
            .field("segmentation", &self.segmentation)
            .field("journeys", &self.journeys)
            .field("privacy", &self.privacy)
            .finish()
    }
}

impl Coordinator {
    pub fn new(config: AppConfig, backend: Arc<dyn ProfileBackend>, clock: Arc<dyn Clock>) -> Self {
        info!(
            node_id = %config.node_id,
            high_value_threshold = config.segmentation.high_value_threshold,
            churn_horizon_days = config.scoring.churn_horizon_days,
            "Starting customer data coordinator"
        );
        Self {
            segmentation: SegmentationEngine::new(&config.segmentation),
            scoring: PredictiveEngine::new(&config.scoring),
            store: ProfileStore::new(backend),
            identity: IdentityGraph::new(),
            journeys: JourneyOrchestrator::new(),
            privacy: PrivacyManager::new(),
            event_sink: noop_sink(),
            clock,
            config,
        }
    }

    /// In-memory backend and system clock.
    pub fn in_memory(config: AppConfig) -> Self {
        Self::new(config, Arc::new(InMemoryBackend::new()), system_clock())
    }

    /// Attach an event sink for emitting profile events.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> &ProfileStore {
        &self.store
    }

    pub fn identity(&self) -> &IdentityGraph {
        &self.identity
    }

    pub fn segmentation(&self) -> &SegmentationEngine {
        &self.segmentation
    }

    pub fn scoring(&self) -> &PredictiveEngine {
        &self.scoring
    }

    pub fn journeys(&self) -> &JourneyOrchestrator {
        &self.journeys
    }

    pub fn privacy(&self) -> &PrivacyManager {
        &self.privacy
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // ─── Profiles ───────────────────────────────────────────────────────

    /// Create a profile. Its email, if any, is resolved in the identity
    /// graph, and segments and predictions are derived before it is stored.
    pub fn create_profile(&self, customer: Customer) -> CdpResult<String> {
        let now = self.now();
        let id = customer.id.trim().to_string();
        if id.is_empty() || id != customer.id {
            return Err(CdpError::invalid(
                "id",
                "profile id must be non-empty and carry no surrounding whitespace",
            ));
        }

        let aliases = email_alias(&customer.email);
        let IdentityLocks {
            locks, resolution, ..
        } = self.with_identity_locks(Some(&id), &aliases, now, |_| {
            if self.store.contains(&id)? {
                return Err(CdpError::invalid("id", format!("profile {id} already exists")));
            }
            Ok(())
        })?;
        let guard = locks.guard(&id).ok_or_else(|| missing_guard(&id))?;

        let mut customer = customer;
        customer.canonical_key = resolution.as_ref().map(|r| r.key.clone());
        let predictions = self.derive(&mut customer, now);

        if let Err(err) = self.store.create_locked(guard, customer.clone()) {
            if let Some(resolution) = &resolution {
                self.unlink_failed(&id, resolution);
            }
            return Err(err);
        }

        if let Some(resolution) = &resolution {
            self.repoint(&locks, resolution, Some(id.as_str()), now);
            self.record_merge(&id, resolution);
        }
        self.publish(&customer, predictions);
        self.emit(
            ProfileCreated,
            &id,
            json!({
                "email": customer.email,
                "canonical_key": customer.canonical_key,
                "segments": customer.segments(),
            }),
        );
        Ok(id)
    }

    /// Apply a mutation to a stored profile and recompute its derived state
    /// in the same critical section.
    pub fn update_profile<F>(&self, id: &str, mutator: F) -> CdpResult<ProfileView>
    where
        F: FnOnce(&mut Customer) -> CdpResult<()>,
    {
        let now = self.now();
        let guard = self.store.lock(id);
        let updated = self.store.update_locked(&guard, |customer| {
            let key = customer.canonical_key.clone();
            mutator(customer)?;
            if customer.canonical_key != key {
                return Err(CdpError::invalid(
                    "canonical_key",
                    "canonical keys are assigned by identity resolution",
                ));
            }
            let segments = self.segmentation.evaluate(customer, now);
            customer.replace_segments(segments);
            Ok(())
        })?;

        let predictions = self.scoring.score(&updated, now);
        self.publish(&updated, predictions);
        self.emit(
            ProfileUpdated,
            id,
            json!({ "lifetime_value": updated.lifetime_value }),
        );
        Ok(self.view_of(&updated))
    }

    /// Add `delta` to the lifetime value, clamping the result at zero.
    pub fn adjust_lifetime_value(&self, id: &str, delta: f64) -> CdpResult<ProfileView> {
        if !delta.is_finite() {
            return Err(CdpError::invalid("delta", format!("must be finite, got {delta}")));
        }
        self.update_profile(id, |customer| {
            customer.adjust_lifetime_value(delta);
            Ok(())
        })
    }

    /// Read-only 360° snapshot. Unknown ids yield `None`.
    pub fn get_360_view(&self, id: &str) -> CdpResult<Option<ProfileView>> {
        Ok(self.store.get(id)?.map(|customer| self.view_of(&customer)))
    }

    pub fn profile_count(&self) -> CdpResult<usize> {
        self.store.len()
    }

    /// The graph is authoritative for canonical keys; a stored key only
    /// lags it if re-pointing after a merge failed.
    fn view_of(&self, customer: &Customer) -> ProfileView {
        let mut view = ProfileView::from(customer);
        if let Some(key) = self.identity.key_for_profile(&customer.id) {
            view.canonical_key = Some(key);
        }
        view
    }

    // ─── Identity ───────────────────────────────────────────────────────

    /// Resolve an alias set without attaching a profile. Profiles linked to
    /// any merging group are locked for the duration of the merge.
    pub fn resolve_identity(&self, aliases: &[Alias]) -> CdpResult<Resolution> {
        if aliases.is_empty() {
            return Err(CdpError::invalid("aliases", "at least one alias is required"));
        }
        let now = self.now();
        let IdentityLocks {
            locks, resolution, ..
        } = self.with_identity_locks(None, aliases, now, |_| Ok(()))?;
        let resolution = resolution.ok_or_else(|| {
            CdpError::ConsistencyViolation("non-empty alias set produced no resolution".into())
        })?;
        self.repoint(&locks, &resolution, None, now);
        self.record_merge(&resolution.key, &resolution);
        Ok(resolution)
    }

    /// Acquire the locks an identity resolution needs, run `read` once they
    /// are held, then resolve. If a merge would re-point a profile outside
    /// the held set, all locks are released and the round repeats with the
    /// larger set, always acquiring in id order.
    pub(crate) fn with_identity_locks<T, F>(
        &self,
        profile_id: Option<&str>,
        aliases: &[Alias],
        now: DateTime<Utc>,
        mut read: F,
    ) -> CdpResult<IdentityLocks<T>>
    where
        F: FnMut(&LockSet) -> CdpResult<T>,
    {
        if aliases.is_empty() {
            let locks = self.store.lock_many(profile_id);
            let prior = read(&locks)?;
            return Ok(IdentityLocks {
                locks,
                resolution: None,
                prior,
            });
        }

        let mut wanted = self.identity.affected_profiles(aliases, profile_id);
        for attempt in 1..=MAX_RESOLVE_ATTEMPTS {
            let locks = self.store.lock_many(wanted.iter().cloned());
            let prior = read(&locks)?;
            match self
                .identity
                .try_resolve(aliases, profile_id, &locks.ids(), now)?
            {
                ResolveAttempt::Resolved(resolution) => {
                    return Ok(IdentityLocks {
                        locks,
                        resolution: Some(resolution),
                        prior,
                    });
                }
                ResolveAttempt::NeedsLocks(required) => {
                    debug!(
                        attempt,
                        required = required.len(),
                        "Identity merge needs more profile locks; retrying"
                    );
                    drop(locks);
                    wanted.extend(required);
                }
            }
        }

        Err(CdpError::Internal(anyhow::anyhow!(
            "identity resolution did not settle after {MAX_RESOLVE_ATTEMPTS} attempts"
        )))
    }

    /// Rewrite the stored canonical key of profiles whose group merged away.
    /// Each rewrite is a profile write, so its derived state is recomputed
    /// and published like any other. `subject` is written by the caller and
    /// skipped here.
    pub(crate) fn repoint(
        &self,
        locks: &LockSet,
        resolution: &Resolution,
        subject: Option<&str>,
        now: DateTime<Utc>,
    ) {
        for profile_id in &resolution.repointed_profiles {
            if subject == Some(profile_id.as_str()) {
                continue;
            }
            let Some(guard) = locks.guard(profile_id) else {
                warn!(profile_id = %profile_id, "Re-pointed profile not locked; skipping");
                continue;
            };
            let mut predictions = None;
            let result = self.store.update_locked(guard, |customer| {
                customer.canonical_key = Some(resolution.key.clone());
                predictions = Some(self.derive(customer, now));
                Ok(())
            });
            match result {
                Ok(customer) => {
                    if let Some(predictions) = predictions {
                        self.publish(&customer, predictions);
                    }
                }
                // Linked in the graph but not stored yet.
                Err(err) if err.is_not_found() => {}
                Err(err) => warn!(
                    profile_id = %profile_id,
                    error = %err,
                    "Failed to re-point stored canonical key"
                ),
            }
        }
    }

    /// Undo the identity link of a profile whose first write failed. A group
    /// this resolution created is dropped again unless another profile has
    /// joined it since.
    pub(crate) fn unlink_failed(&self, profile_id: &str, resolution: &Resolution) {
        if resolution.created {
            self.identity.erase(profile_id);
        } else {
            self.identity.unlink_profile(profile_id);
        }
    }

    pub(crate) fn record_merge(&self, subject: &str, resolution: &Resolution) {
        if resolution.merged_keys.is_empty() {
            return;
        }
        metrics::counter!("cdp.identity.merges").increment(resolution.merged_keys.len() as u64);
        self.emit(
            IdentityMerged,
            subject,
            json!({
                "survivor": resolution.key,
                "merged": resolution.merged_keys,
                "repointed": resolution.repointed_profiles,
            }),
        );
    }

    // ─── Derived State ──────────────────────────────────────────────────

    /// Replace the segments on the in-memory record and score it. Nothing
    /// is published yet.
    pub(crate) fn derive(&self, customer: &mut Customer, now: DateTime<Utc>) -> PredictionRecord {
        let segments = self.segmentation.evaluate(customer, now);
        customer.replace_segments(segments);
        self.scoring.score(customer, now)
    }

    /// Publish derived state for a committed profile.
    pub(crate) fn publish(
        &self,
        customer: &Customer,
        predictions: PredictionRecord,
    ) -> SegmentChange {
        let change = self.segmentation.sync_index(&customer.id, customer.segments());
        self.scoring.store(&customer.id, predictions);
        if !change.is_empty() {
            self.emit(
                SegmentsChanged,
                &customer.id,
                json!({
                    "added": change.added,
                    "removed": change.removed,
                    "segments": customer.segments(),
                }),
            );
        }
        change
    }

    /// Re-derive segments and predictions for every stored profile. Time
    /// passing alone moves profiles between segments. Returns how many
    /// profiles changed segments.
    pub fn refresh_segments(&self) -> CdpResult<usize> {
        let now = self.now();
        let ids = self.store.ids()?;
        let mut changed = 0;

        for id in &ids {
            let guard = self.store.lock(id);
            // Erased since the listing.
            let Some(mut customer) = self.store.get(id)? else {
                continue;
            };
            let before = customer.segments().clone();
            let predictions = self.derive(&mut customer, now);
            if customer.segments() != &before {
                self.store.put_locked(&guard, customer.clone())?;
            }
            if !self.publish(&customer, predictions).is_empty() {
                changed += 1;
            }
        }

        let pruned = self.store.prune_idle_locks();
        info!(profiles = ids.len(), changed, pruned, "Refreshed derived state");
        Ok(changed)
    }

    pub fn segment_members(&self, segment: Segment) -> BTreeSet<String> {
        self.segmentation.members(segment)
    }

    pub fn segment_sizes(&self) -> BTreeMap<Segment, usize> {
        self.segmentation.segment_sizes()
    }

    pub fn prediction(&self, id: &str) -> Option<PredictionRecord> {
        self.scoring.prediction(id)
    }

    pub fn prediction_count(&self) -> usize {
        self.scoring.len()
    }

    /// Drop lock entries nobody holds.
    pub fn prune_idle_locks(&self) -> usize {
        self.store.prune_idle_locks()
    }

    // ─── Journeys ───────────────────────────────────────────────────────

    pub fn define_journey(
        &self,
        name: &str,
        stages: Vec<JourneyStage>,
    ) -> CdpResult<Arc<JourneyTemplate>> {
        self.journeys.define_journey(name, stages, self.now())
    }

    /// Enroll an existing customer, restarting from the first stage.
    pub fn enroll(&self, customer_id: &str, journey: &str) -> CdpResult<EnrollmentState> {
        let _guard = self.store.lock(customer_id);
        if !self.store.contains(customer_id)? {
            return Err(CdpError::not_found("customer", customer_id));
        }
        let state = self.journeys.enroll(customer_id, journey, self.now())?;
        self.emit(JourneyEnrolled, customer_id, json!(state));
        Ok(state)
    }

    pub fn advance(&self, customer_id: &str, target_stage: usize) -> CdpResult<EnrollmentState> {
        let _guard = self.store.lock(customer_id);
        let state = self.journeys.advance(customer_id, target_stage, self.now())?;
        let event_type = match state {
            EnrollmentState::Completed { .. } => JourneyCompleted,
            _ => JourneyAdvanced,
        };
        self.emit(event_type, customer_id, json!(state));
        Ok(state)
    }

    pub fn withdraw(&self, customer_id: &str) -> Option<EnrollmentState> {
        let _guard = self.store.lock(customer_id);
        self.journeys.withdraw(customer_id, self.now())
    }

    pub fn journey_state(&self, customer_id: &str) -> EnrollmentState {
        self.journeys.state(customer_id)
    }

    // ─── Privacy ────────────────────────────────────────────────────────

    /// Record a consent decision. Permissive by default: consent may arrive
    /// before the profile does unless `privacy.require_profile_for_consent`
    /// is set.
    pub fn record_consent(
        &self,
        customer_id: &str,
        purpose: &str,
        granted: bool,
    ) -> CdpResult<ConsentDecision> {
        let _guard = self.store.lock(customer_id);
        if self.config.privacy.require_profile_for_consent && !self.store.contains(customer_id)? {
            return Err(CdpError::not_found("customer", customer_id));
        }
        let decision = self
            .privacy
            .record_consent(customer_id, purpose, granted, self.now())?;
        self.emit(
            ConsentRecorded,
            customer_id,
            json!({ "purpose": purpose.trim(), "granted": granted }),
        );
        Ok(decision)
    }

    pub fn consent_for(&self, customer_id: &str, purpose: &str) -> Option<ConsentDecision> {
        self.privacy.consent_for(customer_id, purpose)
    }

    pub fn has_consent(&self, customer_id: &str, purpose: &str) -> bool {
        self.privacy.has_consent(customer_id, purpose)
    }

    pub fn process_deletion(&self, customer_id: &str) -> CdpResult<ErasureOutcome> {
        self.process_deletion_with_cancel(customer_id, &CancelFlag::new())
    }

    /// Cascading erasure across the store, segment index, predictions,
    /// journey enrollment and identity graph. Erasing an unknown id is a
    /// successful no-op.
    pub fn process_deletion_with_cancel(
        &self,
        customer_id: &str,
        cancel: &CancelFlag,
    ) -> CdpResult<ErasureOutcome> {
        let participants: [&dyn ErasureParticipant; 4] = [
            &self.segmentation,
            &self.scoring,
            &self.journeys,
            &self.identity,
        ];
        let outcome = self.privacy.process_deletion(
            &self.store,
            customer_id,
            &participants,
            cancel,
            self.now(),
        )?;

        match &outcome {
            ErasureOutcome::Erased { components, .. } => {
                metrics::counter!("cdp.erasures.processed").increment(1);
                self.emit(ProfileErased, customer_id, json!({ "components": components }));
            }
            ErasureOutcome::AlreadyAbsent => {
                metrics::counter!("cdp.erasures.noop").increment(1);
            }
        }
        self.store.prune_lock(customer_id);
        Ok(outcome)
    }

    pub fn deletion_records(&self) -> Vec<DeletionRecord> {
        self.privacy.deletion_log()
    }

    // ─── Events ─────────────────────────────────────────────────────────

    pub(crate) fn emit(
        &self,
        event_type: ProfileEventType,
        customer_id: &str,
        detail: serde_json::Value,
    ) {
        self.event_sink.emit(make_event(
            event_type,
            customer_id,
            self.config.node_id.as_str(),
            detail,
        ));
    }
}

/// The email alias for a contact address, if it carries one.
pub(crate) fn email_alias(email: &str) -> Vec<Alias> {
    if email.trim().is_empty() {
        Vec::new()
    } else {
        vec![Alias::email(email)]
    }
}

pub(crate) fn missing_guard(id: &str) -> CdpError {
    CdpError::ConsistencyViolation(format!("lock for profile {id} was not acquired"))
}
