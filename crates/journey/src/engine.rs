//! Journey orchestrator: registers versioned templates and drives each
//! customer's enrollment through its stages.
//!
//! Enrollment records are keyed by customer id and mutated through DashMap
//! entry guards, so two operations on the same customer never interleave.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use customer_core::{CdpError, CdpResult, ErasureParticipant};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info};

use crate::state_machine::JourneyStateMachine;
use crate::types::{Enrollment, EnrollmentState, EnrollmentStatus, JourneyStage, JourneyTemplate};

pub struct JourneyOrchestrator {
    templates: DashMap<String, Arc<JourneyTemplate>>,
    enrollments: DashMap<String, Enrollment>,
    state_machine: JourneyStateMachine,
}

impl std::fmt::Debug for JourneyOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JourneyOrchestrator")
            .field("journeys", &self.templates.len())
            .field("enrollments", &self.enrollments.len())
            .finish()
    }
}

impl JourneyOrchestrator {
    pub fn new() -> Self {
        Self {
            templates: DashMap::new(),
            enrollments: DashMap::new(),
            state_machine: JourneyStateMachine::new(),
        }
    }

    // ─── Templates ──────────────────────────────────────────────────────

    /// Register a journey. Redefining an existing name registers the next
    /// version; customers already enrolled keep the version they started on.
    pub fn define_journey(
        &self,
        name: &str,
        stages: Vec<JourneyStage>,
        now: DateTime<Utc>,
    ) -> CdpResult<Arc<JourneyTemplate>> {
        if name.trim().is_empty() {
            return Err(CdpError::invalid("name", "journey name must not be empty"));
        }
        if stages.is_empty() {
            return Err(CdpError::invalid(
                "stages",
                "a journey needs at least one stage",
            ));
        }
        if let Some(position) = stages.iter().position(|s| s.name.trim().is_empty()) {
            return Err(CdpError::invalid(
                "stages",
                format!("stage {position} has an empty name"),
            ));
        }

        let template = match self.templates.entry(name.to_string()) {
            Entry::Occupied(mut occupied) => {
                let next = Arc::new(JourneyTemplate {
                    name: name.to_string(),
                    stages,
                    version: occupied.get().version + 1,
                    created_at: now,
                });
                occupied.insert(next.clone());
                next
            }
            Entry::Vacant(vacant) => {
                let first = Arc::new(JourneyTemplate {
                    name: name.to_string(),
                    stages,
                    version: 1,
                    created_at: now,
                });
                vacant.insert(first.clone());
                first
            }
        };

        info!(
            journey = %template.name,
            version = template.version,
            stages = template.len(),
            "Defined journey"
        );
        Ok(template)
    }

    /// Latest registered version of a journey.
    pub fn template(&self, name: &str) -> Option<Arc<JourneyTemplate>> {
        self.templates.get(name).map(|t| t.clone())
    }

    pub fn list_journeys(&self) -> Vec<Arc<JourneyTemplate>> {
        let mut journeys: Vec<_> = self.templates.iter().map(|t| t.value().clone()).collect();
        journeys.sort_by(|a, b| a.name.cmp(&b.name));
        journeys
    }

    // ─── Enrollment ─────────────────────────────────────────────────────

    /// Enroll a customer at stage 0 of the journey's latest version.
    /// Enrolling again, in the same or another journey, restarts from
    /// stage 0.
    pub fn enroll(
        &self,
        customer_id: &str,
        journey: &str,
        now: DateTime<Utc>,
    ) -> CdpResult<EnrollmentState> {
        let template = self
            .template(journey)
            .ok_or_else(|| CdpError::not_found("journey", journey))?;

        let state = match self.enrollments.entry(customer_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                let enrollment = occupied.get_mut();
                self.state_machine
                    .check(enrollment.status, EnrollmentStatus::Enrolled)?;
                enrollment.template = template;
                enrollment.stage = 0;
                enrollment.status = EnrollmentStatus::Enrolled;
                enrollment.enrolled_at = now;
                enrollment.updated_at = now;
                enrollment.state()
            }
            Entry::Vacant(vacant) => {
                self.state_machine
                    .check(EnrollmentStatus::NotEnrolled, EnrollmentStatus::Enrolled)?;
                vacant
                    .insert(Enrollment {
                        customer_id: customer_id.to_string(),
                        template,
                        stage: 0,
                        status: EnrollmentStatus::Enrolled,
                        enrolled_at: now,
                        updated_at: now,
                    })
                    .state()
            }
        };

        info!(customer_id, journey, "Enrolled customer");
        Ok(state)
    }

    /// Move an active enrollment forward to `target_stage`. Reaching the
    /// stage count completes the journey; stages never move backwards.
    pub fn advance(
        &self,
        customer_id: &str,
        target_stage: usize,
        now: DateTime<Utc>,
    ) -> CdpResult<EnrollmentState> {
        let mut enrollment = self
            .enrollments
            .get_mut(customer_id)
            .filter(|e| e.status == EnrollmentStatus::Enrolled)
            .ok_or_else(|| CdpError::not_found("enrollment", customer_id))?;

        let stage_count = enrollment.template.len();
        if target_stage > stage_count {
            return Err(CdpError::invalid(
                "target_stage",
                format!(
                    "stage {target_stage} is out of range for {} ({stage_count} stages)",
                    enrollment.template.name
                ),
            ));
        }
        if target_stage < enrollment.stage {
            return Err(CdpError::invalid(
                "target_stage",
                format!(
                    "cannot move back from stage {} to {target_stage}; re-enroll to restart",
                    enrollment.stage
                ),
            ));
        }
        if target_stage == enrollment.stage {
            return Ok(enrollment.state());
        }

        if target_stage == stage_count {
            self.state_machine
                .check(enrollment.status, EnrollmentStatus::Completed)?;
            enrollment.status = EnrollmentStatus::Completed;
            enrollment.stage = stage_count;
            enrollment.updated_at = now;
            info!(
                customer_id,
                journey = %enrollment.template.name,
                "Customer completed journey"
            );
        } else {
            self.state_machine
                .check(enrollment.status, EnrollmentStatus::Enrolled)?;
            enrollment.stage = target_stage;
            enrollment.updated_at = now;
            debug!(
                customer_id,
                journey = %enrollment.template.name,
                stage = target_stage,
                action = enrollment
                    .current_stage()
                    .map(|s| s.action.as_str())
                    .unwrap_or_default(),
                "Customer advanced"
            );
        }
        Ok(enrollment.state())
    }

    /// Withdraw the customer from whatever journey they are in. Returns the
    /// new state, or `None` when there was nothing to withdraw.
    pub fn withdraw(&self, customer_id: &str, now: DateTime<Utc>) -> Option<EnrollmentState> {
        let mut enrollment = self.enrollments.get_mut(customer_id)?;
        if !self
            .state_machine
            .can_transition(enrollment.status, EnrollmentStatus::Withdrawn)
        {
            return None;
        }
        enrollment.status = EnrollmentStatus::Withdrawn;
        enrollment.updated_at = now;
        info!(customer_id, journey = %enrollment.template.name, "Withdrew customer");
        Some(enrollment.state())
    }

    pub fn state(&self, customer_id: &str) -> EnrollmentState {
        self.enrollments
            .get(customer_id)
            .map(|e| e.state())
            .unwrap_or(EnrollmentState::NotEnrolled)
    }

    pub fn enrollment(&self, customer_id: &str) -> Option<Enrollment> {
        self.enrollments.get(customer_id).map(|e| e.clone())
    }

    /// Customers currently active in the named journey, sorted.
    pub fn active_in(&self, journey: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .enrollments
            .iter()
            .filter(|e| e.status == EnrollmentStatus::Enrolled && e.template.name == journey)
            .map(|e| e.customer_id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn enrollment_count(&self) -> usize {
        self.enrollments.len()
    }
}

impl Default for JourneyOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl ErasureParticipant for JourneyOrchestrator {
    fn component(&self) -> &'static str {
        "journey"
    }

    /// A withdrawn record is kept for audit and no longer counts as live.
    fn holds(&self, customer_id: &str) -> bool {
        self.enrollments
            .get(customer_id)
            .map(|e| e.status != EnrollmentStatus::Withdrawn)
            .unwrap_or(false)
    }

    fn erase(&self, customer_id: &str) {
        self.withdraw(customer_id, Utc::now());
    }
}
