use customer_core::{CdpError, CdpResult};
use serde::{Deserialize, Serialize};

use crate::types::EnrollmentStatus;

/// Describes a single valid state transition for an enrollment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: EnrollmentStatus,
    pub to: EnrollmentStatus,
    pub trigger: String,
}

/// Guards the enrollment lifecycle by enforcing a finite set of valid
/// state transitions.
#[derive(Debug, Clone)]
pub struct JourneyStateMachine {
    pub transitions: Vec<StateTransition>,
}

impl JourneyStateMachine {
    pub fn new() -> Self {
        use EnrollmentStatus::*;

        let transitions = [
            (NotEnrolled, Enrolled, "enroll"),
            (Enrolled, Enrolled, "advance_or_restart"),
            (Enrolled, Completed, "final_stage_reached"),
            (Enrolled, Withdrawn, "withdraw"),
            (Completed, Enrolled, "re_enroll"),
            (Completed, Withdrawn, "withdraw"),
            (Withdrawn, Enrolled, "re_enroll"),
        ]
        .into_iter()
        .map(|(from, to, trigger)| StateTransition {
            from,
            to,
            trigger: trigger.to_string(),
        })
        .collect();

        Self { transitions }
    }

    pub fn can_transition(&self, from: EnrollmentStatus, to: EnrollmentStatus) -> bool {
        self.transitions.iter().any(|t| t.from == from && t.to == to)
    }

    /// Callers validate their inputs first, so a refused transition means
    /// the orchestrator itself went wrong.
    pub fn check(&self, from: EnrollmentStatus, to: EnrollmentStatus) -> CdpResult<()> {
        if self.can_transition(from, to) {
            Ok(())
        } else {
            Err(CdpError::ConsistencyViolation(format!(
                "invalid enrollment transition from {from:?} to {to:?}"
            )))
        }
    }
}

impl Default for JourneyStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
