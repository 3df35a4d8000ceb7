use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single stage within a journey template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JourneyStage {
    pub name: String,
    pub action: String,
}

impl JourneyStage {
    pub fn new(name: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            action: action.into(),
        }
    }
}

/// A named, ordered sequence of stages. Immutable once registered;
/// redefining the name registers a new version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JourneyTemplate {
    pub name: String,
    pub stages: Vec<JourneyStage>,
    pub version: u32,
    pub created_at: DateTime<Utc>,
}

impl JourneyTemplate {
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

/// Lifecycle status of a customer's enrollment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    NotEnrolled,
    Enrolled,
    Completed,
    Withdrawn,
}

/// A customer's enrollment, pinned to the template version it started on.
#[derive(Debug, Clone)]
pub struct Enrollment {
    pub customer_id: String,
    pub template: Arc<JourneyTemplate>,
    pub stage: usize,
    pub status: EnrollmentStatus,
    pub enrolled_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Enrollment {
    pub fn current_stage(&self) -> Option<&JourneyStage> {
        match self.status {
            EnrollmentStatus::Enrolled => self.template.stages.get(self.stage),
            _ => None,
        }
    }

    pub fn state(&self) -> EnrollmentState {
        let journey = self.template.name.clone();
        let version = self.template.version;
        match self.status {
            EnrollmentStatus::NotEnrolled => EnrollmentState::NotEnrolled,
            EnrollmentStatus::Enrolled => EnrollmentState::Enrolled {
                journey,
                version,
                stage: self.stage,
            },
            EnrollmentStatus::Completed => EnrollmentState::Completed { journey, version },
            EnrollmentStatus::Withdrawn => EnrollmentState::Withdrawn { journey, version },
        }
    }
}

/// Externally visible enrollment state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum EnrollmentState {
    NotEnrolled,
    Enrolled {
        journey: String,
        version: u32,
        stage: usize,
    },
    Completed {
        journey: String,
        version: u32,
    },
    Withdrawn {
        journey: String,
        version: u32,
    },
}

impl EnrollmentState {
    pub fn status(&self) -> EnrollmentStatus {
        match self {
            EnrollmentState::NotEnrolled => EnrollmentStatus::NotEnrolled,
            EnrollmentState::Enrolled { .. } => EnrollmentStatus::Enrolled,
            EnrollmentState::Completed { .. } => EnrollmentStatus::Completed,
            EnrollmentState::Withdrawn { .. } => EnrollmentStatus::Withdrawn,
        }
    }
}
