//! Journey orchestration: named, ordered stage templates and a per-customer
//! enrollment state machine.

pub mod engine;
pub mod state_machine;
pub mod types;

pub use engine::JourneyOrchestrator;
pub use state_machine::JourneyStateMachine;
pub use types::{Enrollment, EnrollmentState, EnrollmentStatus, JourneyStage, JourneyTemplate};
