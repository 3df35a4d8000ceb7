//! Pipeline coordinator: the single entry point that resolves identity,
//! writes the profile and recomputes all derived state for every
//! profile-mutating event.

pub mod coordinator;
pub mod ingest;

pub use coordinator::Coordinator;
pub use ingest::IngestOutcome;
