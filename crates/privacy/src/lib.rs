//! Privacy and compliance: consent decisions and cascading erasure of a
//! customer's footprint.

pub mod consent;
pub mod manager;

pub use consent::{ConsentDecision, ConsentEvent, ConsentLedger};
pub use manager::{ErasureOutcome, PrivacyManager};
