//! Real-time segmentation: a declarative rule table evaluated against the
//! current profile snapshot, plus a reverse segment -> profile index.

pub mod engine;
pub mod predicates;

pub use engine::{SegmentChange, SegmentationEngine};
pub use predicates::{ComparisonOperator, RuleMetric, SegmentRule};
