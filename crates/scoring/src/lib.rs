//! Predictive scoring: explainable rule-based churn risk and projected
//! lifetime value, recomputed on every profile mutation.

pub mod engine;
pub mod formulas;

pub use engine::{PredictionRecord, PredictiveEngine};
pub use formulas::{Formula, Metric, ScoreFormula};
