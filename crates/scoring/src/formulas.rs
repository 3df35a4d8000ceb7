//! Scoring formulas as data, coefficients taken from configuration.

use chrono::{DateTime, Utc};
use customer_core::config::ScoringConfig;
use customer_core::{days_between, Customer};
use serde::{Deserialize, Serialize};

/// Name of a predicted metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    ChurnRisk,
    PredictedLtv,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::ChurnRisk => "churn_risk",
            Metric::PredictedLtv => "predicted_ltv",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Formula {
    /// `min(1, days_inactive / horizon_days)`; zero for a customer who was
    /// never active.
    InactivityRatio { horizon_days: f64 },
    /// `lifetime_value * (1 + events / event_divisor) * multiplier`.
    ActivityWeightedValue { event_divisor: f64, multiplier: f64 },
}

impl Formula {
    pub fn evaluate(&self, customer: &Customer, now: DateTime<Utc>) -> f64 {
        match self {
            Formula::InactivityRatio { horizon_days } => match customer.last_activity {
                Some(at) => {
                    let days_inactive = days_between(at, now).max(0) as f64;
                    (days_inactive / horizon_days).clamp(0.0, 1.0)
                }
                None => 0.0,
            },
            Formula::ActivityWeightedValue {
                event_divisor,
                multiplier,
            } => {
                let activity = 1.0 + customer.event_count() as f64 / event_divisor;
                customer.lifetime_value * activity * multiplier
            }
        }
    }
}

/// One row of the scoring table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreFormula {
    pub metric: Metric,
    pub formula: Formula,
}

pub fn default_formulas(config: &ScoringConfig) -> Vec<ScoreFormula> {
    vec![
        ScoreFormula {
            metric: Metric::ChurnRisk,
            formula: Formula::InactivityRatio {
                horizon_days: config.churn_horizon_days as f64,
            },
        },
        ScoreFormula {
            metric: Metric::PredictedLtv,
            formula: Formula::ActivityWeightedValue {
                event_divisor: config.ltv_event_divisor,
                multiplier: config.ltv_multiplier,
            },
        },
    ]
}
