//! Predictive scoring engine. Holds one prediction record per profile,
//! overwritten on every recomputation.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use customer_core::config::ScoringConfig;
use customer_core::{Customer, ErasureParticipant};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::formulas::{default_formulas, Metric, ScoreFormula};

/// Latest value of each predicted metric for one profile.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub scores: BTreeMap<Metric, f64>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl PredictionRecord {
    pub fn get(&self, metric: Metric) -> Option<f64> {
        self.scores.get(&metric).copied()
    }

    pub fn churn_risk(&self) -> Option<f64> {
        self.get(Metric::ChurnRisk)
    }

    pub fn predicted_ltv(&self) -> Option<f64> {
        self.get(Metric::PredictedLtv)
    }
}

pub struct PredictiveEngine {
    formulas: Vec<ScoreFormula>,
    predictions: DashMap<String, PredictionRecord>,
}

impl std::fmt::Debug for PredictiveEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredictiveEngine")
            .field("formulas", &self.formulas.len())
            .field("predictions", &self.predictions.len())
            .finish()
    }
}

impl PredictiveEngine {
    pub fn new(config: &ScoringConfig) -> Self {
        Self::with_formulas(default_formulas(config))
    }

    pub fn with_formulas(formulas: Vec<ScoreFormula>) -> Self {
        Self {
            formulas,
            predictions: DashMap::new(),
        }
    }

    pub fn formulas(&self) -> &[ScoreFormula] {
        &self.formulas
    }

    /// Value of one metric for the profile, or `None` if the table has no
    /// formula for it.
    pub fn evaluate(&self, metric: Metric, customer: &Customer, now: DateTime<Utc>) -> Option<f64> {
        self.formulas
            .iter()
            .find(|f| f.metric == metric)
            .map(|f| f.formula.evaluate(customer, now))
    }

    /// Churn risk in `[0, 1]`. Pure.
    pub fn churn_risk(&self, customer: &Customer, now: DateTime<Utc>) -> f64 {
        self.evaluate(Metric::ChurnRisk, customer, now).unwrap_or(0.0)
    }

    /// Projected lifetime value. Pure.
    pub fn lifetime_value(&self, customer: &Customer, now: DateTime<Utc>) -> f64 {
        self.evaluate(Metric::PredictedLtv, customer, now)
            .unwrap_or(customer.lifetime_value)
    }

    /// Score every metric in the table. Pure.
    pub fn score(&self, customer: &Customer, now: DateTime<Utc>) -> PredictionRecord {
        PredictionRecord {
            scores: self
                .formulas
                .iter()
                .map(|f| (f.metric, f.formula.evaluate(customer, now)))
                .collect(),
            updated_at: Some(now),
        }
    }

    /// Compute churn risk and overwrite the stored entry for that metric.
    pub fn predict_churn(&self, customer: &Customer, now: DateTime<Utc>) -> f64 {
        let risk = self.churn_risk(customer, now);
        self.store_metric(&customer.id, Metric::ChurnRisk, risk, now);
        risk
    }

    /// Compute projected lifetime value and overwrite the stored entry.
    pub fn predict_ltv(&self, customer: &Customer, now: DateTime<Utc>) -> f64 {
        let ltv = self.lifetime_value(customer, now);
        self.store_metric(&customer.id, Metric::PredictedLtv, ltv, now);
        ltv
    }

    /// Score every metric and replace the profile's record.
    pub fn recompute(&self, customer: &Customer, now: DateTime<Utc>) -> PredictionRecord {
        let record = self.score(customer, now);
        self.store(&customer.id, record.clone());
        record
    }

    pub fn store(&self, customer_id: &str, record: PredictionRecord) {
        debug!(customer_id, scores = ?record.scores, "Predictions updated");
        self.predictions.insert(customer_id.to_string(), record);
    }

    fn store_metric(&self, customer_id: &str, metric: Metric, value: f64, now: DateTime<Utc>) {
        let mut record = self.predictions.entry(customer_id.to_string()).or_default();
        record.scores.insert(metric, value);
        record.updated_at = Some(now);
    }

    pub fn prediction(&self, customer_id: &str) -> Option<PredictionRecord> {
        self.predictions.get(customer_id).map(|r| r.clone())
    }

    pub fn len(&self) -> usize {
        self.predictions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.predictions.is_empty()
    }
}

impl ErasureParticipant for PredictiveEngine {
    fn component(&self) -> &'static str {
        "predictive_scoring"
    }

    fn holds(&self, customer_id: &str) -> bool {
        self.predictions.contains_key(customer_id)
    }

    fn erase(&self, customer_id: &str) {
        self.predictions.remove(customer_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use customer_core::types::CustomerEvent;
    use std::collections::HashMap;

    fn engine() -> PredictiveEngine {
        PredictiveEngine::new(&ScoringConfig::default())
    }

    #[test]
    fn test_predictions_overwrite_rather_than_accumulate() {
        let engine = engine();
        let now = Utc::now();
        let mut customer = Customer::new("c1", "c1@example.com", "C", now)
            .with_lifetime_value(1000.0)
            .with_last_activity(now - Duration::days(9));

        assert!((engine.predict_churn(&customer, now) - 0.1).abs() < 1e-9);
        assert!((engine.predict_ltv(&customer, now) - 1200.0).abs() < 1e-9);

        customer.last_activity = Some(now - Duration::days(90));
        engine.predict_churn(&customer, now);

        let record = engine.prediction("c1").unwrap();
        assert_eq!(record.scores.len(), 2);
        assert_eq!(record.churn_risk(), Some(1.0));
        assert_eq!(engine.len(), 1);
    }

    #[test]
    fn test_ltv_grows_with_events() {
        let engine = engine();
        let now = Utc::now();
        let mut customer =
            Customer::new("c1", "c1@example.com", "C", now).with_lifetime_value(500.0);
        for _ in 0..50 {
            customer.record_event(CustomerEvent {
                name: "page_view".into(),
                properties: HashMap::new(),
                timestamp: now,
            });
        }
        // 500 * 1.5 * 1.2
        assert!((engine.lifetime_value(&customer, now) - 900.0).abs() < 1e-9);
    }

    #[test]
    fn test_recompute_replaces_record() {
        let engine = engine();
        let now = Utc::now();
        let customer = Customer::new("c1", "c1@example.com", "C", now).with_lifetime_value(10.0);

        let record = engine.recompute(&customer, now);
        assert_eq!(record.churn_risk(), Some(0.0));
        assert_eq!(engine.prediction("c1"), Some(record));
    }

    #[test]
    fn test_erase() {
        let engine = engine();
        let now = Utc::now();
        let customer = Customer::new("c1", "c1@example.com", "C", now);
        engine.recompute(&customer, now);
        assert!(engine.holds("c1"));
        engine.erase("c1");
        assert!(!engine.holds("c1"));
        assert!(engine.prediction("c1").is_none());
    }

    #[test]
    fn test_custom_horizon() {
        let engine = PredictiveEngine::new(&ScoringConfig {
            churn_horizon_days: 30,
            ..ScoringConfig::default()
        });
        let now = Utc::now();
        let customer = Customer::new("c1", "c1@example.com", "C", now)
            .with_last_activity(now - Duration::days(15));
        assert!((engine.churn_risk(&customer, now) - 0.5).abs() < 1e-9);
    }
}
