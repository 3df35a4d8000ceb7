//! Segment rules as data: each rule compares one profile metric against a
//! configured threshold.

use chrono::{DateTime, Utc};
use customer_core::config::SegmentationConfig;
use customer_core::{days_between, Customer, Segment};
use serde::{Deserialize, Serialize};

/// Profile measurement a rule reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleMetric {
    LifetimeValue,
    /// Absent when the customer has never been active.
    DaysSinceLastActivity,
    DaysSinceCreated,
}

impl RuleMetric {
    pub fn measure(&self, customer: &Customer, now: DateTime<Utc>) -> Option<f64> {
        match self {
            RuleMetric::LifetimeValue => Some(customer.lifetime_value),
            RuleMetric::DaysSinceLastActivity => customer
                .last_activity
                .map(|at| days_between(at, now) as f64),
            RuleMetric::DaysSinceCreated => Some(days_between(customer.created_at, now) as f64),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonOperator {
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
}

/// One row of the rule table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentRule {
    pub segment: Segment,
    pub metric: RuleMetric,
    pub operator: ComparisonOperator,
    pub threshold: f64,
}

impl SegmentRule {
    pub fn new(
        segment: Segment,
        metric: RuleMetric,
        operator: ComparisonOperator,
        threshold: f64,
    ) -> Self {
        Self {
            segment,
            metric,
            operator,
            threshold,
        }
    }

    /// A rule over an absent metric is vacuously false.
    pub fn matches(&self, customer: &Customer, now: DateTime<Utc>) -> bool {
        self.metric
            .measure(customer, now)
            .is_some_and(|actual| compare_numbers(actual, &self.operator, self.threshold))
    }
}

/// The standard rule table, thresholds taken from configuration.
pub fn default_rules(config: &SegmentationConfig) -> Vec<SegmentRule> {
    use ComparisonOperator::*;
    use RuleMetric::*;

    vec![
        SegmentRule::new(
            Segment::HighValue,
            LifetimeValue,
            GreaterThan,
            config.high_value_threshold,
        ),
        SegmentRule::new(
            Segment::AtRisk,
            DaysSinceLastActivity,
            GreaterThan,
            config.at_risk_days as f64,
        ),
        SegmentRule::new(
            Segment::Dormant,
            DaysSinceLastActivity,
            GreaterThan,
            config.dormant_days as f64,
        ),
        SegmentRule::new(
            Segment::New,
            DaysSinceCreated,
            LessThan,
            config.new_days as f64,
        ),
        SegmentRule::new(
            Segment::Active,
            DaysSinceLastActivity,
            LessThan,
            config.active_days as f64,
        ),
    ]
}

pub fn compare_numbers(actual: f64, operator: &ComparisonOperator, expected: f64) -> bool {
    match operator {
        ComparisonOperator::GreaterThan => actual > expected,
        ComparisonOperator::GreaterThanOrEqual => actual >= expected,
        ComparisonOperator::LessThan => actual < expected,
        ComparisonOperator::LessThanOrEqual => actual <= expected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_absent_activity_is_vacuously_false() {
        let now = Utc::now();
        let customer = Customer::new("c1", "c1@example.com", "C", now - Duration::days(400));
        for rule in default_rules(&SegmentationConfig::default()) {
            if rule.metric == RuleMetric::DaysSinceLastActivity {
                assert!(!rule.matches(&customer, now), "{:?}", rule.segment);
            }
        }
    }

    #[test]
    fn test_thresholds_are_strict() {
        let now = Utc::now();
        let rule = SegmentRule::new(
            Segment::AtRisk,
            RuleMetric::DaysSinceLastActivity,
            ComparisonOperator::GreaterThan,
            30.0,
        );
        let base = Customer::new("c1", "c1@example.com", "C", now);
        assert!(!rule.matches(&base.clone().with_last_activity(now - Duration::days(30)), now));
        assert!(rule.matches(&base.with_last_activity(now - Duration::days(31)), now));
    }

    #[test]
    fn test_compare_numbers() {
        assert!(compare_numbers(2.0, &ComparisonOperator::GreaterThanOrEqual, 2.0));
        assert!(compare_numbers(1.0, &ComparisonOperator::LessThanOrEqual, 2.0));
        assert!(!compare_numbers(2.0, &ComparisonOperator::LessThan, 2.0));
    }

    #[test]
    fn test_rule_table_reads_configuration() {
        let config = SegmentationConfig {
            active_days: 14,
            ..SegmentationConfig::default()
        };
        let rules = default_rules(&config);
        let active = rules.iter().find(|r| r.segment == Segment::Active).unwrap();
        assert_eq!(active.threshold, 14.0);
        assert_eq!(rules.len(), Segment::ALL.len());
    }
}
