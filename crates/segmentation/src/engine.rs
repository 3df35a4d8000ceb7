//! Core segmentation engine: evaluates profile membership in real-time and
//! keeps the reverse segment -> profile index in step.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use customer_core::config::SegmentationConfig;
use customer_core::{Customer, ErasureParticipant, Segment};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::predicates::{default_rules, SegmentRule};

/// Membership delta produced by one recomputation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentChange {
    pub added: BTreeSet<Segment>,
    pub removed: BTreeSet<Segment>,
}

impl SegmentChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

pub struct SegmentationEngine {
    rules: Vec<SegmentRule>,
    index: DashMap<Segment, BTreeSet<String>>,
    memberships: DashMap<String, BTreeSet<Segment>>,
}

impl std::fmt::Debug for SegmentationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentationEngine")
            .field("rules", &self.rules.len())
            .field("profiles", &self.memberships.len())
            .finish()
    }
}

impl SegmentationEngine {
    pub fn new(config: &SegmentationConfig) -> Self {
        Self::with_rules(default_rules(config))
    }

    pub fn with_rules(rules: Vec<SegmentRule>) -> Self {
        Self {
            rules,
            index: DashMap::new(),
            memberships: DashMap::new(),
        }
    }

    pub fn rules(&self) -> &[SegmentRule] {
        &self.rules
    }

    /// Segments the profile belongs to right now. Every rule is evaluated
    /// independently; memberships are not exclusive.
    pub fn evaluate(&self, customer: &Customer, now: DateTime<Utc>) -> BTreeSet<Segment> {
        self.rules
            .iter()
            .filter(|rule| rule.matches(customer, now))
            .map(|rule| rule.segment)
            .collect()
    }

    /// Re-derive the profile's segments, replace them on the record and
    /// update the reverse index.
    pub fn recompute(&self, customer: &mut Customer, now: DateTime<Utc>) -> SegmentChange {
        let segments = self.evaluate(customer, now);
        customer.replace_segments(segments.clone());
        self.sync_index(&customer.id, &segments)
    }

    /// Make the reverse index reflect `segments` for one profile, removing
    /// stale membership first. Callers hold the profile's critical section.
    pub fn sync_index(&self, customer_id: &str, segments: &BTreeSet<Segment>) -> SegmentChange {
        let previous = self
            .memberships
            .insert(customer_id.to_string(), segments.clone())
            .unwrap_or_default();

        let change = SegmentChange {
            added: segments.difference(&previous).copied().collect(),
            removed: previous.difference(segments).copied().collect(),
        };

        for segment in &change.removed {
            if let Some(mut members) = self.index.get_mut(segment) {
                members.remove(customer_id);
            }
        }
        for segment in &change.added {
            self.index
                .entry(*segment)
                .or_default()
                .insert(customer_id.to_string());
        }

        if !change.is_empty() {
            debug!(
                customer_id,
                added = ?change.added,
                removed = ?change.removed,
                "Customer segmented"
            );
        }
        change
    }

    pub fn members(&self, segment: Segment) -> BTreeSet<String> {
        self.index
            .get(&segment)
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    pub fn segments_of(&self, customer_id: &str) -> BTreeSet<Segment> {
        self.memberships
            .get(customer_id)
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    /// Member count for every segment, including empty ones.
    pub fn segment_sizes(&self) -> BTreeMap<Segment, usize> {
        Segment::ALL
            .iter()
            .map(|segment| {
                let size = self.index.get(segment).map(|m| m.len()).unwrap_or(0);
                (*segment, size)
            })
            .collect()
    }

    pub fn is_indexed(&self, customer_id: &str) -> bool {
        self.index.iter().any(|entry| entry.value().contains(customer_id))
    }
}

impl ErasureParticipant for SegmentationEngine {
    fn component(&self) -> &'static str {
        "segmentation"
    }

    fn holds(&self, customer_id: &str) -> bool {
        self.memberships.contains_key(customer_id) || self.is_indexed(customer_id)
    }

    fn erase(&self, customer_id: &str) {
        self.memberships.remove(customer_id);
        for mut entry in self.index.iter_mut() {
            entry.value_mut().remove(customer_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn engine() -> SegmentationEngine {
        SegmentationEngine::new(&SegmentationConfig::default())
    }

    fn customer(
        created_days_ago: i64,
        active_days_ago: Option<i64>,
        ltv: f64,
    ) -> (Customer, DateTime<Utc>) {
        let now = Utc::now();
        let mut customer = Customer::new(
            "cust-0",
            "customer0@example.com",
            "Customer 0",
            now - Duration::days(created_days_ago),
        )
        .with_lifetime_value(ltv);
        if let Some(days) = active_days_ago {
            customer = customer.with_last_activity(now - Duration::days(days));
        }
        (customer, now)
    }

    #[test]
    fn test_recent_customer_is_only_new() {
        let (mut customer, now) = customer(10, Some(10), 1000.0);
        let engine = engine();
        engine.recompute(&mut customer, now);
        assert_eq!(customer.segments(), &BTreeSet::from([Segment::New]));
    }

    #[test]
    fn test_long_inactive_is_at_risk_and_dormant() {
        let (mut customer, now) = customer(100, Some(100), 1000.0);
        let engine = engine();
        engine.recompute(&mut customer, now);
        assert_eq!(
            customer.segments(),
            &BTreeSet::from([Segment::AtRisk, Segment::Dormant])
        );
    }

    #[test]
    fn test_segments_overlap() {
        let (mut customer, now) = customer(1, Some(0), 20_000.0);
        let engine = engine();
        engine.recompute(&mut customer, now);
        assert_eq!(
            customer.segments(),
            &BTreeSet::from([Segment::HighValue, Segment::Active, Segment::New])
        );
    }

    #[test]
    fn test_never_active_customer() {
        let (mut customer, now) = customer(45, None, 0.0);
        let engine = engine();
        engine.recompute(&mut customer, now);
        assert!(customer.segments().is_empty());
    }

    #[test]
    fn test_index_drops_stale_membership() {
        let engine = engine();
        let (mut customer, now) = customer(5, Some(1), 1000.0);

        let first = engine.recompute(&mut customer, now);
        assert_eq!(first.added, BTreeSet::from([Segment::Active, Segment::New]));
        assert!(engine.members(Segment::Active).contains("cust-0"));

        customer.last_activity = Some(now - Duration::days(40));
        let second = engine.recompute(&mut customer, now);
        assert_eq!(second.added, BTreeSet::from([Segment::AtRisk]));
        assert_eq!(second.removed, BTreeSet::from([Segment::Active]));
        assert!(!engine.members(Segment::Active).contains("cust-0"));
        assert!(engine.members(Segment::AtRisk).contains("cust-0"));

        // Recomputing an unchanged profile adds no duplicates.
        assert!(engine.recompute(&mut customer, now).is_empty());
        assert_eq!(engine.segment_sizes()[&Segment::AtRisk], 1);
        assert_eq!(engine.segment_sizes()[&Segment::HighValue], 0);
        assert_eq!(engine.segments_of("cust-0"), customer.segments().clone());
    }

    #[test]
    fn test_erase_removes_every_membership() {
        let engine = engine();
        let (mut customer, now) = customer(1, Some(0), 50_000.0);
        engine.recompute(&mut customer, now);
        assert!(engine.holds("cust-0"));

        engine.erase("cust-0");
        assert!(!engine.holds("cust-0"));
        for segment in Segment::ALL {
            assert!(engine.members(segment).is_empty());
        }
    }

    #[test]
    fn test_configured_thresholds() {
        let config = SegmentationConfig {
            high_value_threshold: 500.0,
            ..SegmentationConfig::default()
        };
        let engine = SegmentationEngine::new(&config);
        let (customer, now) = customer(200, None, 600.0);
        assert_eq!(engine.evaluate(&customer, now), BTreeSet::from([Segment::HighValue]));
    }
}
