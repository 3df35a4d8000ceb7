use std::collections::{BTreeSet, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ─── Segments ───────────────────────────────────────────────────────────

/// Non-exclusive classification label derived from profile state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Segment {
    HighValue,
    AtRisk,
    Active,
    Dormant,
    New,
}

impl Segment {
    pub const ALL: [Segment; 5] = [
        Segment::HighValue,
        Segment::AtRisk,
        Segment::Active,
        Segment::Dormant,
        Segment::New,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Segment::HighValue => "high_value",
            Segment::AtRisk => "at_risk",
            Segment::Active => "active",
            Segment::Dormant => "dormant",
            Segment::New => "new",
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Identity Aliases ───────────────────────────────────────────────────

/// Namespace of an identifier. Declaration order is the preference order
/// used when picking the primary identifier of an alias set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityNamespace {
    Email,
    UserId,
    DeviceId,
    Custom(String),
}

impl IdentityNamespace {
    pub fn as_str(&self) -> &str {
        match self {
            IdentityNamespace::Email => "email",
            IdentityNamespace::UserId => "user_id",
            IdentityNamespace::DeviceId => "device_id",
            IdentityNamespace::Custom(s) => s.as_str(),
        }
    }
}

/// A single identifier believed to belong to one real-world customer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Alias {
    pub namespace: IdentityNamespace,
    pub value: String,
}

impl Alias {
    pub fn new(namespace: IdentityNamespace, value: impl Into<String>) -> Self {
        Self {
            namespace,
            value: value.into(),
        }
        .normalized()
    }

    pub fn email(value: impl Into<String>) -> Self {
        Self::new(IdentityNamespace::Email, value)
    }

    pub fn user_id(value: impl Into<String>) -> Self {
        Self::new(IdentityNamespace::UserId, value)
    }

    pub fn device_id(value: impl Into<String>) -> Self {
        Self::new(IdentityNamespace::DeviceId, value)
    }

    pub fn custom(namespace: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(IdentityNamespace::Custom(namespace.into()), value)
    }

    /// Emails are case-insensitive; every other namespace is only trimmed.
    pub fn normalized(self) -> Self {
        let value = match self.namespace {
            IdentityNamespace::Email => self.value.trim().to_lowercase(),
            _ => self.value.trim().to_string(),
        };
        Self {
            namespace: self.namespace,
            value,
        }
    }
}

impl fmt::Display for Alias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace.as_str(), self.value)
    }
}

// ─── Customer Profile ───────────────────────────────────────────────────

/// A timestamped behavioural event on a profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerEvent {
    pub name: String,
    #[serde(default)]
    pub properties: HashMap<String, serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

/// The unified record for one customer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub id: String,
    pub email: String,
    pub name: String,
    #[serde(default)]
    pub attributes: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub events: Vec<CustomerEvent>,
    /// Derived. Replaced only by the segmentation engine.
    #[serde(default)]
    segments: BTreeSet<Segment>,
    #[serde(default)]
    pub lifetime_value: f64,
    #[serde(default)]
    pub last_activity: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Canonical identity key this profile is linked to, if resolved.
    #[serde(default)]
    pub canonical_key: Option<String>,
}

impl Customer {
    pub fn new(
        id: impl Into<String>,
        email: impl Into<String>,
        name: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            email: email.into(),
            name: name.into(),
            attributes: HashMap::new(),
            events: Vec::new(),
            segments: BTreeSet::new(),
            lifetime_value: 0.0,
            last_activity: None,
            created_at,
            canonical_key: None,
        }
    }

    /// Negative values clamp to zero. Non-finite values are kept so the
    /// store rejects them on write.
    pub fn with_lifetime_value(mut self, value: f64) -> Self {
        self.lifetime_value = clamp_non_negative(value);
        self
    }

    pub fn with_last_activity(mut self, at: DateTime<Utc>) -> Self {
        self.last_activity = Some(at);
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    pub fn segments(&self) -> &BTreeSet<Segment> {
        &self.segments
    }

    /// Replace the derived segment set. Only the segmentation engine calls
    /// this; any other writer would break the no-staleness invariant.
    pub fn replace_segments(&mut self, segments: BTreeSet<Segment>) {
        self.segments = segments;
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    /// Append an event and move `last_activity` forward if it is newer.
    pub fn record_event(&mut self, event: CustomerEvent) {
        let at = event.timestamp;
        self.events.push(event);
        self.touch(at);
    }

    pub fn touch(&mut self, at: DateTime<Utc>) {
        match self.last_activity {
            Some(current) if current >= at => {}
            _ => self.last_activity = Some(at),
        }
    }

    /// Merge attribute deltas. A JSON `null` removes the key.
    pub fn apply_attribute_deltas(&mut self, deltas: &HashMap<String, serde_json::Value>) {
        for (key, value) in deltas {
            if value.is_null() {
                self.attributes.remove(key);
            } else {
                self.attributes.insert(key.clone(), value.clone());
            }
        }
    }

    /// Adjust lifetime value by `delta`, never going below zero.
    pub fn adjust_lifetime_value(&mut self, delta: f64) {
        self.lifetime_value = clamp_non_negative(self.lifetime_value + delta);
    }
}

/// `f64::max` would turn NaN into 0.0.
fn clamp_non_negative(value: f64) -> f64 {
    if value < 0.0 {
        0.0
    } else {
        value
    }
}

/// Read-only 360° snapshot of a profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileView {
    pub id: String,
    pub email: String,
    pub name: String,
    pub canonical_key: Option<String>,
    pub lifetime_value: f64,
    pub segments: BTreeSet<Segment>,
    pub total_events: usize,
    pub last_activity: Option<DateTime<Utc>>,
    pub attributes: HashMap<String, serde_json::Value>,
}

impl From<&Customer> for ProfileView {
    fn from(customer: &Customer) -> Self {
        Self {
            id: customer.id.clone(),
            email: customer.email.clone(),
            name: customer.name.clone(),
            canonical_key: customer.canonical_key.clone(),
            lifetime_value: customer.lifetime_value,
            segments: customer.segments.clone(),
            total_events: customer.events.len(),
            last_activity: customer.last_activity,
            attributes: customer.attributes.clone(),
        }
    }
}

// ─── Ingestion ──────────────────────────────────────────────────────────

/// Inbound profile-mutating event accepted by the ingestion boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestEvent {
    pub customer_id_hint: Option<String>,
    #[serde(default)]
    pub aliases: Vec<Alias>,
    #[serde(default)]
    pub attribute_deltas: HashMap<String, serde_json::Value>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    /// Behavioural event to append, if any.
    #[serde(default)]
    pub event_name: Option<String>,
    #[serde(default)]
    pub lifetime_value_delta: Option<f64>,
}

impl IngestEvent {
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            customer_id_hint: None,
            aliases: Vec::new(),
            attribute_deltas: HashMap::new(),
            timestamp,
            email: None,
            name: None,
            event_name: None,
            lifetime_value_delta: None,
        }
    }

    pub fn for_customer(mut self, id: impl Into<String>) -> Self {
        self.customer_id_hint = Some(id.into());
        self
    }

    pub fn alias(mut self, alias: Alias) -> Self {
        self.aliases.push(alias);
        self
    }

    pub fn attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attribute_deltas.insert(key.into(), value);
        self
    }

    pub fn contact(mut self, email: impl Into<String>, name: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self.name = Some(name.into());
        self
    }

    pub fn event(mut self, name: impl Into<String>) -> Self {
        self.event_name = Some(name.into());
        self
    }

    pub fn lifetime_value_delta(mut self, delta: f64) -> Self {
        self.lifetime_value_delta = Some(delta);
        self
    }
}

// ─── Compliance Records ─────────────────────────────────────────────────

/// Append-only proof that a customer's data was erased.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeletionRecord {
    pub customer_id: String,
    pub processed_at: DateTime<Utc>,
}

// ─── Profile Events ─────────────────────────────────────────────────────

/// Domain event emitted by the pipeline after a change commits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileEvent {
    pub event_id: Uuid,
    pub event_type: ProfileEventType,
    pub customer_id: String,
    pub detail: serde_json::Value,
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProfileEventType {
    ProfileCreated,
    ProfileUpdated,
    SegmentsChanged,
    IdentityMerged,
    JourneyEnrolled,
    JourneyAdvanced,
    JourneyCompleted,
    ConsentRecorded,
    ProfileErased,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_alias_normalization() {
        assert_eq!(Alias::email("  Alice@Example.COM ").value, "alice@example.com");
        assert_eq!(Alias::user_id(" U1 ").value, "U1");
        assert_eq!(Alias::device_id("d1").to_string(), "device_id:d1");
        assert_eq!(Alias::custom("crm", "42").to_string(), "crm:42");
    }

    #[test]
    fn test_record_event_only_moves_last_activity_forward() {
        let now = Utc::now();
        let mut customer = Customer::new("c1", "c1@example.com", "C One", now);
        assert!(customer.last_activity.is_none());

        customer.record_event(CustomerEvent {
            name: "purchase".into(),
            properties: HashMap::new(),
            timestamp: now,
        });
        customer.record_event(CustomerEvent {
            name: "late_import".into(),
            properties: HashMap::new(),
            timestamp: now - Duration::days(3),
        });

        assert_eq!(customer.event_count(), 2);
        assert_eq!(customer.last_activity, Some(now));
    }

    #[test]
    fn test_attribute_deltas_and_ltv_clamp() {
        let mut customer = Customer::new("c1", "c1@example.com", "C One", Utc::now())
            .with_attribute("plan", serde_json::json!("free"))
            .with_attribute("city", serde_json::json!("Oslo"))
            .with_lifetime_value(50.0);

        let mut deltas = HashMap::new();
        deltas.insert("plan".to_string(), serde_json::json!("pro"));
        deltas.insert("city".to_string(), serde_json::Value::Null);
        customer.apply_attribute_deltas(&deltas);

        assert_eq!(customer.attributes["plan"], "pro");
        assert!(!customer.attributes.contains_key("city"));

        customer.adjust_lifetime_value(-80.0);
        assert_eq!(customer.lifetime_value, 0.0);
    }

    #[test]
    fn test_lifetime_value_builder_keeps_non_finite_values() {
        let now = Utc::now();
        let customer = Customer::new("c1", "c1@example.com", "C One", now);
        assert_eq!(customer.clone().with_lifetime_value(-5.0).lifetime_value, 0.0);
        assert!(customer.clone().with_lifetime_value(f64::NAN).lifetime_value.is_nan());
        assert_eq!(
            customer.with_lifetime_value(f64::INFINITY).lifetime_value,
            f64::INFINITY
        );
    }

    #[test]
    fn test_view_reflects_profile() {
        let now = Utc::now();
        let mut customer = Customer::new("c1", "c1@example.com", "C One", now)
            .with_lifetime_value(12.5)
            .with_last_activity(now);
        customer.replace_segments([Segment::New, Segment::Active].into_iter().collect());

        let view = ProfileView::from(&customer);
        assert_eq!(view.id, "c1");
        assert_eq!(view.total_events, 0);
        assert_eq!(view.lifetime_value, 12.5);
        assert!(view.segments.contains(&Segment::Active));
        assert_eq!(view.last_activity, Some(now));
    }
}
