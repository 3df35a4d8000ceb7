//! Event ingestion: the boundary that turns an inbound event into one pass
//! through the pipeline.

use customer_core::types::{CustomerEvent, IngestEvent};
use customer_core::{Alias, CdpError, CdpResult, Customer};
use customer_core::types::ProfileEventType::{ProfileCreated, ProfileUpdated};
use customer_segmentation::SegmentChange;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::coordinator::{email_alias, missing_guard, Coordinator, IdentityLocks};

/// What one ingested event did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestOutcome {
    pub customer_id: String,
    pub created: bool,
    pub canonical_key: Option<String>,
    /// Canonical keys retired by an identity merge this event caused.
    pub merged_keys: Vec<String>,
    pub segments: SegmentChange,
}

impl Coordinator {
    /// Ingest one event: resolve its aliases, create or update the target
    /// profile, and recompute segments and predictions. Either the whole
    /// event applies or the store is left untouched.
    pub fn ingest(&self, event: IngestEvent) -> CdpResult<IngestOutcome> {
        let now = self.now();
        if let Some(delta) = event.lifetime_value_delta {
            if !delta.is_finite() {
                return Err(CdpError::invalid(
                    "lifetime_value_delta",
                    format!("must be finite, got {delta}"),
                ));
            }
        }

        let aliases = event_aliases(&event);
        let customer_id = self.target_profile(&event, &aliases)?;

        let IdentityLocks {
            locks,
            resolution,
            prior: (existing, prior_key),
        } = self.with_identity_locks(Some(&customer_id), &aliases, now, |_| {
            Ok((
                self.store().get(&customer_id)?,
                self.identity().key_for_profile(&customer_id),
            ))
        })?;
        let guard = locks
            .guard(&customer_id)
            .ok_or_else(|| missing_guard(&customer_id))?;

        let created = existing.is_none();
        let mut customer = existing.unwrap_or_else(|| {
            Customer::new(
                customer_id.as_str(),
                event.email.as_deref().unwrap_or_default().trim(),
                event.name.as_deref().unwrap_or_default(),
                now,
            )
        });
        apply_event(&mut customer, &event);
        if let Some(resolution) = &resolution {
            customer.canonical_key = Some(resolution.key.clone());
        }
        let predictions = self.derive(&mut customer, now);

        let written = if created {
            self.store().create_locked(guard, customer.clone()).map(|_| ())
        } else {
            self.store().put_locked(guard, customer.clone())
        };
        if let Err(err) = written {
            // Alias merges stay: they record facts about identities, not
            // about this profile.
            if let (Some(resolution), None) = (&resolution, &prior_key) {
                self.unlink_failed(&customer_id, resolution);
            }
            warn!(customer_id = %customer_id, error = %err, "Ingest aborted before commit");
            return Err(err);
        }

        if let Some(resolution) = &resolution {
            self.repoint(&locks, resolution, Some(customer_id.as_str()), now);
            self.record_merge(&customer_id, resolution);
        }
        let segments = self.publish(&customer, predictions);

        metrics::counter!("cdp.events.ingested").increment(1);
        self.emit(
            if created { ProfileCreated } else { ProfileUpdated },
            &customer_id,
            json!({
                "source": "ingest",
                "event": event.event_name,
                "attributes": event.attribute_deltas.keys().collect::<Vec<_>>(),
            }),
        );
        debug!(customer_id = %customer_id, created, "Event ingested");

        Ok(IngestOutcome {
            customer_id,
            created,
            canonical_key: customer.canonical_key,
            merged_keys: resolution.map(|r| r.merged_keys).unwrap_or_default(),
            segments,
        })
    }

    /// The profile an event applies to: the hint if given, else the
    /// smallest profile already linked to one of its aliases, else a fresh
    /// id.
    fn target_profile(&self, event: &IngestEvent, aliases: &[Alias]) -> CdpResult<String> {
        if let Some(hint) = event.customer_id_hint.as_deref() {
            let hint = hint.trim();
            if hint.is_empty() {
                return Err(CdpError::invalid("customer_id_hint", "must not be blank"));
            }
            return Ok(hint.to_string());
        }
        if aliases.is_empty() {
            return Err(CdpError::invalid(
                "customer_id_hint",
                "an event without a customer id hint needs at least one alias",
            ));
        }
        Ok(self
            .identity()
            .linked_profiles(aliases)
            .into_iter()
            .next()
            .unwrap_or_else(|| format!("cust-{}", Uuid::new_v4())))
    }
}

fn event_aliases(event: &IngestEvent) -> Vec<Alias> {
    let mut aliases = event.aliases.clone();
    if let Some(email) = &event.email {
        aliases.extend(email_alias(email));
    }
    aliases
}

fn apply_event(customer: &mut Customer, event: &IngestEvent) {
    if let Some(email) = event.email.as_deref().map(str::trim) {
        if !email.is_empty() {
            customer.email = email.to_string();
        }
    }
    if let Some(name) = &event.name {
        customer.name = name.clone();
    }
    customer.apply_attribute_deltas(&event.attribute_deltas);
    if let Some(name) = &event.event_name {
        customer.record_event(CustomerEvent {
            name: name.clone(),
            properties: event.attribute_deltas.clone(),
            timestamp: event.timestamp,
        });
    }
    if let Some(delta) = event.lifetime_value_delta {
        customer.adjust_lifetime_value(delta);
    }
}
