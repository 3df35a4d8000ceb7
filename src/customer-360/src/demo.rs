//! Sample data for a freshly started instance.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use customer_core::{CdpResult, Customer};
use customer_journey::JourneyStage;
use customer_pipeline::Coordinator;
use tracing::info;

pub fn sample_customer(index: usize, now: DateTime<Utc>) -> Customer {
    Customer::new(
        format!("cust-{index}"),
        format!("customer{index}@example.com"),
        format!("Customer {index}"),
        now,
    )
    .with_lifetime_value(1000.0 + index as f64 * 100.0)
    .with_last_activity(now - Duration::days((index % 60) as i64))
}

pub fn onboarding_stages() -> Vec<JourneyStage> {
    vec![
        JourneyStage::new("welcome", "send_email"),
        JourneyStage::new("tutorial", "show_guide"),
        JourneyStage::new("first_purchase", "offer_discount"),
    ]
}

/// Create `count` sample customers, split across `workers` blocking tasks.
pub async fn seed_customers(
    coordinator: Arc<Coordinator>,
    count: usize,
    workers: usize,
) -> anyhow::Result<()> {
    let now = coordinator.now();
    let workers = workers.max(1);
    let chunk = count.div_ceil(workers).max(1);

    let mut handles = Vec::with_capacity(workers);
    for start in (0..count).step_by(chunk) {
        let end = (start + chunk).min(count);
        let coordinator = coordinator.clone();
        handles.push(tokio::task::spawn_blocking(move || -> CdpResult<()> {
            for index in start..end {
                coordinator.create_profile(sample_customer(index, now))?;
            }
            Ok(())
        }));
    }
    for handle in handles {
        handle.await??;
    }

    info!(customers = count, workers, "Seeded sample customers");
    Ok(())
}

/// Log profile, segment, prediction and consent counts.
pub fn report(coordinator: &Coordinator) -> anyhow::Result<()> {
    info!(customers = coordinator.profile_count()?, "Customers");
    for (segment, members) in coordinator.segment_sizes() {
        info!(segment = %segment, customers = members, "Segment");
    }
    info!(predictions = coordinator.prediction_count(), "Predictions");
    info!(
        consent_records = coordinator.privacy().consent_customer_count(),
        "Consent records"
    );
    Ok(())
}
