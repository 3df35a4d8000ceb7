//! customer-360: unified customer profiles with real-time segmentation,
//! predictive scoring, journey orchestration and privacy compliance.
//!
//! Boots one coordinator instance, seeds it with sample customers and logs
//! the resulting derived state.

mod demo;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use customer_core::config::AppConfig;
use customer_pipeline::Coordinator;
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(name = "customer-360")]
#[command(about = "Unified customer profiles with real-time segmentation and scoring")]
#[command(version)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(long, env = "CUSTOMER_360_CONFIG")]
    config: Option<PathBuf>,

    /// Node identifier (overrides config)
    #[arg(long, env = "CUSTOMER_360__NODE_ID")]
    node_id: Option<String>,

    /// Number of sample customers to seed
    #[arg(long, default_value_t = 100)]
    customers: usize,

    /// Blocking tasks used for seeding
    #[arg(long, default_value_t = 4)]
    workers: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "customer_360=info,customer_pipeline=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Customer 360 starting up");

    let mut config = AppConfig::load_from(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });
    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }

    let metrics = metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()?;

    let coordinator = Arc::new(Coordinator::in_memory(config));

    demo::seed_customers(coordinator.clone(), cli.customers, cli.workers).await?;

    let onboarding = coordinator.define_journey("onboarding", demo::onboarding_stages())?;
    info!(
        journey = %onboarding.name,
        stages = onboarding.stages.len(),
        "Journey ready"
    );

    if cli.customers > 0 {
        coordinator.record_consent("cust-0", "marketing", true)?;
    }

    demo::report(&coordinator)?;
    debug!(snapshot = %metrics.render(), "Metrics");

    info!("Customer 360 shut down cleanly");
    Ok(())
}
