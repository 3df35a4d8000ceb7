use std::path::Path;

use serde::Deserialize;

use crate::error::{CdpError, CdpResult};

/// Root application configuration. Loaded from an optional TOML file and
/// environment variables with the prefix `CUSTOMER_360__`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub segmentation: SegmentationConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub privacy: PrivacyConfig,
}

fn default_node_id() -> String {
    "node-01".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            segmentation: SegmentationConfig::default(),
            scoring: ScoringConfig::default(),
            privacy: PrivacyConfig::default(),
        }
    }
}

// ─── Segmentation Config ────────────────────────────────────────────────

/// Thresholds for the segment rule table.
#[derive(Debug, Clone, Deserialize)]
pub struct SegmentationConfig {
    #[serde(default = "default_high_value_threshold")]
    pub high_value_threshold: f64,
    #[serde(default = "default_at_risk_days")]
    pub at_risk_days: i64,
    #[serde(default = "default_dormant_days")]
    pub dormant_days: i64,
    #[serde(default = "default_new_days")]
    pub new_days: i64,
    #[serde(default = "default_active_days")]
    pub active_days: i64,
}

fn default_high_value_threshold() -> f64 {
    10_000.0
}
fn default_at_risk_days() -> i64 {
    30
}
fn default_dormant_days() -> i64 {
    90
}
fn default_new_days() -> i64 {
    30
}
fn default_active_days() -> i64 {
    7
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            high_value_threshold: default_high_value_threshold(),
            at_risk_days: default_at_risk_days(),
            dormant_days: default_dormant_days(),
            new_days: default_new_days(),
            active_days: default_active_days(),
        }
    }
}

// ─── Scoring Config ─────────────────────────────────────────────────────

/// Coefficients for the churn and lifetime-value formulas.
#[derive(Debug, Clone, Deserialize)]
pub struct ScoringConfig {
    #[serde(default = "default_churn_horizon_days")]
    pub churn_horizon_days: i64,
    #[serde(default = "default_ltv_event_divisor")]
    pub ltv_event_divisor: f64,
    #[serde(default = "default_ltv_multiplier")]
    pub ltv_multiplier: f64,
}

fn default_churn_horizon_days() -> i64 {
    90
}
fn default_ltv_event_divisor() -> f64 {
    100.0
}
fn default_ltv_multiplier() -> f64 {
    1.2
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            churn_horizon_days: default_churn_horizon_days(),
            ltv_event_divisor: default_ltv_event_divisor(),
            ltv_multiplier: default_ltv_multiplier(),
        }
    }
}

// ─── Privacy Config ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PrivacyConfig {
    /// When set, consent can only be recorded for customers that have a
    /// stored profile.
    #[serde(default)]
    pub require_profile_for_consent: bool,
}

impl AppConfig {
    /// Load configuration from environment variables only.
    pub fn load() -> CdpResult<Self> {
        Self::load_from(None)
    }

    /// Load configuration from an optional TOML file, then environment
    /// variables, which take precedence.
    pub fn load_from(path: Option<&Path>) -> CdpResult<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("CUSTOMER_360")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject threshold combinations the derivation rules cannot honour.
    pub fn validate(&self) -> CdpResult<()> {
        let seg = &self.segmentation;
        if seg.high_value_threshold < 0.0 {
            return Err(CdpError::Config(
                "segmentation.high_value_threshold must be non-negative".into(),
            ));
        }
        for (name, days) in [
            ("at_risk_days", seg.at_risk_days),
            ("dormant_days", seg.dormant_days),
            ("new_days", seg.new_days),
            ("active_days", seg.active_days),
        ] {
            if days < 0 {
                return Err(CdpError::Config(format!(
                    "segmentation.{name} must be non-negative, got {days}"
                )));
            }
        }

        let scoring = &self.scoring;
        if scoring.churn_horizon_days <= 0 {
            return Err(CdpError::Config(
                "scoring.churn_horizon_days must be positive".into(),
            ));
        }
        if !(scoring.ltv_event_divisor > 0.0) {
            return Err(CdpError::Config(
                "scoring.ltv_event_divisor must be positive".into(),
            ));
        }
        if !(scoring.ltv_multiplier >= 1.0) {
            return Err(CdpError::Config(
                "scoring.ltv_multiplier must be at least 1.0".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.segmentation.high_value_threshold, 10_000.0);
        assert_eq!(config.segmentation.at_risk_days, 30);
        assert_eq!(config.segmentation.dormant_days, 90);
        assert_eq!(config.segmentation.new_days, 30);
        assert_eq!(config.segmentation.active_days, 7);
        assert_eq!(config.scoring.churn_horizon_days, 90);
        assert_eq!(config.scoring.ltv_event_divisor, 100.0);
        assert_eq!(config.scoring.ltv_multiplier, 1.2);
        assert!(!config.privacy.require_profile_for_consent);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_document_falls_back_to_defaults() {
        let config: AppConfig = serde_json::from_value(serde_json::json!({
            "segmentation": { "active_days": 14 },
            "scoring": { "ltv_multiplier": 1.5 }
        }))
        .unwrap();
        assert_eq!(config.segmentation.active_days, 14);
        assert_eq!(config.segmentation.dormant_days, 90);
        assert_eq!(config.scoring.ltv_multiplier, 1.5);
        assert_eq!(config.node_id, "node-01");
    }

    #[test]
    fn test_validate_rejects_shrinking_multiplier() {
        let mut config = AppConfig::default();
        config.scoring.ltv_multiplier = 0.8;
        assert!(matches!(config.validate(), Err(CdpError::Config(_))));

        let mut config = AppConfig::default();
        config.scoring.churn_horizon_days = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.segmentation.active_days = -1;
        assert!(config.validate().is_err());
    }
}
