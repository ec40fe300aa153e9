use anyhow::{bail, Context};
use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::metrics::{DeliveryMetricsConfig, DEFAULT_SAMPLE_WINDOW};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub history: HistoryConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "DatabaseConfig::default_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Root directory of the per-campaign allocation history
    pub root_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Trailing span of reported hours treated as provisional
    #[serde(with = "humantime_serde")]
    pub report_dead_zone: Duration,

    #[serde(with = "humantime_serde")]
    pub look_back: Duration,

    #[serde(default = "MetricsConfig::default_sample_window")]
    pub sample_window: usize,
}

impl DatabaseConfig {
    const fn default_max_connections() -> u32 {
        5
    }
}

impl MetricsConfig {
    const fn default_sample_window() -> usize {
        DEFAULT_SAMPLE_WINDOW
    }

    /// Aggregation settings in the units the metrics pass works with
    pub fn delivery_metrics(&self) -> anyhow::Result<DeliveryMetricsConfig> {
        let report_dead_zone = TimeDelta::from_std(self.report_dead_zone)
            .context("REPORT_DEAD_ZONE is out of range")?;
        let look_back =
            TimeDelta::from_std(self.look_back).context("ELIGIBILITY_LOOKBACK is out of range")?;

        Ok(DeliveryMetricsConfig {
            report_dead_zone,
            look_back,
            sample_window: self.sample_window,
        })
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            report_dead_zone: Duration::from_secs(3 * 3600),
            look_back: Duration::from_secs(14 * 24 * 3600),
            sample_window: DEFAULT_SAMPLE_WINDOW,
        }
    }
}

fn env_duration(name: &str, default: &str) -> anyhow::Result<Duration> {
    let raw = std::env::var(name).unwrap_or_else(|_| default.to_string());
    humantime::parse_duration(raw.trim())
        .with_context(|| format!("{name} must be a duration such as `3h` or `14d`, got `{raw}`"))
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_url =
            std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://./pacing.db".to_string());

        let max_connections = std::env::var("DATABASE_MAX_CONNECTIONS")
            .unwrap_or_else(|_| DatabaseConfig::default_max_connections().to_string())
            .parse::<u32>()
            .context("DATABASE_MAX_CONNECTIONS must be a positive integer")?;

        let root_dir = std::env::var("ALLOCATION_HISTORY_DIR")
            .unwrap_or_else(|_| "./allocation-history".to_string());

        let report_dead_zone = env_duration("REPORT_DEAD_ZONE", "3h")?;
        let look_back = env_duration("ELIGIBILITY_LOOKBACK", "14d")?;

        let sample_window = match std::env::var("PROFILE_SAMPLE_WINDOW") {
            Ok(raw) => raw
                .trim()
                .parse::<usize>()
                .with_context(|| format!("PROFILE_SAMPLE_WINDOW must be an integer, got `{raw}`"))?,
            Err(_) => MetricsConfig::default_sample_window(),
        };

        let config = Config {
            database: DatabaseConfig {
                url: database_url,
                max_connections,
            },
            history: HistoryConfig {
                root_dir: PathBuf::from(root_dir),
            },
            metrics: MetricsConfig {
                report_dead_zone,
                look_back,
                sample_window,
            },
        };
        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.database.max_connections == 0 {
            bail!("DATABASE_MAX_CONNECTIONS must be at least 1");
        }
        if self.metrics.look_back.is_zero() {
            bail!("ELIGIBILITY_LOOKBACK must be positive");
        }
        if self.metrics.sample_window == 0 {
            bail!("PROFILE_SAMPLE_WINDOW must be at least 1");
        }
        if self.metrics.report_dead_zone > self.metrics.look_back {
            tracing::warn!(
                "REPORT_DEAD_ZONE ({}) exceeds ELIGIBILITY_LOOKBACK ({}); passes will only ever see provisional hours",
                humantime::format_duration(self.metrics.report_dead_zone),
                humantime::format_duration(self.metrics.look_back)
            );
        }
        Ok(())
    }
}
