//! Chart aggregator configuration

use crate::candle::IntervalType;
use crate::store::StoreOptions;
use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use services_common::constants::memory::{DEFAULT_WAL_SEGMENT_SIZE_MB, MB};
use std::path::PathBuf;
use std::time::Duration;

/// Chart aggregator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// WAL directory; unset keeps candles in memory only
    pub wal_dir: Option<PathBuf>,

    /// WAL segment size in megabytes
    pub segment_size_mb: u64,

    /// fsync the WAL on every commit
    pub sync_on_commit: bool,

    /// Longest wait for a candle row lock
    pub lock_timeout_ms: u64,

    /// Interval types created for every listed instrument
    pub intervals: Vec<IntervalType>,

    /// How often the scheduler checks for elapsed intervals
    pub scheduler_tick_ms: u64,

    /// Collect prometheus metrics
    pub metrics_enabled: bool,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            wal_dir: Some(PathBuf::from("./data/chart-wal")),
            segment_size_mb: DEFAULT_WAL_SEGMENT_SIZE_MB,
            sync_on_commit: true,
            lock_timeout_ms: 5_000,
            intervals: IntervalType::ALL.to_vec(),
            scheduler_tick_ms: 1_000,
            metrics_enabled: true,
        }
    }
}

impl AggregatorConfig {
    /// Load configuration from an optional TOML file, overridden by
    /// `CHART_*` environment variables
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix("CHART")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("intervals"),
            )
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.intervals.is_empty() {
            bail!("at least one interval type must be enabled");
        }
        if self.segment_size_mb == 0 {
            bail!("segment_size_mb must be positive");
        }
        if self.lock_timeout_ms == 0 {
            bail!("lock_timeout_ms must be positive");
        }
        if self.scheduler_tick_ms == 0 {
            bail!("scheduler_tick_ms must be positive");
        }
        Ok(())
    }

    /// Store options derived from this configuration
    #[must_use]
    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            wal_dir: self.wal_dir.clone(),
            segment_size: self.segment_size_mb.saturating_mul(MB),
            sync_on_commit: self.sync_on_commit,
            lock_timeout: Duration::from_millis(self.lock_timeout_ms),
        }
    }

    /// Scheduler tick period
    #[must_use]
    pub const fn scheduler_tick(&self) -> Duration {
        Duration::from_millis(self.scheduler_tick_ms)
    }
}
