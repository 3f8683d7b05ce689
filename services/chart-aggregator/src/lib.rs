//! Chart Aggregator Service
//!
//! Maintains one live OHLCV candle per instrument and interval type:
//! - Pure aggregation steps (`apply_trade`, `roll_interval`)
//! - Row-locked lookup and persistence under caller-chosen lock modes
//! - WAL-backed durability with replay on startup
//! - Wall-clock rollover scheduling

pub mod aggregators;
pub mod candle;
pub mod config;
pub mod error;
pub mod metrics;
pub mod scheduler;
pub mod service;
pub mod storage;
pub mod store;

pub use aggregators::{apply_trade, roll_interval};
pub use candle::{Candle, CandleId, CandleKey, CandleRow, Fill, Instrument, IntervalType, OpenSession, Session};
pub use config::AggregatorConfig;
pub use error::{ChartError, ChartResult};
pub use metrics::ChartMetrics;
pub use scheduler::{DueRollover, IntervalScheduler};
pub use service::{ChartService, ChartSnapshot, RollOutcome};
pub use storage::{ChartEvent, Wal, WalEntry, WalStats};
pub use store::{
    CandleFilter, CandleRepository, LockMode, LockedCandle, MemoryCandleStore, MemoryGuard, RecoveryReport,
    StoreOptions,
};
