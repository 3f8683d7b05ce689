//! Wall-clock interval rollover trigger
//!
//! Downtime that spans several boundaries of an interval type produces a
//! single rollover for it. Rolling an unopened candle is idempotent, so one
//! roll leaves the same row a boundary-by-boundary backfill would.
//!
//! Candles a rollover could not lock stay pending and are retried on every
//! tick until they roll. A pass that fails as a whole leaves its boundary
//! due again.

use crate::candle::{CandleKey, IntervalType};
use crate::error::ChartError;
use crate::service::ChartService;
use crate::store::CandleRepository;
use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use services_common::Ts;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

/// An interval type whose boundary has been crossed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DueRollover {
    /// Interval type to roll
    pub interval: IntervalType,
    /// Boundary index reached
    pub boundary: u64,
    /// Boundaries crossed without a rollover
    pub skipped: u64,
}

/// Tracks the last rolled boundary per interval type and the candles still
/// owed a rollover
#[derive(Debug, Clone)]
pub struct IntervalScheduler {
    last_boundary: FxHashMap<IntervalType, u64>,
    pending: Vec<CandleKey>,
}

impl IntervalScheduler {
    /// Scheduler for `intervals`, treating the boundaries at `now` as rolled
    #[must_use]
    pub fn new(intervals: &[IntervalType], now: Ts) -> Self {
        let last_boundary = intervals
            .iter()
            .map(|&interval| (interval, interval.boundary_index(now)))
            .collect();
        Self {
            last_boundary,
            pending: Vec::new(),
        }
    }

    /// Candles whose last rollover failed, retried on the next pass
    #[must_use]
    pub fn pending(&self) -> &[CandleKey] {
        &self.pending
    }

    /// Interval types that crossed a boundary since the previous tick,
    /// shortest first
    pub fn tick(&mut self, now: Ts) -> Vec<DueRollover> {
        let mut due: Vec<DueRollover> = self
            .last_boundary
            .iter_mut()
            .filter_map(|(&interval, last)| {
                let boundary = interval.boundary_index(now);
                // Clock steps backwards are ignored until it catches up
                if boundary <= *last {
                    return None;
                }
                let skipped = boundary - *last - 1;
                *last = boundary;
                Some(DueRollover {
                    interval,
                    boundary,
                    skipped,
                })
            })
            .collect();

        due.sort_by_key(|d| d.interval);
        for d in &due {
            if d.skipped > 0 {
                warn!(
                    "{} missed {} boundaries, collapsing them into one rollover at {}",
                    d.interval,
                    d.skipped,
                    boundary_time(d.interval, d.boundary)
                );
            }
        }
        due
    }

    /// Retry pending candles, then roll every interval type due at `now`
    pub async fn roll_due<R: CandleRepository>(&mut self, service: &ChartService<R>, now: Ts) -> Vec<DueRollover> {
        self.retry_pending(service).await;

        let due = self.tick(now);
        for d in &due {
            match service.roll_interval_type(d.interval).await {
                Ok(outcome) => {
                    // The pass tried every candle of the type, older misses included
                    self.pending.retain(|key| key.interval != d.interval);
                    self.pending.extend(outcome.failed_keys());
                }
                Err(e) => {
                    error!("Rollover of {} failed, retrying on the next tick: {}", d.interval, e);
                    if let Some(last) = self.last_boundary.get_mut(&d.interval) {
                        *last = d.boundary - d.skipped - 1;
                    }
                }
            }
        }
        due
    }

    async fn retry_pending<R: CandleRepository>(&mut self, service: &ChartService<R>) {
        for key in std::mem::take(&mut self.pending) {
            match service.roll_candle(key.instrument, key.interval).await {
                Ok(_) => info!("Rolled {} {} on retry", key.instrument, key.interval),
                Err(ChartError::NotFound { .. }) => {
                    warn!("Dropping pending rollover of {} {}, candle is gone", key.instrument, key.interval);
                }
                Err(e) => {
                    warn!("Retry of {} {} rollover failed: {}", key.instrument, key.interval, e);
                    self.pending.push(key);
                }
            }
        }
    }

    /// Roll due interval types every `period` until `shutdown` turns true
    pub async fn run<R: CandleRepository>(
        mut self,
        service: Arc<ChartService<R>>,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("Interval scheduler started with {} interval types", self.last_boundary.len());
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.roll_due(&*service, Ts::now()).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Interval scheduler stopped");
    }
}

/// RFC 3339 start of boundary `boundary` of `interval`
fn boundary_time(interval: IntervalType, boundary: u64) -> String {
    let secs = interval.boundary_start(boundary).as_secs();
    i64::try_from(secs)
        .ok()
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .map_or_else(|| secs.to_string(), |t| t.to_rfc3339())
}
