//! Chart service: trade settlement and interval rollover over a repository
//!
//! A fill locks every interval row of its instrument in id order, runs the
//! pure aggregation step on each snapshot and commits all of them in one
//! journal batch. It lands on every interval or on none, so a caller may
//! retry a failed settlement as a whole. Rollovers lock one row at a time
//! and carry on past rows they could not lock.

use crate::aggregators::candle::{apply_trade, roll_interval};
use crate::candle::{Candle, CandleKey, Fill, Instrument, IntervalType};
use crate::error::{ChartError, ChartResult};
use crate::metrics::ChartMetrics;
use crate::store::{CandleFilter, CandleRepository, LockMode, LockedCandle};
use serde::{Deserialize, Serialize};
use services_common::{Px, Symbol};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Candles of one instrument as read by the charting path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartSnapshot {
    /// Instrument metadata
    pub instrument: Instrument,
    /// One candle per interval type, in id order
    pub candles: Vec<Candle>,
}

/// Result of rolling one interval type across every instrument
#[derive(Debug)]
pub struct RollOutcome {
    /// Interval type rolled
    pub interval: IntervalType,
    /// Candles rolled
    pub rolled: u64,
    /// Candles left as they were, with the reason
    pub failed: Vec<(CandleKey, ChartError)>,
}

impl RollOutcome {
    /// Whether every candle of the interval type was rolled
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// Keys of the candles that still need this rollover
    pub fn failed_keys(&self) -> impl Iterator<Item = CandleKey> + '_ {
        self.failed.iter().map(|(key, _)| *key)
    }
}

/// Settlement and rollover entry point
#[derive(Debug)]
pub struct ChartService<R: CandleRepository> {
    repository: Arc<R>,
    write_mode: LockMode,
    metrics: Option<ChartMetrics>,
}

impl<R: CandleRepository> ChartService<R> {
    /// Service writing under [`LockMode::PessimisticWrite`]
    #[must_use]
    pub fn new(repository: Arc<R>) -> Self {
        Self {
            repository,
            write_mode: LockMode::PessimisticWrite,
            metrics: None,
        }
    }

    /// Use another write-capable lock mode for mutations
    pub fn with_write_mode(mut self, mode: LockMode) -> ChartResult<Self> {
        if !mode.is_writable() {
            return Err(ChartError::validation(format!("{mode} cannot be used for writes")));
        }
        self.write_mode = mode;
        Ok(self)
    }

    /// Record settlement and rollover metrics
    #[must_use]
    pub fn with_metrics(mut self, metrics: ChartMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Underlying repository
    #[must_use]
    pub const fn repository(&self) -> &Arc<R> {
        &self.repository
    }

    /// Metrics, if enabled
    #[must_use]
    pub const fn metrics(&self) -> Option<&ChartMetrics> {
        self.metrics.as_ref()
    }

    /// Register an instrument and create its unopened candles, each with
    /// `listing_price` as the baseline
    pub async fn list_instrument(
        &self,
        instrument: Instrument,
        listing_price: Px,
        intervals: &[IntervalType],
    ) -> ChartResult<Vec<Candle>> {
        if !listing_price.is_positive() {
            return Err(ChartError::validation(format!(
                "listing price must be positive, got {listing_price}"
            )));
        }
        if intervals.is_empty() {
            return Err(ChartError::validation("at least one interval type is required"));
        }

        let id = instrument.id;
        self.repository.register_instrument(instrument).await?;

        let mut candles = Vec::with_capacity(intervals.len());
        for &interval in intervals {
            let key = CandleKey { instrument: id, interval };
            candles.push(self.repository.create_candle(key, listing_price).await?);
        }

        info!("Listed {} with {} candles at {}", id, candles.len(), listing_price);
        Ok(candles)
    }

    /// Apply one fill to every interval candle of its instrument
    pub async fn settle_trade(&self, fill: Fill) -> ChartResult<Vec<Candle>> {
        let result = self.settle(fill).await;
        if let Some(metrics) = &self.metrics {
            match &result {
                Ok(_) => metrics.fill_applied(),
                Err(e) => metrics.fill_rejected(e),
            }
        }
        result
    }

    async fn settle(&self, fill: Fill) -> ChartResult<Vec<Candle>> {
        fill.validate()?;

        let mut handles = self.lock_all(CandleFilter::Instrument(fill.instrument)).await?;
        if handles.is_empty() {
            return Err(ChartError::NotFound {
                instrument: fill.instrument,
                interval: None,
            });
        }

        let settled = handles
            .iter()
            .map(|handle| apply_trade(handle.candle(), fill.price, fill.amount))
            .collect::<ChartResult<Vec<_>>>()?;
        self.repository.persist_all(&mut handles, &settled).await?;
        drop(handles);

        for candle in &settled {
            debug!(
                "Settled {} x {} on {} {} (amount {})",
                fill.price,
                fill.amount,
                candle.instrument,
                candle.interval,
                candle.amount()
            );
        }
        Ok(settled)
    }

    /// Roll every candle of one interval type.
    ///
    /// A candle that cannot be rolled (lock timeout, contention, storage)
    /// does not stop the others; it is reported in [`RollOutcome::failed`]
    /// for the caller to retry.
    pub async fn roll_interval_type(&self, interval: IntervalType) -> ChartResult<RollOutcome> {
        let keys = self
            .repository
            .candle_keys(CandleFilter::IntervalType(interval))
            .await?;

        let mut outcome = RollOutcome {
            interval,
            rolled: 0,
            failed: Vec::new(),
        };
        for key in keys {
            match self.roll_key(key).await {
                Ok(_) => outcome.rolled += 1,
                Err(e) => {
                    warn!("Rollover of {} {} failed: {}", key.instrument, interval, e);
                    if let Some(metrics) = &self.metrics {
                        metrics.lock_failed(&e);
                    }
                    outcome.failed.push((key, e));
                }
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.rolled(interval, outcome.rolled);
        }
        if outcome.is_complete() {
            info!("Rolled {} {} candles", outcome.rolled, interval);
        } else {
            warn!(
                "Rolled {} {} candles, {} left for retry",
                outcome.rolled,
                interval,
                outcome.failed.len()
            );
        }
        Ok(outcome)
    }

    /// Roll a single candle
    pub async fn roll_candle(&self, instrument: Symbol, interval: IntervalType) -> ChartResult<Candle> {
        let candle = self.roll_key(CandleKey { instrument, interval }).await;
        if let Some(metrics) = &self.metrics {
            match &candle {
                Ok(_) => metrics.rolled(interval, 1),
                Err(e) => metrics.lock_failed(e),
            }
        }
        candle
    }

    async fn roll_key(&self, key: CandleKey) -> ChartResult<Candle> {
        let mut handle = self.lock(key).await?;
        let next = roll_interval(handle.candle());
        self.repository.persist(&mut handle, &next).await?;
        debug!("Rolled {} {} to baseline {}", key.instrument, key.interval, next.price_before);
        Ok(next)
    }

    /// Read every candle of an instrument under `mode`
    pub async fn chart(&self, instrument: Symbol, mode: LockMode) -> ChartResult<ChartSnapshot> {
        let handles = self.repository.find_by_instrument(instrument, mode).await?;
        let Some(first) = handles.first() else {
            return Err(ChartError::NotFound {
                instrument,
                interval: None,
            });
        };

        let instrument = first.instrument().clone();
        let candles = handles.into_iter().map(LockedCandle::into_candle).collect();
        Ok(ChartSnapshot { instrument, candles })
    }

    async fn lock_all(&self, filter: CandleFilter) -> ChartResult<Vec<LockedCandle<R::Guard>>> {
        let started = Instant::now();
        let handles = self.repository.find(filter, self.write_mode).await;
        if let Some(metrics) = &self.metrics {
            metrics.observe_lock_wait(started.elapsed());
        }
        handles
    }

    async fn lock(&self, key: CandleKey) -> ChartResult<LockedCandle<R::Guard>> {
        let started = Instant::now();
        let handle = self.repository.find_one(key, self.write_mode).await;
        if let Some(metrics) = &self.metrics {
            metrics.observe_lock_wait(started.elapsed());
        }
        handle
    }
}
