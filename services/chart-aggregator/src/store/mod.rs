//! Candle lookup and persistence under caller-chosen lock modes
//!
//! A mutation is always: find the rows with a write-capable [`LockMode`],
//! run the pure aggregation step on the snapshots, [`persist_all`] through
//! the same handles, drop the handles. The locks are held for exactly that
//! span.
//!
//! [`persist_all`]: CandleRepository::persist_all

pub mod memory;

use crate::candle::{Candle, CandleKey, Instrument, IntervalType};
use crate::error::ChartResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use services_common::{Px, Symbol};
use std::fmt;

pub use memory::{MemoryCandleStore, MemoryGuard, RecoveryReport, StoreOptions};

/// Concurrency-control strength requested for a read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    /// Latest committed row, read without waiting or holding a lock; read only
    DirtyRead,
    /// Read the latest committed row without waiting and hold nothing;
    /// persist succeeds only if nobody committed in between
    Optimistic,
    /// Shared row lock held until the handle drops, read only
    PessimisticRead,
    /// Exclusive row lock, waiting up to the storage lock timeout
    PessimisticWrite,
    /// Exclusive row lock, failing at once if another holder exists
    PessimisticWriteOrFail,
}

impl LockMode {
    /// Whether a handle opened in this mode may be persisted
    #[must_use]
    pub const fn is_writable(self) -> bool {
        matches!(
            self,
            Self::Optimistic | Self::PessimisticWrite | Self::PessimisticWriteOrFail
        )
    }

    /// Label used in logs and metrics
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DirtyRead => "dirty_read",
            Self::Optimistic => "optimistic",
            Self::PessimisticRead => "pessimistic_read",
            Self::PessimisticWrite => "pessimistic_write",
            Self::PessimisticWriteOrFail => "pessimistic_write_or_fail",
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which candles a lookup selects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandleFilter {
    /// Every interval type of one instrument
    Instrument(Symbol),
    /// One interval type across all instruments
    IntervalType(IntervalType),
}

impl CandleFilter {
    /// Whether `key` is selected
    #[must_use]
    pub fn matches(&self, key: &CandleKey) -> bool {
        match self {
            Self::Instrument(instrument) => key.instrument == *instrument,
            Self::IntervalType(interval) => key.interval == *interval,
        }
    }
}

/// A candle read under a lock mode, together with its instrument.
///
/// Dropping the handle releases whatever lock `G` holds.
#[derive(Debug)]
pub struct LockedCandle<G> {
    pub(crate) candle: Candle,
    pub(crate) instrument: Instrument,
    pub(crate) mode: LockMode,
    pub(crate) version: u64,
    pub(crate) guard: G,
}

impl<G> LockedCandle<G> {
    /// Snapshot read under the lock (updated by a successful persist)
    #[must_use]
    pub const fn candle(&self) -> &Candle {
        &self.candle
    }

    /// Related instrument metadata
    #[must_use]
    pub const fn instrument(&self) -> &Instrument {
        &self.instrument
    }

    /// Mode the handle was opened with
    #[must_use]
    pub const fn mode(&self) -> LockMode {
        self.mode
    }

    /// Row version observed (or last written) by this handle
    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version
    }

    /// Release the lock and keep the candle
    #[must_use]
    pub fn into_candle(self) -> Candle {
        self.candle
    }
}

/// Transactional candle storage
#[async_trait]
pub trait CandleRepository: Send + Sync {
    /// Lock state held by an open handle
    type Guard: Send + Sync;

    /// Register instrument metadata
    async fn register_instrument(&self, instrument: Instrument) -> ChartResult<()>;

    /// Create the unopened candle for `key` with `price_before` as baseline.
    /// The only way a candle row comes into existence.
    async fn create_candle(&self, key: CandleKey, price_before: Px) -> ChartResult<Candle>;

    /// Keys of the candles selected by `filter`, in id order, without locking
    async fn candle_keys(&self, filter: CandleFilter) -> ChartResult<Vec<CandleKey>>;

    /// Read the candles selected by `filter` under `mode`, locking rows in id
    /// order
    async fn find(&self, filter: CandleFilter, mode: LockMode) -> ChartResult<Vec<LockedCandle<Self::Guard>>>;

    /// Read the single candle for `key` under `mode`
    async fn find_one(&self, key: CandleKey, mode: LockMode) -> ChartResult<LockedCandle<Self::Guard>>;

    /// Write the mutable columns of each candle to the row held by the
    /// handle at the same position, all rows or none. Handles must be in
    /// ascending id order, as [`find`](CandleRepository::find) returns them.
    async fn persist_all(&self, handles: &mut [LockedCandle<Self::Guard>], candles: &[Candle]) -> ChartResult<()>;

    /// Atomically write the mutable columns of `candle` to the row held by
    /// `handle`
    async fn persist(&self, handle: &mut LockedCandle<Self::Guard>, candle: &Candle) -> ChartResult<()> {
        self.persist_all(std::slice::from_mut(handle), std::slice::from_ref(candle))
            .await
    }

    /// Every candle of one instrument
    async fn find_by_instrument(
        &self,
        instrument: Symbol,
        mode: LockMode,
    ) -> ChartResult<Vec<LockedCandle<Self::Guard>>> {
        self.find(CandleFilter::Instrument(instrument), mode).await
    }

    /// Every candle of one interval type
    async fn find_by_interval_type(
        &self,
        interval: IntervalType,
        mode: LockMode,
    ) -> ChartResult<Vec<LockedCandle<Self::Guard>>> {
        self.find(CandleFilter::IntervalType(interval), mode).await
    }
}
