//! Error types for the chart aggregation engine

use crate::candle::{CandleId, IntervalType};
use services_common::Symbol;
use thiserror::Error;

/// Chart engine error types
#[derive(Error, Debug)]
pub enum ChartError {
    /// Fill rejected before any mutation
    #[error("Validation error: {message}")]
    Validation {
        /// What was wrong with the input
        message: String,
    },

    /// No candle for the requested instrument/interval
    #[error("Candle not found: {instrument} {interval:?}")]
    NotFound {
        /// Instrument that was looked up
        instrument: Symbol,
        /// Interval type, when the lookup was scoped to one
        interval: Option<IntervalType>,
    },

    /// Candle or instrument already exists
    #[error("Already exists: {what}")]
    AlreadyExists {
        /// Description of the duplicate
        what: String,
    },

    /// Row lock not acquired within the storage lock timeout
    #[error("Lock timeout on candle {candle} after {waited_ms}ms")]
    LockTimeout {
        /// Contended candle
        candle: CandleId,
        /// Time spent waiting
        waited_ms: u64,
    },

    /// Row lock held elsewhere and the caller asked not to wait
    #[error("Candle {candle} is locked by another writer")]
    LockContention {
        /// Contended candle
        candle: CandleId,
    },

    /// Optimistic version check failed on persist
    #[error("Candle {candle} changed concurrently (read version {expected}, found {found})")]
    Conflict {
        /// Candle that moved
        candle: CandleId,
        /// Version observed at read time
        expected: u64,
        /// Version found at write time
        found: u64,
    },

    /// Persist attempted through a handle opened with a read-only lock mode
    #[error("Candle {candle} was read with a read-only lock mode")]
    ReadOnlyLock {
        /// Candle the write was aimed at
        candle: CandleId,
    },

    /// Persist attempted with a candle that does not belong to the handle
    #[error("Candle identity mismatch: handle holds {held}, got {given}")]
    IdentityMismatch {
        /// Candle held by the handle
        held: CandleId,
        /// Candle passed to persist
        given: CandleId,
    },

    /// Persisted row violates the candle invariants
    #[error("Corrupt candle row {candle}: {reason}")]
    CorruptRow {
        /// Offending candle
        candle: CandleId,
        /// Which invariant failed
        reason: String,
    },

    /// Checked arithmetic overflowed
    #[error("Arithmetic overflow on candle {candle}: {context}")]
    Overflow {
        /// Candle being updated
        candle: CandleId,
        /// Operation that overflowed
        context: &'static str,
    },

    /// Write-ahead log or other storage failure
    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl ChartError {
    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// True for failures a caller may resolve by retrying the whole
    /// settlement. The engine itself never retries.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::LockTimeout { .. } | Self::LockContention { .. } | Self::Conflict { .. }
        )
    }

    /// Short label used for metrics
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::NotFound { .. } => "not_found",
            Self::AlreadyExists { .. } => "already_exists",
            Self::LockTimeout { .. } => "lock_timeout",
            Self::LockContention { .. } => "lock_contention",
            Self::Conflict { .. } => "conflict",
            Self::ReadOnlyLock { .. } => "read_only_lock",
            Self::IdentityMismatch { .. } => "identity_mismatch",
            Self::CorruptRow { .. } => "corrupt_row",
            Self::Overflow { .. } => "overflow",
            Self::Storage(_) => "storage",
        }
    }
}

/// Type alias for chart engine results
pub type ChartResult<T> = Result<T, ChartError>;
