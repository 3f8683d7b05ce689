//! Event types for chart WAL persistence
//!
//! Every committed mutation of the candle store is journaled as one event.
//! Replaying the events in order rebuilds the store.

use crate::candle::{CandleRow, Instrument};
use serde::{Deserialize, Serialize};
use services_common::Ts;

use super::wal::WalEntry;

/// Journaled store mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChartEvent {
    /// Instrument metadata registered
    InstrumentListed(InstrumentEvent),
    /// Candle row created
    CandleCreated(CandleEvent),
    /// Candle row rewritten by a fill or a rollover
    CandleUpdated(CandleEvent),
}

impl WalEntry for ChartEvent {
    fn timestamp(&self) -> Ts {
        match self {
            Self::InstrumentListed(e) => e.ts,
            Self::CandleCreated(e) | Self::CandleUpdated(e) => e.ts,
        }
    }
}

/// Instrument registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentEvent {
    /// Commit time
    pub ts: Ts,
    /// Registered metadata
    pub instrument: Instrument,
}

/// Full candle row after a commit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandleEvent {
    /// Commit time
    pub ts: Ts,
    /// Row version after this commit, starting at 1 on creation
    pub version: u64,
    /// Row contents
    pub row: CandleRow,
}
