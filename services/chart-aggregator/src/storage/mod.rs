//! Durable storage for the candle store

pub mod events;
pub mod segment;
pub mod wal;

pub use events::{CandleEvent, ChartEvent, InstrumentEvent};
pub use segment::{Segment, SegmentReader};
pub use wal::{Wal, WalEntry, WalIterator, WalStats};
