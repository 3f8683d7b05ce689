//! Aggregator implementations

pub mod candle;

pub use candle::{apply_trade, roll_interval};
