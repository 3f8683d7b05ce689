//! Common types shared by the chart services
//!
//! Everything here is fixed-point: prices are ticks, notionals are
//! ticks x units. Floating point only appears at display boundaries.

pub mod constants;
pub mod types;

pub use types::*;
