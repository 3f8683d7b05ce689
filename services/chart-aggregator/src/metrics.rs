//! Prometheus metrics for fill settlement and rollovers

use crate::candle::IntervalType;
use crate::error::ChartError;
use anyhow::Result;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use std::time::Duration;

/// Chart engine metrics in their own registry
#[derive(Debug, Clone)]
pub struct ChartMetrics {
    registry: Registry,
    fills_applied: IntCounter,
    fills_rejected: IntCounterVec,
    rollovers: IntCounterVec,
    lock_failures: IntCounterVec,
    lock_wait: Histogram,
}

impl ChartMetrics {
    /// Create and register every metric
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("chart".to_string()), None)?;

        let fills_applied = IntCounter::new("fills_applied_total", "Fills applied to every interval candle")?;
        let fills_rejected = IntCounterVec::new(
            Opts::new("fills_rejected_total", "Fills rejected by error kind"),
            &["kind"],
        )?;
        let rollovers = IntCounterVec::new(
            Opts::new("rollovers_total", "Candles rolled by interval type"),
            &["interval"],
        )?;
        let lock_failures = IntCounterVec::new(
            Opts::new("lock_failures_total", "Row lock failures by kind"),
            &["kind"],
        )?;
        let lock_wait = Histogram::with_opts(
            HistogramOpts::new("lock_wait_seconds", "Time spent acquiring candle row locks")
                .buckets(vec![0.000_1, 0.000_5, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;

        registry.register(Box::new(fills_applied.clone()))?;
        registry.register(Box::new(fills_rejected.clone()))?;
        registry.register(Box::new(rollovers.clone()))?;
        registry.register(Box::new(lock_failures.clone()))?;
        registry.register(Box::new(lock_wait.clone()))?;

        Ok(Self {
            registry,
            fills_applied,
            fills_rejected,
            rollovers,
            lock_failures,
            lock_wait,
        })
    }

    /// Count a settled fill
    pub fn fill_applied(&self) {
        self.fills_applied.inc();
    }

    /// Count a failed fill, and a lock failure when that was the cause
    pub fn fill_rejected(&self, error: &ChartError) {
        self.fills_rejected.with_label_values(&[error.kind()]).inc();
        self.lock_failed(error);
    }

    /// Count rolled candles
    pub fn rolled(&self, interval: IntervalType, candles: u64) {
        self.rollovers.with_label_values(&[interval.label()]).inc_by(candles);
    }

    /// Count a lock failure if `error` is one
    pub fn lock_failed(&self, error: &ChartError) {
        if error.is_transient() {
            self.lock_failures.with_label_values(&[error.kind()]).inc();
        }
    }

    /// Record time spent waiting for a row lock
    pub fn observe_lock_wait(&self, waited: Duration) {
        self.lock_wait.observe(waited.as_secs_f64());
    }

    /// Text exposition of every metric
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
