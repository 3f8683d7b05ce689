//! Core constants for the chart services.

/// Fixed-point arithmetic constants
pub mod fixed_point {
    /// 4-decimal fixed-point scale factor used by `Px`
    pub const SCALE_4: i64 = 10000;

    /// Conversion factor for basis points (1/100th of a percent)
    pub const BASIS_POINTS: i64 = 10000;
}

/// Time-related constants
pub mod time {
    /// Seconds per minute
    pub const SECS_PER_MINUTE: u64 = 60;

    /// Seconds per hour
    pub const SECS_PER_HOUR: u64 = 3600;

    /// Seconds per day
    pub const SECS_PER_DAY: u64 = 86400;

    /// Seconds per week
    pub const SECS_PER_WEEK: u64 = 7 * SECS_PER_DAY;

    /// Nanoseconds per second
    pub const NANOS_PER_SEC: u64 = 1_000_000_000;

    /// Nanoseconds per millisecond
    pub const NANOS_PER_MILLI: u64 = 1_000_000;
}

/// Memory and storage sizes
pub mod memory {
    /// One megabyte
    pub const MB: u64 = 1024 * 1024;

    /// Default WAL segment size in MB
    pub const DEFAULT_WAL_SEGMENT_SIZE_MB: u64 = 128;

    /// Events replayed between cooperative yields
    pub const WAL_REPLAY_BATCH_SIZE: u64 = 10000;
}
