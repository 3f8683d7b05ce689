//! Candle data model
//!
//! A candle is created once per (instrument, interval type) and mutated in
//! place for its whole life. The typed [`Candle`] carries the session state as
//! a tagged variant; [`CandleRow`] is the flat persisted column shape read by
//! reporting.

use crate::error::{ChartError, ChartResult};
use serde::{Deserialize, Serialize};
use services_common::constants::fixed_point::BASIS_POINTS;
use services_common::constants::time::{SECS_PER_DAY, SECS_PER_HOUR, SECS_PER_MINUTE, SECS_PER_WEEK};
use services_common::{Notional, Px, Symbol, Ts};
use std::fmt;
use std::str::FromStr;

/// Stable candle identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CandleId(pub u64);

impl CandleId {
    /// Create a candle id
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for CandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chart#{}", self.0)
    }
}

/// Candle granularity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum IntervalType {
    /// 1 minute bars
    #[serde(rename = "1m")]
    Minute,
    /// 5 minute bars
    #[serde(rename = "5m")]
    FiveMinutes,
    /// 15 minute bars
    #[serde(rename = "15m")]
    FifteenMinutes,
    /// 1 hour bars
    #[serde(rename = "1h")]
    Hour,
    /// Daily bars
    #[serde(rename = "1d")]
    Day,
    /// Weekly bars
    #[serde(rename = "1w")]
    Week,
}

impl IntervalType {
    /// Every interval type, shortest first
    pub const ALL: [Self; 6] = [
        Self::Minute,
        Self::FiveMinutes,
        Self::FifteenMinutes,
        Self::Hour,
        Self::Day,
        Self::Week,
    ];

    /// Persisted column code
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Minute => 1,
            Self::FiveMinutes => 2,
            Self::FifteenMinutes => 3,
            Self::Hour => 4,
            Self::Day => 5,
            Self::Week => 6,
        }
    }

    /// Decode a persisted column code
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Minute),
            2 => Some(Self::FiveMinutes),
            3 => Some(Self::FifteenMinutes),
            4 => Some(Self::Hour),
            5 => Some(Self::Day),
            6 => Some(Self::Week),
            _ => None,
        }
    }

    /// Get duration in seconds
    #[must_use]
    pub const fn duration_seconds(self) -> u64 {
        match self {
            Self::Minute => SECS_PER_MINUTE,
            Self::FiveMinutes => 5 * SECS_PER_MINUTE,
            Self::FifteenMinutes => 15 * SECS_PER_MINUTE,
            Self::Hour => SECS_PER_HOUR,
            Self::Day => SECS_PER_DAY,
            Self::Week => SECS_PER_WEEK,
        }
    }

    /// Seconds the interval grid is shifted back from the Unix epoch.
    /// The epoch fell on a Thursday; weeks start on Monday 1969-12-29.
    const fn grid_offset(self) -> u64 {
        match self {
            Self::Week => 3 * SECS_PER_DAY,
            _ => 0,
        }
    }

    /// Index of the interval containing `ts`.
    ///
    /// Boundaries are in UTC: days roll at 00:00 UTC and weeks at Monday
    /// 00:00 UTC. Exchange-local sessions are not modelled.
    #[must_use]
    pub const fn boundary_index(self, ts: Ts) -> u64 {
        (ts.as_secs() + self.grid_offset()) / self.duration_seconds()
    }

    /// Start of interval number `boundary`
    #[must_use]
    pub const fn boundary_start(self, boundary: u64) -> Ts {
        Ts::from_secs(
            boundary
                .saturating_mul(self.duration_seconds())
                .saturating_sub(self.grid_offset()),
        )
    }

    /// Start of the interval containing `ts`
    #[must_use]
    pub const fn interval_start(self, ts: Ts) -> Ts {
        self.boundary_start(self.boundary_index(ts))
    }

    /// Short label ("1m", "1h", ...)
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Minute => "1m",
            Self::FiveMinutes => "5m",
            Self::FifteenMinutes => "15m",
            Self::Hour => "1h",
            Self::Day => "1d",
            Self::Week => "1w",
        }
    }
}

impl fmt::Display for IntervalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for IntervalType {
    type Err = ChartError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|interval| interval.label() == s.trim())
            .ok_or_else(|| ChartError::validation(format!("unknown interval type '{s}'")))
    }
}

/// Instrument metadata carried alongside every candle lookup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instrument {
    /// Instrument id
    pub id: Symbol,
    /// Exchange code, e.g. "005930"
    pub code: String,
    /// Display name
    pub name: String,
}

/// (instrument, interval type) pair identifying one candle
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CandleKey {
    /// Traded instrument
    pub instrument: Symbol,
    /// Granularity
    pub interval: IntervalType,
}

/// State of the current interval of a candle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Session {
    /// No fill since the last rollover; every price equals `price_before`
    Unopened,
    /// At least one fill this interval
    Open(OpenSession),
}

/// OHLCV of an interval that has seen at least one fill
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenSession {
    pub(crate) start: Px,
    pub(crate) high: Px,
    pub(crate) low: Px,
    pub(crate) end: Px,
    pub(crate) amount: u64,
    pub(crate) volume: Notional,
}

impl OpenSession {
    /// First fill price of the interval
    #[must_use]
    pub const fn start(&self) -> Px {
        self.start
    }

    /// Highest fill price
    #[must_use]
    pub const fn high(&self) -> Px {
        self.high
    }

    /// Lowest fill price
    #[must_use]
    pub const fn low(&self) -> Px {
        self.low
    }

    /// Last fill price
    #[must_use]
    pub const fn end(&self) -> Px {
        self.end
    }

    /// Traded quantity, always > 0
    #[must_use]
    pub const fn amount(&self) -> u64 {
        self.amount
    }

    /// Traded notional
    #[must_use]
    pub const fn volume(&self) -> Notional {
        self.volume
    }
}

/// OHLCV candle for one instrument and interval type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candle {
    /// Identifier, stable for the candle's lifetime
    pub id: CandleId,
    /// Traded instrument
    pub instrument: Symbol,
    /// Granularity
    pub interval: IntervalType,
    /// Close of the previous completed interval
    pub price_before: Px,
    /// Current interval state
    pub session: Session,
}

impl Candle {
    /// New candle in the unopened state with `price_before` as baseline
    #[must_use]
    pub const fn unopened(id: CandleId, instrument: Symbol, interval: IntervalType, price_before: Px) -> Self {
        Self {
            id,
            instrument,
            interval,
            price_before,
            session: Session::Unopened,
        }
    }

    /// Lookup key
    #[must_use]
    pub const fn key(&self) -> CandleKey {
        CandleKey {
            instrument: self.instrument,
            interval: self.interval,
        }
    }

    /// True once the interval has seen a fill
    #[must_use]
    pub const fn is_open(&self) -> bool {
        matches!(self.session, Session::Open(_))
    }

    /// Open price
    #[must_use]
    pub const fn price_start(&self) -> Px {
        match &self.session {
            Session::Unopened => self.price_before,
            Session::Open(s) => s.start,
        }
    }

    /// High price
    #[must_use]
    pub const fn price_high(&self) -> Px {
        match &self.session {
            Session::Unopened => self.price_before,
            Session::Open(s) => s.high,
        }
    }

    /// Low price
    #[must_use]
    pub const fn price_low(&self) -> Px {
        match &self.session {
            Session::Unopened => self.price_before,
            Session::Open(s) => s.low,
        }
    }

    /// Close price
    #[must_use]
    pub const fn price_end(&self) -> Px {
        match &self.session {
            Session::Unopened => self.price_before,
            Session::Open(s) => s.end,
        }
    }

    /// Traded quantity this interval
    #[must_use]
    pub const fn amount(&self) -> u64 {
        match &self.session {
            Session::Unopened => 0,
            Session::Open(s) => s.amount,
        }
    }

    /// Traded notional this interval
    #[must_use]
    pub const fn volume(&self) -> Notional {
        match &self.session {
            Session::Unopened => Notional::ZERO,
            Session::Open(s) => s.volume,
        }
    }

    /// Change of the close against `price_before`, in basis points
    /// (10000 = 100%). Zero when there is no baseline.
    #[must_use]
    pub fn change_bp(&self) -> i64 {
        let before = i128::from(self.price_before.as_i64());
        if before == 0 {
            return 0;
        }
        let delta = i128::from(self.price_end().as_i64()) - before;
        let bp = delta * i128::from(BASIS_POINTS) / before;
        i64::try_from(bp).unwrap_or(if bp > 0 { i64::MAX } else { i64::MIN })
    }
}

/// Flat persisted shape of a candle, one column per field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandleRow {
    /// Candle id
    pub chart_id: CandleId,
    /// Instrument foreign key
    pub instrument_id: Symbol,
    /// Interval type code
    pub interval_type: u8,
    /// Previous close
    pub price_before: Px,
    /// Open
    pub price_start: Px,
    /// High
    pub price_high: Px,
    /// Low
    pub price_low: Px,
    /// Close
    pub price_end: Px,
    /// Traded quantity
    pub amount: u64,
    /// Traded notional
    pub volume: Notional,
}

impl CandleRow {
    /// Copy the columns an aggregation step may change, leaving identity
    /// columns untouched
    pub fn assign_mutable(&mut self, candle: &Candle) {
        self.price_before = candle.price_before;
        self.price_start = candle.price_start();
        self.price_high = candle.price_high();
        self.price_low = candle.price_low();
        self.price_end = candle.price_end();
        self.amount = candle.amount();
        self.volume = candle.volume();
    }

    fn corrupt(&self, reason: impl Into<String>) -> ChartError {
        ChartError::CorruptRow {
            candle: self.chart_id,
            reason: reason.into(),
        }
    }
}

impl From<&Candle> for CandleRow {
    fn from(candle: &Candle) -> Self {
        let mut row = Self {
            chart_id: candle.id,
            instrument_id: candle.instrument,
            interval_type: candle.interval.code(),
            price_before: Px::ZERO,
            price_start: Px::ZERO,
            price_high: Px::ZERO,
            price_low: Px::ZERO,
            price_end: Px::ZERO,
            amount: 0,
            volume: Notional::ZERO,
        };
        row.assign_mutable(candle);
        row
    }
}

impl TryFrom<CandleRow> for Candle {
    type Error = ChartError;

    fn try_from(row: CandleRow) -> ChartResult<Self> {
        let interval = IntervalType::from_code(row.interval_type)
            .ok_or_else(|| row.corrupt(format!("unknown interval code {}", row.interval_type)))?;

        let session = if row.amount == 0 {
            let flat = [row.price_start, row.price_high, row.price_low, row.price_end]
                .iter()
                .all(|px| *px == row.price_before);
            if !flat {
                return Err(row.corrupt("unopened candle with prices differing from price_before"));
            }
            if !row.volume.is_zero() {
                return Err(row.corrupt("unopened candle with non-zero volume"));
            }
            Session::Unopened
        } else {
            if row.price_low > row.price_high {
                return Err(row.corrupt("price_low above price_high"));
            }
            for (name, px) in [("price_start", row.price_start), ("price_end", row.price_end)] {
                if px < row.price_low || px > row.price_high {
                    return Err(row.corrupt(format!("{name} outside [price_low, price_high]")));
                }
            }
            if !row.price_low.is_positive() {
                return Err(row.corrupt("non-positive fill price"));
            }
            Session::Open(OpenSession {
                start: row.price_start,
                high: row.price_high,
                low: row.price_low,
                end: row.price_end,
                amount: row.amount,
                volume: row.volume,
            })
        };

        Ok(Self {
            id: row.chart_id,
            instrument: row.instrument_id,
            interval,
            price_before: row.price_before,
            session,
        })
    }
}

/// A single executed trade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fill {
    /// Traded instrument
    pub instrument: Symbol,
    /// Execution price
    pub price: Px,
    /// Executed quantity
    pub amount: i64,
}

impl Fill {
    /// Create a fill
    #[must_use]
    pub const fn new(instrument: Symbol, price: Px, amount: i64) -> Self {
        Self {
            instrument,
            price,
            amount,
        }
    }

    /// Check price > 0 and amount > 0, returning the amount as unsigned
    pub fn validate(&self) -> ChartResult<u64> {
        validate_fill(self.price, self.amount)
    }
}

/// Shared fill validation: price > 0 and amount > 0
pub(crate) fn validate_fill(price: Px, amount: i64) -> ChartResult<u64> {
    if !price.is_positive() {
        return Err(ChartError::validation(format!("price must be positive, got {price}")));
    }
    match u64::try_from(amount) {
        Ok(units) if units > 0 => Ok(units),
        _ => Err(ChartError::validation(format!("amount must be positive, got {amount}"))),
    }
}
