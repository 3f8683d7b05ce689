//! Candle aggregator implementation
//!
//! Folds fills into the OHLCV state of a single candle and rolls it over at
//! interval boundaries. Everything here is a pure `Candle -> Candle` step;
//! locking and persistence live in [`crate::store`].

use crate::candle::{Candle, OpenSession, Session, validate_fill};
use crate::error::{ChartError, ChartResult};
use services_common::Px;

/// Apply one fill to a candle.
///
/// The first fill of an interval reseeds open/high/low from its price; later
/// fills widen high/low. `price_before` is never touched. Invalid input or
/// arithmetic overflow leaves `candle` as it was.
pub fn apply_trade(candle: &Candle, price: Px, amount: i64) -> ChartResult<Candle> {
    let units = validate_fill(price, amount)?;
    let notional = price.checked_notional(units).ok_or(ChartError::Overflow {
        candle: candle.id,
        context: "price * amount",
    })?;

    let session = match candle.session {
        Session::Unopened => OpenSession {
            start: price,
            high: price,
            low: price,
            end: price,
            amount: units,
            volume: notional,
        },
        Session::Open(open) => OpenSession {
            start: open.start,
            high: open.high.max(price),
            low: open.low.min(price),
            end: price,
            amount: open.amount.checked_add(units).ok_or(ChartError::Overflow {
                candle: candle.id,
                context: "amount",
            })?,
            volume: open.volume.checked_add(notional).ok_or(ChartError::Overflow {
                candle: candle.id,
                context: "volume",
            })?,
        },
    };

    Ok(Candle {
        session: Session::Open(session),
        ..candle.clone()
    })
}

/// Close the current interval: the last close becomes the new baseline and
/// the candle returns to the unopened state. Idempotent on unopened candles.
#[must_use]
pub fn roll_interval(candle: &Candle) -> Candle {
    Candle {
        price_before: candle.price_end(),
        session: Session::Unopened,
        ..candle.clone()
    }
}
