//! Property and scenario tests for the pure aggregation steps

use chart_aggregator::{Candle, CandleId, CandleRow, ChartError, IntervalType, apply_trade, roll_interval};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use rstest::rstest;
use services_common::{Notional, Px, Symbol};

fn fresh(price_before: i64) -> Candle {
    Candle::unopened(CandleId::new(1), Symbol::new(1), IntervalType::Minute, Px::from_units(price_before))
}

fn apply_all(mut candle: Candle, fills: &[(i64, i64)]) -> Result<Candle, ChartError> {
    for &(price, amount) in fills {
        candle = apply_trade(&candle, Px::from_i64(price), amount)?;
    }
    Ok(candle)
}

fn assert_ordered(candle: &Candle) {
    let low = candle.price_low();
    let high = candle.price_high();
    assert!(low <= candle.price_start() && candle.price_start() <= high);
    assert!(low <= candle.price_end() && candle.price_end() <= high);
}

#[test]
fn test_two_fill_scenario() -> Result<(), ChartError> {
    let candle = fresh(100);

    let candle = apply_trade(&candle, Px::from_units(105), 3)?;
    assert_eq!(candle.price_start(), Px::from_units(105));
    assert_eq!(candle.price_high(), Px::from_units(105));
    assert_eq!(candle.price_low(), Px::from_units(105));
    assert_eq!(candle.price_end(), Px::from_units(105));
    assert_eq!(candle.amount(), 3);
    assert_eq!(candle.volume(), Notional::from_raw(3_150_000));

    let candle = apply_trade(&candle, Px::from_units(95), 2)?;
    assert_eq!(candle.price_start(), Px::from_units(105));
    assert_eq!(candle.price_high(), Px::from_units(105));
    assert_eq!(candle.price_low(), Px::from_units(95));
    assert_eq!(candle.price_end(), Px::from_units(95));
    assert_eq!(candle.amount(), 5);
    assert_eq!(candle.volume(), Notional::from_raw(5_050_000));

    let rolled = roll_interval(&candle);
    assert_eq!(rolled.price_before, Px::from_units(95));
    assert_eq!(rolled.price_start(), Px::from_units(95));
    assert_eq!(rolled.price_high(), Px::from_units(95));
    assert_eq!(rolled.price_low(), Px::from_units(95));
    assert_eq!(rolled.price_end(), Px::from_units(95));
    assert_eq!(rolled.amount(), 0);
    assert_eq!(rolled.volume(), Notional::ZERO);

    let row = CandleRow::from(&rolled);
    assert_eq!(row.price_before, row.price_end);
    assert_eq!(row.amount, 0);
    Ok(())
}

#[rstest]
#[case::zero_price(0, 3)]
#[case::negative_price(-1_000_000, 3)]
#[case::zero_amount(1_000_000, 0)]
#[case::negative_amount(1_000_000, -2)]
fn test_invalid_fill_rejected(#[case] price: i64, #[case] amount: i64) -> Result<(), ChartError> {
    let before = apply_trade(&fresh(100), Px::from_units(101), 1)?;
    let result = apply_trade(&before, Px::from_i64(price), amount);
    assert!(matches!(result, Err(ChartError::Validation { .. })));
    assert_eq!(before.amount(), 1);
    Ok(())
}

#[test]
fn test_fill_after_roll_reseeds_session() -> Result<(), ChartError> {
    let candle = apply_trade(&fresh(100), Px::from_units(120), 1)?;
    let rolled = roll_interval(&candle);
    let next = apply_trade(&rolled, Px::from_units(90), 1)?;
    assert_eq!(next.price_before, Px::from_units(120));
    assert_eq!(next.price_start(), Px::from_units(90));
    assert_eq!(next.price_high(), Px::from_units(90));
    assert_eq!(next.amount(), 1);
    Ok(())
}

fn fills() -> impl Strategy<Value = Vec<(i64, i64)>> {
    prop::collection::vec((1i64..10_000_000, 1i64..100_000), 1..64)
}

proptest! {
    #[test]
    fn prop_ohlc_tracks_fill_extremes(fills in fills()) {
        let candle = apply_all(fresh(100), &fills).map_err(|e| TestCaseError::fail(e.to_string()))?;

        let max = fills.iter().map(|&(p, _)| p).max().unwrap_or_default();
        let min = fills.iter().map(|&(p, _)| p).min().unwrap_or_default();
        prop_assert_eq!(candle.price_high(), Px::from_i64(max));
        prop_assert_eq!(candle.price_low(), Px::from_i64(min));
        prop_assert_eq!(candle.price_start(), Px::from_i64(fills[0].0));
        prop_assert_eq!(candle.price_end(), Px::from_i64(fills[fills.len() - 1].0));
    }

    #[test]
    fn prop_volume_is_exact_sum(fills in fills()) {
        let candle = apply_all(fresh(100), &fills).map_err(|e| TestCaseError::fail(e.to_string()))?;

        let volume: i128 = fills.iter().map(|&(p, a)| i128::from(p) * i128::from(a)).sum();
        let amount: i64 = fills.iter().map(|&(_, a)| a).sum();
        prop_assert_eq!(candle.volume(), Notional::from_raw(volume));
        prop_assert_eq!(i64::try_from(candle.amount()).ok(), Some(amount));
    }

    #[test]
    fn prop_prices_stay_ordered(fills in fills()) {
        let mut candle = fresh(100);
        assert_ordered(&candle);
        for &(price, amount) in &fills {
            candle = apply_trade(&candle, Px::from_i64(price), amount)
                .map_err(|e| TestCaseError::fail(e.to_string()))?;
            assert_ordered(&candle);
            prop_assert!(Candle::try_from(CandleRow::from(&candle)).is_ok());
        }
        let rolled = roll_interval(&candle);
        assert_ordered(&rolled);
    }

    #[test]
    fn prop_roll_is_idempotent(fills in fills()) {
        let candle = apply_all(fresh(100), &fills).map_err(|e| TestCaseError::fail(e.to_string()))?;
        let once = roll_interval(&candle);
        let twice = roll_interval(&once);
        prop_assert_eq!(once, twice);
    }
}
