//! Concurrent settlement and rollover against shared candle rows

use anyhow::Result;
use chart_aggregator::{
    Candle, CandleRow, ChartService, Fill, Instrument, IntervalType, LockMode, MemoryCandleStore, StoreOptions,
};
use rstest::rstest;
use services_common::{Notional, Px, Symbol};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinSet;

const INTERVALS: [IntervalType; 3] = [IntervalType::Minute, IntervalType::Hour, IntervalType::Day];

fn instrument(id: u32) -> Instrument {
    Instrument {
        id: Symbol::new(id),
        code: format!("{id:06}"),
        name: format!("Instrument {id}"),
    }
}

async fn service(wal: Option<&TempDir>) -> Result<Arc<ChartService<MemoryCandleStore>>> {
    let options = StoreOptions {
        wal_dir: wal.map(|dir| dir.path().to_path_buf()),
        sync_on_commit: false,
        lock_timeout: Duration::from_secs(10),
        ..StoreOptions::default()
    };
    let (store, _) = MemoryCandleStore::open(options).await?;
    Ok(Arc::new(ChartService::new(Arc::new(store))))
}

fn price(producer: u32, i: u32) -> Px {
    Px::from_units(100 + i64::from((producer * 7 + i) % 21) - 10)
}

#[rstest]
#[case::memory(false)]
#[case::journaled(true)]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_fills_lose_no_updates(#[case] journaled: bool) -> Result<()> {
    let temp_dir = TempDir::new()?;
    let service = service(journaled.then_some(&temp_dir)).await?;
    service.list_instrument(instrument(1), Px::from_units(100), &INTERVALS).await?;

    let producers = 8u32;
    let fills_per_producer = 50u32;
    let mut join_set = JoinSet::new();

    for producer in 0..producers {
        let service = Arc::clone(&service);
        join_set.spawn(async move {
            let mut amount = 0i64;
            let mut volume = 0i128;
            for i in 0..fills_per_producer {
                let px = price(producer, i);
                let qty = i64::from(i % 5 + 1);
                service.settle_trade(Fill::new(Symbol::new(1), px, qty)).await?;
                amount += qty;
                volume += i128::from(px.as_i64()) * i128::from(qty);
                if i % 10 == 0 {
                    tokio::task::yield_now().await;
                }
            }
            Ok::<_, anyhow::Error>((amount, volume))
        });
    }

    let mut expected_amount = 0i64;
    let mut expected_volume = 0i128;
    while let Some(result) = join_set.join_next().await {
        let (amount, volume) = result??;
        expected_amount += amount;
        expected_volume += volume;
    }

    let chart = service.chart(Symbol::new(1), LockMode::PessimisticRead).await?;
    assert_eq!(chart.candles.len(), INTERVALS.len());
    for candle in &chart.candles {
        assert_eq!(i64::try_from(candle.amount())?, expected_amount);
        assert_eq!(candle.volume(), Notional::from_raw(expected_volume));
        assert_eq!(candle.price_high(), Px::from_units(110));
        assert_eq!(candle.price_low(), Px::from_units(90));
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_retried_settlements_count_once() -> Result<()> {
    let (store, _) = MemoryCandleStore::open(StoreOptions::default()).await?;
    let service = Arc::new(
        ChartService::new(Arc::new(store)).with_write_mode(LockMode::PessimisticWriteOrFail)?,
    );
    service.list_instrument(instrument(1), Px::from_units(100), &INTERVALS).await?;

    let mut join_set = JoinSet::new();
    for producer in 0..6u32 {
        let service = Arc::clone(&service);
        join_set.spawn(async move {
            let mut retries = 0u64;
            for i in 0..40u32 {
                let fill = Fill::new(Symbol::new(1), price(producer, i), 1);
                loop {
                    match service.settle_trade(fill).await {
                        Ok(_) => break,
                        Err(e) if e.is_transient() => {
                            retries += 1;
                            tokio::task::yield_now().await;
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
            }
            Ok::<_, anyhow::Error>(retries)
        });
    }
    while let Some(result) = join_set.join_next().await {
        result??;
    }

    // Contended fills were retried whole; none landed on a subset of rows
    let chart = service.chart(Symbol::new(1), LockMode::DirtyRead).await?;
    for candle in &chart.candles {
        assert_eq!(candle.amount(), 240);
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_instruments_settle_independently() -> Result<()> {
    let service = service(None).await?;
    for id in 1..=4 {
        service
            .list_instrument(instrument(id), Px::from_units(100), &[IntervalType::Minute])
            .await?;
    }

    let mut join_set = JoinSet::new();
    for id in 1..=4u32 {
        let service = Arc::clone(&service);
        join_set.spawn(async move {
            for i in 0..100 {
                let px = Px::from_units(i64::from(id) * 100 + i64::from(i % 3));
                service.settle_trade(Fill::new(Symbol::new(id), px, 1)).await?;
            }
            Ok::<_, anyhow::Error>(())
        });
    }
    while let Some(result) = join_set.join_next().await {
        result??;
    }

    for id in 1..=4u32 {
        let chart = service.chart(Symbol::new(id), LockMode::DirtyRead).await?;
        let candle = &chart.candles[0];
        assert_eq!(candle.amount(), 100);
        assert_eq!(candle.price_low(), Px::from_units(i64::from(id) * 100));
        assert_eq!(candle.price_high(), Px::from_units(i64::from(id) * 100 + 2));
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_rollover_races_fills_without_tearing() -> Result<()> {
    let service = service(None).await?;
    service
        .list_instrument(instrument(1), Px::from_units(100), &[IntervalType::Minute])
        .await?;

    let mut join_set = JoinSet::new();
    for producer in 0..4u32 {
        let service = Arc::clone(&service);
        join_set.spawn(async move {
            for i in 0..100 {
                service
                    .settle_trade(Fill::new(Symbol::new(1), price(producer, i), 1))
                    .await?;
            }
            Ok::<_, anyhow::Error>(())
        });
    }

    let roller = {
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            let mut snapshots: Vec<Candle> = Vec::new();
            for _ in 0..50 {
                snapshots.push(service.roll_candle(Symbol::new(1), IntervalType::Minute).await?);
                tokio::task::yield_now().await;
            }
            Ok::<_, anyhow::Error>(snapshots)
        })
    };

    while let Some(result) = join_set.join_next().await {
        result??;
    }
    let rolled = roller.await??;

    // Every rollover saw a consistent row
    for candle in &rolled {
        assert!(!candle.is_open());
        assert_eq!(candle.price_end(), candle.price_before);
        Candle::try_from(CandleRow::from(candle))?;
    }

    let chart = service.chart(Symbol::new(1), LockMode::DirtyRead).await?;
    let last = &chart.candles[0];
    Candle::try_from(CandleRow::from(last))?;
    assert!(last.amount() <= 400);

    let final_roll = service.roll_candle(Symbol::new(1), IntervalType::Minute).await?;
    assert_eq!(final_roll.price_before, last.price_end());
    assert_eq!(final_roll.amount(), 0);
    Ok(())
}
