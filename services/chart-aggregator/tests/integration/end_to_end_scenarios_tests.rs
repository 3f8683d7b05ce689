//! End-to-end trading day scenarios through the service, scheduler and WAL

use anyhow::Result;
use chart_aggregator::{
    AggregatorConfig, ChartError, ChartMetrics, ChartService, Fill, Instrument, IntervalScheduler, IntervalType,
    LockMode, MemoryCandleStore,
};
use pretty_assertions::assert_eq;
use services_common::{Notional, Px, Symbol, Ts};
use std::sync::Arc;
use tempfile::TempDir;

fn samsung() -> Instrument {
    Instrument {
        id: Symbol::new(5930),
        code: "005930".to_string(),
        name: "Samsung Electronics".to_string(),
    }
}

fn config(dir: &TempDir) -> AggregatorConfig {
    AggregatorConfig {
        wal_dir: Some(dir.path().to_path_buf()),
        segment_size_mb: 1,
        sync_on_commit: false,
        intervals: vec![IntervalType::Minute, IntervalType::Hour],
        ..AggregatorConfig::default()
    }
}

async fn start(config: &AggregatorConfig) -> Result<ChartService<MemoryCandleStore>> {
    let (store, _) = MemoryCandleStore::open(config.store_options()).await?;
    Ok(ChartService::new(Arc::new(store)).with_metrics(ChartMetrics::new()?))
}

#[tokio::test]
async fn test_trading_day_with_scheduled_rollover() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let config = config(&temp_dir);
    let service = start(&config).await?;
    let symbol = samsung().id;

    service
        .list_instrument(samsung(), Px::from_units(100), &config.intervals)
        .await?;

    // 09:00:10 and 09:00:40, inside the first minute
    let open = Ts::from_secs(9 * 3600);
    let mut scheduler = IntervalScheduler::new(&config.intervals, Ts::from_secs(9 * 3600 + 10));
    service.settle_trade(Fill::new(symbol, Px::from_units(105), 3)).await?;
    service.settle_trade(Fill::new(symbol, Px::from_units(95), 2)).await?;
    assert!(scheduler.tick(Ts::from_secs(9 * 3600 + 40)).is_empty());

    // 09:01:00 closes the minute but not the hour
    let due = scheduler.tick(Ts::from_secs(open.as_secs() + 60));
    assert_eq!(due.len(), 1);
    for rollover in due {
        let outcome = service.roll_interval_type(rollover.interval).await?;
        assert_eq!(outcome.rolled, 1);
        assert!(outcome.is_complete());
    }

    let chart = service.chart(symbol, LockMode::PessimisticRead).await?;
    let minute = &chart.candles[0];
    let hour = &chart.candles[1];

    assert_eq!(minute.price_before, Px::from_units(95));
    assert_eq!(minute.price_start(), Px::from_units(95));
    assert_eq!(minute.price_high(), Px::from_units(95));
    assert_eq!(minute.price_low(), Px::from_units(95));
    assert_eq!(minute.amount(), 0);
    assert_eq!(minute.volume(), Notional::ZERO);

    assert_eq!(hour.price_start(), Px::from_units(105));
    assert_eq!(hour.price_high(), Px::from_units(105));
    assert_eq!(hour.price_low(), Px::from_units(95));
    assert_eq!(hour.price_end(), Px::from_units(95));
    assert_eq!(hour.amount(), 5);
    assert_eq!(hour.volume(), Notional::from_raw(5_050_000));
    assert_eq!(hour.change_bp(), -500);

    let metrics = service.metrics().map(ChartMetrics::render).transpose()?.unwrap_or_default();
    assert!(metrics.contains("chart_fills_applied_total 2"));
    assert!(metrics.contains("chart_rollovers_total{interval=\"1m\"} 1"));
    Ok(())
}

#[tokio::test]
async fn test_restart_resumes_where_it_stopped() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let config = config(&temp_dir);
    let symbol = samsung().id;

    {
        let service = start(&config).await?;
        service
            .list_instrument(samsung(), Px::from_units(100), &config.intervals)
            .await?;
        service.settle_trade(Fill::new(symbol, Px::from_units(102), 10)).await?;
    }

    let service = start(&config).await?;
    let relisted = service
        .list_instrument(samsung(), Px::from_units(100), &config.intervals)
        .await;
    assert!(matches!(relisted, Err(ChartError::AlreadyExists { .. })));

    service.settle_trade(Fill::new(symbol, Px::from_units(104), 5)).await?;
    let chart = service.chart(symbol, LockMode::DirtyRead).await?;
    for candle in &chart.candles {
        assert_eq!(candle.price_start(), Px::from_units(102));
        assert_eq!(candle.price_end(), Px::from_units(104));
        assert_eq!(candle.amount(), 15);
    }
    Ok(())
}

#[tokio::test]
async fn test_rejected_fills_leave_rows_untouched() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let config = config(&temp_dir);
    let service = start(&config).await?;
    let symbol = samsung().id;

    service
        .list_instrument(samsung(), Px::from_units(100), &config.intervals)
        .await?;
    let before = service.chart(symbol, LockMode::DirtyRead).await?;

    for fill in [
        Fill::new(symbol, Px::ZERO, 1),
        Fill::new(symbol, Px::from_units(-5), 1),
        Fill::new(symbol, Px::from_units(100), 0),
        Fill::new(symbol, Px::from_units(100), -1),
    ] {
        let result = service.settle_trade(fill).await;
        assert!(matches!(result, Err(ChartError::Validation { .. })));
    }

    let unknown = service
        .settle_trade(Fill::new(Symbol::new(1), Px::from_units(100), 1))
        .await;
    assert!(matches!(unknown, Err(ChartError::NotFound { .. })));

    assert_eq!(service.chart(symbol, LockMode::DirtyRead).await?, before);

    let metrics = service.metrics().map(ChartMetrics::render).transpose()?.unwrap_or_default();
    assert!(metrics.contains("chart_fills_rejected_total{kind=\"validation\"} 4"));
    assert!(metrics.contains("chart_fills_rejected_total{kind=\"not_found\"} 1"));
    Ok(())
}
