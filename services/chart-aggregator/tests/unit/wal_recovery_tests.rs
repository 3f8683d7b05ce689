//! WAL durability of the candle store across restarts

use anyhow::Result;
use chart_aggregator::store::CandleRepository;
use chart_aggregator::{
    CandleKey, ChartError, ChartService, Fill, Instrument, IntervalType, LockMode, MemoryCandleStore, StoreOptions, Wal,
};
use rstest::rstest;
use services_common::{Px, Symbol};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn options(dir: &Path) -> StoreOptions {
    StoreOptions {
        wal_dir: Some(dir.to_path_buf()),
        segment_size: 1024 * 1024,
        sync_on_commit: false,
        lock_timeout: Duration::from_millis(100),
    }
}

fn instrument(id: u32) -> Instrument {
    Instrument {
        id: Symbol::new(id),
        code: format!("{id:06}"),
        name: format!("Instrument {id}"),
    }
}

fn segments(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "wal"))
        .collect();
    paths.sort();
    Ok(paths)
}

async fn populate(dir: &Path) -> Result<()> {
    let (store, _) = MemoryCandleStore::open(options(dir)).await?;
    let service = ChartService::new(Arc::new(store));
    service
        .list_instrument(instrument(1), Px::from_units(100), &[IntervalType::Minute, IntervalType::Day])
        .await?;
    service.settle_trade(Fill::new(Symbol::new(1), Px::from_units(105), 3)).await?;
    service.settle_trade(Fill::new(Symbol::new(1), Px::from_units(95), 2)).await?;
    service.roll_candle(Symbol::new(1), IntervalType::Minute).await?;
    Ok(())
}

#[tokio::test]
async fn test_restart_restores_settled_state() -> Result<()> {
    let temp_dir = TempDir::new()?;
    populate(temp_dir.path()).await?;

    let (store, report) = MemoryCandleStore::open(options(temp_dir.path())).await?;
    // listed + 2 created + 2 fills on 2 rows + 1 roll
    assert_eq!(report.events, 8);
    assert_eq!(report.candles, 2);

    let service = ChartService::new(Arc::new(store));
    let chart = service.chart(Symbol::new(1), LockMode::DirtyRead).await?;
    assert_eq!(chart.instrument, instrument(1));

    let minute = &chart.candles[0];
    assert!(!minute.is_open());
    assert_eq!(minute.price_before, Px::from_units(95));

    let day = &chart.candles[1];
    assert_eq!(day.amount(), 5);
    assert_eq!(day.price_high(), Px::from_units(105));
    assert_eq!(day.price_low(), Px::from_units(95));

    // Recovered rows keep accepting fills
    service.settle_trade(Fill::new(Symbol::new(1), Px::from_units(99), 1)).await?;
    Ok(())
}

#[tokio::test]
async fn test_recovered_duplicates_rejected() -> Result<()> {
    let temp_dir = TempDir::new()?;
    populate(temp_dir.path()).await?;

    let (store, _) = MemoryCandleStore::open(options(temp_dir.path())).await?;
    let again = store.register_instrument(instrument(1)).await;
    assert!(matches!(again, Err(ChartError::AlreadyExists { .. })));
    Ok(())
}

#[tokio::test]
async fn test_torn_tail_is_dropped() -> Result<()> {
    let temp_dir = TempDir::new()?;
    populate(temp_dir.path()).await?;

    let paths = segments(temp_dir.path())?;
    let last = paths.last().ok_or_else(|| anyhow::anyhow!("no segments written"))?;
    {
        let mut file = OpenOptions::new().append(true).open(last)?;
        // Length prefix promising more bytes than follow
        file.write_all(&512u32.to_le_bytes())?;
        file.write_all(&[0xAB; 6])?;
    }

    let (_, report) = MemoryCandleStore::open(options(temp_dir.path())).await?;
    assert_eq!(report.events, 8);
    Ok(())
}

#[rstest]
#[case::empty(0)]
#[case::half_header(8)]
#[tokio::test]
async fn test_segment_cut_inside_header_is_skipped(#[case] header_bytes: usize) -> Result<()> {
    let temp_dir = TempDir::new()?;
    populate(temp_dir.path()).await?;

    // What a crash between creating a segment and flushing its header leaves
    let magic_and_version = [0x4C, 0x52, 0x48, 0x43, 0x01, 0x00, 0x00, 0x00];
    fs::write(
        temp_dir.path().join("0000000099.wal"),
        &magic_and_version[..header_bytes],
    )?;

    {
        let (store, report) = MemoryCandleStore::open(options(temp_dir.path())).await?;
        assert_eq!(report.events, 8);
        let service = ChartService::new(Arc::new(store));
        service.settle_trade(Fill::new(Symbol::new(1), Px::from_units(99), 1)).await?;
    }

    // The fill after the skipped segment survives the next restart too
    let (store, report) = MemoryCandleStore::open(options(temp_dir.path())).await?;
    assert_eq!(report.events, 10);
    let day = store
        .find_one(
            CandleKey {
                instrument: Symbol::new(1),
                interval: IntervalType::Day,
            },
            LockMode::DirtyRead,
        )
        .await?;
    assert_eq!(day.candle().amount(), 6);
    Ok(())
}

#[tokio::test]
async fn test_corrupt_record_fails_recovery() -> Result<()> {
    let temp_dir = TempDir::new()?;
    populate(temp_dir.path()).await?;

    let paths = segments(temp_dir.path())?;
    let first = paths.first().ok_or_else(|| anyhow::anyhow!("no segments written"))?;
    let mut bytes = fs::read(first)?;
    // Flip a payload byte of the first record (16-byte header + 8-byte record header)
    bytes[24] ^= 0xFF;
    fs::write(first, bytes)?;

    let result = MemoryCandleStore::open(options(temp_dir.path())).await;
    assert!(matches!(result, Err(ChartError::Storage(_))));
    Ok(())
}

#[tokio::test]
async fn test_checkpoint_compacts_history() -> Result<()> {
    let temp_dir = TempDir::new()?;
    populate(temp_dir.path()).await?;

    let (store, _) = MemoryCandleStore::open(options(temp_dir.path())).await?;
    store.checkpoint().await?;
    drop(store);

    let stats = Wal::new(temp_dir.path(), None, false)?.stats()?;
    assert_eq!(stats.segment_count, 1);
    // listed + one snapshot row per candle
    assert_eq!(stats.total_entries, 3);

    let (store, report) = MemoryCandleStore::open(options(temp_dir.path())).await?;
    assert_eq!(report.candles, 2);
    let day = store
        .find_one(
            CandleKey {
                instrument: Symbol::new(1),
                interval: IntervalType::Day,
            },
            LockMode::DirtyRead,
        )
        .await?;
    assert_eq!(day.candle().amount(), 5);
    // Versions survive compaction
    assert_eq!(day.version(), 3);
    Ok(())
}
