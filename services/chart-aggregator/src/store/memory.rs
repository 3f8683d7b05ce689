//! In-process candle store with per-row locks and WAL durability
//!
//! Rows live behind their own `tokio::sync::RwLock`, so writers on different
//! candles never contend. Each row also keeps a copy of its last committed
//! state that dirty and optimistic reads take without touching the row lock.
//! Every commit is appended to the WAL before the rows change in memory;
//! [`MemoryCandleStore::open`] rebuilds the rows by replay.
//!
//! Lock order: index, then rows in ascending id, then journal, then the
//! committed snapshots. Row writers never touch the index while holding a
//! row.

use super::{CandleFilter, CandleRepository, LockMode, LockedCandle};
use crate::candle::{Candle, CandleId, CandleKey, CandleRow, Instrument};
use crate::error::{ChartError, ChartResult};
use crate::storage::{CandleEvent, ChartEvent, InstrumentEvent, Wal};
use async_trait::async_trait;
use parking_lot::Mutex as SnapshotLock;
use rustc_hash::FxHashMap;
use services_common::constants::memory::{DEFAULT_WAL_SEGMENT_SIZE_MB, MB, WAL_REPLAY_BATCH_SIZE};
use services_common::{Px, Symbol, Ts};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, info, warn};

/// Default wait for a row lock before giving up
const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Store construction options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreOptions {
    /// WAL directory; `None` keeps the store memory-only
    pub wal_dir: Option<PathBuf>,
    /// WAL segment size in bytes
    pub segment_size: u64,
    /// fsync every commit
    pub sync_on_commit: bool,
    /// Longest wait for a row lock
    pub lock_timeout: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            wal_dir: None,
            segment_size: DEFAULT_WAL_SEGMENT_SIZE_MB * MB,
            sync_on_commit: true,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }
}

/// What a WAL replay restored
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Events replayed
    pub events: u64,
    /// Instruments restored
    pub instruments: usize,
    /// Candles restored
    pub candles: usize,
}

/// Committed row plus its version counter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredRow {
    row: CandleRow,
    version: u64,
}

type RowCell = Arc<RwLock<StoredRow>>;

/// Last committed state of a row; only written under the exclusive row lock
type CommittedRow = Arc<SnapshotLock<StoredRow>>;

/// Lock held by a [`LockedCandle`] from this store
#[derive(Debug)]
pub enum MemoryGuard {
    /// Nothing held (dirty or optimistic reads)
    Unlocked(RowCell, CommittedRow),
    /// Shared row lock
    Shared(OwnedRwLockReadGuard<StoredRow>),
    /// Exclusive row lock
    Exclusive(OwnedRwLockWriteGuard<StoredRow>, CommittedRow),
}

#[derive(Debug, Clone)]
struct RowSlot {
    key: CandleKey,
    cell: RowCell,
    committed: CommittedRow,
}

#[derive(Debug, Default)]
struct Index {
    rows: BTreeMap<CandleId, RowSlot>,
    by_key: FxHashMap<CandleKey, CandleId>,
    instruments: FxHashMap<Symbol, Instrument>,
    next_id: u64,
}

impl Index {
    fn insert_row(&mut self, row: CandleRow, key: CandleKey, version: u64) {
        let id = row.chart_id;
        let stored = StoredRow { row, version };
        match self.rows.get(&id) {
            Some(slot) => {
                // Replay only; no other holders exist yet
                if let Ok(mut current) = slot.cell.try_write() {
                    *current = stored;
                    *slot.committed.lock() = stored;
                }
            }
            None => {
                self.rows.insert(
                    id,
                    RowSlot {
                        key,
                        cell: Arc::new(RwLock::new(stored)),
                        committed: Arc::new(SnapshotLock::new(stored)),
                    },
                );
            }
        }
        self.by_key.insert(key, id);
        self.next_id = self.next_id.max(id.0 + 1);
    }
}

/// Candle store keeping rows in memory and journaling to a WAL
#[derive(Debug)]
pub struct MemoryCandleStore {
    index: RwLock<Index>,
    wal: Option<Mutex<Wal>>,
    lock_timeout: Duration,
}

impl MemoryCandleStore {
    /// Memory-only store
    #[must_use]
    pub fn in_memory(lock_timeout: Duration) -> Self {
        Self {
            index: RwLock::new(Index {
                next_id: 1,
                ..Index::default()
            }),
            wal: None,
            lock_timeout,
        }
    }

    /// Open the store, replaying the WAL when one is configured
    pub async fn open(options: StoreOptions) -> ChartResult<(Self, RecoveryReport)> {
        let Some(dir) = &options.wal_dir else {
            return Ok((Self::in_memory(options.lock_timeout), RecoveryReport::default()));
        };

        let wal = Wal::new(dir, Some(options.segment_size), options.sync_on_commit)?;
        let mut index = Index {
            next_id: 1,
            ..Index::default()
        };
        let mut events = 0u64;

        let mut iterator = wal.stream::<ChartEvent>(None)?;
        while let Some(event) = iterator.read_next_entry()? {
            match event {
                ChartEvent::InstrumentListed(e) => {
                    index.instruments.insert(e.instrument.id, e.instrument);
                }
                ChartEvent::CandleCreated(e) | ChartEvent::CandleUpdated(e) => {
                    let candle = Candle::try_from(e.row)?;
                    index.insert_row(e.row, candle.key(), e.version);
                }
            }
            events += 1;

            if events % WAL_REPLAY_BATCH_SIZE == 0 {
                tokio::task::yield_now().await;
            }
        }

        let report = RecoveryReport {
            events,
            instruments: index.instruments.len(),
            candles: index.rows.len(),
        };
        info!(
            "Recovered {} candles for {} instruments from {} WAL events at {}",
            report.candles,
            report.instruments,
            report.events,
            dir.display()
        );

        let store = Self {
            index: RwLock::new(index),
            wal: Some(Mutex::new(wal)),
            lock_timeout: options.lock_timeout,
        };
        Ok((store, report))
    }

    /// Instrument metadata, if registered
    pub async fn instrument(&self, id: Symbol) -> Option<Instrument> {
        self.index.read().await.instruments.get(&id).cloned()
    }

    /// Rewrite the WAL as a snapshot of the current rows and drop the
    /// segments it supersedes. Returns the number of segments removed.
    pub async fn checkpoint(&self) -> ChartResult<u64> {
        let Some(wal) = &self.wal else {
            return Ok(0);
        };

        let index = self.index.read().await;
        let ts = Ts::now();

        let mut instruments: Vec<&Instrument> = index.instruments.values().collect();
        instruments.sort_by_key(|instrument| instrument.id);
        let mut events: Vec<ChartEvent> = instruments
            .into_iter()
            .map(|instrument| {
                ChartEvent::InstrumentListed(InstrumentEvent {
                    ts,
                    instrument: instrument.clone(),
                })
            })
            .collect();

        // Shared locks keep every row still until the snapshot is durable
        let mut guards = Vec::with_capacity(index.rows.len());
        for (id, slot) in &index.rows {
            let guard = self.acquire_read(*id, Arc::clone(&slot.cell)).await?;
            events.push(ChartEvent::CandleCreated(CandleEvent {
                ts,
                version: guard.version,
                row: guard.row,
            }));
            guards.push(guard);
        }

        let mut wal = wal.lock().await;
        let first = wal.rotate()?;
        wal.append_batch(&events)?;
        let removed = wal.remove_segments_before(first)?;

        info!(
            "Checkpointed {} candles into segment {}, removed {} segments",
            guards.len(),
            first,
            removed
        );
        Ok(removed)
    }

    async fn journal(&self, event: ChartEvent) -> ChartResult<()> {
        self.journal_batch(std::slice::from_ref(&event)).await
    }

    /// Append `events` with one commit; all of them are durable or none
    async fn journal_batch(&self, events: &[ChartEvent]) -> ChartResult<()> {
        if let Some(wal) = &self.wal {
            wal.lock().await.append_batch(events)?;
        }
        Ok(())
    }

    fn waited_ms(started: Instant) -> u64 {
        u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    async fn acquire_read(&self, id: CandleId, cell: RowCell) -> ChartResult<OwnedRwLockReadGuard<StoredRow>> {
        let started = Instant::now();
        tokio::time::timeout(self.lock_timeout, cell.read_owned())
            .await
            .map_err(|_| {
                warn!("Shared lock on {} timed out", id);
                ChartError::LockTimeout {
                    candle: id,
                    waited_ms: Self::waited_ms(started),
                }
            })
    }

    async fn acquire_write(&self, id: CandleId, cell: RowCell) -> ChartResult<OwnedRwLockWriteGuard<StoredRow>> {
        let started = Instant::now();
        tokio::time::timeout(self.lock_timeout, cell.write_owned())
            .await
            .map_err(|_| {
                warn!("Exclusive lock on {} timed out", id);
                ChartError::LockTimeout {
                    candle: id,
                    waited_ms: Self::waited_ms(started),
                }
            })
    }

    async fn lock_slot(
        &self,
        id: CandleId,
        slot: RowSlot,
        instrument: Instrument,
        mode: LockMode,
    ) -> ChartResult<LockedCandle<MemoryGuard>> {
        let (stored, guard) = match mode {
            LockMode::DirtyRead | LockMode::Optimistic => {
                let stored = *slot.committed.lock();
                (stored, MemoryGuard::Unlocked(slot.cell, slot.committed))
            }
            LockMode::PessimisticRead => {
                let guard = self.acquire_read(id, slot.cell).await?;
                (*guard, MemoryGuard::Shared(guard))
            }
            LockMode::PessimisticWrite => {
                let guard = self.acquire_write(id, slot.cell).await?;
                (*guard, MemoryGuard::Exclusive(guard, slot.committed))
            }
            LockMode::PessimisticWriteOrFail => {
                let guard = slot
                    .cell
                    .try_write_owned()
                    .map_err(|_| ChartError::LockContention { candle: id })?;
                (*guard, MemoryGuard::Exclusive(guard, slot.committed))
            }
        };

        debug!("Read {} under {} at version {}", id, mode, stored.version);
        Ok(LockedCandle {
            candle: Candle::try_from(stored.row)?,
            instrument,
            mode,
            version: stored.version,
            guard,
        })
    }
}

#[async_trait]
impl CandleRepository for MemoryCandleStore {
    type Guard = MemoryGuard;

    async fn register_instrument(&self, instrument: Instrument) -> ChartResult<()> {
        let mut index = self.index.write().await;
        if index.instruments.contains_key(&instrument.id) {
            return Err(ChartError::AlreadyExists {
                what: format!("instrument {}", instrument.id),
            });
        }

        self.journal(ChartEvent::InstrumentListed(InstrumentEvent {
            ts: Ts::now(),
            instrument: instrument.clone(),
        }))
        .await?;

        info!("Listed instrument {} ({} {})", instrument.id, instrument.code, instrument.name);
        index.instruments.insert(instrument.id, instrument);
        Ok(())
    }

    async fn create_candle(&self, key: CandleKey, price_before: Px) -> ChartResult<Candle> {
        if !price_before.is_positive() {
            return Err(ChartError::validation(format!(
                "listing price must be positive, got {price_before}"
            )));
        }

        let mut index = self.index.write().await;
        if !index.instruments.contains_key(&key.instrument) {
            return Err(ChartError::NotFound {
                instrument: key.instrument,
                interval: None,
            });
        }
        if index.by_key.contains_key(&key) {
            return Err(ChartError::AlreadyExists {
                what: format!("{} candle for {}", key.interval, key.instrument),
            });
        }

        let candle = Candle::unopened(CandleId::new(index.next_id), key.instrument, key.interval, price_before);
        let row = CandleRow::from(&candle);
        self.journal(ChartEvent::CandleCreated(CandleEvent {
            ts: Ts::now(),
            version: 1,
            row,
        }))
        .await?;

        index.insert_row(row, key, 1);
        debug!("Created {} for {} {}", candle.id, key.instrument, key.interval);
        Ok(candle)
    }

    async fn candle_keys(&self, filter: CandleFilter) -> ChartResult<Vec<CandleKey>> {
        let index = self.index.read().await;
        Ok(index
            .rows
            .values()
            .filter(|slot| filter.matches(&slot.key))
            .map(|slot| slot.key)
            .collect())
    }

    async fn find(&self, filter: CandleFilter, mode: LockMode) -> ChartResult<Vec<LockedCandle<MemoryGuard>>> {
        let selected: Vec<(CandleId, RowSlot, Instrument)> = {
            let index = self.index.read().await;
            index
                .rows
                .iter()
                .filter(|(_, slot)| filter.matches(&slot.key))
                .filter_map(|(id, slot)| {
                    let instrument = index.instruments.get(&slot.key.instrument)?.clone();
                    Some((*id, slot.clone(), instrument))
                })
                .collect()
        };

        // BTreeMap iteration already yields ascending ids
        let mut handles = Vec::with_capacity(selected.len());
        for (id, slot, instrument) in selected {
            handles.push(self.lock_slot(id, slot, instrument, mode).await?);
        }
        Ok(handles)
    }

    async fn find_one(&self, key: CandleKey, mode: LockMode) -> ChartResult<LockedCandle<MemoryGuard>> {
        let not_found = || ChartError::NotFound {
            instrument: key.instrument,
            interval: Some(key.interval),
        };

        let (id, slot, instrument) = {
            let index = self.index.read().await;
            let id = *index.by_key.get(&key).ok_or_else(not_found)?;
            let slot = index.rows.get(&id).cloned().ok_or_else(not_found)?;
            let instrument = index.instruments.get(&key.instrument).cloned().ok_or_else(not_found)?;
            (id, slot, instrument)
        };

        self.lock_slot(id, slot, instrument, mode).await
    }

    async fn persist_all(&self, handles: &mut [LockedCandle<MemoryGuard>], candles: &[Candle]) -> ChartResult<()> {
        if handles.len() != candles.len() {
            return Err(ChartError::validation(format!(
                "{} candles given for {} handles",
                candles.len(),
                handles.len()
            )));
        }
        for (handle, candle) in handles.iter().zip(candles) {
            let held = handle.candle.id;
            if candle.id != held || candle.key() != handle.candle.key() {
                return Err(ChartError::IdentityMismatch { held, given: candle.id });
            }
            if !handle.mode.is_writable() || matches!(handle.guard, MemoryGuard::Shared(_)) {
                return Err(ChartError::ReadOnlyLock { candle: held });
            }
        }
        if handles.windows(2).any(|pair| pair[0].candle.id >= pair[1].candle.id) {
            return Err(ChartError::validation("handles must be in ascending candle id order"));
        }

        // Optimistic handles hold the row lock only while committing
        let mut acquired = Vec::with_capacity(handles.len());
        for handle in handles.iter() {
            acquired.push(match &handle.guard {
                MemoryGuard::Unlocked(cell, _) => {
                    let held = handle.candle.id;
                    let guard = self.acquire_write(held, Arc::clone(cell)).await?;
                    if guard.version != handle.version {
                        return Err(ChartError::Conflict {
                            candle: held,
                            expected: handle.version,
                            found: guard.version,
                        });
                    }
                    Some(guard)
                }
                _ => None,
            });
        }

        let mut targets = Vec::with_capacity(handles.len());
        for (handle, acquired) in handles.iter_mut().zip(acquired.iter_mut()) {
            targets.push(match (&mut handle.guard, acquired) {
                (MemoryGuard::Exclusive(guard, committed), _) => (&mut **guard, &*committed),
                (MemoryGuard::Unlocked(_, committed), Some(guard)) => (&mut **guard, &*committed),
                _ => return Err(ChartError::ReadOnlyLock { candle: handle.candle.id }),
            });
        }

        // Every row is validated before anything reaches the journal
        let ts = Ts::now();
        let mut next = Vec::with_capacity(targets.len());
        let mut events = Vec::with_capacity(targets.len());
        for ((stored, _), candle) in targets.iter().zip(candles) {
            let mut row = stored.row;
            row.assign_mutable(candle);
            Candle::try_from(row)?;

            let version = stored.version + 1;
            events.push(ChartEvent::CandleUpdated(CandleEvent { ts, version, row }));
            next.push(StoredRow { row, version });
        }
        self.journal_batch(&events).await?;

        for ((stored, committed), row) in targets.into_iter().zip(&next) {
            *stored = *row;
            *committed.lock() = *row;
        }
        for ((handle, candle), row) in handles.iter_mut().zip(candles).zip(&next) {
            handle.candle = candle.clone();
            handle.version = row.version;
        }
        Ok(())
    }
}
