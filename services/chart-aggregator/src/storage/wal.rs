//! Write-Ahead Log for the candle store
//!
//! Each store commit appends its records and commits them before the in-memory
//! rows change, so a crash never exposes a mutation that replay would lose.
//! A batch lands in one segment or not at all: after a failed write the
//! segment is cut back to its last commit and the next batch starts a new one.

use anyhow::{Result, anyhow};
use serde::{Serialize, de::DeserializeOwned};
use services_common::Ts;
use services_common::constants::memory::{DEFAULT_WAL_SEGMENT_SIZE_MB, MB};
use std::fs;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use super::segment::{Segment, SegmentReader, batch_size};

/// WAL entry trait for journaled events
pub trait WalEntry: Serialize + DeserializeOwned + Send + Sync {
    /// Get the timestamp of the entry
    fn timestamp(&self) -> Ts;
}

/// Segmented write-ahead log
pub struct Wal {
    dir: PathBuf,
    segment_size: u64,
    sync_on_commit: bool,
    current_segment: Option<Segment>,
    segment_counter: u64,
}

impl Wal {
    /// Open (or create) a WAL in `dir`. New records always go to a fresh
    /// segment so a possibly torn tail of the previous run is never extended.
    pub fn new(dir: &Path, segment_size: Option<u64>, sync_on_commit: bool) -> Result<Self> {
        if !dir.exists() {
            fs::create_dir_all(dir)?;
        }

        let segment_size = segment_size.unwrap_or(DEFAULT_WAL_SEGMENT_SIZE_MB * MB);
        let segment_counter = Self::find_latest_segment(dir)?;

        info!(
            "Initialized WAL at {} with segment size {} MB (sync_on_commit={})",
            dir.display(),
            segment_size / MB,
            sync_on_commit
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            segment_size,
            sync_on_commit,
            current_segment: None,
            segment_counter,
        })
    }

    /// Append and commit one entry
    pub fn append<T: WalEntry>(&mut self, entry: &T) -> Result<()> {
        self.append_batch(std::slice::from_ref(entry))
    }

    /// Append several entries with a single commit at the end
    pub fn append_batch<T: WalEntry>(&mut self, entries: &[T]) -> Result<()> {
        let records = entries
            .iter()
            .map(bincode::serialize)
            .collect::<bincode::Result<Vec<_>>>()?;
        if records.is_empty() {
            return Ok(());
        }

        let bytes = batch_size(&records);
        if self.current_segment.as_ref().is_none_or(|s| !s.has_room(bytes)) {
            self.rotate()?;
        }

        let sync = self.sync_on_commit;
        let segment = self
            .current_segment
            .as_mut()
            .ok_or_else(|| anyhow!("Failed to create segment"))?;
        if let Err(e) = segment.append_batch(&records).and_then(|()| segment.commit(sync)) {
            self.abandon_segment();
            return Err(e);
        }
        Ok(())
    }

    /// Give up on the current segment after a failed write, keeping only
    /// what it had committed
    fn abandon_segment(&mut self) {
        let Some(segment) = self.current_segment.take() else {
            return;
        };
        let path = segment.path().to_path_buf();
        match segment.discard() {
            Ok(kept) => warn!(
                "Write to {} failed, truncated it back to {} committed entries",
                path.display(),
                kept
            ),
            Err(e) => error!("Write to {} failed and truncating it failed too: {}", path.display(), e),
        }
    }

    /// Create an iterator to stream entries in append order, skipping
    /// entries older than `from_ts`
    pub fn stream<T: WalEntry>(&self, from_ts: Option<Ts>) -> Result<WalIterator<T>> {
        WalIterator::new(&self.dir, from_ts)
    }

    /// Read every entry in append order
    pub fn read_all<T: WalEntry>(&self) -> Result<Vec<T>> {
        let mut iterator = self.stream::<T>(None)?;
        let mut entries = Vec::new();
        while let Some(entry) = iterator.read_next_entry()? {
            entries.push(entry);
        }
        debug!("Read {} entries from WAL", entries.len());
        Ok(entries)
    }

    /// Close the current segment and start a new one, returning its number
    pub fn rotate(&mut self) -> Result<u64> {
        if let Some(segment) = self.current_segment.take() {
            segment.close()?;
        }

        self.segment_counter += 1;
        let segment_path = self.segment_path(self.segment_counter);
        self.current_segment = Some(Segment::create(&segment_path, self.segment_size)?);

        debug!("Rotated to new segment: {}", segment_path.display());
        Ok(self.segment_counter)
    }

    /// Delete every segment numbered below `counter`
    pub fn remove_segments_before(&mut self, counter: u64) -> Result<u64> {
        let mut removed = 0;
        for segment_path in Self::list_segments(&self.dir)? {
            if Self::segment_number(&segment_path).is_some_and(|n| n < counter) {
                fs::remove_file(&segment_path)?;
                removed += 1;
                debug!("Removed segment: {}", segment_path.display());
            }
        }
        Ok(removed)
    }

    /// Get statistics about the WAL
    pub fn stats(&self) -> Result<WalStats> {
        let segments = Self::list_segments(&self.dir)?;
        // SAFETY: usize to u64 widening conversion is always safe
        let segment_count = segments.len() as u64;

        let mut total_size = 0;
        let mut total_entries = 0;

        for segment_path in segments {
            total_size += fs::metadata(&segment_path)?.len();

            let Some(mut reader) = Segment::open(&segment_path)? else {
                continue;
            };
            while reader.read_next()?.is_some() {}
            total_entries += reader.records_read();
        }

        Ok(WalStats {
            segment_count,
            total_size,
            total_entries,
            current_segment_size: self.current_segment.as_ref().map(Segment::size),
        })
    }

    /// Check WAL health status
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        if !self.dir.exists() || Self::list_segments(&self.dir).is_err() {
            return false;
        }
        self.current_segment
            .as_ref()
            .is_none_or(|segment| segment.size() <= self.segment_size)
    }

    /// WAL directory
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Arm a failure for the next commit of the current segment
    #[cfg(test)]
    pub(crate) fn fail_next_commit(&mut self) -> Result<()> {
        if self.current_segment.is_none() {
            self.rotate()?;
        }
        if let Some(segment) = &mut self.current_segment {
            segment.fail_next_commit();
        }
        Ok(())
    }

    fn segment_path(&self, counter: u64) -> PathBuf {
        self.dir.join(format!("{counter:010}.wal"))
    }

    fn segment_number(path: &Path) -> Option<u64> {
        path.file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u64>().ok())
    }

    fn find_latest_segment(dir: &Path) -> Result<u64> {
        Ok(Self::list_segments(dir)?
            .iter()
            .filter_map(|path| Self::segment_number(path))
            .max()
            .unwrap_or(0))
    }

    fn list_segments(dir: &Path) -> Result<Vec<PathBuf>> {
        let mut segments: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(Result::ok)
            .filter(|entry| entry.path().extension().and_then(|s| s.to_str()) == Some("wal"))
            .map(|entry| entry.path())
            .collect();

        segments.sort();
        Ok(segments)
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        if let Some(segment) = self.current_segment.take() {
            if let Err(e) = segment.close() {
                tracing::warn!("Failed to close segment on WAL drop: {}", e);
            }
        }
    }
}

impl std::fmt::Debug for Wal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wal")
            .field("dir", &self.dir)
            .field("segment_size", &self.segment_size)
            .field("sync_on_commit", &self.sync_on_commit)
            .field("current_segment", &self.current_segment.as_ref().map(|_| "<Segment>"))
            .field("segment_counter", &self.segment_counter)
            .finish()
    }
}

/// Statistics about the WAL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalStats {
    /// Number of segments
    pub segment_count: u64,
    /// Total size in bytes
    pub total_size: u64,
    /// Total number of readable entries
    pub total_entries: u64,
    /// Size of the segment currently appended to
    pub current_segment_size: Option<u64>,
}

/// Iterator for reading WAL entries across segments
pub struct WalIterator<T: WalEntry> {
    segments: Vec<PathBuf>,
    current_reader: Option<SegmentReader>,
    current_index: usize,
    from_ts: Option<Ts>,
    _phantom: PhantomData<T>,
}

impl<T: WalEntry> WalIterator<T> {
    fn new(dir: &Path, from_ts: Option<Ts>) -> Result<Self> {
        Ok(Self {
            segments: Wal::list_segments(dir)?,
            current_reader: None,
            current_index: 0,
            from_ts,
            _phantom: PhantomData,
        })
    }

    /// Read the next entry
    pub fn read_next_entry(&mut self) -> Result<Option<T>> {
        loop {
            if self.current_reader.is_none() {
                let Some(path) = self.segments.get(self.current_index) else {
                    return Ok(None);
                };
                self.current_reader = Segment::open(path)?;
                self.current_index += 1;
            }

            let Some(reader) = &mut self.current_reader else {
                continue;
            };
            match reader.read_next()? {
                Some(data) => {
                    let entry: T = bincode::deserialize(&data)?;
                    if self.from_ts.is_some_and(|from| entry.timestamp() < from) {
                        continue;
                    }
                    return Ok(Some(entry));
                }
                None => self.current_reader = None,
            }
        }
    }
}

impl<T: WalEntry> std::fmt::Debug for WalIterator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalIterator")
            .field("segments", &self.segments)
            .field("current_reader", &self.current_reader.as_ref().map(|_| "<SegmentReader>"))
            .field("current_index", &self.current_index)
            .field("from_ts", &self.from_ts)
            .finish()
    }
}
