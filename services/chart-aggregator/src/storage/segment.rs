//! WAL segment files with CRC32 checksums
//!
//! Layout: 16-byte header `[magic: u32][version: u32][entries: u64]` followed
//! by records `[length: u32][crc: u32][data]`. The header entry count is only
//! refreshed on close, so readers scan to end of file; a record cut short by a
//! crash marks the end of the log, and a file cut short inside its header is
//! an empty segment.

use anyhow::{Result, anyhow};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, trace, warn};

/// Size of segment header in bytes
pub const SEGMENT_HEADER_SIZE: u64 = 16;

/// Size of the per-record header in bytes
pub const RECORD_HEADER_SIZE: u64 = 8;

/// Magic number for segment files
pub const SEGMENT_MAGIC: u32 = 0x4348_524C; // "CHRL" in hex

/// Version of segment format
const SEGMENT_VERSION: u32 = 1;

/// A WAL segment open for appending
pub struct Segment {
    path: PathBuf,
    file: BufWriter<File>,
    size: u64,
    max_size: u64,
    entries: u64,
    committed_size: u64,
    committed_entries: u64,
    #[cfg(test)]
    fail_commit: bool,
}

impl Segment {
    /// Create a new segment file
    pub fn create(path: &Path, max_size: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .read(true)
            .truncate(true)
            .open(path)?;

        let mut writer = BufWriter::with_capacity(64 * 1024, file);

        writer.write_u32::<LittleEndian>(SEGMENT_MAGIC)?;
        writer.write_u32::<LittleEndian>(SEGMENT_VERSION)?;
        writer.write_u64::<LittleEndian>(0)?; // Entry count, updated on close
        writer.flush()?;

        Ok(Self {
            path: path.to_path_buf(),
            file: writer,
            size: SEGMENT_HEADER_SIZE,
            max_size,
            entries: 0,
            committed_size: SEGMENT_HEADER_SIZE,
            committed_entries: 0,
            #[cfg(test)]
            fail_commit: false,
        })
    }

    /// Open an existing segment file for reading.
    ///
    /// Returns `None` for a file that ends inside its header, which is what a
    /// crash during segment creation leaves behind.
    pub fn open(path: &Path) -> Result<Option<SegmentReader>> {
        let file = File::open(path)?;
        let mut reader = BufReader::with_capacity(64 * 1024, file);

        let (magic, version, header_entries) = match read_header(&mut reader) {
            Ok(header) => header,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                warn!("Segment {} ends inside its header, treating it as empty", path.display());
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        if magic != SEGMENT_MAGIC {
            return Err(anyhow!("Invalid segment magic in {}: {:#x}", path.display(), magic));
        }
        if version != SEGMENT_VERSION {
            return Err(anyhow!("Unsupported segment version: {}", version));
        }

        Ok(Some(SegmentReader {
            path: path.to_path_buf(),
            reader,
            header_entries,
            read: 0,
        }))
    }

    /// Append a record to the buffer. Nothing is durable until [`commit`].
    ///
    /// [`commit`]: Segment::commit
    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        self.append_batch(&[data])
    }

    /// Append several records to the buffer, all or none. An empty segment
    /// takes any batch; otherwise the batch must fit in the remaining space.
    pub fn append_batch<D: AsRef<[u8]>>(&mut self, records: &[D]) -> Result<()> {
        let bytes = batch_size(records);
        if !self.has_room(bytes) {
            return Err(anyhow!("Segment is full"));
        }

        for record in records {
            let data = record.as_ref();
            let data_len = u32::try_from(data.len())
                .map_err(|_| anyhow!("Record of {} bytes exceeds segment format", data.len()))?;

            let mut hasher = Hasher::new();
            hasher.update(data);
            let crc = hasher.finalize();

            self.file.write_u32::<LittleEndian>(data_len)?;
            self.file.write_u32::<LittleEndian>(crc)?;
            self.file.write_all(data)?;

            self.size += RECORD_HEADER_SIZE + u64::from(data_len);
            self.entries += 1;
            trace!("Appended entry {} ({} bytes) to segment", self.entries, data.len());
        }
        Ok(())
    }

    /// Push buffered records to the OS, and to stable storage when `sync`
    pub fn commit(&mut self, sync: bool) -> Result<()> {
        #[cfg(test)]
        if std::mem::take(&mut self.fail_commit) {
            return Err(anyhow!("Commit of {} failed", self.path.display()));
        }

        self.file.flush()?;
        if sync {
            self.file.get_mut().sync_data()?;
        }
        self.committed_size = self.size;
        self.committed_entries = self.entries;
        Ok(())
    }

    /// Drop every record appended since the last successful commit, without
    /// flushing them, and cut the file back to the committed length. Returns
    /// the number of entries kept.
    pub fn discard(self) -> Result<u64> {
        let (file, unflushed) = self.file.into_parts();
        let dropped = self.entries - self.committed_entries;
        file.set_len(self.committed_size)?;
        debug!(
            "Discarded {} uncommitted entries ({} buffered bytes) from {}",
            dropped,
            unflushed.map_or(0, |buf| buf.len()),
            self.path.display()
        );
        Ok(self.committed_entries)
    }

    /// Check if segment has room for a record of `next_entry_size` bytes
    #[must_use]
    pub const fn is_full(&self, next_entry_size: usize) -> bool {
        self.size
            .saturating_add(RECORD_HEADER_SIZE)
            // SAFETY: usize to u64 widening conversion is always safe
            .saturating_add(next_entry_size as u64)
            > self.max_size
    }

    /// Whether a batch of `bytes` (record headers included) may be appended
    #[must_use]
    pub const fn has_room(&self, bytes: u64) -> bool {
        self.entries == 0 || self.size.saturating_add(bytes) <= self.max_size
    }

    /// Arm a failure for the next [`commit`](Segment::commit)
    #[cfg(test)]
    pub(crate) fn fail_next_commit(&mut self) {
        self.fail_commit = true;
    }

    /// Close the segment, updating the header with final entry count
    pub fn close(mut self) -> Result<()> {
        self.file.seek(SeekFrom::Start(8))?;
        self.file.write_u64::<LittleEndian>(self.entries)?;
        self.file.flush()?;
        self.file.get_mut().sync_all()?;

        debug!("Closed segment {} with {} entries", self.path.display(), self.entries);
        Ok(())
    }

    /// Number of records appended
    #[must_use]
    pub const fn entry_count(&self) -> u64 {
        self.entries
    }

    /// Current size in bytes
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Segment file path
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Bytes a batch of records occupies on disk
#[must_use]
pub fn batch_size<D: AsRef<[u8]>>(records: &[D]) -> u64 {
    records
        .iter()
        // SAFETY: usize to u64 widening conversion is always safe
        .map(|record| RECORD_HEADER_SIZE + record.as_ref().len() as u64)
        .sum()
}

fn read_header(reader: &mut impl Read) -> std::io::Result<(u32, u32, u64)> {
    let magic = reader.read_u32::<LittleEndian>()?;
    let version = reader.read_u32::<LittleEndian>()?;
    let entries = reader.read_u64::<LittleEndian>()?;
    Ok((magic, version, entries))
}

/// Sequential reader over one segment
pub struct SegmentReader {
    path: PathBuf,
    reader: BufReader<File>,
    header_entries: u64,
    read: u64,
}

impl SegmentReader {
    /// Read the next record, `None` at end of log.
    ///
    /// A truncated trailing record is treated as end of log; a complete record
    /// with a bad checksum is an error.
    pub fn read_next(&mut self) -> Result<Option<Vec<u8>>> {
        let length = match self.reader.read_u32::<LittleEndian>() {
            Ok(length) => length,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let expected_crc = match self.reader.read_u32::<LittleEndian>() {
            Ok(crc) => crc,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(self.torn_tail()),
            Err(e) => return Err(e.into()),
        };

        // SAFETY: u32 to usize widening on 64-bit, identity on 32-bit
        let mut data = vec![0u8; length as usize];
        match self.reader.read_exact(&mut data) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(self.torn_tail()),
            Err(e) => return Err(e.into()),
        }

        let mut hasher = Hasher::new();
        hasher.update(&data);
        let actual_crc = hasher.finalize();

        if actual_crc != expected_crc {
            return Err(anyhow!(
                "CRC mismatch in {} at entry {}: expected {:#x}, got {:#x}",
                self.path.display(),
                self.read,
                expected_crc,
                actual_crc
            ));
        }

        self.read += 1;
        Ok(Some(data))
    }

    fn torn_tail(&self) -> Option<Vec<u8>> {
        warn!(
            "Segment {} ends with a partial record after entry {}, ignoring it",
            self.path.display(),
            self.read
        );
        None
    }

    /// Entry count recorded in the header at last close
    #[must_use]
    pub const fn header_entry_count(&self) -> u64 {
        self.header_entries
    }

    /// Records read so far
    #[must_use]
    pub const fn records_read(&self) -> u64 {
        self.read
    }
}
