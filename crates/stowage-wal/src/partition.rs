//! Partition files
//!
//! Each backend owns a directory of sequentially numbered partitions:
//! ```text
//! <root>/<backend_id>/0000000001.sealed
//! <root>/<backend_id>/0000000002.sealed
//! <root>/<backend_id>/0000000003.active
//! ```

use crate::record::{decode_all, DecodedPartition, WalRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use stowage_common::{BackendId, Error, Result};
use tracing::warn;

pub const ACTIVE_EXT: &str = "active";
pub const SEALED_EXT: &str = "sealed";
const TMP_EXT: &str = "tmp";

/// Identifies a partition: backend plus sequence number
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionId {
    pub backend: BackendId,
    pub seq: u64,
}

impl PartitionId {
    pub const fn new(backend: BackendId, seq: u64) -> Self {
        Self { backend, seq }
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{:010}", self.backend, self.seq)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionState {
    Active,
    Sealed,
}

/// Point-in-time description of a partition
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PartitionInfo {
    pub id: PartitionId,
    pub state: PartitionState,
    pub records: u64,
    pub bytes: u64,
    pub oldest_record_at: Option<DateTime<Utc>>,
    pub newest_record_at: Option<DateTime<Utc>>,
}

pub fn partition_path(dir: &Path, seq: u64, ext: &str) -> PathBuf {
    dir.join(format!("{seq:010}.{ext}"))
}

/// Parse `<seq>.<ext>` file names; anything else is ignored
pub fn parse_partition_name(path: &Path) -> Option<(u64, PartitionState)> {
    let state = match path.extension()?.to_str()? {
        ACTIVE_EXT => PartitionState::Active,
        SEALED_EXT => PartitionState::Sealed,
        _ => return None,
    };
    let seq = path.file_stem()?.to_str()?.parse().ok()?;
    Some((seq, state))
}

/// Persist a rename or unlink in `dir`
pub fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

/// Bookkeeping shared by active and sealed partitions
#[derive(Clone, Debug, Default)]
pub struct PartitionMeta {
    pub records: u64,
    pub bytes: u64,
    pub oldest_record_at: Option<DateTime<Utc>>,
    pub newest_record_at: Option<DateTime<Utc>>,
}

impl PartitionMeta {
    pub fn from_records(records: &[WalRecord], bytes: u64) -> Self {
        let mut meta = Self {
            bytes,
            ..Self::default()
        };
        for record in records {
            meta.observe(record.op.updated_at);
        }
        meta
    }

    pub fn observe(&mut self, written_at: DateTime<Utc>) {
        self.records += 1;
        self.oldest_record_at = Some(self.oldest_record_at.map_or(written_at, |t| t.min(written_at)));
        self.newest_record_at = Some(self.newest_record_at.map_or(written_at, |t| t.max(written_at)));
    }

    pub fn info(&self, id: PartitionId, state: PartitionState) -> PartitionInfo {
        PartitionInfo {
            id,
            state,
            records: self.records,
            bytes: self.bytes,
            oldest_record_at: self.oldest_record_at,
            newest_record_at: self.newest_record_at,
        }
    }
}

/// The single append target of a backend
pub struct ActivePartition {
    pub seq: u64,
    path: PathBuf,
    file: File,
    sync_on_write: bool,
    pub meta: PartitionMeta,
}

impl ActivePartition {
    /// Create a new, empty active partition
    pub fn create(dir: &Path, seq: u64, sync_on_write: bool) -> Result<Self> {
        let path = partition_path(dir, seq, ACTIVE_EXT);
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)?;
        sync_dir(dir)?;

        Ok(Self {
            seq,
            path,
            file,
            sync_on_write,
            meta: PartitionMeta::default(),
        })
    }

    /// Reopen an existing active partition for appending after recovery
    pub fn reopen(path: PathBuf, seq: u64, meta: PartitionMeta, sync_on_write: bool) -> Result<Self> {
        let file = OpenOptions::new().append(true).open(&path)?;
        Ok(Self {
            seq,
            path,
            file,
            sync_on_write,
            meta,
        })
    }

    /// Write one encoded record; durable on return when `sync_on_write`
    ///
    /// A failed write is cut back off the file so later records are not
    /// stranded behind a torn frame.
    pub fn append(&mut self, frame: &[u8], written_at: DateTime<Utc>) -> Result<()> {
        let required = frame.len() as u64;
        let written = self.file.write_all(frame).and_then(|()| {
            if self.sync_on_write {
                self.file.sync_data()
            } else {
                Ok(())
            }
        });

        if let Err(e) = written {
            if let Err(rollback) = self.file.set_len(self.meta.bytes) {
                warn!(
                    path = %self.path.display(),
                    error = %rollback,
                    "Failed to roll back partial WAL write"
                );
            }
            return Err(Error::from_wal_io(e, required));
        }

        self.meta.bytes += required;
        self.meta.observe(written_at);
        Ok(())
    }

    /// Whether the partition should be sealed before the next append
    pub fn is_full(&self, max_entries: u64, max_age: chrono::Duration, now: DateTime<Utc>) -> bool {
        if self.meta.records >= max_entries {
            return true;
        }
        self.meta
            .oldest_record_at
            .is_some_and(|first| now - first >= max_age)
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Fsync and rename to `.sealed`; the partition accepts no more
    /// appends once this succeeds
    pub fn seal(&self, dir: &Path) -> Result<PathBuf> {
        self.sync()?;
        let sealed_path = partition_path(dir, self.seq, SEALED_EXT);
        fs::rename(&self.path, &sealed_path)?;
        sync_dir(dir)?;
        Ok(sealed_path)
    }
}

/// Read a sealed partition; any bad frame is corruption
pub fn read_sealed(path: &Path) -> Result<DecodedPartition> {
    let data = fs::read(path)?;
    let decoded = decode_all(&data);
    if let Some(err) = &decoded.tail_error {
        return Err(Error::corruption(format!(
            "{} at offset {}: {err}",
            path.display(),
            decoded.valid_len
        )));
    }
    Ok(decoded)
}

/// Read the active partition, truncating a torn or corrupt tail
pub fn recover_active(path: &Path) -> Result<DecodedPartition> {
    let data = fs::read(path)?;
    let decoded = decode_all(&data);

    if let Some(err) = &decoded.tail_error {
        warn!(
            path = %path.display(),
            valid_len = decoded.valid_len,
            dropped_bytes = data.len() as u64 - decoded.valid_len,
            error = %err,
            "Truncating torn tail of active WAL partition"
        );
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(decoded.valid_len)?;
        file.sync_all()?;
    }

    Ok(decoded)
}

/// Atomically replace a sealed partition with `frames`
pub fn rewrite_sealed(dir: &Path, seq: u64, frames: &[Vec<u8>], buffer_size: usize) -> Result<u64> {
    let final_path = partition_path(dir, seq, SEALED_EXT);
    let tmp_path = partition_path(dir, seq, TMP_EXT);

    let mut bytes = 0u64;
    {
        let mut writer = BufWriter::with_capacity(buffer_size, File::create(&tmp_path)?);
        for frame in frames {
            writer.write_all(frame)?;
            bytes += frame.len() as u64;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }

    fs::rename(&tmp_path, &final_path)?;
    sync_dir(dir)?;
    Ok(bytes)
}
