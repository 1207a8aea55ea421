//! On-disk warm tier
//!
//! Every write lands in a fresh file named by the xxh64 of the key and a
//! store-wide generation number:
//! ```text
//! <dir>/<xxh64 hex>-<generation hex>.blob = key_len u32 LE | key bytes | value bytes
//! ```
//! The slot table maps each key to its newest file. Keys whose hashes
//! collide still get distinct files, and a rewrite never reuses the path
//! of a blob that a reader may be opening.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use stowage_common::{ContentKey, Error, Result};
use tracing::debug;
use xxhash_rust::xxh64::xxh64;

const BLOB_EXT: &str = "blob";

/// Monotonic write number; later writes of a key supersede earlier ones
pub type Generation = u64;

struct Slot {
    path: PathBuf,
    generation: Generation,
}

pub struct WarmStore {
    dir: PathBuf,
    slots: Mutex<HashMap<ContentKey, Slot>>,
    next_generation: AtomicU64,
}

impl WarmStore {
    /// Open the warm directory, discarding blobs from a previous run
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut cleared = 0usize;
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            let stale = path
                .extension()
                .is_some_and(|ext| ext == BLOB_EXT || ext == "tmp");
            if stale {
                fs::remove_file(&path)?;
                cleared += 1;
            }
        }
        debug!(dir = %dir.display(), cleared, "Opened warm cache directory");

        Ok(Self {
            dir,
            slots: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        })
    }

    fn blob_path(&self, key: &ContentKey, generation: Generation) -> PathBuf {
        let hash = xxh64(key.as_str().as_bytes(), 0);
        self.dir.join(format!(
            "{}-{generation:016x}.{BLOB_EXT}",
            hex::encode(hash.to_be_bytes())
        ))
    }

    /// Current blob of `key`
    pub fn path_of(&self, key: &ContentKey) -> Option<PathBuf> {
        self.slots.lock().get(key).map(|slot| slot.path.clone())
    }

    /// Generation of the current blob of `key`
    pub fn generation(&self, key: &ContentKey) -> Option<Generation> {
        self.slots.lock().get(key).map(|slot| slot.generation)
    }

    /// Write `value` for `key` as a new generation and drop the older blob
    pub fn write(&self, key: &ContentKey, value: &[u8]) -> Result<Generation> {
        let key_bytes = key.as_str().as_bytes();
        let key_len = u32::try_from(key_bytes.len())
            .map_err(|_| Error::invalid_argument("content key too long"))?;

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let path = self.blob_path(key, generation);
        let tmp = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&key_len.to_le_bytes())?;
            file.write_all(key_bytes)?;
            file.write_all(value)?;
        }
        fs::rename(&tmp, &path)?;

        let superseded = {
            let mut slots = self.slots.lock();
            match slots.entry(key.clone()) {
                // A concurrent write of the same key finished first
                Entry::Occupied(slot) if slot.get().generation > generation => Some(path),
                Entry::Occupied(mut slot) => {
                    let slot = slot.get_mut();
                    slot.generation = generation;
                    Some(std::mem::replace(&mut slot.path, path))
                }
                Entry::Vacant(vacant) => {
                    vacant.insert(Slot { path, generation });
                    None
                }
            }
        };
        if let Some(old) = superseded {
            delete_blob(&old)?;
        }
        Ok(generation)
    }

    /// Read the value for `key`, `None` if absent or not owned by `key`
    pub fn read(&self, key: &ContentKey) -> Result<Option<Bytes>> {
        let Some(path) = self.path_of(key) else {
            return Ok(None);
        };
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if data.len() < 4 {
            return Ok(None);
        }
        let key_len = u32::from_le_bytes(data[0..4].try_into().unwrap()) as usize;
        let Some(stored_key) = data.get(4..4 + key_len) else {
            return Ok(None);
        };
        if stored_key != key.as_str().as_bytes() {
            return Ok(None);
        }

        Ok(Some(Bytes::from(data).slice(4 + key_len..)))
    }

    /// Delete the blob of `key` unless it was rewritten after `generation`
    pub fn release(&self, key: &ContentKey, generation: Generation) -> Result<bool> {
        let released = {
            let mut slots = self.slots.lock();
            let current = slots.get(key).map(|slot| slot.generation);
            if current.is_some_and(|current| current <= generation) {
                slots.remove(key)
            } else {
                None
            }
        };
        match released {
            Some(slot) => {
                delete_blob(&slot.path)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn remove(&self, key: &ContentKey) -> Result<bool> {
        self.release(key, Generation::MAX)
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn delete_blob(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!(path = %path.display(), "Warm blob already gone");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
