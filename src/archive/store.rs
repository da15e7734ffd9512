use anyhow::{Result, anyhow};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::file::BackingFile;
use super::lru::MruList;
use super::types::{ArchiveKey, ObjectEntry, parse_buffer_size};
use crate::codec;

/// A keyed store for byte blobs, backed by a single container file with an
/// LRU buffer in front.
///
/// Payloads are kept resident up to `max_buffer` bytes; the least recently
/// used entries are written back to the file and dropped to make room. An
/// object larger than the whole budget bypasses the buffer entirely. Removes
/// and overwrites leave stale bytes in the file until [`Archive::flush`]
/// rebuilds it.
///
/// Dirty entries reach the file on eviction, flush, or drop. A crash that
/// skips the drop loses buffered writes; call `flush` for a durability point.
pub struct Archive<K: ArchiveKey> {
    path: PathBuf,
    temporary: bool,
    file: Option<BackingFile>,
    entries: BTreeMap<K, ObjectEntry>,
    mru: MruList<K>,
    max_buffer: u64,
    buffer_used: u64,
    must_rebuild: bool,
}

impl<K: ArchiveKey> Archive<K> {
    /// Opens an archive backed by a fresh temp-path file that is deleted when
    /// the archive is dropped. The buffer starts disabled; size it with
    /// [`Archive::set_buffer_size`].
    pub fn new() -> Result<Self> {
        let path = tempfile::Builder::new()
            .prefix("objarc-")
            .tempfile()?
            .into_temp_path()
            .keep()?;
        Self::with_path(path, true)
    }

    /// Opens (or creates) the archive at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::with_path(path.as_ref().to_path_buf(), false)
    }

    fn with_path(path: PathBuf, temporary: bool) -> Result<Self> {
        let mut archive = Self {
            path,
            temporary,
            file: None,
            entries: BTreeMap::new(),
            mru: MruList::new(),
            max_buffer: 0,
            buffer_used: 0,
            must_rebuild: false,
        };
        archive.reopen()?;
        Ok(archive)
    }

    /// Re-points the archive at a new backing file. The current file is
    /// flushed first (and deleted if it was temp-path-backed); the new file's
    /// records are then indexed.
    pub fn init(&mut self, path: impl AsRef<Path>) -> Result<()> {
        self.internal_flush()?;
        self.file = None;
        if self.temporary && let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!("failed to remove temp archive {}: {e}", self.path.display());
        }

        self.path = path.as_ref().to_path_buf();
        self.temporary = false;
        self.reopen()
    }

    fn reopen(&mut self) -> Result<()> {
        self.entries.clear();
        self.mru.clear();
        self.buffer_used = 0;
        self.must_rebuild = false;

        let (file, records) = BackingFile::open(&self.path)?;
        for record in records {
            let key: K = codec::decode(&record.key)?;
            self.entries.insert(
                key,
                ObjectEntry {
                    offset: Some(record.offset),
                    size: record.size,
                    data: None,
                    modified: false,
                },
            );
        }
        self.file = Some(file);
        Ok(())
    }

    fn backing_mut(&mut self) -> Result<&mut BackingFile> {
        self.file
            .as_mut()
            .ok_or_else(|| anyhow!("archive has no open backing file"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes currently resident in the buffer.
    pub fn buffer_size(&self) -> u64 {
        self.buffer_used
    }

    /// The buffer budget.
    pub fn max_buffer_size(&self) -> u64 {
        self.max_buffer
    }

    /// Adopts a new buffer budget, evicting down to it first.
    pub fn set_buffer_size(&mut self, max_buffer: u64) -> Result<()> {
        self.unload(max_buffer)?;
        self.max_buffer = max_buffer;
        Ok(())
    }

    /// Same as [`Archive::set_buffer_size`] with a `"1.5G"`-style budget.
    pub fn set_buffer_size_str(&mut self, text: &str) -> Result<()> {
        self.set_buffer_size(parse_buffer_size(text))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_available(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// All keys currently known to the archive, resident or not.
    pub fn available_keys(&self) -> impl Iterator<Item = &K> {
        self.entries.keys()
    }

    /// Serializes `value` and stores it under `key`. See
    /// [`Archive::insert_raw`].
    pub fn insert<T: Serialize>(&mut self, key: K, value: &T, keep_in_buffer: bool) -> Result<u64> {
        self.insert_raw(key, codec::encode(value)?, keep_in_buffer)
    }

    /// Stores `data` under `key`, replacing any previous entry, and returns
    /// the payload size.
    ///
    /// The payload stays resident when `keep_in_buffer` is set and it fits
    /// the budget; otherwise it is written through to the file immediately.
    pub fn insert_raw(&mut self, key: K, data: Vec<u8>, keep_in_buffer: bool) -> Result<u64> {
        let size = data.len() as u64;
        let keep = keep_in_buffer && size <= self.max_buffer;

        self.remove(&key);

        if keep && self.buffer_used + size > self.max_buffer {
            self.unload(self.max_buffer - size)?;
        }

        self.buffer_used += size;
        self.entries.insert(
            key.clone(),
            ObjectEntry {
                offset: None,
                size,
                data: Some(data),
                modified: true,
            },
        );
        self.mru.touch(&key);

        if !keep {
            self.write_back(&key)?;
        }

        Ok(size)
    }

    /// Loads the value stored under `key` into `value`. Returns the payload
    /// size, or 0 if the key is unknown (in which case `value` is untouched).
    pub fn load<T: DeserializeOwned>(
        &mut self,
        key: &K,
        value: &mut T,
        keep_in_buffer: bool,
    ) -> Result<u64> {
        let mut raw = Vec::new();
        let size = self.load_raw(key, &mut raw, keep_in_buffer)?;
        if size == 0 {
            return Ok(0);
        }
        *value = codec::decode(&raw)?;
        Ok(size)
    }

    /// Copies the payload stored under `key` into `out` and returns its size,
    /// or 0 if the key is unknown.
    ///
    /// A non-resident payload is read from the file (evicting older entries
    /// to fit when `keep_in_buffer` is set) and the entry moves to the front
    /// of the recency order. With `keep_in_buffer` unset the entry is dropped
    /// from the buffer again on the way out.
    pub fn load_raw(&mut self, key: &K, out: &mut Vec<u8>, keep_in_buffer: bool) -> Result<u64> {
        let Some(entry) = self.entries.get(key) else {
            return Ok(0);
        };
        let size = entry.size;
        let resident = entry.resident();
        let offset = entry.offset;

        let keep = keep_in_buffer && size <= self.max_buffer;

        if !resident {
            if keep && self.buffer_used + size > self.max_buffer {
                self.unload(self.max_buffer.saturating_sub(size))?;
            }

            let offset = offset.ok_or_else(|| anyhow!("entry has no file offset"))?;
            let bytes = self.backing_mut()?.read_at(offset, size)?;

            let entry = self
                .entries
                .get_mut(key)
                .ok_or_else(|| anyhow!("entry vanished during load"))?;
            entry.data = Some(bytes);
            entry.modified = false;
            self.buffer_used += size;
        }

        self.mru.touch(key);

        let entry = self
            .entries
            .get_mut(key)
            .ok_or_else(|| anyhow!("entry vanished during load"))?;
        if !keep && !entry.modified {
            // The entry is about to be dropped from the buffer anyway, so the
            // payload can be handed over instead of copied. The placeholder
            // keeps the entry counted until write_back settles the books.
            *out = entry.data.replace(Vec::new()).unwrap_or_default();
        } else if let Some(data) = entry.data.as_ref() {
            out.clear();
            out.extend_from_slice(data);
        }

        if !keep {
            self.write_back(key)?;
        }

        Ok(size)
    }

    /// Drops the entry stored under `key`, if any. The payload bytes stay in
    /// the file until the next rebuild.
    pub fn remove(&mut self, key: &K) {
        if let Some(entry) = self.entries.remove(key) {
            if entry.resident() {
                self.buffer_used -= entry.size;
            }
            self.mru.remove(key);
            self.must_rebuild = true;
        }
    }

    /// Re-keys the entry stored under `old` to `new`, preserving its payload,
    /// residency, and dirty state. A missing `old` is a no-op; an existing
    /// `new` is replaced.
    pub fn change_key(&mut self, old: &K, new: K) {
        if *old == new || !self.entries.contains_key(old) {
            return;
        }
        if self.entries.contains_key(&new) {
            self.remove(&new);
        }
        if let Some(entry) = self.entries.remove(old) {
            self.mru.rename(old, new.clone());
            self.entries.insert(new, entry);
            self.must_rebuild = true;
        }
    }

    /// Evicts least recently used entries (writing back dirty ones) until at
    /// most `target` buffered bytes remain.
    pub fn unload(&mut self, target: u64) -> Result<()> {
        while self.buffer_used > target {
            let Some(key) = self.mru.back().cloned() else {
                break;
            };
            self.write_back(&key)?;
        }
        Ok(())
    }

    /// Writes back every dirty entry, rebuilds the file if any record was
    /// removed or rewritten, and re-reads the index from the result.
    pub fn flush(&mut self) -> Result<()> {
        self.internal_flush()?;
        self.reopen()
    }

    /// Drops every entry and truncates the backing file to an empty container.
    pub fn clear(&mut self) -> Result<()> {
        self.entries.clear();
        self.mru.clear();
        self.buffer_used = 0;
        self.must_rebuild = true;
        self.flush()
    }

    fn internal_flush(&mut self) -> Result<()> {
        if self.file.is_none() {
            return Ok(());
        }
        self.unload(0)?;

        // Zero-size entries never trip the budget loop; sweep any dirty
        // stragglers so the rebuild below only sees written records.
        let dirty: Vec<K> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.modified)
            .map(|(key, _)| key.clone())
            .collect();
        for key in dirty {
            self.write_back(&key)?;
        }

        if !self.must_rebuild {
            return Ok(());
        }
        self.must_rebuild = false;

        let mut records = Vec::with_capacity(self.entries.len());
        for (key, entry) in &self.entries {
            let offset = entry
                .offset
                .ok_or_else(|| anyhow!("unwritten entry reached rebuild"))?;
            records.push((codec::encode(key)?, offset, entry.size));
        }

        let chunk = self.max_buffer.max(1);
        self.backing_mut()?.rebuild(&records, chunk)
    }

    /// Writes the entry back to the file if it is dirty, then drops it from
    /// the buffer. Callers only pass keys whose entries are currently counted
    /// against the buffer.
    pub(crate) fn write_back(&mut self, key: &K) -> Result<bool> {
        let Some(entry) = self.entries.get(key) else {
            return Ok(false);
        };
        let size = entry.size;
        let was_resident = entry.resident();

        if entry.modified {
            let data = self
                .entries
                .get_mut(key)
                .and_then(|e| e.data.take())
                .ok_or_else(|| anyhow!("dirty entry has no resident bytes"))?;
            let offset = self.backing_mut()?.append(&data)?;

            if let Some(entry) = self.entries.get_mut(key) {
                entry.offset = Some(offset);
                entry.modified = false;
            }
            self.must_rebuild = true;
            tracing::debug!("wrote back {size} bytes at offset {offset}");
        } else if let Some(entry) = self.entries.get_mut(key) {
            entry.data = None;
        }

        if was_resident {
            self.buffer_used -= size;
        }
        self.mru.remove(key);

        Ok(true)
    }
}

impl<K: ArchiveKey> Drop for Archive<K> {
    fn drop(&mut self) {
        if let Err(e) = self.internal_flush() {
            tracing::warn!("failed to flush archive on drop: {e}");
        }
        self.file = None;
        if self.temporary && let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!("failed to remove temp archive {}: {e}", self.path.display());
        }
    }
}
