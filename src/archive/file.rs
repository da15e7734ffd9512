//! Backing file I/O.
//!
//! The on-disk container is a flat sequence: a `u64` record count followed by
//! that many `{u64 key_len, u64 data_len, key bytes, data bytes}` records. All
//! integers are host-endian. The count in the header is authoritative; bytes
//! appended after the indexed records (write-backs that have not been through a
//! rebuild yet) are only reachable through the in-memory index.

use anyhow::{Context, Result, anyhow};
use byteorder::{NativeEndian, ReadBytesExt, WriteBytesExt};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// One record as scanned from the container header walk. The key is still in
/// its encoded form; the store decodes it when rebuilding the index.
#[derive(Debug)]
pub struct RawRecord {
    pub key: Vec<u8>,
    pub offset: u64,
    pub size: u64,
}

/// Owns the open container file of one archive.
#[derive(Debug)]
pub struct BackingFile {
    path: PathBuf,
    file: File,
}

impl BackingFile {
    /// Opens (or creates) the container at `path` and scans its records.
    ///
    /// A non-empty file is walked record by record: the key bytes are read,
    /// the payload position noted, and the payload itself skipped. An absent
    /// or empty file is truncated to a zero-count header.
    pub fn open(path: &Path) -> Result<(Self, Vec<RawRecord>)> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("opening backing file {}", path.display()))?;

        let end = file.seek(SeekFrom::End(0))?;
        let mut records = Vec::new();

        if end > 0 {
            file.seek(SeekFrom::Start(0))?;
            let n_entries = file.read_u64::<NativeEndian>()?;

            for _ in 0..n_entries {
                let key_len = file.read_u64::<NativeEndian>()?;
                let data_len = file.read_u64::<NativeEndian>()?;

                let mut key = vec![0u8; key_len as usize];
                file.read_exact(&mut key)?;

                let offset = file.stream_position()?;
                file.seek(SeekFrom::Current(data_len as i64))?;

                records.push(RawRecord {
                    key,
                    offset,
                    size: data_len,
                });
            }
        } else {
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            file.write_u64::<NativeEndian>(0)?;
        }

        tracing::debug!(
            "opened backing file {} with {} records",
            path.display(),
            records.len()
        );

        Ok((
            Self {
                path: path.to_path_buf(),
                file,
            },
            records,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends `data` at the end of the file and returns its offset.
    pub fn append(&mut self, data: &[u8]) -> Result<u64> {
        let offset = self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(data)?;
        Ok(offset)
    }

    /// Reads `len` bytes starting at `offset`.
    pub fn read_at(&mut self, offset: u64, len: u64) -> Result<Vec<u8>> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len as usize];
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Rewrites the whole container from the surviving `records` (encoded key,
    /// payload offset in the current file, payload length) and atomically
    /// replaces the file. Payloads are streamed in chunks of at most
    /// `chunk_size` bytes so the copy never exceeds the buffer budget.
    pub fn rebuild(&mut self, records: &[(Vec<u8>, u64, u64)], chunk_size: u64) -> Result<()> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let mut scratch =
            NamedTempFile::new_in(&dir).context("creating rebuild scratch file")?;

        let chunk_size = chunk_size.max(1);

        {
            let out = scratch.as_file_mut();
            out.write_u64::<NativeEndian>(records.len() as u64)?;

            for (key, offset, size) in records {
                out.write_u64::<NativeEndian>(key.len() as u64)?;
                out.write_u64::<NativeEndian>(*size)?;
                out.write_all(key)?;
                copy_range(&mut self.file, out, *offset, *size, chunk_size)?;
            }

            out.flush()?;
        }

        // The original file is only replaced once the scratch is complete, so
        // a failure up to this point leaves it untouched.
        let file = scratch
            .persist(&self.path)
            .map_err(|e| anyhow!(e.error))
            .with_context(|| format!("replacing backing file {}", self.path.display()))?;
        self.file = file;

        tracing::info!(
            "rebuilt backing file {} with {} records",
            self.path.display(),
            records.len()
        );

        Ok(())
    }
}

fn copy_range(
    src: &mut File,
    dst: &mut File,
    offset: u64,
    len: u64,
    chunk_size: u64,
) -> Result<()> {
    src.seek(SeekFrom::Start(offset))?;

    let mut buf = vec![0u8; chunk_size.min(len.max(1)) as usize];
    let mut remaining = len;
    while remaining > 0 {
        let take = chunk_size.min(remaining) as usize;
        src.read_exact(&mut buf[..take])?;
        dst.write_all(&buf[..take])?;
        remaining -= take as u64;
    }

    Ok(())
}
