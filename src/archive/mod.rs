//! Local Archive Module
//!
//! Implements a file-backed keyed store with an in-memory LRU buffer.
//!
//! ## Core Concepts
//! - **Single backing file**: All records live in one flat container file
//!   (`file.rs`). Dirty entries are appended on eviction; stale copies stay in
//!   the file until a full rebuild reclaims them.
//! - **Buffered reads and writes**: Loaded and inserted payloads are kept
//!   resident up to a byte budget. The least recently used entries are written
//!   back and dropped to make room (`lru.rs`).
//! - **Deferred rebuild**: Removes and overwrites only mark the file as
//!   rebuild-pending; `flush` (and drop) rewrite the container in one pass and
//!   atomically replace it.

pub mod file;
pub mod lru;
pub mod store;
pub mod types;

#[cfg(test)]
mod tests;
