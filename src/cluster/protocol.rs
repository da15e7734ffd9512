//! Cluster Wire Protocol
//!
//! Defines the message tags and the payload types exchanged between archive
//! nodes. Every payload is encoded with the crate codec before it is handed to
//! the transport.
//!
//! Besides the four one-way announcements (`alive`, `invalidated`, `inserted`,
//! `change_key`), the protocol carries a two-phase lookup: a broadcast
//! `request` answered by per-peer `response` messages, followed by a targeted
//! `request_data` answered by one `response_data` carrying the payload.

use serde::{Deserialize, Serialize};

use super::transport::Tag;

/// The tags an archive claims on its transport.
///
/// All nodes of one cluster must agree on these values. The defaults work
/// whenever nothing else shares the transport; override them to move the
/// archive out of the way of other subsystems.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tags {
    /// `bool`: sender joined (true) or left (false) the cluster.
    pub alive: Tag,
    /// Key: sender dropped its copy; receivers drop theirs too.
    pub invalidated: Tag,
    /// Key: sender stored a new value; receivers drop stale copies and may
    /// pull their own replica.
    pub inserted: Tag,
    /// Key pair: sender re-keyed an entry; receivers follow suit.
    pub change_key: Tag,
    /// `Request`: sender looks for a key; answer with a `Response`.
    pub request: Tag,
    /// `Response`: whether the responder holds the requested key.
    pub response: Tag,
    /// `Request`: sender wants the payload; answer with a `ResponseData`.
    pub request_data: Tag,
    /// `ResponseData`: the payload, if it is still available.
    pub response_data: Tag,
}

impl Default for Tags {
    fn default() -> Self {
        Self {
            alive: 0,
            invalidated: 1,
            inserted: 2,
            change_key: 3,
            request: 4,
            response: 5,
            request_data: 6,
            response_data: 7,
        }
    }
}

/// Identifier of one outstanding remote lookup.
///
/// The counter distinguishes concurrent lookups for the same key from the
/// same node (a filter pull can race a user-initiated load); responses are
/// matched on the full pair. The derived ordering — key first, counter second
/// — is what the request registry sorts by.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct Request<K> {
    pub key: K,
    pub counter: i32,
}

/// Answer to a `request`: whether the responding node holds the key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response<K> {
    pub request: Request<K>,
    pub found: bool,
}

/// Answer to a `request_data`. `valid` is false when the key disappeared
/// between the lookup and the pull (raced with a remove), in which case
/// `data` is empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseData<K> {
    pub request: Request<K>,
    pub valid: bool,
    pub data: Vec<u8>,
}

/// Payload of a `change_key` announcement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyChange<K> {
    pub old: K,
    pub new: K,
}
