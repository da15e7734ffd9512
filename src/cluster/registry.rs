use std::collections::BTreeMap;

use super::protocol::Request;

/// Where a pending lookup expects its answers from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// A broadcast lookup: any peer may answer.
    Any,
    /// A targeted lookup at one specific rank.
    Rank(usize),
}

/// Book-keeping for one in-flight remote lookup.
#[derive(Debug)]
pub struct PendingRequest {
    pub source: Source,
    /// Negative responses still expected before the lookup gives up. Peer
    /// deaths count as negative responses.
    pub waiting: i64,
    /// Rank that answered positively, once one has.
    pub found_at: Option<usize>,
    /// Set when the data response arrived; false means the key was gone.
    pub data_valid: Option<bool>,
    pub data: Option<Vec<u8>>,
}

/// Tracks every outstanding remote lookup of one node, keyed by the full
/// `{key, counter}` request identity.
///
/// A response that does not match a registered request belongs to a lookup
/// whose requester already gave up; it is reported back as unmatched and
/// dropped by the caller.
pub struct RequestRegistry<K: Ord + Clone> {
    pending: BTreeMap<Request<K>, PendingRequest>,
}

impl<K: Ord + Clone> RequestRegistry<K> {
    pub fn new() -> Self {
        Self {
            pending: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, request: Request<K>, source: Source, waiting: i64) {
        self.pending.insert(
            request,
            PendingRequest {
                source,
                waiting,
                found_at: None,
                data_valid: None,
                data: None,
            },
        );
    }

    pub fn get(&self, request: &Request<K>) -> Option<&PendingRequest> {
        self.pending.get(request)
    }

    /// Removes the lookup and returns its final state.
    pub fn complete(&mut self, request: &Request<K>) -> Option<PendingRequest> {
        self.pending.remove(request)
    }

    /// Applies a peer's yes/no answer. Returns false for unknown requests.
    pub fn apply_response(&mut self, request: &Request<K>, src: usize, found: bool) -> bool {
        match self.pending.get_mut(request) {
            Some(pending) => {
                pending.waiting -= 1;
                if found {
                    pending.found_at = Some(src);
                }
                true
            }
            None => false,
        }
    }

    /// Applies a peer's data answer. Returns false for unknown requests.
    pub fn apply_data(&mut self, request: &Request<K>, src: usize, valid: bool, data: Vec<u8>) -> bool {
        match self.pending.get_mut(request) {
            Some(pending) => {
                pending.found_at = Some(src);
                pending.data_valid = Some(valid);
                if valid {
                    pending.data = Some(data);
                }
                true
            }
            None => false,
        }
    }

    /// Takes the delivered payload, if the data response declared it valid.
    pub fn take_data(&mut self, request: &Request<K>) -> Option<Vec<u8>> {
        self.pending.get_mut(request).and_then(|pending| {
            if pending.data_valid == Some(true) {
                pending.data.take()
            } else {
                None
            }
        })
    }

    /// Accounts a dead peer as a negative response on every lookup that was
    /// waiting on it, specifically or via any-source.
    pub fn on_peer_death(&mut self, rank: usize) {
        for pending in self.pending.values_mut() {
            if pending.source == Source::Any || pending.source == Source::Rank(rank) {
                pending.waiting -= 1;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
