use anyhow::{Result, anyhow};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::cell::RefCell;
use std::path::Path;
use std::rc::{Rc, Weak};

use super::dispatcher::Dispatcher;
use super::protocol::{KeyChange, Request, Response, ResponseData, Tags};
use super::registry::{RequestRegistry, Source};
use super::transport::{Tag, Transport};
use crate::archive::store::Archive;
use crate::archive::types::ArchiveKey;
use crate::codec;

/// Predicate deciding whether this node pulls its own copy of a value that
/// was just inserted on the peer the transport reports. Receives the key and
/// the transport (for rank-based policies).
pub type InsertFilter<K, T> = Box<dyn Fn(&K, &T) -> bool>;

/// Mutable cluster-side state of one node.
struct ClusterState<K: Ord + Clone> {
    /// Best-effort liveness per peer rank; the own slot is never consulted.
    alive: Vec<bool>,
    /// Monotone counter stamping outgoing lookups.
    request_counter: i32,
    registry: RequestRegistry<K>,
}

struct Shared<K: ArchiveKey, T: Transport> {
    tags: Tags,
    transport: Rc<T>,
    dispatcher: Rc<Dispatcher<T>>,
    archive: RefCell<Archive<K>>,
    state: RefCell<ClusterState<K>>,
    filter: RefCell<Option<InsertFilter<K, T>>>,
}

/// An archive node participating in a cluster.
///
/// Wraps a local [`Archive`] and keeps it loosely consistent with its peers:
/// inserts and removes invalidate remote copies, a local `load` miss is
/// resolved from whichever live peer still holds the value, and an optional
/// filter lets the node pull durable copies of values inserted elsewhere.
///
/// All progress is cooperative. The node only sends and receives while one of
/// its methods runs or while an idle caller pumps [`DistributedArchive::pump`];
/// there are no background threads. `is_available` and `available_keys` answer
/// from local knowledge only — with peers inserting and removing concurrently,
/// any cluster-wide answer could be stale before it returned.
pub struct DistributedArchive<K: ArchiveKey, T: Transport> {
    shared: Rc<Shared<K, T>>,
}

impl<K, T> DistributedArchive<K, T>
where
    K: ArchiveKey + 'static,
    T: Transport + 'static,
{
    /// Joins the cluster with the default tags.
    pub fn new(archive: Archive<K>, transport: Rc<T>, dispatcher: Rc<Dispatcher<T>>) -> Result<Self> {
        Self::with_tags(Tags::default(), archive, transport, dispatcher)
    }

    /// Joins the cluster, claiming `tags` on the dispatcher and announcing
    /// this node to every peer.
    pub fn with_tags(
        tags: Tags,
        archive: Archive<K>,
        transport: Rc<T>,
        dispatcher: Rc<Dispatcher<T>>,
    ) -> Result<Self> {
        let size = transport.size();
        let shared = Rc::new(Shared {
            tags,
            transport,
            dispatcher,
            archive: RefCell::new(archive),
            state: RefCell::new(ClusterState {
                alive: vec![false; size],
                request_counter: 0,
                registry: RequestRegistry::new(),
            }),
            filter: RefCell::new(None),
        });

        register_handlers(&shared);

        tracing::info!("joining cluster as rank {} of {}", shared.transport.rank(), size);
        shared.broadcast(shared.tags.alive, &true, false)?;
        shared.dispatcher.run()?;

        Ok(Self { shared })
    }

    /// Stores a typed value under `key`. See [`DistributedArchive::insert_raw`].
    pub fn insert<V: Serialize>(&self, key: K, value: &V, keep_in_buffer: bool) -> Result<u64> {
        self.insert_raw(key, codec::encode(value)?, keep_in_buffer)
    }

    /// Stores `data` under `key` and announces it to the cluster: peers drop
    /// their stale copies, and filter-enabled peers pull a replica.
    pub fn insert_raw(&self, key: K, data: Vec<u8>, keep_in_buffer: bool) -> Result<u64> {
        self.shared.dispatcher.run()?;

        // Inserting replaces the value everywhere, so the old copy is
        // invalidated cluster-wide before the new one is announced.
        self.shared
            .broadcast(self.shared.tags.invalidated, &key, true)?;
        let size = self
            .shared
            .archive
            .borrow_mut()
            .insert_raw(key.clone(), data, true)?;
        self.shared.broadcast(self.shared.tags.inserted, &key, true)?;

        if !keep_in_buffer {
            self.shared.archive.borrow_mut().write_back(&key)?;
        }
        Ok(size)
    }

    /// Loads the value stored under `key` into `value`, locally or from a
    /// peer. Returns the payload size, or 0 if nobody holds the key.
    pub fn load<V: DeserializeOwned>(
        &self,
        key: &K,
        value: &mut V,
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

    /// Copies the payload stored under `key` into `out`.
    ///
    /// On a local miss the key is requested from every live peer; the first
    /// positive answer picks the node the payload is pulled from, and the
    /// fetched value is installed locally before the load completes. Returns
    /// 0 once every live peer has answered negatively (or died).
    pub fn load_raw(&self, key: &K, out: &mut Vec<u8>, keep_in_buffer: bool) -> Result<u64> {
        self.shared.dispatcher.run()?;

        let size = self
            .shared
            .archive
            .borrow_mut()
            .load_raw(key, out, keep_in_buffer)?;
        if size != 0 {
            return Ok(size);
        }

        // Not here. Ask the cluster.
        let request = self.shared.next_request(key.clone());
        self.shared
            .broadcast(self.shared.tags.request, &request, true)?;
        let waiting = {
            let state = self.shared.state.borrow();
            state.alive.iter().filter(|alive| **alive).count() as i64
        };
        tracing::debug!("remote lookup started, awaiting {waiting} answers");

        let Some(data) = self.shared.get_response(Source::Any, waiting, &request)? else {
            return Ok(0);
        };

        self.shared
            .archive
            .borrow_mut()
            .insert_raw(key.clone(), data, true)?;
        self.shared
            .archive
            .borrow_mut()
            .load_raw(key, out, keep_in_buffer)
    }

    /// Drops the entry stored under `key` here and on every live peer.
    pub fn remove(&self, key: &K) -> Result<()> {
        self.shared.dispatcher.run()?;
        self.shared
            .broadcast(self.shared.tags.invalidated, key, true)?;
        self.shared.archive.borrow_mut().remove(key);
        Ok(())
    }

    /// Re-keys the entry stored under `old` here and on every live peer.
    pub fn change_key(&self, old: &K, new: K) -> Result<()> {
        self.shared.dispatcher.run()?;
        let change = KeyChange {
            old: old.clone(),
            new: new.clone(),
        };
        self.shared
            .broadcast(self.shared.tags.change_key, &change, true)?;
        self.shared.archive.borrow_mut().change_key(old, new);
        Ok(())
    }

    /// Installs the remote-insert filter: whenever a peer announces an
    /// insert and `filter` accepts the key, this node pulls a durable copy.
    pub fn set_insert_filter<F>(&self, filter: F)
    where
        F: Fn(&K, &T) -> bool + 'static,
    {
        *self.shared.filter.borrow_mut() = Some(Box::new(filter));
    }

    pub fn clear_insert_filter(&self) {
        *self.shared.filter.borrow_mut() = None;
    }

    /// Processes pending cluster traffic. Idle nodes call this to serve
    /// peers' lookups and apply their announcements.
    pub fn pump(&self) -> Result<()> {
        self.shared.dispatcher.run()
    }

    // Local-archive pass-throughs. These never touch the network (beyond the
    // pump) and answer from this node's knowledge only.

    pub fn is_available(&self, key: &K) -> bool {
        self.shared.archive.borrow().is_available(key)
    }

    pub fn available_keys(&self) -> Vec<K> {
        self.shared.archive.borrow().available_keys().cloned().collect()
    }

    pub fn buffer_size(&self) -> u64 {
        self.shared.archive.borrow().buffer_size()
    }

    pub fn max_buffer_size(&self) -> u64 {
        self.shared.archive.borrow().max_buffer_size()
    }

    pub fn set_buffer_size(&self, max_buffer: u64) -> Result<()> {
        self.shared.archive.borrow_mut().set_buffer_size(max_buffer)
    }

    pub fn set_buffer_size_str(&self, text: &str) -> Result<()> {
        self.shared.archive.borrow_mut().set_buffer_size_str(text)
    }

    pub fn init(&self, path: impl AsRef<Path>) -> Result<()> {
        self.shared.archive.borrow_mut().init(path)
    }

    pub fn unload(&self, target: u64) -> Result<()> {
        self.shared.archive.borrow_mut().unload(target)
    }

    pub fn flush(&self) -> Result<()> {
        self.shared.archive.borrow_mut().flush()
    }

    pub fn clear(&self) -> Result<()> {
        self.shared.archive.borrow_mut().clear()
    }
}

impl<K: ArchiveKey, T: Transport> Drop for DistributedArchive<K, T> {
    fn drop(&mut self) {
        if let Err(e) = self.shared.dispatcher.run() {
            tracing::warn!("final dispatcher pump failed: {e}");
        }
        tracing::info!("leaving cluster as rank {}", self.shared.transport.rank());
        if let Err(e) = self.shared.broadcast(self.shared.tags.alive, &false, false) {
            tracing::warn!("failed to announce shutdown: {e}");
        }

        let tags = self.shared.tags;
        for tag in [
            tags.alive,
            tags.invalidated,
            tags.inserted,
            tags.change_key,
            tags.request,
            tags.response,
            tags.request_data,
            tags.response_data,
        ] {
            self.shared.dispatcher.unregister(tag);
        }
    }
}

fn register_handlers<K, T>(shared: &Rc<Shared<K, T>>)
where
    K: ArchiveKey + 'static,
    T: Transport + 'static,
{
    let tags = shared.tags;

    register(shared, tags.alive, Shared::process_alive);
    register(shared, tags.invalidated, Shared::process_invalidated);
    register(shared, tags.inserted, Shared::process_inserted);
    register(shared, tags.change_key, Shared::process_change_key);
    register(shared, tags.request, Shared::process_request);
    register(shared, tags.response, Shared::process_response);
    register(shared, tags.request_data, Shared::process_request_data);
    register(shared, tags.response_data, Shared::process_response_data);
}

/// Hooks one processing method up to its tag. Handlers hold only a weak
/// reference to the shared state so that dropping the facade actually drops
/// it; a message arriving after that is drained and ignored.
fn register<K, T, F>(shared: &Rc<Shared<K, T>>, tag: Tag, process: F)
where
    K: ArchiveKey + 'static,
    T: Transport + 'static,
    F: Fn(&Shared<K, T>, usize, Tag) -> Result<()> + 'static,
{
    let weak: Weak<Shared<K, T>> = Rc::downgrade(shared);
    let transport = shared.transport.clone();
    shared.dispatcher.register(tag, move |src, tag| {
        let Some(shared) = weak.upgrade() else {
            transport.recv(src, tag)?;
            return Ok(());
        };
        process(shared.as_ref(), src, tag)
    });
}

impl<K, T> Shared<K, T>
where
    K: ArchiveKey,
    T: Transport,
{
    fn recv_as<V: DeserializeOwned>(&self, src: usize, tag: Tag) -> Result<V> {
        codec::decode(&self.transport.recv(src, tag)?)
    }

    /// Sends `value` to every peer. With `check_alive`, only peers currently
    /// believed alive are addressed; without it, every rank but this one is
    /// (the life-cycle announcements must reach even peers this node has
    /// never heard from).
    fn broadcast<V: Serialize>(&self, tag: Tag, value: &V, check_alive: bool) -> Result<()> {
        let payload = codec::encode(value)?;
        let alive = self.state.borrow().alive.clone();
        for rank in 0..self.transport.size() {
            if alive[rank] || (!check_alive && rank != self.transport.rank()) {
                self.transport.send(rank, tag, &payload)?;
            }
        }
        Ok(())
    }

    fn next_request(&self, key: K) -> Request<K> {
        let mut state = self.state.borrow_mut();
        let counter = state.request_counter;
        state.request_counter += 1;
        Request { key, counter }
    }

    /// Runs one lookup to completion: waits until a peer answers positively
    /// or `waiting` negative answers (responses or deaths) exhaust it, then
    /// pulls the payload from the positive responder. Returns `None` when the
    /// key is nowhere to be found or the chosen peer died or dropped the key
    /// before delivering.
    fn get_response(
        &self,
        source: Source,
        waiting: i64,
        request: &Request<K>,
    ) -> Result<Option<Vec<u8>>> {
        self.state
            .borrow_mut()
            .registry
            .register(request.clone(), source, waiting);

        let result = self.wait_for_data(request);

        self.state.borrow_mut().registry.complete(request);
        result
    }

    fn wait_for_data(&self, request: &Request<K>) -> Result<Option<Vec<u8>>> {
        loop {
            let (found, waiting) = {
                let state = self.state.borrow();
                let pending = state
                    .registry
                    .get(request)
                    .ok_or_else(|| anyhow!("pending lookup vanished"))?;
                (pending.found_at, pending.waiting)
            };
            if found.is_some() || waiting <= 0 {
                break;
            }
            self.dispatcher.run()?;
        }

        let found = {
            let state = self.state.borrow();
            state.registry.get(request).and_then(|p| p.found_at)
        };
        let Some(source_rank) = found else {
            return Ok(None);
        };

        self.transport
            .send(source_rank, self.tags.request_data, &codec::encode(request)?)?;

        loop {
            let (resolved, source_alive) = {
                let state = self.state.borrow();
                let pending = state
                    .registry
                    .get(request)
                    .ok_or_else(|| anyhow!("pending lookup vanished"))?;
                (pending.data_valid.is_some(), state.alive[source_rank])
            };
            if resolved || !source_alive {
                break;
            }
            self.dispatcher.run()?;
        }

        Ok(self.state.borrow_mut().registry.take_data(request))
    }

    fn process_alive(&self, src: usize, tag: Tag) -> Result<()> {
        let alive: bool = self.recv_as(src, tag)?;

        let was_alive = {
            let mut state = self.state.borrow_mut();
            let was_alive = state.alive[src];
            state.alive[src] = alive;
            if was_alive && !alive {
                // The peer will answer nothing anymore; settle its debts.
                state.registry.on_peer_death(src);
            }
            was_alive
        };

        if alive && !was_alive {
            tracing::debug!("peer {src} is alive");
            self.transport
                .send(src, self.tags.alive, &codec::encode(&true)?)?;
        } else if was_alive && !alive {
            tracing::debug!("peer {src} left the cluster");
        }
        Ok(())
    }

    fn process_invalidated(&self, src: usize, tag: Tag) -> Result<()> {
        let key: K = self.recv_as(src, tag)?;
        self.archive.borrow_mut().remove(&key);
        Ok(())
    }

    fn process_inserted(&self, src: usize, tag: Tag) -> Result<()> {
        let key: K = self.recv_as(src, tag)?;

        // The announced insert supersedes whatever this node holds.
        self.archive.borrow_mut().remove(&key);

        let wants_copy = match &*self.filter.borrow() {
            Some(filter) => filter(&key, &self.transport),
            None => false,
        };
        if !wants_copy {
            return Ok(());
        }

        tracing::debug!("pulling replica of a value inserted at {src}");
        let request = self.next_request(key.clone());
        self.transport
            .send(src, self.tags.request, &codec::encode(&request)?)?;

        if let Some(data) = self.get_response(Source::Rank(src), 1, &request)? {
            self.archive.borrow_mut().insert_raw(key, data, false)?;
        }
        Ok(())
    }

    fn process_change_key(&self, src: usize, tag: Tag) -> Result<()> {
        let change: KeyChange<K> = self.recv_as(src, tag)?;
        self.archive.borrow_mut().change_key(&change.old, change.new);
        Ok(())
    }

    fn process_request(&self, src: usize, tag: Tag) -> Result<()> {
        let request: Request<K> = self.recv_as(src, tag)?;
        let found = self.archive.borrow().is_available(&request.key);
        let response = Response { request, found };
        self.transport
            .send(src, self.tags.response, &codec::encode(&response)?)
    }

    fn process_response(&self, src: usize, tag: Tag) -> Result<()> {
        let response: Response<K> = self.recv_as(src, tag)?;
        let matched = self.state.borrow_mut().registry.apply_response(
            &response.request,
            src,
            response.found,
        );
        if !matched {
            tracing::debug!("dropping response from {src} for an abandoned lookup");
        }
        Ok(())
    }

    fn process_request_data(&self, src: usize, tag: Tag) -> Result<()> {
        let request: Request<K> = self.recv_as(src, tag)?;

        let mut data = Vec::new();
        let valid = {
            let mut archive = self.archive.borrow_mut();
            let valid = archive.is_available(&request.key);
            if valid {
                archive.load_raw(&request.key, &mut data, false)?;
            }
            valid
        };

        let response = ResponseData {
            request,
            valid,
            data,
        };
        self.transport
            .send(src, self.tags.response_data, &codec::encode(&response)?)
    }

    fn process_response_data(&self, src: usize, tag: Tag) -> Result<()> {
        let response: ResponseData<K> = self.recv_as(src, tag)?;
        let matched = self.state.borrow_mut().registry.apply_data(
            &response.request,
            src,
            response.valid,
            response.data,
        );
        if !matched {
            tracing::debug!("dropping data response from {src} for an abandoned lookup");
        }
        Ok(())
    }
}
