//! In-process mesh transport.
//!
//! One mailbox per rank, shared by every endpoint of the mesh. Messages are
//! delivered in arrival order per receiver, which preserves FIFO between any
//! pair of ranks. Endpoints are plain handles: each simulated node typically
//! lives on its own thread and keeps one, the way one transport rank maps to
//! one process in a real deployment.
//!
//! Mailboxes belong to the mesh, not the endpoints, so traffic sent to a rank
//! whose node has already shut down is absorbed instead of failing the sender.

use anyhow::{Result, anyhow, bail};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use super::transport::{Tag, Transport};

#[derive(Debug)]
struct Envelope {
    src: usize,
    tag: Tag,
    payload: Vec<u8>,
}

#[derive(Debug)]
struct MeshState {
    mailboxes: Vec<VecDeque<Envelope>>,
    barrier_generation: u64,
    barrier_waiting: usize,
}

#[derive(Debug)]
struct MeshShared {
    size: usize,
    state: Mutex<MeshState>,
    signal: Condvar,
}

/// A group of `size` ranks wired together in one process.
#[derive(Debug, Clone)]
pub struct Mesh {
    shared: Arc<MeshShared>,
}

impl Mesh {
    pub fn new(size: usize) -> Self {
        Self {
            shared: Arc::new(MeshShared {
                size,
                state: Mutex::new(MeshState {
                    mailboxes: (0..size).map(|_| VecDeque::new()).collect(),
                    barrier_generation: 0,
                    barrier_waiting: 0,
                }),
                signal: Condvar::new(),
            }),
        }
    }

    /// Hands out the endpoint for `rank`.
    pub fn endpoint(&self, rank: usize) -> Result<MeshTransport> {
        if rank >= self.shared.size {
            bail!("rank {rank} out of range for mesh of size {}", self.shared.size);
        }
        Ok(MeshTransport {
            rank,
            shared: self.shared.clone(),
        })
    }
}

/// One rank's view of the mesh.
#[derive(Debug, Clone)]
pub struct MeshTransport {
    rank: usize,
    shared: Arc<MeshShared>,
}

impl MeshTransport {
    fn lock(&self) -> Result<MutexGuard<'_, MeshState>> {
        self.shared
            .state
            .lock()
            .map_err(|_| anyhow!("mesh state lock poisoned"))
    }
}

impl Transport for MeshTransport {
    fn size(&self) -> usize {
        self.shared.size
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn send(&self, dst: usize, tag: Tag, payload: &[u8]) -> Result<()> {
        if dst >= self.shared.size {
            bail!("send to rank {dst} out of range");
        }
        let mut state = self.lock()?;
        state.mailboxes[dst].push_back(Envelope {
            src: self.rank,
            tag,
            payload: payload.to_vec(),
        });
        self.shared.signal.notify_all();
        Ok(())
    }

    fn recv(&self, src: usize, tag: Tag) -> Result<Vec<u8>> {
        let mut state = self.lock()?;
        loop {
            let mailbox = &mut state.mailboxes[self.rank];
            if let Some(pos) = mailbox
                .iter()
                .position(|e| e.src == src && e.tag == tag)
                && let Some(envelope) = mailbox.remove(pos)
            {
                return Ok(envelope.payload);
            }
            state = self
                .shared
                .signal
                .wait(state)
                .map_err(|_| anyhow!("mesh state lock poisoned"))?;
        }
    }

    fn iprobe(&self) -> Result<Option<(usize, Tag)>> {
        let probe = {
            let state = self.lock()?;
            state.mailboxes[self.rank].front().map(|e| (e.src, e.tag))
        };
        if probe.is_none() {
            // Idle ranks spin on iprobe while peers hold answers; give their
            // threads the core.
            std::thread::yield_now();
        }
        Ok(probe)
    }

    fn barrier(&self) -> Result<()> {
        let mut state = self.lock()?;
        let generation = state.barrier_generation;
        state.barrier_waiting += 1;

        if state.barrier_waiting == self.shared.size {
            state.barrier_waiting = 0;
            state.barrier_generation += 1;
            self.shared.signal.notify_all();
            return Ok(());
        }

        while state.barrier_generation == generation {
            state = self
                .shared
                .signal
                .wait(state)
                .map_err(|_| anyhow!("mesh state lock poisoned"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pairwise_fifo() {
        let mesh = Mesh::new(2);
        let a = mesh.endpoint(0).unwrap();
        let b = mesh.endpoint(1).unwrap();

        a.send(1, 0, b"first").unwrap();
        a.send(1, 0, b"second").unwrap();

        assert_eq!(b.iprobe().unwrap(), Some((0, 0)));
        assert_eq!(b.recv(0, 0).unwrap(), b"first");
        assert_eq!(b.recv(0, 0).unwrap(), b"second");
        assert_eq!(b.iprobe().unwrap(), None);
    }

    #[test]
    fn test_recv_matches_src_and_tag() {
        let mesh = Mesh::new(3);
        let a = mesh.endpoint(0).unwrap();
        let b = mesh.endpoint(1).unwrap();
        let c = mesh.endpoint(2).unwrap();

        a.send(2, 5, b"from a").unwrap();
        b.send(2, 6, b"from b").unwrap();

        // Targeted receive skips the non-matching message in front.
        assert_eq!(c.recv(1, 6).unwrap(), b"from b");
        assert_eq!(c.recv(0, 5).unwrap(), b"from a");
    }

    #[test]
    fn test_messages_to_idle_rank_are_absorbed() {
        let mesh = Mesh::new(2);
        let a = mesh.endpoint(0).unwrap();

        // Nobody ever reads rank 1's mailbox; sending must still succeed.
        a.send(1, 0, b"into the void").unwrap();
        assert_eq!(a.iprobe().unwrap(), None);
    }

    #[test]
    fn test_barrier_synchronizes_threads() {
        let mesh = Mesh::new(3);
        let flag = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));

        std::thread::scope(|scope| {
            for rank in 0..3 {
                let mesh = mesh.clone();
                let flag = flag.clone();
                scope.spawn(move || {
                    let endpoint = mesh.endpoint(rank).unwrap();
                    flag.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    endpoint.barrier().unwrap();
                    assert_eq!(flag.load(std::sync::atomic::Ordering::SeqCst), 3);
                });
            }
        });
    }
}
