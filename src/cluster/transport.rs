use anyhow::Result;

/// Message tag. Each tag is owned by exactly one handler on the receiving
/// side; the values are application-chosen and only need to be distinct.
pub type Tag = i32;

/// Point-to-point message bus between a fixed set of ranked peers.
///
/// The archive only needs the synchronous half of a typical message-passing
/// interface: sends must not block on the receiver, receives are only issued
/// for messages a probe has already announced, and `iprobe` never blocks.
/// Delivery between any pair of ranks is FIFO.
pub trait Transport {
    /// Number of ranks in the group, this node included.
    fn size(&self) -> usize;

    /// This node's rank.
    fn rank(&self) -> usize;

    /// Sends `payload` to `dst` under `tag` without waiting for the receiver.
    fn send(&self, dst: usize, tag: Tag, payload: &[u8]) -> Result<()>;

    /// Receives the next pending message from `src` under `tag`.
    fn recv(&self, src: usize, tag: Tag) -> Result<Vec<u8>>;

    /// Checks for a deliverable message, returning its source and tag.
    fn iprobe(&self) -> Result<Option<(usize, Tag)>>;

    /// Blocks until every rank in the group has entered the barrier.
    fn barrier(&self) -> Result<()>;
}
