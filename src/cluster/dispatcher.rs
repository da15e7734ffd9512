use anyhow::Result;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use super::transport::{Tag, Transport};

/// Callback invoked for one incoming message. The handler receives the source
/// rank and the tag and is responsible for consuming the message body via
/// [`Transport::recv`].
pub type TagHandler = Rc<dyn Fn(usize, Tag) -> Result<()>>;

/// Cooperative message pump.
///
/// Subsystems register one handler per tag; [`Dispatcher::run`] probes the
/// transport and dispatches every deliverable message to its handler. The
/// dispatcher does not own the transport's traffic: a message with no
/// registered handler is left in place for whatever else shares the
/// transport, and `run` returns so the caller can make progress.
///
/// Handlers may call `run` recursively — a handler that blocks on a remote
/// answer keeps pumping the same dispatcher while it waits.
pub struct Dispatcher<T: Transport> {
    transport: Rc<T>,
    handlers: RefCell<HashMap<Tag, TagHandler>>,
}

impl<T: Transport> Dispatcher<T> {
    pub fn new(transport: Rc<T>) -> Rc<Self> {
        Rc::new(Self {
            transport,
            handlers: RefCell::new(HashMap::new()),
        })
    }

    /// Registers `handler` for `tag`, replacing any previous one.
    pub fn register<F>(&self, tag: Tag, handler: F)
    where
        F: Fn(usize, Tag) -> Result<()> + 'static,
    {
        if self
            .handlers
            .borrow_mut()
            .insert(tag, Rc::new(handler))
            .is_some()
        {
            tracing::warn!("replacing handler for tag {tag}");
        }
    }

    pub fn unregister(&self, tag: Tag) {
        self.handlers.borrow_mut().remove(&tag);
    }

    /// Dispatches pending messages until the transport runs dry or a message
    /// with an unknown tag is at the front of the queue.
    pub fn run(&self) -> Result<()> {
        loop {
            let Some((src, tag)) = self.transport.iprobe()? else {
                return Ok(());
            };

            // Clone the handler out so the map is not borrowed while it runs;
            // the handler itself may register, unregister, or pump again.
            let handler = self.handlers.borrow().get(&tag).cloned();
            let Some(handler) = handler else {
                tracing::debug!("no handler for tag {tag}, leaving message queued");
                return Ok(());
            };

            handler(src, tag)?;
        }
    }
}
