//! Handlers: registered message-delivery targets.
//!
//! A [`Handler`] owns its dispatch target and, once registered, a looper-scoped
//! id. Other code refers to it through a [`HandlerRef`], a non-owning ticket
//! (id + weak looper) that is resolved against the looper's registry at
//! delivery time. Ids are never reused, so a ticket for a handler that has gone
//! away can never reach a newer one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use crossbeam_channel::Sender;

use super::looper::{Looper, WeakLooper};
use crate::clock::ClockShared;
use crate::message::Message;

/// Looper-scoped handler identity. `0` means "not registered".
pub type HandlerId = u64;

/// The id carried by handlers that are not registered with any looper.
pub const UNREGISTERED: HandlerId = 0;

/// Hands out handler ids.
///
/// Ids start at 1 and only ever increase; an id is never handed out twice by
/// the same allocator, so it stays unique for as long as any ticket may still
/// reference it. Loopers that share an allocator share one id space.
#[derive(Debug)]
pub struct HandlerIdAllocator {
    next: AtomicU64,
}

impl Default for HandlerIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerIdAllocator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// The process-wide allocator used by loopers that are not given one.
    pub fn shared() -> Arc<HandlerIdAllocator> {
        static SHARED: OnceLock<Arc<HandlerIdAllocator>> = OnceLock::new();
        SHARED.get_or_init(|| Arc::new(HandlerIdAllocator::new())).clone()
    }

    /// Allocate the next id.
    pub fn allocate(&self) -> HandlerId {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

/// The closed set of things a looper can deliver to.
#[derive(Clone)]
pub(crate) enum HandlerTarget {
    /// A media clock's internal wake-ups.
    MediaClock(Weak<ClockShared>),
    /// Forward delivered messages to a channel receiver.
    Channel(Sender<Message>),
    /// Invoke a closure.
    Callback(Arc<dyn Fn(Message) + Send + Sync>),
}

impl HandlerTarget {
    fn kind(&self) -> &'static str {
        match self {
            HandlerTarget::MediaClock(_) => "media-clock",
            HandlerTarget::Channel(_) => "channel",
            HandlerTarget::Callback(_) => "callback",
        }
    }

    /// Hand a message to the target. Runs on the looper's worker thread.
    pub(crate) fn dispatch(&self, message: Message) {
        match self {
            HandlerTarget::MediaClock(clock) => match clock.upgrade() {
                Some(clock) => clock.on_message_received(message),
                None => log::debug!(
                    "media clock gone, dropping message what={:#x}",
                    message.what()
                ),
            },
            HandlerTarget::Channel(tx) => {
                if let Err(e) = tx.send(message) {
                    log::debug!(
                        "receiver gone, dropping message what={:#x}",
                        e.into_inner().what()
                    );
                }
            }
            HandlerTarget::Callback(callback) => callback(message),
        }
    }
}

/// A message-delivery target, bound to at most one looper.
///
/// Dropping a registered handler unregisters it; messages still queued for it
/// are then dropped silently when they come due.
pub struct Handler {
    id: HandlerId,
    looper: WeakLooper,
    target: HandlerTarget,
}

impl Handler {
    fn with_target(target: HandlerTarget) -> Self {
        Self {
            id: UNREGISTERED,
            looper: WeakLooper::new(),
            target,
        }
    }

    /// A handler that forwards every delivered message to `tx`.
    pub fn channel(tx: Sender<Message>) -> Self {
        Self::with_target(HandlerTarget::Channel(tx))
    }

    /// A handler that calls `callback` for every delivered message.
    pub fn callback<F>(callback: F) -> Self
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        Self::with_target(HandlerTarget::Callback(Arc::new(callback)))
    }

    pub(crate) fn media_clock(clock: Weak<ClockShared>) -> Self {
        Self::with_target(HandlerTarget::MediaClock(clock))
    }

    pub fn id(&self) -> HandlerId {
        self.id
    }

    pub fn is_registered(&self) -> bool {
        self.id != UNREGISTERED
    }

    /// The looper this handler is registered with, if it is still alive.
    pub fn looper(&self) -> Option<Looper> {
        self.looper.upgrade()
    }

    /// A non-owning reference for binding messages to this handler.
    pub fn handle(&self) -> HandlerRef {
        HandlerRef {
            id: self.id,
            looper: self.looper.clone(),
        }
    }

    /// Shorthand for `Message::new(what, &self.handle())`.
    pub fn message(&self, what: u32) -> Message {
        Message::new(what, &self.handle())
    }

    pub(crate) fn target(&self) -> &HandlerTarget {
        &self.target
    }

    pub(crate) fn bind(&mut self, id: HandlerId, looper: WeakLooper) {
        self.id = id;
        self.looper = looper;
    }

    /// Remove this handler from its looper's registry and reset its id to 0.
    pub fn unregister(&mut self) {
        if self.id == UNREGISTERED {
            return;
        }
        if let Some(looper) = self.looper.upgrade() {
            looper.remove_target(self.id);
        }
        log::debug!("handler {} ({}) unregistered", self.id, self.target.kind());
        self.id = UNREGISTERED;
        self.looper = WeakLooper::new();
    }
}

impl Drop for Handler {
    fn drop(&mut self) {
        self.unregister();
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handler")
            .field("id", &self.id)
            .field("kind", &self.target.kind())
            .finish_non_exhaustive()
    }
}

/// Non-owning reference to a handler: its id plus a weak looper reference.
#[derive(Clone)]
pub struct HandlerRef {
    id: HandlerId,
    looper: WeakLooper,
}

impl HandlerRef {
    pub fn id(&self) -> HandlerId {
        self.id
    }

    /// The handler's looper, if it is still alive.
    pub fn looper(&self) -> Option<Looper> {
        self.looper.upgrade()
    }

    /// Whether the looper is alive and still has this handler registered.
    pub fn is_live(&self) -> bool {
        self.id != UNREGISTERED
            && self
                .looper
                .upgrade()
                .is_some_and(|looper| looper.has_handler(self.id))
    }
}

impl std::fmt::Debug for HandlerRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRef").field("id", &self.id).finish()
    }
}
