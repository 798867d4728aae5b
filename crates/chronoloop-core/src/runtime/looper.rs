//! Loopers: one worker thread draining a deadline-ordered message queue.
//!
//! The worker waits on a condition variable: indefinitely while the queue is
//! empty, or until the earliest deadline otherwise. Posting a message that
//! becomes the new head, or requesting a stop, wakes it early. Due messages are
//! popped under the queue lock and delivered after it is released, so handlers
//! may post, register handlers or even drop the looper from inside delivery.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crossbeam_channel::Receiver;

use super::handler::{Handler, HandlerId, HandlerIdAllocator, HandlerTarget};
use super::queue::EventQueue;
use crate::config::LooperConfig;
use crate::error::{Error, Result};
use crate::message::Message;
use crate::time::{MonotonicClock, SharedClock};

/// Longest single wait, in microseconds. The worker simply re-evaluates after.
const MAX_WAIT_US: i64 = 3_600_000_000;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct LoopState {
    queue: EventQueue,
    running: bool,
    exit_pending: bool,
    worker: Option<ThreadId>,
}

/// State shared between looper handles and the worker thread.
struct LoopCore {
    name: String,
    state: Mutex<LoopState>,
    queue_changed: Condvar,
    exited: Condvar,
    registry: Mutex<HashMap<HandlerId, HandlerTarget>>,
    ids: Arc<HandlerIdAllocator>,
    clock: SharedClock,
    poll_interval: Option<Duration>,
}

impl LoopCore {
    fn post(&self, message: Message, delay_us: i64) {
        let now = self.clock.now_us();
        let when_us = now.saturating_add(delay_us.max(0));

        let mut state = lock(&self.state);
        if state.queue.insert(when_us, message) {
            self.queue_changed.notify_all();
        }
        log::trace!(
            "[{}] queued event due in {}us ({} pending)",
            self.name,
            when_us.saturating_sub(now),
            state.queue.len()
        );
    }

    /// Worker thread body.
    fn run(self: Arc<Self>) {
        lock(&self.state).worker = Some(thread::current().id());
        log::debug!("looper '{}' started", self.name);

        while self.run_once() {}

        let mut state = lock(&self.state);
        state.running = false;
        state.exit_pending = false;
        state.worker = None;
        self.exited.notify_all();
        log::debug!("looper '{}' exited", self.name);
    }

    /// One scheduling step. Returns `false` once an exit has been requested.
    fn run_once(&self) -> bool {
        let event = {
            let state = lock(&self.state);
            if state.exit_pending {
                return false;
            }

            let Some(when_us) = state.queue.front_deadline() else {
                let _state = match self.poll_interval {
                    Some(interval) => {
                        self.queue_changed
                            .wait_timeout(state, interval)
                            .unwrap_or_else(PoisonError::into_inner)
                            .0
                    }
                    None => self
                        .queue_changed
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner),
                };
                return true;
            };

            let now_us = self.clock.now_us();
            if when_us > now_us {
                let delay_us = when_us.saturating_sub(now_us).min(MAX_WAIT_US);
                let mut timeout = Duration::from_micros(delay_us as u64);
                if let Some(interval) = self.poll_interval {
                    timeout = timeout.min(interval);
                }
                let _state = self
                    .queue_changed
                    .wait_timeout(state, timeout)
                    .unwrap_or_else(PoisonError::into_inner);
                return true;
            }

            let mut state = state;
            state.queue.pop_front()
        };

        if let Some(event) = event {
            self.deliver(event.message);
        }
        true
    }

    fn deliver(&self, message: Message) {
        let Some(id) = message.target_id() else {
            log::debug!("[{}] dropping unbound message what={:#x}", self.name, message.what());
            return;
        };
        let target = lock(&self.registry).get(&id).cloned();
        match target {
            Some(target) => {
                log::trace!("[{}] delivering what={:#x} to handler {}", self.name, message.what(), id);
                target.dispatch(message);
            }
            None => log::debug!(
                "[{}] handler {} is gone, dropping message what={:#x}",
                self.name,
                id,
                message.what()
            ),
        }
    }
}

struct LooperInner {
    core: Arc<LoopCore>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl LooperInner {
    fn start(&self) -> Result<()> {
        let core = &self.core;
        {
            let mut state = lock(&core.state);
            if state.running {
                return Err(Error::AlreadyRunning(core.name.clone()));
            }
            state.running = true;
            state.exit_pending = false;
        }

        // A worker that was asked to stop from its own thread is still detached
        // here; reap it before replacing the handle.
        let previous = lock(&self.thread).take();
        if let Some(previous) = previous {
            if previous.thread().id() != thread::current().id() {
                let _ = previous.join();
            }
        }

        let worker_core = Arc::clone(core);
        let spawned = thread::Builder::new()
            .name(core.name.clone())
            .spawn(move || worker_core.run());
        match spawned {
            Ok(handle) => {
                *lock(&self.thread) = Some(handle);
                Ok(())
            }
            Err(e) => {
                lock(&core.state).running = false;
                Err(Error::Spawn(e))
            }
        }
    }

    fn stop(&self) -> Result<()> {
        let core = &self.core;
        let mut state = lock(&core.state);
        if !state.running {
            log::debug!("looper '{}' already stopped", core.name);
            return Err(Error::NotRunning(core.name.clone()));
        }

        state.exit_pending = true;
        core.queue_changed.notify_all();

        if state.worker == Some(thread::current().id()) {
            // Called during delivery; the worker exits when the handler returns.
            log::debug!("looper '{}' stop requested from its own thread", core.name);
            return Ok(());
        }

        while state.running {
            state = core
                .exited
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        drop(state);

        let handle = lock(&self.thread).take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        log::debug!("looper '{}' stopped", core.name);
        Ok(())
    }
}

impl Drop for LooperInner {
    fn drop(&mut self) {
        if lock(&self.core.state).running {
            let _ = self.stop();
        }
    }
}

/// Handle to a looper. Clones share the same worker and queue.
///
/// The worker thread is stopped when the last handle is dropped.
#[derive(Clone)]
pub struct Looper {
    inner: Arc<LooperInner>,
}

impl Looper {
    /// Create a looper with default settings. It is not started.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(
            &LooperConfig::named(name),
            HandlerIdAllocator::shared(),
            MonotonicClock::shared(),
        )
    }

    /// Create a looper with an explicit id allocator and clock.
    pub fn with_config(
        config: &LooperConfig,
        ids: Arc<HandlerIdAllocator>,
        clock: SharedClock,
    ) -> Self {
        let core = LoopCore {
            name: config.name.clone(),
            state: Mutex::new(LoopState {
                queue: EventQueue::new(),
                running: false,
                exit_pending: false,
                worker: None,
            }),
            queue_changed: Condvar::new(),
            exited: Condvar::new(),
            registry: Mutex::new(HashMap::new()),
            ids,
            clock,
            poll_interval: config.poll_interval,
        };
        Self {
            inner: Arc::new(LooperInner {
                core: Arc::new(core),
                thread: Mutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.core.name
    }

    /// Spawn the worker thread.
    pub fn start(&self) -> Result<()> {
        self.inner.start()
    }

    /// Stop the worker and wait until it has exited.
    ///
    /// Once this returns no further message is delivered by this looper.
    /// Messages still queued stay queued and are delivered after a restart.
    pub fn stop(&self) -> Result<()> {
        self.inner.stop()
    }

    pub fn is_running(&self) -> bool {
        lock(&self.inner.core.state).running
    }

    /// Number of queued, undelivered messages.
    pub fn pending_events(&self) -> usize {
        lock(&self.inner.core.state).queue.len()
    }

    /// Register `handler` with this looper and return its new id.
    ///
    /// A handler registered elsewhere is unregistered from there first.
    pub fn register_handler(&self, handler: &mut Handler) -> HandlerId {
        handler.unregister();
        let id = self.inner.core.ids.allocate();
        lock(&self.inner.core.registry).insert(id, handler.target().clone());
        handler.bind(id, self.downgrade());
        log::debug!("[{}] registered handler {}", self.name(), id);
        id
    }

    /// Unregister `handler`; its id becomes 0.
    pub fn unregister_handler(&self, handler: &mut Handler) {
        handler.unregister();
    }

    /// Register a channel handler and return it with its receiving end.
    pub fn register_channel(&self) -> (Handler, Receiver<Message>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut handler = Handler::channel(tx);
        self.register_handler(&mut handler);
        (handler, rx)
    }

    pub fn downgrade(&self) -> WeakLooper {
        WeakLooper(Arc::downgrade(&self.inner))
    }

    pub(crate) fn post(&self, message: Message, delay_us: i64) {
        self.inner.core.post(message, delay_us);
    }

    pub(crate) fn remove_target(&self, id: HandlerId) {
        lock(&self.inner.core.registry).remove(&id);
    }

    pub(crate) fn has_handler(&self, id: HandlerId) -> bool {
        lock(&self.inner.core.registry).contains_key(&id)
    }
}

impl std::fmt::Debug for Looper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Looper")
            .field("name", &self.name())
            .field("running", &self.is_running())
            .field("pending_events", &self.pending_events())
            .finish()
    }
}

/// Non-owning looper reference.
#[derive(Clone, Default)]
pub struct WeakLooper(Weak<LooperInner>);

impl WeakLooper {
    /// A reference that never upgrades.
    pub fn new() -> Self {
        Self(Weak::new())
    }

    pub fn upgrade(&self) -> Option<Looper> {
        self.0.upgrade().map(|inner| Looper { inner })
    }
}
