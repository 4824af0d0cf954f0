//! # Async Handler Notifier
//!
//! Delivers committed events to registered handlers from a small pool of
//! worker threads. One notifier serves every stream of a channel.
//!
//! ## Architecture
//!
//! ```text
//!   ┌──────────────────────── Registry (Mutex) ────────────────────────┐
//!   │  slots: [ ctx0 | ctx1 | (free) | ctx3 ]     cursor ──► 1          │
//!   └───────────────────────────────────────────────────────────────────┘
//!          ▲               ▲               ▲
//!     worker 0        worker 1        worker 2      (round-robin picks)
//!          │
//!          └─► ctx.dispatch.try_lock() ──► reader.poll() ──► handler(event)
//! ```
//!
//! - A worker holds the registry lock only long enough to advance the cursor
//!   and clone the context's `Arc`. Handlers never run under it.
//! - Each context has its own dispatch mutex, claimed with `try_lock`. A
//!   handler is never invoked by two workers at once, so per-handler order is
//!   the stream's order.
//! - Contexts live in an arena addressed by [`HandlerId`] (slot index plus
//!   generation), so a stale id never removes a newer handler.
//!
//! ## Failure Protocol
//!
//! | Action | Effect |
//! |--------|--------|
//! | `Continue` | log, skip the event, move on |
//! | `Retry` | log, dispatch the same event again |
//! | `Fail` | mark invalid, unlink, log at error |
//!
//! A panicking handler counts as a failure. The default policy is `Fail`.
//!
//! ## Removal
//!
//! Removing a handler flips its `valid` flag before it is unlinked. A worker
//! that already claimed the context finishes its current event, but no
//! worker will dispatch to it again.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::config::NotifierConfig;
use crate::error::Result;
use crate::reader::EventReader;
use crate::types::{AppendedEventMessage, StreamName};

// =============================================================================
// Handlers
// =============================================================================

/// Error type handlers return.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// What to do after a handler failed on an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventHandlerAction {
    /// Skip the event.
    Continue,
    /// Dispatch the same event again.
    Retry,
    /// Remove the handler.
    Fail,
}

impl FromStr for EventHandlerAction {
    type Err = std::convert::Infallible;

    /// Case-insensitive. Anything unrecognized is `Fail`.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s.to_ascii_uppercase().as_str() {
            "CONTINUE" => EventHandlerAction::Continue,
            "RETRY" => EventHandlerAction::Retry,
            _ => EventHandlerAction::Fail,
        })
    }
}

impl fmt::Display for EventHandlerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EventHandlerAction::Continue => "CONTINUE",
            EventHandlerAction::Retry => "RETRY",
            EventHandlerAction::Fail => "FAIL",
        })
    }
}

type OnEvent = Box<dyn FnMut(&AppendedEventMessage) -> std::result::Result<(), HandlerError> + Send>;
type OnFailure = Box<dyn FnMut(&AppendedEventMessage, &HandlerError) -> EventHandlerAction + Send>;

/// A named event callback plus its failure policy.
///
/// # Example
///
/// ```rust,ignore
/// let handler = EventHandler::new("projector", |event| {
///     project(event)?;
///     Ok(())
/// })
/// .on_failure(|_, _| EventHandlerAction::Retry);
/// stream.add_handler(handler);
/// ```
pub struct EventHandler {
    name: String,
    on_event: OnEvent,
    on_failure: Option<OnFailure>,
}

impl EventHandler {
    /// A handler that is removed on its first failure.
    pub fn new<F>(name: impl Into<String>, on_event: F) -> Self
    where
        F: FnMut(&AppendedEventMessage) -> std::result::Result<(), HandlerError> + Send + 'static,
    {
        Self {
            name: name.into(),
            on_event: Box::new(on_event),
            on_failure: None,
        }
    }

    /// Sets the failure policy.
    pub fn on_failure<F>(mut self, on_failure: F) -> Self
    where
        F: FnMut(&AppendedEventMessage, &HandlerError) -> EventHandlerAction + Send + 'static,
    {
        self.on_failure = Some(Box::new(on_failure));
        self
    }

    /// The handler's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn invoke(&mut self, event: &AppendedEventMessage) -> std::result::Result<(), HandlerError> {
        match catch_unwind(AssertUnwindSafe(|| (self.on_event)(event))) {
            Ok(result) => result,
            Err(panic) => Err(panic_message(panic).into()),
        }
    }

    fn failure_action(&mut self, event: &AppendedEventMessage, err: &HandlerError) -> EventHandlerAction {
        let Some(on_failure) = self.on_failure.as_mut() else {
            return EventHandlerAction::Fail;
        };
        catch_unwind(AssertUnwindSafe(|| on_failure(event, err))).unwrap_or(EventHandlerAction::Fail)
    }
}

impl fmt::Debug for EventHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHandler").field("name", &self.name).finish_non_exhaustive()
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".to_string()
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Handle to a registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId {
    index: usize,
    generation: u64,
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

struct Dispatch {
    reader: Box<dyn EventReader>,
    handler: EventHandler,
}

struct HandlerContext {
    id: HandlerId,
    name: String,
    stream: StreamName,
    valid: AtomicBool,
    dispatch: Mutex<Dispatch>,
}

#[derive(Default)]
struct Slot {
    generation: u64,
    context: Option<Arc<HandlerContext>>,
}

#[derive(Default)]
struct Registry {
    slots: Vec<Slot>,
    free: Vec<usize>,
    cursor: usize,
    live: usize,
}

impl Registry {
    fn insert(&mut self, reader: Box<dyn EventReader>, handler: EventHandler) -> Arc<HandlerContext> {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot::default());
                self.slots.len() - 1
            }
        };
        let slot = &mut self.slots[index];
        slot.generation += 1;
        let context = Arc::new(HandlerContext {
            id: HandlerId {
                index,
                generation: slot.generation,
            },
            name: handler.name().to_string(),
            stream: reader.stream().name().clone(),
            valid: AtomicBool::new(true),
            dispatch: Mutex::new(Dispatch { reader, handler }),
        });
        slot.context = Some(Arc::clone(&context));
        self.live += 1;
        context
    }

    fn unlink(&mut self, id: HandlerId) -> Option<Arc<HandlerContext>> {
        let slot = self.slots.get_mut(id.index)?;
        if slot.generation != id.generation {
            return None;
        }
        let context = slot.context.take()?;
        context.valid.store(false, Ordering::Release);
        self.free.push(id.index);
        self.live -= 1;
        Some(context)
    }

    /// Next live context in round-robin order.
    fn next(&mut self) -> Option<Arc<HandlerContext>> {
        let len = self.slots.len();
        for _ in 0..len {
            let index = self.cursor % len;
            self.cursor = (index + 1) % len;
            if let Some(context) = &self.slots[index].context {
                return Some(Arc::clone(context));
            }
        }
        None
    }

    fn clear(&mut self) -> usize {
        let mut cleared = 0;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Some(context) = slot.context.take() {
                context.valid.store(false, Ordering::Release);
                self.free.push(index);
                cleared += 1;
            }
        }
        self.live = 0;
        cleared
    }
}

// =============================================================================
// Workers
// =============================================================================

struct Shared {
    channel: String,
    idle_backoff: Duration,
    poll_timeout: Duration,
    registry: Mutex<Registry>,
}

impl Shared {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Delivers at most one event to `context`. Returns true if an event was
    /// consumed.
    fn notify_next(&self, context: &HandlerContext, keep_running: &AtomicBool) -> bool {
        if !context.valid.load(Ordering::Acquire) {
            return false;
        }
        let mut dispatch = match context.dispatch.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(e)) => e.into_inner(),
            Err(TryLockError::WouldBlock) => return false,
        };
        if !context.valid.load(Ordering::Acquire) {
            return false;
        }
        let Dispatch { reader, handler } = &mut *dispatch;

        let polled = if self.poll_timeout.is_zero() {
            reader.poll()
        } else {
            reader.poll_timeout(self.poll_timeout)
        };
        let event = match polled {
            Ok(Some(event)) => event,
            Ok(None) => return false,
            Err(e) => {
                error!(stream = %context.stream, handler = %context.name, error = %e, "reader failed");
                return false;
            }
        };
        // Removed while waiting on the reader.
        if !context.valid.load(Ordering::Acquire) {
            return false;
        }

        loop {
            let err = match handler.invoke(&event) {
                Ok(()) => {
                    if let Err(e) = reader.ok() {
                        warn!(stream = %context.stream, handler = %context.name, error = %e, "acknowledgement failed");
                    }
                    return true;
                }
                Err(err) => err,
            };

            match handler.failure_action(&event, &err) {
                EventHandlerAction::Continue => {
                    warn!(
                        stream = %context.stream,
                        handler = %context.name,
                        sequence = %event.sequence,
                        error = %err,
                        "handler failed, continuing past event"
                    );
                    if let Err(e) = reader.skip() {
                        warn!(stream = %context.stream, handler = %context.name, error = %e, "skip failed");
                    }
                    return true;
                }
                EventHandlerAction::Retry => {
                    warn!(
                        stream = %context.stream,
                        handler = %context.name,
                        sequence = %event.sequence,
                        error = %err,
                        "handler failed, retrying event"
                    );
                    if !keep_running.load(Ordering::Acquire) || !context.valid.load(Ordering::Acquire) {
                        return true;
                    }
                }
                EventHandlerAction::Fail => {
                    context.valid.store(false, Ordering::Release);
                    error!(
                        stream = %context.stream,
                        handler = %context.name,
                        sequence = %event.sequence,
                        error = %err,
                        "handler failed, removing it"
                    );
                    self.registry().unlink(context.id);
                    return true;
                }
            }
        }
    }
}

fn run_worker(shared: Arc<Shared>, keep_running: Arc<AtomicBool>) {
    let mut idle = 0usize;
    while keep_running.load(Ordering::Acquire) {
        let (context, live) = {
            let mut registry = shared.registry();
            (registry.next(), registry.live)
        };
        let delivered = match context {
            Some(context) => shared.notify_next(&context, &keep_running),
            None => false,
        };
        if delivered {
            idle = 0;
            continue;
        }
        idle += 1;
        // A full round without work: back off.
        if idle >= live.max(1) {
            idle = 0;
            thread::sleep(shared.idle_backoff);
        }
    }
}

struct Worker {
    keep_running: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl Worker {
    fn stop(self) {
        self.keep_running.store(false, Ordering::Release);
        if self.thread.thread().id() == thread::current().id() {
            return;
        }
        if self.thread.join().is_err() {
            error!("notifier worker panicked");
        }
    }
}

// =============================================================================
// Notifier
// =============================================================================

/// A worker pool delivering events to handlers.
pub struct AsyncHandlerNotifier {
    shared: Arc<Shared>,
    workers: Mutex<Vec<Worker>>,
    spawned: AtomicUsize,
}

impl AsyncHandlerNotifier {
    /// Starts `config.threads` workers.
    ///
    /// # Errors
    ///
    /// `Error::Io` if a worker thread cannot be spawned.
    pub fn new(channel: &str, config: &NotifierConfig) -> Result<Self> {
        let notifier = Self {
            shared: Arc::new(Shared {
                channel: channel.to_string(),
                idle_backoff: config.idle_backoff,
                poll_timeout: config.poll_timeout,
                registry: Mutex::new(Registry::default()),
            }),
            workers: Mutex::new(Vec::new()),
            spawned: AtomicUsize::new(0),
        };
        notifier.set_num_threads(config.threads)?;
        Ok(notifier)
    }

    fn workers(&self) -> MutexGuard<'_, Vec<Worker>> {
        self.workers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn spawn_worker(&self) -> Result<Worker> {
        let n = self.spawned.fetch_add(1, Ordering::Relaxed);
        let keep_running = Arc::new(AtomicBool::new(true));
        let shared = Arc::clone(&self.shared);
        let flag = Arc::clone(&keep_running);
        let thread = thread::Builder::new()
            .name(format!("canonlog-notifier-{}-{n}", self.shared.channel))
            .spawn(move || run_worker(shared, flag))?;
        Ok(Worker { keep_running, thread })
    }

    /// Grows or shrinks the pool one worker at a time. Workers being removed
    /// finish their current dispatch first.
    pub fn set_num_threads(&self, threads: usize) -> Result<()> {
        let retired: Vec<Worker> = {
            let mut workers = self.workers();
            while workers.len() < threads {
                let worker = self.spawn_worker()?;
                workers.push(worker);
            }
            let keep = threads.min(workers.len());
            workers.drain(keep..).collect()
        };
        for worker in retired {
            worker.stop();
        }
        info!(channel = %self.shared.channel, threads, "notifier pool resized");
        Ok(())
    }

    /// Current pool size.
    pub fn num_threads(&self) -> usize {
        self.workers().len()
    }

    /// Registers `handler`, fed by `reader`.
    pub fn register(&self, reader: Box<dyn EventReader>, handler: EventHandler) -> HandlerId {
        let context = self.shared.registry().insert(reader, handler);
        debug!(
            stream = %context.stream,
            handler = %context.name,
            id = %context.id,
            "handler registered"
        );
        context.id
    }

    /// Unregisters a handler. Returns false if the id is stale.
    pub fn remove(&self, id: HandlerId) -> bool {
        let removed = self.shared.registry().unlink(id);
        if let Some(context) = &removed {
            debug!(stream = %context.stream, handler = %context.name, "handler removed");
        }
        removed.is_some()
    }

    /// True if `id` still refers to a registered handler.
    pub fn contains(&self, id: HandlerId) -> bool {
        let registry = self.shared.registry();
        registry
            .slots
            .get(id.index)
            .map_or(false, |s| s.generation == id.generation && s.context.is_some())
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.shared.registry().live
    }

    /// True if no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops every worker and drops every handler. Idempotent.
    pub fn stop(&self) {
        let workers: Vec<Worker> = self.workers().drain(..).collect();
        for worker in workers {
            worker.stop();
        }
        let cleared = self.shared.registry().clear();
        if cleared > 0 {
            debug!(channel = %self.shared.channel, handlers = cleared, "notifier stopped");
        }
    }
}

impl Drop for AsyncHandlerNotifier {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for AsyncHandlerNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncHandlerNotifier")
            .field("channel", &self.shared.channel)
            .field("threads", &self.num_threads())
            .field("handlers", &self.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Instant;

    use super::*;
    use crate::channel::Channel;
    use crate::stream::Stream;

    fn commit(stream: &Arc<Stream>, types: &[&str]) {
        let mut appender = stream.appender();
        for ty in types {
            appender.create(*ty).add().unwrap();
        }
        appender.commit().wait().unwrap();
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_action_parsing_defaults_to_fail() {
        assert_eq!("continue".parse::<EventHandlerAction>().unwrap(), EventHandlerAction::Continue);
        assert_eq!("RETRY".parse::<EventHandlerAction>().unwrap(), EventHandlerAction::Retry);
        assert_eq!("explode".parse::<EventHandlerAction>().unwrap(), EventHandlerAction::Fail);
    }

    #[test]
    fn test_handler_sees_events_in_order() {
        let channel = Channel::in_memory("notifier-tests").unwrap();
        let stream = channel.get_or_create_stream("orders").unwrap();
        let (tx, rx) = mpsc::channel();

        stream.add_handler(EventHandler::new("collect", move |e| {
            tx.send(e.event_type.clone())?;
            Ok(())
        }));
        commit(&stream, &["A", "B"]);
        commit(&stream, &["C"]);

        let seen: Vec<String> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(seen, vec!["A", "B", "C"]);
    }

    #[test]
    fn test_retry_redelivers_same_event() {
        let channel = Channel::in_memory("notifier-tests").unwrap();
        let stream = channel.get_or_create_stream("orders").unwrap();
        let (tx, rx) = mpsc::channel();
        let mut attempts = 0;

        stream.add_handler(
            EventHandler::new("flaky", move |e| {
                attempts += 1;
                tx.send((e.event_type.clone(), attempts))?;
                if attempts < 3 {
                    return Err("not yet".into());
                }
                Ok(())
            })
            .on_failure(|_, _| EventHandlerAction::Retry),
        );
        commit(&stream, &["A"]);

        let seen: Vec<(String, i32)> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(seen, vec![("A".into(), 1), ("A".into(), 2), ("A".into(), 3)]);
    }

    #[test]
    fn test_panicking_handler_is_removed_by_default() {
        let channel = Channel::in_memory("notifier-tests").unwrap();
        let stream = channel.get_or_create_stream("orders").unwrap();

        let id = stream.add_handler(EventHandler::new("boom", |_| panic!("bad event")));
        commit(&stream, &["A"]);

        assert!(wait_until(|| !channel.notifier().contains(id)));
        assert!(!stream.remove_handler(id));
    }

    #[test]
    fn test_removed_handler_not_invoked() {
        let channel = Channel::in_memory("notifier-tests").unwrap();
        let stream = channel.get_or_create_stream("orders").unwrap();
        let (tx, rx) = mpsc::channel();

        let id = stream.add_handler(EventHandler::new("gone", move |e| {
            tx.send(e.event_type.clone())?;
            Ok(())
        }));
        assert!(stream.remove_handler(id));
        commit(&stream, &["A"]);

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_stale_id_does_not_remove_new_handler() {
        let channel = Channel::in_memory("notifier-tests").unwrap();
        let stream = channel.get_or_create_stream("orders").unwrap();

        let first = stream.add_handler(EventHandler::new("one", |_| Ok(())));
        assert!(stream.remove_handler(first));
        let second = stream.add_handler(EventHandler::new("two", |_| Ok(())));

        assert!(!stream.remove_handler(first));
        assert!(channel.notifier().contains(second));
        assert_eq!(channel.notifier().len(), 1);
    }

    #[test]
    fn test_resize_pool() {
        let channel = Channel::in_memory("notifier-tests").unwrap();
        let notifier = channel.notifier();
        assert_eq!(notifier.num_threads(), crate::config::DEFAULT_NOTIFIER_THREADS);

        notifier.set_num_threads(5).unwrap();
        assert_eq!(notifier.num_threads(), 5);
        notifier.set_num_threads(1).unwrap();
        assert_eq!(notifier.num_threads(), 1);

        let stream = channel.get_or_create_stream("orders").unwrap();
        let (tx, rx) = mpsc::channel();
        stream.add_handler(EventHandler::new("after-resize", move |e| {
            tx.send(e.event_type.clone())?;
            Ok(())
        }));
        commit(&stream, &["A"]);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "A");
    }
}
