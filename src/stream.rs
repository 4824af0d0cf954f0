//! # Streams
//!
//! A [`Stream`] is one named, append-only, totally ordered event log. It owns:
//!
//! - the committed event list, guarded by a single read-write lock
//! - a sequencer that assigns order keys at commit
//! - the [`EventStore`] that makes commits durable
//! - a stream-level codec resolver (falls back to the channel's)
//!
//! ## Locking
//!
//! ```text
//!   readers ──read lock──►  ┌──────────────────────┐  ◄──write lock── committer
//!                           │ StreamLog            │                 (writer thread,
//!                           │  events: Vec<Arc<…>> │                  import, sanitize)
//!                           │  index: seq → idx    │
//!                           └──────────────────────┘
//!   take()/poll_timeout() wait on a separate Mutex + Condvar, notified after
//!   every publish, so blocked readers never hold the read lock.
//! ```
//!
//! The write lock is held across tail check, sequencing, persistence and
//! publication. That single critical section is what makes a conditional
//! commit atomic with respect to every other committer on the stream.
//!
//! ## Memory Lags Disk
//!
//! Events become visible to readers only after the store accepted them. A
//! failed `persist` leaves the list, the index and the tail untouched.
//!
//! ## Replication Intake
//!
//! [`Stream::import`] accepts events that were sequenced elsewhere. An event
//! at an occupied sequence with different content is a collision: it goes to
//! the channel's arbitor, and the resolution is applied back here by
//! [`Stream::apply_resolution`].

use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::admin::{AdminEvent, EventSanitized, SanitizeEvent};
use crate::channel::ChannelServices;
use crate::codec::{Codec, CodecResolver};
use crate::collision::{CollisionId, CollisionResolution, EventCollision};
use crate::durable::DurableReader;
use crate::error::{Error, Result};
use crate::notifier::{EventHandler, HandlerId};
use crate::reader::{EventReader, StreamReader};
use crate::sequencer::EventSequencer;
use crate::store::EventStore;
use crate::transaction::TransactionalAppender;
use crate::types::{
    current_time_ms, AppendedEventMessage, ChannelName, EventMessage, EventSequence, ReaderId,
    StreamName, TransactionId, HEADER_CODEC, HEADER_COLLISION, HEADER_SANITIZED,
    HEADER_TRANSACTION,
};
use crate::writer::CommitBatch;

// =============================================================================
// Log
// =============================================================================

#[derive(Default)]
struct StreamLog {
    events: Vec<Arc<AppendedEventMessage>>,
    index: HashMap<EventSequence, usize>,
}

impl StreamLog {
    fn tail(&self) -> Option<&EventSequence> {
        self.events.last().map(|e| &e.sequence)
    }

    fn push(&mut self, event: Arc<AppendedEventMessage>) {
        self.index.insert(event.sequence.clone(), self.events.len());
        self.events.push(event);
    }
}

/// What [`Stream::import`] did with an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportOutcome {
    /// Same content already present at that sequence.
    Duplicate,
    /// Appended at the tail.
    Appended(Arc<AppendedEventMessage>),
    /// Conflicted with an existing event and went to arbitration.
    Collision {
        /// Arbitor-assigned id.
        id: CollisionId,
        /// Arbitration outcome (`Manual` while pending).
        resolution: CollisionResolution,
    },
}

// =============================================================================
// Stream
// =============================================================================

/// One named event stream.
pub struct Stream {
    name: StreamName,
    log: RwLock<StreamLog>,
    signal: Mutex<()>,
    arrived: Condvar,
    sequencer: Box<dyn EventSequencer>,
    store: Arc<dyn EventStore>,
    codecs: Arc<CodecResolver>,
    services: Arc<ChannelServices>,
    closed: AtomicBool,
}

impl Stream {
    /// Loads a stream from its store.
    ///
    /// Every recovered sequence is fed to the sequencer so new commits order
    /// after them.
    pub(crate) fn open(
        name: StreamName,
        store: Arc<dyn EventStore>,
        sequencer: Box<dyn EventSequencer>,
        codecs: Arc<CodecResolver>,
        services: Arc<ChannelServices>,
    ) -> Result<Arc<Self>> {
        let recovered = store.load().map_err(|e| Error::StreamInitialization {
            stream: name.to_string(),
            reason: e.to_string(),
        })?;

        let mut log = StreamLog::default();
        for event in recovered {
            sequencer.observe(&event.sequence);
            log.push(Arc::new(event));
        }
        if !log.events.is_empty() {
            debug!(stream = %name, events = log.events.len(), "recovered stream");
        }

        Ok(Arc::new(Self {
            name,
            log: RwLock::new(log),
            signal: Mutex::new(()),
            arrived: Condvar::new(),
            sequencer,
            store,
            codecs,
            services,
            closed: AtomicBool::new(false),
        }))
    }

    fn read(&self) -> RwLockReadGuard<'_, StreamLog> {
        self.log.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, StreamLog> {
        self.log.write().unwrap_or_else(|e| e.into_inner())
    }

    // =========================================================================
    // Identity & Snapshot Reads
    // =========================================================================

    /// The stream name.
    pub fn name(&self) -> &StreamName {
        &self.name
    }

    /// The owning channel's name.
    pub fn channel(&self) -> &ChannelName {
        self.services.name()
    }

    /// Number of committed events.
    pub fn len(&self) -> usize {
        self.read().events.len()
    }

    /// True if nothing was committed yet.
    pub fn is_empty(&self) -> bool {
        self.read().events.is_empty()
    }

    /// Sequence of the most recent committed event.
    pub fn last_event_id(&self) -> Option<EventSequence> {
        self.read().tail().cloned()
    }

    /// Looks up a committed event by sequence.
    pub fn get(&self, sequence: &EventSequence) -> Option<Arc<AppendedEventMessage>> {
        let log = self.read();
        log.index.get(sequence).map(|&i| Arc::clone(&log.events[i]))
    }

    /// Snapshot of all committed events in order.
    pub fn events(&self) -> Vec<Arc<AppendedEventMessage>> {
        self.read().events.clone()
    }

    /// Orders two sequences of this stream.
    pub fn compare(&self, a: &EventSequence, b: &EventSequence) -> CmpOrdering {
        self.sequencer.compare(a, b)
    }

    pub(crate) fn event_at(&self, index: usize) -> Option<Arc<AppendedEventMessage>> {
        self.read().events.get(index).cloned()
    }

    pub(crate) fn index_of(&self, sequence: &EventSequence) -> Option<usize> {
        self.read().index.get(sequence).copied()
    }

    /// True once the channel closed this stream.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    // =========================================================================
    // Codecs
    // =========================================================================

    /// The stream-level resolver.
    pub fn codecs(&self) -> &Arc<CodecResolver> {
        &self.codecs
    }

    /// Registers a stream-level codec, overriding the channel's for the types
    /// it supports.
    pub fn use_codec(&self, codec: Arc<dyn Codec>) {
        self.codecs.register(codec);
    }

    /// Decodes an event of this stream with the stream's codec chain.
    pub fn decode(&self, event: &AppendedEventMessage) -> Result<serde_json::Value> {
        self.codecs.decode(event)
    }

    // =========================================================================
    // Factories
    // =========================================================================

    /// A new appender for this stream.
    pub fn appender(self: &Arc<Self>) -> TransactionalAppender {
        TransactionalAppender::new(
            Arc::clone(self),
            self.services.writer().clone(),
            self.services.ids(),
            false,
        )
    }

    /// An appender allowed to write engine-owned event types.
    pub(crate) fn system_appender(self: &Arc<Self>) -> TransactionalAppender {
        TransactionalAppender::new(
            Arc::clone(self),
            self.services.writer().clone(),
            self.services.ids(),
            true,
        )
    }

    /// A reader positioned before the first event.
    pub fn reader(self: &Arc<Self>) -> StreamReader {
        StreamReader::new(Arc::clone(self))
    }

    /// A reader positioned after `position` (`None` = start).
    ///
    /// # Errors
    ///
    /// `Error::UnknownEvent` if `position` is not on this stream.
    pub fn reader_from(self: &Arc<Self>, position: Option<EventSequence>) -> Result<StreamReader> {
        let mut reader = self.reader();
        reader.set_position(position)?;
        Ok(reader)
    }

    /// A durable reader resuming from the channel's tracked position for `id`.
    pub fn durable_reader(self: &Arc<Self>, id: impl Into<ReaderId>) -> Result<DurableReader<StreamReader>> {
        DurableReader::open(self.reader(), id.into(), self.services.tracker())
    }

    // =========================================================================
    // Handlers
    // =========================================================================

    /// Registers a handler that sees every event from the start of the stream.
    pub fn add_handler(self: &Arc<Self>, handler: EventHandler) -> HandlerId {
        self.services
            .notifier()
            .register(Box::new(self.reader()), handler)
    }

    /// Registers a handler fed by a durable reader, so acknowledged progress
    /// survives restarts.
    pub fn add_durable_handler(
        self: &Arc<Self>,
        id: impl Into<ReaderId>,
        handler: EventHandler,
    ) -> Result<HandlerId> {
        let reader = self.durable_reader(id)?;
        Ok(self.services.notifier().register(Box::new(reader), handler))
    }

    /// Registers a handler with a caller-built reader.
    pub fn add_handler_with(&self, reader: Box<dyn EventReader>, handler: EventHandler) -> HandlerId {
        self.services.notifier().register(reader, handler)
    }

    /// Unregisters a handler. Returns false if it was already gone.
    pub fn remove_handler(&self, id: HandlerId) -> bool {
        self.services.notifier().remove(id)
    }

    // =========================================================================
    // Commit
    // =========================================================================

    /// Commits a batch atomically. Runs on the channel's writer thread.
    pub(crate) fn commit(&self, batch: &CommitBatch) -> Result<Vec<Arc<AppendedEventMessage>>> {
        let mut log = self.write();
        if self.is_closed() {
            return Err(Error::append(self.name.as_str(), "stream is closed"));
        }

        let tail = log.tail().cloned();
        if let Some(expected) = &batch.previous {
            if tail.as_ref() != Some(expected) {
                return Err(Error::AppendOutOfSequence {
                    stream: self.name.to_string(),
                    expected: expected.to_string(),
                    actual: tail.map(|t| t.to_string()),
                });
            }
        }

        let mut prepared = Vec::with_capacity(batch.messages.len());
        for message in &batch.messages {
            let codec = batch
                .codecs
                .resolve(&message.event_type)
                .map_err(|e| Error::append(self.name.as_str(), e))?;
            let mut message = message.clone();
            message.set_system_header(HEADER_CODEC, codec.name());
            message.set_system_header(HEADER_TRANSACTION, batch.transaction.as_str());
            prepared.push(message);
        }

        let committed = self.append_locked(&mut log, prepared, tail)?;
        drop(log);
        self.notify();
        Ok(committed)
    }

    /// Sequences and publishes under the write lock. On failure the sequencer
    /// is rewound to `tail`, so the next commit carries on without a gap.
    fn append_locked(
        &self,
        log: &mut StreamLog,
        messages: Vec<EventMessage>,
        tail: Option<EventSequence>,
    ) -> Result<Vec<Arc<AppendedEventMessage>>> {
        let result = self
            .sequence_batch(log, messages, tail.clone())
            .and_then(|committed| {
                self.publish(log, committed.clone())?;
                Ok(committed)
            });
        if result.is_err() {
            self.sequencer.release(tail.as_ref());
        }
        result
    }

    /// Assigns sequences and previous links. Nothing is published.
    fn sequence_batch(
        &self,
        log: &StreamLog,
        messages: Vec<EventMessage>,
        mut previous: Option<EventSequence>,
    ) -> Result<Vec<Arc<AppendedEventMessage>>> {
        let now = current_time_ms();
        let mut committed: Vec<Arc<AppendedEventMessage>> = Vec::with_capacity(messages.len());

        for message in messages {
            let sequence = self
                .sequencer
                .next(&message, previous.as_ref())
                .map_err(|e| match e {
                    Error::StreamAppend { reason, .. } => Error::append(self.name.as_str(), reason),
                    other => other,
                })?;
            if log.index.contains_key(&sequence) || committed.iter().any(|e| e.sequence == sequence) {
                return Err(Error::append(
                    self.name.as_str(),
                    format!("sequence {sequence} is already in use"),
                ));
            }
            let event = AppendedEventMessage::from_message(
                message,
                self.name.clone(),
                sequence.clone(),
                previous.take(),
                now,
            );
            previous = Some(sequence);
            committed.push(Arc::new(event));
        }
        Ok(committed)
    }

    /// Persists and then makes events visible. Caller holds the write lock.
    fn publish(&self, log: &mut StreamLog, events: Vec<Arc<AppendedEventMessage>>) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        self.store.persist(&events).map_err(|e| {
            warn!(stream = %self.name, error = %e, "persist failed, transaction aborted");
            Error::append(self.name.as_str(), format!("persist failed: {e}"))
        })?;
        for event in events {
            log.push(event);
        }
        Ok(())
    }

    /// Wakes readers blocked in `take()`/`poll_timeout()`.
    fn notify(&self) {
        let _guard = self.signal.lock().unwrap_or_else(|e| e.into_inner());
        self.arrived.notify_all();
    }

    /// Blocks until an event exists at `index`, the deadline passes, or the
    /// stream closes. Returns true if the event exists.
    pub(crate) fn wait_for(&self, index: usize, deadline: Option<Instant>) -> bool {
        let mut guard = self.signal.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if self.read().events.len() > index {
                return true;
            }
            if self.is_closed() {
                return false;
            }
            match deadline {
                None => {
                    guard = self.arrived.wait(guard).unwrap_or_else(|e| e.into_inner());
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    guard = self
                        .arrived
                        .wait_timeout(guard, deadline - now)
                        .unwrap_or_else(|e| e.into_inner())
                        .0;
                }
            }
        }
    }

    // =========================================================================
    // Sanitization
    // =========================================================================

    /// Replaces an event's content with nothing, keeping its position.
    ///
    /// Publishes `SanitizeEvent` before and `EventSanitized` after the
    /// replacement to the channel's admin stream.
    ///
    /// # Errors
    ///
    /// - `Error::ReservedName` for engine-owned streams
    /// - `Error::UnknownEvent` if `sequence` is not on this stream
    pub fn sanitize(
        &self,
        sequence: &EventSequence,
        justification: &str,
    ) -> Result<Arc<AppendedEventMessage>> {
        if self.name.is_reserved() {
            return Err(Error::ReservedName(self.name.to_string()));
        }
        if self.index_of(sequence).is_none() {
            return Err(self.unknown(sequence));
        }

        self.services.publish_admin(AdminEvent::SanitizeEvent(SanitizeEvent {
            stream: self.name.to_string(),
            event_id: sequence.clone(),
            justification: justification.to_string(),
        }))?;

        let sanitized = {
            let mut log = self.write();
            let index = *log.index.get(sequence).ok_or_else(|| self.unknown(sequence))?;
            let mut event = log.events[index].as_ref().clone();
            event.content.clear();
            event.headers.insert(HEADER_SANITIZED.to_string(), justification.to_string());
            self.store
                .replace(&event)
                .map_err(|e| Error::append(self.name.as_str(), format!("sanitize failed: {e}")))?;
            let event = Arc::new(event);
            log.events[index] = Arc::clone(&event);
            event
        };

        self.services.publish_admin(AdminEvent::EventSanitized(EventSanitized {
            stream: self.name.to_string(),
            event_id: sequence.clone(),
            justification: justification.to_string(),
        }))?;

        info!(stream = %self.name, sequence = %sequence, "sanitized event");
        Ok(sanitized)
    }

    fn unknown(&self, sequence: &EventSequence) -> Error {
        Error::UnknownEvent {
            stream: self.name.to_string(),
            sequence: sequence.to_string(),
        }
    }

    // =========================================================================
    // Replication Intake & Collision Application
    // =========================================================================

    /// Accepts an event sequenced elsewhere.
    ///
    /// - same content at an existing sequence: [`ImportOutcome::Duplicate`]
    /// - different content at an existing sequence: a collision, arbitrated
    /// - a sequence ordering after the tail: appended as-is
    ///
    /// # Errors
    ///
    /// `Error::StreamAppend` if the event belongs to another stream or its
    /// sequence orders before the tail without existing here.
    pub fn import(&self, event: AppendedEventMessage) -> Result<ImportOutcome> {
        if event.stream != self.name {
            return Err(Error::append(
                self.name.as_str(),
                format!("event belongs to stream '{}'", event.stream),
            ));
        }
        if !self.sequencer.accepts(&event.sequence) {
            return Err(Error::append(
                self.name.as_str(),
                format!("sequence {} cannot be ordered on this stream", event.sequence),
            ));
        }

        let first = {
            let mut log = self.write();
            match log.index.get(&event.sequence) {
                Some(&index) => Arc::clone(&log.events[index]),
                None => {
                    if let Some(tail) = log.tail() {
                        if self.sequencer.compare(tail, &event.sequence) != CmpOrdering::Less {
                            return Err(Error::append(
                                self.name.as_str(),
                                format!(
                                    "imported sequence {} orders before the tail {tail}",
                                    event.sequence
                                ),
                            ));
                        }
                    }
                    let tail = log.tail().cloned();
                    self.sequencer.observe(&event.sequence);
                    let event = Arc::new(event);
                    if let Err(e) = self.publish(&mut log, vec![Arc::clone(&event)]) {
                        self.sequencer.release(tail.as_ref());
                        return Err(e);
                    }
                    drop(log);
                    self.notify();
                    return Ok(ImportOutcome::Appended(event));
                }
            }
        };

        if first.content_digest() == event.content_digest() {
            return Ok(ImportOutcome::Duplicate);
        }

        // Arbitrate outside the lock: the resolution listener calls back into
        // this stream.
        let collision = EventCollision::new(self.name.clone(), first, Arc::new(event));
        let (id, resolution) = self.services.arbitor().arbitrate(collision);
        Ok(ImportOutcome::Collision { id, resolution })
    }

    /// Applies a collision resolution to this stream.
    ///
    /// | Resolution | Effect |
    /// |------------|--------|
    /// | `FirstOnly`, `Abstain`, `Manual` | nothing |
    /// | `FirstThenSecond`, `BothNoSequence` | second appended at the tail |
    /// | `SecondOnly` | first sanitized, second appended |
    /// | `SecondThenFirst` | first sanitized, second then first appended |
    pub fn apply_resolution(
        &self,
        id: CollisionId,
        collision: &EventCollision,
        resolution: CollisionResolution,
    ) -> Result<()> {
        let justification = format!("collision {id} resolved {resolution}");
        let appended = match resolution {
            CollisionResolution::FirstOnly
            | CollisionResolution::Abstain
            | CollisionResolution::Manual => return Ok(()),
            CollisionResolution::FirstThenSecond | CollisionResolution::BothNoSequence => {
                self.append_resolved(id, vec![collision.second.to_message()])?
            }
            CollisionResolution::SecondOnly => {
                let second = collision.second.to_message();
                self.sanitize(&collision.first.sequence, &justification)?;
                self.append_resolved(id, vec![second])?
            }
            CollisionResolution::SecondThenFirst => {
                let first = collision.first.to_message();
                let second = collision.second.to_message();
                self.sanitize(&collision.first.sequence, &justification)?;
                self.append_resolved(id, vec![second, first])?
            }
        };
        info!(
            stream = %self.name,
            collision = %id,
            resolution = %resolution,
            appended,
            "applied collision resolution"
        );
        Ok(())
    }

    /// Appends messages recovered from a collision under the write lock,
    /// keeping their original codec header.
    fn append_resolved(&self, id: CollisionId, messages: Vec<EventMessage>) -> Result<usize> {
        let transaction = TransactionId::new(self.services.ids().next_id());
        let messages: Vec<EventMessage> = messages
            .into_iter()
            .map(|mut m| {
                m.headers.remove(HEADER_SANITIZED);
                m.set_system_header(HEADER_TRANSACTION, transaction.as_str());
                m.set_system_header(HEADER_COLLISION, id.to_string());
                m
            })
            .collect();

        let mut log = self.write();
        let tail = log.tail().cloned();
        let count = self.append_locked(&mut log, messages, tail)?.len();
        drop(log);
        self.notify();
        Ok(count)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Refuses further commits and wakes blocked readers.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify();
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("name", &self.name)
            .field("len", &self.len())
            .field("last_event_id", &self.last_event_id())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
