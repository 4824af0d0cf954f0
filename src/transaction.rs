//! # Transactions and the Transactional Appender
//!
//! A [`Transaction`] buffers events for one stream and commits them as a
//! unit. A [`TransactionalAppender`] is the per-caller front end: it keeps a
//! current transaction, auto-creating one when an event is added, and moves
//! on to a fresh one after every commit or rollback.
//!
//! ## State Machine
//!
//! ```text
//!                 commit() ok
//!        ┌──────────────────────────► COMMITTED
//!   ACTIVE
//!        └──────────────────────────► ROLLED_BACK
//!           rollback(), or commit() failed
//! ```
//!
//! The transition happens exactly once. After it:
//!
//! - `commit()` again returns the memoized commit future (same value)
//! - `rollback()` again returns the memoized rollback future
//! - mixing them (`rollback()` after `commit()` or the reverse) fails with
//!   `Error::EventTransaction`
//!
//! While a commit is in flight the transaction is *sealed*: still ACTIVE, but
//! `add()` is refused.
//!
//! ## All or Nothing
//!
//! `add()` checks that a codec resolves the event type, but the check is
//! repeated at commit time on the writer thread: codecs can be removed in
//! between. If any event fails, or the conditional-commit check fails, or the
//! store fails, nothing from the transaction is persisted or published.

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use crate::codec::{Codec, CodecResolver};
use crate::completion::AppendFuture;
use crate::error::{Error, Result};
use crate::stream::Stream;
use crate::types::{
    is_reserved, AppendedEventMessage, EventMessage, EventMessageBuilder, EventSequence, StreamName,
    TransactionId,
};
use crate::writer::{CommitBatch, CommitWriterHandle};

// =============================================================================
// Results
// =============================================================================

/// Lifecycle state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Accepting events (or committing).
    Active,
    /// Committed successfully.
    Committed,
    /// Discarded, explicitly or because the commit failed.
    RolledBack,
}

/// Outcome of a successful commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitResult {
    /// The committed transaction.
    pub transaction: TransactionId,

    /// The stream appended to.
    pub stream: StreamName,

    /// The committed events, in order.
    pub events: Vec<Arc<AppendedEventMessage>>,
}

impl CommitResult {
    /// Sequence of the first committed event.
    pub fn first_sequence(&self) -> Option<&EventSequence> {
        self.events.first().map(|e| &e.sequence)
    }

    /// Sequence of the last committed event; the stream tail right after.
    pub fn last_sequence(&self) -> Option<&EventSequence> {
        self.events.last().map(|e| &e.sequence)
    }

    /// Number of events committed.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// True for a commit of an empty transaction.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Outcome of a rollback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackResult {
    /// The discarded transaction.
    pub transaction: TransactionId,

    /// Number of buffered events discarded.
    pub discarded: usize,
}

// =============================================================================
// Transaction
// =============================================================================

struct TransactionInner {
    state: TransactionState,
    sealed: bool,
    buffer: Vec<EventMessage>,
    commit: Option<AppendFuture<CommitResult>>,
    rollback: Option<AppendFuture<RollbackResult>>,
}

struct TransactionShared {
    id: TransactionId,
    stream: Arc<Stream>,
    writer: CommitWriterHandle,
    codecs: Arc<CodecResolver>,
    system: bool,
    inner: Mutex<TransactionInner>,
}

/// An atomic unit of append against one stream.
///
/// Cheap to clone; clones share state, so a caller can keep a handle and
/// re-invoke `commit()` after the appender moved on.
#[derive(Clone)]
pub struct Transaction {
    shared: Arc<TransactionShared>,
}

impl Transaction {
    pub(crate) fn new(
        id: TransactionId,
        stream: Arc<Stream>,
        writer: CommitWriterHandle,
        codecs: Arc<CodecResolver>,
        system: bool,
    ) -> Self {
        Self {
            shared: Arc::new(TransactionShared {
                id,
                stream,
                writer,
                codecs,
                system,
                inner: Mutex::new(TransactionInner {
                    state: TransactionState::Active,
                    sealed: false,
                    buffer: Vec::new(),
                    commit: None,
                    rollback: None,
                }),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TransactionInner> {
        self.shared.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The transaction id.
    pub fn id(&self) -> &TransactionId {
        &self.shared.id
    }

    /// The target stream.
    pub fn stream(&self) -> &StreamName {
        self.shared.stream.name()
    }

    /// Current state.
    pub fn state(&self) -> TransactionState {
        self.lock().state
    }

    /// True while events can still be added.
    pub fn is_open(&self) -> bool {
        let inner = self.lock();
        inner.state == TransactionState::Active && !inner.sealed
    }

    /// Number of buffered events.
    pub fn len(&self) -> usize {
        self.lock().buffer.len()
    }

    /// True if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.lock().buffer.is_empty()
    }

    /// Buffers an event.
    ///
    /// # Errors
    ///
    /// - `Error::StreamAppend` if the transaction is not open or no codec
    ///   resolves the event type
    /// - `Error::ReservedName` for `canon.*` event types on ordinary streams
    pub fn add(&self, message: EventMessage) -> Result<()> {
        let stream = self.shared.stream.name();
        if !self.shared.system {
            if stream.is_reserved() {
                return Err(Error::ReservedName(stream.to_string()));
            }
            if is_reserved(&message.event_type) {
                return Err(Error::ReservedName(message.event_type));
            }
        }
        if let Err(e) = self.shared.codecs.resolve(&message.event_type) {
            return Err(Error::append(stream.as_str(), e));
        }

        let mut inner = self.lock();
        if inner.state != TransactionState::Active || inner.sealed {
            return Err(Error::append(
                stream.as_str(),
                format!("transaction {} is not active", self.shared.id),
            ));
        }
        inner.buffer.push(message);
        Ok(())
    }

    /// Commits the buffered events.
    pub fn commit(&self) -> AppendFuture<CommitResult> {
        self.submit(None)
    }

    /// Commits only if the stream tail is still `previous`.
    ///
    /// Fails with `Error::AppendOutOfSequence` if another commit got there
    /// first.
    pub fn commit_after(&self, previous: EventSequence) -> AppendFuture<CommitResult> {
        self.submit(Some(previous))
    }

    fn submit(&self, previous: Option<EventSequence>) -> AppendFuture<CommitResult> {
        // The memoized future is installed before the lock is released, so a
        // concurrent commit() can only ever observe it, never submit twice.
        let (response, future, messages) = {
            let mut inner = self.lock();
            if let Some(memoized) = &inner.commit {
                return memoized.clone();
            }
            if inner.state != TransactionState::Active {
                return AppendFuture::ready(
                    self.shared.id.as_str(),
                    Err(self.invalid("commit() after rollback()")),
                );
            }
            let (response, future) = AppendFuture::pending(self.shared.id.as_str());
            inner.sealed = true;
            inner.commit = Some(future.clone());
            (response, future, std::mem::take(&mut inner.buffer))
        };

        let batch = CommitBatch {
            transaction: self.shared.id.clone(),
            messages,
            previous,
            codecs: Arc::clone(&self.shared.codecs),
        };

        // Runs on the writer thread before the future resolves, so anyone who
        // awaited the future observes the terminal state.
        let shared = Arc::clone(&self.shared);
        let hook = Box::new(move |result: &Result<CommitResult>| {
            let mut inner = shared.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.state = match result {
                Ok(_) => TransactionState::Committed,
                Err(_) => TransactionState::RolledBack,
            };
        });

        self.shared
            .writer
            .submit(Arc::clone(&self.shared.stream), batch, hook, response);
        future
    }

    /// Discards the buffered events.
    pub fn rollback(&self) -> AppendFuture<RollbackResult> {
        let mut inner = self.lock();
        if let Some(memoized) = &inner.rollback {
            return memoized.clone();
        }
        if inner.sealed || inner.commit.is_some() {
            return AppendFuture::ready(
                self.shared.id.as_str(),
                Err(self.invalid("rollback() after commit()")),
            );
        }

        let discarded = std::mem::take(&mut inner.buffer).len();
        inner.state = TransactionState::RolledBack;
        let future = AppendFuture::ready(
            self.shared.id.as_str(),
            Ok(RollbackResult {
                transaction: self.shared.id.clone(),
                discarded,
            }),
        );
        inner.rollback = Some(future.clone());
        debug!(
            stream = %self.shared.stream.name(),
            transaction = %self.shared.id,
            discarded,
            "rolled back transaction"
        );
        future
    }

    fn invalid(&self, reason: &str) -> Error {
        Error::EventTransaction {
            transaction: self.shared.id.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("Transaction")
            .field("id", &self.shared.id)
            .field("stream", self.shared.stream.name())
            .field("state", &inner.state)
            .field("buffered", &inner.buffer.len())
            .finish()
    }
}

// =============================================================================
// Pending Event
// =============================================================================

/// A message builder enrolled in a transaction.
///
/// Returned by [`TransactionalAppender::create`]; `add()` builds the message
/// and buffers it in the transaction it was created for.
#[must_use = "a pending event is only buffered once add() is called"]
pub struct PendingEvent {
    builder: EventMessageBuilder,
    transaction: Transaction,
}

impl PendingEvent {
    /// Sets the authorizer id.
    pub fn authorizer(mut self, id: impl Into<String>) -> Self {
        self.builder = self.builder.authorizer(id);
        self
    }

    /// Adds a causal parent.
    pub fn trigger(mut self, id: impl Into<String>) -> Self {
        self.builder = self.builder.trigger(id);
        self
    }

    /// Adds a header.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.builder = self.builder.header(key, value);
        self
    }

    /// Sets pre-encoded content.
    pub fn content(mut self, content: impl Into<Vec<u8>>) -> Self {
        self.builder = self.builder.content(content);
        self
    }

    /// Encodes a value with the transaction's codec chain.
    pub fn encode(mut self, value: &serde_json::Value) -> Self {
        let codecs = Arc::clone(&self.transaction.shared.codecs);
        self.builder = self.builder.encode(&codecs, value);
        self
    }

    /// Builds the message and buffers it.
    pub fn add(self) -> Result<()> {
        let message = self.builder.build()?;
        self.transaction.add(message)
    }

    /// The transaction this event will join.
    pub fn transaction(&self) -> &Transaction {
        &self.transaction
    }
}

// =============================================================================
// Appender
// =============================================================================

/// Per-caller appender for one stream.
///
/// # Example
///
/// ```rust,ignore
/// let mut appender = stream.appender();
/// appender.create("Created").content(b"0123456789".to_vec()).add()?;
/// appender.create("Shipped").add()?;
/// let result = appender.commit().wait()?;
/// assert_eq!(result.len(), 2);
/// ```
pub struct TransactionalAppender {
    stream: Arc<Stream>,
    writer: CommitWriterHandle,
    codecs: Arc<CodecResolver>,
    ids: Arc<dyn crate::types::IdGenerator>,
    system: bool,
    current: Option<Transaction>,
}

impl TransactionalAppender {
    pub(crate) fn new(
        stream: Arc<Stream>,
        writer: CommitWriterHandle,
        ids: Arc<dyn crate::types::IdGenerator>,
        system: bool,
    ) -> Self {
        let codecs = Arc::new(CodecResolver::with_parent(Arc::clone(stream.codecs())));
        Self {
            stream,
            writer,
            codecs,
            ids,
            system,
            current: None,
        }
    }

    /// The target stream.
    pub fn stream(&self) -> &Arc<Stream> {
        &self.stream
    }

    /// Registers a codec that takes priority over the stream's codecs for
    /// every transaction this appender starts.
    pub fn use_codec(&mut self, codec: Arc<dyn Codec>) {
        self.codecs.register(codec);
    }

    /// Returns the open transaction, starting one if needed.
    pub fn begin(&mut self) -> Transaction {
        match &self.current {
            Some(tx) if tx.is_open() => tx.clone(),
            _ => {
                let tx = Transaction::new(
                    TransactionId::new(self.ids.next_id()),
                    Arc::clone(&self.stream),
                    self.writer.clone(),
                    Arc::clone(&self.codecs),
                    self.system,
                );
                self.current = Some(tx.clone());
                tx
            }
        }
    }

    /// The open transaction, if any.
    pub fn transaction(&self) -> Option<&Transaction> {
        self.current.as_ref().filter(|tx| tx.is_open())
    }

    /// Starts an event in the current transaction.
    pub fn create(&mut self, event_type: impl Into<String>) -> PendingEvent {
        PendingEvent {
            builder: EventMessageBuilder::new(event_type),
            transaction: self.begin(),
        }
    }

    /// Buffers a built message in the current transaction.
    pub fn add(&mut self, message: EventMessage) -> Result<()> {
        self.begin().add(message)
    }

    /// Commits the current transaction and moves on to a new one.
    pub fn commit(&mut self) -> AppendFuture<CommitResult> {
        let tx = self.begin();
        self.current = None;
        tx.commit()
    }

    /// Commits the current transaction if the stream tail is `previous`.
    pub fn commit_after(&mut self, previous: EventSequence) -> AppendFuture<CommitResult> {
        let tx = self.begin();
        self.current = None;
        tx.commit_after(previous)
    }

    /// Discards the current transaction and moves on to a new one.
    pub fn rollback(&mut self) -> AppendFuture<RollbackResult> {
        let tx = self.begin();
        self.current = None;
        tx.rollback()
    }
}

impl std::fmt::Debug for TransactionalAppender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionalAppender")
            .field("stream", self.stream.name())
            .field("current", &self.current)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
