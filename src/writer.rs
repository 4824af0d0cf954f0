//! # Commit Writer
//!
//! Every channel runs one commit writer: a dedicated thread that receives
//! commit requests over a bounded channel and executes them one at a time.
//!
//! ```text
//!   Transaction::commit ─┐
//!   Transaction::commit ─┼──► [bounded mpsc] ──► writer thread ──► Stream::commit
//!   Transaction::commit ─┘                           │
//!                                                    └──► oneshot ──► AppendFuture
//! ```
//!
//! ## Why a Thread?
//!
//! Committers never block on persistence: `commit()` enqueues and returns an
//! [`AppendFuture`](crate::completion::AppendFuture). Committers to the *same* stream are additionally
//! serialized by the stream's write lock, which is what makes the
//! optimistic-concurrency check and the append one atomic step.
//!
//! ## Exactly-Once Per Transaction Id
//!
//! The writer remembers the outcome of recent transactions in an LRU cache
//! keyed by transaction id. A request that reuses an id is answered from the
//! cache and never appends again, whether the original commit succeeded or
//! failed.
//!
//! ## Shutdown
//!
//! `shutdown()` enqueues a stop marker behind any pending commits and joins
//! the thread. Requests submitted afterwards fail immediately.

use std::num::NonZeroUsize;
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use lru::LruCache;
use tokio::sync::oneshot;
use tracing::{debug, error, info};

use crate::codec::CodecResolver;
use crate::config::WriterConfig;
use crate::error::{Error, Result};
use crate::stream::Stream;
use crate::transaction::CommitResult;
use crate::types::{EventMessage, EventSequence, TransactionId};

// =============================================================================
// Requests
// =============================================================================

/// The buffered contents of a transaction, ready to commit.
pub(crate) struct CommitBatch {
    /// Transaction id (cache key and `canon.transaction` header).
    pub transaction: TransactionId,

    /// Events in buffering order.
    pub messages: Vec<EventMessage>,

    /// Declared previous event; `Some` makes this a conditional commit.
    pub previous: Option<EventSequence>,

    /// Resolver chain used to re-check codecs at commit time.
    pub codecs: Arc<CodecResolver>,
}

/// Invoked on the writer thread with the outcome, before the future resolves.
pub(crate) type CommitHook = Box<dyn FnOnce(&Result<CommitResult>) + Send>;

enum WriteRequest {
    Commit {
        stream: Arc<Stream>,
        batch: CommitBatch,
        hook: CommitHook,
        response: oneshot::Sender<Result<CommitResult>>,
    },
    Shutdown,
}

// =============================================================================
// Writer (runs on the dedicated thread)
// =============================================================================

struct CommitWriter {
    channel: String,
    results: LruCache<TransactionId, Result<CommitResult>>,
}

impl CommitWriter {
    fn new(channel: String, config: &WriterConfig) -> Self {
        let capacity = NonZeroUsize::new(config.transaction_cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            channel,
            results: LruCache::new(capacity),
        }
    }

    fn execute(&mut self, stream: &Stream, batch: CommitBatch) -> Result<CommitResult> {
        if let Some(cached) = self.results.get(&batch.transaction) {
            debug!(
                channel = %self.channel,
                transaction = %batch.transaction,
                "transaction already executed, returning cached result"
            );
            return cached.clone();
        }

        let result = stream.commit(&batch).map(|events| CommitResult {
            transaction: batch.transaction.clone(),
            stream: stream.name().clone(),
            events,
        });

        match &result {
            Ok(committed) => debug!(
                stream = %stream.name(),
                transaction = %batch.transaction,
                events = committed.events.len(),
                "committed transaction"
            ),
            Err(e) if e.is_out_of_sequence() => debug!(
                stream = %stream.name(),
                transaction = %batch.transaction,
                error = %e,
                "conditional commit rejected"
            ),
            Err(e) => error!(
                stream = %stream.name(),
                transaction = %batch.transaction,
                error = %e,
                "commit failed"
            ),
        }

        self.results.put(batch.transaction, result.clone());
        result
    }
}

fn run_commit_writer(mut writer: CommitWriter, requests: Receiver<WriteRequest>) {
    while let Ok(request) = requests.recv() {
        match request {
            WriteRequest::Commit {
                stream,
                batch,
                hook,
                response,
            } => {
                let result = writer.execute(&stream, batch);
                hook(&result);
                let _ = response.send(result);
            }
            WriteRequest::Shutdown => break,
        }
    }
    info!(channel = %writer.channel, "commit writer stopped");
}

// =============================================================================
// Handle
// =============================================================================

/// Shared handle to a channel's commit writer.
#[derive(Clone)]
pub struct CommitWriterHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    requests: Mutex<Option<SyncSender<WriteRequest>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl CommitWriterHandle {
    /// Spawns the writer thread for `channel`.
    ///
    /// # Errors
    ///
    /// `Error::Io` if the thread cannot be spawned.
    pub fn spawn(channel: &str, config: &WriterConfig) -> Result<Self> {
        let (tx, rx) = mpsc::sync_channel(config.channel_capacity.max(1));
        let writer = CommitWriter::new(channel.to_string(), config);

        let thread = thread::Builder::new()
            .name(format!("canonlog-writer-{channel}"))
            .spawn(move || run_commit_writer(writer, rx))?;

        Ok(Self {
            inner: Arc::new(HandleInner {
                requests: Mutex::new(Some(tx)),
                thread: Mutex::new(Some(thread)),
            }),
        })
    }

    /// Enqueues a commit. Blocks only while the request channel is full.
    ///
    /// `response` always receives exactly one result, even if the writer has
    /// already shut down.
    pub(crate) fn submit(
        &self,
        stream: Arc<Stream>,
        batch: CommitBatch,
        hook: CommitHook,
        response: oneshot::Sender<Result<CommitResult>>,
    ) {
        let sender = self
            .inner
            .requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let request = WriteRequest::Commit {
            stream,
            batch,
            hook,
            response,
        };

        let rejected = match sender {
            Some(sender) => sender.send(request).err().map(|mpsc::SendError(r)| r),
            None => Some(request),
        };

        if let Some(WriteRequest::Commit {
            stream,
            hook,
            response,
            ..
        }) = rejected
        {
            let err = Error::append(stream.name().as_str(), "commit writer has shut down");
            hook(&Err(err.clone()));
            let _ = response.send(Err(err));
        }
    }

    /// True until `shutdown()` was called.
    pub fn is_running(&self) -> bool {
        self.inner
            .requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Drains pending commits and stops the thread. Idempotent.
    pub fn shutdown(&self) {
        let sender = self
            .inner
            .requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(sender) = sender {
            let _ = sender.send(WriteRequest::Shutdown);
        }

        let thread = self
            .inner
            .thread
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(thread) = thread {
            if thread.thread().id() == thread::current().id() {
                // Shutdown requested from a commit hook; the loop exits on its own.
                return;
            }
            if thread.join().is_err() {
                error!("commit writer thread panicked");
            }
        }
    }
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        if let Some(sender) = self.requests.get_mut().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = sender.send(WriteRequest::Shutdown);
        }
    }
}

impl std::fmt::Debug for CommitWriterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitWriterHandle")
            .field("running", &self.is_running())
            .finish()
    }
}
