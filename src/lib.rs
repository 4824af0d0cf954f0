//! # canonlog - Embeddable Event Log Engine
//!
//! canonlog keeps named, append-only, totally ordered event streams grouped
//! into channels. It provides:
//!
//! - **Transactional appends**: all-or-nothing commits with optimistic
//!   concurrency ("append only if the tail is still X")
//! - **Pluggable serialization**: a stream → channel → global codec hierarchy
//! - **Durable consumption**: readers whose acknowledged position survives
//!   restarts, and handlers fed by a worker pool with retry/fail policies
//! - **Collision arbitration**: mediators that decide what to do when two
//!   events claim the same slot
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                  EventLog  (codecs, watcher, providers)         │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │ open_channel("mem://orders")
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │ Channel                                                         │
//! │  ┌──────────┐ ┌──────────┐ ┌────────────┐ ┌──────────────────┐  │
//! │  │ Streams  │ │  Admin   │ │  Notifier  │ │ CollisionArbitor │  │
//! │  │          │ │  stream  │ │ (N workers)│ │  (mediators)     │  │
//! │  └────┬─────┘ └──────────┘ └────────────┘ └──────────────────┘  │
//! │       │  commits                                                │
//! │       ▼                                                         │
//! │  ┌──────────────────────┐                                       │
//! │  │ Commit writer thread │ ──► EventStore (memory | SQLite)      │
//! │  └──────────────────────┘                                       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Total order**: a stream's committed events are ordered and
//!    append-only. Sanitization replaces content, never position.
//! 2. **Atomic commits**: a transaction's events are all published or none is.
//! 3. **Once-only terminal state**: repeated `commit()`/`rollback()` return
//!    the memoized result, never re-execute.
//! 4. **Memory lags disk**: events become visible only after the store
//!    accepted them.
//! 5. **At-least-once**: a durable reader's position only advances on `ok()`.
//!
//! ## Module Organization
//!
//! - [`error`]: The crate-wide error type
//! - [`types`]: Names, sequences, event messages
//! - [`codec`]: Codecs and the hierarchical resolver
//! - [`sequencer`]: Sequence assignment and ordering
//! - [`store`], [`storage`], [`schema`]: Durability backends
//! - [`stream`], [`reader`], [`durable`]: Streams and cursors over them
//! - [`transaction`], [`writer`], [`completion`]: The commit path
//! - [`channel`], [`admin`]: Channels and their administrative records
//! - [`collision`]: Collision arbitration
//! - [`notifier`]: Async handler dispatch
//! - [`provider`], [`api`]: URI-based channel opening and the top-level handle
//! - [`config`]: Engine settings

/// Error types for canonlog operations.
///
/// A single error enum covers every layer, so callers match on one type.
pub mod error;

/// Domain types: newtypes for names and sequences, and the two forms an
/// event takes (buffered and committed).
pub mod types;

/// Codecs and the stream → channel → global resolver hierarchy.
pub mod codec;

/// Sequence assignment and comparison.
pub mod sequencer;

/// The persistence contract streams write through, plus the in-memory store.
pub mod store;

/// SQLite schema definitions and database initialization.
pub mod schema;

/// SQLite-backed event store.
pub mod storage;

/// Engine configuration and property parsing.
pub mod config;

/// Administrative stream records.
pub mod admin;

/// Append futures and the completion watcher.
pub mod completion;

/// The per-channel commit writer thread.
pub mod writer;

/// Transactions and the transactional appender.
pub mod transaction;

/// Streams: the committed log, commits, sanitization and replication intake.
pub mod stream;

/// Sequential readers and reader composition.
pub mod reader;

/// Durable readers and position tracking.
pub mod durable;

/// Collision arbitration and mediators.
pub mod collision;

/// The async handler notifier.
pub mod notifier;

/// Channels.
pub mod channel;

/// URI-based channel providers.
pub mod provider;

/// The top-level [`EventLog`](api::EventLog) handle.
pub mod api;

// =============================================================================
// Re-exports
// =============================================================================

pub use admin::AdminEvent;
pub use api::EventLog;
pub use channel::{AdminStream, Channel, ChannelOptions};
pub use codec::{Codec, CodecResolver, JsonCodec, RawCodec};
pub use collision::{
    CollisionArbitor, CollisionId, CollisionResolution, CollisionState, EventCollision, Mediator,
};
pub use completion::{AppendFuture, Completion, CompletionWatcher};
pub use config::{EngineConfig, NotifierConfig, WriterConfig};
pub use durable::{DurableReader, FileReaderTracker, MemoryReaderTracker, ReaderTracker};
pub use error::{Error, Result};
pub use notifier::{AsyncHandlerNotifier, EventHandler, EventHandlerAction, HandlerError, HandlerId};
pub use provider::{
    ChannelProvider, ChannelUri, MemoryChannelProvider, ProviderRegistry, SqliteChannelProvider,
};
pub use schema::Database;
pub use reader::{EventReader, FilteredReader, StreamReader};
pub use sequencer::{EventSequencer, SequencerKind};
pub use storage::{SqliteEventStore, SqliteStoreFactory};
pub use store::{EventStore, MemoryEventStore, MemoryStoreFactory, StoreFactory};
pub use stream::{ImportOutcome, Stream};
pub use transaction::{
    CommitResult, RollbackResult, Transaction, TransactionState, TransactionalAppender,
};
pub use types::{
    AppendedEventMessage, ChannelName, EventMessage, EventSequence, ReaderId, StreamName,
    TransactionId,
};
