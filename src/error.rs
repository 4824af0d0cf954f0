//! # Error Handling for canonlog
//!
//! This module defines the error type used throughout the engine. A single
//! error enum ([`Error`]) covers every failure mode, so callers match on one
//! type regardless of which layer (appender, reader, channel, store) failed.
//!
//! ## Rust Pattern: thiserror
//!
//! We use the `thiserror` crate to derive `std::error::Error` implementations:
//! - `Display` comes from the `#[error(...)]` attributes
//! - Source chaining comes from `#[source]`
//!
//! ## Why is `Error` Clone?
//!
//! A transaction that reached its terminal state must hand back the *same*
//! result every time `commit()` or `rollback()` is re-invoked. Memoizing a
//! `Result<CommitResult>` means the error half must be cloneable too, so I/O
//! errors are kept behind an `Arc` and SQLite errors are rendered to text at
//! the storage boundary.
//!
//! ## Error Categories
//!
//! | Category | Variants | Typical Response |
//! |----------|----------|------------------|
//! | Concurrency | `AppendOutOfSequence` | Re-read the tail and retry |
//! | Append | `StreamAppend`, `EventTransaction`, `ReservedName` | Fix the call; the transaction is aborted |
//! | Serialization | `CodecNotFound`, `EventCodec` | Register a codec / fix the payload |
//! | Read | `StreamRead`, `UnknownEvent`, `ReaderTracking` | Reposition or repair the tracking file |
//! | Creation | `StreamAlreadyExists`, `StreamNotFound`, `StreamInitialization`, `ChannelInitialization` | Re-fetch, or fix configuration |
//! | Backend | `Io`, `Storage`, `Schema` | Log and investigate |

use std::sync::Arc;

use thiserror::Error;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in canonlog operations.
///
/// # Example
///
/// ```rust,ignore
/// use canonlog::{Error, Result};
///
/// fn append_after(appender: &mut TransactionalAppender, tail: EventSequence) -> Result<()> {
///     match appender.commit_after(tail).wait() {
///         Ok(result) => println!("committed up to {:?}", result.last_sequence()),
///         Err(Error::AppendOutOfSequence { actual, .. }) => {
///             // someone else won; re-read from `actual` and retry
///         }
///         Err(e) => return Err(e),
///     }
///     Ok(())
/// }
/// ```
#[derive(Error, Debug, Clone)]
pub enum Error {
    // =========================================================================
    // Optimistic Concurrency
    // =========================================================================

    /// A conditional commit found the stream tail somewhere other than the
    /// declared previous event.
    ///
    /// # Recovery
    ///
    /// 1. Re-read the stream from `actual`
    /// 2. Re-apply business logic
    /// 3. Retry with `actual` as the new previous event id
    #[error("append out of sequence on stream '{stream}': expected tail {expected}, but found {}", .actual.as_deref().unwrap_or("<empty>"))]
    AppendOutOfSequence {
        /// Stream the commit targeted.
        stream: String,
        /// The previous event id the caller declared.
        expected: String,
        /// The stream's tail at commit time (`None` = empty stream).
        actual: Option<String>,
    },

    // =========================================================================
    // Append Failures (abort the whole transaction)
    // =========================================================================

    /// Generic append failure: no codec, inactive transaction, backend failure.
    ///
    /// Whatever the reason, nothing from the transaction was persisted.
    #[error("append to stream '{stream}' failed: {reason}")]
    StreamAppend {
        /// Stream the append targeted.
        stream: String,
        /// Human readable cause.
        reason: String,
    },

    /// `commit()`/`rollback()` invoked in a way the transaction's state forbids,
    /// e.g. rolling back a transaction that already committed.
    #[error("transaction {transaction}: {reason}")]
    EventTransaction {
        /// Transaction id.
        transaction: String,
        /// What was wrong.
        reason: String,
    },

    /// A caller tried to use a name in the reserved `canon.` namespace.
    #[error("'{0}' is in the reserved 'canon.' namespace")]
    ReservedName(String),

    // =========================================================================
    // Serialization
    // =========================================================================

    /// No codec in the resolver hierarchy supports the event type.
    #[error("no codec found for event type '{0}'")]
    CodecNotFound(String),

    /// A codec failed to encode or decode an event.
    #[error("codec '{codec}' failed for event type '{event_type}': {reason}")]
    EventCodec {
        /// Codec name.
        codec: String,
        /// Event type being processed.
        event_type: String,
        /// Underlying failure.
        reason: String,
    },

    // =========================================================================
    // Read Side
    // =========================================================================

    /// A read failed for a reason other than a missing position.
    #[error("read from stream '{stream}' failed: {reason}")]
    StreamRead {
        /// Stream being read.
        stream: String,
        /// Underlying failure.
        reason: String,
    },

    /// The requested position/sequence does not exist on the stream.
    #[error("event '{sequence}' does not exist on stream '{stream}'")]
    UnknownEvent {
        /// Stream being read.
        stream: String,
        /// The missing sequence.
        sequence: String,
    },

    /// A durable reader tracking file failed its magic/version/payload checks.
    #[error("corrupt reader tracking file '{path}': {reason}")]
    ReaderTracking {
        /// File path.
        path: String,
        /// Which check failed.
        reason: String,
    },

    // =========================================================================
    // Creation / Lookup
    // =========================================================================

    /// A stream with this name already exists in the channel.
    ///
    /// Expected under concurrent creation; `get_or_create_stream` handles it by
    /// re-fetching the winner.
    #[error("stream '{0}' already exists")]
    StreamAlreadyExists(String),

    /// No stream with this name exists in the channel.
    #[error("stream '{0}' not found")]
    StreamNotFound(String),

    /// The backend could not set up a stream.
    #[error("failed to initialize stream '{stream}': {reason}")]
    StreamInitialization {
        /// Stream name.
        stream: String,
        /// Underlying failure.
        reason: String,
    },

    /// The backend or provider could not set up a channel.
    #[error("failed to initialize channel '{channel}': {reason}")]
    ChannelInitialization {
        /// Channel name or URI.
        channel: String,
        /// Underlying failure.
        reason: String,
    },

    /// Manual resolution was requested for a collision that is not pending.
    #[error("collision {0} is not pending")]
    UnknownCollision(u64),

    // =========================================================================
    // Backend Errors (investigate)
    // =========================================================================

    /// Filesystem operation failed.
    #[error("I/O error: {0}")]
    Io(#[source] Arc<std::io::Error>),

    /// SQLite operation failed.
    #[error("sqlite error: {0}")]
    Storage(String),

    /// SQLite schema version mismatch.
    #[error("schema error: {0}")]
    Schema(String),
}

impl Error {
    /// Builds a [`Error::StreamAppend`] from any displayable cause.
    pub fn append(stream: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Error::StreamAppend {
            stream: stream.into(),
            reason: reason.to_string(),
        }
    }

    /// Returns true for the optimistic-concurrency failure.
    pub fn is_out_of_sequence(&self) -> bool {
        matches!(self, Error::AppendOutOfSequence { .. })
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================
