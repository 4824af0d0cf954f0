//! # Domain Types for canonlog
//!
//! This module defines the core types used throughout the engine: names,
//! sequences, identifiers, and the two forms an event takes over its life.
//!
//! ## Design Philosophy: Newtypes for Safety
//!
//! Stream names, channel names, sequences, transaction ids and reader ids are
//! all strings underneath, but they are never interchangeable. Wrapping each
//! in its own single-field struct means a `ReaderId` can't be passed where an
//! `EventSequence` is expected.
//!
//! ## Event Lifecycle
//!
//! ```text
//!   EventMessageBuilder ──build()──► EventMessage ──commit()──► AppendedEventMessage
//!        (caller)                   (buffered in tx)             (immutable, sequenced)
//! ```
//!
//! ## The Reserved Namespace
//!
//! Names and header keys starting with [`RESERVED_PREFIX`] (`canon.`) belong to
//! the engine: the administrative stream, the admin event types, and the
//! system headers stamped at commit time. Callers can read them but never
//! create them.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::codec::CodecResolver;
use crate::error::{Error, Result};

// =============================================================================
// Reserved Namespace
// =============================================================================

/// Prefix reserved for engine-owned streams, event types and headers.
pub const RESERVED_PREFIX: &str = "canon.";

/// Header holding the name of the codec that resolved the event at commit.
pub const HEADER_CODEC: &str = "canon.codec";

/// Header holding the id of the transaction that committed the event.
pub const HEADER_TRANSACTION: &str = "canon.transaction";

/// Header set on events whose content has been sanitized.
pub const HEADER_SANITIZED: &str = "canon.sanitized";

/// Header set on events appended while applying a collision resolution.
pub const HEADER_COLLISION: &str = "canon.collision";

/// Returns true if `name` is in the reserved `canon.` namespace.
pub fn is_reserved(name: &str) -> bool {
    name.starts_with(RESERVED_PREFIX)
}

/// Event headers: an ordered string → string map.
pub type Headers = BTreeMap<String, String>;

/// Channel properties handed to providers and config parsing.
pub type Properties = BTreeMap<String, String>;

// =============================================================================
// Names
// =============================================================================

/// The name of a stream, unique within its channel.
///
/// # Example
///
/// ```rust
/// use canonlog::types::StreamName;
///
/// let stream = StreamName::new("orders");
/// assert!(!stream.is_reserved());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StreamName(String);

impl StreamName {
    /// Creates a stream name without validation.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Creates a stream name that ordinary callers may create and append to.
    ///
    /// Rejects empty names and names in the reserved namespace.
    pub fn user(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::StreamInitialization {
                stream: name,
                reason: "stream name must not be empty".to_string(),
            });
        }
        if is_reserved(&name) {
            return Err(Error::ReservedName(name));
        }
        Ok(Self(name))
    }

    /// Returns the string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true for engine-owned streams.
    pub fn is_reserved(&self) -> bool {
        is_reserved(&self.0)
    }
}

impl fmt::Display for StreamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StreamName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for StreamName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// The name of a channel.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChannelName(String);

impl ChannelName {
    /// Creates a channel name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ChannelName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

// =============================================================================
// Sequences and Identifiers
// =============================================================================

/// The order key of one committed event within its stream.
///
/// # Opaque by Design
///
/// A sequence is just a string. Its total order is defined by the stream's
/// [`EventSequencer`](crate::sequencer::EventSequencer), *not* by string
/// comparison: `"10"` sorts before `"9"` lexically but after it numerically.
/// That is why `EventSequence` deliberately does not implement `Ord`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventSequence(String);

impl EventSequence {
    /// Wraps a raw sequence string.
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Returns the raw string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EventSequence {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Opaque transaction identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId(String);

impl TransactionId {
    /// Wraps a raw id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the raw id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a durable reader, unique within its stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReaderId(String);

impl ReaderId {
    /// Wraps a raw id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the raw id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReaderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ReaderId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

// =============================================================================
// Id Generation
// =============================================================================

/// Source of opaque ids (transaction ids) shared by all streams of a channel.
pub trait IdGenerator: Send + Sync {
    /// Returns a fresh id, never returned before by this generator.
    fn next_id(&self) -> String;
}

/// Random v4 UUIDs. The default for channels.
#[derive(Debug, Default)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn next_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

/// `{prefix}-1`, `{prefix}-2`, ... Deterministic, handy in tests and logs.
#[derive(Debug)]
pub struct SequentialIdGenerator {
    prefix: String,
    next: AtomicU64,
}

impl SequentialIdGenerator {
    /// Creates a generator whose first id is `{prefix}-1`.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: AtomicU64::new(1),
        }
    }
}

impl IdGenerator for SequentialIdGenerator {
    fn next_id(&self) -> String {
        format!("{}-{}", self.prefix, self.next.fetch_add(1, Ordering::Relaxed))
    }
}

// =============================================================================
// Events
// =============================================================================

/// An event that has not been committed yet.
///
/// This is the "input" form: what a caller buffers in a transaction. It has no
/// sequence; that is assigned at commit.
///
/// # Fields
///
/// - `event_type`: Classification used for codec resolution and filtering
/// - `authorizer_id`: Who authorized the event (user, service account, ...)
/// - `trigger_ids`: Causal parents, usually sequences of the events that caused this one
/// - `headers`: Free-form string metadata; `canon.*` keys are engine-owned
/// - `content`: The encoded payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMessage {
    /// The event type, e.g. `"OrderCreated"`.
    pub event_type: String,

    /// Optional id of whoever authorized the event.
    pub authorizer_id: Option<String>,

    /// Causal parents.
    pub trigger_ids: Vec<String>,

    /// String metadata.
    pub headers: Headers,

    /// Encoded payload.
    pub content: Vec<u8>,
}

impl EventMessage {
    /// Starts building a message of the given type.
    pub fn builder(event_type: impl Into<String>) -> EventMessageBuilder {
        EventMessageBuilder::new(event_type)
    }

    /// Returns a header value.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// Stamps an engine-owned header, bypassing the reserved-name check.
    pub(crate) fn set_system_header(&mut self, key: &str, value: impl Into<String>) {
        self.headers.insert(key.to_string(), value.into());
    }
}

/// Builder for [`EventMessage`].
///
/// # Example
///
/// ```rust
/// use canonlog::types::EventMessage;
///
/// let message = EventMessage::builder("OrderCreated")
///     .authorizer("user-42")
///     .header("region", "eu")
///     .content(b"{\"id\":1}".to_vec())
///     .build()
///     .unwrap();
/// assert_eq!(message.header("region"), Some("eu"));
/// ```
#[derive(Debug, Clone)]
pub struct EventMessageBuilder {
    message: EventMessage,
    error: Option<Error>,
}

impl EventMessageBuilder {
    /// Creates a builder for the given event type.
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            message: EventMessage {
                event_type: event_type.into(),
                authorizer_id: None,
                trigger_ids: Vec::new(),
                headers: Headers::new(),
                content: Vec::new(),
            },
            error: None,
        }
    }

    /// Returns the event type being built.
    pub fn event_type(&self) -> &str {
        &self.message.event_type
    }

    /// Sets the authorizer id.
    pub fn authorizer(mut self, id: impl Into<String>) -> Self {
        self.message.authorizer_id = Some(id.into());
        self
    }

    /// Adds a causal parent.
    pub fn trigger(mut self, id: impl Into<String>) -> Self {
        self.message.trigger_ids.push(id.into());
        self
    }

    /// Adds a header. Keys in the reserved namespace make `build()` fail.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        if is_reserved(&key) && self.error.is_none() {
            self.error = Some(Error::ReservedName(key.clone()));
        }
        self.message.headers.insert(key, value.into());
        self
    }

    /// Sets pre-encoded content.
    pub fn content(mut self, content: impl Into<Vec<u8>>) -> Self {
        self.message.content = content.into();
        self
    }

    /// Encodes `value` with the codec the resolver picks for this event type.
    pub fn encode(mut self, resolver: &CodecResolver, value: &serde_json::Value) -> Self {
        match resolver.resolve(&self.message.event_type) {
            Ok(codec) => {
                let mut sink = Vec::new();
                match codec.encode(&self.message.event_type, value, &mut sink) {
                    Ok(()) => self.message.content = sink,
                    Err(e) => self.error = self.error.or(Some(e)),
                }
            }
            Err(e) => self.error = self.error.or(Some(e)),
        }
        self
    }

    /// Finishes the message.
    ///
    /// # Errors
    ///
    /// - `Error::ReservedName` if a `canon.*` header was set
    /// - `Error::CodecNotFound` / `Error::EventCodec` if `encode` failed
    /// - `Error::StreamAppend` if the event type is empty
    pub fn build(self) -> Result<EventMessage> {
        if let Some(err) = self.error {
            return Err(err);
        }
        if self.message.event_type.is_empty() {
            return Err(Error::append("<unbound>", "event type must not be empty"));
        }
        Ok(self.message)
    }
}

/// A committed, immutable event.
///
/// This is the "output" form: everything from [`EventMessage`] plus the
/// position information assigned at commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendedEventMessage {
    /// The stream this event belongs to.
    pub stream: StreamName,

    /// Order key within the stream.
    pub sequence: EventSequence,

    /// Sequence of the preceding event (`None` for the first event).
    pub previous: Option<EventSequence>,

    /// When the event was committed (Unix milliseconds).
    pub timestamp_ms: u64,

    /// The event type.
    pub event_type: String,

    /// Optional authorizer id.
    pub authorizer_id: Option<String>,

    /// Causal parents.
    pub trigger_ids: Vec<String>,

    /// String metadata, including the engine's `canon.*` headers.
    pub headers: Headers,

    /// Encoded payload (empty once sanitized).
    pub content: Vec<u8>,
}

impl AppendedEventMessage {
    /// Seals a buffered message with its commit-time position.
    pub fn from_message(
        message: EventMessage,
        stream: StreamName,
        sequence: EventSequence,
        previous: Option<EventSequence>,
        timestamp_ms: u64,
    ) -> Self {
        Self {
            stream,
            sequence,
            previous,
            timestamp_ms,
            event_type: message.event_type,
            authorizer_id: message.authorizer_id,
            trigger_ids: message.trigger_ids,
            headers: message.headers,
            content: message.content,
        }
    }

    /// Recovers the uncommitted form (drops position info).
    pub fn to_message(&self) -> EventMessage {
        EventMessage {
            event_type: self.event_type.clone(),
            authorizer_id: self.authorizer_id.clone(),
            trigger_ids: self.trigger_ids.clone(),
            headers: self.headers.clone(),
            content: self.content.clone(),
        }
    }

    /// Length of the payload in bytes.
    pub fn content_length(&self) -> usize {
        self.content.len()
    }

    /// Returns a header value.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// True once the content has been replaced by a sanitize operation.
    pub fn is_sanitized(&self) -> bool {
        self.headers.contains_key(HEADER_SANITIZED)
    }

    /// Digest over the fields that make two events "the same event":
    /// type, authorizer, triggers, caller headers and content.
    ///
    /// Engine headers are excluded since two replicas stamp different
    /// transaction ids on otherwise identical events.
    pub fn content_digest(&self) -> u64 {
        let mut buf = Vec::with_capacity(self.content.len() + 64);
        buf.extend_from_slice(self.event_type.as_bytes());
        buf.push(0);
        if let Some(a) = &self.authorizer_id {
            buf.extend_from_slice(a.as_bytes());
        }
        buf.push(0);
        for t in &self.trigger_ids {
            buf.extend_from_slice(t.as_bytes());
            buf.push(0);
        }
        for (k, v) in self.headers.iter().filter(|(k, _)| !is_reserved(k)) {
            buf.extend_from_slice(k.as_bytes());
            buf.push(b'=');
            buf.extend_from_slice(v.as_bytes());
            buf.push(0);
        }
        buf.extend_from_slice(&self.content);
        xxhash_rust::xxh3::xxh3_64(&buf)
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Returns the current time in milliseconds since Unix epoch.
pub fn current_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// =============================================================================
// Tests
// =============================================================================
