//! # Event Codecs and Hierarchical Resolution
//!
//! A [`Codec`] turns a structured value into event content bytes and back. The
//! engine itself never interprets content; it only needs to know that *some*
//! codec claims each event type, and records which one did.
//!
//! ## Resolution Hierarchy
//!
//! Resolvers form a chain. Each level holds its own codecs and an optional
//! parent; lookup walks from the most specific level outward and the first
//! codec whose `is_supported` returns true wins.
//!
//! ```text
//!   appender (use_codec) ──► stream ──► channel ──► global
//!        most specific                           least specific
//! ```
//!
//! Within one level, codecs registered later take priority over earlier ones,
//! so `use_codec` always overrides whatever the level held before.
//!
//! ## Rust Pattern: Trait Objects Behind Arc
//!
//! Codecs are shared between resolvers, transactions and the commit writer
//! thread, so they are stored as `Arc<dyn Codec>` and the trait requires
//! `Send + Sync`.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, RwLock};

use serde_json::Value;

use crate::error::{Error, Result};
use crate::types::AppendedEventMessage;

// =============================================================================
// Codec Trait
// =============================================================================

/// Encoder/decoder for the content of one or more event types.
pub trait Codec: Send + Sync {
    /// Stable name, written to the `canon.codec` header at commit.
    fn name(&self) -> &str;

    /// Returns true if this codec handles `event_type`.
    fn is_supported(&self, event_type: &str) -> bool;

    /// Encodes `value` into `sink`.
    fn encode(&self, event_type: &str, value: &Value, sink: &mut Vec<u8>) -> Result<()>;

    /// Decodes the content of a committed event.
    fn decode(&self, message: &AppendedEventMessage) -> Result<Value>;
}

// =============================================================================
// JSON Codec
// =============================================================================

/// JSON content via `serde_json`.
///
/// Either claims every event type (`JsonCodec::all()`) or an explicit set.
#[derive(Debug, Clone)]
pub struct JsonCodec {
    name: String,
    types: Option<BTreeSet<String>>,
}

impl JsonCodec {
    /// A JSON codec supporting every event type.
    pub fn all() -> Self {
        Self {
            name: "json".to_string(),
            types: None,
        }
    }

    /// A JSON codec supporting only the listed event types.
    pub fn for_types<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: "json".to_string(),
            types: Some(types.into_iter().map(Into::into).collect()),
        }
    }

    /// Renames the codec (the name recorded in `canon.codec`).
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    fn failure(&self, event_type: &str, reason: impl fmt::Display) -> Error {
        Error::EventCodec {
            codec: self.name.clone(),
            event_type: event_type.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl Codec for JsonCodec {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_supported(&self, event_type: &str) -> bool {
        match &self.types {
            None => true,
            Some(types) => types.contains(event_type),
        }
    }

    fn encode(&self, event_type: &str, value: &Value, sink: &mut Vec<u8>) -> Result<()> {
        serde_json::to_writer(sink, value).map_err(|e| self.failure(event_type, e))
    }

    fn decode(&self, message: &AppendedEventMessage) -> Result<Value> {
        if message.content.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&message.content).map_err(|e| self.failure(&message.event_type, e))
    }
}

// =============================================================================
// Raw Codec
// =============================================================================

/// Opaque bytes. Values are JSON arrays of byte numbers, which lets raw
/// content travel through the same `Value`-based interface.
#[derive(Debug, Clone)]
pub struct RawCodec {
    types: BTreeSet<String>,
}

impl RawCodec {
    /// A raw codec for the listed event types.
    pub fn for_types<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            types: types.into_iter().map(Into::into).collect(),
        }
    }
}

impl Codec for RawCodec {
    fn name(&self) -> &str {
        "raw"
    }

    fn is_supported(&self, event_type: &str) -> bool {
        self.types.contains(event_type)
    }

    fn encode(&self, event_type: &str, value: &Value, sink: &mut Vec<u8>) -> Result<()> {
        let bytes: Vec<u8> = serde_json::from_value(value.clone()).map_err(|e| Error::EventCodec {
            codec: "raw".to_string(),
            event_type: event_type.to_string(),
            reason: e.to_string(),
        })?;
        sink.extend_from_slice(&bytes);
        Ok(())
    }

    fn decode(&self, message: &AppendedEventMessage) -> Result<Value> {
        Ok(Value::from(message.content.clone()))
    }
}

// =============================================================================
// Resolver
// =============================================================================

/// One level of the codec hierarchy.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use canonlog::codec::{CodecResolver, JsonCodec, RawCodec};
///
/// let global = Arc::new(CodecResolver::new());
/// global.register(Arc::new(JsonCodec::all()));
///
/// let stream = CodecResolver::with_parent(global);
/// stream.register(Arc::new(RawCodec::for_types(["Blob"])));
///
/// assert_eq!(stream.resolve("Blob").unwrap().name(), "raw");
/// assert_eq!(stream.resolve("Created").unwrap().name(), "json");
/// ```
pub struct CodecResolver {
    codecs: RwLock<Vec<Arc<dyn Codec>>>,
    parent: Option<Arc<CodecResolver>>,
}

impl CodecResolver {
    /// A root resolver with no codecs.
    pub fn new() -> Self {
        Self {
            codecs: RwLock::new(Vec::new()),
            parent: None,
        }
    }

    /// A resolver that falls back to `parent`.
    pub fn with_parent(parent: Arc<CodecResolver>) -> Self {
        Self {
            codecs: RwLock::new(Vec::new()),
            parent: Some(parent),
        }
    }

    /// Registers a codec at this level, ahead of any registered before it.
    pub fn register(&self, codec: Arc<dyn Codec>) {
        self.codecs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(codec);
    }

    /// Removes every codec with the given name from this level.
    ///
    /// Returns true if anything was removed.
    pub fn remove(&self, name: &str) -> bool {
        let mut codecs = self.codecs.write().unwrap_or_else(|e| e.into_inner());
        let before = codecs.len();
        codecs.retain(|c| c.name() != name);
        codecs.len() != before
    }

    /// Finds the codec for `event_type`, walking up the hierarchy.
    ///
    /// # Errors
    ///
    /// `Error::CodecNotFound` if no level supports the type.
    pub fn resolve(&self, event_type: &str) -> Result<Arc<dyn Codec>> {
        let mut level = Some(self);
        while let Some(resolver) = level {
            let found = {
                let codecs = resolver.codecs.read().unwrap_or_else(|e| e.into_inner());
                codecs
                    .iter()
                    .rev()
                    .find(|c| c.is_supported(event_type))
                    .cloned()
            };
            if let Some(codec) = found {
                return Ok(codec);
            }
            level = resolver.parent.as_deref();
        }
        Err(Error::CodecNotFound(event_type.to_string()))
    }

    /// Returns true if some level supports `event_type`.
    pub fn supports(&self, event_type: &str) -> bool {
        self.resolve(event_type).is_ok()
    }

    /// Decodes a committed event with the codec that resolves its type.
    pub fn decode(&self, message: &AppendedEventMessage) -> Result<Value> {
        self.resolve(&message.event_type)?.decode(message)
    }

    /// The parent level, if any.
    pub fn parent(&self) -> Option<&Arc<CodecResolver>> {
        self.parent.as_ref()
    }
}

impl Default for CodecResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CodecResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self
            .codecs
            .read()
            .map(|c| c.iter().map(|c| c.name().to_string()).collect())
            .unwrap_or_default();
        f.debug_struct("CodecResolver")
            .field("codecs", &names)
            .field("parent", &self.parent.is_some())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
