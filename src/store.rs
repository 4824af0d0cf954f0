//! # Event Store Backends
//!
//! A [`Stream`](crate::stream::Stream) keeps its committed events in memory
//! for reading and hands every commit to an [`EventStore`] for durability.
//! The store is only ever called while the stream's write lock is held, so
//! implementations never see two writers for one stream at once.
//!
//! ```text
//!   Stream::commit ──► sequence + link ──► EventStore::persist ──► publish
//!                                               │
//!                                        error? abort, publish nothing
//! ```
//!
//! Two backends ship with the crate:
//!
//! - [`MemoryEventStore`]: a `Vec` behind a mutex, lives as long as its factory
//! - [`SqliteEventStore`](crate::storage::SqliteEventStore): one SQLite file per channel

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::types::{AppendedEventMessage, StreamName};

// =============================================================================
// Traits
// =============================================================================

/// Durable storage for one stream.
pub trait EventStore: Send + Sync {
    /// Returns every persisted event in commit order.
    fn load(&self) -> Result<Vec<AppendedEventMessage>>;

    /// Persists a committed batch, all or nothing.
    ///
    /// On error nothing from `batch` may be visible to a later `load()`.
    fn persist(&self, batch: &[Arc<AppendedEventMessage>]) -> Result<()>;

    /// Overwrites an existing event in place (sanitization).
    fn replace(&self, event: &AppendedEventMessage) -> Result<()>;
}

/// Opens the store for a stream of one channel.
pub trait StoreFactory: Send + Sync {
    /// Opens (creating if needed) the store for `stream`.
    fn open(&self, stream: &StreamName) -> Result<Arc<dyn EventStore>>;
}

// =============================================================================
// Memory Backend
// =============================================================================

/// In-process store. Survives a channel reopen only through the factory that
/// created it.
#[derive(Debug, Default)]
pub struct MemoryEventStore {
    events: Mutex<Vec<AppendedEventMessage>>,
}

impl MemoryEventStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventStore for MemoryEventStore {
    fn load(&self) -> Result<Vec<AppendedEventMessage>> {
        Ok(self.events.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn persist(&self, batch: &[Arc<AppendedEventMessage>]) -> Result<()> {
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        events.extend(batch.iter().map(|e| e.as_ref().clone()));
        Ok(())
    }

    fn replace(&self, event: &AppendedEventMessage) -> Result<()> {
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        match events.iter_mut().find(|e| e.sequence == event.sequence) {
            Some(slot) => {
                *slot = event.clone();
                Ok(())
            }
            None => Err(Error::UnknownEvent {
                stream: event.stream.to_string(),
                sequence: event.sequence.to_string(),
            }),
        }
    }
}

/// Hands out one [`MemoryEventStore`] per stream name, reusing it on reopen.
#[derive(Default)]
pub struct MemoryStoreFactory {
    stores: Mutex<HashMap<StreamName, Arc<MemoryEventStore>>>,
}

impl MemoryStoreFactory {
    /// An empty factory.
    pub fn new() -> Self {
        Self::default()
    }
}

impl StoreFactory for MemoryStoreFactory {
    fn open(&self, stream: &StreamName) -> Result<Arc<dyn EventStore>> {
        let mut stores = self.stores.lock().unwrap_or_else(|e| e.into_inner());
        let store = stores
            .entry(stream.clone())
            .or_insert_with(|| Arc::new(MemoryEventStore::new()));
        Ok(Arc::clone(store) as Arc<dyn EventStore>)
    }
}

// =============================================================================
// Tests
// =============================================================================
