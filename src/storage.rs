//! # SQLite Storage Layer
//!
//! [`SqliteEventStore`] implements [`EventStore`] on top of a shared
//! [`Database`]. All streams of a channel share one connection behind a mutex;
//! each store only touches the rows of its own stream.
//!
//! ## Invariant: Memory Lags Disk
//!
//! The stream publishes a batch to readers only after `persist` returned Ok.
//! `persist` writes the whole batch in one SQLite transaction, so a failure
//! leaves neither disk nor memory with a partial batch.
//!
//! ## Row Encoding
//!
//! Fixed fields map to columns; `headers` and `trigger_ids` are stored as JSON
//! text (see `schema.rs`).

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::{params, OptionalExtension, Row};
use tracing::debug;

use crate::error::{Error, Result};
use crate::schema::Database;
use crate::store::{EventStore, StoreFactory};
use crate::types::{AppendedEventMessage, EventSequence, Headers, StreamName};

// =============================================================================
// Store
// =============================================================================

/// One stream's view of a channel database.
#[derive(Debug)]
pub struct SqliteEventStore {
    db: Arc<Mutex<Database>>,
    stream: StreamName,
}

impl SqliteEventStore {
    /// Binds a stream to an open database.
    pub fn new(db: Arc<Mutex<Database>>, stream: StreamName) -> Self {
        Self { db, stream }
    }

    fn lock(&self) -> MutexGuard<'_, Database> {
        self.db.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_position(db: &Database, stream: &StreamName) -> Result<i64> {
        let max: Option<i64> = db.connection().query_row(
            "SELECT MAX(position) FROM events WHERE stream = ?",
            [stream.as_str()],
            |row| row.get(0),
        )?;
        Ok(max.map_or(0, |p| p + 1))
    }
}

impl EventStore for SqliteEventStore {
    fn load(&self) -> Result<Vec<AppendedEventMessage>> {
        let db = self.lock();
        let mut stmt = db.connection().prepare(
            "SELECT sequence, previous, timestamp_ms, event_type, authorizer_id, \
                    trigger_ids, headers, content \
             FROM events WHERE stream = ? ORDER BY position",
        )?;

        let rows = stmt.query_map([self.stream.as_str()], |row| decode_row(&self.stream, row))?;

        let mut events = Vec::new();
        for row in rows {
            events.push(row??);
        }
        Ok(events)
    }

    fn persist(&self, batch: &[Arc<AppendedEventMessage>]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut db = self.lock();
        let mut position = Self::next_position(&db, &self.stream)?;

        let tx = db.connection_mut().transaction()?;
        {
            let mut insert = tx.prepare_cached(
                "INSERT INTO events (stream, position, sequence, previous, timestamp_ms, \
                                     event_type, authorizer_id, trigger_ids, headers, content) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )?;

            for event in batch {
                let (triggers, headers) = encode_json_columns(event)?;
                insert.execute(params![
                    self.stream.as_str(),
                    position,
                    event.sequence.as_str(),
                    event.previous.as_ref().map(EventSequence::as_str),
                    event.timestamp_ms as i64,
                    event.event_type,
                    event.authorizer_id,
                    triggers,
                    headers,
                    event.content,
                ])?;
                position += 1;
            }
        }
        // Dropping `tx` without commit rolls back, so an early `?` above
        // leaves nothing behind.
        tx.commit()?;

        debug!(stream = %self.stream, events = batch.len(), "persisted batch");
        Ok(())
    }

    fn replace(&self, event: &AppendedEventMessage) -> Result<()> {
        let db = self.lock();
        let (triggers, headers) = encode_json_columns(event)?;
        let updated = db.connection().execute(
            "UPDATE events SET event_type = ?, authorizer_id = ?, trigger_ids = ?, \
                               headers = ?, content = ? \
             WHERE stream = ? AND sequence = ?",
            params![
                event.event_type,
                event.authorizer_id,
                triggers,
                headers,
                event.content,
                self.stream.as_str(),
                event.sequence.as_str(),
            ],
        )?;

        if updated == 0 {
            return Err(Error::UnknownEvent {
                stream: self.stream.to_string(),
                sequence: event.sequence.to_string(),
            });
        }
        Ok(())
    }
}

fn encode_json_columns(event: &AppendedEventMessage) -> Result<(String, String)> {
    let triggers = serde_json::to_string(&event.trigger_ids)
        .map_err(|e| Error::Storage(format!("encode trigger ids: {e}")))?;
    let headers = serde_json::to_string(&event.headers)
        .map_err(|e| Error::Storage(format!("encode headers: {e}")))?;
    Ok((triggers, headers))
}

/// Decodes one row. The outer `rusqlite::Result` covers column access, the
/// inner one covers the JSON columns.
fn decode_row(stream: &StreamName, row: &Row<'_>) -> rusqlite::Result<Result<AppendedEventMessage>> {
    let sequence: String = row.get(0)?;
    let previous: Option<String> = row.get(1)?;
    let timestamp_ms: i64 = row.get(2)?;
    let event_type: String = row.get(3)?;
    let authorizer_id: Option<String> = row.get(4)?;
    let triggers: String = row.get(5)?;
    let headers: String = row.get(6)?;
    let content: Vec<u8> = row.get(7)?;

    let trigger_ids: Vec<String> = match serde_json::from_str(&triggers) {
        Ok(ids) => ids,
        Err(e) => {
            return Ok(Err(Error::Storage(format!(
                "decode trigger ids of {sequence}: {e}"
            ))))
        }
    };
    let headers: Headers = match serde_json::from_str(&headers) {
        Ok(headers) => headers,
        Err(e) => return Ok(Err(Error::Storage(format!("decode headers of {sequence}: {e}")))),
    };

    Ok(Ok(AppendedEventMessage {
        stream: stream.clone(),
        sequence: EventSequence::new(sequence),
        previous: previous.map(EventSequence::new),
        timestamp_ms: timestamp_ms as u64,
        event_type,
        authorizer_id,
        trigger_ids,
        headers,
        content,
    }))
}

// =============================================================================
// Factory
// =============================================================================

/// Opens [`SqliteEventStore`]s that share one channel database file.
#[derive(Debug, Clone)]
pub struct SqliteStoreFactory {
    db: Arc<Mutex<Database>>,
}

impl SqliteStoreFactory {
    /// Opens (or creates) the channel database at `path`.
    pub fn open_file(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            db: Arc::new(Mutex::new(Database::open(path)?)),
        })
    }

    /// An in-memory database, for tests.
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            db: Arc::new(Mutex::new(Database::open_in_memory()?)),
        })
    }

    /// Number of events stored for `stream`, read straight from disk.
    pub fn stored_count(&self, stream: &StreamName) -> Result<u64> {
        let db = self.db.lock().unwrap_or_else(|e| e.into_inner());
        let count: Option<i64> = db
            .connection()
            .query_row(
                "SELECT COUNT(*) FROM events WHERE stream = ?",
                [stream.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(count.unwrap_or(0) as u64)
    }
}

impl StoreFactory for SqliteStoreFactory {
    fn open(&self, stream: &StreamName) -> Result<Arc<dyn EventStore>> {
        Ok(Arc::new(SqliteEventStore::new(Arc::clone(&self.db), stream.clone())))
    }
}

// =============================================================================
// Tests
// =============================================================================
