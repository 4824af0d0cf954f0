//! # SQLite Schema for canonlog
//!
//! This module defines the on-disk schema of the SQLite backend and handles
//! initialization. One database file holds one channel: every stream of the
//! channel, including the `canon.admin` stream, shares the `events` table.
//!
//! ## Table Overview
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                        Schema Overview                        │
//! ├───────────────────────────────────────────────────────────────┤
//! │                                                               │
//! │  events                               canonlog_metadata       │
//! │  ┌──────────────────────────┐         ┌────────────────┐      │
//! │  │ stream       ┐ PK        │         │ key (PK)       │      │
//! │  │ position     ┘           │         │ value          │      │
//! │  │ sequence  (unique/stream)│         └────────────────┘      │
//! │  │ previous                 │                                 │
//! │  │ event_type, headers, ... │                                 │
//! │  │ content BLOB             │                                 │
//! │  └──────────────────────────┘                                 │
//! │                                                               │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Decisions
//!
//! ### Why `position` as well as `sequence`?
//!
//! Sequences are opaque strings whose order is defined by the stream's
//! sequencer, not by SQLite's collation. `position` is the 0-based index in
//! commit order, so `ORDER BY position` reproduces the committed order
//! regardless of which sequencer produced the keys.
//!
//! ### Why JSON for headers and trigger ids?
//!
//! Both are small, read back whole, and never queried by value. A JSON text
//! column keeps the table flat without a child table per event.

use rusqlite::{Connection, OptionalExtension};

use crate::{Error, Result};

// =============================================================================
// Schema Version
// =============================================================================

/// Current schema version. Increment when making breaking schema changes.
///
/// There are no migrations: a mismatching file is rejected with
/// `Error::Schema`.
const SCHEMA_VERSION: i32 = 1;

// =============================================================================
// DDL Statements
// =============================================================================

/// The `events` table stores every committed event of every stream.
///
/// # Columns
///
/// - `stream`: Stream name
/// - `position`: 0-based index within the stream, in commit order
/// - `sequence`: The sequencer-assigned order key
/// - `previous`: Sequence of the preceding event (NULL for the first)
/// - `timestamp_ms`: Commit time, Unix milliseconds
/// - `event_type`, `authorizer_id`: Copied from the message
/// - `trigger_ids`: JSON array of strings
/// - `headers`: JSON object of string → string
/// - `content`: The payload (empty once sanitized)
const CREATE_EVENTS: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    stream        TEXT    NOT NULL,
    position      INTEGER NOT NULL,
    sequence      TEXT    NOT NULL,
    previous      TEXT,
    timestamp_ms  INTEGER NOT NULL,
    event_type    TEXT    NOT NULL,
    authorizer_id TEXT,
    trigger_ids   TEXT    NOT NULL,
    headers       TEXT    NOT NULL,
    content       BLOB    NOT NULL,
    PRIMARY KEY (stream, position)
)
"#;

/// Unique index enforcing one event per sequence within a stream.
///
/// Also serves sanitization, which rewrites an event by sequence.
const CREATE_EVENTS_SEQUENCE_INDEX: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS events_stream_sequence
ON events(stream, sequence)
"#;

/// Metadata table for schema versioning.
const CREATE_METADATA: &str = r#"
CREATE TABLE IF NOT EXISTS canonlog_metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
"#;

// =============================================================================
// Database Wrapper
// =============================================================================

/// A SQLite connection with the canonlog schema applied.
///
/// Constructing one creates the tables and checks the version, so holders
/// never see a half-initialized file.
#[derive(Debug)]
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Opens (creating if missing) the channel database at `path`.
    ///
    /// # Errors
    ///
    /// - `Error::Storage` if the file can't be opened or created
    /// - `Error::Schema` if the schema version doesn't match
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use canonlog::schema::Database;
    ///
    /// let db = Database::open("orders.db")?;
    /// # Ok::<(), canonlog::Error>(())
    /// ```
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    /// A private in-memory database; gone when dropped.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let mut db = Self { conn };
        db.apply_schema()?;
        Ok(db)
    }

    fn apply_schema(&mut self) -> Result<()> {
        // WAL: readers see a consistent snapshot while a commit is in flight.
        self.conn.execute_batch("PRAGMA journal_mode = WAL")?;
        self.conn.execute_batch("PRAGMA synchronous = NORMAL")?;

        self.conn.execute_batch(CREATE_METADATA)?;
        self.conn.execute_batch(CREATE_EVENTS)?;
        self.conn.execute_batch(CREATE_EVENTS_SEQUENCE_INDEX)?;

        self.check_version()
    }

    /// Stamps a fresh file with [`SCHEMA_VERSION`]; rejects any other version.
    fn check_version(&mut self) -> Result<()> {
        let stamped: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM canonlog_metadata WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .optional()?;

        match stamped {
            None => {
                self.conn.execute(
                    "INSERT INTO canonlog_metadata (key, value) VALUES ('schema_version', ?)",
                    [SCHEMA_VERSION.to_string()],
                )?;
            }
            Some(v) if v == SCHEMA_VERSION.to_string() => {}
            Some(v) => {
                return Err(Error::Schema(format!(
                    "schema version mismatch: database has version {v}, but canonlog requires {SCHEMA_VERSION}"
                )));
            }
        }

        Ok(())
    }

    /// The underlying connection, for the storage layer.
    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }

    pub(crate) fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn table_count(db: &Database) -> i32 {
        db.conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
                [],
                |row| row.get(0),
            )
            .expect("should query tables")
    }

    #[test]
    fn test_open_in_memory() {
        let db = Database::open_in_memory().expect("should create in-memory db");
        // metadata + events
        assert_eq!(table_count(&db), 2);
    }

    #[test]
    fn test_sequence_index_created() {
        let db = Database::open_in_memory().expect("should create db");
        let found: i32 = db
            .conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name = 'events_stream_sequence'",
                [],
                |row| row.get(0),
            )
            .expect("should query");
        assert_eq!(found, 1);
    }

    #[test]
    fn test_reopen_existing_file() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("channel.db");

        {
            let _db = Database::open(&path).expect("first open should work");
        }

        let db = Database::open(&path).expect("second open should work");
        assert_eq!(table_count(&db), 2);
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("channel.db");

        {
            let db = Database::open(&path).unwrap();
            db.conn
                .execute(
                    "UPDATE canonlog_metadata SET value = '99' WHERE key = 'schema_version'",
                    [],
                )
                .unwrap();
        }

        assert!(matches!(Database::open(&path), Err(Error::Schema(_))));
    }

    #[test]
    fn test_unreadable_version_is_storage_error() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("channel.db");

        {
            let db = Database::open(&path).unwrap();
            db.conn
                .execute(
                    "UPDATE canonlog_metadata SET value = X'01' WHERE key = 'schema_version'",
                    [],
                )
                .unwrap();
        }

        match Database::open(&path) {
            Err(Error::Storage(msg)) => assert!(!msg.contains("UNIQUE"), "{msg}"),
            other => panic!("expected a storage error, got {other:?}"),
        }
    }
}
