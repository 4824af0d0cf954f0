//! # Durable Readers
//!
//! A [`DurableReader`] wraps any [`EventReader`] and remembers, across process
//! restarts, the last event its consumer acknowledged.
//!
//! ## At-Least-Once
//!
//! ```text
//!   take() ──► event E (cached as "current")
//!   take() ──► event E again           (no ok() in between)
//!   ok()   ──► tracker.store(E) ──► current cleared
//!   take() ──► event E+1
//! ```
//!
//! The tracked position advances only on `ok()`/`skip()`. A consumer that
//! crashes after `take()` but before `ok()` gets the same event again when it
//! restarts.
//!
//! ## Tracking File Format
//!
//! [`FileReaderTracker`] keeps one small file per `(stream, reader id)`:
//!
//! ```text
//!   ┌────────────────┬─────────┬───────────────┬──────────────────────┐
//!   │ "CANONTRAK"    │ version │ length (u16   │ last acknowledged    │
//!   │ 9 ASCII bytes  │ 1 byte  │ big-endian)   │ sequence, UTF-8      │
//!   └────────────────┴─────────┴───────────────┴──────────────────────┘
//! ```
//!
//! A zero length means "nothing acknowledged yet". Files are replaced through
//! a temp file and a rename, so a crash mid-write leaves the old position.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::debug;

use crate::error::{Error, Result};
use crate::reader::EventReader;
use crate::stream::Stream;
use crate::types::{AppendedEventMessage, EventSequence, ReaderId, StreamName};

/// Magic tag at the start of every tracking file.
pub const TRACKING_MAGIC: &[u8; 9] = b"CANONTRAK";

/// Current tracking file version.
pub const TRACKING_VERSION: u8 = 0;

const HEADER_LEN: usize = TRACKING_MAGIC.len() + 1 + 2;

// =============================================================================
// Trackers
// =============================================================================

/// Persistent storage for durable reader positions.
pub trait ReaderTracker: Send + Sync {
    /// The last acknowledged sequence, or `None` if nothing was acknowledged.
    fn load(&self, stream: &StreamName, reader: &ReaderId) -> Result<Option<EventSequence>>;

    /// Records `position` as the last acknowledged sequence.
    fn store(&self, stream: &StreamName, reader: &ReaderId, position: Option<&EventSequence>) -> Result<()>;
}

/// One tracking file per reader under a directory.
#[derive(Debug, Clone)]
pub struct FileReaderTracker {
    dir: PathBuf,
}

impl FileReaderTracker {
    /// Uses `dir`, creating it if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Path of the tracking file for `(stream, reader)`.
    pub fn path(&self, stream: &StreamName, reader: &ReaderId) -> PathBuf {
        self.dir.join(format!(
            "{}__{}.track",
            file_safe(stream.as_str()),
            file_safe(reader.as_str())
        ))
    }
}

fn file_safe(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect()
}

/// Encodes a tracking file body.
pub fn encode_position(position: Option<&EventSequence>) -> Result<Vec<u8>> {
    let raw = position.map(|p| p.as_str().as_bytes()).unwrap_or_default();
    let len = u16::try_from(raw.len()).map_err(|_| Error::ReaderTracking {
        path: String::new(),
        reason: format!("sequence of {} bytes does not fit the length field", raw.len()),
    })?;

    let mut buf = Vec::with_capacity(HEADER_LEN + raw.len());
    buf.extend_from_slice(TRACKING_MAGIC);
    buf.push(TRACKING_VERSION);
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(raw);
    Ok(buf)
}

/// Decodes a tracking file body. `path` is only used in error messages.
pub fn decode_position(bytes: &[u8], path: &Path) -> Result<Option<EventSequence>> {
    let corrupt = |reason: &str| Error::ReaderTracking {
        path: path.display().to_string(),
        reason: reason.to_string(),
    };

    if bytes.len() < HEADER_LEN {
        return Err(corrupt("truncated header"));
    }
    if &bytes[..TRACKING_MAGIC.len()] != TRACKING_MAGIC {
        return Err(corrupt("bad magic"));
    }
    let version = bytes[TRACKING_MAGIC.len()];
    if version != TRACKING_VERSION {
        return Err(corrupt(&format!("unsupported version {version}")));
    }
    let len = u16::from_be_bytes([bytes[TRACKING_MAGIC.len() + 1], bytes[TRACKING_MAGIC.len() + 2]]) as usize;
    let payload = &bytes[HEADER_LEN..];
    if payload.len() != len {
        return Err(corrupt("payload length mismatch"));
    }
    if len == 0 {
        return Ok(None);
    }
    let raw = std::str::from_utf8(payload).map_err(|_| corrupt("sequence is not UTF-8"))?;
    Ok(Some(EventSequence::new(raw)))
}

impl ReaderTracker for FileReaderTracker {
    fn load(&self, stream: &StreamName, reader: &ReaderId) -> Result<Option<EventSequence>> {
        let path = self.path(stream, reader);
        match fs::read(&path) {
            Ok(bytes) => decode_position(&bytes, &path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn store(&self, stream: &StreamName, reader: &ReaderId, position: Option<&EventSequence>) -> Result<()> {
        let path = self.path(stream, reader);
        let body = encode_position(position).map_err(|e| match e {
            Error::ReaderTracking { reason, .. } => Error::ReaderTracking {
                path: path.display().to_string(),
                reason,
            },
            other => other,
        })?;

        let tmp = path.with_extension("track.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&body)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

/// In-process tracker. Clones share one map.
#[derive(Debug, Clone, Default)]
pub struct MemoryReaderTracker {
    positions: Arc<Mutex<HashMap<(StreamName, ReaderId), Option<EventSequence>>>>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryReaderTracker {
    /// An empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent `store` fail (or succeed again).
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Release);
    }
}

impl ReaderTracker for MemoryReaderTracker {
    fn load(&self, stream: &StreamName, reader: &ReaderId) -> Result<Option<EventSequence>> {
        let positions = self.positions.lock().unwrap_or_else(|e| e.into_inner());
        Ok(positions
            .get(&(stream.clone(), reader.clone()))
            .cloned()
            .flatten())
    }

    fn store(&self, stream: &StreamName, reader: &ReaderId, position: Option<&EventSequence>) -> Result<()> {
        if self.fail_writes.load(Ordering::Acquire) {
            return Err(std::io::Error::new(std::io::ErrorKind::Other, "tracker write refused").into());
        }
        self.positions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((stream.clone(), reader.clone()), position.cloned());
        Ok(())
    }
}

// =============================================================================
// DurableReader
// =============================================================================

/// A reader whose acknowledged position survives restarts.
///
/// # Example
///
/// ```rust,ignore
/// let mut reader = stream.durable_reader("billing")?;
/// loop {
///     let event = reader.take()?;
///     bill(&event)?;   // crash here → same event on restart
///     reader.ok()?;
/// }
/// ```
pub struct DurableReader<R> {
    inner: R,
    id: ReaderId,
    tracker: Arc<dyn ReaderTracker>,
    current: Option<Arc<AppendedEventMessage>>,
    acknowledged: Option<EventSequence>,
}

impl<R: EventReader> DurableReader<R> {
    /// Wraps `inner` and moves it to the tracked position for `id`.
    ///
    /// # Errors
    ///
    /// - `Error::ReaderTracking` for a corrupt tracking file
    /// - `Error::UnknownEvent` if the tracked sequence is not on the stream
    pub fn open(mut inner: R, id: ReaderId, tracker: Arc<dyn ReaderTracker>) -> Result<Self> {
        let acknowledged = tracker.load(inner.stream().name(), &id)?;
        inner.set_position(acknowledged.clone())?;
        debug!(
            stream = %inner.stream().name(),
            reader = %id,
            position = ?acknowledged,
            "durable reader opened"
        );
        Ok(Self {
            inner,
            id,
            tracker,
            current: None,
            acknowledged,
        })
    }

    /// The reader id.
    pub fn id(&self) -> &ReaderId {
        &self.id
    }

    /// The last acknowledged sequence.
    pub fn acknowledged(&self) -> Option<&EventSequence> {
        self.acknowledged.as_ref()
    }

    /// The delivered-but-unacknowledged event, if any.
    pub fn current(&self) -> Option<&Arc<AppendedEventMessage>> {
        self.current.as_ref()
    }

    fn hold(&mut self, event: Option<Arc<AppendedEventMessage>>) -> Option<Arc<AppendedEventMessage>> {
        if let Some(event) = &event {
            self.current = Some(Arc::clone(event));
        }
        event
    }
}

impl<R: EventReader> EventReader for DurableReader<R> {
    fn stream(&self) -> &Arc<Stream> {
        self.inner.stream()
    }

    fn has_next(&self) -> bool {
        self.current.is_some() || self.inner.has_next()
    }

    fn poll(&mut self) -> Result<Option<Arc<AppendedEventMessage>>> {
        if let Some(current) = &self.current {
            return Ok(Some(Arc::clone(current)));
        }
        let event = self.inner.poll()?;
        Ok(self.hold(event))
    }

    fn poll_timeout(&mut self, timeout: Duration) -> Result<Option<Arc<AppendedEventMessage>>> {
        if let Some(current) = &self.current {
            return Ok(Some(Arc::clone(current)));
        }
        let event = self.inner.poll_timeout(timeout)?;
        Ok(self.hold(event))
    }

    fn take(&mut self) -> Result<Arc<AppendedEventMessage>> {
        if let Some(current) = &self.current {
            return Ok(Arc::clone(current));
        }
        let event = self.inner.take()?;
        self.current = Some(Arc::clone(&event));
        Ok(event)
    }

    /// Durable: the new position is written to the tracker first, and the
    /// in-memory cursor is restored if that write fails.
    fn set_position(&mut self, position: Option<EventSequence>) -> Result<()> {
        let previous = self.inner.position();
        self.inner.set_position(position.clone())?;
        if let Err(e) = self.tracker.store(self.inner.stream().name(), &self.id, position.as_ref()) {
            self.inner.set_position(previous)?;
            return Err(e);
        }
        self.current = None;
        self.acknowledged = position;
        Ok(())
    }

    fn position(&self) -> Option<EventSequence> {
        self.inner.position()
    }

    fn ok(&mut self) -> Result<()> {
        let Some(current) = self.current.take() else {
            return Ok(());
        };
        if let Err(e) = self
            .tracker
            .store(self.inner.stream().name(), &self.id, Some(&current.sequence))
        {
            self.current = Some(current);
            return Err(e);
        }
        debug!(
            stream = %current.stream,
            reader = %self.id,
            sequence = %current.sequence,
            "acknowledged"
        );
        self.acknowledged = Some(current.sequence.clone());
        Ok(())
    }
}

impl<R: std::fmt::Debug> std::fmt::Debug for DurableReader<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableReader")
            .field("id", &self.id)
            .field("inner", &self.inner)
            .field("acknowledged", &self.acknowledged)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================
