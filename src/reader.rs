//! # Event Readers
//!
//! A reader is a cursor over one stream's committed events. Readers never
//! copy the log: they hold the stream and an index into it, and take the
//! stream's read lock only for the instant it takes to clone an `Arc`.
//!
//! ## Composition
//!
//! ```text
//!   DurableReader ──wraps──► FilteredReader ──wraps──► StreamReader ──► Stream
//!   (ok() persists)          (predicate)               (index cursor)
//! ```
//!
//! Every layer implements [`EventReader`], so durability, filtering and
//! anything else are stacked at construction time.
//!
//! ## Blocking
//!
//! - `poll()` never blocks
//! - `poll_timeout(d)` blocks up to `d`, then returns `None`
//! - `take()` blocks until an event is committed or the stream closes

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::stream::Stream;
use crate::types::{AppendedEventMessage, EventSequence};

// =============================================================================
// Trait
// =============================================================================

/// A sequential cursor over one stream.
pub trait EventReader: Send {
    /// The stream being read.
    fn stream(&self) -> &Arc<Stream>;

    /// True if `poll()` would return an event right now.
    fn has_next(&self) -> bool;

    /// Returns the next event without blocking.
    fn poll(&mut self) -> Result<Option<Arc<AppendedEventMessage>>>;

    /// Returns the next event, waiting up to `timeout` for one to be committed.
    fn poll_timeout(&mut self, timeout: Duration) -> Result<Option<Arc<AppendedEventMessage>>>;

    /// Returns the next event, waiting as long as it takes.
    ///
    /// # Errors
    ///
    /// `Error::StreamRead` if the stream is closed while waiting.
    fn take(&mut self) -> Result<Arc<AppendedEventMessage>>;

    /// Moves the cursor to just after `position` (`None` = start of stream).
    ///
    /// # Errors
    ///
    /// `Error::UnknownEvent` if `position` is not on the stream.
    fn set_position(&mut self, position: Option<EventSequence>) -> Result<()>;

    /// Sequence of the last event returned (`None` = nothing read yet).
    fn position(&self) -> Option<EventSequence>;

    /// Acknowledges the last event returned. No-op for non-durable readers.
    fn ok(&mut self) -> Result<()> {
        Ok(())
    }

    /// Gives up on the last event returned. Acknowledges by default.
    fn skip(&mut self) -> Result<()> {
        self.ok()
    }
}

impl<R: EventReader + ?Sized> EventReader for Box<R> {
    fn stream(&self) -> &Arc<Stream> {
        (**self).stream()
    }
    fn has_next(&self) -> bool {
        (**self).has_next()
    }
    fn poll(&mut self) -> Result<Option<Arc<AppendedEventMessage>>> {
        (**self).poll()
    }
    fn poll_timeout(&mut self, timeout: Duration) -> Result<Option<Arc<AppendedEventMessage>>> {
        (**self).poll_timeout(timeout)
    }
    fn take(&mut self) -> Result<Arc<AppendedEventMessage>> {
        (**self).take()
    }
    fn set_position(&mut self, position: Option<EventSequence>) -> Result<()> {
        (**self).set_position(position)
    }
    fn position(&self) -> Option<EventSequence> {
        (**self).position()
    }
    fn ok(&mut self) -> Result<()> {
        (**self).ok()
    }
    fn skip(&mut self) -> Result<()> {
        (**self).skip()
    }
}

// =============================================================================
// StreamReader
// =============================================================================

/// The plain cursor: an index into the stream's committed list.
#[derive(Debug)]
pub struct StreamReader {
    stream: Arc<Stream>,
    next: usize,
    position: Option<EventSequence>,
}

impl StreamReader {
    pub(crate) fn new(stream: Arc<Stream>) -> Self {
        Self {
            stream,
            next: 0,
            position: None,
        }
    }

    fn advance(&mut self) -> Option<Arc<AppendedEventMessage>> {
        let event = self.stream.event_at(self.next)?;
        self.next += 1;
        self.position = Some(event.sequence.clone());
        Some(event)
    }

    fn closed(&self) -> Error {
        Error::StreamRead {
            stream: self.stream.name().to_string(),
            reason: "stream closed while waiting".to_string(),
        }
    }
}

impl EventReader for StreamReader {
    fn stream(&self) -> &Arc<Stream> {
        &self.stream
    }

    fn has_next(&self) -> bool {
        self.stream.len() > self.next
    }

    fn poll(&mut self) -> Result<Option<Arc<AppendedEventMessage>>> {
        Ok(self.advance())
    }

    fn poll_timeout(&mut self, timeout: Duration) -> Result<Option<Arc<AppendedEventMessage>>> {
        if self.stream.wait_for(self.next, Some(Instant::now() + timeout)) {
            return Ok(self.advance());
        }
        Ok(None)
    }

    fn take(&mut self) -> Result<Arc<AppendedEventMessage>> {
        loop {
            if let Some(event) = self.advance() {
                return Ok(event);
            }
            if !self.stream.wait_for(self.next, None) && self.stream.is_closed() {
                return Err(self.closed());
            }
        }
    }

    fn set_position(&mut self, position: Option<EventSequence>) -> Result<()> {
        match position {
            None => {
                self.next = 0;
                self.position = None;
            }
            Some(sequence) => {
                let index = self.stream.index_of(&sequence).ok_or_else(|| Error::UnknownEvent {
                    stream: self.stream.name().to_string(),
                    sequence: sequence.to_string(),
                })?;
                self.next = index + 1;
                self.position = Some(sequence);
            }
        }
        Ok(())
    }

    fn position(&self) -> Option<EventSequence> {
        self.position.clone()
    }
}

// =============================================================================
// FilteredReader
// =============================================================================

/// Passes through only the events `predicate` accepts.
///
/// Rejected events are `skip()`ped on the inner reader, so a durable reader
/// underneath still moves past them.
pub struct FilteredReader<R> {
    inner: R,
    predicate: Box<dyn Fn(&AppendedEventMessage) -> bool + Send>,
}

impl<R: EventReader> FilteredReader<R> {
    /// Wraps `inner`.
    pub fn new<F>(inner: R, predicate: F) -> Self
    where
        F: Fn(&AppendedEventMessage) -> bool + Send + 'static,
    {
        Self {
            inner,
            predicate: Box::new(predicate),
        }
    }

    /// Only events of one of the given types.
    pub fn event_types(inner: R, types: &[&str]) -> Self {
        let types: Vec<String> = types.iter().map(|t| t.to_string()).collect();
        Self::new(inner, move |e| types.iter().any(|t| *t == e.event_type))
    }

    /// Unwraps the inner reader.
    pub fn into_inner(self) -> R {
        self.inner
    }

    fn accept(&mut self, event: Arc<AppendedEventMessage>) -> Result<Option<Arc<AppendedEventMessage>>> {
        if (self.predicate)(&event) {
            Ok(Some(event))
        } else {
            self.inner.skip()?;
            Ok(None)
        }
    }
}

impl<R: EventReader> EventReader for FilteredReader<R> {
    fn stream(&self) -> &Arc<Stream> {
        self.inner.stream()
    }

    fn has_next(&self) -> bool {
        self.inner.has_next()
    }

    fn poll(&mut self) -> Result<Option<Arc<AppendedEventMessage>>> {
        while let Some(event) = self.inner.poll()? {
            if let Some(event) = self.accept(event)? {
                return Ok(Some(event));
            }
        }
        Ok(None)
    }

    fn poll_timeout(&mut self, timeout: Duration) -> Result<Option<Arc<AppendedEventMessage>>> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.inner.poll_timeout(remaining)? {
                Some(event) => {
                    if let Some(event) = self.accept(event)? {
                        return Ok(Some(event));
                    }
                }
                None => return Ok(None),
            }
        }
    }

    fn take(&mut self) -> Result<Arc<AppendedEventMessage>> {
        loop {
            let event = self.inner.take()?;
            if let Some(event) = self.accept(event)? {
                return Ok(event);
            }
        }
    }

    fn set_position(&mut self, position: Option<EventSequence>) -> Result<()> {
        self.inner.set_position(position)
    }

    fn position(&self) -> Option<EventSequence> {
        self.inner.position()
    }

    fn ok(&mut self) -> Result<()> {
        self.inner.ok()
    }

    fn skip(&mut self) -> Result<()> {
        self.inner.skip()
    }
}

impl<R: std::fmt::Debug> std::fmt::Debug for FilteredReader<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilteredReader")
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::channel::Channel;

    fn seeded(types: &[&str]) -> (Channel, Arc<Stream>) {
        let channel = Channel::in_memory("reader-tests").unwrap();
        let stream = channel.get_or_create_stream("orders").unwrap();
        let mut appender = stream.appender();
        for ty in types {
            appender.create(*ty).add().unwrap();
        }
        if !types.is_empty() {
            appender.commit().wait().unwrap();
        }
        (channel, stream)
    }

    #[test]
    fn test_poll_in_commit_order() {
        let (_channel, stream) = seeded(&["A", "B", "C"]);
        let mut reader = stream.reader();

        let mut seen = Vec::new();
        while let Some(event) = reader.poll().unwrap() {
            seen.push(event.event_type.clone());
        }
        assert_eq!(seen, vec!["A", "B", "C"]);
        assert!(!reader.has_next());
        assert_eq!(reader.position(), stream.last_event_id());
    }

    #[test]
    fn test_set_position() {
        let (_channel, stream) = seeded(&["A", "B", "C"]);
        let events = stream.events();

        let mut reader = stream.reader_from(Some(events[0].sequence.clone())).unwrap();
        assert_eq!(reader.poll().unwrap().unwrap().event_type, "B");

        reader.set_position(None).unwrap();
        assert_eq!(reader.poll().unwrap().unwrap().event_type, "A");

        let err = reader.set_position(Some(EventSequence::new("nope"))).unwrap_err();
        assert!(matches!(err, Error::UnknownEvent { .. }));
        // A failed reposition leaves the cursor alone
        assert_eq!(reader.poll().unwrap().unwrap().event_type, "B");
    }

    #[test]
    fn test_poll_timeout_returns_none_past_deadline() {
        let (_channel, stream) = seeded(&[]);
        let mut reader = stream.reader();

        let started = Instant::now();
        assert!(reader.poll_timeout(Duration::from_millis(30)).unwrap().is_none());
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_take_blocks_until_commit() {
        let (_channel, stream) = seeded(&[]);
        let mut reader = stream.reader();

        let writer = {
            let stream = Arc::clone(&stream);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                let mut appender = stream.appender();
                appender.create("Late").add().unwrap();
                appender.commit().wait().unwrap();
            })
        };

        assert_eq!(reader.take().unwrap().event_type, "Late");
        writer.join().unwrap();
    }

    #[test]
    fn test_take_fails_when_stream_closes() {
        let (channel, stream) = seeded(&[]);
        let mut reader = stream.reader();

        let closer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            channel.close();
        });

        assert!(matches!(reader.take(), Err(Error::StreamRead { .. })));
        closer.join().unwrap();
    }

    #[test]
    fn test_filtered_reader() {
        let (_channel, stream) = seeded(&["A", "B", "A", "C"]);
        let mut reader = FilteredReader::event_types(stream.reader(), &["A", "C"]);

        let mut seen = Vec::new();
        while let Some(event) = reader.poll().unwrap() {
            seen.push(event.event_type.clone());
        }
        assert_eq!(seen, vec!["A", "A", "C"]);
    }
}
