//! # Event Sequencers
//!
//! A sequencer produces the order key ([`EventSequence`]) for each event a
//! stream commits, and defines the total order over those keys.
//!
//! ## Atomicity
//!
//! `next()` is only ever called by a committer that holds the stream's write
//! lock, so "decide and assign" happens in one critical section. The
//! implementations here are additionally lock-free (a single atomic
//! increment) so they stay correct if shared outside that lock.
//!
//! ## Gaps
//!
//! A commit that assigns sequences and then fails to persist hands them back
//! with [`EventSequencer::release`], rewinding to the stream tail, so the
//! next commit reuses them. After restart, [`EventSequencer::observe`]
//! fast-forwards past everything recovered from the store.
//!
//! ## Foreign Sequences
//!
//! Imported events keep the sequence they were given elsewhere. A stream only
//! accepts those its own sequencer can order ([`EventSequencer::accepts`]).
//!
//! ## Optimistic Concurrency Is Not Here
//!
//! Whether a transaction may append after a given event is decided by the
//! commit path, not the sequencer. A sequencer only assigns order.

use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};
use crate::types::{EventMessage, EventSequence};

// =============================================================================
// Trait
// =============================================================================

/// Assigns and orders sequences for one stream.
pub trait EventSequencer: Send + Sync + fmt::Debug {
    /// Produces the sequence for `candidate`.
    ///
    /// `previous` is the sequence the event will link to.
    ///
    /// # Errors
    ///
    /// `Error::StreamAppend` if the sequencer is exhausted.
    fn next(&self, candidate: &EventMessage, previous: Option<&EventSequence>) -> Result<EventSequence>;

    /// Total order over sequences produced by this sequencer.
    fn compare(&self, a: &EventSequence, b: &EventSequence) -> CmpOrdering;

    /// Fast-forwards the sequencer past a sequence that already exists.
    fn observe(&self, sequence: &EventSequence);

    /// Rewinds to `tail` after a failed commit, so the sequences issued past
    /// it are issued again. Caller holds the stream's write lock.
    fn release(&self, tail: Option<&EventSequence>);

    /// True if `sequence` has the shape this sequencer produces, i.e. it can
    /// be ordered against local sequences.
    fn accepts(&self, sequence: &EventSequence) -> bool;
}

/// Which sequencer a channel hands to its streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SequencerKind {
    /// [`CounterSequencer`].
    #[default]
    Counter,
    /// [`ContentHashSequencer`].
    ContentHash,
}

impl SequencerKind {
    /// Builds a fresh sequencer of this kind.
    pub fn build(self) -> Box<dyn EventSequencer> {
        match self {
            SequencerKind::Counter => Box::new(CounterSequencer::new()),
            SequencerKind::ContentHash => Box::new(ContentHashSequencer::new()),
        }
    }

    /// Parses the `canon.sequencer` property value.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "counter" => Some(SequencerKind::Counter),
            "content-hash" => Some(SequencerKind::ContentHash),
            _ => None,
        }
    }
}

// =============================================================================
// Counter Sequencer
// =============================================================================

/// `1`, `2`, `3`, ... compared numerically.
#[derive(Debug)]
pub struct CounterSequencer {
    /// Last issued value (0 = nothing issued).
    last: AtomicU64,
}

impl CounterSequencer {
    /// Starts before `1`.
    pub fn new() -> Self {
        Self {
            last: AtomicU64::new(0),
        }
    }

    fn numeric(seq: &EventSequence) -> Option<u64> {
        seq.as_str().parse().ok()
    }
}

impl Default for CounterSequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSequencer for CounterSequencer {
    fn next(&self, _candidate: &EventMessage, _previous: Option<&EventSequence>) -> Result<EventSequence> {
        let issued = self
            .last
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_add(1))
            .map_err(|_| Error::append("<sequencer>", "counter sequencer exhausted"))?;
        Ok(EventSequence::new((issued + 1).to_string()))
    }

    fn compare(&self, a: &EventSequence, b: &EventSequence) -> CmpOrdering {
        match (Self::numeric(a), Self::numeric(b)) {
            (Some(x), Some(y)) => x.cmp(&y),
            // Foreign sequences sort after numeric ones, then lexically.
            (Some(_), None) => CmpOrdering::Less,
            (None, Some(_)) => CmpOrdering::Greater,
            (None, None) => a.as_str().cmp(b.as_str()),
        }
    }

    fn observe(&self, sequence: &EventSequence) {
        if let Some(n) = Self::numeric(sequence) {
            self.last.fetch_max(n, Ordering::AcqRel);
        }
    }

    fn release(&self, tail: Option<&EventSequence>) {
        self.last
            .store(tail.and_then(Self::numeric).unwrap_or(0), Ordering::Release);
    }

    fn accepts(&self, sequence: &EventSequence) -> bool {
        Self::numeric(sequence).is_some()
    }
}

// =============================================================================
// Content Hash Sequencer
// =============================================================================

/// Content-derived sequences: `{counter:016x}-{hash:016x}`.
///
/// The hash covers the previous sequence, the event type and the content, so
/// two replicas that commit the same event after the same predecessor assign
/// the same sequence. Ordering uses only the counter prefix.
#[derive(Debug)]
pub struct ContentHashSequencer {
    last: AtomicU64,
}

impl ContentHashSequencer {
    /// Starts before counter `1`.
    pub fn new() -> Self {
        Self {
            last: AtomicU64::new(0),
        }
    }

    fn counter(seq: &EventSequence) -> Option<u64> {
        let (prefix, _) = seq.as_str().split_once('-')?;
        u64::from_str_radix(prefix, 16).ok()
    }

    fn digest(candidate: &EventMessage, previous: Option<&EventSequence>) -> u64 {
        let mut buf = Vec::with_capacity(candidate.content.len() + 64);
        if let Some(prev) = previous {
            buf.extend_from_slice(prev.as_str().as_bytes());
        }
        buf.push(0);
        buf.extend_from_slice(candidate.event_type.as_bytes());
        buf.push(0);
        buf.extend_from_slice(&candidate.content);
        xxhash_rust::xxh3::xxh3_64(&buf)
    }
}

impl Default for ContentHashSequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSequencer for ContentHashSequencer {
    fn next(&self, candidate: &EventMessage, previous: Option<&EventSequence>) -> Result<EventSequence> {
        let issued = self
            .last
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_add(1))
            .map_err(|_| Error::append("<sequencer>", "content-hash sequencer exhausted"))?;
        Ok(EventSequence::new(format!(
            "{:016x}-{:016x}",
            issued + 1,
            Self::digest(candidate, previous)
        )))
    }

    fn compare(&self, a: &EventSequence, b: &EventSequence) -> CmpOrdering {
        match (Self::counter(a), Self::counter(b)) {
            (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.as_str().cmp(b.as_str())),
            _ => a.as_str().cmp(b.as_str()),
        }
    }

    fn observe(&self, sequence: &EventSequence) {
        if let Some(n) = Self::counter(sequence) {
            self.last.fetch_max(n, Ordering::AcqRel);
        }
    }

    fn release(&self, tail: Option<&EventSequence>) {
        self.last
            .store(tail.and_then(Self::counter).unwrap_or(0), Ordering::Release);
    }

    fn accepts(&self, sequence: &EventSequence) -> bool {
        Self::counter(sequence).is_some()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    fn message(content: &[u8]) -> EventMessage {
        EventMessage::builder("Created")
            .content(content.to_vec())
            .build()
            .unwrap()
    }

    #[test]
    fn test_counter_numeric_order() {
        let seq = CounterSequencer::new();
        let m = message(b"x");
        let issued: Vec<_> = (0..12).map(|_| seq.next(&m, None).unwrap()).collect();

        assert_eq!(issued[0].as_str(), "1");
        assert_eq!(issued[11].as_str(), "12");
        // "9" < "10" numerically, not lexically
        assert_eq!(seq.compare(&issued[8], &issued[9]), CmpOrdering::Less);
    }

    #[test]
    fn test_counter_observe_fast_forwards() {
        let seq = CounterSequencer::new();
        seq.observe(&EventSequence::new("41"));
        seq.observe(&EventSequence::new("7"));
        assert_eq!(seq.next(&message(b""), None).unwrap().as_str(), "42");
    }

    #[test]
    fn test_counter_concurrent_unique() {
        let seq = Arc::new(CounterSequencer::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let seq = Arc::clone(&seq);
                thread::spawn(move || {
                    let m = message(b"x");
                    (0..500)
                        .map(|_| seq.next(&m, None).unwrap().as_str().parse::<u64>().unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all: Vec<u64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 4000);
        assert_eq!(all[3999], 4000);
    }

    #[test]
    fn test_content_hash_deterministic_for_same_predecessor() {
        let a = ContentHashSequencer::new();
        let b = ContentHashSequencer::new();
        let prev = EventSequence::new("0000000000000001-00000000000000aa");

        let sa = a.next(&message(b"same"), Some(&prev)).unwrap();
        let sb = b.next(&message(b"same"), Some(&prev)).unwrap();
        assert_eq!(sa, sb);

        let sc = ContentHashSequencer::new()
            .next(&message(b"different"), Some(&prev))
            .unwrap();
        assert_ne!(sa, sc);
    }

    #[test]
    fn test_content_hash_orders_by_counter() {
        let seq = ContentHashSequencer::new();
        let first = seq.next(&message(b"zzz"), None).unwrap();
        let second = seq.next(&message(b"aaa"), Some(&first)).unwrap();
        assert_eq!(seq.compare(&first, &second), CmpOrdering::Less);

        let fresh = ContentHashSequencer::new();
        fresh.observe(&second);
        let third = fresh.next(&message(b"x"), Some(&second)).unwrap();
        assert!(third.as_str().starts_with("0000000000000003-"));
    }

    #[test]
    fn test_release_rewinds_to_tail() {
        let seq = CounterSequencer::new();
        let m = message(b"x");
        let tail = seq.next(&m, None).unwrap();
        seq.next(&m, Some(&tail)).unwrap();
        seq.next(&m, Some(&tail)).unwrap();

        seq.release(Some(&tail));
        assert_eq!(seq.next(&m, Some(&tail)).unwrap().as_str(), "2");

        seq.release(None);
        assert_eq!(seq.next(&m, None).unwrap().as_str(), "1");

        let hashed = ContentHashSequencer::new();
        let first = hashed.next(&m, None).unwrap();
        hashed.next(&m, Some(&first)).unwrap();
        hashed.release(Some(&first));
        assert!(hashed.next(&m, Some(&first)).unwrap().as_str().starts_with("0000000000000002-"));
    }

    #[test]
    fn test_accepts_only_own_shape() {
        let counter = CounterSequencer::new();
        assert!(counter.accepts(&EventSequence::new("17")));
        assert!(!counter.accepts(&EventSequence::new("node-b:7")));

        let hashed = ContentHashSequencer::new();
        assert!(hashed.accepts(&EventSequence::new("0000000000000001-00000000000000aa")));
        assert!(!hashed.accepts(&EventSequence::new("17")));
    }

    #[test]
    fn test_sequencer_kind_parse() {
        assert_eq!(SequencerKind::parse("counter"), Some(SequencerKind::Counter));
        assert_eq!(
            SequencerKind::parse("content-hash"),
            Some(SequencerKind::ContentHash)
        );
        assert_eq!(SequencerKind::parse("uuid"), None);
    }
}
