#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use canonlog::types::{AppendedEventMessage, StreamName};
use canonlog::{Error, EventStore, MemoryStoreFactory, Result, Stream, StoreFactory};

pub fn temp_dir() -> tempfile::TempDir {
    tempfile::TempDir::new().expect("create temp dir")
}

/// Polls `f` until it yields a value or `timeout` passes.
pub fn eventually<T>(timeout: Duration, mut f: impl FnMut() -> Option<T>) -> T {
    let start = Instant::now();
    loop {
        if let Some(v) = f() {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Commits one transaction holding an event per type, content = type name.
pub fn commit(stream: &Arc<Stream>, types: &[&str]) -> Vec<Arc<AppendedEventMessage>> {
    let mut appender = stream.appender();
    for ty in types {
        appender
            .create(*ty)
            .content(ty.as_bytes().to_vec())
            .add()
            .expect("buffer event");
    }
    appender.commit().wait().expect("commit").events
}

pub fn event_types(stream: &Stream) -> Vec<String> {
    stream.events().iter().map(|e| e.event_type.clone()).collect()
}

// =============================================================================
// Failing store
// =============================================================================

/// Memory stores whose `persist` fails while the shared switch is on, and
/// stalls for the configured delay first.
#[derive(Default)]
pub struct FailingStoreFactory {
    inner: MemoryStoreFactory,
    failing: Arc<AtomicBool>,
    delay_ms: Arc<AtomicU64>,
}

impl FailingStoreFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_persists(&self, fail: bool) {
        self.failing.store(fail, Ordering::SeqCst);
    }

    pub fn delay_persists(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }
}

impl StoreFactory for FailingStoreFactory {
    fn open(&self, stream: &StreamName) -> Result<Arc<dyn EventStore>> {
        Ok(Arc::new(FailingStore {
            inner: self.inner.open(stream)?,
            failing: Arc::clone(&self.failing),
            delay_ms: Arc::clone(&self.delay_ms),
        }))
    }
}

struct FailingStore {
    inner: Arc<dyn EventStore>,
    failing: Arc<AtomicBool>,
    delay_ms: Arc<AtomicU64>,
}

impl EventStore for FailingStore {
    fn load(&self) -> Result<Vec<AppendedEventMessage>> {
        self.inner.load()
    }

    fn persist(&self, batch: &[Arc<AppendedEventMessage>]) -> Result<()> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Storage("disk full".into()));
        }
        self.inner.persist(batch)
    }

    fn replace(&self, event: &AppendedEventMessage) -> Result<()> {
        self.inner.replace(event)
    }
}
