//! # Channels
//!
//! A [`Channel`] is a named group of streams sharing one commit writer, one
//! handler notifier, one collision arbitor, one codec level and one reserved
//! administrative stream.
//!
//! ## Ownership
//!
//! ```text
//!   Channel (Arc<ChannelInner>, cloneable)
//!     ├── streams: name → Arc<Stream> ─────┐
//!     ├── admin:   Arc<Stream>             │ every Stream holds
//!     └── services: Arc<ChannelServices> ◄─┘ Arc<ChannelServices>
//!            ├── writer     (thread)
//!            ├── notifier   (threads)
//!            ├── arbitor    ──listener──► Weak<streams>
//!            ├── tracker
//!            └── admin: Weak<Stream>
//! ```
//!
//! Streams point up to the shared services, never to the channel, and the
//! services point to the admin stream weakly. Dropping the last `Channel`
//! clone closes it: handlers are dropped, streams refuse commits, and the
//! writer drains and stops.
//!
//! ## Stream Creation
//!
//! `get_or_create_stream` is race-safe by retry-find: try to create, and on
//! `StreamAlreadyExists` look the winner up. Every creation publishes
//! `StreamCreated` to the admin stream through the ordinary transactional
//! path, and the stream becomes visible only after that record committed.
//! While a name is being created it is held in a pending set; a second
//! creator waits for the first to finish. Reopening a channel over a durable
//! store replays those records to restore its streams.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, RwLock, Weak};

use tracing::{error, info, warn};

use crate::admin::{
    AdminEvent, ChannelCreated, ChannelRolledBack, StreamCreated, StreamRolledBack, ADMIN_CODEC,
    ADMIN_STREAM,
};
use crate::codec::{Codec, CodecResolver, JsonCodec};
use crate::collision::CollisionArbitor;
use crate::completion::CompletionWatcher;
use crate::config::EngineConfig;
use crate::durable::{FileReaderTracker, MemoryReaderTracker, ReaderTracker};
use crate::error::{Error, Result};
use crate::notifier::{AsyncHandlerNotifier, EventHandler, HandlerId};
use crate::reader::StreamReader;
use crate::store::{MemoryStoreFactory, StoreFactory};
use crate::stream::Stream;
use crate::types::{
    AppendedEventMessage, ChannelName, EventSequence, IdGenerator, Properties, StreamName,
    UuidGenerator,
};
use crate::writer::CommitWriterHandle;

// =============================================================================
// Shared Services
// =============================================================================

/// What every stream of a channel shares.
pub(crate) struct ChannelServices {
    name: ChannelName,
    ids: Arc<dyn IdGenerator>,
    writer: CommitWriterHandle,
    arbitor: Arc<CollisionArbitor>,
    notifier: Arc<AsyncHandlerNotifier>,
    tracker: Arc<dyn ReaderTracker>,
    admin: OnceLock<Weak<Stream>>,
}

impl ChannelServices {
    pub(crate) fn name(&self) -> &ChannelName {
        &self.name
    }

    pub(crate) fn ids(&self) -> Arc<dyn IdGenerator> {
        Arc::clone(&self.ids)
    }

    pub(crate) fn writer(&self) -> &CommitWriterHandle {
        &self.writer
    }

    pub(crate) fn arbitor(&self) -> &Arc<CollisionArbitor> {
        &self.arbitor
    }

    pub(crate) fn notifier(&self) -> &Arc<AsyncHandlerNotifier> {
        &self.notifier
    }

    pub(crate) fn tracker(&self) -> Arc<dyn ReaderTracker> {
        Arc::clone(&self.tracker)
    }

    /// Appends one record to the admin stream and waits for it to commit.
    ///
    /// Must not be called from the writer thread.
    pub(crate) fn publish_admin(&self, event: AdminEvent) -> Result<()> {
        let admin = self
            .admin
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| Error::append(ADMIN_STREAM, "channel is closed"))?;
        let mut appender = admin.system_appender();
        appender.add(event.to_message()?)?;
        appender.commit().wait()?;
        Ok(())
    }
}

// =============================================================================
// Options
// =============================================================================

/// Collaborators and settings for [`Channel::open`].
#[derive(Default)]
pub struct ChannelOptions {
    /// Engine settings; `properties` are applied on top.
    pub config: EngineConfig,

    /// Channel properties (`canon.*` keys configure the engine).
    pub properties: Properties,

    /// Parent codec level. `None` gives the channel its own JSON codec.
    pub global_codecs: Option<Arc<CodecResolver>>,

    /// Shared completion watcher. `None` starts one for the channel.
    pub watcher: Option<Arc<CompletionWatcher>>,

    /// Transaction id source. `None` uses random UUIDs.
    pub ids: Option<Arc<dyn IdGenerator>>,

    /// Durable reader positions. `None` follows `config.tracking_dir`.
    pub tracker: Option<Arc<dyn ReaderTracker>>,
}

impl std::fmt::Debug for ChannelOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelOptions")
            .field("config", &self.config)
            .field("properties", &self.properties)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Channel
// =============================================================================

type StreamMap = Arc<RwLock<HashMap<StreamName, Arc<Stream>>>>;

/// A named group of streams.
///
/// # Example
///
/// ```rust,ignore
/// let channel = Channel::in_memory("orders")?;
/// let stream = channel.get_or_create_stream("order-42")?;
/// let mut appender = stream.appender();
/// appender.create("Created").content(b"0123456789".to_vec()).add()?;
/// appender.commit().wait()?;
/// ```
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    name: ChannelName,
    config: EngineConfig,
    properties: Properties,
    codecs: Arc<CodecResolver>,
    watcher: Arc<CompletionWatcher>,
    factory: Arc<dyn StoreFactory>,
    services: Arc<ChannelServices>,
    streams: StreamMap,
    creating: Mutex<HashSet<StreamName>>,
    created: Condvar,
    admin: Arc<Stream>,
    closed: AtomicBool,
}

impl Channel {
    /// Opens a channel whose streams live in `factory`.
    ///
    /// Streams recorded in the admin stream are restored. A channel with an
    /// empty admin stream records `ChannelCreated` first.
    ///
    /// # Errors
    ///
    /// - `Error::ChannelInitialization` for malformed properties
    /// - `Error::StreamInitialization` if a stream fails to load
    /// - `Error::Io` if a worker thread cannot start
    pub fn open(name: impl Into<String>, factory: Arc<dyn StoreFactory>, options: ChannelOptions) -> Result<Self> {
        let name = ChannelName::new(name);
        let mut config = options.config;
        config.apply(&options.properties)?;

        let codecs = Arc::new(match options.global_codecs {
            Some(global) => CodecResolver::with_parent(global),
            None => {
                let resolver = CodecResolver::new();
                resolver.register(Arc::new(JsonCodec::all()));
                resolver
            }
        });
        let watcher = match options.watcher {
            Some(watcher) => watcher,
            None => Arc::new(CompletionWatcher::new(config.callback_threads())?),
        };
        let tracker: Arc<dyn ReaderTracker> = match (options.tracker, &config.tracking_dir) {
            (Some(tracker), _) => tracker,
            (None, Some(dir)) => Arc::new(FileReaderTracker::new(dir.join(name.as_str()))?),
            (None, None) => Arc::new(MemoryReaderTracker::new()),
        };

        let services = Arc::new(ChannelServices {
            name: name.clone(),
            ids: options.ids.unwrap_or_else(|| Arc::new(UuidGenerator)),
            writer: CommitWriterHandle::spawn(name.as_str(), &config.writer)?,
            arbitor: Arc::new(CollisionArbitor::new()),
            notifier: Arc::new(AsyncHandlerNotifier::new(name.as_str(), &config.notifier)?),
            tracker,
            admin: OnceLock::new(),
        });

        let admin_codecs = Arc::new(CodecResolver::new());
        admin_codecs.register(Arc::new(JsonCodec::all().named(ADMIN_CODEC)));
        let admin_name = StreamName::new(ADMIN_STREAM);
        let admin = Stream::open(
            admin_name.clone(),
            factory.open(&admin_name)?,
            config.sequencer.build(),
            admin_codecs,
            Arc::clone(&services),
        )?;
        let _ = services.admin.set(Arc::downgrade(&admin));

        let channel = Self {
            inner: Arc::new(ChannelInner {
                name,
                config,
                properties: options.properties,
                codecs,
                watcher,
                factory,
                services,
                streams: Arc::new(RwLock::new(HashMap::new())),
                creating: Mutex::new(HashSet::new()),
                created: Condvar::new(),
                admin,
                closed: AtomicBool::new(false),
            }),
        };
        channel.restore()?;
        channel.install_resolution_listener();
        info!(
            channel = %channel.inner.name,
            streams = channel.stream_names().len(),
            "channel opened"
        );
        Ok(channel)
    }

    /// A channel backed by in-memory stores, with default settings.
    pub fn in_memory(name: impl Into<String>) -> Result<Self> {
        Self::open(name, Arc::new(MemoryStoreFactory::new()), ChannelOptions::default())
    }

    /// Replays `StreamCreated` records, or records `ChannelCreated` for a new
    /// channel.
    fn restore(&self) -> Result<()> {
        let admin = &self.inner.admin;
        if admin.is_empty() {
            return self.inner.services.publish_admin(AdminEvent::ChannelCreated(ChannelCreated {
                channel: self.inner.name.to_string(),
            }));
        }

        for event in admin.events() {
            match AdminEvent::from_appended(&event) {
                Ok(AdminEvent::StreamCreated(record)) => {
                    let name = StreamName::new(record.stream);
                    let stream = self.load_stream(name.clone())?;
                    self.streams_mut().insert(name, stream);
                }
                Ok(_) => {}
                Err(e) => warn!(
                    channel = %self.inner.name,
                    sequence = %event.sequence,
                    error = %e,
                    "skipping unreadable admin record"
                ),
            }
        }
        Ok(())
    }

    fn install_resolution_listener(&self) {
        let streams: Weak<RwLock<HashMap<StreamName, Arc<Stream>>>> = Arc::downgrade(&self.inner.streams);
        self.inner
            .services
            .arbitor
            .set_resolution_listener(Arc::new(move |id, collision, resolution| {
                let Some(streams) = streams.upgrade() else {
                    return;
                };
                let stream = streams
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .get(&collision.stream)
                    .cloned();
                match stream {
                    Some(stream) => {
                        if let Err(e) = stream.apply_resolution(id, collision, resolution) {
                            error!(stream = %collision.stream, collision = %id, error = %e, "failed to apply collision resolution");
                        }
                    }
                    None => warn!(stream = %collision.stream, collision = %id, "resolved collision for unknown stream"),
                }
            }));
    }

    fn load_stream(&self, name: StreamName) -> Result<Arc<Stream>> {
        let store = self.inner.factory.open(&name).map_err(|e| Error::StreamInitialization {
            stream: name.to_string(),
            reason: e.to_string(),
        })?;
        let codecs = Arc::new(CodecResolver::with_parent(Arc::clone(&self.inner.codecs)));
        Stream::open(
            name,
            store,
            self.inner.config.sequencer.build(),
            codecs,
            Arc::clone(&self.inner.services),
        )
    }

    fn streams(&self) -> std::sync::RwLockReadGuard<'_, HashMap<StreamName, Arc<Stream>>> {
        self.inner.streams.read().unwrap_or_else(|e| e.into_inner())
    }

    fn streams_mut(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<StreamName, Arc<Stream>>> {
        self.inner.streams.write().unwrap_or_else(|e| e.into_inner())
    }

    fn creating(&self) -> MutexGuard<'_, HashSet<StreamName>> {
        self.inner.creating.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Marks `name` as being created, waiting out any creation already in
    /// flight for it.
    fn claim_creation(&self, name: &StreamName) -> Result<()> {
        let mut creating = self.creating();
        while creating.contains(name) {
            creating = self
                .inner
                .created
                .wait(creating)
                .unwrap_or_else(|e| e.into_inner());
        }
        if self.streams().contains_key(name) {
            return Err(Error::StreamAlreadyExists(name.to_string()));
        }
        creating.insert(name.clone());
        Ok(())
    }

    fn release_creation(&self, name: &StreamName) {
        self.creating().remove(name);
        self.inner.created.notify_all();
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ChannelInitialization {
                channel: self.inner.name.to_string(),
                reason: "channel is closed".to_string(),
            });
        }
        Ok(())
    }

    // =========================================================================
    // Streams
    // =========================================================================

    /// Creates a stream.
    ///
    /// # Errors
    ///
    /// - `Error::StreamAlreadyExists` if the name is taken
    /// - `Error::ReservedName` / `Error::StreamInitialization` for invalid names
    pub fn create_stream(&self, name: &str) -> Result<Arc<Stream>> {
        let name = StreamName::user(name)?;
        self.ensure_open()?;
        self.claim_creation(&name)?;
        let created = self.record_creation(&name);
        self.release_creation(&name);
        let stream = created?;
        info!(channel = %self.inner.name, stream = %name, "stream created");
        Ok(stream)
    }

    /// Loads the stream and publishes it once `StreamCreated` committed.
    fn record_creation(&self, name: &StreamName) -> Result<Arc<Stream>> {
        let stream = self.load_stream(name.clone())?;
        self.inner.services.publish_admin(AdminEvent::StreamCreated(StreamCreated {
            stream: name.to_string(),
        }))?;
        self.streams_mut().insert(name.clone(), Arc::clone(&stream));
        Ok(stream)
    }

    /// Returns the stream, creating it on first access.
    pub fn get_or_create_stream(&self, name: &str) -> Result<Arc<Stream>> {
        loop {
            if let Some(stream) = self.find_stream(name) {
                return Ok(stream);
            }
            match self.create_stream(name) {
                Err(Error::StreamAlreadyExists(_)) => continue,
                other => return other,
            }
        }
    }

    /// Looks a stream up without creating it.
    pub fn find_stream(&self, name: &str) -> Option<Arc<Stream>> {
        self.streams().get(&StreamName::new(name)).cloned()
    }

    /// Returns an existing stream.
    ///
    /// # Errors
    ///
    /// `Error::StreamNotFound` if no such stream exists.
    pub fn stream(&self, name: &str) -> Result<Arc<Stream>> {
        self.find_stream(name)
            .ok_or_else(|| Error::StreamNotFound(name.to_string()))
    }

    /// Names of all user streams, sorted.
    pub fn stream_names(&self) -> Vec<StreamName> {
        let mut names: Vec<StreamName> = self.streams().keys().cloned().collect();
        names.sort();
        names
    }

    /// Read-only view of the admin stream.
    pub fn admin_stream(&self) -> AdminStream {
        AdminStream {
            stream: Arc::clone(&self.inner.admin),
        }
    }

    // =========================================================================
    // Rollback Records
    // =========================================================================

    /// Records that `stream` was rolled back to `point`. Events after the
    /// point stay in the log; consumers use the record to supersede them.
    ///
    /// # Errors
    ///
    /// `Error::StreamNotFound` / `Error::UnknownEvent` for a bad target.
    pub fn record_stream_rollback(&self, stream: &str, point: EventSequence, justification: &str) -> Result<()> {
        let target = self.stream(stream)?;
        if target.get(&point).is_none() {
            return Err(Error::UnknownEvent {
                stream: stream.to_string(),
                sequence: point.to_string(),
            });
        }
        self.inner.services.publish_admin(AdminEvent::StreamRolledBack(StreamRolledBack {
            stream: stream.to_string(),
            rollback_point: point,
            justification: justification.to_string(),
        }))?;
        info!(channel = %self.inner.name, stream, "recorded stream rollback");
        Ok(())
    }

    /// Records that the whole channel was rolled back to `point`.
    pub fn record_channel_rollback(&self, point: EventSequence, justification: &str) -> Result<()> {
        self.inner.services.publish_admin(AdminEvent::ChannelRolledBack(ChannelRolledBack {
            channel: self.inner.name.to_string(),
            rollback_point: point,
            justification: justification.to_string(),
        }))?;
        info!(channel = %self.inner.name, "recorded channel rollback");
        Ok(())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// The channel name.
    pub fn name(&self) -> &ChannelName {
        &self.inner.name
    }

    /// Effective engine settings.
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// The properties the channel was opened with.
    pub fn properties(&self) -> &Properties {
        &self.inner.properties
    }

    /// The channel codec level.
    pub fn codecs(&self) -> &Arc<CodecResolver> {
        &self.inner.codecs
    }

    /// Registers a channel-level codec.
    pub fn use_codec(&self, codec: Arc<dyn Codec>) {
        self.inner.codecs.register(codec);
    }

    /// The completion watcher for commit callbacks.
    pub fn watcher(&self) -> &Arc<CompletionWatcher> {
        &self.inner.watcher
    }

    /// The collision arbitor.
    pub fn arbitor(&self) -> &Arc<CollisionArbitor> {
        self.inner.services.arbitor()
    }

    /// The handler notifier.
    pub fn notifier(&self) -> &Arc<AsyncHandlerNotifier> {
        self.inner.services.notifier()
    }

    /// The durable reader position store.
    pub fn tracker(&self) -> Arc<dyn ReaderTracker> {
        self.inner.services.tracker()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Stops handlers, closes every stream and stops the writer. Idempotent.
    pub fn close(&self) {
        self.inner.close();
    }

    /// True once `close()` ran.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl ChannelInner {
    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Dropping the handler contexts also drops their readers' streams.
        self.services.notifier.stop();
        let streams: Vec<Arc<Stream>> = self
            .streams
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        // Pending commits drain before the streams refuse new ones.
        self.services.writer.shutdown();
        for stream in &streams {
            stream.close();
        }
        self.admin.close();
        info!(channel = %self.name, "channel closed");
    }
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.inner.name)
            .field("streams", &self.stream_names())
            .field("closed", &self.is_closed())
            .finish()
    }
}

// =============================================================================
// AdminStream
// =============================================================================

/// Read-only handle to a channel's administrative stream.
#[derive(Debug, Clone)]
pub struct AdminStream {
    stream: Arc<Stream>,
}

impl AdminStream {
    /// Always [`ADMIN_STREAM`].
    pub fn name(&self) -> &StreamName {
        self.stream.name()
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.stream.len()
    }

    /// True if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.stream.is_empty()
    }

    /// Sequence of the latest record.
    pub fn last_event_id(&self) -> Option<EventSequence> {
        self.stream.last_event_id()
    }

    /// Raw records in order.
    pub fn events(&self) -> Vec<Arc<AppendedEventMessage>> {
        self.stream.events()
    }

    /// Decoded records in order.
    pub fn admin_events(&self) -> Result<Vec<AdminEvent>> {
        self.stream
            .events()
            .iter()
            .map(|e| AdminEvent::from_appended(e))
            .collect()
    }

    /// A reader over the records.
    pub fn reader(&self) -> StreamReader {
        self.stream.reader()
    }

    /// Registers a handler for admin records.
    pub fn add_handler(&self, handler: EventHandler) -> HandlerId {
        self.stream.add_handler(handler)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::reader::EventReader;

    #[test]
    fn test_new_channel_records_channel_created() {
        let channel = Channel::in_memory("orders").unwrap();
        let records = channel.admin_stream().admin_events().unwrap();
        assert_eq!(
            records,
            vec![AdminEvent::ChannelCreated(ChannelCreated {
                channel: "orders".into()
            })]
        );
    }

    #[test]
    fn test_create_and_lookup() {
        let channel = Channel::in_memory("orders").unwrap();
        let stream = channel.create_stream("order-1").unwrap();
        assert!(Arc::ptr_eq(&stream, &channel.stream("order-1").unwrap()));
        assert!(matches!(
            channel.create_stream("order-1"),
            Err(Error::StreamAlreadyExists(_))
        ));
        assert!(matches!(channel.stream("missing"), Err(Error::StreamNotFound(_))));
        assert!(matches!(
            channel.create_stream("canon.sneaky"),
            Err(Error::ReservedName(_))
        ));
        assert_eq!(channel.stream_names(), vec![StreamName::new("order-1")]);
    }

    #[test]
    fn test_concurrent_get_or_create_observed_once() {
        let channel = Channel::in_memory("orders").unwrap();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let channel = channel.clone();
                thread::spawn(move || channel.get_or_create_stream("shared").unwrap())
            })
            .collect();
        let streams: Vec<Arc<Stream>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(streams.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));

        let created = channel
            .admin_stream()
            .admin_events()
            .unwrap()
            .into_iter()
            .filter(|e| matches!(e, AdminEvent::StreamCreated(_)))
            .count();
        assert_eq!(created, 1);
    }

    #[test]
    fn test_admin_stream_rejects_ordinary_appends() {
        let channel = Channel::in_memory("orders").unwrap();
        let admin = channel.admin_stream();
        let mut appender = admin.reader().stream().clone().appender();
        assert!(matches!(appender.create("Anything").add(), Err(Error::ReservedName(_))));
    }

    #[test]
    fn test_reopen_restores_streams() {
        let factory: Arc<dyn StoreFactory> = Arc::new(MemoryStoreFactory::new());
        {
            let channel = Channel::open("orders", Arc::clone(&factory), ChannelOptions::default()).unwrap();
            let stream = channel.create_stream("order-1").unwrap();
            let mut appender = stream.appender();
            appender.create("Created").add().unwrap();
            appender.commit().wait().unwrap();
            channel.close();
        }

        let channel = Channel::open("orders", factory, ChannelOptions::default()).unwrap();
        assert_eq!(channel.stream_names(), vec![StreamName::new("order-1")]);
        assert_eq!(channel.stream("order-1").unwrap().len(), 1);

        let created = channel
            .admin_stream()
            .admin_events()
            .unwrap()
            .into_iter()
            .filter(|e| matches!(e, AdminEvent::ChannelCreated(_)))
            .count();
        assert_eq!(created, 1);
    }

    #[test]
    fn test_record_stream_rollback() {
        let channel = Channel::in_memory("orders").unwrap();
        let stream = channel.create_stream("order-1").unwrap();
        let mut appender = stream.appender();
        appender.create("Created").add().unwrap();
        let point = appender.commit().wait().unwrap().events[0].sequence.clone();

        channel.record_stream_rollback("order-1", point.clone(), "bad import").unwrap();
        assert!(channel
            .admin_stream()
            .admin_events()
            .unwrap()
            .contains(&AdminEvent::StreamRolledBack(StreamRolledBack {
                stream: "order-1".into(),
                rollback_point: point,
                justification: "ignored by equality".into(),
            })));
        assert_eq!(stream.len(), 1);

        assert!(matches!(
            channel.record_stream_rollback("order-1", EventSequence::new("99"), "x"),
            Err(Error::UnknownEvent { .. })
        ));
    }

    #[test]
    fn test_closed_channel_refuses_new_streams() {
        let channel = Channel::in_memory("orders").unwrap();
        channel.close();
        assert!(channel.is_closed());
        assert!(matches!(
            channel.create_stream("late"),
            Err(Error::ChannelInitialization { .. })
        ));
    }

    #[test]
    fn test_properties_configure_engine() {
        let mut properties = Properties::new();
        properties.insert("canon.notifier.threads".into(), "1".into());
        let channel = Channel::open(
            "orders",
            Arc::new(MemoryStoreFactory::new()),
            ChannelOptions {
                properties,
                ..ChannelOptions::default()
            },
        )
        .unwrap();
        assert_eq!(channel.notifier().num_threads(), 1);
        assert_eq!(channel.properties().get("canon.notifier.threads").map(String::as_str), Some("1"));
    }
}
