//! # The EventLog Handle
//!
//! [`EventLog`] is the top-level entry point. It owns what every channel of a
//! process shares:
//!
//! - the global codec level (parent of every channel's codecs)
//! - one [`CompletionWatcher`] for commit callbacks
//! - the provider registry that turns URIs into channels
//!
//! ```text
//!   EventLog
//!     ├── codecs (global) ◄── channel codecs ◄── stream codecs ◄── appender codecs
//!     ├── watcher
//!     └── registry ── mem:// ──► MemoryChannelProvider
//!                  └─ sqlite:// ► SqliteChannelProvider
//! ```
//!
//! ## Thread Safety
//!
//! `EventLog` is `Clone`, `Send` and `Sync`. All clones share state.
//! Dropping the last clone closes every channel it opened.
//!
//! ## Example
//!
//! ```rust,ignore
//! let log = EventLog::new(EngineConfig::default())?;
//! let channel = log.open_channel("mem://orders")?;
//! let stream = channel.get_or_create_stream("order-42")?;
//!
//! let mut appender = stream.appender();
//! appender.create("Created").content(b"0123456789".to_vec()).add()?;
//! appender.create("Shipped").add()?;
//! let committed = appender.commit().await?;
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::info;

use crate::channel::{Channel, ChannelOptions};
use crate::codec::{Codec, CodecResolver, JsonCodec};
use crate::completion::CompletionWatcher;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::provider::{ChannelUri, ProviderRegistry};
use crate::types::Properties;

/// The main handle.
#[derive(Clone)]
pub struct EventLog {
    inner: Arc<EventLogInner>,
}

struct EventLogInner {
    config: EngineConfig,
    codecs: Arc<CodecResolver>,
    watcher: Arc<CompletionWatcher>,
    registry: ProviderRegistry,
    channels: Mutex<HashMap<String, Channel>>,
}

impl EventLog {
    /// A log with the default `mem` and `sqlite` providers.
    ///
    /// # Errors
    ///
    /// `Error::Io` if the completion watcher cannot start.
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::with_registry(config, ProviderRegistry::with_defaults())
    }

    /// A log that resolves URIs with `registry`.
    pub fn with_registry(config: EngineConfig, registry: ProviderRegistry) -> Result<Self> {
        let codecs = CodecResolver::new();
        codecs.register(Arc::new(JsonCodec::all()));
        let watcher = Arc::new(CompletionWatcher::new(config.callback_threads())?);
        Ok(Self {
            inner: Arc::new(EventLogInner {
                config,
                codecs: Arc::new(codecs),
                watcher,
                registry,
                channels: Mutex::new(HashMap::new()),
            }),
        })
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<String, Channel>> {
        self.inner.channels.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Opens the channel at `uri` with no extra properties.
    pub fn open_channel(&self, uri: &str) -> Result<Channel> {
        self.open_channel_with(uri, Properties::new())
    }

    /// Opens the channel at `uri`. `properties` override the log's config for
    /// this channel only.
    ///
    /// # Errors
    ///
    /// `Error::ChannelInitialization` for a bad URI, an unknown scheme or
    /// malformed properties.
    pub fn open_channel_with(&self, uri: &str, properties: Properties) -> Result<Channel> {
        let parsed = ChannelUri::parse(uri)?;
        let options = ChannelOptions {
            config: self.inner.config.clone(),
            properties,
            global_codecs: Some(Arc::clone(&self.inner.codecs)),
            watcher: Some(Arc::clone(&self.inner.watcher)),
            ..ChannelOptions::default()
        };
        let channel = self.inner.registry.resolve(parsed.scheme())?.open(&parsed, options)?;
        self.channels().insert(parsed.to_string(), channel.clone());
        info!(uri = %parsed, "opened channel");
        Ok(channel)
    }

    /// Channels opened through this log and still open.
    pub fn channels_open(&self) -> Vec<Channel> {
        self.channels()
            .values()
            .filter(|c| !c.is_closed())
            .cloned()
            .collect()
    }

    /// The global codec level.
    pub fn codecs(&self) -> &Arc<CodecResolver> {
        &self.inner.codecs
    }

    /// Registers a global codec.
    pub fn use_codec(&self, codec: Arc<dyn Codec>) {
        self.inner.codecs.register(codec);
    }

    /// The shared completion watcher.
    pub fn watcher(&self) -> &Arc<CompletionWatcher> {
        &self.inner.watcher
    }

    /// The provider registry.
    pub fn registry(&self) -> &ProviderRegistry {
        &self.inner.registry
    }

    /// Closes every channel opened through this log.
    pub fn close(&self) {
        self.inner.close();
    }
}

impl EventLogInner {
    fn close(&self) {
        let channels: Vec<Channel> = self
            .channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, c)| c)
            .collect();
        for channel in channels {
            channel.close();
        }
    }
}

impl Drop for EventLogInner {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog")
            .field("config", &self.inner.config)
            .field("registry", &self.inner.registry)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================
