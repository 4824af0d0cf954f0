//! # Engine Configuration
//!
//! Plain structs with `Default` impls. Every default lives in a `DEFAULT_*`
//! constant so it is documented once and visible to callers.
//!
//! Channels can also be configured from their property map (the same map a
//! provider receives with the channel URI) via
//! [`EngineConfig::from_properties`]:
//!
//! | Property | Field |
//! |----------|-------|
//! | `canon.notifier.threads` | `notifier.threads` |
//! | `canon.notifier.idle_backoff_ms` | `notifier.idle_backoff` |
//! | `canon.notifier.poll_timeout_ms` | `notifier.poll_timeout` |
//! | `canon.writer.channel_capacity` | `writer.channel_capacity` |
//! | `canon.writer.transaction_cache_size` | `writer.transaction_cache_size` |
//! | `canon.callback.threads` | `callback_threads` |
//! | `canon.tracking.dir` | `tracking_dir` |
//! | `canon.sequencer` (`counter` / `content-hash`) | `sequencer` |
//!
//! Unknown keys are ignored so providers can carry their own settings in the
//! same map.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::sequencer::SequencerKind;
use crate::types::Properties;

// =============================================================================
// Defaults
// =============================================================================

/// Bound of the commit writer's request channel. Committers block when full.
pub const DEFAULT_WRITER_CHANNEL_CAPACITY: usize = 1024;

/// Number of recent transaction results the commit writer remembers.
pub const DEFAULT_TRANSACTION_CACHE_SIZE: usize = 10_000;

/// Handler notifier worker threads.
pub const DEFAULT_NOTIFIER_THREADS: usize = 3;

/// How long an idle notifier worker sleeps before scanning again.
pub const DEFAULT_IDLE_BACKOFF_MS: u64 = 5;

/// Upper bound a worker waits on one reader before moving on.
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 0;

/// Threads in the completion watcher's callback pool.
pub const DEFAULT_CALLBACK_THREADS: usize = 2;

// =============================================================================
// Writer
// =============================================================================

/// Configuration for a channel's commit writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriterConfig {
    /// Bound of the request channel.
    pub channel_capacity: usize,

    /// Entries in the transaction-id → result cache.
    pub transaction_cache_size: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_WRITER_CHANNEL_CAPACITY,
            transaction_cache_size: DEFAULT_TRANSACTION_CACHE_SIZE,
        }
    }
}

// =============================================================================
// Notifier
// =============================================================================

/// Configuration for the async handler notifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifierConfig {
    /// Worker threads started with the notifier.
    pub threads: usize,

    /// Sleep after a full pass over the handlers found nothing to do.
    pub idle_backoff: Duration,

    /// How long a worker may block on one handler's reader. Zero means a
    /// non-blocking poll.
    pub poll_timeout: Duration,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            threads: DEFAULT_NOTIFIER_THREADS,
            idle_backoff: Duration::from_millis(DEFAULT_IDLE_BACKOFF_MS),
            poll_timeout: Duration::from_millis(DEFAULT_POLL_TIMEOUT_MS),
        }
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Everything a channel needs to start.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EngineConfig {
    /// Commit writer settings.
    pub writer: WriterConfig,

    /// Handler notifier settings.
    pub notifier: NotifierConfig,

    /// Threads in the completion watcher's callback pool.
    pub callback_threads: Option<usize>,

    /// Directory for durable reader tracking files. `None` keeps positions in
    /// memory only.
    pub tracking_dir: Option<PathBuf>,

    /// Sequencer handed to each stream.
    pub sequencer: SequencerKind,
}

impl EngineConfig {
    /// Builds a config from a channel property map, starting from defaults.
    ///
    /// # Errors
    ///
    /// `Error::ChannelInitialization` naming the property if a value does not
    /// parse.
    pub fn from_properties(properties: &Properties) -> Result<Self> {
        let mut config = Self::default();
        config.apply(properties)?;
        Ok(config)
    }

    /// Overlays properties onto this config.
    pub fn apply(&mut self, properties: &Properties) -> Result<()> {
        if let Some(v) = parse::<usize>(properties, "canon.notifier.threads")? {
            self.notifier.threads = v;
        }
        if let Some(v) = parse::<u64>(properties, "canon.notifier.idle_backoff_ms")? {
            self.notifier.idle_backoff = Duration::from_millis(v);
        }
        if let Some(v) = parse::<u64>(properties, "canon.notifier.poll_timeout_ms")? {
            self.notifier.poll_timeout = Duration::from_millis(v);
        }
        if let Some(v) = parse::<usize>(properties, "canon.writer.channel_capacity")? {
            self.writer.channel_capacity = v.max(1);
        }
        if let Some(v) = parse::<usize>(properties, "canon.writer.transaction_cache_size")? {
            self.writer.transaction_cache_size = v.max(1);
        }
        if let Some(v) = parse::<usize>(properties, "canon.callback.threads")? {
            self.callback_threads = Some(v.max(1));
        }
        if let Some(dir) = properties.get("canon.tracking.dir") {
            self.tracking_dir = Some(PathBuf::from(dir));
        }
        if let Some(value) = properties.get("canon.sequencer") {
            self.sequencer = SequencerKind::parse(value)
                .ok_or_else(|| invalid("canon.sequencer", value))?;
        }
        Ok(())
    }

    /// Callback pool size, falling back to the default.
    pub fn callback_threads(&self) -> usize {
        self.callback_threads.unwrap_or(DEFAULT_CALLBACK_THREADS)
    }
}

fn parse<T: FromStr>(properties: &Properties, key: &str) -> Result<Option<T>> {
    match properties.get(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| invalid(key, raw)),
    }
}

fn invalid(key: &str, value: &str) -> Error {
    Error::ChannelInitialization {
        channel: "<config>".to_string(),
        reason: format!("invalid value '{value}' for property '{key}'"),
    }
}

// =============================================================================
// Tests
// =============================================================================
