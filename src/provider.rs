//! # Channel Providers
//!
//! Channels are opened by URI. The scheme picks a [`ChannelProvider`], the
//! rest of the URI tells the provider where the channel lives:
//!
//! ```text
//!   mem://orders              in-memory channel "orders"
//!   sqlite:///data/orders.db  channel "orders" stored in /data/orders.db
//! ```
//!
//! ## Discovery
//!
//! Providers are registered directly or produced by loaders. A scheme that no
//! registered provider serves triggers one reload (every loader runs again)
//! before the lookup is declared a failure.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use tracing::debug;

use crate::channel::{Channel, ChannelOptions};
use crate::error::{Error, Result};
use crate::storage::SqliteStoreFactory;
use crate::store::{MemoryStoreFactory, StoreFactory};

// =============================================================================
// URIs
// =============================================================================

/// A parsed `scheme://location` channel URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelUri {
    scheme: String,
    location: String,
}

impl ChannelUri {
    /// Parses `scheme://location`.
    ///
    /// # Errors
    ///
    /// `Error::ChannelInitialization` if the separator, the scheme or the
    /// location is missing.
    pub fn parse(uri: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::ChannelInitialization {
            channel: uri.to_string(),
            reason: reason.to_string(),
        };
        let (scheme, location) = uri.split_once("://").ok_or_else(|| invalid("expected scheme://location"))?;
        if scheme.is_empty() {
            return Err(invalid("missing scheme"));
        }
        if location.is_empty() {
            return Err(invalid("missing location"));
        }
        Ok(Self {
            scheme: scheme.to_ascii_lowercase(),
            location: location.to_string(),
        })
    }

    /// The scheme, lowercased.
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Everything after `://`.
    pub fn location(&self) -> &str {
        &self.location
    }

    /// The channel name: the location's file stem.
    pub fn channel_name(&self) -> String {
        Path::new(&self.location)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(&self.location)
            .to_string()
    }
}

impl fmt::Display for ChannelUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.location)
    }
}

// =============================================================================
// Providers
// =============================================================================

/// Opens channels for one URI scheme.
pub trait ChannelProvider: Send + Sync {
    /// The scheme served, e.g. `"mem"`.
    fn scheme(&self) -> &str;

    /// Opens (or returns the already open) channel at `uri`.
    fn open(&self, uri: &ChannelUri, options: ChannelOptions) -> Result<Channel>;
}

/// Keeps one open channel per location; a closed one is reopened over the
/// same stores.
#[derive(Default)]
struct OpenChannels {
    channels: Mutex<HashMap<String, Channel>>,
}

impl OpenChannels {
    fn get_or_open<F>(&self, location: &str, open: F) -> Result<Channel>
    where
        F: FnOnce() -> Result<Channel>,
    {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(channel) = channels.get(location) {
            if !channel.is_closed() {
                return Ok(channel.clone());
            }
        }
        let channel = open()?;
        channels.insert(location.to_string(), channel.clone());
        Ok(channel)
    }
}

/// `mem://name`: channels that live as long as the provider.
#[derive(Default)]
pub struct MemoryChannelProvider {
    stores: Mutex<HashMap<String, Arc<MemoryStoreFactory>>>,
    open: OpenChannels,
}

impl MemoryChannelProvider {
    /// An empty provider.
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChannelProvider for MemoryChannelProvider {
    fn scheme(&self) -> &str {
        "mem"
    }

    fn open(&self, uri: &ChannelUri, options: ChannelOptions) -> Result<Channel> {
        self.open.get_or_open(uri.location(), || {
            let factory = Arc::clone(
                self.stores
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .entry(uri.location().to_string())
                    .or_default(),
            );
            Channel::open(uri.channel_name(), factory as Arc<dyn StoreFactory>, options)
        })
    }
}

impl fmt::Debug for MemoryChannelProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryChannelProvider").finish_non_exhaustive()
    }
}

/// `sqlite://path`: one SQLite file per channel.
#[derive(Default)]
pub struct SqliteChannelProvider {
    open: OpenChannels,
}

impl SqliteChannelProvider {
    /// A provider with no open channels.
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChannelProvider for SqliteChannelProvider {
    fn scheme(&self) -> &str {
        "sqlite"
    }

    fn open(&self, uri: &ChannelUri, options: ChannelOptions) -> Result<Channel> {
        self.open.get_or_open(uri.location(), || {
            let factory = SqliteStoreFactory::open_file(uri.location()).map_err(|e| Error::ChannelInitialization {
                channel: uri.to_string(),
                reason: e.to_string(),
            })?;
            Channel::open(uri.channel_name(), Arc::new(factory), options)
        })
    }
}

impl fmt::Debug for SqliteChannelProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteChannelProvider").finish_non_exhaustive()
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Produces providers on (re)load.
pub type ProviderLoader = Box<dyn Fn() -> Vec<Arc<dyn ChannelProvider>> + Send + Sync>;

/// Scheme → provider lookup with reload-and-retry.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: RwLock<HashMap<String, Arc<dyn ChannelProvider>>>,
    loaders: Mutex<Vec<ProviderLoader>>,
}

impl ProviderRegistry {
    /// A registry with nothing registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry that loads the `mem` and `sqlite` providers on first use.
    pub fn with_defaults() -> Self {
        Self::new().with_loader(|| {
            vec![
                Arc::new(MemoryChannelProvider::new()) as Arc<dyn ChannelProvider>,
                Arc::new(SqliteChannelProvider::new()),
            ]
        })
    }

    /// Adds a loader.
    pub fn with_loader<F>(self, loader: F) -> Self
    where
        F: Fn() -> Vec<Arc<dyn ChannelProvider>> + Send + Sync + 'static,
    {
        self.loaders
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Box::new(loader));
        self
    }

    /// Registers a provider, replacing any other for the same scheme.
    pub fn register(&self, provider: Arc<dyn ChannelProvider>) {
        let scheme = provider.scheme().to_ascii_lowercase();
        self.providers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(scheme, provider);
    }

    fn lookup(&self, scheme: &str) -> Option<Arc<dyn ChannelProvider>> {
        self.providers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(scheme)
            .cloned()
    }

    /// Runs every loader and registers the schemes they produce that are not
    /// registered yet.
    pub fn reload(&self) {
        let loaders = self.loaders.lock().unwrap_or_else(|e| e.into_inner());
        for loader in loaders.iter() {
            for provider in loader() {
                if self.lookup(&provider.scheme().to_ascii_lowercase()).is_none() {
                    debug!(scheme = provider.scheme(), "loaded channel provider");
                    self.register(provider);
                }
            }
        }
    }

    /// Finds the provider for `scheme`, reloading once on a miss.
    ///
    /// # Errors
    ///
    /// `Error::ChannelInitialization` if no provider serves the scheme.
    pub fn resolve(&self, scheme: &str) -> Result<Arc<dyn ChannelProvider>> {
        let scheme = scheme.to_ascii_lowercase();
        if let Some(provider) = self.lookup(&scheme) {
            return Ok(provider);
        }
        self.reload();
        self.lookup(&scheme).ok_or_else(|| Error::ChannelInitialization {
            channel: format!("{scheme}://"),
            reason: format!("no channel provider for scheme '{scheme}'"),
        })
    }

    /// Parses `uri` and opens the channel through its provider.
    pub fn open(&self, uri: &str, options: ChannelOptions) -> Result<Channel> {
        let uri = ChannelUri::parse(uri)?;
        self.resolve(uri.scheme())?.open(&uri, options)
    }

    /// Registered schemes, sorted.
    pub fn schemes(&self) -> Vec<String> {
        let mut schemes: Vec<String> = self
            .providers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        schemes.sort();
        schemes
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("schemes", &self.schemes())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_parse_uris() {
        let mem = ChannelUri::parse("mem://orders").unwrap();
        assert_eq!(mem.scheme(), "mem");
        assert_eq!(mem.channel_name(), "orders");

        let file = ChannelUri::parse("SQLITE:///var/data/orders.db").unwrap();
        assert_eq!(file.scheme(), "sqlite");
        assert_eq!(file.location(), "/var/data/orders.db");
        assert_eq!(file.channel_name(), "orders");

        assert!(ChannelUri::parse("orders").is_err());
        assert!(ChannelUri::parse("://orders").is_err());
        assert!(ChannelUri::parse("mem://").is_err());
    }

    #[test]
    fn test_resolve_reloads_once_then_fails() {
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&loads);
        let registry = ProviderRegistry::new().with_loader(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            vec![Arc::new(MemoryChannelProvider::new()) as Arc<dyn ChannelProvider>]
        });

        assert!(registry.resolve("mem").is_ok());
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(registry.resolve("mem").is_ok());
        assert_eq!(loads.load(Ordering::SeqCst), 1);

        assert!(matches!(
            registry.resolve("kafka"),
            Err(Error::ChannelInitialization { .. })
        ));
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_memory_provider_returns_open_channel() {
        let registry = ProviderRegistry::with_defaults();
        let a = registry.open("mem://orders", ChannelOptions::default()).unwrap();
        a.get_or_create_stream("order-1").unwrap();

        let b = registry.open("mem://orders", ChannelOptions::default()).unwrap();
        assert_eq!(b.stream_names().len(), 1);

        a.close();
        let c = registry.open("mem://orders", ChannelOptions::default()).unwrap();
        assert!(!c.is_closed());
        assert_eq!(c.stream_names().len(), 1);
    }

    #[test]
    fn test_sqlite_provider_opens_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("orders.db");
        let registry = ProviderRegistry::with_defaults();

        let channel = registry
            .open(&format!("sqlite://{}", path.display()), ChannelOptions::default())
            .unwrap();
        assert_eq!(channel.name().as_str(), "orders");
        assert!(path.exists());
        assert_eq!(registry.schemes(), vec!["mem".to_string(), "sqlite".to_string()]);
    }
}
