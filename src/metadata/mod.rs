pub mod cache;
pub mod memcache;
pub mod memory;
pub mod sqlite;

use std::future::Future;
use std::time::Duration;

use crate::core::config::MetadataConfig;
use crate::core::error::MetadataError;
use crate::core::types::Media;

pub use cache::MetadataCache;
pub use memcache::{InMemoryMemcache, MemcacheClient, MemcacheBackend, MemcachedClient};
pub use memory::MemoryMetadataStore;
pub use sqlite::SqliteMetadataStore;

/// Per-operation timeout for memcached I/O.
const MEMCACHE_IO_TIMEOUT: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// MetadataStore trait
// ---------------------------------------------------------------------------

/// Durable index of [`Media`] records keyed by id.
pub trait MetadataStore: Send + Sync + 'static {
    /// Fetch the records for `ids`. Missing ids are silently omitted.
    fn get(&self, ids: &[String]) -> impl Future<Output = Result<Vec<Media>, MetadataError>> + Send;

    /// Write `media`, replacing any existing record with the same id.
    fn put(&self, media: &[Media]) -> impl Future<Output = Result<(), MetadataError>> + Send;
}

// ---------------------------------------------------------------------------
// Runtime selection
// ---------------------------------------------------------------------------

/// The authoritative store chosen from `metadata.backend`.
pub enum StoreBackend {
    Memory(MemoryMetadataStore),
    Sqlite(SqliteMetadataStore),
}

impl MetadataStore for StoreBackend {
    async fn get(&self, ids: &[String]) -> Result<Vec<Media>, MetadataError> {
        match self {
            StoreBackend::Memory(s) => s.get(ids).await,
            StoreBackend::Sqlite(s) => s.get(ids).await,
        }
    }

    async fn put(&self, media: &[Media]) -> Result<(), MetadataError> {
        match self {
            StoreBackend::Memory(s) => s.put(media).await,
            StoreBackend::Sqlite(s) => s.put(media).await,
        }
    }
}

/// The store the proxy talks to: either the store itself or the store behind
/// a memcache look-aside layer.
pub enum MetadataBackend {
    Direct(StoreBackend),
    Cached(MetadataCache<StoreBackend, MemcacheBackend>),
}

impl MetadataBackend {
    /// Build the configured store, fronted by memcached when an address is set.
    pub fn from_config(config: &MetadataConfig) -> Result<Self, MetadataError> {
        let store = match config.backend.as_str() {
            "memory" => StoreBackend::Memory(MemoryMetadataStore::new()),
            "sqlite" => StoreBackend::Sqlite(SqliteMetadataStore::open(&config.sqlite_path)?),
            other => {
                return Err(MetadataError::Store {
                    reason: format!("unknown metadata backend '{}'", other),
                })
            }
        };

        if config.memcached_addr.is_empty() {
            return Ok(Self::Direct(store));
        }
        let client = MemcachedClient::new(&config.memcached_addr, MEMCACHE_IO_TIMEOUT);
        Ok(Self::Cached(MetadataCache::new(
            store,
            MemcacheBackend::Memcached(client),
            Duration::from_secs(config.cache_ttl_secs),
        )))
    }
}

impl MetadataStore for MetadataBackend {
    async fn get(&self, ids: &[String]) -> Result<Vec<Media>, MetadataError> {
        match self {
            MetadataBackend::Direct(s) => s.get(ids).await,
            MetadataBackend::Cached(s) => s.get(ids).await,
        }
    }

    async fn put(&self, media: &[Media]) -> Result<(), MetadataError> {
        match self {
            MetadataBackend::Direct(s) => s.put(media).await,
            MetadataBackend::Cached(s) => s.put(media).await,
        }
    }
}
