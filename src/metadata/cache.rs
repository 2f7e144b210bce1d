use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::core::error::{CacheError, MetadataError};
use crate::core::types::{cache_key, Media};
use crate::observability::metrics as obs;

use super::memcache::MemcacheClient;
use super::MetadataStore;

/// TTL applied when none is configured.
pub const DEFAULT_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

// ---------------------------------------------------------------------------
// MetadataCache
// ---------------------------------------------------------------------------

/// Look-aside cache in front of a [`MetadataStore`].
///
/// Reads go to memcache first and fall through to the store for the rest;
/// the records read from the store are then cached in the background with
/// `add`, which never overwrites. Writes go to both in parallel with `set`.
/// The store stays authoritative: a stale cache entry is replaced by the
/// next explicit put.
pub struct MetadataCache<S, C> {
    store: S,
    client: Arc<C>,
    ttl: Duration,
}

impl<S: MetadataStore, C: MemcacheClient> MetadataCache<S, C> {
    /// A zero `ttl` selects [`DEFAULT_TTL`].
    pub fn new(store: S, client: C, ttl: Duration) -> Self {
        Self {
            store,
            client: Arc::new(client),
            ttl: if ttl.is_zero() { DEFAULT_TTL } else { ttl },
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    fn encode(media: &[Media]) -> Result<Vec<(String, Bytes)>, MetadataError> {
        media
            .iter()
            .map(|m| Ok((cache_key(&m.id), Bytes::from(serde_json::to_vec(m)?))))
            .collect()
    }

    /// Cache records read from the store without overwriting newer entries.
    fn spawn_fill(&self, media: &[Media]) {
        let entries = match Self::encode(media) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "failed to encode media for cache fill");
                return;
            }
        };
        let client = self.client.clone();
        let ttl = self.ttl;
        tokio::spawn(async move {
            for (key, value) in entries {
                match client.add(&key, value, ttl).await {
                    Ok(()) | Err(CacheError::AlreadyExists { .. }) => {}
                    Err(e) => {
                        obs::inc_background_write_failure("cache_fill");
                        warn!(key = %key, error = %e, "metadata cache fill failed");
                    }
                }
            }
        });
    }
}

impl<S: MetadataStore, C: MemcacheClient> MetadataStore for MetadataCache<S, C> {
    async fn get(&self, ids: &[String]) -> Result<Vec<Media>, MetadataError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = ids.iter().map(|id| cache_key(id)).collect();
        let cached = match self.client.get_multi(&keys).await {
            Ok(cached) => cached,
            Err(e) => {
                warn!(error = %e, "metadata cache read failed, reading through to store");
                Default::default()
            }
        };

        let mut found = Vec::with_capacity(ids.len());
        let mut missing = Vec::new();
        for (id, key) in ids.iter().zip(&keys) {
            match cached.get(key).map(|raw| serde_json::from_slice::<Media>(raw)) {
                Some(Ok(media)) => found.push(media),
                Some(Err(e)) => {
                    warn!(id = %id, error = %e, "undecodable cached media record");
                    missing.push(id.clone());
                }
                None => missing.push(id.clone()),
            }
        }

        obs::add_metadata_cache_hits(found.len() as u64);
        obs::add_metadata_cache_misses(missing.len() as u64);
        debug!(hits = found.len(), misses = missing.len(), "metadata cache lookup");

        if missing.is_empty() {
            return Ok(found);
        }

        let fetched = self.store.get(&missing).await?;
        if !fetched.is_empty() {
            self.spawn_fill(&fetched);
        }
        found.extend(fetched);
        Ok(found)
    }

    async fn put(&self, media: &[Media]) -> Result<(), MetadataError> {
        if media.is_empty() {
            return Ok(());
        }
        let entries = Self::encode(media)?;

        let set_all = async {
            for (key, value) in entries {
                self.client.set(&key, value, self.ttl).await?;
            }
            Ok::<(), CacheError>(())
        };
        let (cache_result, store_result) = tokio::join!(set_all, self.store.put(media));

        match (store_result, cache_result) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(store), Ok(())) => Err(store),
            (Ok(()), Err(cache)) => Err(cache.into()),
            (Err(store), Err(cache)) => Err(MetadataError::Both {
                store: store.to_string(),
                cache: cache.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::MediaStatus;
    use crate::metadata::memcache::InMemoryMemcache;
    use crate::metadata::memory::MemoryMetadataStore;
    use std::collections::HashMap;

    fn cache() -> MetadataCache<MemoryMetadataStore, InMemoryMemcache> {
        MetadataCache::new(MemoryMetadataStore::new(), InMemoryMemcache::new(100), Duration::ZERO)
    }

    async fn cached_record(
        cache: &MetadataCache<MemoryMetadataStore, InMemoryMemcache>,
        id: &str,
    ) -> Option<Media> {
        let got = cache.client().get_multi(&[cache_key(id)]).await.unwrap();
        got.get(&cache_key(id))
            .map(|raw| serde_json::from_slice(raw).unwrap())
    }

    /// Wait for the background fill task.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[test]
    fn test_zero_ttl_uses_default() {
        assert_eq!(cache().ttl(), DEFAULT_TTL);
    }

    #[tokio::test]
    async fn test_put_writes_both() {
        let cache = cache();
        let a = Media::not_fetched("http://example.com/a.png");
        cache.put(std::slice::from_ref(&a)).await.unwrap();

        assert_eq!(cache.store().get(std::slice::from_ref(&a.id)).await.unwrap(), vec![a.clone()]);
        assert_eq!(cached_record(&cache, &a.id).await, Some(a));
    }

    #[tokio::test]
    async fn test_get_reads_through_and_fills() {
        let cache = cache();
        let a = Media::not_fetched("http://example.com/a.png");
        cache.store().put(std::slice::from_ref(&a)).await.unwrap();
        assert_eq!(cached_record(&cache, &a.id).await, None);

        let got = cache
            .get(&[a.id.clone(), "missing".to_string()])
            .await
            .unwrap();
        assert_eq!(got, vec![a.clone()]);

        settle().await;
        assert_eq!(cached_record(&cache, &a.id).await, Some(a));
    }

    #[tokio::test]
    async fn test_read_fill_never_overwrites() {
        let cache = cache();
        let stale = Media::not_fetched("http://example.com/a.png");
        cache.store().put(std::slice::from_ref(&stale)).await.unwrap();

        // Another process cached a newer record between our cache miss and fill.
        let mut newer = stale.clone();
        newer.status = MediaStatus::FailedPermanent;
        let value = Bytes::from(serde_json::to_vec(&newer).unwrap());
        cache.spawn_fill(std::slice::from_ref(&stale));
        cache
            .client()
            .set(&cache_key(&newer.id), value, DEFAULT_TTL)
            .await
            .unwrap();
        settle().await;

        assert_eq!(cached_record(&cache, &newer.id).await, Some(newer));
    }

    #[tokio::test]
    async fn test_cache_hit_skips_store() {
        let cache = cache();
        let a = Media::not_fetched("http://example.com/a.png");
        // Present only in the cache.
        let value = Bytes::from(serde_json::to_vec(&a).unwrap());
        cache
            .client()
            .set(&cache_key(&a.id), value, DEFAULT_TTL)
            .await
            .unwrap();

        let got = cache.get(std::slice::from_ref(&a.id)).await.unwrap();
        assert_eq!(got, vec![a]);
        assert!(cache.store().is_empty().await);
    }

    /// Memcache that fails every call.
    struct BrokenMemcache;

    impl MemcacheClient for BrokenMemcache {
        async fn get_multi(&self, _keys: &[String]) -> Result<HashMap<String, Bytes>, CacheError> {
            Err(CacheError::Server {
                reason: "down".to_string(),
            })
        }

        async fn add(&self, _key: &str, _value: Bytes, _ttl: Duration) -> Result<(), CacheError> {
            Err(CacheError::Server {
                reason: "down".to_string(),
            })
        }

        async fn set(&self, _key: &str, _value: Bytes, _ttl: Duration) -> Result<(), CacheError> {
            Err(CacheError::Server {
                reason: "down".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_put_fails_when_cache_fails_but_store_is_written() {
        let cache = MetadataCache::new(MemoryMetadataStore::new(), BrokenMemcache, Duration::ZERO);
        let a = Media::not_fetched("http://example.com/a.png");

        let err = cache.put(std::slice::from_ref(&a)).await.unwrap_err();
        assert!(matches!(err, MetadataError::Cache(_)));
        assert_eq!(cache.store().len().await, 1);
    }

    #[tokio::test]
    async fn test_get_survives_cache_outage() {
        let cache = MetadataCache::new(MemoryMetadataStore::new(), BrokenMemcache, Duration::ZERO);
        let a = Media::not_fetched("http://example.com/a.png");
        cache.store().put(std::slice::from_ref(&a)).await.unwrap();

        let got = cache.get(std::slice::from_ref(&a.id)).await.unwrap();
        assert_eq!(got, vec![a]);
    }
}
