//! Two-tier cache for slow-changing reference data.
//!
//! Each tier implements [`Fetch`] and wraps the next one: a [`MemoryCache`]
//! over a [`BlobCache`] over a remote fetch. The memory tier holds its value
//! for the lifetime of the process and coalesces concurrent callers behind one
//! mutex. The blob tier treats objects whose last-modified time is older than
//! the TTL as missing. Neither tier ever stores a failed result.

use crate::auth::AccessToken;
use crate::blob::{BlobRead, BlobStore, Codec};
use crate::client::ClientError;
use crate::config::BlobCacheConfig;
use crate::metrics_defs::{CACHE_BLOB_HIT, CACHE_BLOB_MISS, CACHE_MEMORY_HIT};
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use shared::counter;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;

#[derive(thiserror::Error, Debug)]
pub enum CacheError {
    #[error(transparent)]
    Client(#[from] ClientError),
}

impl CacheError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, CacheError::Client(e) if e.is_unauthorized())
    }
}

#[async_trait]
pub trait Fetch<T>: Send + Sync {
    async fn fetch(&self, token: &AccessToken) -> Result<T, CacheError>;
}

/// Adapts an async function of the access token into a [`Fetch`]. This is the
/// innermost tier of a chain.
pub struct FetchFn<F>(pub F);

#[async_trait]
impl<T, F, Fut> Fetch<T> for FetchFn<F>
where
    T: Send + 'static,
    F: Fn(AccessToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, ClientError>> + Send + 'static,
{
    async fn fetch(&self, token: &AccessToken) -> Result<T, CacheError> {
        Ok((self.0)(token.clone()).await?)
    }
}

/// Process-lifetime memoization. The lock is held across the inner fetch so a
/// cold cache makes exactly one call no matter how many tasks are waiting.
pub struct MemoryCache<T> {
    key: &'static str,
    value: Mutex<Option<Arc<T>>>,
    inner: Box<dyn Fetch<T>>,
}

impl<T> MemoryCache<T> {
    pub fn new(key: &'static str, inner: Box<dyn Fetch<T>>) -> Self {
        MemoryCache {
            key,
            value: Mutex::new(None),
            inner,
        }
    }
}

#[async_trait]
impl<T: Send + Sync + 'static> Fetch<Arc<T>> for MemoryCache<T> {
    async fn fetch(&self, token: &AccessToken) -> Result<Arc<T>, CacheError> {
        let mut value = self.value.lock().await;
        if let Some(cached) = value.as_ref() {
            counter!(CACHE_MEMORY_HIT, "key" => self.key).increment(1);
            return Ok(cached.clone());
        }

        let fetched = Arc::new(self.inner.fetch(token).await?);
        *value = Some(fetched.clone());
        Ok(fetched)
    }
}

pub struct BlobCache<T> {
    key: &'static str,
    store: Arc<dyn BlobStore>,
    codec: Codec,
    ttl: Duration,
    inner: Box<dyn Fetch<T>>,
}

impl<T> BlobCache<T> {
    pub fn new(
        key: &'static str,
        store: Arc<dyn BlobStore>,
        codec: Codec,
        ttl: Duration,
        inner: Box<dyn Fetch<T>>,
    ) -> Self {
        BlobCache {
            key,
            store,
            codec,
            ttl,
            inner,
        }
    }
}

#[async_trait]
impl<T> Fetch<T> for BlobCache<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn fetch(&self, token: &AccessToken) -> Result<T, CacheError> {
        let fresh_after = SystemTime::now()
            .checked_sub(self.ttl)
            .unwrap_or(UNIX_EPOCH);

        match self.store.get_if_modified_since(self.key, fresh_after).await {
            Ok(BlobRead::Found(data)) => match self.codec.decode::<T>(&data) {
                Ok(value) => {
                    counter!(CACHE_BLOB_HIT, "key" => self.key).increment(1);
                    return Ok(value);
                }
                Err(e) => {
                    tracing::warn!(key = self.key, error = %e, "discarding undecodable cache object");
                    counter!(CACHE_BLOB_MISS, "key" => self.key).increment(1);
                }
            },
            Ok(BlobRead::NotFound | BlobRead::NotModified) => {
                counter!(CACHE_BLOB_MISS, "key" => self.key).increment(1);
            }
            Err(e) => {
                tracing::warn!(key = self.key, error = %e, "blob cache unreadable, fetching upstream");
                counter!(CACHE_BLOB_MISS, "key" => self.key).increment(1);
            }
        }

        let value = self.inner.fetch(token).await?;

        // The value is good even if it cannot be stored; the next cold
        // process will simply fetch it again.
        match self.codec.encode(&value) {
            Ok(data) => {
                if let Err(e) = self.store.put(self.key, data).await {
                    tracing::warn!(key = self.key, error = %e, "failed to store cache object");
                }
            }
            Err(e) => tracing::warn!(key = self.key, error = %e, "failed to encode cache object"),
        }

        Ok(value)
    }
}

/// Builds memory-over-blob-over-remote chains sharing one blob store.
#[derive(Clone)]
pub struct CacheLayers {
    store: Arc<dyn BlobStore>,
    config: BlobCacheConfig,
}

impl CacheLayers {
    pub fn new(store: Arc<dyn BlobStore>, config: BlobCacheConfig) -> Self {
        CacheLayers { store, config }
    }

    pub fn wrap<T>(&self, key: &'static str, remote: Box<dyn Fetch<T>>) -> MemoryCache<T>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let blob = BlobCache::new(
            key,
            self.store.clone(),
            Codec::new(self.config.compression),
            Duration::from_secs(self.config.ttl_secs),
            remote,
        );
        MemoryCache::new(key, Box::new(blob))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::{BlobError, MemoryBlobStore};
    use crate::config::{BlobStoreType, Compression};
    use bytes::Bytes;
    use reqwest::StatusCode;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::task::JoinSet;

    const KEY: &str = "catalog/test";
    const TTL: Duration = Duration::from_secs(3600);

    fn counting_remote(
        calls: Arc<AtomicUsize>,
        fail_first: bool,
    ) -> Box<dyn Fetch<Vec<String>>> {
        Box::new(FetchFn(move |_token: AccessToken| {
            let calls = calls.clone();
            async move {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                if fail_first && call == 0 {
                    return Err(ClientError::Status {
                        status: StatusCode::SERVICE_UNAVAILABLE,
                        url: "http://upstream/data/track/get".into(),
                    });
                }
                Ok(vec!["lime-rock".to_string(), "daytona".to_string()])
            }
        }))
    }

    fn layers(store: Arc<MemoryBlobStore>) -> CacheLayers {
        CacheLayers::new(
            store,
            BlobCacheConfig {
                r#type: BlobStoreType::Memory,
                ttl_secs: TTL.as_secs(),
                compression: Compression::Zstd1,
            },
        )
    }

    fn blob_cache(store: Arc<MemoryBlobStore>, calls: Arc<AtomicUsize>) -> BlobCache<Vec<String>> {
        BlobCache::new(
            KEY,
            store,
            Codec::new(Compression::Zstd1),
            TTL,
            counting_remote(calls, false),
        )
    }

    fn encoded(value: &Vec<String>) -> Bytes {
        Codec::new(Compression::Zstd1).encode(value).unwrap()
    }

    #[tokio::test]
    async fn test_concurrent_cold_calls_fetch_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let store = Arc::new(MemoryBlobStore::new());
        let cache = Arc::new(layers(store.clone()).wrap(KEY, counting_remote(calls.clone(), false)));

        let mut join_set = JoinSet::new();
        for _ in 0..16 {
            let cache = cache.clone();
            join_set.spawn(async move { cache.fetch(&AccessToken::new("tok")).await });
        }

        let mut results = Vec::new();
        while let Some(result) = join_set.join_next().await {
            results.push(result.unwrap().unwrap());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(results.len(), 16);
        assert!(results.iter().all(|r| Arc::ptr_eq(r, &results[0])));
        assert!(store.contains(KEY));
    }

    #[tokio::test]
    async fn test_failure_is_not_cached() {
        let calls = Arc::new(AtomicUsize::new(0));
        let store = Arc::new(MemoryBlobStore::new());
        let cache = layers(store.clone()).wrap(KEY, counting_remote(calls.clone(), true));
        let token = AccessToken::new("tok");

        assert!(matches!(
            cache.fetch(&token).await,
            Err(CacheError::Client(ClientError::Status { .. }))
        ));
        assert!(!store.contains(KEY));

        let value = cache.fetch(&token).await.unwrap();
        assert_eq!(value.len(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // Served from memory now.
        cache.fetch(&token).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fresh_blob_is_served() {
        let calls = Arc::new(AtomicUsize::new(0));
        let store = Arc::new(MemoryBlobStore::new());
        let cached = vec!["from-blob".to_string()];
        store.put_with_modified(KEY, encoded(&cached), SystemTime::now());

        let cache = blob_cache(store, calls.clone());
        assert_eq!(cache.fetch(&AccessToken::new("tok")).await.unwrap(), cached);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stale_blob_is_a_miss() {
        let calls = Arc::new(AtomicUsize::new(0));
        let store = Arc::new(MemoryBlobStore::new());
        let stale = SystemTime::now() - 2 * TTL;
        store.put_with_modified(KEY, encoded(&vec!["old".to_string()]), stale);

        let cache = blob_cache(store.clone(), calls.clone());
        let value = cache.fetch(&AccessToken::new("tok")).await.unwrap();
        assert_eq!(value, vec!["lime-rock".to_string(), "daytona".to_string()]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // The refresh replaced the stale object.
        let refreshed = store
            .get_if_modified_since(KEY, SystemTime::now() - TTL)
            .await
            .unwrap();
        assert_eq!(refreshed, BlobRead::Found(encoded(&value)));
    }

    #[tokio::test]
    async fn test_missing_blob_is_a_miss() {
        let calls = Arc::new(AtomicUsize::new(0));
        let store = Arc::new(MemoryBlobStore::new());

        let cache = blob_cache(store.clone(), calls.clone());
        cache.fetch(&AccessToken::new("tok")).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(store.contains(KEY));
    }

    #[tokio::test]
    async fn test_corrupt_blob_is_a_miss() {
        let calls = Arc::new(AtomicUsize::new(0));
        let store = Arc::new(MemoryBlobStore::new());
        store.put_with_modified(KEY, Bytes::from_static(b"garbage"), SystemTime::now());

        let cache = blob_cache(store.clone(), calls.clone());
        let value = cache.fetch(&AccessToken::new("tok")).await.unwrap();
        assert_eq!(value.len(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // A second, independent cache now decodes the rewritten object.
        let second = blob_cache(store, calls.clone());
        assert_eq!(second.fetch(&AccessToken::new("tok")).await.unwrap(), value);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unauthorized_classification() {
        assert!(CacheError::Client(ClientError::Unauthorized).is_unauthorized());
        assert!(
            !CacheError::Client(ClientError::Status {
                status: StatusCode::BAD_GATEWAY,
                url: "http://upstream/data/car/get".into(),
            })
            .is_unauthorized()
        );
    }

    struct UnreadableStore;

    #[async_trait]
    impl BlobStore for UnreadableStore {
        async fn get_if_modified_since(
            &self,
            _key: &str,
            _since: SystemTime,
        ) -> Result<BlobRead, BlobError> {
            Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied").into())
        }

        async fn put(&self, _key: &str, _data: Bytes) -> Result<(), BlobError> {
            Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied").into())
        }
    }

    #[tokio::test]
    async fn test_unreadable_blob_store_falls_through() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = BlobCache::new(
            KEY,
            Arc::new(UnreadableStore),
            Codec::new(Compression::Zstd1),
            TTL,
            counting_remote(calls.clone(), false),
        );

        let value = cache.fetch(&AccessToken::new("tok")).await.unwrap();
        assert_eq!(value, vec!["lime-rock".to_string(), "daytona".to_string()]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
