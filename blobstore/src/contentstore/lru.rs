use std::{num::NonZeroUsize, ops::Range, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;
use tracing::{instrument, trace};

use super::{ByteStream, ContentStore};
use crate::Error;

/// Content larger than this isn't kept in the cache by default.
pub const DEFAULT_MAX_CONTENT_SIZE: usize = 512 * 1024;

/// Keeps recently read small contents of another [ContentStore] in memory.
///
/// Only [ContentStore::get_content] is served from the cache. Writes and
/// removals through this store evict the affected paths, writes that bypass
/// it are not seen until the entry is evicted.
#[derive(Clone)]
pub struct LruContentStore<CS> {
    inner: CS,
    lru: Arc<Mutex<LruCache<String, Bytes>>>,
    max_content_size: usize,
}

impl<CS> LruContentStore<CS> {
    pub fn with_capacity(inner: CS, capacity: NonZeroUsize) -> Self {
        Self {
            inner,
            lru: Arc::new(Mutex::new(LruCache::new(capacity))),
            max_content_size: DEFAULT_MAX_CONTENT_SIZE,
        }
    }

    /// Set the size above which contents are passed through uncached.
    pub fn with_max_content_size(mut self, max_content_size: usize) -> Self {
        self.max_content_size = max_content_size;
        self
    }

    /// Number of contents currently cached.
    pub fn len(&self) -> usize {
        self.lru.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lru.lock().is_empty()
    }

    /// Evicts the path, and everything below it.
    fn evict(&self, path: &str) {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let mut lru = self.lru.lock();

        lru.pop(path);
        let below: Vec<String> = lru
            .iter()
            .map(|(k, _)| k)
            .filter(|k| k.starts_with(&prefix))
            .cloned()
            .collect();
        for k in below {
            lru.pop(&k);
        }
    }
}

#[async_trait]
impl<CS> ContentStore for LruContentStore<CS>
where
    CS: ContentStore,
{
    #[instrument(level = "trace", skip(self), err)]
    async fn get_content(&self, path: &str) -> Result<Bytes, Error> {
        if let Some(content) = self.lru.lock().get(path) {
            trace!("cache hit");
            return Ok(content.clone());
        }

        let content = self.inner.get_content(path).await?;
        if content.len() <= self.max_content_size {
            self.lru.lock().put(path.to_string(), content.clone());
        }
        Ok(content)
    }

    async fn put_content(&self, path: &str, content: Bytes) -> Result<(), Error> {
        let result = self.inner.put_content(path, content).await;
        self.evict(path);
        result
    }

    async fn exists(&self, path: &str) -> Result<bool, Error> {
        if self.lru.lock().contains(path) {
            return Ok(true);
        }
        self.inner.exists(path).await
    }

    async fn remove(&self, path: &str) -> Result<(), Error> {
        let result = self.inner.remove(path).await;
        self.evict(path);
        result
    }

    async fn size(&self, path: &str) -> Result<u64, Error> {
        self.inner.size(path).await
    }

    async fn list_directory(&self, path: &str) -> Result<Vec<String>, Error> {
        self.inner.list_directory(path).await
    }

    async fn stream_read(
        &self,
        path: &str,
        range: Option<Range<u64>>,
    ) -> Result<ByteStream, Error> {
        self.inner.stream_read(path, range).await
    }
}
