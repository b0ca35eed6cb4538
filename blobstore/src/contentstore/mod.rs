use std::ops::Range;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::Error;

mod from_addr;
mod lru;
mod memory;
mod object_store;

#[cfg(test)]
mod tests;

pub use self::from_addr::from_addr;
pub use self::lru::LruContentStore;
pub use self::memory::MemoryContentStore;
pub use self::object_store::ObjectStoreContentStore;

/// Size of the chunks emitted by [ContentStore::stream_read].
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// A lazily evaluated sequence of byte chunks, as returned by
/// [ContentStore::stream_read]. It ends once the requested bytes were all
/// emitted, and can only be restarted by calling `stream_read` again.
pub type ByteStream = BoxStream<'static, Result<Bytes, Error>>;

/// The base trait all content stores need to implement.
/// Content is addressed by opaque, slash-separated paths, see [crate::paths]
/// for the layout used for layers.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Return the full contents stored at the given path.
    /// Fails with [Error::NotFound] if there's nothing there, empty contents
    /// are never returned in place of a missing key.
    async fn get_content(&self, path: &str) -> Result<Bytes, Error>;

    /// Store contents at the given path, replacing what was there before.
    async fn put_content(&self, path: &str, content: Bytes) -> Result<(), Error>;

    /// Check whether something is stored at the given path.
    async fn exists(&self, path: &str) -> Result<bool, Error>;

    /// Remove the key at the given path. If the path doesn't name a key, all
    /// keys below it (treating it as a directory) are removed.
    /// Fails with [Error::NotFound] if nothing matched.
    async fn remove(&self, path: &str) -> Result<(), Error>;

    /// Return the size of the contents stored at the given path, in bytes.
    async fn size(&self, path: &str) -> Result<u64, Error>;

    /// List the keys and "directories" directly below the given path, as
    /// full paths without a trailing slash, sorted.
    /// Fails with [Error::NotFound] if there's nothing below the path.
    async fn list_directory(&self, path: &str) -> Result<Vec<String>, Error>;

    /// Stream the contents stored at the given path in chunks.
    /// If a (half-open) byte range is passed, only these bytes are emitted.
    async fn stream_read(&self, path: &str, range: Option<Range<u64>>)
        -> Result<ByteStream, Error>;
}

#[async_trait]
impl<A> ContentStore for A
where
    A: AsRef<dyn ContentStore> + Send + Sync,
{
    async fn get_content(&self, path: &str) -> Result<Bytes, Error> {
        self.as_ref().get_content(path).await
    }

    async fn put_content(&self, path: &str, content: Bytes) -> Result<(), Error> {
        self.as_ref().put_content(path, content).await
    }

    async fn exists(&self, path: &str) -> Result<bool, Error> {
        self.as_ref().exists(path).await
    }

    async fn remove(&self, path: &str) -> Result<(), Error> {
        self.as_ref().remove(path).await
    }

    async fn size(&self, path: &str) -> Result<u64, Error> {
        self.as_ref().size(path).await
    }

    async fn list_directory(&self, path: &str) -> Result<Vec<String>, Error> {
        self.as_ref().list_directory(path).await
    }

    async fn stream_read(
        &self,
        path: &str,
        range: Option<Range<u64>>,
    ) -> Result<ByteStream, Error> {
        self.as_ref().stream_read(path, range).await
    }
}

/// Clamps the requested range to the size of the blob.
/// A range starting past the end of the blob is an error.
pub(crate) fn clamp_range(range: Option<Range<u64>>, size: u64) -> Result<Range<u64>, Error> {
    match range {
        None => Ok(0..size),
        Some(range) if range.start > range.end || range.start > size => Err(
            Error::StorageError(format!("invalid range {:?} for size {}", range, size)),
        ),
        Some(range) => Ok(range.start..range.end.min(size)),
    }
}
