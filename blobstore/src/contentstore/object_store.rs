use std::{fmt, ops::Range, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use object_store::{path::Path, GetOptions, GetRange, ObjectStore};
use tracing::{debug, instrument, warn};
use url::Url;

use super::{ByteStream, ContentStore, DEFAULT_BUFFER_SIZE};
use crate::{Error, ParallelFetchConfig, ParallelRangeReader, RangedObject};

/// Uses any object storage supported by the [object_store] crate to provide a
/// [ContentStore].
///
/// Content paths are appended to the base path of the store, so
/// `images/<id>/layer` in a store constructed from `s3://bucket/registry`
/// ends up at `registry/images/<id>/layer` in `bucket`.
///
/// Reading a whole blob larger than the configured threshold is done with
/// concurrent range requests through a [ParallelRangeReader].
#[derive(Clone)]
pub struct ObjectStoreContentStore {
    object_store: Arc<dyn ObjectStore>,
    base_path: Path,
    parallel: ParallelFetchConfig,
}

impl ObjectStoreContentStore {
    pub fn new(object_store: Arc<dyn ObjectStore>, base_path: Path) -> Self {
        Self {
            object_store,
            base_path,
            parallel: ParallelFetchConfig::default(),
        }
    }

    /// Constructs a new [ObjectStoreContentStore] from a [Url] supported by
    /// [object_store].
    /// Any path suffix becomes the base path of the object store.
    /// additional options, the same as in [object_store::parse_url_opts] can
    /// be passed.
    pub fn parse_url_opts<I, K, V>(url: &Url, options: I) -> Result<Self, object_store::Error>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let (object_store, path) = object_store::parse_url_opts(url, options)?;

        Ok(Self::new(Arc::new(object_store), path))
    }

    /// Like [Self::parse_url_opts], except without the options.
    pub fn parse_url(url: &Url) -> Result<Self, object_store::Error> {
        Self::parse_url_opts(url, Vec::<(String, String)>::new())
    }

    /// Replace the parameters used for parallel transfers.
    pub fn with_parallel_fetch(mut self, parallel: ParallelFetchConfig) -> Self {
        self.parallel = parallel;
        self
    }

    fn object_path(&self, path: &str) -> Path {
        let relative = Path::from(path);
        self.base_path
            .parts()
            .chain(relative.parts())
            .collect()
    }

    /// The inverse of [Self::object_path].
    fn content_path(&self, location: &Path) -> Option<String> {
        let parts: Vec<String> = location
            .prefix_match(&self.base_path)?
            .map(|part| part.as_ref().to_string())
            .collect();
        Some(parts.join("/"))
    }
}

#[async_trait]
impl ContentStore for ObjectStoreContentStore {
    #[instrument(skip(self), err)]
    async fn get_content(&self, path: &str) -> Result<Bytes, Error> {
        let p = self.object_path(path);
        Ok(self.object_store.get(&p).await?.bytes().await?)
    }

    #[instrument(skip(self, content), fields(content.len = content.len()), err)]
    async fn put_content(&self, path: &str, content: Bytes) -> Result<(), Error> {
        let p = self.object_path(path);
        self.object_store.put(&p, content.into()).await?;
        Ok(())
    }

    #[instrument(skip(self), ret, err)]
    async fn exists(&self, path: &str) -> Result<bool, Error> {
        match self.object_store.head(&self.object_path(path)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e)?,
        }
    }

    #[instrument(skip(self), err)]
    async fn remove(&self, path: &str) -> Result<(), Error> {
        let p = self.object_path(path);
        match self.object_store.head(&p).await {
            Ok(_) => {
                self.object_store.delete(&p).await?;
                return Ok(());
            }
            Err(object_store::Error::NotFound { .. }) => {}
            Err(e) => Err(e)?,
        }

        // Not a key, treat it as a directory.
        let locations: Vec<Path> = self
            .object_store
            .list(Some(&p))
            .map_ok(|meta| meta.location)
            .try_collect()
            .await?;

        if locations.is_empty() {
            return Err(Error::NotFound(path.to_string()));
        }

        debug!(keys = locations.len(), "removing directory");
        for location in locations {
            self.object_store.delete(&location).await?;
        }

        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn size(&self, path: &str) -> Result<u64, Error> {
        let meta = self.object_store.head(&self.object_path(path)).await?;
        Ok(meta.size as u64)
    }

    #[instrument(skip(self), err)]
    async fn list_directory(&self, path: &str) -> Result<Vec<String>, Error> {
        let listing = self
            .object_store
            .list_with_delimiter(Some(&self.object_path(path)))
            .await?;

        let mut children: Vec<String> = listing
            .common_prefixes
            .iter()
            .chain(listing.objects.iter().map(|meta| &meta.location))
            .filter_map(|location| self.content_path(location))
            .collect();

        if children.is_empty() {
            return Err(Error::NotFound(path.to_string()));
        }
        children.sort();
        Ok(children)
    }

    #[instrument(skip(self), err)]
    async fn stream_read(
        &self,
        path: &str,
        range: Option<Range<u64>>,
    ) -> Result<ByteStream, Error> {
        let p = self.object_path(path);

        if let Some(range) = range {
            if range.is_empty() {
                // missing keys still need to fail
                self.object_store.head(&p).await?;
                return Ok(futures::stream::empty().boxed());
            }

            let options = GetOptions {
                range: Some(GetRange::Bounded(range.start as usize..range.end as usize)),
                ..Default::default()
            };
            let result = self.object_store.get_opts(&p, options).await?;
            return Ok(result.into_stream().map_err(Error::from).boxed());
        }

        let size = self.object_store.head(&p).await?.size as u64;
        if size > self.parallel.parallel_threshold {
            let object = Arc::new(ObjectStoreObject {
                object_store: self.object_store.clone(),
                path: p.clone(),
                size,
            });

            // The ranges are already requested by the reader, so this only
            // applies when no byte range was asked for.
            match ParallelRangeReader::new(object, &self.parallel).await {
                Ok(reader) => return Ok(reader.into_stream(DEFAULT_BUFFER_SIZE)),
                Err(e) => {
                    warn!(err = %e, "unable to set up parallel transfer, using a single request")
                }
            }
        }

        let result = self.object_store.get(&p).await?;
        Ok(result.into_stream().map_err(Error::from).boxed())
    }
}

/// A single object in an [ObjectStore], read in ranges by a
/// [ParallelRangeReader]. Every range is its own request.
struct ObjectStoreObject {
    object_store: Arc<dyn ObjectStore>,
    path: Path,
    size: u64,
}

impl fmt::Display for ObjectStoreObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path)
    }
}

#[async_trait]
impl RangedObject for ObjectStoreObject {
    fn size(&self) -> u64 {
        self.size
    }

    async fn read_range(&self, range: Range<u64>) -> Result<ByteStream, Error> {
        let options = GetOptions {
            range: Some(GetRange::Bounded(range.start as usize..range.end as usize)),
            ..Default::default()
        };
        let result = self.object_store.get_opts(&self.path, options).await?;

        Ok(result.into_stream().map_err(Error::from).boxed())
    }
}
