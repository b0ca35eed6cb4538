use bytes::Bytes;
use strata_blobstore::{paths, ContentStore};
use tracing::{debug, instrument};

use crate::{DiffResult, Error, Manifest};

/// Memoizes manifests and diffs of layers in the [ContentStore], next to the
/// layer itself.
///
/// Entries are written once and never invalidated. Concurrent misses for the
/// same layer both compute and both write the same bytes.
#[derive(Clone)]
pub struct LayerCache<CS> {
    content_store: CS,
}

impl<CS> LayerCache<CS>
where
    CS: ContentStore,
{
    pub fn new(content_store: CS) -> Self {
        Self { content_store }
    }

    /// Returns the content at the given path, or None if it is absent.
    /// Empty content counts as absent.
    async fn get(&self, path: &str) -> Result<Option<Bytes>, Error> {
        match self.content_store.get_content(path).await {
            Ok(content) if content.is_empty() => Ok(None),
            Ok(content) => {
                debug!(path, "cache hit");
                Ok(Some(content))
            }
            Err(strata_blobstore::Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self), err)]
    pub async fn get_manifest_json(&self, id: &str) -> Result<Option<Bytes>, Error> {
        self.get(&paths::image_files_path(id)).await
    }

    pub async fn get_manifest(&self, id: &str) -> Result<Option<Manifest>, Error> {
        match self.get_manifest_json(id).await? {
            Some(json) => Ok(Some(serde_json::from_slice(&json)?)),
            None => Ok(None),
        }
    }

    /// Stores the manifest of a layer, returning the JSON that was written.
    #[instrument(skip(self, manifest), fields(manifest.len = manifest.len()), err)]
    pub async fn put_manifest(&self, id: &str, manifest: &Manifest) -> Result<Bytes, Error> {
        let json = Bytes::from(serde_json::to_vec(manifest)?);
        self.content_store
            .put_content(&paths::image_files_path(id), json.clone())
            .await?;
        Ok(json)
    }

    #[instrument(skip(self), err)]
    pub async fn get_diff_json(&self, id: &str) -> Result<Option<Bytes>, Error> {
        self.get(&paths::image_diff_path(id)).await
    }

    pub async fn get_diff(&self, id: &str) -> Result<Option<DiffResult>, Error> {
        match self.get_diff_json(id).await? {
            Some(json) => Ok(Some(serde_json::from_slice(&json)?)),
            None => Ok(None),
        }
    }

    /// Stores the diff of a layer, returning the JSON that was written.
    #[instrument(skip(self, diff), err)]
    pub async fn put_diff(&self, id: &str, diff: &DiffResult) -> Result<Bytes, Error> {
        let json = Bytes::from(serde_json::to_vec(diff)?);
        self.content_store
            .put_content(&paths::image_diff_path(id), json.clone())
            .await?;
        Ok(json)
    }
}
