use std::{io::SeekFrom, path::PathBuf};

use async_tempfile::TempFile;
use bytes::Bytes;
use futures::TryStreamExt;
use strata_blobstore::{paths, ContentStore};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio_tar::Archive;
use tracing::{debug, instrument, Span};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::{
    build_manifest, compression::decompress_tar, AncestryWalk, ArchiveReader, DiffResult, Error,
    LayerCache, Manifest,
};

#[derive(Clone, Debug, Default)]
pub struct LayerServiceConfig {
    /// Directory layers are spooled to while their manifest is built.
    /// Uses the system temporary directory if unset.
    pub spool_dir: Option<PathBuf>,
}

/// Manifests, diffs and ancestries of the layers in a [ContentStore].
///
/// Manifests and diffs are computed on first request and cached next to
/// the layer, see [LayerCache].
#[derive(Clone)]
pub struct LayerService<CS> {
    content_store: CS,
    cache: LayerCache<CS>,
    config: LayerServiceConfig,
}

impl<CS> LayerService<CS>
where
    CS: ContentStore + Clone,
{
    pub fn new(content_store: CS, config: LayerServiceConfig) -> Self {
        Self {
            cache: LayerCache::new(content_store.clone()),
            content_store,
            config,
        }
    }

    /// Stores a layer and its ancestry. The parent must have been imported
    /// before.
    #[instrument(skip(self, layer), fields(layer.id = id, layer.size = layer.len()), err)]
    pub async fn import_layer(
        &self,
        id: &str,
        parent: Option<&str>,
        layer: Bytes,
    ) -> Result<Vec<String>, Error> {
        let ancestry = self.generate_ancestry(id, parent).await?;
        self.content_store
            .put_content(&paths::image_layer_path(id), layer)
            .await?;
        Ok(ancestry)
    }

    /// Writes the ancestry of a layer: the layer itself, followed by the
    /// ancestry of its parent.
    #[instrument(skip(self), fields(layer.id = id), err)]
    pub async fn generate_ancestry(
        &self,
        id: &str,
        parent: Option<&str>,
    ) -> Result<Vec<String>, Error> {
        let mut ancestry = match parent {
            Some(parent) => self.ancestry(parent).await?,
            None => Vec::new(),
        };
        ancestry.insert(0, id.to_string());

        self.content_store
            .put_content(
                &paths::image_ancestry_path(id),
                serde_json::to_vec(&ancestry)?.into(),
            )
            .await?;

        Ok(ancestry)
    }

    /// Returns the ancestry of a layer, starting with the layer itself.
    #[instrument(skip(self), fields(layer.id = id), err)]
    pub async fn ancestry(&self, id: &str) -> Result<Vec<String>, Error> {
        let json = self
            .content_store
            .get_content(&paths::image_ancestry_path(id))
            .await?;
        Ok(serde_json::from_slice(&json)?)
    }

    /// Returns the manifest of a layer.
    #[instrument(skip(self), fields(layer.id = id), err)]
    pub async fn image_files(&self, id: &str) -> Result<Manifest, Error> {
        if let Some(manifest) = self.cache.get_manifest(id).await? {
            return Ok(manifest);
        }

        let manifest = self.read_layer(id).await?;
        self.cache.put_manifest(id, &manifest).await?;
        Ok(manifest)
    }

    /// Like [Self::image_files], returning the serialized manifest.
    #[instrument(skip(self), fields(layer.id = id), err)]
    pub async fn image_files_json(&self, id: &str) -> Result<Bytes, Error> {
        if let Some(json) = self.cache.get_manifest_json(id).await? {
            return Ok(json);
        }

        let manifest = self.read_layer(id).await?;
        self.cache.put_manifest(id, &manifest).await
    }

    /// Returns which files a layer deleted, changed and created, relative to
    /// its ancestry.
    #[instrument(skip(self), fields(layer.id = id), err)]
    pub async fn image_diff(&self, id: &str) -> Result<DiffResult, Error> {
        if let Some(diff) = self.cache.get_diff(id).await? {
            return Ok(diff);
        }

        let diff = self.compute_diff(id).await?;
        self.cache.put_diff(id, &diff).await?;
        Ok(diff)
    }

    /// Like [Self::image_diff], returning the serialized diff.
    #[instrument(skip(self), fields(layer.id = id), err)]
    pub async fn image_diff_json(&self, id: &str) -> Result<Bytes, Error> {
        if let Some(json) = self.cache.get_diff_json(id).await? {
            return Ok(json);
        }

        let diff = self.compute_diff(id).await?;
        self.cache.put_diff(id, &diff).await
    }

    /// Walks the ancestry of the layer, nearest parent first. All ancestor
    /// manifests need to be available.
    #[instrument(skip(self), fields(layer.id = id, indicatif.pb_show=1), err)]
    async fn compute_diff(&self, id: &str) -> Result<DiffResult, Error> {
        let ancestry = self.ancestry(id).await?;
        let ancestors = ancestry.get(1..).unwrap_or_default();

        let span = Span::current();
        span.pb_set_style(&strata_tracing::PB_PROGRESS_STYLE);
        span.pb_set_length(ancestors.len() as u64);
        span.pb_set_message(&format!("Diffing layer {}", id));
        span.pb_start();

        let mut walk = AncestryWalk::new(self.image_files(id).await?);
        for ancestor in ancestors {
            let manifest =
                self.image_files(ancestor)
                    .await
                    .map_err(|e| Error::AncestorUnavailable {
                        layer: id.to_string(),
                        ancestor: ancestor.clone(),
                        source: Box::new(e),
                    })?;
            walk.visit(&manifest);
            span.pb_inc(1);
        }

        debug!(ancestors = ancestors.len(), "walked ancestry");
        Ok(walk.finish())
    }

    /// Spools the layer into a temporary file and reads its manifest.
    #[instrument(skip(self), fields(layer.id = id, layer.size = tracing::field::Empty), err)]
    async fn read_layer(&self, id: &str) -> Result<Manifest, Error> {
        let mut spool = match &self.config.spool_dir {
            Some(dir) => TempFile::new_in(dir.clone()).await,
            None => TempFile::new().await,
        }
        .map_err(strata_blobstore::Error::from)?;

        let mut stream = self
            .content_store
            .stream_read(&paths::image_layer_path(id), None)
            .await?;

        let mut size = 0u64;
        while let Some(chunk) = stream.try_next().await? {
            spool
                .write_all(&chunk)
                .await
                .map_err(strata_blobstore::Error::from)?;
            size += chunk.len() as u64;
        }
        Span::current().record("layer.size", size);

        spool.flush().await.map_err(strata_blobstore::Error::from)?;
        spool
            .seek(SeekFrom::Start(0))
            .await
            .map_err(strata_blobstore::Error::from)?;

        let tarball = decompress_tar(ArchiveReader::new(spool))
            .await
            .map_err(Error::Decode)?;
        build_manifest(Archive::new(tarball)).await
    }
}
