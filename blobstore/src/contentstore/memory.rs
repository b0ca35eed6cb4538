use std::{
    collections::{BTreeSet, HashMap},
    ops::Range,
    sync::Arc,
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tracing::instrument;

use super::{clamp_range, ByteStream, ContentStore, DEFAULT_BUFFER_SIZE};
use crate::Error;

/// Keeps all content in a [HashMap] in memory. Clones share the same map.
#[derive(Clone, Default)]
pub struct MemoryContentStore {
    db: Arc<RwLock<HashMap<String, Bytes>>>,
}

fn dir_prefix(path: &str) -> String {
    format!("{}/", path.trim_end_matches('/'))
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    #[instrument(skip(self), err)]
    async fn get_content(&self, path: &str) -> Result<Bytes, Error> {
        self.db
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| Error::NotFound(path.to_string()))
    }

    #[instrument(skip(self, content), fields(content.len = content.len()))]
    async fn put_content(&self, path: &str, content: Bytes) -> Result<(), Error> {
        self.db.write().insert(path.to_string(), content);
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool, Error> {
        Ok(self.db.read().contains_key(path))
    }

    #[instrument(skip(self), err)]
    async fn remove(&self, path: &str) -> Result<(), Error> {
        let mut db = self.db.write();
        if db.remove(path).is_some() {
            return Ok(());
        }

        let prefix = dir_prefix(path);
        let len_before = db.len();
        db.retain(|k, _| !k.starts_with(&prefix));

        if db.len() == len_before {
            return Err(Error::NotFound(path.to_string()));
        }
        Ok(())
    }

    async fn size(&self, path: &str) -> Result<u64, Error> {
        self.db
            .read()
            .get(path)
            .map(|content| content.len() as u64)
            .ok_or_else(|| Error::NotFound(path.to_string()))
    }

    #[instrument(skip(self), err)]
    async fn list_directory(&self, path: &str) -> Result<Vec<String>, Error> {
        let prefix = match path.trim_end_matches('/') {
            "" => String::new(),
            _ => dir_prefix(path),
        };
        let children: BTreeSet<String> = self
            .db
            .read()
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix))
            .filter_map(|rest| rest.split('/').next())
            .filter(|child| !child.is_empty())
            .map(|child| format!("{}{}", prefix, child))
            .collect();

        if children.is_empty() {
            return Err(Error::NotFound(path.to_string()));
        }
        Ok(children.into_iter().collect())
    }

    #[instrument(skip(self), err)]
    async fn stream_read(
        &self,
        path: &str,
        range: Option<Range<u64>>,
    ) -> Result<ByteStream, Error> {
        let content = self.get_content(path).await?;
        let range = clamp_range(range, content.len() as u64)?;
        let content = content.slice(range.start as usize..range.end as usize);

        let chunks = (0..content.len())
            .step_by(DEFAULT_BUFFER_SIZE)
            .map(move |offset| {
                let end = (offset + DEFAULT_BUFFER_SIZE).min(content.len());
                Ok(content.slice(offset..end))
            })
            .collect::<Vec<_>>();

        Ok(Box::pin(futures::stream::iter(chunks)))
    }
}
