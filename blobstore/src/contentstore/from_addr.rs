use std::sync::Arc;

use url::Url;

use super::{ContentStore, MemoryContentStore, ObjectStoreContentStore};
use crate::{Error, ParallelFetchConfig};

/// Constructs a new instance of a [ContentStore] from an URI.
///
/// The following schemes are supported by the following services:
/// - `memory://` ([MemoryContentStore])
/// - `objectstore+*://` ([ObjectStoreContentStore])
///
/// The object store variant accepts the parameters of
/// [ParallelFetchConfig] as query string, e.g.
/// `objectstore+s3://bucket/registry?concurrency=8&stall_timeout_secs=60`.
pub fn from_addr(uri: &str) -> Result<Arc<dyn ContentStore>, Error> {
    let url =
        Url::parse(uri).map_err(|e| Error::InvalidAddress(format!("unable to parse url: {}", e)))?;

    let content_store: Arc<dyn ContentStore> = match url.scheme() {
        "memory" => {
            // memory doesn't support host or path in the URL.
            if url.has_host() || !url.path().is_empty() {
                return Err(Error::InvalidAddress("invalid url".to_string()));
            }
            Arc::<MemoryContentStore>::default()
        }
        scheme if scheme.starts_with("objectstore+") => {
            let parallel: ParallelFetchConfig = serde_qs::from_str(url.query().unwrap_or_default())
                .map_err(|e| {
                    Error::InvalidAddress(format!("failed to parse parameters: {}", e))
                })?;

            // We need to convert the URL to string, strip the prefix there, and then
            // parse it back as url, as Url::set_scheme() rejects some of the transitions we want to do.
            let trimmed_url = {
                let mut url = url.clone();
                url.set_query(None);
                let s = url.to_string();
                let s = s.strip_prefix("objectstore+").unwrap_or(&s).to_string();
                Url::parse(&s).map_err(|e| Error::InvalidAddress(e.to_string()))?
            };

            Arc::new(
                ObjectStoreContentStore::parse_url(&trimmed_url)
                    .map_err(|e| Error::InvalidAddress(e.to_string()))?
                    .with_parallel_fetch(parallel),
            )
        }
        scheme => {
            return Err(Error::InvalidAddress(format!(
                "unknown scheme: {}",
                scheme
            )))
        }
    };

    Ok(content_store)
}
