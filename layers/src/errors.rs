use thiserror::Error;

/// Errors produced while building manifests and diffs of layers.
#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("unable to decode layer archive: {0}")]
    Decode(#[source] std::io::Error),

    #[error("layer transfer interrupted: {0}")]
    TransferInterrupted(#[source] strata_blobstore::Error),

    #[error("ancestor {ancestor} of layer {layer} is unavailable: {source}")]
    AncestorUnavailable {
        layer: String,
        ancestor: String,
        #[source]
        source: Box<Error>,
    },

    #[error("unable to (de)serialize: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("content store error: {0}")]
    Store(#[source] strata_blobstore::Error),
}

impl From<strata_blobstore::Error> for Error {
    fn from(value: strata_blobstore::Error) -> Self {
        match value {
            strata_blobstore::Error::NotFound(path) => Error::NotFound(path),
            e @ (strata_blobstore::Error::TransferInterrupted { .. }
            | strata_blobstore::Error::TransferTimeout { .. }) => Error::TransferInterrupted(e),
            e => Error::Store(e),
        }
    }
}
