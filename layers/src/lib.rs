mod errors;

pub mod archive;
pub mod cache;
pub mod compression;
pub mod diff;
pub mod manifest;
pub mod queue;
pub mod service;

#[cfg(test)]
mod fixtures;

pub use archive::ArchiveReader;
pub use cache::LayerCache;
pub use diff::{AncestryWalk, DiffResult};
pub use errors::Error;
pub use manifest::{build_manifest, FileInfo, FileKind, FileRecord, Manifest};
pub use queue::{run_diff_worker, DiffQueue};
pub use service::{LayerService, LayerServiceConfig};
