mod errors;

pub mod contentstore;
pub mod parallel;
pub mod paths;

#[cfg(test)]
mod fixtures;

#[cfg(test)]
#[allow(clippy::single_component_path_imports)]
use rstest_reuse;

pub use contentstore::{
    from_addr, ByteStream, ContentStore, LruContentStore, MemoryContentStore,
    ObjectStoreContentStore,
};
pub use errors::Error;
pub use parallel::{ParallelFetchConfig, ParallelRangeReader, RangedObject};
