use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::Level;

/// Inspect the layers of a container image registry: file manifests, diffs
/// against the ancestry of a layer, and the ancestry itself.
///
/// Manifests and diffs are computed on first use and cached in the content
/// store, next to the layer.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// A global log level to use when printing logs.
    /// It's also possible to set `RUST_LOG` according to
    /// `tracing_subscriber::filter::EnvFilter`, which will always have
    /// priority.
    #[arg(long, default_value_t = Level::INFO)]
    pub log_level: Level,

    /// The content store holding the layers, e.g. `objectstore+s3://bucket/registry`.
    /// Parallel transfers can be tuned with the `concurrency`,
    /// `parallel_threshold`, `stall_timeout_secs` and `spool_dir` query
    /// parameters.
    #[arg(long, env, default_value = "objectstore+file:///var/lib/strata")]
    pub store_addr: String,

    /// Directory to spool layers to while reading them.
    #[arg(long, env)]
    pub spool_dir: Option<PathBuf>,

    /// Number of small contents (ancestries, manifests, diffs) read from the
    /// store to keep in memory. 0 disables the cache.
    #[arg(long, env, default_value_t = 0)]
    pub lru_capacity: usize,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Imports a layer tarball (optionally xz compressed) into the store.
    Import {
        /// Id of the new layer.
        id: String,

        #[clap(value_name = "PATH")]
        layer: PathBuf,

        /// Id of the parent layer, which needs to be imported already.
        #[arg(long)]
        parent: Option<String>,

        /// Layer metadata to store alongside the layer.
        #[arg(long, value_name = "PATH")]
        json: Option<PathBuf>,

        /// Compute the diff of the layer right away.
        #[arg(long)]
        diff: bool,
    },
    /// Prints the file manifest of a layer as JSON.
    Files { id: String },
    /// Prints the files a layer deleted, changed and created as JSON.
    Diff { id: String },
    /// Prints the ancestry of a layer as JSON, the layer itself first.
    Ancestry { id: String },
    /// Reads layer ids from stdin, one per line, and computes their diffs.
    /// Exits once stdin is closed and all queued diffs are done.
    Worker {
        /// Number of layer ids to hold. If the workers fall behind, the
        /// oldest ids are dropped.
        #[arg(long, default_value_t = strata_layers::queue::DEFAULT_CAPACITY)]
        queue_capacity: usize,

        /// Number of diffs to compute concurrently.
        #[arg(long, default_value_t = 1)]
        workers: usize,
    },
}
