use std::{io::Write, num::NonZeroUsize, sync::Arc};

use anyhow::Context;
use clap::Parser;
use strata_blobstore::{paths, ContentStore, LruContentStore};
use strata_layers::{run_diff_worker, DiffQueue, LayerService, LayerServiceConfig};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    task::JoinSet,
};
use tracing::info;

mod args;

use args::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let tracing_handle = strata_tracing::TracingBuilder::default()
        .level(cli.log_level)
        .enable_progressbar()
        .build()?;

    let content_store = strata_blobstore::from_addr(&cli.store_addr)
        .with_context(|| format!("unable to construct content store {}", cli.store_addr))?;
    let content_store: Arc<dyn ContentStore> = match NonZeroUsize::new(cli.lru_capacity) {
        Some(capacity) => Arc::new(LruContentStore::with_capacity(content_store, capacity)),
        None => content_store,
    };
    let service = LayerService::new(
        content_store.clone(),
        LayerServiceConfig {
            spool_dir: cli.spool_dir,
        },
    );

    let mut stdout = tracing_handle.get_stdout_writer();

    match cli.command {
        Commands::Import {
            id,
            layer,
            parent,
            json,
            diff,
        } => {
            if let Some(json) = json {
                let metadata = tokio::fs::read(&json)
                    .await
                    .with_context(|| format!("unable to read {}", json.display()))?;
                content_store
                    .put_content(&paths::image_json_path(&id), metadata.into())
                    .await?;
            }

            let contents = tokio::fs::read(&layer)
                .await
                .with_context(|| format!("unable to read {}", layer.display()))?;
            let ancestry = service
                .import_layer(&id, parent.as_deref(), contents.into())
                .await?;
            info!(layer.id = %id, ancestry.len = ancestry.len(), "imported layer");

            if diff {
                service.image_diff(&id).await?;
            }
        }
        Commands::Files { id } => {
            let json = service.image_files_json(&id).await?;
            stdout.write_all(&json)?;
            writeln!(stdout)?;
        }
        Commands::Diff { id } => {
            let json = service.image_diff_json(&id).await?;
            stdout.write_all(&json)?;
            writeln!(stdout)?;
        }
        Commands::Ancestry { id } => {
            let ancestry = service.ancestry(&id).await?;
            writeln!(stdout, "{}", serde_json::to_string(&ancestry)?)?;
        }
        Commands::Worker {
            queue_capacity,
            workers,
        } => {
            let queue = Arc::new(DiffQueue::new(queue_capacity));

            let mut tasks = JoinSet::new();
            for _ in 0..workers.max(1) {
                let service = service.clone();
                let queue = queue.clone();
                tasks.spawn(async move { run_diff_worker(service, &queue).await });
            }

            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Some(line) = lines.next_line().await? {
                let id = line.trim();
                if !id.is_empty() {
                    queue.push(id);
                }
            }

            info!("stdin closed, waiting for queued diffs");
            queue.close();
            while let Some(result) = tasks.join_next().await {
                result?;
            }
        }
    }

    Ok(())
}
