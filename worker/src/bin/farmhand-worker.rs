use std::{
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use clap::{Parser, Subcommand};
use farmhand_castore::{Digest, DigestFunction};
use farmhand_worker::{
    backplane::{Backplane, StaticBackplane},
    cas_writer::{RemoteCasWriter, CHUNK_SIZE},
    config::WorkerConfig,
    stubs::WorkerStubs,
};
use tokio::io::AsyncReadExt;
use tracing::{info, instrument, Level, Span};
use tracing_indicatif::span_ext::IndicatifSpanExt;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[arg(long)]
    log_level: Option<Level>,

    /// Path to the worker configuration. Defaults apply when unset.
    #[arg(long, env = "FARMHAND_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Writes a file into the CAS of a storage worker.
    Upload {
        /// Storage workers to pick from. Defaults to the configured ones.
        #[arg(long = "peer")]
        peers: Vec<String>,

        #[arg(long, default_value = "sha256")]
        digest_function: DigestFunction,

        #[clap(value_name = "PATH")]
        path: PathBuf,
    },
    /// Loads the configuration and prepares the exec and cache roots.
    CheckConfig,
}

#[instrument(skip_all, fields(path = %path.display(), indicatif.pb_show = 1), err)]
async fn digest_file(function: DigestFunction, path: &Path) -> anyhow::Result<Digest> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("unable to open {}", path.display()))?;
    let size = file.metadata().await?.len();

    let span = Span::current();
    span.pb_set_style(&farmhand_tracing::PB_TRANSFER_STYLE);
    span.pb_set_length(size);
    span.pb_set_message("hashing");
    span.pb_start();

    let mut hasher = function.hasher();
    let mut buf = vec![0; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        span.pb_inc(n as u64);
    }

    Ok(hasher.finalize())
}

async fn upload(
    config: WorkerConfig,
    peers: Vec<String>,
    function: DigestFunction,
    path: PathBuf,
) -> anyhow::Result<Digest> {
    let peers = if peers.is_empty() {
        config.backplane.storage_workers
    } else {
        peers
    };
    let backplane: Arc<dyn Backplane> = Arc::new(StaticBackplane::new(peers));
    let writer = RemoteCasWriter::new(
        backplane,
        Arc::new(WorkerStubs::default()),
        config.cas_write.retry,
    );

    let digest = digest_file(function, &path).await?;
    writer
        .write(&digest, &path)
        .await
        .with_context(|| format!("unable to upload {}", path.display()))?;

    Ok(digest)
}

async fn check_config(config: WorkerConfig) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(&config.exec.root)
        .await
        .with_context(|| format!("unable to create {}", config.exec.root.display()))?;
    let cache = farmhand_castore::cache::LocalCache::new(
        config.cache.root.clone(),
        farmhand_castore::blobservice::MemoryBlobService::default(),
    )
    .await
    .with_context(|| format!("unable to create {}", config.cache.root.display()))?;
    let exec = config.exec.exec_file_system(Arc::new(cache))?;

    info!(
        exec_root = %exec.root().display(),
        input_fetch_width = config.input_fetch.width,
        storage_workers = config.backplane.storage_workers.len(),
        "configuration ok"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();

    let tracing_handle = farmhand_tracing::TracingBuilder::default()
        .level(cli.log_level.unwrap_or(Level::INFO))
        .enable_progressbar()
        .build()?;

    let config = match &cli.config {
        Some(path) => WorkerConfig::load(path)?,
        None => WorkerConfig::default(),
    };

    match cli.command {
        Commands::Upload {
            peers,
            digest_function,
            path,
        } => {
            let digest = upload(config, peers, digest_function, path).await?;
            writeln!(tracing_handle.get_stdout_writer(), "{}", digest)?;
        }
        Commands::CheckConfig => check_config(config).await?,
    }

    Ok(())
}
