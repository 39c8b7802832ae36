//! Pipeline entry point: tails an already-running node's stdout (piped to
//! this process) into the mindreader plugin.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::io::AsyncBufReadExt;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use blockmeld::archiver::{Archiver, ArchiverIo};
use blockmeld::config::Config;
use blockmeld::encoding::Compression;
use blockmeld::plugin::{MindReaderPlugin, PluginOptions};
use blockmeld::store::{open_store, BlockStore, FsBlockStore};
use blockmeld::stream::BlockStreamServer;
use blockmeld::uploader::FileUploader;

#[derive(Debug, Parser)]
#[command(name = "blockmeld", about, version)]
struct Opts {
    /// Path to a TOML config file.
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Override the configured data directory.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Route every block through the mergeable lane regardless of age.
    #[arg(long)]
    batch: bool,

    /// Override the merge threshold age, e.g. "1h" or "90m".
    #[arg(long, value_parser = humantime::parse_duration)]
    merge_threshold_age: Option<Duration>,

    #[arg(long)]
    start_block_num: Option<u64>,

    #[arg(long)]
    stop_block_num: Option<u64>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match run(Opts::parse()).await {
        Ok(code) => code,
        Err(error) => {
            error!(message = "Pipeline failed to start.", %error);
            ExitCode::FAILURE
        }
    }
}

async fn run(opts: Opts) -> Result<ExitCode, Box<dyn std::error::Error + Send + Sync>> {
    let mut config = match &opts.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(data_dir) = opts.data_dir {
        config.data_dir = data_dir;
    }
    if opts.batch {
        config.batch_mode = true;
    }
    if let Some(age) = opts.merge_threshold_age {
        config.merge_threshold_age = age;
    }
    if let Some(num) = opts.start_block_num {
        config.start_block_num = num;
    }
    if let Some(num) = opts.stop_block_num {
        config.stop_block_num = num;
    }

    let extension = config.artifact_extension.clone();
    let compression = Compression::from_extension(&extension);

    let mergeable: Arc<dyn BlockStore> =
        Arc::new(FsBlockStore::open(&config.mergeable_dir(), &extension).await?);
    let oneblock: Arc<dyn BlockStore> =
        Arc::new(FsBlockStore::open(&config.uploadable_oneblock_dir(), &extension).await?);
    let merged: Arc<dyn BlockStore> =
        Arc::new(FsBlockStore::open(&config.uploadable_merged_dir(), &extension).await?);

    let remote_oneblock = match &config.one_blocks_url {
        Some(url) => Some(open_store(url, &extension).await?),
        None => None,
    };
    let remote_merged = match &config.merged_blocks_url {
        Some(url) => Some(open_store(url, &extension).await?),
        None => None,
    };

    let io = ArchiverIo::new(
        Arc::clone(&mergeable),
        Arc::clone(&oneblock),
        Arc::clone(&merged),
        remote_merged.clone(),
        compression,
    );
    let archiver = Archiver::new(
        io,
        config.bundle_size,
        config.merge_threshold_age,
        config.batch_mode,
        &config.one_block_suffix,
    )?;

    let options = PluginOptions {
        blocks_channel_capacity: config.blocks_channel_capacity,
        start_block_num: config.start_block_num,
        stop_block_num: config.stop_block_num,
        wait_upload_complete_on_shutdown: config.wait_upload_complete_on_shutdown,
    };

    let mut plugin = MindReaderPlugin::new(archiver, options, None)
        .with_block_stream(Arc::new(BlockStreamServer::new(64)));
    if let Some(remote) = remote_oneblock {
        plugin = plugin.with_uploader(
            FileUploader::new(Arc::clone(&oneblock), remote)
                .with_poll_interval(config.upload_poll_interval)
                .with_drain_timeout(config.upload_drain_timeout),
        );
    }
    if let Some(remote) = remote_merged {
        plugin = plugin.with_uploader(
            FileUploader::new(Arc::clone(&merged), remote)
                .with_poll_interval(config.upload_poll_interval)
                .with_drain_timeout(config.upload_drain_timeout),
        );
    }

    plugin.launch().await?;
    let shutdown = plugin.shutdown_signal();

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => plugin.log_line(line).await,
                None => {
                    info!(message = "Node stream closed.");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!(message = "Interrupted.");
                break;
            }
            _ = shutdown.cancelled() => break,
        }
    }

    plugin.stop().await;

    match shutdown.error() {
        Some(error) => {
            error!(message = "Pipeline terminated with error.", %error);
            Ok(ExitCode::FAILURE)
        }
        None => Ok(ExitCode::SUCCESS),
    }
}
