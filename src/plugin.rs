//! The mindreader plugin: pipeline orchestration.
//!
//! Owns the two queues decoupling the three stages (ingest, decode, store)
//! and the start/stop sequencing around them. Node stdout lines arrive via
//! [`MindReaderPlugin::log_line`], flow through the console reader into the
//! bounded block channel, and are consumed by a single task that archives
//! first and fans out to the block-stream server second.
//!
//! Backpressure is end-to-end by construction: a full block channel stalls
//! the ingest task, which stops reading lines, which eventually blocks the
//! node on its own stdout. That is preferable to dropping blocks.

use std::sync::Arc;
use std::time::Duration;

use snafu::Snafu;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::archiver::{ArchiveError, Archiver};
use crate::block::Block;
use crate::internal_events::{ConsumerError, InternalEvent};
use crate::reader::{ConsoleReader, LineConsoleReader, ReaderError};
use crate::shutdown::{ShutdownCallback, ShutdownSignal};
use crate::stream::{BlockStreamServer, StreamError};
use crate::uploader::FileUploader;

const LINES_CAPACITY: usize = 10_000;

#[derive(Debug, Snafu)]
pub enum PluginError {
    #[snafu(display("archiver failed: {source}"))]
    Archive { source: ArchiveError },

    #[snafu(display("console reader failed: {source}"))]
    Reader { source: ReaderError },

    #[snafu(display("block stream push failed: {source}"))]
    Stream { source: StreamError },

    #[snafu(display("plugin was already launched"))]
    AlreadyLaunched,
}

#[derive(Clone, Debug)]
pub struct PluginOptions {
    pub blocks_channel_capacity: usize,
    /// Blocks below this number are dropped at ingest. Zero disables the
    /// gate.
    pub start_block_num: u64,
    /// Reaching this block number requests an orderly shutdown. Zero
    /// disables the gate.
    pub stop_block_num: u64,
    /// How long the consumer waits for the archiver to confirm termination.
    pub wait_upload_complete_on_shutdown: Duration,
}

impl Default for PluginOptions {
    fn default() -> Self {
        PluginOptions {
            blocks_channel_capacity: 100,
            start_block_num: 0,
            stop_block_num: 0,
            wait_upload_complete_on_shutdown: Duration::from_secs(30),
        }
    }
}

pub type HeadBlockHook = Box<dyn Fn(&Block) + Send + Sync>;
type ReaderFactory = Box<dyn FnOnce(mpsc::Receiver<String>) -> Box<dyn ConsoleReader> + Send>;

pub struct MindReaderPlugin {
    options: PluginOptions,
    shutdown: ShutdownSignal,

    archiver: Option<Archiver>,
    block_stream: Option<Arc<BlockStreamServer>>,
    uploaders: Vec<FileUploader>,
    on_head_block: Option<HeadBlockHook>,
    reader_factory: ReaderFactory,

    lines: Option<mpsc::Sender<String>>,
    consumer_done: Option<oneshot::Receiver<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl MindReaderPlugin {
    pub fn new(
        archiver: Archiver,
        options: PluginOptions,
        shutdown_callback: Option<ShutdownCallback>,
    ) -> Self {
        MindReaderPlugin {
            options,
            shutdown: ShutdownSignal::new(shutdown_callback),
            archiver: Some(archiver),
            block_stream: None,
            uploaders: Vec::new(),
            on_head_block: None,
            reader_factory: Box::new(|lines| Box::new(LineConsoleReader::new(lines))),
            lines: None,
            consumer_done: None,
            tasks: Vec::new(),
        }
    }

    pub fn with_block_stream(mut self, server: Arc<BlockStreamServer>) -> Self {
        self.block_stream = Some(server);
        self
    }

    pub fn with_uploader(mut self, uploader: FileUploader) -> Self {
        self.uploaders.push(uploader);
        self
    }

    pub fn with_head_block_hook(mut self, hook: HeadBlockHook) -> Self {
        self.on_head_block = Some(hook);
        self
    }

    /// Replaces the default line-framed console reader with a
    /// chain-specific one.
    pub fn with_reader_factory(mut self, factory: ReaderFactory) -> Self {
        self.reader_factory = factory;
        self
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Starts the pipeline: queues, console reader, archiver recovery,
    /// uploaders, then the consumer and ingest tasks.
    pub async fn launch(&mut self) -> Result<(), PluginError> {
        let Some(mut archiver) = self.archiver.take() else {
            return Err(PluginError::AlreadyLaunched);
        };

        let (lines_tx, lines_rx) = mpsc::channel(LINES_CAPACITY);
        let (blocks_tx, blocks_rx) = mpsc::channel(self.options.blocks_channel_capacity);

        let reader = (std::mem::replace(
            &mut self.reader_factory,
            Box::new(|lines| Box::new(LineConsoleReader::new(lines))),
        ))(lines_rx);

        archiver
            .start()
            .await
            .map_err(|source| PluginError::Archive { source })?;

        for uploader in self.uploaders.drain(..) {
            let shutdown = self.shutdown.clone();
            self.tasks.push(tokio::spawn(uploader.run(shutdown)));
        }

        let (done_tx, done_rx) = oneshot::channel();
        self.tasks.push(tokio::spawn(consumer_loop(
            blocks_rx,
            archiver,
            self.block_stream.clone(),
            self.shutdown.clone(),
            self.options.wait_upload_complete_on_shutdown,
            done_tx,
        )));
        self.tasks.push(tokio::spawn(ingest_loop(
            reader,
            blocks_tx,
            self.options.clone(),
            self.shutdown.clone(),
            self.on_head_block.take(),
        )));

        self.lines = Some(lines_tx);
        self.consumer_done = Some(done_rx);
        info!(message = "Mindreader plugin launched.");
        Ok(())
    }

    /// Delivers one node stdout line. Blocks when the pipeline is saturated;
    /// drops the line once shutdown has been requested.
    pub async fn log_line(&self, line: String) {
        if self.shutdown.is_terminating() {
            return;
        }
        if let Some(lines) = &self.lines {
            // A closed channel means the ingest side is already gone; the
            // line has nowhere to go.
            let _ = lines.send(line).await;
        }
    }

    /// Orderly shutdown: close the line channel and let the pipeline drain
    /// stage by stage. Returns once every task has exited.
    pub async fn stop(&mut self) {
        let Some(lines) = self.lines.take() else {
            return;
        };
        info!(message = "Stopping mindreader plugin.");
        drop(lines);

        if let Some(done) = self.consumer_done.take() {
            let _ = done.await;
        }

        self.shutdown.shutdown(None);
        futures::future::join_all(self.tasks.drain(..)).await;
        info!(message = "Mindreader plugin stopped.");
    }

    /// Forced shutdown with an error, safe from any task.
    pub fn shutdown(&self, error: Option<Arc<PluginError>>) {
        self.shutdown
            .shutdown(error.map(|e| e as crate::shutdown::PipelineError));
    }
}

async fn ingest_loop(
    mut reader: Box<dyn ConsoleReader>,
    blocks: mpsc::Sender<Block>,
    options: PluginOptions,
    shutdown: ShutdownSignal,
    on_head_block: Option<HeadBlockHook>,
) {
    let failure = loop {
        match reader.read_block().await {
            Ok(Some(block)) => {
                if options.start_block_num != 0 && block.num < options.start_block_num {
                    debug!(
                        message = "Block below start gate, skipping.",
                        num = block.num,
                        start_block_num = options.start_block_num,
                    );
                    continue;
                }
                if let Some(hook) = &on_head_block {
                    hook(&block);
                }

                let stop_reached =
                    options.stop_block_num != 0 && block.num >= options.stop_block_num;
                if blocks.send(block).await.is_err() {
                    // Consumer is gone; nothing left to feed.
                    break None;
                }
                if stop_reached {
                    info!(
                        message = "Stop block reached, requesting shutdown.",
                        stop_block_num = options.stop_block_num,
                    );
                    shutdown.shutdown(None);
                }
            }
            Ok(None) => {
                debug!(message = "Console reader reached end of stream.");
                break None;
            }
            Err(error) => break Some(error),
        }
    };

    // Closing the block channel lets the consumer drain and exit.
    drop(blocks);

    if let Some(source) = failure {
        error!(message = "Console reader failed.", error = %source);
        shutdown.shutdown(Some(Arc::new(PluginError::Reader { source })));
        // Keep consuming lines so the node never blocks on a full stdout
        // pipe; the producer closes the channel during Stop.
        reader.drain().await;
    }
}

async fn consumer_loop(
    mut blocks: mpsc::Receiver<Block>,
    mut archiver: Archiver,
    block_stream: Option<Arc<BlockStreamServer>>,
    shutdown: ShutdownSignal,
    wait_upload_complete: Duration,
    done: oneshot::Sender<()>,
) {
    let mut failing = false;
    while let Some(block) = blocks.recv().await {
        if failing {
            // A failed pipeline must not process further blocks in an
            // inconsistent state, but it still drains the queue to unblock
            // ingest.
            continue;
        }

        if let Err(source) = archiver.store_block(&block).await {
            fail(&shutdown, &mut failing, PluginError::Archive { source });
            continue;
        }
        if let Some(server) = &block_stream {
            if let Err(source) = server.push_block(block) {
                fail(&shutdown, &mut failing, PluginError::Stream { source });
            }
        }
    }

    archiver.shutdown();
    let mut terminated = archiver.terminated();
    let wait = async {
        while !*terminated.borrow_and_update() {
            if terminated.changed().await.is_err() {
                break;
            }
        }
    };
    if tokio::time::timeout(wait_upload_complete, wait).await.is_err() {
        error!(message = "Timed out waiting for archiver termination.");
    }

    let _ = done.send(());
}

fn fail(shutdown: &ShutdownSignal, failing: &mut bool, error: PluginError) {
    if !shutdown.is_terminating() {
        ConsumerError {
            error: error.to_string(),
        }
        .emit();
        shutdown.shutdown(Some(Arc::new(error)));
    }
    *failing = true;
}
