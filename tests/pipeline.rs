//! End-to-end pipeline tests: node console lines in, remote artifacts out.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};

use blockmeld::archiver::{Archiver, ArchiverIo};
use blockmeld::block::Block;
use blockmeld::encoding::{decode_records, Compression};
use blockmeld::oneblock::{bundle_filename, OneBlockFile};
use blockmeld::plugin::{MindReaderPlugin, PluginOptions};
use blockmeld::reader::format_block_line;
use blockmeld::store::{BlockStore, FsBlockStore};
use blockmeld::stream::BlockStreamServer;
use blockmeld::uploader::FileUploader;

const EXT: &str = "dbin.zst";

struct Harness {
    _dir: tempfile::TempDir,
    plugin: MindReaderPlugin,
    stream: Arc<BlockStreamServer>,
    mergeable: Arc<FsBlockStore>,
    remote_oneblock: Arc<FsBlockStore>,
    remote_merged: Arc<FsBlockStore>,
}

async fn harness(bundle_size: u64) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let open = |name: &str| {
        let path = dir.path().join(name);
        async move { Arc::new(FsBlockStore::open(&path, EXT).await.unwrap()) }
    };

    let mergeable = open("mergeable").await;
    let oneblock = open("uploadable-oneblock").await;
    let merged = open("uploadable-merged").await;
    let remote_oneblock = open("remote-oneblock").await;
    let remote_merged = open("remote-merged").await;

    let io = ArchiverIo::new(
        Arc::clone(&mergeable) as Arc<dyn BlockStore>,
        Arc::clone(&oneblock) as Arc<dyn BlockStore>,
        Arc::clone(&merged) as Arc<dyn BlockStore>,
        Some(Arc::clone(&remote_merged) as Arc<dyn BlockStore>),
        Compression::Zstd,
    );
    let archiver = Archiver::new(
        io,
        bundle_size,
        Duration::from_secs(3600),
        false,
        "e2e",
    )
    .unwrap();

    let stream = Arc::new(BlockStreamServer::new(64));
    let plugin = MindReaderPlugin::new(archiver, PluginOptions::default(), None)
        .with_block_stream(Arc::clone(&stream))
        .with_uploader(
            FileUploader::new(
                Arc::clone(&oneblock) as Arc<dyn BlockStore>,
                Arc::clone(&remote_oneblock) as Arc<dyn BlockStore>,
            )
            .with_poll_interval(Duration::from_millis(20)),
        )
        .with_uploader(
            FileUploader::new(
                Arc::clone(&merged) as Arc<dyn BlockStore>,
                Arc::clone(&remote_merged) as Arc<dyn BlockStore>,
            )
            .with_poll_interval(Duration::from_millis(20)),
        );

    Harness {
        _dir: dir,
        plugin,
        stream,
        mergeable,
        remote_oneblock,
        remote_merged,
    }
}

fn block_line(num: u64, time: DateTime<Utc>) -> String {
    format_block_line(&Block {
        num,
        id: format!("{num:02x}"),
        previous_id: format!("{:02x}", num.saturating_sub(1)),
        timestamp: time,
        lib_num: num.saturating_sub(2),
        payload: Bytes::from(format!("payload-{num}")),
    })
}

async fn wait_until<F>(what: &str, mut condition: F)
where
    F: AsyncFnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if condition().await {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn live_blocks_end_up_as_remote_one_block_files() {
    let mut harness = harness(100).await;
    harness.plugin.launch().await.unwrap();
    let mut subscriber = harness.stream.subscribe();

    let now = Utc::now();
    for num in 1..=5 {
        harness.plugin.log_line(block_line(num, now)).await;
    }

    // Fan-out sees each block, archive-first order preserved.
    for expected in 1..=5 {
        assert_eq!(subscriber.recv().await.unwrap().num, expected);
    }

    let remote = Arc::clone(&harness.remote_oneblock);
    wait_until("one-block uploads", async || {
        remote.list().await.unwrap().len() == 5
    })
    .await;

    harness.plugin.stop().await;

    // Filenames round-trip and carry the writer suffix.
    for name in harness.remote_oneblock.list().await.unwrap() {
        let parsed = OneBlockFile::parse(&name).unwrap();
        assert_eq!(parsed.suffix, "e2e");
        assert_eq!(parsed.filename(), name);
    }
}

#[tokio::test]
async fn historical_blocks_end_up_as_a_remote_bundle() {
    let mut harness = harness(5).await;
    harness.plugin.launch().await.unwrap();

    let old = Utc.with_ymd_and_hms(2001, 6, 1, 12, 0, 0).unwrap();
    for num in 1..=6 {
        harness
            .plugin
            .log_line(block_line(num, old + chrono::TimeDelta::seconds(num as i64)))
            .await;
    }

    let remote = Arc::clone(&harness.remote_merged);
    wait_until("bundle upload", async || {
        remote.exists(&bundle_filename(0)).await.unwrap()
    })
    .await;

    harness.plugin.stop().await;

    let data = harness
        .remote_merged
        .read(&bundle_filename(0))
        .await
        .unwrap();
    let nums: Vec<u64> = decode_records(&data, Compression::Zstd)
        .unwrap()
        .iter()
        .map(|record| OneBlockFile::parse(&record.name).unwrap().num)
        .collect();
    assert_eq!(nums, vec![1, 2, 3, 4]);

    // Merged-out constituents were deleted from the mergeable lane; only
    // the boundary block and its successor remain.
    assert_eq!(harness.mergeable.list().await.unwrap().len(), 2);
}

#[tokio::test]
async fn node_chatter_between_blocks_is_ignored() {
    let mut harness = harness(100).await;
    harness.plugin.launch().await.unwrap();

    harness.plugin.log_line("node booting".into()).await;
    harness.plugin.log_line(block_line(1, Utc::now())).await;
    harness.plugin.log_line("state pruned".into()).await;

    let remote = Arc::clone(&harness.remote_oneblock);
    wait_until("single upload", async || {
        remote.list().await.unwrap().len() == 1
    })
    .await;

    harness.plugin.stop().await;
    assert!(harness.mergeable.list().await.unwrap().is_empty());
}
