//! Pipeline configuration.
//!
//! Loaded from a TOML file by the binary, with every field defaulted so a
//! bare `data_dir` is enough to run against a local disk. Remote archive
//! URLs are optional; without them artifacts stay in the local uploadable
//! lanes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use serde_with::serde_as;
use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("failed to read config file {path:?}: {source}"))]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to parse config file {path:?}: {source}"))]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

#[serde_as]
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// Root of the local staging lanes.
    pub data_dir: PathBuf,

    /// Blocks per merged bundle.
    pub bundle_size: u64,

    /// Writer tag embedded in every one-block filename.
    pub one_block_suffix: String,

    /// Blocks older than this are bundled instead of uploaded individually.
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    pub merge_threshold_age: Duration,

    /// Route every block through the mergeable lane regardless of age.
    pub batch_mode: bool,

    pub start_block_num: u64,
    pub stop_block_num: u64,
    pub blocks_channel_capacity: usize,

    /// Shared extension of one-block files and merged bundles; a `zst`
    /// suffix enables compression.
    pub artifact_extension: String,

    /// Remote archive for one-block files, e.g. `s3://bucket/one-blocks`.
    pub one_blocks_url: Option<String>,

    /// Remote archive for merged bundles, e.g. `s3://bucket/merged`.
    pub merged_blocks_url: Option<String>,

    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub upload_poll_interval: Duration,

    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    pub upload_drain_timeout: Duration,

    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    pub wait_upload_complete_on_shutdown: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_dir: PathBuf::from("blockmeld-data"),
            bundle_size: 100,
            one_block_suffix: "blockmeld".to_owned(),
            merge_threshold_age: Duration::from_secs(3600),
            batch_mode: false,
            start_block_num: 0,
            stop_block_num: 0,
            blocks_channel_capacity: 100,
            artifact_extension: "dbin.zst".to_owned(),
            one_blocks_url: None,
            merged_blocks_url: None,
            upload_poll_interval: Duration::from_millis(500),
            upload_drain_timeout: Duration::from_secs(30),
            wait_upload_complete_on_shutdown: Duration::from_secs(30),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).context(ReadSnafu { path })?;
        toml::from_str(&raw).context(ParseSnafu { path })
    }

    pub fn mergeable_dir(&self) -> PathBuf {
        self.data_dir.join("mergeable")
    }

    pub fn uploadable_oneblock_dir(&self) -> PathBuf {
        self.data_dir.join("uploadable-oneblock")
    }

    pub fn uploadable_merged_dir(&self) -> PathBuf {
        self.data_dir.join("uploadable-merged")
    }
}
