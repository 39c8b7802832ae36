//! One-block file naming.
//!
//! The filename is the primary key of a stored block and carries all of its
//! metadata, so that a lane can be enumerated and resumed without opening a
//! single file:
//!
//! ```text
//! <num:011>-<timestamp:YYYYMMDDTHHMMSS.ff>-<id>-<previous_id>-<lib_num>-<suffix>
//! ```
//!
//! Two files with the same `num` but different `id` represent a fork and must
//! coexist in a lane. The `suffix` tags the writer so concurrent producers
//! never collide on a name.

use std::sync::LazyLock;

use chrono::{DateTime, NaiveDateTime, Timelike, Utc};
use regex::Regex;
use snafu::{ensure, OptionExt, ResultExt, Snafu};

use crate::block::Block;

static FILENAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{11})-(\d{8}T\d{6})\.(\d{2})-([0-9a-f]+)-([0-9a-f]+)-(\d+)-([\w\-]+)$")
        .expect("filename regex must compile")
});

static SUFFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\w\-]+$").expect("suffix regex must compile"));

const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S";

/// Largest block number that still fits the 11-digit zero-padded field.
const MAX_BLOCK_NUM: u64 = 99_999_999_999;

#[derive(Debug, Snafu)]
pub enum NameError {
    #[snafu(display("filename {name:?} does not match the one-block grammar"))]
    InvalidFormat { name: String },

    #[snafu(display("filename {name:?} carries an unparseable timestamp"))]
    InvalidTimestamp {
        name: String,
        source: chrono::ParseError,
    },

    #[snafu(display("block num {num} exceeds the 11-digit filename field"))]
    NumOutOfRange { num: u64 },

    #[snafu(display("suffix {suffix:?} must match ^[\\w\\-]+$"))]
    InvalidSuffix { suffix: String },

    #[snafu(display("block id {id:?} must be non-empty lowercase hex"))]
    InvalidId { id: String },
}

/// Parsed representation of a one-block filename. Field order mirrors the
/// grammar; `filename()` and `parse()` round-trip exactly.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OneBlockFile {
    pub num: u64,
    pub time: DateTime<Utc>,
    pub id: String,
    pub previous_id: String,
    pub lib_num: u64,
    pub suffix: String,
}

impl OneBlockFile {
    /// Derives the file metadata for `block`, truncating the timestamp to the
    /// centisecond precision the filename can carry.
    pub fn for_block(block: &Block, suffix: &str) -> Result<Self, NameError> {
        ensure!(block.num <= MAX_BLOCK_NUM, NumOutOfRangeSnafu { num: block.num });
        validate_suffix(suffix)?;
        validate_id(&block.id)?;
        validate_id(&block.previous_id)?;

        // A leap-second timestamp can carry nanos beyond 999_999_999; clamp
        // so the fraction always fits the two-digit field.
        let centis = (block.timestamp.nanosecond() / 10_000_000).min(99);
        let time = block
            .timestamp
            .with_nanosecond(centis * 10_000_000)
            .unwrap_or(block.timestamp);

        Ok(OneBlockFile {
            num: block.num,
            time,
            id: block.id.clone(),
            previous_id: block.previous_id.clone(),
            lib_num: block.lib_num,
            suffix: suffix.to_owned(),
        })
    }

    pub fn parse(name: &str) -> Result<Self, NameError> {
        let caps = FILENAME_RE
            .captures(name)
            .context(InvalidFormatSnafu { name })?;

        let num = caps[1].parse::<u64>().expect("11 digits fit u64");
        let base = NaiveDateTime::parse_from_str(&caps[2], TIMESTAMP_FORMAT)
            .context(InvalidTimestampSnafu { name })?;
        let centis = caps[3].parse::<u32>().expect("2 digits fit u32");
        let time = base
            .and_utc()
            .with_nanosecond(centis * 10_000_000)
            .expect("centiseconds are in range");
        let lib_num = caps[6]
            .parse::<u64>()
            .ok()
            .context(InvalidFormatSnafu { name })?;

        Ok(OneBlockFile {
            num,
            time,
            id: caps[4].to_owned(),
            previous_id: caps[5].to_owned(),
            lib_num,
            suffix: caps[7].to_owned(),
        })
    }

    /// The canonical filename, without the store's extension.
    pub fn filename(&self) -> String {
        format!(
            "{:011}-{}.{:02}-{}-{}-{}-{}",
            self.num,
            self.time.format(TIMESTAMP_FORMAT),
            (self.time.nanosecond() / 10_000_000).min(99),
            self.id,
            self.previous_id,
            self.lib_num,
            self.suffix,
        )
    }
}

/// Canonical name of a merged bundle starting at `inclusive_lower`, without
/// the store's extension.
pub fn bundle_filename(inclusive_lower: u64) -> String {
    format!("{inclusive_lower:010}")
}

pub fn validate_suffix(suffix: &str) -> Result<(), NameError> {
    ensure!(SUFFIX_RE.is_match(suffix), InvalidSuffixSnafu { suffix });
    Ok(())
}

fn validate_id(id: &str) -> Result<(), NameError> {
    let valid = !id.is_empty() && id.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
    ensure!(valid, InvalidIdSnafu { id });
    Ok(())
}
