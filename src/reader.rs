//! Console readers.
//!
//! A [`ConsoleReader`] turns the managed node's stdout lines into decoded
//! blocks. The pipeline only depends on this seam; chain-specific parsers
//! implement it. [`LineConsoleReader`] handles the framed format emitted by
//! deep-mind instrumented nodes:
//!
//! ```text
//! BLOCK <num> <id> <previous_id> <lib_num> <unix_millis> <payload_base64>
//! ```
//!
//! Any other line is node chatter and is passed through to the logs at
//! trace level.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;
use chrono::DateTime;
use snafu::{OptionExt, ResultExt, Snafu};
use tokio::sync::mpsc;
use tracing::trace;

use crate::block::Block;

const BLOCK_LINE_PREFIX: &str = "BLOCK ";

#[derive(Debug, Snafu)]
pub enum ReaderError {
    #[snafu(display("malformed block line, missing {field}: {line:?}"))]
    MissingField { field: &'static str, line: String },

    #[snafu(display("malformed block line, bad {field}: {line:?}"))]
    BadField { field: &'static str, line: String },

    #[snafu(display("malformed block line, undecodable payload: {source}"))]
    BadPayload { source: base64::DecodeError },
}

/// Source of decoded blocks. `read_block` returns `Ok(None)` on end of
/// stream; any error is terminal for the reader.
#[async_trait]
pub trait ConsoleReader: Send {
    async fn read_block(&mut self) -> Result<Option<Block>, ReaderError>;

    /// Consumes and discards the remaining line buffer until the producer
    /// closes it. Called on the error path so a blocked stdout pipe never
    /// stalls the managed node.
    async fn drain(&mut self);
}

pub struct LineConsoleReader {
    lines: mpsc::Receiver<String>,
}

impl LineConsoleReader {
    pub fn new(lines: mpsc::Receiver<String>) -> Self {
        LineConsoleReader { lines }
    }

    fn parse_block_line(line: &str) -> Result<Block, ReaderError> {
        let body = &line[BLOCK_LINE_PREFIX.len()..];
        let mut fields = body.split_ascii_whitespace();

        let mut next = |field: &'static str| {
            fields.next().context(MissingFieldSnafu { field, line })
        };

        let num = next("num")?;
        let id = next("id")?;
        let previous_id = next("previous_id")?;
        let lib_num = next("lib_num")?;
        let timestamp = next("timestamp")?;
        let payload = next("payload")?;

        let num: u64 = num
            .parse()
            .ok()
            .context(BadFieldSnafu { field: "num", line })?;
        let lib_num: u64 = lib_num
            .parse()
            .ok()
            .context(BadFieldSnafu { field: "lib_num", line })?;
        let millis: i64 = timestamp
            .parse()
            .ok()
            .context(BadFieldSnafu { field: "timestamp", line })?;
        let timestamp = DateTime::from_timestamp_millis(millis)
            .context(BadFieldSnafu { field: "timestamp", line })?;
        let payload = Bytes::from(BASE64.decode(payload).context(BadPayloadSnafu)?);

        Ok(Block {
            num,
            id: id.to_ascii_lowercase(),
            previous_id: previous_id.to_ascii_lowercase(),
            timestamp,
            lib_num,
            payload,
        })
    }
}

#[async_trait]
impl ConsoleReader for LineConsoleReader {
    async fn read_block(&mut self) -> Result<Option<Block>, ReaderError> {
        while let Some(line) = self.lines.recv().await {
            if line.starts_with(BLOCK_LINE_PREFIX) {
                return Self::parse_block_line(&line).map(Some);
            }
            trace!(message = "Node log line.", line = %line);
        }
        Ok(None)
    }

    async fn drain(&mut self) {
        let mut discarded = 0usize;
        while self.lines.recv().await.is_some() {
            discarded += 1;
        }
        if discarded > 0 {
            trace!(message = "Drained line buffer.", discarded);
        }
    }
}

/// Formats a block back into its console line; the inverse of
/// [`LineConsoleReader`]'s parser, used by tests and demo tooling.
pub fn format_block_line(block: &Block) -> String {
    format!(
        "BLOCK {} {} {} {} {} {}",
        block.num,
        block.id,
        block.previous_id,
        block.lib_num,
        block.timestamp.timestamp_millis(),
        BASE64.encode(&block.payload),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn reader_with_lines(lines: &[&str]) -> LineConsoleReader {
        let (tx, rx) = mpsc::channel(16);
        for line in lines {
            tx.send((*line).to_owned()).await.unwrap();
        }
        drop(tx);
        LineConsoleReader::new(rx)
    }

    #[tokio::test]
    async fn parses_block_lines_and_skips_chatter() {
        let mut reader = reader_with_lines(&[
            "starting node version 3.2.1",
            "BLOCK 7 0a7f 0a7e 5 1689326212560 cGF5bG9hZA==",
            "peer connected",
        ])
        .await;

        let block = reader.read_block().await.unwrap().unwrap();
        assert_eq!(block.num, 7);
        assert_eq!(block.id, "0a7f");
        assert_eq!(block.previous_id, "0a7e");
        assert_eq!(block.lib_num, 5);
        assert_eq!(block.timestamp.timestamp_millis(), 1_689_326_212_560);
        assert_eq!(block.payload, Bytes::from_static(b"payload"));

        // Chatter after the block, then EOF.
        assert!(reader.read_block().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn line_format_round_trips() {
        let mut reader =
            reader_with_lines(&["BLOCK 7 0a7f 0a7e 5 1689326212560 cGF5bG9hZA=="]).await;
        let block = reader.read_block().await.unwrap().unwrap();
        assert_eq!(
            format_block_line(&block),
            "BLOCK 7 0a7f 0a7e 5 1689326212560 cGF5bG9hZA=="
        );
    }

    #[tokio::test]
    async fn malformed_block_line_is_an_error() {
        for line in [
            "BLOCK ",
            "BLOCK 7 0a7f",
            "BLOCK x 0a7f 0a7e 5 1689326212560 cGF5bG9hZA==",
            "BLOCK 7 0a7f 0a7e 5 notatime cGF5bG9hZA==",
            "BLOCK 7 0a7f 0a7e 5 1689326212560 !!!",
        ] {
            let mut reader = reader_with_lines(&[line]).await;
            assert!(reader.read_block().await.is_err(), "accepted {line:?}");
        }
    }

    #[tokio::test]
    async fn drain_discards_until_close() {
        let (tx, rx) = mpsc::channel(16);
        let mut reader = LineConsoleReader::new(rx);
        tx.send("a".into()).await.unwrap();
        tx.send("b".into()).await.unwrap();
        drop(tx);
        reader.drain().await;
        assert!(reader.read_block().await.unwrap().is_none());
    }
}
