//! Artifact payload encoding.
//!
//! Both artifact kinds share one record framing: a one-block file holds a
//! single record, a merged bundle holds one record per constituent block in
//! ascending order. Each record carries the one-block filename so a bundle
//! can be exploded back into its constituent files during recovery.
//!
//! ```text
//! record := name_len:u16be | name | payload_len:u32be | payload
//! ```
//!
//! The framed stream is optionally zstd-compressed as a whole, per the
//! store's declared extension.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use snafu::{ensure, ResultExt, Snafu};

/// Compression applied to a whole artifact, declared per store at
/// construction time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compression {
    None,
    Zstd,
}

impl Compression {
    /// Infers compression from a store extension such as `dbin.zst`.
    pub fn from_extension(extension: &str) -> Self {
        if extension.ends_with("zst") {
            Compression::Zstd
        } else {
            Compression::None
        }
    }
}

const ZSTD_LEVEL: i32 = 3;

#[derive(Debug, Snafu)]
pub enum EncodingError {
    #[snafu(display("record name {name:?} exceeds the u16 length field"))]
    NameTooLong { name: String },

    #[snafu(display("record payload of {len} bytes exceeds the u32 length field"))]
    PayloadTooLarge { len: usize },

    #[snafu(display("zstd compression failed: {source}"))]
    Compress { source: std::io::Error },

    #[snafu(display("zstd decompression failed: {source}"))]
    Decompress { source: std::io::Error },

    #[snafu(display("artifact truncated at record {index}"))]
    Truncated { index: usize },

    #[snafu(display("record {index} name is not valid utf-8"))]
    BadName {
        index: usize,
        source: std::string::FromUtf8Error,
    },
}

/// One framed block record: the one-block filename plus the opaque block
/// payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockRecord {
    pub name: String,
    pub payload: Bytes,
}

pub fn encode_records(
    records: &[BlockRecord],
    compression: Compression,
) -> Result<Bytes, EncodingError> {
    let mut buf = BytesMut::new();
    for record in records {
        ensure!(
            record.name.len() <= u16::MAX as usize,
            NameTooLongSnafu { name: record.name.clone() }
        );
        ensure!(
            record.payload.len() <= u32::MAX as usize,
            PayloadTooLargeSnafu { len: record.payload.len() }
        );
        buf.put_u16(record.name.len() as u16);
        buf.put_slice(record.name.as_bytes());
        buf.put_u32(record.payload.len() as u32);
        buf.put_slice(&record.payload);
    }

    match compression {
        Compression::None => Ok(buf.freeze()),
        Compression::Zstd => {
            let compressed =
                zstd::stream::encode_all(&buf[..], ZSTD_LEVEL).context(CompressSnafu)?;
            Ok(Bytes::from(compressed))
        }
    }
}

pub fn decode_records(
    data: &[u8],
    compression: Compression,
) -> Result<Vec<BlockRecord>, EncodingError> {
    let raw = match compression {
        Compression::None => Bytes::copy_from_slice(data),
        Compression::Zstd => Bytes::from(zstd::stream::decode_all(data).context(DecompressSnafu)?),
    };

    let mut cursor = raw;
    let mut records = Vec::new();
    while cursor.has_remaining() {
        let index = records.len();
        ensure!(cursor.remaining() >= 2, TruncatedSnafu { index });
        let name_len = cursor.get_u16() as usize;
        ensure!(cursor.remaining() >= name_len + 4, TruncatedSnafu { index });
        let name = String::from_utf8(cursor.split_to(name_len).to_vec())
            .context(BadNameSnafu { index })?;
        let payload_len = cursor.get_u32() as usize;
        ensure!(cursor.remaining() >= payload_len, TruncatedSnafu { index });
        let payload = cursor.split_to(payload_len);
        records.push(BlockRecord { name, payload });
    }
    Ok(records)
}
