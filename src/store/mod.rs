//! Object stores for block artifacts.
//!
//! A [`BlockStore`] holds opaque artifacts keyed by extension-less names; the
//! extension (and therefore the compression, see
//! [`crate::encoding::Compression`]) is declared once at construction. Local
//! staging lanes and remote archives implement the same trait so the
//! archiver and the uploader stay agnostic of where bytes land.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use snafu::Snafu;
use url::Url;

mod fs;
mod s3;

pub use self::fs::FsBlockStore;
pub use self::s3::S3BlockStore;

#[derive(Debug, Snafu)]
pub enum StoreError {
    #[snafu(display("artifact {name:?} not found in {store}"))]
    NotFound { store: String, name: String },

    #[snafu(display("io error on {path}: {source}"))]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[snafu(display("{operation} failed for key {key:?}: {source}"))]
    Remote {
        operation: &'static str,
        key: String,
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    #[snafu(display("store url {url:?} is not supported"))]
    UnsupportedUrl { url: String },

    #[snafu(display("background store task failed: {reason}"))]
    Background { reason: String },
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// A flat namespace of artifacts. Names never carry the extension; listing
/// returns them sorted, which for zero-padded block names is numeric order.
#[async_trait]
pub trait BlockStore: std::fmt::Debug + Send + Sync {
    /// Human-readable location, for logging.
    fn location(&self) -> String;

    /// Writes `data` under `name`. Writes are atomic with respect to
    /// [`list`](Self::list): a name never enumerates half-written.
    async fn write(&self, name: &str, data: Bytes) -> Result<(), StoreError>;

    async fn read(&self, name: &str) -> Result<Bytes, StoreError>;

    async fn exists(&self, name: &str) -> Result<bool, StoreError>;

    /// Removes `name`. Deleting an absent artifact is not an error, so
    /// replays after a crash stay idempotent.
    async fn delete(&self, name: &str) -> Result<(), StoreError>;

    /// All artifact names carrying this store's extension, sorted ascending.
    async fn list(&self) -> Result<Vec<String>, StoreError>;
}

/// Opens a store from a URL-or-path. Plain paths and `file://` URLs map to
/// [`FsBlockStore`], `s3://bucket/prefix` to [`S3BlockStore`].
pub async fn open_store(url: &str, extension: &str) -> Result<Arc<dyn BlockStore>, StoreError> {
    match Url::parse(url) {
        Ok(parsed) if parsed.scheme() == "s3" => {
            Ok(Arc::new(S3BlockStore::open(&parsed, extension).await?))
        }
        Ok(parsed) if parsed.scheme() == "file" => {
            let path = parsed
                .to_file_path()
                .map_err(|()| StoreError::UnsupportedUrl { url: url.to_owned() })?;
            Ok(Arc::new(FsBlockStore::open(&path, extension).await?))
        }
        Ok(parsed) if !parsed.cannot_be_a_base() => Err(StoreError::UnsupportedUrl {
            url: url.to_owned(),
        }),
        // Not a URL: a local path.
        _ => Ok(Arc::new(
            FsBlockStore::open(std::path::Path::new(url), extension).await?,
        )),
    }
}
