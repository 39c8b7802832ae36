//! Lane IO for the archiver.
//!
//! Three local staging lanes back the archiver's file-movement discipline:
//! *mergeable* (blocks held until their bundle completes), *uploadable
//! one-block* and *uploadable merged* (artifacts awaiting the remote sweep).
//! The archiver is the sole writer of all three; the uploader is the sole
//! deleter of the uploadable lanes.

use std::sync::Arc;

use bytes::Bytes;
use snafu::{ResultExt, Snafu};
use tracing::warn;

use crate::encoding::{self, BlockRecord, Compression, EncodingError};
use crate::oneblock::{bundle_filename, OneBlockFile};
use crate::store::{BlockStore, StoreError};

#[derive(Debug, Snafu)]
pub enum ArchiverIoError {
    #[snafu(display("failed to store one-block file {name} in the {lane} lane: {source}"))]
    StoreOneBlock {
        lane: &'static str,
        name: String,
        source: StoreError,
    },

    #[snafu(display("failed to walk the mergeable lane: {source}"))]
    Walk { source: StoreError },

    #[snafu(display("failed to download one-block file {name}: {source}"))]
    Download { name: String, source: StoreError },

    #[snafu(display("failed to delete {name} from the mergeable lane: {source}"))]
    Delete { name: String, source: StoreError },

    #[snafu(display("failed to store merged bundle {lower}: {source}"))]
    StoreMerged { lower: u64, source: StoreError },

    #[snafu(display("failed to fetch merged bundle {lower}: {source}"))]
    FetchMerged { lower: u64, source: StoreError },

    #[snafu(display("artifact {name} is malformed: {source}"))]
    Corrupt {
        name: String,
        source: EncodingError,
    },
}

pub struct ArchiverIo {
    mergeable: Arc<dyn BlockStore>,
    uploadable_oneblock: Arc<dyn BlockStore>,
    uploadable_merged: Arc<dyn BlockStore>,
    /// Remote merged archive, consulted during startup recovery when the
    /// local uploadable lane has already been swept.
    remote_merged: Option<Arc<dyn BlockStore>>,
    compression: Compression,
}

impl ArchiverIo {
    pub fn new(
        mergeable: Arc<dyn BlockStore>,
        uploadable_oneblock: Arc<dyn BlockStore>,
        uploadable_merged: Arc<dyn BlockStore>,
        remote_merged: Option<Arc<dyn BlockStore>>,
        compression: Compression,
    ) -> Self {
        ArchiverIo {
            mergeable,
            uploadable_oneblock,
            uploadable_merged,
            remote_merged,
            compression,
        }
    }

    pub async fn store_one_block_file(
        &self,
        file: &OneBlockFile,
        payload: &Bytes,
    ) -> Result<(), ArchiverIoError> {
        self.store_in_lane(&self.uploadable_oneblock, "uploadable", file, payload)
            .await
    }

    pub async fn store_mergeable_one_block_file(
        &self,
        file: &OneBlockFile,
        payload: &Bytes,
    ) -> Result<(), ArchiverIoError> {
        self.store_in_lane(&self.mergeable, "mergeable", file, payload)
            .await
    }

    async fn store_in_lane(
        &self,
        lane: &Arc<dyn BlockStore>,
        lane_name: &'static str,
        file: &OneBlockFile,
        payload: &Bytes,
    ) -> Result<(), ArchiverIoError> {
        let name = file.filename();
        let record = BlockRecord {
            name: name.clone(),
            payload: payload.clone(),
        };
        let data = encoding::encode_records(std::slice::from_ref(&record), self.compression)
            .context(CorruptSnafu { name: name.clone() })?;
        lane.write(&name, data).await.context(StoreOneBlockSnafu {
            lane: lane_name,
            name,
        })
    }

    /// Enumerates the mergeable lane, sorted by block number. Foreign files
    /// that do not parse as one-block names are skipped with a warning.
    pub async fn walk_mergeable_one_block_files(
        &self,
    ) -> Result<Vec<OneBlockFile>, ArchiverIoError> {
        let mut files = Vec::new();
        for name in self.mergeable.list().await.context(WalkSnafu)? {
            match OneBlockFile::parse(&name) {
                Ok(file) => files.push(file),
                Err(error) => {
                    warn!(
                        message = "Skipping foreign file in the mergeable lane.",
                        %name,
                        %error,
                    );
                }
            }
        }
        Ok(files)
    }

    /// Reads a mergeable file's payload back, for blocks seeded from a walk
    /// whose payload never passed through this process.
    pub async fn download_one_block_file(
        &self,
        file: &OneBlockFile,
    ) -> Result<Bytes, ArchiverIoError> {
        let name = file.filename();
        let data = self
            .mergeable
            .read(&name)
            .await
            .context(DownloadSnafu { name: name.clone() })?;
        let mut records = encoding::decode_records(&data, self.compression)
            .context(CorruptSnafu { name: name.clone() })?;
        records
            .pop()
            .map(|record| record.payload)
            .ok_or(ArchiverIoError::Corrupt {
                name,
                source: EncodingError::Truncated { index: 0 },
            })
    }

    pub async fn delete(&self, files: &[OneBlockFile]) -> Result<(), ArchiverIoError> {
        for file in files {
            let name = file.filename();
            self.mergeable
                .delete(&name)
                .await
                .context(DeleteSnafu { name })?;
        }
        Ok(())
    }

    /// Writes the single bundle artifact covering `[inclusive_lower,
    /// inclusive_lower + size)` into the uploadable-merged lane. The write
    /// is atomic with respect to lane enumeration.
    pub async fn merge_and_store(
        &self,
        inclusive_lower: u64,
        records: &[BlockRecord],
    ) -> Result<(), ArchiverIoError> {
        let name = bundle_filename(inclusive_lower);
        let data = encoding::encode_records(records, self.compression)
            .context(CorruptSnafu { name: name.clone() })?;
        self.uploadable_merged
            .write(&name, data)
            .await
            .context(StoreMergedSnafu {
                lower: inclusive_lower,
            })
    }

    /// Retrieves a previously merged bundle and explodes it back into block
    /// records, checking the local uploadable lane first and the remote
    /// archive second. `None` when the bundle exists in neither.
    pub async fn fetch_merged_one_block_files(
        &self,
        inclusive_lower: u64,
    ) -> Result<Option<Vec<BlockRecord>>, ArchiverIoError> {
        let name = bundle_filename(inclusive_lower);

        let mut stores = vec![&self.uploadable_merged];
        if let Some(remote) = &self.remote_merged {
            stores.push(remote);
        }

        for store in stores {
            match store.read(&name).await {
                Ok(data) => {
                    let records = encoding::decode_records(&data, self.compression)
                        .context(CorruptSnafu { name: name.clone() })?;
                    return Ok(Some(records));
                }
                Err(error) if error.is_not_found() => continue,
                Err(source) => {
                    return Err(ArchiverIoError::FetchMerged {
                        lower: inclusive_lower,
                        source,
                    })
                }
            }
        }
        Ok(None)
    }
}
