//! Log and metric emission points.
//!
//! Every observable event in the pipeline has a corresponding struct here;
//! call sites construct it and `emit` it, keeping log phrasing and metric
//! names in one place.

use metrics::{counter, gauge};
use tracing::{debug, error, info, warn};

pub trait InternalEvent {
    fn emit(self);
}

pub struct OneBlockFileStored {
    pub lane: &'static str,
    pub num: u64,
}

impl InternalEvent for OneBlockFileStored {
    fn emit(self) {
        debug!(
            message = "Stored one-block file.",
            lane = self.lane,
            num = self.num,
        );
        counter!("blockmeld_one_block_files_stored_total", "lane" => self.lane).increment(1);
    }
}

pub struct MergeWindowOpened {
    pub bundle_lower: u64,
    pub block_num: u64,
    pub batch_mode: bool,
}

impl InternalEvent for MergeWindowOpened {
    fn emit(self) {
        info!(
            message = "Opened merge window.",
            bundle_lower = self.bundle_lower,
            block_num = self.block_num,
            batch_mode = self.batch_mode,
        );
        gauge!("blockmeld_currently_merging").set(1.0);
    }
}

pub struct MergeWindowClosed {
    pub head_block_num: u64,
    pub files_retained: usize,
}

impl InternalEvent for MergeWindowClosed {
    fn emit(self) {
        info!(
            message = "Crossed back to the live tip, closing merge window.",
            head_block_num = self.head_block_num,
            files_retained = self.files_retained,
        );
        gauge!("blockmeld_currently_merging").set(0.0);
    }
}

pub struct BundleMerged {
    pub bundle_lower: u64,
    pub block_count: usize,
    pub deleted_count: usize,
}

impl InternalEvent for BundleMerged {
    fn emit(self) {
        info!(
            message = "Merged bundle.",
            bundle_lower = self.bundle_lower,
            block_count = self.block_count,
            deleted_count = self.deleted_count,
        );
        counter!("blockmeld_bundles_merged_total").increment(1);
        counter!("blockmeld_mergeable_files_deleted_total").increment(self.deleted_count as u64);
        gauge!("blockmeld_last_merged_bundle_lower").set(self.bundle_lower as f64);
    }
}

pub struct FileUploaded {
    pub name: String,
    pub to: String,
}

impl InternalEvent for FileUploaded {
    fn emit(self) {
        debug!(message = "Uploaded file.", name = %self.name, to = %self.to);
        counter!("blockmeld_files_uploaded_total").increment(1);
    }
}

pub struct FileUploadFailed {
    pub name: String,
    pub error: crate::store::StoreError,
}

impl InternalEvent for FileUploadFailed {
    fn emit(self) {
        warn!(
            message = "Upload failed, leaving file for the next sweep.",
            name = %self.name,
            error = %self.error,
        );
        counter!("blockmeld_file_upload_failures_total").increment(1);
    }
}

pub struct HeadBlockSeen {
    pub num: u64,
    pub drift_seconds: f64,
}

impl InternalEvent for HeadBlockSeen {
    fn emit(self) {
        gauge!("head_block_num").set(self.num as f64);
        gauge!("head_block_time_drift").set(self.drift_seconds);
    }
}

pub struct ReadinessChanged {
    pub ready: bool,
}

impl InternalEvent for ReadinessChanged {
    fn emit(self) {
        if self.ready {
            info!(message = "Node is ready.");
        } else {
            warn!(message = "Node is no longer ready.");
        }
        gauge!("readiness").set(if self.ready { 1.0 } else { 0.0 });
    }
}

pub struct NodeProbeFailed {
    pub consecutive_failures: u32,
    pub error: String,
}

impl InternalEvent for NodeProbeFailed {
    fn emit(self) {
        warn!(
            message = "Node readiness probe failed.",
            consecutive_failures = self.consecutive_failures,
            error = %self.error,
        );
        counter!("blockmeld_node_probe_failures_total").increment(1);
    }
}

pub struct ConsumerError {
    pub error: String,
}

impl InternalEvent for ConsumerError {
    fn emit(self) {
        error!(
            message = "Block consumer failed, requesting shutdown.",
            error = %self.error,
        );
        counter!("blockmeld_consumer_errors_total").increment(1);
    }
}
