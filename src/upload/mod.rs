//! Upload pipeline
//!
//! Closed write sessions become upload jobs. A bounded pool of workers
//! sends staging files to the remote store; each attempt ends in a typed
//! [`UploadOutcome`] that decides whether the job is finished, retried or
//! dropped.

mod pipeline;

use std::path::PathBuf;
use std::time::Duration;

use crate::config::Config;

pub use pipeline::UploadPipeline;

/// Pipeline tuning
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Maximum number of uploads in flight
    pub max_concurrent: usize,

    /// Per-attempt timeout
    pub timeout: Duration,

    /// Delay before a failed attempt is queued again
    pub retry_delay: Duration,

    /// Staging area
    pub upload_dir: PathBuf,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_concurrent: config.upload.max_concurrent,
            timeout: config.upload_timeout(),
            retry_delay: config.retry_delay(),
            upload_dir: config.upload_dir(),
        }
    }
}

/// One queued upload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadJob {
    pub inode: u64,
    pub attempt: u32,
}

impl UploadJob {
    pub fn new(inode: u64) -> Self {
        Self { inode, attempt: 1 }
    }

    /// The same job, one attempt later
    pub fn next(self) -> Self {
        Self {
            inode: self.inode,
            attempt: self.attempt + 1,
        }
    }
}

/// Result of one upload attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    /// Content confirmed remotely
    Uploaded { remote_id: String },

    /// Transient failure; the job goes back on the queue
    Retry,

    /// Terminal failure or vanished node; record and staging file removed
    Dropped,

    /// Nothing to do: no record, or another attempt already in flight
    Skipped,
}

/// What restart recovery did with the upload ledger
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResumeSummary {
    /// Released records queued again
    pub requeued: usize,

    /// Abandoned write sessions purged
    pub discarded: usize,
}
