//! Upload ledger
//!
//! Durable record of files whose content has not been confirmed by the
//! remote store yet. A record exists from create/open-for-write until the
//! upload succeeds or is abandoned.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use super::snapshot;
use crate::error::Result;

/// Snapshot file name inside the state directory
pub const UPLOAD_SNAPSHOT: &str = "uploads.json";

/// Pending upload bookkeeping for one inode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadRecord {
    /// Staging file name inside the upload area
    pub cache: String,

    /// An upload attempt is in flight
    #[serde(default)]
    pub uploading: bool,

    /// The writer closed the file
    #[serde(default)]
    pub released: bool,

    /// Bumped each time the file is reopened for writing; an upload that
    /// started under an older generation no longer matches the content
    #[serde(default)]
    pub generation: u64,
}

impl UploadRecord {
    pub fn new(cache: String) -> Self {
        Self {
            cache,
            uploading: false,
            released: false,
            generation: 0,
        }
    }
}

/// Staging file name for a file, stable across retries. Callers append the
/// inode when this name is still held by another record.
pub fn cache_name(parent_remote_id: &str, name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(parent_remote_id.as_bytes());
    hasher.update(name.as_bytes());
    hex::encode(hasher.finalize())
}

/// Inode to pending upload mapping
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct UploadLedger {
    records: BTreeMap<u64, UploadRecord>,
}

impl UploadLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the ledger from its snapshot, or start empty
    pub fn load_or_create(state_dir: &Path) -> Result<Self> {
        match snapshot::load::<Self>(&state_dir.join(UPLOAD_SNAPSHOT))? {
            Some(ledger) => {
                info!("Loaded {} pending uploads", ledger.len());
                Ok(ledger)
            }
            None => Ok(Self::new()),
        }
    }

    /// Persist the ledger
    pub fn save(&self, state_dir: &Path) -> Result<()> {
        snapshot::save(&state_dir.join(UPLOAD_SNAPSHOT), self)
    }

    pub fn get(&self, inode: u64) -> Option<&UploadRecord> {
        self.records.get(&inode)
    }

    pub fn get_mut(&mut self, inode: u64) -> Option<&mut UploadRecord> {
        self.records.get_mut(&inode)
    }

    pub fn contains(&self, inode: u64) -> bool {
        self.records.contains_key(&inode)
    }

    pub fn insert(&mut self, inode: u64, record: UploadRecord) {
        self.records.insert(inode, record);
    }

    pub fn remove(&mut self, inode: u64) -> Option<UploadRecord> {
        self.records.remove(&inode)
    }

    /// Whether any record stages its content in `cache`
    pub fn references(&self, cache: &str) -> bool {
        self.records.values().any(|r| r.cache == cache)
    }

    /// Inodes of all records
    pub fn inodes(&self) -> impl Iterator<Item = u64> + '_ {
        self.records.keys().copied()
    }

    /// Highest inode referenced by a record
    pub fn max_inode(&self) -> Option<u64> {
        self.records.keys().next_back().copied()
    }

    /// Snapshot of all records
    pub fn entries(&self) -> Vec<(u64, UploadRecord)> {
        self.records
            .iter()
            .map(|(inode, record)| (*inode, record.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
