//! Shared filesystem state
//!
//! The inode table (with its identity index) and the upload ledger are
//! owned by one [`Namespace`] value behind one lock. Every structural
//! mutation is made under the write lock and persisted before the lock
//! is released.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::RwLock;

use super::inode::InodeTable;
use super::node::Node;
use super::uploads::{UploadLedger, UploadRecord};
use crate::error::Result;

/// Namespace shared between the dispatcher, the upload pipeline and refresh
pub type SharedNamespace = Arc<RwLock<Namespace>>;

/// Inode table + upload ledger + where they are persisted
#[derive(Debug)]
pub struct Namespace {
    pub inodes: InodeTable,
    pub uploads: UploadLedger,
    state_dir: PathBuf,

    /// Records found on disk at open, left by an earlier process
    recovered: BTreeSet<u64>,
}

impl Namespace {
    /// Load both snapshots from `state_dir`
    pub fn open(state_dir: &Path, root_remote_id: &str) -> Result<Self> {
        std::fs::create_dir_all(state_dir)?;

        let mut inodes = InodeTable::load_or_create(state_dir, root_remote_id)?;
        let uploads = UploadLedger::load_or_create(state_dir)?;
        if let Some(max) = uploads.max_inode() {
            inodes.reserve(max);
        }

        let recovered = uploads.inodes().collect();
        Ok(Self {
            inodes,
            uploads,
            state_dir: state_dir.to_path_buf(),
            recovered,
        })
    }

    /// Wrap in the shared lock
    pub fn into_shared(self) -> SharedNamespace {
        Arc::new(RwLock::new(self))
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// Allocate an inode not referenced by any node or upload record
    pub fn allocate_inode(&mut self) -> u64 {
        if let Some(max) = self.uploads.max_inode() {
            self.inodes.reserve(max);
        }
        self.inodes.allocate()
    }

    /// Hand over the records left by an earlier process, once
    pub fn take_recovered(&mut self) -> BTreeSet<u64> {
        std::mem::take(&mut self.recovered)
    }

    /// A session in this process now owns the record
    pub fn adopt(&mut self, inode: u64) {
        self.recovered.remove(&inode);
    }

    /// Persist the inode table
    pub fn persist_inodes(&self) -> Result<()> {
        self.inodes.save(&self.state_dir)
    }

    /// Persist the upload ledger
    pub fn persist_uploads(&self) -> Result<()> {
        self.uploads.save(&self.state_dir)
    }

    /// Persist both documents
    pub fn persist(&self) -> Result<()> {
        self.persist_inodes()?;
        self.persist_uploads()
    }

    /// Remove a node from the table and from its parent's child list,
    /// together with any upload record. Does not persist.
    pub fn discard(&mut self, inode: u64) -> (Option<Node>, Option<UploadRecord>) {
        let node = self.inodes.remove(inode);
        if let Some(node) = &node {
            if let Some(parent) = self.inodes.parent_of(node) {
                self.inodes.remove_child(parent, inode);
            }
        }
        let record = self.uploads.remove(inode);
        (node, record)
    }
}
