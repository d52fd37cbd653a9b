//! Names and inodes tied up by a remote call
//!
//! `mkdir`, `rmdir` and `rename` release the namespace lock while they
//! wait on the remote store. A claim keeps the names and nodes they act on
//! out of reach of other handlers until the call settles; dropping the
//! claim releases them.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct ClaimSet {
    /// (parent inode, child name) about to appear
    names: HashSet<(u64, String)>,
    /// Nodes being moved or removed
    inodes: HashSet<u64>,
    /// Folders being removed; nothing may enter them
    closing: HashSet<u64>,
}

impl ClaimSet {
    fn name_taken(&self, parent: u64, name: &str) -> bool {
        self.names.contains(&(parent, name.to_string()))
    }

    fn entering(&self, folder: u64) -> bool {
        self.names.iter().any(|(parent, _)| *parent == folder)
    }
}

/// Outstanding claims of one dispatcher
#[derive(Debug, Default)]
pub struct Claims {
    set: Mutex<ClaimSet>,
}

/// Held for the duration of a remote call
#[derive(Debug)]
pub struct Claim<'a> {
    claims: &'a Claims,
    name: Option<(u64, String)>,
    inode: Option<u64>,
    closing: bool,
}

impl Claims {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ClaimSet> {
        self.set.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a new child called `name` may not be added to `parent` now
    pub fn blocks_entry(&self, parent: u64, name: &str) -> bool {
        let set = self.lock();
        set.closing.contains(&parent) || set.name_taken(parent, name)
    }

    /// Reserve `name` in `parent` for a folder being created
    pub fn name(&self, parent: u64, name: &str) -> Option<Claim<'_>> {
        let mut set = self.lock();
        if set.closing.contains(&parent) || set.name_taken(parent, name) {
            return None;
        }
        set.names.insert((parent, name.to_string()));
        Some(Claim {
            claims: self,
            name: Some((parent, name.to_string())),
            inode: None,
            closing: false,
        })
    }

    /// Reserve `inode` and its destination for a move
    pub fn rename(&self, inode: u64, new_parent: u64, new_name: &str) -> Option<Claim<'_>> {
        let mut set = self.lock();
        if set.inodes.contains(&inode)
            || set.closing.contains(&new_parent)
            || set.name_taken(new_parent, new_name)
        {
            return None;
        }
        set.inodes.insert(inode);
        set.names.insert((new_parent, new_name.to_string()));
        Some(Claim {
            claims: self,
            name: Some((new_parent, new_name.to_string())),
            inode: Some(inode),
            closing: false,
        })
    }

    /// Reserve a folder for removal and close it to new children
    pub fn removal(&self, folder: u64) -> Option<Claim<'_>> {
        let mut set = self.lock();
        if set.inodes.contains(&folder) || set.entering(folder) {
            return None;
        }
        set.inodes.insert(folder);
        set.closing.insert(folder);
        Some(Claim {
            claims: self,
            name: None,
            inode: Some(folder),
            closing: true,
        })
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        let mut set = self.claims.lock();
        if let Some(name) = self.name.take() {
            set.names.remove(&name);
        }
        if let Some(inode) = self.inode {
            set.inodes.remove(&inode);
            if self.closing {
                set.closing.remove(&inode);
            }
        }
    }
}
