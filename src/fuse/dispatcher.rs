//! Operation dispatcher
//!
//! POSIX operations against the namespace, the remote store and the
//! upload pipeline. Each method returns a typed [`Error`] that the kernel
//! adapter turns into an errno; nothing here knows about the FUSE wire.
//!
//! `mkdir`, `rmdir` and `rename` wait for the remote store before they
//! change the namespace, but never hold the namespace lock while waiting:
//! they validate under a read lock, claim the names and nodes involved,
//! call the remote, then re-check and apply under the write lock.
//! `create`, `write` and `release` never wait on the remote.

use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::claims::Claims;
use super::handles::{HandleTable, OpenHandle};
use crate::error::{Error, Result};
use crate::remote::{MetadataPatch, NewObject, RemoteStore};
use crate::storage::node::{DEFAULT_FILE_MODE, DEFAULT_FOLDER_MODE};
use crate::storage::{
    cache_name, ChunkCache, Namespace, Node, SharedNamespace, UploadRecord, ROOT_INODE,
};
use crate::upload::UploadPipeline;

/// Advertised bytes per directory entry
pub const DIRENT_ESTIMATE: usize = 256;

/// Block and inode counts reported by statfs
pub const STATFS_COUNT: u64 = 1_000_000;

/// Longest file name
pub const NAME_MAX: u32 = 255;

/// Attribute changes requested by setattr; `None` leaves a field alone
#[derive(Debug, Clone, Default)]
pub struct SetAttr {
    pub size: Option<u64>,
    pub mtime: Option<DateTime<Utc>>,
    pub mode: Option<u32>,
}

/// One directory listing entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub inode: u64,
    pub name: String,
    pub is_folder: bool,
}

/// Directory listing plus the buffer size to advertise
#[derive(Debug, Clone)]
pub struct Listing {
    pub entries: Vec<DirEntry>,
    pub buffer_size: usize,
}

/// Access mode of an open call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
    ReadWrite,
}

impl AccessMode {
    pub fn from_flags(flags: i32) -> Self {
        match flags & libc::O_ACCMODE {
            libc::O_WRONLY => AccessMode::Write,
            libc::O_RDWR => AccessMode::ReadWrite,
            _ => AccessMode::Read,
        }
    }
}

/// Result of open/create
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Opened {
    pub fh: u64,
    pub writable: bool,
}

/// Filesystem statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsStats {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

/// POSIX operation handlers
pub struct Dispatcher {
    namespace: SharedNamespace,
    remote: Arc<dyn RemoteStore>,
    chunks: Arc<ChunkCache>,
    uploads: UploadPipeline,
    handles: HandleTable,
    claims: Claims,
}

/// A validated rename, before any change is made
struct RenamePlan {
    child: Node,
    dest_id: String,
    /// File already holding the new name
    replaced: Option<u64>,
}

fn get_node(ns: &Namespace, inode: u64) -> Result<&Node> {
    ns.inodes
        .get(inode)
        .ok_or_else(|| Error::NotFound(format!("inode {}", inode)))
}

fn get_folder(ns: &Namespace, inode: u64) -> Result<&Node> {
    let node = get_node(ns, inode)?;
    if !node.is_folder() {
        return Err(Error::NotADirectory(node.name.clone()));
    }
    Ok(node)
}

/// Remote id of a folder that children can be attached to
fn folder_remote_id(ns: &Namespace, inode: u64) -> Result<String> {
    let folder = get_folder(ns, inode)?;
    folder
        .remote_id
        .clone()
        .ok_or_else(|| Error::PermissionDenied(format!("{} is not confirmed", folder.name)))
}

fn requested_mode(mode: u32, default: u32) -> u32 {
    match mode & 0o7777 {
        0 => default,
        m => m,
    }
}

impl Dispatcher {
    pub fn new(
        namespace: SharedNamespace,
        remote: Arc<dyn RemoteStore>,
        chunks: Arc<ChunkCache>,
        uploads: UploadPipeline,
    ) -> Self {
        Self {
            namespace,
            remote,
            chunks,
            uploads,
            handles: HandleTable::new(),
            claims: Claims::new(),
        }
    }

    pub fn namespace(&self) -> &SharedNamespace {
        &self.namespace
    }

    pub fn uploads(&self) -> &UploadPipeline {
        &self.uploads
    }

    fn staging_path(&self, cache: &str) -> PathBuf {
        self.uploads.staging_path(cache)
    }

    /// Find a child by name
    pub async fn lookup(&self, parent: u64, name: &str) -> Result<Node> {
        let ns = self.namespace.read().await;
        get_folder(&ns, parent)?;
        ns.inodes
            .find_child(parent, name)
            .cloned()
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    pub async fn getattr(&self, inode: u64) -> Result<Node> {
        let ns = self.namespace.read().await;
        get_node(&ns, inode).cloned()
    }

    /// Apply the attributes present in `attrs`
    pub async fn setattr(&self, inode: u64, attrs: SetAttr) -> Result<Node> {
        let mut ns = self.namespace.write().await;
        let mut node = get_node(&ns, inode)?.clone();

        if let Some(size) = attrs.size {
            if node.is_folder() {
                return Err(Error::IsADirectory(node.name));
            }
            if size != node.size {
                let record = ns.uploads.get(inode).ok_or_else(|| {
                    Error::PermissionDenied(format!("{} is already uploaded", node.name))
                })?;
                let staging = OpenOptions::new()
                    .write(true)
                    .create(true)
                    .open(self.staging_path(&record.cache))?;
                staging.set_len(size)?;
                node.size = size;
            }
        }
        if let Some(mtime) = attrs.mtime {
            node.mtime = mtime;
        }
        if let Some(mode) = attrs.mode {
            node.mode = mode & 0o7777;
        }

        ns.inodes.set(node.clone());
        ns.persist_inodes()?;
        Ok(node)
    }

    /// List a folder; `.` and `..` come first
    pub async fn readdir(&self, inode: u64, requested: usize) -> Result<Listing> {
        let ns = self.namespace.read().await;
        let folder = get_folder(&ns, inode)?;
        let parent = ns.inodes.parent_of(folder).unwrap_or(ROOT_INODE);

        let mut entries = vec![
            DirEntry {
                inode,
                name: ".".to_string(),
                is_folder: true,
            },
            DirEntry {
                inode: parent,
                name: "..".to_string(),
                is_folder: true,
            },
        ];
        entries.extend(ns.inodes.children(inode).map(|child| DirEntry {
            inode: child.inode,
            name: child.name.clone(),
            is_folder: child.is_folder(),
        }));

        let children = entries.len() - 2;
        Ok(Listing {
            buffer_size: requested.max(children * DIRENT_ESTIMATE),
            entries,
        })
    }

    /// Open a file
    ///
    /// Reads need confirmed content. Writes need an empty file with a live
    /// upload record; the staging file is truncated and bound to the session.
    pub async fn open(&self, inode: u64, flags: i32) -> Result<Opened> {
        let mode = AccessMode::from_flags(flags);
        let mut ns = self.namespace.write().await;
        let node = get_node(&ns, inode)?;
        if node.is_folder() {
            return Err(Error::IsADirectory(node.name.clone()));
        }

        let writable_record = ns.uploads.get(inode).filter(|_| node.size == 0).cloned();
        let write = match mode {
            AccessMode::Read => false,
            AccessMode::Write => true,
            AccessMode::ReadWrite => writable_record.is_some(),
        };

        if !write {
            if node.download_url().is_none() {
                return Err(Error::PermissionDenied(format!("{} is not uploaded yet", node.name)));
            }
            drop(ns);
            let fh = self.handles.open_read(inode).await;
            return Ok(Opened { fh, writable: false });
        }

        let record = writable_record
            .ok_or_else(|| Error::PermissionDenied(format!("{} is not writable", node.name)))?;
        let file = open_staging(&self.staging_path(&record.cache))?;
        if let Some(r) = ns.uploads.get_mut(inode) {
            r.released = false;
            r.generation += 1;
        }
        ns.adopt(inode);
        ns.persist_uploads()?;
        drop(ns);

        let fh = self.handles.open_write(inode, file).await;
        Ok(Opened { fh, writable: true })
    }

    /// Read from confirmed content, fetching missing chunks
    pub async fn read(&self, inode: u64, offset: i64, len: u32) -> Result<Vec<u8>> {
        let offset =
            u64::try_from(offset).map_err(|_| Error::InvalidArgument(format!("offset {}", offset)))?;

        let (remote_id, size) = {
            let ns = self.namespace.read().await;
            let node = get_node(&ns, inode)?;
            if node.is_folder() {
                return Err(Error::IsADirectory(node.name.clone()));
            }
            match (node.download_url(), &node.remote_id) {
                (Some(_), Some(id)) => (id.clone(), node.size),
                _ => {
                    return Err(Error::PermissionDenied(format!(
                        "{} is not uploaded yet",
                        node.name
                    )))
                }
            }
        };

        if offset >= size {
            if size == 0 && offset == 0 {
                return Ok(Vec::new());
            }
            return Err(Error::IllegalSeek { offset, size });
        }

        self.chunks
            .read_range(self.remote.as_ref(), &remote_id, size, offset, len as u64)
            .await
    }

    /// Write through a bound session; the visible size grows immediately
    pub async fn write(&self, inode: u64, fh: u64, offset: i64, data: &[u8]) -> Result<u32> {
        let offset =
            u64::try_from(offset).map_err(|_| Error::InvalidArgument(format!("offset {}", offset)))?;

        {
            let ns = self.namespace.read().await;
            get_node(&ns, inode)?;
        }

        let written = self.handles.write_at(fh, inode, offset, data).await?;
        let end = offset + written as u64;

        // Kept in memory only; the last release of the session persists it
        let mut ns = self.namespace.write().await;
        if let Some(node) = ns.inodes.get(inode) {
            if node.size < end {
                let mut node = node.clone();
                node.size = end;
                node.mtime = Utc::now();
                ns.inodes.set(node);
            }
        }

        Ok(written as u32)
    }

    /// Insert a pending, empty file and its upload record
    async fn new_pending_file(&self, parent: u64, name: &str, mode: u32) -> Result<(Node, File)> {
        let mut ns = self.namespace.write().await;
        let parent_id = folder_remote_id(&ns, parent)?;
        if ns.inodes.find_child(parent, name).is_some() {
            return Err(Error::AlreadyExists(name.to_string()));
        }
        if self.claims.blocks_entry(parent, name) {
            return Err(Error::Busy(name.to_string()));
        }

        let inode = ns.allocate_inode();

        // A renamed pending file keeps staging under its old name, and a
        // finished upload holds its file until materialized
        let mut cache = cache_name(&parent_id, name);
        if ns.uploads.references(&cache) || self.staging_path(&cache).exists() {
            cache = format!("{}-{}", cache, inode);
        }
        let file = open_staging(&self.staging_path(&cache))?;

        let node = Node::new_file(
            inode,
            Some(parent_id),
            name,
            requested_mode(mode, DEFAULT_FILE_MODE),
        );
        ns.inodes.set(node.clone());
        ns.inodes.prune_children(parent);
        ns.inodes.add_child(parent, inode);
        ns.uploads.insert(inode, UploadRecord::new(cache));
        ns.persist()?;

        info!("Added new file {} (inode {})", name, inode);
        Ok((node, file))
    }

    /// Create a file and open it for writing
    pub async fn create(&self, parent: u64, name: &str, mode: u32) -> Result<(Node, Opened)> {
        let (node, file) = self.new_pending_file(parent, name, mode).await?;
        let fh = self.handles.open_write(node.inode, file).await;
        Ok((node, Opened { fh, writable: true }))
    }

    /// Create a file without opening it
    pub async fn mknod(&self, parent: u64, name: &str, mode: u32) -> Result<Node> {
        let (node, _file) = self.new_pending_file(parent, name, mode).await?;
        Ok(node)
    }

    /// Create a folder remotely, then locally
    pub async fn mkdir(&self, parent: u64, name: &str, mode: u32) -> Result<Node> {
        let (parent_id, _claim) = {
            let ns = self.namespace.read().await;
            let parent_id = folder_remote_id(&ns, parent)?;
            if ns.inodes.find_child(parent, name).is_some() {
                return Err(Error::AlreadyExists(name.to_string()));
            }
            let claim = self
                .claims
                .name(parent, name)
                .ok_or_else(|| Error::Busy(name.to_string()))?;
            (parent_id, claim)
        };

        let object = self
            .remote
            .insert(NewObject::folder(name, parent_id.clone()))
            .await?;

        let mut ns = self.namespace.write().await;

        // A refresh may have listed the new folder already
        if let Some(existing) = ns.inodes.inode_of(&object.id) {
            return get_node(&ns, existing).cloned();
        }
        let conflict = match get_folder(&ns, parent) {
            Err(e) => Some(e),
            Ok(_) if ns.inodes.find_child(parent, name).is_some() => {
                Some(Error::AlreadyExists(name.to_string()))
            }
            Ok(_) => None,
        };
        if let Some(e) = conflict {
            drop(ns);
            warn!("Folder {} changed during mkdir, trashing {}", name, object.id);
            self.trash_in_background(object.id);
            return Err(e);
        }

        let inode = ns.allocate_inode();
        let mut node = Node::from_remote(inode, &object);
        node.parent_remote_id = Some(parent_id);
        node.mode = requested_mode(mode, DEFAULT_FOLDER_MODE);

        ns.inodes.set(node.clone());
        ns.inodes.prune_children(parent);
        ns.inodes.add_child(parent, inode);
        ns.persist_inodes()?;

        info!("Created folder {} (inode {})", name, inode);
        Ok(node)
    }

    /// Remove an empty folder, remotely first
    pub async fn rmdir(&self, parent: u64, name: &str) -> Result<()> {
        let (folder, _claim) = {
            let ns = self.namespace.read().await;
            get_folder(&ns, parent)?;

            let folder = ns
                .inodes
                .find_child(parent, name)
                .cloned()
                .ok_or_else(|| Error::NotFound(name.to_string()))?;
            if !folder.is_folder() {
                return Err(Error::NotADirectory(name.to_string()));
            }
            if ns.inodes.children(folder.inode).next().is_some() {
                return Err(Error::DirectoryNotEmpty(name.to_string()));
            }
            let claim = self
                .claims
                .removal(folder.inode)
                .ok_or_else(|| Error::Busy(name.to_string()))?;
            (folder, claim)
        };

        if let Some(id) = &folder.remote_id {
            self.remote.trash(id).await?;
        }

        let mut ns = self.namespace.write().await;
        if ns.inodes.contains(folder.inode) {
            ns.discard(folder.inode);
            ns.persist_inodes()?;
        }
        info!("Removed folder {} (inode {})", name, folder.inode);
        Ok(())
    }

    /// Remove a file locally at once; the remote trash runs in the background
    pub async fn unlink(&self, parent: u64, name: &str) -> Result<()> {
        let remote_id = {
            let mut ns = self.namespace.write().await;
            get_folder(&ns, parent)?;

            let child = ns
                .inodes
                .find_child(parent, name)
                .ok_or_else(|| Error::NotFound(name.to_string()))?;
            if child.is_folder() {
                return Err(Error::IsADirectory(name.to_string()));
            }
            let inode = child.inode;

            let remote_id = self.purge(&mut ns, inode);
            ns.persist()?;
            remote_id
        };

        if let Some(id) = remote_id {
            self.trash_in_background(id);
        }
        Ok(())
    }

    /// Rename and/or move; local state changes only once the remote agrees
    pub async fn rename(&self, parent: u64, name: &str, new_parent: u64, new_name: &str) -> Result<()> {
        let (plan, _claim) = {
            let ns = self.namespace.read().await;
            let Some(plan) = self.plan_rename(&ns, parent, name, new_parent, new_name)? else {
                return Ok(());
            };
            let claim = self
                .claims
                .rename(plan.child.inode, new_parent, new_name)
                .ok_or_else(|| Error::Busy(name.to_string()))?;
            (plan, claim)
        };

        let mut mtime = None;
        if let Some(id) = &plan.child.remote_id {
            let from = plan
                .child
                .parent_remote_id
                .clone()
                .unwrap_or_else(|| self.remote.root_id().to_string());
            let object = self
                .remote
                .patch(id, MetadataPatch::rename(new_name, &from, &plan.dest_id))
                .await?;
            mtime = Some(object.modified_at);
        }

        let mut ns = self.namespace.write().await;
        let current = self
            .plan_rename(&ns, parent, name, new_parent, new_name)?
            .filter(|current| current.child.inode == plan.child.inode)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;

        let mut moved = current.child.clone();
        moved.name = new_name.to_string();
        moved.parent_remote_id = Some(current.dest_id);
        if let Some(mtime) = mtime {
            moved.mtime = mtime;
        }

        let replaced_id = current.replaced.and_then(|inode| self.purge(&mut ns, inode));

        ns.inodes.set(moved);
        if parent != new_parent {
            ns.inodes.remove_child(parent, current.child.inode);
            ns.inodes.add_child(new_parent, current.child.inode);
        }
        ns.persist()?;
        drop(ns);

        if let Some(id) = replaced_id {
            self.trash_in_background(id);
        }

        debug!("Renamed {} to {}", name, new_name);
        Ok(())
    }

    /// Check a rename against the namespace. `None` means there is nothing
    /// to do: the new name already refers to the same node.
    fn plan_rename(
        &self,
        ns: &Namespace,
        parent: u64,
        name: &str,
        new_parent: u64,
        new_name: &str,
    ) -> Result<Option<RenamePlan>> {
        get_folder(ns, parent)?;
        let dest_id = folder_remote_id(ns, new_parent)?;

        let child = ns
            .inodes
            .find_child(parent, name)
            .cloned()
            .ok_or_else(|| Error::NotFound(name.to_string()))?;

        let replaced = match ns.inodes.find_child(new_parent, new_name) {
            Some(existing) if existing.inode == child.inode => return Ok(None),
            Some(existing) if existing.is_folder() => {
                return Err(Error::IsADirectory(new_name.to_string()))
            }
            Some(existing) if child.is_folder() => {
                return Err(Error::NotADirectory(existing.name.clone()))
            }
            Some(existing) => Some(existing.inode),
            None => None,
        };

        if child.is_folder() && self.is_within(ns, new_parent, child.inode) {
            return Err(Error::InvalidArgument(format!(
                "cannot move {} into itself",
                name
            )));
        }

        Ok(Some(RenamePlan {
            child,
            dest_id,
            replaced,
        }))
    }

    /// Close a session; a closed write session queues the upload
    pub async fn release(&self, inode: u64, fh: u64) -> Result<()> {
        let was_write = matches!(self.handles.close(fh).await, Some(OpenHandle::Write { .. }));
        if !was_write || self.handles.has_writer(inode).await {
            return Ok(());
        }

        let size = {
            let mut ns = self.namespace.write().await;
            let Some(record) = ns.uploads.get_mut(inode) else {
                return Ok(());
            };
            record.released = true;
            // Also saves the size grown by write
            ns.persist()?;
            ns.inodes.get(inode).map(|n| n.size).unwrap_or(0)
        };

        debug!("Released inode {} ({} bytes), queueing upload", inode, size);
        self.uploads.enqueue(inode);
        Ok(())
    }

    pub fn statfs(&self) -> FsStats {
        let half = u32::try_from(self.chunks.chunk_size() / 2)
            .unwrap_or(u32::MAX)
            .max(1);
        FsStats {
            blocks: STATFS_COUNT,
            bfree: STATFS_COUNT,
            bavail: STATFS_COUNT,
            files: STATFS_COUNT,
            ffree: STATFS_COUNT,
            bsize: half,
            namelen: NAME_MAX,
            frsize: half,
        }
    }

    /// Whether `inode` is `ancestor` or lies below it
    fn is_within(&self, ns: &Namespace, inode: u64, ancestor: u64) -> bool {
        let mut current = inode;
        loop {
            if current == ancestor {
                return true;
            }
            if current == ROOT_INODE {
                return false;
            }
            match ns.inodes.get(current).and_then(|n| ns.inodes.parent_of(n)) {
                Some(parent) => current = parent,
                None => return false,
            }
        }
    }

    /// Drop a file node, its record and staging file. Returns the remote
    /// id to trash, if the file was ever confirmed.
    fn purge(&self, ns: &mut Namespace, inode: u64) -> Option<String> {
        let (node, record) = ns.discard(inode);
        if let Some(record) = record.filter(|r| !ns.uploads.references(&r.cache)) {
            if let Err(e) = std::fs::remove_file(self.staging_path(&record.cache)) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Unable to remove staging file {}: {}", record.cache, e);
                }
            }
        }
        node.and_then(|n| n.remote_id)
    }

    /// Trash a remote object and evict its chunks; failures are only logged
    fn trash_in_background(&self, id: String) {
        let remote = Arc::clone(&self.remote);
        let chunks = Arc::clone(&self.chunks);
        tokio::spawn(async move {
            if let Err(e) = remote.trash(&id).await {
                warn!("Unable to trash remote object {}: {}", id, e);
            }
            if let Err(e) = chunks.evict(&id).await {
                warn!("Unable to evict chunks of {}: {}", id, e);
            }
        });
    }
}

/// Open (creating or truncating) a staging file for read/write
fn open_staging(path: &std::path::Path) -> Result<File> {
    Ok(OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?)
}
