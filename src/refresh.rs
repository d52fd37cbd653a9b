//! Remote listing refresh
//!
//! Merges folder listings from the remote store into the inode table: at
//! mount time for a fresh namespace, then periodically. Listings are
//! fetched without holding the namespace lock; each folder merge is one
//! locked mutation followed by a persist.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::remote::{RemoteObject, RemoteStore};
use crate::storage::{ChunkCache, Namespace, Node, SharedNamespace, ROOT_INODE};

/// Changes applied by one refresh pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
}

impl RefreshSummary {
    fn absorb(&mut self, other: RefreshSummary) {
        self.added += other.added;
        self.updated += other.updated;
        self.removed += other.removed;
    }

    pub fn is_empty(&self) -> bool {
        self.added == 0 && self.updated == 0 && self.removed == 0
    }
}

/// Folder to list: (inode, remote id)
type FolderRef = (u64, String);

/// Remote listing merger
pub struct Refresher {
    namespace: SharedNamespace,
    remote: Arc<dyn RemoteStore>,
    chunks: Arc<ChunkCache>,
}

impl Refresher {
    pub fn new(namespace: SharedNamespace, remote: Arc<dyn RemoteStore>, chunks: Arc<ChunkCache>) -> Self {
        Self {
            namespace,
            remote,
            chunks,
        }
    }

    /// List the whole remote tree into a namespace that holds only the root
    pub async fn populate(&self) -> Result<RefreshSummary> {
        let root = {
            let ns = self.namespace.read().await;
            if !ns.inodes.is_empty() {
                debug!("Namespace already populated ({} inodes)", ns.inodes.len());
                return Ok(RefreshSummary::default());
            }
            ns.inodes
                .root()
                .and_then(|r| r.remote_id.clone())
                .unwrap_or_else(|| self.remote.root_id().to_string())
        };

        let summary = self.sync_from(vec![(ROOT_INODE, root)]).await?;
        info!("Populated namespace with {} nodes", summary.added);
        Ok(summary)
    }

    /// Re-list every known folder
    pub async fn refresh(&self) -> Result<RefreshSummary> {
        let folders: Vec<FolderRef> = {
            let ns = self.namespace.read().await;
            ns.inodes
                .folders()
                .into_iter()
                .filter_map(|ino| {
                    let id = ns.inodes.get(ino)?.remote_id.clone()?;
                    Some((ino, id))
                })
                .collect()
        };

        let summary = self.sync_from(folders).await?;
        if !summary.is_empty() {
            info!(
                "Refresh: {} added, {} updated, {} removed",
                summary.added, summary.updated, summary.removed
            );
        }
        Ok(summary)
    }

    /// Run [`refresh`](Self::refresh) every `period`
    pub fn spawn(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if let Err(e) = self.refresh().await {
                    error!("Refresh failed: {}", e);
                }
            }
        })
    }

    /// Sync a set of folders, then any folders discovered along the way
    async fn sync_from(&self, mut level: Vec<FolderRef>) -> Result<RefreshSummary> {
        let mut summary = RefreshSummary::default();

        while !level.is_empty() {
            let listed_at = Utc::now();
            let listings = join_all(
                level
                    .iter()
                    .map(|(_, id)| self.remote.list_children(id)),
            )
            .await;

            let mut next = Vec::new();
            for ((folder, folder_id), listing) in level.into_iter().zip(listings) {
                let objects = match listing {
                    Ok(objects) => objects,
                    Err(e) => {
                        warn!("Failed to list folder {}: {}", folder_id, e);
                        continue;
                    }
                };

                let (merged, discovered, evict) = {
                    let mut ns = self.namespace.write().await;
                    let outcome = merge_listing(&mut ns, folder, &folder_id, &objects, listed_at);
                    if !outcome.0.is_empty() {
                        ns.persist()?;
                    }
                    outcome
                };

                for id in evict {
                    if let Err(e) = self.chunks.evict(&id).await {
                        warn!("Failed to evict chunks of {}: {}", id, e);
                    }
                }

                summary.absorb(merged);
                next.extend(discovered);
            }
            level = next;
        }

        Ok(summary)
    }
}

/// Apply one folder listing. Returns the changes, newly created folders
/// and remote ids whose cached chunks are stale.
fn merge_listing(
    ns: &mut Namespace,
    folder: u64,
    folder_id: &str,
    objects: &[RemoteObject],
    listed_at: DateTime<Utc>,
) -> (RefreshSummary, Vec<FolderRef>, Vec<String>) {
    let mut summary = RefreshSummary::default();
    let mut discovered = Vec::new();
    let mut evict = Vec::new();

    // Removed concurrently by rmdir
    if !ns.inodes.get(folder).is_some_and(Node::is_folder) {
        return (summary, discovered, evict);
    }

    for object in objects {
        match ns.inodes.inode_of(&object.id) {
            Some(ino) => {
                if ns.uploads.contains(ino) {
                    continue;
                }
                let Some(mut node) = ns.inodes.get(ino).cloned() else {
                    continue;
                };

                let previous = ns.inodes.parent_of(&node);
                let before = node.clone();
                node.name = object.title.clone();
                node.parent_remote_id = Some(folder_id.to_string());
                if node.is_file() {
                    if node.size != object.size || node.mtime != object.modified_at {
                        evict.push(object.id.clone());
                    }
                    node.confirm(object);
                    node.parent_remote_id = Some(folder_id.to_string());
                }

                if node != before {
                    ns.inodes.set(node);
                    if previous != Some(folder) {
                        if let Some(previous) = previous {
                            ns.inodes.remove_child(previous, ino);
                        }
                    }
                    ns.inodes.add_child(folder, ino);
                    summary.updated += 1;
                }
            }
            None => {
                // A local pending file claims the name; its upload wins
                if ns.inodes.find_child(folder, &object.title).is_some_and(|n| n.remote_id.is_none()) {
                    continue;
                }

                let ino = ns.allocate_inode();
                let mut node = Node::from_remote(ino, object);
                node.parent_remote_id = Some(folder_id.to_string());
                if node.is_folder() {
                    discovered.push((ino, object.id.clone()));
                }
                ns.inodes.set(node);
                ns.inodes.add_child(folder, ino);
                summary.added += 1;
            }
        }
    }

    let listed: HashSet<&str> = objects.iter().map(|o| o.id.as_str()).collect();
    let gone: Vec<u64> = ns
        .inodes
        .children(folder)
        .filter(|child| {
            child
                .remote_id
                .as_deref()
                .is_some_and(|id| !listed.contains(id))
                && !ns.uploads.contains(child.inode)
                && child.ctime.max(child.mtime) < listed_at
        })
        .map(|child| child.inode)
        .collect();

    for ino in gone {
        summary.removed += discard_tree(ns, ino, &mut evict);
    }
    ns.inodes.prune_children(folder);

    (summary, discovered, evict)
}

/// Discard a node and everything below it; returns how many were removed
fn discard_tree(ns: &mut Namespace, inode: u64, evict: &mut Vec<String>) -> usize {
    let mut removed = 0;
    let mut stack = vec![inode];

    while let Some(ino) = stack.pop() {
        if let Some(node) = ns.inodes.get(ino) {
            stack.extend_from_slice(node.children());
        }
        let (node, _) = ns.discard(ino);
        if let Some(node) = node {
            if node.is_file() {
                if let Some(id) = node.remote_id {
                    evict.push(id);
                }
            }
            removed += 1;
        }
    }

    removed
}
