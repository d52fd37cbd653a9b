//! Inode table and identity index
//!
//! The inode table is the single source of truth for the namespace. The
//! identity index maps remote object ids back to inode numbers so that
//! parent references returned by the remote store can be resolved.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::node::{Node, ROOT_INODE};
use super::snapshot;
use crate::error::Result;

const SNAPSHOT_VERSION: u32 = 1;

/// Snapshot file name inside the state directory
pub const INODE_SNAPSHOT: &str = "inodes.json";

#[derive(Serialize)]
struct SnapshotRef<'a> {
    version: u32,
    next_inode: u64,
    nodes: &'a BTreeMap<u64, Node>,
}

#[derive(Deserialize)]
struct SnapshotOwned {
    version: u32,
    next_inode: u64,
    nodes: BTreeMap<u64, Node>,
}

/// Inode number to node mapping plus remote id reverse index
#[derive(Debug)]
pub struct InodeTable {
    /// Inode to node mapping
    nodes: BTreeMap<u64, Node>,

    /// Remote id to inode mapping
    identity: HashMap<String, u64>,

    /// Allocation high-water mark
    next_inode: u64,
}

impl InodeTable {
    /// Create a table holding only the root folder
    pub fn new(root_remote_id: &str) -> Self {
        let mut table = Self {
            nodes: BTreeMap::new(),
            identity: HashMap::new(),
            next_inode: ROOT_INODE + 1,
        };
        table.set(Node::root(root_remote_id));
        table
    }

    /// Load the table from its snapshot, or start fresh
    pub fn load_or_create(state_dir: &Path, root_remote_id: &str) -> Result<Self> {
        let path = state_dir.join(INODE_SNAPSHOT);

        let snapshot: SnapshotOwned = match snapshot::load(&path)? {
            Some(s) => s,
            None => {
                info!("No existing inode snapshot, starting with an empty namespace");
                return Ok(Self::new(root_remote_id));
            }
        };

        if snapshot.version != SNAPSHOT_VERSION || !snapshot.nodes.contains_key(&ROOT_INODE) {
            info!("Inode snapshot unusable, starting with an empty namespace");
            return Ok(Self::new(root_remote_id));
        }

        let mut table = Self {
            nodes: BTreeMap::new(),
            identity: HashMap::new(),
            next_inode: snapshot.next_inode.max(ROOT_INODE + 1),
        };
        for (_, node) in snapshot.nodes {
            table.set(node);
        }

        info!("Loaded {} inodes", table.len());
        Ok(table)
    }

    /// Persist the table
    pub fn save(&self, state_dir: &Path) -> Result<()> {
        snapshot::save(
            &state_dir.join(INODE_SNAPSHOT),
            &SnapshotRef {
                version: SNAPSHOT_VERSION,
                next_inode: self.next_inode,
                nodes: &self.nodes,
            },
        )
    }

    /// Get a node by inode
    pub fn get(&self, inode: u64) -> Option<&Node> {
        self.nodes.get(&inode)
    }

    /// Check if an inode exists
    pub fn contains(&self, inode: u64) -> bool {
        self.nodes.contains_key(&inode)
    }

    /// The root folder
    pub fn root(&self) -> Option<&Node> {
        self.nodes.get(&ROOT_INODE)
    }

    /// Insert or replace a node, keeping the identity index in step
    pub fn set(&mut self, node: Node) {
        if let Some(old) = self.nodes.get(&node.inode) {
            if let Some(old_id) = &old.remote_id {
                if node.remote_id.as_ref() != Some(old_id) {
                    self.identity.remove(old_id);
                }
            }
        }

        if let Some(id) = &node.remote_id {
            self.identity.insert(id.clone(), node.inode);
        }
        if node.inode >= self.next_inode {
            self.next_inode = node.inode + 1;
        }
        self.nodes.insert(node.inode, node);
    }

    /// Remove a node and its identity entry
    pub fn remove(&mut self, inode: u64) -> Option<Node> {
        let node = self.nodes.remove(&inode)?;
        if let Some(id) = &node.remote_id {
            if self.identity.get(id) == Some(&inode) {
                self.identity.remove(id);
            }
        }
        Some(node)
    }

    /// Allocate a fresh inode number
    pub fn allocate(&mut self) -> u64 {
        let max = self.nodes.keys().next_back().copied().unwrap_or(ROOT_INODE);
        let inode = (max + 1).max(ROOT_INODE + 1).max(self.next_inode);
        self.next_inode = inode + 1;
        inode
    }

    /// Make sure `inode` is never handed out again
    pub fn reserve(&mut self, inode: u64) {
        if inode >= self.next_inode {
            self.next_inode = inode + 1;
        }
    }

    /// Resolve a remote id to an inode
    pub fn inode_of(&self, remote_id: &str) -> Option<u64> {
        self.identity.get(remote_id).copied()
    }

    /// Resolve a node's parent folder inode through the identity index
    pub fn parent_of(&self, node: &Node) -> Option<u64> {
        if node.inode == ROOT_INODE {
            return Some(ROOT_INODE);
        }
        node.parent_remote_id
            .as_deref()
            .and_then(|id| self.inode_of(id))
    }

    /// Live children of a folder, skipping stale references
    pub fn children(&self, parent: u64) -> impl Iterator<Item = &Node> + '_ {
        self.nodes
            .get(&parent)
            .map(|p| p.children())
            .unwrap_or(&[])
            .iter()
            .filter_map(move |ino| self.nodes.get(ino))
    }

    /// Find a live child by name
    pub fn find_child(&self, parent: u64, name: &str) -> Option<&Node> {
        self.children(parent).find(|child| child.name == name)
    }

    /// Link a child into a folder; returns false if already linked
    pub fn add_child(&mut self, parent: u64, child: u64) -> bool {
        match self.nodes.get_mut(&parent).and_then(Node::children_mut) {
            Some(children) if !children.contains(&child) => {
                children.push(child);
                true
            }
            _ => false,
        }
    }

    /// Unlink a child from a folder
    pub fn remove_child(&mut self, parent: u64, child: u64) {
        if let Some(children) = self.nodes.get_mut(&parent).and_then(Node::children_mut) {
            children.retain(|c| *c != child);
        }
    }

    /// Drop child references that no longer resolve; returns how many
    pub fn prune_children(&mut self, parent: u64) -> usize {
        let live: Vec<u64> = self.children(parent).map(|n| n.inode).collect();
        match self.nodes.get_mut(&parent).and_then(Node::children_mut) {
            Some(children) => {
                let stale = children.len() - live.len();
                *children = live;
                stale
            }
            None => 0,
        }
    }

    /// Inodes of all folders
    pub fn folders(&self) -> Vec<u64> {
        self.nodes
            .values()
            .filter(|n| n.is_folder())
            .map(|n| n.inode)
            .collect()
    }

    /// Number of nodes, root included
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when only the root exists
    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }
}
