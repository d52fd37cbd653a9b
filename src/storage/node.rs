//! Filesystem nodes
//!
//! A node is either a File or a Folder. Back-references to the parent are
//! remote identifiers, children are inode numbers; neither owns the other.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::remote::{ObjectKind, RemoteObject};

/// Root inode number
pub const ROOT_INODE: u64 = 1;

/// Default permissions for new files
pub const DEFAULT_FILE_MODE: u32 = 0o644;

/// Default permissions for new folders
pub const DEFAULT_FOLDER_MODE: u32 = 0o755;

/// A file or folder in the namespace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Local inode number
    pub inode: u64,

    /// Remote object id, null until confirmed remotely
    pub remote_id: Option<String>,

    /// Remote id of the containing folder
    pub parent_remote_id: Option<String>,

    pub name: String,
    pub ctime: DateTime<Utc>,
    pub mtime: DateTime<Utc>,

    /// Permission bits
    pub mode: u32,

    /// Size in bytes; grows optimistically during writes
    pub size: u64,

    pub kind: NodeKind,
}

/// Variant-specific node data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum NodeKind {
    File {
        /// Set iff the full content is confirmed available remotely
        download_url: Option<String>,
    },
    Folder {
        /// Child inode numbers in listing order
        children: Vec<u64>,
    },
}

impl Node {
    /// A new, unconfirmed, empty file
    pub fn new_file(inode: u64, parent_remote_id: Option<String>, name: &str, mode: u32) -> Self {
        let now = Utc::now();
        Self {
            inode,
            remote_id: None,
            parent_remote_id,
            name: name.to_string(),
            ctime: now,
            mtime: now,
            mode,
            size: 0,
            kind: NodeKind::File { download_url: None },
        }
    }

    /// The root folder
    pub fn root(remote_id: &str) -> Self {
        let now = Utc::now();
        Self {
            inode: ROOT_INODE,
            remote_id: Some(remote_id.to_string()),
            parent_remote_id: None,
            name: String::new(),
            ctime: now,
            mtime: now,
            mode: DEFAULT_FOLDER_MODE,
            size: 0,
            kind: NodeKind::Folder { children: Vec::new() },
        }
    }

    /// Build a node from a remote object description
    pub fn from_remote(inode: u64, object: &RemoteObject) -> Self {
        let (kind, mode, size) = match object.kind {
            ObjectKind::Folder => (
                NodeKind::Folder { children: Vec::new() },
                DEFAULT_FOLDER_MODE,
                0,
            ),
            ObjectKind::File => (
                NodeKind::File {
                    download_url: object.download_url.clone(),
                },
                DEFAULT_FILE_MODE,
                object.size,
            ),
        };

        Self {
            inode,
            remote_id: Some(object.id.clone()),
            parent_remote_id: object.parent_id().map(str::to_string),
            name: object.title.clone(),
            ctime: object.created_at,
            mtime: object.modified_at,
            mode,
            size,
            kind,
        }
    }

    pub fn is_folder(&self) -> bool {
        kind_is_folder(&self.kind)
    }

    pub fn is_file(&self) -> bool {
        !self.is_folder()
    }

    /// Child inodes, empty for files
    pub fn children(&self) -> &[u64] {
        match &self.kind {
            NodeKind::Folder { children } => children,
            NodeKind::File { .. } => &[],
        }
    }

    pub fn children_mut(&mut self) -> Option<&mut Vec<u64>> {
        match &mut self.kind {
            NodeKind::Folder { children } => Some(children),
            NodeKind::File { .. } => None,
        }
    }

    /// Download locator, only for confirmed files
    pub fn download_url(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::File { download_url } => download_url.as_deref(),
            NodeKind::Folder { .. } => None,
        }
    }

    pub fn set_download_url(&mut self, url: Option<String>) {
        if let NodeKind::File { download_url } = &mut self.kind {
            *download_url = url;
        }
    }

    /// Apply confirmed remote metadata to a file node
    pub fn confirm(&mut self, object: &RemoteObject) {
        self.remote_id = Some(object.id.clone());
        if let Some(parent) = object.parent_id() {
            self.parent_remote_id = Some(parent.to_string());
        }
        self.size = object.size;
        self.ctime = object.created_at;
        self.mtime = object.modified_at;
        self.set_download_url(object.download_url.clone());
    }
}

fn kind_is_folder(kind: &NodeKind) -> bool {
    matches!(kind, NodeKind::Folder { .. })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote_file(id: &str, size: u64) -> RemoteObject {
        RemoteObject {
            id: id.to_string(),
            title: "report.pdf".to_string(),
            kind: ObjectKind::File,
            parent_ids: vec!["parent".to_string()],
            size,
            created_at: Utc::now(),
            modified_at: Utc::now(),
            download_url: Some(format!("https://example.invalid/{}", id)),
        }
    }

    #[test]
    fn test_new_file_is_unconfirmed() {
        let node = Node::new_file(7, Some("p".into()), "a.txt", DEFAULT_FILE_MODE);
        assert!(node.is_file());
        assert!(node.remote_id.is_none());
        assert!(node.download_url().is_none());
        assert!(node.children().is_empty());
    }

    #[test]
    fn test_confirm_sets_remote_identity() {
        let mut node = Node::new_file(7, Some("old".into()), "report.pdf", 0o600);
        node.size = 3;
        node.confirm(&remote_file("abc", 42));

        assert_eq!(node.remote_id.as_deref(), Some("abc"));
        assert_eq!(node.parent_remote_id.as_deref(), Some("parent"));
        assert_eq!(node.size, 42);
        assert_eq!(node.mode, 0o600);
        assert!(node.download_url().is_some());
    }

    #[test]
    fn test_snapshot_shape() {
        let root = Node::root("r");
        let json = serde_json::to_string(&root).unwrap();
        assert!(json.contains("\"type\":\"folder\""));
        let back: Node = serde_json::from_str(&json).unwrap();
        assert_eq!(back, root);
    }
}
