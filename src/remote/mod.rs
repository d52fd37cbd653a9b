//! Remote object-store capability
//!
//! The filesystem core only talks to the remote account through the
//! [`RemoteStore`] trait. Transport and authentication live behind it.

pub mod local;

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use local::LocalStore;

/// Result type for remote calls
pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// Remote store failures
#[derive(Error, Debug)]
pub enum RemoteError {
    /// The store refused the content (e.g. invalid content type); retrying won't help
    #[error("content rejected: {0}")]
    Rejected(String),

    /// The referenced object does not exist remotely
    #[error("remote object not found: {0}")]
    NotFound(String),

    /// Network or service failure; may succeed if retried
    #[error("transport error: {0}")]
    Transport(String),

    /// Local I/O failure while reading content to send
    #[error("local I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RemoteError {
    /// Whether an upload that failed with this error should be abandoned
    pub fn is_terminal(&self) -> bool {
        match self {
            RemoteError::Rejected(_) => true,
            RemoteError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

/// Object kind as seen by the remote store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    File,
    Folder,
}

/// Metadata for an object about to be created
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewObject {
    pub title: String,
    pub parent_id: String,
    pub kind: ObjectKind,
}

impl NewObject {
    pub fn folder(title: impl Into<String>, parent_id: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            parent_id: parent_id.into(),
            kind: ObjectKind::Folder,
        }
    }

    pub fn file(title: impl Into<String>, parent_id: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            parent_id: parent_id.into(),
            kind: ObjectKind::File,
        }
    }
}

/// Metadata change for rename/move
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataPatch {
    /// New title
    pub title: Option<String>,
    /// Parent to add (move destination)
    pub add_parent: Option<String>,
    /// Parent to remove (move source)
    pub remove_parent: Option<String>,
}

impl MetadataPatch {
    /// Rename, and re-parent when the folders differ
    pub fn rename(title: &str, from_parent: &str, to_parent: &str) -> Self {
        let moved = from_parent != to_parent;
        Self {
            title: Some(title.to_string()),
            add_parent: moved.then(|| to_parent.to_string()),
            remove_parent: moved.then(|| from_parent.to_string()),
        }
    }
}

/// An object as described by the remote store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteObject {
    pub id: String,
    pub title: String,
    pub kind: ObjectKind,
    pub parent_ids: Vec<String>,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    /// Set once file content is available for download
    pub download_url: Option<String>,
}

impl RemoteObject {
    /// First parent, which is the one the namespace follows
    pub fn parent_id(&self) -> Option<&str> {
        self.parent_ids.first().map(String::as_str)
    }
}

/// Capability interface to the remote object store
///
/// All calls are fallible and latency-bound.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Identifier of the account's root folder
    fn root_id(&self) -> &str;

    /// Create an object (used for folders)
    async fn insert(&self, object: NewObject) -> RemoteResult<RemoteObject>;

    /// Move an object to the trash
    async fn trash(&self, id: &str) -> RemoteResult<()>;

    /// Rename and/or re-parent an object
    async fn patch(&self, id: &str, patch: MetadataPatch) -> RemoteResult<RemoteObject>;

    /// Upload the bytes of a local file as a new file object
    async fn upload_content(&self, source: &Path, object: NewObject) -> RemoteResult<RemoteObject>;

    /// Fetch bytes `start..=end` of a file object
    async fn download_range(&self, id: &str, start: u64, end: u64) -> RemoteResult<Vec<u8>>;

    /// List the live children of a folder
    async fn list_children(&self, folder_id: &str) -> RemoteResult<Vec<RemoteObject>>;
}
