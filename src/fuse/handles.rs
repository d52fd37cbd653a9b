//! Open file handles
//!
//! Read handles only carry the inode. Write handles own the staging file
//! bound to the session until release.

use std::collections::HashMap;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::{Error, Result};

/// An open session
#[derive(Debug, Clone)]
pub enum OpenHandle {
    Read { inode: u64 },
    Write { inode: u64, file: Arc<File> },
}

impl OpenHandle {
    pub fn inode(&self) -> u64 {
        match self {
            OpenHandle::Read { inode } | OpenHandle::Write { inode, .. } => *inode,
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(self, OpenHandle::Write { .. })
    }
}

/// fh -> open session
#[derive(Debug)]
pub struct HandleTable {
    next_fh: AtomicU64,
    handles: RwLock<HashMap<u64, OpenHandle>>,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            next_fh: AtomicU64::new(1),
            handles: RwLock::new(HashMap::new()),
        }
    }

    async fn bind(&self, handle: OpenHandle) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::SeqCst);
        self.handles.write().await.insert(fh, handle);
        fh
    }

    /// Register a read session
    pub async fn open_read(&self, inode: u64) -> u64 {
        self.bind(OpenHandle::Read { inode }).await
    }

    /// Bind a staging file to a new write session
    pub async fn open_write(&self, inode: u64, file: File) -> u64 {
        self.bind(OpenHandle::Write {
            inode,
            file: Arc::new(file),
        })
        .await
    }

    pub async fn get(&self, fh: u64) -> Option<OpenHandle> {
        self.handles.read().await.get(&fh).cloned()
    }

    /// Write at `offset` through a write session bound to `inode`
    pub async fn write_at(&self, fh: u64, inode: u64, offset: u64, data: &[u8]) -> Result<usize> {
        let file = match self.get(fh).await {
            Some(OpenHandle::Write { inode: bound, file }) if bound == inode => file,
            _ => {
                return Err(Error::InvalidArgument(format!(
                    "fh {} is not a write session for inode {}",
                    fh, inode
                )))
            }
        };

        let data = data.to_vec();
        let len = data.len();
        tokio::task::spawn_blocking(move || file.write_all_at(&data, offset))
            .await
            .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;
        Ok(len)
    }

    /// Close a session. The staging file is closed once the last clone of
    /// its handle is dropped.
    pub async fn close(&self, fh: u64) -> Option<OpenHandle> {
        self.handles.write().await.remove(&fh)
    }

    /// Whether any write session is still bound to `inode`
    pub async fn has_writer(&self, inode: u64) -> bool {
        self.handles
            .read()
            .await
            .values()
            .any(|h| h.is_write() && h.inode() == inode)
    }

    pub async fn len(&self) -> usize {
        self.handles.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_write_session() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("staging");
        let table = HandleTable::new();

        let fh = table.open_write(5, File::create(&path).unwrap()).await;
        assert!(table.has_writer(5).await);
        assert_eq!(table.write_at(fh, 5, 0, b"hello").await.unwrap(), 5);
        assert_eq!(table.write_at(fh, 5, 3, b"p!").await.unwrap(), 2);

        let closed = table.close(fh).await.unwrap();
        assert!(closed.is_write());
        drop(closed);
        assert!(!table.has_writer(5).await);
        assert_eq!(std::fs::read(&path).unwrap(), b"help!");
    }

    #[tokio::test]
    async fn test_write_through_read_handle_rejected() {
        let table = HandleTable::new();
        let fh = table.open_read(5).await;

        let err = table.write_at(fh, 5, 0, b"x").await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(table.write_at(fh + 100, 5, 0, b"x").await.is_err());
    }

    #[tokio::test]
    async fn test_handles_are_unique() {
        let table = HandleTable::new();
        let a = table.open_read(1).await;
        let b = table.open_read(1).await;
        assert_ne!(a, b);
        assert_eq!(table.len().await, 2);
    }
}
