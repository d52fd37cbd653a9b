//! Local chunk cache
//!
//! Confirmed file content is kept under the download area as fixed-size
//! chunk files named `objectId-start-end`. Freshly uploaded staging files
//! are split into chunks; reads that miss are fetched from the remote store
//! one chunk at a time. Every chunk on disk has a row in the ledger.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

use super::ledger::{chunk_key, ChunkEntry, ChunkLedger, INSERT_BATCH};
use crate::error::{Error, Result};
use crate::remote::RemoteStore;

/// Chunked read cache for confirmed content
pub struct ChunkCache {
    /// Download area
    base_dir: PathBuf,

    /// Chunk size in bytes
    chunk_size: u64,

    ledger: ChunkLedger,
}

impl ChunkCache {
    /// Create a chunk cache over `base_dir`
    pub fn new(base_dir: PathBuf, chunk_size: u64, ledger: ChunkLedger) -> Result<Self> {
        if chunk_size == 0 {
            return Err(Error::Config("chunk size must be greater than zero".into()));
        }
        std::fs::create_dir_all(&base_dir)?;

        Ok(Self {
            base_dir,
            chunk_size,
            ledger,
        })
    }

    pub fn ledger(&self) -> &ChunkLedger {
        &self.ledger
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Get the path for a chunk by its key
    fn chunk_path(&self, key: &str) -> PathBuf {
        self.base_dir.join(key)
    }

    /// Inclusive byte range of the chunk containing `offset`
    fn bounds(&self, offset: u64, file_size: u64) -> (u64, u64) {
        let start = offset - offset % self.chunk_size;
        let end = (start + self.chunk_size).min(file_size) - 1;
        (start, end)
    }

    /// Every chunk range of a file of `size` bytes
    pub fn ranges(&self, size: u64) -> Vec<(u64, u64)> {
        let mut ranges = Vec::new();
        let mut start = 0;
        while start < size {
            ranges.push(self.bounds(start, size));
            start += self.chunk_size;
        }
        ranges
    }

    async fn write_chunk(&self, key: &str, data: &[u8]) -> Result<()> {
        let path = self.chunk_path(key);
        let tmp = path.with_extension("part");
        let mut file = File::create(&tmp).await?;
        file.write_all(data).await?;
        file.flush().await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Split an uploaded staging file into chunks and record them, then
    /// delete the staging file. Returns the number of chunks written.
    pub async fn materialize(&self, object_id: &str, staging: &Path, size: u64) -> Result<usize> {
        let mut source = File::open(staging).await?;
        let mut pending = Vec::new();
        let mut written = 0;

        for (start, end) in self.ranges(size) {
            let mut data = vec![0u8; (end - start + 1) as usize];
            source.read_exact(&mut data).await?;

            let entry = ChunkEntry::new(object_id, start, end);
            self.write_chunk(&entry.key, &data).await?;
            pending.push(entry);

            if pending.len() >= INSERT_BATCH {
                written += self.ledger.insert_batch(&pending).await?;
                pending.clear();
            }
        }

        if !pending.is_empty() {
            written += self.ledger.insert_batch(&pending).await?;
        }
        drop(source);

        if let Err(e) = fs::remove_file(staging).await {
            warn!("Unable to remove staging file {:?}: {}", staging, e);
        }

        debug!("Materialized {} ({} bytes) into {} chunks", object_id, size, written);
        Ok(written)
    }

    /// Read `len` bytes at `offset` of a confirmed object, fetching any
    /// chunk that is not cached yet
    pub async fn read_range(
        &self,
        remote: &dyn RemoteStore,
        object_id: &str,
        file_size: u64,
        offset: u64,
        len: u64,
    ) -> Result<Vec<u8>> {
        if len == 0 || offset >= file_size {
            return Ok(Vec::new());
        }

        let last = (offset + len).min(file_size) - 1;
        let mut result = Vec::with_capacity((last - offset + 1) as usize);
        let mut cursor = offset;

        while cursor <= last {
            let (start, end) = self.bounds(cursor, file_size);
            let key = chunk_key(object_id, start, end);
            let want_end = end.min(last);

            let path = self.chunk_path(&key);
            let data = if self.ledger.contains(&key).await? && fs::metadata(&path).await.is_ok() {
                self.ledger.touch(&key).await?;
                read_part(&path, cursor - start, want_end - cursor + 1).await?
            } else {
                let fetched = self.fetch(remote, object_id, start, end).await?;
                let from = (cursor - start) as usize;
                let to = (want_end - start + 1) as usize;
                fetched[from..to].to_vec()
            };

            result.extend_from_slice(&data);
            cursor = want_end + 1;
        }

        Ok(result)
    }

    /// Download one whole chunk and record it
    async fn fetch(
        &self,
        remote: &dyn RemoteStore,
        object_id: &str,
        start: u64,
        end: u64,
    ) -> Result<Vec<u8>> {
        debug!("Fetching chunk {}-{}-{}", object_id, start, end);
        let data = remote.download_range(object_id, start, end).await?;
        if data.len() as u64 != end - start + 1 {
            return Err(Error::Storage(format!(
                "short chunk {}-{}-{}: got {} bytes",
                object_id,
                start,
                end,
                data.len()
            )));
        }

        let entry = ChunkEntry::new(object_id, start, end);
        self.write_chunk(&entry.key, &data).await?;
        self.ledger.insert_batch(&[entry]).await?;
        Ok(data)
    }

    /// Drop every cached chunk of an object
    pub async fn evict(&self, object_id: &str) -> Result<usize> {
        let keys = self.ledger.remove_object(object_id).await?;
        for key in &keys {
            if let Err(e) = fs::remove_file(self.chunk_path(key)).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Unable to remove chunk {}: {}", key, e);
                }
            }
        }
        Ok(keys.len())
    }
}

async fn read_part(path: &Path, offset: u64, len: u64) -> Result<Vec<u8>> {
    let mut file = File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut data = vec![0u8; len as usize];
    file.read_exact(&mut data).await?;
    Ok(data)
}
