//! Upload worker pool

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, error, info, warn};

use super::{PipelineSettings, ResumeSummary, UploadJob, UploadOutcome};
use crate::error::Result;
use crate::remote::{MetadataPatch, NewObject, RemoteObject, RemoteStore};
use crate::storage::{ChunkCache, SharedNamespace, UploadRecord};

/// Upload pipeline handle
///
/// Cloneable; every clone feeds the same queue and worker pool.
#[derive(Clone)]
pub struct UploadPipeline {
    inner: Arc<PipelineInner>,
}

struct PipelineInner {
    namespace: SharedNamespace,
    remote: Arc<dyn RemoteStore>,
    chunks: Arc<ChunkCache>,
    settings: PipelineSettings,

    /// Job queue; retries re-enter here
    sender: mpsc::UnboundedSender<UploadJob>,

    /// Bounds the number of attempts in flight
    permits: Arc<Semaphore>,

    /// Jobs queued, running or waiting to retry
    pending: watch::Sender<usize>,
}

/// Upload attempt prepared under the namespace lock
struct Attempt {
    cache: String,
    generation: u64,
    staging: PathBuf,
    object: NewObject,
}

impl UploadPipeline {
    /// Create the pipeline and spawn its dispatch task
    pub fn start(
        namespace: SharedNamespace,
        remote: Arc<dyn RemoteStore>,
        chunks: Arc<ChunkCache>,
        settings: PipelineSettings,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (pending, _) = watch::channel(0usize);

        let inner = Arc::new(PipelineInner {
            namespace,
            remote,
            chunks,
            permits: Arc::new(Semaphore::new(settings.max_concurrent.max(1))),
            settings,
            sender,
            pending,
        });

        tokio::spawn(Self::dispatch_task(Arc::clone(&inner), receiver));

        Self { inner }
    }

    /// Queue an upload for `inode`; never blocks
    pub fn enqueue(&self, inode: u64) {
        self.inner.pending.send_modify(|n| *n += 1);
        if self.inner.sender.send(UploadJob::new(inode)).is_err() {
            error!("Upload queue closed, inode {} not queued", inode);
            self.inner.pending.send_modify(|n| *n = n.saturating_sub(1));
        } else {
            debug!("Queued upload for inode {}", inode);
        }
    }

    /// Number of jobs queued, running or waiting to retry
    pub fn pending(&self) -> usize {
        *self.inner.pending.borrow()
    }

    /// Wait until no job is queued, running or waiting to retry
    pub async fn wait_idle(&self) {
        let mut rx = self.inner.pending.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// Path of a staging file in the upload area
    pub fn staging_path(&self, cache: &str) -> PathBuf {
        self.inner.settings.upload_dir.join(cache)
    }

    /// Recover the upload ledger after a restart
    ///
    /// Only records left by an earlier process are considered; sessions
    /// opened since this process started are never touched. Released
    /// records are queued again. Unreleased ones belong to write sessions
    /// that never closed: their node, record and staging file are
    /// discarded.
    pub async fn resume(&self) -> Result<ResumeSummary> {
        let mut summary = ResumeSummary::default();
        let mut requeue = Vec::new();
        let mut abandoned = Vec::new();

        {
            let mut ns = self.inner.namespace.write().await;
            for inode in ns.take_recovered() {
                let Some(record) = ns.uploads.get(inode).cloned() else {
                    continue;
                };
                if record.released && ns.inodes.contains(inode) {
                    if let Some(r) = ns.uploads.get_mut(inode) {
                        r.uploading = false;
                    }
                    requeue.push(inode);
                } else {
                    ns.discard(inode);
                    abandoned.push(record.cache);
                }
            }
            ns.persist()?;
        }

        for cache in abandoned {
            remove_staging(&self.staging_path(&cache)).await;
            summary.discarded += 1;
        }
        for inode in requeue {
            self.enqueue(inode);
            summary.requeued += 1;
        }

        info!(
            "Resumed uploads: {} requeued, {} discarded",
            summary.requeued, summary.discarded
        );
        Ok(summary)
    }

    /// Pull jobs off the queue, one worker permit each
    async fn dispatch_task(inner: Arc<PipelineInner>, mut receiver: mpsc::UnboundedReceiver<UploadJob>) {
        while let Some(job) = receiver.recv().await {
            let permit = match Arc::clone(&inner.permits).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            let inner = Arc::clone(&inner);
            tokio::spawn(async move {
                let outcome = inner.process(job).await;
                drop(permit);
                inner.finish(job, outcome);
            });
        }
        debug!("Upload dispatch task exiting");
    }
}

impl PipelineInner {
    fn staging_path(&self, cache: &str) -> PathBuf {
        self.settings.upload_dir.join(cache)
    }

    /// Run one attempt of a job
    async fn process(&self, job: UploadJob) -> UploadOutcome {
        let attempt = match self.prepare(job).await {
            Ok(attempt) => attempt,
            Err(outcome) => return outcome,
        };

        debug!(
            "Uploading inode {} as {:?} (attempt {})",
            job.inode, attempt.object.title, job.attempt
        );

        let upload = self
            .remote
            .upload_content(&attempt.staging, attempt.object.clone());

        match tokio::time::timeout(self.settings.timeout, upload).await {
            Ok(Ok(object)) => self.on_uploaded(job, &attempt, object).await,
            Ok(Err(e)) if e.is_terminal() => {
                error!("Upload of inode {} abandoned: {}", job.inode, e);
                self.on_terminal(job, &attempt).await
            }
            Ok(Err(e)) => {
                warn!("Upload of inode {} failed (attempt {}): {}", job.inode, job.attempt, e);
                self.on_transient(job).await
            }
            Err(_) => {
                warn!(
                    "Upload of inode {} timed out after {:?} (attempt {})",
                    job.inode, self.settings.timeout, job.attempt
                );
                self.on_transient(job).await
            }
        }
    }

    /// Read node and record, mark the record uploading
    async fn prepare(&self, job: UploadJob) -> std::result::Result<Attempt, UploadOutcome> {
        let mut ns = self.namespace.write().await;

        let record: UploadRecord = match ns.uploads.get(job.inode) {
            Some(record) if record.uploading => {
                debug!("Inode {} already uploading, skipping duplicate job", job.inode);
                return Err(UploadOutcome::Skipped);
            }
            // Reopened for writing; release queues it again
            Some(record) if !record.released => return Err(UploadOutcome::Skipped),
            Some(record) => record.clone(),
            None => return Err(UploadOutcome::Skipped),
        };
        let staging = self.staging_path(&record.cache);

        let node = match ns.inodes.get(job.inode) {
            Some(node) => node.clone(),
            None => {
                ns.uploads.remove(job.inode);
                if let Err(e) = ns.persist_uploads() {
                    error!("Failed to persist upload ledger: {}", e);
                }
                drop(ns);
                remove_staging(&staging).await;
                return Err(UploadOutcome::Dropped);
            }
        };

        let parent = node
            .parent_remote_id
            .clone()
            .unwrap_or_else(|| self.remote.root_id().to_string());

        if let Some(r) = ns.uploads.get_mut(job.inode) {
            r.uploading = true;
        }
        if let Err(e) = ns.persist_uploads() {
            error!("Failed to persist upload ledger: {}", e);
        }

        Ok(Attempt {
            cache: record.cache,
            generation: record.generation,
            staging,
            object: NewObject::file(node.name, parent),
        })
    }

    /// Confirm the node, then move its content into the chunk cache
    async fn on_uploaded(&self, job: UploadJob, attempt: &Attempt, object: RemoteObject) -> UploadOutcome {
        let mut rename = None;
        let present = {
            let mut ns = self.namespace.write().await;

            // Reopened for writing while this attempt ran: the object holds
            // old content. Keep the record and go round again; the retry is
            // skipped until the new session is released.
            if let Some(record) = ns
                .uploads
                .get_mut(job.inode)
                .filter(|r| r.generation != attempt.generation)
            {
                record.uploading = false;
                if let Err(e) = ns.persist_uploads() {
                    error!("Failed to persist upload ledger: {}", e);
                }
                drop(ns);
                debug!("Inode {} was rewritten during upload, discarding {}", job.inode, object.id);
                if let Err(e) = self.remote.trash(&object.id).await {
                    warn!("Unable to trash superseded object {}: {}", object.id, e);
                }
                return UploadOutcome::Retry;
            }

            ns.uploads.remove(job.inode);

            match ns.inodes.get(job.inode).cloned() {
                Some(mut node) => {
                    // The node may have been renamed or moved locally while
                    // the upload was running; local placement wins.
                    let placed_parent = node.parent_remote_id.clone();
                    node.confirm(&object);
                    node.parent_remote_id = placed_parent.clone();

                    if let Some(to_parent) = placed_parent.as_deref() {
                        let from_parent = object.parent_id().unwrap_or(to_parent);
                        if node.name != object.title || from_parent != to_parent {
                            rename = Some(MetadataPatch::rename(&node.name, from_parent, to_parent));
                        }
                    }

                    let parent = ns.inodes.parent_of(&node);
                    ns.inodes.set(node);
                    if let Some(parent) = parent {
                        ns.inodes.add_child(parent, job.inode);
                    }
                    if let Err(e) = ns.persist() {
                        error!("Failed to persist namespace after upload: {}", e);
                    }
                    true
                }
                None => {
                    if let Err(e) = ns.persist_uploads() {
                        error!("Failed to persist upload ledger: {}", e);
                    }
                    // A new file with the same name may already stage here
                    if !ns.uploads.references(&attempt.cache) {
                        remove_staging(&attempt.staging).await;
                    }
                    false
                }
            }
        };

        if !present {
            debug!("Inode {} was removed during upload", job.inode);
            return UploadOutcome::Uploaded { remote_id: object.id };
        }

        if let Some(patch) = rename {
            if let Err(e) = self.remote.patch(&object.id, patch).await {
                warn!("Failed to apply local rename to {}: {}", object.id, e);
            }
        }

        if let Err(e) = self
            .chunks
            .materialize(&object.id, &attempt.staging, object.size)
            .await
        {
            warn!("Failed to materialize {}: {}", object.id, e);
            remove_staging(&attempt.staging).await;
        }

        info!("Uploaded inode {} as {} ({} bytes)", job.inode, object.id, object.size);
        UploadOutcome::Uploaded { remote_id: object.id }
    }

    /// Drop the record; the node, if any, stays unconfirmed
    async fn on_terminal(&self, job: UploadJob, attempt: &Attempt) -> UploadOutcome {
        let mut ns = self.namespace.write().await;
        ns.uploads.remove(job.inode);
        if let Err(e) = ns.persist_uploads() {
            error!("Failed to persist upload ledger: {}", e);
        }
        if !ns.uploads.references(&attempt.cache) {
            remove_staging(&attempt.staging).await;
        }
        UploadOutcome::Dropped
    }

    /// Clear the in-flight flag so the retry can run
    async fn on_transient(&self, job: UploadJob) -> UploadOutcome {
        let mut ns = self.namespace.write().await;
        match ns.uploads.get_mut(job.inode) {
            Some(record) => {
                record.uploading = false;
                if let Err(e) = ns.persist_uploads() {
                    error!("Failed to persist upload ledger: {}", e);
                }
                UploadOutcome::Retry
            }
            // Unlinked while the attempt was running
            None => UploadOutcome::Dropped,
        }
    }

    /// Settle a finished attempt. Retries are sent back after the retry
    /// delay without holding a worker permit.
    fn finish(&self, job: UploadJob, outcome: UploadOutcome) {
        match outcome {
            UploadOutcome::Retry => {
                let sender = self.sender.clone();
                let pending = self.pending.clone();
                let delay = self.settings.retry_delay;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if sender.send(job.next()).is_err() {
                        pending.send_modify(|n| *n = n.saturating_sub(1));
                    }
                });
            }
            _ => self.pending.send_modify(|n| *n = n.saturating_sub(1)),
        }
    }
}

async fn remove_staging(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Unable to remove staging file {:?}: {}", path, e);
        }
    }
}
