//! Shared fixtures for integration tests: an in-memory remote store with
//! failure injection, and a harness that opens a full set of services in
//! a temporary cache directory.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;
use tokio::sync::Semaphore;

use stratofs::remote::{
    MetadataPatch, NewObject, ObjectKind, RemoteError, RemoteObject, RemoteResult, RemoteStore,
};
use stratofs::{Config, Services};

pub const ROOT_ID: &str = "mock-root";

#[derive(Debug, Clone)]
struct Stored {
    object: RemoteObject,
    content: Vec<u8>,
    trashed: bool,
}

/// Remote store kept in memory, with call counters and injectable failures
#[derive(Debug)]
pub struct MockRemote {
    objects: Mutex<HashMap<String, Stored>>,
    next_id: AtomicUsize,

    pub inserts: AtomicUsize,
    pub trashes: AtomicUsize,
    pub patches: AtomicUsize,
    pub upload_attempts: AtomicUsize,

    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,

    /// Transient upload failures still to inject
    failing_uploads: AtomicUsize,
    reject_uploads: AtomicBool,
    fail_patches: AtomicBool,
    upload_delay: Mutex<Duration>,
    /// Latency of insert, trash and patch
    call_delay: Mutex<Duration>,
    /// When set, each upload waits for a permit
    upload_gate: Mutex<Option<Arc<Semaphore>>>,
}

impl Default for MockRemote {
    fn default() -> Self {
        let now = Utc::now();
        let root = Stored {
            object: RemoteObject {
                id: ROOT_ID.to_string(),
                title: String::new(),
                kind: ObjectKind::Folder,
                parent_ids: Vec::new(),
                size: 0,
                created_at: now,
                modified_at: now,
                download_url: None,
            },
            content: Vec::new(),
            trashed: false,
        };

        Self {
            objects: Mutex::new(HashMap::from([(ROOT_ID.to_string(), root)])),
            next_id: AtomicUsize::new(1),
            inserts: AtomicUsize::new(0),
            trashes: AtomicUsize::new(0),
            patches: AtomicUsize::new(0),
            upload_attempts: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            failing_uploads: AtomicUsize::new(0),
            reject_uploads: AtomicBool::new(false),
            fail_patches: AtomicBool::new(false),
            upload_delay: Mutex::new(Duration::ZERO),
            call_delay: Mutex::new(Duration::ZERO),
            upload_gate: Mutex::new(None),
        }
    }
}

impl MockRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next `count` uploads with a transport error
    pub fn fail_uploads(&self, count: usize) {
        self.failing_uploads.store(count, Ordering::SeqCst);
    }

    /// Reject every upload as invalid content
    pub fn reject_uploads(&self) {
        self.reject_uploads.store(true, Ordering::SeqCst);
    }

    pub fn fail_patches(&self, fail: bool) {
        self.fail_patches.store(fail, Ordering::SeqCst);
    }

    pub fn set_upload_delay(&self, delay: Duration) {
        *self.upload_delay.lock().unwrap() = delay;
    }

    pub fn set_call_delay(&self, delay: Duration) {
        *self.call_delay.lock().unwrap() = delay;
    }

    async fn pause(&self) {
        let delay = *self.call_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    /// Block uploads until [`MockRemote::open_gate`] hands out permits
    pub fn close_gate(&self) {
        *self.upload_gate.lock().unwrap() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn open_gate(&self, uploads: usize) {
        if let Some(gate) = self.upload_gate.lock().unwrap().as_ref() {
            gate.add_permits(uploads);
        }
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Live object by id
    pub fn object(&self, id: &str) -> Option<RemoteObject> {
        let objects = self.objects.lock().unwrap();
        objects
            .get(id)
            .filter(|s| !s.trashed)
            .map(|s| s.object.clone())
    }

    pub fn content(&self, id: &str) -> Option<Vec<u8>> {
        let objects = self.objects.lock().unwrap();
        objects.get(id).map(|s| s.content.clone())
    }

    pub fn is_trashed(&self, id: &str) -> bool {
        let objects = self.objects.lock().unwrap();
        objects.get(id).map(|s| s.trashed).unwrap_or(false)
    }

    /// Add a file directly, as another client would
    pub fn put_file(&self, parent_id: &str, title: &str, content: &[u8]) -> RemoteObject {
        let mut object = self.new_object(NewObject::file(title, parent_id));
        object.size = content.len() as u64;
        object.download_url = Some(format!("mock://{}", object.id));
        self.store(object.clone(), content.to_vec());
        object
    }

    /// Add a folder directly, as another client would
    pub fn put_folder(&self, parent_id: &str, title: &str) -> RemoteObject {
        let object = self.new_object(NewObject::folder(title, parent_id));
        self.store(object.clone(), Vec::new());
        object
    }

    /// Trash an object directly, as another client would
    pub fn remove(&self, id: &str) {
        if let Some(stored) = self.objects.lock().unwrap().get_mut(id) {
            stored.trashed = true;
        }
    }

    fn new_object(&self, object: NewObject) -> RemoteObject {
        let id = format!("obj-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let now = Utc::now();
        RemoteObject {
            id,
            title: object.title,
            kind: object.kind,
            parent_ids: vec![object.parent_id],
            size: 0,
            created_at: now,
            modified_at: now,
            download_url: None,
        }
    }

    fn store(&self, object: RemoteObject, content: Vec<u8>) {
        self.objects.lock().unwrap().insert(
            object.id.clone(),
            Stored {
                object,
                content,
                trashed: false,
            },
        );
    }

    fn require_folder(&self, id: &str) -> RemoteResult<()> {
        match self.object(id) {
            Some(o) if o.kind == ObjectKind::Folder => Ok(()),
            _ => Err(RemoteError::NotFound(id.to_string())),
        }
    }

    async fn run_upload(&self, source: &Path, object: NewObject) -> RemoteResult<RemoteObject> {
        let gate = self.upload_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.acquire()
                .await
                .map_err(|e| RemoteError::Transport(e.to_string()))?
                .forget();
        }

        let delay = *self.upload_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.reject_uploads.load(Ordering::SeqCst) {
            return Err(RemoteError::Rejected("invalid content type".into()));
        }
        let failing = self
            .failing_uploads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(RemoteError::Transport("503 service unavailable".into()));
        }

        self.require_folder(&object.parent_id)?;
        let content = tokio::fs::read(source).await?;

        let mut object = self.new_object(object);
        object.size = content.len() as u64;
        object.download_url = Some(format!("mock://{}", object.id));
        self.store(object.clone(), content);
        Ok(object)
    }
}

#[async_trait]
impl RemoteStore for MockRemote {
    fn root_id(&self) -> &str {
        ROOT_ID
    }

    async fn insert(&self, object: NewObject) -> RemoteResult<RemoteObject> {
        self.inserts.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        self.require_folder(&object.parent_id)?;
        let object = self.new_object(object);
        self.store(object.clone(), Vec::new());
        Ok(object)
    }

    async fn trash(&self, id: &str) -> RemoteResult<()> {
        self.trashes.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        let mut objects = self.objects.lock().unwrap();
        match objects.get_mut(id) {
            Some(stored) if !stored.trashed => {
                stored.trashed = true;
                Ok(())
            }
            _ => Err(RemoteError::NotFound(id.to_string())),
        }
    }

    async fn patch(&self, id: &str, patch: MetadataPatch) -> RemoteResult<RemoteObject> {
        self.patches.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        if self.fail_patches.load(Ordering::SeqCst) {
            return Err(RemoteError::Transport("connection reset".into()));
        }

        let mut objects = self.objects.lock().unwrap();
        let stored = objects
            .get_mut(id)
            .filter(|s| !s.trashed)
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))?;

        let object = &mut stored.object;
        if let Some(title) = patch.title {
            object.title = title;
        }
        if let Some(parent) = patch.remove_parent {
            object.parent_ids.retain(|p| *p != parent);
        }
        if let Some(parent) = patch.add_parent {
            if !object.parent_ids.contains(&parent) {
                object.parent_ids.insert(0, parent);
            }
        }
        object.modified_at = Utc::now();
        Ok(object.clone())
    }

    async fn upload_content(&self, source: &Path, object: NewObject) -> RemoteResult<RemoteObject> {
        self.upload_attempts.fetch_add(1, Ordering::SeqCst);
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(running, Ordering::SeqCst);

        let result = self.run_upload(source, object).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn download_range(&self, id: &str, start: u64, end: u64) -> RemoteResult<Vec<u8>> {
        let content = self
            .content(id)
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))?;
        let start = (start as usize).min(content.len());
        let end = (end as usize + 1).min(content.len());
        Ok(content[start..end].to_vec())
    }

    async fn list_children(&self, folder_id: &str) -> RemoteResult<Vec<RemoteObject>> {
        self.require_folder(folder_id)?;
        let objects = self.objects.lock().unwrap();
        let mut children: Vec<_> = objects
            .values()
            .filter(|s| !s.trashed && s.object.parent_ids.iter().any(|p| p == folder_id))
            .map(|s| s.object.clone())
            .collect();
        children.sort_by(|a, b| a.title.cmp(&b.title));
        Ok(children)
    }
}

/// Config rooted in a temporary directory, tuned for fast tests
pub fn test_config(dir: &Path, max_concurrent: usize) -> Config {
    let mut config = Config::default();
    config.cache.location = dir.join("cache");
    config.mount.path = dir.join("mnt");
    config.remote.root = dir.join("remote");
    config.chunks.size = 4;
    config.refresh.delay_ms = 0;
    config.upload.max_concurrent = max_concurrent;
    config.upload.timeout_secs = 30;
    config.upload.retry_delay_ms = 10;
    config.upload.resume_delay_ms = 0;
    config
}

/// A full set of services over a [`MockRemote`]
pub struct Harness {
    pub dir: TempDir,
    pub config: Config,
    pub remote: Arc<MockRemote>,
    pub services: Services,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_concurrency(4).await
    }

    pub async fn with_concurrency(max_concurrent: usize) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), max_concurrent);
        let remote = MockRemote::new();
        let services = Services::open(&config, remote.clone()).unwrap();
        Self {
            dir,
            config,
            remote,
            services,
        }
    }

    /// Open the same cache directory again, as after a restart
    pub fn reopen(&self, remote: Arc<MockRemote>) -> Services {
        Services::open(&self.config, remote).unwrap()
    }

    /// Create a file, write `content`, and close it
    pub async fn write_file(&self, parent: u64, name: &str, content: &[u8]) -> u64 {
        let fs = &self.services.dispatcher;
        let (node, opened) = fs.create(parent, name, 0o644).await.unwrap();
        if !content.is_empty() {
            fs.write(node.inode, opened.fh, 0, content).await.unwrap();
        }
        fs.release(node.inode, opened.fh).await.unwrap();
        node.inode
    }

    /// Wait for the upload queue to drain
    pub async fn settle(&self) {
        tokio::time::timeout(Duration::from_secs(10), self.services.pipeline.wait_idle())
            .await
            .expect("uploads did not settle");
    }
}

/// Poll `check` until it holds or a few seconds pass
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
