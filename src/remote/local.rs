//! Directory-backed object store
//!
//! Stands in for a cloud account: each object is a JSON metadata file
//! under `objects/`, file content lives under `blobs/`.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex;
use tracing::debug;

use super::{
    MetadataPatch, NewObject, ObjectKind, RemoteError, RemoteObject, RemoteResult, RemoteStore,
};

/// Identifier of the root folder
pub const ROOT_ID: &str = "root";

/// Metadata record as stored on disk
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredObject {
    #[serde(flatten)]
    object: RemoteObject,
    #[serde(default)]
    trashed: bool,
}

/// Object store rooted at a local directory
pub struct LocalStore {
    root: PathBuf,
    /// Serializes metadata read-modify-write cycles
    write_lock: Mutex<()>,
}

impl LocalStore {
    /// Open (or initialize) a store at `root`
    pub async fn open<P: AsRef<Path>>(root: P) -> RemoteResult<Self> {
        let store = Self {
            root: root.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        };

        fs::create_dir_all(store.root.join("objects")).await?;
        fs::create_dir_all(store.root.join("blobs")).await?;

        if fs::metadata(store.meta_path(ROOT_ID)).await.is_err() {
            let now = Utc::now();
            let root = StoredObject {
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
                trashed: false,
            };
            store.save(&root).await?;
            debug!("Initialized local object store at {:?}", store.root);
        }

        Ok(store)
    }

    fn meta_path(&self, id: &str) -> PathBuf {
        self.root.join("objects").join(format!("{}.json", id))
    }

    fn blob_path(&self, id: &str) -> PathBuf {
        self.root.join("blobs").join(id)
    }

    async fn load(&self, id: &str) -> RemoteResult<StoredObject> {
        let bytes = match fs::read(self.meta_path(id)).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RemoteError::NotFound(id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let stored: StoredObject = serde_json::from_slice(&bytes).map_err(invalid_data)?;
        if stored.trashed {
            return Err(RemoteError::NotFound(id.to_string()));
        }
        Ok(stored)
    }

    async fn save(&self, stored: &StoredObject) -> RemoteResult<()> {
        let path = self.meta_path(&stored.object.id);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(stored).map_err(invalid_data)?;
        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn require_folder(&self, id: &str) -> RemoteResult<()> {
        let parent = self.load(id).await?;
        if parent.object.kind != ObjectKind::Folder {
            return Err(RemoteError::NotFound(format!("{} is not a folder", id)));
        }
        Ok(())
    }

    fn new_object(&self, object: NewObject) -> RemoteObject {
        let now = Utc::now();
        RemoteObject {
            id: uuid::Uuid::new_v4().to_string(),
            title: object.title,
            kind: object.kind,
            parent_ids: vec![object.parent_id],
            size: 0,
            created_at: now,
            modified_at: now,
            download_url: None,
        }
    }
}

fn invalid_data(e: serde_json::Error) -> RemoteError {
    RemoteError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

#[async_trait]
impl RemoteStore for LocalStore {
    fn root_id(&self) -> &str {
        ROOT_ID
    }

    async fn insert(&self, object: NewObject) -> RemoteResult<RemoteObject> {
        let _guard = self.write_lock.lock().await;
        self.require_folder(&object.parent_id).await?;

        let object = self.new_object(object);
        self.save(&StoredObject {
            object: object.clone(),
            trashed: false,
        })
        .await?;

        debug!("Inserted {:?} {} ({})", object.kind, object.title, object.id);
        Ok(object)
    }

    async fn trash(&self, id: &str) -> RemoteResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut stored = self.load(id).await?;
        stored.trashed = true;
        stored.object.modified_at = Utc::now();
        self.save(&stored).await?;
        debug!("Trashed {}", id);
        Ok(())
    }

    async fn patch(&self, id: &str, patch: MetadataPatch) -> RemoteResult<RemoteObject> {
        let _guard = self.write_lock.lock().await;
        let mut stored = self.load(id).await?;

        if let Some(parent) = &patch.add_parent {
            self.require_folder(parent).await?;
        }

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

        self.save(&stored).await?;
        Ok(stored.object)
    }

    async fn upload_content(&self, source: &Path, object: NewObject) -> RemoteResult<RemoteObject> {
        self.require_folder(&object.parent_id).await?;

        let mut object = self.new_object(object);
        let blob = self.blob_path(&object.id);
        let size = fs::copy(source, &blob).await?;

        object.size = size;
        object.download_url = Some(format!("file://{}", blob.display()));

        let _guard = self.write_lock.lock().await;
        self.save(&StoredObject {
            object: object.clone(),
            trashed: false,
        })
        .await?;

        debug!("Uploaded {} ({} bytes) as {}", object.title, size, object.id);
        Ok(object)
    }

    async fn download_range(&self, id: &str, start: u64, end: u64) -> RemoteResult<Vec<u8>> {
        let stored = self.load(id).await?;
        if stored.object.kind != ObjectKind::File {
            return Err(RemoteError::NotFound(format!("{} has no content", id)));
        }

        let mut file = fs::File::open(self.blob_path(id)).await?;
        file.seek(SeekFrom::Start(start)).await?;

        let mut data = Vec::new();
        file.take(end.saturating_sub(start) + 1)
            .read_to_end(&mut data)
            .await?;
        Ok(data)
    }

    async fn list_children(&self, folder_id: &str) -> RemoteResult<Vec<RemoteObject>> {
        self.require_folder(folder_id).await?;

        let mut children = Vec::new();
        let mut entries = fs::read_dir(self.root.join("objects")).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = fs::read(&path).await?;
            let stored: StoredObject = serde_json::from_slice(&bytes).map_err(invalid_data)?;
            if !stored.trashed && stored.object.parent_ids.iter().any(|p| p == folder_id) {
                children.push(stored.object);
            }
        }

        children.sort_by(|a, b| a.title.cmp(&b.title));
        Ok(children)
    }
}
