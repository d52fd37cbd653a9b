//! Component wiring
//!
//! Opens the on-disk state under the cache directory and connects the
//! namespace, chunk cache, upload pipeline, refresher and dispatcher.

use std::sync::Arc;

use tracing::info;

use crate::config::Config;
use crate::error::Result;
use crate::fuse::Dispatcher;
use crate::refresh::Refresher;
use crate::remote::RemoteStore;
use crate::storage::{ChunkCache, ChunkLedger, Namespace, SharedNamespace};
use crate::upload::{PipelineSettings, UploadPipeline};

/// Everything a mounted filesystem runs on
pub struct Services {
    pub namespace: SharedNamespace,
    pub chunks: Arc<ChunkCache>,
    pub pipeline: UploadPipeline,
    pub refresher: Arc<Refresher>,
    pub dispatcher: Arc<Dispatcher>,
}

impl Services {
    /// Open state and start the upload pipeline. Must run inside a tokio runtime.
    pub fn open(config: &Config, remote: Arc<dyn RemoteStore>) -> Result<Self> {
        config.ensure_dirs()?;
        let state_dir = config.state_dir();

        let namespace = Namespace::open(&state_dir, remote.root_id())?;
        info!(
            "Opened namespace: {} inodes, {} pending uploads",
            namespace.inodes.len(),
            namespace.uploads.len()
        );
        let namespace = namespace.into_shared();

        let ledger = ChunkLedger::open(&state_dir)?;
        let chunks = Arc::new(ChunkCache::new(config.download_dir(), config.chunks.size, ledger)?);

        let pipeline = UploadPipeline::start(
            Arc::clone(&namespace),
            Arc::clone(&remote),
            Arc::clone(&chunks),
            PipelineSettings::from_config(config),
        );

        let refresher = Arc::new(Refresher::new(
            Arc::clone(&namespace),
            Arc::clone(&remote),
            Arc::clone(&chunks),
        ));

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&namespace),
            remote,
            Arc::clone(&chunks),
            pipeline.clone(),
        ));

        Ok(Self {
            namespace,
            chunks,
            pipeline,
            refresher,
            dispatcher,
        })
    }
}
