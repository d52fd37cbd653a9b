//! StratoFS CLI
//!
//! Command-line interface for mounting and inspecting StratoFS.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stratofs::error::{Error, Result};
use stratofs::fuse::StratoFs;
use stratofs::remote::{local::ROOT_ID, LocalStore, RemoteStore};
use stratofs::storage::{ChunkLedger, Namespace};
use stratofs::{Config, Services};

/// StratoFS - remote object storage as a local filesystem
#[derive(Parser)]
#[command(name = "stratofs")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/stratofs/config.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mount the filesystem and run until interrupted
    Mount {
        /// Mount point path (defaults to mount.path from the config)
        #[arg(short, long)]
        mountpoint: Option<PathBuf>,
    },

    /// Unmount the filesystem
    Unmount {
        /// Mount point path (defaults to mount.path from the config)
        #[arg(short, long)]
        mountpoint: Option<PathBuf>,
    },

    /// Show namespace, upload and cache status
    Status,

    /// Write a default configuration file and create the cache layout
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "stratofs.toml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.debug { "debug" } else { cli.log_level.as_str() };
    init_logging(level);

    match cli.command {
        Commands::Init { output } => run_init(output),
        command => {
            let config = load_config(&cli.config)?;
            match command {
                Commands::Mount { mountpoint } => run_mount(config, mountpoint).await,
                Commands::Unmount { mountpoint } => run_unmount(config, mountpoint),
                Commands::Status => run_status(config).await,
                Commands::Init { .. } => Ok(()),
            }
        }
    }
}

fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Load the config file if it exists, defaults otherwise
fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        Config::load(path).map_err(|e| {
            tracing::error!("Failed to load configuration from {:?}: {}", path, e);
            e
        })
    } else {
        tracing::info!("No config file at {:?}, using defaults", path);
        Ok(Config::default())
    }
}

/// Mount and serve until Ctrl-C
async fn run_mount(config: Config, mountpoint: Option<PathBuf>) -> Result<()> {
    let mountpoint = mountpoint.unwrap_or_else(|| config.mount.path.clone());
    std::fs::create_dir_all(&mountpoint)?;

    tracing::info!("Opening remote store at {:?}", config.remote.root);
    let remote: Arc<dyn RemoteStore> = Arc::new(LocalStore::open(&config.remote.root).await?);

    let services = Services::open(&config, remote)?;
    if let Err(e) = services.refresher.populate().await {
        tracing::warn!("Initial listing failed, starting with the saved namespace: {}", e);
    }

    let fs = StratoFs::new(
        Arc::clone(&services.dispatcher),
        tokio::runtime::Handle::current(),
    );

    let mut options = vec![
        fuser::MountOption::FSName("stratofs".to_string()),
        fuser::MountOption::AutoUnmount,
    ];
    if config.mount.allow_other {
        options.push(fuser::MountOption::AllowOther);
    }

    let session = fuser::spawn_mount2(fs, &mountpoint, &options).map_err(|e| {
        tracing::error!("Mount failed: {}", e);
        Error::Io(e)
    })?;
    tracing::info!("Mounted StratoFS at {:?}", mountpoint);

    // Pending uploads resume once the mount is up
    let pipeline = services.pipeline.clone();
    let resume_delay = config.resume_delay();
    tokio::spawn(async move {
        tokio::time::sleep(resume_delay).await;
        if let Err(e) = pipeline.resume().await {
            tracing::error!("Failed to resume pending uploads: {}", e);
        }
    });

    let refresh = config
        .refresh_interval()
        .map(|period| Arc::clone(&services.refresher).spawn(period));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal");

    if let Some(handle) = refresh {
        handle.abort();
    }

    let pending = services.pipeline.pending();
    if pending > 0 {
        tracing::warn!("{} uploads still pending, they resume on next mount", pending);
    }

    drop(session);
    tracing::info!("Unmounted {:?}", mountpoint);
    Ok(())
}

/// Unmount via fusermount
fn run_unmount(config: Config, mountpoint: Option<PathBuf>) -> Result<()> {
    let mountpoint = mountpoint.unwrap_or(config.mount.path);
    tracing::info!("Unmounting StratoFS at {:?}", mountpoint);

    let status = std::process::Command::new("fusermount")
        .arg("-u")
        .arg(&mountpoint)
        .status()?;

    if status.success() {
        tracing::info!("Unmounted successfully");
        Ok(())
    } else {
        tracing::error!("Unmount failed with status: {}", status);
        Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("fusermount exited with {}", status),
        )))
    }
}

/// Print configuration and on-disk state
async fn run_status(config: Config) -> Result<()> {
    let state_dir = config.state_dir();
    let namespace = Namespace::open(&state_dir, ROOT_ID)?;
    let totals = ChunkLedger::open(&state_dir)?.totals().await?;

    println!("StratoFS Status");
    println!("===============");
    println!();
    println!("Cache Location:   {}", config.cache.location.display());
    println!("Mount Point:      {}", config.mount.path.display());
    println!("Remote Root:      {}", config.remote.root.display());
    println!("Chunk Size:       {} bytes", config.chunks.size);
    println!();
    println!("Namespace:");
    println!("  Inodes:         {}", namespace.inodes.len());
    println!("  Folders:        {}", namespace.inodes.folders().len());
    println!("  Pending:        {}", namespace.uploads.len());
    println!();
    println!("Chunk Cache:");
    println!("  Chunks:         {}", totals.chunks);
    println!("  Bytes:          {}", totals.bytes);
    println!();
    println!("Uploads:");
    println!("  Concurrency:    {}", config.upload.max_concurrent);
    println!("  Timeout:        {} s", config.upload.timeout_secs);

    Ok(())
}

/// Write a default configuration
fn run_init(output: PathBuf) -> Result<()> {
    let config = Config::default();
    config.save(&output)?;
    config.ensure_dirs()?;

    println!("✓ Configuration written to {}", output.display());
    println!("  Cache directory: {}", config.cache.location.display());
    println!("  Mount point:     {}", config.mount.path.display());
    Ok(())
}
