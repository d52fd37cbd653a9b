//! StratoFS - Remote Object Storage as a Local Filesystem
//!
//! Mounts a remote object-storage account as a POSIX filesystem. The
//! namespace lives in a local inode table that is persisted on every
//! structural change; file content is staged locally on write, uploaded
//! in the background by a bounded worker pool, and served back from a
//! chunked local cache.
//!
//! # Architecture
//!
//! - [`storage`]: inode table, upload ledger, chunk ledger and chunk cache
//! - [`upload`]: the upload pipeline, with retry and restart recovery
//! - [`refresh`]: merges remote folder listings into the namespace
//! - [`fuse`]: POSIX operation dispatcher and the kernel adapter
//! - [`remote`]: the object-store capability and a directory-backed store

pub mod config;
pub mod error;
pub mod fuse;
pub mod refresh;
pub mod remote;
pub mod service;
pub mod storage;
pub mod upload;

pub use config::Config;
pub use error::{Error, Result};
pub use service::Services;
