//! Storage module for the namespace, ledgers and chunk cache

pub mod chunks;
pub mod inode;
pub mod ledger;
pub mod namespace;
pub mod node;
pub mod snapshot;
pub mod uploads;

pub use chunks::ChunkCache;
pub use inode::InodeTable;
pub use ledger::{ChunkEntry, ChunkLedger, LedgerTotals};
pub use namespace::{Namespace, SharedNamespace};
pub use node::{Node, NodeKind, ROOT_INODE};
pub use uploads::{cache_name, UploadLedger, UploadRecord};
