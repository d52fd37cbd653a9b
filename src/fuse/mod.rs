//! FUSE filesystem layer

pub mod claims;
pub mod dispatcher;
pub mod filesystem;
pub mod handles;

pub use dispatcher::{Dispatcher, SetAttr};
pub use filesystem::StratoFs;
pub use handles::HandleTable;
