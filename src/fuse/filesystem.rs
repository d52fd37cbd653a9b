//! StratoFS FUSE Filesystem Implementation
//!
//! Implements the fuser::Filesystem trait on top of the [`Dispatcher`].
//! Each kernel request is spawned on the tokio runtime and replied to
//! from inside that task, exactly once.

use std::ffi::OsStr;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use tokio::runtime::Handle;
use tracing::{debug, warn};

use super::dispatcher::{Dispatcher, SetAttr};
use crate::error::Error;
use crate::storage::Node;

/// TTL for attribute caching
const TTL: Duration = Duration::from_secs(1);

/// Size reported for folders
const FOLDER_SIZE: u64 = 4096;

/// StratoFS FUSE Filesystem
pub struct StratoFs {
    dispatcher: Arc<Dispatcher>,
    runtime: Handle,
    uid: u32,
    gid: u32,
}

impl StratoFs {
    pub fn new(dispatcher: Arc<Dispatcher>, runtime: Handle) -> Self {
        Self {
            dispatcher,
            runtime,
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
        }
    }

    fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.runtime.spawn(task);
    }

    fn owner(&self) -> (u32, u32) {
        (self.uid, self.gid)
    }
}

/// Convert a Node to FileAttr
pub fn node_attr(node: &Node, uid: u32, gid: u32) -> FileAttr {
    let (kind, size, nlink) = if node.is_folder() {
        (FileType::Directory, FOLDER_SIZE, 2)
    } else {
        (FileType::RegularFile, node.size, 1)
    };
    let mtime = SystemTime::from(node.mtime);

    FileAttr {
        ino: node.inode,
        size,
        blocks: (size + 511) / 512,
        atime: mtime,
        mtime,
        ctime: mtime,
        crtime: SystemTime::from(node.ctime),
        kind,
        perm: (node.mode & 0o7777) as u16,
        nlink,
        uid,
        gid,
        rdev: 0,
        blksize: 4096,
        flags: 0,
    }
}

fn to_datetime(time: TimeOrNow) -> DateTime<Utc> {
    match time {
        TimeOrNow::SpecificTime(t) => DateTime::<Utc>::from(t),
        TimeOrNow::Now => Utc::now(),
    }
}

/// Log a failed operation and map it to an errno
fn errno(op: &str, e: &Error) -> libc::c_int {
    if e.is_remote() {
        warn!("{} failed: {}", op, e);
    } else {
        debug!("{} failed: {}", op, e);
    }
    e.to_errno()
}

fn name_string(name: &OsStr) -> Option<String> {
    name.to_str().map(str::to_string)
}

impl Filesystem for StratoFs {
    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(name) = name_string(name) else {
            reply.error(libc::EINVAL);
            return;
        };
        debug!("lookup: parent={}, name={}", parent, name);

        let fs = Arc::clone(&self.dispatcher);
        let (uid, gid) = self.owner();
        self.spawn(async move {
            match fs.lookup(parent, &name).await {
                Ok(node) => reply.entry(&TTL, &node_attr(&node, uid, gid), 0),
                Err(e) => reply.error(errno("lookup", &e)),
            }
        });
    }

    fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
        debug!("getattr: ino={}", ino);

        let fs = Arc::clone(&self.dispatcher);
        let (uid, gid) = self.owner();
        self.spawn(async move {
            match fs.getattr(ino).await {
                Ok(node) => reply.attr(&TTL, &node_attr(&node, uid, gid)),
                Err(e) => reply.error(errno("getattr", &e)),
            }
        });
    }

    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        debug!("setattr: ino={}, size={:?}, mode={:?}", ino, size, mode);

        let attrs = SetAttr {
            size,
            mtime: mtime.map(to_datetime),
            mode,
        };
        let fs = Arc::clone(&self.dispatcher);
        let (uid, gid) = self.owner();
        self.spawn(async move {
            match fs.setattr(ino, attrs).await {
                Ok(node) => reply.attr(&TTL, &node_attr(&node, uid, gid)),
                Err(e) => reply.error(errno("setattr", &e)),
            }
        });
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        debug!("readdir: ino={}, offset={}", ino, offset);

        let fs = Arc::clone(&self.dispatcher);
        self.spawn(async move {
            let listing = match fs.readdir(ino, 0).await {
                Ok(listing) => listing,
                Err(e) => {
                    reply.error(errno("readdir", &e));
                    return;
                }
            };
            debug!(
                "readdir: {} entries, {} byte buffer",
                listing.entries.len(),
                listing.buffer_size
            );

            for (i, entry) in listing.entries.iter().enumerate().skip(offset.max(0) as usize) {
                let kind = if entry.is_folder {
                    FileType::Directory
                } else {
                    FileType::RegularFile
                };
                if reply.add(entry.inode, (i + 1) as i64, kind, &entry.name) {
                    break;
                }
            }
            reply.ok();
        });
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        debug!("open: ino={}, flags={:#o}", ino, flags);

        let fs = Arc::clone(&self.dispatcher);
        self.spawn(async move {
            match fs.open(ino, flags).await {
                Ok(opened) => reply.opened(opened.fh, 0),
                Err(e) => reply.error(errno("open", &e)),
            }
        });
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        debug!("read: ino={}, offset={}, size={}", ino, offset, size);

        let fs = Arc::clone(&self.dispatcher);
        self.spawn(async move {
            match fs.read(ino, offset, size).await {
                Ok(data) => reply.data(&data),
                Err(e) => reply.error(errno("read", &e)),
            }
        });
    }

    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        debug!("write: ino={}, offset={}, size={}", ino, offset, data.len());

        let fs = Arc::clone(&self.dispatcher);
        let data = data.to_vec();
        self.spawn(async move {
            match fs.write(ino, fh, offset, &data).await {
                Ok(written) => reply.written(written),
                Err(e) => reply.error(errno("write", &e)),
            }
        });
    }

    fn flush(&mut self, _req: &Request, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        debug!("flush: ino={}, fh={}", ino, fh);
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        debug!("release: ino={}, fh={}", ino, fh);

        let fs = Arc::clone(&self.dispatcher);
        self.spawn(async move {
            match fs.release(ino, fh).await {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(errno("release", &e)),
            }
        });
    }

    fn create(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(name) = name_string(name) else {
            reply.error(libc::EINVAL);
            return;
        };
        debug!("create: parent={}, name={}, mode={:o}", parent, name, mode);

        let fs = Arc::clone(&self.dispatcher);
        let (uid, gid) = self.owner();
        self.spawn(async move {
            match fs.create(parent, &name, mode & !umask).await {
                Ok((node, opened)) => {
                    reply.created(&TTL, &node_attr(&node, uid, gid), 0, opened.fh, 0)
                }
                Err(e) => reply.error(errno("create", &e)),
            }
        });
    }

    fn mknod(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        let Some(name) = name_string(name) else {
            reply.error(libc::EINVAL);
            return;
        };
        debug!("mknod: parent={}, name={}, mode={:o}", parent, name, mode);

        if mode & libc::S_IFMT != 0 && mode & libc::S_IFMT != libc::S_IFREG {
            reply.error(libc::EPERM);
            return;
        }

        let fs = Arc::clone(&self.dispatcher);
        let (uid, gid) = self.owner();
        self.spawn(async move {
            match fs.mknod(parent, &name, mode & !umask).await {
                Ok(node) => reply.entry(&TTL, &node_attr(&node, uid, gid), 0),
                Err(e) => reply.error(errno("mknod", &e)),
            }
        });
    }

    fn mkdir(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(name) = name_string(name) else {
            reply.error(libc::EINVAL);
            return;
        };
        debug!("mkdir: parent={}, name={}, mode={:o}", parent, name, mode);

        let fs = Arc::clone(&self.dispatcher);
        let (uid, gid) = self.owner();
        self.spawn(async move {
            match fs.mkdir(parent, &name, mode & !umask).await {
                Ok(node) => reply.entry(&TTL, &node_attr(&node, uid, gid), 0),
                Err(e) => reply.error(errno("mkdir", &e)),
            }
        });
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(name) = name_string(name) else {
            reply.error(libc::EINVAL);
            return;
        };
        debug!("unlink: parent={}, name={}", parent, name);

        let fs = Arc::clone(&self.dispatcher);
        self.spawn(async move {
            match fs.unlink(parent, &name).await {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(errno("unlink", &e)),
            }
        });
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(name) = name_string(name) else {
            reply.error(libc::EINVAL);
            return;
        };
        debug!("rmdir: parent={}, name={}", parent, name);

        let fs = Arc::clone(&self.dispatcher);
        self.spawn(async move {
            match fs.rmdir(parent, &name).await {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(errno("rmdir", &e)),
            }
        });
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(name), Some(newname)) = (name_string(name), name_string(newname)) else {
            reply.error(libc::EINVAL);
            return;
        };
        debug!(
            "rename: parent={}, name={}, newparent={}, newname={}",
            parent, name, newparent, newname
        );

        let fs = Arc::clone(&self.dispatcher);
        self.spawn(async move {
            match fs.rename(parent, &name, newparent, &newname).await {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(errno("rename", &e)),
            }
        });
    }

    fn statfs(&mut self, _req: &Request, _ino: u64, reply: ReplyStatfs) {
        let s = self.dispatcher.statfs();
        reply.statfs(s.blocks, s.bfree, s.bavail, s.files, s.ffree, s.bsize, s.namelen, s.frsize);
    }

    fn access(&mut self, _req: &Request, _ino: u64, _mask: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    fn opendir(&mut self, _req: &Request, _ino: u64, _flags: i32, reply: ReplyOpen) {
        reply.opened(0, 0);
    }

    fn releasedir(&mut self, _req: &Request, _ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    fn getxattr(&mut self, _req: &Request, _ino: u64, _name: &OsStr, _size: u32, reply: ReplyXattr) {
        reply.error(libc::ENODATA);
    }

    fn listxattr(&mut self, _req: &Request, _ino: u64, size: u32, reply: ReplyXattr) {
        if size == 0 {
            reply.size(0);
        } else {
            reply.data(&[]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::node::DEFAULT_FILE_MODE;

    #[test]
    fn test_file_attr() {
        let mut node = Node::new_file(9, Some("p".into()), "a.bin", DEFAULT_FILE_MODE);
        node.size = 1025;

        let attr = node_attr(&node, 1000, 1000);
        assert_eq!(attr.ino, 9);
        assert_eq!(attr.kind, FileType::RegularFile);
        assert_eq!(attr.blocks, 3);
        assert_eq!(attr.perm, 0o644);
        assert_eq!(attr.nlink, 1);
        assert_eq!(attr.atime, attr.mtime);
    }

    #[test]
    fn test_folder_attr() {
        let root = Node::root("r");
        let attr = node_attr(&root, 0, 0);
        assert_eq!(attr.kind, FileType::Directory);
        assert_eq!(attr.size, FOLDER_SIZE);
        assert_eq!(attr.nlink, 2);
        assert_eq!(attr.perm, 0o755);
    }
}
