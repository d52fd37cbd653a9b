//! Namespace operations through the dispatcher against an in-memory remote.

mod common;

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::{eventually, Harness, MockRemote};
use stratofs::storage::ROOT_INODE;
use stratofs::Error;

#[tokio::test]
async fn create_then_unlink_restores_child_list() {
    let h = Harness::new().await;
    let fs = &h.services.dispatcher;

    let before: Vec<String> = fs
        .readdir(ROOT_INODE, 0)
        .await
        .unwrap()
        .entries
        .into_iter()
        .map(|e| e.name)
        .collect();

    let (node, opened) = fs.create(ROOT_INODE, "scratch.txt", 0o644).await.unwrap();
    fs.release(node.inode, opened.fh).await.unwrap();
    fs.unlink(ROOT_INODE, "scratch.txt").await.unwrap();

    let after: Vec<String> = fs
        .readdir(ROOT_INODE, 0)
        .await
        .unwrap()
        .entries
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(before, after);
    assert!(matches!(
        fs.lookup(ROOT_INODE, "scratch.txt").await.unwrap_err(),
        Error::NotFound(_)
    ));
    assert!(matches!(fs.getattr(node.inode).await.unwrap_err(), Error::NotFound(_)));
}

#[tokio::test]
async fn inode_numbers_are_never_reused() {
    let h = Harness::new().await;
    let fs = &h.services.dispatcher;

    let mut seen = HashSet::from([ROOT_INODE]);
    for round in 0..3 {
        let name = format!("f{}", round);
        let node = fs.mknod(ROOT_INODE, &name, 0).await.unwrap();
        assert!(seen.insert(node.inode), "inode {} reused", node.inode);
        fs.unlink(ROOT_INODE, &name).await.unwrap();

        let folder = fs.mkdir(ROOT_INODE, &format!("d{}", round), 0).await.unwrap();
        assert!(seen.insert(folder.inode), "inode {} reused", folder.inode);
    }
}

#[tokio::test]
async fn small_file_is_uploaded_and_readable() {
    let h = Harness::new().await;
    let fs = &h.services.dispatcher;

    let inode = h.write_file(ROOT_INODE, "a.txt", b"hello").await;
    h.settle().await;

    let node = fs.lookup(ROOT_INODE, "a.txt").await.unwrap();
    assert_eq!(node.inode, inode);
    assert_eq!(node.size, 5);
    assert!(node.download_url().is_some());

    let remote_id = node.remote_id.clone().unwrap();
    assert_eq!(h.remote.content(&remote_id).unwrap(), b"hello");

    fs.open(inode, libc::O_RDONLY).await.unwrap();
    assert_eq!(fs.read(inode, 0, 4096).await.unwrap(), b"hello");
    assert_eq!(fs.read(inode, 1, 3).await.unwrap(), b"ell");
}

#[tokio::test]
async fn mkdir_duplicate_name_makes_no_remote_call() {
    let h = Harness::new().await;
    let fs = &h.services.dispatcher;

    fs.mkdir(ROOT_INODE, "docs", 0o755).await.unwrap();
    assert_eq!(h.remote.inserts.load(Ordering::SeqCst), 1);

    let err = fs.mkdir(ROOT_INODE, "docs", 0o755).await.unwrap_err();
    assert!(matches!(err, Error::AlreadyExists(_)));
    assert_eq!(err.to_errno(), libc::EEXIST);
    assert_eq!(h.remote.inserts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn mkdir_failure_leaves_namespace_untouched() {
    let h = Harness::new().await;
    let fs = &h.services.dispatcher;

    let docs = fs.mkdir(ROOT_INODE, "docs", 0).await.unwrap();
    h.remote.remove(docs.remote_id.as_deref().unwrap());

    // Parent no longer exists remotely
    let err = fs.mkdir(docs.inode, "inner", 0).await.unwrap_err();
    assert!(err.is_remote());
    assert_eq!(err.to_errno(), libc::EIO);
    assert!(fs.lookup(docs.inode, "inner").await.is_err());
}

#[tokio::test]
async fn rmdir_non_empty_folder_is_refused_without_trash() {
    let h = Harness::new().await;
    let fs = &h.services.dispatcher;

    let docs = fs.mkdir(ROOT_INODE, "docs", 0).await.unwrap();
    fs.mknod(docs.inode, "notes.txt", 0).await.unwrap();

    let err = fs.rmdir(ROOT_INODE, "docs").await.unwrap_err();
    assert!(matches!(err, Error::DirectoryNotEmpty(_)));
    assert_eq!(err.to_errno(), libc::ENOTEMPTY);
    assert_eq!(h.remote.trashes.load(Ordering::SeqCst), 0);

    fs.unlink(docs.inode, "notes.txt").await.unwrap();
    fs.rmdir(ROOT_INODE, "docs").await.unwrap();
    assert_eq!(h.remote.trashes.load(Ordering::SeqCst), 1);
    assert!(h.remote.is_trashed(docs.remote_id.as_deref().unwrap()));
    assert!(fs.lookup(ROOT_INODE, "docs").await.is_err());
}

#[tokio::test]
async fn rmdir_and_unlink_check_node_kinds() {
    let h = Harness::new().await;
    let fs = &h.services.dispatcher;

    fs.mknod(ROOT_INODE, "file", 0).await.unwrap();
    fs.mkdir(ROOT_INODE, "dir", 0).await.unwrap();

    assert!(matches!(
        fs.rmdir(ROOT_INODE, "file").await.unwrap_err(),
        Error::NotADirectory(_)
    ));
    assert!(matches!(
        fs.unlink(ROOT_INODE, "dir").await.unwrap_err(),
        Error::IsADirectory(_)
    ));
    assert!(matches!(
        fs.unlink(ROOT_INODE, "missing").await.unwrap_err(),
        Error::NotFound(_)
    ));
}

#[tokio::test]
async fn unlink_trashes_confirmed_file_in_background() {
    let h = Harness::new().await;
    let fs = &h.services.dispatcher;

    h.write_file(ROOT_INODE, "gone.txt", b"bye").await;
    h.settle().await;
    let remote_id = fs
        .lookup(ROOT_INODE, "gone.txt")
        .await
        .unwrap()
        .remote_id
        .unwrap();

    fs.unlink(ROOT_INODE, "gone.txt").await.unwrap();
    assert!(fs.lookup(ROOT_INODE, "gone.txt").await.is_err());

    let remote = h.remote.clone();
    let id = remote_id.clone();
    assert!(eventually(move || remote.is_trashed(&id)).await);

    let chunks = h.services.chunks.clone();
    let mut evicted = false;
    for _ in 0..200 {
        if chunks.ledger().total_size(&remote_id).await.unwrap() == 0 {
            evicted = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(evicted);
}

#[tokio::test]
async fn unlink_of_pending_file_calls_no_remote() {
    let h = Harness::new().await;
    let fs = &h.services.dispatcher;

    fs.mknod(ROOT_INODE, "draft", 0).await.unwrap();
    fs.unlink(ROOT_INODE, "draft").await.unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(h.remote.trashes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn rename_failure_keeps_old_name() {
    let h = Harness::new().await;
    let fs = &h.services.dispatcher;

    h.write_file(ROOT_INODE, "old.txt", b"data").await;
    h.settle().await;

    h.remote.fail_patches(true);
    let err = fs.rename(ROOT_INODE, "old.txt", ROOT_INODE, "new.txt").await.unwrap_err();
    assert!(err.is_remote());
    assert_eq!(err.to_errno(), libc::EIO);

    assert!(fs.lookup(ROOT_INODE, "old.txt").await.is_ok());
    assert!(matches!(
        fs.lookup(ROOT_INODE, "new.txt").await.unwrap_err(),
        Error::NotFound(_)
    ));
}

#[tokio::test]
async fn rename_moves_between_folders() {
    let h = Harness::new().await;
    let fs = &h.services.dispatcher;

    let src = fs.mkdir(ROOT_INODE, "src", 0).await.unwrap();
    let dst = fs.mkdir(ROOT_INODE, "dst", 0).await.unwrap();
    let inode = h.write_file(src.inode, "report.txt", b"quarterly").await;
    h.settle().await;

    fs.rename(src.inode, "report.txt", dst.inode, "final.txt")
        .await
        .unwrap();

    assert!(fs.lookup(src.inode, "report.txt").await.is_err());
    let moved = fs.lookup(dst.inode, "final.txt").await.unwrap();
    assert_eq!(moved.inode, inode);
    assert_eq!(moved.parent_remote_id, dst.remote_id);

    let object = h.remote.object(moved.remote_id.as_deref().unwrap()).unwrap();
    assert_eq!(object.title, "final.txt");
    assert_eq!(object.parent_ids, vec![dst.remote_id.clone().unwrap()]);

    let listing = fs.readdir(dst.inode, 0).await.unwrap();
    assert_eq!(listing.entries[1].inode, ROOT_INODE);
    assert!(listing.entries.iter().any(|e| e.name == "final.txt"));
}

#[tokio::test]
async fn rename_over_existing_file_replaces_it() {
    let h = Harness::new().await;
    let fs = &h.services.dispatcher;

    h.write_file(ROOT_INODE, "a", b"new content").await;
    h.write_file(ROOT_INODE, "b", b"old").await;
    h.settle().await;
    let replaced = fs.lookup(ROOT_INODE, "b").await.unwrap();

    fs.rename(ROOT_INODE, "a", ROOT_INODE, "b").await.unwrap();

    let node = fs.lookup(ROOT_INODE, "b").await.unwrap();
    assert_eq!(node.size, 11);
    assert_ne!(node.inode, replaced.inode);
    assert!(fs.lookup(ROOT_INODE, "a").await.is_err());

    let remote = h.remote.clone();
    let id = replaced.remote_id.unwrap();
    assert!(eventually(move || remote.is_trashed(&id)).await);
}

#[tokio::test]
async fn rename_of_pending_file_is_local() {
    let h = Harness::new().await;
    let fs = &h.services.dispatcher;

    fs.mknod(ROOT_INODE, "draft", 0).await.unwrap();
    fs.rename(ROOT_INODE, "draft", ROOT_INODE, "final").await.unwrap();

    assert!(fs.lookup(ROOT_INODE, "final").await.is_ok());
    assert_eq!(h.remote.patches.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn rename_onto_folder_is_refused() {
    let h = Harness::new().await;
    let fs = &h.services.dispatcher;

    fs.mknod(ROOT_INODE, "file", 0).await.unwrap();
    fs.mkdir(ROOT_INODE, "dir", 0).await.unwrap();

    assert!(matches!(
        fs.rename(ROOT_INODE, "file", ROOT_INODE, "dir").await.unwrap_err(),
        Error::IsADirectory(_)
    ));
    assert!(matches!(
        fs.rename(ROOT_INODE, "dir", ROOT_INODE, "file").await.unwrap_err(),
        Error::NotADirectory(_)
    ));
}

#[tokio::test]
async fn read_of_pending_file_is_not_ready() {
    let h = Harness::new().await;
    let fs = &h.services.dispatcher;

    let (node, opened) = fs.create(ROOT_INODE, "busy", 0).await.unwrap();
    fs.write(node.inode, opened.fh, 0, b"partial").await.unwrap();

    let err = fs.read(node.inode, 0, 10).await.unwrap_err();
    assert!(matches!(err, Error::PermissionDenied(_)));
    assert_eq!(err.to_errno(), libc::EACCES);
}

#[tokio::test]
async fn namespace_survives_restart() {
    let h = Harness::new().await;
    let fs = &h.services.dispatcher;

    let docs = fs.mkdir(ROOT_INODE, "docs", 0).await.unwrap();
    h.write_file(docs.inode, "a.txt", b"persisted").await;
    h.settle().await;

    let services = h.reopen(MockRemote::new());
    let docs_again = services.dispatcher.lookup(ROOT_INODE, "docs").await.unwrap();
    assert_eq!(docs_again.inode, docs.inode);

    let file = services.dispatcher.lookup(docs.inode, "a.txt").await.unwrap();
    assert_eq!(file.size, 9);
    assert!(file.download_url().is_some());

    // New inodes continue above the persisted ones
    let fresh = services.dispatcher.mknod(ROOT_INODE, "fresh", 0).await.unwrap();
    assert!(fresh.inode > file.inode);
}

#[tokio::test]
async fn size_written_before_release_survives_restart() {
    let h = Harness::new().await;
    h.remote.close_gate();

    let inode = h.write_file(ROOT_INODE, "unsent.bin", b"0123456789").await;

    let services = h.reopen(MockRemote::new());
    let node = services.dispatcher.getattr(inode).await.unwrap();
    assert_eq!(node.size, 10);
    assert!(node.download_url().is_none());
}

#[tokio::test]
async fn readers_proceed_during_slow_mkdir() {
    let h = Harness::new().await;
    h.remote.set_call_delay(Duration::from_millis(500));

    let dispatcher = Arc::clone(&h.services.dispatcher);
    let mkdir = tokio::spawn(async move { dispatcher.mkdir(ROOT_INODE, "slow", 0).await });
    let remote = h.remote.clone();
    assert!(eventually(move || remote.inserts.load(Ordering::SeqCst) == 1).await);

    let fs = &h.services.dispatcher;
    let quick = Duration::from_millis(200);
    tokio::time::timeout(quick, fs.getattr(ROOT_INODE))
        .await
        .expect("getattr waited on mkdir")
        .unwrap();
    tokio::time::timeout(quick, fs.readdir(ROOT_INODE, 0))
        .await
        .expect("readdir waited on mkdir")
        .unwrap();
    tokio::time::timeout(quick, h.write_file(ROOT_INODE, "meanwhile.txt", b"x"))
        .await
        .expect("create waited on mkdir");

    // The name is held until the remote answers
    assert!(matches!(
        fs.create(ROOT_INODE, "slow", 0).await.unwrap_err(),
        Error::Busy(_)
    ));

    let folder = mkdir.await.unwrap().unwrap();
    assert_eq!(fs.lookup(ROOT_INODE, "slow").await.unwrap().inode, folder.inode);
    assert_eq!(h.remote.inserts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn readers_proceed_during_slow_rename() {
    let h = Harness::new().await;
    let fs = &h.services.dispatcher;
    let inode = h.write_file(ROOT_INODE, "before.txt", b"data").await;
    h.settle().await;

    h.remote.set_call_delay(Duration::from_millis(500));
    let dispatcher = Arc::clone(&h.services.dispatcher);
    let rename = tokio::spawn(async move {
        dispatcher
            .rename(ROOT_INODE, "before.txt", ROOT_INODE, "after.txt")
            .await
    });
    let remote = h.remote.clone();
    assert!(eventually(move || remote.patches.load(Ordering::SeqCst) == 1).await);

    // Old name stays visible until the remote confirms
    let node = tokio::time::timeout(Duration::from_millis(200), fs.lookup(ROOT_INODE, "before.txt"))
        .await
        .expect("lookup waited on rename")
        .unwrap();
    assert_eq!(node.inode, inode);

    rename.await.unwrap().unwrap();
    assert!(fs.lookup(ROOT_INODE, "before.txt").await.is_err());
    assert_eq!(fs.lookup(ROOT_INODE, "after.txt").await.unwrap().inode, inode);
}

#[tokio::test]
async fn rmdir_closes_folder_to_new_entries() {
    let h = Harness::new().await;
    let fs = &h.services.dispatcher;
    let folder = fs.mkdir(ROOT_INODE, "going", 0).await.unwrap();

    h.remote.set_call_delay(Duration::from_millis(300));
    let dispatcher = Arc::clone(&h.services.dispatcher);
    let rmdir = tokio::spawn(async move { dispatcher.rmdir(ROOT_INODE, "going").await });
    let remote = h.remote.clone();
    assert!(eventually(move || remote.trashes.load(Ordering::SeqCst) == 1).await);

    assert!(matches!(
        fs.create(folder.inode, "late.txt", 0).await.unwrap_err(),
        Error::Busy(_)
    ));

    rmdir.await.unwrap().unwrap();
    assert!(fs.getattr(folder.inode).await.is_err());
}
