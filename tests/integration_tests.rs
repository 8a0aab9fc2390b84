//! Real-mount integration tests: these drive [`nodefuse::Session`] against an actual
//! `/dev/fuse` connection rather than dispatching requests in-process, so they exercise the
//! kernel's own view of the node tree (entry caching, concurrent readers during a rename)
//! that in-process unit tests can't reach.

#![cfg(target_os = "linux")]

use std::ffi::{OsStr, OsString};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::SystemTime;

use nodefuse::{
    Call, Error, FileAttr, FileType, FilesystemRoot, Lookup, Mutable, MountConfig, MountOption,
    NewChild, Node, Open, RenameFlags, Result, Session, SessionACL, SetAttrRequest, Statfs,
};
use tempfile::TempDir;

/// A directory that only ever holds plain, empty files, just enough to drive `LOOKUP`,
/// `MKNOD`, `RENAME` and `READDIR` through a real mount.
struct MemDir {
    children: Mutex<Vec<(OsString, FileAttr)>>,
}

struct MemFile;

static NEXT_INO: AtomicU64 = AtomicU64::new(2);

fn dir_attr(ino: u64) -> FileAttr {
    FileAttr {
        ino,
        size: 0,
        blocks: 0,
        atime: SystemTime::UNIX_EPOCH,
        mtime: SystemTime::UNIX_EPOCH,
        ctime: SystemTime::UNIX_EPOCH,
        crtime: SystemTime::UNIX_EPOCH,
        kind: FileType::Directory,
        perm: 0o755,
        nlink: 2,
        uid: 0,
        gid: 0,
        rdev: 0,
        blksize: 512,
        flags: 0,
    }
}

fn file_attr(ino: u64) -> FileAttr {
    FileAttr { kind: FileType::RegularFile, size: 0, perm: 0o644, nlink: 1, ..dir_attr(ino) }
}

impl Node for MemDir {
    fn getattr(&self, _ctx: &Call) -> Result<FileAttr> {
        Ok(dir_attr(1))
    }
    fn as_lookup(&self) -> Option<&dyn Lookup> {
        Some(self)
    }
    fn as_mutable(&self) -> Option<&dyn Mutable> {
        Some(self)
    }
    fn as_filesystem_root(&self) -> Option<&dyn FilesystemRoot> {
        Some(self)
    }
}

impl Lookup for MemDir {
    fn lookup(&self, _ctx: &Call, name: &OsStr) -> Result<NewChild> {
        let children = self.children.lock().unwrap();
        let (_, attr) = children.iter().find(|(n, _)| n == name).ok_or(Error::NotFound)?;
        Ok(NewChild::new(std::sync::Arc::new(MemFile), *attr))
    }
}

impl Mutable for MemDir {
    fn setattr(&self, _ctx: &Call, _attr: SetAttrRequest) -> Result<FileAttr> {
        Ok(dir_attr(1))
    }
    fn mknod(&self, _ctx: &Call, name: &OsStr, _mode: u32, _rdev: u32) -> Result<NewChild> {
        let ino = NEXT_INO.fetch_add(1, Ordering::SeqCst);
        let attr = file_attr(ino);
        self.children.lock().unwrap().push((name.to_owned(), attr));
        Ok(NewChild::new(std::sync::Arc::new(MemFile), attr))
    }
    fn mkdir(&self, _ctx: &Call, _name: &OsStr, _mode: u32) -> Result<NewChild> {
        Err(Error::NotSupported)
    }
    fn create(&self, ctx: &Call, name: &OsStr, mode: u32, _flags: i32) -> Result<(NewChild, Open)> {
        let child = self.mknod(ctx, name, mode, 0)?;
        Ok((child, Open { fh: 0, flags: nodefuse::FopenFlags::empty() }))
    }
    fn symlink(&self, _ctx: &Call, _name: &OsStr, _target: &OsStr) -> Result<NewChild> {
        Err(Error::NotSupported)
    }
    fn unlink(&self, _ctx: &Call, name: &OsStr) -> Result<()> {
        let mut children = self.children.lock().unwrap();
        let before = children.len();
        children.retain(|(n, _)| n != name);
        if children.len() == before { Err(Error::NotFound) } else { Ok(()) }
    }
    fn rmdir(&self, _ctx: &Call, _name: &OsStr) -> Result<()> {
        Err(Error::NotADirectory)
    }
    fn rename(
        &self,
        _ctx: &Call,
        name: &OsStr,
        _new_parent: &dyn Node,
        new_name: &OsStr,
        _flags: RenameFlags,
    ) -> Result<()> {
        let mut children = self.children.lock().unwrap();
        let idx = children.iter().position(|(n, _)| n == name).ok_or(Error::NotFound)?;
        children[idx].0 = new_name.to_owned();
        Ok(())
    }
}

impl FilesystemRoot for MemDir {
    fn statfs(&self, _ctx: &Call) -> Result<Statfs> {
        Ok(Statfs { blocks: 1, bfree: 1, bavail: 1, files: 1, ffree: 1, bsize: 512, namelen: 255, frsize: 512 })
    }
}

impl Node for MemFile {
    fn getattr(&self, _ctx: &Call) -> Result<FileAttr> {
        Ok(file_attr(2))
    }
}

fn mount(tmpdir: &TempDir) -> nodefuse::BackgroundSession {
    let root = std::sync::Arc::new(MemDir { children: Mutex::new(Vec::new()) });
    let session = Session::mount(
        root,
        tmpdir.path(),
        &[MountOption::RW, MountOption::FSName("nodefuse-integration-test".into())],
        SessionACL::Owner,
        MountConfig::default(),
    )
    .expect("failed to mount");
    session.spawn().expect("failed to spawn session workers")
}

#[test]
fn mknod_then_lookup_round_trips_through_a_real_mount() {
    let tmpdir = tempfile::tempdir().unwrap();
    let _session = mount(&tmpdir);

    let path = tmpdir.path().join("hello");
    std::fs::File::create(&path).unwrap();
    assert!(path.exists());
    let meta = std::fs::metadata(&path).unwrap();
    assert!(meta.is_file());
}

#[test]
fn rename_is_never_observed_as_both_names_missing() {
    let tmpdir = tempfile::tempdir().unwrap();
    let _session = mount(&tmpdir);

    let old_path = tmpdir.path().join("a");
    let new_path = tmpdir.path().join("b");
    std::fs::File::create(&old_path).unwrap();

    let observer_path = tmpdir.path().to_path_buf();
    let violation = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    let stop = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    let observer = {
        let violation = violation.clone();
        let stop = stop.clone();
        thread::spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                let a_there = observer_path.join("a").exists();
                let b_there = observer_path.join("b").exists();
                if !a_there && !b_there {
                    violation.store(true, Ordering::SeqCst);
                    break;
                }
            }
        })
    };

    std::fs::rename(&old_path, &new_path).unwrap();
    stop.store(true, Ordering::SeqCst);
    observer.join().unwrap();

    assert!(!violation.load(Ordering::SeqCst), "observed neither name present during rename");
    assert!(new_path.exists());
    assert!(!old_path.exists());
}

#[test]
fn unlink_removes_the_name_from_a_real_mount() {
    let tmpdir = tempfile::tempdir().unwrap();
    let _session = mount(&tmpdir);

    let path = tmpdir.path().join("gone");
    std::fs::File::create(&path).unwrap();
    assert!(path.exists());
    std::fs::remove_file(&path).unwrap();
    assert!(!path.exists());
}

