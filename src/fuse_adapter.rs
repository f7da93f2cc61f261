//! Thin `fuser::Filesystem` binding: translates kernel requests (inode
//! numbers, `OsStr` names) into the path-addressed calls `fs::Filesystem`
//! exposes, and `Stat`/`FsError` back into `FileAttr`/`errno` replies.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem as FuserFilesystem, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, Request, TimeOrNow,
};
use parking_lot::Mutex;
use tracing::warn;

use crate::fs::Filesystem;
use crate::statcache::Stat;

const TTL: Duration = Duration::from_secs(1);
const ROOT_INO: u64 = 1;

/// Bidirectional inode <-> path table. The kernel only ever hands back
/// inode numbers it has previously seen from a `lookup`/`readdir` reply, so
/// entries are never evicted — a long-lived mount accumulates one entry per
/// path ever seen, mirroring how `fuser`'s own examples manage identity.
struct InodeTable {
    by_ino: Mutex<HashMap<u64, String>>,
    by_path: Mutex<HashMap<String, u64>>,
    next_ino: AtomicU64,
}

impl InodeTable {
    fn new() -> Self {
        let mut by_ino = HashMap::new();
        by_ino.insert(ROOT_INO, "/".to_string());
        let mut by_path = HashMap::new();
        by_path.insert("/".to_string(), ROOT_INO);
        InodeTable {
            by_ino: Mutex::new(by_ino),
            by_path: Mutex::new(by_path),
            next_ino: AtomicU64::new(2),
        }
    }

    fn ino_for(&self, path: &str) -> u64 {
        if let Some(ino) = self.by_path.lock().get(path) {
            return *ino;
        }
        let ino = self.next_ino.fetch_add(1, Ordering::SeqCst);
        self.by_path.lock().insert(path.to_string(), ino);
        self.by_ino.lock().insert(ino, path.to_string());
        ino
    }

    fn path_of(&self, ino: u64) -> Option<String> {
        self.by_ino.lock().get(&ino).cloned()
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Option<String> {
        let parent_path = self.path_of(parent)?;
        let name = name.to_str()?;
        Some(if parent_path == "/" {
            format!("/{name}")
        } else {
            format!("{}/{name}", parent_path.trim_end_matches('/'))
        })
    }
}

fn to_file_attr(ino: u64, stat: &Stat) -> FileAttr {
    let kind = match stat.mode & 0o170_000 {
        0o040_000 => FileType::Directory,
        0o120_000 => FileType::Symlink,
        _ => FileType::RegularFile,
    };
    let mtime = UNIX_EPOCH + Duration::from_secs(stat.mtime_unix.max(0) as u64);
    FileAttr {
        ino,
        size: stat.size,
        blocks: stat.size.div_ceil(512),
        atime: mtime,
        mtime,
        ctime: mtime,
        crtime: mtime,
        kind,
        perm: (stat.mode & 0o7777) as u16,
        nlink: 1,
        uid: stat.uid,
        gid: stat.gid,
        rdev: 0,
        blksize: 4096,
        flags: 0,
    }
}

pub struct FuseAdapter {
    fs: Arc<Filesystem>,
    inodes: InodeTable,
}

impl FuseAdapter {
    pub fn new(fs: Arc<Filesystem>) -> Self {
        FuseAdapter {
            fs,
            inodes: InodeTable::new(),
        }
    }
}

impl FuserFilesystem for FuseAdapter {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(path) = self.inodes.child_path(parent, name) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.fs.stat(&path) {
            Ok(stat) => {
                let ino = self.inodes.ino_for(&path);
                reply.entry(&TTL, &to_file_attr(ino, &stat), 0);
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.fs.stat(&path) {
            Ok(stat) => reply.attr(&TTL, &to_file_attr(ino, &stat)),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::EINVAL);
            return;
        };

        if let Some(new_size) = size {
            let result = match fh {
                Some(fd) => self.fs.truncate_open(fd, new_size),
                None => self.fs.truncate_path(&path, new_size, mode.unwrap_or(0o100_644)),
            };
            if let Err(e) = result {
                reply.error(e.errno());
                return;
            }
        }

        let mtime_secs = mtime.map(|t| match t {
            TimeOrNow::SpecificTime(st) => st
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0),
            TimeOrNow::Now => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0),
        });
        if mode.is_some() || mtime_secs.is_some() {
            if let Err(e) = self.fs.setattr(&path, mode, mtime_secs) {
                reply.error(e.errno());
                return;
            }
        }

        match self.fs.stat(&path) {
            Ok(stat) => reply.attr(&TTL, &to_file_attr(ino, &stat)),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.fs.readlink(&path) {
            Ok(target) => reply.data(target.as_bytes()),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(path) = self.inodes.child_path(parent, name) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.fs.mkdir(&path, mode | libc::S_IFDIR) {
            Ok(()) => match self.fs.stat(&path) {
                Ok(stat) => {
                    let ino = self.inodes.ino_for(&path);
                    reply.entry(&TTL, &to_file_attr(ino, &stat), 0);
                }
                Err(e) => reply.error(e.errno()),
            },
            Err(e) => reply.error(e.errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(path) = self.inodes.child_path(parent, name) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.fs.rmdir(&path) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(path) = self.inodes.child_path(parent, name) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.fs.unlink(&path) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &std::path::Path,
        reply: ReplyEntry,
    ) {
        let Some(path) = self.inodes.child_path(parent, link_name) else {
            reply.error(libc::EINVAL);
            return;
        };
        let target = target.to_string_lossy().into_owned();
        match self.fs.symlink(&path, &target) {
            Ok(()) => match self.fs.stat(&path) {
                Ok(stat) => {
                    let ino = self.inodes.ino_for(&path);
                    reply.entry(&TTL, &to_file_attr(ino, &stat), 0);
                }
                Err(e) => reply.error(e.errno()),
            },
            Err(e) => reply.error(e.errno()),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(from), Some(to)) = (
            self.inodes.child_path(parent, name),
            self.inodes.child_path(newparent, newname),
        ) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.fs.rename(&from, &to) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.fs.open(&path) {
            Ok(fd) => reply.opened(fd, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(path) = self.inodes.child_path(parent, name) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.fs.create(&path, mode | libc::S_IFREG) {
            Ok(fd) => {
                let stat = self.fs.stat(&path).unwrap_or(Stat {
                    size: 0,
                    mode: mode | libc::S_IFREG,
                    uid: 0,
                    gid: 0,
                    mtime_unix: 0,
                });
                let ino = self.inodes.ino_for(&path);
                reply.created(&TTL, &to_file_attr(ino, &stat), 0, fd, 0);
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let _ = self.inodes.path_of(ino);
        match self.fs.read(fh, offset.max(0) as u64, size as u64) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let _ = self.inodes.path_of(ino);
        match self.fs.write(fh, offset.max(0) as u64, data) {
            Ok(()) => reply.written(data.len() as u32),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::EINVAL);
            return;
        };
        let mode = self.fs.stat(&path).map(|s| s.mode).unwrap_or(0o100_644);
        match self.fs.flush(fh, &path, mode) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::EINVAL);
            return;
        };
        let mode = self.fs.stat(&path).map(|s| s.mode).unwrap_or(0o100_644);
        match self.fs.fsync(fh, &path, mode) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.fs.release(fh) {
            Ok(()) => reply.ok(),
            Err(e) => {
                warn!(fh, error = %e, "release failed");
                reply.error(e.errno());
            }
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
        reply.opened(0, 0);
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::EINVAL);
            return;
        };
        let entries = match self.fs.readdir(&path) {
            Ok(entries) => entries,
            Err(e) => {
                reply.error(e.errno());
                return;
            }
        };

        let mut all = vec![
            (ino, FileType::Directory, ".".to_string()),
            (ino, FileType::Directory, "..".to_string()),
        ];
        for entry in entries {
            let child_path = if path == "/" {
                format!("/{}", entry.name)
            } else {
                format!("{}/{}", path.trim_end_matches('/'), entry.name)
            };
            let child_ino = self.inodes.ino_for(&child_path);
            let kind = if entry.is_dir {
                FileType::Directory
            } else {
                FileType::RegularFile
            };
            all.push((child_ino, kind, entry.name));
        }

        for (i, (ino, kind, name)) in all.into_iter().enumerate().skip(offset as usize) {
            if reply.add(ino, (i + 1) as i64, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn access(&mut self, _req: &Request<'_>, _ino: u64, _mask: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    /// Called once by `fuser` as the session tears down (explicit unmount or
    /// a signal it turns into one). Flushes every Dirty file synchronously
    /// before the process exits.
    fn destroy(&mut self) {
        tracing::info!("unmounting: flushing dirty files before exit");
        self.fs.flush_all_dirty();
    }
}
