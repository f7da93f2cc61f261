//! The file system facade: translates POSIX-shaped operations
//! into calls against [`StatCache`], [`FdCache`] and the
//! [`ObjectStoreClient`] transport. [`crate::fuse_adapter`] is the only
//! caller — everything here is plain Rust, oblivious to `fuser`'s
//! inode/request types.

use std::sync::Arc;

use tracing::{info, warn};

use crate::error::{FsError, Result};
use crate::fdcache::FdCache;
use crate::headers::HeaderMap;
use crate::statcache::{Lookup, Stat, StatCache};
use crate::transport::ObjectStoreClient;

/// Directory marker convention this core writes when it creates a
/// directory. Reads normalize three other historical representations too
/// (see [`Filesystem::stat`]).
const DIRECTORY_CONTENT_TYPE: &str = "application/x-directory";

fn dir_key(path: &str) -> String {
    format!("{}/", path.trim_end_matches('/'))
}

fn legacy_dir_key(path: &str) -> String {
    format!("{}_$folder$", path.trim_end_matches('/'))
}

fn parent_dir_key(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(idx) if idx > 0 => format!("{}/", &trimmed[..idx]),
        _ => "/".to_string(),
    }
}

fn base_name(path: &str) -> &str {
    path.trim_end_matches('/').rsplit('/').next().unwrap_or("")
}

fn directory_stat(mode_headers: &HeaderMap) -> Stat {
    Stat {
        size: 0,
        mode: mode_headers
            .get("x-amz-meta-mode")
            .and_then(|m| m.parse().ok())
            .unwrap_or(0o040_755),
        uid: 0,
        gid: 0,
        mtime_unix: parse_mtime(mode_headers),
    }
}

fn file_stat(headers: &HeaderMap) -> Stat {
    Stat {
        size: headers
            .get("content-length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
        mode: headers
            .get("x-amz-meta-mode")
            .and_then(|m| m.parse().ok())
            .unwrap_or(0o100_644),
        uid: 0,
        gid: 0,
        mtime_unix: parse_mtime(headers),
    }
}

fn parse_mtime(headers: &HeaderMap) -> i64 {
    if let Some(raw) = headers.get("x-amz-meta-mtime") {
        if let Ok(v) = raw.parse() {
            return v;
        }
    }
    if let Some(raw) = headers.get("last-modified") {
        if let Ok(dt) = chrono::DateTime::parse_from_rfc2822(raw) {
            return dt.timestamp();
        }
    }
    0
}

/// One entry returned by [`Filesystem::readdir`].
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
}

pub struct Filesystem {
    client: Arc<dyn ObjectStoreClient>,
    stat_cache: Arc<StatCache>,
    fd_cache: Arc<FdCache>,
}

impl Filesystem {
    pub fn new(
        client: Arc<dyn ObjectStoreClient>,
        stat_cache: Arc<StatCache>,
        fd_cache: Arc<FdCache>,
    ) -> Self {
        Filesystem {
            client,
            stat_cache,
            fd_cache,
        }
    }

    /// Resolves a path to its `stat(2)`-equivalent fields, consulting (and
    /// populating) the stat cache first. Normalizes all four directory
    /// marker conventions on read, even though this core only ever writes
    /// the canonical one.
    pub fn stat(&self, path: &str) -> Result<Stat> {
        if path == "/" {
            return Ok(Stat {
                size: 0,
                mode: 0o040_755,
                uid: 0,
                gid: 0,
                mtime_unix: 0,
            });
        }

        match self.stat_cache.get(path, true, None) {
            Lookup::Hit(stat, _) => return Ok(stat),
            Lookup::Negative => return Err(FsError::not_found(path)),
            Lookup::Miss => {}
        }
        self.stat_uncached(path)
    }

    fn stat_uncached(&self, path: &str) -> Result<Stat> {
        let canonical_dir = dir_key(path);
        if let Ok(head) = self.client.head(&canonical_dir) {
            self.stat_cache.put(&canonical_dir, head.headers.clone(), true, false);
            return Ok(directory_stat(&head.headers));
        }

        let legacy = legacy_dir_key(path);
        if self.client.head(&legacy).is_ok() {
            self.stat_cache.put(&canonical_dir, HeaderMap::new(), true, false);
            return Ok(directory_stat(&HeaderMap::new()));
        }

        if let Ok(head) = self.client.head(path) {
            let is_dir = head
                .headers
                .get("content-type")
                .map(|ct| ct == DIRECTORY_CONTENT_TYPE)
                .unwrap_or(false);
            self.stat_cache.put(path, head.headers.clone(), is_dir, false);
            return Ok(if is_dir {
                directory_stat(&head.headers)
            } else {
                file_stat(&head.headers)
            });
        }

        // Implicit directory: no marker object exists, but other objects
        // share this prefix.
        let listed = self.client.list_objects_v2(&canonical_dir, Some("/"), None)?;
        if !listed.keys.is_empty() || !listed.common_prefixes.is_empty() {
            self.stat_cache.put(&canonical_dir, HeaderMap::new(), true, false);
            return Ok(directory_stat(&HeaderMap::new()));
        }

        self.stat_cache.put_negative(path);
        Err(FsError::not_found(path))
    }

    pub fn readdir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let prefix = dir_key(path);
        let mut entries = Vec::new();
        let mut seen = std::collections::HashSet::new();
        let mut token = None;

        loop {
            let page = self
                .client
                .list_objects_v2(&prefix, Some("/"), token.as_deref())?;

            for common in &page.common_prefixes {
                let name = common
                    .trim_end_matches('/')
                    .rsplit('/')
                    .next()
                    .unwrap_or("")
                    .to_string();
                if !name.is_empty() && seen.insert(name.clone()) {
                    entries.push(DirEntry { name, is_dir: true });
                }
            }
            for object in &page.keys {
                if object.key == prefix {
                    continue;
                }
                // Legacy `_$folder$` markers normalize to a plain directory
                // name, same as a canonical trailing-slash marker.
                let (relative, is_dir) = match object.key.strip_suffix("_$folder$") {
                    Some(base) => (base.trim_start_matches(&prefix as &str), true),
                    None => (
                        object.key.trim_start_matches(&prefix as &str),
                        object.key.ends_with('/'),
                    ),
                };
                let name = relative.trim_end_matches('/').to_string();
                if !name.is_empty() && !name.contains('/') && seen.insert(name.clone()) {
                    entries.push(DirEntry { name, is_dir });
                }
            }

            if page.is_truncated {
                token = page.next_continuation_token;
            } else {
                break;
            }
        }

        for name in self.stat_cache.list_pinned(&prefix) {
            if seen.insert(name.clone()) {
                entries.push(DirEntry { name, is_dir: false });
            }
        }

        Ok(entries)
    }

    /// Opens an existing file for I/O, returning its pseudo-fd.
    pub fn open(&self, path: &str) -> Result<u64> {
        let stat = self.stat(path)?;
        self.fd_cache.open(path, Some(stat.size))
    }

    /// Creates (`O_CREAT`) a new, empty, pinned file so it is visible in
    /// `readdir` even before the first `flush`.
    pub fn create(&self, path: &str, mode: u32) -> Result<u64> {
        if self.stat(path).is_ok() {
            return Err(FsError::client_fatal(format!("{path} already exists")));
        }
        let mut headers = HeaderMap::new();
        headers.insert("x-amz-meta-mode", mode.to_string());
        self.stat_cache.put(path, headers, false, true);
        self.fd_cache.create(path)
    }

    pub fn read(&self, fd: u64, offset: u64, length: u64) -> Result<Vec<u8>> {
        self.fd_cache.read(fd, offset, length)
    }

    pub fn write(&self, fd: u64, offset: u64, data: &[u8]) -> Result<()> {
        self.fd_cache.write(fd, offset, data)
    }

    /// Flushes dirty content to the object store and unpins the path once
    /// it has a durable backing object.
    pub fn flush(&self, fd: u64, path: &str, mode: u32) -> Result<()> {
        let mut headers = HeaderMap::new();
        headers.insert("x-amz-meta-mode", mode.to_string());
        self.fd_cache.flush(fd, &headers)?;
        self.stat_cache.unpin(path);
        Ok(())
    }

    /// `fsync`: identical to `flush` here — there is no separate durability
    /// tier between "written to the staging file" and "uploaded".
    pub fn fsync(&self, fd: u64, path: &str, mode: u32) -> Result<()> {
        self.flush(fd, path, mode)
    }

    pub fn release(&self, fd: u64) -> Result<()> {
        self.fd_cache.release(fd)
    }

    /// Best-effort flush of every open Dirty file, used on unmount
    /// "Shutdown sequencing").
    pub fn flush_all_dirty(&self) {
        self.fd_cache.flush_all_dirty();
    }

    pub fn truncate_open(&self, fd: u64, size: u64) -> Result<()> {
        self.fd_cache.truncate(fd, size)
    }

    /// `truncate(2)` on a path with no open fd: open, resize, flush, close.
    pub fn truncate_path(&self, path: &str, size: u64, mode: u32) -> Result<()> {
        let fd = self.open(path)?;
        self.fd_cache.truncate(fd, size)?;
        self.flush(fd, path, mode)?;
        self.fd_cache.release(fd)
    }

    pub fn mkdir(&self, path: &str, mode: u32) -> Result<()> {
        let key = dir_key(path);
        let mut headers = HeaderMap::new();
        headers.insert("content-type", DIRECTORY_CONTENT_TYPE.to_string());
        headers.insert("x-amz-meta-mode", mode.to_string());
        self.client.put(&key, Vec::new(), &headers)?;
        self.stat_cache.put(&key, headers, true, false);
        Ok(())
    }

    pub fn rmdir(&self, path: &str) -> Result<()> {
        let prefix = dir_key(path);
        let listing = self.client.list_objects_v2(&prefix, Some("/"), None)?;
        if !listing.keys.is_empty() || !listing.common_prefixes.is_empty() {
            return Err(FsError::client_fatal(format!("{path} is not empty")));
        }
        let _ = self.client.delete_object(&prefix);
        let _ = self.client.delete_object(&legacy_dir_key(path));
        self.stat_cache.invalidate(path);
        Ok(())
    }

    pub fn unlink(&self, path: &str) -> Result<()> {
        self.client.delete_object(path)?;
        self.stat_cache.invalidate(path);
        Ok(())
    }

    pub fn symlink(&self, path: &str, target: &str) -> Result<()> {
        let mut headers = HeaderMap::new();
        headers.insert("x-amz-meta-mode", (0o120_777_u32).to_string());
        headers.insert("content-type", "application/octet-stream".to_string());
        self.client.put(path, target.as_bytes().to_vec(), &headers)?;
        self.stat_cache.put_symlink(path, target);
        self.stat_cache.put(path, headers, false, false);
        Ok(())
    }

    pub fn readlink(&self, path: &str) -> Result<String> {
        if let Some(target) = self.stat_cache.get_symlink(path) {
            return Ok(target);
        }
        let got = self.client.get_range(path, None)?;
        let target = String::from_utf8(got.body)
            .map_err(|_| FsError::integrity(path, "symlink target is not valid UTF-8"))?;
        self.stat_cache.put_symlink(path, &target);
        Ok(target)
    }

    /// Object stores have no native rename; this issues a server-side copy
    /// followed by a delete. Directory rename is not supported —
    /// renaming a directory would require recursively re-keying every
    /// descendant object, which this core does not attempt).
    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        let stat = self.stat(from)?;
        if stat.mode & 0o170_000 == 0o040_000 {
            return Err(FsError::client_fatal(
                "renaming directories is not supported",
            ));
        }
        let copy_source = format!("/{}", from.trim_start_matches('/'));
        self.client.put_copy(to, &copy_source, &HeaderMap::new())?;
        self.client.delete_object(from)?;
        self.stat_cache.invalidate(from);
        self.stat_cache.invalidate(to);
        info!(from, to, "renamed via copy-then-delete");
        Ok(())
    }

    /// `chmod`/`chown`/`utimens`: object stores have no in-place metadata
    /// update, so persisting an attribute change costs one zero-byte-body
    /// `PUT` (a server-side self-copy with `REPLACE` metadata directive)
    /// even though no file content changed.
    pub fn setattr(&self, path: &str, mode: Option<u32>, mtime: Option<i64>) -> Result<()> {
        if mode.is_none() && mtime.is_none() {
            return Ok(());
        }
        let mut headers = HeaderMap::new();
        if let Some(m) = mode {
            headers.insert("x-amz-meta-mode", m.to_string());
        }
        if let Some(t) = mtime {
            headers.insert("x-amz-meta-mtime", t.to_string());
        }
        let copy_source = format!("/{}", path.trim_start_matches('/'));
        match self.client.put_copy(path, &copy_source, &headers) {
            Ok(_) => {
                self.stat_cache.update_metadata(path, &headers);
                Ok(())
            }
            Err(e) => {
                warn!(path, error = %e, "metadata self-copy failed");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn dir_key_always_ends_in_slash() {
        assert_eq!(dir_key("/a/b"), "/a/b/");
        assert_eq!(dir_key("/a/b/"), "/a/b/");
    }

    #[test]
    fn parent_dir_key_of_top_level_entry_is_root() {
        assert_eq!(parent_dir_key("/file.txt"), "/");
    }

    #[test]
    fn base_name_strips_trailing_slash() {
        assert_eq!(base_name("/a/b/c/"), "c");
        assert_eq!(base_name("/a/b/c"), "c");
    }

    #[test]
    fn file_stat_reads_size_and_mode_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("content-length", "123");
        headers.insert("x-amz-meta-mode", "33188");
        let stat = file_stat(&headers);
        assert_eq!(stat.size, 123);
        assert_eq!(stat.mode, 33188);
    }

    /// A stub [`ObjectStoreClient`] that only answers `list_objects_v2`,
    /// from a fixed, single-page listing — enough to exercise
    /// [`Filesystem::readdir`]'s directory-marker normalization.
    struct ListOnlyStore {
        keys: Vec<(&'static str, u64)>,
        common_prefixes: Vec<&'static str>,
    }

    impl ObjectStoreClient for ListOnlyStore {
        fn head(&self, key: &str) -> Result<crate::transport::HeadResult> {
            Err(FsError::not_found(key))
        }
        fn get_range(&self, key: &str, _range: Option<(u64, u64)>) -> Result<crate::transport::GetResult> {
            Err(FsError::not_found(key))
        }
        fn put(&self, _key: &str, _body: Vec<u8>, _headers: &HeaderMap) -> Result<crate::transport::PutResult> {
            unimplemented!()
        }
        fn put_copy(&self, _key: &str, _copy_source: &str, _headers: &HeaderMap) -> Result<crate::transport::PutResult> {
            unimplemented!()
        }
        fn list_objects_v2(
            &self,
            _prefix: &str,
            _delimiter: Option<&str>,
            _continuation_token: Option<&str>,
        ) -> Result<crate::transport::ListObjectsResult> {
            Ok(crate::transport::ListObjectsResult {
                keys: self
                    .keys
                    .iter()
                    .map(|(k, size)| crate::xml::ListEntry {
                        key: k.to_string(),
                        etag: String::new(),
                        size: *size,
                        last_modified: String::new(),
                    })
                    .collect(),
                common_prefixes: self.common_prefixes.iter().map(|p| p.to_string()).collect(),
                next_continuation_token: None,
                is_truncated: false,
            })
        }
        fn delete_object(&self, _key: &str) -> Result<()> {
            unimplemented!()
        }
        fn create_multipart_upload(&self, _key: &str, _headers: &HeaderMap) -> Result<String> {
            unimplemented!()
        }
        fn upload_part(&self, _key: &str, _upload_id: &str, _part_number: u32, _body: Vec<u8>) -> Result<String> {
            unimplemented!()
        }
        fn upload_part_copy(
            &self,
            _key: &str,
            _upload_id: &str,
            _part_number: u32,
            _copy_source: &str,
            _range: (u64, u64),
        ) -> Result<String> {
            unimplemented!()
        }
        fn complete_multipart_upload(&self, _key: &str, _upload_id: &str, _parts: &[(u32, String)]) -> Result<String> {
            unimplemented!()
        }
        fn abort_multipart_upload(&self, _key: &str, _upload_id: &str) -> Result<()> {
            unimplemented!()
        }
    }

    fn test_filesystem(client: ListOnlyStore) -> Filesystem {
        let cfg = Config::for_tests();
        let client: Arc<dyn ObjectStoreClient> = Arc::new(client);
        let stat_cache = Arc::new(StatCache::new(&cfg));
        let pool = Arc::new(crate::workerpool::WorkerPool::new(2));
        let fd_cache = Arc::new(FdCache::new(client.clone(), stat_cache.clone(), pool, cfg.clone()));
        Filesystem::new(client, stat_cache, fd_cache)
    }

    #[test]
    fn readdir_normalizes_every_directory_marker_form_with_no_duplicates() {
        // Mirrors S7: a canonical `a/` marker, a legacy `b_$folder$`
        // marker, and `c/` surfacing only as an implicit common-prefix
        // (no marker object for `c/` itself) all become one directory
        // entry each, with no duplicates.
        let fs = test_filesystem(ListOnlyStore {
            keys: vec![("/a/", 0), ("/b_$folder$", 0), ("/c/x", 10)],
            common_prefixes: vec!["/c/"],
        });

        let mut names: Vec<(String, bool)> = fs
            .readdir("/")
            .unwrap()
            .into_iter()
            .map(|e| (e.name, e.is_dir))
            .collect();
        names.sort();

        assert_eq!(
            names,
            vec![
                ("a".to_string(), true),
                ("b".to_string(), true),
                ("c".to_string(), true),
            ]
        );
    }
}
