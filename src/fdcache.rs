//! Open-file bookkeeping: pseudo file descriptors, staging files, and the
//! `Clean → Dirty → Uploading → Clean|Error` lifecycle each open file moves
//! through between `open` and `release`.
//!
//! One [`FileEntity`] backs every open pseudo-fd. Its [`PageMap`] tracks
//! which byte ranges of the local staging file are populated and which are
//! dirty; `flush` hands the dirty cover to [`MultipartScheduler`] or issues a
//! single `PUT`, depending on file size.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write as IoWrite};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{FsError, Result};
use crate::headers::HeaderMap;
use crate::multipart::{self, MultipartScheduler, UploadMode};
use crate::pagemap::PageMap;
use crate::retry::{CancelToken, RetryPolicy};
use crate::statcache::StatCache;
use crate::transport::ObjectStoreClient;
use crate::workerpool::{TaskGroup, WorkerPool};

/// Where a [`FileEntity`] sits in its upload lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    Clean,
    Dirty,
    Uploading,
    Error,
}

/// One open file's local state: a staging file on disk, a page map
/// describing which parts of it are populated, and a pseudo-fd's reference
/// count (the same key can be `open`ed more than once).
pub struct FileEntity {
    pub key: String,
    staging_path: PathBuf,
    staging_file: Mutex<File>,
    pagemap: Mutex<PageMap>,
    state: Mutex<FileState>,
    etag: Mutex<Option<String>>,
    refs: AtomicU32,
    /// Headers from the most recent `flush` call, reused if `release` has to
    /// flush implicitly (no FUSE `flush` callback precedes it).
    last_headers: Mutex<HeaderMap>,
}

impl FileEntity {
    fn create(key: &str, staging_dir: &str, size: u64) -> Result<Self> {
        std::fs::create_dir_all(staging_dir)
            .map_err(|e| FsError::local_io(staging_dir.to_string(), e))?;
        let staging_path =
            PathBuf::from(staging_dir).join(format!("objectfs-{}", uuid::Uuid::new_v4()));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&staging_path)
            .map_err(|e| FsError::local_io(staging_path.display().to_string(), e))?;
        file.set_len(size)
            .map_err(|e| FsError::local_io(staging_path.display().to_string(), e))?;
        Ok(FileEntity {
            key: key.to_string(),
            staging_path,
            staging_file: Mutex::new(file),
            pagemap: Mutex::new(PageMap::new(size)),
            state: Mutex::new(FileState::Clean),
            etag: Mutex::new(None),
            refs: AtomicU32::new(1),
            last_headers: Mutex::new(HeaderMap::new()),
        })
    }

    fn read_local(&self, offset: u64, length: u64) -> Result<Vec<u8>> {
        let mut file = self.staging_file.lock();
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| FsError::local_io(self.staging_path.display().to_string(), e))?;
        let mut buf = vec![0u8; length as usize];
        file.read_exact(&mut buf)
            .map_err(|e| FsError::local_io(self.staging_path.display().to_string(), e))?;
        Ok(buf)
    }

    fn write_local(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut file = self.staging_file.lock();
        let needed = offset + data.len() as u64;
        if needed > file.metadata().map(|m| m.len()).unwrap_or(0) {
            file.set_len(needed)
                .map_err(|e| FsError::local_io(self.staging_path.display().to_string(), e))?;
        }
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| FsError::local_io(self.staging_path.display().to_string(), e))?;
        file.write_all(data)
            .map_err(|e| FsError::local_io(self.staging_path.display().to_string(), e))?;
        Ok(())
    }
}

impl Drop for FileEntity {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.staging_path);
    }
}

/// Maps pseudo-fds to [`FileEntity`] instances, loading/saving their
/// contents against an [`ObjectStoreClient`] and keeping [`StatCache`] in
/// sync after every successful flush.
pub struct FdCache {
    client: Arc<dyn ObjectStoreClient>,
    stat_cache: Arc<StatCache>,
    pool: Arc<WorkerPool>,
    scheduler: MultipartScheduler,
    retry_policy: RetryPolicy,
    config: Config,
    entities: DashMap<u64, Arc<FileEntity>>,
    fd_by_key: DashMap<String, u64>,
    next_fd: AtomicU64,
}

impl FdCache {
    pub fn new(
        client: Arc<dyn ObjectStoreClient>,
        stat_cache: Arc<StatCache>,
        pool: Arc<WorkerPool>,
        config: Config,
    ) -> Self {
        let retry_policy = RetryPolicy::from_config(&config);
        let scheduler = MultipartScheduler::new(client.clone(), pool.clone(), retry_policy.clone());
        FdCache {
            client,
            stat_cache,
            pool,
            scheduler,
            retry_policy,
            config,
            entities: DashMap::new(),
            fd_by_key: DashMap::new(),
            next_fd: AtomicU64::new(1),
        }
    }

    /// Opens `key` for read/write, fetching its current size via `HEAD` when
    /// `known_size` is `None`. A second `open` of an already-open key bumps
    /// its refcount and shares the staging file instead of re-fetching.
    pub fn open(&self, key: &str, known_size: Option<u64>) -> Result<u64> {
        if let Some(fd) = self.fd_by_key.get(key).map(|e| *e) {
            if let Some(entity) = self.entities.get(&fd) {
                entity.refs.fetch_add(1, Ordering::SeqCst);
                return Ok(fd);
            }
        }

        let (size, etag) = match known_size {
            Some(s) => (s, self.head_etag(key)),
            None => {
                let head = self.client.head(key)?;
                let size = head
                    .headers
                    .get("content-length")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0);
                let etag = head.headers.get("etag").map(str::to_string);
                (size, etag)
            }
        };

        let entity = Arc::new(FileEntity::create(key, &self.config.staging_dir, size)?);
        *entity.etag.lock() = etag;
        let fd = self.next_fd.fetch_add(1, Ordering::SeqCst);
        self.entities.insert(fd, entity);
        self.fd_by_key.insert(key.to_string(), fd);
        Ok(fd)
    }

    /// Best-effort ETag lookup for a path whose size is already known (from
    /// the stat cache): a reopened file needs its current ETag as the
    /// `x-amz-copy-source` anchor for any multipart copy-parts its next
    /// flush schedules.
    fn head_etag(&self, key: &str) -> Option<String> {
        self.client
            .head(key)
            .ok()
            .and_then(|h| h.headers.get("etag").map(str::to_string))
    }

    /// Creates a brand-new zero-length file locally without touching the
    /// object store (`O_CREAT` on a file that does not yet exist). The
    /// object is only written on the first `flush`.
    pub fn create(&self, key: &str) -> Result<u64> {
        let entity = Arc::new(FileEntity::create(key, &self.config.staging_dir, 0)?);
        *entity.state.lock() = FileState::Dirty;
        let fd = self.next_fd.fetch_add(1, Ordering::SeqCst);
        self.entities.insert(fd, entity);
        self.fd_by_key.insert(key.to_string(), fd);
        Ok(fd)
    }

    fn entity(&self, fd: u64) -> Result<Arc<FileEntity>> {
        self.entities
            .get(&fd)
            .map(|e| e.clone())
            .ok_or_else(|| FsError::client_fatal(format!("no open file for fd {fd}")))
    }

    /// Reads `length` bytes at `offset`, fetching any not-yet-loaded ranges
    /// from the object store in parallel first.
    pub fn read(&self, fd: u64, offset: u64, length: u64) -> Result<Vec<u8>> {
        let entity = self.entity(fd)?;
        let missing = entity.pagemap.lock().unloaded_ranges((offset, length));
        self.fetch_ranges(&entity, missing)?;
        entity.read_local(offset, length)
    }

    /// Fetches `ranges` from the object store in parallel and marks each one
    /// loaded in `entity`'s page map as it completes. A no-op for an empty
    /// list.
    fn fetch_ranges(&self, entity: &Arc<FileEntity>, ranges: Vec<(u64, u64)>) -> Result<()> {
        if ranges.is_empty() {
            return Ok(());
        }
        let group = TaskGroup::new();
        let cancel = CancelToken::new();
        let failure: Arc<Mutex<Option<FsError>>> = Arc::new(Mutex::new(None));

        for (range_offset, range_len) in ranges {
            let client = self.client.clone();
            let retry_policy = self.retry_policy.clone();
            let cancel = cancel.clone();
            let entity = entity.clone();
            let failure = failure.clone();
            let key = entity.key.clone();

            self.pool.submit(&group, move || {
                let result = retry_policy.run_with_retry(&cancel, |_attempt| {
                    let got = client.get_range(&key, Some((range_offset, range_len)))?;
                    entity.write_local(range_offset, &got.body)?;
                    Ok(())
                });
                match result {
                    Ok(()) => entity.pagemap.lock().mark_loaded((range_offset, range_len)),
                    Err(e) => {
                        warn!(key = %key, offset = range_offset, error = %e, "range fetch failed");
                        *failure.lock() = Some(e);
                        cancel.cancel();
                    }
                }
            });
        }
        group.wait();
        match failure.lock().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Writes `data` at `offset` into the staging file and marks the range
    /// dirty; nothing reaches the object store until `flush`.
    ///
    /// A write that does not cover a whole `part_size`-granularity page
    /// leaves the untouched part of that page unloaded; both the simple-PUT
    /// flush path and a multipart part absorbing this range read the
    /// staging file byte-for-byte, so the rest of the page must be fetched
    /// first, mirroring `read`'s fetch-then-serve logic.
    pub fn write(&self, fd: u64, offset: u64, data: &[u8]) -> Result<()> {
        let entity = self.entity(fd)?;
        self.prefetch_covering_page(&entity, offset, data.len() as u64)?;
        entity.write_local(offset, data)?;
        entity.pagemap.lock().mark_modified((offset, data.len() as u64));
        *entity.state.lock() = FileState::Dirty;
        Ok(())
    }

    /// Fetches whatever part of the `part_size`-aligned page(s) covering
    /// `[offset, offset + len)` is not yet loaded, clipped to the file's
    /// current size (bytes past the old end of file have no prior content
    /// to preserve).
    fn prefetch_covering_page(&self, entity: &Arc<FileEntity>, offset: u64, len: u64) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let current_size = entity.pagemap.lock().size();
        if offset >= current_size {
            return Ok(());
        }
        let part_size = self.config.part_size.max(1);
        let window_start = (offset / part_size) * part_size;
        let window_end = (((offset + len) + part_size - 1) / part_size) * part_size;
        let window_end = window_end.min(current_size);
        if window_start >= window_end {
            return Ok(());
        }

        let missing = entity
            .pagemap
            .lock()
            .unloaded_ranges((window_start, window_end - window_start));
        self.fetch_ranges(entity, missing)
    }

    pub fn truncate(&self, fd: u64, new_size: u64) -> Result<()> {
        let entity = self.entity(fd)?;
        {
            let file = entity.staging_file.lock();
            file.set_len(new_size)
                .map_err(|e| FsError::local_io(entity.staging_path.display().to_string(), e))?;
        }
        entity.pagemap.lock().resize(new_size);
        *entity.state.lock() = FileState::Dirty;
        Ok(())
    }

    pub fn size(&self, fd: u64) -> Result<u64> {
        Ok(self.entity(fd)?.pagemap.lock().size())
    }

    /// Uploads the dirty content, choosing a simple `PUT` or a multipart
    /// upload, then refreshes the stat cache from the result.
    pub fn flush(&self, fd: u64, headers: &HeaderMap) -> Result<()> {
        let entity = self.entity(fd)?;
        *entity.last_headers.lock() = headers.clone();
        if *entity.state.lock() != FileState::Dirty {
            return Ok(());
        }
        *entity.state.lock() = FileState::Uploading;

        let size = entity.pagemap.lock().size();
        let mode = multipart::plan_mode(size, &self.config);
        let planned_parts = if mode == UploadMode::Multipart {
            multipart::partition(&entity.pagemap.lock(), self.config.part_size).ok()
        } else {
            None
        };

        let etag = match planned_parts {
            Some(parts) => {
                // `MultipartScheduler::upload` prefixes this with a single
                // leading slash to build `x-amz-copy-source`; strip any
                // leading slash here so a path key doesn't end up doubled.
                let copy_source = entity
                    .etag
                    .lock()
                    .is_some()
                    .then(|| entity.key.trim_start_matches('/').to_string());
                self.scheduler.upload(
                    &entity.key,
                    headers,
                    &entity.staging_path,
                    copy_source.as_deref(),
                    parts,
                )
            }
            None => {
                if mode == UploadMode::Multipart {
                    info!(key = %entity.key, "multipart plan rejected, falling back to a single PUT");
                }
                // A whole-file PUT reads every byte back out of the staging
                // file, including any region this open never wrote to; that
                // region must be fetched first or the PUT re-uploads zeros
                // over the object's existing content.
                let missing = entity.pagemap.lock().unloaded_ranges((0, size));
                self.fetch_ranges(&entity, missing)?;
                let body = entity.read_local(0, size)?;
                self.client.put(&entity.key, body, headers).map(|r| r.etag)
            }
        };

        match etag {
            Ok(etag) => {
                let mut merged = headers.clone();
                merged.insert("etag", etag.clone());
                merged.insert("content-length", size.to_string());
                self.stat_cache.put(&entity.key, merged, false, false);
                *entity.etag.lock() = Some(etag);
                entity.pagemap.lock().mark_loaded((0, size));
                *entity.state.lock() = FileState::Clean;
                Ok(())
            }
            Err(e) => {
                *entity.state.lock() = FileState::Error;
                Err(e)
            }
        }
    }

    /// Drops a reference to `fd`'s entity. At a zero refcount, a still-Dirty
    /// entity is flushed before its staging file and page map are discarded
    /// — this covers callers that never issue an explicit `flush`
    /// between the last write and `close`. If that flush fails the entity is
    /// left registered (state `Error`, still `Dirty` underneath) so a
    /// subsequent `open` of the same key can retry it instead of losing the
    /// unwritten data.
    pub fn release(&self, fd: u64) -> Result<()> {
        let entity = self.entity(fd)?;
        let remaining = entity.refs.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining > 0 {
            return Ok(());
        }
        if *entity.state.lock() == FileState::Dirty {
            let headers = entity.last_headers.lock().clone();
            self.flush(fd, &headers)?;
        }
        self.entities.remove(&fd);
        self.fd_by_key.remove(&entity.key);
        Ok(())
    }

    pub fn state(&self, fd: u64) -> Result<FileState> {
        Ok(*self.entity(fd)?.state.lock())
    }

    /// Flushes every currently Dirty entity, best-effort, for orderly
    /// shutdown: every dirty entity gets a best-effort flush. Failures
    /// are logged, not propagated — a mount tearing down cannot block
    /// indefinitely on one uncooperative upload.
    pub fn flush_all_dirty(&self) {
        let fds: Vec<u64> = self.entities.iter().map(|e| *e.key()).collect();
        for fd in fds {
            let Some(entity) = self.entities.get(&fd).map(|e| e.clone()) else {
                continue;
            };
            if *entity.state.lock() != FileState::Dirty {
                continue;
            }
            let headers = entity.last_headers.lock().clone();
            if let Err(e) = self.flush(fd, &headers) {
                warn!(key = %entity.key, error = %e, "shutdown flush failed");
            }
        }
    }
}
