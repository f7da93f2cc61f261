//! Multipart upload scheduling: decides simple-PUT vs. multipart mode,
//! partitions a file's dirty/clean byte ranges into upload-parts and
//! server-side copy-parts, and drives the
//! `Initiate → Dispatching → Completing|Aborting` state machine.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{info, warn};

use crate::config::{Config, MIN_PART_SIZE};
use crate::error::{FsError, Result};
use crate::headers::HeaderMap;
use crate::pagemap::PageMap;
use crate::retry::{CancelToken, RetryPolicy};
use crate::transport::ObjectStoreClient;
use crate::workerpool::{TaskGroup, WorkerPool};

/// Whether a file is small enough to go up in one `PUT`, or needs the
/// multipart state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadMode {
    Simple,
    Multipart,
}

/// A single part of a planned multipart upload. `dirty` parts come from the
/// local staging file via `upload_part`; non-dirty ("clean") parts are
/// copied server-side from the previous object version via
/// `upload_part_copy`, at zero transfer cost to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartPlan {
    pub part_number: u32,
    pub offset: u64,
    pub length: u64,
    pub dirty: bool,
}

/// Observable lifecycle of one multipart upload. Mirrors the
/// `Idle → Initiated → Dispatching → (AllPartsOK → Completing → Completed) |
/// (AnyPartFailed → Aborting → Aborted)` machine. Only used for logging and
/// tests here; the scheduler does not expose it as a queryable handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Idle,
    Initiated,
    Dispatching,
    Completing,
    Completed,
    Aborting,
    Aborted,
}

/// Decides whether `size` warrants multipart upload under `cfg`.
pub fn plan_mode(size: u64, cfg: &Config) -> UploadMode {
    if size <= cfg.multipart_threshold {
        UploadMode::Simple
    } else {
        UploadMode::Multipart
    }
}

/// Splits a page map's `[0, size)` cover into dirty/clean runs, then slices
/// each run into parts no larger than `part_size` bytes. A run boundary
/// that would otherwise leave a short interior part does not close the
/// part there: the in-progress part keeps absorbing bytes from the
/// following run until it reaches `part_size` again, turning dirty the
/// moment either side contributed a dirty byte (the combined range can
/// then only be sourced from the staging file, not a copy-source). Only
/// the very last part in the whole file may end up short.
pub fn partition(pagemap: &PageMap, part_size: u64) -> Result<Vec<PartPlan>> {
    let size = pagemap.size();
    if size == 0 {
        return Ok(Vec::new());
    }

    struct Run {
        offset: u64,
        length: u64,
        dirty: bool,
    }
    let mut runs: Vec<Run> = Vec::new();
    for p in pagemap.pages() {
        match runs.last_mut() {
            Some(last) if last.dirty == p.modified => last.length += p.length,
            _ => runs.push(Run {
                offset: p.offset,
                length: p.length,
                dirty: p.modified,
            }),
        }
    }

    let mut parts: Vec<PartPlan> = Vec::new();
    let mut pending: Option<PartPlan> = None;

    for run in &runs {
        let mut remaining = run.length;
        let mut cursor = run.offset;
        while remaining > 0 {
            match &mut pending {
                Some(p) if p.length < part_size => {
                    let take = remaining.min(part_size - p.length);
                    p.length += take;
                    p.dirty |= run.dirty;
                    cursor += take;
                    remaining -= take;
                }
                _ => {
                    if let Some(done) = pending.take() {
                        parts.push(done);
                    }
                    let take = remaining.min(part_size);
                    pending = Some(PartPlan {
                        part_number: parts.len() as u32 + 1,
                        offset: cursor,
                        length: take,
                        dirty: run.dirty,
                    });
                    cursor += take;
                    remaining -= take;
                }
            }
            if let Some(p) = &pending {
                if p.length >= part_size {
                    parts.push(pending.take().unwrap());
                }
            }
        }
    }
    if let Some(done) = pending.take() {
        parts.push(done);
    }
    for (number, part) in parts.iter_mut().enumerate() {
        part.part_number = number as u32 + 1;
    }

    // The absorb step above drives every non-last part to exactly
    // `part_size`, which the caller already validated is >= MIN_PART_SIZE;
    // this check only fires if that invariant is ever broken.
    if let Some((last, rest)) = parts.split_last() {
        for part in rest {
            if part.length < MIN_PART_SIZE {
                return Err(FsError::client_fatal(format!(
                    "part {} is {} bytes, below the {} byte minimum",
                    part.part_number, part.length, MIN_PART_SIZE
                )));
            }
        }
        let _ = last;
    }

    Ok(parts)
}

/// Drives one multipart upload end to end against an injected
/// [`ObjectStoreClient`], dispatching part uploads/copies across a shared
/// [`WorkerPool`] and retrying each part independently via [`RetryPolicy`].
pub struct MultipartScheduler {
    client: Arc<dyn ObjectStoreClient>,
    pool: Arc<WorkerPool>,
    retry_policy: RetryPolicy,
}

impl MultipartScheduler {
    pub fn new(client: Arc<dyn ObjectStoreClient>, pool: Arc<WorkerPool>, retry_policy: RetryPolicy) -> Self {
        MultipartScheduler {
            client,
            pool,
            retry_policy,
        }
    }

    /// Runs the full state machine for `key`, returning the completed
    /// object's ETag. `staging_path` is the local file backing dirty parts;
    /// `copy_source_key` is the existing object version clean parts are
    /// copied from (required whenever `parts` contains a non-dirty part).
    pub fn upload(
        &self,
        key: &str,
        headers: &HeaderMap,
        staging_path: &Path,
        copy_source_key: Option<&str>,
        parts: Vec<PartPlan>,
    ) -> Result<String> {
        if parts.is_empty() {
            return Err(FsError::client_fatal("multipart upload requires at least one part"));
        }

        let mut state = UploadState::Idle;
        let upload_id = self.client.create_multipart_upload(key, headers)?;
        state = UploadState::Initiated;
        info!(key, upload_id, parts = parts.len(), ?state, "multipart upload initiated");

        let results: Arc<DashMap<u32, String>> = Arc::new(DashMap::new());
        let failed = Arc::new(AtomicBool::new(false));
        let cancel = CancelToken::new();
        let group = TaskGroup::new();
        state = UploadState::Dispatching;

        for part in parts {
            let client = self.client.clone();
            let retry_policy = self.retry_policy.clone();
            let cancel = cancel.clone();
            let results = results.clone();
            let failed = failed.clone();
            let key = key.to_string();
            let upload_id = upload_id.clone();
            let staging_path = staging_path.to_path_buf();
            let copy_source = copy_source_key.map(|k| format!("/{k}"));

            self.pool.submit(&group, move || {
                let outcome = retry_policy.run_with_retry(&cancel, |_attempt| {
                    if part.dirty {
                        let body = read_part_from_staging(&staging_path, part.offset, part.length)?;
                        client.upload_part(&key, &upload_id, part.part_number, body)
                    } else {
                        let source = copy_source.as_deref().ok_or_else(|| {
                            FsError::client_fatal("clean part scheduled with no copy source")
                        })?;
                        client.upload_part_copy(
                            &key,
                            &upload_id,
                            part.part_number,
                            source,
                            (part.offset, part.length),
                        )
                    }
                });
                match outcome {
                    Ok(etag) => {
                        results.insert(part.part_number, etag);
                    }
                    Err(e) => {
                        warn!(key = %key, part = part.part_number, error = %e, "part failed permanently");
                        failed.store(true, Ordering::SeqCst);
                        cancel.cancel();
                    }
                }
            });
        }
        group.wait();

        if failed.load(Ordering::SeqCst) {
            state = UploadState::Aborting;
            warn!(key, upload_id, ?state, "aborting multipart upload after part failure");
            let _ = self.client.abort_multipart_upload(key, &upload_id);
            state = UploadState::Aborted;
            return Err(FsError::server_transient(format!(
                "multipart upload of {key} aborted: one or more parts failed"
            )));
        }

        let mut ordered: Vec<(u32, String)> = results
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        ordered.sort_by_key(|(n, _)| *n);

        state = UploadState::Completing;
        let etag = self
            .client
            .complete_multipart_upload(key, &upload_id, &ordered)?;
        state = UploadState::Completed;
        info!(key, upload_id, ?state, "multipart upload completed");
        Ok(etag)
    }
}

fn read_part_from_staging(path: &Path, offset: u64, length: u64) -> Result<Vec<u8>> {
    let mut file =
        File::open(path).map_err(|e| FsError::local_io(path.display().to_string(), e))?;
    file.seek(SeekFrom::Start(offset))
        .map_err(|e| FsError::local_io(path.display().to_string(), e))?;
    let mut buf = vec![0u8; length as usize];
    file.read_exact(&mut buf)
        .map_err(|e| FsError::local_io(path.display().to_string(), e))?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_file_plans_simple_mode() {
        let cfg = Config::for_tests();
        assert_eq!(plan_mode(1024, &cfg), UploadMode::Simple);
    }

    #[test]
    fn large_file_plans_multipart_mode() {
        let cfg = Config::for_tests();
        assert_eq!(plan_mode(cfg.multipart_threshold + 1, &cfg), UploadMode::Multipart);
    }

    #[test]
    fn fully_dirty_file_partitions_into_equal_parts() {
        const PART: u64 = MIN_PART_SIZE;
        let mut pm = PageMap::new(PART * 3);
        pm.mark_modified((0, PART * 3));
        let parts = partition(&pm, PART).unwrap();
        assert_eq!(parts.len(), 3);
        assert!(parts.iter().all(|p| p.dirty));
        assert_eq!(parts[0].offset, 0);
        assert_eq!(parts[1].offset, PART);
        assert_eq!(parts[2].offset, PART * 2);
    }

    #[test]
    fn mixed_dirty_and_clean_runs_produce_mixed_parts() {
        const PART: u64 = MIN_PART_SIZE;
        let mut pm = PageMap::new(PART * 4);
        pm.mark_loaded((0, PART * 4));
        pm.mark_modified((PART * 2, PART));
        let parts = partition(&pm, PART).unwrap();
        assert_eq!(parts.len(), 4);
        assert!(!parts[0].dirty);
        assert!(!parts[1].dirty);
        assert!(parts[2].dirty);
        assert!(!parts[3].dirty);
    }

    #[test]
    fn last_part_may_be_short() {
        const PART: u64 = MIN_PART_SIZE;
        let mut pm = PageMap::new(PART + 1024);
        pm.mark_modified((0, PART + 1024));
        let parts = partition(&pm, PART).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[1].length, 1024);
    }

    #[test]
    fn short_interior_dirty_island_is_absorbed_into_a_full_part() {
        const PART: u64 = MIN_PART_SIZE;
        let mut pm = PageMap::new(PART * 3);
        pm.mark_loaded((0, PART * 3));
        // a tiny dirty island would otherwise force a short interior part
        pm.mark_modified((PART + 10, 20));
        let parts = partition(&pm, PART).unwrap();

        assert_eq!(parts.len(), 3);
        assert!(parts.iter().all(|p| p.length == PART));
        assert!(!parts[0].dirty);
        assert!(parts[1].dirty);
        assert_eq!(parts[1].offset, PART);
        assert!(!parts[2].dirty);
    }

    #[test]
    fn partial_overwrite_of_large_file_absorbs_into_one_upload_part() {
        // Mirrors scenario S4: a 100 MiB object, 10 MiB parts, a 1 KiB
        // overwrite exactly at the 50 MiB part boundary.
        const MIB: u64 = 1024 * 1024;
        const PART: u64 = 10 * MIB;
        let mut pm = PageMap::new(100 * MIB);
        pm.mark_loaded((0, 100 * MIB));
        pm.mark_modified((50 * MIB, 1024));
        let parts = partition(&pm, PART).unwrap();

        assert_eq!(parts.len(), 10);
        for (i, part) in parts.iter().enumerate() {
            assert_eq!(part.offset, i as u64 * PART);
            assert_eq!(part.length, PART);
            assert_eq!(part.dirty, i == 5);
        }
    }

    #[test]
    fn empty_file_has_no_parts() {
        let pm = PageMap::new(0);
        assert_eq!(partition(&pm, MIN_PART_SIZE).unwrap(), Vec::new());
    }
}
