//! LRU-with-hit-count cache of object metadata and negative lookups.
//!
//! A process-wide singleton in the source; here an owned instance injected
//! into the file-descriptor cache at start-up.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::{Config, ExpireMode};
use crate::headers::HeaderMap;

/// Minimal `stat(2)`-equivalent fields the cache tracks alongside headers.
#[derive(Debug, Clone, Copy)]
pub struct Stat {
    pub size: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime_unix: i64,
}

impl Stat {
    fn regular_file(size: u64) -> Self {
        Stat {
            size,
            mode: 0o100_644,
            uid: 0,
            gid: 0,
            mtime_unix: 0,
        }
    }

    fn directory() -> Self {
        Stat {
            size: 0,
            mode: 0o040_755,
            uid: 0,
            gid: 0,
            mtime_unix: 0,
        }
    }
}

/// Recomputes the stat mode from curated headers: `x-amz-meta-mode` (set by
/// the FUSE adapter on chmod and by symlink creation) wins; otherwise a
/// plain file or directory default.
fn mode_from_headers(headers: &HeaderMap, is_dir: bool) -> u32 {
    if let Some(raw) = headers.get("x-amz-meta-mode") {
        if let Ok(m) = raw.parse::<u32>() {
            return m;
        }
    }
    if is_dir {
        0o040_755
    } else {
        0o100_644
    }
}

#[derive(Debug, Clone)]
struct StatCacheEntry {
    stat: Stat,
    headers: HeaderMap,
    hit_count: u64,
    cache_date: Instant,
    is_force_dir: bool,
    is_negative: bool,
    pin_count: u32,
}

#[derive(Debug, Clone)]
struct SymlinkCacheEntry {
    target: String,
    hit_count: u64,
    cache_date: Instant,
}

/// Result of [`StatCache::get`].
pub enum Lookup {
    Hit(Stat, HeaderMap),
    Negative,
    Miss,
}

struct Inner {
    entries: HashMap<String, StatCacheEntry>,
    symlinks: HashMap<String, SymlinkCacheEntry>,
    /// parent-dir (trailing `/`) -> pinned child names, for `readdir`
    /// augmentation.
    pinned_children: HashMap<String, HashSet<String>>,
}

pub struct StatCache {
    inner: Mutex<Inner>,
    capacity: usize,
    expire: Duration,
    expire_mode: ExpireMode,
    negative_cache_enabled: bool,
}

fn slash_variant(key: &str) -> String {
    if key.ends_with('/') {
        key.trim_end_matches('/').to_string()
    } else {
        format!("{key}/")
    }
}

fn parent_of(key: &str) -> String {
    let trimmed = key.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(idx) => format!("{}/", &trimmed[..idx]),
        None => "/".to_string(),
    }
}

fn child_name(key: &str) -> String {
    key.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or("")
        .to_string()
}

impl StatCache {
    pub fn new(cfg: &Config) -> Self {
        StatCache {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                symlinks: HashMap::new(),
                pinned_children: HashMap::new(),
            }),
            capacity: cfg.stat_cache_size,
            expire: cfg.stat_cache_expire,
            expire_mode: cfg.stat_cache_expire_mode,
            negative_cache_enabled: cfg.negative_cache_enabled,
        }
    }

    fn is_expired(&self, entry: &StatCacheEntry, now: Instant) -> bool {
        entry.pin_count == 0 && now.saturating_duration_since(entry.cache_date) > self.expire
    }

    /// `overcheck`: if the key doesn't already end in `/`, try the
    /// directory variant first (directories are cached under their
    /// trailing-slash key).
    pub fn get(&self, key: &str, overcheck: bool, expected_etag: Option<&str>) -> Lookup {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let candidates: Vec<String> = if overcheck && !key.ends_with('/') {
            vec![format!("{key}/"), key.to_string()]
        } else {
            vec![key.to_string()]
        };

        for candidate in candidates {
            let Some(entry) = inner.entries.get(&candidate) else {
                continue;
            };

            if let Some(expected) = expected_etag {
                let matches = entry.headers.get("etag").map(|e| e == expected).unwrap_or(false);
                if !matches {
                    inner.entries.remove(&candidate);
                    return Lookup::Miss;
                }
            }

            if self.is_expired(entry, now) {
                inner.entries.remove(&candidate);
                return Lookup::Miss;
            }

            if entry.is_negative {
                return Lookup::Negative;
            }

            let entry = inner.entries.get_mut(&candidate).unwrap();
            entry.hit_count += 1;
            if self.expire_mode == ExpireMode::Sliding {
                entry.cache_date = now;
            }
            return Lookup::Hit(entry.stat, entry.headers.clone());
        }

        Lookup::Miss
    }

    pub fn put(&self, key: &str, headers: HeaderMap, is_force_dir: bool, pin: bool) {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let variant = slash_variant(key);
        inner.entries.remove(key);
        inner.entries.remove(&variant);

        let stat = if is_force_dir || key.ends_with('/') {
            let mut s = Stat::directory();
            s.mode = mode_from_headers(&headers, true);
            s
        } else {
            let size = headers
                .get("content-length")
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0);
            let mut s = Stat::regular_file(size);
            s.mode = mode_from_headers(&headers, false);
            s
        };

        Self::evict_if_needed(&mut inner, self.capacity, self.expire, now);

        let pin_count = if pin { 1 } else { 0 };
        inner.entries.insert(
            key.to_string(),
            StatCacheEntry {
                stat,
                headers: headers.curated_subset(),
                hit_count: 0,
                cache_date: now,
                is_force_dir,
                is_negative: false,
                pin_count,
            },
        );

        if pin {
            let parent = parent_of(key);
            inner
                .pinned_children
                .entry(parent)
                .or_default()
                .insert(child_name(key));
        }
    }

    pub fn put_negative(&self, key: &str) {
        if !self.negative_cache_enabled {
            return;
        }
        let now = Instant::now();
        let mut inner = self.inner.lock();
        Self::evict_if_needed(&mut inner, self.capacity, self.expire, now);
        inner.entries.insert(
            key.to_string(),
            StatCacheEntry {
                stat: Stat::regular_file(0),
                headers: HeaderMap::new(),
                hit_count: 0,
                cache_date: now,
                is_force_dir: false,
                is_negative: true,
                pin_count: 0,
            },
        );
    }

    pub fn update_metadata(&self, key: &str, headers: &HeaderMap) {
        let mut inner = self.inner.lock();
        let is_dir = inner.entries.get(key).map(|e| e.is_force_dir).unwrap_or(false);
        if let Some(entry) = inner.entries.get_mut(key) {
            entry.headers.merge_curated(headers);
            entry.cache_date = Instant::now();
            entry.stat.mode = mode_from_headers(&entry.headers, is_dir);
            if let Some(len) = entry.headers.get("content-length").and_then(|v| v.parse::<u64>().ok())
            {
                entry.stat.size = len;
            }
        }
    }

    pub fn unpin(&self, key: &str) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get_mut(key) {
            if entry.pin_count > 0 {
                entry.pin_count -= 1;
            }
            if entry.pin_count == 0 {
                let parent = parent_of(key);
                let name = child_name(key);
                if let Some(set) = inner.pinned_children.get_mut(&parent) {
                    set.remove(&name);
                    if set.is_empty() {
                        inner.pinned_children.remove(&parent);
                    }
                }
            }
        }
    }

    pub fn invalidate(&self, key: &str) {
        let mut inner = self.inner.lock();
        let variant = slash_variant(key);
        inner.entries.remove(key);
        inner.entries.remove(&variant);
        let parent = parent_of(key);
        let name = child_name(key);
        if let Some(set) = inner.pinned_children.get_mut(&parent) {
            set.remove(&name);
            if set.is_empty() {
                inner.pinned_children.remove(&parent);
            }
        }
    }

    /// Child names under `parent` (trailing `/`) that are pinned but may not
    /// yet exist in the object store — used by `readdir` to synthesize
    /// entries for files opened with `O_CREAT` but not yet flushed.
    pub fn list_pinned(&self, parent: &str) -> Vec<String> {
        let inner = self.inner.lock();
        inner
            .pinned_children
            .get(parent)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn evict_if_needed(inner: &mut Inner, capacity: usize, expire: Duration, now: Instant) {
        if inner.entries.len() < capacity {
            return;
        }
        // Sweep expired, non-pinned entries first.
        inner.entries.retain(|_, e| {
            e.pin_count > 0 || now.saturating_duration_since(e.cache_date) <= expire
        });
        if inner.entries.len() < capacity {
            return;
        }
        // Still over capacity: evict non-pinned entries ascending by
        // (cache_date, hit_count) until back under capacity.
        let mut victims: Vec<(String, Instant, u64)> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.pin_count == 0)
            .map(|(k, e)| (k.clone(), e.cache_date, e.hit_count))
            .collect();
        victims.sort_by(|a, b| a.1.cmp(&b.1).then(a.2.cmp(&b.2)));

        let overflow = inner.entries.len() + 1 - capacity;
        for (key, _, _) in victims.into_iter().take(overflow) {
            inner.entries.remove(&key);
        }
    }

    // -- symlink cache: a separate map so its (currently unbounded) entries
    // never compete with stat-cache eviction decisions.

    pub fn get_symlink(&self, key: &str) -> Option<String> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let expired = inner
            .symlinks
            .get(key)
            .map(|e| now.saturating_duration_since(e.cache_date) > self.expire)
            .unwrap_or(false);
        if expired {
            inner.symlinks.remove(key);
            return None;
        }
        if let Some(entry) = inner.symlinks.get_mut(key) {
            entry.hit_count += 1;
            if self.expire_mode == ExpireMode::Sliding {
                entry.cache_date = now;
            }
            return Some(entry.target.clone());
        }
        None
    }

    pub fn put_symlink(&self, key: &str, target: &str) {
        let mut inner = self.inner.lock();
        inner.symlinks.insert(
            key.to_string(),
            SymlinkCacheEntry {
                target: target.to_string(),
                hit_count: 0,
                cache_date: Instant::now(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg_with_capacity(capacity: usize) -> Config {
        let mut cfg = Config::for_tests();
        cfg.stat_cache_size = capacity;
        cfg
    }

    #[test]
    fn put_then_get_round_trips() {
        let cache = StatCache::new(&Config::for_tests());
        let mut headers = HeaderMap::new();
        headers.insert("content-length", "42");
        headers.insert("etag", "\"abc\"");
        cache.put("/a/b", headers, false, false);

        match cache.get("/a/b", false, None) {
            Lookup::Hit(stat, headers) => {
                assert_eq!(stat.size, 42);
                assert_eq!(headers.get("etag"), Some("\"abc\""));
            }
            _ => panic!("expected hit"),
        }
    }

    #[test]
    fn negative_cache_then_invalidate() {
        let cache = StatCache::new(&Config::for_tests());
        cache.put_negative("/a/missing");
        assert!(matches!(cache.get("/a/missing", false, None), Lookup::Negative));

        cache.invalidate("/a/missing");
        assert!(matches!(cache.get("/a/missing", false, None), Lookup::Miss));
    }

    #[test]
    fn negative_cache_disabled_is_noop() {
        let mut cfg = Config::for_tests();
        cfg.negative_cache_enabled = false;
        let cache = StatCache::new(&cfg);
        cache.put_negative("/a/missing");
        assert!(matches!(cache.get("/a/missing", false, None), Lookup::Miss));
    }

    #[test]
    fn expected_etag_mismatch_evicts_and_misses() {
        let cache = StatCache::new(&Config::for_tests());
        let mut headers = HeaderMap::new();
        headers.insert("etag", "\"old\"");
        cache.put("/a/b", headers, false, false);

        assert!(matches!(cache.get("/a/b", false, Some("\"new\"")), Lookup::Miss));
        assert!(matches!(cache.get("/a/b", false, None), Lookup::Miss));
    }

    #[test]
    fn pinned_entries_survive_eviction_pressure() {
        let cache = StatCache::new(&cfg_with_capacity(4));
        cache.put("/pinned", HeaderMap::new(), false, true);

        for i in 0..20 {
            cache.put(&format!("/other-{i}"), HeaderMap::new(), false, false);
        }

        assert!(matches!(cache.get("/pinned", false, None), Lookup::Hit(..)));
    }

    #[test]
    fn eviction_keeps_at_most_capacity_unpinned_entries() {
        let capacity = 8;
        let cache = StatCache::new(&cfg_with_capacity(capacity));
        for i in 0..(capacity * 3) {
            cache.put(&format!("/k-{i}"), HeaderMap::new(), false, false);
        }
        let inner = cache.inner.lock();
        let unpinned = inner.entries.values().filter(|e| e.pin_count == 0).count();
        assert!(unpinned <= capacity);
    }

    #[test]
    fn pinned_children_listed_for_readdir() {
        let cache = StatCache::new(&Config::for_tests());
        cache.put("/dir/x", HeaderMap::new(), false, true);
        let names = cache.list_pinned("/dir/");
        assert_eq!(names, vec!["x".to_string()]);

        cache.unpin("/dir/x");
        assert!(cache.list_pinned("/dir/").is_empty());
    }

    #[test]
    fn update_metadata_merges_and_deletes_empty_values() {
        let cache = StatCache::new(&Config::for_tests());
        let mut headers = HeaderMap::new();
        headers.insert("etag", "\"one\"");
        headers.insert("content-length", "10");
        cache.put("/f", headers, false, false);

        let mut update = HeaderMap::new();
        update.insert("etag", "");
        update.insert("content-length", "20");
        cache.update_metadata("/f", &update);

        match cache.get("/f", false, None) {
            Lookup::Hit(stat, headers) => {
                assert!(!headers.contains("etag"));
                assert_eq!(stat.size, 20);
            }
            _ => panic!("expected hit"),
        }
    }

    #[test]
    fn symlink_cache_is_independent_of_stat_cache() {
        let cache = StatCache::new(&Config::for_tests());
        cache.put_symlink("/link", "/target/file");
        assert_eq!(cache.get_symlink("/link").as_deref(), Some("/target/file"));
        assert!(matches!(cache.get("/link", false, None), Lookup::Miss));
    }
}
