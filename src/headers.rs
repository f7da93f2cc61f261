//! Case-insensitive, case-preserving header storage.
//!
//! Keys are matched case-insensitively on lookup but the original casing is
//! kept for re-emission — load-bearing for object stores that echo headers
//! verbatim back to clients that compare them byte-for-byte.

use std::collections::HashMap;

/// The only headers the stat cache persists or re-emits.
const CURATED_EXACT: &[&str] = &["content-type", "content-length", "etag", "last-modified"];
const CURATED_PREFIX: &str = "x-amz";

#[derive(Debug, Clone, Default)]
pub struct HeaderMap {
    // lowercased key -> (original-case key, value)
    entries: HashMap<String, (String, String)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let lower = name.to_ascii_lowercase();
        self.entries.insert(lower, (name, value.into()));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .get(&name.to_ascii_lowercase())
            .map(|(_, v)| v.as_str())
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.entries
            .remove(&name.to_ascii_lowercase())
            .map(|(_, v)| v)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&name.to_ascii_lowercase())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Iterates `(original-case name, value)` pairs in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.values().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    fn is_curated(lower_name: &str) -> bool {
        CURATED_EXACT.contains(&lower_name) || lower_name.starts_with(CURATED_PREFIX)
    }

    /// Returns the curated subset: `content-type`, `content-length`,
    /// `etag`, `last-modified`, and any `x-amz*` header.
    pub fn curated_subset(&self) -> HeaderMap {
        let mut out = HeaderMap::new();
        for (lower, (orig, val)) in &self.entries {
            if Self::is_curated(lower) {
                out.entries.insert(lower.clone(), (orig.clone(), val.clone()));
            }
        }
        out
    }

    /// Merges `other` into `self`, restricted to the curated subset. A
    /// present-but-empty value in `other` deletes the corresponding key in
    /// `self` (used by `update_metadata`).
    pub fn merge_curated(&mut self, other: &HeaderMap) {
        for (lower, (orig, val)) in &other.entries {
            if !Self::is_curated(lower) {
                continue;
            }
            if val.is_empty() {
                self.entries.remove(lower);
            } else {
                self.entries.insert(lower.clone(), (orig.clone(), val.clone()));
            }
        }
    }
}

impl FromIterator<(String, String)> for HeaderMap {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        let mut map = HeaderMap::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive() {
        let mut h = HeaderMap::new();
        h.insert("Content-Type", "text/plain");
        assert_eq!(h.get("content-type"), Some("text/plain"));
        assert_eq!(h.get("CONTENT-TYPE"), Some("text/plain"));
    }

    #[test]
    fn original_casing_preserved_on_iteration() {
        let mut h = HeaderMap::new();
        h.insert("X-Amz-Meta-Mode", "33188");
        let (name, _) = h.iter().next().unwrap();
        assert_eq!(name, "X-Amz-Meta-Mode");
    }

    #[test]
    fn curated_subset_keeps_only_curated_headers() {
        let mut h = HeaderMap::new();
        h.insert("Content-Type", "application/x-directory");
        h.insert("X-Amz-Meta-Mode", "16877");
        h.insert("Connection", "keep-alive");
        h.insert("Server", "nginx");

        let curated = h.curated_subset();
        assert!(curated.contains("content-type"));
        assert!(curated.contains("x-amz-meta-mode"));
        assert!(!curated.contains("connection"));
        assert!(!curated.contains("server"));
    }

    #[test]
    fn merge_curated_empty_value_deletes_key() {
        let mut base = HeaderMap::new();
        base.insert("ETag", "\"abc\"");

        let mut update = HeaderMap::new();
        update.insert("ETag", "");

        base.merge_curated(&update);
        assert!(!base.contains("etag"));
    }
}
