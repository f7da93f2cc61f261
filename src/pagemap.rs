//! Per-file byte-range bookkeeping over a sparse staging file.
//!
//! A [`PageMap`] tracks, for one open file, which byte ranges have been
//! fetched from the object store (`loaded`) and which have been written
//! locally since the last flush (`modified`). The page list always covers
//! `[0, size)` contiguously; holes are unloaded, unmodified pages.

/// A tracked byte range. `modified` implies `loaded` — a write always marks
/// its range loaded too, since the write itself supplies the bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub offset: u64,
    pub length: u64,
    pub loaded: bool,
    pub modified: bool,
}

impl Page {
    fn end(&self) -> u64 {
        self.offset + self.length
    }

    fn flags(&self) -> (bool, bool) {
        (self.loaded, self.modified)
    }
}

/// A half-open byte range `[offset, offset + length)`.
pub type Range = (u64, u64);

#[derive(Debug, Clone)]
pub struct PageMap {
    pages: Vec<Page>,
    size: u64,
}

impl PageMap {
    /// A fresh map for a file of the given logical size. A zero-size file
    /// has no pages.
    pub fn new(size: u64) -> Self {
        let pages = if size == 0 {
            Vec::new()
        } else {
            vec![Page {
                offset: 0,
                length: size,
                loaded: false,
                modified: false,
            }]
        };
        PageMap { pages, size }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn pages(&self) -> &[Page] {
        &self.pages
    }

    /// Index of the page containing `pos`, or `None` if `pos >= size`.
    fn page_index_containing(&self, pos: u64) -> Option<usize> {
        self.pages
            .iter()
            .position(|p| p.offset <= pos && pos < p.end())
    }

    /// Ensures a page boundary exists exactly at `pos` (splitting a page in
    /// two, preserving its flags, if `pos` falls strictly inside one).
    fn boundary_split(&mut self, pos: u64) {
        if pos == 0 || pos >= self.size {
            return;
        }
        if let Some(idx) = self.page_index_containing(pos) {
            let p = self.pages[idx];
            if p.offset == pos {
                return;
            }
            let first = Page {
                offset: p.offset,
                length: pos - p.offset,
                loaded: p.loaded,
                modified: p.modified,
            };
            let second = Page {
                offset: pos,
                length: p.end() - pos,
                loaded: p.loaded,
                modified: p.modified,
            };
            self.pages.splice(idx..=idx, [first, second]);
        }
    }

    /// Merges adjacent pages that share `(loaded, modified)` and are
    /// contiguous. Restores the class invariant after any mutation.
    fn coalesce(&mut self) {
        let mut merged: Vec<Page> = Vec::with_capacity(self.pages.len());
        for p in self.pages.drain(..) {
            match merged.last_mut() {
                Some(last) if last.end() == p.offset && last.flags() == p.flags() => {
                    last.length += p.length;
                }
                _ => merged.push(p),
            }
        }
        self.pages = merged;
    }

    fn clip_range(&self, range: Range) -> Option<Range> {
        let (start, len) = range;
        if len == 0 {
            return None;
        }
        let end = (start + len).min(self.size);
        if start >= end {
            return None;
        }
        Some((start, end))
    }

    /// Applies `set` to every page overlapping `[start, end)`, splitting at
    /// the boundaries first. A range extending past the current size
    /// implicitly resizes.
    fn apply_range(&mut self, start: u64, len: u64, set: impl Fn(&mut Page)) {
        if len == 0 {
            return;
        }
        let end = start + len;
        if end > self.size {
            self.resize(end);
        }
        self.boundary_split(start);
        self.boundary_split(end);
        for p in self.pages.iter_mut() {
            if p.offset >= start && p.end() <= end {
                set(p);
            }
        }
        self.coalesce();
    }

    /// Sub-ranges of `range` (clipped to `[0, size)`) whose `loaded` flag is
    /// false. Read-only — the caller fetches these and calls
    /// [`PageMap::mark_loaded`] once each completes.
    pub fn ensure_loaded(&self, range: Range) -> Vec<Range> {
        let Some((start, end)) = self.clip_range(range) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for p in &self.pages {
            if p.loaded || p.end() <= start || p.offset >= end {
                continue;
            }
            let lo = p.offset.max(start);
            let hi = p.end().min(end);
            out.push((lo, hi - lo));
        }
        out
    }

    /// Alias for [`PageMap::ensure_loaded`] matching the PageMap-level name
    /// used elsewhere.
    pub fn unloaded_ranges(&self, range: Range) -> Vec<Range> {
        self.ensure_loaded(range)
    }

    /// Marks `range` as fetched from the store. Idempotent.
    pub fn mark_loaded(&mut self, range: Range) {
        let (start, len) = range;
        self.apply_range(start, len, |p| p.loaded = true);
    }

    /// Marks `range` as written locally. Implies `loaded`.
    pub fn mark_modified(&mut self, range: Range) {
        let (start, len) = range;
        self.apply_range(start, len, |p| {
            p.loaded = true;
            p.modified = true;
        });
    }

    /// Minimal cover of all modified bytes. Adjacent modified pages are
    /// already coalesced by every mutator, so this is just a filter.
    pub fn modified_ranges(&self) -> Vec<Range> {
        self.pages
            .iter()
            .filter(|p| p.modified)
            .map(|p| (p.offset, p.length))
            .collect()
    }

    /// Grows or shrinks the logical size. Growing appends an
    /// unloaded/unmodified page; shrinking drops pages beyond `new_size`
    /// and splits any page straddling it.
    pub fn resize(&mut self, new_size: u64) {
        use std::cmp::Ordering;
        match new_size.cmp(&self.size) {
            Ordering::Equal => {}
            Ordering::Greater => {
                let gap = Page {
                    offset: self.size,
                    length: new_size - self.size,
                    loaded: false,
                    modified: false,
                };
                self.pages.push(gap);
                self.size = new_size;
                self.coalesce();
            }
            Ordering::Less => {
                if new_size == 0 {
                    self.pages.clear();
                } else {
                    self.boundary_split(new_size);
                    self.pages.retain(|p| p.offset < new_size);
                }
                self.size = new_size;
            }
        }
    }

    /// Checks the class invariant: non-overlapping, strictly increasing,
    /// fully coalesced, contiguous cover of `[0, size)`. Used by tests.
    pub fn check_invariant(&self) -> bool {
        let mut expected_offset = 0u64;
        for w in self.pages.windows(2) {
            if w[0].flags() == w[1].flags() && w[0].end() == w[1].offset {
                return false; // should have been coalesced
            }
        }
        for p in &self.pages {
            if p.length == 0 || p.offset != expected_offset {
                return false;
            }
            expected_offset = p.end();
        }
        expected_offset == self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn new_file_has_no_pages() {
        let pm = PageMap::new(0);
        assert!(pm.pages().is_empty());
        assert!(pm.check_invariant());
    }

    #[test]
    fn new_file_has_one_unloaded_page() {
        let pm = PageMap::new(100);
        assert_eq!(pm.pages().len(), 1);
        assert!(pm.check_invariant());
        assert_eq!(pm.unloaded_ranges((0, 100)), vec![(0, 100)]);
    }

    #[test]
    fn mark_loaded_splits_and_coalesces() {
        let mut pm = PageMap::new(100);
        pm.mark_loaded((10, 20));
        assert!(pm.check_invariant());
        assert_eq!(pm.unloaded_ranges((0, 100)), vec![(0, 10), (30, 70)]);

        pm.mark_loaded((0, 10));
        pm.mark_loaded((30, 70));
        assert!(pm.check_invariant());
        assert_eq!(pm.pages().len(), 1);
        assert_eq!(pm.unloaded_ranges((0, 100)), vec![]);
    }

    #[test]
    fn mark_loaded_is_idempotent() {
        let mut pm = PageMap::new(100);
        pm.mark_loaded((10, 20));
        let before = pm.pages().to_vec();
        pm.mark_loaded((10, 20));
        assert_eq!(pm.pages(), before.as_slice());
    }

    #[test]
    fn mark_modified_sets_loaded_too() {
        let mut pm = PageMap::new(100);
        pm.mark_modified((40, 10));
        assert!(pm.check_invariant());
        assert_eq!(pm.modified_ranges(), vec![(40, 10)]);
        assert_eq!(pm.unloaded_ranges((40, 10)), vec![]);
    }

    #[test]
    fn modified_ranges_merge_adjacent_writes() {
        let mut pm = PageMap::new(100);
        pm.mark_modified((0, 10));
        pm.mark_modified((10, 10));
        assert!(pm.check_invariant());
        assert_eq!(pm.modified_ranges(), vec![(0, 20)]);
    }

    #[test]
    fn write_past_end_extends_file() {
        let mut pm = PageMap::new(10);
        pm.mark_modified((20, 5));
        assert_eq!(pm.size(), 25);
        assert!(pm.check_invariant());
        assert_eq!(pm.modified_ranges(), vec![(20, 5)]);
        // the gap between old EOF and the new write is an unloaded hole
        assert_eq!(pm.unloaded_ranges((0, 25)), vec![(0, 10), (10, 10)]);
    }

    #[test]
    fn resize_down_truncates_and_splits() {
        let mut pm = PageMap::new(100);
        pm.mark_modified((0, 100));
        pm.resize(50);
        assert!(pm.check_invariant());
        assert_eq!(pm.size(), 50);
        assert_eq!(pm.modified_ranges(), vec![(0, 50)]);
    }

    #[test]
    fn resize_to_zero_clears_pages() {
        let mut pm = PageMap::new(100);
        pm.mark_modified((0, 100));
        pm.resize(0);
        assert!(pm.pages().is_empty());
        assert!(pm.check_invariant());
    }

    #[test]
    fn zero_length_range_is_a_no_op() {
        let mut pm = PageMap::new(100);
        let before = pm.pages().to_vec();
        pm.mark_loaded((50, 0));
        pm.mark_modified((50, 0));
        assert_eq!(pm.pages(), before.as_slice());
    }

    #[test]
    fn partial_overwrite_on_large_file_yields_expected_parts() {
        // Mirrors scenario S4: a 100 MiB object, 10 MiB parts, 1 KiB
        // overwrite at the 50 MiB boundary region.
        const MIB: u64 = 1024 * 1024;
        let mut pm = PageMap::new(100 * MIB);
        pm.mark_loaded((0, 100 * MIB));
        pm.mark_modified((50 * MIB, 1024));
        assert!(pm.check_invariant());
        assert_eq!(pm.modified_ranges(), vec![(50 * MIB, 1024)]);
    }

    proptest! {
        #[test]
        fn invariant_holds_after_arbitrary_ops(
            ops in proptest::collection::vec(
                (0u8..3, 0u64..200, 0u64..50),
                1..40,
            ),
            initial_size in 0u64..200,
        ) {
            let mut pm = PageMap::new(initial_size);
            for (kind, offset, len) in ops {
                match kind {
                    0 => pm.mark_loaded((offset, len)),
                    1 => pm.mark_modified((offset, len)),
                    _ => pm.resize(offset),
                }
                prop_assert!(pm.check_invariant());
            }
        }

        #[test]
        fn modified_ranges_never_adjacent(
            writes in proptest::collection::vec((0u64..500, 1u64..30), 0..30),
        ) {
            let mut pm = PageMap::new(1000);
            for (offset, len) in writes {
                pm.mark_modified((offset, len));
            }
            let ranges = pm.modified_ranges();
            for w in ranges.windows(2) {
                prop_assert!(w[0].0 + w[0].1 < w[1].0);
            }
        }
    }
}
