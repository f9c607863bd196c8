//! The in-memory key directory: a concurrent map from key to the location
//! of its most recent value, plus the per-datafile bookkeeping that drives
//! merge decisions (§3, §4.5).

use dashmap::DashMap;

/// Where a key's current value lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyDirEntry {
    pub file_id: u64,
    pub value_pos: u64,
    pub value_size: u32,
    /// Total on-disk size of the record this entry points into (header +
    /// key + value), used for fragmentation accounting.
    pub record_len: u64,
    pub timestamp: u64,
}

/// Live/dead bookkeeping for one datafile, used to decide whether a merge
/// is warranted and which files it should rewrite.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FileStats {
    pub live_keys: u64,
    pub dead_keys: u64,
    pub live_bytes: u64,
    pub dead_bytes: u64,
}

impl FileStats {
    /// Fraction of this file's bytes that no longer belong to any live key.
    /// A file with no records at all reports zero fragmentation.
    pub fn fragmentation(&self) -> f64 {
        let total = self.live_bytes + self.dead_bytes;
        if total == 0 {
            0.0
        } else {
            self.dead_bytes as f64 / total as f64
        }
    }

    fn add_live(&mut self, len: u64) {
        self.live_keys += 1;
        self.live_bytes += len;
    }

    fn move_to_dead(&mut self, len: u64) {
        self.live_keys = self.live_keys.saturating_sub(1);
        self.live_bytes = self.live_bytes.saturating_sub(len);
        self.dead_keys += 1;
        self.dead_bytes += len;
    }

    fn add_dead_only(&mut self, len: u64) {
        self.dead_bytes += len;
    }
}

/// The concurrent key directory. Cheap to clone (an `Arc` internally would
/// be held by callers); all mutation is lock-free per key via `DashMap`'s
/// sharding.
#[derive(Debug, Default)]
pub struct KeyDir {
    entries: DashMap<Vec<u8>, KeyDirEntry>,
    stats: DashMap<u64, FileStats>,
}

impl KeyDir {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &[u8]) -> Option<KeyDirEntry> {
        self.entries.get(key).map(|e| *e)
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// A point-in-time snapshot of every live key. Concurrent writers may
    /// add or remove keys while this runs; the result reflects some
    /// consistent state no older than the call (§4.3).
    pub fn keys(&self) -> Vec<Vec<u8>> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    /// A point-in-time snapshot of every live (key, entry) pair whose key
    /// starts with `prefix`.
    pub fn entries_with_prefix(&self, prefix: &[u8]) -> Vec<(Vec<u8>, KeyDirEntry)> {
        self.entries
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }

    /// A point-in-time snapshot of every live (key, entry) pair, for `Fold`.
    pub fn all_entries(&self) -> Vec<(Vec<u8>, KeyDirEntry)> {
        self.entries
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }

    /// Records a live write, superseding whatever entry (if any) previously
    /// existed for `key`. The superseded record's bytes become dead on its
    /// own file.
    pub fn put(&self, key: Vec<u8>, entry: KeyDirEntry) {
        self.file_stats_mut(entry.file_id, |s| s.add_live(entry.record_len));
        if let Some((_, old)) = self.entries.remove(&key) {
            self.file_stats_mut(old.file_id, |s| s.move_to_dead(old.record_len));
        }
        self.entries.insert(key, entry);
    }

    /// Records a delete: removes any live entry for `key` (marking its
    /// bytes dead) and accounts for the tombstone record itself, which
    /// holds no live data of its own.
    pub fn tombstone(&self, key: &[u8], tombstone_file_id: u64, tombstone_len: u64) -> Option<KeyDirEntry> {
        let removed = self.entries.remove(key).map(|(_, e)| e);
        if let Some(old) = removed {
            self.file_stats_mut(old.file_id, |s| s.move_to_dead(old.record_len));
        }
        self.file_stats_mut(tombstone_file_id, |s| s.add_dead_only(tombstone_len));
        removed
    }

    /// Moves `key`'s entry to `new_entry`, but only if it still points where
    /// `expected_file_id`/`expected_value_pos` say it should. Used by merge
    /// to relocate live records without clobbering a write that landed on
    /// `key` after the merge read its old value. Returns whether the
    /// relocation applied.
    pub fn relocate(
        &self,
        key: &[u8],
        expected_file_id: u64,
        expected_value_pos: u64,
        new_entry: KeyDirEntry,
    ) -> bool {
        use dashmap::mapref::entry::Entry;
        match self.entries.entry(key.to_vec()) {
            Entry::Occupied(mut occupied) => {
                let current = *occupied.get();
                if current.file_id == expected_file_id && current.value_pos == expected_value_pos {
                    occupied.insert(new_entry);
                    self.file_stats_mut(expected_file_id, |s| s.move_to_dead(current.record_len));
                    self.file_stats_mut(new_entry.file_id, |s| s.add_live(new_entry.record_len));
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(_) => false,
        }
    }

    pub fn file_stats(&self, file_id: u64) -> FileStats {
        self.stats.get(&file_id).map(|s| *s).unwrap_or_default()
    }

    pub fn all_file_stats(&self) -> Vec<(u64, FileStats)> {
        self.stats.iter().map(|e| (*e.key(), *e.value())).collect()
    }

    /// Ensures `file_id` has a (possibly all-zero) stats entry, so a freshly
    /// rotated-to file shows up in merge-trigger evaluation even before its
    /// first write.
    pub fn register_file(&self, file_id: u64) {
        self.stats.entry(file_id).or_default();
    }

    /// Drops bookkeeping for a datafile that a merge has removed.
    pub fn drop_file_stats(&self, file_id: u64) {
        self.stats.remove(&file_id);
    }

    fn file_stats_mut(&self, file_id: u64, f: impl FnOnce(&mut FileStats)) {
        let mut entry = self.stats.entry(file_id).or_default();
        f(&mut entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(file_id: u64, pos: u64, size: u32, len: u64, ts: u64) -> KeyDirEntry {
        KeyDirEntry {
            file_id,
            value_pos: pos,
            value_size: size,
            record_len: len,
            timestamp: ts,
        }
    }

    #[test]
    fn overwrite_marks_old_record_dead_and_new_record_live() {
        let kd = KeyDir::new();
        kd.put(b"k".to_vec(), entry(0, 10, 5, 20, 1));
        kd.put(b"k".to_vec(), entry(1, 10, 5, 20, 2));

        assert_eq!(kd.get(b"k").unwrap().file_id, 1);
        let file0 = kd.file_stats(0);
        assert_eq!(file0.dead_keys, 1);
        assert_eq!(file0.dead_bytes, 20);
        let file1 = kd.file_stats(1);
        assert_eq!(file1.live_keys, 1);
        assert_eq!(file1.live_bytes, 20);
    }

    #[test]
    fn tombstone_removes_key_and_marks_dead() {
        let kd = KeyDir::new();
        kd.put(b"k".to_vec(), entry(0, 10, 5, 20, 1));
        let removed = kd.tombstone(b"k", 1, 12);

        assert!(removed.is_some());
        assert!(kd.get(b"k").is_none());
        assert_eq!(kd.file_stats(0).dead_bytes, 20);
        assert_eq!(kd.file_stats(1).dead_bytes, 12);
    }

    #[test]
    fn relocate_applies_when_entry_unchanged() {
        let kd = KeyDir::new();
        kd.put(b"k".to_vec(), entry(0, 10, 5, 20, 1));
        let moved = kd.relocate(b"k", 0, 10, entry(5, 0, 5, 18, 1));
        assert!(moved);
        assert_eq!(kd.get(b"k").unwrap().file_id, 5);
        assert_eq!(kd.file_stats(0).dead_bytes, 20);
        assert_eq!(kd.file_stats(5).live_bytes, 18);
    }

    #[test]
    fn relocate_skips_when_entry_already_superseded() {
        let kd = KeyDir::new();
        kd.put(b"k".to_vec(), entry(0, 10, 5, 20, 1));
        kd.put(b"k".to_vec(), entry(1, 0, 5, 20, 2));
        let moved = kd.relocate(b"k", 0, 10, entry(5, 0, 5, 18, 1));
        assert!(!moved);
        assert_eq!(kd.get(b"k").unwrap().file_id, 1);
    }

    #[test]
    fn prefix_scan_filters_snapshot() {
        let kd = KeyDir::new();
        kd.put(b"a/1".to_vec(), entry(0, 0, 0, 10, 1));
        kd.put(b"a/2".to_vec(), entry(0, 0, 0, 10, 2));
        kd.put(b"b/1".to_vec(), entry(0, 0, 0, 10, 3));

        let mut matches: Vec<_> = kd.entries_with_prefix(b"a/").into_iter().map(|(k, _)| k).collect();
        matches.sort();
        assert_eq!(matches, vec![b"a/1".to_vec(), b"a/2".to_vec()]);
    }
}
