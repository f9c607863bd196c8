//! The storage engine itself: the `Open`/`Put`/`Get`/`Delete`/... surface
//! described in §4, built on the datafile and key directory primitives.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;

use crate::config::{Config, SyncStrategy};
use crate::datafile::{self, AppendPos, DatafileScanner, DatafileWriter, ReaderCache};
use crate::error::{Error, Result};
use crate::keydir::{KeyDir, KeyDirEntry};
use crate::lock::DirLock;
use crate::merge;
use crate::record::Record;

/// An open, embedded key-value store rooted at a single directory.
///
/// Cheaply cloneable: every clone shares the same underlying state (key
/// directory, active writer, directory lock) and may be used from any
/// thread.
#[derive(Clone)]
pub struct Engine {
    pub(crate) inner: Arc<Inner>,
}

pub(crate) struct Inner {
    pub(crate) dir: PathBuf,
    pub(crate) config: Config,
    pub(crate) keydir: KeyDir,
    pub(crate) writer: Mutex<ActiveWriter>,
    pub(crate) readers: ArrayQueue<ReaderCache>,
    closed: AtomicBool,
}

/// The active datafile's writer, the directory lock, and the last-sync
/// clock, all guarded by the same mutex: `Close()` takes this lock to flush,
/// drop the writer's file handle, and release the directory lock together
/// (§5: "`Put`, `Delete`, `Sync`, `Close`, and rotation take the writer
/// lock"). Both fields become `None` once the engine is closed.
pub(crate) struct ActiveWriter {
    pub(crate) writer: Option<DatafileWriter>,
    pub(crate) lock: Option<DirLock>,
    pub(crate) last_sync: Instant,
}

impl Drop for Inner {
    /// Best-effort flush on the last clone's drop. Errors are logged rather
    /// than propagated: `Drop` cannot return a `Result`, and an explicit
    /// `Engine::close()`/`Engine::sync()` remains the only way to observe
    /// whether the flush actually succeeded.
    fn drop(&mut self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let guard = self.writer.lock();
        if let Some(writer) = guard.writer.as_ref() {
            if let Err(e) = writer.sync() {
                tracing::error!(dir = %self.dir.display(), error = %e, "flush on drop failed");
            }
        }
    }
}

impl Engine {
    /// Opens (creating if necessary) the store rooted at `path`.
    ///
    /// Replays every datafile's records into a fresh key directory,
    /// preferring each closed datafile's hint file when present and valid
    /// and falling back to a full scan otherwise. The active (highest-id)
    /// datafile is always scanned in full, since any hint file for it would
    /// be stale, and any trailing partial record left by a prior crash is
    /// truncated away before new writes are accepted.
    #[tracing::instrument(skip(config), fields(dir = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>, config: Config) -> Result<Self> {
        let dir = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let lock = DirLock::acquire(&dir)?;
        let (keydir, active_id) = recover(&dir, &config)?;
        let writer = DatafileWriter::create(&dir, active_id)?;
        let concurrency = config.concurrency.max(1);

        let inner = Arc::new(Inner {
            dir,
            config,
            keydir,
            writer: Mutex::new(ActiveWriter {
                writer: Some(writer),
                lock: Some(lock),
                last_sync: Instant::now(),
            }),
            readers: ArrayQueue::new(concurrency),
            closed: AtomicBool::new(false),
        });

        let engine = Self { inner };
        if engine.inner.config.merge.auto_merge_on_open {
            engine.merge()?;
        }
        Ok(engine)
    }

    /// Inserts or overwrites the value for `key`.
    pub fn put(&self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Result<()> {
        let key = key.into();
        let value = value.into();
        self.check_open()?;
        self.check_bounds(&key, Some(&value))?;

        let record = Record::put(now_micros(), key.clone(), value);
        let (file_id, pos) = self.append(&record)?;
        self.inner.keydir.put(
            key,
            KeyDirEntry {
                file_id,
                value_pos: pos.value_pos,
                value_size: pos.value_size,
                record_len: pos.record_len,
                timestamp: record.timestamp,
            },
        );
        Ok(())
    }

    /// Looks up the current value for `key`.
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.check_open()?;
        let entry = self.inner.keydir.get(key).ok_or(Error::KeyNotFound)?;
        self.read_value(key, entry)
    }

    /// Reports whether `key` currently has a live value, without reading it.
    pub fn has(&self, key: &[u8]) -> Result<bool> {
        self.check_open()?;
        Ok(self.inner.keydir.contains(key))
    }

    /// Removes `key`. A delete of a key with no live value is a no-op and
    /// returns success.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.check_open()?;
        if !self.inner.keydir.contains(key) {
            return Ok(());
        }
        let record = Record::tombstone(now_micros(), key.to_vec());
        let (file_id, pos) = self.append(&record)?;
        self.inner.keydir.tombstone(key, file_id, pos.record_len);
        Ok(())
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.inner.keydir.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.keydir.is_empty()
    }

    /// A snapshot of every live key, in no particular order.
    pub fn keys(&self) -> Vec<Vec<u8>> {
        self.inner.keydir.keys()
    }

    /// Invokes `f(key, value)` for every live key starting with `prefix`, in
    /// a point-in-time snapshot. Aborts and propagates the first error `f`
    /// returns.
    pub fn scan(&self, prefix: &[u8], mut f: impl FnMut(&[u8], &[u8]) -> Result<()>) -> Result<()> {
        self.check_open()?;
        for (key, entry) in self.inner.keydir.entries_with_prefix(prefix) {
            let value = self.read_value(&key, entry)?;
            f(&key, &value)?;
        }
        Ok(())
    }

    /// Folds `f` over a point-in-time snapshot of every live `(key, value)`
    /// pair. Aborts and propagates the first error `f` returns.
    pub fn fold<B>(&self, init: B, mut f: impl FnMut(B, &[u8], &[u8]) -> Result<B>) -> Result<B> {
        self.check_open()?;
        let mut acc = init;
        for (key, entry) in self.inner.keydir.all_entries() {
            let value = self.read_value(&key, entry)?;
            acc = f(acc, &key, &value)?;
        }
        Ok(acc)
    }

    /// Flushes the active datafile to durable storage, regardless of the
    /// configured [`SyncStrategy`].
    pub fn sync(&self) -> Result<()> {
        self.check_open()?;
        let mut guard = self.inner.writer.lock();
        guard.writer.as_ref().expect("engine is open").sync()?;
        guard.last_sync = Instant::now();
        Ok(())
    }

    /// Runs a merge pass over this directory if the configured trigger
    /// conditions are met, compacting dead records out of older datafiles.
    #[tracing::instrument(skip(self))]
    pub fn merge(&self) -> Result<()> {
        self.check_open()?;
        merge::run(&self.inner, false)
    }

    /// Marks the engine closed, flushes the active datafile, drops its file
    /// handle, and releases the directory lock, so that a subsequent
    /// `Engine::open` on the same directory (even from within this process)
    /// succeeds. Further operations on this or any clone return
    /// `Error::Closed`. A second `Close` is a no-op.
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut guard = self.inner.writer.lock();
        let result = guard.writer.as_ref().expect("engine is open").sync();
        guard.writer = None;
        guard.lock = None;
        result
    }

    fn check_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }

    fn check_bounds(&self, key: &[u8], value: Option<&[u8]>) -> Result<()> {
        let max_key = self.inner.config.max_key_size as usize;
        if key.len() > max_key {
            return Err(Error::KeyTooLarge {
                len: key.len(),
                max: max_key,
            });
        }
        if let Some(value) = value {
            let max_value = self.inner.config.max_value_size as usize;
            if value.len() > max_value {
                return Err(Error::ValueTooLarge {
                    len: value.len(),
                    max: max_value,
                });
            }
        }
        Ok(())
    }

    /// Appends `record` to the active datafile, rotating to a new one first
    /// if it would not fit, and applies the configured sync strategy.
    /// Returns the id of the file it was actually written to.
    fn append(&self, record: &Record) -> Result<(u64, AppendPos)> {
        let mut guard = self.inner.writer.lock();
        let encoded_len = record.encode().len() as u64;
        {
            let writer = guard.writer.as_mut().expect("engine is open");
            if writer.size() > 0 && writer.size() + encoded_len > self.inner.config.max_datafile_size {
                writer.sync()?;
                let next_id = writer.id() + 1;
                guard.writer = Some(DatafileWriter::create(&self.inner.dir, next_id)?);
                self.inner.keydir.register_file(next_id);
            }
        }

        let writer = guard.writer.as_mut().expect("engine is open");
        let file_id = writer.id();
        let pos = writer.append(record)?;

        match self.inner.config.sync {
            SyncStrategy::None => {}
            SyncStrategy::Always => {
                guard.writer.as_ref().expect("engine is open").sync()?;
                guard.last_sync = Instant::now();
            }
            SyncStrategy::Interval(interval) => {
                if guard.last_sync.elapsed() >= interval {
                    guard.writer.as_ref().expect("engine is open").sync()?;
                    guard.last_sync = Instant::now();
                }
            }
        }

        Ok((file_id, pos))
    }

    fn read_value(&self, key: &[u8], entry: KeyDirEntry) -> Result<Vec<u8>> {
        self.with_reader(|cache| {
            let reader = cache.get(&self.inner.dir, entry.file_id)?;
            reader.read_value(entry.value_pos, entry.value_size, key)
        })
    }

    fn with_reader<T>(&self, f: impl FnOnce(&mut ReaderCache) -> Result<T>) -> Result<T> {
        let mut cache = self.inner.readers.pop().unwrap_or_default();
        let result = f(&mut cache);
        let _ = self.inner.readers.push(cache);
        result
    }
}

/// Rebuilds a key directory from whatever is on disk in `dir`, returning it
/// along with the id of the datafile that should be treated as active (the
/// highest one present, or `0` for a freshly created directory). Shared by
/// [`Engine::open`] and the standalone [`crate::merge::merge`], which needs
/// its own keydir since it runs without a live engine.
pub(crate) fn recover(dir: &Path, config: &Config) -> Result<(KeyDir, u64)> {
    let keydir = KeyDir::new();
    let ids = datafile::sorted_fileids(dir)?;
    let active_id = match ids.last() {
        Some(&id) => id,
        None => {
            DatafileWriter::create(dir, 0)?;
            0
        }
    };

    for &id in &ids {
        keydir.register_file(id);
        if id == active_id {
            recover_active_file(dir, id, config, &keydir)?;
        } else if let Some(hints) =
            datafile::read_hintfile(dir, id, config.max_key_size).unwrap_or_else(|e| {
                tracing::warn!(file_id = id, error = %e, "hint file unreadable, falling back to full scan");
                None
            })
        {
            for hint in hints {
                let record_len =
                    crate::record::HEADER_SIZE as u64 + hint.key.len() as u64 + hint.value_size as u64;
                keydir.put(
                    hint.key,
                    KeyDirEntry {
                        file_id: id,
                        value_pos: hint.value_pos,
                        value_size: hint.value_size,
                        record_len,
                        timestamp: hint.timestamp,
                    },
                );
            }
        } else {
            recover_closed_file(dir, id, config, &keydir)?;
        }
    }

    Ok((keydir, active_id))
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Scans the active datafile in full, populating `keydir`, and truncates
/// away any trailing partial record a prior crash left behind so future
/// appends start from a clean boundary.
fn recover_active_file(
    dir: &Path,
    id: u64,
    config: &Config,
    keydir: &KeyDir,
) -> Result<()> {
    let path = datafile::datafile_path(dir, id);
    let file = std::fs::File::open(&path)?;
    let on_disk_len = file.metadata()?.len();
    let mut scanner = DatafileScanner::new(std::io::BufReader::new(file), config.max_key_size, config.max_value_size);

    loop {
        match scanner.next_record()? {
            Some((record, start, len)) => apply_recovered_record(keydir, id, record, start, len),
            None => break,
        }
    }

    let valid_end = scanner.pos();
    if valid_end < on_disk_len {
        tracing::warn!(
            file_id = id,
            discarded = on_disk_len - valid_end,
            "truncating partial record left by a prior crash"
        );
        let file = std::fs::OpenOptions::new().write(true).open(&path)?;
        file.set_len(valid_end)?;
    }
    Ok(())
}

/// Scans a closed datafile that had no usable hint file.
fn recover_closed_file(dir: &Path, id: u64, config: &Config, keydir: &KeyDir) -> Result<()> {
    let path = datafile::datafile_path(dir, id);
    let file = std::fs::File::open(&path)?;
    let mut scanner = DatafileScanner::new(std::io::BufReader::new(file), config.max_key_size, config.max_value_size);
    loop {
        match scanner.next_record()? {
            Some((record, start, len)) => apply_recovered_record(keydir, id, record, start, len),
            None => break,
        }
    }
    Ok(())
}

fn apply_recovered_record(keydir: &KeyDir, file_id: u64, record: Record, start: u64, len: u64) {
    if record.is_tombstone() {
        keydir.tombstone(&record.key, file_id, len);
    } else {
        let value_pos = start + crate::record::HEADER_SIZE as u64 + record.key.len() as u64;
        let value_size = record.value.as_ref().map_or(0, |v| v.len() as u32);
        keydir.put(
            record.key.clone(),
            KeyDirEntry {
                file_id,
                value_pos,
                value_size,
                record_len: len,
                timestamp: record.timestamp,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn open(dir: &Path) -> Engine {
        Config::default().open(dir).unwrap()
    }

    #[test]
    fn put_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open(dir.path());
        engine.put(b"k".to_vec(), b"v".to_vec()).unwrap();
        assert_eq!(engine.get(b"k").unwrap(), b"v");
    }

    #[test]
    fn get_on_missing_key_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open(dir.path());
        assert!(matches!(engine.get(b"missing"), Err(Error::KeyNotFound)));
    }

    #[test]
    fn delete_removes_key() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open(dir.path());
        engine.put(b"k".to_vec(), b"v".to_vec()).unwrap();
        engine.delete(b"k").unwrap();
        assert!(matches!(engine.get(b"k"), Err(Error::KeyNotFound)));
        engine.delete(b"k").unwrap();
    }

    #[test]
    fn reopen_recovers_state() {
        let dir = tempfile::tempdir().unwrap();
        {
            let engine = open(dir.path());
            engine.put(b"a".to_vec(), b"1".to_vec()).unwrap();
            engine.put(b"b".to_vec(), b"2".to_vec()).unwrap();
            engine.delete(b"a").unwrap();
            engine.sync().unwrap();
        }
        let engine = open(dir.path());
        assert!(matches!(engine.get(b"a"), Err(Error::KeyNotFound)));
        assert_eq!(engine.get(b"b").unwrap(), b"2");
        assert_eq!(engine.len(), 1);
    }

    #[test]
    fn second_open_of_same_directory_is_locked() {
        let dir = tempfile::tempdir().unwrap();
        let _engine = open(dir.path());
        let second = Config::default().open(dir.path());
        assert!(matches!(second, Err(Error::DatabaseLocked)));
    }

    #[test]
    fn oversized_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open(dir.path());
        let key = vec![0u8; 1000];
        assert!(matches!(
            engine.put(key, b"v".to_vec()),
            Err(Error::KeyTooLarge { .. })
        ));
    }

    #[test]
    fn scan_returns_only_matching_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open(dir.path());
        engine.put(b"user/1".to_vec(), b"a".to_vec()).unwrap();
        engine.put(b"user/2".to_vec(), b"b".to_vec()).unwrap();
        engine.put(b"order/1".to_vec(), b"c".to_vec()).unwrap();

        let mut results = Vec::new();
        engine
            .scan(b"user/", |k, v| {
                results.push((k.to_vec(), v.to_vec()));
                Ok(())
            })
            .unwrap();
        results.sort();
        assert_eq!(
            results,
            vec![
                (b"user/1".to_vec(), b"a".to_vec()),
                (b"user/2".to_vec(), b"b".to_vec()),
            ]
        );
    }

    #[test]
    fn fold_short_circuits_on_first_error() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open(dir.path());
        engine.put(b"a".to_vec(), b"1".to_vec()).unwrap();
        engine.put(b"b".to_vec(), b"2".to_vec()).unwrap();

        let mut visited = 0;
        let result = engine.fold(0usize, |acc, _k, _v| {
            visited += 1;
            if visited == 1 {
                Err(Error::KeyNotFound)
            } else {
                Ok(acc + 1)
            }
        });
        assert!(result.is_err());
        assert_eq!(visited, 1);
    }

    #[test]
    fn closed_engine_rejects_operations() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open(dir.path());
        engine.put(b"k".to_vec(), b"v".to_vec()).unwrap();
        engine.close().unwrap();
        assert!(matches!(engine.get(b"k"), Err(Error::Closed)));
        assert!(matches!(engine.put(b"k2".to_vec(), b"v".to_vec()), Err(Error::Closed)));
    }
}
