//! Compaction: rewriting the live records out of fragmented datafiles into
//! fresh ones, dropping dead records and reclaiming disk space (§4.5).
//!
//! Two entry points share the [`compact`] routine: [`Engine::merge`]
//! (gated by the configured trigger conditions, run against an already-open
//! engine's key directory) and the standalone [`merge`] function, which
//! rebuilds its own key directory for a directory no process currently has
//! open.

use std::collections::HashMap;
use std::path::Path;

use crate::config::{Config, MergeThresholds, MergeTriggers};
use crate::datafile::{self, DatafileReader, DatafileWriter, HintEntry, HintWriter};
use crate::engine::{recover, Inner};
use crate::error::Result;
use crate::keydir::{FileStats, KeyDir, KeyDirEntry};
use crate::lock::DirLock;
use crate::record::Record;

/// Runs a merge pass against an already-open engine, gated by
/// `Config::merge.triggers` unless `force` is set.
pub(crate) fn run(inner: &Inner, force: bool) -> Result<()> {
    let guard = inner.writer.lock();
    let active_id = guard.writer.as_ref().expect("engine is open").id();
    compact(&inner.dir, &inner.config, &inner.keydir, active_id, force)?;
    drop(guard);

    // Cached reader handles may reference datafiles that compaction just
    // removed; dropping them all is simpler and cheaper than tracking which
    // ones to evict, since they reopen lazily on next use.
    while inner.readers.pop().is_some() {}
    Ok(())
}

/// Runs a merge pass over `dir` from outside any open engine. Fails with
/// `Error::DatabaseLocked` if a live engine already holds the directory.
pub fn merge(dir: impl AsRef<Path>, config: &Config, force: bool) -> Result<()> {
    let dir = dir.as_ref();
    let _lock = DirLock::acquire(dir)?;
    let (keydir, active_id) = recover(dir, config)?;
    compact(dir, config, &keydir, active_id, force)
}

fn should_run(stats: &[(u64, FileStats)], active_id: u64, triggers: &MergeTriggers) -> bool {
    stats.iter().any(|(id, s)| {
        *id != active_id && (s.fragmentation() >= triggers.fragmentation || s.dead_bytes >= triggers.dead_bytes)
    })
}

fn meets_threshold(s: &FileStats, t: &MergeThresholds) -> bool {
    let size = s.live_bytes + s.dead_bytes;
    size > 0 && (s.fragmentation() >= t.fragmentation || s.dead_bytes >= t.dead_bytes || size <= t.small_file)
}

/// The shared compaction routine. `active_id` is never rewritten: it may
/// still be receiving writes (method form) or is simply the file future
/// writes will continue into (standalone form).
fn compact(dir: &Path, config: &Config, keydir: &KeyDir, active_id: u64, force: bool) -> Result<()> {
    let stats = keydir.all_file_stats();

    if !force && !should_run(&stats, active_id, &config.merge.triggers) {
        tracing::debug!("no datafile meets the merge trigger, skipping");
        return Ok(());
    }

    let mut candidates: Vec<u64> = stats
        .iter()
        .filter(|(id, s)| *id != active_id && (force || meets_threshold(s, &config.merge.thresholds)))
        .map(|(id, _)| *id)
        .collect();
    candidates.sort_unstable();

    if candidates.is_empty() {
        tracing::debug!("merge triggered but no datafile met the rewrite threshold");
        return Ok(());
    }

    let mut next_id = datafile::sorted_fileids(dir)?.into_iter().max().unwrap_or(active_id) + 1;
    keydir.register_file(next_id);
    let mut out_writer = DatafileWriter::create(dir, next_id)?;
    let mut out_hints = HintWriter::create(dir, next_id)?;
    let mut output_ids = vec![next_id];
    let mut readers: HashMap<u64, DatafileReader> = HashMap::new();

    for &file_id in &candidates {
        let live: Vec<(Vec<u8>, KeyDirEntry)> = keydir
            .all_entries()
            .into_iter()
            .filter(|(_, e)| e.file_id == file_id)
            .collect();

        for (key, entry) in live {
            if !readers.contains_key(&file_id) {
                readers.insert(file_id, DatafileReader::open(dir, file_id)?);
            }
            let reader = readers.get(&file_id).expect("just inserted");
            let value = reader.read_value(entry.value_pos, entry.value_size, &key)?;
            let record = Record::put(entry.timestamp, key.clone(), value);

            let encoded_len = record.encode().len() as u64;
            if out_writer.size() > 0 && out_writer.size() + encoded_len > config.max_datafile_size {
                out_writer.sync()?;
                out_hints.sync()?;
                next_id += 1;
                keydir.register_file(next_id);
                out_writer = DatafileWriter::create(dir, next_id)?;
                out_hints = HintWriter::create(dir, next_id)?;
                output_ids.push(next_id);
            }

            let pos = out_writer.append(&record)?;
            out_hints.append(&HintEntry {
                timestamp: entry.timestamp,
                key: key.clone(),
                value_pos: pos.value_pos,
                value_size: pos.value_size,
            })?;

            let new_entry = KeyDirEntry {
                file_id: out_writer.id(),
                value_pos: pos.value_pos,
                value_size: pos.value_size,
                record_len: pos.record_len,
                timestamp: entry.timestamp,
            };
            // A `false` here means a concurrent write superseded this key
            // (or deleted it) after we read its old value; the stale copy
            // we just wrote is simply never referenced by the keydir and is
            // reclaimed on the next merge.
            keydir.relocate(&key, entry.file_id, entry.value_pos, new_entry);
        }
    }

    out_writer.sync()?;
    out_hints.sync()?;

    for &file_id in &candidates {
        keydir.drop_file_stats(file_id);
        let _ = std::fs::remove_file(datafile::datafile_path(dir, file_id));
        let _ = std::fs::remove_file(datafile::hintfile_path(dir, file_id));
    }

    tracing::info!(
        rewritten_files = candidates.len(),
        output_files = output_ids.len(),
        "merge complete"
    );
    Ok(())
}
