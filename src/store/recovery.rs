use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::datafile::DataFile;
use crate::error::{Error, Result};
use crate::format::{
    self, DataFileEntry, HintFileEntry, KeyIndex, DATA_FILE_SUFFIX, DATA_HEADER_SIZE,
    HINT_FILE_SUFFIX, HINT_HEADER_SIZE, HINT_SUBHEADER_SIZE, MAX_KEY_INDEX_QTY, TMP_FILE_SUFFIX,
    TO_REMOVE_FILE_SUFFIX,
};
use crate::hasher::{hash_bytes, hash_prefix};
use crate::keydir::{KeyDirEntry, DELETED_ENTRY, NO_FILE};
use crate::tlsf::NOT_STORED;

use super::Shared;

/// A data file discovered (and kept) by the open-time directory sweep.
pub(crate) struct FoundDataFile {
    pub file_id: u16,
    pub data_path: PathBuf,
    pub hint_path: PathBuf,
}

// One record loaded from a hint or data file; key and index bytes are
// ranges into the load buffer.
struct LoadedEntry {
    hash: u64,
    ttl_deadline_sec: u32,
    deleted: bool,
    value_size: u32,
    offset: u32,
    key_start: usize,
    key_len: usize,
    index_start: usize,
    index_count: usize,
}

/// Cleans crash leftovers and lists the surviving data files, oldest first.
///
/// `.tmp` files are unfinished merge output; a `.to_remove` tag marks a
/// merged-away file whose unlink was interrupted. Both removals are safe to
/// replay because renames and unlinks are atomic.
pub(crate) fn sanitize_and_collect(dir: &Path) -> Result<Vec<FoundDataFile>> {
    let list_dir = || -> std::io::Result<Vec<PathBuf>> {
        std::fs::read_dir(dir)?
            .map(|e| e.map(|e| e.path()))
            .collect()
    };
    let entries = list_dir().map_err(|_| Error::CannotOpenStore)?;

    // First pass: apply the removal instructions.
    for path in &entries {
        match path.extension().and_then(|e| e.to_str()) {
            Some(TMP_FILE_SUFFIX) => {
                tracing::info!(path = %path.display(), "removing unfinished merge file");
                let _ = std::fs::remove_file(path);
            }
            Some(TO_REMOVE_FILE_SUFFIX) => {
                tracing::info!(path = %path.display(), "removing old merged data file");
                let _ = std::fs::remove_file(path.with_extension(DATA_FILE_SUFFIX));
                let _ = std::fs::remove_file(path.with_extension(HINT_FILE_SUFFIX));
                let _ = std::fs::remove_file(path);
            }
            _ => {}
        }
    }

    // Second pass: drop orphans and collect the data files.
    let entries = list_dir().map_err(|_| Error::CannotOpenStore)?;
    let mut found = Vec::new();
    for path in entries {
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            continue;
        };
        let file_len = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        match ext {
            HINT_FILE_SUFFIX => {
                let data = path.with_extension(DATA_FILE_SUFFIX);
                let data_len = std::fs::metadata(&data).map(|m| m.len()).unwrap_or(0);
                if data_len == 0 {
                    let _ = std::fs::remove_file(&path);
                }
            }
            DATA_FILE_SUFFIX if file_len == 0 => {
                tracing::info!(path = %path.display(), "removing zero size data file");
                let _ = std::fs::remove_file(&path);
            }
            DATA_FILE_SUFFIX => {
                let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                if let Some((file_id, _timestamp)) = format::parse_file_stem(stem) {
                    found.push(FoundDataFile {
                        file_id,
                        hint_path: path.with_extension(HINT_FILE_SUFFIX),
                        data_path: path,
                    });
                }
            }
            _ => {}
        }
    }

    found.sort_by_key(|f| f.file_id);
    Ok(found)
}

/// Loads every discovered file into the key directory and rebuilds the
/// key-part index, newest wins.
pub(crate) fn load_store(shared: &Shared, found: &[FoundDataFile]) -> Result<()> {
    for (pos, f) in found.iter().enumerate() {
        let is_last = pos + 1 == found.len();

        let file = File::options()
            .read(true)
            .open(&f.data_path)
            .map_err(|_| Error::CannotOpenStore)?;
        let data_file = Arc::new(DataFile::new(f.file_id, f.data_path.clone(), file));
        {
            let mut files = shared.files.write()?;
            files.reserve_through(f.file_id);
            files.insert(Arc::clone(&data_file));
        }

        let loaded = match load_hint_file(&f.hint_path) {
            Some(loaded) => loaded,
            None => {
                shared.hint_backfill_needed.store(true, Ordering::Release);
                load_data_file(&f.data_path, is_last)?
            }
        };

        populate_keydir(shared, &data_file, &loaded.0, &loaded.1)?;
    }
    Ok(())
}

// Parses a hint file. Any inconsistency falls back to the data file scan.
fn load_hint_file(path: &Path) -> Option<(Vec<LoadedEntry>, Vec<u8>)> {
    let mut buf = Vec::new();
    File::open(path).ok()?.read_to_end(&mut buf).ok()?;
    tracing::debug!(path = %path.display(), "loading hint file");

    let mut entries = Vec::new();
    let mut pos = 0usize;
    while pos + HINT_HEADER_SIZE + HINT_SUBHEADER_SIZE <= buf.len() {
        let header = HintFileEntry::decode(&buf[pos..]).ok()?;
        if header.key_size == 0 {
            tracing::error!(path = %path.display(), "hint entry has a corrupted null key size");
            return None;
        }
        if header.index_count as usize > MAX_KEY_INDEX_QTY {
            tracing::error!(path = %path.display(), "hint entry has too many key indexes");
            return None;
        }
        let entry_len = header.entry_len();
        if pos + entry_len > buf.len() {
            tracing::warn!(path = %path.display(), "hint file has a truncated last entry");
            return None;
        }

        let index_start = pos + HINT_HEADER_SIZE + HINT_SUBHEADER_SIZE;
        let key_start = index_start + 2 * header.index_count as usize;
        let key_len = header.key_size as usize;
        let hash = hash_bytes(&buf[key_start..key_start + key_len]);
        if hash_prefix(hash) != header.key_hash {
            tracing::warn!(path = %path.display(), "hint entry hash mismatch");
            return None;
        }

        entries.push(LoadedEntry {
            hash,
            ttl_deadline_sec: header.ttl_deadline_sec,
            deleted: header.is_tombstone(),
            value_size: header.value_size,
            offset: header.offset,
            key_start,
            key_len,
            index_start,
            index_count: header.index_count as usize,
        });
        pos += entry_len;
    }
    Some((entries, buf))
}

// Scans a data file, verifying every record checksum. The scan stops at
// the first corruption; for the last (previously active) file the tail is
// truncated back to the last verified record boundary.
fn load_data_file(path: &Path, truncate_tail: bool) -> Result<(Vec<LoadedEntry>, Vec<u8>)> {
    tracing::debug!(path = %path.display(), "loading data file");
    let file = File::open(path).map_err(|_| Error::CannotOpenStore)?;
    let mut reader = BufReader::new(file);

    let mut entries = Vec::new();
    let mut arena: Vec<u8> = Vec::new();
    let mut offset = 0u32;
    let mut record = Vec::new();
    let mut clean = true;

    loop {
        let mut header_buf = [0u8; DATA_HEADER_SIZE];
        match reader.read_exact(&mut header_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(_) => {
                clean = false;
                break;
            }
        }
        let header = DataFileEntry::decode(&header_buf)?;
        if header.key_size == 0 || header.index_count as usize > MAX_KEY_INDEX_QTY {
            tracing::warn!(
                path = %path.display(),
                offset,
                "corrupted record header, stopping the scan"
            );
            clean = false;
            break;
        }

        let record_len = header.record_len();
        record.clear();
        record.extend_from_slice(&header_buf);
        record.resize(record_len, 0);
        if reader.read_exact(&mut record[DATA_HEADER_SIZE..]).is_err() {
            tracing::warn!(
                path = %path.display(),
                offset,
                "record truncated mid-write, stopping the scan"
            );
            clean = false;
            break;
        }
        if !format::verify_record_crc(&record) {
            tracing::warn!(
                path = %path.display(),
                offset,
                "record checksum mismatch, stopping the scan"
            );
            clean = false;
            break;
        }

        let index_count = if header.is_tombstone() {
            0
        } else {
            header.index_count as usize
        };
        let payload = &record[DATA_HEADER_SIZE..DATA_HEADER_SIZE + 2 * index_count + header.key_size as usize];
        let index_start = arena.len();
        arena.extend_from_slice(payload);
        let key_start = index_start + 2 * index_count;
        let key_len = header.key_size as usize;

        entries.push(LoadedEntry {
            hash: hash_bytes(&arena[key_start..key_start + key_len]),
            ttl_deadline_sec: header.ttl_deadline_sec,
            deleted: header.is_tombstone(),
            value_size: header.value_size,
            offset,
            key_start,
            key_len,
            index_start,
            index_count,
        });
        offset += record_len as u32;
    }

    if !clean && truncate_tail {
        tracing::warn!(
            path = %path.display(),
            valid_bytes = offset,
            "truncating the corrupted tail of the last data file"
        );
        if let Ok(file) = File::options().write(true).open(path) {
            let _ = file.set_len(u64::from(offset));
        }
    }
    Ok((entries, arena))
}

// Applies the loaded records to the key directory, the key-part index and
// the per-file statistics, newest wins.
fn populate_keydir(
    shared: &Shared,
    data_file: &Arc<DataFile>,
    entries: &[LoadedEntry],
    arena: &[u8],
) -> Result<()> {
    let now = shared.now_sec.load(Ordering::Acquire);

    for e in entries {
        let key = &arena[e.key_start..e.key_start + e.key_len];
        let indexes: Vec<KeyIndex> =
            format::decode_key_indexes(&arena[e.index_start..e.index_start + 2 * e.index_count]);

        if e.deleted {
            let tomb_bytes = (DATA_HEADER_SIZE + e.key_len) as u32;
            if let Some(existing) = shared.keydir.find(e.hash, key) {
                // A live older version exists: it becomes dead and the
                // tombstone takes its place in the directory.
                if let Some(old_file) = shared.files.read().unwrap().get(existing.file_id) {
                    old_file.add_dead(live_record_len(&existing, e.key_len));
                }
                let tomb = KeyDirEntry {
                    ttl_deadline_sec: 0,
                    value_size: DELETED_ENTRY,
                    cache_loc: NOT_STORED,
                    file_offset: e.offset,
                    file_id: data_file.file_id,
                    key_size: e.key_len as u16,
                    index_count: 0,
                    change_counter: e.offset as u8,
                };
                shared.keydir.insert_entry(e.hash, key, &[], tomb)?;
            } else {
                data_file.add_dead(tomb_bytes);
            }
            data_file.add_tombstone(tomb_bytes);
            data_file.add_entry(tomb_bytes);
        } else if e.ttl_deadline_sec == 0 || e.ttl_deadline_sec > now {
            let record_bytes =
                (DATA_HEADER_SIZE + 2 * e.index_count + e.key_len) as u32 + e.value_size;
            let entry = KeyDirEntry {
                ttl_deadline_sec: e.ttl_deadline_sec,
                value_size: e.value_size,
                cache_loc: NOT_STORED,
                file_offset: e.offset,
                file_id: data_file.file_id,
                key_size: e.key_len as u16,
                index_count: e.index_count as u8,
                change_counter: e.offset as u8,
            };
            let old = shared.keydir.insert_entry(e.hash, key, &indexes, entry)?;
            if let Some(old) = &old {
                if old.file_id != NO_FILE {
                    if let Some(old_file) = shared.files.read().unwrap().get(old.file_id) {
                        old_file.add_dead(super::old_record_len(e.key_len, old));
                    }
                }
            }
            data_file.add_entry(record_bytes);

            // Rebuild the key-part index so queries survive a restart.
            for ki in &indexes {
                let start = ki.start_idx as usize;
                let end = start + ki.size as usize;
                if ki.size == 0 || end > key.len() {
                    continue;
                }
                if let Err(err) = shared
                    .index
                    .write()?
                    .insert_index(&key[start..end], hash_prefix(e.hash))
                {
                    tracing::warn!(error = %err, "index rebuild entry skipped");
                }
            }
        } else {
            // Expired TTL: the record is dead on arrival.
            let record_bytes =
                (DATA_HEADER_SIZE + 2 * e.index_count + e.key_len) as u32 + e.value_size;
            data_file.add_dead(record_bytes);
            data_file.add_entry(record_bytes);
        }
    }
    Ok(())
}

fn live_record_len(entry: &KeyDirEntry, key_len: usize) -> u32 {
    let value = if entry.value_size == DELETED_ENTRY {
        0
    } else {
        entry.value_size
    };
    (DATA_HEADER_SIZE + 2 * entry.index_count as usize + key_len) as u32 + value
}
