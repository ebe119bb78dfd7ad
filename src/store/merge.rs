use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::datafile::DataFile;
use crate::error::{Error, Result};
use crate::format::{
    self, DataFileEntry, HintFileEntry, DATA_HEADER_SIZE, HINT_HEADER_SIZE, HINT_SUBHEADER_SIZE,
    MAX_KEY_INDEX_QTY, TMP_FILE_SUFFIX, TO_REMOVE_FILE_SUFFIX,
};
use crate::hasher::{hash_bytes, hash_prefix};

use super::Shared;

// A key directory relocation recorded while copying one live record.
struct KeyDirPatch {
    key_hash: u32,
    old_offset: u32,
    new_offset: u32,
    new_file_id: u16,
}

struct MergeFileInfo {
    file_id: u16,
    patches: Vec<KeyDirPatch>,
}

// A tombstone record dropped by the retention rule; its directory entry is
// detached from disk after the swap commits.
struct DroppedTombstone {
    key_hash: u32,
    file_id: u16,
    offset: u32,
}

pub(crate) fn merge_thread_entry(shared: &Arc<Shared>) {
    tracing::debug!("merge thread started");
    loop {
        let period = {
            let config = shared.config.lock().unwrap();
            Duration::from_millis(u64::from(config.merge_cycle_period_ms))
        };
        if !shared.merge_ctl.wait_cycle(period) {
            break;
        }
        run_merge_cycle(shared);
        shared.merge_ctl.set_done();
    }
    tracing::debug!("merge thread stopped");
}

fn run_merge_cycle(shared: &Shared) {
    shared
        .counters
        .merge_cycle_qty
        .fetch_add(1, Ordering::Relaxed);
    let config = shared.config.lock().unwrap().clone();

    let mut selected = Vec::new();
    if is_worth_merging(
        shared,
        config.merge_trigger_data_file_fragmentation_percentage,
        config.merge_trigger_data_file_dead_byte_threshold,
    ) {
        selected = select_data_files(
            shared,
            config.merge_select_data_file_fragmentation_percentage,
            config.merge_select_data_file_dead_byte_threshold,
            config.merge_select_data_file_small_size_threshold,
        );
    }

    if !selected.is_empty() {
        // Switching the active file first makes the previous active file
        // mergeable (it was potentially selected) and keeps the output
        // file ids strictly newer than every merged record.
        let rotated = match shared.active.write() {
            Ok(mut active) => shared.rotate_active_file(&mut active),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = rotated {
            tracing::error!(error = %e, "merge aborted: cannot seal the active file");
            return;
        }

        let mut infos: Vec<MergeFileInfo> = selected
            .into_iter()
            .map(|file_id| MergeFileInfo {
                file_id,
                patches: Vec::new(),
            })
            .collect();

        let merged = create_merged_files(shared, &mut infos, config.data_file_max_bytes)
            .and_then(|dropped| replace_data_files(shared, &infos, &dropped));
        match merged {
            Ok(()) => {
                shared
                    .counters
                    .merge_cycle_with_merge_qty
                    .fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                tracing::error!(error = %e, "merge failed, keeping the original data files");
            }
        }
    }

    // Once per opening: write the hint files that were missing at load.
    if shared.hint_backfill_needed.swap(false, Ordering::AcqRel) {
        backfill_hint_files(shared);
    }
}

fn is_worth_merging(shared: &Shared, fragmentation_percentage: u32, dead_byte_threshold: u32) -> bool {
    let files = shared.files.read().unwrap();
    for file in files.iter_live() {
        let dead = u64::from(file.dead_bytes.load(Ordering::Relaxed));
        let bytes = u64::from(file.bytes.load(Ordering::Relaxed));
        if dead * 100 > bytes * u64::from(fragmentation_percentage) {
            tracing::debug!(file_id = file.file_id, "merge triggered by fragmentation ratio");
            return true;
        }
        if dead > u64::from(dead_byte_threshold) {
            tracing::debug!(file_id = file.file_id, "merge triggered by dead byte volume");
            return true;
        }
    }
    false
}

fn select_data_files(
    shared: &Shared,
    fragmentation_percentage: u32,
    dead_byte_threshold: u32,
    small_size_threshold: u32,
) -> Vec<u16> {
    let files = shared.files.read().unwrap();
    let mut selected = Vec::new();
    for file in files.iter_live() {
        let dead = u64::from(file.dead_bytes.load(Ordering::Relaxed));
        let bytes = u64::from(file.bytes.load(Ordering::Relaxed));
        let include = dead * 100 > bytes * u64::from(fragmentation_percentage)
            || dead > u64::from(dead_byte_threshold)
            || bytes < u64::from(small_size_threshold);
        tracing::debug!(
            file_id = file.file_id,
            include,
            "merge selection evaluated"
        );
        if include {
            selected.push(file.file_id);
        }
    }
    selected.sort_unstable();
    selected
}

// One compacted output file being written, tracked with its statistics so
// the final descriptor can be installed atomically after the rename.
struct OutputFile {
    file_id: u16,
    data_path: PathBuf,
    hint_path: PathBuf,
    data_tmp: PathBuf,
    hint_tmp: PathBuf,
    data_writer: BufWriter<File>,
    hint_writer: BufWriter<File>,
    write_offset: u32,
    bytes: u32,
    entries: u32,
    tomb_bytes: u32,
    tomb_entries: u32,
}

impl OutputFile {
    fn create(shared: &Shared) -> Result<Self> {
        let file_id = shared.files.write()?.alloc_file_id()?;
        let timestamp = Shared::wall_clock_secs();
        let dir = shared.directory.read()?.clone();
        let data_path = dir.join(format::data_file_name(file_id, timestamp));
        let hint_path = dir.join(format::hint_file_name(file_id, timestamp));
        let data_tmp = tmp_path(&data_path);
        let hint_tmp = tmp_path(&hint_path);
        let data_writer = BufWriter::new(File::create(&data_tmp)?);
        let hint_writer = BufWriter::new(File::create(&hint_tmp)?);
        shared
            .counters
            .data_file_creation_qty
            .fetch_add(1, Ordering::Relaxed);
        Ok(Self {
            file_id,
            data_path,
            hint_path,
            data_tmp,
            hint_tmp,
            data_writer,
            hint_writer,
            write_offset: 0,
            bytes: 0,
            entries: 0,
            tomb_bytes: 0,
            tomb_entries: 0,
        })
    }

    // Flush, sync, atomically rename, then publish the descriptor. Only
    // after this point do the copied records exist for crash recovery.
    fn finalize(mut self, shared: &Shared) -> Result<()> {
        self.data_writer.flush()?;
        self.data_writer.get_ref().sync_all()?;
        self.hint_writer.flush()?;
        self.hint_writer.get_ref().sync_all()?;
        std::fs::rename(&self.data_tmp, &self.data_path)?;
        std::fs::rename(&self.hint_tmp, &self.hint_path)?;
        tracing::debug!(path = %self.data_path.display(), "finished compacted data file");

        let file = File::options().read(true).open(&self.data_path)?;
        let data_file = DataFile::new(self.file_id, self.data_path.clone(), file);
        data_file.bytes.store(self.bytes, Ordering::Relaxed);
        data_file.entries.store(self.entries, Ordering::Relaxed);
        data_file
            .tomb_bytes
            .store(self.tomb_bytes, Ordering::Relaxed);
        data_file
            .tomb_entries
            .store(self.tomb_entries, Ordering::Relaxed);
        shared.files.write()?.insert(Arc::new(data_file));
        Ok(())
    }
}

// Streams every selected file and copies the records the key directory
// still references into bounded compacted files, emitting hint entries
// along the way. Tombstones survive only while an older sealed file
// outside the merge set could still hold a stale version of their key.
fn create_merged_files(
    shared: &Shared,
    infos: &mut [MergeFileInfo],
    data_file_max_bytes: u32,
) -> Result<Vec<DroppedTombstone>> {
    let selected_ids: HashSet<u16> = infos.iter().map(|i| i.file_id).collect();
    let active_id = shared.active.read().unwrap().file_id;
    let outside_ids: Vec<u16> = shared
        .files
        .read()
        .unwrap()
        .iter_live()
        .map(|f| f.file_id)
        .filter(|id| !selected_ids.contains(id) && *id != active_id)
        .collect();

    let mut dropped = Vec::new();
    let mut output: Option<OutputFile> = None;
    let mut scanned_bytes = 0u64;
    let mut written_bytes = 0u64;
    let mut tmp_files: Vec<PathBuf> = Vec::new();

    let result = (|| -> Result<()> {
        for info in infos.iter_mut() {
            let source = shared
                .files
                .read()?
                .get(info.file_id)
                .ok_or(Error::BadDiskAccess)?;
            let mut reader = BufReader::new(File::open(&source.path)?);
            let mut read_offset = 0u32;
            let mut payload = Vec::new();

            loop {
                let mut header_buf = [0u8; DATA_HEADER_SIZE];
                match reader.read_exact(&mut header_buf) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                    Err(e) => return Err(e.into()),
                }
                let header = DataFileEntry::decode(&header_buf)?;
                if header.key_size == 0 || header.index_count as usize > MAX_KEY_INDEX_QTY {
                    tracing::error!(
                        file_id = info.file_id,
                        offset = read_offset,
                        "corrupted record met while merging, stopping this file"
                    );
                    break;
                }

                let record_len = header.record_len();
                payload.resize(record_len - DATA_HEADER_SIZE, 0);
                reader.read_exact(&mut payload)?;

                let index_bytes = if header.is_tombstone() {
                    0
                } else {
                    2 * header.index_count as usize
                };
                let key = &payload[index_bytes..index_bytes + header.key_size as usize];
                let hash = hash_bytes(key);

                // Only records the directory still points at are copied.
                let live = shared.keydir.find(hash, key).is_some_and(|entry| {
                    entry.file_id == info.file_id && entry.file_offset == read_offset
                });
                if !live {
                    read_offset += record_len as u32;
                    continue;
                }

                if header.is_tombstone() {
                    let retain = outside_ids.iter().any(|&id| id < info.file_id);
                    if !retain {
                        // No older sealed file outside the merge could
                        // resurrect this key: the tombstone can die too.
                        dropped.push(DroppedTombstone {
                            key_hash: hash_prefix(hash),
                            file_id: info.file_id,
                            offset: read_offset,
                        });
                        read_offset += record_len as u32;
                        continue;
                    }
                }

                // Rotate the output file at the size bound.
                if output
                    .as_ref()
                    .is_some_and(|o| {
                        o.write_offset > 0
                            && o.write_offset as usize + record_len > data_file_max_bytes as usize
                    })
                {
                    output.take().unwrap().finalize(shared)?;
                }
                if output.is_none() {
                    let out = OutputFile::create(shared)?;
                    tmp_files.push(out.data_tmp.clone());
                    tmp_files.push(out.hint_tmp.clone());
                    output = Some(out);
                }
                let out = output.as_mut().unwrap();

                out.data_writer.write_all(&header_buf)?;
                out.data_writer.write_all(&payload)?;

                let hint = HintFileEntry {
                    key_hash: hash_prefix(hash),
                    ttl_deadline_sec: header.ttl_deadline_sec,
                    offset: out.write_offset,
                    value_size: header.value_size,
                    key_size: header.key_size,
                    index_count: if header.is_tombstone() {
                        0
                    } else {
                        header.index_count
                    },
                    flags: header.flags,
                };
                let mut hint_buf = [0u8; HINT_HEADER_SIZE + HINT_SUBHEADER_SIZE];
                hint.encode(&mut hint_buf);
                out.hint_writer.write_all(&hint_buf)?;
                out.hint_writer
                    .write_all(&payload[..index_bytes + header.key_size as usize])?;

                info.patches.push(KeyDirPatch {
                    key_hash: hash_prefix(hash),
                    old_offset: read_offset,
                    new_offset: out.write_offset,
                    new_file_id: out.file_id,
                });
                out.bytes += record_len as u32;
                out.entries += 1;
                if header.is_tombstone() {
                    out.tomb_bytes += record_len as u32;
                    out.tomb_entries += 1;
                }
                out.write_offset += record_len as u32;
                written_bytes += record_len as u64;
                read_offset += record_len as u32;
            }

            scanned_bytes += u64::from(read_offset);
        }

        if let Some(out) = output.take() {
            out.finalize(shared)?;
        }
        Ok(())
    })();

    if let Err(e) = result {
        // Partial outputs are discarded; the originals stay untouched and
        // the next cycle retries.
        for tmp in &tmp_files {
            let _ = std::fs::remove_file(tmp);
        }
        return Err(e);
    }

    // Tag the source files for removal; replayed by the open-time
    // sanitizer if a crash interrupts the swap below.
    {
        let files = shared.files.read().unwrap();
        for info in infos.iter() {
            if let Some(file) = files.get(info.file_id) {
                let tag = file.path.with_extension(TO_REMOVE_FILE_SUFFIX);
                let _ = File::create(tag);
            }
        }
    }

    shared
        .counters
        .merge_gained_bytes
        .fetch_add(scanned_bytes.saturating_sub(written_bytes), Ordering::Relaxed);
    Ok(dropped)
}

// Points the key directory at the compacted records, then unlinks the
// merged-away files.
fn replace_data_files(
    shared: &Shared,
    infos: &[MergeFileInfo],
    dropped: &[DroppedTombstone],
) -> Result<()> {
    let mut new_file_ids: HashSet<u16> = HashSet::new();
    for info in infos {
        for patch in &info.patches {
            new_file_ids.insert(patch.new_file_id);
            shared.keydir.update_merged_location(
                patch.key_hash,
                info.file_id,
                patch.old_offset,
                patch.new_file_id,
                patch.new_offset,
            );
        }
    }
    for tomb in dropped {
        shared
            .keydir
            .detach_dropped_tombstone(tomb.key_hash, tomb.file_id, tomb.offset);
    }

    for info in infos {
        let removed = shared.files.write()?.remove(info.file_id);
        if let Some(file) = removed {
            // Order matters for crash robustness: data first, then hint,
            // then the removal tag.
            let _ = std::fs::remove_file(&file.path);
            let _ = std::fs::remove_file(file.path.with_extension(format::HINT_FILE_SUFFIX));
            let _ = std::fs::remove_file(file.path.with_extension(TO_REMOVE_FILE_SUFFIX));
        }
    }

    shared.counters.merge_gained_data_file_qty.fetch_add(
        (infos.len() as u64).saturating_sub(new_file_ids.len() as u64),
        Ordering::Relaxed,
    );
    Ok(())
}

// Writes the hint sidecars missing after an open that had to scan data
// files directly.
fn backfill_hint_files(shared: &Shared) {
    let active_id = shared.active.read().unwrap().file_id;
    let sealed: Vec<Arc<DataFile>> = shared
        .files
        .read()
        .unwrap()
        .iter_live()
        .filter(|f| f.file_id != active_id)
        .map(Arc::clone)
        .collect();

    for file in sealed {
        let hint_path = file.path.with_extension(format::HINT_FILE_SUFFIX);
        if hint_path.exists() {
            continue;
        }
        match create_hint_file(&file.path, &hint_path) {
            Ok(()) => {
                shared
                    .counters
                    .hint_file_created_qty
                    .fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    path = %file.path.display(),
                    "hint file creation failed"
                );
            }
        }
    }
}

/// Builds the hint sidecar of a sealed data file by streaming its records.
pub(crate) fn create_hint_file(data_path: &Path, hint_path: &Path) -> Result<()> {
    tracing::info!(path = %data_path.display(), "creating hint file");
    let mut reader = BufReader::new(File::open(data_path)?);
    let hint_tmp = tmp_path(hint_path);
    let mut writer = BufWriter::new(File::create(&hint_tmp)?);

    let mut offset = 0u32;
    let mut payload = Vec::new();
    let result = (|| -> Result<()> {
        loop {
            let mut header_buf = [0u8; DATA_HEADER_SIZE];
            match reader.read_exact(&mut header_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let header = DataFileEntry::decode(&header_buf)?;
            if header.key_size == 0 || header.index_count as usize > MAX_KEY_INDEX_QTY {
                tracing::error!(
                    path = %data_path.display(),
                    offset,
                    "corrupted record met while writing the hint file"
                );
                return Err(Error::EntryCorrupted);
            }
            let record_len = header.record_len();
            payload.resize(record_len - DATA_HEADER_SIZE, 0);
            reader.read_exact(&mut payload)?;

            let index_bytes = if header.is_tombstone() {
                0
            } else {
                2 * header.index_count as usize
            };
            let key = &payload[index_bytes..index_bytes + header.key_size as usize];

            let hint = HintFileEntry {
                key_hash: hash_prefix(hash_bytes(key)),
                ttl_deadline_sec: header.ttl_deadline_sec,
                offset,
                value_size: header.value_size,
                key_size: header.key_size,
                index_count: if header.is_tombstone() {
                    0
                } else {
                    header.index_count
                },
                flags: header.flags,
            };
            let mut hint_buf = [0u8; HINT_HEADER_SIZE + HINT_SUBHEADER_SIZE];
            hint.encode(&mut hint_buf);
            writer.write_all(&hint_buf)?;
            writer.write_all(&payload[..index_bytes + header.key_size as usize])?;

            offset += record_len as u32;
        }
        writer.flush()?;
        Ok(())
    })();

    match result {
        Ok(()) => {
            std::fs::rename(&hint_tmp, hint_path)?;
            Ok(())
        }
        Err(e) => {
            let _ = std::fs::remove_file(&hint_tmp);
            Err(e)
        }
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    PathBuf::from(format!("{}.{}", path.display(), TMP_FILE_SUFFIX))
}

/// Merges exactly the given sealed files, bypassing trigger and selection.
#[cfg(test)]
pub(super) fn merge_exact_files(shared: &Shared, file_ids: &[u16]) -> Result<()> {
    let data_file_max_bytes = shared.config.lock()?.data_file_max_bytes;
    let mut infos: Vec<MergeFileInfo> = file_ids
        .iter()
        .map(|&file_id| MergeFileInfo {
            file_id,
            patches: Vec::new(),
        })
        .collect();
    let dropped = create_merged_files(shared, &mut infos, data_file_max_bytes)?;
    replace_data_files(shared, &infos, &dropped)
}
