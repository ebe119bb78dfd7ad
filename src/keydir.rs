use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};

use crate::error::{Error, Result};
use crate::format::KeyIndex;
use crate::hasher::hash_prefix;
use crate::tlsf::{Tlsf, NOT_STORED};

/// Slots per bucket group; the group shares one version counter and fits a
/// pair of cache lines.
const ASSOC: usize = 8;

/// Cells per metadata chunk. Chunks are allocated on demand and never move,
/// so a cell index stays valid for the life of the directory.
const CHUNK_CELLS: usize = 4096;
const MAX_CHUNKS: usize = 8192;

const CURRENT_TABLE: u32 = 1 << 0;
const UNDER_RESIZING: u32 = 1 << 1;

const EMERGENCY_BATCH: u32 = 1_000_000;

/// Sentinel value size marking a tombstoned directory entry.
pub const DELETED_ENTRY: u32 = 0xFFFF_FFFF;
/// Sentinel file id for entries that no longer reference any data file.
pub const NO_FILE: u16 = 0xFFFF;

/// A copy of one directory entry, snapshot under the group version.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KeyDirEntry {
    pub ttl_deadline_sec: u32,
    pub value_size: u32,
    pub cache_loc: u32,
    pub file_offset: u32,
    pub file_id: u16,
    pub key_size: u16,
    pub index_count: u8,
    pub change_counter: u8,
}

impl KeyDirEntry {
    pub fn is_deleted(&self) -> bool {
        self.value_size == DELETED_ENTRY
    }
}

/// State of the superseded entry after an insert, used by the caller to
/// update file statistics, the cache and the key-part index.
#[derive(Clone, Debug)]
pub struct OldEntry {
    pub value_size: u32,
    pub cache_loc: u32,
    pub file_id: u16,
    pub indexes: Vec<KeyIndex>,
}

/// One expired entry collected by the TTL sweep.
#[derive(Clone, Copy, Debug)]
pub struct ExpiredEntry {
    pub key_hash64: u64,
    pub key_size: u16,
    pub value_size: u32,
    pub index_count: u8,
    pub file_id: u16,
    pub cache_loc: u32,
}

/// Probe-count instrumentation snapshot. `probe_max` resets on read.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProbeStats {
    pub probe_max: u64,
    pub probe_sum: u64,
    pub find_count: u64,
}

// Per-entry metadata. Fields are fixed-width atomics so optimistic readers
// can never observe a torn value; logical consistency across fields comes
// from the group version counter.
#[derive(Default)]
struct MetaCell {
    ttl_deadline_sec: AtomicU32,
    value_size: AtomicU32,
    cache_loc: AtomicU32,
    file_offset: AtomicU32,
    file_and_key_size: AtomicU32, // (file_id << 16) | key_size
    index_and_counter: AtomicU32, // (index_count << 8) | change_counter
    key_loc: AtomicU32,           // arena handle: key bytes then 2*index_count index bytes
}

struct Group {
    version: AtomicU32,
    slots: [AtomicU64; ASSOC], // (hash32 << 32) | cell index; 0 = empty
}

struct Table {
    groups: Box<[Group]>,
    size: AtomicU32,
}

impl Table {
    fn with_capacity(slots: u32) -> Self {
        let ngroups = (slots as usize) / ASSOC;
        let groups = (0..ngroups)
            .map(|_| Group {
                version: AtomicU32::new(0),
                slots: Default::default(),
            })
            .collect();
        Self {
            groups,
            size: AtomicU32::new(0),
        }
    }

    fn capacity(&self) -> u32 {
        (self.groups.len() * ASSOC) as u32
    }
}

enum Lookup {
    Found(KeyDirEntry),
    Absent,
    Retry,
}

struct WriterState {
    next_cell: u32,
    resize_cursor: u32, // slot index in the old table
    ttl_cursor: u32,    // slot index in the current table
}

/// The in-memory key directory: an 8-associative open-addressed table with
/// optimistic per-group locking, incremental background resizing and a TLSF
/// arena holding the key bytes and index lists.
pub struct KeyDir {
    state: AtomicU32,
    tables: [RwLock<Arc<Table>>; 2],
    cells: Box<[OnceLock<Box<[MetaCell]>>]>,
    arena: RwLock<Tlsf>,
    writer: Mutex<WriterState>,
    now_sec: AtomicU32,
    max_load_factor_128: AtomicU64,
    on_resize_start: Box<dyn Fn() + Send + Sync>,

    instr_enabled: AtomicBool,
    probe_sum: AtomicU64,
    probe_max: AtomicU64,
    find_count: AtomicU64,
}

impl KeyDir {
    /// `initial_capacity` must be a power of two, at least one group.
    pub fn new(
        key_max_alloc_bytes: u64,
        initial_capacity: u32,
        on_resize_start: Box<dyn Fn() + Send + Sync>,
    ) -> Self {
        assert!(initial_capacity.is_power_of_two() && initial_capacity >= ASSOC as u32);
        let cells = (0..MAX_CHUNKS).map(|_| OnceLock::new()).collect();
        Self {
            state: AtomicU32::new(0),
            tables: [
                RwLock::new(Arc::new(Table::with_capacity(initial_capacity))),
                RwLock::new(Arc::new(Table::with_capacity(0))),
            ],
            cells,
            arena: RwLock::new(Tlsf::new(key_max_alloc_bytes)),
            writer: Mutex::new(WriterState {
                next_cell: 0,
                resize_cursor: 0,
                ttl_cursor: 0,
            }),
            now_sec: AtomicU32::new(0),
            max_load_factor_128: AtomicU64::new((0.95 * 128.0) as u64),
            on_resize_start,
            instr_enabled: AtomicBool::new(false),
            probe_sum: AtomicU64::new(0),
            probe_max: AtomicU64::new(0),
            find_count: AtomicU64::new(0),
        }
    }

    pub fn set_now(&self, now_sec: u32) {
        self.now_sec.store(now_sec, Ordering::Release);
    }

    pub fn size(&self) -> u32 {
        let t0 = self.tables[0].read().unwrap().size.load(Ordering::Acquire);
        let t1 = self.tables[1].read().unwrap().size.load(Ordering::Acquire);
        t0 + t1
    }

    pub fn capacity(&self) -> u32 {
        let t0 = self.tables[0].read().unwrap().capacity();
        let t1 = self.tables[1].read().unwrap().capacity();
        t0.max(t1)
    }

    pub fn load_factor(&self) -> f64 {
        f64::from(self.size()) / f64::from(self.capacity().max(1))
    }

    pub fn set_max_load_factor(&self, f: f64) -> bool {
        if f <= 0.0 || f > 1.0 {
            return false;
        }
        self.max_load_factor_128
            .store((128.0 * f) as u64, Ordering::Release);
        true
    }

    pub fn is_resizing(&self) -> bool {
        self.state.load(Ordering::Acquire) & UNDER_RESIZING != 0
    }

    pub fn estimated_used_memory_bytes(&self) -> u64 {
        let slots = (self.tables[0].read().unwrap().capacity()
            + self.tables[1].read().unwrap().capacity()) as u64
            * 8;
        let cells = u64::from(self.writer.lock().unwrap().next_cell)
            * std::mem::size_of::<MetaCell>() as u64;
        slots + cells + self.arena.read().unwrap().allocated_bytes()
    }

    /// Empties the directory. Only valid while no concurrent user exists.
    pub fn reset(&self) {
        let mut ws = self.writer.lock().unwrap();
        for table in &self.tables {
            let table = table.read().unwrap();
            for group in table.groups.iter() {
                for slot in &group.slots {
                    slot.store(0, Ordering::Release);
                }
            }
            table.size.store(0, Ordering::Release);
        }
        self.arena.write().unwrap().reset();
        self.state
            .store(self.state.load(Ordering::Acquire) & CURRENT_TABLE, Ordering::Release);
        ws.next_cell = 0;
        ws.resize_cursor = 0;
        ws.ttl_cursor = 0;
    }

    pub fn set_instrumentation_enable(&self, enable: bool) {
        self.instr_enabled.store(enable, Ordering::Release);
    }

    pub fn probe_stats(&self) -> ProbeStats {
        ProbeStats {
            probe_max: self.probe_max.swap(0, Ordering::AcqRel),
            probe_sum: self.probe_sum.load(Ordering::Acquire),
            find_count: self.find_count.load(Ordering::Acquire),
        }
    }

    // ---- lookup ----

    /// Optimistic lookup. Tombstoned entries are returned (the caller
    /// checks `is_deleted`); expired entries read as absent.
    pub fn find(&self, hash: u64, key: &[u8]) -> Option<KeyDirEntry> {
        let h32 = hash_prefix(hash);
        let now = self.now_sec.load(Ordering::Acquire);
        loop {
            let state = self.state.load(Ordering::Acquire);
            let current = (state & CURRENT_TABLE) as usize;
            let resizing = state & UNDER_RESIZING != 0;

            let mut retry = false;
            for table_idx in [current, current ^ 1] {
                if table_idx == current ^ 1 && !resizing {
                    break;
                }
                let table = self.tables[table_idx].read().unwrap().clone();
                match self.find_in_table(&table, h32, key, now) {
                    Lookup::Found(entry) => return Some(entry),
                    Lookup::Absent => continue,
                    Lookup::Retry => {
                        retry = true;
                        break;
                    }
                }
            }
            if !retry {
                return None;
            }
            std::hint::spin_loop();
        }
    }

    fn find_in_table(&self, table: &Table, h32: u32, key: &[u8], now: u32) -> Lookup {
        if table.groups.is_empty() {
            return Lookup::Absent;
        }
        let mask = table.groups.len() - 1;
        let mut g = h32 as usize & mask;
        let mut probe = 1usize;

        loop {
            let group = &table.groups[g];
            let v1 = group.version.load(Ordering::Acquire);
            if v1 & 1 != 0 {
                return Lookup::Retry;
            }

            let mut open_slot = false;
            for slot in &group.slots {
                let word = slot.load(Ordering::Acquire);
                if word == 0 {
                    open_slot = true;
                    break;
                }
                if (word >> 32) as u32 != h32 {
                    continue;
                }
                let cell = self.cell(word as u32);
                let entry = Self::load_entry(cell);
                let key_matches = entry.key_size as usize == key.len() && {
                    let arena = self.arena.read().unwrap();
                    arena
                        .try_data(cell.key_loc.load(Ordering::Acquire), key.len())
                        .is_some_and(|bytes| bytes == key)
                };
                if group.version.load(Ordering::Acquire) != v1 {
                    return Lookup::Retry;
                }
                if key_matches {
                    if entry.ttl_deadline_sec > 0 && entry.ttl_deadline_sec <= now {
                        self.record_probe(probe as u64);
                        return Lookup::Absent;
                    }
                    self.record_probe(probe as u64);
                    return Lookup::Found(entry);
                }
            }
            if group.version.load(Ordering::Acquire) != v1 {
                return Lookup::Retry;
            }
            if open_slot {
                self.record_probe(probe as u64);
                return Lookup::Absent;
            }
            g = (g + probe) & mask;
            probe += 1;
        }
    }

    fn record_probe(&self, probes: u64) {
        if !self.instr_enabled.load(Ordering::Relaxed) {
            return;
        }
        self.probe_sum.fetch_add(probes, Ordering::Relaxed);
        self.find_count.fetch_add(1, Ordering::Relaxed);
        self.probe_max.fetch_max(probes, Ordering::Relaxed);
    }

    /// Returns the key bytes and index list of the first live entry with
    /// this hash prefix, for query candidate validation.
    pub fn get_key_and_indexes(&self, h32: u32) -> Option<(Vec<u8>, Vec<KeyIndex>)> {
        let now = self.now_sec.load(Ordering::Acquire);
        loop {
            let state = self.state.load(Ordering::Acquire);
            let current = (state & CURRENT_TABLE) as usize;
            let resizing = state & UNDER_RESIZING != 0;

            let mut retry = false;
            for table_idx in [current, current ^ 1] {
                if table_idx == current ^ 1 && !resizing {
                    break;
                }
                let table = self.tables[table_idx].read().unwrap().clone();
                match self.key_and_indexes_in_table(&table, h32, now) {
                    Ok(Some(found)) => return Some(found),
                    Ok(None) => continue,
                    Err(()) => {
                        retry = true;
                        break;
                    }
                }
            }
            if !retry {
                return None;
            }
            std::hint::spin_loop();
        }
    }

    #[allow(clippy::type_complexity)]
    fn key_and_indexes_in_table(
        &self,
        table: &Table,
        h32: u32,
        now: u32,
    ) -> std::result::Result<Option<(Vec<u8>, Vec<KeyIndex>)>, ()> {
        if table.groups.is_empty() {
            return Ok(None);
        }
        let mask = table.groups.len() - 1;
        let mut g = h32 as usize & mask;
        let mut probe = 1usize;

        loop {
            let group = &table.groups[g];
            let v1 = group.version.load(Ordering::Acquire);
            if v1 & 1 != 0 {
                return Err(());
            }

            let mut open_slot = false;
            for slot in &group.slots {
                let word = slot.load(Ordering::Acquire);
                if word == 0 {
                    open_slot = true;
                    break;
                }
                if (word >> 32) as u32 != h32 {
                    continue;
                }
                let cell = self.cell(word as u32);
                let entry = Self::load_entry(cell);
                if entry.is_deleted()
                    || (entry.ttl_deadline_sec > 0 && entry.ttl_deadline_sec <= now)
                {
                    if group.version.load(Ordering::Acquire) != v1 {
                        return Err(());
                    }
                    continue;
                }
                let total = entry.key_size as usize + 2 * entry.index_count as usize;
                let copied = {
                    let arena = self.arena.read().unwrap();
                    arena
                        .try_data(cell.key_loc.load(Ordering::Acquire), total)
                        .map(|bytes| {
                            (
                                bytes[..entry.key_size as usize].to_vec(),
                                crate::format::decode_key_indexes(&bytes[entry.key_size as usize..]),
                            )
                        })
                };
                if group.version.load(Ordering::Acquire) != v1 {
                    return Err(());
                }
                if let Some(found) = copied {
                    return Ok(Some(found));
                }
            }
            if group.version.load(Ordering::Acquire) != v1 {
                return Err(());
            }
            if open_slot {
                return Ok(None);
            }
            g = (g + probe) & mask;
            probe += 1;
        }
    }

    // ---- insertion and update ----

    /// Inserts or updates the entry for `key`. Tombstoning is an insert
    /// with `value_size == DELETED_ENTRY`; the previous index list is then
    /// retained so a later re-put with overlapping indexes does not
    /// duplicate index-array entries.
    pub fn insert_entry(
        &self,
        hash: u64,
        key: &[u8],
        indexes: &[KeyIndex],
        entry: KeyDirEntry,
    ) -> Result<Option<OldEntry>> {
        let h32 = hash_prefix(hash);
        let mut ws = self.writer.lock()?;

        let current = (self.state.load(Ordering::Acquire) & CURRENT_TABLE) as usize;
        let table = self.tables[current].read().unwrap().clone();
        let mask = table.groups.len() - 1;
        let mut g = h32 as usize & mask;
        let mut probe = 1usize;

        let (free_group, free_lane) = loop {
            let group = &table.groups[g];
            let mut free_lane = None;
            for (lane, slot) in group.slots.iter().enumerate() {
                let word = slot.load(Ordering::Acquire);
                if word == 0 {
                    free_lane = Some(lane);
                    break;
                }
                if (word >> 32) as u32 != h32 {
                    continue;
                }
                let cell_idx = word as u32;
                let cell = self.cell(cell_idx);
                if !self.key_matches(cell, key) {
                    continue;
                }

                // Update case: mutate under an odd group version.
                let v = group.version.load(Ordering::Relaxed);
                group.version.store(v.wrapping_add(1), Ordering::Release);
                let old = self.capture_old(cell);
                let status = self.update_cell(cell, key, indexes, &entry, old.value_size);
                group.version.store(v.wrapping_add(2), Ordering::Release);
                return status.map(|()| Some(old));
            }
            if let Some(lane) = free_lane {
                break (g, lane);
            }
            g = (g + probe) & mask;
            probe += 1;
        };

        // Fresh insert: allocate the key chunk and a metadata cell, then
        // publish the slot. Readers cannot see the entry before the store.
        let key_loc = {
            let mut arena = self.arena.write()?;
            let total = key.len() + 2 * indexes.len();
            let loc = arena.malloc(total as u64).ok_or(Error::OutOfMemory)?;
            let data = arena.data_mut(loc, total);
            data[..key.len()].copy_from_slice(key);
            crate::format::encode_key_indexes(&mut data[key.len()..], indexes);
            loc
        };
        let cell_idx = self.alloc_cell(&mut ws).ok_or(Error::OutOfMemory)?;
        let cell = self.cell(cell_idx);
        cell.ttl_deadline_sec
            .store(entry.ttl_deadline_sec, Ordering::Relaxed);
        cell.value_size.store(entry.value_size, Ordering::Relaxed);
        cell.cache_loc.store(entry.cache_loc, Ordering::Relaxed);
        cell.file_offset.store(entry.file_offset, Ordering::Relaxed);
        cell.file_and_key_size.store(
            (u32::from(entry.file_id) << 16) | u32::from(entry.key_size),
            Ordering::Relaxed,
        );
        cell.index_and_counter.store(
            (u32::from(indexes.len() as u8) << 8) | u32::from(entry.change_counter),
            Ordering::Relaxed,
        );
        cell.key_loc.store(key_loc, Ordering::Relaxed);

        table.groups[free_group].slots[free_lane].store(
            (u64::from(h32) << 32) | u64::from(cell_idx),
            Ordering::Release,
        );
        table.size.fetch_add(1, Ordering::AcqRel);

        let total_size = self.size() as u64;
        if 128 * total_size
            > self.max_load_factor_128.load(Ordering::Acquire) * u64::from(table.capacity())
        {
            self.start_resize(&mut ws, table.capacity() * 2);
        }
        Ok(None)
    }

    fn capture_old(&self, cell: &MetaCell) -> OldEntry {
        let entry = Self::load_entry(cell);
        let indexes = if entry.index_count > 0 {
            let arena = self.arena.read().unwrap();
            let total = entry.key_size as usize + 2 * entry.index_count as usize;
            let bytes = arena.data(cell.key_loc.load(Ordering::Acquire), total);
            crate::format::decode_key_indexes(&bytes[entry.key_size as usize..])
        } else {
            Vec::new()
        };
        OldEntry {
            value_size: entry.value_size,
            cache_loc: entry.cache_loc,
            file_id: entry.file_id,
            indexes,
        }
    }

    fn update_cell(
        &self,
        cell: &MetaCell,
        key: &[u8],
        indexes: &[KeyIndex],
        entry: &KeyDirEntry,
        _old_value_size: u32,
    ) -> Result<()> {
        let old_ic = cell.index_and_counter.load(Ordering::Acquire);
        let counter = (old_ic as u8).wrapping_add(1);

        if entry.value_size == DELETED_ENTRY {
            // Deletion keeps the previous index bytes; only the counter and
            // location fields change.
            cell.ttl_deadline_sec.store(0, Ordering::Relaxed);
            cell.value_size.store(DELETED_ENTRY, Ordering::Relaxed);
            cell.cache_loc.store(NOT_STORED, Ordering::Relaxed);
            cell.file_offset.store(entry.file_offset, Ordering::Relaxed);
            cell.file_and_key_size.store(
                (u32::from(entry.file_id) << 16) | u32::from(entry.key_size),
                Ordering::Relaxed,
            );
            cell.index_and_counter
                .store((old_ic & 0xFF00) | u32::from(counter), Ordering::Relaxed);
            return Ok(());
        }

        let key_loc = cell.key_loc.load(Ordering::Acquire);
        let needed_index_bytes = 2 * indexes.len() as u64;
        let mut arena = self.arena.write()?;
        let available = arena.real_allocated_size(key_loc) - key.len() as u64;
        if needed_index_bytes > available {
            // The stored index list grew past the chunk: reallocate.
            let total = key.len() + 2 * indexes.len();
            let new_loc = arena.malloc(total as u64).ok_or(Error::OutOfMemory)?;
            let data = arena.data_mut(new_loc, total);
            data[..key.len()].copy_from_slice(key);
            crate::format::encode_key_indexes(&mut data[key.len()..], indexes);
            arena.free(key_loc);
            cell.key_loc.store(new_loc, Ordering::Relaxed);
        } else if !indexes.is_empty() {
            let data = arena.data_mut(key_loc, key.len() + 2 * indexes.len());
            crate::format::encode_key_indexes(&mut data[key.len()..], indexes);
        }
        drop(arena);

        cell.ttl_deadline_sec
            .store(entry.ttl_deadline_sec, Ordering::Relaxed);
        cell.value_size.store(entry.value_size, Ordering::Relaxed);
        cell.cache_loc.store(entry.cache_loc, Ordering::Relaxed);
        cell.file_offset.store(entry.file_offset, Ordering::Relaxed);
        cell.file_and_key_size.store(
            (u32::from(entry.file_id) << 16) | u32::from(entry.key_size),
            Ordering::Relaxed,
        );
        cell.index_and_counter.store(
            (u32::from(indexes.len() as u8) << 8) | u32::from(counter),
            Ordering::Relaxed,
        );
        Ok(())
    }

    /// Writes back the cache location filled in by a read miss. The value
    /// size and change counter guard against the entry having been replaced
    /// in the meantime (ABA).
    pub fn update_cached_value_location(
        &self,
        hash: u64,
        key: &[u8],
        check_value_size: u32,
        check_change_counter: u8,
        new_cache_loc: u32,
    ) {
        let h32 = hash_prefix(hash);
        let _ws = self.writer.lock().unwrap();
        self.for_each_hash_match(h32, |_group, cell| {
            if !self.key_matches(cell, key) {
                return false;
            }
            let entry = Self::load_entry(cell);
            if !entry.is_deleted()
                && entry.value_size == check_value_size
                && entry.change_counter == check_change_counter
            {
                cell.cache_loc.store(new_cache_loc, Ordering::Release);
            }
            true
        });
    }

    /// Applies a merge relocation patch: the entry is only moved if it
    /// still points at the old location.
    pub fn update_merged_location(
        &self,
        h32: u32,
        old_file_id: u16,
        old_offset: u32,
        new_file_id: u16,
        new_offset: u32,
    ) {
        let _ws = self.writer.lock().unwrap();
        self.for_each_hash_match(h32, |group, cell| {
            let entry = Self::load_entry(cell);
            if entry.file_id != old_file_id || entry.file_offset != old_offset {
                return false;
            }
            let v = group.version.load(Ordering::Relaxed);
            group.version.store(v.wrapping_add(1), Ordering::Release);
            cell.file_offset.store(new_offset, Ordering::Relaxed);
            let fk = cell.file_and_key_size.load(Ordering::Relaxed);
            cell.file_and_key_size.store(
                (u32::from(new_file_id) << 16) | (fk & 0xFFFF),
                Ordering::Relaxed,
            );
            group.version.store(v.wrapping_add(2), Ordering::Release);
            true
        });
    }

    /// Detaches a tombstone entry from disk once its record was dropped by
    /// a merge, leaving an in-memory sentinel for probe-chain correctness.
    pub fn detach_dropped_tombstone(&self, h32: u32, old_file_id: u16, old_offset: u32) {
        self.update_merged_location(h32, old_file_id, old_offset, NO_FILE, NOT_STORED);
    }

    /// Removes `key_part` from the retained index list of dead entries
    /// carrying this hash. Returns true when the index array slot should be
    /// dropped as well.
    pub fn clean_index(&self, h32: u32, key_part: &[u8]) -> bool {
        let now = self.now_sec.load(Ordering::Acquire);
        let _ws = self.writer.lock().unwrap();
        self.for_each_hash_match(h32, |group, cell| {
            let entry = Self::load_entry(cell);
            let expired = entry.ttl_deadline_sec > 0 && entry.ttl_deadline_sec <= now;
            if !entry.is_deleted() && !expired {
                return false; // live entry, nothing to clean here
            }
            let total = entry.key_size as usize + 2 * entry.index_count as usize;
            let mut arena = self.arena.write().unwrap();
            let key_loc = cell.key_loc.load(Ordering::Acquire);
            let data = arena.data_mut(key_loc, total);
            let (key, index_bytes) = data.split_at_mut(entry.key_size as usize);
            for i in 0..entry.index_count as usize {
                let start = index_bytes[2 * i] as usize;
                let size = index_bytes[2 * i + 1] as usize;
                if size != key_part.len()
                    || start + size > key.len()
                    || &key[start..start + size] != key_part
                {
                    continue;
                }
                // Drop this index, keeping the remaining order.
                let v = group.version.load(Ordering::Relaxed);
                group.version.store(v.wrapping_add(1), Ordering::Release);
                index_bytes.copy_within(2 * (i + 1).., 2 * i);
                let ic = cell.index_and_counter.load(Ordering::Relaxed);
                let new_count = u32::from(entry.index_count - 1);
                cell.index_and_counter
                    .store((new_count << 8) | (ic & 0xFF), Ordering::Relaxed);
                group.version.store(v.wrapping_add(2), Ordering::Release);
                return true;
            }
            false
        });
        true
    }

    // Walks every slot of both tables whose hash prefix matches, invoking
    // `f` until it returns true. Caller must hold the writer lock.
    fn for_each_hash_match(&self, h32: u32, mut f: impl FnMut(&Group, &MetaCell) -> bool) {
        let state = self.state.load(Ordering::Acquire);
        let current = (state & CURRENT_TABLE) as usize;
        let resizing = state & UNDER_RESIZING != 0;

        for table_idx in [current, current ^ 1] {
            if table_idx == current ^ 1 && !resizing {
                break;
            }
            let table = self.tables[table_idx].read().unwrap().clone();
            if table.groups.is_empty() {
                continue;
            }
            let mask = table.groups.len() - 1;
            let mut g = h32 as usize & mask;
            let mut probe = 1usize;
            loop {
                let group = &table.groups[g];
                let mut open_slot = false;
                for slot in &group.slots {
                    let word = slot.load(Ordering::Acquire);
                    if word == 0 {
                        open_slot = true;
                        break;
                    }
                    if (word >> 32) as u32 == h32 && f(group, self.cell(word as u32)) {
                        return;
                    }
                }
                if open_slot {
                    break;
                }
                g = (g + probe) & mask;
                probe += 1;
            }
        }
    }

    // ---- background maintenance ----

    /// Migrates up to `batch` slots of the old table into the new one.
    /// Returns true while the resize is still ongoing afterwards.
    pub fn background_resize_work(&self, batch: u32) -> bool {
        let mut ws = self.writer.lock().unwrap();
        self.resize_step_locked(&mut ws, batch, false)
    }

    fn resize_step_locked(&self, ws: &mut WriterState, batch: u32, forced: bool) -> bool {
        if !self.is_resizing() {
            return false;
        }
        let state = self.state.load(Ordering::Acquire);
        let current = (state & CURRENT_TABLE) as usize;
        let old = self.tables[current ^ 1].read().unwrap().clone();
        let new = self.tables[current].read().unwrap().clone();
        let mask = new.groups.len() - 1;

        let last = (ws.resize_cursor + batch).min(old.capacity());
        for slot_idx in ws.resize_cursor..last {
            let group = &old.groups[slot_idx as usize / ASSOC];
            let word = group.slots[slot_idx as usize % ASSOC].load(Ordering::Acquire);
            if word == 0 {
                continue;
            }
            let h32 = (word >> 32) as u32;

            let mut g = h32 as usize & mask;
            let mut probe = 1usize;
            'placed: loop {
                let new_group = &new.groups[g];
                for slot in &new_group.slots {
                    if slot.load(Ordering::Acquire) == 0 {
                        slot.store(word, Ordering::Release);
                        break 'placed;
                    }
                }
                g = (g + probe) & mask;
                probe += 1;
            }
            new.size.fetch_add(1, Ordering::AcqRel);
            old.size.fetch_sub(1, Ordering::AcqRel);
        }

        ws.resize_cursor = last;
        if last >= old.capacity() {
            old.size.store(0, Ordering::Release);
            self.state
                .store(self.state.load(Ordering::Acquire) & !UNDER_RESIZING, Ordering::Release);
            tracing::debug!(
                capacity = new.capacity(),
                forced,
                "key directory resize finished"
            );
            return false;
        }
        true
    }

    fn start_resize(&self, ws: &mut WriterState, new_capacity: u32) {
        // Emergency: force-finish a resize that the upkeep task did not
        // complete before the next one became necessary.
        while self.is_resizing() {
            self.resize_step_locked(ws, EMERGENCY_BATCH, true);
        }

        let state = self.state.load(Ordering::Acquire);
        let current = (state & CURRENT_TABLE) as usize;
        let new_table = Arc::new(Table::with_capacity(new_capacity));
        *self.tables[current ^ 1].write().unwrap() = new_table;
        ws.resize_cursor = 0;

        if self.size() != 0 {
            self.state
                .store(UNDER_RESIZING | (state ^ CURRENT_TABLE), Ordering::Release);
            tracing::debug!(capacity = new_capacity, "key directory resize started");
            (self.on_resize_start)();
        } else {
            self.state.store(state ^ CURRENT_TABLE, Ordering::Release);
        }
    }

    /// Scans up to `batch` slots for expired entries, invalidates them and
    /// returns what the caller needs to release their cache chunks and
    /// charge the dead bytes.
    pub fn sweep_expired(&self, batch: u32) -> Vec<ExpiredEntry> {
        let now = self.now_sec.load(Ordering::Acquire);
        let current = (self.state.load(Ordering::Acquire) & CURRENT_TABLE) as usize;
        let table = self.tables[current].read().unwrap().clone();
        if table.capacity() == 0 {
            return Vec::new();
        }

        // Lock-free probe for candidates over one shard of the table.
        let (start, last) = {
            let mut ws = self.writer.lock().unwrap();
            let start = ws.ttl_cursor.min(table.capacity());
            let last = (start + batch).min(table.capacity());
            ws.ttl_cursor = if last >= table.capacity() { 0 } else { last };
            (start, last)
        };

        let mut candidates = Vec::new();
        for slot_idx in start..last {
            let group = &table.groups[slot_idx as usize / ASSOC];
            let word = group.slots[slot_idx as usize % ASSOC].load(Ordering::Acquire);
            if word == 0 {
                continue;
            }
            let cell = self.cell(word as u32);
            let ttl = cell.ttl_deadline_sec.load(Ordering::Acquire);
            if cell.value_size.load(Ordering::Acquire) != DELETED_ENTRY && ttl > 0 && ttl <= now {
                candidates.push(slot_idx);
            }
        }
        if candidates.is_empty() {
            return Vec::new();
        }

        // Re-check and invalidate under the writer lock.
        let _ws = self.writer.lock().unwrap();
        let mut expired = Vec::with_capacity(candidates.len());
        for slot_idx in candidates {
            let group = &table.groups[slot_idx as usize / ASSOC];
            let word = group.slots[slot_idx as usize % ASSOC].load(Ordering::Acquire);
            if word == 0 {
                continue;
            }
            let cell = self.cell(word as u32);
            let entry = Self::load_entry(cell);
            let still_expired = !entry.is_deleted()
                && entry.ttl_deadline_sec > 0
                && entry.ttl_deadline_sec <= now;
            if !still_expired {
                continue;
            }

            // The cache is keyed by the full 64-bit hash, so recompute it
            // from the stored key bytes before invalidating.
            let key_hash64 = {
                let arena = self.arena.read().unwrap();
                arena
                    .try_data(cell.key_loc.load(Ordering::Acquire), entry.key_size as usize)
                    .map(crate::hasher::hash_bytes)
                    .unwrap_or(0)
            };

            let v = group.version.load(Ordering::Relaxed);
            group.version.store(v.wrapping_add(1), Ordering::Release);
            cell.ttl_deadline_sec.store(0, Ordering::Relaxed);
            cell.value_size.store(DELETED_ENTRY, Ordering::Relaxed);
            cell.cache_loc.store(NOT_STORED, Ordering::Relaxed);
            group.version.store(v.wrapping_add(2), Ordering::Release);

            expired.push(ExpiredEntry {
                key_hash64,
                key_size: entry.key_size,
                value_size: entry.value_size,
                index_count: entry.index_count,
                file_id: entry.file_id,
                cache_loc: entry.cache_loc,
            });
        }
        expired
    }

    // ---- internals ----

    fn cell(&self, idx: u32) -> &MetaCell {
        let chunk = self.cells[idx as usize / CHUNK_CELLS]
            .get()
            .expect("metadata chunk published before its cells");
        &chunk[idx as usize % CHUNK_CELLS]
    }

    fn alloc_cell(&self, ws: &mut WriterState) -> Option<u32> {
        let idx = ws.next_cell;
        if idx as usize >= MAX_CHUNKS * CHUNK_CELLS {
            return None;
        }
        self.cells[idx as usize / CHUNK_CELLS].get_or_init(|| {
            (0..CHUNK_CELLS)
                .map(|_| MetaCell::default())
                .collect::<Vec<_>>()
                .into_boxed_slice()
        });
        ws.next_cell = idx + 1;
        Some(idx)
    }

    fn key_matches(&self, cell: &MetaCell, key: &[u8]) -> bool {
        let fk = cell.file_and_key_size.load(Ordering::Acquire);
        if (fk & 0xFFFF) as usize != key.len() {
            return false;
        }
        let arena = self.arena.read().unwrap();
        arena
            .try_data(cell.key_loc.load(Ordering::Acquire), key.len())
            .is_some_and(|bytes| bytes == key)
    }

    fn load_entry(cell: &MetaCell) -> KeyDirEntry {
        let fk = cell.file_and_key_size.load(Ordering::Acquire);
        let ic = cell.index_and_counter.load(Ordering::Acquire);
        KeyDirEntry {
            ttl_deadline_sec: cell.ttl_deadline_sec.load(Ordering::Acquire),
            value_size: cell.value_size.load(Ordering::Acquire),
            cache_loc: cell.cache_loc.load(Ordering::Acquire),
            file_offset: cell.file_offset.load(Ordering::Acquire),
            file_id: (fk >> 16) as u16,
            key_size: (fk & 0xFFFF) as u16,
            index_count: (ic >> 8) as u8,
            change_counter: (ic & 0xFF) as u8,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::hash_bytes;

    fn new_keydir(capacity: u32) -> KeyDir {
        KeyDir::new(1 << 30, capacity, Box::new(|| {}))
    }

    fn entry_at(file_id: u16, offset: u32, key: &[u8], value_size: u32) -> KeyDirEntry {
        KeyDirEntry {
            ttl_deadline_sec: 0,
            value_size,
            cache_loc: NOT_STORED,
            file_offset: offset,
            file_id,
            key_size: key.len() as u16,
            index_count: 0,
            change_counter: 0,
        }
    }

    #[test]
    fn test_insert_find_update() {
        let kd = new_keydir(64);
        let key = b"hello";
        let hash = hash_bytes(key);

        assert!(kd.find(hash, key).is_none());
        let old = kd
            .insert_entry(hash, key, &[], entry_at(0, 100, key, 8))
            .unwrap();
        assert!(old.is_none());

        let found = kd.find(hash, key).expect("inserted entry");
        assert_eq!(found.file_offset, 100);
        assert_eq!(found.value_size, 8);

        let old = kd
            .insert_entry(hash, key, &[], entry_at(1, 200, key, 16))
            .unwrap()
            .expect("old entry");
        assert_eq!(old.file_id, 0);
        let found = kd.find(hash, key).unwrap();
        assert_eq!(found.file_id, 1);
        assert_eq!(found.file_offset, 200);
        assert_eq!(kd.size(), 1);
    }

    #[test]
    fn test_tombstone_keeps_indexes() {
        let kd = new_keydir(64);
        let key = b"tagged";
        let hash = hash_bytes(key);
        let indexes = [
            KeyIndex {
                start_idx: 0,
                size: 3,
            },
            KeyIndex {
                start_idx: 1,
                size: 4,
            },
        ];
        kd.insert_entry(hash, key, &indexes, {
            let mut e = entry_at(0, 0, key, 10);
            e.index_count = 2;
            e
        })
        .unwrap();

        let mut tomb = entry_at(0, 50, key, DELETED_ENTRY);
        tomb.index_count = 0;
        kd.insert_entry(hash, key, &[], tomb).unwrap();

        let found = kd.find(hash, key).unwrap();
        assert!(found.is_deleted());
        // The index list survives the deletion for de-duplication later.
        assert_eq!(found.index_count, 2);
        // A deleted entry is not returned by validation lookups.
        assert!(kd.get_key_and_indexes(hash_prefix(hash)).is_none());
    }

    #[test]
    fn test_expired_reads_as_absent() {
        let kd = new_keydir(64);
        kd.set_now(100);
        let key = b"short-lived";
        let hash = hash_bytes(key);
        let mut e = entry_at(0, 0, key, 4);
        e.ttl_deadline_sec = 150;
        kd.insert_entry(hash, key, &[], e).unwrap();

        assert!(kd.find(hash, key).is_some());
        kd.set_now(150);
        assert!(kd.find(hash, key).is_none());
    }

    #[test]
    fn test_sweep_expired() {
        let kd = new_keydir(64);
        kd.set_now(10);
        for i in 0u32..8 {
            let key = format!("ttl-{}", i);
            let mut e = entry_at(2, i * 64, key.as_bytes(), 32);
            e.ttl_deadline_sec = if i % 2 == 0 { 20 } else { 0 };
            kd.insert_entry(hash_bytes(key.as_bytes()), key.as_bytes(), &[], e)
                .unwrap();
        }

        kd.set_now(30);
        let expired = kd.sweep_expired(64);
        assert_eq!(expired.len(), 4);
        for info in &expired {
            assert_eq!(info.file_id, 2);
            assert_eq!(info.value_size, 32);
        }
        // A second sweep over the same shard finds nothing new.
        assert!(kd.sweep_expired(64).is_empty());
    }

    #[test]
    fn test_resize_migration_preserves_entries() {
        let kd = new_keydir(64);
        let n = 200u32; // well past the 64-slot initial capacity
        for i in 0..n {
            let key = format!("key-{:04}", i);
            kd.insert_entry(
                hash_bytes(key.as_bytes()),
                key.as_bytes(),
                &[],
                entry_at(0, i, key.as_bytes(), i),
            )
            .unwrap();
        }
        // Drive any pending migration to completion.
        while kd.background_resize_work(32) {}
        assert!(!kd.is_resizing());
        assert!(kd.capacity() >= n);

        for i in 0..n {
            let key = format!("key-{:04}", i);
            let found = kd.find(hash_bytes(key.as_bytes()), key.as_bytes());
            assert_eq!(found.unwrap().file_offset, i, "key {} lost", i);
        }
    }

    #[test]
    fn test_probe_budget_at_high_load() {
        let kd = new_keydir(16 * 1024);
        kd.set_max_load_factor(0.95);
        // Fill to ~90% of capacity without triggering a resize.
        let n = (16 * 1024) * 9 / 10;
        for i in 0..n {
            let key = format!("probe-key-{:06}", i);
            kd.insert_entry(
                hash_bytes(key.as_bytes()),
                key.as_bytes(),
                &[],
                entry_at(0, i as u32, key.as_bytes(), 1),
            )
            .unwrap();
        }
        while kd.background_resize_work(EMERGENCY_BATCH) {}
        assert_eq!(kd.size() as usize, n);

        kd.set_instrumentation_enable(true);
        for i in 0..n {
            let key = format!("probe-key-{:06}", i);
            assert!(kd.find(hash_bytes(key.as_bytes()), key.as_bytes()).is_some());
        }
        let stats = kd.probe_stats();
        assert_eq!(stats.find_count, n as u64);
        let avg = stats.probe_sum as f64 / stats.find_count as f64;
        assert!(avg < 5.0, "average probe count {} too high", avg);
        assert!(stats.probe_max < 50, "max probe count {} too high", stats.probe_max);
    }

    #[test]
    fn test_merge_patch_requires_old_location() {
        let kd = new_keydir(64);
        let key = b"patched";
        let hash = hash_bytes(key);
        kd.insert_entry(hash, key, &[], entry_at(3, 400, key, 9))
            .unwrap();

        // Wrong old offset: no change.
        kd.update_merged_location(hash_prefix(hash), 3, 999, 7, 0);
        assert_eq!(kd.find(hash, key).unwrap().file_id, 3);

        kd.update_merged_location(hash_prefix(hash), 3, 400, 7, 64);
        let found = kd.find(hash, key).unwrap();
        assert_eq!(found.file_id, 7);
        assert_eq!(found.file_offset, 64);
    }
}
