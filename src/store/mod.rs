pub mod merge;
pub mod recovery;
pub mod upkeep;

#[cfg(test)]
mod tests;

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::cache::{ValueCache, ValueCacheCounters};
use crate::config::Config;
use crate::datafile::{append_all, pread_exact, DataFile, DataFileStats, FileTable};
use crate::error::{Error, Result};
use crate::format::{
    self, data_record_len, encode_data_record, KeyIndex, DATA_HEADER_SIZE, MAX_KEY_INDEX_QTY,
    MAX_KEY_SIZE, MAX_VALUE_SIZE,
};
use crate::hasher::{hash_bytes, hash_prefix};
use crate::index::IndexMap;
use crate::keydir::{KeyDir, KeyDirEntry, DELETED_ENTRY, NO_FILE};
use crate::lock::StoreLock;
use crate::tlsf::NOT_STORED;

/// Default size of the in-memory write buffer staging the active-file tail.
/// Its exact value matters little as long as it amortizes the write system
/// calls.
const DEFAULT_WRITE_BUFFER_BYTES: usize = 100_000;

/// Virtual ceiling for the key directory and index arenas; committed memory
/// follows actual use.
const KEY_STORAGE_ALLOC_BYTES: u64 = 16 << 30;

const INITIAL_MAP_CAPACITY: u32 = 16 * 1024;

/// Default value cache capacity.
const DEFAULT_CACHE_BYTES: u64 = 256 * 1024 * 1024;

/// Monotonic datastore counters, readable at any time.
#[derive(Clone, Copy, Debug, Default)]
pub struct DatastoreCounters {
    pub open_call_qty: u64,
    pub open_call_failed_qty: u64,
    pub close_call_qty: u64,
    pub close_call_failed_qty: u64,
    pub put_call_qty: u64,
    pub put_call_failed_qty: u64,
    pub remove_call_qty: u64,
    pub remove_call_not_found_qty: u64,
    pub remove_call_failed_qty: u64,
    pub get_call_qty: u64,
    pub get_call_not_found_qty: u64,
    pub get_call_corrupted_qty: u64,
    pub get_call_failed_qty: u64,
    pub get_write_buffer_hit_qty: u64,
    pub get_cache_hit_qty: u64,
    pub query_call_qty: u64,
    pub query_call_failed_qty: u64,
    pub data_file_creation_qty: u64,
    pub active_data_file_switch_qty: u64,
    pub index_array_cleaning_qty: u64,
    pub index_array_cleaned_entries: u64,
    pub merge_cycle_qty: u64,
    pub merge_cycle_with_merge_qty: u64,
    pub merge_gained_data_file_qty: u64,
    pub merge_gained_bytes: u64,
    pub hint_file_created_qty: u64,
}

#[derive(Default)]
pub(crate) struct Counters {
    pub open_call_qty: AtomicU64,
    pub open_call_failed_qty: AtomicU64,
    pub close_call_qty: AtomicU64,
    pub close_call_failed_qty: AtomicU64,
    pub put_call_qty: AtomicU64,
    pub put_call_failed_qty: AtomicU64,
    pub remove_call_qty: AtomicU64,
    pub remove_call_not_found_qty: AtomicU64,
    pub remove_call_failed_qty: AtomicU64,
    pub get_call_qty: AtomicU64,
    pub get_call_not_found_qty: AtomicU64,
    pub get_call_corrupted_qty: AtomicU64,
    pub get_call_failed_qty: AtomicU64,
    pub get_write_buffer_hit_qty: AtomicU64,
    pub get_cache_hit_qty: AtomicU64,
    pub query_call_qty: AtomicU64,
    pub query_call_failed_qty: AtomicU64,
    pub data_file_creation_qty: AtomicU64,
    pub active_data_file_switch_qty: AtomicU64,
    pub index_array_cleaning_qty: AtomicU64,
    pub index_array_cleaned_entries: AtomicU64,
    pub merge_cycle_qty: AtomicU64,
    pub merge_cycle_with_merge_qty: AtomicU64,
    pub merge_gained_data_file_qty: AtomicU64,
    pub merge_gained_bytes: AtomicU64,
    pub hint_file_created_qty: AtomicU64,
}

/// Wake/exit plumbing for one maintenance thread. The `work` flag is set by
/// an explicit request and cleared once the requested run completes, which
/// is exactly what the `is_*_ongoing` accessors report.
pub(crate) struct TaskControl {
    work: Mutex<bool>,
    cv: Condvar,
    exit: AtomicBool,
}

impl TaskControl {
    fn new() -> Self {
        Self {
            work: Mutex::new(false),
            cv: Condvar::new(),
            exit: AtomicBool::new(false),
        }
    }

    pub(crate) fn request(&self) -> bool {
        let mut work = self.work.lock().unwrap();
        if !*work {
            *work = true;
            self.cv.notify_one();
            true
        } else {
            false
        }
    }

    pub(crate) fn is_ongoing(&self) -> bool {
        *self.work.lock().unwrap()
    }

    pub(crate) fn set_done(&self) {
        *self.work.lock().unwrap() = false;
    }

    fn signal_exit(&self) {
        let _work = self.work.lock().unwrap();
        self.exit.store(true, Ordering::SeqCst);
        self.cv.notify_one();
    }

    fn clear_exit(&self) {
        self.exit.store(false, Ordering::SeqCst);
    }

    /// Parks until the period elapses, a request arrives, or shutdown.
    /// Returns false on shutdown.
    pub(crate) fn wait_cycle(&self, period: Duration) -> bool {
        let work = self.work.lock().unwrap();
        let _unused = self
            .cv
            .wait_timeout_while(work, period, |requested| {
                !*requested && !self.exit.load(Ordering::SeqCst)
            })
            .unwrap();
        !self.exit.load(Ordering::SeqCst)
    }
}

/// The active file's append state: id, logical offset, the on-disk
/// watermark and the staging buffer covering the bytes in between.
pub(crate) struct ActiveState {
    pub file_id: u16,
    pub offset: u32,
    pub flushed_offset: u32,
    pub buffer: Vec<u8>,
}

pub(crate) struct Shared {
    pub is_open: AtomicBool,
    pub directory: RwLock<PathBuf>,
    pub lock_file: Mutex<Option<StoreLock>>,
    pub config: Mutex<Config>,
    pub data_file_max_bytes: AtomicU64,
    pub keydir: KeyDir,
    pub cache: ValueCache,
    pub index: RwLock<IndexMap>,
    pub files: RwLock<FileTable>,
    pub active: RwLock<ActiveState>,
    pub counters: Counters,
    pub now_sec: AtomicU32,
    #[allow(clippy::type_complexity)]
    pub test_time_fn: Mutex<Option<Box<dyn Fn() -> u32 + Send + Sync>>>,
    pub merge_ctl: TaskControl,
    pub upkeep_ctl: TaskControl,
    pub hint_backfill_needed: AtomicBool,
}

impl Shared {
    pub(crate) fn update_now(&self) {
        let now = match &*self.test_time_fn.lock().unwrap() {
            Some(f) => f(),
            None => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs() as u32)
                .unwrap_or(0),
        };
        self.now_sec.store(now, Ordering::Release);
        self.keydir.set_now(now);
    }

    pub(crate) fn wall_clock_secs() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    /// Flushes the staged bytes to the OS. Caller holds the active lock.
    pub(crate) fn flush_write_buffer(&self, active: &mut ActiveState) -> Result<()> {
        let pending = active.offset - active.flushed_offset;
        if pending == 0 {
            return Ok(());
        }
        let file = self
            .files
            .read()?
            .get(active.file_id)
            .ok_or(Error::BadDiskAccess)?;
        append_all(&file.file, &active.buffer[..pending as usize])?;
        active.flushed_offset = active.offset;
        Ok(())
    }

    /// Seals the active file and opens the next one. Caller holds the
    /// active lock.
    pub(crate) fn rotate_active_file(&self, active: &mut ActiveState) -> Result<()> {
        if active.file_id != NO_FILE {
            self.flush_write_buffer(active)?;
        }

        let mut files = self.files.write()?;
        let file_id = files.alloc_file_id()?;
        let name = format::data_file_name(file_id, Self::wall_clock_secs());
        let path = self.directory.read()?.join(name);
        let file = File::options()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        files.insert(Arc::new(DataFile::new(file_id, path.clone(), file)));
        drop(files);

        active.file_id = file_id;
        active.offset = 0;
        active.flushed_offset = 0;

        self.counters
            .data_file_creation_qty
            .fetch_add(1, Ordering::Relaxed);
        self.counters
            .active_data_file_switch_qty
            .fetch_add(1, Ordering::Relaxed);
        tracing::debug!(file_id, path = %path.display(), "created new active data file");
        Ok(())
    }
}

/// The embedded datastore.
///
/// One instance serves concurrent readers and writers from any thread;
/// `open` spawns the merge and upkeep maintenance threads, `close` (or
/// dropping the store) joins them after flushing.
pub struct Datastore {
    shared: Arc<Shared>,
    merge_thread: Mutex<Option<JoinHandle<()>>>,
    upkeep_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Datastore {
    /// Creates a closed datastore with the default cache capacity.
    pub fn new() -> Self {
        Self::with_cache_bytes(DEFAULT_CACHE_BYTES)
    }

    /// Creates a closed datastore with an explicit value cache capacity;
    /// zero disables the cache.
    pub fn with_cache_bytes(cache_bytes: u64) -> Self {
        // Building the resize callback needs the shared state it wakes, so
        // wire it through a weak cell filled right after construction.
        let upkeep_hook: Arc<Mutex<Option<std::sync::Weak<Shared>>>> =
            Arc::new(Mutex::new(None));
        let hook = Arc::clone(&upkeep_hook);

        let shared = Arc::new(Shared {
            is_open: AtomicBool::new(false),
            directory: RwLock::new(PathBuf::new()),
            lock_file: Mutex::new(None),
            config: Mutex::new(Config::default()),
            data_file_max_bytes: AtomicU64::new(u64::from(Config::default().data_file_max_bytes)),
            keydir: KeyDir::new(
                KEY_STORAGE_ALLOC_BYTES,
                INITIAL_MAP_CAPACITY,
                Box::new(move || {
                    if let Some(shared) = hook.lock().unwrap().as_ref().and_then(|w| w.upgrade()) {
                        shared.upkeep_ctl.request();
                    }
                }),
            ),
            cache: ValueCache::new(cache_bytes),
            index: RwLock::new(IndexMap::new(KEY_STORAGE_ALLOC_BYTES, INITIAL_MAP_CAPACITY)),
            files: RwLock::new(FileTable::new()),
            active: RwLock::new(ActiveState {
                file_id: NO_FILE,
                offset: 0,
                flushed_offset: 0,
                buffer: vec![0; DEFAULT_WRITE_BUFFER_BYTES],
            }),
            counters: Counters::default(),
            now_sec: AtomicU32::new(0),
            test_time_fn: Mutex::new(None),
            merge_ctl: TaskControl::new(),
            upkeep_ctl: TaskControl::new(),
            hint_backfill_needed: AtomicBool::new(false),
        });
        *upkeep_hook.lock().unwrap() = Some(Arc::downgrade(&shared));

        Self {
            shared,
            merge_thread: Mutex::new(None),
            upkeep_thread: Mutex::new(None),
        }
    }

    // ---- lifecycle ----

    /// Opens (and creates if missing) the datastore at `path`, recovers the
    /// key directory from the data and hint files, then starts the
    /// maintenance threads.
    pub fn open(&self, path: impl AsRef<Path>) -> Result<()> {
        self.open_with(path, true)
    }

    pub fn open_with(&self, path: impl AsRef<Path>, create_if_missing: bool) -> Result<()> {
        let result = self.open_inner(path.as_ref(), create_if_missing);
        match &result {
            Ok(()) => {
                self.shared
                    .counters
                    .open_call_qty
                    .fetch_add(1, Ordering::Relaxed);
                tracing::info!("datastore successfully opened");
            }
            Err(e) => {
                self.shared
                    .counters
                    .open_call_failed_qty
                    .fetch_add(1, Ordering::Relaxed);
                tracing::error!(error = %e, "'open' failed");
                // A lock claimed before the failure must not outlive it.
                if !self.shared.is_open.load(Ordering::Acquire) {
                    if let Ok(mut lock_file) = self.shared.lock_file.lock() {
                        if let Some(lock) = lock_file.take() {
                            let _ = lock.release();
                        }
                    }
                }
            }
        }
        result
    }

    fn open_inner(&self, path: &Path, create_if_missing: bool) -> Result<()> {
        let shared = &self.shared;
        if shared.is_open.load(Ordering::Acquire) {
            return Err(Error::StoreAlreadyOpen);
        }

        if !path.exists() && create_if_missing {
            std::fs::create_dir_all(path).map_err(|_| Error::CannotOpenStore)?;
        }
        if !path.is_dir() {
            return Err(Error::CannotOpenStore);
        }

        let lock = StoreLock::acquire(path)?;

        let found = recovery::sanitize_and_collect(path)?;
        if !create_if_missing && found.is_empty() {
            return Err(Error::CannotOpenStore);
        }

        // Reset all in-memory state before reloading.
        *shared.directory.write()? = path.to_path_buf();
        *shared.lock_file.lock()? = Some(lock);
        shared.keydir.reset();
        shared.cache.reset();
        shared.index.write()?.clear();
        shared.files.write()?.clear();
        shared.hint_backfill_needed.store(false, Ordering::Release);
        shared.merge_ctl.clear_exit();
        shared.upkeep_ctl.clear_exit();
        shared.merge_ctl.set_done();
        shared.upkeep_ctl.set_done();
        {
            let mut active = shared.active.write()?;
            active.file_id = NO_FILE;
            active.offset = 0;
            active.flushed_offset = 0;
        }
        shared.update_now();

        recovery::load_store(shared, &found)?;

        {
            let mut active = shared.active.write()?;
            shared.rotate_active_file(&mut active)?;
        }

        let merge_shared = Arc::clone(shared);
        *self.merge_thread.lock().unwrap() = Some(
            std::thread::Builder::new()
                .name("litecask-merge".into())
                .spawn(move || merge::merge_thread_entry(&merge_shared))
                .map_err(|_| Error::CannotOpenStore)?,
        );
        let upkeep_shared = Arc::clone(shared);
        *self.upkeep_thread.lock().unwrap() = Some(
            std::thread::Builder::new()
                .name("litecask-upkeep".into())
                .spawn(move || upkeep::upkeep_thread_entry(&upkeep_shared))
                .map_err(|_| Error::CannotOpenStore)?,
        );

        shared.is_open.store(true, Ordering::Release);
        Ok(())
    }

    /// Flushes, stops the maintenance threads and releases the directory
    /// lock.
    pub fn close(&self) -> Result<()> {
        let shared = &self.shared;
        if !shared.is_open.load(Ordering::Acquire) {
            shared
                .counters
                .close_call_failed_qty
                .fetch_add(1, Ordering::Relaxed);
            return Err(Error::StoreNotOpen);
        }
        tracing::info!("closing datastore");

        shared.merge_ctl.signal_exit();
        shared.upkeep_ctl.signal_exit();
        if let Some(handle) = self.merge_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.upkeep_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        shared.merge_ctl.clear_exit();
        shared.upkeep_ctl.clear_exit();

        shared.is_open.store(false, Ordering::Release);
        {
            let mut active = shared.active.write()?;
            shared.flush_write_buffer(&mut active)?;
            active.file_id = NO_FILE;
            active.offset = 0;
            active.flushed_offset = 0;
        }
        shared.files.write()?.clear();
        if let Some(lock) = shared.lock_file.lock()?.take() {
            lock.release()?;
        }
        *shared.directory.write()? = PathBuf::new();

        shared
            .counters
            .close_call_qty
            .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    // ---- write path ----

    /// Stores `value` under `key`.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.put_with(key, value, &[], 0, false)
    }

    /// Stores `value` under `key` with searchable key indexes, a TTL in
    /// seconds (zero = never expires) and an optional forced disk sync.
    pub fn put_with(
        &self,
        key: &[u8],
        value: &[u8],
        indexes: &[KeyIndex],
        ttl_sec: u32,
        force_sync: bool,
    ) -> Result<()> {
        let shared = &self.shared;
        let fail = |e: Error| {
            shared
                .counters
                .put_call_failed_qty
                .fetch_add(1, Ordering::Relaxed);
            Err(e)
        };

        if key.is_empty() || key.len() > MAX_KEY_SIZE {
            return fail(Error::BadKeySize);
        }
        if let Err(e) = validate_indexes(key.len(), indexes) {
            return fail(e);
        }
        if value.len() >= MAX_VALUE_SIZE {
            return fail(Error::BadValueSize);
        }

        let hash = hash_bytes(key);
        let ttl_deadline_sec = if ttl_sec == 0 {
            0
        } else {
            shared
                .now_sec
                .load(Ordering::Acquire)
                .saturating_add(ttl_sec)
        };
        let record_len = data_record_len(key.len(), indexes.len(), value.len());
        let mut record = vec![0u8; record_len];
        encode_data_record(&mut record, ttl_deadline_sec, key, indexes, Some(value));
        let counter_seed = record[0];

        let (entry_file_id, entry_offset) = {
            let mut active = shared.active.write()?;
            if !shared.is_open.load(Ordering::Acquire) {
                return fail(Error::StoreNotOpen);
            }
            // A non-empty active file must not outgrow its bound; a fresh
            // file accepts an entry of any size.
            if active.offset > 0
                && u64::from(active.offset) + (DATA_HEADER_SIZE + key.len() + value.len()) as u64
                    >= shared.data_file_max_bytes.load(Ordering::Acquire)
            {
                if let Err(e) = shared.rotate_active_file(&mut active) {
                    return fail(e);
                }
            }
            match self.append_record(&mut active, &record, force_sync) {
                Ok(location) => location,
                Err(e) => return fail(e),
            }
        };

        let cache_loc = if shared.cache.is_enabled() {
            shared.cache.insert_value(value, hash, ttl_deadline_sec)
        } else {
            NOT_STORED
        };

        let entry = KeyDirEntry {
            ttl_deadline_sec,
            value_size: value.len() as u32,
            cache_loc,
            file_offset: entry_offset,
            file_id: entry_file_id,
            key_size: key.len() as u16,
            index_count: indexes.len() as u8,
            change_counter: counter_seed,
        };
        let old = match shared.keydir.insert_entry(hash, key, indexes, entry) {
            Ok(old) => old,
            Err(e) => {
                if e == Error::OutOfMemory {
                    tracing::error!(
                        "unable to store the new key due to out of memory; the run-time \
                         integrity of the datastore is compromised (data files are intact), \
                         reopen the store to recover"
                    );
                }
                return fail(e);
            }
        };

        self.register_indexes(key, hash, indexes, old.as_ref());

        if let Some(old) = &old {
            if old.cache_loc != NOT_STORED && shared.cache.is_enabled() {
                shared.cache.remove_value(old.cache_loc, hash);
            }
            if let Some(file) = shared.files.read().unwrap().get(old.file_id) {
                file.add_dead(old_record_len(key.len(), old));
            }
        }

        shared.counters.put_call_qty.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Removes `key`, writing a tombstone record.
    pub fn remove(&self, key: &[u8], force_sync: bool) -> Result<()> {
        let shared = &self.shared;

        if key.is_empty() || key.len() > MAX_KEY_SIZE {
            shared
                .counters
                .remove_call_failed_qty
                .fetch_add(1, Ordering::Relaxed);
            return Err(Error::BadKeySize);
        }

        let hash = hash_bytes(key);
        let record_len = data_record_len(key.len(), 0, 0);
        let mut record = vec![0u8; record_len];
        encode_data_record(&mut record, 0, key, &[], None);
        let counter_seed = record[0];

        let (entry_file_id, entry_offset) = {
            let mut active = shared.active.write()?;
            if !shared.is_open.load(Ordering::Acquire) {
                shared
                    .counters
                    .remove_call_failed_qty
                    .fetch_add(1, Ordering::Relaxed);
                return Err(Error::StoreNotOpen);
            }

            // Writing a tombstone for an absent key would only grow the log.
            let existing = shared.keydir.find(hash, key);
            if existing.map_or(true, |e| e.is_deleted()) {
                shared
                    .counters
                    .remove_call_not_found_qty
                    .fetch_add(1, Ordering::Relaxed);
                return Err(Error::EntryNotFound);
            }

            if active.offset > 0
                && u64::from(active.offset) + (DATA_HEADER_SIZE + key.len()) as u64
                    >= shared.data_file_max_bytes.load(Ordering::Acquire)
            {
                if let Err(e) = shared.rotate_active_file(&mut active) {
                    shared
                        .counters
                        .remove_call_failed_qty
                        .fetch_add(1, Ordering::Relaxed);
                    return Err(e);
                }
            }
            match self.append_record(&mut active, &record, force_sync) {
                Ok(location) => location,
                Err(e) => {
                    shared
                        .counters
                        .remove_call_failed_qty
                        .fetch_add(1, Ordering::Relaxed);
                    return Err(e);
                }
            }
        };

        if let Some(file) = shared.files.read().unwrap().get(entry_file_id) {
            file.add_tombstone(record_len as u32);
        }

        let entry = KeyDirEntry {
            ttl_deadline_sec: 0,
            value_size: DELETED_ENTRY,
            cache_loc: NOT_STORED,
            file_offset: entry_offset,
            file_id: entry_file_id,
            key_size: key.len() as u16,
            index_count: 0,
            change_counter: counter_seed,
        };
        let old = match shared.keydir.insert_entry(hash, key, &[], entry) {
            Ok(old) => old,
            Err(e) => {
                shared
                    .counters
                    .remove_call_failed_qty
                    .fetch_add(1, Ordering::Relaxed);
                if e == Error::OutOfMemory {
                    tracing::error!(
                        "unable to store the tombstone due to out of memory; reopen the \
                         store to recover (data files are intact)"
                    );
                }
                return Err(e);
            }
        };

        if let Some(old) = &old {
            if old.cache_loc != NOT_STORED && shared.cache.is_enabled() {
                shared.cache.remove_value(old.cache_loc, hash);
            }
            if let Some(file) = shared.files.read().unwrap().get(old.file_id) {
                file.add_dead(old_record_len(key.len(), old));
            }
        }

        shared
            .counters
            .remove_call_qty
            .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    // Stages the record in the write buffer, or writes it straight to the
    // file when it does not fit. Returns the record's location.
    fn append_record(
        &self,
        active: &mut ActiveState,
        record: &[u8],
        force_sync: bool,
    ) -> Result<(u16, u32)> {
        let shared = &self.shared;
        let pending = (active.offset - active.flushed_offset) as usize;
        if pending + record.len() > active.buffer.len() {
            shared.flush_write_buffer(active)?;
        }

        let location = (active.file_id, active.offset);
        let pending = (active.offset - active.flushed_offset) as usize;
        if pending + record.len() <= active.buffer.len() {
            active.buffer[pending..pending + record.len()].copy_from_slice(record);
            active.offset += record.len() as u32;
            if force_sync {
                shared.flush_write_buffer(active)?;
            }
        } else {
            // Entry bigger than the buffer, which was just flushed: write
            // it directly.
            let file = shared
                .files
                .read()?
                .get(active.file_id)
                .ok_or(Error::BadDiskAccess)?;
            append_all(&file.file, record)?;
            active.offset += record.len() as u32;
            active.flushed_offset = active.offset;
        }

        if force_sync {
            let file = shared
                .files
                .read()?
                .get(active.file_id)
                .ok_or(Error::BadDiskAccess)?;
            file.file.sync_all()?;
        }

        if let Some(file) = shared.files.read()?.get(active.file_id) {
            file.add_entry(record.len() as u32);
        }
        Ok(location)
    }

    fn register_indexes(
        &self,
        key: &[u8],
        hash: u64,
        indexes: &[KeyIndex],
        old: Option<&crate::keydir::OldEntry>,
    ) {
        let mut old_idx = 0usize;
        for ki in indexes {
            // Only register parts absent from the previous index set; both
            // lists are sorted, so one forward walk suffices.
            let mut do_add = old.is_none();
            if let Some(old) = old {
                while old_idx < old.indexes.len()
                    && (old.indexes[old_idx].start_idx < ki.start_idx
                        || (old.indexes[old_idx].start_idx == ki.start_idx
                            && old.indexes[old_idx].size < ki.size))
                {
                    old_idx += 1;
                }
                do_add = old_idx >= old.indexes.len()
                    || old.indexes[old_idx].start_idx != ki.start_idx
                    || old.indexes[old_idx].size != ki.size;
            }
            if do_add {
                let start = ki.start_idx as usize;
                let part = &key[start..start + ki.size as usize];
                if let Err(e) = self
                    .shared
                    .index
                    .write()
                    .unwrap()
                    .insert_index(part, hash_prefix(hash))
                {
                    tracing::warn!(error = %e, "key part index registration failed");
                }
            }
        }
    }

    // ---- read path ----

    /// Fetches the current value of `key`.
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        let shared = &self.shared;
        let fail = |counter: &AtomicU64, e: Error| {
            counter.fetch_add(1, Ordering::Relaxed);
            Err(e)
        };

        if key.is_empty() || key.len() > MAX_KEY_SIZE {
            return fail(&shared.counters.get_call_failed_qty, Error::BadKeySize);
        }
        if !shared.is_open.load(Ordering::Acquire) {
            return fail(&shared.counters.get_call_failed_qty, Error::StoreNotOpen);
        }

        let hash = hash_bytes(key);

        // A merge can relocate the record between the directory lookup and
        // the pread; one retry re-reads the patched location.
        for _attempt in 0..2 {
            let Some(entry) = shared.keydir.find(hash, key) else {
                break;
            };
            if entry.is_deleted() {
                break;
            }

            // Tail of the active file still sitting in the write buffer.
            {
                let active = shared.active.read().unwrap();
                if entry.file_id == active.file_id
                    && entry.file_offset >= active.flushed_offset
                    && ((entry.file_offset - active.flushed_offset) as usize)
                        < active.buffer.len()
                {
                    let start = (entry.file_offset - active.flushed_offset) as usize
                        + DATA_HEADER_SIZE
                        + 2 * entry.index_count as usize
                        + key.len();
                    let value = active.buffer[start..start + entry.value_size as usize].to_vec();
                    drop(active);
                    shared.counters.get_call_qty.fetch_add(1, Ordering::Relaxed);
                    shared
                        .counters
                        .get_write_buffer_hit_qty
                        .fetch_add(1, Ordering::Relaxed);
                    return Ok(value);
                }
            }

            if shared.cache.is_enabled() {
                if let Some(value) = shared
                    .cache
                    .get_value(entry.cache_loc, hash, entry.value_size)
                {
                    shared.counters.get_call_qty.fetch_add(1, Ordering::Relaxed);
                    shared
                        .counters
                        .get_cache_hit_qty
                        .fetch_add(1, Ordering::Relaxed);
                    return Ok(value);
                }
            }

            let Some(file) = shared.files.read().unwrap().get(entry.file_id) else {
                continue; // merged away; retry through the patched directory
            };
            let record_len = data_record_len(
                key.len(),
                entry.index_count as usize,
                entry.value_size as usize,
            );
            let mut record = vec![0u8; record_len];
            if pread_exact(&file.file, &mut record, u64::from(entry.file_offset)).is_err()
                || !format::verify_record_crc(&record)
            {
                return fail(
                    &shared.counters.get_call_corrupted_qty,
                    Error::EntryCorrupted,
                );
            }

            let value_start = DATA_HEADER_SIZE + 2 * entry.index_count as usize + key.len();
            let value = record[value_start..].to_vec();

            if shared.cache.is_enabled() {
                let cache_loc = shared
                    .cache
                    .insert_value(&value, hash, entry.ttl_deadline_sec);
                // The change counter wards off the ABA case where the entry
                // was replaced while we read from disk.
                shared.keydir.update_cached_value_location(
                    hash,
                    key,
                    entry.value_size,
                    entry.change_counter,
                    cache_loc,
                );
            }

            shared.counters.get_call_qty.fetch_add(1, Ordering::Relaxed);
            return Ok(value);
        }

        fail(
            &shared.counters.get_call_not_found_qty,
            Error::EntryNotFound,
        )
    }

    // ---- query path ----

    /// Returns the keys carrying the given key part as a declared index.
    pub fn query(&self, key_part: &[u8]) -> Result<Vec<Vec<u8>>> {
        self.query_all(&[key_part])
    }

    /// Returns the keys carrying every one of the given key parts (AND).
    pub fn query_all(&self, key_parts: &[&[u8]]) -> Result<Vec<Vec<u8>>> {
        let shared = &self.shared;
        shared
            .counters
            .query_call_qty
            .fetch_add(1, Ordering::Relaxed);
        let fail = |e: Error| {
            shared
                .counters
                .query_call_failed_qty
                .fetch_add(1, Ordering::Relaxed);
            Err(e)
        };

        if !shared.is_open.load(Ordering::Acquire) {
            return fail(Error::StoreNotOpen);
        }
        for part in key_parts {
            if part.len() > MAX_KEY_SIZE {
                return fail(Error::BadKeySize);
            }
        }

        // Pick the part with the fewest candidates to minimize validation.
        let source_idx: usize = {
            let index = shared.index.read().unwrap();
            let mut best: Option<(usize, u32)> = None;
            for (i, part) in key_parts.iter().enumerate() {
                let count = index.entry_count(part);
                if count == 0 {
                    return Ok(Vec::new());
                }
                if best.map_or(true, |(_, c)| count < c) {
                    best = Some((i, count));
                }
            }
            match best {
                Some((i, _)) => i,
                None => return Ok(Vec::new()),
            }
        };
        let source_part = key_parts[source_idx];
        let candidates = shared.index.read().unwrap().entry_hashes(source_part);

        let mut matching_keys = Vec::new();
        let mut invalid = Vec::new();
        for &candidate in &candidates {
            let Some((key, key_indexes)) = shared.keydir.get_key_and_indexes(candidate) else {
                invalid.push(candidate);
                continue;
            };

            // The source part must really be declared by this key; a miss
            // marks the candidate stale.
            if !key_part_declared(&key, &key_indexes, source_part) {
                invalid.push(candidate);
                continue;
            }
            let all_found = key_parts
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != source_idx)
                .all(|(_, part)| key_part_declared(&key, &key_indexes, part));
            if all_found {
                matching_keys.push(key);
            }
        }

        // Lazy cleaning once enough of the array proved stale: both the
        // index array and the per-entry index lists are pruned.
        const MIN_MISMATCH_ENTRIES: usize = 10;
        const MIN_MISMATCH_ARRAY_PERCENT: usize = 10;
        if invalid.len() > MIN_MISMATCH_ENTRIES
            && invalid.len() * 100 > MIN_MISMATCH_ARRAY_PERCENT * candidates.len()
        {
            shared
                .counters
                .index_array_cleaning_qty
                .fetch_add(1, Ordering::Relaxed);
            let cleaned = shared.index.write()?.clean_entries(
                source_part,
                &invalid,
                |hash| shared.keydir.clean_index(hash, source_part),
            );
            shared
                .counters
                .index_array_cleaned_entries
                .fetch_add(cleaned, Ordering::Relaxed);
        }

        Ok(matching_keys)
    }

    // ---- maintenance and observability ----

    /// Flushes the write buffer to the OS.
    pub fn sync(&self) -> Result<()> {
        let shared = &self.shared;
        if !shared.is_open.load(Ordering::Acquire) {
            return Err(Error::StoreNotOpen);
        }
        let mut active = shared.active.write()?;
        shared.flush_write_buffer(&mut active)
    }

    /// Wakes the merge thread. Returns whether a new run was scheduled.
    pub fn request_merge(&self) -> bool {
        self.shared.is_open.load(Ordering::Acquire) && self.shared.merge_ctl.request()
    }

    /// Wakes the upkeep thread. Returns whether a new run was scheduled.
    pub fn request_upkeep(&self) -> bool {
        self.shared.is_open.load(Ordering::Acquire) && self.shared.upkeep_ctl.request()
    }

    pub fn is_merge_ongoing(&self) -> bool {
        self.shared.merge_ctl.is_ongoing()
    }

    pub fn is_upkeep_ongoing(&self) -> bool {
        self.shared.upkeep_ctl.is_ongoing()
    }

    /// Validates and applies a new configuration atomically.
    pub fn set_config(&self, config: Config) -> Result<()> {
        config.validate()?;
        let shared = &self.shared;
        let mut current = shared.config.lock()?;
        shared
            .data_file_max_bytes
            .store(u64::from(config.data_file_max_bytes), Ordering::Release);
        shared
            .cache
            .set_target_memory_load_percentage(config.value_cache_target_memory_load_percentage);
        *current = config;
        Ok(())
    }

    pub fn get_config(&self) -> Config {
        self.shared.config.lock().unwrap().clone()
    }

    /// Resizes the write buffer, flushing any staged bytes first.
    pub fn set_write_buffer_bytes(&self, bytes: usize) -> Result<()> {
        let shared = &self.shared;
        let mut active = shared.active.write()?;
        if shared.is_open.load(Ordering::Acquire) {
            shared.flush_write_buffer(&mut active)?;
        }
        active.buffer = vec![0; bytes];
        Ok(())
    }

    pub fn counters(&self) -> DatastoreCounters {
        let c = &self.shared.counters;
        DatastoreCounters {
            open_call_qty: c.open_call_qty.load(Ordering::Relaxed),
            open_call_failed_qty: c.open_call_failed_qty.load(Ordering::Relaxed),
            close_call_qty: c.close_call_qty.load(Ordering::Relaxed),
            close_call_failed_qty: c.close_call_failed_qty.load(Ordering::Relaxed),
            put_call_qty: c.put_call_qty.load(Ordering::Relaxed),
            put_call_failed_qty: c.put_call_failed_qty.load(Ordering::Relaxed),
            remove_call_qty: c.remove_call_qty.load(Ordering::Relaxed),
            remove_call_not_found_qty: c.remove_call_not_found_qty.load(Ordering::Relaxed),
            remove_call_failed_qty: c.remove_call_failed_qty.load(Ordering::Relaxed),
            get_call_qty: c.get_call_qty.load(Ordering::Relaxed),
            get_call_not_found_qty: c.get_call_not_found_qty.load(Ordering::Relaxed),
            get_call_corrupted_qty: c.get_call_corrupted_qty.load(Ordering::Relaxed),
            get_call_failed_qty: c.get_call_failed_qty.load(Ordering::Relaxed),
            get_write_buffer_hit_qty: c.get_write_buffer_hit_qty.load(Ordering::Relaxed),
            get_cache_hit_qty: c.get_cache_hit_qty.load(Ordering::Relaxed),
            query_call_qty: c.query_call_qty.load(Ordering::Relaxed),
            query_call_failed_qty: c.query_call_failed_qty.load(Ordering::Relaxed),
            data_file_creation_qty: c.data_file_creation_qty.load(Ordering::Relaxed),
            active_data_file_switch_qty: c.active_data_file_switch_qty.load(Ordering::Relaxed),
            index_array_cleaning_qty: c.index_array_cleaning_qty.load(Ordering::Relaxed),
            index_array_cleaned_entries: c.index_array_cleaned_entries.load(Ordering::Relaxed),
            merge_cycle_qty: c.merge_cycle_qty.load(Ordering::Relaxed),
            merge_cycle_with_merge_qty: c.merge_cycle_with_merge_qty.load(Ordering::Relaxed),
            merge_gained_data_file_qty: c.merge_gained_data_file_qty.load(Ordering::Relaxed),
            merge_gained_bytes: c.merge_gained_bytes.load(Ordering::Relaxed),
            hint_file_created_qty: c.hint_file_created_qty.load(Ordering::Relaxed),
        }
    }

    pub fn value_cache_counters(&self) -> ValueCacheCounters {
        self.shared.cache.counters()
    }

    pub fn value_cache_allocated_bytes(&self) -> u64 {
        self.shared.cache.allocated_bytes()
    }

    pub fn value_cache_max_allocatable_bytes(&self) -> u64 {
        self.shared.cache.max_allocatable_bytes()
    }

    /// Aggregate statistics across the data files.
    pub fn file_stats(&self) -> DataFileStats {
        self.shared.files.read().unwrap().stats()
    }

    /// Rough memory footprint of the in-memory structures.
    pub fn estimated_used_memory_bytes(&self, with_cache: bool) -> u64 {
        let shared = &self.shared;
        let mut used = shared.keydir.estimated_used_memory_bytes();
        used += shared.index.read().unwrap().estimated_used_memory_bytes();
        used += shared.active.read().unwrap().buffer.len() as u64;
        if with_cache {
            used += shared.cache.allocated_bytes();
        }
        used
    }

    /// Average/max probe instrumentation of the key directory.
    pub fn keydir_probe_stats(&self) -> crate::keydir::ProbeStats {
        self.shared.keydir.probe_stats()
    }

    pub fn set_keydir_instrumentation(&self, enable: bool) {
        self.shared.keydir.set_instrumentation_enable(enable);
    }

    pub fn keydir_load_factor(&self) -> f64 {
        self.shared.keydir.load_factor()
    }

    pub fn set_keydir_max_load_factor(&self, f: f64) -> bool {
        self.shared.keydir.set_max_load_factor(f)
    }

    /// Injects a deterministic time source (wall seconds) and refreshes the
    /// engine's notion of "now". Re-set it to advance time in tests.
    pub fn set_test_time_fn(&self, f: impl Fn() -> u32 + Send + Sync + 'static) {
        *self.shared.test_time_fn.lock().unwrap() = Some(Box::new(f));
        self.shared.update_now();
    }
}

impl Default for Datastore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Datastore {
    fn drop(&mut self) {
        if self.shared.is_open.load(Ordering::Acquire) {
            let _ = self.close();
        }
    }
}

fn validate_indexes(key_len: usize, indexes: &[KeyIndex]) -> Result<()> {
    if indexes.len() > MAX_KEY_INDEX_QTY {
        return Err(Error::InconsistentKeyIndex);
    }
    let mut last = KeyIndex {
        start_idx: 0,
        size: 0,
    };
    for ki in indexes {
        if ki.size == 0 || ki.start_idx as usize + ki.size as usize > key_len {
            return Err(Error::InconsistentKeyIndex);
        }
        if ki.start_idx < last.start_idx || (ki.start_idx == last.start_idx && ki.size <= last.size)
        {
            return Err(Error::UnorderedKeyIndex);
        }
        last = *ki;
    }
    Ok(())
}

fn key_part_declared(key: &[u8], key_indexes: &[KeyIndex], part: &[u8]) -> bool {
    key_indexes.iter().any(|ki| {
        let start = ki.start_idx as usize;
        ki.size as usize == part.len()
            && start + part.len() <= key.len()
            && &key[start..start + part.len()] == part
    })
}

fn old_record_len(key_len: usize, old: &crate::keydir::OldEntry) -> u32 {
    let value = if old.value_size == DELETED_ENTRY {
        0
    } else {
        old.value_size
    };
    (DATA_HEADER_SIZE + 2 * old.indexes.len() + key_len) as u32 + value
}
