use byteorder::{ByteOrder, LittleEndian};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use crate::tlsf::{CheckContext, Tlsf, NOT_STORED};

// Chunk header preceding each cached value in the arena:
//   [0..8]   owner id (the 64-bit key hash)
//   [8..12]  ttl deadline, seconds
//   [12..16] value size
//   [16..18] flags: bits 0-1 queue tag, bit 2 accessed-since-last-scan
//   [18..20] unused
//   [20..24] prev LRU link (arena handle)
//   [24..28] next LRU link (arena handle)
const CHUNK_HEADER: usize = 28;

const QUEUE_MASK: u16 = 0x3;
const FLAG_ACTIVE: u16 = 0x4;

const QUEUE_NONE: u16 = 0;
const QUEUE_HOT: u16 = 1;
const QUEUE_WARM: u16 = 2;
const QUEUE_COLD: u16 = 3;

/// Eviction attempts per forced-eviction round when an insertion cannot
/// allocate.
const SMALL_BATCH_SIZE: u32 = 10;

/// Monotonic cache counters plus the current (non-monotonic) entry count.
#[derive(Clone, Copy, Debug, Default)]
pub struct ValueCacheCounters {
    pub insert_call_qty: u64,
    pub get_call_qty: u64,
    pub remove_call_qty: u64,
    pub current_in_cache_value_qty: u32,
    pub hit_qty: u64,
    pub miss_qty: u64,
    pub evicted_qty: u64,
}

#[derive(Clone, Copy)]
struct LruQueue {
    head: u32,
    tail: u32,
    bytes: u64,
}

impl LruQueue {
    const fn new() -> Self {
        Self {
            head: NOT_STORED,
            tail: NOT_STORED,
            bytes: 0,
        }
    }
}

struct CacheInner {
    alloc: Tlsf,
    queues: [LruQueue; 4], // indexed by queue tag; slot 0 unused
}

#[derive(Default)]
struct Stats {
    insert_call_qty: AtomicU64,
    get_call_qty: AtomicU64,
    remove_call_qty: AtomicU64,
    current_in_cache_value_qty: AtomicU32,
    hit_qty: AtomicU64,
    miss_qty: AtomicU64,
    evicted_qty: AtomicU64,
}

/// Segmented-LRU value cache backed by a TLSF arena.
///
/// New values enter the hot queue; a hit only marks the chunk accessed, and
/// the background LRU maintenance later promotes accessed chunks to warm
/// and demotes untouched ones to cold, where eviction picks its victims.
/// The warm-tail rotation gives every once-accessed value a second chance
/// before it can reach cold, which is what makes a one-pass scan unable to
/// flush the working set.
pub struct ValueCache {
    inner: Mutex<CacheInner>,
    stats: Stats,
    target_load_percentage: AtomicU32,
    max_bytes: u64,
}

impl ValueCache {
    pub fn new(value_max_alloc_bytes: u64) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                alloc: Tlsf::new(value_max_alloc_bytes),
                queues: [LruQueue::new(); 4],
            }),
            stats: Stats::default(),
            target_load_percentage: AtomicU32::new(90),
            max_bytes: value_max_alloc_bytes,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.max_bytes > 0
    }

    pub fn max_allocatable_bytes(&self) -> u64 {
        self.max_bytes
    }

    pub fn allocated_bytes(&self) -> u64 {
        self.inner.lock().unwrap().alloc.allocated_bytes()
    }

    pub fn set_target_memory_load_percentage(&self, percentage: u32) -> bool {
        if percentage > 100 {
            return false;
        }
        self.target_load_percentage
            .store(percentage, Ordering::Release);
        true
    }

    /// Drops every cached value. Callers must have invalidated all cache
    /// locations beforehand.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.alloc.reset();
        inner.queues = [LruQueue::new(); 4];
        self.stats.current_in_cache_value_qty.store(0, Ordering::Release);
    }

    pub fn counters(&self) -> ValueCacheCounters {
        ValueCacheCounters {
            insert_call_qty: self.stats.insert_call_qty.load(Ordering::Acquire),
            get_call_qty: self.stats.get_call_qty.load(Ordering::Acquire),
            remove_call_qty: self.stats.remove_call_qty.load(Ordering::Acquire),
            current_in_cache_value_qty: self
                .stats
                .current_in_cache_value_qty
                .load(Ordering::Acquire),
            hit_qty: self.stats.hit_qty.load(Ordering::Acquire),
            miss_qty: self.stats.miss_qty.load(Ordering::Acquire),
            evicted_qty: self.stats.evicted_qty.load(Ordering::Acquire),
        }
    }

    /// Inserts a value, force-evicting cold entries in small batches when
    /// the arena is full. Returns `NOT_STORED` when no room can be made.
    pub fn insert_value(&self, data: &[u8], owner_id: u64, ttl_deadline_sec: u32) -> u32 {
        self.stats.insert_call_qty.fetch_add(1, Ordering::Relaxed);
        if !self.is_enabled() {
            return NOT_STORED;
        }
        let target_size = (CHUNK_HEADER + data.len()) as u64;

        let mut inner = self.inner.lock().unwrap();
        let mut loc = inner.alloc.malloc(target_size);

        if loc.is_none() {
            let cc = Tlsf::check_context(target_size);
            let mut remaining_tries = SMALL_BATCH_SIZE;
            let mut allocatable = false;

            loop {
                if inner.queues[QUEUE_COLD as usize].tail == NOT_STORED {
                    inner.update_lru_hot_and_warm(SMALL_BATCH_SIZE);
                    if inner.queues[QUEUE_COLD as usize].tail == NOT_STORED {
                        break;
                    }
                }
                let victim = inner.queues[QUEUE_COLD as usize].tail;
                if inner.flags(victim) & FLAG_ACTIVE != 0 {
                    // A late hit rescues the entry to warm instead.
                    inner.lru_remove(victim);
                    inner.lru_insert_front(QUEUE_WARM, victim);
                } else {
                    inner.lru_remove(victim);
                    inner.set_owner(victim, 0);
                    inner.alloc.free(victim);
                    self.stats.evicted_qty.fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .current_in_cache_value_qty
                        .fetch_sub(1, Ordering::Relaxed);
                    allocatable = inner.alloc.is_allocatable(&cc);
                }
                if remaining_tries == 0 || allocatable {
                    break;
                }
                remaining_tries -= 1;
            }

            if allocatable {
                loc = inner.alloc.malloc(target_size);
            }
        }

        let Some(loc) = loc else {
            return NOT_STORED;
        };

        let chunk = inner.alloc.data_mut(loc, CHUNK_HEADER + data.len());
        LittleEndian::write_u64(&mut chunk[0..8], owner_id);
        LittleEndian::write_u32(&mut chunk[8..12], ttl_deadline_sec);
        LittleEndian::write_u32(&mut chunk[12..16], data.len() as u32);
        LittleEndian::write_u16(&mut chunk[16..18], QUEUE_NONE);
        LittleEndian::write_u16(&mut chunk[18..20], 0);
        LittleEndian::write_u32(&mut chunk[20..24], NOT_STORED);
        LittleEndian::write_u32(&mut chunk[24..28], NOT_STORED);
        chunk[CHUNK_HEADER..].copy_from_slice(data);

        self.stats
            .current_in_cache_value_qty
            .fetch_add(1, Ordering::Relaxed);
        inner.lru_insert_front(QUEUE_HOT, loc);
        loc
    }

    /// Fetches a value copy. The owner id and size double-check that the
    /// location was not recycled since the caller read it.
    pub fn get_value(&self, loc: u32, owner_id: u64, check_value_size: u32) -> Option<Vec<u8>> {
        self.stats.get_call_qty.fetch_add(1, Ordering::Relaxed);
        if loc == NOT_STORED || !self.is_enabled() {
            return None;
        }

        let mut inner = self.inner.lock().unwrap();
        let valid = inner
            .alloc
            .try_data(loc, CHUNK_HEADER)
            .map(|chunk| {
                LittleEndian::read_u64(&chunk[0..8]) == owner_id
                    && LittleEndian::read_u32(&chunk[12..16]) == check_value_size
            })
            .unwrap_or(false);
        if !valid {
            drop(inner);
            self.stats.miss_qty.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        // Deferred bump: mark the access, let the upkeep task requeue.
        let flags = inner.flags(loc);
        inner.set_flags(loc, flags | FLAG_ACTIVE);
        self.stats.hit_qty.fetch_add(1, Ordering::Relaxed);

        let data = inner
            .alloc
            .data(loc, CHUNK_HEADER + check_value_size as usize)[CHUNK_HEADER..]
            .to_vec();
        Some(data)
    }

    /// Drops the value at `loc` if it still belongs to `owner_id`.
    pub fn remove_value(&self, loc: u32, owner_id: u64) -> bool {
        self.stats.remove_call_qty.fetch_add(1, Ordering::Relaxed);
        if loc == NOT_STORED || !self.is_enabled() {
            return false;
        }

        let mut inner = self.inner.lock().unwrap();
        let valid = inner
            .alloc
            .try_data(loc, CHUNK_HEADER)
            .map(|chunk| {
                LittleEndian::read_u64(&chunk[0..8]) == owner_id
                    && LittleEndian::read_u16(&chunk[16..18]) & QUEUE_MASK != QUEUE_NONE
            })
            .unwrap_or(false);
        if !valid {
            return false;
        }

        inner.lru_remove(loc);
        inner.set_owner(loc, 0);
        inner.alloc.free(loc);
        self.stats
            .current_in_cache_value_qty
            .fetch_sub(1, Ordering::Relaxed);
        true
    }

    /// Upkeep: requeues accessed entries and demotes untouched ones.
    pub fn background_update_lru(&self, batch_size: u32) {
        let mut remaining = batch_size;
        while remaining > 0 {
            let consumed = self.inner.lock().unwrap().update_lru_hot_and_warm(remaining);
            if consumed == 0 || consumed > remaining {
                break;
            }
            remaining -= consumed;
        }
    }

    /// Upkeep: evicts cold entries until the allocator load drops to the
    /// configured target.
    pub fn background_preventive_eviction(&self, batch_size: u32) {
        if !self.is_enabled() {
            return;
        }
        let target = self.max_bytes * u64::from(self.target_load_percentage.load(Ordering::Acquire))
            / 100;

        let mut remaining = batch_size;
        while remaining > 0 {
            let mut inner = self.inner.lock().unwrap();
            if inner.alloc.allocated_bytes() <= target {
                break;
            }
            if inner.queues[QUEUE_COLD as usize].tail == NOT_STORED {
                inner.update_lru_hot_and_warm(SMALL_BATCH_SIZE);
                if inner.queues[QUEUE_COLD as usize].tail == NOT_STORED {
                    break;
                }
            }
            let victim = inner.queues[QUEUE_COLD as usize].tail;
            if inner.flags(victim) & FLAG_ACTIVE != 0 {
                inner.lru_remove(victim);
                inner.lru_insert_front(QUEUE_WARM, victim);
            } else {
                inner.lru_remove(victim);
                inner.set_owner(victim, 0);
                inner.alloc.free(victim);
                self.stats.evicted_qty.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .current_in_cache_value_qty
                    .fetch_sub(1, Ordering::Relaxed);
            }
            remaining -= 1;
        }
    }
}

impl CacheInner {
    fn flags(&self, loc: u32) -> u16 {
        LittleEndian::read_u16(&self.alloc.data(loc, CHUNK_HEADER)[16..18])
    }

    fn set_flags(&mut self, loc: u32, flags: u16) {
        LittleEndian::write_u16(&mut self.alloc.data_mut(loc, CHUNK_HEADER)[16..18], flags);
    }

    fn set_owner(&mut self, loc: u32, owner: u64) {
        LittleEndian::write_u64(&mut self.alloc.data_mut(loc, CHUNK_HEADER)[0..8], owner);
    }

    fn value_size(&self, loc: u32) -> u32 {
        LittleEndian::read_u32(&self.alloc.data(loc, CHUNK_HEADER)[12..16])
    }

    fn prev(&self, loc: u32) -> u32 {
        LittleEndian::read_u32(&self.alloc.data(loc, CHUNK_HEADER)[20..24])
    }

    fn next(&self, loc: u32) -> u32 {
        LittleEndian::read_u32(&self.alloc.data(loc, CHUNK_HEADER)[24..28])
    }

    fn set_prev(&mut self, loc: u32, v: u32) {
        LittleEndian::write_u32(&mut self.alloc.data_mut(loc, CHUNK_HEADER)[20..24], v);
    }

    fn set_next(&mut self, loc: u32, v: u32) {
        LittleEndian::write_u32(&mut self.alloc.data_mut(loc, CHUNK_HEADER)[24..28], v);
    }

    fn lru_remove(&mut self, loc: u32) {
        let queue_tag = self.flags(loc) & QUEUE_MASK;
        debug_assert_ne!(queue_tag, QUEUE_NONE);
        let prev = self.prev(loc);
        let next = self.next(loc);
        self.set_flags(loc, QUEUE_NONE); // clears the active bit too

        if prev != NOT_STORED {
            self.set_next(prev, next);
        } else {
            self.queues[queue_tag as usize].head = next;
        }
        if next != NOT_STORED {
            self.set_prev(next, prev);
        } else {
            self.queues[queue_tag as usize].tail = prev;
        }
        let size = u64::from(self.value_size(loc));
        debug_assert!(self.queues[queue_tag as usize].bytes >= size);
        self.queues[queue_tag as usize].bytes -= size;
    }

    fn lru_insert_front(&mut self, queue_tag: u16, loc: u32) {
        debug_assert_ne!(queue_tag, QUEUE_NONE);
        debug_assert_eq!(self.flags(loc) & QUEUE_MASK, QUEUE_NONE);

        self.set_flags(loc, queue_tag); // active bit cleared on requeue
        self.set_prev(loc, NOT_STORED);
        let head = self.queues[queue_tag as usize].head;
        if head != NOT_STORED {
            self.set_prev(head, loc);
            self.set_next(loc, head);
        } else {
            self.queues[queue_tag as usize].tail = loc;
            self.set_next(loc, NOT_STORED);
        }
        self.queues[queue_tag as usize].head = loc;
        self.queues[queue_tag as usize].bytes += u64::from(self.value_size(loc));
    }

    // Drains the hot and warm tails toward their byte budgets (20% and 40%
    // of the cached bytes). Accessed entries go to the warm head, giving
    // them a full queue traversal before the next demotion; untouched ones
    // fall through to cold.
    fn update_lru_hot_and_warm(&mut self, batch_size: u32) -> u32 {
        let all_bytes = self.queues[QUEUE_HOT as usize].bytes
            + self.queues[QUEUE_WARM as usize].bytes
            + self.queues[QUEUE_COLD as usize].bytes;
        let mut consumed = 0u32;

        let mut move_qty = batch_size;
        let mut move_bytes = self.queues[QUEUE_HOT as usize]
            .bytes
            .saturating_sub(all_bytes * 20 / 100) as i64;
        while move_qty > 0 && move_bytes > 0 {
            let loc = self.queues[QUEUE_HOT as usize].tail;
            if loc == NOT_STORED {
                break;
            }
            let active = self.flags(loc) & FLAG_ACTIVE != 0;
            self.lru_remove(loc);
            self.lru_insert_front(if active { QUEUE_WARM } else { QUEUE_COLD }, loc);
            move_bytes -= i64::from(self.value_size(loc));
            move_qty -= 1;
            consumed += 1;
        }

        let mut move_qty = batch_size;
        let mut move_bytes = self.queues[QUEUE_WARM as usize]
            .bytes
            .saturating_sub(all_bytes * 40 / 100) as i64;
        while move_qty > 0 && move_bytes > 0 {
            let loc = self.queues[QUEUE_WARM as usize].tail;
            if loc == NOT_STORED {
                break;
            }
            let active = self.flags(loc) & FLAG_ACTIVE != 0;
            self.lru_remove(loc);
            self.lru_insert_front(if active { QUEUE_WARM } else { QUEUE_COLD }, loc);
            move_bytes -= i64::from(self.value_size(loc));
            move_qty -= 1;
            consumed += 1;
        }

        consumed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get() {
        let cache = ValueCache::new(1 << 20);
        let loc = cache.insert_value(b"some value", 42, 0);
        assert_ne!(loc, NOT_STORED);

        let value = cache.get_value(loc, 42, 10).expect("cache hit");
        assert_eq!(value, b"some value");

        let counters = cache.counters();
        assert_eq!(counters.hit_qty, 1);
        assert_eq!(counters.current_in_cache_value_qty, 1);
    }

    #[test]
    fn test_owner_and_size_guard() {
        let cache = ValueCache::new(1 << 20);
        let loc = cache.insert_value(b"guarded", 1, 0);

        assert!(cache.get_value(loc, 2, 7).is_none()); // wrong owner
        assert!(cache.get_value(loc, 1, 8).is_none()); // wrong size
        assert!(cache.get_value(loc, 1, 7).is_some());
        assert_eq!(cache.counters().miss_qty, 2);
    }

    #[test]
    fn test_remove() {
        let cache = ValueCache::new(1 << 20);
        let loc = cache.insert_value(b"here today", 9, 0);
        assert!(cache.remove_value(loc, 9));
        assert!(!cache.remove_value(loc, 9)); // owner was cleared
        assert!(cache.get_value(loc, 9, 10).is_none());
        assert_eq!(cache.counters().current_in_cache_value_qty, 0);
    }

    #[test]
    fn test_disabled_cache() {
        let cache = ValueCache::new(0);
        assert!(!cache.is_enabled());
        assert_eq!(cache.insert_value(b"x", 1, 0), NOT_STORED);
        assert!(cache.get_value(0, 1, 1).is_none());
    }

    #[test]
    fn test_forced_eviction_makes_room() {
        let cache = ValueCache::new(64 * 1024);
        let value = vec![7u8; 1000];
        // Far more values than fit; insertions must keep succeeding by
        // evicting cold entries.
        let mut stored = 0;
        for i in 0..200u64 {
            if cache.insert_value(&value, i, 0) != NOT_STORED {
                stored += 1;
            }
        }
        assert!(stored > 150, "only {} inserts succeeded", stored);
        assert!(cache.counters().evicted_qty > 0);
        assert!(cache.allocated_bytes() <= 64 * 1024);
    }

    #[test]
    fn test_preventive_eviction_reaches_target() {
        let cache = ValueCache::new(64 * 1024);
        cache.set_target_memory_load_percentage(50);
        let value = vec![1u8; 2000];
        for i in 0..100u64 {
            cache.insert_value(&value, i, 0);
        }
        for _ in 0..100 {
            cache.background_update_lru(100);
            cache.background_preventive_eviction(100);
        }
        assert!(cache.allocated_bytes() <= 64 * 1024 / 2);
    }

    #[test]
    fn test_scan_resistance() {
        let cache = ValueCache::new(64 * 1024);
        let keeper_value = vec![5u8; 100];
        let keeper_loc = cache.insert_value(&keeper_value, u64::MAX, 0);
        assert_ne!(keeper_loc, NOT_STORED);

        // One access marks the keeper; upkeep will promote it to warm.
        assert!(cache.get_value(keeper_loc, u64::MAX, 100).is_some());

        // Two full scans of never-reaccessed values, with upkeep running as
        // it would in the background.
        let scan_value = vec![9u8; 100];
        for wave in 0..2 {
            for i in 0..1000u64 {
                cache.insert_value(&scan_value, wave * 10_000 + i, 0);
                if i % 50 == 0 {
                    cache.background_update_lru(100);
                    cache.background_preventive_eviction(100);
                }
            }
        }

        let value = cache
            .get_value(keeper_loc, u64::MAX, 100)
            .expect("scan flushed the once-accessed entry");
        assert_eq!(value, keeper_value);
    }
}
