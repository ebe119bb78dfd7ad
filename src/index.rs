use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};
use crate::hasher::{hash_bytes, hash_prefix};
use crate::tlsf::Tlsf;

const ASSOC: usize = 8;

// Index chunk layout in the arena:
//   [0..4]  key part length
//   [4..8]  used entry count
//   [8..]   key part bytes, padded to 4 bytes, then the u32 hash array
fn hash_array_offset(part_len: usize) -> usize {
    8 + ((part_len + 3) & !3)
}

/// Mapping from a key part (a tagged key substring) to the 32-bit hashes of
/// the entries declaring it.
///
/// The table is open-addressed with the same 8-slot group probing as the
/// key directory, but all mutation is synchronous: the store wraps it in a
/// reader-writer lock, queries take the read side and inserts/cleaning the
/// write side. Stale hashes are pruned lazily at query time.
pub struct IndexMap {
    slots: Vec<(u32, u32)>, // (hash prefix, chunk handle); prefix 0 = empty
    size: u32,
    max_load_factor_128: u64,
    alloc: Tlsf,
}

impl IndexMap {
    pub fn new(index_max_alloc_bytes: u64, initial_capacity: u32) -> Self {
        assert!(initial_capacity.is_power_of_two() && initial_capacity >= ASSOC as u32);
        Self {
            slots: vec![(0, 0); initial_capacity as usize],
            size: 0,
            max_load_factor_128: (0.90 * 128.0) as u64,
            alloc: Tlsf::new(index_max_alloc_bytes),
        }
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = (0, 0));
        self.size = 0;
        self.alloc.reset();
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn estimated_used_memory_bytes(&self) -> u64 {
        self.slots.len() as u64 * 8 + self.alloc.allocated_bytes()
    }

    /// Registers `entry_hash` under the key part. Appending is idempotent:
    /// a hash already present in the array is not duplicated.
    pub fn insert_index(&mut self, key_part: &[u8], entry_hash: u32) -> Result<()> {
        let h32 = hash_prefix(hash_bytes(key_part));

        if let Some(slot_idx) = self.find_slot(key_part, h32) {
            let loc = self.slots[slot_idx].1;
            let array_off = hash_array_offset(key_part.len());
            let entries = self.chunk_entries(loc);

            // De-duplication against the existing array.
            {
                let data = self
                    .alloc
                    .data(loc, array_off + 4 * entries as usize);
                for i in 0..entries as usize {
                    if LittleEndian::read_u32(&data[array_off + 4 * i..]) == entry_hash {
                        return Ok(());
                    }
                }
            }

            let capacity = (self.alloc.real_allocated_size(loc) as usize - array_off) / 4;
            let mut loc = loc;
            if entries as usize + 1 > capacity {
                // Grow the chunk by doubling the array.
                let new_len = array_off + 4 * 2 * entries.max(1) as usize;
                let new_loc = self.alloc.malloc(new_len as u64).ok_or(Error::OutOfMemory)?;
                let old_len = array_off + 4 * entries as usize;
                let old = self.alloc.data(loc, old_len).to_vec();
                self.alloc.data_mut(new_loc, old_len).copy_from_slice(&old);
                self.alloc.free(loc);
                self.slots[slot_idx].1 = new_loc;
                loc = new_loc;
            }

            let data = self.alloc.data_mut(loc, array_off + 4 * (entries as usize + 1));
            LittleEndian::write_u32(&mut data[array_off + 4 * entries as usize..], entry_hash);
            LittleEndian::write_u32(&mut data[4..8], entries + 1);
            return Ok(());
        }

        // Fresh key part: start with room for two entries.
        let array_off = hash_array_offset(key_part.len());
        let loc = self
            .alloc
            .malloc((array_off + 4 * 2) as u64)
            .ok_or(Error::OutOfMemory)?;
        let data = self.alloc.data_mut(loc, array_off + 4);
        LittleEndian::write_u32(&mut data[0..4], key_part.len() as u32);
        LittleEndian::write_u32(&mut data[4..8], 1);
        data[8..8 + key_part.len()].copy_from_slice(key_part);
        LittleEndian::write_u32(&mut data[array_off..], entry_hash);

        let slot_idx = self.find_free_slot(h32);
        self.slots[slot_idx] = (h32, loc);
        self.size += 1;

        if 128 * u64::from(self.size) > self.max_load_factor_128 * self.slots.len() as u64 {
            self.resize(2 * self.slots.len() as u32);
        }
        Ok(())
    }

    /// Number of entry hashes registered under the key part.
    pub fn entry_count(&self, key_part: &[u8]) -> u32 {
        let h32 = hash_prefix(hash_bytes(key_part));
        match self.find_slot(key_part, h32) {
            Some(slot_idx) => self.chunk_entries(self.slots[slot_idx].1),
            None => 0,
        }
    }

    /// Snapshot of the entry hashes registered under the key part.
    pub fn entry_hashes(&self, key_part: &[u8]) -> Vec<u32> {
        let h32 = hash_prefix(hash_bytes(key_part));
        let Some(slot_idx) = self.find_slot(key_part, h32) else {
            return Vec::new();
        };
        let loc = self.slots[slot_idx].1;
        let array_off = hash_array_offset(key_part.len());
        let entries = self.chunk_entries(loc) as usize;
        let data = self.alloc.data(loc, array_off + 4 * entries);
        (0..entries)
            .map(|i| LittleEndian::read_u32(&data[array_off + 4 * i..]))
            .collect()
    }

    /// Lazy cleaning: walks the stored array against the (traversal-ordered)
    /// list of hashes that failed validation, dropping each one the caller
    /// confirms. Returns how many entries were removed.
    ///
    /// The in-order walk assumes no other cleaning ran in between; if one
    /// did, the array is already clean and this pass is harmless.
    pub fn clean_entries(
        &mut self,
        key_part: &[u8],
        invalid_hashes: &[u32],
        mut confirm_drop: impl FnMut(u32) -> bool,
    ) -> u64 {
        let h32 = hash_prefix(hash_bytes(key_part));
        let Some(slot_idx) = self.find_slot(key_part, h32) else {
            tracing::warn!("key part to clean disappeared from the index map");
            return 0;
        };
        let loc = self.slots[slot_idx].1;
        let array_off = hash_array_offset(key_part.len());
        let mut entries = self.chunk_entries(loc);
        let mut cleaned = 0u64;

        let mut stored_idx = 0u32;
        let mut invalid_idx = 0usize;
        while stored_idx < entries && invalid_idx < invalid_hashes.len() {
            let target = invalid_hashes[invalid_idx];
            invalid_idx += 1;

            while stored_idx < entries && self.array_at(loc, array_off, stored_idx) != target {
                stored_idx += 1;
            }
            if stored_idx >= entries {
                break;
            }
            if confirm_drop(target) {
                // Swap-remove; the swapped-in hash is checked against the
                // next invalid candidate.
                let last = self.array_at(loc, array_off, entries - 1);
                self.set_array_at(loc, array_off, stored_idx, last);
                entries -= 1;
                cleaned += 1;
            }
        }

        if cleaned > 0 {
            let data = self.alloc.data_mut(loc, 8);
            LittleEndian::write_u32(&mut data[4..8], entries);
        }
        cleaned
    }

    fn array_at(&self, loc: u32, array_off: usize, idx: u32) -> u32 {
        let data = self.alloc.data(loc, array_off + 4 * (idx as usize + 1));
        LittleEndian::read_u32(&data[array_off + 4 * idx as usize..])
    }

    fn set_array_at(&mut self, loc: u32, array_off: usize, idx: u32, v: u32) {
        let data = self.alloc.data_mut(loc, array_off + 4 * (idx as usize + 1));
        LittleEndian::write_u32(&mut data[array_off + 4 * idx as usize..], v);
    }

    fn chunk_entries(&self, loc: u32) -> u32 {
        LittleEndian::read_u32(&self.alloc.data(loc, 8)[4..8])
    }

    fn chunk_part_matches(&self, loc: u32, key_part: &[u8]) -> bool {
        let header = self.alloc.data(loc, 8);
        if LittleEndian::read_u32(&header[0..4]) as usize != key_part.len() {
            return false;
        }
        self.alloc.data(loc, 8 + key_part.len())[8..] == *key_part
    }

    fn find_slot(&self, key_part: &[u8], h32: u32) -> Option<usize> {
        let mask = self.slots.len() / ASSOC - 1;
        let mut g = h32 as usize & mask;
        let mut probe = 1usize;
        loop {
            for lane in 0..ASSOC {
                let (hash, loc) = self.slots[g * ASSOC + lane];
                if hash == 0 {
                    return None;
                }
                if hash == h32 && self.chunk_part_matches(loc, key_part) {
                    return Some(g * ASSOC + lane);
                }
            }
            g = (g + probe) & mask;
            probe += 1;
        }
    }

    fn find_free_slot(&self, h32: u32) -> usize {
        let mask = self.slots.len() / ASSOC - 1;
        let mut g = h32 as usize & mask;
        let mut probe = 1usize;
        loop {
            for lane in 0..ASSOC {
                if self.slots[g * ASSOC + lane].0 == 0 {
                    return g * ASSOC + lane;
                }
            }
            g = (g + probe) & mask;
            probe += 1;
        }
    }

    fn resize(&mut self, new_capacity: u32) {
        let old = std::mem::replace(&mut self.slots, vec![(0, 0); new_capacity as usize]);
        let mask = new_capacity as usize / ASSOC - 1;
        for (hash, loc) in old {
            if hash == 0 {
                continue;
            }
            let mut g = hash as usize & mask;
            let mut probe = 1usize;
            'placed: loop {
                for lane in 0..ASSOC {
                    if self.slots[g * ASSOC + lane].0 == 0 {
                        self.slots[g * ASSOC + lane] = (hash, loc);
                        break 'placed;
                    }
                }
                g = (g + probe) & mask;
                probe += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_lookup() {
        let mut map = IndexMap::new(1 << 24, 64);
        map.insert_index(b"CUS", 101).unwrap();
        map.insert_index(b"CUS", 102).unwrap();
        map.insert_index(b"CFR", 201).unwrap();

        assert_eq!(map.entry_count(b"CUS"), 2);
        assert_eq!(map.entry_hashes(b"CUS"), vec![101, 102]);
        assert_eq!(map.entry_hashes(b"CFR"), vec![201]);
        assert!(map.entry_hashes(b"CDE").is_empty());
    }

    #[test]
    fn test_insert_deduplicates() {
        let mut map = IndexMap::new(1 << 24, 64);
        map.insert_index(b"tag", 7).unwrap();
        map.insert_index(b"tag", 7).unwrap();
        assert_eq!(map.entry_hashes(b"tag"), vec![7]);
    }

    #[test]
    fn test_array_growth() {
        let mut map = IndexMap::new(1 << 24, 64);
        for i in 1..=100 {
            map.insert_index(b"crowded", i).unwrap();
        }
        let hashes = map.entry_hashes(b"crowded");
        assert_eq!(hashes.len(), 100);
        assert_eq!(hashes[0], 1);
        assert_eq!(hashes[99], 100);
    }

    #[test]
    fn test_clean_entries() {
        let mut map = IndexMap::new(1 << 24, 64);
        for i in 1..=10 {
            map.insert_index(b"part", i).unwrap();
        }

        // Hashes 2, 5, 9 failed validation; the callback confirms all.
        let cleaned = map.clean_entries(b"part", &[2, 5, 9], |_| true);
        assert_eq!(cleaned, 3);
        let hashes = map.entry_hashes(b"part");
        assert_eq!(hashes.len(), 7);
        assert!(!hashes.contains(&2));
        assert!(!hashes.contains(&5));
        assert!(!hashes.contains(&9));
        for keep in [1u32, 3, 4, 6, 7, 8, 10] {
            assert!(hashes.contains(&keep));
        }
    }

    #[test]
    fn test_table_resize_keeps_entries() {
        let mut map = IndexMap::new(1 << 24, 64);
        for i in 0..500u32 {
            let part = format!("part-{:04}", i);
            map.insert_index(part.as_bytes(), i + 1).unwrap();
        }
        assert_eq!(map.size(), 500);
        for i in 0..500u32 {
            let part = format!("part-{:04}", i);
            assert_eq!(map.entry_hashes(part.as_bytes()), vec![i + 1]);
        }
    }
}
