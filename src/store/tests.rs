use super::*;
use crate::config::Config;
use crate::format::{HINT_FILE_SUFFIX, KeyIndex};
use std::sync::atomic::AtomicUsize;
use tempfile::TempDir;

fn open_store(dir: &TempDir) -> Datastore {
    let store = Datastore::new();
    store.open(dir.path()).expect("open");
    store
}

// A tiny deterministic generator, enough to vary key and value sizes.
struct Xorshift(u64);

impl Xorshift {
    fn next(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }
}

#[test]
fn test_open_put_get_close() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let value: Vec<u8> = (1..=8).collect();
    store.put(b"k", &value).unwrap();
    assert_eq!(store.get(b"k").unwrap(), value);

    store.close().unwrap();
    assert_eq!(store.get(b"k"), Err(Error::StoreNotOpen));
}

#[test]
fn test_double_open_and_closed_ops() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    assert_eq!(store.open(dir.path()), Err(Error::StoreAlreadyOpen));
    store.close().unwrap();
    assert_eq!(store.close(), Err(Error::StoreNotOpen));
    assert_eq!(store.put(b"k", b"v"), Err(Error::StoreNotOpen));
    assert_eq!(store.remove(b"k", false), Err(Error::StoreNotOpen));
    assert_eq!(store.query(b"k"), Err(Error::StoreNotOpen));
}

#[test]
fn test_second_process_is_locked_out() {
    let dir = TempDir::new().unwrap();
    let store1 = open_store(&dir);

    let store2 = Datastore::new();
    assert_eq!(store2.open(dir.path()), Err(Error::StoreAlreadyInUse));

    store1.close().unwrap();
    store2.open(dir.path()).expect("lock released after close");
}

#[test]
fn test_active_file_rotation_counts() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let mut config = Config::default().data_file_max_bytes(2048);
    config.merge_trigger_data_file_dead_byte_threshold = 2000;
    config.merge_select_data_file_dead_byte_threshold = 1000;
    store.set_config(config).unwrap();

    // Each record is header (16) + key (4) + value (128) = 148 bytes; the
    // switch counter includes the file created at open.
    let value = [7u8; 128];
    let fitting_puts = 2048 / (16 + 4 + 128);
    for i in 0..fitting_puts as u32 {
        store.put(&i.to_be_bytes(), &value).unwrap();
    }
    assert_eq!(store.counters().active_data_file_switch_qty, 1);

    store.put(&u32::MAX.to_be_bytes(), &value).unwrap();
    assert_eq!(store.counters().active_data_file_switch_qty, 2);
}

#[test]
fn test_config_cross_check_rejected() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let mut config = Config::default().data_file_max_bytes(11_000);
    config.merge_trigger_data_file_dead_byte_threshold = 11_001;
    config.merge_select_data_file_dead_byte_threshold = 1_000;
    assert_eq!(
        store.set_config(config),
        Err(Error::InconsistentParameterValues)
    );
}

#[test]
fn test_big_entries() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let big_key = vec![0x42u8; 65_000];
    let big_value = vec![0x17u8; 2_000_000];
    store.put(&big_key, &big_value).unwrap();
    assert_eq!(store.get(&big_key).unwrap(), big_value);

    let too_big_key = vec![0u8; 65_535];
    assert_eq!(store.put(&too_big_key, b"v"), Err(Error::BadKeySize));
    assert_eq!(store.get(&too_big_key), Err(Error::BadKeySize));
}

#[test]
fn test_value_size_bound() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    // Do not materialize a 4 GiB value; the empty value is the other bound.
    store.put(b"empty", b"").unwrap();
    assert_eq!(store.get(b"empty").unwrap(), Vec::<u8>::new());
}

#[test]
fn test_remove_semantics() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    store.put(b"gone", b"value").unwrap();
    store.remove(b"gone", false).unwrap();
    assert_eq!(store.get(b"gone"), Err(Error::EntryNotFound));
    assert_eq!(store.remove(b"gone", false), Err(Error::EntryNotFound));
    assert_eq!(store.remove(b"never-was", false), Err(Error::EntryNotFound));

    // A removed key can come back.
    store.put(b"gone", b"back").unwrap();
    assert_eq!(store.get(b"gone").unwrap(), b"back");
}

#[test]
fn test_write_buffer_and_cache_hits() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    store.put(b"hot", b"value").unwrap();
    // Not flushed yet: served straight from the write buffer.
    assert_eq!(store.get(b"hot").unwrap(), b"value");
    assert_eq!(store.counters().get_write_buffer_hit_qty, 1);

    store.sync().unwrap();
    // Flushed: now served by the value cache populated at put time.
    assert_eq!(store.get(b"hot").unwrap(), b"value");
    assert_eq!(store.counters().get_cache_hit_qty, 1);
}

#[test]
fn test_sync_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    store.put(b"key", b"value").unwrap();
    store.sync().unwrap();

    let path = {
        let active = store.shared.active.read().unwrap();
        let files = store.shared.files.read().unwrap();
        files.get(active.file_id).unwrap().path.clone()
    };
    let len_after_first = std::fs::metadata(&path).unwrap().len();
    for _ in 0..5 {
        store.sync().unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), len_after_first);
    }
}

#[test]
fn test_reopen_round_trip_mixed_sizes() {
    let dir = TempDir::new().unwrap();
    let mut rng = Xorshift(0x9E3779B97F4A7C15);
    let mut pairs = Vec::new();
    for i in 0u32..300 {
        let key_len = 4 + (rng.next() % 60) as usize;
        let value_len = (rng.next() % 4096) as usize;
        let mut key = vec![0u8; key_len];
        key[..4].copy_from_slice(&i.to_be_bytes());
        for b in key.iter_mut().skip(4) {
            *b = rng.next() as u8;
        }
        let value: Vec<u8> = (0..value_len).map(|_| rng.next() as u8).collect();
        pairs.push((key, value));
    }

    {
        let store = open_store(&dir);
        for (key, value) in &pairs {
            store.put(key, value).unwrap();
        }
        // Overwrite a slice of them so dead records exist on disk too.
        for (key, _) in pairs.iter().take(50) {
            store.put(key, b"overwritten").unwrap();
        }
        store.close().unwrap();
    }

    let store = open_store(&dir);
    for (i, (key, value)) in pairs.iter().enumerate() {
        let expected: &[u8] = if i < 50 { b"overwritten" } else { value };
        assert_eq!(store.get(key).unwrap(), expected, "key {} mismatch", i);
    }
    assert_eq!(store.counters().get_call_corrupted_qty, 0);
}

#[test]
fn test_index_queries_literal_example() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let key = b"UJohn Doe/CUS/TTax document/0001";
    let indexes = [
        KeyIndex {
            start_idx: 0,
            size: 9,
        },
        KeyIndex {
            start_idx: 10,
            size: 3,
        },
        KeyIndex {
            start_idx: 14,
            size: 13,
        },
    ];
    store.put_with(key, b"document", &indexes, 0, false).unwrap();

    for part in [&b"UJohn Doe"[..], b"CUS", b"TTax document"] {
        let matches = store.query(part).unwrap();
        assert_eq!(matches.len(), 1, "part {:?}", part);
        assert_eq!(matches[0], key);
    }
    let matches = store.query_all(&[b"UJohn Doe", b"CUS"]).unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0], key);

    // Unknown part and empty inputs return empty result sets.
    assert!(store.query(b"UNobody").unwrap().is_empty());
    assert!(store.query(b"").unwrap().is_empty());
    assert!(store.query_all(&[]).unwrap().is_empty());
}

#[test]
fn test_index_update_on_overwrite() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let key: Vec<u8> = (0..=8).collect();
    store
        .put_with(
            &key,
            b"v1",
            &[
                KeyIndex {
                    start_idx: 1,
                    size: 2,
                },
                KeyIndex {
                    start_idx: 5,
                    size: 3,
                },
            ],
            0,
            false,
        )
        .unwrap();
    store
        .put_with(
            &key,
            b"v2",
            &[KeyIndex {
                start_idx: 0,
                size: 2,
            }],
            0,
            false,
        )
        .unwrap();

    // The dropped tag no longer matches, the new one does.
    assert!(store.query(&[5u8, 6, 7][..]).unwrap().is_empty());
    let matches = store.query(&[0u8, 1][..]).unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0], key);
}

#[test]
fn test_index_validation_errors() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    // Out of key bounds.
    let bad = [KeyIndex {
        start_idx: 4,
        size: 2,
    }];
    assert_eq!(
        store.put_with(b"tiny", b"v", &bad, 0, false),
        Err(Error::InconsistentKeyIndex)
    );
    // Empty part.
    let empty = [KeyIndex {
        start_idx: 0,
        size: 0,
    }];
    assert_eq!(
        store.put_with(b"tiny", b"v", &empty, 0, false),
        Err(Error::InconsistentKeyIndex)
    );
    // Not strictly ordered.
    let unordered = [
        KeyIndex {
            start_idx: 2,
            size: 1,
        },
        KeyIndex {
            start_idx: 1,
            size: 1,
        },
    ];
    assert_eq!(
        store.put_with(b"tiny", b"v", &unordered, 0, false),
        Err(Error::UnorderedKeyIndex)
    );
    // Too many indexes.
    let too_many: Vec<KeyIndex> = (0..65)
        .map(|i| KeyIndex {
            start_idx: i,
            size: 1,
        })
        .collect();
    let long_key = vec![1u8; 100];
    assert_eq!(
        store.put_with(&long_key, b"v", &too_many, 0, false),
        Err(Error::InconsistentKeyIndex)
    );
}

#[test]
fn test_queries_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let key = b"UAda Lovelace/CGB/TNote/0001";
    let indexes = [
        KeyIndex {
            start_idx: 0,
            size: 13,
        },
        KeyIndex {
            start_idx: 14,
            size: 3,
        },
    ];
    {
        let store = open_store(&dir);
        store.put_with(key, b"v", &indexes, 0, false).unwrap();
        store.close().unwrap();
    }

    let store = open_store(&dir);
    let matches = store.query(b"UAda Lovelace").unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0], key);
}

#[test]
fn test_ttl_expiry_with_injected_time() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    store.set_test_time_fn(|| 0);
    store.put_with(b"lease", b"v", &[], 10, false).unwrap();

    store.set_test_time_fn(|| 5);
    assert_eq!(store.get(b"lease").unwrap(), b"v");

    store.set_test_time_fn(|| 10);
    assert_eq!(store.get(b"lease"), Err(Error::EntryNotFound));
}

#[test]
fn test_ttl_zero_never_expires() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    store.set_test_time_fn(|| 0);
    store.put_with(b"forever", b"v", &[], 0, false).unwrap();
    store.set_test_time_fn(|| u32::MAX);
    assert_eq!(store.get(b"forever").unwrap(), b"v");
}

#[test]
fn test_expired_entries_skipped_at_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let store = open_store(&dir);
        store.set_test_time_fn(|| 100);
        store.put_with(b"short", b"v", &[], 10, false).unwrap();
        store.put(b"keeper", b"v2").unwrap();
        store.close().unwrap();
    }

    let store = open_store(&dir);
    store.set_test_time_fn(|| 1000);
    assert_eq!(store.get(b"short"), Err(Error::EntryNotFound));
    assert_eq!(store.get(b"keeper").unwrap(), b"v2");
}

#[test]
fn test_corrupted_record_is_reported() {
    let dir = TempDir::new().unwrap();
    let store = Datastore::with_cache_bytes(0); // force the disk path
    store.open(dir.path()).unwrap();

    store.put(b"fragile", b"precious value bytes").unwrap();
    store.sync().unwrap();

    let path = {
        let active = store.shared.active.read().unwrap();
        let files = store.shared.files.read().unwrap();
        files.get(active.file_id).unwrap().path.clone()
    };
    // Flip a byte inside the stored value, past the 16-byte header.
    {
        use std::io::{Seek, SeekFrom, Write};
        let mut file = std::fs::File::options().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(30)).unwrap();
        file.write_all(&[0xFF]).unwrap();
    }

    assert_eq!(store.get(b"fragile"), Err(Error::EntryCorrupted));
    assert_eq!(store.counters().get_call_corrupted_qty, 1);
}

#[test]
fn test_corrupted_tail_truncated_at_reopen() {
    let dir = TempDir::new().unwrap();
    let (path, valid_len) = {
        let store = open_store(&dir);
        store.put(b"survivor", b"intact").unwrap();
        store.sync().unwrap();
        let active = store.shared.active.read().unwrap();
        let files = store.shared.files.read().unwrap();
        let path = files.get(active.file_id).unwrap().path.clone();
        let len = u64::from(active.offset);
        drop(files);
        drop(active);
        store.close().unwrap();
        (path, len)
    };

    // Simulate a torn append: garbage that parses as an invalid header.
    {
        use std::io::Write;
        let mut file = std::fs::File::options().append(true).open(&path).unwrap();
        file.write_all(&[0xFF; 40]).unwrap();
    }

    let store = open_store(&dir);
    assert_eq!(store.get(b"survivor").unwrap(), b"intact");
    assert_eq!(std::fs::metadata(&path).unwrap().len(), valid_len);
}

#[test]
fn test_hint_files_backfilled_and_used() {
    let dir = TempDir::new().unwrap();
    {
        let store = open_store(&dir);
        for i in 0u32..50 {
            store.put(&i.to_be_bytes(), format!("value-{}", i).as_bytes()).unwrap();
        }
        store.close().unwrap();
    }

    // Second open scans the data file and flags the missing hint; the
    // merge thread backfills it.
    let first_data_file = {
        let store = open_store(&dir);
        let path = {
            let files = store.shared.files.read().unwrap();
            files.iter_live().map(|f| f.path.clone()).min().unwrap()
        };
        assert!(store.request_merge());
        let hint = path.with_extension(HINT_FILE_SUFFIX);
        for _ in 0..200 {
            if hint.exists() && !store.is_merge_ongoing() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert!(hint.exists(), "hint file was not backfilled");
        assert!(store.counters().hint_file_created_qty >= 1);
        store.close().unwrap();
        path
    };
    assert!(first_data_file.exists());

    // Third open loads through the hint file; everything must still read.
    let store = open_store(&dir);
    for i in 0u32..50 {
        assert_eq!(
            store.get(&i.to_be_bytes()).unwrap(),
            format!("value-{}", i).as_bytes()
        );
    }
}

#[test]
fn test_merge_reclaims_dead_space() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let mut config = Config::default().data_file_max_bytes(4096);
    config.merge_trigger_data_file_fragmentation_percentage = 10;
    config.merge_trigger_data_file_dead_byte_threshold = 4000;
    config.merge_select_data_file_fragmentation_percentage = 5;
    config.merge_select_data_file_dead_byte_threshold = 2000;
    config.merge_select_data_file_small_size_threshold = 1024;
    store.set_config(config).unwrap();

    let value = [9u8; 200];
    for _round in 0..6 {
        for i in 0u32..40 {
            store.put(&i.to_be_bytes(), &value).unwrap();
        }
    }
    let before = store.file_stats();
    assert!(before.dead_bytes > 0);

    assert!(store.request_merge());
    for _ in 0..300 {
        if !store.is_merge_ongoing() {
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(10));
    }

    let counters = store.counters();
    assert!(counters.merge_cycle_with_merge_qty >= 1, "no merge ran");
    assert!(counters.merge_gained_bytes > 0);

    // Every key still resolves to its latest value after compaction.
    for i in 0u32..40 {
        assert_eq!(store.get(&i.to_be_bytes()).unwrap(), value);
    }

    // And after a reopen, the compacted files alone rebuild the store.
    store.close().unwrap();
    let store = open_store(&dir);
    for i in 0u32..40 {
        assert_eq!(store.get(&i.to_be_bytes()).unwrap(), value);
    }
}

#[test]
fn test_merge_delete_retention() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    // file 0: A = 1, sealed.
    store.put(b"A", &[1]).unwrap();
    rotate(&store);
    // file 1: A = 2, sealed. This file stays out of the merge.
    store.put(b"A", &[2]).unwrap();
    rotate(&store);
    // file 2: tombstone for A, sealed.
    store.remove(b"A", false).unwrap();
    rotate(&store);

    // Merge files {0, 2}: file 1 (older than the tombstone's file) remains
    // outside, so the tombstone must survive into the merged output.
    merge::merge_exact_files(&store.shared, &[0, 2]).unwrap();
    assert!(
        store.file_stats().tomb_entries >= 1,
        "tombstone dropped although file 1 could resurrect A"
    );

    assert_eq!(store.get(b"A"), Err(Error::EntryNotFound));
    store.close().unwrap();

    // The surviving tombstone keeps A dead across recovery even though
    // file 1 still carries A = 2.
    let store = open_store(&dir);
    assert_eq!(store.get(b"A"), Err(Error::EntryNotFound));
}

#[test]
fn test_merge_drops_tombstone_without_older_files() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    store.put(b"B", &[1]).unwrap();
    rotate(&store);
    store.put(b"B", &[2]).unwrap();
    rotate(&store);
    store.remove(b"B", false).unwrap();
    rotate(&store);

    // All files holding B history are merged: no older sealed file remains
    // outside, so the tombstone is dropped entirely.
    merge::merge_exact_files(&store.shared, &[0, 1, 2]).unwrap();
    assert_eq!(store.file_stats().tomb_entries, 0);

    assert_eq!(store.get(b"B"), Err(Error::EntryNotFound));
    store.close().unwrap();

    let store = open_store(&dir);
    assert_eq!(store.get(b"B"), Err(Error::EntryNotFound));
}

#[test]
fn test_single_writer_single_reader() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let n: usize = 500;
    let watermark = AtomicUsize::new(0);

    std::thread::scope(|scope| {
        let store_ref = &store;
        let watermark_ref = &watermark;
        scope.spawn(move || {
            for i in 0..n {
                let key = format!("concurrent-{:05}", i);
                store_ref.put(key.as_bytes(), key.as_bytes()).unwrap();
                watermark_ref.store(i + 1, Ordering::Release);
            }
        });
        scope.spawn(move || {
            let mut rng = Xorshift(42);
            loop {
                let published = watermark_ref.load(Ordering::Acquire);
                if published == 0 {
                    std::hint::spin_loop();
                    continue;
                }
                let i = (rng.next() % published as u64) as usize;
                let key = format!("concurrent-{:05}", i);
                let value = store_ref.get(key.as_bytes()).expect("published key must read");
                assert_eq!(value, key.as_bytes());
                if published == n {
                    break;
                }
            }
        });
    });

    let counters = store.counters();
    assert_eq!(counters.put_call_qty, n as u64);
    assert_eq!(counters.get_call_corrupted_qty, 0);
    assert_eq!(counters.get_call_failed_qty, 0);
    for i in 0..n {
        let key = format!("concurrent-{:05}", i);
        assert_eq!(store.get(key.as_bytes()).unwrap(), key.as_bytes());
    }
}

#[test]
fn test_counters_track_calls() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    store.put(b"a", b"1").unwrap();
    store.put(b"a", b"2").unwrap();
    store.get(b"a").unwrap();
    let _ = store.get(b"missing");
    store.remove(b"a", false).unwrap();
    let _ = store.query(b"part");

    let counters = store.counters();
    assert_eq!(counters.open_call_qty, 1);
    assert_eq!(counters.put_call_qty, 2);
    assert_eq!(counters.get_call_qty, 1);
    assert_eq!(counters.get_call_not_found_qty, 1);
    assert_eq!(counters.remove_call_qty, 1);
    assert_eq!(counters.query_call_qty, 1);

    let cache = store.value_cache_counters();
    assert!(cache.insert_call_qty >= 2);
}

fn rotate(store: &Datastore) {
    let mut active = store.shared.active.write().unwrap();
    store.shared.rotate_active_file(&mut active).unwrap();
}
