use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::format::DATA_HEADER_SIZE;
use crate::keydir::NO_FILE;
use crate::tlsf::NOT_STORED;

use super::Shared;

/// Upkeep service loop: refreshes the clock, flushes aged buffered writes,
/// drives a pending key directory resize to completion in batches, runs
/// the cache LRU maintenance and preventive eviction, and sweeps one shard
/// of expired entries. Every batch size comes from the live configuration.
pub(crate) fn upkeep_thread_entry(shared: &Arc<Shared>) {
    tracing::debug!("upkeep thread started");

    let mut last_flush_time = Instant::now();
    let mut last_flushed_offset = u32::MAX;
    let mut last_file_id = NO_FILE;

    loop {
        let (period, flush_period, keydir_batch, cache_batch) = {
            let config = shared.config.lock().unwrap();
            (
                Duration::from_millis(u64::from(config.upkeep_cycle_period_ms)),
                Duration::from_millis(u64::from(config.write_buffer_flush_period_ms)),
                config.upkeep_key_dir_batch_size,
                config.upkeep_value_cache_batch_size,
            )
        };
        if !shared.upkeep_ctl.wait_cycle(period) {
            break;
        }
        shared.upkeep_ctl.set_done();

        shared.update_now();

        // Flush the write buffer once its content got old enough, but only
        // if no foreground flush happened since the last check.
        if last_flush_time.elapsed() >= flush_period {
            match shared.active.write() {
                Ok(mut active) => {
                    if active.flushed_offset == last_flushed_offset
                        && active.file_id == last_file_id
                        && active.offset > active.flushed_offset
                    {
                        if let Err(e) = shared.flush_write_buffer(&mut active) {
                            tracing::error!(error = %e, "periodic write buffer flush failed");
                        }
                    }
                    last_file_id = active.file_id;
                    last_flushed_offset = active.flushed_offset;
                }
                Err(_) => {
                    tracing::error!("active file state is poisoned, skipping the periodic flush");
                }
            }
            last_flush_time = Instant::now();
        }

        // First priority: finish a pending key directory resize, one batch
        // at a time so writers keep getting air in between.
        if shared.keydir.is_resizing() {
            tracing::debug!("driving key directory resize migration");
            while shared.keydir.background_resize_work(keydir_batch) {
                std::thread::yield_now();
            }
        }

        // Second priority: cache queue maintenance and the eviction margin.
        shared.cache.background_update_lru(cache_batch);
        shared.cache.background_preventive_eviction(cache_batch);

        // Third priority: reclaim entries whose TTL has passed.
        for expired in shared.keydir.sweep_expired(cache_batch) {
            if expired.cache_loc != NOT_STORED && shared.cache.is_enabled() {
                shared.cache.remove_value(expired.cache_loc, expired.key_hash64);
            }
            let record_bytes = (DATA_HEADER_SIZE
                + 2 * expired.index_count as usize
                + expired.key_size as usize) as u32
                + expired.value_size;
            if let Some(file) = shared.files.read().unwrap().get(expired.file_id) {
                file.add_dead(record_bytes);
            }
        }
    }

    tracing::debug!("upkeep thread stopped");
}
