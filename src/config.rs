use crate::error::{Error, Result};

/// Smallest accepted `data_file_max_bytes` and small-file merge threshold.
pub const MIN_DATA_FILE_MAX_BYTES: u32 = 1024;

/// Configuration for the datastore.
///
/// A `Config` is a plain value object: it is fully validated by
/// [`Config::validate`] before the datastore applies any field, so a store
/// never runs with a partially-applied configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Maximum byte size of a data file before switching to a new one.
    /// Implicitly bounds the database size as there are at most 65535 files.
    /// Bigger files raise the total capacity, smaller files shorten merges.
    pub data_file_max_bytes: u32,

    /// Period of the merge cycle, in milliseconds. Each cycle checks the
    /// merge triggers and, when they fire, compacts the selected data files.
    pub merge_cycle_period_ms: u32,

    /// Period of the upkeep cycle, in milliseconds. Covers cache eviction,
    /// key directory resizing and the expired-TTL sweep. A pending resize
    /// does not wait for the end of the cycle.
    pub upkeep_cycle_period_ms: u32,

    /// Maximum age of buffered writes before they are flushed to the OS.
    /// Bounds the data lost on a sudden interruption without paying a disk
    /// access on every write. The effective period is the maximum of this
    /// and `upkeep_cycle_period_ms`.
    pub write_buffer_flush_period_ms: u32,

    /// Key directory entries migrated per upkeep tick during a resize.
    /// Higher values finish the migration earlier at the price of latency
    /// spikes on writes; too low a value risks a forced inline migration if
    /// the next resize arrives before the previous one finished.
    pub upkeep_key_dir_batch_size: u32,

    /// Cached value entries processed per upkeep tick (LRU maintenance,
    /// eviction, expired-key sweep).
    pub upkeep_value_cache_batch_size: u32,

    /// Target load of the value cache, in percent. The headroom below 100%
    /// keeps insertions cheap; eviction toward the target runs in the
    /// background.
    pub value_cache_target_memory_load_percentage: u32,

    /// Percentage of dead bytes to total bytes in a file that triggers a
    /// merge. Increasing it makes merging rarer.
    pub merge_trigger_data_file_fragmentation_percentage: u32,

    /// Absolute dead-byte count in a single file that triggers a merge.
    pub merge_trigger_data_file_dead_byte_threshold: u32,

    /// Fragmentation percentage above which a file is included in a merge.
    /// Must not exceed the corresponding trigger threshold.
    pub merge_select_data_file_fragmentation_percentage: u32,

    /// Dead-byte count above which a file is included in a merge.
    /// Must not exceed the corresponding trigger threshold.
    pub merge_select_data_file_dead_byte_threshold: u32,

    /// Size below which a file is included in a merge, to keep the quantity
    /// of small data files (and open handles) low.
    pub merge_select_data_file_small_size_threshold: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_file_max_bytes: 100_000_000,
            merge_cycle_period_ms: 60_000,
            upkeep_cycle_period_ms: 1000,
            write_buffer_flush_period_ms: 5000,
            upkeep_key_dir_batch_size: 100_000,
            upkeep_value_cache_batch_size: 10_000,
            value_cache_target_memory_load_percentage: 90,
            merge_trigger_data_file_fragmentation_percentage: 50,
            merge_trigger_data_file_dead_byte_threshold: 50_000_000,
            merge_select_data_file_fragmentation_percentage: 30,
            merge_select_data_file_dead_byte_threshold: 10_000_000,
            merge_select_data_file_small_size_threshold: 10_000_000,
        }
    }
}

impl Config {
    /// Checks all field ranges and the cross-field constraints.
    ///
    /// Range violations yield `BadParameterValue`; contradictions between
    /// fields (selection thresholds above trigger thresholds, trigger
    /// threshold above the file size bound) yield
    /// `InconsistentParameterValues`.
    pub fn validate(&self) -> Result<()> {
        if self.data_file_max_bytes < MIN_DATA_FILE_MAX_BYTES {
            tracing::warn!(
                data_file_max_bytes = self.data_file_max_bytes,
                "config rejected: 'data_file_max_bytes' below minimum {}",
                MIN_DATA_FILE_MAX_BYTES
            );
            return Err(Error::BadParameterValue);
        }
        if self.merge_cycle_period_ms == 0 {
            tracing::warn!("config rejected: 'merge_cycle_period_ms' shall be positive");
            return Err(Error::BadParameterValue);
        }
        if self.upkeep_cycle_period_ms == 0 {
            tracing::warn!("config rejected: 'upkeep_cycle_period_ms' shall be positive");
            return Err(Error::BadParameterValue);
        }
        if self.upkeep_key_dir_batch_size == 0 {
            tracing::warn!("config rejected: 'upkeep_key_dir_batch_size' shall be positive");
            return Err(Error::BadParameterValue);
        }
        if self.upkeep_value_cache_batch_size == 0 {
            tracing::warn!("config rejected: 'upkeep_value_cache_batch_size' shall be positive");
            return Err(Error::BadParameterValue);
        }
        if self.value_cache_target_memory_load_percentage > 100 {
            tracing::warn!(
                "config rejected: 'value_cache_target_memory_load_percentage' shall be in [0; 100]"
            );
            return Err(Error::BadParameterValue);
        }
        if self.merge_trigger_data_file_fragmentation_percentage < 1
            || self.merge_trigger_data_file_fragmentation_percentage > 100
        {
            tracing::warn!(
                "config rejected: 'merge_trigger_data_file_fragmentation_percentage' shall be in ]0; 100]"
            );
            return Err(Error::BadParameterValue);
        }
        if self.merge_trigger_data_file_dead_byte_threshold > self.data_file_max_bytes {
            tracing::warn!(
                threshold = self.merge_trigger_data_file_dead_byte_threshold,
                data_file_max_bytes = self.data_file_max_bytes,
                "config rejected: dead-byte merge trigger exceeds the data file size bound"
            );
            return Err(Error::InconsistentParameterValues);
        }
        if self.merge_select_data_file_fragmentation_percentage < 1
            || self.merge_select_data_file_fragmentation_percentage > 100
        {
            tracing::warn!(
                "config rejected: 'merge_select_data_file_fragmentation_percentage' shall be in ]0; 100]"
            );
            return Err(Error::BadParameterValue);
        }
        if self.merge_select_data_file_fragmentation_percentage
            > self.merge_trigger_data_file_fragmentation_percentage
        {
            tracing::warn!(
                "config rejected: fragmentation selection threshold exceeds the trigger threshold"
            );
            return Err(Error::InconsistentParameterValues);
        }
        if self.merge_select_data_file_dead_byte_threshold
            > self.merge_trigger_data_file_dead_byte_threshold
        {
            tracing::warn!(
                "config rejected: dead-byte selection threshold exceeds the trigger threshold"
            );
            return Err(Error::InconsistentParameterValues);
        }
        if self.merge_select_data_file_small_size_threshold < MIN_DATA_FILE_MAX_BYTES {
            tracing::warn!(
                "config rejected: 'merge_select_data_file_small_size_threshold' below minimum {}",
                MIN_DATA_FILE_MAX_BYTES
            );
            return Err(Error::BadParameterValue);
        }
        Ok(())
    }

    /// Set the active-file size bound.
    pub fn data_file_max_bytes(mut self, bytes: u32) -> Self {
        self.data_file_max_bytes = bytes;
        self
    }

    /// Set the merge cycle period.
    pub fn merge_cycle_period_ms(mut self, ms: u32) -> Self {
        self.merge_cycle_period_ms = ms;
        self
    }

    /// Set the upkeep cycle period.
    pub fn upkeep_cycle_period_ms(mut self, ms: u32) -> Self {
        self.upkeep_cycle_period_ms = ms;
        self
    }

    /// Set the maximum age of buffered writes.
    pub fn write_buffer_flush_period_ms(mut self, ms: u32) -> Self {
        self.write_buffer_flush_period_ms = ms;
        self
    }

    /// Set the key directory migration batch size.
    pub fn upkeep_key_dir_batch_size(mut self, size: u32) -> Self {
        self.upkeep_key_dir_batch_size = size;
        self
    }

    /// Set the cache upkeep batch size.
    pub fn upkeep_value_cache_batch_size(mut self, size: u32) -> Self {
        self.upkeep_value_cache_batch_size = size;
        self
    }

    /// Set the cache target load percentage.
    pub fn value_cache_target_memory_load_percentage(mut self, percentage: u32) -> Self {
        self.value_cache_target_memory_load_percentage = percentage;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert_eq!(config.data_file_max_bytes, 100_000_000);
        assert_eq!(config.value_cache_target_memory_load_percentage, 90);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = Config::default()
            .data_file_max_bytes(2048)
            .merge_cycle_period_ms(500)
            .upkeep_cycle_period_ms(100);
        assert_eq!(config.data_file_max_bytes, 2048);
        assert_eq!(config.merge_cycle_period_ms, 500);
        assert_eq!(config.upkeep_cycle_period_ms, 100);
    }

    #[test]
    fn test_range_rejections() {
        let too_small = Config::default().data_file_max_bytes(1023);
        assert_eq!(too_small.validate(), Err(Error::BadParameterValue));

        let zero_period = Config::default().merge_cycle_period_ms(0);
        assert_eq!(zero_period.validate(), Err(Error::BadParameterValue));

        let bad_load = Config::default().value_cache_target_memory_load_percentage(101);
        assert_eq!(bad_load.validate(), Err(Error::BadParameterValue));

        let mut bad_frag = Config::default();
        bad_frag.merge_trigger_data_file_fragmentation_percentage = 0;
        assert_eq!(bad_frag.validate(), Err(Error::BadParameterValue));
    }

    #[test]
    fn test_cross_field_rejections() {
        // Dead-byte trigger above the file size bound contradicts itself:
        // a file can never accumulate that many dead bytes.
        let mut config = Config::default().data_file_max_bytes(11_000);
        config.merge_trigger_data_file_dead_byte_threshold = 11_001;
        config.merge_select_data_file_dead_byte_threshold = 1_000;
        assert_eq!(config.validate(), Err(Error::InconsistentParameterValues));

        let mut config = Config::default();
        config.merge_select_data_file_fragmentation_percentage =
            config.merge_trigger_data_file_fragmentation_percentage + 1;
        assert_eq!(config.validate(), Err(Error::InconsistentParameterValues));

        let mut config = Config::default();
        config.merge_select_data_file_dead_byte_threshold =
            config.merge_trigger_data_file_dead_byte_threshold + 1;
        assert_eq!(config.validate(), Err(Error::InconsistentParameterValues));
    }
}
