//! Configuration options for the tablet server.

use std::time::Duration;

/// Configuration options for opening a tablet server.
#[derive(Debug, Clone)]
pub struct Options {
    /// Create the data directory if it doesn't exist.
    /// Default: true
    pub create_if_missing: bool,

    /// Size at which a table's commit buffer is handed to the log (in bytes).
    /// Default: 32KB
    pub commit_buffer_size: usize,

    /// Longest time a non-empty commit buffer waits before it is handed to
    /// the log.
    /// Default: 50ms
    pub commit_flush_interval: Duration,

    /// Log group size at which memory tables are serialized to disk
    /// fragments (in bytes).
    /// Default: 128MB
    pub serialize_threshold: u64,

    /// Time after which memory tables that failed to serialize are tried
    /// again when no new work arrives.
    /// Default: 1 second
    pub serialize_retry_interval: Duration,

    /// Depth of the queue feeding the commit worker.
    /// Default: 4
    pub commit_queue_depth: usize,

    /// Depth of the queue feeding the serialize worker.
    /// Default: 2
    pub serialize_queue_depth: usize,

    /// Target size of a disk fragment block before compression (in bytes).
    /// Default: 64KB
    pub block_size: usize,

    /// Compression applied to fragment blocks.
    /// Default: CompressionType::Snappy
    pub compression: CompressionType,

    /// Maximum number of fragments merged by one compaction.
    /// Default: 16
    pub compaction_max_fragments: usize,

    /// Maximum total input size of one compaction (in bytes).
    /// Default: 2GB
    pub compaction_max_size: u64,

    /// Output size after which a compaction stops taking new ranges
    /// (in bytes).
    /// Default: 1GB
    pub compaction_output_budget: u64,

    /// Elapsed time after which a compaction stops taking new ranges.
    /// Default: 5 minutes
    pub compaction_time_budget: Duration,

    /// How often the compaction worker looks for work without being woken.
    /// Default: 30 seconds
    pub compaction_interval: Duration,

    /// Size of the per-table row commit history kept for conflict checks
    /// (in bytes).
    /// Default: 1MB
    pub commit_ring_threshold: usize,

    /// Number of open disk fragments kept in the fragment cache.
    /// Default: 256
    pub fragment_cache_threshold: usize,

    /// Number of decoded block indexes kept in the index cache.
    /// Default: 256
    pub index_cache_threshold: usize,

    /// Abort the process when the commit log cannot be written.
    /// Default: true
    pub abort_on_log_failure: bool,

    /// Run compaction on a background worker.
    /// Default: true
    pub background_compaction: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            commit_buffer_size: 32 * 1024,
            commit_flush_interval: Duration::from_millis(50),
            serialize_threshold: 128 * 1024 * 1024,
            serialize_retry_interval: Duration::from_secs(1),
            commit_queue_depth: 4,
            serialize_queue_depth: 2,
            block_size: 64 * 1024,
            compression: CompressionType::default(),
            compaction_max_fragments: 16,
            compaction_max_size: 2 * 1024 * 1024 * 1024,
            compaction_output_budget: 1024 * 1024 * 1024,
            compaction_time_budget: Duration::from_secs(300),
            compaction_interval: Duration::from_secs(30),
            commit_ring_threshold: 1024 * 1024,
            fragment_cache_threshold: 256,
            index_cache_threshold: 256,
            abort_on_log_failure: true,
            background_compaction: true,
        }
    }
}

/// Compression algorithms supported for fragment blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompressionType {
    /// No compression.
    None = 0,

    /// Snappy compression (fast, moderate compression ratio).
    #[cfg(feature = "snappy")]
    Snappy = 1,

    /// LZ4 compression (very fast, lower compression ratio).
    #[cfg(feature = "lz4-compression")]
    Lz4 = 2,
}

impl CompressionType {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(CompressionType::None),
            #[cfg(feature = "snappy")]
            1 => Some(CompressionType::Snappy),
            #[cfg(feature = "lz4-compression")]
            2 => Some(CompressionType::Lz4),
            _ => None,
        }
    }
}

impl Default for CompressionType {
    fn default() -> Self {
        #[cfg(feature = "snappy")]
        return CompressionType::Snappy;

        #[cfg(not(feature = "snappy"))]
        CompressionType::None
    }
}

impl Options {
    /// Creates a new Options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the data directory if it doesn't exist.
    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets the commit buffer size.
    pub fn commit_buffer_size(mut self, size: usize) -> Self {
        self.commit_buffer_size = size;
        self
    }

    /// Sets how long buffered mutations may wait for the log.
    pub fn commit_flush_interval(mut self, interval: Duration) -> Self {
        self.commit_flush_interval = interval;
        self
    }

    /// Sets the log group serialization threshold.
    pub fn serialize_threshold(mut self, size: u64) -> Self {
        self.serialize_threshold = size;
        self
    }

    /// Sets how often failed serializations are retried.
    pub fn serialize_retry_interval(mut self, interval: Duration) -> Self {
        self.serialize_retry_interval = interval;
        self
    }

    /// Sets the fragment block size.
    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    /// Sets the compression algorithm.
    pub fn compression(mut self, compression: CompressionType) -> Self {
        self.compression = compression;
        self
    }

    /// Sets the compaction fragment and input size limits.
    pub fn compaction_limits(mut self, max_fragments: usize, max_size: u64) -> Self {
        self.compaction_max_fragments = max_fragments;
        self.compaction_max_size = max_size;
        self
    }

    /// Sets the compaction output and time budgets.
    pub fn compaction_budget(mut self, output: u64, time: Duration) -> Self {
        self.compaction_output_budget = output;
        self.compaction_time_budget = time;
        self
    }

    /// Sets the commit history size.
    pub fn commit_ring_threshold(mut self, size: usize) -> Self {
        self.commit_ring_threshold = size;
        self
    }

    /// Sets whether a commit log failure aborts the process.
    pub fn abort_on_log_failure(mut self, value: bool) -> Self {
        self.abort_on_log_failure = value;
        self
    }

    /// Enables or disables background compaction.
    pub fn background_compaction(mut self, value: bool) -> Self {
        self.background_compaction = value;
        self
    }

    /// Validates the options and returns an error if any are invalid.
    pub fn validate(&self) -> crate::Result<()> {
        if self.commit_buffer_size == 0 {
            return Err(crate::Error::invalid_argument("commit_buffer_size must be > 0"));
        }
        if self.commit_flush_interval.is_zero() {
            return Err(crate::Error::invalid_argument("commit_flush_interval must be > 0"));
        }
        if self.serialize_threshold == 0 {
            return Err(crate::Error::invalid_argument("serialize_threshold must be > 0"));
        }
        if self.serialize_retry_interval.is_zero() {
            return Err(crate::Error::invalid_argument("serialize_retry_interval must be > 0"));
        }
        if self.commit_queue_depth == 0 || self.serialize_queue_depth == 0 {
            return Err(crate::Error::invalid_argument("queue depths must be > 0"));
        }
        if self.block_size == 0 {
            return Err(crate::Error::invalid_argument("block_size must be > 0"));
        }
        if self.compaction_max_fragments < 2 {
            return Err(crate::Error::invalid_argument("compaction_max_fragments must be >= 2"));
        }
        if self.commit_ring_threshold == 0 {
            return Err(crate::Error::invalid_argument("commit_ring_threshold must be > 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let opts = Options::default();
        assert!(opts.create_if_missing);
        assert_eq!(opts.commit_buffer_size, 32 * 1024);
        assert_eq!(opts.serialize_threshold, 128 * 1024 * 1024);
        assert_eq!(opts.compaction_max_fragments, 16);
        assert!(opts.abort_on_log_failure);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let opts = Options::new()
            .commit_buffer_size(1024)
            .serialize_threshold(4096)
            .block_size(512)
            .compression(CompressionType::None)
            .background_compaction(false);
        assert_eq!(opts.commit_buffer_size, 1024);
        assert_eq!(opts.serialize_threshold, 4096);
        assert_eq!(opts.block_size, 512);
        assert_eq!(opts.compression, CompressionType::None);
        assert!(!opts.background_compaction);
    }

    #[test]
    fn test_validate() {
        assert!(Options::new().block_size(0).validate().is_err());
        assert!(Options::new().commit_buffer_size(0).validate().is_err());
        assert!(Options::new().compaction_limits(1, 10).validate().is_err());
        assert!(Options::new().serialize_retry_interval(Duration::ZERO).validate().is_err());
    }

    #[test]
    fn test_compression_from_u8() {
        assert_eq!(CompressionType::from_u8(0), Some(CompressionType::None));
        assert_eq!(CompressionType::from_u8(99), None);
    }
}
