use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a `DataStores` registry
#[derive(Debug, Clone)]
pub struct DataStoreConfig {
    /// Directory holding every `<guid>.data` and `<guid>.data.fl` file
    pub dir: PathBuf,

    /// Smallest block handed out by the allocator (default: 4KB).
    /// Rounded up to a power of two when the registry is opened.
    pub min_alloc_size: usize,

    /// How often the background flusher runs (default: 5s).
    /// `Duration::ZERO` disables the flusher.
    pub flush_interval: Duration,
}

impl Default for DataStoreConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./datastores"),
            min_alloc_size: 4 * 1024, // 4KB
            flush_interval: Duration::from_secs(5),
        }
    }
}

impl DataStoreConfig {
    /// Create a new config with the given directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Set minimum allocation size
    pub fn min_alloc_size(mut self, size: usize) -> Self {
        self.min_alloc_size = size;
        self
    }

    /// Set background flush interval
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Set background flush interval in milliseconds, zero disables it
    pub fn with_flush_interval_ms(self, millis: u64) -> Self {
        self.flush_interval(Duration::from_millis(millis))
    }

    /// Whether the background flusher should be started
    pub fn background_flush_enabled(&self) -> bool {
        !self.flush_interval.is_zero()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DataStoreConfig::default();
        assert_eq!(config.dir, PathBuf::from("./datastores"));
        assert_eq!(config.min_alloc_size, 4 * 1024);
        assert_eq!(config.flush_interval, Duration::from_secs(5));
        assert!(config.background_flush_enabled());
    }

    #[test]
    fn test_config_builder() {
        let config = DataStoreConfig::new("/tmp/test")
            .min_alloc_size(64)
            .with_flush_interval_ms(250);

        assert_eq!(config.dir, PathBuf::from("/tmp/test"));
        assert_eq!(config.min_alloc_size, 64);
        assert_eq!(config.flush_interval, Duration::from_millis(250));
    }

    #[test]
    fn test_zero_interval_disables_flusher() {
        let config = DataStoreConfig::new("/tmp/test").with_flush_interval_ms(0);
        assert!(!config.background_flush_enabled());
    }
}
