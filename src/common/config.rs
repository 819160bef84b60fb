use std::time::Duration;

/// Default page size in bytes (4 KB)
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Smallest page size accepted by the file format
pub const MIN_PAGE_SIZE: usize = 512;

/// Largest page size accepted by the file format
pub const MAX_PAGE_SIZE: usize = 65536;

/// Default soft bound on the number of cached pages
pub const DEFAULT_CACHE_SIZE: usize = 256;

/// Default K value for LRU-K replacement policy (1 is plain LRU)
pub const DEFAULT_LRUK_K: usize = 1;

/// Default number of WAL frames after which a commit runs a passive checkpoint
pub const DEFAULT_WAL_AUTOCHECKPOINT: u32 = 1000;

/// Largest page number the file format can address
pub const MAX_PAGE_COUNT: u32 = 4_294_967_294;

/// Size of the database header at the start of page 1
pub const DB_HEADER_SIZE: usize = 100;

/// Byte offset of the lock byte range. The page containing it is never used.
pub const PENDING_BYTE: u64 = 0x4000_0000;

/// Byte locked by the connection holding RESERVED
pub const RESERVED_BYTE: u64 = PENDING_BYTE + 1;

/// First byte of the range locked by SHARED and EXCLUSIVE holders
pub const SHARED_FIRST: u64 = PENDING_BYTE + 2;

/// Length of the SHARED byte range
pub const SHARED_SIZE: u64 = 510;

/// Number of WAL read-mark slots. Slot 0 means "main file only".
pub const READ_MARK_COUNT: usize = 5;

/// Read-mark value of a slot that is not describing any snapshot
pub const READMARK_NOT_USED: u32 = 0xffff_ffff;

/// Durability level applied at commit and checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Never fsync.
    Off,
    /// Fsync the WAL and main file when checkpointing only.
    Normal,
    /// Fsync the WAL at every commit, and both files when checkpointing.
    Full,
}

/// Per-connection tuning knobs.
#[derive(Debug, Clone)]
pub struct PagerConfig {
    pub page_size: usize,
    /// Bytes reserved at the end of every page
    pub reserved_space: u8,
    pub cache_size: usize,
    pub lru_k: usize,
    /// How long busy lock acquisitions are retried before returning `Busy`
    pub busy_timeout: Duration,
    pub synchronous: SyncMode,
    /// 0 disables automatic checkpoints
    pub wal_autocheckpoint: u32,
    pub max_page_count: u32,
}

impl Default for PagerConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            reserved_space: 0,
            cache_size: DEFAULT_CACHE_SIZE,
            lru_k: DEFAULT_LRUK_K,
            busy_timeout: Duration::ZERO,
            synchronous: SyncMode::Full,
            wal_autocheckpoint: DEFAULT_WAL_AUTOCHECKPOINT,
            max_page_count: MAX_PAGE_COUNT,
        }
    }
}

impl PagerConfig {
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_reserved_space(mut self, reserved: u8) -> Self {
        self.reserved_space = reserved;
        self
    }

    pub fn with_cache_size(mut self, pages: usize) -> Self {
        self.cache_size = pages;
        self
    }

    pub fn with_lru_k(mut self, k: usize) -> Self {
        self.lru_k = k;
        self
    }

    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    pub fn with_synchronous(mut self, mode: SyncMode) -> Self {
        self.synchronous = mode;
        self
    }

    pub fn with_wal_autocheckpoint(mut self, frames: u32) -> Self {
        self.wal_autocheckpoint = frames;
        self
    }

    pub fn with_max_page_count(mut self, pages: u32) -> Self {
        self.max_page_count = pages;
        self
    }

    /// Bytes of each page available to the B-tree layer.
    pub fn usable_size(&self) -> usize {
        self.page_size - self.reserved_space as usize
    }

    /// Returns true if `page_size` is a power of two within the supported range.
    pub fn page_size_is_valid(page_size: usize) -> bool {
        page_size.is_power_of_two() && (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size)
    }

    /// Page number of the page holding `PENDING_BYTE` for this page size.
    pub fn lock_byte_page(&self) -> u32 {
        (PENDING_BYTE / self.page_size as u64) as u32 + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = PagerConfig::default();
        assert_eq!(config.page_size, 4096);
        assert_eq!(config.usable_size(), 4096);
        assert_eq!(config.lock_byte_page(), 262_145);
        assert_eq!(config.synchronous, SyncMode::Full);
    }

    #[test]
    fn test_page_size_validation() {
        assert!(PagerConfig::page_size_is_valid(512));
        assert!(PagerConfig::page_size_is_valid(65536));
        assert!(!PagerConfig::page_size_is_valid(1000));
        assert!(!PagerConfig::page_size_is_valid(256));
        assert!(!PagerConfig::page_size_is_valid(131072));
    }

    #[test]
    fn test_usable_size_with_reserved_space() {
        let config = PagerConfig::default().with_page_size(1024).with_reserved_space(24);
        assert_eq!(config.usable_size(), 1000);
    }
}
