//! A cached, read-only random-access view of a remote object.
//!
//! [Disk] splits every read into fixed-size blocks. A block covered by the cache is served from
//! the [streamdisk_storage::store::Store]. Any other block is downloaded with a single ranged
//! request, persisted, and recorded as covered.
//!
//! # Coalescing
//!
//! Concurrent readers of the same uncached block share one download: the first reader to observe
//! the miss publishes a shared future and every later reader awaits it. If the download fails,
//! every reader sharing it receives the same [crate::Error::Fetch].
//!
//! # Eviction
//!
//! When [Config::cache_limit] is set, each completed download is followed by an eviction pass that
//! removes the least recently used blocks until the covered bytes fit the limit. The block just
//! downloaded is never evicted by its own pass, so the limit may be exceeded by at most one
//! block.
//!
//! # Healing
//!
//! A block that is covered but whose blob cannot be read back intact (missing, short, or failing
//! to read) is forgotten and downloaded again. Storage loss is never surfaced to the reader.
//! Blob writes and removals are serialized with the coverage changes they imply, so healing never
//! removes a blob another reader has just downloaded.
//!
//! # Request limit
//!
//! At most [Config::max_concurrent_fetches] ranged requests are outstanding at once. Readers and
//! read-ahead beyond the limit wait for a slot.
//!
//! # Clearing
//!
//! [Disk::clear] wipes the store and starts a new generation. Downloads already in flight still
//! deliver their bytes to their readers but leave nothing behind in the cleared cache.
//!
//! # Example
//!
//! ```rust,no_run
//! use streamdisk::{client::Http, remote::{Config, Disk, Identity}};
//! use streamdisk_storage::store::directory::Directory;
//!
//! # async fn example() -> Result<(), streamdisk::Error> {
//! let client = Http::new("https://images.example.com/win7.img".parse().unwrap());
//! let identity = Identity::new("win7", "sp1", "range");
//! let store = Directory::init(std::env::temp_dir().join(identity.cache_key())).await?;
//! let disk = Disk::open(client, store, Config::new(identity)).await?;
//!
//! let mut sector = [0u8; 512];
//! disk.read_at(0, &mut sector).await?;
//! disk.close().await?;
//! # Ok(())
//! # }
//! ```

use crate::{device::SECTOR_SIZE, Error};

mod disk;
pub use disk::Disk;
pub mod metrics;
#[cfg(test)]
pub mod mocks;

pub use streamdisk_storage::metadata::Identity;

/// Default size of each block (1 MiB).
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

/// Largest supported block size (64 MiB).
pub const MAX_CHUNK_SIZE: u64 = 64 * 1024 * 1024;

/// Default number of blocks read ahead on sequential access.
pub const DEFAULT_PREFETCH: usize = 2;

/// Largest supported read-ahead, in blocks.
pub const MAX_PREFETCH: usize = 64;

/// Largest supported read-ahead, in bytes (512 MiB).
pub const MAX_PREFETCH_BYTES: u64 = 512 * 1024 * 1024;

/// Default number of ranged requests outstanding at once.
pub const DEFAULT_MAX_CONCURRENT_FETCHES: usize = 4;

/// Largest supported number of ranged requests outstanding at once.
pub const MAX_CONCURRENT_FETCHES: usize = 128;

/// Largest supported volume of outstanding downloads, in bytes (512 MiB).
pub const MAX_INFLIGHT_BYTES: u64 = 512 * 1024 * 1024;

/// Configuration for [Disk].
#[derive(Clone, Debug)]
pub struct Config {
    /// Stable identity of the remote object. A persisted cache is only reused for the same
    /// identity.
    pub identity: Identity,

    /// Size of each block, in bytes. Must be a positive multiple of the sector size no larger
    /// than [MAX_CHUNK_SIZE].
    pub chunk_size: u64,

    /// Target for the bytes covered by the cache. `None` disables eviction.
    pub cache_limit: Option<u64>,

    /// Number of blocks to read ahead once sequential access is detected.
    pub prefetch: usize,

    /// Ranged requests allowed in flight at once, across readers and read-ahead.
    pub max_concurrent_fetches: usize,
}

impl Config {
    /// Configuration with default chunk size and read-ahead and no cache limit.
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            chunk_size: DEFAULT_CHUNK_SIZE,
            cache_limit: None,
            prefetch: DEFAULT_PREFETCH,
            max_concurrent_fetches: DEFAULT_MAX_CONCURRENT_FETCHES,
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.chunk_size == 0 || self.chunk_size % SECTOR_SIZE as u64 != 0 {
            return Err(Error::InvalidConfig(
                "chunk size must be a positive multiple of 512",
            ));
        }
        if self.chunk_size > MAX_CHUNK_SIZE {
            return Err(Error::InvalidConfig("chunk size must not exceed 64 MiB"));
        }
        if self.prefetch > MAX_PREFETCH {
            return Err(Error::InvalidConfig("prefetch must not exceed 64 blocks"));
        }
        if (self.prefetch as u64).saturating_mul(self.chunk_size) > MAX_PREFETCH_BYTES {
            return Err(Error::InvalidConfig("prefetch must not exceed 512 MiB"));
        }
        if self.max_concurrent_fetches == 0 {
            return Err(Error::InvalidConfig(
                "max concurrent fetches must be greater than zero",
            ));
        }
        if self.max_concurrent_fetches > MAX_CONCURRENT_FETCHES {
            return Err(Error::InvalidConfig(
                "max concurrent fetches must not exceed 128",
            ));
        }
        if (self.max_concurrent_fetches as u64).saturating_mul(self.chunk_size) > MAX_INFLIGHT_BYTES
        {
            return Err(Error::InvalidConfig(
                "concurrent downloads must not exceed 512 MiB",
            ));
        }
        Ok(())
    }
}
