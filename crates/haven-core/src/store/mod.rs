pub mod dir_record;
pub mod file_record;

use std::path::PathBuf;

use chrono::{DateTime, Utc};

use haven_types::error::Result;
use haven_types::path::VaultPath;

use crate::host::HostMap;
use crate::metadata::{CachedHealthMetadata, DirectoryMetadata};

/// Health triple computed for one file under a host view.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FileHealth {
    /// Worst chunk health; 0 = fully redundant, larger = worse.
    pub health: f64,
    /// Worst health among stuck chunks.
    pub stuck_health: f64,
    pub num_stuck_chunks: u64,
}

/// Open handle to a file record. Handles are reference counted by the
/// store; dropping the handle releases it.
pub trait FileEntry: Send + Sync + std::fmt::Debug {
    /// Clear the stuck bit on every chunk that is healthy under the given
    /// host view.
    fn mark_all_healthy_chunks_as_unstuck(
        &self,
        offline: &HostMap,
        good_for_renew: &HostMap,
    ) -> Result<()>;

    fn health(&self, offline: &HostMap, good_for_renew: &HostMap) -> FileHealth;

    /// Ratio of available pieces to the minimum needed for reconstruction;
    /// below 1 the file cannot be rebuilt from the network alone.
    fn redundancy(&self, offline: &HostMap, good_for_renew: &HostMap) -> f64;

    /// Path of the original file on the local filesystem.
    fn local_path(&self) -> PathBuf;

    fn last_health_check_time(&self) -> DateTime<Utc>;

    fn update_last_health_check_time(&self) -> Result<()>;

    fn mod_time(&self) -> DateTime<Utc>;

    fn size(&self) -> u64;

    fn update_cached_health_metadata(&self, metadata: CachedHealthMetadata) -> Result<()>;
}

/// Store of per-file records, keyed by vault path.
pub trait FileStore: Send + Sync {
    /// Open the record at `path`. Absent records fail with
    /// [`HavenError::FileNotFound`](haven_types::error::HavenError::FileNotFound).
    fn open(&self, path: &VaultPath) -> Result<Box<dyn FileEntry>>;
}

/// Open handle to a directory record.
pub trait DirEntry: Send + Sync + std::fmt::Debug {
    fn metadata(&self) -> DirectoryMetadata;

    fn update_metadata(&self, metadata: DirectoryMetadata) -> Result<()>;
}

/// Store of per-directory records, keyed by vault path.
pub trait DirStore: Send + Sync {
    /// Open the record at `path`. Absent records fail with
    /// [`HavenError::DirNotFound`](haven_types::error::HavenError::DirNotFound).
    fn open(&self, path: &VaultPath) -> Result<Box<dyn DirEntry>>;

    /// Create a record with fresh default metadata and return a handle to it.
    fn create(&self, path: &VaultPath) -> Result<Box<dyn DirEntry>>;
}
