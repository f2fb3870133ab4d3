use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::DEFAULT_DIR_HEALTH;

/// Health metrics for a single file, produced by the file probe while a
/// directory is being aggregated. Transient; only [`CachedHealthMetadata`]
/// is written back to the file record.
#[derive(Debug, Clone, PartialEq)]
pub struct BubbledMetadata {
    pub health: f64,
    pub stuck_health: f64,
    pub redundancy: f64,
    pub num_stuck_chunks: u64,
    pub last_health_check_time: DateTime<Utc>,
    pub mod_time: DateTime<Utc>,
    pub size: u64,
}

/// The slice of a file's health state that is persisted on its record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CachedHealthMetadata {
    pub health: f64,
    pub stuck_health: f64,
    pub redundancy: f64,
}

/// Persisted per-directory metadata.
///
/// The local tier describes this directory's immediate children; the
/// `aggregate_*` tier summarizes the entire subtree rooted here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectoryMetadata {
    /// Worst health among immediate file children.
    pub health: f64,
    /// Worst stuck-health among immediate children.
    pub stuck_health: f64,
    /// Minimum redundancy across immediate children; 0 when none.
    pub min_redundancy: f64,
    pub num_files: u64,
    pub num_sub_dirs: u64,
    /// Stuck chunks summed over the subtree.
    pub num_stuck_chunks: u64,
    /// Newest modification time among children, or the calculation time
    /// when the directory is empty.
    pub mod_time: DateTime<Utc>,
    /// Oldest health-check time among children, or the calculation time
    /// when the directory is empty.
    pub last_health_check_time: DateTime<Utc>,

    /// Worst health anywhere in the subtree.
    pub aggregate_health: f64,
    pub aggregate_num_files: u64,
    pub aggregate_size: u64,
}

impl DirectoryMetadata {
    /// Metadata stored for a newly created directory record.
    pub fn fresh(now: DateTime<Utc>) -> Self {
        DirectoryMetadata {
            health: DEFAULT_DIR_HEALTH,
            stuck_health: DEFAULT_DIR_HEALTH,
            min_redundancy: 0.0,
            num_files: 0,
            num_sub_dirs: 0,
            num_stuck_chunks: 0,
            mod_time: now,
            last_health_check_time: now,
            aggregate_health: DEFAULT_DIR_HEALTH,
            aggregate_num_files: 0,
            aggregate_size: 0,
        }
    }
}
