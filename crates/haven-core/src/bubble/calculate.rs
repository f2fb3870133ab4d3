use std::fs;

use chrono::{DateTime, Utc};
use tracing::warn;

use haven_types::error::{HavenError, Result};
use haven_types::path::{VaultPath, FILE_EXTENSION};

use crate::config::{DEFAULT_DIR_HEALTH, REDUNDANCY_SENTINEL_MAX};
use crate::metadata::DirectoryMetadata;

use super::probe::calculate_and_update_file_metadata;
use super::BubbleEngine;

/// One child's contribution to the enclosing directory's metadata.
pub(crate) struct ChildValues {
    /// Worst health anywhere beneath the child: the file's own health, or
    /// `max(aggregate_health, health)` for a subdirectory.
    pub aggregate_health: f64,
    pub stuck_health: f64,
    pub redundancy: f64,
    pub num_stuck_chunks: u64,
    pub mod_time: DateTime<Utc>,
    pub last_health_check_time: DateTime<Utc>,
}

/// Fold one child into the accumulator. Pure max/min/sum steps, so the
/// result does not depend on the order children are visited in.
pub(crate) fn fold_child(metadata: &mut DirectoryMetadata, child: &ChildValues) {
    if child.aggregate_health > metadata.aggregate_health {
        metadata.aggregate_health = child.aggregate_health;
    }
    if child.stuck_health > metadata.stuck_health {
        metadata.stuck_health = child.stuck_health;
    }
    if child.redundancy < metadata.min_redundancy {
        metadata.min_redundancy = child.redundancy;
    }
    if child.mod_time > metadata.mod_time {
        metadata.mod_time = child.mod_time;
    }
    if child.last_health_check_time < metadata.last_health_check_time {
        metadata.last_health_check_time = child.last_health_check_time;
    }
    metadata.num_stuck_chunks += child.num_stuck_chunks;
}

/// Recompute the metadata of one directory from its immediate children.
///
/// File children are probed (refreshing their cached health on disk);
/// subdirectory children contribute their last-persisted metadata. A file
/// that fails to probe is skipped so one corrupt record cannot starve its
/// siblings, but a subdirectory without readable metadata aborts the whole
/// calculation, since the aggregate would be wrong without it.
pub(crate) fn calculate_directory_metadata(
    engine: &BubbleEngine,
    path: &VaultPath,
) -> Result<DirectoryMetadata> {
    let now = Utc::now();
    let mut metadata = DirectoryMetadata {
        health: DEFAULT_DIR_HEALTH,
        stuck_health: DEFAULT_DIR_HEALTH,
        min_redundancy: REDUNDANCY_SENTINEL_MAX,
        num_files: 0,
        num_sub_dirs: 0,
        num_stuck_chunks: 0,
        mod_time: DateTime::<Utc>::UNIX_EPOCH,
        last_health_check_time: now,
        aggregate_health: DEFAULT_DIR_HEALTH,
        aggregate_num_files: 0,
        aggregate_size: 0,
    };

    let sys_path = path.dir_sys_path(&engine.files_dir);
    let entries = fs::read_dir(&sys_path).map_err(|e| {
        warn!(path = %sys_path.display(), error = %e, "unable to read directory");
        HavenError::from(e).context(format!("unable to read directory '{}'", sys_path.display()))
    })?;

    for entry in entries {
        // Stop promptly when the engine is shutting down; the driver's
        // completion still runs so coordinator state does not leak.
        if engine.group.is_stopped() {
            return Err(HavenError::ShuttingDown);
        }

        let entry = entry
            .map_err(|e| HavenError::from(e).context("unable to read directory entry"))?;
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };

        if let Some(logical_name) = name.strip_suffix(FILE_EXTENSION) {
            let file_path = match path.join(logical_name) {
                Ok(p) => p,
                Err(e) => {
                    warn!(name, error = %e, "unable to join file name with directory path");
                    continue;
                }
            };
            let file_metadata = match calculate_and_update_file_metadata(
                engine.files.as_ref(),
                engine.hosts.as_ref(),
                &file_path,
            ) {
                Ok(m) => m,
                Err(e) => {
                    warn!(file = name, error = %e, "failed to calculate file metadata");
                    continue;
                }
            };

            metadata.num_files += 1;
            metadata.aggregate_num_files += 1;
            metadata.aggregate_size += file_metadata.size;
            if file_metadata.health > metadata.health {
                metadata.health = file_metadata.health;
            }
            fold_child(
                &mut metadata,
                &ChildValues {
                    aggregate_health: file_metadata.health,
                    stuck_health: file_metadata.stuck_health,
                    redundancy: file_metadata.redundancy,
                    num_stuck_chunks: file_metadata.num_stuck_chunks,
                    mod_time: file_metadata.mod_time,
                    last_health_check_time: file_metadata.last_health_check_time,
                },
            );
        } else if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            let dir_path = path
                .join(name)
                .map_err(|e| e.context("unable to join subdirectory name with directory path"))?;
            let sub = read_directory_metadata(engine, &dir_path)?;

            metadata.aggregate_num_files += sub.aggregate_num_files;
            metadata.aggregate_size += sub.aggregate_size;
            metadata.num_sub_dirs += 1;
            fold_child(
                &mut metadata,
                &ChildValues {
                    aggregate_health: sub.aggregate_health.max(sub.health),
                    stuck_health: sub.stuck_health,
                    redundancy: sub.min_redundancy,
                    num_stuck_chunks: sub.num_stuck_chunks,
                    mod_time: sub.mod_time,
                    last_health_check_time: sub.last_health_check_time,
                },
            );
        }
        // Everything else (other suffixes, symlinks, specials) is ignored.
    }

    // No children set a mod time: the update we are doing right now is the
    // newest modification.
    if metadata.mod_time == DateTime::<Utc>::UNIX_EPOCH {
        metadata.mod_time = now;
    }
    if metadata.min_redundancy == REDUNDANCY_SENTINEL_MAX {
        metadata.min_redundancy = 0.0;
    }

    Ok(metadata)
}

/// Read a subdirectory's last-persisted metadata.
///
/// Never recomputes: freshness comes from the driver's upward propagation.
/// A missing record on an empty non-root directory is presumed deleted and
/// must not be re-materialized, so the original absent error is surfaced.
pub(crate) fn read_directory_metadata(
    engine: &BubbleEngine,
    path: &VaultPath,
) -> Result<DirectoryMetadata> {
    let sys_path = path.dir_sys_path(&engine.files_dir);
    let info = fs::metadata(&sys_path)
        .map_err(|e| HavenError::from(e).context(format!("unable to stat '{}'", sys_path.display())))?;
    if !info.is_dir() {
        return Err(HavenError::NotADirectory(path.to_string()));
    }

    let handle = match engine.dirs.open(path) {
        Ok(handle) => handle,
        Err(open_err @ HavenError::DirNotFound(_)) => {
            let mut children = fs::read_dir(&sys_path).map_err(|e| {
                HavenError::from(e)
                    .context(format!("unable to read directory '{}'", sys_path.display()))
            })?;
            if children.next().is_none() && !path.is_root() {
                return Err(open_err);
            }
            engine.dirs.create(path)?
        }
        Err(e) => return Err(e),
    };

    Ok(handle.metadata())
}
