use tracing::debug;

use haven_types::error::{HavenError, Result};
use haven_types::path::VaultPath;

use crate::host::HostCatalog;
use crate::metadata::{BubbledMetadata, CachedHealthMetadata};
use crate::store::{FileHealth, FileStore};

/// Recompute one file's health under the current host view and write the
/// refreshed cache back to its record.
///
/// The record's stuck bits are swept first (chunks that became healthy are
/// unstuck), then the health triple, check time, and redundancy are
/// recomputed and persisted. A cache write failure is the returned error
/// even though the metadata had already been assembled.
pub(crate) fn calculate_and_update_file_metadata(
    files: &dyn FileStore,
    hosts: &dyn HostCatalog,
    path: &VaultPath,
) -> Result<BubbledMetadata> {
    let entry = files.open(path)?;

    let view = hosts.contracts_and_utilities(&[entry.as_ref()]);
    entry
        .mark_all_healthy_chunks_as_unstuck(&view.offline, &view.good_for_renew)
        .map_err(|e| e.context("unable to mark healthy chunks as unstuck"))?;

    let FileHealth {
        health,
        stuck_health,
        num_stuck_chunks,
    } = entry.health(&view.offline, &view.good_for_renew);

    entry.update_last_health_check_time()?;

    let redundancy = entry.redundancy(&view.offline, &view.good_for_renew);
    if !health.is_finite() || !stuck_health.is_finite() || !redundancy.is_finite() {
        return Err(HavenError::ContractViolation(format!(
            "file store produced non-finite health values for '{path}'"
        )));
    }
    if redundancy < 0.0 {
        return Err(HavenError::ContractViolation(format!(
            "file store produced negative redundancy for '{path}'"
        )));
    }

    let local_path = entry.local_path();
    if redundancy < 1.0 && !local_path.exists() {
        debug!(
            path = %local_path.display(),
            "file not found on disk and possibly unrecoverable"
        );
    }

    let metadata = BubbledMetadata {
        health,
        stuck_health,
        redundancy,
        num_stuck_chunks,
        last_health_check_time: entry.last_health_check_time(),
        mod_time: entry.mod_time(),
        size: entry.size(),
    };
    entry.update_cached_health_metadata(CachedHealthMetadata {
        health,
        stuck_health,
        redundancy,
    })?;
    Ok(metadata)
}
