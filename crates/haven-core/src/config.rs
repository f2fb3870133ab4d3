use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Health assigned to a directory with no children. 0 is the domain
/// "fully healthy" value; larger is worse.
pub const DEFAULT_DIR_HEALTH: f64 = 0.0;

/// Aggregate health at or above which the root bubble signals the repair
/// loop. A file at this health has lost enough pieces that repairing it
/// from remote hosts is worthwhile.
pub const REMOTE_REPAIR_THRESHOLD: f64 = 0.25;

/// "No redundancy seen yet" marker used while folding children. Normalized
/// to 0 before a calculated metadata value escapes the calculator.
pub const REDUNDANCY_SENTINEL_MAX: f64 = f64::MAX;

/// Coordinator state file, stored under the engine's state directory.
pub const COORDINATOR_STATE_FILENAME: &str = "bubbles.json";

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Root of the backing metadata tree (file and directory records).
    pub files_dir: PathBuf,
    /// Directory holding engine state that survives restarts.
    pub state_dir: PathBuf,
}
