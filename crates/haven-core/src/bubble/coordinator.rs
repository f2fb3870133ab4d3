use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::warn;

use haven_types::error::{HavenError, Result};
use haven_types::path::VaultPath;

use crate::config::COORDINATOR_STATE_FILENAME;

/// Lifecycle state of the aggregation pending for one directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BubbleStatus {
    /// Queued; the next `needed` call claims it.
    Init,
    /// A driver invocation is running for this path.
    Active,
    /// A request arrived while one was in flight; the in-flight driver
    /// re-queues it on completion.
    Pending,
    /// Poisoned entry; every operation on it fails.
    Error,
}

/// What the driver must do after `complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompleteAction {
    Noop,
    /// A coalesced request is waiting: schedule a fresh driver run.
    Rerun,
}

/// Process-wide table coalescing bubble requests per directory.
///
/// The map is the whole protocol: at most one driver is admitted between
/// a `needed` returning true and the matching `complete`, and any request
/// arriving in between collapses into a single follow-up run. The table is
/// persisted so interrupted aggregations survive a restart.
pub struct BubbleCoordinator {
    state_path: PathBuf,
    updates: Mutex<HashMap<String, BubbleStatus>>,
}

impl BubbleCoordinator {
    /// Load persisted state from `state_dir`, or start empty. `Active`
    /// entries are demoted to `Init`: no task owns them across a restart.
    pub fn load(state_dir: &Path) -> Result<Self> {
        let state_path = state_dir.join(COORDINATOR_STATE_FILENAME);
        let mut updates: HashMap<String, BubbleStatus> = match fs::read(&state_path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| HavenError::State(format!("corrupt coordinator state: {e}")))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        for status in updates.values_mut() {
            if *status == BubbleStatus::Active {
                *status = BubbleStatus::Init;
            }
        }
        Ok(BubbleCoordinator {
            state_path,
            updates: Mutex::new(updates),
        })
    }

    /// Whether the caller should run an aggregation for `path` now.
    ///
    /// Claims the path when it is idle or freshly queued; otherwise records
    /// that a re-run is wanted and tells the caller to back off.
    pub fn needed(&self, path: &VaultPath) -> Result<bool> {
        let mut updates = self.updates.lock().unwrap();
        let status = updates
            .entry(path.as_str().to_string())
            .or_insert(BubbleStatus::Init);
        match *status {
            BubbleStatus::Init => {
                *status = BubbleStatus::Active;
                Ok(true)
            }
            BubbleStatus::Active => {
                *status = BubbleStatus::Pending;
                Ok(false)
            }
            BubbleStatus::Pending => Ok(false),
            BubbleStatus::Error => Err(HavenError::InvalidBubbleStatus(path.to_string())),
        }
    }

    /// Finish the driver invocation for `path` and persist the table.
    pub fn complete(&self, path: &VaultPath) -> Result<CompleteAction> {
        let mut updates = self.updates.lock().unwrap();
        let Some(status) = updates.get(path.as_str()).copied() else {
            return Ok(CompleteAction::Noop);
        };
        let action = match status {
            BubbleStatus::Active => {
                updates.remove(path.as_str());
                CompleteAction::Noop
            }
            BubbleStatus::Pending => {
                updates.insert(path.as_str().to_string(), BubbleStatus::Init);
                CompleteAction::Rerun
            }
            _ => return Err(HavenError::InvalidBubbleStatus(path.to_string())),
        };
        self.save(&updates)?;
        Ok(action)
    }

    /// Paths whose aggregation was interrupted before completion. `Pending`
    /// entries are demoted to `Init` first: their in-flight owner is gone,
    /// so nobody else would ever escalate them.
    pub fn take_interrupted(&self) -> Vec<VaultPath> {
        let mut updates = self.updates.lock().unwrap();
        let mut interrupted = Vec::new();
        for (key, status) in updates.iter_mut() {
            if *status == BubbleStatus::Pending {
                *status = BubbleStatus::Init;
            }
            if *status != BubbleStatus::Init {
                continue;
            }
            let path = if key.is_empty() {
                VaultPath::root()
            } else {
                match VaultPath::new(key) {
                    Ok(path) => path,
                    Err(e) => {
                        warn!(key = %key, error = %e, "dropping invalid coordinator entry");
                        continue;
                    }
                }
            };
            interrupted.push(path);
        }
        interrupted
    }

    /// Whether no aggregation is pending or running anywhere.
    pub fn is_quiescent(&self) -> bool {
        self.updates.lock().unwrap().is_empty()
    }

    fn save(&self, updates: &HashMap<String, BubbleStatus>) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(updates)
            .map_err(|e| HavenError::State(format!("serialize coordinator state: {e}")))?;
        let tmp = self.state_path.with_extension("json.tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &self.state_path)?;
        Ok(())
    }
}
