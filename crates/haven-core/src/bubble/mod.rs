pub mod coordinator;
pub mod signal;

pub(crate) mod calculate;
pub(crate) mod probe;

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use tracing::{debug, warn};

use haven_types::error::{HavenError, Result};
use haven_types::path::VaultPath;

use crate::config::{EngineConfig, REMOTE_REPAIR_THRESHOLD};
use crate::host::HostCatalog;
use crate::lifecycle::ThreadGroup;
use crate::metadata::DirectoryMetadata;
use crate::store::{DirStore, FileStore};

use coordinator::{BubbleCoordinator, CompleteAction};
use signal::{RepairSignals, SignalReceivers};

/// The directory metadata aggregation engine.
///
/// Holds the collaborator stores, the request coordinator, the repair
/// signal senders, and the lifecycle group: all process-wide state, passed
/// explicitly rather than living in globals. Cheap to share behind `Arc`;
/// every bubble task runs against the same engine value.
pub struct BubbleEngine {
    pub(crate) files_dir: PathBuf,
    pub(crate) files: Arc<dyn FileStore>,
    pub(crate) dirs: Arc<dyn DirStore>,
    pub(crate) hosts: Arc<dyn HostCatalog>,
    pub(crate) coordinator: BubbleCoordinator,
    pub(crate) group: Arc<ThreadGroup>,
    signals: RepairSignals,
}

impl BubbleEngine {
    /// Build the engine, loading persisted coordinator state and making
    /// sure the backing tree and its root record exist.
    ///
    /// Returns the signal receivers for the repair subsystem.
    pub fn new(
        config: &EngineConfig,
        files: Arc<dyn FileStore>,
        dirs: Arc<dyn DirStore>,
        hosts: Arc<dyn HostCatalog>,
    ) -> Result<(Arc<Self>, SignalReceivers)> {
        std::fs::create_dir_all(&config.files_dir)?;
        std::fs::create_dir_all(&config.state_dir)?;
        let coordinator = BubbleCoordinator::load(&config.state_dir)?;

        match dirs.open(&VaultPath::root()) {
            Ok(_) => {}
            Err(HavenError::DirNotFound(_)) => {
                dirs.create(&VaultPath::root())?;
            }
            Err(e) => return Err(e),
        }

        let (signals, receivers) = RepairSignals::new();
        let engine = Arc::new(BubbleEngine {
            files_dir: config.files_dir.clone(),
            files,
            dirs,
            hosts,
            coordinator,
            group: Arc::new(ThreadGroup::new()),
            signals,
        });
        Ok((engine, receivers))
    }

    /// Fire-and-forget bubble: register with the lifecycle group and run
    /// [`bubble`](Self::bubble) on a fresh task. Silently refuses once the
    /// engine is shutting down; errors are logged, not surfaced.
    pub fn spawn_bubble(self: &Arc<Self>, path: VaultPath) {
        let Ok(guard) = self.group.add() else {
            return;
        };
        let engine = Arc::clone(self);
        thread::spawn(move || {
            let _guard = guard;
            if let Err(e) = engine.bubble(&path) {
                debug!(path = %path, error = %e, "error while bubbling metadata");
            }
        });
    }

    /// Recompute and persist `path`'s metadata, then propagate to its
    /// parent on a fresh task so the caller only blocks for this directory.
    ///
    /// The coordinator decides whether this invocation runs at all. Once
    /// admitted, completion (finishing the coordinator entry, scheduling
    /// the coalesced re-run, and scheduling the parent) happens exactly
    /// once, whether or not the directory update itself failed.
    pub fn bubble(self: &Arc<Self>, path: &VaultPath) -> Result<()> {
        // Admission: refuse to start once shutdown has begun, and block
        // shutdown until this invocation exits.
        let _guard = self.group.add()?;

        let needed = self
            .coordinator
            .needed(path)
            .map_err(|e| e.context("error in checking if bubble is needed"))?;
        if !needed {
            return Ok(());
        }

        let result = self.update_directory_metadata(path);

        let completion = self.finish_bubble(path);
        result.and(completion)
    }

    fn finish_bubble(self: &Arc<Self>, path: &VaultPath) -> Result<()> {
        match self
            .coordinator
            .complete(path)
            .map_err(|e| e.context("error in completing bubble"))?
        {
            CompleteAction::Rerun => self.spawn_bubble(path.clone()),
            CompleteAction::Noop => {}
        }
        if !path.is_root() {
            self.spawn_bubble(path.parent()?);
        }
        Ok(())
    }

    /// Run the calculator and write the result through the directory store.
    /// Errors are retained rather than short-circuiting, so the root signal
    /// fan-out still happens on the best metadata available: the freshly
    /// computed value, or the last-persisted one when calculation failed.
    fn update_directory_metadata(&self, path: &VaultPath) -> Result<()> {
        let mut retained: Option<HavenError> = None;

        let computed = match calculate::calculate_directory_metadata(self, path) {
            Ok(metadata) => Some(metadata),
            Err(e) => {
                let e = e.context(format!(
                    "could not calculate the metadata of directory '{path}'"
                ));
                retain(&mut retained, e);
                None
            }
        };

        let signal_metadata: Option<DirectoryMetadata> = match self.dirs.open(path) {
            Ok(handle) => {
                if let Some(metadata) = &computed {
                    if let Err(e) = handle.update_metadata(metadata.clone()) {
                        retain(
                            &mut retained,
                            e.context(format!(
                                "could not update the metadata of directory '{path}'"
                            )),
                        );
                    }
                }
                Some(match computed {
                    Some(metadata) => metadata,
                    None => handle.metadata(),
                })
            }
            Err(e) => {
                retain(
                    &mut retained,
                    e.context(format!("could not open directory '{path}'")),
                );
                computed
            }
        };

        // The repair loops start at the root, so fan-out is pointless until
        // the root itself has been updated.
        if path.is_root() {
            if let Some(metadata) = &signal_metadata {
                if metadata.aggregate_health >= REMOTE_REPAIR_THRESHOLD {
                    self.signals.notify_repair_needed();
                }
                if metadata.num_stuck_chunks > 0 {
                    self.signals.notify_stuck_chunk_found();
                }
            }
        }

        match retained {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Resume aggregations interrupted by the previous shutdown.
    pub fn resume_interrupted(self: &Arc<Self>) {
        for path in self.coordinator.take_interrupted() {
            self.spawn_bubble(path);
        }
    }

    /// Block until every in-flight bubble (and the tasks it spawned) has
    /// finished.
    pub fn wait_idle(&self) {
        self.group.wait_idle();
    }

    /// Whether no aggregation is pending or running anywhere in the tree.
    pub fn is_quiescent(&self) -> bool {
        self.coordinator.is_quiescent()
    }

    /// Stop admitting new bubbles and wait for in-flight ones to finish.
    /// Their deferred completions run, so no coordinator entry is leaked
    /// mid-claim.
    pub fn stop(&self) {
        self.group.stop();
    }
}

fn retain(slot: &mut Option<HavenError>, err: HavenError) {
    match slot {
        None => *slot = Some(err),
        Some(first) => {
            warn!(error = %err, first = %first, "dropping secondary bubble error");
        }
    }
}
