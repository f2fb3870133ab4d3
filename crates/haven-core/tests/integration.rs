use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use haven_core::bubble::signal::SignalReceivers;
use haven_core::bubble::BubbleEngine;
use haven_core::config::{EngineConfig, COORDINATOR_STATE_FILENAME};
use haven_core::host::{HostUtility, UtilityTable};
use haven_core::metadata::DirectoryMetadata;
use haven_core::store::dir_record::VaultDirStore;
use haven_core::store::file_record::{FileRecord, PieceSet, VaultFileStore};
use haven_core::store::DirStore;
use haven_types::host_id::HostId;
use haven_types::path::{VaultPath, DIR_METADATA_FILENAME};

fn host(b: u8) -> HostId {
    HostId([b; 32])
}

/// Filesystem-backed stores over a temp tree, with four usable hosts.
struct Harness {
    files_dir: tempfile::TempDir,
    state_dir: tempfile::TempDir,
    files: Arc<VaultFileStore>,
    dirs: Arc<VaultDirStore>,
    hosts: Arc<UtilityTable>,
}

impl Harness {
    fn new() -> Self {
        let files_dir = tempfile::tempdir().unwrap();
        let state_dir = tempfile::tempdir().unwrap();
        let files = Arc::new(VaultFileStore::new(files_dir.path()));
        let dirs = Arc::new(VaultDirStore::new(files_dir.path()));
        let hosts = Arc::new(UtilityTable::new());
        for b in 1..=4 {
            hosts.set_utility(
                host(b),
                HostUtility {
                    offline: false,
                    good_for_renew: true,
                },
            );
        }
        Harness {
            files_dir,
            state_dir,
            files,
            dirs,
            hosts,
        }
    }

    fn engine(&self) -> (Arc<BubbleEngine>, SignalReceivers) {
        let config = EngineConfig {
            files_dir: self.files_dir.path().to_path_buf(),
            state_dir: self.state_dir.path().to_path_buf(),
        };
        BubbleEngine::new(
            &config,
            self.files.clone(),
            self.dirs.clone(),
            self.hosts.clone(),
        )
        .unwrap()
    }

    fn add_dir(&self, raw: &str) -> VaultPath {
        let path = VaultPath::new(raw).unwrap();
        self.dirs.create(&path).unwrap();
        path
    }

    /// Track a 2-of-4 erasure-coded file with one chunk and one distinct
    /// host per piece.
    fn add_file(&self, raw: &str, stuck: bool) -> VaultPath {
        let path = VaultPath::new(raw).unwrap();
        let mut record = FileRecord::new(PathBuf::from("/src").join(raw), 4096, 2, 2, 1);
        record.chunks[0].stuck = stuck;
        record.chunks[0].pieces = (1..=4)
            .map(|b| PieceSet {
                hosts: vec![host(b)],
            })
            .collect();
        self.files.create(&path, record).unwrap();
        path
    }

    fn dir_metadata(&self, path: &VaultPath) -> DirectoryMetadata {
        self.dirs.open(path).unwrap().metadata()
    }

    fn raw_file_record(&self, path: &VaultPath) -> FileRecord {
        let bytes = fs::read(path.file_sys_path(self.files_dir.path())).unwrap();
        rmp_serde::from_slice(&bytes).unwrap()
    }
}

#[test]
fn full_tree_bubble_persists_aggregates() {
    let harness = Harness::new();
    let (engine, _signals) = harness.engine();

    let docs = harness.add_dir("docs");
    let arch = harness.add_dir("docs/arch");
    harness.add_file("readme", false);
    harness.add_file("docs/report", false);
    harness.add_file("docs/arch/old", false);

    engine.bubble(&arch).unwrap();
    engine.wait_idle();

    let arch_meta = harness.dir_metadata(&arch);
    assert_eq!(arch_meta.num_files, 1);
    assert_eq!(arch_meta.health, 0.0);
    assert_eq!(arch_meta.min_redundancy, 2.0);

    let docs_meta = harness.dir_metadata(&docs);
    assert_eq!(docs_meta.num_files, 1);
    assert_eq!(docs_meta.num_sub_dirs, 1);
    assert_eq!(docs_meta.aggregate_num_files, 2);
    assert_eq!(docs_meta.aggregate_size, 2 * 4096);

    let root_meta = harness.dir_metadata(&VaultPath::root());
    assert_eq!(root_meta.num_files, 1);
    assert_eq!(root_meta.num_sub_dirs, 1);
    assert_eq!(root_meta.aggregate_num_files, 3);
    assert_eq!(root_meta.aggregate_size, 3 * 4096);
    assert_eq!(root_meta.aggregate_health, 0.0);
    assert!(engine.is_quiescent());
}

#[test]
fn offline_host_degrades_health_after_rebubble() {
    let harness = Harness::new();
    let (engine, signals) = harness.engine();
    let x = harness.add_file("x", false);

    engine.bubble(&VaultPath::root()).unwrap();
    engine.wait_idle();
    assert_eq!(harness.dir_metadata(&VaultPath::root()).aggregate_health, 0.0);
    assert!(signals.repair_needed.try_recv().is_err());

    // One host drops off the network: one piece of the chunk is lost.
    harness.hosts.set_utility(
        host(1),
        HostUtility {
            offline: true,
            good_for_renew: false,
        },
    );
    engine.bubble(&VaultPath::root()).unwrap();
    engine.wait_idle();

    let root_meta = harness.dir_metadata(&VaultPath::root());
    assert_eq!(root_meta.aggregate_health, 0.5);
    assert_eq!(root_meta.min_redundancy, 1.5);
    assert!(signals.repair_needed.try_recv().is_ok());

    // The refreshed cache reached the file record on disk.
    let record = harness.raw_file_record(&x);
    assert_eq!(record.cached_health.health, 0.5);
    assert_eq!(record.cached_health.redundancy, 1.5);
}

#[test]
fn sweep_unstucks_chunks_that_became_healthy() {
    let harness = Harness::new();
    let (engine, signals) = harness.engine();
    let x = harness.add_file("x", true);

    engine.bubble(&VaultPath::root()).unwrap();
    engine.wait_idle();

    // All pieces are reachable, so the probe's sweep cleared the stuck bit
    // before health was computed; no stuck chunks were ever reported.
    assert!(!harness.raw_file_record(&x).chunks[0].stuck);
    assert_eq!(harness.dir_metadata(&VaultPath::root()).num_stuck_chunks, 0);
    assert!(signals.stuck_chunk_found.try_recv().is_err());
}

#[test]
fn stuck_chunk_on_degraded_file_fires_signal() {
    let harness = Harness::new();
    let (engine, signals) = harness.engine();
    let x = harness.add_file("x", true);
    harness.hosts.set_utility(
        host(1),
        HostUtility {
            offline: true,
            good_for_renew: false,
        },
    );

    engine.bubble(&VaultPath::root()).unwrap();
    engine.wait_idle();

    // The chunk is not healthy, so it stays stuck and the signal fires.
    assert!(harness.raw_file_record(&x).chunks[0].stuck);
    assert_eq!(harness.dir_metadata(&VaultPath::root()).num_stuck_chunks, 1);
    assert!(signals.stuck_chunk_found.try_recv().is_ok());
}

#[test]
fn interrupted_state_resumes_after_restart() {
    let harness = Harness::new();
    let docs = harness.add_dir("docs");
    harness.add_file("docs/report", false);

    // State left behind by a crash mid-aggregation.
    fs::write(
        harness.state_dir.path().join(COORDINATOR_STATE_FILENAME),
        br#"{"docs":"active"}"#,
    )
    .unwrap();

    let (engine, _signals) = harness.engine();
    engine.resume_interrupted();
    engine.wait_idle();

    assert!(engine.is_quiescent());
    let docs_meta = harness.dir_metadata(&docs);
    assert_eq!(docs_meta.num_files, 1);
    let root_meta = harness.dir_metadata(&VaultPath::root());
    assert_eq!(root_meta.aggregate_num_files, 1);
}

#[test]
fn empty_directory_without_record_is_presumed_deleted() {
    let harness = Harness::new();
    let (engine, _signals) = harness.engine();
    let a = harness.add_dir("a");
    let before = harness.dir_metadata(&a);
    let empty_sys = harness.files_dir.path().join("a/empty");
    fs::create_dir_all(&empty_sys).unwrap();

    assert!(engine.bubble(&a).is_err());
    engine.wait_idle();

    // No record was materialized for the deleted directory, and the stale
    // parent metadata was left alone.
    assert!(!empty_sys.join(DIR_METADATA_FILENAME).exists());
    assert_eq!(harness.dir_metadata(&a), before);
    assert!(engine.is_quiescent());
}

#[test]
fn records_survive_reopening_the_stores() {
    let harness = Harness::new();
    let (engine, _signals) = harness.engine();
    harness.add_dir("docs");
    harness.add_file("docs/report", false);
    engine.bubble(&VaultPath::new("docs").unwrap()).unwrap();
    engine.wait_idle();

    // Fresh store instances over the same tree read the same state.
    let dirs = VaultDirStore::new(harness.files_dir.path());
    let reopened = dirs
        .open(&VaultPath::new("docs").unwrap())
        .unwrap()
        .metadata();
    assert_eq!(reopened, harness.dir_metadata(&VaultPath::new("docs").unwrap()));
    assert_eq!(reopened.num_files, 1);
}
