use std::time::Duration;

use chrono::Utc;

use haven_types::error::HavenError;
use haven_types::path::VaultPath;

use crate::config::{DEFAULT_DIR_HEALTH, REMOTE_REPAIR_THRESHOLD};
use crate::metadata::DirectoryMetadata;
use crate::testutil::{FileFixture, ProbeGate, TestVault};

fn root() -> VaultPath {
    VaultPath::root()
}

#[test]
fn bubble_updates_directory_and_propagates_to_root() {
    let vault = TestVault::new();
    let (engine, _signals) = vault.engine();
    let a = vault.add_dir("a");
    vault.add_file("a/x", FileFixture::healthy().with_health(0.4).with_size(100));

    engine.bubble(&a).unwrap();
    engine.wait_idle();

    let a_meta = vault.dirs.metadata(&a).unwrap();
    assert_eq!(a_meta.health, 0.4);
    assert_eq!(a_meta.aggregate_health, 0.4);
    assert_eq!(a_meta.num_files, 1);

    let root_meta = vault.dirs.metadata(&root()).unwrap();
    assert_eq!(root_meta.health, DEFAULT_DIR_HEALTH);
    assert!(root_meta.aggregate_health >= 0.4);
    assert_eq!(root_meta.num_sub_dirs, 1);
    assert_eq!(root_meta.aggregate_num_files, 1);
    assert_eq!(root_meta.aggregate_size, 100);
    assert!(engine.coordinator.is_quiescent());
}

#[test]
fn nested_bubbles_reach_fixpoint() {
    let vault = TestVault::new();
    let (engine, _signals) = vault.engine();
    let a = vault.add_dir("a");
    let b = vault.add_dir("a/b");
    vault.add_file("a/b/x", FileFixture::healthy().with_health(0.4));

    engine.bubble(&b).unwrap();
    engine.wait_idle();
    engine.bubble(&a).unwrap();
    engine.wait_idle();

    let a_meta = vault.dirs.metadata(&a).unwrap();
    assert!(a_meta.aggregate_health >= 0.4);
    assert_eq!(a_meta.health, DEFAULT_DIR_HEALTH);
    assert_eq!(a_meta.num_sub_dirs, 1);

    // Monotone upward: every ancestor's aggregate covers the child's.
    let b_meta = vault.dirs.metadata(&b).unwrap();
    let root_meta = vault.dirs.metadata(&root()).unwrap();
    assert!(a_meta.aggregate_health >= b_meta.aggregate_health);
    assert!(root_meta.aggregate_health >= a_meta.aggregate_health);
    assert!(a_meta.last_health_check_time <= b_meta.last_health_check_time);
}

#[test]
fn overlapping_bubbles_coalesce_into_one_rerun() {
    let vault = TestVault::new();
    let (engine, _signals) = vault.engine();
    vault.add_file("x", FileFixture::healthy());

    let (started_tx, started_rx) = crossbeam_channel::unbounded();
    let (release_tx, release_rx) = crossbeam_channel::unbounded();
    vault.files.set_probe_gate(ProbeGate {
        started: started_tx,
        release: release_rx,
    });

    engine.spawn_bubble(root());
    started_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("first calculation never started");

    // Five more requests while the first calculation is held in flight.
    for _ in 0..5 {
        engine.bubble(&root()).unwrap();
    }

    release_tx.send(()).unwrap();
    vault.files.clear_probe_gate();
    drop(release_tx);
    engine.wait_idle();

    // Exactly two calculations ran: the original and one coalesced re-run.
    assert_eq!(vault.files.open_count(), 2);
    assert!(engine.coordinator.is_quiescent());
}

#[test]
fn repair_signal_fires_at_threshold_and_coalesces() {
    let vault = TestVault::new();
    let (engine, signals) = vault.engine();
    vault.add_file(
        "x",
        FileFixture::healthy().with_health(REMOTE_REPAIR_THRESHOLD),
    );

    engine.bubble(&root()).unwrap();
    engine.bubble(&root()).unwrap();
    engine.wait_idle();

    assert!(signals.repair_needed.try_recv().is_ok());
    assert!(signals.repair_needed.try_recv().is_err());
    assert!(signals.stuck_chunk_found.try_recv().is_err());
}

#[test]
fn healthy_root_fires_no_signals() {
    let vault = TestVault::new();
    let (engine, signals) = vault.engine();
    vault.add_file("x", FileFixture::healthy().with_health(0.1));

    engine.bubble(&root()).unwrap();
    engine.wait_idle();

    assert!(signals.repair_needed.try_recv().is_err());
    assert!(signals.stuck_chunk_found.try_recv().is_err());
}

#[test]
fn propagated_root_bubble_fires_signals() {
    let vault = TestVault::new();
    let (engine, signals) = vault.engine();
    let a = vault.add_dir("a");
    vault.add_file("a/x", FileFixture::healthy().with_health(0.9).with_stuck(2, 0.9));

    // Bubbling a subdirectory is enough: the propagation reaches the root,
    // and the root pass is the one that signals.
    engine.bubble(&a).unwrap();
    engine.wait_idle();

    assert!(signals.repair_needed.try_recv().is_ok());
    assert!(signals.stuck_chunk_found.try_recv().is_ok());
}

#[test]
fn stuck_chunk_signal_clears_after_heal() {
    let vault = TestVault::new();
    let (engine, signals) = vault.engine();
    let x = vault.add_file("x", FileFixture::healthy().with_stuck(3, 0.1));

    engine.bubble(&root()).unwrap();
    engine.wait_idle();
    assert!(signals.stuck_chunk_found.try_recv().is_ok());
    assert_eq!(vault.dirs.metadata(&root()).unwrap().num_stuck_chunks, 3);

    // The repair loop healed the chunks; the next bubble sees zero stuck.
    vault.files.update(&x, |f| {
        f.num_stuck_chunks = 0;
        f.stuck_health = 0.0;
    });
    engine.bubble(&root()).unwrap();
    engine.wait_idle();

    assert_eq!(vault.dirs.metadata(&root()).unwrap().num_stuck_chunks, 0);
    assert!(signals.stuck_chunk_found.try_recv().is_err());
}

#[test]
fn failed_bubble_still_completes_and_propagates() {
    let vault = TestVault::new();
    let (engine, _signals) = vault.engine();
    let before = vault.dirs.metadata(&root()).unwrap();
    let ghost = VaultPath::new("ghost").unwrap();

    assert!(engine.bubble(&ghost).is_err());
    engine.wait_idle();

    // Completion ran despite the error and the parent was still bubbled.
    assert!(engine.coordinator.is_quiescent());
    let root_meta = vault.dirs.metadata(&root()).unwrap();
    assert!(root_meta.mod_time >= before.mod_time);
    assert_eq!(root_meta.num_sub_dirs, 0);
}

#[test]
fn subdirectory_deletion_aborts_but_completes() {
    let vault = TestVault::new();
    let (engine, _signals) = vault.engine();
    let a = vault.add_dir("a");
    let before = vault.dirs.metadata(&a).unwrap();
    vault.add_bare_dir("a/gone");

    let err = engine.bubble(&a).unwrap_err();
    assert!(matches!(err.root_cause(), HavenError::DirNotFound(_)));
    engine.wait_idle();

    // The stale value was not overwritten with a partial calculation.
    assert_eq!(vault.dirs.metadata(&a).unwrap(), before);
    assert!(engine.coordinator.is_quiescent());
}

#[test]
fn calculation_failure_signals_from_last_known_metadata() {
    let vault = TestVault::new();
    let (engine, signals) = vault.engine();
    let mut stored = DirectoryMetadata::fresh(Utc::now());
    stored.aggregate_health = 0.9;
    stored.num_stuck_chunks = 1;
    vault.dirs.insert(&root(), stored);
    // Destroy the backing tree so enumeration fails outright.
    std::fs::remove_dir_all(vault.files_dir.path()).unwrap();

    assert!(engine.bubble(&root()).is_err());
    engine.wait_idle();

    assert!(signals.repair_needed.try_recv().is_ok());
    assert!(signals.stuck_chunk_found.try_recv().is_ok());
    assert!(engine.coordinator.is_quiescent());
}

#[test]
fn stopped_engine_refuses_bubbles() {
    let vault = TestVault::new();
    let (engine, _signals) = vault.engine();
    engine.stop();

    assert!(matches!(
        engine.bubble(&root()),
        Err(HavenError::ShuttingDown)
    ));
    engine.spawn_bubble(root());
    engine.wait_idle();
    assert!(engine.coordinator.is_quiescent());
}

#[test]
fn interrupted_aggregations_resume_after_restart() {
    let vault = TestVault::new();
    let a = vault.add_dir("a");
    vault.add_file("a/x", FileFixture::healthy().with_health(0.6));
    {
        let (engine, _signals) = vault.engine();
        // Claim "a" and queue an overlap, then force a persist without the
        // claim ever completing: the shape a crash leaves behind.
        assert!(engine.coordinator.needed(&a).unwrap());
        assert!(!engine.coordinator.needed(&a).unwrap());
        let scratch = VaultPath::new("scratch").unwrap();
        assert!(engine.coordinator.needed(&scratch).unwrap());
        engine.coordinator.complete(&scratch).unwrap();
    }

    let (engine, _signals) = vault.engine();
    engine.resume_interrupted();
    engine.wait_idle();

    assert!(engine.coordinator.is_quiescent());
    assert_eq!(vault.dirs.metadata(&a).unwrap().health, 0.6);
    assert!(vault.dirs.metadata(&root()).unwrap().aggregate_health >= 0.6);
}
