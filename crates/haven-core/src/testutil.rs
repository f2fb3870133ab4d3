use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender};
use tempfile::TempDir;

use haven_types::error::{HavenError, Result};
use haven_types::path::VaultPath;

use crate::bubble::signal::SignalReceivers;
use crate::bubble::BubbleEngine;
use crate::config::EngineConfig;
use crate::host::{HostCatalog, HostMap, HostUtilities};
use crate::metadata::{CachedHealthMetadata, DirectoryMetadata};
use crate::store::{DirEntry, DirStore, FileEntry, FileHealth, FileStore};

/// Health state served by one in-memory file record.
#[derive(Debug, Clone)]
pub struct FileFixture {
    pub health: f64,
    pub stuck_health: f64,
    pub redundancy: f64,
    pub num_stuck_chunks: u64,
    pub size: u64,
    pub mod_time: DateTime<Utc>,
    pub last_health_check_time: DateTime<Utc>,
    pub local_path: PathBuf,
}

impl FileFixture {
    pub fn healthy() -> Self {
        let now = Utc::now();
        FileFixture {
            health: 0.0,
            stuck_health: 0.0,
            redundancy: 3.0,
            num_stuck_chunks: 0,
            size: 4096,
            mod_time: now,
            last_health_check_time: now,
            local_path: PathBuf::from("/tmp/haven-test-source-that-exists-not"),
        }
    }

    pub fn with_health(mut self, health: f64) -> Self {
        self.health = health;
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    pub fn with_stuck(mut self, num_stuck_chunks: u64, stuck_health: f64) -> Self {
        self.num_stuck_chunks = num_stuck_chunks;
        self.stuck_health = stuck_health;
        self
    }

    pub fn with_redundancy(mut self, redundancy: f64) -> Self {
        self.redundancy = redundancy;
        self
    }

    pub fn with_times(mut self, mod_time: DateTime<Utc>, last_check: DateTime<Utc>) -> Self {
        self.mod_time = mod_time;
        self.last_health_check_time = last_check;
        self
    }
}

/// Blocks file opens until released, so tests can hold a calculation
/// in flight. Cloned out of the store lock before use.
#[derive(Clone)]
pub struct ProbeGate {
    pub started: Sender<()>,
    pub release: Receiver<()>,
}

#[derive(Debug)]
struct FileState {
    fixture: Mutex<FileFixture>,
    cached: Mutex<CachedHealthMetadata>,
}

/// In-memory [`FileStore`] serving configurable fixtures. Thread-safe via
/// Mutex; opens are counted so tests can assert how many probes ran.
#[derive(Default)]
pub struct MemoryFileStore {
    records: Mutex<HashMap<String, Arc<FileState>>>,
    opens: AtomicUsize,
    probe_gate: Mutex<Option<ProbeGate>>,
    fail_unstuck: AtomicBool,
    fail_cache_update: AtomicBool,
}

impl MemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: &VaultPath, fixture: FileFixture) {
        let mut records = self.records.lock().unwrap();
        records.insert(
            path.as_str().to_string(),
            Arc::new(FileState {
                fixture: Mutex::new(fixture),
                cached: Mutex::new(CachedHealthMetadata::default()),
            }),
        );
    }

    /// Mutate an existing fixture in place, e.g. to heal a file between
    /// bubbles.
    pub fn update(&self, path: &VaultPath, f: impl FnOnce(&mut FileFixture)) {
        let records = self.records.lock().unwrap();
        let state = records.get(path.as_str()).expect("fixture not found");
        f(&mut state.fixture.lock().unwrap());
    }

    pub fn cached(&self, path: &VaultPath) -> Option<CachedHealthMetadata> {
        let records = self.records.lock().unwrap();
        records
            .get(path.as_str())
            .map(|state| *state.cached.lock().unwrap())
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn set_probe_gate(&self, gate: ProbeGate) {
        *self.probe_gate.lock().unwrap() = Some(gate);
    }

    pub fn clear_probe_gate(&self) {
        *self.probe_gate.lock().unwrap() = None;
    }

    pub fn fail_unstuck(&self, fail: bool) {
        self.fail_unstuck.store(fail, Ordering::SeqCst);
    }

    pub fn fail_cache_update(&self, fail: bool) {
        self.fail_cache_update.store(fail, Ordering::SeqCst);
    }
}

impl FileStore for MemoryFileStore {
    fn open(&self, path: &VaultPath) -> Result<Box<dyn FileEntry>> {
        let gate = self.probe_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            let _ = gate.started.send(());
            let _ = gate.release.recv();
        }

        let records = self.records.lock().unwrap();
        let state = records
            .get(path.as_str())
            .cloned()
            .ok_or_else(|| HavenError::FileNotFound(path.to_string()))?;
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryFileEntry {
            state,
            fail_unstuck: self.fail_unstuck.load(Ordering::SeqCst),
            fail_cache_update: self.fail_cache_update.load(Ordering::SeqCst),
        }))
    }
}

#[derive(Debug)]
struct MemoryFileEntry {
    state: Arc<FileState>,
    fail_unstuck: bool,
    fail_cache_update: bool,
}

impl FileEntry for MemoryFileEntry {
    fn mark_all_healthy_chunks_as_unstuck(
        &self,
        _offline: &HostMap,
        _good_for_renew: &HostMap,
    ) -> Result<()> {
        if self.fail_unstuck {
            return Err(HavenError::Other("record write failed".into()));
        }
        Ok(())
    }

    fn health(&self, _offline: &HostMap, _good_for_renew: &HostMap) -> FileHealth {
        let fixture = self.state.fixture.lock().unwrap();
        FileHealth {
            health: fixture.health,
            stuck_health: fixture.stuck_health,
            num_stuck_chunks: fixture.num_stuck_chunks,
        }
    }

    fn redundancy(&self, _offline: &HostMap, _good_for_renew: &HostMap) -> f64 {
        self.state.fixture.lock().unwrap().redundancy
    }

    fn local_path(&self) -> PathBuf {
        self.state.fixture.lock().unwrap().local_path.clone()
    }

    fn last_health_check_time(&self) -> DateTime<Utc> {
        self.state.fixture.lock().unwrap().last_health_check_time
    }

    fn update_last_health_check_time(&self) -> Result<()> {
        self.state.fixture.lock().unwrap().last_health_check_time = Utc::now();
        Ok(())
    }

    fn mod_time(&self) -> DateTime<Utc> {
        self.state.fixture.lock().unwrap().mod_time
    }

    fn size(&self) -> u64 {
        self.state.fixture.lock().unwrap().size
    }

    fn update_cached_health_metadata(&self, metadata: CachedHealthMetadata) -> Result<()> {
        if self.fail_cache_update {
            return Err(HavenError::Other("record write failed".into()));
        }
        *self.state.cached.lock().unwrap() = metadata;
        Ok(())
    }
}

/// In-memory [`DirStore`].
#[derive(Default)]
pub struct MemoryDirStore {
    records: Mutex<HashMap<String, Arc<Mutex<DirectoryMetadata>>>>,
}

impl MemoryDirStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last-persisted metadata for `path`, if a record exists.
    pub fn metadata(&self, path: &VaultPath) -> Option<DirectoryMetadata> {
        let records = self.records.lock().unwrap();
        records.get(path.as_str()).map(|r| r.lock().unwrap().clone())
    }

    pub fn insert(&self, path: &VaultPath, metadata: DirectoryMetadata) {
        let mut records = self.records.lock().unwrap();
        records.insert(path.as_str().to_string(), Arc::new(Mutex::new(metadata)));
    }

    pub fn contains(&self, path: &VaultPath) -> bool {
        self.records.lock().unwrap().contains_key(path.as_str())
    }
}

impl DirStore for MemoryDirStore {
    fn open(&self, path: &VaultPath) -> Result<Box<dyn DirEntry>> {
        let records = self.records.lock().unwrap();
        let record = records
            .get(path.as_str())
            .cloned()
            .ok_or_else(|| HavenError::DirNotFound(path.to_string()))?;
        Ok(Box::new(MemoryDirEntry { record }))
    }

    fn create(&self, path: &VaultPath) -> Result<Box<dyn DirEntry>> {
        let mut records = self.records.lock().unwrap();
        let record = records
            .entry(path.as_str().to_string())
            .or_insert_with(|| Arc::new(Mutex::new(DirectoryMetadata::fresh(Utc::now()))))
            .clone();
        Ok(Box::new(MemoryDirEntry { record }))
    }
}

#[derive(Debug)]
struct MemoryDirEntry {
    record: Arc<Mutex<DirectoryMetadata>>,
}

impl DirEntry for MemoryDirEntry {
    fn metadata(&self) -> DirectoryMetadata {
        self.record.lock().unwrap().clone()
    }

    fn update_metadata(&self, metadata: DirectoryMetadata) -> Result<()> {
        *self.record.lock().unwrap() = metadata;
        Ok(())
    }
}

/// Host catalog returning a fixed view.
#[derive(Default)]
pub struct StaticHostCatalog {
    utilities: Mutex<HostUtilities>,
}

impl StaticHostCatalog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HostCatalog for StaticHostCatalog {
    fn contracts_and_utilities(&self, _entries: &[&dyn FileEntry]) -> HostUtilities {
        self.utilities.lock().unwrap().clone()
    }
}

/// A vault tree on a temp filesystem with in-memory stores: backing
/// directories and `.haven` marker files on disk, fixture records in
/// memory.
pub struct TestVault {
    pub files_dir: TempDir,
    pub state_dir: TempDir,
    pub files: Arc<MemoryFileStore>,
    pub dirs: Arc<MemoryDirStore>,
    pub hosts: Arc<StaticHostCatalog>,
}

impl TestVault {
    pub fn new() -> Self {
        TestVault {
            files_dir: tempfile::tempdir().unwrap(),
            state_dir: tempfile::tempdir().unwrap(),
            files: Arc::new(MemoryFileStore::new()),
            dirs: Arc::new(MemoryDirStore::new()),
            hosts: Arc::new(StaticHostCatalog::new()),
        }
    }

    pub fn config(&self) -> EngineConfig {
        EngineConfig {
            files_dir: self.files_dir.path().to_path_buf(),
            state_dir: self.state_dir.path().to_path_buf(),
        }
    }

    pub fn engine(&self) -> (Arc<BubbleEngine>, SignalReceivers) {
        let files: Arc<dyn FileStore> = self.files.clone();
        let dirs: Arc<dyn DirStore> = self.dirs.clone();
        let hosts: Arc<dyn HostCatalog> = self.hosts.clone();
        BubbleEngine::new(&self.config(), files, dirs, hosts).unwrap()
    }

    /// Create a directory with a backing dir and a fresh record.
    pub fn add_dir(&self, raw: &str) -> VaultPath {
        let path = VaultPath::new(raw).unwrap();
        fs::create_dir_all(path.dir_sys_path(self.files_dir.path())).unwrap();
        self.dirs.create(&path).unwrap();
        path
    }

    /// Create only the backing directory, with no record: the shape a
    /// deleted directory leaves behind.
    pub fn add_bare_dir(&self, raw: &str) -> VaultPath {
        let path = VaultPath::new(raw).unwrap();
        fs::create_dir_all(path.dir_sys_path(self.files_dir.path())).unwrap();
        path
    }

    /// Create a file: a `.haven` marker on disk plus an in-memory fixture.
    pub fn add_file(&self, raw: &str, fixture: FileFixture) -> VaultPath {
        let path = VaultPath::new(raw).unwrap();
        let sys_path = path.file_sys_path(self.files_dir.path());
        if let Some(parent) = sys_path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&sys_path, b"").unwrap();
        self.files.insert(&path, fixture);
        path
    }

    /// Create only the `.haven` marker, with no fixture behind it, so
    /// probing it will fail.
    pub fn add_broken_file(&self, raw: &str) -> VaultPath {
        let path = VaultPath::new(raw).unwrap();
        let sys_path = path.file_sys_path(self.files_dir.path());
        if let Some(parent) = sys_path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&sys_path, b"").unwrap();
        path
    }
}
