use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use haven_types::error::{HavenError, Result};
use haven_types::host_id::HostId;
use haven_types::path::VaultPath;

use crate::host::HostMap;
use crate::metadata::CachedHealthMetadata;
use crate::store::{FileEntry, FileHealth, FileStore};

/// Hosts holding replicas of one erasure-coded piece.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PieceSet {
    pub hosts: Vec<HostId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    /// Set when the repair subsystem has given up on this chunk under
    /// current host conditions.
    pub stuck: bool,
    pub pieces: Vec<PieceSet>,
}

/// Persisted record of one managed file, stored as MessagePack at
/// `<path>.haven` under the backing tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    /// Where the original file lives on the local filesystem.
    pub local_path: PathBuf,
    pub size: u64,
    pub mod_time: DateTime<Utc>,
    pub last_health_check_time: DateTime<Utc>,
    pub data_pieces: u32,
    pub parity_pieces: u32,
    pub chunks: Vec<ChunkRecord>,
    pub cached_health: CachedHealthMetadata,
}

fn host_usable(host: &HostId, offline: &HostMap, good_for_renew: &HostMap) -> bool {
    let online = !offline.get(host).copied().unwrap_or(true);
    online && good_for_renew.get(host).copied().unwrap_or(false)
}

fn host_online(host: &HostId, offline: &HostMap) -> bool {
    !offline.get(host).copied().unwrap_or(true)
}

impl FileRecord {
    /// A record for a freshly tracked file: `num_chunks` unstuck chunks with
    /// no pieces uploaded yet. `data_pieces` must be at least 1.
    pub fn new(
        local_path: PathBuf,
        size: u64,
        data_pieces: u32,
        parity_pieces: u32,
        num_chunks: usize,
    ) -> Self {
        let now = Utc::now();
        FileRecord {
            local_path,
            size,
            mod_time: now,
            last_health_check_time: now,
            data_pieces,
            parity_pieces,
            chunks: vec![
                ChunkRecord {
                    stuck: false,
                    pieces: Vec::new(),
                };
                num_chunks
            ],
            cached_health: CachedHealthMetadata::default(),
        }
    }

    /// Health of one chunk under a host view. 0 when every piece is held by
    /// a usable host; grows past 1 once fewer than `data_pieces` pieces
    /// remain reachable.
    fn chunk_health(&self, chunk: &ChunkRecord, offline: &HostMap, good_for_renew: &HostMap) -> f64 {
        let min_pieces = f64::from(self.data_pieces);
        let num_pieces = f64::from(self.data_pieces + self.parity_pieces);
        let good = chunk
            .pieces
            .iter()
            .filter(|p| p.hosts.iter().any(|h| host_usable(h, offline, good_for_renew)))
            .count() as f64;
        if self.parity_pieces == 0 {
            // Pure replication of the data pieces: either whole or not.
            return if good >= num_pieces { 0.0 } else { 1.0 };
        }
        1.0 - (good - min_pieces) / (num_pieces - min_pieces)
    }

    pub fn health(&self, offline: &HostMap, good_for_renew: &HostMap) -> FileHealth {
        let mut health = 0.0_f64;
        let mut stuck_health = 0.0_f64;
        let mut num_stuck_chunks = 0_u64;
        for chunk in &self.chunks {
            let chunk_health = self.chunk_health(chunk, offline, good_for_renew);
            if chunk_health > health {
                health = chunk_health;
            }
            if chunk.stuck {
                num_stuck_chunks += 1;
                if chunk_health > stuck_health {
                    stuck_health = chunk_health;
                }
            }
        }
        FileHealth {
            health,
            stuck_health,
            num_stuck_chunks,
        }
    }

    /// Minimum, over all chunks, of reachable pieces per piece needed for
    /// reconstruction. Only reachability matters here, not renew-worthiness.
    pub fn redundancy(&self, offline: &HostMap) -> f64 {
        let min_pieces = f64::from(self.data_pieces.max(1));
        let full = f64::from(self.data_pieces + self.parity_pieces) / min_pieces;
        self.chunks
            .iter()
            .map(|chunk| {
                let available = chunk
                    .pieces
                    .iter()
                    .filter(|p| p.hosts.iter().any(|h| host_online(h, offline)))
                    .count() as f64;
                available / min_pieces
            })
            .fold(full, f64::min)
    }

    /// Clear the stuck bit on chunks that are healthy under the host view.
    /// Returns whether any chunk changed.
    pub fn mark_all_healthy_chunks_as_unstuck(
        &mut self,
        offline: &HostMap,
        good_for_renew: &HostMap,
    ) -> bool {
        let healthy: Vec<bool> = self
            .chunks
            .iter()
            .map(|c| self.chunk_health(c, offline, good_for_renew) == 0.0)
            .collect();
        let mut changed = false;
        for (chunk, healthy) in self.chunks.iter_mut().zip(healthy) {
            if chunk.stuck && healthy {
                chunk.stuck = false;
                changed = true;
            }
        }
        changed
    }
}

fn write_record(sys_path: &Path, record: &FileRecord) -> Result<()> {
    let bytes = rmp_serde::to_vec(record)?;
    let file_name = sys_path
        .file_name()
        .ok_or_else(|| HavenError::State(format!("bad record path '{}'", sys_path.display())))?;
    let mut tmp_name = file_name.to_os_string();
    tmp_name.push(".tmp");
    let tmp = sys_path.with_file_name(tmp_name);
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, sys_path)?;
    Ok(())
}

/// One open file record shared by all live handles for the same path.
#[derive(Debug)]
struct RecordCell {
    sys_path: PathBuf,
    record: Mutex<FileRecord>,
}

/// Filesystem-backed [`FileStore`].
///
/// Concurrent opens of the same path share one in-memory record, and each
/// mutation is persisted (temp file + rename) while the record lock is
/// held, so updates are serialized per entity.
pub struct VaultFileStore {
    root: PathBuf,
    open_records: Mutex<HashMap<String, Weak<RecordCell>>>,
}

impl VaultFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        VaultFileStore {
            root: root.into(),
            open_records: Mutex::new(HashMap::new()),
        }
    }

    /// Persist a record for a newly tracked file and return a handle to it.
    pub fn create(&self, path: &VaultPath, record: FileRecord) -> Result<Box<dyn FileEntry>> {
        let sys_path = path.file_sys_path(&self.root);
        if sys_path.exists() {
            return Err(HavenError::Other(format!(
                "file record already exists: '{path}'"
            )));
        }
        if let Some(parent) = sys_path.parent() {
            fs::create_dir_all(parent)?;
        }
        write_record(&sys_path, &record)?;

        let cell = Arc::new(RecordCell {
            sys_path,
            record: Mutex::new(record),
        });
        let mut open_records = self.open_records.lock().unwrap();
        open_records.insert(path.as_str().to_string(), Arc::downgrade(&cell));
        Ok(Box::new(FileRecordHandle { cell }))
    }

    fn open_cell(&self, path: &VaultPath) -> Result<Arc<RecordCell>> {
        let mut open_records = self.open_records.lock().unwrap();
        open_records.retain(|_, weak| weak.strong_count() > 0);
        if let Some(cell) = open_records.get(path.as_str()).and_then(Weak::upgrade) {
            return Ok(cell);
        }

        let sys_path = path.file_sys_path(&self.root);
        let bytes = match fs::read(&sys_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(HavenError::FileNotFound(path.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let record: FileRecord = rmp_serde::from_slice(&bytes)
            .map_err(|e| HavenError::from(e).context(format!("corrupt file record '{path}'")))?;

        let cell = Arc::new(RecordCell {
            sys_path,
            record: Mutex::new(record),
        });
        open_records.insert(path.as_str().to_string(), Arc::downgrade(&cell));
        Ok(cell)
    }
}

impl FileStore for VaultFileStore {
    fn open(&self, path: &VaultPath) -> Result<Box<dyn FileEntry>> {
        Ok(Box::new(FileRecordHandle {
            cell: self.open_cell(path)?,
        }))
    }
}

#[derive(Debug)]
struct FileRecordHandle {
    cell: Arc<RecordCell>,
}

impl FileEntry for FileRecordHandle {
    fn mark_all_healthy_chunks_as_unstuck(
        &self,
        offline: &HostMap,
        good_for_renew: &HostMap,
    ) -> Result<()> {
        let mut record = self.cell.record.lock().unwrap();
        if record.mark_all_healthy_chunks_as_unstuck(offline, good_for_renew) {
            write_record(&self.cell.sys_path, &record)?;
        }
        Ok(())
    }

    fn health(&self, offline: &HostMap, good_for_renew: &HostMap) -> FileHealth {
        self.cell.record.lock().unwrap().health(offline, good_for_renew)
    }

    fn redundancy(&self, offline: &HostMap, _good_for_renew: &HostMap) -> f64 {
        self.cell.record.lock().unwrap().redundancy(offline)
    }

    fn local_path(&self) -> PathBuf {
        self.cell.record.lock().unwrap().local_path.clone()
    }

    fn last_health_check_time(&self) -> DateTime<Utc> {
        self.cell.record.lock().unwrap().last_health_check_time
    }

    fn update_last_health_check_time(&self) -> Result<()> {
        let mut record = self.cell.record.lock().unwrap();
        record.last_health_check_time = Utc::now();
        write_record(&self.cell.sys_path, &record)
    }

    fn mod_time(&self) -> DateTime<Utc> {
        self.cell.record.lock().unwrap().mod_time
    }

    fn size(&self) -> u64 {
        self.cell.record.lock().unwrap().size
    }

    fn update_cached_health_metadata(&self, metadata: CachedHealthMetadata) -> Result<()> {
        let mut record = self.cell.record.lock().unwrap();
        record.cached_health = metadata;
        write_record(&self.cell.sys_path, &record)
    }
}
