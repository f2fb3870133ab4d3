use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};

use chrono::Utc;

use haven_types::error::{HavenError, Result};
use haven_types::path::{VaultPath, DIR_METADATA_FILENAME};

use crate::metadata::DirectoryMetadata;
use crate::store::{DirEntry, DirStore};

fn write_metadata(sys_path: &Path, metadata: &DirectoryMetadata) -> Result<()> {
    let bytes = rmp_serde::to_vec(metadata)?;
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

#[derive(Debug)]
struct RecordCell {
    sys_path: PathBuf,
    metadata: Mutex<DirectoryMetadata>,
}

/// Filesystem-backed [`DirStore`]. Each directory's metadata lives in a
/// `.havendir` file inside its backing directory; concurrent opens of the
/// same path share one in-memory record.
pub struct VaultDirStore {
    root: PathBuf,
    open_records: Mutex<HashMap<String, Weak<RecordCell>>>,
}

impl VaultDirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        VaultDirStore {
            root: root.into(),
            open_records: Mutex::new(HashMap::new()),
        }
    }

    fn record_sys_path(&self, path: &VaultPath) -> PathBuf {
        path.dir_sys_path(&self.root).join(DIR_METADATA_FILENAME)
    }
}

impl DirStore for VaultDirStore {
    fn open(&self, path: &VaultPath) -> Result<Box<dyn DirEntry>> {
        let mut open_records = self.open_records.lock().unwrap();
        open_records.retain(|_, weak| weak.strong_count() > 0);
        if let Some(cell) = open_records.get(path.as_str()).and_then(Weak::upgrade) {
            return Ok(Box::new(DirRecordHandle { cell }));
        }

        let sys_path = self.record_sys_path(path);
        let bytes = match fs::read(&sys_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(HavenError::DirNotFound(path.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let metadata: DirectoryMetadata = rmp_serde::from_slice(&bytes)
            .map_err(|e| HavenError::from(e).context(format!("corrupt directory record '{path}'")))?;

        let cell = Arc::new(RecordCell {
            sys_path,
            metadata: Mutex::new(metadata),
        });
        open_records.insert(path.as_str().to_string(), Arc::downgrade(&cell));
        Ok(Box::new(DirRecordHandle { cell }))
    }

    fn create(&self, path: &VaultPath) -> Result<Box<dyn DirEntry>> {
        let mut open_records = self.open_records.lock().unwrap();
        open_records.retain(|_, weak| weak.strong_count() > 0);
        if let Some(cell) = open_records.get(path.as_str()).and_then(Weak::upgrade) {
            return Ok(Box::new(DirRecordHandle { cell }));
        }

        fs::create_dir_all(path.dir_sys_path(&self.root))?;
        let sys_path = self.record_sys_path(path);
        let metadata = DirectoryMetadata::fresh(Utc::now());
        write_metadata(&sys_path, &metadata)?;

        let cell = Arc::new(RecordCell {
            sys_path,
            metadata: Mutex::new(metadata),
        });
        open_records.insert(path.as_str().to_string(), Arc::downgrade(&cell));
        Ok(Box::new(DirRecordHandle { cell }))
    }
}

#[derive(Debug)]
struct DirRecordHandle {
    cell: Arc<RecordCell>,
}

impl DirEntry for DirRecordHandle {
    fn metadata(&self) -> DirectoryMetadata {
        self.cell.metadata.lock().unwrap().clone()
    }

    fn update_metadata(&self, metadata: DirectoryMetadata) -> Result<()> {
        let mut stored = self.cell.metadata.lock().unwrap();
        write_metadata(&self.cell.sys_path, &metadata)?;
        *stored = metadata;
        Ok(())
    }
}
