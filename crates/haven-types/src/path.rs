use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{HavenError, Result};

/// Filename suffix that identifies a managed file record on the backing
/// filesystem. Entries without it (and non-directories) are ignored by
/// metadata aggregation.
pub const FILE_EXTENSION: &str = ".haven";

/// Name of the directory record file stored inside each backing directory.
/// It carries neither [`FILE_EXTENSION`] nor a directory type, so
/// enumeration never classifies it as a child.
pub const DIR_METADATA_FILENAME: &str = ".havendir";

/// A canonical location inside the vault tree.
///
/// Stored as a clean `/`-separated relative string; the root is the empty
/// string. Two paths are equal iff they denote the same location, and
/// [`VaultPath::as_str`] is injective, which makes it usable as a map key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VaultPath {
    path: String,
}

fn validate_segment(segment: &str) -> Result<()> {
    if segment.is_empty() {
        return Err(HavenError::InvalidPath("empty path segment".into()));
    }
    if segment == "." || segment == ".." {
        return Err(HavenError::InvalidPath(format!(
            "'{segment}' is not a valid path segment"
        )));
    }
    if segment.contains('/') || segment.contains('\\') {
        return Err(HavenError::InvalidPath(format!(
            "path segment '{segment}' contains a separator"
        )));
    }
    Ok(())
}

impl VaultPath {
    /// The root of the vault tree.
    pub fn root() -> Self {
        VaultPath {
            path: String::new(),
        }
    }

    /// Parse and validate a vault path. The empty string is rejected; use
    /// [`VaultPath::root`] for the root.
    pub fn new(raw: &str) -> Result<Self> {
        if raw.is_empty() {
            return Err(HavenError::InvalidPath(
                "empty path (use the root path instead)".into(),
            ));
        }
        for segment in raw.split('/') {
            validate_segment(segment)?;
        }
        Ok(VaultPath {
            path: raw.to_string(),
        })
    }

    pub fn is_root(&self) -> bool {
        self.path.is_empty()
    }

    /// The enclosing directory.
    pub fn parent(&self) -> Result<VaultPath> {
        if self.is_root() {
            return Err(HavenError::RootHasNoParent);
        }
        match self.path.rsplit_once('/') {
            Some((rest, _)) => Ok(VaultPath {
                path: rest.to_string(),
            }),
            None => Ok(VaultPath::root()),
        }
    }

    /// Append a single name, validating that it cannot escape the tree.
    pub fn join(&self, name: &str) -> Result<VaultPath> {
        validate_segment(name)?;
        if self.is_root() {
            return Ok(VaultPath {
                path: name.to_string(),
            });
        }
        Ok(VaultPath {
            path: format!("{}/{name}", self.path),
        })
    }

    /// The final segment, or the empty string at the root.
    pub fn name(&self) -> &str {
        match self.path.rsplit_once('/') {
            Some((_, name)) => name,
            None => &self.path,
        }
    }

    /// The canonical string form, used as the coordinator key.
    pub fn as_str(&self) -> &str {
        &self.path
    }

    /// Backing filesystem path of this directory under `root`.
    pub fn dir_sys_path(&self, root: &Path) -> PathBuf {
        if self.is_root() {
            return root.to_path_buf();
        }
        root.join(&self.path)
    }

    /// Backing filesystem path of this file's record under `root`.
    pub fn file_sys_path(&self, root: &Path) -> PathBuf {
        root.join(format!("{}{FILE_EXTENSION}", self.path))
    }
}

impl fmt::Display for VaultPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            return write!(f, "/");
        }
        write!(f, "{}", self.path)
    }
}
