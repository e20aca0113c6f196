use crate::BackendError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// On-disk format revision of the ldbm database directory.
pub const DB_FORMAT_VERSION: u32 = 2;
const VERSION_FILE: &str = "DBVERSION";
const DATA_FILE: &str = "id2entry.ldif";
const CHECKSUM_FILE: &str = "id2entry.b3";

/// Directory layout of the reference backend.
///
/// ```text
/// <db_dir>/DBVERSION
/// <db_dir>/<instance>/id2entry.ldif
/// <db_dir>/<instance>/id2entry.b3
/// <db_dir>/<instance>/index/<attr>.idx
/// <db_dir>/<instance>/index/vlv/<name>.idx
/// ```
#[derive(Debug, Clone)]
pub struct LdbmLayout {
    root: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct DbVersion {
    format_version: u32,
}

impl LdbmLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn instance_dir(&self, instance: &str) -> PathBuf {
        self.root.join(instance)
    }

    #[inline]
    pub fn version_file(&self) -> PathBuf {
        self.root.join(VERSION_FILE)
    }

    pub fn initialize_instance(&self, instance: &str) -> Result<(), BackendError> {
        fs::create_dir_all(index_dir(&self.instance_dir(instance)))?;
        Ok(())
    }

    pub fn read_version(&self) -> Result<Option<u32>, BackendError> {
        let path = self.version_file();
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)?;
        let ver: DbVersion = serde_json::from_str(&content)?;
        Ok(Some(ver.format_version))
    }

    pub fn write_version(&self, format_version: u32) -> Result<(), BackendError> {
        fs::create_dir_all(&self.root)?;
        let content = serde_json::to_string_pretty(&DbVersion { format_version })?;
        write_atomic(&self.version_file(), content.as_bytes())
    }
}

#[inline]
pub fn data_file(instance_dir: &Path) -> PathBuf {
    instance_dir.join(DATA_FILE)
}

#[inline]
pub fn checksum_file(instance_dir: &Path) -> PathBuf {
    instance_dir.join(CHECKSUM_FILE)
}

#[inline]
pub fn index_dir(instance_dir: &Path) -> PathBuf {
    instance_dir.join("index")
}

#[inline]
pub fn index_file(instance_dir: &Path, attr: &str) -> PathBuf {
    index_dir(instance_dir).join(format!("{}.idx", attr.to_ascii_lowercase()))
}

#[inline]
pub fn vlv_file(instance_dir: &Path, name: &str) -> PathBuf {
    index_dir(instance_dir)
        .join("vlv")
        .join(format!("{}.idx", name.to_ascii_lowercase()))
}

/// Write `content` to `dest` through a temp file in the same directory.
pub(crate) fn write_atomic(dest: &Path, content: &[u8]) -> Result<(), BackendError> {
    let dir = dest.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(content)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| BackendError::Io(e.error))?;
    Ok(())
}
