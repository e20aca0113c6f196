use super::layout::LdbmLayout;
use crate::BackendError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::path::Path;
use tracing::{debug, info};

const ARCHIVE_FILE: &str = "ldbm.tar";
const MANIFEST_FILE: &str = "manifest.json";

/// Describes a backup directory produced by `create_archive`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArchiveManifest {
    pub plugin: String,
    pub created: DateTime<Utc>,
    pub format_version: Option<u32>,
    pub instances: Vec<String>,
    /// blake3 of the tar file.
    pub tar_hash: String,
}

impl ArchiveManifest {
    pub fn load(archive_dir: &Path) -> Result<Self, BackendError> {
        let path = archive_dir.join(MANIFEST_FILE);
        if !path.exists() {
            return Err(BackendError::InvalidArchive(format!(
                "no {MANIFEST_FILE} in {}",
                archive_dir.display()
            )));
        }
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Pack every present instance directory plus the version marker into
/// `<archive_dir>/ldbm.tar` and write the manifest next to it.
pub fn create_archive(
    plugin: &str,
    layout: &LdbmLayout,
    instances: &[String],
    archive_dir: &Path,
) -> Result<ArchiveManifest, BackendError> {
    fs::create_dir_all(archive_dir)?;
    let tar_path = archive_dir.join(ARCHIVE_FILE);

    let mut packed = Vec::new();
    {
        let file = File::create(&tar_path)?;
        let mut builder = tar::Builder::new(file);
        builder.follow_symlinks(false);
        for inst in instances {
            let dir = layout.instance_dir(inst);
            if !dir.is_dir() {
                debug!("instance '{inst}' has no database directory, not archived");
                continue;
            }
            builder.append_dir_all(inst, &dir)?;
            packed.push(inst.clone());
        }
        let version = layout.version_file();
        if version.is_file() {
            builder.append_path_with_name(&version, "DBVERSION")?;
        }
        builder.into_inner()?.sync_all()?;
    }

    let tar_hash = blake3::hash(&fs::read(&tar_path)?).to_hex().to_string();
    let manifest = ArchiveManifest {
        plugin: plugin.to_owned(),
        created: Utc::now(),
        format_version: layout.read_version()?,
        instances: packed,
        tar_hash,
    };
    let content = serde_json::to_string_pretty(&manifest)?;
    super::layout::write_atomic(&archive_dir.join(MANIFEST_FILE), content.as_bytes())?;
    info!(
        "archived {} instance(s) to {}",
        manifest.instances.len(),
        archive_dir.display()
    );
    Ok(manifest)
}

/// Restore instances from an archive directory. With `only` set, just that
/// instance is replaced; otherwise every archived instance and the version
/// marker are.
pub fn restore_archive(
    layout: &LdbmLayout,
    archive_dir: &Path,
    only: Option<&str>,
) -> Result<Vec<String>, BackendError> {
    let manifest = ArchiveManifest::load(archive_dir)?;
    let tar_path = archive_dir.join(ARCHIVE_FILE);
    let actual = blake3::hash(&fs::read(&tar_path)?).to_hex().to_string();
    if actual != manifest.tar_hash {
        return Err(BackendError::IntegrityFailure {
            path: tar_path.display().to_string(),
            expected: manifest.tar_hash,
            actual,
        });
    }

    let targets: Vec<String> = match only {
        Some(inst) => {
            let found = manifest
                .instances
                .iter()
                .find(|i| i.eq_ignore_ascii_case(inst))
                .ok_or_else(|| BackendError::UnknownInstance(inst.to_owned()))?;
            vec![found.clone()]
        }
        None => manifest.instances.clone(),
    };

    fs::create_dir_all(layout.root())?;
    let staging = tempfile::tempdir_in(layout.root())?;
    tar::Archive::new(File::open(&tar_path)?).unpack(staging.path())?;

    for inst in &targets {
        let dest = layout.instance_dir(inst);
        if dest.exists() {
            fs::remove_dir_all(&dest)?;
        }
        fs::rename(staging.path().join(inst), &dest)?;
    }
    if only.is_none() {
        let version = staging.path().join("DBVERSION");
        if version.is_file() {
            fs::rename(version, layout.version_file())?;
        }
    }
    info!(
        "restored {} instance(s) from {}",
        targets.len(),
        archive_dir.display()
    );
    Ok(targets)
}
