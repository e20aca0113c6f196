use crate::mode::ExecutionMode;
use crate::CoreError;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const LOCK_DIR: &str = "lock";
pub const SERVER_LOCK: &str = "server.lock";
pub const DB_LOCK: &str = "db.lock";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Shared,
    Exclusive,
}

/// Which lock files a mode takes under `<rundir>/lock`.
///
/// A running server holds `server.lock` exclusively and `db.lock` shared,
/// so read-only offline tasks (export, backup, verify) may run beside it
/// while anything rewriting the database is refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPlan {
    pub server: bool,
    pub db: Option<LockKind>,
}

impl LockPlan {
    pub fn for_mode(mode: ExecutionMode, replication_dump: bool) -> Self {
        let db = match mode {
            ExecutionMode::Server | ExecutionMode::Backup | ExecutionMode::Verify => {
                Some(LockKind::Shared)
            }
            ExecutionMode::Export if !replication_dump => Some(LockKind::Shared),
            ExecutionMode::Export
            | ExecutionMode::Import
            | ExecutionMode::Restore
            | ExecutionMode::Reindex
            | ExecutionMode::Upgrade
            | ExecutionMode::UpgradeDnFormat => Some(LockKind::Exclusive),
            ExecutionMode::Referral
            | ExecutionMode::SuffixToInstance
            | ExecutionMode::PrintVersion
            | ExecutionMode::Unknown => None,
        };
        Self {
            server: mode == ExecutionMode::Server,
            db,
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.server && self.db.is_none()
    }
}

/// Held locks; released when dropped.
#[derive(Debug)]
pub struct InstanceGuard {
    held: Vec<(PathBuf, File)>,
}

impl InstanceGuard {
    /// Point-in-time check against other processes on the same
    /// installation. Never waits: a held lock is a conflict.
    pub fn acquire(
        rundir: &Path,
        mode: ExecutionMode,
        replication_dump: bool,
        skip_check: bool,
    ) -> Result<Self, CoreError> {
        let plan = LockPlan::for_mode(mode, replication_dump);
        if skip_check {
            debug!("conflict check skipped for {mode}");
            return Ok(Self { held: Vec::new() });
        }
        if plan.is_empty() {
            return Ok(Self { held: Vec::new() });
        }

        let dir = rundir.join(LOCK_DIR);
        fs::create_dir_all(&dir)?;
        let mut held = Vec::new();
        if plan.server {
            let path = dir.join(SERVER_LOCK);
            held.push((path.clone(), try_lock(&path, LockKind::Exclusive, mode)?));
        }
        if let Some(kind) = plan.db {
            let path = dir.join(DB_LOCK);
            held.push((path.clone(), try_lock(&path, kind, mode)?));
        }
        debug!("{mode}: acquired {} lock(s) in {}", held.len(), dir.display());
        Ok(Self { held })
    }

    /// Whether a server currently holds `server.lock` under `rundir`.
    pub fn server_running(rundir: &Path) -> bool {
        let path = rundir.join(LOCK_DIR).join(SERVER_LOCK);
        let Ok(file) = OpenOptions::new().read(true).open(&path) else {
            return false;
        };
        match FileExt::try_lock_shared(&file) {
            Ok(()) => {
                let _ = FileExt::unlock(&file);
                false
            }
            Err(_) => true,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        for (path, file) in &self.held {
            if let Err(e) = FileExt::unlock(file) {
                warn!("failed to release {}: {e}", path.display());
            }
        }
    }
}

fn try_lock(path: &Path, kind: LockKind, mode: ExecutionMode) -> Result<File, CoreError> {
    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)?;

    let locked = match kind {
        LockKind::Shared => FileExt::try_lock_shared(&file),
        LockKind::Exclusive => FileExt::try_lock_exclusive(&file),
    };
    if locked.is_err() {
        let holder = describe_holder(&mut file, kind);
        return Err(CoreError::Conflict(format!(
            "cannot run {mode}: {} is held{holder}",
            path.display()
        )));
    }

    if kind == LockKind::Exclusive {
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(file, "{} {mode}", std::process::id())?;
        file.flush()?;
    }
    Ok(file)
}

/// Only exclusive holders write their pid, so the file content names the
/// holder only when the blocking lock is exclusive.
fn describe_holder(file: &mut File, wanted: LockKind) -> String {
    if wanted == LockKind::Exclusive && FileExt::try_lock_shared(&*file).is_ok() {
        let _ = FileExt::unlock(&*file);
        return " shared by running process(es)".to_owned();
    }
    let mut content = String::new();
    if file.read_to_string(&mut content).is_err() {
        return String::new();
    }
    match content.split_whitespace().next() {
        Some(pid) => format!(" by pid {pid}"),
        None => String::new(),
    }
}
