//! Backend plugin protocol and maintenance tasks for dirsrv.
//!
//! A backend plugin owns one or more storage instances and exposes the
//! offline maintenance capabilities it supports (`Importer`, `Exporter`,
//! `Reindexer`, `Archiver`, `Upgrader`, `Verifier`) through the
//! `BackendPlugin` trait. The `PluginRegistry` builds plugins from the
//! `[[plugin]]` sections of `dse.toml`. Two backends ship in-tree: the
//! file-backed `ldbm` reference backend and a recording `mock` backend.

pub mod ldbm;
pub mod mock;
pub mod plugin;
pub mod registry;
pub mod task;

pub use ldbm::LdbmPlugin;
pub use mock::{Invocation, MockBackend};
pub use plugin::{
    Archiver, BackendPlugin, ConfiguredService, Exporter, Importer, PluginHost, Reindexer,
    ServicePlugin, TaskResult, Upgrader, Verifier, LDBM_PLUGIN_NAME, REPLICATION_PLUGIN_NAME,
    TASK_PROTOCOL_VERSION,
};
pub use registry::PluginRegistry;
pub use task::{
    ArchiveOptions, ExportOptions, ImportOptions, IndexTarget, MaintenanceTaskRequest,
    ReindexOptions, TaskKind, TaskOrigin, TaskParams, UniqueIdStrategy, UpgradeDnFormatOptions,
    UpgradeOptions, VerifyOptions,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("configuration error: {0}")]
    Config(#[from] dirsrv_config::ConfigError),
    #[error("plugin '{plugin}' is misconfigured: {reason}")]
    PluginConfig { plugin: String, reason: String },
    #[error("unknown backend instance: {0}")]
    UnknownInstance(String),
    #[error("unknown plugin: {0}")]
    UnknownPlugin(String),
    #[error("plugin dependency cycle through '{0}'")]
    DependencyCycle(String),
    #[error("invalid LDIF at record {record}: {reason}")]
    InvalidLdif { record: usize, reason: String },
    #[error("integrity check failed for '{path}': expected {expected}, got {actual}")]
    IntegrityFailure {
        path: String,
        expected: String,
        actual: String,
    },
    #[error("invalid archive: {0}")]
    InvalidArchive(String),
    #[error("database format version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
    #[error("task failed with code {code}: {reason}")]
    Failed { code: i32, reason: String },
}

impl BackendError {
    /// Exit code reported for this failure. Codes carried by `Failed` are
    /// passed through unchanged; everything else is a generic `1`.
    pub fn code(&self) -> i32 {
        match self {
            Self::Failed { code, .. } => *code,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_code_passes_through() {
        let e = BackendError::Failed {
            code: 7,
            reason: "disk full".to_owned(),
        };
        assert_eq!(e.code(), 7);
        assert!(e.to_string().contains("disk full"));
    }

    #[test]
    fn other_errors_map_to_one() {
        let e = BackendError::UnknownInstance("userRoot".to_owned());
        assert_eq!(e.code(), 1);
    }
}
