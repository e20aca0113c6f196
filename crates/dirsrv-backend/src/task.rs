use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Import,
    Export,
    Reindex,
    Backup,
    Restore,
    Upgrade,
    UpgradeDnFormat,
    Verify,
}

impl TaskKind {
    /// Name of the backend entry point, as reported in "no <task> function".
    pub fn function_name(self) -> &'static str {
        match self {
            Self::Import => "ldif2db",
            Self::Export => "db2ldif",
            Self::Reindex => "db2index",
            Self::Backup => "db2archive",
            Self::Restore => "archive2db",
            Self::Upgrade => "upgradedb",
            Self::UpgradeDnFormat => "upgradednformat",
            Self::Verify => "dbverify",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Import => "import",
            Self::Export => "export",
            Self::Reindex => "reindex",
            Self::Backup => "backup",
            Self::Restore => "restore",
            Self::Upgrade => "upgrade",
            Self::UpgradeDnFormat => "dn format upgrade",
            Self::Verify => "verify",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TaskOrigin {
    CommandLine,
    InternalTask,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum UniqueIdStrategy {
    #[default]
    None,
    TimeBased,
    NameBased,
}

impl UniqueIdStrategy {
    /// Parse the `-g` argument. Anything other than `none` or
    /// `deterministic` selects time-based generation.
    pub fn from_arg(arg: &str) -> Self {
        if arg.eq_ignore_ascii_case("none") {
            Self::None
        } else if arg.eq_ignore_ascii_case("deterministic") {
            Self::NameBased
        } else {
            Self::TimeBased
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportOptions {
    /// LDIF inputs; `-` reads standard input.
    pub inputs: Vec<PathBuf>,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub no_attr_indexes: bool,
    pub unique_id: UniqueIdStrategy,
    pub namespace_id: Option<String>,
    pub encrypt: bool,
    pub merge_chunk_size: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportOptions {
    /// Destination file; `None` or `-` writes to standard output.
    pub output: Option<PathBuf>,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub encrypt: bool,
    pub replica: bool,
    pub dump_unique_id: bool,
    /// Emit a `# entry-id` comment before each entry.
    pub print_key: bool,
    pub no_wrap: bool,
    pub minimal_encoding: bool,
    /// All instances go to one file rather than `<instance>_<file>`.
    pub append_mode: bool,
    /// Set on the first instance of an append-mode batch; truncates the file.
    pub append_first: bool,
    pub no_version: bool,
    pub id2entry_only: bool,
    pub server_running: bool,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            output: None,
            include: Vec::new(),
            exclude: Vec::new(),
            encrypt: false,
            replica: false,
            dump_unique_id: true,
            print_key: true,
            no_wrap: false,
            minimal_encoding: false,
            append_mode: true,
            append_first: true,
            no_version: false,
            id2entry_only: false,
            server_running: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum IndexTarget {
    Attribute(String),
    Vlv(String),
}

impl IndexTarget {
    pub fn name(&self) -> &str {
        match self {
            Self::Attribute(name) | Self::Vlv(name) => name,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReindexOptions {
    pub targets: Vec<IndexTarget>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArchiveOptions {
    pub archive_dir: Option<PathBuf>,
    /// Restore only this instance from the archive.
    pub instance: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpgradeOptions {
    /// Where the pre-upgrade backup is written.
    pub archive_dir: Option<PathBuf>,
    pub force: bool,
    pub dn2rdn: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpgradeDnFormatOptions {
    pub instance_dir: Option<PathBuf>,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VerifyOptions {
    /// Instances to check; empty means every instance.
    pub instances: Vec<String>,
    pub verbose: bool,
    pub db_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum TaskParams {
    Import(ImportOptions),
    Export(ExportOptions),
    Reindex(ReindexOptions),
    Backup(ArchiveOptions),
    Restore(ArchiveOptions),
    Upgrade(UpgradeOptions),
    UpgradeDnFormat(UpgradeDnFormatOptions),
    Verify(VerifyOptions),
}

impl TaskParams {
    pub fn kind(&self) -> TaskKind {
        match self {
            Self::Import(_) => TaskKind::Import,
            Self::Export(_) => TaskKind::Export,
            Self::Reindex(_) => TaskKind::Reindex,
            Self::Backup(_) => TaskKind::Backup,
            Self::Restore(_) => TaskKind::Restore,
            Self::Upgrade(_) => TaskKind::Upgrade,
            Self::UpgradeDnFormat(_) => TaskKind::UpgradeDnFormat,
            Self::Verify(_) => TaskKind::Verify,
        }
    }

    /// Whether the task asked for attribute encryption or decryption.
    pub fn wants_encryption(&self) -> bool {
        match self {
            Self::Import(o) => o.encrypt,
            Self::Export(o) => o.encrypt,
            _ => false,
        }
    }
}

/// One invocation of a backend capability. Built fresh for every instance
/// of a batch and dropped once the backend returns.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MaintenanceTaskRequest {
    /// Target instance. `None` for plugin-wide tasks (backup, upgrade, verify).
    pub instance: Option<String>,
    /// Target plugin by name, for plugin-wide tasks.
    pub plugin: Option<String>,
    pub params: TaskParams,
    pub origin: TaskOrigin,
    pub quiet: bool,
}

impl MaintenanceTaskRequest {
    pub fn for_instance(instance: impl Into<String>, params: TaskParams) -> Self {
        Self {
            instance: Some(instance.into()),
            plugin: None,
            params,
            origin: TaskOrigin::CommandLine,
            quiet: false,
        }
    }

    pub fn for_plugin(plugin: impl Into<String>, params: TaskParams) -> Self {
        Self {
            instance: None,
            plugin: Some(plugin.into()),
            params,
            origin: TaskOrigin::CommandLine,
            quiet: false,
        }
    }

    pub fn kind(&self) -> TaskKind {
        self.params.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_id_strategy_parsing() {
        assert_eq!(UniqueIdStrategy::from_arg("none"), UniqueIdStrategy::None);
        assert_eq!(
            UniqueIdStrategy::from_arg("Deterministic"),
            UniqueIdStrategy::NameBased
        );
        assert_eq!(UniqueIdStrategy::from_arg("time"), UniqueIdStrategy::TimeBased);
        assert_eq!(UniqueIdStrategy::from_arg("random"), UniqueIdStrategy::TimeBased);
    }

    #[test]
    fn params_report_kind_and_encryption() {
        let import = TaskParams::Import(ImportOptions {
            encrypt: true,
            ..ImportOptions::default()
        });
        assert_eq!(import.kind(), TaskKind::Import);
        assert!(import.wants_encryption());

        let verify = TaskParams::Verify(VerifyOptions::default());
        assert_eq!(verify.kind(), TaskKind::Verify);
        assert!(!verify.wants_encryption());
    }

    #[test]
    fn export_defaults_match_command_line_defaults() {
        let opts = ExportOptions::default();
        assert!(opts.append_mode);
        assert!(opts.dump_unique_id);
        assert!(opts.print_key);
        assert!(!opts.replica);
    }

    #[test]
    fn function_names() {
        assert_eq!(TaskKind::Export.function_name(), "db2ldif");
        assert_eq!(TaskKind::Verify.function_name(), "dbverify");
        assert_eq!(TaskKind::UpgradeDnFormat.to_string(), "dn format upgrade");
    }
}
