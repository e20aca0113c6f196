//! Configuration model for the dirsrv process control plane.
//!
//! This crate loads `dse.toml` from the configuration directory into a typed
//! `ServerConfig`, provides the DN helpers the rest of the workspace compares
//! suffixes with, and projects the configuration into an in-memory
//! `ConfigDirectory` tree that answers the `cn=config` searches used for
//! suffix and plugin resolution.

pub mod directory;
pub mod dn;
pub mod server;

pub use directory::{
    ConfigDirectory, DirectorySearch, Entry, Filter, Scope, SearchError, MAPPING_TREE_DN,
    PLUGINS_DN,
};
pub use dn::{ends_with_dn, normalize_dn, parent_dn, strip_leftmost_rdn};
pub use server::{
    LogsSection, MappingTreeEntry, PluginKind, PluginSection, SecuritySection, ServerConfig,
    ServerSection, CONFIG_FILE_NAME, DEFAULT_PROTOCOL_VERSION,
};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("configuration directory does not exist: {}", .0.display())]
    MissingConfigDir(PathBuf),
    #[error("configuration file not found: {}", .0.display())]
    MissingFile(PathBuf),
    #[error("invalid DN: '{0}'")]
    InvalidDn(String),
    #[error("mapping tree entry '{suffix}' names unknown backend '{backend}'")]
    UnknownBackend { suffix: String, backend: String },
    #[error("backend instance '{0}' is declared by more than one plugin")]
    DuplicateInstance(String),
    #[error("plugin '{0}' is declared more than once")]
    DuplicatePlugin(String),
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}
