use crate::dn::normalize_dn;
use crate::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

/// File name of the server configuration inside the configuration directory.
pub const CONFIG_FILE_NAME: &str = "dse.toml";

/// Lowest task-protocol version a backend plugin must declare.
pub const DEFAULT_PROTOCOL_VERSION: u32 = 2;

pub const REFERRAL_MAX_DESCRIPTORS: u32 = 1024;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Directory the configuration was loaded from. Not part of the file.
    #[serde(skip)]
    pub config_dir: PathBuf,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub security: SecuritySection,
    #[serde(default)]
    pub logs: LogsSection,
    #[serde(default)]
    pub mapping_tree: Vec<MappingTreeEntry>,
    #[serde(default)]
    pub plugin: Vec<PluginSection>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ServerSection {
    /// Plaintext LDAP port; 0 disables the plaintext listener.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Secure (LDAPS) port; 0 disables the secure listener.
    #[serde(default = "default_secure_port")]
    pub secure_port: u16,
    #[serde(default = "default_listen_host")]
    pub listen_host: String,
    #[serde(default = "default_listen_host")]
    pub secure_listen_host: String,
    #[serde(default)]
    pub ldapi_enabled: bool,
    #[serde(default)]
    pub ldapi_path: Option<PathBuf>,
    /// Global switch for encrypted transport.
    #[serde(default)]
    pub security: bool,
    /// Account the server runs as after binding its listeners.
    #[serde(default)]
    pub local_user: Option<String>,
    #[serde(default = "default_rundir")]
    pub rundir: PathBuf,
    #[serde(default = "default_thread_number")]
    pub thread_number: usize,
    #[serde(default = "default_max_descriptors")]
    pub max_descriptors: u32,
    #[serde(default = "default_version_string")]
    pub version_string: String,
    #[serde(default = "default_build_number")]
    pub build_number: String,
    #[serde(default = "default_housekeeping_interval")]
    pub housekeeping_interval_secs: u64,
    /// Referral URL used when running in referral mode.
    #[serde(default)]
    pub referral: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SecuritySection {
    #[serde(default)]
    pub cert_dir: Option<PathBuf>,
    #[serde(default = "default_cert_file")]
    pub cert_file: String,
    #[serde(default = "default_key_file")]
    pub key_file: String,
    #[serde(default = "default_pin_file")]
    pub pin_file: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct LogsSection {
    #[serde(default)]
    pub access: Option<PathBuf>,
    #[serde(default)]
    pub audit: Option<PathBuf>,
    #[serde(default)]
    pub error: Option<PathBuf>,
}

impl LogsSection {
    /// Every configured log file, in access/audit/error order.
    pub fn configured(&self) -> Vec<&Path> {
        [&self.access, &self.audit, &self.error]
            .into_iter()
            .filter_map(|p| p.as_deref())
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct MappingTreeEntry {
    pub suffix: String,
    pub backend: String,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PluginKind {
    /// File-backed reference database backend.
    Ldbm,
    /// Recording backend used for dry runs and tests.
    Mock,
    /// Non-database plugin that only takes part in the plugin lifecycle.
    Service,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PluginSection {
    pub name: String,
    pub kind: PluginKind,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub db_dir: Option<PathBuf>,
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u32,
    #[serde(default)]
    pub instances: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Free-form plugin arguments.
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

fn default_port() -> u16 {
    389
}
fn default_secure_port() -> u16 {
    636
}
fn default_listen_host() -> String {
    "0.0.0.0".to_owned()
}
fn default_rundir() -> PathBuf {
    PathBuf::from("/run/dirsrv")
}
fn default_thread_number() -> usize {
    16
}
fn default_max_descriptors() -> u32 {
    8192
}
fn default_version_string() -> String {
    format!("389-Directory/{}", env!("CARGO_PKG_VERSION"))
}
fn default_build_number() -> String {
    "0".to_owned()
}
fn default_housekeeping_interval() -> u64 {
    30
}
fn default_cert_file() -> String {
    "server.crt".to_owned()
}
fn default_key_file() -> String {
    "server.key".to_owned()
}
fn default_pin_file() -> String {
    "pin.txt".to_owned()
}
fn default_true() -> bool {
    true
}
fn default_protocol_version() -> u32 {
    DEFAULT_PROTOCOL_VERSION
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            secure_port: default_secure_port(),
            listen_host: default_listen_host(),
            secure_listen_host: default_listen_host(),
            ldapi_enabled: false,
            ldapi_path: None,
            security: false,
            local_user: None,
            rundir: default_rundir(),
            thread_number: default_thread_number(),
            max_descriptors: default_max_descriptors(),
            version_string: default_version_string(),
            build_number: default_build_number(),
            housekeeping_interval_secs: default_housekeeping_interval(),
            referral: None,
        }
    }
}

impl Default for SecuritySection {
    fn default() -> Self {
        Self {
            cert_dir: None,
            cert_file: default_cert_file(),
            key_file: default_key_file(),
            pin_file: default_pin_file(),
        }
    }
}

impl ServerConfig {
    /// Load `dse.toml` from a configuration directory and validate it.
    pub fn load(config_dir: &Path) -> Result<Self, ConfigError> {
        if !config_dir.is_dir() {
            return Err(ConfigError::MissingConfigDir(config_dir.to_path_buf()));
        }
        let path = config_dir.join(CONFIG_FILE_NAME);
        if !path.is_file() {
            return Err(ConfigError::MissingFile(path));
        }
        let content = fs::read_to_string(&path)?;
        let mut config = Self::parse(&content)?;
        config.config_dir = config_dir.to_path_buf();
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(content)?;
        config.normalize()?;
        config.validate()?;
        Ok(config)
    }

    fn normalize(&mut self) -> Result<(), ConfigError> {
        for entry in &mut self.mapping_tree {
            entry.suffix = normalize_dn(&entry.suffix)?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.server.thread_number == 0 {
            return Err(ConfigError::InvalidValue {
                field: "server.thread_number",
                reason: "must be at least 1".to_owned(),
            });
        }
        if self.server.ldapi_enabled && self.server.ldapi_path.is_none() {
            return Err(ConfigError::InvalidValue {
                field: "server.ldapi_path",
                reason: "required when ldapi_enabled is set".to_owned(),
            });
        }

        let mut seen_plugins = BTreeSet::new();
        let mut instances = BTreeSet::new();
        for plugin in &self.plugin {
            if !seen_plugins.insert(plugin.name.to_ascii_lowercase()) {
                return Err(ConfigError::DuplicatePlugin(plugin.name.clone()));
            }
            for inst in &plugin.instances {
                if !instances.insert(inst.to_ascii_lowercase()) {
                    return Err(ConfigError::DuplicateInstance(inst.clone()));
                }
            }
        }

        for entry in &self.mapping_tree {
            if !instances.contains(&entry.backend.to_ascii_lowercase()) {
                return Err(ConfigError::UnknownBackend {
                    suffix: entry.suffix.clone(),
                    backend: entry.backend.clone(),
                });
            }
        }
        Ok(())
    }

    /// Suffix served by a backend instance, if a mapping-tree entry names it.
    pub fn suffix_for_instance(&self, instance: &str) -> Option<&str> {
        self.mapping_tree
            .iter()
            .find(|m| m.backend.eq_ignore_ascii_case(instance))
            .map(|m| m.suffix.as_str())
    }

    pub fn plugin(&self, name: &str) -> Option<&PluginSection> {
        self.plugin
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }

    /// Turn off encrypted transport after a security-library failure.
    pub fn disable_security(&mut self) {
        self.server.security = false;
        self.server.secure_port = 0;
    }

    pub fn apply_referral_defaults(&mut self) {
        self.server.max_descriptors = REFERRAL_MAX_DESCRIPTORS;
    }

    /// The LDAPI socket path, when the local listener is switched on.
    pub fn ldapi_socket(&self) -> Option<&Path> {
        if self.server.ldapi_enabled {
            self.server.ldapi_path.as_deref()
        } else {
            None
        }
    }
}
