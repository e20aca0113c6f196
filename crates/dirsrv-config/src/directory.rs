//! In-memory `cn=config` tree built from `dse.toml`.
//!
//! The resolver only ever needs a handful of base/one-level/subtree searches
//! with equality and DN-suffix filters, so that is all `DirectorySearch`
//! exposes. `ConfigDirectory` is the shipped implementation; tests substitute
//! their own to inject search failures.

use crate::dn::{dn_eq, ends_with_dn, normalize_dn, parent_dn, unquote};
use crate::server::{PluginKind, ServerConfig};
use std::collections::BTreeMap;
use thiserror::Error;

pub const CONFIG_DN: &str = "cn=config";
pub const MAPPING_TREE_DN: &str = "cn=mapping tree,cn=config";
pub const PLUGINS_DN: &str = "cn=plugins,cn=config";

pub const OC_MAPPING_TREE: &str = "nsMappingTree";
pub const OC_PLUGIN: &str = "nsSlapdPlugin";
pub const OC_BACKEND_INSTANCE: &str = "nsBackendInstance";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub dn: String,
    /// Attribute names are stored lowercased.
    attrs: BTreeMap<String, Vec<String>>,
}

impl Entry {
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            attrs: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with(mut self, attr: &str, value: impl Into<String>) -> Self {
        self.add(attr, value);
        self
    }

    pub fn add(&mut self, attr: &str, value: impl Into<String>) {
        self.attrs
            .entry(attr.to_ascii_lowercase())
            .or_default()
            .push(value.into());
    }

    pub fn values(&self, attr: &str) -> &[String] {
        self.attrs
            .get(&attr.to_ascii_lowercase())
            .map_or(&[], Vec::as_slice)
    }

    /// First value of `attr`.
    pub fn get(&self, attr: &str) -> Option<&str> {
        self.values(attr).first().map(String::as_str)
    }

    pub fn has_value(&self, attr: &str, value: &str) -> bool {
        self.values(attr)
            .iter()
            .any(|v| v.eq_ignore_ascii_case(value))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Base,
    OneLevel,
    Subtree,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    /// `(attr=value)`, case-insensitive.
    Equals(String, String),
    /// Some value of `attr`, read as a DN, ends with the given suffix.
    DnSuffix(String, String),
    And(Vec<Filter>),
    Or(Vec<Filter>),
}

impl Filter {
    pub fn equals(attr: &str, value: &str) -> Self {
        Self::Equals(attr.to_owned(), value.to_owned())
    }

    pub fn object_class(oc: &str) -> Self {
        Self::equals("objectclass", oc)
    }

    pub fn matches(&self, entry: &Entry) -> bool {
        match self {
            Self::Equals(attr, value) => entry.has_value(attr, value),
            Self::DnSuffix(attr, suffix) => entry.values(attr).iter().any(|v| {
                let raw = unquote(v);
                let value = normalize_dn(raw).unwrap_or_else(|_| raw.to_owned());
                ends_with_dn(&value, suffix)
            }),
            Self::And(filters) => filters.iter().all(|f| f.matches(entry)),
            Self::Or(filters) => filters.iter().any(|f| f.matches(entry)),
        }
    }
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("no such object: {0}")]
    NoSuchObject(String),
    #[error("directory unavailable: {0}")]
    Unavailable(String),
}

pub trait DirectorySearch: Send + Sync {
    fn search(&self, base: &str, scope: Scope, filter: &Filter)
        -> Result<Vec<Entry>, SearchError>;
}

/// The configuration tree as a flat list of entries, in insertion order.
#[derive(Debug, Clone, Default)]
pub struct ConfigDirectory {
    entries: Vec<Entry>,
}

impl ConfigDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entry: Entry) {
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        let mut dir = Self::new();
        dir.insert(Entry::new(CONFIG_DN).with("objectclass", "top").with("cn", "config"));
        dir.insert(
            Entry::new(MAPPING_TREE_DN)
                .with("objectclass", "top")
                .with("cn", "mapping tree"),
        );
        dir.insert(
            Entry::new(PLUGINS_DN)
                .with("objectclass", "top")
                .with("cn", "plugins"),
        );

        for mapping in &config.mapping_tree {
            let quoted = format!("\"{}\"", mapping.suffix);
            dir.insert(
                Entry::new(format!("cn={quoted},{MAPPING_TREE_DN}"))
                    .with("objectclass", "top")
                    .with("objectclass", "extensibleObject")
                    .with("objectclass", OC_MAPPING_TREE)
                    .with("cn", mapping.suffix.clone())
                    .with("cn", quoted)
                    .with("nsslapd-state", "backend")
                    .with("nsslapd-backend", mapping.backend.clone()),
            );
        }

        for plugin in &config.plugin {
            let plugin_dn = format!("cn={},{PLUGINS_DN}", plugin.name);
            let plugin_type = match plugin.kind {
                PluginKind::Ldbm | PluginKind::Mock => "database",
                PluginKind::Service => "object",
            };
            dir.insert(
                Entry::new(plugin_dn.clone())
                    .with("objectclass", "top")
                    .with("objectclass", OC_PLUGIN)
                    .with("cn", plugin.name.clone())
                    .with("nsslapd-pluginType", plugin_type)
                    .with("nsslapd-pluginId", format!("{:?}", plugin.kind).to_lowercase())
                    .with(
                        "nsslapd-pluginEnabled",
                        if plugin.enabled { "on" } else { "off" },
                    ),
            );

            for instance in &plugin.instances {
                let mut entry = Entry::new(format!("cn={instance},{plugin_dn}"))
                    .with("objectclass", "top")
                    .with("objectclass", "extensibleObject")
                    .with("objectclass", OC_BACKEND_INSTANCE)
                    .with("cn", instance.clone());
                if let Some(suffix) = config.suffix_for_instance(instance) {
                    entry.add("nsslapd-suffix", suffix);
                }
                if let Some(db_dir) = &plugin.db_dir {
                    entry.add(
                        "nsslapd-directory",
                        db_dir.join(instance).display().to_string(),
                    );
                }
                dir.insert(entry);
            }
        }
        dir
    }

    fn in_scope(entry: &Entry, base: &str, scope: Scope) -> bool {
        match scope {
            Scope::Base => dn_eq(&entry.dn, base),
            Scope::OneLevel => parent_dn(&entry.dn).is_some_and(|p| dn_eq(&p, base)),
            Scope::Subtree => ends_with_dn(&entry.dn, base),
        }
    }
}

impl DirectorySearch for ConfigDirectory {
    fn search(
        &self,
        base: &str,
        scope: Scope,
        filter: &Filter,
    ) -> Result<Vec<Entry>, SearchError> {
        let base = normalize_dn(base).map_err(|e| SearchError::NoSuchObject(e.to_string()))?;
        if !base.is_empty() && !self.entries.iter().any(|e| dn_eq(&e.dn, &base)) {
            return Err(SearchError::NoSuchObject(base));
        }
        Ok(self
            .entries
            .iter()
            .filter(|e| Self::in_scope(e, &base, scope) && filter.matches(e))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ConfigDirectory {
        let config = ServerConfig::parse(
            r#"
[[mapping_tree]]
suffix = "dc=example,dc=com"
backend = "userRoot"

[[mapping_tree]]
suffix = "o=netscaperoot"
backend = "NetscapeRoot"

[[plugin]]
name = "ldbm database"
kind = "ldbm"
db_dir = "/var/lib/dirsrv/db"
instances = ["userRoot", "NetscapeRoot"]

[[plugin]]
name = "Multimaster Replication Plugin"
kind = "service"
"#,
        )
        .unwrap();
        ConfigDirectory::from_config(&config)
    }

    #[test]
    fn mapping_entry_carries_both_cn_forms() {
        let dir = sample();
        let hits = dir
            .search(
                MAPPING_TREE_DN,
                Scope::OneLevel,
                &Filter::equals("cn", "\"dc=example,dc=com\""),
            )
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].get("nsslapd-backend"), Some("userRoot"));

        let hits = dir
            .search(
                MAPPING_TREE_DN,
                Scope::OneLevel,
                &Filter::equals("cn", "dc=example,dc=com"),
            )
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn dn_suffix_filter_matches_descendants_only() {
        let dir = sample();
        let filter = Filter::And(vec![
            Filter::object_class(OC_MAPPING_TREE),
            Filter::DnSuffix("cn".to_owned(), "dc=com".to_owned()),
        ]);
        let hits = dir.search(MAPPING_TREE_DN, Scope::Subtree, &filter).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].get("nsslapd-backend"), Some("userRoot"));
    }

    #[test]
    fn instance_entries_live_under_plugin() {
        let dir = sample();
        let filter = Filter::And(vec![
            Filter::object_class(OC_BACKEND_INSTANCE),
            Filter::equals("cn", "userroot"),
        ]);
        let hits = dir.search(PLUGINS_DN, Scope::Subtree, &filter).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(
            parent_dn(&hits[0].dn).as_deref(),
            Some("cn=ldbm database,cn=plugins,cn=config")
        );
        assert_eq!(hits[0].get("nsslapd-suffix"), Some("dc=example,dc=com"));
        assert_eq!(
            hits[0].get("nsslapd-directory"),
            Some("/var/lib/dirsrv/db/userRoot")
        );
    }

    #[test]
    fn base_search_returns_plugin_entry() {
        let dir = sample();
        let hits = dir
            .search(
                "cn=ldbm database,cn=plugins,cn=config",
                Scope::Base,
                &Filter::object_class(OC_PLUGIN),
            )
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].get("nsslapd-pluginType"), Some("database"));
    }

    #[test]
    fn missing_base_is_no_such_object() {
        let dir = sample();
        let err = dir
            .search("cn=nothing,cn=config", Scope::Subtree, &Filter::Or(vec![]))
            .unwrap_err();
        assert!(matches!(err, SearchError::NoSuchObject(_)));
    }
}
