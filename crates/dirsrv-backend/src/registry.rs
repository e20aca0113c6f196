use crate::ldbm::LdbmPlugin;
use crate::mock::MockBackend;
use crate::plugin::{BackendPlugin, ConfiguredService, ServicePlugin, REPLICATION_PLUGIN_NAME};
use crate::BackendError;
use dirsrv_config::{PluginKind, PluginSection, ServerConfig};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

struct ServiceEntry {
    plugin: Arc<dyn ServicePlugin>,
    depends_on: Vec<String>,
}

/// Every plugin known to the process, keyed by case-insensitive name.
///
/// Built once while the process is still single-threaded and read-only
/// afterwards.
#[derive(Default)]
pub struct PluginRegistry {
    backends: BTreeMap<String, Arc<dyn BackendPlugin>>,
    services: BTreeMap<String, ServiceEntry>,
}

pub enum Plugin {
    Backend(Arc<dyn BackendPlugin>),
    Service(Arc<dyn ServicePlugin>),
}

/// Instantiate the plugin a `[[plugin]]` section describes.
pub fn build_plugin(section: &PluginSection) -> Result<Plugin, BackendError> {
    match section.kind {
        PluginKind::Ldbm => {
            let db_dir = section
                .db_dir
                .clone()
                .ok_or_else(|| BackendError::PluginConfig {
                    plugin: section.name.clone(),
                    reason: "db_dir is required".to_owned(),
                })?;
            Ok(Plugin::Backend(Arc::new(LdbmPlugin::new(
                &section.name,
                db_dir,
                section.protocol_version,
                section.instances.clone(),
            ))))
        }
        PluginKind::Mock => Ok(Plugin::Backend(Arc::new(MockBackend::from_section(
            section,
        )?))),
        PluginKind::Service => Ok(Plugin::Service(Arc::new(
            ConfiguredService::new(section.name.clone())
                .with_persistent_searches(persistent_search_bases(section)),
        ))),
    }
}

/// Comma-separated `persistent_search` option. The replication plugin
/// watches the changelog unless told otherwise.
fn persistent_search_bases(section: &PluginSection) -> Vec<String> {
    match section.options.get("persistent_search") {
        Some(bases) => bases
            .split(',')
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .map(str::to_owned)
            .collect(),
        None if section.name.eq_ignore_ascii_case(REPLICATION_PLUGIN_NAME) => {
            vec!["cn=changelog".to_owned()]
        }
        None => Vec::new(),
    }
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &ServerConfig) -> Result<Self, BackendError> {
        let mut registry = Self::new();
        for section in &config.plugin {
            if !section.enabled {
                debug!("plugin '{}' is disabled, skipping", section.name);
                continue;
            }
            match build_plugin(section)? {
                Plugin::Backend(p) => registry.register_backend(p),
                Plugin::Service(p) => registry.register_service(p, section.depends_on.clone()),
            }
        }
        Ok(registry)
    }

    pub fn register_backend(&mut self, plugin: Arc<dyn BackendPlugin>) {
        self.backends
            .insert(plugin.name().to_ascii_lowercase(), plugin);
    }

    pub fn register_service(&mut self, plugin: Arc<dyn ServicePlugin>, depends_on: Vec<String>) {
        self.services.insert(
            plugin.name().to_ascii_lowercase(),
            ServiceEntry { plugin, depends_on },
        );
    }

    pub fn backend(&self, name: &str) -> Option<Arc<dyn BackendPlugin>> {
        self.backends.get(&name.to_ascii_lowercase()).cloned()
    }

    pub fn backends(&self) -> impl Iterator<Item = &Arc<dyn BackendPlugin>> {
        self.backends.values()
    }

    pub fn has_service(&self, name: &str) -> bool {
        self.services.contains_key(&name.to_ascii_lowercase())
    }

    /// `name` and every service plugin it transitively depends on, in start
    /// order (dependencies first). Dependencies on backend plugins are
    /// satisfied implicitly.
    pub fn dependency_closure(
        &self,
        name: &str,
    ) -> Result<Vec<Arc<dyn ServicePlugin>>, BackendError> {
        let mut order = Vec::new();
        let mut done = BTreeSet::new();
        let mut visiting = BTreeSet::new();
        self.visit(name, &mut visiting, &mut done, &mut order)?;
        Ok(order)
    }

    fn visit(
        &self,
        name: &str,
        visiting: &mut BTreeSet<String>,
        done: &mut BTreeSet<String>,
        order: &mut Vec<Arc<dyn ServicePlugin>>,
    ) -> Result<(), BackendError> {
        let key = name.to_ascii_lowercase();
        if done.contains(&key) {
            return Ok(());
        }
        let Some(entry) = self.services.get(&key) else {
            if self.backends.contains_key(&key) {
                return Ok(());
            }
            return Err(BackendError::UnknownPlugin(name.to_owned()));
        };
        if !visiting.insert(key.clone()) {
            return Err(BackendError::DependencyCycle(name.to_owned()));
        }
        for dep in &entry.depends_on {
            self.visit(dep, visiting, done, order)?;
        }
        visiting.remove(&key);
        done.insert(key);
        order.push(Arc::clone(&entry.plugin));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ServerConfig {
        ServerConfig::parse(
            r#"
[[plugin]]
name = "ldbm database"
kind = "ldbm"
db_dir = "/tmp/dirsrv-db"
instances = ["userRoot"]

[[plugin]]
name = "Multimaster Replication Plugin"
kind = "service"
depends_on = ["ldbm database", "Class of Service", "Roles Plugin"]

[[plugin]]
name = "Roles Plugin"
kind = "service"
depends_on = ["Class of Service"]

[[plugin]]
name = "Class of Service"
kind = "service"

[[plugin]]
name = "Disabled"
kind = "mock"
enabled = false
"#,
        )
        .unwrap()
    }

    #[test]
    fn from_config_registers_enabled_plugins() {
        let registry = PluginRegistry::from_config(&config()).unwrap();
        assert!(registry.backend("LDBM DATABASE").is_some());
        assert!(registry.backend("Disabled").is_none());
        assert!(registry.has_service("roles plugin"));
    }

    #[test]
    fn closure_is_dependency_ordered() {
        let registry = PluginRegistry::from_config(&config()).unwrap();
        let closure = registry
            .dependency_closure("Multimaster Replication Plugin")
            .unwrap();
        let names: Vec<&str> = closure.iter().map(|p| p.name()).collect();
        assert_eq!(
            names,
            vec![
                "Class of Service",
                "Roles Plugin",
                "Multimaster Replication Plugin"
            ]
        );
    }

    #[test]
    fn persistent_searches_come_from_options() {
        let mut section = PluginSection {
            name: REPLICATION_PLUGIN_NAME.to_owned(),
            kind: PluginKind::Service,
            enabled: true,
            db_dir: None,
            protocol_version: 2,
            instances: vec![],
            depends_on: vec![],
            options: BTreeMap::new(),
        };
        assert_eq!(persistent_search_bases(&section), vec!["cn=changelog"]);

        section.options.insert(
            "persistent_search".to_owned(),
            "cn=changelog, o=netscaperoot,".to_owned(),
        );
        assert_eq!(
            persistent_search_bases(&section),
            vec!["cn=changelog", "o=netscaperoot"]
        );

        section.name = "Roles Plugin".to_owned();
        section.options.clear();
        assert!(persistent_search_bases(&section).is_empty());
    }

    #[test]
    fn closure_detects_cycles() {
        let mut registry = PluginRegistry::new();
        registry.register_service(Arc::new(ConfiguredService::new("a")), vec!["b".to_owned()]);
        registry.register_service(Arc::new(ConfiguredService::new("b")), vec!["a".to_owned()]);
        assert!(matches!(
            registry.dependency_closure("a"),
            Err(BackendError::DependencyCycle(_))
        ));
    }

    #[test]
    fn unknown_dependency_is_an_error() {
        let mut registry = PluginRegistry::new();
        registry.register_service(
            Arc::new(ConfiguredService::new("a")),
            vec!["missing".to_owned()],
        );
        assert!(matches!(
            registry.dependency_closure("a"),
            Err(BackendError::UnknownPlugin(_))
        ));
    }

    #[test]
    fn ldbm_requires_db_dir() {
        let section = PluginSection {
            name: "ldbm database".to_owned(),
            kind: PluginKind::Ldbm,
            enabled: true,
            db_dir: None,
            protocol_version: 2,
            instances: vec![],
            depends_on: vec![],
            options: BTreeMap::new(),
        };
        assert!(build_plugin(&section).is_err());
    }
}
