use crate::CoreError;
use dirsrv_backend::{BackendPlugin, PluginRegistry};
use dirsrv_config::directory::{OC_BACKEND_INSTANCE, OC_MAPPING_TREE, OC_PLUGIN};
use dirsrv_config::dn::{parent_dn, unquote};
use dirsrv_config::{
    normalize_dn, strip_leftmost_rdn, DirectorySearch, Entry, Filter, Scope, SearchError,
    MAPPING_TREE_DN, PLUGINS_DN,
};
use std::sync::Arc;
use tracing::debug;

/// Maps naming suffixes to backend instance names by searching the
/// mapping tree in the configuration directory.
pub struct SuffixResolver<'a> {
    directory: &'a dyn DirectorySearch,
}

impl<'a> SuffixResolver<'a> {
    pub fn new(directory: &'a dyn DirectorySearch) -> Self {
        Self { directory }
    }

    /// Suffixes and instances of the mapping entries matching `suffix`.
    ///
    /// Exact lookups want a mapping entry named after the suffix itself.
    /// Otherwise any mapping entry whose suffix ends with the given one
    /// matches, and when none does the leftmost RDN is dropped and the
    /// search repeated, so `ou=people,dc=example,dc=com` finds the backend
    /// for `dc=example,dc=com`.
    pub fn resolve_instances_for_suffix(
        &self,
        suffix: &str,
        exact: bool,
    ) -> Result<(Vec<String>, Vec<String>), CoreError> {
        let suffix = normalize_dn(suffix)
            .map_err(|e| CoreError::Resolution(format!("suffix '{suffix}': {e}")))?;

        let entries = if exact {
            let quoted = format!("\"{suffix}\"");
            self.search_mapping(&Filter::Or(vec![
                Filter::equals("cn", &suffix),
                Filter::equals("cn", &quoted),
            ]))?
        } else {
            let mut current = Some(suffix.as_str());
            let mut found = Vec::new();
            while let Some(candidate) = current {
                found = self.search_mapping(&Filter::DnSuffix("cn".to_owned(), candidate.to_owned()))?;
                if !found.is_empty() {
                    break;
                }
                debug!("no mapping tree entry under '{candidate}', trying its parent");
                current = strip_leftmost_rdn(candidate);
            }
            found
        };

        let mut suffixes = Vec::new();
        let mut instances = Vec::new();
        for entry in &entries {
            if let Some(backend) = entry.get("nsslapd-backend") {
                instances.push(backend.to_owned());
                if let Some(cn) = entry.get("cn") {
                    suffixes.push(unquote(cn).to_owned());
                }
            }
        }
        Ok((suffixes, instances))
    }

    /// Instances serving `include`, minus those serving `exclude`. Order
    /// follows `include`; duplicates are dropped.
    pub fn resolve_instances(
        &self,
        include: &[String],
        exclude: &[String],
    ) -> Result<Vec<String>, CoreError> {
        let mut included: Vec<String> = Vec::new();
        for suffix in include {
            let (_, instances) = self.resolve_instances_for_suffix(suffix, false)?;
            for instance in instances {
                if !included.iter().any(|i| i.eq_ignore_ascii_case(&instance)) {
                    included.push(instance);
                }
            }
        }

        let mut excluded = Vec::new();
        for suffix in exclude {
            let (_, instances) = self.resolve_instances_for_suffix(suffix, false)?;
            excluded.extend(instances);
        }

        included.retain(|i| !excluded.iter().any(|x| x.eq_ignore_ascii_case(i)));
        Ok(included)
    }

    /// The backend plugin serving `instance`, found through the instance's
    /// entry under `cn=plugins,cn=config`. `None` when either the instance
    /// or its parent plugin entry is missing.
    pub fn plugin_for_instance(
        &self,
        instance: &str,
        registry: &PluginRegistry,
    ) -> Result<Option<Arc<dyn BackendPlugin>>, CoreError> {
        let filter = Filter::And(vec![
            Filter::equals("cn", instance),
            Filter::object_class(OC_BACKEND_INSTANCE),
        ]);
        let entries = self
            .directory
            .search(PLUGINS_DN, Scope::Subtree, &filter)
            .map_err(|e| resolution_error(&format!("instance '{instance}'"), &e))?;
        let Some(parent) = entries.first().and_then(|e| parent_dn(&e.dn)) else {
            return Ok(None);
        };

        let plugins = match self
            .directory
            .search(&parent, Scope::Base, &Filter::object_class(OC_PLUGIN))
        {
            Ok(plugins) => plugins,
            Err(SearchError::NoSuchObject(_)) => return Ok(None),
            Err(e) => return Err(resolution_error(&format!("plugin entry '{parent}'"), &e)),
        };
        Ok(plugins
            .first()
            .and_then(|p| p.get("cn"))
            .and_then(|name| registry.backend(name)))
    }

    fn search_mapping(&self, name_filter: &Filter) -> Result<Vec<Entry>, CoreError> {
        let filter = Filter::And(vec![
            Filter::object_class(OC_MAPPING_TREE),
            name_filter.clone(),
        ]);
        self.directory
            .search(MAPPING_TREE_DN, Scope::Subtree, &filter)
            .map_err(|e| resolution_error("the mapping tree", &e))
    }
}

fn resolution_error(what: &str, err: &SearchError) -> CoreError {
    CoreError::Resolution(format!("{what}: {err}"))
}
