use crate::plugin::{
    Archiver, BackendPlugin, Exporter, Importer, Reindexer, TaskResult, Upgrader, Verifier,
    TASK_PROTOCOL_VERSION,
};
use crate::task::{
    ArchiveOptions, ExportOptions, ImportOptions, ReindexOptions, TaskKind,
    UpgradeDnFormatOptions, UpgradeOptions, VerifyOptions,
};
use crate::BackendError;
use dirsrv_config::PluginSection;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use tracing::debug;

/// One recorded capability call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub kind: TaskKind,
    pub instance: Option<String>,
    /// Output file for exports, as the dispatcher named it.
    pub output: Option<String>,
}

/// Backend that records every call and never touches storage.
///
/// Failures are injected per instance; capabilities can be withheld to
/// exercise the "no <task> function" path.
pub struct MockBackend {
    name: String,
    protocol_version: u32,
    instances: Vec<String>,
    failures: BTreeMap<String, i32>,
    withheld: BTreeSet<TaskKind>,
    calls: Mutex<Vec<Invocation>>,
}

impl MockBackend {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            protocol_version: TASK_PROTOCOL_VERSION,
            instances: Vec::new(),
            failures: BTreeMap::new(),
            withheld: BTreeSet::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Build from a `kind = "mock"` section. Recognized options:
    /// `fail.<instance> = "<code>"` and `without = "<function>,..."`.
    pub fn from_section(section: &PluginSection) -> Result<Self, BackendError> {
        let mut mock = Self::new(&section.name)
            .with_protocol_version(section.protocol_version)
            .with_instances(section.instances.iter().cloned());
        for (key, value) in &section.options {
            if let Some(inst) = key.strip_prefix("fail.") {
                let code = value.parse().map_err(|_| BackendError::PluginConfig {
                    plugin: section.name.clone(),
                    reason: format!("'{key}' must be an integer, got '{value}'"),
                })?;
                mock = mock.failing(inst, code);
            } else if key == "without" {
                for func in value.split(',').map(str::trim).filter(|f| !f.is_empty()) {
                    let kind = kind_for_function(func).ok_or_else(|| BackendError::PluginConfig {
                        plugin: section.name.clone(),
                        reason: format!("unknown task function '{func}'"),
                    })?;
                    mock = mock.without(kind);
                }
            }
        }
        Ok(mock)
    }

    #[must_use]
    pub fn with_protocol_version(mut self, version: u32) -> Self {
        self.protocol_version = version;
        self
    }

    #[must_use]
    pub fn with_instances<I, S>(mut self, instances: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.instances = instances.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn failing(mut self, instance: &str, code: i32) -> Self {
        self.failures.insert(instance.to_ascii_lowercase(), code);
        self
    }

    #[must_use]
    pub fn without(mut self, kind: TaskKind) -> Self {
        self.withheld.insert(kind);
        self
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn record(&self, kind: TaskKind, instance: Option<&str>, output: Option<String>) -> TaskResult {
        debug!("mock '{}': {kind} on {instance:?}", self.name);
        let mut calls = self.calls.lock().map_err(|e| BackendError::Failed {
            code: 1,
            reason: format!("mutex poisoned: {e}"),
        })?;
        calls.push(Invocation {
            kind,
            instance: instance.map(str::to_owned),
            output,
        });
        let code = instance.and_then(|i| self.failures.get(&i.to_ascii_lowercase()));
        match code {
            Some(&code) if code != 0 => Err(BackendError::Failed {
                code,
                reason: format!("injected failure for '{}'", instance.unwrap_or_default()),
            }),
            _ => Ok(()),
        }
    }

    fn offers(&self, kind: TaskKind) -> bool {
        !self.withheld.contains(&kind)
    }
}

fn kind_for_function(func: &str) -> Option<TaskKind> {
    [
        TaskKind::Import,
        TaskKind::Export,
        TaskKind::Reindex,
        TaskKind::Backup,
        TaskKind::Restore,
        TaskKind::Upgrade,
        TaskKind::UpgradeDnFormat,
        TaskKind::Verify,
    ]
    .into_iter()
    .find(|k| k.function_name() == func)
}

impl BackendPlugin for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn protocol_version(&self) -> u32 {
        self.protocol_version
    }

    fn instances(&self) -> Vec<String> {
        self.instances.clone()
    }

    fn importer(&self) -> Option<&dyn Importer> {
        self.offers(TaskKind::Import).then_some(self as &dyn Importer)
    }

    fn exporter(&self) -> Option<&dyn Exporter> {
        self.offers(TaskKind::Export).then_some(self as &dyn Exporter)
    }

    fn reindexer(&self) -> Option<&dyn Reindexer> {
        self.offers(TaskKind::Reindex).then_some(self as &dyn Reindexer)
    }

    fn archiver(&self) -> Option<&dyn Archiver> {
        (self.offers(TaskKind::Backup) || self.offers(TaskKind::Restore))
            .then_some(self as &dyn Archiver)
    }

    fn upgrader(&self) -> Option<&dyn Upgrader> {
        (self.offers(TaskKind::Upgrade) || self.offers(TaskKind::UpgradeDnFormat))
            .then_some(self as &dyn Upgrader)
    }

    fn verifier(&self) -> Option<&dyn Verifier> {
        self.offers(TaskKind::Verify).then_some(self as &dyn Verifier)
    }
}

impl Importer for MockBackend {
    fn import(&self, instance: &str, _opts: &ImportOptions) -> TaskResult {
        self.record(TaskKind::Import, Some(instance), None)
    }
}

impl Exporter for MockBackend {
    fn export(&self, instance: &str, opts: &ExportOptions) -> TaskResult {
        let output = opts.output.as_ref().map(|p| p.display().to_string());
        self.record(TaskKind::Export, Some(instance), output)
    }
}

impl Reindexer for MockBackend {
    fn reindex(&self, instance: &str, _opts: &ReindexOptions) -> TaskResult {
        self.record(TaskKind::Reindex, Some(instance), None)
    }
}

impl Archiver for MockBackend {
    fn backup(&self, _opts: &ArchiveOptions) -> TaskResult {
        self.record(TaskKind::Backup, None, None)
    }

    fn restore(&self, opts: &ArchiveOptions) -> TaskResult {
        self.record(TaskKind::Restore, opts.instance.as_deref(), None)
    }
}

impl Upgrader for MockBackend {
    fn upgrade(&self, _opts: &UpgradeOptions) -> TaskResult {
        self.record(TaskKind::Upgrade, None, None)
    }

    fn upgrade_dn_format(&self, instance: &str, _opts: &UpgradeDnFormatOptions) -> TaskResult {
        self.record(TaskKind::UpgradeDnFormat, Some(instance), None)
    }
}

impl Verifier for MockBackend {
    fn verify(&self, _opts: &VerifyOptions) -> TaskResult {
        self.record(TaskKind::Verify, None, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dirsrv_config::PluginKind;

    #[test]
    fn records_calls_in_order() {
        let mock = MockBackend::new("mock").with_instances(["a", "b"]);
        mock.import("a", &ImportOptions::default()).unwrap();
        mock.export("b", &ExportOptions::default()).unwrap();
        let calls = mock.invocations();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].kind, TaskKind::Import);
        assert_eq!(calls[1].instance.as_deref(), Some("b"));
    }

    #[test]
    fn injected_failure_carries_code() {
        let mock = MockBackend::new("mock").failing("B", 42);
        let err = mock.export("b", &ExportOptions::default()).unwrap_err();
        assert_eq!(err.code(), 42);
        assert_eq!(mock.invocations().len(), 1);
    }

    #[test]
    fn withheld_capability_is_absent() {
        let mock = MockBackend::new("mock").without(TaskKind::Reindex);
        assert!(mock.reindexer().is_none());
        assert!(mock.importer().is_some());
    }

    #[test]
    fn from_section_reads_options() {
        let mut options = BTreeMap::new();
        options.insert("fail.userRoot".to_owned(), "3".to_owned());
        options.insert("without".to_owned(), "db2index, dbverify".to_owned());
        let section = PluginSection {
            name: "mock".to_owned(),
            kind: PluginKind::Mock,
            enabled: true,
            db_dir: None,
            protocol_version: 1,
            instances: vec!["userRoot".to_owned()],
            depends_on: vec![],
            options,
        };
        let mock = MockBackend::from_section(&section).unwrap();
        assert_eq!(mock.protocol_version(), 1);
        assert!(mock.reindexer().is_none());
        assert!(mock.verifier().is_none());
        assert_eq!(
            mock.import("userroot", &ImportOptions::default())
                .unwrap_err()
                .code(),
            3
        );
    }

    #[test]
    fn from_section_rejects_bad_code() {
        let mut options = BTreeMap::new();
        options.insert("fail.x".to_owned(), "many".to_owned());
        let section = PluginSection {
            name: "mock".to_owned(),
            kind: PluginKind::Mock,
            enabled: true,
            db_dir: None,
            protocol_version: 2,
            instances: vec![],
            depends_on: vec![],
            options,
        };
        assert!(MockBackend::from_section(&section).is_err());
    }
}
