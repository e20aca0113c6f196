use crate::concurrency::InstanceGuard;
use crate::mode::ExecutionMode;
use crate::resolver::SuffixResolver;
use crate::CoreError;
use dirsrv_backend::{
    BackendPlugin, ExportOptions, MaintenanceTaskRequest, PluginHost, PluginRegistry,
    ServicePlugin, TaskKind, TaskParams, REPLICATION_PLUGIN_NAME, TASK_PROTOCOL_VERSION,
};
use dirsrv_config::DirectorySearch;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::{debug, error, info, warn};

/// How the conflict guard is taken on the first invocation of a batch.
#[derive(Debug, Clone)]
pub struct GuardSpec {
    pub rundir: PathBuf,
    pub mode: ExecutionMode,
    pub replication_dump: bool,
    pub skip_check: bool,
}

/// Runs maintenance task requests against backend plugins.
///
/// Every request goes through the same checks, in order: the request
/// carries the options its task needs, the target plugin exists, it speaks
/// task protocol 2 or later, it implements the capability, and no
/// conflicting process holds the installation. Only then is the capability
/// called, once.
pub struct Dispatcher<'a> {
    registry: &'a PluginRegistry,
    resolver: SuffixResolver<'a>,
    guard: GuardSpec,
    held: Option<InstanceGuard>,
}

impl<'a> Dispatcher<'a> {
    pub fn new(
        registry: &'a PluginRegistry,
        directory: &'a dyn DirectorySearch,
        guard: GuardSpec,
    ) -> Self {
        Self {
            registry,
            resolver: SuffixResolver::new(directory),
            guard,
            held: None,
        }
    }

    pub fn guard_held(&self) -> bool {
        self.held.is_some()
    }

    pub fn invoke(&mut self, request: &MaintenanceTaskRequest) -> Result<(), CoreError> {
        validate(request)?;
        let kind = request.kind();
        let plugin = self.resolve_plugin(request)?;

        let version = plugin.protocol_version();
        if version < TASK_PROTOCOL_VERSION {
            return Err(CoreError::PluginTooOld {
                plugin: plugin.name().to_owned(),
                kind,
                found: version,
                required: TASK_PROTOCOL_VERSION,
            });
        }
        if !supports(plugin.as_ref(), kind) {
            return Err(missing(plugin.as_ref(), kind));
        }
        self.acquire_guard()?;

        let _subsystem = match &request.params {
            TaskParams::Export(opts) if opts.replica => Some(PluginSubsystem::start(self.registry)?),
            _ => None,
        };

        if let TaskParams::Export(opts) = &request.params {
            if !request.quiet {
                if let Some(output) = &opts.output {
                    eprintln!("ldiffile: {}", output.display());
                }
            }
        }

        let target = request
            .instance
            .clone()
            .unwrap_or_else(|| plugin.name().to_owned());
        info!("{kind} of '{target}' via '{}'", plugin.name());
        call(plugin.as_ref(), request)
            .inspect_err(|e| error!("{kind} of '{target}' failed: {e}"))
    }

    /// Run requests in order, stopping at the first failure.
    pub fn run_batch(&mut self, requests: &[MaintenanceTaskRequest]) -> Result<(), CoreError> {
        for (done, request) in requests.iter().enumerate() {
            if let Err(e) = self.invoke(request) {
                let skipped = requests.len() - done - 1;
                if skipped > 0 {
                    warn!("batch aborted, {skipped} remaining task(s) not run");
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn resolve_plugin(
        &self,
        request: &MaintenanceTaskRequest,
    ) -> Result<Arc<dyn BackendPlugin>, CoreError> {
        if let Some(name) = &request.plugin {
            return self
                .registry
                .backend(name)
                .ok_or_else(|| CoreError::BackendNotFound(name.clone()));
        }
        let instance = request.instance.as_deref().ok_or_else(|| {
            CoreError::Usage("a backend instance (-n) or plugin is required".to_owned())
        })?;
        self.resolver
            .plugin_for_instance(instance, self.registry)?
            .ok_or_else(|| CoreError::BackendNotFound(instance.to_owned()))
    }

    fn acquire_guard(&mut self) -> Result<(), CoreError> {
        if self.held.is_some() {
            return Ok(());
        }
        let guard = InstanceGuard::acquire(
            &self.guard.rundir,
            self.guard.mode,
            self.guard.replication_dump,
            self.guard.skip_check,
        )
        .inspect_err(|_| error!("shutting down due to possible conflicts with other processes"))?;
        self.held = Some(guard);
        Ok(())
    }
}

fn validate(request: &MaintenanceTaskRequest) -> Result<(), CoreError> {
    let kind = request.kind();
    let usage = |what: &str| {
        Err(CoreError::Usage(format!(
            "{}: {what} is required",
            kind.function_name()
        )))
    };
    let needs_instance = matches!(
        kind,
        TaskKind::Import | TaskKind::Export | TaskKind::Reindex | TaskKind::UpgradeDnFormat
    );
    if needs_instance && request.instance.is_none() {
        return usage("a backend instance (-n) or included suffix (-s)");
    }

    match &request.params {
        TaskParams::Import(opts) if opts.inputs.is_empty() => usage("an LDIF input file (-i)"),
        TaskParams::Reindex(opts) if opts.targets.is_empty() => {
            usage("an attribute (-t) or VLV index (-T)")
        }
        TaskParams::Backup(opts) | TaskParams::Restore(opts) if opts.archive_dir.is_none() => {
            usage("an archive directory (-a)")
        }
        TaskParams::Upgrade(opts) if opts.archive_dir.is_none() => {
            usage("an archive directory (-a)")
        }
        TaskParams::UpgradeDnFormat(opts) if opts.instance_dir.is_none() => {
            usage("an instance directory (-a)")
        }
        _ => Ok(()),
    }
}

fn supports(plugin: &dyn BackendPlugin, kind: TaskKind) -> bool {
    match kind {
        TaskKind::Import => plugin.importer().is_some(),
        TaskKind::Export => plugin.exporter().is_some(),
        TaskKind::Reindex => plugin.reindexer().is_some(),
        TaskKind::Backup | TaskKind::Restore => plugin.archiver().is_some(),
        TaskKind::Upgrade | TaskKind::UpgradeDnFormat => plugin.upgrader().is_some(),
        TaskKind::Verify => plugin.verifier().is_some(),
    }
}

fn missing(plugin: &dyn BackendPlugin, kind: TaskKind) -> CoreError {
    CoreError::MissingCapability {
        plugin: plugin.name().to_owned(),
        function: kind.function_name(),
    }
}

fn call(plugin: &dyn BackendPlugin, request: &MaintenanceTaskRequest) -> Result<(), CoreError> {
    let kind = request.kind();
    let not_offered = || missing(plugin, kind);
    let instance = request.instance.as_deref().unwrap_or_default();

    let result = match &request.params {
        TaskParams::Import(opts) => plugin
            .importer()
            .ok_or_else(not_offered)?
            .import(instance, opts),
        TaskParams::Export(opts) => plugin
            .exporter()
            .ok_or_else(not_offered)?
            .export(instance, opts),
        TaskParams::Reindex(opts) => plugin
            .reindexer()
            .ok_or_else(not_offered)?
            .reindex(instance, opts),
        TaskParams::Backup(opts) => plugin.archiver().ok_or_else(not_offered)?.backup(opts),
        TaskParams::Restore(opts) => plugin.archiver().ok_or_else(not_offered)?.restore(opts),
        TaskParams::Upgrade(opts) => plugin.upgrader().ok_or_else(not_offered)?.upgrade(opts),
        TaskParams::UpgradeDnFormat(opts) => plugin
            .upgrader()
            .ok_or_else(not_offered)?
            .upgrade_dn_format(instance, opts),
        TaskParams::Verify(opts) => plugin.verifier().ok_or_else(not_offered)?.verify(opts),
    };

    result.map_err(|source| CoreError::Task {
        kind,
        target: request
            .instance
            .clone()
            .unwrap_or_else(|| plugin.name().to_owned()),
        source,
    })
}

/// Output file for one instance of a multi-instance export. Without
/// append mode each instance gets `<dir>/<instance>_<file>`; `-` stays
/// standard output.
pub fn export_file_for(output: &Path, instance: &str, append_mode: bool) -> PathBuf {
    let raw = output.to_string_lossy();
    if append_mode || raw == "-" {
        return output.to_path_buf();
    }
    match raw.rfind('/') {
        Some(idx) => PathBuf::from(format!("{}/{instance}_{}", &raw[..idx], &raw[idx + 1..])),
        None => PathBuf::from(format!("{instance}_{raw}")),
    }
}

/// One export request per instance, in order. In append mode the first
/// request truncates the shared file and the rest append to it.
pub fn export_requests(
    instances: &[String],
    opts: &ExportOptions,
    quiet: bool,
) -> Vec<MaintenanceTaskRequest> {
    if opts.append_mode && instances.len() > 1 && opts.output.is_some() {
        warn!(
            "exporting {} instances into a single file; use -M for one file per instance",
            instances.len()
        );
    }
    instances
        .iter()
        .enumerate()
        .map(|(idx, instance)| {
            let mut per_instance = opts.clone();
            per_instance.append_first = opts.append_mode && idx == 0;
            per_instance.output = opts
                .output
                .as_deref()
                .map(|out| export_file_for(out, instance, opts.append_mode));
            let mut request =
                MaintenanceTaskRequest::for_instance(instance.clone(), TaskParams::Export(per_instance));
            request.quiet = quiet;
            request
        })
        .collect()
}

type Event = Box<dyn FnOnce() + Send>;

/// Persistent searches registered while the plugin subsystem is up.
#[derive(Debug, Default)]
struct PersistentSearches {
    active: Mutex<Vec<String>>,
}

impl PersistentSearches {
    fn register(&self, base: &str) {
        if let Ok(mut active) = self.active.lock() {
            debug!("persistent search opened on '{base}'");
            active.push(base.to_owned());
        }
    }

    fn close_all(&self) {
        if let Ok(mut active) = self.active.lock() {
            if !active.is_empty() {
                debug!("closing {} persistent search(es)", active.len());
            }
            active.clear();
        }
    }
}

/// The slice of the plugin machinery a replica-dump export needs: an event
/// queue, the persistent-search system, and the replication plugin with
/// everything it depends on. Torn down in reverse when dropped.
pub struct PluginSubsystem {
    events: Option<mpsc::Sender<Event>>,
    worker: Option<thread::JoinHandle<usize>>,
    searches: PersistentSearches,
    started: Vec<Arc<dyn ServicePlugin>>,
}

impl PluginSubsystem {
    pub fn start(registry: &PluginRegistry) -> Result<Self, CoreError> {
        let (tx, rx) = mpsc::channel::<Event>();
        let mut subsystem = Self {
            events: Some(tx),
            worker: None,
            searches: PersistentSearches::default(),
            started: Vec::new(),
        };

        let plugins = if registry.has_service(REPLICATION_PLUGIN_NAME) {
            registry.dependency_closure(REPLICATION_PLUGIN_NAME)?
        } else {
            warn!("'{REPLICATION_PLUGIN_NAME}' is not configured, starting no plugins");
            Vec::new()
        };
        for plugin in plugins {
            plugin.start(&subsystem)?;
            subsystem.started.push(plugin);
        }

        // Events queued by plugin start-up are held until every plugin is up.
        subsystem.worker = Some(
            thread::Builder::new()
                .name("dirsrv-eventq".to_owned())
                .spawn(move || rx.into_iter().map(|event| event()).count())?,
        );
        debug!(
            "plugin subsystem started: {}",
            subsystem.started_plugins().join(", ")
        );
        Ok(subsystem)
    }

    pub fn started_plugins(&self) -> Vec<String> {
        self.started.iter().map(|p| p.name().to_owned()).collect()
    }
}

impl PluginHost for PluginSubsystem {
    fn schedule(&self, event: Event) -> bool {
        self.events.as_ref().is_some_and(|tx| tx.send(event).is_ok())
    }

    fn register_persistent_search(&self, base: &str) {
        self.searches.register(base);
    }
}

impl Drop for PluginSubsystem {
    fn drop(&mut self) {
        drop(self.events.take());
        if let Some(worker) = self.worker.take() {
            match worker.join() {
                Ok(n) => debug!("event queue stopped after {n} event(s)"),
                Err(_) => warn!("event queue thread panicked"),
            }
        }
        self.searches.close_all();
        for plugin in self.started.drain(..).rev() {
            plugin.stop();
        }
    }
}
