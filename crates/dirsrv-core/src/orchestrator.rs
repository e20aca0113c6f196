//! The top-level sequencer: one `Invocation` in, one `Result` out.
//!
//! Server and referral modes walk the full lifecycle (bind, drop identity,
//! fork, security, pool, run, drain). Offline modes load the configuration,
//! resolve their targets and hand a batch of requests to the dispatcher;
//! they never create a worker pool.

use crate::concurrency::InstanceGuard;
use crate::daemon::{self, ForkOutcome, PidFile, ServiceNotifier};
use crate::dispatcher::{export_requests, Dispatcher, GuardSpec};
use crate::invocation::Invocation;
use crate::lifecycle::{LifecycleState, ProcessLifecycle};
use crate::logging::ErrorLogSink;
use crate::mode::{general_usage, ExecutionMode};
use crate::pool::{ClosingHandler, ConnectionHandler, WorkerPool};
use crate::privilege::{IdentityOps, LibcIdentity, ListenerSpec, PrivilegeManager};
use crate::resolver::SuffixResolver;
use crate::security::{PemSecurityProvider, SecurityInitializer, SecurityOutcome, SecurityProvider};
use crate::CoreError;
use dirsrv_backend::{
    MaintenanceTaskRequest, PluginRegistry, TaskParams, LDBM_PLUGIN_NAME,
};
use dirsrv_config::{ConfigDirectory, ConfigError, ServerConfig, ServerSection};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const VENDOR: &str = "389 Project";

/// Collaborators the orchestrator drives. The defaults talk to the real
/// system; tests swap in fakes.
pub struct Services {
    pub identity: Arc<dyn IdentityOps>,
    pub security: Arc<dyn SecurityProvider>,
    /// Use this registry instead of building one from the configuration.
    pub registry: Option<PluginRegistry>,
    pub log_sink: Option<ErrorLogSink>,
    pub connections: Arc<dyn ConnectionHandler>,
}

impl Default for Services {
    fn default() -> Self {
        Self {
            identity: Arc::new(LibcIdentity),
            security: Arc::new(PemSecurityProvider::new(true)),
            registry: None,
            log_sink: None,
            connections: Arc::new(ClosingHandler),
        }
    }
}

pub struct Orchestrator {
    invocation: Invocation,
    services: Services,
    lifecycle: Arc<ProcessLifecycle>,
}

impl Orchestrator {
    pub fn new(invocation: Invocation, services: Services) -> Self {
        Self {
            invocation,
            services,
            lifecycle: Arc::new(ProcessLifecycle::new()),
        }
    }

    /// Shared lifecycle context; another thread may request shutdown
    /// through it.
    pub fn lifecycle(&self) -> Arc<ProcessLifecycle> {
        Arc::clone(&self.lifecycle)
    }

    pub fn run(mut self) -> Result<(), CoreError> {
        let mode = self.invocation.mode;
        debug!("starting in {mode} mode");
        let result = match mode {
            ExecutionMode::Unknown => Err(CoreError::Usage(general_usage("ns-slapd"))),
            ExecutionMode::PrintVersion if !self.invocation.full_version => {
                println!("{}", version_banner(&ServerSection::default()));
                Ok(())
            }
            m if m.runs_server() => self.run_server(),
            _ => self.run_offline(),
        };
        self.lifecycle.terminate();
        result
    }

    fn load_config(&mut self) -> Result<ServerConfig, CoreError> {
        let config = ServerConfig::load(&self.invocation.config_dir)?;
        self.lifecycle.advance(LifecycleState::ConfigLoaded)?;
        if let (Some(sink), Some(path)) = (&self.services.log_sink, &config.logs.error) {
            if let Err(e) = sink.attach_file(path) {
                warn!("cannot open error log {}: {e}", path.display());
            }
        }
        Ok(config)
    }

    fn registry(&mut self, config: &ServerConfig) -> Result<PluginRegistry, CoreError> {
        match self.services.registry.take() {
            Some(registry) => Ok(registry),
            None => Ok(PluginRegistry::from_config(config)?),
        }
    }

    fn run_server(&mut self) -> Result<(), CoreError> {
        let inv = self.invocation.clone();
        if let Some(path) = &inv.start_pid_file {
            daemon::write_start_marker(path);
        }
        daemon::debug_sleep_from_env();

        let mut config = self.load_config()?;
        let mut port_override = None;
        if inv.mode == ExecutionMode::Referral {
            let url = inv
                .referral_url
                .clone()
                .or_else(|| config.server.referral.clone())
                .ok_or_else(|| {
                    CoreError::Usage("refer: a referral URL (-r) is required".to_owned())
                })?;
            info!("referring all operations to {url}");
            config.server.referral = Some(url);
            config.apply_referral_defaults();
            port_override = inv.port;
        }

        let spec = ListenerSpec::from_config(&config, port_override)?;
        let identity = Arc::clone(&self.services.identity);
        let mut privilege = PrivilegeManager::new(identity.as_ref());
        let mut handles = privilege.bind_resources(&spec)?;
        self.lifecycle.advance(LifecycleState::ResourcesBound)?;

        privilege.drop_identity(
            config.server.local_user.as_deref(),
            &config.config_dir,
            &config.logs,
        )?;
        if !privilege.identity_dropped() && identity.current_uid() == 0 {
            warn!("no local user configured, the server keeps running as root");
        }
        self.lifecycle.advance(LifecycleState::IdentityDropped)?;

        let detach = daemon::should_detach(inv.debug);
        if detach {
            if let ForkOutcome::Parent { child } = daemon::fork_into_background()? {
                info!("server running in the background as pid {child}");
                handles.disown();
                return Ok(());
            }
        }

        let provider = Arc::clone(&self.services.security);
        match SecurityInitializer::new(provider.as_ref()).init(
            inv.mode,
            false,
            &mut config,
            Some(&mut handles),
        ) {
            SecurityOutcome::Enabled => info!("secure listener ready"),
            SecurityOutcome::Degraded(reason) => warn!("running without security: {reason}"),
            SecurityOutcome::Disabled => {}
        }
        self.lifecycle.advance(LifecycleState::SecurityReady)?;

        if detach {
            daemon::detach_terminal()?;
            if let Some(sink) = &self.services.log_sink {
                sink.detach_stderr();
            }
        }
        daemon::check_rundir(&config.server.rundir)?;

        let pool = WorkerPool::start(config.server.thread_number, Arc::clone(&self.lifecycle))?;
        let guard = InstanceGuard::acquire(&config.server.rundir, inv.mode, false, inv.skip_check)
            .inspect_err(|_| {
                warn!("shutting down due to possible conflicts with other processes");
            })?;
        if guard.is_empty() {
            warn!("instance lock not taken, conflicting tools will not be detected");
        }

        if handles.is_empty() {
            return Err(CoreError::Config(ConfigError::InvalidValue {
                field: "server.port",
                reason: "no port, secure port or local socket to listen on".to_owned(),
            }));
        }
        let listeners = pool.spawn_listeners(&mut handles, &self.services.connections)?;
        debug!("{listeners} accept loop(s) running");

        let pid_file = inv
            .pid_file
            .as_deref()
            .map(PidFile::create)
            .transpose()?
            .map(Arc::new);
        if let Some(pid_file) = &pid_file {
            let pid_file = Arc::clone(pid_file);
            let lifecycle = Arc::clone(&self.lifecycle);
            let every = Duration::from_secs(config.server.housekeeping_interval_secs.max(1));
            pool.spawn(async move {
                let mut ticker = tokio::time::interval(every);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        () = lifecycle.wait_for_shutdown() => break,
                        _ = ticker.tick() => {
                            pid_file.ensure_present();
                        }
                    }
                }
            });
        }

        let notifier = ServiceNotifier::from_env();
        if let Some(notifier) = &notifier {
            notifier.ready();
        }
        self.lifecycle.advance(LifecycleState::Running)?;
        info!(
            "{} B{} starting up in {} mode",
            config.server.version_string, config.server.build_number, inv.mode
        );

        pool.block_until_shutdown();
        self.lifecycle.advance(LifecycleState::ShuttingDown)?;
        info!("shutting down");
        if let Some(notifier) = &notifier {
            notifier.stopping();
        }
        pool.stop();
        if let Some(pid_file) = pid_file {
            debug!("removing pid file {}", pid_file.path().display());
        }
        drop(guard);
        Ok(())
    }

    fn run_offline(&mut self) -> Result<(), CoreError> {
        let inv = self.invocation.clone();
        let mut config = self.load_config()?;

        if let Some(user) = config.server.local_user.as_deref() {
            let identity = Arc::clone(&self.services.identity);
            let account = identity.lookup(user)?;
            if account.uid != identity.current_uid() {
                PrivilegeManager::new(identity.as_ref()).drop_identity(
                    Some(user),
                    &config.config_dir,
                    &config.logs,
                )?;
            }
        }

        let registry = self.registry(&config)?;
        let directory = ConfigDirectory::from_config(&config);

        match inv.mode {
            ExecutionMode::SuffixToInstance => return print_suffix_instances(&inv, &directory),
            ExecutionMode::PrintVersion => {
                print_full_version(&config, &registry);
                return Ok(());
            }
            _ => {}
        }

        if inv.encrypt_requested() {
            let provider = Arc::clone(&self.services.security);
            if let SecurityOutcome::Degraded(reason) =
                SecurityInitializer::new(provider.as_ref()).init(inv.mode, true, &mut config, None)
            {
                warn!("attribute encryption unavailable: {reason}");
            }
        }

        let requests = build_requests(&inv, &config, &directory)?;
        let mut dispatcher = Dispatcher::new(
            &registry,
            &directory,
            GuardSpec {
                rundir: config.server.rundir.clone(),
                mode: inv.mode,
                replication_dump: inv.replication_dump(),
                skip_check: inv.skip_check,
            },
        );
        dispatcher.run_batch(&requests)
    }
}

fn version_banner(server: &ServerSection) -> String {
    format!("{VENDOR}\n{} B{}", server.version_string, server.build_number)
}

fn print_full_version(config: &ServerConfig, registry: &PluginRegistry) {
    println!("{}", version_banner(&config.server));
    for plugin in registry.backends() {
        println!(
            "  {}: {} (task protocol {})",
            plugin.name(),
            plugin.version(),
            plugin.protocol_version()
        );
    }
}

fn print_suffix_instances(inv: &Invocation, directory: &ConfigDirectory) -> Result<(), CoreError> {
    if inv.include.is_empty() {
        return Err(CoreError::Usage(
            "suffix2instance: at least one suffix (-s) is required".to_owned(),
        ));
    }
    let resolver = SuffixResolver::new(directory);
    for suffix in &inv.include {
        let (suffixes, instances) = resolver.resolve_instances_for_suffix(suffix, false)?;
        eprintln!("Suffix, Instance name pair(s) under \"{suffix}\":");
        if instances.is_empty() {
            eprintln!("\tNo instance");
        }
        for (found, instance) in suffixes.iter().zip(&instances) {
            eprintln!("\tsuffix {found}; instance name \"{instance}\"");
        }
    }
    Ok(())
}

/// Targets named with `-n`, else those the `-s`/`-x` suffixes resolve to.
fn target_instances(
    inv: &Invocation,
    directory: &ConfigDirectory,
) -> Result<Vec<String>, CoreError> {
    if !inv.instances.is_empty() {
        return Ok(inv.instances.clone());
    }
    if inv.include.is_empty() {
        return Ok(Vec::new());
    }
    SuffixResolver::new(directory).resolve_instances(&inv.include, &inv.exclude)
}

fn single_instance(inv: &Invocation, directory: &ConfigDirectory) -> Result<String, CoreError> {
    let mut targets = target_instances(inv, directory)?;
    match targets.len() {
        0 => Err(CoreError::Usage(format!(
            "{}: a backend instance (-n) or included suffix (-s) is required",
            inv.mode
        ))),
        1 => Ok(targets.remove(0)),
        n => Err(CoreError::Usage(format!(
            "{}: {n} backend instances matched ({}); name exactly one with -n",
            inv.mode,
            targets.join(", ")
        ))),
    }
}

fn build_requests(
    inv: &Invocation,
    config: &ServerConfig,
    directory: &ConfigDirectory,
) -> Result<Vec<MaintenanceTaskRequest>, CoreError> {
    let task = inv
        .task
        .clone()
        .ok_or_else(|| CoreError::Usage(format!("{}: no task options given", inv.mode)))?;
    if inv.mode.task_kind() != Some(task.kind()) {
        return Err(CoreError::Usage(format!(
            "{} cannot run a {} task",
            inv.mode,
            task.kind()
        )));
    }

    let mut requests = match task {
        TaskParams::Export(mut opts) => {
            let targets = target_instances(inv, directory)?;
            if targets.is_empty() {
                return Err(CoreError::Resolution(
                    "no backend instance to export; use -n or -s".to_owned(),
                ));
            }
            if opts.include.is_empty() {
                opts.include.clone_from(&inv.include);
            }
            if opts.exclude.is_empty() {
                opts.exclude.clone_from(&inv.exclude);
            }
            opts.server_running = InstanceGuard::server_running(&config.server.rundir);
            export_requests(&targets, &opts, inv.quiet)
        }
        TaskParams::Import(mut opts) => {
            let instance = single_instance(inv, directory)?;
            if opts.include.is_empty() {
                opts.include.clone_from(&inv.include);
            }
            if opts.exclude.is_empty() {
                opts.exclude.clone_from(&inv.exclude);
            }
            vec![MaintenanceTaskRequest::for_instance(
                instance,
                TaskParams::Import(opts),
            )]
        }
        params @ TaskParams::Reindex(_) => {
            vec![MaintenanceTaskRequest::for_instance(
                single_instance(inv, directory)?,
                params,
            )]
        }
        TaskParams::UpgradeDnFormat(opts) => {
            if inv.instances.is_empty() {
                return Err(CoreError::Usage(
                    "upgradednformat: a backend instance (-n) is required".to_owned(),
                ));
            }
            inv.instances
                .iter()
                .map(|instance| {
                    let mut request = MaintenanceTaskRequest::for_plugin(
                        LDBM_PLUGIN_NAME,
                        TaskParams::UpgradeDnFormat(opts.clone()),
                    );
                    request.instance = Some(instance.clone());
                    request
                })
                .collect()
        }
        TaskParams::Verify(mut opts) => {
            if opts.instances.is_empty() {
                opts.instances.clone_from(&inv.instances);
            }
            vec![MaintenanceTaskRequest::for_plugin(
                LDBM_PLUGIN_NAME,
                TaskParams::Verify(opts),
            )]
        }
        params @ (TaskParams::Backup(_) | TaskParams::Restore(_) | TaskParams::Upgrade(_)) => {
            vec![MaintenanceTaskRequest::for_plugin(LDBM_PLUGIN_NAME, params)]
        }
    };

    for request in &mut requests {
        request.quiet = inv.quiet;
    }
    Ok(requests)
}
