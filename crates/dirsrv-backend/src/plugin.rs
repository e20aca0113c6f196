use crate::task::{
    ArchiveOptions, ExportOptions, ImportOptions, ReindexOptions, UpgradeDnFormatOptions,
    UpgradeOptions, VerifyOptions,
};
use crate::BackendError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Task protocol revision the dispatcher speaks. Plugins declaring an older
/// revision are refused before any capability is called.
pub const TASK_PROTOCOL_VERSION: u32 = 2;

pub const LDBM_PLUGIN_NAME: &str = "ldbm database";
pub const REPLICATION_PLUGIN_NAME: &str = "Multimaster Replication Plugin";

pub type TaskResult = Result<(), BackendError>;

pub trait Importer {
    fn import(&self, instance: &str, opts: &ImportOptions) -> TaskResult;
}

pub trait Exporter {
    fn export(&self, instance: &str, opts: &ExportOptions) -> TaskResult;
}

pub trait Reindexer {
    fn reindex(&self, instance: &str, opts: &ReindexOptions) -> TaskResult;
}

pub trait Archiver {
    fn backup(&self, opts: &ArchiveOptions) -> TaskResult;

    fn restore(&self, opts: &ArchiveOptions) -> TaskResult;
}

pub trait Upgrader {
    fn upgrade(&self, opts: &UpgradeOptions) -> TaskResult;

    fn upgrade_dn_format(&self, instance: &str, opts: &UpgradeDnFormatOptions) -> TaskResult;
}

pub trait Verifier {
    fn verify(&self, opts: &VerifyOptions) -> TaskResult;
}

/// A database backend plugin. Capabilities are optional: a plugin returns
/// `Some` only for the maintenance tasks it implements.
pub trait BackendPlugin: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    fn protocol_version(&self) -> u32;

    /// Instances this plugin serves.
    fn instances(&self) -> Vec<String>;

    fn importer(&self) -> Option<&dyn Importer> {
        None
    }

    fn exporter(&self) -> Option<&dyn Exporter> {
        None
    }

    fn reindexer(&self) -> Option<&dyn Reindexer> {
        None
    }

    fn archiver(&self) -> Option<&dyn Archiver> {
        None
    }

    fn upgrader(&self) -> Option<&dyn Upgrader> {
        None
    }

    fn verifier(&self) -> Option<&dyn Verifier> {
        None
    }
}

/// What a running plugin subsystem offers the service plugins it starts.
pub trait PluginHost {
    /// Queue `event` for the event thread. `false` once the queue is closed.
    fn schedule(&self, event: Box<dyn FnOnce() + Send>) -> bool;

    /// Open a persistent search rooted at `base`. Closed when the host stops.
    fn register_persistent_search(&self, base: &str);
}

/// A non-database plugin that only takes part in start/stop ordering.
pub trait ServicePlugin: Send + Sync {
    fn name(&self) -> &str;

    fn start(&self, host: &dyn PluginHost) -> TaskResult;

    fn stop(&self);

    fn is_running(&self) -> bool;
}

/// Service plugin declared with `kind = "service"` in `dse.toml`.
pub struct ConfiguredService {
    name: String,
    persistent_searches: Vec<String>,
    running: Arc<AtomicBool>,
}

impl ConfiguredService {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            persistent_searches: Vec::new(),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Bases of the persistent searches opened on every start.
    #[must_use]
    pub fn with_persistent_searches(mut self, bases: Vec<String>) -> Self {
        self.persistent_searches = bases;
        self
    }
}

impl ServicePlugin for ConfiguredService {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&self, host: &dyn PluginHost) -> TaskResult {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("plugin '{}' already started", self.name);
            return Ok(());
        }
        for base in &self.persistent_searches {
            host.register_persistent_search(base);
        }
        let name = self.name.clone();
        let running = Arc::clone(&self.running);
        let queued = host.schedule(Box::new(move || {
            if running.load(Ordering::SeqCst) {
                debug!("plugin '{name}' is up");
            }
        }));
        if !queued {
            self.running.store(false, Ordering::SeqCst);
            return Err(BackendError::PluginConfig {
                plugin: self.name.clone(),
                reason: "event queue is closed".to_owned(),
            });
        }
        info!("started plugin '{}'", self.name);
        Ok(())
    }

    fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!("stopped plugin '{}'", self.name);
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
