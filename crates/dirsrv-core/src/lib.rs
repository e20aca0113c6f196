//! Process control plane for the dirsrv directory server.
//!
//! This crate takes a parsed `Invocation` from program start to either a
//! running network service or a one-shot offline maintenance task against a
//! backend plugin, and back down to termination. It owns the lifecycle state
//! machine, the cross-process conflict guard, suffix-to-instance resolution,
//! the maintenance task dispatcher, privilege transition, security
//! initialization, the tokio-backed worker pool with its signal jobs, and the
//! daemon plumbing (fork, detach, pid files, service-manager notification).

pub mod concurrency;
pub mod daemon;
pub mod dispatcher;
pub mod invocation;
pub mod lifecycle;
pub mod logging;
pub mod mode;
pub mod orchestrator;
pub mod pool;
pub mod privilege;
pub mod resolver;
pub mod security;

pub use concurrency::{InstanceGuard, LockPlan};
pub use dispatcher::{Dispatcher, GuardSpec, PluginSubsystem};
pub use invocation::Invocation;
pub use lifecycle::{validate_transition, LifecycleState, ProcessLifecycle, ShutdownState};
pub use logging::ErrorLogSink;
pub use mode::ExecutionMode;
pub use orchestrator::{Orchestrator, Services};
pub use pool::{
    ClosingHandler, Connection, ConnectionHandler, SignalAction, SignalJob, WorkerPool,
    SIGNAL_JOBS,
};
pub use privilege::{
    Account, BoundHandles, IdentityOps, LibcIdentity, ListenerSpec, PrivilegeManager,
    PRIVILEGED_PORT_LIMIT,
};
pub use resolver::SuffixResolver;
pub use security::{PemSecurityProvider, SecurityInitializer, SecurityOutcome, SecurityProvider};

use dirsrv_backend::{BackendError, TaskKind};
use dirsrv_config::ConfigError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("{0}")]
    Usage(String),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to bind {what}: {source}")]
    ResourceBind {
        what: String,
        #[source]
        source: std::io::Error,
    },
    #[error("privilege transition failed: {0}")]
    PrivilegeTransition(String),
    #[error("security subsystem error: {0}")]
    Security(String),
    #[error("conflicting process: {0}")]
    Conflict(String),
    #[error("could not resolve {0}")]
    Resolution(String),
    #[error("backend not found: {0}")]
    BackendNotFound(String),
    #[error("plugin '{plugin}' is too old to do {kind} (task protocol {found}, need {required})")]
    PluginTooOld {
        plugin: String,
        kind: TaskKind,
        found: u32,
        required: u32,
    },
    #[error("no {function} function defined for backend '{plugin}'")]
    MissingCapability {
        plugin: String,
        function: &'static str,
    },
    #[error("{kind} of '{target}' failed: {source}")]
    Task {
        kind: TaskKind,
        target: String,
        #[source]
        source: BackendError,
    },
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
    #[error("worker pool error: {0}")]
    Pool(String),
    #[error("invalid lifecycle transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Process exit status for this error. Backend codes in `1..=255` are
    /// reported verbatim, anything else is a generic `1`.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Task { source, .. } | Self::Backend(source) => u8::try_from(source.code())
                .ok()
                .filter(|code| *code != 0)
                .unwrap_or(1),
            _ => 1,
        }
    }

    pub fn is_usage(&self) -> bool {
        matches!(self, Self::Usage(_))
    }
}
