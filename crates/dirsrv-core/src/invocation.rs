use crate::mode::ExecutionMode;
use dirsrv_backend::TaskParams;
use std::path::PathBuf;

/// A parsed command line, independent of the flag grammar that produced it.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub mode: ExecutionMode,
    pub config_dir: PathBuf,
    /// Any `-d` was given: stay in the foreground and log verbosely.
    pub debug: bool,
    /// `-S`: skip the conflict check against other processes.
    pub skip_check: bool,
    pub quiet: bool,
    /// Backend instances named with `-n`.
    pub instances: Vec<String>,
    /// Suffixes to include (`-s`) and exclude (`-x`).
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    /// Options for the backend capability an offline mode drives.
    pub task: Option<TaskParams>,
    pub pid_file: Option<PathBuf>,
    /// Written as early as possible, before the configuration is read.
    pub start_pid_file: Option<PathBuf>,
    pub referral_url: Option<String>,
    pub port: Option<u16>,
    /// Print plugin versions along with the server version.
    pub full_version: bool,
}

impl Invocation {
    pub fn new(mode: ExecutionMode, config_dir: impl Into<PathBuf>) -> Self {
        Self {
            mode,
            config_dir: config_dir.into(),
            debug: false,
            skip_check: false,
            quiet: false,
            instances: Vec::new(),
            include: Vec::new(),
            exclude: Vec::new(),
            task: None,
            pid_file: None,
            start_pid_file: None,
            referral_url: None,
            port: None,
            full_version: false,
        }
    }

    #[must_use]
    pub fn with_task(mut self, task: TaskParams) -> Self {
        self.task = Some(task);
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
    pub fn with_include<I, S>(mut self, suffixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.include = suffixes.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_exclude<I, S>(mut self, suffixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude = suffixes.into_iter().map(Into::into).collect();
        self
    }

    /// Export with `-r`: needs the replication plugin and exclusive access.
    pub fn replication_dump(&self) -> bool {
        matches!(&self.task, Some(TaskParams::Export(opts)) if opts.replica)
    }

    pub fn encrypt_requested(&self) -> bool {
        self.task.as_ref().is_some_and(TaskParams::wants_encryption)
    }
}
