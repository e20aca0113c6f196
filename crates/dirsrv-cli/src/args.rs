//! One flag grammar per execution mode. Every parser lands in the same
//! `Invocation`, so the core never sees which flags produced it.

use crate::debug_level::{self, DebugRequest};
use clap::{Args, CommandFactory, Parser};
use dirsrv_backend::{
    ArchiveOptions, ExportOptions, ImportOptions, IndexTarget, ReindexOptions, TaskParams,
    UniqueIdStrategy, UpgradeDnFormatOptions, UpgradeOptions, VerifyOptions,
};
use dirsrv_core::{ExecutionMode, Invocation};
use std::path::{Path, PathBuf};

/// What the command line asked for.
#[derive(Debug)]
pub enum Parsed {
    Run {
        invocation: Invocation,
        /// `-d` mask, when given.
        debug: Option<u32>,
    },
    /// `-d ?`: print the level table.
    DebugHelp,
}

#[derive(Debug)]
pub enum CliError {
    /// Rejected by the flag grammar, including `--help`.
    Clap(clap::Error),
    /// Parsed, but not a usable combination.
    Usage { message: String, usage: String },
    /// Bad `-d` argument.
    Debug(String),
}

impl From<clap::Error> for CliError {
    fn from(e: clap::Error) -> Self {
        Self::Clap(e)
    }
}

#[derive(Debug, Clone, Args)]
struct Common {
    /// Configuration directory holding dse.toml.
    #[arg(short = 'D', value_name = "configdir")]
    config_dir: Option<PathBuf>,
    /// Debug level: names or numbers joined with '+'; '?' lists them.
    #[arg(short = 'd', value_name = "debuglevel")]
    debug: Option<String>,
    /// Print the server version and exit.
    #[arg(short = 'v')]
    version: bool,
}

trait ModeArgs: Parser {
    fn common(&self) -> &Common;

    fn into_invocation(self, config_dir: PathBuf) -> Result<Invocation, String>;
}

#[derive(Debug, Parser)]
#[command(
    name = "ns-slapd",
    disable_version_flag = true,
    override_usage = "ns-slapd -D configdir [-d debuglevel] [-i pidlogfile] [-v] [-V]"
)]
struct ServerArgs {
    #[command(flatten)]
    common: Common,
    /// Pid file written once the server is running.
    #[arg(short = 'i', value_name = "pidlogfile")]
    pid_file: Option<PathBuf>,
    /// Pid file written as early as possible during startup.
    #[arg(short = 'w', value_name = "startpidfile")]
    start_pid_file: Option<PathBuf>,
    /// Skip the check for processes running in conflicting modes.
    #[arg(short = 'S')]
    skip_check: bool,
    /// Print the server and plugin versions and exit.
    #[arg(short = 'V')]
    full_version: bool,
}

impl ModeArgs for ServerArgs {
    fn common(&self) -> &Common {
        &self.common
    }

    fn into_invocation(self, config_dir: PathBuf) -> Result<Invocation, String> {
        if self.full_version {
            let mut inv = Invocation::new(ExecutionMode::PrintVersion, config_dir);
            inv.full_version = true;
            return Ok(inv);
        }
        let mut inv = Invocation::new(ExecutionMode::Server, config_dir);
        inv.pid_file = self.pid_file.as_deref().map(absolute);
        inv.start_pid_file = self.start_pid_file.as_deref().map(absolute);
        inv.skip_check = self.skip_check;
        Ok(inv)
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "ns-slapd refer",
    disable_version_flag = true,
    override_usage = "ns-slapd refer -D configdir -r referral-url [-p port] [-w startpidfile]"
)]
struct ReferArgs {
    #[command(flatten)]
    common: Common,
    /// Port to listen on instead of the configured one.
    #[arg(short = 'p', value_name = "port")]
    port: Option<u16>,
    /// URL every operation is referred to.
    #[arg(short = 'r', value_name = "referral-url")]
    referral_url: Option<String>,
    /// Pid file written as early as possible during startup.
    #[arg(short = 'w', value_name = "startpidfile")]
    start_pid_file: Option<PathBuf>,
    #[arg(short = 'S')]
    skip_check: bool,
}

impl ModeArgs for ReferArgs {
    fn common(&self) -> &Common {
        &self.common
    }

    fn into_invocation(self, config_dir: PathBuf) -> Result<Invocation, String> {
        if self.referral_url.is_none() {
            return Err("a referral URL (-r) is required".to_owned());
        }
        let mut inv = Invocation::new(ExecutionMode::Referral, config_dir);
        inv.port = self.port;
        inv.referral_url = self.referral_url;
        inv.start_pid_file = self.start_pid_file.as_deref().map(absolute);
        inv.skip_check = self.skip_check;
        Ok(inv)
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "ns-slapd ldif2db",
    disable_version_flag = true,
    override_usage = "ns-slapd ldif2db -D configdir [-d debuglevel] [-n backend_instance_name] \
                      [-O] [-g uniqueid_type] [-G namespaceid] [{-s includesuffix}*] \
                      [{-x excludesuffix}*] [-E] [-q] {-i ldif-file}*\n\
                      Note: either \"-n backend_instance_name\" or \"-s includesuffix\" is required."
)]
struct Ldif2dbArgs {
    #[command(flatten)]
    common: Common,
    /// LDIF file to import; absolute path, or '-' for standard input.
    #[arg(short = 'i', value_name = "ldif-file")]
    ldif: Vec<String>,
    #[arg(short = 'n', value_name = "backend_instance_name")]
    instance: Option<String>,
    #[arg(short = 's', value_name = "includesuffix")]
    include: Vec<String>,
    #[arg(short = 'x', value_name = "excludesuffix")]
    exclude: Vec<String>,
    /// Unique id generation: none, deterministic, or time.
    #[arg(short = 'g', value_name = "uniqueid_type")]
    unique_id: Option<String>,
    /// Namespace id for deterministic unique ids.
    #[arg(short = 'G', long = "namespaceid", value_name = "namespaceid")]
    namespace_id: Option<String>,
    /// Do not build attribute indexes.
    #[arg(short = 'O')]
    no_attr_indexes: bool,
    /// Obsolete; accepted and ignored.
    #[arg(short = 'N', hide = true)]
    _obsolete_n: bool,
    /// Obsolete; accepted and ignored.
    #[arg(short = 'C', hide = true)]
    _obsolete_c: bool,
    /// Merge chunk size for large imports.
    #[arg(short = 'c', value_name = "chunk")]
    chunk: Option<u64>,
    /// Encrypt attributes configured for encryption.
    #[arg(short = 'E')]
    encrypt: bool,
    #[arg(short = 'q')]
    quiet: bool,
    #[arg(short = 'S')]
    skip_check: bool,
    #[arg(short = 'Z', hide = true)]
    _ignored_z: bool,
}

impl ModeArgs for Ldif2dbArgs {
    fn common(&self) -> &Common {
        &self.common
    }

    fn into_invocation(self, config_dir: PathBuf) -> Result<Invocation, String> {
        if let Some(relative) = self.ldif.iter().find(|f| *f != "-" && !f.starts_with('/')) {
            return Err(format!(
                "{relative} file could not be opened: absolute path required"
            ));
        }
        if self.ldif.is_empty() {
            return Err("at least one LDIF file (-i) is required".to_owned());
        }
        let unique_id = self
            .unique_id
            .as_deref()
            .map_or(UniqueIdStrategy::TimeBased, UniqueIdStrategy::from_arg);
        let opts = ImportOptions {
            inputs: self.ldif.iter().map(PathBuf::from).collect(),
            include: self.include.clone(),
            exclude: self.exclude.clone(),
            no_attr_indexes: self.no_attr_indexes,
            unique_id,
            namespace_id: self.namespace_id,
            encrypt: self.encrypt,
            merge_chunk_size: self.chunk,
        };
        let mut inv = Invocation::new(ExecutionMode::Import, config_dir)
            .with_task(TaskParams::Import(opts))
            .with_instances(self.instance)
            .with_include(self.include)
            .with_exclude(self.exclude);
        inv.quiet = self.quiet;
        inv.skip_check = self.skip_check;
        Ok(inv)
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "ns-slapd db2ldif",
    disable_version_flag = true,
    override_usage = "ns-slapd db2ldif -D configdir [-n backend-instance-name] [-d debuglevel] \
                      [-N] [-a outputfile] [-r] [-C] [{-s includesuffix}*] [{-x excludesuffix}*] \
                      [-u] [-U] [-m] [-M] [-E] [-q]\n\
                      Note: either \"-n backend_instance_name\" or \"-s includesuffix\" is required."
)]
struct Db2ldifArgs {
    #[command(flatten)]
    common: Common,
    #[arg(short = 'n', value_name = "backend-instance-name")]
    instances: Vec<String>,
    /// Output file; '-' for standard output.
    #[arg(short = 'a', value_name = "outputfile")]
    output: Option<PathBuf>,
    #[arg(short = 's', value_name = "includesuffix")]
    include: Vec<String>,
    #[arg(short = 'x', value_name = "excludesuffix")]
    exclude: Vec<String>,
    /// Export with replication state, for initializing a replica.
    #[arg(short = 'r')]
    replica: bool,
    /// Do not export unique ids.
    #[arg(short = 'u')]
    no_unique_id: bool,
    /// Do not wrap long lines.
    #[arg(short = 'U')]
    no_wrap: bool,
    /// Minimal base64 encoding.
    #[arg(short = 'm')]
    minimal_encoding: bool,
    /// One output file per instance, named <instance>_<file>.
    #[arg(short = 'M')]
    multiple_files: bool,
    /// All instances into the one output file.
    #[arg(short = 'o')]
    one_file: bool,
    /// Omit the LDIF version line.
    #[arg(short = '1')]
    no_version: bool,
    /// Read only the main database file.
    #[arg(short = 'C')]
    id2entry_only: bool,
    /// Do not print entry ids.
    #[arg(short = 'N')]
    no_entry_ids: bool,
    /// Decrypt encrypted attributes.
    #[arg(short = 'E')]
    decrypt: bool,
    #[arg(short = 'q')]
    quiet: bool,
    #[arg(short = 'S')]
    skip_check: bool,
}

impl ModeArgs for Db2ldifArgs {
    fn common(&self) -> &Common {
        &self.common
    }

    fn into_invocation(self, config_dir: PathBuf) -> Result<Invocation, String> {
        if self.instances.is_empty() && self.include.is_empty() {
            return Err(
                "either \"-n backend_instance_name\" or \"-s includesuffix\" is required"
                    .to_owned(),
            );
        }
        let opts = ExportOptions {
            output: self.output.map(|out| {
                if out.as_os_str() == "-" {
                    out
                } else {
                    absolute(&out)
                }
            }),
            include: self.include.clone(),
            exclude: self.exclude.clone(),
            encrypt: self.decrypt,
            replica: self.replica,
            dump_unique_id: !self.no_unique_id,
            print_key: !self.no_entry_ids,
            no_wrap: self.no_wrap,
            minimal_encoding: self.minimal_encoding,
            append_mode: self.one_file || !self.multiple_files,
            append_first: true,
            no_version: self.no_version,
            id2entry_only: self.id2entry_only,
            server_running: false,
        };
        let mut inv = Invocation::new(ExecutionMode::Export, config_dir)
            .with_task(TaskParams::Export(opts))
            .with_instances(self.instances)
            .with_include(self.include)
            .with_exclude(self.exclude);
        inv.quiet = self.quiet;
        inv.skip_check = self.skip_check;
        Ok(inv)
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "ns-slapd db2index",
    disable_version_flag = true,
    override_usage = "ns-slapd db2index -D configdir -n backend-instance-name [-d debuglevel] \
                      {-t attributetype}* {-T VLV Search Name}*"
)]
struct Db2indexArgs {
    #[command(flatten)]
    common: Common,
    #[arg(short = 'n', value_name = "backend-instance-name")]
    instance: Option<String>,
    #[arg(short = 's', value_name = "includesuffix")]
    include: Vec<String>,
    #[arg(short = 'x', value_name = "excludesuffix")]
    exclude: Vec<String>,
    /// Attribute to reindex.
    #[arg(short = 't', value_name = "attributetype")]
    attributes: Vec<String>,
    /// VLV index to rebuild.
    #[arg(short = 'T', value_name = "VLV Search Name")]
    vlv: Vec<String>,
    #[arg(short = 'S')]
    skip_check: bool,
}

impl ModeArgs for Db2indexArgs {
    fn common(&self) -> &Common {
        &self.common
    }

    fn into_invocation(self, config_dir: PathBuf) -> Result<Invocation, String> {
        let targets = self
            .attributes
            .into_iter()
            .map(IndexTarget::Attribute)
            .chain(self.vlv.into_iter().map(IndexTarget::Vlv))
            .collect();
        let mut inv = Invocation::new(ExecutionMode::Reindex, config_dir)
            .with_task(TaskParams::Reindex(ReindexOptions { targets }))
            .with_instances(self.instance)
            .with_include(self.include)
            .with_exclude(self.exclude);
        inv.skip_check = self.skip_check;
        Ok(inv)
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "ns-slapd db2archive",
    disable_version_flag = true,
    override_usage = "ns-slapd db2archive -D configdir [-q] [-d debuglevel] -a archivedir"
)]
struct Db2archiveArgs {
    #[command(flatten)]
    common: Common,
    #[arg(short = 'a', value_name = "archivedir")]
    archive_dir: Option<PathBuf>,
    /// Accepted and ignored.
    #[arg(short = 'i', hide = true)]
    _ignored_i: Option<String>,
    #[arg(short = 'q')]
    quiet: bool,
    #[arg(short = 'S')]
    skip_check: bool,
}

impl ModeArgs for Db2archiveArgs {
    fn common(&self) -> &Common {
        &self.common
    }

    fn into_invocation(self, config_dir: PathBuf) -> Result<Invocation, String> {
        let opts = ArchiveOptions {
            archive_dir: self.archive_dir.as_deref().map(absolute),
            instance: None,
        };
        let mut inv = Invocation::new(ExecutionMode::Backup, config_dir)
            .with_task(TaskParams::Backup(opts));
        inv.quiet = self.quiet;
        inv.skip_check = self.skip_check;
        Ok(inv)
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "ns-slapd archive2db",
    disable_version_flag = true,
    override_usage = "ns-slapd archive2db -D configdir [-q] [-d debuglevel] -a archivedir"
)]
struct Archive2dbArgs {
    #[command(flatten)]
    common: Common,
    #[arg(short = 'a', value_name = "archivedir")]
    archive_dir: Option<PathBuf>,
    /// Restore only this backend instance.
    #[arg(short = 'n', value_name = "backend-instance-name")]
    instance: Option<String>,
    #[arg(short = 'i', hide = true)]
    _ignored_i: Option<String>,
    #[arg(short = 'q')]
    quiet: bool,
    #[arg(short = 'S')]
    skip_check: bool,
}

impl ModeArgs for Archive2dbArgs {
    fn common(&self) -> &Common {
        &self.common
    }

    fn into_invocation(self, config_dir: PathBuf) -> Result<Invocation, String> {
        let opts = ArchiveOptions {
            archive_dir: self.archive_dir.as_deref().map(absolute),
            instance: self.instance,
        };
        let mut inv = Invocation::new(ExecutionMode::Restore, config_dir)
            .with_task(TaskParams::Restore(opts));
        inv.quiet = self.quiet;
        inv.skip_check = self.skip_check;
        Ok(inv)
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "ns-slapd upgradedb",
    disable_version_flag = true,
    override_usage = "ns-slapd upgradedb -D configdir [-d debuglevel] [-f] [-r] -a archivedir"
)]
struct UpgradedbArgs {
    #[command(flatten)]
    common: Common,
    #[arg(short = 'a', value_name = "archivedir")]
    archive_dir: Option<PathBuf>,
    /// Upgrade even when the database looks current.
    #[arg(short = 'f')]
    force: bool,
    /// Convert entry DNs to the RDN format.
    #[arg(short = 'r')]
    dn2rdn: bool,
}

impl ModeArgs for UpgradedbArgs {
    fn common(&self) -> &Common {
        &self.common
    }

    fn into_invocation(self, config_dir: PathBuf) -> Result<Invocation, String> {
        let opts = UpgradeOptions {
            archive_dir: self.archive_dir.as_deref().map(absolute),
            force: self.force,
            dn2rdn: self.dn2rdn,
        };
        Ok(Invocation::new(ExecutionMode::Upgrade, config_dir).with_task(TaskParams::Upgrade(opts)))
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "ns-slapd upgradednformat",
    disable_version_flag = true,
    override_usage = "ns-slapd upgradednformat -D configdir [-d debuglevel] [-N] \
                      -n backend-instance-name -a fullpath-backend-instance-dir-full"
)]
struct UpgradednformatArgs {
    #[command(flatten)]
    common: Common,
    #[arg(short = 'n', value_name = "backend-instance-name")]
    instances: Vec<String>,
    #[arg(short = 'a', value_name = "fullpath-backend-instance-dir-full")]
    instance_dir: Option<PathBuf>,
    /// Report what would change without writing.
    #[arg(short = 'N')]
    dry_run: bool,
}

impl ModeArgs for UpgradednformatArgs {
    fn common(&self) -> &Common {
        &self.common
    }

    fn into_invocation(self, config_dir: PathBuf) -> Result<Invocation, String> {
        if self.instances.is_empty() || self.instance_dir.is_none() {
            return Err("both -n and -a are required".to_owned());
        }
        let opts = UpgradeDnFormatOptions {
            instance_dir: self.instance_dir.as_deref().map(absolute),
            dry_run: self.dry_run,
        };
        Ok(Invocation::new(ExecutionMode::UpgradeDnFormat, config_dir)
            .with_task(TaskParams::UpgradeDnFormat(opts))
            .with_instances(self.instances))
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "ns-slapd dbverify",
    disable_version_flag = true,
    override_usage = "ns-slapd dbverify -D configdir [-d debuglevel] [-n backend-instance-name] \
                      [-a db-directory]"
)]
struct DbverifyArgs {
    #[command(flatten)]
    common: Common,
    #[arg(short = 'n', value_name = "backend-instance-name")]
    instances: Vec<String>,
    #[arg(short = 'a', value_name = "db-directory")]
    db_dir: Option<PathBuf>,
    /// Report every page checked.
    #[arg(short = 'V')]
    verbose: bool,
}

impl ModeArgs for DbverifyArgs {
    fn common(&self) -> &Common {
        &self.common
    }

    fn into_invocation(self, config_dir: PathBuf) -> Result<Invocation, String> {
        let opts = VerifyOptions {
            instances: self.instances.clone(),
            verbose: self.verbose,
            db_dir: self.db_dir.as_deref().map(absolute),
        };
        Ok(Invocation::new(ExecutionMode::Verify, config_dir)
            .with_task(TaskParams::Verify(opts))
            .with_instances(self.instances))
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "ns-slapd suffix2instance",
    disable_version_flag = true,
    override_usage = "ns-slapd suffix2instance -D configdir {-s suffix}*"
)]
struct Suffix2instanceArgs {
    #[command(flatten)]
    common: Common,
    #[arg(short = 's', value_name = "suffix")]
    suffixes: Vec<String>,
}

impl ModeArgs for Suffix2instanceArgs {
    fn common(&self) -> &Common {
        &self.common
    }

    fn into_invocation(self, config_dir: PathBuf) -> Result<Invocation, String> {
        if self.suffixes.is_empty() {
            return Err("at least one suffix (-s) is required".to_owned());
        }
        Ok(Invocation::new(ExecutionMode::SuffixToInstance, config_dir)
            .with_include(self.suffixes))
    }
}

/// Parse the flags that follow the mode selection. `flags` excludes the
/// program name and any mode token.
pub fn parse(mode: ExecutionMode, flags: &[String]) -> Result<Parsed, CliError> {
    match mode {
        ExecutionMode::Server | ExecutionMode::PrintVersion | ExecutionMode::Unknown => {
            parse_mode::<ServerArgs>(flags)
        }
        ExecutionMode::Referral => parse_mode::<ReferArgs>(flags),
        ExecutionMode::Import => parse_mode::<Ldif2dbArgs>(flags),
        ExecutionMode::Export => parse_mode::<Db2ldifArgs>(flags),
        ExecutionMode::Reindex => parse_mode::<Db2indexArgs>(flags),
        ExecutionMode::Backup => parse_mode::<Db2archiveArgs>(flags),
        ExecutionMode::Restore => parse_mode::<Archive2dbArgs>(flags),
        ExecutionMode::Upgrade => parse_mode::<UpgradedbArgs>(flags),
        ExecutionMode::UpgradeDnFormat => parse_mode::<UpgradednformatArgs>(flags),
        ExecutionMode::Verify => parse_mode::<DbverifyArgs>(flags),
        ExecutionMode::SuffixToInstance => parse_mode::<Suffix2instanceArgs>(flags),
    }
}

/// Usage text of `mode`, as printed with its parse errors.
pub fn usage_for(mode: ExecutionMode) -> String {
    match mode {
        ExecutionMode::Server | ExecutionMode::PrintVersion | ExecutionMode::Unknown => {
            usage::<ServerArgs>()
        }
        ExecutionMode::Referral => usage::<ReferArgs>(),
        ExecutionMode::Import => usage::<Ldif2dbArgs>(),
        ExecutionMode::Export => usage::<Db2ldifArgs>(),
        ExecutionMode::Reindex => usage::<Db2indexArgs>(),
        ExecutionMode::Backup => usage::<Db2archiveArgs>(),
        ExecutionMode::Restore => usage::<Archive2dbArgs>(),
        ExecutionMode::Upgrade => usage::<UpgradedbArgs>(),
        ExecutionMode::UpgradeDnFormat => usage::<UpgradednformatArgs>(),
        ExecutionMode::Verify => usage::<DbverifyArgs>(),
        ExecutionMode::SuffixToInstance => usage::<Suffix2instanceArgs>(),
    }
}

fn usage<T: ModeArgs>() -> String {
    T::command().render_usage().to_string()
}

fn parse_mode<T: ModeArgs>(flags: &[String]) -> Result<Parsed, CliError> {
    let usage = usage::<T>;
    let args = T::try_parse_from(std::iter::once("ns-slapd").chain(flags.iter().map(String::as_str)))?;

    let common = args.common().clone();
    let debug = match common.debug.as_deref().map(debug_level::parse).transpose() {
        Ok(Some(DebugRequest::Help)) => return Ok(Parsed::DebugHelp),
        Ok(Some(DebugRequest::Level(level))) => Some(level),
        Ok(None) => None,
        Err(message) => return Err(CliError::Debug(message)),
    };

    let config_dir = common.config_dir.as_deref().map(absolute);
    if common.version {
        let mut invocation = Invocation::new(
            ExecutionMode::PrintVersion,
            config_dir.unwrap_or_default(),
        );
        invocation.debug = debug.is_some();
        return Ok(Parsed::Run { invocation, debug });
    }
    let config_dir = config_dir.ok_or_else(|| CliError::Usage {
        message: "the configuration directory (-D configdir) is required".to_owned(),
        usage: usage(),
    })?;

    let mut invocation = args
        .into_invocation(config_dir)
        .map_err(|message| CliError::Usage {
            message,
            usage: usage(),
        })?;
    invocation.debug = debug.is_some();
    Ok(Parsed::Run { invocation, debug })
}

/// Relative paths are taken from the current directory.
fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}
