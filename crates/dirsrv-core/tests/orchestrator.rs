use dirsrv_backend::{ExportOptions, ImportOptions, MockBackend, PluginRegistry, TaskParams};
use dirsrv_core::{
    Account, CoreError, ErrorLogSink, ExecutionMode, IdentityOps, InstanceGuard, Invocation,
    LifecycleState, Orchestrator, ProcessLifecycle, Services,
};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Identity calls that succeed without touching the real process.
struct Unprivileged;

impl IdentityOps for Unprivileged {
    fn current_uid(&self) -> u32 {
        1000
    }

    fn lookup(&self, user: &str) -> Result<Account, CoreError> {
        Ok(Account {
            name: user.to_owned(),
            uid: 1000,
            gid: 1000,
        })
    }

    fn chown(&self, _path: &Path, _uid: Option<u32>, _gid: Option<u32>) -> io::Result<()> {
        Ok(())
    }

    fn set_gid(&self, _gid: u32) -> io::Result<()> {
        Ok(())
    }

    fn set_uid(&self, _uid: u32) -> io::Result<()> {
        Ok(())
    }
}

struct Install {
    dir: tempfile::TempDir,
}

impl Install {
    fn new(extra_server: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("config")).unwrap();
        fs::create_dir_all(root.join("run")).unwrap();
        let dse = format!(
            r#"
[server]
port = 0
secure_port = 0
thread_number = 2
housekeeping_interval_secs = 1
rundir = "{run}"
{extra_server}

[logs]
error = "{logs}/errors"

[[mapping_tree]]
suffix = "dc=example,dc=com"
backend = "userRoot"

[[mapping_tree]]
suffix = "ou=groups,dc=example,dc=com"
backend = "groupRoot"

[[mapping_tree]]
suffix = "o=netscaperoot"
backend = "NetscapeRoot"

[[plugin]]
name = "ldbm database"
kind = "mock"
instances = ["userRoot", "groupRoot", "NetscapeRoot"]
"#,
            run = root.join("run").display(),
            logs = root.join("logs").display(),
        );
        fs::write(root.join("config").join("dse.toml"), dse).unwrap();
        Self { dir }
    }

    fn config_dir(&self) -> PathBuf {
        self.dir.path().join("config")
    }

    fn rundir(&self) -> PathBuf {
        self.dir.path().join("run")
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

fn services(mock: Option<&Arc<MockBackend>>) -> Services {
    let registry = mock.map(|mock| {
        let mut registry = PluginRegistry::new();
        registry.register_backend(mock.clone());
        registry
    });
    Services {
        identity: Arc::new(Unprivileged),
        registry,
        log_sink: Some(ErrorLogSink::new()),
        ..Services::default()
    }
}

fn mock() -> Arc<MockBackend> {
    Arc::new(
        MockBackend::new("ldbm database").with_instances(["userRoot", "groupRoot", "NetscapeRoot"]),
    )
}

#[test]
fn offline_export_runs_every_instance_without_a_pool() {
    let install = Install::new("");
    let mock = mock();
    let inv = Invocation::new(ExecutionMode::Export, install.config_dir())
        .with_task(TaskParams::Export(ExportOptions {
            output: Some(install.path("dump.ldif")),
            ..ExportOptions::default()
        }))
        .with_instances(["userRoot", "NetscapeRoot"]);

    let orchestrator = Orchestrator::new(inv, services(Some(&mock)));
    let lifecycle = orchestrator.lifecycle();
    orchestrator.run().unwrap();

    let instances: Vec<_> = mock
        .invocations()
        .into_iter()
        .filter_map(|i| i.instance)
        .collect();
    assert_eq!(instances, vec!["userRoot", "NetscapeRoot"]);
    assert_eq!(lifecycle.pools_started(), 0);
    assert_eq!(lifecycle.state(), LifecycleState::Terminated);
}

#[test]
fn offline_batch_reports_the_failing_backend_code() {
    let install = Install::new("");
    let mock = Arc::new(
        MockBackend::new("ldbm database")
            .with_instances(["userRoot", "groupRoot", "NetscapeRoot"])
            .failing("groupRoot", 42),
    );
    let inv = Invocation::new(ExecutionMode::Export, install.config_dir())
        .with_task(TaskParams::Export(ExportOptions::default()))
        .with_instances(["userRoot", "groupRoot", "NetscapeRoot"]);

    let err = Orchestrator::new(inv, services(Some(&mock))).run().unwrap_err();
    assert_eq!(err.exit_code(), 42);
    let instances: Vec<_> = mock
        .invocations()
        .into_iter()
        .filter_map(|i| i.instance)
        .collect();
    assert_eq!(instances, vec!["userRoot", "groupRoot"]);
}

#[test]
fn offline_import_resolves_a_suffix() {
    let install = Install::new("");
    let mock = mock();
    let inv = Invocation::new(ExecutionMode::Import, install.config_dir())
        .with_task(TaskParams::Import(ImportOptions {
            inputs: vec![install.path("in.ldif")],
            ..ImportOptions::default()
        }))
        .with_include(["ou=groups,dc=example,dc=com"]);

    Orchestrator::new(inv, services(Some(&mock))).run().unwrap();
    let calls = mock.invocations();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].instance.as_deref(), Some("groupRoot"));
}

#[test]
fn offline_task_refuses_to_run_beside_a_server() {
    let install = Install::new("");
    let _server =
        InstanceGuard::acquire(&install.rundir(), ExecutionMode::Server, false, false).unwrap();
    let mock = mock();
    let inv = Invocation::new(ExecutionMode::Import, install.config_dir())
        .with_task(TaskParams::Import(ImportOptions {
            inputs: vec![install.path("in.ldif")],
            ..ImportOptions::default()
        }))
        .with_instances(["userRoot"]);

    let err = Orchestrator::new(inv, services(Some(&mock))).run().unwrap_err();
    assert!(matches!(err, CoreError::Conflict(_)));
    assert!(mock.invocations().is_empty());
}

#[test]
fn suffix_lookup_needs_no_pool_or_guard() {
    let install = Install::new("");
    let inv = Invocation::new(ExecutionMode::SuffixToInstance, install.config_dir())
        .with_include(["dc=example,dc=com"]);
    let orchestrator = Orchestrator::new(inv, services(None));
    let lifecycle = orchestrator.lifecycle();
    orchestrator.run().unwrap();
    assert_eq!(lifecycle.pools_started(), 0);
    assert!(!install.rundir().join("lock").exists());
}

#[test]
fn missing_configuration_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let inv = Invocation::new(ExecutionMode::Export, dir.path().join("absent"))
        .with_task(TaskParams::Export(ExportOptions::default()));
    let err = Orchestrator::new(inv, services(None)).run().unwrap_err();
    assert!(matches!(err, CoreError::Config(_)));
}

#[test]
fn referral_without_url_fails_before_binding() {
    let install = Install::new("");
    let mut inv = Invocation::new(ExecutionMode::Referral, install.config_dir());
    inv.debug = true;
    let orchestrator = Orchestrator::new(inv, services(None));
    let lifecycle = orchestrator.lifecycle();
    assert!(orchestrator.run().unwrap_err().is_usage());
    assert_eq!(lifecycle.pools_started(), 0);
}

#[test]
fn server_without_listeners_stops_its_pool() {
    let install = Install::new("");
    let mut inv = Invocation::new(ExecutionMode::Server, install.config_dir());
    inv.debug = true;
    let orchestrator = Orchestrator::new(inv, services(None));
    let lifecycle = orchestrator.lifecycle();

    let err = orchestrator.run().unwrap_err();
    assert!(matches!(err, CoreError::Config(_)));
    assert_eq!(lifecycle.pools_started(), 1);
    assert_eq!(lifecycle.pools_stopped(), 1);
}

fn wait_for(lifecycle: &ProcessLifecycle, state: LifecycleState) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while lifecycle.state() != state {
        assert!(Instant::now() < deadline, "never reached {state}");
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn server_runs_until_shutdown_is_requested() {
    // Kept short of the sun_path limit, which a nested tempdir can exceed.
    let socket = PathBuf::from(format!("/tmp/dirsrv-test-{}.sock", std::process::id()));
    let install = Install::new(&format!(
        "ldapi_enabled = true\nldapi_path = \"{}\"",
        socket.display()
    ));
    let pid_file = install.path("slapd.pid");
    let start_marker = install.path("start.pid");

    let mut inv = Invocation::new(ExecutionMode::Server, install.config_dir());
    inv.debug = true;
    inv.pid_file = Some(pid_file.clone());
    inv.start_pid_file = Some(start_marker.clone());
    let orchestrator = Orchestrator::new(inv, services(None));
    let lifecycle = orchestrator.lifecycle();

    let server = thread::spawn(move || orchestrator.run());
    wait_for(&lifecycle, LifecycleState::Running);

    assert!(pid_file.exists());
    assert!(start_marker.exists());
    assert!(socket.exists());
    assert!(install.rundir().join("lock").join("server.lock").exists());
    assert!(install.path("logs").join("errors").exists());

    assert!(lifecycle.request_shutdown());
    assert!(!lifecycle.request_shutdown());
    server.join().unwrap().unwrap();

    assert_eq!(lifecycle.state(), LifecycleState::Terminated);
    assert_eq!(lifecycle.shutdowns_initiated(), 1);
    assert_eq!(lifecycle.pools_started(), 1);
    assert_eq!(lifecycle.pools_stopped(), 1);
    assert!(!pid_file.exists());
    assert!(!socket.exists());
}
