use crate::CoreError;
use dirsrv_config::{LogsSection, ServerConfig};
use std::collections::BTreeSet;
use std::ffi::CString;
use std::fs;
use std::io;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Ports below this need privilege to bind.
pub const PRIVILEGED_PORT_LIMIT: u16 = 1024;

/// Where the server listens. `None` disables that listener.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListenerSpec {
    pub plain: Option<SocketAddr>,
    pub secure: Option<SocketAddr>,
    pub ldapi: Option<PathBuf>,
}

impl ListenerSpec {
    /// Listener addresses from `[server]`. A port of 0 disables the
    /// listener; the secure listener also needs `security = true`.
    pub fn from_config(config: &ServerConfig, port_override: Option<u16>) -> Result<Self, CoreError> {
        let server = &config.server;
        let port = port_override.unwrap_or(server.port);
        let plain = if port == 0 {
            None
        } else {
            Some(resolve_addr(&server.listen_host, port)?)
        };
        let secure = if server.security && server.secure_port != 0 {
            Some(resolve_addr(&server.secure_listen_host, server.secure_port)?)
        } else {
            None
        };
        Ok(Self {
            plain,
            secure,
            ldapi: config.ldapi_socket().map(Path::to_path_buf),
        })
    }
}

fn resolve_addr(host: &str, port: u16) -> Result<SocketAddr, CoreError> {
    (host, port)
        .to_socket_addrs()
        .map_err(|e| CoreError::ResourceBind {
            what: format!("{host}:{port}"),
            source: e,
        })?
        .next()
        .ok_or_else(|| CoreError::ResourceBind {
            what: format!("{host}:{port}"),
            source: io::Error::new(io::ErrorKind::NotFound, "host resolved to no address"),
        })
}

/// Listeners opened while the process was still privileged.
#[derive(Debug, Default)]
pub struct BoundHandles {
    pub plain: Option<TcpListener>,
    pub secure: Option<TcpListener>,
    pub ldapi: Option<UnixListener>,
    /// Removed again when the handles are dropped.
    socket_path: Option<PathBuf>,
}

impl BoundHandles {
    pub fn is_empty(&self) -> bool {
        self.active() == 0
    }

    pub fn active(&self) -> usize {
        usize::from(self.plain.is_some())
            + usize::from(self.secure.is_some())
            + usize::from(self.ldapi.is_some())
    }

    /// Close the secure listener after security initialization failed.
    pub fn drop_secure(&mut self) {
        if let Some(listener) = self.secure.take() {
            if let Ok(addr) = listener.local_addr() {
                warn!("closing secure listener on {addr}");
            }
        }
    }

    /// Leave the local socket file in place on drop. Used by the parent
    /// side of the daemonizing fork, whose child keeps serving it.
    pub fn disown(&mut self) {
        self.socket_path = None;
    }
}

impl Drop for BoundHandles {
    fn drop(&mut self) {
        if let Some(path) = &self.socket_path {
            let _ = fs::remove_file(path);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
}

/// The process-identity system calls, behind a trait so the transition
/// can be exercised without root.
pub trait IdentityOps: Send + Sync {
    fn current_uid(&self) -> u32;

    fn lookup(&self, user: &str) -> Result<Account, CoreError>;

    fn chown(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> io::Result<()>;

    fn set_gid(&self, gid: u32) -> io::Result<()>;

    fn set_uid(&self, uid: u32) -> io::Result<()>;
}

/// `IdentityOps` on the real process.
#[derive(Debug, Clone, Copy, Default)]
pub struct LibcIdentity;

impl IdentityOps for LibcIdentity {
    #[allow(unsafe_code)]
    fn current_uid(&self) -> u32 {
        // SAFETY: getuid() takes no arguments and cannot fail.
        unsafe { libc::getuid() }
    }

    fn lookup(&self, user: &str) -> Result<Account, CoreError> {
        lookup_account(user)
    }

    fn chown(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> io::Result<()> {
        std::os::unix::fs::lchown(path, uid, gid)
    }

    #[allow(unsafe_code)]
    fn set_gid(&self, gid: u32) -> io::Result<()> {
        // SAFETY: setgid() only reads its integer argument.
        if unsafe { libc::setgid(gid) } == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[allow(unsafe_code)]
    fn set_uid(&self, uid: u32) -> io::Result<()> {
        // SAFETY: setuid() only reads its integer argument.
        if unsafe { libc::setuid(uid) } == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

#[allow(unsafe_code)]
fn lookup_account(user: &str) -> Result<Account, CoreError> {
    let name = CString::new(user)
        .map_err(|_| CoreError::PrivilegeTransition(format!("invalid user name '{user}'")))?;
    let mut buf: Vec<libc::c_char> = vec![0; 1024];
    loop {
        let mut result: *mut libc::passwd = std::ptr::null_mut();
        // SAFETY: passwd is plain data, so the all-zero value is valid. The
        // name is NUL-terminated and outlives the call; buf.len() is the
        // real length of buf; result is only read after a successful call,
        // and then points at pwd whose strings live in buf.
        let (rc, pwd) = unsafe {
            let mut pwd: libc::passwd = std::mem::zeroed();
            let rc = libc::getpwnam_r(
                name.as_ptr(),
                &mut pwd,
                buf.as_mut_ptr(),
                buf.len(),
                &mut result,
            );
            (rc, pwd)
        };
        if rc == libc::ERANGE && buf.len() < (1 << 20) {
            buf.resize(buf.len() * 2, 0);
            continue;
        }
        if rc != 0 {
            return Err(CoreError::PrivilegeTransition(format!(
                "cannot look up user '{user}': {}",
                io::Error::from_raw_os_error(rc)
            )));
        }
        if result.is_null() {
            return Err(CoreError::PrivilegeTransition(format!(
                "user '{user}' does not exist"
            )));
        }
        return Ok(Account {
            name: user.to_owned(),
            uid: pwd.pw_uid,
            gid: pwd.pw_gid,
        });
    }
}

/// Binds listeners while privileged, then gives the privilege up.
pub struct PrivilegeManager<'a> {
    ops: &'a dyn IdentityOps,
    dropped: bool,
}

impl<'a> PrivilegeManager<'a> {
    pub fn new(ops: &'a dyn IdentityOps) -> Self {
        Self {
            ops,
            dropped: false,
        }
    }

    pub fn identity_dropped(&self) -> bool {
        self.dropped
    }

    pub fn bind_resources(&self, spec: &ListenerSpec) -> Result<BoundHandles, CoreError> {
        let mut handles = BoundHandles::default();
        if let Some(addr) = spec.plain {
            handles.plain = Some(self.bind_tcp(addr)?);
        }
        if let Some(addr) = spec.secure {
            handles.secure = Some(self.bind_tcp(addr)?);
        }
        if let Some(path) = &spec.ldapi {
            handles.ldapi = Some(bind_local(path)?);
            handles.socket_path = Some(path.clone());
        }
        info!("bound {} listener(s)", handles.active());
        Ok(handles)
    }

    pub fn bind_tcp(&self, addr: SocketAddr) -> Result<TcpListener, CoreError> {
        let port = addr.port();
        if self.dropped && port != 0 && port < PRIVILEGED_PORT_LIMIT {
            return Err(CoreError::ResourceBind {
                what: addr.to_string(),
                source: io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    "privileged port requested after identity was dropped",
                ),
            });
        }
        let listener = TcpListener::bind(addr).map_err(|e| CoreError::ResourceBind {
            what: addr.to_string(),
            source: e,
        })?;
        debug!("listening on {addr}");
        Ok(listener)
    }

    /// Switch to `user`, first handing it the config directory and the
    /// directories holding the log files. `None` keeps the current
    /// identity. Ownership failures on individual files are logged and
    /// skipped; failing to look up the account or to change ids is fatal.
    pub fn drop_identity(
        &mut self,
        user: Option<&str>,
        config_dir: &Path,
        logs: &LogsSection,
    ) -> Result<(), CoreError> {
        let Some(user) = user else {
            debug!("no local user configured, keeping current identity");
            return Ok(());
        };
        let account = self.ops.lookup(user)?;

        // Nothing may have been created in the config directory by the
        // privileged process before this point.
        chown_tree(self.ops, config_dir, Some(account.uid), None);
        let log_dirs: BTreeSet<&Path> = logs
            .configured()
            .into_iter()
            .filter_map(Path::parent)
            .collect();
        for dir in log_dirs {
            chown_tree(self.ops, dir, Some(account.uid), Some(account.gid));
        }

        if self.ops.current_uid() == account.uid {
            debug!("already running as '{user}' (uid {})", account.uid);
        } else {
            self.ops.set_gid(account.gid).map_err(|e| {
                CoreError::PrivilegeTransition(format!("setgid({}) failed: {e}", account.gid))
            })?;
            self.ops.set_uid(account.uid).map_err(|e| {
                CoreError::PrivilegeTransition(format!("setuid({}) failed: {e}", account.uid))
            })?;
            info!("now running as '{user}' (uid {}, gid {})", account.uid, account.gid);
        }
        self.dropped = true;
        Ok(())
    }
}

fn bind_local(path: &Path) -> Result<UnixListener, CoreError> {
    match fs::remove_file(path) {
        Ok(()) => debug!("removed stale socket {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(CoreError::ResourceBind {
                what: path.display().to_string(),
                source: e,
            })
        }
    }
    UnixListener::bind(path).map_err(|e| CoreError::ResourceBind {
        what: path.display().to_string(),
        source: e,
    })
}

/// Best-effort recursive chown. Returns how many paths could not be changed.
fn chown_tree(ops: &dyn IdentityOps, root: &Path, uid: Option<u32>, gid: Option<u32>) -> usize {
    let mut failures = 0;
    let mut pending = vec![root.to_path_buf()];
    while let Some(path) = pending.pop() {
        if let Err(e) = ops.chown(&path, uid, gid) {
            warn!("cannot change owner of {}: {e}", path.display());
            failures += 1;
        }
        let is_dir = fs::symlink_metadata(&path).is_ok_and(|m| m.is_dir());
        if !is_dir {
            continue;
        }
        match fs::read_dir(&path) {
            Ok(entries) => pending.extend(entries.filter_map(Result::ok).map(|e| e.path())),
            Err(e) => {
                warn!("cannot read {}: {e}", path.display());
                failures += 1;
            }
        }
    }
    failures
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeIdentity {
        uid: u32,
        fail_chown: Option<PathBuf>,
        fail_setuid: bool,
        calls: Mutex<Vec<String>>,
    }

    impl FakeIdentity {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl IdentityOps for FakeIdentity {
        fn current_uid(&self) -> u32 {
            self.uid
        }

        fn lookup(&self, user: &str) -> Result<Account, CoreError> {
            if user == "dirsrv" {
                Ok(Account {
                    name: user.to_owned(),
                    uid: 389,
                    gid: 389,
                })
            } else {
                Err(CoreError::PrivilegeTransition(format!("user '{user}' does not exist")))
            }
        }

        fn chown(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> io::Result<()> {
            if self.fail_chown.as_deref() == Some(path) {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "denied"));
            }
            self.calls
                .lock()
                .unwrap()
                .push(format!("chown {} {uid:?} {gid:?}", path.display()));
            Ok(())
        }

        fn set_gid(&self, gid: u32) -> io::Result<()> {
            self.calls.lock().unwrap().push(format!("setgid {gid}"));
            Ok(())
        }

        fn set_uid(&self, uid: u32) -> io::Result<()> {
            if self.fail_setuid {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "EPERM"));
            }
            self.calls.lock().unwrap().push(format!("setuid {uid}"));
            Ok(())
        }
    }

    fn log_layout(root: &Path) -> LogsSection {
        for dir in ["access", "audit", "errors"] {
            fs::create_dir_all(root.join(dir)).unwrap();
            fs::write(root.join(dir).join("log"), "").unwrap();
        }
        LogsSection {
            access: Some(root.join("access").join("log")),
            audit: Some(root.join("audit").join("log")),
            error: Some(root.join("errors").join("log")),
        }
    }

    #[test]
    fn no_user_keeps_identity() {
        let ids = FakeIdentity::default();
        let mut mgr = PrivilegeManager::new(&ids);
        let dir = tempfile::tempdir().unwrap();
        mgr.drop_identity(None, dir.path(), &LogsSection::default())
            .unwrap();
        assert!(!mgr.identity_dropped());
        assert!(ids.calls().is_empty());
    }

    #[test]
    fn drop_chowns_then_sets_gid_before_uid() {
        let ids = FakeIdentity::default();
        let mut mgr = PrivilegeManager::new(&ids);
        let root = tempfile::tempdir().unwrap();
        // Assumed at startup: the config directory only holds files the
        // installer put there, none created by this privileged process.
        let config_dir = root.path().join("config");
        fs::create_dir_all(&config_dir).unwrap();
        fs::write(config_dir.join("dse.toml"), "").unwrap();
        let logs = log_layout(root.path());

        mgr.drop_identity(Some("dirsrv"), &config_dir, &logs).unwrap();
        assert!(mgr.identity_dropped());

        let calls = ids.calls();
        assert!(calls.contains(&format!("chown {} Some(389) None", config_dir.join("dse.toml").display())));
        assert!(calls.contains(&format!(
            "chown {} Some(389) Some(389)",
            root.path().join("errors").join("log").display()
        )));
        let gid_at = calls.iter().position(|c| c == "setgid 389").unwrap();
        let uid_at = calls.iter().position(|c| c == "setuid 389").unwrap();
        assert!(gid_at < uid_at);
        assert_eq!(uid_at, calls.len() - 1);
    }

    #[test]
    fn one_failed_chown_does_not_stop_the_rest() {
        let root = tempfile::tempdir().unwrap();
        let logs = log_layout(root.path());
        let ids = FakeIdentity {
            fail_chown: Some(root.path().join("access").join("log")),
            ..FakeIdentity::default()
        };
        let mut mgr = PrivilegeManager::new(&ids);
        mgr.drop_identity(Some("dirsrv"), root.path(), &logs).unwrap();

        let calls = ids.calls();
        assert!(calls.iter().any(|c| c.contains("audit") && c.ends_with("Some(389) Some(389)")));
        assert!(calls.iter().any(|c| c.contains("errors")));
        assert!(calls.contains(&"setuid 389".to_owned()));
    }

    #[test]
    fn unknown_user_is_fatal() {
        let ids = FakeIdentity::default();
        let mut mgr = PrivilegeManager::new(&ids);
        let dir = tempfile::tempdir().unwrap();
        let err = mgr
            .drop_identity(Some("nobody-here"), dir.path(), &LogsSection::default())
            .unwrap_err();
        assert!(matches!(err, CoreError::PrivilegeTransition(_)));
        assert!(!mgr.identity_dropped());
    }

    #[test]
    fn setuid_failure_is_fatal() {
        let ids = FakeIdentity {
            fail_setuid: true,
            ..FakeIdentity::default()
        };
        let mut mgr = PrivilegeManager::new(&ids);
        let dir = tempfile::tempdir().unwrap();
        assert!(mgr
            .drop_identity(Some("dirsrv"), dir.path(), &LogsSection::default())
            .is_err());
    }

    #[test]
    fn same_uid_skips_id_changes() {
        let ids = FakeIdentity {
            uid: 389,
            ..FakeIdentity::default()
        };
        let mut mgr = PrivilegeManager::new(&ids);
        let dir = tempfile::tempdir().unwrap();
        mgr.drop_identity(Some("dirsrv"), dir.path(), &LogsSection::default())
            .unwrap();
        assert!(mgr.identity_dropped());
        assert!(!ids.calls().iter().any(|c| c.starts_with("set")));
    }

    #[test]
    fn privileged_port_refused_after_drop() {
        let ids = FakeIdentity::default();
        let mut mgr = PrivilegeManager::new(&ids);
        let dir = tempfile::tempdir().unwrap();
        mgr.drop_identity(Some("dirsrv"), dir.path(), &LogsSection::default())
            .unwrap();

        for port in [1, 389, 636, PRIVILEGED_PORT_LIMIT - 1] {
            let spec = ListenerSpec {
                plain: Some(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))),
                ..ListenerSpec::default()
            };
            let err = mgr.bind_resources(&spec).unwrap_err();
            assert!(matches!(err, CoreError::ResourceBind { .. }));
        }

        let ephemeral = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0));
        assert!(mgr.bind_tcp(ephemeral).is_ok());
    }

    #[test]
    fn local_socket_replaces_stale_file() {
        let ids = FakeIdentity::default();
        let mgr = PrivilegeManager::new(&ids);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slapd.socket");
        fs::write(&path, "stale").unwrap();

        let handles = mgr
            .bind_resources(&ListenerSpec {
                ldapi: Some(path.clone()),
                ..ListenerSpec::default()
            })
            .unwrap();
        assert_eq!(handles.active(), 1);
        drop(handles);
        assert!(!path.exists());
    }

    #[test]
    fn spec_from_config() {
        let mut config = ServerConfig::parse(
            r#"
[server]
port = 3389
secure_port = 3636
listen_host = "127.0.0.1"
secure_listen_host = "127.0.0.1"
"#,
        )
        .unwrap();
        let spec = ListenerSpec::from_config(&config, None).unwrap();
        assert_eq!(spec.plain.unwrap().port(), 3389);
        assert!(spec.secure.is_none());

        config.server.security = true;
        let spec = ListenerSpec::from_config(&config, Some(0)).unwrap();
        assert!(spec.plain.is_none());
        assert_eq!(spec.secure.unwrap().port(), 3636);
    }

    #[test]
    fn libc_lookup() {
        if let Ok(root) = LibcIdentity.lookup("root") {
            assert_eq!(root.uid, 0);
        }
        assert!(LibcIdentity.lookup("no-such-dirsrv-user").is_err());
        assert!(LibcIdentity.lookup("bad\0name").is_err());
    }
}
