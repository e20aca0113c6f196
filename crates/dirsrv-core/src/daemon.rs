//! Process plumbing around the server: forking into the background,
//! detaching from the terminal, pid files, and service-manager
//! notification.

use crate::CoreError;
use std::ffi::CString;
use std::fs::{self, OpenOptions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const NOTIFY_SOCKET_ENV: &str = "NOTIFY_SOCKET";
pub const DEBUG_SLEEP_ENV: &str = "DEBUG_SLEEP";

/// The server forks and detaches unless a service manager is watching it
/// or debug output was asked for.
pub fn should_detach(debug_requested: bool) -> bool {
    !debug_requested && std::env::var_os(NOTIFY_SOCKET_ENV).is_none()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkOutcome {
    Parent { child: i32 },
    Child,
}

/// Fork once. The parent should exit straight away; the child carries on
/// with every resource bound so far.
#[allow(unsafe_code)]
pub fn fork_into_background() -> Result<ForkOutcome, CoreError> {
    // SAFETY: no other threads exist yet (the worker pool is created after
    // this point), so the child starts from a consistent copy.
    match unsafe { libc::fork() } {
        -1 => Err(CoreError::Io(io::Error::last_os_error())),
        0 => Ok(ForkOutcome::Child),
        child => Ok(ForkOutcome::Parent { child }),
    }
}

/// Finish detaching: new session, stdio pointed at /dev/null.
#[allow(unsafe_code)]
pub fn detach_terminal() -> Result<(), CoreError> {
    // SAFETY: setsid() takes no arguments; failure is reported via errno.
    if unsafe { libc::setsid() } == -1 {
        return Err(CoreError::Io(io::Error::last_os_error()));
    }
    let null = OpenOptions::new().read(true).write(true).open("/dev/null")?;
    for fd in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        // SAFETY: both descriptors are open for the duration of the call;
        // dup2 atomically replaces fd.
        if unsafe { libc::dup2(null.as_raw_fd(), fd) } == -1 {
            return Err(CoreError::Io(io::Error::last_os_error()));
        }
    }
    debug!("detached from terminal");
    Ok(())
}

/// Write the start marker holding our pid. Best effort: any failure is
/// logged, and a marker whose mode cannot be set to 0644 is removed.
pub fn write_start_marker(path: &Path) {
    if let Err(e) = fs::write(path, format!("{}\n", std::process::id())) {
        warn!("cannot write start pid file {}: {e}", path.display());
        return;
    }
    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o644)) {
        warn!("cannot chmod start pid file {}: {e}", path.display());
        let _ = fs::remove_file(path);
    }
}

/// The regular pid file, removed on drop.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    pid: u32,
}

impl PidFile {
    pub fn create(path: &Path) -> Result<Self, CoreError> {
        let pid_file = Self {
            path: path.to_path_buf(),
            pid: std::process::id(),
        };
        pid_file.write()?;
        info!("wrote pid {} to {}", pid_file.pid, path.display());
        Ok(pid_file)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&self) -> Result<(), CoreError> {
        fs::write(&self.path, format!("{}\n", self.pid))?;
        fs::set_permissions(&self.path, fs::Permissions::from_mode(0o644))?;
        Ok(())
    }

    /// Re-create the file if something removed it. Returns whether it had
    /// to be rewritten.
    pub fn ensure_present(&self) -> bool {
        if self.path.exists() {
            return false;
        }
        match self.write() {
            Ok(()) => {
                info!("re-created missing pid file {}", self.path.display());
                true
            }
            Err(e) => {
                warn!("cannot re-create pid file {}: {e}", self.path.display());
                false
            }
        }
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("cannot remove pid file {}: {e}", self.path.display());
            }
        }
    }
}

/// Datagram channel to the service manager named by `NOTIFY_SOCKET`.
#[derive(Debug)]
pub struct ServiceNotifier {
    target: String,
    socket: UnixDatagram,
}

impl ServiceNotifier {
    pub fn from_env() -> Option<Self> {
        let target = std::env::var(NOTIFY_SOCKET_ENV).ok()?;
        Self::new(&target)
            .map_err(|e| warn!("cannot open {NOTIFY_SOCKET_ENV} '{target}': {e}"))
            .ok()
    }

    pub fn new(target: &str) -> io::Result<Self> {
        Ok(Self {
            target: target.to_owned(),
            socket: UnixDatagram::unbound()?,
        })
    }

    pub fn notify(&self, message: &str) {
        let sent = if let Some(name) = self.target.strip_prefix('@') {
            send_abstract(&self.socket, name, message)
        } else {
            self.socket.send_to(message.as_bytes(), &self.target)
        };
        match sent {
            Ok(_) => debug!("notified service manager: {message}"),
            Err(e) => warn!("service manager notification '{message}' failed: {e}"),
        }
    }

    pub fn ready(&self) {
        self.notify(&format!("READY=1\nMAINPID={}", std::process::id()));
    }

    pub fn stopping(&self) {
        self.notify("STOPPING=1");
    }
}

#[cfg(target_os = "linux")]
fn send_abstract(socket: &UnixDatagram, name: &str, message: &str) -> io::Result<usize> {
    use std::os::linux::net::SocketAddrExt;
    let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())?;
    socket.send_to_addr(message.as_bytes(), &addr)
}

#[cfg(not(target_os = "linux"))]
fn send_abstract(_socket: &UnixDatagram, name: &str, _message: &str) -> io::Result<usize> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("abstract socket '@{name}' is only supported on Linux"),
    ))
}

/// Honour `DEBUG_SLEEP=<secs>`: print the pid and pause so a debugger can
/// attach.
pub fn debug_sleep_from_env() {
    let Some(secs) = std::env::var(DEBUG_SLEEP_ENV)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|s| *s > 0)
    else {
        return;
    };
    eprintln!(
        "{DEBUG_SLEEP_ENV}: pid {} sleeping for {secs}s",
        std::process::id()
    );
    std::thread::sleep(Duration::from_secs(secs));
}

/// Check that the current (possibly dropped) identity can read and write
/// the run directory.
#[allow(unsafe_code)]
pub fn check_rundir(path: &Path) -> Result<(), CoreError> {
    let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| {
        CoreError::Config(dirsrv_config::ConfigError::InvalidValue {
            field: "server.rundir",
            reason: "contains a NUL byte".to_owned(),
        })
    })?;
    // SAFETY: c_path is a valid NUL-terminated string that outlives the call.
    if unsafe { libc::access(c_path.as_ptr(), libc::R_OK | libc::W_OK) } == 0 {
        Ok(())
    } else {
        Err(CoreError::Config(dirsrv_config::ConfigError::InvalidValue {
            field: "server.rundir",
            reason: format!(
                "{} is not readable and writable: {}",
                path.display(),
                io::Error::last_os_error()
            ),
        }))
    }
}
