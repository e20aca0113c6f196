use crate::mode::ExecutionMode;
use crate::privilege::BoundHandles;
use crate::CoreError;
use dirsrv_config::{SecuritySection, ServerConfig};
use std::fs;
use std::io::IsTerminal;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info};

/// The cryptographic library the secure listener depends on.
pub trait SecurityProvider: Send + Sync {
    /// Load certificates and keys. Called once per process.
    fn init_library(&self, config: &SecuritySection) -> Result<(), CoreError>;

    /// Prepare the secure listener for handshakes.
    fn init_listener(&self, listener: &TcpListener) -> Result<(), CoreError>;
}

const PIN_TOKEN_PREFIX: &str = "Internal (Software) Token:";

/// Provider backed by PEM files in `cert_dir`.
///
/// An encrypted private key is unlocked with the passphrase from the pin
/// file, or by prompting on the terminal when there is no pin file and
/// the process still has one.
pub struct PemSecurityProvider {
    interactive: bool,
    ready: AtomicBool,
}

impl PemSecurityProvider {
    pub fn new(interactive: bool) -> Self {
        Self {
            interactive,
            ready: AtomicBool::new(false),
        }
    }

    fn passphrase(&self, cert_dir: &Path, config: &SecuritySection) -> Result<String, CoreError> {
        let pin_path = cert_dir.join(&config.pin_file);
        if pin_path.exists() {
            let content = fs::read_to_string(&pin_path)?;
            let line = content.lines().next().unwrap_or_default().trim();
            return Ok(line
                .strip_prefix(PIN_TOKEN_PREFIX)
                .unwrap_or(line)
                .to_owned());
        }
        if !self.interactive || !std::io::stdin().is_terminal() {
            return Err(CoreError::Security(format!(
                "private key is encrypted and {} does not exist",
                pin_path.display()
            )));
        }
        dialoguer::Password::new()
            .with_prompt(format!("Enter PIN for {}", config.key_file))
            .interact()
            .map_err(|e| CoreError::Security(format!("cannot read passphrase: {e}")))
    }
}

fn read_pem(path: &Path, marker: &str) -> Result<String, CoreError> {
    let content = fs::read_to_string(path)
        .map_err(|e| CoreError::Security(format!("cannot read {}: {e}", path.display())))?;
    if !content.contains("-----BEGIN ") || !content.contains(&format!("{marker}-----")) {
        return Err(CoreError::Security(format!(
            "{} is not a PEM {}",
            path.display(),
            marker.to_ascii_lowercase()
        )));
    }
    Ok(content)
}

impl SecurityProvider for PemSecurityProvider {
    fn init_library(&self, config: &SecuritySection) -> Result<(), CoreError> {
        let cert_dir: PathBuf = config
            .cert_dir
            .clone()
            .ok_or_else(|| CoreError::Security("security.cert_dir is not set".to_owned()))?;
        read_pem(&cert_dir.join(&config.cert_file), "CERTIFICATE")?;
        let key = read_pem(&cert_dir.join(&config.key_file), "PRIVATE KEY")?;
        if key.contains("ENCRYPTED") {
            let pass = self.passphrase(&cert_dir, config)?;
            if pass.is_empty() {
                return Err(CoreError::Security("empty private key passphrase".to_owned()));
            }
            debug!("private key passphrase obtained");
        }
        self.ready.store(true, Ordering::SeqCst);
        info!("security library initialized from {}", cert_dir.display());
        Ok(())
    }

    fn init_listener(&self, listener: &TcpListener) -> Result<(), CoreError> {
        if !self.ready.load(Ordering::SeqCst) {
            return Err(CoreError::Security(
                "security library is not initialized".to_owned(),
            ));
        }
        let addr = listener.local_addr()?;
        debug!("secure listener ready on {addr}");
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecurityOutcome {
    /// Nothing asked for encryption.
    Disabled,
    Enabled,
    /// Initialization failed and the process carries on without it.
    Degraded(String),
}

/// Runs the security provider at its one legal point: after the
/// daemonizing fork, before the terminal is detached (the passphrase
/// prompt needs it).
pub struct SecurityInitializer<'a> {
    provider: &'a dyn SecurityProvider,
}

impl<'a> SecurityInitializer<'a> {
    pub fn new(provider: &'a dyn SecurityProvider) -> Self {
        Self { provider }
    }

    /// Whether this run wants encryption at all.
    pub fn wanted(mode: ExecutionMode, encrypt_requested: bool, config: &ServerConfig) -> bool {
        if !config.server.security {
            return false;
        }
        if mode.runs_server() {
            config.server.secure_port != 0
        } else {
            matches!(mode, ExecutionMode::Import | ExecutionMode::Export) && encrypt_requested
        }
    }

    /// Initialize, or degrade: on any failure the secure port is zeroed,
    /// the secure listener closed, and security switched off in `config`.
    pub fn init(
        &self,
        mode: ExecutionMode,
        encrypt_requested: bool,
        config: &mut ServerConfig,
        handles: Option<&mut BoundHandles>,
    ) -> SecurityOutcome {
        if !Self::wanted(mode, encrypt_requested, config) {
            debug!("security not requested for {mode}");
            return SecurityOutcome::Disabled;
        }

        let result = self.provider.init_library(&config.security).and_then(|()| {
            match handles.as_ref().and_then(|h| h.secure.as_ref()) {
                Some(listener) => self.provider.init_listener(listener),
                None => Ok(()),
            }
        });

        match result {
            Ok(()) => SecurityOutcome::Enabled,
            Err(e) => {
                error!("security initialization failed, continuing without it: {e}");
                config.disable_security();
                if let Some(handles) = handles {
                    handles.drop_secure();
                }
                SecurityOutcome::Degraded(e.to_string())
            }
        }
    }
}
