use crate::CoreError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::pin::pin;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use tokio::sync::Notify;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[repr(u8)]
pub enum LifecycleState {
    Initializing = 0,
    ConfigLoaded = 1,
    ResourcesBound = 2,
    IdentityDropped = 3,
    SecurityReady = 4,
    Running = 5,
    ShuttingDown = 6,
    Terminated = 7,
}

impl LifecycleState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Initializing,
            1 => Self::ConfigLoaded,
            2 => Self::ResourcesBound,
            3 => Self::IdentityDropped,
            4 => Self::SecurityReady,
            5 => Self::Running,
            6 => Self::ShuttingDown,
            _ => Self::Terminated,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Initializing => "initializing",
            Self::ConfigLoaded => "config_loaded",
            Self::ResourcesBound => "resources_bound",
            Self::IdentityDropped => "identity_dropped",
            Self::SecurityReady => "security_ready",
            Self::Running => "running",
            Self::ShuttingDown => "shutting_down",
            Self::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// States advance one step at a time. Any live state may jump straight to
/// `Terminated`, which is how offline modes and fatal errors leave.
pub fn validate_transition(from: LifecycleState, to: LifecycleState) -> Result<(), CoreError> {
    let valid = match (from, to) {
        (LifecycleState::Terminated, _) => false,
        (_, LifecycleState::Terminated) => true,
        (from, to) => to as u8 == from as u8 + 1,
    };

    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum ShutdownState {
    Running = 0,
    SignalRequested = 1,
    Terminated = 2,
}

impl ShutdownState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Running,
            1 => Self::SignalRequested,
            _ => Self::Terminated,
        }
    }
}

/// Process-wide state shared by the orchestrator, the worker pool, and the
/// signal jobs. Passed around behind an `Arc`; there are no globals.
pub struct ProcessLifecycle {
    state: AtomicU8,
    shutdown: AtomicU8,
    shutdown_notify: Notify,
    shutdowns_initiated: AtomicUsize,
    pools_started: AtomicUsize,
    pools_stopped: AtomicUsize,
    started_at: DateTime<Utc>,
}

impl Default for ProcessLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessLifecycle {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(LifecycleState::Initializing as u8),
            shutdown: AtomicU8::new(ShutdownState::Running as u8),
            shutdown_notify: Notify::new(),
            shutdowns_initiated: AtomicUsize::new(0),
            pools_started: AtomicUsize::new(0),
            pools_stopped: AtomicUsize::new(0),
            started_at: Utc::now(),
        }
    }

    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn advance(&self, to: LifecycleState) -> Result<(), CoreError> {
        let mut current = self.state.load(Ordering::SeqCst);
        loop {
            validate_transition(LifecycleState::from_u8(current), to)?;
            match self.state.compare_exchange(
                current,
                to as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    debug!("lifecycle: {} -> {to}", LifecycleState::from_u8(current));
                    return Ok(());
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Move to `Terminated` unless already there.
    pub fn terminate(&self) {
        // Every state but `Terminated` itself may move to `Terminated`.
        if let Err(e) = self.advance(LifecycleState::Terminated) {
            debug!("already terminated: {e}");
        }
        self.shutdown
            .store(ShutdownState::Terminated as u8, Ordering::SeqCst);
        let uptime = Utc::now() - self.started_at;
        info!("terminated after {}s", uptime.num_seconds());
    }

    pub fn shutdown_state(&self) -> ShutdownState {
        ShutdownState::from_u8(self.shutdown.load(Ordering::SeqCst))
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_state() != ShutdownState::Running
    }

    /// `Running -> SignalRequested` as a single compare-and-set. Only the
    /// caller that wins the exchange gets `true` and wakes the waiters;
    /// every later request is a no-op.
    pub fn request_shutdown(&self) -> bool {
        let won = self
            .shutdown
            .compare_exchange(
                ShutdownState::Running as u8,
                ShutdownState::SignalRequested as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        if won {
            self.shutdowns_initiated.fetch_add(1, Ordering::SeqCst);
            self.shutdown_notify.notify_waiters();
        }
        won
    }

    /// Resolves once shutdown has been requested.
    pub async fn wait_for_shutdown(&self) {
        loop {
            let mut notified = pin!(self.shutdown_notify.notified());
            notified.as_mut().enable();
            if self.shutdown_requested() {
                return;
            }
            notified.await;
        }
    }

    pub fn shutdowns_initiated(&self) -> usize {
        self.shutdowns_initiated.load(Ordering::SeqCst)
    }

    pub(crate) fn record_pool_started(&self) {
        self.pools_started.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_pool_stopped(&self) {
        self.pools_stopped.fetch_add(1, Ordering::SeqCst);
    }

    pub fn pools_started(&self) -> usize {
        self.pools_started.load(Ordering::SeqCst)
    }

    pub fn pools_stopped(&self) -> usize {
        self.pools_stopped.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn valid_transitions() {
        use LifecycleState::*;
        assert!(validate_transition(Initializing, ConfigLoaded).is_ok());
        assert!(validate_transition(ConfigLoaded, ResourcesBound).is_ok());
        assert!(validate_transition(ResourcesBound, IdentityDropped).is_ok());
        assert!(validate_transition(IdentityDropped, SecurityReady).is_ok());
        assert!(validate_transition(SecurityReady, Running).is_ok());
        assert!(validate_transition(Running, ShuttingDown).is_ok());
        assert!(validate_transition(ShuttingDown, Terminated).is_ok());
        // offline short-circuit and fatal exits
        assert!(validate_transition(ConfigLoaded, Terminated).is_ok());
        assert!(validate_transition(Initializing, Terminated).is_ok());
    }

    #[test]
    fn invalid_transitions() {
        use LifecycleState::*;
        assert!(validate_transition(Initializing, ResourcesBound).is_err());
        assert!(validate_transition(ConfigLoaded, IdentityDropped).is_err());
        assert!(validate_transition(ResourcesBound, SecurityReady).is_err());
        assert!(validate_transition(Running, SecurityReady).is_err());
        assert!(validate_transition(Running, Running).is_err());
        assert!(validate_transition(Terminated, Initializing).is_err());
        assert!(validate_transition(Terminated, Terminated).is_err());
    }

    #[test]
    fn advance_rejects_skipping() {
        let lc = ProcessLifecycle::new();
        lc.advance(LifecycleState::ConfigLoaded).unwrap();
        let err = lc.advance(LifecycleState::SecurityReady).unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition { .. }));
        assert_eq!(lc.state(), LifecycleState::ConfigLoaded);
    }

    #[test]
    fn terminate_is_idempotent() {
        let lc = ProcessLifecycle::new();
        lc.terminate();
        lc.terminate();
        assert_eq!(lc.state(), LifecycleState::Terminated);
        assert_eq!(lc.shutdown_state(), ShutdownState::Terminated);
    }

    #[test]
    fn concurrent_terminate_settles_on_terminated() {
        let lc = std::sync::Arc::new(ProcessLifecycle::new());
        lc.advance(LifecycleState::ConfigLoaded).unwrap();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lc = std::sync::Arc::clone(&lc);
                std::thread::spawn(move || lc.terminate())
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(lc.state(), LifecycleState::Terminated);
        assert!(lc.advance(LifecycleState::Running).is_err());
    }

    #[test]
    fn only_first_request_wins() {
        let lc = ProcessLifecycle::new();
        assert!(lc.request_shutdown());
        assert!(!lc.request_shutdown());
        assert_eq!(lc.shutdown_state(), ShutdownState::SignalRequested);
        assert_eq!(lc.shutdowns_initiated(), 1);
    }

    #[test]
    fn concurrent_requests_initiate_one_shutdown() {
        let lc = Arc::new(ProcessLifecycle::new());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let lc = Arc::clone(&lc);
                std::thread::spawn(move || lc.request_shutdown())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(lc.shutdowns_initiated(), 1);
    }

    #[tokio::test]
    async fn waiter_wakes_on_request() {
        let lc = Arc::new(ProcessLifecycle::new());
        let waiter = {
            let lc = Arc::clone(&lc);
            tokio::spawn(async move { lc.wait_for_shutdown().await })
        };
        tokio::task::yield_now().await;
        lc.request_shutdown();
        tokio::time::timeout(std::time::Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn wait_returns_immediately_after_request() {
        let lc = ProcessLifecycle::new();
        lc.request_shutdown();
        lc.wait_for_shutdown().await;
    }
}
