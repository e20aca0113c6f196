use crate::lifecycle::ProcessLifecycle;
use crate::privilege::BoundHandles;
use crate::CoreError;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
const RUNTIME_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    /// Request a graceful shutdown.
    Shutdown,
    /// Swallow the signal so its default action never runs.
    NoOp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalJob {
    pub name: &'static str,
    pub signal: i32,
    pub action: SignalAction,
    /// Stays registered for the lifetime of the pool.
    pub persistent: bool,
}

/// Registered before any other job; the only place signals are observed.
pub const SIGNAL_JOBS: [SignalJob; 6] = [
    SignalJob {
        name: "SIGINT",
        signal: libc::SIGINT,
        action: SignalAction::Shutdown,
        persistent: true,
    },
    SignalJob {
        name: "SIGTERM",
        signal: libc::SIGTERM,
        action: SignalAction::Shutdown,
        persistent: true,
    },
    SignalJob {
        name: "SIGTSTP",
        signal: libc::SIGTSTP,
        action: SignalAction::Shutdown,
        persistent: true,
    },
    SignalJob {
        name: "SIGHUP",
        signal: libc::SIGHUP,
        action: SignalAction::NoOp,
        persistent: true,
    },
    SignalJob {
        name: "SIGUSR1",
        signal: libc::SIGUSR1,
        action: SignalAction::NoOp,
        persistent: true,
    },
    SignalJob {
        name: "SIGUSR2",
        signal: libc::SIGUSR2,
        action: SignalAction::NoOp,
        persistent: true,
    },
];

/// Run one delivery of `job`. Returns `true` only for the delivery that
/// actually started the shutdown.
pub fn handle_signal(lifecycle: &ProcessLifecycle, job: &SignalJob) -> bool {
    match job.action {
        SignalAction::Shutdown => {
            if lifecycle.request_shutdown() {
                info!("{} received, shutting down", job.name);
                true
            } else {
                debug!("{} received, shutdown already in progress", job.name);
                false
            }
        }
        SignalAction::NoOp => {
            debug!("{} acknowledged", job.name);
            false
        }
    }
}

/// An accepted client connection.
#[derive(Debug)]
pub enum Connection {
    Tcp {
        stream: tokio::net::TcpStream,
        peer: SocketAddr,
        secure: bool,
    },
    Local(tokio::net::UnixStream),
}

/// Protocol processing for accepted connections. Called on a pool thread;
/// long-running work should be spawned.
pub trait ConnectionHandler: Send + Sync {
    fn handle(&self, conn: Connection);
}

/// Accepts and immediately closes every connection.
#[derive(Debug, Default)]
pub struct ClosingHandler;

impl ConnectionHandler for ClosingHandler {
    fn handle(&self, conn: Connection) {
        match &conn {
            Connection::Tcp { peer, secure, .. } => {
                debug!("closing connection from {peer} (secure: {secure})");
            }
            Connection::Local(_) => debug!("closing local connection"),
        }
    }
}

/// The shared worker pool for server and referral modes.
///
/// `stop` (or dropping the pool) requests shutdown, waits for spawned jobs
/// to finish, releases the signal jobs, then tears the runtime down. It
/// runs exactly once whichever way the pool goes away.
pub struct WorkerPool {
    runtime: Option<Runtime>,
    lifecycle: Arc<ProcessLifecycle>,
    signal_jobs: Vec<JoinHandle<()>>,
    jobs: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn start(max_threads: usize, lifecycle: Arc<ProcessLifecycle>) -> Result<Self, CoreError> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(max_threads.max(1))
            .thread_name("dirsrv-worker")
            .enable_all()
            .build()
            .map_err(|e| CoreError::Pool(format!("cannot create worker pool: {e}")))?;
        lifecycle.record_pool_started();

        let mut pool = Self {
            runtime: Some(runtime),
            lifecycle,
            signal_jobs: Vec::new(),
            jobs: Mutex::new(Vec::new()),
        };
        pool.register_signal_jobs();
        info!(
            "worker pool started with {} thread(s), {} signal job(s)",
            max_threads.max(1),
            pool.signal_jobs.len()
        );
        Ok(pool)
    }

    fn register_signal_jobs(&mut self) {
        let Some(runtime) = &self.runtime else {
            return;
        };
        let _enter = runtime.enter();
        for job in SIGNAL_JOBS {
            match signal(SignalKind::from_raw(job.signal)) {
                Ok(mut stream) => {
                    let lifecycle = Arc::clone(&self.lifecycle);
                    self.signal_jobs.push(runtime.spawn(async move {
                        while stream.recv().await.is_some() {
                            handle_signal(&lifecycle, &job);
                        }
                    }));
                }
                Err(e) => warn!("cannot register {} job, continuing without it: {e}", job.name),
            }
        }
    }

    pub fn signal_job_count(&self) -> usize {
        self.signal_jobs.len()
    }

    /// Run `job` on the pool. It is awaited when the pool stops, so it
    /// must finish once shutdown is requested.
    pub fn spawn<F>(&self, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Some(runtime) = &self.runtime else {
            warn!("job submitted to a stopped pool, dropping it");
            return;
        };
        let handle = runtime.spawn(job);
        if let Ok(mut jobs) = self.jobs.lock() {
            jobs.push(handle);
        }
    }

    /// Hand every bound listener to an accept loop that passes connections
    /// to `handler` until shutdown.
    pub fn spawn_listeners(
        &self,
        handles: &mut BoundHandles,
        handler: &Arc<dyn ConnectionHandler>,
    ) -> Result<usize, CoreError> {
        let Some(runtime) = &self.runtime else {
            return Err(CoreError::Pool("pool is stopped".to_owned()));
        };
        let _enter = runtime.enter();
        let mut started = 0;

        for (listener, secure) in [(handles.plain.take(), false), (handles.secure.take(), true)] {
            let Some(listener) = listener else {
                continue;
            };
            listener.set_nonblocking(true)?;
            let listener = tokio::net::TcpListener::from_std(listener)?;
            self.spawn(accept_tcp(
                listener,
                secure,
                Arc::clone(handler),
                Arc::clone(&self.lifecycle),
            ));
            started += 1;
        }
        if let Some(listener) = handles.ldapi.take() {
            listener.set_nonblocking(true)?;
            let listener = tokio::net::UnixListener::from_std(listener)?;
            self.spawn(accept_local(
                listener,
                Arc::clone(handler),
                Arc::clone(&self.lifecycle),
            ));
            started += 1;
        }
        Ok(started)
    }

    /// Block the calling thread until shutdown has been requested.
    pub fn block_until_shutdown(&self) {
        if let Some(runtime) = &self.runtime {
            runtime.block_on(self.lifecycle.wait_for_shutdown());
        }
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(runtime) = self.runtime.take() else {
            return;
        };
        self.lifecycle.request_shutdown();

        let jobs = self
            .jobs
            .lock()
            .map(|mut jobs| std::mem::take(&mut *jobs))
            .unwrap_or_default();
        let pending = jobs.len();
        runtime.block_on(async {
            let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
            for job in jobs {
                if tokio::time::timeout_at(deadline, job).await.is_err() {
                    warn!("job still running after {}s, abandoning it", DRAIN_TIMEOUT.as_secs());
                }
            }
        });
        debug!("drained {pending} job(s)");

        for job in self.signal_jobs.drain(..) {
            job.abort();
        }
        runtime.shutdown_timeout(RUNTIME_SHUTDOWN_GRACE);
        self.lifecycle.record_pool_stopped();
        info!("worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn accept_tcp(
    listener: tokio::net::TcpListener,
    secure: bool,
    handler: Arc<dyn ConnectionHandler>,
    lifecycle: Arc<ProcessLifecycle>,
) {
    loop {
        tokio::select! {
            () = lifecycle.wait_for_shutdown() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => handler.handle(Connection::Tcp { stream, peer, secure }),
                Err(e) => {
                    warn!("accept failed: {e}");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
        }
    }
}

async fn accept_local(
    listener: tokio::net::UnixListener,
    handler: Arc<dyn ConnectionHandler>,
    lifecycle: Arc<ProcessLifecycle>,
) {
    loop {
        tokio::select! {
            () = lifecycle.wait_for_shutdown() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => handler.handle(Connection::Local(stream)),
                Err(e) => {
                    warn!("local accept failed: {e}");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
        }
    }
}
