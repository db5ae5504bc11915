//! Supervisor: one socket server per secret, signal wait, socket cleanup.
//!
//! # Lifecycle
//!
//! ```text
//! Running ──(shutdown signal)──► Draining ──(sockets unlinked)──► Terminated
//! ```
//!
//! Servers run as independent tokio tasks and report back over an unbounded
//! channel when they start listening and when they stop. A stopped server is
//! left stopped unless a restart delay is configured. On shutdown every
//! server task is aborted and every configured socket path is unlinked,
//! best-effort, before [`Supervisor::run`] returns.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::{Config, SecretDescriptor};
use crate::socket::server::{remove_socket_file, SocketServer, StopReason};
use crate::store::SecretStore;

/// Supervisor lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// Servers are running; waiting for the shutdown signal.
    Running,
    /// Shutdown received; unlinking socket files.
    Draining,
    /// All cleanup done.
    Terminated,
}

/// Last known state of one secret's server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerStatus {
    /// Task spawned, socket not bound yet.
    Starting,
    /// Bound and accepting connections.
    Listening,
    /// Stopped; waiting out the restart delay.
    Restarting(StopReason),
    /// Stopped for good.
    Stopped(StopReason),
}

/// Observable supervisor state, published on every change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Lifecycle state.
    pub state: SupervisorState,
    /// Per-secret status, in configuration order.
    pub servers: Vec<ServerStatus>,
}

/// Reports sent from server tasks to the supervisor.
#[derive(Debug)]
enum ServerEvent {
    Listening { index: usize },
    Stopped { index: usize, reason: StopReason },
}

/// What happened to each socket file during drain.
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// Socket files that were unlinked.
    pub removed: Vec<PathBuf>,
    /// Socket paths with nothing to remove (e.g. the bind never happened).
    pub absent: Vec<PathBuf>,
    /// Socket paths whose removal failed, with the error.
    pub failed: Vec<(PathBuf, String)>,
    /// Final per-secret status, in configuration order.
    pub servers: Vec<ServerStatus>,
}

/// Owns the socket servers and their shared teardown.
pub struct Supervisor {
    store: Arc<dyn SecretStore>,
    secrets: Vec<Arc<SecretDescriptor>>,
    socket_paths: Vec<PathBuf>,
    restart_after: Option<Duration>,
    snapshot: watch::Sender<Snapshot>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("socket_paths", &self.socket_paths)
            .field("restart_after", &self.restart_after)
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    /// Build a supervisor for every secret in `config`.
    pub fn new(config: &Config, store: Arc<dyn SecretStore>) -> Self {
        let socket_paths = config
            .secrets
            .iter()
            .map(|s| config.socket_path_for(s))
            .collect();
        let secrets: Vec<_> = config.secrets.iter().cloned().map(Arc::new).collect();
        let (snapshot, _) = watch::channel(Snapshot {
            state: SupervisorState::Running,
            servers: vec![ServerStatus::Starting; secrets.len()],
        });

        Self {
            store,
            secrets,
            socket_paths,
            restart_after: config.restart_after(),
            snapshot,
        }
    }

    /// Override the restart delay from the config.
    pub fn with_restart_after(mut self, delay: Option<Duration>) -> Self {
        self.restart_after = delay;
        self
    }

    /// Absolute socket paths, in configuration order.
    pub fn socket_paths(&self) -> &[PathBuf] {
        &self.socket_paths
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.snapshot.subscribe()
    }

    /// Run every server until `shutdown` completes, then drain.
    ///
    /// `shutdown` is awaited once; in the binary it is [`ShutdownSignal::recv`].
    pub async fn run<F>(self, shutdown: F) -> ShutdownReport
    where
        F: Future<Output = ()>,
    {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        let mut handles: Vec<JoinHandle<()>> = (0..self.secrets.len())
            .map(|index| self.spawn_server(index, None, events_tx.clone()))
            .collect();

        log::info!(
            "Supervisor running: {} secret socket(s) under management",
            handles.len()
        );

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                () = &mut shutdown => break,
                Some(event) = events_rx.recv() => {
                    if let Some((index, delay)) = self.record(event) {
                        handles[index] = self.spawn_server(index, Some(delay), events_tx.clone());
                    }
                }
            }
        }

        self.set_state(SupervisorState::Draining);

        // No server may re-bind behind the drain.
        for handle in &handles {
            handle.abort();
        }
        for handle in handles {
            let _ = handle.await;
        }

        let mut report = remove_sockets(&self.socket_paths);
        report.servers = self.snapshot.borrow().servers.clone();

        self.set_state(SupervisorState::Terminated);
        report
    }

    /// Apply a server event. Returns `(index, delay)` when a restart is due.
    fn record(&self, event: ServerEvent) -> Option<(usize, Duration)> {
        match event {
            ServerEvent::Listening { index } => {
                self.set_status(index, ServerStatus::Listening);
                None
            }
            ServerEvent::Stopped { index, reason } => {
                let path = self.socket_paths[index].display();
                match self.restart_after {
                    Some(delay) => {
                        log::warn!(
                            "Server for {path} stopped ({reason}); restarting in {}s",
                            delay.as_secs()
                        );
                        self.set_status(index, ServerStatus::Restarting(reason));
                        Some((index, delay))
                    }
                    None => {
                        log::error!("Server for {path} stopped ({reason}); socket no longer served");
                        self.set_status(index, ServerStatus::Stopped(reason));
                        None
                    }
                }
            }
        }
    }

    fn set_status(&self, index: usize, status: ServerStatus) {
        self.snapshot.send_modify(|s| s.servers[index] = status);
    }

    fn set_state(&self, state: SupervisorState) {
        log::info!("Supervisor state: {state:?}");
        self.snapshot.send_modify(|s| s.state = state);
    }

    fn spawn_server(
        &self,
        index: usize,
        delay: Option<Duration>,
        events: mpsc::UnboundedSender<ServerEvent>,
    ) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let descriptor = Arc::clone(&self.secrets[index]);
        let socket_path = self.socket_paths[index].clone();

        tokio::spawn(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            let server = match SocketServer::bind(socket_path, descriptor, store) {
                Ok(server) => server,
                Err(e) => {
                    log::error!("{e:#}");
                    let _ = events.send(ServerEvent::Stopped {
                        index,
                        reason: StopReason::Bind(format!("{e:#}")),
                    });
                    return;
                }
            };

            let _ = events.send(ServerEvent::Listening { index });
            let reason = server.serve().await;
            let _ = events.send(ServerEvent::Stopped { index, reason });
        })
    }
}

/// Unlink every socket path. Failures are logged and do not stop the rest.
pub fn remove_sockets(paths: &[PathBuf]) -> ShutdownReport {
    let mut report = ShutdownReport::default();
    for path in paths {
        match remove_socket_file(path) {
            Ok(true) => {
                log::info!("Removed socket {}", path.display());
                report.removed.push(path.clone());
            }
            Ok(false) => {
                log::debug!("Socket {} already absent", path.display());
                report.absent.push(path.clone());
            }
            Err(e) => {
                log::error!("Failed to remove socket {}: {e}", path.display());
                report.failed.push((path.clone(), e.to_string()));
            }
        }
    }
    report
}

/// SIGINT / SIGTERM listener.
///
/// Register before starting servers so an early signal is not lost.
#[derive(Debug)]
pub struct ShutdownSignal {
    interrupt: Signal,
    terminate: Signal,
}

impl ShutdownSignal {
    /// Install the handlers. Must be called inside a tokio runtime.
    pub fn register() -> Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?,
            terminate: signal(SignalKind::terminate())
                .context("Failed to register SIGTERM handler")?,
        })
    }

    /// Wait for the first signal.
    pub async fn recv(mut self) {
        tokio::select! {
            _ = self.interrupt.recv() => log::info!("Received interrupt: cleaning up..."),
            _ = self.terminate.recv() => log::info!("Received terminate: cleaning up..."),
        }
    }
}
