//! Daemon orchestrator for wiring together all components.
//!
//! This module provides the `DaemonOrchestrator` that owns the session
//! manager, the message router, the IPC listener, and the session reaper,
//! and drives them through startup and graceful shutdown.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use anyhow::{Context, Result};
use protocol::messages::{ErrorCode, ErrorMessage, StatusReport};
use protocol::{Envelope, KillSignal, Message, ProtocolError};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::ipc::{pidfile, resolve_socket_path, IpcConnection, IpcError, IpcServer};
use crate::router::MessageRouter;
use crate::session::{SessionManager, SessionManagerImpl};

/// Daemon orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Initial state, not started.
    Stopped,
    /// Starting up, binding the socket.
    Starting,
    /// Running and accepting connections.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

/// Events emitted by the orchestrator.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    /// Orchestrator state changed.
    StateChanged(OrchestratorState),
    /// A client connected to the IPC socket.
    ClientConnected { connection_id: usize },
    /// A client disconnected.
    ClientDisconnected { connection_id: usize },
    /// A client asked the daemon to shut down.
    ShutdownRequested,
    /// Error occurred.
    Error { message: String },
}

/// Shared state handed to every connection task.
#[derive(Clone)]
struct ConnectionContext {
    router: Arc<MessageRouter<SessionManagerImpl>>,
    started_at: Instant,
    shutdown_token: CancellationToken,
    event_tx: broadcast::Sender<OrchestratorEvent>,
    active_connections: Arc<AtomicUsize>,
}

/// Daemon orchestrator that manages all subsystems.
pub struct DaemonOrchestrator {
    /// Configuration.
    config: Config,
    /// Path of the IPC socket.
    socket_path: PathBuf,
    /// Path of the PID file.
    pid_file: PathBuf,
    /// Current state.
    state: Arc<RwLock<OrchestratorState>>,
    /// Session registry.
    session_manager: Arc<SessionManagerImpl>,
    /// Message router.
    router: Arc<MessageRouter<SessionManagerImpl>>,
    /// When the orchestrator was created.
    started_at: Instant,
    /// Number of open IPC connections.
    active_connections: Arc<AtomicUsize>,
    /// Background tasks: accept loop and reaper.
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Cancellation token for graceful shutdown.
    shutdown_token: CancellationToken,
    /// Event sender.
    event_tx: broadcast::Sender<OrchestratorEvent>,
}

impl DaemonOrchestrator {
    /// Creates a new daemon orchestrator.
    pub fn new(config: Config) -> Result<Self> {
        config.validate().context("Invalid configuration")?;

        let session_manager = Arc::new(SessionManagerImpl::with_settings(
            config.session.settings(),
        ));
        let router = Arc::new(MessageRouter::new(Arc::clone(&session_manager)));
        let socket_path = resolve_socket_path(config.daemon.socket_path.as_deref());

        let (event_tx, _) = broadcast::channel(256);

        Ok(Self {
            config,
            socket_path,
            pid_file: pidfile::get_pid_file_path(),
            state: Arc::new(RwLock::new(OrchestratorState::Stopped)),
            session_manager,
            router,
            started_at: Instant::now(),
            active_connections: Arc::new(AtomicUsize::new(0)),
            tasks: Mutex::new(Vec::new()),
            shutdown_token: CancellationToken::new(),
            event_tx,
        })
    }

    /// Use `path` for the PID file instead of the default location.
    pub fn with_pid_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.pid_file = path.into();
        self
    }

    /// Returns the current state.
    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    /// Returns a receiver for orchestrator events.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.event_tx.subscribe()
    }

    /// Path of the IPC socket.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Starts the daemon orchestrator.
    ///
    /// An orchestrator runs once; starting it again after `stop` fails.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Stopped {
                anyhow::bail!("Orchestrator is already running");
            }
            if self.shutdown_token.is_cancelled() {
                anyhow::bail!("Orchestrator has been stopped and cannot be restarted");
            }
            *state = OrchestratorState::Starting;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Starting));

        info!(socket = %self.socket_path.display(), "Starting daemon orchestrator...");

        let server = match IpcServer::bind(&self.socket_path).await {
            Ok(server) => server,
            Err(e) => {
                *self.state.write().await = OrchestratorState::Stopped;
                return Err(e).with_context(|| {
                    format!("Failed to bind IPC socket: {}", self.socket_path.display())
                });
            }
        };

        if let Err(e) = pidfile::write_pid_file(&self.pid_file) {
            warn!(path = %self.pid_file.display(), error = %e, "Failed to write PID file");
        }

        let reaper = self.session_manager.start_cleanup_task(
            self.config.session.reap_interval(),
            self.shutdown_token.child_token(),
        );
        debug!("Started session reaper");

        let ctx = ConnectionContext {
            router: Arc::clone(&self.router),
            started_at: self.started_at,
            shutdown_token: self.shutdown_token.clone(),
            event_tx: self.event_tx.clone(),
            active_connections: Arc::clone(&self.active_connections),
        };
        let acceptor = tokio::spawn(Self::accept_loop(server, ctx));

        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([reaper, acceptor]);

        *self.state.write().await = OrchestratorState::Running;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Running));

        info!("Daemon orchestrator started successfully");
        Ok(())
    }

    /// Accepts IPC connections until shutdown.
    async fn accept_loop(server: IpcServer, ctx: ConnectionContext) {
        let mut next_connection_id = 0usize;

        loop {
            tokio::select! {
                _ = ctx.shutdown_token.cancelled() => {
                    info!("Accept loop received shutdown signal");
                    break;
                }
                accepted = server.accept() => {
                    match accepted {
                        Ok(conn) => {
                            next_connection_id += 1;
                            tokio::spawn(Self::serve_connection(
                                conn,
                                next_connection_id,
                                ctx.clone(),
                            ));
                        }
                        Err(e) => {
                            error!("Failed to accept IPC connection: {}", e);
                            let _ = ctx.event_tx.send(OrchestratorEvent::Error {
                                message: e.to_string(),
                            });
                        }
                    }
                }
            }
        }
    }

    /// Answers requests on one connection, in order, until the client leaves.
    async fn serve_connection(mut conn: IpcConnection, connection_id: usize, ctx: ConnectionContext) {
        ctx.active_connections.fetch_add(1, Ordering::SeqCst);
        let _ = ctx
            .event_tx
            .send(OrchestratorEvent::ClientConnected { connection_id });
        debug!(connection_id, "Client connected");

        loop {
            let read = tokio::select! {
                _ = ctx.shutdown_token.cancelled() => break,
                read = conn.read_envelope() => read,
            };

            let request = match read {
                Ok(Some(request)) => request,
                Ok(None) => break,
                Err(IpcError::Protocol(e)) => {
                    warn!(connection_id, error = %e, "Rejected malformed request");
                    let reply = Envelope::new(0, Message::Error(framing_error(&e)));
                    if conn.send_envelope(&reply).await.is_err() {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    debug!(connection_id, error = %e, "Connection read failed");
                    break;
                }
            };

            let shutdown = matches!(request.payload, Message::Shutdown);
            let sequence = request.sequence;
            let reply = Envelope::new(sequence, Self::dispatch(&ctx, request.payload).await);

            if let Err(e) = conn.send_envelope(&reply).await {
                debug!(connection_id, error = %e, "Failed to send reply");
                break;
            }

            if shutdown {
                let _ = ctx.event_tx.send(OrchestratorEvent::ShutdownRequested);
                ctx.shutdown_token.cancel();
                break;
            }
        }

        ctx.active_connections.fetch_sub(1, Ordering::SeqCst);
        let _ = ctx
            .event_tx
            .send(OrchestratorEvent::ClientDisconnected { connection_id });
        debug!(connection_id, "Client disconnected");
    }

    /// Produces the reply to one request.
    async fn dispatch(ctx: &ConnectionContext, payload: Message) -> Message {
        match payload {
            Message::Status => Message::StatusReport(StatusReport {
                uptime_secs: ctx.started_at.elapsed().as_secs(),
                session_count: ctx.router.session_manager().count(),
                pid: std::process::id(),
            }),
            Message::Shutdown => {
                info!("Shutdown requested over IPC");
                Message::ShuttingDown
            }
            other => ctx.router.handle(other).await,
        }
    }

    /// Stops the daemon orchestrator gracefully.
    ///
    /// Every live session is sent SIGTERM, then SIGKILL if it outlives the
    /// kill grace period. The socket and PID file are removed.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == OrchestratorState::Stopped {
                return Ok(());
            }
            if *state == OrchestratorState::ShuttingDown {
                anyhow::bail!("Orchestrator is already shutting down");
            }
            *state = OrchestratorState::ShuttingDown;
        }
        self.emit_event(OrchestratorEvent::StateChanged(
            OrchestratorState::ShuttingDown,
        ));

        info!("Stopping daemon orchestrator...");

        self.shutdown_token.cancel();

        let tasks: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }

        let killed = self.session_manager.kill_all(KillSignal::Term).await;
        debug!(killed, "Terminated remaining sessions");

        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.socket_path.display(), error = %e, "Failed to remove socket");
            }
        }
        pidfile::remove_pid_file(&self.pid_file);

        *self.state.write().await = OrchestratorState::Stopped;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));

        info!("Daemon orchestrator stopped");
        Ok(())
    }

    fn emit_event(&self, event: OrchestratorEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Returns the session manager.
    pub fn session_manager(&self) -> &Arc<SessionManagerImpl> {
        &self.session_manager
    }

    /// Returns the number of open IPC connections.
    pub fn connection_count(&self) -> usize {
        self.active_connections.load(Ordering::SeqCst)
    }

    /// Returns the shutdown token for external tasks to observe shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }
}

/// Error reply for a line that could not be decoded.
fn framing_error(err: &ProtocolError) -> ErrorMessage {
    let code = match err {
        ProtocolError::VersionMismatch { .. } => ErrorCode::VersionMismatch,
        _ => ErrorCode::InvalidRequest,
    };
    ErrorMessage {
        code,
        message: err.to_string(),
        context: None,
        recoverable: false,
    }
}
