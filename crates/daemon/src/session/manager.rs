//! Session registry and lifecycle controller.
//!
//! This module provides a thread-safe session manager that can spawn,
//! address, and tear down many sessions concurrently. Operations on distinct
//! sessions never contend on a shared lock; the registry is a `DashMap` and
//! each session serializes access to its own buffer.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use protocol::messages::SessionSummary;
use protocol::{KillSignal, TerminalMode, DEFAULT_COLS, DEFAULT_ROWS};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::buffer::{BufferSnapshot, DEFAULT_MAX_BUFFER_LINES};
use super::process::{detect_shell, ExitInfo, SpawnOptions};
use super::record::{now_millis, Session, SessionError, SessionId};

/// Trait for session management operations.
///
/// This trait defines the operation contract of the session manager.
/// Implementations must be thread-safe and suitable for concurrent access.
#[allow(async_fn_in_trait)]
pub trait SessionManager: Send + Sync {
    /// Spawns a new session.
    ///
    /// # Returns
    /// The session ID and process ID on success.
    async fn spawn(&self, options: SpawnOptions) -> Result<(SessionId, u32), SessionError>;

    /// Encodes symbolic keys and writes them to a session.
    ///
    /// Returns the number of bytes written.
    async fn send_keys(&self, session_id: &str, keys: &str) -> Result<usize, SessionError>;

    /// Reads a session's buffered output after waiting `wait`
    /// (the configured default when `None`).
    async fn read(
        &self,
        session_id: &str,
        wait: Option<Duration>,
        clear: bool,
    ) -> Result<BufferSnapshot, SessionError>;

    /// Signals a session, waits up to the grace period, and removes it.
    async fn kill(&self, session_id: &str, signal: KillSignal)
        -> Result<KillOutcome, SessionError>;

    /// Records new terminal dimensions for a session.
    async fn resize(&self, session_id: &str, cols: u16, rows: u16) -> Result<(), SessionError>;

    /// Lists all live sessions.
    fn list(&self, verbose: bool) -> Vec<SessionSummary>;

    /// Checks if a session is registered.
    fn exists(&self, session_id: &str) -> bool;

    /// Returns the number of live sessions.
    fn count(&self) -> usize;

    /// Returns the settings spawns are resolved against.
    fn settings(&self) -> &SessionSettings;
}

/// Result of a kill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KillOutcome {
    /// Exit observed within the grace period, if any.
    pub exit: Option<ExitInfo>,
}

/// Tunables of the session manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    /// Command used when a spawn names none.
    pub default_shell: String,
    /// Maximum number of live sessions.
    pub max_sessions: usize,
    /// Line bound of each session's output buffer.
    pub max_buffer_lines: usize,
    /// How long `kill` waits for the process to exit.
    pub kill_grace: Duration,
    /// Wait applied by `read` when the caller gives none.
    pub default_read_wait: Duration,
    /// Columns used when a spawn gives none.
    pub default_cols: u16,
    /// Rows used when a spawn gives none.
    pub default_rows: u16,
    /// Terminal mode used when a spawn gives none.
    pub default_terminal: TerminalMode,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            default_shell: detect_shell(None),
            max_sessions: 64,
            max_buffer_lines: DEFAULT_MAX_BUFFER_LINES,
            kill_grace: Duration::from_millis(100),
            default_read_wait: Duration::from_millis(100),
            default_cols: DEFAULT_COLS,
            default_rows: DEFAULT_ROWS,
            default_terminal: TerminalMode::Pipe,
        }
    }
}

/// Generate a session id from the current time and a random suffix.
///
/// Collisions are not guarded; a colliding spawn replaces the older entry.
pub fn generate_session_id() -> SessionId {
    format!("{}-{:08x}", now_millis(), rand::random::<u32>())
}

/// Thread-safe session manager implementation using DashMap.
///
/// This implementation provides concurrent access to sessions without
/// requiring external locking at the call site.
pub struct SessionManagerImpl {
    /// Map of session ID to session.
    sessions: Arc<DashMap<SessionId, Arc<Session>>>,
    /// Registered sessions plus spawns in flight; never exceeds `max_sessions`.
    slots: Arc<AtomicUsize>,
    settings: SessionSettings,
}

impl SessionManagerImpl {
    /// Creates a new session manager with default settings.
    pub fn new() -> Self {
        Self::with_settings(SessionSettings::default())
    }

    /// Creates a new session manager with the given settings.
    pub fn with_settings(settings: SessionSettings) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            slots: Arc::new(AtomicUsize::new(0)),
            settings,
        }
    }

    /// Looks up a live session.
    pub fn get(&self, session_id: &str) -> Result<Arc<Session>, SessionError> {
        self.sessions
            .get(session_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }

    /// Claims a session slot, failing when `max_sessions` are taken.
    fn reserve_slot(&self) -> Result<(), SessionError> {
        let max = self.settings.max_sessions;
        self.slots
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |taken| {
                (taken < max).then_some(taken + 1)
            })
            .map(|_| ())
            .map_err(|_| {
                tracing::warn!(max_sessions = max, "Session limit reached");
                SessionError::LimitReached(max)
            })
    }

    /// Removes `session` unless its id now belongs to a newer session.
    fn remove(&self, session: &Arc<Session>) -> bool {
        let removed = self
            .sessions
            .remove_if(session.id(), |_, current| Arc::ptr_eq(current, session))
            .is_some();
        if removed {
            self.slots.fetch_sub(1, Ordering::AcqRel);
        }
        removed
    }

    /// Removes the session from the registry as soon as its process exits.
    fn watch_exit(&self, session: &Arc<Session>) {
        let sessions = Arc::clone(&self.sessions);
        let slots = Arc::clone(&self.slots);
        let weak = Arc::downgrade(session);
        let session_id = session.id().clone();
        let mut exit_rx = session.subscribe_exit();

        tokio::spawn(async move {
            let _ = exit_rx.wait_for(Option::is_some).await;
            let removed = sessions
                .remove_if(&session_id, |_, current| {
                    std::ptr::eq(Arc::as_ptr(current), weak.as_ptr())
                })
                .is_some();
            if removed {
                slots.fetch_sub(1, Ordering::AcqRel);
                tracing::info!(session_id = %session_id, "Removed exited session");
            }
        });
    }

    /// Removes sessions whose process has exited but which are still registered.
    ///
    /// Returns the number of sessions removed.
    pub fn cleanup(&self) -> usize {
        let exited: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .filter(|entry| !entry.value().is_running())
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut removed = 0;
        for session in exited {
            if self.remove(&session) {
                tracing::info!(session_id = %session.id(), "Cleaned up terminated session");
                removed += 1;
            }
        }
        removed
    }

    /// Starts a background task that periodically cleans up terminated sessions.
    ///
    /// The task stops when `cancel` fires.
    pub fn start_cleanup_task(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        manager.cleanup();
                    }
                }
            }
            tracing::debug!("Session cleanup task stopped");
        })
    }

    /// Signals every live session, waits out one grace period, and empties
    /// the registry. Sessions still running after the grace period get
    /// SIGKILL. Returns the number of sessions killed.
    pub async fn kill_all(&self, signal: KillSignal) -> usize {
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        for session in &sessions {
            if let Err(e) = session.signal(signal) {
                tracing::warn!(session_id = %session.id(), error = %e, "Failed to signal session");
            }
        }

        let deadline = Instant::now() + self.settings.kill_grace;
        for session in &sessions {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if session.wait_exit(remaining).await.is_none() && signal != KillSignal::Kill {
                tracing::debug!(session_id = %session.id(), "Session outlived grace period");
                let _ = session.signal(KillSignal::Kill);
            }
            self.remove(session);
        }

        tracing::info!(count = sessions.len(), signal = %signal, "Killed all sessions");
        sessions.len()
    }
}

impl Default for SessionManagerImpl {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionManager for SessionManagerImpl {
    async fn spawn(&self, mut options: SpawnOptions) -> Result<(SessionId, u32), SessionError> {
        self.reserve_slot()?;

        if options.command.trim().is_empty() {
            options.command = self.settings.default_shell.clone();
        }

        let session_id = generate_session_id();
        let session = match Session::start(
            session_id.clone(),
            &options,
            self.settings.max_buffer_lines,
        ) {
            Ok(session) => Arc::new(session),
            Err(e) => {
                self.slots.fetch_sub(1, Ordering::AcqRel);
                tracing::warn!(command = %options.command, error = %e, "Failed to spawn session");
                return Err(e);
            }
        };
        let pid = session.pid();

        if self
            .sessions
            .insert(session_id.clone(), Arc::clone(&session))
            .is_some()
        {
            // The replaced session no longer holds a slot.
            self.slots.fetch_sub(1, Ordering::AcqRel);
        }
        self.watch_exit(&session);

        tracing::info!(
            session_id = %session_id,
            pid = pid,
            command = %options.command,
            terminal = %options.terminal,
            cols = options.cols,
            rows = options.rows,
            "Created new session"
        );

        Ok((session_id, pid))
    }

    async fn send_keys(&self, session_id: &str, keys: &str) -> Result<usize, SessionError> {
        let session = self.get(session_id)?;
        let written = session.send_keys(keys).await?;
        tracing::debug!(session_id = %session_id, bytes = written, "Sent keys");
        Ok(written)
    }

    async fn read(
        &self,
        session_id: &str,
        wait: Option<Duration>,
        clear: bool,
    ) -> Result<BufferSnapshot, SessionError> {
        let session = self.get(session_id)?;
        let wait = wait.unwrap_or(self.settings.default_read_wait);
        let snapshot = session.read(wait, clear).await;

        tracing::debug!(
            session_id = %session_id,
            wait_ms = wait.as_millis() as u64,
            clear = clear,
            lines = snapshot.lines,
            has_more = snapshot.has_more,
            "Read session output"
        );

        Ok(snapshot)
    }

    async fn kill(
        &self,
        session_id: &str,
        signal: KillSignal,
    ) -> Result<KillOutcome, SessionError> {
        let session = self.get(session_id)?;
        session.signal(signal)?;

        let exit = session.wait_exit(self.settings.kill_grace).await;
        self.remove(&session);

        tracing::info!(
            session_id = %session_id,
            pid = session.pid(),
            signal = %signal,
            exited = exit.is_some(),
            "Session killed and removed"
        );

        Ok(KillOutcome { exit })
    }

    async fn resize(&self, session_id: &str, cols: u16, rows: u16) -> Result<(), SessionError> {
        self.get(session_id)?.resize(cols, rows)
    }

    fn list(&self, verbose: bool) -> Vec<SessionSummary> {
        let mut sessions: Vec<SessionSummary> = self
            .sessions
            .iter()
            .map(|entry| entry.value().summary(verbose))
            .collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        sessions
    }

    fn exists(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    fn count(&self) -> usize {
        self.sessions.len()
    }

    fn settings(&self) -> &SessionSettings {
        &self.settings
    }
}
