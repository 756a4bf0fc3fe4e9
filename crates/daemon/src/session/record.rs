//! The record of a single live session.
//!
//! A [`Session`] owns its child process: the input stream, the terminal
//! device for pty sessions, and the tasks that capture output into the
//! session's [`OutputBuffer`] and watch for exit.

use std::io::{self, Read};
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use protocol::messages::{SessionDetails, SessionSummary};
use protocol::{KillSignal, SessionState, TerminalMode};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;

use super::buffer::{BufferSnapshot, OutputBuffer, Utf8Stream};
use super::keys::encode_keys;
use super::process::{
    self, ExitInfo, ExitWaiter, OutputStream, ProcessInput, SpawnOptions,
};
use super::pty::PtyHandle;

/// Unique identifier for a session.
pub type SessionId = String;

/// Buffer size for reading process output.
const READ_BUFFER_SIZE: usize = 4096;

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The session was not found (unknown, exited, or killed).
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// The process could not be started.
    #[error("failed to spawn process: {0}")]
    SpawnFailed(String),

    /// The configured session cap is reached.
    #[error("session limit reached ({0})")]
    LimitReached(usize),

    /// Failed to write to the process input.
    #[error("failed to write to session: {0}")]
    WriteFailed(String),

    /// Failed to deliver a signal.
    #[error("failed to signal session: {0}")]
    SignalFailed(String),

    /// Failed to resize the terminal device.
    #[error("failed to resize terminal: {0}")]
    ResizeFailed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// State shared between a session and its capture tasks.
struct SessionOutput {
    buffer: Mutex<OutputBuffer>,
    last_activity: AtomicU64,
}

impl SessionOutput {
    fn append(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_str(text);
        self.touch();
    }

    fn touch(&self) {
        self.last_activity.store(now_millis(), Ordering::Relaxed);
    }
}

/// A live child process plus its captured output and metadata.
pub struct Session {
    id: SessionId,
    pid: u32,
    command: String,
    cwd: String,
    terminal: TerminalMode,
    created_at: u64,
    size: Mutex<(u16, u16)>,
    state: Arc<Mutex<SessionState>>,
    /// Number of the last signal delivered, 0 when none.
    last_signal: Arc<AtomicI32>,
    output: Arc<SessionOutput>,
    input: tokio::sync::Mutex<ProcessInput>,
    pty: Option<PtyHandle>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
}

impl Session {
    /// Spawn the process described by `options` and start capturing output.
    ///
    /// Returns once the process exists; output arrives asynchronously.
    /// Must be called within a Tokio runtime.
    pub fn start(
        id: SessionId,
        options: &SpawnOptions,
        max_buffer_lines: usize,
    ) -> Result<Self, SessionError> {
        let state = Arc::new(Mutex::new(SessionState::Created));
        let last_signal = Arc::new(AtomicI32::new(0));
        let spawned = process::spawn_process(options)?;

        let output = Arc::new(SessionOutput {
            buffer: Mutex::new(OutputBuffer::new(max_buffer_lines)),
            last_activity: AtomicU64::new(now_millis()),
        });

        for stream in spawned.outputs {
            start_capture(id.clone(), stream, Arc::clone(&output));
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        start_exit_watch(
            id.clone(),
            spawned.pid,
            spawned.exit,
            Arc::clone(&state),
            Arc::clone(&last_signal),
            exit_tx,
        );

        *state.lock().unwrap_or_else(PoisonError::into_inner) = SessionState::Running;

        Ok(Self {
            id,
            pid: spawned.pid,
            command: options.command.clone(),
            cwd: process::cwd_string(options.cwd.as_deref()),
            terminal: options.terminal,
            created_at: output.last_activity.load(Ordering::Relaxed),
            size: Mutex::new((options.cols, options.rows)),
            state,
            last_signal,
            output,
            input: tokio::sync::Mutex::new(spawned.input),
            pty: spawned.pty,
            exit_rx,
        })
    }

    /// Returns the session ID.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Returns the process ID, which is also the process group ID.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Returns the originating command.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Returns the working directory the process started in.
    pub fn cwd(&self) -> &str {
        &self.cwd
    }

    /// Returns the terminal mode.
    pub fn terminal(&self) -> TerminalMode {
        self.terminal
    }

    /// Creation time in milliseconds since the Unix epoch.
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Time of the last output or keystroke, in milliseconds since the Unix epoch.
    pub fn last_activity(&self) -> u64 {
        self.output.last_activity.load(Ordering::Relaxed)
    }

    /// Returns the recorded terminal size as `(cols, rows)`.
    pub fn size(&self) -> (u16, u16) {
        *self.size.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether no exit has been observed yet.
    pub fn is_running(&self) -> bool {
        self.exit_rx.borrow().is_none()
    }

    /// The observed exit, if any.
    pub fn exit_status(&self) -> Option<ExitInfo> {
        *self.exit_rx.borrow()
    }

    /// A receiver that is updated once the process exits.
    pub fn subscribe_exit(&self) -> watch::Receiver<Option<ExitInfo>> {
        self.exit_rx.clone()
    }

    /// Lines currently held in the output buffer.
    pub fn buffered_lines(&self) -> usize {
        self.output
            .buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Encode symbolic keys and write them to the process.
    ///
    /// Returns the number of bytes written.
    pub async fn send_keys(&self, keys: &str) -> Result<usize, SessionError> {
        let bytes = encode_keys(keys);
        self.write(&bytes).await?;
        Ok(bytes.len())
    }

    /// Write raw bytes to the process input.
    pub async fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        let mut input = self.input.lock().await;
        input
            .write_all(data)
            .await
            .map_err(|e| SessionError::WriteFailed(e.to_string()))?;
        self.output.touch();
        Ok(())
    }

    /// Wait `wait`, then return the buffered output, draining it if `clear`.
    pub async fn read(&self, wait: Duration, clear: bool) -> BufferSnapshot {
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
        self.output
            .buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .read(clear)
    }

    /// Record new terminal dimensions; pty sessions also resize the device.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        if let Some(pty) = &self.pty {
            pty.resize(cols, rows)?;
        }
        *self.size.lock().unwrap_or_else(PoisonError::into_inner) = (cols, rows);
        tracing::debug!(session_id = %self.id, cols, rows, "Resized session");
        Ok(())
    }

    /// Send `signal` to the session's process group and mark it killed.
    pub fn signal(&self, signal: KillSignal) -> Result<(), SessionError> {
        process::signal_group(self.pid, signal)?;
        self.last_signal.store(signal.number(), Ordering::Relaxed);

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != SessionState::Exited {
            *state = SessionState::Killed;
        }
        Ok(())
    }

    /// Wait up to `timeout` for the process to exit.
    pub async fn wait_exit(&self, timeout: Duration) -> Option<ExitInfo> {
        let mut rx = self.exit_rx.clone();
        let exit = match tokio::time::timeout(timeout, rx.wait_for(Option::is_some)).await {
            Ok(Ok(exit)) => *exit,
            Ok(Err(_)) | Err(_) => self.exit_status(),
        };
        exit
    }

    /// Metadata for `list`. Buffer content is never included.
    pub fn summary(&self, verbose: bool) -> SessionSummary {
        let details = verbose.then(|| {
            let (cols, rows) = self.size();
            SessionDetails {
                cols,
                rows,
                terminal: self.terminal,
                state: self.state(),
                buffered_lines: self.buffered_lines(),
            }
        });

        SessionSummary {
            id: self.id.clone(),
            pid: self.pid,
            command: self.command.clone(),
            cwd: self.cwd.clone(),
            created_at: self.created_at,
            last_activity: self.last_activity(),
            details,
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("command", &self.command)
            .field("terminal", &self.terminal)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Start a task copying one output stream into the session buffer.
fn start_capture(session_id: SessionId, stream: OutputStream, output: Arc<SessionOutput>) {
    match stream {
        OutputStream::Pipe(reader) => {
            tokio::spawn(capture_pipe(session_id, reader, output));
        }
        OutputStream::Pty(reader) => {
            tokio::task::spawn_blocking(move || capture_pty(session_id, reader, output));
        }
    }
}

async fn capture_pipe(
    session_id: SessionId,
    mut reader: Box<dyn AsyncRead + Send + Unpin>,
    output: Arc<SessionOutput>,
) {
    let mut decoder = Utf8Stream::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                tracing::trace!(session_id = %session_id, bytes = n, "Captured output");
                output.append(&decoder.decode(&buf[..n]));
            }
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "Output stream failed");
                break;
            }
        }
    }

    output.append(&decoder.finish());
    tracing::debug!(session_id = %session_id, "Output stream closed");
}

fn capture_pty(session_id: SessionId, mut reader: Box<dyn Read + Send>, output: Arc<SessionOutput>) {
    let mut decoder = Utf8Stream::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                tracing::trace!(session_id = %session_id, bytes = n, "Captured output");
                output.append(&decoder.decode(&buf[..n]));
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            // EIO once the last slave descriptor closes.
            Err(_) => break,
        }
    }

    output.append(&decoder.finish());
    tracing::debug!(session_id = %session_id, "Terminal stream closed");
}

/// Start the task that owns the child handle and publishes its exit.
fn start_exit_watch(
    session_id: SessionId,
    pid: u32,
    waiter: ExitWaiter,
    state: Arc<Mutex<SessionState>>,
    last_signal: Arc<AtomicI32>,
    exit_tx: watch::Sender<Option<ExitInfo>>,
) {
    tokio::spawn(async move {
        let exit = match waiter.wait().await {
            // A signal death the platform could not name is attributed to
            // the last signal this session delivered.
            Ok(ExitInfo {
                code: None,
                signal: None,
            }) => ExitInfo {
                code: None,
                signal: match last_signal.load(Ordering::Relaxed) {
                    0 => None,
                    number => Some(number),
                },
            },
            Ok(exit) => exit,
            Err(e) => {
                tracing::warn!(session_id = %session_id, pid, error = %e, "Failed to wait for process");
                ExitInfo {
                    code: None,
                    signal: None,
                }
            }
        };

        {
            let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state != SessionState::Killed {
                *state = SessionState::Exited;
            }
        }

        tracing::info!(
            session_id = %session_id,
            pid,
            exit_code = ?exit.code,
            signal = ?exit.signal,
            "Process exited"
        );
        let _ = exit_tx.send(Some(exit));
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start(command: &str) -> Session {
        Session::start("test-session".to_string(), &SpawnOptions::new(command), 100).unwrap()
    }

    /// Poll reads until `needle` appears; keeps everything read so far.
    async fn read_until(session: &Session, needle: &str) -> String {
        let mut seen = String::new();
        for _ in 0..50 {
            seen.push_str(&session.read(Duration::from_millis(100), true).await.content);
            if seen.contains(needle) {
                break;
            }
        }
        seen
    }

    #[tokio::test]
    async fn test_session_start() {
        let session = start("sh");
        assert!(session.pid() > 0);
        assert_eq!(session.state(), SessionState::Running);
        assert_eq!(session.size(), (80, 24));
        assert_eq!(session.terminal(), TerminalMode::Pipe);
        assert!(session.is_running());
        assert!(session.created_at() > 0);

        let _ = session.signal(KillSignal::Kill);
    }

    #[tokio::test]
    async fn test_send_keys_and_read() {
        let session = start("sh");
        let written = session.send_keys("echo session_marker Enter").await.unwrap();
        assert_eq!(written, "echo session_marker \r".len());

        let output = read_until(&session, "session_marker").await;
        assert!(output.contains("session_marker"));

        let _ = session.signal(KillSignal::Kill);
    }

    #[tokio::test]
    async fn test_stderr_is_captured() {
        let session = start("sh");
        session.send_keys("echo to_stderr >&2 Enter").await.unwrap();

        let output = read_until(&session, "to_stderr").await;
        assert!(output.contains("to_stderr"));

        let _ = session.signal(KillSignal::Kill);
    }

    #[tokio::test]
    async fn test_keystroke_updates_activity() {
        let session = start("sh");
        let before = session.last_activity();
        tokio::time::sleep(Duration::from_millis(5)).await;
        session.send_keys("Enter").await.unwrap();
        assert!(session.last_activity() >= before);

        let _ = session.signal(KillSignal::Kill);
    }

    #[tokio::test]
    async fn test_exit_is_observed() {
        let session = start("exit 3");
        let exit = session.wait_exit(Duration::from_secs(5)).await;
        assert_eq!(exit.map(|e| e.code), Some(Some(3)));
        assert_eq!(session.state(), SessionState::Exited);
        assert!(!session.is_running());
    }

    #[tokio::test]
    async fn test_signal_marks_killed() {
        let session = start("sleep 30");
        session.signal(KillSignal::Term).unwrap();

        let exit = session.wait_exit(Duration::from_secs(5)).await.unwrap();
        assert_eq!(exit.signal, Some(15));
        assert_eq!(session.state(), SessionState::Killed);
    }

    #[tokio::test]
    async fn test_signal_on_pty_session_reports_signal() {
        let options = SpawnOptions::new("sleep 30").with_terminal(TerminalMode::Pty);
        let session = Session::start("pty-session".to_string(), &options, 100).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        session.signal(KillSignal::Term).unwrap();
        let exit = session.wait_exit(Duration::from_secs(5)).await.unwrap();
        assert_eq!(exit, ExitInfo { code: None, signal: Some(15) });
    }

    #[tokio::test]
    async fn test_resize_pipe_session_updates_metadata_only() {
        let session = start("sh");
        session.resize(120, 40).unwrap();
        assert_eq!(session.size(), (120, 40));

        let summary = session.summary(true);
        let details = summary.details.unwrap();
        assert_eq!((details.cols, details.rows), (120, 40));

        let _ = session.signal(KillSignal::Kill);
    }

    #[tokio::test]
    async fn test_summary_non_verbose_has_no_details() {
        let session = start("sh");
        let summary = session.summary(false);
        assert_eq!(summary.id, "test-session");
        assert_eq!(summary.command, "sh");
        assert_eq!(summary.pid, session.pid());
        assert!(summary.details.is_none());

        let _ = session.signal(KillSignal::Kill);
    }

    #[tokio::test]
    async fn test_write_after_exit_fails() {
        let session = start("true");
        session.wait_exit(Duration::from_secs(5)).await;
        // Give the pipe a moment to report the closed reader.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let result = session.write(b"data\n").await;
        assert!(matches!(result, Err(SessionError::WriteFailed(_))));
    }

    #[test]
    fn test_session_error_display() {
        assert_eq!(
            SessionError::NotFound("abc".to_string()).to_string(),
            "session not found: abc"
        );
        assert_eq!(
            SessionError::LimitReached(64).to_string(),
            "session limit reached (64)"
        );
    }
}
