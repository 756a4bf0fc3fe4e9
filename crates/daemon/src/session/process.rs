//! Process spawning and signal plumbing.
//!
//! Every session runs its command through `/bin/sh -c` as the leader of a
//! fresh process group, so signals reach the whole job. Two attachments are
//! supported: plain pipes (the default) and a pseudo-terminal (see
//! [`super::pty`]).

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::io::{self, Write};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use protocol::{KillSignal, TerminalMode, DEFAULT_COLS, DEFAULT_ROWS};
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};

use super::pty::{self, PtyHandle};
use super::SessionError;

/// Shell used to interpret command lines.
pub const SHELL_PATH: &str = "/bin/sh";

/// Words the shell handles itself; these are never looked up on `PATH`.
const SHELL_BUILTINS: &[&str] = &[
    ".", ":", "[", "alias", "bg", "break", "builtin", "case", "cd", "command", "continue", "echo",
    "eval", "exec", "exit", "export", "false", "fg", "for", "getopts", "hash", "if", "jobs", "kill",
    "local", "printf", "pwd", "read", "readonly", "return", "set", "shift", "source", "test",
    "time", "trap", "true", "type", "ulimit", "umask", "unalias", "unset", "until", "wait",
    "while", "{", "(", "!",
];

/// Everything needed to start a session's process.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    /// Command line handed to `/bin/sh -c`.
    pub command: String,
    /// Working directory; the daemon's own when `None`.
    pub cwd: Option<PathBuf>,
    /// Variables layered over the inherited environment.
    pub env: BTreeMap<String, String>,
    /// Terminal width.
    pub cols: u16,
    /// Terminal height.
    pub rows: u16,
    /// Pipe or pseudo-terminal attachment.
    pub terminal: TerminalMode,
}

impl SpawnOptions {
    /// Options for `command` with defaults for everything else.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            cwd: None,
            env: BTreeMap::new(),
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
            terminal: TerminalMode::Pipe,
        }
    }

    /// Use a pseudo-terminal instead of pipes.
    pub fn with_terminal(mut self, terminal: TerminalMode) -> Self {
        self.terminal = terminal;
        self
    }

    /// Start in `cwd`.
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Add one environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    /// Exit code for a normal exit.
    pub code: Option<i32>,
    /// Signal number when the process was killed by a signal.
    pub signal: Option<i32>,
}

impl From<std::process::ExitStatus> for ExitInfo {
    fn from(status: std::process::ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

/// Write side of a session's process.
pub enum ProcessInput {
    /// The child's stdin pipe.
    Pipe(ChildStdin),
    /// The pseudo-terminal master's writer.
    Pty(Box<dyn Write + Send>),
}

impl ProcessInput {
    /// Write `bytes` and flush.
    ///
    /// On pipes a carriage return is delivered as a newline, matching the
    /// `ICRNL` translation a terminal applies, so `Enter` submits a line.
    pub async fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        match self {
            ProcessInput::Pipe(stdin) => {
                let translated: Vec<u8> = bytes
                    .iter()
                    .map(|&b| if b == b'\r' { b'\n' } else { b })
                    .collect();
                stdin.write_all(&translated).await?;
                stdin.flush().await
            }
            ProcessInput::Pty(writer) => {
                writer.write_all(bytes)?;
                writer.flush()
            }
        }
    }
}

/// A readable output stream of the child.
pub enum OutputStream {
    /// stdout or stderr pipe.
    Pipe(Box<dyn AsyncRead + Send + Unpin>),
    /// The pseudo-terminal master's reader.
    Pty(Box<dyn io::Read + Send>),
}

/// Owner of the child handle; resolves when the process exits.
pub enum ExitWaiter {
    /// A piped child.
    Pipe(Child),
    /// A child attached to a pseudo-terminal.
    Pty(Box<dyn portable_pty::Child + Send + Sync>),
}

impl ExitWaiter {
    /// Wait for the process to exit.
    pub async fn wait(self) -> io::Result<ExitInfo> {
        match self {
            ExitWaiter::Pipe(mut child) => child.wait().await.map(ExitInfo::from),
            ExitWaiter::Pty(mut child) => {
                let status = tokio::task::spawn_blocking(move || child.wait())
                    .await
                    .map_err(io::Error::other)??;
                Ok(pty::exit_info(&status))
            }
        }
    }
}

/// A freshly started process, before it is attached to a session.
pub struct SpawnedProcess {
    /// OS process id, also the process group id.
    pub pid: u32,
    /// Input side.
    pub input: ProcessInput,
    /// Output streams to capture.
    pub outputs: Vec<OutputStream>,
    /// Exit notification.
    pub exit: ExitWaiter,
    /// Terminal device handle, for pty sessions.
    pub pty: Option<PtyHandle>,
}

/// Start a process for `options`.
///
/// Fails with [`SessionError::SpawnFailed`] when the working directory is
/// missing, the program cannot be found, or the OS refuses to start it.
pub fn spawn_process(options: &SpawnOptions) -> Result<SpawnedProcess, SessionError> {
    if let Some(cwd) = &options.cwd {
        if !cwd.is_dir() {
            return Err(SessionError::SpawnFailed(format!(
                "working directory does not exist: {}",
                cwd.display()
            )));
        }
    }
    check_program(options)?;

    match options.terminal {
        TerminalMode::Pipe => spawn_piped(options),
        TerminalMode::Pty => pty::spawn_pty(options),
    }
}

fn spawn_piped(options: &SpawnOptions) -> Result<SpawnedProcess, SessionError> {
    let mut cmd = Command::new(SHELL_PATH);
    cmd.arg("-c")
        .arg(&options.command)
        .envs(&options.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);
    if let Some(cwd) = &options.cwd {
        cmd.current_dir(cwd);
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| SessionError::SpawnFailed(format!("{}: {e}", options.command)))?;

    let pid = child
        .id()
        .ok_or_else(|| SessionError::SpawnFailed("process exited before start".to_string()))?;

    let missing = || SessionError::SpawnFailed("child stdio was not captured".to_string());
    let stdin = child.stdin.take().ok_or_else(missing)?;
    let stdout = child.stdout.take().ok_or_else(missing)?;
    let stderr = child.stderr.take().ok_or_else(missing)?;

    Ok(SpawnedProcess {
        pid,
        input: ProcessInput::Pipe(stdin),
        outputs: vec![
            OutputStream::Pipe(Box::new(stdout)),
            OutputStream::Pipe(Box::new(stderr)),
        ],
        exit: ExitWaiter::Pipe(child),
        pty: None,
    })
}

/// Reject command lines whose program does not exist.
///
/// Only the first word is checked, and only when it is a plain program name
/// or path; shell syntax, assignments and builtins are left to the shell.
/// Lookup uses the spawn's `PATH` and working directory.
fn check_program(options: &SpawnOptions) -> Result<(), SessionError> {
    let Some(program) = options.command.split_whitespace().next() else {
        return Ok(());
    };

    let shell_syntax = program.contains(|c: char| "=$`\"'\\;|&<>(){}*?[]~".contains(c));
    if shell_syntax || SHELL_BUILTINS.contains(&program) {
        return Ok(());
    }

    let path = options
        .env
        .get("PATH")
        .map(OsString::from)
        .or_else(|| std::env::var_os("PATH"));
    let cwd = match &options.cwd {
        Some(cwd) => cwd.clone(),
        None => std::env::current_dir()?,
    };

    which::which_in(program, path, cwd).map(|_| ()).map_err(|_| {
        SessionError::SpawnFailed(format!("command not found or not executable: {program}"))
    })
}

/// Translate a wire signal into a `nix` signal.
pub fn to_nix_signal(signal: KillSignal) -> Signal {
    match signal {
        KillSignal::Term => Signal::SIGTERM,
        KillSignal::Kill => Signal::SIGKILL,
        KillSignal::Int => Signal::SIGINT,
    }
}

/// Send `signal` to the process group led by `pid`.
///
/// A group that no longer exists counts as delivered.
pub fn signal_group(pid: u32, signal: KillSignal) -> Result<(), SessionError> {
    let raw = i32::try_from(pid)
        .map_err(|_| SessionError::SignalFailed(format!("pid out of range: {pid}")))?;

    match killpg(Pid::from_raw(raw), to_nix_signal(signal)) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(e) => Err(SessionError::SignalFailed(format!(
            "{signal} to process group {pid}: {e}"
        ))),
    }
}

/// Detects the shell used for spawns with an empty command.
///
/// Returns the shell in this order of preference:
/// 1. The provided shell if Some
/// 2. The $SHELL environment variable
/// 3. /bin/sh as fallback
pub fn detect_shell(shell: Option<String>) -> String {
    if let Some(s) = shell.filter(|s| !s.trim().is_empty()) {
        return s;
    }

    std::env::var("SHELL").unwrap_or_else(|_| SHELL_PATH.to_string())
}

/// Current directory of the daemon, used when a spawn names none.
pub fn current_dir_string() -> String {
    std::env::current_dir()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| "/".to_string())
}

/// Display form of a spawn's working directory.
pub fn cwd_string(cwd: Option<&Path>) -> String {
    cwd.map(|p| p.display().to_string())
        .unwrap_or_else(current_dir_string)
}
