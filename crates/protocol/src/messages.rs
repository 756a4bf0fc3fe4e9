//! Protocol message definitions for procmux.
//!
//! This module defines the request/response contract of the session manager.
//! Every request and every reply travels inside an [`Envelope`] that carries
//! the protocol version and a sequence number; replies echo the sequence
//! number of the request they answer.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Default terminal width hint.
pub const DEFAULT_COLS: u16 = 80;

/// Default terminal height hint.
pub const DEFAULT_ROWS: u16 = 24;

/// Envelope wrapper for all protocol messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Protocol version for compatibility checking.
    pub version: u8,
    /// Sequence number used to pair replies with requests.
    pub sequence: u64,
    /// The actual message payload.
    pub payload: Message,
}

impl Envelope {
    /// Create a new envelope with the current protocol version.
    pub fn new(sequence: u64, payload: Message) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            sequence,
            payload,
        }
    }

    /// Build the reply envelope for this request.
    pub fn reply(&self, payload: Message) -> Self {
        Self::new(self.sequence, payload)
    }

    /// Serialize the envelope to a single JSON line (without the newline).
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(ProtocolError::from)
    }

    /// Parse an envelope from JSON and check its protocol version.
    pub fn from_json(text: &str) -> Result<Self> {
        let envelope: Envelope = serde_json::from_str(text)?;
        if envelope.version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                got: envelope.version,
            });
        }
        Ok(envelope)
    }
}

/// Top-level message enum containing all message types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Message {
    // Session requests and their replies
    /// Request to spawn a new session.
    SessionSpawn(SessionSpawn),
    /// Reply to `SessionSpawn`.
    SessionSpawned(SessionSpawned),
    /// Request to write symbolic keystrokes to a session.
    SessionSendKeys(SessionSendKeys),
    /// Request to read a session's buffered output.
    SessionRead(SessionRead),
    /// Reply to `SessionRead`.
    SessionOutput(SessionOutput),
    /// Request to signal and remove a session.
    SessionKill(SessionKill),
    /// Reply to `SessionKill`.
    SessionKilled(SessionKilled),
    /// Request to record new terminal dimensions.
    SessionResize(SessionResize),
    /// Request to list live sessions.
    SessionList(SessionList),
    /// Reply to `SessionList`.
    SessionListing(SessionListing),
    /// Generic success reply for `SessionSendKeys` and `SessionResize`.
    Ack(Ack),

    // Control messages
    /// Liveness probe.
    Ping(Ping),
    /// Reply to `Ping`.
    Pong(Pong),
    /// Request daemon status.
    Status,
    /// Reply to `Status`.
    StatusReport(StatusReport),
    /// Request a graceful daemon shutdown.
    Shutdown,
    /// Reply to `Shutdown`.
    ShuttingDown,
    /// Error reply.
    Error(ErrorMessage),
}

// ============================================================================
// Session Messages
// ============================================================================

/// How the child process is attached to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminalMode {
    /// Plain stdin/stdout/stderr pipes; size is metadata only.
    #[default]
    Pipe,
    /// A pseudo-terminal sized to the session's cols/rows.
    Pty,
}

impl fmt::Display for TerminalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminalMode::Pipe => f.write_str("pipe"),
            TerminalMode::Pty => f.write_str("pty"),
        }
    }
}

impl FromStr for TerminalMode {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pipe" => Ok(TerminalMode::Pipe),
            "pty" => Ok(TerminalMode::Pty),
            other => Err(ProtocolError::Deserialization(format!(
                "unknown terminal mode: {other}"
            ))),
        }
    }
}

/// Request to spawn a new session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSpawn {
    /// Command line run through `/bin/sh -c`. Empty means the default shell.
    pub command: String,
    /// Working directory for the child.
    #[serde(default)]
    pub cwd: Option<String>,
    /// Environment variables layered over the daemon's environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Terminal width hint; the daemon default (80) when absent.
    #[serde(default)]
    pub cols: Option<u16>,
    /// Terminal height hint; the daemon default (24) when absent.
    #[serde(default)]
    pub rows: Option<u16>,
    /// Terminal mode; the daemon's configured default when absent.
    #[serde(default)]
    pub terminal: Option<TerminalMode>,
}

impl SessionSpawn {
    /// Spawn request for `command` with every other field defaulted.
    pub fn command(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }
}

/// Reply to a spawn request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSpawned {
    /// Unique session identifier.
    pub session_id: String,
    /// Process ID of the child.
    pub pid: u32,
}

/// Request to send symbolic keystrokes such as `"echo hi Enter"` or `"C-c"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSendKeys {
    /// Target session.
    pub session_id: String,
    /// Literal text mixed with key tokens.
    pub keys: String,
}

/// Request to read buffered output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRead {
    /// Target session.
    pub session_id: String,
    /// Milliseconds to wait before sampling the buffer; the daemon default when absent.
    #[serde(default)]
    pub wait_ms: Option<u64>,
    /// Drain the buffer as part of the read.
    #[serde(default = "default_clear")]
    pub clear: bool,
}

impl SessionRead {
    /// Read with the daemon's default wait that drains the buffer.
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            wait_ms: None,
            clear: true,
        }
    }
}

fn default_clear() -> bool {
    true
}

/// Buffered output returned by a read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOutput {
    /// Session the output belongs to.
    pub session_id: String,
    /// Captured output, concatenated in arrival order.
    pub content: String,
    /// Number of buffered lines represented by `content`.
    pub lines: usize,
    /// Whether output arrived since the previous read.
    pub has_more: bool,
    /// Lines evicted by the buffer bound since the previous read.
    #[serde(default)]
    pub dropped: u64,
}

/// Signals accepted by `SessionKill`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum KillSignal {
    /// Polite termination request.
    #[default]
    #[serde(rename = "SIGTERM")]
    Term,
    /// Uncatchable kill.
    #[serde(rename = "SIGKILL")]
    Kill,
    /// Keyboard interrupt.
    #[serde(rename = "SIGINT")]
    Int,
}

impl KillSignal {
    /// POSIX signal number.
    pub fn number(self) -> i32 {
        match self {
            KillSignal::Term => 15,
            KillSignal::Kill => 9,
            KillSignal::Int => 2,
        }
    }

    /// Canonical `SIG*` name.
    pub fn name(self) -> &'static str {
        match self {
            KillSignal::Term => "SIGTERM",
            KillSignal::Kill => "SIGKILL",
            KillSignal::Int => "SIGINT",
        }
    }
}

impl fmt::Display for KillSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for KillSignal {
    type Err = ProtocolError;

    /// Accepts `SIGTERM`, `TERM`, `15` and the equivalents for KILL and INT.
    fn from_str(s: &str) -> Result<Self> {
        let upper = s.trim().to_ascii_uppercase();
        let name = upper.strip_prefix("SIG").unwrap_or(&upper);
        match name {
            "TERM" | "15" => Ok(KillSignal::Term),
            "KILL" | "9" => Ok(KillSignal::Kill),
            "INT" | "2" => Ok(KillSignal::Int),
            _ => Err(ProtocolError::Deserialization(format!(
                "unsupported signal: {s} (expected SIGTERM, SIGKILL or SIGINT)"
            ))),
        }
    }
}

/// Request to kill a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionKill {
    /// Session to kill.
    pub session_id: String,
    /// Signal to deliver (default: SIGTERM).
    #[serde(default)]
    pub signal: KillSignal,
}

/// Reply to a kill request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionKilled {
    /// Session that was removed.
    pub session_id: String,
    /// Whether the signal was delivered.
    pub success: bool,
    /// Exit code, if the process exited normally within the grace period.
    pub exit_code: Option<i32>,
    /// Terminating signal, if the process died from a signal within the grace period.
    pub signal: Option<i32>,
}

/// Request to record new terminal dimensions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionResize {
    /// Session to resize.
    pub session_id: String,
    /// New terminal columns.
    pub cols: u16,
    /// New terminal rows.
    pub rows: u16,
}

/// Request to list sessions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionList {
    /// Include size, mode, state and buffer occupancy.
    #[serde(default)]
    pub verbose: bool,
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Record exists, process not yet confirmed started.
    Created,
    /// Process is live and accepts input.
    Running,
    /// Process exited on its own.
    Exited,
    /// Process was killed on request.
    Killed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Created => "created",
            SessionState::Running => "running",
            SessionState::Exited => "exited",
            SessionState::Killed => "killed",
        };
        f.write_str(s)
    }
}

/// Identity and metadata of a live session. Buffer content is never included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Unique session identifier.
    pub id: String,
    /// Process ID of the child.
    pub pid: u32,
    /// Originating command.
    pub command: String,
    /// Working directory the child started in.
    pub cwd: String,
    /// Creation time, milliseconds since the Unix epoch.
    pub created_at: u64,
    /// Last output or keystroke, milliseconds since the Unix epoch.
    pub last_activity: u64,
    /// Extra fields, present for verbose listings only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<SessionDetails>,
}

/// Verbose-only session fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDetails {
    /// Recorded terminal columns.
    pub cols: u16,
    /// Recorded terminal rows.
    pub rows: u16,
    /// Terminal mode of the session.
    pub terminal: TerminalMode,
    /// Current lifecycle state.
    pub state: SessionState,
    /// Lines currently held in the output buffer.
    pub buffered_lines: usize,
}

/// Reply to a list request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionListing {
    /// All live sessions.
    pub sessions: Vec<SessionSummary>,
}

/// Generic success reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    /// Session the request targeted.
    pub session_id: String,
    /// Always true for a delivered ack; failures are `Message::Error`.
    pub success: bool,
}

impl Ack {
    /// Successful ack for `session_id`.
    pub fn ok(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            success: true,
        }
    }
}

// ============================================================================
// Control Messages
// ============================================================================

/// Liveness probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    /// Timestamp chosen by the sender, echoed back.
    pub timestamp: u64,
}

/// Reply to a ping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    /// Original timestamp from the ping.
    pub timestamp: u64,
}

/// Daemon status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Seconds since the daemon started.
    pub uptime_secs: u64,
    /// Number of live sessions.
    pub session_count: usize,
    /// Process ID of the daemon.
    pub pid: u32,
}

/// Error message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// Error code for programmatic handling.
    pub code: ErrorCode,
    /// Human-readable error message.
    pub message: String,
    /// Optional context (e.g. the session id).
    pub context: Option<String>,
    /// Whether retrying the same request may succeed.
    pub recoverable: bool,
}

impl ErrorMessage {
    /// Convert a received error reply into a local error value.
    pub fn into_error(self) -> ProtocolError {
        match (self.code, self.context) {
            (ErrorCode::NotFound, Some(session_id)) => ProtocolError::SessionNotFound { session_id },
            (code, _) => ProtocolError::Remote {
                code,
                message: self.message,
            },
        }
    }
}

/// Error codes for common error conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Unknown or unspecified error.
    Unknown,
    /// Session not found (unknown or already removed).
    NotFound,
    /// The process could not be started.
    SpawnFailed,
    /// The configured session cap was reached.
    LimitReached,
    /// Invalid request or parameters.
    InvalidRequest,
    /// Server-side error.
    InternalError,
    /// Request timed out.
    Timeout,
    /// Protocol version mismatch.
    VersionMismatch,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_version() {
        let envelope = Envelope::new(1, Message::Ping(Ping { timestamp: 12345 }));
        assert_eq!(envelope.version, PROTOCOL_VERSION);
    }

    #[test]
    fn test_reply_keeps_sequence() {
        let request = Envelope::new(77, Message::Status);
        let reply = request.reply(Message::ShuttingDown);
        assert_eq!(reply.sequence, 77);
        assert_eq!(reply.payload, Message::ShuttingDown);
    }

    #[test]
    fn test_envelope_json_roundtrip() {
        let mut env = BTreeMap::new();
        env.insert("LANG".to_string(), "C".to_string());
        let envelope = Envelope::new(
            42,
            Message::SessionSpawn(SessionSpawn {
                command: "sh".to_string(),
                cwd: Some("/tmp".to_string()),
                env,
                cols: Some(120),
                rows: Some(40),
                terminal: Some(TerminalMode::Pty),
            }),
        );
        let json = envelope.to_json().unwrap();
        assert!(!json.contains('\n'));
        assert_eq!(Envelope::from_json(&json).unwrap(), envelope);
    }

    #[test]
    fn test_from_json_rejects_other_version() {
        let json = r#"{"version":9,"sequence":1,"payload":{"type":"Status"}}"#;
        let err = Envelope::from_json(json).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::VersionMismatch { expected: 1, got: 9 }
        ));
    }

    #[test]
    fn test_spawn_defaults_from_minimal_json() {
        let json = r#"{"type":"SessionSpawn","data":{"command":"sh"}}"#;
        let message: Message = serde_json::from_str(json).unwrap();
        match message {
            Message::SessionSpawn(spawn) => {
                assert_eq!(spawn.command, "sh");
                assert_eq!(spawn.cols, None);
                assert_eq!(spawn.rows, None);
                assert!(spawn.env.is_empty());
                assert!(spawn.cwd.is_none());
                assert!(spawn.terminal.is_none());
            }
            other => panic!("Expected SessionSpawn, got {other:?}"),
        }
    }

    #[test]
    fn test_read_defaults_to_clear() {
        let json = r#"{"type":"SessionRead","data":{"session_id":"s1"}}"#;
        let message: Message = serde_json::from_str(json).unwrap();
        assert_eq!(message, Message::SessionRead(SessionRead::new("s1")));
    }

    #[test]
    fn test_kill_defaults_to_sigterm() {
        let json = r#"{"type":"SessionKill","data":{"session_id":"s1"}}"#;
        let message: Message = serde_json::from_str(json).unwrap();
        match message {
            Message::SessionKill(kill) => assert_eq!(kill.signal, KillSignal::Term),
            other => panic!("Expected SessionKill, got {other:?}"),
        }
    }

    #[test]
    fn test_kill_signal_wire_names() {
        assert_eq!(serde_json::to_string(&KillSignal::Kill).unwrap(), r#""SIGKILL""#);
        let parsed: KillSignal = serde_json::from_str(r#""SIGINT""#).unwrap();
        assert_eq!(parsed, KillSignal::Int);
    }

    #[test]
    fn test_kill_signal_from_str() {
        assert_eq!("SIGTERM".parse::<KillSignal>().unwrap(), KillSignal::Term);
        assert_eq!("term".parse::<KillSignal>().unwrap(), KillSignal::Term);
        assert_eq!("9".parse::<KillSignal>().unwrap(), KillSignal::Kill);
        assert_eq!("SigInt".parse::<KillSignal>().unwrap(), KillSignal::Int);
        assert!("SIGHUP".parse::<KillSignal>().is_err());
        assert_eq!(KillSignal::Int.number(), 2);
    }

    #[test]
    fn test_terminal_mode_from_str() {
        assert_eq!("PTY".parse::<TerminalMode>().unwrap(), TerminalMode::Pty);
        assert_eq!("pipe".parse::<TerminalMode>().unwrap(), TerminalMode::Pipe);
        assert!("tty".parse::<TerminalMode>().is_err());
        assert_eq!(TerminalMode::default(), TerminalMode::Pipe);
    }

    #[test]
    fn test_summary_omits_details_when_not_verbose() {
        let summary = SessionSummary {
            id: "s1".to_string(),
            pid: 10,
            command: "sh".to_string(),
            cwd: "/".to_string(),
            created_at: 1,
            last_activity: 2,
            details: None,
        };
        let json = serde_json::to_string(&summary).unwrap();
        assert!(!json.contains("details"));
        assert!(!json.contains("content"));
    }

    #[test]
    fn test_unit_control_messages() {
        let json = serde_json::to_string(&Message::Shutdown).unwrap();
        assert_eq!(json, r#"{"type":"Shutdown"}"#);
        let parsed: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, Message::Shutdown);
    }

    #[test]
    fn test_not_found_error_maps_to_session_not_found() {
        let message = ErrorMessage {
            code: ErrorCode::NotFound,
            message: "session not found: s9".to_string(),
            context: Some("s9".to_string()),
            recoverable: false,
        };
        assert!(matches!(
            message.into_error(),
            ProtocolError::SessionNotFound { session_id } if session_id == "s9"
        ));
    }
}
