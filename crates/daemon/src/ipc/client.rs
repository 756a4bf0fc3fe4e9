//! IPC Client for communicating with the daemon via Unix Domain Sockets.
//!
//! The client connects to the daemon's Unix socket and sends requests,
//! receiving replies in a request-response pattern. Replies carry the
//! sequence number of the request they answer.

use std::io;
use std::path::Path;
use std::time::Duration;

use protocol::messages::{
    Ack, Ping, SessionKill, SessionKilled, SessionList, SessionOutput, SessionRead,
    SessionResize, SessionSendKeys, SessionSpawn, SessionSpawned, SessionSummary, StatusReport,
};
use protocol::{Envelope, KillSignal, Message};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UnixStream;

use super::server::write_line;
use super::IpcError;

/// Default timeout for client operations in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 5;

/// A client for communicating with the daemon via IPC.
pub struct IpcClient {
    reader: BufReader<tokio::io::ReadHalf<UnixStream>>,
    writer: tokio::io::WriteHalf<UnixStream>,
    timeout: Duration,
    next_sequence: u64,
}

impl IpcClient {
    /// Connect to the daemon at the specified socket path.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    /// This typically indicates that the daemon is not running.
    pub async fn connect(path: &Path) -> Result<Self, IpcError> {
        let stream = UnixStream::connect(path).await?;
        Ok(Self::from_stream(
            stream,
            Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        ))
    }

    /// Connect to the daemon with a custom timeout.
    pub async fn connect_with_timeout(path: &Path, timeout: Duration) -> Result<Self, IpcError> {
        let stream = tokio::time::timeout(timeout, UnixStream::connect(path))
            .await
            .map_err(|_| {
                IpcError::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "connection timed out",
                ))
            })??;

        Ok(Self::from_stream(stream, timeout))
    }

    fn from_stream(stream: UnixStream, timeout: Duration) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            timeout,
            next_sequence: 1,
        }
    }

    /// Set the timeout for operations.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Send a request and wait for its reply.
    ///
    /// A `Message::Error` reply is returned as-is; the typed helpers below
    /// turn it into `IpcError::Protocol`.
    pub async fn request(&mut self, payload: Message) -> Result<Message, IpcError> {
        self.request_with_timeout(payload, self.timeout).await
    }

    async fn request_with_timeout(
        &mut self,
        payload: Message,
        timeout: Duration,
    ) -> Result<Message, IpcError> {
        tokio::time::timeout(timeout, self.request_internal(payload))
            .await
            .map_err(|_| {
                IpcError::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "operation timed out",
                ))
            })?
    }

    async fn request_internal(&mut self, payload: Message) -> Result<Message, IpcError> {
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        write_line(&mut self.writer, &Envelope::new(sequence, payload)).await?;

        let mut line = String::new();
        let bytes_read = self.reader.read_line(&mut line).await?;

        if bytes_read == 0 {
            return Err(IpcError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "daemon closed connection",
            )));
        }

        let reply = Envelope::from_json(line.trim())?;
        if reply.sequence != sequence {
            return Err(IpcError::UnexpectedResponse(format!(
                "reply sequence {} does not match request {}",
                reply.sequence, sequence
            )));
        }

        Ok(reply.payload)
    }

    /// Send a ping request to check if the daemon is responsive.
    ///
    /// Returns `true` if the daemon echoes the ping timestamp.
    pub async fn ping(&mut self) -> Result<bool, IpcError> {
        let timestamp = crate::session::record::now_millis();
        let response = self.request(Message::Ping(Ping { timestamp })).await?;
        Ok(matches!(response, Message::Pong(pong) if pong.timestamp == timestamp))
    }

    /// Get the current status of the daemon.
    pub async fn status(&mut self) -> Result<StatusReport, IpcError> {
        match self.request(Message::Status).await? {
            Message::StatusReport(report) => Ok(report),
            other => Err(unexpected(other)),
        }
    }

    /// Request the daemon to stop.
    pub async fn shutdown(&mut self) -> Result<(), IpcError> {
        match self.request(Message::Shutdown).await? {
            Message::ShuttingDown => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Spawn a new session.
    pub async fn spawn(&mut self, request: SessionSpawn) -> Result<SessionSpawned, IpcError> {
        match self.request(Message::SessionSpawn(request)).await? {
            Message::SessionSpawned(spawned) => Ok(spawned),
            other => Err(unexpected(other)),
        }
    }

    /// Send an encoded key sequence to a session.
    pub async fn send_keys(&mut self, session_id: &str, keys: &str) -> Result<Ack, IpcError> {
        let request = Message::SessionSendKeys(SessionSendKeys {
            session_id: session_id.to_string(),
            keys: keys.to_string(),
        });
        match self.request(request).await? {
            Message::Ack(ack) => Ok(ack),
            other => Err(unexpected(other)),
        }
    }

    /// Read a session's buffered output.
    ///
    /// The operation timeout is extended by the requested wait.
    pub async fn read(&mut self, request: SessionRead) -> Result<SessionOutput, IpcError> {
        let timeout = self.timeout + Duration::from_millis(request.wait_ms.unwrap_or(0));
        match self
            .request_with_timeout(Message::SessionRead(request), timeout)
            .await?
        {
            Message::SessionOutput(output) => Ok(output),
            other => Err(unexpected(other)),
        }
    }

    /// Kill a session.
    pub async fn kill(
        &mut self,
        session_id: &str,
        signal: KillSignal,
    ) -> Result<SessionKilled, IpcError> {
        let request = Message::SessionKill(SessionKill {
            session_id: session_id.to_string(),
            signal,
        });
        match self.request(request).await? {
            Message::SessionKilled(killed) => Ok(killed),
            other => Err(unexpected(other)),
        }
    }

    /// Resize a session's terminal.
    pub async fn resize(&mut self, session_id: &str, cols: u16, rows: u16) -> Result<Ack, IpcError> {
        let request = Message::SessionResize(SessionResize {
            session_id: session_id.to_string(),
            cols,
            rows,
        });
        match self.request(request).await? {
            Message::Ack(ack) => Ok(ack),
            other => Err(unexpected(other)),
        }
    }

    /// List live sessions.
    pub async fn list(&mut self, verbose: bool) -> Result<Vec<SessionSummary>, IpcError> {
        match self
            .request(Message::SessionList(SessionList { verbose }))
            .await?
        {
            Message::SessionListing(listing) => Ok(listing.sessions),
            other => Err(unexpected(other)),
        }
    }
}

/// Convert an unexpected reply into an error, surfacing daemon errors.
fn unexpected(reply: Message) -> IpcError {
    match reply {
        Message::Error(err) => IpcError::Protocol(err.into_error()),
        other => IpcError::UnexpectedResponse(format!("{other:?}")),
    }
}
