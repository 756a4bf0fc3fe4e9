//! IPC Server for handling CLI connections via Unix Domain Sockets.
//!
//! The server listens on a Unix socket and accepts connections from CLI clients.
//! Every line on a connection is one JSON `Envelope`.

use std::io;
use std::path::Path;

use protocol::Envelope;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

use super::IpcError;

/// A server that listens for IPC connections on a Unix Domain Socket.
pub struct IpcServer {
    listener: UnixListener,
}

impl IpcServer {
    /// Bind the server to the specified socket path.
    ///
    /// This will create the socket file and any necessary parent directories.
    /// If a socket file already exists at the path, it will be removed first.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The parent directories cannot be created
    /// - The existing socket cannot be removed
    /// - The socket cannot be bound
    pub async fn bind(path: &Path) -> Result<Self, io::Error> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        if path.exists() {
            std::fs::remove_file(path)?;
        }

        let listener = UnixListener::bind(path)?;

        Ok(Self { listener })
    }

    /// Accept a new incoming connection.
    pub async fn accept(&self) -> Result<IpcConnection, io::Error> {
        let (stream, _addr) = self.listener.accept().await?;
        Ok(IpcConnection::new(stream))
    }
}

/// A connection to an IPC client.
pub struct IpcConnection {
    reader: BufReader<tokio::io::ReadHalf<UnixStream>>,
    writer: tokio::io::WriteHalf<UnixStream>,
}

impl IpcConnection {
    fn new(stream: UnixStream) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        }
    }

    /// Read the next envelope from the client.
    ///
    /// Returns `None` once the client has disconnected. Blank lines are
    /// skipped. A malformed line yields `IpcError::Protocol` and leaves the
    /// connection usable.
    pub async fn read_envelope(&mut self) -> Result<Option<Envelope>, IpcError> {
        loop {
            let mut line = String::new();
            let bytes_read = self.reader.read_line(&mut line).await?;

            if bytes_read == 0 {
                return Ok(None);
            }

            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            return Ok(Some(Envelope::from_json(line)?));
        }
    }

    /// Send an envelope to the client.
    pub async fn send_envelope(&mut self, envelope: &Envelope) -> Result<(), IpcError> {
        write_line(&mut self.writer, envelope).await
    }
}

/// Write `envelope` as a single JSON line and flush.
pub(super) async fn write_line<W>(writer: &mut W, envelope: &Envelope) -> Result<(), IpcError>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut json = envelope.to_json()?;
    json.push('\n');

    writer.write_all(json.as_bytes()).await?;
    writer.flush().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::messages::{Ping, Pong};
    use protocol::Message;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_server_bind_creates_parent_dirs() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("nested").join("dir").join("test.sock");

        let server = IpcServer::bind(&socket_path).await.unwrap();
        assert!(socket_path.exists());
        drop(server);
    }

    #[tokio::test]
    async fn test_server_bind_removes_existing_socket() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("test.sock");

        let server1 = IpcServer::bind(&socket_path).await.unwrap();
        drop(server1);

        let _server2 = IpcServer::bind(&socket_path).await.unwrap();
        assert!(socket_path.exists());
    }

    #[tokio::test]
    async fn test_server_accept_and_communicate() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("test.sock");

        let server = IpcServer::bind(&socket_path).await.unwrap();

        let socket_path_clone = socket_path.clone();
        let client_handle = tokio::spawn(async move {
            let stream = UnixStream::connect(&socket_path_clone).await.unwrap();
            let (read_half, mut write_half) = tokio::io::split(stream);
            let mut reader = BufReader::new(read_half);

            let request = Envelope::new(7, Message::Ping(Ping { timestamp: 42 }));
            write_half
                .write_all(format!("{}\n", request.to_json().unwrap()).as_bytes())
                .await
                .unwrap();
            write_half.flush().await.unwrap();

            let mut response_line = String::new();
            reader.read_line(&mut response_line).await.unwrap();
            Envelope::from_json(response_line.trim()).unwrap()
        });

        let mut conn = server.accept().await.unwrap();
        let request = conn.read_envelope().await.unwrap().unwrap();
        assert_eq!(request.sequence, 7);
        assert_eq!(request.payload, Message::Ping(Ping { timestamp: 42 }));

        conn.send_envelope(&request.reply(Message::Pong(Pong { timestamp: 42 })))
            .await
            .unwrap();

        let response = client_handle.await.unwrap();
        assert_eq!(response.sequence, 7);
        assert_eq!(response.payload, Message::Pong(Pong { timestamp: 42 }));
    }

    #[tokio::test]
    async fn test_malformed_line_keeps_connection() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("test.sock");
        let server = IpcServer::bind(&socket_path).await.unwrap();

        let socket_path_clone = socket_path.clone();
        tokio::spawn(async move {
            let mut stream = UnixStream::connect(&socket_path_clone).await.unwrap();
            let ping = Envelope::new(1, Message::Ping(Ping { timestamp: 1 }));
            let payload = format!("not json\n\n{}\n", ping.to_json().unwrap());
            stream.write_all(payload.as_bytes()).await.unwrap();
            stream.flush().await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        });

        let mut conn = server.accept().await.unwrap();
        assert!(matches!(
            conn.read_envelope().await,
            Err(IpcError::Protocol(_))
        ));

        let next = conn.read_envelope().await.unwrap().unwrap();
        assert_eq!(next.sequence, 1);
    }

    #[tokio::test]
    async fn test_connection_read_returns_none_on_disconnect() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("test.sock");

        let server = IpcServer::bind(&socket_path).await.unwrap();

        let socket_path_clone = socket_path.clone();
        tokio::spawn(async move {
            let _stream = UnixStream::connect(&socket_path_clone).await.unwrap();
        });

        let mut conn = server.accept().await.unwrap();

        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;

        let request = conn.read_envelope().await.unwrap();
        assert!(request.is_none());
    }
}
