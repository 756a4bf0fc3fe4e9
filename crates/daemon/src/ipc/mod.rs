//! Unix Domain Socket IPC module for CLI-daemon communication.
//!
//! ## Overview
//!
//! The IPC system uses a JSON newline-delimited protocol. Each line is one
//! `protocol::Envelope`: a version byte, a sequence number, and a tagged
//! `Message`. The daemon answers every request on the same connection, in
//! order, echoing the request's sequence number.
//!
//! ## Socket Path
//!
//! Unless configured explicitly, the socket lives at:
//! - Primary: `$XDG_RUNTIME_DIR/procmux/daemon.sock`
//! - Fallback: `/tmp/procmux-$UID/daemon.sock`
//!
//! ## Example
//!
//! ```rust,no_run
//! use daemon::ipc::{IpcClient, get_socket_path};
//! use protocol::messages::SessionSpawn;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = IpcClient::connect(&get_socket_path()).await?;
//!
//!     let spawned = client.spawn(SessionSpawn::command("python3 -i")).await?;
//!     client.send_keys(&spawned.session_id, "print(1+1) Enter").await?;
//!
//!     Ok(())
//! }
//! ```

mod client;
pub mod pidfile;
mod server;

pub use client::IpcClient;
pub use pidfile::{get_daemon_pid, get_pid_file_path, is_daemon_running};
pub use server::{IpcConnection, IpcServer};

use std::io;
use std::path::{Path, PathBuf};

use protocol::ProtocolError;

/// Errors that can occur during IPC communication.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A framing, version, or daemon-reported error.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The daemon answered with a message that does not fit the request.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

/// Get the socket path for IPC communication.
///
/// ## Path Resolution
///
/// 1. If `$XDG_RUNTIME_DIR` is set: `$XDG_RUNTIME_DIR/procmux/daemon.sock`
/// 2. Otherwise: `/tmp/procmux-$UID/daemon.sock`
pub fn get_socket_path() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        if !runtime_dir.is_empty() {
            return PathBuf::from(runtime_dir).join("procmux").join("daemon.sock");
        }
    }

    let uid = nix::unistd::getuid();
    PathBuf::from(format!("/tmp/procmux-{uid}")).join("daemon.sock")
}

/// The configured socket path, falling back to [`get_socket_path`].
pub fn resolve_socket_path(configured: Option<&Path>) -> PathBuf {
    configured
        .map(Path::to_path_buf)
        .unwrap_or_else(get_socket_path)
}
