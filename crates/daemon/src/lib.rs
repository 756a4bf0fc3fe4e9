//! # procmux Daemon Library
//!
//! This crate keeps interactive command-line programs running in the
//! background and lets callers drive them by keystroke: spawn a process,
//! send it key sequences, read what it printed, resize its terminal, and
//! kill it.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     Daemon Orchestrator                      │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌────────────────┐   ┌──────────────────────────────────┐   │
//! │  │  IPC Server    │──▶│          Message Router          │   │
//! │  │ (Unix socket)  │   └──────────────────────────────────┘   │
//! │  └────────────────┘                    │                     │
//! │                        ┌──────────────────────────────────┐  │
//! │                        │  Session Manager (registry)      │  │
//! │                        │  ┌──────┐ ┌────────┐ ┌────────┐  │  │
//! │                        │  │ keys │ │ buffer │ │process │  │  │
//! │                        │  └──────┘ └────────┘ └────────┘  │  │
//! │                        └──────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use daemon::session::{SessionManager, SessionManagerImpl, SpawnOptions};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let manager = SessionManagerImpl::new();
//!
//!     let (id, _pid) = manager.spawn(SpawnOptions::new("python3 -i")).await?;
//!     manager.send_keys(&id, "print(1+1) Enter").await?;
//!
//!     let output = manager.read(&id, Some(Duration::from_millis(300)), true).await?;
//!     println!("{}", output.content);
//!
//!     manager.kill(&id, protocol::KillSignal::Term).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`session`]: Key encoding, output buffering, process spawning, and the session registry
//! - [`router`]: Message routing to the session manager
//! - [`ipc`]: Unix socket server, client, and PID file
//! - [`orchestrator`]: Main daemon coordinator

pub mod config;
pub mod ipc;
pub mod orchestrator;
pub mod router;
pub mod session;

// Re-export protocol for convenience
pub use protocol;

pub use config::Config;

pub use session::{
    encode_keys, BufferSnapshot, KillOutcome, OutputBuffer, Session, SessionError, SessionId,
    SessionManager, SessionManagerImpl, SessionSettings, SpawnOptions,
};

pub use router::{MessageRouter, RouterError, RouterResult};

pub use ipc::{IpcClient, IpcError, IpcServer};

pub use orchestrator::{DaemonOrchestrator, OrchestratorEvent, OrchestratorState};
