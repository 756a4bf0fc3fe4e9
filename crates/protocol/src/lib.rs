//! # procmux Protocol Library
//!
//! This crate defines the request/response contract spoken between the
//! `procmux` CLI and the session daemon.
//!
//! ## Overview
//!
//! - **Message Definitions**: spawn, send-keys, read, kill, resize and list
//!   requests together with their replies, plus daemon control messages
//! - **Envelope**: version and sequence number wrapped around every message
//! - **Errors**: a single [`ProtocolError`] type for transport and remote failures
//!
//! ## Wire format
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │          Application Messages           │  JSON, tag = "type"
//! ├─────────────────────────────────────────┤
//! │              Envelope                   │  version + sequence
//! ├─────────────────────────────────────────┤
//! │        Newline-delimited stream         │  Unix domain socket
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{Envelope, Message};
//! use protocol::messages::SessionSpawn;
//!
//! let message = Message::SessionSpawn(SessionSpawn::command("python3 -i"));
//! let envelope = Envelope::new(1, message);
//!
//! let line = envelope.to_json().unwrap();
//! let decoded = Envelope::from_json(&line).unwrap();
//! assert_eq!(decoded, envelope);
//! ```

pub mod error;
pub mod messages;

pub use error::{ProtocolError, Result};
pub use messages::{
    Envelope, ErrorCode, ErrorMessage, KillSignal, Message, SessionState, TerminalMode,
    DEFAULT_COLS, DEFAULT_ROWS, PROTOCOL_VERSION,
};
