//! Session management module.
//!
//! This module provides keystroke encoding, output capture, process spawning
//! and the session registry. Sessions can be spawned, written to, read,
//! resized, listed and killed.

pub mod buffer;
pub mod keys;
pub mod manager;
pub mod process;
pub mod pty;
pub mod record;

pub use buffer::{BufferSnapshot, OutputBuffer};
pub use keys::encode_keys;
pub use manager::{KillOutcome, SessionManager, SessionManagerImpl, SessionSettings};
pub use process::{ExitInfo, SpawnOptions};
pub use record::{Session, SessionError, SessionId};
