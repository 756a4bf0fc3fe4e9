//! PID file utilities for daemon running detection.
//!
//! ## PID File Location
//!
//! The PID file is stored at:
//! - `$XDG_DATA_HOME/procmux/daemon.pid` if XDG_DATA_HOME is set
//! - `~/.local/share/procmux/daemon.pid` otherwise
//!
//! ## Example
//!
//! ```rust
//! use daemon::ipc::pidfile::{is_daemon_running, get_daemon_pid};
//!
//! if is_daemon_running() {
//!     if let Some(pid) = get_daemon_pid() {
//!         println!("Daemon is already running with PID {}", pid);
//!     }
//! }
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use nix::sys::signal::kill;
use nix::unistd::Pid;

/// Get the path to the daemon PID file.
pub fn get_pid_file_path() -> PathBuf {
    let data_dir = std::env::var("XDG_DATA_HOME")
        .ok()
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".local/share")
        });
    data_dir.join("procmux").join("daemon.pid")
}

/// Check if a daemon process is currently running.
///
/// Cleans up stale PID files automatically.
pub fn is_daemon_running() -> bool {
    get_daemon_pid().is_some()
}

/// Get the PID of the running daemon, if any.
pub fn get_daemon_pid() -> Option<u32> {
    read_live_pid(&get_pid_file_path())
}

/// Read the PID stored at `path` if that process is alive.
///
/// Unparsable files and files naming a dead process are removed.
pub fn read_live_pid(path: &Path) -> Option<u32> {
    let pid_str = fs::read_to_string(path).ok()?;

    let Ok(pid) = pid_str.trim().parse::<u32>() else {
        cleanup_stale_pid_file(path);
        return None;
    };

    if is_process_running(pid) {
        Some(pid)
    } else {
        cleanup_stale_pid_file(path);
        None
    }
}

/// Write the current process id to `path`, creating parent directories.
pub fn write_pid_file(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, format!("{}\n", std::process::id()))
}

/// Remove the PID file at `path` if it names the current process.
pub fn remove_pid_file(path: &Path) {
    let ours = fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse::<u32>().ok())
        .is_some_and(|pid| pid == std::process::id());

    if ours {
        cleanup_stale_pid_file(path);
    }
}

/// Check if a process with the given PID is running.
///
/// Signal 0 probes for existence; `EPERM` means the process exists but
/// belongs to someone else.
fn is_process_running(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }

    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

fn cleanup_stale_pid_file(path: &Path) {
    let _ = fs::remove_file(path);
}
