//! Pseudo-terminal attachment.
//!
//! Sessions spawned with `terminal = pty` get a real terminal device of the
//! requested size. Output of the single master stream feeds the same output
//! buffer as piped sessions; resizes reach the device, and `C-c` is turned
//! into SIGINT by the line discipline.

use std::sync::{Mutex, PoisonError};

use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};

use super::process::{
    ExitInfo, ExitWaiter, OutputStream, ProcessInput, SpawnOptions, SpawnedProcess, SHELL_PATH,
};
use super::SessionError;

/// `TERM` value exported to pty sessions that do not set their own.
const DEFAULT_TERM: &str = "xterm-256color";

/// Master side of a session's terminal, kept for resizing.
pub struct PtyHandle {
    master: Mutex<Box<dyn MasterPty + Send>>,
}

impl PtyHandle {
    /// Resize the terminal device.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        let master = self.master.lock().unwrap_or_else(PoisonError::into_inner);
        master
            .resize(pty_size(cols, rows))
            .map_err(|e| SessionError::ResizeFailed(e.to_string()))
    }

    /// Current size of the terminal device as `(cols, rows)`.
    pub fn size(&self) -> Result<(u16, u16), SessionError> {
        let master = self.master.lock().unwrap_or_else(PoisonError::into_inner);
        let size = master
            .get_size()
            .map_err(|e| SessionError::ResizeFailed(e.to_string()))?;
        Ok((size.cols, size.rows))
    }
}

fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Spawn `options.command` through `/bin/sh -c` on a new terminal.
///
/// The child becomes a session leader, so its pid is also its process group.
pub(crate) fn spawn_pty(options: &SpawnOptions) -> Result<SpawnedProcess, SessionError> {
    let pty_system = native_pty_system();

    let pair = pty_system
        .openpty(pty_size(options.cols, options.rows))
        .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

    let mut cmd = CommandBuilder::new(SHELL_PATH);
    cmd.arg("-c");
    cmd.arg(&options.command);

    if let Some(dir) = &options.cwd {
        cmd.cwd(dir);
    }

    if !options.env.contains_key("TERM") {
        cmd.env("TERM", DEFAULT_TERM);
    }
    for (key, value) in &options.env {
        cmd.env(key, value);
    }

    let child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| SessionError::SpawnFailed(format!("{}: {e}", options.command)))?;

    // The master must observe EOF once the child exits.
    drop(pair.slave);

    let pid = child
        .process_id()
        .ok_or_else(|| SessionError::SpawnFailed("pty child has no pid".to_string()))?;

    let reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

    let writer = pair
        .master
        .take_writer()
        .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

    Ok(SpawnedProcess {
        pid,
        input: ProcessInput::Pty(writer),
        outputs: vec![OutputStream::Pty(reader)],
        exit: ExitWaiter::Pty(child),
        pty: Some(PtyHandle {
            master: Mutex::new(pair.master),
        }),
    })
}

/// Prefix of portable-pty's description of a signal death.
const TERMINATED_BY: &str = "Terminated by ";

/// Signal descriptions as printed by `strsignal` in the C locale.
const SIGNAL_DESCRIPTIONS: &[(&str, i32)] = &[
    ("Hangup", 1),
    ("Interrupt", 2),
    ("Quit", 3),
    ("Aborted", 6),
    ("Killed", 9),
    ("Segmentation fault", 11),
    ("Broken pipe", 13),
    ("Alarm clock", 14),
    ("Terminated", 15),
];

/// Exit information of a pty child.
///
/// portable-pty reports a signal death as code 1 plus a description, so the
/// code is dropped and the signal number is recovered from the description
/// where it is known. An unknown description leaves both fields empty.
pub(crate) fn exit_info(status: &portable_pty::ExitStatus) -> ExitInfo {
    let description = status.to_string();
    match description.strip_prefix(TERMINATED_BY) {
        Some(name) => ExitInfo {
            code: None,
            signal: signal_number(name),
        },
        None => ExitInfo {
            code: i32::try_from(status.exit_code()).ok(),
            signal: None,
        },
    }
}

fn signal_number(description: &str) -> Option<i32> {
    if let Some(number) = description.strip_prefix("Signal ") {
        return number.trim().parse().ok();
    }
    SIGNAL_DESCRIPTIONS
        .iter()
        .find(|(name, _)| *name == description)
        .map(|&(_, number)| number)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::process::{signal_group, spawn_process};
    use protocol::{KillSignal, TerminalMode};
    use std::io::Read;
    use std::time::{Duration, Instant};

    fn pty_options(command: &str) -> SpawnOptions {
        SpawnOptions::new(command).with_terminal(TerminalMode::Pty)
    }

    /// Read from a pty until `needle` shows up or the deadline passes.
    fn read_until(mut reader: Box<dyn Read + Send>, needle: &str) -> String {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut seen = String::new();
        let mut buf = [0u8; 1024];
        while Instant::now() < deadline && !seen.contains(needle) {
            match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => seen.push_str(&String::from_utf8_lossy(&buf[..n])),
            }
        }
        seen
    }

    #[tokio::test]
    async fn test_spawn_pty_session() {
        let spawned = spawn_process(&pty_options("echo from-pty")).unwrap();
        assert!(spawned.pid > 0);
        assert!(spawned.pty.is_some());
        assert_eq!(spawned.outputs.len(), 1);

        let reader = match spawned.outputs.into_iter().next().unwrap() {
            OutputStream::Pty(reader) => reader,
            OutputStream::Pipe(_) => panic!("expected a pty stream"),
        };
        let output = tokio::task::spawn_blocking(move || read_until(reader, "from-pty"))
            .await
            .unwrap();
        assert!(output.contains("from-pty"));

        let exit = spawned.exit.wait().await.unwrap();
        assert_eq!(exit.code, Some(0));
    }

    #[tokio::test]
    async fn test_pty_sets_term() {
        let spawned = spawn_process(&pty_options("echo TERM=$TERM")).unwrap();
        let reader = match spawned.outputs.into_iter().next().unwrap() {
            OutputStream::Pty(reader) => reader,
            OutputStream::Pipe(_) => panic!("expected a pty stream"),
        };
        let output = tokio::task::spawn_blocking(move || read_until(reader, "xterm-256color"))
            .await
            .unwrap();
        assert!(output.contains("TERM=xterm-256color"));
        let _ = spawned.exit.wait().await;
    }

    #[test]
    fn test_exit_info_normal_exit() {
        let exit = exit_info(&portable_pty::ExitStatus::with_exit_code(3));
        assert_eq!(exit, ExitInfo { code: Some(3), signal: None });
    }

    #[test]
    fn test_exit_info_signal_death_drops_placeholder_code() {
        let exit = exit_info(&portable_pty::ExitStatus::with_signal("Terminated"));
        assert_eq!(exit, ExitInfo { code: None, signal: Some(15) });

        let exit = exit_info(&portable_pty::ExitStatus::with_signal("Signal 10"));
        assert_eq!(exit.signal, Some(10));

        let exit = exit_info(&portable_pty::ExitStatus::with_signal("Beendet"));
        assert_eq!(exit, ExitInfo { code: None, signal: None });
    }

    #[tokio::test]
    async fn test_pty_signal_death_reports_signal() {
        let spawned = spawn_process(&pty_options("sleep 30")).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        signal_group(spawned.pid, KillSignal::Term).unwrap();
        let exit = spawned.exit.wait().await.unwrap();
        assert_eq!(exit.code, None);
        assert_eq!(exit.signal, Some(15));
    }

    #[tokio::test]
    async fn test_pty_resize_reaches_device() {
        let spawned = spawn_process(&pty_options("sleep 5")).unwrap();
        let pty = spawned.pty.as_ref().unwrap();
        assert_eq!(pty.size().unwrap(), (80, 24));

        pty.resize(132, 43).unwrap();
        assert_eq!(pty.size().unwrap(), (132, 43));

        signal_group(spawned.pid, KillSignal::Kill).unwrap();
        let _ = spawned.exit.wait().await;
    }
}
