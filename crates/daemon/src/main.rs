//! procmux daemon and CLI
//!
//! Keeps interactive processes alive behind a local socket.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use daemon::config::Config;
use daemon::ipc::{get_daemon_pid, is_daemon_running, resolve_socket_path, IpcClient};
use daemon::orchestrator::{DaemonOrchestrator, OrchestratorEvent};
use protocol::messages::{SessionRead, SessionSpawn, SessionSummary};
use protocol::{KillSignal, TerminalMode};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// procmux - run interactive programs in the background and drive them by keystroke.
#[derive(Parser, Debug)]
#[command(name = "procmux")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the daemon in the foreground
    Start {
        /// Socket path to listen on (overrides the config file)
        #[arg(long, value_name = "PATH")]
        socket: Option<PathBuf>,
    },

    /// Stop the running daemon
    Stop {
        /// Force immediate termination (SIGKILL); sessions are not cleaned up
        #[arg(long, short)]
        force: bool,

        /// Timeout in seconds for graceful shutdown (default: 30)
        #[arg(long, default_value = "30")]
        timeout: u64,
    },

    /// Show daemon status
    Status,

    /// Manage sessions
    #[command(subcommand)]
    Sessions(SessionsCommands),
}

/// Subcommands for session management.
#[derive(Subcommand, Debug, Clone)]
pub enum SessionsCommands {
    /// Spawn a new session
    Spawn {
        /// Working directory of the process
        #[arg(long, value_name = "DIR")]
        cwd: Option<PathBuf>,

        /// Extra environment variable (repeatable)
        #[arg(long, short, value_name = "KEY=VALUE", value_parser = parse_env_var)]
        env: Vec<(String, String)>,

        /// Terminal columns
        #[arg(long)]
        cols: Option<u16>,

        /// Terminal rows
        #[arg(long)]
        rows: Option<u16>,

        /// Attach pipes or a pseudo-terminal
        #[arg(long, short, value_name = "MODE")]
        terminal: Option<TerminalMode>,

        /// Output in JSON format
        #[arg(long)]
        json: bool,

        /// Command line to run; the default shell when omitted
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Send keys to a session, e.g. `ls -la Enter` or `C-c`
    Send {
        /// Session ID
        session_id: String,

        /// Key sequence; words are joined with single spaces
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        keys: Vec<String>,
    },

    /// Read buffered output of a session
    Read {
        /// Session ID
        session_id: String,

        /// Milliseconds to wait before reading
        #[arg(long, short, value_name = "MS")]
        wait: Option<u64>,

        /// Leave the buffer in place instead of clearing it
        #[arg(long)]
        keep: bool,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Kill a session
    Kill {
        /// Session ID to kill
        session_id: String,

        /// Signal to send: SIGTERM (15), SIGKILL (9) or SIGINT (2)
        #[arg(long, short, default_value = "SIGTERM")]
        signal: KillSignal,

        /// Force kill (equivalent to --signal SIGKILL)
        #[arg(long, short)]
        force: bool,
    },

    /// Resize a session's terminal
    Resize {
        /// Session ID
        session_id: String,

        /// New column count
        cols: u16,

        /// New row count
        rows: u16,
    },

    /// List live sessions
    List {
        /// Include terminal size, mode, state and buffered lines
        #[arg(long, short)]
        long: bool,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
}

/// Parse a `KEY=VALUE` pair.
fn parse_env_var(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{s}'")),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default()?
    };
    config.apply_env_overrides();

    let _log_guard = init_tracing(&config, cli.verbose)?;

    if let Some(config_path) = &cli.config {
        tracing::info!("Using config file: {:?}", config_path);
    }

    match cli.command {
        Commands::Start { socket } => {
            if let Some(socket) = socket {
                config.daemon.socket_path = Some(socket);
            }
            config.validate()?;

            if is_daemon_running() {
                let pid = get_daemon_pid().unwrap_or(0);
                eprintln!("Error: Daemon already running (PID: {})", pid);
                eprintln!();
                eprintln!("To stop the existing daemon, run:");
                eprintln!("  procmux stop");
                std::process::exit(1);
            }

            let orchestrator = DaemonOrchestrator::new(config)?;
            run_foreground(&orchestrator).await?;
        }
        Commands::Stop { force, timeout } => {
            tracing::info!("Stopping daemon (force: {})", force);
            let socket_path = socket_path(&config);

            if force {
                match force_stop_daemon(&socket_path) {
                    Ok(()) => println!("Daemon forcefully terminated"),
                    Err(e) => {
                        eprintln!("Failed to stop daemon: {}", e);
                        std::process::exit(1);
                    }
                }
            } else {
                match graceful_stop_daemon(&socket_path, timeout).await {
                    Ok(()) => println!("Daemon stopped successfully"),
                    Err(e) => {
                        eprintln!("Failed to stop daemon: {}", e);
                        eprintln!("Try: procmux stop --force");
                        std::process::exit(1);
                    }
                }
            }
        }
        Commands::Status => {
            let socket_path = socket_path(&config);
            let status = async {
                let mut client = connect(&socket_path).await?;
                Ok::<_, anyhow::Error>(client.status().await?)
            }
            .await;

            match status {
                Ok(report) => {
                    println!("Daemon Status: running");
                    println!("  PID:      {}", report.pid);
                    println!("  Uptime:   {}", format_duration(report.uptime_secs));
                    println!("  Sessions: {}", report.session_count);
                    println!("  Socket:   {}", socket_path.display());
                }
                Err(e) => {
                    eprintln!("Daemon is not running: {}", e);
                    std::process::exit(1);
                }
            }
        }
        Commands::Sessions(cmd) => {
            let mut client = connect(&socket_path(&config)).await?;
            run_sessions_command(&mut client, cmd).await?;
        }
    }

    Ok(())
}

/// Initialize tracing.
///
/// `RUST_LOG` wins over `--verbose`, which wins over the configured level.
/// With `log_dir` set, logs are also written to a daily rolling file.
fn init_tracing(
    config: &Config,
    verbose: bool,
) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let level = if verbose {
        "debug"
    } else {
        config.daemon.log_level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let (file_layer, guard) = match &config.daemon.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "procmux.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    Ok(guard)
}

fn socket_path(config: &Config) -> PathBuf {
    resolve_socket_path(config.daemon.socket_path.as_deref())
}

/// Connect to the daemon, with a readable error when it is not running.
async fn connect(socket_path: &Path) -> anyhow::Result<IpcClient> {
    IpcClient::connect_with_timeout(socket_path, Duration::from_secs(5))
        .await
        .map_err(|_| {
            anyhow::anyhow!(
                "Daemon is not running (cannot connect to {})",
                socket_path.display()
            )
        })
}

async fn run_sessions_command(client: &mut IpcClient, cmd: SessionsCommands) -> anyhow::Result<()> {
    match cmd {
        SessionsCommands::Spawn {
            cwd,
            env,
            cols,
            rows,
            terminal,
            json,
            command,
        } => {
            let request = SessionSpawn {
                command: command.join(" "),
                cwd: cwd.map(|dir| dir.to_string_lossy().into_owned()),
                env: env.into_iter().collect::<BTreeMap<_, _>>(),
                cols,
                rows,
                terminal,
            };
            let spawned = client.spawn(request).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&spawned)?);
            } else {
                println!("{}", spawned.session_id);
                tracing::debug!(pid = spawned.pid, "Session spawned");
            }
        }
        SessionsCommands::Send { session_id, keys } => {
            client.send_keys(&session_id, &keys.join(" ")).await?;
        }
        SessionsCommands::Read {
            session_id,
            wait,
            keep,
            json,
        } => {
            let request = SessionRead {
                session_id,
                wait_ms: wait,
                clear: !keep,
            };
            let output = client.read(request).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&output)?);
            } else {
                if output.dropped > 0 {
                    eprintln!("[{} line(s) dropped]", output.dropped);
                }
                print!("{}", output.content);
                if output.has_more {
                    eprintln!("[more output buffered; read again]");
                }
            }
        }
        SessionsCommands::Kill {
            session_id,
            signal,
            force,
        } => {
            let signal = if force { KillSignal::Kill } else { signal };
            let killed = client.kill(&session_id, signal).await?;

            let outcome = match (killed.exit_code, killed.signal) {
                (Some(code), _) => format!("exit code {code}"),
                (None, Some(sig)) => format!("killed by signal {sig}"),
                (None, None) => "still exiting".to_string(),
            };
            println!("Session {} terminated with {} ({})", session_id, signal, outcome);
        }
        SessionsCommands::Resize {
            session_id,
            cols,
            rows,
        } => {
            client.resize(&session_id, cols, rows).await?;
            println!("Session {} resized to {}x{}", session_id, cols, rows);
        }
        SessionsCommands::List { long, json } => {
            let sessions = client.list(long).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&sessions)?);
            } else {
                print_sessions_table(&sessions, long);
            }
        }
    }

    Ok(())
}

/// Print sessions in a formatted ASCII table.
fn print_sessions_table(sessions: &[SessionSummary], long: bool) {
    if sessions.is_empty() {
        println!("No active sessions.");
        return;
    }

    const COMMAND_WIDTH: usize = 32;

    let id_width = sessions
        .iter()
        .map(|s| s.id.len())
        .max()
        .unwrap_or(8)
        .max(8);

    let mut header = format!(
        "{:<id_width$}  {:>8}  {:<COMMAND_WIDTH$}  {:>10}  {:>10}",
        "ID", "PID", "COMMAND", "CREATED", "ACTIVE",
    );
    if long {
        header.push_str(&format!(
            "  {:<8}  {:>9}  {:<4}  {:>6}",
            "STATE", "SIZE", "MODE", "LINES"
        ));
    }
    println!("{}", header);
    println!("{}", "-".repeat(header.len()));

    for session in sessions {
        let mut row = format!(
            "{:<id_width$}  {:>8}  {:<COMMAND_WIDTH$}  {:>10}  {:>10}",
            session.id,
            session.pid,
            truncate_str(&session.command, COMMAND_WIDTH),
            format_relative_time(session.created_at),
            format_relative_time(session.last_activity),
        );
        if let Some(details) = &session.details {
            row.push_str(&format!(
                "  {:<8}  {:>9}  {:<4}  {:>6}",
                details.state.to_string(),
                format!("{}x{}", details.cols, details.rows),
                details.terminal.to_string(),
                details.buffered_lines
            ));
        }
        println!("{}", row);
    }

    println!();
    println!("Total: {} session(s)", sessions.len());
}

/// Format a millisecond Unix timestamp as relative time (e.g., "5m ago").
fn format_relative_time(timestamp_ms: u64) -> String {
    let now = daemon::session::record::now_millis();
    let elapsed = now.saturating_sub(timestamp_ms) / 1000;

    if elapsed < 60 {
        format!("{}s ago", elapsed)
    } else if elapsed < 3600 {
        format!("{}m ago", elapsed / 60)
    } else if elapsed < 86400 {
        format!("{}h ago", elapsed / 3600)
    } else {
        format!("{}d ago", elapsed / 86400)
    }
}

/// Truncate a string to a maximum number of characters, adding "..." if truncated.
fn truncate_str(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}

/// Gracefully stop the daemon via IPC.
///
/// Sends a shutdown request and waits for the socket to disappear.
async fn graceful_stop_daemon(socket_path: &Path, timeout_secs: u64) -> anyhow::Result<()> {
    let mut client = connect(socket_path).await?;

    println!("Sending shutdown request...");

    client.set_timeout(Duration::from_secs(timeout_secs));
    client
        .shutdown()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to send stop request: {}", e))?;
    drop(client);

    println!("Shutdown acknowledged, waiting for daemon to exit...");

    let start = std::time::Instant::now();
    let timeout = Duration::from_secs(timeout_secs);

    while start.elapsed() < timeout {
        if !socket_path.exists() {
            return Ok(());
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    Err(anyhow::anyhow!(
        "Timeout waiting for daemon to exit ({}s)",
        timeout_secs
    ))
}

/// Force stop the daemon using SIGKILL.
fn force_stop_daemon(socket_path: &Path) -> anyhow::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pid = get_daemon_pid()
        .ok_or_else(|| anyhow::anyhow!("Daemon PID file not found - is the daemon running?"))?;
    let raw = i32::try_from(pid).context("Invalid PID in file")?;

    kill(Pid::from_raw(raw), Signal::SIGKILL)
        .map_err(|e| anyhow::anyhow!("Failed to kill daemon (PID {}): {}", pid, e))?;

    println!("Sent SIGKILL to daemon (PID {})", pid);

    let _ = std::fs::remove_file(daemon::ipc::get_pid_file_path());
    let _ = std::fs::remove_file(socket_path);

    Ok(())
}

/// Format a duration in seconds to human-readable format.
fn format_duration(secs: u64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Run the daemon until a signal or an IPC shutdown request arrives.
async fn run_foreground(orchestrator: &DaemonOrchestrator) -> anyhow::Result<()> {
    orchestrator.start().await?;

    let mut events = orchestrator.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                OrchestratorEvent::StateChanged(state) => {
                    tracing::info!("Orchestrator state: {:?}", state);
                }
                OrchestratorEvent::ClientConnected { connection_id } => {
                    tracing::debug!(connection_id, "Client connected");
                }
                OrchestratorEvent::ClientDisconnected { connection_id } => {
                    tracing::debug!(connection_id, "Client disconnected");
                }
                OrchestratorEvent::ShutdownRequested => {
                    tracing::info!("Shutdown requested by client");
                }
                OrchestratorEvent::Error { message } => {
                    tracing::error!("Orchestrator error: {}", message);
                }
            }
        }
    });

    let shutdown = orchestrator.shutdown_token();
    tokio::select! {
        result = wait_for_shutdown_signal() => {
            result.context("Failed to register signal handlers")?;
        }
        _ = shutdown.cancelled() => {}
    }

    orchestrator.stop().await?;

    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }

    Ok(())
}
