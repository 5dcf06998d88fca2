//! fleet-exec - remote command sessions for Fleet Mate nodes
//!
//! The library is driven by a node transport in production. This binary runs
//! the same engine against a local process so the whole lifecycle (validation,
//! streaming, completion, history) can be exercised from a terminal.

use std::path::PathBuf;
use std::process::Stdio;

use clap::{Parser as ClapParser, Subcommand};
use fleet_exec::{
    command::{allowed_commands, QUICK_ACTIONS},
    config::{ConfigError, EngineConfig},
    events::OutputStream,
    session::ExecutionRequest,
    EngineError, ExecutionEngine,
};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// fleet-exec - remote command sessions for Fleet Mate nodes
#[derive(ClapParser, Debug)]
#[command(name = "fleet-exec", version, about, long_about = None)]
struct Cli {
    /// Path to a TOML engine config
    #[arg(long, env = "FLEET_EXEC_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run an allow-listed command locally and print its session events as
    /// JSON lines, followed by the resulting history entry
    Run {
        /// Node identifier to record the execution under
        #[arg(long, default_value = "local")]
        node: String,

        /// Execution budget in seconds (defaults to the config value)
        #[arg(long)]
        timeout: Option<u64>,

        /// Working directory for the command
        #[arg(long)]
        cwd: Option<String>,

        /// Base command
        command: String,

        /// Command arguments
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Print the command allow-list and quick actions
    Allowed,

    /// Print the effective configuration
    Config,
}

#[derive(Error, Debug)]
pub enum CliError {
    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Engine(#[from] EngineError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    let cli = Cli::parse();
    init_tracing();

    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)?.unwrap_or_else(|| {
            tracing::warn!(path = %path.display(), "config file not found, using defaults");
            EngineConfig::default()
        }),
        None => EngineConfig::default(),
    };

    match cli.command {
        Commands::Run { node, timeout, cwd, command, args } => {
            run_local(config, node, timeout, cwd, command, args).await
        }
        Commands::Allowed => print_allowed(),
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

/// Tracing goes to stderr; stdout carries the JSON event stream.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "fleet_exec=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn print_allowed() -> Result<(), CliError> {
    let body = serde_json::json!({
        "commands": allowed_commands(),
        "quickActions": QUICK_ACTIONS,
    });
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

// ── Local driver ───────────────────────────────────────────────────

async fn run_local(
    config: EngineConfig,
    node: String,
    timeout: Option<u64>,
    cwd: Option<String>,
    command: String,
    args: Vec<String>,
) -> Result<(), CliError> {
    let budget = std::time::Duration::from_secs(timeout.unwrap_or(config.default_timeout_secs));
    let engine = ExecutionEngine::new(config);
    let cancel = CancellationToken::new();
    let reaper = engine.spawn_reaper(cancel.clone());

    let mut request = ExecutionRequest::new(node.clone(), command.clone(), args.clone());
    request.timeout_seconds = timeout;
    if let Some(dir) = &cwd {
        request = request.with_working_directory(dir.clone());
    }

    let session_id = engine.create_session(request)?;
    let mut subscriber = engine.attach(&session_id)?;

    let printer = tokio::spawn(async move {
        while let Some(event) = subscriber.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(e) => {
                    subscriber.fail(e);
                    break;
                }
            }
        }
    });

    // The command string may carry inline arguments ("systemctl status").
    let mut argv = command.split_whitespace();
    let program = argv.next().unwrap_or_default().to_string();
    let mut process = tokio::process::Command::new(&program);
    process
        .args(argv)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &cwd {
        process.current_dir(dir);
    }

    match process.spawn() {
        Err(e) => {
            engine.fail_execution(&session_id, &format!("failed to start {program}: {e}"));
        }
        Ok(mut child) => {
            let stdout = child
                .stdout
                .take()
                .map(|out| tokio::spawn(pump(engine.clone(), session_id.clone(), OutputStream::Stdout, out)));
            let stderr = child
                .stderr
                .take()
                .map(|err| tokio::spawn(pump(engine.clone(), session_id.clone(), OutputStream::Stderr, err)));

            match tokio::time::timeout(budget, child.wait()).await {
                Ok(status) => {
                    let status = status?;
                    for reader in [stdout, stderr].into_iter().flatten() {
                        reader.await??;
                    }
                    engine.complete_execution(&session_id, status.code().unwrap_or(-1));
                }
                Err(_) => {
                    if let Err(e) = child.kill().await {
                        tracing::warn!(session = %session_id, error = %e, "failed to kill timed-out command");
                    }
                    engine.time_out(&session_id);
                }
            }
        }
    }

    printer.await?;
    cancel.cancel();
    reaper.await?;

    if let Some(entry) = engine.history(&node).first() {
        println!("{}", serde_json::to_string_pretty(entry)?);
    }
    Ok(())
}

/// Forward one output pipe into the engine until EOF.
async fn pump<R: AsyncRead + Unpin>(
    engine: ExecutionEngine,
    session_id: String,
    stream: OutputStream,
    mut reader: R,
) -> std::io::Result<()> {
    let mut buf = vec![0u8; 4096];
    let mut pending = Vec::new();
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            if !pending.is_empty() {
                engine.append_output(&session_id, stream, &String::from_utf8_lossy(&pending));
            }
            return Ok(());
        }
        pending.extend_from_slice(&buf[..n]);
        let chunk = take_utf8(&mut pending);
        if !chunk.is_empty() {
            engine.append_output(&session_id, stream, &chunk);
        }
    }
}

/// Decode `pending`, leaving a multi-byte character cut off at the end of
/// the buffer in place for the next read.
fn take_utf8(pending: &mut Vec<u8>) -> String {
    let complete = match std::str::from_utf8(&pending[..]) {
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        _ => pending.len(),
    };
    let tail = pending.split_off(complete);
    let text = String::from_utf8_lossy(&pending[..]).into_owned();
    *pending = tail;
    text
}
