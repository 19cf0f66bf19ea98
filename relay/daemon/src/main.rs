//! Relay Daemon - Durable Token Streaming Server
//!
//! Serves sessions over HTTP. Producers keep running when clients disconnect,
//! and a client can reconnect with `?from=<lsn>` to continue where it stopped.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (127.0.0.1:7878)
//! relay-daemon
//!
//! # Custom listen address
//! relay-daemon --listen 0.0.0.0:8080
//!
//! # With config file
//! relay-daemon --config /etc/relay/relay.toml
//!
//! # Verbose logging
//! RUST_LOG=debug relay-daemon
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: stop accepting connections, abort running
//!   producers, exit

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

use relay_core::{
    load_config, load_config_from_path, ConfigOverrides, LlmBackend, OllamaBackend, RelayConfig,
    SessionRegistry,
};
use relay_daemon::server::{build_app, AppState};

/// Relay Daemon - durable, resumable token streams over HTTP
#[derive(Parser, Debug)]
#[command(name = "relay-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Address to listen on (host:port)
    #[arg(short = 'L', long, env = "RELAY_LISTEN", value_name = "ADDR")]
    listen: Option<String>,

    /// Configuration file path
    #[arg(short = 'c', long, env = "RELAY_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Producer idle timeout in seconds (0 = disabled)
    #[arg(long, value_name = "SECS")]
    idle_timeout_secs: Option<u64>,

    /// Model used when a request does not name one
    #[arg(short = 'm', long, value_name = "MODEL")]
    model: Option<String>,

    /// PID file path
    #[arg(long, env = "RELAY_PID_FILE", value_name = "PATH")]
    pid_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "RELAY_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides::new();
        if let Some(ref listen) = self.listen {
            overrides = overrides.with_listen(listen.clone());
        }
        if let Some(secs) = self.idle_timeout_secs {
            overrides = overrides.with_idle_timeout_secs(secs);
        }
        if let Some(ref model) = self.model {
            overrides = overrides.with_default_model(model.clone());
        }
        overrides
    }
}

/// Write PID file
fn write_pid_file(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create PID directory: {parent:?}"))?;
    }

    let pid = std::process::id();
    let mut file =
        fs::File::create(path).with_context(|| format!("Failed to create PID file: {path:?}"))?;
    writeln!(file, "{pid}")?;

    info!(pid = pid, path = ?path, "PID file created");
    Ok(())
}

/// Remove PID file
fn remove_pid_file(path: &Path) {
    if path.exists() {
        if let Err(e) = fs::remove_file(path) {
            warn!(error = %e, path = ?path, "Failed to remove PID file");
        } else {
            info!(path = ?path, "PID file removed");
        }
    }
}

/// Refuse to start while the process named in the PID file is alive
fn check_existing_daemon(pid_path: &Path) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    if !pid_path.exists() {
        return Ok(());
    }

    let pid_str = fs::read_to_string(pid_path)
        .with_context(|| format!("Failed to read PID file: {pid_path:?}"))?;

    let pid: i32 = pid_str
        .trim()
        .parse()
        .with_context(|| "Invalid PID in file")?;

    // No signal: existence check only
    match kill(Pid::from_raw(pid), None) {
        Ok(()) | Err(Errno::EPERM) => anyhow::bail!(
            "Another relay-daemon is already running (PID: {pid}). \
             Stop it first or remove {pid_path:?} if it's stale."
        ),
        Err(_) => {
            warn!(pid = pid, "Removing stale PID file");
            fs::remove_file(pid_path)?;
            Ok(())
        }
    }
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("relay_daemon={level},relay_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}

/// Resolve configuration: file, environment, then command line
fn resolve_config(args: &Args) -> Result<RelayConfig> {
    let mut config = match args.config {
        Some(ref path) => load_config_from_path(Some(path.clone())),
        None => load_config(),
    }
    .context("Failed to load configuration")?;

    args.overrides().apply(&mut config);
    Ok(config)
}

/// Resolves when SIGTERM or SIGINT arrives
async fn shutdown_signal() -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown"),
        _ = sigint.recv() => info!("Received SIGINT, initiating shutdown"),
    }
    Ok(())
}

/// Report producer availability; the daemon starts either way
async fn check_backend(backend: &dyn LlmBackend, model: &str) {
    match backend.has_model(model).await {
        Ok(true) => info!(backend = backend.name(), model, "Default model available"),
        Ok(false) => warn!(
            backend = backend.name(),
            model, "Default model not found, sessions using it will fail"
        ),
        Err(e) => warn!(backend = backend.name(), error = %e, "Producer unreachable at startup"),
    }
}

async fn run(config: RelayConfig) -> Result<()> {
    let registry = SessionRegistry::<String>::new(config.registry.clone());
    let backend = Arc::new(OllamaBackend::new(
        config.ollama_host.clone(),
        config.ollama_port,
    ));
    check_backend(backend.as_ref(), &config.default_model).await;
    let state = AppState::new(registry.clone(), backend, config.default_model.clone());

    let listener = tokio::net::TcpListener::bind(config.listen.as_str())
        .await
        .with_context(|| format!("Failed to bind to {}", config.listen))?;
    info!(listen = %config.listen, "Listening for connections");

    // Open streams end only when their writers stop
    axum::serve(listener, build_app(state))
        .with_graceful_shutdown(async move {
            if let Err(e) = shutdown_signal().await {
                error!(error = %e, "Signal handling failed, shutting down");
            }
            registry.shutdown().await;
        })
        .await
        .context("HTTP server failed")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging first
    init_logging(&args.log_level);

    info!("Relay Daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("PID: {}", std::process::id());

    let config = resolve_config(&args)?;
    info!(
        source = %config.source(),
        listen = %config.listen,
        idle_timeout = ?config.registry.idle_timeout,
        ollama = %format!("{}:{}", config.ollama_host, config.ollama_port),
        model = %config.default_model,
        "Configuration resolved"
    );

    if let Some(ref pid_path) = args.pid_file {
        check_existing_daemon(pid_path)?;
        write_pid_file(pid_path)?;
    }

    let result = run(config).await;

    info!("Shutting down...");
    if let Some(ref pid_path) = args.pid_file {
        remove_pid_file(pid_path);
    }

    match result {
        Ok(()) => {
            info!("Relay daemon stopped cleanly");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Daemon stopped with error");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_overrides() {
        let args = Args::parse_from([
            "relay-daemon",
            "--listen",
            "0.0.0.0:9000",
            "--idle-timeout-secs",
            "0",
            "--model",
            "qwen",
        ]);
        let mut config = RelayConfig::default();
        args.overrides().apply(&mut config);

        assert_eq!(config.listen, "0.0.0.0:9000");
        assert_eq!(config.registry.idle_timeout, None);
        assert_eq!(config.default_model, "qwen");
    }

    #[test]
    fn test_pid_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("relay.pid");

        write_pid_file(&path).unwrap();
        let written = fs::read_to_string(&path).unwrap();
        assert_eq!(written.trim(), std::process::id().to_string());

        remove_pid_file(&path);
        assert!(!path.exists());
    }

    #[test]
    fn test_existing_daemon_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.pid");
        fs::write(&path, format!("{}\n", std::process::id())).unwrap();

        assert!(check_existing_daemon(&path).is_err());
        assert!(path.exists());
    }

    #[test]
    fn test_invalid_pid_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.pid");
        fs::write(&path, "not-a-pid").unwrap();

        assert!(check_existing_daemon(&path).is_err());
    }
}
