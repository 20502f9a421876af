//! ttymux daemon
//!
//! Accepts TCP clients and attaches each one to a shell running in its own
//! pseudo-terminal.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::time::MissedTickBehavior;
use tracing_subscriber::EnvFilter;
use ttymux::{Config, SessionId, SessionManager, TerminalMode};

/// ttymux daemon - shells in ptys for remote byte streams.
#[derive(Parser, Debug)]
#[command(name = "ttymuxd")]
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

/// Available commands for the daemon.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Accept TCP clients and run a shell for each
    Serve {
        /// Address to listen on (overrides the config file)
        #[arg(long, short, value_name = "ADDR")]
        listen: Option<String>,

        /// Put the daemon's own terminal into raw mode while sessions run
        #[arg(long)]
        host_terminal: bool,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = match &cli.config {
        Some(config_path) => Config::load(config_path)?,
        None => Config::load_default()?,
    };

    // Apply environment variable overrides
    config.apply_env_overrides();

    init_tracing(cli.verbose, &config.daemon.log_level);
    if let Some(config_path) = &cli.config {
        tracing::debug!("Using config file: {:?}", config_path);
    }

    match cli.command {
        Commands::Serve {
            listen,
            host_terminal,
        } => {
            if let Some(listen) = listen {
                config.daemon.listen = listen;
            }
            if host_terminal {
                config.session.terminal = TerminalMode::Host;
            }

            config.validate()?;
            serve(config).await?;
        }
        Commands::Config => {
            print!("{}", config.to_toml()?);
        }
    }

    Ok(())
}

/// Installs the fmt subscriber. `RUST_LOG` wins over the flags and config.
fn init_tracing(verbose: bool, log_level: &str) {
    let level = if verbose {
        "debug".to_string()
    } else {
        log_level.to_lowercase()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Runs the accept loop until SIGTERM or SIGINT.
async fn serve(config: Config) -> anyhow::Result<()> {
    let addr = config.listen_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to listen on {}", addr))?;
    let manager = Arc::new(config.session_manager());

    tracing::info!(
        "ttymux daemon listening on {} (shell: {}, max sessions: {})",
        listener.local_addr()?,
        config.session.shell,
        config.session.max_sessions
    );

    let reaper = tokio::spawn(reap_finished_sessions(
        Arc::clone(&manager),
        Duration::from_secs(config.daemon.reap_interval_secs),
    ));

    let shutdown = wait_for_shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => match attach(&manager, stream) {
                    Ok(session_id) => {
                        tracing::info!(session_id, %peer, "Client attached");
                    }
                    Err(e) => {
                        tracing::warn!(%peer, error = %e, "Failed to start session");
                    }
                },
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to accept connection");
                }
            },
            result = &mut shutdown => {
                result?;
                tracing::info!("Received shutdown signal");
                break;
            }
        }
    }

    reaper.abort();

    let count = manager.count();
    tokio::task::spawn_blocking(move || manager.close_all())
        .await
        .context("Session shutdown task failed")?;
    tracing::info!("Closed {} session(s), daemon stopped", count);

    Ok(())
}

/// Turns an accepted connection into a running session.
fn attach(manager: &SessionManager, stream: tokio::net::TcpStream) -> anyhow::Result<SessionId> {
    // Session loops do blocking reads on their own threads.
    let stream = stream.into_std()?;
    stream.set_nonblocking(false)?;

    let session_id = manager.create_session(Arc::new(stream))?;
    if let Err(e) = manager.start_session(session_id) {
        let _ = manager.close_session(session_id);
        return Err(e.into());
    }
    Ok(session_id)
}

/// Periodically drops sessions whose remote and shell are both gone.
async fn reap_finished_sessions(manager: Arc<SessionManager>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        let reaped = manager.reap_finished();
        if !reaped.is_empty() {
            tracing::debug!(?reaped, "Reaped finished sessions");
        }
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint =
        signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

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
