//! ptyx
//!
//! Runs a program on a pseudo-terminal attached to the current console, or
//! copies its streams when there is no console.

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use ptyx::config::RunConfig;
use ptyx::{run, run_interactive, Error, RawStatus, SpawnOptions};

/// Run programs on a pseudo-terminal
#[derive(Parser, Debug)]
#[command(name = "ptyx")]
#[command(version, about, long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (defaults to .ptyx/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a program attached to this console
    Run {
        /// Program and its arguments
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Start the configured shell attached to this console
    Shell {
        /// Arguments for the shell
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Run a program on a pty without attaching it, discarding its output
    Exec {
        /// Program and its arguments
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Logs go to stderr; stdout carries the terminal stream. Anything chattier
    // than WARN would land in the middle of a raw-mode session by default.
    let default_level = if args.verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();

    debug!("ptyx v{}", env!("CARGO_PKG_VERSION"));

    let config = match &args.config {
        Some(path) => RunConfig::load_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => RunConfig::load(&std::env::current_dir()?)?,
    };

    let token = CancellationToken::new();
    let shutdown = token.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Initiating shutdown...");
        shutdown.cancel();
    });

    let result = match args.command {
        Command::Run { command } => {
            run_interactive(&token, command_options(&config, command)?).await
        }
        Command::Shell { args } => {
            let options = config.spawn_options(config.shell_program(), args);
            run_interactive(&token, options).await
        }
        Command::Exec { command } => run(&token, command_options(&config, command)?).await,
    };

    // Exit explicitly: a blocked stdin read must not hold up runtime shutdown.
    std::process::exit(exit_code(result));
}

fn command_options(config: &RunConfig, command: Vec<String>) -> anyhow::Result<SpawnOptions> {
    let mut parts = command.into_iter();
    let Some(program) = parts.next() else {
        bail!("no program given");
    };
    Ok(config.spawn_options(program, parts))
}

/// Process exit code mirroring the child's termination
fn exit_code(result: ptyx::Result<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(Error::Exit(exit)) => match exit.status {
            RawStatus::Signaled { signal, .. } => 128 + signal,
            _ if exit.is_killed() => 1,
            _ => exit.code,
        },
        Err(Error::Cancelled) => {
            info!("cancelled");
            130
        }
        Err(e) => {
            error!("{}", e);
            eprintln!("ptyx: {e}");
            1
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
