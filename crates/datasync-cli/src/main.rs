//! datasync - operator tool for the data synchronization core.
//!
//! Runs one-off health checks against the configured backend, watches the
//! adaptive connectivity monitor, and manages the session cache mirror.

use std::io;

use anyhow::{Context, Result};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use datasync_core::cache::CacheMirror;
use datasync_core::{ConnectivityMonitor, SyncConfig};

/// Directory for rolling log files; unset means stderr only.
const ENV_LOG_DIR: &str = "DATASYNC_LOG_DIR";

const USAGE: &str = "\
Usage: datasync <command>

Commands:
  check           Run a single backend health check and print the result
  watch           Start the connectivity monitor and print every state change
  config          Print the effective configuration
  clear-session   Delete the session cache mirror
";

/// Initialize the tracing subscriber for logging
fn init_tracing() -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match std::env::var(ENV_LOG_DIR) {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "datasync.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        Err(_) => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();
    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();
    let _guard = init_tracing();

    let command = std::env::args().nth(1);
    let config = SyncConfig::load().context("Failed to load configuration")?;

    match command.as_deref() {
        Some("check") => check(&config).await,
        Some("watch") => watch(&config).await,
        Some("config") => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Some("clear-session") => clear_session(&config),
        Some("-h") | Some("--help") | None => {
            print!("{}", USAGE);
            Ok(())
        }
        Some(other) => {
            eprint!("Unknown command: {}\n\n{}", other, USAGE);
            std::process::exit(2);
        }
    }
}

async fn check(config: &SyncConfig) -> Result<()> {
    let monitor = ConnectivityMonitor::from_config(config)?;
    let healthy = monitor.check_backend_health("cli").await;
    println!("{}", serde_json::to_string_pretty(&monitor.state())?);
    if !healthy {
        std::process::exit(1);
    }
    Ok(())
}

async fn watch(config: &SyncConfig) -> Result<()> {
    let monitor = ConnectivityMonitor::from_config(config)?;
    let mut states = monitor.subscribe();
    let handle = monitor.start_monitoring();
    info!(url = %config.health_url, "Watching backend health");

    loop {
        tokio::select! {
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = states.borrow_and_update().clone();
                println!("{}", serde_json::to_string(&state)?);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping monitor");
                break;
            }
        }
    }

    handle.stop();
    Ok(())
}

fn clear_session(config: &SyncConfig) -> Result<()> {
    let mirror = config.session_mirror()?;
    CacheMirror::<serde_json::Value>::clear(&mirror)?;
    println!("Cleared session mirror at {}", mirror.dir().display());
    Ok(())
}
