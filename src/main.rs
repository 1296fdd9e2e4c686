//! Brickyard - Volume Provisioning Control Plane
//!
//! Service entry point: parses the CLI, initializes logging, loads the
//! configuration file, wires up the [`App`], and runs until interrupted.

use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use brickyard::{App, Config, Error, ExecutorRef, MockExecutor, Result};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Brickyard - volume provisioning control plane
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(long, env = "BRICKYARD_CONFIG")]
    config: Option<String>,

    /// Executor backend (mock)
    #[arg(long, env = "BRICKYARD_EXECUTOR", default_value = "mock")]
    executor: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting Brickyard control plane");
    info!("  Version: {}", brickyard::VERSION);

    let config = match &args.config {
        Some(path) => {
            info!("  Config: {}", path);
            Config::from_file(path)?
        }
        None => {
            info!("  Config: built-in defaults");
            Config::default()
        }
    };

    let executor: ExecutorRef = match args.executor.as_str() {
        "mock" => MockExecutor::new(),
        other => {
            return Err(Error::Configuration(format!(
                "unknown executor backend: {other}"
            )))
        }
    };
    info!("  Executor: {}", args.executor);

    let app = App::new(config, executor)?;
    app.start()?;
    info!("Control plane running, press ctrl-c to stop");

    wait_for_shutdown().await;

    info!("Shutting down");
    app.shutdown().await;
    info!("Control plane stopped");
    Ok(())
}

async fn wait_for_shutdown() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", err);
    }
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
