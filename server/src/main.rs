//! Binary entry point: CLI parsing, tracing setup, and the run/shutdown
//! select loop. The actual orchestration wiring lives in `server::orchestrator`.

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use server::{setup_shutdown_signal, Server};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "server")]
#[command(about = "Orchestration core for a distributed network-probing platform", long_about = None)]
struct CliArgs {
    /// Path to the orchestrator configuration file (server.toml)
    #[arg(value_name = "CONFIG_FILE")]
    config_file: PathBuf,

    /// Override the listen address from the config file
    #[arg(long = "listen-address", value_name = "ADDRESS")]
    listen_address: Option<String>,

    /// Override the scheduler's global concurrency cap
    #[arg(long = "max-concurrent-tasks", value_name = "N")]
    max_concurrent_tasks: Option<usize>,

    /// Override the graceful shutdown timeout, in seconds
    #[arg(long = "shutdown-timeout", value_name = "SECONDS")]
    shutdown_timeout_seconds: Option<u64>,

    /// Directory holding the orchestrator's SQLite database
    #[arg(long = "data-dir", value_name = "DIR", default_value = "./data")]
    data_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let file_appender = tracing_appender::rolling::daily("./logs", "server.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("server=info,shared=info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .json()
        .with_current_span(false)
        .with_span_list(false)
        .with_writer(non_blocking)
        .init();

    let cli_args = CliArgs::parse();

    info!("orchestrator core starting up");
    info!("configuration file: {}", cli_args.config_file.display());

    let mut server = match Server::new(cli_args.config_file, cli_args.data_dir) {
        Ok(server) => server,
        Err(e) => {
            error!("failed to initialize server: {}", e);
            std::process::exit(1);
        }
    };

    if cli_args.listen_address.is_some()
        || cli_args.max_concurrent_tasks.is_some()
        || cli_args.shutdown_timeout_seconds.is_some()
    {
        let changed = {
            let mut config_manager = server.config_manager.lock().await;
            match config_manager.override_and_persist_config(
                cli_args.listen_address,
                cli_args.max_concurrent_tasks,
                cli_args.shutdown_timeout_seconds,
            ) {
                Ok(changed) => changed,
                Err(e) => {
                    error!("failed to apply configuration overrides: {}", e);
                    std::process::exit(1);
                }
            }
        };

        if changed {
            info!("configuration overrides applied and persisted to disk");
            let listen_address = {
                let manager = server.config_manager.lock().await;
                manager.config().listen_address.clone()
            };
            server.listen_address = listen_address.parse().unwrap_or_else(|e| {
                error!("invalid listen address after override: {}", e);
                std::process::exit(1);
            });
        }
    }

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("server error: {}", e);
                std::process::exit(1);
            }
        }
        _ = setup_shutdown_signal() => {
            info!("shutdown signal received, initiating graceful shutdown");
        }
    }

    server.shutdown().await;
    info!("orchestrator core shutdown complete");
    Ok(())
}
