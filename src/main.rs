// txn-server daemon entry point
// Loads configuration, runs the engine with the echo protocol and drains on signal

use anyhow::Result;
use clap::Parser;
use std::time::Duration;
use tracing::{error, info};
use txn_server::handler::echo::EchoProtocol;
use txn_server::{cli, observability, runtime, signals, EngineConfig, ServerEngine, StartOptions};

/// Period between engine statistics log lines
const STATS_INTERVAL: Duration = Duration::from_secs(30);

fn main() -> Result<()> {
    let cli = cli::Cli::parse();

    match cli.command {
        cli::Commands::Start { config, json_logs } => {
            observability::init(json_logs)?;
            cli::print_banner();

            let rt = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(runtime::worker_thread_count())
                .thread_name("txn-worker")
                .enable_all()
                .build()?;

            rt.block_on(run_daemon(config))
        }
        command => cli::commands::execute(command),
    }
}

/// Run the engine until SIGTERM or SIGINT
async fn run_daemon(config_path: String) -> Result<()> {
    info!("Loading configuration from {}", config_path);
    let config = EngineConfig::load(&config_path)?;
    runtime::limits::log_system_info();

    let shutdown_signal = signals::create_shutdown_listener()?;
    info!("Signal handlers installed (SIGTERM, SIGINT)");

    let options = StartOptions::from_config(&config);
    let engine = ServerEngine::pre_initialize(config, EchoProtocol)?;
    let addr = engine.start(options).await?;
    cli::success(&format!("Listening on {addr}"));

    let reporter = {
        let engine = engine.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(STATS_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                match serde_json::to_string(&engine.stats()) {
                    Ok(stats) => info!(stats = %stats, "Engine statistics"),
                    Err(e) => error!(error = %e, "Failed to serialize engine statistics"),
                }
            }
        })
    };

    shutdown_signal.await;

    reporter.abort();
    engine.stop_server().await;
    info!(bytes = engine.bytes_transferred(), "Shutdown complete");
    cli::info("Server stopped");

    Ok(())
}
