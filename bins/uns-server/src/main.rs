use std::sync::Arc;

use clap::Parser;

use source_simulated::SimulatedSourceFactory;
use transport_local::LocalBroker;
use transport_mqtt::MqttTransportFactory;
use uns_engine::{Engine, Factories, UnsConfig};

#[derive(Parser)]
#[command(name = "uns-server", about = "Unified namespace integration server")]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(long, default_value = "config.toml", env = "UNS_CONFIG")]
    config: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    tracing::info!(config = %cli.config, "loading configuration");
    let config = match UnsConfig::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let broker = LocalBroker::new();
    let factories = Factories::new()
        .with_transport("local", Arc::new(broker))
        .with_transport("mqtt", Arc::new(MqttTransportFactory))
        .with_tag_source(source_simulated::SCHEME, Arc::new(SimulatedSourceFactory));

    tracing::info!(
        messaging_clients = config.messaging_clients.len(),
        workers = config.workers.len(),
        started = config.orchestrator.worker_names.len(),
        "bootstrapping engine"
    );
    let engine = match Engine::bootstrap(config, &factories).await {
        Ok(e) => e,
        Err(e) => {
            tracing::error!(error = %e, "failed to bootstrap engine");
            std::process::exit(1);
        }
    };

    tracing::info!("uns-server started, press Ctrl+C to stop");
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl+C");
    }

    tracing::info!("shutting down...");
    engine.shutdown().await;
}
