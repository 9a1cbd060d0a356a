use pairgate_server::config::ServerConfig;
use pairgate_server::PairingServer;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Load configuration
    let config = ServerConfig::load()?;
    let engine = config.build_engine();

    // Create and start server
    let server = PairingServer::new(config, engine)?;
    server.start().await?;

    Ok(())
}
