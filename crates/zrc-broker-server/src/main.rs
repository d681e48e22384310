use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use zrc_broker_server::config::ServerConfig;
use zrc_broker_server::BrokerServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = if let Ok(path) = std::env::var("ZRC_BROKER_CONFIG") {
        ServerConfig::from_toml(path)?
    } else {
        ServerConfig::from_env()?
    };

    let server = BrokerServer::new(config).await?;
    server.start().await?;

    Ok(())
}
