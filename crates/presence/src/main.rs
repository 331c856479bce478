use presence_server::{run_server, PresenceServerConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Local development reads overrides from .env
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();

    let config = PresenceServerConfig::from_env()?;
    info!(configuration = ?config, "Loaded presence server configuration");
    run_server(config).await
}
