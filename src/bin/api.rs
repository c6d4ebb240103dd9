use ops_copilot::{api::start_server, Copilot, CopilotConfig};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Load .env and the process environment
    let config = CopilotConfig::from_env()?;
    let api_port = config.api_port;

    info!("🚀 Operations Copilot - API Server");
    info!("📍 Port: {}", api_port);

    let copilot = Arc::new(Copilot::init(config).await?);

    info!(
        generator = copilot.generator_name(),
        audit = copilot.audit().backend(),
        chunks = copilot.indexed_chunks(),
        "✅ Copilot initialized"
    );
    info!("📡 Starting API server...");

    start_server(Arc::clone(&copilot), api_port).await?;

    copilot.shutdown().await?;
    Ok(())
}
