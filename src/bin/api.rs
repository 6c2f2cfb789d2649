use hierarchical_retrieval_agent::{agent::HierarchicalAgent, api::start_server, config::AgentConfig};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenv::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AgentConfig::from_env()?;

    if config.gemini_api_key.is_empty() {
        warn!("GEMINI_API_KEY not set; every query will fail at the first think step");
    }
    if config.summary_api_base_url.is_none() {
        warn!("SUMMARY_API_BASE_URL not set; tool calls will fail");
    }

    info!("Hierarchical Retrieval Agent - API Server");
    info!("Port: {}", config.api_port);
    info!(
        max_iterations = config.max_iterations,
        model = %config.gemini_model,
        "Agent configured"
    );

    let agent = Arc::new(HierarchicalAgent::from_config(&config)?);

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            on_signal.cancel();
        }
    });

    start_server(agent, config.api_port, shutdown).await?;

    Ok(())
}
