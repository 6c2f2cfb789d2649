use hierarchical_retrieval_agent::{agent::HierarchicalAgent, config::AgentConfig};
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
        .with_writer(std::io::stderr)
        .init();

    let query = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    if query.trim().is_empty() {
        eprintln!("usage: agent <question>");
        std::process::exit(2);
    }

    let config = AgentConfig::from_env()?;
    let agent = HierarchicalAgent::from_config(&config)?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing with the results collected so far");
            on_interrupt.cancel();
        }
    });

    info!(query = %query, "Running query");

    let outcome = agent.run_query_with_cancellation(&query, cancel).await?;

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "audit_id": outcome.audit_id,
            "response": outcome.response,
        }))?
    );

    Ok(())
}
