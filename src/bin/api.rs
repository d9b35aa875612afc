use tracing::info;
use tracing_subscriber::EnvFilter;
use wealth_steward::{
    api::{start_server, AppState},
    build_orchestrator, Settings,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = Settings::from_env()?;
    let api_token = settings.api_token()?.to_string();

    info!("Wealth Steward - API Server");
    info!(
        model = %settings.gemini_model,
        router_model = %settings.router_model,
        max_iterations = settings.agent.max_iterations,
        durable = settings.database_url.is_some(),
        "Configuration loaded"
    );

    let orchestrator = build_orchestrator(&settings)?;
    info!("Orchestrator initialized");

    let state = AppState::new(orchestrator, api_token, env!("CARGO_PKG_NAME"));
    start_server(state, &settings.host, settings.port).await?;

    Ok(())
}
