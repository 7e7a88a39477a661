use crm_chat_assistant::{
    api::{start_server, ApiState},
    config::load_env_and_log_filter,
    AppConfig,
};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables, then initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(load_env_and_log_filter("info"))
        .init();

    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Startup aborted: {}", e);
            eprintln!("⚠️  {}", e);
            eprintln!("📌 See .env.example for setup instructions");
            std::process::exit(1);
        }
    };

    info!("🚀 Sales CRM Assistant - API Server");
    info!("📍 Port: {}", config.port);

    let state = ApiState::bootstrap(&config).await?;

    info!("✅ Assistant initialized");
    info!("📡 Starting API server...");

    start_server(state, config.port).await?;

    Ok(())
}
