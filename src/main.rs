use axum::{Router, routing};
use deploy_hook::deploy::Orchestrator;
use deploy_hook::handlers::{handle_webhook, health, not_found};
use deploy_hook::{AppState, DeployConfig, logging};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

const DEFAULT_PORT: &str = "9000";

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();

    let log_dir = std::env::var("LOG_DIR").ok().map(PathBuf::from);
    let _log_guard = match logging::init(log_dir) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to set up logging: {}", e);
            std::process::exit(1);
        }
    };

    let config = DeployConfig::from_env();
    if config.webhook_secret.is_empty() {
        warn!("WEBHOOK_SECRET is not set; every delivery will be rejected");
    }
    for target in &config.targets {
        info!(
            "Target '{}' -> service '{}' at '{}'",
            target.repository, target.service, target.repo_path
        );
    }

    let state = Arc::new(AppState::new(config, Arc::new(Orchestrator::new())));

    let port = std::env::var("PORT").unwrap_or_else(|_| DEFAULT_PORT.to_string());
    let bind_address = format!("0.0.0.0:{}", port);

    let app = Router::new()
        .route("/", routing::post(handle_webhook))
        .route("/health", routing::get(health))
        .fallback(not_found)
        .method_not_allowed_fallback(not_found)
        .with_state(state);

    info!("Listening on {}", bind_address);
    let listener = tokio::net::TcpListener::bind(&bind_address).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}
