pub mod deploy;
pub mod error;
pub mod handlers;
pub mod logging;
pub mod utils;
pub mod webhook;

use std::sync::Arc;
use tokio::sync::broadcast;

use crate::deploy::{DeployEvent, Orchestrator};

/// A configured deployment target: maps a repository name to the local
/// service it deploys.
#[derive(Debug, Clone)]
pub struct DeployTarget {
    /// Repository name as it appears in the webhook payload (lookup key).
    pub repository: String,
    /// Compose service identifier to rebuild/restart.
    pub service: String,
    /// Checkout directory the deploy commands run in.
    pub repo_path: String,
    /// Endpoint probed after restart.
    pub health_url: String,
}

#[derive(Debug, Clone)]
pub struct DeployConfig {
    /// Shared secret for webhook signatures. Empty means unconfigured,
    /// in which case every delivery is rejected.
    pub webhook_secret: String,
    pub targets: Vec<DeployTarget>,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

impl DeployConfig {
    /// Build the configuration from environment variables, falling back to
    /// the built-in target table. Each target field can be overridden
    /// independently (e.g. `BACKEND_PATH`).
    pub fn from_env() -> Self {
        let webhook_secret = std::env::var("WEBHOOK_SECRET").unwrap_or_default();
        let targets = vec![
            DeployTarget {
                repository: "Backend".to_string(),
                service: env_or("BACKEND_SERVICE", "api"),
                repo_path: env_or("BACKEND_PATH", "/srv/backend"),
                health_url: env_or("BACKEND_HEALTH_URL", "http://127.0.0.1:8000/health"),
            },
            DeployTarget {
                repository: "Frontend".to_string(),
                service: env_or("FRONTEND_SERVICE", "web"),
                repo_path: env_or("FRONTEND_PATH", "/srv/frontend"),
                health_url: env_or("FRONTEND_HEALTH_URL", "http://127.0.0.1:3000/health"),
            },
        ];

        Self {
            webhook_secret,
            targets,
        }
    }
}

pub struct AppState {
    pub config: DeployConfig,
    pub orchestrator: Arc<Orchestrator>,
    /// Completion events for each finished deploy. Purely observational;
    /// the HTTP response never waits on these.
    pub deploy_events: broadcast::Sender<DeployEvent>,
}

impl AppState {
    pub fn new(config: DeployConfig, orchestrator: Arc<Orchestrator>) -> Self {
        let (deploy_events, _) = broadcast::channel(64);
        Self {
            config,
            orchestrator,
            deploy_events,
        }
    }
}

pub type SharedState = Arc<AppState>;
