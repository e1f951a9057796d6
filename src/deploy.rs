//! Deploy orchestration: pull, migrate, restart, health-check, rollback.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::error::DeployError;
use crate::utils::resolve_target;
use crate::{DeployConfig, DeployTarget};

/// Settle time between restarting a service and probing its health endpoint.
pub const SETTLE_DELAY: Duration = Duration::from_secs(10);

/// The data-backed service; the only one that runs schema migrations.
pub const PRIMARY_SERVICE: &str = "api";

/// Migration entrypoint, run from the repository checkout.
pub const MIGRATE_SCRIPT: &str = "./migrate.sh";

/// Result of one deploy invocation. Never persisted, only logged and
/// broadcast to observers.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DeployOutcome {
    pub success: bool,
    pub message: String,
}

impl DeployOutcome {
    fn succeeded(message: String) -> Self {
        Self {
            success: true,
            message,
        }
    }

    fn failed(message: String) -> Self {
        Self {
            success: false,
            message,
        }
    }
}

/// Completion event broadcast after each deploy finishes.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DeployEvent {
    pub repository: String,
    pub branch: String,
    pub success: bool,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl DeployEvent {
    pub fn new(repository: String, branch: String, outcome: &DeployOutcome) -> Self {
        Self {
            repository,
            branch,
            success: outcome.success,
            message: outcome.message.clone(),
            timestamp: Utc::now(),
        }
    }
}

/// Seam for the external commands the orchestrator drives (git, docker).
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs `program` with `args` in `cwd`, capturing output. Returns
    /// stdout on success, `DeployError::CommandFailed` on a non-zero exit
    /// or a spawn failure.
    async fn run(&self, cwd: &str, program: &str, args: &[&str]) -> Result<String, DeployError>;
}

/// Seam for the post-restart health probe.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Issues one GET and returns the HTTP status code, or a request-level
    /// error description.
    async fn probe(&self, url: &str) -> Result<u16, String>;
}

/// Production runner backed by `tokio::process::Command`.
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, cwd: &str, program: &str, args: &[&str]) -> Result<String, DeployError> {
        let command = if args.is_empty() {
            program.to_string()
        } else {
            format!("{} {}", program, args.join(" "))
        };
        info!("Running (cwd = '{}'): {}", cwd, command);

        let output = tokio::process::Command::new(program)
            .current_dir(cwd)
            .args(args)
            .output()
            .await
            .map_err(|e| DeployError::CommandFailed {
                command: command.clone(),
                message: format!("failed to start: {}", e),
            })?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            Err(DeployError::CommandFailed {
                command,
                message: String::from_utf8_lossy(&output.stderr).to_string(),
            })
        }
    }
}

/// Production probe backed by `reqwest`.
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn probe(&self, url: &str) -> Result<u16, String> {
        self.client
            .get(url)
            .send()
            .await
            .map(|resp| resp.status().as_u16())
            .map_err(|e| e.to_string())
    }
}

/// Executes the deployment sequence for one webhook delivery.
///
/// All failures are contained here and converted into a failed
/// [`DeployOutcome`]; nothing escapes to the caller.
pub struct Orchestrator {
    runner: Arc<dyn CommandRunner>,
    probe: Arc<dyn HealthProbe>,
    settle_delay: Duration,
}

impl Orchestrator {
    pub fn new() -> Self {
        Self::with_parts(
            Arc::new(ProcessRunner),
            Arc::new(HttpProbe::new()),
            SETTLE_DELAY,
        )
    }

    /// Construct with injected runner/probe. Used by tests to observe the
    /// command sequence without touching git or docker.
    pub fn with_parts(
        runner: Arc<dyn CommandRunner>,
        probe: Arc<dyn HealthProbe>,
        settle_delay: Duration,
    ) -> Self {
        Self {
            runner,
            probe,
            settle_delay,
        }
    }

    pub async fn deploy(
        &self,
        config: &DeployConfig,
        repository: &str,
        branch: &str,
    ) -> DeployOutcome {
        let target = match resolve_target(&config.targets, repository) {
            Ok(target) => target,
            Err(e) => {
                // Nothing was started, so there is nothing to roll back.
                error!("Deploy aborted: {}", e);
                return DeployOutcome::failed(e.to_string());
            }
        };

        info!(
            "Deploying '{}' ({}) as service '{}' at '{}'",
            repository, branch, target.service, target.repo_path
        );

        if let Err(e) = self
            .runner
            .run(&target.repo_path, "git", &["pull", "origin", branch])
            .await
        {
            return self.rollback_after(target, e).await;
        }

        // Migrations run only for the data-backed service, and before the
        // restart: new code must not come up against an unmigrated schema.
        if target.service == PRIMARY_SERVICE {
            info!("Running migrations for service '{}'", target.service);
            if let Err(e) = self.runner.run(&target.repo_path, MIGRATE_SCRIPT, &[]).await {
                return self.rollback_after(target, e).await;
            }
        }

        if let Err(e) = self
            .runner
            .run(
                &target.repo_path,
                "docker",
                &["compose", "up", "-d", "--build", "--no-deps", &target.service],
            )
            .await
        {
            return self.rollback_after(target, e).await;
        }

        // The restart succeeded; from here the health check is advisory.
        // Transient startup slowness must not trigger a rollback.
        tokio::time::sleep(self.settle_delay).await;
        match self.probe.probe(&target.health_url).await {
            Ok(status) if (200..300).contains(&status) => {
                info!("Health check passed for '{}' (HTTP {})", target.service, status);
            }
            Ok(status) => {
                warn!(
                    "Health check for '{}' returned HTTP {}; keeping the new deployment",
                    target.service, status
                );
            }
            Err(e) => {
                warn!(
                    "Health check for '{}' failed ({}); keeping the new deployment",
                    target.service, e
                );
            }
        }

        DeployOutcome::succeeded(format!(
            "Deployed {} ({}) as service '{}'",
            repository, branch, target.service
        ))
    }

    /// Restart the service from its previously running images, no rebuild.
    /// The rollback's own result never overrides the original failure.
    async fn rollback_after(&self, target: &DeployTarget, cause: DeployError) -> DeployOutcome {
        error!("Deploy step failed for service '{}': {}", target.service, cause);

        match self
            .runner
            .run(
                &target.repo_path,
                "docker",
                &["compose", "up", "-d", "--no-deps", &target.service],
            )
            .await
        {
            // Output suppressed; only the fact of the rollback is logged.
            Ok(_) => info!("Rolled back service '{}' to previous images", target.service),
            Err(e) => error!("Rollback of service '{}' also failed: {}", target.service, e),
        }

        DeployOutcome::failed(cause.to_string())
    }
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}
