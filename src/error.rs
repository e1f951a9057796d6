use std::io;

/// Custom error type for deploy_hook operations
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("Failed to decode webhook body: {0}")]
    Decode(String),

    #[error("No deploy target configured for repository '{0}'")]
    UnknownRepository(String),

    #[error("Command failed: {command}\n{message}")]
    CommandFailed { command: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Helper type for Results that use DeployError
pub type Result<T> = std::result::Result<T, DeployError>;
