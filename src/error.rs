use thiserror::Error;

#[derive(Error, Debug)]
pub enum JudgeletError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    #[error("TOML parse error: {0}")]
    TomlParse(String),

    #[error("Invalid execution request: {0}")]
    InvalidRequest(String),

    // Sandbox errors
    #[error("Backend '{backend}' is not available: {reason}")]
    BackendNotAvailable { backend: String, reason: String },

    #[error("Sandbox launch failed: {0}")]
    Launch(String),

    #[error("Sandbox signal delivery failed: {0}")]
    Signal(String),

    #[error("Sandbox teardown failed: {0}")]
    Teardown(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Generic wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl JudgeletError {
    /// Launch failures are fatal for the execution and are never retried.
    pub fn is_launch_failure(&self) -> bool {
        matches!(
            self,
            Self::Launch(_) | Self::BackendNotAvailable { .. } | Self::InvalidRequest(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, JudgeletError>;
