//! Error types for YDP model handling

use thiserror::Error;

/// Result type alias for model and configuration operations
pub type Result<T> = std::result::Result<T, YdpError>;

/// Main error type for the declarative model layer
#[derive(Error, Debug)]
pub enum YdpError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Model parse error: {0}")]
    ModelParse(#[from] serde_yaml::Error),

    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },

    #[error("Datastore not found: {0}")]
    DatastoreNotFound(String),

    #[error("Dataset not found: {datastore}.{dataset}")]
    DatasetNotFound { datastore: String, dataset: String },

    #[error("Workspace not found: {0}")]
    WorkspaceNotFound(String),

    #[error("Model validation failed with {} issue(s): {}", .0.len(), .0.join("; "))]
    Validation(Vec<String>),

    #[error("Configuration error: {0}")]
    Config(String),
}
