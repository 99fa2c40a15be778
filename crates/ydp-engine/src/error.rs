//! Pipeline error taxonomy
//!
//! Every variant carries enough attribution (platform, stream, batch, target,
//! job) to be actionable from the log line alone.

use std::fmt::Display;
use thiserror::Error;

use crate::batch::StreamKey;
use crate::merge::StoreError;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// Source unreachable, rejected credentials or timed out
    #[error("Source unavailable for {platform}/{stream} batch {batch}: {reason}")]
    ConnectorUnavailable {
        platform: String,
        stream: StreamKey,
        batch: i64,
        reason: String,
    },

    /// Captured shape disagrees with the declared schema
    #[error("Schema mismatch for {platform}/{stream} batch {batch}, dataset {dataset}: {detail}")]
    SchemaMismatch {
        platform: String,
        stream: StreamKey,
        batch: i64,
        dataset: String,
        detail: String,
    },

    /// No declared platform satisfies a dataset group's retention requirement
    #[error("No compatible platform for {workspace}/{group} sink {sink}: requires {required}")]
    NoCompatiblePlatform {
        workspace: String,
        group: String,
        sink: String,
        required: String,
    },

    #[error("Replication target {group}/{target} unavailable: {reason}")]
    ReplicationTargetUnavailable {
        group: String,
        target: String,
        reason: String,
    },

    #[error("Transformer {job} failed in output batch {batch}: {reason}")]
    TransformerExecutionFailure {
        job: String,
        batch: i64,
        reason: String,
    },

    #[error("Merge store failure ({context}): {source}")]
    Store {
        context: String,
        #[source]
        source: StoreError,
    },

    #[error("Model error: {0}")]
    Model(#[from] ydp_common::YdpError),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl PipelineError {
    /// Wrap a store error with the operation it interrupted
    pub fn store(context: impl Display) -> impl FnOnce(StoreError) -> PipelineError {
        let context = context.to_string();
        move |source| PipelineError::Store { context, source }
    }

    /// Whether the next scheduled trigger should try again
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::ConnectorUnavailable { .. }
            | PipelineError::ReplicationTargetUnavailable { .. }
            | PipelineError::TransformerExecutionFailure { .. }
            | PipelineError::Store { .. } => true,
            PipelineError::SchemaMismatch { .. }
            | PipelineError::NoCompatiblePlatform { .. }
            | PipelineError::Model(_)
            | PipelineError::Config(_) => false,
        }
    }

    /// Stable category name for logs and persisted batch errors
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::ConnectorUnavailable { .. } => "ConnectorUnavailable",
            PipelineError::SchemaMismatch { .. } => "SchemaMismatch",
            PipelineError::NoCompatiblePlatform { .. } => "NoCompatiblePlatform",
            PipelineError::ReplicationTargetUnavailable { .. } => "ReplicationTargetUnavailable",
            PipelineError::TransformerExecutionFailure { .. } => "TransformerExecutionFailure",
            PipelineError::Store { .. } => "Store",
            PipelineError::Model(_) => "Model",
            PipelineError::Config(_) => "Config",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy() {
        let unavailable = PipelineError::ConnectorUnavailable {
            platform: "YellowLive".to_string(),
            stream: StreamKey::datastore("Store1"),
            batch: 3,
            reason: "connection refused".to_string(),
        };
        assert!(unavailable.is_retryable());
        assert_eq!(unavailable.kind(), "ConnectorUnavailable");

        let mismatch = PipelineError::SchemaMismatch {
            platform: "YellowLive".to_string(),
            stream: StreamKey::datastore("Store1"),
            batch: 3,
            dataset: "customers".to_string(),
            detail: "unknown column nickname".to_string(),
        };
        assert!(!mismatch.is_retryable());
    }

    #[test]
    fn test_message_carries_attribution() {
        let err = PipelineError::ReplicationTargetUnavailable {
            group: "SQLServer".to_string(),
            target: "SQLServer".to_string(),
            reason: "login failed".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("SQLServer/SQLServer"));
        assert!(msg.contains("login failed"));

        let err = PipelineError::ConnectorUnavailable {
            platform: "YellowForensic".to_string(),
            stream: StreamKey::dataset("Store1", "addresses"),
            batch: 12,
            reason: "timed out".to_string(),
        };
        assert!(err.to_string().contains("YellowForensic/Store1#addresses batch 12"));
    }
}
