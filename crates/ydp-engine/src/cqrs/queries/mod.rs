pub mod list_batches;
pub mod stream_state;

/// Error type for operator queries
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("Invalid filter: {0}")]
    InvalidFilter(String),
    #[error("Merge store error: {0}")]
    Store(#[from] crate::merge::StoreError),
    #[error("Query dispatch failed: {0}")]
    Dispatch(String),
}
