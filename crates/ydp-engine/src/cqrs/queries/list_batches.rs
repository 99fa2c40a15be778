//! List batches query
//!
//! Batch history of the merge store, newest first.

use mediator::Request;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::QueryError;
use crate::batch::{BatchRecord, BatchStatus, StreamKey};
use crate::merge::{BatchFilter, MergeStore};

/// Default page size
pub const DEFAULT_LIMIT: i64 = 50;

/// Query to list batches
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListBatchesQuery {
    /// Filter by data platform
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    /// Filter by stream (`Store1` or `Store1#customers`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<String>,
    /// Filter by status (`RUNNING`, `COMMITTED`, `FAILED`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
}

impl ListBatchesQuery {
    fn to_filter(&self) -> Result<BatchFilter, QueryError> {
        let stream = self
            .stream
            .as_deref()
            .map(str::parse::<StreamKey>)
            .transpose()
            .map_err(QueryError::InvalidFilter)?;
        let status = self
            .status
            .as_deref()
            .map(str::parse::<BatchStatus>)
            .transpose()
            .map_err(QueryError::InvalidFilter)?;
        let limit = self.limit.unwrap_or(DEFAULT_LIMIT);
        if limit <= 0 {
            return Err(QueryError::InvalidFilter(format!("limit must be positive, got {}", limit)));
        }

        Ok(BatchFilter {
            platform: self.platform.clone(),
            stream,
            status,
            limit: Some(limit),
        })
    }
}

/// Response for list batches query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListBatchesResponse {
    pub batches: Vec<BatchRecord>,
}

impl Request<Result<ListBatchesResponse, QueryError>> for ListBatchesQuery {}

pub async fn handle(
    store: Arc<dyn MergeStore>,
    query: ListBatchesQuery,
) -> Result<ListBatchesResponse, QueryError> {
    let filter = query.to_filter()?;
    let batches = store.list_batches(&filter).await?;
    Ok(ListBatchesResponse { batches })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::merge::MemoryMergeStore;
    use uuid::Uuid;

    #[test]
    fn test_filter_parsing() {
        let query = ListBatchesQuery {
            stream: Some("Store1#customers".to_string()),
            status: Some("failed".to_string()),
            ..Default::default()
        };
        let filter = query.to_filter().unwrap();
        assert_eq!(filter.stream, Some(StreamKey::dataset("Store1", "customers")));
        assert_eq!(filter.status, Some(BatchStatus::Failed));
        assert_eq!(filter.limit, Some(DEFAULT_LIMIT));
    }

    #[test]
    fn test_bad_status_rejected() {
        let query = ListBatchesQuery {
            status: Some("pending".to_string()),
            ..Default::default()
        };
        assert!(matches!(query.to_filter(), Err(QueryError::InvalidFilter(_))));
    }

    #[tokio::test]
    async fn test_failed_batches_listed() {
        let store = Arc::new(MemoryMergeStore::new());
        let stream = StreamKey::datastore("Store1");
        store.begin_batch("YellowLive", &stream, 1, Uuid::new_v4()).await.unwrap();
        store.fail_batch("YellowLive", &stream, 1, "connection refused").await.unwrap();

        let response = handle(
            store,
            ListBatchesQuery {
                status: Some("FAILED".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(response.batches.len(), 1);
        assert_eq!(response.batches[0].error.as_deref(), Some("connection refused"));
    }
}
