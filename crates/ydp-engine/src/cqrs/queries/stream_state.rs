//! Stream state query
//!
//! Last committed batch per (platform, stream).

use mediator::Request;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::QueryError;
use crate::batch::StreamState;
use crate::merge::MergeStore;

/// Query to get stream states
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamStateQuery {
    /// Filter by data platform
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
}

/// Response for stream state query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamStateResponse {
    pub streams: Vec<StreamState>,
}

impl Request<Result<StreamStateResponse, QueryError>> for StreamStateQuery {}

pub async fn handle(
    store: Arc<dyn MergeStore>,
    query: StreamStateQuery,
) -> Result<StreamStateResponse, QueryError> {
    let streams = store.stream_states(query.platform.as_deref()).await?;
    Ok(StreamStateResponse { streams })
}
