//! Operator queries over the merge store

pub use mediator::DefaultAsyncMediator;
use mediator::{AsyncMediator, Request};
use std::sync::Arc;

use crate::merge::MergeStore;

pub mod queries;

use queries::QueryError;

pub type OperatorMediator = DefaultAsyncMediator;

pub fn build_mediator(store: Arc<dyn MergeStore>) -> OperatorMediator {
    DefaultAsyncMediator::builder()
        .add_handler({
            let store = store.clone();
            move |query| {
                let store = store.clone();
                async move { crate::cqrs::queries::list_batches::handle(store, query).await }
            }
        })
        .add_handler({
            let store = store.clone();
            move |query| {
                let store = store.clone();
                async move { crate::cqrs::queries::stream_state::handle(store, query).await }
            }
        })
        .build()
}

/// Send `query` to its registered handler
pub async fn dispatch<Q, R>(mediator: &mut OperatorMediator, query: Q) -> Result<R, QueryError>
where
    Q: Request<Result<R, QueryError>> + Send + 'static,
    R: Send + 'static,
{
    mediator
        .send(query)
        .await
        .map_err(|e| QueryError::Dispatch(e.to_string()))?
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::batch::StreamKey;
    use crate::merge::MemoryMergeStore;
    use queries::list_batches::{ListBatchesQuery, ListBatchesResponse};
    use queries::stream_state::{StreamStateQuery, StreamStateResponse};
    use uuid::Uuid;

    // Handler registration blocks in place
    #[tokio::test(flavor = "multi_thread")]
    async fn test_queries_routed_through_mediator() {
        let store = Arc::new(MemoryMergeStore::new());
        let stream = StreamKey::datastore("Store1");
        store.begin_batch("YellowLive", &stream, 1, Uuid::new_v4()).await.unwrap();
        store.fail_batch("YellowLive", &stream, 1, "connection refused").await.unwrap();

        let mut mediator = build_mediator(store);
        let batches: ListBatchesResponse = dispatch(&mut mediator, ListBatchesQuery::default()).await.unwrap();
        assert_eq!(batches.batches.len(), 1);

        let states: StreamStateResponse = dispatch(&mut mediator, StreamStateQuery { platform: None })
            .await
            .unwrap();
        assert!(states.streams.is_empty());

        let bad = ListBatchesQuery {
            limit: Some(0),
            ..Default::default()
        };
        let err = dispatch::<_, ListBatchesResponse>(&mut mediator, bad).await.unwrap_err();
        assert!(matches!(err, QueryError::InvalidFilter(_)));
    }
}
