//! Merge engine and merge stores

mod engine;
mod memory;
mod postgres;
mod store;

pub use engine::{check_schema_evolution, conform_row, plan_dataset, CapturedBatch, MergeEngine, MergePlan};
pub use memory::MemoryMergeStore;
pub use postgres::{PgMergeStore, MIGRATOR};
pub use store::{
    BatchCommit, BatchFilter, ChangeEvent, ChangeEventKind, DatasetCommit, MergeOp, MergeStore,
    SchemaRecord, StoreError, StoredRecord, VersionRecord, OPEN_BATCH,
};
