//! Declarative ecosystem model
//!
//! Consumed read-only by the engine.

pub mod ecosystem;
pub mod schema;
pub mod trigger;
mod validation;

pub use ecosystem::*;
pub use schema::{Classification, ClassificationTag, Column, DataType, Dataset, Schema};
pub use trigger::CronTrigger;
pub use validation::unsupported_replica_containers;
