//! YDP Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared model types, validation, hashing, and logging for the Yellow Data
//! Platform pipeline.
//!
//! # Overview
//!
//! - **Model**: The declarative ecosystem (datastores, datasets, workspaces,
//!   platforms, replica groups) consumed by the engine
//! - **Validation**: Reference checks and transformer job-graph cycle detection
//! - **Hashing**: Canonical row hashing used for change detection
//! - **Logging**: Centralised `tracing` initialisation
//!
//! # Example
//!
//! ```no_run
//! use ydp_common::model::Ecosystem;
//!
//! fn load() -> ydp_common::Result<Ecosystem> {
//!     let ecosystem = Ecosystem::from_yaml_file("demos/yellow_starter.yaml")?;
//!     ecosystem.lint()?;
//!     Ok(ecosystem)
//! }
//! ```

pub mod error;
pub mod hash;
pub mod logging;
pub mod model;

// Re-export commonly used types
pub use error::{Result, YdpError};
