//! Core plan model for the qstage compilation pipeline.
//!
//! Everything here is plain data plus pure functions over it: values and
//! schemas, logical and physical plan trees, strongly-typed ids, plan
//! fingerprints, the table catalog, configuration, and the planning
//! tracker. No execution, no I/O.
//!
//! Plans are owned trees. A stage that hands a plan onward hands a deep
//! copy, so nothing downstream can alias a tree another stage still holds.

#![forbid(unsafe_code)]

pub mod catalog;
pub mod config;
pub mod error;
pub mod expr;
pub mod hash;
pub mod id;
pub mod logical;
pub mod physical;
pub mod prelude;
pub mod schema;
pub mod tracker;
pub mod tree;
pub mod types;

pub use catalog::{Catalog, TableDef, TablePartition};
pub use config::PipelineConfig;
pub use error::{Error, Result};
pub use logical::LogicalPlan;
pub use physical::PhysicalPlan;
pub use tracker::PlanTracker;

/// Crate version, surfaced by the CLI.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
