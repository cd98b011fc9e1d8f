#![forbid(unsafe_code)]
//! qstage-planner: the collaborators the compilation pipeline drives.
//!
//! Design:
//! - `traits` declares the seams (`Analyzer`, `CacheEngine`, `Optimizer`,
//!   `QueryPlanner`); the pipeline only ever talks to these.
//! - This crate adds the default implementations:
//!     * `CatalogAnalyzer` binding names and types against a `Catalog`
//!     * `CacheManager` substituting cached subtrees
//!     * `RuleOptimizer` running batches of logical rewrite rules
//!     * `RulePlanner` producing physical candidates lazily
//!     * coarse `stats` used for annotations and adaptive sizing
//!     * the YAML query DSL
//!
//! Nothing here executes a plan or touches files.

pub mod analyzer;
pub mod cache;
pub mod dsl;
pub mod planner;
pub mod rules;
pub mod stats;
pub mod traits;

pub use analyzer::CatalogAnalyzer;
pub use cache::{CacheManager, CachedEntry};
pub use dsl::{parse_query, DslError, ParsedQuery};
pub use planner::{RulePlanner, Strategy};
pub use rules::{Batch, OptimizerRule, RuleOptimizer};
pub use stats::{logical_stats, physical_stats, Statistics};
pub use traits::{Analyzer, CacheEngine, Candidates, Optimizer, QueryPlanner};
