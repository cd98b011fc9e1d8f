//! Convenient re-exports for downstream crates.

pub use crate::catalog::{Catalog, TableDef, TablePartition};
pub use crate::config::PipelineConfig;
pub use crate::error::{Error, Result};
pub use crate::expr::{AggregateExpr, Aggregation, BinaryOp, Expr};
pub use crate::id::{ExchangeId, QueryId, StageId, SubqueryId};
pub use crate::logical::{JoinType, LogicalPlan};
pub use crate::physical::{Distribution, Partitioning, PhysExpr, PhysicalPlan, SubqueryExec};
pub use crate::schema::{DataType, Field, Schema};
pub use crate::tracker::{PhaseSummary, PlanTracker, RuleSummary};
pub use crate::types::{Row, RowBatch, Scalar};
