#![forbid(unsafe_code)]
//! qstage-exec: in-process runtime for prepared physical plans, operator
//! kernels, CSV table loading, and run metrics.
//!
//! The runtime is deliberately literal: it executes exactly the tree it is
//! given. Exchanges, sorts and format transitions must already be in the
//! plan; when they are missing the run fails instead of compensating.

pub mod data;
pub mod error;
pub mod eval;
pub mod metrics;
pub mod operators;
pub mod readers;
pub mod runtime;

pub use error::{ExecError, ExecResult};
pub use metrics::{OperatorMetrics, RunMetrics};
pub use readers::{load_csv_table, write_csv};
pub use runtime::{Engine, ExecutionRuntime, ResultStream};
