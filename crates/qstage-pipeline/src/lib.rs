#![forbid(unsafe_code)]
//! qstage-pipeline: the staged, memoized compilation pipeline.
//!
//! Design:
//! - `session` carries everything a query compiles against (config
//!   snapshot, catalog, collaborators, cancellation); there is no global
//!   active session.
//! - `pipeline` turns one logical plan into an executed physical plan
//!   through lazily computed stages, each cached in a `cell::StageCell`.
//! - `prepare` holds the ordered physical preparation rules.
//! - `handle` finalizes adaptive plans and drives the runtime.
//! - `explain` renders diagnostics that never fail and are always redacted.

pub mod cell;
pub mod explain;
pub mod handle;
pub mod pipeline;
pub mod prepare;
pub mod session;

pub use cell::{FailurePolicy, StageCell};
pub use explain::{try_or_error, ExplainMode, PipelineDebug};
pub use handle::ExecutionHandle;
pub use pipeline::CompilationPipeline;
pub use prepare::{PrepareContext, PreparationChain, PreparationRule};
pub use session::{CancelFlag, Session, SessionBuilder, REDACTED};
