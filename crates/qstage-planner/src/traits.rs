//! Collaborator seams used by the compilation pipeline.
//!
//! Each trait is one external subsystem. Implementations must be safe to
//! call from several threads, since a pipeline stage may be triggered
//! concurrently from diagnostics and execution.

use qstage_core::config::PipelineConfig;
use qstage_core::error::Result;
use qstage_core::logical::LogicalPlan;
use qstage_core::physical::PhysicalPlan;
use qstage_core::tracker::PlanTracker;

/// Resolves names and checks types. Fails with `Error::Analysis`.
pub trait Analyzer: Send + Sync {
    fn analyze(&self, plan: &LogicalPlan, tracker: &PlanTracker) -> Result<LogicalPlan>;
}

/// Replaces subtrees that have cached results. Total.
pub trait CacheEngine: Send + Sync {
    fn substitute(&self, plan: LogicalPlan) -> LogicalPlan;
}

/// Logical-to-logical rewriting.
pub trait Optimizer: Send + Sync {
    fn optimize(
        &self,
        plan: LogicalPlan,
        tracker: &PlanTracker,
        config: &PipelineConfig,
    ) -> Result<LogicalPlan>;
}

/// Lazy sequence of physical candidates.
pub type Candidates = Box<dyn Iterator<Item = Result<PhysicalPlan>> + Send>;

/// Logical-to-physical planning. An empty sequence means the plan cannot be
/// planned; the caller decides how to report it.
pub trait QueryPlanner: Send + Sync {
    fn plan(&self, plan: &LogicalPlan, config: &PipelineConfig) -> Result<Candidates>;
}
