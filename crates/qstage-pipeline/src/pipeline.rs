//! `CompilationPipeline`: one submitted query moving through its stages.
//!
//! ```text
//! logical -> analyzed -> with_cached_data -> optimized -> physical -> executed -> handle
//! ```
//!
//! Each stage is computed at most once (on first demand) and cached in a
//! [`StageCell`]. A stage reads its predecessor through the predecessor's
//! accessor and works on a deep copy of it, so the cached value of an
//! earlier stage is never touched by a later one. Errors come back to the
//! caller unchanged and leave every earlier cached stage in place.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use qstage_core::error::{Error, Result};
use qstage_core::id::QueryId;
use qstage_core::logical::LogicalPlan;
use qstage_core::physical::PhysicalPlan;
use qstage_core::tracker::PlanTracker;
use qstage_core::types::Row;
use qstage_exec::runtime::ResultStream;
use qstage_planner::planner::no_candidate;

use crate::cell::StageCell;
use crate::handle::ExecutionHandle;
use crate::prepare::PrepareContext;
use crate::session::Session;

pub struct CompilationPipeline {
    session: Arc<Session>,
    logical: LogicalPlan,
    query_id: QueryId,
    tracker: Arc<PlanTracker>,
    analyzed: StageCell<LogicalPlan>,
    with_cached_data: StageCell<LogicalPlan>,
    optimized: StageCell<LogicalPlan>,
    physical: StageCell<PhysicalPlan>,
    executed: StageCell<PhysicalPlan>,
    handle: StageCell<ExecutionHandle>,
}

impl CompilationPipeline {
    pub fn new(session: Arc<Session>, logical: LogicalPlan) -> Self {
        let query_id = QueryId::random();
        tracing::debug!(%query_id, nodes = logical.node_count(), "pipeline created");
        Self {
            session,
            logical,
            query_id,
            tracker: Arc::new(PlanTracker::new()),
            analyzed: StageCell::new("analyzed"),
            with_cached_data: StageCell::new("with_cached_data"),
            optimized: StageCell::new("optimized_plan"),
            physical: StageCell::new("physical_plan"),
            executed: StageCell::new("executed_plan"),
            handle: StageCell::new("execution_handle"),
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// The plan as submitted.
    pub fn logical(&self) -> &LogicalPlan {
        &self.logical
    }

    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    pub fn tracker(&self) -> &Arc<PlanTracker> {
        &self.tracker
    }

    pub fn analyzed(&self) -> Result<Arc<LogicalPlan>> {
        self.stage(&self.analyzed, || {
            self.tracker.measure_phase("analysis", || {
                self.session
                    .analyzer()
                    .analyze(&self.logical, &self.tracker)
            })
        })
    }

    pub fn assert_analyzed(&self) -> Result<()> {
        self.analyzed().map(drop)
    }

    /// Rejects plans the batch runtime cannot run. Not memoized.
    pub fn assert_supported(&self) -> Result<()> {
        if !self.session.config().unsupported_operation_check {
            return Ok(());
        }
        let analyzed = self.analyzed()?;
        if !analyzed.contains_streaming() {
            return Ok(());
        }
        let mut tables = Vec::new();
        streaming_tables(&analyzed, &mut tables);
        Err(Error::Unsupported(format!(
            "queries with streaming sources must be executed with a streaming runtime: {}",
            tables.join(", ")
        )))
    }

    pub fn with_cached_data(&self) -> Result<Arc<LogicalPlan>> {
        self.stage(&self.with_cached_data, || {
            self.assert_analyzed()?;
            self.assert_supported()?;
            let analyzed = (*self.analyzed()?).clone();
            Ok(self.session.cache().substitute(analyzed))
        })
    }

    pub fn optimized_plan(&self) -> Result<Arc<LogicalPlan>> {
        self.stage(&self.optimized, || {
            let plan = (*self.with_cached_data()?).clone();
            self.tracker.measure_phase("optimization", || {
                self.session
                    .optimizer()
                    .optimize(plan, &self.tracker, self.session.config())
            })
        })
    }

    /// First candidate of the planner for the optimized plan.
    pub fn physical_plan(&self) -> Result<Arc<PhysicalPlan>> {
        self.stage(&self.physical, || {
            let optimized = (*self.optimized_plan()?).clone();
            self.tracker.measure_phase("planning", || {
                plan_first_candidate(
                    &self.session,
                    LogicalPlan::ReturnAnswer {
                        input: Box::new(optimized),
                    },
                )
            })
        })
    }

    /// The physical plan after the session's preparation chain.
    pub fn executed_plan(&self) -> Result<Arc<PhysicalPlan>> {
        self.stage(&self.executed, || {
            let physical = (*self.physical_plan()?).clone();
            self.tracker.measure_phase("preparation", || {
                self.session
                    .preparation_chain()
                    .apply(physical, &self.prepare_context())
            })
        })
    }

    pub fn execution_handle(&self) -> Result<Arc<ExecutionHandle>> {
        self.stage(&self.handle, || {
            let executed = (*self.executed_plan()?).clone();
            Ok(ExecutionHandle::new(
                Arc::clone(&self.session),
                Arc::clone(&self.tracker),
                self.query_id,
                executed,
            ))
        })
    }

    /// Lazy result rows of the final plan.
    pub fn execute(&self) -> Result<ResultStream> {
        self.execution_handle()?.rows()
    }

    pub fn collect(&self) -> Result<Vec<Row>> {
        self.execution_handle()?.collect()
    }

    /// Plan and prepare a subquery plan independently of this query's
    /// stages.
    pub fn prepare_subquery(&self, logical: &LogicalPlan) -> Result<PhysicalPlan> {
        self.prepare_context().prepare_subquery(logical)
    }

    fn prepare_context(&self) -> PrepareContext {
        PrepareContext::new(Arc::clone(&self.session), Arc::clone(&self.tracker))
    }

    fn stage<T, F>(&self, cell: &StageCell<T>, produce: F) -> Result<Arc<T>>
    where
        F: FnOnce() -> Result<T>,
    {
        cell.get_or_try_init(|| {
            self.session.check_cancelled(cell.name())?;
            let start = Instant::now();
            let out = produce();
            let elapsed_ms = start.elapsed().as_millis() as u64;
            match &out {
                Ok(_) => tracing::debug!(
                    stage = cell.name(),
                    elapsed_ms,
                    query_id = %self.query_id,
                    "stage produced"
                ),
                Err(e) => tracing::warn!(
                    stage = cell.name(),
                    elapsed_ms,
                    query_id = %self.query_id,
                    error = %e,
                    "stage failed"
                ),
            }
            out
        })
    }
}

impl fmt::Debug for CompilationPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let populated: Vec<&str> = [
            (self.analyzed.name(), self.analyzed.is_populated()),
            (self.with_cached_data.name(), self.with_cached_data.is_populated()),
            (self.optimized.name(), self.optimized.is_populated()),
            (self.physical.name(), self.physical.is_populated()),
            (self.executed.name(), self.executed.is_populated()),
            (self.handle.name(), self.handle.is_populated()),
        ]
        .into_iter()
        .filter_map(|(name, done)| done.then_some(name))
        .collect();
        f.debug_struct("CompilationPipeline")
            .field("query_id", &self.query_id)
            .field("populated", &populated)
            .finish_non_exhaustive()
    }
}

/// First element of the planner's candidate sequence.
pub(crate) fn plan_first_candidate(session: &Session, logical: LogicalPlan) -> Result<PhysicalPlan> {
    let mut candidates = session.planner().plan(&logical, session.config())?;
    candidates
        .next()
        .unwrap_or_else(|| Err(no_candidate(&logical)))
}

fn streaming_tables(plan: &LogicalPlan, out: &mut Vec<String>) {
    if let LogicalPlan::Relation {
        table,
        streaming: true,
        ..
    } = plan
    {
        if !out.contains(table) {
            out.push(table.clone());
        }
    }
    for e in plan.expressions() {
        for sub in e.subquery_plans() {
            streaming_tables(sub, out);
        }
    }
    for c in plan.children() {
        streaming_tables(c, out);
    }
}
