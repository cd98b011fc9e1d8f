//! Execution handle: owns a copy of the executed plan, finalizes adaptive
//! wrappers on first demand and drives the runtime.
//!
//! Finalizing an `AdaptivePlan` runs the query-stage chain over its input
//! plan and then coalesces shuffles. Every hash exchange (subquery plans
//! included) gets the same partition count
//!
//! ```text
//! n = min(shuffle_partitions, max(1, ceil(max_rows / advisory_rows)))
//! ```
//!
//! where `max_rows` is the largest estimated exchange input. One count for
//! all exchanges keeps join sides co-partitioned.

use std::fmt;
use std::sync::Arc;

use qstage_core::catalog::Catalog;
use qstage_core::config::PipelineConfig;
use qstage_core::error::Result;
use qstage_core::id::QueryId;
use qstage_core::physical::{Partitioning, PhysExpr, PhysicalPlan, SubqueryExec};
use qstage_core::tracker::PlanTracker;
use qstage_core::types::Row;
use qstage_exec::runtime::ResultStream;
use qstage_planner::stats::physical_stats;

use crate::cell::StageCell;
use crate::prepare::PrepareContext;
use crate::session::Session;

pub struct ExecutionHandle {
    session: Arc<Session>,
    tracker: Arc<PlanTracker>,
    query_id: QueryId,
    plan: PhysicalPlan,
    final_plan: StageCell<PhysicalPlan>,
}

impl ExecutionHandle {
    pub fn new(
        session: Arc<Session>,
        tracker: Arc<PlanTracker>,
        query_id: QueryId,
        plan: PhysicalPlan,
    ) -> Self {
        Self {
            session,
            tracker,
            query_id,
            plan,
            final_plan: StageCell::new("final_plan"),
        }
    }

    /// The executed plan this handle was created with.
    pub fn plan(&self) -> &PhysicalPlan {
        &self.plan
    }

    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    pub fn is_finalized(&self) -> bool {
        self.final_plan.is_populated()
    }

    /// The plan with every adaptive wrapper finalized. Plans without one
    /// come back unchanged.
    pub fn final_plan(&self) -> Result<Arc<PhysicalPlan>> {
        self.final_plan.get_or_try_init(|| {
            self.session.check_cancelled(self.final_plan.name())?;
            let plan = self.plan.clone();
            if !plan.is_adaptive() {
                return Ok(plan);
            }
            self.tracker
                .measure_phase("adaptive_finalization", || self.finalize(plan))
        })
    }

    /// Start running the final plan. Rows are produced lazily.
    pub fn rows(&self) -> Result<ResultStream> {
        let plan = self.final_plan()?;
        self.session.runtime().execute(&plan)
    }

    pub fn collect(&self) -> Result<Vec<Row>> {
        self.rows()?.collect()
    }

    fn finalize(&self, plan: PhysicalPlan) -> Result<PhysicalPlan> {
        let ctx = PrepareContext::new(Arc::clone(&self.session), Arc::clone(&self.tracker));
        plan.transform_up(&mut |node| match node {
            PhysicalPlan::AdaptivePlan {
                input_plan,
                is_final: false,
            } => {
                let prepared = self.session.query_stage_chain().apply(*input_plan, &ctx)?;
                let partitions = coalesced_partitions(
                    &prepared,
                    self.session.catalog(),
                    self.session.config(),
                );
                tracing::debug!(
                    query_id = %self.query_id,
                    partitions,
                    "adaptive plan finalized"
                );
                Ok(PhysicalPlan::AdaptivePlan {
                    input_plan: Box::new(with_shuffle_partitions(prepared, partitions)?),
                    is_final: true,
                })
            }
            other => Ok(other),
        })
    }
}

impl fmt::Debug for ExecutionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionHandle")
            .field("query_id", &self.query_id)
            .field("finalized", &self.is_finalized())
            .finish_non_exhaustive()
    }
}

fn coalesced_partitions(plan: &PhysicalPlan, catalog: &Catalog, config: &PipelineConfig) -> usize {
    let mut estimates = Vec::new();
    exchange_estimates(plan, catalog, &mut estimates);
    match estimates.into_iter().max() {
        Some(rows) => {
            let wanted = rows.div_ceil(config.adaptive_advisory_partition_rows.max(1)).max(1);
            usize::try_from(wanted)
                .unwrap_or(usize::MAX)
                .min(config.shuffle_partitions)
        }
        None => config.shuffle_partitions,
    }
}

// Inputs that cannot be estimated are skipped.
fn exchange_estimates(plan: &PhysicalPlan, catalog: &Catalog, out: &mut Vec<u64>) {
    for node in plan.collect_nodes() {
        if let PhysicalPlan::Exchange {
            partitioning: Partitioning::Hash { .. },
            input,
            ..
        } = node
        {
            if let Ok(stats) = physical_stats(input, catalog) {
                out.push(stats.row_count);
            }
        }
        for e in node.expressions() {
            for sub in e.subqueries() {
                exchange_estimates(&sub.plan, catalog, out);
            }
        }
    }
}

fn with_shuffle_partitions(plan: PhysicalPlan, n: usize) -> Result<PhysicalPlan> {
    plan.transform_up(&mut |node| {
        let node = node.map_expressions(|e| {
            e.try_transform_up(&mut |expr| match expr {
                PhysExpr::Subquery(sub) => Ok(PhysExpr::Subquery(SubqueryExec {
                    plan: Box::new(with_shuffle_partitions(*sub.plan, n)?),
                    ..sub
                })),
                other => Ok(other),
            })
        })?;
        Ok(match node {
            PhysicalPlan::Exchange {
                partitioning: Partitioning::Hash { keys, .. },
                reuse_id,
                input,
            } => PhysicalPlan::Exchange {
                partitioning: Partitioning::Hash { keys, n },
                reuse_id,
                input,
            },
            PhysicalPlan::ReusedExchange {
                id,
                schema,
                partitioning: Partitioning::Hash { keys, .. },
            } => PhysicalPlan::ReusedExchange {
                id,
                schema,
                partitioning: Partitioning::Hash { keys, n },
            },
            other => other,
        })
    })
}
