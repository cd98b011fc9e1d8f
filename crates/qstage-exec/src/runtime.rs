//! Runtime: execute a prepared `PhysicalPlan` in process and stream rows.
//!
//! - `Engine::execute` validates the plan eagerly (adaptive wrappers must be
//!   finalized) and returns a lazy [`ResultStream`]; the plan runs on the
//!   first `next()`.
//! - Operators exchange whole partitions. Scans yield columnar batches when
//!   the plan asks for them and row operators refuse them, so a missing
//!   `ColumnarToRow` surfaces as an execution error.
//! - Exchanges stamped with a `reuse_id` and planned subqueries are
//!   materialized once per execution; every later read is a cache hit and is
//!   counted in [`RunMetrics`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use qstage_core::catalog::Catalog;
use qstage_core::error::{Error, Result};
use qstage_core::expr::Aggregation;
use qstage_core::id::{ExchangeId, SubqueryId};
use qstage_core::physical::{PhysExpr, PhysicalPlan};
use qstage_core::schema::{DataType, Schema};
use qstage_core::types::{Row, RowBatch};

use crate::data::{rows_of, total_rows, PartitionData, Partitions};
use crate::error::{ExecError, ExecResult};
use crate::eval::{bind, BoundExpr, SubqueryRows};
use crate::metrics::{emit_span, RunMetrics};
use crate::operators::aggregate::{aggregate, BoundAggregate};
use crate::operators::basic::{filter, project, run_chain, RowStep};
use crate::operators::exchange::{key_indices, shuffle};
use crate::operators::join::sort_merge_join;
use crate::operators::scan::scan_table;
use crate::operators::sort::{limit, sort_partition};

/// Something that can turn a prepared physical plan into rows.
pub trait ExecutionRuntime: Send + Sync {
    fn execute(&self, plan: &PhysicalPlan) -> Result<ResultStream>;
}

type Producer = Box<dyn FnOnce() -> Result<(Vec<Row>, RunMetrics)> + Send>;

enum StreamState {
    Pending(Producer),
    Streaming(std::vec::IntoIter<Row>),
    Finished,
}

/// Lazily produced query output. A failed run yields its error once and
/// then ends.
pub struct ResultStream {
    state: StreamState,
    metrics: Option<RunMetrics>,
}

impl ResultStream {
    pub fn lazy<F>(produce: F) -> Self
    where
        F: FnOnce() -> Result<(Vec<Row>, RunMetrics)> + Send + 'static,
    {
        Self {
            state: StreamState::Pending(Box::new(produce)),
            metrics: None,
        }
    }

    /// Already-materialized rows (used by runtimes that run eagerly).
    pub fn from_rows(rows: Vec<Row>) -> Self {
        Self {
            state: StreamState::Streaming(rows.into_iter()),
            metrics: Some(RunMetrics::default()),
        }
    }

    /// True once the plan has run (successfully or not).
    pub fn is_started(&self) -> bool {
        !matches!(self.state, StreamState::Pending(_))
    }

    /// Counters of the run; `None` until the first `next()`.
    pub fn metrics(&self) -> Option<&RunMetrics> {
        self.metrics.as_ref()
    }
}

impl Iterator for ResultStream {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        match std::mem::replace(&mut self.state, StreamState::Finished) {
            StreamState::Pending(produce) => match produce() {
                Ok((rows, metrics)) => {
                    self.metrics = Some(metrics);
                    self.state = StreamState::Streaming(rows.into_iter());
                    self.next()
                }
                Err(e) => Some(Err(e)),
            },
            StreamState::Streaming(mut rows) => {
                let row = rows.next()?;
                self.state = StreamState::Streaming(rows);
                Some(Ok(row))
            }
            StreamState::Finished => None,
        }
    }
}

impl fmt::Debug for ResultStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            StreamState::Pending(_) => "pending",
            StreamState::Streaming(_) => "streaming",
            StreamState::Finished => "finished",
        };
        f.debug_struct("ResultStream")
            .field("state", &state)
            .field("metrics", &self.metrics)
            .finish()
    }
}

/// In-process runtime over catalog tables.
#[derive(Debug, Clone)]
pub struct Engine {
    catalog: Arc<Catalog>,
}

impl Engine {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self { catalog }
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    /// Run `plan` to completion.
    pub fn run(&self, plan: &PhysicalPlan) -> Result<(Vec<Row>, RunMetrics)> {
        check_finalized(plan)?;
        run_plan(&self.catalog, plan).map_err(Error::from)
    }
}

impl ExecutionRuntime for Engine {
    fn execute(&self, plan: &PhysicalPlan) -> Result<ResultStream> {
        check_finalized(plan)?;
        let plan = plan.clone();
        let catalog = Arc::clone(&self.catalog);
        Ok(ResultStream::lazy(move || {
            run_plan(&catalog, &plan).map_err(Error::from)
        }))
    }
}

/// Adaptive wrappers must be finalized before anything runs, including
/// those nested in subquery plans.
fn check_finalized(plan: &PhysicalPlan) -> Result<()> {
    if let PhysicalPlan::AdaptivePlan {
        input_plan,
        is_final,
    } = plan
    {
        if !is_final {
            return Err(Error::Execution(
                "AdaptivePlan must be finalized before execution".into(),
            ));
        }
        check_finalized(input_plan)?;
    }
    for e in plan.expressions() {
        for s in e.subqueries() {
            check_finalized(&s.plan)?;
        }
    }
    plan.children().into_iter().try_for_each(check_finalized)
}

fn run_plan(catalog: &Catalog, plan: &PhysicalPlan) -> ExecResult<(Vec<Row>, RunMetrics)> {
    let mut exec = Executor::new(catalog, plan);
    let parts = exec.execute(plan)?;
    let rows: Vec<Row> = rows_of(parts, "result")?.into_iter().flatten().collect();
    let metrics = exec.metrics;
    emit_span(
        "run",
        &[
            ("rows", rows.len().to_string()),
            ("exchanges_reused", metrics.exchanges_reused.to_string()),
            ("subqueries_reused", metrics.subqueries_reused.to_string()),
            ("partitions_pruned", metrics.partitions_pruned.to_string()),
        ],
    );
    Ok((rows, metrics))
}

/// Per-run state: what can be referenced by id, and what has been
/// materialized so far.
struct Executor<'a> {
    catalog: &'a Catalog,
    exchanges: HashMap<ExchangeId, &'a PhysicalPlan>,
    subqueries: HashMap<SubqueryId, &'a PhysicalPlan>,
    exchange_out: HashMap<ExchangeId, Vec<Vec<Row>>>,
    subquery_out: HashMap<SubqueryId, SubqueryRows>,
    metrics: RunMetrics,
}

impl<'a> Executor<'a> {
    fn new(catalog: &'a Catalog, plan: &'a PhysicalPlan) -> Self {
        let mut exec = Self {
            catalog,
            exchanges: HashMap::new(),
            subqueries: HashMap::new(),
            exchange_out: HashMap::new(),
            subquery_out: HashMap::new(),
            metrics: RunMetrics::default(),
        };
        exec.register(plan);
        exec
    }

    fn register(&mut self, plan: &'a PhysicalPlan) {
        if let PhysicalPlan::Exchange {
            reuse_id: Some(id), ..
        } = plan
        {
            self.exchanges.entry(*id).or_insert(plan);
        }
        if let PhysicalPlan::AdaptivePlan { input_plan, .. } = plan {
            self.register(input_plan);
        }
        for e in plan.expressions() {
            for s in e.subqueries() {
                self.subqueries.entry(s.id).or_insert(s.plan.as_ref());
                self.register(s.plan.as_ref());
            }
        }
        for c in plan.children() {
            self.register(c);
        }
    }

    fn execute(&mut self, plan: &'a PhysicalPlan) -> ExecResult<Partitions> {
        let out = self.run_node(plan)?;
        self.metrics
            .record(plan.node_name(), out.len(), total_rows(&out));
        Ok(out)
    }

    fn bind(&mut self, expr: &PhysExpr, schema: &Schema) -> ExecResult<BoundExpr> {
        let mut lookup = |id: SubqueryId| self.subquery_rows(id);
        bind(expr, schema, &mut lookup)
    }

    fn subquery_rows(&mut self, id: SubqueryId) -> ExecResult<SubqueryRows> {
        if let Some(rows) = self.subquery_out.get(&id) {
            self.metrics.subqueries_reused += 1;
            return Ok(Arc::clone(rows));
        }
        let plan = *self
            .subqueries
            .get(&id)
            .ok_or_else(|| ExecError::UnknownReference(id.to_string()))?;
        let parts = self.execute(plan)?;
        let rows: Vec<Row> = rows_of(parts, "Subquery")?.into_iter().flatten().collect();
        let rows = Arc::new(rows);
        self.subquery_out.insert(id, Arc::clone(&rows));
        Ok(rows)
    }

    fn map_rows<F>(&mut self, input: &'a PhysicalPlan, op: &'static str, mut f: F) -> ExecResult<Partitions>
    where
        F: FnMut(Vec<Row>) -> ExecResult<Vec<Row>>,
    {
        self.execute(input)?
            .into_iter()
            .map(|p| Ok(PartitionData::Rows(f(p.into_rows(op)?)?)))
            .collect()
    }

    fn run_node(&mut self, plan: &'a PhysicalPlan) -> ExecResult<Partitions> {
        match plan {
            PhysicalPlan::Scan {
                table,
                columnar,
                partition_column,
                partition_filters,
                ..
            } => {
                let def = self
                    .catalog
                    .table(table)
                    .ok_or_else(|| ExecError::MissingTable(table.clone()))?;
                let mut filters = Vec::with_capacity(partition_filters.len());
                if !partition_filters.is_empty() {
                    let field = partition_column
                        .as_deref()
                        .and_then(|c| def.schema.field_by_name(c))
                        .cloned()
                        .ok_or_else(|| {
                            ExecError::Invalid(format!(
                                "partition filters on '{table}' without a partition column"
                            ))
                        })?;
                    let pschema = Schema::new(vec![field]);
                    for f in partition_filters {
                        filters.push(self.bind(f, &pschema)?);
                    }
                }
                let out = scan_table(&def, &filters, *columnar)?;
                self.metrics.partitions_pruned += out.pruned;
                Ok(out.partitions)
            }
            PhysicalPlan::InMemoryScan { cache_key, .. } => {
                let def = self
                    .catalog
                    .table(cache_key)
                    .ok_or_else(|| ExecError::MissingTable(cache_key.clone()))?;
                Ok(scan_table(&def, &[], false)?.partitions)
            }
            PhysicalPlan::Filter { input, predicate } => {
                let bound = self.bind(predicate, &input.schema())?;
                self.map_rows(input, "Filter", |rows| filter(rows, &bound))
            }
            PhysicalPlan::Project { input, exprs, .. } => {
                let schema = input.schema();
                let bound = exprs
                    .iter()
                    .map(|e| self.bind(e, &schema))
                    .collect::<ExecResult<Vec<_>>>()?;
                self.map_rows(input, "Project", |rows| project(rows, &bound))
            }
            PhysicalPlan::FusedStage { input, .. } => {
                let mut chain = Vec::new();
                let mut node = input.as_ref();
                while let PhysicalPlan::Filter { input: child, .. }
                | PhysicalPlan::Project { input: child, .. } = node
                {
                    chain.push(node);
                    node = child.as_ref();
                }
                let mut steps = Vec::with_capacity(chain.len());
                for op in chain.into_iter().rev() {
                    steps.push(self.row_step(op)?);
                }
                self.map_rows(node, "FusedStage", |rows| run_chain(rows, &steps))
            }
            PhysicalPlan::HashAggregate {
                input,
                group_by,
                aggs,
                ..
            } => {
                let schema = input.schema();
                let group_idx = key_indices(&schema, group_by)?;
                let bound = aggs
                    .iter()
                    .map(|a| bind_aggregate(&a.func, &schema))
                    .collect::<ExecResult<Vec<_>>>()?;
                self.map_rows(input, "HashAggregate", |rows| {
                    aggregate(rows, &group_idx, &bound)
                })
            }
            PhysicalPlan::SortMergeJoin {
                left,
                right,
                on,
                join_type,
                ..
            } => {
                let l = rows_of(self.execute(left)?, "SortMergeJoin")?;
                let r = rows_of(self.execute(right)?, "SortMergeJoin")?;
                if l.len() != r.len() {
                    return Err(ExecError::Invalid(format!(
                        "SortMergeJoin inputs are not co-partitioned ({} vs {} partitions)",
                        l.len(),
                        r.len()
                    )));
                }
                let lkeys: Vec<String> = on.iter().map(|(k, _)| k.clone()).collect();
                let rkeys: Vec<String> = on.iter().map(|(_, k)| k.clone()).collect();
                let lidx = key_indices(&left.schema(), &lkeys)?;
                let ridx = key_indices(&right.schema(), &rkeys)?;
                let right_width = right.schema().len();
                l.iter()
                    .zip(&r)
                    .map(|(lp, rp)| {
                        sort_merge_join(lp, rp, &lidx, &ridx, *join_type, right_width)
                            .map(PartitionData::Rows)
                    })
                    .collect()
            }
            PhysicalPlan::Sort {
                input, order_by, ..
            } => {
                let idx = key_indices(&input.schema(), order_by)?;
                self.map_rows(input, "Sort", |rows| Ok(sort_partition(rows, &idx)))
            }
            PhysicalPlan::Limit { input, n } => {
                let parts = rows_of(self.execute(input)?, "Limit")?;
                Ok(vec![PartitionData::Rows(limit(parts, *n))])
            }
            PhysicalPlan::Exchange {
                partitioning,
                reuse_id,
                input,
            } => {
                if let Some(cached) = reuse_id.and_then(|id| self.exchange_out.get(&id)) {
                    let parts = cached.clone();
                    self.metrics.exchanges_reused += 1;
                    return Ok(parts.into_iter().map(PartitionData::Rows).collect());
                }
                let parts = rows_of(self.execute(input)?, "Exchange")?;
                let out = shuffle(parts, partitioning, &input.schema())?;
                if let Some(id) = reuse_id {
                    self.exchange_out.insert(*id, out.clone());
                }
                Ok(out.into_iter().map(PartitionData::Rows).collect())
            }
            PhysicalPlan::ReusedExchange { id, .. } => {
                let exchange = *self
                    .exchanges
                    .get(id)
                    .ok_or_else(|| ExecError::UnknownReference(id.to_string()))?;
                self.run_node(exchange)
            }
            PhysicalPlan::ColumnarToRow { input } => self
                .execute(input)?
                .into_iter()
                .map(|p| Ok(PartitionData::Rows(p.into_batch("ColumnarToRow")?.to_rows())))
                .collect(),
            PhysicalPlan::RowToColumnar { input } => {
                let names = input.schema().names();
                self.execute(input)?
                    .into_iter()
                    .map(|p| {
                        let rows = p.into_rows("RowToColumnar")?;
                        RowBatch::from_rows(&names, &rows)
                            .map(PartitionData::Columnar)
                            .map_err(ExecError::Invalid)
                    })
                    .collect()
            }
            PhysicalPlan::AdaptivePlan {
                input_plan,
                is_final,
            } => {
                if !is_final {
                    return Err(ExecError::Invalid(
                        "AdaptivePlan must be finalized before execution".into(),
                    ));
                }
                self.execute(input_plan)
            }
        }
    }

    fn row_step(&mut self, op: &'a PhysicalPlan) -> ExecResult<RowStep> {
        match op {
            PhysicalPlan::Filter { input, predicate } => {
                Ok(RowStep::Filter(self.bind(predicate, &input.schema())?))
            }
            PhysicalPlan::Project { input, exprs, .. } => {
                let schema = input.schema();
                let bound = exprs
                    .iter()
                    .map(|e| self.bind(e, &schema))
                    .collect::<ExecResult<Vec<_>>>()?;
                Ok(RowStep::Project(bound))
            }
            other => Err(ExecError::Invalid(format!(
                "{} cannot be fused",
                other.node_name()
            ))),
        }
    }
}

fn bind_aggregate(func: &Aggregation, schema: &Schema) -> ExecResult<BoundAggregate> {
    let column = match func {
        Aggregation::Count => None,
        Aggregation::Sum(c) | Aggregation::Avg(c) | Aggregation::Min(c) | Aggregation::Max(c) => {
            Some(c)
        }
    };
    let (input, float_input) = match column {
        None => (None, false),
        Some(c) => {
            let idx = schema
                .index_of(c)
                .ok_or_else(|| ExecError::MissingColumn(c.clone()))?;
            let float = schema
                .field(idx)
                .is_some_and(|f| f.data_type == DataType::Float64);
            (Some(idx), float)
        }
    };
    Ok(BoundAggregate {
        func: func.clone(),
        input,
        float_input,
    })
}
