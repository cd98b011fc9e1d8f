//! Physical plan tree and per-operator metadata.
//!
//! Each node declares what it produces (`output_partitioning`,
//! `output_ordering`, row vs columnar) and what it needs from its children
//! (`required_child_distribution`, `required_child_ordering`). The
//! preparation rules insert exchanges, sorts and format transitions from
//! these declarations; the nodes themselves never rearrange data.
//!
//! `AdaptivePlan` is opaque: it reports no children and no expressions, so
//! every tree traversal treats it as a leaf.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::expr::{AggregateExpr, BinaryOp};
use crate::hash::{hash_serde, Hash256};
use crate::id::{ExchangeId, StageId, SubqueryId};
use crate::logical::{JoinType, LogicalPlan};
use crate::schema::Schema;
use crate::tree::{render_tree, truncated_list, TreeChild, TreeNode};
use crate::types::Scalar;

/// What a parent needs from the partitioning of one child.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Distribution {
    Unspecified,
    /// Everything in one partition.
    AllTuples,
    /// Rows with equal values of these columns in the same partition.
    Clustered(Vec<String>),
}

/// How a node's output is actually split into partitions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Partitioning {
    /// Whatever the source happens to provide.
    Unknown,
    Single,
    Hash { keys: Vec<String>, n: usize },
}

impl Partitioning {
    pub fn satisfies(&self, required: &Distribution) -> bool {
        match (self, required) {
            (_, Distribution::Unspecified) => true,
            (Partitioning::Single, _) => true,
            (Partitioning::Hash { n: 1, .. }, _) => true,
            (Partitioning::Hash { keys, .. }, Distribution::Clustered(req)) => keys == req,
            _ => false,
        }
    }

    /// Partitioning that satisfies `required` with `n` partitions.
    pub fn for_distribution(required: &Distribution, n: usize) -> Partitioning {
        match required {
            Distribution::Clustered(keys) => Partitioning::Hash {
                keys: keys.clone(),
                n,
            },
            Distribution::AllTuples | Distribution::Unspecified => Partitioning::Single,
        }
    }

    pub fn num_partitions(&self) -> Option<usize> {
        match self {
            Partitioning::Unknown => None,
            Partitioning::Single => Some(1),
            Partitioning::Hash { n, .. } => Some(*n),
        }
    }
}

impl fmt::Display for Partitioning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Partitioning::Unknown => write!(f, "UnknownPartitioning"),
            Partitioning::Single => write!(f, "SinglePartition"),
            Partitioning::Hash { keys, n } => write!(f, "hashpartitioning({}, {n})", keys.join(", ")),
        }
    }
}

/// A planned subquery: an independently prepared physical plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubqueryExec {
    pub id: SubqueryId,
    pub name: String,
    pub plan: Box<PhysicalPlan>,
}

/// Resolved expressions evaluated by the runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PhysExpr {
    Column {
        name: String,
    },
    Literal(Scalar),
    Binary {
        left: Box<PhysExpr>,
        op: BinaryOp,
        right: Box<PhysExpr>,
    },
    Not(Box<PhysExpr>),
    Alias {
        expr: Box<PhysExpr>,
        name: String,
    },
    /// Scalar subquery not yet planned.
    ScalarSubqueryPlan(Box<LogicalPlan>),
    /// Runtime pruning filter not yet planned.
    DynamicPruning {
        key: Box<PhysExpr>,
        build: Box<LogicalPlan>,
        build_key: String,
    },
    /// Planned scalar subquery: first column of its single row.
    Subquery(SubqueryExec),
    /// `value IN (first column of subquery)`; `subquery` is `Subquery` or
    /// `ReusedSubquery`.
    InSubquery {
        value: Box<PhysExpr>,
        subquery: Box<PhysExpr>,
    },
    /// Refers to the earlier `Subquery` with the same id.
    ReusedSubquery {
        id: SubqueryId,
        name: String,
    },
}

/// Output name under which `exprs` carry input column `column` unchanged,
/// either passed through or renamed.
fn projected_name(exprs: &[PhysExpr], column: &str) -> Option<String> {
    exprs.iter().find_map(|e| match e {
        PhysExpr::Column { name } if name == column => Some(name.clone()),
        PhysExpr::Alias { expr, name } => match expr.as_ref() {
            PhysExpr::Column { name: source } if source == column => Some(name.clone()),
            _ => None,
        },
        _ => None,
    })
}

impl PhysExpr {
    pub fn col(name: impl Into<String>) -> PhysExpr {
        PhysExpr::Column { name: name.into() }
    }

    pub fn output_name(&self) -> String {
        match self {
            PhysExpr::Column { name } | PhysExpr::Alias { name, .. } => name.clone(),
            other => other.to_string(),
        }
    }

    pub fn referenced_columns(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns(&self, out: &mut Vec<String>) {
        match self {
            PhysExpr::Column { name } => {
                if !out.contains(name) {
                    out.push(name.clone());
                }
            }
            PhysExpr::Binary { left, right, .. } => {
                left.collect_columns(out);
                right.collect_columns(out);
            }
            PhysExpr::Not(e) | PhysExpr::Alias { expr: e, .. } => e.collect_columns(out),
            PhysExpr::DynamicPruning { key, .. } => key.collect_columns(out),
            PhysExpr::InSubquery { value, .. } => value.collect_columns(out),
            PhysExpr::Literal(_)
            | PhysExpr::ScalarSubqueryPlan(_)
            | PhysExpr::Subquery(_)
            | PhysExpr::ReusedSubquery { .. } => {}
        }
    }

    /// True while a subquery or pruning filter still needs planning.
    pub fn has_unplanned(&self) -> bool {
        match self {
            PhysExpr::ScalarSubqueryPlan(_) | PhysExpr::DynamicPruning { .. } => true,
            PhysExpr::Binary { left, right, .. } => left.has_unplanned() || right.has_unplanned(),
            PhysExpr::Not(e) | PhysExpr::Alias { expr: e, .. } => e.has_unplanned(),
            PhysExpr::InSubquery { value, subquery } => {
                value.has_unplanned() || subquery.has_unplanned()
            }
            _ => false,
        }
    }

    pub fn has_subquery(&self) -> bool {
        match self {
            PhysExpr::Column { .. } | PhysExpr::Literal(_) => false,
            PhysExpr::Binary { left, right, .. } => left.has_subquery() || right.has_subquery(),
            PhysExpr::Not(e) | PhysExpr::Alias { expr: e, .. } => e.has_subquery(),
            _ => true,
        }
    }

    /// Planned subqueries in this expression, in traversal order.
    pub fn subqueries(&self) -> Vec<&SubqueryExec> {
        let mut out = Vec::new();
        self.collect_subqueries(&mut out);
        out
    }

    fn collect_subqueries<'a>(&'a self, out: &mut Vec<&'a SubqueryExec>) {
        match self {
            PhysExpr::Subquery(s) => out.push(s),
            PhysExpr::Binary { left, right, .. } => {
                left.collect_subqueries(out);
                right.collect_subqueries(out);
            }
            PhysExpr::Not(e) | PhysExpr::Alias { expr: e, .. } => e.collect_subqueries(out),
            PhysExpr::InSubquery { value, subquery } => {
                value.collect_subqueries(out);
                subquery.collect_subqueries(out);
            }
            PhysExpr::DynamicPruning { key, .. } => key.collect_subqueries(out),
            _ => {}
        }
    }

    fn unplanned_logical(&self) -> Vec<&LogicalPlan> {
        match self {
            PhysExpr::ScalarSubqueryPlan(p) => vec![p.as_ref()],
            PhysExpr::DynamicPruning { build, .. } => vec![build.as_ref()],
            PhysExpr::Binary { left, right, .. } => {
                let mut v = left.unplanned_logical();
                v.extend(right.unplanned_logical());
                v
            }
            PhysExpr::Not(e) | PhysExpr::Alias { expr: e, .. } => e.unplanned_logical(),
            PhysExpr::InSubquery { value, subquery } => {
                let mut v = value.unplanned_logical();
                v.extend(subquery.unplanned_logical());
                v
            }
            _ => vec![],
        }
    }

    /// Fallible bottom-up rewrite. Planned subquery plans are not entered.
    pub fn try_transform_up<F>(self, f: &mut F) -> Result<PhysExpr>
    where
        F: FnMut(PhysExpr) -> Result<PhysExpr>,
    {
        let rebuilt = match self {
            PhysExpr::Binary { left, op, right } => PhysExpr::Binary {
                left: Box::new(left.try_transform_up(f)?),
                op,
                right: Box::new(right.try_transform_up(f)?),
            },
            PhysExpr::Not(e) => PhysExpr::Not(Box::new(e.try_transform_up(f)?)),
            PhysExpr::Alias { expr, name } => PhysExpr::Alias {
                expr: Box::new(expr.try_transform_up(f)?),
                name,
            },
            PhysExpr::DynamicPruning {
                key,
                build,
                build_key,
            } => PhysExpr::DynamicPruning {
                key: Box::new(key.try_transform_up(f)?),
                build,
                build_key,
            },
            PhysExpr::InSubquery { value, subquery } => PhysExpr::InSubquery {
                value: Box::new(value.try_transform_up(f)?),
                subquery: Box::new(subquery.try_transform_up(f)?),
            },
            leaf => leaf,
        };
        f(rebuilt)
    }

    fn canonicalized(&self) -> Result<PhysExpr> {
        Ok(match self {
            PhysExpr::Subquery(s) => PhysExpr::Subquery(SubqueryExec {
                id: SubqueryId::new(0),
                name: String::new(),
                plan: Box::new(s.plan.canonicalized()?),
            }),
            PhysExpr::ReusedSubquery { .. } => PhysExpr::ReusedSubquery {
                id: SubqueryId::new(0),
                name: String::new(),
            },
            PhysExpr::Binary { left, op, right } => PhysExpr::Binary {
                left: Box::new(left.canonicalized()?),
                op: *op,
                right: Box::new(right.canonicalized()?),
            },
            PhysExpr::Not(e) => PhysExpr::Not(Box::new(e.canonicalized()?)),
            PhysExpr::Alias { expr, name } => PhysExpr::Alias {
                expr: Box::new(expr.canonicalized()?),
                name: name.clone(),
            },
            PhysExpr::InSubquery { value, subquery } => PhysExpr::InSubquery {
                value: Box::new(value.canonicalized()?),
                subquery: Box::new(subquery.canonicalized()?),
            },
            other => other.clone(),
        })
    }
}

impl fmt::Display for PhysExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhysExpr::Column { name } => write!(f, "{name}"),
            PhysExpr::Literal(Scalar::Str(s)) => write!(f, "'{s}'"),
            PhysExpr::Literal(v) => write!(f, "{v}"),
            PhysExpr::Binary { left, op, right } => write!(f, "({left} {} {right})", op.symbol()),
            PhysExpr::Not(e) => write!(f, "NOT {e}"),
            PhysExpr::Alias { expr, name } => write!(f, "{expr} AS {name}"),
            PhysExpr::ScalarSubqueryPlan(_) => write!(f, "scalar-subquery"),
            PhysExpr::DynamicPruning { key, build_key, .. } => {
                write!(f, "dynamicpruning({key} IN {build_key})")
            }
            PhysExpr::Subquery(s) => write!(f, "Subquery {}, [id={}]", s.name, s.id),
            PhysExpr::InSubquery { value, subquery } => write!(f, "{value} IN ({subquery})"),
            PhysExpr::ReusedSubquery { id, name } => {
                write!(f, "ReusedSubquery {name}, [id={id}]")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PhysicalPlan {
    /// Table scan. `partition_filters` are evaluated per partition against
    /// the partition column value before any row is read.
    Scan {
        table: String,
        schema: Schema,
        columnar: bool,
        partition_column: Option<String>,
        partition_filters: Vec<PhysExpr>,
    },
    InMemoryScan {
        cache_key: String,
        schema: Schema,
    },
    Filter {
        input: Box<PhysicalPlan>,
        predicate: PhysExpr,
    },
    Project {
        input: Box<PhysicalPlan>,
        exprs: Vec<PhysExpr>,
        schema: Schema,
    },
    HashAggregate {
        input: Box<PhysicalPlan>,
        group_by: Vec<String>,
        aggs: Vec<AggregateExpr>,
        schema: Schema,
    },
    SortMergeJoin {
        left: Box<PhysicalPlan>,
        right: Box<PhysicalPlan>,
        on: Vec<(String, String)>,
        join_type: JoinType,
        schema: Schema,
    },
    /// `global` sorts need all rows in one partition.
    Sort {
        input: Box<PhysicalPlan>,
        order_by: Vec<String>,
        global: bool,
    },
    Limit {
        input: Box<PhysicalPlan>,
        n: usize,
    },
    Exchange {
        partitioning: Partitioning,
        reuse_id: Option<ExchangeId>,
        input: Box<PhysicalPlan>,
    },
    /// Reads the output of the `Exchange` stamped with `id`.
    ReusedExchange {
        id: ExchangeId,
        schema: Schema,
        partitioning: Partitioning,
    },
    ColumnarToRow {
        input: Box<PhysicalPlan>,
    },
    RowToColumnar {
        input: Box<PhysicalPlan>,
    },
    /// Chain of fusable operators executed in one pass per row. The chain
    /// runs from `input` down to the first non-fusable node.
    FusedStage {
        stage_id: StageId,
        input: Box<PhysicalPlan>,
    },
    /// Opaque wrapper re-planned at execution time.
    AdaptivePlan {
        input_plan: Box<PhysicalPlan>,
        is_final: bool,
    },
}

impl PhysicalPlan {
    pub fn children(&self) -> Vec<&PhysicalPlan> {
        match self {
            PhysicalPlan::Scan { .. }
            | PhysicalPlan::InMemoryScan { .. }
            | PhysicalPlan::ReusedExchange { .. }
            | PhysicalPlan::AdaptivePlan { .. } => vec![],
            PhysicalPlan::Filter { input, .. }
            | PhysicalPlan::Project { input, .. }
            | PhysicalPlan::HashAggregate { input, .. }
            | PhysicalPlan::Sort { input, .. }
            | PhysicalPlan::Limit { input, .. }
            | PhysicalPlan::Exchange { input, .. }
            | PhysicalPlan::ColumnarToRow { input }
            | PhysicalPlan::RowToColumnar { input }
            | PhysicalPlan::FusedStage { input, .. } => vec![input],
            PhysicalPlan::SortMergeJoin { left, right, .. } => vec![left, right],
        }
    }

    /// Rebuild with each child passed through `f` (left to right).
    pub fn map_children<E, F>(self, mut f: F) -> std::result::Result<PhysicalPlan, E>
    where
        F: FnMut(PhysicalPlan) -> std::result::Result<PhysicalPlan, E>,
    {
        Ok(match self {
            leaf @ (PhysicalPlan::Scan { .. }
            | PhysicalPlan::InMemoryScan { .. }
            | PhysicalPlan::ReusedExchange { .. }
            | PhysicalPlan::AdaptivePlan { .. }) => leaf,
            PhysicalPlan::Filter { input, predicate } => PhysicalPlan::Filter {
                input: Box::new(f(*input)?),
                predicate,
            },
            PhysicalPlan::Project {
                input,
                exprs,
                schema,
            } => PhysicalPlan::Project {
                input: Box::new(f(*input)?),
                exprs,
                schema,
            },
            PhysicalPlan::HashAggregate {
                input,
                group_by,
                aggs,
                schema,
            } => PhysicalPlan::HashAggregate {
                input: Box::new(f(*input)?),
                group_by,
                aggs,
                schema,
            },
            PhysicalPlan::SortMergeJoin {
                left,
                right,
                on,
                join_type,
                schema,
            } => {
                let left = Box::new(f(*left)?);
                let right = Box::new(f(*right)?);
                PhysicalPlan::SortMergeJoin {
                    left,
                    right,
                    on,
                    join_type,
                    schema,
                }
            }
            PhysicalPlan::Sort {
                input,
                order_by,
                global,
            } => PhysicalPlan::Sort {
                input: Box::new(f(*input)?),
                order_by,
                global,
            },
            PhysicalPlan::Limit { input, n } => PhysicalPlan::Limit {
                input: Box::new(f(*input)?),
                n,
            },
            PhysicalPlan::Exchange {
                partitioning,
                reuse_id,
                input,
            } => PhysicalPlan::Exchange {
                partitioning,
                reuse_id,
                input: Box::new(f(*input)?),
            },
            PhysicalPlan::ColumnarToRow { input } => PhysicalPlan::ColumnarToRow {
                input: Box::new(f(*input)?),
            },
            PhysicalPlan::RowToColumnar { input } => PhysicalPlan::RowToColumnar {
                input: Box::new(f(*input)?),
            },
            PhysicalPlan::FusedStage { stage_id, input } => PhysicalPlan::FusedStage {
                stage_id,
                input: Box::new(f(*input)?),
            },
        })
    }

    /// Bottom-up rewrite over the visible tree.
    pub fn transform_up<F>(self, f: &mut F) -> Result<PhysicalPlan>
    where
        F: FnMut(PhysicalPlan) -> Result<PhysicalPlan>,
    {
        let rebuilt = self.map_children(|c| c.transform_up(f))?;
        f(rebuilt)
    }

    /// Top-down rewrite; children of the node returned by `f` are visited.
    pub fn transform_down<F>(self, f: &mut F) -> Result<PhysicalPlan>
    where
        F: FnMut(PhysicalPlan) -> Result<PhysicalPlan>,
    {
        f(self)?.map_children(|c| c.transform_down(f))
    }

    /// This node's own expressions.
    pub fn expressions(&self) -> Vec<&PhysExpr> {
        match self {
            PhysicalPlan::Scan {
                partition_filters, ..
            } => partition_filters.iter().collect(),
            PhysicalPlan::Filter { predicate, .. } => vec![predicate],
            PhysicalPlan::Project { exprs, .. } => exprs.iter().collect(),
            _ => vec![],
        }
    }

    /// Rewrite this node's own expressions (children untouched).
    pub fn map_expressions<F>(self, mut f: F) -> Result<PhysicalPlan>
    where
        F: FnMut(PhysExpr) -> Result<PhysExpr>,
    {
        Ok(match self {
            PhysicalPlan::Scan {
                table,
                schema,
                columnar,
                partition_column,
                partition_filters,
            } => PhysicalPlan::Scan {
                table,
                schema,
                columnar,
                partition_column,
                partition_filters: partition_filters
                    .into_iter()
                    .map(&mut f)
                    .collect::<Result<_>>()?,
            },
            PhysicalPlan::Filter { input, predicate } => PhysicalPlan::Filter {
                input,
                predicate: f(predicate)?,
            },
            PhysicalPlan::Project {
                input,
                exprs,
                schema,
            } => PhysicalPlan::Project {
                input,
                exprs: exprs.into_iter().map(&mut f).collect::<Result<_>>()?,
                schema,
            },
            other => other,
        })
    }

    pub fn schema(&self) -> Schema {
        match self {
            PhysicalPlan::Scan { schema, .. }
            | PhysicalPlan::InMemoryScan { schema, .. }
            | PhysicalPlan::Project { schema, .. }
            | PhysicalPlan::HashAggregate { schema, .. }
            | PhysicalPlan::SortMergeJoin { schema, .. }
            | PhysicalPlan::ReusedExchange { schema, .. } => schema.clone(),
            PhysicalPlan::Filter { input, .. }
            | PhysicalPlan::Sort { input, .. }
            | PhysicalPlan::Limit { input, .. }
            | PhysicalPlan::Exchange { input, .. }
            | PhysicalPlan::ColumnarToRow { input }
            | PhysicalPlan::RowToColumnar { input }
            | PhysicalPlan::FusedStage { input, .. } => input.schema(),
            PhysicalPlan::AdaptivePlan { input_plan, .. } => input_plan.schema(),
        }
    }

    pub fn output_partitioning(&self) -> Partitioning {
        match self {
            PhysicalPlan::Scan { .. }
            | PhysicalPlan::InMemoryScan { .. }
            | PhysicalPlan::AdaptivePlan { .. } => Partitioning::Unknown,
            PhysicalPlan::Filter { input, .. }
            | PhysicalPlan::Sort { input, .. }
            | PhysicalPlan::ColumnarToRow { input }
            | PhysicalPlan::RowToColumnar { input }
            | PhysicalPlan::FusedStage { input, .. } => input.output_partitioning(),
            PhysicalPlan::Project { input, exprs, .. } => match input.output_partitioning() {
                Partitioning::Hash { keys, n } => {
                    let renamed: Option<Vec<String>> = keys
                        .iter()
                        .map(|key| projected_name(exprs, key))
                        .collect();
                    match renamed {
                        Some(keys) => Partitioning::Hash { keys, n },
                        None => Partitioning::Unknown,
                    }
                }
                other => other,
            },
            PhysicalPlan::HashAggregate {
                input, group_by, ..
            } => {
                if group_by.is_empty() {
                    Partitioning::Single
                } else {
                    input.output_partitioning()
                }
            }
            PhysicalPlan::SortMergeJoin { left, .. } => left.output_partitioning(),
            PhysicalPlan::Limit { .. } => Partitioning::Single,
            PhysicalPlan::Exchange { partitioning, .. }
            | PhysicalPlan::ReusedExchange { partitioning, .. } => partitioning.clone(),
        }
    }

    /// Ascending sort columns guaranteed within each output partition.
    pub fn output_ordering(&self) -> Vec<String> {
        match self {
            PhysicalPlan::Sort { order_by, .. } => order_by.clone(),
            PhysicalPlan::Filter { input, .. }
            | PhysicalPlan::Limit { input, .. }
            | PhysicalPlan::ColumnarToRow { input }
            | PhysicalPlan::RowToColumnar { input }
            | PhysicalPlan::FusedStage { input, .. } => input.output_ordering(),
            PhysicalPlan::Project { input, exprs, .. } => {
                let passthrough: Vec<String> = exprs
                    .iter()
                    .filter_map(|e| match e {
                        PhysExpr::Column { name } => Some(name.clone()),
                        _ => None,
                    })
                    .collect();
                input
                    .output_ordering()
                    .into_iter()
                    .take_while(|c| passthrough.contains(c))
                    .collect()
            }
            PhysicalPlan::SortMergeJoin { on, .. } => on.iter().map(|(l, _)| l.clone()).collect(),
            _ => vec![],
        }
    }

    /// One entry per child.
    pub fn required_child_distribution(&self) -> Vec<Distribution> {
        match self {
            PhysicalPlan::HashAggregate { group_by, .. } => {
                if group_by.is_empty() {
                    vec![Distribution::AllTuples]
                } else {
                    vec![Distribution::Clustered(group_by.clone())]
                }
            }
            PhysicalPlan::SortMergeJoin { on, .. } => vec![
                Distribution::Clustered(on.iter().map(|(l, _)| l.clone()).collect()),
                Distribution::Clustered(on.iter().map(|(_, r)| r.clone()).collect()),
            ],
            PhysicalPlan::Sort { global: true, .. } | PhysicalPlan::Limit { .. } => {
                vec![Distribution::AllTuples]
            }
            other => vec![Distribution::Unspecified; other.children().len()],
        }
    }

    /// One entry per child; empty means no requirement.
    pub fn required_child_ordering(&self) -> Vec<Vec<String>> {
        match self {
            PhysicalPlan::SortMergeJoin { on, .. } => vec![
                on.iter().map(|(l, _)| l.clone()).collect(),
                on.iter().map(|(_, r)| r.clone()).collect(),
            ],
            other => vec![vec![]; other.children().len()],
        }
    }

    /// Produces columnar batches rather than rows.
    pub fn supports_columnar(&self) -> bool {
        match self {
            PhysicalPlan::Scan { columnar, .. } => *columnar,
            PhysicalPlan::RowToColumnar { .. } => true,
            _ => false,
        }
    }

    /// Consumes columnar input.
    pub fn consumes_columnar(&self) -> bool {
        matches!(self, PhysicalPlan::ColumnarToRow { .. })
    }

    /// Can be folded into a `FusedStage`.
    pub fn supports_fusion(&self) -> bool {
        match self {
            PhysicalPlan::Filter { .. } | PhysicalPlan::Project { .. } => {
                !self.expressions().iter().any(|e| e.has_unplanned())
            }
            _ => false,
        }
    }

    pub fn is_adaptive(&self) -> bool {
        matches!(self, PhysicalPlan::AdaptivePlan { .. })
    }

    /// Count visible nodes matching `pred` (subquery plans excluded).
    pub fn count_nodes(&self, pred: &dyn Fn(&PhysicalPlan) -> bool) -> usize {
        let own = usize::from(pred(self));
        own + self
            .children()
            .iter()
            .map(|c| c.count_nodes(pred))
            .sum::<usize>()
    }

    /// Visible nodes in pre-order.
    pub fn collect_nodes(&self) -> Vec<&PhysicalPlan> {
        let mut out = vec![self];
        for c in self.children() {
            out.extend(c.collect_nodes());
        }
        out
    }

    /// Planned subqueries referenced anywhere in the visible tree.
    pub fn subqueries(&self) -> Vec<&SubqueryExec> {
        self.collect_nodes()
            .into_iter()
            .flat_map(|n| n.expressions().into_iter().flat_map(|e| e.subqueries()))
            .collect()
    }

    /// Copy with ids and names that do not affect results zeroed out.
    pub fn canonicalized(&self) -> Result<PhysicalPlan> {
        let copy = match self {
            PhysicalPlan::Exchange {
                partitioning,
                input,
                ..
            } => PhysicalPlan::Exchange {
                partitioning: partitioning.clone(),
                reuse_id: None,
                input: input.clone(),
            },
            PhysicalPlan::FusedStage { input, .. } => PhysicalPlan::FusedStage {
                stage_id: StageId::new(0),
                input: input.clone(),
            },
            PhysicalPlan::AdaptivePlan {
                input_plan,
                is_final,
            } => PhysicalPlan::AdaptivePlan {
                input_plan: Box::new(input_plan.canonicalized()?),
                is_final: *is_final,
            },
            other => other.clone(),
        };
        copy.map_expressions(|e| e.canonicalized())?
            .map_children(|c| c.canonicalized())
    }

    /// Structural identity used for reuse: equal canonical trees only.
    pub fn fingerprint(&self) -> Result<Hash256> {
        hash_serde(&self.canonicalized()?)
    }

    pub fn node_name(&self) -> &'static str {
        match self {
            PhysicalPlan::Scan { .. } => "Scan",
            PhysicalPlan::InMemoryScan { .. } => "InMemoryScan",
            PhysicalPlan::Filter { .. } => "Filter",
            PhysicalPlan::Project { .. } => "Project",
            PhysicalPlan::HashAggregate { .. } => "HashAggregate",
            PhysicalPlan::SortMergeJoin { .. } => "SortMergeJoin",
            PhysicalPlan::Sort { .. } => "Sort",
            PhysicalPlan::Limit { .. } => "Limit",
            PhysicalPlan::Exchange { .. } => "Exchange",
            PhysicalPlan::ReusedExchange { .. } => "ReusedExchange",
            PhysicalPlan::ColumnarToRow { .. } => "ColumnarToRow",
            PhysicalPlan::RowToColumnar { .. } => "RowToColumnar",
            PhysicalPlan::FusedStage { .. } => "FusedStage",
            PhysicalPlan::AdaptivePlan { .. } => "AdaptivePlan",
        }
    }

    pub fn simple_string(&self, max_fields: usize) -> String {
        match self {
            PhysicalPlan::Scan {
                table,
                schema,
                columnar,
                partition_filters,
                ..
            } => {
                let mut s = format!(
                    "Scan {}{table}{}",
                    if *columnar { "columnar " } else { "" },
                    truncated_list(schema.names(), max_fields)
                );
                if !partition_filters.is_empty() {
                    s.push_str(&format!(
                        " PartitionFilters: {}",
                        truncated_list(partition_filters.iter().map(|e| e.to_string()), max_fields)
                    ));
                }
                s
            }
            PhysicalPlan::InMemoryScan { cache_key, schema } => format!(
                "InMemoryScan {}, {cache_key}",
                truncated_list(schema.names(), max_fields)
            ),
            PhysicalPlan::Filter { predicate, .. } => format!("Filter {predicate}"),
            PhysicalPlan::Project { exprs, .. } => format!(
                "Project {}",
                truncated_list(exprs.iter().map(|e| e.to_string()), max_fields)
            ),
            PhysicalPlan::HashAggregate { group_by, aggs, .. } => format!(
                "HashAggregate(keys={}, functions={})",
                truncated_list(group_by.iter().cloned(), max_fields),
                truncated_list(aggs.iter().map(|a| a.to_string()), max_fields)
            ),
            PhysicalPlan::SortMergeJoin { on, join_type, .. } => format!(
                "SortMergeJoin {}, {}, {}",
                truncated_list(on.iter().map(|(l, _)| l.clone()), max_fields),
                truncated_list(on.iter().map(|(_, r)| r.clone()), max_fields),
                join_type.as_str()
            ),
            PhysicalPlan::Sort {
                order_by, global, ..
            } => format!(
                "Sort {}, {global}",
                truncated_list(order_by.iter().map(|c| format!("{c} ASC")), max_fields)
            ),
            PhysicalPlan::Limit { n, .. } => format!("Limit {n}"),
            PhysicalPlan::Exchange {
                partitioning,
                reuse_id,
                ..
            } => match reuse_id {
                Some(id) => format!("Exchange {partitioning}, [id={id}]"),
                None => format!("Exchange {partitioning}"),
            },
            PhysicalPlan::ReusedExchange { id, schema, .. } => format!(
                "ReusedExchange {}, [id={id}]",
                truncated_list(schema.names(), max_fields)
            ),
            PhysicalPlan::ColumnarToRow { .. } => "ColumnarToRow".to_string(),
            PhysicalPlan::RowToColumnar { .. } => "RowToColumnar".to_string(),
            PhysicalPlan::FusedStage { stage_id, .. } => format!("FusedStage ({})", stage_id.get()),
            PhysicalPlan::AdaptivePlan { is_final, .. } => {
                format!("AdaptivePlan isFinalPlan={is_final}")
            }
        }
    }

    pub fn tree_string(&self, max_fields: usize) -> String {
        render_tree(self, max_fields)
    }
}

impl TreeNode for PhysicalPlan {
    fn node_string(&self, max_fields: usize) -> String {
        self.simple_string(max_fields)
    }

    fn tree_children(&self) -> Vec<TreeChild<'_>> {
        match self {
            // Rendered even though rules see a leaf.
            PhysicalPlan::AdaptivePlan { input_plan, .. } => {
                vec![Box::new(input_plan.as_ref()) as TreeChild<'_>]
            }
            other => other
                .children()
                .into_iter()
                .map(|c| Box::new(c) as TreeChild<'_>)
                .collect(),
        }
    }

    fn inner_children(&self) -> Vec<TreeChild<'_>> {
        let mut out: Vec<TreeChild<'_>> = Vec::new();
        for e in self.expressions() {
            for s in e.subqueries() {
                out.push(Box::new(s.plan.as_ref()));
            }
            for p in e.unplanned_logical() {
                out.push(Box::new(p));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{DataType, Field};

    fn scan() -> PhysicalPlan {
        PhysicalPlan::Scan {
            table: "t".into(),
            schema: Schema::new(vec![
                Field::new("k", DataType::Int64, false),
                Field::new("v", DataType::Int64, false),
            ]),
            columnar: false,
            partition_column: None,
            partition_filters: vec![],
        }
    }

    fn agg(input: PhysicalPlan) -> PhysicalPlan {
        let schema = input.schema();
        PhysicalPlan::HashAggregate {
            input: Box::new(input),
            group_by: vec!["k".into()],
            aggs: vec![],
            schema,
        }
    }

    #[test]
    fn hash_partitioning_satisfies_matching_cluster() {
        let p = Partitioning::Hash {
            keys: vec!["k".into()],
            n: 4,
        };
        assert!(p.satisfies(&Distribution::Clustered(vec!["k".into()])));
        assert!(!p.satisfies(&Distribution::Clustered(vec!["v".into()])));
        assert!(!p.satisfies(&Distribution::AllTuples));
        assert!(Partitioning::Single.satisfies(&Distribution::AllTuples));
        assert!(!Partitioning::Unknown.satisfies(&Distribution::Clustered(vec!["k".into()])));
    }

    #[test]
    fn adaptive_wrapper_is_a_leaf() {
        let wrapped = PhysicalPlan::AdaptivePlan {
            input_plan: Box::new(agg(scan())),
            is_final: false,
        };
        assert!(wrapped.children().is_empty());
        assert!(wrapped.expressions().is_empty());
        assert_eq!(wrapped.count_nodes(&|_| true), 1);
        assert!(wrapped.tree_string(25).contains("HashAggregate"));
    }

    #[test]
    fn projection_renames_or_drops_hash_keys() {
        let clustered = PhysicalPlan::Exchange {
            partitioning: Partitioning::Hash {
                keys: vec!["k".into()],
                n: 4,
            },
            reuse_id: None,
            input: Box::new(scan()),
        };
        let project = |exprs: Vec<PhysExpr>| {
            let schema = Schema::new(vec![Field::new("x", DataType::Int64, false)]);
            PhysicalPlan::Project {
                input: Box::new(clustered.clone()),
                exprs,
                schema,
            }
        };

        let renamed = project(vec![PhysExpr::Alias {
            expr: Box::new(PhysExpr::col("k")),
            name: "j".into(),
        }]);
        assert_eq!(
            renamed.output_partitioning(),
            Partitioning::Hash {
                keys: vec!["j".into()],
                n: 4
            }
        );
        assert_eq!(
            project(vec![PhysExpr::col("k"), PhysExpr::col("v")]).output_partitioning(),
            clustered.output_partitioning()
        );
        assert_eq!(
            project(vec![PhysExpr::col("v")]).output_partitioning(),
            Partitioning::Unknown
        );
    }

    #[test]
    fn fingerprint_ignores_ids() {
        let ex = |id| PhysicalPlan::Exchange {
            partitioning: Partitioning::Hash {
                keys: vec!["k".into()],
                n: 2,
            },
            reuse_id: id,
            input: Box::new(scan()),
        };
        let a = ex(None).fingerprint().expect("fp");
        let b = ex(Some(ExchangeId::new(3))).fingerprint().expect("fp");
        assert_eq!(a, b);
        assert_ne!(a, scan().fingerprint().expect("fp"));
    }

    #[test]
    fn join_requirements_per_side() {
        let schema = scan().schema();
        let j = PhysicalPlan::SortMergeJoin {
            left: Box::new(scan()),
            right: Box::new(scan()),
            on: vec![("k".into(), "k".into())],
            join_type: JoinType::Inner,
            schema,
        };
        assert_eq!(j.required_child_distribution().len(), 2);
        assert_eq!(j.required_child_ordering()[1], vec!["k".to_string()]);
        assert_eq!(j.output_ordering(), vec!["k".to_string()]);
    }

    #[test]
    fn render_exchange() {
        let p = PhysicalPlan::Exchange {
            partitioning: Partitioning::Hash {
                keys: vec!["k".into()],
                n: 4,
            },
            reuse_id: Some(ExchangeId::new(1)),
            input: Box::new(scan()),
        };
        assert_eq!(
            p.tree_string(25),
            "Exchange hashpartitioning(k, 4), [id=exchange#1]\n+- Scan t[k, v]\n"
        );
    }
}
