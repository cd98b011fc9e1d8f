//! Rule-based logical optimizer.
//!
//! Rules are grouped in batches. A batch runs its rules in order, repeating
//! until an iteration changes nothing (or `max_iterations` is hit). Each
//! rule application is recorded in the tracker with whether it changed the
//! plan.

use std::time::Instant;

use qstage_core::config::PipelineConfig;
use qstage_core::error::Result;
use qstage_core::expr::{BinaryOp, Expr};
use qstage_core::logical::{JoinType, LogicalPlan};
use qstage_core::tracker::PlanTracker;
use qstage_core::types::Scalar;

use crate::traits::Optimizer;

pub trait OptimizerRule: Send + Sync {
    fn name(&self) -> &'static str;
    fn apply(&self, plan: LogicalPlan, config: &PipelineConfig) -> Result<LogicalPlan>;
}

pub struct Batch {
    pub name: &'static str,
    pub max_iterations: usize,
    pub rules: Vec<Box<dyn OptimizerRule>>,
}

pub struct RuleOptimizer {
    batches: Vec<Batch>,
}

impl Default for RuleOptimizer {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleOptimizer {
    pub fn new() -> Self {
        Self {
            batches: vec![
                Batch {
                    name: "Operator Optimization",
                    max_iterations: 100,
                    rules: vec![
                        Box::new(CombineFilters),
                        Box::new(PushDownPredicate),
                        Box::new(ConstantFolding),
                    ],
                },
                Batch {
                    name: "Dynamic Partition Pruning",
                    max_iterations: 1,
                    rules: vec![Box::new(PartitionPruning)],
                },
                Batch {
                    name: "Cleanup",
                    max_iterations: 100,
                    rules: vec![Box::new(PruneFilters)],
                },
            ],
        }
    }

    pub fn with_batches(batches: Vec<Batch>) -> Self {
        Self { batches }
    }
}

impl Optimizer for RuleOptimizer {
    fn optimize(
        &self,
        mut plan: LogicalPlan,
        tracker: &PlanTracker,
        config: &PipelineConfig,
    ) -> Result<LogicalPlan> {
        for batch in &self.batches {
            let mut iteration = 0;
            loop {
                iteration += 1;
                let mut changed_any = false;
                for rule in &batch.rules {
                    let before = plan.clone();
                    let start = Instant::now();
                    plan = rule.apply(plan, config)?;
                    let changed = plan != before;
                    tracker.record_rule(rule.name(), start.elapsed(), changed);
                    if changed {
                        tracing::trace!(batch = batch.name, rule = rule.name(), "rule changed plan");
                    }
                    changed_any |= changed;
                }
                if !changed_any || iteration >= batch.max_iterations {
                    if changed_any && batch.max_iterations > 1 {
                        tracing::warn!(
                            batch = batch.name,
                            iterations = iteration,
                            "max iterations reached before fixed point"
                        );
                    }
                    break;
                }
            }
        }
        Ok(plan)
    }
}

/// `Filter(Filter(x, inner), outer)` becomes `Filter(x, inner AND outer)`.
pub struct CombineFilters;

impl OptimizerRule for CombineFilters {
    fn name(&self) -> &'static str {
        "CombineFilters"
    }

    fn apply(&self, plan: LogicalPlan, _: &PipelineConfig) -> Result<LogicalPlan> {
        plan.transform_up(&mut |p| {
            Ok(match p {
                LogicalPlan::Filter { input, predicate } => match *input {
                    LogicalPlan::Filter {
                        input: inner,
                        predicate: inner_pred,
                    } => LogicalPlan::Filter {
                        input: inner,
                        predicate: inner_pred.and(predicate),
                    },
                    other => LogicalPlan::Filter {
                        input: Box::new(other),
                        predicate,
                    },
                },
                other => other,
            })
        })
    }
}

/// Moves filters towards the leaves: below projections of plain columns,
/// below sorts, below aggregates when only grouping columns are used, and
/// into the side of a join that produces every referenced column.
pub struct PushDownPredicate;

impl OptimizerRule for PushDownPredicate {
    fn name(&self) -> &'static str {
        "PushDownPredicate"
    }

    fn apply(&self, plan: LogicalPlan, _: &PipelineConfig) -> Result<LogicalPlan> {
        plan.transform_down(&mut |p| {
            let LogicalPlan::Filter { input, predicate } = p else {
                return Ok(p);
            };
            Ok(match *input {
                LogicalPlan::Project {
                    input: proj_input,
                    exprs,
                } if passes_through(&predicate, &exprs) => LogicalPlan::Project {
                    input: Box::new(LogicalPlan::Filter {
                        input: proj_input,
                        predicate,
                    }),
                    exprs,
                },
                LogicalPlan::Sort {
                    input: sort_input,
                    order_by,
                } => LogicalPlan::Sort {
                    input: Box::new(LogicalPlan::Filter {
                        input: sort_input,
                        predicate,
                    }),
                    order_by,
                },
                LogicalPlan::Aggregate {
                    input: agg_input,
                    group_by,
                    aggs,
                } if !predicate.contains_subquery()
                    && predicate
                        .referenced_columns()
                        .iter()
                        .all(|c| group_by.contains(c)) =>
                {
                    LogicalPlan::Aggregate {
                        input: Box::new(LogicalPlan::Filter {
                            input: agg_input,
                            predicate,
                        }),
                        group_by,
                        aggs,
                    }
                }
                LogicalPlan::Join {
                    left,
                    right,
                    on,
                    join_type,
                } => push_into_join(*left, *right, on, join_type, predicate),
                other => LogicalPlan::Filter {
                    input: Box::new(other),
                    predicate,
                },
            })
        })
    }
}

fn passes_through(predicate: &Expr, exprs: &[Expr]) -> bool {
    predicate.referenced_columns().iter().all(|c| {
        exprs
            .iter()
            .any(|e| matches!(e, Expr::Column { name, .. } if name == c))
    })
}

fn push_into_join(
    left: LogicalPlan,
    right: LogicalPlan,
    on: Vec<(String, String)>,
    join_type: JoinType,
    predicate: Expr,
) -> LogicalPlan {
    let rebuild = |left: LogicalPlan,
                   right: LogicalPlan,
                   on: Vec<(String, String)>,
                   predicate: Expr| LogicalPlan::Filter {
        input: Box::new(LogicalPlan::Join {
            left: Box::new(left),
            right: Box::new(right),
            on,
            join_type,
        }),
        predicate,
    };
    let (Ok(ls), Ok(rs)) = (left.schema(), right.schema()) else {
        return rebuild(left, right, on, predicate);
    };
    let left_names = ls.names();
    // Right columns keep their name in the join output only without a clash.
    let right_names: Vec<String> = rs
        .names()
        .into_iter()
        .filter(|n| !left_names.contains(n))
        .collect();

    let (mut to_left, mut to_right, mut keep) = (vec![], vec![], vec![]);
    for c in predicate.conjuncts() {
        let cols = c.referenced_columns();
        if cols.is_empty() || c.contains_subquery() {
            keep.push(c);
        } else if cols.iter().all(|n| left_names.contains(n)) {
            to_left.push(c);
        } else if join_type == JoinType::Inner && cols.iter().all(|n| right_names.contains(n)) {
            to_right.push(c);
        } else {
            keep.push(c);
        }
    }

    let left = match Expr::and_all(to_left) {
        Some(p) => left.filter(p),
        None => left,
    };
    let right = match Expr::and_all(to_right) {
        Some(p) => right.filter(p),
        None => right,
    };
    let join = LogicalPlan::Join {
        left: Box::new(left),
        right: Box::new(right),
        on,
        join_type,
    };
    match Expr::and_all(keep) {
        Some(p) => join.filter(p),
        None => join,
    }
}

/// Evaluates binary operators whose inputs are both literals, and drops
/// `true AND x` to `x`.
pub struct ConstantFolding;

impl OptimizerRule for ConstantFolding {
    fn name(&self) -> &'static str {
        "ConstantFolding"
    }

    fn apply(&self, plan: LogicalPlan, _: &PipelineConfig) -> Result<LogicalPlan> {
        plan.transform_up(&mut |p| {
            Ok(match p {
                LogicalPlan::Filter { input, predicate } => LogicalPlan::Filter {
                    input,
                    predicate: fold(predicate),
                },
                LogicalPlan::Project { input, exprs } => LogicalPlan::Project {
                    input,
                    exprs: exprs
                        .into_iter()
                        .map(|e| match e {
                            // Keep the output name stable.
                            Expr::Alias { expr, name } => Expr::Alias {
                                expr: Box::new(fold(*expr)),
                                name,
                            },
                            other => other,
                        })
                        .collect(),
                },
                other => other,
            })
        })
    }
}

fn fold(expr: Expr) -> Expr {
    expr.transform_up(&mut |e| match e {
        Expr::Binary { left, op, right } => match (*left, *right) {
            (Expr::Literal(l), Expr::Literal(r)) => match op.apply(&l, &r) {
                Ok(v) => Expr::Literal(v),
                // Leave errors for the runtime to report with context.
                Err(_) => Expr::binary(Expr::Literal(l), op, Expr::Literal(r)),
            },
            (Expr::Literal(Scalar::Bool(true)), other) | (other, Expr::Literal(Scalar::Bool(true)))
                if op == BinaryOp::And =>
            {
                other
            }
            (l, r) => Expr::binary(l, op, r),
        },
        Expr::Not(inner) => match *inner {
            Expr::Literal(Scalar::Bool(b)) => Expr::Literal(Scalar::Bool(!b)),
            other => Expr::Not(Box::new(other)),
        },
        other => other,
    })
}

/// On an inner join where one side scans a partitioned relation on its
/// partition column and the other side is filtered, adds a runtime filter
/// above the partitioned relation whose values come from the other side.
pub struct PartitionPruning;

impl OptimizerRule for PartitionPruning {
    fn name(&self) -> &'static str {
        "PartitionPruning"
    }

    fn apply(&self, plan: LogicalPlan, config: &PipelineConfig) -> Result<LogicalPlan> {
        if !config.dynamic_pruning_enabled {
            return Ok(plan);
        }
        plan.transform_up(&mut |p| {
            let LogicalPlan::Join {
                left,
                right,
                on,
                join_type: JoinType::Inner,
            } = p
            else {
                return Ok(p);
            };
            let (mut left, mut right) = (*left, *right);
            let (left_filtered, right_filtered) = (has_filter(&left), has_filter(&right));
            for (lk, rk) in &on {
                if right_filtered && !has_pruning(&left) {
                    left = insert_pruning(left, lk, &right, rk);
                }
                if left_filtered && !has_pruning(&right) {
                    right = insert_pruning(right, rk, &left, lk);
                }
            }
            Ok(LogicalPlan::Join {
                left: Box::new(left),
                right: Box::new(right),
                on,
                join_type: JoinType::Inner,
            })
        })
    }
}

fn has_filter(plan: &LogicalPlan) -> bool {
    matches!(plan, LogicalPlan::Filter { .. }) || plan.children().into_iter().any(has_filter)
}

fn has_pruning(plan: &LogicalPlan) -> bool {
    plan.expressions()
        .into_iter()
        .any(|e| e.clone().conjuncts().iter().any(|c| matches!(c, Expr::DynamicPruning { .. })))
        || plan.children().into_iter().any(has_pruning)
}

// Walks down through operators that keep `key` intact to a relation
// partitioned on `key`; anything else leaves the side unchanged.
fn insert_pruning(side: LogicalPlan, key: &str, build: &LogicalPlan, build_key: &str) -> LogicalPlan {
    match side {
        LogicalPlan::Relation {
            ref partition_column,
            ref schema,
            ..
        } if partition_column.as_deref() == Some(key) => {
            let Some(field) = schema.field_by_name(key).cloned() else {
                return side;
            };
            side.filter(Expr::DynamicPruning {
                key: Box::new(Expr::Column {
                    name: field.name,
                    data_type: field.data_type,
                    nullable: field.nullable,
                }),
                build: Box::new(build.clone()),
                build_key: build_key.to_string(),
            })
        }
        LogicalPlan::Filter { input, predicate } => LogicalPlan::Filter {
            input: Box::new(insert_pruning(*input, key, build, build_key)),
            predicate,
        },
        LogicalPlan::Project { input, exprs }
            if exprs
                .iter()
                .any(|e| matches!(e, Expr::Column { name, .. } if name == key)) =>
        {
            LogicalPlan::Project {
                input: Box::new(insert_pruning(*input, key, build, build_key)),
                exprs,
            }
        }
        other => other,
    }
}

/// Removes `Filter(true)`.
pub struct PruneFilters;

impl OptimizerRule for PruneFilters {
    fn name(&self) -> &'static str {
        "PruneFilters"
    }

    fn apply(&self, plan: LogicalPlan, _: &PipelineConfig) -> Result<LogicalPlan> {
        plan.transform_up(&mut |p| {
            Ok(match p {
                LogicalPlan::Filter {
                    input,
                    predicate: Expr::Literal(Scalar::Bool(true)),
                } => *input,
                other => other,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qstage_core::schema::{DataType, Field, Schema};

    fn rel(name: &str, cols: &[&str], partition: Option<&str>) -> LogicalPlan {
        LogicalPlan::Relation {
            table: name.into(),
            schema: Schema::new(
                cols.iter()
                    .map(|c| Field::new(*c, DataType::Int32, false))
                    .collect(),
            ),
            partition_column: partition.map(String::from),
            streaming: false,
        }
    }

    fn col(name: &str) -> Expr {
        Expr::Column {
            name: name.into(),
            data_type: DataType::Int32,
            nullable: false,
        }
    }

    fn int(v: i32) -> Expr {
        Expr::lit(Scalar::I32(v))
    }

    fn optimize(plan: LogicalPlan) -> LogicalPlan {
        RuleOptimizer::new()
            .optimize(plan, &PlanTracker::new(), &PipelineConfig::default())
            .expect("optimize")
    }

    #[test]
    fn filter_pushed_below_projection() {
        let plan = rel("t", &["a", "b"], None)
            .project(vec![col("a")])
            .filter(col("a").gt(int(1)));
        let expected = rel("t", &["a", "b"], None)
            .filter(col("a").gt(int(1)))
            .project(vec![col("a")]);
        assert_eq!(optimize(plan), expected);
    }

    #[test]
    fn filters_combine_and_fold() {
        let plan = rel("t", &["a"], None)
            .filter(col("a").gt(int(1)))
            .filter(int(1).eq(int(1)));
        let out = optimize(plan);
        assert_eq!(out, rel("t", &["a"], None).filter(col("a").gt(int(1))));
    }

    #[test]
    fn join_conjuncts_split_by_side() {
        let plan = rel("l", &["k", "x"], None)
            .join(rel("r", &["k2", "y"], None), vec![("k".into(), "k2".into())], JoinType::Inner)
            .filter(col("x").gt(int(1)).and(col("y").gt(int(2))));
        match optimize(plan) {
            LogicalPlan::Join { left, right, .. } => {
                assert!(matches!(*left, LogicalPlan::Filter { .. }));
                assert!(matches!(*right, LogicalPlan::Filter { .. }));
            }
            other => panic!("expected join at root, got {other:?}"),
        }
    }

    #[test]
    fn pruning_inserted_on_partitioned_side() {
        let fact = rel("fact", &["p", "v"], Some("p"));
        let dim = rel("dim", &["p2", "w"], None).filter(col("w").gt(int(5)));
        let plan = fact.join(dim, vec![("p".into(), "p2".into())], JoinType::Inner);
        let out = optimize(plan.clone());
        match &out {
            LogicalPlan::Join { left, .. } => match left.as_ref() {
                LogicalPlan::Filter { predicate, .. } => {
                    assert!(matches!(predicate, Expr::DynamicPruning { build_key, .. } if build_key == "p2"))
                }
                other => panic!("expected pruning filter, got {other:?}"),
            },
            other => panic!("expected join, got {other:?}"),
        }

        let cfg = PipelineConfig {
            dynamic_pruning_enabled: false,
            ..Default::default()
        };
        let unchanged = RuleOptimizer::new()
            .optimize(plan.clone(), &PlanTracker::new(), &cfg)
            .expect("optimize");
        assert_eq!(unchanged, plan);
    }

    #[test]
    fn pruning_is_not_stacked_on_a_second_pass() {
        let fact = rel("fact", &["p", "v"], Some("p"));
        let dim = rel("dim", &["p2", "w"], None).filter(col("w").gt(int(5)));
        let plan = fact.join(dim, vec![("p".into(), "p2".into())], JoinType::Inner);
        let config = PipelineConfig::default();
        let once = PartitionPruning.apply(plan, &config).expect("prune");
        assert!(has_pruning(&once));
        let twice = PartitionPruning.apply(once.clone(), &config).expect("prune");
        assert_eq!(twice, once);
    }

    #[test]
    fn rules_recorded_in_tracker() {
        let tracker = PlanTracker::new();
        RuleOptimizer::new()
            .optimize(
                rel("t", &["a"], None).filter(col("a").gt(int(1))),
                &tracker,
                &PipelineConfig::default(),
            )
            .expect("optimize");
        let rules = tracker.rules();
        assert!(rules["CombineFilters"].invocations >= 1);
        assert_eq!(rules["PartitionPruning"].invocations, 1);
    }
}
