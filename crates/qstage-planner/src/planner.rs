//! Strategy-based physical planner.
//!
//! Each strategy may produce a candidate for a logical node; the candidate
//! sequence for a plan is the strategies' outputs in declaration order,
//! produced lazily. Children are planned with the first candidate found for
//! them. Subqueries stay logical (`ScalarSubqueryPlan`, `DynamicPruning`)
//! and are planned later during preparation.

use std::sync::Arc;

use qstage_core::config::PipelineConfig;
use qstage_core::error::{Error, Result};
use qstage_core::expr::Expr;
use qstage_core::logical::LogicalPlan;
use qstage_core::physical::{PhysExpr, PhysicalPlan};

use crate::traits::{Candidates, QueryPlanner};

pub trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// `None` when this strategy does not handle the node.
    fn apply(&self, plan: &LogicalPlan, ctx: &PlanContext) -> Option<Result<PhysicalPlan>>;
}

/// State shared by one planning call.
#[derive(Clone)]
pub struct PlanContext {
    strategies: Arc<Vec<Box<dyn Strategy>>>,
    config: PipelineConfig,
}

impl PlanContext {
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// First candidate for a child plan.
    pub fn plan_child(&self, plan: &LogicalPlan) -> Result<PhysicalPlan> {
        self.strategies
            .iter()
            .find_map(|s| s.apply(plan, self))
            .unwrap_or_else(|| Err(no_candidate(plan)))
    }
}

pub fn no_candidate(plan: &LogicalPlan) -> Error {
    Error::Planning(format!(
        "no physical plan candidate for {}",
        plan.simple_string(usize::MAX)
    ))
}

pub struct RulePlanner {
    strategies: Arc<Vec<Box<dyn Strategy>>>,
}

impl Default for RulePlanner {
    fn default() -> Self {
        Self::new()
    }
}

impl RulePlanner {
    pub fn new() -> Self {
        Self::with_strategies(vec![
            Box::new(SpecialMarkers),
            Box::new(BasicOperators),
            Box::new(Aggregation),
            Box::new(JoinSelection),
        ])
    }

    pub fn with_strategies(strategies: Vec<Box<dyn Strategy>>) -> Self {
        Self {
            strategies: Arc::new(strategies),
        }
    }
}

impl QueryPlanner for RulePlanner {
    fn plan(&self, plan: &LogicalPlan, config: &PipelineConfig) -> Result<Candidates> {
        let ctx = PlanContext {
            strategies: Arc::clone(&self.strategies),
            config: config.clone(),
        };
        let plan = plan.clone();
        let n = ctx.strategies.len();
        Ok(Box::new(
            (0..n).filter_map(move |i| ctx.strategies[i].apply(&plan, &ctx)),
        ))
    }
}

/// Convert a resolved logical expression.
pub fn to_phys(expr: &Expr) -> Result<PhysExpr> {
    Ok(match expr {
        Expr::UnresolvedColumn(n) => {
            return Err(Error::Planning(format!("cannot plan unresolved column '{n}'")))
        }
        Expr::Column { name, .. } => PhysExpr::col(name.clone()),
        Expr::Literal(v) => PhysExpr::Literal(v.clone()),
        Expr::Binary { left, op, right } => PhysExpr::Binary {
            left: Box::new(to_phys(left)?),
            op: *op,
            right: Box::new(to_phys(right)?),
        },
        Expr::Not(e) => PhysExpr::Not(Box::new(to_phys(e)?)),
        Expr::Alias { expr, name } => PhysExpr::Alias {
            expr: Box::new(to_phys(expr)?),
            name: name.clone(),
        },
        Expr::ScalarSubquery(plan) => PhysExpr::ScalarSubqueryPlan(plan.clone()),
        Expr::DynamicPruning {
            key,
            build,
            build_key,
        } => PhysExpr::DynamicPruning {
            key: Box::new(to_phys(key)?),
            build: build.clone(),
            build_key: build_key.clone(),
        },
    })
}

/// `ReturnAnswer` is only a marker; plan what it wraps.
pub struct SpecialMarkers;

impl Strategy for SpecialMarkers {
    fn name(&self) -> &'static str {
        "SpecialMarkers"
    }

    fn apply(&self, plan: &LogicalPlan, ctx: &PlanContext) -> Option<Result<PhysicalPlan>> {
        match plan {
            LogicalPlan::ReturnAnswer { input } => Some(ctx.plan_child(input)),
            _ => None,
        }
    }
}

pub struct BasicOperators;

impl Strategy for BasicOperators {
    fn name(&self) -> &'static str {
        "BasicOperators"
    }

    fn apply(&self, plan: &LogicalPlan, ctx: &PlanContext) -> Option<Result<PhysicalPlan>> {
        let planned = match plan {
            LogicalPlan::Relation {
                table,
                schema,
                partition_column,
                ..
            } => Ok(PhysicalPlan::Scan {
                table: table.clone(),
                schema: schema.clone(),
                columnar: ctx.config().columnar_scans,
                partition_column: partition_column.clone(),
                partition_filters: vec![],
            }),
            LogicalPlan::InMemoryRelation { cache_key, schema } => Ok(PhysicalPlan::InMemoryScan {
                cache_key: cache_key.clone(),
                schema: schema.clone(),
            }),
            LogicalPlan::Filter { input, predicate } => plan_filter(input, predicate, ctx),
            LogicalPlan::Project { input, exprs } => (|| {
                Ok(PhysicalPlan::Project {
                    input: Box::new(ctx.plan_child(input)?),
                    exprs: exprs.iter().map(to_phys).collect::<Result<_>>()?,
                    schema: plan.schema()?,
                })
            })(),
            LogicalPlan::Sort { input, order_by } => ctx.plan_child(input).map(|child| {
                PhysicalPlan::Sort {
                    input: Box::new(child),
                    order_by: order_by.clone(),
                    global: true,
                }
            }),
            LogicalPlan::Limit { input, n } => ctx.plan_child(input).map(|child| PhysicalPlan::Limit {
                input: Box::new(child),
                n: *n,
            }),
            _ => return None,
        };
        Some(planned)
    }
}

// Pruning filters on a scan's partition column move into the scan.
fn plan_filter(input: &LogicalPlan, predicate: &Expr, ctx: &PlanContext) -> Result<PhysicalPlan> {
    let child = ctx.plan_child(input)?;
    let (child, rest) = match child {
        PhysicalPlan::Scan {
            table,
            schema,
            columnar,
            partition_column: Some(pc),
            mut partition_filters,
        } => {
            let mut rest = Vec::new();
            for c in predicate.clone().conjuncts() {
                match &c {
                    Expr::DynamicPruning { key, .. }
                        if matches!(key.as_ref(), Expr::Column { name, .. } if *name == pc) =>
                    {
                        partition_filters.push(to_phys(&c)?)
                    }
                    _ => rest.push(c),
                }
            }
            (
                PhysicalPlan::Scan {
                    table,
                    schema,
                    columnar,
                    partition_column: Some(pc),
                    partition_filters,
                },
                rest,
            )
        }
        other => (other, vec![predicate.clone()]),
    };
    Ok(match Expr::and_all(rest) {
        Some(p) => PhysicalPlan::Filter {
            input: Box::new(child),
            predicate: to_phys(&p)?,
        },
        None => child,
    })
}

pub struct Aggregation;

impl Strategy for Aggregation {
    fn name(&self) -> &'static str {
        "Aggregation"
    }

    fn apply(&self, plan: &LogicalPlan, ctx: &PlanContext) -> Option<Result<PhysicalPlan>> {
        let LogicalPlan::Aggregate {
            input,
            group_by,
            aggs,
        } = plan
        else {
            return None;
        };
        Some((|| {
            Ok(PhysicalPlan::HashAggregate {
                input: Box::new(ctx.plan_child(input)?),
                group_by: group_by.clone(),
                aggs: aggs.clone(),
                schema: plan.schema()?,
            })
        })())
    }
}

/// Equi-joins become sort-merge joins. Joins without keys are not planned.
pub struct JoinSelection;

impl Strategy for JoinSelection {
    fn name(&self) -> &'static str {
        "JoinSelection"
    }

    fn apply(&self, plan: &LogicalPlan, ctx: &PlanContext) -> Option<Result<PhysicalPlan>> {
        let LogicalPlan::Join {
            left,
            right,
            on,
            join_type,
        } = plan
        else {
            return None;
        };
        if on.is_empty() {
            return None;
        }
        Some((|| {
            Ok(PhysicalPlan::SortMergeJoin {
                left: Box::new(ctx.plan_child(left)?),
                right: Box::new(ctx.plan_child(right)?),
                on: on.clone(),
                join_type: *join_type,
                schema: plan.schema()?,
            })
        })())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qstage_core::schema::{DataType, Field, Schema};
    use qstage_core::types::Scalar;

    fn rel() -> LogicalPlan {
        LogicalPlan::Relation {
            table: "t".into(),
            schema: Schema::new(vec![Field::new("a", DataType::Int32, false)]),
            partition_column: None,
            streaming: false,
        }
    }

    fn a() -> Expr {
        Expr::Column {
            name: "a".into(),
            data_type: DataType::Int32,
            nullable: false,
        }
    }

    #[test]
    fn first_candidate_plans_whole_tree() {
        let plan = LogicalPlan::ReturnAnswer {
            input: Box::new(rel().filter(a().gt(Expr::lit(Scalar::I32(1)))).project(vec![a()])),
        };
        let mut candidates = RulePlanner::new()
            .plan(&plan, &PipelineConfig::default())
            .expect("candidates");
        let first = candidates.next().expect("one candidate").expect("planned");
        assert!(matches!(first, PhysicalPlan::Project { .. }));
        assert_eq!(
            first.tree_string(25),
            "Project [a]\n+- Filter (a > 1)\n   +- Scan columnar t[a]\n"
        );
    }

    #[test]
    fn unresolved_plans_have_no_candidates() {
        let mut candidates = RulePlanner::new()
            .plan(&LogicalPlan::table("t"), &PipelineConfig::default())
            .expect("candidates");
        assert!(candidates.next().is_none());
    }

    #[test]
    fn unplanable_child_is_a_planning_error() {
        let plan = LogicalPlan::table("t").limit(1);
        let mut candidates = RulePlanner::new()
            .plan(&plan, &PipelineConfig::default())
            .expect("candidates");
        assert!(matches!(candidates.next(), Some(Err(Error::Planning(_)))));
    }

    #[test]
    fn pruning_filters_move_into_scan() {
        let scan = LogicalPlan::Relation {
            table: "f".into(),
            schema: Schema::new(vec![Field::new("p", DataType::Int32, false)]),
            partition_column: Some("p".into()),
            streaming: false,
        };
        let p = Expr::Column {
            name: "p".into(),
            data_type: DataType::Int32,
            nullable: false,
        };
        let plan = scan.clone().filter(Expr::DynamicPruning {
            key: Box::new(p),
            build: Box::new(scan),
            build_key: "p".into(),
        });
        let cfg = PipelineConfig {
            columnar_scans: false,
            ..Default::default()
        };
        let out = RulePlanner::new()
            .plan(&plan, &cfg)
            .expect("candidates")
            .next()
            .expect("candidate")
            .expect("planned");
        match out {
            PhysicalPlan::Scan {
                partition_filters,
                columnar,
                ..
            } => {
                assert_eq!(partition_filters.len(), 1);
                assert!(!columnar);
            }
            other => panic!("expected scan, got {other:?}"),
        }
    }
}
