//! Subquery planning: expressions that still hold a logical plan get an
//! independently planned and prepared physical plan.

use qstage_core::error::Result;
use qstage_core::id::SubqueryId;
use qstage_core::logical::LogicalPlan;
use qstage_core::physical::{PhysExpr, PhysicalPlan, SubqueryExec};
use qstage_core::types::Scalar;

use super::{id_from_fingerprint, PrepareContext, PreparationRule};

/// `DynamicPruning(key, build, build_key)` becomes
/// `key IN (SELECT DISTINCT build_key FROM build)`, or `true` when dynamic
/// pruning is disabled.
pub struct PlanDynamicPruningFilters;

impl PreparationRule for PlanDynamicPruningFilters {
    fn name(&self) -> &'static str {
        "PlanDynamicPruningFilters"
    }

    fn apply(&self, plan: PhysicalPlan, ctx: &PrepareContext) -> Result<PhysicalPlan> {
        rewrite_expressions(plan, &mut |expr| match expr {
            PhysExpr::DynamicPruning {
                key,
                build,
                build_key,
            } => {
                if !ctx.config().dynamic_pruning_enabled {
                    return Ok(PhysExpr::Literal(Scalar::Bool(true)));
                }
                let distinct_keys = LogicalPlan::Aggregate {
                    input: build,
                    group_by: vec![build_key],
                    aggs: vec![],
                };
                let subquery = planned_subquery(&distinct_keys, "dynamicpruning", ctx)?;
                Ok(PhysExpr::InSubquery {
                    value: key,
                    subquery: Box::new(PhysExpr::Subquery(subquery)),
                })
            }
            other => Ok(other),
        })
    }
}

/// `ScalarSubqueryPlan` becomes a planned `Subquery`.
pub struct PlanSubqueries;

impl PreparationRule for PlanSubqueries {
    fn name(&self) -> &'static str {
        "PlanSubqueries"
    }

    fn apply(&self, plan: PhysicalPlan, ctx: &PrepareContext) -> Result<PhysicalPlan> {
        rewrite_expressions(plan, &mut |expr| match expr {
            PhysExpr::ScalarSubqueryPlan(logical) => Ok(PhysExpr::Subquery(planned_subquery(
                &logical,
                "scalar-subquery",
                ctx,
            )?)),
            other => Ok(other),
        })
    }
}

/// Bottom-up over every node's own expressions.
fn rewrite_expressions<F>(plan: PhysicalPlan, f: &mut F) -> Result<PhysicalPlan>
where
    F: FnMut(PhysExpr) -> Result<PhysExpr>,
{
    plan.transform_up(&mut |node| node.map_expressions(|e| e.try_transform_up(f)))
}

fn planned_subquery(
    logical: &LogicalPlan,
    kind: &str,
    ctx: &PrepareContext,
) -> Result<SubqueryExec> {
    let plan = ctx.prepare_subquery(logical)?;
    let id = SubqueryId::new(id_from_fingerprint(&plan.fingerprint()?));
    tracing::debug!(%id, kind, "planned subquery");
    Ok(SubqueryExec {
        id,
        name: format!("{kind}#{}", id.get()),
        plan: Box::new(plan),
    })
}

#[cfg(test)]
mod tests {
    use qstage_core::config::PipelineConfig;
    use qstage_core::expr::{AggregateExpr, Aggregation};
    use qstage_core::physical::{PhysExpr, PhysicalPlan};

    use super::*;
    use crate::prepare::test_support::*;

    fn relation() -> LogicalPlan {
        LogicalPlan::Relation {
            table: "t".into(),
            schema: kv_schema(),
            partition_column: None,
            streaming: false,
        }
    }

    fn pruned_scan() -> PhysicalPlan {
        PhysicalPlan::Filter {
            input: Box::new(scan(false)),
            predicate: PhysExpr::DynamicPruning {
                key: Box::new(PhysExpr::col("k")),
                build: Box::new(relation()),
                build_key: "k".into(),
            },
        }
    }

    #[test]
    fn pruning_filter_becomes_in_subquery() {
        let out = PlanDynamicPruningFilters
            .apply(pruned_scan(), &ctx(PipelineConfig::default()))
            .expect("rule");
        let PhysicalPlan::Filter { predicate, .. } = &out else {
            panic!("expected filter, got {out:?}");
        };
        let PhysExpr::InSubquery { value, subquery } = predicate else {
            panic!("expected InSubquery, got {predicate}");
        };
        assert_eq!(**value, PhysExpr::col("k"));
        let PhysExpr::Subquery(exec) = subquery.as_ref() else {
            panic!("expected planned subquery");
        };
        assert!(exec.name.starts_with("dynamicpruning#"));
        assert!(!out.expressions().iter().any(|e| e.has_unplanned()));
        // the subquery plan went through the whole chain
        assert_eq!(
            exec.plan
                .count_nodes(&|n| matches!(n, PhysicalPlan::Exchange { .. })),
            1
        );
        assert!(!exec.plan.is_adaptive());
    }

    #[test]
    fn disabled_pruning_becomes_true() {
        let config = PipelineConfig {
            dynamic_pruning_enabled: false,
            ..Default::default()
        };
        let out = PlanDynamicPruningFilters
            .apply(pruned_scan(), &ctx(config))
            .expect("rule");
        let PhysicalPlan::Filter { predicate, .. } = out else {
            panic!("expected filter");
        };
        assert_eq!(predicate, PhysExpr::Literal(Scalar::Bool(true)));
    }

    #[test]
    fn scalar_subquery_ids_are_stable() {
        let max_v = relation().aggregate(
            vec![],
            vec![AggregateExpr::new(Aggregation::Max("v".into()), "m")],
        );
        let plan = || PhysicalPlan::Filter {
            input: Box::new(scan(false)),
            predicate: PhysExpr::ScalarSubqueryPlan(Box::new(max_v.clone())),
        };
        let ctx = ctx(PipelineConfig::default());
        let a = PlanSubqueries.apply(plan(), &ctx).expect("rule");
        let b = PlanSubqueries.apply(plan(), &ctx).expect("rule");
        assert_eq!(a, b);
        assert_eq!(a.subqueries().len(), 1);
        assert!(a.subqueries()[0].name.starts_with("scalar-subquery#"));
    }

    #[test]
    fn adaptive_subtree_is_not_entered() {
        let wrapped = PhysicalPlan::AdaptivePlan {
            input_plan: Box::new(pruned_scan()),
            is_final: false,
        };
        let out = PlanDynamicPruningFilters
            .apply(wrapped.clone(), &ctx(PipelineConfig::default()))
            .expect("rule");
        assert_eq!(out, wrapped);
    }
}
