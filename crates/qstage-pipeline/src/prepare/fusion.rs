use qstage_core::error::Result;
use qstage_core::id::StageId;
use qstage_core::physical::PhysicalPlan;

use super::{PrepareContext, PreparationRule};

/// Wraps each maximal Filter/Project chain in a `FusedStage`.
///
/// Stage ids are assigned 1.. in pre-order, existing stages included, so
/// running the rule twice yields the same tree.
pub struct CollapseFusedStages;

impl PreparationRule for CollapseFusedStages {
    fn name(&self) -> &'static str {
        "CollapseFusedStages"
    }

    fn apply(&self, plan: PhysicalPlan, ctx: &PrepareContext) -> Result<PhysicalPlan> {
        if !ctx.config().codegen_enabled {
            return Ok(plan);
        }
        let mut next = 1;
        fuse(plan, &mut next)
    }
}

fn fuse(plan: PhysicalPlan, next: &mut u64) -> Result<PhysicalPlan> {
    let chain = match plan {
        PhysicalPlan::FusedStage { input, .. } => *input,
        p if p.supports_fusion() => p,
        other => return other.map_children(|c| fuse(c, next)),
    };
    let stage_id = StageId::new(*next);
    *next += 1;
    Ok(PhysicalPlan::FusedStage {
        stage_id,
        input: Box::new(below_chain(chain, next)?),
    })
}

// Walk down the chain and continue fusing under its last operator.
fn below_chain(plan: PhysicalPlan, next: &mut u64) -> Result<PhysicalPlan> {
    if plan.supports_fusion() {
        plan.map_children(|c| below_chain(c, next))
    } else {
        fuse(plan, next)
    }
}

/// Fused operators of `stage`, top first.
pub(crate) fn stage_chain(stage: &PhysicalPlan) -> Vec<&PhysicalPlan> {
    let mut chain = Vec::new();
    if let PhysicalPlan::FusedStage { input, .. } = stage {
        let mut node = input.as_ref();
        while node.supports_fusion() {
            chain.push(node);
            match node.children().first() {
                Some(child) => node = *child,
                None => break,
            }
        }
    }
    chain
}

#[cfg(test)]
mod tests {
    use qstage_core::config::PipelineConfig;
    use qstage_core::physical::PhysExpr;
    use qstage_core::schema::{DataType, Field, Schema};

    use super::*;
    use crate::prepare::test_support::*;

    fn project_k(input: PhysicalPlan) -> PhysicalPlan {
        PhysicalPlan::Project {
            input: Box::new(input),
            exprs: vec![PhysExpr::col("k")],
            schema: Schema::new(vec![Field::new("k", DataType::Int64, false)]),
        }
    }

    fn filter(input: PhysicalPlan) -> PhysicalPlan {
        PhysicalPlan::Filter {
            input: Box::new(input),
            predicate: k_gt(0),
        }
    }

    fn stage_ids(plan: &PhysicalPlan) -> Vec<u64> {
        plan.collect_nodes()
            .into_iter()
            .filter_map(|n| match n {
                PhysicalPlan::FusedStage { stage_id, .. } => Some(stage_id.get()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn chains_collapse_into_numbered_stages() {
        // Project <- Filter <- HashAggregate <- Filter <- Scan
        let plan = project_k(filter(agg_by_k(filter(scan(false)))));
        let out = CollapseFusedStages
            .apply(plan, &ctx(PipelineConfig::default()))
            .expect("rule");
        assert_eq!(stage_ids(&out), vec![1, 2]);
        assert_eq!(stage_chain(&out).len(), 2);
        let PhysicalPlan::FusedStage { input, .. } = &out else {
            panic!("expected stage at root");
        };
        assert!(matches!(input.as_ref(), PhysicalPlan::Project { .. }));
    }

    #[test]
    fn fusion_is_idempotent_and_gated() {
        let plan = project_k(filter(scan(false)));
        let ctx_on = ctx(PipelineConfig::default());
        let once = CollapseFusedStages.apply(plan.clone(), &ctx_on).expect("rule");
        let twice = CollapseFusedStages.apply(once.clone(), &ctx_on).expect("rule");
        assert_eq!(once, twice);

        let off = PipelineConfig {
            codegen_enabled: false,
            ..Default::default()
        };
        let untouched = CollapseFusedStages.apply(plan.clone(), &ctx(off)).expect("rule");
        assert_eq!(untouched, plan);
    }
}
