use qstage_core::error::Result;
use qstage_core::physical::{Distribution, PhysicalPlan};

use super::{PrepareContext, PreparationRule};

/// Wraps an eligible top-level plan in `AdaptivePlan`.
///
/// Eligible means some node needs its input redistributed or some
/// expression still carries a subquery; a plain scan/filter/project tree
/// gains nothing from re-planning at execution time. Subquery plans are
/// never wrapped.
pub struct InsertAdaptivePlan;

impl PreparationRule for InsertAdaptivePlan {
    fn name(&self) -> &'static str {
        "InsertAdaptivePlan"
    }

    fn apply(&self, plan: PhysicalPlan, ctx: &PrepareContext) -> Result<PhysicalPlan> {
        if !ctx.config().adaptive_enabled
            || ctx.is_subquery()
            || plan.is_adaptive()
            || !is_eligible(&plan)
        {
            return Ok(plan);
        }
        Ok(PhysicalPlan::AdaptivePlan {
            input_plan: Box::new(plan),
            is_final: false,
        })
    }
}

fn is_eligible(plan: &PhysicalPlan) -> bool {
    plan.collect_nodes().into_iter().any(|node| {
        node.required_child_distribution()
            .iter()
            .any(|d| *d != Distribution::Unspecified)
            || node.expressions().iter().any(|e| e.has_subquery())
    })
}

#[cfg(test)]
mod tests {
    use qstage_core::config::PipelineConfig;
    use qstage_core::physical::PhysicalPlan;

    use super::*;
    use crate::prepare::test_support::*;

    fn adaptive_config() -> PipelineConfig {
        PipelineConfig {
            adaptive_enabled: true,
            ..Default::default()
        }
    }

    #[test]
    fn wraps_plans_that_need_an_exchange() {
        let out = InsertAdaptivePlan
            .apply(agg_by_k(scan(false)), &ctx(adaptive_config()))
            .expect("rule");
        assert!(matches!(
            out,
            PhysicalPlan::AdaptivePlan {
                is_final: false,
                ..
            }
        ));
        assert!(out.children().is_empty());
        assert!(out.expressions().is_empty());
    }

    #[test]
    fn leaves_simple_and_disabled_plans_alone() {
        let filter = PhysicalPlan::Filter {
            input: Box::new(scan(false)),
            predicate: k_gt(1),
        };
        let out = InsertAdaptivePlan
            .apply(filter.clone(), &ctx(adaptive_config()))
            .expect("rule");
        assert_eq!(out, filter);

        let agg = agg_by_k(scan(false));
        let out = InsertAdaptivePlan
            .apply(agg.clone(), &ctx(PipelineConfig::default()))
            .expect("rule");
        assert_eq!(out, agg);
    }

    #[test]
    fn does_not_double_wrap() {
        let ctx = ctx(adaptive_config());
        let once = InsertAdaptivePlan
            .apply(agg_by_k(scan(false)), &ctx)
            .expect("rule");
        let twice = InsertAdaptivePlan.apply(once.clone(), &ctx).expect("rule");
        assert_eq!(once, twice);
    }
}
