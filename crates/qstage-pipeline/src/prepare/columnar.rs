use qstage_core::error::{Error, Result};
use qstage_core::physical::PhysicalPlan;

use super::{PrepareContext, PreparationRule};

/// Makes format changes explicit: `ColumnarToRow` above every columnar
/// producer read by a row consumer (the caller of the root included),
/// `RowToColumnar` below every columnar consumer reading rows.
pub struct ApplyColumnarTransitions;

impl PreparationRule for ApplyColumnarTransitions {
    fn name(&self) -> &'static str {
        "ApplyColumnarTransitions"
    }

    fn apply(&self, plan: PhysicalPlan, _ctx: &PrepareContext) -> Result<PhysicalPlan> {
        let plan = plan.transform_up(&mut |node| {
            let columnar_input = node.consumes_columnar();
            node.map_children(|child| {
                Ok::<_, Error>(match (child.supports_columnar(), columnar_input) {
                    (true, false) => PhysicalPlan::ColumnarToRow {
                        input: Box::new(child),
                    },
                    (false, true) => PhysicalPlan::RowToColumnar {
                        input: Box::new(child),
                    },
                    _ => child,
                })
            })
        })?;
        Ok(if plan.supports_columnar() {
            PhysicalPlan::ColumnarToRow {
                input: Box::new(plan),
            }
        } else {
            plan
        })
    }
}

#[cfg(test)]
mod tests {
    use qstage_core::config::PipelineConfig;

    use super::*;
    use crate::prepare::test_support::*;

    #[test]
    fn row_consumer_of_columnar_scan_gets_transition() {
        let plan = PhysicalPlan::Filter {
            input: Box::new(scan(true)),
            predicate: k_gt(0),
        };
        let out = ApplyColumnarTransitions
            .apply(plan, &ctx(PipelineConfig::default()))
            .expect("rule");
        let PhysicalPlan::Filter { input, .. } = &out else {
            panic!("expected filter");
        };
        assert!(matches!(input.as_ref(), PhysicalPlan::ColumnarToRow { .. }));
    }

    #[test]
    fn columnar_root_is_converted_once() {
        let ctx = ctx(PipelineConfig::default());
        let once = ApplyColumnarTransitions.apply(scan(true), &ctx).expect("rule");
        assert!(matches!(once, PhysicalPlan::ColumnarToRow { .. }));
        let twice = ApplyColumnarTransitions.apply(once.clone(), &ctx).expect("rule");
        assert_eq!(once, twice);
    }

    #[test]
    fn row_plans_are_untouched() {
        let plan = agg_by_k(scan(false));
        let out = ApplyColumnarTransitions
            .apply(plan.clone(), &ctx(PipelineConfig::default()))
            .expect("rule");
        assert_eq!(out, plan);
    }
}
