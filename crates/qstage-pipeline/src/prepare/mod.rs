//! Preparation chain: the ordered physical rewrites applied to the planner's
//! first candidate before it is handed to the runtime.
//!
//! Rules are pure functions of `(plan, context)` folded left to right. The
//! order is load-bearing:
//!
//! 1. `InsertAdaptivePlan` may wrap the whole plan in `AdaptivePlan`. The
//!    wrapper reports no children and no expressions, so rules 2-8 see a
//!    single leaf and leave everything under it alone. Nothing consults a
//!    flag for this; the short-circuit falls out of the tree shape.
//! 2. `PlanDynamicPruningFilters`
//! 3. `PlanSubqueries`
//! 4. `EnsureRequirements`
//! 5. `ApplyColumnarTransitions`
//! 6. `CollapseFusedStages`
//! 7. `ReuseExchange`
//! 8. `ReuseSubquery`
//!
//! Rules 2-8 also form the query-stage chain used when an adaptive plan is
//! finalized.

mod adaptive;
mod columnar;
mod fusion;
mod requirements;
mod reuse;
mod subquery;

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use qstage_core::config::PipelineConfig;
use qstage_core::error::Result;
use qstage_core::hash::Hash256;
use qstage_core::logical::LogicalPlan;
use qstage_core::physical::PhysicalPlan;
use qstage_core::tracker::PlanTracker;

use crate::pipeline::plan_first_candidate;
use crate::session::Session;

pub use adaptive::InsertAdaptivePlan;
pub use columnar::ApplyColumnarTransitions;
pub use fusion::CollapseFusedStages;
pub(crate) use fusion::stage_chain;
pub use requirements::EnsureRequirements;
pub use reuse::{ReuseExchange, ReuseSubquery};
pub use subquery::{PlanDynamicPruningFilters, PlanSubqueries};

/// A named, stateless physical rewrite.
pub trait PreparationRule: Send + Sync {
    fn name(&self) -> &'static str;

    fn apply(&self, plan: PhysicalPlan, ctx: &PrepareContext) -> Result<PhysicalPlan>;
}

/// What a rule may read while rewriting: the session (config, catalog,
/// planner, chains) and the tracker of the owning pipeline.
#[derive(Clone)]
pub struct PrepareContext {
    session: Arc<Session>,
    tracker: Arc<PlanTracker>,
    subquery: bool,
}

impl PrepareContext {
    pub fn new(session: Arc<Session>, tracker: Arc<PlanTracker>) -> Self {
        Self {
            session,
            tracker,
            subquery: false,
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn config(&self) -> &PipelineConfig {
        self.session.config()
    }

    pub fn tracker(&self) -> &PlanTracker {
        &self.tracker
    }

    /// True while preparing a subquery plan.
    pub fn is_subquery(&self) -> bool {
        self.subquery
    }

    fn for_subquery(&self) -> Self {
        Self {
            subquery: true,
            ..self.clone()
        }
    }

    /// Plan `logical` (first candidate) and run the session's preparation
    /// chain over it. Subquery plans are never wrapped adaptively.
    pub fn prepare_subquery(&self, logical: &LogicalPlan) -> Result<PhysicalPlan> {
        let physical = plan_first_candidate(&self.session, logical.clone())?;
        self.session
            .preparation_chain()
            .apply(physical, &self.for_subquery())
    }
}

impl fmt::Debug for PrepareContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrepareContext")
            .field("subquery", &self.subquery)
            .finish_non_exhaustive()
    }
}

/// Ordered list of rules applied by a left fold.
pub struct PreparationChain {
    rules: Vec<Box<dyn PreparationRule>>,
}

impl PreparationChain {
    pub fn new(rules: Vec<Box<dyn PreparationRule>>) -> Self {
        Self { rules }
    }

    /// The chain run by `executed_plan()`.
    pub fn default_chain() -> Self {
        let mut rules: Vec<Box<dyn PreparationRule>> = vec![Box::new(InsertAdaptivePlan)];
        rules.extend(Self::query_stage_rules());
        Self::new(rules)
    }

    /// Everything after the adaptive gate; used to finalize adaptive plans.
    pub fn query_stage_chain() -> Self {
        Self::new(Self::query_stage_rules())
    }

    fn query_stage_rules() -> Vec<Box<dyn PreparationRule>> {
        vec![
            Box::new(PlanDynamicPruningFilters),
            Box::new(PlanSubqueries),
            Box::new(EnsureRequirements),
            Box::new(ApplyColumnarTransitions),
            Box::new(CollapseFusedStages),
            Box::new(ReuseExchange),
            Box::new(ReuseSubquery),
        ]
    }

    pub fn rule_names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// `rule_n(...rule_1(plan))`, recording each application.
    pub fn apply(&self, plan: PhysicalPlan, ctx: &PrepareContext) -> Result<PhysicalPlan> {
        self.rules.iter().try_fold(plan, |plan, rule| {
            let before = plan.clone();
            let start = Instant::now();
            let after = rule.apply(plan, ctx)?;
            let changed = after != before;
            ctx.tracker().record_rule(rule.name(), start.elapsed(), changed);
            tracing::debug!(
                rule = rule.name(),
                changed,
                subquery = ctx.is_subquery(),
                "preparation rule applied"
            );
            Ok(after)
        })
    }
}

/// Stable numeric id for a fingerprinted subtree. Identical subtrees get
/// the same id in every run and in every independently prepared plan.
pub(crate) fn id_from_fingerprint(fingerprint: &Hash256) -> u64 {
    let [a, b, c, d, e, f, g, h, ..] = fingerprint.0;
    u64::from_be_bytes([a, b, c, d, e, f, g, h])
}

impl fmt::Debug for PreparationChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.rule_names()).finish()
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn default_chain_declares_rules_in_order() {
        assert_eq!(
            PreparationChain::default_chain().rule_names(),
            vec![
                "InsertAdaptivePlan",
                "PlanDynamicPruningFilters",
                "PlanSubqueries",
                "EnsureRequirements",
                "ApplyColumnarTransitions",
                "CollapseFusedStages",
                "ReuseExchange",
                "ReuseSubquery",
            ]
        );
        assert_eq!(PreparationChain::query_stage_chain().len(), 7);
    }

    #[test]
    fn every_rule_application_is_recorded() {
        let ctx = ctx(PipelineConfig::default());
        PreparationChain::default_chain()
            .apply(agg_by_k(scan(true)), &ctx)
            .expect("prepared");
        let rules = ctx.tracker().rules();
        assert_eq!(rules.len(), 8);
        assert_eq!(rules["EnsureRequirements"].effective_invocations, 1);
        assert_eq!(rules["InsertAdaptivePlan"].effective_invocations, 0);
    }

    #[test]
    fn ids_keep_sixty_four_bits_of_the_fingerprint() {
        // fingerprints sharing their first four bytes still get distinct ids
        let mut a = [0u8; 32];
        a[..8].copy_from_slice(&[1, 2, 3, 4, 0, 0, 0, 1]);
        let mut b = a;
        b[7] = 2;
        assert_eq!(id_from_fingerprint(&Hash256(a)), 0x0102_0304_0000_0001);
        assert_ne!(id_from_fingerprint(&Hash256(a)), id_from_fingerprint(&Hash256(b)));
    }
}
