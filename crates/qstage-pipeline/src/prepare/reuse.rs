//! Reuse of identical exchanges and subqueries, keyed by plan fingerprint.
//! Both rules are gated by `exchange_reuse_enabled`.

use std::collections::HashMap;

use qstage_core::error::Result;
use qstage_core::hash::Hash256;
use qstage_core::id::{ExchangeId, SubqueryId};
use qstage_core::physical::{PhysExpr, PhysicalPlan};

use super::{id_from_fingerprint, PrepareContext, PreparationRule};

/// The first exchange with a given fingerprint is stamped with a reuse id;
/// later identical ones read its output through `ReusedExchange`.
pub struct ReuseExchange;

impl PreparationRule for ReuseExchange {
    fn name(&self) -> &'static str {
        "ReuseExchange"
    }

    fn apply(&self, plan: PhysicalPlan, ctx: &PrepareContext) -> Result<PhysicalPlan> {
        if !ctx.config().exchange_reuse_enabled {
            return Ok(plan);
        }

        let mut occurrences: HashMap<Hash256, usize> = HashMap::new();
        for node in plan.collect_nodes() {
            if matches!(node, PhysicalPlan::Exchange { .. }) {
                *occurrences.entry(node.fingerprint()?).or_default() += 1;
            }
        }
        if occurrences.values().all(|&n| n < 2) {
            return Ok(plan);
        }

        let mut kept: HashMap<Hash256, ExchangeId> = HashMap::new();
        plan.transform_down(&mut |node| {
            if !matches!(node, PhysicalPlan::Exchange { .. }) {
                return Ok(node);
            }
            let fingerprint = node.fingerprint()?;
            if occurrences.get(&fingerprint).copied().unwrap_or(0) < 2 {
                return Ok(node);
            }
            if let Some(id) = kept.get(&fingerprint) {
                tracing::debug!(%id, "exchange reused");
                return Ok(PhysicalPlan::ReusedExchange {
                    id: *id,
                    schema: node.schema(),
                    partitioning: node.output_partitioning(),
                });
            }
            let PhysicalPlan::Exchange {
                partitioning,
                reuse_id,
                input,
            } = node
            else {
                return Ok(node);
            };
            let id = reuse_id.unwrap_or_else(|| ExchangeId::new(id_from_fingerprint(&fingerprint)));
            kept.insert(fingerprint, id);
            Ok(PhysicalPlan::Exchange {
                partitioning,
                reuse_id: Some(id),
                input,
            })
        })
    }
}

/// Subqueries whose plans are identical to an earlier one become
/// `ReusedSubquery` references to it.
pub struct ReuseSubquery;

impl PreparationRule for ReuseSubquery {
    fn name(&self) -> &'static str {
        "ReuseSubquery"
    }

    fn apply(&self, plan: PhysicalPlan, ctx: &PrepareContext) -> Result<PhysicalPlan> {
        if !ctx.config().exchange_reuse_enabled || plan.subqueries().len() < 2 {
            return Ok(plan);
        }
        let mut seen: HashMap<Hash256, (SubqueryId, String)> = HashMap::new();
        plan.transform_down(&mut |node| {
            node.map_expressions(|e| {
                e.try_transform_up(&mut |expr| match expr {
                    PhysExpr::Subquery(sub) => {
                        let fingerprint = sub.plan.fingerprint()?;
                        match seen.get(&fingerprint) {
                            Some((id, name)) => {
                                tracing::debug!(%id, "subquery reused");
                                Ok(PhysExpr::ReusedSubquery {
                                    id: *id,
                                    name: name.clone(),
                                })
                            }
                            None => {
                                seen.insert(fingerprint, (sub.id, sub.name.clone()));
                                Ok(PhysExpr::Subquery(sub))
                            }
                        }
                    }
                    other => Ok(other),
                })
            })
        })
    }
}
