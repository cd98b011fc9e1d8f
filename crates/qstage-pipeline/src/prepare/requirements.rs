use qstage_core::error::{Error, Result};
use qstage_core::physical::{Distribution, Partitioning, PhysicalPlan};

use super::{PrepareContext, PreparationRule};

/// Inserts the exchanges and sorts each operator needs below it.
///
/// One bottom-up pass. A child whose partitioning does not satisfy the
/// required distribution gets an `Exchange`; a child whose ordering does not
/// start with the required ordering then gets a partition-local `Sort`.
/// Operators with several clustered children (joins) need all of them hash
/// partitioned with one partition count: the largest count a child already
/// provides, else `shuffle_partitions`.
pub struct EnsureRequirements;

impl PreparationRule for EnsureRequirements {
    fn name(&self) -> &'static str {
        "EnsureRequirements"
    }

    fn apply(&self, plan: PhysicalPlan, ctx: &PrepareContext) -> Result<PhysicalPlan> {
        let shuffle_partitions = ctx.config().shuffle_partitions;
        plan.transform_up(&mut |node| ensure_node(node, shuffle_partitions))
    }
}

fn ensure_node(node: PhysicalPlan, shuffle_partitions: usize) -> Result<PhysicalPlan> {
    let distributions = node.required_child_distribution();
    let orderings = node.required_child_ordering();
    if distributions.iter().all(|d| *d == Distribution::Unspecified)
        && orderings.iter().all(Vec::is_empty)
    {
        return Ok(node);
    }

    let co_partitioned = distributions.len() > 1
        && distributions
            .iter()
            .all(|d| matches!(d, Distribution::Clustered(_)));
    let target = if co_partitioned {
        node.children()
            .iter()
            .zip(&distributions)
            .filter_map(|(child, d)| {
                let p = child.output_partitioning();
                match &p {
                    Partitioning::Hash { n, .. } if p.satisfies(d) => Some(*n),
                    _ => None,
                }
            })
            .max()
            .unwrap_or(shuffle_partitions)
    } else {
        shuffle_partitions
    };

    let mut requirements = distributions.into_iter().zip(orderings);
    node.map_children(|child| {
        let (distribution, ordering) = requirements.next().ok_or_else(|| {
            Error::Invariant("child without a declared requirement".into())
        })?;
        let partitioning = child.output_partitioning();
        let needs_exchange = if co_partitioned {
            !(matches!(partitioning, Partitioning::Hash { .. })
                && partitioning.satisfies(&distribution)
                && partitioning.num_partitions() == Some(target))
        } else {
            !partitioning.satisfies(&distribution)
        };
        let child = if needs_exchange {
            PhysicalPlan::Exchange {
                partitioning: Partitioning::for_distribution(&distribution, target),
                reuse_id: None,
                input: Box::new(child),
            }
        } else {
            child
        };
        Ok(if !ordering.is_empty() && !child.output_ordering().starts_with(&ordering) {
            PhysicalPlan::Sort {
                input: Box::new(child),
                order_by: ordering,
                global: false,
            }
        } else {
            child
        })
    })
}
