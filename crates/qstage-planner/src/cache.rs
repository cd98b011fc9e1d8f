//! Cache substitution: analyzed subtrees registered with `cache_query` are
//! swapped for `InMemoryRelation` leaves reading the cached data.
//!
//! Matching is by fingerprint of the analyzed subtree. The cached rows are
//! stored in the catalog under the entry's cache key by whoever populates
//! the cache.

use std::convert::Infallible;
use std::sync::RwLock;

use qstage_core::error::Result;
use qstage_core::hash::Hash256;
use qstage_core::logical::LogicalPlan;
use qstage_core::schema::Schema;

use crate::traits::CacheEngine;

#[derive(Debug, Clone, PartialEq)]
pub struct CachedEntry {
    pub fingerprint: Hash256,
    pub cache_key: String,
    pub schema: Schema,
}

#[derive(Debug, Default)]
pub struct CacheManager {
    entries: RwLock<Vec<CachedEntry>>,
}

impl CacheManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `analyzed` as cached under `cache_key`. Re-registering the
    /// same plan replaces the key.
    pub fn cache_query(&self, cache_key: impl Into<String>, analyzed: &LogicalPlan) -> Result<()> {
        let entry = CachedEntry {
            fingerprint: analyzed.fingerprint()?,
            cache_key: cache_key.into(),
            schema: analyzed.schema()?,
        };
        if let Ok(mut entries) = self.entries.write() {
            entries.retain(|e| e.fingerprint != entry.fingerprint);
            entries.push(entry);
        }
        Ok(())
    }

    pub fn uncache_all(&self) {
        if let Ok(mut entries) = self.entries.write() {
            entries.clear();
        }
    }

    pub fn entries(&self) -> Vec<CachedEntry> {
        self.entries.read().map(|e| e.clone()).unwrap_or_default()
    }

    fn lookup(&self, plan: &LogicalPlan) -> Option<CachedEntry> {
        let fp = plan.fingerprint().ok()?;
        let entries = self.entries.read().ok()?;
        entries.iter().find(|e| e.fingerprint == fp).cloned()
    }
}

impl CacheEngine for CacheManager {
    fn substitute(&self, plan: LogicalPlan) -> LogicalPlan {
        if self.entries().is_empty() {
            return plan;
        }
        if let Some(entry) = self.lookup(&plan) {
            tracing::debug!(cache_key = %entry.cache_key, "substituted cached subtree");
            return LogicalPlan::InMemoryRelation {
                cache_key: entry.cache_key,
                schema: entry.schema,
            };
        }
        match plan.map_children::<Infallible, _>(|c| Ok(self.substitute(c))) {
            Ok(p) => p,
            Err(never) => match never {},
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qstage_core::expr::Expr;
    use qstage_core::schema::{DataType, Field};
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
    fn replaces_matching_subtree() {
        let cached = rel().filter(a().gt(Expr::lit(Scalar::I32(1))));
        let cm = CacheManager::new();
        cm.cache_query("t_gt_1", &cached).expect("cache");

        let plan = cached.clone().project(vec![a()]);
        match cm.substitute(plan) {
            LogicalPlan::Project { input, .. } => assert_eq!(
                *input,
                LogicalPlan::InMemoryRelation {
                    cache_key: "t_gt_1".into(),
                    schema: rel().schema().expect("schema"),
                }
            ),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn no_entries_is_identity() {
        let plan = rel().project(vec![a()]);
        assert_eq!(CacheManager::new().substitute(plan.clone()), plan);
    }
}
