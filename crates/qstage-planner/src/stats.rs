//! Coarse cardinality estimation.
//!
//! Row counts come from the catalog at the leaves and are pushed up through
//! fixed selectivity heuristics. Good enough to annotate plans and to size
//! adaptive shuffle partitions; not a cost model.

use std::fmt;

use qstage_core::catalog::Catalog;
use qstage_core::error::{Error, Result};
use qstage_core::expr::{BinaryOp, Expr};
use qstage_core::logical::{JoinType, LogicalPlan};
use qstage_core::physical::{PhysExpr, PhysicalPlan};
use qstage_core::schema::Schema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    pub row_count: u64,
    pub size_in_bytes: u64,
}

impl Statistics {
    fn for_rows(rows: u64, schema: &Schema) -> Self {
        Self {
            row_count: rows,
            size_in_bytes: rows.saturating_mul(schema.row_width()),
        }
    }
}

impl fmt::Display for Statistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Statistics(sizeInBytes={}, rowCount={})",
            bytes_to_string(self.size_in_bytes),
            self.row_count
        )
    }
}

fn bytes_to_string(b: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut v = b as f64;
    let mut unit = 0;
    while v >= 1024.0 && unit + 1 < UNITS.len() {
        v /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", v, UNITS[unit])
}

/// Selectivity of one predicate by its shape.
fn selectivity(op: Option<BinaryOp>) -> f64 {
    match op {
        Some(BinaryOp::Eq) => 0.1,
        Some(BinaryOp::NotEq) => 0.9,
        Some(BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq) => 0.33,
        _ => 0.5,
    }
}

fn expr_selectivity(e: &Expr) -> f64 {
    match e {
        Expr::Binary {
            left,
            op: BinaryOp::And,
            right,
        } => expr_selectivity(left) * expr_selectivity(right),
        Expr::Binary {
            left,
            op: BinaryOp::Or,
            right,
        } => (expr_selectivity(left) + expr_selectivity(right)).min(1.0),
        Expr::Binary { op, .. } => selectivity(Some(*op)),
        Expr::Literal(v) => match v.as_bool() {
            Some(true) => 1.0,
            _ => 0.0,
        },
        _ => selectivity(None),
    }
}

fn phys_selectivity(e: &PhysExpr) -> f64 {
    match e {
        PhysExpr::Binary {
            left,
            op: BinaryOp::And,
            right,
        } => phys_selectivity(left) * phys_selectivity(right),
        PhysExpr::Binary {
            left,
            op: BinaryOp::Or,
            right,
        } => (phys_selectivity(left) + phys_selectivity(right)).min(1.0),
        PhysExpr::Binary { op, .. } => selectivity(Some(*op)),
        PhysExpr::Literal(v) => match v.as_bool() {
            Some(true) => 1.0,
            _ => 0.0,
        },
        _ => selectivity(None),
    }
}

fn apply_selectivity(rows: u64, s: f64) -> u64 {
    if rows == 0 {
        return 0;
    }
    ((rows as f64 * s) as u64).max(1)
}

fn join_cardinality(left: u64, right: u64, join_type: JoinType) -> u64 {
    match join_type {
        JoinType::Inner => {
            let cross = (left as f64 * right as f64).sqrt();
            (cross as u64).max(1).min(left.min(right).max(1))
        }
        JoinType::Left => (left as f64 * 1.2) as u64,
    }
}

fn aggregate_groups(input: u64, keys: usize) -> u64 {
    if keys == 0 {
        return 1;
    }
    let factor = match keys {
        1 => 0.1,
        2 => 0.25,
        3 => 0.4,
        _ => 0.5,
    };
    ((input as f64 * factor) as u64).max(1).min(input.max(1))
}

fn table_rows(catalog: &Catalog, name: &str) -> Result<u64> {
    catalog
        .row_count(name)
        .ok_or_else(|| Error::Planning(format!("no statistics available for '{name}'")))
}

/// Estimate a resolved logical plan.
pub fn logical_stats(plan: &LogicalPlan, catalog: &Catalog) -> Result<Statistics> {
    let schema = plan.schema()?;
    let rows = match plan {
        LogicalPlan::UnresolvedRelation { name } => {
            return Err(Error::Analysis(format!("unresolved relation '{name}'")))
        }
        LogicalPlan::Relation { table, .. } => table_rows(catalog, table)?,
        LogicalPlan::InMemoryRelation { cache_key, .. } => table_rows(catalog, cache_key)?,
        LogicalPlan::Filter { input, predicate } => apply_selectivity(
            logical_stats(input, catalog)?.row_count,
            expr_selectivity(predicate),
        ),
        LogicalPlan::Project { input, .. }
        | LogicalPlan::Sort { input, .. }
        | LogicalPlan::ReturnAnswer { input } => logical_stats(input, catalog)?.row_count,
        LogicalPlan::Limit { input, n } => logical_stats(input, catalog)?.row_count.min(*n as u64),
        LogicalPlan::Aggregate {
            input, group_by, ..
        } => aggregate_groups(logical_stats(input, catalog)?.row_count, group_by.len()),
        LogicalPlan::Join {
            left,
            right,
            join_type,
            ..
        } => join_cardinality(
            logical_stats(left, catalog)?.row_count,
            logical_stats(right, catalog)?.row_count,
            *join_type,
        ),
    };
    Ok(Statistics::for_rows(rows, &schema))
}

/// Estimate a physical plan (used to size adaptive shuffles).
pub fn physical_stats(plan: &PhysicalPlan, catalog: &Catalog) -> Result<Statistics> {
    let schema = plan.schema();
    let rows = match plan {
        PhysicalPlan::Scan {
            table,
            partition_filters,
            ..
        } => {
            let rows = table_rows(catalog, table)?;
            if partition_filters.is_empty() {
                rows
            } else {
                apply_selectivity(rows, 0.5)
            }
        }
        PhysicalPlan::InMemoryScan { cache_key, .. } => table_rows(catalog, cache_key)?,
        PhysicalPlan::Filter { input, predicate } => apply_selectivity(
            physical_stats(input, catalog)?.row_count,
            phys_selectivity(predicate),
        ),
        PhysicalPlan::Project { input, .. }
        | PhysicalPlan::Sort { input, .. }
        | PhysicalPlan::Exchange { input, .. }
        | PhysicalPlan::ColumnarToRow { input }
        | PhysicalPlan::RowToColumnar { input }
        | PhysicalPlan::FusedStage { input, .. } => physical_stats(input, catalog)?.row_count,
        PhysicalPlan::Limit { input, n } => physical_stats(input, catalog)?.row_count.min(*n as u64),
        PhysicalPlan::HashAggregate {
            input, group_by, ..
        } => aggregate_groups(physical_stats(input, catalog)?.row_count, group_by.len()),
        PhysicalPlan::SortMergeJoin {
            left,
            right,
            join_type,
            ..
        } => join_cardinality(
            physical_stats(left, catalog)?.row_count,
            physical_stats(right, catalog)?.row_count,
            *join_type,
        ),
        PhysicalPlan::AdaptivePlan { input_plan, .. } => {
            physical_stats(input_plan, catalog)?.row_count
        }
        PhysicalPlan::ReusedExchange { id, .. } => {
            return Err(Error::Planning(format!("no statistics for reused {id}")))
        }
    };
    Ok(Statistics::for_rows(rows, &schema))
}

#[cfg(test)]
mod tests {
    use super::*;
    use qstage_core::catalog::TableDef;
    use qstage_core::schema::{DataType, Field};
    use qstage_core::types::Scalar;

    fn catalog() -> Catalog {
        let c = Catalog::new();
        let schema = Schema::new(vec![Field::new("a", DataType::Int64, false)]);
        let rows = (0..100).map(|i| vec![Scalar::I64(i)]).collect();
        c.register(TableDef::from_rows("t", schema, rows, None, 1).expect("table"));
        c
    }

    fn rel() -> LogicalPlan {
        LogicalPlan::Relation {
            table: "t".into(),
            schema: Schema::new(vec![Field::new("a", DataType::Int64, false)]),
            partition_column: None,
            streaming: false,
        }
    }

    #[test]
    fn leaf_and_filter_estimates() {
        let c = catalog();
        let s = logical_stats(&rel(), &c).expect("stats");
        assert_eq!(s.row_count, 100);
        assert_eq!(s.size_in_bytes, 800);

        let a = Expr::Column {
            name: "a".into(),
            data_type: DataType::Int64,
            nullable: false,
        };
        let f = rel().filter(a.eq(Expr::lit(Scalar::I64(3))));
        assert_eq!(logical_stats(&f, &c).expect("stats").row_count, 10);
        assert_eq!(logical_stats(&rel().limit(5), &c).expect("stats").row_count, 5);
    }

    #[test]
    fn unresolved_and_unknown_tables_fail() {
        let c = catalog();
        assert!(logical_stats(&LogicalPlan::table("t"), &c).is_err());
        let missing = LogicalPlan::Relation {
            table: "zz".into(),
            schema: Schema::empty(),
            partition_column: None,
            streaming: false,
        };
        assert!(matches!(logical_stats(&missing, &c), Err(Error::Planning(_))));
    }

    #[test]
    fn renders_like_annotations() {
        let s = Statistics {
            row_count: 4,
            size_in_bytes: 2048,
        };
        assert_eq!(s.to_string(), "Statistics(sizeInBytes=2.0 KiB, rowCount=4)");
    }
}
