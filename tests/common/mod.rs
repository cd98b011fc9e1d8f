//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use qstage_core::catalog::{Catalog, TableDef};
use qstage_core::config::PipelineConfig;
use qstage_core::expr::{AggregateExpr, Aggregation, Expr};
use qstage_core::logical::LogicalPlan;
use qstage_core::schema::{DataType, Field, Schema};
use qstage_core::types::{scalar_tuple_cmp, Row, Scalar};
use qstage_pipeline::Session;

pub fn int(v: i32) -> Expr {
    Expr::lit(Scalar::I32(v))
}

/// `t(a: int)` holding 0..=3, plus `fact`/`dim` for join tests.
pub fn catalog() -> Arc<Catalog> {
    let catalog = Catalog::new();

    let t_schema = Schema::new(vec![Field::new("a", DataType::Int32, false)]);
    let t_rows = (0..4).map(|i| vec![Scalar::I32(i)]).collect();
    catalog.register(TableDef::from_rows("t", t_schema, t_rows, None, 2).expect("t"));

    let fact_schema = Schema::new(vec![
        Field::new("p", DataType::Int32, false),
        Field::new("v", DataType::Int64, false),
    ]);
    let fact_rows = [(1, 10), (1, 11), (2, 20), (3, 30), (3, 31)]
        .into_iter()
        .map(|(p, v)| vec![Scalar::I32(p), Scalar::I64(v)])
        .collect();
    catalog.register(
        TableDef::from_rows("fact", fact_schema, fact_rows, Some("p".into()), 1).expect("fact"),
    );

    let dim_schema = Schema::new(vec![
        Field::new("p2", DataType::Int32, false),
        Field::new("w", DataType::Int32, false),
    ]);
    let dim_rows = [(1, 1), (2, 9), (3, 7)]
        .into_iter()
        .map(|(p, w)| vec![Scalar::I32(p), Scalar::I32(w)])
        .collect();
    catalog.register(TableDef::from_rows("dim", dim_schema, dim_rows, None, 2).expect("dim"));

    Arc::new(catalog)
}

pub fn session(config: PipelineConfig) -> Arc<Session> {
    Session::new(catalog(), config).expect("session")
}

/// `SELECT a FROM t WHERE a > 1`, written with the filter above the
/// projection.
pub fn select_a_where_gt_1() -> LogicalPlan {
    LogicalPlan::table("t")
        .project(vec![Expr::col("a")])
        .filter(Expr::col("a").gt(int(1)))
}

pub fn max_a() -> LogicalPlan {
    LogicalPlan::table("t").aggregate(
        vec![],
        vec![AggregateExpr::new(Aggregation::Max("a".into()), "m")],
    )
}

/// Fact joined to the filtered dimension on its partition column.
pub fn fact_dim_join() -> LogicalPlan {
    LogicalPlan::table("fact").join(
        LogicalPlan::table("dim").filter(Expr::col("w").gt(int(5))),
        vec![("p".into(), "p2".into())],
        qstage_core::logical::JoinType::Inner,
    )
}

/// The same aggregated subquery on both sides of a join.
pub fn doubled_aggregate_join() -> LogicalPlan {
    let side = || {
        LogicalPlan::table("t").aggregate(
            vec!["a".into()],
            vec![AggregateExpr::new(Aggregation::Count, "c")],
        )
    };
    side().join(
        side(),
        vec![("a".into(), "a".into())],
        qstage_core::logical::JoinType::Inner,
    )
}

pub fn sorted(mut rows: Vec<Row>) -> Vec<Row> {
    rows.sort_by(|a, b| scalar_tuple_cmp(a, b));
    rows
}
