//! End-to-end compilation: preparation rules, subqueries, reuse and
//! adaptive execution.

mod common;

use std::sync::Arc;

use common::*;
use proptest::prelude::*;
use qstage_core::config::PipelineConfig;
use qstage_core::expr::{AggregateExpr, Aggregation, BinaryOp, Expr};
use qstage_core::logical::{JoinType, LogicalPlan};
use qstage_core::physical::{PhysExpr, PhysicalPlan};
use qstage_core::types::Scalar;

fn count(plan: &PhysicalPlan, name: &str) -> usize {
    plan.count_nodes(&|n| n.node_name() == name)
}

fn all_expressions(plan: &PhysicalPlan) -> Vec<String> {
    plan.collect_nodes()
        .into_iter()
        .flat_map(|n| n.expressions())
        .map(|e| e.to_string())
        .collect()
}

#[test]
fn select_with_filter_end_to_end() {
    let session = session(PipelineConfig::default());
    let pipeline = session.pipeline(select_a_where_gt_1());

    let analyzed = pipeline.analyzed().expect("analyzed");
    assert_eq!(analyzed.schema().expect("schema").to_string(), "a: int");

    // the filter ends up below the projection
    let optimized = pipeline.optimized_plan().expect("optimized");
    let LogicalPlan::Project { input, .. } = optimized.as_ref() else {
        panic!("expected projection at the root: {optimized:?}");
    };
    assert!(matches!(input.as_ref(), LogicalPlan::Filter { .. }), "{optimized:?}");

    assert_eq!(
        sorted(pipeline.collect().expect("rows")),
        vec![vec![Scalar::I32(2)], vec![Scalar::I32(3)]]
    );
}

#[test]
fn stages_are_isolated_copies() {
    let session = session(PipelineConfig::default());
    let pipeline = session.pipeline(select_a_where_gt_1());
    let physical = pipeline.physical_plan().expect("physical");
    let before = (*physical).clone();
    let executed = pipeline.executed_plan().expect("executed");

    assert_ne!(*executed, before);
    assert_eq!(*pipeline.physical_plan().expect("physical"), before);
    assert_eq!(pipeline.logical(), &select_a_where_gt_1());
}

#[test]
fn rules_run_in_fixed_order_once_each() {
    let session = session(PipelineConfig::default());
    assert_eq!(
        session.preparation_chain().rule_names(),
        [
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
    let pipeline = session.pipeline(select_a_where_gt_1());
    pipeline.executed_plan().expect("executed");
    let rules = pipeline.tracker().rules();
    for name in session.preparation_chain().rule_names() {
        assert_eq!(rules.get(name).map(|r| r.invocations), Some(1), "{name}");
    }
}

#[test]
fn adaptive_wrapper_short_circuits_later_rules() {
    let session = session(PipelineConfig {
        adaptive_enabled: true,
        ..Default::default()
    });
    let pipeline = session.pipeline(doubled_aggregate_join());
    let physical = pipeline.physical_plan().expect("physical");
    let executed = pipeline.executed_plan().expect("executed");

    let PhysicalPlan::AdaptivePlan {
        input_plan,
        is_final,
    } = executed.as_ref()
    else {
        panic!("expected adaptive wrapper: {executed:?}");
    };
    assert!(!is_final);
    assert_eq!(input_plan.as_ref(), physical.as_ref());
    assert_eq!(count(&executed, "AdaptivePlan"), 1);
    assert_eq!(count(&executed, "Exchange"), 0);
}

#[test]
fn adaptive_and_static_execution_agree() {
    for plan in [doubled_aggregate_join(), fact_dim_join(), select_a_where_gt_1()] {
        let fixed = session(PipelineConfig::default())
            .pipeline(plan.clone())
            .collect()
            .expect("static");
        let adaptive = session(PipelineConfig {
            adaptive_enabled: true,
            adaptive_advisory_partition_rows: 2,
            ..Default::default()
        })
        .pipeline(plan)
        .collect()
        .expect("adaptive");
        assert_eq!(sorted(fixed), sorted(adaptive));
    }
}

#[test]
fn doubled_aggregate_shares_one_exchange() {
    let session = session(PipelineConfig::default());
    let pipeline = session.pipeline(doubled_aggregate_join());
    let executed = pipeline.executed_plan().expect("executed");
    assert_eq!(count(&executed, "Exchange"), 1, "{}", executed.tree_string(25));
    assert_eq!(count(&executed, "ReusedExchange"), 1);

    let rows = sorted(pipeline.collect().expect("rows"));
    assert_eq!(rows.len(), 4);
    assert!(rows.iter().all(|r| r[0] == r[2] && r[1] == r[3]));
}

#[test]
fn projection_over_clustered_key_is_reshuffled_for_join() {
    // (a + 1) AS a no longer matches the shuffle of the aggregate below it
    let shifted = LogicalPlan::table("t")
        .aggregate(
            vec!["a".into()],
            vec![AggregateExpr::new(Aggregation::Count, "c")],
        )
        .project(vec![
            Expr::binary(Expr::col("a"), BinaryOp::Plus, int(1)).alias("a"),
        ]);
    let plan = shifted.join(
        LogicalPlan::table("t"),
        vec![("a".into(), "a".into())],
        JoinType::Inner,
    );
    for config in [
        PipelineConfig::default(),
        PipelineConfig {
            adaptive_enabled: true,
            ..Default::default()
        },
    ] {
        let rows = sorted(session(config).pipeline(plan.clone()).collect().expect("rows"));
        assert_eq!(
            rows,
            (1..=3)
                .map(|v| vec![Scalar::I32(v), Scalar::I32(v)])
                .collect::<Vec<_>>()
        );
    }
}

#[test]
fn dynamic_pruning_becomes_in_subquery() {
    let on = session(PipelineConfig::default()).pipeline(fact_dim_join());
    let executed = on.executed_plan().expect("executed");
    assert!(
        all_expressions(&executed)
            .iter()
            .any(|e| e.contains(" IN (Subquery dynamicpruning#")),
        "{}",
        executed.tree_string(25)
    );

    let off = session(PipelineConfig {
        dynamic_pruning_enabled: false,
        ..Default::default()
    })
    .pipeline(fact_dim_join());
    let executed_off = off.executed_plan().expect("executed");
    assert!(executed_off.subqueries().is_empty());

    let expected = vec![
        vec![Scalar::I32(2), Scalar::I64(20), Scalar::I32(2), Scalar::I32(9)],
        vec![Scalar::I32(3), Scalar::I64(30), Scalar::I32(3), Scalar::I32(7)],
        vec![Scalar::I32(3), Scalar::I64(31), Scalar::I32(3), Scalar::I32(7)],
    ];
    assert_eq!(sorted(on.collect().expect("rows")), expected);
    assert_eq!(sorted(off.collect().expect("rows")), expected);
}

#[test]
fn scalar_subqueries_are_planned_and_reused() {
    let sub = || Expr::ScalarSubquery(Box::new(max_a()));
    let plan = LogicalPlan::table("t")
        .filter(Expr::binary(
            Expr::col("a").eq(sub()),
            BinaryOp::Or,
            Expr::col("a").gt(sub()),
        ))
        .project(vec![Expr::col("a")]);
    let pipeline = session(PipelineConfig::default()).pipeline(plan);
    let executed = pipeline.executed_plan().expect("executed");

    let subqueries = executed.subqueries();
    assert_eq!(subqueries.len(), 1);
    assert!(subqueries[0].name.starts_with("scalar-subquery#"));
    assert!(
        all_expressions(&executed)
            .iter()
            .any(|e| e.contains("ReusedSubquery scalar-subquery#")),
        "{}",
        executed.tree_string(25)
    );
    assert!(!executed
        .collect_nodes()
        .into_iter()
        .flat_map(|n| n.expressions())
        .any(|e| matches!(e, PhysExpr::ScalarSubqueryPlan(_))));

    assert_eq!(pipeline.collect().expect("rows"), vec![vec![Scalar::I32(3)]]);
}

#[test]
fn prepared_subquery_is_never_adaptive() {
    let session = session(PipelineConfig {
        adaptive_enabled: true,
        ..Default::default()
    });
    let optimized = session.pipeline(max_a()).optimized_plan().expect("optimized");
    let pipeline = session.pipeline(select_a_where_gt_1());
    let prepared = pipeline.prepare_subquery(&optimized).expect("prepared");
    assert!(!prepared.is_adaptive());
    assert_eq!(count(&prepared, "Exchange"), 1);
}

fn flags() -> impl Strategy<Value = PipelineConfig> {
    (any::<bool>(), any::<bool>(), any::<bool>(), any::<bool>(), 1usize..6).prop_map(
        |(codegen, reuse, pruning, columnar, shuffle)| PipelineConfig {
            codegen_enabled: codegen,
            exchange_reuse_enabled: reuse,
            dynamic_pruning_enabled: pruning,
            columnar_scans: columnar,
            shuffle_partitions: shuffle,
            ..Default::default()
        },
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn preparation_is_deterministic(config in flags(), pick in 0usize..3) {
        let plan = [doubled_aggregate_join(), fact_dim_join(), select_a_where_gt_1()][pick].clone();
        let session = session(config);
        let a = session.pipeline(plan.clone()).executed_plan().expect("executed");
        let b = session.pipeline(plan).executed_plan().expect("executed");
        prop_assert_eq!(a.as_ref(), b.as_ref());
        prop_assert!(!Arc::ptr_eq(&a, &b));
    }
}
