//! Diagnostic rendering: explain modes, partial failures, redaction and
//! file dumps.

mod common;

use std::fs;
use std::sync::Arc;

use common::*;
use qstage_core::config::PipelineConfig;
use qstage_core::error::Result;
use qstage_core::expr::Expr;
use qstage_core::logical::LogicalPlan;
use qstage_core::schema::{DataType, Field, Schema};
use qstage_core::tracker::PlanTracker;
use qstage_pipeline::{try_or_error, ExplainMode, Session, REDACTED};
use qstage_planner::Analyzer;

/// Body text following `header`, up to the next section header.
fn section<'a>(text: &'a str, header: &str) -> &'a str {
    let start = text
        .find(header)
        .unwrap_or_else(|| panic!("missing {header} in\n{text}"))
        + header.len();
    let body = &text[start..];
    match body.find("\n== ") {
        Some(end) => &body[..end],
        None => body,
    }
}

#[test]
fn failing_analysis_renders_in_place() {
    let query = LogicalPlan::table("t").filter(Expr::col("nope").gt(int(1)));
    let pipeline = session(PipelineConfig::default()).pipeline(query);
    let text = pipeline.explain_string(ExplainMode::Extended);

    assert!(section(&text, "== Parsed Logical Plan ==").contains("'nope"), "{text}");
    for header in [
        "== Analyzed Logical Plan ==",
        "== Optimized Logical Plan ==",
        "== Physical Plan ==",
    ] {
        let body = section(&text, header);
        assert!(body.contains("Analysis error:"), "{header}: {body}");
        assert!(body.contains("nope"), "{header}: {body}");
    }
}

struct GhostAnalyzer;

impl Analyzer for GhostAnalyzer {
    fn analyze(&self, _plan: &LogicalPlan, _tracker: &PlanTracker) -> Result<LogicalPlan> {
        Ok(LogicalPlan::Relation {
            table: "ghost".into(),
            schema: Schema::new(vec![Field::new("a", DataType::Int32, false)]),
            partition_column: None,
            streaming: false,
        })
    }
}

#[test]
fn failing_statistics_render_in_place() {
    let session = Session::builder(catalog())
        .analyzer(Arc::new(GhostAnalyzer))
        .build()
        .expect("session");
    let text = session
        .pipeline(LogicalPlan::table("t"))
        .explain_string(ExplainMode::Cost);

    let optimized = section(&text, "== Optimized Logical Plan ==");
    assert!(
        optimized.contains("no statistics available for 'ghost'"),
        "{text}"
    );
    assert!(!optimized.contains("Statistics(sizeInBytes="), "{text}");
    assert!(text.contains("== Physical Plan =="), "{text}");
}

#[test]
fn try_or_error_appends_a_newline() {
    assert_eq!(try_or_error(|| Ok("plan\n".into())), "plan\n");
    assert_eq!(
        try_or_error(|| Err(qstage_core::error::Error::Render("boom".into()))),
        "Render error: boom\n"
    );
}

#[test]
fn simple_mode_is_only_the_physical_plan() {
    let text = session(PipelineConfig::default())
        .pipeline(select_a_where_gt_1())
        .explain_string(ExplainMode::Simple);
    assert!(text.starts_with("== Physical Plan =="), "{text}");
    assert!(!text.contains("Logical Plan"), "{text}");
}

#[test]
fn codegen_mode_reflects_final_adaptive_plan() {
    let pipeline = session(PipelineConfig {
        adaptive_enabled: true,
        ..Default::default()
    })
    .pipeline(doubled_aggregate_join());
    let text = pipeline.explain_string(ExplainMode::Codegen);
    assert!(text.starts_with("Found "), "{text}");
    assert!(pipeline.execution_handle().expect("handle").is_finalized());
}

#[test]
fn dump_has_every_section_and_is_redacted() {
    let config = PipelineConfig {
        redaction_pattern: Some("\\bt\\b".into()),
        ..Default::default()
    };
    let pipeline = session(config).pipeline(select_a_where_gt_1());
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("query.txt");
    pipeline.debug().to_file(&path).expect("dump");

    let text = fs::read_to_string(&path).expect("read");
    for header in [
        "== Parsed Logical Plan ==",
        "== Analyzed Logical Plan ==",
        "== Optimized Logical Plan ==",
        "== Physical Plan ==",
        "== Fused Stage Codegen ==",
        "Found 1 fused stages.",
    ] {
        assert!(text.contains(header), "missing {header} in\n{text}");
    }
    assert!(text.contains(REDACTED), "{text}");
    assert_eq!(text, pipeline.debug().to_text());
}
