//! Diagnostic rendering of a pipeline.
//!
//! Rendering never fails. Each section is produced through
//! [`try_or_error`], so a stage that cannot be computed shows up as its
//! error text in place of its plan while the other sections still render.
//! Output is produced one section (header plus body) at a time, and each
//! section goes through the session's redaction before it reaches a string
//! or a file, so both carry identical text.

use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::str::FromStr;

use qstage_core::error::Result;
use qstage_core::physical::{PhysExpr, PhysicalPlan};
use qstage_core::tree::truncated_list;
use qstage_planner::stats::logical_stats;

use crate::pipeline::CompilationPipeline;
use crate::prepare::stage_chain;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExplainMode {
    /// Physical plan only.
    Simple,
    /// Parsed, analyzed, optimized and physical plans.
    #[default]
    Extended,
    /// Fused stages of the final plan with their generated code.
    Codegen,
    /// Optimized plan annotated with statistics, then the physical plan.
    Cost,
}

impl FromStr for ExplainMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "simple" => Ok(ExplainMode::Simple),
            "extended" => Ok(ExplainMode::Extended),
            "codegen" => Ok(ExplainMode::Codegen),
            "cost" => Ok(ExplainMode::Cost),
            other => Err(format!(
                "unknown explain mode '{other}' (expected simple, extended, codegen or cost)"
            )),
        }
    }
}

impl fmt::Display for ExplainMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExplainMode::Simple => "simple",
            ExplainMode::Extended => "extended",
            ExplainMode::Codegen => "codegen",
            ExplainMode::Cost => "cost",
        })
    }
}

/// Body of a section, or the error text when it cannot be produced.
pub fn try_or_error<F>(f: F) -> String
where
    F: FnOnce() -> Result<String>,
{
    match f() {
        Ok(s) => s,
        Err(e) => format!("{e}\n"),
    }
}

type Sink<'a> = dyn FnMut(&str) -> Result<()> + 'a;

// Header and body go to the sink as one chunk.
fn section<F>(sink: &mut Sink<'_>, header: &str, body: F) -> Result<()>
where
    F: FnOnce() -> Result<String>,
{
    sink(&format!("{header}{}", try_or_error(body)))
}

impl CompilationPipeline {
    /// Redacted rendering in `mode` with the configured field limit.
    pub fn explain_string(&self, mode: ExplainMode) -> String {
        let mut out = String::new();
        let max_fields = self.session().config().max_to_string_fields;
        let session = self.session();
        let result = self.render(mode, max_fields, &mut |chunk: &str| {
            out.push_str(&session.redact(chunk));
            Ok(())
        });
        if let Err(e) = result {
            out.push_str(&session.redact(&e.to_string()));
        }
        out
    }

    pub fn debug(&self) -> PipelineDebug<'_> {
        PipelineDebug { pipeline: self }
    }

    fn render(&self, mode: ExplainMode, max_fields: usize, sink: &mut Sink<'_>) -> Result<()> {
        match mode {
            ExplainMode::Simple => self.physical_section(max_fields, sink),
            ExplainMode::Extended => {
                self.logical_sections(max_fields, sink)?;
                self.physical_section(max_fields, sink)
            }
            ExplainMode::Codegen => sink(&try_or_error(|| self.codegen_dump())),
            ExplainMode::Cost => {
                section(sink, "== Optimized Logical Plan ==\n", || {
                    self.cost_tree(max_fields)
                })?;
                self.physical_section(max_fields, sink)
            }
        }
    }

    fn logical_sections(&self, max_fields: usize, sink: &mut Sink<'_>) -> Result<()> {
        section(sink, "== Parsed Logical Plan ==\n", || {
            Ok(self.logical().tree_string(max_fields))
        })?;
        section(sink, "== Analyzed Logical Plan ==\n", || {
            let analyzed = self.analyzed()?;
            let schema = analyzed.schema()?;
            Ok(format!(
                "{}\n{}",
                truncated_list(schema.fields.iter().map(|f| f.to_string()), max_fields),
                analyzed.tree_string(max_fields)
            ))
        })?;
        section(sink, "== Optimized Logical Plan ==\n", || {
            Ok(self.optimized_plan()?.tree_string(max_fields))
        })
    }

    fn physical_section(&self, max_fields: usize, sink: &mut Sink<'_>) -> Result<()> {
        section(sink, "== Physical Plan ==\n", || {
            Ok(self.executed_plan()?.tree_string(max_fields))
        })
    }

    fn cost_tree(&self, max_fields: usize) -> Result<String> {
        let optimized = self.optimized_plan()?;
        let catalog = self.session().catalog();
        // a failure at the root replaces the whole tree
        logical_stats(&optimized, catalog)?;
        Ok(optimized.tree_string_with(max_fields, &|node| {
            match logical_stats(node, catalog) {
                Ok(stats) => stats.to_string(),
                Err(e) => e.to_string(),
            }
        }))
    }

    fn codegen_dump(&self) -> Result<String> {
        let final_plan = self.execution_handle()?.final_plan()?;
        let mut stages = Vec::new();
        fused_stages(&final_plan, &mut stages);
        let total = stages.len();
        let mut out = format!("Found {total} fused stages.\n");
        for (i, stage) in stages.into_iter().enumerate() {
            out.push_str(&format!("== Fused Stage {} / {total} ==\n", i + 1));
            out.push_str(&stage.tree_string(usize::MAX));
            out.push_str("\nGenerated code:\n");
            out.push_str(&generated_code(stage));
            out.push('\n');
        }
        Ok(out)
    }
}

/// The closed set of debugging outputs of a pipeline.
#[derive(Debug, Clone, Copy)]
pub struct PipelineDebug<'a> {
    pipeline: &'a CompilationPipeline,
}

impl PipelineDebug<'_> {
    /// Extended rendering plus the codegen dump, with no field limit.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        let session = self.pipeline.session();
        // the sink cannot fail
        let _ = self.write_all(&mut |chunk: &str| {
            out.push_str(&session.redact(chunk));
            Ok(())
        });
        out
    }

    /// Write [`to_text`](Self::to_text) to `path` incrementally.
    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut writer = BufWriter::new(File::create(path)?);
        let session = self.pipeline.session();
        self.write_all(&mut |chunk: &str| {
            writer.write_all(session.redact(chunk).as_bytes())?;
            Ok(())
        })?;
        writer.flush()?;
        tracing::debug!(path = %path.display(), "pipeline debug dump written");
        Ok(())
    }

    pub fn codegen(&self) -> String {
        self.pipeline.explain_string(ExplainMode::Codegen)
    }

    fn write_all(&self, sink: &mut Sink<'_>) -> Result<()> {
        self.pipeline.render(ExplainMode::Extended, usize::MAX, sink)?;
        section(sink, "\n== Fused Stage Codegen ==\n", || self.pipeline.codegen_dump())
    }
}

// Pre-order, entering adaptive wrappers and subquery plans.
fn fused_stages<'a>(plan: &'a PhysicalPlan, out: &mut Vec<&'a PhysicalPlan>) {
    if matches!(plan, PhysicalPlan::FusedStage { .. }) {
        out.push(plan);
    }
    for e in plan.expressions() {
        for sub in e.subqueries() {
            fused_stages(&sub.plan, out);
        }
    }
    if let PhysicalPlan::AdaptivePlan { input_plan, .. } = plan {
        fused_stages(input_plan, out);
    }
    for c in plan.children() {
        fused_stages(c, out);
    }
}

fn generated_code(stage: &PhysicalPlan) -> String {
    let id = match stage {
        PhysicalPlan::FusedStage { stage_id, .. } => stage_id.get(),
        _ => 0,
    };
    let mut code = format!("fn stage_{id}_process(row) {{\n");
    for op in stage_chain(stage).into_iter().rev() {
        match op {
            PhysicalPlan::Filter { predicate, .. } => {
                code.push_str(&format!("    if !({predicate}) {{ return; }}\n"));
            }
            PhysicalPlan::Project { exprs, .. } => {
                let items: Vec<String> = exprs.iter().map(PhysExpr::to_string).collect();
                code.push_str(&format!("    row = [{}];\n", items.join(", ")));
            }
            _ => {}
        }
    }
    code.push_str("    emit(row);\n}\n");
    code
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use qstage_core::catalog::{Catalog, TableDef};
    use qstage_core::config::PipelineConfig;
    use qstage_core::expr::Expr;
    use qstage_core::logical::LogicalPlan;
    use qstage_core::schema::{DataType, Field, Schema};
    use qstage_core::types::Scalar;

    use super::*;
    use crate::session::{Session, REDACTED};

    fn session(config: PipelineConfig) -> Arc<Session> {
        let catalog = Catalog::new();
        let schema = Schema::new(vec![
            Field::new("a", DataType::Int32, false),
            Field::new("secret_col", DataType::Utf8, false),
        ]);
        let rows = (0..4)
            .map(|i| vec![Scalar::I32(i), Scalar::Str(format!("s{i}"))])
            .collect();
        catalog.register(TableDef::from_rows("t", schema, rows, None, 2).expect("table"));
        Session::new(Arc::new(catalog), config).expect("session")
    }

    fn query() -> LogicalPlan {
        LogicalPlan::table("t")
            .filter(Expr::col("a").gt(Expr::lit(Scalar::I32(1))))
            .project(vec![Expr::col("a"), Expr::col("secret_col")])
    }

    #[test]
    fn mode_parses_case_insensitively() {
        assert_eq!("COST".parse::<ExplainMode>(), Ok(ExplainMode::Cost));
        assert!("verbose".parse::<ExplainMode>().is_err());
        assert_eq!(ExplainMode::default().to_string(), "extended");
    }

    #[test]
    fn extended_has_every_section_in_order() {
        let text = session(PipelineConfig::default())
            .pipeline(query())
            .explain_string(ExplainMode::Extended);
        let positions: Vec<usize> = [
            "== Parsed Logical Plan ==",
            "== Analyzed Logical Plan ==",
            "== Optimized Logical Plan ==",
            "== Physical Plan ==",
        ]
        .iter()
        .map(|h| text.find(h).unwrap_or_else(|| panic!("missing {h} in\n{text}")))
        .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "{text}");
        assert!(text.contains("[a: int, secret_col: string]"), "{text}");
    }

    #[test]
    fn failing_stage_renders_as_error_text() {
        let text = session(PipelineConfig::default())
            .pipeline(LogicalPlan::table("missing"))
            .explain_string(ExplainMode::Extended);
        assert!(text.contains("== Parsed Logical Plan =="));
        assert!(text.contains("Analysis error"), "{text}");
        assert!(text.contains("== Physical Plan =="));
    }

    #[test]
    fn cost_mode_annotates_statistics() {
        let text = session(PipelineConfig::default())
            .pipeline(query())
            .explain_string(ExplainMode::Cost);
        assert!(text.contains("Statistics(sizeInBytes="), "{text}");
        assert!(text.contains("rowCount=4"), "{text}");
    }

    #[test]
    fn codegen_lists_fused_stages() {
        let text = session(PipelineConfig::default())
            .pipeline(query())
            .debug()
            .codegen();
        assert!(text.starts_with("Found 1 fused stages."), "{text}");
        assert!(text.contains("fn stage_1_process(row)"), "{text}");
        assert!(text.contains("if !((a > 1)) { return; }"), "{text}");
        assert!(text.contains("row = [a, secret_col];"), "{text}");
    }

    #[test]
    fn output_is_redacted() {
        let config = PipelineConfig {
            redaction_pattern: Some("secret_[a-z]+".into()),
            ..Default::default()
        };
        let pipeline = session(config).pipeline(query());
        for text in [
            pipeline.explain_string(ExplainMode::Extended),
            pipeline.debug().to_text(),
            pipeline.debug().codegen(),
        ] {
            assert!(!text.contains("secret_col"), "{text}");
            assert!(text.contains(REDACTED));
        }
    }

    #[test]
    fn file_dump_matches_text_dump() {
        let pipeline = session(PipelineConfig::default()).pipeline(query());
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("dump.txt");
        pipeline.debug().to_file(&path).expect("dump");
        let written = std::fs::read_to_string(&path).expect("read");
        assert_eq!(written, pipeline.debug().to_text());
        assert!(written.contains("== Fused Stage Codegen =="));

        let missing = dir.path().join("no-such-dir").join("dump.txt");
        let err = pipeline.debug().to_file(missing).expect_err("unwritable");
        assert!(matches!(err, qstage_core::error::Error::Io(_)), "{err}");
    }

    #[test]
    fn match_spanning_header_and_body_is_redacted_in_file() {
        let config = PipelineConfig {
            redaction_pattern: Some("Physical Plan ==\\n\\S+".into()),
            ..Default::default()
        };
        let pipeline = session(config).pipeline(query());
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("dump.txt");
        pipeline.debug().to_file(&path).expect("dump");
        let written = std::fs::read_to_string(&path).expect("read");

        assert!(!written.contains("Physical Plan ==\n"), "{written}");
        assert!(written.contains(&format!("== {REDACTED}")), "{written}");
        assert_eq!(written, pipeline.debug().to_text());
    }
}
