//! qstage CLI: validate, explain and run YAML query documents.

use clap::{Parser, Subcommand};
use qstage_core::catalog::Catalog;
use qstage_core::config::PipelineConfig;
use qstage_exec::readers::{load_csv_table, write_csv};
use qstage_pipeline::{ExplainMode, Session};
use qstage_planner::dsl::{parse_query, ParsedQuery};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "qstage")]
#[command(about = "Staged query compilation: analyze, optimize, plan, prepare and run", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse a query document and analyze it against its tables
    Validate {
        /// Path to the query YAML file
        #[arg(short, long)]
        query: PathBuf,
    },

    /// Print the plans of every compilation stage
    Explain {
        /// Path to the query YAML file
        #[arg(short, long)]
        query: PathBuf,

        /// simple, extended, codegen or cost
        #[arg(long, default_value = "extended")]
        mode: ExplainMode,
    },

    /// Run a query and print its result as CSV
    Run {
        /// Path to the query YAML file
        #[arg(short, long)]
        query: PathBuf,

        /// Enable adaptive execution (overrides config)
        #[arg(long)]
        adaptive: bool,

        /// Shuffle partition count (overrides config)
        #[arg(long)]
        shuffle_partitions: Option<usize>,
    },

    /// Write the full diagnostic dump of a query to a file
    Dump {
        /// Path to the query YAML file
        #[arg(short, long)]
        query: PathBuf,

        /// Output file
        #[arg(short, long)]
        output: PathBuf,
    },
}

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    let cli = Cli::parse();

    let outcome = match cli.command {
        Commands::Validate { query } => validate_query(&query).map(|tables| {
            println!("✓ Query is valid ({tables} tables)");
        }),
        Commands::Explain { query, mode } => explain_query(&query, mode),
        Commands::Run {
            query,
            adaptive,
            shuffle_partitions,
        } => run_query(&query, adaptive, shuffle_partitions),
        Commands::Dump { query, output } => dump_query(&query, &output).map(|()| {
            println!("✓ Wrote {}", output.display());
        }),
    };

    if let Err(e) = outcome {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn validate_query(path: &Path) -> CliResult<usize> {
    let (parsed, session) = load(path, |_| {})?;
    let pipeline = session.pipeline(parsed.plan);
    pipeline.assert_analyzed()?;
    Ok(parsed.tables.len())
}

fn explain_query(path: &Path, mode: ExplainMode) -> CliResult<()> {
    let (parsed, session) = load(path, |_| {})?;
    print!("{}", session.pipeline(parsed.plan).explain_string(mode));
    Ok(())
}

fn run_query(path: &Path, adaptive: bool, shuffle_partitions: Option<usize>) -> CliResult<()> {
    let (parsed, session) = load(path, |cfg| {
        if adaptive {
            cfg.adaptive_enabled = true;
        }
        if let Some(n) = shuffle_partitions {
            cfg.shuffle_partitions = n;
        }
    })?;
    let pipeline = session.pipeline(parsed.plan);
    let rows = pipeline.collect()?;
    let schema = pipeline.executed_plan()?.schema();
    write_csv(io::stdout().lock(), &schema, &rows)?;
    tracing::info!(query_id = %pipeline.query_id(), rows = rows.len(), "query finished");
    Ok(())
}

fn dump_query(path: &Path, output: &Path) -> CliResult<()> {
    let (parsed, session) = load(path, |_| {})?;
    session.pipeline(parsed.plan).debug().to_file(output)?;
    Ok(())
}

/// Parse the document at `path`, register its tables and build a session.
/// Config precedence: environment, then the document's `config:` block,
/// then `overrides`.
fn load(
    path: &Path,
    overrides: impl FnOnce(&mut PipelineConfig),
) -> CliResult<(ParsedQuery, Arc<Session>)> {
    let source = fs::read_to_string(path)?;
    let parsed = parse_query(&source)?;

    let mut config = parsed.config(&PipelineConfig::from_env())?;
    overrides(&mut config);
    config.validate()?;

    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    let catalog = build_catalog(&parsed, base_dir)?;
    let session = Session::new(Arc::new(catalog), config)?;
    Ok((parsed, session))
}

/// CSV sources are resolved relative to the query file.
fn build_catalog(parsed: &ParsedQuery, base_dir: &Path) -> CliResult<Catalog> {
    let catalog = Catalog::new();
    for table in parsed.inline_tables()? {
        catalog.register(table);
    }
    for spec in &parsed.tables {
        let Some(source) = &spec.source else {
            continue;
        };
        let table = load_csv_table(
            &spec.name,
            base_dir.join(source),
            spec.schema()?,
            spec.partition_column.clone(),
            spec.partitions,
        )?;
        catalog.register(table.streaming(spec.streaming));
    }
    Ok(catalog)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const QUERY: &str = r#"
config: { shuffle_partitions: 3 }
tables:
  - name: t
    schema: [ {name: a, type: Int32} ]
    rows: [ [1], [2], [3] ]
  - name: events
    source: events.csv
    schema: [ {name: a, type: Int32}, {name: v, type: Int64} ]
query:
  - op: scan
    table: t
  - op: filter
    expr: "a > 1"
"#;

    fn write_query(dir: &Path) -> PathBuf {
        let mut csv = fs::File::create(dir.join("events.csv")).expect("csv");
        writeln!(csv, "a,v\n1,10\n2,20").expect("write");
        let path = dir.join("query.yaml");
        fs::write(&path, QUERY).expect("yaml");
        path
    }

    #[test]
    fn load_registers_inline_and_csv_tables() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_query(dir.path());
        let (_, session) = load(&path, |_| {}).expect("load");
        assert_eq!(session.catalog().table_names(), vec!["events", "t"]);
        assert_eq!(session.catalog().row_count("events"), Some(2));
        assert_eq!(session.config().shuffle_partitions, 3);
    }

    #[test]
    fn flag_overrides_win_over_document_config() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_query(dir.path());
        let (_, session) = load(&path, |cfg| cfg.shuffle_partitions = 5).expect("load");
        assert_eq!(session.config().shuffle_partitions, 5);
    }

    #[test]
    fn validate_and_dump() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_query(dir.path());
        assert_eq!(validate_query(&path).expect("valid"), 2);

        let out = dir.path().join("dump.txt");
        dump_query(&path, &out).expect("dump");
        let text = fs::read_to_string(out).expect("read");
        assert!(text.contains("== Parsed Logical Plan =="));
        assert!(text.contains("== Fused Stage Codegen =="));
    }

    #[test]
    fn missing_csv_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("query.yaml");
        fs::write(&path, QUERY).expect("yaml");
        assert!(load(&path, |_| {}).is_err());
    }
}
