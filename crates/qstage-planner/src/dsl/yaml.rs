//! YAML → `LogicalPlan` for linear query documents.
//!
//! Example:
//! ```yaml
//! config: { shuffle_partitions: 2 }
//! tables:
//!   - name: t
//!     schema: [ {name: a, type: Int32}, {name: s, type: Utf8, nullable: true} ]
//!     rows: [ [0, x], [1, y], [2, ~] ]
//!   - name: events
//!     source: data/events.csv
//!     schema: [ {name: day, type: Int32}, {name: v, type: Int64} ]
//!     partition_column: day
//! subqueries:
//!   top: [ {op: scan, table: t}, {op: aggregate, aggs: ["max(a) as m"]} ]
//! query:
//!   - op: scan
//!     table: t
//!   - op: filter
//!     expr: "a > 1 OR a = $top"
//!   - op: project
//!     columns: ["a", "a * 2 as doubled"]
//! ```
//! Steps: `scan`, `filter`, `project`, `aggregate`, `join` (with a nested
//! step list for the right side), `sort`, `limit`. The first step of every
//! list must be a `scan`; only the first may be.

use std::collections::{BTreeMap, BTreeSet};

use qstage_core::catalog::TableDef;
use qstage_core::config::PipelineConfig;
use qstage_core::logical::{JoinType, LogicalPlan};
use qstage_core::schema::{DataType, Field, Schema};
use qstage_core::types::{Row, Scalar};
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

use super::expr::{parse_aggregate, parse_expr_with};
use super::DslError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryDoc {
    #[serde(default)]
    pub config: Option<Mapping>,
    #[serde(default)]
    pub tables: Vec<TableSpec>,
    #[serde(default)]
    pub subqueries: BTreeMap<String, Vec<Step>>,
    pub query: Vec<Step>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSpec {
    pub name: String,
    /// CSV file; when absent the table is built from `rows`.
    #[serde(default)]
    pub source: Option<String>,
    pub schema: Vec<FieldDef>,
    #[serde(default)]
    pub partition_column: Option<String>,
    #[serde(default)]
    pub streaming: bool,
    #[serde(default)]
    pub rows: Vec<Vec<Value>>,
    /// Round-robin partition count for unpartitioned tables.
    #[serde(default = "default_partitions")]
    pub partitions: usize,
}

fn default_partitions() -> usize {
    2
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    #[serde(default)]
    pub nullable: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinKind {
    #[default]
    Inner,
    Left,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "op")]
pub enum Step {
    Scan {
        table: String,
    },
    Filter {
        expr: String,
    },
    Project {
        columns: Vec<String>,
    },
    Aggregate {
        #[serde(default)]
        group_by: Vec<String>,
        #[serde(default)]
        aggs: Vec<String>,
    },
    Join {
        right: Vec<Step>,
        on: Vec<(String, String)>,
        #[serde(default)]
        join_type: JoinKind,
    },
    Sort {
        by: Vec<String>,
    },
    Limit {
        n: usize,
    },
}

impl TableSpec {
    pub fn schema(&self) -> Result<Schema, DslError> {
        let fields = self
            .schema
            .iter()
            .map(|f| {
                DataType::parse(&f.data_type)
                    .map(|dt| Field::new(f.name.clone(), dt, f.nullable))
                    .ok_or_else(|| self.error(format!("unknown type '{}'", f.data_type)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let schema = Schema::new(fields);
        if let Some(pc) = &self.partition_column {
            if schema.index_of(pc).is_none() {
                return Err(self.error(format!("partition column '{pc}' is not in the schema")));
            }
        }
        Ok(schema)
    }

    /// Build the table from inline `rows`. `None` for CSV-backed tables.
    pub fn inline_table(&self) -> Result<Option<TableDef>, DslError> {
        if self.source.is_some() {
            return Ok(None);
        }
        let schema = self.schema()?;
        let mut rows = Vec::with_capacity(self.rows.len());
        for (i, cells) in self.rows.iter().enumerate() {
            if cells.len() != schema.len() {
                return Err(self.error(format!(
                    "row {i} has {} values, expected {}",
                    cells.len(),
                    schema.len()
                )));
            }
            let row: Row = cells
                .iter()
                .zip(schema.fields.iter())
                .map(|(cell, field)| {
                    let text = cell_text(cell)
                        .ok_or_else(|| self.error(format!("row {i}: nested values are not supported")))?;
                    let v = Scalar::parse_as(&text, field.data_type)
                        .map_err(|e| self.error(format!("row {i}: {e}")))?;
                    if v.is_null() && !field.nullable {
                        return Err(self.error(format!("row {i}: null in non-nullable '{}'", field.name)));
                    }
                    Ok(v)
                })
                .collect::<Result<_, DslError>>()?;
            rows.push(row);
        }
        let table = TableDef::from_rows(
            self.name.clone(),
            schema,
            rows,
            self.partition_column.clone(),
            self.partitions,
        )
        .map_err(|e| self.error(e.to_string()))?;
        Ok(Some(table.streaming(self.streaming)))
    }

    fn error(&self, message: String) -> DslError {
        DslError::Table {
            table: self.name.clone(),
            message,
        }
    }
}

fn cell_text(v: &Value) -> Option<String> {
    match v {
        Value::Null => Some(String::new()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(s.clone()),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct ParsedQuery {
    pub plan: LogicalPlan,
    pub tables: Vec<TableSpec>,
    pub config: Option<Mapping>,
}

impl ParsedQuery {
    /// `base` with the document's `config:` block applied.
    pub fn config(&self, base: &PipelineConfig) -> Result<PipelineConfig, DslError> {
        match &self.config {
            Some(overrides) => apply_overrides(base, overrides),
            None => Ok(base.clone()),
        }
    }

    pub fn inline_tables(&self) -> Result<Vec<TableDef>, DslError> {
        let mut out = Vec::new();
        for t in &self.tables {
            if let Some(table) = t.inline_table()? {
                out.push(table);
            }
        }
        Ok(out)
    }
}

/// Overlay present keys of `overrides` on `base`. Unknown keys are errors.
pub fn apply_overrides(base: &PipelineConfig, overrides: &Mapping) -> Result<PipelineConfig, DslError> {
    let mut value = serde_yaml::to_value(base)?;
    let Value::Mapping(map) = &mut value else {
        return Err(DslError::Config("pipeline settings are not a mapping".into()));
    };
    for (k, v) in overrides {
        let key = k
            .as_str()
            .ok_or_else(|| DslError::Config("setting names must be strings".into()))?;
        if !map.contains_key(k) {
            return Err(DslError::Config(format!("unknown setting '{key}'")));
        }
        map.insert(k.clone(), v.clone());
    }
    let cfg: PipelineConfig = serde_yaml::from_value(value)?;
    cfg.validate().map_err(|e| DslError::Config(e.to_string()))?;
    Ok(cfg)
}

/// Parse a YAML query document.
pub fn parse_query(yaml_src: &str) -> Result<ParsedQuery, DslError> {
    let doc: QueryDoc = serde_yaml::from_str(yaml_src)?;

    let mut names = BTreeSet::new();
    for t in &doc.tables {
        t.schema()?;
        if !names.insert(t.name.as_str()) {
            return Err(t.error("declared more than once".into()));
        }
    }

    let mut subqueries = BTreeMap::new();
    for (name, steps) in &doc.subqueries {
        subqueries.insert(name.clone(), build_steps(steps, &|_| None)?);
    }
    let lookup = |name: &str| subqueries.get(name).cloned();
    let plan = build_steps(&doc.query, &lookup)?;

    Ok(ParsedQuery {
        plan,
        tables: doc.tables,
        config: doc.config,
    })
}

fn build_steps(
    steps: &[Step],
    subqueries: &dyn Fn(&str) -> Option<LogicalPlan>,
) -> Result<LogicalPlan, DslError> {
    let mut cur: Option<LogicalPlan> = None;

    for (index, step) in steps.iter().enumerate() {
        let step_err = |message: String| DslError::Step { index, message };
        cur = Some(match (step, cur) {
            (Step::Scan { table }, None) => LogicalPlan::table(table.clone()),
            (Step::Scan { .. }, Some(_)) => {
                return Err(step_err("only the first step may be a scan".into()))
            }
            (_, None) => return Err(step_err("the first step must be a scan".into())),
            (Step::Filter { expr }, Some(input)) => input.filter(parse_expr_with(expr, subqueries)?),
            (Step::Project { columns }, Some(input)) => {
                if columns.is_empty() {
                    return Err(step_err("project needs at least one column".into()));
                }
                let exprs = columns
                    .iter()
                    .map(|c| parse_expr_with(c, subqueries))
                    .collect::<Result<Vec<_>, _>>()?;
                input.project(exprs)
            }
            (Step::Aggregate { group_by, aggs }, Some(input)) => {
                let aggs = aggs
                    .iter()
                    .map(|a| parse_aggregate(a))
                    .collect::<Result<Vec<_>, _>>()?;
                input.aggregate(group_by.clone(), aggs)
            }
            (
                Step::Join {
                    right,
                    on,
                    join_type,
                },
                Some(input),
            ) => {
                if on.is_empty() {
                    return Err(step_err("join needs at least one key pair".into()));
                }
                let right = build_steps(right, subqueries)?;
                let jt = match join_type {
                    JoinKind::Inner => JoinType::Inner,
                    JoinKind::Left => JoinType::Left,
                };
                input.join(right, on.clone(), jt)
            }
            (Step::Sort { by }, Some(input)) => input.sort(by.clone()),
            (Step::Limit { n }, Some(input)) => input.limit(*n),
        });
    }

    cur.ok_or_else(|| DslError::Step {
        index: 0,
        message: "empty step list".into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use qstage_core::error::Error;

    const DOC: &str = r#"
config: { shuffle_partitions: 2, adaptive_enabled: true }
tables:
  - name: t
    schema: [ {name: a, type: Int32}, {name: s, type: Utf8, nullable: true} ]
    rows: [ [0, x], [1, y], [2, ~], [3, z] ]
subqueries:
  top: [ {op: scan, table: t}, {op: aggregate, aggs: ["max(a) as m"]} ]
query:
  - op: scan
    table: t
  - op: filter
    expr: "a > 1 OR a = $top"
  - op: project
    columns: ["a"]
  - op: limit
    n: 10
"#;

    #[test]
    fn parses_linear_query() {
        let q = parse_query(DOC).expect("parse");
        assert!(matches!(q.plan, LogicalPlan::Limit { n: 10, .. }));
        assert_eq!(q.plan.node_count(), 4);

        let tables = q.inline_tables().expect("tables");
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].row_count(), 4);
        assert_eq!(tables[0].partitions.len(), 2);
    }

    #[test]
    fn config_block_overrides_base() {
        let q = parse_query(DOC).expect("parse");
        let cfg = q.config(&PipelineConfig::default()).expect("config");
        assert_eq!(cfg.shuffle_partitions, 2);
        assert!(cfg.adaptive_enabled);
        assert_eq!(cfg.max_to_string_fields, 25);
    }

    #[test]
    fn unknown_setting_rejected() {
        let mut m = Mapping::new();
        m.insert(Value::from("no_such_knob"), Value::from(true));
        let err = apply_overrides(&PipelineConfig::default(), &m).expect_err("unknown");
        assert!(err.to_string().contains("no_such_knob"));
    }

    #[test]
    fn join_with_nested_right_side() {
        let q = parse_query(
            r#"
query:
  - {op: scan, table: f}
  - op: join
    right: [ {op: scan, table: d}, {op: filter, expr: "region = 'eu'"} ]
    on: [[day, day]]
    join_type: left
"#,
        )
        .expect("parse");
        match q.plan {
            LogicalPlan::Join { on, join_type, .. } => {
                assert_eq!(on, vec![("day".to_string(), "day".to_string())]);
                assert_eq!(join_type, JoinType::Left);
            }
            other => panic!("expected join, got {other:?}"),
        }
    }

    #[test]
    fn step_order_enforced() {
        let err = parse_query("query: [ {op: filter, expr: 'a > 1'} ]").expect_err("no scan");
        assert!(matches!(err, DslError::Step { index: 0, .. }));
        let err = parse_query("query: [ {op: scan, table: a}, {op: scan, table: b} ]")
            .expect_err("two scans");
        assert!(matches!(err, DslError::Step { index: 1, .. }));
    }

    #[test]
    fn bad_cells_surface_as_config_errors() {
        let q = parse_query(
            r#"
tables:
  - name: t
    schema: [ {name: a, type: Int32} ]
    rows: [ [oops] ]
query: [ {op: scan, table: t} ]
"#,
        )
        .expect("parse");
        let err: Error = q.inline_tables().expect_err("bad cell").into();
        assert!(matches!(err, Error::Config(m) if m.contains("cannot parse 'oops'")));
    }
}
