//! YAML query documents.
//!
//! A document declares tables (inline rows or a CSV source), optional named
//! scalar subqueries, a linear list of query steps, and an optional
//! `config:` block overriding pipeline settings. See [`yaml`] for the
//! format.

pub mod expr;
pub mod yaml;

use qstage_core::error::Error;

pub use expr::{parse_aggregate, parse_expr, parse_expr_with};
pub use yaml::{
    apply_overrides, parse_query, FieldDef, JoinKind, ParsedQuery, QueryDoc, Step, TableSpec,
};

#[derive(Debug, thiserror::Error)]
pub enum DslError {
    #[error("yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("expression '{input}' at offset {offset}: {message}")]
    Expr {
        input: String,
        offset: usize,
        message: String,
    },

    #[error("step {index}: {message}")]
    Step { index: usize, message: String },

    #[error("table '{table}': {message}")]
    Table { table: String, message: String },

    #[error("config: {0}")]
    Config(String),
}

impl From<DslError> for Error {
    fn from(e: DslError) -> Self {
        Error::Config(format!("invalid query document: {e}"))
    }
}
