use qstage_core::error::Error;
use thiserror::Error;

/// Failures raised while running a physical plan.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("{op} cannot consume columnar input (missing ColumnarToRow)")]
    ColumnarInput { op: &'static str },

    #[error("{op} expects columnar input")]
    RowInput { op: &'static str },

    #[error("table not found at execution time: {0}")]
    MissingTable(String),

    #[error("column '{0}' not found in operator input")]
    MissingColumn(String),

    #[error("more than one row returned by a subquery used as an expression ({id})")]
    SubqueryCardinality { id: String },

    #[error("no plan registered for {0}")]
    UnknownReference(String),

    #[error("{0}")]
    Eval(String),

    #[error("invalid physical plan: {0}")]
    Invalid(String),

    #[error("csv: {0}")]
    Csv(#[from] csv::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ExecError> for Error {
    fn from(e: ExecError) -> Self {
        match e {
            ExecError::Io(io) => Error::Io(io.to_string()),
            other => Error::Execution(other.to_string()),
        }
    }
}

pub type ExecResult<T> = std::result::Result<T, ExecError>;
