use thiserror::Error;

/// Canonical result for qstage.
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy shared by every stage of the pipeline.
///
/// `Clone` is required: a poisoned stage cell hands the same error to every
/// later caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Unresolved or type-invalid plan. Terminal for the pipeline.
    #[error("Analysis error: {0}")]
    Analysis(String),

    /// Valid plan that uses a construct the execution mode cannot run.
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// No physical candidate, or a rule failed to plan a subquery.
    #[error("Planning error: {0}")]
    Planning(String),

    /// Failure inside diagnostic rendering only; callers inline it as text.
    #[error("Render error: {0}")]
    Render(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    // The core crate does not do I/O, but higher layers map their I/O
    // errors into this variant.
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Internal invariant failed: {0}")]
    Invariant(String),
}

impl Error {
    /// Stable label for log fields and exit codes.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Analysis(_) => "analysis",
            Error::Unsupported(_) => "unsupported",
            Error::Planning(_) => "planning",
            Error::Render(_) => "render",
            Error::Execution(_) => "execution",
            Error::Cancelled(_) => "cancelled",
            Error::Config(_) => "config",
            Error::Io(_) => "io",
            Error::Invariant(_) => "invariant",
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Invariant(format!("serialization: {e}"))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}
