//! Error types for the formula engine.

/// Top-level error enum for the formula engine.
///
/// Evaluation-time variants carry the operator `path` inside the expression
/// tree (for instance `add/1/series`) so callers can point at the failing
/// node.
#[derive(Debug, thiserror::Error)]
pub enum FormulaError {
    #[error("parse error at {position}: {message}")]
    Parse { position: usize, message: String },

    #[error("unknown operator `{name}` at `{path}`")]
    UnknownOperator { name: String, path: String },

    #[error("unknown series {}", quoted(.names))]
    UnknownSeries { names: Vec<String> },

    #[error("operator `{name}` is already registered")]
    DuplicateOperator { name: String },

    #[error("arity mismatch for `{op}` at `{path}`: {message}")]
    ArityMismatch {
        op: String,
        path: String,
        message: String,
    },

    #[error("type mismatch for `{op}` at `{path}`: `{param}` expects {expected}, got {found}")]
    TypeMismatch {
        op: String,
        path: String,
        param: String,
        expected: String,
        found: String,
    },

    #[error("`{op}` at `{path}`: keywords `{first}` and `{second}` are mutually exclusive")]
    MutuallyExclusiveKeywords {
        op: String,
        path: String,
        first: String,
        second: String,
    },

    #[error("formula `{name}` already exists")]
    FormulaExists { name: String },

    #[error("formula `{name}` depends on itself")]
    CyclicFormula { name: String },

    #[error("evaluation of `{op}` at `{path}` failed: {message}")]
    Evaluation {
        op: String,
        path: String,
        message: String,
    },

    #[error("recursion limit {limit} exceeded at `{path}`")]
    RecursionLimit { limit: usize, path: String },

    #[error("deadline exceeded at `{path}`")]
    DeadlineExceeded { path: String },

    #[error("evaluation cancelled at `{path}`")]
    Cancelled { path: String },

    #[error("formula database changed while resolving (epoch {expected}, now {found})")]
    ConcurrentWrite { expected: i64, found: i64 },

    #[error("new name is already referenced by {}", quoted(.formulas))]
    RenameConflict { formulas: Vec<String> },

    #[error("unknown group formula `{name}`")]
    UnknownGroup { name: String },

    #[error("group `{name}` already exists")]
    GroupExists { name: String },

    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn quoted(names: &[String]) -> String {
    names
        .iter()
        .map(|n| format!("`{n}`"))
        .collect::<Vec<_>>()
        .join(", ")
}

impl FormulaError {
    pub(crate) fn parse(position: usize, message: impl Into<String>) -> Self {
        FormulaError::Parse {
            position,
            message: message.into(),
        }
    }

    pub(crate) fn evaluation(op: &str, path: &str, message: impl Into<String>) -> Self {
        FormulaError::Evaluation {
            op: op.to_string(),
            path: path.to_string(),
            message: message.into(),
        }
    }
}

#[cfg(feature = "python")]
impl From<FormulaError> for pyo3::PyErr {
    fn from(err: FormulaError) -> pyo3::PyErr {
        use pyo3::exceptions::{PyKeyError, PyRuntimeError, PyTimeoutError, PyValueError};
        match &err {
            FormulaError::Database(_) | FormulaError::Sqlite(_) | FormulaError::Io(_) => {
                PyRuntimeError::new_err(err.to_string())
            }
            FormulaError::UnknownSeries { .. }
            | FormulaError::UnknownOperator { .. }
            | FormulaError::UnknownGroup { .. } => PyKeyError::new_err(err.to_string()),
            FormulaError::DeadlineExceeded { .. } | FormulaError::Cancelled { .. } => {
                PyTimeoutError::new_err(err.to_string())
            }
            _ => PyValueError::new_err(err.to_string()),
        }
    }
}

pub type FormulaResult<T> = Result<T, FormulaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_series_lists_every_name() {
        let err = FormulaError::UnknownSeries {
            names: vec!["a".to_string(), "b".to_string()],
        };
        assert_eq!(err.to_string(), "unknown series `a`, `b`");
    }

    #[test]
    fn evaluation_error_names_the_path() {
        let err = FormulaError::evaluation("series", "add/1/series", "no such series `x`");
        assert!(err.to_string().contains("add/1/series"));
    }
}
