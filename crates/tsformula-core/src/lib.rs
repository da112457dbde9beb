//! tsformula core library: a formula engine for versioned time series.
//!
//! Formulas are Lisp-style expressions over named series. They are parsed,
//! type-checked against an extensible operator registry, stored with their
//! transitive dependency edges in SQLite, and evaluated against a primary
//! series store at any window and revision. A staircase view ("what was
//! known `delta` before each value date") is computed either by replaying
//! revisions or by pushing the staircase down to the leaves.
//!
//! With the `python` feature the crate also builds the `_tsformula_core`
//! extension module.

pub mod alias;
#[cfg(feature = "python")]
pub mod bindings;
pub mod config;
pub mod editor;
pub mod engine;
pub mod errors;
pub mod expr;
pub mod models;
pub mod ops;
pub mod query;
pub mod store;

pub use config::EngineConfig;
pub use engine::{Engine, EvalOptions, RegisterOptions};
pub use errors::{FormulaError, FormulaResult};
pub use expr::{parse, Call, Expr};
pub use models::{Series, SeriesMeta, Value, Window};
pub use ops::{OperatorRegistry, OperatorSpec};
pub use store::series::{MemoryStore, SeriesStore};

#[cfg(feature = "python")]
use pyo3::prelude::*;

// ---------------------------------------------------------------------------
// Top-level Python module: _tsformula_core
// ---------------------------------------------------------------------------

#[cfg(feature = "python")]
#[pymodule]
fn _tsformula_core(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<bindings::PyFormulaEngine>()?;

    m.add("SCHEMA_VERSION", store::schema::SCHEMA_VERSION)?;
    m.add("MAX_EVAL_DEPTH", query::guards::MAX_EVAL_DEPTH)?;
    m.add("MAX_RESOLVE_DEPTH", query::guards::MAX_RESOLVE_DEPTH)?;
    m.add("DEFAULT_CACHE_ENTRIES", query::guards::DEFAULT_CACHE_ENTRIES)?;

    Ok(())
}
