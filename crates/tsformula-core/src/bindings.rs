//! Python bindings: a formula engine over an in-memory series store.
//!
//! Timestamps cross the boundary as ISO strings, series as lists of
//! `(timestamp, value)` tuples and metadata as JSON text.

use std::path::PathBuf;

use chrono::{NaiveDateTime, TimeDelta};
use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;
use pyo3::types::PyDict;

use crate::engine::{Engine, EvalOptions, RegisterOptions};
use crate::models::{parse_timestamp, Series, Window};
use crate::store::series::MemoryStore;

type Points = Vec<(String, f64)>;

fn timestamp(text: &str) -> PyResult<NaiveDateTime> {
    parse_timestamp(text).ok_or_else(|| PyValueError::new_err(format!("bad timestamp `{text}`")))
}

fn optional_timestamp(text: Option<&str>) -> PyResult<Option<NaiveDateTime>> {
    text.map(timestamp).transpose()
}

fn json(text: Option<&str>) -> PyResult<Option<serde_json::Value>> {
    text.map(|t| {
        serde_json::from_str(t).map_err(|e| PyValueError::new_err(format!("bad metadata: {e}")))
    })
    .transpose()
}

fn points(series: &Series) -> Points {
    series
        .iter()
        .map(|(ts, v)| (ts.format("%Y-%m-%dT%H:%M:%S").to_string(), v))
        .collect()
}

fn eval_options(
    from_value_date: Option<&str>,
    to_value_date: Option<&str>,
    revision_date: Option<&str>,
) -> PyResult<EvalOptions> {
    let window = Window {
        from: optional_timestamp(from_value_date)?,
        to: optional_timestamp(to_value_date)?,
    };
    let mut options = EvalOptions::new().window(window);
    if let Some(revision) = optional_timestamp(revision_date)? {
        options = options.revision(revision);
    }
    Ok(options)
}

#[pyclass(name = "FormulaEngine")]
pub struct PyFormulaEngine {
    engine: Engine<MemoryStore>,
}

#[pymethods]
impl PyFormulaEngine {
    #[new]
    pub fn new(db_path: PathBuf) -> PyResult<Self> {
        Ok(Self {
            engine: Engine::new(MemoryStore::new(), db_path)?,
        })
    }

    /// Record a revision of a primary series.
    fn insert_series(&self, name: &str, insertion_date: &str, points: Points) -> PyResult<()> {
        let at = timestamp(insertion_date)?;
        let parsed = points
            .iter()
            .map(|(ts, v)| Ok((timestamp(ts)?, *v)))
            .collect::<PyResult<Vec<_>>>()?;
        self.engine.store().insert(name, at, parsed);
        Ok(())
    }

    #[pyo3(signature = (name, text, metadata=None, reject_unknown=true, update=false))]
    fn register_formula(
        &self,
        name: &str,
        text: &str,
        metadata: Option<&str>,
        reject_unknown: bool,
        update: bool,
    ) -> PyResult<i64> {
        let options = RegisterOptions {
            metadata: json(metadata)?,
            reject_unknown,
            update,
        };
        Ok(self.engine.register_formula(name, text, &options)?)
    }

    #[pyo3(signature = (text_or_name, from_value_date=None, to_value_date=None, revision_date=None))]
    fn eval_formula(
        &self,
        text_or_name: &str,
        from_value_date: Option<&str>,
        to_value_date: Option<&str>,
        revision_date: Option<&str>,
    ) -> PyResult<Points> {
        let options = eval_options(from_value_date, to_value_date, revision_date)?;
        Ok(points(&self.engine.eval_formula(text_or_name, &options)?))
    }

    /// Staircase view with a horizon of `delta_seconds`.
    #[pyo3(signature = (text_or_name, delta_seconds, from_value_date=None, to_value_date=None))]
    fn staircase(
        &self,
        text_or_name: &str,
        delta_seconds: i64,
        from_value_date: Option<&str>,
        to_value_date: Option<&str>,
    ) -> PyResult<Points> {
        let delta = TimeDelta::try_seconds(delta_seconds)
            .ok_or_else(|| PyValueError::new_err("delta out of range"))?;
        let options = eval_options(from_value_date, to_value_date, None)?;
        Ok(points(&self.engine.staircase(text_or_name, delta, &options)?))
    }

    fn formula(&self, name: &str) -> PyResult<Option<String>> {
        Ok(self.engine.formula(name)?)
    }

    fn expanded_formula(&self, name: &str) -> PyResult<Option<String>> {
        Ok(self.engine.expanded_formula(name)?)
    }

    fn list_formulas(&self) -> PyResult<Vec<String>> {
        Ok(self
            .engine
            .list_formulas()?
            .into_iter()
            .map(|record| record.name)
            .collect())
    }

    fn delete_formula(&self, name: &str) -> PyResult<bool> {
        Ok(self.engine.delete_formula(name)?)
    }

    fn dependencies(&self, name: &str) -> PyResult<Vec<String>> {
        Ok(self.engine.dependencies(name)?)
    }

    fn dependents(&self, name: &str) -> PyResult<Vec<String>> {
        Ok(self.engine.dependents(name)?)
    }

    fn rename_references(&self, old: &str, new: &str) -> PyResult<Vec<String>> {
        Ok(self.engine.rename_references(old, new)?)
    }

    /// Editor component rows as dicts.
    fn editor_info<'py>(
        &self,
        py: Python<'py>,
        name: &str,
    ) -> PyResult<Option<Vec<Bound<'py, PyDict>>>> {
        let Some(rows) = self.engine.editor_info(name)? else {
            return Ok(None);
        };
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let dict = PyDict::new(py);
            dict.set_item("name", row.name)?;
            dict.set_item("type", row.kind)?;
            dict.set_item("coef", row.coef)?;
            dict.set_item("keywords", row.keywords)?;
            dict.set_item("expression", row.expression)?;
            out.push(dict);
        }
        Ok(Some(out))
    }
}
