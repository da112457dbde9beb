//! Declared operator signatures, argument binding and type checks.

use std::collections::BTreeMap;

use chrono::NaiveDateTime;

use crate::errors::{FormulaError, FormulaResult};
use crate::expr::Call;
use crate::models::{parse_timestamp, FillPolicy, Series, Value};
use crate::query::context::QueryContext;
use crate::query::interpreter::Interpreter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    Any,
    Bool,
    Int,
    Number,
    Str,
    Timestamp,
    Series,
    NumberOrSeries,
    /// A fill policy: a number or a `"ffill"`/`"bfill"` string.
    Fill,
}

impl ParamType {
    pub fn describe(self) -> &'static str {
        match self {
            ParamType::Any => "any value",
            ParamType::Bool => "bool",
            ParamType::Int => "int",
            ParamType::Number => "number",
            ParamType::Str => "string",
            ParamType::Timestamp => "timestamp",
            ParamType::Series => "series",
            ParamType::NumberOrSeries => "number or series",
            ParamType::Fill => "fill policy",
        }
    }

    /// Check `value` against this type, converting where the language allows
    /// it (a date string where a timestamp is expected). Gives the value back
    /// on mismatch.
    fn coerce(self, value: Value) -> Result<Value, Value> {
        match (self, value) {
            (ParamType::Any, v) => Ok(v),
            (ParamType::Bool, v @ Value::Bool(_)) => Ok(v),
            (ParamType::Int, v @ Value::Int(_)) => Ok(v),
            (ParamType::Number, v @ (Value::Int(_) | Value::Float(_))) => Ok(v),
            (ParamType::Str, v @ Value::Str(_)) => Ok(v),
            (ParamType::Timestamp, v @ Value::Timestamp(_)) => Ok(v),
            (ParamType::Timestamp, Value::Str(s)) => match parse_timestamp(&s) {
                Some(ts) => Ok(Value::Timestamp(ts)),
                None => Err(Value::Str(s)),
            },
            (ParamType::Series, v @ Value::Series(_)) => Ok(v),
            (ParamType::NumberOrSeries, v @ (Value::Int(_) | Value::Float(_) | Value::Series(_))) => {
                Ok(v)
            }
            (ParamType::Fill, v @ (Value::Int(_) | Value::Float(_))) => Ok(v),
            (ParamType::Fill, Value::Str(s)) => match FillPolicy::parse(&s) {
                Some(_) => Ok(Value::Str(s)),
                None => Err(Value::Str(s)),
            },
            (_, v) => Err(v),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Param {
    pub name: &'static str,
    pub ty: ParamType,
    /// `None` means required.
    pub default: Option<Value>,
}

impl Param {
    pub fn required(name: &'static str, ty: ParamType) -> Self {
        Self {
            name,
            ty,
            default: None,
        }
    }

    /// Optional parameter defaulting to nil.
    pub fn optional(name: &'static str, ty: ParamType) -> Self {
        Self::with_default(name, ty, Value::Nil)
    }

    pub fn with_default(name: &'static str, ty: ParamType, default: Value) -> Self {
        Self {
            name,
            ty,
            default: Some(default),
        }
    }
}

/// Positional parameters, an optional variadic tail and keyword parameters.
#[derive(Debug, Clone, Default)]
pub struct Signature {
    pub positional: Vec<Param>,
    pub variadic: Option<Param>,
    pub min_variadic: usize,
    pub keywords: Vec<Param>,
}

impl Signature {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg(mut self, param: Param) -> Self {
        self.positional.push(param);
        self
    }

    pub fn variadic(mut self, param: Param, min: usize) -> Self {
        self.variadic = Some(param);
        self.min_variadic = min;
        self
    }

    pub fn keyword(mut self, param: Param) -> Self {
        self.keywords.push(param);
        self
    }

    fn required_positional(&self) -> usize {
        let leading = self
            .positional
            .iter()
            .take_while(|p| p.default.is_none())
            .count();
        if leading == self.positional.len() {
            leading + self.min_variadic
        } else {
            leading
        }
    }

    /// Static shape check of a call: positional count and keyword names.
    pub fn check_call(&self, call: &Call, path: &str) -> FormulaResult<()> {
        self.check_shape(&call.op, path, call.args.len(), call.kwargs.keys())
    }

    fn check_shape<'k>(
        &self,
        op: &str,
        path: &str,
        given: usize,
        keywords: impl Iterator<Item = &'k String>,
    ) -> FormulaResult<()> {
        let required = self.required_positional();
        let arity = |message: String| FormulaError::ArityMismatch {
            op: op.to_string(),
            path: path.to_string(),
            message,
        };
        if given < required {
            return Err(arity(format!(
                "expected at least {required} positional arguments, got {given}"
            )));
        }
        if self.variadic.is_none() && given > self.positional.len() {
            return Err(arity(format!(
                "expected at most {} positional arguments, got {given}",
                self.positional.len()
            )));
        }
        for name in keywords {
            if !self.keywords.iter().any(|p| p.name == name) {
                return Err(arity(format!("unknown keyword `#:{name}`")));
            }
        }
        Ok(())
    }

    /// Bind evaluated arguments to the declared parameters, filling defaults
    /// and checking types.
    pub fn bind(
        &self,
        op: &str,
        path: &str,
        positional: Vec<Value>,
        mut keywords: BTreeMap<String, Value>,
    ) -> FormulaResult<(Vec<Value>, BTreeMap<&'static str, Value>)> {
        self.check_shape(op, path, positional.len(), keywords.keys())?;
        let mismatch = |param: &Param, found: &Value| FormulaError::TypeMismatch {
            op: op.to_string(),
            path: path.to_string(),
            param: param.name.to_string(),
            expected: param.ty.describe().to_string(),
            found: found.type_name().to_string(),
        };
        let check = |param: &Param, value: Value| -> FormulaResult<Value> {
            if value.is_nil() && param.default.is_some() {
                return Ok(value);
            }
            param.ty.coerce(value).map_err(|v| mismatch(param, &v))
        };

        let mut bound = Vec::with_capacity(positional.len().max(self.positional.len()));
        let mut given = positional.into_iter();
        for param in &self.positional {
            match given.next() {
                Some(value) => bound.push(check(param, value)?),
                // check_shape guarantees a default here
                None => bound.push(param.default.clone().unwrap_or(Value::Nil)),
            }
        }
        if let Some(rest) = &self.variadic {
            for value in given {
                bound.push(check(rest, value)?);
            }
        }

        let mut bound_kw = BTreeMap::new();
        for param in &self.keywords {
            let value = match keywords.remove(param.name) {
                Some(value) => check(param, value)?,
                None => param.default.clone().unwrap_or(Value::Nil),
            };
            bound_kw.insert(param.name, value);
        }
        Ok((bound, bound_kw))
    }
}

/// Evaluated, bound arguments handed to an operator implementation.
pub struct Arguments<'a> {
    pub op: &'a str,
    pub path: &'a str,
    pub positional: Vec<Value>,
    pub keywords: BTreeMap<&'static str, Value>,
    /// Present when the operator declared `wants_context`.
    pub ctx: Option<&'a QueryContext<'a>>,
    pub interpreter: &'a Interpreter<'a>,
}

impl<'a> Arguments<'a> {
    pub fn error(&self, message: impl Into<String>) -> FormulaError {
        FormulaError::evaluation(self.op, self.path, message)
    }

    pub fn context(&self) -> FormulaResult<&'a QueryContext<'a>> {
        self.ctx
            .ok_or_else(|| self.error("operator did not declare that it wants the query context"))
    }

    pub fn positional(&self, idx: usize) -> &Value {
        self.positional.get(idx).unwrap_or(&Value::Nil)
    }

    /// Move a series argument out of the argument list.
    pub fn take_series(&mut self, idx: usize) -> FormulaResult<Series> {
        match self.positional.get_mut(idx).map(std::mem::take) {
            Some(Value::Series(s)) => Ok(s),
            Some(other) => Err(self.error(format!(
                "argument {idx} is a {}, not a series",
                other.type_name()
            ))),
            None => Err(self.error(format!("missing argument {idx}"))),
        }
    }

    /// All series from position `from` onwards (the variadic tail).
    pub fn rest_series(&mut self, from: usize) -> FormulaResult<Vec<Series>> {
        (from..self.positional.len())
            .map(|idx| self.take_series(idx))
            .collect()
    }

    pub fn f64_arg(&self, idx: usize) -> FormulaResult<f64> {
        self.positional(idx)
            .as_f64()
            .ok_or_else(|| self.error(format!("argument {idx} is not a number")))
    }

    pub fn str_arg(&self, idx: usize) -> FormulaResult<&str> {
        match self.positional(idx) {
            Value::Str(s) => Ok(s),
            other => Err(self.error(format!(
                "argument {idx} is a {}, not a string",
                other.type_name()
            ))),
        }
    }

    pub fn timestamp_arg(&self, idx: usize) -> FormulaResult<NaiveDateTime> {
        match self.positional(idx) {
            Value::Timestamp(ts) => Ok(*ts),
            other => Err(self.error(format!(
                "argument {idx} is a {}, not a timestamp",
                other.type_name()
            ))),
        }
    }

    pub fn keyword(&self, name: &str) -> &Value {
        self.keywords.get(name).unwrap_or(&Value::Nil)
    }

    pub fn f64_kw(&self, name: &str) -> Option<f64> {
        self.keyword(name).as_f64()
    }

    pub fn int_kw(&self, name: &str) -> Option<i64> {
        match self.keyword(name) {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn bool_kw(&self, name: &str, default: bool) -> bool {
        match self.keyword(name) {
            Value::Bool(b) => *b,
            _ => default,
        }
    }

    pub fn str_kw(&self, name: &str) -> Option<&str> {
        match self.keyword(name) {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn timestamp_kw(&self, name: &str) -> Option<NaiveDateTime> {
        match self.keyword(name) {
            Value::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }

    /// Fail when both keywords are set (neither nil nor `#f`).
    pub fn exclusive(&self, first: &str, second: &str) -> FormulaResult<()> {
        let set = |name: &str| !matches!(self.keyword(name), Value::Nil | Value::Bool(false));
        if set(first) && set(second) {
            return Err(FormulaError::MutuallyExclusiveKeywords {
                op: self.op.to_string(),
                path: self.path.to_string(),
                first: first.to_string(),
                second: second.to_string(),
            });
        }
        Ok(())
    }
}
