//! Recursive tree evaluator.

use std::collections::BTreeMap;

use rayon::prelude::*;

use crate::errors::{FormulaError, FormulaResult};
use crate::expr::{Call, Expr, Literal};
use crate::models::{Series, Value};
use crate::ops::{Arguments, Implementation, OperatorRegistry};
use crate::query::context::{QueryContext, TreePath};

/// Evaluates expression trees against one operator registry.
#[derive(Clone, Copy)]
pub struct Interpreter<'r> {
    registry: &'r OperatorRegistry,
    parallel: bool,
}

fn literal_value(lit: &Literal) -> Value {
    match lit {
        Literal::Int(v) => Value::Int(*v),
        Literal::Float(v) => Value::Float(*v),
        Literal::Str(s) => Value::Str(s.clone()),
        Literal::Bool(b) => Value::Bool(*b),
    }
}

impl<'r> Interpreter<'r> {
    pub fn new(registry: &'r OperatorRegistry) -> Self {
        Self {
            registry,
            parallel: false,
        }
    }

    /// Evaluate independent call arguments on the rayon pool.
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn registry(&self) -> &'r OperatorRegistry {
        self.registry
    }

    pub fn evaluate(&self, expr: &Expr, ctx: &QueryContext<'_>) -> FormulaResult<Value> {
        self.eval_slot(expr, ctx, &TreePath::root(), "")
    }

    /// Evaluate `expr` sitting in argument `slot` of the node at `parent`.
    pub fn eval_slot(
        &self,
        expr: &Expr,
        ctx: &QueryContext<'_>,
        parent: &TreePath,
        slot: &str,
    ) -> FormulaResult<Value> {
        match expr {
            Expr::Literal(lit) => Ok(literal_value(lit)),
            Expr::Symbol(s) => Ok(Value::Str(s.clone())),
            Expr::Call(call) => {
                let path = parent.child(slot, &call.op);
                let ctx = ctx.descend(&path)?;
                self.eval_call(call, &ctx, &path)
            }
        }
    }

    fn eval_call(
        &self,
        call: &Call,
        ctx: &QueryContext<'_>,
        path: &TreePath,
    ) -> FormulaResult<Value> {
        ctx.checkpoint(path)?;
        let spec = self.registry.find_at(&call.op, path.as_str())?;
        spec.signature.check_call(call, path.as_str())?;
        let implementation = match &spec.implementation {
            Implementation::RawTree(f) => return f(call, self, ctx, path),
            Implementation::Values(f) => f,
        };

        let positional = self.eval_positional(call, ctx, path)?;
        let mut keywords = BTreeMap::new();
        for (name, expr) in &call.kwargs {
            keywords.insert(name.clone(), self.eval_slot(expr, ctx, path, name)?);
        }
        let (positional, keywords) =
            spec.signature
                .bind(&call.op, path.as_str(), positional, keywords)?;
        implementation(Arguments {
            op: &call.op,
            path: path.as_str(),
            positional,
            keywords,
            ctx: spec.wants_context.then_some(ctx),
            interpreter: self,
        })
    }

    fn eval_positional(
        &self,
        call: &Call,
        ctx: &QueryContext<'_>,
        path: &TreePath,
    ) -> FormulaResult<Vec<Value>> {
        let subtrees = call
            .args
            .iter()
            .filter(|arg| matches!(arg, Expr::Call(_)))
            .count();
        if self.parallel && subtrees >= 2 {
            call.args
                .par_iter()
                .enumerate()
                .map(|(idx, arg)| self.eval_slot(arg, ctx, path, &idx.to_string()))
                .collect()
        } else {
            call.args
                .iter()
                .enumerate()
                .map(|(idx, arg)| self.eval_slot(arg, ctx, path, &idx.to_string()))
                .collect()
        }
    }

    /// Resolve a `series` leaf: a pre-staircased leaf, a named formula, or a
    /// primary series from the store. The result is cut to the query window.
    pub fn fetch_series(
        &self,
        name: &str,
        ctx: &QueryContext<'_>,
        path: &TreePath,
    ) -> FormulaResult<Series> {
        ctx.checkpoint(path)?;
        if let Some(leaf) = ctx.staircased_leaf(name) {
            let mut series = leaf.clone();
            series.restrict(&ctx.window);
            return Ok(series);
        }
        if let Some(tree) = ctx.catalog.formula_tree(name)? {
            return match self.eval_slot(&tree, ctx, path, name)? {
                Value::Series(mut series) => {
                    series.restrict(&ctx.window);
                    Ok(series)
                }
                other => Err(FormulaError::evaluation(
                    "series",
                    path.as_str(),
                    format!("formula `{name}` yields a {}, not a series", other.type_name()),
                )),
            };
        }
        match ctx.fetch_primary(name, path)? {
            Some(mut series) => {
                series.restrict(&ctx.window);
                Ok(series)
            }
            None => Err(FormulaError::evaluation(
                "series",
                path.as_str(),
                format!("no such series `{name}`"),
            )),
        }
    }
}
