//! Component rows describing the series that feed a formula, for editor
//! front-ends.
//!
//! The walk is driven by the `editor_info` builder of each operator.
//! Operators without a builder contribute nothing below them.

use serde::Serialize;

use crate::errors::FormulaResult;
use crate::expr::{Call, Expr};
use crate::ops::OperatorRegistry;
use crate::query::resolver::Catalog;

/// One row of the components table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComponentInfo {
    pub name: String,
    /// `primary`, `formula: <top operator>` or `unknown`.
    pub kind: String,
    /// Scaling applied by the enclosing arithmetic, e.g. `x 1.0`.
    pub coef: String,
    /// `key:value` pairs of the `series` node, or `-`.
    pub keywords: String,
    /// Canonical text of the sub-expression this row stands for.
    pub expression: String,
}

impl ComponentInfo {
    fn scoped(expr: &Expr) -> Self {
        Self {
            name: String::new(),
            kind: String::new(),
            coef: "x 1".to_string(),
            keywords: "-".to_string(),
            expression: expr.canonical(),
        }
    }
}

fn display_op(op: &str) -> &str {
    if op == "*" {
        "x"
    } else {
        op
    }
}

pub struct EditorWalker<'a> {
    registry: &'a OperatorRegistry,
    catalog: &'a dyn Catalog,
    stack: Vec<ComponentInfo>,
    infos: Vec<ComponentInfo>,
}

impl<'a> EditorWalker<'a> {
    pub fn new(registry: &'a OperatorRegistry, catalog: &'a dyn Catalog) -> Self {
        Self {
            registry,
            catalog,
            stack: Vec::new(),
            infos: Vec::new(),
        }
    }

    /// Rows for the formula `name` whose tree is `tree`: the formula itself
    /// first opened, then one row per series scope below it (innermost
    /// scopes close first).
    pub fn build(mut self, name: &str, tree: &Expr) -> FormulaResult<Vec<ComponentInfo>> {
        self.series_scope(tree, |walker| {
            if let Some(info) = walker.last_info() {
                info.name = name.to_string();
                info.kind = match tree.as_call() {
                    Some(call) => format!("formula: {}", display_op(&call.op)),
                    None => "formula".to_string(),
                };
            }
            walker.walk(tree)
        })?;
        Ok(self.infos)
    }

    /// The row currently being filled.
    pub fn last_info(&mut self) -> Option<&mut ComponentInfo> {
        self.stack.last_mut()
    }

    pub fn catalog(&self) -> &'a dyn Catalog {
        self.catalog
    }

    /// Open a row for `expr`, run `f`, then record the row.
    pub fn series_scope<F>(&mut self, expr: &Expr, f: F) -> FormulaResult<()>
    where
        F: FnOnce(&mut Self) -> FormulaResult<()>,
    {
        self.stack.push(ComponentInfo::scoped(expr));
        let outcome = f(self);
        if let Some(info) = self.stack.pop() {
            if outcome.is_ok() {
                self.infos.push(info);
            }
        }
        outcome
    }

    pub fn walk(&mut self, expr: &Expr) -> FormulaResult<()> {
        let Expr::Call(call) = expr else {
            return Ok(());
        };
        let builder = self
            .registry
            .get(&call.op)
            .and_then(|spec| spec.editor_info.clone());
        match builder {
            Some(builder) => builder(self, call),
            None => Ok(()),
        }
    }

    /// Walk every argument but the first.
    pub fn walk_rest(&mut self, call: &Call) -> FormulaResult<()> {
        for arg in call.args.iter().skip(1) {
            self.walk(arg)?;
        }
        Ok(())
    }
}

/// `series` leaf: name, keywords and kind.
pub(crate) fn series_info(walker: &mut EditorWalker<'_>, call: &Call) -> FormulaResult<()> {
    let Some(name) = call.series_name() else {
        return Ok(());
    };
    let keywords = call
        .kwargs
        .iter()
        .map(|(k, v)| format!("{k}:{v}"))
        .collect::<Vec<_>>()
        .join(", ");
    let catalog = walker.catalog();
    let kind = match catalog.formula_tree(name)? {
        Some(tree) => match tree.as_call() {
            Some(top) => format!("formula: {}", display_op(&top.op)),
            None => "formula".to_string(),
        },
        None if catalog.primary_metadata(name)?.is_some() => "primary".to_string(),
        None => "unknown".to_string(),
    };
    if let Some(info) = walker.last_info() {
        info.name = name.to_string();
        info.keywords = if keywords.is_empty() { "-".to_string() } else { keywords };
        info.kind = kind;
    }
    Ok(())
}

/// `+` and `*` with a literal first operand record a coefficient.
pub(crate) fn coefficient_info(walker: &mut EditorWalker<'_>, call: &Call) -> FormulaResult<()> {
    let Some(coef) = call.args.first().and_then(Expr::as_number) else {
        return Ok(());
    };
    let symbol = if call.op == "+" { "+" } else { "x" };
    if let Some(info) = walker.last_info() {
        info.coef = format!("{symbol} {coef:?}");
    }
    walker.walk_rest(call)
}

/// Combinators open one row per argument.
pub(crate) fn combinator_info(walker: &mut EditorWalker<'_>, call: &Call) -> FormulaResult<()> {
    for arg in &call.args {
        walker.series_scope(arg, |walker| walker.walk(arg))?;
    }
    Ok(())
}
