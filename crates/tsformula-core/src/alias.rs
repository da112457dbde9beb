//! Conversion of legacy arithmetic and priority aliases into formula text.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::expr::{Call, Expr};

/// One row of a legacy arithmetic alias: `alias = sum(coefficient * serie)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArithmeticAlias {
    pub alias: String,
    pub serie: String,
    pub coefficient: f64,
    pub fillopt: Option<String>,
}

/// One row of a legacy priority alias: lower `priority` wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorityAlias {
    pub alias: String,
    pub serie: String,
    pub priority: i64,
    pub coefficient: f64,
    pub prune: Option<i64>,
}

fn scaled(coefficient: f64, leaf: Expr) -> Expr {
    if coefficient == 1.0 {
        leaf
    } else {
        Expr::Call(Call::new("*").arg(Expr::float(coefficient)).arg(leaf))
    }
}

/// Wrap components in `op`, unless there is a single one.
fn combine(op: &str, mut components: Vec<Expr>) -> Option<Expr> {
    match components.len() {
        0 => None,
        1 => components.pop(),
        _ => Some(Expr::Call(
            components
                .into_iter()
                .fold(Call::new(op), |call, component| call.arg(component)),
        )),
    }
}

fn group_by_alias<T, F>(rows: &[T], alias: F) -> IndexMap<&str, Vec<&T>>
where
    F: Fn(&T) -> &str,
{
    let mut groups: IndexMap<&str, Vec<&T>> = IndexMap::new();
    for row in rows {
        groups.entry(alias(row)).or_default().push(row);
    }
    groups
}

/// `(add ...)` of optionally scaled series, one formula per alias in
/// first-seen order.
pub fn arithmetic_formulas(rows: &[ArithmeticAlias]) -> Vec<(String, String)> {
    group_by_alias(rows, |row| row.alias.as_str())
        .into_iter()
        .filter_map(|(alias, rows)| {
            let components = rows
                .iter()
                .map(|row| {
                    let mut leaf = Call::new("series").arg(Expr::string(&row.serie));
                    if let Some(fill) = row.fillopt.as_deref().filter(|f| !f.is_empty()) {
                        leaf = leaf.kwarg("fill", Expr::string(fill));
                    }
                    scaled(row.coefficient, Expr::Call(leaf))
                })
                .collect();
            combine("add", components).map(|expr| (alias.to_string(), expr.canonical()))
        })
        .collect()
}

/// `(priority ...)` ordered by ascending priority, one formula per alias.
pub fn priority_formulas(rows: &[PriorityAlias]) -> Vec<(String, String)> {
    group_by_alias(rows, |row| row.alias.as_str())
        .into_iter()
        .filter_map(|(alias, mut rows)| {
            rows.sort_by_key(|row| row.priority);
            let components = rows
                .iter()
                .map(|row| {
                    let mut leaf = Call::new("series").arg(Expr::string(&row.serie));
                    if let Some(prune) = row.prune.filter(|p| *p != 0) {
                        leaf = leaf.kwarg("prune", Expr::int(prune));
                    }
                    scaled(row.coefficient, Expr::Call(leaf))
                })
                .collect();
            combine("priority", components).map(|expr| (alias.to_string(), expr.canonical()))
        })
        .collect()
}
