//! Point-in-time ("as of `t - delta`") evaluation of formula trees.
//!
//! The naive path replays the whole tree once per revision date (insertion
//! dates of its primary leaves, plus the dates operators such as `constant`
//! carry themselves) and stitches the slices together. When every operator in
//! the expanded tree is pointwise, the optimized path asks the store for a
//! staircased version of each leaf and evaluates the tree once.

use std::collections::{BTreeSet, HashMap};

use chrono::{NaiveDateTime, TimeDelta};
use tracing::debug;

use crate::errors::{FormulaError, FormulaResult};
use crate::expr::{Call, Expr, Literal};
use crate::models::{FillPolicy, Series, Value, Window};
use crate::ops::OperatorRegistry;
use crate::query::context::{QueryContext, TreePath};
use crate::query::guards::MAX_RESOLVE_DEPTH;
use crate::query::interpreter::Interpreter;
use crate::query::resolver::{Catalog, Resolver};

/// Which evaluation strategy produced a staircase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaircasePath {
    Naive,
    Optimized,
}

/// Whether `tree`, with stored formulas expanded, can be evaluated over
/// staircased leaves.
///
/// Every operator must be flagged for push-down, and no `series` node may
/// carry `prune`, `limit` or a propagating `fill`.
pub fn is_pushdown_eligible(
    tree: &Expr,
    registry: &OperatorRegistry,
    catalog: &dyn Catalog,
) -> FormulaResult<bool> {
    let mut stack = Vec::new();
    eligible(tree, registry, catalog, &mut stack)
}

fn eligible(
    tree: &Expr,
    registry: &OperatorRegistry,
    catalog: &dyn Catalog,
    stack: &mut Vec<String>,
) -> FormulaResult<bool> {
    let mut calls: Vec<&Call> = Vec::new();
    tree.walk_calls(&mut |call| calls.push(call));
    for call in calls {
        let Some(spec) = registry.get(&call.op) else {
            return Ok(false);
        };
        if !spec.staircase_pushdown {
            return Ok(false);
        }
        let Some(name) = call.series_name() else {
            continue;
        };
        if !series_keywords_are_pointwise(call) {
            return Ok(false);
        }
        if stack.iter().any(|seen| seen == name) {
            return Err(FormulaError::CyclicFormula {
                name: name.to_string(),
            });
        }
        if stack.len() >= MAX_RESOLVE_DEPTH {
            return Err(FormulaError::RecursionLimit {
                limit: MAX_RESOLVE_DEPTH,
                path: stack.join("/"),
            });
        }
        if let Some(sub) = catalog.formula_tree(name)? {
            stack.push(name.to_string());
            let ok = eligible(&sub, registry, catalog, stack)?;
            stack.pop();
            if !ok {
                return Ok(false);
            }
        }
    }
    Ok(true)
}

fn series_keywords_are_pointwise(call: &Call) -> bool {
    if call.kwargs.contains_key("prune") || call.kwargs.contains_key("limit") {
        return false;
    }
    match call.kwargs.get("fill") {
        None => true,
        Some(Expr::Literal(Literal::Int(_) | Literal::Float(_))) => true,
        Some(Expr::Literal(Literal::Str(text))) | Some(Expr::Symbol(text)) => {
            FillPolicy::parse(text).is_some_and(|policy| policy.is_pointwise())
        }
        Some(_) => false,
    }
}

fn expect_series(value: Value, path: &str) -> FormulaResult<Series> {
    match value {
        Value::Series(series) => Ok(series),
        other => Err(FormulaError::evaluation(
            "staircase",
            path,
            format!("tree yields a {}, not a series", other.type_name()),
        )),
    }
}

fn primary_leaves(
    interpreter: &Interpreter<'_>,
    ctx: &QueryContext<'_>,
    tree: &Expr,
) -> FormulaResult<BTreeSet<String>> {
    Resolver::new(interpreter.registry(), ctx.catalog).primary_leaves(tree)
}

/// Every revision date of `tree` within `bound`: the insertion dates of its
/// primary leaves and the dates reported by operator hooks, stored formulas
/// included.
pub fn revision_dates(
    interpreter: &Interpreter<'_>,
    ctx: &QueryContext<'_>,
    tree: &Expr,
    bound: &Window,
) -> FormulaResult<BTreeSet<NaiveDateTime>> {
    let mut dates = BTreeSet::new();
    for leaf in primary_leaves(interpreter, ctx, tree)? {
        ctx.checkpoint(&TreePath::from(leaf.as_str()))?;
        dates.extend(ctx.store.insertion_dates(&leaf, bound)?);
    }
    let mut stack = Vec::new();
    hooked_dates(interpreter, ctx, tree, &mut stack, &mut dates)?;
    dates.retain(|date| bound.contains(*date));
    Ok(dates)
}

fn hooked_dates(
    interpreter: &Interpreter<'_>,
    ctx: &QueryContext<'_>,
    tree: &Expr,
    stack: &mut Vec<String>,
    dates: &mut BTreeSet<NaiveDateTime>,
) -> FormulaResult<()> {
    let mut calls: Vec<&Call> = Vec::new();
    tree.walk_calls(&mut |call| calls.push(call));
    for call in calls {
        let path = TreePath::from(call.op.as_str());
        if let Some(hook) = interpreter
            .registry()
            .get(&call.op)
            .and_then(|spec| spec.insertion_dates.clone())
        {
            dates.extend(hook(call, interpreter, ctx, &path)?);
        }
        let Some(name) = call.series_name() else {
            continue;
        };
        if stack.iter().any(|seen| seen == name) {
            return Err(FormulaError::CyclicFormula {
                name: name.to_string(),
            });
        }
        if stack.len() >= MAX_RESOLVE_DEPTH {
            return Err(FormulaError::RecursionLimit {
                limit: MAX_RESOLVE_DEPTH,
                path: stack.join("/"),
            });
        }
        if let Some(sub) = ctx.catalog.formula_tree(name)? {
            stack.push(name.to_string());
            hooked_dates(interpreter, ctx, &sub, stack, dates)?;
            stack.pop();
        }
    }
    Ok(())
}

/// Replay the tree at every one of its revision dates.
pub fn naive_staircase(
    interpreter: &Interpreter<'_>,
    ctx: &QueryContext<'_>,
    tree: &Expr,
    delta: TimeDelta,
) -> FormulaResult<Series> {
    let bound = Window {
        from: None,
        to: ctx.window.to.and_then(|t| t.checked_sub_signed(delta)),
    };
    let idates: Vec<NaiveDateTime> = revision_dates(interpreter, ctx, tree, &bound)?
        .into_iter()
        .collect();

    let mut out = Series::new();
    for (k, idate) in idates.iter().enumerate() {
        let Some(lo) = idate.checked_add_signed(delta) else {
            continue;
        };
        let hi = idates.get(k + 1).and_then(|next| next.checked_add_signed(delta));
        let asof = ctx.clone().with_revision(Some(*idate));
        let snapshot = expect_series(interpreter.evaluate(tree, &asof)?, "")?;
        for (ts, v) in snapshot.iter() {
            if ts >= lo && hi.map_or(true, |hi| ts < hi) {
                out.insert(ts, v);
            }
        }
    }
    Ok(out)
}

/// Evaluate the tree once over store-staircased primary leaves.
///
/// Only equal to [`naive_staircase`] for trees accepted by
/// [`is_pushdown_eligible`].
pub fn optimized_staircase(
    interpreter: &Interpreter<'_>,
    ctx: &QueryContext<'_>,
    tree: &Expr,
    delta: TimeDelta,
) -> FormulaResult<Series> {
    let leaves = primary_leaves(interpreter, ctx, tree)?;
    if leaves.is_empty() {
        return Ok(Series::new());
    }
    let mut staircased = HashMap::with_capacity(leaves.len());
    for leaf in leaves {
        ctx.checkpoint(&TreePath::from(leaf.as_str()))?;
        if let Some(series) = ctx.store.staircase(&leaf, delta, &ctx.window)? {
            staircased.insert(leaf, series);
        }
    }
    let injected = ctx
        .clone()
        .with_revision(None)
        .with_staircased_leaves(&staircased);
    expect_series(interpreter.evaluate(tree, &injected)?, "")
}

/// Run the optimized path when `eligible`, the naive one otherwise.
pub fn staircase(
    interpreter: &Interpreter<'_>,
    ctx: &QueryContext<'_>,
    tree: &Expr,
    delta: TimeDelta,
    eligible: bool,
) -> FormulaResult<(Series, StaircasePath)> {
    if eligible {
        debug!(%delta, "staircase: optimized path");
        Ok((
            optimized_staircase(interpreter, ctx, tree, delta)?,
            StaircasePath::Optimized,
        ))
    } else {
        debug!(%delta, "staircase: naive path");
        Ok((
            naive_staircase(interpreter, ctx, tree, delta)?,
            StaircasePath::Naive,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::parse;
    use crate::models::{parse_timestamp, SeriesMeta};
    use crate::store::series::{MemoryStore, SeriesStore};
    use std::sync::Arc;

    fn ts(text: &str) -> NaiveDateTime {
        parse_timestamp(text).unwrap()
    }

    struct Formulas<'a> {
        store: &'a MemoryStore,
        trees: HashMap<String, Arc<Expr>>,
    }

    impl Catalog for Formulas<'_> {
        fn formula_tree(&self, name: &str) -> FormulaResult<Option<Arc<Expr>>> {
            Ok(self.trees.get(name).cloned())
        }

        fn primary_metadata(&self, name: &str) -> FormulaResult<Option<SeriesMeta>> {
            self.store.metadata(name)
        }
    }

    fn catalog<'a>(store: &'a MemoryStore, trees: &[(&str, &str)]) -> Formulas<'a> {
        Formulas {
            store,
            trees: trees
                .iter()
                .map(|(name, text)| (name.to_string(), Arc::new(parse(text).unwrap())))
                .collect(),
        }
    }

    /// Two forecasts revised daily at different hours, with one erasure.
    fn store() -> MemoryStore {
        let store = MemoryStore::new();
        for day in 1..=4u32 {
            let at = ts(&format!("2020-01-{day:02} 06:00"));
            let points = (0..3u32).map(|ahead| {
                let t = ts(&format!("2020-01-{:02}", day + ahead + 1));
                (t, f64::from(day * 10 + ahead))
            });
            store.insert("a", at, points);
        }
        for day in [1u32, 3] {
            let at = ts(&format!("2020-01-{day:02} 18:00"));
            let points = (0..4u32).map(|ahead| {
                let t = ts(&format!("2020-01-{:02}", day + ahead));
                (t, f64::from(100 + day + ahead))
            });
            store.insert("b", at, points);
        }
        store.update("b", ts("2020-01-04 12:00"), [(ts("2020-01-05"), None)]);
        store
    }

    const POINTWISE: &[&str] = &[
        r#"(series "a")"#,
        r#"(add (series "a") (series "b"))"#,
        r#"(add (series "a") (series "b" #:fill 0))"#,
        r#"(priority (series "b") (series "a"))"#,
        r#"(clip (series "a") #:min 21 #:max 31)"#,
        r#"(slice (series "b") #:fromdate (date "2020-01-03"))"#,
        r#"(* 2 (+ 1 (series "f")))"#,
        r#"(row-mean (series "a") (series "b" #:weight 2))"#,
    ];

    #[test]
    fn optimized_matches_naive_for_pointwise_trees() {
        let store = store();
        let cat = catalog(&store, &[("f", r#"(priority (series "a") (series "b"))"#)]);
        let registry = OperatorRegistry::with_builtins();
        let interp = Interpreter::new(&registry);
        let windows = [
            Window::all(),
            Window::between(ts("2020-01-03"), ts("2020-01-05")),
        ];
        for text in POINTWISE {
            let tree = parse(text).unwrap();
            assert!(is_pushdown_eligible(&tree, &registry, &cat).unwrap(), "{text}");
            for window in &windows {
                let ctx = QueryContext::new(&store, &cat).with_window(*window);
                for hours in [0, 6, 12, 24, 30, 48] {
                    let delta = TimeDelta::try_hours(hours).unwrap();
                    let naive = naive_staircase(&interp, &ctx, &tree, delta).unwrap();
                    let fast = optimized_staircase(&interp, &ctx, &tree, delta).unwrap();
                    assert_eq!(
                        naive.iter().collect::<Vec<_>>(),
                        fast.iter().collect::<Vec<_>>(),
                        "{text} delta {hours}h"
                    );
                }
            }
        }
    }

    #[test]
    fn one_day_ahead_view_of_a_single_series() {
        let store = store();
        let cat = catalog(&store, &[]);
        let registry = OperatorRegistry::with_builtins();
        let interp = Interpreter::new(&registry);
        let ctx = QueryContext::new(&store, &cat);
        let tree = parse(r#"(series "a")"#).unwrap();
        let delta = TimeDelta::try_days(1).unwrap();
        let (series, path) = staircase(&interp, &ctx, &tree, delta, true).unwrap();
        assert_eq!(path, StaircasePath::Optimized);
        // Midnight minus one day only sees the 06:00 revision of two days before.
        assert_eq!(series.get(&ts("2020-01-03")), Some(11.0));
        assert_eq!(series.get(&ts("2020-01-05")), Some(31.0));
        assert_eq!(series.get(&ts("2020-01-02")), None);
    }

    #[test]
    fn non_pointwise_trees_are_not_eligible() {
        let store = store();
        let cat = catalog(&store, &[("r", r#"(resample (series "a") "D")"#)]);
        let registry = OperatorRegistry::with_builtins();
        for text in [
            r#"(resample (series "a") "D")"#,
            r#"(cumsum (series "a"))"#,
            r#"(add (series "a" #:fill "ffill") (series "b"))"#,
            r#"(add (series "a" #:fill 0 #:limit 1) (series "b"))"#,
            r#"(series "a" #:prune 1)"#,
            r#"(asof (date "2020-01-02") (series "a"))"#,
            r#"(slice (series "a") #:todate (today))"#,
            r#"(rolling (series "a") 2)"#,
            r#"(add (series "r") (series "b"))"#,
            r#"(unregistered (series "a"))"#,
        ] {
            let tree = parse(text).unwrap();
            assert!(!is_pushdown_eligible(&tree, &registry, &cat).unwrap(), "{text}");
        }
    }

    #[test]
    fn naive_path_still_handles_ineligible_trees() {
        let store = store();
        let cat = catalog(&store, &[]);
        let registry = OperatorRegistry::with_builtins();
        let interp = Interpreter::new(&registry);
        let ctx = QueryContext::new(&store, &cat);
        let tree = parse(r#"(cumsum (series "a"))"#).unwrap();
        let (series, path) = staircase(&interp, &ctx, &tree, TimeDelta::zero(), false).unwrap();
        assert_eq!(path, StaircasePath::Naive);
        assert!(!series.is_empty());
    }

    #[test]
    fn constants_are_replayed_from_their_revision_date() {
        let store = store();
        let cat = catalog(
            &store,
            &[(
                "c",
                r#"(constant 5 (date "2020-01-01") (date "2020-01-06") "D" (date "2020-01-03"))"#,
            )],
        );
        let registry = OperatorRegistry::with_builtins();
        let interp = Interpreter::new(&registry);
        let ctx = QueryContext::new(&store, &cat);

        let alone = parse(
            r#"(constant 1 (date "2020-01-01") (date "2020-01-03") "D" (date "2020-01-01"))"#,
        )
        .unwrap();
        assert!(!is_pushdown_eligible(&alone, &registry, &cat).unwrap());
        let delta = TimeDelta::try_hours(1).unwrap();
        let out = naive_staircase(&interp, &ctx, &alone, delta).unwrap();
        assert_eq!(
            out.iter().collect::<Vec<_>>(),
            vec![(ts("2020-01-02"), 1.0), (ts("2020-01-03"), 1.0)]
        );

        // The revision date is found through a stored formula too.
        let bound = Window::all();
        let named = parse(r#"(series "c")"#).unwrap();
        let dates = revision_dates(&interp, &ctx, &named, &bound).unwrap();
        assert_eq!(dates.into_iter().collect::<Vec<_>>(), vec![ts("2020-01-03")]);

        let mixed = parse(r#"(add (series "a") (series "c"))"#).unwrap();
        let out = naive_staircase(&interp, &ctx, &mixed, TimeDelta::zero()).unwrap();
        // a's revision of the 2nd is still current when c appears on the 3rd.
        assert_eq!(out.get(&ts("2020-01-03")), Some(20.0 + 5.0));
        assert_eq!(out.get(&ts("2020-01-02")), None);
    }
}
