//! Built-in operator set.

use std::collections::BTreeMap;

use chrono::{NaiveDateTime, Utc};

use crate::editor;
use crate::errors::{FormulaError, FormulaResult};
use crate::expr::{Call, Expr};
use crate::models::{parse_timestamp, FillPolicy, Series, SeriesOptions, Value, Window};
use crate::ops::combine;
use crate::ops::dates::{self, Frequency};
use crate::ops::signature::{Arguments, Param, ParamType, Signature};
use crate::ops::OperatorSpec;
use crate::query::context::{QueryContext, TreePath};
use crate::query::guards::MAX_GENERATED_POINTS;
use crate::query::interpreter::Interpreter;
use crate::query::resolver::{Catalog, Dependency};

pub fn all() -> Vec<OperatorSpec> {
    vec![
        series(),
        arithmetic("+"),
        arithmetic("*"),
        scalar_div(),
        scalar_pow(),
        combinator("add", 1, combine_add),
        combinator("mul", 1, combine_mul),
        series_div(),
        extremum("min"),
        extremum("max"),
        combinator("priority", 1, combine_priority),
        row_reduction("row-mean", combine::weighted_mean),
        row_reduction("row-min", row_min),
        row_reduction("row-max", row_max),
        row_reduction("std", combine::sample_std),
        clip(),
        slice(),
        resample(),
        cumsum(),
        rolling(),
        time_shifted(),
        asof(),
        constant(),
        date(),
        today(),
        shifted(),
        month_boundary("start-of-month", dates::start_of_month),
        month_boundary("end-of-month", dates::end_of_month),
    ]
}

// ---------------------------------------------------------------------------
// series
// ---------------------------------------------------------------------------

fn series() -> OperatorSpec {
    let signature = Signature::new()
        .arg(Param::required("name", ParamType::Str))
        .keyword(Param::optional("fill", ParamType::Fill))
        .keyword(Param::optional("limit", ParamType::Int))
        .keyword(Param::optional("weight", ParamType::Number))
        .keyword(Param::optional("prune", ParamType::Int));
    OperatorSpec::new("series", signature, series_op)
        .with_context()
        .with_finder(series_finder)
        .with_editor_info(editor::series_info)
        .pushdown()
        .doc(
            "Fetch a stored series or evaluate a named formula. Keywords: `fill` \
             (number, \"ffill\", \"bfill\"), `limit`, `weight`, `prune`.",
        )
}

fn series_op(args: Arguments<'_>) -> FormulaResult<Value> {
    let ctx = args.context()?;
    let name = args.str_arg(0)?;
    let path = TreePath::from(args.path);
    let mut series = args.interpreter.fetch_series(name, ctx, &path)?;

    if let Some(n) = args.int_kw("prune") {
        series.prune_last(usize::try_from(n).unwrap_or(0));
    }
    let fill = match args.keyword("fill") {
        Value::Str(text) => FillPolicy::parse(text),
        other => other.as_f64().map(FillPolicy::Value),
    };
    let options = SeriesOptions {
        fill,
        limit: args
            .int_kw("limit")
            .map(|l| usize::try_from(l).unwrap_or(0)),
        weight: args.f64_kw("weight"),
    };
    Ok(Value::Series(series.with_options(options)))
}

fn series_finder(call: &Call, catalog: &dyn Catalog) -> FormulaResult<BTreeMap<String, Dependency>> {
    let mut found = BTreeMap::new();
    if let Some(name) = call.args.first().and_then(Expr::as_str) {
        found.insert(name.to_string(), Dependency::lookup(catalog, name)?);
    }
    Ok(found)
}

// ---------------------------------------------------------------------------
// Scalar arithmetic
// ---------------------------------------------------------------------------

fn arithmetic(op: &'static str) -> OperatorSpec {
    let signature = Signature::new()
        .arg(Param::required("num", ParamType::Number))
        .arg(Param::required("num_or_series", ParamType::NumberOrSeries));
    let doc = if op == "+" {
        "Add a number to a number or to every point of a series."
    } else {
        "Multiply a number or every point of a series by a number."
    };
    OperatorSpec::new(op, signature, move |args| {
        let a = args.positional(0).clone();
        let b = args.positional(1).clone();
        match (op, a, b) {
            ("+", Value::Int(x), Value::Int(y)) => Ok(x
                .checked_add(y)
                .map(Value::Int)
                .unwrap_or(Value::Float(x as f64 + y as f64))),
            ("*", Value::Int(x), Value::Int(y)) => Ok(x
                .checked_mul(y)
                .map(Value::Int)
                .unwrap_or(Value::Float(x as f64 * y as f64))),
            (_, a, Value::Series(s)) => {
                let k = a.as_f64().unwrap_or(f64::NAN);
                Ok(Value::Series(if op == "+" {
                    s.map_values(|v| k + v)
                } else {
                    s.map_values(|v| k * v)
                }))
            }
            (_, a, b) => {
                let (x, y) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
                Ok(Value::Float(if op == "+" { x + y } else { x * y }))
            }
        }
    })
    .with_editor_info(editor::coefficient_info)
    .pushdown()
    .doc(doc)
}

fn scalar_div() -> OperatorSpec {
    let signature = Signature::new()
        .arg(Param::required("num_or_series", ParamType::NumberOrSeries))
        .arg(Param::required("num", ParamType::Number));
    OperatorSpec::new("/", signature, |args| {
        let divisor = args.f64_arg(1)?;
        if divisor == 0.0 {
            return Err(args.error("division by zero"));
        }
        match args.positional(0) {
            Value::Series(s) => Ok(Value::Series(s.map_values(|v| v / divisor))),
            other => Ok(Value::Float(other.as_f64().unwrap_or(f64::NAN) / divisor)),
        }
    })
    .pushdown()
    .doc("Divide a number or every point of a series by a number.")
}

fn scalar_pow() -> OperatorSpec {
    let signature = Signature::new()
        .arg(Param::required("num_or_series", ParamType::NumberOrSeries))
        .arg(Param::required("exponent", ParamType::Number));
    OperatorSpec::new("**", signature, |args| {
        let exponent = args.f64_arg(1)?;
        match args.positional(0) {
            Value::Series(s) => Ok(Value::Series(s.map_values(|v| v.powf(exponent)))),
            other => Ok(Value::Float(other.as_f64().unwrap_or(f64::NAN).powf(exponent))),
        }
    })
    .pushdown()
    .doc("Raise a number or every point of a series to a power.")
}

// ---------------------------------------------------------------------------
// Multi-series combinators
// ---------------------------------------------------------------------------

fn combinator(
    name: &'static str,
    min: usize,
    f: fn(Vec<Series>) -> Series,
) -> OperatorSpec {
    let signature = Signature::new().variadic(Param::required("series", ParamType::Series), min);
    OperatorSpec::new(name, signature, move |mut args| {
        let inputs = args.rest_series(0)?;
        Ok(Value::Series(f(inputs)))
    })
    .with_editor_info(editor::combinator_info)
    .pushdown()
}

fn combine_add(inputs: Vec<Series>) -> Series {
    combine::strict(&inputs, combine::sum)
}

fn combine_mul(inputs: Vec<Series>) -> Series {
    combine::strict(&inputs, combine::product)
}

/// A single input passes through untouched, options included.
fn combine_priority(mut inputs: Vec<Series>) -> Series {
    if inputs.len() == 1 {
        return inputs.remove(0);
    }
    combine::patch(&inputs)
}

fn series_div() -> OperatorSpec {
    let signature = Signature::new()
        .arg(Param::required("numerator", ParamType::Series))
        .arg(Param::required("denominator", ParamType::Series));
    OperatorSpec::new("div", signature, |mut args| {
        let inputs = args.rest_series(0)?;
        let mut out = combine::strict(&inputs, |v| v[0] / v[1]);
        out.retain(|_, v| v.is_finite());
        Ok(Value::Series(out))
    })
    .with_editor_info(editor::combinator_info)
    .pushdown()
    .doc("Element-wise division of two series; zero denominators yield no point.")
}

/// `min` / `max` over numbers, or row-wise over series (strict alignment).
fn extremum(name: &'static str) -> OperatorSpec {
    let signature = Signature::new().variadic(Param::required("x", ParamType::NumberOrSeries), 1);
    let pick = if name == "min" { f64::min } else { f64::max };
    OperatorSpec::new(name, signature, move |mut args| {
        let all_series = args.positional.iter().all(|v| v.as_series().is_some());
        if all_series {
            let inputs = args.rest_series(0)?;
            let out = combine::strict(&inputs, |values| {
                values.iter().copied().fold(f64::NAN, pick)
            });
            return Ok(Value::Series(out));
        }
        let numbers = args
            .positional
            .iter()
            .map(Value::as_f64)
            .collect::<Option<Vec<f64>>>()
            .ok_or_else(|| args.error("cannot mix numbers and series"))?;
        Ok(Value::Float(numbers.into_iter().fold(f64::NAN, pick)))
    })
    .with_editor_info(editor::combinator_info)
    .pushdown()
}

fn row_min(cells: &[(f64, f64)]) -> Option<f64> {
    cells.iter().map(|(v, _)| *v).reduce(f64::min)
}

fn row_max(cells: &[(f64, f64)]) -> Option<f64> {
    cells.iter().map(|(v, _)| *v).reduce(f64::max)
}

fn row_reduction(
    name: &'static str,
    f: fn(&[(f64, f64)]) -> Option<f64>,
) -> OperatorSpec {
    let signature = Signature::new()
        .variadic(Param::required("series", ParamType::Series), 1)
        .keyword(Param::with_default("skipna", ParamType::Bool, Value::Bool(true)));
    OperatorSpec::new(name, signature, move |mut args| {
        let skipna = args.bool_kw("skipna", true);
        let inputs = args.rest_series(0)?;
        Ok(Value::Series(combine::lenient(&inputs, skipna, f)))
    })
    .with_editor_info(editor::combinator_info)
    .pushdown()
}

// ---------------------------------------------------------------------------
// Single-series transforms
// ---------------------------------------------------------------------------

/// Out-of-range values are clamped to the bound unless `#:replacemin #f`
/// (or `#:replacemax #f`) asks for them to be dropped.
fn clip() -> OperatorSpec {
    let signature = Signature::new()
        .arg(Param::required("series", ParamType::Series))
        .keyword(Param::optional("min", ParamType::Number))
        .keyword(Param::optional("max", ParamType::Number))
        .keyword(Param::with_default("replacemin", ParamType::Bool, Value::Bool(true)))
        .keyword(Param::with_default("replacemax", ParamType::Bool, Value::Bool(true)));
    OperatorSpec::new("clip", signature, |mut args| {
        let mut series = args.take_series(0)?;
        let low = args.f64_kw("min").unwrap_or(f64::NEG_INFINITY);
        let high = args.f64_kw("max").unwrap_or(f64::INFINITY);
        if low > high {
            return Err(args.error(format!("min {low} is greater than max {high}")));
        }
        if !args.bool_kw("replacemax", true) {
            series.retain(|_, v| v <= high);
        }
        if !args.bool_kw("replacemin", true) {
            series.retain(|_, v| v >= low);
        }
        Ok(Value::Series(series.map_values(|v| v.clamp(low, high))))
    })
    .pushdown()
    .doc(
        "Clamp the values of a series between `#:min` and `#:max`; \
         `#:replacemin #f` / `#:replacemax #f` drop the out-of-range points instead.",
    )
}

fn slice() -> OperatorSpec {
    let signature = Signature::new()
        .arg(Param::required("series", ParamType::Series))
        .keyword(Param::optional("fromdate", ParamType::Timestamp))
        .keyword(Param::optional("todate", ParamType::Timestamp));
    OperatorSpec::new("slice", signature, |mut args| {
        let mut series = args.take_series(0)?;
        let bounds = Window {
            from: args.timestamp_kw("fromdate"),
            to: args.timestamp_kw("todate"),
        };
        series.restrict(&bounds);
        Ok(Value::Series(series))
    })
    .pushdown()
    .doc("Keep the points between `#:fromdate` and `#:todate` (inclusive).")
}

fn resample() -> OperatorSpec {
    let signature = Signature::new()
        .arg(Param::required("series", ParamType::Series))
        .arg(Param::required("freq", ParamType::Str))
        .arg(Param::with_default(
            "method",
            ParamType::Str,
            Value::Str("mean".to_string()),
        ));
    OperatorSpec::new("resample", signature, |mut args| {
        let freq_text = args.str_arg(1)?;
        let freq = Frequency::parse(freq_text)
            .ok_or_else(|| args.error(format!("bad frequency `{freq_text}`")))?;
        let method = args.str_arg(2)?.to_string();
        let aggregate: fn(&[f64]) -> f64 = match method.as_str() {
            "mean" => |v| v.iter().sum::<f64>() / v.len() as f64,
            "sum" => |v| v.iter().sum(),
            "min" => |v| v.iter().copied().fold(f64::INFINITY, f64::min),
            "max" => |v| v.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            "first" => |v| v[0],
            "last" => |v| v[v.len() - 1],
            "count" => |v| v.len() as f64,
            _ => return Err(args.error(format!("bad resampling method `{method}`"))),
        };
        let series = args.take_series(0)?;
        let mut buckets: BTreeMap<NaiveDateTime, Vec<f64>> = BTreeMap::new();
        for (ts, v) in series.iter() {
            buckets.entry(freq.floor(ts)).or_default().push(v);
        }
        Ok(Value::Series(Series::from_points(
            buckets.into_iter().map(|(ts, values)| (ts, aggregate(&values))),
        )))
    })
    .doc("Aggregate a series over a regular grid: `D`, `H`, `T`/`min`, `MS`.")
}

fn cumsum() -> OperatorSpec {
    let signature = Signature::new().arg(Param::required("series", ParamType::Series));
    OperatorSpec::new("cumsum", signature, |mut args| {
        let series = args.take_series(0)?;
        let mut total = 0.0;
        let out = Series::from_points(series.iter().map(|(ts, v)| {
            total += v;
            (ts, total)
        }));
        Ok(Value::Series(out))
    })
    .doc("Cumulative sum of a series.")
}

fn rolling() -> OperatorSpec {
    let signature = Signature::new()
        .arg(Param::required("series", ParamType::Series))
        .arg(Param::required("window", ParamType::Int))
        .keyword(Param::with_default(
            "method",
            ParamType::Str,
            Value::Str("mean".to_string()),
        ));
    OperatorSpec::new("rolling", signature, |mut args| {
        let window = match args.positional(1) {
            Value::Int(n) if *n >= 1 => usize::try_from(*n).unwrap_or(usize::MAX),
            _ => return Err(args.error("window must be a positive number of points")),
        };
        let method = args.str_kw("method").unwrap_or("mean").to_string();
        let aggregate: fn(&[f64]) -> f64 = match method.as_str() {
            "mean" => |v| v.iter().sum::<f64>() / v.len() as f64,
            "sum" => |v| v.iter().sum(),
            "min" => |v| v.iter().copied().fold(f64::INFINITY, f64::min),
            "max" => |v| v.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            "median" => median,
            "std" => |v| {
                let cells: Vec<(f64, f64)> = v.iter().map(|x| (*x, 1.0)).collect();
                combine::sample_std(&cells).unwrap_or(f64::NAN)
            },
            _ => return Err(args.error(format!("bad rolling method `{method}`"))),
        };
        let series = args.take_series(0)?;
        let points: Vec<(NaiveDateTime, f64)> = series.iter().collect();
        let values: Vec<f64> = points.iter().map(|(_, v)| *v).collect();
        // NaN results (std over one value) are dropped by `from_points`
        Ok(Value::Series(Series::from_points(
            points
                .iter()
                .enumerate()
                .skip(window - 1)
                .map(|(end, (ts, _))| (*ts, aggregate(&values[end + 1 - window..=end]))),
        )))
    })
    .doc(
        "Aggregate over a trailing window of `window` points. `#:method` is one of \
         mean (default), sum, min, max, median, std.",
    )
}

fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

fn time_shifted() -> OperatorSpec {
    let signature = Signature::new()
        .arg(Param::required("series", ParamType::Series))
        .keyword(Param::with_default("weeks", ParamType::Int, Value::Int(0)))
        .keyword(Param::with_default("days", ParamType::Int, Value::Int(0)))
        .keyword(Param::with_default("hours", ParamType::Int, Value::Int(0)))
        .keyword(Param::with_default("minutes", ParamType::Int, Value::Int(0)));
    OperatorSpec::raw("time-shifted", signature, time_shifted_op)
        .doc("Shift the value dates of a series by `#:weeks #:days #:hours #:minutes`.")
}

fn int_keyword(
    call: &Call,
    name: &str,
    interp: &Interpreter<'_>,
    ctx: &QueryContext<'_>,
    path: &TreePath,
) -> FormulaResult<i64> {
    let Some(expr) = call.kwargs.get(name) else {
        return Ok(0);
    };
    match interp.eval_slot(expr, ctx, path, name)? {
        Value::Int(v) => Ok(v),
        other => Err(FormulaError::TypeMismatch {
            op: call.op.clone(),
            path: path.to_string(),
            param: name.to_string(),
            expected: ParamType::Int.describe().to_string(),
            found: other.type_name().to_string(),
        }),
    }
}

/// The child is fetched over the window moved back by the shift so the
/// shifted points cover the requested window.
fn time_shifted_op(
    call: &Call,
    interp: &Interpreter<'_>,
    ctx: &QueryContext<'_>,
    path: &TreePath,
) -> FormulaResult<Value> {
    let delta = dates::duration(
        int_keyword(call, "weeks", interp, ctx, path)?,
        int_keyword(call, "days", interp, ctx, path)?,
        int_keyword(call, "hours", interp, ctx, path)?,
        int_keyword(call, "minutes", interp, ctx, path)?,
    )
    .ok_or_else(|| FormulaError::evaluation(&call.op, path.as_str(), "shift out of range"))?;

    let window = ctx.window;
    let moved = Window {
        from: window.from.and_then(|t| t.checked_sub_signed(delta)),
        to: window.to.and_then(|t| t.checked_sub_signed(delta)),
    };
    let scoped = ctx.clone().with_window(moved);
    let series = expect_series(call, interp.eval_slot(&call.args[0], &scoped, path, "0")?, path)?;

    let mut out = Series::from_points(
        series
            .iter()
            .filter_map(|(ts, v)| ts.checked_add_signed(delta).map(|t| (t, v))),
    )
    .with_options(series.options().clone());
    out.restrict(&window);
    Ok(Value::Series(out))
}

fn expect_series(call: &Call, value: Value, path: &TreePath) -> FormulaResult<Series> {
    match value {
        Value::Series(s) => Ok(s),
        other => Err(FormulaError::TypeMismatch {
            op: call.op.clone(),
            path: path.to_string(),
            param: "series".to_string(),
            expected: ParamType::Series.describe().to_string(),
            found: other.type_name().to_string(),
        }),
    }
}

fn timestamp_slot(
    call: &Call,
    index: usize,
    param: &str,
    interp: &Interpreter<'_>,
    ctx: &QueryContext<'_>,
    path: &TreePath,
) -> FormulaResult<NaiveDateTime> {
    let expr = call.args.get(index).ok_or_else(|| {
        FormulaError::evaluation(&call.op, path.as_str(), format!("missing `{param}` argument"))
    })?;
    match interp.eval_slot(expr, ctx, path, &index.to_string())? {
        Value::Timestamp(ts) => Ok(ts),
        Value::Str(text) => parse_timestamp(&text).ok_or_else(|| {
            FormulaError::evaluation(&call.op, path.as_str(), format!("bad {param} `{text}`"))
        }),
        other => Err(FormulaError::TypeMismatch {
            op: call.op.clone(),
            path: path.to_string(),
            param: param.to_string(),
            expected: ParamType::Timestamp.describe().to_string(),
            found: other.type_name().to_string(),
        }),
    }
}

fn asof() -> OperatorSpec {
    let signature = Signature::new()
        .arg(Param::required("revision", ParamType::Timestamp))
        .arg(Param::required("series", ParamType::Series));
    OperatorSpec::raw("asof", signature, |call, interp, ctx, path| {
        let revision = timestamp_slot(call, 0, "revision", interp, ctx, path)?;
        let scoped = ctx.clone().with_revision(Some(revision));
        let series = expect_series(call, interp.eval_slot(&call.args[1], &scoped, path, "1")?, path)?;
        Ok(Value::Series(series))
    })
    .doc("Evaluate the series argument as of another revision date.")
}

fn constant() -> OperatorSpec {
    let signature = Signature::new()
        .arg(Param::required("value", ParamType::Number))
        .arg(Param::required("fromdate", ParamType::Timestamp))
        .arg(Param::required("todate", ParamType::Timestamp))
        .arg(Param::required("freq", ParamType::Str))
        .arg(Param::required("revdate", ParamType::Timestamp));
    OperatorSpec::new("constant", signature, |args| {
        let ctx = args.context()?;
        let value = args.f64_arg(0)?;
        let revdate = args.timestamp_arg(4)?;
        if ctx.revision.is_some_and(|rev| rev < revdate) {
            return Ok(Value::Series(Series::new()));
        }
        let freq_text = args.str_arg(3)?;
        let freq = Frequency::parse(freq_text)
            .ok_or_else(|| args.error(format!("bad frequency `{freq_text}`")))?;
        let horizon = Window::between(args.timestamp_arg(1)?, args.timestamp_arg(2)?)
            .intersect(&ctx.window);
        let (Some(start), Some(end)) = (horizon.from, horizon.to) else {
            return Ok(Value::Series(Series::new()));
        };

        let mut out = Series::new();
        let mut cursor = freq.ceil(start);
        while let Some(ts) = cursor.filter(|ts| *ts <= end) {
            if out.len() >= MAX_GENERATED_POINTS {
                return Err(args.error(format!(
                    "more than {MAX_GENERATED_POINTS} points requested"
                )));
            }
            out.insert(ts, value);
            cursor = freq.next(ts);
        }
        Ok(Value::Series(out))
    })
    .with_context()
    .with_finder(|_, _| Ok(BTreeMap::new()))
    .with_insertion_dates(|call, interp, ctx, path| {
        Ok(vec![timestamp_slot(call, 4, "revdate", interp, ctx, path)?])
    })
    .doc("A constant series over a horizon and a grid, visible from `revdate` on.")
}

// ---------------------------------------------------------------------------
// Dates
// ---------------------------------------------------------------------------

fn date() -> OperatorSpec {
    let signature = Signature::new()
        .arg(Param::required("strdate", ParamType::Str))
        .keyword(Param::optional("tz", ParamType::Str))
        .keyword(Param::with_default("naive", ParamType::Bool, Value::Bool(false)));
    OperatorSpec::new("date", signature, |args| {
        args.exclusive("tz", "naive")?;
        let text = args.str_arg(0)?;
        let ts = parse_timestamp(text)
            .ok_or_else(|| args.error(format!("cannot parse date `{text}`")))?;
        match args.str_kw("tz") {
            // local wall-clock time in the given zone, normalized to UTC
            Some(tz) => {
                let offset = dates::utc_offset(tz)
                    .ok_or_else(|| args.error(format!("unsupported time zone `{tz}`")))?;
                ts.checked_sub_signed(offset)
                    .map(Value::Timestamp)
                    .ok_or_else(|| args.error("date out of range"))
            }
            None => Ok(Value::Timestamp(ts)),
        }
    })
    .pushdown()
    .doc("Parse an ISO-8601 date. `#:tz` (a UTC offset) and `#:naive` are exclusive.")
}

/// The revision being read, or the current UTC time when reading the
/// latest state.
fn today() -> OperatorSpec {
    let signature = Signature::new()
        .keyword(Param::with_default("naive", ParamType::Bool, Value::Bool(false)))
        .keyword(Param::optional("tz", ParamType::Str));
    OperatorSpec::new("today", signature, |args| {
        args.exclusive("tz", "naive")?;
        if let Some(tz) = args.str_kw("tz") {
            dates::utc_offset(tz)
                .ok_or_else(|| args.error(format!("unsupported time zone `{tz}`")))?;
        }
        let ctx = args.context()?;
        Ok(Value::Timestamp(
            ctx.revision.unwrap_or_else(|| Utc::now().naive_utc()),
        ))
    })
    .with_context()
    .doc("The revision date of the query, or now. `#:tz` and `#:naive` are exclusive.")
}

fn shifted() -> OperatorSpec {
    let mut signature = Signature::new().arg(Param::required("date", ParamType::Timestamp));
    for unit in ["years", "months", "weeks", "days", "hours", "minutes"] {
        signature = signature.keyword(Param::with_default(unit, ParamType::Int, Value::Int(0)));
    }
    OperatorSpec::new("shifted", signature, |args| {
        let ts = args.timestamp_arg(0)?;
        let get = |unit: &str| args.int_kw(unit).unwrap_or(0);
        let months = get("years")
            .checked_mul(12)
            .and_then(|m| m.checked_add(get("months")));
        let delta = dates::duration(get("weeks"), get("days"), get("hours"), get("minutes"));
        months
            .zip(delta)
            .and_then(|(months, delta)| dates::shift(ts, months, delta))
            .map(Value::Timestamp)
            .ok_or_else(|| args.error("shift out of range"))
    })
    .pushdown()
    .doc("Move a timestamp by calendar years/months and fixed weeks/days/hours/minutes.")
}

fn month_boundary(name: &'static str, f: fn(NaiveDateTime) -> NaiveDateTime) -> OperatorSpec {
    let signature = Signature::new().arg(Param::required("date", ParamType::Timestamp));
    OperatorSpec::new(name, signature, move |args| {
        Ok(Value::Timestamp(f(args.timestamp_arg(0)?)))
    })
    .pushdown()
}
