//! Union alignment of several series and the row kernels of the
//! multi-series combinators.

use std::collections::BTreeSet;

use chrono::NaiveDateTime;

use crate::models::{FillMethod, FillPolicy, Series, SeriesOptions};

/// Several series laid out on the union of their indexes, each column
/// filled according to its own options when alignment asked for it.
pub(crate) struct Aligned {
    pub index: Vec<NaiveDateTime>,
    pub columns: Vec<Vec<Option<f64>>>,
    pub weights: Vec<f64>,
}

impl Aligned {
    pub fn rows(&self) -> impl Iterator<Item = (NaiveDateTime, Vec<Option<f64>>)> + '_ {
        self.index.iter().enumerate().map(move |(row, ts)| {
            (
                *ts,
                self.columns.iter().map(|col| col[row]).collect::<Vec<_>>(),
            )
        })
    }
}

pub(crate) fn align(inputs: &[Series], fill: bool) -> Aligned {
    let index: Vec<NaiveDateTime> = inputs
        .iter()
        .flat_map(|s| s.index())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let columns = inputs
        .iter()
        .map(|s| {
            let mut col: Vec<Option<f64>> = index.iter().map(|ts| s.get(ts)).collect();
            if fill {
                fill_column(&mut col, s.options());
            }
            col
        })
        .collect();
    let weights = inputs
        .iter()
        .map(|s| s.options().weight.unwrap_or(1.0))
        .collect();
    Aligned {
        index,
        columns,
        weights,
    }
}

/// Substitute missing cells of one aligned column. `limit` caps the number
/// of consecutive cells a method fills, or the total for a constant.
pub(crate) fn fill_column(col: &mut [Option<f64>], options: &SeriesOptions) {
    match &options.fill {
        None => {}
        Some(FillPolicy::Value(v)) => {
            let mut budget = options.limit.unwrap_or(usize::MAX);
            for cell in col.iter_mut().filter(|c| c.is_none()) {
                if budget == 0 {
                    break;
                }
                *cell = Some(*v);
                budget -= 1;
            }
        }
        Some(FillPolicy::Methods(methods)) => {
            for method in methods {
                match method {
                    FillMethod::Forward => propagate(col.iter_mut(), options.limit),
                    FillMethod::Backward => propagate(col.iter_mut().rev(), options.limit),
                }
            }
        }
    }
}

fn propagate<'a>(cells: impl Iterator<Item = &'a mut Option<f64>>, limit: Option<usize>) {
    let limit = limit.unwrap_or(usize::MAX);
    let mut last = None;
    let mut run = 0;
    for cell in cells {
        match *cell {
            Some(v) => {
                last = Some(v);
                run = 0;
            }
            None => {
                if let Some(v) = last {
                    if run < limit {
                        *cell = Some(v);
                    }
                    run += 1;
                }
            }
        }
    }
}

/// Combine rows where every input is defined, after filling.
pub(crate) fn strict(inputs: &[Series], f: impl Fn(&[f64]) -> f64) -> Series {
    let aligned = align(inputs, true);
    let mut out = Series::new();
    for (ts, row) in aligned.rows() {
        if let Some(values) = row.into_iter().collect::<Option<Vec<f64>>>() {
            out.insert(ts, f(&values));
        }
    }
    out
}

/// Combine rows from their defined cells, paired with each input's weight.
/// Fill options are ignored. With `skipna` off a row with any missing cell
/// is dropped.
pub(crate) fn lenient(
    inputs: &[Series],
    skipna: bool,
    f: impl Fn(&[(f64, f64)]) -> Option<f64>,
) -> Series {
    let aligned = align(inputs, false);
    let mut out = Series::new();
    for (ts, row) in aligned.rows() {
        if !skipna && row.iter().any(Option::is_none) {
            continue;
        }
        let defined: Vec<(f64, f64)> = row
            .iter()
            .zip(&aligned.weights)
            .filter_map(|(cell, w)| cell.map(|v| (v, *w)))
            .collect();
        if defined.is_empty() {
            continue;
        }
        if let Some(v) = f(&defined) {
            out.insert(ts, v);
        }
    }
    out
}

pub(crate) fn sum(values: &[f64]) -> f64 {
    values.iter().sum()
}

pub(crate) fn product(values: &[f64]) -> f64 {
    values.iter().product()
}

pub(crate) fn weighted_mean(cells: &[(f64, f64)]) -> Option<f64> {
    let total: f64 = cells.iter().map(|(_, w)| w).sum();
    if total == 0.0 {
        return None;
    }
    Some(cells.iter().map(|(v, w)| v * w).sum::<f64>() / total)
}

/// Sample standard deviation (one degree of freedom).
pub(crate) fn sample_std(cells: &[(f64, f64)]) -> Option<f64> {
    if cells.len() < 2 {
        return None;
    }
    let n = cells.len() as f64;
    let mean = cells.iter().map(|(v, _)| v).sum::<f64>() / n;
    let var = cells.iter().map(|(v, _)| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    Some(var.sqrt())
}

/// For each timestamp, the value of the first input defining it. Fill
/// options are ignored.
pub(crate) fn patch(inputs: &[Series]) -> Series {
    let aligned = align(inputs, false);
    let mut out = Series::new();
    for (ts, row) in aligned.rows() {
        if let Some(v) = row.into_iter().flatten().next() {
            out.insert(ts, v);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn day(d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2020, 1, d)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    fn series(points: &[(u32, f64)]) -> Series {
        Series::from_points(points.iter().map(|(d, v)| (day(*d), *v)))
    }

    fn filled(points: &[(u32, f64)], fill: FillPolicy, limit: Option<usize>) -> Series {
        series(points).with_options(SeriesOptions {
            fill: Some(fill),
            limit,
            weight: None,
        })
    }

    #[test]
    fn strict_drops_partial_rows() {
        let out = strict(
            &[series(&[(1, 1.0), (2, 2.0)]), series(&[(2, 10.0), (3, 20.0)])],
            sum,
        );
        assert_eq!(out, series(&[(2, 12.0)]));
    }

    #[test]
    fn constant_fill_completes_rows() {
        let out = strict(
            &[
                series(&[(1, 1.0), (2, 2.0), (3, 3.0)]),
                filled(&[(2, 10.0)], FillPolicy::Value(0.0), None),
            ],
            sum,
        );
        assert_eq!(out, series(&[(1, 1.0), (2, 12.0), (3, 3.0)]));
    }

    #[test]
    fn forward_fill_respects_limit() {
        let mut col = vec![Some(1.0), None, None, None, Some(2.0), None];
        let options = SeriesOptions {
            fill: Some(FillPolicy::Methods(vec![FillMethod::Forward])),
            limit: Some(2),
            weight: None,
        };
        fill_column(&mut col, &options);
        assert_eq!(
            col,
            vec![Some(1.0), Some(1.0), Some(1.0), None, Some(2.0), Some(2.0)]
        );
    }

    #[test]
    fn ffill_then_bfill_covers_both_edges() {
        let mut col = vec![None, Some(3.0), None];
        let options = SeriesOptions {
            fill: FillPolicy::parse("ffill,bfill"),
            ..SeriesOptions::default()
        };
        fill_column(&mut col, &options);
        assert_eq!(col, vec![Some(3.0), Some(3.0), Some(3.0)]);
    }

    #[test]
    fn patch_prefers_earlier_inputs() {
        let out = patch(&[
            series(&[(1, 1.0), (2, 2.0)]),
            series(&[(2, 20.0), (3, 30.0)]),
        ]);
        assert_eq!(out, series(&[(1, 1.0), (2, 2.0), (3, 30.0)]));
    }

    #[test]
    fn weighted_mean_skips_missing_cells() {
        let heavy = series(&[(1, 1.0), (2, 1.0)]).with_options(SeriesOptions {
            weight: Some(3.0),
            ..SeriesOptions::default()
        });
        let light = series(&[(1, 5.0)]);
        let out = lenient(&[heavy, light], true, weighted_mean);
        assert_eq!(out, series(&[(1, 2.0), (2, 1.0)]));
    }

    #[test]
    fn std_needs_two_values() {
        assert_eq!(sample_std(&[(1.0, 1.0)]), None);
        assert_eq!(sample_std(&[(1.0, 1.0), (3.0, 1.0)]), Some(2f64.sqrt()));
    }

    #[test]
    fn patch_and_row_kernels_ignore_fill() {
        let holes = filled(&[(1, 1.0)], FillPolicy::Value(0.0), None);
        let other = series(&[(2, 5.0)]);
        let patched = patch(&[holes.clone(), other.clone()]);
        assert_eq!(patched, series(&[(1, 1.0), (2, 5.0)]));

        let mean = lenient(&[holes, other], false, weighted_mean);
        assert!(mean.is_empty());
    }
}
