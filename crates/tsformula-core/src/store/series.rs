//! Primary series store interface and a versioned in-memory implementation.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{NaiveDateTime, TimeDelta};
use parking_lot::RwLock;

use crate::errors::FormulaResult;
use crate::models::{Series, SeriesMeta, Window};

/// Read access to versioned primary series.
///
/// `revision` selects the state as of that insertion date (latest when
/// `None`). Unknown names yield `Ok(None)`.
pub trait SeriesStore: Send + Sync {
    fn get(
        &self,
        name: &str,
        window: &Window,
        revision: Option<NaiveDateTime>,
    ) -> FormulaResult<Option<Series>>;

    fn metadata(&self, name: &str) -> FormulaResult<Option<SeriesMeta>>;

    /// Insertion dates of `name`, bounded by `window` (on insertion dates).
    fn insertion_dates(&self, name: &str, window: &Window) -> FormulaResult<Vec<NaiveDateTime>>;

    /// For each value date `t` in `window`, the value known at revision
    /// `t - delta`.
    ///
    /// The default walks every revision; stores with a per-point history
    /// should override it.
    fn staircase(
        &self,
        name: &str,
        delta: TimeDelta,
        window: &Window,
    ) -> FormulaResult<Option<Series>> {
        let bound = Window {
            from: None,
            to: window.to.and_then(|t| t.checked_sub_signed(delta)),
        };
        let idates = self.insertion_dates(name, &bound)?;
        if idates.is_empty() {
            return Ok(if self.exists(name)? {
                Some(Series::new())
            } else {
                None
            });
        }
        let mut out = Series::new();
        for (k, idate) in idates.iter().enumerate() {
            let lo = idate.checked_add_signed(delta);
            let hi = idates.get(k + 1).and_then(|n| n.checked_add_signed(delta));
            let Some(snapshot) = self.get(name, window, Some(*idate))? else {
                continue;
            };
            for (ts, v) in snapshot.iter() {
                if lo.is_some_and(|lo| ts >= lo) && hi.map_or(true, |hi| ts < hi) {
                    out.insert(ts, v);
                }
            }
        }
        Ok(Some(out))
    }

    fn exists(&self, name: &str) -> FormulaResult<bool> {
        Ok(self.metadata(name)?.is_some())
    }
}

/// One point history: `(insertion date, value)`, `None` meaning erased.
type History = Vec<(NaiveDateTime, Option<f64>)>;

#[derive(Debug, Default)]
struct Versioned {
    meta: SeriesMeta,
    idates: BTreeSet<NaiveDateTime>,
    points: BTreeMap<NaiveDateTime, History>,
}

impl Versioned {
    fn value_at(history: &History, revision: Option<NaiveDateTime>) -> Option<f64> {
        let upto = match revision {
            Some(rev) => history.partition_point(|(at, _)| *at <= rev),
            None => history.len(),
        };
        upto.checked_sub(1).and_then(|idx| history[idx].1)
    }

    fn apply(&mut self, at: NaiveDateTime, points: impl IntoIterator<Item = (NaiveDateTime, Option<f64>)>) {
        self.idates.insert(at);
        for (ts, value) in points {
            let value = value.filter(|v| !v.is_nan());
            let history = self.points.entry(ts).or_default();
            let pos = history.partition_point(|(when, _)| *when <= at);
            if pos > 0 && history[pos - 1].0 == at {
                history[pos - 1].1 = value;
            } else {
                history.insert(pos, (at, value));
            }
        }
    }
}

/// Thread-safe in-memory store keeping every revision of every point.
#[derive(Debug, Default)]
pub struct MemoryStore {
    series: RwLock<HashMap<String, Versioned>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a revision at insertion date `at`. NaN values erase.
    pub fn insert<I>(&self, name: &str, at: NaiveDateTime, points: I)
    where
        I: IntoIterator<Item = (NaiveDateTime, f64)>,
    {
        self.update(name, at, points.into_iter().map(|(ts, v)| (ts, Some(v))));
    }

    /// Record a revision mixing upserts (`Some`) and erasures (`None`).
    pub fn update<I>(&self, name: &str, at: NaiveDateTime, points: I)
    where
        I: IntoIterator<Item = (NaiveDateTime, Option<f64>)>,
    {
        let mut series = self.series.write();
        series.entry(name.to_string()).or_default().apply(at, points);
    }

    pub fn set_metadata(&self, name: &str, meta: SeriesMeta) {
        let mut series = self.series.write();
        series.entry(name.to_string()).or_default().meta = meta;
    }

    pub fn remove(&self, name: &str) -> bool {
        self.series.write().remove(name).is_some()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.series.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl SeriesStore for MemoryStore {
    fn get(
        &self,
        name: &str,
        window: &Window,
        revision: Option<NaiveDateTime>,
    ) -> FormulaResult<Option<Series>> {
        let series = self.series.read();
        let Some(stored) = series.get(name) else {
            return Ok(None);
        };
        let points = stored
            .points
            .iter()
            .filter(|(ts, _)| window.contains(**ts))
            .filter_map(|(ts, history)| Versioned::value_at(history, revision).map(|v| (*ts, v)));
        Ok(Some(Series::from_points(points)))
    }

    fn metadata(&self, name: &str) -> FormulaResult<Option<SeriesMeta>> {
        Ok(self.series.read().get(name).map(|s| s.meta.clone()))
    }

    fn insertion_dates(&self, name: &str, window: &Window) -> FormulaResult<Vec<NaiveDateTime>> {
        Ok(self
            .series
            .read()
            .get(name)
            .map(|s| s.idates.iter().copied().filter(|d| window.contains(*d)).collect())
            .unwrap_or_default())
    }

    fn staircase(
        &self,
        name: &str,
        delta: TimeDelta,
        window: &Window,
    ) -> FormulaResult<Option<Series>> {
        let series = self.series.read();
        let Some(stored) = series.get(name) else {
            return Ok(None);
        };
        let points = stored
            .points
            .iter()
            .filter(|(ts, _)| window.contains(**ts))
            .filter_map(|(ts, history)| {
                let asof = ts.checked_sub_signed(delta)?;
                Versioned::value_at(history, Some(asof)).map(|v| (*ts, v))
            });
        Ok(Some(Series::from_points(points)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::parse_timestamp;

    fn ts(text: &str) -> NaiveDateTime {
        parse_timestamp(text).unwrap()
    }

    /// Forecast revised each day for the next two days.
    fn forecasts() -> MemoryStore {
        let store = MemoryStore::new();
        store.insert(
            "fc",
            ts("2020-01-01"),
            [(ts("2020-01-02"), 1.0), (ts("2020-01-03"), 1.0)],
        );
        store.insert(
            "fc",
            ts("2020-01-02"),
            [(ts("2020-01-03"), 2.0), (ts("2020-01-04"), 2.0)],
        );
        store.update("fc", ts("2020-01-03"), [(ts("2020-01-04"), None)]);
        store
    }

    #[test]
    fn revisions_are_replayed_up_to_the_requested_date() {
        let store = forecasts();
        let latest = store.get("fc", &Window::all(), None).unwrap().unwrap();
        assert_eq!(latest.values(), vec![1.0, 2.0]);

        let first = store
            .get("fc", &Window::all(), Some(ts("2020-01-01 12:00")))
            .unwrap()
            .unwrap();
        assert_eq!(first.values(), vec![1.0, 1.0]);

        let second = store
            .get("fc", &Window::all(), Some(ts("2020-01-02")))
            .unwrap()
            .unwrap();
        assert_eq!(second.values(), vec![1.0, 2.0, 2.0]);
        assert!(store.get("missing", &Window::all(), None).unwrap().is_none());
    }

    #[test]
    fn native_staircase_matches_the_generic_walk() {
        struct Generic<'a>(&'a MemoryStore);
        impl SeriesStore for Generic<'_> {
            fn get(
                &self,
                name: &str,
                window: &Window,
                revision: Option<NaiveDateTime>,
            ) -> FormulaResult<Option<Series>> {
                self.0.get(name, window, revision)
            }
            fn metadata(&self, name: &str) -> FormulaResult<Option<SeriesMeta>> {
                self.0.metadata(name)
            }
            fn insertion_dates(
                &self,
                name: &str,
                window: &Window,
            ) -> FormulaResult<Vec<NaiveDateTime>> {
                self.0.insertion_dates(name, window)
            }
        }

        let store = forecasts();
        for hours in [0, 12, 24, 36] {
            let delta = TimeDelta::try_hours(hours).unwrap();
            let native = store.staircase("fc", delta, &Window::all()).unwrap();
            let generic = Generic(&store).staircase("fc", delta, &Window::all()).unwrap();
            assert_eq!(native, generic, "delta {hours}h");
        }
        let one_day = store
            .staircase("fc", TimeDelta::try_days(1).unwrap(), &Window::all())
            .unwrap()
            .unwrap();
        assert_eq!(one_day.iter().collect::<Vec<_>>(), vec![
            (ts("2020-01-02"), 1.0),
            (ts("2020-01-03"), 2.0),
        ]);
    }

    #[test]
    fn insertion_dates_are_bounded() {
        let store = forecasts();
        let all = store.insertion_dates("fc", &Window::all()).unwrap();
        assert_eq!(all.len(), 3);
        let early = store
            .insertion_dates(
                "fc",
                &Window {
                    from: None,
                    to: Some(ts("2020-01-01")),
                },
            )
            .unwrap();
        assert_eq!(early, vec![ts("2020-01-01")]);
    }
}
