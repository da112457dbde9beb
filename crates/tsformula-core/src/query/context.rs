//! Per-query evaluation context threaded through every recursive call.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::NaiveDateTime;

use crate::errors::{FormulaError, FormulaResult};
use crate::models::{Series, Window};
use crate::query::guards::MAX_EVAL_DEPTH;
use crate::query::resolver::Catalog;
use crate::store::series::SeriesStore;

/// Location of a node inside an expression tree, rendered `add/1/series`:
/// operator names separated by the argument slot that leads to them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreePath(String);

impl TreePath {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn child(&self, slot: &str, op: &str) -> TreePath {
        if self.0.is_empty() {
            TreePath(op.to_string())
        } else {
            TreePath(format!("{}/{slot}/{op}", self.0))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TreePath {
    fn from(path: &str) -> Self {
        TreePath(path.to_string())
    }
}

impl fmt::Display for TreePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Shared flag a host flips to abort running evaluations.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
pub struct QueryContext<'a> {
    pub store: &'a dyn SeriesStore,
    pub catalog: &'a dyn Catalog,
    pub window: Window,
    pub revision: Option<NaiveDateTime>,
    pub depth: usize,
    pub max_depth: usize,
    pub deadline: Option<Instant>,
    pub cancel: Option<CancelToken>,
    leaves: Option<&'a HashMap<String, Series>>,
}

impl<'a> QueryContext<'a> {
    pub fn new(store: &'a dyn SeriesStore, catalog: &'a dyn Catalog) -> Self {
        Self {
            store,
            catalog,
            window: Window::all(),
            revision: None,
            depth: 0,
            max_depth: MAX_EVAL_DEPTH,
            deadline: None,
            cancel: None,
            leaves: None,
        }
    }

    pub fn with_window(mut self, window: Window) -> Self {
        self.window = window;
        self
    }

    pub fn with_revision(mut self, revision: Option<NaiveDateTime>) -> Self {
        self.revision = revision;
        self
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Substitute these pre-staircased series for the named primary leaves.
    pub(crate) fn with_staircased_leaves(mut self, leaves: &'a HashMap<String, Series>) -> Self {
        self.leaves = Some(leaves);
        self
    }

    pub fn staircased_leaf(&self, name: &str) -> Option<&'a Series> {
        self.leaves.and_then(|leaves| leaves.get(name))
    }

    /// Fail once the deadline passed or the query was cancelled.
    pub fn checkpoint(&self, path: &TreePath) -> FormulaResult<()> {
        if self.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
            return Err(FormulaError::Cancelled {
                path: path.to_string(),
            });
        }
        if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Err(FormulaError::DeadlineExceeded {
                path: path.to_string(),
            });
        }
        Ok(())
    }

    /// Context for one level deeper in the tree.
    pub fn descend(&self, path: &TreePath) -> FormulaResult<QueryContext<'a>> {
        if self.depth >= self.max_depth {
            return Err(FormulaError::RecursionLimit {
                limit: self.max_depth,
                path: path.to_string(),
            });
        }
        let mut next = self.clone();
        next.depth += 1;
        Ok(next)
    }

    /// Fetch a primary series through the store, honouring window and
    /// revision.
    pub fn fetch_primary(&self, name: &str, path: &TreePath) -> FormulaResult<Option<Series>> {
        self.checkpoint(path)?;
        self.store.get(name, &self.window, self.revision)
    }
}
