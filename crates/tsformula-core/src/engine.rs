//! The formula engine: registration, evaluation, staircase and
//! introspection over one primary series store and one formula database.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{NaiveDateTime, TimeDelta};
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::alias::{self, ArithmeticAlias, PriorityAlias};
use crate::config::EngineConfig;
use crate::editor::{ComponentInfo, EditorWalker};
use crate::errors::{FormulaError, FormulaResult};
use crate::expr::{parse, Call, Expr};
use crate::models::{
    FormulaRecord, GroupBindingRecord, GroupFormulaRecord, Series, SeriesMeta, Value, Window,
};
use crate::ops::{OperatorRegistry, OperatorSpec};
use crate::query::context::{CancelToken, QueryContext};
use crate::query::guards::{MAX_RESOLVE_DEPTH, MAX_WRITE_ATTEMPTS};
use crate::query::interpreter::Interpreter;
use crate::query::planner::PlanCache;
use crate::query::resolver::{Catalog, Dependency, Resolver};
use crate::query::staircase::{self, is_pushdown_eligible, StaircasePath};
use crate::store::database::{FormulaStore, FormulaWrite};
use crate::store::series::SeriesStore;

/// Options of [`Engine::register_formula`].
#[derive(Debug, Clone)]
pub struct RegisterOptions {
    /// Caller metadata, merged over the metadata derived from the leaves.
    pub metadata: Option<serde_json::Value>,
    pub reject_unknown: bool,
    pub update: bool,
}

impl Default for RegisterOptions {
    fn default() -> Self {
        Self {
            metadata: None,
            reject_unknown: true,
            update: false,
        }
    }
}

impl RegisterOptions {
    pub fn update() -> Self {
        Self {
            update: true,
            ..Self::default()
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn allow_unknown(mut self) -> Self {
        self.reject_unknown = false;
        self
    }
}

/// Window, revision and cancellation of one read.
#[derive(Debug, Clone, Default)]
pub struct EvalOptions {
    pub window: Window,
    pub revision: Option<NaiveDateTime>,
    pub cancel: Option<CancelToken>,
}

impl EvalOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn window(mut self, window: Window) -> Self {
        self.window = window;
        self
    }

    pub fn revision(mut self, revision: NaiveDateTime) -> Self {
        self.revision = Some(revision);
        self
    }

    pub fn cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Formula trees read from the database through the engine's tree cache;
/// primary metadata from the series store.
struct EngineCatalog<'e> {
    formulas: &'e FormulaStore,
    store: &'e dyn SeriesStore,
    trees: &'e PlanCache<String, Option<Arc<Expr>>>,
}

impl Catalog for EngineCatalog<'_> {
    fn formula_tree(&self, name: &str) -> FormulaResult<Option<Arc<Expr>>> {
        let (tree, _) = self.trees.get_or_compute(&name.to_string(), || {
            match self.formulas.formula(name)? {
                Some(record) => Ok(Some(Arc::new(parse(&record.text)?))),
                None => Ok(None),
            }
        })?;
        Ok(tree)
    }

    fn primary_metadata(&self, name: &str) -> FormulaResult<Option<SeriesMeta>> {
        self.store.metadata(name)
    }
}

/// A catalog seeing some formulas as they are about to be written.
struct Overlay<'c> {
    inner: &'c dyn Catalog,
    trees: HashMap<String, Arc<Expr>>,
}

impl Catalog for Overlay<'_> {
    fn formula_tree(&self, name: &str) -> FormulaResult<Option<Arc<Expr>>> {
        match self.trees.get(name) {
            Some(tree) => Ok(Some(Arc::clone(tree))),
            None => self.inner.formula_tree(name),
        }
    }

    fn primary_metadata(&self, name: &str) -> FormulaResult<Option<SeriesMeta>> {
        self.inner.primary_metadata(name)
    }
}

/// Text starting with `(` is an expression, anything else a series name.
fn tree_for(text_or_name: &str) -> FormulaResult<Expr> {
    let trimmed = text_or_name.trim_start();
    if trimmed.starts_with('(') {
        parse(trimmed)
    } else {
        Ok(Expr::series(text_or_name))
    }
}

fn into_series(value: Value) -> FormulaResult<Series> {
    match value {
        Value::Series(series) => Ok(series),
        other => Err(FormulaError::evaluation(
            "eval",
            "",
            format!("expression yields a {}, not a series", other.type_name()),
        )),
    }
}

pub struct Engine<S: SeriesStore> {
    store: S,
    formulas: FormulaStore,
    registry: RwLock<Arc<OperatorRegistry>>,
    config: EngineConfig,
    trees: PlanCache<String, Option<Arc<Expr>>>,
    eligibility: PlanCache<String, bool>,
    seen_epoch: AtomicI64,
}

impl<S: SeriesStore> Engine<S> {
    /// Open (and stamp) the formula database at `db_path`, configured
    /// from the environment.
    pub fn new(store: S, db_path: impl AsRef<Path>) -> FormulaResult<Self> {
        Self::with_config(store, db_path, EngineConfig::from_env())
    }

    pub fn with_config(
        store: S,
        db_path: impl AsRef<Path>,
        config: EngineConfig,
    ) -> FormulaResult<Self> {
        let formulas = FormulaStore::new(db_path)?;
        formulas.init_schema()?;
        let epoch = formulas.cache_epoch()?;
        info!(db = %formulas.db_path().display(), epoch, "formula engine ready");
        Ok(Self {
            store,
            formulas,
            registry: RwLock::new(Arc::new(OperatorRegistry::with_builtins())),
            trees: PlanCache::new(config.cache_entries, config.cache_ttl_seconds),
            eligibility: PlanCache::new(config.cache_entries, config.cache_ttl_seconds),
            config,
            seen_epoch: AtomicI64::new(epoch),
        })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn formula_store(&self) -> &FormulaStore {
        &self.formulas
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Snapshot of the operator table.
    pub fn registry(&self) -> Arc<OperatorRegistry> {
        Arc::clone(&self.registry.read())
    }

    pub fn cache_stats(&self) -> BTreeMap<String, i64> {
        let mut stats = BTreeMap::new();
        for (prefix, cache) in [("trees", self.trees.stats()), ("eligibility", self.eligibility.stats())] {
            for (key, value) in cache {
                stats.insert(format!("{prefix}.{key}"), value);
            }
        }
        stats
    }

    fn catalog(&self) -> EngineCatalog<'_> {
        EngineCatalog {
            formulas: &self.formulas,
            store: &self.store,
            trees: &self.trees,
        }
    }

    fn clear_caches(&self) {
        self.trees.clear();
        self.eligibility.clear();
    }

    /// Drop cached trees and classifications once another writer bumped
    /// the database epoch; returns the epoch the caches now follow.
    fn sync_caches(&self) -> FormulaResult<i64> {
        let epoch = self.formulas.cache_epoch()?;
        let previous = self.seen_epoch.swap(epoch, Ordering::SeqCst);
        if previous != epoch {
            debug!(previous, epoch, "formula epoch moved, clearing caches");
            self.clear_caches();
        }
        Ok(epoch)
    }

    fn context<'c>(&'c self, catalog: &'c dyn Catalog, options: &EvalOptions) -> QueryContext<'c> {
        let mut ctx = QueryContext::new(&self.store, catalog)
            .with_window(options.window)
            .with_revision(options.revision)
            .with_max_depth(self.config.max_depth);
        if let Some(timeout) = self.config.timeout {
            ctx = ctx.with_timeout(timeout);
        }
        if let Some(token) = &options.cancel {
            ctx = ctx.with_cancel(token.clone());
        }
        ctx
    }

    // -- operators -----------------------------------------------------------

    /// Add a third-party operator. Name collisions fail with
    /// `DuplicateOperator`.
    pub fn register_operator(&self, spec: OperatorSpec) -> FormulaResult<()> {
        let name = spec.name.clone();
        {
            let mut registry = self.registry.write();
            Arc::make_mut(&mut registry).register(spec)?;
        }
        self.clear_caches();
        info!(op = %name, "operator registered");
        Ok(())
    }

    /// Add or replace an operator.
    pub fn register_operator_override(&self, spec: OperatorSpec) {
        let name = spec.name.clone();
        let previous = {
            let mut registry = self.registry.write();
            Arc::make_mut(&mut registry).register_override(spec)
        };
        self.clear_caches();
        info!(op = %name, replaced = previous.is_some(), "operator registered");
    }

    // -- registration --------------------------------------------------------

    /// Parse, check, resolve and store a formula with its dependency edges.
    ///
    /// Resolution runs against the epoch read first; if another writer got
    /// in before the write transaction, the formula is resolved again.
    pub fn register_formula(
        &self,
        name: &str,
        text: &str,
        options: &RegisterOptions,
    ) -> FormulaResult<i64> {
        let tree = parse(text)?;
        self.registry().check_tree(&tree)?;
        let mut attempt = 1;
        loop {
            match self.resolve_and_write(name, text, &tree, options) {
                Err(FormulaError::ConcurrentWrite { expected, found })
                    if attempt < MAX_WRITE_ATTEMPTS =>
                {
                    debug!(name, attempt, expected, found, "formula database moved, resolving again");
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    fn resolve_and_write(
        &self,
        name: &str,
        text: &str,
        tree: &Expr,
        options: &RegisterOptions,
    ) -> FormulaResult<i64> {
        let resolved_at = self.sync_caches()?;
        let registry = self.registry();

        let existing = self.formulas.formula(name)?;
        if existing.is_some() && !options.update {
            return Err(FormulaError::FormulaExists {
                name: name.to_string(),
            });
        }

        let catalog = self.catalog();
        let deps = Resolver::new(&registry, &catalog).resolve_for(name, tree)?;
        if options.reject_unknown {
            Resolver::reject_unknown(&deps)?;
        }

        let mut metadata = match existing {
            Some(record) if record.metadata.is_object() => record.metadata,
            _ => serde_json::json!({}),
        };
        let derived = first_primary_meta(tree, &catalog, 0)?.unwrap_or_default();
        merge_json(&mut metadata, serde_json::to_value(derived)?);
        if let Some(extra) = &options.metadata {
            merge_json(&mut metadata, extra.clone());
        }

        let overlay = Overlay {
            inner: &catalog,
            trees: HashMap::from([(name.to_string(), Arc::new(tree.clone()))]),
        };
        let overlay_resolver = Resolver::new(&registry, &overlay);
        let mut refreshed = Vec::new();
        for dependent in self.formulas.dependents(name)? {
            if let Some(dependent_tree) = overlay.formula_tree(&dependent)? {
                let needs = overlay_resolver
                    .resolve_for(&dependent, &dependent_tree)?
                    .into_keys()
                    .collect();
                refreshed.push((dependent, needs));
            }
        }

        let write = FormulaWrite {
            name: name.to_string(),
            text: text.to_string(),
            content_hash: tree.content_hash(),
            metadata: Some(metadata),
            needs: deps.keys().cloned().collect(),
        };
        let id = self
            .formulas
            .write_formula(&write, options.update, &refreshed, Some(resolved_at))?;
        self.clear_caches();
        info!(
            name,
            id,
            needs = write.needs.len(),
            refreshed = refreshed.len(),
            "formula registered"
        );
        Ok(id)
    }

    pub fn delete_formula(&self, name: &str) -> FormulaResult<bool> {
        let removed = self.formulas.delete_formula(name)?;
        self.clear_caches();
        if removed {
            info!(name, "formula deleted");
        }
        Ok(removed)
    }

    /// Merge `metadata` keys into the stored formula metadata.
    pub fn update_metadata(&self, name: &str, metadata: serde_json::Value) -> FormulaResult<bool> {
        let Some(record) = self.formulas.formula(name)? else {
            return Ok(false);
        };
        let mut merged = record.metadata;
        merge_json(&mut merged, metadata);
        self.formulas.update_metadata(name, &merged)
    }

    /// Rewrite every formula referencing series `old` so it references
    /// `new`; hashes and edges are recomputed. Returns the rewritten names.
    pub fn rename_references(&self, old: &str, new: &str) -> FormulaResult<Vec<String>> {
        self.sync_caches()?;
        let mut conflicts = Vec::new();
        let mut rewritten: HashMap<String, Arc<Expr>> = HashMap::new();
        let mut texts: HashMap<String, String> = HashMap::new();
        for record in self.formulas.list_formulas()? {
            let mut tree = parse(&record.text)?;
            let names = tree.series_names();
            if names.iter().any(|n| n == new) {
                conflicts.push(record.name);
                continue;
            }
            if tree.rename_series(old, new) {
                rewritten.insert(record.name.clone(), Arc::new(tree));
            }
            texts.insert(record.name, record.text);
        }
        if !conflicts.is_empty() {
            return Err(FormulaError::RenameConflict { formulas: conflicts });
        }
        if rewritten.is_empty() {
            return Ok(Vec::new());
        }

        let registry = self.registry();
        let catalog = self.catalog();
        let overlay = Overlay {
            inner: &catalog,
            trees: rewritten,
        };
        let resolver = Resolver::new(&registry, &overlay);
        let mut affected: BTreeSet<String> = overlay.trees.keys().cloned().collect();
        for name in overlay.trees.keys() {
            affected.extend(self.formulas.dependents(name)?);
        }

        let mut writes = Vec::with_capacity(affected.len());
        for name in &affected {
            let Some(tree) = overlay.formula_tree(name)? else {
                continue;
            };
            let needs = resolver.resolve_for(name, &tree)?.into_keys().collect();
            let text = if overlay.trees.contains_key(name) {
                tree.canonical()
            } else {
                texts.get(name).cloned().unwrap_or_else(|| tree.canonical())
            };
            writes.push(FormulaWrite {
                name: name.clone(),
                text,
                content_hash: tree.content_hash(),
                metadata: None,
                needs,
            });
        }
        self.formulas.rewrite_formulas(&writes)?;
        self.clear_caches();

        let mut names: Vec<String> = overlay.trees.into_keys().collect();
        names.sort();
        info!(old, new, formulas = names.len(), "references renamed");
        Ok(names)
    }

    /// Register formulas converted from legacy aliases. Aliases already
    /// stored as formulas are skipped. Returns `(alias, text)` of each
    /// registered formula.
    pub fn import_aliases(
        &self,
        arithmetic: &[ArithmeticAlias],
        priority: &[PriorityAlias],
    ) -> FormulaResult<Vec<(String, String)>> {
        let mut registered = Vec::new();
        let converted = alias::arithmetic_formulas(arithmetic)
            .into_iter()
            .chain(alias::priority_formulas(priority));
        for (name, text) in converted {
            if self.formulas.formula_exists(&name)? {
                info!(name = %name, "skipping known formula");
                continue;
            }
            self.register_formula(&name, &text, &RegisterOptions::default().allow_unknown())?;
            debug!(name = %name, text = %text, "alias converted");
            registered.push((name, text));
        }
        Ok(registered)
    }

    // -- evaluation ----------------------------------------------------------

    /// Evaluate an expression (text starting with `(`) or a named series.
    pub fn evaluate(&self, text_or_name: &str, options: &EvalOptions) -> FormulaResult<Value> {
        self.sync_caches()?;
        let tree = tree_for(text_or_name)?;
        let registry = self.registry();
        let catalog = self.catalog();
        let ctx = self.context(&catalog, options);
        debug!(expr = %tree, revision = ?options.revision, "evaluating");
        Interpreter::new(&registry)
            .with_parallel(self.config.parallel_fanout)
            .evaluate(&tree, &ctx)
    }

    pub fn eval_formula(&self, text_or_name: &str, options: &EvalOptions) -> FormulaResult<Series> {
        into_series(self.evaluate(text_or_name, options)?)
    }

    /// For every value date `t` in the window, the value known at `t - delta`.
    pub fn staircase(
        &self,
        text_or_name: &str,
        delta: TimeDelta,
        options: &EvalOptions,
    ) -> FormulaResult<Series> {
        Ok(self.staircase_with_path(text_or_name, delta, options)?.0)
    }

    /// [`Engine::staircase`], also reporting which path ran.
    pub fn staircase_with_path(
        &self,
        text_or_name: &str,
        delta: TimeDelta,
        options: &EvalOptions,
    ) -> FormulaResult<(Series, StaircasePath)> {
        self.sync_caches()?;
        let tree = tree_for(text_or_name)?;
        let registry = self.registry();
        let catalog = self.catalog();
        let (eligible, mode) = self
            .eligibility
            .get_or_compute(&tree.content_hash(), || {
                is_pushdown_eligible(&tree, &registry, &catalog)
            })?;
        debug!(expr = %tree, eligible, cache = mode.as_str(), "staircase classification");
        let ctx = self.context(&catalog, options);
        let interpreter = Interpreter::new(&registry).with_parallel(self.config.parallel_fanout);
        staircase::staircase(&interpreter, &ctx, &tree, delta, eligible)
    }

    /// The staircase by replaying every revision, whatever the tree.
    pub fn staircase_naive(
        &self,
        text_or_name: &str,
        delta: TimeDelta,
        options: &EvalOptions,
    ) -> FormulaResult<Series> {
        self.sync_caches()?;
        let tree = tree_for(text_or_name)?;
        let registry = self.registry();
        let catalog = self.catalog();
        let ctx = self.context(&catalog, options);
        let interpreter = Interpreter::new(&registry).with_parallel(self.config.parallel_fanout);
        staircase::naive_staircase(&interpreter, &ctx, &tree, delta)
    }

    /// The formula as it was at each of its revision dates falling in
    /// `idates`.
    pub fn history(
        &self,
        text_or_name: &str,
        idates: &Window,
        options: &EvalOptions,
    ) -> FormulaResult<BTreeMap<NaiveDateTime, Series>> {
        self.sync_caches()?;
        let tree = tree_for(text_or_name)?;
        let registry = self.registry();
        let catalog = self.catalog();
        let interpreter = Interpreter::new(&registry).with_parallel(self.config.parallel_fanout);
        let base = self.context(&catalog, options);
        let revisions = staircase::revision_dates(&interpreter, &base, &tree, idates)?;
        let mut history = BTreeMap::new();
        for revision in revisions {
            let ctx = base.clone().with_revision(Some(revision));
            history.insert(revision, into_series(interpreter.evaluate(&tree, &ctx)?)?);
        }
        Ok(history)
    }

    // -- introspection -------------------------------------------------------

    pub fn formula(&self, name: &str) -> FormulaResult<Option<String>> {
        Ok(self.formulas.formula(name)?.map(|record| record.text))
    }

    pub fn formula_record(&self, name: &str) -> FormulaResult<Option<FormulaRecord>> {
        self.formulas.formula(name)
    }

    pub fn list_formulas(&self) -> FormulaResult<Vec<FormulaRecord>> {
        self.formulas.list_formulas()
    }

    /// The formula with nested formulas inlined wherever they are read by a
    /// keyword-free `series` node, then constant-folded.
    pub fn expanded_formula(&self, name: &str) -> FormulaResult<Option<String>> {
        self.sync_caches()?;
        let catalog = self.catalog();
        let Some(tree) = catalog.formula_tree(name)? else {
            return Ok(None);
        };
        let expanded = inline_formulas(&tree, &catalog, 0)?;
        Ok(Some(expanded.fold_constants().canonical()))
    }

    /// Direct dependencies of the formula (or of its expanded form).
    pub fn formula_components(
        &self,
        name: &str,
        expanded: bool,
    ) -> FormulaResult<BTreeMap<String, Dependency>> {
        let text = if expanded {
            self.expanded_formula(name)?
        } else {
            self.formula(name)?
        };
        let Some(text) = text else {
            return Ok(BTreeMap::new());
        };
        let tree = parse(&text)?;
        let registry = self.registry();
        let catalog = self.catalog();
        Resolver::new(&registry, &catalog).resolve(&tree)
    }

    /// Every name the formula needs, transitively, from its stored edges.
    pub fn dependencies(&self, name: &str) -> FormulaResult<Vec<String>> {
        self.formulas.dependencies(name)
    }

    /// Formulas needing `name`, directly or transitively.
    pub fn dependents(&self, name: &str) -> FormulaResult<Vec<String>> {
        self.formulas.dependents(name)
    }

    /// Editor component rows of a stored formula.
    pub fn editor_info(&self, name: &str) -> FormulaResult<Option<Vec<ComponentInfo>>> {
        self.sync_caches()?;
        let registry = self.registry();
        let catalog = self.catalog();
        let Some(tree) = catalog.formula_tree(name)? else {
            return Ok(None);
        };
        EditorWalker::new(&registry, &catalog)
            .build(name, &tree)
            .map(Some)
    }

    // -- groups --------------------------------------------------------------

    pub fn register_group_formula(
        &self,
        name: &str,
        text: &str,
        metadata: Option<serde_json::Value>,
        update: bool,
    ) -> FormulaResult<i64> {
        parse(text)?;
        let metadata = metadata.unwrap_or_else(|| serde_json::json!({}));
        let id = self
            .formulas
            .register_group_formula(name, text, &metadata, update)?;
        info!(name, id, "group formula registered");
        Ok(id)
    }

    pub fn group_formula(&self, name: &str) -> FormulaResult<Option<GroupFormulaRecord>> {
        self.formulas.group_formula(name)
    }

    pub fn list_group_formulas(&self) -> FormulaResult<Vec<GroupFormulaRecord>> {
        self.formulas.list_group_formulas()
    }

    pub fn delete_group_formula(&self, name: &str) -> FormulaResult<bool> {
        self.formulas.delete_group_formula(name)
    }

    pub fn rename_group_formula(&self, old: &str, new: &str) -> FormulaResult<()> {
        self.formulas.rename_group_formula(old, new)
    }

    pub fn register_binding(
        &self,
        groupname: &str,
        seriesname: &str,
        binding: serde_json::Value,
        metadata: Option<serde_json::Value>,
        update: bool,
    ) -> FormulaResult<i64> {
        let metadata = metadata.unwrap_or_else(|| serde_json::json!({}));
        self.formulas
            .register_binding(groupname, seriesname, &binding, &metadata, update)
    }

    pub fn binding(&self, groupname: &str) -> FormulaResult<Option<GroupBindingRecord>> {
        self.formulas.binding(groupname)
    }

    pub fn list_bindings(&self) -> FormulaResult<Vec<GroupBindingRecord>> {
        self.formulas.list_bindings()
    }

    pub fn delete_binding(&self, groupname: &str) -> FormulaResult<bool> {
        self.formulas.delete_binding(groupname)
    }

    // -- backup --------------------------------------------------------------

    pub fn backup_to(&self, destination: impl AsRef<Path>) -> FormulaResult<PathBuf> {
        self.formulas.backup_to(destination)
    }

    pub fn restore_from(&self, source: impl AsRef<Path>) -> FormulaResult<()> {
        self.formulas.restore_from(source)?;
        self.clear_caches();
        Ok(())
    }
}

/// Shallow merge of two JSON objects; `extra` wins.
fn merge_json(base: &mut serde_json::Value, extra: serde_json::Value) {
    match (base.as_object_mut(), extra) {
        (Some(target), serde_json::Value::Object(source)) => {
            target.extend(source);
        }
        (_, extra) if extra.is_object() => *base = extra,
        _ => {}
    }
}

/// Metadata of the first primary series read by the tree, looking through
/// nested formulas.
fn first_primary_meta(
    tree: &Expr,
    catalog: &dyn Catalog,
    depth: usize,
) -> FormulaResult<Option<SeriesMeta>> {
    if depth > MAX_RESOLVE_DEPTH {
        return Err(FormulaError::RecursionLimit {
            limit: MAX_RESOLVE_DEPTH,
            path: tree.canonical(),
        });
    }
    for name in tree.series_names() {
        if let Some(sub) = catalog.formula_tree(&name)? {
            if let Some(meta) = first_primary_meta(&sub, catalog, depth + 1)? {
                return Ok(Some(meta));
            }
        } else if let Some(meta) = catalog.primary_metadata(&name)? {
            return Ok(Some(meta));
        }
    }
    Ok(None)
}

fn inline_formulas(expr: &Expr, catalog: &dyn Catalog, depth: usize) -> FormulaResult<Expr> {
    if depth > MAX_RESOLVE_DEPTH {
        return Err(FormulaError::RecursionLimit {
            limit: MAX_RESOLVE_DEPTH,
            path: expr.canonical(),
        });
    }
    let Expr::Call(call) = expr else {
        return Ok(expr.clone());
    };
    if call.kwargs.is_empty() {
        if let Some(name) = call.series_name() {
            if let Some(sub) = catalog.formula_tree(name)? {
                return inline_formulas(&sub, catalog, depth + 1);
            }
        }
    }
    let mut inlined = Call::new(call.op.clone());
    for arg in &call.args {
        inlined = inlined.arg(inline_formulas(arg, catalog, depth)?);
    }
    for (name, value) in &call.kwargs {
        inlined = inlined.kwarg(name.clone(), inline_formulas(value, catalog, depth)?);
    }
    Ok(Expr::Call(inlined))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::parse_timestamp;
    use crate::ops::{Param, ParamType, Signature};
    use crate::query::resolver::DependencyKind;
    use crate::store::series::MemoryStore;
    use serde_json::json;

    fn day(d: u32) -> NaiveDateTime {
        parse_timestamp(&format!("2020-01-{d:02}")).unwrap()
    }

    fn engine() -> (tempfile::TempDir, Engine<MemoryStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new();
        store.insert("going-round", day(1), [(day(1), 1.0), (day(2), 2.0), (day(3), 3.0)]);
        store.insert("s", day(1), [(day(1), -1.0), (day(2), 0.0), (day(3), 1.0)]);
        store.insert("realized", day(2), [(day(1), 10.0)]);
        store.insert("forecast", day(1), [(day(1), 15.0), (day(2), 20.0)]);
        let engine = Engine::with_config(
            store,
            dir.path().join("formula.db"),
            EngineConfig::default(),
        )
        .unwrap();
        (dir, engine)
    }

    fn values(series: &Series) -> Vec<(NaiveDateTime, f64)> {
        series.iter().collect()
    }

    #[test]
    fn scaling_clipping_and_priority() {
        let (_dir, engine) = engine();
        let all = EvalOptions::new();

        let scaled = engine
            .eval_formula(r#"(* 3.14 (series "going-round"))"#, &all)
            .unwrap();
        let expected = [3.14, 6.28, 9.42];
        for (got, want) in scaled.values().iter().zip(expected) {
            assert!((got - want).abs() < 1e-9);
        }

        let clipped = engine.eval_formula(r#"(clip (series "s") #:min 0)"#, &all).unwrap();
        assert_eq!(clipped.values(), vec![0.0, 0.0, 1.0]);

        let patched = engine
            .eval_formula(r#"(priority (series "realized") (series "forecast"))"#, &all)
            .unwrap();
        assert_eq!(values(&patched), vec![(day(1), 10.0), (day(2), 20.0)]);
    }

    #[test]
    fn unknown_series_leave_no_trace() {
        let (_dir, engine) = engine();
        let err = engine
            .register_formula("bad", r#"(add (series "s") (series "ghost"))"#, &RegisterOptions::default())
            .unwrap_err();
        assert!(matches!(err, FormulaError::UnknownSeries { names } if names == vec!["ghost"]));
        assert!(engine.list_formulas().unwrap().is_empty());
        assert!(engine.dependents("s").unwrap().is_empty());

        engine
            .register_formula(
                "lenient",
                r#"(add (series "s") (series "ghost"))"#,
                &RegisterOptions::default().allow_unknown(),
            )
            .unwrap();
        assert_eq!(engine.dependencies("lenient").unwrap(), vec!["ghost", "s"]);
    }

    #[test]
    fn duplicates_updates_and_transitive_edges() {
        let (_dir, engine) = engine();
        let opts = RegisterOptions::default();
        engine.register_formula("g", r#"(series "s")"#, &opts).unwrap();
        engine.register_formula("f", r#"(add (series "g") (series "forecast"))"#, &opts).unwrap();
        assert_eq!(engine.dependencies("f").unwrap(), vec!["forecast", "g", "s"]);

        let err = engine.register_formula("g", r#"(series "realized")"#, &opts).unwrap_err();
        assert!(matches!(err, FormulaError::FormulaExists { .. }));

        engine
            .register_formula("g", r#"(series "realized")"#, &RegisterOptions::update())
            .unwrap();
        assert_eq!(engine.formula("g").unwrap().unwrap(), r#"(series "realized")"#);
        assert_eq!(engine.dependencies("g").unwrap(), vec!["realized"]);
        // The dependent picks up the new transitive set.
        assert_eq!(engine.dependencies("f").unwrap(), vec!["forecast", "g", "realized"]);

        assert!(engine.delete_formula("g").unwrap());
        assert_eq!(engine.dependencies("f").unwrap(), vec!["forecast", "realized"]);
        assert!(engine.dependents("g").unwrap().is_empty());
    }

    #[test]
    fn cycles_are_rejected_on_update() {
        let (_dir, engine) = engine();
        let opts = RegisterOptions::default();
        engine.register_formula("g", r#"(series "s")"#, &opts).unwrap();
        engine.register_formula("f", r#"(series "g")"#, &opts).unwrap();
        let err = engine
            .register_formula("g", r#"(series "f")"#, &RegisterOptions::update())
            .unwrap_err();
        assert!(matches!(err, FormulaError::CyclicFormula { .. }));
        assert_eq!(engine.formula("g").unwrap().unwrap(), r#"(series "s")"#);
    }

    #[test]
    fn nested_formulas_evaluate_by_name() {
        let (_dir, engine) = engine();
        let opts = RegisterOptions::default();
        engine
            .register_formula("double", r#"(* 2 (series "going-round"))"#, &opts)
            .unwrap();
        engine
            .register_formula("sum", r#"(add (series "double") (series "s"))"#, &opts)
            .unwrap();
        let sum = engine.eval_formula("sum", &EvalOptions::new()).unwrap();
        assert_eq!(sum.values(), vec![1.0, 4.0, 7.0]);

        let window = Window::between(day(2), day(3));
        let cut = engine
            .eval_formula("sum", &EvalOptions::new().window(window))
            .unwrap();
        assert_eq!(cut.values(), vec![4.0, 7.0]);

        let err = engine.eval_formula("nope", &EvalOptions::new()).unwrap_err();
        assert!(matches!(err, FormulaError::Evaluation { .. }));
        let err = engine.eval_formula("(+ 1 2)", &EvalOptions::new()).unwrap_err();
        assert!(matches!(err, FormulaError::Evaluation { .. }));
        assert!(matches!(
            engine.evaluate("(+ 1 2)", &EvalOptions::new()).unwrap(),
            Value::Int(3)
        ));
    }

    #[test]
    fn metadata_is_derived_then_merged() {
        let (_dir, engine) = engine();
        engine.store().set_metadata(
            "s",
            SeriesMeta {
                tzaware: true,
                ..SeriesMeta::default()
            },
        );
        engine
            .register_formula(
                "f",
                r#"(add (series "s") (series "forecast"))"#,
                &RegisterOptions::default().with_metadata(json!({"unit": "MW"})),
            )
            .unwrap();
        let record = engine.formula_record("f").unwrap().unwrap();
        assert_eq!(record.metadata["tzaware"], json!(true));
        assert_eq!(record.metadata["unit"], json!("MW"));
        assert_eq!(record.content_hash.len(), 64);

        engine.update_metadata("f", json!({"unit": "GW"})).unwrap();
        let record = engine.formula_record("f").unwrap().unwrap();
        assert_eq!(record.metadata["unit"], json!("GW"));
        assert_eq!(record.metadata["tzaware"], json!(true));
    }

    #[test]
    fn staircase_picks_the_fast_path_when_it_can() {
        let (_dir, engine) = engine();
        engine.store().insert("forecast", day(2), [(day(2), 21.0), (day(3), 30.0)]);
        let opts = RegisterOptions::default();
        engine
            .register_formula("best", r#"(priority (series "realized") (series "forecast"))"#, &opts)
            .unwrap();
        engine
            .register_formula("smooth", r#"(cumsum (series "forecast"))"#, &opts)
            .unwrap();
        let all = EvalOptions::new();
        let delta = TimeDelta::try_hours(12).unwrap();

        let (fast, path) = engine.staircase_with_path("best", delta, &all).unwrap();
        assert_eq!(path, StaircasePath::Optimized);
        assert_eq!(fast, engine.staircase_naive("best", delta, &all).unwrap());

        let (_, path) = engine.staircase_with_path("smooth", delta, &all).unwrap();
        assert_eq!(path, StaircasePath::Naive);
        assert_eq!(engine.cache_stats()["eligibility.entries"], 2);
    }

    #[test]
    fn history_replays_each_revision() {
        let (_dir, engine) = engine();
        engine.store().insert("forecast", day(2), [(day(2), 21.0)]);
        let history = engine
            .history(r#"(series "forecast")"#, &Window::all(), &EvalOptions::new())
            .unwrap();
        let revisions: Vec<NaiveDateTime> = history.keys().copied().collect();
        assert_eq!(revisions, vec![day(1), day(2)]);
        assert_eq!(history[&day(1)].get(&day(2)), Some(20.0));
        assert_eq!(history[&day(2)].get(&day(2)), Some(21.0));
    }

    #[test]
    fn constant_revision_dates_join_staircase_and_history() {
        let (_dir, engine) = engine();
        engine.store().insert("a", day(1), (1..=5).map(|d| (day(d), 1.0)));
        let text = r#"(add (series "a") (constant 5 (date "2020-01-01") (date "2020-01-05") "D" (date "2020-01-03")))"#;

        let asof = engine
            .eval_formula(text, &EvalOptions::new().revision(day(5)))
            .unwrap();
        assert_eq!(asof.get(&day(5)), Some(6.0));

        let all = EvalOptions::new();
        let naive = engine.staircase_naive(text, TimeDelta::zero(), &all).unwrap();
        assert_eq!(
            values(&naive),
            vec![(day(3), 6.0), (day(4), 6.0), (day(5), 6.0)]
        );
        let (auto, path) = engine.staircase_with_path(text, TimeDelta::zero(), &all).unwrap();
        assert_eq!(path, StaircasePath::Naive);
        assert_eq!(auto, naive);

        let history = engine.history(text, &Window::all(), &all).unwrap();
        let revisions: Vec<NaiveDateTime> = history.keys().copied().collect();
        assert_eq!(revisions, vec![day(1), day(3)]);
        assert!(history[&day(1)].is_empty());
        assert_eq!(history[&day(3)].len(), 5);
    }

    #[test]
    fn expansion_components_and_editor_rows() {
        let (_dir, engine) = engine();
        let opts = RegisterOptions::default();
        engine.register_formula("g", r#"(series "s")"#, &opts).unwrap();
        engine
            .register_formula("f", r#"(add (series "g") (* (+ 1 2) (series "going-round")))"#, &opts)
            .unwrap();
        assert_eq!(
            engine.expanded_formula("f").unwrap().unwrap(),
            r#"(add (series "s") (* 3 (series "going-round")))"#
        );
        assert!(engine.expanded_formula("missing").unwrap().is_none());

        let direct = engine.formula_components("f", false).unwrap();
        assert_eq!(direct["g"].kind, DependencyKind::Formula);
        let expanded = engine.formula_components("f", true).unwrap();
        assert!(!expanded.contains_key("g"));
        assert_eq!(expanded["s"].kind, DependencyKind::Primary);

        let rows = engine.editor_info("f").unwrap().unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].name, "g");
        assert_eq!(rows[0].kind, "formula: series");
        assert_eq!(rows[2].name, "f");
        assert_eq!(rows[2].kind, "formula: add");
    }

    #[test]
    fn renaming_references_rewrites_texts_and_edges() {
        let (_dir, engine) = engine();
        let opts = RegisterOptions::default().allow_unknown();
        engine.register_formula("f", r#"(add (series "s") (series "forecast"))"#, &opts).unwrap();
        engine.register_formula("top", r#"(series "f")"#, &opts).unwrap();

        let renamed = engine.rename_references("s", "z").unwrap();
        assert_eq!(renamed, vec!["f"]);
        assert_eq!(
            engine.formula("f").unwrap().unwrap(),
            r#"(add (series "z") (series "forecast"))"#
        );
        assert_eq!(engine.dependents("z").unwrap(), vec!["f", "top"]);
        assert!(engine.dependents("s").unwrap().is_empty());

        engine.register_formula("other", r#"(series "forecast")"#, &opts).unwrap();
        let err = engine.rename_references("z", "forecast").unwrap_err();
        assert!(matches!(err, FormulaError::RenameConflict { .. }));
    }

    #[test]
    fn third_party_operators_join_the_registry() {
        let (_dir, engine) = engine();
        let signature = Signature::new().arg(Param::required("series", ParamType::Series));
        let negate = OperatorSpec::new("negate", signature, |mut args| {
            Ok(Value::Series(args.take_series(0)?.map_values(|v| -v)))
        })
        .pushdown();
        engine.register_operator(negate.clone()).unwrap();
        assert!(matches!(
            engine.register_operator(negate),
            Err(FormulaError::DuplicateOperator { .. })
        ));
        engine
            .register_formula("neg", r#"(negate (series "s"))"#, &RegisterOptions::default())
            .unwrap();
        assert_eq!(
            engine.eval_formula("neg", &EvalOptions::new()).unwrap().values(),
            vec![1.0, 0.0, -1.0]
        );
        assert_eq!(engine.dependencies("neg").unwrap(), vec!["s"]);
    }

    #[test]
    fn aliases_are_imported_once() {
        let (_dir, engine) = engine();
        let arithmetic = vec![ArithmeticAlias {
            alias: "scaled".into(),
            serie: "s".into(),
            coefficient: 2.0,
            fillopt: None,
        }];
        let priority = vec![
            PriorityAlias {
                alias: "best".into(),
                serie: "forecast".into(),
                priority: 2,
                coefficient: 1.0,
                prune: None,
            },
            PriorityAlias {
                alias: "best".into(),
                serie: "realized".into(),
                priority: 1,
                coefficient: 1.0,
                prune: None,
            },
        ];
        let first = engine.import_aliases(&arithmetic, &priority).unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(
            engine.eval_formula("best", &EvalOptions::new()).unwrap().values(),
            vec![10.0, 20.0]
        );
        assert!(engine.import_aliases(&arithmetic, &priority).unwrap().is_empty());
    }

    #[test]
    fn groups_and_bindings() {
        let (_dir, engine) = engine();
        assert!(matches!(
            engine.register_binding("b", "g", json!([]), None, false),
            Err(FormulaError::UnknownGroup { .. })
        ));
        engine
            .register_group_formula("g", r#"(group "x")"#, None, false)
            .unwrap();
        assert!(engine.register_group_formula("bad", "(group", None, false).is_err());
        engine
            .register_binding("b", "g", json!([{"series": "s", "group": "x"}]), None, false)
            .unwrap();
        engine.rename_group_formula("g", "h").unwrap();
        assert_eq!(engine.binding("b").unwrap().unwrap().seriesname, "h");
        assert_eq!(engine.list_group_formulas().unwrap().len(), 1);
        assert!(engine.delete_group_formula("h").unwrap());
        assert!(engine.list_bindings().unwrap().is_empty());
        assert!(engine.group_formula("h").unwrap().is_none());
        assert!(!engine.delete_binding("b").unwrap());
    }

    #[test]
    fn writes_from_another_engine_invalidate_cached_trees() {
        let (dir, engine) = engine();
        let opts = RegisterOptions::default();
        engine.register_formula("f", r#"(series "s")"#, &opts).unwrap();
        assert_eq!(engine.eval_formula("f", &EvalOptions::new()).unwrap().len(), 3);

        let store = MemoryStore::new();
        store.insert("s", day(1), [(day(1), 5.0)]);
        let other = Engine::with_config(store, dir.path().join("formula.db"), EngineConfig::default())
            .unwrap();
        other
            .register_formula("f", r#"(clip (series "s") #:min 0)"#, &RegisterOptions::update())
            .unwrap();

        let seen = engine.eval_formula("f", &EvalOptions::new()).unwrap();
        assert_eq!(seen.values(), vec![0.0, 0.0, 1.0]);
    }

    #[test]
    fn cancelled_queries_abort() {
        let (_dir, engine) = engine();
        let token = CancelToken::new();
        token.cancel();
        let err = engine
            .eval_formula(r#"(series "s")"#, &EvalOptions::new().cancel(token))
            .unwrap_err();
        assert!(matches!(err, FormulaError::Cancelled { .. }));
    }

    #[test]
    fn backup_restores_formulas() {
        let (dir, engine) = engine();
        engine
            .register_formula("f", r#"(series "s")"#, &RegisterOptions::default())
            .unwrap();
        let copy = engine.backup_to(dir.path().join("backup.db")).unwrap();
        engine.delete_formula("f").unwrap();
        engine.restore_from(&copy).unwrap();
        assert_eq!(engine.eval_formula("f", &EvalOptions::new()).unwrap().len(), 3);
    }

    #[test]
    fn restores_invalidate_trees_cached_by_another_engine() {
        let (dir, engine) = engine();
        engine.store().insert("t", day(1), [(day(1), 100.0)]);
        let opts = RegisterOptions::default();
        engine.register_formula("f", r#"(series "s")"#, &opts).unwrap();
        let copy = engine.backup_to(dir.path().join("backup.db")).unwrap();
        engine.register_formula("g", r#"(series "s")"#, &opts).unwrap();
        engine.register_formula("h", r#"(series "s")"#, &opts).unwrap();

        let store = MemoryStore::new();
        store.insert("s", day(1), [(day(1), -1.0), (day(2), 0.0)]);
        store.insert("t", day(1), [(day(1), 100.0)]);
        let other = Engine::with_config(store, dir.path().join("formula.db"), EngineConfig::default())
            .unwrap();
        assert_eq!(other.eval_formula("f", &EvalOptions::new()).unwrap().len(), 2);

        engine.restore_from(&copy).unwrap();
        engine
            .register_formula("f", r#"(series "t")"#, &RegisterOptions::update())
            .unwrap();

        let seen = other.eval_formula("f", &EvalOptions::new()).unwrap();
        assert_eq!(seen.values(), vec![100.0]);
        assert!(other.formula("g").unwrap().is_none());
    }

    #[test]
    fn concurrent_registrations_cannot_close_a_cycle() {
        let (dir, engine) = engine();
        let other = Engine::with_config(
            MemoryStore::new(),
            dir.path().join("formula.db"),
            EngineConfig::default(),
        )
        .unwrap();
        let opts = RegisterOptions::default().allow_unknown();
        let (left, right) = std::thread::scope(|scope| {
            let left = scope.spawn(|| engine.register_formula("a", r#"(series "b")"#, &opts));
            let right = scope.spawn(|| other.register_formula("b", r#"(series "a")"#, &opts));
            (left.join().unwrap(), right.join().unwrap())
        });
        let stored = [left.is_ok(), right.is_ok()];
        assert_eq!(stored.iter().filter(|ok| **ok).count(), 1, "{left:?} {right:?}");
        let refused = if left.is_ok() { right } else { left };
        assert!(matches!(refused, Err(FormulaError::CyclicFormula { .. })));
    }
}
