//! Static dependency discovery over expression trees.
//!
//! Never evaluates data: `series` nodes (or an operator's finder) name what
//! a tree needs, and named formulas are expanded through their stored trees.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::errors::{FormulaError, FormulaResult};
use crate::expr::Expr;
use crate::models::SeriesMeta;
use crate::ops::OperatorRegistry;
use crate::query::guards::MAX_RESOLVE_DEPTH;
use crate::store::series::SeriesStore;

/// Name lookup shared by the interpreter and the resolver: formula trees
/// by name, and metadata of primary series.
pub trait Catalog: Send + Sync {
    fn formula_tree(&self, name: &str) -> FormulaResult<Option<Arc<Expr>>>;
    fn primary_metadata(&self, name: &str) -> FormulaResult<Option<SeriesMeta>>;
}

/// A catalog with no formulas, backed by a series store.
pub struct StoreCatalog<'a> {
    store: &'a dyn SeriesStore,
}

impl<'a> StoreCatalog<'a> {
    pub fn new(store: &'a dyn SeriesStore) -> Self {
        Self { store }
    }
}

impl Catalog for StoreCatalog<'_> {
    fn formula_tree(&self, _name: &str) -> FormulaResult<Option<Arc<Expr>>> {
        Ok(None)
    }

    fn primary_metadata(&self, name: &str) -> FormulaResult<Option<SeriesMeta>> {
        self.store.metadata(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyKind {
    Primary,
    Formula,
    Unknown,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dependency {
    pub kind: DependencyKind,
    /// Store metadata, for primary series.
    pub meta: Option<SeriesMeta>,
}

impl Dependency {
    pub fn primary(meta: SeriesMeta) -> Self {
        Self {
            kind: DependencyKind::Primary,
            meta: Some(meta),
        }
    }

    pub fn formula() -> Self {
        Self {
            kind: DependencyKind::Formula,
            meta: None,
        }
    }

    pub fn unknown() -> Self {
        Self {
            kind: DependencyKind::Unknown,
            meta: None,
        }
    }

    /// Classify `name` against the catalog; formulas shadow primaries.
    pub fn lookup(catalog: &dyn Catalog, name: &str) -> FormulaResult<Self> {
        if catalog.formula_tree(name)?.is_some() {
            return Ok(Self::formula());
        }
        Ok(match catalog.primary_metadata(name)? {
            Some(meta) => Self::primary(meta),
            None => Self::unknown(),
        })
    }
}

pub struct Resolver<'a> {
    registry: &'a OperatorRegistry,
    catalog: &'a dyn Catalog,
}

impl<'a> Resolver<'a> {
    pub fn new(registry: &'a OperatorRegistry, catalog: &'a dyn Catalog) -> Self {
        Self { registry, catalog }
    }

    /// Direct dependencies of a tree.
    pub fn resolve(&self, tree: &Expr) -> FormulaResult<BTreeMap<String, Dependency>> {
        let mut found = BTreeMap::new();
        self.walk(tree, &mut found)?;
        Ok(found)
    }

    fn walk(&self, expr: &Expr, found: &mut BTreeMap<String, Dependency>) -> FormulaResult<()> {
        let Expr::Call(call) = expr else {
            return Ok(());
        };
        if let Some(finder) = self.registry.get(&call.op).and_then(|spec| spec.finder.as_ref()) {
            found.extend(finder(call, self.catalog)?);
            return Ok(());
        }
        for arg in &call.args {
            self.walk(arg, found)?;
        }
        for value in call.kwargs.values() {
            self.walk(value, found)?;
        }
        Ok(())
    }

    /// Every name the tree needs, named formulas expanded through their
    /// stored trees.
    pub fn resolve_transitive(&self, tree: &Expr) -> FormulaResult<BTreeMap<String, Dependency>> {
        let mut found = BTreeMap::new();
        self.expand(tree, &mut Vec::new(), &mut found)?;
        Ok(found)
    }

    /// Like [`Resolver::resolve_transitive`] for a tree about to be stored
    /// under `name`: any path leading back to `name` is a cycle.
    pub fn resolve_for(
        &self,
        name: &str,
        tree: &Expr,
    ) -> FormulaResult<BTreeMap<String, Dependency>> {
        let mut found = BTreeMap::new();
        self.expand(tree, &mut vec![name.to_string()], &mut found)?;
        Ok(found)
    }

    fn expand(
        &self,
        tree: &Expr,
        stack: &mut Vec<String>,
        found: &mut BTreeMap<String, Dependency>,
    ) -> FormulaResult<()> {
        if stack.len() > MAX_RESOLVE_DEPTH {
            return Err(FormulaError::RecursionLimit {
                limit: MAX_RESOLVE_DEPTH,
                path: stack.join("/"),
            });
        }
        for (name, dep) in self.resolve(tree)? {
            if stack.contains(&name) {
                return Err(FormulaError::CyclicFormula { name });
            }
            let first_visit = !found.contains_key(&name);
            let is_formula = dep.kind == DependencyKind::Formula;
            found.insert(name.clone(), dep);
            if !(is_formula && first_visit) {
                continue;
            }
            if let Some(sub) = self.catalog.formula_tree(&name)? {
                stack.push(name);
                self.expand(&sub, stack, found)?;
                stack.pop();
            }
        }
        Ok(())
    }

    /// Primary series the tree ultimately reads.
    pub fn primary_leaves(&self, tree: &Expr) -> FormulaResult<BTreeSet<String>> {
        Ok(self
            .resolve_transitive(tree)?
            .into_iter()
            .filter(|(_, dep)| dep.kind == DependencyKind::Primary)
            .map(|(name, _)| name)
            .collect())
    }

    /// Fail with every name that is neither a formula nor a stored series.
    pub fn reject_unknown(deps: &BTreeMap<String, Dependency>) -> FormulaResult<()> {
        let names: Vec<String> = deps
            .iter()
            .filter(|(_, dep)| dep.kind == DependencyKind::Unknown)
            .map(|(name, _)| name.clone())
            .collect();
        if names.is_empty() {
            Ok(())
        } else {
            Err(FormulaError::UnknownSeries { names })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::parse;
    use crate::models::parse_timestamp;
    use crate::store::series::MemoryStore;
    use std::collections::HashMap;

    struct Formulas<'a> {
        store: &'a MemoryStore,
        trees: HashMap<&'static str, Arc<Expr>>,
    }

    impl Catalog for Formulas<'_> {
        fn formula_tree(&self, name: &str) -> FormulaResult<Option<Arc<Expr>>> {
            Ok(self.trees.get(name).cloned())
        }

        fn primary_metadata(&self, name: &str) -> FormulaResult<Option<SeriesMeta>> {
            self.store.metadata(name)
        }
    }

    fn catalog<'a>(store: &'a MemoryStore, trees: &[(&'static str, &str)]) -> Formulas<'a> {
        Formulas {
            store,
            trees: trees
                .iter()
                .map(|(name, text)| (*name, Arc::new(parse(text).unwrap())))
                .collect(),
        }
    }

    fn store() -> MemoryStore {
        let store = MemoryStore::new();
        let t = parse_timestamp("2020-01-01").unwrap();
        store.insert("x", t, [(t, 1.0)]);
        store.insert("y", t, [(t, 2.0)]);
        store
    }

    #[test]
    fn direct_resolution_stops_at_series_nodes() {
        let store = store();
        let cat = catalog(&store, &[("f", r#"(add (series "x") (series "y"))"#)]);
        let registry = OperatorRegistry::with_builtins();
        let resolver = Resolver::new(&registry, &cat);
        let deps = resolver
            .resolve(&parse(r#"(priority (series "f") (series "ghost") #:x (series "y"))"#).unwrap())
            .unwrap();
        assert_eq!(deps["f"].kind, DependencyKind::Formula);
        assert_eq!(deps["ghost"].kind, DependencyKind::Unknown);
        assert_eq!(deps["y"].kind, DependencyKind::Primary);
        assert!(!deps.contains_key("x"));
    }

    #[test]
    fn transitive_resolution_expands_formulas() {
        let store = store();
        let cat = catalog(
            &store,
            &[
                ("f", r#"(add (series "x") (series "g"))"#),
                ("g", r#"(* 2 (series "y"))"#),
            ],
        );
        let registry = OperatorRegistry::with_builtins();
        let resolver = Resolver::new(&registry, &cat);
        let tree = parse(r#"(series "f")"#).unwrap();
        let names: Vec<String> = resolver.resolve_transitive(&tree).unwrap().into_keys().collect();
        assert_eq!(names, vec!["f", "g", "x", "y"]);
        let leaves: Vec<String> = resolver.primary_leaves(&tree).unwrap().into_iter().collect();
        assert_eq!(leaves, vec!["x", "y"]);
    }

    #[test]
    fn cycles_through_stored_formulas_are_detected() {
        let store = store();
        let cat = catalog(&store, &[("g", r#"(series "h")"#), ("h", r#"(series "f")"#)]);
        let registry = OperatorRegistry::with_builtins();
        let resolver = Resolver::new(&registry, &cat);
        let err = resolver
            .resolve_for("f", &parse(r#"(series "g")"#).unwrap())
            .unwrap_err();
        assert!(matches!(err, FormulaError::CyclicFormula { name } if name == "f"));
        let err = resolver
            .resolve_for("f", &parse(r#"(add (series "f") (series "x"))"#).unwrap())
            .unwrap_err();
        assert!(matches!(err, FormulaError::CyclicFormula { .. }));
    }

    #[test]
    fn finders_replace_the_default_rule() {
        let store = store();
        let cat = catalog(&store, &[]);
        let registry = OperatorRegistry::with_builtins();
        let resolver = Resolver::new(&registry, &cat);
        let deps = resolver
            .resolve(
                &parse(r#"(constant 1 (date "2020-01-01") (date "2020-02-01") "D" (date "2020-01-01"))"#)
                    .unwrap(),
            )
            .unwrap();
        assert!(deps.is_empty());
    }

    #[test]
    fn unknown_names_are_listed() {
        let mut deps = BTreeMap::new();
        deps.insert("a".to_string(), Dependency::unknown());
        deps.insert("b".to_string(), Dependency::formula());
        deps.insert("c".to_string(), Dependency::unknown());
        let err = Resolver::reject_unknown(&deps).unwrap_err();
        assert_eq!(err.to_string(), "unknown series `a`, `c`");
    }
}
