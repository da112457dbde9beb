//! Operator registry: the single table the interpreter, the dependency
//! resolver, the staircase planner and the editor walker consult.

pub mod builtins;
pub mod combine;
pub mod dates;
pub mod signature;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::NaiveDateTime;
use indexmap::IndexMap;
use tracing::debug;

use crate::editor::EditorWalker;
use crate::errors::{FormulaError, FormulaResult};
use crate::expr::{Call, Expr};
use crate::models::Value;
use crate::query::context::{QueryContext, TreePath};
use crate::query::interpreter::Interpreter;
use crate::query::resolver::{Catalog, Dependency};

pub use signature::{Arguments, Param, ParamType, Signature};

pub type ValueFn = Arc<dyn Fn(Arguments<'_>) -> FormulaResult<Value> + Send + Sync>;
pub type TreeFn = Arc<
    dyn Fn(&Call, &Interpreter<'_>, &QueryContext<'_>, &TreePath) -> FormulaResult<Value>
        + Send
        + Sync,
>;
/// Custom dependency discovery for operators that fetch series by other
/// means than `series` nodes.
pub type Finder =
    Arc<dyn Fn(&Call, &dyn Catalog) -> FormulaResult<BTreeMap<String, Dependency>> + Send + Sync>;
/// Revision dates an operator contributes on its own, beyond the insertion
/// dates of the series it reads.
pub type InsertionDates = Arc<
    dyn Fn(&Call, &Interpreter<'_>, &QueryContext<'_>, &TreePath) -> FormulaResult<Vec<NaiveDateTime>>
        + Send
        + Sync,
>;
pub type EditorBuilder =
    Arc<dyn Fn(&mut EditorWalker<'_>, &Call) -> FormulaResult<()> + Send + Sync>;

#[derive(Clone)]
pub enum Implementation {
    /// Receives evaluated, bound arguments.
    Values(ValueFn),
    /// Receives the unevaluated call node and drives evaluation itself.
    RawTree(TreeFn),
}

/// Everything the engine knows about one operator.
#[derive(Clone)]
pub struct OperatorSpec {
    pub name: String,
    pub signature: Signature,
    pub implementation: Implementation,
    pub wants_context: bool,
    pub finder: Option<Finder>,
    pub insertion_dates: Option<InsertionDates>,
    pub editor_info: Option<EditorBuilder>,
    /// The operator is pointwise in time and may be evaluated once over
    /// precomputed leaf staircases.
    pub staircase_pushdown: bool,
    pub doc: &'static str,
}

impl OperatorSpec {
    pub fn new<F>(name: impl Into<String>, signature: Signature, f: F) -> Self
    where
        F: Fn(Arguments<'_>) -> FormulaResult<Value> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            signature,
            implementation: Implementation::Values(Arc::new(f)),
            wants_context: false,
            finder: None,
            insertion_dates: None,
            editor_info: None,
            staircase_pushdown: false,
            doc: "",
        }
    }

    /// An operator that receives its call node unevaluated.
    pub fn raw<F>(name: impl Into<String>, signature: Signature, f: F) -> Self
    where
        F: Fn(&Call, &Interpreter<'_>, &QueryContext<'_>, &TreePath) -> FormulaResult<Value>
            + Send
            + Sync
            + 'static,
    {
        Self {
            implementation: Implementation::RawTree(Arc::new(f)),
            wants_context: true,
            ..Self::new(name, signature, |args| Err(args.error("unreachable")))
        }
    }

    pub fn with_context(mut self) -> Self {
        self.wants_context = true;
        self
    }

    pub fn with_finder<F>(mut self, f: F) -> Self
    where
        F: Fn(&Call, &dyn Catalog) -> FormulaResult<BTreeMap<String, Dependency>>
            + Send
            + Sync
            + 'static,
    {
        self.finder = Some(Arc::new(f));
        self
    }

    pub fn with_insertion_dates<F>(mut self, f: F) -> Self
    where
        F: Fn(&Call, &Interpreter<'_>, &QueryContext<'_>, &TreePath) -> FormulaResult<Vec<NaiveDateTime>>
            + Send
            + Sync
            + 'static,
    {
        self.insertion_dates = Some(Arc::new(f));
        self
    }

    pub fn with_editor_info<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut EditorWalker<'_>, &Call) -> FormulaResult<()> + Send + Sync + 'static,
    {
        self.editor_info = Some(Arc::new(f));
        self
    }

    pub fn pushdown(mut self) -> Self {
        self.staircase_pushdown = true;
        self
    }

    pub fn doc(mut self, doc: &'static str) -> Self {
        self.doc = doc;
        self
    }

    pub fn wants_raw_tree(&self) -> bool {
        matches!(self.implementation, Implementation::RawTree(_))
    }
}

impl fmt::Debug for OperatorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperatorSpec")
            .field("name", &self.name)
            .field("signature", &self.signature)
            .field("raw_tree", &self.wants_raw_tree())
            .field("wants_context", &self.wants_context)
            .field("finder", &self.finder.is_some())
            .field("insertion_dates", &self.insertion_dates.is_some())
            .field("editor_info", &self.editor_info.is_some())
            .field("staircase_pushdown", &self.staircase_pushdown)
            .finish()
    }
}

/// Name-keyed operator table, in registration order.
#[derive(Clone, Default)]
pub struct OperatorRegistry {
    ops: IndexMap<String, Arc<OperatorSpec>>,
}

impl OperatorRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in operator set.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for spec in builtins::all() {
            registry.register_override(spec);
        }
        registry
    }

    /// Register a new operator. Names collide case-sensitively.
    pub fn register(&mut self, spec: OperatorSpec) -> FormulaResult<()> {
        if self.ops.contains_key(&spec.name) {
            return Err(FormulaError::DuplicateOperator { name: spec.name });
        }
        debug!(op = %spec.name, "registering operator");
        self.ops.insert(spec.name.clone(), Arc::new(spec));
        Ok(())
    }

    /// Register an operator, replacing any previous one of the same name.
    pub fn register_override(&mut self, spec: OperatorSpec) -> Option<Arc<OperatorSpec>> {
        self.ops.insert(spec.name.clone(), Arc::new(spec))
    }

    pub fn get(&self, name: &str) -> Option<&Arc<OperatorSpec>> {
        self.ops.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.ops.contains_key(name)
    }

    pub fn find(&self, name: &str) -> FormulaResult<&Arc<OperatorSpec>> {
        self.find_at(name, name)
    }

    pub fn find_at(&self, name: &str, path: &str) -> FormulaResult<&Arc<OperatorSpec>> {
        self.ops
            .get(name)
            .ok_or_else(|| FormulaError::UnknownOperator {
                name: name.to_string(),
                path: path.to_string(),
            })
    }

    /// Static check of every call in `expr`: a registered operator with a
    /// matching argument shape. Evaluates nothing.
    pub fn check_tree(&self, expr: &Expr) -> FormulaResult<()> {
        self.check_node(expr, &TreePath::root(), "")
    }

    fn check_node(&self, expr: &Expr, parent: &TreePath, slot: &str) -> FormulaResult<()> {
        let Expr::Call(call) = expr else {
            return Ok(());
        };
        let path = parent.child(slot, &call.op);
        let spec = self.find_at(&call.op, path.as_str())?;
        spec.signature.check_call(call, path.as_str())?;
        for (idx, arg) in call.args.iter().enumerate() {
            self.check_node(arg, &path, &idx.to_string())?;
        }
        for (name, value) in &call.kwargs {
            self.check_node(value, &path, name)?;
        }
        Ok(())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.ops.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy(name: &str) -> OperatorSpec {
        OperatorSpec::new(name, Signature::new(), |_| Ok(Value::Int(1)))
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut registry = OperatorRegistry::new();
        registry.register(dummy("twice")).unwrap();
        let err = registry.register(dummy("twice")).unwrap_err();
        assert!(matches!(err, FormulaError::DuplicateOperator { name } if name == "twice"));
    }

    #[test]
    fn override_replaces_silently() {
        let mut registry = OperatorRegistry::new();
        registry.register(dummy("op")).unwrap();
        let previous = registry.register_override(dummy("op").pushdown());
        assert!(previous.is_some());
        assert!(registry.find("op").unwrap().staircase_pushdown);
    }

    #[test]
    fn unknown_operator_reports_its_path() {
        let registry = OperatorRegistry::new();
        let err = registry.find_at("nope", "add/0/nope").unwrap_err();
        assert_eq!(err.to_string(), "unknown operator `nope` at `add/0/nope`");
    }

    #[test]
    fn static_check_walks_the_whole_tree() {
        let registry = OperatorRegistry::with_builtins();
        let ok = crate::expr::parse(r#"(add (series "a") (* 2 (series "b" #:fill 0)))"#).unwrap();
        registry.check_tree(&ok).unwrap();

        let unknown = crate::expr::parse(r#"(add (series "a") (bogus (series "b")))"#).unwrap();
        let err = registry.check_tree(&unknown).unwrap_err();
        assert!(matches!(err, FormulaError::UnknownOperator { path, .. } if path == "add/1/bogus"));

        let shape = crate::expr::parse(r#"(clip (series "a") #:nope 1)"#).unwrap();
        assert!(matches!(
            registry.check_tree(&shape),
            Err(FormulaError::ArityMismatch { .. })
        ));
    }

    #[test]
    fn builtins_cover_the_core_set() {
        let registry = OperatorRegistry::with_builtins();
        for name in [
            "series", "add", "mul", "div", "priority", "clip", "slice", "+", "*", "/", "min",
            "max", "row-mean", "std", "asof", "constant", "resample", "rolling", "today",
        ] {
            assert!(registry.contains(name), "missing builtin {name}");
        }
        assert!(registry.find("asof").unwrap().wants_raw_tree());
        assert!(!registry.find("resample").unwrap().staircase_pushdown);
        assert!(!registry.find("rolling").unwrap().staircase_pushdown);
        assert!(registry.find("constant").unwrap().insertion_dates.is_some());
        assert!(registry.find("series").unwrap().insertion_dates.is_none());
        assert!(registry.find("add").unwrap().staircase_pushdown);
    }
}
