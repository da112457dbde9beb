//! Expression tree of the formula language and its canonical serialization.

use std::collections::BTreeMap;
use std::fmt;

use sha2::{Digest, Sha256};

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
}

/// An operator application: `(op pos... #:kw value ...)`.
///
/// Keywords live in a sorted map, so keyword order never reaches the
/// canonical form.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub op: String,
    pub args: Vec<Expr>,
    pub kwargs: BTreeMap<String, Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Literal),
    /// A bare identifier in argument position.
    Symbol(String),
    Call(Call),
}

impl Call {
    pub fn new(op: impl Into<String>) -> Self {
        Self {
            op: op.into(),
            args: Vec::new(),
            kwargs: BTreeMap::new(),
        }
    }

    pub fn arg(mut self, expr: Expr) -> Self {
        self.args.push(expr);
        self
    }

    pub fn kwarg(mut self, name: impl Into<String>, expr: Expr) -> Self {
        self.kwargs.insert(name.into(), expr);
        self
    }

    /// The series name of a `(series "name" ...)` node.
    pub fn series_name(&self) -> Option<&str> {
        if self.op != "series" {
            return None;
        }
        self.args.first().and_then(Expr::as_str)
    }
}

impl Expr {
    pub fn int(v: i64) -> Self {
        Expr::Literal(Literal::Int(v))
    }

    pub fn float(v: f64) -> Self {
        Expr::Literal(Literal::Float(v))
    }

    pub fn string(v: impl Into<String>) -> Self {
        Expr::Literal(Literal::Str(v.into()))
    }

    pub fn series(name: impl Into<String>) -> Self {
        Expr::Call(Call::new("series").arg(Expr::string(name)))
    }

    pub fn as_call(&self) -> Option<&Call> {
        match self {
            Expr::Call(c) => Some(c),
            _ => None,
        }
    }

    /// String payload of a string literal or symbol.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Expr::Literal(Literal::Str(s)) | Expr::Symbol(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Expr::Literal(Literal::Int(v)) => Some(*v as f64),
            Expr::Literal(Literal::Float(v)) => Some(*v),
            _ => None,
        }
    }

    /// Canonical text form; equal trees always serialize identically.
    pub fn canonical(&self) -> String {
        self.to_string()
    }

    /// SHA-256 hex digest of the canonical form.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical().as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Visit every call node, parents before children.
    pub fn walk_calls<'a>(&'a self, visit: &mut dyn FnMut(&'a Call)) {
        if let Expr::Call(call) = self {
            visit(call);
            for arg in &call.args {
                arg.walk_calls(visit);
            }
            for value in call.kwargs.values() {
                value.walk_calls(visit);
            }
        }
    }

    /// Names of every `series` node in the tree, in visiting order.
    pub fn series_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        self.walk_calls(&mut |call| {
            if let Some(name) = call.series_name() {
                names.push(name.to_string());
            }
        });
        names
    }

    /// Rewrite every `(series "old" ...)` into `(series "new" ...)`, keeping
    /// the keywords. Returns whether anything changed.
    pub fn rename_series(&mut self, old: &str, new: &str) -> bool {
        let Expr::Call(call) = self else {
            return false;
        };
        let mut changed = false;
        if call.series_name() == Some(old) {
            call.args[0] = Expr::string(new);
            changed = true;
        }
        for arg in call.args.iter_mut() {
            changed |= arg.rename_series(old, new);
        }
        for value in call.kwargs.values_mut() {
            changed |= value.rename_series(old, new);
        }
        changed
    }

    /// Fold `+`, `*` and `/` applications whose operands are both numeric
    /// literals and whose result is finite.
    pub fn fold_constants(&self) -> Expr {
        let Expr::Call(call) = self else {
            return self.clone();
        };
        let folded = Call {
            op: call.op.clone(),
            args: call.args.iter().map(Expr::fold_constants).collect(),
            kwargs: call
                .kwargs
                .iter()
                .map(|(k, v)| (k.clone(), v.fold_constants()))
                .collect(),
        };
        if folded.args.len() != 2 || !folded.kwargs.is_empty() {
            return Expr::Call(folded);
        }
        let op = folded.op.as_str();
        if let (Expr::Literal(Literal::Int(a)), Expr::Literal(Literal::Int(b))) =
            (&folded.args[0], &folded.args[1])
        {
            let exact = match op {
                "+" => a.checked_add(*b),
                "*" => a.checked_mul(*b),
                _ => None,
            };
            if let Some(v) = exact {
                return Expr::int(v);
            }
        }
        if let (Some(a), Some(b)) = (folded.args[0].as_number(), folded.args[1].as_number()) {
            let value = match op {
                "+" => Some(a + b),
                "*" => Some(a * b),
                "/" if b != 0.0 => Some(a / b),
                _ => None,
            };
            // an overflowing fold has no literal spelling
            if let Some(v) = value.filter(|v| v.is_finite()) {
                return Expr::float(v);
            }
        }
        Expr::Call(folded)
    }
}

fn write_float(f: &mut fmt::Formatter<'_>, v: f64) -> fmt::Result {
    let text = format!("{v:?}");
    if text.contains(['.', 'e', 'E']) || !v.is_finite() {
        write!(f, "{text}")
    } else {
        write!(f, "{text}.0")
    }
}

fn write_string(f: &mut fmt::Formatter<'_>, s: &str) -> fmt::Result {
    f.write_str("\"")?;
    for ch in s.chars() {
        match ch {
            '"' => f.write_str("\\\"")?,
            '\\' => f.write_str("\\\\")?,
            '\n' => f.write_str("\\n")?,
            '\t' => f.write_str("\\t")?,
            c => write!(f, "{c}")?,
        }
    }
    f.write_str("\"")
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Int(v) => write!(f, "{v}"),
            Literal::Float(v) => write_float(f, *v),
            Literal::Str(s) => write_string(f, s),
            Literal::Bool(b) => f.write_str(if *b { "#t" } else { "#f" }),
        }
    }
}

impl fmt::Display for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}", self.op)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        for (name, value) in &self.kwargs {
            write!(f, " #:{name} {value}")?;
        }
        f.write_str(")")
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(lit) => write!(f, "{lit}"),
            Expr::Symbol(s) => f.write_str(s),
            Expr::Call(call) => write!(f, "{call}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_form_sorts_keywords() {
        let tree = Expr::Call(
            Call::new("series")
                .arg(Expr::string("a"))
                .kwarg("prune", Expr::int(1))
                .kwarg("fill", Expr::string("ffill")),
        );
        assert_eq!(
            tree.canonical(),
            r#"(series "a" #:fill "ffill" #:prune 1)"#
        );
    }

    #[test]
    fn floats_keep_their_kind() {
        assert_eq!(Expr::float(3.0).canonical(), "3.0");
        assert_eq!(Expr::float(3.14).canonical(), "3.14");
        assert_eq!(Expr::float(1e300).canonical(), "1e300");
    }

    #[test]
    fn strings_are_escaped() {
        assert_eq!(Expr::string("a \"b\"\\").canonical(), r#""a \"b\"\\""#);
    }

    #[test]
    fn rename_touches_only_series_names() {
        let mut tree = Expr::Call(
            Call::new("add")
                .arg(Expr::series("old"))
                .arg(Expr::Call(Call::new("constant").arg(Expr::string("old")))),
        );
        assert!(tree.rename_series("old", "new"));
        assert_eq!(
            tree.canonical(),
            r#"(add (series "new") (constant "old"))"#
        );
        assert!(!tree.rename_series("missing", "x"));
    }

    #[test]
    fn constant_folding_is_bottom_up() {
        let tree = Expr::Call(
            Call::new("*")
                .arg(Expr::Call(Call::new("+").arg(Expr::int(1)).arg(Expr::int(2))))
                .arg(Expr::Call(Call::new("*").arg(Expr::float(2.0)).arg(Expr::series("x")))),
        );
        assert_eq!(
            tree.fold_constants().canonical(),
            r#"(* 3 (* 2.0 (series "x")))"#
        );
        let div = Expr::Call(Call::new("/").arg(Expr::int(3)).arg(Expr::int(2)));
        assert_eq!(div.fold_constants(), Expr::float(1.5));
    }

    #[test]
    fn overflowing_folds_are_left_alone() {
        let tree = Expr::Call(
            Call::new("*")
                .arg(Expr::float(1e300))
                .arg(Expr::Call(Call::new("*").arg(Expr::float(1e300)).arg(Expr::float(1e300)))),
        );
        let folded = tree.fold_constants();
        assert_eq!(folded, tree);
        assert_eq!(folded.canonical(), "(* 1e300 (* 1e300 1e300))");
        assert_eq!(crate::expr::parse(&folded.canonical()).unwrap(), folded);
    }

    #[test]
    fn hash_tracks_canonical_text() {
        let a = Expr::series("x");
        let b = Expr::series("x");
        let c = Expr::series("y");
        assert_eq!(a.content_hash(), b.content_hash());
        assert_ne!(a.content_hash(), c.content_hash());
        assert_eq!(a.content_hash().len(), 64);
    }
}
