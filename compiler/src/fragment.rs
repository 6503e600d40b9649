//! Safe templating of native query text, grounded on the reference crate's `SqlWriter`
//! (`datastore/sql_writer.rs`): that type also separates "write this known-safe token verbatim"
//! from "bind this value" and "write this identifier after validating it". The differences here
//! are (a) parameters are bound by name (`@p0`) rather than positionally (`?1`), since AQL takes
//! named bind variables, and (b) a `Fragment` is an immutable value rather than a `&mut` writer,
//! so composition is concatenation instead of sequential `write` calls.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;
use serde_json::Value as JsonValue;

use crate::error::{CompileError, Result};

pub type Name = String;

/// An immutable piece of native query text plus the parameter values it references.
///
/// Fragments compose by concatenation (`join`/`lines`); once built, a fragment is never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    pub text: String,
    pub bindings: IndexMap<Name, JsonValue>,
}

impl Fragment {
    /// Wraps a known-safe compiler token verbatim. Never use this for user-controlled strings —
    /// those must go through [`value`] or [`identifier`].
    pub fn text(s: impl Into<String>) -> Fragment {
        Fragment {
            text: s.into(),
            bindings: IndexMap::new(),
        }
    }

    pub fn empty() -> Fragment {
        Fragment::text("")
    }

    pub fn is_empty_text(&self) -> bool {
        self.text.is_empty()
    }
}

/// Concatenates fragments with `sep` inserted between each pair, merging their bindings in order.
pub fn join(frags: impl IntoIterator<Item = Fragment>, sep: &str) -> Fragment {
    let mut text = String::new();
    let mut bindings = IndexMap::new();
    for (i, frag) in frags.into_iter().enumerate() {
        if i > 0 {
            text.push_str(sep);
        }
        text.push_str(&frag.text);
        bindings.extend(frag.bindings);
    }
    Fragment { text, bindings }
}

/// Concatenates fragments one per line.
pub fn lines(frags: impl IntoIterator<Item = Fragment>) -> Fragment {
    join(frags, "\n")
}

/// Indents every line of `frag` by two spaces, keeping its bindings.
pub fn indent(frag: Fragment) -> Fragment {
    let text = frag
        .text
        .lines()
        .map(|line| format!("  {line}"))
        .collect::<Vec<_>>()
        .join("\n");
    Fragment {
        text,
        bindings: frag.bindings,
    }
}

/// `true` iff `s` matches `[A-Za-z_][A-Za-z0-9_]*`, the dialect's safe bare-identifier grammar.
pub fn is_safe_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Validates `s` as a safe identifier and emits it verbatim; fails the compilation otherwise.
pub fn identifier(s: &str) -> Result<Fragment> {
    if is_safe_identifier(s) {
        Ok(Fragment::text(s))
    } else {
        Err(CompileError::InvalidIdentifier(s.to_string()))
    }
}

/// Like [`identifier`], for a collection/view name. Read/write tracking is the caller's
/// responsibility (via `Context::mark_read`/`mark_write`) — keeping this function free of `Context`
/// preserves the layering between the fragment builder and the compilation context.
pub fn collection(name: &str) -> Result<Fragment> {
    identifier(name)
}

/// Binds a JSON value as a named parameter, returning a placeholder fragment (`@p3`) that never
/// contains the value's text. Shared (via `Rc`) across every fragment produced while compiling one
/// top-level query (the main query, or a single pre-execution query), so that all its placeholders
/// land in one bindings table with stable, unique names.
#[derive(Debug, Clone, Default)]
pub struct Binder(Rc<RefCell<Vec<JsonValue>>>);

impl Binder {
    pub fn new() -> Self {
        Binder(Rc::new(RefCell::new(Vec::new())))
    }

    fn bind(&self, v: JsonValue) -> Name {
        let mut values = self.0.borrow_mut();
        let idx = values.len();
        values.push(v);
        format!("p{idx}")
    }
}

/// Binds `v` as a parameter; the value never appears as text, only as a named entry in the
/// returned fragment's bindings.
pub fn value(binder: &Binder, v: JsonValue) -> Fragment {
    let name = binder.bind(v.clone());
    let mut bindings = IndexMap::new();
    bindings.insert(name.clone(), v);
    Fragment {
        text: format!("@{name}"),
        bindings,
    }
}

/// Mints collision-resistant fragment-level names for transient loop variables and cross-query
/// result bindings. Shared across an entire compound query so that two pre-execution queries
/// never mint the same AQL variable name.
#[derive(Debug, Clone, Default)]
pub struct NameAllocator(Rc<Cell<u64>>);

impl NameAllocator {
    pub fn new() -> Self {
        NameAllocator(Rc::new(Cell::new(0)))
    }

    /// Allocates a fresh name derived from `label`, guaranteed distinct from every other name this
    /// allocator has produced.
    pub fn fresh(&self, label: &str) -> Name {
        let n = self.0.get();
        self.0.set(n + 1);
        let sanitized: String = label
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
            .collect();
        let sanitized = if sanitized.is_empty() { "v".to_string() } else { sanitized };
        format!("{sanitized}_{n}")
    }
}

impl fmt::Display for Fragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_reject_unsafe_characters() {
        assert!(identifier("order_number").is_ok());
        assert!(identifier("_private").is_ok());
        assert!(identifier("1leading_digit").is_err());
        assert!(identifier("has-dash").is_err());
        assert!(identifier("").is_err());
    }

    #[test]
    fn value_never_inlines_the_literal() {
        let binder = Binder::new();
        let frag = value(&binder, serde_json::json!("needle-in-a-haystack"));
        assert!(!frag.text.contains("needle-in-a-haystack"));
        assert_eq!(frag.bindings.len(), 1);
    }

    #[test]
    fn name_allocator_never_repeats() {
        let names = NameAllocator::new();
        let a = names.fresh("item");
        let b = names.fresh("item");
        assert_ne!(a, b);
    }

    #[test]
    fn join_merges_bindings_in_order() {
        let binder = Binder::new();
        let a = value(&binder, serde_json::json!(1));
        let b = value(&binder, serde_json::json!(2));
        let joined = join([a, b], ", ");
        assert_eq!(joined.text, "@p0, @p1");
        assert_eq!(joined.bindings.len(), 2);
    }
}
