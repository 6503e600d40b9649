//! Compilation context: variable scoping, the pre-execution queue, and collection-access
//! tracking, grounded on the reference crate's append-only query-building contexts
//! (`server/src/datastore/query.rs`'s `convert_ops`, which threads an accumulating `QueryOpChain`
//! through recursive descent rather than mutating shared state in place).
//!
//! A `Context` is cheap to clone: every field is either a small `Rc`-linked scope chain or an
//! `Rc<RefCell<...>>` accumulator shared with every other clone descended from the same root.
//! "Clone, extend, recurse" replaces in-place mutation so that sibling subtrees never see each
//! other's transient variable bindings.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;

use crate::error::{CompileError, Result};
use crate::fragment::{Binder, Name, NameAllocator};
use crate::ir::Variable;
use crate::model::PermissionProfile;

/// A link in the persistent, append-only variable scope chain. Cloning a `Context` that has
/// introduced a new variable allocates one new `Cons` cell pointing at the unchanged parent chain
/// — older clones (sibling subtrees) never observe the addition.
#[derive(Debug, Clone)]
enum Scope {
    Empty,
    Cons {
        id: u64,
        fragment_name: Name,
        parent: Rc<Scope>,
    },
}

impl Scope {
    fn lookup(&self, id: u64) -> Option<&Name> {
        match self {
            Scope::Empty => None,
            Scope::Cons { id: here, fragment_name, parent } => {
                if *here == id {
                    Some(fragment_name)
                } else {
                    parent.lookup(id)
                }
            }
        }
    }

    fn contains(&self, id: u64) -> bool {
        self.lookup(id).is_some()
    }
}

/// A query compiled ahead of the main query, with its own isolated fragment (own `@p0, @p1, ...`
/// parameter table) and an optional binding of its result into the enclosing scope.
#[derive(Debug, Clone)]
pub struct PreExecQuery {
    pub fragment: crate::fragment::Fragment,
    pub result_binding: Option<Name>,
    pub validator: Option<Rc<dyn crate::ir::PreExecValidator>>,
}

/// Threaded through every lowering call. See the module doc for the cloning discipline.
#[derive(Clone)]
pub struct Context {
    transient: Rc<Scope>,
    query_results: Rc<Scope>,
    names: NameAllocator,
    binder: Binder,
    pre_exec: Rc<RefCell<Vec<PreExecQuery>>>,
    read_collections: Rc<RefCell<BTreeSet<String>>>,
    write_collections: Rc<RefCell<BTreeSet<String>>>,
    permissions: Option<Rc<dyn PermissionProfile>>,
}

impl Context {
    /// Starts a fresh compilation with empty scopes and a fresh parameter table, sharing nothing
    /// with any other `Context`.
    pub fn root(permissions: Option<Rc<dyn PermissionProfile>>) -> Self {
        Context {
            transient: Rc::new(Scope::Empty),
            query_results: Rc::new(Scope::Empty),
            names: NameAllocator::new(),
            binder: Binder::new(),
            pre_exec: Rc::new(RefCell::new(Vec::new())),
            read_collections: Rc::new(RefCell::new(BTreeSet::new())),
            write_collections: Rc::new(RefCell::new(BTreeSet::new())),
            permissions,
        }
    }

    pub fn binder(&self) -> &Binder {
        &self.binder
    }

    pub fn permissions(&self) -> Option<&Rc<dyn PermissionProfile>> {
        self.permissions.as_ref()
    }

    /// Clones this context with `v` bound to a freshly minted fragment variable name. Fails if `v`
    /// was already introduced in either the transient or query-result scope reachable from here.
    pub fn introduce_variable(&self, v: &Variable) -> Result<(Self, Name)> {
        if self.transient.contains(v.id()) || self.query_results.contains(v.id()) {
            return Err(CompileError::DoubleIntroduction {
                label: v.label().to_string(),
                id: v.id(),
            });
        }
        let fragment_name = self.names.fresh(v.label());
        let transient = Rc::new(Scope::Cons {
            id: v.id(),
            fragment_name: fragment_name.clone(),
            parent: self.transient.clone(),
        });
        let mut next = self.clone();
        next.transient = transient;
        Ok((next, fragment_name))
    }

    /// Resolves `v` to its fragment-level name.
    pub fn get_variable(&self, v: &Variable) -> Result<Name> {
        self.transient
            .lookup(v.id())
            .or_else(|| self.query_results.lookup(v.id()))
            .cloned()
            .ok_or_else(|| CompileError::UnboundVariable {
                label: v.label().to_string(),
                id: v.id(),
            })
    }

    /// Produces a fresh context for compiling one pre-execution query: the transient scope is
    /// hidden (a pre-exec query may not reference its parent's loop variables), query-result
    /// variables are inherited, and the parameter table starts empty (the pre-exec query gets its
    /// own fragment with its own `@p0, @p1, ...`). The pre-exec queue and collection-access sets
    /// stay shared, since they describe the whole compound query.
    pub fn new_pre_exec_context(&self) -> Self {
        Context {
            transient: Rc::new(Scope::Empty),
            query_results: self.query_results.clone(),
            names: self.names.clone(),
            binder: Binder::new(),
            pre_exec: self.pre_exec.clone(),
            read_collections: self.read_collections.clone(),
            write_collections: self.write_collections.clone(),
            permissions: self.permissions.clone(),
        }
    }

    /// Records a compiled pre-execution query and, if `result_var` was supplied, returns a clone
    /// of `self` with that variable bound to a fresh query-result fragment name visible to
    /// everything compiled afterward (including later pre-exec queries and the final result).
    pub fn after_pre_exec(
        &self,
        fragment: crate::fragment::Fragment,
        result_var: Option<&Variable>,
        validator: Option<Rc<dyn crate::ir::PreExecValidator>>,
    ) -> Self {
        let result_binding = result_var.map(|v| self.names.fresh(v.label()));
        self.pre_exec.borrow_mut().push(PreExecQuery {
            fragment,
            result_binding: result_binding.clone(),
            validator,
        });
        match (result_var, result_binding) {
            (Some(v), Some(name)) => {
                let query_results = Rc::new(Scope::Cons {
                    id: v.id(),
                    fragment_name: name,
                    parent: self.query_results.clone(),
                });
                let mut next = self.clone();
                next.query_results = query_results;
                next
            }
            _ => self.clone(),
        }
    }

    pub fn mark_read(&self, collection: impl Into<String>) {
        self.read_collections.borrow_mut().insert(collection.into());
    }

    pub fn mark_write(&self, collection: impl Into<String>) {
        self.write_collections.borrow_mut().insert(collection.into());
    }

    pub fn fresh_name(&self, label: &str) -> Name {
        self.names.fresh(label)
    }

    pub fn take_pre_exec(&self) -> Vec<PreExecQuery> {
        self.pre_exec.borrow().clone()
    }

    pub fn read_collections(&self) -> BTreeSet<String> {
        self.read_collections.borrow().clone()
    }

    pub fn write_collections(&self) -> BTreeSet<String> {
        self.write_collections.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Variable;

    #[test]
    fn introducing_twice_fails() {
        let ctx = Context::root(None);
        let v = Variable::new("item");
        let (ctx, _) = ctx.introduce_variable(&v).unwrap();
        let err = ctx.introduce_variable(&v).unwrap_err();
        assert!(matches!(err, CompileError::DoubleIntroduction { .. }));
    }

    #[test]
    fn unbound_lookup_fails() {
        let ctx = Context::root(None);
        let v = Variable::new("item");
        let err = ctx.get_variable(&v).unwrap_err();
        assert!(matches!(err, CompileError::UnboundVariable { .. }));
    }

    #[test]
    fn sibling_clones_do_not_see_each_others_transients() {
        let ctx = Context::root(None);
        let a = Variable::new("a");
        let b = Variable::new("b");
        let (ctx_a, _) = ctx.introduce_variable(&a).unwrap();
        let (ctx_b, _) = ctx.introduce_variable(&b).unwrap();
        assert!(ctx_a.get_variable(&a).is_ok());
        assert!(ctx_a.get_variable(&b).is_err());
        assert!(ctx_b.get_variable(&b).is_ok());
        assert!(ctx_b.get_variable(&a).is_err());
    }

    #[test]
    fn pre_exec_context_hides_transient_but_keeps_query_results() {
        let ctx = Context::root(None);
        let loop_var = Variable::new("loop_var");
        let (ctx, _) = ctx.introduce_variable(&loop_var).unwrap();

        let result_var = Variable::new("found");
        let ctx = ctx.after_pre_exec(crate::fragment::Fragment::text("1"), Some(&result_var), None);
        assert!(ctx.get_variable(&result_var).is_ok());

        let pre_ctx = ctx.new_pre_exec_context();
        assert!(pre_ctx.get_variable(&loop_var).is_err());
        assert!(pre_ctx.get_variable(&result_var).is_ok());
    }

    #[test]
    fn read_and_write_collections_accumulate_across_clones() {
        let ctx = Context::root(None);
        let v = Variable::new("x");
        let (child, _) = ctx.introduce_variable(&v).unwrap();
        child.mark_read("deliveries");
        ctx.mark_write("deliveries");
        assert_eq!(ctx.read_collections(), child.read_collections());
        assert!(ctx.write_collections().contains("deliveries"));
    }
}
