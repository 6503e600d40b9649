//! Compiles a query intermediate representation tree into a parameterized document-store query,
//! in the spirit of the reference crate's `datastore::query::QueryEngine`: callers hand this crate
//! a well-formed [`ir::Node`] tree plus a [`model::ModelInfo`] implementation, and get back native
//! query text with bound parameters, never a string built by interpolating user data.
//!
//! ```text
//! ir::Node tree ──► lower::lower_query ──► rewrite passes ──► CompoundQuery
//! ```
//!
//! The crate never executes the query it builds; running it against a database and interpreting
//! [`RUNTIME_ERROR_TOKEN`] sentinels in the result is the caller's job.

pub mod context;
pub mod error;
pub mod fragment;
pub mod ir;
pub mod lower;
pub mod model;
pub mod rewrite;

use std::collections::BTreeSet;
use std::rc::Rc;

pub use context::PreExecQuery;
pub use error::{CompileError, Result};
pub use fragment::{Fragment, Name};

use context::Context;
use ir::NodeRef;
use model::{ModelInfo, PermissionProfile};

/// Sentinel object key the execution layer looks for in a query result to detect a
/// [`ir::Node::RuntimeError`] that was evaluated rather than short-circuited.
pub const RUNTIME_ERROR_TOKEN: &str = "__flexdb_runtime_error__";

/// The largest integer the native dialect accepts as a `LIMIT` bound, used in place of an
/// unbounded `maxCount` (`TransformList{skip: Some(k), max_count: None}`).
pub const MAX_SAFE_INTEGER: u64 = 9_007_199_254_740_991;

/// Per-compilation knobs, threaded through by value rather than read from globals or environment
/// variables (the reference crate's `RequestContext`/`Policies` pattern).
#[derive(Clone, Default)]
pub struct CompileConfig {
    /// Root entity type names for which the projection-indirection optimization
    /// (`TransformList` over `Entities(T)` rebinds its item variable through a second
    /// `DOCUMENT` lookup after `LIMIT`) is enabled. Empty by default: the optimization changes
    /// generated query shape and is opt-in per deployment.
    pub projection_indirection_for: BTreeSet<String>,
    /// Polled between pre-execution queries; returning `true` aborts the compilation with
    /// whatever partial state has accumulated discarded. `None` means never cancel.
    pub cancellation: Option<Rc<dyn Fn() -> bool>>,
}

impl CompileConfig {
    pub fn projection_indirection_enabled_for(&self, type_name: &str) -> bool {
        self.projection_indirection_for.contains(type_name)
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancellation.as_ref().is_some_and(|f| f())
    }
}

/// The fully compiled output: a main query fragment, the pre-execution queries it depends on (in
/// declaration order), and the union of collections the whole compound query reads from and
/// writes to.
#[derive(Debug, Clone)]
pub struct CompoundQuery {
    pub pre_exec: Vec<PreExecQuery>,
    pub main: Fragment,
    pub read_collections: BTreeSet<Name>,
    pub write_collections: BTreeSet<Name>,
}

/// Compiles `root` into a [`CompoundQuery`] against `model`, applying `config`'s deployment knobs
/// and consulting `permissions` (if given) while lowering mutation nodes.
pub fn compile_query(
    root: &NodeRef,
    model: &dyn ModelInfo,
    config: &CompileConfig,
    permissions: Option<Rc<dyn PermissionProfile>>,
) -> Result<CompoundQuery> {
    let ctx = Context::root(permissions);
    let main = lower::lower_top_level(root, &ctx, model, config)?;

    Ok(CompoundQuery {
        pre_exec: ctx.take_pre_exec(),
        main,
        read_collections: ctx.read_collections(),
        write_collections: ctx.write_collections(),
    })
}
