//! The lowering pass: dispatches over every [`ir::Node`] variant and produces the [`Fragment`] that
//! implements its semantics, grounded on the reference crate's `datastore::query::build` /
//! `datastore::sql_writer` pairing (a `QueryBuilder` walks a typed plan and asks a `SqlWriter` to
//! emit tokens, bind values, and track touched collections). The Rust `match` below plays the role
//! the reference's constructor-keyed dispatch table plays at runtime, except it is checked
//! exhaustively at compile time.
//!
//! Two cross-cutting behaviors live here rather than in `rewrite`, because both need a live
//! [`Context`] to allocate fragment names: hoisting a chain of `VariableAssignment`s into `LET`
//! lines (done once per compound-query root via [`lower_top_level`], and once per `TransformList`
//! projection), and the array-expansion fast path for `some` quantifiers.

use indexmap::IndexMap;
use serde_json::Value as JsonValue;

use crate::context::Context;
use crate::error::{CompileError, Result};
use crate::fragment::{self, Fragment, Name};
use crate::ir::{
    self, BasicType, BinaryOp, BinaryOpNode, EdgeDirection, LanguageOp, Node, NodeRef,
    Quantifier, RelationSide, UnaryOp, UnaryOpNode, Variable,
};
use crate::model::{self, ModelInfo};
use crate::rewrite;
use crate::CompileConfig;

/// Lowers the root of a compound query (the main query, or one `WithPreExecution` entry): hoists
/// any chain of top-level `VariableAssignment`s into `LET` lines (§4.E rule 1), then either
/// prefixes the remaining expression with `RETURN` or, if it is already a full mutation statement
/// (which carries its own `RETURN`), leaves it as-is.
pub fn lower_top_level(
    node: &NodeRef,
    ctx: &Context,
    model: &dyn ModelInfo,
    config: &CompileConfig,
) -> Result<Fragment> {
    let (_ctx, let_frags, stripped, result_frag) = hoist_assignments(node, ctx, model, config)?;

    let mut bindings = IndexMap::new();
    let mut text = String::new();
    for lf in &let_frags {
        bindings.extend(lf.bindings.clone());
        text.push_str(&lf.text);
        text.push('\n');
    }
    bindings.extend(result_frag.bindings.clone());
    if is_statement(&stripped) {
        text.push_str(&result_frag.text);
    } else {
        text.push_str("RETURN ");
        text.push_str(&result_frag.text);
    }
    Ok(Fragment { text, bindings })
}

/// A lowered mutation statement already embeds its own `RETURN` (or has none, for bare side
/// effects); it must not be wrapped in an outer `RETURN` by [`lower_top_level`].
fn is_statement(node: &NodeRef) -> bool {
    matches!(
        &**node,
        Node::CreateEntity { .. }
            | Node::UpdateEntities(_)
            | Node::DeleteEntities { .. }
            | Node::AddEdges { .. }
            | Node::RemoveEdges { .. }
            | Node::SetEdge { .. }
    )
}

/// Strips a chain of top-level `VariableAssignment`s off `node` (via
/// [`rewrite::extract_variable_assignments`]), lowers each assignment's value in turn — introducing
/// its variable into the context only after the value is lowered, so the value can never
/// accidentally observe its own binding — and finally lowers the remaining node in the extended
/// context.
///
/// Returns `(final_context, let_line_fragments, stripped_node, result_fragment)`; callers that need
/// to know whether the *original* root was a mutation (see [`is_statement`]) use `stripped_node`.
fn hoist_assignments(
    node: &NodeRef,
    ctx: &Context,
    model: &dyn ModelInfo,
    config: &CompileConfig,
) -> Result<(Context, Vec<Fragment>, NodeRef, Fragment)> {
    let (stripped, assignments) = rewrite::extract_variable_assignments(node);

    let mut work_ctx = ctx.clone();
    let mut let_frags = Vec::with_capacity(assignments.len());
    for assignment in &assignments {
        let value_frag = lower_node(&assignment.value, &work_ctx, model, config)?;
        let (next_ctx, name) = work_ctx.introduce_variable(&assignment.variable)?;
        log::trace!("hoisting assignment `{}` into a LET line", assignment.variable);
        let_frags.push(Fragment {
            text: format!("LET {name} = {}", value_frag.text),
            bindings: value_frag.bindings,
        });
        work_ctx = next_ctx;
    }
    let result_frag = lower_node(&stripped, &work_ctx, model, config)?;
    Ok((work_ctx, let_frags, stripped, result_frag))
}

/// Dispatches on the node's variant, implementing the lowering contract of §4.D.
pub fn lower_node(
    node: &NodeRef,
    ctx: &Context,
    model: &dyn ModelInfo,
    config: &CompileConfig,
) -> Result<Fragment> {
    match &**node {
        Node::Literal(v) => Ok(fragment::value(ctx.binder(), v.clone())),
        Node::ConstBool(b) => Ok(Fragment::text(if *b { "true" } else { "false" })),
        Node::ConstInt(i) => Ok(Fragment::text(i.to_string())),
        Node::Null => Ok(Fragment::text("null")),
        Node::RuntimeError(message) => {
            let value_frag = fragment::value(ctx.binder(), JsonValue::String(message.clone()));
            Ok(Fragment {
                text: format!("{{ {}: {} }}", crate::RUNTIME_ERROR_TOKEN, value_frag.text),
                bindings: value_frag.bindings,
            })
        }

        Node::Object(fields) => lower_object(fields, ctx, model, config),
        Node::List(items) => lower_list(items, ctx, model, config),
        Node::MergeObjects(items) => lower_variadic_call("MERGE", items, ctx, model, config),
        Node::ConcatLists(items) => lower_variadic_call("UNION", items, ctx, model, config),
        Node::FirstOfList(inner) => {
            let frag = lower_node(inner, ctx, model, config)?;
            Ok(Fragment { text: format!("FIRST({})", frag.text), bindings: frag.bindings })
        }
        Node::SafeList(inner) => {
            let value_frag = lower_node(inner, ctx, model, config)?;
            let cond = emit_type_check(&value_frag, BasicType::List);
            Ok(emit_conditional(cond, value_frag, Fragment::text("[]")))
        }

        Node::Variable(v) => Ok(Fragment::text(ctx.get_variable(v)?)),
        Node::VariableAssignment(a) => {
            let value_frag = lower_node(&a.value, ctx, model, config)?;
            let (next_ctx, name) = ctx.introduce_variable(&a.variable)?;
            let result_frag = lower_node(&a.result, &next_ctx, model, config)?;
            let mut bindings = value_frag.bindings;
            bindings.extend(result_frag.bindings);
            Ok(Fragment {
                text: format!("FIRST(LET {name} = {} RETURN {})", value_frag.text, result_frag.text),
                bindings,
            })
        }
        Node::WithPreExecution(w) => lower_with_pre_execution(w, ctx, model, config),

        Node::Field(fa) => {
            let obj_frag = lower_node(&fa.object, ctx, model, config)?;
            let mut text = obj_frag.text;
            let mut bindings = obj_frag.bindings;
            for seg in fa.path.iter().chain(std::iter::once(&fa.field)) {
                append_path_segment(&mut text, &mut bindings, seg, ctx);
            }
            Ok(Fragment { text, bindings })
        }
        Node::RootEntityID(obj) => {
            let obj_frag = lower_node(obj, ctx, model, config)?;
            Ok(Fragment { text: format!("{}._key", obj_frag.text), bindings: obj_frag.bindings })
        }
        Node::EntityFromID { root_entity_type, id } => {
            let coll = root_entity_collection(model, root_entity_type)?;
            ctx.mark_read(coll.clone());
            let coll_frag = fragment::collection(&coll)?;
            let id_frag = lower_node(id, ctx, model, config)?;
            Ok(Fragment {
                text: format!("DOCUMENT({}, {})", coll_frag.text, id_frag.text),
                bindings: id_frag.bindings,
            })
        }
        Node::Entities(type_name) => {
            let coll = root_entity_collection(model, type_name)?;
            ctx.mark_read(coll.clone());
            fragment::collection(&coll)
        }
        Node::FollowEdge { side, source } => {
            let body = lower_follow_edge_body(side, source, ctx, model, config)?;
            let n = ctx.fresh_name("n");
            Ok(Fragment {
                text: format!("(FOR {n} IN {} FILTER {n} != null RETURN {n})", body.text),
                bindings: body.bindings,
            })
        }

        Node::TransformList(t) => lower_transform_list(t, ctx, model, config),
        Node::Count(inner) => lower_count(inner, ctx, model, config),

        Node::BinaryOp(b) => lower_binary_op(b, ctx, model, config),
        Node::UnaryOp(u) => lower_unary_op(u, ctx, model, config),
        Node::Conditional { cond, then_branch, else_branch } => {
            let c = lower_node(cond, ctx, model, config)?;
            let t = lower_node(then_branch, ctx, model, config)?;
            let e = lower_node(else_branch, ctx, model, config)?;
            Ok(emit_conditional(c, t, e))
        }
        Node::TypeCheck { value, basic_type } => {
            let v = lower_node(value, ctx, model, config)?;
            Ok(emit_type_check(&v, *basic_type))
        }
        Node::OperatorWithLanguage(o) => lower_operator_with_language(o, ctx, model, config),

        Node::CreateEntity { type_name, object } => lower_create_entity(type_name, object, ctx, model, config),
        Node::UpdateEntities(u) => lower_update_entities(u, ctx, model, config),
        Node::DeleteEntities { type_name, list } => lower_delete_entities(type_name, list, ctx, model, config),
        Node::AddEdges { relation, edges } => lower_add_edges(relation, edges, ctx, model, config),
        Node::RemoveEdges { relation, edge_filter } => lower_remove_edges(relation, edge_filter, ctx, model, config),
        Node::SetEdge { relation, existing, new } => lower_set_edge(relation, existing, new, ctx, model, config),

        Node::QuantifierFilter(q) => lower_quantifier_filter(q, ctx, model, config),
        Node::QuickSearch(q) => lower_quick_search(q, ctx, model, config),
    }
}

fn lower_object(
    fields: &IndexMap<String, NodeRef>,
    ctx: &Context,
    model: &dyn ModelInfo,
    config: &CompileConfig,
) -> Result<Fragment> {
    if fields.is_empty() {
        return Ok(Fragment::text("{}"));
    }
    let mut bindings = IndexMap::new();
    let mut parts = Vec::with_capacity(fields.len());
    for (key, value_node) in fields {
        let value_frag = lower_node(value_node, ctx, model, config)?;
        bindings.extend(value_frag.bindings.clone());
        if fragment::is_safe_identifier(key) {
            parts.push(format!("{key}: {}", value_frag.text));
        } else {
            let key_frag = fragment::value(ctx.binder(), JsonValue::String(key.clone()));
            bindings.extend(key_frag.bindings.clone());
            parts.push(format!("[{}]: {}", key_frag.text, value_frag.text));
        }
    }
    Ok(Fragment { text: format!("{{ {} }}", parts.join(", ")), bindings })
}

fn lower_list(items: &[NodeRef], ctx: &Context, model: &dyn ModelInfo, config: &CompileConfig) -> Result<Fragment> {
    if items.is_empty() {
        return Ok(Fragment::text("[]"));
    }
    let mut bindings = IndexMap::new();
    let mut parts = Vec::with_capacity(items.len());
    for item in items {
        let frag = lower_node(item, ctx, model, config)?;
        bindings.extend(frag.bindings);
        parts.push(frag.text);
    }
    Ok(Fragment { text: format!("[{}]", parts.join(", ")), bindings })
}

fn lower_variadic_call(
    name: &str,
    items: &[NodeRef],
    ctx: &Context,
    model: &dyn ModelInfo,
    config: &CompileConfig,
) -> Result<Fragment> {
    let mut bindings = IndexMap::new();
    let mut parts = Vec::with_capacity(items.len());
    for item in items {
        let frag = lower_node(item, ctx, model, config)?;
        bindings.extend(frag.bindings);
        parts.push(frag.text);
    }
    Ok(Fragment { text: format!("{name}({})", parts.join(", ")), bindings })
}

fn append_path_segment(text: &mut String, bindings: &mut IndexMap<Name, JsonValue>, seg: &str, ctx: &Context) {
    if fragment::is_safe_identifier(seg) {
        text.push('.');
        text.push_str(seg);
    } else {
        let seg_frag = fragment::value(ctx.binder(), JsonValue::String(seg.to_string()));
        text.push('[');
        text.push_str(&seg_frag.text);
        text.push(']');
        bindings.extend(seg_frag.bindings);
    }
}

fn root_entity_collection(model: &dyn ModelInfo, type_name: &str) -> Result<String> {
    model
        .root_entity(type_name)
        .map(|info| info.collection_name().to_string())
        .ok_or_else(|| CompileError::malformed(format!("unknown root entity type `{type_name}`")))
}

fn relation_edge_collection(model: &dyn ModelInfo, relation: &str) -> Result<String> {
    model
        .relation(relation)
        .map(|info| info.edge_collection_name().to_string())
        .ok_or_else(|| CompileError::malformed(format!("unknown relation `{relation}`")))
}

fn lower_follow_edge_body(
    side: &RelationSide,
    source: &NodeRef,
    ctx: &Context,
    model: &dyn ModelInfo,
    config: &CompileConfig,
) -> Result<Fragment> {
    let edge_coll = relation_edge_collection(model, &side.relation)?;
    ctx.mark_read(edge_coll.clone());
    let dir = match side.direction {
        EdgeDirection::Outbound => "OUTBOUND",
        EdgeDirection::Inbound => "INBOUND",
    };
    let source_frag = lower_node(source, ctx, model, config)?;
    let edge_frag = fragment::collection(&edge_coll)?;
    Ok(Fragment {
        text: format!("{dir} {} {}", source_frag.text, edge_frag.text),
        bindings: source_frag.bindings,
    })
}

fn emit_type_check(value_frag: &Fragment, basic_type: BasicType) -> Fragment {
    let text = match basic_type {
        BasicType::Scalar => format!(
            "IS_BOOL({0}) || IS_NUMBER({0}) || IS_STRING({0})",
            value_frag.text
        ),
        BasicType::List => format!("IS_LIST({})", value_frag.text),
        BasicType::Object => format!("IS_OBJECT({})", value_frag.text),
        BasicType::Null => format!("IS_NULL({})", value_frag.text),
    };
    Fragment { text, bindings: value_frag.bindings.clone() }
}

fn emit_conditional(cond: Fragment, then_frag: Fragment, else_frag: Fragment) -> Fragment {
    let text = format!("({} ? {} : {})", cond.text, then_frag.text, else_frag.text);
    let mut bindings = cond.bindings;
    bindings.extend(then_frag.bindings);
    bindings.extend(else_frag.bindings);
    Fragment { text, bindings }
}

fn lower_count(inner: &NodeRef, ctx: &Context, model: &dyn ModelInfo, config: &CompileConfig) -> Result<Fragment> {
    let frag = lower_node(inner, ctx, model, config)?;
    match &**inner {
        Node::Field(_) | Node::Entities(_) => {
            Ok(Fragment { text: format!("LENGTH({})", frag.text), bindings: frag.bindings })
        }
        _ => {
            let item = ctx.fresh_name("i");
            let count = ctx.fresh_name("c");
            Ok(Fragment {
                text: format!(
                    "FIRST(FOR {item} IN {} COLLECT WITH COUNT INTO {count} RETURN {count})",
                    frag.text
                ),
                bindings: frag.bindings,
            })
        }
    }
}

fn lower_unary_op(u: &ir::UnaryOpNode, ctx: &Context, model: &dyn ModelInfo, config: &CompileConfig) -> Result<Fragment> {
    let v = lower_node(&u.value, ctx, model, config)?;
    let text = match u.op {
        UnaryOp::Not => format!("!({})", v.text),
        UnaryOp::JsonStringify => format!("JSON_STRINGIFY({})", v.text),
    };
    Ok(Fragment { text, bindings: v.bindings })
}

/// `None` for the operators `LIKE`/`CONTAINS`/`STARTS_WITH`/`ENDS_WITH`/`APPEND`/`PREPEND`, which
/// have their own non-infix lowerings (§4.D.2).
fn native_infix_token(op: BinaryOp) -> Option<&'static str> {
    use BinaryOp::*;
    match op {
        And => Some("&&"),
        Or => Some("||"),
        Equal => Some("=="),
        Unequal => Some("!="),
        LessThan => Some("<"),
        LessThanOrEqual => Some("<="),
        GreaterThan => Some(">"),
        GreaterThanOrEqual => Some(">="),
        In => Some("IN"),
        Add => Some("+"),
        Subtract => Some("-"),
        Multiply => Some("*"),
        Divide => Some("/"),
        Modulo => Some("%"),
        Contains | StartsWith | EndsWith | Like | Append | Prepend => None,
    }
}

fn literal_string_of(node: &NodeRef) -> Option<&str> {
    match &**node {
        Node::Literal(JsonValue::String(s)) => Some(s.as_str()),
        _ => None,
    }
}

enum LikeShape {
    /// No `%`/`_` wildcard anywhere in the pattern.
    FullyLiteral(String),
    /// A literal prefix followed by exactly one trailing `%` and nothing else.
    SimplePrefix(String),
    /// Anything else containing a wildcard: the literal prefix before the first wildcard.
    Mixed(String),
}

fn analyze_like_pattern(pattern: &str) -> LikeShape {
    match pattern.find(['%', '_']) {
        None => LikeShape::FullyLiteral(pattern.to_string()),
        Some(idx) => {
            let prefix = pattern[..idx].to_string();
            let is_trailing_percent_only = idx == pattern.len() - 1 && pattern.as_bytes()[idx] == b'%';
            if is_trailing_percent_only {
                LikeShape::SimplePrefix(prefix)
            } else {
                LikeShape::Mixed(prefix)
            }
        }
    }
}

/// `fastStartsWith` of §4.D.2: an index-friendly case-insensitive prefix range. Correct because the
/// dialect's collation sorts case-insensitively, so every string equal to `prefix` ignoring case
/// falls between `UPPER(prefix)` and `LOWER(prefix + U+10FFFF)`.
fn fast_starts_with(lhs: &Fragment, prefix: &str, ctx: &Context) -> Fragment {
    if prefix.is_empty() {
        return Fragment {
            text: format!("IS_STRING({})", lhs.text),
            bindings: lhs.bindings.clone(),
        };
    }
    let max = format!("{prefix}\u{10FFFF}");
    let lo = fragment::value(ctx.binder(), JsonValue::String(prefix.to_string()));
    let hi = fragment::value(ctx.binder(), JsonValue::String(max));
    let mut bindings = lhs.bindings.clone();
    bindings.extend(lo.bindings);
    bindings.extend(hi.bindings);
    Fragment {
        text: format!("({0} >= UPPER({1}) && {0} < LOWER({2}))", lhs.text, lo.text, hi.text),
        bindings,
    }
}

/// `equalsIgnoreCase` of §4.D.2.
fn equals_ignore_case(lhs: &Fragment, value_str: &str, ctx: &Context) -> Fragment {
    let v = fragment::value(ctx.binder(), JsonValue::String(value_str.to_string()));
    let mut bindings = lhs.bindings.clone();
    bindings.extend(v.bindings);
    if value_str.to_lowercase() == value_str.to_uppercase() {
        Fragment { text: format!("({} == {})", lhs.text, v.text), bindings }
    } else {
        Fragment {
            text: format!("({0} >= UPPER({1}) && {0} <= LOWER({1}))", lhs.text, v.text),
            bindings,
        }
    }
}

fn lower_binary_op(b: &BinaryOpNode, ctx: &Context, model: &dyn ModelInfo, config: &CompileConfig) -> Result<Fragment> {
    // `x IN FollowEdge(...)` is the one place the bare, un-filtered `OUTBOUND|INBOUND` traversal
    // form is correct (§4.D): `IN` tests membership against the raw edge-traversal result, so there
    // is no dangling-edge risk that needs the `FILTER n != null` wrapper the generic Field/List
    // dispatch otherwise gives FollowEdge.
    if b.op == BinaryOp::In {
        if let Node::FollowEdge { side, source } = &*b.rhs {
            let lhs = lower_node(&b.lhs, ctx, model, config)?;
            let rhs = lower_follow_edge_body(side, source, ctx, model, config)?;
            let mut bindings = lhs.bindings;
            bindings.extend(rhs.bindings);
            return Ok(Fragment { text: format!("({} IN {})", lhs.text, rhs.text), bindings });
        }
    }

    if let Some(tok) = native_infix_token(b.op) {
        let lhs = lower_node(&b.lhs, ctx, model, config)?;
        let rhs = lower_node(&b.rhs, ctx, model, config)?;
        let mut bindings = lhs.bindings;
        bindings.extend(rhs.bindings);
        return Ok(Fragment { text: format!("({} {tok} {})", lhs.text, rhs.text), bindings });
    }

    match b.op {
        BinaryOp::Contains => {
            let lhs = lower_node(&b.lhs, ctx, model, config)?;
            let rhs = lower_node(&b.rhs, ctx, model, config)?;
            let mut bindings = lhs.bindings;
            bindings.extend(rhs.bindings);
            Ok(Fragment {
                text: format!("({} LIKE CONCAT(\"%\", {}, \"%\"))", lhs.text, rhs.text),
                bindings,
            })
        }
        BinaryOp::StartsWith => {
            let lhs = lower_node(&b.lhs, ctx, model, config)?;
            let rhs = lower_node(&b.rhs, ctx, model, config)?;
            let mut bindings = lhs.bindings.clone();
            bindings.extend(rhs.bindings.clone());
            let base = format!("(LEFT({}, LENGTH({1})) == {1})", lhs.text, rhs.text);
            match literal_string_of(&b.rhs) {
                Some(prefix) => {
                    let fast = fast_starts_with(&lhs, prefix, ctx);
                    bindings.extend(fast.bindings);
                    Ok(Fragment { text: format!("({} && {})", fast.text, base), bindings })
                }
                None => Ok(Fragment { text: base, bindings }),
            }
        }
        BinaryOp::EndsWith => {
            let lhs = lower_node(&b.lhs, ctx, model, config)?;
            let rhs = lower_node(&b.rhs, ctx, model, config)?;
            let mut bindings = lhs.bindings;
            bindings.extend(rhs.bindings.clone());
            Ok(Fragment { text: format!("(RIGHT({}, LENGTH({1})) == {1})", lhs.text, rhs.text), bindings })
        }
        BinaryOp::Like => {
            let lhs = lower_node(&b.lhs, ctx, model, config)?;
            match literal_string_of(&b.rhs) {
                Some(pattern) => match analyze_like_pattern(pattern) {
                    LikeShape::FullyLiteral(lit) => Ok(equals_ignore_case(&lhs, &lit, ctx)),
                    LikeShape::SimplePrefix(prefix) => Ok(fast_starts_with(&lhs, &prefix, ctx)),
                    LikeShape::Mixed(prefix) => {
                        let fast = fast_starts_with(&lhs, &prefix, ctx);
                        let rhs = lower_node(&b.rhs, ctx, model, config)?;
                        let mut bindings = fast.bindings;
                        bindings.extend(rhs.bindings.clone());
                        Ok(Fragment {
                            text: format!("({} && LIKE({}, {}, true))", fast.text, lhs.text, rhs.text),
                            bindings,
                        })
                    }
                },
                None => {
                    let rhs = lower_node(&b.rhs, ctx, model, config)?;
                    let mut bindings = lhs.bindings;
                    bindings.extend(rhs.bindings);
                    Ok(Fragment { text: format!("LIKE({}, {}, true)", lhs.text, rhs.text), bindings })
                }
            }
        }
        BinaryOp::Append => {
            let lhs = lower_node(&b.lhs, ctx, model, config)?;
            let rhs = lower_node(&b.rhs, ctx, model, config)?;
            let mut bindings = lhs.bindings;
            bindings.extend(rhs.bindings.clone());
            Ok(Fragment { text: format!("CONCAT({}, {})", lhs.text, rhs.text), bindings })
        }
        BinaryOp::Prepend => {
            let lhs = lower_node(&b.lhs, ctx, model, config)?;
            let rhs = lower_node(&b.rhs, ctx, model, config)?;
            let mut bindings = rhs.bindings;
            bindings.extend(lhs.bindings.clone());
            Ok(Fragment { text: format!("CONCAT({}, {})", rhs.text, lhs.text), bindings })
        }
        _ => unreachable!("native_infix_token covers every remaining BinaryOp"),
    }
}

fn lower_operator_with_language(
    o: &ir::OperatorWithLanguage,
    ctx: &Context,
    model: &dyn ModelInfo,
    config: &CompileConfig,
) -> Result<Fragment> {
    let lhs = lower_node(&o.lhs, ctx, model, config)?;
    let rhs = lower_node(&o.rhs, ctx, model, config)?;
    let mut bindings = lhs.bindings;
    bindings.extend(rhs.bindings.clone());

    // QUICKSEARCH_STARTS_WITH is a raw, un-tokenized prefix check and always uses the identity
    // analyzer regardless of the field's configured language (§4.D bullet on OperatorWithLanguage).
    let analyzer = if o.op == LanguageOp::QuickSearchStartsWith {
        model::analyzer_name(None)
    } else {
        model::analyzer_name(o.language.as_deref())
    };

    // The source's QUICKSEARCH_CONTAINS_PREFIX template has an unbalanced extra `)`; we emit the
    // balanced form (see SPEC_FULL's "source oddities" note).
    let inner = match o.op {
        LanguageOp::QuickSearchStartsWith | LanguageOp::QuickSearchContainsPrefix => {
            format!("STARTS_WITH({}, {})", lhs.text, rhs.text)
        }
        LanguageOp::QuickSearchContainsAnyWord => {
            format!("{} IN TOKENS({}, \"{analyzer}\")", lhs.text, rhs.text)
        }
        LanguageOp::QuickSearchContainsPhrase => format!("PHRASE({}, {})", lhs.text, rhs.text),
    };
    Ok(Fragment { text: format!("ANALYZER({inner}, {analyzer})"), bindings })
}

/// Walks a chain of `Field` accesses down to their base object, returning the full path (including
/// every `Field.path` segment and `Field.field`, in root-to-leaf order) iff the chain bottoms out
/// exactly at the variable with id `item_id`. Used by the quantifier array-expansion fast path.
fn field_chain_from_item(node: &NodeRef, item_id: u64) -> Option<Vec<String>> {
    match &**node {
        Node::Variable(v) if v.id() == item_id => Some(Vec::new()),
        Node::Field(fa) => {
            let mut prefix = field_chain_from_item(&fa.object, item_id)?;
            prefix.extend(fa.path.iter().cloned());
            prefix.push(fa.field.clone());
            Some(prefix)
        }
        _ => None,
    }
}

/// §4.D.3's array-expansion fast path. Only ever attempted for `some`; returns `None` whenever the
/// shape doesn't match, letting the caller fall through to the canonical `COUNT(...) > 0` form.
fn try_array_expansion(
    q: &ir::QuantifierFilter,
    ctx: &Context,
    model: &dyn ModelInfo,
    config: &CompileConfig,
) -> Result<Option<Fragment>> {
    let list_unwrapped = match &*q.list {
        Node::SafeList(inner) => inner,
        _ => &q.list,
    };
    if !matches!(&**list_unwrapped, Node::Field(_)) {
        return Ok(None);
    }

    let (rhs_frag, chain) = match &*q.condition {
        Node::BinaryOp(b) if b.op == BinaryOp::Equal => {
            match field_chain_from_item(&b.lhs, q.item_variable.id()) {
                Some(chain) if !chain.is_empty() => (lower_node(&b.rhs, ctx, model, config)?, chain),
                _ => return Ok(None),
            }
        }
        Node::BinaryOp(b) if b.op == BinaryOp::Like => {
            let chain = field_chain_from_item(&b.lhs, q.item_variable.id());
            match (literal_string_of(&b.rhs), chain) {
                (Some(pattern), Some(chain)) if !chain.is_empty() => match analyze_like_pattern(pattern) {
                    LikeShape::FullyLiteral(lit) => {
                        (fragment::value(ctx.binder(), JsonValue::String(lit)), chain)
                    }
                    _ => return Ok(None),
                },
                _ => return Ok(None),
            }
        }
        _ => return Ok(None),
    };

    let list_frag = lower_node(&q.list, ctx, model, config)?;
    let mut text = list_frag.text.clone();
    text.push_str("[*]");
    let mut bindings = list_frag.bindings;
    for seg in &chain {
        append_path_segment(&mut text, &mut bindings, seg, ctx);
    }
    bindings.extend(rhs_frag.bindings.clone());
    Ok(Some(Fragment { text: format!("{} IN {}", rhs_frag.text, text), bindings }))
}

fn lower_quantifier_filter(
    q: &ir::QuantifierFilter,
    ctx: &Context,
    model: &dyn ModelInfo,
    config: &CompileConfig,
) -> Result<Fragment> {
    if q.quantifier == Quantifier::Some {
        if let Some(frag) = try_array_expansion(q, ctx, model, config)? {
            return Ok(frag);
        }
    }

    // Canonical reduction: `every` becomes `none` over the negated condition; `some`/`none` keep
    // their condition and differ only in the final comparison against the filtered count.
    let condition = match q.quantifier {
        Quantifier::Every => Node::UnaryOp(UnaryOpNode { op: UnaryOp::Not, value: q.condition.clone() }).rc(),
        Quantifier::Some | Quantifier::None => q.condition.clone(),
    };
    let filtered = Node::TransformList(ir::TransformList {
        list: q.list.clone(),
        item_variable: q.item_variable.clone(),
        filter: Some(condition),
        order_by: Vec::new(),
        skip: None,
        max_count: None,
        inner: Node::Variable(q.item_variable.clone()).rc(),
    })
    .rc();
    let count_frag = lower_count(&filtered, ctx, model, config)?;
    let comparison = match q.quantifier {
        Quantifier::Some => "> 0",
        Quantifier::Every | Quantifier::None => "== 0",
    };
    Ok(Fragment { text: format!("({} {comparison})", count_frag.text), bindings: count_frag.bindings })
}

fn lower_quick_search(q: &ir::QuickSearch, ctx: &Context, model: &dyn ModelInfo, config: &CompileConfig) -> Result<Fragment> {
    let coll = root_entity_collection(model, &q.root_entity_type)?;
    ctx.mark_read(coll.clone());
    let view = model::flex_view_name(&coll);
    let (ctx2, item_name) = ctx.introduce_variable(&q.item_variable)?;
    let filter_frag = lower_node(&q.filter, &ctx2, model, config)?;
    Ok(Fragment {
        text: format!("(FOR {item_name} IN {view} SEARCH {} RETURN {item_name})", filter_frag.text),
        bindings: filter_frag.bindings,
    })
}

/// Replaces every `Variable` node with id `target` by `Node::Variable(replacement)`, recursing
/// through every other node unchanged. Used by projection indirection (§4.D.1 step 7) to rebind a
/// `TransformList`'s projection inside `inner` without touching `filter`/`orderBy`, which must keep
/// seeing the pre-projection item.
fn substitute_variable(node: &NodeRef, target: u64, replacement: &Variable) -> NodeRef {
    if let Node::Variable(v) = &**node {
        if v.id() == target {
            return Node::Variable(replacement.clone()).rc();
        }
    }
    ir::map_children(node, &mut |child| substitute_variable(child, target, replacement)).rc()
}

fn lower_transform_list(
    t: &ir::TransformList,
    ctx: &Context,
    model: &dyn ModelInfo,
    config: &CompileConfig,
) -> Result<Fragment> {
    let mut bindings = IndexMap::new();

    // Step 3: a FollowEdge list is lowered in its "simple" OUTBOUND/INBOUND form and gets an
    // implicit `item != null` filter appended, rather than going through the generic dispatch
    // (which would wrap it in its own dangling-edge-filtering subquery).
    let (list_frag, needs_not_null_filter) = match &*t.list {
        Node::FollowEdge { side, source } => (lower_follow_edge_body(side, source, ctx, model, config)?, true),
        _ => (lower_node(&t.list, ctx, model, config)?, false),
    };
    bindings.extend(list_frag.bindings.clone());

    // Step 1: itemVar is visible to filter/orderBy/inner, never to `list` itself.
    let (ctx2, item_name) = ctx.introduce_variable(&t.item_variable)?;

    let combined_filter: Option<NodeRef> = if needs_not_null_filter {
        let not_null = Node::BinaryOp(BinaryOpNode {
            op: BinaryOp::Unequal,
            lhs: Node::Variable(t.item_variable.clone()).rc(),
            rhs: Node::Null.rc(),
        })
        .rc();
        match &t.filter {
            Some(f) => Some(Node::BinaryOp(BinaryOpNode { op: BinaryOp::And, lhs: f.clone(), rhs: not_null }).rc()),
            None => Some(not_null),
        }
    } else {
        t.filter.clone()
    };

    // Step 4: fold constant booleans; an always-true filter is omitted entirely.
    let filter_clause = match &combined_filter {
        Some(f) if !rewrite::simplifies_to_true(f) => {
            let simplified = rewrite::simplify_booleans(f);
            let frag = lower_node(&simplified, &ctx2, model, config)?;
            bindings.extend(frag.bindings.clone());
            Some(frag.text)
        }
        _ => None,
    };

    // Step 5.
    let mut order_parts = Vec::with_capacity(t.order_by.len());
    for clause in &t.order_by {
        let frag = lower_node(&clause.expr, &ctx2, model, config)?;
        bindings.extend(frag.bindings.clone());
        order_parts.push(if clause.descending {
            format!("({}) DESC", frag.text)
        } else {
            format!("({})", frag.text)
        });
    }

    // Step 6: the LIMIT matrix.
    let skip = t.skip.unwrap_or(0);
    let limit_clause = match (skip, t.max_count) {
        (0, Some(max)) => Some(format!("LIMIT {max}")),
        (skip, Some(max)) if skip > 0 => Some(format!("LIMIT {skip}, {max}")),
        (skip, None) if skip > 0 => Some(format!("LIMIT {skip}, {}", crate::MAX_SAFE_INTEGER)),
        _ => None,
    };

    // Step 7: projection indirection, gated per root-entity type by `CompileConfig`.
    let (proj_let, inner_ctx, inner_node) = match &*t.list {
        Node::Entities(type_name) => {
            let inner_is_bare_item = matches!(&*t.inner, Node::Variable(v) if v.id() == t.item_variable.id());
            if !inner_is_bare_item && t.max_count.is_some() && config.projection_indirection_enabled_for(type_name) {
                let proj_var = Variable::new(format!("{}_proj", t.item_variable.label()));
                let rewritten_inner = substitute_variable(&t.inner, t.item_variable.id(), &proj_var);
                let (ctx3, proj_name) = ctx2.introduce_variable(&proj_var)?;
                log::debug!("projection indirection enabled for `{type_name}`, rebinding via DOCUMENT(...)");
                let let_line = format!("LET {proj_name} = DOCUMENT({item_name}._id)");
                (Some(let_line), ctx3, rewritten_inner)
            } else {
                (None, ctx2.clone(), t.inner.clone())
            }
        }
        _ => (None, ctx2.clone(), t.inner.clone()),
    };

    // Step 2: hoist assignments out of the (possibly rewritten) projection.
    let (_final_ctx, let_frags, _stripped, result_frag) = hoist_assignments(&inner_node, &inner_ctx, model, config)?;
    for lf in &let_frags {
        bindings.extend(lf.bindings.clone());
    }
    bindings.extend(result_frag.bindings.clone());

    let mut text = format!("(FOR {item_name} IN {}", list_frag.text);
    if let Some(fc) = &filter_clause {
        text.push_str(" FILTER ");
        text.push_str(fc);
    }
    if !order_parts.is_empty() {
        text.push_str(" SORT ");
        text.push_str(&order_parts.join(", "));
    }
    if let Some(lc) = &limit_clause {
        text.push(' ');
        text.push_str(lc);
    }
    if let Some(pl) = &proj_let {
        text.push(' ');
        text.push_str(pl);
    }
    for lf in &let_frags {
        text.push(' ');
        text.push_str(&lf.text);
    }
    text.push_str(" RETURN ");
    text.push_str(&result_frag.text);
    text.push(')');

    Ok(Fragment { text, bindings })
}

/// Rewrites `object`'s fields through the permission seam (§6): a field write the active
/// `PermissionProfile` does not authorize is replaced by a `RuntimeError` node rather than silently
/// emitted. Only applies when `object` is a literal `Object` node (field names are then known
/// statically); anything else passes through untouched, since the compiler cannot enumerate the
/// fields of an opaque expression.
fn authorize_object_fields(object: &NodeRef, type_name: &str, ctx: &Context) -> Result<NodeRef> {
    let profile = match ctx.permissions() {
        Some(profile) => profile,
        None => return Ok(object.clone()),
    };
    let fields = match &**object {
        Node::Object(fields) => fields,
        _ => return Ok(object.clone()),
    };
    let mut authorized = IndexMap::with_capacity(fields.len());
    for (field_name, value) in fields {
        if profile.authorize_field_write(type_name, field_name).is_some() {
            authorized.insert(field_name.clone(), value.clone());
        } else {
            log::debug!("write to `{type_name}.{field_name}` denied by permission profile");
            let err = Node::runtime_error(format!("write to `{type_name}.{field_name}` is not authorized"))?;
            authorized.insert(field_name.clone(), err);
        }
    }
    Ok(Node::Object(authorized).rc())
}

fn authorize_update_value(type_name: &str, field_name: &str, value: &NodeRef, ctx: &Context) -> Result<NodeRef> {
    match ctx.permissions() {
        Some(profile) if profile.authorize_field_write(type_name, field_name).is_none() => {
            log::debug!("write to `{type_name}.{field_name}` denied by permission profile");
            Node::runtime_error(format!("write to `{type_name}.{field_name}` is not authorized"))
        }
        _ => Ok(value.clone()),
    }
}

fn lower_create_entity(
    type_name: &str,
    object: &NodeRef,
    ctx: &Context,
    model: &dyn ModelInfo,
    config: &CompileConfig,
) -> Result<Fragment> {
    let coll = root_entity_collection(model, type_name)?;
    let object = authorize_object_fields(object, type_name, ctx)?;
    let obj_frag = lower_node(&object, ctx, model, config)?;
    let coll_frag = fragment::collection(&coll)?;
    ctx.mark_write(coll);
    Ok(Fragment {
        text: format!("INSERT {} IN {} RETURN NEW._key", obj_frag.text, coll_frag.text),
        bindings: obj_frag.bindings,
    })
}

fn lower_update_entities(u: &ir::UpdateEntities, ctx: &Context, model: &dyn ModelInfo, config: &CompileConfig) -> Result<Fragment> {
    let coll = root_entity_collection(model, &u.type_name)?;
    let list_frag = lower_node(&u.list, ctx, model, config)?;
    let (ctx2, cur_name) = ctx.introduce_variable(&u.current_variable)?;

    let mut bindings = list_frag.bindings.clone();
    let mut parts = Vec::with_capacity(u.updates.len());
    for (field_name, value_node) in &u.updates {
        let value_node = authorize_update_value(&u.type_name, field_name, value_node, &ctx2)?;
        let value_frag = lower_node(&value_node, &ctx2, model, config)?;
        bindings.extend(value_frag.bindings.clone());
        if fragment::is_safe_identifier(field_name) {
            parts.push(format!("{field_name}: {}", value_frag.text));
        } else {
            let key_frag = fragment::value(ctx2.binder(), JsonValue::String(field_name.clone()));
            bindings.extend(key_frag.bindings.clone());
            parts.push(format!("[{}]: {}", key_frag.text, value_frag.text));
        }
    }
    let updates_obj = format!("{{ {} }}", parts.join(", "));
    let coll_frag = fragment::collection(&coll)?;
    ctx.mark_write(coll);
    Ok(Fragment {
        text: format!(
            "(FOR {0} IN {1} UPDATE {0} WITH {2} IN {3} RETURN NEW)",
            cur_name, list_frag.text, updates_obj, coll_frag.text
        ),
        bindings,
    })
}

fn lower_delete_entities(type_name: &str, list: &NodeRef, ctx: &Context, model: &dyn ModelInfo, config: &CompileConfig) -> Result<Fragment> {
    let coll = root_entity_collection(model, type_name)?;
    let list_frag = lower_node(list, ctx, model, config)?;
    let var = ctx.fresh_name("d");
    let coll_frag = fragment::collection(&coll)?;
    ctx.mark_write(coll);
    Ok(Fragment {
        text: format!("(FOR {0} IN {1} REMOVE {0} IN {2})", var, list_frag.text, coll_frag.text),
        bindings: list_frag.bindings,
    })
}

fn lower_add_edges(relation: &str, edges: &[ir::EdgeLiteral], ctx: &Context, model: &dyn ModelInfo, config: &CompileConfig) -> Result<Fragment> {
    let edge_coll = relation_edge_collection(model, relation)?;
    let mut bindings = IndexMap::new();
    let mut objs = Vec::with_capacity(edges.len());
    for e in edges {
        let from_frag = lower_node(&e.from, ctx, model, config)?;
        let to_frag = lower_node(&e.to, ctx, model, config)?;
        bindings.extend(from_frag.bindings.clone());
        bindings.extend(to_frag.bindings.clone());
        objs.push(format!("{{ _from: {}, _to: {} }}", from_frag.text, to_frag.text));
    }
    let var = ctx.fresh_name("e");
    let edge_coll_frag = fragment::collection(&edge_coll)?;
    ctx.mark_write(edge_coll);
    Ok(Fragment {
        text: format!("(FOR {0} IN [{1}] INSERT {0} IN {2})", var, objs.join(", "), edge_coll_frag.text),
        bindings,
    })
}

fn lower_remove_edges(relation: &str, edge_filter: &NodeRef, ctx: &Context, model: &dyn ModelInfo, config: &CompileConfig) -> Result<Fragment> {
    let edge_coll = relation_edge_collection(model, relation)?;
    let filter_frag = lower_node(edge_filter, ctx, model, config)?;
    let var = ctx.fresh_name("e");
    let edge_coll_frag = fragment::collection(&edge_coll)?;
    ctx.mark_write(edge_coll);
    Ok(Fragment {
        text: format!("(FOR {0} IN {1} REMOVE {0} IN {2})", var, filter_frag.text, edge_coll_frag.text),
        bindings: filter_frag.bindings,
    })
}

fn lower_set_edge(relation: &str, existing: &NodeRef, new: &NodeRef, ctx: &Context, model: &dyn ModelInfo, config: &CompileConfig) -> Result<Fragment> {
    let edge_coll = relation_edge_collection(model, relation)?;
    let existing_frag = lower_node(existing, ctx, model, config)?;
    let new_frag = lower_node(new, ctx, model, config)?;
    let mut bindings = existing_frag.bindings;
    bindings.extend(new_frag.bindings.clone());
    let edge_coll_frag = fragment::collection(&edge_coll)?;
    ctx.mark_write(edge_coll);
    Ok(Fragment {
        text: format!("UPSERT {} INSERT {1} UPDATE {1} IN {2}", existing_frag.text, new_frag.text, edge_coll_frag.text),
        bindings,
    })
}

fn lower_with_pre_execution(
    w: &ir::WithPreExecution,
    ctx: &Context,
    model: &dyn ModelInfo,
    config: &CompileConfig,
) -> Result<Fragment> {
    let mut cur_ctx = ctx.clone();
    for entry in &w.entries {
        if config.is_cancelled() {
            log::debug!("compilation cancelled before a pre-execution query");
            return Err(CompileError::Cancelled);
        }
        let pre_ctx = cur_ctx.new_pre_exec_context();
        let entry_frag = lower_top_level(&entry.query, &pre_ctx, model, config)?;
        log::debug!(
            "registered pre-execution query{}",
            entry.result_variable.as_ref().map(|v| format!(" bound to `{v}`")).unwrap_or_default()
        );
        cur_ctx = cur_ctx.after_pre_exec(entry_frag, entry.result_variable.as_ref(), entry.result_validator.clone());
    }
    lower_node(&w.result, &cur_ctx, model, config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::ir::{
        BinaryOp, BinaryOpNode, LanguageOp, Node, OperatorWithLanguage, Quantifier, QuantifierFilter,
        QuickSearch, TransformList, Variable,
    };
    use crate::model::{FieldInfo, ModelInfo, PrimarySortField, RelationInfo, RootEntityInfo};
    use serde_json::json;
    use std::collections::HashMap;

    struct FakeField {
        name: String,
        flex: bool,
        lang: Option<String>,
    }
    impl FieldInfo for FakeField {
        fn name(&self) -> &str {
            &self.name
        }
        fn is_system_field(&self) -> bool {
            self.name.starts_with('_')
        }
        fn is_flex_search_indexed(&self) -> bool {
            self.flex
        }
        fn analyzer_language(&self) -> Option<&str> {
            self.lang.as_deref()
        }
    }

    struct FakeRootEntity {
        collection: String,
        flex: bool,
        fields: HashMap<String, FakeField>,
    }
    impl RootEntityInfo for FakeRootEntity {
        fn collection_name(&self) -> &str {
            &self.collection
        }
        fn is_flex_search_indexed(&self) -> bool {
            self.flex
        }
        fn primary_sort(&self) -> &[PrimarySortField] {
            &[]
        }
        fn field(&self, name: &str) -> Option<&dyn FieldInfo> {
            self.fields.get(name).map(|f| f as &dyn FieldInfo)
        }
    }

    struct FakeRelation {
        edge_collection: String,
    }
    impl RelationInfo for FakeRelation {
        fn edge_collection_name(&self) -> &str {
            &self.edge_collection
        }
    }

    #[derive(Default)]
    struct FakeModel {
        entities: HashMap<String, FakeRootEntity>,
        relations: HashMap<String, FakeRelation>,
    }
    impl ModelInfo for FakeModel {
        fn root_entity(&self, type_name: &str) -> Option<&dyn RootEntityInfo> {
            self.entities.get(type_name).map(|e| e as &dyn RootEntityInfo)
        }
        fn relation(&self, relation_name: &str) -> Option<&dyn RelationInfo> {
            self.relations.get(relation_name).map(|r| r as &dyn RelationInfo)
        }
    }

    fn model_with_deliveries() -> FakeModel {
        let mut m = FakeModel::default();
        m.entities.insert(
            "deliveries".to_string(),
            FakeRootEntity { collection: "deliveries".to_string(), flex: false, fields: HashMap::new() },
        );
        m.entities.insert(
            "d".to_string(),
            FakeRootEntity { collection: "d".to_string(), flex: false, fields: HashMap::new() },
        );
        m
    }

    fn normalize(s: &str) -> String {
        s.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    #[test]
    fn s1_count_entities_lowers_to_length() {
        let model = model_with_deliveries();
        let ctx = Context::root(None);
        let config = CompileConfig::default();
        let root = Node::Count(Node::entities("deliveries").unwrap()).rc();
        let frag = lower_top_level(&root, &ctx, &model, &config).unwrap();
        assert_eq!(normalize(&frag.text), "RETURN LENGTH(deliveries)");
    }

    #[test]
    fn s2_transform_list_with_filter_and_limit() {
        let model = model_with_deliveries();
        let ctx = Context::root(None);
        let config = CompileConfig::default();
        let v = Variable::new("v");
        let filter = Node::BinaryOp(BinaryOpNode {
            op: BinaryOp::Equal,
            lhs: Node::field(Node::Variable(v.clone()).rc(), vec![], "deliveryNumber").unwrap(),
            rhs: Node::literal(json!("1000173")).unwrap(),
        })
        .rc();
        let root = Node::TransformList(TransformList {
            list: Node::entities("d").unwrap(),
            item_variable: v.clone(),
            filter: Some(filter),
            order_by: vec![],
            skip: Some(0),
            max_count: Some(10),
            inner: Node::Variable(v).rc(),
        })
        .rc();
        let frag = lower_top_level(&root, &ctx, &model, &config).unwrap();
        let text = normalize(&frag.text);
        assert!(text.contains("FOR v_0 IN d"), "{text}");
        assert!(text.contains("FILTER (v_0.deliveryNumber == @p0)"), "{text}");
        assert!(text.contains("LIMIT 10"), "{text}");
        assert!(text.ends_with("RETURN v_0)"), "{text}");
        assert_eq!(frag.bindings.get("p0").unwrap(), &json!("1000173"));
    }

    #[test]
    fn s3_quicksearch_phrase_uses_language_analyzer() {
        let mut model = model_with_deliveries();
        model.entities.insert(
            "T".to_string(),
            FakeRootEntity { collection: "t_coll".to_string(), flex: true, fields: HashMap::new() },
        );
        let ctx = Context::root(None);
        let config = CompileConfig::default();
        let v_inner = Variable::new("v2");
        let filter = Node::OperatorWithLanguage(OperatorWithLanguage {
            op: LanguageOp::QuickSearchContainsPhrase,
            lhs: Node::field(Node::Variable(v_inner.clone()).rc(), vec![], "description").unwrap(),
            rhs: Node::literal(json!("a phrase")).unwrap(),
            language: Some("DE".to_string()),
        })
        .rc();
        let search = Node::QuickSearch(QuickSearch {
            root_entity_type: "T".to_string(),
            item_variable: v_inner,
            filter,
        })
        .rc();
        let v_outer = Variable::new("v");
        let root = Node::TransformList(TransformList {
            list: search,
            item_variable: v_outer.clone(),
            filter: None,
            order_by: vec![],
            skip: None,
            max_count: None,
            inner: Node::Variable(v_outer).rc(),
        })
        .rc();
        let frag = lower_top_level(&root, &ctx, &model, &config).unwrap();
        let text = normalize(&frag.text);
        assert!(text.contains("FOR v2_0 IN flex_view_t_coll SEARCH"), "{text}");
        assert!(text.contains("ANALYZER(PHRASE(v2_0.description, @p0), text_de)"), "{text}");
    }

    #[test]
    fn s4_some_quantifier_uses_array_expansion() {
        let model = model_with_deliveries();
        let config = CompileConfig::default();
        let v = Variable::new("v");
        let (ctx, v_name) = Context::root(None).introduce_variable(&v).unwrap();
        let i = Variable::new("i");
        let q = QuantifierFilter {
            quantifier: Quantifier::Some,
            list: Node::field(Node::Variable(v).rc(), vec![], "items").unwrap(),
            item_variable: i.clone(),
            condition: Node::BinaryOp(BinaryOpNode {
                op: BinaryOp::Equal,
                lhs: Node::field(Node::Variable(i).rc(), vec![], "itemNumber").unwrap(),
                rhs: Node::literal(json!("abc")).unwrap(),
            })
            .rc(),
        };
        let frag = lower_node(&Node::QuantifierFilter(q).rc(), &ctx, &model, &config).unwrap();
        assert_eq!(frag.text, format!("@p0 IN {v_name}.items[*].itemNumber"));
        assert!(!frag.text.contains("FOR"));
    }

    #[test]
    fn s5_like_simple_prefix_is_fast_range_only() {
        let model = model_with_deliveries();
        let config = CompileConfig::default();
        let v = Variable::new("v");
        let (ctx, v_name) = Context::root(None).introduce_variable(&v).unwrap();
        let node = Node::BinaryOp(BinaryOpNode {
            op: BinaryOp::Like,
            lhs: Node::field(Node::Variable(v).rc(), vec![], "description").unwrap(),
            rhs: Node::literal(json!("prefix%")).unwrap(),
        })
        .rc();
        let frag = lower_node(&node, &ctx, &model, &config).unwrap();
        assert_eq!(
            frag.text,
            format!("({v_name}.description >= UPPER(@p0) && {v_name}.description < LOWER(@p1))")
        );
        assert!(!frag.text.contains("LIKE("));
        assert_eq!(frag.bindings.get("p0").unwrap(), &json!("prefix"));
        assert_eq!(frag.bindings.get("p1").unwrap(), &json!(format!("prefix\u{10FFFF}")));
    }

    #[test]
    fn s6_create_entity_pre_exec_then_reference_result() {
        let model = model_with_deliveries();
        let config = CompileConfig::default();
        let ctx = Context::root(None);
        let k = Variable::new("k");
        let mut object = indexmap::IndexMap::new();
        object.insert("name".to_string(), Node::literal(json!("acme")).unwrap());
        let create = Node::CreateEntity { type_name: "d".to_string(), object: Node::Object(object).rc() }.rc();
        let root = Node::WithPreExecution(ir::WithPreExecution {
            entries: vec![ir::PreExecEntry { query: create, result_variable: Some(k.clone()), result_validator: None }],
            result: Node::Variable(k).rc(),
        })
        .rc();

        let main = lower_top_level(&root, &ctx, &model, &config).unwrap();
        assert!(main.text.starts_with("RETURN "), "{}", main.text);
        assert!(!main.text.contains("INSERT"), "{}", main.text);

        let pre_exec = ctx.take_pre_exec();
        assert_eq!(pre_exec.len(), 1);
        assert!(pre_exec[0].fragment.text.contains("INSERT"));
        assert!(pre_exec[0].fragment.text.contains("IN d"));
        assert!(pre_exec[0].fragment.text.contains("RETURN NEW._key"));

        assert!(!ctx.read_collections().contains("d"));
        assert!(ctx.write_collections().contains("d"));
    }

    #[test]
    fn like_mixed_pattern_conjoins_fast_range_and_slow_check() {
        let model = model_with_deliveries();
        let config = CompileConfig::default();
        let v = Variable::new("v");
        let (ctx, v_name) = Context::root(None).introduce_variable(&v).unwrap();
        let node = Node::BinaryOp(BinaryOpNode {
            op: BinaryOp::Like,
            lhs: Node::field(Node::Variable(v).rc(), vec![], "description").unwrap(),
            rhs: Node::literal(json!("a%b")).unwrap(),
        })
        .rc();
        let frag = lower_node(&node, &ctx, &model, &config).unwrap();
        assert!(frag.text.contains("UPPER(@p0)"));
        // fast_starts_with binds the prefix lo/hi (@p0, @p1) before rhs is lowered, so the full
        // pattern used by the slow LIKE(...) check lands on @p2.
        assert!(frag.text.contains(&format!("LIKE({v_name}.description, @p2, true)")));
    }

    #[test]
    fn every_reduces_to_none_with_negated_condition() {
        let model = model_with_deliveries();
        let config = CompileConfig::default();
        let v = Variable::new("v");
        let (ctx, _v_name) = Context::root(None).introduce_variable(&v).unwrap();
        let i = Variable::new("i");
        let q = QuantifierFilter {
            quantifier: Quantifier::Every,
            list: Node::field(Node::Variable(v).rc(), vec![], "items").unwrap(),
            item_variable: i.clone(),
            condition: Node::BinaryOp(BinaryOpNode {
                op: BinaryOp::GreaterThan,
                lhs: Node::field(Node::Variable(i).rc(), vec![], "qty").unwrap(),
                rhs: Node::ConstInt(0).rc(),
            })
            .rc(),
        };
        let frag = lower_node(&Node::QuantifierFilter(q).rc(), &ctx, &model, &config).unwrap();
        assert!(frag.text.contains("!("), "{}", frag.text);
        assert!(frag.text.ends_with("== 0)"), "{}", frag.text);
    }

    #[test]
    fn limit_matrix() {
        let model = model_with_deliveries();
        let config = CompileConfig::default();
        let cases: &[(Option<u64>, Option<u64>, &str)] = &[
            (Some(0), Some(5), "LIMIT 5"),
            (Some(3), Some(5), "LIMIT 3, 5"),
            (Some(3), None, "LIMIT 3,"),
            (None, None, ""),
        ];
        for (skip, max_count, expect) in cases {
            let ctx = Context::root(None);
            let v = Variable::new("v");
            let root = Node::TransformList(TransformList {
                list: Node::entities("d").unwrap(),
                item_variable: v.clone(),
                filter: None,
                order_by: vec![],
                skip: *skip,
                max_count: *max_count,
                inner: Node::Variable(v).rc(),
            })
            .rc();
            let frag = lower_node(&root, &ctx, &model, &config).unwrap();
            if expect.is_empty() {
                assert!(!frag.text.contains("LIMIT"), "{}", frag.text);
            } else {
                assert!(frag.text.contains(expect), "{} missing in {}", expect, frag.text);
            }
        }
    }

    #[test]
    fn empty_object_and_list() {
        let model = model_with_deliveries();
        let ctx = Context::root(None);
        let config = CompileConfig::default();
        let obj = lower_node(&Node::Object(indexmap::IndexMap::new()).rc(), &ctx, &model, &config).unwrap();
        assert_eq!(obj.text, "{}");
        let list = lower_node(&Node::List(vec![]).rc(), &ctx, &model, &config).unwrap();
        assert_eq!(list.text, "[]");
    }

    #[test]
    fn unsafe_field_segment_is_bound_not_inlined() {
        let model = model_with_deliveries();
        let config = CompileConfig::default();
        let v = Variable::new("v");
        let (ctx, _v_name) = Context::root(None).introduce_variable(&v).unwrap();
        let node = Node::field(Node::Variable(v).rc(), vec![], "weird-key").unwrap();
        let frag = lower_node(&node, &ctx, &model, &config).unwrap();
        assert!(!frag.text.contains("weird-key"));
        assert!(frag.bindings.values().any(|val| val == &json!("weird-key")));
    }
}
