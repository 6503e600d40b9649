//! Narrow interfaces this crate consumes from the model-builder collaborator.
//!
//! The model builder that turns schema documents (root entities, child entities, value objects,
//! entity extensions, enums, relations, references, indices, permissions, i18n, TTL) into a model
//! graph lives outside this crate. What the compiler needs from that graph is small and stable, so
//! it is expressed as a trait (`ModelInfo`) rather than depending on the model builder's own types
//! — the same seam the reference crate draws between `TypeSystem` (owns the full graph) and the
//! handful of `Entity`/`Field` accessors `QueryPlan` actually calls.

use std::fmt;

/// Everything the compiler needs to know about a root entity type.
pub trait RootEntityInfo {
    /// Name of the backing collection, e.g. `"deliveries"`.
    fn collection_name(&self) -> &str;
    /// Whether a `flex_view_<collection>` search view exists for this entity.
    fn is_flex_search_indexed(&self) -> bool;
    /// Primary sort clauses stored in the search view, in priority order.
    fn primary_sort(&self) -> &[PrimarySortField];
    /// Field metadata, keyed by field name.
    fn field(&self, name: &str) -> Option<&dyn FieldInfo>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimarySortField {
    pub field_name: String,
    pub descending: bool,
}

/// Everything the compiler needs to know about one field of a root entity.
pub trait FieldInfo {
    fn name(&self) -> &str;
    /// System fields (`_key`, `_id`, `_rev`) are never user-editable through mutation nodes.
    fn is_system_field(&self) -> bool;
    fn is_flex_search_indexed(&self) -> bool;
    /// ISO language tag used to pick the `text_<lang>` analyzer, when this field is indexed for
    /// full text. `None` means the field uses the `identity` analyzer.
    fn analyzer_language(&self) -> Option<&str>;
}

/// Everything the compiler needs to know about a relation (an edge collection between two root
/// entity types).
pub trait RelationInfo {
    fn edge_collection_name(&self) -> &str;
}

/// The collaborator-supplied view of the model graph, scoped to exactly what the lowering pass
/// calls. A test double implementing this trait (see `tests/support/fake_model.rs`) is enough to
/// exercise the compiler without a real schema parser.
pub trait ModelInfo {
    fn root_entity(&self, type_name: &str) -> Option<&dyn RootEntityInfo>;
    fn relation(&self, relation_name: &str) -> Option<&dyn RelationInfo>;
}

/// Search view name for a root entity's backing collection.
pub fn flex_view_name(collection_name: &str) -> String {
    format!("flex_view_{collection_name}")
}

/// Analyzer name for a language tag, or `"identity"` for exact-match fields.
pub fn analyzer_name(language: Option<&str>) -> String {
    match language {
        Some(lang) => format!("text_{}", lang.to_lowercase()),
        None => "identity".to_string(),
    }
}

/// A claim the permission evaluator attaches to a field write, threaded through but never
/// interpreted by this crate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizedClaim {
    pub field_name: String,
    pub claim: String,
}

/// Permission seam consulted while lowering mutation nodes. The compiler does not implement
/// permission evaluation; it only asks whether a given field write is authorized and, if not,
/// emits a `RuntimeError` node in its place rather than writing silently.
pub trait PermissionProfile: fmt::Debug {
    fn authorize_field_write(&self, type_name: &str, field_name: &str) -> Option<AuthorizedClaim>;
}

/// Mirrors the upstream TTL-info query output, including its long-standing key duplication: the
/// `path` key is emitted for both the date field and `expire_after_days`. Reproduced deliberately
/// rather than fixed, since no consumer has ever been confirmed to rely on the second value being
/// distinguishable from the first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtlInfo {
    pub date_field_path: String,
    pub expire_after_days: u32,
}

impl TtlInfo {
    /// Renders the (intentionally duplicated) wire representation.
    pub fn to_wire_pairs(&self) -> Vec<(&'static str, String)> {
        vec![
            ("path", self.date_field_path.clone()),
            ("path", self.expire_after_days.to_string()),
        ]
    }
}
