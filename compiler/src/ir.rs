//! The query intermediate representation: a closed sum type of immutable nodes.
//!
//! Mirrors the reference crate's `datastore::query` module in shape (a `Query`/`InputExpr`/
//! `OutputExpr` triad there becomes one recursive `Node` enum here), describing a document-store
//! query tree rather than the reference's SQL-shaped IR.
//!
//! Every node is immutable after construction and owned via `Rc` so the same sub-expression can
//! be shared across positions in a tree without deep copies. Compilation of one query runs on a
//! single thread, so `Rc` rather than `Arc` is the right sharing primitive here.

use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexMap;
use serde_json::Value as JsonValue;

use crate::error::{CompileError, Result};

pub type NodeRef = Rc<Node>;

/// A unique, never-reused identity for a [`Variable`], allocated from a process-wide counter.
///
/// The label is for diagnostics only; two `Variable`s with the same label are always distinct,
/// because equality and hashing are defined over `id` alone.
static NEXT_VARIABLE_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
pub struct Variable {
    id: u64,
    label: String,
}

impl Variable {
    pub fn new(label: impl Into<String>) -> Self {
        let id = NEXT_VARIABLE_ID.fetch_add(1, Ordering::Relaxed);
        Variable {
            id,
            label: label.into(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl PartialEq for Variable {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for Variable {}

impl std::hash::Hash for Variable {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.label, self.id)
    }
}

/// A callback the execution layer runs against a pre-execution query's result.
///
/// The compiler only threads this through; it is never invoked here.
pub trait PreExecValidator: fmt::Debug {
    fn validate(&self, result: &JsonValue) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    And,
    Or,
    Equal,
    Unequal,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    In,
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Contains,
    StartsWith,
    EndsWith,
    Like,
    Append,
    Prepend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    JsonStringify,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LanguageOp {
    QuickSearchStartsWith,
    QuickSearchContainsAnyWord,
    QuickSearchContainsPrefix,
    QuickSearchContainsPhrase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BasicType {
    Scalar,
    List,
    Object,
    Null,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quantifier {
    Some,
    Every,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeDirection {
    Outbound,
    Inbound,
}

/// A reference to one side of a named relation, used by [`Node::FollowEdge`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationSide {
    pub relation: String,
    pub direction: EdgeDirection,
}

#[derive(Debug, Clone)]
pub struct FieldAccess {
    pub object: NodeRef,
    /// Intermediate path segments between `object` and `field`, e.g. for
    /// `author.address.city` accessed off `object`, `path = ["address"]`, `field = "city"`.
    pub path: Vec<String>,
    pub field: String,
}

#[derive(Debug, Clone)]
pub struct OrderClause {
    pub expr: NodeRef,
    pub descending: bool,
}

#[derive(Debug, Clone)]
pub struct TransformList {
    pub list: NodeRef,
    pub item_variable: Variable,
    pub filter: Option<NodeRef>,
    pub order_by: Vec<OrderClause>,
    pub skip: Option<u64>,
    pub max_count: Option<u64>,
    pub inner: NodeRef,
}

#[derive(Debug, Clone)]
pub struct BinaryOpNode {
    pub op: BinaryOp,
    pub lhs: NodeRef,
    pub rhs: NodeRef,
}

#[derive(Debug, Clone)]
pub struct UnaryOpNode {
    pub op: UnaryOp,
    pub value: NodeRef,
}

#[derive(Debug, Clone)]
pub struct OperatorWithLanguage {
    pub op: LanguageOp,
    pub lhs: NodeRef,
    pub rhs: NodeRef,
    pub language: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PreExecEntry {
    pub query: NodeRef,
    pub result_variable: Option<Variable>,
    pub result_validator: Option<Rc<dyn PreExecValidator>>,
}

#[derive(Debug, Clone)]
pub struct WithPreExecution {
    pub entries: Vec<PreExecEntry>,
    pub result: NodeRef,
}

#[derive(Debug, Clone)]
pub struct VariableAssignment {
    pub variable: Variable,
    pub value: NodeRef,
    pub result: NodeRef,
}

#[derive(Debug, Clone)]
pub struct UpdateEntities {
    pub type_name: String,
    pub list: NodeRef,
    pub current_variable: Variable,
    /// `(field name, new value)` pairs, applied in order (later duplicates win).
    pub updates: Vec<(String, NodeRef)>,
}

#[derive(Debug, Clone)]
pub struct EdgeLiteral {
    pub from: NodeRef,
    pub to: NodeRef,
}

#[derive(Debug, Clone)]
pub struct QuantifierFilter {
    pub quantifier: Quantifier,
    pub list: NodeRef,
    pub item_variable: Variable,
    pub condition: NodeRef,
}

#[derive(Debug, Clone)]
pub struct QuickSearch {
    pub root_entity_type: String,
    pub item_variable: Variable,
    pub filter: NodeRef,
}

/// The closed node family. See the module doc for the ownership and identity rules.
#[derive(Debug, Clone)]
pub enum Node {
    Literal(JsonValue),
    ConstBool(bool),
    ConstInt(i64),
    Null,
    RuntimeError(String),

    Object(IndexMap<String, NodeRef>),
    List(Vec<NodeRef>),
    MergeObjects(Vec<NodeRef>),
    ConcatLists(Vec<NodeRef>),
    FirstOfList(NodeRef),
    SafeList(NodeRef),

    Variable(Variable),
    VariableAssignment(VariableAssignment),
    WithPreExecution(WithPreExecution),

    Field(FieldAccess),
    RootEntityID(NodeRef),
    EntityFromID { root_entity_type: String, id: NodeRef },
    Entities(String),
    FollowEdge { side: RelationSide, source: NodeRef },

    TransformList(TransformList),
    Count(NodeRef),

    BinaryOp(BinaryOpNode),
    UnaryOp(UnaryOpNode),
    Conditional { cond: NodeRef, then_branch: NodeRef, else_branch: NodeRef },
    TypeCheck { value: NodeRef, basic_type: BasicType },
    OperatorWithLanguage(OperatorWithLanguage),

    CreateEntity { type_name: String, object: NodeRef },
    UpdateEntities(UpdateEntities),
    DeleteEntities { type_name: String, list: NodeRef },
    AddEdges { relation: String, edges: Vec<EdgeLiteral> },
    RemoveEdges { relation: String, edge_filter: NodeRef },
    SetEdge { relation: String, existing: NodeRef, new: NodeRef },

    QuantifierFilter(QuantifierFilter),
    QuickSearch(QuickSearch),
}

/// Discriminant of [`Node`], used for diagnostics (`CompileError::UnknownNode`) without cloning
/// the whole subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Literal,
    ConstBool,
    ConstInt,
    Null,
    RuntimeError,
    Object,
    List,
    MergeObjects,
    ConcatLists,
    FirstOfList,
    SafeList,
    Variable,
    VariableAssignment,
    WithPreExecution,
    Field,
    RootEntityID,
    EntityFromID,
    Entities,
    FollowEdge,
    TransformList,
    Count,
    BinaryOp,
    UnaryOp,
    Conditional,
    TypeCheck,
    OperatorWithLanguage,
    CreateEntity,
    UpdateEntities,
    DeleteEntities,
    AddEdges,
    RemoveEdges,
    SetEdge,
    QuantifierFilter,
    QuickSearch,
}

impl Node {
    pub fn kind(&self) -> NodeKind {
        match self {
            Node::Literal(_) => NodeKind::Literal,
            Node::ConstBool(_) => NodeKind::ConstBool,
            Node::ConstInt(_) => NodeKind::ConstInt,
            Node::Null => NodeKind::Null,
            Node::RuntimeError(_) => NodeKind::RuntimeError,
            Node::Object(_) => NodeKind::Object,
            Node::List(_) => NodeKind::List,
            Node::MergeObjects(_) => NodeKind::MergeObjects,
            Node::ConcatLists(_) => NodeKind::ConcatLists,
            Node::FirstOfList(_) => NodeKind::FirstOfList,
            Node::SafeList(_) => NodeKind::SafeList,
            Node::Variable(_) => NodeKind::Variable,
            Node::VariableAssignment(_) => NodeKind::VariableAssignment,
            Node::WithPreExecution(_) => NodeKind::WithPreExecution,
            Node::Field(_) => NodeKind::Field,
            Node::RootEntityID(_) => NodeKind::RootEntityID,
            Node::EntityFromID { .. } => NodeKind::EntityFromID,
            Node::Entities(_) => NodeKind::Entities,
            Node::FollowEdge { .. } => NodeKind::FollowEdge,
            Node::TransformList(_) => NodeKind::TransformList,
            Node::Count(_) => NodeKind::Count,
            Node::BinaryOp(_) => NodeKind::BinaryOp,
            Node::UnaryOp(_) => NodeKind::UnaryOp,
            Node::Conditional { .. } => NodeKind::Conditional,
            Node::TypeCheck { .. } => NodeKind::TypeCheck,
            Node::OperatorWithLanguage(_) => NodeKind::OperatorWithLanguage,
            Node::CreateEntity { .. } => NodeKind::CreateEntity,
            Node::UpdateEntities(_) => NodeKind::UpdateEntities,
            Node::DeleteEntities { .. } => NodeKind::DeleteEntities,
            Node::AddEdges { .. } => NodeKind::AddEdges,
            Node::RemoveEdges { .. } => NodeKind::RemoveEdges,
            Node::SetEdge { .. } => NodeKind::SetEdge,
            Node::QuantifierFilter(_) => NodeKind::QuantifierFilter,
            Node::QuickSearch(_) => NodeKind::QuickSearch,
        }
    }

    pub fn rc(self) -> NodeRef {
        Rc::new(self)
    }
}

/// Validating constructors. Invariants already enforced by the Rust type system (non-negative
/// `skip`/`maxCount`, fixed arity of operator nodes) need no runtime check here; the ones below
/// are the invariants Rust's types cannot express for us.
impl Node {
    pub fn literal(value: JsonValue) -> Result<NodeRef> {
        if value.is_object() {
            return Err(CompileError::malformed(
                "Literal nodes may only hold JSON scalars or arrays, not objects",
            ));
        }
        Ok(Node::Literal(value).rc())
    }

    pub fn runtime_error(message: impl Into<String>) -> Result<NodeRef> {
        let message = message.into();
        if message.is_empty() {
            return Err(CompileError::malformed("RuntimeError message must not be empty"));
        }
        Ok(Node::RuntimeError(message).rc())
    }

    pub fn entities(root_entity_type: impl Into<String>) -> Result<NodeRef> {
        let name = root_entity_type.into();
        if name.is_empty() {
            return Err(CompileError::malformed("Entities root entity type must not be empty"));
        }
        Ok(Node::Entities(name).rc())
    }

    pub fn field(object: NodeRef, path: Vec<String>, field: impl Into<String>) -> Result<NodeRef> {
        let field = field.into();
        if field.is_empty() {
            return Err(CompileError::malformed("Field access must name a non-empty field"));
        }
        Ok(Node::Field(FieldAccess { object, path, field }).rc())
    }

    pub fn transform_list(spec: TransformList) -> Result<NodeRef> {
        Ok(Node::TransformList(spec).rc())
    }

    pub fn quantifier_filter(spec: QuantifierFilter) -> Result<NodeRef> {
        Ok(Node::QuantifierFilter(spec).rc())
    }
}

/// Visits the immediate `NodeRef` children of `node` in declared order, replacing each with
/// `f(child)`, and rebuilds the node around the results.
///
/// This is the substitution primitive the rewrite layer (`crate::rewrite`) builds on: hoisting and
/// boolean simplification are both expressed as repeated applications of `map_children` plus a
/// node-local rule.
pub fn map_children(node: &Node, f: &mut impl FnMut(&NodeRef) -> NodeRef) -> Node {
    match node {
        Node::Literal(v) => Node::Literal(v.clone()),
        Node::ConstBool(b) => Node::ConstBool(*b),
        Node::ConstInt(i) => Node::ConstInt(*i),
        Node::Null => Node::Null,
        Node::RuntimeError(m) => Node::RuntimeError(m.clone()),

        Node::Object(fields) => {
            Node::Object(fields.iter().map(|(k, v)| (k.clone(), f(v))).collect())
        }
        Node::List(items) => Node::List(items.iter().map(f).collect()),
        Node::MergeObjects(items) => Node::MergeObjects(items.iter().map(f).collect()),
        Node::ConcatLists(items) => Node::ConcatLists(items.iter().map(f).collect()),
        Node::FirstOfList(inner) => Node::FirstOfList(f(inner)),
        Node::SafeList(inner) => Node::SafeList(f(inner)),

        Node::Variable(v) => Node::Variable(v.clone()),
        Node::VariableAssignment(a) => Node::VariableAssignment(VariableAssignment {
            variable: a.variable.clone(),
            value: f(&a.value),
            result: f(&a.result),
        }),
        Node::WithPreExecution(w) => Node::WithPreExecution(WithPreExecution {
            entries: w
                .entries
                .iter()
                .map(|e| PreExecEntry {
                    query: f(&e.query),
                    result_variable: e.result_variable.clone(),
                    result_validator: e.result_validator.clone(),
                })
                .collect(),
            result: f(&w.result),
        }),

        Node::Field(fa) => Node::Field(FieldAccess {
            object: f(&fa.object),
            path: fa.path.clone(),
            field: fa.field.clone(),
        }),
        Node::RootEntityID(obj) => Node::RootEntityID(f(obj)),
        Node::EntityFromID { root_entity_type, id } => Node::EntityFromID {
            root_entity_type: root_entity_type.clone(),
            id: f(id),
        },
        Node::Entities(name) => Node::Entities(name.clone()),
        Node::FollowEdge { side, source } => Node::FollowEdge {
            side: side.clone(),
            source: f(source),
        },

        Node::TransformList(t) => Node::TransformList(TransformList {
            list: f(&t.list),
            item_variable: t.item_variable.clone(),
            filter: t.filter.as_ref().map(f),
            order_by: t
                .order_by
                .iter()
                .map(|o| OrderClause { expr: f(&o.expr), descending: o.descending })
                .collect(),
            skip: t.skip,
            max_count: t.max_count,
            inner: f(&t.inner),
        }),
        Node::Count(inner) => Node::Count(f(inner)),

        Node::BinaryOp(b) => Node::BinaryOp(BinaryOpNode { op: b.op, lhs: f(&b.lhs), rhs: f(&b.rhs) }),
        Node::UnaryOp(u) => Node::UnaryOp(UnaryOpNode { op: u.op, value: f(&u.value) }),
        Node::Conditional { cond, then_branch, else_branch } => Node::Conditional {
            cond: f(cond),
            then_branch: f(then_branch),
            else_branch: f(else_branch),
        },
        Node::TypeCheck { value, basic_type } => Node::TypeCheck { value: f(value), basic_type: *basic_type },
        Node::OperatorWithLanguage(o) => Node::OperatorWithLanguage(OperatorWithLanguage {
            op: o.op,
            lhs: f(&o.lhs),
            rhs: f(&o.rhs),
            language: o.language.clone(),
        }),

        Node::CreateEntity { type_name, object } => Node::CreateEntity {
            type_name: type_name.clone(),
            object: f(object),
        },
        Node::UpdateEntities(u) => Node::UpdateEntities(UpdateEntities {
            type_name: u.type_name.clone(),
            list: f(&u.list),
            current_variable: u.current_variable.clone(),
            updates: u.updates.iter().map(|(name, v)| (name.clone(), f(v))).collect(),
        }),
        Node::DeleteEntities { type_name, list } => Node::DeleteEntities {
            type_name: type_name.clone(),
            list: f(list),
        },
        Node::AddEdges { relation, edges } => Node::AddEdges {
            relation: relation.clone(),
            edges: edges
                .iter()
                .map(|e| EdgeLiteral { from: f(&e.from), to: f(&e.to) })
                .collect(),
        },
        Node::RemoveEdges { relation, edge_filter } => Node::RemoveEdges {
            relation: relation.clone(),
            edge_filter: f(edge_filter),
        },
        Node::SetEdge { relation, existing, new } => Node::SetEdge {
            relation: relation.clone(),
            existing: f(existing),
            new: f(new),
        },

        Node::QuantifierFilter(q) => Node::QuantifierFilter(QuantifierFilter {
            quantifier: q.quantifier,
            list: f(&q.list),
            item_variable: q.item_variable.clone(),
            condition: f(&q.condition),
        }),
        Node::QuickSearch(q) => Node::QuickSearch(QuickSearch {
            root_entity_type: q.root_entity_type.clone(),
            item_variable: q.item_variable.clone(),
            filter: f(&q.filter),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variable_identity_ignores_label() {
        let a = Variable::new("x");
        let b = Variable::new("x");
        assert_ne!(a, b, "two variables with the same label must still be distinct");
    }

    #[test]
    fn literal_rejects_json_objects() {
        let err = Node::literal(serde_json::json!({"a": 1})).unwrap_err();
        assert!(matches!(err, CompileError::MalformedIR(_)));
    }

    #[test]
    fn literal_allows_scalars_and_arrays() {
        assert!(Node::literal(serde_json::json!(42)).is_ok());
        assert!(Node::literal(serde_json::json!([1, 2, 3])).is_ok());
        assert!(Node::literal(serde_json::json!("hi")).is_ok());
    }

    #[test]
    fn map_children_rebuilds_binary_op() {
        let lhs = Node::ConstInt(1).rc();
        let rhs = Node::ConstInt(2).rc();
        let node = Node::BinaryOp(BinaryOpNode { op: BinaryOp::Add, lhs, rhs });
        let rebuilt = map_children(&node, &mut |child| match &**child {
            Node::ConstInt(i) => Node::ConstInt(i + 10).rc(),
            _ => child.clone(),
        });
        match rebuilt {
            Node::BinaryOp(b) => {
                assert!(matches!(&*b.lhs, Node::ConstInt(11)));
                assert!(matches!(&*b.rhs, Node::ConstInt(12)));
            }
            _ => panic!("expected BinaryOp"),
        }
    }
}
