//! Pure IR-to-IR rewrites applied before lowering: assignment hoisting and boolean constant
//! folding. Neither rewrite touches a `Context` or produces a `Fragment` — both operate entirely
//! on [`ir::Node`] trees, so they are trivial to unit test in isolation from the lowering pass
//! that consumes their output.

use crate::ir::{self, BinaryOp, BinaryOpNode, Node, NodeRef, UnaryOp, UnaryOpNode, VariableAssignment};

/// Walks from `node` through a chain of direct [`Node::VariableAssignment`] wrappers, collecting
/// each one (in encounter order) and returning the first non-assignment node reached.
///
/// This is what lets the lowering pass turn
/// `VariableAssignment(v, value, VariableAssignment(w, value2, result))` into two `LET` lines
/// followed by `result`, instead of nesting two `FIRST(LET v = … RETURN …)` subqueries.
pub fn extract_variable_assignments(node: &NodeRef) -> (NodeRef, Vec<VariableAssignment>) {
    let mut assignments = Vec::new();
    let mut current = node.clone();
    loop {
        let next = match &*current {
            Node::VariableAssignment(a) => {
                assignments.push(a.clone());
                a.result.clone()
            }
            _ => break,
        };
        current = next;
    }
    (current, assignments)
}

/// Bottom-up constant folding over `AND`/`OR`/`NOT` with `ConstBool` operands, e.g.
/// `AND(ConstBool(true), x)` folds to `x`, `OR(ConstBool(true), x)` folds to `ConstBool(true)`.
/// Leaves everything else untouched.
pub fn simplify_booleans(node: &NodeRef) -> NodeRef {
    let rebuilt = ir::map_children(node, &mut simplify_booleans);
    match rebuilt {
        Node::BinaryOp(BinaryOpNode { op: BinaryOp::And, lhs, rhs }) => match (&*lhs, &*rhs) {
            (Node::ConstBool(false), _) | (_, Node::ConstBool(false)) => Node::ConstBool(false).rc(),
            (Node::ConstBool(true), _) => rhs,
            (_, Node::ConstBool(true)) => lhs,
            _ => Node::BinaryOp(BinaryOpNode { op: BinaryOp::And, lhs, rhs }).rc(),
        },
        Node::BinaryOp(BinaryOpNode { op: BinaryOp::Or, lhs, rhs }) => match (&*lhs, &*rhs) {
            (Node::ConstBool(true), _) | (_, Node::ConstBool(true)) => Node::ConstBool(true).rc(),
            (Node::ConstBool(false), _) => rhs,
            (_, Node::ConstBool(false)) => lhs,
            _ => Node::BinaryOp(BinaryOpNode { op: BinaryOp::Or, lhs, rhs }).rc(),
        },
        Node::UnaryOp(UnaryOpNode { op: UnaryOp::Not, value }) => match &*value {
            Node::ConstBool(b) => Node::ConstBool(!b).rc(),
            _ => Node::UnaryOp(UnaryOpNode { op: UnaryOp::Not, value }).rc(),
        },
        other => other.rc(),
    }
}

/// `true` iff `node` simplifies to the literal boolean `true` — the signal the `TransformList`
/// lowering uses to omit a `FILTER` clause entirely.
pub fn simplifies_to_true(node: &NodeRef) -> bool {
    matches!(&*simplify_booleans(node), Node::ConstBool(true))
}
