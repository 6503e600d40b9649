//! Compile-time error taxonomy.
//!
//! One closed enum, in the style of the reference crate's `TypeSystemError`: every fallible
//! operation in this crate returns `Result<_, CompileError>`, never a bare `anyhow::Error`.

use std::fmt;

use crate::ir::NodeKind;

/// Every way compilation of a well-typed IR tree can still fail.
///
/// None of these are retried by this crate; they are all considered bugs in the caller (the
/// IR was constructed inconsistently) or in the model metadata the caller supplied.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum CompileError {
    #[error("no lowering handler registered for node kind `{0:?}`")]
    UnknownNode(NodeKind),

    #[error("variable `{label}` (#{id}) was used but never introduced in this scope")]
    UnboundVariable { label: String, id: u64 },

    #[error("variable `{label}` (#{id}) was introduced twice in the same scope")]
    DoubleIntroduction { label: String, id: u64 },

    #[error("operator `{operator}` has no lowering rule for this node")]
    UnsupportedOperator { operator: String },

    #[error("`{0}` is not a valid identifier: must match [A-Za-z_][A-Za-z0-9_]*")]
    InvalidIdentifier(String),

    #[error("malformed IR: {0}")]
    MalformedIR(String),

    #[error("compilation was cancelled")]
    Cancelled,
}

impl CompileError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        CompileError::MalformedIR(msg.into())
    }

    pub fn unsupported_operator(operator: impl fmt::Display) -> Self {
        CompileError::UnsupportedOperator {
            operator: operator.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CompileError>;
