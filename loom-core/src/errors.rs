//! Error taxonomy for the execution core.
//!
//! `RuntimeError` is an environment/resolution failure; `TypeError` is an
//! authoring/logic failure. Both are fatal to the current activation and
//! propagate to the immediate caller. `ExpandError` is raised only by the
//! overlay expander under strict flags. Invocation failures never surface
//! as errors at all — they are absorbed into a `CallEnvelope`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("undefined identifier: '{0}'")]
    UndefinedIdentifier(String),

    #[error("stack underflow: expected at least {expected} values, found {found}")]
    StackUnderflow { expected: usize, found: usize },

    #[error("jump target {target} out of bounds (program length {len})")]
    BadJump { target: usize, len: usize },

    #[error("malformed statement: {0}")]
    MalformedStatement(String),

    #[error("range bound must be an integer, found {found}")]
    BadRangeBound { found: &'static str },

    #[error("repeat requires a list or range iterable, found {found}")]
    NotIterable { found: &'static str },

    #[error("call to '{module}' denied by capability policy")]
    CallDenied { module: String },

    #[error("network fetch disallowed under capability enforcement: {reason}")]
    FetchDenied { reason: String },

    #[error("unknown iterator cursor {0}")]
    UnknownCursor(u32),

    #[error("unsupported verb: {0}")]
    UnsupportedVerb(String),

    #[error("unknown call op: '{0}'")]
    UnknownCallOp(String),
}

#[derive(Debug, Error)]
pub enum TypeError {
    #[error("boolean '{op}' requires boolean operands, found {found}")]
    BooleanOperand { op: String, found: &'static str },

    #[error("unary '{op}' requires a number, found {found}")]
    UnaryOperand { op: String, found: &'static str },

    #[error("'{op}' requires numbers or two text values, found {left} and {right}")]
    Arithmetic {
        op: String,
        left: &'static str,
        right: &'static str,
    },

    #[error("'{op}' cannot compare {left} with {right}")]
    Comparison {
        op: String,
        left: &'static str,
        right: &'static str,
    },

    #[error("division by zero")]
    DivisionByZero,

    #[error("unsupported operator: '{op}'")]
    UnsupportedOperator { op: String },
}

#[derive(Debug, Error)]
pub enum ExpandError {
    #[error("unknown verb (no overlay mapping): {0}")]
    UnknownVerb(String),

    #[error("capabilities required by '{verb}' not granted: {}", missing.join(", "))]
    Capability { verb: String, missing: Vec<String> },

    #[error("overlay mapped '{raw}' to non-canonical verb: {mapped}")]
    NonCanonicalTarget { raw: String, mapped: String },

    #[error("invalid pipeline stage in overlay for '{0}'")]
    BadPipelineStage(String),

    #[error("missing required core overlay pack at {0}")]
    MissingCorePack(String),

    #[error("overlay pack '{name}' not found at {path}")]
    PackNotFound { name: String, path: String },

    #[error("overlay pack '{name}' is malformed: {reason}")]
    BadPack { name: String, reason: String },
}

/// Umbrella error for everything the core can fail with.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Type(#[from] TypeError),

    #[error(transparent)]
    Expand(#[from] ExpandError),

    #[error("program is malformed: {0}")]
    BadProgram(String),
}
