//! Typed error model for action compilation.
//!
//! Two failure families, both fatal to the action being compiled:
//!
//! - [`SecurityError`] — an expression tripped the injection defences
//!   (denylist hit, suspicious characters, or something outside the
//!   operator/function/identifier allow-lists).
//! - [`CompileError`] — a structurally invalid step or reference, or an
//!   unrecognized step kind. Wraps `SecurityError` so every compilation
//!   entry point returns a single error type.
//!
//! There is no recoverable path: a failure never produces partial SQL.

use thiserror::Error;

/// Raised when an expression fails one of the injection defences.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SecurityError {
    /// One of the fixed denylist regexes matched before parsing.
    #[error("Potentially dangerous SQL pattern detected: {pattern}")]
    DangerousPattern { pattern: String },

    /// Backslash or a control character (NUL, CR, LF) in the raw input.
    #[error("Expression contains suspicious characters")]
    SuspiciousCharacters,

    #[error("Operator '{operator}' not allowed")]
    OperatorNotAllowed { operator: String },

    #[error("Function '{name}' not allowed")]
    FunctionNotAllowed { name: String },

    /// Identifier is neither an entity field nor an allowed context variable.
    #[error("Unknown field or variable: '{name}'")]
    UnknownIdentifier { name: String },
}

/// Top-level compilation error. Fatal to the whole action.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error(transparent)]
    Security(#[from] SecurityError),

    /// Step kinds are a closed set; anything else aborts compilation.
    #[error("no compiler for step type {kind}")]
    UnknownStepKind { kind: String },

    /// Reference expressions must match `ref(<Entity>).<field>` exactly.
    #[error("Invalid reference syntax: '{reference}' (expected ref(Entity).field)")]
    InvalidReference { reference: String },

    /// Foreach expressions must match `<iterator> in <collection>`.
    #[error("Invalid foreach expression: '{expression}' (expected '<var> in <collection>')")]
    InvalidForeach { expression: String },

    /// A step referenced an entity the compilation context does not know.
    #[error("Unknown entity '{name}' referenced by {step} step")]
    UnknownEntity { name: String, step: &'static str },

    /// A row-scoped step ran before any lookup bound a row of its entity.
    #[error("no resolved row variable for entity '{entity}'")]
    UnresolvedRow { entity: String },

    /// A step variant is missing a field its compiler requires.
    #[error("{step} step is missing required field '{field}'")]
    MissingStepField {
        step: &'static str,
        field: &'static str,
    },
}

pub type Result<T> = std::result::Result<T, CompileError>;
