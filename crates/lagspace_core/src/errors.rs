//! Error types for the lagspace pipeline.
//!
//! - `SyntaxError`: tokenizing, parsing and time-offset normalization failures
//! - `CompileError`: reference resolution and bytecode compilation failures
//! - `EquationError`: either of the above, for a single equation
//! - `ModelError`: everything that can go wrong at model level
//!
//! Compile and structural errors abort construction. Conditions that the
//! pipeline can proceed through are logged with `tracing` instead.

use thiserror::Error;

/// Errors raised while reading an equation's text or expanding its time operators.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyntaxError {
    #[error("unexpected character '{0}'")]
    UnexpectedChar(char),
    #[error("invalid number literal: {0}")]
    InvalidNumber(String),
    #[error("unexpected token: {0}")]
    UnexpectedToken(String),
    #[error("unexpected end of input")]
    UnexpectedEnd,
    /// The index of a time reference is not `t`, `t+k` or `t-k` with integer `k`.
    #[error("unsupported time index form `{0}`")]
    UnsupportedTimeIndex(String),
    #[error("multiple time indices on `{0}`")]
    MultipleTimeIndices(String),
    #[error("unknown macro `@{0}`")]
    UnknownMacro(String),
    /// Shifting a time reference would leave the representable offset range.
    #[error("time offset of `{0}` is out of range")]
    OffsetOutOfRange(String),
    #[error("bad arguments to `{name}`: {reason}")]
    BadMacroArgument { name: String, reason: String },
}

/// Errors raised while resolving references and emitting bytecode.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompileError {
    #[error("unknown identifier `{0}`")]
    UnknownIdentifier(String),
    #[error("unknown function `{name}` with {arity} argument(s)")]
    UnknownFunction { name: String, arity: usize },
    #[error("steady-state reference to unknown variable `{0}`")]
    UnknownSteadyState(String),
    #[error("multiple time indices on `{0}`")]
    MultipleTimeIndices(String),
    #[error("time reference `{0}` was not normalized")]
    UnnormalizedReference(String),
}

/// Failure to turn one equation into an evaluator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EquationError {
    #[error(transparent)]
    Syntax(#[from] SyntaxError),
    #[error(transparent)]
    Compile(#[from] CompileError),
}

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("equation `{name}` ({text}): {source}")]
    Equation {
        name: String,
        text: String,
        #[source]
        source: EquationError,
    },
    #[error("duplicate {kind} `{name}`")]
    Duplicate { kind: &'static str, name: String },
    #[error("unknown variable `{0}`")]
    UnknownVariable(String),
    #[error("unknown parameter `{0}`")]
    UnknownParameter(String),
    /// A (variable, offset) reference does not fit the declared evaluation window.
    #[error(
        "`{variable}[t{offset:+}]` in equation `{equation}` lies outside the window [-{maxlag}, +{maxlead}]"
    )]
    OutsideWindow {
        equation: String,
        variable: String,
        offset: i32,
        maxlag: usize,
        maxlead: usize,
    },
    #[error("failed to build Jacobian sparsity pattern: {0}")]
    Pattern(String),
    #[error("linearization failed: {0}")]
    Linearization(String),
    #[error("invalid {what} dimensions: expected {expected}, got {got}")]
    DimensionMismatch {
        what: &'static str,
        expected: String,
        got: String,
    },
    #[error("range {start}..{end} is outside the trajectory of length {len}")]
    RangeOutOfBounds { start: usize, end: usize, len: usize },
    #[error("equation index {index} out of range for a model with {count} equations")]
    UnknownEquation { index: usize, count: usize },
}

pub type Result<T> = std::result::Result<T, ModelError>;
