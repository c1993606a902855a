//! Layered error types: one kind per place an error can surface to a caller.
//!
//! Compile errors are synchronous and fatal to the pattern; decode errors are local to a
//! single match attempt and collapse it to `Drop`; engine errors are the only kind that cross
//! `Engine::run`'s boundary back to the caller.

/// Failure to compile a textual pattern into a [`crate::pattern::Program`].
#[derive(PartialEq, Debug, Clone, thiserror::Error)]
#[non_exhaustive] // new rejections may be added later
pub enum CompileError {
    #[error("unexpected end of pattern")]
    UnexpectedEnd,

    #[error("unterminated choice group starting at pattern offset {0}")]
    UnterminatedChoice(usize),

    #[error("multiple end anchors in pattern")]
    MultipleEndAnchors,

    #[error("conflicting maximum-length hints: {0} and {1}")]
    ConflictingLengthHint(usize, usize),

    #[error("CRC marker must be the last field in the pattern, found at offset {0}")]
    CrcNotAtTerminalPosition(usize),

    #[error("expression references undefined field `{0}`")]
    UndefinedFieldReference(String),

    #[error("literal byte `{0}` is not valid hex")]
    NonHexLiteral(String),

    #[error("unrecognised token `{0}` at pattern offset {1}")]
    InvalidToken(String, usize),

    #[error("array count must be non-zero at pattern offset {0}")]
    ZeroArrayCount(usize),

    #[error("malformed expression: {0}")]
    MalformedExpression(String),
}

/// Failure local to a single match attempt; always collapses the attempt to `Drop`.
#[derive(PartialEq, Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum DecodeError {
    #[error("division by zero evaluating expression")]
    DivisionByZero,

    #[error("fixed-length string field declared with zero size")]
    ZeroLengthFixedString,

    #[error("varint exceeded 10 bytes without a terminating byte")]
    VarintOverflow,

    #[error("boolean operand used in arithmetic context")]
    TypeMismatch,

    #[error("offset jump target {0} exceeds the pattern's maximum length")]
    JumpBeyondMaxLength(usize),
}

/// The only error variant that crosses the public API boundary from [`crate::framer`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum EngineError {
    #[error("byte source failed: {0}")]
    Source(Box<dyn std::error::Error + Send + Sync>),

    #[error("engine cancelled")]
    Cancelled,
}

impl PartialEq for EngineError {
    // Source errors are compared by message only; the underlying error type is opaque.
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (EngineError::Cancelled, EngineError::Cancelled) => true,
            (EngineError::Source(a), EngineError::Source(b)) => a.to_string() == b.to_string(),
            _ => false,
        }
    }
}

