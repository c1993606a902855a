//! The compiled representation a textual pattern is parsed into: [`Program`], its tree of
//! [`MatchNode`]s, and the [`FieldSpec`]/[`DecodedField`] types the evaluator and codec pass
//! around.

use crate::codec::{FieldKind, Value};
use crate::expr::Expr;

/// Whether a field is a plain decode or additionally sets the state's declared length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldRole {
    Normal,
    Length,
}

/// An immutable description of one decoded atom.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub kind: FieldKind,
    pub name: Option<String>,
    pub role: FieldRole,
    /// Set only for fields written with the explicit `%c`/`%cc` tokens. Purely a compile-time
    /// "must be terminal" marker — the runtime CRC check inspects whichever field actually ends
    /// up last, regardless of this flag (`SPEC_FULL.md` §4.2).
    pub is_crc_marker: bool,
}

impl FieldSpec {
    pub fn new(kind: FieldKind) -> Self {
        FieldSpec {
            kind,
            name: None,
            role: FieldRole::Normal,
            is_crc_marker: false,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn length(mut self) -> Self {
        self.role = FieldRole::Length;
        self
    }

    pub fn crc_marker(mut self) -> Self {
        self.is_crc_marker = true;
        self
    }
}

/// One decoded atomic datum, as handed to the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedField {
    pub name: String,
    pub offset: usize,
    pub kind: FieldKind,
    pub value: Value,
}

/// A single byte or relative-offset target for `#N` / `#+N` jumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpTarget {
    Absolute(usize),
    Relative(usize),
}

/// A single-byte-or-adaptive-span wildcard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WildcardKind {
    /// Consume exactly `n` bytes, no questions asked.
    Exact(usize),
    /// Consume as many bytes as possible while leaving room for fixed-size successors.
    Greedy,
}

/// One member of a `%N{...}` array-of-structs element: either a plain decoded field or a
/// derived/guard expression token, the same two shapes a top-level pattern token allows.
#[derive(Debug, Clone, PartialEq)]
pub enum StructMember {
    Field(FieldSpec),
    Expression {
        base: Option<FieldSpec>,
        expr: Expr,
        /// `true` ⇒ a false boolean result fails the match (guard); `false` ⇒ the expression's
        /// numeric result is stored as a derived field.
        condition: bool,
        name: Option<String>,
    },
}

/// One node of the compiled match tree.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchNode {
    Sequence(Vec<MatchNode>),
    Choice(Vec<MatchNode>),
    Literal(Vec<u8>),
    Wildcard(WildcardKind),
    OffsetJump(JumpTarget),
    SkipUntil(Vec<u8>),
    Field(FieldSpec),
    ArrayStride {
        count: usize,
        element: FieldKind,
        name: Option<String>,
    },
    ArrayOfStructs {
        /// `None` means "consume structs until the buffer/anchors say otherwise" — current
        /// grammar always supplies a count, so this is reserved for future open-ended arrays.
        count: Option<usize>,
        fields: Vec<StructMember>,
        name: Option<String>,
    },
    Lookahead(Box<MatchNode>),
    Expression {
        base: Option<FieldSpec>,
        expr: Expr,
        /// `true` ⇒ a false boolean result fails the match (guard); `false` ⇒ the expression's
        /// numeric result is stored as a derived field.
        condition: bool,
        name: Option<String>,
    },
}

/// The root of a compiled pattern plus its anchors and length ceiling.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub root: MatchNode,
    pub start_anchor: bool,
    pub end_anchor: bool,
    /// `0` means the pattern text carried no `$N` hint.
    pub max_length: usize,
    /// The pattern text this program was compiled from, kept for fast-resync after a Drop.
    pub source_text: String,
}

impl Program {
    /// First literal byte of the pattern, if the root (or its first sequence child) begins with
    /// one. Used by the framer's fast-resync strategy when the start anchor is set.
    pub fn first_literal_byte(&self) -> Option<u8> {
        first_literal_byte(&self.root)
    }
}

fn first_literal_byte(node: &MatchNode) -> Option<u8> {
    match node {
        MatchNode::Literal(bytes) => bytes.first().copied(),
        MatchNode::Sequence(children) => children.first().and_then(first_literal_byte),
        MatchNode::Choice(children) => {
            // All branches must agree on a first byte for fast-resync to be meaningful; if they
            // don't, resync falls back to discarding one byte at a time (handled by the framer).
            let mut iter = children.iter().map(first_literal_byte);
            let first = iter.next()??;
            if iter.all(|b| b == Some(first)) {
                Some(first)
            } else {
                None
            }
        }
        _ => None,
    }
}

