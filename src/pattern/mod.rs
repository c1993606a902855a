//! The pattern grammar: compiling textual patterns (`^AA*L%uu%cc$` and friends) into a
//! [`ast::Program`] the evaluator can drive.
//!
//! See `SPEC_FULL.md` §4.3 for the full grammar reference.

pub mod ast;
pub mod parser;

pub use ast::{DecodedField, FieldSpec, JumpTarget, MatchNode, Program, WildcardKind};
pub use parser::compile;
