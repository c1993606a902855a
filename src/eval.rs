//! Drives a compiled [`Program`] against a [`State`], producing the streaming decision.
//!
//! `decide` is the only entry point a caller needs; everything else here is the node-by-node
//! machinery `decide` is built from.

use std::collections::HashMap;

use crate::codec::{self, DecodeOutcome, FieldKind, Value};
use crate::error::DecodeError;
use crate::expr::{self, Environment};
use crate::pattern::ast::{
    FieldRole, FieldSpec, JumpTarget, MatchNode, Program, StructMember, WildcardKind,
};
use crate::pattern::DecodedField;
use crate::state::{Decision, State};

/// Result of running one [`MatchNode`] against the buffer starting at a given offset.
enum NodeOutcome {
    Match(usize),
    NeedMore,
    Fail(DecodeError),
}

/// Entry point: decide whether `state`'s buffer is a complete match, could still become one, or
/// cannot. Idempotent when called twice with no bytes appended in between, since it only ever
/// reads `state`'s buffer and rewrites the same field list / decision each time.
pub fn decide(state: &mut State, program: &Program) -> Decision {
    state.reset_for_attempt();
    let outcome = eval_node(&program.root, state, 0);

    if let NodeOutcome::Match(next_offset) = outcome {
        state.set_offset(next_offset);
    }

    let decision = match outcome {
        NodeOutcome::Fail(_) => Decision::Drop,
        _ if state.max_length() > 0 && state.len() > state.max_length() => Decision::Drop,
        _ if state.declared_length() > 0 && state.len() < state.declared_length() => {
            Decision::Continue
        }
        _ if state.declared_length() > 0 && state.len() > state.declared_length() => {
            Decision::Drop
        }
        NodeOutcome::NeedMore => Decision::Continue,
        NodeOutcome::Match(next_offset) => {
            if program.end_anchor && next_offset < state.len() {
                Decision::Drop
            } else {
                Decision::Emit
            }
        }
    };

    state.set_decision(decision);
    tracing::trace!(?decision, buffer_len = state.len(), "decide");
    decision
}

fn eval_node(node: &MatchNode, state: &mut State, offset: usize) -> NodeOutcome {
    match node {
        MatchNode::Sequence(children) => eval_sequence(children, state, offset),
        MatchNode::Choice(branches) => eval_choice(branches, state, offset),
        MatchNode::Literal(bytes) => eval_literal(bytes, state, offset),
        MatchNode::Wildcard(WildcardKind::Exact(n)) => eval_wildcard_exact(*n, state, offset),
        MatchNode::Wildcard(WildcardKind::Greedy) => eval_wildcard_fallback(state, offset),
        MatchNode::OffsetJump(target) => eval_jump(*target, state, offset),
        MatchNode::SkipUntil(bytes) => eval_skip_until(bytes, state, offset),
        MatchNode::Field(spec) => eval_field(spec, state, offset),
        MatchNode::ArrayStride { count, element, name } => {
            eval_array_stride(*count, *element, name, state, offset)
        }
        MatchNode::ArrayOfStructs { count, fields, name } => {
            eval_array_of_structs(count.unwrap_or(0), fields, name, state, offset)
        }
        MatchNode::Lookahead(inner) => eval_lookahead(inner, state, offset),
        MatchNode::Expression { base, expr, condition, name } => {
            eval_expression(base.as_ref(), expr, *condition, name.as_deref(), state, offset)
        }
    }
}

fn eval_sequence(children: &[MatchNode], state: &mut State, mut offset: usize) -> NodeOutcome {
    for (i, child) in children.iter().enumerate() {
        let outcome = if matches!(child, MatchNode::Wildcard(WildcardKind::Greedy)) {
            eval_greedy_wildcard_in_sequence(&children[i + 1..], state, offset)
        } else {
            eval_node(child, state, offset)
        };
        match outcome {
            NodeOutcome::Match(next) => offset = next,
            other => return other,
        }
    }
    NodeOutcome::Match(offset)
}

/// Implements the special-cased greedy-wildcard rule from `SPEC_FULL.md` §4.6 point 3: if every
/// later sibling has a statically-known fixed size, the wildcard consumes everything except that
/// reserved suffix (at least one byte); otherwise it falls back to consuming exactly one byte.
fn eval_greedy_wildcard_in_sequence(
    later_siblings: &[MatchNode],
    state: &mut State,
    offset: usize,
) -> NodeOutcome {
    let suffix_fixed = later_siblings
        .iter()
        .try_fold(0usize, |acc, n| fixed_size(n).map(|s| acc + s));

    match suffix_fixed {
        Some(reserved) => {
            let remaining = state.len().saturating_sub(offset);
            match remaining.checked_sub(reserved) {
                Some(span) if span >= 1 => NodeOutcome::Match(offset + span),
                _ => NodeOutcome::NeedMore,
            }
        }
        None => eval_wildcard_fallback(state, offset),
    }
}

fn eval_wildcard_fallback(state: &mut State, offset: usize) -> NodeOutcome {
    if offset + 1 <= state.len() {
        NodeOutcome::Match(offset + 1)
    } else {
        NodeOutcome::NeedMore
    }
}

/// Statically-known consumed byte count for `node`, or `None` if it's variable/unknown.
fn fixed_size(node: &MatchNode) -> Option<usize> {
    match node {
        MatchNode::Literal(bytes) => Some(bytes.len()),
        MatchNode::Wildcard(WildcardKind::Exact(n)) => Some(*n),
        MatchNode::Wildcard(WildcardKind::Greedy) => None,
        MatchNode::OffsetJump(_) => None,
        MatchNode::SkipUntil(_) => None,
        MatchNode::Field(spec) => {
            let n = spec.kind.fixed_size();
            if n > 0 {
                Some(n)
            } else {
                None
            }
        }
        MatchNode::ArrayStride { count, element, .. } => {
            let n = element.fixed_size();
            if n > 0 {
                Some(n * count)
            } else {
                None
            }
        }
        MatchNode::ArrayOfStructs { count, fields, .. } => {
            let count = (*count)?;
            let mut total = 0usize;
            for member in fields {
                total += member_fixed_size(member)?;
            }
            Some(total * count)
        }
        MatchNode::Choice(branches) => {
            let mut sizes = branches.iter().map(fixed_size);
            let first = sizes.next()??;
            if sizes.all(|s| s == Some(first)) {
                Some(first)
            } else {
                None
            }
        }
        MatchNode::Lookahead(_) => Some(0),
        MatchNode::Expression { base, condition, .. } => {
            if *condition {
                Some(0)
            } else {
                base.as_ref().map(|b| b.kind.fixed_size()).filter(|&n| n > 0)
            }
        }
        MatchNode::Sequence(children) => {
            let mut total = 0usize;
            for c in children {
                total += fixed_size(c)?;
            }
            Some(total)
        }
    }
}

/// Statically-known consumed byte count for one `%N{...}` member, or `None` if it's variable —
/// a guard member (`condition: true`) consumes nothing of its own, mirroring the top-level
/// `Expression` arm in [`fixed_size`].
fn member_fixed_size(member: &StructMember) -> Option<usize> {
    match member {
        StructMember::Field(spec) => {
            let n = spec.kind.fixed_size();
            if n > 0 {
                Some(n)
            } else {
                None
            }
        }
        StructMember::Expression { base, condition, .. } => {
            if *condition {
                Some(0)
            } else {
                base.as_ref().map(|b| b.kind.fixed_size()).filter(|&n| n > 0)
            }
        }
    }
}

fn eval_choice(branches: &[MatchNode], state: &mut State, offset: usize) -> NodeOutcome {
    let mut saw_need_more = false;
    let mut last_fail = DecodeError::TypeMismatch;
    for branch in branches {
        let mut clone = state.clone();
        match eval_node(branch, &mut clone, offset) {
            NodeOutcome::Match(next) => {
                state.merge(&clone);
                return NodeOutcome::Match(next);
            }
            NodeOutcome::NeedMore => saw_need_more = true,
            NodeOutcome::Fail(e) => last_fail = e,
        }
    }
    if saw_need_more {
        NodeOutcome::NeedMore
    } else {
        NodeOutcome::Fail(last_fail)
    }
}

fn eval_literal(bytes: &[u8], state: &mut State, offset: usize) -> NodeOutcome {
    let end = offset + bytes.len();
    if end > state.len() {
        return NodeOutcome::NeedMore;
    }
    if &state.buffer()[offset..end] == bytes {
        NodeOutcome::Match(end)
    } else {
        NodeOutcome::Fail(DecodeError::TypeMismatch)
    }
}

fn eval_wildcard_exact(n: usize, state: &mut State, offset: usize) -> NodeOutcome {
    if offset + n <= state.len() {
        NodeOutcome::Match(offset + n)
    } else {
        NodeOutcome::NeedMore
    }
}

fn eval_jump(target: JumpTarget, state: &mut State, offset: usize) -> NodeOutcome {
    let dest = match target {
        JumpTarget::Absolute(n) => n,
        JumpTarget::Relative(n) => offset + n,
    };
    if state.max_length() > 0 && dest > state.max_length() {
        return NodeOutcome::Fail(DecodeError::JumpBeyondMaxLength(dest));
    }
    if dest > state.len() {
        return NodeOutcome::NeedMore;
    }
    NodeOutcome::Match(dest)
}

fn eval_skip_until(bytes: &[u8], state: &mut State, offset: usize) -> NodeOutcome {
    let haystack = &state.buffer()[offset..];
    match find_subslice(haystack, bytes) {
        Some(p) => NodeOutcome::Match(offset + p + bytes.len()),
        None => NodeOutcome::NeedMore,
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn eval_field(spec: &FieldSpec, state: &mut State, offset: usize) -> NodeOutcome {
    match codec::decode(&state.buffer()[offset..], spec.kind) {
        DecodeOutcome::Ok(value, n) => {
            if spec.role == FieldRole::Length {
                if let Some(len) = numeric_length(&value) {
                    state.set_declared_length(len);
                }
            }
            state.add_field(DecodedField {
                name: spec.name.clone().unwrap_or_default(),
                offset,
                kind: spec.kind,
                value,
            });
            NodeOutcome::Match(offset + n)
        }
        DecodeOutcome::NeedMore => NodeOutcome::NeedMore,
        DecodeOutcome::Fail(e) => NodeOutcome::Fail(e),
    }
}

fn numeric_length(value: &Value) -> Option<usize> {
    match value {
        Value::UInt(v) => Some(*v as usize),
        Value::Int(v) if *v >= 0 => Some(*v as usize),
        _ => None,
    }
}

fn eval_array_stride(
    count: usize,
    element: FieldKind,
    name: &Option<String>,
    state: &mut State,
    mut offset: usize,
) -> NodeOutcome {
    let base_name = name.clone().unwrap_or_default();
    for i in 0..count {
        match codec::decode(&state.buffer()[offset..], element) {
            DecodeOutcome::Ok(value, n) => {
                state.add_field(DecodedField {
                    name: format!("{base_name}_{i}"),
                    offset,
                    kind: element,
                    value,
                });
                offset += n;
            }
            DecodeOutcome::NeedMore => return NodeOutcome::NeedMore,
            DecodeOutcome::Fail(e) => return NodeOutcome::Fail(e),
        }
    }
    NodeOutcome::Match(offset)
}

fn eval_array_of_structs(
    count: usize,
    fields: &[StructMember],
    name: &Option<String>,
    state: &mut State,
    mut offset: usize,
) -> NodeOutcome {
    let base_name = name.clone().unwrap_or_default();
    for i in 0..count {
        for member in fields {
            match member {
                StructMember::Field(spec) => {
                    match codec::decode(&state.buffer()[offset..], spec.kind) {
                        DecodeOutcome::Ok(value, n) => {
                            let member_name = spec.name.clone().unwrap_or_default();
                            state.add_field(DecodedField {
                                name: format!("{base_name}_{i}_{member_name}"),
                                offset,
                                kind: spec.kind,
                                value,
                            });
                            offset += n;
                        }
                        DecodeOutcome::NeedMore => return NodeOutcome::NeedMore,
                        DecodeOutcome::Fail(e) => return NodeOutcome::Fail(e),
                    }
                }
                StructMember::Expression { base, expr, condition, name: member_name } => {
                    let (current, next_offset) = match eval_expr_base(base.as_ref(), state, offset) {
                        Ok(pair) => pair,
                        Err(outcome) => return outcome,
                    };
                    let result = match eval_expr_result(expr, state, current) {
                        Ok(r) => r,
                        Err(e) => return NodeOutcome::Fail(e),
                    };
                    if *condition {
                        match result.as_bool() {
                            Some(true) => offset = next_offset,
                            _ => return NodeOutcome::Fail(DecodeError::TypeMismatch),
                        }
                    } else {
                        let derived = result.as_f64().unwrap_or_default();
                        let name = member_name.clone().unwrap_or_default();
                        state.add_field(DecodedField {
                            name: format!("{base_name}_{i}_{name}"),
                            offset,
                            kind: FieldKind::F64Le,
                            value: Value::Float(derived),
                        });
                        offset = next_offset;
                    }
                }
            }
        }
    }
    NodeOutcome::Match(offset)
}

fn eval_lookahead(inner: &MatchNode, state: &mut State, offset: usize) -> NodeOutcome {
    let mut clone = state.clone();
    match eval_node(inner, &mut clone, offset) {
        NodeOutcome::Match(_) => NodeOutcome::Match(offset),
        other => other,
    }
}

/// Decodes an expression token's optional base field, returning the `_`-binding value (as f64)
/// and the offset past it. Shared by top-level `Expression` nodes and `%N{...}` struct members,
/// which both allow a `(t expr)`/`@(expr)` token to carry or omit a base decode.
fn eval_expr_base(
    base: Option<&FieldSpec>,
    state: &State,
    offset: usize,
) -> Result<(Option<f64>, usize), NodeOutcome> {
    match base {
        Some(spec) => match codec::decode(&state.buffer()[offset..], spec.kind) {
            DecodeOutcome::Ok(value, n) => Ok((value.as_f64(), offset + n)),
            DecodeOutcome::NeedMore => Err(NodeOutcome::NeedMore),
            DecodeOutcome::Fail(e) => Err(NodeOutcome::Fail(e)),
        },
        None => Ok((None, offset)),
    }
}

/// Evaluates an expression token's body against the fields decoded so far plus the `_` binding.
/// Shared by top-level `Expression` nodes and `%N{...}` struct members.
fn eval_expr_result(
    expr_ast: &expr::Expr,
    state: &State,
    current: Option<f64>,
) -> Result<expr::ExprValue, DecodeError> {
    let fields: HashMap<String, Value> = state
        .fields()
        .iter()
        .map(|f| (f.name.clone(), f.value.clone()))
        .collect();
    let env = Environment::new(&fields, current);
    expr::eval(expr_ast, &env)
}

fn eval_expression(
    base: Option<&FieldSpec>,
    expr_ast: &expr::Expr,
    condition: bool,
    name: Option<&str>,
    state: &mut State,
    offset: usize,
) -> NodeOutcome {
    let (current, next_offset) = match eval_expr_base(base, state, offset) {
        Ok(pair) => pair,
        Err(outcome) => return outcome,
    };

    let result = match eval_expr_result(expr_ast, state, current) {
        Ok(r) => r,
        Err(e) => return NodeOutcome::Fail(e),
    };

    if condition {
        match result.as_bool() {
            Some(true) => NodeOutcome::Match(next_offset),
            Some(false) => NodeOutcome::Fail(DecodeError::TypeMismatch),
            None => NodeOutcome::Fail(DecodeError::TypeMismatch),
        }
    } else {
        let derived = result.as_f64().unwrap_or_default();
        state.add_field(DecodedField {
            name: name.unwrap_or_default().to_string(),
            offset,
            kind: FieldKind::F64Le,
            value: Value::Float(derived),
        });
        NodeOutcome::Match(next_offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::compile;

    fn feed(state: &mut State, program: &Program, bytes: &[u8]) -> Decision {
        let mut last = Decision::Continue;
        for &b in bytes {
            state.append(b);
            last = decide(state, program);
            if last != Decision::Continue {
                break;
            }
        }
        last
    }

    #[test]
    fn scenario_a_simple_length_and_crc() {
        // ^AA*L%uu%cc$: literal 0xAA, greedy wildcard, then three fixed trailing fields (a
        // single `L` is an 8-bit length, `%uu` a 16-bit field, `%cc` the 16-bit CRC candidate) —
        // the wildcard reserves exactly those 5 trailing bytes and takes whatever's left. Fed one
        // byte at a time, the match completes the instant the minimum total (7 bytes, 1 of them
        // wildcard) is reached, so the buffer here is sized to exactly that minimum.
        let program = compile("^AA*L%uu%cc$").unwrap();
        let mut state = State::new(0);
        let bytes = [0xAA, 0x99, 0x05, 0x34, 0x12, 0xAA, 0x00];
        let decision = feed(&mut state, &program, &bytes);
        assert_eq!(decision, Decision::Emit);
        let fields = state.fields();
        assert_eq!(fields.len(), 3);
        assert_eq!(fields[0].value, Value::UInt(0x05));
        assert_eq!(fields[1].value, Value::UInt(0x1234));
        assert_eq!(fields[2].value, Value::UInt(0x00AA));
    }

    #[test]
    fn scenario_b_drop_on_mismatch() {
        let program = compile("^AA*L%uu%cc$").unwrap();
        let mut state = State::new(0);
        state.append(0xAB);
        let decision = decide(&mut state, &program);
        assert_eq!(decision, Decision::Drop);
    }

    #[test]
    fn scenario_c_continue_then_emit() {
        let program = compile("^AA%uu$").unwrap();
        let mut state = State::new(0);

        state.append(0xAA);
        assert_eq!(decide(&mut state, &program), Decision::Continue);

        state.append(0x34);
        assert_eq!(decide(&mut state, &program), Decision::Continue);

        state.append(0x12);
        assert_eq!(decide(&mut state, &program), Decision::Emit);
        assert_eq!(state.fields()[0].value, Value::UInt(0x1234));
    }

    #[test]
    fn scenario_d_choice() {
        let program = compile("^(55AA|BBCC)%u$").unwrap();

        let mut state = State::new(0);
        let decision = feed(&mut state, &program, &[0xBB, 0xCC, 0x42]);
        assert_eq!(decision, Decision::Emit);
        assert_eq!(state.fields()[0].value, Value::UInt(0x42));

        let mut state = State::new(0);
        let decision = feed(&mut state, &program, &[0x11, 0x22, 0x42]);
        assert_eq!(decision, Decision::Drop);
    }

    #[test]
    fn scenario_e_length_driven_emit() {
        let program = compile("^55AA*ll$").unwrap();
        let mut state = State::new(0);
        let decision = feed(&mut state, &program, &[0x55, 0xAA, 0x01, 0x05, 0x00]);
        assert_eq!(decision, Decision::Emit);
    }

    #[test]
    fn scenario_f_derived_guard() {
        let program = compile("^%value:uu@(value>100)$").unwrap();

        let mut state = State::new(0);
        let decision = feed(&mut state, &program, &[0x05, 0x00]);
        assert_eq!(decision, Decision::Drop);

        let mut state = State::new(0);
        let decision = feed(&mut state, &program, &[0x65, 0x00]);
        assert_eq!(decision, Decision::Emit);
    }

    #[test]
    fn decide_is_idempotent() {
        let program = compile("^AA%uu$").unwrap();
        let mut state = State::new(0);
        state.append(0xAA);
        state.append(0x34);
        state.append(0x12);
        let first = decide(&mut state, &program);
        let second = decide(&mut state, &program);
        assert_eq!(first, second);
    }

    #[test]
    fn choice_safety_failed_branch_fields_do_not_leak() {
        let program = compile("^(AA%u|BB%uu)$").unwrap();
        let mut state = State::new(0);
        // Matches the second branch only; the first branch's field decode must not appear.
        let decision = feed(&mut state, &program, &[0xBB, 0x01, 0x02]);
        assert_eq!(decision, Decision::Emit);
        assert_eq!(state.fields().len(), 1);
    }

    #[test]
    fn end_anchor_rejects_trailing_bytes() {
        let program = compile("^AA$").unwrap();
        let mut state = State::new(0);
        state.append(0xAA);
        state.append(0xFF);
        let decision = decide(&mut state, &program);
        assert_eq!(decision, Decision::Drop);
    }

    #[test]
    fn monotonicity_drop_persists() {
        let program = compile("^AA$").unwrap();
        let mut state = State::new(0);
        state.append(0xFF);
        assert_eq!(decide(&mut state, &program), Decision::Drop);
        // appending more bytes to the same aborted attempt can't rescue it
        state.append(0xAA);
        assert_eq!(decide(&mut state, &program), Decision::Drop);
    }

    #[test]
    fn array_of_structs_member_derives_a_value_from_each_element() {
        // each element is a raw u8 followed by its doubled value
        let program = compile("^%2{u,(u _ * 2)}$").unwrap();
        let mut state = State::new(0);
        let decision = feed(&mut state, &program, &[0x05, 0x0A, 0x07, 0x0E]);
        assert_eq!(decision, Decision::Emit);
        let fields = state.fields();
        assert_eq!(fields.len(), 4);
        assert_eq!(fields[0].value, Value::UInt(5));
        assert_eq!(fields[1].value, Value::Float(10.0));
        assert_eq!(fields[2].value, Value::UInt(7));
        assert_eq!(fields[3].value, Value::Float(14.0));
    }

    #[test]
    fn array_of_structs_guard_member_drops_on_false() {
        let program = compile("^%count:u%2{u,@(count>0)}$").unwrap();

        let mut state = State::new(0);
        let decision = feed(&mut state, &program, &[0x00, 0x01, 0x02]);
        assert_eq!(decision, Decision::Drop);

        let mut state = State::new(0);
        let decision = feed(&mut state, &program, &[0x01, 0x01, 0x02]);
        assert_eq!(decision, Decision::Emit);
    }

    #[test]
    fn greedy_wildcard_reserves_room_for_fixed_suffix() {
        // wildcard must leave exactly 1 byte for the trailing %u; the minimum total is 3 bytes
        // (1 literal + 1 wildcard + 1 field), and the match completes the instant that's met.
        let program = compile("^AA*%u$").unwrap();
        let mut state = State::new(0);
        let decision = feed(&mut state, &program, &[0xAA, 0xFF, 0x2A]);
        assert_eq!(decision, Decision::Emit);
        assert_eq!(state.fields()[0].value, Value::UInt(0x2A));
    }
}
