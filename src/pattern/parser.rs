//! Recursive-descent compiler from pattern text to a [`Program`].
//!
//! The grammar is driven by a single lookahead character at each position; every compound
//! construct (`%( … )`, `%N{ … }`, `@( … )`, `&( … )`, `( A|B|C )`) consumes its own matching
//! closing delimiter before returning, so the generic sequence loop only ever needs to recognise
//! a bare `|` or `)` belonging to its *own* enclosing construct.

use std::collections::HashSet;

use crate::codec::FieldKind;
use crate::error::CompileError;
use crate::expr::{self, CURRENT_VALUE_IDENT};
use crate::pattern::ast::{FieldRole, FieldSpec, JumpTarget, MatchNode, Program, StructMember, WildcardKind};

/// Compile `pattern` into a [`Program`]. See `SPEC_FULL.md` §4.3 for the grammar and §7 for the
/// rejected-pattern list.
pub fn compile(pattern: &str) -> Result<Program, CompileError> {
    let span = tracing::debug_span!("compile", pattern);
    let _enter = span.enter();
    match compile_inner(pattern) {
        Ok(program) => {
            tracing::debug!(
                max_length = program.max_length,
                start_anchor = program.start_anchor,
                end_anchor = program.end_anchor,
                "pattern compiled"
            );
            Ok(program)
        }
        Err(err) => {
            tracing::error!(error = %err, "pattern rejected");
            Err(err)
        }
    }
}

fn compile_inner(pattern: &str) -> Result<Program, CompileError> {
    let chars: Vec<char> = pattern.chars().collect();
    let mut scanner = Scanner { chars, pos: 0 };

    let start_anchor = scanner.eat('^');

    let mut ctx = ParseCtx {
        defined_names: HashSet::new(),
        auto_index: 0,
    };
    let nodes = parse_sequence(&mut scanner, &mut ctx, &[')', '|', '$'])?;

    let mut end_anchor = false;
    let mut max_length = 0usize;
    if scanner.eat('$') {
        end_anchor = true;
        if let Some(n) = scanner.try_parse_decimal() {
            max_length = n;
        }
        if scanner.peek() == Some('$') {
            return Err(CompileError::MultipleEndAnchors);
        }
    }

    if !scanner.is_eof() {
        return Err(CompileError::InvalidToken(
            scanner.remaining(),
            scanner.pos,
        ));
    }

    let mut root = MatchNode::Sequence(nodes);
    merge_literals(&mut root);
    validate_length_fields(&root)?;
    validate_crc_position(&root)?;

    Ok(Program {
        root,
        start_anchor,
        end_anchor,
        max_length,
        source_text: pattern.to_string(),
    })
}

/// Threaded through parsing so expression/guard nodes can check field references against names
/// declared earlier in the (linear, left-to-right) pattern text.
struct ParseCtx {
    defined_names: HashSet<String>,
    auto_index: usize,
}

impl ParseCtx {
    fn next_auto_name(&mut self) -> String {
        let n = self.auto_index;
        self.auto_index += 1;
        format!("field{n}")
    }

    fn check_references(&self, expr: &expr::Expr, allow_current: bool) -> Result<(), CompileError> {
        for name in expr::free_identifiers(expr) {
            if name == CURRENT_VALUE_IDENT {
                if !allow_current {
                    return Err(CompileError::UndefinedFieldReference(name));
                }
                continue;
            }
            if !self.defined_names.contains(&name) {
                return Err(CompileError::UndefinedFieldReference(name));
            }
        }
        Ok(())
    }
}

struct Scanner {
    chars: Vec<char>,
    pos: usize,
}

impl Scanner {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn eat(&mut self, c: char) -> bool {
        if self.peek() == Some(c) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, c: char) -> Result<(), CompileError> {
        if self.eat(c) {
            Ok(())
        } else {
            Err(CompileError::InvalidToken(
                format!("expected `{c}`"),
                self.pos,
            ))
        }
    }

    fn is_eof(&self) -> bool {
        self.pos >= self.chars.len()
    }

    fn remaining(&self) -> String {
        self.chars[self.pos..].iter().collect()
    }

    fn try_parse_decimal(&mut self) -> Option<usize> {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.pos += 1;
        }
        if self.pos == start {
            None
        } else {
            let text: String = self.chars[start..self.pos].iter().collect();
            text.parse().ok()
        }
    }

    fn is_hex_digit(c: char) -> bool {
        c.is_ascii_hexdigit()
    }

    /// Try parsing an `ident:` name prefix; restores position if there's no trailing `:`.
    fn try_parse_name_prefix(&mut self) -> Option<String> {
        let start = self.pos;
        if !matches!(self.peek(), Some(c) if c.is_alphabetic() || c == '_') {
            return None;
        }
        let mut end = self.pos;
        while matches!(self.chars.get(end), Some(c) if c.is_alphanumeric() || *c == '_') {
            end += 1;
        }
        if self.chars.get(end) == Some(&':') {
            let name: String = self.chars[start..end].iter().collect();
            self.pos = end + 1;
            Some(name)
        } else {
            None
        }
    }

    /// Capture text up to (and consuming) the matching closing paren, honouring nesting.
    fn capture_balanced(&mut self, open: char, close: char) -> Result<String, CompileError> {
        let start = self.pos;
        let mut depth = 1usize;
        while depth > 0 {
            match self.advance() {
                Some(c) if c == open => depth += 1,
                Some(c) if c == close => depth -= 1,
                Some(_) => {}
                None => {
                    return Err(CompileError::UnterminatedChoice(start));
                }
            }
        }
        // self.pos now sits one past the matching close; exclude it from the captured text.
        Ok(self.chars[start..self.pos - 1].iter().collect())
    }
}

fn parse_sequence(
    scanner: &mut Scanner,
    ctx: &mut ParseCtx,
    stops: &[char],
) -> Result<Vec<MatchNode>, CompileError> {
    let mut nodes = Vec::new();
    while let Some(c) = scanner.peek() {
        if stops.contains(&c) {
            break;
        }
        nodes.push(parse_node(scanner, ctx)?);
    }
    Ok(nodes)
}

fn parse_node(scanner: &mut Scanner, ctx: &mut ParseCtx) -> Result<MatchNode, CompileError> {
    let c = scanner.peek().ok_or(CompileError::UnexpectedEnd)?;
    match c {
        '(' => parse_choice(scanner, ctx),
        '%' => parse_percent(scanner, ctx),
        '@' => parse_guard(scanner, ctx),
        '&' => parse_lookahead(scanner, ctx),
        '~' => parse_skip_until(scanner),
        '#' => parse_jump(scanner),
        '*' => parse_wildcard(scanner),
        'L' => parse_length_big(scanner),
        'l' => parse_length_little(scanner),
        c if Scanner::is_hex_digit(c) && scanner.peek_at(1).map(Scanner::is_hex_digit) == Some(true) => {
            parse_literal_byte(scanner)
        }
        other => Err(CompileError::NonHexLiteral(other.to_string())),
    }
}

fn parse_literal_byte(scanner: &mut Scanner) -> Result<MatchNode, CompileError> {
    let hi = scanner.advance().unwrap();
    let lo = scanner.advance().unwrap();
    let text: String = [hi, lo].into_iter().collect();
    let byte = u8::from_str_radix(&text, 16)
        .map_err(|_| CompileError::NonHexLiteral(text.clone()))?;
    Ok(MatchNode::Literal(vec![byte]))
}

fn parse_choice(scanner: &mut Scanner, ctx: &mut ParseCtx) -> Result<MatchNode, CompileError> {
    let start = scanner.pos;
    scanner.expect('(')?;
    let mut branches = Vec::new();
    loop {
        let branch_nodes = parse_sequence(scanner, ctx, &[')', '|'])?;
        let mut branch_root = MatchNode::Sequence(branch_nodes);
        merge_literals(&mut branch_root);
        branches.push(branch_root);
        if scanner.eat('|') {
            continue;
        }
        break;
    }
    if !scanner.eat(')') {
        return Err(CompileError::UnterminatedChoice(start));
    }
    Ok(MatchNode::Choice(branches))
}

fn parse_lookahead(scanner: &mut Scanner, ctx: &mut ParseCtx) -> Result<MatchNode, CompileError> {
    let start = scanner.pos;
    scanner.expect('&')?;
    scanner.expect('(')?;
    let inner_nodes = parse_sequence(scanner, ctx, &[')'])?;
    if !scanner.eat(')') {
        return Err(CompileError::UnterminatedChoice(start));
    }
    let mut inner = MatchNode::Sequence(inner_nodes);
    merge_literals(&mut inner);
    Ok(MatchNode::Lookahead(Box::new(inner)))
}

fn parse_skip_until(scanner: &mut Scanner) -> Result<MatchNode, CompileError> {
    scanner.expect('~')?;
    let mut bytes = Vec::new();
    while let (Some(hi), Some(lo)) = (scanner.peek(), scanner.peek_at(1)) {
        if Scanner::is_hex_digit(hi) && Scanner::is_hex_digit(lo) {
            scanner.advance();
            scanner.advance();
            let text: String = [hi, lo].into_iter().collect();
            bytes.push(u8::from_str_radix(&text, 16).unwrap());
        } else {
            break;
        }
    }
    if bytes.is_empty() {
        return Err(CompileError::InvalidToken("~ with no target bytes".to_string(), scanner.pos));
    }
    Ok(MatchNode::SkipUntil(bytes))
}

fn parse_jump(scanner: &mut Scanner) -> Result<MatchNode, CompileError> {
    scanner.expect('#')?;
    let relative = scanner.eat('+');
    let n = scanner
        .try_parse_decimal()
        .ok_or_else(|| CompileError::InvalidToken("# with no target offset".to_string(), scanner.pos))?;
    let target = if relative {
        JumpTarget::Relative(n)
    } else {
        JumpTarget::Absolute(n)
    };
    Ok(MatchNode::OffsetJump(target))
}

fn parse_wildcard(scanner: &mut Scanner) -> Result<MatchNode, CompileError> {
    scanner.expect('*')?;
    match scanner.try_parse_decimal() {
        Some(n) => Ok(MatchNode::Wildcard(WildcardKind::Exact(n))),
        None => Ok(MatchNode::Wildcard(WildcardKind::Greedy)),
    }
}

fn parse_length_big(scanner: &mut Scanner) -> Result<MatchNode, CompileError> {
    scanner.expect('L')?;
    let kind = if scanner.eat('L') {
        FieldKind::U16Be
    } else {
        FieldKind::U8
    };
    Ok(MatchNode::Field(FieldSpec::new(kind).length()))
}

fn parse_length_little(scanner: &mut Scanner) -> Result<MatchNode, CompileError> {
    scanner.expect('l')?;
    if scanner.eat('l') {
        Ok(MatchNode::Field(FieldSpec::new(FieldKind::U16Le).length()))
    } else {
        Err(CompileError::InvalidToken("l".to_string(), scanner.pos))
    }
}

fn parse_guard(scanner: &mut Scanner, ctx: &mut ParseCtx) -> Result<MatchNode, CompileError> {
    scanner.expect('@')?;
    scanner.expect('(')?;
    let text = scanner.capture_balanced('(', ')')?;
    let expr = expr::parse(&text)?;
    ctx.check_references(&expr, false)?;
    Ok(MatchNode::Expression {
        base: None,
        expr,
        condition: true,
        name: None,
    })
}

/// One of the short base-decode tokens (`i`, `uu`, `F`, `cc`, ...). `is_crc_marker` is tracked
/// separately from `kind` purely for the "CRC must be terminal" compile-time check in
/// `validate_crc_position`; at evaluation time any trailing u8/u16 field is a CRC candidate
/// regardless of which token produced it (`SPEC_FULL.md` §4.2).
struct BaseToken {
    kind: FieldKind,
    is_crc_marker: bool,
}

fn parse_base_token(scanner: &mut Scanner) -> Result<BaseToken, CompileError> {
    let c = scanner.peek().ok_or(CompileError::UnexpectedEnd)?;
    let kind = match c {
        'i' => width_kind(run_length(scanner, 'i'), false, false)?,
        'I' => width_kind(run_length(scanner, 'I'), false, true)?,
        'u' => width_kind(run_length(scanner, 'u'), true, false)?,
        'U' => width_kind(run_length(scanner, 'U'), true, true)?,
        'f' => {
            scanner.advance();
            FieldKind::F32Le
        }
        'F' => {
            scanner.advance();
            FieldKind::F64Le
        }
        'c' => {
            let n = run_length(scanner, 'c');
            return Ok(BaseToken {
                kind: if n == 1 { FieldKind::U8 } else if n == 2 {
                    FieldKind::U16Le
                } else {
                    return Err(CompileError::InvalidToken("c".repeat(n), scanner.pos));
                },
                is_crc_marker: true,
            });
        }
        other => return Err(CompileError::InvalidToken(other.to_string(), scanner.pos)),
    };
    Ok(BaseToken {
        kind,
        is_crc_marker: false,
    })
}

fn run_length(scanner: &mut Scanner, c: char) -> usize {
    let mut n = 0;
    while scanner.peek() == Some(c) {
        scanner.advance();
        n += 1;
    }
    n
}

fn width_kind(run: usize, unsigned: bool, big_endian: bool) -> Result<FieldKind, CompileError> {
    Ok(match (run, unsigned, big_endian) {
        (1, false, false) => FieldKind::I8,
        (2, false, false) => FieldKind::I16Le,
        (3, false, false) => FieldKind::I32Le,
        (4, false, false) => FieldKind::I64Le,
        (1, false, true) => FieldKind::I8,
        (2, false, true) => FieldKind::I16Be,
        (3, false, true) => FieldKind::I32Be,
        (4, false, true) => FieldKind::I64Be,
        (1, true, false) => FieldKind::U8,
        (2, true, false) => FieldKind::U16Le,
        (3, true, false) => FieldKind::U32Le,
        (4, true, false) => FieldKind::U64Le,
        (1, true, true) => FieldKind::U8,
        (2, true, true) => FieldKind::U16Be,
        (3, true, true) => FieldKind::U32Be,
        (4, true, true) => FieldKind::U64Be,
        (n, _, _) => return Err(CompileError::InvalidToken(format!("width run of {n}"), 0)),
    })
}

fn parse_percent(scanner: &mut Scanner, ctx: &mut ParseCtx) -> Result<MatchNode, CompileError> {
    scanner.expect('%')?;

    if scanner.peek() == Some('(') {
        return parse_derived_field(scanner, ctx);
    }

    let name = scanner.try_parse_name_prefix();
    let count = scanner.try_parse_decimal();

    if scanner.peek() == Some('{') {
        return parse_array_of_structs(scanner, ctx, name, count.unwrap_or(0));
    }

    let base = parse_base_token(scanner)?;
    let field_name = name.unwrap_or_else(|| ctx.next_auto_name());
    ctx.defined_names.insert(field_name.clone());

    match count {
        Some(0) => Err(CompileError::ZeroArrayCount(scanner.pos)),
        Some(n) => Ok(MatchNode::ArrayStride {
            count: n,
            element: base.kind,
            name: Some(field_name),
        }),
        None => {
            let mut spec = FieldSpec::new(base.kind).named(field_name);
            if base.is_crc_marker {
                spec = spec.crc_marker();
            }
            Ok(MatchNode::Field(spec))
        }
    }
}

fn parse_derived_field(scanner: &mut Scanner, ctx: &mut ParseCtx) -> Result<MatchNode, CompileError> {
    scanner.expect('(')?;
    let base = parse_base_token(scanner)?;
    // skip a single space between the base token and the expression, if present
    scanner.eat(' ');
    let expr_text = scanner.capture_balanced('(', ')')?;
    let expr = expr::parse(&expr_text)?;
    ctx.check_references(&expr, true)?;
    let name = ctx.next_auto_name();
    ctx.defined_names.insert(name.clone());
    Ok(MatchNode::Expression {
        base: Some(FieldSpec::new(base.kind)),
        expr,
        condition: false,
        name: Some(name),
    })
}

fn parse_array_of_structs(
    scanner: &mut Scanner,
    ctx: &mut ParseCtx,
    name: Option<String>,
    count: usize,
) -> Result<MatchNode, CompileError> {
    if count == 0 {
        return Err(CompileError::ZeroArrayCount(scanner.pos));
    }
    scanner.expect('{')?;
    let mut members = Vec::new();
    loop {
        members.push(parse_struct_member(scanner, ctx)?);
        if scanner.eat(',') {
            continue;
        }
        break;
    }
    scanner.expect('}')?;
    let array_name = name.unwrap_or_else(|| ctx.next_auto_name());
    Ok(MatchNode::ArrayOfStructs {
        count: Some(count),
        fields: members,
        name: Some(array_name),
    })
}

/// One member of a `%N{...}` list: a plain base token (optionally `name:`-prefixed), a derived
/// `(t expr)` token, or an `@(expr)` guard — the same three shapes `parse_percent`/`parse_guard`
/// accept at the top level, without the leading `%`/`@` ambiguity since we're already inside the
/// array's braces.
fn parse_struct_member(scanner: &mut Scanner, ctx: &mut ParseCtx) -> Result<StructMember, CompileError> {
    if scanner.peek() == Some('@') {
        return parse_struct_guard(scanner, ctx);
    }
    let member_name = scanner.try_parse_name_prefix();
    if scanner.peek() == Some('(') {
        return parse_struct_derived(scanner, ctx, member_name);
    }
    let base = parse_base_token(scanner)?;
    let member_name = member_name.unwrap_or_else(|| ctx.next_auto_name());
    ctx.defined_names.insert(member_name.clone());
    Ok(StructMember::Field(FieldSpec::new(base.kind).named(member_name)))
}

fn parse_struct_derived(
    scanner: &mut Scanner,
    ctx: &mut ParseCtx,
    name: Option<String>,
) -> Result<StructMember, CompileError> {
    scanner.expect('(')?;
    let base = parse_base_token(scanner)?;
    scanner.eat(' ');
    let expr_text = scanner.capture_balanced('(', ')')?;
    let expr = expr::parse(&expr_text)?;
    ctx.check_references(&expr, true)?;
    let member_name = name.unwrap_or_else(|| ctx.next_auto_name());
    ctx.defined_names.insert(member_name.clone());
    Ok(StructMember::Expression {
        base: Some(FieldSpec::new(base.kind)),
        expr,
        condition: false,
        name: Some(member_name),
    })
}

fn parse_struct_guard(scanner: &mut Scanner, ctx: &mut ParseCtx) -> Result<StructMember, CompileError> {
    scanner.expect('@')?;
    scanner.expect('(')?;
    let text = scanner.capture_balanced('(', ')')?;
    let expr = expr::parse(&text)?;
    ctx.check_references(&expr, false)?;
    Ok(StructMember::Expression {
        base: None,
        expr,
        condition: true,
        name: None,
    })
}

/// Merge adjacent `Literal` nodes within every `Sequence` in the tree into one, so the evaluator
/// (and CRC's "last field" check) sees a single run of bytes rather than N one-byte literals.
fn merge_literals(node: &mut MatchNode) {
    match node {
        MatchNode::Sequence(children) => {
            for child in children.iter_mut() {
                merge_literals(child);
            }
            let mut merged: Vec<MatchNode> = Vec::with_capacity(children.len());
            for child in children.drain(..) {
                match (merged.last_mut(), &child) {
                    (Some(MatchNode::Literal(prev)), MatchNode::Literal(next)) => {
                        prev.extend_from_slice(next);
                    }
                    _ => merged.push(child),
                }
            }
            *children = merged;
        }
        MatchNode::Choice(branches) => {
            for b in branches.iter_mut() {
                merge_literals(b);
            }
        }
        MatchNode::Lookahead(inner) => merge_literals(inner),
        _ => {}
    }
}

fn validate_length_fields(root: &MatchNode) -> Result<(), CompileError> {
    let mut count = 0usize;
    let mut first = 0usize;
    let mut second = 0usize;
    count_length_fields(root, &mut count, &mut first, &mut second);
    if count > 1 {
        Err(CompileError::ConflictingLengthHint(first, second))
    } else {
        Ok(())
    }
}

fn count_length_fields(node: &MatchNode, count: &mut usize, first: &mut usize, second: &mut usize) {
    match node {
        MatchNode::Field(spec) if spec.role == FieldRole::Length => {
            *count += 1;
            if *count == 1 {
                *first = 1;
            } else if *count == 2 {
                *second = 2;
            }
        }
        MatchNode::Sequence(children) => {
            for c in children {
                count_length_fields(c, count, first, second);
            }
        }
        MatchNode::Choice(branches) => {
            // Each branch is independent at runtime (only one executes), so length fields in
            // different branches don't conflict with each other.
            for b in branches {
                let mut bc = 0;
                let mut bf = 0;
                let mut bs = 0;
                count_length_fields(b, &mut bc, &mut bf, &mut bs);
                if bc > *count {
                    *count = bc;
                    *first = bf;
                    *second = bs;
                }
            }
        }
        MatchNode::Lookahead(inner) => count_length_fields(inner, count, first, second),
        _ => {}
    }
}

fn validate_crc_position(root: &MatchNode) -> Result<(), CompileError> {
    check_sequence_crc_terminal(root, 0)
}

fn check_sequence_crc_terminal(node: &MatchNode, pos_hint: usize) -> Result<(), CompileError> {
    match node {
        MatchNode::Sequence(children) => {
            for (i, child) in children.iter().enumerate() {
                let is_last = i + 1 == children.len();
                if let MatchNode::Field(spec) = child {
                    if spec.is_crc_marker && !is_last {
                        return Err(CompileError::CrcNotAtTerminalPosition(pos_hint + i));
                    }
                }
                check_sequence_crc_terminal(child, pos_hint + i)?;
            }
            Ok(())
        }
        MatchNode::Choice(branches) => {
            for b in branches {
                check_sequence_crc_terminal(b, pos_hint)?;
            }
            Ok(())
        }
        MatchNode::Lookahead(inner) => check_sequence_crc_terminal(inner, pos_hint),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::ast::WildcardKind;

    #[test]
    fn scenario_a_simple_length_and_crc() {
        let program = compile("^AA*L%uu%cc$").unwrap();
        assert!(program.start_anchor);
        assert!(program.end_anchor);
        match &program.root {
            MatchNode::Sequence(nodes) => {
                assert_eq!(nodes.len(), 5);
                assert_eq!(nodes[0], MatchNode::Literal(vec![0xAA]));
                assert_eq!(nodes[1], MatchNode::Wildcard(WildcardKind::Greedy));
                assert!(matches!(&nodes[2], MatchNode::Field(f) if f.role == FieldRole::Length));
                assert!(matches!(&nodes[3], MatchNode::Field(f) if f.kind == FieldKind::U16Le));
                assert!(matches!(&nodes[4], MatchNode::Field(f) if f.kind == FieldKind::U16Le && f.is_crc_marker));
            }
            _ => panic!("expected sequence root"),
        }
    }

    #[test]
    fn scenario_d_choice_compiles() {
        let program = compile("^(55AA|BBCC)%u$").unwrap();
        match &program.root {
            MatchNode::Sequence(nodes) => {
                assert!(matches!(&nodes[0], MatchNode::Choice(b) if b.len() == 2));
            }
            _ => panic!("expected sequence root"),
        }
    }

    #[test]
    fn scenario_f_named_field_and_guard() {
        let program = compile("^%value:uu@(value>100)$").unwrap();
        match &program.root {
            MatchNode::Sequence(nodes) => {
                assert_eq!(nodes.len(), 2);
                assert!(matches!(&nodes[0], MatchNode::Field(f) if f.name.as_deref() == Some("value")));
                assert!(matches!(&nodes[1], MatchNode::Expression { condition: true, .. }));
            }
            _ => panic!("expected sequence root"),
        }
    }

    #[test]
    fn max_length_hint_is_parsed() {
        let program = compile("^AA$128").unwrap();
        assert_eq!(program.max_length, 128);
    }

    #[test]
    fn multiple_end_anchors_rejected() {
        let err = compile("^AA$128$").unwrap_err();
        assert_eq!(err, CompileError::MultipleEndAnchors);
    }

    #[test]
    fn non_hex_literal_rejected() {
        let err = compile("^ZZ$").unwrap_err();
        assert!(matches!(err, CompileError::NonHexLiteral(_)));
    }

    #[test]
    fn undefined_field_reference_rejected() {
        let err = compile("^AA@(missing>1)$").unwrap_err();
        assert!(matches!(err, CompileError::UndefinedFieldReference(name) if name == "missing"));
    }

    #[test]
    fn crc_not_terminal_rejected() {
        let err = compile("^%c AA$".replace(' ', "").as_str()).unwrap_err();
        assert!(matches!(err, CompileError::CrcNotAtTerminalPosition(_)));
    }

    #[test]
    fn multiple_length_fields_rejected() {
        let err = compile("^L L$".replace(' ', "").as_str()).unwrap_err();
        assert!(matches!(err, CompileError::ConflictingLengthHint(_, _)));
    }

    #[test]
    fn array_stride_and_array_of_structs_parse() {
        let program = compile("^%3u%2{u,uu}$").unwrap();
        match &program.root {
            MatchNode::Sequence(nodes) => {
                assert!(matches!(&nodes[0], MatchNode::ArrayStride { count: 3, .. }));
                assert!(matches!(&nodes[1], MatchNode::ArrayOfStructs { count: Some(2), fields, .. } if fields.len() == 2));
            }
            _ => panic!("expected sequence root"),
        }
    }

    #[test]
    fn array_of_structs_member_may_be_a_derived_expression() {
        let program = compile("^%2{u,(u _ * 2)}$").unwrap();
        match &program.root {
            MatchNode::Sequence(nodes) => match &nodes[0] {
                MatchNode::ArrayOfStructs { count: Some(2), fields, .. } => {
                    assert_eq!(fields.len(), 2);
                    assert!(matches!(fields[0], StructMember::Field(_)));
                    assert!(matches!(
                        fields[1],
                        StructMember::Expression { condition: false, base: Some(_), .. }
                    ));
                }
                other => panic!("expected ArrayOfStructs, got {other:?}"),
            },
            _ => panic!("expected sequence root"),
        }
    }

    #[test]
    fn array_of_structs_member_may_be_a_guard() {
        let program = compile("^%count:u%2{u,@(count>0)}$").unwrap();
        match &program.root {
            MatchNode::Sequence(nodes) => match &nodes[1] {
                MatchNode::ArrayOfStructs { fields, .. } => {
                    assert!(matches!(
                        fields[1],
                        StructMember::Expression { condition: true, base: None, .. }
                    ));
                }
                other => panic!("expected ArrayOfStructs, got {other:?}"),
            },
            _ => panic!("expected sequence root"),
        }
    }

    #[test]
    fn derived_field_references_current_value() {
        let program = compile("^%(u _ * 2)$").unwrap();
        match &program.root {
            MatchNode::Sequence(nodes) => {
                assert!(matches!(&nodes[0], MatchNode::Expression { base: Some(_), condition: false, .. }));
            }
            _ => panic!("expected sequence root"),
        }
    }

    #[test]
    fn zero_array_count_rejected() {
        let err = compile("^%0u$").unwrap_err();
        assert!(matches!(err, CompileError::ZeroArrayCount(_)));
    }

    #[test]
    fn lookahead_and_skip_until_parse() {
        let program = compile("^&(AA)~BB$").unwrap();
        match &program.root {
            MatchNode::Sequence(nodes) => {
                assert!(matches!(&nodes[0], MatchNode::Lookahead(_)));
                assert!(matches!(&nodes[1], MatchNode::SkipUntil(bytes) if bytes == &vec![0xBB]));
            }
            _ => panic!("expected sequence root"),
        }
    }
}
