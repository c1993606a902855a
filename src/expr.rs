//! Arithmetic and boolean expression sub-engine.
//!
//! Expressions appear in two places in a pattern: derived-field tokens `%(t <expr>)` (arithmetic,
//! produces a float64) and guards `@(<bool-expr>)` (boolean, gates a match). Both share this
//! parser/evaluator; the caller decides which result type it expects.
//!
//! Operands are integer/float literals, references to previously decoded fields by name, and the
//! special identifier `_`, which stands for the value of the base token a derived-field
//! expression is attached to (meaningless, and rejected at compile time, inside a guard).

use std::collections::HashMap;
use std::fmt;

use crate::codec::Value;
use crate::error::{CompileError, DecodeError};

/// The implicit name bound to a derived-field token's freshly-decoded base value.
pub const CURRENT_VALUE_IDENT: &str = "_";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Num(OrderedF64),
    Ident(String),
    Neg(Box<Expr>),
    Arith(BinOp, Box<Expr>, Box<Expr>),
    Compare(CmpOp, Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

/// f64 wrapper giving `Expr` a structural `PartialEq` for tests, without pretending NaN equals
/// itself in the general case (pattern literals are never NaN in practice).
#[derive(Debug, Clone, Copy)]
pub struct OrderedF64(pub f64);

impl PartialEq for OrderedF64 {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bits() == other.0.to_bits()
    }
}

/// Result of evaluating an [`Expr`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExprValue {
    Num(f64),
    Bool(bool),
}

impl ExprValue {
    pub fn as_bool(self) -> Option<bool> {
        match self {
            ExprValue::Bool(b) => Some(b),
            ExprValue::Num(_) => None,
        }
    }

    pub fn as_f64(self) -> Option<f64> {
        match self {
            ExprValue::Num(n) => Some(n),
            ExprValue::Bool(_) => None,
        }
    }
}

impl fmt::Display for ExprValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExprValue::Num(n) => write!(f, "{n}"),
            ExprValue::Bool(b) => write!(f, "{b}"),
        }
    }
}

/// Names bound while evaluating: previously decoded fields, plus `_` for the current base value
/// of a derived-field token (absent for guards).
pub struct Environment<'a> {
    fields: &'a HashMap<String, Value>,
    current: Option<f64>,
}

impl<'a> Environment<'a> {
    pub fn new(fields: &'a HashMap<String, Value>, current: Option<f64>) -> Self {
        Environment { fields, current }
    }

    fn lookup(&self, name: &str) -> Option<f64> {
        if name == CURRENT_VALUE_IDENT {
            return self.current;
        }
        self.fields.get(name).and_then(Value::as_f64)
    }
}

/// Parse a textual expression into an [`Expr`] tree.
pub fn parse(text: &str) -> Result<Expr, CompileError> {
    let tokens = lex(text)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(CompileError::MalformedExpression(format!(
            "trailing tokens after expression: {:?}",
            &parser.tokens[parser.pos..]
        )));
    }
    Ok(expr)
}

/// Evaluate `expr` against `env`. Division by zero is the only runtime failure mode.
pub fn eval(expr: &Expr, env: &Environment) -> Result<ExprValue, DecodeError> {
    match expr {
        Expr::Num(n) => Ok(ExprValue::Num(n.0)),
        Expr::Ident(name) => {
            let v = env.lookup(name).ok_or(DecodeError::TypeMismatch)?;
            Ok(ExprValue::Num(v))
        }
        Expr::Neg(inner) => {
            let v = as_num(eval(inner, env)?)?;
            Ok(ExprValue::Num(-v))
        }
        Expr::Arith(op, lhs, rhs) => {
            let l = as_num(eval(lhs, env)?)?;
            let r = as_num(eval(rhs, env)?)?;
            let result = match op {
                BinOp::Add => l + r,
                BinOp::Sub => l - r,
                BinOp::Mul => l * r,
                BinOp::Div => {
                    if r == 0.0 {
                        return Err(DecodeError::DivisionByZero);
                    }
                    l / r
                }
            };
            Ok(ExprValue::Num(result))
        }
        Expr::Compare(op, lhs, rhs) => {
            let l = as_num(eval(lhs, env)?)?;
            let r = as_num(eval(rhs, env)?)?;
            let result = match op {
                CmpOp::Lt => l < r,
                CmpOp::Le => l <= r,
                CmpOp::Gt => l > r,
                CmpOp::Ge => l >= r,
                CmpOp::Eq => l == r,
                CmpOp::Ne => l != r,
            };
            Ok(ExprValue::Bool(result))
        }
        Expr::And(lhs, rhs) => {
            let l = as_bool(eval(lhs, env)?)?;
            let r = as_bool(eval(rhs, env)?)?;
            Ok(ExprValue::Bool(l && r))
        }
        Expr::Or(lhs, rhs) => {
            let l = as_bool(eval(lhs, env)?)?;
            let r = as_bool(eval(rhs, env)?)?;
            Ok(ExprValue::Bool(l || r))
        }
    }
}

fn as_num(v: ExprValue) -> Result<f64, DecodeError> {
    v.as_f64().ok_or(DecodeError::TypeMismatch)
}

fn as_bool(v: ExprValue) -> Result<bool, DecodeError> {
    v.as_bool().ok_or(DecodeError::TypeMismatch)
}

/// Returns the set of free identifiers an expression references, so the compiler can check them
/// against the fields defined earlier in the pattern.
pub fn free_identifiers(expr: &Expr) -> Vec<String> {
    let mut names = Vec::new();
    collect_identifiers(expr, &mut names);
    names
}

fn collect_identifiers(expr: &Expr, out: &mut Vec<String>) {
    match expr {
        Expr::Num(_) => {}
        Expr::Ident(name) => out.push(name.clone()),
        Expr::Neg(inner) => collect_identifiers(inner, out),
        Expr::Arith(_, l, r) | Expr::Compare(_, l, r) | Expr::And(l, r) | Expr::Or(l, r) => {
            collect_identifiers(l, out);
            collect_identifiers(r, out);
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
    Lt,
    Le,
    Gt,
    Ge,
    EqEq,
    Ne,
    And,
    Or,
}

fn lex(text: &str) -> Result<Vec<Token>, CompileError> {
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;
    let mut tokens = Vec::new();
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' => i += 1,
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' | '×' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' | '÷' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Le);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '≤' => {
                tokens.push(Token::Le);
                i += 1;
            }
            '≥' => {
                tokens.push(Token::Ge);
                i += 1;
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::EqEq);
                    i += 2;
                } else {
                    return Err(CompileError::MalformedExpression(
                        "expected `==`".to_string(),
                    ));
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ne);
                    i += 2;
                } else {
                    return Err(CompileError::MalformedExpression(
                        "expected `!=`".to_string(),
                    ));
                }
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n: f64 = text
                    .parse()
                    .map_err(|_| CompileError::MalformedExpression(format!("bad number `{text}`")))?;
                tokens.push(Token::Num(n));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let ident: String = chars[start..i].iter().collect();
                match ident.as_str() {
                    "and" => tokens.push(Token::And),
                    "or" => tokens.push(Token::Or),
                    _ => tokens.push(Token::Ident(ident)),
                }
            }
            other => {
                return Err(CompileError::MalformedExpression(format!(
                    "unexpected character `{other}`"
                )))
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn parse_or(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.parse_and()?;
        while matches!(self.peek(), Some(Token::Or)) {
            self.advance();
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.parse_comparison()?;
        while matches!(self.peek(), Some(Token::And)) {
            self.advance();
            let rhs = self.parse_comparison()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_comparison(&mut self) -> Result<Expr, CompileError> {
        let lhs = self.parse_additive()?;
        let op = match self.peek() {
            Some(Token::Lt) => Some(CmpOp::Lt),
            Some(Token::Le) => Some(CmpOp::Le),
            Some(Token::Gt) => Some(CmpOp::Gt),
            Some(Token::Ge) => Some(CmpOp::Ge),
            Some(Token::EqEq) => Some(CmpOp::Eq),
            Some(Token::Ne) => Some(CmpOp::Ne),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let rhs = self.parse_additive()?;
            Ok(Expr::Compare(op, Box::new(lhs), Box::new(rhs)))
        } else {
            Ok(lhs)
        }
    }

    fn parse_additive(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => Some(BinOp::Add),
                Some(Token::Minus) => Some(BinOp::Sub),
                _ => None,
            };
            match op {
                Some(op) => {
                    self.advance();
                    let rhs = self.parse_multiplicative()?;
                    lhs = Expr::Arith(op, Box::new(lhs), Box::new(rhs));
                }
                None => break,
            }
        }
        Ok(lhs)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => Some(BinOp::Mul),
                Some(Token::Slash) => Some(BinOp::Div),
                _ => None,
            };
            match op {
                Some(op) => {
                    self.advance();
                    let rhs = self.parse_unary()?;
                    lhs = Expr::Arith(op, Box::new(lhs), Box::new(rhs));
                }
                None => break,
            }
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, CompileError> {
        if matches!(self.peek(), Some(Token::Minus)) {
            self.advance();
            let inner = self.parse_unary()?;
            Ok(Expr::Neg(Box::new(inner)))
        } else {
            self.parse_primary()
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, CompileError> {
        match self.advance() {
            Some(Token::Num(n)) => Ok(Expr::Num(OrderedF64(n))),
            Some(Token::Ident(name)) => Ok(Expr::Ident(name)),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(CompileError::MalformedExpression(
                        "expected closing `)`".to_string(),
                    )),
                }
            }
            other => Err(CompileError::MalformedExpression(format!(
                "unexpected token {other:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, f64)]) -> HashMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Value::Float(*v)))
            .collect()
    }

    #[test]
    fn arithmetic_precedence() {
        let expr = parse("1 + 2 * 3").unwrap();
        let fields = env(&[]);
        let result = eval(&expr, &Environment::new(&fields, None)).unwrap();
        assert_eq!(result, ExprValue::Num(7.0));
    }

    #[test]
    fn parentheses_override_precedence() {
        let expr = parse("(1 + 2) * 3").unwrap();
        let fields = env(&[]);
        let result = eval(&expr, &Environment::new(&fields, None)).unwrap();
        assert_eq!(result, ExprValue::Num(9.0));
    }

    #[test]
    fn comparison_against_named_field() {
        let expr = parse("value>100").unwrap();
        let fields = env(&[("value", 101.0)]);
        let result = eval(&expr, &Environment::new(&fields, None)).unwrap();
        assert_eq!(result, ExprValue::Bool(true));

        let fields = env(&[("value", 5.0)]);
        let result = eval(&expr, &Environment::new(&fields, None)).unwrap();
        assert_eq!(result, ExprValue::Bool(false));
    }

    #[test]
    fn boolean_and_or() {
        let expr = parse("1 < 2 and 3 > 4 or 5 == 5").unwrap();
        let fields = env(&[]);
        let result = eval(&expr, &Environment::new(&fields, None)).unwrap();
        assert_eq!(result, ExprValue::Bool(true));
    }

    #[test]
    fn division_by_zero_is_a_decode_error() {
        let expr = parse("1 / 0").unwrap();
        let fields = env(&[]);
        let result = eval(&expr, &Environment::new(&fields, None));
        assert_eq!(result, Err(DecodeError::DivisionByZero));
    }

    #[test]
    fn current_value_ident_binds_to_base_token() {
        let expr = parse("_ * 2").unwrap();
        let fields = env(&[]);
        let result = eval(&expr, &Environment::new(&fields, Some(21.0))).unwrap();
        assert_eq!(result, ExprValue::Num(42.0));
    }

    #[test]
    fn free_identifiers_collects_all_field_references() {
        let expr = parse("a + b * (c - 1)").unwrap();
        let mut names = free_identifiers(&expr);
        names.sort();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn unary_minus() {
        let expr = parse("-5 + 3").unwrap();
        let fields = env(&[]);
        let result = eval(&expr, &Environment::new(&fields, None)).unwrap();
        assert_eq!(result, ExprValue::Num(-2.0));
    }

    #[test]
    fn trailing_garbage_is_rejected() {
        assert!(parse("1 + 2 3").is_err());
    }
}
