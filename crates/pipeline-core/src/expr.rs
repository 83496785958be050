//! Condition and template expression evaluation.
//!
//! Two modes exist: boolean expressions gate steps and specifications,
//! template strings (`... ${expr} ...`) produce step scripts, artifact
//! options, and job name overrides. Both evaluate against the run context
//! tree (see [`crate::context`]).

use std::collections::BTreeMap;

use thiserror::Error;

use crate::value::Value;

#[derive(Debug, Error, PartialEq)]
pub enum ExprError {
    #[error("failed to parse expression: {0}")]
    Parse(String),
    #[error("failed to evaluate expression: {0}")]
    Eval(String),
    #[error("condition must evaluate to bool, got {0}")]
    NotBool(&'static str),
    #[error("template expression must produce a scalar, got {0}")]
    NotScalar(&'static str),
}

pub type Result<T> = std::result::Result<T, ExprError>;

/// Evaluate a boolean condition expression. Any non-bool result is an
/// error rather than being coerced.
pub fn eval_bool(src: &str, scope: &Value) -> Result<bool> {
    match eval_expr(src, scope)? {
        Value::Bool(b) => Ok(b),
        other => Err(ExprError::NotBool(other.type_name())),
    }
}

/// Evaluate a template string, interpolating each `${expr}` segment.
/// `$${` escapes a literal `${`.
pub fn eval_template(src: &str, scope: &Value) -> Result<String> {
    let mut out = String::with_capacity(src.len());
    let bytes = src.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'$' && src[i..].starts_with("$${") {
            out.push_str("${");
            i += 3;
            continue;
        }
        if bytes[i] == b'$' && src[i..].starts_with("${") {
            let inner_start = i + 2;
            let inner_end = find_closing_brace(src, inner_start)?;
            let value = eval_expr(&src[inner_start..inner_end], scope)?;
            let rendered = value
                .render()
                .ok_or(ExprError::NotScalar(value.type_name()))?;
            out.push_str(&rendered);
            i = inner_end + 1;
            continue;
        }
        let ch = src[i..].chars().next().unwrap_or('\0');
        out.push(ch);
        i += ch.len_utf8();
    }

    Ok(out)
}

/// Evaluate a bare expression to a value.
pub fn eval_expr(src: &str, scope: &Value) -> Result<Value> {
    let tokens = lex(src)?;
    let mut parser = Parser::new(tokens);
    let expr = parser.parse_or()?;
    parser.expect_end()?;
    eval(&expr, scope)
}

/// Find the `}` terminating a `${` segment, accounting for nested braces
/// and string literals within the expression.
fn find_closing_brace(src: &str, start: usize) -> Result<usize> {
    let bytes = src.as_bytes();
    let mut depth = 1usize;
    let mut in_string = false;
    let mut i = start;

    while i < bytes.len() {
        let b = bytes[i];
        if in_string {
            match b {
                b'\\' => i += 1,
                b'"' => in_string = false,
                _ => {}
            }
        } else {
            match b {
                b'"' => in_string = true,
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(i);
                    }
                }
                _ => {}
            }
        }
        i += 1;
    }

    Err(ExprError::Parse("unterminated template segment".to_string()))
}

// --- Lexer ---

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Int(i64),
    Float(f64),
    True,
    False,
    Null,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Dot,
    Comma,
    Bang,
    EqEq,
    BangEq,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
}

fn lex(src: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = src.char_indices().peekable();

    while let Some(&(pos, ch)) = chars.peek() {
        match ch {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '[' => {
                chars.next();
                tokens.push(Token::LBracket);
            }
            ']' => {
                chars.next();
                tokens.push(Token::RBracket);
            }
            '.' => {
                chars.next();
                tokens.push(Token::Dot);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '=' => {
                chars.next();
                match chars.peek() {
                    Some(&(_, '=')) => {
                        chars.next();
                        tokens.push(Token::EqEq);
                    }
                    _ => return Err(ExprError::Parse("expected '=='".to_string())),
                }
            }
            '!' => {
                chars.next();
                if let Some(&(_, '=')) = chars.peek() {
                    chars.next();
                    tokens.push(Token::BangEq);
                } else {
                    tokens.push(Token::Bang);
                }
            }
            '<' => {
                chars.next();
                if let Some(&(_, '=')) = chars.peek() {
                    chars.next();
                    tokens.push(Token::Le);
                } else {
                    tokens.push(Token::Lt);
                }
            }
            '>' => {
                chars.next();
                if let Some(&(_, '=')) = chars.peek() {
                    chars.next();
                    tokens.push(Token::Ge);
                } else {
                    tokens.push(Token::Gt);
                }
            }
            '&' => {
                chars.next();
                match chars.peek() {
                    Some(&(_, '&')) => {
                        chars.next();
                        tokens.push(Token::AndAnd);
                    }
                    _ => return Err(ExprError::Parse("expected '&&'".to_string())),
                }
            }
            '|' => {
                chars.next();
                match chars.peek() {
                    Some(&(_, '|')) => {
                        chars.next();
                        tokens.push(Token::OrOr);
                    }
                    _ => return Err(ExprError::Parse("expected '||'".to_string())),
                }
            }
            '"' => {
                chars.next();
                tokens.push(Token::Str(lex_string(&mut chars)?));
            }
            c if c.is_ascii_digit() => {
                tokens.push(lex_number(src, &mut chars));
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut end = pos;
                while let Some(&(next_pos, next_ch)) = chars.peek() {
                    if next_ch.is_alphanumeric() || next_ch == '_' || next_ch == '-' {
                        end = next_pos + next_ch.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                let ident = &src[pos..end];
                tokens.push(match ident {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    _ => Token::Ident(ident.to_string()),
                });
            }
            other => {
                return Err(ExprError::Parse(format!("unexpected character {other:?}")));
            }
        }
    }

    Ok(tokens)
}

fn lex_string(chars: &mut std::iter::Peekable<std::str::CharIndices<'_>>) -> Result<String> {
    let mut out = String::new();
    while let Some((_, ch)) = chars.next() {
        match ch {
            '"' => return Ok(out),
            '\\' => match chars.next() {
                Some((_, 'n')) => out.push('\n'),
                Some((_, 't')) => out.push('\t'),
                Some((_, escaped)) => out.push(escaped),
                None => break,
            },
            _ => out.push(ch),
        }
    }
    Err(ExprError::Parse("unterminated string literal".to_string()))
}

fn lex_number(src: &str, chars: &mut std::iter::Peekable<std::str::CharIndices<'_>>) -> Token {
    let start = chars.peek().map(|&(p, _)| p).unwrap_or_default();
    let mut end = start;
    let mut is_float = false;

    while let Some(&(pos, ch)) = chars.peek() {
        if ch.is_ascii_digit() {
            end = pos + 1;
            chars.next();
        } else if ch == '.' && !is_float {
            // Only consume the dot when a digit follows; otherwise it is
            // attribute traversal on a number-like identifier.
            let mut lookahead = chars.clone();
            lookahead.next();
            match lookahead.peek() {
                Some(&(_, next)) if next.is_ascii_digit() => {
                    is_float = true;
                    end = pos + 1;
                    chars.next();
                }
                _ => break,
            }
        } else {
            break;
        }
    }

    let text = &src[start..end];
    if is_float {
        Token::Float(text.parse().unwrap_or(0.0))
    } else {
        Token::Int(text.parse().unwrap_or(0))
    }
}

// --- Parser ---

#[derive(Debug, Clone, Copy, PartialEq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug)]
enum Expr {
    Lit(Value),
    Var(String),
    Attr(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Cmp(Box<Expr>, CmpOp, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &Token) -> Result<()> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(ExprError::Parse(format!(
                "expected {token:?}, found {:?}",
                self.peek()
            )))
        }
    }

    fn expect_end(&self) -> Result<()> {
        if self.pos == self.tokens.len() {
            Ok(())
        } else {
            Err(ExprError::Parse(format!(
                "unexpected trailing token {:?}",
                self.tokens[self.pos]
            )))
        }
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut left = self.parse_and()?;
        while self.eat(&Token::OrOr) {
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut left = self.parse_equality()?;
        while self.eat(&Token::AndAnd) {
            let right = self.parse_equality()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expr> {
        let mut left = self.parse_comparison()?;
        loop {
            let op = if self.eat(&Token::EqEq) {
                CmpOp::Eq
            } else if self.eat(&Token::BangEq) {
                CmpOp::Ne
            } else {
                return Ok(left);
            };
            let right = self.parse_comparison()?;
            left = Expr::Cmp(Box::new(left), op, Box::new(right));
        }
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        let mut left = self.parse_unary()?;
        loop {
            let op = if self.eat(&Token::Lt) {
                CmpOp::Lt
            } else if self.eat(&Token::Le) {
                CmpOp::Le
            } else if self.eat(&Token::Gt) {
                CmpOp::Gt
            } else if self.eat(&Token::Ge) {
                CmpOp::Ge
            } else {
                return Ok(left);
            };
            let right = self.parse_unary()?;
            left = Expr::Cmp(Box::new(left), op, Box::new(right));
        }
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        if self.eat(&Token::Bang) {
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            if self.eat(&Token::Dot) {
                match self.next() {
                    Some(Token::Ident(name)) => {
                        expr = Expr::Attr(Box::new(expr), name);
                    }
                    other => {
                        return Err(ExprError::Parse(format!(
                            "expected attribute name after '.', found {other:?}"
                        )));
                    }
                }
            } else if self.eat(&Token::LBracket) {
                let index = self.parse_or()?;
                self.expect(&Token::RBracket)?;
                expr = Expr::Index(Box::new(expr), Box::new(index));
            } else {
                return Ok(expr);
            }
        }
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::Int(i)) => Ok(Expr::Lit(Value::Int(i))),
            Some(Token::Float(f)) => Ok(Expr::Lit(Value::Float(f))),
            Some(Token::Str(s)) => Ok(Expr::Lit(Value::String(s))),
            Some(Token::True) => Ok(Expr::Lit(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Lit(Value::Bool(false))),
            Some(Token::Null) => Ok(Expr::Lit(Value::Null)),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => {
                if self.eat(&Token::LParen) {
                    let mut args = Vec::new();
                    if !self.eat(&Token::RParen) {
                        loop {
                            args.push(self.parse_or()?);
                            if self.eat(&Token::RParen) {
                                break;
                            }
                            self.expect(&Token::Comma)?;
                        }
                    }
                    Ok(Expr::Call(name, args))
                } else {
                    Ok(Expr::Var(name))
                }
            }
            other => Err(ExprError::Parse(format!(
                "unexpected token {other:?} in expression"
            ))),
        }
    }
}

// --- Evaluation ---

fn eval(expr: &Expr, scope: &Value) -> Result<Value> {
    match expr {
        Expr::Lit(value) => Ok(value.clone()),
        Expr::Var(name) => scope
            .get(name)
            .cloned()
            .ok_or_else(|| ExprError::Eval(format!("unknown variable {name:?}"))),
        Expr::Attr(base, name) => {
            let base = eval(base, scope)?;
            match base {
                Value::Map(entries) => entries
                    .get(name.as_str())
                    .cloned()
                    .ok_or_else(|| ExprError::Eval(format!("unknown attribute {name:?}"))),
                other => Err(ExprError::Eval(format!(
                    "cannot access attribute {name:?} on {}",
                    other.type_name()
                ))),
            }
        }
        Expr::Index(base, index) => {
            let base = eval(base, scope)?;
            let index = eval(index, scope)?;
            match (&base, &index) {
                (Value::Map(entries), Value::String(key)) => entries
                    .get(key)
                    .cloned()
                    .ok_or_else(|| ExprError::Eval(format!("unknown key {key:?}"))),
                (Value::List(items), Value::Int(i)) => {
                    let idx = usize::try_from(*i)
                        .map_err(|_| ExprError::Eval(format!("invalid list index {i}")))?;
                    items
                        .get(idx)
                        .cloned()
                        .ok_or_else(|| ExprError::Eval(format!("list index {i} out of bounds")))
                }
                _ => Err(ExprError::Eval(format!(
                    "cannot index {} with {}",
                    base.type_name(),
                    index.type_name()
                ))),
            }
        }
        Expr::Not(inner) => match eval(inner, scope)? {
            Value::Bool(b) => Ok(Value::Bool(!b)),
            other => Err(ExprError::Eval(format!(
                "operator '!' requires bool, got {}",
                other.type_name()
            ))),
        },
        Expr::Cmp(left, op, right) => {
            let left = eval(left, scope)?;
            let right = eval(right, scope)?;
            eval_cmp(&left, *op, &right)
        }
        Expr::And(left, right) => match eval(left, scope)? {
            Value::Bool(false) => Ok(Value::Bool(false)),
            Value::Bool(true) => match eval(right, scope)? {
                Value::Bool(b) => Ok(Value::Bool(b)),
                other => Err(non_bool_operand("&&", &other)),
            },
            other => Err(non_bool_operand("&&", &other)),
        },
        Expr::Or(left, right) => match eval(left, scope)? {
            Value::Bool(true) => Ok(Value::Bool(true)),
            Value::Bool(false) => match eval(right, scope)? {
                Value::Bool(b) => Ok(Value::Bool(b)),
                other => Err(non_bool_operand("||", &other)),
            },
            other => Err(non_bool_operand("||", &other)),
        },
        Expr::Call(name, args) => eval_call(name, args, scope),
    }
}

fn non_bool_operand(op: &str, value: &Value) -> ExprError {
    ExprError::Eval(format!(
        "operator {op:?} requires bool operands, got {}",
        value.type_name()
    ))
}

fn eval_cmp(left: &Value, op: CmpOp, right: &Value) -> Result<Value> {
    match op {
        CmpOp::Eq => Ok(Value::Bool(left.loose_eq(right))),
        CmpOp::Ne => Ok(Value::Bool(!left.loose_eq(right))),
        CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => {
            let (Some(a), Some(b)) = (left.as_number(), right.as_number()) else {
                return Err(ExprError::Eval(format!(
                    "ordering comparison requires numbers, got {} and {}",
                    left.type_name(),
                    right.type_name()
                )));
            };
            let result = match op {
                CmpOp::Lt => a < b,
                CmpOp::Le => a <= b,
                CmpOp::Gt => a > b,
                CmpOp::Ge => a >= b,
                CmpOp::Eq | CmpOp::Ne => unreachable!(),
            };
            Ok(Value::Bool(result))
        }
    }
}

fn eval_call(name: &str, args: &[Expr], _scope: &Value) -> Result<Value> {
    match name {
        // Used on conditions that must fire even after earlier failures.
        "always" => {
            if args.is_empty() {
                Ok(Value::Bool(true))
            } else {
                Err(ExprError::Eval("always() takes no arguments".to_string()))
            }
        }
        _ => Err(ExprError::Eval(format!("unknown function {name:?}"))),
    }
}
