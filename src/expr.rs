//! Closed expression grammar for formula fields: tokenizer, recursive-descent parser and
//! tree-walking evaluator. Nothing here ever reaches a host interpreter.

use crate::condition::coerce_number;
use crate::formula::{format_date_pattern, format_number, parse_date_text};
use crate::model::{FieldIndex, FieldType};
use chrono::{Duration, NaiveDateTime};
use std::cmp::Ordering;
use std::fmt;

pub const MAX_EXPRESSION_LEN: usize = 4096;
pub const MAX_DEPTH: usize = 64;

// Date shifts beyond this many days are rejected before chrono sees them.
const MAX_DAY_SHIFT: f64 = 100_000_000.0;

#[derive(Debug, Clone, PartialEq)]
pub enum ExprError {
    TooLong(usize),
    TooDeep,
    UnexpectedChar(char),
    UnterminatedString,
    UnterminatedRef,
    EmptyRef,
    UnexpectedToken(String),
    UnexpectedEnd,
    UnknownIdentifier(String),
    UnknownFunction(String),
    Arity { name: &'static str, got: usize },
    NotADate(String),
    DateOutOfRange,
}

impl fmt::Display for ExprError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExprError::TooLong(len) => write!(
                f,
                "expression is {} bytes, limit is {}",
                len, MAX_EXPRESSION_LEN
            ),
            ExprError::TooDeep => write!(f, "expression nests deeper than {}", MAX_DEPTH),
            ExprError::UnexpectedChar(ch) => write!(f, "unexpected character {:?}", ch),
            ExprError::UnterminatedString => write!(f, "unterminated string literal"),
            ExprError::UnterminatedRef => write!(f, "unterminated field reference"),
            ExprError::EmptyRef => write!(f, "empty field reference"),
            ExprError::UnexpectedToken(tok) => write!(f, "unexpected token {}", tok),
            ExprError::UnexpectedEnd => write!(f, "unexpected end of expression"),
            ExprError::UnknownIdentifier(name) => write!(f, "unknown identifier {}", name),
            ExprError::UnknownFunction(name) => write!(f, "unknown function {}", name),
            ExprError::Arity { name, got } => {
                write!(f, "{} does not take {} argument(s)", name, got)
            }
            ExprError::NotADate(raw) => write!(f, "{:?} is not a date", raw),
            ExprError::DateOutOfRange => write!(f, "date arithmetic out of range"),
        }
    }
}

impl std::error::Error for ExprError {}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ref(String),
    Ident(String),
    Op(&'static str),
    LParen,
    RParen,
    Comma,
    Question,
    Colon,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Number(n) => write!(f, "{}", format_number(*n)),
            Token::Str(s) => write!(f, "{:?}", s),
            Token::Ref(id) => write!(f, "${{{}}}", id),
            Token::Ident(name) => f.write_str(name),
            Token::Op(op) => f.write_str(op),
            Token::LParen => f.write_str("("),
            Token::RParen => f.write_str(")"),
            Token::Comma => f.write_str(","),
            Token::Question => f.write_str("?"),
            Token::Colon => f.write_str(":"),
        }
    }
}

const OPERATORS: [&str; 16] = [
    "===", "!==", "<=", ">=", "==", "!=", "&&", "||", "+", "-", "*", "/", "%", "<", ">", "!",
];

fn tokenize(src: &str) -> Result<Vec<Token>, ExprError> {
    let mut tokens = Vec::new();
    let mut rest = src;
    while let Some(ch) = rest.chars().next() {
        if ch.is_whitespace() {
            rest = &rest[ch.len_utf8()..];
            continue;
        }
        if ch.is_ascii_digit()
            || (ch == '.' && rest[1..].starts_with(|c: char| c.is_ascii_digit()))
        {
            let (value, tail) = lex_number(rest);
            tokens.push(Token::Number(value));
            rest = tail;
            continue;
        }
        if ch == '\'' || ch == '"' {
            let (value, tail) = lex_string(&rest[1..], ch)?;
            tokens.push(Token::Str(value));
            rest = tail;
            continue;
        }
        if let Some(body) = rest.strip_prefix("${") {
            let end = body.find('}').ok_or(ExprError::UnterminatedRef)?;
            let id = body[..end].trim();
            if id.is_empty() {
                return Err(ExprError::EmptyRef);
            }
            tokens.push(Token::Ref(id.to_string()));
            rest = &body[end + 1..];
            continue;
        }
        if ch.is_ascii_alphabetic() || ch == '_' {
            let end = rest
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(rest.len());
            tokens.push(Token::Ident(rest[..end].to_string()));
            rest = &rest[end..];
            continue;
        }
        let punct = match ch {
            '(' => Some(Token::LParen),
            ')' => Some(Token::RParen),
            ',' => Some(Token::Comma),
            '?' => Some(Token::Question),
            ':' => Some(Token::Colon),
            _ => None,
        };
        if let Some(tok) = punct {
            tokens.push(tok);
            rest = &rest[1..];
            continue;
        }
        match OPERATORS.iter().find(|op| rest.starts_with(**op)) {
            Some(op) => {
                tokens.push(Token::Op(*op));
                rest = &rest[op.len()..];
            }
            None => return Err(ExprError::UnexpectedChar(ch)),
        }
    }
    Ok(tokens)
}

fn lex_number(src: &str) -> (f64, &str) {
    let bytes = src.as_bytes();
    let mut end = 0;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    if end < bytes.len() && bytes[end] == b'.' {
        end += 1;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
        }
    }
    if end < bytes.len() && (bytes[end] == b'e' || bytes[end] == b'E') {
        let mut exp = end + 1;
        if exp < bytes.len() && (bytes[exp] == b'+' || bytes[exp] == b'-') {
            exp += 1;
        }
        if exp < bytes.len() && bytes[exp].is_ascii_digit() {
            while exp < bytes.len() && bytes[exp].is_ascii_digit() {
                exp += 1;
            }
            end = exp;
        }
    }
    let value = src[..end].parse::<f64>().unwrap_or(f64::NAN);
    (value, &src[end..])
}

fn lex_string(src: &str, quote: char) -> Result<(String, &str), ExprError> {
    let mut out = String::new();
    let mut chars = src.char_indices();
    while let Some((idx, ch)) = chars.next() {
        if ch == quote {
            return Ok((out, &src[idx + ch.len_utf8()..]));
        }
        if ch == '\\' {
            let (_, escaped) = chars.next().ok_or(ExprError::UnterminatedString)?;
            out.push(match escaped {
                'n' => '\n',
                't' => '\t',
                'r' => '\r',
                other => other,
            });
            continue;
        }
        out.push(ch);
    }
    Err(ExprError::UnterminatedString)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    If,
    Today,
    Now,
    FormatDatePattern,
    FormatDate,
    Round,
    Sum,
    Avg,
}

impl Builtin {
    fn lookup(name: &str) -> Option<Builtin> {
        match name.to_ascii_lowercase().as_str() {
            "if" => Some(Builtin::If),
            "today" => Some(Builtin::Today),
            "now" => Some(Builtin::Now),
            "format_date" => Some(Builtin::FormatDatePattern),
            "formatdate" => Some(Builtin::FormatDate),
            "round" => Some(Builtin::Round),
            "sum" => Some(Builtin::Sum),
            "avg" => Some(Builtin::Avg),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Builtin::If => "IF",
            Builtin::Today => "TODAY",
            Builtin::Now => "NOW",
            Builtin::FormatDatePattern => "FORMAT_DATE",
            Builtin::FormatDate => "formatDate",
            Builtin::Round => "round",
            Builtin::Sum => "sum",
            Builtin::Avg => "avg",
        }
    }

    fn accepts(self, argc: usize) -> bool {
        match self {
            Builtin::If => argc == 3,
            Builtin::Today | Builtin::Now => argc == 0,
            Builtin::FormatDatePattern => argc == 2,
            Builtin::FormatDate => argc == 1,
            Builtin::Round => argc == 1 || argc == 2,
            Builtin::Sum | Builtin::Avg => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Plus,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    StrictEq,
    StrictNe,
}

impl BinaryOp {
    fn from_op(op: &str) -> Option<BinaryOp> {
        Some(match op {
            "+" => BinaryOp::Add,
            "-" => BinaryOp::Sub,
            "*" => BinaryOp::Mul,
            "/" => BinaryOp::Div,
            "%" => BinaryOp::Rem,
            "<" => BinaryOp::Lt,
            "<=" => BinaryOp::Le,
            ">" => BinaryOp::Gt,
            ">=" => BinaryOp::Ge,
            "==" => BinaryOp::Eq,
            "!=" => BinaryOp::Ne,
            "===" => BinaryOp::StrictEq,
            "!==" => BinaryOp::StrictNe,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Str(String),
    Bool(bool),
    Ref(String),
    Unary(UnaryOp, Box<Expr>),
    /// Left-associative run of same-precedence operators: `first op1 e1 op2 e2 ...`.
    Binary(Box<Expr>, Vec<(BinaryOp, Expr)>),
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
    Call(Builtin, Vec<Expr>),
}

pub fn parse(src: &str) -> Result<Expr, ExprError> {
    if src.len() > MAX_EXPRESSION_LEN {
        return Err(ExprError::TooLong(src.len()));
    }
    let tokens = tokenize(src)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let expr = parser.expression()?;
    match parser.next() {
        None => Ok(expr),
        Some(tok) => Err(ExprError::UnexpectedToken(tok.to_string())),
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: Token) -> Result<(), ExprError> {
        match self.next() {
            Some(tok) if tok == expected => Ok(()),
            Some(tok) => Err(ExprError::UnexpectedToken(tok.to_string())),
            None => Err(ExprError::UnexpectedEnd),
        }
    }

    fn peek_op(&self) -> Option<&'static str> {
        match self.peek() {
            Some(Token::Op(op)) => Some(*op),
            _ => None,
        }
    }

    fn descend(&mut self) -> Result<(), ExprError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(ExprError::TooDeep);
        }
        Ok(())
    }

    fn expression(&mut self) -> Result<Expr, ExprError> {
        self.descend()?;
        let cond = self.logical_or()?;
        let out = if self.eat(&Token::Question) {
            let then = self.expression()?;
            self.expect(Token::Colon)?;
            let otherwise = self.expression()?;
            Expr::Ternary(Box::new(cond), Box::new(then), Box::new(otherwise))
        } else {
            cond
        };
        self.depth -= 1;
        Ok(out)
    }

    // Operator runs stay flat: tree height follows nesting, not term count.
    fn logical_or(&mut self) -> Result<Expr, ExprError> {
        let mut terms = vec![self.logical_and()?];
        while self.peek_op() == Some("||") {
            self.pos += 1;
            terms.push(self.logical_and()?);
        }
        Ok(match terms.len() {
            1 => terms.remove(0),
            _ => Expr::Or(terms),
        })
    }

    fn logical_and(&mut self) -> Result<Expr, ExprError> {
        let mut terms = vec![self.binary_level(0)?];
        while self.peek_op() == Some("&&") {
            self.pos += 1;
            terms.push(self.binary_level(0)?);
        }
        Ok(match terms.len() {
            1 => terms.remove(0),
            _ => Expr::And(terms),
        })
    }

    // Levels, loosest first: equality, comparison, additive, multiplicative.
    fn binary_level(&mut self, level: usize) -> Result<Expr, ExprError> {
        const LEVELS: [&[&str]; 4] = [
            &["==", "!=", "===", "!=="],
            &["<", "<=", ">", ">="],
            &["+", "-"],
            &["*", "/", "%"],
        ];
        if level == LEVELS.len() {
            return self.unary();
        }
        let first = self.binary_level(level + 1)?;
        let mut rest = Vec::new();
        while let Some(op) = self.peek_op().filter(|op| LEVELS[level].contains(op)) {
            self.pos += 1;
            let Some(bin) = BinaryOp::from_op(op) else {
                return Err(ExprError::UnexpectedToken(op.to_string()));
            };
            rest.push((bin, self.binary_level(level + 1)?));
        }
        if rest.is_empty() {
            Ok(first)
        } else {
            Ok(Expr::Binary(Box::new(first), rest))
        }
    }

    fn unary(&mut self) -> Result<Expr, ExprError> {
        let op = match self.peek_op() {
            Some("-") => Some(UnaryOp::Neg),
            Some("+") => Some(UnaryOp::Plus),
            Some("!") => Some(UnaryOp::Not),
            _ => None,
        };
        let Some(op) = op else {
            return self.primary();
        };
        self.pos += 1;
        self.descend()?;
        let operand = self.unary()?;
        self.depth -= 1;
        Ok(Expr::Unary(op, Box::new(operand)))
    }

    fn primary(&mut self) -> Result<Expr, ExprError> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Str(s)) => Ok(Expr::Str(s)),
            Some(Token::Ref(id)) => Ok(Expr::Ref(id)),
            Some(Token::LParen) => {
                let inner = self.expression()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => self.identifier(name),
            Some(tok) => Err(ExprError::UnexpectedToken(tok.to_string())),
            None => Err(ExprError::UnexpectedEnd),
        }
    }

    fn identifier(&mut self, name: String) -> Result<Expr, ExprError> {
        if !self.eat(&Token::LParen) {
            return match name.as_str() {
                "true" => Ok(Expr::Bool(true)),
                "false" => Ok(Expr::Bool(false)),
                _ => Err(ExprError::UnknownIdentifier(name)),
            };
        }
        let builtin = Builtin::lookup(&name).ok_or(ExprError::UnknownFunction(name))?;
        let mut args = Vec::new();
        if !self.eat(&Token::RParen) {
            loop {
                args.push(self.expression()?);
                if self.eat(&Token::Comma) {
                    continue;
                }
                self.expect(Token::RParen)?;
                break;
            }
        }
        if !builtin.accepts(args.len()) {
            return Err(ExprError::Arity {
                name: builtin.name(),
                got: args.len(),
            });
        }
        Ok(Expr::Call(builtin, args))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Number(f64),
    Str(String),
    Bool(bool),
    Date { at: NaiveDateTime, with_time: bool },
    /// A reference to a missing or empty field.
    Missing,
}

impl Value {
    pub fn to_number(&self) -> f64 {
        match self {
            Value::Number(n) => *n,
            Value::Str(s) => coerce_number(s),
            Value::Bool(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            Value::Date { .. } => f64::NAN,
            Value::Missing => 0.0,
        }
    }

    /// Text used for concatenation and string helpers.
    pub fn to_text(&self) -> String {
        match self {
            Value::Number(n) => format_number(*n),
            Value::Str(s) => s.clone(),
            Value::Bool(b) => b.to_string(),
            Value::Date { at, with_time } => format_date_value(at, *with_time),
            Value::Missing => String::new(),
        }
    }

    /// Text of a top-level result; a missing value reads as zero.
    pub fn into_result_text(self) -> String {
        match self {
            Value::Missing => "0".to_string(),
            Value::Str(s) => s,
            other => other.to_text(),
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::Str(s) => !s.is_empty(),
            Value::Bool(b) => *b,
            Value::Date { .. } => true,
            Value::Missing => false,
        }
    }

    fn condition_truthy(&self) -> bool {
        match self {
            Value::Str(s) if s == "true" => true,
            Value::Str(s) if s == "false" => false,
            other => other.truthy(),
        }
    }

    fn numeric_operand(self) -> Value {
        match self {
            Value::Missing => Value::Number(0.0),
            other => other,
        }
    }

    fn as_date(&self) -> Result<Option<(NaiveDateTime, bool)>, ExprError> {
        match self {
            Value::Date { at, with_time } => Ok(Some((*at, *with_time))),
            Value::Missing => Ok(None),
            Value::Str(s) if s.trim().is_empty() => Ok(None),
            other => {
                let text = other.to_text();
                parse_date_text(&text)
                    .map(Some)
                    .ok_or(ExprError::NotADate(text))
            }
        }
    }
}

fn format_date_value(at: &NaiveDateTime, with_time: bool) -> String {
    if with_time {
        at.format("%Y-%m-%dT%H:%M:%S").to_string()
    } else {
        at.format("%Y-%m-%d").to_string()
    }
}

fn shift_days(at: NaiveDateTime, days: f64) -> Result<NaiveDateTime, ExprError> {
    if !days.is_finite() || days.abs() > MAX_DAY_SHIFT {
        return Err(ExprError::DateOutOfRange);
    }
    at.checked_add_signed(Duration::days(days.trunc() as i64))
        .ok_or(ExprError::DateOutOfRange)
}

/// Evaluation environment: the field snapshot and the clock used by `TODAY()`/`NOW()`.
pub struct Scope<'s, 'a> {
    fields: &'s FieldIndex<'a>,
    now: NaiveDateTime,
}

impl<'s, 'a> Scope<'s, 'a> {
    pub fn new(fields: &'s FieldIndex<'a>, now: NaiveDateTime) -> Self {
        Self { fields, now }
    }

    pub fn eval(&self, expr: &Expr) -> Result<Value, ExprError> {
        match expr {
            Expr::Number(n) => Ok(Value::Number(*n)),
            Expr::Str(s) => Ok(Value::Str(s.clone())),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Ref(id) => Ok(self.resolve(id)),
            Expr::Unary(op, operand) => {
                let value = self.eval(operand)?;
                Ok(match op {
                    UnaryOp::Neg => Value::Number(-value.to_number()),
                    UnaryOp::Plus => Value::Number(value.to_number()),
                    UnaryOp::Not => Value::Bool(!value.truthy()),
                })
            }
            Expr::And(terms) => {
                let mut last = Value::Bool(true);
                for term in terms {
                    last = self.eval(term)?;
                    if !last.truthy() {
                        break;
                    }
                }
                Ok(last)
            }
            Expr::Or(terms) => {
                let mut last = Value::Bool(false);
                for term in terms {
                    last = self.eval(term)?;
                    if last.truthy() {
                        break;
                    }
                }
                Ok(last)
            }
            Expr::Ternary(cond, then, otherwise) => {
                if self.eval(cond)?.truthy() {
                    self.eval(then)
                } else {
                    self.eval(otherwise)
                }
            }
            Expr::Binary(first, rest) => {
                let mut acc = self.eval(first)?;
                for (op, rhs) in rest {
                    let right = self.eval(rhs)?;
                    acc = binary(*op, acc, right)?;
                }
                Ok(acc)
            }
            Expr::Call(builtin, args) => self.call(*builtin, args),
        }
    }

    fn resolve(&self, id: &str) -> Value {
        let Some(field) = self.fields.get(id) else {
            return Value::Missing;
        };
        let raw = field.value.as_str();
        if raw.is_empty() {
            return Value::Missing;
        }
        if field.field_type == FieldType::Date {
            if let Some((at, with_time)) = parse_date_text(raw) {
                return Value::Date { at, with_time };
            }
        }
        let n = coerce_number(raw);
        if !raw.trim().is_empty() && !n.is_nan() {
            return Value::Number(n);
        }
        Value::Str(raw.to_string())
    }

    fn call(&self, builtin: Builtin, args: &[Expr]) -> Result<Value, ExprError> {
        match builtin {
            Builtin::If => {
                // A condition that fails to evaluate counts as false.
                let holds = self
                    .eval(&args[0])
                    .map(|v| v.condition_truthy())
                    .unwrap_or(false);
                self.eval(if holds { &args[1] } else { &args[2] })
            }
            Builtin::Today => Ok(Value::Date {
                at: self.now.date().and_time(chrono::NaiveTime::MIN),
                with_time: false,
            }),
            Builtin::Now => Ok(Value::Date {
                at: self.now,
                with_time: true,
            }),
            Builtin::FormatDatePattern => {
                let date = self.eval(&args[0])?.as_date()?;
                let pattern = self.eval(&args[1])?.to_text();
                Ok(Value::Str(match date {
                    Some((at, _)) => format_date_pattern(&at, &pattern),
                    None => String::new(),
                }))
            }
            Builtin::FormatDate => {
                let date = self.eval(&args[0])?.as_date()?;
                Ok(Value::Str(match date {
                    Some((at, _)) => format_date_value(&at, false),
                    None => String::new(),
                }))
            }
            Builtin::Round => {
                let n = self.eval(&args[0])?.to_number();
                let decimals = match args.get(1) {
                    Some(arg) => self.eval(arg)?.to_number(),
                    None => 0.0,
                };
                Ok(Value::Number(round_half_up(n, decimals)))
            }
            Builtin::Sum => {
                let mut total = 0.0;
                for arg in args {
                    let n = self.eval(arg)?.to_number();
                    if !n.is_nan() {
                        total += n;
                    }
                }
                Ok(Value::Number(total))
            }
            Builtin::Avg => {
                let mut total = 0.0;
                let mut count = 0usize;
                for arg in args {
                    let value = self.eval(arg)?;
                    if value == Value::Missing {
                        continue;
                    }
                    let n = value.to_number();
                    if !n.is_nan() {
                        total += n;
                        count += 1;
                    }
                }
                Ok(Value::Number(if count == 0 {
                    0.0
                } else {
                    total / count as f64
                }))
            }
        }
    }
}

fn round_half_up(n: f64, decimals: f64) -> f64 {
    let decimals = if decimals.is_finite() {
        decimals.trunc().clamp(-15.0, 15.0)
    } else {
        0.0
    };
    let factor = 10f64.powi(decimals as i32);
    (n * factor + 0.5).floor() / factor
}

fn binary(op: BinaryOp, left: Value, right: Value) -> Result<Value, ExprError> {
    match op {
        BinaryOp::Add => add(left, right),
        BinaryOp::Sub => subtract(left, right),
        BinaryOp::Mul => Ok(Value::Number(left.to_number() * right.to_number())),
        BinaryOp::Div => Ok(Value::Number(left.to_number() / right.to_number())),
        BinaryOp::Rem => Ok(Value::Number(left.to_number() % right.to_number())),
        BinaryOp::Lt => Ok(Value::Bool(compare(&left, &right) == Some(Ordering::Less))),
        BinaryOp::Le => Ok(Value::Bool(matches!(
            compare(&left, &right),
            Some(Ordering::Less | Ordering::Equal)
        ))),
        BinaryOp::Gt => Ok(Value::Bool(compare(&left, &right) == Some(Ordering::Greater))),
        BinaryOp::Ge => Ok(Value::Bool(matches!(
            compare(&left, &right),
            Some(Ordering::Greater | Ordering::Equal)
        ))),
        BinaryOp::Eq => Ok(Value::Bool(loose_eq(left, right))),
        BinaryOp::Ne => Ok(Value::Bool(!loose_eq(left, right))),
        BinaryOp::StrictEq => Ok(Value::Bool(strict_eq(left, right))),
        BinaryOp::StrictNe => Ok(Value::Bool(!strict_eq(left, right))),
    }
}

fn add(left: Value, right: Value) -> Result<Value, ExprError> {
    match (left, right) {
        (Value::Date { at, with_time }, other) | (other, Value::Date { at, with_time })
            if matches!(other, Value::Number(_) | Value::Missing) =>
        {
            Ok(Value::Date {
                at: shift_days(at, other.to_number())?,
                with_time,
            })
        }
        (l, r) if matches!(l, Value::Str(_)) || matches!(r, Value::Str(_)) => {
            Ok(Value::Str(format!("{}{}", l.to_text(), r.to_text())))
        }
        (l, r) => Ok(Value::Number(l.to_number() + r.to_number())),
    }
}

fn subtract(left: Value, right: Value) -> Result<Value, ExprError> {
    match (left, right) {
        (Value::Date { at: a, .. }, Value::Date { at: b, .. }) => {
            Ok(Value::Number((a - b).num_days() as f64))
        }
        (Value::Date { at, with_time }, other)
            if matches!(other, Value::Number(_) | Value::Missing) =>
        {
            Ok(Value::Date {
                at: shift_days(at, -other.to_number())?,
                with_time,
            })
        }
        (l, r) => Ok(Value::Number(l.to_number() - r.to_number())),
    }
}

fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
        (Value::Date { at: a, .. }, Value::Date { at: b, .. }) => Some(a.cmp(b)),
        (l, r) => l.to_number().partial_cmp(&r.to_number()),
    }
}

fn loose_eq(left: Value, right: Value) -> bool {
    match (left.numeric_operand(), right.numeric_operand()) {
        (Value::Number(a), Value::Number(b)) => a == b,
        (Value::Str(a), Value::Str(b)) => a == b,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Date { at: a, .. }, Value::Date { at: b, .. }) => a == b,
        (d @ Value::Date { .. }, Value::Str(s)) | (Value::Str(s), d @ Value::Date { .. }) => {
            d.to_text() == s
        }
        (Value::Date { .. }, _) | (_, Value::Date { .. }) => false,
        (l, r) => l.to_number() == r.to_number(),
    }
}

fn strict_eq(left: Value, right: Value) -> bool {
    match (left.numeric_operand(), right.numeric_operand()) {
        (Value::Number(a), Value::Number(b)) => a == b,
        (Value::Str(a), Value::Str(b)) => a == b,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Date { at: a, .. }, Value::Date { at: b, .. }) => a == b,
        _ => false,
    }
}
