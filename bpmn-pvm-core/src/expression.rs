//! Expression evaluation collaborator.
//!
//! The core only needs `evaluate(expression, scope) -> Value`. Hosts plug in
//! their own language through [`ExpressionEvaluator`]; the built-in
//! [`SimpleExpressionEvaluator`] covers literals, variable paths,
//! comparisons, boolean connectives and integer/float arithmetic, written
//! either bare (`amount > 100`) or wrapped (`${amount > 100}`).

use crate::error::{EngineError, EngineResult};
use crate::types::{Value, Variables};
use std::cmp::Ordering;

/// Read access to the variables visible from an execution.
pub trait VariableScope {
    fn variable(&self, name: &str) -> Option<Value>;
}

impl VariableScope for Variables {
    fn variable(&self, name: &str) -> Option<Value> {
        self.get(name).cloned()
    }
}

pub trait ExpressionEvaluator: Send + Sync {
    fn evaluate(&self, expression: &str, scope: &dyn VariableScope) -> EngineResult<Value>;
}

/// Evaluate and require a boolean result.
pub fn evaluate_bool(
    evaluator: &dyn ExpressionEvaluator,
    expression: &str,
    scope: &dyn VariableScope,
) -> EngineResult<bool> {
    match evaluator.evaluate(expression, scope)? {
        Value::Bool(b) => Ok(b),
        other => Err(type_error(expression, "a boolean", &other)),
    }
}

/// Evaluate and require a non-negative integer result.
pub fn evaluate_count(
    evaluator: &dyn ExpressionEvaluator,
    expression: &str,
    scope: &dyn VariableScope,
) -> EngineResult<usize> {
    let value = evaluator.evaluate(expression, scope)?;
    if let Some(n) = value.as_u64() {
        return Ok(n as usize);
    }
    if let Some(s) = value.as_str() {
        if let Ok(n) = s.trim().parse::<usize>() {
            return Ok(n);
        }
    }
    Err(type_error(expression, "a non-negative integer", &value))
}

fn type_error(expression: &str, expected: &str, got: &Value) -> EngineError {
    EngineError::Expression {
        expression: expression.to_string(),
        message: format!("expected {expected}, got {got}"),
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SimpleExpressionEvaluator;

impl ExpressionEvaluator for SimpleExpressionEvaluator {
    fn evaluate(&self, expression: &str, scope: &dyn VariableScope) -> EngineResult<Value> {
        let body = strip_delimiters(expression);
        let fail = |message: String| EngineError::Expression {
            expression: expression.to_string(),
            message,
        };
        let tokens = tokenize(body).map_err(fail)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
            scope,
        };
        let value = parser.expr().map_err(fail)?;
        if parser.pos != parser.tokens.len() {
            return Err(fail(format!("unexpected trailing input at token {}", parser.pos)));
        }
        Ok(value)
    }
}

fn strip_delimiters(expression: &str) -> &str {
    let trimmed = expression.trim();
    for open in ["${", "#{"] {
        if let Some(inner) = trimmed.strip_prefix(open).and_then(|s| s.strip_suffix('}')) {
            return inner.trim();
        }
    }
    trimmed
}

// ─── Lexer ────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    Op(&'static str),
    LParen,
    RParen,
}

const OPERATORS: [&str; 14] = [
    "==", "!=", "<=", ">=", "&&", "||", "<", ">", "!", "+", "-", "*", "/", "%",
];

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c == '(' {
            tokens.push(Token::LParen);
            i += 1;
            continue;
        }
        if c == ')' {
            tokens.push(Token::RParen);
            i += 1;
            continue;
        }
        if c == '\'' || c == '"' {
            let quote = c;
            let start = i + 1;
            let mut end = start;
            while end < chars.len() && chars[end] != quote {
                end += 1;
            }
            if end >= chars.len() {
                return Err("unterminated string literal".to_string());
            }
            tokens.push(Token::Str(chars[start..end].iter().collect()));
            i = end + 1;
            continue;
        }
        if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            let token = if text.contains('.') {
                Token::Float(text.parse().map_err(|_| format!("bad number '{text}'"))?)
            } else {
                Token::Int(text.parse().map_err(|_| format!("bad number '{text}'"))?)
            };
            tokens.push(token);
            continue;
        }
        if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len()
                && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.')
            {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
            continue;
        }

        let rest: String = chars[i..chars.len().min(i + 2)].iter().collect();
        let op = OPERATORS
            .iter()
            .find(|op| rest.starts_with(**op))
            .ok_or_else(|| format!("unexpected character '{c}'"))?;
        tokens.push(Token::Op(op));
        i += op.len();
    }

    Ok(tokens)
}

// ─── Parser / evaluator ───────────────────────────────────────

/// Deepest nesting of parentheses and prefix operators accepted.
const MAX_NESTING: usize = 64;

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
    scope: &'a dyn VariableScope,
}

impl Parser<'_> {
    fn nested(&mut self, parse: impl FnOnce(&mut Self) -> Result<Value, String>) -> Result<Value, String> {
        if self.depth >= MAX_NESTING {
            return Err(format!("expression nested deeper than {MAX_NESTING} levels"));
        }
        self.depth += 1;
        let result = parse(self);
        self.depth -= 1;
        result
    }

    fn peek_op(&self) -> Option<&'static str> {
        match self.tokens.get(self.pos) {
            Some(Token::Op(op)) => Some(op),
            _ => None,
        }
    }

    fn eat_op(&mut self, candidates: &[&str]) -> Option<&'static str> {
        let op = self.peek_op()?;
        if candidates.contains(&op) {
            self.pos += 1;
            Some(op)
        } else {
            None
        }
    }

    fn expr(&mut self) -> Result<Value, String> {
        let mut left = self.and()?;
        while self.eat_op(&["||"]).is_some() {
            let right = self.and()?;
            left = Value::Bool(truthy(&left)? || truthy(&right)?);
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Value, String> {
        let mut left = self.comparison()?;
        while self.eat_op(&["&&"]).is_some() {
            let right = self.comparison()?;
            left = Value::Bool(truthy(&left)? && truthy(&right)?);
        }
        Ok(left)
    }

    fn comparison(&mut self) -> Result<Value, String> {
        let left = self.additive()?;
        let Some(op) = self.eat_op(&["==", "!=", "<=", ">=", "<", ">"]) else {
            return Ok(left);
        };
        let right = self.additive()?;
        let result = match op {
            "==" => values_equal(&left, &right),
            "!=" => !values_equal(&left, &right),
            _ => {
                let ord = compare(&left, &right)
                    .ok_or_else(|| format!("cannot compare {left} with {right}"))?;
                match op {
                    "<" => ord == Ordering::Less,
                    "<=" => ord != Ordering::Greater,
                    ">" => ord == Ordering::Greater,
                    _ => ord != Ordering::Less,
                }
            }
        };
        Ok(Value::Bool(result))
    }

    fn additive(&mut self) -> Result<Value, String> {
        let mut left = self.multiplicative()?;
        while let Some(op) = self.eat_op(&["+", "-"]) {
            let right = self.multiplicative()?;
            left = match (op, &left, &right) {
                ("+", Value::String(a), b) => Value::String(format!("{a}{}", display(b))),
                _ => arithmetic(op, &left, &right)?,
            };
        }
        Ok(left)
    }

    fn multiplicative(&mut self) -> Result<Value, String> {
        let mut left = self.unary()?;
        while let Some(op) = self.eat_op(&["*", "/", "%"]) {
            let right = self.unary()?;
            left = arithmetic(op, &left, &right)?;
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Value, String> {
        if self.eat_op(&["!"]).is_some() {
            let v = self.nested(Self::unary)?;
            return Ok(Value::Bool(!truthy(&v)?));
        }
        if self.eat_op(&["-"]).is_some() {
            let v = self.nested(Self::unary)?;
            return arithmetic("-", &Value::from(0), &v);
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Value, String> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| "unexpected end of expression".to_string())?;
        self.pos += 1;
        match token {
            Token::Int(n) => Ok(Value::from(n)),
            Token::Float(f) => Ok(Value::from(f)),
            Token::Str(s) => Ok(Value::String(s)),
            Token::LParen => {
                let v = self.nested(Self::expr)?;
                match self.tokens.get(self.pos) {
                    Some(Token::RParen) => {
                        self.pos += 1;
                        Ok(v)
                    }
                    _ => Err("missing ')'".to_string()),
                }
            }
            Token::Ident(name) => match name.as_str() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                "null" => Ok(Value::Null),
                path => self.resolve(path),
            },
            other => Err(format!("unexpected token {other:?}")),
        }
    }

    fn resolve(&self, path: &str) -> Result<Value, String> {
        let mut segments = path.split('.');
        let head = segments.next().unwrap_or_default();
        let mut value = self
            .scope
            .variable(head)
            .ok_or_else(|| format!("unknown variable '{head}'"))?;
        for segment in segments {
            value = value.get(segment).cloned().unwrap_or(Value::Null);
        }
        Ok(value)
    }
}

fn truthy(v: &Value) -> Result<bool, String> {
    match v {
        Value::Bool(b) => Ok(*b),
        Value::Null => Ok(false),
        other => Err(format!("{other} is not a boolean")),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn arithmetic(op: &str, a: &Value, b: &Value) -> Result<Value, String> {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        let result = match op {
            "+" => x.checked_add(y),
            "-" => x.checked_sub(y),
            "*" => x.checked_mul(y),
            "/" => x.checked_div(y),
            _ => x.checked_rem(y),
        };
        return result
            .map(Value::from)
            .ok_or_else(|| format!("integer overflow or division by zero in {x} {op} {y}"));
    }
    let (x, y) = match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => (x, y),
        _ => return Err(format!("cannot apply '{op}' to {a} and {b}")),
    };
    let result = match op {
        "+" => x + y,
        "-" => x - y,
        "*" => x * y,
        "/" => x / y,
        _ => x % y,
    };
    Ok(Value::from(result))
}

fn display(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
