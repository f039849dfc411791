//! Restricted boolean conditions for notification gating.
//!
//! A condition string is parsed into a fixed expression tree and walked by
//! an interpreter that recognizes a closed set of node kinds: literals,
//! names, arithmetic and bitwise operators, chained comparisons, `and/or/
//! not`, subscripts, and a `len(...)` call. Nothing else. Any unsupported
//! construct or unresolved name is an evaluation fault, and faults gate
//! closed: the public entry point returns `false` so a malformed condition
//! suppresses the notification instead of firing it.

use std::collections::HashMap;

use serde_json::{Map, Number, Value};
use thiserror::Error;

use crate::template::now_string;

#[derive(Error, Debug)]
enum EvalError {
    #[error("syntax error: {0}")]
    Syntax(String),

    #[error("unresolved name '{0}'")]
    Unresolved(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

/// Evaluate a gating condition against a trigger payload.
///
/// An empty or blank expression means "no gate" and returns `true`. Any
/// fault returns `false`.
pub fn evaluate(expr: &str, data: &Value, user_vars: &Map<String, Value>) -> bool {
    if expr.trim().is_empty() {
        return true;
    }

    match try_evaluate(expr, data, user_vars) {
        Ok(result) => {
            tracing::debug!(condition = %expr, result, "condition evaluated");
            result
        }
        Err(e) => {
            tracing::warn!(condition = %expr, error = %e, "condition fault, gating closed");
            false
        }
    }
}

fn try_evaluate(
    expr: &str,
    data: &Value,
    user_vars: &Map<String, Value>,
) -> Result<bool, EvalError> {
    let tokens = lex(expr)?;
    let mut parser = Parser { tokens, pos: 0 };
    let tree = parser.parse()?;

    let mut env: HashMap<String, Value> = HashMap::new();
    for (k, v) in user_vars {
        env.insert(k.clone(), v.clone());
    }
    env.insert("value".to_string(), data.get("value").cloned().unwrap_or(Value::Null));
    env.insert(
        "old_value".to_string(),
        data.get("old_value").cloned().unwrap_or(Value::Null),
    );
    env.insert("data".to_string(), data.clone());
    env.insert("time".to_string(), Value::String(now_string()));
    // The payload's own top-level keys win over everything.
    if let Value::Object(map) = data {
        for (k, v) in map {
            env.insert(k.clone(), v.clone());
        }
    }

    Ok(truthy(&eval(&tree, &env)?))
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64, bool),
    Str(String),
    Ident(String),
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Plus,
    Minus,
    Star,
    DoubleStar,
    Slash,
    DoubleSlash,
    Percent,
    Amp,
    Pipe,
    Caret,
    LParen,
    RParen,
    LBracket,
    RBracket,
}

fn lex(src: &str) -> Result<Vec<Token>, EvalError> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\r' | '\n' => i += 1,
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Eq);
                    i += 2;
                } else {
                    return Err(EvalError::Syntax("assignment is not allowed".to_string()));
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ne);
                    i += 2;
                } else {
                    return Err(EvalError::Syntax("unexpected '!'".to_string()));
                }
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
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                if chars.get(i + 1) == Some(&'*') {
                    tokens.push(Token::DoubleStar);
                    i += 2;
                } else {
                    tokens.push(Token::Star);
                    i += 1;
                }
            }
            '/' => {
                if chars.get(i + 1) == Some(&'/') {
                    tokens.push(Token::DoubleSlash);
                    i += 2;
                } else {
                    tokens.push(Token::Slash);
                    i += 1;
                }
            }
            '%' => {
                tokens.push(Token::Percent);
                i += 1;
            }
            '&' => {
                tokens.push(Token::Amp);
                i += 1;
            }
            '|' => {
                tokens.push(Token::Pipe);
                i += 1;
            }
            '^' => {
                tokens.push(Token::Caret);
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
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            '\'' | '"' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                while i < chars.len() && chars[i] != quote {
                    s.push(chars[i]);
                    i += 1;
                }
                if i >= chars.len() {
                    return Err(EvalError::Syntax("unterminated string".to_string()));
                }
                i += 1;
                tokens.push(Token::Str(s));
            }
            '0'..='9' | '.' => {
                let start = i;
                let mut fractional = false;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    if chars[i] == '.' {
                        fractional = true;
                    }
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let value = text
                    .parse::<f64>()
                    .map_err(|_| EvalError::Syntax(format!("bad number '{}'", text)))?;
                tokens.push(Token::Num(value, fractional));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => {
                return Err(EvalError::Syntax(format!("unexpected character '{}'", other)));
            }
        }
    }
    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
}

#[derive(Debug, Clone, Copy)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
    BitAnd,
    BitOr,
    BitXor,
}

#[derive(Debug)]
enum Expr {
    Literal(Value),
    Name(String),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Pos(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    /// Comparison chain: `a < b < c` holds the left operand plus the
    /// (operator, operand) tail, evaluated pairwise with short-circuit.
    Compare(Box<Expr>, Vec<(CmpOp, Expr)>),
    Subscript(Box<Expr>, Box<Expr>),
    Len(Box<Expr>),
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn parse(&mut self) -> Result<Expr, EvalError> {
        let expr = self.or_expr()?;
        if self.pos != self.tokens.len() {
            return Err(EvalError::Syntax("trailing input".to_string()));
        }
        Ok(expr)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_keyword(&self, kw: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(s)) if s == kw)
    }

    fn or_expr(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.and_expr()?;
        while self.peek_keyword("or") {
            self.pos += 1;
            let right = self.and_expr()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.not_expr()?;
        while self.peek_keyword("and") {
            self.pos += 1;
            let right = self.not_expr()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn not_expr(&mut self) -> Result<Expr, EvalError> {
        if self.peek_keyword("not") {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.not_expr()?)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, EvalError> {
        let left = self.bit_or()?;
        let mut chain = Vec::new();
        loop {
            let op = match self.peek() {
                Some(Token::Eq) => Some(CmpOp::Eq),
                Some(Token::Ne) => Some(CmpOp::Ne),
                Some(Token::Lt) => Some(CmpOp::Lt),
                Some(Token::Le) => Some(CmpOp::Le),
                Some(Token::Gt) => Some(CmpOp::Gt),
                Some(Token::Ge) => Some(CmpOp::Ge),
                Some(Token::Ident(s)) if s == "in" => Some(CmpOp::In),
                Some(Token::Ident(s)) if s == "not" => {
                    // Only `not in` continues a comparison; bare `not` here
                    // is a syntax error caught below.
                    if matches!(self.tokens.get(self.pos + 1), Some(Token::Ident(s2)) if s2 == "in")
                    {
                        Some(CmpOp::NotIn)
                    } else {
                        None
                    }
                }
                _ => None,
            };
            let Some(op) = op else {
                break;
            };
            self.pos += if op == CmpOp::NotIn { 2 } else { 1 };
            let right = self.bit_or()?;
            chain.push((op, right));
        }
        if chain.is_empty() {
            Ok(left)
        } else {
            Ok(Expr::Compare(Box::new(left), chain))
        }
    }

    fn bit_or(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.bit_xor()?;
        while matches!(self.peek(), Some(Token::Pipe)) {
            self.pos += 1;
            let right = self.bit_xor()?;
            left = Expr::Binary(BinOp::BitOr, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn bit_xor(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.bit_and()?;
        while matches!(self.peek(), Some(Token::Caret)) {
            self.pos += 1;
            let right = self.bit_and()?;
            left = Expr::Binary(BinOp::BitXor, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn bit_and(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.arith()?;
        while matches!(self.peek(), Some(Token::Amp)) {
            self.pos += 1;
            let right = self.arith()?;
            left = Expr::Binary(BinOp::BitAnd, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn arith(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let right = self.term()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn term(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                Some(Token::DoubleSlash) => BinOp::FloorDiv,
                Some(Token::Percent) => BinOp::Mod,
                _ => break,
            };
            self.pos += 1;
            let right = self.unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, EvalError> {
        match self.peek() {
            Some(Token::Minus) => {
                self.pos += 1;
                Ok(Expr::Neg(Box::new(self.unary()?)))
            }
            Some(Token::Plus) => {
                self.pos += 1;
                Ok(Expr::Pos(Box::new(self.unary()?)))
            }
            _ => self.power(),
        }
    }

    fn power(&mut self) -> Result<Expr, EvalError> {
        let base = self.postfix()?;
        if matches!(self.peek(), Some(Token::DoubleStar)) {
            self.pos += 1;
            let exponent = self.unary()?;
            return Ok(Expr::Binary(BinOp::Pow, Box::new(base), Box::new(exponent)));
        }
        Ok(base)
    }

    fn postfix(&mut self) -> Result<Expr, EvalError> {
        let mut expr = self.atom()?;
        while matches!(self.peek(), Some(Token::LBracket)) {
            self.pos += 1;
            let index = self.or_expr()?;
            match self.peek() {
                Some(Token::RBracket) => self.pos += 1,
                _ => return Err(EvalError::Syntax("expected ']'".to_string())),
            }
            expr = Expr::Subscript(Box::new(expr), Box::new(index));
        }
        Ok(expr)
    }

    fn atom(&mut self) -> Result<Expr, EvalError> {
        let token = self
            .peek()
            .cloned()
            .ok_or_else(|| EvalError::Syntax("unexpected end of expression".to_string()))?;
        self.pos += 1;
        match token {
            Token::Num(value, fractional) => {
                if fractional {
                    Ok(Expr::Literal(
                        Number::from_f64(value).map(Value::Number).unwrap_or(Value::Null),
                    ))
                } else {
                    Ok(Expr::Literal(Value::Number(Number::from(value as i64))))
                }
            }
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::Ident(name) => match name.as_str() {
                "true" | "True" => Ok(Expr::Literal(Value::Bool(true))),
                "false" | "False" => Ok(Expr::Literal(Value::Bool(false))),
                "none" | "None" | "null" => Ok(Expr::Literal(Value::Null)),
                // len is the single whitelisted call.
                "len" if matches!(self.peek(), Some(Token::LParen)) => {
                    self.pos += 1;
                    let arg = self.or_expr()?;
                    match self.peek() {
                        Some(Token::RParen) => self.pos += 1,
                        _ => return Err(EvalError::Syntax("expected ')'".to_string())),
                    }
                    Ok(Expr::Len(Box::new(arg)))
                }
                _ => {
                    if matches!(self.peek(), Some(Token::LParen)) {
                        return Err(EvalError::Unsupported(format!("call to '{}'", name)));
                    }
                    Ok(Expr::Name(name))
                }
            },
            Token::LParen => {
                let inner = self.or_expr()?;
                match self.peek() {
                    Some(Token::RParen) => {
                        self.pos += 1;
                        Ok(inner)
                    }
                    _ => Err(EvalError::Syntax("expected ')'".to_string())),
                }
            }
            other => Err(EvalError::Syntax(format!("unexpected token {:?}", other))),
        }
    }
}

// ---------------------------------------------------------------------------
// Interpreter
// ---------------------------------------------------------------------------

fn eval(expr: &Expr, env: &HashMap<String, Value>) -> Result<Value, EvalError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Name(name) => env
            .get(name)
            .cloned()
            .ok_or_else(|| EvalError::Unresolved(name.clone())),
        Expr::Not(inner) => Ok(Value::Bool(!truthy(&eval(inner, env)?))),
        Expr::Neg(inner) => {
            let v = eval(inner, env)?;
            let n = as_number(&v).ok_or(EvalError::Unsupported("unary '-'".to_string()))?;
            Ok(number_value(-n))
        }
        Expr::Pos(inner) => {
            let v = eval(inner, env)?;
            as_number(&v).ok_or(EvalError::Unsupported("unary '+'".to_string()))?;
            Ok(v)
        }
        // and/or keep operand values, like chained boolean expressions do.
        Expr::And(lhs, rhs) => {
            let left = eval(lhs, env)?;
            if !truthy(&left) {
                return Ok(left);
            }
            eval(rhs, env)
        }
        Expr::Or(lhs, rhs) => {
            let left = eval(lhs, env)?;
            if truthy(&left) {
                return Ok(left);
            }
            eval(rhs, env)
        }
        Expr::Binary(op, lhs, rhs) => {
            let left = eval(lhs, env)?;
            let right = eval(rhs, env)?;
            binary(*op, &left, &right)
        }
        Expr::Compare(first, chain) => {
            let mut left = eval(first, env)?;
            for (op, operand) in chain {
                let right = eval(operand, env)?;
                if !compare(*op, &left, &right)? {
                    return Ok(Value::Bool(false));
                }
                left = right;
            }
            Ok(Value::Bool(true))
        }
        Expr::Subscript(target, index) => {
            let container = eval(target, env)?;
            let key = eval(index, env)?;
            Ok(subscript(&container, &key))
        }
        Expr::Len(inner) => {
            let v = eval(inner, env)?;
            let n = match &v {
                Value::String(s) => s.chars().count(),
                Value::Array(items) => items.len(),
                Value::Object(map) => map.len(),
                _ => return Err(EvalError::Unsupported("len of non-collection".to_string())),
            };
            Ok(Value::Number(Number::from(n as i64)))
        }
    }
}

/// Subscript access never raises: a miss of any kind yields none.
fn subscript(container: &Value, key: &Value) -> Value {
    match (container, key) {
        (Value::Object(map), Value::String(k)) => map.get(k).cloned().unwrap_or(Value::Null),
        (Value::Array(items), Value::Number(n)) => n
            .as_i64()
            .and_then(|i| usize::try_from(i).ok())
            .and_then(|i| items.get(i).cloned())
            .unwrap_or(Value::Null),
        (Value::Array(items), Value::String(s)) => s
            .parse::<usize>()
            .ok()
            .and_then(|i| items.get(i).cloned())
            .unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(*b as i64 as f64),
        _ => None,
    }
}

fn number_value(f: f64) -> Value {
    if f.fract() == 0.0 && f.is_finite() && f.abs() < 1e15 {
        Value::Number(Number::from(f as i64))
    } else {
        Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
    }
}

fn binary(op: BinOp, left: &Value, right: &Value) -> Result<Value, EvalError> {
    // String concatenation is allowed; everything else needs numbers.
    if let (BinOp::Add, Value::String(a), Value::String(b)) = (op, left, right) {
        return Ok(Value::String(format!("{}{}", a, b)));
    }

    if matches!(op, BinOp::BitAnd | BinOp::BitOr | BinOp::BitXor) {
        let a = left
            .as_i64()
            .ok_or(EvalError::Unsupported("bitwise on non-integer".to_string()))?;
        let b = right
            .as_i64()
            .ok_or(EvalError::Unsupported("bitwise on non-integer".to_string()))?;
        let r = match op {
            BinOp::BitAnd => a & b,
            BinOp::BitOr => a | b,
            BinOp::BitXor => a ^ b,
            _ => unreachable!(),
        };
        return Ok(Value::Number(Number::from(r)));
    }

    let a = as_number(left).ok_or(EvalError::Unsupported("arithmetic on non-number".to_string()))?;
    let b =
        as_number(right).ok_or(EvalError::Unsupported("arithmetic on non-number".to_string()))?;
    let result = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => {
            if b == 0.0 {
                return Err(EvalError::Unsupported("division by zero".to_string()));
            }
            a / b
        }
        BinOp::FloorDiv => {
            if b == 0.0 {
                return Err(EvalError::Unsupported("division by zero".to_string()));
            }
            (a / b).floor()
        }
        BinOp::Mod => {
            if b == 0.0 {
                return Err(EvalError::Unsupported("division by zero".to_string()));
            }
            a.rem_euclid(b)
        }
        BinOp::Pow => a.powf(b),
        _ => unreachable!(),
    };
    if !result.is_finite() {
        return Err(EvalError::Unsupported("numeric overflow".to_string()));
    }
    Ok(number_value(result))
}

fn compare(op: CmpOp, left: &Value, right: &Value) -> Result<bool, EvalError> {
    match op {
        CmpOp::Eq => Ok(value_eq(left, right)),
        CmpOp::Ne => Ok(!value_eq(left, right)),
        CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => {
            let ord = value_cmp(left, right)?;
            Ok(match op {
                CmpOp::Lt => ord == std::cmp::Ordering::Less,
                CmpOp::Le => ord != std::cmp::Ordering::Greater,
                CmpOp::Gt => ord == std::cmp::Ordering::Greater,
                CmpOp::Ge => ord != std::cmp::Ordering::Less,
                _ => unreachable!(),
            })
        }
        CmpOp::In => contains(right, left),
        CmpOp::NotIn => contains(right, left).map(|b| !b),
    }
}

/// Equality with numeric cross-type tolerance (`1 == 1.0`).
fn value_eq(left: &Value, right: &Value) -> bool {
    match (as_number(left), as_number(right)) {
        (Some(a), Some(b)) => a == b,
        _ => left == right,
    }
}

fn value_cmp(left: &Value, right: &Value) -> Result<std::cmp::Ordering, EvalError> {
    if let (Some(a), Some(b)) = (as_number(left), as_number(right)) {
        return a
            .partial_cmp(&b)
            .ok_or(EvalError::Unsupported("incomparable numbers".to_string()));
    }
    if let (Value::String(a), Value::String(b)) = (left, right) {
        return Ok(a.cmp(b));
    }
    Err(EvalError::Unsupported("ordering of mixed types".to_string()))
}

fn contains(container: &Value, item: &Value) -> Result<bool, EvalError> {
    match container {
        Value::String(haystack) => match item {
            Value::String(needle) => Ok(haystack.contains(needle.as_str())),
            _ => Err(EvalError::Unsupported("'in' needs a string needle".to_string())),
        },
        Value::Array(items) => Ok(items.iter().any(|v| value_eq(v, item))),
        Value::Object(map) => match item {
            Value::String(key) => Ok(map.contains_key(key)),
            _ => Ok(false),
        },
        _ => Err(EvalError::Unsupported("'in' on non-collection".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn no_vars() -> Map<String, Value> {
        Map::new()
    }

    #[test]
    fn test_empty_condition_is_true() {
        assert!(evaluate("", &json!({}), &no_vars()));
        assert!(evaluate("   ", &json!({}), &no_vars()));
    }

    #[test]
    fn test_simple_comparison() {
        assert!(evaluate("x > 10", &json!({"x": 11}), &no_vars()));
        assert!(!evaluate("x > 10", &json!({"x": 10}), &no_vars()));
    }

    #[test]
    fn test_malformed_condition_is_false() {
        assert!(!evaluate("bogus(((", &json!({}), &no_vars()));
        assert!(!evaluate("x = 5", &json!({"x": 5}), &no_vars()));
    }

    #[test]
    fn test_unresolved_name_is_false() {
        assert!(!evaluate("missing_name > 1", &json!({}), &no_vars()));
    }

    #[test]
    fn test_chained_comparison() {
        assert!(evaluate("1 < x < 10", &json!({"x": 5}), &no_vars()));
        assert!(!evaluate("1 < x < 10", &json!({"x": 12}), &no_vars()));
        assert!(!evaluate("1 < x < 10", &json!({"x": 0}), &no_vars()));
    }

    #[test]
    fn test_boolean_combinators() {
        let data = json!({"a": 1, "b": 0});
        assert!(evaluate("a == 1 and b == 0", &data, &no_vars()));
        assert!(evaluate("a == 2 or b == 0", &data, &no_vars()));
        assert!(evaluate("not b", &data, &no_vars()));
        assert!(!evaluate("not a", &data, &no_vars()));
    }

    #[test]
    fn test_reserved_bindings() {
        let data = json!({"value": "up", "old_value": "down"});
        assert!(evaluate("value != old_value", &data, &no_vars()));
        assert!(evaluate("'value' in data", &data, &no_vars()));
    }

    #[test]
    fn test_in_operators() {
        let data = json!({"tags": ["urgent", "ops"], "msg": "disk full"});
        assert!(evaluate("'urgent' in tags", &data, &no_vars()));
        assert!(evaluate("'full' in msg", &data, &no_vars()));
        assert!(evaluate("'low' not in tags", &data, &no_vars()));
    }

    #[test]
    fn test_subscript_returns_none_on_miss() {
        let data = json!({"result": {"count": 3}, "items": [1, 2]});
        assert!(evaluate("result['count'] == 3", &data, &no_vars()));
        assert!(evaluate("result['missing'] == None", &data, &no_vars()));
        assert!(evaluate("items[5] == None", &data, &no_vars()));
    }

    #[test]
    fn test_len_is_the_only_call() {
        let data = json!({"items": [1, 2, 3], "name": "abc"});
        assert!(evaluate("len(items) == 3", &data, &no_vars()));
        assert!(evaluate("len(name) == 3", &data, &no_vars()));
        // Any other call is rejected (fail-closed).
        assert!(!evaluate("open('x') == 1", &data, &no_vars()));
        assert!(!evaluate("str(1) == '1'", &data, &no_vars()));
    }

    #[test]
    fn test_user_vars_overridden_by_payload() {
        let uvars: Map<String, Value> =
            [("threshold".to_string(), json!(5)), ("x".to_string(), json!(1))]
                .into_iter()
                .collect();
        let data = json!({"x": 100});
        assert!(evaluate("x > threshold", &data, &uvars));
    }

    #[test]
    fn test_arithmetic_in_condition() {
        let data = json!({"value": 100, "old_value": 80});
        assert!(evaluate("value - old_value >= 20", &data, &no_vars()));
        assert!(evaluate("value // 30 == 3", &data, &no_vars()));
        assert!(evaluate("value % 30 == 10", &data, &no_vars()));
    }

    #[test]
    fn test_python_spelled_constants() {
        assert!(evaluate("True", &json!({}), &no_vars()));
        assert!(!evaluate("False", &json!({}), &no_vars()));
        assert!(evaluate("x == None", &json!({"x": null}), &no_vars()));
    }

    #[test]
    fn test_numeric_cross_type_equality() {
        assert!(evaluate("x == 1", &json!({"x": 1.0}), &no_vars()));
    }

    #[test]
    fn test_division_by_zero_is_false() {
        assert!(!evaluate("1 / x > 0", &json!({"x": 0}), &no_vars()));
    }
}
