//! Restricted arithmetic for `[...]` calculation blocks.
//!
//! Expressions are lexed and parsed into a fixed-shape tree and evaluated by
//! a switch over a closed set of node kinds. There is no fallthrough to a
//! general-purpose interpreter: the only operators are `+ - * / // % **`,
//! unary `+/-`, and parentheses; the only atoms are numeric literals, quoted
//! strings, and operands the template layer has already resolved.

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

/// Calculation failure. The template layer renders every variant as a
/// visible `CALC_ERROR` token instead of propagating it.
#[derive(Error, Debug, PartialEq)]
pub enum CalcError {
    #[error("unresolved identifier '{0}'")]
    Unresolved(String),

    #[error("syntax error: {0}")]
    Syntax(String),

    #[error("division by zero")]
    DivisionByZero,

    #[error("unsupported operand types for '{0}'")]
    TypeMismatch(&'static str),

    #[error("numeric overflow")]
    Overflow,
}

/// An operand or result of a calculation.
#[derive(Debug, Clone, PartialEq)]
pub enum CalcValue {
    Int(i64),
    Float(f64),
    Str(String),
}

impl CalcValue {
    /// Coerce a numeric-looking string to a number; other values pass
    /// through unchanged.
    fn coerced(&self) -> CalcValue {
        if let CalcValue::Str(s) = self {
            let trimmed = s.trim();
            if let Ok(i) = trimmed.parse::<i64>() {
                return CalcValue::Int(i);
            }
            if let Ok(f) = trimmed.parse::<f64>() {
                return CalcValue::Float(f);
            }
        }
        self.clone()
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            CalcValue::Int(i) => Some(*i as f64),
            CalcValue::Float(f) => Some(*f),
            CalcValue::Str(_) => None,
        }
    }
}

impl fmt::Display for CalcValue {
    /// Integers print bare; floats print with two decimals unless integral.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CalcValue::Int(i) => write!(f, "{}", i),
            CalcValue::Float(x) => {
                if x.fract() == 0.0 && x.is_finite() && x.abs() < 1e15 {
                    write!(f, "{}", *x as i64)
                } else {
                    write!(f, "{:.2}", x)
                }
            }
            CalcValue::Str(s) => write!(f, "{}", s),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64, bool), // value, had decimal point or exponent
    Str(String),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    DoubleSlash,
    Percent,
    DoubleStar,
    LParen,
    RParen,
}

fn lex(src: &str) -> Result<Vec<Token>, CalcError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = src.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\r' | '\n' => i += 1,
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
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
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
                    return Err(CalcError::Syntax("unterminated string".to_string()));
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
                    .map_err(|_| CalcError::Syntax(format!("bad number '{}'", text)))?;
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
                return Err(CalcError::Syntax(format!("unexpected character '{}'", other)));
            }
        }
    }
    Ok(tokens)
}

/// Closed expression tree. Every evaluation is a switch over these kinds.
#[derive(Debug)]
enum Expr {
    Int(i64),
    Float(f64),
    Str(String),
    Operand(String),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy)]
enum UnaryOp {
    Neg,
    Pos,
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
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
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

    fn expr(&mut self) -> Result<Expr, CalcError> {
        let mut left = self.term()?;
        while let Some(op) = match self.peek() {
            Some(Token::Plus) => Some(BinOp::Add),
            Some(Token::Minus) => Some(BinOp::Sub),
            _ => None,
        } {
            self.pos += 1;
            let right = self.term()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn term(&mut self) -> Result<Expr, CalcError> {
        let mut left = self.factor()?;
        while let Some(op) = match self.peek() {
            Some(Token::Star) => Some(BinOp::Mul),
            Some(Token::Slash) => Some(BinOp::Div),
            Some(Token::DoubleSlash) => Some(BinOp::FloorDiv),
            Some(Token::Percent) => Some(BinOp::Mod),
            _ => None,
        } {
            self.pos += 1;
            let right = self.factor()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn factor(&mut self) -> Result<Expr, CalcError> {
        match self.peek() {
            Some(Token::Minus) => {
                self.pos += 1;
                Ok(Expr::Unary(UnaryOp::Neg, Box::new(self.factor()?)))
            }
            Some(Token::Plus) => {
                self.pos += 1;
                Ok(Expr::Unary(UnaryOp::Pos, Box::new(self.factor()?)))
            }
            _ => self.power(),
        }
    }

    fn power(&mut self) -> Result<Expr, CalcError> {
        let base = self.atom()?;
        if matches!(self.peek(), Some(Token::DoubleStar)) {
            self.pos += 1;
            // Right-associative; the exponent may carry its own sign.
            let exponent = self.factor()?;
            return Ok(Expr::Binary(BinOp::Pow, Box::new(base), Box::new(exponent)));
        }
        Ok(base)
    }

    fn atom(&mut self) -> Result<Expr, CalcError> {
        match self.next() {
            Some(Token::Num(value, fractional)) => {
                if fractional {
                    Ok(Expr::Float(value))
                } else {
                    Ok(Expr::Int(value as i64))
                }
            }
            Some(Token::Str(s)) => Ok(Expr::Str(s)),
            Some(Token::Ident(name)) => Ok(Expr::Operand(name)),
            Some(Token::LParen) => {
                let inner = self.expr()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(CalcError::Syntax("expected ')'".to_string())),
                }
            }
            other => Err(CalcError::Syntax(format!("unexpected token {:?}", other))),
        }
    }
}

/// Evaluate a calculation expression.
///
/// `operands` holds the values the template layer resolved for each `{...}`
/// reference; any identifier not present there is rejected.
pub fn evaluate(src: &str, operands: &HashMap<String, CalcValue>) -> Result<CalcValue, CalcError> {
    let tokens = lex(src)?;
    if tokens.is_empty() {
        return Err(CalcError::Syntax("empty expression".to_string()));
    }
    let mut parser = Parser { tokens, pos: 0 };
    let tree = parser.expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(CalcError::Syntax("trailing input".to_string()));
    }
    eval(&tree, operands)
}

fn eval(expr: &Expr, operands: &HashMap<String, CalcValue>) -> Result<CalcValue, CalcError> {
    match expr {
        Expr::Int(i) => Ok(CalcValue::Int(*i)),
        Expr::Float(f) => Ok(CalcValue::Float(*f)),
        Expr::Str(s) => Ok(CalcValue::Str(s.clone())),
        Expr::Operand(name) => operands
            .get(name)
            .cloned()
            .ok_or_else(|| CalcError::Unresolved(name.clone())),
        Expr::Unary(op, inner) => {
            let value = eval(inner, operands)?.coerced();
            match (op, value) {
                (UnaryOp::Neg, CalcValue::Int(i)) => {
                    i.checked_neg().map(CalcValue::Int).ok_or(CalcError::Overflow)
                }
                (UnaryOp::Neg, CalcValue::Float(f)) => Ok(CalcValue::Float(-f)),
                (UnaryOp::Pos, v @ (CalcValue::Int(_) | CalcValue::Float(_))) => Ok(v),
                _ => Err(CalcError::TypeMismatch("unary")),
            }
        }
        Expr::Binary(op, lhs, rhs) => {
            let left = eval(lhs, operands)?.coerced();
            let right = eval(rhs, operands)?.coerced();
            binary(*op, left, right)
        }
    }
}

fn binary(op: BinOp, left: CalcValue, right: CalcValue) -> Result<CalcValue, CalcError> {
    use CalcValue::*;

    // String concatenation is the one string-safe operation.
    if let (Str(a), Str(b)) = (&left, &right) {
        return match op {
            BinOp::Add => Ok(Str(format!("{}{}", a, b))),
            BinOp::Sub => Err(CalcError::TypeMismatch("-")),
            BinOp::Mul => Err(CalcError::TypeMismatch("*")),
            BinOp::Div => Err(CalcError::TypeMismatch("/")),
            BinOp::FloorDiv => Err(CalcError::TypeMismatch("//")),
            BinOp::Mod => Err(CalcError::TypeMismatch("%")),
            BinOp::Pow => Err(CalcError::TypeMismatch("**")),
        };
    }

    match (left, right) {
        (Int(a), Int(b)) => int_binary(op, a, b),
        (lhs, rhs) => {
            let a = lhs.as_f64().ok_or(CalcError::TypeMismatch("mixed"))?;
            let b = rhs.as_f64().ok_or(CalcError::TypeMismatch("mixed"))?;
            float_binary(op, a, b)
        }
    }
}

fn int_binary(op: BinOp, a: i64, b: i64) -> Result<CalcValue, CalcError> {
    match op {
        BinOp::Add => a.checked_add(b).map(CalcValue::Int).ok_or(CalcError::Overflow),
        BinOp::Sub => a.checked_sub(b).map(CalcValue::Int).ok_or(CalcError::Overflow),
        BinOp::Mul => a.checked_mul(b).map(CalcValue::Int).ok_or(CalcError::Overflow),
        // True division always yields a float.
        BinOp::Div => {
            if b == 0 {
                Err(CalcError::DivisionByZero)
            } else {
                Ok(CalcValue::Float(a as f64 / b as f64))
            }
        }
        BinOp::FloorDiv => {
            if b == 0 {
                Err(CalcError::DivisionByZero)
            } else {
                Ok(CalcValue::Int(a.div_euclid(b)))
            }
        }
        BinOp::Mod => {
            if b == 0 {
                Err(CalcError::DivisionByZero)
            } else {
                Ok(CalcValue::Int(a.rem_euclid(b)))
            }
        }
        BinOp::Pow => {
            if b >= 0 {
                let exp = u32::try_from(b).map_err(|_| CalcError::Overflow)?;
                a.checked_pow(exp).map(CalcValue::Int).ok_or(CalcError::Overflow)
            } else {
                Ok(CalcValue::Float((a as f64).powi(b as i32)))
            }
        }
    }
}

fn float_binary(op: BinOp, a: f64, b: f64) -> Result<CalcValue, CalcError> {
    let result = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => {
            if b == 0.0 {
                return Err(CalcError::DivisionByZero);
            }
            a / b
        }
        BinOp::FloorDiv => {
            if b == 0.0 {
                return Err(CalcError::DivisionByZero);
            }
            (a / b).floor()
        }
        BinOp::Mod => {
            if b == 0.0 {
                return Err(CalcError::DivisionByZero);
            }
            a.rem_euclid(b)
        }
        BinOp::Pow => a.powf(b),
    };
    if result.is_finite() {
        Ok(CalcValue::Float(result))
    } else {
        Err(CalcError::Overflow)
    }
}
