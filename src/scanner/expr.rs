// =============================================================================
// Scan Expression Language — lexer, parser, tree-walking evaluator
// =============================================================================
//
// Scan conditions and computed columns are written as small arithmetic
// expressions over OHLCV vectors, indicator calls and per-symbol metadata
// scalars, e.g. `c > sma(c, 50) and mcap > 1e10`.
//
// Expressions evaluate inside a frozen environment: the short OHLCV names
// (`c,o,h,l,v,i`), the fixed indicator primitives, and whatever metadata the
// provider exposes for the symbol. There is no other name resolution and no
// host access of any kind.
//
// Broadcasting follows the vectorized source semantics: scalar-vs-series
// operations map elementwise, comparisons on NaN are false, and boolean
// operators (`and`/`or`/`&`/`|`) combine elementwise when either side is a
// series.
// =============================================================================

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use anyhow::{bail, Context, Result};

use crate::scanner::indicators;

/// Stable hash of an expression string, used in cache fingerprints.
pub fn expression_hash(expression: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    expression.hash(&mut hasher);
    hasher.finish()
}

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

/// A value flowing through the evaluator.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Num(f64),
    Bool(bool),
    Str(String),
    Null,
    Series(Vec<f64>),
    BoolSeries(Vec<bool>),
}

impl Value {
    /// Reduce to a boolean series of length `len`, broadcasting scalars.
    /// Numeric series count non-zero finite entries as true.
    pub fn into_bool_series(self, len: usize) -> Result<Vec<bool>> {
        match self {
            Value::BoolSeries(b) => Ok(b),
            Value::Bool(b) => Ok(vec![b; len]),
            Value::Series(s) => Ok(s.iter().map(|v| v.is_finite() && *v != 0.0).collect()),
            other => bail!("expected a condition, got {}", other.kind()),
        }
    }

    /// The last scalar of the value, as JSON. NaN and null map to JSON null.
    pub fn last_scalar(&self) -> serde_json::Value {
        match self {
            Value::Num(n) if n.is_finite() => serde_json::json!(n),
            Value::Num(_) | Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::json!(b),
            Value::Str(s) => serde_json::json!(s),
            Value::Series(s) => match s.last() {
                Some(v) if v.is_finite() => serde_json::json!(v),
                _ => serde_json::Value::Null,
            },
            Value::BoolSeries(b) => match b.last() {
                Some(v) => serde_json::json!(v),
                None => serde_json::Value::Null,
            },
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Value::Num(_) => "number",
            Value::Bool(_) => "bool",
            Value::Str(_) => "string",
            Value::Null => "null",
            Value::Series(_) => "series",
            Value::BoolSeries(_) => "bool series",
        }
    }
}

/// Convert a metadata JSON scalar into an evaluator value.
pub fn value_from_json(v: &serde_json::Value) -> Value {
    match v {
        serde_json::Value::Number(n) => Value::Num(n.as_f64().unwrap_or(f64::NAN)),
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::String(s) => Value::Str(s.clone()),
        _ => Value::Null,
    }
}

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

/// The frozen name table an expression may see.
#[derive(Debug, Default, Clone)]
pub struct Env {
    vars: HashMap<String, Value>,
}

impl Env {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the OHLCV short names. `i` is the bar index vector.
    pub fn with_ohlcv(
        mut self,
        open: &[f64],
        high: &[f64],
        low: &[f64],
        close: &[f64],
        volume: &[f64],
    ) -> Self {
        self.vars.insert("o".into(), Value::Series(open.to_vec()));
        self.vars.insert("h".into(), Value::Series(high.to_vec()));
        self.vars.insert("l".into(), Value::Series(low.to_vec()));
        self.vars.insert("c".into(), Value::Series(close.to_vec()));
        self.vars.insert("v".into(), Value::Series(volume.to_vec()));
        self.vars.insert(
            "i".into(),
            Value::Series((0..close.len()).map(|x| x as f64).collect()),
        );
        self
    }

    /// Merge metadata scalars. Existing bindings win — metadata can never
    /// shadow the OHLCV vectors.
    pub fn with_metadata(mut self, metadata: &HashMap<String, serde_json::Value>) -> Self {
        for (k, v) in metadata {
            self.vars
                .entry(k.clone())
                .or_insert_with(|| value_from_json(v));
        }
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.vars.insert(name.into(), value);
    }

    fn lookup(&self, name: &str) -> Result<Value> {
        self.vars
            .get(name)
            .cloned()
            .with_context(|| format!("unknown identifier '{name}'"))
    }
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Ident(String),
    Str(String),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    LParen,
    RParen,
    Comma,
    Lt,
    Le,
    Gt,
    Ge,
    EqEq,
    NotEq,
    And,
    Or,
    Not,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
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
            ',' => {
                tokens.push(Token::Comma);
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
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::EqEq);
                    i += 2;
                } else {
                    bail!("unexpected '=' (use '==' for equality)");
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::NotEq);
                    i += 2;
                } else {
                    tokens.push(Token::Not);
                    i += 1;
                }
            }
            '&' => {
                // Accept both '&' and '&&'.
                i += if chars.get(i + 1) == Some(&'&') { 2 } else { 1 };
                tokens.push(Token::And);
            }
            '|' => {
                i += if chars.get(i + 1) == Some(&'|') { 2 } else { 1 };
                tokens.push(Token::Or);
            }
            '\'' | '"' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                        None => bail!("unterminated string literal"),
                    }
                }
                tokens.push(Token::Str(s));
            }
            '0'..='9' | '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                // Scientific notation tail: e/E[+-]digits.
                if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                    let mut j = i + 1;
                    if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
                        j += 1;
                    }
                    if j < chars.len() && chars[j].is_ascii_digit() {
                        i = j;
                        while i < chars.len() && chars[i].is_ascii_digit() {
                            i += 1;
                        }
                    }
                }
                let text: String = chars[start..i].iter().collect();
                let num = text
                    .parse::<f64>()
                    .with_context(|| format!("bad number literal '{text}'"))?;
                tokens.push(Token::Num(num));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                match word.as_str() {
                    "and" => tokens.push(Token::And),
                    "or" => tokens.push(Token::Or),
                    "not" => tokens.push(Token::Not),
                    _ => tokens.push(Token::Ident(word)),
                }
            }
            other => bail!("unexpected character '{other}'"),
        }
    }

    Ok(tokens)
}

// ---------------------------------------------------------------------------
// AST + parser
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Rem,
    Div,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Num(f64),
    Str(String),
    Ident(String),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

/// Parse an expression string into an AST.
pub fn parse(input: &str) -> Result<Expr> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        bail!("trailing tokens after expression");
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut left = self.parse_and()?;
        while self.eat(&Token::Or) {
            let right = self.parse_and()?;
            left = Expr::Binary(BinOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut left = self.parse_comparison()?;
        while self.eat(&Token::And) {
            let right = self.parse_comparison()?;
            left = Expr::Binary(BinOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        let left = self.parse_additive()?;
        let op = match self.peek() {
            Some(Token::Lt) => BinOp::Lt,
            Some(Token::Le) => BinOp::Le,
            Some(Token::Gt) => BinOp::Gt,
            Some(Token::Ge) => BinOp::Ge,
            Some(Token::EqEq) => BinOp::Eq,
            Some(Token::NotEq) => BinOp::Ne,
            _ => return Ok(left),
        };
        self.pos += 1;
        let right = self.parse_additive()?;
        Ok(Expr::Binary(op, Box::new(left), Box::new(right)))
    }

    fn parse_additive(&mut self) -> Result<Expr> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.parse_multiplicative()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_multiplicative(&mut self) -> Result<Expr> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                Some(Token::Percent) => BinOp::Rem,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        match self.peek() {
            Some(Token::Minus) => {
                self.pos += 1;
                Ok(Expr::Unary(UnaryOp::Neg, Box::new(self.parse_unary()?)))
            }
            Some(Token::Not) => {
                self.pos += 1;
                Ok(Expr::Unary(UnaryOp::Not, Box::new(self.parse_unary()?)))
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.bump() {
            Some(Token::Num(n)) => Ok(Expr::Num(n)),
            Some(Token::Str(s)) => Ok(Expr::Str(s)),
            Some(Token::Ident(name)) => {
                if self.eat(&Token::LParen) {
                    let mut args = Vec::new();
                    if !self.eat(&Token::RParen) {
                        loop {
                            args.push(self.parse_or()?);
                            if self.eat(&Token::RParen) {
                                break;
                            }
                            if !self.eat(&Token::Comma) {
                                bail!("expected ',' or ')' in call to '{name}'");
                            }
                        }
                    }
                    Ok(Expr::Call(name, args))
                } else {
                    Ok(Expr::Ident(name))
                }
            }
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                if !self.eat(&Token::RParen) {
                    bail!("expected ')'");
                }
                Ok(inner)
            }
            other => bail!("unexpected token {other:?}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

/// Evaluate a parsed expression against an environment.
pub fn evaluate(expr: &Expr, env: &Env) -> Result<Value> {
    match expr {
        Expr::Num(n) => Ok(Value::Num(*n)),
        Expr::Str(s) => Ok(Value::Str(s.clone())),
        Expr::Ident(name) => env.lookup(name),
        Expr::Unary(op, inner) => {
            let value = evaluate(inner, env)?;
            apply_unary(*op, value)
        }
        Expr::Binary(op, lhs, rhs) => {
            let left = evaluate(lhs, env)?;
            let right = evaluate(rhs, env)?;
            apply_binary(*op, left, right)
        }
        Expr::Call(name, args) => {
            let values: Vec<Value> = args
                .iter()
                .map(|a| evaluate(a, env))
                .collect::<Result<_>>()?;
            apply_call(name, values)
        }
    }
}

/// Parse and evaluate in one step.
pub fn evaluate_str(expression: &str, env: &Env) -> Result<Value> {
    let ast = parse(expression)?;
    evaluate(&ast, env)
}

fn apply_unary(op: UnaryOp, value: Value) -> Result<Value> {
    match (op, value) {
        (UnaryOp::Neg, Value::Num(n)) => Ok(Value::Num(-n)),
        (UnaryOp::Neg, Value::Series(s)) => Ok(Value::Series(s.into_iter().map(|v| -v).collect())),
        (UnaryOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
        (UnaryOp::Not, Value::BoolSeries(b)) => {
            Ok(Value::BoolSeries(b.into_iter().map(|v| !v).collect()))
        }
        (op, value) => bail!("cannot apply {op:?} to {}", value.kind()),
    }
}

fn apply_binary(op: BinOp, left: Value, right: Value) -> Result<Value> {
    match op {
        BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Rem => {
            numeric_op(op, left, right)
        }
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge | BinOp::Eq | BinOp::Ne => {
            comparison_op(op, left, right)
        }
        BinOp::And | BinOp::Or => logical_op(op, left, right),
    }
}

fn arith(op: BinOp, a: f64, b: f64) -> f64 {
    match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => a / b,
        BinOp::Rem => a % b,
        _ => unreachable!("non-arithmetic op"),
    }
}

fn numeric_op(op: BinOp, left: Value, right: Value) -> Result<Value> {
    match (left, right) {
        (Value::Num(a), Value::Num(b)) => Ok(Value::Num(arith(op, a, b))),
        (Value::Series(a), Value::Num(b)) => {
            Ok(Value::Series(a.into_iter().map(|v| arith(op, v, b)).collect()))
        }
        (Value::Num(a), Value::Series(b)) => {
            Ok(Value::Series(b.into_iter().map(|v| arith(op, a, v)).collect()))
        }
        (Value::Series(a), Value::Series(b)) => {
            if a.len() != b.len() {
                bail!("series length mismatch: {} vs {}", a.len(), b.len());
            }
            Ok(Value::Series(
                a.into_iter().zip(b).map(|(x, y)| arith(op, x, y)).collect(),
            ))
        }
        (l, r) => bail!("cannot apply {op:?} to {} and {}", l.kind(), r.kind()),
    }
}

fn compare(op: BinOp, a: f64, b: f64) -> bool {
    // IEEE semantics: any comparison against NaN is false, including !=
    // being true — keep the native behavior for Ne.
    match op {
        BinOp::Lt => a < b,
        BinOp::Le => a <= b,
        BinOp::Gt => a > b,
        BinOp::Ge => a >= b,
        BinOp::Eq => a == b,
        BinOp::Ne => a != b,
        _ => unreachable!("non-comparison op"),
    }
}

fn comparison_op(op: BinOp, left: Value, right: Value) -> Result<Value> {
    match (left, right) {
        (Value::Num(a), Value::Num(b)) => Ok(Value::Bool(compare(op, a, b))),
        (Value::Series(a), Value::Num(b)) => Ok(Value::BoolSeries(
            a.into_iter().map(|v| compare(op, v, b)).collect(),
        )),
        (Value::Num(a), Value::Series(b)) => Ok(Value::BoolSeries(
            b.into_iter().map(|v| compare(op, a, v)).collect(),
        )),
        (Value::Series(a), Value::Series(b)) => {
            if a.len() != b.len() {
                bail!("series length mismatch: {} vs {}", a.len(), b.len());
            }
            Ok(Value::BoolSeries(
                a.into_iter().zip(b).map(|(x, y)| compare(op, x, y)).collect(),
            ))
        }
        (Value::Str(a), Value::Str(b)) => match op {
            BinOp::Eq => Ok(Value::Bool(a == b)),
            BinOp::Ne => Ok(Value::Bool(a != b)),
            BinOp::Lt => Ok(Value::Bool(a < b)),
            BinOp::Le => Ok(Value::Bool(a <= b)),
            BinOp::Gt => Ok(Value::Bool(a > b)),
            BinOp::Ge => Ok(Value::Bool(a >= b)),
            _ => unreachable!(),
        },
        (Value::Bool(a), Value::Bool(b)) => match op {
            BinOp::Eq => Ok(Value::Bool(a == b)),
            BinOp::Ne => Ok(Value::Bool(a != b)),
            _ => bail!("cannot order booleans"),
        },
        // Null equality is defined (always unequal to anything but null);
        // ordering against null is an error, matching the source behavior.
        (Value::Null, Value::Null) => match op {
            BinOp::Eq => Ok(Value::Bool(true)),
            BinOp::Ne => Ok(Value::Bool(false)),
            _ => bail!("cannot order null"),
        },
        (Value::Null, _) | (_, Value::Null) => match op {
            BinOp::Eq => Ok(Value::Bool(false)),
            BinOp::Ne => Ok(Value::Bool(true)),
            _ => bail!("cannot order null"),
        },
        (l, r) => bail!("cannot compare {} with {}", l.kind(), r.kind()),
    }
}

fn logical_op(op: BinOp, left: Value, right: Value) -> Result<Value> {
    let combine = |a: bool, b: bool| match op {
        BinOp::And => a && b,
        BinOp::Or => a || b,
        _ => unreachable!("non-logical op"),
    };

    match (left, right) {
        (Value::Bool(a), Value::Bool(b)) => Ok(Value::Bool(combine(a, b))),
        (Value::BoolSeries(a), Value::Bool(b)) => Ok(Value::BoolSeries(
            a.into_iter().map(|v| combine(v, b)).collect(),
        )),
        (Value::Bool(a), Value::BoolSeries(b)) => Ok(Value::BoolSeries(
            b.into_iter().map(|v| combine(a, v)).collect(),
        )),
        (Value::BoolSeries(a), Value::BoolSeries(b)) => {
            if a.len() != b.len() {
                bail!("series length mismatch: {} vs {}", a.len(), b.len());
            }
            Ok(Value::BoolSeries(
                a.into_iter().zip(b).map(|(x, y)| combine(x, y)).collect(),
            ))
        }
        (l, r) => bail!("cannot apply {op:?} to {} and {}", l.kind(), r.kind()),
    }
}

fn apply_call(name: &str, mut args: Vec<Value>) -> Result<Value> {
    // Pull a numeric series argument at position `idx`.
    fn series_arg(args: &mut Vec<Value>, idx: usize, name: &str) -> Result<Vec<f64>> {
        match args.get_mut(idx) {
            Some(Value::Series(s)) => Ok(std::mem::take(s)),
            Some(other) => bail!("{name}: argument {} must be a series, got {}", idx + 1, other.kind()),
            None => bail!("{name}: missing series argument"),
        }
    }

    fn window_arg(args: &[Value], idx: usize, name: &str) -> Result<usize> {
        match args.get(idx) {
            Some(Value::Num(n)) if *n >= 1.0 && n.is_finite() => Ok(*n as usize),
            Some(other) => bail!("{name}: window must be a positive number, got {other:?}"),
            None => bail!("{name}: missing window argument"),
        }
    }

    /// Optional lookback defaulting to 1 (for `prv` and `change`).
    fn lookback_arg(args: &[Value], idx: usize, name: &str) -> Result<usize> {
        match args.get(idx) {
            None => Ok(1),
            Some(Value::Num(n)) if *n >= 0.0 && n.is_finite() => Ok(*n as usize),
            Some(other) => bail!("{name}: lookback must be a number, got {other:?}"),
        }
    }

    match name {
        "sma" => {
            let s = series_arg(&mut args, 0, name)?;
            let w = window_arg(&args, 1, name)?;
            Ok(Value::Series(indicators::sma(&s, w)))
        }
        "ema" => {
            let s = series_arg(&mut args, 0, name)?;
            let w = window_arg(&args, 1, name)?;
            Ok(Value::Series(indicators::ema(&s, w)))
        }
        "min" => {
            let s = series_arg(&mut args, 0, name)?;
            let w = window_arg(&args, 1, name)?;
            Ok(Value::Series(indicators::rolling_min(&s, w)))
        }
        "max" => {
            let s = series_arg(&mut args, 0, name)?;
            let w = window_arg(&args, 1, name)?;
            Ok(Value::Series(indicators::rolling_max(&s, w)))
        }
        "count" => {
            let s = series_arg(&mut args, 0, name)?;
            let w = window_arg(&args, 1, name)?;
            Ok(Value::Series(indicators::rolling_count(&s, w)))
        }
        "countTrue" => {
            let bools = match args.get_mut(0) {
                Some(Value::BoolSeries(b)) => std::mem::take(b),
                Some(other) => bail!("countTrue: first argument must be a condition, got {}", other.kind()),
                None => bail!("countTrue: missing arguments"),
            };
            let w = window_arg(&args, 1, name)?;
            Ok(Value::Series(indicators::count_true(&bools, w)))
        }
        "prv" => {
            let s = series_arg(&mut args, 0, name)?;
            let k = lookback_arg(&args, 1, name)?;
            Ok(Value::Series(indicators::prv(&s, k)))
        }
        "change" => {
            let s = series_arg(&mut args, 0, name)?;
            let k = lookback_arg(&args, 1, name)?;
            Ok(Value::Series(indicators::change(&s, k)))
        }
        other => bail!("unknown function '{other}'"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> Env {
        let close = [10.0, 12.0, 11.0, 14.0, 16.0];
        let open = [9.0, 11.0, 12.0, 13.0, 15.0];
        let volume = [100.0, 110.0, 90.0, 200.0, 150.0];
        let mut metadata = HashMap::new();
        metadata.insert("mcap".to_string(), serde_json::json!(2.5e10));
        metadata.insert("sector".to_string(), serde_json::json!("Energy"));
        metadata.insert("eps".to_string(), serde_json::Value::Null);
        Env::new()
            .with_ohlcv(&open, &close, &open, &close, &volume)
            .with_metadata(&metadata)
    }

    #[test]
    fn arithmetic_precedence() {
        let v = evaluate_str("2 + 3 * 4", &Env::new()).unwrap();
        assert_eq!(v, Value::Num(14.0));
        let v = evaluate_str("(2 + 3) * 4", &Env::new()).unwrap();
        assert_eq!(v, Value::Num(20.0));
        let v = evaluate_str("-2 * 3", &Env::new()).unwrap();
        assert_eq!(v, Value::Num(-6.0));
    }

    #[test]
    fn scientific_notation_literals() {
        assert_eq!(evaluate_str("1e10", &Env::new()).unwrap(), Value::Num(1e10));
        assert_eq!(evaluate_str("2.5e-2", &Env::new()).unwrap(), Value::Num(0.025));
    }

    #[test]
    fn series_scalar_broadcasting() {
        let v = evaluate_str("c * 2", &env()).unwrap();
        assert_eq!(
            v,
            Value::Series(vec![20.0, 24.0, 22.0, 28.0, 32.0])
        );
    }

    #[test]
    fn series_comparison_yields_bool_series() {
        let v = evaluate_str("c > 11.5", &env()).unwrap();
        assert_eq!(
            v,
            Value::BoolSeries(vec![false, true, false, true, true])
        );
    }

    #[test]
    fn and_or_combine_elementwise() {
        let v = evaluate_str("c > 11 and v > 100", &env()).unwrap();
        assert_eq!(
            v,
            Value::BoolSeries(vec![false, true, false, true, true])
        );
        let alias = evaluate_str("c > 11 & v > 100", &env()).unwrap();
        assert_eq!(v, alias);
    }

    #[test]
    fn metadata_scalars_resolve() {
        let v = evaluate_str("mcap > 1e10", &env()).unwrap();
        assert_eq!(v, Value::Bool(true));
        let v = evaluate_str("sector == 'Energy'", &env()).unwrap();
        assert_eq!(v, Value::Bool(true));
    }

    #[test]
    fn null_metadata_equality_and_order() {
        assert_eq!(evaluate_str("eps == 5", &env()).unwrap(), Value::Bool(false));
        assert_eq!(evaluate_str("eps != 5", &env()).unwrap(), Value::Bool(true));
        assert!(evaluate_str("eps > 5", &env()).is_err());
    }

    #[test]
    fn indicator_calls_compose() {
        let v = evaluate_str("c > sma(c, 3)", &env()).unwrap();
        // sma(c,3) = [10, 11, 11, 12.333.., 13.666..]
        assert_eq!(
            v,
            Value::BoolSeries(vec![false, true, false, true, true])
        );

        let v = evaluate_str("countTrue(c > o, 5)", &env()).unwrap();
        if let Value::Series(s) = v {
            assert_eq!(*s.last().unwrap(), 4.0);
        } else {
            panic!("expected series");
        }
    }

    #[test]
    fn prv_and_change_default_lookback() {
        let v = evaluate_str("change(c)", &env()).unwrap();
        if let Value::Series(s) = v {
            assert!(s[0].is_nan());
            assert!((s[1] - 0.2).abs() < 1e-9);
        } else {
            panic!("expected series");
        }

        let v = evaluate_str("c > prv(c)", &env()).unwrap();
        assert_eq!(
            v,
            Value::BoolSeries(vec![false, true, false, true, true])
        );
    }

    #[test]
    fn nan_comparisons_are_false() {
        // prv introduces a NaN head; comparisons there must be false.
        let v = evaluate_str("prv(c) > 0", &env()).unwrap();
        if let Value::BoolSeries(b) = v {
            assert!(!b[0]);
            assert!(b[1]);
        } else {
            panic!("expected bool series");
        }
    }

    #[test]
    fn unknown_names_and_functions_error() {
        assert!(evaluate_str("nonexistent > 1", &env()).is_err());
        assert!(evaluate_str("explode(c, 5)", &env()).is_err());
        assert!(evaluate_str("sma(c)", &env()).is_err());
        assert!(evaluate_str("sma(1, 5)", &env()).is_err());
    }

    #[test]
    fn malformed_expressions_error() {
        assert!(parse("c >").is_err());
        assert!(parse("(c > 1").is_err());
        assert!(parse("c = 1").is_err());
        assert!(parse("1 2").is_err());
    }

    #[test]
    fn expression_hash_is_stable_and_discriminating() {
        assert_eq!(expression_hash("c > 1"), expression_hash("c > 1"));
        assert_ne!(expression_hash("c > 1"), expression_hash("c > 2"));
    }

    #[test]
    fn into_bool_series_broadcasts_scalars() {
        assert_eq!(
            Value::Bool(true).into_bool_series(3).unwrap(),
            vec![true, true, true]
        );
        assert_eq!(
            Value::Series(vec![0.0, 1.0, f64::NAN]).into_bool_series(3).unwrap(),
            vec![false, true, false]
        );
        assert!(Value::Str("x".into()).into_bool_series(3).is_err());
    }

    #[test]
    fn last_scalar_maps_nan_to_null() {
        assert_eq!(
            Value::Series(vec![1.0, f64::NAN]).last_scalar(),
            serde_json::Value::Null
        );
        assert_eq!(
            Value::Series(vec![1.0, 2.0]).last_scalar(),
            serde_json::json!(2.0)
        );
        assert_eq!(Value::Num(7.0).last_scalar(), serde_json::json!(7.0));
    }
}
