// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Expressions and Predicates
//!
//! The contract every EIP node uses to compute correlation keys, split
//! bodies, completion conditions and routing decisions, plus [`Expr`], the
//! built-in expression language.
//!
//! Predicate truthiness of a plain value: `null`, `false`, `0`, `""` and the
//! empty array are false; everything else is true.

use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use super::errors::{AssemblyError, ProcessingError};
use super::exchange::Exchange;
use super::registry::Registry;

/// Computes a value from an exchange.
pub trait Expression: Send + Sync {
    /// One-time initialisation before first use.
    fn init(&self, _registry: &dyn Registry) -> Result<(), AssemblyError> {
        Ok(())
    }

    fn evaluate(&self, exchange: &Exchange) -> Result<Value, ProcessingError>;

    /// Human readable form used in step labels.
    fn describe(&self) -> String {
        "expression".to_string()
    }
}

/// Computes a boolean from an exchange.
pub trait Predicate: Send + Sync {
    fn init(&self, _registry: &dyn Registry) -> Result<(), AssemblyError> {
        Ok(())
    }

    fn matches(&self, exchange: &Exchange) -> Result<bool, ProcessingError>;

    fn describe(&self) -> String {
        "predicate".to_string()
    }
}

pub type ExpressionRef = Arc<dyn Expression>;
pub type PredicateRef = Arc<dyn Predicate>;

type ExprFn = Arc<dyn Fn(&Exchange) -> Result<Value, ProcessingError> + Send + Sync>;

/// Built-in expression language.
#[derive(Clone)]
pub enum Expr {
    Constant(Value),
    Body,
    Header(String),
    Property(String),
    /// JSON pointer into the body (RFC 6901).
    Pointer(String),
    /// Split a string value into an array of strings.
    Tokenize { source: Box<Expr>, delimiter: String },
    Eq(Box<Expr>, Box<Expr>),
    Gt(Box<Expr>, Box<Expr>),
    Lt(Box<Expr>, Box<Expr>),
    Exists(Box<Expr>),
    Not(Box<Expr>),
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Function { name: String, func: ExprFn },
}

impl Expr {
    pub fn constant(value: impl Into<Value>) -> Self {
        Self::Constant(value.into())
    }

    pub fn body() -> Self {
        Self::Body
    }

    pub fn header(name: impl Into<String>) -> Self {
        Self::Header(name.into())
    }

    pub fn property(name: impl Into<String>) -> Self {
        Self::Property(name.into())
    }

    pub fn pointer(pointer: impl Into<String>) -> Self {
        Self::Pointer(pointer.into())
    }

    pub fn tokenize(source: Expr, delimiter: impl Into<String>) -> Self {
        Self::Tokenize {
            source: Box::new(source),
            delimiter: delimiter.into(),
        }
    }

    pub fn function<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&Exchange) -> Result<Value, ProcessingError> + Send + Sync + 'static,
    {
        Self::Function {
            name: name.into(),
            func: Arc::new(func),
        }
    }

    pub fn eq(self, other: Expr) -> Self {
        Self::Eq(Box::new(self), Box::new(other))
    }

    pub fn gt(self, other: Expr) -> Self {
        Self::Gt(Box::new(self), Box::new(other))
    }

    pub fn lt(self, other: Expr) -> Self {
        Self::Lt(Box::new(self), Box::new(other))
    }

    pub fn exists(self) -> Self {
        Self::Exists(Box::new(self))
    }

    pub fn not(self) -> Self {
        Self::Not(Box::new(self))
    }

    pub fn and(self, other: Expr) -> Self {
        match self {
            Self::And(mut all) => {
                all.push(other);
                Self::And(all)
            }
            first => Self::And(vec![first, other]),
        }
    }

    pub fn or(self, other: Expr) -> Self {
        match self {
            Self::Or(mut any) => {
                any.push(other);
                Self::Or(any)
            }
            first => Self::Or(vec![first, other]),
        }
    }

    pub fn shared(self) -> Arc<Expr> {
        Arc::new(self)
    }

    fn eval(&self, exchange: &Exchange) -> Result<Value, ProcessingError> {
        match self {
            Self::Constant(value) => Ok(value.clone()),
            Self::Body => Ok(exchange.body().clone()),
            Self::Header(name) => Ok(exchange.header(name).cloned().unwrap_or(Value::Null)),
            Self::Property(name) => Ok(exchange.property(name).cloned().unwrap_or(Value::Null)),
            Self::Pointer(pointer) => Ok(exchange
                .body()
                .pointer(pointer)
                .cloned()
                .unwrap_or(Value::Null)),
            Self::Tokenize { source, delimiter } => tokenize(source.eval(exchange)?, delimiter),
            Self::Eq(left, right) => Ok(Value::Bool(values_equal(
                &left.eval(exchange)?,
                &right.eval(exchange)?,
            ))),
            Self::Gt(left, right) => Ok(Value::Bool(
                compare_values(&left.eval(exchange)?, &right.eval(exchange)?)
                    == Some(Ordering::Greater),
            )),
            Self::Lt(left, right) => Ok(Value::Bool(
                compare_values(&left.eval(exchange)?, &right.eval(exchange)?)
                    == Some(Ordering::Less),
            )),
            Self::Exists(inner) => Ok(Value::Bool(!inner.eval(exchange)?.is_null())),
            Self::Not(inner) => Ok(Value::Bool(!is_truthy(&inner.eval(exchange)?))),
            Self::And(all) => {
                for expr in all {
                    if !is_truthy(&expr.eval(exchange)?) {
                        return Ok(Value::Bool(false));
                    }
                }
                Ok(Value::Bool(true))
            }
            Self::Or(any) => {
                for expr in any {
                    if is_truthy(&expr.eval(exchange)?) {
                        return Ok(Value::Bool(true));
                    }
                }
                Ok(Value::Bool(false))
            }
            Self::Function { func, .. } => func(exchange),
        }
    }
}

impl Expression for Expr {
    fn evaluate(&self, exchange: &Exchange) -> Result<Value, ProcessingError> {
        self.eval(exchange)
    }

    fn describe(&self) -> String {
        self.to_string()
    }
}

impl Predicate for Expr {
    fn matches(&self, exchange: &Exchange) -> Result<bool, ProcessingError> {
        Ok(is_truthy(&self.eval(exchange)?))
    }

    fn describe(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Constant(value) => write!(f, "constant({value})"),
            Self::Body => write!(f, "body"),
            Self::Header(name) => write!(f, "header({name})"),
            Self::Property(name) => write!(f, "property({name})"),
            Self::Pointer(pointer) => write!(f, "pointer({pointer})"),
            Self::Tokenize { source, delimiter } => write!(f, "tokenize({source}, '{delimiter}')"),
            Self::Eq(l, r) => write!(f, "{l} == {r}"),
            Self::Gt(l, r) => write!(f, "{l} > {r}"),
            Self::Lt(l, r) => write!(f, "{l} < {r}"),
            Self::Exists(inner) => write!(f, "exists({inner})"),
            Self::Not(inner) => write!(f, "not({inner})"),
            Self::And(all) => write_joined(f, all, " && "),
            Self::Or(any) => write_joined(f, any, " || "),
            Self::Function { name, .. } => write!(f, "{name}()"),
        }
    }
}

impl fmt::Debug for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Expr({self})")
    }
}

fn write_joined(f: &mut fmt::Formatter<'_>, exprs: &[Expr], sep: &str) -> fmt::Result {
    write!(f, "(")?;
    for (i, expr) in exprs.iter().enumerate() {
        if i > 0 {
            write!(f, "{sep}")?;
        }
        write!(f, "{expr}")?;
    }
    write!(f, ")")
}

fn tokenize(value: Value, delimiter: &str) -> Result<Value, ProcessingError> {
    match value {
        Value::Null => Ok(Value::Array(Vec::new())),
        Value::Array(items) => Ok(Value::Array(items)),
        Value::String(text) => Ok(Value::Array(
            text.split(delimiter)
                .filter(|part| !part.is_empty())
                .map(|part| Value::String(part.to_string()))
                .collect(),
        )),
        other => Err(ProcessingError::Expression(format!(
            "cannot tokenize non-string value {other}"
        ))),
    }
}

/// Predicate truthiness of a value.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(_) => true,
    }
}

/// Equality that treats `1` and `1.0` as the same number.
pub fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

/// Natural ordering of two values of the same shape; `None` when the values
/// are not comparable.
pub fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => {
            // numeric strings order numerically
            match (a.parse::<f64>(), b.parse::<f64>()) {
                (Ok(x), Ok(y)) => x.partial_cmp(&y),
                _ => Some(a.cmp(b)),
            }
        }
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

/// Render a value as a plain key string (strings without quotes).
pub fn value_to_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
