use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use crate::arena::SlotId;
use crate::error::EngineError;
use crate::source::SourceRef;

/// A concrete value. Closed tagged union: every kind the engine can produce
/// is listed here, there is no open extension point.
///
/// `Node` is the one non-data kind: the handle surfaced when a fix depth is
/// exhausted before a nested deferred node could be resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    Void,
    Bool(bool),
    Int(i64),
    Decimal(OrderedFloat<f64>),
    Str(Arc<str>),
    /// Epoch milliseconds.
    Date(i64),
    List(Arc<Vec<Value>>),
    Map(Arc<IndexMap<Arc<str>, Value>>),
    Range(Range),
    Error(Arc<ErrorValue>),
    Node(SlotId),
}

/// Inclusive range over integers. `start > end` iterates backwards, so
/// `5..1` is a valid range producing `[5, 4, 3, 2, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Range {
    pub start: i64,
    pub end: i64,
}

impl Range {
    pub fn count(&self) -> i64 {
        (self.end - self.start).abs() + 1
    }

    pub fn contains(&self, n: i64) -> bool {
        let (lo, hi) = if self.start <= self.end {
            (self.start, self.end)
        } else {
            (self.end, self.start)
        };
        (lo..=hi).contains(&n)
    }

    pub fn values(&self) -> Vec<i64> {
        if self.start <= self.end {
            (self.start..=self.end).collect()
        } else {
            (self.end..=self.start).rev().collect()
        }
    }

    pub fn to_list(&self) -> Vec<Value> {
        self.values().into_iter().map(Value::Int).collect()
    }
}

/// An error captured as data, so sibling expressions keep resolving.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorValue {
    pub kind: Arc<str>,
    pub message: Arc<str>,
    pub source: SourceRef,
}

impl ErrorValue {
    /// Convert back into a hard failure (the unwrap-or-raise path).
    pub fn raise(&self) -> EngineError {
        EngineError::Script {
            message: format!("[{}] {}", self.kind, self.message),
            at: self.source.clone(),
        }
    }
}

/// Value kind names, used by `is`-style constraints and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Type {
    Any,
    Void,
    Boolean,
    Integer,
    Decimal,
    String,
    Date,
    List,
    Map,
    Range,
    Error,
}

impl Type {
    pub fn of(value: &Value) -> Type {
        match value {
            Value::Void => Type::Void,
            Value::Bool(_) => Type::Boolean,
            Value::Int(_) => Type::Integer,
            Value::Decimal(_) => Type::Decimal,
            Value::Str(_) => Type::String,
            Value::Date(_) => Type::Date,
            Value::List(_) => Type::List,
            Value::Map(_) => Type::Map,
            Value::Range(_) => Type::Range,
            Value::Error(_) => Type::Error,
            Value::Node(_) => Type::Any,
        }
    }

    pub fn parse(name: &str) -> Option<Type> {
        match name.to_ascii_uppercase().as_str() {
            "ANY" => Some(Type::Any),
            "VOID" => Some(Type::Void),
            "BOOLEAN" | "BOOL" => Some(Type::Boolean),
            "INTEGER" | "INT" => Some(Type::Integer),
            "DECIMAL" => Some(Type::Decimal),
            "STRING" => Some(Type::String),
            "DATE" => Some(Type::Date),
            "LIST" => Some(Type::List),
            "MAP" => Some(Type::Map),
            "RANGE" => Some(Type::Range),
            "ERROR" => Some(Type::Error),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Type::Any => "ANY",
            Type::Void => "VOID",
            Type::Boolean => "BOOLEAN",
            Type::Integer => "INTEGER",
            Type::Decimal => "DECIMAL",
            Type::String => "STRING",
            Type::Date => "DATE",
            Type::List => "LIST",
            Type::Map => "MAP",
            Type::Range => "RANGE",
            Type::Error => "ERROR",
        }
    }

    pub fn matches(&self, value: &Value) -> bool {
        *self == Type::Any || *self == Type::of(value)
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Value {
    pub fn decimal(n: f64) -> Self {
        Value::Decimal(OrderedFloat(n))
    }

    pub fn str(s: &str) -> Self {
        Value::Str(Arc::from(s))
    }

    pub fn list(items: Vec<Value>) -> Self {
        Value::List(Arc::new(items))
    }

    pub fn map(entries: IndexMap<Arc<str>, Value>) -> Self {
        Value::Map(Arc::new(entries))
    }

    pub fn range(start: i64, end: i64) -> Self {
        Value::Range(Range { start, end })
    }

    pub fn error(kind: &str, message: &str, source: SourceRef) -> Self {
        Value::Error(Arc::new(ErrorValue {
            kind: Arc::from(kind),
            message: Arc::from(message),
            source,
        }))
    }

    /// Capture an engine failure as an error value.
    pub fn from_engine_error(err: &EngineError) -> Self {
        Value::Error(Arc::new(ErrorValue {
            kind: Arc::from(err.kind()),
            message: Arc::from(err.to_string().as_str()),
            source: err.at().cloned().unwrap_or_default(),
        }))
    }

    pub fn is_void(&self) -> bool {
        matches!(self, Value::Void)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Value::Error(_))
    }

    pub fn is_node(&self) -> bool {
        matches!(self, Value::Node(_))
    }

    /// Truthiness: void, false, zero, empty and error values are falsy.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Void => false,
            Value::Bool(b) => *b,
            Value::Int(n) => *n != 0,
            Value::Decimal(d) => d.0 != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Date(_) => true,
            Value::List(items) => !items.is_empty(),
            Value::Map(entries) => !entries.is_empty(),
            Value::Range(_) => true,
            Value::Error(_) => false,
            Value::Node(_) => true,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            Value::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(n) => Some(*n as f64),
            Value::Decimal(d) => Some(d.0),
            Value::Date(ms) => Some(*ms as f64),
            Value::Bool(b) => Some(f64::from(*b)),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Element count: list/map length, range cardinality, string chars.
    pub fn size(&self) -> Option<i64> {
        match self {
            Value::List(items) => Some(items.len() as i64),
            Value::Map(entries) => Some(entries.len() as i64),
            Value::Range(r) => Some(r.count()),
            Value::Str(s) => Some(s.chars().count() as i64),
            _ => None,
        }
    }

    /// Cross-kind comparison with int/decimal coercion. `None` when the two
    /// kinds have no defined order.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Date(a), Value::Date(b)) => Some(a.cmp(b)),
            (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            _ => {
                let a = self.as_f64()?;
                let b = other.as_f64()?;
                a.partial_cmp(&b)
            }
        }
    }

    pub fn to_display_string(&self) -> String {
        match self {
            Value::Void => "void".to_owned(),
            Value::Bool(b) => b.to_string(),
            Value::Int(n) => n.to_string(),
            Value::Decimal(d) => d.0.to_string(),
            Value::Str(s) => s.to_string(),
            Value::Date(ms) => format!("@{ms}"),
            Value::List(items) => {
                let inner: Vec<String> = items.iter().map(|v| v.to_display_string()).collect();
                format!("[{}]", inner.join(", "))
            }
            Value::Map(entries) => {
                let inner: Vec<String> = entries
                    .iter()
                    .map(|(k, v)| format!("{k}: {}", v.to_display_string()))
                    .collect();
                format!("{{{}}}", inner.join(", "))
            }
            Value::Range(r) => format!("{}..{}", r.start, r.end),
            Value::Error(e) => format!("<error {}: {}>", e.kind, e.message),
            Value::Node(slot) => format!("<node {}.{}>", slot.index, slot.generation),
        }
    }

    /// JSON projection for diagnostics and CLI output.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Void => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(n) => serde_json::Value::from(*n),
            Value::Decimal(d) => {
                serde_json::Number::from_f64(d.0).map_or(serde_json::Value::Null, serde_json::Value::Number)
            }
            Value::Str(s) => serde_json::Value::String(s.to_string()),
            Value::Date(ms) => serde_json::json!({ "date_ms": ms }),
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(|v| v.to_json()).collect())
            }
            Value::Map(entries) => {
                let map: serde_json::Map<String, serde_json::Value> = entries
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_json()))
                    .collect();
                serde_json::Value::Object(map)
            }
            Value::Range(r) => serde_json::json!({ "start": r.start, "end": r.end }),
            Value::Error(e) => serde_json::json!({
                "error": { "kind": e.kind.as_ref(), "message": e.message.as_ref() }
            }),
            Value::Node(slot) => serde_json::json!({
                "node": { "index": slot.index, "generation": slot.generation }
            }),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_display_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_iterates_backwards_when_start_exceeds_end() {
        let r = Range { start: 5, end: 1 };
        assert_eq!(r.values(), vec![5, 4, 3, 2, 1]);
        assert_eq!(r.count(), 5);
    }

    #[test]
    fn range_count_is_inclusive() {
        assert_eq!(Range { start: 1, end: 5 }.count(), 5);
        assert_eq!(Range { start: 3, end: 3 }.count(), 1);
    }

    #[test]
    fn truthiness() {
        assert!(!Value::Void.is_truthy());
        assert!(!Value::Int(0).is_truthy());
        assert!(Value::Int(-1).is_truthy());
        assert!(!Value::str("").is_truthy());
        assert!(Value::str("x").is_truthy());
        assert!(!Value::error("script", "boom", SourceRef::unknown()).is_truthy());
    }

    #[test]
    fn cross_kind_numeric_comparison() {
        let a = Value::Int(2);
        let b = Value::decimal(2.5);
        assert_eq!(a.compare(&b), Some(Ordering::Less));
        assert_eq!(b.compare(&a), Some(Ordering::Greater));
        assert_eq!(a.compare(&Value::str("2")), None);
    }

    #[test]
    fn type_parse_round_trips_names() {
        for t in [
            Type::Any,
            Type::Void,
            Type::Boolean,
            Type::Integer,
            Type::Decimal,
            Type::String,
            Type::Date,
            Type::List,
            Type::Map,
            Type::Range,
            Type::Error,
        ] {
            assert_eq!(Type::parse(t.name()), Some(t));
        }
        assert_eq!(Type::parse("integer"), Some(Type::Integer));
        assert_eq!(Type::parse("NOPE"), None);
    }
}
