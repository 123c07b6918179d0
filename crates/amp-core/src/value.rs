use std::collections::BTreeMap;
use std::fmt;

use amp_protocol::WebKey;
use serde::{Deserialize, Serialize};

/// Handle of a capability hosted by this vat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(pub usize);

/// Handle of a promise slot in the vat's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PromiseId(pub usize);

impl fmt::Display for PromiseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// Reference to something that can receive eventual operations.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Ref {
    Object(ObjectId),
    Promise(PromiseId),
    Remote(WebKey),
}

/// Dynamically typed value passed to and returned from capabilities.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<Value>),
    Record(BTreeMap<String, Value>),
    Ref(Ref),
}

impl Value {
    /// False if any number reachable from this value is NaN or infinite.
    pub fn is_finite(&self) -> bool {
        match self {
            Value::Float(f) => f.is_finite(),
            Value::List(items) => items.iter().all(Value::is_finite),
            Value::Record(fields) => fields.values().all(Value::is_finite),
            _ => true,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn reference(&self) -> Option<&Ref> {
        match self {
            Value::Ref(r) => Some(r),
            _ => None,
        }
    }
}

impl From<Ref> for Value {
    fn from(r: Ref) -> Self {
        Value::Ref(r)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

/// Reason a promise was rejected; travels on the wire as `{"!": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "$", rename_all = "snake_case")]
pub enum Rejection {
    #[error("number is not finite")]
    Arithmetic,
    #[error("promise forwarding cycle")]
    Cycle,
    #[error("http {status} {phrase}")]
    Failure { status: u16, phrase: String },
    #[error("transport failed: {reason}")]
    Transport { reason: String },
    #[error("bad syntax: {reason}")]
    BadSyntax { reason: String },
    #[error("no such member: {name}")]
    NoSuchMember { name: String },
    #[error("{reason}")]
    Application { reason: String },
}

impl Rejection {
    pub fn failure(status: http::StatusCode) -> Self {
        Rejection::Failure {
            status: status.as_u16(),
            phrase: status.canonical_reason().unwrap_or("").to_string(),
        }
    }

    pub fn application(reason: impl Into<String>) -> Self {
        Rejection::Application {
            reason: reason.into(),
        }
    }

    pub fn no_such_member(name: &str) -> Self {
        Rejection::NoSuchMember {
            name: name.to_string(),
        }
    }
}

/// Final state of a promise.
pub type Settled = Result<Value, Rejection>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finiteness_reaches_into_containers() {
        assert!(Value::Float(1.5).is_finite());
        assert!(!Value::List(vec![Value::Int(1), Value::Float(f64::NAN)]).is_finite());
        let mut fields = BTreeMap::new();
        fields.insert("x".to_string(), Value::Float(f64::NEG_INFINITY));
        assert!(!Value::Record(fields).is_finite());
    }

    #[test]
    fn rejection_serializes_with_tag() {
        let json = serde_json::to_value(Rejection::failure(http::StatusCode::NOT_FOUND)).unwrap();
        assert_eq!(json["$"], "failure");
        assert_eq!(json["status"], 404);
        assert_eq!(json["phrase"], "Not Found");
        let back: Rejection = serde_json::from_value(json).unwrap();
        assert_eq!(back, Rejection::failure(http::StatusCode::NOT_FOUND));
    }
}
