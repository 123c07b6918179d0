use serde::{Deserialize, Serialize};

use crate::value::{Ref, Rejection, Value};

/// How a member is reached over the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    /// Property read; `GET`, replayable, briefly cacheable.
    Read,
    /// Side-effecting method; once-guarded `POST`.
    Write,
    /// Pure accessor whose answer never changes; cached forever.
    Introspect,
}

impl OpKind {
    pub fn allow(self) -> &'static str {
        match self {
            OpKind::Read => "GET, HEAD, OPTIONS, PUT",
            OpKind::Write => "OPTIONS, POST",
            OpKind::Introspect => "GET, HEAD, OPTIONS",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Member {
    pub name: &'static str,
    pub kind: OpKind,
}

/// Static description of a capability, resolved once when it is set up.
#[derive(Debug, PartialEq, Eq)]
pub struct Interface {
    pub name: &'static str,
    pub members: &'static [Member],
}

impl Interface {
    pub fn member(&self, name: &str) -> Option<&Member> {
        self.members.iter().find(|m| m.name == name)
    }
}

/// Object hosted by a vat.
pub trait Capability: Send {
    fn interface(&self) -> &'static Interface;

    /// Reads a `Read` or `Introspect` member.
    fn get(&self, property: &str) -> Result<Value, Rejection>;

    /// Runs a `Write` member. `this` is the caller-visible reference to self.
    fn invoke(&mut self, this: &Ref, method: &str, args: Vec<Value>) -> Result<Value, Rejection>;

    fn set(&mut self, property: &str, _value: Value) -> Result<(), Rejection> {
        Err(Rejection::no_such_member(property))
    }
}
