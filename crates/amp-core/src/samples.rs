//! Sample capabilities used by the server and the tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::interface::{Capability, Interface, Member, OpKind};
use crate::value::{Ref, Rejection, Value};

static DRUM: Interface = Interface {
    name: "Drum",
    members: &[
        Member {
            name: "hits",
            kind: OpKind::Read,
        },
        Member {
            name: "bang",
            kind: OpKind::Write,
        },
        Member {
            name: "kind",
            kind: OpKind::Introspect,
        },
    ],
};

/// Counts beats. `bang(n)` adds `n` to `hits` and answers the drum itself.
#[derive(Debug, Default)]
pub struct Drum {
    hits: i64,
    invocations: Option<Arc<AtomicUsize>>,
}

impl Drum {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drum that also counts how many times `bang` actually ran.
    pub fn counted(invocations: Arc<AtomicUsize>) -> Self {
        Self {
            hits: 0,
            invocations: Some(invocations),
        }
    }

    pub fn hits(&self) -> i64 {
        self.hits
    }
}

impl Capability for Drum {
    fn interface(&self) -> &'static Interface {
        &DRUM
    }

    fn get(&self, property: &str) -> Result<Value, Rejection> {
        match property {
            "hits" => Ok(Value::Int(self.hits)),
            "kind" => Ok(Value::Text(DRUM.name.to_string())),
            other => Err(Rejection::no_such_member(other)),
        }
    }

    fn invoke(&mut self, this: &Ref, method: &str, args: Vec<Value>) -> Result<Value, Rejection> {
        if method != "bang" {
            return Err(Rejection::no_such_member(method));
        }
        if let Some(counter) = &self.invocations {
            counter.fetch_add(1, Ordering::SeqCst);
        }
        let beats = match args.first() {
            None => 1,
            Some(Value::Int(n)) => *n,
            Some(other) => {
                return Err(Rejection::BadSyntax {
                    reason: format!("beats must be an integer, got {other:?}"),
                })
            }
        };
        if beats < 0 {
            return Err(Rejection::application("negative beat count"));
        }
        self.hits = self.hits.saturating_add(beats);
        Ok(Value::Ref(this.clone()))
    }

    fn set(&mut self, property: &str, value: Value) -> Result<(), Rejection> {
        match (property, value) {
            ("hits", Value::Int(n)) if n >= 0 => {
                self.hits = n;
                Ok(())
            }
            ("hits", _) => Err(Rejection::application("hits must be a non-negative integer")),
            (other, _) => Err(Rejection::no_such_member(other)),
        }
    }
}
