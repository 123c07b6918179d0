use amp_protocol::{CallParams, WebKey, CONTENT_TYPE_JSON};
use http::Method;
use serde::{Deserialize, Serialize};

use crate::pipeline::{Operation, Stamp};
use crate::promise::Resolver;
use crate::value::PromiseId;
use crate::wire::WireRequest;

/// Where the response to a message goes. Not persisted: after a revival the
/// response is still dequeued but nobody is waiting for it.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Reply {
    pub resolver: Option<Resolver>,
    /// Local promise the target was derived from, if it was still deferred
    /// when the message was sent.
    pub origin: Option<PromiseId>,
}

/// Idempotent read: a property `GET`, or a resolution probe when
/// `property` is `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub target: WebKey,
    pub property: Option<String>,
    #[serde(default)]
    pub attempt: u32,
    #[serde(skip)]
    pub reply: Reply,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verb {
    Post,
    Put,
}

/// Call that may have side effects on the peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Update {
    pub target: WebKey,
    pub verb: Verb,
    pub name: String,
    /// Serialized argument list (`Post`) or new value (`Put`).
    pub body: String,
    #[serde(skip)]
    pub reply: Reply,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Message {
    Query(Query),
    Update(Update),
}

impl Operation for Message {
    fn is_query(&self) -> bool {
        matches!(self, Message::Query(_))
    }
}

impl Message {
    pub fn target(&self) -> &WebKey {
        match self {
            Message::Query(q) => &q.target,
            Message::Update(u) => &u.target,
        }
    }

    pub fn reply(&self) -> Reply {
        match self {
            Message::Query(q) => q.reply,
            Message::Update(u) => u.reply,
        }
    }

    pub fn member(&self) -> Option<&str> {
        match self {
            Message::Query(q) => q.property.as_deref(),
            Message::Update(u) => Some(&u.name),
        }
    }

    /// True for a resolution probe of a remote promise.
    pub fn is_probe(&self) -> bool {
        matches!(self, Message::Query(Query { property: None, .. }))
    }

    /// Wire form of the message. Updates carry the session coordinates.
    pub fn render(&self, session: &str, stamp: Option<Stamp>) -> WireRequest {
        match self {
            Message::Query(q) => {
                let mut params = q.target.params();
                params.p = q.property.clone();
                WireRequest::new(Method::GET, q.target.request_url(&params))
            }
            Message::Update(u) => {
                let mut params: CallParams = u.target.params();
                params.p = Some(u.name.clone());
                params.x = Some(session.to_string());
                if let Some(stamp) = stamp {
                    params.w = Some(stamp.window);
                    params.m = Some(stamp.index);
                }
                let method = match u.verb {
                    Verb::Post => Method::POST,
                    Verb::Put => Method::PUT,
                };
                WireRequest::new(method, u.target.request_url(&params))
                    .with_body(CONTENT_TYPE_JSON, u.body.clone().into_bytes())
            }
        }
    }
}
