//! Transport-neutral request and response values exchanged with peers.

use amp_protocol::{ProblemDetails, CONTENT_TYPE_JSON, CONTENT_TYPE_PROBLEM};
use http::header::{HeaderName, HeaderValue, CACHE_CONTROL, CONTENT_TYPE, LOCATION};
use http::{HeaderMap, Method, StatusCode};

#[derive(Debug, Clone, PartialEq)]
pub struct WireRequest {
    pub method: Method,
    /// Absolute URL including the call parameters.
    pub target: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl WireRequest {
    pub fn new(method: Method, target: impl Into<String>) -> Self {
        Self {
            method,
            target: target.into(),
            content_type: None,
            body: Vec::new(),
        }
    }

    pub fn with_body(mut self, content_type: &str, body: Vec<u8>) -> Self {
        self.content_type = Some(content_type.to_string());
        self.body = body;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WireResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl WireResponse {
    pub fn empty(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Vec::new(),
        }
    }

    pub fn json(status: StatusCode, body: impl Into<Vec<u8>>) -> Self {
        Self::empty(status)
            .with_header(CONTENT_TYPE, CONTENT_TYPE_JSON)
            .with_body(body)
    }

    pub fn problem(problem: ProblemDetails) -> Self {
        let status = StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = serde_json::to_vec(&problem).unwrap_or_default();
        Self::empty(status)
            .with_header(CONTENT_TYPE, CONTENT_TYPE_PROBLEM)
            .with_body(body)
    }

    pub fn see_other(location: &str) -> Self {
        Self::empty(StatusCode::SEE_OTHER).with_header(LOCATION, location)
    }

    pub fn with_header(mut self, name: HeaderName, value: &str) -> Self {
        if let Ok(value) = HeaderValue::from_str(value) {
            self.headers.insert(name, value);
        }
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// `Cache-Control` for a response that may be reused for `secs`.
    pub fn with_max_age(self, secs: u64) -> Self {
        if secs == 0 {
            self.with_header(CACHE_CONTROL, "no-cache")
        } else {
            self.with_header(CACHE_CONTROL, &format!("max-age={secs}"))
        }
    }

    pub fn header(&self, name: &HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn location(&self) -> Option<&str> {
        self.header(&LOCATION)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("request timed out")]
    Timeout,
    #[error("response exceeds {limit} bytes")]
    TooMuchData { limit: usize },
    #[error("peer closed")]
    Closed,
    #[error("{0}")]
    Other(String),
}

/// A request released from a pipeline, waiting for the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct Outgoing {
    pub peer: String,
    pub mid: u64,
    pub request: WireRequest,
}
