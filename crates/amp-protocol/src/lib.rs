//! Wire contract shared by the calling and the serving side of a vat.
//!
//! A web-key is a peer base URL plus a fragment naming the target
//! (`#s=KEY`, with `o=` when the target is a promise). A request moves the
//! fragment into the query string and adds the call parameters.

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use url::form_urlencoded;
use url::Url;

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_PROBLEM: &str = "application/problem+json";

/// Max-age used for responses that can never change (one year).
pub const FOREVER_SECS: u64 = 60 * 60 * 24 * 365;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid url: {0}")]
    BadUrl(#[from] url::ParseError),
    #[error("web-key has no target key")]
    MissingKey,
    #[error("parameter {param} is not a number: {value:?}")]
    BadNumber { param: &'static str, value: String },
}

/// RFC7807-style error payload used at service edges.
#[derive(Debug, Serialize, Deserialize, Clone, JsonSchema)]
pub struct ProblemDetails {
    pub r#type: String,
    pub title: String,
    pub status: u16,
    pub detail: Option<String>,
    pub instance: Option<String>,
    pub trace_id: Option<String>,
    pub code: Option<String>,
}

impl ProblemDetails {
    pub fn new(status: u16, title: impl Into<String>) -> Self {
        Self {
            r#type: "about:blank".into(),
            title: title.into(),
            status,
            detail: None,
            instance: None,
            trace_id: None,
            code: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_code(mut self, code: &str) -> Self {
        self.code = Some(code.to_string());
        self
    }
}

/// Normalizes a peer base URL so that keys minted by different parties compare equal.
pub fn normalize_peer(base: &str) -> Result<String, ProtocolError> {
    let mut url = Url::parse(base)?;
    url.set_query(None);
    url.set_fragment(None);
    Ok(url.to_string())
}

/// Capability URL naming one object (or promise) hosted by `peer`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WebKey {
    pub peer: String,
    pub key: String,
    #[serde(default)]
    pub promise: bool,
}

impl WebKey {
    pub fn object(peer: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            peer: peer.into(),
            key: key.into(),
            promise: false,
        }
    }

    pub fn promise(peer: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            peer: peer.into(),
            key: key.into(),
            promise: true,
        }
    }

    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let url = Url::parse(raw)?;
        let mut key = None;
        let mut promise = false;
        if let Some(fragment) = url.fragment() {
            for (name, value) in form_urlencoded::parse(fragment.as_bytes()) {
                match name.as_ref() {
                    "s" => key = Some(value.into_owned()),
                    "o" => promise = true,
                    _ => {}
                }
            }
        }
        let key = key.ok_or(ProtocolError::MissingKey)?;
        Ok(Self {
            peer: normalize_peer(raw)?,
            key,
            promise,
        })
    }

    pub fn to_url(&self) -> String {
        let mut fragment = form_urlencoded::Serializer::new(String::new());
        if self.promise {
            fragment.append_pair("o", "");
        }
        fragment.append_pair("s", &self.key);
        format!("{}#{}", self.peer, fragment.finish())
    }

    /// Call parameters addressing this key; callers add `p`, `x`, `w`, `m`.
    pub fn params(&self) -> CallParams {
        CallParams {
            s: Some(self.key.clone()),
            o: self.promise,
            ..CallParams::default()
        }
    }

    pub fn request_url(&self, params: &CallParams) -> String {
        format!("{}?{}", self.peer, params.to_query())
    }
}

impl fmt::Display for WebKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_url())
    }
}

/// Query-string parameters of one call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallParams {
    /// Target key.
    pub s: Option<String>,
    /// Member name; `q` is accepted on input.
    pub p: Option<String>,
    /// Present iff the target is a promise.
    pub o: bool,
    /// Session key.
    pub x: Option<String>,
    /// Window number.
    pub w: Option<u64>,
    /// Intra-window index.
    pub m: Option<u32>,
}

impl CallParams {
    pub fn parse(query: &str) -> Result<Self, ProtocolError> {
        let mut out = CallParams::default();
        let mut alias = None;
        for (name, value) in form_urlencoded::parse(query.as_bytes()) {
            match name.as_ref() {
                "s" => out.s = Some(value.into_owned()),
                "p" => out.p = Some(value.into_owned()),
                "q" => alias = Some(value.into_owned()),
                "o" => out.o = true,
                "x" => out.x = Some(value.into_owned()),
                "w" => out.w = Some(parse_number("w", &value)?),
                "m" => out.m = Some(parse_number("m", &value)?),
                _ => {}
            }
        }
        if out.p.is_none() {
            out.p = alias;
        }
        Ok(out)
    }

    /// Member named by the call; `None` for whole-value requests.
    pub fn member(&self) -> Option<&str> {
        self.p.as_deref().filter(|p| !p.is_empty() && *p != "*")
    }

    pub fn index(&self) -> u32 {
        self.m.unwrap_or(0)
    }

    pub fn to_query(&self) -> String {
        let mut out = form_urlencoded::Serializer::new(String::new());
        if self.o {
            out.append_pair("o", "");
        }
        if let Some(s) = &self.s {
            out.append_pair("s", s);
        }
        if let Some(p) = &self.p {
            out.append_pair("p", p);
        }
        if let Some(x) = &self.x {
            out.append_pair("x", x);
        }
        if let Some(w) = self.w {
            out.append_pair("w", &w.to_string());
        }
        if let Some(m) = self.m {
            out.append_pair("m", &m.to_string());
        }
        out.finish()
    }
}

fn parse_number<T: std::str::FromStr>(param: &'static str, raw: &str) -> Result<T, ProtocolError> {
    raw.parse().map_err(|_| ProtocolError::BadNumber {
        param,
        value: raw.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn web_key_round_trips_through_url() {
        let key = WebKey::promise("http://vat.example:8080/", "k1");
        let url = key.to_url();
        assert_eq!(url, "http://vat.example:8080/#o=&s=k1");
        assert_eq!(WebKey::parse(&url).unwrap(), key);
    }

    #[test]
    fn parse_normalizes_peer() {
        let key = WebKey::parse("http://vat.example:8080#s=abc").unwrap();
        assert_eq!(key.peer, "http://vat.example:8080/");
        assert!(!key.promise);
        assert!(matches!(
            WebKey::parse("http://vat.example/#o="),
            Err(ProtocolError::MissingKey)
        ));
    }

    #[test]
    fn request_url_carries_call_parameters() {
        let key = WebKey::object("http://a/", "K1");
        let mut params = key.params();
        params.p = Some("bang".into());
        params.x = Some("S".into());
        params.w = Some(0);
        params.m = Some(2);
        assert_eq!(key.request_url(&params), "http://a/?s=K1&p=bang&x=S&w=0&m=2");
    }

    #[test]
    fn call_params_accept_q_alias_and_star() {
        let params = CallParams::parse("s=K&q=hits").unwrap();
        assert_eq!(params.member(), Some("hits"));
        let whole = CallParams::parse("o=&s=K&p=*").unwrap();
        assert!(whole.o);
        assert_eq!(whole.member(), None);
        assert_eq!(whole.index(), 0);
    }

    #[test]
    fn call_params_reject_bad_numbers() {
        let err = CallParams::parse("s=K&w=seven").unwrap_err();
        assert!(matches!(err, ProtocolError::BadNumber { param: "w", .. }));
    }
}
