//! JSON encoding of values crossing a vat boundary.
//!
//! References travel as `{"@": url}` and rejections as `{"!": reason}`.
//! Encoding a reference asks an [`Exporter`] for its URL; decoding one asks
//! an [`Importer`] for the local value standing in for it.

use serde_json::{Map, Number, Value as Json};

use crate::value::{Ref, Rejection, Settled, Value};

const REF_KEY: &str = "@";
const REJECT_KEY: &str = "!";

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("number is not finite")]
    NonFinite,
    #[error("expected an argument list")]
    NotAList,
    #[error("malformed reference: {0}")]
    BadReference(String),
}

pub trait Exporter {
    /// URL naming `r` for a remote reader.
    fn export(&mut self, r: &Ref) -> String;
}

pub trait Importer {
    /// Local stand-in for the reference at `url`.
    fn import(&mut self, url: &str) -> Value;

    /// Local stand-in for a rejected promise nested inside a value.
    fn broken(&mut self, reason: Rejection) -> Value;
}

pub fn to_json(exporter: &mut dyn Exporter, value: &Value) -> Result<Json, CodecError> {
    Ok(match value {
        Value::Null => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::Int(n) => Json::Number((*n).into()),
        Value::Float(f) => Json::Number(Number::from_f64(*f).ok_or(CodecError::NonFinite)?),
        Value::Text(s) => Json::String(s.clone()),
        Value::List(items) => Json::Array(
            items
                .iter()
                .map(|item| to_json(exporter, item))
                .collect::<Result<_, CodecError>>()?,
        ),
        Value::Record(fields) => {
            let mut map = Map::new();
            for (k, v) in fields {
                map.insert(k.clone(), to_json(exporter, v)?);
            }
            Json::Object(map)
        }
        Value::Ref(r) => {
            let mut map = Map::new();
            map.insert(REF_KEY.into(), Json::String(exporter.export(r)));
            Json::Object(map)
        }
    })
}

pub fn from_json(importer: &mut dyn Importer, json: Json) -> Result<Value, CodecError> {
    Ok(match json {
        Json::Null => Value::Null,
        Json::Bool(b) => Value::Bool(b),
        Json::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::Float(n.as_f64().ok_or(CodecError::NonFinite)?),
        },
        Json::String(s) => Value::Text(s),
        Json::Array(items) => Value::List(
            items
                .into_iter()
                .map(|item| from_json(importer, item))
                .collect::<Result<_, CodecError>>()?,
        ),
        Json::Object(mut map) => {
            if map.len() == 1 {
                if let Some(url) = map.remove(REF_KEY) {
                    return match url {
                        Json::String(url) => Ok(importer.import(&url)),
                        other => Err(CodecError::BadReference(other.to_string())),
                    };
                }
                if let Some(reason) = map.remove(REJECT_KEY) {
                    return Ok(importer.broken(serde_json::from_value(reason)?));
                }
            }
            let mut fields = std::collections::BTreeMap::new();
            for (k, v) in map {
                fields.insert(k, from_json(importer, v)?);
            }
            Value::Record(fields)
        }
    })
}

/// Encodes the final state of a promise.
pub fn serialize(exporter: &mut dyn Exporter, settled: &Settled) -> Result<String, CodecError> {
    let json = match settled {
        Ok(value) => to_json(exporter, value)?,
        Err(reason) => {
            let mut map = Map::new();
            map.insert(REJECT_KEY.into(), serde_json::to_value(reason)?);
            Json::Object(map)
        }
    };
    Ok(serde_json::to_string(&json)?)
}

/// Decodes a response body; a top-level `{"!": ...}` is a rejection.
pub fn deserialize(bytes: &[u8], importer: &mut dyn Importer) -> Result<Settled, CodecError> {
    let json: Json = serde_json::from_slice(bytes)?;
    if let Json::Object(map) = &json {
        if map.len() == 1 {
            if let Some(reason) = map.get(REJECT_KEY) {
                return Ok(Err(serde_json::from_value(reason.clone())?));
            }
        }
    }
    Ok(Ok(from_json(importer, json)?))
}

pub fn serialize_args(exporter: &mut dyn Exporter, args: &[Value]) -> Result<String, CodecError> {
    let items = args
        .iter()
        .map(|arg| to_json(exporter, arg))
        .collect::<Result<Vec<_>, CodecError>>()?;
    Ok(serde_json::to_string(&Json::Array(items))?)
}

/// Decodes an argument list. An empty body is an empty list.
pub fn deserialize_args(bytes: &[u8], importer: &mut dyn Importer) -> Result<Vec<Value>, CodecError> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    let json: Json = serde_json::from_slice(bytes)?;
    match json {
        Json::Array(items) => items
            .into_iter()
            .map(|item| from_json(importer, item))
            .collect(),
        _ => Err(CodecError::NotAList),
    }
}

/// Decodes a single value, as sent by a property write.
pub fn deserialize_value(bytes: &[u8], importer: &mut dyn Importer) -> Result<Value, CodecError> {
    let json: Json = serde_json::from_slice(bytes)?;
    from_json(importer, json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ObjectId;
    use amp_protocol::WebKey;

    #[derive(Default)]
    struct Table {
        imported: Vec<String>,
        broken: Vec<Rejection>,
    }

    impl Exporter for Table {
        fn export(&mut self, r: &Ref) -> String {
            match r {
                Ref::Remote(key) => key.to_url(),
                Ref::Object(id) => format!("http://here/#s=obj{}", id.0),
                Ref::Promise(p) => format!("http://here/#o=&s=p{}", p.0),
            }
        }
    }

    impl Importer for Table {
        fn import(&mut self, url: &str) -> Value {
            self.imported.push(url.to_string());
            match WebKey::parse(url) {
                Ok(key) => Value::Ref(Ref::Remote(key)),
                Err(_) => Value::Null,
            }
        }

        fn broken(&mut self, reason: Rejection) -> Value {
            self.broken.push(reason);
            Value::Null
        }
    }

    #[test]
    fn references_encode_as_urls() {
        let mut table = Table::default();
        let body = serialize(&mut table, &Ok(Value::Ref(Ref::Object(ObjectId(2))))).unwrap();
        assert_eq!(body, r#"{"@":"http://here/#s=obj2"}"#);
        let back = deserialize(body.as_bytes(), &mut table).unwrap().unwrap();
        assert_eq!(
            back,
            Value::Ref(Ref::Remote(WebKey::object("http://here/", "obj2")))
        );
        assert_eq!(table.imported, vec!["http://here/#s=obj2"]);
    }

    #[test]
    fn rejections_encode_under_bang() {
        let mut table = Table::default();
        let body = serialize(&mut table, &Err(Rejection::application("negative beats"))).unwrap();
        assert_eq!(body, r#"{"!":{"$":"application","reason":"negative beats"}}"#);
        let back = deserialize(body.as_bytes(), &mut table).unwrap();
        assert_eq!(back, Err(Rejection::application("negative beats")));
    }

    #[test]
    fn nested_rejection_goes_through_importer() {
        let mut table = Table::default();
        let args = deserialize_args(br#"[1, {"!": {"$": "arithmetic"}}]"#, &mut table).unwrap();
        assert_eq!(args, vec![Value::Int(1), Value::Null]);
        assert_eq!(table.broken, vec![Rejection::Arithmetic]);
    }

    #[test]
    fn args_must_be_a_list() {
        let mut table = Table::default();
        assert!(matches!(
            deserialize_args(b"{\"a\":1}", &mut table),
            Err(CodecError::NotAList)
        ));
        assert_eq!(deserialize_args(b"", &mut table).unwrap(), Vec::<Value>::new());
        assert!(matches!(
            deserialize_args(b"[1,", &mut table),
            Err(CodecError::Json(_))
        ));
    }

    #[test]
    fn non_finite_numbers_do_not_encode() {
        let mut table = Table::default();
        assert!(matches!(
            serialize(&mut table, &Ok(Value::Float(f64::NAN))),
            Err(CodecError::NonFinite)
        ));
        let body = serialize_args(&mut table, &[Value::Int(5), Value::Text("x".into())]).unwrap();
        assert_eq!(body, r#"[5,"x"]"#);
    }
}
