//! Serving side: maps one inbound request onto the vat's exports.
//!
//! Reads run in a query transaction and are never guarded. Writes run in an
//! update transaction behind the session replay table, so a retried
//! `(x, w, m)` answers with the bytes of the first execution.

use amp_protocol::{CallParams, ProblemDetails, CONTENT_TYPE_JSON, FOREVER_SECS};
use amp_topics::{TOPIC_CALL_EXECUTED, TOPIC_CALL_REPLAYED};
use http::header::ALLOW;
use http::StatusCode;
use serde_json::json;
use tracing::{debug, warn};

use crate::caller::{local_call, Call};
use crate::codec;
use crate::interface::{Member, OpKind};
use crate::session::{Lookup, Outcome};
use crate::value::{ObjectId, PromiseId, Ref, Rejection, Settled, Value};
use crate::vat::Vat;
use crate::wire::{WireRequest, WireResponse};
use crate::Result;

fn problem(status: StatusCode, detail: &str) -> WireResponse {
    WireResponse::problem(
        ProblemDetails::new(status.as_u16(), status.canonical_reason().unwrap_or("")).with_detail(detail),
    )
}

fn not_found(detail: &str) -> WireResponse {
    problem(StatusCode::NOT_FOUND, detail)
}

fn allow(methods: &str) -> WireResponse {
    WireResponse::empty(StatusCode::NO_CONTENT).with_header(ALLOW, methods)
}

fn method_not_allowed(methods: &str) -> WireResponse {
    problem(StatusCode::METHOD_NOT_ALLOWED, "method not allowed").with_header(ALLOW, methods)
}

/// Answers one request. `HEAD` is answered like `GET` without a body.
pub fn serve(vat: &mut Vat, request: WireRequest) -> WireResponse {
    let method = request.method.as_str();
    let is_query = matches!(method, "GET" | "HEAD" | "OPTIONS");
    let head = method == "HEAD";
    let mut response = match vat.enter(is_query, |vat| respond(vat, &request)) {
        Ok(response) => response,
        Err(error) => {
            warn!(%error, method = %request.method, "request aborted");
            problem(StatusCode::INTERNAL_SERVER_ERROR, &error.to_string())
        }
    };
    if head {
        response.body.clear();
    }
    response
}

fn respond(vat: &mut Vat, request: &WireRequest) -> Result<WireResponse> {
    let query = request
        .target
        .split_once('?')
        .map(|(_, query)| query)
        .unwrap_or("");
    let params = match CallParams::parse(query) {
        Ok(params) => params,
        Err(e) => return Ok(problem(StatusCode::BAD_REQUEST, &e.to_string())),
    };
    let Some(subject) = params.s.as_ref().and_then(|s| vat.exports.get(s)).cloned() else {
        if params.s.as_deref().is_some_and(|s| vat.is_lost(s)) {
            return Ok(problem(StatusCode::GONE, "referent lost on revival"));
        }
        return Ok(not_found("never"));
    };
    match subject {
        Ref::Promise(p) => serve_promise(vat, p, &params, request),
        Ref::Object(id) => serve_object(vat, id, &params, request),
        Ref::Remote(_) => Ok(not_found("never")),
    }
}

fn serve_promise(vat: &mut Vat, p: PromiseId, params: &CallParams, request: &WireRequest) -> Result<WireResponse> {
    let Some(settled) = vat.settled(p).cloned() else {
        return Ok(not_found("not yet"));
    };
    if params.member().is_some() {
        return match settled {
            Ok(Value::Ref(Ref::Object(id))) => serve_object(vat, id, params, request),
            Ok(Value::Ref(target)) => Ok(WireResponse::see_other(&vat.export(&target))),
            _ => Ok(not_found("no such member")),
        };
    }
    let introspect = OpKind::Introspect.allow();
    match request.method.as_str() {
        "GET" | "HEAD" => match settled {
            Ok(Value::Ref(target)) => Ok(WireResponse::see_other(&vat.export(&target))),
            other => {
                let body = codec::serialize(vat, &other)?;
                Ok(WireResponse::json(StatusCode::OK, body).with_max_age(FOREVER_SECS))
            }
        },
        "OPTIONS" => Ok(allow(introspect)),
        _ => Ok(method_not_allowed(introspect)),
    }
}

fn serve_object(vat: &mut Vat, id: ObjectId, params: &CallParams, request: &WireRequest) -> Result<WireResponse> {
    let Some(object) = vat.objects.get(id.0) else {
        return Ok(not_found("never"));
    };
    let interface = object.interface();
    let method = request.method.as_str();
    let Some(name) = params.member() else {
        let introspect = OpKind::Introspect.allow();
        return Ok(match method {
            "GET" | "HEAD" => {
                let body = json!({ "$": [interface.name] }).to_string();
                WireResponse::json(StatusCode::OK, body).with_max_age(FOREVER_SECS)
            }
            "OPTIONS" => allow(introspect),
            _ => method_not_allowed(introspect),
        });
    };
    let Some(member) = interface.member(name).copied() else {
        return Ok(not_found("no such member"));
    };
    match (member.kind, method) {
        (kind, "OPTIONS") => Ok(allow(kind.allow())),
        (OpKind::Read | OpKind::Introspect, "GET" | "HEAD") => read(vat, id, member),
        (OpKind::Read, "PUT") => guarded(vat, params, request, |vat, body| {
            let value = codec::deserialize_value(body, vat).map_err(bad_syntax)?;
            local_call(
                vat,
                id,
                Call::Put {
                    property: member.name.to_string(),
                    value,
                },
            )
        }),
        (OpKind::Write, "POST") => guarded(vat, params, request, |vat, body| {
            let args = codec::deserialize_args(body, vat).map_err(bad_syntax)?;
            local_call(
                vat,
                id,
                Call::Invoke {
                    method: member.name.to_string(),
                    args,
                },
            )
        }),
        (kind, _) => Ok(method_not_allowed(kind.allow())),
    }
}

fn bad_syntax(error: codec::CodecError) -> Rejection {
    Rejection::BadSyntax {
        reason: error.to_string(),
    }
}

fn read(vat: &mut Vat, id: ObjectId, member: Member) -> Result<WireResponse> {
    let settled = local_call(vat, id, Call::Get(member.name.to_string()));
    let body = encode(vat, &settled)?;
    let max_age = match member.kind {
        OpKind::Introspect => FOREVER_SECS,
        _ => vat.settings.ephemeral_max_age_secs,
    };
    Ok(WireResponse::json(StatusCode::OK, body).with_max_age(max_age))
}

/// Serializes an outcome; a result that cannot be encoded is answered as an
/// arithmetic rejection.
fn encode(vat: &mut Vat, settled: &Settled) -> Result<String> {
    match codec::serialize(vat, settled) {
        Ok(body) => Ok(body),
        Err(codec::CodecError::NonFinite) => Ok(codec::serialize(vat, &Err(Rejection::Arithmetic))?),
        Err(e) => Err(e.into()),
    }
}

/// Runs `execute` at most once per `(x, w, m)`.
fn guarded(
    vat: &mut Vat,
    params: &CallParams,
    request: &WireRequest,
    execute: impl FnOnce(&mut Vat, &[u8]) -> Settled,
) -> Result<WireResponse> {
    let (Some(session), Some(window)) = (params.x.as_deref(), params.w) else {
        return Ok(problem(StatusCode::BAD_REQUEST, "session parameters x and w are required"));
    };
    let index = params.index();
    let member = params.member();
    match vat.root().sessions.lookup(session, window, index) {
        Lookup::Replay(outcome) => {
            let response = outcome.to_response();
            debug!(?member, window, index, "replaying recorded call");
            vat.trace(
                TOPIC_CALL_REPLAYED,
                json!({ "member": member, "window": window, "index": index }),
            );
            return Ok(response);
        }
        Lookup::Forgotten => {
            return Ok(problem(StatusCode::GONE, "session window expired"));
        }
        Lookup::Fresh => {}
    }
    let settled = execute(vat, &request.body);
    let outcome = Outcome {
        status: StatusCode::OK.as_u16(),
        content_type: Some(CONTENT_TYPE_JSON.to_string()),
        body: encode(vat, &settled)?,
    };
    let retention = vat.settings.retention;
    vat.root_mut()
        .sessions
        .record(session, window, index, outcome.clone(), retention);
    vat.trace(
        TOPIC_CALL_EXECUTED,
        json!({ "member": member, "window": window, "index": index, "ok": settled.is_ok() }),
    );
    Ok(outcome.to_response())
}
