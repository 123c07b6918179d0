use amp_core::{WireRequest, WireResponse};
use amp_protocol::{ProblemDetails, CONTENT_TYPE_JSON};
use axum::body::{Body, Bytes};
use axum::extract::{DefaultBodyLimit, Query, State};
use axum::http::{header::CONTENT_TYPE, HeaderMap, Method, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use serde::Deserialize;
use tracing::warn;

use crate::AppState;

pub(crate) mod paths {
    /// Every web-key of the vat addresses this path; the query says what.
    pub const VAT: &str = "/";
    pub const TRACE: &str = "/trace";
}

pub(crate) fn build(state: AppState) -> Router<()> {
    let limit = state.max_content_bytes();
    Router::new()
        .route(paths::VAT, any(vat_entry))
        .route(paths::TRACE, get(trace_tail))
        .layer(DefaultBodyLimit::max(limit))
        .with_state(state)
}

fn into_response(wire: WireResponse) -> Response {
    let mut response = Response::new(Body::from(wire.body));
    *response.status_mut() = wire.status;
    *response.headers_mut() = wire.headers;
    response
}

fn problem(status: u16, title: &str, detail: String) -> Response {
    into_response(WireResponse::problem(ProblemDetails::new(status, title).with_detail(detail)))
}

async fn vat_entry(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mut target = state.vat().here().to_string();
    if let Some(query) = uri.query() {
        target.push('?');
        target.push_str(query);
    }
    let mut request = WireRequest::new(method, target);
    if !body.is_empty() {
        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(CONTENT_TYPE_JSON);
        request = request.with_body(content_type, body.to_vec());
    }
    match state.vat().serve(request).await {
        Ok(response) => into_response(response),
        Err(err) => {
            warn!("vat unavailable: {err}");
            problem(503, "Service Unavailable", err.to_string())
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct TraceQuery {
    limit: Option<i64>,
    after: Option<i64>,
}

/// Persisted trace events in id order: the newest `limit`, or those after
/// `after`.
async fn trace_tail(State(state): State<AppState>, Query(q): Query<TraceQuery>) -> Response {
    let limit = q.limit.unwrap_or(100).clamp(1, 1000);
    match state.kernel().recent_events_async(limit, q.after).await {
        Ok(items) => Json(serde_json::json!({ "items": items })).into_response(),
        Err(err) => problem(500, "Internal Server Error", format!("{err:#}")),
    }
}
