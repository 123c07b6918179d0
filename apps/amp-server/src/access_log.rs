use axum::extract::{ConnectInfo, MatchedPath};
use axum::http::{HeaderMap, Request};
use axum::middleware::Next;
use axum::response::Response;
use once_cell::sync::Lazy;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

#[derive(Clone, Debug)]
struct Cfg {
    enabled: bool,
    sample_n: u64,
    ua: bool,
    trust_forward: bool,
}

fn flag(key: &str) -> bool {
    std::env::var(key).ok().as_deref() == Some("1")
}

static CFG: Lazy<Cfg> = Lazy::new(|| Cfg {
    enabled: flag("AMP_ACCESS_LOG"),
    sample_n: std::env::var("AMP_ACCESS_SAMPLE_N")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1)
        .max(1),
    ua: flag("AMP_ACCESS_UA"),
    trust_forward: flag("AMP_TRUST_FORWARD_HEADERS"),
});

static COUNTER: AtomicU64 = AtomicU64::new(0);

fn forwarded_for(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get("x-forwarded-for")?.to_str().ok()?;
    let ip = raw.split(',').next()?.trim();
    (!ip.is_empty()).then(|| ip.to_string())
}

fn remote_addr<B>(req: &Request<B>) -> Option<String> {
    let peer = || {
        req.extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|c| c.0.ip().to_string())
    };
    if CFG.trust_forward {
        forwarded_for(req.headers()).or_else(peer)
    } else {
        peer()
    }
}

/// One JSON line per request on the `http.access` target. Query strings are
/// never logged: they carry web-keys.
pub async fn access_log_mw(req: Request<axum::body::Body>, next: Next) -> Response {
    if !CFG.enabled {
        return next.run(req).await;
    }
    let started = Instant::now();
    let method = req.method().clone();
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    let remote = remote_addr(&req);
    let ua = CFG
        .ua
        .then(|| {
            req.headers()
                .get(axum::http::header::USER_AGENT)
                .and_then(|h| h.to_str().ok())
                .map(str::to_string)
        })
        .flatten();
    let res = next.run(req).await;
    let n = COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
    if CFG.sample_n > 1 && n % CFG.sample_n != 0 {
        return res;
    }
    let mut obj = serde_json::json!({
        "ts": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        "method": method.as_str(),
        "path": path,
        "status": res.status().as_u16(),
        "dur_ms": started.elapsed().as_millis() as u64,
    });
    if let Some(ip) = remote {
        obj["remote"] = serde_json::Value::String(ip);
    }
    if let Some(ua) = ua {
        obj["ua"] = serde_json::Value::String(ua);
    }
    tracing::info!(target: amp_otel::ACCESS_TARGET, "{}", obj);
    res
}
