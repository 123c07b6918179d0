use std::time::Duration;

use amp_core::{Transport, TransportError, WireRequest, WireResponse};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::CONTENT_TYPE;
use tracing::debug;

use crate::bootstrap::HttpSettings;

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(default)
}

fn keepalive() -> Duration {
    Duration::from_secs(env_u64("AMP_HTTP_TCP_KEEPALIVE_SECS", 60).max(1))
}

fn pool_idle() -> Duration {
    Duration::from_secs(env_u64("AMP_HTTP_POOL_IDLE_SECS", 90).max(1))
}

fn user_agent() -> String {
    format!("amp-server/{}", env!("CARGO_PKG_VERSION"))
}

/// Base client builder with harmonized defaults. Redirects are left to the
/// vat: a 303 carries the resolution of a promise.
pub fn builder(http: &HttpSettings) -> reqwest::ClientBuilder {
    reqwest::Client::builder()
        .user_agent(user_agent())
        .connect_timeout(http.connect_timeout)
        .tcp_keepalive(keepalive())
        .pool_idle_timeout(pool_idle())
        .redirect(reqwest::redirect::Policy::none())
}

/// Sends a vat's outbound requests over HTTP.
#[derive(Clone)]
pub(crate) struct HttpTransport {
    client: reqwest::Client,
    max_content_bytes: usize,
}

impl HttpTransport {
    pub fn new(http: &HttpSettings, max_content_bytes: usize) -> anyhow::Result<Self> {
        let client = builder(http).timeout(http.timeout).build()?;
        Ok(Self {
            client,
            max_content_bytes,
        })
    }
}

fn classify(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else {
        TransportError::Other(err.to_string())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn exchange(&self, peer: &str, request: WireRequest) -> Result<WireResponse, TransportError> {
        debug!(peer, method = %request.method, "exchange");
        let mut outbound = self.client.request(request.method, &request.target);
        if let Some(content_type) = request.content_type {
            outbound = outbound.header(CONTENT_TYPE, content_type).body(request.body);
        }
        let response = outbound.send().await.map_err(classify)?;
        let limit = self.max_content_bytes;
        if response.content_length().is_some_and(|len| len > limit as u64) {
            return Err(TransportError::TooMuchData { limit });
        }
        let status = response.status();
        let headers = response.headers().clone();
        let mut body = Vec::new();
        let mut chunks = response.bytes_stream();
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk.map_err(classify)?;
            if body.len() + chunk.len() > limit {
                return Err(TransportError::TooMuchData { limit });
            }
            body.extend_from_slice(&chunk);
        }
        Ok(WireResponse {
            status,
            headers,
            body,
        })
    }

    /// Separate connections do not keep requests in order, so each link
    /// waits for one answer before sending the next request.
    fn max_in_flight(&self) -> usize {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{bootstrap, router, test_support::env};
    use amp_core::{spawn, MemoryStore, Ref, Value, Vat, VatSettings};
    use axum::{routing::get, Router};
    use std::net::SocketAddr;
    use std::sync::Arc;

    fn settings() -> HttpSettings {
        HttpSettings {
            addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(1),
        }
    }

    async fn listen(app: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn oversized_responses_are_refused() {
        let addr = listen(Router::new().route("/", get(|| async { "x".repeat(4096) }))).await;
        let transport = HttpTransport::new(&settings(), 1024).unwrap();
        let peer = format!("http://{addr}/");
        let err = transport
            .exchange(&peer, WireRequest::new(axum::http::Method::GET, peer.clone()))
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::TooMuchData { limit: 1024 });
    }

    #[tokio::test]
    async fn unreachable_peer_is_a_connect_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let transport = HttpTransport::new(&settings(), 1024).unwrap();
        let peer = format!("http://{addr}/");
        let err = transport
            .exchange(&peer, WireRequest::new(axum::http::Method::GET, peer.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Connect(_)), "{err:?}");
    }

    #[tokio::test]
    async fn vats_pipeline_calls_over_http() {
        let dir = tempfile::tempdir().unwrap();
        let mut guard = env::guard();
        guard.remove("AMP_TRACE_PERSIST");

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut remote = VatSettings::default().with_here(&format!("http://{addr}/"));
        remote.state_dir = dir.path().to_path_buf();
        let state = bootstrap::build_state(remote, &settings()).await.unwrap();
        let drum = state
            .vat()
            .call(|vat| Ok(vat.root().fetch("drum").and_then(|v| v.as_str()).map(str::to_string)))
            .await
            .unwrap()
            .unwrap();
        let app = router::build(state);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let local = Vat::open(VatSettings::default(), Box::new(MemoryStore::new()), None).unwrap();
        let transport = Arc::new(HttpTransport::new(&settings(), 1 << 20).unwrap());
        let handle = spawn(local, transport);
        let url = format!("http://{addr}/#s={drum}");
        let (banged, hits) = handle
            .call(move |vat| {
                let drum = vat.import(&url);
                let banged = vat.invoke(drum.clone(), "bang", vec![Value::from(3)])?;
                let hits = vat.get(drum, "hits")?;
                Ok((banged, hits))
            })
            .await
            .unwrap();

        let banged = handle.settled(banged).await.unwrap().unwrap();
        assert!(matches!(banged, Value::Ref(Ref::Remote(_))), "{banged:?}");
        let hits = handle.settled(hits).await.unwrap();
        assert_eq!(hits, Ok(Value::Int(3)));
    }
}
