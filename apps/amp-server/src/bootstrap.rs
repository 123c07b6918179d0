use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use amp_core::config::HttpConfig;
use amp_core::samples::Drum;
use amp_core::{load_config, Config, Vat, VatSettings};
use amp_events::Bus;
use amp_kernel::{Kernel, KernelStore};
use anyhow::Context;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::http_client::HttpTransport;
use crate::{access_log, router, AppState};

const DEFAULT_CONFIG: &str = "configs/default.toml";

pub(crate) struct BootstrapOutput {
    pub router: axum::Router<()>,
    pub state: AppState,
    pub http: HttpSettings,
}

pub(crate) async fn build() -> anyhow::Result<BootstrapOutput> {
    let config = config_from_env()?;
    let settings = VatSettings::from_config(&config.vat)?;
    let http = http_settings(&config.http)?;
    let state = build_state(settings, &http).await?;
    let router = router::build(state.clone());
    Ok(BootstrapOutput {
        router,
        state,
        http,
    })
}

fn config_from_env() -> anyhow::Result<Config> {
    let path = std::env::var("AMP_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG.into());
    if !Path::new(&path).exists() {
        info!(path = %path, "config file not found; using defaults");
        return Ok(Config::default());
    }
    load_config(&path).with_context(|| format!("loading {path}"))
}

/// Opens the kernel, revives the vat from its image and starts hosting it.
pub(crate) async fn build_state(settings: VatSettings, http: &HttpSettings) -> anyhow::Result<AppState> {
    let bus = Bus::new(256);
    let kernel = Kernel::open(&settings.state_dir)
        .with_context(|| format!("opening kernel in {}", settings.state_dir.display()))?;
    if trace_persist_enabled() {
        spawn_trace_forwarder(bus.clone(), kernel.clone());
    }
    let max_content_bytes = settings.max_content_bytes;
    let store = KernelStore::new(kernel.clone(), settings.name.clone());
    let mut vat = Vat::open(settings, Box::new(store), Some(bus))?;
    let drum = vat.publish("drum", Box::new(Drum::new()))?;
    info!(url = %drum.to_url(), "drum published");
    let transport = Arc::new(HttpTransport::new(http, max_content_bytes)?);
    let handle = amp_core::spawn(vat, transport);
    Ok(AppState::new(handle, kernel, max_content_bytes))
}

fn trace_persist_enabled() -> bool {
    std::env::var("AMP_TRACE_PERSIST").ok().as_deref() == Some("1")
}

fn spawn_trace_forwarder(bus: Bus, kernel: Kernel) {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            let env = match rx.recv().await {
                Ok(env) => env,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "trace forwarder lagged");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            if !amp_topics::ALL.contains(&env.kind.as_str()) {
                continue;
            }
            if let Err(err) = kernel.append_event_async(&env).await {
                warn!(kind = %env.kind, "trace event not persisted: {err:#}");
            }
        }
    });
}

pub(crate) fn attach_http_layers(router: axum::Router<()>) -> axum::Router<()> {
    use tower_http::trace::TraceLayer;

    router.layer(TraceLayer::new_for_http())
}

pub(crate) fn attach_global_layers(router: axum::Router<()>) -> axum::Router<()> {
    router.layer(axum::middleware::from_fn(access_log::access_log_mw))
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum HttpConfigError {
    #[error("invalid AMP_PORT: {0}")]
    InvalidPort(String),
    #[error("invalid AMP_BIND: {0}")]
    InvalidBind(String),
    #[error("invalid {key}: {value}")]
    InvalidSeconds { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub(crate) struct HttpSettings {
    pub addr: SocketAddr,
    pub timeout: Duration,
    pub connect_timeout: Duration,
}

fn secs_from_env(key: &'static str, configured: Option<u64>, default: u64) -> Result<Duration, HttpConfigError> {
    let secs = match std::env::var(key) {
        Ok(raw) => raw
            .parse::<u64>()
            .map_err(|_| HttpConfigError::InvalidSeconds { key, value: raw })?,
        Err(_) => configured.unwrap_or(default),
    };
    Ok(Duration::from_secs(secs.max(1)))
}

/// Listener and client settings: `[http]` from the config file, then the
/// `AMP_BIND`/`AMP_PORT`/`AMP_HTTP_*` overrides.
pub(crate) fn http_settings(cfg: &HttpConfig) -> Result<HttpSettings, HttpConfigError> {
    let bind = std::env::var("AMP_BIND")
        .ok()
        .or_else(|| cfg.bind.clone())
        .unwrap_or_else(|| "127.0.0.1".into());
    let port = match std::env::var("AMP_PORT") {
        Ok(raw) => raw.parse().map_err(|_| HttpConfigError::InvalidPort(raw))?,
        Err(_) => cfg.port.unwrap_or(8091),
    };
    let addr = format!("{bind}:{port}")
        .parse()
        .map_err(|_| HttpConfigError::InvalidBind(bind.clone()))?;
    Ok(HttpSettings {
        addr,
        timeout: secs_from_env("AMP_HTTP_TIMEOUT_SECS", cfg.timeout_secs, 30)?,
        connect_timeout: secs_from_env("AMP_HTTP_CONNECT_TIMEOUT_SECS", cfg.connect_timeout_secs, 3)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::env;

    const KEYS: [&str; 4] = [
        "AMP_BIND",
        "AMP_PORT",
        "AMP_HTTP_TIMEOUT_SECS",
        "AMP_HTTP_CONNECT_TIMEOUT_SECS",
    ];

    #[test]
    fn http_settings_layer_env_over_file() {
        let mut guard = env::guard();
        for key in KEYS {
            guard.remove(key);
        }
        let file = HttpConfig {
            bind: Some("0.0.0.0".into()),
            port: Some(9000),
            timeout_secs: Some(10),
            connect_timeout_secs: None,
        };
        let http = http_settings(&file).unwrap();
        assert_eq!(http.addr, "0.0.0.0:9000".parse().unwrap());
        assert_eq!(http.timeout, Duration::from_secs(10));
        assert_eq!(http.connect_timeout, Duration::from_secs(3));

        guard.set("AMP_PORT", "9100");
        guard.set("AMP_HTTP_TIMEOUT_SECS", "0");
        let http = http_settings(&file).unwrap();
        assert_eq!(http.addr.port(), 9100);
        assert_eq!(http.timeout, Duration::from_secs(1));
    }

    #[test]
    fn malformed_overrides_are_reported() {
        let mut guard = env::guard();
        for key in KEYS {
            guard.remove(key);
        }
        guard.set("AMP_PORT", "eighty");
        assert!(matches!(
            http_settings(&HttpConfig::default()),
            Err(HttpConfigError::InvalidPort(p)) if p == "eighty"
        ));
        guard.remove("AMP_PORT");
        guard.set("AMP_BIND", "not an address");
        assert!(matches!(
            http_settings(&HttpConfig::default()),
            Err(HttpConfigError::InvalidBind(_))
        ));
    }
}
