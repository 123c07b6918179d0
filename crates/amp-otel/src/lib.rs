use once_cell::sync::OnceCell;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::{
    fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter,
};

/// Target used by the HTTP access log.
pub const ACCESS_TARGET: &str = "http.access";

static ACCESS_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();

/// Installs the global subscriber. `RUST_LOG` selects the console filter
/// (default `info`); `AMP_ACCESS_LOG_ROLL=1` also writes the access log to
/// rolling files.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    install_console(filter);
}

/// Rolling file settings of the access log, read from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessLog {
    pub dir: String,
    pub prefix: String,
    pub rotation: String,
}

impl AccessLog {
    pub fn from_env() -> Option<Self> {
        if std::env::var("AMP_ACCESS_LOG_ROLL").ok().as_deref() != Some("1") {
            return None;
        }
        Some(Self {
            dir: std::env::var("AMP_ACCESS_LOG_DIR")
                .ok()
                .or_else(|| std::env::var("AMP_LOGS_DIR").ok())
                .unwrap_or_else(|| "logs".to_string()),
            prefix: std::env::var("AMP_ACCESS_LOG_PREFIX").unwrap_or_else(|_| "http-access".into()),
            rotation: std::env::var("AMP_ACCESS_LOG_ROTATION")
                .unwrap_or_else(|_| "daily".into())
                .to_lowercase(),
        })
    }

    fn appender(&self) -> tracing_appender::rolling::RollingFileAppender {
        match self.rotation.as_str() {
            "hourly" => tracing_appender::rolling::hourly(&self.dir, &self.prefix),
            "minutely" => tracing_appender::rolling::minutely(&self.dir, &self.prefix),
            _ => tracing_appender::rolling::daily(&self.dir, &self.prefix),
        }
    }
}

fn install_console(filter: EnvFilter) {
    let fmt_layer = fmt::layer();
    let registry = tracing_subscriber::registry().with(fmt_layer.with_filter(filter));
    if let Some(access) = AccessLog::from_env() {
        if std::fs::create_dir_all(&access.dir).is_err() {
            tracing::warn!(directory = %access.dir, "failed to create access log directory");
        }
        let (nb, guard) = tracing_appender::non_blocking(access.appender());
        let _ = ACCESS_GUARD.set(guard);
        let targets = Targets::new().with_target(ACCESS_TARGET, tracing::Level::INFO);
        let access_layer = fmt::layer()
            .with_ansi(false)
            .with_target(false)
            .with_writer(nb)
            .with_filter(targets);
        let subscriber = registry.with(access_layer);
        let _ = subscriber.try_init();
    } else {
        let _ = registry.try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_log_settings_follow_the_environment() {
        std::env::remove_var("AMP_ACCESS_LOG_ROLL");
        assert_eq!(AccessLog::from_env(), None);
        std::env::set_var("AMP_ACCESS_LOG_ROLL", "1");
        std::env::set_var("AMP_ACCESS_LOG_DIR", "/tmp/amp-logs");
        std::env::set_var("AMP_ACCESS_LOG_ROTATION", "Hourly");
        let access = AccessLog::from_env().unwrap();
        std::env::remove_var("AMP_ACCESS_LOG_ROLL");
        std::env::remove_var("AMP_ACCESS_LOG_DIR");
        std::env::remove_var("AMP_ACCESS_LOG_ROTATION");
        assert_eq!(access.dir, "/tmp/amp-logs");
        assert_eq!(access.prefix, "http-access");
        assert_eq!(access.rotation, "hourly");
    }
}
