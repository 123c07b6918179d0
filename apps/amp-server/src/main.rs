use std::net::SocketAddr;
use tracing::{error, info, warn};

mod access_log;
mod app_state;
mod bootstrap;
mod http_client;
mod router;
#[cfg(test)]
mod test_support;

pub(crate) use app_state::AppState;

#[tokio::main]
async fn main() {
    amp_otel::init();
    let bootstrap::BootstrapOutput {
        router,
        state,
        http,
    } = match bootstrap::build().await {
        Ok(out) => out,
        Err(err) => {
            eprintln!("error: {err:#}");
            std::process::exit(2);
        }
    };

    let app = bootstrap::attach_global_layers(bootstrap::attach_http_layers(router));

    let listener = match tokio::net::TcpListener::bind(http.addr).await {
        Ok(listener) => listener,
        Err(err) => {
            eprintln!("error: bind {}: {err}", http.addr);
            std::process::exit(2);
        }
    };
    info!(addr = %http.addr, here = %state.vat().here(), "amp-server listening");

    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal());

    if let Err(err) = server.await {
        error!("http server exited with error: {err}");
    }
}

async fn shutdown_signal() {
    info!("shutdown signal listener active");
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(err) => {
                warn!("SIGTERM handler unavailable: {err}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("shutdown signal received");
}
