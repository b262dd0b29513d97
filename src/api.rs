use std::net::SocketAddr;

use axum::{Router, routing::get};
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::handler::AppState;

pub(crate) fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .merge(crate::handler::stream::stream_router())
        .with_state(state)
}

/// Binds `addr` and serves the admin API until `cancel` fires.
pub(crate) async fn start_api_server(
    addr: SocketAddr,
    state: AppState,
    cancel: CancellationToken,
) -> anyhow::Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    log::info!("API: listening on {}", local);

    let app = app_router(state);
    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(cancel))
            .await
        {
            log::error!("API: server error: {}", e);
        }
    });
    Ok((local, handle))
}

async fn shutdown_signal(cancel: CancellationToken) {
    cancel.cancelled().await;
    log::info!("API: shutting down");
}

async fn health() -> &'static str {
    "ok"
}

#[cfg(all(test, unix))]
#[path = "api_test.rs"]
mod api_test;
