use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::HttpError;
use crate::routes::{AppState, router};

pub async fn bind(addr: &str) -> Result<TcpListener, HttpError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| HttpError::Bind {
            addr: addr.to_string(),
            source,
        })
}

/// Serves the gateway routes on `listener` until `shutdown` fires. In-flight
/// requests are allowed to finish.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: CancellationToken,
) -> Result<(), HttpError> {
    let local_addr: Option<SocketAddr> = listener.local_addr().ok();
    info!(target: "http", addr = ?local_addr, "HTTP gateway listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            info!(target: "http", "HTTP gateway shutting down");
        })
        .await
        .map_err(HttpError::Serve)
}
