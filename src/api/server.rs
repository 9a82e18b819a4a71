use std::future::Future;
use std::net::SocketAddr;

use axum::{
    Router,
    routing::{get, patch, post},
};
use tokio::net::TcpListener;
use tower_http::decompression::RequestDecompressionLayer;
use tracing::info;

use super::{
    services::{
        active_bundles, active_parts, bundle_progress, cancel_part, create_bundle, get_bundle,
        get_part, health, pause_part, paused_parts, resume_part,
    },
    state::AppState,
    stream::{bundles_stream, parts_stream},
};

/// All routes of the HTTP surface
///
/// Static segments (`active`, `paused`, `stream`) are matched before the
/// `{id}` captures.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/bundles", post(create_bundle))
        .route("/bundles/active", get(active_bundles))
        .route("/bundles/stream", get(bundles_stream))
        .route("/bundles/{bundle_id}", get(get_bundle))
        .route("/bundles/{bundle_id}/progress", get(bundle_progress))
        .route("/parts/active", get(active_parts))
        .route("/parts/paused", get(paused_parts))
        .route("/parts/stream", get(parts_stream))
        .route("/parts/{part_id}", get(get_part).delete(cancel_part))
        .route("/parts/{part_id}/pause", patch(pause_part))
        .route("/parts/{part_id}/resume", patch(resume_part))
        .route("/health", get(health))
        .with_state(state)
        // Automatically decompress gzip request bodies
        .layer(RequestDecompressionLayer::new())
}

/// Serve the router on `address` until `shutdown` resolves
pub async fn serve<F>(address: SocketAddr, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(address).await?;
    info!(address = %listener.local_addr()?, "bundlebox API listening");

    axum::serve(listener, router(state).into_make_service())
        .with_graceful_shutdown(shutdown)
        .await
}
