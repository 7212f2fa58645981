//! HTTP endpoints of the node.
//!
//! * `POST /rpc` accepts a [Request] and replies with its code.
//! * `GET /metrics` serves the runtime metrics in the Prometheus text format.

use axum::{
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    serve, Extension, Json, Router,
};
use commonware_runtime::Metrics;
use std::{io, net::SocketAddr};
use tally_aggregator::rpc::{dispatch, Reply, Request, Service};
use tokio::net::TcpListener;
use tracing::{debug, info};

async fn handle<S: Service>(
    Extension(service): Extension<S>,
    Json(request): Json<Request>,
) -> Json<Reply> {
    debug!(?request, "received request");
    Json(dispatch(&service, request).await)
}

/// Routes operator calls to `service`.
pub fn rpc<S: Service>(service: S) -> Router {
    Router::new()
        .route("/rpc", post(handle::<S>))
        .layer(Extension(service))
}

/// Exposes everything registered on `context` (and its children).
pub fn metrics<M: Metrics + Clone + Send + Sync + 'static>(context: M) -> Router {
    Router::new()
        .route(
            "/metrics",
            get(|Extension(context): Extension<M>| async move {
                (
                    StatusCode::OK,
                    [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
                    context.encode(),
                )
                    .into_response()
            }),
        )
        .layer(Extension(context))
}

/// Serves `app` on `address` until the listener fails.
pub async fn run(address: SocketAddr, app: Router) -> Result<(), io::Error> {
    let listener = TcpListener::bind(address).await?;
    info!(address = %listener.local_addr()?, "listening");
    serve(listener, app.into_make_service()).await
}
