use axum::extract::Request;
use axum::middleware::{from_fn, Next};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use std::time::Instant;
use tracing::info;

use super::handler;
use super::state::AppState;

pub(crate) fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handler::root))
        .route("/api", get(handler::api))
        .fallback(handler::embedded)
        .layer(from_fn(access_log_mw))
        .with_state(state)
}

async fn access_log_mw(req: Request, next: Next) -> Response {
    let path = req.uri().path().to_string();
    let method = req.method().to_string();
    let started = Instant::now();

    let resp = next.run(req).await;
    info!(
        target: "vf_access",
        method = %method,
        path = %path,
        status = %resp.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "response headers sent"
    );
    resp
}
