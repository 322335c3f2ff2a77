use std::time::Instant;

use axum::{
    body::Body, extract::MatchedPath, http::Request, middleware::Next, response::IntoResponse,
    routing::get, Router,
};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

pub const COMMENTS_FETCHED: &str = "guardian_comments_fetched_total";
pub const COMMENTS_MATCHED: &str = "guardian_comments_matched_total";
pub const COMMENTS_HIDDEN: &str = "guardian_comments_hidden_total";
pub const MODERATION_CHUNK_FAILURES: &str = "guardian_moderation_chunk_failures_total";
pub const CHECKPOINT_SAVES: &str = "guardian_checkpoint_saves_total";
pub const CHECKPOINT_SAVE_FAILURES: &str = "guardian_checkpoint_save_failures_total";
pub const CYCLES: &str = "guardian_cycles_total";
pub const CYCLE_DURATION: &str = "guardian_cycle_duration_ms";
pub const QUEUE_DEPTH: &str = "guardian_queue_depth";
pub const RECENT_WINDOW_OVERFLOW: &str = "guardian_recent_window_overflow_total";
pub const DROPPED_ON_SHUTDOWN: &str = "guardian_comments_dropped_on_shutdown_total";

/// Bind a `TcpListener` on the provided bind address to serve a `Router` on it.
/// This function is intended to take a Router as returned by `setup_metrics_routes`, potentially with more routes added by the caller.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router).await?;

    Ok(())
}

/// Add the prometheus endpoint and middleware to a router, should be called last.
pub fn setup_metrics_routes(router: Router) -> Result<Router, BuildError> {
    let recorder_handle = setup_metrics_recorder()?;

    Ok(router
        .route(
            "/metrics",
            get(move || std::future::ready(recorder_handle.render())),
        )
        .layer(axum::middleware::from_fn(track_metrics)))
}

pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    // Milliseconds: a cycle spans a few requests up to a full historical scan.
    const BUCKETS: &[f64] = &[
        10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0, 30000.0, 120000.0, 600000.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(BUCKETS)?
        .install_recorder()
}

/// Middleware to record some common HTTP metrics
pub async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();

    let path = if let Some(matched_path) = req.extensions().get::<MatchedPath>() {
        matched_path.as_str().to_owned()
    } else {
        req.uri().path().to_owned()
    };

    let method = req.method().clone();

    let response = next.run(req).await;

    let latency = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    let labels = [
        ("method", method.to_string()),
        ("path", path),
        ("status", status),
    ];

    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_requests_duration_seconds", &labels).record(latency);

    response
}
