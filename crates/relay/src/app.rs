// HTTP surface: health, metrics and the document WebSocket endpoint, wrapped
// in request-id and panic middleware.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    http::{header, header::HeaderValue, HeaderMap, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::metrics;
use crate::sync::SessionRegistry;
use crate::ws::{self, ConnectionSettings};

const REQUEST_ID_HEADER: &str = "x-request-id";

pub fn build_router(registry: Arc<SessionRegistry>, settings: ConnectionSettings) -> Router {
    apply_middleware(
        Router::new()
            .route("/healthz", get(healthz))
            .route("/metrics", get(metrics_text))
            .merge(ws::router(registry, settings)),
    )
}

pub fn apply_middleware(router: Router) -> Router {
    router
        .layer(middleware::from_fn(request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn metrics_text() -> Response {
    let body =
        metrics::global_metrics().map(|metrics| metrics.render_prometheus()).unwrap_or_default();
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response()
}

/// Resolves on Ctrl-C or SIGTERM; live sessions are flushed afterwards.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("failed to install SIGTERM handler");

    #[cfg(unix)]
    let signal = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.expect("failed to install Ctrl+C handler");
            "ctrl_c"
        }
        _ = terminate.recv() => "sigterm",
    };

    #[cfg(not(unix))]
    let signal = {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
        "ctrl_c"
    };

    info!(signal, "shutting down relay, flushing live documents");
}

async fn panic_handler(request: Request<Body>, next: Next) -> Response {
    let path = request.uri().path().to_owned();
    match tokio::spawn(async move { next.run(request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(%path, ?join_error, "relay handler panicked");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Reuse the caller's `x-request-id` when present, otherwise mint one.
fn request_id_from(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

async fn request_context_middleware(request: Request<Body>, next: Next) -> Response {
    let request_id = request_id_from(request.headers());
    let upgrade = request.headers().contains_key(header::UPGRADE);
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = Instant::now();

    let mut response = next.run(request).await;

    if let Ok(request_id_header) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, request_id_header);
    }

    let status = response.status().as_u16();
    let latency_ms = started_at.elapsed().as_millis() as u64;
    if upgrade {
        info!(%request_id, doc = %path.trim_start_matches('/'), status, "websocket upgrade");
    } else if path == "/healthz" || path == "/metrics" {
        debug!(%request_id, %method, %path, status, latency_ms, "health endpoint served");
    } else {
        info!(%request_id, %method, %path, status, latency_ms, "request completed");
    }

    response
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::{
        body::{to_bytes, Body},
        http::{HeaderMap, HeaderValue, Request, StatusCode},
        routing::get,
        Router,
    };
    use tower::ServiceExt;

    use super::{apply_middleware, build_router, request_id_from};
    use crate::metrics::{set_global_metrics, RelayMetrics};
    use crate::sync::{RegistryOptions, SessionRegistry};
    use crate::ws::ConnectionSettings;

    fn test_router() -> Router {
        let registry = Arc::new(SessionRegistry::new(RegistryOptions::default()));
        build_router(registry, ConnectionSettings { ping_interval: Duration::from_secs(30) })
    }

    #[tokio::test]
    async fn health_check_has_request_id_header() {
        let response = test_router()
            .oneshot(
                Request::builder()
                    .uri("/healthz")
                    .body(Body::empty())
                    .expect("healthz request should build"),
            )
            .await
            .expect("healthz request should succeed");

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));
    }

    #[tokio::test]
    async fn incoming_request_id_is_echoed() {
        let response = test_router()
            .oneshot(
                Request::builder()
                    .uri("/healthz")
                    .header("x-request-id", "req-123")
                    .body(Body::empty())
                    .expect("healthz request should build"),
            )
            .await
            .expect("healthz request should succeed");

        assert_eq!(
            response.headers().get("x-request-id").and_then(|value| value.to_str().ok()),
            Some("req-123")
        );
    }

    #[test]
    fn blank_request_id_is_replaced() {
        let mut headers = HeaderMap::new();
        headers.insert("x-request-id", HeaderValue::from_static(""));

        let request_id = request_id_from(&headers);
        assert!(!request_id.is_empty());
        assert!(uuid::Uuid::parse_str(&request_id).is_ok());
    }

    #[tokio::test]
    async fn metrics_endpoint_renders_prometheus_text() {
        set_global_metrics(Arc::new(RelayMetrics::default()));

        let response = test_router()
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .expect("metrics request should build"),
            )
            .await
            .expect("metrics request should succeed");

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.expect("body should read");
        let text = String::from_utf8(body.to_vec()).expect("metrics should be utf-8");
        assert!(text.contains("cosync_active_sessions"));
    }

    #[tokio::test]
    async fn panic_handler_returns_internal_server_error() {
        async fn panic_route() -> &'static str {
            panic!("test panic");
        }

        let app = apply_middleware(Router::new().route("/panic", get(panic_route)));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/panic")
                    .body(Body::empty())
                    .expect("panic request should build"),
            )
            .await
            .expect("panic request should return a response");

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
