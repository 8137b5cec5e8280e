use super::GatewayState;
use crate::proxy::{full_body, BoxBody};
use crate::queue::message::QueueKind;
use hyper::body::Incoming;
use hyper::{Request, Response};

/// Operator listener: liveness, readiness and the Prometheus scrape
/// endpoint. The client-facing management surface lives under `/api/queue`
/// on the main listener.
pub async fn handle_admin(
    req: Request<Incoming>,
    state: GatewayState,
) -> Result<Response<BoxBody>, hyper::Error> {
    match req.uri().path() {
        "/health" | "/healthz" => Ok(Response::builder()
            .status(200)
            .body(full_body(r#"{"status":"ok"}"#))
            .unwrap()),

        "/ready" | "/readyz" => {
            let connected = state.store.ping().await;
            let depth = state.store.len(QueueKind::Main).await.unwrap_or(0);
            let status = if connected { 200 } else { 503 };
            Ok(Response::builder()
                .status(status)
                .header("content-type", "application/json")
                .body(full_body(format!(
                    r#"{{"status":"{}","services":{},"queue_connected":{},"queue_depth":{}}}"#,
                    if connected { "ready" } else { "degraded" },
                    state.config.services.urls.len(),
                    connected,
                    depth,
                )))
                .unwrap())
        }

        "/metrics" => {
            let body = state
                .metrics
                .as_ref()
                .map(|m| m.render())
                .unwrap_or_default();
            Ok(Response::builder()
                .status(200)
                .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
                .body(full_body(body))
                .unwrap())
        }

        _ => Ok(Response::builder()
            .status(404)
            .body(full_body(r#"{"error":"not found"}"#))
            .unwrap()),
    }
}
