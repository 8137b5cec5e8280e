use crate::error::GatewayError;
use crate::proxy::context::{full_body, BoxBody, RequestContext};
use crate::queue::message::{is_mutating, method_priority, QueueKind, QueuedMessage};
use crate::server::{ops, GatewayState};
use crate::upstream::client::{compose_url, UpstreamRequest};
use bytes::Bytes;
use chrono::Utc;
use http::StatusCode;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A fully-buffered incoming request. The hyper edge collapses to this so
/// the dispatch pipeline stays independent of the body transport (and
/// directly drivable from tests).
pub struct RequestParts {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub headers: http::HeaderMap,
    pub body: Bytes,
    pub client_ip: std::net::IpAddr,
}

/// Hyper entry point: buffer the body, resolve the client IP, dispatch.
pub async fn handle_request(
    req: Request<Incoming>,
    state: GatewayState,
    peer_addr: SocketAddr,
) -> Result<Response<BoxBody>, hyper::Error> {
    let method = req.method().as_str().to_uppercase();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(|q| q.to_string());
    let headers = req.headers().clone();

    // Trust the left-most X-Forwarded-For entry when present (a trusted
    // reverse proxy in front), otherwise the TCP peer.
    let client_ip = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|s| s.trim().parse::<std::net::IpAddr>().ok())
        .unwrap_or_else(|| peer_addr.ip());

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!("proxy: failed to read request body, path={}, error={}", path, e);
            return Ok(Response::builder()
                .status(StatusCode::BAD_REQUEST)
                .header("content-type", "application/json")
                .body(full_body(r#"{"error":"bad request"}"#))
                .unwrap());
        }
    };

    let parts = RequestParts {
        method,
        path,
        query,
        headers,
        body,
        client_ip,
    };

    Ok(route_and_dispatch(parts, state).await)
}

/// Dispatch one buffered request through the gateway surface:
///
/// 1. gateway-owned endpoints (`health`, `services/...`, `queue/...`)
/// 2. selector routing → forward decision table
/// 3. miss → hint response
pub async fn route_and_dispatch(parts: RequestParts, state: GatewayState) -> Response<BoxBody> {
    let request_id = parts
        .headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let mut ctx = RequestContext::new(
        parts.method.clone(),
        parts.path.clone(),
        parts.client_ip,
        request_id,
    );

    let trimmed = parts.path.trim_start_matches('/');
    let rest = trimmed
        .strip_prefix("api/")
        .unwrap_or(trimmed)
        .trim_end_matches('/');
    let rest = if rest == "api" { "" } else { rest };

    if rest == "health" {
        return ops::gateway_health(&ctx);
    }
    if rest == "services/health" {
        return ops::services_health(&state, &ctx).await;
    }
    if let Some(name) = rest
        .strip_prefix("services/")
        .and_then(|r| r.strip_suffix("/health"))
    {
        return ops::service_health(&state, &ctx, name).await;
    }
    if let Some(op) = rest.strip_prefix("queue/") {
        return ops::handle_queue_op(&state, &ctx, op, &parts).await;
    }

    let Some(route) = state.router.resolve(&parts.path) else {
        return miss_response(&state, &ctx, rest);
    };
    ctx.service = route.service;
    ctx.endpoint = route.endpoint;

    forward(&state, &ctx, &parts).await
}

/// Unrecognized selector → 400 with the selector list; paths with no
/// selector segment at all → 404 with the same hint.
fn miss_response(state: &GatewayState, ctx: &RequestContext, rest: &str) -> Response<BoxBody> {
    let selectors = state.router.selectors().to_vec();
    if rest.is_empty() {
        debug!("proxy: no path matched, path={}", ctx.path);
        return ctx.error_response(
            StatusCode::NOT_FOUND,
            json!({
                "error": "not found",
                "message": "no route for path",
                "recognized_selectors": selectors,
            }),
        );
    }
    debug!(
        "proxy: unknown service selector, path={}, selector={}",
        ctx.path,
        rest.split('/').next().unwrap_or("")
    );
    ctx.error_response(
        StatusCode::BAD_REQUEST,
        json!({
            "error": "unknown service selector",
            "message": format!("selector '{}' is not recognized", rest.split('/').next().unwrap_or("")),
            "recognized_selectors": selectors,
        }),
    )
}

/// The §availability decision table: healthy → direct call (transport
/// failure falls through), unhealthy + mutating → enqueue, unhealthy +
/// non-mutating → fail fast.
async fn forward(
    state: &GatewayState,
    ctx: &RequestContext,
    parts: &RequestParts,
) -> Response<BoxBody> {
    if state.health.is_available(&ctx.service).await {
        match direct_forward(state, ctx, parts).await {
            Ok(resp) => return resp,
            Err(e) => {
                warn!(
                    "proxy: direct forward failed, service={}, endpoint={}, error={}",
                    ctx.service, ctx.endpoint, e
                );
                state.health.mark_unhealthy(&ctx.service, e.to_string());
            }
        }
    }

    unavailable_response(state, ctx, parts).await
}

/// Synchronous upstream call; the upstream's status and body are relayed
/// verbatim. Only transport-level failures surface as `Err`.
async fn direct_forward(
    state: &GatewayState,
    ctx: &RequestContext,
    parts: &RequestParts,
) -> Result<Response<BoxBody>, GatewayError> {
    let base = state
        .health
        .url_of(&ctx.service)
        .ok_or_else(|| GatewayError::UnknownService(ctx.service.clone()))?;

    let mut url = compose_url(&base, &ctx.endpoint);
    if let Some(ref q) = parts.query {
        url.push('?');
        url.push_str(q);
    }

    let mut headers = filter_forward_headers(&parts.headers);
    headers.insert("x-request-id".to_string(), ctx.request_id.clone());

    let body = if parts.body.is_empty() || ctx.method == "GET" || ctx.method == "HEAD" {
        None
    } else {
        Some(parts.body.clone())
    };

    let resp = state
        .upstream
        .execute(UpstreamRequest {
            url,
            method: ctx.method.clone(),
            headers,
            body,
        })
        .await?;

    ctx.finalize_metrics(resp.status);
    info!(
        client_ip = %ctx.client_ip,
        method = %ctx.method,
        path = %ctx.path,
        status = resp.status,
        service = %ctx.service,
        latency_ms = %ctx.start.elapsed().as_millis(),
        "access"
    );

    Ok(Response::builder()
        .status(StatusCode::from_u16(resp.status).unwrap_or(StatusCode::BAD_GATEWAY))
        .header(
            "content-type",
            resp.content_type
                .unwrap_or_else(|| "application/json".to_string()),
        )
        .body(full_body(resp.body))
        .unwrap())
}

/// Unavailability policy: mutating requests are stored for re-delivery,
/// everything else is rejected outright.
async fn unavailable_response(
    state: &GatewayState,
    ctx: &RequestContext,
    parts: &RequestParts,
) -> Response<BoxBody> {
    if !is_mutating(&ctx.method) {
        return ctx.error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            json!({
                "error": "service temporarily unavailable",
                "service": ctx.service,
                "endpoint": ctx.endpoint,
                "method": ctx.method,
                "queued": false,
            }),
        );
    }

    let msg = build_queued_message(state, ctx, parts);

    match state.store.push(QueueKind::Main, &msg).await {
        Ok(()) => {
            metrics::counter!(
                "gateway_queue_enqueued_total",
                "service" => ctx.service.clone(),
            )
            .increment(1);
            info!(
                "proxy: request queued, id={}, service={}, endpoint={}, method={}",
                msg.id, msg.service, msg.endpoint, msg.method
            );
            let retry_estimate = humantime::format_duration(Duration::from_secs(
                state.config.worker.poll_interval_secs,
            ))
            .to_string();
            ctx.error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                json!({
                    "error": "service temporarily unavailable",
                    "message": "request queued for delivery",
                    "service": ctx.service,
                    "endpoint": ctx.endpoint,
                    "method": ctx.method,
                    "queued": true,
                    "message_id": msg.id,
                    "estimated_retry_time": retry_estimate,
                }),
            )
        }
        Err(e) => {
            // Queue backend down: best-effort parking in the ephemeral
            // cache so the operator can still see the request.
            warn!(
                "proxy: queue backend unreachable, caching request, id={}, error={}",
                msg.id, e
            );
            if let Ok(value) = serde_json::to_value(&msg) {
                state.cache.set(
                    format!("cached_request_{}", msg.id),
                    value,
                    Duration::from_secs(state.config.cache.fallback_ttl_secs),
                );
            }
            ctx.error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                json!({
                    "error": "service temporarily unavailable",
                    "message": "queue backend unreachable, request cached",
                    "service": ctx.service,
                    "endpoint": ctx.endpoint,
                    "method": ctx.method,
                    "queued": false,
                    "cached": true,
                    "message_id": msg.id,
                }),
            )
        }
    }
}

fn build_queued_message(
    state: &GatewayState,
    ctx: &RequestContext,
    parts: &RequestParts,
) -> QueuedMessage {
    let data: serde_json::Value = if parts.body.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&parts.body).unwrap_or_else(|e| {
            warn!(
                "proxy: request body is not valid json, storing null, path={}, error={}",
                ctx.path, e
            );
            serde_json::Value::Null
        })
    };

    let user_agent = header_str(&parts.headers, "user-agent");

    QueuedMessage {
        id: uuid::Uuid::new_v4().to_string(),
        timestamp: Utc::now(),
        service: ctx.service.clone(),
        endpoint: ctx.endpoint.clone(),
        method: ctx.method.clone(),
        data,
        headers: filter_forward_headers(&parts.headers),
        retry_count: 0,
        max_retries: state.config.worker.max_retries,
        priority: method_priority(&ctx.method),
        user_id: derive_user_id(&parts.headers),
        session_id: Some(derive_session_id(&parts.headers, ctx.client_ip)),
        ip_address: Some(ctx.client_ip.to_string()),
        user_agent,
        request_id: Some(ctx.request_id.clone()),
        dead_letter_timestamp: None,
        not_before: None,
    }
}

fn header_str(headers: &http::HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

/// Headers to forward upstream: hop-by-hop metadata and anything the
/// gateway re-derives (`host`, `content-length`) is stripped.
fn filter_forward_headers(headers: &http::HeaderMap) -> HashMap<String, String> {
    const SKIP: &[&str] = &[
        "host",
        "content-length",
        "connection",
        "keep-alive",
        "transfer-encoding",
        "upgrade",
        "proxy-authenticate",
        "proxy-authorization",
        "te",
        "trailers",
    ];

    headers
        .iter()
        .filter_map(|(name, value)| {
            let name = name.as_str().to_ascii_lowercase();
            if SKIP.contains(&name.as_str()) {
                return None;
            }
            value.to_str().ok().map(|v| (name, v.to_string()))
        })
        .collect()
}

/// Correlation identity: the authenticated principal when the auth layer
/// forwards one, else a digest of the bearer token, else absent.
fn derive_user_id(headers: &http::HeaderMap) -> Option<String> {
    if let Some(user) = header_str(headers, "x-user-id") {
        return Some(user);
    }
    let auth = header_str(headers, "authorization")?;
    if auth.starts_with("Bearer ") {
        return Some(sha256_hex(auth.as_bytes()));
    }
    None
}

/// Correlation-only session identifier: digest of client IP, user agent,
/// `X-Requested-With` and the current unix second. Two requests from one
/// client within the same second collide — acceptable, this never gates
/// anything.
fn derive_session_id(headers: &http::HeaderMap, client_ip: std::net::IpAddr) -> String {
    let user_agent = header_str(headers, "user-agent").unwrap_or_default();
    let requested_with = header_str(headers, "x-requested-with").unwrap_or_default();
    let seed = format!(
        "{}{}{}{}",
        client_ip,
        user_agent,
        requested_with,
        Utc::now().timestamp()
    );
    sha256_hex(seed.as_bytes())
}

fn sha256_hex(input: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input);
    hex::encode(hasher.finalize())
}
