use crate::error::GatewayError;
use crate::proxy::context::{BoxBody, RequestContext};
use crate::proxy::handler::RequestParts;
use crate::queue::message::QueueKind;
use crate::queue::worker::RetryOutcome;
use crate::server::GatewayState;
use chrono::Utc;
use http::StatusCode;
use hyper::Response;
use serde_json::json;
use tracing::{error, info};

/// Main-queue depth beyond which the summary reports `degraded`.
const DEGRADED_DEPTH: usize = 1000;
/// Depth beyond which, combined with every upstream down, it reports
/// `unhealthy`.
const CRITICAL_DEPTH: usize = 5000;

const DEFAULT_LIST_LIMIT: usize = 100;

/// Gateway liveness — answers regardless of backend state.
pub fn gateway_health(ctx: &RequestContext) -> Response<BoxBody> {
    ctx.json_response(
        StatusCode::OK,
        &json!({
            "status": "ok",
            "service": "relay-gateway",
            "timestamp": Utc::now().to_rfc3339(),
        }),
    )
}

/// All-upstream health snapshot; stale entries are re-probed.
pub async fn services_health(state: &GatewayState, ctx: &RequestContext) -> Response<BoxBody> {
    let snapshot = state.health.check_all().await;
    ctx.json_response(
        StatusCode::OK,
        &json!({
            "services": snapshot,
            "timestamp": Utc::now().to_rfc3339(),
        }),
    )
}

/// Per-upstream status plus the queue view the operator will reach for
/// next when a service is down.
pub async fn service_health(
    state: &GatewayState,
    ctx: &RequestContext,
    name: &str,
) -> Response<BoxBody> {
    let Some(entry) = state.health.check(name).await else {
        return ctx.error_response(
            StatusCode::NOT_FOUND,
            json!({
                "error": "unknown service",
                "service": name,
                "recognized_services": state.health.service_names(),
            }),
        );
    };

    let pending = state.store.len(QueueKind::Main).await.ok();
    let connected = state.store.ping().await;

    ctx.json_response(
        StatusCode::OK,
        &json!({
            "service": name,
            "url": state.health.url_of(name),
            "health": entry,
            "queue": {
                "pending": pending,
                "connected": connected,
            },
            "timestamp": Utc::now().to_rfc3339(),
        }),
    )
}

/// The `/api/queue/*` operations surface. Failures are reported as 500
/// with the error message in-body — operator-facing, no request payloads.
pub async fn handle_queue_op(
    state: &GatewayState,
    ctx: &RequestContext,
    op: &str,
    parts: &RequestParts,
) -> Response<BoxBody> {
    let result = match (ctx.method.as_str(), op) {
        ("GET", "status") => queue_status(state, ctx).await,
        ("GET", "requests") => list_queue(state, ctx, QueueKind::Main, parts).await,
        ("GET", "dead-letter-requests") => {
            list_queue(state, ctx, QueueKind::DeadLetter, parts).await
        }
        ("POST", "process") => process_queue(state, ctx, parts).await,
        ("POST", "retry") => retry_message(state, ctx, parts).await,
        ("POST", "purge") => purge_queue(state, ctx, parts).await,
        ("GET", "metrics") => Ok(metrics_snapshot(state, ctx)),
        ("POST", "metrics/reset") => Ok(metrics_reset(state, ctx)),
        ("GET", "health") => queue_summary(state, ctx).await,
        _ => {
            return ctx.error_response(
                StatusCode::NOT_FOUND,
                json!({"error": "not found", "message": format!("no queue operation at '{}'", op)}),
            )
        }
    };

    match result {
        Ok(resp) => resp,
        Err(e) => {
            error!("ops: queue operation failed, op={}, error={}", op, e);
            ctx.error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({"error": e.to_string()}),
            )
        }
    }
}

async fn queue_status(
    state: &GatewayState,
    ctx: &RequestContext,
) -> Result<Response<BoxBody>, GatewayError> {
    let main = state.store.len(QueueKind::Main).await?;
    let dead_letter = state.store.len(QueueKind::DeadLetter).await?;
    let connected = state.store.ping().await;

    Ok(ctx.json_response(
        StatusCode::OK,
        &json!({
            "queues": {
                "request_queue": main,
                // Vestigial — reported for API compatibility, never written.
                "response_queue": 0,
                "dead_letter_queue": dead_letter,
            },
            "connected": connected,
            "cached_fallback_entries": state.cache.len(),
            "timestamp": Utc::now().to_rfc3339(),
        }),
    ))
}

async fn list_queue(
    state: &GatewayState,
    ctx: &RequestContext,
    queue: QueueKind,
    parts: &RequestParts,
) -> Result<Response<BoxBody>, GatewayError> {
    let limit = query_param(&parts.query, "limit")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(DEFAULT_LIST_LIMIT);
    let messages = state.store.peek(queue, limit).await?;

    Ok(ctx.json_response(
        StatusCode::OK,
        &json!({
            "queue": queue.as_str(),
            "count": messages.len(),
            "messages": messages,
        }),
    ))
}

async fn process_queue(
    state: &GatewayState,
    ctx: &RequestContext,
    parts: &RequestParts,
) -> Result<Response<BoxBody>, GatewayError> {
    // Body is optional; absent means the main queue.
    let queue = match optional_body_field(parts, "queue_type")? {
        Some(raw) => match QueueKind::parse(&raw) {
            Some(k) => k,
            None => return Ok(invalid_queue_type(ctx, &raw)),
        },
        None => QueueKind::Main,
    };

    info!("ops: drain cycle triggered, queue={}", queue.as_str());
    let report = state.worker.drain(queue).await;

    Ok(ctx.json_response(
        StatusCode::OK,
        &json!({
            "report": report,
            "timestamp": Utc::now().to_rfc3339(),
        }),
    ))
}

async fn retry_message(
    state: &GatewayState,
    ctx: &RequestContext,
    parts: &RequestParts,
) -> Result<Response<BoxBody>, GatewayError> {
    let body = parse_body(parts)?;
    let Some(message_id) = body.get("message_id").and_then(|v| v.as_str()) else {
        return Ok(ctx.error_response(
            StatusCode::BAD_REQUEST,
            json!({"error": "message_id is required"}),
        ));
    };
    let queue = match body.get("queue_type").and_then(|v| v.as_str()) {
        Some(raw) => match QueueKind::parse(raw) {
            Some(k) => k,
            None => return Ok(invalid_queue_type(ctx, raw)),
        },
        None => QueueKind::Main,
    };

    match state.worker.retry_one(message_id, queue).await? {
        RetryOutcome::NotFound => Ok(ctx.error_response(
            StatusCode::NOT_FOUND,
            json!({
                "error": "message not found",
                "message_id": message_id,
                "queue": queue.as_str(),
            }),
        )),
        outcome => Ok(ctx.json_response(
            StatusCode::OK,
            &json!({
                "message_id": message_id,
                "queue": queue.as_str(),
                "success": outcome == RetryOutcome::Success,
                "timestamp": Utc::now().to_rfc3339(),
            }),
        )),
    }
}

async fn purge_queue(
    state: &GatewayState,
    ctx: &RequestContext,
    parts: &RequestParts,
) -> Result<Response<BoxBody>, GatewayError> {
    let body = parse_body(parts)?;
    let Some(raw) = body.get("queue_type").and_then(|v| v.as_str()) else {
        return Ok(ctx.error_response(
            StatusCode::BAD_REQUEST,
            json!({"error": "queue_type is required"}),
        ));
    };
    let Some(queue) = QueueKind::parse(raw) else {
        return Ok(invalid_queue_type(ctx, raw));
    };

    state.store.purge(queue).await?;
    info!("ops: queue purged, queue={}", queue.as_str());

    Ok(ctx.json_response(
        StatusCode::OK,
        &json!({
            "purged": queue.as_str(),
            "timestamp": Utc::now().to_rfc3339(),
        }),
    ))
}

fn metrics_snapshot(state: &GatewayState, ctx: &RequestContext) -> Response<BoxBody> {
    ctx.json_response(
        StatusCode::OK,
        &json!({
            "metrics": state.queue_metrics.snapshot(),
            "timestamp": Utc::now().to_rfc3339(),
        }),
    )
}

fn metrics_reset(state: &GatewayState, ctx: &RequestContext) -> Response<BoxBody> {
    state.queue_metrics.reset();
    info!("ops: queue metrics reset");
    ctx.json_response(
        StatusCode::OK,
        &json!({
            "reset": true,
            "metrics": state.queue_metrics.snapshot(),
            "timestamp": Utc::now().to_rfc3339(),
        }),
    )
}

/// Summarized queue health: depth and upstream availability folded into
/// `healthy` / `degraded` / `unhealthy`.
async fn queue_summary(
    state: &GatewayState,
    ctx: &RequestContext,
) -> Result<Response<BoxBody>, GatewayError> {
    let depth = state.store.len(QueueKind::Main).await?;
    let snapshot = state.health.check_all().await;

    let any_down = snapshot.values().any(|e| !e.healthy);
    let all_down = !snapshot.is_empty() && snapshot.values().all(|e| !e.healthy);

    let status = if all_down && depth > CRITICAL_DEPTH {
        "unhealthy"
    } else if any_down || depth > DEGRADED_DEPTH {
        "degraded"
    } else {
        "healthy"
    };

    let services: serde_json::Map<String, serde_json::Value> = snapshot
        .iter()
        .map(|(name, entry)| (name.clone(), serde_json::Value::Bool(entry.healthy)))
        .collect();

    Ok(ctx.json_response(
        StatusCode::OK,
        &json!({
            "status": status,
            "queue_depth": depth,
            "services": services,
            "timestamp": Utc::now().to_rfc3339(),
        }),
    ))
}

// -- helpers --

fn query_param(query: &Option<String>, name: &str) -> Option<String> {
    let query = query.as_deref()?;
    query.split('&').find_map(|pair| {
        let mut kv = pair.splitn(2, '=');
        if kv.next()? == name {
            kv.next().map(|v| v.to_string())
        } else {
            None
        }
    })
}

fn parse_body(parts: &RequestParts) -> Result<serde_json::Value, GatewayError> {
    if parts.body.is_empty() {
        return Ok(serde_json::Value::Null);
    }
    Ok(serde_json::from_slice(&parts.body)?)
}

fn optional_body_field(parts: &RequestParts, field: &str) -> Result<Option<String>, GatewayError> {
    let body = parse_body(parts)?;
    Ok(body
        .get(field)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string()))
}

fn invalid_queue_type(ctx: &RequestContext, raw: &str) -> Response<BoxBody> {
    ctx.error_response(
        StatusCode::BAD_REQUEST,
        json!({
            "error": "invalid queue_type",
            "queue_type": raw,
            "accepted": ["main", "dead_letter"],
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_param_extraction() {
        let q = Some("limit=25&verbose=1".to_string());
        assert_eq!(query_param(&q, "limit").as_deref(), Some("25"));
        assert_eq!(query_param(&q, "verbose").as_deref(), Some("1"));
        assert!(query_param(&q, "offset").is_none());
        assert!(query_param(&None, "limit").is_none());
    }
}
