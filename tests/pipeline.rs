//! End-to-end request-lifecycle scenarios over the in-memory store with
//! scripted health probes and upstream clients.

use bytes::Bytes;
use http_body_util::BodyExt;
use relay_gateway::config::GatewayConfig;
use relay_gateway::error::GatewayError;
use relay_gateway::proxy::{route_and_dispatch, BoxBody, RequestParts};
use relay_gateway::queue::{MemoryQueueStore, QueueKind, QueueStore, QueuedMessage};
use relay_gateway::server::GatewayState;
use relay_gateway::upstream::{HealthProbe, UpstreamClient, UpstreamRequest, UpstreamResponse};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};

// ---------------------------------------------------------------------------
// Scripted collaborators
// ---------------------------------------------------------------------------

/// Health probe with per-service switches, keyed by a substring of the
/// base URL (default service URLs embed the service name).
struct ScriptedProbe {
    up: Mutex<HashMap<String, bool>>,
}

impl ScriptedProbe {
    fn all_up() -> Arc<Self> {
        Arc::new(Self {
            up: Mutex::new(HashMap::new()),
        })
    }

    fn set(&self, service: &str, healthy: bool) {
        self.up.lock().unwrap().insert(service.to_string(), healthy);
    }
}

#[async_trait::async_trait]
impl HealthProbe for ScriptedProbe {
    async fn probe(&self, base_url: &str) -> Result<(), String> {
        let up = self.up.lock().unwrap();
        for (service, healthy) in up.iter() {
            if base_url.contains(service.as_str()) {
                return if *healthy {
                    Ok(())
                } else {
                    Err("connection refused".to_string())
                };
            }
        }
        // Services without an explicit switch are healthy.
        Ok(())
    }
}

/// Upstream client that records every call and answers with a fixed
/// status/body, or a transport error when scripted to.
struct ScriptedUpstream {
    status: AtomicU16,
    body: Mutex<String>,
    transport_error: AtomicBool,
    calls: Mutex<Vec<UpstreamRequest>>,
}

impl ScriptedUpstream {
    fn returning(status: u16, body: &str) -> Arc<Self> {
        Arc::new(Self {
            status: AtomicU16::new(status),
            body: Mutex::new(body.to_string()),
            transport_error: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn set_status(&self, status: u16) {
        self.status.store(status, Ordering::SeqCst);
    }

    fn fail_transport(&self, fail: bool) {
        self.transport_error.store(fail, Ordering::SeqCst);
    }

    fn calls(&self) -> Vec<UpstreamRequest> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl UpstreamClient for ScriptedUpstream {
    async fn execute(&self, req: UpstreamRequest) -> Result<UpstreamResponse, GatewayError> {
        self.calls.lock().unwrap().push(req);
        if self.transport_error.load(Ordering::SeqCst) {
            return Err(GatewayError::UpstreamConnect("connection refused".to_string()));
        }
        Ok(UpstreamResponse {
            status: self.status.load(Ordering::SeqCst),
            content_type: Some("application/json".to_string()),
            body: Bytes::from(self.body.lock().unwrap().clone()),
        })
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    state: GatewayState,
    store: Arc<MemoryQueueStore>,
    probe: Arc<ScriptedProbe>,
    upstream: Arc<ScriptedUpstream>,
}

fn harness(probe: Arc<ScriptedProbe>, upstream: Arc<ScriptedUpstream>) -> Harness {
    let mut config = GatewayConfig::default();
    // Zero TTL: every availability check re-probes, so flipping a probe
    // switch takes effect immediately.
    config.health.ttl_secs = 0;

    let store = Arc::new(MemoryQueueStore::new());
    let state = GatewayState::with_components(
        config,
        store.clone(),
        probe.clone(),
        upstream.clone(),
    );

    Harness {
        state,
        store,
        probe,
        upstream,
    }
}

fn request(method: &str, path: &str, body: serde_json::Value) -> RequestParts {
    let mut headers = http::HeaderMap::new();
    headers.insert("user-agent", "pipeline-test/1.0".parse().unwrap());
    let body = if body.is_null() {
        Bytes::new()
    } else {
        Bytes::from(serde_json::to_vec(&body).unwrap())
    };
    RequestParts {
        method: method.to_string(),
        path: path.to_string(),
        query: None,
        headers,
        body,
        client_ip: "10.0.0.7".parse().unwrap(),
    }
}

async fn body_json(resp: hyper::Response<BoxBody>) -> serde_json::Value {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

/// Simulate the passage of backoff time: strip `not_before` from every
/// queued message, preserving queue order.
async fn elapse_backoff(store: &MemoryQueueStore) {
    let mut drained: Vec<QueuedMessage> = Vec::new();
    while let Some(msg) = store.pop(QueueKind::Main).await.unwrap() {
        drained.push(msg);
    }
    for mut msg in drained {
        msg.not_before = None;
        store.push(QueueKind::Main, &msg).await.unwrap();
    }
}

// ---------------------------------------------------------------------------
// Forwarding scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn happy_path_relays_upstream_response() {
    let h = harness(
        ScriptedProbe::all_up(),
        ScriptedUpstream::returning(200, r#"{"id":7,"name":"Nadia"}"#),
    );

    let resp = route_and_dispatch(request("GET", "/api/trainees/7", serde_json::Value::Null), h.state.clone()).await;
    assert_eq!(resp.status(), 200);
    let body = body_json(resp).await;
    assert_eq!(body, serde_json::json!({"id": 7, "name": "Nadia"}));

    let calls = h.upstream.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].url, "http://trainees_service:8000/api/trainees/7");
    assert_eq!(calls[0].method, "GET");

    // Not a queued path: queue untouched, counters unchanged.
    assert_eq!(h.store.len(QueueKind::Main).await.unwrap(), 0);
    let snap = h.state.queue_metrics.snapshot();
    assert_eq!((snap.processed, snap.retried, snap.dead_lettered), (0, 0, 0));
}

#[tokio::test]
async fn upstream_error_status_is_relayed_verbatim() {
    let h = harness(
        ScriptedProbe::all_up(),
        ScriptedUpstream::returning(422, r#"{"error":"invalid exam"}"#),
    );

    let resp = route_and_dispatch(
        request("POST", "/api/exams", serde_json::json!({"name": ""})),
        h.state.clone(),
    )
    .await;
    // A response from the upstream — even an error — is relayed, not queued.
    assert_eq!(resp.status(), 422);
    assert_eq!(h.store.len(QueueKind::Main).await.unwrap(), 0);
}

#[tokio::test]
async fn mutating_request_on_down_service_is_queued() {
    let probe = ScriptedProbe::all_up();
    probe.set("exams", false);
    let h = harness(probe, ScriptedUpstream::returning(200, "{}"));

    let resp = route_and_dispatch(
        request("POST", "/api/exams", serde_json::json!({"name": "X"})),
        h.state.clone(),
    )
    .await;
    assert_eq!(resp.status(), 503);
    let body = body_json(resp).await;
    assert_eq!(body["queued"], serde_json::json!(true));
    let message_id = body["message_id"].as_str().unwrap();
    assert!(!message_id.is_empty());

    assert_eq!(h.store.len(QueueKind::Main).await.unwrap(), 1);
    let queued = &h.store.peek(QueueKind::Main, 10).await.unwrap()[0];
    assert_eq!(queued.id, message_id);
    assert_eq!(queued.service, "exams");
    assert_eq!(queued.endpoint, "/exams");
    assert_eq!(queued.method, "POST");
    assert_eq!(queued.priority, 3);
    assert_eq!(queued.retry_count, 0);
    assert_eq!(queued.data, serde_json::json!({"name": "X"}));
    assert!(queued.session_id.is_some());
    assert!(queued.dead_letter_timestamp.is_none());

    // No upstream call was attempted.
    assert!(h.upstream.calls().is_empty());
}

#[tokio::test]
async fn non_mutating_request_on_down_service_fails_fast() {
    let probe = ScriptedProbe::all_up();
    probe.set("trainees", false);
    let h = harness(probe, ScriptedUpstream::returning(200, "{}"));

    let resp = route_and_dispatch(request("GET", "/api/trainees", serde_json::Value::Null), h.state.clone()).await;
    assert_eq!(resp.status(), 503);
    let body = body_json(resp).await;
    assert_eq!(body["queued"], serde_json::json!(false));
    assert_eq!(h.store.len(QueueKind::Main).await.unwrap(), 0);
}

#[tokio::test]
async fn transport_failure_falls_through_to_queueing() {
    // Probe says healthy, but the forward call dies on the wire.
    let h = harness(ScriptedProbe::all_up(), ScriptedUpstream::returning(200, "{}"));
    h.upstream.fail_transport(true);

    let resp = route_and_dispatch(
        request("PUT", "/api/courses/1", serde_json::json!({"title": "Rust"})),
        h.state.clone(),
    )
    .await;
    assert_eq!(resp.status(), 503);
    let body = body_json(resp).await;
    assert_eq!(body["queued"], serde_json::json!(true));
    assert_eq!(h.store.len(QueueKind::Main).await.unwrap(), 1);
}

#[tokio::test]
async fn unknown_selector_is_rejected_with_hint() {
    let h = harness(ScriptedProbe::all_up(), ScriptedUpstream::returning(200, "{}"));

    let resp = route_and_dispatch(request("GET", "/api/payments/1", serde_json::Value::Null), h.state.clone()).await;
    assert_eq!(resp.status(), 400);
    let body = body_json(resp).await;
    assert_eq!(
        body["recognized_selectors"],
        serde_json::json!(["classes", "courses", "exams", "results", "trainees"])
    );
}

#[tokio::test]
async fn alias_selector_routes_to_aliased_service() {
    let h = harness(ScriptedProbe::all_up(), ScriptedUpstream::returning(200, "[]"));

    let resp = route_and_dispatch(request("GET", "/api/classes/3", serde_json::Value::Null), h.state.clone()).await;
    assert_eq!(resp.status(), 200);
    let calls = h.upstream.calls();
    // classes → courses service, endpoint keeps the client-facing selector.
    assert_eq!(calls[0].url, "http://courses_service:8000/api/classes/3");
}

// ---------------------------------------------------------------------------
// Drain / retry / dead-letter scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn drain_delivers_queued_message_when_service_recovers() {
    let probe = ScriptedProbe::all_up();
    probe.set("exams", false);
    let h = harness(probe, ScriptedUpstream::returning(201, r#"{"id":1}"#));

    route_and_dispatch(
        request("POST", "/api/exams", serde_json::json!({"name": "X"})),
        h.state.clone(),
    )
    .await;
    assert_eq!(h.store.len(QueueKind::Main).await.unwrap(), 1);

    h.probe.set("exams", true);
    let report = h.state.worker.drain(QueueKind::Main).await;
    assert_eq!(report.processed, 1);

    assert_eq!(h.store.len(QueueKind::Main).await.unwrap(), 0);
    assert_eq!(h.state.queue_metrics.snapshot().processed, 1);

    let calls = h.upstream.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].url, "http://exams_service:8000/api/exams");
    assert_eq!(calls[0].method, "POST");
    let sent: serde_json::Value = serde_json::from_slice(calls[0].body.as_ref().unwrap()).unwrap();
    assert_eq!(sent, serde_json::json!({"name": "X"}));
}

#[tokio::test]
async fn fourth_failure_dead_letters_with_retry_count_at_max() {
    let probe = ScriptedProbe::all_up();
    probe.set("courses", false);
    let h = harness(probe, ScriptedUpstream::returning(200, "{}"));

    route_and_dispatch(
        request("PUT", "/api/courses/1", serde_json::json!({"title": "Y"})),
        h.state.clone(),
    )
    .await;

    // Four drain cycles with the backoff elapsed in between.
    for _ in 0..4 {
        elapse_backoff(&h.store).await;
        h.state.worker.drain(QueueKind::Main).await;
    }

    assert_eq!(h.store.len(QueueKind::Main).await.unwrap(), 0);
    assert_eq!(h.store.len(QueueKind::DeadLetter).await.unwrap(), 1);

    let dead = &h.store.peek(QueueKind::DeadLetter, 10).await.unwrap()[0];
    assert_eq!(dead.retry_count, 3);
    assert_eq!(dead.retry_count, dead.max_retries);
    assert!(dead.dead_letter_timestamp.is_some());

    let snap = h.state.queue_metrics.snapshot();
    assert_eq!(snap.retried, 3);
    assert_eq!(snap.dead_lettered, 1);
    assert_eq!(snap.processed, 0);
    // No upstream call was ever attempted — the service was down the whole
    // time — so nothing counts as failed.
    assert_eq!(snap.failed, 0);

    // Forensics copy is visible to operators.
    assert!(h
        .state
        .cache
        .get(&format!("failed_request_{}", dead.id))
        .is_some());
}

#[tokio::test]
async fn backoff_defers_messages_within_a_cycle() {
    let probe = ScriptedProbe::all_up();
    probe.set("exams", false);
    let h = harness(probe, ScriptedUpstream::returning(200, "{}"));

    route_and_dispatch(
        request("POST", "/api/exams", serde_json::json!({"n": 1})),
        h.state.clone(),
    )
    .await;

    // First drain: the failure stamps not_before in the future. The skip
    // is health-gated, so the cycle report agrees with the failed metric.
    let report = h.state.worker.drain(QueueKind::Main).await;
    assert_eq!(report.retried, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(h.state.queue_metrics.snapshot().failed, 0);

    // Second drain immediately after: the message is not due — it is
    // rotated, not retried again.
    let report = h.state.worker.drain(QueueKind::Main).await;
    assert_eq!(report.retried, 0);
    assert_eq!(report.deferred, 1);
    assert_eq!(h.store.len(QueueKind::Main).await.unwrap(), 1);
    assert_eq!(h.state.queue_metrics.snapshot().retried, 1);
}

#[tokio::test]
async fn dead_letter_drain_leaves_quarantine_when_service_down() {
    let probe = ScriptedProbe::all_up();
    probe.set("courses", false);
    let h = harness(probe, ScriptedUpstream::returning(200, "{}"));

    route_and_dispatch(
        request("DELETE", "/api/courses/9", serde_json::Value::Null),
        h.state.clone(),
    )
    .await;
    for _ in 0..4 {
        elapse_backoff(&h.store).await;
        h.state.worker.drain(QueueKind::Main).await;
    }
    assert_eq!(h.store.len(QueueKind::DeadLetter).await.unwrap(), 1);

    // Still down: the dead-letter cycle must not consume the message.
    let report = h.state.worker.drain(QueueKind::DeadLetter).await;
    assert_eq!(report.processed, 0);
    assert_eq!(h.store.len(QueueKind::DeadLetter).await.unwrap(), 1);
    assert!(h.upstream.calls().is_empty());
}

#[tokio::test]
async fn targeted_retry_recovers_dead_letter_message() {
    let probe = ScriptedProbe::all_up();
    probe.set("courses", false);
    let h = harness(probe, ScriptedUpstream::returning(200, r#"{"ok":true}"#));

    route_and_dispatch(
        request("PUT", "/api/courses/1", serde_json::json!({"title": "Z"})),
        h.state.clone(),
    )
    .await;
    for _ in 0..4 {
        elapse_backoff(&h.store).await;
        h.state.worker.drain(QueueKind::Main).await;
    }
    let dead_id = h.store.peek(QueueKind::DeadLetter, 1).await.unwrap()[0]
        .id
        .clone();

    h.probe.set("courses", true);
    let resp = route_and_dispatch(
        request(
            "POST",
            "/api/queue/retry",
            serde_json::json!({"message_id": dead_id, "queue_type": "dead_letter"}),
        ),
        h.state.clone(),
    )
    .await;
    assert_eq!(resp.status(), 200);
    let body = body_json(resp).await;
    assert_eq!(body["success"], serde_json::json!(true));

    assert_eq!(h.store.len(QueueKind::DeadLetter).await.unwrap(), 0);
    assert_eq!(h.state.queue_metrics.snapshot().processed, 1);

    // Retrying the same id again: gone.
    let resp = route_and_dispatch(
        request(
            "POST",
            "/api/queue/retry",
            serde_json::json!({"message_id": dead_id, "queue_type": "dead_letter"}),
        ),
        h.state.clone(),
    )
    .await;
    assert_eq!(resp.status(), 404);
}

// ---------------------------------------------------------------------------
// Management surface
// ---------------------------------------------------------------------------

#[tokio::test]
async fn gateway_liveness_endpoint() {
    let h = harness(ScriptedProbe::all_up(), ScriptedUpstream::returning(200, "{}"));
    let resp = route_and_dispatch(request("GET", "/api/health", serde_json::Value::Null), h.state.clone()).await;
    assert_eq!(resp.status(), 200);
    let body = body_json(resp).await;
    assert_eq!(body["status"], serde_json::json!("ok"));
    assert_eq!(body["service"], serde_json::json!("relay-gateway"));
}

#[tokio::test]
async fn queue_status_reports_depths_and_placeholder() {
    let probe = ScriptedProbe::all_up();
    probe.set("exams", false);
    let h = harness(probe, ScriptedUpstream::returning(200, "{}"));

    route_and_dispatch(
        request("POST", "/api/exams", serde_json::json!({"n": 1})),
        h.state.clone(),
    )
    .await;

    let resp = route_and_dispatch(request("GET", "/api/queue/status", serde_json::Value::Null), h.state.clone()).await;
    assert_eq!(resp.status(), 200);
    let body = body_json(resp).await;
    assert_eq!(body["queues"]["request_queue"], serde_json::json!(1));
    assert_eq!(body["queues"]["response_queue"], serde_json::json!(0));
    assert_eq!(body["queues"]["dead_letter_queue"], serde_json::json!(0));
    assert_eq!(body["connected"], serde_json::json!(true));
}

#[tokio::test]
async fn queue_listing_and_purge_round_trip() {
    let probe = ScriptedProbe::all_up();
    probe.set("exams", false);
    let h = harness(probe, ScriptedUpstream::returning(200, "{}"));

    for i in 0..3 {
        route_and_dispatch(
            request("POST", "/api/exams", serde_json::json!({"n": i})),
            h.state.clone(),
        )
        .await;
    }

    let resp = route_and_dispatch(
        RequestParts {
            query: Some("limit=2".to_string()),
            ..request("GET", "/api/queue/requests", serde_json::Value::Null)
        },
        h.state.clone(),
    )
    .await;
    let body = body_json(resp).await;
    assert_eq!(body["count"], serde_json::json!(2));
    // Oldest (next to pop) listed first.
    assert_eq!(body["messages"][0]["data"]["n"], serde_json::json!(0));

    let resp = route_and_dispatch(
        request("POST", "/api/queue/purge", serde_json::json!({"queue_type": "main"})),
        h.state.clone(),
    )
    .await;
    assert_eq!(resp.status(), 200);
    assert_eq!(h.store.len(QueueKind::Main).await.unwrap(), 0);
}

#[tokio::test]
async fn process_endpoint_triggers_drain() {
    let probe = ScriptedProbe::all_up();
    probe.set("exams", false);
    let h = harness(probe, ScriptedUpstream::returning(201, "{}"));

    route_and_dispatch(
        request("POST", "/api/exams", serde_json::json!({"name": "X"})),
        h.state.clone(),
    )
    .await;
    h.probe.set("exams", true);

    let resp = route_and_dispatch(request("POST", "/api/queue/process", serde_json::Value::Null), h.state.clone()).await;
    assert_eq!(resp.status(), 200);
    let body = body_json(resp).await;
    assert_eq!(body["report"]["queue"], serde_json::json!("main"));
    assert_eq!(body["report"]["processed"], serde_json::json!(1));
    assert_eq!(h.store.len(QueueKind::Main).await.unwrap(), 0);
}

#[tokio::test]
async fn metrics_snapshot_and_reset() {
    let probe = ScriptedProbe::all_up();
    probe.set("exams", false);
    let h = harness(probe, ScriptedUpstream::returning(201, "{}"));

    route_and_dispatch(
        request("POST", "/api/exams", serde_json::json!({"name": "X"})),
        h.state.clone(),
    )
    .await;
    h.probe.set("exams", true);
    h.state.worker.drain(QueueKind::Main).await;

    let resp = route_and_dispatch(request("GET", "/api/queue/metrics", serde_json::Value::Null), h.state.clone()).await;
    let body = body_json(resp).await;
    assert_eq!(body["metrics"]["processed"], serde_json::json!(1));

    let resp = route_and_dispatch(
        request("POST", "/api/queue/metrics/reset", serde_json::Value::Null),
        h.state.clone(),
    )
    .await;
    let body = body_json(resp).await;
    assert_eq!(body["metrics"]["processed"], serde_json::json!(0));
    assert_eq!(body["metrics"]["failed"], serde_json::json!(0));
    assert_eq!(body["metrics"]["retried"], serde_json::json!(0));
    assert_eq!(body["metrics"]["dead_lettered"], serde_json::json!(0));
}

#[tokio::test]
async fn queue_health_summary_degrades_when_a_service_is_down() {
    let h = harness(ScriptedProbe::all_up(), ScriptedUpstream::returning(200, "{}"));
    let resp = route_and_dispatch(request("GET", "/api/queue/health", serde_json::Value::Null), h.state.clone()).await;
    let body = body_json(resp).await;
    assert_eq!(body["status"], serde_json::json!("healthy"));

    h.probe.set("exams", false);
    let resp = route_and_dispatch(request("GET", "/api/queue/health", serde_json::Value::Null), h.state.clone()).await;
    let body = body_json(resp).await;
    assert_eq!(body["status"], serde_json::json!("degraded"));
    assert_eq!(body["services"]["exams"], serde_json::json!(false));
}

#[tokio::test]
async fn per_service_health_endpoint() {
    let probe = ScriptedProbe::all_up();
    probe.set("trainees", false);
    let h = harness(probe, ScriptedUpstream::returning(200, "{}"));

    let resp = route_and_dispatch(
        request("GET", "/api/services/trainees/health", serde_json::Value::Null),
        h.state.clone(),
    )
    .await;
    assert_eq!(resp.status(), 200);
    let body = body_json(resp).await;
    assert_eq!(body["service"], serde_json::json!("trainees"));
    assert_eq!(body["health"]["healthy"], serde_json::json!(false));
    assert_eq!(body["queue"]["connected"], serde_json::json!(true));

    let resp = route_and_dispatch(
        request("GET", "/api/services/billing/health", serde_json::Value::Null),
        h.state.clone(),
    )
    .await;
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn message_ids_are_unique_across_queues() {
    let probe = ScriptedProbe::all_up();
    probe.set("exams", false);
    probe.set("courses", false);
    let h = harness(probe, ScriptedUpstream::returning(200, "{}"));

    for i in 0..5 {
        route_and_dispatch(
            request("POST", "/api/exams", serde_json::json!({"n": i})),
            h.state.clone(),
        )
        .await;
    }
    route_and_dispatch(
        request("PUT", "/api/courses/1", serde_json::json!({"n": 9})),
        h.state.clone(),
    )
    .await;
    // Push the courses message through to dead-letter.
    for _ in 0..4 {
        elapse_backoff(&h.store).await;
        h.state.worker.drain(QueueKind::Main).await;
    }

    let mut ids: Vec<String> = h
        .store
        .peek(QueueKind::Main, 100)
        .await
        .unwrap()
        .into_iter()
        .chain(h.store.peek(QueueKind::DeadLetter, 100).await.unwrap())
        .map(|m| m.id)
        .collect();
    let total = ids.len();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), total);
}
