use bytes::Bytes;
use http::StatusCode;
use http_body_util::{BodyExt, Full};
use std::net::IpAddr;
use std::time::Instant;

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

/// Per-request context carried through the dispatch phases: identity for
/// logging/correlation, and the single exit point for gateway-originated
/// error responses.
pub struct RequestContext {
    pub method: String,
    pub path: String,
    /// Resolved service name; empty until route match.
    pub service: String,
    /// Resolved upstream endpoint; empty until route match.
    pub endpoint: String,
    pub client_ip: IpAddr,
    /// Taken from `X-Request-Id` or freshly minted; echoed in every
    /// gateway-originated body.
    pub request_id: String,
    pub start: Instant,
}

impl RequestContext {
    pub fn new(method: String, path: String, client_ip: IpAddr, request_id: String) -> Self {
        Self {
            method,
            path,
            service: String::new(),
            endpoint: String::new(),
            client_ip,
            request_id,
            start: Instant::now(),
        }
    }

    /// Build a gateway-originated JSON response and record metrics in one
    /// place. `timestamp` and `request_id` are stamped into every body.
    pub fn error_response(
        &self,
        status: StatusCode,
        mut body: serde_json::Value,
    ) -> hyper::Response<BoxBody> {
        if let Some(obj) = body.as_object_mut() {
            obj.insert(
                "timestamp".to_string(),
                serde_json::Value::String(chrono::Utc::now().to_rfc3339()),
            );
            obj.insert(
                "request_id".to_string(),
                serde_json::Value::String(self.request_id.clone()),
            );
        }

        self.finalize_metrics(status.as_u16());

        hyper::Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(full_body(body.to_string()))
            .unwrap()
    }

    /// Plain JSON response from the ops surface; same metrics accounting.
    pub fn json_response(&self, status: StatusCode, body: &serde_json::Value) -> hyper::Response<BoxBody> {
        self.finalize_metrics(status.as_u16());

        hyper::Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(full_body(body.to_string()))
            .unwrap()
    }

    pub fn finalize_metrics(&self, resp_status: u16) {
        let mut buf = itoa::Buffer::new();
        let status_str = buf.format(resp_status);

        metrics::counter!(
            "gateway_http_requests_total",
            "service" => self.service.clone(),
            "method" => self.method.clone(),
            "status_code" => status_str.to_owned(),
        )
        .increment(1);

        metrics::histogram!(
            "gateway_http_request_duration_seconds",
            "service" => self.service.clone(),
        )
        .record(self.start.elapsed().as_secs_f64());
    }
}
