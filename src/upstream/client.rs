use crate::error::GatewayError;
use crate::queue::message::QueuedMessage;
use bytes::Bytes;
use std::collections::HashMap;
use std::time::Duration;

/// Compose the upstream URL for an endpoint: `<base>/api<endpoint>`.
pub fn compose_url(base: &str, endpoint: &str) -> String {
    format!("{}/api{}", base.trim_end_matches('/'), endpoint)
}

/// One fully-composed upstream call, shared by the forward path and the
/// queue worker.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    /// Full URL including any query string.
    pub url: String,
    /// Uppercased HTTP verb.
    pub method: String,
    /// Headers to forward (already stripped of hop metadata).
    pub headers: HashMap<String, String>,
    /// Raw body bytes; `None` for bodyless requests.
    pub body: Option<Bytes>,
}

impl UpstreamRequest {
    /// Build the call for a queued message against its service base URL.
    pub fn for_message(msg: &QueuedMessage, base_url: &str) -> Self {
        let body = if msg.data.is_null() {
            None
        } else {
            serde_json::to_vec(&msg.data).ok().map(Bytes::from)
        };
        Self {
            url: compose_url(base_url, &msg.endpoint),
            method: msg.method.clone(),
            headers: msg.headers.clone(),
            body,
        }
    }
}

/// What came back from the upstream; status and body are relayed verbatim.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Bytes,
}

impl UpstreamResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Execution seam for upstream calls. The production implementation is a
/// reqwest client; tests substitute a scripted stub.
#[async_trait::async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn execute(&self, req: UpstreamRequest) -> Result<UpstreamResponse, GatewayError>;
}

pub struct HttpUpstreamClient {
    client: reqwest::Client,
}

impl HttpUpstreamClient {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .no_proxy()
            .build()
            .expect("failed to build upstream client");
        Self { client }
    }
}

#[async_trait::async_trait]
impl UpstreamClient for HttpUpstreamClient {
    async fn execute(&self, req: UpstreamRequest) -> Result<UpstreamResponse, GatewayError> {
        let method = reqwest::Method::from_bytes(req.method.as_bytes())
            .map_err(|_| GatewayError::Internal(format!("invalid method: {}", req.method)))?;

        let mut builder = self.client.request(method, &req.url);
        let mut has_content_type = false;
        for (name, value) in &req.headers {
            if name.eq_ignore_ascii_case("content-type") {
                has_content_type = true;
            }
            builder = builder.header(name, value);
        }
        if let Some(body) = req.body {
            if !has_content_type {
                builder = builder.header("content-type", "application/json");
            }
            builder = builder.body(body);
        }

        let resp = builder.send().await?;
        let status = resp.status().as_u16();
        let content_type = resp
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_owned());
        let body = resp.bytes().await?;

        Ok(UpstreamResponse {
            status,
            content_type,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_compose_url() {
        assert_eq!(
            compose_url("http://exams_service:8000", "/exams/1"),
            "http://exams_service:8000/api/exams/1"
        );
        // Trailing slash on the base does not double up.
        assert_eq!(
            compose_url("http://exams_service:8000/", "/exams"),
            "http://exams_service:8000/api/exams"
        );
    }

    #[test]
    fn test_for_message_serializes_data() {
        let msg = QueuedMessage {
            id: "m".to_string(),
            timestamp: Utc::now(),
            service: "exams".to_string(),
            endpoint: "/exams".to_string(),
            method: "POST".to_string(),
            data: serde_json::json!({"name": "X"}),
            headers: HashMap::from([("x-request-id".to_string(), "r".to_string())]),
            retry_count: 0,
            max_retries: 3,
            priority: 3,
            user_id: None,
            session_id: None,
            ip_address: None,
            user_agent: None,
            request_id: None,
            dead_letter_timestamp: None,
            not_before: None,
        };
        let req = UpstreamRequest::for_message(&msg, "http://exams_service:8000");
        assert_eq!(req.url, "http://exams_service:8000/api/exams");
        assert_eq!(req.method, "POST");
        let body: serde_json::Value = serde_json::from_slice(&req.body.unwrap()).unwrap();
        assert_eq!(body, serde_json::json!({"name": "X"}));
    }

    #[test]
    fn test_for_message_null_data_has_no_body() {
        let msg = QueuedMessage {
            id: "m".to_string(),
            timestamp: Utc::now(),
            service: "courses".to_string(),
            endpoint: "/courses/5".to_string(),
            method: "DELETE".to_string(),
            data: serde_json::Value::Null,
            headers: HashMap::new(),
            retry_count: 0,
            max_retries: 3,
            priority: 4,
            user_id: None,
            session_id: None,
            ip_address: None,
            user_agent: None,
            request_id: None,
            dead_letter_timestamp: None,
            not_before: None,
        };
        let req = UpstreamRequest::for_message(&msg, "http://courses_service:8000");
        assert!(req.body.is_none());
    }

    #[test]
    fn test_response_success_range() {
        let ok = UpstreamResponse {
            status: 201,
            content_type: None,
            body: Bytes::new(),
        };
        let not = UpstreamResponse {
            status: 404,
            content_type: None,
            body: Bytes::new(),
        };
        assert!(ok.is_success());
        assert!(!not.is_success());
    }
}
