use std::fmt;

#[derive(Debug)]
pub enum GatewayError {
    /// The request path did not resolve to a known service selector.
    NoRouteMatch,
    /// A service name (from config or a queued message) is not in the table.
    UnknownService(String),
    UpstreamTimeout,
    UpstreamConnect(String),
    Http(reqwest::Error),
    QueueBackend(String),
    Serialization(serde_json::Error),
    Config(String),
    Internal(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::NoRouteMatch => write!(f, "no route matched"),
            GatewayError::UnknownService(name) => write!(f, "unknown service: {}", name),
            GatewayError::UpstreamTimeout => write!(f, "upstream timeout"),
            GatewayError::UpstreamConnect(msg) => write!(f, "upstream connect error: {}", msg),
            GatewayError::Http(e) => write!(f, "http error: {}", e),
            GatewayError::QueueBackend(msg) => write!(f, "queue backend error: {}", msg),
            GatewayError::Serialization(e) => write!(f, "serialization error: {}", e),
            GatewayError::Config(msg) => write!(f, "config error: {}", msg),
            GatewayError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for GatewayError {}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            GatewayError::UpstreamTimeout
        } else if e.is_connect() {
            GatewayError::UpstreamConnect(e.to_string())
        } else {
            GatewayError::Http(e)
        }
    }
}

impl From<redis::RedisError> for GatewayError {
    fn from(e: redis::RedisError) -> Self {
        GatewayError::QueueBackend(e.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        GatewayError::Serialization(e)
    }
}
