use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Top-level gateway configuration.
///
/// The service table and selector aliases are immutable after startup —
/// there is no hot-reload path. Everything here can be left out of the
/// config file; defaults match the reference deployment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub services: ServicesConfig,

    #[serde(default)]
    pub redis: RedisConfig,

    #[serde(default)]
    pub health: HealthCheckConfig,

    #[serde(default)]
    pub forward: ForwardConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub cache: CacheConfig,
}

/// Static service descriptor table (name → base URL) plus the client-facing
/// selector aliases (several selectors may map onto one service).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicesConfig {
    #[serde(default = "default_service_urls")]
    pub urls: HashMap<String, String>,

    /// Selector → service-name aliases on top of the identity mapping
    /// (every service name is also its own selector).
    #[serde(default = "default_selector_aliases")]
    pub selector_aliases: HashMap<String, String>,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            urls: default_service_urls(),
            selector_aliases: default_selector_aliases(),
        }
    }
}

fn default_service_urls() -> HashMap<String, String> {
    HashMap::from([
        ("courses".to_string(), "http://courses_service:8000".to_string()),
        ("trainees".to_string(), "http://trainees_service:8000".to_string()),
        ("exams".to_string(), "http://exams_service:8000".to_string()),
    ])
}

fn default_selector_aliases() -> HashMap<String, String> {
    HashMap::from([
        ("classes".to_string(), "courses".to_string()),
        ("results".to_string(), "trainees".to_string()),
    ])
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_host")]
    pub host: String,

    #[serde(default = "default_redis_port")]
    pub port: u16,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: default_redis_host(),
            port: default_redis_port(),
        }
    }
}

impl RedisConfig {
    /// Connection candidates in order: configured host, then the local
    /// fallbacks. Deduplicated so the default config doesn't dial twice.
    pub fn candidate_addrs(&self) -> Vec<String> {
        let mut addrs = vec![format!("{}:{}", self.host, self.port)];
        for fallback in ["127.0.0.1", "localhost"] {
            let addr = format!("{}:{}", fallback, self.port);
            if !addrs.contains(&addr) {
                addrs.push(addr);
            }
        }
        addrs
    }
}

fn default_redis_host() -> String {
    "127.0.0.1".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    /// How long a cached probe result stays valid (seconds).
    #[serde(default = "default_health_ttl")]
    pub ttl_secs: u64,

    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    #[serde(default = "default_probe_path")]
    pub probe_path: String,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_health_ttl(),
            probe_timeout_secs: default_probe_timeout(),
            probe_path: default_probe_path(),
        }
    }
}

fn default_health_ttl() -> u64 {
    30
}

fn default_probe_timeout() -> u64 {
    5
}

fn default_probe_path() -> String {
    "/api/health".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardConfig {
    #[serde(default = "default_forward_timeout")]
    pub timeout_secs: u64,
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_forward_timeout(),
        }
    }
}

fn default_forward_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Max messages popped from the main queue per drain cycle.
    #[serde(default = "default_main_batch")]
    pub main_batch: usize,

    /// Max messages popped from the dead-letter queue per drain cycle.
    #[serde(default = "default_dead_letter_batch")]
    pub dead_letter_batch: usize,

    /// Interval between automatic main-queue drains (seconds).
    #[serde(default = "default_worker_interval")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Upper bound on the exponential backoff delay (seconds).
    #[serde(default = "default_backoff_cap")]
    pub backoff_cap_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            main_batch: default_main_batch(),
            dead_letter_batch: default_dead_letter_batch(),
            poll_interval_secs: default_worker_interval(),
            max_retries: default_max_retries(),
            backoff_cap_secs: default_backoff_cap(),
        }
    }
}

fn default_main_batch() -> usize {
    100
}

fn default_dead_letter_batch() -> usize {
    50
}

fn default_worker_interval() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_cap() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// TTL for requests parked in the ephemeral cache when the queue
    /// backend is unreachable (seconds).
    #[serde(default = "default_fallback_ttl")]
    pub fallback_ttl_secs: u64,

    /// TTL for `failed_request_<id>` forensics entries (seconds).
    #[serde(default = "default_forensics_ttl")]
    pub forensics_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            fallback_ttl_secs: default_fallback_ttl(),
            forensics_ttl_secs: default_forensics_ttl(),
        }
    }
}

fn default_fallback_ttl() -> u64 {
    3600
}

fn default_forensics_ttl() -> u64 {
    86400
}
