use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Cached probe result for one upstream.
#[derive(Debug, Clone, Serialize)]
pub struct HealthEntry {
    pub healthy: bool,
    pub checked_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Probe one upstream base URL. `Ok(())` means healthy; `Err` carries the
/// reason. Injected so tests can script availability deterministically.
#[async_trait::async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, base_url: &str) -> Result<(), String>;
}

/// Production probe: GET `<base><probe_path>` with a short timeout.
/// Any 2xx is healthy; everything else — including timeout and connect
/// errors — is unhealthy.
pub struct HttpHealthProbe {
    client: reqwest::Client,
    probe_path: String,
}

impl HttpHealthProbe {
    pub fn new(timeout: Duration, probe_path: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .no_proxy()
            .build()
            .expect("failed to build health probe client");
        Self {
            client,
            probe_path: probe_path.into(),
        }
    }
}

#[async_trait::async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, base_url: &str) -> Result<(), String> {
        let url = format!("{}{}", base_url.trim_end_matches('/'), self.probe_path);
        match self.client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => Ok(()),
            Ok(resp) => Err(format!("status {}", resp.status().as_u16())),
            Err(e) => Err(e.to_string()),
        }
    }
}

struct CachedHealth {
    entry: HealthEntry,
    refreshed: Instant,
}

/// Per-service health cache with TTL and single-flight probing.
///
/// `is_available` serves from cache while fresh and re-probes otherwise.
/// Concurrent refreshes of the same service are deduplicated through a
/// per-service mutex; losers of the race reuse the winner's result. Stale
/// reads are acceptable — probe results are idempotent.
pub struct HealthRegistry {
    urls: HashMap<String, String>,
    ttl: Duration,
    probe: Arc<dyn HealthProbe>,
    entries: DashMap<String, CachedHealth>,
    inflight: DashMap<String, Arc<Mutex<()>>>,
}

impl HealthRegistry {
    pub fn new(urls: HashMap<String, String>, ttl: Duration, probe: Arc<dyn HealthProbe>) -> Self {
        Self {
            urls,
            ttl,
            probe,
            entries: DashMap::new(),
            inflight: DashMap::new(),
        }
    }

    pub fn url_of(&self, service: &str) -> Option<String> {
        self.urls.get(service).cloned()
    }

    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.urls.keys().cloned().collect();
        names.sort();
        names
    }

    /// Cached availability; probes on a stale or missing entry.
    /// Unknown services are never available.
    pub async fn is_available(&self, service: &str) -> bool {
        match self.fresh_entry(service) {
            Some(entry) => entry.healthy,
            None => self.refresh(service).await.map(|e| e.healthy).unwrap_or(false),
        }
    }

    /// Current entry for one service, probing if stale. `None` for unknown
    /// services.
    pub async fn check(&self, service: &str) -> Option<HealthEntry> {
        match self.fresh_entry(service) {
            Some(entry) => Some(entry),
            None => self.refresh(service).await,
        }
    }

    /// Full snapshot for the admin surface; stale services are re-probed
    /// concurrently.
    pub async fn check_all(&self) -> BTreeMap<String, HealthEntry> {
        let names = self.service_names();
        let entries: Vec<(String, Option<HealthEntry>)> = stream::iter(names)
            .map(|name| async move {
                let entry = self.check(&name).await;
                (name, entry)
            })
            .buffer_unordered(4)
            .collect()
            .await;

        entries
            .into_iter()
            .filter_map(|(name, entry)| entry.map(|e| (name, e)))
            .collect()
    }

    /// Invalidate the cached entry and re-probe.
    pub async fn force_refresh(&self, service: &str) -> Option<HealthEntry> {
        self.entries.remove(service);
        self.refresh(service).await
    }

    /// Record a passive failure observed on the forward path, so subsequent
    /// requests short-circuit without waiting for a probe.
    pub fn mark_unhealthy(&self, service: &str, reason: String) {
        if !self.urls.contains_key(service) {
            return;
        }
        warn!(
            "health: marked unhealthy from forward path, service={}, reason={}",
            service, reason
        );
        self.store_entry(service, false, Some(reason));
    }

    fn fresh_entry(&self, service: &str) -> Option<HealthEntry> {
        let cached = self.entries.get(service)?;
        if cached.refreshed.elapsed() < self.ttl {
            Some(cached.entry.clone())
        } else {
            None
        }
    }

    async fn refresh(&self, service: &str) -> Option<HealthEntry> {
        let base_url = self.urls.get(service)?.clone();

        let lock = self
            .inflight
            .entry(service.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Another flight may have refreshed while we waited.
        if let Some(entry) = self.fresh_entry(service) {
            return Some(entry);
        }

        let result = self.probe.probe(&base_url).await;
        let (healthy, last_error) = match result {
            Ok(()) => {
                debug!("health: probe passed, service={}", service);
                (true, None)
            }
            Err(reason) => {
                warn!(
                    "health: probe failed, service={}, error={}",
                    service, reason
                );
                (false, Some(reason))
            }
        };

        metrics::counter!(
            "gateway_health_check_total",
            "service" => service.to_string(),
            "result" => if healthy { "success" } else { "failure" },
        )
        .increment(1);

        Some(self.store_entry(service, healthy, last_error))
    }

    fn store_entry(&self, service: &str, healthy: bool, last_error: Option<String>) -> HealthEntry {
        let entry = HealthEntry {
            healthy,
            checked_at: Utc::now(),
            last_error,
        };
        metrics::gauge!(
            "gateway_upstream_health_status",
            "service" => service.to_string(),
        )
        .set(if healthy { 1.0 } else { 0.0 });
        self.entries.insert(
            service.to_string(),
            CachedHealth {
                entry: entry.clone(),
                refreshed: Instant::now(),
            },
        );
        entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct ScriptedProbe {
        healthy: AtomicBool,
        calls: AtomicUsize,
    }

    impl ScriptedProbe {
        fn new(healthy: bool) -> Arc<Self> {
            Arc::new(Self {
                healthy: AtomicBool::new(healthy),
                calls: AtomicUsize::new(0),
            })
        }

        fn set_healthy(&self, healthy: bool) {
            self.healthy.store(healthy, Ordering::SeqCst);
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl HealthProbe for ScriptedProbe {
        async fn probe(&self, _base_url: &str) -> Result<(), String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err("connection refused".to_string())
            }
        }
    }

    fn registry(probe: Arc<ScriptedProbe>, ttl: Duration) -> HealthRegistry {
        let urls = HashMap::from([(
            "exams".to_string(),
            "http://exams_service:8000".to_string(),
        )]);
        HealthRegistry::new(urls, ttl, probe)
    }

    #[tokio::test]
    async fn test_fresh_entry_served_from_cache() {
        let probe = ScriptedProbe::new(true);
        let reg = registry(probe.clone(), Duration::from_secs(30));

        assert!(reg.is_available("exams").await);
        assert!(reg.is_available("exams").await);
        assert!(reg.is_available("exams").await);
        // Only the first call probed; the rest hit the cache.
        assert_eq!(probe.calls(), 1);
    }

    #[tokio::test]
    async fn test_stale_entry_reprobes() {
        let probe = ScriptedProbe::new(true);
        let reg = registry(probe.clone(), Duration::from_millis(0));

        assert!(reg.is_available("exams").await);
        probe.set_healthy(false);
        assert!(!reg.is_available("exams").await);
        assert_eq!(probe.calls(), 2);
    }

    #[tokio::test]
    async fn test_unknown_service_is_unavailable() {
        let probe = ScriptedProbe::new(true);
        let reg = registry(probe.clone(), Duration::from_secs(30));
        assert!(!reg.is_available("payments").await);
        assert_eq!(probe.calls(), 0);
    }

    #[tokio::test]
    async fn test_force_refresh_bypasses_ttl() {
        let probe = ScriptedProbe::new(true);
        let reg = registry(probe.clone(), Duration::from_secs(3600));

        assert!(reg.is_available("exams").await);
        probe.set_healthy(false);
        // Cache still says healthy.
        assert!(reg.is_available("exams").await);
        let entry = reg.force_refresh("exams").await.unwrap();
        assert!(!entry.healthy);
        assert_eq!(entry.last_error.as_deref(), Some("connection refused"));
    }

    #[tokio::test]
    async fn test_mark_unhealthy_overrides_cache() {
        let probe = ScriptedProbe::new(true);
        let reg = registry(probe.clone(), Duration::from_secs(3600));

        assert!(reg.is_available("exams").await);
        reg.mark_unhealthy("exams", "upstream timeout".to_string());
        assert!(!reg.is_available("exams").await);
        // No extra probe happened — the passive mark is authoritative
        // until the TTL expires.
        assert_eq!(probe.calls(), 1);
    }

    #[tokio::test]
    async fn test_check_all_returns_every_service() {
        let probe = ScriptedProbe::new(false);
        let urls = HashMap::from([
            ("courses".to_string(), "http://courses:8000".to_string()),
            ("trainees".to_string(), "http://trainees:8000".to_string()),
            ("exams".to_string(), "http://exams:8000".to_string()),
        ]);
        let reg = HealthRegistry::new(urls, Duration::from_secs(30), probe);
        let snapshot = reg.check_all().await;
        assert_eq!(snapshot.len(), 3);
        assert!(snapshot.values().all(|e| !e.healthy));
    }

    #[tokio::test]
    async fn test_concurrent_probes_single_flight() {
        let probe = ScriptedProbe::new(true);
        let reg = Arc::new(registry(probe.clone(), Duration::from_secs(30)));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let reg = reg.clone();
            handles.push(tokio::spawn(async move { reg.is_available("exams").await }));
        }
        for h in handles {
            assert!(h.await.unwrap());
        }
        assert_eq!(probe.calls(), 1);
    }
}
