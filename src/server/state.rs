use crate::config::GatewayConfig;
use crate::metrics::Metrics;
use crate::queue::{EphemeralCache, QueueMetrics, QueueStore, RedisQueueStore, Worker};
use crate::routing::Router;
use crate::upstream::{
    HealthProbe, HealthRegistry, HttpHealthProbe, HttpUpstreamClient, UpstreamClient,
};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Shared gateway state, cheaply cloneable — the composition root.
///
/// Everything is wired exactly once (no hidden globals); handlers and loop
/// owners receive clones. The config is immutable after construction.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<GatewayConfig>,
    pub router: Arc<Router>,
    pub health: Arc<HealthRegistry>,
    pub store: Arc<dyn QueueStore>,
    pub upstream: Arc<dyn UpstreamClient>,
    pub worker: Arc<Worker>,
    pub queue_metrics: Arc<QueueMetrics>,
    pub cache: Arc<EphemeralCache>,
    /// Prometheus handle; `None` when assembled from injected components
    /// (tests), where the global recorder is not installed.
    pub metrics: Option<Metrics>,
}

impl GatewayState {
    /// Production wiring: installs the metrics recorder, connects the Redis
    /// queue backend (configured address first, local fallbacks after),
    /// and builds the HTTP probe and upstream clients.
    pub async fn new(config: GatewayConfig) -> Result<Self> {
        let metrics = Metrics::install();

        let store: Arc<dyn QueueStore> = Arc::new(RedisQueueStore::connect(&config.redis).await?);
        info!("state: queue backend ready");

        let probe: Arc<dyn HealthProbe> = Arc::new(HttpHealthProbe::new(
            Duration::from_secs(config.health.probe_timeout_secs),
            config.health.probe_path.clone(),
        ));
        let upstream: Arc<dyn UpstreamClient> = Arc::new(HttpUpstreamClient::new(
            Duration::from_secs(config.forward.timeout_secs),
        ));

        Ok(Self::assemble(config, store, probe, upstream, Some(metrics)))
    }

    /// Assemble from injected components — deterministic tests and
    /// degraded local runs (e.g. in-memory store).
    pub fn with_components(
        config: GatewayConfig,
        store: Arc<dyn QueueStore>,
        probe: Arc<dyn HealthProbe>,
        upstream: Arc<dyn UpstreamClient>,
    ) -> Self {
        Self::assemble(config, store, probe, upstream, None)
    }

    fn assemble(
        config: GatewayConfig,
        store: Arc<dyn QueueStore>,
        probe: Arc<dyn HealthProbe>,
        upstream: Arc<dyn UpstreamClient>,
        metrics: Option<Metrics>,
    ) -> Self {
        let router = Arc::new(Router::new(&config.services));
        let health = Arc::new(HealthRegistry::new(
            config.services.urls.clone(),
            Duration::from_secs(config.health.ttl_secs),
            probe,
        ));
        let queue_metrics = Arc::new(QueueMetrics::new());
        let cache = Arc::new(EphemeralCache::new());
        let worker = Arc::new(Worker::new(
            store.clone(),
            health.clone(),
            upstream.clone(),
            queue_metrics.clone(),
            cache.clone(),
            config.worker.clone(),
            config.cache.clone(),
        ));

        Self {
            config: Arc::new(config),
            router,
            health,
            store,
            upstream,
            worker,
            queue_metrics,
            cache,
            metrics,
        }
    }
}
