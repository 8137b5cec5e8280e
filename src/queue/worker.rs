use crate::config::{CacheConfig, WorkerConfig};
use crate::error::GatewayError;
use crate::queue::cache::EphemeralCache;
use crate::queue::message::{QueueKind, QueuedMessage};
use crate::queue::metrics::QueueMetrics;
use crate::queue::store::QueueStore;
use crate::upstream::client::{UpstreamClient, UpstreamRequest};
use crate::upstream::health::HealthRegistry;
use chrono::Utc;
use rand::Rng;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Exponential backoff with a hard cap and uniform jitter:
/// `min(2^retry_count, cap) + [0, 1)` seconds. Never exceeds `cap + 1`.
pub fn backoff_delay(retry_count: u32, cap_secs: u64) -> Duration {
    let exp = 2u64.saturating_pow(retry_count.min(32)).min(cap_secs);
    let jitter_ms = rand::thread_rng().gen_range(0..1000);
    Duration::from_millis(exp * 1000 + jitter_ms)
}

/// Outcome tally of one drain cycle, returned to the ops surface.
#[derive(Debug, Default, Clone, Serialize)]
pub struct CycleReport {
    pub queue: &'static str,
    pub popped: usize,
    pub processed: usize,
    pub failed: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    /// Messages rotated back because their `not_before` had not elapsed.
    pub deferred: usize,
}

/// Result of an operator-initiated targeted retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    Success,
    Failed,
    NotFound,
}

enum Disposition {
    Processed,
    /// `upstream_failed` distinguishes a real upstream failure from a
    /// health-gated skip — only the former counts toward `failed`.
    Retried { upstream_failed: bool },
    DeadLettered { upstream_failed: bool },
}

/// Drains the queues in bounded cycles: pop, re-check health, re-execute,
/// and apply retry/backoff or dead-letter on failure.
///
/// Requeue never blocks the loop — backoff is realized by stamping
/// `not_before` and rotating messages that are not yet due.
pub struct Worker {
    store: Arc<dyn QueueStore>,
    health: Arc<HealthRegistry>,
    upstream: Arc<dyn UpstreamClient>,
    metrics: Arc<QueueMetrics>,
    cache: Arc<EphemeralCache>,
    worker_cfg: WorkerConfig,
    cache_cfg: CacheConfig,
}

impl Worker {
    pub fn new(
        store: Arc<dyn QueueStore>,
        health: Arc<HealthRegistry>,
        upstream: Arc<dyn UpstreamClient>,
        metrics: Arc<QueueMetrics>,
        cache: Arc<EphemeralCache>,
        worker_cfg: WorkerConfig,
        cache_cfg: CacheConfig,
    ) -> Self {
        Self {
            store,
            health,
            upstream,
            metrics,
            cache,
            worker_cfg,
            cache_cfg,
        }
    }

    /// Run one bounded drain cycle over the given queue.
    pub async fn drain(&self, queue: QueueKind) -> CycleReport {
        match queue {
            QueueKind::Main => self.drain_main().await,
            QueueKind::DeadLetter => self.drain_dead_letter().await,
        }
    }

    async fn drain_main(&self) -> CycleReport {
        let mut report = CycleReport {
            queue: QueueKind::Main.as_str(),
            ..Default::default()
        };
        // Ids already rotated this cycle — seeing one again means the
        // whole queue has been walked.
        let mut rotated: HashSet<String> = HashSet::new();

        for _ in 0..self.worker_cfg.main_batch {
            let msg = match self.store.pop(QueueKind::Main).await {
                Ok(Some(msg)) => msg,
                Ok(None) => break,
                Err(e) => {
                    error!("worker: cycle aborted, queue=main, error={}", e);
                    break;
                }
            };
            report.popped += 1;

            if !msg.is_due(Utc::now()) {
                let wrapped = !rotated.insert(msg.id.clone());
                if let Err(e) = self.store.push(QueueKind::Main, &msg).await {
                    error!(
                        "worker: failed to rotate deferred message, id={}, error={}",
                        msg.id, e
                    );
                    break;
                }
                if wrapped {
                    break;
                }
                report.deferred += 1;
                continue;
            }

            match self.process_main_message(msg).await {
                Ok(Disposition::Processed) => report.processed += 1,
                Ok(Disposition::Retried { upstream_failed }) => {
                    if upstream_failed {
                        report.failed += 1;
                    }
                    report.retried += 1;
                }
                Ok(Disposition::DeadLettered { upstream_failed }) => {
                    if upstream_failed {
                        report.failed += 1;
                    }
                    report.dead_lettered += 1;
                }
                Err(e) => {
                    error!("worker: cycle aborted, queue=main, error={}", e);
                    break;
                }
            }
        }

        if report.popped > 0 {
            info!(
                "worker: cycle complete, queue=main, popped={}, processed={}, retried={}, dead_lettered={}, deferred={}",
                report.popped, report.processed, report.retried, report.dead_lettered, report.deferred
            );
        }
        report
    }

    async fn drain_dead_letter(&self) -> CycleReport {
        let mut report = CycleReport {
            queue: QueueKind::DeadLetter.as_str(),
            ..Default::default()
        };
        let mut seen: HashSet<String> = HashSet::new();

        for _ in 0..self.worker_cfg.dead_letter_batch {
            let msg = match self.store.pop(QueueKind::DeadLetter).await {
                Ok(Some(msg)) => msg,
                Ok(None) => break,
                Err(e) => {
                    error!("worker: cycle aborted, queue=dead_letter, error={}", e);
                    break;
                }
            };
            report.popped += 1;
            let wrapped = !seen.insert(msg.id.clone());
            if wrapped {
                // Walked the whole queue; put it back and stop.
                let _ = self.store.push(QueueKind::DeadLetter, &msg).await;
                report.popped -= 1;
                break;
            }

            if !self.health.is_available(&msg.service).await {
                // Service still down: quarantine untouched.
                report.deferred += 1;
                if let Err(e) = self.store.push(QueueKind::DeadLetter, &msg).await {
                    error!(
                        "worker: failed to requeue dead-letter message, id={}, error={}",
                        msg.id, e
                    );
                    break;
                }
                continue;
            }

            match self.execute(&msg).await {
                Ok(true) => {
                    self.metrics.record_processed();
                    info!(
                        "worker: dead-letter message recovered, id={}, service={}",
                        msg.id, msg.service
                    );
                    report.processed += 1;
                }
                Ok(false) | Err(_) => {
                    self.metrics.record_failed();
                    report.failed += 1;
                    if let Err(e) = self.store.push(QueueKind::DeadLetter, &msg).await {
                        error!(
                            "worker: failed to requeue dead-letter message, id={}, error={}",
                            msg.id, e
                        );
                        break;
                    }
                }
            }
        }

        report
    }

    /// One main-pipeline iteration for a single message: health gate,
    /// execution, then retry/backoff or dead-letter accounting.
    async fn process_main_message(&self, msg: QueuedMessage) -> Result<Disposition, GatewayError> {
        if self.health.url_of(&msg.service).is_none() {
            // Should never happen — enqueue validates the service. Keep the
            // message for forensics rather than losing it.
            error!(
                "worker: message targets unknown service, id={}, service={}",
                msg.id, msg.service
            );
            self.dead_letter(msg).await?;
            return Ok(Disposition::DeadLettered {
                upstream_failed: false,
            });
        }

        if !self.health.is_available(&msg.service).await {
            debug!(
                "worker: service unavailable, id={}, service={}, retry_count={}",
                msg.id, msg.service, msg.retry_count
            );
            return self.handle_failure(msg, false).await;
        }

        match self.execute(&msg).await {
            Ok(true) => {
                self.metrics.record_processed();
                debug!(
                    "worker: message delivered, id={}, service={}, endpoint={}",
                    msg.id, msg.service, msg.endpoint
                );
                Ok(Disposition::Processed)
            }
            Ok(false) => {
                self.metrics.record_failed();
                self.handle_failure(msg, true).await
            }
            Err(e) => {
                self.metrics.record_failed();
                warn!(
                    "worker: upstream call failed, id={}, service={}, error={}",
                    msg.id, msg.service, e
                );
                self.handle_failure(msg, true).await
            }
        }
    }

    /// Execute the upstream call for a message. `Ok(true)` on 2xx.
    async fn execute(&self, msg: &QueuedMessage) -> Result<bool, GatewayError> {
        let base = self
            .health
            .url_of(&msg.service)
            .ok_or_else(|| GatewayError::UnknownService(msg.service.clone()))?;
        let resp = self
            .upstream
            .execute(UpstreamRequest::for_message(msg, &base))
            .await?;
        Ok(resp.is_success())
    }

    /// Retry accounting: a message that already used all its retries is
    /// dead-lettered as-is; otherwise the count increments and the message
    /// goes back to the head with a backoff stamp.
    async fn handle_failure(
        &self,
        mut msg: QueuedMessage,
        upstream_failed: bool,
    ) -> Result<Disposition, GatewayError> {
        if msg.retry_count >= msg.max_retries {
            self.dead_letter(msg).await?;
            return Ok(Disposition::DeadLettered { upstream_failed });
        }

        msg.retry_count += 1;
        let delay = backoff_delay(msg.retry_count, self.worker_cfg.backoff_cap_secs);
        msg.not_before = Some(
            Utc::now()
                + chrono::Duration::from_std(delay)
                    .unwrap_or_else(|_| chrono::Duration::seconds(60)),
        );
        debug!(
            "worker: requeued with backoff, id={}, retry_count={}/{}, delay_ms={}",
            msg.id,
            msg.retry_count,
            msg.max_retries,
            delay.as_millis()
        );
        self.store.push(QueueKind::Main, &msg).await?;
        self.metrics.record_retried();
        Ok(Disposition::Retried { upstream_failed })
    }

    async fn dead_letter(&self, mut msg: QueuedMessage) -> Result<(), GatewayError> {
        msg.dead_letter_timestamp = Some(Utc::now());
        msg.not_before = None;
        warn!(
            "worker: message dead-lettered, id={}, service={}, endpoint={}, retry_count={}",
            msg.id, msg.service, msg.endpoint, msg.retry_count
        );
        self.store.push(QueueKind::DeadLetter, &msg).await?;
        self.metrics.record_dead_lettered();

        // Forensics copy for operators, independent of the queue backend.
        if let Ok(value) = serde_json::to_value(&msg) {
            self.cache.set(
                format!("failed_request_{}", msg.id),
                value,
                Duration::from_secs(self.cache_cfg.forensics_ttl_secs),
            );
        }
        Ok(())
    }

    /// Operator-initiated single-message retry: remove from the queue,
    /// clear retry state, and run one pipeline iteration synchronously.
    pub async fn retry_one(
        &self,
        id: &str,
        queue: QueueKind,
    ) -> Result<RetryOutcome, GatewayError> {
        let Some(mut msg) = self.store.remove(queue, id).await? else {
            return Ok(RetryOutcome::NotFound);
        };

        msg.retry_count = 0;
        msg.dead_letter_timestamp = None;
        msg.not_before = None;

        info!(
            "worker: targeted retry, id={}, queue={}, service={}",
            id,
            queue.as_str(),
            msg.service
        );

        match self.process_main_message(msg).await? {
            Disposition::Processed => Ok(RetryOutcome::Success),
            Disposition::Retried { .. } | Disposition::DeadLettered { .. } => {
                Ok(RetryOutcome::Failed)
            }
        }
    }
}
