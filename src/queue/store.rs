use crate::config::RedisConfig;
use crate::error::GatewayError;
use crate::queue::message::{QueueKind, QueuedMessage};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::{info, warn};

/// Durable FIFO storage for both queues.
///
/// Push inserts at the head, pop removes from the tail, so pop order equals
/// push order. All operations are atomic with respect to concurrent workers;
/// `remove` is a linear scan by message id.
#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn push(&self, queue: QueueKind, msg: &QueuedMessage) -> Result<(), GatewayError>;

    async fn pop(&self, queue: QueueKind) -> Result<Option<QueuedMessage>, GatewayError>;

    /// Non-destructive read of up to `limit` messages from the tail end,
    /// ordered next-to-pop first.
    async fn peek(&self, queue: QueueKind, limit: usize) -> Result<Vec<QueuedMessage>, GatewayError>;

    /// Remove the first message with the given id, returning it.
    async fn remove(&self, queue: QueueKind, id: &str)
        -> Result<Option<QueuedMessage>, GatewayError>;

    async fn len(&self, queue: QueueKind) -> Result<usize, GatewayError>;

    async fn purge(&self, queue: QueueKind) -> Result<(), GatewayError>;

    /// Backend liveness; `false` feeds the `connected` field of the status
    /// surface.
    async fn ping(&self) -> bool;
}

// ---------------------------------------------------------------------------
// Redis implementation — the reference backend. `ConnectionManager` handles
// reconnects internally, so a bounced Redis shows up as transient op errors
// rather than a dead client.
// ---------------------------------------------------------------------------

pub struct RedisQueueStore {
    manager: ConnectionManager,
}

impl RedisQueueStore {
    /// Connect, trying the configured address first and the local fallbacks
    /// after it.
    pub async fn connect(cfg: &RedisConfig) -> Result<Self, GatewayError> {
        let mut last_err: Option<String> = None;

        for addr in cfg.candidate_addrs() {
            let url = format!("redis://{}", addr);
            let client = match redis::Client::open(url.as_str()) {
                Ok(c) => c,
                Err(e) => {
                    last_err = Some(e.to_string());
                    continue;
                }
            };
            match ConnectionManager::new(client).await {
                Ok(manager) => {
                    info!("queue: redis connected, addr={}", addr);
                    return Ok(Self { manager });
                }
                Err(e) => {
                    warn!("queue: redis connect failed, addr={}, error={}", addr, e);
                    last_err = Some(e.to_string());
                }
            }
        }

        Err(GatewayError::QueueBackend(format!(
            "no redis backend reachable: {}",
            last_err.unwrap_or_else(|| "no candidate addresses".to_string())
        )))
    }

    fn decode(queue: QueueKind, raw: &str) -> Option<QueuedMessage> {
        match serde_json::from_str(raw) {
            Ok(msg) => Some(msg),
            Err(e) => {
                // Corrupt element: drop it and keep the queue moving.
                warn!(
                    "queue: dropping unparseable element, queue={}, error={}",
                    queue.key(),
                    e
                );
                None
            }
        }
    }
}

#[async_trait]
impl QueueStore for RedisQueueStore {
    async fn push(&self, queue: QueueKind, msg: &QueuedMessage) -> Result<(), GatewayError> {
        let payload = serde_json::to_string(msg)?;
        let mut conn = self.manager.clone();
        let _: () = conn.lpush(queue.key(), payload).await?;
        Ok(())
    }

    async fn pop(&self, queue: QueueKind) -> Result<Option<QueuedMessage>, GatewayError> {
        let mut conn = self.manager.clone();
        loop {
            let raw: Option<String> = conn.rpop(queue.key(), None).await?;
            match raw {
                None => return Ok(None),
                Some(raw) => {
                    if let Some(msg) = Self::decode(queue, &raw) {
                        return Ok(Some(msg));
                    }
                    // Unparseable element dropped; try the next one.
                }
            }
        }
    }

    async fn peek(
        &self,
        queue: QueueKind,
        limit: usize,
    ) -> Result<Vec<QueuedMessage>, GatewayError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let start = -(limit.min(isize::MAX as usize) as isize);
        let mut conn = self.manager.clone();
        let raw: Vec<String> = conn.lrange(queue.key(), start, -1).await?;
        // LRANGE returns head→tail order; the tail is next to pop.
        let mut messages: Vec<QueuedMessage> = raw
            .iter()
            .filter_map(|r| Self::decode(queue, r))
            .collect();
        messages.reverse();
        Ok(messages)
    }

    async fn remove(
        &self,
        queue: QueueKind,
        id: &str,
    ) -> Result<Option<QueuedMessage>, GatewayError> {
        let mut conn = self.manager.clone();
        let raw: Vec<String> = conn.lrange(queue.key(), 0, -1).await?;
        for element in raw {
            let Some(msg) = Self::decode(queue, &element) else {
                continue;
            };
            if msg.id == id {
                let removed: i64 = conn.lrem(queue.key(), 1, &element).await?;
                if removed > 0 {
                    return Ok(Some(msg));
                }
                // Another worker raced us to it.
                return Ok(None);
            }
        }
        Ok(None)
    }

    async fn len(&self, queue: QueueKind) -> Result<usize, GatewayError> {
        let mut conn = self.manager.clone();
        let n: i64 = conn.llen(queue.key()).await?;
        Ok(n.max(0) as usize)
    }

    async fn purge(&self, queue: QueueKind) -> Result<(), GatewayError> {
        let mut conn = self.manager.clone();
        let _: i64 = conn.del(queue.key()).await?;
        Ok(())
    }

    async fn ping(&self) -> bool {
        let mut conn = self.manager.clone();
        let result: Result<String, redis::RedisError> =
            redis::cmd("PING").query_async(&mut conn).await;
        matches!(result, Ok(ref pong) if pong == "PONG")
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation — deterministic tests and degraded local runs.
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryQueueStore {
    main: Mutex<VecDeque<QueuedMessage>>,
    dead_letter: Mutex<VecDeque<QueuedMessage>>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self, queue: QueueKind) -> std::sync::MutexGuard<'_, VecDeque<QueuedMessage>> {
        let mu = match queue {
            QueueKind::Main => &self.main,
            QueueKind::DeadLetter => &self.dead_letter,
        };
        mu.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn push(&self, queue: QueueKind, msg: &QueuedMessage) -> Result<(), GatewayError> {
        self.lock(queue).push_front(msg.clone());
        Ok(())
    }

    async fn pop(&self, queue: QueueKind) -> Result<Option<QueuedMessage>, GatewayError> {
        Ok(self.lock(queue).pop_back())
    }

    async fn peek(
        &self,
        queue: QueueKind,
        limit: usize,
    ) -> Result<Vec<QueuedMessage>, GatewayError> {
        Ok(self.lock(queue).iter().rev().take(limit).cloned().collect())
    }

    async fn remove(
        &self,
        queue: QueueKind,
        id: &str,
    ) -> Result<Option<QueuedMessage>, GatewayError> {
        let mut q = self.lock(queue);
        let pos = q.iter().position(|m| m.id == id);
        Ok(pos.and_then(|i| q.remove(i)))
    }

    async fn len(&self, queue: QueueKind) -> Result<usize, GatewayError> {
        Ok(self.lock(queue).len())
    }

    async fn purge(&self, queue: QueueKind) -> Result<(), GatewayError> {
        self.lock(queue).clear();
        Ok(())
    }

    async fn ping(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn msg(id: &str) -> QueuedMessage {
        QueuedMessage {
            id: id.to_string(),
            timestamp: Utc::now(),
            service: "exams".to_string(),
            endpoint: "/exams".to_string(),
            method: "POST".to_string(),
            data: serde_json::Value::Null,
            headers: Default::default(),
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
        }
    }

    #[tokio::test]
    async fn test_fifo_pop_order_matches_push_order() {
        let store = MemoryQueueStore::new();
        for id in ["a", "b", "c"] {
            store.push(QueueKind::Main, &msg(id)).await.unwrap();
        }
        let mut popped = Vec::new();
        while let Some(m) = store.pop(QueueKind::Main).await.unwrap() {
            popped.push(m.id);
        }
        assert_eq!(popped, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_push_pop_round_trip_preserves_message() {
        let store = MemoryQueueStore::new();
        let original = msg("round-trip");
        store.push(QueueKind::Main, &original).await.unwrap();
        let back = store.pop(QueueKind::Main).await.unwrap().unwrap();
        assert_eq!(back, original);
    }

    #[tokio::test]
    async fn test_peek_is_non_destructive_and_pop_ordered() {
        let store = MemoryQueueStore::new();
        for id in ["a", "b", "c"] {
            store.push(QueueKind::Main, &msg(id)).await.unwrap();
        }
        let peeked = store.peek(QueueKind::Main, 2).await.unwrap();
        assert_eq!(
            peeked.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );
        assert_eq!(store.len(QueueKind::Main).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_remove_by_id() {
        let store = MemoryQueueStore::new();
        for id in ["a", "b", "c"] {
            store.push(QueueKind::Main, &msg(id)).await.unwrap();
        }
        let removed = store.remove(QueueKind::Main, "b").await.unwrap().unwrap();
        assert_eq!(removed.id, "b");
        assert_eq!(store.len(QueueKind::Main).await.unwrap(), 2);
        assert!(store.remove(QueueKind::Main, "b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_purge_empties_queue() {
        let store = MemoryQueueStore::new();
        for id in ["a", "b"] {
            store.push(QueueKind::DeadLetter, &msg(id)).await.unwrap();
        }
        store.purge(QueueKind::DeadLetter).await.unwrap();
        assert_eq!(store.len(QueueKind::DeadLetter).await.unwrap(), 0);
        assert!(store.pop(QueueKind::DeadLetter).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_queues_are_independent() {
        let store = MemoryQueueStore::new();
        store.push(QueueKind::Main, &msg("m")).await.unwrap();
        store.push(QueueKind::DeadLetter, &msg("d")).await.unwrap();
        assert_eq!(store.len(QueueKind::Main).await.unwrap(), 1);
        assert_eq!(store.len(QueueKind::DeadLetter).await.unwrap(), 1);
        assert_eq!(
            store.pop(QueueKind::DeadLetter).await.unwrap().unwrap().id,
            "d"
        );
        assert_eq!(store.len(QueueKind::Main).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_pop_empty_returns_none() {
        let store = MemoryQueueStore::new();
        assert!(store.pop(QueueKind::Main).await.unwrap().is_none());
    }
}
