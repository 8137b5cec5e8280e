pub mod cache;
pub mod message;
pub mod metrics;
pub mod store;
pub mod worker;

pub use cache::EphemeralCache;
pub use message::{QueueKind, QueuedMessage};
pub use metrics::{MetricsSnapshot, QueueMetrics};
pub use store::{MemoryQueueStore, QueueStore, RedisQueueStore};
pub use worker::{CycleReport, RetryOutcome, Worker};
