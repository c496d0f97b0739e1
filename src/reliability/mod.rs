//! Cross-cutting reliability primitives: bounded retry with backoff,
//! per-dependency circuit breakers, and the in-memory metrics sink.

pub mod circuit;
pub mod metrics;
pub mod retry;

pub use circuit::{CircuitBreaker, CircuitOutcome, CircuitState};
pub use metrics::{MetricEvent, MetricLabels, MetricsSink, MetricsSnapshot};
pub use retry::{retry, RetryError, RetryPolicy};
