//! Startup configuration for the orchestration core.
//!
//! Every knob is fixed at startup. The single exception is the bus inbox
//! capacity, which may be raised (never lowered) through
//! [`crate::bus::MessageBus::raise_capacity`].

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{OrchestrationError, OrchestrationResult};

/// Aggregate configuration handed to [`crate::orchestrator::Orchestrator::new`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub scheduler: SchedulerConfig,
    pub retry: RetryConfig,
    pub circuit: CircuitConfig,
    pub bus: BusConfig,
    pub hierarchy: HierarchyConfig,
    pub quality: QualityConfig,
    pub decomposer: DecomposerConfig,
    pub drain: DrainConfig,
}

impl OrchestratorConfig {
    /// Reject out-of-range knobs before any component is built.
    pub fn validate(&self) -> OrchestrationResult<()> {
        if self.scheduler.worker_count == 0 {
            return Err(OrchestrationError::InvalidInput(
                "scheduler.worker_count must be at least 1".into(),
            ));
        }
        if self.hierarchy.ema_alpha <= 0.0 || self.hierarchy.ema_alpha > 1.0 {
            return Err(OrchestrationError::InvalidInput(format!(
                "hierarchy.ema_alpha must be in (0, 1], got {}",
                self.hierarchy.ema_alpha
            )));
        }
        if self.bus.backpressure_high_watermark <= 0.0 || self.bus.backpressure_high_watermark > 1.0
        {
            return Err(OrchestrationError::InvalidInput(format!(
                "bus.backpressure_high_watermark must be in (0, 1], got {}",
                self.bus.backpressure_high_watermark
            )));
        }
        if self.bus.inbox_capacity == 0 {
            return Err(OrchestrationError::InvalidInput(
                "bus.inbox_capacity must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.quality.workflow_target)
            || !(0.0..=1.0).contains(&self.quality.default_threshold)
        {
            return Err(OrchestrationError::InvalidInput(
                "quality thresholds must be in [0, 1]".into(),
            ));
        }
        if self.retry.multiplier < 1.0 {
            return Err(OrchestrationError::InvalidInput(format!(
                "retry.multiplier must be at least 1.0, got {}",
                self.retry.multiplier
            )));
        }
        Ok(())
    }
}

/// Executor scheduling knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Number of concurrent worker loops driving ready subtasks.
    pub worker_count: usize,
    pub max_active_workflows: usize,
    pub per_workflow_in_flight: usize,
    /// Backoff applied when no agent is available, doubling per miss.
    pub selection_backoff_base_ms: u64,
    pub selection_backoff_cap_ms: u64,
    /// Consecutive selection misses before the workflow fails with
    /// `CapacityExhausted`.
    pub starvation_limit: u32,
    /// Grace given to in-flight agents after a workflow is cancelled.
    pub cancel_grace_ms: u64,
    /// Multiplier applied to a subtask's estimated duration to obtain its
    /// execution timeout.
    pub execution_timeout_factor: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            worker_count: (4 * cores).min(64),
            max_active_workflows: 100,
            per_workflow_in_flight: 50,
            selection_backoff_base_ms: 1_000,
            selection_backoff_cap_ms: 30_000,
            starvation_limit: 10,
            cancel_grace_ms: 5_000,
            execution_timeout_factor: 2.0,
        }
    }
}

impl SchedulerConfig {
    pub fn selection_backoff(&self, miss_count: u32) -> Duration {
        let exp = self
            .selection_backoff_base_ms
            .saturating_mul(1u64 << miss_count.saturating_sub(1).min(31));
        Duration::from_millis(exp.min(self.selection_backoff_cap_ms))
    }
}

/// Bounded retry with exponential backoff, shared by the decomposer and any
/// caller of [`crate::reliability::retry`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Circuit breaker settings, instantiated per logical dependency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitConfig {
    pub failure_threshold: u32,
    pub window_ms: u64,
    pub cooldown_ms: u64,
    pub half_open_probes: u32,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window_ms: 60_000,
            cooldown_ms: 30_000,
            half_open_probes: 1,
        }
    }
}

/// Communication bus capacity policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    pub inbox_capacity: usize,
    /// Fraction of capacity at which a backpressure event is raised.
    pub backpressure_high_watermark: f64,
    /// Messages at or above this priority are admitted even when an inbox
    /// is full, alongside `Control` and `Escalation` kinds.
    pub critical_priority: u8,
    /// Ack deadline applied when a receipt is requested without a ttl.
    pub default_ack_ttl_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            inbox_capacity: 1024,
            backpressure_high_watermark: 0.8,
            critical_priority: 9,
            default_ack_ttl_ms: 30_000,
        }
    }
}

/// Agent pool management knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HierarchyConfig {
    pub heartbeat_interval_ms: u64,
    /// Heartbeats older than this mark the agent as failed.
    pub stale_after_ms: u64,
    /// Smoothing factor for rolling quality and success scores.
    pub ema_alpha: f64,
    /// Consecutive execution failures before an agent is marked failed.
    pub consecutive_failure_threshold: u32,
    pub max_agents: usize,
    /// Per-capability cap on factory-instantiated agents.
    pub factory_cap: usize,
}

impl Default for HierarchyConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 30_000,
            stale_after_ms: 90_000,
            ema_alpha: 0.2,
            consecutive_failure_threshold: 3,
            max_agents: 500,
            factory_cap: 4,
        }
    }
}

/// Quality gate defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityConfig {
    /// Subtask-level quality threshold when the plan does not set one.
    pub default_threshold: f64,
    /// Workflow-level aggregate quality target.
    pub workflow_target: f64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            default_threshold: 0.7,
            workflow_target: 0.85,
        }
    }
}

/// Brief decomposition knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecomposerConfig {
    pub max_plan_attempts: u32,
    pub max_brief_len: usize,
    pub planner_timeout_ms: u64,
    /// Subtasks estimated longer than this are split recursively.
    pub max_subtask_minutes: u32,
    pub max_split_depth: u32,
    pub default_retry_budget: u32,
    pub default_priority: i32,
}

impl Default for DecomposerConfig {
    fn default() -> Self {
        Self {
            max_plan_attempts: 3,
            max_brief_len: 16_384,
            planner_timeout_ms: 60_000,
            max_subtask_minutes: 240,
            max_split_depth: 3,
            default_retry_budget: 3,
            default_priority: 5,
        }
    }
}

/// Shutdown drain policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrainConfig {
    /// Grace given to in-flight workflows before they are cancelled.
    pub grace_ms: u64,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self { grace_ms: 30_000 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = OrchestratorConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.scheduler.worker_count >= 1);
        assert!(config.scheduler.worker_count <= 64);
    }

    #[test]
    fn rejects_bad_alpha() {
        let mut config = OrchestratorConfig::default();
        config.hierarchy.ema_alpha = 0.0;
        assert!(config.validate().is_err());
        config.hierarchy.ema_alpha = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_workers() {
        let mut config = OrchestratorConfig::default();
        config.scheduler.worker_count = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn selection_backoff_caps() {
        let config = SchedulerConfig {
            selection_backoff_base_ms: 1_000,
            selection_backoff_cap_ms: 30_000,
            ..Default::default()
        };
        assert_eq!(config.selection_backoff(1), Duration::from_secs(1));
        assert_eq!(config.selection_backoff(2), Duration::from_secs(2));
        assert_eq!(config.selection_backoff(10), Duration::from_secs(30));
    }
}
