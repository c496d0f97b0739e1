//! Error taxonomy for the orchestration core.
//!
//! Transient errors are absorbed locally (retry budgets, backoff) and only
//! surface once budgets are exhausted. Internal invariant violations are
//! never swallowed: they fail the owning workflow and are recorded as
//! structured events.

use thiserror::Error;

pub type OrchestrationResult<T> = Result<T, OrchestrationError>;

/// Top-level error surfaced to callers of the orchestration core.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum OrchestrationError {
    /// External dependency (planner, specialist) failed in a retryable way.
    #[error("transient external failure: {0}")]
    TransientExternal(String),

    /// External dependency reported a non-retryable failure.
    #[error("permanent external failure: {0}")]
    PermanentExternal(String),

    /// No agent matches, pool is full, or a factory cap was hit.
    #[error("capacity exhausted: {0}")]
    CapacityExhausted(String),

    /// Caller-supplied input was rejected before any work started.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The planner kept producing unusable plans within the attempt bound.
    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    /// A result cleared execution but not its quality gate.
    #[error("quality {got:.2} below threshold {required:.2}")]
    QualityBelowThreshold { got: f64, required: f64 },

    /// The workflow's deadline expired before completion.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// Explicit cancellation or process shutdown.
    #[error("cancelled")]
    Cancelled,

    /// A bug: the core observed a state it promises can never occur.
    #[error("internal invariant violated: {0}")]
    InternalInvariant(String),

    #[error("unknown workflow: {0}")]
    UnknownWorkflow(String),

    #[error("unknown agent: {0}")]
    UnknownAgent(String),
}

impl OrchestrationError {
    /// Whether local recovery (retry with backoff) is worth attempting.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            OrchestrationError::TransientExternal(_)
                | OrchestrationError::CapacityExhausted(_)
                | OrchestrationError::QualityBelowThreshold { .. }
        )
    }
}

/// Structural problems found while admitting a workflow graph.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("cycle detected involving subtask '{0}'")]
    Cycle(String),

    #[error("subtask '{subtask}' depends on unknown subtask '{dependency}'")]
    UnknownDependency { subtask: String, dependency: String },

    #[error("subtask '{0}' declares no required capabilities")]
    MissingCapabilities(String),

    #[error("graph contains no subtasks")]
    Empty,
}

impl From<GraphError> for OrchestrationError {
    fn from(err: GraphError) -> Self {
        OrchestrationError::InvalidPlan(err.to_string())
    }
}

/// Tag a result with the subsystem and operation it came from when it
/// crosses into anyhow-based glue (embedding code, test harnesses). The
/// component names match the labels the metrics sink uses, so a failure
/// message and its counters line up.
pub trait OrchestrationContext<T> {
    fn in_component(self, component: &str, operation: &str) -> anyhow::Result<T>;
}

impl<T, E> OrchestrationContext<T> for Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn in_component(self, component: &str, operation: &str) -> anyhow::Result<T> {
        use anyhow::Context;
        self.with_context(|| format!("{}: {} failed", component, operation))
    }
}
