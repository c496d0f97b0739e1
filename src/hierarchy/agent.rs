//! Agent model: specs supplied by callers, live records owned by the
//! hierarchy manager.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

pub type AgentId = String;

/// A named skill. Assignment requires the agent's capability set to be a
/// superset of the subtask's.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capability(String);

impl Capability {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Capability {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Coarse role grouping. Informational: used for selection filters and
/// status reporting, never for access control.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum AgentTier {
    Executive,
    Managerial,
    Specialist,
    Support,
}

impl AgentTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentTier::Executive => "executive",
            AgentTier::Managerial => "managerial",
            AgentTier::Specialist => "specialist",
            AgentTier::Support => "support",
        }
    }
}

impl fmt::Display for AgentTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Busy,
    Draining,
    Failed,
    Retired,
}

impl AgentStatus {
    /// Whether the agent may receive new assignments.
    pub fn selectable(&self) -> bool {
        matches!(self, AgentStatus::Idle | AgentStatus::Busy)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Busy => "busy",
            AgentStatus::Draining => "draining",
            AgentStatus::Failed => "failed",
            AgentStatus::Retired => "retired",
        }
    }
}

/// Reference an agent holds to a subtask it is executing. Agents never own
/// subtasks; workflows do.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct TaskRef {
    pub workflow_id: String,
    pub subtask_id: String,
}

impl TaskRef {
    pub fn new(workflow_id: impl Into<String>, subtask_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            subtask_id: subtask_id.into(),
        }
    }
}

impl fmt::Display for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.workflow_id, self.subtask_id)
    }
}

/// Immutable agent description supplied at registration. Capability sets are
/// fixed for the agent's lifetime; retire and re-register to change them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    pub name: String,
    pub tier: AgentTier,
    pub capabilities: BTreeSet<Capability>,
    pub max_concurrent: usize,
    pub quality_floor: f64,
    pub cost_per_hour: f64,
}

impl AgentSpec {
    pub fn new(name: impl Into<String>, tier: AgentTier) -> Self {
        Self {
            name: name.into(),
            tier,
            capabilities: BTreeSet::new(),
            max_concurrent: 1,
            quality_floor: 0.0,
            cost_per_hour: 0.0,
        }
    }

    pub fn with_capability(mut self, capability: impl Into<Capability>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    pub fn with_capabilities<I, C>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Capability>,
    {
        self.capabilities
            .extend(capabilities.into_iter().map(Into::into));
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    pub fn with_quality_floor(mut self, floor: f64) -> Self {
        self.quality_floor = floor.clamp(0.0, 1.0);
        self
    }

    pub fn with_cost_per_hour(mut self, cost: f64) -> Self {
        self.cost_per_hour = cost.max(0.0);
        self
    }
}

impl From<String> for Capability {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Live pool entry. Owned by the hierarchy manager; everything else refers
/// to it by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: AgentId,
    pub spec: AgentSpec,
    pub status: AgentStatus,
    pub current_tasks: BTreeSet<TaskRef>,
    /// Exponential moving average over execution outcomes, optimistic start.
    pub success_rate: f64,
    /// Exponential moving average over returned quality scores.
    pub quality_score: f64,
    pub consecutive_failures: u32,
    /// Monotonic registration sequence, used for round-robin ordering.
    pub registered_seq: u64,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl AgentRecord {
    pub fn new(id: AgentId, spec: AgentSpec, seq: u64, now: DateTime<Utc>) -> Self {
        Self {
            id,
            spec,
            status: AgentStatus::Idle,
            current_tasks: BTreeSet::new(),
            success_rate: 1.0,
            quality_score: 1.0,
            consecutive_failures: 0,
            registered_seq: seq,
            registered_at: now,
            last_heartbeat: now,
        }
    }

    pub fn load_ratio(&self) -> f64 {
        self.current_tasks.len() as f64 / self.spec.max_concurrent.max(1) as f64
    }

    pub fn has_spare_capacity(&self) -> bool {
        self.current_tasks.len() < self.spec.max_concurrent
    }

    /// Candidate filter used by selection: capability superset, selectable
    /// status, spare capacity.
    pub fn can_serve(&self, required: &BTreeSet<Capability>) -> bool {
        self.status.selectable()
            && self.has_spare_capacity()
            && required.is_subset(&self.spec.capabilities)
    }

    /// Fold one execution outcome into the rolling scores.
    pub(crate) fn observe_outcome(&mut self, outcome: &ReleaseOutcome, alpha: f64) {
        match outcome {
            ReleaseOutcome::Success { quality } => {
                self.quality_score = alpha * quality + (1.0 - alpha) * self.quality_score;
                self.success_rate = alpha + (1.0 - alpha) * self.success_rate;
                self.consecutive_failures = 0;
            }
            ReleaseOutcome::Failure => {
                self.success_rate = (1.0 - alpha) * self.success_rate;
                self.consecutive_failures += 1;
            }
        }
    }
}

/// Outcome reported when an agent's task slot is released.
#[derive(Debug, Clone, PartialEq)]
pub enum ReleaseOutcome {
    Success { quality: f64 },
    Failure,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(max_concurrent: usize) -> AgentRecord {
        let spec = AgentSpec::new("worker", AgentTier::Specialist)
            .with_capability("data_analysis")
            .with_max_concurrent(max_concurrent);
        AgentRecord::new("agent-0001".into(), spec, 1, Utc::now())
    }

    #[test]
    fn can_serve_requires_superset() {
        let rec = record(2);
        let mut required = BTreeSet::new();
        required.insert(Capability::from("data_analysis"));
        assert!(rec.can_serve(&required));
        required.insert(Capability::from("content_writing"));
        assert!(!rec.can_serve(&required));
    }

    #[test]
    fn capacity_bounds_selection() {
        let mut rec = record(1);
        let required = BTreeSet::from([Capability::from("data_analysis")]);
        rec.current_tasks.insert(TaskRef::new("wf-1", "st-01"));
        assert!(!rec.has_spare_capacity());
        assert!(!rec.can_serve(&required));
    }

    #[test]
    fn ema_tracks_quality() {
        let mut rec = record(1);
        rec.observe_outcome(&ReleaseOutcome::Success { quality: 0.5 }, 0.2);
        assert!((rec.quality_score - 0.9).abs() < 1e-9);
        rec.observe_outcome(&ReleaseOutcome::Failure, 0.2);
        assert!((rec.success_rate - 0.8).abs() < 1e-9);
        assert_eq!(rec.consecutive_failures, 1);
        rec.observe_outcome(&ReleaseOutcome::Success { quality: 0.9 }, 0.2);
        assert_eq!(rec.consecutive_failures, 0);
    }

    #[test]
    fn spec_builder_clamps() {
        let spec = AgentSpec::new("w", AgentTier::Support)
            .with_max_concurrent(0)
            .with_quality_floor(1.5)
            .with_cost_per_hour(-2.0);
        assert_eq!(spec.max_concurrent, 1);
        assert_eq!(spec.quality_floor, 1.0);
        assert_eq!(spec.cost_per_hour, 0.0);
    }
}
