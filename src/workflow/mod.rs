//! Workflow and subtask model.
//!
//! A workflow owns its subtasks in an id-keyed map; every cross-reference
//! (dependencies, assigned agents) is an id, never a pointer. Status
//! machines are enforced here so illegal transitions surface as internal
//! invariant violations instead of silent corruption.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

use crate::error::{GraphError, OrchestrationError, OrchestrationResult};
use crate::hierarchy::{AgentId, Capability};

pub type WorkflowId = String;
pub type SubtaskId = String;

/// Attempt records kept per subtask for `status` reporting.
const ATTEMPT_HISTORY: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStatus {
    Pending,
    Ready,
    Assigned,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SubtaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubtaskStatus::Completed | SubtaskStatus::Failed | SubtaskStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SubtaskStatus::Pending => "pending",
            SubtaskStatus::Ready => "ready",
            SubtaskStatus::Assigned => "assigned",
            SubtaskStatus::Running => "running",
            SubtaskStatus::Completed => "completed",
            SubtaskStatus::Failed => "failed",
            SubtaskStatus::Cancelled => "cancelled",
        }
    }

    fn can_transition_to(&self, to: SubtaskStatus) -> bool {
        use SubtaskStatus::*;
        match self {
            Pending => matches!(to, Ready | Cancelled),
            Ready => matches!(to, Assigned | Failed | Cancelled),
            Assigned => matches!(to, Running | Ready | Cancelled),
            Running => matches!(to, Completed | Failed | Ready | Cancelled),
            Completed | Failed | Cancelled => false,
        }
    }
}

/// One execution attempt, as exposed through `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub outcome: AttemptOutcome,
    pub agent_id: Option<AgentId>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Completed { quality: f64 },
    TransientFailure { reason: String },
    PermanentFailure { reason: String },
    QualityBelowThreshold { quality: f64, required: f64 },
    TimedOut,
    AgentFailed,
}

/// Accepted result of a completed subtask.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtaskResult {
    pub output: Value,
    pub quality: f64,
    pub cost: f64,
    pub duration_ms: u64,
    pub agent_id: AgentId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    pub id: SubtaskId,
    pub title: String,
    pub description: String,
    pub required_capabilities: BTreeSet<Capability>,
    pub estimated_minutes: u32,
    pub priority: i32,
    pub input: Value,
    pub depends_on: BTreeSet<SubtaskId>,
    pub quality_threshold: f64,
    pub retry_budget: u32,
    /// Overrides the executor's default selection strategy when set.
    pub selection_strategy: Option<crate::hierarchy::SelectionStrategy>,
    pub status: SubtaskStatus,
    pub attempts: Vec<AttemptRecord>,
    pub result: Option<SubtaskResult>,
    pub assigned_agent: Option<AgentId>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Subtask {
    pub fn new(
        id: impl Into<SubtaskId>,
        title: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: description.into(),
            required_capabilities: BTreeSet::new(),
            estimated_minutes: 1,
            priority: 5,
            input: Value::Null,
            depends_on: BTreeSet::new(),
            quality_threshold: 0.7,
            retry_budget: 3,
            selection_strategy: None,
            status: SubtaskStatus::Pending,
            attempts: Vec::new(),
            result: None,
            assigned_agent: None,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_capability(mut self, capability: impl Into<Capability>) -> Self {
        self.required_capabilities.insert(capability.into());
        self
    }

    pub fn with_dependency(mut self, id: impl Into<SubtaskId>) -> Self {
        self.depends_on.insert(id.into());
        self
    }

    pub fn with_estimated_minutes(mut self, minutes: u32) -> Self {
        self.estimated_minutes = minutes;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    pub fn with_quality_threshold(mut self, threshold: f64) -> Self {
        self.quality_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    pub fn with_retry_budget(mut self, budget: u32) -> Self {
        self.retry_budget = budget;
        self
    }

    /// Enforce the status machine. Completed is monotonic: nothing moves a
    /// completed subtask anywhere else.
    pub fn transition(&mut self, to: SubtaskStatus) -> OrchestrationResult<()> {
        if self.status == to {
            return Ok(());
        }
        if !self.status.can_transition_to(to) {
            return Err(OrchestrationError::InternalInvariant(format!(
                "illegal subtask transition {} -> {} for '{}'",
                self.status.as_str(),
                to.as_str(),
                self.id
            )));
        }
        self.status = to;
        if to.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    pub fn record_attempt(&mut self, record: AttemptRecord) {
        self.attempts.push(record);
        if self.attempts.len() > ATTEMPT_HISTORY {
            let overflow = self.attempts.len() - ATTEMPT_HISTORY;
            self.attempts.drain(..overflow);
        }
    }

    /// Weight used for workflow-level quality aggregation.
    fn quality_weight(&self) -> f64 {
        self.estimated_minutes.max(1) as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Created,
    Planning,
    Executing,
    Completed,
    Failed,
    Cancelled,
    Paused,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Created => "created",
            WorkflowStatus::Planning => "planning",
            WorkflowStatus::Executing => "executing",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Cancelled => "cancelled",
            WorkflowStatus::Paused => "paused",
        }
    }

    fn can_transition_to(&self, to: WorkflowStatus) -> bool {
        use WorkflowStatus::*;
        match self {
            Created => matches!(to, Planning | Cancelled),
            Planning => matches!(to, Executing | Failed | Cancelled),
            Executing => matches!(to, Completed | Failed | Cancelled | Paused),
            // An escalation landing mid-pause may still fail the workflow.
            Paused => matches!(to, Executing | Failed | Cancelled),
            Completed | Failed | Cancelled => false,
        }
    }
}

/// Why a workflow ended in `failed` or `cancelled`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    CapacityExhausted { subtask_id: SubtaskId },
    CriticalSubtaskFailed { subtask_id: SubtaskId, detail: String },
    QualityBelowTarget { aggregate: f64, target: f64 },
    DeadlineExceeded,
    InternalInvariant { detail: String },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::CapacityExhausted { subtask_id } => {
                write!(f, "capacity exhausted for subtask {}", subtask_id)
            }
            FailureReason::CriticalSubtaskFailed { subtask_id, detail } => {
                write!(f, "critical subtask {} failed: {}", subtask_id, detail)
            }
            FailureReason::QualityBelowTarget { aggregate, target } => {
                write!(f, "aggregate quality {:.2} below target {:.2}", aggregate, target)
            }
            FailureReason::DeadlineExceeded => f.write_str("deadline exceeded"),
            FailureReason::InternalInvariant { detail } => {
                write!(f, "internal invariant violated: {}", detail)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub brief: String,
    pub created_at: DateTime<Utc>,
    pub priority: i32,
    pub quality_target: f64,
    pub deadline: Option<DateTime<Utc>>,
    pub status: WorkflowStatus,
    pub failure_reason: Option<FailureReason>,
    pub subtasks: BTreeMap<SubtaskId, Subtask>,
    /// Critical-path length at admission, in estimated minutes.
    pub estimated_total_minutes: u32,
}

impl Workflow {
    pub fn new(id: impl Into<WorkflowId>, brief: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            brief: brief.into(),
            created_at: Utc::now(),
            priority: 5,
            quality_target: 0.85,
            deadline: None,
            status: WorkflowStatus::Created,
            failure_reason: None,
            subtasks: BTreeMap::new(),
            estimated_total_minutes: 0,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_quality_target(mut self, target: f64) -> Self {
        self.quality_target = target.clamp(0.0, 1.0);
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn insert_subtask(&mut self, subtask: Subtask) {
        self.subtasks.insert(subtask.id.clone(), subtask);
    }

    pub fn transition(&mut self, to: WorkflowStatus) -> OrchestrationResult<()> {
        if self.status == to {
            return Ok(());
        }
        if !self.status.can_transition_to(to) {
            return Err(OrchestrationError::InternalInvariant(format!(
                "illegal workflow transition {} -> {} for '{}'",
                self.status.as_str(),
                to.as_str(),
                self.id
            )));
        }
        self.status = to;
        Ok(())
    }

    /// Admission validation: non-empty, every dependency resolves, every
    /// subtask declares at least one capability, and the graph is acyclic
    /// (Kahn's algorithm). Returns a topological order on success.
    pub fn validate(&self) -> Result<Vec<SubtaskId>, GraphError> {
        if self.subtasks.is_empty() {
            return Err(GraphError::Empty);
        }
        for subtask in self.subtasks.values() {
            if subtask.required_capabilities.is_empty() {
                return Err(GraphError::MissingCapabilities(subtask.id.clone()));
            }
            for dep in &subtask.depends_on {
                if !self.subtasks.contains_key(dep) {
                    return Err(GraphError::UnknownDependency {
                        subtask: subtask.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        let mut in_degree: BTreeMap<&SubtaskId, usize> = self
            .subtasks
            .iter()
            .map(|(id, st)| (id, st.depends_on.len()))
            .collect();
        let mut dependents: BTreeMap<&SubtaskId, Vec<&SubtaskId>> = BTreeMap::new();
        for (id, subtask) in &self.subtasks {
            for dep in &subtask.depends_on {
                dependents.entry(dep).or_default().push(id);
            }
        }

        let mut queue: VecDeque<&SubtaskId> = in_degree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(self.subtasks.len());
        while let Some(id) = queue.pop_front() {
            order.push(id.clone());
            if let Some(next) = dependents.get(id) {
                for &dependent in next {
                    if let Some(degree) = in_degree.get_mut(dependent) {
                        *degree -= 1;
                        if *degree == 0 {
                            queue.push_back(dependent);
                        }
                    }
                }
            }
        }

        if order.len() < self.subtasks.len() {
            let in_cycle = in_degree
                .iter()
                .find(|(_, deg)| **deg > 0)
                .map(|(id, _)| (*id).clone())
                .unwrap_or_default();
            return Err(GraphError::Cycle(in_cycle));
        }
        Ok(order)
    }

    /// Subtasks with no dependencies, schedulable at admission.
    pub fn root_ids(&self) -> Vec<SubtaskId> {
        self.subtasks
            .values()
            .filter(|st| st.depends_on.is_empty())
            .map(|st| st.id.clone())
            .collect()
    }

    pub fn dependents_of(&self, id: &str) -> Vec<SubtaskId> {
        self.subtasks
            .values()
            .filter(|st| st.depends_on.contains(id))
            .map(|st| st.id.clone())
            .collect()
    }

    /// Pending dependents of `completed_id` whose dependencies are now all
    /// completed.
    pub fn newly_ready(&self, completed_id: &str) -> Vec<SubtaskId> {
        self.dependents_of(completed_id)
            .into_iter()
            .filter(|id| {
                let subtask = &self.subtasks[id];
                subtask.status == SubtaskStatus::Pending
                    && subtask
                        .depends_on
                        .iter()
                        .all(|dep| self.subtasks[dep].status == SubtaskStatus::Completed)
            })
            .collect()
    }

    pub fn all_terminal(&self) -> bool {
        self.subtasks.values().all(|st| st.status.is_terminal())
    }

    pub fn counts_by_status(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for subtask in self.subtasks.values() {
            *counts
                .entry(subtask.status.as_str().to_string())
                .or_insert(0) += 1;
        }
        counts
    }

    /// `Σ(qᵢ·wᵢ) / Σ(wᵢ)` over completed subtasks, weighted by estimated
    /// minutes. No completed subtasks means zero.
    pub fn aggregate_quality(&self) -> f64 {
        let mut weighted = 0.0;
        let mut total_weight = 0.0;
        for subtask in self.subtasks.values() {
            if subtask.status == SubtaskStatus::Completed {
                if let Some(result) = &subtask.result {
                    let w = subtask.quality_weight();
                    weighted += result.quality * w;
                    total_weight += w;
                }
            }
        }
        if total_weight == 0.0 {
            0.0
        } else {
            weighted / total_weight
        }
    }

    /// Longest path through the graph by estimated minutes.
    pub fn critical_path(&self) -> Vec<SubtaskId> {
        let order = match self.validate() {
            Ok(order) => order,
            Err(_) => return Vec::new(),
        };
        self.longest_path(&order, |st| st.estimated_minutes as u64)
    }

    pub fn critical_path_minutes(&self) -> u32 {
        self.critical_path()
            .iter()
            .map(|id| self.subtasks[id].estimated_minutes)
            .sum()
    }

    pub fn is_on_critical_path(&self, id: &str) -> bool {
        self.critical_path().iter().any(|st| st == id)
    }

    /// Remaining critical-path minutes over non-completed subtasks; the ETA
    /// surfaced through `status`.
    pub fn remaining_minutes(&self) -> u32 {
        let order = match self.validate() {
            Ok(order) => order,
            Err(_) => return 0,
        };
        let path = self.longest_path(&order, |st| {
            if st.status == SubtaskStatus::Completed {
                0
            } else {
                st.estimated_minutes as u64
            }
        });
        path.iter()
            .map(|id| {
                let st = &self.subtasks[id];
                if st.status == SubtaskStatus::Completed {
                    0
                } else {
                    st.estimated_minutes
                }
            })
            .sum()
    }

    pub fn report(&self) -> WorkflowReport {
        let subtasks = self
            .subtasks
            .values()
            .map(|st| SubtaskReport {
                id: st.id.clone(),
                title: st.title.clone(),
                status: st.status,
                assigned_agent: st.assigned_agent.clone(),
                quality: st.result.as_ref().map(|r| r.quality),
                attempts: st.attempts.clone(),
                retry_budget: st.retry_budget,
                depends_on: st.depends_on.clone(),
            })
            .collect();
        WorkflowReport {
            workflow_id: self.id.clone(),
            status: self.status,
            failure_reason: self.failure_reason.clone(),
            priority: self.priority,
            created_at: self.created_at,
            aggregate_quality: self.aggregate_quality(),
            quality_target: self.quality_target,
            eta_minutes: self.remaining_minutes(),
            counts: self.counts_by_status(),
            subtasks,
        }
    }

    fn longest_path<F>(&self, order: &[SubtaskId], weight: F) -> Vec<SubtaskId>
    where
        F: Fn(&Subtask) -> u64,
    {
        let mut best: BTreeMap<&SubtaskId, (u64, Option<SubtaskId>)> = BTreeMap::new();
        for id in order {
            let subtask = &self.subtasks[id];
            let w = weight(subtask);
            let (pred_len, pred) = subtask
                .depends_on
                .iter()
                .filter_map(|dep| best.get(dep).map(|(len, _)| (*len, dep.clone())))
                .max_by(|a, b| a.0.cmp(&b.0).then_with(|| b.1.cmp(&a.1)))
                .map(|(len, dep)| (len, Some(dep)))
                .unwrap_or((0, None));
            best.insert(id, (pred_len + w, pred));
        }

        let Some((end, _)) = best
            .iter()
            .max_by(|a, b| a.1 .0.cmp(&b.1 .0).then_with(|| b.0.cmp(a.0)))
            .map(|(id, entry)| ((*id).clone(), entry.0))
        else {
            return Vec::new();
        };

        let mut path = vec![end.clone()];
        let mut cursor = end;
        while let Some((_, Some(pred))) = best.get(&cursor) {
            path.push(pred.clone());
            cursor = pred.clone();
        }
        path.reverse();
        path
    }
}

/// Caller-facing view returned by `status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowReport {
    pub workflow_id: WorkflowId,
    pub status: WorkflowStatus,
    pub failure_reason: Option<FailureReason>,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub aggregate_quality: f64,
    pub quality_target: f64,
    pub eta_minutes: u32,
    pub counts: BTreeMap<String, usize>,
    pub subtasks: Vec<SubtaskReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtaskReport {
    pub id: SubtaskId,
    pub title: String,
    pub status: SubtaskStatus,
    pub assigned_agent: Option<AgentId>,
    pub quality: Option<f64>,
    pub attempts: Vec<AttemptRecord>,
    pub retry_budget: u32,
    pub depends_on: BTreeSet<SubtaskId>,
}
