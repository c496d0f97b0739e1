//! Workflow Executor: owns the scheduling loop, enforces quality gates,
//! aggregates results, and recovers from partial failure.
//!
//! One logical scheduler, many worker loops. Each worker runs a linear
//! pick → assign → send → await sequence; suspension happens only at the
//! await. Workflow state lives behind a per-workflow async mutex which is
//! never held across the execution await.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use std::collections::{BTreeSet, BinaryHeap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bus::{
    BroadcastFilter, ControlCommand, Escalation, Message, MessageKind, MessageBus, RequestError,
    SendStatus, SpecialistOutcome, TaskAssignment,
};
use crate::config::SchedulerConfig;
use crate::error::{OrchestrationError, OrchestrationResult};
use crate::hierarchy::{
    AgentTier, Capability, HierarchyEvent, HierarchyManager, ReleaseOutcome, SelectError,
    SelectionStrategy, TaskLease, TaskRef,
};
use crate::reliability::{MetricLabels, MetricsSink};
use crate::workflow::{
    AttemptOutcome, AttemptRecord, FailureReason, SubtaskResult, SubtaskStatus, Workflow,
    WorkflowId, WorkflowReport, WorkflowStatus,
};

/// Sender id the executor uses on the bus.
pub const EXECUTOR_ID: &str = "executor";

struct ReadyEntry {
    task: TaskRef,
    priority: i32,
    workflow_created_at: DateTime<Utc>,
    seq: u64,
}

impl ReadyEntry {
    fn rank(&self) -> (i32, DateTime<Utc>, u64) {
        (self.priority, self.workflow_created_at, self.seq)
    }
}

impl PartialEq for ReadyEntry {
    fn eq(&self, other: &Self) -> bool {
        self.rank() == other.rank()
    }
}

impl Eq for ReadyEntry {}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyEntry {
    // Max-heap: higher subtask priority first, then older workflow, then
    // arrival order.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.workflow_created_at.cmp(&self.workflow_created_at))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct ReadyQueue {
    heap: StdMutex<BinaryHeap<ReadyEntry>>,
    notify: Notify,
    next_seq: AtomicU64,
}

impl ReadyQueue {
    fn new() -> Self {
        Self {
            heap: StdMutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            next_seq: AtomicU64::new(0),
        }
    }

    fn push(&self, task: TaskRef, priority: i32, workflow_created_at: DateTime<Utc>) {
        let entry = ReadyEntry {
            task,
            priority,
            workflow_created_at,
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
        };
        self.lock().push(entry);
        self.notify.notify_one();
    }

    async fn pop(&self, shutdown: &CancellationToken) -> Option<ReadyEntry> {
        loop {
            let notified = self.notify.notified();
            if let Some(entry) = self.lock().pop() {
                // Wake a sibling in case more than one entry is waiting.
                self.notify.notify_one();
                return Some(entry);
            }
            tokio::select! {
                _ = shutdown.cancelled() => return None,
                _ = notified => {}
            }
        }
    }

    fn remove_workflow(&self, workflow_id: &str) -> usize {
        let mut heap = self.lock();
        let before = heap.len();
        let retained: BinaryHeap<ReadyEntry> = heap
            .drain()
            .filter(|entry| entry.task.workflow_id != workflow_id)
            .collect();
        *heap = retained;
        before - heap.len()
    }

    fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BinaryHeap<ReadyEntry>> {
        self.heap.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct InFlight {
    agent_id: String,
    cancel: CancellationToken,
    agent_failed: Arc<AtomicBool>,
}

/// What a worker decided while holding the workflow lock.
enum Step {
    Dispatch(Box<DispatchPlan>),
    Requeue(Duration),
    Skip,
}

struct DispatchPlan {
    capabilities: BTreeSet<Capability>,
    strategy: SelectionStrategy,
    priority: i32,
    estimated_minutes: u32,
    title: String,
    description: String,
    input: Value,
    quality_threshold: f64,
    workflow_created_at: DateTime<Utc>,
}

pub struct WorkflowExecutor {
    workflows: DashMap<WorkflowId, Arc<Mutex<Workflow>>>,
    wf_tokens: DashMap<WorkflowId, CancellationToken>,
    ready: Arc<ReadyQueue>,
    in_flight: DashMap<TaskRef, InFlight>,
    in_flight_per_wf: DashMap<WorkflowId, usize>,
    starvation: DashMap<TaskRef, u32>,
    hierarchy: Arc<HierarchyManager>,
    bus: Arc<MessageBus>,
    metrics: Arc<MetricsSink>,
    scheduler: SchedulerConfig,
    active: AtomicUsize,
    admission_open: AtomicBool,
    shutdown: CancellationToken,
    background: StdMutex<Vec<JoinHandle<()>>>,
}

impl WorkflowExecutor {
    pub fn new(
        scheduler: SchedulerConfig,
        hierarchy: Arc<HierarchyManager>,
        bus: Arc<MessageBus>,
        metrics: Arc<MetricsSink>,
    ) -> Self {
        Self {
            workflows: DashMap::new(),
            wf_tokens: DashMap::new(),
            ready: Arc::new(ReadyQueue::new()),
            in_flight: DashMap::new(),
            in_flight_per_wf: DashMap::new(),
            starvation: DashMap::new(),
            hierarchy,
            bus,
            metrics,
            scheduler,
            active: AtomicUsize::new(0),
            admission_open: AtomicBool::new(true),
            shutdown: CancellationToken::new(),
            background: StdMutex::new(Vec::new()),
        }
    }

    /// Spawn the worker loops, the deadline watch, and the hierarchy event
    /// pump.
    pub fn start(self: Arc<Self>) {
        let mut handles = self.background.lock().unwrap_or_else(|e| e.into_inner());
        for worker in 0..self.scheduler.worker_count {
            let executor = Arc::clone(&self);
            handles.push(tokio::spawn(async move {
                executor.worker_loop(worker).await;
            }));
        }
        let executor = Arc::clone(&self);
        handles.push(tokio::spawn(async move {
            executor.deadline_loop().await;
        }));
        let executor = Arc::clone(&self);
        let events = self.hierarchy.subscribe();
        handles.push(tokio::spawn(async move {
            executor.event_pump(events).await;
        }));
        info!(workers = self.scheduler.worker_count, "executor started");
    }

    /// Cancel every loop and wait for them to wind down.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.background.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
    }

    pub fn close_admission(&self) {
        self.admission_open.store(false, Ordering::SeqCst);
    }

    pub fn admission_open(&self) -> bool {
        self.admission_open.load(Ordering::SeqCst)
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn ready_depth(&self) -> usize {
        self.ready.len()
    }

    pub fn workflow_ids(&self) -> Vec<WorkflowId> {
        self.workflows.iter().map(|e| e.key().clone()).collect()
    }

    /// Validate and admit a workflow: transition to `executing` and push
    /// its roots onto the ready queue.
    pub async fn admit(&self, mut workflow: Workflow) -> OrchestrationResult<WorkflowId> {
        if !self.admission_open() {
            return Err(OrchestrationError::CapacityExhausted(
                "admission closed (draining)".into(),
            ));
        }
        if self.active_count() >= self.scheduler.max_active_workflows {
            return Err(OrchestrationError::CapacityExhausted(format!(
                "{} active workflows at cap",
                self.active_count()
            )));
        }
        if !matches!(
            workflow.status,
            WorkflowStatus::Created | WorkflowStatus::Planning
        ) {
            return Err(OrchestrationError::InvalidInput(format!(
                "workflow '{}' is {}, expected created or planning",
                workflow.id,
                workflow.status.as_str()
            )));
        }
        if self.workflows.contains_key(&workflow.id) {
            return Err(OrchestrationError::InvalidInput(format!(
                "workflow '{}' already admitted",
                workflow.id
            )));
        }
        workflow.validate()?;

        if workflow.status == WorkflowStatus::Created {
            workflow.transition(WorkflowStatus::Planning)?;
        }
        workflow.transition(WorkflowStatus::Executing)?;

        let workflow_id = workflow.id.clone();
        let created_at = workflow.created_at;
        let mut roots = Vec::new();
        for id in workflow.root_ids() {
            if let Some(subtask) = workflow.subtasks.get_mut(&id) {
                subtask.transition(SubtaskStatus::Ready)?;
                roots.push((id.clone(), subtask.priority));
            }
        }

        self.wf_tokens
            .insert(workflow_id.clone(), self.shutdown.child_token());
        self.in_flight_per_wf.insert(workflow_id.clone(), 0);
        self.workflows
            .insert(workflow_id.clone(), Arc::new(Mutex::new(workflow)));
        self.active.fetch_add(1, Ordering::SeqCst);

        for (subtask_id, priority) in roots {
            self.ready.push(
                TaskRef::new(workflow_id.clone(), subtask_id),
                priority,
                created_at,
            );
        }

        info!(workflow_id = %workflow_id, "workflow admitted");
        self.metrics.counter(
            "workflows_admitted",
            MetricLabels::component("executor").with_workflow(&workflow_id),
            1,
        );
        self.metrics.gauge(
            "active_workflows",
            MetricLabels::component("executor"),
            self.active_count() as f64,
        );
        Ok(workflow_id)
    }

    pub async fn status(&self, workflow_id: &str) -> OrchestrationResult<WorkflowReport> {
        let wf_arc = self.workflow_arc(workflow_id)?;
        let wf = wf_arc.lock().await;
        Ok(wf.report())
    }

    /// Stop new assignments; in-flight subtasks run to completion.
    pub async fn pause(&self, workflow_id: &str) -> OrchestrationResult<()> {
        let wf_arc = self.workflow_arc(workflow_id)?;
        let mut wf = wf_arc.lock().await;
        wf.transition(WorkflowStatus::Paused)?;
        info!(workflow_id, "workflow paused");
        Ok(())
    }

    pub async fn resume(&self, workflow_id: &str) -> OrchestrationResult<()> {
        let wf_arc = self.workflow_arc(workflow_id)?;
        let mut wf = wf_arc.lock().await;
        wf.transition(WorkflowStatus::Executing)?;
        // Everything may have finished while paused.
        self.check_completion(&mut wf);
        info!(workflow_id, "workflow resumed");
        Ok(())
    }

    /// Cancel a workflow: drain its queue entries, cancel in-flight
    /// executions, mark remaining subtasks cancelled.
    pub async fn cancel(
        &self,
        workflow_id: &str,
        reason: Option<FailureReason>,
    ) -> OrchestrationResult<()> {
        let wf_arc = self.workflow_arc(workflow_id)?;
        {
            let mut wf = wf_arc.lock().await;
            if wf.status.is_terminal() {
                return Ok(());
            }
            wf.failure_reason = reason;
            for subtask in wf.subtasks.values_mut() {
                if matches!(subtask.status, SubtaskStatus::Pending | SubtaskStatus::Ready) {
                    let _ = subtask.transition(SubtaskStatus::Cancelled);
                }
            }
            if let Err(err) = wf.transition(WorkflowStatus::Cancelled) {
                warn!(workflow_id, error = %err, "cancel transition rejected");
            }
            self.ready.remove_workflow(workflow_id);
            self.note_terminal(&wf.id);
        }
        if let Some(token) = self.wf_tokens.get(workflow_id) {
            token.cancel();
        }
        self.metrics.counter(
            "workflows_cancelled",
            MetricLabels::component("executor").with_workflow(workflow_id),
            1,
        );
        info!(workflow_id, "workflow cancelled");
        Ok(())
    }

    /// Cancel every non-terminal workflow. Used by the drain path once the
    /// grace period expires.
    pub async fn cancel_all(&self) {
        for workflow_id in self.workflow_ids() {
            let _ = self.cancel(&workflow_id, None).await;
        }
    }

    async fn worker_loop(self: Arc<Self>, worker: usize) {
        debug!(worker, "worker loop started");
        while let Some(entry) = self.ready.pop(&self.shutdown).await {
            self.process(entry).await;
        }
        debug!(worker, "worker loop stopped");
    }

    async fn process(&self, entry: ReadyEntry) {
        let task = entry.task.clone();
        let Some(wf_arc) = self.workflows.get(&task.workflow_id).map(|e| e.value().clone())
        else {
            return;
        };

        let step = {
            let mut wf = wf_arc.lock().await;
            self.plan_step(&mut wf, &task)
        };

        let plan = match step {
            Step::Skip => return,
            Step::Requeue(delay) => {
                self.requeue_later(task, entry.priority, entry.workflow_created_at, delay);
                return;
            }
            Step::Dispatch(plan) => plan,
        };

        // Selection happens outside any workflow lock.
        let lease = match Arc::clone(&self.hierarchy)
            .select_and_assign(&plan.capabilities, plan.strategy, task.clone())
        {
            Ok(lease) => {
                self.starvation.remove(&task);
                lease
            }
            Err(SelectError::NoneAvailable) => {
                self.handle_starvation(&wf_arc, &task, &plan).await;
                return;
            }
        };

        self.dispatch(&wf_arc, task, plan, lease).await;
    }

    /// Examine workflow + subtask state under the lock and decide what to
    /// do with this queue entry.
    fn plan_step(&self, wf: &mut Workflow, task: &TaskRef) -> Step {
        match wf.status {
            WorkflowStatus::Executing => {}
            WorkflowStatus::Paused => return Step::Requeue(Duration::from_millis(200)),
            _ => {
                if let Some(subtask) = wf.subtasks.get_mut(&task.subtask_id) {
                    if !subtask.status.is_terminal() {
                        let _ = subtask.transition(SubtaskStatus::Cancelled);
                    }
                }
                return Step::Skip;
            }
        }

        let in_flight = self
            .in_flight_per_wf
            .get(&task.workflow_id)
            .map(|c| *c.value())
            .unwrap_or(0);
        if in_flight >= self.scheduler.per_workflow_in_flight {
            return Step::Requeue(Duration::from_millis(100));
        }

        let created_at = wf.created_at;
        let Some(subtask) = wf.subtasks.get(&task.subtask_id) else {
            return Step::Skip;
        };
        if subtask.status != SubtaskStatus::Ready {
            return Step::Skip;
        }
        Step::Dispatch(Box::new(DispatchPlan {
            capabilities: subtask.required_capabilities.clone(),
            strategy: subtask.selection_strategy.unwrap_or_default(),
            priority: subtask.priority,
            estimated_minutes: subtask.estimated_minutes,
            title: subtask.title.clone(),
            description: subtask.description.clone(),
            input: subtask.input.clone(),
            quality_threshold: subtask.quality_threshold,
            workflow_created_at: created_at,
        }))
    }

    async fn handle_starvation(
        &self,
        wf_arc: &Arc<Mutex<Workflow>>,
        task: &TaskRef,
        plan: &DispatchPlan,
    ) {
        let misses = {
            let mut entry = self.starvation.entry(task.clone()).or_insert(0);
            *entry += 1;
            *entry
        };
        self.metrics.counter(
            "selection_misses",
            MetricLabels::component("executor").with_workflow(&task.workflow_id),
            1,
        );

        if misses >= self.scheduler.starvation_limit {
            warn!(task = %task, misses, "capability starved, failing workflow");
            self.metrics.counter(
                "starvation_events",
                MetricLabels::component("executor").with_workflow(&task.workflow_id),
                1,
            );
            let mut wf = wf_arc.lock().await;
            if wf.status.is_terminal() {
                return;
            }
            if let Some(subtask) = wf.subtasks.get_mut(&task.subtask_id) {
                if !subtask.status.is_terminal() {
                    let _ = subtask.transition(SubtaskStatus::Failed);
                }
            }
            self.finalize_failure(
                &mut wf,
                FailureReason::CapacityExhausted {
                    subtask_id: task.subtask_id.clone(),
                },
            );
            return;
        }

        let delay = self.scheduler.selection_backoff(misses);
        debug!(task = %task, misses, delay_ms = delay.as_millis() as u64, "no agent available, backing off");
        self.requeue_later(
            task.clone(),
            plan.priority,
            plan.workflow_created_at,
            delay,
        );
    }

    async fn dispatch(
        &self,
        wf_arc: &Arc<Mutex<Workflow>>,
        task: TaskRef,
        plan: Box<DispatchPlan>,
        lease: TaskLease,
    ) {
        let agent_id = lease.agent_id().to_string();

        // Mark running under the lock; bail out if the workflow raced into
        // a terminal state.
        {
            let mut wf = wf_arc.lock().await;
            if wf.status != WorkflowStatus::Executing
                || !wf.subtasks.contains_key(&task.subtask_id)
            {
                drop(lease);
                return;
            }
            if !self.apply_subtask_transition(&mut wf, &task.subtask_id, SubtaskStatus::Assigned)
                || !self.apply_subtask_transition(&mut wf, &task.subtask_id, SubtaskStatus::Running)
            {
                drop(lease);
                return;
            }
            if let Some(subtask) = wf.subtasks.get_mut(&task.subtask_id) {
                subtask.assigned_agent = Some(agent_id.clone());
                subtask.started_at = Some(Utc::now());
            }
        }

        let correlation = Uuid::new_v4();
        let flight_token = self
            .wf_tokens
            .get(&task.workflow_id)
            .map(|t| t.child_token())
            .unwrap_or_else(|| self.shutdown.child_token());
        let agent_failed = Arc::new(AtomicBool::new(false));
        self.in_flight.insert(
            task.clone(),
            InFlight {
                agent_id: agent_id.clone(),
                cancel: flight_token.clone(),
                agent_failed: agent_failed.clone(),
            },
        );
        if let Some(mut count) = self.in_flight_per_wf.get_mut(&task.workflow_id) {
            *count += 1;
        }

        let assignment = Message::to(
            EXECUTOR_ID,
            &agent_id,
            MessageKind::TaskAssignment(TaskAssignment {
                workflow_id: task.workflow_id.clone(),
                subtask_id: task.subtask_id.clone(),
                title: plan.title.clone(),
                description: plan.description.clone(),
                input: plan.input.clone(),
                capabilities: plan.capabilities.clone(),
                quality_threshold: plan.quality_threshold,
                estimated_minutes: plan.estimated_minutes,
            }),
        )
        .with_priority(plan.priority.clamp(0, 8) as u8)
        .with_correlation(correlation);

        let timeout = Duration::from_secs_f64(
            plan.estimated_minutes.max(1) as f64 * 60.0 * self.scheduler.execution_timeout_factor,
        );
        debug!(task = %task, agent_id = %agent_id, timeout_s = timeout.as_secs(), "dispatching assignment");
        let outcome = self.bus.request(assignment, timeout, &flight_token).await;

        self.in_flight.remove(&task);
        if let Some(mut count) = self.in_flight_per_wf.get_mut(&task.workflow_id) {
            *count = count.saturating_sub(1);
        }

        match outcome {
            Ok(message) => match message.kind {
                MessageKind::TaskResult(result) => {
                    self.handle_result(wf_arc, &task, lease, result.outcome).await;
                }
                other => {
                    warn!(task = %task, kind = other.name(), "unexpected response kind");
                    lease.release(ReleaseOutcome::Failure);
                    self.handle_transient(
                        wf_arc,
                        &task,
                        None,
                        AttemptOutcome::TransientFailure {
                            reason: format!("unexpected response kind {}", other.name()),
                        },
                    )
                    .await;
                }
            },
            Err(RequestError::TimedOut) => {
                warn!(task = %task, agent_id = %agent_id, "execution timed out");
                self.send_cancel_to_agent(&agent_id, &task);
                lease.release(ReleaseOutcome::Failure);
                self.handle_transient(wf_arc, &task, Some(&agent_id), AttemptOutcome::TimedOut)
                    .await;
            }
            Err(RequestError::Cancelled) => {
                if agent_failed.load(Ordering::SeqCst) {
                    // The holding agent died; the manager already reclaimed
                    // its slots. Credit the budget and requeue.
                    drop(lease);
                    self.requeue_after_agent_failure(wf_arc, &task, &agent_id).await;
                } else {
                    self.send_cancel_to_agent(&agent_id, &task);
                    drop(lease);
                    self.mark_cancelled(wf_arc, &task).await;
                }
            }
            Err(RequestError::NotDelivered(status)) => {
                warn!(task = %task, agent_id = %agent_id, ?status, "assignment not delivered");
                drop(lease);
                let mut wf = wf_arc.lock().await;
                if wf.status == WorkflowStatus::Executing
                    && self.apply_subtask_transition(&mut wf, &task.subtask_id, SubtaskStatus::Ready)
                {
                    drop(wf);
                    self.requeue_later(
                        task.clone(),
                        plan.priority,
                        plan.workflow_created_at,
                        Duration::from_millis(200),
                    );
                }
            }
        }
    }

    async fn handle_result(
        &self,
        wf_arc: &Arc<Mutex<Workflow>>,
        task: &TaskRef,
        lease: TaskLease,
        outcome: SpecialistOutcome,
    ) {
        let agent_id = lease.agent_id().to_string();
        match outcome {
            SpecialistOutcome::Success {
                output,
                quality,
                cost,
                duration_ms,
            } => {
                let mut wf = wf_arc.lock().await;
                let threshold = wf
                    .subtasks
                    .get(&task.subtask_id)
                    .map(|st| st.quality_threshold)
                    .unwrap_or(0.0);

                if quality >= threshold {
                    if let Some(subtask) = wf.subtasks.get_mut(&task.subtask_id) {
                        subtask.record_attempt(AttemptRecord {
                            outcome: AttemptOutcome::Completed { quality },
                            agent_id: Some(agent_id.clone()),
                            at: Utc::now(),
                        });
                        subtask.result = Some(SubtaskResult {
                            output,
                            quality,
                            cost,
                            duration_ms,
                            agent_id: agent_id.clone(),
                        });
                    }
                    if !self.apply_subtask_transition(
                        &mut wf,
                        &task.subtask_id,
                        SubtaskStatus::Completed,
                    ) {
                        lease.release(ReleaseOutcome::Failure);
                        return;
                    }
                    lease.release(ReleaseOutcome::Success { quality });
                    info!(task = %task, quality, "subtask completed");
                    self.metrics.counter(
                        "subtasks_completed",
                        MetricLabels::component("executor")
                            .with_workflow(&task.workflow_id)
                            .with_agent(&agent_id),
                        1,
                    );

                    let newly_ready = wf.newly_ready(&task.subtask_id);
                    let created_at = wf.created_at;
                    for id in newly_ready {
                        if self.apply_subtask_transition(&mut wf, &id, SubtaskStatus::Ready) {
                            let priority = wf
                                .subtasks
                                .get(&id)
                                .map(|st| st.priority)
                                .unwrap_or(wf.priority);
                            self.ready.push(
                                TaskRef::new(task.workflow_id.clone(), id),
                                priority,
                                created_at,
                            );
                        }
                    }
                    self.check_completion(&mut wf);
                } else {
                    debug!(task = %task, quality, threshold, "quality gate failed");
                    if let Some(subtask) = wf.subtasks.get_mut(&task.subtask_id) {
                        subtask.record_attempt(AttemptRecord {
                            outcome: AttemptOutcome::QualityBelowThreshold {
                                quality,
                                required: threshold,
                            },
                            agent_id: Some(agent_id.clone()),
                            at: Utc::now(),
                        });
                    }
                    lease.release(ReleaseOutcome::Failure);
                    self.retry_or_escalate(
                        &mut wf,
                        task,
                        format!("quality {:.2} below threshold {:.2}", quality, threshold),
                    );
                }
            }
            SpecialistOutcome::Failure { error: reason, transient } => {
                lease.release(ReleaseOutcome::Failure);
                let mut wf = wf_arc.lock().await;
                if let Some(subtask) = wf.subtasks.get_mut(&task.subtask_id) {
                    let outcome = if transient {
                        AttemptOutcome::TransientFailure {
                            reason: reason.clone(),
                        }
                    } else {
                        AttemptOutcome::PermanentFailure {
                            reason: reason.clone(),
                        }
                    };
                    subtask.record_attempt(AttemptRecord {
                        outcome,
                        agent_id: Some(agent_id.clone()),
                        at: Utc::now(),
                    });
                }
                if transient {
                    self.retry_or_escalate(&mut wf, task, reason);
                } else {
                    // Permanent failures skip the retry budget entirely.
                    self.escalate(&mut wf, task, reason);
                }
            }
        }
    }

    async fn handle_transient(
        &self,
        wf_arc: &Arc<Mutex<Workflow>>,
        task: &TaskRef,
        agent_id: Option<&str>,
        outcome: AttemptOutcome,
    ) {
        let mut wf = wf_arc.lock().await;
        if wf.status.is_terminal() {
            return;
        }
        let reason = match &outcome {
            AttemptOutcome::TimedOut => "execution timed out".to_string(),
            AttemptOutcome::TransientFailure { reason } => reason.clone(),
            other => format!("{:?}", other),
        };
        if let Some(subtask) = wf.subtasks.get_mut(&task.subtask_id) {
            subtask.record_attempt(AttemptRecord {
                outcome,
                agent_id: agent_id.map(|a| a.to_string()),
                at: Utc::now(),
            });
        }
        self.retry_or_escalate(&mut wf, task, reason);
    }

    async fn requeue_after_agent_failure(
        &self,
        wf_arc: &Arc<Mutex<Workflow>>,
        task: &TaskRef,
        agent_id: &str,
    ) {
        let mut wf = wf_arc.lock().await;
        if wf.status.is_terminal() {
            if let Some(subtask) = wf.subtasks.get_mut(&task.subtask_id) {
                if !subtask.status.is_terminal() {
                    let _ = subtask.transition(SubtaskStatus::Cancelled);
                }
            }
            return;
        }
        info!(task = %task, agent_id, "agent failed mid-execution, requeueing with budget credit");
        self.metrics.counter(
            "agent_failure_requeues",
            MetricLabels::component("executor").with_workflow(&task.workflow_id),
            1,
        );
        let created_at = wf.created_at;
        let priority = {
            let Some(subtask) = wf.subtasks.get_mut(&task.subtask_id) else {
                return;
            };
            subtask.record_attempt(AttemptRecord {
                outcome: AttemptOutcome::AgentFailed,
                agent_id: Some(agent_id.to_string()),
                at: Utc::now(),
            });
            // Agent fault is not the subtask's fault.
            subtask.retry_budget += 1;
            subtask.assigned_agent = None;
            subtask.priority
        };
        if self.apply_subtask_transition(&mut wf, &task.subtask_id, SubtaskStatus::Ready) {
            self.ready.push(task.clone(), priority, created_at);
        }
    }

    async fn mark_cancelled(&self, wf_arc: &Arc<Mutex<Workflow>>, task: &TaskRef) {
        let mut wf = wf_arc.lock().await;
        if let Some(subtask) = wf.subtasks.get_mut(&task.subtask_id) {
            if !subtask.status.is_terminal() {
                let _ = subtask.transition(SubtaskStatus::Cancelled);
            }
        }
    }

    /// Spend one retry or escalate. Caller holds the workflow lock and has
    /// already recorded the attempt. Paused workflows still requeue: the
    /// entry just parks until resume reopens assignment.
    fn retry_or_escalate(&self, wf: &mut Workflow, task: &TaskRef, reason: String) {
        if wf.status.is_terminal() {
            if let Some(subtask) = wf.subtasks.get_mut(&task.subtask_id) {
                if !subtask.status.is_terminal() {
                    let _ = subtask.transition(SubtaskStatus::Cancelled);
                }
            }
            return;
        }
        let Some(subtask) = wf.subtasks.get_mut(&task.subtask_id) else {
            return;
        };
        if subtask.retry_budget > 0 {
            subtask.retry_budget -= 1;
            subtask.assigned_agent = None;
            let priority = subtask.priority;
            let created_at = wf.created_at;
            if self.apply_subtask_transition(wf, &task.subtask_id, SubtaskStatus::Ready) {
                debug!(task = %task, %reason, "retrying subtask");
                self.metrics.counter(
                    "subtask_retries",
                    MetricLabels::component("executor").with_workflow(&task.workflow_id),
                    1,
                );
                self.ready.push(task.clone(), priority, created_at);
            }
        } else {
            self.escalate(wf, task, reason);
        }
    }

    /// Retry budget exhausted (or permanent failure): decide whether the
    /// failure takes the workflow down with it.
    fn escalate(&self, wf: &mut Workflow, task: &TaskRef, reason: String) {
        let capabilities = wf
            .subtasks
            .get(&task.subtask_id)
            .map(|st| st.required_capabilities.clone())
            .unwrap_or_default();
        if let Some(subtask) = wf.subtasks.get_mut(&task.subtask_id) {
            if !subtask.status.is_terminal() {
                let _ = subtask.transition(SubtaskStatus::Failed);
            }
        }

        let impacting =
            wf.is_on_critical_path(&task.subtask_id) || !self.hierarchy.can_satisfy(&capabilities);
        warn!(task = %task, impacting, %reason, "subtask failed permanently");

        if impacting {
            self.finalize_failure(
                wf,
                FailureReason::CriticalSubtaskFailed {
                    subtask_id: task.subtask_id.clone(),
                    detail: reason,
                },
            );
        } else {
            // Descendants can never become ready; cancel them so the
            // workflow can still terminate on the surviving branches.
            self.cancel_descendants(wf, &task.subtask_id);
            self.bus.broadcast(
                Message::broadcast(
                    EXECUTOR_ID,
                    MessageKind::Escalation(Escalation {
                        workflow_id: Some(task.workflow_id.clone()),
                        subtask_id: Some(task.subtask_id.clone()),
                        reason,
                    }),
                )
                .with_priority(8),
                &BroadcastFilter::Tier(AgentTier::Executive),
            );
            self.metrics.counter(
                "subtask_escalations",
                MetricLabels::component("executor").with_workflow(&task.workflow_id),
                1,
            );
            self.check_completion(wf);
        }
    }

    fn cancel_descendants(&self, wf: &mut Workflow, failed_id: &str) {
        let mut queue: VecDeque<String> = VecDeque::from([failed_id.to_string()]);
        while let Some(current) = queue.pop_front() {
            for dependent in wf.dependents_of(&current) {
                if let Some(subtask) = wf.subtasks.get_mut(&dependent) {
                    if subtask.status == SubtaskStatus::Pending {
                        let _ = subtask.transition(SubtaskStatus::Cancelled);
                        queue.push_back(dependent);
                    }
                }
            }
        }
    }

    /// Terminal bookkeeping when every subtask has resolved.
    fn check_completion(&self, wf: &mut Workflow) {
        if wf.status != WorkflowStatus::Executing || !wf.all_terminal() {
            return;
        }
        let aggregate = wf.aggregate_quality();
        if aggregate >= wf.quality_target {
            if let Err(err) = wf.transition(WorkflowStatus::Completed) {
                error!(workflow_id = %wf.id, error = %err, "completion transition rejected");
                return;
            }
            info!(workflow_id = %wf.id, aggregate, "workflow completed");
            self.metrics.counter(
                "workflows_completed",
                MetricLabels::component("executor").with_workflow(&wf.id),
                1,
            );
        } else {
            wf.failure_reason = Some(FailureReason::QualityBelowTarget {
                aggregate,
                target: wf.quality_target,
            });
            if let Err(err) = wf.transition(WorkflowStatus::Failed) {
                error!(workflow_id = %wf.id, error = %err, "failure transition rejected");
                return;
            }
            warn!(workflow_id = %wf.id, aggregate, target = wf.quality_target, "workflow below quality target");
            self.metrics.counter(
                "workflows_failed",
                MetricLabels::component("executor").with_workflow(&wf.id),
                1,
            );
        }
        self.note_terminal(&wf.id);
    }

    /// Fail the workflow and stop everything still outstanding for it.
    fn finalize_failure(&self, wf: &mut Workflow, reason: FailureReason) {
        if wf.status.is_terminal() {
            return;
        }
        wf.failure_reason = Some(reason);
        for subtask in wf.subtasks.values_mut() {
            if matches!(subtask.status, SubtaskStatus::Pending | SubtaskStatus::Ready) {
                let _ = subtask.transition(SubtaskStatus::Cancelled);
            }
        }
        if let Err(err) = wf.transition(WorkflowStatus::Failed) {
            error!(workflow_id = %wf.id, error = %err, "failure transition rejected");
        }
        self.ready.remove_workflow(&wf.id);
        if let Some(token) = self.wf_tokens.get(&wf.id) {
            token.cancel();
        }
        self.note_terminal(&wf.id);
        self.metrics.counter(
            "workflows_failed",
            MetricLabels::component("executor").with_workflow(&wf.id),
            1,
        );
    }

    /// Apply a subtask transition; an illegal one is an internal invariant
    /// violation that fails the whole workflow.
    fn apply_subtask_transition(
        &self,
        wf: &mut Workflow,
        subtask_id: &str,
        to: SubtaskStatus,
    ) -> bool {
        let result = match wf.subtasks.get_mut(subtask_id) {
            Some(subtask) => subtask.transition(to),
            None => Err(OrchestrationError::InternalInvariant(format!(
                "unknown subtask '{}' in workflow '{}'",
                subtask_id, wf.id
            ))),
        };
        match result {
            Ok(()) => true,
            Err(err) => {
                error!(workflow_id = %wf.id, subtask_id, error = %err, "invariant violation");
                self.metrics.counter(
                    "invariant_violations",
                    MetricLabels::component("executor").with_workflow(&wf.id),
                    1,
                );
                self.finalize_failure(
                    wf,
                    FailureReason::InternalInvariant {
                        detail: err.to_string(),
                    },
                );
                false
            }
        }
    }

    fn send_cancel_to_agent(&self, agent_id: &str, task: &TaskRef) {
        let control = Message::to(
            EXECUTOR_ID,
            agent_id,
            MessageKind::Control(ControlCommand::Cancel {
                workflow_id: task.workflow_id.clone(),
                subtask_id: Some(task.subtask_id.clone()),
            }),
        )
        .with_priority(9);
        if let SendStatus::Dropped(reason) = self.bus.send(control) {
            debug!(agent_id, ?reason, "cancel control not deliverable");
        }
    }

    fn requeue_later(
        &self,
        task: TaskRef,
        priority: i32,
        workflow_created_at: DateTime<Utc>,
        delay: Duration,
    ) {
        let ready = Arc::clone(&self.ready);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    ready.push(task, priority, workflow_created_at);
                }
            }
        });
    }

    fn note_terminal(&self, workflow_id: &str) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.in_flight_per_wf.remove(workflow_id);
        self.starvation
            .retain(|task, _| task.workflow_id != workflow_id);
        self.metrics.gauge(
            "active_workflows",
            MetricLabels::component("executor"),
            self.active_count() as f64,
        );
    }

    fn workflow_arc(&self, workflow_id: &str) -> OrchestrationResult<Arc<Mutex<Workflow>>> {
        self.workflows
            .get(workflow_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| OrchestrationError::UnknownWorkflow(workflow_id.to_string()))
    }

    /// Periodic watch for expired workflow deadlines.
    async fn deadline_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_millis(500));
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let now = Utc::now();
            let mut expired = Vec::new();
            let arcs: Vec<Arc<Mutex<Workflow>>> = self
                .workflows
                .iter()
                .map(|entry| entry.value().clone())
                .collect();
            for wf_arc in arcs {
                let wf = wf_arc.lock().await;
                if matches!(wf.status, WorkflowStatus::Executing | WorkflowStatus::Paused) {
                    if let Some(deadline) = wf.deadline {
                        if deadline < now {
                            expired.push(wf.id.clone());
                        }
                    }
                }
            }
            for workflow_id in expired {
                warn!(workflow_id = %workflow_id, "workflow deadline expired");
                let _ = self
                    .cancel(&workflow_id, Some(FailureReason::DeadlineExceeded))
                    .await;
            }
        }
    }

    /// Consume hierarchy rebalance events: when an agent fails while
    /// holding subtasks, interrupt those executions so the workers requeue
    /// them with a budget credit.
    async fn event_pump(self: Arc<Self>, events: async_channel::Receiver<HierarchyEvent>) {
        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Ok(event) => event,
                    Err(_) => break,
                },
            };
            match event {
                HierarchyEvent::AgentFailed { agent_id, held } => {
                    info!(agent_id = %agent_id, held = held.len(), "rebalancing after agent failure");
                    for task in held {
                        if let Some(flight) = self.in_flight.get(&task) {
                            if flight.agent_id == agent_id {
                                flight.agent_failed.store(true, Ordering::SeqCst);
                                flight.cancel.cancel();
                            }
                        }
                    }
                }
                HierarchyEvent::AgentSpawned {
                    agent_id,
                    capability,
                } => {
                    debug!(agent_id = %agent_id, capability = %capability, "factory agent joined pool");
                }
            }
        }
    }
}
