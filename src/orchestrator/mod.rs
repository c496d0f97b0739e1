//! Process-wide orchestrator facade.
//!
//! Owns every subsystem with an explicit lifecycle: `new` wires components
//! and registers built-in health probes, `start` spawns the background
//! loops, `drain` closes admission and gives in-flight workflows a grace
//! period, `stop` tears everything down in reverse registration order.
//! Nothing is lazily initialized; tests construct fresh instances.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{MessageBus, MessageKind, RecipientProfile, RecvError};
use crate::config::OrchestratorConfig;
use crate::decomposer::{Planner, TaskDecomposer};
use crate::error::{OrchestrationError, OrchestrationResult};
use crate::executor::WorkflowExecutor;
use crate::health::{HealthRegistry, HealthReport, ProbeReport};
use crate::hierarchy::{
    AgentFactory, AgentId, AgentSpec, Capability, HierarchyManager, HierarchySnapshot,
};
use crate::reliability::{MetricsSink, MetricsSnapshot};
use crate::workflow::{FailureReason, Workflow, WorkflowId, WorkflowReport};

/// Inbox name the heartbeat pump listens on. Agents address heartbeat
/// messages here.
pub const HIERARCHY_ID: &str = "hierarchy";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Running,
    Draining,
    Stopped,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    metrics: Arc<MetricsSink>,
    health: Arc<HealthRegistry>,
    hierarchy: Arc<HierarchyManager>,
    bus: Arc<MessageBus>,
    decomposer: Arc<TaskDecomposer>,
    executor: Arc<WorkflowExecutor>,
    /// Decomposed workflows awaiting `execute`.
    planned: DashMap<WorkflowId, Workflow>,
    lifecycle: StdMutex<Lifecycle>,
    shutdown: CancellationToken,
    background: StdMutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Wire all subsystems and register built-in health probes. Nothing
    /// runs until [`Orchestrator::start`].
    pub fn new(
        config: OrchestratorConfig,
        planner: Arc<dyn Planner>,
    ) -> OrchestrationResult<Arc<Self>> {
        config.validate()?;

        let metrics = Arc::new(MetricsSink::default());
        let health = Arc::new(HealthRegistry::new());
        let hierarchy = Arc::new(HierarchyManager::new(
            config.hierarchy.clone(),
            config.circuit.clone(),
            metrics.clone(),
        ));
        let bus = Arc::new(MessageBus::new(&config.bus, metrics.clone()));
        let decomposer = Arc::new(TaskDecomposer::new(
            planner,
            hierarchy.clone(),
            &config,
            metrics.clone(),
        ));
        let executor = Arc::new(WorkflowExecutor::new(
            config.scheduler.clone(),
            hierarchy.clone(),
            bus.clone(),
            metrics.clone(),
        ));

        {
            let hierarchy = hierarchy.clone();
            health.register("hierarchy", move || {
                let agents = hierarchy.agent_count();
                if agents == 0 {
                    ProbeReport::not_ready("agent pool empty")
                } else {
                    ProbeReport::ok(format!("{} agents registered", agents))
                }
            });
        }
        {
            let bus = bus.clone();
            health.register("bus", move || {
                ProbeReport::ok(format!("{} inboxes", bus.inbox_count()))
            });
        }
        {
            let executor = executor.clone();
            health.register("executor", move || {
                if executor.admission_open() {
                    ProbeReport::ok(format!("{} active workflows", executor.active_count()))
                } else {
                    ProbeReport::not_ready("admission closed")
                }
            });
        }

        Ok(Arc::new(Self {
            config,
            metrics,
            health,
            hierarchy,
            bus,
            decomposer,
            executor,
            planned: DashMap::new(),
            lifecycle: StdMutex::new(Lifecycle::Created),
            shutdown: CancellationToken::new(),
            background: StdMutex::new(Vec::new()),
        }))
    }

    /// Spawn executor workers, the heartbeat reaper, the ack sweeper, and
    /// the heartbeat pump.
    pub fn start(&self) -> OrchestrationResult<()> {
        {
            let mut lifecycle = self.lock_lifecycle();
            if *lifecycle != Lifecycle::Created {
                return Err(OrchestrationError::InvalidInput(format!(
                    "orchestrator already started ({:?})",
                    *lifecycle
                )));
            }
            *lifecycle = Lifecycle::Running;
        }

        Arc::clone(&self.executor).start();
        self.bus.register(HIERARCHY_ID, RecipientProfile::component());

        let mut handles = self.lock_background();

        // Heartbeat reaper: mark agents with stale heartbeats as failed.
        {
            let hierarchy = self.hierarchy.clone();
            let shutdown = self.shutdown.clone();
            let interval =
                Duration::from_millis(self.config.hierarchy.heartbeat_interval_ms.max(1));
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = ticker.tick() => {}
                    }
                    let swept = hierarchy.sweep_stale(chrono::Utc::now());
                    if !swept.is_empty() {
                        warn!(count = swept.len(), "reaper failed stale agents");
                    }
                }
            }));
        }

        // Ack sweeper: surface receipt-requested messages that were never
        // acknowledged.
        {
            let bus = self.bus.clone();
            let shutdown = self.shutdown.clone();
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(1));
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = ticker.tick() => {}
                    }
                    bus.sweep_acks();
                }
            }));
        }

        // Heartbeat pump: agents report liveness over the bus.
        {
            let bus = self.bus.clone();
            let hierarchy = self.hierarchy.clone();
            let shutdown = self.shutdown.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    match bus
                        .recv(HIERARCHY_ID, Duration::from_secs(1), &shutdown)
                        .await
                    {
                        Ok(message) => {
                            if let MessageKind::Heartbeat(ping) = &message.kind {
                                if let Err(err) = hierarchy.heartbeat(&message.sender, ping.at) {
                                    debug!(sender = %message.sender, error = %err, "heartbeat from unknown agent");
                                }
                            }
                        }
                        Err(RecvError::TimedOut) => {}
                        Err(_) => break,
                    }
                }
            }));
        }

        info!("orchestrator started");
        Ok(())
    }

    /// Decompose a brief into a workflow. The workflow stays staged until
    /// `execute` admits it.
    pub async fn decompose(
        &self,
        brief: &str,
        priority: Option<i32>,
    ) -> OrchestrationResult<WorkflowId> {
        self.ensure_running()?;
        let workflow = self
            .decomposer
            .decompose(brief, priority, &self.shutdown)
            .await?;
        let workflow_id = workflow.id.clone();
        self.planned.insert(workflow_id.clone(), workflow);
        Ok(workflow_id)
    }

    /// Admit a previously decomposed workflow and start scheduling it.
    /// Execution ids are workflow ids.
    pub async fn execute(&self, workflow_id: &str) -> OrchestrationResult<WorkflowId> {
        self.ensure_running()?;
        let staged = self
            .planned
            .get(workflow_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| OrchestrationError::UnknownWorkflow(workflow_id.to_string()))?;
        let admitted = self.executor.admit(staged).await?;
        self.planned.remove(workflow_id);
        Ok(admitted)
    }

    /// Convenience: decompose then execute.
    pub async fn submit(
        &self,
        brief: &str,
        priority: Option<i32>,
    ) -> OrchestrationResult<WorkflowId> {
        let workflow_id = self.decompose(brief, priority).await?;
        self.execute(&workflow_id).await
    }

    pub async fn status(&self, execution_id: &str) -> OrchestrationResult<WorkflowReport> {
        if let Some(staged) = self.planned.get(execution_id) {
            return Ok(staged.value().report());
        }
        self.executor.status(execution_id).await
    }

    pub async fn pause(&self, execution_id: &str) -> OrchestrationResult<()> {
        self.executor.pause(execution_id).await
    }

    pub async fn resume(&self, execution_id: &str) -> OrchestrationResult<()> {
        self.executor.resume(execution_id).await
    }

    pub async fn cancel(&self, execution_id: &str) -> OrchestrationResult<()> {
        if self.planned.remove(execution_id).is_some() {
            return Ok(());
        }
        self.executor.cancel(execution_id, None).await
    }

    /// Register an agent with the hierarchy and give it a bus inbox.
    pub fn register_agent(&self, spec: AgentSpec) -> OrchestrationResult<AgentId> {
        let tier = spec.tier;
        let capabilities = spec.capabilities.clone();
        let agent_id = self.hierarchy.register(spec)?;
        self.bus
            .register(&agent_id, RecipientProfile::agent(tier, capabilities));
        Ok(agent_id)
    }

    /// Retire an agent. Its inbox stays registered so in-flight control
    /// traffic still routes; the record drains before it finalizes.
    pub fn retire_agent(&self, agent_id: &str) -> OrchestrationResult<()> {
        self.hierarchy.retire(agent_id)
    }

    pub fn register_factory(&self, capability: Capability, factory: Arc<dyn AgentFactory>) {
        self.hierarchy.register_factory(capability, factory);
    }

    pub fn hierarchy_status(&self) -> HierarchySnapshot {
        self.hierarchy.status()
    }

    pub fn health(&self) -> HealthReport {
        self.health.report()
    }

    pub fn healthy(&self) -> bool {
        self.health.healthy()
    }

    pub fn ready(&self) -> bool {
        *self.lock_lifecycle() == Lifecycle::Running && self.health.ready()
    }

    pub fn metrics_snapshot(&self, last_events: usize) -> MetricsSnapshot {
        self.metrics.snapshot(last_events)
    }

    /// The bus, for wiring external specialist loops.
    pub fn bus(&self) -> Arc<MessageBus> {
        self.bus.clone()
    }

    /// The hierarchy manager, for direct heartbeats and pool inspection.
    pub fn hierarchy(&self) -> Arc<HierarchyManager> {
        self.hierarchy.clone()
    }

    /// Close admission and give in-flight workflows the configured grace
    /// period, then cancel whatever remains.
    pub async fn drain(&self) {
        {
            let mut lifecycle = self.lock_lifecycle();
            if *lifecycle != Lifecycle::Running {
                return;
            }
            *lifecycle = Lifecycle::Draining;
        }
        info!("draining: admission closed");
        self.executor.close_admission();
        self.planned.clear();

        let grace = Duration::from_millis(self.config.drain.grace_ms);
        let started = Instant::now();
        while self.executor.active_count() > 0 && started.elapsed() < grace {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        if self.executor.active_count() > 0 {
            warn!(
                remaining = self.executor.active_count(),
                "grace period expired, cancelling in-flight workflows"
            );
            self.executor.cancel_all().await;
        }
    }

    /// Drain, then stop every background loop in reverse spawn order.
    pub async fn stop(&self) {
        self.drain().await;
        self.executor.stop().await;
        self.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.lock_background();
            guard.drain(..).collect()
        };
        for handle in handles.into_iter().rev() {
            let _ = handle.await;
        }
        *self.lock_lifecycle() = Lifecycle::Stopped;
        info!("orchestrator stopped");
    }

    fn ensure_running(&self) -> OrchestrationResult<()> {
        match *self.lock_lifecycle() {
            Lifecycle::Running => Ok(()),
            Lifecycle::Created => Err(OrchestrationError::InvalidInput(
                "orchestrator not started".into(),
            )),
            Lifecycle::Draining | Lifecycle::Stopped => Err(OrchestrationError::CapacityExhausted(
                "orchestrator draining, no new workflows admitted".into(),
            )),
        }
    }

    fn lock_lifecycle(&self) -> std::sync::MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_background(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.background.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Ensure cancellation of a workflow surfaces its reason through `status`.
impl Orchestrator {
    /// Cancel with an explicit reason, e.g. `DeadlineExceeded` from an
    /// enclosing policy layer.
    pub async fn cancel_with_reason(
        &self,
        execution_id: &str,
        reason: FailureReason,
    ) -> OrchestrationResult<()> {
        if self.planned.remove(execution_id).is_some() {
            return Ok(());
        }
        self.executor.cancel(execution_id, Some(reason)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decomposer::{DraftSubtask, PlanRequest, PlanResponse, PlannerError};
    use crate::hierarchy::AgentTier;
    use crate::workflow::WorkflowStatus;
    use async_trait::async_trait;

    struct OneTaskPlanner;

    #[async_trait]
    impl Planner for OneTaskPlanner {
        async fn plan(&self, _request: PlanRequest) -> Result<PlanResponse, PlannerError> {
            Ok(PlanResponse {
                subtasks: vec![DraftSubtask::new("Summarize", "Summarize the document")
                    .with_capability("content_writing")
                    .with_estimated_minutes(10)],
            })
        }
    }

    fn orchestrator() -> Arc<Orchestrator> {
        let mut config = OrchestratorConfig::default();
        // Keep shutdown fast even when a test leaves work in flight.
        config.drain.grace_ms = 100;
        Orchestrator::new(config, Arc::new(OneTaskPlanner)).unwrap()
    }

    #[tokio::test]
    async fn requires_start_before_use() {
        let orchestrator = orchestrator();
        assert!(matches!(
            orchestrator.decompose("brief", None).await,
            Err(OrchestrationError::InvalidInput(_))
        ));
        assert!(!orchestrator.ready());
    }

    #[tokio::test]
    async fn start_is_single_shot() {
        let orchestrator = orchestrator();
        orchestrator.start().unwrap();
        assert!(orchestrator.start().is_err());
        orchestrator.stop().await;
    }

    #[tokio::test]
    async fn register_agent_feeds_health_and_status() {
        let orchestrator = orchestrator();
        orchestrator.start().unwrap();
        assert!(!orchestrator.ready(), "empty pool is not ready");

        let agent_id = orchestrator
            .register_agent(
                AgentSpec::new("writer", AgentTier::Specialist)
                    .with_capability("content_writing"),
            )
            .unwrap();
        assert!(orchestrator.ready());
        let snapshot = orchestrator.hierarchy_status();
        assert_eq!(snapshot.total_agents, 1);
        assert!(orchestrator.bus().is_registered(&agent_id));
        orchestrator.stop().await;
    }

    #[tokio::test]
    async fn decompose_stages_workflow_until_execute() {
        let orchestrator = orchestrator();
        orchestrator.start().unwrap();
        orchestrator
            .register_agent(
                AgentSpec::new("writer", AgentTier::Specialist)
                    .with_capability("content_writing"),
            )
            .unwrap();

        let id = orchestrator.decompose("Summarize this", None).await.unwrap();
        let report = orchestrator.status(&id).await.unwrap();
        assert_eq!(report.status, WorkflowStatus::Planning);

        let execution_id = orchestrator.execute(&id).await.unwrap();
        assert_eq!(execution_id, id);
        let report = orchestrator.status(&id).await.unwrap();
        assert_ne!(report.status, WorkflowStatus::Planning);
        orchestrator.stop().await;
    }

    #[tokio::test]
    async fn execute_unknown_workflow_errors() {
        let orchestrator = orchestrator();
        orchestrator.start().unwrap();
        assert!(matches!(
            orchestrator.execute("wf-ghost").await,
            Err(OrchestrationError::UnknownWorkflow(_))
        ));
        orchestrator.stop().await;
    }

    #[tokio::test]
    async fn drain_closes_admission() {
        let orchestrator = orchestrator();
        orchestrator.start().unwrap();
        orchestrator.drain().await;
        assert!(matches!(
            orchestrator.decompose("brief", None).await,
            Err(OrchestrationError::CapacityExhausted(_))
        ));
        orchestrator.stop().await;
    }

    #[tokio::test]
    async fn metrics_snapshot_is_accessible() {
        let orchestrator = orchestrator();
        orchestrator.start().unwrap();
        let snapshot = orchestrator.metrics_snapshot(10);
        assert!(snapshot.events.len() <= 10);
        orchestrator.stop().await;
    }
}
