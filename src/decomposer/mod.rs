//! Task Decomposer: brief in, validated workflow graph out.
//!
//! The decomposer never calls an LLM itself. It drives the injected
//! [`Planner`] with a structured request, validates what comes back, and
//! re-plans (bounded) when the output is unusable. It never synthesizes a
//! plan on its own.

pub mod planner;

use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{DecomposerConfig, OrchestratorConfig, QualityConfig};
use crate::error::{OrchestrationError, OrchestrationResult};
use crate::hierarchy::{Capability, HierarchyManager};
use crate::reliability::{
    retry, CircuitBreaker, CircuitOutcome, MetricLabels, MetricsSink, RetryError, RetryPolicy,
};
use crate::workflow::{Subtask, Workflow, WorkflowStatus};

pub use planner::{DraftSubtask, PlanRequest, PlanResponse, Planner, PlannerError};

/// Brief complexity classes, each capping how many subtasks the planner may
/// emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Complexity {
    Simple,
    Standard,
    Complex,
    ResearchGrade,
}

impl Complexity {
    pub fn max_subtasks(&self) -> usize {
        match self {
            Complexity::Simple => 3,
            Complexity::Standard => 8,
            Complexity::Complex => 16,
            Complexity::ResearchGrade => 32,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Complexity::Simple => "simple",
            Complexity::Standard => "standard",
            Complexity::Complex => "complex",
            Complexity::ResearchGrade => "research_grade",
        }
    }
}

/// Failure of one planning attempt; all variants are retried up to the
/// attempt bound, but they surface differently once the bound is hit.
#[derive(Debug)]
enum PlanAttemptError {
    /// Planner unreachable, timed out, or circuit open.
    Transient(String),
    /// Planner responded but the plan is unusable.
    Invalid(String),
}

impl fmt::Display for PlanAttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanAttemptError::Transient(msg) | PlanAttemptError::Invalid(msg) => {
                f.write_str(msg)
            }
        }
    }
}

pub struct TaskDecomposer {
    planner: Arc<dyn Planner>,
    hierarchy: Arc<HierarchyManager>,
    config: DecomposerConfig,
    quality: QualityConfig,
    retry_policy: RetryPolicy,
    breaker: CircuitBreaker,
    metrics: Arc<MetricsSink>,
    multi_step_markers: Regex,
}

impl TaskDecomposer {
    pub fn new(
        planner: Arc<dyn Planner>,
        hierarchy: Arc<HierarchyManager>,
        config: &OrchestratorConfig,
        metrics: Arc<MetricsSink>,
    ) -> Self {
        let retry_policy = RetryPolicy {
            max_attempts: config.decomposer.max_plan_attempts.max(1),
            base_delay: Duration::from_millis(config.retry.base_delay_ms),
            multiplier: config.retry.multiplier,
            jitter: config.retry.jitter,
        };
        Self {
            planner,
            hierarchy,
            config: config.decomposer.clone(),
            quality: config.quality.clone(),
            retry_policy,
            breaker: CircuitBreaker::new("planner", &config.circuit),
            metrics,
            multi_step_markers: Regex::new(
                r"(?i)\b(then|after|next|finally|first|second|third|step|phase|stage|and then|followed by)\b",
            )
            .expect("hard-coded marker pattern compiles"),
        }
    }

    /// Run the full pipeline: normalize, classify, plan (bounded retries),
    /// validate, emit a workflow in state `planning`.
    pub async fn decompose(
        &self,
        brief: &str,
        priority: Option<i32>,
        cancel: &CancellationToken,
    ) -> OrchestrationResult<Workflow> {
        let normalized = self.normalize(brief)?;
        let complexity = self.analyze(&normalized);
        let priority = priority.unwrap_or(self.config.default_priority);
        let known = self.hierarchy.known_capabilities();
        info!(
            complexity = complexity.as_str(),
            brief_len = normalized.len(),
            known_capabilities = known.len(),
            "decomposing brief"
        );

        let request = PlanRequest {
            brief: normalized.clone(),
            max_subtasks: complexity.max_subtasks(),
            known_capabilities: known.iter().cloned().collect(),
        };

        let outcome = retry(
            &self.retry_policy,
            cancel,
            |_err: &PlanAttemptError| true,
            |attempt| {
                let request = request.clone();
                let known = known.clone();
                async move {
                    debug!(attempt, "requesting plan");
                    self.plan_once(request, &known, priority).await
                }
            },
        )
        .await;

        match outcome {
            Ok(workflow) => {
                self.metrics.counter(
                    "workflows_planned",
                    MetricLabels::component("decomposer").with_workflow(&workflow.id),
                    1,
                );
                Ok(workflow)
            }
            Err(RetryError::Cancelled) => Err(OrchestrationError::Cancelled),
            Err(RetryError::Permanent(err)) => Err(self.planning_failed(1, err)),
            Err(RetryError::Exhausted { attempts, last }) => {
                Err(self.planning_failed(attempts, last))
            }
        }
    }

    /// Heuristic complexity classification from brief length and multi-step
    /// markers.
    pub fn analyze(&self, brief: &str) -> Complexity {
        let words = brief.split_whitespace().count();
        let markers = self.multi_step_markers.find_iter(brief).count();
        let score = words as f64 / 40.0 + markers as f64 * 1.5;
        match score {
            s if s < 1.5 => Complexity::Simple,
            s if s < 4.0 => Complexity::Standard,
            s if s < 8.0 => Complexity::Complex,
            _ => Complexity::ResearchGrade,
        }
    }

    fn normalize(&self, brief: &str) -> OrchestrationResult<String> {
        let trimmed = brief.trim();
        if trimmed.is_empty() {
            return Err(OrchestrationError::InvalidInput("brief is empty".into()));
        }
        if trimmed.len() > self.config.max_brief_len {
            return Err(OrchestrationError::InvalidInput(format!(
                "brief length {} exceeds cap {}",
                trimmed.len(),
                self.config.max_brief_len
            )));
        }
        Ok(trimmed.to_string())
    }

    async fn plan_once(
        &self,
        request: PlanRequest,
        known: &BTreeSet<Capability>,
        priority: i32,
    ) -> Result<Workflow, PlanAttemptError> {
        if self.breaker.try_acquire() == CircuitOutcome::OpenCircuit {
            return Err(PlanAttemptError::Transient("planner circuit open".into()));
        }

        let timeout = Duration::from_millis(self.config.planner_timeout_ms);
        let brief = request.brief.clone();
        let max_subtasks = request.max_subtasks;
        let response = match tokio::time::timeout(timeout, self.planner.plan(request)).await {
            Err(_) => {
                self.breaker.on_failure();
                return Err(PlanAttemptError::Transient(format!(
                    "planner timed out after {}ms",
                    timeout.as_millis()
                )));
            }
            Ok(Err(PlannerError::Transport(msg))) => {
                self.breaker.on_failure();
                return Err(PlanAttemptError::Transient(format!(
                    "planner transport failed: {}",
                    msg
                )));
            }
            Ok(Err(PlannerError::Malformed(msg))) => {
                // The dependency is reachable; only the payload is bad.
                self.breaker.on_success();
                self.count_rejected();
                return Err(PlanAttemptError::Invalid(format!(
                    "planner output malformed: {}",
                    msg
                )));
            }
            Ok(Ok(response)) => {
                self.breaker.on_success();
                response
            }
        };

        match self.build_workflow(&brief, max_subtasks, priority, known, response.subtasks) {
            Ok(workflow) => Ok(workflow),
            Err(reason) => {
                warn!(%reason, "rejecting plan");
                self.count_rejected();
                Err(PlanAttemptError::Invalid(reason))
            }
        }
    }

    fn build_workflow(
        &self,
        brief: &str,
        max_subtasks: usize,
        priority: i32,
        known: &BTreeSet<Capability>,
        drafts: Vec<DraftSubtask>,
    ) -> Result<Workflow, String> {
        if drafts.is_empty() {
            return Err("planner returned no subtasks".into());
        }
        if drafts.len() > max_subtasks {
            return Err(format!(
                "planner emitted {} subtasks, cap is {}",
                drafts.len(),
                max_subtasks
            ));
        }

        // Dedup by normalized title, first occurrence wins.
        let mut seen = BTreeSet::new();
        let mut deduped = Vec::with_capacity(drafts.len());
        for draft in drafts {
            if seen.insert(title_key(&draft.title)) {
                deduped.push(draft);
            }
        }

        let drafts = self.split_oversized(deduped);

        let mut ids_by_title: BTreeMap<String, String> = BTreeMap::new();
        for (idx, draft) in drafts.iter().enumerate() {
            ids_by_title.insert(title_key(&draft.title), format!("st-{:02}", idx + 1));
        }

        let mut workflow = Workflow::new(format!("wf-{}", Uuid::new_v4()), brief)
            .with_priority(priority)
            .with_quality_target(self.quality.workflow_target);

        for draft in &drafts {
            if draft.capabilities.is_empty() {
                return Err(format!("subtask '{}' declares no capabilities", draft.title));
            }
            for capability in &draft.capabilities {
                if !known.contains(capability) {
                    return Err(format!(
                        "subtask '{}' requires unknown capability '{}'",
                        draft.title, capability
                    ));
                }
            }

            let id = ids_by_title[&title_key(&draft.title)].clone();
            let mut subtask = Subtask::new(id, draft.title.clone(), draft.description.clone())
                .with_estimated_minutes(draft.estimated_minutes.max(1))
                .with_priority(priority)
                .with_quality_threshold(self.quality.default_threshold)
                .with_retry_budget(self.config.default_retry_budget);
            for capability in &draft.capabilities {
                subtask = subtask.with_capability(capability.clone());
            }
            for dep_title in &draft.depends_on {
                let dep_id = ids_by_title.get(&title_key(dep_title)).ok_or_else(|| {
                    format!(
                        "subtask '{}' depends on unknown subtask '{}'",
                        draft.title, dep_title
                    )
                })?;
                subtask = subtask.with_dependency(dep_id.clone());
            }
            workflow.insert_subtask(subtask);
        }

        workflow.validate().map_err(|err| err.to_string())?;
        workflow.estimated_total_minutes = workflow.critical_path_minutes();
        workflow
            .transition(WorkflowStatus::Planning)
            .map_err(|err| err.to_string())?;
        Ok(workflow)
    }

    /// Halve any draft over the duration cap, chaining the halves, down to
    /// the bounded split depth. Dependents of the original follow its tail.
    fn split_oversized(&self, drafts: Vec<DraftSubtask>) -> Vec<DraftSubtask> {
        let cap = self.config.max_subtask_minutes;
        let mut out = Vec::with_capacity(drafts.len());
        let mut renames: BTreeMap<String, String> = BTreeMap::new();

        for draft in drafts {
            if draft.estimated_minutes <= cap {
                out.push(draft);
                continue;
            }
            let original = title_key(&draft.title);
            let tail = self.split_draft(draft, 0, &mut out);
            renames.insert(original, tail);
        }

        if !renames.is_empty() {
            for draft in &mut out {
                for dep in &mut draft.depends_on {
                    if let Some(tail) = renames.get(&title_key(dep)) {
                        *dep = tail.clone();
                    }
                }
            }
        }
        out
    }

    fn split_draft(&self, draft: DraftSubtask, depth: u32, out: &mut Vec<DraftSubtask>) -> String {
        if draft.estimated_minutes <= self.config.max_subtask_minutes
            || depth >= self.config.max_split_depth
        {
            let title = draft.title.clone();
            out.push(draft);
            return title;
        }

        let first_half = draft.estimated_minutes.div_ceil(2);
        let first = DraftSubtask {
            title: format!("{} (part 1)", draft.title),
            description: draft.description.clone(),
            capabilities: draft.capabilities.clone(),
            estimated_minutes: first_half,
            depends_on: draft.depends_on.clone(),
        };
        let first_tail = self.split_draft(first, depth + 1, out);
        let second = DraftSubtask {
            title: format!("{} (part 2)", draft.title),
            description: draft.description,
            capabilities: draft.capabilities,
            estimated_minutes: draft.estimated_minutes - first_half,
            depends_on: vec![first_tail],
        };
        self.split_draft(second, depth + 1, out)
    }

    fn planning_failed(&self, attempts: u32, err: PlanAttemptError) -> OrchestrationError {
        self.metrics.counter(
            "planning_failed",
            MetricLabels::component("decomposer"),
            1,
        );
        match err {
            PlanAttemptError::Transient(msg) => OrchestrationError::TransientExternal(format!(
                "planning failed after {} attempts: {}",
                attempts, msg
            )),
            PlanAttemptError::Invalid(msg) => OrchestrationError::InvalidPlan(format!(
                "planning failed after {} attempts: {}",
                attempts, msg
            )),
        }
    }

    fn count_rejected(&self) {
        self.metrics
            .counter("plans_rejected", MetricLabels::component("decomposer"), 1);
    }
}

fn title_key(title: &str) -> String {
    title.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CircuitConfig, HierarchyConfig};
    use crate::hierarchy::{AgentSpec, AgentTier};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use tokio::sync::Mutex;

    struct ScriptedPlanner {
        responses: Mutex<VecDeque<Result<PlanResponse, PlannerError>>>,
    }

    impl ScriptedPlanner {
        fn new(responses: Vec<Result<PlanResponse, PlannerError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
            })
        }
    }

    #[async_trait]
    impl Planner for ScriptedPlanner {
        async fn plan(&self, _request: PlanRequest) -> Result<PlanResponse, PlannerError> {
            self.responses
                .lock()
                .await
                .pop_front()
                .unwrap_or_else(|| Err(PlannerError::Transport("script exhausted".into())))
        }
    }

    fn hierarchy_with(capabilities: &[&str]) -> Arc<HierarchyManager> {
        let manager = Arc::new(HierarchyManager::new(
            HierarchyConfig::default(),
            CircuitConfig::default(),
            Arc::new(MetricsSink::default()),
        ));
        manager
            .register(
                AgentSpec::new("worker", AgentTier::Specialist)
                    .with_capabilities(capabilities.to_vec()),
            )
            .unwrap();
        manager
    }

    fn fast_config() -> OrchestratorConfig {
        let mut config = OrchestratorConfig::default();
        config.retry.base_delay_ms = 1;
        config.retry.jitter = false;
        config
    }

    fn decomposer(
        planner: Arc<dyn Planner>,
        hierarchy: Arc<HierarchyManager>,
    ) -> TaskDecomposer {
        TaskDecomposer::new(
            planner,
            hierarchy,
            &fast_config(),
            Arc::new(MetricsSink::default()),
        )
    }

    fn linear_plan() -> PlanResponse {
        PlanResponse {
            subtasks: vec![
                DraftSubtask::new("Research", "Collect sources")
                    .with_capability("academic_research")
                    .with_estimated_minutes(30),
                DraftSubtask::new("Write", "Write the summary")
                    .with_capability("content_writing")
                    .with_estimated_minutes(20)
                    .depends_on_title("Research"),
            ],
        }
    }

    #[tokio::test]
    async fn emits_workflow_in_planning_state() {
        let planner = ScriptedPlanner::new(vec![Ok(linear_plan())]);
        let hierarchy = hierarchy_with(&["academic_research", "content_writing"]);
        let decomposer = decomposer(planner, hierarchy);
        let cancel = CancellationToken::new();

        let workflow = decomposer
            .decompose("Summarize the literature, then write it up", None, &cancel)
            .await
            .unwrap();
        assert_eq!(workflow.status, WorkflowStatus::Planning);
        assert_eq!(workflow.subtasks.len(), 2);
        assert_eq!(workflow.priority, 5);
        assert_eq!(workflow.estimated_total_minutes, 50);

        let write = &workflow.subtasks["st-02"];
        assert!(write.depends_on.contains("st-01"));
    }

    #[tokio::test]
    async fn retries_malformed_output_then_succeeds() {
        let planner = ScriptedPlanner::new(vec![
            Err(PlannerError::Malformed("not json".into())),
            Ok(linear_plan()),
        ]);
        let hierarchy = hierarchy_with(&["academic_research", "content_writing"]);
        let decomposer = decomposer(planner, hierarchy);
        let cancel = CancellationToken::new();

        let workflow = decomposer.decompose("A brief", None, &cancel).await.unwrap();
        assert_eq!(workflow.subtasks.len(), 2);
    }

    #[tokio::test]
    async fn unknown_capability_fails_after_bound() {
        let bad = || PlanResponse {
            subtasks: vec![DraftSubtask::new("Weld", "Weld the hull")
                .with_capability("underwater_welding")
                .with_estimated_minutes(10)],
        };
        let planner = ScriptedPlanner::new(vec![Ok(bad()), Ok(bad()), Ok(bad())]);
        let hierarchy = hierarchy_with(&["content_writing"]);
        let decomposer = decomposer(planner, hierarchy);
        let cancel = CancellationToken::new();

        let err = decomposer
            .decompose("A brief", None, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::InvalidPlan(_)));
    }

    #[tokio::test]
    async fn cyclic_plan_is_rejected() {
        let cyclic = || PlanResponse {
            subtasks: vec![
                DraftSubtask::new("A", "first")
                    .with_capability("content_writing")
                    .depends_on_title("B"),
                DraftSubtask::new("B", "second")
                    .with_capability("content_writing")
                    .depends_on_title("A"),
            ],
        };
        let planner = ScriptedPlanner::new(vec![Ok(cyclic()), Ok(cyclic()), Ok(cyclic())]);
        let hierarchy = hierarchy_with(&["content_writing"]);
        let decomposer = decomposer(planner, hierarchy);
        let cancel = CancellationToken::new();

        let err = decomposer
            .decompose("A brief", None, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::InvalidPlan(_)));
    }

    #[tokio::test]
    async fn orphan_dependency_is_rejected() {
        let orphan = || PlanResponse {
            subtasks: vec![DraftSubtask::new("A", "first")
                .with_capability("content_writing")
                .depends_on_title("Ghost")],
        };
        let planner = ScriptedPlanner::new(vec![Ok(orphan()), Ok(orphan()), Ok(orphan())]);
        let hierarchy = hierarchy_with(&["content_writing"]);
        let decomposer = decomposer(planner, hierarchy);
        let cancel = CancellationToken::new();

        let err = decomposer
            .decompose("A brief", None, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::InvalidPlan(_)));
    }

    #[tokio::test]
    async fn transport_failures_surface_as_transient() {
        let planner = ScriptedPlanner::new(vec![
            Err(PlannerError::Transport("down".into())),
            Err(PlannerError::Transport("down".into())),
            Err(PlannerError::Transport("down".into())),
        ]);
        let hierarchy = hierarchy_with(&["content_writing"]);
        let decomposer = decomposer(planner, hierarchy);
        let cancel = CancellationToken::new();

        let err = decomposer
            .decompose("A brief", None, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::TransientExternal(_)));
    }

    #[tokio::test]
    async fn oversized_subtasks_are_split_into_dependent_parts() {
        let plan = PlanResponse {
            subtasks: vec![
                DraftSubtask::new("Deep dive", "Read everything")
                    .with_capability("academic_research")
                    .with_estimated_minutes(500),
                DraftSubtask::new("Report", "Write the report")
                    .with_capability("content_writing")
                    .with_estimated_minutes(30)
                    .depends_on_title("Deep dive"),
            ],
        };
        let planner = ScriptedPlanner::new(vec![Ok(plan)]);
        let hierarchy = hierarchy_with(&["academic_research", "content_writing"]);
        let decomposer = decomposer(planner, hierarchy);
        let cancel = CancellationToken::new();

        let workflow = decomposer.decompose("A brief", None, &cancel).await.unwrap();
        // 500 halves into 250, then into 125s: four research parts + report.
        assert_eq!(workflow.subtasks.len(), 5);
        assert!(workflow
            .subtasks
            .values()
            .all(|st| st.estimated_minutes <= 240));
        // The report depends on exactly one research part (the tail).
        let report = workflow
            .subtasks
            .values()
            .find(|st| st.title == "Report")
            .unwrap();
        assert_eq!(report.depends_on.len(), 1);
        assert_eq!(workflow.validate().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn empty_and_oversize_briefs_are_invalid_input() {
        let planner = ScriptedPlanner::new(vec![]);
        let hierarchy = hierarchy_with(&["content_writing"]);
        let decomposer = decomposer(planner, hierarchy);
        let cancel = CancellationToken::new();

        assert!(matches!(
            decomposer.decompose("   ", None, &cancel).await,
            Err(OrchestrationError::InvalidInput(_))
        ));
        let huge = "x".repeat(20_000);
        assert!(matches!(
            decomposer.decompose(&huge, None, &cancel).await,
            Err(OrchestrationError::InvalidInput(_))
        ));
    }

    #[test]
    fn complexity_scales_with_markers_and_length() {
        let planner = ScriptedPlanner::new(vec![]);
        let hierarchy = hierarchy_with(&["content_writing"]);
        let decomposer = decomposer(planner, hierarchy);

        assert_eq!(decomposer.analyze("Summarize this"), Complexity::Simple);
        assert!(
            decomposer.analyze(
                "First gather the data, then clean it, then analyze trends, and finally write a report"
            ) >= Complexity::Complex
        );
        let long_brief = "analyze market conditions across regions ".repeat(80);
        assert_eq!(
            decomposer.analyze(&long_brief),
            Complexity::ResearchGrade
        );
    }

    #[tokio::test]
    async fn duplicate_titles_are_deduplicated() {
        let plan = PlanResponse {
            subtasks: vec![
                DraftSubtask::new("Write", "first copy")
                    .with_capability("content_writing")
                    .with_estimated_minutes(10),
                DraftSubtask::new("write ", "second copy")
                    .with_capability("content_writing")
                    .with_estimated_minutes(10),
            ],
        };
        let planner = ScriptedPlanner::new(vec![Ok(plan)]);
        let hierarchy = hierarchy_with(&["content_writing"]);
        let decomposer = decomposer(planner, hierarchy);
        let cancel = CancellationToken::new();

        let workflow = decomposer.decompose("A brief", None, &cancel).await.unwrap();
        assert_eq!(workflow.subtasks.len(), 1);
        assert_eq!(workflow.subtasks["st-01"].description, "first copy");
    }
}
