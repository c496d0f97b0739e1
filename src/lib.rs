//! taskhive - hierarchical multi-agent orchestration core
//!
//! A brief goes in, a dependency graph of subtasks comes out, each subtask
//! is matched against a capability-indexed agent pool, and the executor
//! drives the graph to completion under quality gates. Planners and
//! specialist workers are injected collaborators: the former behind the
//! [`decomposer::Planner`] trait, the latter over the [`bus::MessageBus`].

pub mod bus;
pub mod config;
pub mod decomposer;
pub mod error;
pub mod executor;
pub mod health;
pub mod hierarchy;
pub mod orchestrator;
pub mod reliability;
pub mod utils;
pub mod workflow;

#[cfg(test)]
mod tests;

pub use config::OrchestratorConfig;
pub use error::{OrchestrationError, OrchestrationResult};
pub use hierarchy::{AgentSpec, AgentTier, Capability};
pub use orchestrator::Orchestrator;
pub use workflow::{Workflow, WorkflowReport, WorkflowStatus};
