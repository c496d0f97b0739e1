//! Planner seam: the injected capability that turns a brief into candidate
//! subtasks. Concrete planners (LLM-backed or otherwise) live outside the
//! core.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hierarchy::Capability;

/// Structured prompt handed to the planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanRequest {
    pub brief: String,
    pub max_subtasks: usize,
    pub known_capabilities: Vec<Capability>,
}

/// Candidate subtask as emitted by the planner. Dependencies reference
/// other drafts by title; the decomposer resolves them to stable ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DraftSubtask {
    pub title: String,
    pub description: String,
    pub capabilities: Vec<Capability>,
    pub estimated_minutes: u32,
    pub depends_on: Vec<String>,
}

impl DraftSubtask {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            capabilities: Vec::new(),
            estimated_minutes: 10,
            depends_on: Vec::new(),
        }
    }

    pub fn with_capability(mut self, capability: impl Into<Capability>) -> Self {
        self.capabilities.push(capability.into());
        self
    }

    pub fn with_estimated_minutes(mut self, minutes: u32) -> Self {
        self.estimated_minutes = minutes;
        self
    }

    pub fn depends_on_title(mut self, title: impl Into<String>) -> Self {
        self.depends_on.push(title.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanResponse {
    pub subtasks: Vec<DraftSubtask>,
}

#[derive(Debug, Clone, Error)]
pub enum PlannerError {
    #[error("planner transport failed: {0}")]
    Transport(String),

    #[error("planner returned malformed output: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, request: PlanRequest) -> Result<PlanResponse, PlannerError>;
}
