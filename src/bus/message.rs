//! Typed messages routed by the communication bus.
//!
//! The bus routes by envelope metadata only; payloads are opaque to it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::time::Duration;
use uuid::Uuid;

use crate::hierarchy::Capability;

pub type MessageId = Uuid;
pub type CorrelationId = Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recipient {
    Agent(String),
    Broadcast,
}

/// Routed envelope. FIFO holds per (sender, recipient) pair at equal
/// priority; higher priority may overtake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub sender: String,
    pub recipient: Recipient,
    pub kind: MessageKind,
    pub priority: u8,
    pub correlation_id: Option<CorrelationId>,
    pub created_at: DateTime<Utc>,
    pub ttl_ms: Option<u64>,
    pub receipt_requested: bool,
}

impl Message {
    pub fn to(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        kind: MessageKind,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender: sender.into(),
            recipient: Recipient::Agent(recipient.into()),
            kind,
            priority: 5,
            correlation_id: None,
            created_at: Utc::now(),
            ttl_ms: None,
            receipt_requested: false,
        }
    }

    pub fn broadcast(sender: impl Into<String>, kind: MessageKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender: sender.into(),
            recipient: Recipient::Broadcast,
            kind,
            priority: 5,
            correlation_id: None,
            created_at: Utc::now(),
            ttl_ms: None,
            receipt_requested: false,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_correlation(mut self, correlation: CorrelationId) -> Self {
        self.correlation_id = Some(correlation);
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl_ms = Some(ttl.as_millis() as u64);
        self
    }

    pub fn with_receipt(mut self) -> Self {
        self.receipt_requested = true;
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.ttl_ms {
            Some(ttl) => now - self.created_at > chrono::Duration::milliseconds(ttl as i64),
            None => false,
        }
    }

    /// Control and escalation traffic is admitted even into a full inbox.
    pub fn is_critical(&self) -> bool {
        matches!(
            self.kind,
            MessageKind::Control(_) | MessageKind::Escalation(_)
        )
    }

    /// Whether this message can complete a correlation rendezvous opened by
    /// `request`.
    pub fn is_correlated_response(&self) -> bool {
        self.correlation_id.is_some()
            && matches!(
                self.kind,
                MessageKind::TaskResult(_) | MessageKind::HelpResponse(_)
            )
    }
}

/// Tagged message payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    TaskAssignment(TaskAssignment),
    TaskResult(TaskResult),
    TaskStatusUpdate(TaskStatusUpdate),
    HelpRequest(HelpRequest),
    HelpResponse(HelpResponse),
    ContextShare(ContextShare),
    Escalation(Escalation),
    Heartbeat(HeartbeatPing),
    Broadcast(BroadcastNote),
    Control(ControlCommand),
}

impl MessageKind {
    pub fn name(&self) -> &'static str {
        match self {
            MessageKind::TaskAssignment(_) => "task_assignment",
            MessageKind::TaskResult(_) => "task_result",
            MessageKind::TaskStatusUpdate(_) => "task_status_update",
            MessageKind::HelpRequest(_) => "help_request",
            MessageKind::HelpResponse(_) => "help_response",
            MessageKind::ContextShare(_) => "context_share",
            MessageKind::Escalation(_) => "escalation",
            MessageKind::Heartbeat(_) => "heartbeat",
            MessageKind::Broadcast(_) => "broadcast",
            MessageKind::Control(_) => "control",
        }
    }
}

/// Work dispatched to a specialist agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub workflow_id: String,
    pub subtask_id: String,
    pub title: String,
    pub description: String,
    pub input: Value,
    pub capabilities: BTreeSet<Capability>,
    pub quality_threshold: f64,
    pub estimated_minutes: u32,
}

/// What a specialist reports back, correlated to its assignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub workflow_id: String,
    pub subtask_id: String,
    pub outcome: SpecialistOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecialistOutcome {
    Success {
        output: Value,
        quality: f64,
        cost: f64,
        duration_ms: u64,
    },
    Failure {
        error: String,
        transient: bool,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatusUpdate {
    pub workflow_id: String,
    pub subtask_id: String,
    pub progress: f32,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelpRequest {
    pub subtask_id: Option<String>,
    pub topic: String,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelpResponse {
    pub topic: String,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextShare {
    pub topic: String,
    pub payload: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Escalation {
    pub workflow_id: Option<String>,
    pub subtask_id: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatPing {
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastNote {
    pub topic: String,
    pub body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlCommand {
    Cancel {
        workflow_id: String,
        subtask_id: Option<String>,
    },
    Drain,
    Shutdown,
}
