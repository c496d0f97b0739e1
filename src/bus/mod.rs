//! Communication bus: typed message routing between agents and system
//! components, with priority delivery, per-pair FIFO, ttl handling, and
//! backpressure.
//!
//! Each recipient owns an independent inbox guarded by its own mutex; there
//! is no global bus lock. Inbox locks are never held across an await.

pub mod message;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::{BTreeSet, BinaryHeap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::BusConfig;
use crate::error::{OrchestrationError, OrchestrationResult};
use crate::hierarchy::{AgentTier, Capability};
use crate::reliability::{MetricLabels, MetricsSink};

pub use message::{
    BroadcastNote, ContextShare, ControlCommand, CorrelationId, Escalation, HeartbeatPing,
    HelpRequest, HelpResponse, Message, MessageId, MessageKind, Recipient, SpecialistOutcome,
    TaskAssignment, TaskResult, TaskStatusUpdate,
};

/// Synchronous outcome of `send`: the sender always learns what happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Delivered,
    Dropped(DropReason),
    Rejected(RejectReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    TtlExpired,
    UnknownRecipient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvError {
    TimedOut,
    Cancelled,
    UnknownRecipient,
}

#[derive(Debug)]
pub enum RequestError {
    TimedOut,
    Cancelled,
    NotDelivered(SendStatus),
}

/// Who a broadcast reaches.
#[derive(Debug, Clone)]
pub enum BroadcastFilter {
    All,
    Tier(AgentTier),
    Capability(Capability),
}

/// Partial-failure accounting for a broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastSummary {
    pub matched: usize,
    pub delivered: usize,
    pub rejected: usize,
    pub dropped: usize,
}

/// Out-of-band bus observations.
#[derive(Debug, Clone)]
pub enum BusEvent {
    /// An inbox crossed the high watermark.
    Backpressure {
        recipient: String,
        depth: usize,
        capacity: usize,
    },
    /// A receipt-requested message was never acked within its ttl.
    Undelivered {
        message_id: MessageId,
        recipient: String,
    },
}

/// Metadata registered with an inbox, used by broadcast filters.
#[derive(Debug, Clone, Default)]
pub struct RecipientProfile {
    pub tier: Option<AgentTier>,
    pub capabilities: BTreeSet<Capability>,
}

impl RecipientProfile {
    /// A system component (executor, hierarchy): no tier, no capabilities.
    pub fn component() -> Self {
        Self::default()
    }

    pub fn agent(tier: AgentTier, capabilities: BTreeSet<Capability>) -> Self {
        Self {
            tier: Some(tier),
            capabilities,
        }
    }
}

struct QueuedMessage {
    msg: Message,
    seq: u64,
}

impl QueuedMessage {
    fn rank(&self) -> (u8, DateTime<Utc>, u64) {
        (self.msg.priority, self.msg.created_at, self.seq)
    }
}

impl PartialEq for QueuedMessage {
    fn eq(&self, other: &Self) -> bool {
        self.rank() == other.rank()
    }
}

impl Eq for QueuedMessage {}

impl PartialOrd for QueuedMessage {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedMessage {
    // Max-heap order: higher priority first, then older created-at, then
    // arrival sequence. The sequence is what makes per-pair FIFO hold when
    // created-at timestamps collide.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.msg
            .priority
            .cmp(&other.msg.priority)
            .then_with(|| other.msg.created_at.cmp(&self.msg.created_at))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct InboxState {
    queue: BinaryHeap<QueuedMessage>,
    next_seq: u64,
    backpressure_flagged: bool,
}

struct Inbox {
    state: Mutex<InboxState>,
    notify: Notify,
    profile: RecipientProfile,
}

impl Inbox {
    fn new(profile: RecipientProfile) -> Self {
        Self {
            state: Mutex::new(InboxState {
                queue: BinaryHeap::new(),
                next_seq: 0,
                backpressure_flagged: false,
            }),
            notify: Notify::new(),
            profile,
        }
    }

    fn lock(&self) -> MutexGuard<'_, InboxState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct AckWait {
    recipient: String,
    deadline: DateTime<Utc>,
}

pub struct MessageBus {
    inboxes: DashMap<String, Arc<Inbox>>,
    pending: DashMap<CorrelationId, oneshot::Sender<Message>>,
    awaiting_ack: DashMap<MessageId, AckWait>,
    capacity: AtomicUsize,
    high_watermark: f64,
    critical_priority: u8,
    default_ack_ttl: Duration,
    events_tx: broadcast::Sender<BusEvent>,
    metrics: Arc<MetricsSink>,
}

impl MessageBus {
    pub fn new(config: &BusConfig, metrics: Arc<MetricsSink>) -> Self {
        let (events_tx, _) = broadcast::channel(256);
        Self {
            inboxes: DashMap::new(),
            pending: DashMap::new(),
            awaiting_ack: DashMap::new(),
            capacity: AtomicUsize::new(config.inbox_capacity),
            high_watermark: config.backpressure_high_watermark,
            critical_priority: config.critical_priority,
            default_ack_ttl: Duration::from_millis(config.default_ack_ttl_ms),
            events_tx,
            metrics,
        }
    }

    pub fn register(&self, recipient: impl Into<String>, profile: RecipientProfile) {
        self.inboxes
            .insert(recipient.into(), Arc::new(Inbox::new(profile)));
    }

    pub fn unregister(&self, recipient: &str) {
        self.inboxes.remove(recipient);
    }

    pub fn is_registered(&self, recipient: &str) -> bool {
        self.inboxes.contains_key(recipient)
    }

    pub fn depth(&self, recipient: &str) -> usize {
        self.inboxes
            .get(recipient)
            .map(|inbox| inbox.lock().queue.len())
            .unwrap_or(0)
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed)
    }

    pub fn inbox_count(&self) -> usize {
        self.inboxes.len()
    }

    /// Inbox capacity may be raised at runtime, never lowered.
    pub fn raise_capacity(&self, new_capacity: usize) -> OrchestrationResult<()> {
        let current = self.capacity.load(Ordering::Relaxed);
        if new_capacity < current {
            return Err(OrchestrationError::InvalidInput(format!(
                "inbox capacity can only be raised (current {}, requested {})",
                current, new_capacity
            )));
        }
        self.capacity.store(new_capacity, Ordering::Relaxed);
        Ok(())
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<BusEvent> {
        self.events_tx.subscribe()
    }

    /// Enqueue a message. Correlated responses rendezvous directly with a
    /// waiting `request` and bypass the inbox.
    pub fn send(&self, message: Message) -> SendStatus {
        let now = Utc::now();
        if message.is_expired(now) {
            self.count("messages_dropped", &message);
            return SendStatus::Dropped(DropReason::TtlExpired);
        }

        let mut message = message;
        if message.is_correlated_response() {
            if let Some(correlation) = message.correlation_id {
                if let Some((_, tx)) = self.pending.remove(&correlation) {
                    match tx.send(message) {
                        Ok(()) => {
                            self.metrics.counter(
                                "messages_delivered",
                                MetricLabels::component("bus"),
                                1,
                            );
                            return SendStatus::Delivered;
                        }
                        // Waiter timed out between lookup and send; fall
                        // back to normal inbox delivery.
                        Err(returned) => message = returned,
                    }
                }
            }
        }

        match message.recipient.clone() {
            Recipient::Agent(name) => self.deliver_to(&name, message),
            Recipient::Broadcast => {
                let summary = self.broadcast(message, &BroadcastFilter::All);
                if summary.delivered > 0 {
                    SendStatus::Delivered
                } else {
                    SendStatus::Rejected(RejectReason::Full)
                }
            }
        }
    }

    /// Await the next deliverable message for `recipient`, honoring
    /// priority order and per-pair FIFO. Cancellation consumes nothing.
    pub async fn recv(
        &self,
        recipient: &str,
        max_wait: Duration,
        cancel: &CancellationToken,
    ) -> Result<Message, RecvError> {
        let inbox = match self.inboxes.get(recipient) {
            Some(entry) => entry.value().clone(),
            None => return Err(RecvError::UnknownRecipient),
        };
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            if cancel.is_cancelled() {
                return Err(RecvError::Cancelled);
            }
            let notified = inbox.notify.notified();
            if let Some(msg) = self.pop_ready(&inbox) {
                return Ok(msg);
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(RecvError::Cancelled),
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => return Err(RecvError::TimedOut),
            }
        }
    }

    /// Deliver to every registered recipient matching the filter, except
    /// the sender itself. Partial failure is reported, not raised.
    pub fn broadcast(&self, message: Message, filter: &BroadcastFilter) -> BroadcastSummary {
        let mut summary = BroadcastSummary::default();
        let recipients: Vec<String> = self
            .inboxes
            .iter()
            .filter(|entry| entry.key().as_str() != message.sender)
            .filter(|entry| match filter {
                BroadcastFilter::All => true,
                BroadcastFilter::Tier(tier) => entry.value().profile.tier == Some(*tier),
                BroadcastFilter::Capability(capability) => {
                    entry.value().profile.capabilities.contains(capability)
                }
            })
            .map(|entry| entry.key().clone())
            .collect();

        for name in recipients {
            summary.matched += 1;
            let copy = Message {
                id: Uuid::new_v4(),
                recipient: Recipient::Agent(name.clone()),
                ..message.clone()
            };
            match self.deliver_to(&name, copy) {
                SendStatus::Delivered => summary.delivered += 1,
                SendStatus::Rejected(_) => summary.rejected += 1,
                SendStatus::Dropped(_) => summary.dropped += 1,
            }
        }
        summary
    }

    /// Send and await the correlated `TaskResult` or `HelpResponse`.
    pub async fn request(
        &self,
        mut message: Message,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Message, RequestError> {
        let correlation = message.correlation_id.unwrap_or_else(Uuid::new_v4);
        message.correlation_id = Some(correlation);

        let (tx, rx) = oneshot::channel();
        self.pending.insert(correlation, tx);

        let status = self.send(message);
        if status != SendStatus::Delivered {
            self.pending.remove(&correlation);
            return Err(RequestError::NotDelivered(status));
        }

        tokio::select! {
            response = rx => response.map_err(|_| RequestError::Cancelled),
            _ = tokio::time::sleep(timeout) => {
                self.pending.remove(&correlation);
                Err(RequestError::TimedOut)
            }
            _ = cancel.cancelled() => {
                self.pending.remove(&correlation);
                Err(RequestError::Cancelled)
            }
        }
    }

    /// Drop an open correlation rendezvous, e.g. after an execution
    /// timeout, so a late response falls through to normal delivery rules.
    pub fn cancel_correlation(&self, correlation: &CorrelationId) {
        self.pending.remove(correlation);
    }

    /// Acknowledge receipt of a message whose sender requested one.
    pub fn ack(&self, message_id: MessageId) -> bool {
        self.awaiting_ack.remove(&message_id).is_some()
    }

    /// Emit `Undelivered` events for receipt-requested messages whose ack
    /// deadline passed. Driven by the orchestrator's background loop.
    pub fn sweep_acks(&self) {
        let now = Utc::now();
        let expired: Vec<(MessageId, String)> = self
            .awaiting_ack
            .iter()
            .filter(|entry| entry.value().deadline < now)
            .map(|entry| (*entry.key(), entry.value().recipient.clone()))
            .collect();
        for (message_id, recipient) in expired {
            if self.awaiting_ack.remove(&message_id).is_some() {
                warn!(%message_id, recipient = %recipient, "receipt never acknowledged");
                self.metrics
                    .counter("acks_undelivered", MetricLabels::component("bus"), 1);
                let _ = self.events_tx.send(BusEvent::Undelivered {
                    message_id,
                    recipient,
                });
            }
        }
    }

    fn deliver_to(&self, recipient: &str, message: Message) -> SendStatus {
        let inbox = match self.inboxes.get(recipient) {
            Some(entry) => entry.value().clone(),
            None => {
                debug!(recipient, kind = message.kind.name(), "dropping message for unknown recipient");
                self.count("messages_dropped", &message);
                return SendStatus::Dropped(DropReason::UnknownRecipient);
            }
        };

        let capacity = self.capacity();
        let critical = message.is_critical() || message.priority >= self.critical_priority;
        let message_id = message.id;
        let created_at = message.created_at;
        let ttl = message
            .ttl_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_ack_ttl);
        let receipt_requested = message.receipt_requested;

        let (delivered, backpressure_depth) = {
            let mut state = inbox.lock();
            if state.queue.len() >= capacity && !critical {
                (false, None)
            } else {
                let seq = state.next_seq;
                state.next_seq += 1;
                state.queue.push(QueuedMessage { msg: message, seq });
                let depth = state.queue.len();
                let watermark = (capacity as f64 * self.high_watermark).ceil() as usize;
                if depth >= watermark && !state.backpressure_flagged {
                    state.backpressure_flagged = true;
                    (true, Some(depth))
                } else {
                    (true, None)
                }
            }
        };

        if !delivered {
            self.metrics
                .counter("messages_rejected", MetricLabels::component("bus"), 1);
            return SendStatus::Rejected(RejectReason::Full);
        }

        if receipt_requested {
            self.awaiting_ack.insert(
                message_id,
                AckWait {
                    recipient: recipient.to_string(),
                    deadline: created_at
                        + chrono::Duration::from_std(ttl)
                            .unwrap_or_else(|_| chrono::Duration::zero()),
                },
            );
        }
        if let Some(depth) = backpressure_depth {
            warn!(recipient, depth, capacity, "inbox backpressure");
            self.metrics
                .counter("bus_backpressure", MetricLabels::component("bus"), 1);
            let _ = self.events_tx.send(BusEvent::Backpressure {
                recipient: recipient.to_string(),
                depth,
                capacity,
            });
        }
        inbox.notify.notify_one();
        self.metrics
            .counter("messages_delivered", MetricLabels::component("bus"), 1);
        SendStatus::Delivered
    }

    fn pop_ready(&self, inbox: &Inbox) -> Option<Message> {
        let capacity = self.capacity();
        let watermark = (capacity as f64 * self.high_watermark).ceil() as usize;
        let now = Utc::now();
        let mut state = inbox.lock();
        while let Some(queued) = state.queue.pop() {
            if queued.msg.is_expired(now) {
                self.metrics
                    .counter("messages_expired", MetricLabels::component("bus"), 1);
                continue;
            }
            if state.queue.len() < watermark {
                state.backpressure_flagged = false;
            }
            return Some(queued.msg);
        }
        state.backpressure_flagged = false;
        None
    }

    fn count(&self, name: &str, _message: &Message) {
        self.metrics
            .counter(name, MetricLabels::component("bus"), 1);
    }
}
