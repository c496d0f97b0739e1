//! In-memory metrics sink: sharded counters, gauges, and a bounded ring of
//! labeled events with oldest-first eviction.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;

const DEFAULT_EVENT_CAPACITY: usize = 10_000;

/// Label set attached to every sample.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetricLabels {
    pub component: Option<String>,
    pub workflow_id: Option<String>,
    pub agent_id: Option<String>,
    pub capability: Option<String>,
}

impl MetricLabels {
    pub fn component(name: impl Into<String>) -> Self {
        Self {
            component: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn with_workflow(mut self, id: impl Into<String>) -> Self {
        self.workflow_id = Some(id.into());
        self
    }

    pub fn with_agent(mut self, id: impl Into<String>) -> Self {
        self.agent_id = Some(id.into());
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capability = Some(capability.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
struct MetricKey {
    name: String,
    labels: MetricLabels,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Counter,
    Gauge,
}

/// A single appended sample, as kept in the event ring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricEvent {
    pub name: String,
    pub kind: MetricKind,
    pub value: f64,
    pub labels: MetricLabels,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CounterSample {
    pub name: String,
    pub labels: MetricLabels,
    pub value: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GaugeSample {
    pub name: String,
    pub labels: MetricLabels,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub counters: Vec<CounterSample>,
    pub gauges: Vec<GaugeSample>,
    pub events: Vec<MetricEvent>,
    pub taken_at: DateTime<Utc>,
}

/// Append-only from the core's point of view; snapshots are the only read
/// surface.
#[derive(Debug)]
pub struct MetricsSink {
    counters: DashMap<MetricKey, u64>,
    gauges: DashMap<MetricKey, f64>,
    events: Mutex<VecDeque<MetricEvent>>,
    event_capacity: usize,
}

impl MetricsSink {
    pub fn new(event_capacity: usize) -> Self {
        Self {
            counters: DashMap::new(),
            gauges: DashMap::new(),
            events: Mutex::new(VecDeque::with_capacity(event_capacity.min(1024))),
            event_capacity: event_capacity.max(1),
        }
    }

    pub fn counter(&self, name: &str, labels: MetricLabels, by: u64) {
        let key = MetricKey {
            name: name.to_string(),
            labels: labels.clone(),
        };
        *self.counters.entry(key).or_insert(0) += by;
        self.push_event(MetricEvent {
            name: name.to_string(),
            kind: MetricKind::Counter,
            value: by as f64,
            labels,
            at: Utc::now(),
        });
    }

    pub fn gauge(&self, name: &str, labels: MetricLabels, value: f64) {
        let key = MetricKey {
            name: name.to_string(),
            labels: labels.clone(),
        };
        self.gauges.insert(key, value);
        self.push_event(MetricEvent {
            name: name.to_string(),
            kind: MetricKind::Gauge,
            value,
            labels,
            at: Utc::now(),
        });
    }

    /// Current counter value, mainly for tests and probes.
    pub fn counter_value(&self, name: &str, labels: &MetricLabels) -> u64 {
        let key = MetricKey {
            name: name.to_string(),
            labels: labels.clone(),
        };
        self.counters.get(&key).map(|v| *v).unwrap_or(0)
    }

    pub fn snapshot(&self, last_events: usize) -> MetricsSnapshot {
        let mut counters: Vec<CounterSample> = self
            .counters
            .iter()
            .map(|entry| CounterSample {
                name: entry.key().name.clone(),
                labels: entry.key().labels.clone(),
                value: *entry.value(),
            })
            .collect();
        counters.sort_by(|a, b| a.name.cmp(&b.name));

        let mut gauges: Vec<GaugeSample> = self
            .gauges
            .iter()
            .map(|entry| GaugeSample {
                name: entry.key().name.clone(),
                labels: entry.key().labels.clone(),
                value: *entry.value(),
            })
            .collect();
        gauges.sort_by(|a, b| a.name.cmp(&b.name));

        let events = {
            let ring = self.lock_events();
            ring.iter()
                .rev()
                .take(last_events)
                .cloned()
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect()
        };

        MetricsSnapshot {
            counters,
            gauges,
            events,
            taken_at: Utc::now(),
        }
    }

    fn push_event(&self, event: MetricEvent) {
        let mut ring = self.lock_events();
        ring.push_back(event);
        while ring.len() > self.event_capacity {
            ring.pop_front();
        }
    }

    fn lock_events(&self) -> std::sync::MutexGuard<'_, VecDeque<MetricEvent>> {
        self.events.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MetricsSink {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_per_label_set() {
        let sink = MetricsSink::default();
        let a = MetricLabels::component("executor");
        let b = MetricLabels::component("bus");
        sink.counter("events_total", a.clone(), 2);
        sink.counter("events_total", a.clone(), 3);
        sink.counter("events_total", b.clone(), 1);
        assert_eq!(sink.counter_value("events_total", &a), 5);
        assert_eq!(sink.counter_value("events_total", &b), 1);
    }

    #[test]
    fn gauges_overwrite() {
        let sink = MetricsSink::default();
        let labels = MetricLabels::component("executor");
        sink.gauge("queue_depth", labels.clone(), 4.0);
        sink.gauge("queue_depth", labels.clone(), 2.0);
        let snapshot = sink.snapshot(10);
        assert_eq!(snapshot.gauges.len(), 1);
        assert_eq!(snapshot.gauges[0].value, 2.0);
    }

    #[test]
    fn event_ring_evicts_oldest() {
        let sink = MetricsSink::new(3);
        for i in 0..5 {
            sink.counter(&format!("m{}", i), MetricLabels::default(), 1);
        }
        let snapshot = sink.snapshot(10);
        assert_eq!(snapshot.events.len(), 3);
        assert_eq!(snapshot.events[0].name, "m2");
        assert_eq!(snapshot.events[2].name, "m4");
    }

    #[test]
    fn snapshot_limits_events() {
        let sink = MetricsSink::default();
        for _ in 0..10 {
            sink.counter("m", MetricLabels::default(), 1);
        }
        assert_eq!(sink.snapshot(4).events.len(), 4);
    }
}
