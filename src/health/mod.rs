//! Health registry: named liveness/readiness probes aggregated by component.
//!
//! Probes are re-evaluated on every query and never cached. Health is
//! observational only; the executor and hierarchy manager consult it for
//! admission and rebalance decisions, nothing here alters control flow.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// One probe evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeReport {
    pub healthy: bool,
    pub ready: bool,
    pub detail: String,
}

impl ProbeReport {
    pub fn ok(detail: impl Into<String>) -> Self {
        Self {
            healthy: true,
            ready: true,
            detail: detail.into(),
        }
    }

    pub fn not_ready(detail: impl Into<String>) -> Self {
        Self {
            healthy: true,
            ready: false,
            detail: detail.into(),
        }
    }

    pub fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            healthy: false,
            ready: false,
            detail: detail.into(),
        }
    }
}

/// Aggregated view over all registered probes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub ready: bool,
    pub components: BTreeMap<String, ProbeReport>,
    pub evaluated_at: DateTime<Utc>,
}

type Probe = Arc<dyn Fn() -> ProbeReport + Send + Sync>;

#[derive(Default)]
pub struct HealthRegistry {
    probes: DashMap<String, Probe>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, component: impl Into<String>, probe: F)
    where
        F: Fn() -> ProbeReport + Send + Sync + 'static,
    {
        self.probes.insert(component.into(), Arc::new(probe));
    }

    pub fn unregister(&self, component: &str) {
        self.probes.remove(component);
    }

    /// Evaluate every probe. The system is healthy iff all components are
    /// healthy, ready iff all are ready.
    pub fn report(&self) -> HealthReport {
        let mut components = BTreeMap::new();
        for entry in self.probes.iter() {
            components.insert(entry.key().clone(), (entry.value())());
        }
        let healthy = components.values().all(|r| r.healthy);
        let ready = components.values().all(|r| r.ready);
        HealthReport {
            healthy,
            ready,
            components,
            evaluated_at: Utc::now(),
        }
    }

    pub fn healthy(&self) -> bool {
        self.probes.iter().all(|entry| (entry.value())().healthy)
    }

    pub fn ready(&self) -> bool {
        self.probes.iter().all(|entry| (entry.value())().ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn empty_registry_is_healthy() {
        let registry = HealthRegistry::new();
        assert!(registry.healthy());
        assert!(registry.ready());
    }

    #[test]
    fn one_unhealthy_probe_fails_aggregate() {
        let registry = HealthRegistry::new();
        registry.register("bus", || ProbeReport::ok("inboxes: 3"));
        registry.register("hierarchy", || ProbeReport::unhealthy("no agents"));
        let report = registry.report();
        assert!(!report.healthy);
        assert!(!report.ready);
        assert!(report.components["bus"].healthy);
    }

    #[test]
    fn probes_are_reevaluated_on_query() {
        let flag = Arc::new(AtomicBool::new(false));
        let registry = HealthRegistry::new();
        let probe_flag = flag.clone();
        registry.register("executor", move || {
            if probe_flag.load(Ordering::SeqCst) {
                ProbeReport::ok("running")
            } else {
                ProbeReport::not_ready("starting")
            }
        });
        assert!(!registry.ready());
        flag.store(true, Ordering::SeqCst);
        assert!(registry.ready());
    }

    #[test]
    fn unregister_removes_component() {
        let registry = HealthRegistry::new();
        registry.register("tmp", || ProbeReport::unhealthy("broken"));
        assert!(!registry.healthy());
        registry.unregister("tmp");
        assert!(registry.healthy());
    }
}
