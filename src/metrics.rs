//! Operator Metrics
//!
//! Prometheus counters for claim expansion and the daemon lifecycle.
//! `OperatorMetrics::default()` builds unregistered collectors, which is what
//! tests and standalone runs use; `register` exposes them on a registry.

use crate::error::Result;
use prometheus::{IntCounter, IntCounterVec, Opts, Registry};

#[derive(Debug, Clone)]
pub struct OperatorMetrics {
    /// Claims ensured, by device set and outcome (created / existing)
    pub claims_ensured: IntCounterVec,
    /// Errors appended during expansion, by device set
    pub expansion_errors: IntCounterVec,
    /// Drain steps, by step and outcome
    pub drain_steps: IntCounterVec,
    pub replicas_provisioned: IntCounter,
    pub replicas_removed: IntCounter,
    pub reconcile_passes: IntCounter,
}

impl Default for OperatorMetrics {
    fn default() -> Self {
        Self {
            claims_ensured: IntCounterVec::new(
                Opts::new(
                    "deviceset_claims_ensured_total",
                    "Volume claims ensured by the expander",
                ),
                &["device_set", "outcome"],
            )
            .expect("static metric options are valid"),
            expansion_errors: IntCounterVec::new(
                Opts::new(
                    "deviceset_expansion_errors_total",
                    "Errors recorded while expanding device sets",
                ),
                &["device_set"],
            )
            .expect("static metric options are valid"),
            drain_steps: IntCounterVec::new(
                Opts::new(
                    "deviceset_drain_steps_total",
                    "Drain chain steps by outcome",
                ),
                &["step", "outcome"],
            )
            .expect("static metric options are valid"),
            replicas_provisioned: IntCounter::new(
                "deviceset_replicas_provisioned_total",
                "Replicas whose daemon workload was created",
            )
            .expect("static metric options are valid"),
            replicas_removed: IntCounter::new(
                "deviceset_replicas_removed_total",
                "Replicas fully drained and removed",
            )
            .expect("static metric options are valid"),
            reconcile_passes: IntCounter::new(
                "deviceset_reconcile_passes_total",
                "Reconciliation passes run",
            )
            .expect("static metric options are valid"),
        }
    }
}

impl OperatorMetrics {
    /// Build the collectors and register them on `registry`
    pub fn register(registry: &Registry) -> Result<Self> {
        let metrics = Self::default();
        registry.register(Box::new(metrics.claims_ensured.clone()))?;
        registry.register(Box::new(metrics.expansion_errors.clone()))?;
        registry.register(Box::new(metrics.drain_steps.clone()))?;
        registry.register(Box::new(metrics.replicas_provisioned.clone()))?;
        registry.register(Box::new(metrics.replicas_removed.clone()))?;
        registry.register(Box::new(metrics.reconcile_passes.clone()))?;
        Ok(metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_exposes_counters() {
        let registry = Registry::new();
        let metrics = OperatorMetrics::register(&registry).unwrap();
        metrics
            .claims_ensured
            .with_label_values(&["set1", "created"])
            .inc();

        let names: Vec<_> = registry
            .gather()
            .iter()
            .map(|f| f.get_name().to_string())
            .collect();
        assert!(names.contains(&"deviceset_claims_ensured_total".to_string()));
    }

    #[test]
    fn test_double_registration_fails() {
        let registry = Registry::new();
        OperatorMetrics::register(&registry).unwrap();
        assert!(OperatorMetrics::register(&registry).is_err());
    }
}
