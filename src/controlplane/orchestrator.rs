//! Reconciliation Orchestrator
//!
//! Runs one reconciliation pass over a StorageCluster:
//! - expands every device set into volume claims
//! - drives each device set's replicas through their lifecycle
//! - reports device sets that still own claims but are no longer declared
//!
//! A failure in one device set never stops the others. Every failure of the
//! pass is collected in one [`ErrorSink`] and surfaced per device set.

use crate::config::OperatorConfig;
use crate::controlplane::backends::ClusterBackends;
use crate::crd::{ClusterPhase, StorageClusterSpec, StorageClusterStatus};
use crate::deviceset::expander::{DeviceSetExpander, VolumeSource};
use crate::deviceset::labels::{device_set_of, Selector, CLAIM_APP};
use crate::deviceset::sink::ErrorSink;
use crate::error::{with_timeout, Result};
use crate::lifecycle::{DeviceSetOutcome, LifecycleController, ProvisionScope};
use crate::metrics::OperatorMetrics;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

// =============================================================================
// Reconcile Report
// =============================================================================

/// Result of one reconciliation pass
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub namespace: String,
    pub volume_sources: Vec<VolumeSource>,
    pub device_sets: Vec<DeviceSetOutcome>,
    pub orphaned_device_sets: Vec<String>,
    /// Every message recorded during the pass
    pub errors: Vec<String>,
    pub finished_at: DateTime<Utc>,
}

impl ReconcileReport {
    pub fn succeeded(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn phase(&self) -> ClusterPhase {
        if !self.succeeded() {
            return ClusterPhase::Degraded;
        }
        let settled = self
            .device_sets
            .iter()
            .all(|d| d.ready as i64 == d.desired.max(0) as i64);
        if settled {
            ClusterPhase::Ready
        } else {
            ClusterPhase::Progressing
        }
    }

    /// When the next pass should run
    pub fn requeue_after(&self, config: &OperatorConfig) -> Duration {
        match self.phase() {
            ClusterPhase::Ready => config.requeue_interval,
            _ => config.retry_interval,
        }
    }

    pub fn status(&self, observed_generation: Option<i64>) -> StorageClusterStatus {
        StorageClusterStatus {
            phase: self.phase(),
            observed_generation,
            device_sets: self.device_sets.iter().map(DeviceSetOutcome::status).collect(),
            errors: self.errors.clone(),
            orphaned_device_sets: self.orphaned_device_sets.clone(),
            last_reconciled: Some(self.finished_at),
        }
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

pub struct Orchestrator {
    config: OperatorConfig,
    backends: ClusterBackends,
    expander: Arc<DeviceSetExpander>,
    lifecycle: LifecycleController,
    metrics: OperatorMetrics,
}

impl Orchestrator {
    pub fn new(
        config: OperatorConfig,
        backends: ClusterBackends,
        metrics: OperatorMetrics,
    ) -> Arc<Self> {
        let expander = Arc::new(DeviceSetExpander::new(
            backends.claims.clone(),
            config.clone(),
            metrics.clone(),
        ));
        let lifecycle = LifecycleController::new(
            expander.clone(),
            backends.claims.clone(),
            backends.workloads.clone(),
            backends.admin.clone(),
            config.clone(),
            metrics.clone(),
        );
        Arc::new(Self {
            config,
            backends,
            expander,
            lifecycle,
            metrics,
        })
    }

    pub fn config(&self) -> &OperatorConfig {
        &self.config
    }

    pub fn lifecycle(&self) -> &LifecycleController {
        &self.lifecycle
    }

    /// Run one pass. Only cancellation is returned as an error; everything
    /// else is in the report.
    pub async fn reconcile(
        &self,
        namespace: &str,
        spec: &StorageClusterSpec,
        cancel: &CancellationToken,
    ) -> Result<ReconcileReport> {
        self.metrics.reconcile_passes.inc();
        info!(
            "Reconciling {} device sets in {}",
            spec.storage.storage_class_device_sets.len(),
            namespace
        );

        let sink = ErrorSink::new();
        let volume_sources = self.expander.expand(&spec.storage, namespace, &sink).await;

        let mut device_sets = Vec::new();
        let mut declared = BTreeSet::new();
        for device_set in &spec.storage.storage_class_device_sets {
            if !declared.insert(device_set.name.clone()) {
                continue;
            }
            // A replica is provisioned once all of its own claims are in place.
            // Failed claims were recorded by the expansion.
            let expansion_errors = sink.messages_for(&device_set.name);
            let scope = if expansion_errors.is_empty() {
                ProvisionScope::All
            } else {
                ProvisionScope::complete_replicas(
                    volume_sources.iter().find(|s| s.name == device_set.name),
                    device_set.volume_claim_templates.len(),
                )
            };
            let mut outcome = self
                .lifecycle
                .reconcile_device_set(
                    namespace,
                    device_set,
                    &spec.daemon,
                    &scope,
                    &sink,
                    cancel,
                )
                .await?;
            let mut errors = expansion_errors;
            errors.append(&mut outcome.errors);
            outcome.errors = errors;
            device_sets.push(outcome);
        }

        let orphaned_device_sets = match self.orphaned_device_sets(namespace, &declared).await {
            Ok(orphaned) => orphaned,
            Err(e) => {
                sink.append(format!("detect orphaned device sets: {}", e));
                Vec::new()
            }
        };

        let report = ReconcileReport {
            namespace: namespace.to_string(),
            volume_sources,
            device_sets,
            orphaned_device_sets,
            errors: sink.into_messages(),
            finished_at: Utc::now(),
        };
        info!(
            "Reconciled {}: phase={} errors={}",
            namespace,
            report.phase(),
            report.errors.len()
        );
        Ok(report)
    }

    /// Device sets that own claims in `namespace` but are not declared.
    /// They are left untouched.
    async fn orphaned_device_sets(
        &self,
        namespace: &str,
        declared: &BTreeSet<String>,
    ) -> Result<Vec<String>> {
        let claims = with_timeout(
            "list claims",
            self.config.call_timeout,
            self.backends
                .claims
                .list_claims(namespace, &Selector::app(CLAIM_APP)),
        )
        .await?;
        let orphaned: BTreeSet<String> = claims
            .iter()
            .filter_map(|c| device_set_of(c.metadata.labels.as_ref()))
            .filter(|name| !declared.contains(*name))
            .map(str::to_string)
            .collect();
        for name in &orphaned {
            warn!(
                "Device set {} in {} still owns claims but is no longer declared",
                name, namespace
            );
        }
        Ok(orphaned.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::backends::{BackendFactory, InMemoryCluster};
    use crate::crd::{DeviceSetClaimTemplate, StorageClassDeviceSet, StorageScopeSpec};
    use crate::error::Error;
    use assert_matches::assert_matches;
    use k8s_openapi::api::core::v1::PersistentVolumeClaimSpec;

    fn device_set(name: &str, count: i32) -> StorageClassDeviceSet {
        StorageClassDeviceSet {
            name: name.into(),
            count,
            volume_claim_templates: vec![DeviceSetClaimTemplate {
                spec: PersistentVolumeClaimSpec {
                    storage_class_name: Some("local".into()),
                    ..Default::default()
                },
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn spec(sets: Vec<StorageClassDeviceSet>) -> StorageClusterSpec {
        StorageClusterSpec {
            storage: StorageScopeSpec {
                storage_class_device_sets: sets,
            },
            daemon: Default::default(),
        }
    }

    fn orchestrator(cluster: &Arc<InMemoryCluster>) -> Arc<Orchestrator> {
        Orchestrator::new(
            OperatorConfig::default(),
            BackendFactory::in_memory(cluster.clone()),
            OperatorMetrics::default(),
        )
    }

    #[tokio::test]
    async fn test_pass_progresses_then_settles() {
        let cluster = InMemoryCluster::with_storage_classes(["local"]);
        let orchestrator = orchestrator(&cluster);
        let spec = spec(vec![device_set("set1", 2)]);
        let cancel = CancellationToken::new();

        let first = orchestrator.reconcile("ns", &spec, &cancel).await.unwrap();
        assert!(first.succeeded());
        assert_eq!(first.volume_sources.len(), 1);
        assert_eq!(first.device_sets[0].provisioned, 2);
        assert_eq!(first.phase(), ClusterPhase::Progressing);
        assert_eq!(cluster.daemon_names("ns").len(), 2);

        cluster.mark_daemons_ready("ns");
        let second = orchestrator.reconcile("ns", &spec, &cancel).await.unwrap();
        assert_eq!(second.phase(), ClusterPhase::Ready);
        assert_eq!(cluster.claim_count("ns"), 2);

        let status = second.status(Some(4));
        assert_eq!(status.observed_generation, Some(4));
        assert_eq!(status.device_sets[0].ready, 2);
        assert!(status.device_sets[0].succeeded);
    }

    #[tokio::test]
    async fn test_failing_device_set_is_isolated() {
        let cluster = InMemoryCluster::with_storage_classes(["local"]);
        cluster.fail_claims_with_prefix("broken-data-", "quota exceeded");
        let orchestrator = orchestrator(&cluster);
        let spec = spec(vec![device_set("broken", 1), device_set("healthy", 1)]);

        let report = orchestrator
            .reconcile("ns", &spec, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.volume_sources.len(), 1);
        assert_eq!(report.phase(), ClusterPhase::Degraded);
        assert!(!report.device_sets[0].succeeded());
        assert!(report.device_sets[1].succeeded());
        assert_eq!(cluster.daemon_names("ns"), vec!["storage-daemon-healthy-0"]);
    }

    #[tokio::test]
    async fn test_partial_expansion_provisions_complete_replicas() {
        let cluster = InMemoryCluster::with_storage_classes(["local"]);
        cluster.fail_claims_with_prefix("set1-data-1-", "quota exceeded");
        let orchestrator = orchestrator(&cluster);
        let spec = spec(vec![device_set("set1", 2)]);
        let cancel = CancellationToken::new();

        for _ in 0..3 {
            let report = orchestrator.reconcile("ns", &spec, &cancel).await.unwrap();
            assert_eq!(report.errors.len(), 1, "{:?}", report.errors);
            assert!(report.errors[0].contains("set1-data-1-"));
            assert_eq!(report.device_sets[0].provisioned, 1);
            assert_eq!(report.device_sets[0].errors.len(), 1);
        }
        assert_eq!(cluster.claim_count("ns"), 1);
        assert_eq!(cluster.daemon_names("ns"), vec!["storage-daemon-set1-0"]);

        cluster.clear_claim_failures();
        let healed = orchestrator.reconcile("ns", &spec, &cancel).await.unwrap();
        assert!(healed.succeeded());
        assert_eq!(healed.device_sets[0].provisioned, 2);
        assert_eq!(cluster.daemon_names("ns").len(), 2);
    }

    #[tokio::test]
    async fn test_undeclared_device_set_is_reported_not_drained() {
        let cluster = InMemoryCluster::with_storage_classes(["local"]);
        let orchestrator = orchestrator(&cluster);
        let cancel = CancellationToken::new();
        orchestrator
            .reconcile("ns", &spec(vec![device_set("set1", 1), device_set("set2", 1)]), &cancel)
            .await
            .unwrap();

        let report = orchestrator
            .reconcile("ns", &spec(vec![device_set("set1", 1)]), &cancel)
            .await
            .unwrap();

        assert_eq!(report.orphaned_device_sets, vec!["set2"]);
        assert_eq!(cluster.claim_count("ns"), 2);
        assert_eq!(cluster.daemon_names("ns").len(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_pass_returns_error() {
        let cluster = InMemoryCluster::with_storage_classes(["local"]);
        let orchestrator = orchestrator(&cluster);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = orchestrator
            .reconcile("ns", &spec(vec![device_set("set1", 1)]), &cancel)
            .await
            .unwrap_err();
        assert_matches!(err, Error::Cancelled);
    }

    #[test]
    fn test_requeue_follows_phase() {
        let config = OperatorConfig::default();
        let report = ReconcileReport {
            namespace: "ns".into(),
            volume_sources: vec![],
            device_sets: vec![],
            orphaned_device_sets: vec![],
            errors: vec!["device set \"a\": validate: bad".into()],
            finished_at: Utc::now(),
        };
        assert_eq!(report.requeue_after(&config), config.retry_interval);

        let settled = ReconcileReport {
            errors: vec![],
            ..report
        };
        assert_eq!(settled.requeue_after(&config), config.requeue_interval);
    }
}
