//! Daemon Lifecycle Controller
//!
//! Drives every replica of a device set toward its desired state. Excess
//! replicas are drained highest index first, one at a time; missing replicas
//! in `[0, count)` are then provisioned.

use crate::config::OperatorConfig;
use crate::crd::{DaemonSpec, DeviceSetStatus, StorageClassDeviceSet};
use crate::deviceset::claim::validate_device_set;
use crate::deviceset::expander::{DeviceSetExpander, VolumeSource};
use crate::deviceset::labels::{
    replica_index_of, Selector, CLAIM_APP, DAEMON_APP, DAEMON_ID_LABEL, PREPARE_APP,
    SELECTED_NODE_ANNOTATION,
};
use crate::deviceset::sink::ErrorSink;
use crate::domain::ports::{ClaimStoreRef, DaemonId, StorageAdminRef, WorkloadStoreRef};
use crate::error::{with_timeout, Error, Result};
use crate::lifecycle::drain::{DrainChain, DrainReport};
use crate::lifecycle::state::{
    removal_order, ReplicaAction, ReplicaId, ReplicaObservation, ReplicaState,
};
use crate::lifecycle::workload::{
    is_pinned, node_pin, ready_replicas, render_daemon, render_prepare_job, WorkloadParams,
};
use crate::metrics::OperatorMetrics;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Missing replicas a pass may provision
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionScope {
    /// Every replica in `[0, count)`
    All,
    /// Only these indices. The others are waiting on claims whose failure
    /// has already been recorded.
    Only(BTreeSet<u32>),
}

impl ProvisionScope {
    /// Replicas whose claims were all put in place by an expansion
    pub fn complete_replicas(source: Option<&VolumeSource>, templates: usize) -> Self {
        let mut per_replica: BTreeMap<u32, usize> = BTreeMap::new();
        for claim in source.map(|s| s.claims.as_slice()).unwrap_or_default() {
            *per_replica.entry(claim.replica_index).or_default() += 1;
        }
        ProvisionScope::Only(
            per_replica
                .into_iter()
                .filter(|(_, claims)| *claims >= templates)
                .map(|(index, _)| index)
                .collect(),
        )
    }

    pub fn allows(&self, index: u32) -> bool {
        match self {
            ProvisionScope::All => true,
            ProvisionScope::Only(indices) => indices.contains(&index),
        }
    }
}

/// Result of reconciling one device set's replicas
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSetOutcome {
    pub name: String,
    pub desired: i32,
    /// Replicas in `[0, count)` with a daemon workload in place
    pub provisioned: u32,
    pub ready: u32,
    /// Indices fully removed in this pass, in removal order
    pub removed: Vec<u32>,
    pub errors: Vec<String>,
}

impl DeviceSetOutcome {
    fn new(device_set: &StorageClassDeviceSet) -> Self {
        Self {
            name: device_set.name.clone(),
            desired: device_set.count,
            ..Default::default()
        }
    }

    pub fn succeeded(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn status(&self) -> DeviceSetStatus {
        DeviceSetStatus {
            name: self.name.clone(),
            desired: self.desired,
            provisioned: self.provisioned,
            ready: self.ready,
            removed: self.removed.clone(),
            succeeded: self.succeeded(),
            message: self.errors.first().cloned(),
        }
    }
}

pub struct LifecycleController {
    expander: Arc<DeviceSetExpander>,
    claims: ClaimStoreRef,
    workloads: WorkloadStoreRef,
    admin: StorageAdminRef,
    drain: DrainChain,
    config: OperatorConfig,
    metrics: OperatorMetrics,
}

impl LifecycleController {
    pub fn new(
        expander: Arc<DeviceSetExpander>,
        claims: ClaimStoreRef,
        workloads: WorkloadStoreRef,
        admin: StorageAdminRef,
        config: OperatorConfig,
        metrics: OperatorMetrics,
    ) -> Self {
        let drain = DrainChain::new(
            claims.clone(),
            workloads.clone(),
            admin.clone(),
            &config,
            metrics.clone(),
        );
        Self {
            expander,
            claims,
            workloads,
            admin,
            drain,
            config,
            metrics,
        }
    }

    // =========================================================================
    // Observation
    // =========================================================================

    /// Observe a replica and derive its state for `desired` replicas
    pub async fn observe(
        &self,
        replica: &ReplicaId,
        desired: u32,
    ) -> Result<(ReplicaState, ReplicaObservation)> {
        let timeout = self.config.call_timeout;
        let ns = replica.namespace.as_str();

        let claims = with_timeout(
            "list claims",
            timeout,
            self.claims.list_claims(
                ns,
                &Selector::replica(CLAIM_APP, &replica.device_set, replica.index),
            ),
        )
        .await?;
        let daemons = with_timeout(
            "list daemons",
            timeout,
            self.workloads.list_daemons(
                ns,
                &Selector::replica(DAEMON_APP, &replica.device_set, replica.index),
            ),
        )
        .await?;
        let jobs = with_timeout(
            "list prepare jobs",
            timeout,
            self.workloads.list_prepare_jobs(
                ns,
                &Selector::replica(PREPARE_APP, &replica.device_set, replica.index),
            ),
        )
        .await?;

        let daemon_id = with_timeout(
            "lookup daemon",
            timeout,
            self.admin.lookup_daemon(&replica.key()),
        )
        .await?;
        let membership = match daemon_id {
            Some(id) => {
                with_timeout("daemon status", timeout, self.admin.daemon_status(id)).await?
            }
            None => None,
        };

        let observation = ReplicaObservation {
            claims: claims.len(),
            daemon_workloads: daemons.len(),
            prepare_jobs: jobs.len(),
            ready: daemons.iter().any(|d| ready_replicas(d) > 0),
            daemon_id,
            membership,
        };
        let state = observation.state(replica.index, desired);
        debug!("Replica {} is {}", replica, state);
        Ok((state, observation))
    }

    /// Replica indices of a device set that still own any resource
    pub async fn existing_indices(
        &self,
        namespace: &str,
        device_set: &str,
    ) -> Result<BTreeSet<u32>> {
        let timeout = self.config.call_timeout;
        let claims = with_timeout(
            "list claims",
            timeout,
            self.claims
                .list_claims(namespace, &Selector::device_set(CLAIM_APP, device_set)),
        )
        .await?;
        let daemons = with_timeout(
            "list daemons",
            timeout,
            self.workloads
                .list_daemons(namespace, &Selector::device_set(DAEMON_APP, device_set)),
        )
        .await?;
        let jobs = with_timeout(
            "list prepare jobs",
            timeout,
            self.workloads
                .list_prepare_jobs(namespace, &Selector::device_set(PREPARE_APP, device_set)),
        )
        .await?;

        let mut indices = BTreeSet::new();
        indices.extend(
            claims
                .iter()
                .filter_map(|c| replica_index_of(c.metadata.labels.as_ref())),
        );
        indices.extend(
            daemons
                .iter()
                .filter_map(|d| replica_index_of(d.metadata.labels.as_ref())),
        );
        indices.extend(
            jobs.iter()
                .filter_map(|j| replica_index_of(j.metadata.labels.as_ref())),
        );
        Ok(indices)
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    /// Ensure claims, daemon identity, prepare job and daemon workload of a
    /// replica, in that order
    pub async fn provision(
        &self,
        replica: &ReplicaId,
        device_set: &StorageClassDeviceSet,
        daemon: &DaemonSpec,
    ) -> Result<DaemonId> {
        let timeout = self.config.call_timeout;
        let ns = replica.namespace.as_str();

        let claims = self
            .expander
            .ensure_replica_claims(device_set, ns, replica.index)
            .await?;

        let id = with_timeout(
            "register daemon",
            timeout,
            self.admin.register_daemon(&replica.key()),
        )
        .await?;

        let id_label = BTreeMap::from([(DAEMON_ID_LABEL.to_string(), id.to_string())]);
        for claim in &claims {
            with_timeout(
                "label claim",
                timeout,
                self.claims
                    .patch_claim_labels(ns, &claim.claim_name, id_label.clone()),
            )
            .await?;
        }

        let params = WorkloadParams {
            replica,
            device_set,
            daemon,
            default_image: &self.config.daemon_image,
            daemon_id: id,
            claims: &claims,
        };

        with_timeout(
            "create prepare job",
            timeout,
            self.workloads
                .create_prepare_job(ns, render_prepare_job(&params)),
        )
        .await?;

        let selector = Selector::replica(DAEMON_APP, &replica.device_set, replica.index);
        let existing = with_timeout(
            "list daemons",
            timeout,
            self.workloads.list_daemons(ns, &selector),
        )
        .await?;
        if existing.is_empty() {
            with_timeout(
                "create daemon",
                timeout,
                self.workloads.create_daemon(ns, render_daemon(&params)),
            )
            .await?;
            self.metrics.replicas_provisioned.inc();
            info!("Provisioned daemon {} for replica {}", id, replica);
        }
        Ok(id)
    }

    /// Pin a non-portable replica's daemon to the node its volumes were
    /// bound to. The scheduler only selects that node once the daemon's pod
    /// consumes the claims, so this runs on every pass until it holds.
    /// Returns whether the workload was patched.
    pub async fn ensure_pinned(
        &self,
        replica: &ReplicaId,
        device_set: &StorageClassDeviceSet,
    ) -> Result<bool> {
        if device_set.portable {
            return Ok(false);
        }
        let timeout = self.config.call_timeout;
        let ns = replica.namespace.as_str();

        let claims = with_timeout(
            "list claims",
            timeout,
            self.claims.list_claims(
                ns,
                &Selector::replica(CLAIM_APP, &replica.device_set, replica.index),
            ),
        )
        .await?;
        let selected_nodes = claims.iter().map(|c| {
            c.metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(SELECTED_NODE_ANNOTATION))
                .map(String::as_str)
        });
        let Some(pin) = node_pin(device_set, selected_nodes) else {
            debug!("Claims of {} are not bound to a node yet", replica);
            return Ok(false);
        };

        let daemons = with_timeout(
            "list daemons",
            timeout,
            self.workloads.list_daemons(
                ns,
                &Selector::replica(DAEMON_APP, &replica.device_set, replica.index),
            ),
        )
        .await?;
        let mut patched = false;
        for name in daemons
            .iter()
            .filter(|d| !is_pinned(d, &pin))
            .filter_map(|d| d.metadata.name.clone())
        {
            with_timeout(
                "pin daemon",
                timeout,
                self.workloads.pin_daemon(ns, &name, pin.clone()),
            )
            .await?;
            info!("Pinned daemon {} of replica {} to {:?}", name, replica, pin);
            patched = true;
        }
        Ok(patched)
    }

    /// Run the drain chain for a replica
    pub async fn drain(
        &self,
        replica: &ReplicaId,
        cancel: &CancellationToken,
    ) -> Result<DrainReport> {
        let report = self.drain.run(replica, cancel).await?;
        if report.completed {
            self.metrics.replicas_removed.inc();
        }
        Ok(report)
    }

    // =========================================================================
    // Device Set Reconciliation
    // =========================================================================

    /// Reconcile every replica of one device set.
    ///
    /// Failures are recorded in `sink` and in the outcome. Removals stop at
    /// the first replica that could not be fully drained so lower indices
    /// are never removed ahead of it. Missing replicas outside `scope` are
    /// left for a later pass. Only cancellation is returned as an error.
    pub async fn reconcile_device_set(
        &self,
        namespace: &str,
        device_set: &StorageClassDeviceSet,
        daemon: &DaemonSpec,
        scope: &ProvisionScope,
        sink: &ErrorSink,
        cancel: &CancellationToken,
    ) -> Result<DeviceSetOutcome> {
        let mut outcome = DeviceSetOutcome::new(device_set);
        if let Err(e) = validate_device_set(device_set) {
            // Reported by the expander
            outcome.errors.push(e.to_string());
            return Ok(outcome);
        }
        let desired = device_set.count.max(0) as u32;
        let name = device_set.name.as_str();

        let existing = match self.existing_indices(namespace, name).await {
            Ok(existing) => existing,
            Err(e) => {
                record(sink, &mut outcome, "list replicas", &e);
                return Ok(outcome);
            }
        };

        for index in removal_order(existing.iter().copied(), desired) {
            let replica = ReplicaId::new(namespace, name, index);
            match self.drain(&replica, cancel).await?.into_result() {
                Ok(_) => outcome.removed.push(index),
                Err(e) => {
                    record(sink, &mut outcome, &format!("drain replica {}", index), &e);
                    break;
                }
            }
        }

        for index in 0..desired {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let replica = ReplicaId::new(namespace, name, index);
            let (state, observation) = match self.observe(&replica, desired).await {
                Ok(observed) => observed,
                Err(e) => {
                    record(sink, &mut outcome, &format!("observe replica {}", index), &e);
                    continue;
                }
            };

            let has_daemon = match state.action() {
                ReplicaAction::Provision if scope.allows(index) => {
                    match self.provision(&replica, device_set, daemon).await {
                        Ok(_) => true,
                        Err(e) => {
                            let operation = format!("provision replica {}", index);
                            record(sink, &mut outcome, &operation, &e);
                            false
                        }
                    }
                }
                ReplicaAction::Provision => {
                    debug!("Replica {} waits for its claims", replica);
                    observation.daemon_workloads > 0
                }
                ReplicaAction::None | ReplicaAction::Drain => true,
            };
            if has_daemon {
                outcome.provisioned += 1;
                if let Err(e) = self.ensure_pinned(&replica, device_set).await {
                    record(sink, &mut outcome, &format!("pin replica {}", index), &e);
                }
            }
            if observation.ready {
                outcome.ready += 1;
            }
        }

        info!(
            "Device set {}: desired={} provisioned={} ready={} removed={:?}",
            name, desired, outcome.provisioned, outcome.ready, outcome.removed
        );
        Ok(outcome)
    }
}

fn record(sink: &ErrorSink, outcome: &mut DeviceSetOutcome, operation: &str, cause: &Error) {
    warn!("Device set {}: {} failed: {}", outcome.name, operation, cause);
    sink.record(&outcome.name, operation, cause);
    outcome.errors.push(format!("{}: {}", operation, cause));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::backends::InMemoryCluster;
    use crate::crd::DeviceSetClaimTemplate;
    use crate::deviceset::expander::ClaimRef;
    use crate::domain::ports::{ClaimStore, StorageAdmin};
    use crate::lifecycle::workload::daemon_id_of;
    use assert_matches::assert_matches;
    use k8s_openapi::api::core::v1::PersistentVolumeClaimSpec;

    fn device_set(count: i32) -> StorageClassDeviceSet {
        StorageClassDeviceSet {
            name: "set1".into(),
            count,
            portable: true,
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

    fn controller(cluster: &Arc<InMemoryCluster>) -> LifecycleController {
        let config = OperatorConfig::default();
        let metrics = OperatorMetrics::default();
        let expander = Arc::new(DeviceSetExpander::new(
            cluster.clone(),
            config.clone(),
            metrics.clone(),
        ));
        LifecycleController::new(
            expander,
            cluster.clone(),
            cluster.clone(),
            cluster.clone(),
            config,
            metrics,
        )
    }

    async fn reconcile(
        controller: &LifecycleController,
        set: &StorageClassDeviceSet,
        sink: &ErrorSink,
    ) -> DeviceSetOutcome {
        controller
            .reconcile_device_set(
                "ns",
                set,
                &DaemonSpec::default(),
                &ProvisionScope::All,
                sink,
                &CancellationToken::new(),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_provision_then_ready() {
        let cluster = InMemoryCluster::with_storage_classes(["local"]);
        let controller = controller(&cluster);
        let replica = ReplicaId::new("ns", "set1", 0);
        let set = device_set(1);

        let (state, _) = controller.observe(&replica, 1).await.unwrap();
        assert_eq!(state, ReplicaState::Absent);

        let id = controller
            .provision(&replica, &set, &DaemonSpec::default())
            .await
            .unwrap();
        assert_eq!(cluster.daemon_names("ns"), vec!["storage-daemon-set1-0"]);
        assert_eq!(cluster.job_count("ns"), 1);
        let claims = cluster.list_claims("ns", &Selector::new()).await.unwrap();
        assert_eq!(daemon_id_of(claims[0].metadata.labels.as_ref()), Some(id));

        let (state, observation) = controller.observe(&replica, 1).await.unwrap();
        assert_eq!(state, ReplicaState::Provisioning);
        assert_eq!(observation.daemon_id, Some(id));

        cluster.mark_daemons_ready("ns");
        let (state, _) = controller.observe(&replica, 1).await.unwrap();
        assert_eq!(state, ReplicaState::Active);
        let (state, _) = controller.observe(&replica, 0).await.unwrap();
        assert_eq!(state, ReplicaState::Draining);
    }

    #[tokio::test]
    async fn test_provision_is_idempotent() {
        let cluster = InMemoryCluster::with_storage_classes(["local"]);
        let controller = controller(&cluster);
        let replica = ReplicaId::new("ns", "set1", 0);
        let set = device_set(1);

        let first = controller
            .provision(&replica, &set, &DaemonSpec::default())
            .await
            .unwrap();
        let second = controller
            .provision(&replica, &set, &DaemonSpec::default())
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(cluster.claim_count("ns"), 1);
        assert_eq!(cluster.daemon_names("ns").len(), 1);
        assert_eq!(cluster.job_count("ns"), 1);
    }

    #[tokio::test]
    async fn test_scale_down_removes_highest_index_first() {
        let cluster = InMemoryCluster::with_storage_classes(["local"]);
        let controller = controller(&cluster);
        let sink = ErrorSink::new();

        let up = reconcile(&controller, &device_set(3), &sink).await;
        assert_eq!(up.provisioned, 3);
        assert!(sink.is_empty());
        cluster.clear_journal();

        let down = reconcile(&controller, &device_set(1), &sink).await;

        assert!(down.succeeded());
        assert_eq!(down.removed, vec![2, 1]);
        assert_eq!(down.provisioned, 1);
        let downs: Vec<_> = cluster
            .journal()
            .into_iter()
            .filter(|e| e.starts_with("mark down"))
            .collect();
        assert_eq!(downs, vec!["mark down 2", "mark down 1"]);
        assert_eq!(cluster.daemon_names("ns"), vec!["storage-daemon-set1-0"]);
        assert_eq!(
            controller.existing_indices("ns", "set1").await.unwrap(),
            BTreeSet::from([0])
        );
    }

    #[tokio::test]
    async fn test_stuck_drain_blocks_lower_indices() {
        let cluster = InMemoryCluster::with_storage_classes(["local"]);
        let controller = controller(&cluster);
        let sink = ErrorSink::new();
        reconcile(&controller, &device_set(3), &sink).await;
        let highest = cluster.lookup_daemon("ns/set1/2").await.unwrap().unwrap();
        cluster.keep_daemon_up(highest);
        cluster.clear_journal();

        let down = reconcile(&controller, &device_set(1), &sink).await;

        assert!(!down.succeeded());
        assert!(down.removed.is_empty());
        assert_eq!(sink.len(), 1);
        assert!(sink.snapshot()[0].starts_with("device set \"set1\": drain replica 2"));
        assert!(!cluster.journal().iter().any(|e| e == "mark down 1"));
        assert_eq!(cluster.daemon_names("ns").len(), 3);

        cluster.release_daemon(highest);
        let retry = reconcile(&controller, &device_set(1), &ErrorSink::new()).await;
        assert_eq!(retry.removed, vec![2, 1]);
    }

    #[tokio::test]
    async fn test_provision_failure_is_recorded_per_replica() {
        let cluster = InMemoryCluster::with_storage_classes(["local"]);
        cluster.fail_claims_with_prefix("set1-data-1-", "quota exceeded");
        let controller = controller(&cluster);
        let sink = ErrorSink::new();

        let outcome = reconcile(&controller, &device_set(2), &sink).await;

        assert_eq!(outcome.provisioned, 1);
        assert_eq!(outcome.errors.len(), 1);
        assert!(sink.messages_for("set1")[0].contains("provision replica 1"));
        assert_eq!(cluster.daemon_names("ns"), vec!["storage-daemon-set1-0"]);
    }

    #[tokio::test]
    async fn test_provisioning_is_limited_to_scope() {
        let cluster = InMemoryCluster::with_storage_classes(["local"]);
        let controller = controller(&cluster);
        let outcome = controller
            .reconcile_device_set(
                "ns",
                &device_set(2),
                &DaemonSpec::default(),
                &ProvisionScope::Only(BTreeSet::from([0])),
                &ErrorSink::new(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(outcome.succeeded());
        assert_eq!(outcome.provisioned, 1);
        assert_eq!(cluster.daemon_names("ns"), vec!["storage-daemon-set1-0"]);
    }

    #[test]
    fn test_scope_from_partial_expansion() {
        let claim = |replica_index, source_type: &str| ClaimRef {
            replica_index,
            source_type: source_type.into(),
            claim_name: format!("set1-{}-{}-x", source_type, replica_index),
            selected_node: None,
        };
        let source = VolumeSource {
            name: "set1".into(),
            source_type: "data".into(),
            portable: true,
            scheduler_name: None,
            claims: vec![claim(0, "data"), claim(0, "wal"), claim(1, "data"), claim(2, "wal")],
        };

        let scope = ProvisionScope::complete_replicas(Some(&source), 2);
        assert_eq!(scope, ProvisionScope::Only(BTreeSet::from([0])));
        assert!(!scope.allows(1));
        assert_eq!(
            ProvisionScope::complete_replicas(None, 1),
            ProvisionScope::Only(BTreeSet::new())
        );
        assert!(ProvisionScope::All.allows(7));
    }

    #[tokio::test]
    async fn test_cancellation_is_returned() {
        let cluster = InMemoryCluster::with_storage_classes(["local"]);
        let controller = controller(&cluster);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = controller
            .reconcile_device_set(
                "ns",
                &device_set(1),
                &DaemonSpec::default(),
                &ProvisionScope::All,
                &ErrorSink::new(),
                &cancel,
            )
            .await
            .unwrap_err();
        assert_matches!(err, Error::Cancelled);
        assert_eq!(cluster.claim_count("ns"), 0);
    }

    #[test]
    fn test_outcome_status() {
        let outcome = DeviceSetOutcome {
            name: "set1".into(),
            desired: 2,
            provisioned: 2,
            ready: 1,
            removed: vec![3],
            errors: vec!["drain replica 2: halted".into()],
        };
        let status = outcome.status();
        assert!(!status.succeeded);
        assert_eq!(status.message.as_deref(), Some("drain replica 2: halted"));
        assert_eq!(status.removed, vec![3]);
    }
}
