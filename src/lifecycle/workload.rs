//! Daemon Workload Rendering
//!
//! Builds the prepare job and the daemon Deployment of one replica. Both are
//! bound to the replica's claims and labeled with its back-reference labels
//! and daemon id.

use crate::crd::{DaemonSpec, StorageClassDeviceSet};
use crate::deviceset::expander::ClaimRef;
use crate::deviceset::labels::{
    self, daemon_name, prepare_job_name, DAEMON_APP, DAEMON_ID_LABEL, PREPARE_APP,
};
use crate::domain::ports::DaemonId;
use crate::lifecycle::state::ReplicaId;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec, Volume,
    VolumeDevice,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use std::collections::BTreeMap;

/// Node label used to pin non-portable daemons
pub const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";

const DEVICE_ROOT: &str = "/var/lib/storage-daemon";

/// Node selector pinning a non-portable daemon to the node its volumes were
/// bound to. `None` for portable device sets and until a claim is bound.
pub fn node_pin<'a, I>(
    device_set: &StorageClassDeviceSet,
    selected_nodes: I,
) -> Option<BTreeMap<String, String>>
where
    I: IntoIterator<Item = Option<&'a str>>,
{
    if device_set.portable {
        return None;
    }
    selected_nodes
        .into_iter()
        .flatten()
        .next()
        .map(|node| BTreeMap::from([(HOSTNAME_LABEL.to_string(), node.to_string())]))
}

/// Whether a daemon workload's pods already carry `pin`
pub fn is_pinned(daemon: &Deployment, pin: &BTreeMap<String, String>) -> bool {
    let current = daemon
        .spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .and_then(|p| p.node_selector.as_ref());
    match current {
        Some(current) => pin.iter().all(|(k, v)| current.get(k) == Some(v)),
        None => pin.is_empty(),
    }
}

/// Inputs shared by the prepare job and the daemon workload
pub struct WorkloadParams<'a> {
    pub replica: &'a ReplicaId,
    pub device_set: &'a StorageClassDeviceSet,
    pub daemon: &'a DaemonSpec,
    pub default_image: &'a str,
    pub daemon_id: DaemonId,
    pub claims: &'a [ClaimRef],
}

impl WorkloadParams<'_> {
    fn image(&self) -> String {
        self.daemon
            .image
            .clone()
            .unwrap_or_else(|| self.default_image.to_string())
    }

    fn labels(&self, app: &str) -> BTreeMap<String, String> {
        let mut labels = self.device_set.labels.clone();
        labels.extend(labels::replica_labels(
            app,
            &self.replica.device_set,
            self.replica.index,
        ));
        labels.insert(DAEMON_ID_LABEL.to_string(), self.daemon_id.to_string());
        labels
    }

    fn volumes(&self) -> (Vec<Volume>, Vec<VolumeDevice>) {
        self.claims
            .iter()
            .map(|claim| {
                let volume = Volume {
                    name: claim.source_type.clone(),
                    persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                        claim_name: claim.claim_name.clone(),
                        read_only: None,
                    }),
                    ..Default::default()
                };
                let device = VolumeDevice {
                    name: claim.source_type.clone(),
                    device_path: format!("{}/{}", DEVICE_ROOT, claim.source_type),
                };
                (volume, device)
            })
            .unzip()
    }

    fn env(&self) -> Vec<EnvVar> {
        vec![
            env_var("DAEMON_ID", self.daemon_id.to_string()),
            env_var("DEVICE_SET", self.replica.device_set.clone()),
            env_var("REPLICA_INDEX", self.replica.index.to_string()),
            env_var("REPLICA_KEY", self.replica.key()),
        ]
    }

    fn pinned_node(&self) -> Option<BTreeMap<String, String>> {
        node_pin(
            self.device_set,
            self.claims.iter().map(|c| c.selected_node.as_deref()),
        )
    }

    fn pod_spec(&self, args: Vec<String>, restart_policy: &str) -> PodSpec {
        let (volumes, volume_devices) = self.volumes();
        PodSpec {
            scheduler_name: self.device_set.scheduler_name.clone(),
            node_selector: self.pinned_node(),
            restart_policy: Some(restart_policy.to_string()),
            containers: vec![Container {
                name: "daemon".to_string(),
                image: Some(self.image()),
                image_pull_policy: self.daemon.image_pull_policy.clone(),
                args: Some(args),
                env: Some(self.env()),
                resources: self.device_set.resources.clone(),
                volume_devices: Some(volume_devices),
                ..Default::default()
            }],
            volumes: Some(volumes),
            ..Default::default()
        }
    }
}

fn env_var(name: &str, value: String) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value),
        value_from: None,
    }
}

/// Render the job that prepares a replica's volumes for its daemon
pub fn render_prepare_job(params: &WorkloadParams<'_>) -> Job {
    let labels = params.labels(PREPARE_APP);
    Job {
        metadata: ObjectMeta {
            name: Some(prepare_job_name(
                &params.replica.device_set,
                params.replica.index,
            )),
            namespace: Some(params.replica.namespace.clone()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(6),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(params.pod_spec(vec!["prepare".to_string()], "OnFailure")),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Render the daemon workload of a replica
pub fn render_daemon(params: &WorkloadParams<'_>) -> Deployment {
    let labels = params.labels(DAEMON_APP);
    let replica = params.replica;
    let selector = labels::replica_labels(DAEMON_APP, &replica.device_set, replica.index);
    Deployment {
        metadata: ObjectMeta {
            name: Some(daemon_name(&replica.device_set, replica.index)),
            namespace: Some(params.replica.namespace.clone()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(selector),
                ..Default::default()
            },
            // Never run two daemons on the same volumes
            strategy: Some(DeploymentStrategy {
                type_: Some("Recreate".to_string()),
                rolling_update: None,
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(params.pod_spec(vec!["run".to_string()], "Always")),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Ready replica count reported by a daemon workload
pub fn ready_replicas(daemon: &Deployment) -> i32 {
    daemon
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0)
}

/// Daemon id recorded on a workload, job or claim
pub fn daemon_id_of(labels: Option<&BTreeMap<String, String>>) -> Option<DaemonId> {
    labels?.get(DAEMON_ID_LABEL)?.parse().ok()
}
