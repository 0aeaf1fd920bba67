//! StorageCluster CRD
//!
//! Declares the desired storage of a cluster as a list of storage-class
//! device sets. Each device set expands into per-replica volume claims and
//! one storage daemon per replica.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{PersistentVolumeClaimSpec, ResourceRequirements};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// StorageCluster CRD
// =============================================================================

/// StorageCluster describes the device sets whose volumes back the storage
/// daemons of one storage cluster.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "storage.deviceset.io",
    version = "v1",
    kind = "StorageCluster",
    plural = "storageclusters",
    shortname = "stc",
    status = "StorageClusterStatus",
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct StorageClusterSpec {
    /// Desired storage
    #[serde(default)]
    pub storage: StorageScopeSpec,

    /// Storage daemon workload settings
    #[serde(default)]
    pub daemon: DaemonSpec,
}

// =============================================================================
// Sub-Types
// =============================================================================

/// Desired storage of the cluster
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageScopeSpec {
    /// Device sets in reconciliation order
    #[serde(default)]
    pub storage_class_device_sets: Vec<StorageClassDeviceSet>,
}

/// A group of identical volume-backed storage daemon replicas
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageClassDeviceSet {
    /// Unique name within the cluster, root of every generated identity
    pub name: String,

    /// Desired replica count
    #[serde(default)]
    pub count: i32,

    /// Whether the daemon may move between nodes with its volume
    #[serde(default)]
    pub portable: bool,

    /// Custom scheduler for the daemon pods
    #[serde(default)]
    pub scheduler_name: Option<String>,

    /// Claim templates, one claim per template per replica
    #[serde(default)]
    pub volume_claim_templates: Vec<DeviceSetClaimTemplate>,

    /// Resources for the daemon container
    #[serde(default)]
    pub resources: Option<ResourceRequirements>,

    /// Extra labels for the daemon workload
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Template for one of a replica's volume claims
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSetClaimTemplate {
    /// Role of the volume (data, metadata, wal). Defaults to "data".
    #[serde(default)]
    pub source_type: Option<String>,

    /// Labels copied onto the generated claims
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// Annotations copied onto the generated claims
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,

    /// Claim spec, copied verbatim
    #[serde(default)]
    pub spec: PersistentVolumeClaimSpec,
}

impl DeviceSetClaimTemplate {
    /// Storage class referenced by the template, if any
    pub fn storage_class(&self) -> Option<&str> {
        self.spec.storage_class_name.as_deref()
    }
}

/// Storage daemon workload settings
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DaemonSpec {
    /// Daemon image, falls back to the operator default
    #[serde(default)]
    pub image: Option<String>,

    /// Image pull policy
    #[serde(default)]
    pub image_pull_policy: Option<String>,
}

// =============================================================================
// Status
// =============================================================================

/// Status of the StorageCluster
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageClusterStatus {
    /// Current phase
    #[serde(default)]
    pub phase: ClusterPhase,

    /// Generation of the spec last reconciled
    #[serde(default)]
    pub observed_generation: Option<i64>,

    /// Per device set results
    #[serde(default)]
    pub device_sets: Vec<DeviceSetStatus>,

    /// Aggregated error messages of the last pass
    #[serde(default)]
    pub errors: Vec<String>,

    /// Device sets that still own claims but are no longer declared
    #[serde(default)]
    pub orphaned_device_sets: Vec<String>,

    /// Completion time of the last pass
    #[serde(default)]
    pub last_reconciled: Option<DateTime<Utc>>,
}

/// Cluster phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ClusterPhase {
    #[default]
    Pending,
    Progressing,
    Ready,
    Degraded,
}

impl std::fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterPhase::Pending => write!(f, "Pending"),
            ClusterPhase::Progressing => write!(f, "Progressing"),
            ClusterPhase::Ready => write!(f, "Ready"),
            ClusterPhase::Degraded => write!(f, "Degraded"),
        }
    }
}

/// Status of one device set
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSetStatus {
    pub name: String,
    pub desired: i32,
    pub provisioned: u32,
    pub ready: u32,
    /// Replica indices removed during the last pass, in removal order
    #[serde(default)]
    pub removed: Vec<u32>,
    pub succeeded: bool,
    #[serde(default)]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    #[test]
    fn test_crd_metadata() {
        let crd = StorageCluster::crd();
        assert_eq!(
            crd.metadata.name.as_deref(),
            Some("storageclusters.storage.deviceset.io")
        );
        assert_eq!(crd.spec.scope, "Namespaced");
    }

    #[test]
    fn test_device_set_deserialize_defaults() {
        let yaml = r#"
storage:
  storageClassDeviceSets:
    - name: set1
      count: 3
      portable: true
      volumeClaimTemplates:
        - spec:
            storageClassName: gp2
            accessModes: ["ReadWriteOnce"]
        - sourceType: wal
          spec:
            storageClassName: io1
"#;
        let spec: StorageClusterSpec = serde_yaml::from_str(yaml).unwrap();
        let set = &spec.storage.storage_class_device_sets[0];
        assert_eq!(set.name, "set1");
        assert_eq!(set.count, 3);
        assert!(set.portable);
        assert_eq!(set.scheduler_name, None);
        assert_eq!(set.volume_claim_templates.len(), 2);
        assert_eq!(set.volume_claim_templates[0].source_type, None);
        assert_eq!(set.volume_claim_templates[0].storage_class(), Some("gp2"));
        assert_eq!(
            set.volume_claim_templates[1].source_type.as_deref(),
            Some("wal")
        );
        assert!(spec.daemon.image.is_none());
    }
}
