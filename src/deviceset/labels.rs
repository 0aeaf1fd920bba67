//! Replica back-reference labels
//!
//! Claims, prepare jobs and daemon workloads are tagged at creation time with
//! the device set and replica index that own them. These labels are the only
//! way a replica's resources are found again: generated claim names end in a
//! random suffix and cannot be re-derived.

use std::collections::BTreeMap;

pub const DEVICE_SET_LABEL: &str = "storage.deviceset.io/device-set";
pub const REPLICA_INDEX_LABEL: &str = "storage.deviceset.io/replica-index";
pub const SOURCE_TYPE_LABEL: &str = "storage.deviceset.io/source-type";
pub const DAEMON_ID_LABEL: &str = "storage.deviceset.io/daemon-id";
pub const APP_LABEL: &str = "app";

/// `app` label of device set claims
pub const CLAIM_APP: &str = "storage-daemon-volume";
/// `app` label of daemon workloads
pub const DAEMON_APP: &str = "storage-daemon";
/// `app` label of prepare jobs
pub const PREPARE_APP: &str = "storage-daemon-prepare";

/// Scheduler annotation naming the node a claim's volume was bound to
pub const SELECTED_NODE_ANNOTATION: &str = "volume.kubernetes.io/selected-node";

/// Name of a replica's daemon workload. Derived from the replica, never from
/// the storage cluster's daemon id, which is reused once purged.
pub fn daemon_name(device_set: &str, index: u32) -> String {
    format!("{}-{}-{}", DAEMON_APP, device_set, index)
}

/// Name of a replica's prepare job
pub fn prepare_job_name(device_set: &str, index: u32) -> String {
    format!("{}-{}-{}", PREPARE_APP, device_set, index)
}

/// Equality-based label selector
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector(BTreeMap<String, String>);

impl Selector {
    pub fn new() -> Self {
        Self::default()
    }

    /// All resources of one component (claims, daemons, prepare jobs)
    pub fn app(app: &str) -> Self {
        Self::new().with(APP_LABEL, app)
    }

    /// Resources of one component belonging to a device set
    pub fn device_set(app: &str, device_set: &str) -> Self {
        Self::app(app).with(DEVICE_SET_LABEL, device_set)
    }

    /// Resources of one component belonging to a single replica
    pub fn replica(app: &str, device_set: &str, index: u32) -> Self {
        Self::device_set(app, device_set).with(REPLICA_INDEX_LABEL, index.to_string())
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Whether every selector term is present in `labels`
    pub fn matches(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        let Some(labels) = labels else {
            return self.0.is_empty();
        };
        self.0.iter().all(|(k, v)| labels.get(k) == Some(v))
    }
}

impl std::fmt::Display for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for (k, v) in &self.0 {
            if !first {
                write!(f, ",")?;
            }
            write!(f, "{}={}", k, v)?;
            first = false;
        }
        Ok(())
    }
}

/// Labels stamped on every resource of a replica
pub fn replica_labels(app: &str, device_set: &str, index: u32) -> BTreeMap<String, String> {
    Selector::replica(app, device_set, index).0
}

/// Replica index recorded on a resource
pub fn replica_index_of(labels: Option<&BTreeMap<String, String>>) -> Option<u32> {
    labels?.get(REPLICA_INDEX_LABEL)?.parse().ok()
}

/// Device set recorded on a resource
pub fn device_set_of(labels: Option<&BTreeMap<String, String>>) -> Option<&str> {
    labels?.get(DEVICE_SET_LABEL).map(String::as_str)
}
