//! Replica Daemon State
//!
//! `absent -> provisioning -> active -> draining -> removed`
//!
//! The state of a replica is never stored by the operator. It is derived on
//! every pass from what the cluster and the storage cluster report, so a
//! crashed or cancelled pass resumes from where the cluster actually is.

use crate::domain::ports::{DaemonId, DaemonMembership};
use serde::{Deserialize, Serialize};

/// Identity of one device set replica
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReplicaId {
    pub namespace: String,
    pub device_set: String,
    pub index: u32,
}

impl ReplicaId {
    pub fn new(namespace: impl Into<String>, device_set: impl Into<String>, index: u32) -> Self {
        Self {
            namespace: namespace.into(),
            device_set: device_set.into(),
            index,
        }
    }

    /// Key under which the storage cluster knows this replica's daemon
    pub fn key(&self) -> String {
        format!("{}/{}/{}", self.namespace, self.device_set, self.index)
    }
}

impl std::fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// Lifecycle state of a replica
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicaState {
    Absent,
    Provisioning,
    Active,
    Draining,
    Removed,
}

impl ReplicaState {
    /// What the controller does for a replica in this state
    pub fn action(self) -> ReplicaAction {
        match self {
            ReplicaState::Absent | ReplicaState::Provisioning => ReplicaAction::Provision,
            ReplicaState::Active | ReplicaState::Removed => ReplicaAction::None,
            ReplicaState::Draining => ReplicaAction::Drain,
        }
    }
}

impl std::fmt::Display for ReplicaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicaState::Absent => write!(f, "absent"),
            ReplicaState::Provisioning => write!(f, "provisioning"),
            ReplicaState::Active => write!(f, "active"),
            ReplicaState::Draining => write!(f, "draining"),
            ReplicaState::Removed => write!(f, "removed"),
        }
    }
}

/// Work the controller issues for a replica
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaAction {
    /// Ensure claims, daemon identity, prepare job and workload exist
    Provision,
    /// Run the drain chain
    Drain,
    None,
}

/// What the cluster reports about one replica
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicaObservation {
    pub claims: usize,
    pub daemon_workloads: usize,
    pub prepare_jobs: usize,
    pub ready: bool,
    pub daemon_id: Option<DaemonId>,
    pub membership: Option<DaemonMembership>,
}

impl ReplicaObservation {
    fn has_resources(&self) -> bool {
        self.claims > 0
            || self.daemon_workloads > 0
            || self.prepare_jobs > 0
            || self.membership.is_some()
    }

    /// Derive the replica state for a device set with `desired` replicas
    pub fn state(&self, index: u32, desired: u32) -> ReplicaState {
        let wanted = index < desired;
        match (wanted, self.has_resources()) {
            (true, false) => ReplicaState::Absent,
            (true, true) if self.ready => ReplicaState::Active,
            (true, true) => ReplicaState::Provisioning,
            (false, true) => ReplicaState::Draining,
            (false, false) => ReplicaState::Removed,
        }
    }
}

/// Replica indices to remove when scaling to `desired`, highest first
pub fn removal_order<I>(existing: I, desired: u32) -> Vec<u32>
where
    I: IntoIterator<Item = u32>,
{
    let mut doomed: Vec<u32> = existing.into_iter().filter(|i| *i >= desired).collect();
    doomed.sort_unstable_by(|a, b| b.cmp(a));
    doomed.dedup();
    doomed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replica_key() {
        let replica = ReplicaId::new("ns", "set1", 3);
        assert_eq!(replica.key(), "ns/set1/3");
        assert_eq!(replica.to_string(), "ns/set1/3");
    }

    #[test]
    fn test_state_derivation() {
        let none = ReplicaObservation::default();
        assert_eq!(none.state(0, 1), ReplicaState::Absent);
        assert_eq!(none.state(1, 1), ReplicaState::Removed);

        let provisioning = ReplicaObservation {
            claims: 1,
            daemon_workloads: 1,
            ..Default::default()
        };
        assert_eq!(provisioning.state(0, 1), ReplicaState::Provisioning);
        assert_eq!(provisioning.state(0, 0), ReplicaState::Draining);

        let active = ReplicaObservation {
            ready: true,
            ..provisioning.clone()
        };
        assert_eq!(active.state(0, 1), ReplicaState::Active);

        let roster_only = ReplicaObservation {
            membership: Some(DaemonMembership {
                up: false,
                in_cluster: true,
            }),
            ..Default::default()
        };
        assert_eq!(roster_only.state(2, 1), ReplicaState::Draining);
    }

    #[test]
    fn test_actions() {
        assert_eq!(ReplicaState::Absent.action(), ReplicaAction::Provision);
        assert_eq!(ReplicaState::Provisioning.action(), ReplicaAction::Provision);
        assert_eq!(ReplicaState::Active.action(), ReplicaAction::None);
        assert_eq!(ReplicaState::Draining.action(), ReplicaAction::Drain);
    }

    #[test]
    fn test_removal_order_is_lifo() {
        assert_eq!(removal_order([0, 1, 2, 3], 2), vec![3, 2]);
        assert_eq!(removal_order([0, 1, 2], 3), Vec::<u32>::new());
        assert_eq!(removal_order([4, 0, 4, 2], 0), vec![4, 2, 0]);
    }
}
