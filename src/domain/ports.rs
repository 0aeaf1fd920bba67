//! Domain Ports - Core trait definitions for the device set operator
//!
//! These traits define the boundaries between the reconciliation core and
//! the systems it drives: the cluster object store (claims, daemon
//! workloads, prepare jobs) and the storage cluster's admin interface.
//! Adapters implement these traits to provide concrete functionality.

use crate::deviceset::labels::Selector;
use crate::error::Result;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

// =============================================================================
// Storage Daemon Identity
// =============================================================================

/// Identity of a storage daemon inside the storage cluster's membership roster
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DaemonId(pub u32);

impl std::fmt::Display for DaemonId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for DaemonId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.parse().map(DaemonId)
    }
}

/// Membership of a daemon as seen by the storage cluster.
///
/// `up`/`down` and `in`/`out` are observed independently: a daemon can be
/// down but still in, or up and already out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonMembership {
    pub up: bool,
    #[serde(rename = "in")]
    pub in_cluster: bool,
}

/// Administrative commands understood by the storage cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AdminCommand {
    Register,
    Lookup,
    Status,
    MarkDown,
    MarkOut,
    Purge,
}

impl AdminCommand {
    /// Command prefix on the admin wire protocol
    pub fn prefix(&self) -> &'static str {
        match self {
            AdminCommand::Register => "daemon register",
            AdminCommand::Lookup => "daemon lookup",
            AdminCommand::Status => "daemon status",
            AdminCommand::MarkDown => "daemon down",
            AdminCommand::MarkOut => "daemon out",
            AdminCommand::Purge => "daemon purge",
        }
    }
}

impl std::fmt::Display for AdminCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.prefix())
    }
}

// =============================================================================
// Claim Store Port
// =============================================================================

/// Port for persistent volume claim operations
#[async_trait]
pub trait ClaimStore: Send + Sync {
    /// Create a claim. Creating an identity that already exists is a success.
    async fn create_claim(
        &self,
        namespace: &str,
        claim: PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim>;

    /// List claims matching a label selector
    async fn list_claims(
        &self,
        namespace: &str,
        selector: &Selector,
    ) -> Result<Vec<PersistentVolumeClaim>>;

    /// Merge labels into an existing claim
    async fn patch_claim_labels(
        &self,
        namespace: &str,
        name: &str,
        labels: BTreeMap<String, String>,
    ) -> Result<PersistentVolumeClaim>;

    /// Delete a claim. Returns false when it was already absent.
    async fn delete_claim(&self, namespace: &str, name: &str) -> Result<bool>;

    /// Check that a storage class exists
    async fn storage_class_exists(&self, name: &str) -> Result<bool>;
}

// =============================================================================
// Workload Store Port
// =============================================================================

/// Port for daemon workloads and their prepare jobs
#[async_trait]
pub trait WorkloadStore: Send + Sync {
    /// Create a daemon workload. Creating an existing one is a success.
    async fn create_daemon(&self, namespace: &str, daemon: Deployment) -> Result<Deployment>;

    /// List daemon workloads matching a label selector
    async fn list_daemons(&self, namespace: &str, selector: &Selector) -> Result<Vec<Deployment>>;

    /// Delete a daemon workload. Returns false when it was already absent.
    async fn delete_daemon(&self, namespace: &str, name: &str) -> Result<bool>;

    /// Set the node selector of a daemon workload's pods
    async fn pin_daemon(
        &self,
        namespace: &str,
        name: &str,
        node_selector: BTreeMap<String, String>,
    ) -> Result<Deployment>;

    /// Create a prepare job. Creating an existing one is a success.
    async fn create_prepare_job(&self, namespace: &str, job: Job) -> Result<Job>;

    /// List prepare jobs matching a label selector
    async fn list_prepare_jobs(&self, namespace: &str, selector: &Selector) -> Result<Vec<Job>>;

    /// Delete all prepare jobs matching a label selector, returning how many
    /// were removed
    async fn delete_prepare_jobs(&self, namespace: &str, selector: &Selector) -> Result<usize>;
}

// =============================================================================
// Storage Admin Port
// =============================================================================

/// Port for the storage cluster's administrative commands.
///
/// Every command is idempotent on the storage cluster side: marking an
/// already-down daemon down, or purging an unknown one, succeeds.
#[async_trait]
pub trait StorageAdmin: Send + Sync {
    /// Register (or look up) the daemon identity for a replica key
    async fn register_daemon(&self, replica_key: &str) -> Result<DaemonId>;

    /// Look up the daemon identity for a replica key without registering
    async fn lookup_daemon(&self, replica_key: &str) -> Result<Option<DaemonId>>;

    /// Current membership, `None` once the daemon has been purged
    async fn daemon_status(&self, id: DaemonId) -> Result<Option<DaemonMembership>>;

    /// Mark the daemon administratively down
    async fn mark_down(&self, id: DaemonId) -> Result<()>;

    /// Mark the daemon administratively out
    async fn mark_out(&self, id: DaemonId) -> Result<()>;

    /// Remove the daemon from the membership roster. Irreversible.
    async fn purge(&self, id: DaemonId, force: bool) -> Result<()>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type ClaimStoreRef = Arc<dyn ClaimStore>;
pub type WorkloadStoreRef = Arc<dyn WorkloadStore>;
pub type StorageAdminRef = Arc<dyn StorageAdmin>;
