//! Cluster Backend Adapters
//!
//! Implementations of the domain ports:
//! - kubernetes: claims, daemon workloads and prepare jobs via the cluster API
//! - admin_http: storage cluster admin commands over HTTP
//! - memory: in-process cluster for tests and standalone runs

pub mod admin_http;
pub mod kubernetes;
pub mod memory;

pub use admin_http::{AdminConfig, HttpStorageAdmin};
pub use kubernetes::KubeClusterAdapter;
pub use memory::{InMemoryCluster, ResourceKind};

use crate::domain::ports::{ClaimStoreRef, StorageAdminRef, WorkloadStoreRef};
use crate::error::Result;
use kube::Client;
use std::sync::Arc;

/// The three ports the reconciliation core drives
#[derive(Clone)]
pub struct ClusterBackends {
    pub claims: ClaimStoreRef,
    pub workloads: WorkloadStoreRef,
    pub admin: StorageAdminRef,
}

/// Factory for backend bundles
pub struct BackendFactory;

impl BackendFactory {
    /// Live cluster API plus the HTTP admin endpoint
    pub fn kubernetes(client: Client, admin: AdminConfig) -> Result<ClusterBackends> {
        let cluster = Arc::new(KubeClusterAdapter::new(client));
        Ok(ClusterBackends {
            claims: cluster.clone(),
            workloads: cluster,
            admin: Arc::new(HttpStorageAdmin::new(admin)?),
        })
    }

    /// Every port backed by one in-process cluster
    pub fn in_memory(cluster: Arc<InMemoryCluster>) -> ClusterBackends {
        ClusterBackends {
            claims: cluster.clone(),
            workloads: cluster.clone(),
            admin: cluster,
        }
    }
}
