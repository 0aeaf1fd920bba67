//! Device Set Operator
//!
//! A Kubernetes operator that expands storage-class device sets into
//! per-replica volume claims and manages the storage daemon bound to each
//! replica, from provisioning through an ordered, resumable drain.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    StorageCluster Controller (kube)                      │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                          Orchestrator (one pass)                         │
//! │  ┌──────────────────────┐  ┌──────────────────────┐  ┌───────────────┐  │
//! │  │  Device Set Expander │  │ Lifecycle Controller │  │ Orphan Report │  │
//! │  │  (claims per replica)│  │ (provision / drain)  │  │               │  │
//! │  └──────────┬───────────┘  └──────────┬───────────┘  └───────┬───────┘  │
//! │             └─────────────┬───────────┴──────────────────────┘          │
//! │                           │                                              │
//! │                 ┌─────────┴─────────┐                                    │
//! │                 │    Error Sink     │                                    │
//! │                 └───────────────────┘                                    │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                 Ports                                    │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌──────────────────────────┐ │
//! │  │   ClaimStore    │  │  WorkloadStore  │  │      StorageAdmin        │ │
//! │  │ (cluster API)   │  │ (cluster API)   │  │  (HTTP admin endpoint)   │ │
//! │  └─────────────────┘  └─────────────────┘  └──────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controlplane`]: orchestrator, controller and backend adapters
//! - [`deviceset`]: claim rendering, expansion and error aggregation
//! - [`lifecycle`]: replica state, provisioning and the drain chain
//! - [`crd`]: Custom Resource Definitions
//! - [`domain`]: Core domain types and traits
//! - [`error`]: Error types and handling

pub mod config;
pub mod controlplane;
pub mod crd;
pub mod deviceset;
pub mod domain;
pub mod error;
pub mod lifecycle;
pub mod metrics;

// Re-export commonly used types
pub use config::OperatorConfig;

pub use controlplane::{
    AdminConfig, BackendFactory, ClusterBackends, InMemoryCluster, OperatorContext, Orchestrator,
    ReconcileReport,
};

pub use crd::{
    ClusterPhase, DaemonSpec, DeviceSetClaimTemplate, StorageClassDeviceSet, StorageCluster,
    StorageClusterSpec, StorageClusterStatus, StorageScopeSpec,
};

pub use deviceset::{DeviceSetExpander, ErrorSink, VolumeSource};

pub use domain::ports::{
    ClaimStore, DaemonId, DaemonMembership, StorageAdmin, WorkloadStore,
};

pub use error::{Error, ErrorAction, Result};

pub use lifecycle::{DrainReport, DrainStep, LifecycleController, ReplicaId, ReplicaState};

pub use metrics::OperatorMetrics;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
