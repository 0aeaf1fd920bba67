//! Daemon Lifecycle
//!
//! Per-replica state derivation, provisioning and the drain chain:
//! - state: replica identity and observed state
//! - workload: prepare job and daemon workload rendering
//! - drain: ordered, resumable replica removal
//! - controller: device set reconciliation

pub mod controller;
pub mod drain;
pub mod state;
pub mod workload;

pub use controller::{DeviceSetOutcome, LifecycleController, ProvisionScope};
pub use drain::{DrainChain, DrainReport, DrainStep, StepOutcome};
pub use state::{removal_order, ReplicaAction, ReplicaId, ReplicaObservation, ReplicaState};
