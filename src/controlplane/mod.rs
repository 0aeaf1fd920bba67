//! Control Plane Module
//!
//! Wires the reconciliation core to the outside world: backend adapters,
//! the per-pass orchestrator and the StorageCluster controller.

pub mod backends;
pub mod operator;
pub mod orchestrator;

pub use backends::*;
pub use operator::OperatorContext;
pub use orchestrator::*;
