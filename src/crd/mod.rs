//! Custom Resource Definitions for the Device Set Operator
//!
//! - StorageCluster: desired storage expressed as storage-class device sets

pub mod storage_cluster;

pub use storage_cluster::*;
