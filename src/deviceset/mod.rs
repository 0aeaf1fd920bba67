//! Device Set Expansion
//!
//! Turns declarative device sets into concrete, labeled volume claims:
//! - claim: deterministic claim rendering
//! - expander: claim creation across all device sets
//! - sink: append-only error aggregation
//! - labels: replica back-reference labels and selectors

pub mod claim;
pub mod expander;
pub mod labels;
pub mod sink;

pub use claim::*;
pub use expander::*;
pub use labels::Selector;
pub use sink::*;
