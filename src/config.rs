//! Operator Configuration

use crate::error::{Error, Result};
use std::time::Duration;

/// Configuration shared by the expander, the lifecycle controller and the
/// operator runtime
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Default storage daemon image
    pub daemon_image: String,
    /// Timeout applied to every remote call
    pub call_timeout: Duration,
    /// Device sets expanded concurrently
    pub expand_parallelism: usize,
    /// Purge daemons that could not be confirmed down
    pub force_purge: bool,
    /// Reject device sets referring to unknown storage classes
    pub validate_storage_classes: bool,
    /// Requeue interval after a successful pass
    pub requeue_interval: Duration,
    /// Requeue interval after a pass with per device set failures
    pub retry_interval: Duration,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            daemon_image: "quay.io/deviceset/storage-daemon:latest".to_string(),
            call_timeout: Duration::from_secs(30),
            expand_parallelism: 4,
            force_purge: false,
            validate_storage_classes: true,
            requeue_interval: Duration::from_secs(300),
            retry_interval: Duration::from_secs(30),
        }
    }
}

impl OperatorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.daemon_image.is_empty() {
            return Err(Error::Configuration("daemon image must be set".into()));
        }
        if self.call_timeout.is_zero() {
            return Err(Error::Configuration("call timeout must be positive".into()));
        }
        if self.expand_parallelism == 0 {
            return Err(Error::Configuration(
                "expand parallelism must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
