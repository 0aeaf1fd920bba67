//! Error types for the Device Set Operator
//!
//! Provides structured error types for claim expansion, the daemon
//! lifecycle, the storage admin endpoint and the operator runtime.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the operator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    #[error("Cluster API request failed: {operation} - {reason}")]
    ClusterApi { operation: String, reason: String },

    // =========================================================================
    // Device Set Errors
    // =========================================================================
    #[error("Invalid device set {device_set}: {reason}")]
    Validation { device_set: String, reason: String },

    #[error("Storage class not found: {storage_class}")]
    StorageClassNotFound { storage_class: String },

    // =========================================================================
    // Storage Admin Errors
    // =========================================================================
    #[error("Storage admin connection error: {0}")]
    AdminConnection(#[from] reqwest::Error),

    #[error("Storage admin command failed: {command} - {reason}")]
    AdminCommand { command: String, reason: String },

    // =========================================================================
    // Lifecycle Errors
    // =========================================================================
    #[error("Operation timed out after {timeout:?}: {operation}")]
    Timeout { operation: String, timeout: Duration },

    #[error("Drain of {replica} halted at {step}: {reason}")]
    DrainIncomplete {
        replica: String,
        step: String,
        reason: String,
    },

    #[error("Reconciliation cancelled")]
    Cancelled,

    // =========================================================================
    // Metrics Errors
    // =========================================================================
    #[error("Metrics registration error: {0}")]
    Metrics(#[from] prometheus::Error),

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient errors - retry with backoff
            Error::AdminConnection(_)
            | Error::Kube(_)
            | Error::ClusterApi { .. }
            | Error::Timeout { .. } => ErrorAction::RequeueWithBackoff,

            // A drain resumes from the observed storage cluster state
            Error::DrainIncomplete { .. } => ErrorAction::RequeueAfter(Duration::from_secs(30)),

            // The storage class may be created out of band
            Error::StorageClassNotFound { .. } => {
                ErrorAction::RequeueAfter(Duration::from_secs(60))
            }

            // Configuration/validation errors - don't retry automatically
            Error::Configuration(_)
            | Error::Validation { .. }
            | Error::Cancelled
            | Error::YamlParse(_) => ErrorAction::NoRequeue,

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::AdminConnection(_)
                | Error::Kube(_)
                | Error::ClusterApi { .. }
                | Error::Timeout { .. }
        )
    }

    /// Shorthand for a device set validation failure
    pub fn validation(device_set: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Validation {
            device_set: device_set.into(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for the operator
pub type Result<T> = std::result::Result<T, Error>;

/// Run a remote call under a caller-supplied timeout.
///
/// An elapsed timer surfaces as [`Error::Timeout`], which is transient: the
/// next reconciliation pass retries the step.
pub async fn with_timeout<T, F>(operation: &str, timeout: Duration, call: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout {
            operation: operation.to_string(),
            timeout,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_actions() {
        let err = Error::DrainIncomplete {
            replica: "ns/set1/0".into(),
            step: "mark-down".into(),
            reason: "still up".into(),
        };
        assert_eq!(
            err.action(),
            ErrorAction::RequeueAfter(Duration::from_secs(30))
        );

        let err = Error::validation("set1", "count is negative");
        assert_eq!(err.action(), ErrorAction::NoRequeue);

        let err = Error::StorageClassNotFound {
            storage_class: "fast".into(),
        };
        assert_eq!(
            err.action(),
            ErrorAction::RequeueAfter(Duration::from_secs(60))
        );
    }

    #[test]
    fn test_error_retryable() {
        let transient = Error::Timeout {
            operation: "mark down daemon 3".into(),
            timeout: Duration::from_secs(5),
        };
        assert!(transient.is_retryable());
        assert!(transient.is_transient());

        let config_err = Error::Configuration("invalid".into());
        assert!(!config_err.is_retryable());
        assert!(!config_err.is_transient());
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_elapses() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, Error>(())
        };
        let err = with_timeout("create claim", Duration::from_secs(1), slow)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_with_timeout_passes_result_through() {
        let value = with_timeout("list claims", Duration::from_secs(1), async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }
}
