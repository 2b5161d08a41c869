//! Controller-specific error types.

use ec2_client::Ec2Error;
use kube::Error as KubeError;
use thiserror::Error;

/// Errors that can occur in the EIP controller.
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// EC2 / Shield / IMDS error
    #[error("EC2 error: {0}")]
    Ec2(#[from] Ec2Error),

    /// JSON serialization error building a label patch
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration or malformed input
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Resource watch failed
    #[error("resource watch failed: {0}")]
    Watch(String),

    /// The leader lease was lost or could not be renewed in time
    #[error("lost leadership lease")]
    LeaseLost,
}

impl Error {
    /// Whether the worker should requeue the item that produced this error.
    ///
    /// Cloud and cluster errors are transient (throttling, timeouts,
    /// conflicts, addresses that have not appeared yet); configuration
    /// errors and lease loss are not.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Error::InvalidConfig(_) | Error::LeaseLost)
    }
}
