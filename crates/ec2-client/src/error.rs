//! EC2 client errors

use thiserror::Error;

/// Errors that can occur when talking to the EC2, Shield or metadata APIs.
#[derive(Debug, Error)]
pub enum Ec2Error {
    /// AWS API call failed (throttling, timeout, 5xx, bad request)
    #[error("EC2 API error: {0}")]
    Api(String),

    /// No network interface carries the requested private IP
    #[error("no network interface found for {0}")]
    InterfaceNotFound(String),

    /// Requested address does not exist
    #[error("address not found: {0}")]
    NotFound(String),

    /// No unassociated address carries the requested tag key
    #[error("no available address for tag key {0}")]
    NoAvailable(String),

    /// Instance metadata lookup failed
    #[error("instance metadata error: {0}")]
    Imds(String),
}
