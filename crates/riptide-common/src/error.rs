//! Error taxonomy for the control-plane surface
//!
//! Data-path conditions (malformed frame, invalid transition) are resolved
//! locally by dropping or resetting and never appear here. These errors are
//! what an administrator sees when a mutation cannot be applied; none of
//! them is fatal to the process.

use thiserror::Error;

/// Control-plane error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// Virtual-service table is at its configured ceiling
    #[error("max_virtual_service exceeded")]
    MaxVirtualServices,

    /// Real-service table is at its configured ceiling
    #[error("max_real_service exceeded")]
    MaxRealServices,

    /// A virtual service already carries its maximum attached real services
    #[error("max_real_per_virtual exceeded")]
    MaxRealsPerVirtual,

    /// The hash table could not place the key within the displacement bound
    #[error("collision exceeded")]
    Collision,

    /// Virtual service does not exist
    #[error("virtual service not found: {0}")]
    VirtualServiceNotFound(String),

    /// Real service does not exist
    #[error("real service not found: {0}")]
    RealServiceNotFound(String),

    /// Unparseable `ip:port` endpoint
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// The authoritative core did not answer
    #[error("control channel unavailable")]
    Unavailable,
}

/// Result alias for control-plane operations
pub type ServiceResult<T> = Result<T, ServiceError>;
