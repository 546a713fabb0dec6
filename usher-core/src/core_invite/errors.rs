//! Error types for the invite lifecycle

use crate::core_audit::AuditError;
use thiserror::Error;

/// Result type for invite operations
pub type InviteResult<T> = Result<T, InviteError>;

/// Result type for gateway calls
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Errors that can occur in invite lifecycle operations
#[derive(Error, Debug)]
pub enum InviteError {
    /// Unmapped tier or channel; fatal to the single request
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Remote gateway call failed
    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    /// An older invite was displaced by a newer one for the same recipient
    #[error("Invite {old} for {recipient} superseded by {new}")]
    RaceSuperseded {
        recipient: String,
        old: String,
        new: String,
    },

    /// Audit log could not be read or written
    #[error("Audit log error: {0}")]
    Audit(#[from] AuditError),
}

/// Errors reported by a messaging gateway
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("No invite link returned")]
    NoLinkReturned,

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Gateway unavailable: {0}")]
    Unavailable(String),
}

impl GatewayError {
    /// Whether the error means the remote object is already gone
    pub fn is_not_found(&self) -> bool {
        matches!(self, GatewayError::NotFound(_))
    }
}
