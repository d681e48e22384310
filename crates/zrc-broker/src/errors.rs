//! Error types for the ZRC session broker.
//!
//! Component errors (`StoreError`, `TokenError`, `RelayError`, ...) live next to the
//! component that raises them. `BrokerError` is the taxonomy callers see: every broker
//! operation returns it, and the HTTP layer maps each variant to exactly one status code.

use thiserror::Error;

use crate::audit::AuditError;
use crate::credential::CredentialError;
use crate::relay::RelayError;
use crate::store::StoreError;
use crate::token::TokenError;

// ============================================================================
// Broker Error Taxonomy
// ============================================================================

/// Unified error type for broker operations.
///
/// Authentication and authorization variants carry no detail on purpose: callers must not
/// be able to distinguish "wrong credential" from "credential for another asset".
#[derive(Debug, Error, Clone)]
pub enum BrokerError {
    /// Missing, unknown, expired or mis-scoped credential or token.
    #[error("authentication failed")]
    AuthenticationFailure,

    /// Valid credential without the rights for this operation (deactivated agent, wrong role).
    #[error("not authorized")]
    AuthorizationFailure,

    /// Session (or asset) does not exist in the caller's organization.
    #[error("not found: {0}")]
    NotFound(String),

    /// Status change that the forward-only state machine does not allow.
    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    /// The asset already has a non-terminal session.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Malformed request shape.
    #[error("validation error: {0}")]
    Validation(String),

    /// Payload exceeds the configured signal size.
    #[error("payload too large")]
    PayloadTooLarge,

    /// Unexpected failure. The message is for logs only.
    #[error("internal error: {0}")]
    Internal(String),
}

impl BrokerError {
    /// Stable, wire-safe error code.
    pub fn code(&self) -> &'static str {
        match self {
            BrokerError::AuthenticationFailure => "authentication_failure",
            BrokerError::AuthorizationFailure => "authorization_failure",
            BrokerError::NotFound(_) => "not_found",
            BrokerError::InvalidTransition(_) => "invalid_transition",
            BrokerError::Conflict(_) => "conflict",
            BrokerError::Validation(_) => "validation_error",
            BrokerError::PayloadTooLarge => "payload_too_large",
            BrokerError::Internal(_) => "internal",
        }
    }

    /// Message that is safe to hand to a remote caller.
    ///
    /// Internal details never leave the process; validation messages do, since they only
    /// describe the caller's own request.
    pub fn public_message(&self) -> String {
        match self {
            BrokerError::AuthenticationFailure => "unauthorized".to_string(),
            BrokerError::AuthorizationFailure => "forbidden".to_string(),
            BrokerError::NotFound(_) => "not found".to_string(),
            BrokerError::InvalidTransition(msg) => format!("invalid transition: {}", msg),
            BrokerError::Conflict(msg) => format!("conflict: {}", msg),
            BrokerError::Validation(msg) => msg.clone(),
            BrokerError::PayloadTooLarge => "payload too large".to_string(),
            BrokerError::Internal(_) => "internal server error".to_string(),
        }
    }

    /// True for errors a polling caller may simply retry on its normal cadence.
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Internal(_))
    }
}

// ============================================================================
// Conversions
// ============================================================================

impl From<StoreError> for BrokerError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => BrokerError::NotFound(what),
            StoreError::AlreadyExists(what) => BrokerError::Conflict(what),
            other => BrokerError::Internal(other.to_string()),
        }
    }
}

impl From<TokenError> for BrokerError {
    fn from(e: TokenError) -> Self {
        match e {
            TokenError::Encoding(msg) => BrokerError::Internal(msg),
            _ => BrokerError::AuthenticationFailure,
        }
    }
}

impl From<RelayError> for BrokerError {
    fn from(e: RelayError) -> Self {
        match e {
            RelayError::MessageTooLarge { .. } => BrokerError::PayloadTooLarge,
            RelayError::Backend(msg) => BrokerError::Internal(msg),
        }
    }
}

impl From<CredentialError> for BrokerError {
    fn from(e: CredentialError) -> Self {
        BrokerError::Internal(e.to_string())
    }
}

impl From<AuditError> for BrokerError {
    fn from(e: AuditError) -> Self {
        BrokerError::Internal(e.to_string())
    }
}
