//! Error types for the Stealth Link backend

use std::fmt;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::codec::{CodecError, HandleError};

/// Transport failures a user may retry by hand
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientKind {
    RateLimited,
    ServiceUnavailable,
    Network,
}

impl fmt::Display for TransientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransientKind::RateLimited => "Rate limited",
            TransientKind::ServiceUnavailable => "Service unavailable",
            TransientKind::Network => "Network",
        };
        f.write_str(name)
    }
}

/// Coarse error classes, each with its own handling policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Bad amount, address, or handle. Never retried.
    InvalidInput,
    /// Domain or handle could not be resolved
    ResolutionFailure,
    /// Operator-facing misconfiguration
    Configuration,
    /// No usable pool tree; retry later
    TreeIncompatibility,
    /// Proof or ledger rejection; diagnostics preserved, never auto-retried
    ProofOrProtocol,
    /// Rate limit, unavailable, timeout
    TransientNetwork,
    Internal,
}

/// Backend error types
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Invalid amount")]
    InvalidAmount,

    #[error("Invalid account: {0}")]
    InvalidAccount(String),

    #[error("Invalid Creator Address: Must be a Solana Public Key, .sol, or .stealth domain")]
    InvalidAddress(String),

    #[error("Invalid handle: {0}")]
    InvalidHandle(#[from] HandleError),

    #[error("Could not resolve .sol domain: {domain}")]
    DomainResolution { domain: String, reason: String },

    #[error("Could not resolve .stealth domain: {handle}. Ensure it is registered.")]
    HandleNotRegistered { handle: String },

    #[error("Could not resolve .stealth domain: {handle}. Registry record is malformed ({source})")]
    MalformedRegistryRecord {
        handle: String,
        #[source]
        source: CodecError,
    },

    #[error("Handle \"{0}.stealth\" is already registered")]
    HandleTaken(String),

    #[error("Server Configuration Error: {0}")]
    Configuration(String),

    #[error("No compatible state trees available for shielding. Please try again later.")]
    NoCompatibleTree,

    #[error("No shielded funds found to unshield: {0}")]
    NoFunds(String),

    #[error("Malformed compressed account: {0}")]
    MalformedAccount(String),

    #[error("Identity derivation failed: {0}")]
    IdentityDerivation(String),

    #[error("Transaction rejected: {message}")]
    Protocol { message: String, logs: Vec<String> },

    #[error("{kind} error: {message}")]
    Transient { kind: TransientKind, message: String },

    #[error("Transaction {signature} was not confirmed before its blockhash expired")]
    ConfirmationExpired { signature: String },

    #[error("An unknown error occurred: {0}")]
    Unknown(String),

    #[error("Another operation is already in progress")]
    FlowBusy,

    #[error("Invalid flow transition from {from} to {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BackendError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            BackendError::InvalidAmount
            | BackendError::InvalidAccount(_)
            | BackendError::InvalidAddress(_)
            | BackendError::InvalidHandle(_)
            | BackendError::HandleTaken(_)
            | BackendError::IdentityDerivation(_) => ErrorCategory::InvalidInput,
            BackendError::DomainResolution { .. }
            | BackendError::HandleNotRegistered { .. }
            | BackendError::MalformedRegistryRecord { .. } => ErrorCategory::ResolutionFailure,
            BackendError::Configuration(_) => ErrorCategory::Configuration,
            BackendError::NoCompatibleTree | BackendError::NoFunds(_) => {
                ErrorCategory::TreeIncompatibility
            }
            BackendError::MalformedAccount(_) | BackendError::Protocol { .. } => {
                ErrorCategory::ProofOrProtocol
            }
            BackendError::Transient { .. } | BackendError::ConfirmationExpired { .. } => {
                ErrorCategory::TransientNetwork
            }
            BackendError::Unknown(_)
            | BackendError::FlowBusy
            | BackendError::InvalidTransition { .. }
            | BackendError::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// Whether the user should be offered a manual retry
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::TransientNetwork | ErrorCategory::TreeIncompatibility
        )
    }

    /// Ledger diagnostics kept for support, if any
    pub fn logs(&self) -> &[String] {
        match self {
            BackendError::Protocol { logs, .. } => logs,
            _ => &[],
        }
    }

    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            BackendError::InvalidAmount => (StatusCode::BAD_REQUEST, "INVALID_AMOUNT"),
            BackendError::InvalidAccount(_) => (StatusCode::BAD_REQUEST, "INVALID_ACCOUNT"),
            BackendError::InvalidAddress(_) => (StatusCode::BAD_REQUEST, "INVALID_ADDRESS"),
            BackendError::InvalidHandle(_) => (StatusCode::BAD_REQUEST, "INVALID_HANDLE"),
            BackendError::HandleTaken(_) => (StatusCode::BAD_REQUEST, "HANDLE_TAKEN"),
            BackendError::DomainResolution { .. } => {
                (StatusCode::BAD_REQUEST, "DOMAIN_RESOLUTION_FAILED")
            }
            BackendError::HandleNotRegistered { .. } => {
                (StatusCode::BAD_REQUEST, "HANDLE_NOT_REGISTERED")
            }
            BackendError::MalformedRegistryRecord { .. } => {
                (StatusCode::BAD_REQUEST, "MALFORMED_REGISTRY_RECORD")
            }
            BackendError::Configuration(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "CONFIGURATION_ERROR")
            }
            BackendError::NoCompatibleTree => {
                (StatusCode::SERVICE_UNAVAILABLE, "NO_COMPATIBLE_TREE")
            }
            BackendError::NoFunds(_) => (StatusCode::SERVICE_UNAVAILABLE, "NO_FUNDS"),
            BackendError::MalformedAccount(_) => (StatusCode::BAD_GATEWAY, "MALFORMED_ACCOUNT"),
            BackendError::Protocol { .. } => (StatusCode::BAD_GATEWAY, "PROTOCOL_ERROR"),
            BackendError::Transient { kind, .. } => match kind {
                TransientKind::RateLimited => (StatusCode::TOO_MANY_REQUESTS, "RATE_LIMITED"),
                TransientKind::ServiceUnavailable => {
                    (StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE")
                }
                TransientKind::Network => (StatusCode::GATEWAY_TIMEOUT, "NETWORK_ERROR"),
            },
            BackendError::ConfirmationExpired { .. } => {
                (StatusCode::GATEWAY_TIMEOUT, "CONFIRMATION_EXPIRED")
            }
            BackendError::FlowBusy => (StatusCode::CONFLICT, "FLOW_BUSY"),
            BackendError::InvalidTransition { .. } => (StatusCode::CONFLICT, "INVALID_TRANSITION"),
            BackendError::IdentityDerivation(_) => {
                (StatusCode::BAD_REQUEST, "IDENTITY_DERIVATION_FAILED")
            }
            BackendError::Unknown(_) => (StatusCode::INTERNAL_SERVER_ERROR, "UNKNOWN_ERROR"),
            BackendError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl IntoResponse for BackendError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();

        let body = Json(ErrorResponse {
            error: self.to_string(),
            code: code.to_string(),
        });

        (status, body).into_response()
    }
}

impl From<anyhow::Error> for BackendError {
    fn from(err: anyhow::Error) -> Self {
        BackendError::Internal(err.to_string())
    }
}

/// Result type alias for backend operations
pub type Result<T> = std::result::Result<T, BackendError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_follow_taxonomy() {
        assert_eq!(
            BackendError::InvalidAmount.status_and_code().0,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            BackendError::Configuration("Missing RPC URL".into())
                .status_and_code()
                .0,
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            BackendError::NoCompatibleTree.status_and_code().0,
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            BackendError::HandleNotRegistered {
                handle: "alice.stealth".into()
            }
            .status_and_code()
            .0,
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_signer_refusal_is_a_client_error() {
        let err = BackendError::IdentityDerivation("signer declined".into());
        assert_eq!(err.category(), ErrorCategory::InvalidInput);
        assert_eq!(
            err.status_and_code(),
            (StatusCode::BAD_REQUEST, "IDENTITY_DERIVATION_FAILED")
        );
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_messages_name_the_handle() {
        let err = BackendError::DomainResolution {
            domain: "alice.sol".into(),
            reason: "Domain has no owner".into(),
        };
        assert_eq!(err.to_string(), "Could not resolve .sol domain: alice.sol");

        let err = BackendError::HandleNotRegistered {
            handle: "bob.stealth".into(),
        };
        assert!(err.to_string().contains("bob.stealth"));
    }

    #[test]
    fn test_retry_policy_by_category() {
        let transient = BackendError::Transient {
            kind: TransientKind::RateLimited,
            message: "429".into(),
        };
        assert!(transient.is_retryable());
        assert!(BackendError::NoCompatibleTree.is_retryable());
        assert!(!BackendError::InvalidAmount.is_retryable());
        assert!(!BackendError::Unknown("boom".into()).is_retryable());

        let protocol = BackendError::Protocol {
            message: "custom program error: 0x1".into(),
            logs: vec!["Program log: nullifier mismatch".into()],
        };
        assert!(!protocol.is_retryable());
        assert_eq!(protocol.logs().len(), 1);
        assert_eq!(protocol.category(), ErrorCategory::ProofOrProtocol);
    }
}
