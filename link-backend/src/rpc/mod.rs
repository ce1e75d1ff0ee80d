//! Ledger and indexer access
//!
//! Every component takes an [`RpcContext`] explicitly; nothing constructs its own client.

pub mod ledger;
pub mod photon;

#[cfg(test)]
pub(crate) mod mock;

use std::sync::Arc;

use async_trait::async_trait;
use solana_sdk::{hash::Hash, pubkey::Pubkey, signature::Signature, transaction::Transaction};
use thiserror::Error;

use crate::error::{BackendError, TransientKind};
use crate::types::{Config, ProofInput, TreeInfo, ValidityProof};

pub use ledger::SolanaLedger;
pub use photon::{PhotonIndexer, StateTreeSources};

/// Classified transport or ledger failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("network failure: {0}")]
    Network(String),

    /// The ledger or a program refused the request
    #[error("{message}")]
    Rejected { message: String, logs: Vec<String> },

    #[error("{0}")]
    Unknown(String),
}

impl RpcError {
    /// Classify a raw error message by the patterns RPC providers use
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();

        if lower.contains("429") || lower.contains("rate limit") || lower.contains("too many requests")
        {
            RpcError::RateLimited(message)
        } else if lower.contains("503")
            || lower.contains("502")
            || lower.contains("504")
            || lower.contains("unavailable")
        {
            RpcError::Unavailable(message)
        } else if lower.contains("timeout")
            || lower.contains("timed out")
            || lower.contains("connection")
            || lower.contains("network")
        {
            RpcError::Network(message)
        } else if lower.contains("custom program error")
            || lower.contains("instruction error")
            || lower.contains("invalid proof")
            || lower.contains("privilege")
            || lower.contains("missing required signature")
            || lower.contains("insufficient funds")
        {
            RpcError::Rejected {
                message,
                logs: Vec::new(),
            }
        } else {
            RpcError::Unknown(message)
        }
    }

    /// Classify by HTTP status before looking at the body
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        match status {
            429 => RpcError::RateLimited(body),
            502..=504 => RpcError::Unavailable(body),
            _ => RpcError::classify(format!("HTTP {status}: {body}")),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RpcError::RateLimited(_) | RpcError::Unavailable(_) | RpcError::Network(_)
        )
    }
}

impl From<RpcError> for BackendError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::RateLimited(message) => BackendError::Transient {
                kind: TransientKind::RateLimited,
                message,
            },
            RpcError::Unavailable(message) => BackendError::Transient {
                kind: TransientKind::ServiceUnavailable,
                message,
            },
            RpcError::Network(message) => BackendError::Transient {
                kind: TransientKind::Network,
                message,
            },
            RpcError::Rejected { message, logs } => BackendError::Protocol { message, logs },
            RpcError::Unknown(message) => BackendError::Unknown(message),
        }
    }
}

/// Observed state of a submitted signature
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureState {
    /// Not yet seen, or seen below the requested commitment
    Pending,
    Confirmed,
    /// Landed with an execution error
    Failed { error: String, logs: Vec<String> },
}

/// Plain ledger access
#[async_trait]
pub trait LedgerRpc: Send + Sync {
    /// Raw account data, `None` if the account does not exist
    async fn get_account_data(&self, address: &Pubkey) -> Result<Option<Vec<u8>>, RpcError>;

    /// Latest blockhash and the last block height it stays valid for
    async fn get_latest_blockhash(&self) -> Result<(Hash, u64), RpcError>;

    async fn get_block_height(&self) -> Result<u64, RpcError>;

    async fn get_balance(&self, address: &Pubkey) -> Result<u64, RpcError>;

    async fn get_minimum_balance_for_rent_exemption(&self, data_len: usize) -> Result<u64, RpcError>;

    /// Broadcast without pre-flight simulation
    async fn send_transaction(&self, transaction: &Transaction) -> Result<Signature, RpcError>;

    async fn get_signature_state(&self, signature: &Signature) -> Result<SignatureState, RpcError>;
}

/// Compression indexer access
#[async_trait]
pub trait CompressionIndexer: Send + Sync {
    async fn get_state_tree_infos(&self) -> Result<Vec<TreeInfo>, RpcError>;

    /// Raw records exactly as the indexer returns them; hydration happens downstream
    async fn get_compressed_accounts_by_owner(
        &self,
        owner: &Pubkey,
    ) -> Result<Vec<serde_json::Value>, RpcError>;

    async fn get_validity_proof(&self, inputs: &[ProofInput]) -> Result<ValidityProof, RpcError>;

    async fn get_compressed_balance_by_owner(&self, owner: &Pubkey) -> Result<u64, RpcError>;
}

/// Clients for one session, built once and shared by reference
#[derive(Clone)]
pub struct RpcContext {
    pub ledger: Arc<dyn LedgerRpc>,
    pub indexer: Arc<dyn CompressionIndexer>,
}

impl RpcContext {
    pub fn new(ledger: Arc<dyn LedgerRpc>, indexer: Arc<dyn CompressionIndexer>) -> Self {
        Self { ledger, indexer }
    }

    /// Build production clients; a missing RPC endpoint is a hard configuration error
    pub fn from_config(config: &Config) -> crate::error::Result<Self> {
        let rpc_url = config
            .rpc_url
            .as_deref()
            .ok_or_else(|| BackendError::Configuration("Missing RPC URL".to_string()))?;
        let indexer_url = config.indexer_url().unwrap_or(rpc_url);

        let ledger: Arc<dyn LedgerRpc> = Arc::new(SolanaLedger::new(rpc_url, config.max_send_retries));
        let indexer =
            PhotonIndexer::new(indexer_url, ledger.clone(), StateTreeSources::from(config))?;

        Ok(Self::new(ledger, Arc::new(indexer)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_rate_limit() {
        assert!(matches!(
            RpcError::classify("HTTP status client error (429 Too Many Requests)"),
            RpcError::RateLimited(_)
        ));
        assert!(matches!(RpcError::classify("Rate limit exceeded"), RpcError::RateLimited(_)));
    }

    #[test]
    fn test_classify_unavailable_and_network() {
        assert!(matches!(
            RpcError::classify("503 Service Unavailable"),
            RpcError::Unavailable(_)
        ));
        assert!(matches!(
            RpcError::classify("operation timed out"),
            RpcError::Network(_)
        ));
        assert!(matches!(
            RpcError::classify("error sending request: connection reset"),
            RpcError::Network(_)
        ));
    }

    #[test]
    fn test_classify_rejection_and_unknown() {
        assert!(matches!(
            RpcError::classify("Transaction simulation failed: custom program error: 0x1771"),
            RpcError::Rejected { .. }
        ));
        let unknown = RpcError::classify("something odd");
        assert_eq!(unknown, RpcError::Unknown("something odd".into()));
        assert!(!unknown.is_retryable());
    }

    #[test]
    fn test_from_status() {
        assert!(matches!(RpcError::from_status(429, ""), RpcError::RateLimited(_)));
        assert!(matches!(RpcError::from_status(503, ""), RpcError::Unavailable(_)));
        assert!(RpcError::from_status(504, "").is_retryable());
        assert!(!RpcError::from_status(400, "bad params").is_retryable());
    }

    #[test]
    fn test_conversion_keeps_logs() {
        let err: BackendError = RpcError::Rejected {
            message: "privilege escalation".into(),
            logs: vec!["Program log: writable privilege escalated".into()],
        }
        .into();
        assert_eq!(err.logs(), ["Program log: writable privilege escalated".to_string()]);
    }

    #[test]
    fn test_missing_rpc_url_is_configuration_error() {
        let result = RpcContext::from_config(&Config::default());
        assert!(matches!(result, Err(BackendError::Configuration(_))));
    }
}
