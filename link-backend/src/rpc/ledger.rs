//! Ledger RPC backed by the nonblocking `solana-client`

use async_trait::async_trait;
use solana_client::{
    client_error::{ClientError, ClientErrorKind},
    nonblocking::rpc_client::RpcClient,
    rpc_config::RpcSendTransactionConfig,
    rpc_request::{RpcError as ClientRpcError, RpcResponseErrorData},
};
use solana_sdk::{
    commitment_config::CommitmentConfig, hash::Hash, pubkey::Pubkey, signature::Signature,
    transaction::Transaction,
};
use tracing::debug;

use super::{LedgerRpc, RpcError, SignatureState};

pub struct SolanaLedger {
    client: RpcClient,
    max_retries: usize,
}

impl SolanaLedger {
    pub fn new(url: &str, max_retries: usize) -> Self {
        Self {
            client: RpcClient::new_with_commitment(url.to_string(), CommitmentConfig::confirmed()),
            max_retries,
        }
    }
}

#[async_trait]
impl LedgerRpc for SolanaLedger {
    async fn get_account_data(&self, address: &Pubkey) -> Result<Option<Vec<u8>>, RpcError> {
        let response = self
            .client
            .get_account_with_commitment(address, CommitmentConfig::confirmed())
            .await
            .map_err(map_client_error)?;
        Ok(response.value.map(|account| account.data))
    }

    async fn get_latest_blockhash(&self) -> Result<(Hash, u64), RpcError> {
        self.client
            .get_latest_blockhash_with_commitment(CommitmentConfig::confirmed())
            .await
            .map_err(map_client_error)
    }

    async fn get_block_height(&self) -> Result<u64, RpcError> {
        self.client.get_block_height().await.map_err(map_client_error)
    }

    async fn get_balance(&self, address: &Pubkey) -> Result<u64, RpcError> {
        self.client.get_balance(address).await.map_err(map_client_error)
    }

    async fn get_minimum_balance_for_rent_exemption(&self, data_len: usize) -> Result<u64, RpcError> {
        self.client
            .get_minimum_balance_for_rent_exemption(data_len)
            .await
            .map_err(map_client_error)
    }

    async fn send_transaction(&self, transaction: &Transaction) -> Result<Signature, RpcError> {
        let config = RpcSendTransactionConfig {
            skip_preflight: true,
            max_retries: Some(self.max_retries),
            ..RpcSendTransactionConfig::default()
        };
        self.client
            .send_transaction_with_config(transaction, config)
            .await
            .map_err(map_client_error)
    }

    async fn get_signature_state(&self, signature: &Signature) -> Result<SignatureState, RpcError> {
        let response = self
            .client
            .get_signature_statuses(&[*signature])
            .await
            .map_err(map_client_error)?;

        let Some(Some(status)) = response.value.into_iter().next() else {
            return Ok(SignatureState::Pending);
        };

        if let Some(err) = status.err.as_ref() {
            return Ok(SignatureState::Failed {
                error: err.to_string(),
                logs: Vec::new(),
            });
        }

        if status.satisfies_commitment(CommitmentConfig::confirmed()) {
            Ok(SignatureState::Confirmed)
        } else {
            Ok(SignatureState::Pending)
        }
    }
}

fn map_client_error(err: ClientError) -> RpcError {
    debug!(error = %err, "ledger rpc call failed");

    match err.kind() {
        ClientErrorKind::Reqwest(inner) => {
            if let Some(status) = inner.status() {
                return RpcError::from_status(status.as_u16(), inner.to_string());
            }
            if inner.is_timeout() || inner.is_connect() {
                return RpcError::Network(inner.to_string());
            }
            RpcError::classify(inner.to_string())
        }
        ClientErrorKind::RpcError(ClientRpcError::RpcResponseError { message, data, .. }) => {
            let logs = match data {
                RpcResponseErrorData::SendTransactionPreflightFailure(simulation) => {
                    simulation.logs.clone().unwrap_or_default()
                }
                _ => Vec::new(),
            };
            match RpcError::classify(message.clone()) {
                RpcError::Rejected { message, .. } | RpcError::Unknown(message) if !logs.is_empty() => {
                    RpcError::Rejected { message, logs }
                }
                other => other,
            }
        }
        _ => RpcError::classify(err.to_string()),
    }
}
