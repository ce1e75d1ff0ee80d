//! In-memory ledger and indexer for unit tests

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use solana_sdk::{hash::Hash, pubkey::Pubkey, signature::Signature, transaction::Transaction};

use super::{CompressionIndexer, LedgerRpc, RpcError, SignatureState};
use crate::types::{ProofInput, TreeInfo, ValidityProof};

pub struct MockLedger {
    pub accounts: Mutex<HashMap<Pubkey, Vec<u8>>>,
    pub balances: Mutex<HashMap<Pubkey, u64>>,
    pub blockhash: Hash,
    pub last_valid_block_height: u64,
    pub block_height: Mutex<u64>,
    /// Errors handed out by successive `get_block_height` calls before heights resume
    pub block_height_errors: Mutex<VecDeque<RpcError>>,
    pub rent_exempt_minimum: u64,
    /// Results handed out by successive `send_transaction` calls; empty means success
    pub send_results: Mutex<VecDeque<Result<(), RpcError>>>,
    /// States handed out by successive status polls; empty means confirmed
    pub signature_states: Mutex<VecDeque<SignatureState>>,
    pub sent: Mutex<Vec<Transaction>>,
    pub status_polls: Mutex<usize>,
}

impl Default for MockLedger {
    fn default() -> Self {
        Self {
            accounts: Mutex::new(HashMap::new()),
            balances: Mutex::new(HashMap::new()),
            blockhash: Hash::new_unique(),
            last_valid_block_height: 1_000,
            block_height: Mutex::new(900),
            block_height_errors: Mutex::new(VecDeque::new()),
            rent_exempt_minimum: 890_880,
            send_results: Mutex::new(VecDeque::new()),
            signature_states: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
            status_polls: Mutex::new(0),
        }
    }
}

impl MockLedger {
    pub fn with_account(self, address: Pubkey, data: Vec<u8>) -> Self {
        self.accounts.lock().unwrap().insert(address, data);
        self
    }

    pub fn with_balance(self, address: Pubkey, lamports: u64) -> Self {
        self.balances.lock().unwrap().insert(address, lamports);
        self
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl LedgerRpc for MockLedger {
    async fn get_account_data(&self, address: &Pubkey) -> Result<Option<Vec<u8>>, RpcError> {
        Ok(self.accounts.lock().unwrap().get(address).cloned())
    }

    async fn get_latest_blockhash(&self) -> Result<(Hash, u64), RpcError> {
        Ok((self.blockhash, self.last_valid_block_height))
    }

    async fn get_block_height(&self) -> Result<u64, RpcError> {
        if let Some(err) = self.block_height_errors.lock().unwrap().pop_front() {
            return Err(err);
        }
        let mut height = self.block_height.lock().unwrap();
        *height += 1;
        Ok(*height)
    }

    async fn get_balance(&self, address: &Pubkey) -> Result<u64, RpcError> {
        Ok(self.balances.lock().unwrap().get(address).copied().unwrap_or(0))
    }

    async fn get_minimum_balance_for_rent_exemption(&self, _data_len: usize) -> Result<u64, RpcError> {
        Ok(self.rent_exempt_minimum)
    }

    async fn send_transaction(&self, transaction: &Transaction) -> Result<Signature, RpcError> {
        self.sent.lock().unwrap().push(transaction.clone());
        match self.send_results.lock().unwrap().pop_front() {
            Some(Err(err)) => Err(err),
            _ => Ok(transaction.signatures[0]),
        }
    }

    async fn get_signature_state(&self, _signature: &Signature) -> Result<SignatureState, RpcError> {
        *self.status_polls.lock().unwrap() += 1;
        Ok(self
            .signature_states
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(SignatureState::Confirmed))
    }
}

#[derive(Default)]
pub struct MockIndexer {
    pub trees: Vec<TreeInfo>,
    pub accounts: HashMap<Pubkey, Vec<Value>>,
    pub balances: HashMap<Pubkey, u64>,
    pub proof: Option<ValidityProof>,
    pub proof_requests: Mutex<Vec<Vec<ProofInput>>>,
    pub fetched_owners: Mutex<Vec<Pubkey>>,
}

impl MockIndexer {
    pub fn proof_request_count(&self) -> usize {
        self.proof_requests.lock().unwrap().len()
    }
}

#[async_trait]
impl CompressionIndexer for MockIndexer {
    async fn get_state_tree_infos(&self) -> Result<Vec<TreeInfo>, RpcError> {
        Ok(self.trees.clone())
    }

    async fn get_compressed_accounts_by_owner(&self, owner: &Pubkey) -> Result<Vec<Value>, RpcError> {
        self.fetched_owners.lock().unwrap().push(*owner);
        Ok(self.accounts.get(owner).cloned().unwrap_or_default())
    }

    async fn get_validity_proof(&self, inputs: &[ProofInput]) -> Result<ValidityProof, RpcError> {
        self.proof_requests.lock().unwrap().push(inputs.to_vec());
        Ok(self.proof.clone().unwrap_or(ValidityProof {
            compressed_proof: None,
            root_indices: vec![0; inputs.len()],
        }))
    }

    async fn get_compressed_balance_by_owner(&self, owner: &Pubkey) -> Result<u64, RpcError> {
        Ok(self.balances.get(owner).copied().unwrap_or(0))
    }
}
