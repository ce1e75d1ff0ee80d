//! `.sol` domain lookup through the SPL Name Service

use std::sync::Arc;

use async_trait::async_trait;
use solana_sdk::{hash::hashv, pubkey, pubkey::Pubkey};
use tracing::{info, warn};

use crate::error::{BackendError, Result};
use crate::rpc::{LedgerRpc, RpcError};

pub const NAME_PROGRAM_ID: Pubkey = pubkey!("namesLPneVptA9Z5rqUDD9tMTWEJwofgaYwp8cawRkX");

/// Parent of every `.sol` name account
pub const SOL_TLD_ROOT: Pubkey = pubkey!("58PwtjSDuFHuUkYjH9BYnnQKHfwo9reZhC2zMJv9JPkx");

const HASH_PREFIX: &str = "SPL Name Service";

/// Name account header: parent, owner, class
const HEADER_LEN: usize = 96;

/// Resolves a domain to the key that owns it
#[async_trait]
pub trait DomainResolver: Send + Sync {
    async fn resolve_owner(&self, domain: &str) -> Result<Pubkey>;
}

pub fn hashed_name(label: &str) -> [u8; 32] {
    hashv(&[HASH_PREFIX.as_bytes(), label.as_bytes()]).to_bytes()
}

/// Name account for a second-level `.sol` label
pub fn name_account_key(label: &str) -> Pubkey {
    let hashed = hashed_name(label);
    let class = Pubkey::default();
    Pubkey::find_program_address(
        &[hashed.as_ref(), class.as_ref(), SOL_TLD_ROOT.as_ref()],
        &NAME_PROGRAM_ID,
    )
    .0
}

pub struct SnsResolver {
    ledger: Arc<dyn LedgerRpc>,
}

impl SnsResolver {
    pub fn new(ledger: Arc<dyn LedgerRpc>) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl DomainResolver for SnsResolver {
    async fn resolve_owner(&self, domain: &str) -> Result<Pubkey> {
        let failed = |reason: &str| BackendError::DomainResolution {
            domain: domain.to_string(),
            reason: reason.to_string(),
        };

        let lower = domain.to_lowercase();
        let label = lower.strip_suffix(".sol").unwrap_or(&lower);
        if label.is_empty() || label.contains('.') {
            return Err(failed("Only second-level .sol domains are supported"));
        }

        let name_account = name_account_key(label);

        let data = match self.ledger.get_account_data(&name_account).await {
            Ok(Some(data)) => data,
            Ok(None) => return Err(failed("Name account not found")),
            Err(err @ (RpcError::RateLimited(_) | RpcError::Unavailable(_) | RpcError::Network(_))) => {
                return Err(err.into())
            }
            Err(err) => {
                warn!(domain, error = %err, "Name account lookup failed");
                return Err(failed(&err.to_string()));
            }
        };

        if data.len() < HEADER_LEN {
            return Err(failed("Name account header truncated"));
        }

        let mut owner = [0u8; 32];
        owner.copy_from_slice(&data[32..64]);
        let owner = Pubkey::new_from_array(owner);

        if owner == Pubkey::default() {
            return Err(failed("Domain has no owner"));
        }

        info!(domain, owner = %owner, "Resolved .sol domain");
        Ok(owner)
    }
}
