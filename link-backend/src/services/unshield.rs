//! Withdrawal path: aggregate pooled accounts, prove, decompress, patch permissions

use solana_sdk::{
    instruction::{AccountMeta, Instruction},
    pubkey::Pubkey,
    system_instruction,
};
use tracing::{info, warn};

use crate::compression::{decompress_instruction, system_program_ids, DecompressParams};
use crate::error::{BackendError, Result};
use crate::rpc::RpcContext;
use crate::services::hydrator::{classify, hydrate_all, TreeCompatibility};
use crate::types::{PooledAccount, ProofInput};

/// Which identity a candidate owner key stands for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityRole {
    /// Derived identity held in memory
    Stealth,
    /// Connected wallet
    Wallet,
}

#[derive(Debug, Clone, Default)]
pub struct UnshieldRequest {
    /// Fee payer and default destination
    pub wallet: Pubkey,
    pub stealth: Option<Pubkey>,
    /// Payout key recorded in the registry, if the caller looked it up
    pub registry_destination: Option<Pubkey>,
    /// Authority recorded in the registry
    pub registry_authority: Option<Pubkey>,
    /// Withdrawal target; defaults to `wallet`
    pub destination: Option<Pubkey>,
}

/// Everything needed to assemble one withdrawal
#[derive(Debug, Clone)]
pub struct UnshieldPlan {
    pub authority: Pubkey,
    pub role: IdentityRole,
    pub inputs: Vec<PooledAccount>,
    pub total_lamports: u64,
    pub destination: Pubkey,
    /// Rent top-up for a derived authority, prepended by the assembler
    pub funding: Option<Instruction>,
    /// Permission-patched decompress instruction
    pub instruction: Instruction,
    /// Accounts left behind because their tree version is unsupported
    pub skipped: usize,
}

/// Grant write access to every non-signer account outside `allow_list`.
///
/// Trees, queues and CPI contexts are written while nullifying, whatever the
/// raw builder declared. Monotonic: writable accounts stay writable.
pub fn patch_account_permissions(metas: &[AccountMeta], allow_list: &[Pubkey]) -> Vec<AccountMeta> {
    metas
        .iter()
        .map(|meta| {
            if meta.is_signer || meta.is_writable || allow_list.contains(&meta.pubkey) {
                return meta.clone();
            }
            warn!(account = %meta.pubkey, "Upgrading account to writable");
            AccountMeta {
                is_writable: true,
                ..meta.clone()
            }
        })
        .collect()
}

pub fn patch_instruction(instruction: Instruction) -> Instruction {
    let accounts = patch_account_permissions(&instruction.accounts, &system_program_ids());
    Instruction {
        accounts,
        ..instruction
    }
}

/// Checked sum; wrapping would create value out of nothing
pub fn total_lamports(accounts: &[PooledAccount]) -> Result<u64> {
    accounts.iter().try_fold(0u64, |sum, account| {
        sum.checked_add(account.lamports)
            .ok_or_else(|| BackendError::Internal("Lamport total overflows u64".to_string()))
    })
}

pub struct UnshieldAggregator<'a> {
    ctx: &'a RpcContext,
    rent_safety_margin_lamports: u64,
}

impl<'a> UnshieldAggregator<'a> {
    pub fn new(ctx: &'a RpcContext, rent_safety_margin_lamports: u64) -> Self {
        Self {
            ctx,
            rent_safety_margin_lamports,
        }
    }

    /// Candidate owners in priority order. Only keys we can sign for are listed.
    fn candidates(request: &UnshieldRequest) -> Vec<(Pubkey, IdentityRole)> {
        let mut candidates = Vec::with_capacity(2);
        if let Some(stealth) = request.stealth {
            candidates.push((stealth, IdentityRole::Stealth));
        }
        if !candidates.iter().any(|(key, _)| *key == request.wallet) {
            candidates.push((request.wallet, IdentityRole::Wallet));
        }

        // The recorded destination is authoritative; disagreement is flagged, never resolved silently
        if let Some(destination) = request.registry_destination {
            if !candidates.iter().any(|(key, _)| *key == destination) {
                warn!(
                    destination = %destination,
                    "Registry destination has no local signer and is skipped"
                );
            } else if request.stealth.is_some_and(|stealth| stealth != destination) {
                warn!(
                    destination = %destination,
                    "Registry destination differs from the derived stealth identity"
                );
            }
        }
        if let Some(authority) = request.registry_authority {
            if authority != request.wallet {
                warn!(authority = %authority, wallet = %request.wallet, "Registry authority is not the connected wallet");
            }
        }

        candidates
    }

    pub async fn plan(&self, request: &UnshieldRequest) -> Result<UnshieldPlan> {
        let mut skipped = 0;
        let mut chosen: Option<(Pubkey, IdentityRole, Vec<PooledAccount>)> = None;

        for (owner, role) in Self::candidates(request) {
            let raw = self.ctx.indexer.get_compressed_accounts_by_owner(&owner).await?;
            let accounts = hydrate_all(&raw)?;
            let fetched = accounts.len();

            let usable: Vec<PooledAccount> = accounts
                .into_iter()
                .filter(|account| match classify(account) {
                    TreeCompatibility::Supported => true,
                    TreeCompatibility::Unsupported(tree_type) => {
                        warn!(
                            owner = %owner,
                            ?tree_type,
                            lamports = account.lamports,
                            "Skipping pooled account in unsupported tree"
                        );
                        false
                    }
                    TreeCompatibility::Unknown => {
                        warn!(owner = %owner, "Skipping pooled account without tree info");
                        false
                    }
                })
                .collect();

            skipped += fetched - usable.len();
            info!(owner = %owner, ?role, fetched, usable = usable.len(), "Fetched pooled accounts");

            // One owner per instruction
            if !usable.is_empty() {
                chosen = Some((owner, role, usable));
                break;
            }
        }

        let Some((authority, role, inputs)) = chosen else {
            return Err(BackendError::NoFunds(if skipped > 0 {
                format!("{skipped} account(s) sit in unsupported trees")
            } else {
                "no pooled accounts for any identity".to_string()
            }));
        };

        let proof_inputs: Vec<ProofInput> = inputs
            .iter()
            .filter_map(|account| {
                account.tree_info.map(|info| ProofInput {
                    hash: account.hash,
                    tree: info.tree,
                    queue: info.queue,
                })
            })
            .collect();

        let proof = self.ctx.indexer.get_validity_proof(&proof_inputs).await?;

        let total = total_lamports(&inputs)?;
        let destination = request.destination.unwrap_or(request.wallet);

        let raw = decompress_instruction(DecompressParams {
            fee_payer: request.wallet,
            authority,
            inputs: &inputs,
            proof: &proof,
            recipient: destination,
            lamports: total,
        })?;
        let instruction = patch_instruction(raw);

        let funding = match role {
            IdentityRole::Stealth => self.rent_funding(&request.wallet, &authority).await?,
            IdentityRole::Wallet => None,
        };

        info!(
            authority = %authority,
            destination = %destination,
            inputs = inputs.len(),
            total_lamports = total,
            funded = funding.is_some(),
            "Planned withdrawal"
        );

        Ok(UnshieldPlan {
            authority,
            role,
            inputs,
            total_lamports: total,
            destination,
            funding,
            instruction,
            skipped,
        })
    }

    /// Transfer from `payer` that lifts `identity` to rent exemption plus a margin
    async fn rent_funding(&self, payer: &Pubkey, identity: &Pubkey) -> Result<Option<Instruction>> {
        let minimum = self.ctx.ledger.get_minimum_balance_for_rent_exemption(0).await?;
        let balance = self.ctx.ledger.get_balance(identity).await?;

        if balance >= minimum {
            return Ok(None);
        }

        let lamports = minimum.saturating_add(self.rent_safety_margin_lamports);
        info!(identity = %identity, balance, lamports, "Funding derived identity for rent");
        Ok(Some(system_instruction::transfer(payer, identity, lamports)))
    }
}
