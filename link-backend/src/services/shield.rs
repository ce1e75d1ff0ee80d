//! Deposit path: pick a V1 tree and build the compress transaction

use solana_sdk::{message::Message, pubkey::Pubkey, transaction::Transaction};
use tracing::{error, info};

use crate::compression::compress_instruction;
use crate::error::{BackendError, Result};
use crate::rpc::RpcContext;
use crate::types::{TreeInfo, LAMPORTS_PER_SOL};

/// Parsed donation amount
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Amount {
    pub sol: f64,
    pub lamports: u64,
}

/// Parse a SOL amount; fractions of a lamport are truncated
pub fn parse_amount(raw: &str) -> Result<Amount> {
    let sol: f64 = raw.trim().parse().map_err(|_| BackendError::InvalidAmount)?;
    if !sol.is_finite() || sol <= 0.0 {
        return Err(BackendError::InvalidAmount);
    }

    let lamports = (sol * LAMPORTS_PER_SOL as f64).floor();
    if lamports < 1.0 || lamports >= u64::MAX as f64 {
        return Err(BackendError::InvalidAmount);
    }

    Ok(Amount {
        sol,
        lamports: lamports as u64,
    })
}

/// First tree whose recorded version is supported for new deposits.
/// Never falls back to another version: those funds could not be withdrawn.
pub fn select_output_tree(trees: &[TreeInfo]) -> Result<TreeInfo> {
    trees
        .iter()
        .find(|tree| tree.tree_type.is_supported())
        .copied()
        .ok_or(BackendError::NoCompatibleTree)
}

pub struct ShieldBuilder<'a> {
    ctx: &'a RpcContext,
}

impl<'a> ShieldBuilder<'a> {
    pub fn new(ctx: &'a RpcContext) -> Self {
        Self { ctx }
    }

    /// Unsigned deposit transaction with `payer` as fee payer
    pub async fn build(&self, payer: &Pubkey, recipient: &Pubkey, lamports: u64) -> Result<Transaction> {
        let trees = self.ctx.indexer.get_state_tree_infos().await?;

        let output_tree = select_output_tree(&trees).inspect_err(|_| {
            error!(available = trees.len(), "No V1 state tree available, refusing to shield");
        })?;

        info!(
            tree = %output_tree.tree,
            queue = %output_tree.queue,
            "Selected output state tree"
        );

        let instruction = compress_instruction(payer, recipient, lamports, &output_tree)?;

        let (blockhash, _) = self.ctx.ledger.get_latest_blockhash().await?;
        let message = Message::new_with_blockhash(&[instruction], Some(payer), &blockhash);

        info!(
            payer = %payer,
            recipient = %recipient,
            lamports,
            "Built shield transaction"
        );

        Ok(Transaction::new_unsigned(message))
    }
}
