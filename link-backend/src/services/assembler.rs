//! Message composition, signing, submission and confirmation

use std::time::Duration;

use solana_sdk::{
    compute_budget::ComputeBudgetInstruction,
    hash::Hash,
    instruction::Instruction,
    message::Message,
    signature::Signature,
    signer::Signer,
    transaction::Transaction,
};
use tracing::{debug, info, warn};

use crate::error::{BackendError, Result};
use crate::rpc::{RpcContext, SignatureState};
use crate::types::Config;

/// Bounded exponential backoff for raw submission
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 250,
            max_delay_ms: 4_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let delay_ms =
            (self.initial_delay_ms as f64 * self.backoff_multiplier.powi(attempt as i32)) as u64;
        Duration::from_millis(delay_ms.min(self.max_delay_ms))
    }
}

#[derive(Debug, Clone)]
pub struct AssemblerConfig {
    pub compute_unit_limit: u32,
    pub compute_unit_price_micro_lamports: u64,
    pub retry: RetryPolicy,
    pub confirm_poll_interval: Duration,
}

impl From<&Config> for AssemblerConfig {
    fn from(config: &Config) -> Self {
        Self {
            compute_unit_limit: config.compute_unit_limit,
            compute_unit_price_micro_lamports: config.compute_unit_price_micro_lamports,
            retry: RetryPolicy {
                max_retries: config.max_send_retries,
                ..RetryPolicy::default()
            },
            confirm_poll_interval: Duration::from_millis(config.confirm_poll_interval_ms),
        }
    }
}

/// Signed transaction plus the window its blockhash is valid for
pub struct AssembledTransaction {
    pub transaction: Transaction,
    pub last_valid_block_height: u64,
}

impl AssembledTransaction {
    pub fn signature(&self) -> Signature {
        self.transaction.signatures.first().copied().unwrap_or_default()
    }
}

pub struct TransactionAssembler<'a> {
    ctx: &'a RpcContext,
    config: AssemblerConfig,
}

impl<'a> TransactionAssembler<'a> {
    pub fn new(ctx: &'a RpcContext, config: AssemblerConfig) -> Self {
        Self { ctx, config }
    }

    /// `[compute limit, compute price, funding?, domain]`, in that order
    pub fn compose(&self, funding: Option<Instruction>, domain: Instruction) -> Vec<Instruction> {
        let mut instructions = vec![
            ComputeBudgetInstruction::set_compute_unit_limit(self.config.compute_unit_limit),
            ComputeBudgetInstruction::set_compute_unit_price(
                self.config.compute_unit_price_micro_lamports,
            ),
        ];
        instructions.extend(funding);
        instructions.push(domain);
        instructions
    }

    /// Compile against a fresh blockhash and sign: secondary authority first, then the fee payer
    pub async fn assemble(
        &self,
        payer: &dyn Signer,
        secondary: Option<&dyn Signer>,
        funding: Option<Instruction>,
        domain: Instruction,
    ) -> Result<AssembledTransaction> {
        let instructions = self.compose(funding, domain);
        let (blockhash, last_valid_block_height) = self.ctx.ledger.get_latest_blockhash().await?;

        let payer_key = payer.pubkey();
        let message = Message::new_with_blockhash(&instructions, Some(&payer_key), &blockhash);
        let mut transaction = Transaction::new_unsigned(message);

        if let Some(secondary) = secondary {
            sign_with(&mut transaction, secondary, blockhash)?;
        }
        sign_with(&mut transaction, payer, blockhash)?;

        if !transaction.is_signed() {
            return Err(BackendError::Internal(
                "Transaction is missing required signatures".to_string(),
            ));
        }

        debug!(
            payer = %payer_key,
            instructions = instructions.len(),
            last_valid_block_height,
            "Assembled transaction"
        );

        Ok(AssembledTransaction {
            transaction,
            last_valid_block_height,
        })
    }

    /// Broadcast, retrying only transient failures. Before every resend the
    /// original signature is checked so a landed transaction is never resent.
    pub async fn send(&self, assembled: &AssembledTransaction) -> Result<Signature> {
        let signature = assembled.signature();
        let policy = &self.config.retry;
        let mut attempt = 0;

        loop {
            match self.ctx.ledger.send_transaction(&assembled.transaction).await {
                Ok(sent) => {
                    info!(signature = %sent, attempt, "Transaction sent");
                    return Ok(sent);
                }
                Err(err) if err.is_retryable() && attempt < policy.max_retries => {
                    let delay = policy.delay_for_attempt(attempt);
                    warn!(
                        signature = %signature,
                        attempt,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "Send failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;

                    if let Ok(state) = self.ctx.ledger.get_signature_state(&signature).await {
                        if state != SignatureState::Pending {
                            info!(signature = %signature, "Transaction already landed, not resending");
                            return Ok(signature);
                        }
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Poll the original signature until confirmed, failed, or the blockhash window closes
    pub async fn confirm(&self, signature: &Signature, last_valid_block_height: u64) -> Result<()> {
        let policy = &self.config.retry;
        // Consecutive failed height reads
        let mut height_failures = 0;

        loop {
            match self.ctx.ledger.get_signature_state(signature).await {
                Ok(SignatureState::Confirmed) => {
                    info!(signature = %signature, "Transaction confirmed");
                    return Ok(());
                }
                Ok(SignatureState::Failed { error, logs }) => {
                    warn!(signature = %signature, error = %error, "Transaction failed on-ledger");
                    return Err(BackendError::Protocol {
                        message: error,
                        logs,
                    });
                }
                Ok(SignatureState::Pending) => {}
                Err(err) if err.is_retryable() => {
                    debug!(signature = %signature, error = %err, "Status poll failed, polling again");
                }
                Err(err) => return Err(err.into()),
            }

            let height = match self.ctx.ledger.get_block_height().await {
                Ok(height) => {
                    height_failures = 0;
                    height
                }
                Err(err) if err.is_retryable() && height_failures < policy.max_retries => {
                    let delay = policy.delay_for_attempt(height_failures);
                    debug!(
                        signature = %signature,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "Block height read failed, polling again"
                    );
                    height_failures += 1;
                    tokio::time::sleep(delay).await;
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            if height > last_valid_block_height {
                return Err(BackendError::ConfirmationExpired {
                    signature: signature.to_string(),
                });
            }

            tokio::time::sleep(self.config.confirm_poll_interval).await;
        }
    }

    /// Assemble, send and confirm in one go
    pub async fn submit(
        &self,
        payer: &dyn Signer,
        secondary: Option<&dyn Signer>,
        funding: Option<Instruction>,
        domain: Instruction,
    ) -> Result<Signature> {
        let assembled = self.assemble(payer, secondary, funding, domain).await?;
        let signature = self.send(&assembled).await?;
        self.confirm(&signature, assembled.last_valid_block_height).await?;
        Ok(signature)
    }
}

fn sign_with(transaction: &mut Transaction, signer: &dyn Signer, blockhash: Hash) -> Result<()> {
    let signers: Vec<&dyn Signer> = vec![signer];
    transaction
        .try_partial_sign(&signers, blockhash)
        .map_err(|e| BackendError::Internal(format!("Failed to sign transaction: {e}")))
}
