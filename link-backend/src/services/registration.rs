//! Registry instructions and the handle registration flow

use solana_sdk::{
    instruction::{AccountMeta, Instruction},
    pubkey::Pubkey,
    signature::Signature,
    signer::Signer,
    system_program,
};
use tracing::info;

use crate::codec::{
    encode_register_payload, encode_update_authority_payload, registry_entry_address,
    validate_handle,
};
use crate::error::{BackendError, Result};
use crate::rpc::RpcContext;
use crate::services::assembler::{AssemblerConfig, TransactionAssembler};

/// `register(handle, destination)` signed by `authority`
pub fn register_instruction(
    program_id: &Pubkey,
    authority: &Pubkey,
    handle: &str,
    destination: &Pubkey,
) -> Result<Instruction> {
    let (entry, _) = registry_entry_address(program_id, handle);
    let data = encode_register_payload(handle, destination)
        .map_err(|e| BackendError::Internal(e.to_string()))?;
    Ok(Instruction {
        program_id: *program_id,
        accounts: vec![
            AccountMeta::new(*authority, true),
            AccountMeta::new(entry, false),
            AccountMeta::new_readonly(system_program::id(), false),
        ],
        data,
    })
}

/// `update_authority(handle, new_authority)` signed by the current authority
pub fn update_authority_instruction(
    program_id: &Pubkey,
    authority: &Pubkey,
    handle: &str,
    new_authority: &Pubkey,
) -> Result<Instruction> {
    let (entry, _) = registry_entry_address(program_id, handle);
    let data = encode_update_authority_payload(handle, new_authority)
        .map_err(|e| BackendError::Internal(e.to_string()))?;
    Ok(Instruction {
        program_id: *program_id,
        accounts: vec![
            AccountMeta::new(entry, false),
            AccountMeta::new_readonly(*authority, true),
        ],
        data,
    })
}

pub struct RegistrationBuilder<'a> {
    ctx: &'a RpcContext,
    program_id: Pubkey,
    assembler: AssemblerConfig,
}

impl<'a> RegistrationBuilder<'a> {
    pub fn new(ctx: &'a RpcContext, program_id: Pubkey, assembler: AssemblerConfig) -> Self {
        Self {
            ctx,
            program_id,
            assembler,
        }
    }

    /// Validate and check availability, returning the instruction to submit
    pub async fn prepare(&self, wallet: &Pubkey, handle: &str, destination: &Pubkey) -> Result<Instruction> {
        validate_handle(handle)?;

        let (entry, _) = registry_entry_address(&self.program_id, handle);
        if self.ctx.ledger.get_account_data(&entry).await?.is_some() {
            return Err(BackendError::HandleTaken(handle.to_string()));
        }

        register_instruction(&self.program_id, wallet, handle, destination)
    }

    /// Register `handle` with payouts going to `destination` (the stealth identity)
    pub async fn register(&self, wallet: &dyn Signer, handle: &str, destination: &Pubkey) -> Result<Signature> {
        let instruction = self.prepare(&wallet.pubkey(), handle, destination).await?;

        let signature = TransactionAssembler::new(self.ctx, self.assembler.clone())
            .submit(wallet, None, None, instruction)
            .await?;

        info!(
            handle,
            destination = %destination,
            signature = %signature,
            "Registered handle"
        );
        Ok(signature)
    }

    pub async fn transfer_authority(
        &self,
        authority: &dyn Signer,
        handle: &str,
        new_authority: &Pubkey,
    ) -> Result<Signature> {
        validate_handle(handle)?;
        let instruction = update_authority_instruction(
            &self.program_id,
            &authority.pubkey(),
            handle,
            new_authority,
        )?;

        let signature = TransactionAssembler::new(self.ctx, self.assembler.clone())
            .submit(authority, None, None, instruction)
            .await?;

        info!(handle, new_authority = %new_authority, signature = %signature, "Transferred handle authority");
        Ok(signature)
    }
}
