//! Compression system program `invoke` instruction
//!
//! Both deposits (compress) and withdrawals (decompress) go through the same
//! entrypoint: an Anchor discriminator followed by a Borsh `Vec<u8>` wrapping
//! the serialized [`InstructionDataInvoke`]. Trees and queues are passed as
//! remaining accounts and referenced by index.

use borsh::{BorshDeserialize, BorshSerialize};
use solana_sdk::{
    compute_budget,
    instruction::{AccountMeta, Instruction},
    pubkey,
    pubkey::Pubkey,
    system_program,
};

use crate::codec::instruction_discriminator;
use crate::error::{BackendError, Result};
use crate::types::{CompressedProof, PooledAccount, TreeInfo, ValidityProof};

pub const LIGHT_SYSTEM_PROGRAM_ID: Pubkey = pubkey!("SySTEM1eSU2p4BGQfQpimFEWWSC1XDFeun3Nqzz3rT7");
pub const ACCOUNT_COMPRESSION_PROGRAM_ID: Pubkey =
    pubkey!("compr6CUsB5m2jS4Y3831ztGSTnDpnKJTKS95d64XVq");
pub const NOOP_PROGRAM_ID: Pubkey = pubkey!("noopb9bkMVfRPU8AsbpTUg8AQkHtKwMYZiFUjNRtMmV");

const SOL_POOL_SEED: &[u8] = b"sol_pool_pda";
const CPI_AUTHORITY_SEED: &[u8] = b"cpi_authority";

pub fn sol_pool_pda() -> Pubkey {
    Pubkey::find_program_address(&[SOL_POOL_SEED], &LIGHT_SYSTEM_PROGRAM_ID).0
}

pub fn account_compression_authority() -> Pubkey {
    Pubkey::find_program_address(&[CPI_AUTHORITY_SEED], &LIGHT_SYSTEM_PROGRAM_ID).0
}

/// Registration of the system program with the account compression program
pub fn registered_program_pda() -> Pubkey {
    Pubkey::find_program_address(
        &[LIGHT_SYSTEM_PROGRAM_ID.as_ref()],
        &ACCOUNT_COMPRESSION_PROGRAM_ID,
    )
    .0
}

/// Program and static protocol accounts that never need write access
pub fn system_program_ids() -> Vec<Pubkey> {
    vec![
        system_program::id(),
        compute_budget::id(),
        LIGHT_SYSTEM_PROGRAM_ID,
        ACCOUNT_COMPRESSION_PROGRAM_ID,
        NOOP_PROGRAM_ID,
        registered_program_pda(),
        account_compression_authority(),
    ]
}

// ============ Wire types ============

#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct CompressedAccountData {
    pub discriminator: [u8; 8],
    pub data: Vec<u8>,
    pub data_hash: [u8; 32],
}

#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct CompressedAccount {
    pub owner: [u8; 32],
    pub lamports: u64,
    pub address: Option<[u8; 32]>,
    pub data: Option<CompressedAccountData>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct PackedMerkleContext {
    pub merkle_tree_pubkey_index: u8,
    pub nullifier_queue_pubkey_index: u8,
    pub leaf_index: u32,
    pub prove_by_index: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct PackedCompressedAccountWithMerkleContext {
    pub compressed_account: CompressedAccount,
    pub merkle_context: PackedMerkleContext,
    pub root_index: u16,
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct OutputCompressedAccountWithPackedContext {
    pub compressed_account: CompressedAccount,
    pub merkle_tree_index: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct NewAddressParamsPacked {
    pub seed: [u8; 32],
    pub address_queue_account_index: u8,
    pub address_merkle_tree_account_index: u8,
    pub address_merkle_tree_root_index: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct InstructionDataInvoke {
    pub proof: Option<CompressedProof>,
    pub input_compressed_accounts_with_merkle_context: Vec<PackedCompressedAccountWithMerkleContext>,
    pub output_compressed_accounts: Vec<OutputCompressedAccountWithPackedContext>,
    pub relay_fee: Option<u64>,
    pub new_address_params: Vec<NewAddressParamsPacked>,
    pub compress_or_decompress_lamports: Option<u64>,
    pub is_compress: bool,
}

impl InstructionDataInvoke {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let inner = borsh::to_vec(self)
            .map_err(|e| BackendError::Internal(format!("Failed to encode invoke data: {e}")))?;

        let mut data = instruction_discriminator("invoke").to_vec();
        inner
            .serialize(&mut data)
            .map_err(|e| BackendError::Internal(format!("Failed to encode invoke data: {e}")))?;
        Ok(data)
    }

    /// Inverse of [`encode`](Self::encode)
    pub fn decode(data: &[u8]) -> Result<Self> {
        let malformed = || BackendError::Internal("Malformed invoke instruction data".to_string());

        let (discriminator, mut rest) = data.split_at_checked(8).ok_or_else(malformed)?;
        if discriminator != instruction_discriminator("invoke") {
            return Err(malformed());
        }
        let inner = Vec::<u8>::deserialize(&mut rest).map_err(|_| malformed())?;
        borsh::from_slice(&inner).map_err(|_| malformed())
    }
}

// ============ Remaining accounts ============

/// Deduplicating packer for tree and queue references
#[derive(Debug, Default)]
struct RemainingAccounts {
    metas: Vec<AccountMeta>,
}

impl RemainingAccounts {
    fn insert(&mut self, key: Pubkey, is_writable: bool) -> Result<u8> {
        let index = match self.metas.iter().position(|meta| meta.pubkey == key) {
            Some(index) => {
                self.metas[index].is_writable |= is_writable;
                index
            }
            None => {
                self.metas.push(AccountMeta {
                    pubkey: key,
                    is_signer: false,
                    is_writable,
                });
                self.metas.len() - 1
            }
        };
        u8::try_from(index)
            .map_err(|_| BackendError::Internal("Too many remaining accounts".to_string()))
    }
}

/// Fixed account list of the `invoke` entrypoint; absent optional accounts are
/// passed as the program id
fn invoke_account_metas(
    fee_payer: &Pubkey,
    authority: &Pubkey,
    sol_pool: bool,
    decompression_recipient: Option<&Pubkey>,
) -> Vec<AccountMeta> {
    let placeholder = AccountMeta::new_readonly(LIGHT_SYSTEM_PROGRAM_ID, false);

    vec![
        AccountMeta::new(*fee_payer, true),
        AccountMeta::new_readonly(*authority, true),
        AccountMeta::new_readonly(registered_program_pda(), false),
        AccountMeta::new_readonly(NOOP_PROGRAM_ID, false),
        AccountMeta::new_readonly(account_compression_authority(), false),
        AccountMeta::new_readonly(ACCOUNT_COMPRESSION_PROGRAM_ID, false),
        if sol_pool {
            AccountMeta::new(sol_pool_pda(), false)
        } else {
            placeholder.clone()
        },
        match decompression_recipient {
            Some(recipient) => AccountMeta::new(*recipient, false),
            None => placeholder,
        },
        AccountMeta::new_readonly(system_program::id(), false),
    ]
}

/// Deposit `lamports` from `payer` into a new pooled account owned by `recipient`
pub fn compress_instruction(
    payer: &Pubkey,
    recipient: &Pubkey,
    lamports: u64,
    output_tree: &TreeInfo,
) -> Result<Instruction> {
    let mut remaining = RemainingAccounts::default();
    let merkle_tree_index = remaining.insert(output_tree.tree, true)?;

    let data = InstructionDataInvoke {
        proof: None,
        input_compressed_accounts_with_merkle_context: Vec::new(),
        output_compressed_accounts: vec![OutputCompressedAccountWithPackedContext {
            compressed_account: CompressedAccount {
                owner: recipient.to_bytes(),
                lamports,
                address: None,
                data: None,
            },
            merkle_tree_index,
        }],
        relay_fee: None,
        new_address_params: Vec::new(),
        compress_or_decompress_lamports: Some(lamports),
        is_compress: true,
    };

    let mut accounts = invoke_account_metas(payer, payer, true, None);
    accounts.extend(remaining.metas);

    Ok(Instruction {
        program_id: LIGHT_SYSTEM_PROGRAM_ID,
        accounts,
        data: data.encode()?,
    })
}

/// Inputs for a full decompression
pub struct DecompressParams<'a> {
    pub fee_payer: Pubkey,
    /// Owner of every input; must sign
    pub authority: Pubkey,
    pub inputs: &'a [PooledAccount],
    pub proof: &'a ValidityProof,
    pub recipient: Pubkey,
    pub lamports: u64,
}

/// Consume `inputs` and credit `lamports` to the recipient with no change output.
///
/// Tree, queue and CPI context references are packed read-only; write access
/// is granted afterwards by the permission patch.
pub fn decompress_instruction(params: DecompressParams<'_>) -> Result<Instruction> {
    let DecompressParams {
        fee_payer,
        authority,
        inputs,
        proof,
        recipient,
        lamports,
    } = params;

    if proof.root_indices.len() != inputs.len() {
        return Err(BackendError::Protocol {
            message: format!(
                "validity proof has {} root indices for {} inputs",
                proof.root_indices.len(),
                inputs.len()
            ),
            logs: Vec::new(),
        });
    }

    let mut remaining = RemainingAccounts::default();
    let mut packed = Vec::with_capacity(inputs.len());

    for (account, root_index) in inputs.iter().zip(&proof.root_indices) {
        let tree_info = account.tree_info.ok_or_else(|| {
            BackendError::MalformedAccount(format!(
                "account {} has no tree info",
                bs58::encode(account.hash).into_string()
            ))
        })?;

        let merkle_tree_pubkey_index = remaining.insert(tree_info.tree, false)?;
        let nullifier_queue_pubkey_index = remaining.insert(tree_info.queue, false)?;
        if let Some(cpi_context) = tree_info.cpi_context {
            remaining.insert(cpi_context, false)?;
        }

        let leaf_index = u32::try_from(account.leaf_index).map_err(|_| {
            BackendError::MalformedAccount(format!("leaf index {} out of range", account.leaf_index))
        })?;
        let root_index = u16::try_from(*root_index).map_err(|_| BackendError::Protocol {
            message: format!("root index {root_index} out of range"),
            logs: Vec::new(),
        })?;

        packed.push(PackedCompressedAccountWithMerkleContext {
            compressed_account: CompressedAccount {
                owner: account.owner.to_bytes(),
                lamports: account.lamports,
                address: account.address,
                data: None,
            },
            merkle_context: PackedMerkleContext {
                merkle_tree_pubkey_index,
                nullifier_queue_pubkey_index,
                leaf_index,
                prove_by_index: account.prove_by_index,
            },
            root_index,
            read_only: false,
        });
    }

    let data = InstructionDataInvoke {
        proof: proof.compressed_proof,
        input_compressed_accounts_with_merkle_context: packed,
        output_compressed_accounts: Vec::new(),
        relay_fee: None,
        new_address_params: Vec::new(),
        compress_or_decompress_lamports: Some(lamports),
        is_compress: false,
    };

    let mut accounts = invoke_account_metas(&fee_payer, &authority, true, Some(&recipient));
    accounts.extend(remaining.metas);

    Ok(Instruction {
        program_id: LIGHT_SYSTEM_PROGRAM_ID,
        accounts,
        data: data.encode()?,
    })
}
