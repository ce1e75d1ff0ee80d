//! Fixed-layout registry records and registry instruction payloads
//!
//! Record layout (little-endian):
//! `[8 discriminator][4 handle len N][N handle][32 authority][32 destination][1 bump]`.
//! Records written before the destination field existed stop after the authority.

use borsh::BorshSerialize;
use solana_sdk::{hash::hash, pubkey::Pubkey};
use thiserror::Error;

pub const REGISTRY_SEED: &[u8] = b"stealth";
pub const MAX_HANDLE_LEN: usize = 32;

const DISCRIMINATOR_LEN: usize = 8;
const LEN_PREFIX: usize = 4;
const KEY_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandleError {
    #[error("Handle cannot be empty")]
    Empty,

    #[error("Handle must be {MAX_HANDLE_LEN} characters or less, got {0}")]
    TooLong(usize),

    #[error("Handle can only contain letters, numbers, and underscores")]
    InvalidChars,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("record truncated: need {needed} bytes, have {actual}")]
    Truncated { needed: usize, actual: usize },

    #[error("record discriminator does not match RegistryEntry")]
    Discriminator,

    #[error("handle bytes are not valid UTF-8")]
    InvalidHandle,

    #[error("failed to encode instruction arguments: {0}")]
    Encode(String),
}

/// Validate a bare handle (no `.stealth` suffix)
pub fn validate_handle(handle: &str) -> Result<(), HandleError> {
    if handle.is_empty() {
        return Err(HandleError::Empty);
    }
    if handle.len() > MAX_HANDLE_LEN {
        return Err(HandleError::TooLong(handle.len()));
    }
    if !handle.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_') {
        return Err(HandleError::InvalidChars);
    }
    Ok(())
}

/// Anchor account discriminator: `sha256("account:<Name>")[..8]`
pub fn account_discriminator(name: &str) -> [u8; 8] {
    let digest = hash(format!("account:{name}").as_bytes());
    let mut out = [0u8; 8];
    out.copy_from_slice(&digest.to_bytes()[..8]);
    out
}

/// Anchor instruction discriminator: `sha256("global:<name>")[..8]`
pub fn instruction_discriminator(name: &str) -> [u8; 8] {
    let digest = hash(format!("global:{name}").as_bytes());
    let mut out = [0u8; 8];
    out.copy_from_slice(&digest.to_bytes()[..8]);
    out
}

/// PDA holding the registry entry for `handle`
pub fn registry_entry_address(program_id: &Pubkey, handle: &str) -> (Pubkey, u8) {
    Pubkey::find_program_address(&[REGISTRY_SEED, handle.as_bytes()], program_id)
}

/// Decoded registry entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryRecord {
    pub handle: String,
    pub authority: Pubkey,
    /// `None` for legacy records written before the destination field
    pub destination: Option<Pubkey>,
    pub bump: Option<u8>,
}

impl RegistryRecord {
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let mut cursor = Cursor::new(data);

        let discriminator = cursor.take(DISCRIMINATOR_LEN)?;
        if discriminator != account_discriminator("RegistryEntry") {
            return Err(CodecError::Discriminator);
        }

        let len_bytes = cursor.take(LEN_PREFIX)?;
        let handle_len = u32::from_le_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]) as usize;
        let handle = std::str::from_utf8(cursor.take(handle_len)?)
            .map_err(|_| CodecError::InvalidHandle)?
            .to_string();

        let authority = cursor.take_key()?;

        // Anything short of a full destination key is a legacy record
        let destination = if cursor.remaining() >= KEY_LEN {
            Some(cursor.take_key()?)
        } else {
            None
        };
        let bump = match destination {
            Some(_) => cursor.take(1).ok().map(|b| b[0]),
            None => None,
        };

        Ok(Self {
            handle,
            authority,
            destination,
            bump,
        })
    }

    /// Encode in the current layout; legacy records omit destination and bump
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(DISCRIMINATOR_LEN + LEN_PREFIX + self.handle.len() + 65);
        out.extend_from_slice(&account_discriminator("RegistryEntry"));
        out.extend_from_slice(&(self.handle.len() as u32).to_le_bytes());
        out.extend_from_slice(self.handle.as_bytes());
        out.extend_from_slice(self.authority.as_ref());
        if let Some(destination) = self.destination {
            out.extend_from_slice(destination.as_ref());
            out.push(self.bump.unwrap_or_default());
        }
        out
    }

    /// Payout key, and whether it came from the legacy authority fallback
    pub fn payout_key(&self) -> (Pubkey, bool) {
        match self.destination {
            Some(destination) => (destination, false),
            None => (self.authority, true),
        }
    }
}

#[derive(BorshSerialize)]
struct RegisterArgs {
    handle: String,
    destination: [u8; 32],
}

#[derive(BorshSerialize)]
struct UpdateAuthorityArgs {
    handle: String,
    new_authority: [u8; 32],
}

/// `[8 discriminator][4 len][handle][32 destination]`
pub fn encode_register_payload(handle: &str, destination: &Pubkey) -> Result<Vec<u8>, CodecError> {
    let args = RegisterArgs {
        handle: handle.to_string(),
        destination: destination.to_bytes(),
    };
    with_discriminator("register", &args)
}

/// `[8 discriminator][4 len][handle][32 new authority]`
pub fn encode_update_authority_payload(
    handle: &str,
    new_authority: &Pubkey,
) -> Result<Vec<u8>, CodecError> {
    let args = UpdateAuthorityArgs {
        handle: handle.to_string(),
        new_authority: new_authority.to_bytes(),
    };
    with_discriminator("update_authority", &args)
}

fn with_discriminator<T: BorshSerialize>(name: &str, args: &T) -> Result<Vec<u8>, CodecError> {
    let mut data = instruction_discriminator(name).to_vec();
    borsh::to_writer(&mut data, args).map_err(|e| CodecError::Encode(e.to_string()))?;
    Ok(data)
}

struct Cursor<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.offset)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        let end = self.offset.checked_add(len).ok_or(CodecError::Truncated {
            needed: usize::MAX,
            actual: self.data.len(),
        })?;
        let slice = self.data.get(self.offset..end).ok_or(CodecError::Truncated {
            needed: end,
            actual: self.data.len(),
        })?;
        self.offset = end;
        Ok(slice)
    }

    fn take_key(&mut self) -> Result<Pubkey, CodecError> {
        let bytes = self.take(KEY_LEN)?;
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(bytes);
        Ok(Pubkey::new_from_array(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(handle: &str, destination: Option<Pubkey>) -> RegistryRecord {
        RegistryRecord {
            handle: handle.to_string(),
            authority: Pubkey::new_unique(),
            destination,
            bump: destination.map(|_| 254),
        }
    }

    #[test]
    fn test_decode_current_layout() {
        let destination = Pubkey::new_unique();
        let original = record("alice", Some(destination));
        let bytes = original.encode();

        assert_eq!(bytes.len(), 8 + 4 + 5 + 32 + 32 + 1);
        let decoded = RegistryRecord::decode(&bytes).unwrap();
        assert_eq!(decoded, original);
        assert_eq!(decoded.payout_key(), (destination, false));
    }

    #[test]
    fn test_decode_legacy_layout_falls_back_to_authority() {
        let legacy = record("old_handle", None);
        let bytes = legacy.encode();

        assert_eq!(bytes.len(), 8 + 4 + 10 + 32);
        let decoded = RegistryRecord::decode(&bytes).unwrap();
        assert_eq!(decoded.destination, None);
        assert_eq!(decoded.payout_key(), (legacy.authority, true));
    }

    #[test]
    fn test_decode_partial_destination_is_legacy() {
        let full = record("bob", Some(Pubkey::new_unique())).encode();
        // Cut the destination short: not enough bytes for a key
        let cut = &full[..8 + 4 + 3 + 32 + 20];
        let decoded = RegistryRecord::decode(cut).unwrap();
        assert_eq!(decoded.destination, None);
    }

    #[test]
    fn test_decode_anchor_padded_account() {
        // Anchor allocates the max handle size; trailing bytes are zero
        let mut bytes = record("x", Some(Pubkey::new_unique())).encode();
        bytes.resize(8 + 4 + 32 + 32 + 32 + 1, 0);
        assert!(RegistryRecord::decode(&bytes).unwrap().destination.is_some());
    }

    #[test]
    fn test_decode_truncated_before_authority() {
        let bytes = record("carol", None).encode();
        let err = RegistryRecord::decode(&bytes[..8 + 4 + 5 + 10]).unwrap_err();
        assert!(matches!(err, CodecError::Truncated { .. }));
    }

    #[test]
    fn test_decode_rejects_foreign_discriminator() {
        let mut bytes = record("dave", None).encode();
        bytes[0] ^= 0xff;
        assert_eq!(RegistryRecord::decode(&bytes), Err(CodecError::Discriminator));
    }

    #[test]
    fn test_decode_rejects_huge_length_prefix() {
        let mut bytes = record("eve", None).encode();
        bytes[8..12].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            RegistryRecord::decode(&bytes),
            Err(CodecError::Truncated { .. })
        ));
    }

    #[test]
    fn test_register_payload_layout() {
        let destination = Pubkey::new_unique();
        let data = encode_register_payload("alice", &destination).unwrap();

        assert_eq!(&data[..8], &instruction_discriminator("register"));
        assert_eq!(&data[8..12], &5u32.to_le_bytes());
        assert_eq!(&data[12..17], b"alice");
        assert_eq!(&data[17..], destination.as_ref());
    }

    #[test]
    fn test_update_authority_payload_layout() {
        let new_authority = Pubkey::new_unique();
        let data = encode_update_authority_payload("bob", &new_authority).unwrap();

        assert_eq!(&data[..8], &instruction_discriminator("update_authority"));
        assert_eq!(data.len(), 8 + 4 + 3 + 32);
        assert_eq!(&data[15..], new_authority.as_ref());
    }

    struct Unwritable;

    impl BorshSerialize for Unwritable {
        fn serialize<W: std::io::Write>(&self, _writer: &mut W) -> std::io::Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::InvalidInput, "length overflows u32"))
        }
    }

    #[test]
    fn test_serialization_failure_is_reported() {
        let err = with_discriminator("register", &Unwritable).unwrap_err();
        assert_eq!(
            err,
            CodecError::Encode("length overflows u32".to_string())
        );
    }

    #[test]
    fn test_registry_address_is_deterministic() {
        let program = Pubkey::new_unique();
        let (a, bump_a) = registry_entry_address(&program, "alice");
        let (b, bump_b) = registry_entry_address(&program, "alice");
        let (c, _) = registry_entry_address(&program, "alicf");
        assert_eq!((a, bump_a), (b, bump_b));
        assert_ne!(a, c);
    }

    #[test]
    fn test_validate_handle_bounds() {
        assert!(validate_handle("a").is_ok());
        assert!(validate_handle(&"Z_9".repeat(10)).is_ok());
        assert_eq!(validate_handle(""), Err(HandleError::Empty));
        assert_eq!(validate_handle(&"a".repeat(33)), Err(HandleError::TooLong(33)));
        assert_eq!(validate_handle("al.ice"), Err(HandleError::InvalidChars));
        assert_eq!(validate_handle("naïve"), Err(HandleError::InvalidChars));
    }
}
