//! Normalizes indexer account records into [`PooledAccount`]s
//!
//! Indexers disagree on shape (flat vs nested under `compressedAccount`) and on
//! numeric encoding (JSON number, decimal string, hex string, BN word limbs).
//! Both are resolved here; nothing past this module sees a raw record.

use num_bigint::BigUint;
use num_traits::{ToPrimitive, Zero};
use serde::Deserialize;
use serde_json::Value;
use solana_sdk::pubkey::Pubkey;
use tracing::debug;

use crate::error::{BackendError, Result};
use crate::types::{PooledAccount, TreeInfo, TreeType};

/// Bits per limb in a BN.js `words` array
const BN_WORD_BITS: u32 = 26;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawAccountRecord {
    Nested(NestedRecord),
    Flat(RawAccountFields),
}

#[derive(Debug, Deserialize)]
struct NestedRecord {
    #[serde(rename = "compressedAccount")]
    compressed_account: RawAccountFields,
    #[serde(flatten)]
    outer: RawAccountFields,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAccountFields {
    hash: Option<RawNumber>,
    owner: Option<String>,
    lamports: Option<RawNumber>,
    #[serde(alias = "merkleContext")]
    tree_info: Option<RawTreeInfo>,
    leaf_index: Option<RawNumber>,
    address: Option<String>,
    prove_by_index: Option<bool>,
}

impl RawAccountFields {
    /// Top-level fields win over nested ones
    fn merge(self, nested: RawAccountFields) -> RawAccountFields {
        RawAccountFields {
            hash: self.hash.or(nested.hash),
            owner: self.owner.or(nested.owner),
            lamports: self.lamports.or(nested.lamports),
            tree_info: self.tree_info.or(nested.tree_info),
            leaf_index: self.leaf_index.or(nested.leaf_index),
            address: self.address.or(nested.address),
            prove_by_index: self.prove_by_index.or(nested.prove_by_index),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTreeInfo {
    tree: String,
    queue: String,
    tree_type: Option<RawNumber>,
    cpi_context: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawNumber {
    Int(u64),
    Text(String),
    Words {
        words: Vec<u64>,
        #[serde(default)]
        length: Option<usize>,
    },
}

impl RawNumber {
    fn to_biguint(&self) -> Option<BigUint> {
        match self {
            RawNumber::Int(n) => Some(BigUint::from(*n)),
            RawNumber::Text(s) => parse_biguint(s),
            RawNumber::Words { words, length } => {
                // BN keeps stale limbs past `length`
                let used = length.unwrap_or(words.len()).min(words.len());
                let mut value = BigUint::zero();
                for &word in words[..used].iter().rev() {
                    if word >> BN_WORD_BITS != 0 {
                        return None;
                    }
                    value = (value << BN_WORD_BITS) + BigUint::from(word);
                }
                Some(value)
            }
        }
    }

    /// Small enum codes are always decimal
    fn to_u64_text(&self) -> Option<u64> {
        match self {
            RawNumber::Int(n) => Some(*n),
            RawNumber::Text(s) => s.trim().parse().ok(),
            RawNumber::Words { .. } => self.to_biguint().and_then(|value| value.to_u64()),
        }
    }
}

/// Pick the radix for a numeric string and strip any prefix
pub fn detect_radix(s: &str) -> (&str, u32) {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        (hex, 16)
    } else if s.bytes().any(|b| matches!(b, b'a'..=b'f' | b'A'..=b'F')) {
        (s, 16)
    } else if s.len() == 64 {
        // Raw 256-bit hex that happens to contain only digits
        (s, 16)
    } else {
        (s, 10)
    }
}

pub fn parse_biguint(s: &str) -> Option<BigUint> {
    let (digits, radix) = detect_radix(s.trim());
    if digits.is_empty() {
        return None;
    }
    BigUint::parse_bytes(digits.as_bytes(), radix)
}

/// Pool version compatibility of a hydrated account
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeCompatibility {
    Supported,
    Unsupported(TreeType),
    /// No tree metadata; cannot be proven
    Unknown,
}

pub fn classify(account: &PooledAccount) -> TreeCompatibility {
    match account.tree_info {
        Some(info) if info.tree_type.is_supported() => TreeCompatibility::Supported,
        Some(info) => TreeCompatibility::Unsupported(info.tree_type),
        None => TreeCompatibility::Unknown,
    }
}

/// Hydrate one raw record; `index` only labels errors
pub fn hydrate(raw: &Value, index: usize) -> Result<PooledAccount> {
    let malformed = |what: String| BackendError::MalformedAccount(format!("account {index}: {what}"));

    let record: RawAccountRecord =
        serde_json::from_value(raw.clone()).map_err(|e| malformed(format!("unrecognized shape ({e})")))?;

    let fields = match record {
        RawAccountRecord::Nested(nested) => nested.outer.merge(nested.compressed_account),
        RawAccountRecord::Flat(flat) => flat,
    };

    let hash_value = fields
        .hash
        .ok_or_else(|| malformed("missing hash".to_string()))?
        .to_biguint()
        .ok_or_else(|| malformed("unparseable hash".to_string()))?;
    let hash = to_bytes32(&hash_value).ok_or_else(|| malformed("hash exceeds 256 bits".to_string()))?;

    let owner = fields
        .owner
        .ok_or_else(|| malformed("missing owner".to_string()))?;
    let owner = parse_key(&owner).ok_or_else(|| malformed(format!("invalid owner {owner}")))?;

    let lamports = fields
        .lamports
        .ok_or_else(|| malformed("missing lamports".to_string()))?
        .to_biguint()
        .and_then(|value| value.to_u64())
        .ok_or_else(|| malformed("lamports not a u64".to_string()))?;

    let leaf_index = match fields.leaf_index {
        Some(raw) => raw
            .to_biguint()
            .and_then(|value| value.to_u64())
            .ok_or_else(|| malformed("invalid leaf index".to_string()))?,
        None => return Err(malformed("missing leaf index".to_string())),
    };

    let tree_info = fields
        .tree_info
        .map(|info| hydrate_tree_info(info).map_err(&malformed))
        .transpose()?;

    let address = match fields.address {
        Some(address) => Some(
            parse_key(&address)
                .map(|key| key.to_bytes())
                .ok_or_else(|| malformed(format!("invalid address {address}")))?,
        ),
        None => None,
    };

    let account = PooledAccount {
        hash,
        owner,
        lamports,
        tree_info,
        leaf_index,
        address,
        prove_by_index: fields.prove_by_index.unwrap_or(false),
    };

    debug!(index, owner = %account.owner, lamports = account.lamports, "Hydrated pooled account");
    Ok(account)
}

pub fn hydrate_all(raws: &[Value]) -> Result<Vec<PooledAccount>> {
    raws.iter().enumerate().map(|(i, raw)| hydrate(raw, i)).collect()
}

fn hydrate_tree_info(raw: RawTreeInfo) -> std::result::Result<TreeInfo, String> {
    let tree = parse_key(&raw.tree).ok_or_else(|| format!("invalid tree {}", raw.tree))?;
    let queue = parse_key(&raw.queue).ok_or_else(|| format!("invalid queue {}", raw.queue))?;

    // Version comes from the record, never from the tree address
    let code = raw
        .tree_type
        .ok_or_else(|| "missing treeType".to_string())?
        .to_u64_text()
        .ok_or_else(|| "invalid treeType".to_string())?;
    let tree_type = TreeType::from_code(code).ok_or_else(|| format!("unknown treeType {code}"))?;

    let cpi_context = match raw.cpi_context {
        Some(key) => Some(parse_key(&key).ok_or_else(|| format!("invalid cpiContext {key}"))?),
        None => None,
    };

    Ok(TreeInfo {
        tree,
        queue,
        tree_type,
        cpi_context,
    })
}

fn parse_key(s: &str) -> Option<Pubkey> {
    s.parse().ok()
}

fn to_bytes32(value: &BigUint) -> Option<[u8; 32]> {
    let bytes = value.to_bytes_be();
    if bytes.len() > 32 {
        return None;
    }
    let mut out = [0u8; 32];
    out[32 - bytes.len()..].copy_from_slice(&bytes);
    Some(out)
}
