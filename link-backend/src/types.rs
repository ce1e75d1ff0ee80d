//! Shared types: configuration, pooled-ledger records, and action protocol bodies

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};
use solana_sdk::{pubkey, pubkey::Pubkey};
use tracing::warn;

/// Deployed stealth registry program
pub const DEFAULT_REGISTRY_PROGRAM_ID: Pubkey =
    pubkey!("DbGF7nB2kuMpRxwm4b6n11XcWzwvysDGQGztJ4Wvvu13");

/// Lookup table listing the V1 `(tree, queue, cpi context)` triples
pub const DEFAULT_STATE_TREE_LOOKUP_TABLE: &str = "7i86eQs3GSqHjN47WdWLTCGMW6gde1q96G2EVnUyK2st";

/// Lookup table listing trees that were nullified and must no longer be used
pub const DEFAULT_NULLIFY_LOOKUP_TABLE: &str = "H9QD4u1fG7KmkAzn2tDXhheushxFe1EcrjGGyEFXeMqT";

pub const DEFAULT_PUBLIC_RPC_URL: &str = "https://api.mainnet-beta.solana.com";

pub const LAMPORTS_PER_SOL: u64 = 1_000_000_000;

// ============ Pooled ledger ============

/// Pool tree version. Always taken from the record, never inferred from the tree address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TreeType {
    V1 = 1,
    V2 = 2,
    BatchedAddress = 3,
}

impl TreeType {
    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            1 => Some(TreeType::V1),
            2 => Some(TreeType::V2),
            3 => Some(TreeType::BatchedAddress),
            _ => None,
        }
    }

    /// The only version new deposits may target and withdrawals may consume
    pub fn is_supported(self) -> bool {
        matches!(self, TreeType::V1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeInfo {
    pub tree: Pubkey,
    pub queue: Pubkey,
    pub tree_type: TreeType,
    pub cpi_context: Option<Pubkey>,
}

/// One unit of shielded value, as hydrated from the indexer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PooledAccount {
    /// 256-bit account hash, big-endian
    pub hash: [u8; 32],
    pub owner: Pubkey,
    pub lamports: u64,
    pub tree_info: Option<TreeInfo>,
    pub leaf_index: u64,
    pub address: Option<[u8; 32]>,
    pub prove_by_index: bool,
}

/// `(hash, tree, queue)` triple a validity proof is requested for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProofInput {
    pub hash: [u8; 32],
    pub tree: Pubkey,
    pub queue: Pubkey,
}

/// Groth16 proof points as the compression program expects them
#[derive(Debug, Clone, Copy, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct CompressedProof {
    pub a: [u8; 32],
    pub b: [u8; 64],
    pub c: [u8; 32],
}

/// Membership proof over a set of pooled accounts, one root index per input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidityProof {
    /// `None` when every input is proven by index
    pub compressed_proof: Option<CompressedProof>,
    pub root_indices: Vec<u32>,
}

// ============ Action protocol ============

#[derive(Debug, Serialize, Deserialize)]
pub struct ActionGetResponse {
    pub title: String,
    pub icon: String,
    pub description: String,
    pub label: String,
    pub links: ActionLinks,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ActionLinks {
    pub actions: Vec<LinkedAction>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LinkedAction {
    #[serde(rename = "type")]
    pub kind: String,
    pub label: String,
    pub href: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<ActionParameter>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ActionParameter {
    pub name: String,
    pub label: String,
    pub required: bool,
}

/// POST body sent by the action client
#[derive(Debug, Deserialize)]
pub struct ActionPostRequest {
    /// Payer public key (base58)
    pub account: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ActionPostResponse {
    #[serde(rename = "type")]
    pub kind: String,
    /// Unsigned transaction, bincode serialized, base64 encoded
    pub transaction: String,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct DonateQuery {
    pub amount: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ActionsJson {
    pub rules: Vec<ActionRule>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRule {
    pub path_pattern: String,
    pub api_path: String,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: i64,
    pub rpc_configured: bool,
}

// ============ Configuration ============

/// Configuration for the backend server
#[derive(Debug, Clone)]
pub struct Config {
    /// Server port
    pub port: u16,

    /// Ledger RPC endpoint; required for every transaction path
    pub rpc_url: Option<String>,

    /// Compression indexer endpoint (defaults to the RPC endpoint)
    pub indexer_url: Option<String>,

    /// Public endpoint used only to resolve `.sol` domains when no RPC is configured
    pub public_resolution_rpc_url: String,

    /// Base URL used to build absolute icon links
    pub public_base_url: String,

    pub registry_program_id: Pubkey,

    pub state_tree_lookup_table: Option<Pubkey>,

    /// Trees listed here are dropped from every tree source
    pub nullify_lookup_table: Option<Pubkey>,

    /// Extra trees with declared versions, appended after the lookup table
    pub static_state_trees: Vec<TreeInfo>,

    pub compute_unit_limit: u32,

    pub compute_unit_price_micro_lamports: u64,

    /// Added on top of the rent-exempt minimum when funding a derived identity
    pub rent_safety_margin_lamports: u64,

    /// Raw submission retries; business logic never retries on its own
    pub max_send_retries: usize,

    pub confirm_poll_interval_ms: u64,

    pub balance_poll_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3001,
            rpc_url: None,
            indexer_url: None,
            public_resolution_rpc_url: DEFAULT_PUBLIC_RPC_URL.to_string(),
            public_base_url: "http://localhost:3001".to_string(),
            registry_program_id: DEFAULT_REGISTRY_PROGRAM_ID,
            state_tree_lookup_table: DEFAULT_STATE_TREE_LOOKUP_TABLE.parse().ok(),
            nullify_lookup_table: DEFAULT_NULLIFY_LOOKUP_TABLE.parse().ok(),
            static_state_trees: Vec::new(),
            compute_unit_limit: 300_000,
            compute_unit_price_micro_lamports: 1_000,
            rent_safety_margin_lamports: 100_000,
            max_send_retries: 3,
            confirm_poll_interval_ms: 500,
            balance_poll_interval_secs: 10,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let rpc_url = non_empty_var("RPC_URL").or_else(|| non_empty_var("HELIUS_RPC_URL"));

        Self {
            port: parsed_var("PORT").unwrap_or(defaults.port),
            rpc_url,
            indexer_url: non_empty_var("INDEXER_URL"),
            public_resolution_rpc_url: non_empty_var("PUBLIC_RESOLUTION_RPC_URL")
                .unwrap_or(defaults.public_resolution_rpc_url),
            public_base_url: non_empty_var("PUBLIC_BASE_URL")
                .map(|s| s.trim_end_matches('/').to_string())
                .unwrap_or(defaults.public_base_url),
            registry_program_id: parsed_var("REGISTRY_PROGRAM_ID")
                .unwrap_or(defaults.registry_program_id),
            state_tree_lookup_table: parsed_var("STATE_TREE_LOOKUP_TABLE")
                .or(defaults.state_tree_lookup_table),
            nullify_lookup_table: parsed_var("NULLIFY_LOOKUP_TABLE")
                .or(defaults.nullify_lookup_table),
            static_state_trees: non_empty_var("STATIC_STATE_TREES")
                .map(|raw| parse_static_trees(&raw))
                .unwrap_or(defaults.static_state_trees),
            compute_unit_limit: parsed_var("COMPUTE_UNIT_LIMIT")
                .unwrap_or(defaults.compute_unit_limit),
            compute_unit_price_micro_lamports: parsed_var("COMPUTE_UNIT_PRICE_MICRO_LAMPORTS")
                .unwrap_or(defaults.compute_unit_price_micro_lamports),
            rent_safety_margin_lamports: parsed_var("RENT_SAFETY_MARGIN_LAMPORTS")
                .unwrap_or(defaults.rent_safety_margin_lamports),
            max_send_retries: parsed_var("MAX_SEND_RETRIES").unwrap_or(defaults.max_send_retries),
            confirm_poll_interval_ms: parsed_var("CONFIRM_POLL_INTERVAL_MS")
                .unwrap_or(defaults.confirm_poll_interval_ms),
            balance_poll_interval_secs: parsed_var("BALANCE_POLL_INTERVAL_SECS")
                .unwrap_or(defaults.balance_poll_interval_secs),
        }
    }

    /// Indexer endpoint, falling back to the ledger RPC endpoint
    pub fn indexer_url(&self) -> Option<&str> {
        self.indexer_url.as_deref().or(self.rpc_url.as_deref())
    }

    /// Endpoint for `.sol` resolution; may be the public default
    pub fn resolution_rpc_url(&self) -> &str {
        self.rpc_url
            .as_deref()
            .unwrap_or(&self.public_resolution_rpc_url)
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn parsed_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    non_empty_var(name).and_then(|s| s.parse().ok())
}

/// Parse `tree:queue:type[:cpi_context]` entries separated by commas
///
/// `type` is the numeric tree version. Unparseable entries are skipped with a warning.
pub fn parse_static_trees(raw: &str) -> Vec<TreeInfo> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| {
            let tree = parse_static_tree(entry);
            if tree.is_none() {
                warn!(entry, "Ignoring malformed static state tree");
            }
            tree
        })
        .collect()
}

fn parse_static_tree(entry: &str) -> Option<TreeInfo> {
    let parts: Vec<&str> = entry.split(':').map(str::trim).collect();
    let (tree, queue, code, cpi_context) = match parts.as_slice() {
        [tree, queue, code] => (tree, queue, code, None),
        [tree, queue, code, cpi] => (tree, queue, code, Some(cpi.parse().ok()?)),
        _ => return None,
    };

    Some(TreeInfo {
        tree: tree.parse().ok()?,
        queue: queue.parse().ok()?,
        tree_type: TreeType::from_code(code.parse().ok()?)?,
        cpi_context,
    })
}
