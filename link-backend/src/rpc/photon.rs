//! Compression indexer spoken to over JSON-RPC 2.0

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use solana_sdk::{address_lookup_table::state::AddressLookupTable, pubkey::Pubkey};
use tracing::{debug, info};

use super::{CompressionIndexer, LedgerRpc, RpcError};
use crate::error::{BackendError, Result};
use crate::types::{CompressedProof, Config, ProofInput, TreeInfo, TreeType, ValidityProof};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Where the usable state trees come from
#[derive(Debug, Clone, Default)]
pub struct StateTreeSources {
    /// Table of V1 `(tree, queue, cpi context)` triples
    pub lookup_table: Option<Pubkey>,
    /// Table of nullified trees and queues
    pub nullify_table: Option<Pubkey>,
    pub static_trees: Vec<TreeInfo>,
}

impl From<&Config> for StateTreeSources {
    fn from(config: &Config) -> Self {
        Self {
            lookup_table: config.state_tree_lookup_table,
            nullify_table: config.nullify_lookup_table,
            static_trees: config.static_state_trees.clone(),
        }
    }
}

pub struct PhotonIndexer {
    http: reqwest::Client,
    url: String,
    ledger: Arc<dyn LedgerRpc>,
    sources: StateTreeSources,
}

impl PhotonIndexer {
    pub fn new(url: &str, ledger: Arc<dyn LedgerRpc>, sources: StateTreeSources) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| BackendError::Internal(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            url: url.to_string(),
            ledger,
            sources,
        })
    }

    async fn lookup_table_addresses(&self, table: &Pubkey) -> std::result::Result<Vec<Pubkey>, RpcError> {
        let data = self
            .ledger
            .get_account_data(table)
            .await?
            .ok_or_else(|| RpcError::Unknown(format!("lookup table {table} not found")))?;

        let table = AddressLookupTable::deserialize(&data)
            .map_err(|e| RpcError::Unknown(format!("invalid lookup table {table}: {e}")))?;
        Ok(table.addresses.to_vec())
    }

    async fn call(&self, method: &str, params: Value) -> std::result::Result<Value, RpcError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": "stealth-link",
            "method": method,
            "params": params,
        });

        let response = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(RpcError::from_status(status.as_u16(), text));
        }

        let mut envelope: Value = response.json().await.map_err(map_transport_error)?;

        if let Some(error) = envelope.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            return Err(RpcError::classify(format!("{method}: {message}")));
        }

        debug!(method, "indexer call succeeded");
        Ok(take_field(&mut envelope, "result"))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawValidityProof {
    compressed_proof: Option<RawProofPoints>,
    #[serde(default)]
    root_indices: Vec<u32>,
}

#[derive(Deserialize)]
struct RawProofPoints {
    a: Vec<u8>,
    b: Vec<u8>,
    c: Vec<u8>,
}

impl RawProofPoints {
    fn into_proof(self) -> std::result::Result<CompressedProof, RpcError> {
        Ok(CompressedProof {
            a: fixed(self.a, "a")?,
            b: fixed(self.b, "b")?,
            c: fixed(self.c, "c")?,
        })
    }
}

fn fixed<const N: usize>(bytes: Vec<u8>, name: &str) -> std::result::Result<[u8; N], RpcError> {
    let len = bytes.len();
    bytes.try_into().map_err(|_| RpcError::Rejected {
        message: format!("proof point {name} has {len} bytes, expected {N}"),
        logs: Vec::new(),
    })
}

#[async_trait]
impl CompressionIndexer for PhotonIndexer {
    async fn get_state_tree_infos(&self) -> std::result::Result<Vec<TreeInfo>, RpcError> {
        if self.sources.lookup_table.is_none() && self.sources.static_trees.is_empty() {
            return Err(RpcError::Unknown("no state tree source configured".to_string()));
        }

        let mut trees = Vec::new();
        if let Some(table) = &self.sources.lookup_table {
            // The shared table only ever lists V1 trees
            trees.extend(
                self.lookup_table_addresses(table)
                    .await?
                    .chunks_exact(3)
                    .map(|triple| TreeInfo {
                        tree: triple[0],
                        queue: triple[1],
                        tree_type: TreeType::V1,
                        cpi_context: Some(triple[2]),
                    }),
            );
        }
        for tree in &self.sources.static_trees {
            if !trees.iter().any(|known: &TreeInfo| known.tree == tree.tree) {
                trees.push(*tree);
            }
        }

        if let Some(table) = &self.sources.nullify_table {
            let nullified = self.lookup_table_addresses(table).await?;
            let before = trees.len();
            trees.retain(|info| !nullified.contains(&info.tree) && !nullified.contains(&info.queue));
            debug!(dropped = before - trees.len(), "Filtered nullified state trees");
        }

        info!(count = trees.len(), "Loaded state trees");
        Ok(trees)
    }

    async fn get_compressed_accounts_by_owner(
        &self,
        owner: &Pubkey,
    ) -> std::result::Result<Vec<Value>, RpcError> {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut params = json!({ "owner": owner.to_string() });
            if let Some(cursor) = &cursor {
                params["cursor"] = Value::String(cursor.clone());
            }

            let mut result = self.call("getCompressedAccountsByOwner", params).await?;
            let value = take_field(&mut result, "value");

            if let Some(page) = value.get("items").and_then(Value::as_array) {
                items.extend(page.iter().cloned());
            }

            match value.get("cursor").and_then(Value::as_str) {
                Some(next) if !next.is_empty() && cursor.as_deref() != Some(next) => {
                    cursor = Some(next.to_string());
                }
                _ => break,
            }
        }

        // Photon only names the tree; queue and version come from the known trees
        let known: HashMap<Pubkey, TreeInfo> = if items.iter().any(needs_tree_info) {
            self.get_state_tree_infos()
                .await?
                .into_iter()
                .map(|info| (info.tree, info))
                .collect()
        } else {
            HashMap::new()
        };
        let items: Vec<Value> = items
            .into_iter()
            .map(|item| normalize_account(item, &known))
            .collect();

        debug!(owner = %owner, count = items.len(), "Fetched compressed accounts");
        Ok(items)
    }

    async fn get_validity_proof(
        &self,
        inputs: &[ProofInput],
    ) -> std::result::Result<ValidityProof, RpcError> {
        let hashes: Vec<String> = inputs
            .iter()
            .map(|input| bs58::encode(input.hash).into_string())
            .collect();

        let mut result = self
            .call(
                "getValidityProof",
                json!({ "hashes": hashes, "newAddressesWithTrees": [] }),
            )
            .await?;

        let raw: RawValidityProof = serde_json::from_value(take_field(&mut result, "value"))
            .map_err(|e| RpcError::Unknown(format!("unexpected validity proof shape: {e}")))?;

        let compressed_proof = raw.compressed_proof.map(RawProofPoints::into_proof).transpose()?;

        Ok(ValidityProof {
            compressed_proof,
            root_indices: raw.root_indices,
        })
    }

    async fn get_compressed_balance_by_owner(
        &self,
        owner: &Pubkey,
    ) -> std::result::Result<u64, RpcError> {
        let result = self
            .call(
                "getCompressedBalanceByOwner",
                json!({ "owner": owner.to_string() }),
            )
            .await?;

        result
            .get("value")
            .and_then(Value::as_u64)
            .ok_or_else(|| RpcError::Unknown("balance missing from indexer response".to_string()))
    }
}

fn needs_tree_info(item: &Value) -> bool {
    item.get("treeInfo").is_none() && item.get("merkleContext").is_none()
}

/// Rewrite a Photon account item into the shape the hydrator reads
///
/// The base58 hash becomes `0x` hex. A bare `tree` is expanded into a full
/// `treeInfo` when the tree is known; otherwise the item stays without one.
fn normalize_account(mut item: Value, known: &HashMap<Pubkey, TreeInfo>) -> Value {
    let hash = item
        .get("hash")
        .and_then(Value::as_str)
        .and_then(|hash| bs58::decode(hash).into_vec().ok())
        .filter(|bytes| bytes.len() == 32);
    if let Some(bytes) = hash {
        let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
        item["hash"] = Value::String(format!("0x{hex}"));
    }

    if needs_tree_info(&item) {
        let info = item
            .get("tree")
            .and_then(Value::as_str)
            .and_then(|tree| tree.parse::<Pubkey>().ok())
            .and_then(|tree| known.get(&tree));
        match info {
            Some(info) => {
                item["treeInfo"] = json!({
                    "tree": info.tree.to_string(),
                    "queue": info.queue.to_string(),
                    "treeType": info.tree_type as u64,
                    "cpiContext": info.cpi_context.map(|key| key.to_string()),
                });
            }
            None => debug!(tree = ?item.get("tree"), "Account tree not among known state trees"),
        }
    }

    item
}

fn take_field(value: &mut Value, key: &str) -> Value {
    value.get_mut(key).map(Value::take).unwrap_or(Value::Null)
}

fn map_transport_error(err: reqwest::Error) -> RpcError {
    if let Some(status) = err.status() {
        return RpcError::from_status(status.as_u16(), err.to_string());
    }
    if err.is_timeout() || err.is_connect() {
        return RpcError::Network(err.to_string());
    }
    RpcError::classify(err.to_string())
}
