//! Handle to recipient key resolution
//!
//! Order: plain public key, then `.sol` domain, then `.stealth` registry entry.

use std::sync::Arc;

use solana_sdk::pubkey::Pubkey;
use tracing::{info, warn};

use crate::codec::{registry_entry_address, validate_handle, RegistryRecord};
use crate::error::{BackendError, Result};
use crate::rpc::LedgerRpc;
use crate::services::domains::DomainResolver;

pub const SOL_SUFFIX: &str = ".sol";
pub const STEALTH_SUFFIX: &str = ".stealth";

/// Where a resolved key came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionSource {
    PlainKey,
    Domain,
    /// `legacy` marks the authority fallback for pre-destination records
    Registry { legacy: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub recipient: Pubkey,
    pub source: ResolutionSource,
}

/// Strip a case-insensitive suffix
fn strip_suffix_ci<'a>(s: &'a str, suffix: &str) -> Option<&'a str> {
    let split = s.len().checked_sub(suffix.len())?;
    let tail = s.get(split..)?;
    tail.eq_ignore_ascii_case(suffix).then(|| &s[..split])
}

pub fn is_domain_handle(handle: &str) -> bool {
    strip_suffix_ci(handle, SOL_SUFFIX).is_some() || strip_suffix_ci(handle, STEALTH_SUFFIX).is_some()
}

pub struct HandleResolver {
    registry_program_id: Pubkey,
    domains: Arc<dyn DomainResolver>,
    /// Required for `.stealth` lookups only
    ledger: Option<Arc<dyn LedgerRpc>>,
}

impl HandleResolver {
    pub fn new(
        registry_program_id: Pubkey,
        domains: Arc<dyn DomainResolver>,
        ledger: Option<Arc<dyn LedgerRpc>>,
    ) -> Self {
        Self {
            registry_program_id,
            domains,
            ledger,
        }
    }

    pub async fn resolve(&self, handle: &str) -> Result<Resolution> {
        let handle = handle.trim();

        if let Ok(recipient) = handle.parse::<Pubkey>() {
            return Ok(Resolution {
                recipient,
                source: ResolutionSource::PlainKey,
            });
        }

        if strip_suffix_ci(handle, SOL_SUFFIX).is_some() {
            let recipient = self.domains.resolve_owner(handle).await?;
            return Ok(Resolution {
                recipient,
                source: ResolutionSource::Domain,
            });
        }

        if let Some(bare) = strip_suffix_ci(handle, STEALTH_SUFFIX) {
            return self.resolve_registry(handle, bare).await;
        }

        Err(BackendError::InvalidAddress(handle.to_string()))
    }

    async fn resolve_registry(&self, handle: &str, bare: &str) -> Result<Resolution> {
        validate_handle(bare)?;

        let ledger = self
            .ledger
            .as_ref()
            .ok_or_else(|| BackendError::Configuration("Missing RPC URL".to_string()))?;

        let (entry, _) = registry_entry_address(&self.registry_program_id, bare);

        let data = ledger
            .get_account_data(&entry)
            .await?
            .ok_or_else(|| BackendError::HandleNotRegistered {
                handle: handle.to_string(),
            })?;

        let record = RegistryRecord::decode(&data).map_err(|source| {
            BackendError::MalformedRegistryRecord {
                handle: handle.to_string(),
                source,
            }
        })?;

        let (recipient, legacy) = record.payout_key();
        if legacy {
            warn!(
                handle,
                authority = %recipient,
                "Registry record has no destination field, falling back to authority"
            );
        } else {
            info!(handle, recipient = %recipient, "Resolved handle from registry");
        }

        Ok(Resolution {
            recipient,
            source: ResolutionSource::Registry { legacy },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::mock::MockLedger;
    use async_trait::async_trait;

    struct FixedDomains(Option<Pubkey>);

    #[async_trait]
    impl DomainResolver for FixedDomains {
        async fn resolve_owner(&self, domain: &str) -> Result<Pubkey> {
            self.0.ok_or_else(|| BackendError::DomainResolution {
                domain: domain.to_string(),
                reason: "Domain has no owner".to_string(),
            })
        }
    }

    fn program() -> Pubkey {
        Pubkey::new_from_array([42; 32])
    }

    fn resolver(domain_owner: Option<Pubkey>, ledger: Option<MockLedger>) -> HandleResolver {
        HandleResolver::new(
            program(),
            Arc::new(FixedDomains(domain_owner)),
            ledger.map(|l| Arc::new(l) as Arc<dyn LedgerRpc>),
        )
    }

    fn record(handle: &str, destination: Option<Pubkey>) -> (Pubkey, RegistryRecord) {
        let authority = Pubkey::new_unique();
        (
            authority,
            RegistryRecord {
                handle: handle.to_string(),
                authority,
                destination,
                bump: destination.map(|_| 254),
            },
        )
    }

    #[test]
    fn test_suffix_is_case_insensitive() {
        assert_eq!(strip_suffix_ci("Alice.SOL", SOL_SUFFIX), Some("Alice"));
        assert_eq!(strip_suffix_ci("sol", SOL_SUFFIX), None);
        assert!(is_domain_handle("bob.Stealth"));
        assert!(!is_domain_handle("bob"));
    }

    #[tokio::test]
    async fn test_plain_key_wins() {
        let key = Pubkey::new_unique();
        let resolution = resolver(None, None).resolve(&key.to_string()).await.unwrap();
        assert_eq!(resolution.recipient, key);
        assert_eq!(resolution.source, ResolutionSource::PlainKey);
    }

    #[tokio::test]
    async fn test_sol_domain() {
        let owner = Pubkey::new_unique();
        let resolution = resolver(Some(owner), None).resolve("alice.sol").await.unwrap();
        assert_eq!(resolution.recipient, owner);

        let err = resolver(None, None).resolve("alice.sol").await.unwrap_err();
        assert!(err.to_string().contains("Could not resolve .sol domain"));
    }

    #[tokio::test]
    async fn test_registered_handle_returns_destination() {
        let destination = Pubkey::new_unique();
        let (_, entry) = record("alice", Some(destination));
        let (address, _) = registry_entry_address(&program(), "alice");
        let ledger = MockLedger::default().with_account(address, entry.encode());

        let resolution = resolver(None, Some(ledger)).resolve("alice.stealth").await.unwrap();
        assert_eq!(resolution.recipient, destination);
        assert_eq!(resolution.source, ResolutionSource::Registry { legacy: false });
    }

    #[tokio::test]
    async fn test_legacy_record_falls_back_to_authority() {
        let (authority, entry) = record("bob", None);
        let data = entry.encode();
        assert_eq!(data.len(), 8 + 4 + 3 + 32);

        let (address, _) = registry_entry_address(&program(), "bob");
        let ledger = MockLedger::default().with_account(address, data);

        let resolution = resolver(None, Some(ledger)).resolve("bob.stealth").await.unwrap();
        assert_eq!(resolution.recipient, authority);
        assert_eq!(resolution.source, ResolutionSource::Registry { legacy: true });
    }

    #[tokio::test]
    async fn test_unregistered_handle() {
        let err = resolver(None, Some(MockLedger::default()))
            .resolve("carol.stealth")
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::HandleNotRegistered { ref handle } if handle == "carol.stealth"));
        assert!(err.to_string().contains("Ensure it is registered."));
    }

    #[tokio::test]
    async fn test_stealth_without_rpc_is_configuration_error() {
        let err = resolver(None, None).resolve("alice.stealth").await.unwrap_err();
        assert!(matches!(err, BackendError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_invalid_handle_and_address() {
        let err = resolver(None, Some(MockLedger::default()))
            .resolve("bad-name.stealth")
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::InvalidHandle(_)));

        let err = resolver(None, None).resolve("not a key").await.unwrap_err();
        assert!(matches!(err, BackendError::InvalidAddress(_)));
        assert!(err.to_string().starts_with("Invalid Creator Address"));
    }
}
