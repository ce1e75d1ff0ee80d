//! Stealth identity derived from a wallet signature
//!
//! `seed = sha256(signature(message))`, keypair from seed. The same wallet
//! signing the same message always yields the same identity, so nothing is
//! stored.

use async_trait::async_trait;
use solana_sdk::{
    hash::hash,
    pubkey::Pubkey,
    signature::{Keypair, Signature},
    signer::{keypair::keypair_from_seed, Signer},
};
use tracing::info;

use crate::error::{BackendError, Result};

/// Anything able to sign an arbitrary message on behalf of a wallet
#[async_trait]
pub trait MessageSigner: Send + Sync {
    fn pubkey(&self) -> Pubkey;

    async fn sign_message(&self, message: &[u8]) -> anyhow::Result<Signature>;
}

/// Local keypairs sign directly
#[async_trait]
impl MessageSigner for Keypair {
    fn pubkey(&self) -> Pubkey {
        Signer::pubkey(self)
    }

    async fn sign_message(&self, message: &[u8]) -> anyhow::Result<Signature> {
        Ok(Signer::sign_message(self, message))
    }
}

/// Fixed message for a handle; any change breaks recovery of existing identities
pub fn identity_message(handle: &str) -> String {
    format!("Sign this message to generate your Stealth Identity for {handle}.stealth")
}

/// Derived secondary identity; lives only in memory
pub struct StealthIdentity {
    keypair: Keypair,
}

impl StealthIdentity {
    pub fn pubkey(&self) -> Pubkey {
        Signer::pubkey(&self.keypair)
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }
}

impl std::fmt::Debug for StealthIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StealthIdentity")
            .field("pubkey", &self.pubkey())
            .finish_non_exhaustive()
    }
}

pub fn keypair_from_signature(signature: &Signature) -> Result<Keypair> {
    let seed = hash(signature.as_ref()).to_bytes();
    keypair_from_seed(&seed).map_err(|e| BackendError::IdentityDerivation(e.to_string()))
}

/// Ask `signer` to sign the identity message for `handle` and derive the keypair.
/// A refused signature is an error; there is no random fallback.
pub async fn derive_identity(signer: &dyn MessageSigner, handle: &str) -> Result<StealthIdentity> {
    let message = identity_message(handle);

    let signature = signer
        .sign_message(message.as_bytes())
        .await
        .map_err(|e| BackendError::IdentityDerivation(e.to_string()))?;

    let keypair = keypair_from_signature(&signature)?;

    info!(
        wallet = %signer.pubkey(),
        stealth = %Signer::pubkey(&keypair),
        "Derived stealth identity"
    );

    Ok(StealthIdentity { keypair })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RefusingSigner;

    #[async_trait]
    impl MessageSigner for RefusingSigner {
        fn pubkey(&self) -> Pubkey {
            Pubkey::default()
        }

        async fn sign_message(&self, _message: &[u8]) -> anyhow::Result<Signature> {
            anyhow::bail!("User rejected the request")
        }
    }

    #[test]
    fn test_identity_message() {
        assert_eq!(
            identity_message("alice"),
            "Sign this message to generate your Stealth Identity for alice.stealth"
        );
    }

    #[tokio::test]
    async fn test_derivation_is_deterministic() {
        let wallet = Keypair::new();

        let first = derive_identity(&wallet, "alice").await.unwrap();
        let second = derive_identity(&wallet, "alice").await.unwrap();
        assert_eq!(first.pubkey(), second.pubkey());
        assert_ne!(first.pubkey(), Signer::pubkey(&wallet));

        // Same signature from another "session"
        let signature = Signer::sign_message(&wallet, identity_message("alice").as_bytes());
        let recovered = keypair_from_signature(&signature).unwrap();
        assert_eq!(Signer::pubkey(&recovered), first.pubkey());
    }

    #[tokio::test]
    async fn test_message_binds_handle() {
        let wallet = Keypair::new();
        let alice = derive_identity(&wallet, "alice").await.unwrap();
        let bob = derive_identity(&wallet, "bob").await.unwrap();
        assert_ne!(alice.pubkey(), bob.pubkey());
    }

    #[tokio::test]
    async fn test_refused_signature_is_error() {
        let result = derive_identity(&RefusingSigner, "alice").await;
        assert!(matches!(result, Err(BackendError::IdentityDerivation(_))));
    }
}
