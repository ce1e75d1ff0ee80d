//! Per-user session: flow state, in-memory stealth identity, balance polling
//!
//! One operation runs at a time. A torn-down session stops reporting progress
//! but never cancels a transaction that is already broadcast.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use solana_sdk::{pubkey::Pubkey, signature::Signature, signer::Signer};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::codec::{registry_entry_address, RegistryRecord};
use crate::error::{BackendError, Result};
use crate::rpc::RpcContext;
use crate::services::assembler::{AssemblerConfig, TransactionAssembler};
use crate::services::identity::{derive_identity, MessageSigner, StealthIdentity};
use crate::services::registration::RegistrationBuilder;
use crate::services::unshield::{IdentityRole, UnshieldAggregator, UnshieldRequest};
use crate::types::Config;

// ============ Flow state ============

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowState {
    Idle,
    DerivingIdentity,
    Resolving,
    ProofFetch,
    Signing,
    Sending,
    Confirming,
    Success { signature: String },
    Error { message: String },
}

impl FlowState {
    pub fn name(&self) -> &'static str {
        match self {
            FlowState::Idle => "idle",
            FlowState::DerivingIdentity => "deriving-identity",
            FlowState::Resolving => "resolving",
            FlowState::ProofFetch => "proof-fetch",
            FlowState::Signing => "signing",
            FlowState::Sending => "sending",
            FlowState::Confirming => "confirming",
            FlowState::Success { .. } => "success",
            FlowState::Error { .. } => "error",
        }
    }

    /// Position in the forward-only pipeline; `None` for idle and error
    fn stage(&self) -> Option<u8> {
        match self {
            FlowState::DerivingIdentity => Some(1),
            FlowState::Resolving => Some(2),
            FlowState::ProofFetch => Some(3),
            FlowState::Signing => Some(4),
            FlowState::Sending => Some(5),
            FlowState::Confirming => Some(6),
            FlowState::Success { .. } => Some(7),
            FlowState::Idle | FlowState::Error { .. } => None,
        }
    }

    /// An operation is in flight
    pub fn is_active(&self) -> bool {
        !matches!(
            self,
            FlowState::Idle | FlowState::Success { .. } | FlowState::Error { .. }
        )
    }

    pub fn transition(&self, next: FlowState) -> Result<FlowState> {
        let allowed = match (self, &next) {
            (FlowState::Idle, next) => next.is_active(),
            (FlowState::Success { .. } | FlowState::Error { .. }, FlowState::Idle) => true,
            (current, FlowState::Error { .. }) => current.is_active(),
            (current, next) if current.is_active() => match (current.stage(), next.stage()) {
                (Some(from), Some(to)) => to > from,
                _ => false,
            },
            _ => false,
        };

        if allowed {
            Ok(next)
        } else {
            Err(BackendError::InvalidTransition {
                from: self.name(),
                to: next.name(),
            })
        }
    }
}

// ============ Balance polling ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Balances {
    pub public_lamports: u64,
    /// Summed over the wallet and the stealth identity
    pub shielded_lamports: u64,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Fixed-interval balance refresh; the task is aborted when this is dropped
pub struct BalancePoller {
    handle: JoinHandle<()>,
}

impl BalancePoller {
    pub fn spawn(
        ctx: RpcContext,
        wallet: Pubkey,
        shielded_owners: Vec<Pubkey>,
        interval: Duration,
    ) -> (Self, watch::Receiver<Balances>) {
        let (tx, rx) = watch::channel(Balances::default());

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match fetch_balances(&ctx, &wallet, &shielded_owners).await {
                    Ok(balances) => {
                        if tx.send(balances).is_err() {
                            debug!("Balance receivers gone, stopping poller");
                            break;
                        }
                    }
                    Err(err) => warn!(wallet = %wallet, error = %err, "Balance refresh failed"),
                }
            }
        });

        (Self { handle }, rx)
    }

    pub fn stop(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for BalancePoller {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub async fn fetch_balances(ctx: &RpcContext, wallet: &Pubkey, shielded_owners: &[Pubkey]) -> Result<Balances> {
    let public_lamports = ctx.ledger.get_balance(wallet).await?;

    let shielded = try_join_all(
        shielded_owners
            .iter()
            .map(|owner| ctx.indexer.get_compressed_balance_by_owner(owner)),
    )
    .await?;
    let shielded_lamports = shielded.into_iter().fold(0u64, u64::saturating_add);

    Ok(Balances {
        public_lamports,
        shielded_lamports,
        updated_at: Some(Utc::now()),
    })
}

// ============ Session ============

pub struct Session<W> {
    ctx: RpcContext,
    config: Config,
    wallet: Arc<W>,
    /// Last derived identity and the handle it was derived for
    identity: Mutex<Option<(String, Arc<StealthIdentity>)>>,
    state: Mutex<FlowState>,
    attached: AtomicBool,
    poller: Mutex<Option<BalancePoller>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // Poisoning is ignored; every write is a single assignment
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<W> Session<W>
where
    W: Signer + MessageSigner + 'static,
{
    pub fn new(ctx: RpcContext, config: Config, wallet: Arc<W>) -> Self {
        Self {
            ctx,
            config,
            wallet,
            identity: Mutex::new(None),
            state: Mutex::new(FlowState::Idle),
            attached: AtomicBool::new(true),
            poller: Mutex::new(None),
        }
    }

    pub fn wallet_pubkey(&self) -> Pubkey {
        Signer::pubkey(self.wallet.as_ref())
    }

    pub fn state(&self) -> FlowState {
        lock(&self.state).clone()
    }

    pub fn stealth_pubkey(&self) -> Option<Pubkey> {
        lock(&self.identity).as_ref().map(|(_, identity)| identity.pubkey())
    }

    fn cached_identity(&self, handle: &str) -> Option<Arc<StealthIdentity>> {
        match lock(&self.identity).as_ref() {
            Some((cached, identity)) if cached == handle => Some(identity.clone()),
            _ => None,
        }
    }

    /// Enter the first stage of an operation; rejected while another is in flight
    pub fn begin(&self, first: FlowState) -> Result<()> {
        let mut state = lock(&self.state);
        if state.is_active() {
            return Err(BackendError::FlowBusy);
        }
        // A finished flow returns to idle before the next one starts
        if *state != FlowState::Idle {
            *state = state.transition(FlowState::Idle)?;
        }
        *state = state.transition(first)?;
        debug!(state = state.name(), "Flow started");
        Ok(())
    }

    fn advance(&self, next: FlowState) -> Result<()> {
        if !self.attached.load(Ordering::SeqCst) {
            return Ok(());
        }
        let mut state = lock(&self.state);
        *state = state.transition(next)?;
        debug!(state = state.name(), "Flow advanced");
        Ok(())
    }

    fn settle(&self, outcome: &Result<Signature>) {
        if !self.attached.load(Ordering::SeqCst) {
            return;
        }
        let mut state = lock(&self.state);
        let next = match outcome {
            Ok(signature) => FlowState::Success {
                signature: signature.to_string(),
            },
            Err(err) => FlowState::Error {
                message: err.to_string(),
            },
        };
        match state.transition(next) {
            Ok(next) => *state = next,
            Err(err) => warn!(error = %err, "Could not settle flow state"),
        }
    }

    /// Return to idle after success or error
    pub fn reset(&self) -> Result<()> {
        let mut state = lock(&self.state);
        *state = state.transition(FlowState::Idle)?;
        Ok(())
    }

    fn assembler(&self) -> TransactionAssembler<'_> {
        TransactionAssembler::new(&self.ctx, AssemblerConfig::from(&self.config))
    }

    /// Derive the stealth identity for `handle`, reusing it while the handle stays the same
    async fn identity(&self, handle: &str) -> Result<Arc<StealthIdentity>> {
        if let Some(identity) = self.cached_identity(handle) {
            return Ok(identity);
        }

        let identity = Arc::new(derive_identity(self.wallet.as_ref(), handle).await?);
        *lock(&self.identity) = Some((handle.to_string(), identity.clone()));
        Ok(identity)
    }

    /// Register `handle` with the derived stealth identity as payout key
    pub async fn register(&self, handle: &str) -> Result<Signature> {
        self.begin(FlowState::DerivingIdentity)?;
        let outcome = self.register_inner(handle).await;
        self.settle(&outcome);
        outcome
    }

    async fn register_inner(&self, handle: &str) -> Result<Signature> {
        let identity = self.identity(handle).await?;

        self.advance(FlowState::Resolving)?;
        let config = AssemblerConfig::from(&self.config);
        let instruction = RegistrationBuilder::new(&self.ctx, self.config.registry_program_id, config)
            .prepare(&self.wallet_pubkey(), handle, &identity.pubkey())
            .await?;

        self.submit(None, None, instruction).await
    }

    /// Withdraw all shielded value of one identity to `destination` (the wallet by default)
    pub async fn withdraw(&self, handle: Option<&str>, destination: Option<Pubkey>) -> Result<Signature> {
        let first = match handle {
            Some(handle) if self.cached_identity(handle).is_none() => FlowState::DerivingIdentity,
            _ => FlowState::Resolving,
        };
        self.begin(first)?;
        let outcome = self.withdraw_inner(handle, destination).await;
        self.settle(&outcome);
        outcome
    }

    async fn withdraw_inner(&self, handle: Option<&str>, destination: Option<Pubkey>) -> Result<Signature> {
        let identity = match handle {
            Some(handle) => Some(self.identity(handle).await?),
            None => lock(&self.identity).as_ref().map(|(_, identity)| identity.clone()),
        };

        if self.state() == FlowState::DerivingIdentity {
            self.advance(FlowState::Resolving)?;
        }

        let record = match handle {
            Some(handle) => self.registry_record(handle).await?,
            None => None,
        };

        let request = UnshieldRequest {
            wallet: self.wallet_pubkey(),
            stealth: identity.as_ref().map(|identity| identity.pubkey()),
            registry_destination: record.as_ref().and_then(|record| record.destination),
            registry_authority: record.as_ref().map(|record| record.authority),
            destination,
        };

        self.advance(FlowState::ProofFetch)?;
        let plan = UnshieldAggregator::new(&self.ctx, self.config.rent_safety_margin_lamports)
            .plan(&request)
            .await?;

        let secondary = match (plan.role, &identity) {
            (IdentityRole::Stealth, Some(identity)) => Some(identity.clone()),
            _ => None,
        };

        info!(
            authority = %plan.authority,
            lamports = plan.total_lamports,
            "Submitting withdrawal"
        );

        self.submit(secondary.as_deref(), plan.funding, plan.instruction).await
    }

    async fn registry_record(&self, handle: &str) -> Result<Option<RegistryRecord>> {
        let (entry, _) = registry_entry_address(&self.config.registry_program_id, handle);
        let Some(data) = self.ctx.ledger.get_account_data(&entry).await? else {
            return Ok(None);
        };
        RegistryRecord::decode(&data)
            .map(Some)
            .map_err(|source| BackendError::MalformedRegistryRecord {
                handle: format!("{handle}.stealth"),
                source,
            })
    }

    async fn submit(
        &self,
        secondary: Option<&StealthIdentity>,
        funding: Option<solana_sdk::instruction::Instruction>,
        instruction: solana_sdk::instruction::Instruction,
    ) -> Result<Signature> {
        let assembler = self.assembler();

        self.advance(FlowState::Signing)?;
        let secondary: Option<&dyn Signer> = secondary.map(|identity| identity.keypair() as &dyn Signer);
        let assembled = assembler
            .assemble(self.wallet.as_ref(), secondary, funding, instruction)
            .await?;

        self.advance(FlowState::Sending)?;
        let signature = assembler.send(&assembled).await?;

        self.advance(FlowState::Confirming)?;
        assembler
            .confirm(&signature, assembled.last_valid_block_height)
            .await?;

        Ok(signature)
    }

    /// Start (or restart) balance polling for the wallet and stealth identity
    pub fn start_balance_polling(&self) -> watch::Receiver<Balances> {
        let wallet = self.wallet_pubkey();
        let mut owners = vec![wallet];
        owners.extend(self.stealth_pubkey());

        let interval = Duration::from_secs(self.config.balance_poll_interval_secs.max(1));
        let (poller, rx) = BalancePoller::spawn(self.ctx.clone(), wallet, owners, interval);

        // Replacing the old poller drops and aborts it
        *lock(&self.poller) = Some(poller);
        rx
    }

    /// Stop polling, forget the identity and stop reporting progress
    pub fn teardown(&self) {
        self.attached.store(false, Ordering::SeqCst);
        if let Some(poller) = lock(&self.poller).take() {
            poller.stop();
        }
        *lock(&self.identity) = None;
        info!(wallet = %self.wallet_pubkey(), "Session torn down");
    }
}

impl<W> Drop for Session<W> {
    fn drop(&mut self) {
        if let Some(poller) = lock(&self.poller).take() {
            poller.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::mock::{MockIndexer, MockLedger};
    use crate::types::{TreeInfo, TreeType};
    use serde_json::json;
    use solana_sdk::signature::Keypair;
    use std::collections::HashMap;

    fn test_config() -> Config {
        Config {
            confirm_poll_interval_ms: 1,
            balance_poll_interval_secs: 1,
            ..Config::default()
        }
    }

    fn session(ledger: MockLedger, indexer: MockIndexer) -> (Session<Keypair>, Arc<MockLedger>) {
        let ledger = Arc::new(ledger);
        let ctx = RpcContext::new(ledger.clone(), Arc::new(indexer));
        (Session::new(ctx, test_config(), Arc::new(Keypair::new())), ledger)
    }

    #[test]
    fn test_forward_transitions() {
        let state = FlowState::Idle;
        let state = state.transition(FlowState::DerivingIdentity).unwrap();
        // Registration skips proof fetch
        let state = state.transition(FlowState::Resolving).unwrap();
        let state = state.transition(FlowState::Signing).unwrap();
        let state = state.transition(FlowState::Sending).unwrap();
        let state = state.transition(FlowState::Confirming).unwrap();
        let state = state
            .transition(FlowState::Success {
                signature: "sig".into(),
            })
            .unwrap();
        assert_eq!(state.transition(FlowState::Idle).unwrap(), FlowState::Idle);
    }

    #[test]
    fn test_backward_and_illegal_transitions() {
        assert!(FlowState::Sending.transition(FlowState::Resolving).is_err());
        assert!(FlowState::Signing.transition(FlowState::Signing).is_err());
        assert!(FlowState::Idle.transition(FlowState::Idle).is_err());
        assert!(FlowState::Idle
            .transition(FlowState::Error {
                message: "x".into()
            })
            .is_err());
        assert!(FlowState::Signing.transition(FlowState::Idle).is_err());

        let err = FlowState::Confirming
            .transition(FlowState::DerivingIdentity)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid flow transition from confirming to deriving-identity"
        );
    }

    #[test]
    fn test_error_reenters_idle() {
        let error = FlowState::ProofFetch
            .transition(FlowState::Error {
                message: "proof rejected".into(),
            })
            .unwrap();
        assert_eq!(error.transition(FlowState::Idle).unwrap(), FlowState::Idle);
        assert!(error.transition(FlowState::Signing).is_err());
    }

    #[tokio::test]
    async fn test_begin_rejects_concurrent_flows() {
        let (session, _) = session(MockLedger::default(), MockIndexer::default());
        session.begin(FlowState::Resolving).unwrap();
        assert!(matches!(
            session.begin(FlowState::DerivingIdentity),
            Err(BackendError::FlowBusy)
        ));
    }

    #[tokio::test]
    async fn test_register_flow_succeeds() {
        let (session, ledger) = session(MockLedger::default(), MockIndexer::default());

        let signature = session.register("alice").await.unwrap();
        assert_eq!(
            session.state(),
            FlowState::Success {
                signature: signature.to_string()
            }
        );
        assert!(session.stealth_pubkey().is_some());
        assert_eq!(ledger.sent_count(), 1);

        // A finished flow does not block the next one
        session.begin(FlowState::Resolving).unwrap();
    }

    fn registered_destination(tx: &solana_sdk::transaction::Transaction) -> Pubkey {
        // Compute limit, compute price, register
        let data = &tx.message.instructions[2].data;
        Pubkey::try_from(&data[data.len() - 32..]).unwrap()
    }

    #[tokio::test]
    async fn test_each_handle_registers_its_own_identity() {
        let wallet = Arc::new(Keypair::new());
        let ledger = Arc::new(MockLedger::default());
        let ctx = RpcContext::new(ledger.clone(), Arc::new(MockIndexer::default()));
        let session = Session::new(ctx, test_config(), wallet.clone());

        session.register("alice").await.unwrap();
        session.reset().unwrap();
        session.register("bob").await.unwrap();

        let alice = derive_identity(wallet.as_ref(), "alice").await.unwrap().pubkey();
        let bob = derive_identity(wallet.as_ref(), "bob").await.unwrap().pubkey();
        assert_ne!(alice, bob);

        let sent = ledger.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(registered_destination(&sent[0]), alice);
        assert_eq!(registered_destination(&sent[1]), bob);
        assert_eq!(session.stealth_pubkey(), Some(bob));
    }

    #[tokio::test]
    async fn test_failed_flow_lands_in_error() {
        let (session, ledger) = session(MockLedger::default(), MockIndexer::default());

        let err = session.register("bad handle").await.unwrap_err();
        assert!(matches!(err, BackendError::InvalidHandle(_)));
        assert!(matches!(session.state(), FlowState::Error { .. }));
        assert_eq!(ledger.sent_count(), 0);

        session.reset().unwrap();
        assert_eq!(session.state(), FlowState::Idle);
    }

    #[tokio::test]
    async fn test_withdraw_from_stealth_identity() {
        let wallet = Arc::new(Keypair::new());
        let stealth = derive_identity(wallet.as_ref(), "alice").await.unwrap().pubkey();

        let tree = TreeInfo {
            tree: Pubkey::new_unique(),
            queue: Pubkey::new_unique(),
            tree_type: TreeType::V1,
            cpi_context: None,
        };
        let record = json!({
            "hash": "7",
            "owner": stealth.to_string(),
            "lamports": 500_000_000u64,
            "leafIndex": 0,
            "treeInfo": {
                "tree": tree.tree.to_string(),
                "queue": tree.queue.to_string(),
                "treeType": 1,
            },
        });
        let indexer = MockIndexer {
            accounts: HashMap::from([(stealth, vec![record])]),
            ..MockIndexer::default()
        };
        let ledger = Arc::new(MockLedger::default());
        let ctx = RpcContext::new(ledger.clone(), Arc::new(indexer));
        let session = Session::new(ctx, test_config(), wallet.clone());

        session.withdraw(Some("alice"), None).await.unwrap();

        let sent = ledger.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let tx = &sent[0];
        // Fee payer plus stealth authority
        assert_eq!(tx.message.header.num_required_signatures, 2);
        // Compute limit, compute price, rent funding, decompress
        assert_eq!(tx.message.instructions.len(), 4);
        assert!(tx.verify().is_ok());
    }

    #[tokio::test]
    async fn test_balance_poller_publishes_and_stops_on_teardown() {
        let wallet = Keypair::new();
        let wallet_key = Signer::pubkey(&wallet);
        let ledger = MockLedger::default().with_balance(wallet_key, 42);
        let indexer = MockIndexer {
            balances: HashMap::from([(wallet_key, 7)]),
            ..MockIndexer::default()
        };
        let ctx = RpcContext::new(Arc::new(ledger), Arc::new(indexer));
        let session = Session::new(ctx, test_config(), Arc::new(wallet));

        let mut rx = session.start_balance_polling();
        rx.changed().await.unwrap();
        let balances = *rx.borrow();
        assert_eq!(balances.public_lamports, 42);
        assert_eq!(balances.shielded_lamports, 7);
        assert!(balances.updated_at.is_some());

        session.teardown();
        // The aborted task drops its sender
        assert!(rx.changed().await.is_err());
        assert!(session.stealth_pubkey().is_none());
    }

    #[tokio::test]
    async fn test_torn_down_session_stops_reporting() {
        let (session, _) = session(MockLedger::default(), MockIndexer::default());
        session.begin(FlowState::Resolving).unwrap();
        session.teardown();
        session.advance(FlowState::Signing).unwrap();
        assert_eq!(session.state(), FlowState::Resolving);
    }
}
