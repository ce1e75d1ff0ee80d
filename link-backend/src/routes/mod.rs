//! API Routes

pub mod actions;
pub mod health;

use std::sync::Arc;

use tracing::warn;

use crate::rpc::{RpcContext, SolanaLedger};
use crate::services::domains::{DomainResolver, SnsResolver};
use crate::types::Config;

pub use actions::actions_router;
pub use health::health_router;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    /// `None` when no RPC endpoint is configured; transaction paths then answer 500
    pub rpc: Option<RpcContext>,
    pub domains: Arc<dyn DomainResolver>,
}

impl AppState {
    /// Production clients built once at start-up
    pub fn from_config(config: Config) -> Self {
        let rpc = match RpcContext::from_config(&config) {
            Ok(ctx) => Some(ctx),
            Err(err) => {
                warn!(error = %err, "RPC clients unavailable, transaction endpoints will fail");
                None
            }
        };

        // `.sol` resolution may use the public endpoint; nothing else does
        let resolution_ledger = Arc::new(SolanaLedger::new(
            config.resolution_rpc_url(),
            config.max_send_retries,
        ));
        let domains: Arc<dyn DomainResolver> = Arc::new(SnsResolver::new(resolution_ledger));

        Self {
            config: Arc::new(config),
            rpc,
            domains,
        }
    }
}
