//! Resolution, hydration and transaction building

pub mod assembler;
pub mod domains;
pub mod hydrator;
pub mod identity;
pub mod registration;
pub mod resolver;
pub mod shield;
pub mod unshield;

pub use assembler::{AssemblerConfig, RetryPolicy, TransactionAssembler};
pub use domains::{DomainResolver, SnsResolver};
pub use identity::{derive_identity, MessageSigner, StealthIdentity};
pub use resolver::{HandleResolver, Resolution, ResolutionSource};
pub use shield::{parse_amount, select_output_tree, Amount, ShieldBuilder};
pub use unshield::{UnshieldAggregator, UnshieldPlan, UnshieldRequest};
