//! Stealth Link backend
//!
//! Resolves donation handles, builds shielded deposits into the compression
//! pool, and assembles withdrawals from it. The HTTP surface hosts the
//! donation action endpoint.

pub mod codec;
pub mod compression;
pub mod error;
pub mod routes;
pub mod rpc;
pub mod services;
pub mod session;
pub mod types;

use axum::Router;
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};

pub use error::{BackendError, Result};
pub use routes::AppState;
pub use types::Config;

/// Max accepted request body
pub const REQUEST_BODY_LIMIT: usize = 64 * 1024;

/// Full router with body limit and request tracing
pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(routes::health_router(state.clone()))
        .merge(routes::actions_router(state))
        .layer(RequestBodyLimitLayer::new(REQUEST_BODY_LIMIT))
        .layer(TraceLayer::new_for_http())
}
