//! Donation action endpoints
//!
//! `GET`/`OPTIONS` describe the action, `POST` returns an unsigned shield
//! transaction for the payer in the request body.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderName, HeaderValue},
    middleware,
    response::Response,
    routing::get,
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use solana_sdk::pubkey::Pubkey;
use tracing::{info, warn};

use super::AppState;
use crate::error::{BackendError, Result};
use crate::services::resolver::{is_domain_handle, HandleResolver};
use crate::services::shield::{parse_amount, ShieldBuilder};
use crate::types::{
    ActionGetResponse, ActionLinks, ActionParameter, ActionPostRequest, ActionPostResponse,
    ActionRule, ActionsJson, DonateQuery, LinkedAction,
};

pub const ACTION_VERSION: &str = "2.1.3";

/// Mainnet genesis, CAIP-2 form
pub const BLOCKCHAIN_IDS: &str = "solana:5eykt4UsFv8P8NJdTREpY1vzqKqZKvdp";

const DEFAULT_AMOUNT: &str = "0.1";
const ICON_PATH: &str = "/stealth-icon.png";

const ALLOW_HEADERS: &str =
    "Content-Type, Authorization, Content-Encoding, Accept-Encoding, X-Action-Version, X-Blockchain-Ids";

/// Create donation action router
pub fn actions_router(state: AppState) -> Router {
    Router::new()
        .route("/actions.json", get(actions_json))
        .route(
            "/api/actions/donate/{handle}",
            get(describe).options(describe).post(donate),
        )
        .layer(middleware::map_response(with_action_headers))
        .with_state(state)
}

/// Permissive CORS plus the action protocol headers, on every response including errors
async fn with_action_headers(mut response: Response) -> Response {
    let headers = response.headers_mut();
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET,POST,PUT,OPTIONS"),
    );
    headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static(ALLOW_HEADERS));
    headers.insert(
        header::ACCESS_CONTROL_EXPOSE_HEADERS,
        HeaderValue::from_static("X-Action-Version, X-Blockchain-Ids"),
    );
    headers.insert(
        HeaderName::from_static("x-action-version"),
        HeaderValue::from_static(ACTION_VERSION),
    );
    headers.insert(
        HeaderName::from_static("x-blockchain-ids"),
        HeaderValue::from_static(BLOCKCHAIN_IDS),
    );
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

async fn actions_json() -> Json<ActionsJson> {
    Json(ActionsJson {
        rules: vec![
            ActionRule {
                path_pattern: "/donate/*".to_string(),
                api_path: "/api/actions/donate/*".to_string(),
            },
            ActionRule {
                path_pattern: "/api/actions/**".to_string(),
                api_path: "/api/actions/**".to_string(),
            },
        ],
    })
}

fn truncate_key(key: &str) -> String {
    if key.len() <= 10 {
        return key.to_string();
    }
    format!("{}...{}", &key[..4], &key[key.len() - 4..])
}

/// Action descriptor for `handle`; never fails, an unusable handle only changes the title
pub fn descriptor(handle: &str, base_url: &str) -> ActionGetResponse {
    let owned_description = format!(
        "Support this creator with a shielded donation. Your funds will be compressed into a private UTXO owned by {handle}. Privacy by Default."
    );

    let (title, description) = if is_domain_handle(handle) {
        (format!("Donate Privately to {handle} (Secure v2)"), owned_description)
    } else if handle.parse::<Pubkey>().is_ok() {
        (
            format!("Donate Privately to {} (Secure v2)", truncate_key(handle)),
            owned_description,
        )
    } else {
        (
            "Invalid Creator Address".to_string(),
            "Support this creator with a shielded donation. Your funds will be compressed into a private UTXO. Privacy by Default."
                .to_string(),
        )
    };

    let href = |amount: &str| format!("/api/actions/donate/{handle}?amount={amount}&v=2");

    ActionGetResponse {
        title,
        icon: format!("{base_url}{ICON_PATH}"),
        description,
        label: "Donate 0.1 SOL".to_string(),
        links: ActionLinks {
            actions: vec![
                LinkedAction {
                    kind: "transaction".to_string(),
                    label: "Donate 0.1 SOL".to_string(),
                    href: href("0.1"),
                    parameters: vec![],
                },
                LinkedAction {
                    kind: "transaction".to_string(),
                    label: "Donate 0.5 SOL".to_string(),
                    href: href("0.5"),
                    parameters: vec![],
                },
                LinkedAction {
                    kind: "transaction".to_string(),
                    label: "Donate Custom Amount".to_string(),
                    href: href("{amount}"),
                    parameters: vec![ActionParameter {
                        name: "amount".to_string(),
                        label: "Enter amount (SOL)".to_string(),
                        required: true,
                    }],
                },
            ],
        },
    }
}

/// Describe the donation action
///
/// GET|OPTIONS /api/actions/donate/{handle}
async fn describe(State(state): State<AppState>, Path(handle): Path<String>) -> Json<ActionGetResponse> {
    Json(descriptor(&handle, &state.config.public_base_url))
}

fn parse_account(body: &[u8]) -> Result<Pubkey> {
    let request: ActionPostRequest = serde_json::from_slice(body)
        .map_err(|_| BackendError::InvalidAccount("missing account field".to_string()))?;
    request
        .account
        .trim()
        .parse()
        .map_err(|_| BackendError::InvalidAccount(request.account.clone()))
}

/// Build an unsigned shield transaction
///
/// POST /api/actions/donate/{handle}?amount=<sol>
async fn donate(
    State(state): State<AppState>,
    Path(handle): Path<String>,
    Query(query): Query<DonateQuery>,
    body: Bytes,
) -> Result<Json<ActionPostResponse>> {
    build_donation(&state, &handle, query, &body)
        .await
        .map(Json)
        .inspect_err(|err| warn!(handle = %handle, error = %err, category = ?err.category(), "Donation request failed"))
}

async fn build_donation(
    state: &AppState,
    handle: &str,
    query: DonateQuery,
    body: &[u8],
) -> Result<ActionPostResponse> {
    let raw_amount = query
        .amount
        .as_deref()
        .filter(|amount| !amount.trim().is_empty())
        .unwrap_or(DEFAULT_AMOUNT);
    let amount = parse_amount(raw_amount)?;
    let payer = parse_account(body)?;

    let resolver = HandleResolver::new(
        state.config.registry_program_id,
        state.domains.clone(),
        state.rpc.as_ref().map(|ctx| ctx.ledger.clone()),
    );
    let resolution = resolver.resolve(handle).await?;

    let ctx = state
        .rpc
        .as_ref()
        .ok_or_else(|| BackendError::Configuration("Missing RPC URL".to_string()))?;

    info!(
        payer = %payer,
        recipient = %resolution.recipient,
        source = ?resolution.source,
        lamports = amount.lamports,
        "Preparing shield transaction"
    );

    let transaction = ShieldBuilder::new(ctx)
        .build(&payer, &resolution.recipient, amount.lamports)
        .await?;
    let bytes = bincode::serialize(&transaction)
        .map_err(|e| BackendError::Internal(format!("Failed to serialize transaction: {e}")))?;

    Ok(ActionPostResponse {
        kind: "transaction".to_string(),
        transaction: STANDARD.encode(bytes),
        message: format!("Shielding {} SOL to private UTXO", amount.sol),
    })
}
