//! # Validator service
//!
//! The HTTP surface the threshold-signature machinery calls on each
//! validator node: one endpoint per round kind, each returning the
//! `{hash, data}` pair the node's signer commits to. The handlers do all
//! the independent re-verification; the signing shares themselves are
//! produced by the external FROST node.

pub mod deposit;
pub mod withdraw;

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};

use clients::Client;

use crate::error::Error;
use crate::registry::AddressRegistry;
use crate::sequencer::Sequencer;
use crate::storage::model::ChainKind;
use crate::storage::{DbRead, DbWrite};
use crate::zex::ZexClient;

use deposit::{SaDepositRequest, ValidatorReply};
use withdraw::{SaInputRequest, SaWithdrawRequest};

/// Everything the validator knows about one configured chain.
#[derive(Debug)]
pub struct ChainHandle {
    /// The chain RPC client.
    pub client: Client,
    /// Chain family.
    pub kind: ChainKind,
    /// Numeric chain id (EVM only).
    pub chain_id: Option<u64>,
    /// Vault address on this chain.
    pub vault_address: String,
    /// Address network (Bitcoin only).
    pub network: Option<bitcoin::Network>,
}

/// Shared state of the validator service.
#[derive(Debug)]
pub struct ValidatorContext<S, Q> {
    /// Shared storage.
    pub store: S,
    /// Zex client.
    pub zex: ZexClient,
    /// Address registry.
    pub registry: AddressRegistry,
    /// Sequencer client.
    pub sequencer: Q,
    /// Configured chains by symbol.
    pub chains: HashMap<String, ChainHandle>,
    /// Version byte of the deposit encoding.
    pub encode_version: u8,
}

/// Build the validator router.
pub fn router<S, Q>(context: Arc<ValidatorContext<S, Q>>) -> Router
where
    S: DbRead + DbWrite + Send + Sync + 'static,
    Q: Sequencer + Send + Sync + 'static,
{
    Router::new()
        .route("/v1/deposit", post(deposit_handler::<S, Q>))
        .route("/v1/withdraw", post(withdraw_handler::<S, Q>))
        .with_state(context)
}

type HandlerResult = Result<Json<ValidatorReply>, (StatusCode, String)>;

fn into_response_error(error: Error) -> (StatusCode, String) {
    match &error {
        Error::ValidatorReject(_) | Error::InvalidValue(_) => {
            (StatusCode::UNPROCESSABLE_ENTITY, error.to_string())
        }
        _ => (StatusCode::INTERNAL_SERVER_ERROR, error.to_string()),
    }
}

fn chain_handle<'a, S, Q>(
    context: &'a ValidatorContext<S, Q>,
    chain_symbol: &str,
) -> Result<&'a ChainHandle, (StatusCode, String)> {
    context.chains.get(chain_symbol).ok_or((
        StatusCode::UNPROCESSABLE_ENTITY,
        format!("unknown chain {chain_symbol}"),
    ))
}

async fn deposit_handler<S, Q>(
    State(context): State<Arc<ValidatorContext<S, Q>>>,
    Json(request): Json<SaDepositRequest>,
) -> HandlerResult
where
    S: DbRead + DbWrite + Send + Sync + 'static,
    Q: Sequencer + Send + Sync + 'static,
{
    let handle = chain_handle(&context, &request.chain_symbol)?;

    deposit::handle_deposit(
        &handle.client,
        &context.store,
        &context.registry,
        &context.zex,
        handle.kind,
        context.encode_version,
        request,
    )
    .await
    .map(Json)
    .map_err(into_response_error)
}

async fn withdraw_handler<S, Q>(
    State(context): State<Arc<ValidatorContext<S, Q>>>,
    Json(body): Json<serde_json::Value>,
) -> HandlerResult
where
    S: DbRead + DbWrite + Send + Sync + 'static,
    Q: Sequencer + Send + Sync + 'static,
{
    let chain_symbol = body
        .get("chain_symbol")
        .and_then(serde_json::Value::as_str)
        .ok_or((StatusCode::UNPROCESSABLE_ENTITY, "no chain_symbol".to_owned()))?
        .to_owned();
    let handle = chain_handle(&context, &chain_symbol)?;

    let reply = match handle.kind {
        ChainKind::Evm => {
            let request: SaWithdrawRequest = serde_json::from_value(body)
                .map_err(|error| (StatusCode::UNPROCESSABLE_ENTITY, error.to_string()))?;
            let chain_id = handle.chain_id.ok_or((
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("chain {chain_symbol} has no chain id"),
            ))?;
            withdraw::handle_evm_withdraw(&context.zex, chain_id, request).await
        }
        ChainKind::Btc => {
            let network = handle.network.ok_or((
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("chain {chain_symbol} has no network"),
            ))?;

            if body.get("sighash").is_some() {
                let request: SaInputRequest = serde_json::from_value(body)
                    .map_err(|error| (StatusCode::UNPROCESSABLE_ENTITY, error.to_string()))?;
                withdraw::handle_btc_input(&context.store, &handle.vault_address, network, request)
                    .await
            } else {
                let proposal = serde_json::from_value(body)
                    .map_err(|error| (StatusCode::UNPROCESSABLE_ENTITY, error.to_string()))?;
                withdraw::handle_btc_withdraw(
                    &context.store,
                    &context.sequencer,
                    &context.registry,
                    &handle.vault_address,
                    network,
                    proposal,
                )
                .await
            }
        }
    };

    reply.map(Json).map_err(into_response_error)
}
