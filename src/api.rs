//! HTTP surface over the engine. Handlers are thin: validate, call the
//! matching engine operation, shape the response.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::chains::{chain_name, ChainRegistry};
use crate::error::ServiceError;
use crate::ledger::TxStatus;
use crate::metrics::ServiceMetrics;
use crate::nonce::NonceAllocator;
use crate::queue::TransactionQueue;
use crate::signer::SignerRegistry;
use crate::store::LedgerStore;
use crate::wallets::{normalize_address, WalletBackend, WalletRegistry};

#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<TransactionQueue>,
    pub wallets: Arc<WalletRegistry>,
    pub signers: Arc<SignerRegistry>,
    pub allocator: Arc<NonceAllocator>,
    pub chains: Arc<ChainRegistry>,
    pub store: Arc<dyn LedgerStore>,
    pub metrics: Arc<ServiceMetrics>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/transaction/enqueue/:chain_id", post(enqueue_handler))
        .route("/transaction/status/:queue_id", get(status_handler))
        .route("/transaction/cancel/:queue_id", post(cancel_handler))
        .route("/transaction/replace/:queue_id", post(replace_handler))
        .route("/nonce/:chain_id/:address", get(nonce_handler))
        .route("/nonce/:chain_id/:address/resync", post(resync_nonce_handler))
        .route("/nonce/:chain_id/:address/reset", post(reset_nonce_handler))
        .route("/wallet/register", post(register_wallet_handler))
        .route("/wallet/import", post(import_wallet_handler))
        .route("/wallet/:address", get(get_wallet_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ==================== TRANSACTIONS ====================

#[derive(Debug, Deserialize)]
struct EnqueueRequest {
    wallet_address: String,
    /// Opaque unsigned payload from the contract-call layer.
    payload: serde_json::Value,
}

async fn enqueue_handler(
    State(state): State<AppState>,
    Path(chain_id): Path<u64>,
    Json(req): Json<EnqueueRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let view = state
        .queue
        .enqueue(&req.wallet_address, chain_id, req.payload)
        .await?;
    Ok(Json(serde_json::json!({
        "success": true,
        "queueId": view.queue_id.clone(),
        "transaction": view
    })))
}

async fn status_handler(
    State(state): State<AppState>,
    Path(queue_id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let view = state.queue.get_status(&queue_id).await?;
    Ok(Json(serde_json::json!({ "transaction": view })))
}

async fn cancel_handler(
    State(state): State<AppState>,
    Path(queue_id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let view = state.queue.cancel(&queue_id).await?;
    Ok(Json(serde_json::json!({
        "success": true,
        "transaction": view
    })))
}

#[derive(Debug, Deserialize)]
struct ReplaceRequest {
    payload: serde_json::Value,
}

async fn replace_handler(
    State(state): State<AppState>,
    Path(queue_id): Path<String>,
    Json(req): Json<ReplaceRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let view = state.queue.enqueue_replacement(&queue_id, req.payload).await?;
    Ok(Json(serde_json::json!({
        "success": true,
        "queueId": view.queue_id.clone(),
        "transaction": view
    })))
}

// ==================== NONCE SLOTS ====================

async fn nonce_handler(
    State(state): State<AppState>,
    Path((chain_id, address)): Path<(u64, String)>,
) -> Result<impl IntoResponse, ServiceError> {
    let address = normalize_address(&address)?;
    if !state.chains.contains(chain_id) {
        return Err(ServiceError::UnknownChain(chain_id));
    }
    let view = state.allocator.view(&address, chain_id).await?;
    Ok(Json(serde_json::json!({
        "chainId": chain_id,
        "chainName": chain_name(chain_id),
        "slot": view
    })))
}

async fn resync_nonce_handler(
    State(state): State<AppState>,
    Path((chain_id, address)): Path<(u64, String)>,
) -> Result<impl IntoResponse, ServiceError> {
    let address = normalize_address(&address)?;
    let view = state.allocator.resync(&address, chain_id).await?;
    Ok(Json(serde_json::json!({ "success": true, "slot": view })))
}

async fn reset_nonce_handler(
    State(state): State<AppState>,
    Path((chain_id, address)): Path<(u64, String)>,
) -> Result<impl IntoResponse, ServiceError> {
    let address = normalize_address(&address)?;
    let view = state.allocator.reset(&address, chain_id).await?;
    Ok(Json(serde_json::json!({ "success": true, "slot": view })))
}

// ==================== WALLETS ====================

#[derive(Debug, Deserialize)]
struct RegisterWalletRequest {
    address: String,
    backend: WalletBackend,
    key_id: String,
    label: Option<String>,
}

async fn register_wallet_handler(
    State(state): State<AppState>,
    Json(req): Json<RegisterWalletRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let record = state
        .wallets
        .register(&req.address, req.backend, req.key_id, req.label)
        .await?;
    Ok(Json(serde_json::json!({ "success": true, "wallet": record })))
}

#[derive(Debug, Deserialize)]
struct ImportWalletRequest {
    backend: WalletBackend,
    key_id: String,
    label: Option<String>,
}

async fn import_wallet_handler(
    State(state): State<AppState>,
    Json(req): Json<ImportWalletRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let record = state
        .wallets
        .import(&state.signers, req.backend, req.key_id, req.label)
        .await?;
    Ok(Json(serde_json::json!({ "success": true, "wallet": record })))
}

async fn get_wallet_handler(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let record = state
        .wallets
        .get(&address)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("wallet {}", address)))?;
    Ok(Json(serde_json::json!({ "wallet": record })))
}

// ==================== OPERATIONAL ====================

async fn health_handler(State(state): State<AppState>) -> Result<impl IntoResponse, ServiceError> {
    let counts = state.store.status_counts().await?;
    let pending: i64 = counts
        .iter()
        .filter(|(status, _)| !status.is_terminal())
        .map(|(_, n)| n)
        .sum();
    Ok(Json(serde_json::json!({
        "service": "transaction-queue",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "healthy",
        "pendingTransactions": pending,
        "supportedChains": state.chains.chain_ids(),
    })))
}

async fn metrics_handler(State(state): State<AppState>) -> Result<impl IntoResponse, ServiceError> {
    let snapshot = state.metrics.snapshot().await;
    let counts = state.store.status_counts().await?;
    let queued_now: i64 = counts
        .iter()
        .filter(|(status, _)| *status == TxStatus::Queued)
        .map(|(_, n)| n)
        .sum();
    let by_status: serde_json::Map<String, serde_json::Value> = counts
        .into_iter()
        .map(|(status, n)| (status.as_str().to_string(), serde_json::json!(n)))
        .collect();
    Ok(Json(serde_json::json!({
        "counters": snapshot,
        "ledger": by_status,
        "queuedNow": queued_now,
    })))
}
