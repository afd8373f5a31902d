//! Durable storage behind the engine: wallet registry rows, nonce slots and
//! the transaction ledger. The single source of truth — every mutation goes
//! through the operations defined here.
//!
//! `STORE_BACKEND=postgres` (default) uses sqlx/PostgreSQL;
//! `STORE_BACKEND=memory` keeps everything in-process for development and
//! tests.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ServiceError;
use crate::ledger::{TxOutcome, TxRecord, TxStatus};
use crate::wallets::WalletRecord;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NonceSlotRecord {
    pub wallet_address: String,
    pub chain_id: u64,
    /// -1 until the first reservation lands on this slot.
    pub last_assigned_nonce: i64,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    // ==================== WALLET REGISTRY ====================

    /// Insert a wallet record. Fails if the address is already registered:
    /// wallet addresses are immutable once created.
    async fn insert_wallet(&self, wallet: &WalletRecord) -> Result<(), ServiceError>;

    async fn wallet(&self, address: &str) -> Result<Option<WalletRecord>, ServiceError>;

    // ==================== NONCE SLOTS ====================

    async fn nonce_slot(
        &self,
        wallet_address: &str,
        chain_id: u64,
    ) -> Result<Option<NonceSlotRecord>, ServiceError>;

    /// Overwrite a slot's last-assigned nonce (resync / reset paths). The
    /// caller holds the slot lock.
    async fn set_slot_nonce(
        &self,
        wallet_address: &str,
        chain_id: u64,
        last_assigned_nonce: i64,
    ) -> Result<(), ServiceError>;

    // ==================== TRANSACTION LEDGER ====================

    /// Persist a freshly queued row and advance its slot to the row's nonce,
    /// as a single atomic unit. Either both land or neither does.
    async fn insert_queued(&self, row: &TxRecord) -> Result<(), ServiceError>;

    async fn transaction(&self, queue_id: &str) -> Result<Option<TxRecord>, ServiceError>;

    /// Rows the broadcast worker may act on: QUEUED, retryable ERRORED, and
    /// SUBMITTED rows whose confirmation poll was interrupted. Ordered by
    /// (wallet, chain, nonce) so per-slot processing sees the lowest nonce
    /// first.
    async fn pending_rows(&self, limit: i64) -> Result<Vec<TxRecord>, ServiceError>;

    async fn mark_signing(&self, queue_id: &str) -> Result<TxRecord, ServiceError>;

    async fn mark_submitted(
        &self,
        queue_id: &str,
        tx_hash: &str,
        signed_payload: &str,
    ) -> Result<TxRecord, ServiceError>;

    async fn mark_confirmed(
        &self,
        queue_id: &str,
        outcome: TxOutcome,
        block_number: Option<i64>,
        gas_used: Option<String>,
    ) -> Result<TxRecord, ServiceError>;

    /// Record a retryable failure. Increments the retry counter; the nonce
    /// is untouched — retries resubmit, they never reallocate.
    async fn mark_errored(&self, queue_id: &str, error: &str) -> Result<TxRecord, ServiceError>;

    async fn mark_failed(&self, queue_id: &str, error: &str) -> Result<TxRecord, ServiceError>;

    async fn mark_cancelled(&self, queue_id: &str) -> Result<TxRecord, ServiceError>;

    /// Ledger row counts per lifecycle state, for health and metrics.
    async fn status_counts(&self) -> Result<Vec<(TxStatus, i64)>, ServiceError>;
}

/// Shared transition guard used by both store implementations.
pub(crate) fn check_transition(
    queue_id: &str,
    current: TxStatus,
    next: TxStatus,
) -> Result<(), ServiceError> {
    if current.can_transition_to(next) {
        Ok(())
    } else {
        Err(ServiceError::IllegalTransition(format!(
            "{}: {} -> {}",
            queue_id,
            current.as_str(),
            next.as_str()
        )))
    }
}
