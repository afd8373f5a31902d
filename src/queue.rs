//! Transaction queue: the submission entry point. Admission is synchronous
//! through nonce reservation and ledger insert; everything after that is the
//! broadcast worker's job, so callers get low, predictable latency no matter
//! how congested the chain is.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::chains::{chain_name, ChainRegistry};
use crate::error::ServiceError;
use crate::events::EventBus;
use crate::ledger::{TxOutcome, TxRecord, TxStatus};
use crate::metrics::ServiceMetrics;
use crate::nonce::NonceAllocator;
use crate::store::LedgerStore;
use crate::wallets::WalletRegistry;

fn generate_queue_id() -> String {
    use rand::Rng;
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let random_bytes: Vec<u8> = (0..6).map(|_| rand::thread_rng().gen()).collect();
    format!("tx_{}_{}", timestamp, hex::encode(random_bytes))
}

// ==================== STATUS VIEW ====================

/// Caller-visible view of a ledger row. The queue id is the only externally
/// exposed handle; it is safe to log and return to end users.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusView {
    pub queue_id: String,
    pub wallet_address: String,
    pub chain_id: u64,
    pub chain_name: String,
    pub status: TxStatus,
    pub nonce: i64,
    pub retry_count: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<TxOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_number: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
}

impl From<TxRecord> for StatusView {
    fn from(row: TxRecord) -> Self {
        Self {
            chain_name: chain_name(row.chain_id),
            queue_id: row.queue_id,
            wallet_address: row.wallet_address,
            chain_id: row.chain_id,
            status: row.status,
            nonce: row.nonce,
            retry_count: row.retry_count,
            tx_hash: row.tx_hash,
            outcome: row.outcome,
            error: row.error,
            block_number: row.block_number,
            created_at: row.created_at,
            last_updated_at: row.last_updated_at,
        }
    }
}

// ==================== QUEUE ====================

pub struct TransactionQueue {
    store: Arc<dyn LedgerStore>,
    chains: Arc<ChainRegistry>,
    wallets: Arc<WalletRegistry>,
    allocator: Arc<NonceAllocator>,
    events: EventBus,
    metrics: Arc<ServiceMetrics>,
}

impl TransactionQueue {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        chains: Arc<ChainRegistry>,
        wallets: Arc<WalletRegistry>,
        allocator: Arc<NonceAllocator>,
        events: EventBus,
        metrics: Arc<ServiceMetrics>,
    ) -> Self {
        Self { store, chains, wallets, allocator, events, metrics }
    }

    /// Admit a write request: validate, reserve a nonce, persist the queued
    /// row, return its queue id. Never blocks on signing or broadcast.
    /// Either the nonce is reserved and the row persisted, or neither.
    pub async fn enqueue(
        &self,
        wallet_address: &str,
        chain_id: u64,
        payload: serde_json::Value,
    ) -> Result<StatusView, ServiceError> {
        if !self.chains.contains(chain_id) {
            return Err(ServiceError::UnknownChain(chain_id));
        }
        let wallet = self.wallets.require(wallet_address).await?;

        let queue_id = generate_queue_id();
        let payload_text = payload.to_string();
        let address = wallet.address.clone();
        let row = self
            .allocator
            .reserve(&wallet.address, chain_id, move |nonce| {
                TxRecord::new_queued(queue_id, address, chain_id, payload_text, nonce)
            })
            .await?;

        info!(
            "[TX-QUEUE-{}] Queued {} for {} at nonce {}",
            chain_name(chain_id),
            row.queue_id,
            row.wallet_address,
            row.nonce
        );
        self.metrics.on_queued().await;
        self.events.publish("TX_QUEUED", &row).await;
        Ok(row.into())
    }

    pub async fn get_status(&self, queue_id: &str) -> Result<StatusView, ServiceError> {
        let row = self
            .store
            .transaction(queue_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("transaction {}", queue_id)))?;
        Ok(row.into())
    }

    /// Cancel a row that has not started signing. The nonce stays consumed:
    /// the on-chain sequence skips it unless the caller queues an explicit
    /// replacement.
    pub async fn cancel(&self, queue_id: &str) -> Result<StatusView, ServiceError> {
        let row = self.store.mark_cancelled(queue_id).await?;
        self.allocator
            .release_in_flight(&row.wallet_address, row.chain_id)
            .await;
        info!(
            "[TX-QUEUE-{}] Cancelled {} (nonce {} remains consumed)",
            chain_name(row.chain_id),
            row.queue_id,
            row.nonce
        );
        self.metrics.on_cancelled().await;
        self.events.publish("TX_CANCELLED", &row).await;
        Ok(row.into())
    }

    /// Queue a replacement payload on a cancelled row's nonce. The only way
    /// a cancelled nonce ever reaches the chain.
    pub async fn enqueue_replacement(
        &self,
        queue_id: &str,
        payload: serde_json::Value,
    ) -> Result<StatusView, ServiceError> {
        let original = self
            .store
            .transaction(queue_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("transaction {}", queue_id)))?;
        if original.status != TxStatus::Cancelled {
            return Err(ServiceError::InvalidRequest(format!(
                "{} is {}, only cancelled transactions can be replaced",
                queue_id,
                original.status.as_str()
            )));
        }

        let row = TxRecord::new_queued(
            generate_queue_id(),
            original.wallet_address.clone(),
            original.chain_id,
            payload.to_string(),
            original.nonce,
        );
        self.allocator
            .insert_replacement(&original.wallet_address, original.chain_id, &row)
            .await?;

        info!(
            "[TX-QUEUE-{}] Queued {} as replacement for {} at nonce {}",
            chain_name(row.chain_id),
            row.queue_id,
            queue_id,
            row.nonce
        );
        self.metrics.on_queued().await;
        self.events.publish("TX_QUEUED", &row).await;
        Ok(row.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chains::ChainDescriptor;
    use crate::store::memory::MemoryStore;
    use crate::testutil::MockChain;
    use crate::wallets::WalletBackend;

    const WALLET: &str = "0xabcdef0123456789abcdef0123456789abcdef01";

    async fn queue_with(chain_id: u64, chain: Arc<MockChain>) -> TransactionQueue {
        let store: Arc<dyn LedgerStore> = Arc::new(MemoryStore::new());
        let registry = Arc::new(ChainRegistry::new(vec![ChainDescriptor {
            chain_id,
            name: String::new(),
            rpc_url: "http://localhost:8545".to_string(),
            confirmations_required: 1,
            block_time_ms: 1000,
        }]));
        registry.set_rpc(chain_id, chain);
        let wallets = Arc::new(WalletRegistry::new(store.clone()));
        wallets
            .register(WALLET, WalletBackend::Local, "TEST_KEY".to_string(), None)
            .await
            .unwrap();
        let allocator = Arc::new(NonceAllocator::new(store.clone(), registry.clone()));
        TransactionQueue::new(
            store,
            registry,
            wallets,
            allocator,
            EventBus::disabled(),
            Arc::new(ServiceMetrics::new()),
        )
    }

    #[tokio::test]
    async fn unknown_chain_is_rejected_with_nothing_persisted() {
        let queue = queue_with(5, Arc::new(MockChain::with_nonce(0))).await;
        let result = queue.enqueue(WALLET, 999, serde_json::json!({})).await;
        assert!(matches!(result, Err(ServiceError::UnknownChain(999))));
    }

    #[tokio::test]
    async fn unknown_wallet_is_rejected() {
        let queue = queue_with(5, Arc::new(MockChain::with_nonce(0))).await;
        let result = queue
            .enqueue(
                "0x2222222222222222222222222222222222222222",
                5,
                serde_json::json!({}),
            )
            .await;
        assert!(matches!(result, Err(ServiceError::UnknownWallet(_))));
    }

    #[tokio::test]
    async fn seeded_slot_assigns_sequential_nonces() {
        // on-chain nonce 10: first enqueue gets 10, the next gets 11
        let queue = queue_with(5, Arc::new(MockChain::with_nonce(10))).await;
        let first = queue.enqueue(WALLET, 5, serde_json::json!({"to": "0x01"})).await.unwrap();
        let second = queue.enqueue(WALLET, 5, serde_json::json!({"to": "0x02"})).await.unwrap();
        assert_eq!(first.nonce, 10);
        assert_eq!(second.nonce, 11);
        assert_eq!(first.status, TxStatus::Queued);
    }

    #[tokio::test]
    async fn cancelled_nonce_is_never_reassigned() {
        let queue = queue_with(1, Arc::new(MockChain::with_nonce(0))).await;
        let first = queue.enqueue(WALLET, 1, serde_json::json!({})).await.unwrap();
        queue.cancel(&first.queue_id).await.unwrap();
        let next = queue.enqueue(WALLET, 1, serde_json::json!({})).await.unwrap();
        // the cancelled nonce 0 is skipped, not reused
        assert_eq!(first.nonce, 0);
        assert_eq!(next.nonce, 1);
    }

    #[tokio::test]
    async fn replacement_reuses_the_cancelled_nonce() {
        let queue = queue_with(1, Arc::new(MockChain::with_nonce(7))).await;
        let first = queue.enqueue(WALLET, 1, serde_json::json!({})).await.unwrap();
        queue.cancel(&first.queue_id).await.unwrap();

        let replacement = queue
            .enqueue_replacement(&first.queue_id, serde_json::json!({"to": "0x03"}))
            .await
            .unwrap();
        assert_eq!(replacement.nonce, first.nonce);
        assert_ne!(replacement.queue_id, first.queue_id);

        // the slot sequence is untouched by the replacement
        let next = queue.enqueue(WALLET, 1, serde_json::json!({})).await.unwrap();
        assert_eq!(next.nonce, 8);
    }

    #[tokio::test]
    async fn replacement_requires_a_cancelled_row() {
        let queue = queue_with(1, Arc::new(MockChain::with_nonce(0))).await;
        let first = queue.enqueue(WALLET, 1, serde_json::json!({})).await.unwrap();
        let result = queue
            .enqueue_replacement(&first.queue_id, serde_json::json!({}))
            .await;
        assert!(matches!(result, Err(ServiceError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn status_is_visible_immediately_after_enqueue() {
        let queue = queue_with(1, Arc::new(MockChain::with_nonce(0))).await;
        let queued = queue.enqueue(WALLET, 1, serde_json::json!({})).await.unwrap();
        let status = queue.get_status(&queued.queue_id).await.unwrap();
        assert_eq!(status.status, TxStatus::Queued);
        assert_eq!(status.nonce, queued.nonce);
    }

    #[tokio::test]
    async fn cancel_after_signing_started_is_refused() {
        let queue = queue_with(1, Arc::new(MockChain::with_nonce(0))).await;
        let queued = queue.enqueue(WALLET, 1, serde_json::json!({})).await.unwrap();
        queue.store.mark_signing(&queued.queue_id).await.unwrap();
        assert!(matches!(
            queue.cancel(&queued.queue_id).await,
            Err(ServiceError::IllegalTransition(_))
        ));
    }
}
