//! In-process store: one mutex around the whole ledger, so the
//! reserve-and-insert unit is trivially atomic. Development mode and the
//! test suite run on this backend.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::error::ServiceError;
use crate::ledger::{TxOutcome, TxRecord, TxStatus};
use crate::store::{check_transition, LedgerStore, NonceSlotRecord};
use crate::wallets::WalletRecord;

#[derive(Default)]
struct Inner {
    wallets: HashMap<String, WalletRecord>,
    slots: HashMap<(String, u64), NonceSlotRecord>,
    rows: HashMap<String, TxRecord>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn transition<F>(
        &self,
        queue_id: &str,
        next: TxStatus,
        mutate: F,
    ) -> Result<TxRecord, ServiceError>
    where
        F: FnOnce(&mut TxRecord),
    {
        let mut inner = self.inner.lock().await;
        let row = inner
            .rows
            .get_mut(queue_id)
            .ok_or_else(|| ServiceError::NotFound(format!("transaction {}", queue_id)))?;
        check_transition(queue_id, row.status, next)?;
        row.status = next;
        row.last_updated_at = Utc::now();
        mutate(row);
        Ok(row.clone())
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn insert_wallet(&self, wallet: &WalletRecord) -> Result<(), ServiceError> {
        let mut inner = self.inner.lock().await;
        if inner.wallets.contains_key(&wallet.address) {
            return Err(ServiceError::InvalidRequest(format!(
                "wallet {} already registered",
                wallet.address
            )));
        }
        inner.wallets.insert(wallet.address.clone(), wallet.clone());
        Ok(())
    }

    async fn wallet(&self, address: &str) -> Result<Option<WalletRecord>, ServiceError> {
        Ok(self.inner.lock().await.wallets.get(address).cloned())
    }

    async fn nonce_slot(
        &self,
        wallet_address: &str,
        chain_id: u64,
    ) -> Result<Option<NonceSlotRecord>, ServiceError> {
        Ok(self
            .inner
            .lock()
            .await
            .slots
            .get(&(wallet_address.to_string(), chain_id))
            .cloned())
    }

    async fn set_slot_nonce(
        &self,
        wallet_address: &str,
        chain_id: u64,
        last_assigned_nonce: i64,
    ) -> Result<(), ServiceError> {
        let mut inner = self.inner.lock().await;
        let key = (wallet_address.to_string(), chain_id);
        inner.slots.insert(
            key,
            NonceSlotRecord {
                wallet_address: wallet_address.to_string(),
                chain_id,
                last_assigned_nonce,
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn insert_queued(&self, row: &TxRecord) -> Result<(), ServiceError> {
        let mut inner = self.inner.lock().await;
        if inner.rows.contains_key(&row.queue_id) {
            return Err(ServiceError::InvalidRequest(format!(
                "queue id {} already exists",
                row.queue_id
            )));
        }
        let key = (row.wallet_address.clone(), row.chain_id);
        let slot = inner.slots.entry(key).or_insert_with(|| NonceSlotRecord {
            wallet_address: row.wallet_address.clone(),
            chain_id: row.chain_id,
            last_assigned_nonce: -1,
            updated_at: Utc::now(),
        });
        // A replacement row re-uses an already-assigned nonce; the slot
        // never regresses.
        slot.last_assigned_nonce = slot.last_assigned_nonce.max(row.nonce);
        slot.updated_at = Utc::now();
        inner.rows.insert(row.queue_id.clone(), row.clone());
        Ok(())
    }

    async fn transaction(&self, queue_id: &str) -> Result<Option<TxRecord>, ServiceError> {
        Ok(self.inner.lock().await.rows.get(queue_id).cloned())
    }

    async fn pending_rows(&self, limit: i64) -> Result<Vec<TxRecord>, ServiceError> {
        let inner = self.inner.lock().await;
        let mut rows: Vec<TxRecord> = inner
            .rows
            .values()
            .filter(|r| {
                matches!(
                    r.status,
                    TxStatus::Queued | TxStatus::Errored | TxStatus::Submitted
                )
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            (&a.wallet_address, a.chain_id, a.nonce).cmp(&(&b.wallet_address, b.chain_id, b.nonce))
        });
        rows.truncate(limit as usize);
        Ok(rows)
    }

    async fn mark_signing(&self, queue_id: &str) -> Result<TxRecord, ServiceError> {
        self.transition(queue_id, TxStatus::Signing, |_| {}).await
    }

    async fn mark_submitted(
        &self,
        queue_id: &str,
        tx_hash: &str,
        signed_payload: &str,
    ) -> Result<TxRecord, ServiceError> {
        self.transition(queue_id, TxStatus::Submitted, |row| {
            row.tx_hash = Some(tx_hash.to_string());
            row.signed_payload = Some(signed_payload.to_string());
        })
        .await
    }

    async fn mark_confirmed(
        &self,
        queue_id: &str,
        outcome: TxOutcome,
        block_number: Option<i64>,
        gas_used: Option<String>,
    ) -> Result<TxRecord, ServiceError> {
        let status = match outcome {
            TxOutcome::MinedSuccess => TxStatus::ConfirmedSuccess,
            TxOutcome::MinedRevert => TxStatus::ConfirmedRevert,
            other => {
                return Err(ServiceError::IllegalTransition(format!(
                    "{}: confirmation cannot record outcome {}",
                    queue_id,
                    other.as_str()
                )))
            }
        };
        self.transition(queue_id, status, |row| {
            row.outcome = Some(outcome);
            row.block_number = block_number;
            row.gas_used = gas_used;
        })
        .await
    }

    async fn mark_errored(&self, queue_id: &str, error: &str) -> Result<TxRecord, ServiceError> {
        self.transition(queue_id, TxStatus::Errored, |row| {
            row.retry_count += 1;
            row.error = Some(error.to_string());
        })
        .await
    }

    async fn mark_failed(&self, queue_id: &str, error: &str) -> Result<TxRecord, ServiceError> {
        self.transition(queue_id, TxStatus::Failed, |row| {
            row.outcome = Some(TxOutcome::Dropped);
            row.error = Some(error.to_string());
        })
        .await
    }

    async fn mark_cancelled(&self, queue_id: &str) -> Result<TxRecord, ServiceError> {
        self.transition(queue_id, TxStatus::Cancelled, |row| {
            row.outcome = Some(TxOutcome::Cancelled);
        })
        .await
    }

    async fn status_counts(&self) -> Result<Vec<(TxStatus, i64)>, ServiceError> {
        let inner = self.inner.lock().await;
        let mut counts: HashMap<&'static str, (TxStatus, i64)> = HashMap::new();
        for row in inner.rows.values() {
            counts
                .entry(row.status.as_str())
                .or_insert((row.status, 0))
                .1 += 1;
        }
        Ok(counts.into_values().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queued_row(queue_id: &str, nonce: i64) -> TxRecord {
        TxRecord::new_queued(
            queue_id.to_string(),
            "0xabcdef0123456789abcdef0123456789abcdef01".to_string(),
            1,
            "{}".to_string(),
            nonce,
        )
    }

    #[tokio::test]
    async fn insert_advances_slot_atomically() {
        let store = MemoryStore::new();
        store.insert_queued(&queued_row("tx_1", 10)).await.unwrap();
        let slot = store
            .nonce_slot("0xabcdef0123456789abcdef0123456789abcdef01", 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(slot.last_assigned_nonce, 10);
    }

    #[tokio::test]
    async fn slot_never_regresses_on_replacement() {
        let store = MemoryStore::new();
        store.insert_queued(&queued_row("tx_1", 10)).await.unwrap();
        store.insert_queued(&queued_row("tx_2", 11)).await.unwrap();
        // replacement of a cancelled nonce 10 arrives after 11 was assigned
        store.insert_queued(&queued_row("tx_3", 10)).await.unwrap();
        let slot = store
            .nonce_slot("0xabcdef0123456789abcdef0123456789abcdef01", 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(slot.last_assigned_nonce, 11);
    }

    #[tokio::test]
    async fn illegal_transitions_are_refused() {
        let store = MemoryStore::new();
        store.insert_queued(&queued_row("tx_1", 0)).await.unwrap();
        store.mark_cancelled("tx_1").await.unwrap();
        assert!(matches!(
            store.mark_signing("tx_1").await,
            Err(ServiceError::IllegalTransition(_))
        ));
    }

    #[tokio::test]
    async fn errored_rows_keep_their_nonce() {
        let store = MemoryStore::new();
        store.insert_queued(&queued_row("tx_1", 7)).await.unwrap();
        store.mark_signing("tx_1").await.unwrap();
        let errored = store.mark_errored("tx_1", "backend unreachable").await.unwrap();
        assert_eq!(errored.nonce, 7);
        assert_eq!(errored.retry_count, 1);
        store.mark_signing("tx_1").await.unwrap();
        let errored = store.mark_errored("tx_1", "backend unreachable").await.unwrap();
        assert_eq!(errored.nonce, 7);
        assert_eq!(errored.retry_count, 2);
    }

    #[tokio::test]
    async fn pending_rows_order_by_slot_then_nonce() {
        let store = MemoryStore::new();
        store.insert_queued(&queued_row("tx_b", 11)).await.unwrap();
        store.insert_queued(&queued_row("tx_a", 10)).await.unwrap();
        let rows = store.pending_rows(10).await.unwrap();
        assert_eq!(rows[0].queue_id, "tx_a");
        assert_eq!(rows[1].queue_id, "tx_b");
    }
}
