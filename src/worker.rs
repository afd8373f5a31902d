//! Broadcast worker: drains the ledger in the background. Signs, submits
//! and confirms queued rows, oldest nonce first within each slot; unrelated
//! slots run fully in parallel under a bounded concurrency limit.
//!
//! Within one slot a higher nonce is never sent while a lower one is still
//! unresolved — the chain would reject or reorder it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{watch, Semaphore};
use tracing::{error, info, warn};

use crate::chains::{chain_name, ChainRegistry};
use crate::config::Config;
use crate::error::ServiceError;
use crate::events::EventBus;
use crate::ledger::{TxOutcome, TxRecord, TxStatus};
use crate::metrics::ServiceMetrics;
use crate::nonce::NonceAllocator;
use crate::signer::SignerResolver;
use crate::store::LedgerStore;

const SCAN_LIMIT: i64 = 200;
const RETRY_BACKOFF_CAP: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub poll_interval: Duration,
    pub confirmation_poll_interval: Duration,
    pub confirmation_timeout_multiplier: u64,
    pub max_retry_attempts: u32,
    pub max_concurrent_slots: usize,
    pub retry_backoff_base: Duration,
}

impl WorkerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            poll_interval: config.worker_poll_interval,
            confirmation_poll_interval: config.confirmation_poll_interval,
            confirmation_timeout_multiplier: config.confirmation_timeout_multiplier,
            max_retry_attempts: config.max_retry_attempts,
            max_concurrent_slots: config.worker_max_concurrent_slots,
            retry_backoff_base: Duration::from_millis(100),
        }
    }
}

/// What became of one row this pass. A blocked row stalls its slot — lower
/// nonces always resolve before higher ones are touched.
enum RowOutcome {
    Terminal,
    Blocked,
}

pub struct BroadcastWorker {
    store: Arc<dyn LedgerStore>,
    chains: Arc<ChainRegistry>,
    signers: Arc<dyn SignerResolver>,
    allocator: Arc<NonceAllocator>,
    events: EventBus,
    metrics: Arc<ServiceMetrics>,
    config: WorkerConfig,
    busy_slots: DashMap<(String, u64), ()>,
    slot_permits: Semaphore,
}

impl BroadcastWorker {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        chains: Arc<ChainRegistry>,
        signers: Arc<dyn SignerResolver>,
        allocator: Arc<NonceAllocator>,
        events: EventBus,
        metrics: Arc<ServiceMetrics>,
        config: WorkerConfig,
    ) -> Arc<Self> {
        let slot_permits = Semaphore::new(config.max_concurrent_slots);
        Arc::new(Self {
            store,
            chains,
            signers,
            allocator,
            events,
            metrics,
            config,
            busy_slots: DashMap::new(),
            slot_permits,
        })
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.poll_interval);
        info!("[WORKER] Broadcast worker started");
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        error!("[WORKER] Scan pass failed: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    info!("[WORKER] Shutdown requested, stopping");
                    break;
                }
            }
        }
    }

    /// One scan pass: group eligible rows per slot, process each slot's
    /// rows in nonce order, slots in parallel.
    pub async fn tick(self: &Arc<Self>) -> Result<(), ServiceError> {
        let rows = self.store.pending_rows(SCAN_LIMIT).await?;
        if rows.is_empty() {
            return Ok(());
        }

        let mut by_slot: BTreeMap<(String, u64), Vec<TxRecord>> = BTreeMap::new();
        for row in rows {
            by_slot
                .entry((row.wallet_address.clone(), row.chain_id))
                .or_default()
                .push(row);
        }

        let mut handles = Vec::new();
        for (slot, slot_rows) in by_slot {
            // another pass is still inside this slot
            if self.busy_slots.insert(slot.clone(), ()).is_some() {
                continue;
            }
            let worker = self.clone();
            handles.push(tokio::spawn(async move {
                let permit = match worker.slot_permits.acquire().await {
                    Ok(p) => p,
                    Err(_) => {
                        worker.busy_slots.remove(&slot);
                        return;
                    }
                };
                worker.process_slot(&slot.0, slot.1, slot_rows).await;
                drop(permit);
                worker.busy_slots.remove(&slot);
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
        Ok(())
    }

    async fn process_slot(&self, wallet_address: &str, chain_id: u64, rows: Vec<TxRecord>) {
        for row in rows {
            debug_assert_eq!(row.wallet_address, wallet_address);
            match self.process_row(row).await {
                RowOutcome::Terminal => continue,
                RowOutcome::Blocked => break,
            }
        }
    }

    async fn process_row(&self, row: TxRecord) -> RowOutcome {
        match row.status {
            TxStatus::Queued => self.sign_and_submit(row).await,
            TxStatus::Errored => {
                if row.retry_count as u32 >= self.config.max_retry_attempts {
                    return self.exhaust(row).await;
                }
                if !self.backoff_elapsed(&row) {
                    return RowOutcome::Blocked;
                }
                self.sign_and_submit(row).await
            }
            // confirmation poll interrupted by a restart; resume it
            TxStatus::Submitted => self.await_confirmation(row).await,
            _ => RowOutcome::Terminal,
        }
    }

    fn backoff_elapsed(&self, row: &TxRecord) -> bool {
        let wait = self
            .config
            .retry_backoff_base
            .saturating_mul(2u32.saturating_pow(row.retry_count.max(0) as u32))
            .min(RETRY_BACKOFF_CAP);
        let eligible_at = row.last_updated_at
            + chrono::Duration::from_std(wait).unwrap_or_else(|_| chrono::Duration::seconds(30));
        Utc::now() >= eligible_at
    }

    async fn exhaust(&self, row: TxRecord) -> RowOutcome {
        let detail = format!(
            "retry ceiling reached after {} attempts: {}",
            row.retry_count,
            row.error.as_deref().unwrap_or("unknown error")
        );
        match self.store.mark_failed(&row.queue_id, &detail).await {
            Ok(failed) => {
                error!(
                    "[WORKER-{}] ❌ {} failed permanently at nonce {}: {}",
                    chain_name(failed.chain_id),
                    failed.queue_id,
                    failed.nonce,
                    detail
                );
                self.allocator
                    .release_in_flight(&failed.wallet_address, failed.chain_id)
                    .await;
                self.metrics.on_failed().await;
                self.events.publish("TX_FAILED", &failed).await;
                RowOutcome::Terminal
            }
            Err(e) => {
                warn!("[WORKER] Could not fail {}: {}", row.queue_id, e);
                RowOutcome::Blocked
            }
        }
    }

    async fn sign_and_submit(&self, row: TxRecord) -> RowOutcome {
        let row = match self.store.mark_signing(&row.queue_id).await {
            Ok(row) => row,
            Err(e) => {
                warn!("[WORKER] Could not start signing {}: {}", row.queue_id, e);
                return RowOutcome::Blocked;
            }
        };

        let wallet = match self.store.wallet(&row.wallet_address).await {
            Ok(Some(wallet)) => wallet,
            Ok(None) => {
                return self
                    .record_error(&row, "wallet record missing from registry")
                    .await
            }
            Err(e) => return self.record_error(&row, &e.to_string()).await,
        };

        // A retry with a cached signature re-broadcasts the same signed
        // payload; otherwise sign (or re-sign) the stored payload.
        let raw = match &row.signed_payload {
            Some(cached) => match hex::decode(cached.trim_start_matches("0x")) {
                Ok(bytes) => bytes,
                Err(_) => match self.sign(&row, &wallet).await {
                    Ok(bytes) => bytes,
                    Err(e) => return self.record_error(&row, &e.to_string()).await,
                },
            },
            None => match self.sign(&row, &wallet).await {
                Ok(bytes) => bytes,
                Err(e) => return self.record_error(&row, &e.to_string()).await,
            },
        };

        let rpc = match self.chains.rpc(row.chain_id) {
            Ok(rpc) => rpc,
            Err(e) => return self.record_error(&row, &e.to_string()).await,
        };

        match rpc.send_raw_transaction(&raw).await {
            Ok(tx_hash) => {
                let row = match self
                    .store
                    .mark_submitted(&row.queue_id, &tx_hash, &hex::encode(&raw))
                    .await
                {
                    Ok(row) => row,
                    Err(e) => {
                        warn!("[WORKER] Could not record submission {}: {}", row.queue_id, e);
                        return RowOutcome::Blocked;
                    }
                };
                info!(
                    "[WORKER-{}] ✅ Submitted {} at nonce {}: {}",
                    chain_name(row.chain_id),
                    row.queue_id,
                    row.nonce,
                    tx_hash
                );
                self.metrics.on_submitted().await;
                self.events.publish("TX_SUBMITTED", &row).await;
                self.await_confirmation(row).await
            }
            Err(e) => self.handle_broadcast_failure(row, e).await,
        }
    }

    async fn sign(
        &self,
        row: &TxRecord,
        wallet: &crate::wallets::WalletRecord,
    ) -> Result<Vec<u8>, ServiceError> {
        let payload: serde_json::Value = serde_json::from_str(&row.payload)
            .map_err(|e| ServiceError::Signer(format!("stored payload unparseable: {}", e)))?;
        let signer = self.signers.resolve(wallet)?;
        signer.sign_transaction(row.chain_id, &payload).await
    }

    /// Nonce-too-low means our view and the chain's have drifted (or an
    /// earlier broadcast of this very row already landed). Re-read the
    /// chain and report, never blind-retry.
    async fn handle_broadcast_failure(&self, row: TxRecord, e: ServiceError) -> RowOutcome {
        let message = e.to_string();
        let lowered = message.to_lowercase();
        let nonce_too_low =
            lowered.contains("nonce too low") || lowered.contains("nonce is too low");

        if nonce_too_low {
            if let Some(tx_hash) = &row.tx_hash {
                // an earlier attempt may already be on chain
                if let Ok(rpc) = self.chains.rpc(row.chain_id) {
                    if let Ok(Some(_)) = rpc.transaction_receipt(tx_hash).await {
                        info!(
                            "[WORKER-{}] {} already on chain, resuming confirmation",
                            chain_name(row.chain_id),
                            row.queue_id
                        );
                        return self.await_confirmation(row).await;
                    }
                }
            }
            let drift = match self.allocator.resync(&row.wallet_address, row.chain_id).await {
                Ok(view) => format!(
                    "nonce too low at {}; slot resynced to {}",
                    row.nonce, view.last_assigned_nonce
                ),
                Err(resync_err) => format!(
                    "nonce too low at {}; resync also failed: {}",
                    row.nonce, resync_err
                ),
            };
            warn!(
                "[WORKER-{}] ⚠️ Allocator drift on {}: {}",
                chain_name(row.chain_id),
                row.queue_id,
                drift
            );
            return self.record_error(&row, &drift).await;
        }

        self.record_error(&row, &format!("broadcast failed: {}", message))
            .await
    }

    async fn await_confirmation(&self, row: TxRecord) -> RowOutcome {
        let descriptor = match self.chains.descriptor(row.chain_id) {
            Ok(d) => d.clone(),
            Err(e) => return self.record_error(&row, &e.to_string()).await,
        };
        let rpc = match self.chains.rpc(row.chain_id) {
            Ok(rpc) => rpc,
            Err(e) => return self.record_error(&row, &e.to_string()).await,
        };
        let Some(tx_hash) = row.tx_hash.clone() else {
            return self
                .record_error(&row, "submitted row is missing its transaction hash")
                .await;
        };

        let submitted_at = row.last_updated_at;
        let timeout = match self
            .chains
            .confirmation_timeout(row.chain_id, self.config.confirmation_timeout_multiplier)
        {
            Ok(t) => t,
            Err(e) => return self.record_error(&row, &e.to_string()).await,
        };
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            match rpc.transaction_receipt(&tx_hash).await {
                Ok(Some(receipt)) => {
                    let depth = match (receipt.block_number, rpc.block_number().await) {
                        (Some(mined_in), Ok(current)) => current.saturating_sub(mined_in) + 1,
                        _ => 0,
                    };
                    if depth >= descriptor.confirmations_required {
                        let outcome = if receipt.success {
                            TxOutcome::MinedSuccess
                        } else {
                            TxOutcome::MinedRevert
                        };
                        return self
                            .finalize(&row, outcome, &receipt, submitted_at)
                            .await;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        "[WORKER-{}] Receipt poll failed for {}: {}",
                        chain_name(row.chain_id),
                        row.queue_id,
                        e
                    );
                }
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(self.config.confirmation_poll_interval).await;
        }

        warn!(
            "[WORKER-{}] ⚠️ Confirmation timeout for {} ({})",
            chain_name(row.chain_id),
            row.queue_id,
            tx_hash
        );
        self.record_error(
            &row,
            &format!("confirmation timeout after {:?} waiting for {}", timeout, tx_hash),
        )
        .await
    }

    async fn finalize(
        &self,
        row: &TxRecord,
        outcome: TxOutcome,
        receipt: &crate::chains::ReceiptView,
        submitted_at: chrono::DateTime<Utc>,
    ) -> RowOutcome {
        let confirmed = match self
            .store
            .mark_confirmed(
                &row.queue_id,
                outcome,
                receipt.block_number.map(|n| n as i64),
                receipt.gas_used.clone(),
            )
            .await
        {
            Ok(row) => row,
            Err(e) => {
                warn!("[WORKER] Could not confirm {}: {}", row.queue_id, e);
                return RowOutcome::Blocked;
            }
        };

        self.allocator
            .release_in_flight(&confirmed.wallet_address, confirmed.chain_id)
            .await;

        match outcome {
            TxOutcome::MinedSuccess => {
                let elapsed = (Utc::now() - submitted_at).num_seconds().max(0) as u64;
                self.metrics.on_confirmed(elapsed).await;
                info!(
                    "[WORKER-{}] ✅ Confirmed {} (block {}, {}s)",
                    chain_name(confirmed.chain_id),
                    confirmed.queue_id,
                    confirmed.block_number.unwrap_or(0),
                    elapsed
                );
                self.events.publish("TX_CONFIRMED", &confirmed).await;
            }
            _ => {
                self.metrics.on_reverted().await;
                info!(
                    "[WORKER-{}] Delivered but reverted on chain: {}",
                    chain_name(confirmed.chain_id),
                    confirmed.queue_id
                );
                self.events.publish("TX_REVERTED", &confirmed).await;
            }
        }
        RowOutcome::Terminal
    }

    async fn record_error(&self, row: &TxRecord, detail: &str) -> RowOutcome {
        match self.store.mark_errored(&row.queue_id, detail).await {
            Ok(errored) => {
                warn!(
                    "[WORKER-{}] {} errored (attempt {}): {}",
                    chain_name(errored.chain_id),
                    errored.queue_id,
                    errored.retry_count,
                    detail
                );
                self.events.publish("TX_ERRORED", &errored).await;
            }
            Err(e) => {
                warn!("[WORKER] Could not record error for {}: {}", row.queue_id, e);
            }
        }
        RowOutcome::Blocked
    }
}

/// Optional periodic reconciliation of every slot this process has touched.
pub async fn nonce_sync_task(
    allocator: Arc<NonceAllocator>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => allocator.resync_all().await,
            _ = shutdown.changed() => break,
        }
    }
}
