//! Nonce allocator: hands out the next nonce for a (wallet, chain) slot,
//! serialized per slot, reconciled against on-chain state only at seeding
//! time or on an explicit resync.
//!
//! Reservation is atomic with ledger insert: either a row lands with its
//! nonce durably recorded, or the in-memory sequence is untouched.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::chains::{chain_name, ChainRegistry};
use crate::error::ServiceError;
use crate::ledger::TxRecord;
use crate::store::LedgerStore;

type SlotKey = (String, u64);

#[derive(Debug)]
struct SlotState {
    seeded: bool,
    last_assigned: i64,
    in_flight: u64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SlotView {
    pub wallet_address: String,
    pub chain_id: u64,
    pub last_assigned_nonce: i64,
    pub in_flight: u64,
}

pub struct NonceAllocator {
    store: Arc<dyn LedgerStore>,
    chains: Arc<ChainRegistry>,
    slots: DashMap<SlotKey, Arc<Mutex<SlotState>>>,
}

impl NonceAllocator {
    pub fn new(store: Arc<dyn LedgerStore>, chains: Arc<ChainRegistry>) -> Self {
        Self { store, chains, slots: DashMap::new() }
    }

    fn slot(&self, wallet_address: &str, chain_id: u64) -> Arc<Mutex<SlotState>> {
        self.slots
            .entry((wallet_address.to_string(), chain_id))
            .or_insert_with(|| {
                Arc::new(Mutex::new(SlotState {
                    seeded: false,
                    last_assigned: -1,
                    in_flight: 0,
                }))
            })
            .clone()
    }

    /// First touch of a slot: prefer the durable record (survives restarts
    /// with reservations the chain has not seen yet), otherwise seed from
    /// the chain's current account nonce.
    async fn seed(
        &self,
        state: &mut SlotState,
        wallet_address: &str,
        chain_id: u64,
    ) -> Result<(), ServiceError> {
        if state.seeded {
            return Ok(());
        }
        if let Some(record) = self.store.nonce_slot(wallet_address, chain_id).await? {
            state.last_assigned = record.last_assigned_nonce;
        } else {
            let rpc = self.chains.rpc(chain_id)?;
            let chain_nonce = rpc.account_nonce(wallet_address).await.map_err(|e| {
                ServiceError::NonceAllocation(format!(
                    "slot initialization failed for {} on {}: {}",
                    wallet_address,
                    chain_name(chain_id),
                    e
                ))
            })?;
            state.last_assigned = chain_nonce as i64 - 1;
            info!(
                "[NONCE-{}] Seeded slot for {} at on-chain nonce {}",
                chain_name(chain_id),
                wallet_address,
                chain_nonce
            );
        }
        state.seeded = true;
        Ok(())
    }

    /// Reserve the next nonce for the slot and persist the row built from
    /// it, as one unit. The slot lock is held across the durable insert so
    /// concurrent reservations for the same slot form a contiguous,
    /// duplicate-free sequence; other slots are untouched.
    pub async fn reserve<F>(
        &self,
        wallet_address: &str,
        chain_id: u64,
        build_row: F,
    ) -> Result<TxRecord, ServiceError>
    where
        F: FnOnce(i64) -> TxRecord,
    {
        let slot = self.slot(wallet_address, chain_id);
        let mut state = slot.lock().await;
        self.seed(&mut state, wallet_address, chain_id).await?;

        let nonce = state.last_assigned + 1;
        let row = build_row(nonce);
        self.store.insert_queued(&row).await?;

        state.last_assigned = nonce;
        state.in_flight += 1;
        Ok(row)
    }

    /// Persist an already-reserved nonce again for a replacement row. No new
    /// nonce is consumed; the slot sequence is untouched.
    pub async fn insert_replacement(
        &self,
        wallet_address: &str,
        chain_id: u64,
        row: &TxRecord,
    ) -> Result<(), ServiceError> {
        let slot = self.slot(wallet_address, chain_id);
        let mut state = slot.lock().await;
        self.store.insert_queued(row).await?;
        state.in_flight += 1;
        Ok(())
    }

    /// A row for this slot reached a terminal state.
    pub async fn release_in_flight(&self, wallet_address: &str, chain_id: u64) {
        let slot = self.slot(wallet_address, chain_id);
        let mut state = slot.lock().await;
        state.in_flight = state.in_flight.saturating_sub(1);
    }

    pub async fn view(&self, wallet_address: &str, chain_id: u64) -> Result<SlotView, ServiceError> {
        let slot = self.slot(wallet_address, chain_id);
        let mut state = slot.lock().await;
        self.seed(&mut state, wallet_address, chain_id).await?;
        Ok(SlotView {
            wallet_address: wallet_address.to_string(),
            chain_id,
            last_assigned_nonce: state.last_assigned,
            in_flight: state.in_flight,
        })
    }

    /// Reconcile against the chain: advance the slot if an out-of-band
    /// transaction moved the account nonce past our view. Never regresses —
    /// a chain behind our view just has not seen our pending rows yet.
    pub async fn resync(&self, wallet_address: &str, chain_id: u64) -> Result<SlotView, ServiceError> {
        let rpc = self.chains.rpc(chain_id)?;
        let slot = self.slot(wallet_address, chain_id);
        let mut state = slot.lock().await;
        self.seed(&mut state, wallet_address, chain_id).await?;

        let chain_nonce = rpc.account_nonce(wallet_address).await? as i64;
        if chain_nonce - 1 > state.last_assigned {
            warn!(
                "[NONCE-{}] Drift detected for {}: local {} behind chain {}, advancing",
                chain_name(chain_id),
                wallet_address,
                state.last_assigned,
                chain_nonce
            );
            state.last_assigned = chain_nonce - 1;
            self.store
                .set_slot_nonce(wallet_address, chain_id, state.last_assigned)
                .await?;
        }
        Ok(SlotView {
            wallet_address: wallet_address.to_string(),
            chain_id,
            last_assigned_nonce: state.last_assigned,
            in_flight: state.in_flight,
        })
    }

    /// Operator override: force the slot back to the chain value, even
    /// backwards. Only safe when the slot has nothing in flight.
    pub async fn reset(&self, wallet_address: &str, chain_id: u64) -> Result<SlotView, ServiceError> {
        let rpc = self.chains.rpc(chain_id)?;
        let slot = self.slot(wallet_address, chain_id);
        let mut state = slot.lock().await;

        let chain_nonce = rpc.account_nonce(wallet_address).await? as i64;
        state.last_assigned = chain_nonce - 1;
        state.seeded = true;
        self.store
            .set_slot_nonce(wallet_address, chain_id, state.last_assigned)
            .await?;
        info!(
            "[NONCE-{}] Reset slot for {} to on-chain nonce {}",
            chain_name(chain_id),
            wallet_address,
            chain_nonce
        );
        Ok(SlotView {
            wallet_address: wallet_address.to_string(),
            chain_id,
            last_assigned_nonce: state.last_assigned,
            in_flight: state.in_flight,
        })
    }

    /// Resync every slot this process has touched. Driven by the optional
    /// periodic task.
    pub async fn resync_all(&self) {
        let keys: Vec<SlotKey> = self.slots.iter().map(|e| e.key().clone()).collect();
        for (wallet, chain_id) in keys {
            if let Err(e) = self.resync(&wallet, chain_id).await {
                warn!(
                    "[NONCE-{}] Periodic resync failed for {}: {}",
                    chain_name(chain_id),
                    wallet,
                    e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chains::{ChainDescriptor, ChainRegistry};
    use crate::store::memory::MemoryStore;
    use crate::testutil::MockChain;

    const WALLET: &str = "0xabcdef0123456789abcdef0123456789abcdef01";
    const OTHER_WALLET: &str = "0x1111111111111111111111111111111111111111";

    fn test_registry(chain_id: u64) -> ChainRegistry {
        ChainRegistry::new(vec![ChainDescriptor {
            chain_id,
            name: String::new(),
            rpc_url: "http://localhost:8545".to_string(),
            confirmations_required: 1,
            block_time_ms: 1000,
        }])
    }

    fn allocator_with(chain_id: u64, chain: Arc<MockChain>) -> NonceAllocator {
        let registry = test_registry(chain_id);
        registry.set_rpc(chain_id, chain);
        NonceAllocator::new(Arc::new(MemoryStore::new()), Arc::new(registry))
    }

    fn row(queue_id: String, nonce: i64, wallet: &str, chain_id: u64) -> TxRecord {
        TxRecord::new_queued(queue_id, wallet.to_string(), chain_id, "{}".to_string(), nonce)
    }

    #[tokio::test]
    async fn seeds_from_chain_and_increments() {
        let allocator = allocator_with(5, Arc::new(MockChain::with_nonce(10)));
        let first = allocator
            .reserve(WALLET, 5, |n| row("tx_1".into(), n, WALLET, 5))
            .await
            .unwrap();
        let second = allocator
            .reserve(WALLET, 5, |n| row("tx_2".into(), n, WALLET, 5))
            .await
            .unwrap();
        assert_eq!(first.nonce, 10);
        assert_eq!(second.nonce, 11);
    }

    #[tokio::test]
    async fn concurrent_reservations_are_contiguous() {
        let allocator = Arc::new(allocator_with(1, Arc::new(MockChain::with_nonce(100))));
        let mut handles = Vec::new();
        for i in 0..16 {
            let allocator = allocator.clone();
            handles.push(tokio::spawn(async move {
                allocator
                    .reserve(WALLET, 1, |n| row(format!("tx_{}", i), n, WALLET, 1))
                    .await
                    .unwrap()
                    .nonce
            }));
        }
        let mut nonces = Vec::new();
        for handle in handles {
            nonces.push(handle.await.unwrap());
        }
        nonces.sort_unstable();
        assert_eq!(nonces, (100..116).collect::<Vec<i64>>());
    }

    #[tokio::test]
    async fn failed_insert_consumes_no_nonce() {
        let allocator = allocator_with(1, Arc::new(MockChain::with_nonce(3)));
        allocator
            .reserve(WALLET, 1, |n| row("tx_1".into(), n, WALLET, 1))
            .await
            .unwrap();
        // duplicate queue id makes the durable insert fail
        let result = allocator
            .reserve(WALLET, 1, |n| row("tx_1".into(), n, WALLET, 1))
            .await;
        assert!(result.is_err());
        let next = allocator
            .reserve(WALLET, 1, |n| row("tx_2".into(), n, WALLET, 1))
            .await
            .unwrap();
        assert_eq!(next.nonce, 4);
    }

    #[tokio::test]
    async fn slot_init_failure_is_surfaced() {
        let allocator = allocator_with(1, Arc::new(MockChain::failing()));
        let result = allocator
            .reserve(WALLET, 1, |n| row("tx_1".into(), n, WALLET, 1))
            .await;
        assert!(matches!(result, Err(ServiceError::NonceAllocation(_))));
    }

    #[tokio::test]
    async fn slots_do_not_block_each_other() {
        let blocked_chain = Arc::new(MockChain::with_nonce(0));
        blocked_chain.hold_nonce_reads().await;

        let registry = test_registry(1);
        registry.set_rpc(1, blocked_chain.clone());
        let allocator = Arc::new(NonceAllocator::new(
            Arc::new(MemoryStore::new()),
            Arc::new(registry),
        ));

        // wallet A's seeding read is parked on the mock
        let blocked = {
            let allocator = allocator.clone();
            tokio::spawn(async move {
                allocator
                    .reserve(WALLET, 1, |n| row("tx_blocked".into(), n, WALLET, 1))
                    .await
            })
        };
        tokio::task::yield_now().await;

        // wallet B (different slot, same chain registry) proceeds via its
        // own pre-seeded slot record
        allocator
            .store
            .set_slot_nonce(OTHER_WALLET, 1, 49)
            .await
            .unwrap();
        let other = allocator
            .reserve(OTHER_WALLET, 1, |n| row("tx_other".into(), n, OTHER_WALLET, 1))
            .await
            .unwrap();
        assert_eq!(other.nonce, 50);

        blocked_chain.release_nonce_reads().await;
        blocked.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn resync_advances_but_never_regresses() {
        let chain = Arc::new(MockChain::with_nonce(10));
        let allocator = allocator_with(1, chain.clone());
        allocator
            .reserve(WALLET, 1, |n| row("tx_1".into(), n, WALLET, 1))
            .await
            .unwrap();

        // out-of-band transactions moved the account to nonce 20
        chain.set_nonce(20).await;
        let view = allocator.resync(WALLET, 1).await.unwrap();
        assert_eq!(view.last_assigned_nonce, 19);

        // chain falling behind our view is not a regression
        chain.set_nonce(5).await;
        let view = allocator.resync(WALLET, 1).await.unwrap();
        assert_eq!(view.last_assigned_nonce, 19);
    }

    #[tokio::test]
    async fn restart_recovers_from_durable_slot() {
        let store: Arc<dyn LedgerStore> = Arc::new(MemoryStore::new());
        let registry = Arc::new(test_registry(1));
        registry.set_rpc(1, Arc::new(MockChain::with_nonce(10)));

        let allocator = NonceAllocator::new(store.clone(), registry.clone());
        allocator
            .reserve(WALLET, 1, |n| row("tx_1".into(), n, WALLET, 1))
            .await
            .unwrap();

        // new allocator over the same store: must continue at 11, not
        // re-seed from the chain (still reporting 10)
        let recovered = NonceAllocator::new(store, registry);
        let next = recovered
            .reserve(WALLET, 1, |n| row("tx_2".into(), n, WALLET, 1))
            .await
            .unwrap();
        assert_eq!(next.nonce, 11);
    }
}
