//! End-to-end flow against the in-memory store: enqueue through the queue,
//! drain with the broadcast worker, observe terminal outcomes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use transaction_queue_service::chains::{ChainDescriptor, ChainRegistry, ChainRpc, ReceiptView};
use transaction_queue_service::error::ServiceError;
use transaction_queue_service::events::EventBus;
use transaction_queue_service::ledger::{TxOutcome, TxStatus};
use transaction_queue_service::metrics::ServiceMetrics;
use transaction_queue_service::nonce::NonceAllocator;
use transaction_queue_service::queue::TransactionQueue;
use transaction_queue_service::signer::{SignerResolver, TxSigner};
use transaction_queue_service::store::{memory::MemoryStore, LedgerStore};
use transaction_queue_service::wallets::{WalletBackend, WalletRecord, WalletRegistry};
use transaction_queue_service::worker::{BroadcastWorker, WorkerConfig};

const WALLET: &str = "0xabcdef0123456789abcdef0123456789abcdef01";

struct ScriptedChain {
    account_nonce: u64,
    receipts: Mutex<HashMap<String, ReceiptView>>,
    broadcasts: Mutex<Vec<String>>,
    seq: AtomicU64,
}

impl ScriptedChain {
    fn new(account_nonce: u64) -> Arc<Self> {
        Arc::new(Self {
            account_nonce,
            receipts: Mutex::new(HashMap::new()),
            broadcasts: Mutex::new(Vec::new()),
            seq: AtomicU64::new(0),
        })
    }

    fn hash(seq: u64) -> String {
        format!("0x{:064x}", seq)
    }
}

#[async_trait]
impl ChainRpc for ScriptedChain {
    async fn account_nonce(&self, _address: &str) -> Result<u64, ServiceError> {
        Ok(self.account_nonce)
    }

    async fn send_raw_transaction(&self, raw: &[u8]) -> Result<String, ServiceError> {
        self.broadcasts.lock().await.push(hex::encode(raw));
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Self::hash(seq))
    }

    async fn transaction_receipt(&self, tx_hash: &str) -> Result<Option<ReceiptView>, ServiceError> {
        Ok(self.receipts.lock().await.get(tx_hash).cloned())
    }

    async fn block_number(&self) -> Result<u64, ServiceError> {
        Ok(1)
    }
}

struct EchoSigner;

#[async_trait]
impl TxSigner for EchoSigner {
    async fn address(&self) -> Result<String, ServiceError> {
        Ok(WALLET.to_string())
    }

    async fn sign_transaction(
        &self,
        chain_id: u64,
        payload: &serde_json::Value,
    ) -> Result<Vec<u8>, ServiceError> {
        let mut raw = chain_id.to_be_bytes().to_vec();
        raw.extend_from_slice(payload.to_string().as_bytes());
        Ok(raw)
    }
}

struct EchoResolver;

impl SignerResolver for EchoResolver {
    fn resolve(&self, _wallet: &WalletRecord) -> Result<Arc<dyn TxSigner>, ServiceError> {
        Ok(Arc::new(EchoSigner))
    }
}

struct Stack {
    queue: TransactionQueue,
    worker: Arc<BroadcastWorker>,
    store: Arc<dyn LedgerStore>,
    chain: Arc<ScriptedChain>,
}

async fn stack(account_nonce: u64) -> Stack {
    let store: Arc<dyn LedgerStore> = Arc::new(MemoryStore::new());
    let chain = ScriptedChain::new(account_nonce);
    let registry = Arc::new(ChainRegistry::new(vec![ChainDescriptor {
        chain_id: 1,
        name: String::new(),
        rpc_url: "http://localhost:8545".to_string(),
        confirmations_required: 1,
        block_time_ms: 100,
    }]));
    registry.set_rpc(1, chain.clone());

    let wallets = Arc::new(WalletRegistry::new(store.clone()));
    wallets
        .register(WALLET, WalletBackend::Local, "TEST_KEY".to_string(), None)
        .await
        .unwrap();

    let allocator = Arc::new(NonceAllocator::new(store.clone(), registry.clone()));
    let metrics = Arc::new(ServiceMetrics::new());
    let queue = TransactionQueue::new(
        store.clone(),
        registry.clone(),
        wallets,
        allocator.clone(),
        EventBus::disabled(),
        metrics.clone(),
    );
    let worker = BroadcastWorker::new(
        store.clone(),
        registry,
        Arc::new(EchoResolver),
        allocator,
        EventBus::disabled(),
        metrics,
        WorkerConfig {
            poll_interval: Duration::from_millis(10),
            confirmation_poll_interval: Duration::from_millis(10),
            confirmation_timeout_multiplier: 5,
            max_retry_attempts: 3,
            max_concurrent_slots: 4,
            retry_backoff_base: Duration::ZERO,
        },
    );
    Stack { queue, worker, store, chain }
}

#[tokio::test(start_paused = true)]
async fn enqueue_to_confirmed_end_to_end() {
    let s = stack(10).await;

    let first = s
        .queue
        .enqueue(WALLET, 1, serde_json::json!({"to": "0x01", "data": "0xdeadbeef"}))
        .await
        .unwrap();
    let second = s
        .queue
        .enqueue(WALLET, 1, serde_json::json!({"to": "0x02"}))
        .await
        .unwrap();
    assert_eq!(first.nonce, 10);
    assert_eq!(second.nonce, 11);

    // scripting receipts up front lets a single pass drain the slot
    {
        let mut receipts = s.chain.receipts.lock().await;
        for seq in 1..=2u64 {
            receipts.insert(
                ScriptedChain::hash(seq),
                ReceiptView {
                    success: true,
                    block_number: Some(1),
                    gas_used: Some("21000".to_string()),
                },
            );
        }
    }

    s.worker.tick().await.unwrap();

    for queued in [&first, &second] {
        let row = s.store.transaction(&queued.queue_id).await.unwrap().unwrap();
        assert_eq!(row.status, TxStatus::ConfirmedSuccess);
        assert_eq!(row.outcome, Some(TxOutcome::MinedSuccess));
        assert!(row.tx_hash.is_some());
    }

    // nonce 10 went out before nonce 11
    let broadcasts = s.chain.broadcasts.lock().await;
    assert_eq!(broadcasts.len(), 2);
    let first_raw = hex::decode(&broadcasts[0]).unwrap();
    assert!(String::from_utf8_lossy(&first_raw).contains("0xdeadbeef"));
}

#[tokio::test(start_paused = true)]
async fn status_view_advances_monotonically() {
    let s = stack(0).await;
    let queued = s.queue.enqueue(WALLET, 1, serde_json::json!({})).await.unwrap();

    let view = s.queue.get_status(&queued.queue_id).await.unwrap();
    assert_eq!(view.status, TxStatus::Queued);

    // broadcast hashes are deterministic, so the receipt can be scripted
    // ahead of the pass that will produce it
    s.chain.receipts.lock().await.insert(
        ScriptedChain::hash(1),
        ReceiptView {
            success: true,
            block_number: Some(1),
            gas_used: Some("21000".to_string()),
        },
    );
    s.worker.tick().await.unwrap();

    let view = s.queue.get_status(&queued.queue_id).await.unwrap();
    assert_eq!(view.status, TxStatus::ConfirmedSuccess);

    // a terminal row never regresses, no matter how often it is read
    for _ in 0..3 {
        let again = s.queue.get_status(&queued.queue_id).await.unwrap();
        assert_eq!(again.status, TxStatus::ConfirmedSuccess);
        assert_eq!(again.outcome, Some(TxOutcome::MinedSuccess));
    }
}

#[tokio::test(start_paused = true)]
async fn cancel_and_replace_flow() {
    let s = stack(5).await;

    let original = s.queue.enqueue(WALLET, 1, serde_json::json!({"to": "0x01"})).await.unwrap();
    let follower = s.queue.enqueue(WALLET, 1, serde_json::json!({"to": "0x02"})).await.unwrap();
    assert_eq!(original.nonce, 5);
    assert_eq!(follower.nonce, 6);

    let cancelled = s.queue.cancel(&original.queue_id).await.unwrap();
    assert_eq!(cancelled.status, TxStatus::Cancelled);

    let replacement = s
        .queue
        .enqueue_replacement(&original.queue_id, serde_json::json!({"to": "0x03"}))
        .await
        .unwrap();
    assert_eq!(replacement.nonce, 5);

    // drain: replacement fills nonce 5, follower at 6 confirms after it
    {
        let mut receipts = s.chain.receipts.lock().await;
        for seq in 1..=2u64 {
            receipts.insert(
                ScriptedChain::hash(seq),
                ReceiptView {
                    success: true,
                    block_number: Some(1),
                    gas_used: Some("21000".to_string()),
                },
            );
        }
    }
    s.worker.tick().await.unwrap();

    let replacement_row = s.store.transaction(&replacement.queue_id).await.unwrap().unwrap();
    let follower_row = s.store.transaction(&follower.queue_id).await.unwrap().unwrap();
    assert_eq!(replacement_row.status, TxStatus::ConfirmedSuccess);
    assert_eq!(follower_row.status, TxStatus::ConfirmedSuccess);

    // the cancelled row itself stays terminal and untouched
    let original_row = s.store.transaction(&original.queue_id).await.unwrap().unwrap();
    assert_eq!(original_row.status, TxStatus::Cancelled);
    assert_eq!(original_row.outcome, Some(TxOutcome::Cancelled));
}
