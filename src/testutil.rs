//! Scriptable mock implementations of the chain and signer seams, shared by
//! the unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};

use crate::chains::{ChainRpc, ReceiptView};
use crate::error::ServiceError;
use crate::signer::TxSigner;

pub struct MockChain {
    nonce: Mutex<u64>,
    failing: bool,
    hold: watch::Sender<bool>,
    block: Mutex<u64>,
    receipts: Mutex<HashMap<String, ReceiptView>>,
    broadcast_failures: Mutex<VecDeque<String>>,
    pub broadcasts: Mutex<Vec<String>>,
    broadcast_seq: AtomicU64,
}

impl MockChain {
    pub fn with_nonce(nonce: u64) -> Self {
        let (hold, _) = watch::channel(false);
        Self {
            nonce: Mutex::new(nonce),
            failing: false,
            hold,
            block: Mutex::new(1),
            receipts: Mutex::new(HashMap::new()),
            broadcast_failures: Mutex::new(VecDeque::new()),
            broadcasts: Mutex::new(Vec::new()),
            broadcast_seq: AtomicU64::new(0),
        }
    }

    pub fn failing() -> Self {
        let mut chain = Self::with_nonce(0);
        chain.failing = true;
        chain
    }

    pub async fn set_nonce(&self, nonce: u64) {
        *self.nonce.lock().await = nonce;
    }

    pub async fn hold_nonce_reads(&self) {
        self.hold.send_replace(true);
    }

    pub async fn release_nonce_reads(&self) {
        self.hold.send_replace(false);
    }

    pub async fn set_block(&self, block: u64) {
        *self.block.lock().await = block;
    }

    pub async fn push_broadcast_failure(&self, message: &str) {
        self.broadcast_failures
            .lock()
            .await
            .push_back(message.to_string());
    }

    /// Install the receipt returned for broadcast number `seq` (1-based,
    /// matching the deterministic hash format below).
    pub async fn set_receipt(&self, tx_hash: &str, success: bool, block_number: u64) {
        self.receipts.lock().await.insert(
            tx_hash.to_string(),
            ReceiptView {
                success,
                block_number: Some(block_number),
                gas_used: Some("21000".to_string()),
            },
        );
    }

    pub fn hash_for_seq(seq: u64) -> String {
        format!("0x{:064x}", seq)
    }
}

#[async_trait]
impl ChainRpc for MockChain {
    async fn account_nonce(&self, _address: &str) -> Result<u64, ServiceError> {
        if self.failing {
            return Err(ServiceError::Provider("rpc unreachable".to_string()));
        }
        let mut held = self.hold.subscribe();
        while *held.borrow() {
            if held.changed().await.is_err() {
                break;
            }
        }
        Ok(*self.nonce.lock().await)
    }

    async fn send_raw_transaction(&self, raw: &[u8]) -> Result<String, ServiceError> {
        if let Some(message) = self.broadcast_failures.lock().await.pop_front() {
            return Err(ServiceError::Provider(message));
        }
        self.broadcasts.lock().await.push(hex::encode(raw));
        let seq = self.broadcast_seq.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Self::hash_for_seq(seq))
    }

    async fn transaction_receipt(&self, tx_hash: &str) -> Result<Option<ReceiptView>, ServiceError> {
        Ok(self.receipts.lock().await.get(tx_hash).cloned())
    }

    async fn block_number(&self) -> Result<u64, ServiceError> {
        Ok(*self.block.lock().await)
    }
}

pub struct MockSigner {
    address: String,
    failures_remaining: Mutex<u32>,
    pub sign_calls: AtomicU64,
}

impl MockSigner {
    pub fn new(address: &str) -> Arc<Self> {
        Arc::new(Self {
            address: address.to_string(),
            failures_remaining: Mutex::new(0),
            sign_calls: AtomicU64::new(0),
        })
    }

    pub fn failing_times(address: &str, failures: u32) -> Arc<Self> {
        Arc::new(Self {
            address: address.to_string(),
            failures_remaining: Mutex::new(failures),
            sign_calls: AtomicU64::new(0),
        })
    }
}

#[async_trait]
impl TxSigner for MockSigner {
    async fn address(&self) -> Result<String, ServiceError> {
        Ok(self.address.clone())
    }

    async fn sign_transaction(
        &self,
        chain_id: u64,
        payload: &serde_json::Value,
    ) -> Result<Vec<u8>, ServiceError> {
        self.sign_calls.fetch_add(1, Ordering::SeqCst);
        let mut failures = self.failures_remaining.lock().await;
        if *failures > 0 {
            *failures -= 1;
            return Err(ServiceError::Signer("backend unreachable".to_string()));
        }
        let mut raw = chain_id.to_be_bytes().to_vec();
        raw.extend_from_slice(payload.to_string().as_bytes());
        Ok(raw)
    }
}
