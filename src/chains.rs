//! Chain registry: the static table of supported networks and their RPC
//! handles. Loaded once at startup, passed around as an `Arc`.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use ethers::providers::{Http, Middleware, Provider};
use ethers::types::{Address, Bytes, H256};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ServiceError;

lazy_static::lazy_static! {
    static ref CHAIN_NAMES: HashMap<u64, &'static str> = {
        let mut m = HashMap::new();
        m.insert(1, "Ethereum");
        m.insert(56, "BSC");
        m.insert(137, "Polygon");
        m.insert(42161, "Arbitrum");
        m.insert(10, "Optimism");
        m.insert(43114, "Avalanche");
        m.insert(8453, "Base");
        m.insert(250, "Fantom");
        m
    };
}

pub fn chain_name(chain_id: u64) -> String {
    CHAIN_NAMES
        .get(&chain_id)
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("Chain {}", chain_id))
}

// ==================== CHAIN DESCRIPTOR ====================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainDescriptor {
    pub chain_id: u64,
    #[serde(default)]
    pub name: String,
    pub rpc_url: String,
    pub confirmations_required: u64,
    pub block_time_ms: u64,
}

fn default_descriptors() -> Vec<ChainDescriptor> {
    let defaults: [(u64, &str, u64, u64); 4] = [
        (1, "https://eth.llamarpc.com", 3, 12000),
        (137, "https://polygon-rpc.com", 5, 2000),
        (8453, "https://mainnet.base.org", 3, 2000),
        (10, "https://mainnet.optimism.io", 3, 2000),
    ];
    defaults
        .into_iter()
        .map(|(chain_id, rpc_url, confirmations_required, block_time_ms)| ChainDescriptor {
            chain_id,
            name: chain_name(chain_id),
            rpc_url: rpc_url.to_string(),
            confirmations_required,
            block_time_ms,
        })
        .collect()
}

// ==================== CHAIN RPC ====================

/// Minimal receipt view the worker needs to resolve an outcome.
#[derive(Debug, Clone)]
pub struct ReceiptView {
    pub success: bool,
    pub block_number: Option<u64>,
    pub gas_used: Option<String>,
}

/// The chain-query capability the engine consumes: read an account nonce,
/// broadcast a raw signed transaction, poll a receipt. Implemented over
/// `ethers` in production and by mocks in tests.
#[async_trait]
pub trait ChainRpc: Send + Sync {
    async fn account_nonce(&self, address: &str) -> Result<u64, ServiceError>;
    async fn send_raw_transaction(&self, raw: &[u8]) -> Result<String, ServiceError>;
    async fn transaction_receipt(&self, tx_hash: &str) -> Result<Option<ReceiptView>, ServiceError>;
    async fn block_number(&self) -> Result<u64, ServiceError>;
}

pub struct HttpChainRpc {
    provider: Provider<Http>,
}

impl HttpChainRpc {
    pub fn new(rpc_url: &str) -> Result<Self, ServiceError> {
        let provider = Provider::<Http>::try_from(rpc_url)
            .map_err(|e| ServiceError::Provider(format!("invalid RPC url: {}", e)))?;
        Ok(Self { provider })
    }
}

fn parse_address(address: &str) -> Result<Address, ServiceError> {
    Address::from_str(address)
        .map_err(|e| ServiceError::InvalidRequest(format!("invalid address {}: {}", address, e)))
}

#[async_trait]
impl ChainRpc for HttpChainRpc {
    async fn account_nonce(&self, address: &str) -> Result<u64, ServiceError> {
        let addr = parse_address(address)?;
        let nonce = self
            .provider
            .get_transaction_count(addr, None)
            .await
            .map_err(|e| ServiceError::Provider(e.to_string()))?;
        Ok(nonce.as_u64())
    }

    async fn send_raw_transaction(&self, raw: &[u8]) -> Result<String, ServiceError> {
        let pending = self
            .provider
            .send_raw_transaction(Bytes::from(raw.to_vec()))
            .await
            .map_err(|e| ServiceError::Provider(format!("broadcast failed: {}", e)))?;
        Ok(format!("{:#x}", pending.tx_hash()))
    }

    async fn transaction_receipt(&self, tx_hash: &str) -> Result<Option<ReceiptView>, ServiceError> {
        let hash = H256::from_str(tx_hash.trim_start_matches("0x"))
            .map_err(|e| ServiceError::InvalidRequest(format!("invalid tx hash: {}", e)))?;
        let receipt = self
            .provider
            .get_transaction_receipt(hash)
            .await
            .map_err(|e| ServiceError::Provider(e.to_string()))?;
        Ok(receipt.map(|r| ReceiptView {
            success: r.status.map(|s| s.as_u64() == 1).unwrap_or(false),
            block_number: r.block_number.map(|n| n.as_u64()),
            gas_used: r.gas_used.map(|g| g.to_string()),
        }))
    }

    async fn block_number(&self) -> Result<u64, ServiceError> {
        let n = self
            .provider
            .get_block_number()
            .await
            .map_err(|e| ServiceError::Provider(e.to_string()))?;
        Ok(n.as_u64())
    }
}

// ==================== CHAIN REGISTRY ====================

pub struct ChainRegistry {
    chains: HashMap<u64, ChainDescriptor>,
    rpcs: DashMap<u64, Arc<dyn ChainRpc>>,
}

impl ChainRegistry {
    pub fn new(descriptors: Vec<ChainDescriptor>) -> Self {
        let mut chains = HashMap::with_capacity(descriptors.len());
        for mut d in descriptors {
            if d.name.is_empty() {
                d.name = chain_name(d.chain_id);
            }
            chains.insert(d.chain_id, d);
        }
        Self { chains, rpcs: DashMap::new() }
    }

    pub fn with_defaults() -> Self {
        Self::new(default_descriptors())
    }

    /// Load the registry from a JSON configuration file: a list of chain
    /// descriptors. Unknown chains stay unknown; reload is a restart.
    pub fn from_config(path: &str) -> Result<Self, ServiceError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ServiceError::Internal(format!("cannot read {}: {}", path, e)))?;
        let descriptors: Vec<ChainDescriptor> = serde_json::from_str(&text)
            .map_err(|e| ServiceError::Internal(format!("invalid chains config: {}", e)))?;
        info!("Loaded {} chain(s) from {}", descriptors.len(), path);
        Ok(Self::new(descriptors))
    }

    pub fn descriptor(&self, chain_id: u64) -> Result<&ChainDescriptor, ServiceError> {
        self.chains
            .get(&chain_id)
            .ok_or(ServiceError::UnknownChain(chain_id))
    }

    pub fn contains(&self, chain_id: u64) -> bool {
        self.chains.contains_key(&chain_id)
    }

    pub fn chain_ids(&self) -> Vec<u64> {
        self.chains.keys().copied().collect()
    }

    /// RPC handle for a chain, built lazily from the descriptor and cached.
    pub fn rpc(&self, chain_id: u64) -> Result<Arc<dyn ChainRpc>, ServiceError> {
        if let Some(rpc) = self.rpcs.get(&chain_id) {
            return Ok(rpc.clone());
        }
        let descriptor = self.descriptor(chain_id)?;
        let rpc: Arc<dyn ChainRpc> = Arc::new(HttpChainRpc::new(&descriptor.rpc_url)?);
        self.rpcs.insert(chain_id, rpc.clone());
        Ok(rpc)
    }

    /// Install a pre-built RPC handle for a chain. Used by the memory-store
    /// development mode and by tests to route a chain at a mock.
    pub fn set_rpc(&self, chain_id: u64, rpc: Arc<dyn ChainRpc>) {
        self.rpcs.insert(chain_id, rpc);
    }

    /// How long the worker waits for one transaction to confirm on this
    /// chain before treating the attempt as timed out.
    pub fn confirmation_timeout(&self, chain_id: u64, multiplier: u64) -> Result<std::time::Duration, ServiceError> {
        let d = self.descriptor(chain_id)?;
        Ok(std::time::Duration::from_millis(
            d.confirmations_required * d.block_time_ms * multiplier,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_chain_is_rejected() {
        let registry = ChainRegistry::with_defaults();
        assert!(registry.contains(1));
        assert!(matches!(
            registry.descriptor(999999),
            Err(ServiceError::UnknownChain(999999))
        ));
    }

    #[test]
    fn config_descriptors_override_names() {
        let registry = ChainRegistry::new(vec![ChainDescriptor {
            chain_id: 5,
            name: String::new(),
            rpc_url: "http://localhost:8545".to_string(),
            confirmations_required: 1,
            block_time_ms: 12000,
        }]);
        assert_eq!(registry.descriptor(5).unwrap().name, "Chain 5");
        assert_eq!(
            registry.confirmation_timeout(5, 10).unwrap(),
            std::time::Duration::from_millis(120000)
        );
    }
}
