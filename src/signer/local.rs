//! In-process signing key for development. The key id on the wallet record
//! names the environment variable holding the hex private key.

use async_trait::async_trait;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Eip1559TransactionRequest, TransactionRequest};
use tracing::warn;

use crate::error::ServiceError;
use crate::signer::TxSigner;

pub struct LocalSigner {
    wallet: LocalWallet,
    address: String,
}

impl LocalSigner {
    pub fn from_env_var(env_var: &str) -> Result<Self, ServiceError> {
        let hex_key = std::env::var(env_var).map_err(|_| {
            ServiceError::Signer(format!("local key env var '{}' not set", env_var))
        })?;
        Self::from_hex(hex_key.trim())
    }

    pub fn from_hex(hex_key: &str) -> Result<Self, ServiceError> {
        let wallet: LocalWallet = hex_key
            .trim_start_matches("0x")
            .parse()
            .map_err(|e| ServiceError::Signer(format!("invalid local key: {}", e)))?;
        let address = format!("0x{}", hex::encode(wallet.address().as_bytes()));
        warn!("[SIGNER] Using local signer for {} — dev only", address);
        Ok(Self { wallet, address })
    }
}

/// The payload is an opaque JSON transaction object from the contract-call
/// layer. An EIP-1559 payload carries `maxFeePerGas`; anything else is
/// treated as a legacy request.
fn parse_payload(payload: &serde_json::Value) -> Result<TypedTransaction, ServiceError> {
    let typed = if payload.get("maxFeePerGas").is_some() {
        let req: Eip1559TransactionRequest = serde_json::from_value(payload.clone())
            .map_err(|e| ServiceError::Signer(format!("unparseable payload: {}", e)))?;
        TypedTransaction::Eip1559(req)
    } else {
        let req: TransactionRequest = serde_json::from_value(payload.clone())
            .map_err(|e| ServiceError::Signer(format!("unparseable payload: {}", e)))?;
        req.into()
    };
    Ok(typed)
}

#[async_trait]
impl TxSigner for LocalSigner {
    async fn address(&self) -> Result<String, ServiceError> {
        Ok(self.address.clone())
    }

    async fn sign_transaction(
        &self,
        chain_id: u64,
        payload: &serde_json::Value,
    ) -> Result<Vec<u8>, ServiceError> {
        let mut typed = parse_payload(payload)?;
        typed.set_chain_id(chain_id);

        let wallet = self.wallet.clone().with_chain_id(chain_id);
        let signature = wallet
            .sign_transaction(&typed)
            .await
            .map_err(|e| ServiceError::Signer(e.to_string()))?;

        Ok(typed.rlp_signed(&signature).to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Throwaway key, not a real wallet.
    const TEST_KEY: &str = "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

    #[test]
    fn derives_address_from_key() {
        let signer = LocalSigner::from_hex(TEST_KEY).unwrap();
        assert!(signer.address.starts_with("0x"));
        assert_eq!(signer.address.len(), 42);
    }

    #[tokio::test]
    async fn signs_a_legacy_payload() {
        let signer = LocalSigner::from_hex(TEST_KEY).unwrap();
        let payload = serde_json::json!({
            "to": "0x0000000000000000000000000000000000000001",
            "value": "0x1",
            "gas": "0x5208",
            "gasPrice": "0x3b9aca00",
            "nonce": "0xa"
        });
        let raw = signer.sign_transaction(1, &payload).await.unwrap();
        assert!(!raw.is_empty());
    }

    #[tokio::test]
    async fn rejects_garbage_payloads() {
        let signer = LocalSigner::from_hex(TEST_KEY).unwrap();
        let payload = serde_json::json!({ "to": 12345 });
        assert!(signer.sign_transaction(1, &payload).await.is_err());
    }
}
