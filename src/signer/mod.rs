//! Signer adapter: one polymorphic interface over the signing backends that
//! hold backend-wallet keys. Remote KMS backends are reached over their
//! service interface; the local backend is an in-process dev key.
//!
//! A signer never partially signs and never touches a nonce slot — the nonce
//! is already durably reserved by the time a payload reaches it.

mod local;
mod remote;

pub use local::LocalSigner;
pub use remote::RemoteKmsSigner;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::ServiceError;
use crate::wallets::{WalletBackend, WalletRecord};

#[async_trait]
pub trait TxSigner: Send + Sync {
    /// The wallet address this key signs for.
    async fn address(&self) -> Result<String, ServiceError>;

    /// Sign the opaque unsigned payload for `chain_id`. Returns raw signed
    /// transaction bytes ready for broadcast.
    async fn sign_transaction(
        &self,
        chain_id: u64,
        payload: &serde_json::Value,
    ) -> Result<Vec<u8>, ServiceError>;
}

// ==================== REGISTRY ====================

#[derive(Debug, Clone)]
pub struct SignerConfig {
    pub aws_kms_endpoint: Option<String>,
    pub gcp_kms_endpoint: Option<String>,
    pub timeout: Duration,
}

impl SignerConfig {
    pub fn from_env(timeout: Duration) -> Self {
        Self {
            aws_kms_endpoint: std::env::var("AWS_KMS_SIGNER_URL").ok(),
            gcp_kms_endpoint: std::env::var("GCP_KMS_SIGNER_URL").ok(),
            timeout,
        }
    }
}

/// The lookup seam the broadcast worker signs through; lets tests inject
/// scripted signers.
pub trait SignerResolver: Send + Sync {
    fn resolve(&self, wallet: &WalletRecord) -> Result<Arc<dyn TxSigner>, ServiceError>;
}

/// Resolves a wallet record to its signing backend instance. Built signers
/// are cached per (backend, key id).
pub struct SignerRegistry {
    config: SignerConfig,
    cache: DashMap<(WalletBackend, String), Arc<dyn TxSigner>>,
}

impl SignerResolver for SignerRegistry {
    fn resolve(&self, wallet: &WalletRecord) -> Result<Arc<dyn TxSigner>, ServiceError> {
        self.signer_for(wallet)
    }
}

impl SignerRegistry {
    pub fn new(config: SignerConfig) -> Self {
        Self { config, cache: DashMap::new() }
    }

    pub fn signer_for(&self, wallet: &WalletRecord) -> Result<Arc<dyn TxSigner>, ServiceError> {
        self.backend(wallet.backend, &wallet.key_id)
    }

    pub fn backend(
        &self,
        backend: WalletBackend,
        key_id: &str,
    ) -> Result<Arc<dyn TxSigner>, ServiceError> {
        let cache_key = (backend, key_id.to_string());
        if let Some(signer) = self.cache.get(&cache_key) {
            return Ok(signer.clone());
        }

        let signer: Arc<dyn TxSigner> = match backend {
            WalletBackend::AwsKms => {
                let endpoint = self.config.aws_kms_endpoint.as_deref().ok_or_else(|| {
                    ServiceError::Signer("AWS KMS backend not configured".to_string())
                })?;
                Arc::new(RemoteKmsSigner::new(
                    "aws_kms",
                    endpoint,
                    key_id,
                    self.config.timeout,
                ))
            }
            WalletBackend::GcpKms => {
                let endpoint = self.config.gcp_kms_endpoint.as_deref().ok_or_else(|| {
                    ServiceError::Signer("GCP KMS backend not configured".to_string())
                })?;
                Arc::new(RemoteKmsSigner::new(
                    "gcp_kms",
                    endpoint,
                    key_id,
                    self.config.timeout,
                ))
            }
            // For local wallets the key id names the env var holding the key.
            WalletBackend::Local => Arc::new(LocalSigner::from_env_var(key_id)?),
        };

        self.cache.insert(cache_key, signer.clone());
        Ok(signer)
    }
}
