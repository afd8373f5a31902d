//! Wallet registry: durable records of each managed backend wallet and the
//! signing backend that holds its key.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ServiceError;
use crate::signer::SignerRegistry;
use crate::store::LedgerStore;

/// Addresses are stored and compared lowercase; callers may send any casing.
pub fn normalize_address(address: &str) -> Result<String, ServiceError> {
    let addr = address.trim().to_lowercase();
    let hex_part = addr.strip_prefix("0x").unwrap_or(&addr);
    if hex_part.len() != 40 || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ServiceError::InvalidRequest(format!(
            "invalid wallet address: {}",
            address
        )));
    }
    Ok(format!("0x{}", hex_part))
}

// ==================== TYPES ====================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WalletBackend {
    AwsKms,
    GcpKms,
    Local,
}

impl WalletBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            WalletBackend::AwsKms => "aws_kms",
            WalletBackend::GcpKms => "gcp_kms",
            WalletBackend::Local => "local",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ServiceError> {
        match s {
            "aws_kms" => Ok(WalletBackend::AwsKms),
            "gcp_kms" => Ok(WalletBackend::GcpKms),
            "local" => Ok(WalletBackend::Local),
            other => Err(ServiceError::InvalidRequest(format!(
                "unknown wallet backend '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletRecord {
    pub address: String,
    pub backend: WalletBackend,
    /// Opaque key identifier understood only by the signing backend.
    pub key_id: String,
    pub label: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ==================== REGISTRY ====================

pub struct WalletRegistry {
    store: Arc<dyn LedgerStore>,
}

impl WalletRegistry {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    pub async fn get(&self, address: &str) -> Result<Option<WalletRecord>, ServiceError> {
        let address = normalize_address(address)?;
        self.store.wallet(&address).await
    }

    /// Resolve a wallet or reject the request; the admission path for
    /// enqueue.
    pub async fn require(&self, address: &str) -> Result<WalletRecord, ServiceError> {
        let address = normalize_address(address)?;
        self.store
            .wallet(&address)
            .await?
            .ok_or(ServiceError::UnknownWallet(address))
    }

    /// Register a wallet whose address is already known to the caller.
    pub async fn register(
        &self,
        address: &str,
        backend: WalletBackend,
        key_id: String,
        label: Option<String>,
    ) -> Result<WalletRecord, ServiceError> {
        let record = WalletRecord {
            address: normalize_address(address)?,
            backend,
            key_id,
            label,
            created_at: Utc::now(),
        };
        self.store.insert_wallet(&record).await?;
        info!("[WALLET] Registered {} ({})", record.address, backend.as_str());
        Ok(record)
    }

    /// Import a wallet by key id: the address is resolved from the signing
    /// backend itself, then persisted. Key provisioning stays with the
    /// backend; we only record what it tells us.
    pub async fn import(
        &self,
        signers: &SignerRegistry,
        backend: WalletBackend,
        key_id: String,
        label: Option<String>,
    ) -> Result<WalletRecord, ServiceError> {
        let signer = signers.backend(backend, &key_id)?;
        let address = signer.address().await?;
        let record = WalletRecord {
            address: normalize_address(&address)?,
            backend,
            key_id,
            label,
            created_at: Utc::now(),
        };
        self.store.insert_wallet(&record).await?;
        info!("[WALLET] Imported {} from {}", record.address, backend.as_str());
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses_normalize_to_lowercase() {
        let addr = normalize_address("0xAbCdEF0123456789abcdef0123456789ABCDEF01").unwrap();
        assert_eq!(addr, "0xabcdef0123456789abcdef0123456789abcdef01");
    }

    #[test]
    fn malformed_addresses_are_rejected() {
        assert!(normalize_address("0x1234").is_err());
        assert!(normalize_address("not-an-address").is_err());
        assert!(normalize_address("0xzzzdef0123456789abcdef0123456789abcdef01").is_err());
    }

    #[test]
    fn backend_strings_round_trip() {
        for backend in [WalletBackend::AwsKms, WalletBackend::GcpKms, WalletBackend::Local] {
            assert_eq!(WalletBackend::parse(backend.as_str()).unwrap(), backend);
        }
    }
}
