//! Remote key-management signing backends (AWS KMS / GCP KMS), reached over
//! the key manager's HTTP interface. The backend holds the key; we send the
//! unsigned payload and get raw signed bytes back, or a failure — never a
//! partial signature.

use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::error::ServiceError;
use crate::signer::TxSigner;

pub struct RemoteKmsSigner {
    backend_name: &'static str,
    client: reqwest::Client,
    endpoint: String,
    key_id: String,
    timeout: Duration,
}

impl RemoteKmsSigner {
    pub fn new(backend_name: &'static str, endpoint: &str, key_id: &str, timeout: Duration) -> Self {
        Self {
            backend_name,
            client: reqwest::Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            key_id: key_id.to_string(),
            timeout,
        }
    }

    fn signer_err(&self, detail: impl std::fmt::Display) -> ServiceError {
        ServiceError::Signer(format!("{} key {}: {}", self.backend_name, self.key_id, detail))
    }
}

#[async_trait]
impl TxSigner for RemoteKmsSigner {
    async fn address(&self) -> Result<String, ServiceError> {
        let url = format!("{}/keys/{}/address", self.endpoint, self.key_id);
        let response = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| self.signer_err(format!("backend unreachable: {}", e)))?;

        if !response.status().is_success() {
            return Err(self.signer_err(format!("address lookup rejected: {}", response.status())));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| self.signer_err(format!("invalid address response: {}", e)))?;

        json["address"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| self.signer_err("no address in response"))
    }

    async fn sign_transaction(
        &self,
        chain_id: u64,
        payload: &serde_json::Value,
    ) -> Result<Vec<u8>, ServiceError> {
        let url = format!("{}/keys/{}/sign", self.endpoint, self.key_id);
        let body = serde_json::json!({
            "chainId": chain_id,
            "transaction": payload,
        });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| self.signer_err(format!("backend unreachable: {}", e)))?;

        if !response.status().is_success() {
            return Err(self.signer_err(format!("signing rejected: {}", response.status())));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| self.signer_err(format!("invalid sign response: {}", e)))?;

        let signed = json["signedTransaction"]
            .as_str()
            .ok_or_else(|| self.signer_err("no signed transaction in response"))?;

        info!(
            "[SIGNER-{}] Signed payload for chain {} with key {}",
            self.backend_name, chain_id, self.key_id
        );

        hex::decode(signed.trim_start_matches("0x"))
            .map_err(|e| self.signer_err(format!("malformed signed transaction: {}", e)))
    }
}
