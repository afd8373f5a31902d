//! Lifecycle event publishing over Redis pub/sub, plus a hot status cache.
//! Best-effort by design: a Redis outage never fails a state transition.

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::warn;

use crate::ledger::TxRecord;

const EVENTS_CHANNEL: &str = "tx_events";

#[derive(Clone)]
pub struct EventBus {
    redis: Option<ConnectionManager>,
}

impl EventBus {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis: Some(redis) }
    }

    /// Memory-store development mode runs without Redis.
    pub fn disabled() -> Self {
        Self { redis: None }
    }

    pub async fn publish(&self, event: &str, row: &TxRecord) {
        let Some(redis) = &self.redis else { return };
        let mut conn = redis.clone();

        let message = serde_json::json!({
            "event": event,
            "queueId": row.queue_id,
            "walletAddress": row.wallet_address,
            "chainId": row.chain_id,
            "status": row.status,
            "txHash": row.tx_hash,
            "nonce": row.nonce,
            "timestamp": row.last_updated_at.timestamp(),
        });

        if let Err(e) = conn
            .publish::<_, _, ()>(EVENTS_CHANNEL, message.to_string())
            .await
        {
            warn!("[EVENTS] Publish failed for {}: {}", row.queue_id, e);
        }

        // hot cache for status reads; the ledger stays the source of truth
        if let Ok(json) = serde_json::to_string(row) {
            let _: Result<(), _> = conn
                .set_ex(format!("tx:{}", row.queue_id), json, 86400)
                .await;
        }
    }
}
