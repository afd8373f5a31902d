use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::RwLock;

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub total_queued: u64,
    pub total_submitted: u64,
    pub total_confirmed: u64,
    pub total_reverted: u64,
    pub total_failed: u64,
    pub total_cancelled: u64,
    pub avg_confirmation_time_secs: u64,
    pub uptime_secs: u64,
}

#[derive(Debug, Default)]
struct Counters {
    total_queued: u64,
    total_submitted: u64,
    total_confirmed: u64,
    total_reverted: u64,
    total_failed: u64,
    total_cancelled: u64,
    avg_confirmation_time: u64,
}

pub struct ServiceMetrics {
    counters: RwLock<Counters>,
    start_time: u64,
}

impl Default for ServiceMetrics {
    fn default() -> Self {
        Self {
            counters: RwLock::new(Counters::default()),
            start_time: now_secs(),
        }
    }
}

impl ServiceMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn on_queued(&self) {
        self.counters.write().await.total_queued += 1;
    }

    pub async fn on_submitted(&self) {
        self.counters.write().await.total_submitted += 1;
    }

    pub async fn on_confirmed(&self, confirmation_time_secs: u64) {
        let mut c = self.counters.write().await;
        c.total_confirmed += 1;
        let total = c.total_confirmed;
        c.avg_confirmation_time =
            ((c.avg_confirmation_time * (total - 1)) + confirmation_time_secs) / total;
    }

    pub async fn on_reverted(&self) {
        self.counters.write().await.total_reverted += 1;
    }

    pub async fn on_failed(&self) {
        self.counters.write().await.total_failed += 1;
    }

    pub async fn on_cancelled(&self) {
        self.counters.write().await.total_cancelled += 1;
    }

    pub async fn snapshot(&self) -> MetricsSnapshot {
        let c = self.counters.read().await;
        MetricsSnapshot {
            total_queued: c.total_queued,
            total_submitted: c.total_submitted,
            total_confirmed: c.total_confirmed,
            total_reverted: c.total_reverted,
            total_failed: c.total_failed,
            total_cancelled: c.total_cancelled,
            avg_confirmation_time_secs: c.avg_confirmation_time,
            uptime_secs: now_secs().saturating_sub(self.start_time),
        }
    }
}
