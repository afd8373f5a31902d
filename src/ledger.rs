//! Transaction ledger row types and the lifecycle state machine.
//!
//! Every transition goes through [`TxStatus::can_transition_to`]; the store
//! implementations refuse anything else, so a caller-visible status never
//! regresses once observed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ServiceError;

// ==================== LIFECYCLE STATES ====================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxStatus {
    Queued,
    Signing,
    Submitted,
    Errored,
    ConfirmedSuccess,
    ConfirmedRevert,
    Failed,
    Cancelled,
}

impl TxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxStatus::Queued => "QUEUED",
            TxStatus::Signing => "SIGNING",
            TxStatus::Submitted => "SUBMITTED",
            TxStatus::Errored => "ERRORED",
            TxStatus::ConfirmedSuccess => "CONFIRMED_SUCCESS",
            TxStatus::ConfirmedRevert => "CONFIRMED_REVERT",
            TxStatus::Failed => "FAILED",
            TxStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ServiceError> {
        match s {
            "QUEUED" => Ok(TxStatus::Queued),
            "SIGNING" => Ok(TxStatus::Signing),
            "SUBMITTED" => Ok(TxStatus::Submitted),
            "ERRORED" => Ok(TxStatus::Errored),
            "CONFIRMED_SUCCESS" => Ok(TxStatus::ConfirmedSuccess),
            "CONFIRMED_REVERT" => Ok(TxStatus::ConfirmedRevert),
            "FAILED" => Ok(TxStatus::Failed),
            "CANCELLED" => Ok(TxStatus::Cancelled),
            other => Err(ServiceError::Internal(format!("unknown status '{}'", other))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TxStatus::ConfirmedSuccess
                | TxStatus::ConfirmedRevert
                | TxStatus::Failed
                | TxStatus::Cancelled
        )
    }

    /// Legal lifecycle transitions. Cancellation is only possible before
    /// signing begins; a retry re-enters SIGNING with the same nonce.
    pub fn can_transition_to(&self, next: TxStatus) -> bool {
        match self {
            TxStatus::Queued => matches!(next, TxStatus::Signing | TxStatus::Cancelled),
            TxStatus::Signing => matches!(next, TxStatus::Submitted | TxStatus::Errored),
            TxStatus::Submitted => matches!(
                next,
                TxStatus::ConfirmedSuccess | TxStatus::ConfirmedRevert | TxStatus::Errored
            ),
            TxStatus::Errored => {
                matches!(next, TxStatus::Signing | TxStatus::Queued | TxStatus::Failed)
            }
            _ => false,
        }
    }
}

// ==================== TERMINAL OUTCOME ====================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxOutcome {
    MinedSuccess,
    MinedRevert,
    Dropped,
    Cancelled,
}

impl TxOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxOutcome::MinedSuccess => "MINED_SUCCESS",
            TxOutcome::MinedRevert => "MINED_REVERT",
            TxOutcome::Dropped => "DROPPED",
            TxOutcome::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ServiceError> {
        match s {
            "MINED_SUCCESS" => Ok(TxOutcome::MinedSuccess),
            "MINED_REVERT" => Ok(TxOutcome::MinedRevert),
            "DROPPED" => Ok(TxOutcome::Dropped),
            "CANCELLED" => Ok(TxOutcome::Cancelled),
            other => Err(ServiceError::Internal(format!("unknown outcome '{}'", other))),
        }
    }
}

// ==================== LEDGER ROW ====================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxRecord {
    pub queue_id: String,
    pub wallet_address: String,
    pub chain_id: u64,
    /// Opaque unsigned payload from the contract-call layer, stored verbatim.
    pub payload: String,
    pub nonce: i64,
    pub status: TxStatus,
    pub signed_payload: Option<String>,
    pub tx_hash: Option<String>,
    pub retry_count: i32,
    pub error: Option<String>,
    pub outcome: Option<TxOutcome>,
    pub block_number: Option<i64>,
    pub gas_used: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
}

impl TxRecord {
    pub fn new_queued(
        queue_id: String,
        wallet_address: String,
        chain_id: u64,
        payload: String,
        nonce: i64,
    ) -> Self {
        let now = Utc::now();
        Self {
            queue_id,
            wallet_address,
            chain_id,
            payload,
            nonce,
            status: TxStatus::Queued,
            signed_payload: None,
            tx_hash: None,
            retry_count: 0,
            error: None,
            outcome: None,
            block_number: None,
            gas_used: None,
            created_at: now,
            last_updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_happy_path() {
        assert!(TxStatus::Queued.can_transition_to(TxStatus::Signing));
        assert!(TxStatus::Signing.can_transition_to(TxStatus::Submitted));
        assert!(TxStatus::Submitted.can_transition_to(TxStatus::ConfirmedSuccess));
        assert!(TxStatus::Submitted.can_transition_to(TxStatus::ConfirmedRevert));
    }

    #[test]
    fn cancellation_only_before_signing() {
        assert!(TxStatus::Queued.can_transition_to(TxStatus::Cancelled));
        assert!(!TxStatus::Signing.can_transition_to(TxStatus::Cancelled));
        assert!(!TxStatus::Submitted.can_transition_to(TxStatus::Cancelled));
        assert!(!TxStatus::Errored.can_transition_to(TxStatus::Cancelled));
    }

    #[test]
    fn terminal_states_have_no_exit() {
        for terminal in [
            TxStatus::ConfirmedSuccess,
            TxStatus::ConfirmedRevert,
            TxStatus::Failed,
            TxStatus::Cancelled,
        ] {
            assert!(terminal.is_terminal());
            for next in [
                TxStatus::Queued,
                TxStatus::Signing,
                TxStatus::Submitted,
                TxStatus::Errored,
                TxStatus::Failed,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn errored_can_retry_or_fail() {
        assert!(TxStatus::Errored.can_transition_to(TxStatus::Signing));
        assert!(TxStatus::Errored.can_transition_to(TxStatus::Failed));
        assert!(!TxStatus::Errored.can_transition_to(TxStatus::ConfirmedSuccess));
    }

    #[test]
    fn status_strings_round_trip() {
        for status in [
            TxStatus::Queued,
            TxStatus::Signing,
            TxStatus::Submitted,
            TxStatus::Errored,
            TxStatus::ConfirmedSuccess,
            TxStatus::ConfirmedRevert,
            TxStatus::Failed,
            TxStatus::Cancelled,
        ] {
            assert_eq!(TxStatus::parse(status.as_str()).unwrap(), status);
        }
    }
}
