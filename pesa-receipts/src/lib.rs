#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Receipts: the externally visible artifact of a transaction, keyed
//! by a monotonically-unique code. This crate carries the receipt
//! model, the downstream receipt-service client contract, and the
//! allocator that batches creates and updates against it.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use pesa_protocol::ExternalId;
use pesa_protocol::OwnerType;
use pesa_protocol::ReceiptCode;
use pesa_protocol::TransactionStatus;
use pesa_protocol::TransactionType;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::Mutex;

mod allocator;

pub use allocator::BatcherConfig;
pub use allocator::ReceiptAllocator;

pub type ReceiptsResult<T> = Result<T, ReceiptsError>;

#[derive(Debug, thiserror::Error)]
pub enum ReceiptsError {
    #[error("receipt generation timed out")]
    Timeout,
    #[error("receipt allocator is shutting down")]
    ShuttingDown,
    #[error("receipt not found: {0}")]
    NotFound(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("receipt service error: {0}")]
    Client(String),
}

/// One side of a receipt: who was credited or debited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiptParty {
    pub account_id: i64,
    pub owner_type: OwnerType,
    pub owner_id: ExternalId,
    pub status: TransactionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ledger_entry_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub code: ReceiptCode,
    pub transaction_type: TransactionType,
    pub amount_minor: i64,
    pub currency: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_amount_minor: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_currency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exchange_rate: Option<f64>,
    pub transaction_cost_minor: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creditor: Option<ReceiptParty>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debitor: Option<ReceiptParty>,
    pub status: TransactionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_receipt_code: Option<ReceiptCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reversal_receipt_code: Option<ReceiptCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reversed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Receipt {
    /// Lifecycle: pending → processing → {completed, failed, reversed}.
    #[must_use]
    pub fn may_transition_to(&self, next: TransactionStatus) -> bool {
        match (self.status, next) {
            (TransactionStatus::Pending, TransactionStatus::Processing) => true,
            (TransactionStatus::Pending | TransactionStatus::Processing, target) => {
                target.is_terminal()
            }
            // Completed receipts may still be reversed.
            (TransactionStatus::Completed, TransactionStatus::Reversed) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewReceipt {
    pub transaction_type: TransactionType,
    pub amount_minor: i64,
    pub currency: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_amount_minor: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_currency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exchange_rate: Option<f64>,
    #[serde(default)]
    pub transaction_cost_minor: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creditor: Option<ReceiptParty>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debitor: Option<ReceiptParty>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_receipt_code: Option<ReceiptCode>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Partial update applied to a receipt by code. Updates are idempotent
/// and may be retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiptUpdate {
    pub code: ReceiptCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TransactionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creditor_status: Option<TransactionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debitor_status: Option<TransactionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creditor_ledger_entry_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debitor_ledger_entry_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_cost_minor: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reversal_receipt_code: Option<ReceiptCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reversed_at: Option<DateTime<Utc>>,
}

impl ReceiptUpdate {
    pub fn status(code: impl Into<ReceiptCode>, status: TransactionStatus) -> Self {
        Self {
            code: code.into(),
            status: Some(status),
            creditor_status: None,
            debitor_status: None,
            creditor_ledger_entry_id: None,
            debitor_ledger_entry_id: None,
            transaction_cost_minor: None,
            reversal_receipt_code: None,
            failure_reason: None,
            completed_at: None,
            reversed_at: None,
        }
    }
}

/// Downstream receipt service. Batch calls carry many items per round
/// trip; `create_batch` returns codes positionally.
#[async_trait]
pub trait ReceiptClient: Send + Sync {
    async fn create_batch(&self, requests: Vec<NewReceipt>) -> ReceiptsResult<Vec<ReceiptCode>>;

    async fn update_batch(&self, updates: Vec<ReceiptUpdate>) -> ReceiptsResult<()>;

    async fn receipt(&self, code: &str) -> ReceiptsResult<Option<Receipt>>;
}

/// In-memory receipt service: issues monotonically-unique codes and
/// stores receipts for lookup. Stands in for the external service in
/// tests and embedded deployments.
#[derive(Default)]
pub struct InMemoryReceiptService {
    state: Mutex<ServiceState>,
}

#[derive(Default)]
struct ServiceState {
    seq: u64,
    receipts: HashMap<ReceiptCode, Receipt>,
}

impl InMemoryReceiptService {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn count(&self) -> usize {
        self.state.lock().await.receipts.len()
    }
}

#[async_trait]
impl ReceiptClient for InMemoryReceiptService {
    async fn create_batch(&self, requests: Vec<NewReceipt>) -> ReceiptsResult<Vec<ReceiptCode>> {
        let mut state = self.state.lock().await;
        let mut codes = Vec::with_capacity(requests.len());
        for request in requests {
            state.seq += 1;
            let code = format!("RCPT-{:010}", state.seq);
            let receipt = Receipt {
                code: code.clone(),
                transaction_type: request.transaction_type,
                amount_minor: request.amount_minor,
                currency: request.currency,
                original_amount_minor: request.original_amount_minor,
                original_currency: request.original_currency,
                exchange_rate: request.exchange_rate,
                transaction_cost_minor: request.transaction_cost_minor,
                creditor: request.creditor,
                debitor: request.debitor,
                status: TransactionStatus::Pending,
                parent_receipt_code: request.parent_receipt_code,
                reversal_receipt_code: None,
                failure_reason: None,
                created_at: Utc::now(),
                completed_at: None,
                reversed_at: None,
                metadata: request.metadata,
            };
            state.receipts.insert(code.clone(), receipt);
            codes.push(code);
        }
        Ok(codes)
    }

    async fn update_batch(&self, updates: Vec<ReceiptUpdate>) -> ReceiptsResult<()> {
        let mut state = self.state.lock().await;
        for update in updates {
            let receipt = state
                .receipts
                .get_mut(&update.code)
                .ok_or_else(|| ReceiptsError::NotFound(update.code.clone()))?;
            if let Some(status) = update.status
                && (receipt.status == status || receipt.may_transition_to(status))
            {
                receipt.status = status;
            }
            if let Some(status) = update.creditor_status
                && let Some(creditor) = &mut receipt.creditor
            {
                creditor.status = status;
            }
            if let Some(status) = update.debitor_status
                && let Some(debitor) = &mut receipt.debitor
            {
                debitor.status = status;
            }
            if let Some(entry_id) = update.creditor_ledger_entry_id
                && let Some(creditor) = &mut receipt.creditor
            {
                creditor.ledger_entry_id = Some(entry_id);
            }
            if let Some(entry_id) = update.debitor_ledger_entry_id
                && let Some(debitor) = &mut receipt.debitor
            {
                debitor.ledger_entry_id = Some(entry_id);
            }
            if let Some(cost) = update.transaction_cost_minor {
                receipt.transaction_cost_minor = cost;
            }
            if let Some(reversal) = update.reversal_receipt_code {
                receipt.reversal_receipt_code = Some(reversal);
            }
            if let Some(reason) = update.failure_reason {
                receipt.failure_reason = Some(reason);
            }
            if let Some(completed_at) = update.completed_at {
                receipt.completed_at = Some(completed_at);
            }
            if let Some(reversed_at) = update.reversed_at {
                receipt.reversed_at = Some(reversed_at);
            }
        }
        Ok(())
    }

    async fn receipt(&self, code: &str) -> ReceiptsResult<Option<Receipt>> {
        let state = self.state.lock().await;
        Ok(state.receipts.get(code).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn new_receipt(amount_minor: i64) -> NewReceipt {
        NewReceipt {
            transaction_type: TransactionType::Deposit,
            amount_minor,
            currency: "USD".into(),
            original_amount_minor: None,
            original_currency: None,
            exchange_rate: None,
            transaction_cost_minor: 0,
            creditor: None,
            debitor: None,
            parent_receipt_code: None,
            metadata: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn create_batch_issues_monotonic_codes() {
        let service = InMemoryReceiptService::new();
        let first = service
            .create_batch(vec![new_receipt(100), new_receipt(200)])
            .await
            .expect("create");
        let second = service
            .create_batch(vec![new_receipt(300)])
            .await
            .expect("create");

        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 1);
        let mut all = first.clone();
        all.extend(second.clone());
        let mut sorted = all.clone();
        sorted.sort();
        assert_eq!(all, sorted, "codes must be monotonically increasing");

        let receipt = service
            .receipt(&first[0])
            .await
            .expect("lookup")
            .expect("receipt exists");
        assert_eq!(receipt.status, TransactionStatus::Pending);
        assert_eq!(receipt.amount_minor, 100);
    }

    #[tokio::test]
    async fn update_batch_is_idempotent_by_code() {
        let service = InMemoryReceiptService::new();
        let codes = service
            .create_batch(vec![new_receipt(100)])
            .await
            .expect("create");
        let update = ReceiptUpdate {
            completed_at: Some(Utc::now()),
            ..ReceiptUpdate::status(codes[0].clone(), TransactionStatus::Completed)
        };

        service
            .update_batch(vec![update.clone()])
            .await
            .expect("first update");
        service
            .update_batch(vec![update])
            .await
            .expect("retried update");

        let receipt = service
            .receipt(&codes[0])
            .await
            .expect("lookup")
            .expect("exists");
        assert_eq!(receipt.status, TransactionStatus::Completed);
        assert!(receipt.completed_at.is_some());
    }

    #[tokio::test]
    async fn update_rejects_unknown_code() {
        let service = InMemoryReceiptService::new();
        let err = service
            .update_batch(vec![ReceiptUpdate::status(
                "RCPT-missing",
                TransactionStatus::Failed,
            )])
            .await
            .expect_err("unknown code must fail");
        assert!(matches!(err, ReceiptsError::NotFound(_)));
    }

    #[test]
    fn lifecycle_transitions_are_constrained() {
        let mut receipt = Receipt {
            code: "RCPT-1".into(),
            transaction_type: TransactionType::Deposit,
            amount_minor: 100,
            currency: "USD".into(),
            original_amount_minor: None,
            original_currency: None,
            exchange_rate: None,
            transaction_cost_minor: 0,
            creditor: None,
            debitor: None,
            status: TransactionStatus::Pending,
            parent_receipt_code: None,
            reversal_receipt_code: None,
            failure_reason: None,
            created_at: Utc::now(),
            completed_at: None,
            reversed_at: None,
            metadata: serde_json::Value::Null,
        };

        assert!(receipt.may_transition_to(TransactionStatus::Processing));
        assert!(receipt.may_transition_to(TransactionStatus::Failed));
        assert!(!receipt.may_transition_to(TransactionStatus::Pending));

        receipt.status = TransactionStatus::Completed;
        assert!(receipt.may_transition_to(TransactionStatus::Reversed));
        assert!(!receipt.may_transition_to(TransactionStatus::Processing));

        receipt.status = TransactionStatus::Failed;
        assert!(!receipt.may_transition_to(TransactionStatus::Completed));
    }
}
