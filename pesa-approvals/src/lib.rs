#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Approval queue for manually-gated transactions. State machine:
//! pending → {approved → executed | failed} | rejected. Transitions
//! are only allowed from pending, self-approval is forbidden, and an
//! approval executes the equivalent transaction through the engine,
//! writing the resulting receipt code back onto the row.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use pesa_engine::TransactionEngine;
use pesa_protocol::AccountNumber;
use pesa_protocol::AccountScope;
use pesa_protocol::CreditRequest;
use pesa_protocol::DebitRequest;
use pesa_protocol::ExternalId;
use pesa_protocol::OwnerType;
use pesa_protocol::ReceiptCode;
use pesa_protocol::TransactionType;
use pesa_protocol::TransferRequest;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

pub type ApprovalId = String;

pub type ApprovalsResult<T> = Result<T, ApprovalsError>;

#[derive(Debug, thiserror::Error)]
pub enum ApprovalsError {
    #[error("approval {0} was not found")]
    NotFound(ApprovalId),
    #[error("requestors may not approve their own requests")]
    SelfApproval,
    #[error("approval is {0:?} and cannot transition")]
    NotPending(ApprovalStatus),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("execution error: {0}")]
    Execution(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Executed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Approval {
    pub id: ApprovalId,
    pub requested_by: ExternalId,
    pub requestor_type: OwnerType,
    pub transaction_type: TransactionType,
    pub account_numbers: Vec<AccountNumber>,
    pub amount_minor: i64,
    pub currency: String,
    pub scope: AccountScope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_account: Option<AccountNumber>,
    pub description: String,
    pub status: ApprovalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<ExternalId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt_code: Option<ReceiptCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApprovalRequest {
    pub requested_by: ExternalId,
    pub requestor_type: OwnerType,
    pub transaction_type: TransactionType,
    pub account_numbers: Vec<AccountNumber>,
    pub amount_minor: i64,
    pub currency: String,
    pub scope: AccountScope,
    pub destination_account: Option<AccountNumber>,
    pub description: String,
}

impl ApprovalRequest {
    pub fn validate(&self) -> ApprovalsResult<()> {
        if self.requested_by.trim().is_empty() {
            return Err(ApprovalsError::Validation(
                "requestor must be provided".into(),
            ));
        }
        if self.account_numbers.is_empty() {
            return Err(ApprovalsError::Validation(
                "at least one account number must be provided".into(),
            ));
        }
        if self.amount_minor <= 0 {
            return Err(ApprovalsError::Validation(
                "amount must be positive".into(),
            ));
        }
        if self.currency.trim().is_empty() {
            return Err(ApprovalsError::Validation(
                "currency must be provided".into(),
            ));
        }
        if self.transaction_type == TransactionType::Transfer
            && self.destination_account.is_none()
            && self.account_numbers.len() < 2
        {
            return Err(ApprovalsError::Validation(
                "transfers need a destination account".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueFilter {
    pub status: Option<ApprovalStatus>,
    pub requested_by: Option<ExternalId>,
}

impl QueueFilter {
    #[must_use]
    pub fn matches(&self, approval: &Approval) -> bool {
        if let Some(status) = self.status
            && approval.status != status
        {
            return false;
        }
        if let Some(requested_by) = &self.requested_by
            && &approval.requested_by != requested_by
        {
            return false;
        }
        true
    }
}

#[async_trait]
pub trait ApprovalQueue: Send + Sync {
    async fn submit(&self, request: ApprovalRequest) -> ApprovalsResult<Approval>;

    async fn approval(&self, id: &str) -> ApprovalsResult<Approval>;

    async fn list(&self, filter: QueueFilter) -> ApprovalsResult<Vec<Approval>>;

    /// Approves and executes. The returned row is already `executed`
    /// or `failed`; the financial work happened through the engine.
    async fn approve(&self, id: &str, approver: ExternalId) -> ApprovalsResult<Approval>;

    async fn reject(
        &self,
        id: &str,
        approver: ExternalId,
        reason: Option<String>,
    ) -> ApprovalsResult<Approval>;
}

/// Queue implementation executing approved requests through the
/// transaction engine.
pub struct EngineApprovalQueue {
    approvals: RwLock<HashMap<ApprovalId, Approval>>,
    engine: Arc<TransactionEngine>,
}

impl EngineApprovalQueue {
    #[must_use]
    pub fn new(engine: Arc<TransactionEngine>) -> Self {
        Self {
            approvals: RwLock::new(HashMap::new()),
            engine,
        }
    }

    /// The equivalent transaction, keyed idempotently by approval id
    /// so a crashed write-back can never double-execute.
    async fn execute(&self, approval: &Approval) -> ApprovalsResult<ReceiptCode> {
        let idempotency_key = Some(format!("approval-{}", approval.id));
        let result = match approval.transaction_type {
            TransactionType::Deposit => {
                self.engine
                    .credit(CreditRequest {
                        account_number: approval.account_numbers[0].clone(),
                        amount_minor: approval.amount_minor,
                        currency: approval.currency.clone(),
                        scope: approval.scope,
                        created_by: approval.requested_by.clone(),
                        creator_type: approval.requestor_type,
                        idempotency_key,
                        is_system_transaction: false,
                        description: Some(approval.description.clone()),
                        agent_id: None,
                    })
                    .await
            }
            TransactionType::Withdrawal => {
                self.engine
                    .debit(DebitRequest {
                        account_number: approval.account_numbers[0].clone(),
                        amount_minor: approval.amount_minor,
                        currency: approval.currency.clone(),
                        scope: approval.scope,
                        created_by: approval.requested_by.clone(),
                        creator_type: approval.requestor_type,
                        idempotency_key,
                        is_system_transaction: false,
                        description: Some(approval.description.clone()),
                    })
                    .await
            }
            TransactionType::Transfer => {
                let to_account = approval
                    .destination_account
                    .clone()
                    .or_else(|| approval.account_numbers.get(1).cloned())
                    .ok_or_else(|| {
                        ApprovalsError::Execution("transfer approval lacks a destination".into())
                    })?;
                self.engine
                    .transfer(TransferRequest {
                        from_account: approval.account_numbers[0].clone(),
                        to_account,
                        amount_minor: approval.amount_minor,
                        currency: approval.currency.clone(),
                        scope: approval.scope,
                        created_by: approval.requested_by.clone(),
                        creator_type: approval.requestor_type,
                        idempotency_key,
                        description: Some(approval.description.clone()),
                        agent_id: None,
                    })
                    .await
            }
            other => {
                return Err(ApprovalsError::Execution(format!(
                    "transaction type {} is not approvable",
                    other.as_str()
                )));
            }
        };

        match result {
            Ok(outcome) => outcome.receipt_code.ok_or_else(|| {
                ApprovalsError::Execution("engine returned no receipt code".into())
            }),
            Err(err) => Err(ApprovalsError::Execution(err.to_string())),
        }
    }
}

#[async_trait]
impl ApprovalQueue for EngineApprovalQueue {
    async fn submit(&self, request: ApprovalRequest) -> ApprovalsResult<Approval> {
        request.validate()?;
        let approval = Approval {
            id: Uuid::new_v4().to_string(),
            requested_by: request.requested_by,
            requestor_type: request.requestor_type,
            transaction_type: request.transaction_type,
            account_numbers: request.account_numbers,
            amount_minor: request.amount_minor,
            currency: request.currency,
            scope: request.scope,
            destination_account: request.destination_account,
            description: request.description,
            status: ApprovalStatus::Pending,
            approved_by: None,
            approved_at: None,
            receipt_code: None,
            failure_reason: None,
            created_at: Utc::now(),
        };
        let mut guard = self.approvals.write().await;
        guard.insert(approval.id.clone(), approval.clone());
        Ok(approval)
    }

    async fn approval(&self, id: &str) -> ApprovalsResult<Approval> {
        let guard = self.approvals.read().await;
        guard
            .get(id)
            .cloned()
            .ok_or_else(|| ApprovalsError::NotFound(id.to_string()))
    }

    async fn list(&self, filter: QueueFilter) -> ApprovalsResult<Vec<Approval>> {
        let guard = self.approvals.read().await;
        let mut approvals: Vec<Approval> = guard
            .values()
            .filter(|approval| filter.matches(approval))
            .cloned()
            .collect();
        approvals.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(approvals)
    }

    async fn approve(&self, id: &str, approver: ExternalId) -> ApprovalsResult<Approval> {
        // Transition to approved while holding the lock, then execute
        // without it so a slow commit cannot wedge the queue.
        let approved = {
            let mut guard = self.approvals.write().await;
            let approval = guard
                .get_mut(id)
                .ok_or_else(|| ApprovalsError::NotFound(id.to_string()))?;
            if approval.status != ApprovalStatus::Pending {
                return Err(ApprovalsError::NotPending(approval.status));
            }
            if approval.requested_by == approver {
                return Err(ApprovalsError::SelfApproval);
            }
            approval.status = ApprovalStatus::Approved;
            approval.approved_by = Some(approver);
            approval.approved_at = Some(Utc::now());
            approval.clone()
        };

        let outcome = self.execute(&approved).await;

        let mut guard = self.approvals.write().await;
        let approval = guard
            .get_mut(id)
            .ok_or_else(|| ApprovalsError::NotFound(id.to_string()))?;
        match outcome {
            Ok(receipt_code) => {
                approval.status = ApprovalStatus::Executed;
                approval.receipt_code = Some(receipt_code);
            }
            Err(err) => {
                warn!(approval_id = id, error = %err, "approval execution failed");
                approval.status = ApprovalStatus::Failed;
                approval.failure_reason = Some(err.to_string());
            }
        }
        Ok(approval.clone())
    }

    async fn reject(
        &self,
        id: &str,
        approver: ExternalId,
        reason: Option<String>,
    ) -> ApprovalsResult<Approval> {
        let mut guard = self.approvals.write().await;
        let approval = guard
            .get_mut(id)
            .ok_or_else(|| ApprovalsError::NotFound(id.to_string()))?;
        if approval.status != ApprovalStatus::Pending {
            return Err(ApprovalsError::NotPending(approval.status));
        }
        if approval.requested_by == approver {
            return Err(ApprovalsError::SelfApproval);
        }
        approval.status = ApprovalStatus::Rejected;
        approval.approved_by = Some(approver);
        approval.approved_at = Some(Utc::now());
        approval.failure_reason = reason;
        Ok(approval.clone())
    }
}
