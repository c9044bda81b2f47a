#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Shared domain types for the transaction platform: the canonical
//! transaction request/result shapes, the enums every component agrees
//! on, and the event envelope published after each commit.

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

pub type AccountNumber = String;
pub type ReceiptCode = String;
pub type ExternalId = String;
pub type IdempotencyKey = String;

pub type ProtocolResult<T> = Result<T, ProtocolError>;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid request: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnerType {
    System,
    User,
    Agent,
    Partner,
    Admin,
}

impl OwnerType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            OwnerType::System => "system",
            OwnerType::User => "user",
            OwnerType::Agent => "agent",
            OwnerType::Partner => "partner",
            OwnerType::Admin => "admin",
        }
    }
}

/// Which side of the platform a request operates on. Demo-scope
/// transactions may only touch demo accounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountScope {
    Real,
    Demo,
}

impl AccountScope {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountScope::Real => "real",
            AccountScope::Demo => "demo",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DrCr {
    #[serde(rename = "DR")]
    Dr,
    #[serde(rename = "CR")]
    Cr,
}

impl DrCr {
    #[must_use]
    pub fn opposite(&self) -> Self {
        match self {
            DrCr::Dr => DrCr::Cr,
            DrCr::Cr => DrCr::Dr,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            DrCr::Dr => "DR",
            DrCr::Cr => "CR",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Deposit,
    Withdrawal,
    Transfer,
    Conversion,
    Fee,
    Commission,
    Trade,
    Adjustment,
    Refund,
    Reversal,
}

impl TransactionType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Deposit => "deposit",
            TransactionType::Withdrawal => "withdrawal",
            TransactionType::Transfer => "transfer",
            TransactionType::Conversion => "conversion",
            TransactionType::Fee => "fee",
            TransactionType::Commission => "commission",
            TransactionType::Trade => "trade",
            TransactionType::Adjustment => "adjustment",
            TransactionType::Refund => "refund",
            TransactionType::Reversal => "reversal",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Reversed,
}

impl TransactionStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Processing => "processing",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Failed => "failed",
            TransactionStatus::Reversed => "reversed",
        }
    }

    /// Terminal statuses never transition again.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Completed | TransactionStatus::Failed | TransactionStatus::Reversed
        )
    }
}

/// One posting requested against one account. Amounts are positive
/// minor units; the side is carried separately as [`DrCr`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryRequest {
    pub account_number: AccountNumber,
    pub amount_minor: i64,
    pub dr_cr: DrCr,
    pub currency: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// Assigned by the engine once a receipt has been allocated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt_code: Option<ReceiptCode>,
}

impl EntryRequest {
    pub fn new(
        account_number: impl Into<AccountNumber>,
        amount_minor: i64,
        dr_cr: DrCr,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            account_number: account_number.into(),
            amount_minor,
            dr_cr,
            currency: currency.into(),
            description: None,
            metadata: serde_json::Value::Null,
            receipt_code: None,
        }
    }
}

fn default_generate_receipt() -> bool {
    true
}

/// The canonical request every engine operation is translated into.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<IdempotencyKey>,
    pub transaction_type: TransactionType,
    pub scope: AccountScope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_by: ExternalId,
    pub creator_type: OwnerType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<ExternalId>,
    /// System transactions never attract fees.
    #[serde(default)]
    pub is_system_transaction: bool,
    pub entries: Vec<EntryRequest>,
    #[serde(default = "default_generate_receipt")]
    pub generate_receipt: bool,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl TransactionRequest {
    pub fn new(
        transaction_type: TransactionType,
        scope: AccountScope,
        created_by: impl Into<ExternalId>,
        creator_type: OwnerType,
    ) -> Self {
        Self {
            idempotency_key: None,
            transaction_type,
            scope,
            description: None,
            created_by: created_by.into(),
            creator_type,
            agent_id: None,
            is_system_transaction: false,
            entries: Vec::new(),
            generate_receipt: true,
            metadata: serde_json::Value::Null,
        }
    }

    /// Shape validation only; account and balance checks belong to the
    /// engine's pre-validation pass.
    pub fn validate(&self) -> ProtocolResult<()> {
        if self.created_by.trim().is_empty() {
            return Err(ProtocolError::Validation(
                "created_by must be provided".into(),
            ));
        }
        if let Some(key) = &self.idempotency_key
            && key.trim().is_empty()
        {
            return Err(ProtocolError::Validation(
                "idempotency key must not be blank".into(),
            ));
        }
        if self.entries.is_empty() {
            return Err(ProtocolError::Validation(
                "transaction must carry at least one entry".into(),
            ));
        }
        for entry in &self.entries {
            if entry.account_number.trim().is_empty() {
                return Err(ProtocolError::Validation(
                    "entry account number must be provided".into(),
                ));
            }
            if entry.amount_minor <= 0 {
                return Err(ProtocolError::Validation(format!(
                    "entry amount must be positive, got {}",
                    entry.amount_minor
                )));
            }
            if entry.currency.trim().is_empty() || entry.currency.len() > 8 {
                return Err(ProtocolError::Validation(format!(
                    "entry currency must be 1..=8 characters, got {:?}",
                    entry.currency
                )));
            }
        }
        Ok(())
    }

    /// The debit-side canonical amount reported on results and
    /// receipts: the first debit entry, falling back to the first
    /// entry when the request carries no debit.
    #[must_use]
    pub fn canonical_amount(&self) -> Option<(i64, &str)> {
        self.entries
            .iter()
            .find(|entry| entry.dr_cr == DrCr::Dr)
            .or_else(|| self.entries.first())
            .map(|entry| (entry.amount_minor, entry.currency.as_str()))
    }
}

/// Outcome surfaced to the caller of an engine operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt_code: Option<ReceiptCode>,
    /// Journal id, present once the commit is durable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<i64>,
    pub status: TransactionStatus,
    pub amount_minor: i64,
    pub currency: String,
    pub processing_time_ms: u64,
    pub created_at: DateTime<Utc>,
}

/// Semantic request shapes. Each is translated into a canonical
/// [`TransactionRequest`] by the engine's private builders.
#[derive(Debug, Clone, PartialEq)]
pub struct CreditRequest {
    pub account_number: AccountNumber,
    pub amount_minor: i64,
    pub currency: String,
    pub scope: AccountScope,
    pub created_by: ExternalId,
    pub creator_type: OwnerType,
    pub idempotency_key: Option<IdempotencyKey>,
    pub is_system_transaction: bool,
    pub description: Option<String>,
    pub agent_id: Option<ExternalId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DebitRequest {
    pub account_number: AccountNumber,
    pub amount_minor: i64,
    pub currency: String,
    pub scope: AccountScope,
    pub created_by: ExternalId,
    pub creator_type: OwnerType,
    pub idempotency_key: Option<IdempotencyKey>,
    pub is_system_transaction: bool,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransferRequest {
    pub from_account: AccountNumber,
    pub to_account: AccountNumber,
    pub amount_minor: i64,
    pub currency: String,
    pub scope: AccountScope,
    pub created_by: ExternalId,
    pub creator_type: OwnerType,
    pub idempotency_key: Option<IdempotencyKey>,
    pub description: Option<String>,
    pub agent_id: Option<ExternalId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConversionRequest {
    pub from_account: AccountNumber,
    pub to_account: AccountNumber,
    pub amount_minor: i64,
    pub source_currency: String,
    pub target_currency: String,
    pub scope: AccountScope,
    pub created_by: ExternalId,
    pub creator_type: OwnerType,
    pub idempotency_key: Option<IdempotencyKey>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TradeRequest {
    pub account_number: AccountNumber,
    pub amount_minor: i64,
    pub currency: String,
    pub scope: AccountScope,
    pub created_by: ExternalId,
    pub creator_type: OwnerType,
    pub trade_reference: String,
    pub idempotency_key: Option<IdempotencyKey>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommissionRequest {
    pub agent_id: ExternalId,
    pub amount_minor: i64,
    pub currency: String,
    pub created_by: ExternalId,
    pub creator_type: OwnerType,
    pub source_receipt_code: Option<ReceiptCode>,
    pub idempotency_key: Option<IdempotencyKey>,
}

/// Envelope published on the event bus after each transaction settles,
/// keyed by receipt code. `event_type` is `transaction.<status>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_type: String,
    pub receipt_code: ReceiptCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<i64>,
    pub status: TransactionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount_minor: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl EventEnvelope {
    pub fn transaction(receipt_code: impl Into<ReceiptCode>, status: TransactionStatus) -> Self {
        Self {
            event_type: format!("transaction.{}", status.as_str()),
            receipt_code: receipt_code.into(),
            transaction_id: None,
            status,
            amount_minor: None,
            currency: None,
            error_message: None,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn base_request() -> TransactionRequest {
        let mut request = TransactionRequest::new(
            TransactionType::Transfer,
            AccountScope::Real,
            "u1",
            OwnerType::User,
        );
        request.entries = vec![
            EntryRequest::new("ACC-1", 10_000, DrCr::Dr, "USD"),
            EntryRequest::new("ACC-2", 10_000, DrCr::Cr, "USD"),
        ];
        request
    }

    #[test]
    fn validate_accepts_well_formed_request() {
        assert!(base_request().validate().is_ok());
    }

    #[test]
    fn validate_rejects_empty_entries() {
        let mut request = base_request();
        request.entries.clear();
        assert!(matches!(
            request.validate(),
            Err(ProtocolError::Validation(_))
        ));
    }

    #[test]
    fn validate_rejects_non_positive_amounts() {
        let mut request = base_request();
        request.entries[0].amount_minor = 0;
        assert!(request.validate().is_err());
        request.entries[0].amount_minor = -5;
        assert!(request.validate().is_err());
    }

    #[test]
    fn validate_rejects_oversized_currency() {
        let mut request = base_request();
        request.entries[0].currency = "TOOLONGCODE".into();
        assert!(request.validate().is_err());
    }

    #[test]
    fn validate_rejects_blank_idempotency_key() {
        let mut request = base_request();
        request.idempotency_key = Some("   ".into());
        assert!(request.validate().is_err());
    }

    #[test]
    fn canonical_amount_prefers_debit_side() {
        let mut request = base_request();
        request.entries[0].amount_minor = 7_500;
        assert_eq!(request.canonical_amount(), Some((7_500, "USD")));

        request.entries[0].dr_cr = DrCr::Cr;
        assert_eq!(request.canonical_amount(), Some((7_500, "USD")));
    }

    #[test]
    fn generate_receipt_defaults_to_true() {
        let parsed: TransactionRequest = serde_json::from_value(serde_json::json!({
            "transaction_type": "deposit",
            "scope": "real",
            "created_by": "svc",
            "creator_type": "system",
            "entries": [{
                "account_number": "ACC-1",
                "amount_minor": 100,
                "dr_cr": "CR",
                "currency": "USD"
            }]
        }))
        .expect("request parses");
        assert!(parsed.generate_receipt);
        assert_eq!(parsed.entries[0].dr_cr, DrCr::Cr);
    }

    #[test]
    fn envelope_event_type_tracks_status() {
        let envelope = EventEnvelope::transaction("RCPT-1", TransactionStatus::Completed);
        assert_eq!(envelope.event_type, "transaction.completed");
        assert_eq!(envelope.receipt_code, "RCPT-1");

        let failed = EventEnvelope::transaction("RCPT-2", TransactionStatus::Failed);
        assert_eq!(failed.event_type, "transaction.failed");
    }
}
