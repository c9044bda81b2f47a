#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Journal and ledger persistence: the head record of a transaction,
//! its balanced postings, and its fee rows. The store contract commits
//! all of them plus the balance updates in one atomic transaction and
//! enforces idempotency by key.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use pesa_accounts::AccountId;
use pesa_protocol::AccountScope;
use pesa_protocol::DrCr;
use pesa_protocol::ExternalId;
use pesa_protocol::IdempotencyKey;
use pesa_protocol::OwnerType;
use pesa_protocol::ReceiptCode;
use pesa_protocol::TransactionType;
use serde::Deserialize;
use serde::Serialize;

mod memory;

pub use memory::InMemoryLedger;

pub type JournalId = i64;
pub type LedgerEntryId = i64;
pub type FeeRowId = i64;

pub type LedgerResult<T> = Result<T, LedgerError>;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("duplicate idempotency key: {0}")]
    DuplicateIdempotencyKey(IdempotencyKey),
    #[error(
        "insufficient funds on account {account_id}: available {available_minor}, requested {requested_minor}"
    )]
    InsufficientFunds {
        account_id: AccountId,
        available_minor: i64,
        requested_minor: i64,
    },
    #[error("commit conflict: {0}")]
    Conflict(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// The head record of one committed transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Journal {
    pub id: JournalId,
    pub idempotency_key: IdempotencyKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_reference: Option<ReceiptCode>,
    pub transaction_type: TransactionType,
    pub scope: AccountScope,
    pub created_by: ExternalId,
    pub creator_type: OwnerType,
    pub created_at: DateTime<Utc>,
}

/// One posting within a journal. Amounts are positive; the side is
/// carried by `dr_cr`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: LedgerEntryId,
    pub journal_id: JournalId,
    pub account_id: AccountId,
    pub dr_cr: DrCr,
    pub amount_minor: i64,
    pub currency: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balance_after_minor: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt_code: Option<ReceiptCode>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Signed effect of this entry on its account balance.
    #[must_use]
    pub fn signed_amount_minor(&self) -> i64 {
        match self.dr_cr {
            DrCr::Dr => -self.amount_minor,
            DrCr::Cr => self.amount_minor,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeType {
    Flat,
    Percentage,
    AgentCommission,
    Network,
}

impl FeeType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            FeeType::Flat => "flat",
            FeeType::Percentage => "percentage",
            FeeType::AgentCommission => "agent_commission",
            FeeType::Network => "network",
        }
    }
}

/// A fee charged on a journal; one row per applied rule or commission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionFee {
    pub id: FeeRowId,
    pub journal_id: JournalId,
    pub receipt_code: ReceiptCode,
    pub fee_rule_id: i64,
    pub fee_type: FeeType,
    pub amount_minor: i64,
    pub currency: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<ExternalId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewJournal {
    pub idempotency_key: IdempotencyKey,
    pub external_reference: Option<ReceiptCode>,
    pub transaction_type: TransactionType,
    pub scope: AccountScope,
    pub created_by: ExternalId,
    pub creator_type: OwnerType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewLedgerEntry {
    pub account_id: AccountId,
    pub dr_cr: DrCr,
    pub amount_minor: i64,
    pub currency: String,
    pub receipt_code: Option<ReceiptCode>,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewTransactionFee {
    pub receipt_code: ReceiptCode,
    pub fee_rule_id: i64,
    pub fee_type: FeeType,
    pub amount_minor: i64,
    pub currency: String,
    pub agent_id: Option<ExternalId>,
}

/// Everything one commit writes: the journal head, its postings, and
/// its fee rows.
#[derive(Debug, Clone, PartialEq)]
pub struct JournalDraft {
    pub journal: NewJournal,
    pub entries: Vec<NewLedgerEntry>,
    pub fees: Vec<NewTransactionFee>,
}

impl JournalDraft {
    /// Sums debits and credits per currency across the draft.
    #[must_use]
    pub fn totals_by_currency(&self) -> HashMap<&str, (i64, i64)> {
        let mut totals: HashMap<&str, (i64, i64)> = HashMap::new();
        for entry in &self.entries {
            let slot = totals.entry(entry.currency.as_str()).or_insert((0, 0));
            match entry.dr_cr {
                DrCr::Dr => slot.0 += entry.amount_minor,
                DrCr::Cr => slot.1 += entry.amount_minor,
            }
        }
        totals
    }

    /// Double-entry balance holds per currency independently.
    #[must_use]
    pub fn is_balanced(&self) -> bool {
        self.totals_by_currency()
            .values()
            .all(|(debits, credits)| debits == credits)
    }

    pub fn validate(&self) -> LedgerResult<()> {
        if self.journal.idempotency_key.trim().is_empty() {
            return Err(LedgerError::Validation(
                "journal idempotency key must be provided".into(),
            ));
        }
        if self.entries.is_empty() {
            return Err(LedgerError::Validation(
                "journal must carry at least one ledger entry".into(),
            ));
        }
        for entry in &self.entries {
            if entry.amount_minor <= 0 {
                return Err(LedgerError::Validation(format!(
                    "ledger entry amount must be positive, got {}",
                    entry.amount_minor
                )));
            }
        }
        if !self.is_balanced() {
            let summary: Vec<String> = self
                .totals_by_currency()
                .iter()
                .filter(|(_, (debits, credits))| debits != credits)
                .map(|(currency, (debits, credits))| {
                    format!("{currency}: DR {debits} != CR {credits}")
                })
                .collect();
            return Err(LedgerError::Validation(format!(
                "journal must balance per currency ({})",
                summary.join(", ")
            )));
        }
        for fee in &self.fees {
            if fee.amount_minor < 0 {
                return Err(LedgerError::Validation(
                    "fee amount must be non-negative".into(),
                ));
            }
            if fee.fee_type == FeeType::AgentCommission && fee.agent_id.is_none() {
                return Err(LedgerError::Validation(
                    "agent commission fee rows must name the agent".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Admissibility re-check performed under the account row lock: the
/// sum of debits against the account must not push available below
/// the overdraft floor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceGuard {
    pub account_id: AccountId,
    pub debit_total_minor: i64,
    pub floor_minor: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommittedJournal {
    pub journal: Journal,
    pub entries: Vec<LedgerEntry>,
    pub fees: Vec<TransactionFee>,
}

/// Created-at range for period-scoped queries. Open bounds match all.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeriodQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl PeriodQuery {
    #[must_use]
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        if let Some(from) = self.from
            && at < from
        {
            return false;
        }
        if let Some(to) = self.to
            && at >= to
        {
            return false;
        }
        true
    }
}

#[async_trait]
pub trait JournalStore: Send + Sync {
    /// Commits the draft atomically: locks the touched account rows in
    /// ascending account-id order, re-checks every [`BalanceGuard`],
    /// inserts the journal (unique idempotency key), bulk-inserts
    /// entries and fee rows, applies balances, and stamps
    /// `balance_after` on each entry. Either everything persists or
    /// nothing does.
    async fn commit(
        &self,
        draft: JournalDraft,
        guards: Vec<BalanceGuard>,
    ) -> LedgerResult<CommittedJournal>;

    async fn journal(&self, id: JournalId) -> LedgerResult<Option<Journal>>;

    async fn journal_by_external_reference(
        &self,
        reference: &str,
    ) -> LedgerResult<Option<Journal>>;

    async fn journal_by_idempotency_key(&self, key: &str) -> LedgerResult<Option<Journal>>;

    async fn entries_for_journal(&self, journal_id: JournalId) -> LedgerResult<Vec<LedgerEntry>>;

    async fn entries_for_account(
        &self,
        account_id: AccountId,
        period: PeriodQuery,
    ) -> LedgerResult<Vec<LedgerEntry>>;

    async fn journals_for_creator(
        &self,
        created_by: &str,
        limit: Option<usize>,
    ) -> LedgerResult<Vec<Journal>>;

    async fn fees_for_receipt(&self, receipt_code: &str) -> LedgerResult<Vec<TransactionFee>>;
}

#[cfg(feature = "postgres-store")]
#[derive(Clone)]
pub struct PostgresLedgerStore {
    connection_string: String,
}

#[cfg(feature = "postgres-store")]
impl PostgresLedgerStore {
    /// Constructs a Postgres-backed store stub.
    ///
    /// # Schema Draft
    /// ```sql
    /// CREATE TABLE journals (
    ///     id BIGSERIAL PRIMARY KEY,
    ///     idempotency_key TEXT NOT NULL UNIQUE,
    ///     external_reference TEXT,
    ///     transaction_type TEXT NOT NULL,
    ///     scope TEXT NOT NULL,
    ///     created_by TEXT NOT NULL,
    ///     creator_type TEXT NOT NULL,
    ///     created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    /// );
    /// CREATE TABLE ledgers (
    ///     id BIGSERIAL PRIMARY KEY,
    ///     journal_id BIGINT NOT NULL REFERENCES journals (id),
    ///     account_id BIGINT NOT NULL,
    ///     dr_cr TEXT NOT NULL,
    ///     amount_minor BIGINT NOT NULL CHECK (amount_minor > 0),
    ///     currency TEXT NOT NULL,
    ///     balance_after_minor BIGINT,
    ///     receipt_code TEXT,
    ///     metadata JSONB NOT NULL DEFAULT 'null'
    /// );
    /// CREATE TABLE transaction_fees (
    ///     id BIGSERIAL PRIMARY KEY,
    ///     journal_id BIGINT NOT NULL REFERENCES journals (id),
    ///     receipt_code TEXT NOT NULL,
    ///     fee_rule_id BIGINT NOT NULL,
    ///     fee_type TEXT NOT NULL,
    ///     amount_minor BIGINT NOT NULL,
    ///     currency TEXT NOT NULL,
    ///     agent_id TEXT
    /// );
    /// ```
    ///
    /// TODO: wire the commit path through `SELECT ... FOR UPDATE` in
    /// ascending account-id order once the connection pool lands.
    #[must_use]
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
        }
    }
}

#[cfg(feature = "postgres-store")]
#[async_trait]
impl JournalStore for PostgresLedgerStore {
    async fn commit(
        &self,
        draft: JournalDraft,
        guards: Vec<BalanceGuard>,
    ) -> LedgerResult<CommittedJournal> {
        let _ = (&self.connection_string, draft, guards);
        Err(LedgerError::Storage(
            "postgres store persistence not yet implemented".into(),
        ))
    }

    async fn journal(&self, id: JournalId) -> LedgerResult<Option<Journal>> {
        let _ = (&self.connection_string, id);
        Err(LedgerError::Storage(
            "postgres store persistence not yet implemented".into(),
        ))
    }

    async fn journal_by_external_reference(
        &self,
        reference: &str,
    ) -> LedgerResult<Option<Journal>> {
        let _ = (&self.connection_string, reference);
        Err(LedgerError::Storage(
            "postgres store persistence not yet implemented".into(),
        ))
    }

    async fn journal_by_idempotency_key(&self, key: &str) -> LedgerResult<Option<Journal>> {
        let _ = (&self.connection_string, key);
        Err(LedgerError::Storage(
            "postgres store persistence not yet implemented".into(),
        ))
    }

    async fn entries_for_journal(&self, journal_id: JournalId) -> LedgerResult<Vec<LedgerEntry>> {
        let _ = (&self.connection_string, journal_id);
        Err(LedgerError::Storage(
            "postgres store persistence not yet implemented".into(),
        ))
    }

    async fn entries_for_account(
        &self,
        account_id: AccountId,
        period: PeriodQuery,
    ) -> LedgerResult<Vec<LedgerEntry>> {
        let _ = (&self.connection_string, account_id, period);
        Err(LedgerError::Storage(
            "postgres store persistence not yet implemented".into(),
        ))
    }

    async fn journals_for_creator(
        &self,
        created_by: &str,
        limit: Option<usize>,
    ) -> LedgerResult<Vec<Journal>> {
        let _ = (&self.connection_string, created_by, limit);
        Err(LedgerError::Storage(
            "postgres store persistence not yet implemented".into(),
        ))
    }

    async fn fees_for_receipt(&self, receipt_code: &str) -> LedgerResult<Vec<TransactionFee>> {
        let _ = (&self.connection_string, receipt_code);
        Err(LedgerError::Storage(
            "postgres store persistence not yet implemented".into(),
        ))
    }
}
