#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Account and balance domain: types, invariants, and the store
//! contracts the rest of the platform is written against. Balances are
//! only ever mutated through the ledger commit path; the balance store
//! exposed here is a read contract.

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use pesa_protocol::AccountNumber;
use pesa_protocol::AccountScope;
use pesa_protocol::ExternalId;
use pesa_protocol::OwnerType;
use serde::Deserialize;
use serde::Serialize;

pub type AccountId = i64;

pub type AccountsResult<T> = Result<T, AccountsError>;

#[derive(Debug, thiserror::Error)]
pub enum AccountsError {
    #[error("account not found: {0}")]
    NotFound(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("duplicate account: {0}")]
    Duplicate(String),
    #[error("storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountPurpose {
    Liquidity,
    Fees,
    Profits,
    Wallet,
    Savings,
    Investment,
    Commission,
}

impl AccountPurpose {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountPurpose::Liquidity => "liquidity",
            AccountPurpose::Fees => "fees",
            AccountPurpose::Profits => "profits",
            AccountPurpose::Wallet => "wallet",
            AccountPurpose::Savings => "savings",
            AccountPurpose::Investment => "investment",
            AccountPurpose::Commission => "commission",
        }
    }

    /// Purposes that collect platform fee revenue. Demo accounts may
    /// not carry them.
    #[must_use]
    pub fn is_fee_purpose(&self) -> bool {
        matches!(self, AccountPurpose::Fees | AccountPurpose::Profits)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountKind {
    Real,
    Demo,
    System,
}

impl AccountKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountKind::Real => "real",
            AccountKind::Demo => "demo",
            AccountKind::System => "system",
        }
    }

    /// Demo-scope requests may only reference demo accounts; real-scope
    /// requests may reference real and system accounts.
    #[must_use]
    pub fn matches_scope(&self, scope: AccountScope) -> bool {
        match scope {
            AccountScope::Demo => matches!(self, AccountKind::Demo),
            AccountScope::Real => matches!(self, AccountKind::Real | AccountKind::System),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub account_number: AccountNumber,
    pub owner_type: OwnerType,
    pub owner_id: ExternalId,
    pub currency: String,
    pub purpose: AccountPurpose,
    pub kind: AccountKind,
    pub is_active: bool,
    pub is_locked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overdraft_limit_minor: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_agent_id: Option<ExternalId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commission_rate_bps: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    #[must_use]
    pub fn allows_posting(&self) -> bool {
        self.is_active && !self.is_locked
    }

    /// The lowest available balance a debit may leave behind.
    #[must_use]
    pub fn overdraft_floor_minor(&self) -> i64 {
        -self.overdraft_limit_minor.unwrap_or(0)
    }
}

/// Parameters for opening an account. The store assigns the id and the
/// globally-unique account number.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAccount {
    pub owner_type: OwnerType,
    pub owner_id: ExternalId,
    pub currency: String,
    pub purpose: AccountPurpose,
    pub kind: AccountKind,
    pub overdraft_limit_minor: Option<i64>,
    pub parent_agent_id: Option<ExternalId>,
    pub commission_rate_bps: Option<i64>,
}

impl NewAccount {
    pub fn new(
        owner_type: OwnerType,
        owner_id: impl Into<ExternalId>,
        currency: impl Into<String>,
        purpose: AccountPurpose,
        kind: AccountKind,
    ) -> Self {
        Self {
            owner_type,
            owner_id: owner_id.into(),
            currency: currency.into(),
            purpose,
            kind,
            overdraft_limit_minor: None,
            parent_agent_id: None,
            commission_rate_bps: None,
        }
    }

    pub fn validate(&self) -> AccountsResult<()> {
        if self.currency.trim().is_empty() || self.currency.len() > 8 {
            return Err(AccountsError::Validation(format!(
                "currency must be 1..=8 characters, got {:?}",
                self.currency
            )));
        }
        if self.owner_id.trim().is_empty() {
            return Err(AccountsError::Validation("owner_id must be provided".into()));
        }
        if self.kind == AccountKind::Demo {
            if self.overdraft_limit_minor.is_some() {
                return Err(AccountsError::Validation(
                    "demo accounts may not carry an overdraft limit".into(),
                ));
            }
            if self.purpose.is_fee_purpose() {
                return Err(AccountsError::Validation(
                    "demo accounts may not carry fee purposes".into(),
                ));
            }
        }
        if self.owner_type == OwnerType::Agent && self.commission_rate_bps.is_none() {
            return Err(AccountsError::Validation(
                "agent-owned accounts must carry a commission rate".into(),
            ));
        }
        if let Some(limit) = self.overdraft_limit_minor
            && limit < 0
        {
            return Err(AccountsError::Validation(
                "overdraft limit must be non-negative".into(),
            ));
        }
        Ok(())
    }

    /// The uniqueness tuple enforced for non-system accounts.
    #[must_use]
    pub fn identity_tuple(&self) -> (OwnerType, &str, &str, AccountPurpose, AccountKind) {
        (
            self.owner_type,
            self.owner_id.as_str(),
            self.currency.as_str(),
            self.purpose,
            self.kind,
        )
    }
}

/// Running balance, one-to-one with an account. Invariant:
/// `available <= total` and `available + reserved == total`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub account_id: AccountId,
    pub available_minor: i64,
    pub total_minor: i64,
    pub updated_at: DateTime<Utc>,
}

impl Balance {
    #[must_use]
    pub fn reserved_minor(&self) -> i64 {
        self.total_minor - self.available_minor
    }

    /// Whether a debit of `amount_minor` is admissible against the
    /// given overdraft floor.
    #[must_use]
    pub fn can_debit(&self, amount_minor: i64, floor_minor: i64) -> bool {
        self.available_minor - amount_minor >= floor_minor
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccountFilter {
    pub owner_type: Option<OwnerType>,
    pub owner_id: Option<ExternalId>,
    pub currency: Option<String>,
    pub purpose: Option<AccountPurpose>,
    pub kind: Option<AccountKind>,
    pub active_only: bool,
}

impl AccountFilter {
    #[must_use]
    pub fn matches(&self, account: &Account) -> bool {
        if let Some(owner_type) = self.owner_type
            && account.owner_type != owner_type
        {
            return false;
        }
        if let Some(owner_id) = &self.owner_id
            && &account.owner_id != owner_id
        {
            return false;
        }
        if let Some(currency) = &self.currency
            && &account.currency != currency
        {
            return false;
        }
        if let Some(purpose) = self.purpose
            && account.purpose != purpose
        {
            return false;
        }
        if let Some(kind) = self.kind
            && account.kind != kind
        {
            return false;
        }
        if self.active_only && !account.is_active {
            return false;
        }
        true
    }
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Opens an account, assigning the id and account number. The
    /// uniqueness tuple is enforced for non-system owners.
    async fn open(&self, account: NewAccount) -> AccountsResult<Account>;

    async fn account(&self, id: AccountId) -> AccountsResult<Option<Account>>;

    async fn account_by_number(&self, number: &str) -> AccountsResult<Option<Account>>;

    async fn accounts_for_owner(
        &self,
        owner_type: OwnerType,
        owner_id: &str,
        kind: Option<AccountKind>,
    ) -> AccountsResult<Vec<Account>>;

    async fn find(&self, filter: AccountFilter) -> AccountsResult<Vec<Account>>;

    async fn set_locked(&self, id: AccountId, locked: bool) -> AccountsResult<Account>;

    async fn set_active(&self, id: AccountId, active: bool) -> AccountsResult<Account>;
}

#[async_trait]
pub trait BalanceStore: Send + Sync {
    async fn balance(&self, account_id: AccountId) -> AccountsResult<Option<Balance>>;

    async fn balance_by_number(&self, number: &str) -> AccountsResult<Option<Balance>>;
}
