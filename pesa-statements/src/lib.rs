#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Read-only statements and reporting over committed ledgers and
//! cached balances. Nothing here mutates financial state; cached
//! balances are an acceleration with the balance store as fallback
//! and authority.

use std::sync::Arc;

use pesa_accounts::Account;
use pesa_accounts::AccountPurpose;
use pesa_accounts::AccountStore;
use pesa_accounts::Balance;
use pesa_accounts::BalanceStore;
use pesa_cache::SharedStore;
use pesa_cache::keys;
use pesa_cache::ttl;
use pesa_ledger::Journal;
use pesa_ledger::JournalStore;
use pesa_ledger::LedgerEntry;
use pesa_ledger::PeriodQuery;
use pesa_ledger::TransactionFee;
use pesa_protocol::AccountNumber;
use pesa_protocol::DrCr;
use pesa_protocol::OwnerType;
use serde::Serialize;
use tracing::warn;

pub type StatementsResult<T> = Result<T, StatementsError>;

#[derive(Debug, thiserror::Error)]
pub enum StatementsError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatementLine {
    pub entry_id: i64,
    pub journal_id: i64,
    pub dr_cr: DrCr,
    pub amount_minor: i64,
    pub currency: String,
    pub running_balance_minor: Option<i64>,
    pub description: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountStatement {
    pub account_number: AccountNumber,
    pub currency: String,
    pub opening_balance_minor: i64,
    pub closing_balance_minor: i64,
    pub total_debits_minor: i64,
    pub total_credits_minor: i64,
    pub lines: Vec<StatementLine>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OwnerBalanceView {
    pub account_number: AccountNumber,
    pub currency: String,
    pub purpose: AccountPurpose,
    pub available_minor: i64,
    pub total_minor: i64,
    /// Whether the figure came from the shared-store cache.
    pub from_cache: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JournalView {
    pub journal: Journal,
    pub entries: Vec<LedgerEntry>,
    pub fees: Vec<TransactionFee>,
}

pub struct StatementsReader {
    accounts: Arc<dyn AccountStore>,
    balances: Arc<dyn BalanceStore>,
    journals: Arc<dyn JournalStore>,
    cache: Arc<dyn SharedStore>,
}

impl StatementsReader {
    #[must_use]
    pub fn new(
        accounts: Arc<dyn AccountStore>,
        balances: Arc<dyn BalanceStore>,
        journals: Arc<dyn JournalStore>,
        cache: Arc<dyn SharedStore>,
    ) -> Self {
        Self {
            accounts,
            balances,
            journals,
            cache,
        }
    }

    /// Entries for one account over a period, with the running balance
    /// taken from the authoritative balance_after snapshots.
    pub async fn account_statement(
        &self,
        account_number: &str,
        period: PeriodQuery,
    ) -> StatementsResult<AccountStatement> {
        let account = self.resolve_account(account_number).await?;
        let entries = self
            .journals
            .entries_for_account(account.id, period)
            .await
            .map_err(|err| StatementsError::Storage(err.to_string()))?;

        let mut total_debits_minor = 0;
        let mut total_credits_minor = 0;
        let lines: Vec<StatementLine> = entries
            .iter()
            .map(|entry| {
                match entry.dr_cr {
                    DrCr::Dr => total_debits_minor += entry.amount_minor,
                    DrCr::Cr => total_credits_minor += entry.amount_minor,
                }
                StatementLine {
                    entry_id: entry.id,
                    journal_id: entry.journal_id,
                    dr_cr: entry.dr_cr,
                    amount_minor: entry.amount_minor,
                    currency: entry.currency.clone(),
                    running_balance_minor: entry.balance_after_minor,
                    description: entry
                        .metadata
                        .get("description")
                        .and_then(serde_json::Value::as_str)
                        .map(str::to_string),
                    created_at: entry.created_at,
                }
            })
            .collect();

        let (opening_balance_minor, closing_balance_minor) = match (entries.first(), entries.last())
        {
            (Some(first), Some(last)) => {
                let opening = first
                    .balance_after_minor
                    .map(|after| after - first.signed_amount_minor())
                    .unwrap_or(0);
                let closing = last.balance_after_minor.unwrap_or(
                    opening + total_credits_minor - total_debits_minor,
                );
                (opening, closing)
            }
            _ => {
                let current = self
                    .balances
                    .balance(account.id)
                    .await
                    .map_err(|err| StatementsError::Storage(err.to_string()))?
                    .map(|balance| balance.available_minor)
                    .unwrap_or(0);
                (current, current)
            }
        };

        Ok(AccountStatement {
            account_number: account.account_number,
            currency: account.currency,
            opening_balance_minor,
            closing_balance_minor,
            total_debits_minor,
            total_credits_minor,
            lines,
        })
    }

    /// Balances across every account an owner holds. Cached figures
    /// are served when fresh; misses fall back to the balance store
    /// and warm the cache.
    pub async fn owner_summary(
        &self,
        owner_type: OwnerType,
        owner_id: &str,
    ) -> StatementsResult<Vec<OwnerBalanceView>> {
        let accounts = self
            .accounts
            .accounts_for_owner(owner_type, owner_id, None)
            .await
            .map_err(|err| StatementsError::Storage(err.to_string()))?;

        let mut views = Vec::with_capacity(accounts.len());
        for account in accounts {
            let key = keys::balance(&account.account_number);
            let cached: Option<Balance> =
                match pesa_cache::get_json(self.cache.as_ref(), &key).await {
                    Ok(cached) => cached,
                    Err(err) => {
                        warn!(key = %key, error = %err, "balance cache read failed");
                        None
                    }
                };
            let (balance, from_cache) = match cached {
                Some(balance) => (balance, true),
                None => {
                    let balance = self
                        .balances
                        .balance(account.id)
                        .await
                        .map_err(|err| StatementsError::Storage(err.to_string()))?
                        .ok_or_else(|| {
                            StatementsError::NotFound(format!(
                                "balance for account {}",
                                account.account_number
                            ))
                        })?;
                    if let Err(err) = pesa_cache::set_json(
                        self.cache.as_ref(),
                        &key,
                        &balance,
                        Some(ttl::BALANCE),
                    )
                    .await
                    {
                        warn!(key = %key, error = %err, "failed to warm balance cache");
                    }
                    (balance, false)
                }
            };
            views.push(OwnerBalanceView {
                account_number: account.account_number,
                currency: account.currency,
                purpose: account.purpose,
                available_minor: balance.available_minor,
                total_minor: balance.total_minor,
                from_cache,
            });
        }
        Ok(views)
    }

    /// The full journal behind an external reference (receipt code).
    pub async fn journal_by_reference(&self, reference: &str) -> StatementsResult<JournalView> {
        let journal = self
            .journals
            .journal_by_external_reference(reference)
            .await
            .map_err(|err| StatementsError::Storage(err.to_string()))?
            .ok_or_else(|| StatementsError::NotFound(format!("journal for {reference}")))?;
        let entries = self
            .journals
            .entries_for_journal(journal.id)
            .await
            .map_err(|err| StatementsError::Storage(err.to_string()))?;
        let fees = self
            .journals
            .fees_for_receipt(reference)
            .await
            .map_err(|err| StatementsError::Storage(err.to_string()))?;
        Ok(JournalView {
            journal,
            entries,
            fees,
        })
    }

    async fn resolve_account(&self, account_number: &str) -> StatementsResult<Account> {
        self.accounts
            .account_by_number(account_number)
            .await
            .map_err(|err| StatementsError::Storage(err.to_string()))?
            .ok_or_else(|| StatementsError::NotFound(format!("account {account_number}")))
    }
}
