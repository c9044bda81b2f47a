use std::collections::HashMap;
use std::collections::HashSet;

use async_trait::async_trait;
use chrono::Utc;
use pesa_accounts::Account;
use pesa_accounts::AccountFilter;
use pesa_accounts::AccountId;
use pesa_accounts::AccountKind;
use pesa_accounts::AccountPurpose;
use pesa_accounts::AccountStore;
use pesa_accounts::AccountsError;
use pesa_accounts::AccountsResult;
use pesa_accounts::Balance;
use pesa_accounts::BalanceStore;
use pesa_accounts::NewAccount;
use pesa_protocol::DrCr;
use pesa_protocol::OwnerType;
use tokio::sync::Mutex;

use crate::BalanceGuard;
use crate::CommittedJournal;
use crate::Journal;
use crate::JournalDraft;
use crate::JournalId;
use crate::JournalStore;
use crate::LedgerEntry;
use crate::LedgerError;
use crate::LedgerResult;
use crate::PeriodQuery;
use crate::TransactionFee;

type IdentityTuple = (OwnerType, String, String, AccountPurpose, AccountKind);

/// In-memory database backing the account, balance, and journal store
/// contracts together. One mutex guards the whole state, standing in
/// for the row locks and transaction scope a SQL backend provides, so
/// a commit is atomic by construction. Callers still pass balance
/// guards sorted by account id; a real backend relies on that ordering
/// to avoid lock cycles.
#[derive(Default)]
pub struct InMemoryLedger {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    account_seq: i64,
    journal_seq: i64,
    entry_seq: i64,
    fee_seq: i64,
    accounts: HashMap<AccountId, Account>,
    numbers: HashMap<String, AccountId>,
    identities: HashSet<IdentityTuple>,
    balances: HashMap<AccountId, Balance>,
    journals: HashMap<JournalId, Journal>,
    by_idempotency: HashMap<String, JournalId>,
    by_external: HashMap<String, JournalId>,
    entries: Vec<LedgerEntry>,
    fees: Vec<TransactionFee>,
}

impl InMemoryLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets an account's balance directly, bypassing the journal. Used
    /// to bootstrap system liquidity pools and test fixtures; regular
    /// balance movement goes through [`JournalStore::commit`].
    pub async fn seed_balance(&self, account_id: AccountId, amount_minor: i64) -> LedgerResult<()> {
        let mut state = self.state.lock().await;
        let balance = state
            .balances
            .get_mut(&account_id)
            .ok_or_else(|| LedgerError::NotFound(format!("balance for account {account_id}")))?;
        balance.available_minor = amount_minor;
        balance.total_minor = amount_minor;
        balance.updated_at = Utc::now();
        Ok(())
    }

    fn identity_of(account: &NewAccount) -> IdentityTuple {
        (
            account.owner_type,
            account.owner_id.clone(),
            account.currency.clone(),
            account.purpose,
            account.kind,
        )
    }
}

#[async_trait]
impl AccountStore for InMemoryLedger {
    async fn open(&self, account: NewAccount) -> AccountsResult<Account> {
        account.validate()?;

        let mut state = self.state.lock().await;
        // The uniqueness tuple binds non-system accounts only; the
        // platform may hold several system accounts per currency.
        if account.owner_type != OwnerType::System {
            let identity = Self::identity_of(&account);
            if state.identities.contains(&identity) {
                return Err(AccountsError::Duplicate(format!(
                    "account already exists for {}/{}/{}/{}/{}",
                    identity.0.as_str(),
                    identity.1,
                    identity.2,
                    identity.3.as_str(),
                    identity.4.as_str()
                )));
            }
            state.identities.insert(identity);
        }

        state.account_seq += 1;
        let id = state.account_seq;
        let number = format!("ACC-{id:08}");
        let now = Utc::now();
        let opened = Account {
            id,
            account_number: number.clone(),
            owner_type: account.owner_type,
            owner_id: account.owner_id,
            currency: account.currency,
            purpose: account.purpose,
            kind: account.kind,
            is_active: true,
            is_locked: false,
            overdraft_limit_minor: account.overdraft_limit_minor,
            parent_agent_id: account.parent_agent_id,
            commission_rate_bps: account.commission_rate_bps,
            created_at: now,
            updated_at: now,
        };

        state.numbers.insert(number, id);
        state.balances.insert(
            id,
            Balance {
                account_id: id,
                available_minor: 0,
                total_minor: 0,
                updated_at: now,
            },
        );
        state.accounts.insert(id, opened.clone());
        Ok(opened)
    }

    async fn account(&self, id: AccountId) -> AccountsResult<Option<Account>> {
        let state = self.state.lock().await;
        Ok(state.accounts.get(&id).cloned())
    }

    async fn account_by_number(&self, number: &str) -> AccountsResult<Option<Account>> {
        let state = self.state.lock().await;
        Ok(state
            .numbers
            .get(number)
            .and_then(|id| state.accounts.get(id))
            .cloned())
    }

    async fn accounts_for_owner(
        &self,
        owner_type: OwnerType,
        owner_id: &str,
        kind: Option<AccountKind>,
    ) -> AccountsResult<Vec<Account>> {
        let filter = AccountFilter {
            owner_type: Some(owner_type),
            owner_id: Some(owner_id.to_string()),
            kind,
            ..AccountFilter::default()
        };
        self.find(filter).await
    }

    async fn find(&self, filter: AccountFilter) -> AccountsResult<Vec<Account>> {
        let state = self.state.lock().await;
        let mut matches: Vec<Account> = state
            .accounts
            .values()
            .filter(|account| filter.matches(account))
            .cloned()
            .collect();
        matches.sort_by_key(|account| account.id);
        Ok(matches)
    }

    async fn set_locked(&self, id: AccountId, locked: bool) -> AccountsResult<Account> {
        let mut state = self.state.lock().await;
        let account = state
            .accounts
            .get_mut(&id)
            .ok_or_else(|| AccountsError::NotFound(format!("account {id}")))?;
        account.is_locked = locked;
        account.updated_at = Utc::now();
        Ok(account.clone())
    }

    async fn set_active(&self, id: AccountId, active: bool) -> AccountsResult<Account> {
        let mut state = self.state.lock().await;
        let account = state
            .accounts
            .get_mut(&id)
            .ok_or_else(|| AccountsError::NotFound(format!("account {id}")))?;
        account.is_active = active;
        account.updated_at = Utc::now();
        Ok(account.clone())
    }
}

#[async_trait]
impl BalanceStore for InMemoryLedger {
    async fn balance(&self, account_id: AccountId) -> AccountsResult<Option<Balance>> {
        let state = self.state.lock().await;
        Ok(state.balances.get(&account_id).copied())
    }

    async fn balance_by_number(&self, number: &str) -> AccountsResult<Option<Balance>> {
        let state = self.state.lock().await;
        Ok(state
            .numbers
            .get(number)
            .and_then(|id| state.balances.get(id))
            .copied())
    }
}

#[async_trait]
impl JournalStore for InMemoryLedger {
    async fn commit(
        &self,
        draft: JournalDraft,
        guards: Vec<BalanceGuard>,
    ) -> LedgerResult<CommittedJournal> {
        draft.validate()?;

        let mut state = self.state.lock().await;

        if state
            .by_idempotency
            .contains_key(&draft.journal.idempotency_key)
        {
            return Err(LedgerError::DuplicateIdempotencyKey(
                draft.journal.idempotency_key,
            ));
        }
        if let Some(reference) = &draft.journal.external_reference
            && state.by_external.contains_key(reference)
        {
            return Err(LedgerError::Conflict(format!(
                "external reference {reference} already committed"
            )));
        }

        for entry in &draft.entries {
            if !state.accounts.contains_key(&entry.account_id) {
                return Err(LedgerError::NotFound(format!(
                    "account {}",
                    entry.account_id
                )));
            }
        }

        // Re-check admissibility under the lock; pre-validation ran on
        // a stale read and a concurrent commit may have drained the
        // account since.
        for guard in &guards {
            let balance = state
                .balances
                .get(&guard.account_id)
                .ok_or_else(|| {
                    LedgerError::NotFound(format!("balance for account {}", guard.account_id))
                })?;
            if !balance.can_debit(guard.debit_total_minor, guard.floor_minor) {
                return Err(LedgerError::InsufficientFunds {
                    account_id: guard.account_id,
                    available_minor: balance.available_minor,
                    requested_minor: guard.debit_total_minor,
                });
            }
        }

        state.journal_seq += 1;
        let journal_id = state.journal_seq;
        let now = Utc::now();
        let journal = Journal {
            id: journal_id,
            idempotency_key: draft.journal.idempotency_key.clone(),
            external_reference: draft.journal.external_reference.clone(),
            transaction_type: draft.journal.transaction_type,
            scope: draft.journal.scope,
            created_by: draft.journal.created_by.clone(),
            creator_type: draft.journal.creator_type,
            created_at: now,
        };

        let mut committed_entries = Vec::with_capacity(draft.entries.len());
        for entry in draft.entries {
            let balance = state
                .balances
                .get_mut(&entry.account_id)
                .ok_or_else(|| {
                    LedgerError::Storage(format!("balance row vanished for {}", entry.account_id))
                })?;
            let delta = match entry.dr_cr {
                DrCr::Dr => -entry.amount_minor,
                DrCr::Cr => entry.amount_minor,
            };
            balance.available_minor += delta;
            balance.total_minor += delta;
            balance.updated_at = now;
            let balance_after = balance.available_minor;

            state.entry_seq += 1;
            committed_entries.push(LedgerEntry {
                id: state.entry_seq,
                journal_id,
                account_id: entry.account_id,
                dr_cr: entry.dr_cr,
                amount_minor: entry.amount_minor,
                currency: entry.currency,
                balance_after_minor: Some(balance_after),
                receipt_code: entry.receipt_code,
                metadata: entry.metadata,
                created_at: now,
            });
        }

        let mut committed_fees = Vec::with_capacity(draft.fees.len());
        for fee in draft.fees {
            state.fee_seq += 1;
            committed_fees.push(TransactionFee {
                id: state.fee_seq,
                journal_id,
                receipt_code: fee.receipt_code,
                fee_rule_id: fee.fee_rule_id,
                fee_type: fee.fee_type,
                amount_minor: fee.amount_minor,
                currency: fee.currency,
                agent_id: fee.agent_id,
            });
        }

        state
            .by_idempotency
            .insert(journal.idempotency_key.clone(), journal_id);
        if let Some(reference) = &journal.external_reference {
            state.by_external.insert(reference.clone(), journal_id);
        }
        state.journals.insert(journal_id, journal.clone());
        state.entries.extend(committed_entries.iter().cloned());
        state.fees.extend(committed_fees.iter().cloned());

        Ok(CommittedJournal {
            journal,
            entries: committed_entries,
            fees: committed_fees,
        })
    }

    async fn journal(&self, id: JournalId) -> LedgerResult<Option<Journal>> {
        let state = self.state.lock().await;
        Ok(state.journals.get(&id).cloned())
    }

    async fn journal_by_external_reference(
        &self,
        reference: &str,
    ) -> LedgerResult<Option<Journal>> {
        let state = self.state.lock().await;
        Ok(state
            .by_external
            .get(reference)
            .and_then(|id| state.journals.get(id))
            .cloned())
    }

    async fn journal_by_idempotency_key(&self, key: &str) -> LedgerResult<Option<Journal>> {
        let state = self.state.lock().await;
        Ok(state
            .by_idempotency
            .get(key)
            .and_then(|id| state.journals.get(id))
            .cloned())
    }

    async fn entries_for_journal(&self, journal_id: JournalId) -> LedgerResult<Vec<LedgerEntry>> {
        let state = self.state.lock().await;
        Ok(state
            .entries
            .iter()
            .filter(|entry| entry.journal_id == journal_id)
            .cloned()
            .collect())
    }

    async fn entries_for_account(
        &self,
        account_id: AccountId,
        period: PeriodQuery,
    ) -> LedgerResult<Vec<LedgerEntry>> {
        let state = self.state.lock().await;
        Ok(state
            .entries
            .iter()
            .filter(|entry| entry.account_id == account_id && period.contains(entry.created_at))
            .cloned()
            .collect())
    }

    async fn journals_for_creator(
        &self,
        created_by: &str,
        limit: Option<usize>,
    ) -> LedgerResult<Vec<Journal>> {
        let state = self.state.lock().await;
        let mut journals: Vec<Journal> = state
            .journals
            .values()
            .filter(|journal| journal.created_by == created_by)
            .cloned()
            .collect();
        journals.sort_by_key(|journal| std::cmp::Reverse(journal.id));
        if let Some(limit) = limit
            && journals.len() > limit
        {
            journals.truncate(limit);
        }
        Ok(journals)
    }

    async fn fees_for_receipt(&self, receipt_code: &str) -> LedgerResult<Vec<TransactionFee>> {
        let state = self.state.lock().await;
        Ok(state
            .fees
            .iter()
            .filter(|fee| fee.receipt_code == receipt_code)
            .cloned()
            .collect())
    }
}
