use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use pesa_accounts::Account;
use pesa_accounts::AccountFilter;
use pesa_accounts::AccountId;
use pesa_accounts::AccountPurpose;
use pesa_accounts::AccountStore;
use pesa_accounts::BalanceStore;
use pesa_agents::AgentStore;
use pesa_cache::SharedStore;
use pesa_cache::keys;
use pesa_cache::ttl;
use pesa_events::EventBus;
use pesa_fees::FeeContext;
use pesa_fees::FeeEngine;
use pesa_ledger::BalanceGuard;
use pesa_ledger::CommittedJournal;
use pesa_ledger::FeeType;
use pesa_ledger::JournalDraft;
use pesa_ledger::JournalStore;
use pesa_ledger::LedgerError;
use pesa_ledger::NewJournal;
use pesa_ledger::NewLedgerEntry;
use pesa_ledger::NewTransactionFee;
use pesa_notify::Notification;
use pesa_notify::NotificationBatcher;
use pesa_protocol::AccountNumber;
use pesa_protocol::AccountScope;
use pesa_protocol::CommissionRequest;
use pesa_protocol::ConversionRequest;
use pesa_protocol::CreditRequest;
use pesa_protocol::DebitRequest;
use pesa_protocol::DrCr;
use pesa_protocol::EntryRequest;
use pesa_protocol::EventEnvelope;
use pesa_protocol::ExternalId;
use pesa_protocol::OwnerType;
use pesa_protocol::ReceiptCode;
use pesa_protocol::TradeRequest;
use pesa_protocol::TransactionRequest;
use pesa_protocol::TransactionResult;
use pesa_protocol::TransactionStatus;
use pesa_protocol::TransactionType;
use pesa_protocol::TransferRequest;
use pesa_receipts::NewReceipt;
use pesa_receipts::ReceiptAllocator;
use pesa_receipts::ReceiptClient;
use pesa_receipts::ReceiptParty;
use pesa_receipts::ReceiptUpdate;
use pesa_receipts::ReceiptsError;
use pesa_status::StatusTracker;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::warn;
use uuid::Uuid;

use crate::EngineConfig;
use crate::EngineError;
use crate::EngineMetrics;
use crate::EngineResult;
use crate::FxRateProvider;

const PARENT_RECEIPT_KEY: &str = "parent_receipt_code";

/// Everything the engine is composed from. All collaborators are
/// injected; the engine never reaches for ambient singletons.
pub struct EngineServices {
    pub accounts: Arc<dyn AccountStore>,
    pub balances: Arc<dyn BalanceStore>,
    pub journals: Arc<dyn JournalStore>,
    pub fee_engine: FeeEngine,
    pub agents: Arc<dyn AgentStore>,
    pub allocator: Arc<ReceiptAllocator>,
    pub receipt_client: Arc<dyn ReceiptClient>,
    pub tracker: Arc<StatusTracker>,
    pub notifier: Arc<NotificationBatcher>,
    pub events: Arc<dyn EventBus>,
    pub cache: Arc<dyn SharedStore>,
    pub fx: Arc<dyn FxRateProvider>,
}

struct Task {
    request: TransactionRequest,
    receipt_code: Option<ReceiptCode>,
    accepted_at: Instant,
}

enum Prevalidated {
    /// The idempotency key matched an earlier transaction.
    Replay(TransactionResult),
    Checked(HashMap<AccountNumber, Account>),
}

enum CommitOutcome {
    Committed(CommittedJournal),
    Replayed(TransactionResult),
}

struct CommitPlan {
    entries: Vec<NewLedgerEntry>,
    fees: Vec<NewTransactionFee>,
}

pub struct TransactionEngine {
    services: EngineServices,
    config: EngineConfig,
    metrics: EngineMetrics,
    queue_tx: async_channel::Sender<Task>,
    queue_rx: async_channel::Receiver<Task>,
    cancel: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TransactionEngine {
    #[must_use]
    pub fn new(services: EngineServices, config: EngineConfig) -> Arc<Self> {
        let (queue_tx, queue_rx) = async_channel::bounded(config.queue_capacity);
        Arc::new(Self {
            services,
            config,
            metrics: EngineMetrics::new(),
            queue_tx,
            queue_rx,
            cancel: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
        })
    }

    #[must_use]
    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    /// Spawns the fixed worker pool consuming the task queue.
    pub async fn start(self: &Arc<Self>) {
        let mut workers = self.workers.lock().await;
        if !workers.is_empty() {
            return;
        }
        for _ in 0..self.config.workers {
            let engine = Arc::clone(self);
            let queue = self.queue_rx.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = engine.cancel.cancelled() => break,
                        received = queue.recv() => match received {
                            Ok(task) => engine.run_task(task).await,
                            Err(_) => break,
                        },
                    }
                }
            }));
        }
    }

    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.queue_tx.close();
        let workers: Vec<JoinHandle<()>> = {
            let mut guard = self.workers.lock().await;
            guard.drain(..).collect()
        };
        for worker in workers {
            let _ = worker.await;
        }
    }

    /// Asynchronous execution: validates, allocates a receipt, hands
    /// the durable work to the worker pool, and returns immediately
    /// with status `processing`.
    pub async fn execute(
        self: &Arc<Self>,
        request: TransactionRequest,
    ) -> EngineResult<TransactionResult> {
        let accepted_at = Instant::now();
        self.metrics.record_submitted();
        let mut request = with_idempotency_key(request);

        let accounts = match self.prevalidate(&request).await? {
            Prevalidated::Replay(result) => {
                self.metrics.record_replayed();
                return Ok(result);
            }
            Prevalidated::Checked(accounts) => accounts,
        };

        let receipt_code = self.allocate_receipt(&request, &accounts).await?;
        self.adopt_receipt(&mut request, receipt_code.as_deref()).await;

        let result = self.pending_result(&request, receipt_code.clone(), accepted_at);
        let task = Task {
            request,
            receipt_code,
            accepted_at,
        };
        match self.queue_tx.try_send(task) {
            Ok(()) => Ok(result),
            Err(async_channel::TrySendError::Full(task)) => {
                self.metrics.record_dropped();
                error!(
                    receipt_code = task.receipt_code.as_deref().unwrap_or("-"),
                    "processor queue full; dropping transaction"
                );
                if let Some(code) = &task.receipt_code {
                    self.services
                        .tracker
                        .update(
                            code.clone(),
                            TransactionStatus::Failed,
                            None,
                            Some(EngineError::QueueFull.to_string()),
                        )
                        .await;
                    let mut update = ReceiptUpdate::status(code.clone(), TransactionStatus::Failed);
                    update.failure_reason = Some(EngineError::QueueFull.to_string());
                    self.services.allocator.enqueue_update(update).await;
                }
                Err(EngineError::QueueFull)
            }
            Err(async_channel::TrySendError::Closed(_)) => {
                Err(EngineError::Internal("worker pool is not running".into()))
            }
        }
    }

    /// Synchronous execution: identical up to receipt allocation, then
    /// commits inline and returns the final status.
    pub async fn execute_sync(
        self: &Arc<Self>,
        request: TransactionRequest,
    ) -> EngineResult<TransactionResult> {
        let accepted_at = Instant::now();
        self.metrics.record_submitted();
        let mut request = with_idempotency_key(request);

        let accounts = match self.prevalidate(&request).await? {
            Prevalidated::Replay(result) => {
                self.metrics.record_replayed();
                return Ok(result);
            }
            Prevalidated::Checked(accounts) => accounts,
        };

        let receipt_code = self.allocate_receipt(&request, &accounts).await?;
        self.adopt_receipt(&mut request, receipt_code.as_deref()).await;

        self.settle(request, receipt_code, accepted_at).await
    }

    /// Credits an account from the system liquidity pool (deposit).
    pub async fn credit(
        self: &Arc<Self>,
        request: CreditRequest,
    ) -> EngineResult<TransactionResult> {
        let liquidity = self
            .system_account(AccountPurpose::Liquidity, &request.currency, request.scope)
            .await?;
        let mut canonical = TransactionRequest::new(
            TransactionType::Deposit,
            request.scope,
            request.created_by,
            request.creator_type,
        );
        canonical.idempotency_key = request.idempotency_key;
        canonical.is_system_transaction = request.is_system_transaction;
        canonical.description = request.description;
        canonical.agent_id = request.agent_id;
        canonical.entries = vec![
            EntryRequest::new(
                liquidity.account_number,
                request.amount_minor,
                DrCr::Dr,
                request.currency.clone(),
            ),
            EntryRequest::new(
                request.account_number,
                request.amount_minor,
                DrCr::Cr,
                request.currency,
            ),
        ];
        self.execute_sync(canonical).await
    }

    /// Debits an account into the system liquidity pool (withdrawal).
    pub async fn debit(self: &Arc<Self>, request: DebitRequest) -> EngineResult<TransactionResult> {
        let liquidity = self
            .system_account(AccountPurpose::Liquidity, &request.currency, request.scope)
            .await?;
        let mut canonical = TransactionRequest::new(
            TransactionType::Withdrawal,
            request.scope,
            request.created_by,
            request.creator_type,
        );
        canonical.idempotency_key = request.idempotency_key;
        canonical.is_system_transaction = request.is_system_transaction;
        canonical.description = request.description;
        canonical.entries = vec![
            EntryRequest::new(
                request.account_number,
                request.amount_minor,
                DrCr::Dr,
                request.currency.clone(),
            ),
            EntryRequest::new(
                liquidity.account_number,
                request.amount_minor,
                DrCr::Cr,
                request.currency,
            ),
        ];
        self.execute_sync(canonical).await
    }

    pub async fn transfer(
        self: &Arc<Self>,
        request: TransferRequest,
    ) -> EngineResult<TransactionResult> {
        let mut canonical = TransactionRequest::new(
            TransactionType::Transfer,
            request.scope,
            request.created_by,
            request.creator_type,
        );
        canonical.idempotency_key = request.idempotency_key;
        canonical.description = request.description;
        canonical.agent_id = request.agent_id;
        canonical.entries = vec![
            EntryRequest::new(
                request.from_account,
                request.amount_minor,
                DrCr::Dr,
                request.currency.clone(),
            ),
            EntryRequest::new(
                request.to_account,
                request.amount_minor,
                DrCr::Cr,
                request.currency,
            ),
        ];
        self.execute_sync(canonical).await
    }

    /// Cross-currency conversion. The target credit is a placeholder
    /// until commit computes `(amount - fee) * rate` under the lock.
    pub async fn convert_and_transfer(
        self: &Arc<Self>,
        request: ConversionRequest,
    ) -> EngineResult<TransactionResult> {
        if request.source_currency == request.target_currency {
            return Err(EngineError::InvalidRequest(
                "conversion requires distinct source and target currencies".into(),
            ));
        }
        let mut canonical = TransactionRequest::new(
            TransactionType::Conversion,
            request.scope,
            request.created_by,
            request.creator_type,
        );
        canonical.idempotency_key = request.idempotency_key;
        canonical.description = request.description;
        canonical.entries = vec![
            EntryRequest::new(
                request.from_account,
                request.amount_minor,
                DrCr::Dr,
                request.source_currency,
            ),
            EntryRequest::new(
                request.to_account,
                request.amount_minor,
                DrCr::Cr,
                request.target_currency,
            ),
        ];
        self.execute_sync(canonical).await
    }

    /// Settles a winning trade: liquidity pays the trader.
    pub async fn process_trade_win(
        self: &Arc<Self>,
        request: TradeRequest,
    ) -> EngineResult<TransactionResult> {
        self.trade(request, true).await
    }

    /// Settles a losing trade: the trader pays liquidity.
    pub async fn process_trade_loss(
        self: &Arc<Self>,
        request: TradeRequest,
    ) -> EngineResult<TransactionResult> {
        self.trade(request, false).await
    }

    async fn trade(
        self: &Arc<Self>,
        request: TradeRequest,
        win: bool,
    ) -> EngineResult<TransactionResult> {
        let liquidity = self
            .system_account(AccountPurpose::Liquidity, &request.currency, request.scope)
            .await?;
        let mut canonical = TransactionRequest::new(
            TransactionType::Trade,
            request.scope,
            request.created_by,
            request.creator_type,
        );
        canonical.idempotency_key = request.idempotency_key;
        canonical.is_system_transaction = true;
        canonical.metadata = serde_json::json!({ "trade_reference": request.trade_reference });
        let (debit_account, credit_account) = if win {
            (liquidity.account_number, request.account_number)
        } else {
            (request.account_number, liquidity.account_number)
        };
        canonical.entries = vec![
            EntryRequest::new(
                debit_account,
                request.amount_minor,
                DrCr::Dr,
                request.currency.clone(),
            ),
            EntryRequest::new(
                credit_account,
                request.amount_minor,
                DrCr::Cr,
                request.currency,
            ),
        ];
        self.execute_sync(canonical).await
    }

    /// Pays an agent its commission from the system fees account.
    pub async fn process_agent_commission(
        self: &Arc<Self>,
        request: CommissionRequest,
    ) -> EngineResult<TransactionResult> {
        let agent = self
            .services
            .agents
            .agent(&request.agent_id)
            .await
            .map_err(|err| EngineError::Internal(err.to_string()))?
            .ok_or_else(|| EngineError::NotFound(format!("agent {}", request.agent_id)))?;
        if agent.commission_rate_for(TransactionType::Commission).is_none() {
            return Err(EngineError::InvalidRequest(format!(
                "agent {} is not active",
                agent.id
            )));
        }
        let fees_account = self
            .system_account(AccountPurpose::Fees, &request.currency, AccountScope::Real)
            .await?;
        let commission_account = self
            .agent_commission_account(&request.agent_id, &request.currency)
            .await?;

        let mut canonical = TransactionRequest::new(
            TransactionType::Commission,
            AccountScope::Real,
            request.created_by,
            request.creator_type,
        );
        canonical.idempotency_key = request.idempotency_key;
        canonical.agent_id = Some(request.agent_id);
        if let Some(source) = request.source_receipt_code {
            canonical.metadata = serde_json::json!({ "source_receipt_code": source });
        }
        canonical.entries = vec![
            EntryRequest::new(
                fees_account.account_number,
                request.amount_minor,
                DrCr::Dr,
                request.currency.clone(),
            ),
            EntryRequest::new(
                commission_account.account_number,
                request.amount_minor,
                DrCr::Cr,
                request.currency,
            ),
        ];
        self.execute_sync(canonical).await
    }

    /// Reverses a committed transaction by mirroring its postings.
    /// Both provenance links are written and verified: the reversal
    /// receipt carries `parent_receipt_code`, the original gains
    /// `reversal_receipt_code`.
    pub async fn reverse(
        self: &Arc<Self>,
        original_code: &str,
        created_by: impl Into<ExternalId>,
        creator_type: OwnerType,
    ) -> EngineResult<TransactionResult> {
        let journal = self
            .services
            .journals
            .journal_by_external_reference(original_code)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("journal for receipt {original_code}")))?;
        let original = self
            .services
            .receipt_client
            .receipt(original_code)
            .await
            .map_err(|err| EngineError::External(err.to_string()))?
            .ok_or_else(|| EngineError::NotFound(format!("receipt {original_code}")))?;
        if original.reversal_receipt_code.is_some() {
            return Err(EngineError::InvalidRequest(format!(
                "receipt {original_code} is already reversed"
            )));
        }
        if original.status != TransactionStatus::Completed {
            return Err(EngineError::InvalidRequest(
                "only completed receipts can be reversed".into(),
            ));
        }

        let entries = self.services.journals.entries_for_journal(journal.id).await?;
        let mut request = TransactionRequest::new(
            TransactionType::Reversal,
            journal.scope,
            created_by,
            creator_type,
        );
        // Mirroring the original postings includes its fee legs, so the
        // reversal restores every balance without re-evaluating rules.
        request.is_system_transaction = true;
        request.metadata = serde_json::json!({ PARENT_RECEIPT_KEY: original_code });
        for entry in entries {
            let account = self
                .services
                .accounts
                .account(entry.account_id)
                .await?
                .ok_or_else(|| EngineError::NotFound(format!("account {}", entry.account_id)))?;
            request.entries.push(EntryRequest::new(
                account.account_number,
                entry.amount_minor,
                entry.dr_cr.opposite(),
                entry.currency,
            ));
        }

        let result = self.execute_sync(request).await?;

        if let Some(new_code) = &result.receipt_code {
            let mut link = ReceiptUpdate::status(original_code, TransactionStatus::Reversed);
            link.reversal_receipt_code = Some(new_code.clone());
            link.reversed_at = Some(Utc::now());
            self.services
                .receipt_client
                .update_batch(vec![link])
                .await
                .map_err(|err| EngineError::External(err.to_string()))?;
            self.services
                .tracker
                .update(
                    original_code.to_string(),
                    TransactionStatus::Reversed,
                    Some(journal.id),
                    None,
                )
                .await;
            self.verify_reversal_links(original_code, new_code).await?;
        }
        Ok(result)
    }

    /// Both reversal links must agree; neither is inferred from the
    /// other silently.
    async fn verify_reversal_links(
        &self,
        original_code: &str,
        reversal_code: &str,
    ) -> EngineResult<()> {
        let original = self
            .services
            .receipt_client
            .receipt(original_code)
            .await
            .map_err(|err| EngineError::External(err.to_string()))?
            .ok_or_else(|| EngineError::NotFound(format!("receipt {original_code}")))?;
        let reversal = self
            .services
            .receipt_client
            .receipt(reversal_code)
            .await
            .map_err(|err| EngineError::External(err.to_string()))?
            .ok_or_else(|| EngineError::NotFound(format!("receipt {reversal_code}")))?;

        let forward = original.reversal_receipt_code.as_deref() == Some(reversal_code);
        let backward = reversal.parent_receipt_code.as_deref() == Some(original_code);
        if forward && backward {
            Ok(())
        } else {
            Err(EngineError::Internal(format!(
                "reversal links diverged between {original_code} and {reversal_code}"
            )))
        }
    }

    async fn run_task(self: &Arc<Self>, task: Task) {
        let Task {
            request,
            receipt_code,
            accepted_at,
        } = task;
        let settled = tokio::time::timeout(
            self.config.task_timeout,
            self.settle(request, receipt_code.clone(), accepted_at),
        )
        .await;
        match settled {
            // Success and failure bookkeeping both happen inside
            // `settle`; the asynchronous caller is long gone.
            Ok(_) => {}
            Err(_) => {
                self.metrics.record_failed();
                warn!(
                    receipt_code = receipt_code.as_deref().unwrap_or("-"),
                    "transaction exceeded the worker deadline"
                );
                self.finalize_failure(receipt_code, "commit deadline exceeded".into());
            }
        }
    }

    async fn settle(
        self: &Arc<Self>,
        request: TransactionRequest,
        receipt_code: Option<ReceiptCode>,
        accepted_at: Instant,
    ) -> EngineResult<TransactionResult> {
        match self.commit_transaction(&request, receipt_code.as_deref()).await {
            Ok(CommitOutcome::Committed(committed)) => {
                self.metrics.record_processed();
                let (amount_minor, currency) = canonical_of(&request);
                let result = TransactionResult {
                    receipt_code: receipt_code.clone(),
                    transaction_id: Some(committed.journal.id),
                    status: TransactionStatus::Completed,
                    amount_minor,
                    currency,
                    processing_time_ms: accepted_at.elapsed().as_millis() as u64,
                    created_at: committed.journal.created_at,
                };
                if let Some(key) = &request.idempotency_key
                    && let Err(err) = pesa_cache::set_json(
                        self.services.cache.as_ref(),
                        &keys::idempotency(key),
                        &result,
                        Some(ttl::IDEMPOTENCY),
                    )
                    .await
                {
                    warn!(key = %key, error = %err, "failed to cache idempotent result");
                }
                self.finalize_success(receipt_code, committed);
                Ok(result)
            }
            Ok(CommitOutcome::Replayed(result)) => {
                self.metrics.record_replayed();
                // A concurrent commit with the same key won the race;
                // the receipt allocated here never gained a journal.
                if let Some(code) = &receipt_code
                    && result.receipt_code.as_deref() != Some(code.as_str())
                {
                    let mut update = ReceiptUpdate::status(code.clone(), TransactionStatus::Failed);
                    update.failure_reason = Some("superseded by idempotent replay".into());
                    self.services.allocator.enqueue_update(update).await;
                    self.services
                        .tracker
                        .update(
                            code.clone(),
                            TransactionStatus::Failed,
                            None,
                            Some("superseded by idempotent replay".into()),
                        )
                        .await;
                }
                Ok(result)
            }
            Err(err) => {
                self.metrics.record_failed();
                self.finalize_failure(receipt_code, err.to_string());
                Err(err)
            }
        }
    }

    async fn commit_transaction(
        &self,
        request: &TransactionRequest,
        receipt_code: Option<&str>,
    ) -> EngineResult<CommitOutcome> {
        let mut attempted_retry = false;
        loop {
            // Fresh resolution inside the commit attempt: accounts may
            // have been locked or deactivated since pre-validation.
            let accounts = self.resolve_fresh(request).await?;
            let plan = self.plan(request, &accounts, receipt_code).await?;

            let idempotency_key = request
                .idempotency_key
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string());
            let draft = JournalDraft {
                journal: NewJournal {
                    idempotency_key,
                    external_reference: receipt_code.map(str::to_string),
                    transaction_type: request.transaction_type,
                    scope: request.scope,
                    created_by: request.created_by.clone(),
                    creator_type: request.creator_type,
                },
                entries: plan.entries,
                fees: plan.fees,
            };
            let guards = self.guards_for(&draft).await?;

            match self.services.journals.commit(draft, guards).await {
                Ok(committed) => return Ok(CommitOutcome::Committed(committed)),
                Err(LedgerError::DuplicateIdempotencyKey(key)) => {
                    return match self.idempotent_replay(&key).await? {
                        Some(result) => Ok(CommitOutcome::Replayed(result)),
                        None => Err(EngineError::Internal(format!(
                            "idempotency key {key} is committed but unreadable"
                        ))),
                    };
                }
                Err(LedgerError::InsufficientFunds {
                    account_id,
                    available_minor,
                    requested_minor,
                }) => {
                    let account_number = self
                        .services
                        .accounts
                        .account(account_id)
                        .await
                        .ok()
                        .flatten()
                        .map(|account| account.account_number)
                        .unwrap_or_else(|| format!("account-id:{account_id}"));
                    return Err(EngineError::InsufficientFunds {
                        account_number,
                        available_minor,
                        requested_minor,
                    });
                }
                Err(LedgerError::Conflict(message)) if !attempted_retry => {
                    attempted_retry = true;
                    self.metrics.record_commit_retry();
                    warn!(reason = %message, "commit conflict; retrying once with fresh locks");
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn prevalidate(&self, request: &TransactionRequest) -> EngineResult<Prevalidated> {
        request
            .validate()
            .map_err(|err| EngineError::InvalidRequest(err.to_string()))?;
        if request.transaction_type == TransactionType::Conversion {
            validate_conversion_shape(request)?;
        }

        if let Some(key) = &request.idempotency_key
            && let Some(result) = self.idempotent_replay(key).await?
        {
            return Ok(Prevalidated::Replay(result));
        }

        let mut accounts: HashMap<AccountNumber, Account> = HashMap::new();
        for entry in &request.entries {
            let account = match accounts.get(&entry.account_number) {
                Some(account) => account.clone(),
                None => {
                    let account = self.resolve_account_cached(&entry.account_number).await?;
                    accounts.insert(entry.account_number.clone(), account.clone());
                    account
                }
            };
            check_entry(&account, entry, request)?;

            if entry.dr_cr == DrCr::Dr {
                let balance = self
                    .services
                    .balances
                    .balance(account.id)
                    .await?
                    .ok_or_else(|| {
                        EngineError::Internal(format!(
                            "balance row missing for {}",
                            account.account_number
                        ))
                    })?;
                if balance.available_minor < entry.amount_minor {
                    return Err(EngineError::InsufficientFunds {
                        account_number: account.account_number.clone(),
                        available_minor: balance.available_minor,
                        requested_minor: entry.amount_minor,
                    });
                }
            }
        }
        Ok(Prevalidated::Checked(accounts))
    }

    async fn idempotent_replay(&self, key: &str) -> EngineResult<Option<TransactionResult>> {
        let cache_key = keys::idempotency(key);
        match pesa_cache::get_json::<TransactionResult>(self.services.cache.as_ref(), &cache_key)
            .await
        {
            Ok(Some(result)) => return Ok(Some(result)),
            Ok(None) => {}
            Err(err) => {
                warn!(key, error = %err, "idempotency cache read failed; falling back to store");
            }
        }

        let Some(journal) = self.services.journals.journal_by_idempotency_key(key).await? else {
            return Ok(None);
        };
        let entries = self.services.journals.entries_for_journal(journal.id).await?;
        let canonical = entries
            .iter()
            .find(|entry| entry.dr_cr == DrCr::Dr)
            .or_else(|| entries.first());
        let (amount_minor, currency) = canonical
            .map(|entry| (entry.amount_minor, entry.currency.clone()))
            .unwrap_or((0, String::new()));
        let result = TransactionResult {
            receipt_code: journal.external_reference.clone(),
            transaction_id: Some(journal.id),
            status: TransactionStatus::Completed,
            amount_minor,
            currency,
            processing_time_ms: 0,
            created_at: journal.created_at,
        };
        if let Err(err) = pesa_cache::set_json(
            self.services.cache.as_ref(),
            &cache_key,
            &result,
            Some(ttl::IDEMPOTENCY),
        )
        .await
        {
            warn!(key, error = %err, "failed to cache replayed result");
        }
        Ok(Some(result))
    }

    async fn allocate_receipt(
        &self,
        request: &TransactionRequest,
        accounts: &HashMap<AccountNumber, Account>,
    ) -> EngineResult<Option<ReceiptCode>> {
        if !request.generate_receipt {
            return Ok(None);
        }
        let receipt = self.build_receipt(request, accounts).await?;
        match self.services.allocator.allocate(receipt).await {
            Ok(code) => Ok(Some(code)),
            Err(ReceiptsError::Timeout) => Err(EngineError::ReceiptTimeout),
            Err(err) => Err(EngineError::External(err.to_string())),
        }
    }

    async fn build_receipt(
        &self,
        request: &TransactionRequest,
        accounts: &HashMap<AccountNumber, Account>,
    ) -> EngineResult<NewReceipt> {
        let (mut amount_minor, mut currency) = canonical_of(request);

        let party = |entry: &EntryRequest| -> Option<ReceiptParty> {
            accounts.get(&entry.account_number).map(|account| ReceiptParty {
                account_id: account.id,
                owner_type: account.owner_type,
                owner_id: account.owner_id.clone(),
                status: TransactionStatus::Pending,
                ledger_entry_id: None,
            })
        };
        let debitor = request
            .entries
            .iter()
            .find(|entry| entry.dr_cr == DrCr::Dr)
            .and_then(&party);
        let creditor = request
            .entries
            .iter()
            .find(|entry| entry.dr_cr == DrCr::Cr)
            .and_then(&party);

        let mut original_amount_minor = None;
        let mut original_currency = None;
        let mut exchange_rate = None;
        let mut transaction_cost_minor = 0;
        if request.transaction_type == TransactionType::Conversion {
            // Display preview only; the authoritative numbers are
            // computed at commit time under the lock.
            let source = request
                .entries
                .iter()
                .find(|entry| entry.dr_cr == DrCr::Dr)
                .ok_or_else(|| {
                    EngineError::InvalidRequest("conversion requires a debit entry".into())
                })?;
            let target = request
                .entries
                .iter()
                .find(|entry| entry.dr_cr == DrCr::Cr)
                .ok_or_else(|| {
                    EngineError::InvalidRequest("conversion requires a credit entry".into())
                })?;
            let rate = self
                .services
                .fx
                .rate(&source.currency, &target.currency)
                .await?;
            let fee_minor = if request.is_system_transaction || request.scope == AccountScope::Demo
            {
                0
            } else {
                self.conversion_fee(source, &target.currency).await?
            };
            original_amount_minor = Some(source.amount_minor);
            original_currency = Some(source.currency.clone());
            exchange_rate = Some(rate);
            transaction_cost_minor = fee_minor;
            amount_minor = converted_minor(source.amount_minor, fee_minor, rate)?;
            currency = target.currency.clone();
        }

        let parent_receipt_code = request
            .metadata
            .get(PARENT_RECEIPT_KEY)
            .and_then(serde_json::Value::as_str)
            .map(str::to_string);

        Ok(NewReceipt {
            transaction_type: request.transaction_type,
            amount_minor,
            currency,
            original_amount_minor,
            original_currency,
            exchange_rate,
            transaction_cost_minor,
            creditor,
            debitor,
            parent_receipt_code,
            metadata: request.metadata.clone(),
        })
    }

    async fn conversion_fee(&self, source: &EntryRequest, target_currency: &str) -> EngineResult<i64> {
        let calculations = self
            .services
            .fee_engine
            .evaluate(&FeeContext {
                transaction_type: TransactionType::Conversion,
                source_currency: source.currency.clone(),
                target_currency: Some(target_currency.to_string()),
                amount_minor: source.amount_minor,
            })
            .await
            .map_err(|err| EngineError::Internal(err.to_string()))?;
        Ok(calculations.iter().map(|calc| calc.amount_minor).sum())
    }

    async fn adopt_receipt(&self, request: &mut TransactionRequest, receipt_code: Option<&str>) {
        if let Some(code) = receipt_code {
            for entry in &mut request.entries {
                entry.receipt_code = Some(code.to_string());
            }
            self.services
                .tracker
                .track(code.to_string(), TransactionStatus::Processing)
                .await;
        }
    }

    async fn resolve_account_cached(&self, number: &str) -> EngineResult<Account> {
        let key = keys::account_number(number);
        match pesa_cache::get_json::<Account>(self.services.cache.as_ref(), &key).await {
            Ok(Some(account)) => return Ok(account),
            Ok(None) => {}
            Err(err) => {
                warn!(number, error = %err, "account cache read failed; falling back to store");
            }
        }
        let account = self
            .services
            .accounts
            .account_by_number(number)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("account {number}")))?;
        if let Err(err) = pesa_cache::set_json(
            self.services.cache.as_ref(),
            &key,
            &account,
            Some(ttl::ACCOUNT),
        )
        .await
        {
            warn!(number, error = %err, "failed to cache account");
        }
        Ok(account)
    }

    /// Store-fresh resolution used inside the commit attempt, with the
    /// lock/active re-checks pre-validation already ran on stale data.
    async fn resolve_fresh(
        &self,
        request: &TransactionRequest,
    ) -> EngineResult<HashMap<AccountNumber, Account>> {
        let mut accounts: HashMap<AccountNumber, Account> = HashMap::new();
        for entry in &request.entries {
            if accounts.contains_key(&entry.account_number) {
                continue;
            }
            let account = self
                .services
                .accounts
                .account_by_number(&entry.account_number)
                .await?
                .ok_or_else(|| {
                    EngineError::NotFound(format!("account {}", entry.account_number))
                })?;
            check_entry(&account, entry, request)?;
            accounts.insert(entry.account_number.clone(), account);
        }
        Ok(accounts)
    }

    async fn plan(
        &self,
        request: &TransactionRequest,
        accounts: &HashMap<AccountNumber, Account>,
        receipt_code: Option<&str>,
    ) -> EngineResult<CommitPlan> {
        if request.transaction_type == TransactionType::Conversion {
            self.plan_conversion(request, accounts, receipt_code).await
        } else {
            self.plan_standard(request, accounts, receipt_code).await
        }
    }

    async fn plan_standard(
        &self,
        request: &TransactionRequest,
        accounts: &HashMap<AccountNumber, Account>,
        receipt_code: Option<&str>,
    ) -> EngineResult<CommitPlan> {
        let mut purposes: HashMap<AccountId, AccountPurpose> = HashMap::new();
        let mut entries: Vec<NewLedgerEntry> = Vec::with_capacity(request.entries.len());
        for entry in &request.entries {
            let account = accounts.get(&entry.account_number).ok_or_else(|| {
                EngineError::Internal(format!("unresolved account {}", entry.account_number))
            })?;
            purposes.insert(account.id, account.purpose);
            entries.push(NewLedgerEntry {
                account_id: account.id,
                dr_cr: entry.dr_cr,
                amount_minor: entry.amount_minor,
                currency: entry.currency.clone(),
                receipt_code: entry
                    .receipt_code
                    .clone()
                    .or_else(|| receipt_code.map(str::to_string)),
                metadata: entry_metadata(entry),
            });
        }

        let mut fees: Vec<NewTransactionFee> = Vec::new();
        let fee_receipt = receipt_code.unwrap_or_default().to_string();
        let (canonical_amount, canonical_currency) = canonical_of(request);

        if request.transaction_type == TransactionType::Commission {
            if let Some(agent_id) = &request.agent_id {
                fees.push(NewTransactionFee {
                    receipt_code: fee_receipt,
                    fee_rule_id: 0,
                    fee_type: FeeType::AgentCommission,
                    amount_minor: canonical_amount,
                    currency: canonical_currency,
                    agent_id: Some(agent_id.clone()),
                });
            }
            return Ok(CommitPlan { entries, fees });
        }

        // Demo money collects no revenue: fee purposes cannot exist on
        // demo accounts, so demo-scope requests skip fee evaluation.
        if request.is_system_transaction || request.scope == AccountScope::Demo {
            return Ok(CommitPlan { entries, fees });
        }

        let calculations = self
            .services
            .fee_engine
            .evaluate(&FeeContext {
                transaction_type: request.transaction_type,
                source_currency: canonical_currency.clone(),
                target_currency: None,
                amount_minor: canonical_amount,
            })
            .await
            .map_err(|err| EngineError::Internal(err.to_string()))?;

        for calculation in calculations {
            // The fee comes out of the credited side: the recipient
            // receives amount - fee and the fee leg credits the system
            // fees account in the same currency.
            let candidate = entries
                .iter_mut()
                .filter(|entry| {
                    entry.dr_cr == DrCr::Cr
                        && entry.currency == calculation.currency
                        && purposes
                            .get(&entry.account_id)
                            .map(|purpose| !purpose.is_fee_purpose())
                            .unwrap_or(false)
                })
                .max_by_key(|entry| entry.amount_minor);
            let Some(leg) = candidate else {
                warn!(
                    currency = %calculation.currency,
                    "no credit leg available to charge the fee against; skipping"
                );
                continue;
            };
            if leg.amount_minor <= calculation.amount_minor {
                return Err(EngineError::InvalidRequest(format!(
                    "fee of {} consumes the whole {} leg",
                    calculation.amount_minor, calculation.currency
                )));
            }
            leg.amount_minor -= calculation.amount_minor;

            let fees_account = self
                .system_account(AccountPurpose::Fees, &calculation.currency, request.scope)
                .await?;
            entries.push(NewLedgerEntry {
                account_id: fees_account.id,
                dr_cr: DrCr::Cr,
                amount_minor: calculation.amount_minor,
                currency: calculation.currency.clone(),
                receipt_code: receipt_code.map(str::to_string),
                metadata: serde_json::Value::Null,
            });
            fees.push(NewTransactionFee {
                receipt_code: fee_receipt.clone(),
                fee_rule_id: calculation.rule_id,
                fee_type: calculation.fee_type,
                amount_minor: calculation.amount_minor,
                currency: calculation.currency,
                agent_id: None,
            });
        }

        if let Some(agent_id) = &request.agent_id {
            self.append_agent_commission(
                request,
                agent_id,
                canonical_amount,
                &canonical_currency,
                &fee_receipt,
                &mut entries,
                &mut fees,
            )
            .await?;
        }

        Ok(CommitPlan { entries, fees })
    }

    #[allow(clippy::too_many_arguments)]
    async fn append_agent_commission(
        &self,
        request: &TransactionRequest,
        agent_id: &str,
        canonical_amount: i64,
        currency: &str,
        fee_receipt: &str,
        entries: &mut Vec<NewLedgerEntry>,
        fees: &mut Vec<NewTransactionFee>,
    ) -> EngineResult<()> {
        let Some(agent) = self
            .services
            .agents
            .agent(agent_id)
            .await
            .map_err(|err| EngineError::Internal(err.to_string()))?
        else {
            warn!(agent_id, "unknown agent on request; skipping commission");
            return Ok(());
        };
        let Some(rate_bps) = agent.commission_rate_for(request.transaction_type) else {
            warn!(agent_id, "agent is not active; skipping commission");
            return Ok(());
        };
        let commission = canonical_amount * rate_bps / 10_000;
        if commission <= 0 {
            return Ok(());
        }
        let commission_account = match self.agent_commission_account(agent_id, currency).await {
            Ok(account) => account,
            Err(err) => {
                warn!(agent_id, currency, error = %err, "agent has no commission account; skipping");
                return Ok(());
            }
        };
        let fees_account = self
            .system_account(AccountPurpose::Fees, currency, request.scope)
            .await?;

        entries.push(NewLedgerEntry {
            account_id: fees_account.id,
            dr_cr: DrCr::Dr,
            amount_minor: commission,
            currency: currency.to_string(),
            receipt_code: None,
            metadata: serde_json::Value::Null,
        });
        entries.push(NewLedgerEntry {
            account_id: commission_account.id,
            dr_cr: DrCr::Cr,
            amount_minor: commission,
            currency: currency.to_string(),
            receipt_code: None,
            metadata: serde_json::Value::Null,
        });
        fees.push(NewTransactionFee {
            receipt_code: fee_receipt.to_string(),
            fee_rule_id: 0,
            fee_type: FeeType::AgentCommission,
            amount_minor: commission,
            currency: currency.to_string(),
            agent_id: Some(agent_id.to_string()),
        });
        Ok(())
    }

    /// Conversion plan: the source debit stands as requested; the
    /// source-side fee credits the profits account in the source
    /// currency; clearing legs against the per-currency liquidity
    /// pools keep each currency balanced; the target credit is
    /// `(amount - fee) * rate` rounded to minor units.
    async fn plan_conversion(
        &self,
        request: &TransactionRequest,
        accounts: &HashMap<AccountNumber, Account>,
        receipt_code: Option<&str>,
    ) -> EngineResult<CommitPlan> {
        let source = request
            .entries
            .iter()
            .find(|entry| entry.dr_cr == DrCr::Dr)
            .ok_or_else(|| EngineError::InvalidRequest("conversion requires a debit entry".into()))?;
        let target = request
            .entries
            .iter()
            .find(|entry| entry.dr_cr == DrCr::Cr)
            .ok_or_else(|| {
                EngineError::InvalidRequest("conversion requires a credit entry".into())
            })?;
        let from_account = accounts.get(&source.account_number).ok_or_else(|| {
            EngineError::Internal(format!("unresolved account {}", source.account_number))
        })?;
        let to_account = accounts.get(&target.account_number).ok_or_else(|| {
            EngineError::Internal(format!("unresolved account {}", target.account_number))
        })?;

        let mut fees: Vec<NewTransactionFee> = Vec::new();
        let mut fee_total = 0_i64;
        if !request.is_system_transaction && request.scope == AccountScope::Real {
            let calculations = self
                .services
                .fee_engine
                .evaluate(&FeeContext {
                    transaction_type: TransactionType::Conversion,
                    source_currency: source.currency.clone(),
                    target_currency: Some(target.currency.clone()),
                    amount_minor: source.amount_minor,
                })
                .await
                .map_err(|err| EngineError::Internal(err.to_string()))?;
            for calculation in calculations {
                fee_total += calculation.amount_minor;
                fees.push(NewTransactionFee {
                    receipt_code: receipt_code.unwrap_or_default().to_string(),
                    fee_rule_id: calculation.rule_id,
                    fee_type: calculation.fee_type,
                    amount_minor: calculation.amount_minor,
                    currency: calculation.currency,
                    agent_id: None,
                });
            }
        }

        let rate = self
            .services
            .fx
            .rate(&source.currency, &target.currency)
            .await?;
        let net_source = source.amount_minor - fee_total;
        if net_source <= 0 {
            return Err(EngineError::InvalidRequest(format!(
                "conversion fee of {fee_total} consumes the whole amount"
            )));
        }
        let converted = converted_minor(source.amount_minor, fee_total, rate)?;

        let source_liquidity = self
            .system_account(AccountPurpose::Liquidity, &source.currency, request.scope)
            .await?;
        let target_liquidity = self
            .system_account(AccountPurpose::Liquidity, &target.currency, request.scope)
            .await?;

        let stamp = |code: Option<&str>| code.map(str::to_string);
        let mut entries = vec![NewLedgerEntry {
            account_id: from_account.id,
            dr_cr: DrCr::Dr,
            amount_minor: source.amount_minor,
            currency: source.currency.clone(),
            receipt_code: source
                .receipt_code
                .clone()
                .or_else(|| stamp(receipt_code)),
            metadata: entry_metadata(source),
        }];
        if fee_total > 0 {
            // The FX margin posts to (purpose = profits, source
            // currency); a missing account is a hard failure.
            let profits = self
                .system_account(AccountPurpose::Profits, &source.currency, request.scope)
                .await?;
            entries.push(NewLedgerEntry {
                account_id: profits.id,
                dr_cr: DrCr::Cr,
                amount_minor: fee_total,
                currency: source.currency.clone(),
                receipt_code: stamp(receipt_code),
                metadata: serde_json::Value::Null,
            });
        }
        entries.push(NewLedgerEntry {
            account_id: source_liquidity.id,
            dr_cr: DrCr::Cr,
            amount_minor: net_source,
            currency: source.currency.clone(),
            receipt_code: stamp(receipt_code),
            metadata: serde_json::Value::Null,
        });
        entries.push(NewLedgerEntry {
            account_id: target_liquidity.id,
            dr_cr: DrCr::Dr,
            amount_minor: converted,
            currency: target.currency.clone(),
            receipt_code: stamp(receipt_code),
            metadata: serde_json::Value::Null,
        });
        entries.push(NewLedgerEntry {
            account_id: to_account.id,
            dr_cr: DrCr::Cr,
            amount_minor: converted,
            currency: target.currency.clone(),
            receipt_code: target
                .receipt_code
                .clone()
                .or_else(|| stamp(receipt_code)),
            metadata: entry_metadata(target),
        });

        Ok(CommitPlan { entries, fees })
    }

    /// Balance guards for every debited non-system account, ordered by
    /// ascending account id so lock acquisition is deterministic.
    /// System-owned pools are internal clearing accounts and may run
    /// negative under concurrent settlement.
    async fn guards_for(&self, draft: &JournalDraft) -> EngineResult<Vec<BalanceGuard>> {
        let mut debits: HashMap<AccountId, i64> = HashMap::new();
        for entry in &draft.entries {
            if entry.dr_cr == DrCr::Dr {
                *debits.entry(entry.account_id).or_insert(0) += entry.amount_minor;
            }
        }
        let mut guards = Vec::with_capacity(debits.len());
        for (account_id, debit_total_minor) in debits {
            let account = self
                .services
                .accounts
                .account(account_id)
                .await?
                .ok_or_else(|| EngineError::NotFound(format!("account {account_id}")))?;
            if account.owner_type == OwnerType::System {
                continue;
            }
            guards.push(BalanceGuard {
                account_id,
                debit_total_minor,
                floor_minor: account.overdraft_floor_minor(),
            });
        }
        guards.sort_by_key(|guard| guard.account_id);
        Ok(guards)
    }

    fn pending_result(
        &self,
        request: &TransactionRequest,
        receipt_code: Option<ReceiptCode>,
        accepted_at: Instant,
    ) -> TransactionResult {
        let (amount_minor, currency) = canonical_of(request);
        TransactionResult {
            receipt_code,
            transaction_id: None,
            status: TransactionStatus::Processing,
            amount_minor,
            currency,
            processing_time_ms: accepted_at.elapsed().as_millis() as u64,
            created_at: Utc::now(),
        }
    }

    /// Post-commit side effects run detached under a fresh deadline so
    /// they are not cancelled by the originating request completing.
    fn finalize_success(self: &Arc<Self>, receipt_code: Option<ReceiptCode>, committed: CommittedJournal) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let finished = tokio::time::timeout(
                engine.config.side_effect_timeout,
                engine.post_commit_success(receipt_code, committed),
            )
            .await;
            if finished.is_err() {
                warn!("post-commit side effects timed out");
            }
        });
    }

    async fn post_commit_success(
        &self,
        receipt_code: Option<ReceiptCode>,
        committed: CommittedJournal,
    ) {
        let journal = &committed.journal;

        if let Some(code) = &receipt_code {
            self.services
                .tracker
                .update(
                    code.clone(),
                    TransactionStatus::Completed,
                    Some(journal.id),
                    None,
                )
                .await;

            let mut update = ReceiptUpdate::status(code.clone(), TransactionStatus::Completed);
            update.completed_at = Some(Utc::now());
            update.creditor_status = Some(TransactionStatus::Completed);
            update.debitor_status = Some(TransactionStatus::Completed);
            update.creditor_ledger_entry_id = committed
                .entries
                .iter()
                .find(|entry| entry.dr_cr == DrCr::Cr)
                .map(|entry| entry.id);
            update.debitor_ledger_entry_id = committed
                .entries
                .iter()
                .find(|entry| entry.dr_cr == DrCr::Dr)
                .map(|entry| entry.id);
            update.transaction_cost_minor =
                Some(committed.fees.iter().map(|fee| fee.amount_minor).sum());
            self.services.allocator.enqueue_update(update).await;
        }

        let mut notified: Vec<(OwnerType, ExternalId)> = Vec::new();
        for entry in &committed.entries {
            let account = match self.services.accounts.account(entry.account_id).await {
                Ok(Some(account)) => account,
                Ok(None) => {
                    warn!(account_id = entry.account_id, "committed entry references a missing account");
                    continue;
                }
                Err(err) => {
                    warn!(account_id = entry.account_id, error = %err, "account lookup failed during fan-out");
                    continue;
                }
            };

            self.invalidate_account_cache(&account).await;

            let owner_key = (account.owner_type, account.owner_id.clone());
            if account.owner_type != OwnerType::System && !notified.contains(&owner_key) {
                notified.push(owner_key);
                let verb = match entry.dr_cr {
                    DrCr::Cr => "credited",
                    DrCr::Dr => "debited",
                };
                self.services
                    .notifier
                    .enqueue(Notification {
                        owner_type: account.owner_type,
                        owner_id: account.owner_id.clone(),
                        receipt_code: receipt_code.clone().unwrap_or_default(),
                        dr_cr: entry.dr_cr,
                        amount_minor: entry.amount_minor,
                        currency: entry.currency.clone(),
                        body: format!(
                            "Account {} {} {} {}",
                            account.account_number,
                            verb,
                            format_minor(entry.amount_minor),
                            entry.currency
                        ),
                    })
                    .await;
            }
        }

        if let Some(code) = &receipt_code {
            let mut envelope = EventEnvelope::transaction(code.clone(), TransactionStatus::Completed);
            envelope.transaction_id = Some(journal.id);
            let canonical = committed
                .entries
                .iter()
                .find(|entry| entry.dr_cr == DrCr::Dr)
                .or_else(|| committed.entries.first());
            envelope.amount_minor = canonical.map(|entry| entry.amount_minor);
            envelope.currency = canonical.map(|entry| entry.currency.clone());
            if let Err(err) = self.services.events.publish(envelope).await {
                warn!(receipt_code = %code, error = %err, "event publish failed");
            }
        }
    }

    fn finalize_failure(self: &Arc<Self>, receipt_code: Option<ReceiptCode>, message: String) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let work = async {
                let Some(code) = receipt_code else {
                    warn!(error = %message, "transaction without a receipt failed");
                    return;
                };
                engine
                    .services
                    .tracker
                    .update(
                        code.clone(),
                        TransactionStatus::Failed,
                        None,
                        Some(message.clone()),
                    )
                    .await;
                let mut update = ReceiptUpdate::status(code.clone(), TransactionStatus::Failed);
                update.failure_reason = Some(message.clone());
                engine.services.allocator.enqueue_update(update).await;

                let mut envelope = EventEnvelope::transaction(code, TransactionStatus::Failed);
                envelope.error_message = Some(message);
                if let Err(err) = engine.services.events.publish(envelope).await {
                    warn!(error = %err, "failure event publish failed");
                }
            };
            if tokio::time::timeout(engine.config.side_effect_timeout, work)
                .await
                .is_err()
            {
                warn!("failure side effects timed out");
            }
        });
    }

    async fn invalidate_account_cache(&self, account: &Account) {
        for key in [
            keys::account_number(&account.account_number),
            keys::account_id(account.id),
            keys::balance(&account.account_number),
        ] {
            if let Err(err) = self.services.cache.delete(&key).await {
                warn!(key = %key, error = %err, "cache invalidation failed");
            }
        }
        // Owner-scoped listings are keyed per account kind; a prefix
        // scan drops the whole family in one pass.
        let owner_prefix = format!(
            "accounts:owner:{}:{}:",
            account.owner_type.as_str(),
            account.owner_id
        );
        if let Err(err) = self.services.cache.delete_prefix(&owner_prefix).await {
            warn!(prefix = %owner_prefix, error = %err, "owner cache scan failed");
        }
    }

    /// System accounts are looked up by `(purpose, currency)` within
    /// the request scope; absence is an explicit failure, never a
    /// silent fallback.
    async fn system_account(
        &self,
        purpose: AccountPurpose,
        currency: &str,
        scope: AccountScope,
    ) -> EngineResult<Account> {
        let found = self
            .services
            .accounts
            .find(AccountFilter {
                owner_type: Some(OwnerType::System),
                currency: Some(currency.to_string()),
                purpose: Some(purpose),
                active_only: true,
                ..AccountFilter::default()
            })
            .await?;
        found
            .into_iter()
            .find(|account| account.kind.matches_scope(scope))
            .ok_or_else(|| {
                EngineError::NotFound(format!(
                    "system {} account for {currency} ({} scope)",
                    purpose.as_str(),
                    scope.as_str()
                ))
            })
    }

    async fn agent_commission_account(
        &self,
        agent_id: &str,
        currency: &str,
    ) -> EngineResult<Account> {
        let found = self
            .services
            .accounts
            .find(AccountFilter {
                owner_type: Some(OwnerType::Agent),
                owner_id: Some(agent_id.to_string()),
                currency: Some(currency.to_string()),
                purpose: Some(AccountPurpose::Commission),
                active_only: true,
                ..AccountFilter::default()
            })
            .await?;
        found.into_iter().next().ok_or_else(|| {
            EngineError::NotFound(format!(
                "commission account for agent {agent_id} in {currency}"
            ))
        })
    }
}

fn with_idempotency_key(mut request: TransactionRequest) -> TransactionRequest {
    if request.idempotency_key.is_none() {
        request.idempotency_key = Some(Uuid::new_v4().to_string());
    }
    request
}

fn canonical_of(request: &TransactionRequest) -> (i64, String) {
    request
        .canonical_amount()
        .map(|(amount, currency)| (amount, currency.to_string()))
        .unwrap_or((0, String::new()))
}

fn check_entry(
    account: &Account,
    entry: &EntryRequest,
    request: &TransactionRequest,
) -> EngineResult<()> {
    if account.is_locked {
        return Err(EngineError::AccountLocked(account.account_number.clone()));
    }
    if !account.is_active {
        return Err(EngineError::AccountInactive(account.account_number.clone()));
    }
    if !account.kind.matches_scope(request.scope) {
        return Err(EngineError::InvalidRequest(format!(
            "account {} is {} but the request scope is {}",
            account.account_number,
            account.kind.as_str(),
            request.scope.as_str()
        )));
    }
    if account.currency != entry.currency {
        return Err(EngineError::CurrencyMismatch {
            account_number: account.account_number.clone(),
            expected: account.currency.clone(),
            actual: entry.currency.clone(),
        });
    }
    Ok(())
}

fn validate_conversion_shape(request: &TransactionRequest) -> EngineResult<()> {
    let debits = request
        .entries
        .iter()
        .filter(|entry| entry.dr_cr == DrCr::Dr)
        .count();
    let credits = request.entries.len() - debits;
    if debits != 1 || credits != 1 {
        return Err(EngineError::InvalidRequest(
            "conversion requires exactly one debit and one credit entry".into(),
        ));
    }
    let source = &request.entries[0];
    let target = &request.entries[1];
    if source.currency == target.currency {
        return Err(EngineError::InvalidRequest(
            "conversion requires distinct source and target currencies".into(),
        ));
    }
    Ok(())
}

/// `(source - fee) * rate`, rounded half away from zero to minor units.
fn converted_minor(source_amount_minor: i64, fee_minor: i64, rate: f64) -> EngineResult<i64> {
    let net = source_amount_minor - fee_minor;
    if net <= 0 {
        return Err(EngineError::InvalidRequest(
            "conversion fee consumes the whole amount".into(),
        ));
    }
    let converted = (net as f64 * rate).round() as i64;
    if converted <= 0 {
        return Err(EngineError::InvalidRequest(
            "converted amount rounds to zero".into(),
        ));
    }
    Ok(converted)
}

/// Display-precision rendering for notification bodies only.
fn format_minor(amount_minor: i64) -> String {
    format!("{}.{:02}", amount_minor / 100, (amount_minor % 100).abs())
}

fn entry_metadata(entry: &EntryRequest) -> serde_json::Value {
    match (&entry.description, &entry.metadata) {
        (None, metadata) => metadata.clone(),
        (Some(description), serde_json::Value::Object(map)) => {
            let mut map = map.clone();
            map.insert(
                "description".to_string(),
                serde_json::Value::String(description.clone()),
            );
            serde_json::Value::Object(map)
        }
        (Some(description), serde_json::Value::Null) => {
            serde_json::json!({ "description": description })
        }
        (Some(description), other) => {
            serde_json::json!({ "description": description, "data": other })
        }
    }
}
