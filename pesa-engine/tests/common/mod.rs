#![allow(dead_code)]

//! Shared in-memory platform fixture for the engine integration
//! suites: every store and side-effect service wired together the way
//! an embedder would compose them, with fast batcher ticks.

use std::sync::Arc;
use std::time::Duration;

use pesa_accounts::Account;
use pesa_accounts::AccountKind;
use pesa_accounts::AccountPurpose;
use pesa_accounts::AccountStore;
use pesa_accounts::BalanceStore;
use pesa_accounts::NewAccount;
use pesa_agents::InMemoryAgentStore;
use pesa_cache::InMemorySharedStore;
use pesa_engine::EngineConfig;
use pesa_engine::EngineServices;
use pesa_engine::FixedFxRates;
use pesa_engine::TransactionEngine;
use pesa_events::RecordingEventBus;
use pesa_fees::FeeEngine;
use pesa_fees::FeeRule;
use pesa_fees::FeeRuleKind;
use pesa_fees::InMemoryFeeRuleStore;
use pesa_ledger::InMemoryLedger;
use pesa_notify::NotificationBatcher;
use pesa_notify::NotifierConfig;
use pesa_notify::RecordingNotificationClient;
use pesa_protocol::AccountScope;
use pesa_protocol::CreditRequest;
use pesa_protocol::OwnerType;
use pesa_protocol::TransactionType;
use pesa_receipts::BatcherConfig;
use pesa_receipts::InMemoryReceiptService;
use pesa_receipts::ReceiptAllocator;
use pesa_receipts::ReceiptClient;
use pesa_status::StatusTracker;
use pesa_status::TrackerConfig;

pub struct Platform {
    pub engine: Arc<TransactionEngine>,
    pub ledger: Arc<InMemoryLedger>,
    pub receipts: Arc<InMemoryReceiptService>,
    pub allocator: Arc<ReceiptAllocator>,
    pub tracker: Arc<StatusTracker>,
    pub notifier: Arc<NotificationBatcher>,
    pub notifications: Arc<RecordingNotificationClient>,
    pub events: Arc<RecordingEventBus>,
    pub fee_engine: FeeEngine,
    pub fx: Arc<FixedFxRates>,
    pub agents: Arc<InMemoryAgentStore>,
}

impl Platform {
    pub async fn with_engine_config(config: EngineConfig) -> Self {
        Self::assemble(config, None).await
    }

    /// Swaps the downstream receipt service for a custom client while
    /// keeping the in-memory service as the lookup store.
    pub async fn with_receipt_client(
        config: EngineConfig,
        client: Arc<dyn ReceiptClient>,
    ) -> Self {
        Self::assemble(config, Some(client)).await
    }

    async fn assemble(config: EngineConfig, client: Option<Arc<dyn ReceiptClient>>) -> Self {
        let ledger = Arc::new(InMemoryLedger::new());
        let cache = Arc::new(InMemorySharedStore::new());
        let receipts = Arc::new(InMemoryReceiptService::new());
        let receipt_client: Arc<dyn ReceiptClient> =
            client.unwrap_or_else(|| receipts.clone());
        let allocator = ReceiptAllocator::new(
            receipt_client.clone(),
            BatcherConfig {
                flush_interval: Duration::from_millis(10),
                ..BatcherConfig::default()
            },
        );
        allocator.start().await;

        let tracker = StatusTracker::new(
            cache.clone(),
            ledger.clone(),
            receipts.clone(),
            TrackerConfig {
                flush_interval: Duration::from_millis(10),
                ..TrackerConfig::default()
            },
        );
        tracker.start().await;

        let notifications = RecordingNotificationClient::shared();
        let notifier = NotificationBatcher::new(
            notifications.clone(),
            NotifierConfig {
                flush_interval: Duration::from_millis(10),
                ..NotifierConfig::default()
            },
        );
        notifier.start().await;

        let events = RecordingEventBus::shared();
        let fee_engine = FeeEngine::new(Arc::new(InMemoryFeeRuleStore::new()), cache.clone());
        let fx = Arc::new(FixedFxRates::new());
        let agents = Arc::new(InMemoryAgentStore::new());

        let engine = TransactionEngine::new(
            EngineServices {
                accounts: ledger.clone(),
                balances: ledger.clone(),
                journals: ledger.clone(),
                fee_engine: fee_engine.clone(),
                agents: agents.clone(),
                allocator: allocator.clone(),
                receipt_client: receipt_client.clone(),
                tracker: tracker.clone(),
                notifier: notifier.clone(),
                events: events.clone(),
                cache,
                fx: fx.clone(),
            },
            config,
        );
        engine.start().await;

        Self {
            engine,
            ledger,
            receipts,
            allocator,
            tracker,
            notifier,
            notifications,
            events,
            fee_engine,
            fx,
            agents,
        }
    }

    pub async fn new() -> Self {
        Self::with_engine_config(EngineConfig {
            workers: 4,
            ..EngineConfig::default()
        })
        .await
    }

    pub async fn open_system(
        &self,
        purpose: AccountPurpose,
        currency: &str,
        balance_minor: i64,
    ) -> Account {
        let account = self
            .ledger
            .open(NewAccount::new(
                OwnerType::System,
                "platform",
                currency,
                purpose,
                AccountKind::System,
            ))
            .await
            .expect("open system account");
        if balance_minor != 0 {
            self.ledger
                .seed_balance(account.id, balance_minor)
                .await
                .expect("seed system balance");
        }
        account
    }

    pub async fn open_user(&self, owner_id: &str, currency: &str) -> Account {
        self.ledger
            .open(NewAccount::new(
                OwnerType::User,
                owner_id,
                currency,
                AccountPurpose::Wallet,
                AccountKind::Real,
            ))
            .await
            .expect("open user account")
    }

    pub async fn available(&self, account: &Account) -> i64 {
        self.ledger
            .balance(account.id)
            .await
            .expect("balance query")
            .expect("balance row")
            .available_minor
    }

    pub async fn settle_side_effects(&self) {
        // Give the update/notify/status batchers a few ticks.
        tokio::time::sleep(Duration::from_millis(80)).await;
    }

    pub async fn shutdown(&self) {
        self.engine.shutdown().await;
        self.allocator.shutdown().await;
        self.notifier.shutdown().await;
        self.tracker.shutdown().await;
    }
}

pub fn credit_request(account: &Account, amount_minor: i64, system: bool) -> CreditRequest {
    CreditRequest {
        account_number: account.account_number.clone(),
        amount_minor,
        currency: account.currency.clone(),
        scope: AccountScope::Real,
        created_by: "svc-test".into(),
        creator_type: OwnerType::System,
        idempotency_key: None,
        is_system_transaction: system,
        description: None,
        agent_id: None,
    }
}

pub fn transfer_percentage_rule(bps: i64) -> FeeRule {
    FeeRule {
        id: 1,
        transaction_type: TransactionType::Transfer,
        source_currency: None,
        target_currency: None,
        kind: FeeRuleKind::Percentage,
        value: bps,
        components: Vec::new(),
        min_fee_minor: None,
        max_fee_minor: None,
        is_active: true,
    }
}

pub fn conversion_fixed_rule(value_minor: i64, source: &str, target: &str) -> FeeRule {
    FeeRule {
        id: 2,
        transaction_type: TransactionType::Conversion,
        source_currency: Some(source.into()),
        target_currency: Some(target.into()),
        kind: FeeRuleKind::Fixed,
        value: value_minor,
        components: Vec::new(),
        min_fee_minor: None,
        max_fee_minor: None,
        is_active: true,
    }
}
