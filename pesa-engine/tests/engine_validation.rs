//! Pre-validation and error-surface coverage: locked and inactive
//! accounts, currency mismatches, malformed requests, receipt
//! allocation timeouts, trade settlement, and explicit agent
//! commission payouts.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::Platform;
use common::credit_request;
use pesa_accounts::AccountPurpose;
use pesa_accounts::AccountStore;
use pesa_accounts::BalanceStore;
use pesa_accounts::NewAccount;
use pesa_agents::AgentRelationship;
use pesa_agents::AgentStore;
use pesa_agents::RegisterAgent;
use pesa_engine::EngineConfig;
use pesa_engine::EngineError;
use pesa_ledger::FeeType;
use pesa_ledger::JournalStore;
use pesa_protocol::AccountScope;
use pesa_protocol::CommissionRequest;
use pesa_protocol::DrCr;
use pesa_protocol::EntryRequest;
use pesa_protocol::OwnerType;
use pesa_protocol::ReceiptCode;
use pesa_protocol::TradeRequest;
use pesa_protocol::TransactionRequest;
use pesa_protocol::TransactionStatus;
use pesa_protocol::TransactionType;
use pesa_receipts::NewReceipt;
use pesa_receipts::Receipt;
use pesa_receipts::ReceiptClient;
use pesa_receipts::ReceiptUpdate;
use pesa_receipts::ReceiptsResult;
use pretty_assertions::assert_eq;

#[tokio::test]
async fn locked_and_inactive_accounts_fail_fast() {
    let platform = Platform::new().await;
    platform
        .open_system(AccountPurpose::Liquidity, "USD", 100_000_000)
        .await;
    let wallet = platform.open_user("u1", "USD").await;

    platform
        .ledger
        .set_locked(wallet.id, true)
        .await
        .expect("lock account");
    let err = platform
        .engine
        .credit(credit_request(&wallet, 1_000, true))
        .await
        .expect_err("locked accounts reject postings");
    assert!(matches!(err, EngineError::AccountLocked(number) if number == wallet.account_number));

    platform
        .ledger
        .set_locked(wallet.id, false)
        .await
        .expect("unlock account");
    platform
        .ledger
        .set_active(wallet.id, false)
        .await
        .expect("deactivate account");
    let err = platform
        .engine
        .credit(credit_request(&wallet, 1_000, true))
        .await
        .expect_err("inactive accounts reject postings");
    assert!(matches!(err, EngineError::AccountInactive(_)));

    // Nothing was committed either way.
    assert_eq!(
        platform
            .ledger
            .journals_for_creator("svc-test", None)
            .await
            .expect("query")
            .len(),
        0
    );

    platform.shutdown().await;
}

#[tokio::test]
async fn currency_mismatch_and_unknown_accounts_are_rejected() {
    let platform = Platform::new().await;
    platform
        .open_system(AccountPurpose::Liquidity, "USD", 100_000_000)
        .await;
    let wallet = platform.open_user("u1", "USD").await;

    let mut request = credit_request(&wallet, 1_000, true);
    request.currency = "KES".into();
    let err = platform
        .engine
        .credit(request)
        .await
        .expect_err("currency mismatch must fail");
    // The KES liquidity pool does not exist yet, so the builder fails
    // on the counterparty lookup before touching the wallet.
    assert!(matches!(err, EngineError::NotFound(_)));

    platform
        .open_system(AccountPurpose::Liquidity, "KES", 100_000_000)
        .await;
    let mut request = credit_request(&wallet, 1_000, true);
    request.currency = "KES".into();
    let err = platform
        .engine
        .credit(request)
        .await
        .expect_err("currency mismatch must fail");
    assert!(matches!(
        err,
        EngineError::CurrencyMismatch { expected, actual, .. }
            if expected == "USD" && actual == "KES"
    ));

    let mut request = credit_request(&wallet, 1_000, true);
    request.account_number = "ACC-99999999".into();
    let err = platform
        .engine
        .credit(request)
        .await
        .expect_err("unknown account must fail");
    assert!(matches!(err, EngineError::NotFound(_)));

    platform.shutdown().await;
}

#[tokio::test]
async fn malformed_requests_fail_shape_validation() {
    let platform = Platform::new().await;

    let empty = TransactionRequest::new(
        TransactionType::Deposit,
        AccountScope::Real,
        "svc-test",
        OwnerType::System,
    );
    let err = platform
        .engine
        .execute_sync(empty)
        .await
        .expect_err("empty entry list is invalid");
    assert!(matches!(err, EngineError::InvalidRequest(_)));

    let mut negative = TransactionRequest::new(
        TransactionType::Deposit,
        AccountScope::Real,
        "svc-test",
        OwnerType::System,
    );
    negative.entries = vec![EntryRequest::new("ACC-1", -5, DrCr::Cr, "USD")];
    let err = platform
        .engine
        .execute_sync(negative)
        .await
        .expect_err("negative amounts are invalid");
    assert!(matches!(err, EngineError::InvalidRequest(_)));

    platform.shutdown().await;
}

struct StuckReceiptClient;

#[async_trait]
impl ReceiptClient for StuckReceiptClient {
    async fn create_batch(&self, _requests: Vec<NewReceipt>) -> ReceiptsResult<Vec<ReceiptCode>> {
        std::future::pending::<()>().await;
        unreachable!("pending future never resolves")
    }

    async fn update_batch(&self, _updates: Vec<ReceiptUpdate>) -> ReceiptsResult<()> {
        Ok(())
    }

    async fn receipt(&self, _code: &str) -> ReceiptsResult<Option<Receipt>> {
        Ok(None)
    }
}

#[tokio::test]
async fn receipt_allocation_timeout_fails_the_operation() {
    let platform = Platform::with_receipt_client(
        EngineConfig {
            workers: 2,
            ..EngineConfig::default()
        },
        Arc::new(StuckReceiptClient),
    )
    .await;
    platform
        .open_system(AccountPurpose::Liquidity, "USD", 100_000_000)
        .await;
    let wallet = platform.open_user("u1", "USD").await;

    let started = std::time::Instant::now();
    let err = platform
        .engine
        .credit(credit_request(&wallet, 1_000, true))
        .await
        .expect_err("allocation must time out");
    assert!(matches!(err, EngineError::ReceiptTimeout));
    // Bounded by the allocation timeout, not the 5 s RPC deadline.
    assert!(started.elapsed() < Duration::from_secs(4));

    // A receipt is required before durable work: nothing committed.
    assert_eq!(
        platform
            .ledger
            .journals_for_creator("svc-test", None)
            .await
            .expect("query")
            .len(),
        0
    );

    platform.engine.shutdown().await;
}

#[tokio::test]
async fn trade_wins_and_losses_settle_against_liquidity() {
    let platform = Platform::new().await;
    let liquidity = platform
        .open_system(AccountPurpose::Liquidity, "USD", 100_000_000)
        .await;
    let trader = platform.open_user("u1", "USD").await;
    platform
        .engine
        .credit(credit_request(&trader, 10_000, true))
        .await
        .expect("fund trader");

    let win = platform
        .engine
        .process_trade_win(TradeRequest {
            account_number: trader.account_number.clone(),
            amount_minor: 2_500,
            currency: "USD".into(),
            scope: AccountScope::Real,
            created_by: "settlement".into(),
            creator_type: OwnerType::System,
            trade_reference: "trade-77".into(),
            idempotency_key: None,
        })
        .await
        .expect("win settles");
    assert_eq!(win.status, TransactionStatus::Completed);
    assert_eq!(platform.available(&trader).await, 12_500);

    let journal = platform
        .ledger
        .journal(win.transaction_id.expect("journal id"))
        .await
        .expect("query")
        .expect("journal");
    assert_eq!(journal.transaction_type, TransactionType::Trade);

    platform
        .engine
        .process_trade_loss(TradeRequest {
            account_number: trader.account_number.clone(),
            amount_minor: 4_000,
            currency: "USD".into(),
            scope: AccountScope::Real,
            created_by: "settlement".into(),
            creator_type: OwnerType::System,
            trade_reference: "trade-78".into(),
            idempotency_key: None,
        })
        .await
        .expect("loss settles");
    assert_eq!(platform.available(&trader).await, 8_500);
    // 100_000_000 - 10_000 (funding) - 2_500 (win) + 4_000 (loss)
    assert_eq!(platform.available(&liquidity).await, 99_991_500);

    platform.shutdown().await;
}

#[tokio::test]
async fn explicit_commission_pays_the_agent_from_fees() {
    let platform = Platform::new().await;
    let fees = platform.open_system(AccountPurpose::Fees, "USD", 50_000).await;
    platform
        .agents
        .register(RegisterAgent {
            id: "agent-1".into(),
            user_id: "agent-user-1".into(),
            service: "cash-in".into(),
            commission_rate_bps: 150,
            deposit_commission_rate_bps: None,
            relationship: AgentRelationship::Direct,
            locations: Default::default(),
            payment_method: None,
        })
        .await
        .expect("register agent");
    let commission_account = platform
        .ledger
        .open(NewAccount {
            commission_rate_bps: Some(150),
            ..NewAccount::new(
                OwnerType::Agent,
                "agent-1",
                "USD",
                AccountPurpose::Commission,
                pesa_accounts::AccountKind::Real,
            )
        })
        .await
        .expect("open commission account");

    let result = platform
        .engine
        .process_agent_commission(CommissionRequest {
            agent_id: "agent-1".into(),
            amount_minor: 3_000,
            currency: "USD".into(),
            created_by: "payout-run".into(),
            creator_type: OwnerType::System,
            source_receipt_code: None,
            idempotency_key: None,
        })
        .await
        .expect("commission settles");
    assert_eq!(result.status, TransactionStatus::Completed);

    assert_eq!(platform.available(&fees).await, 47_000);
    assert_eq!(
        platform
            .ledger
            .balance(commission_account.id)
            .await
            .expect("balance")
            .expect("row")
            .available_minor,
        3_000
    );

    let fee_rows = platform
        .ledger
        .fees_for_receipt(&result.receipt_code.expect("receipt code"))
        .await
        .expect("fee rows");
    assert_eq!(fee_rows.len(), 1);
    assert_eq!(fee_rows[0].fee_type, FeeType::AgentCommission);
    assert_eq!(fee_rows[0].agent_id.as_deref(), Some("agent-1"));

    // Soft-deleted agents cannot be paid.
    platform
        .agents
        .soft_delete("agent-1")
        .await
        .expect("soft delete");
    let err = platform
        .engine
        .process_agent_commission(CommissionRequest {
            agent_id: "agent-1".into(),
            amount_minor: 1_000,
            currency: "USD".into(),
            created_by: "payout-run".into(),
            creator_type: OwnerType::System,
            source_receipt_code: None,
            idempotency_key: None,
        })
        .await
        .expect_err("deleted agents earn nothing");
    assert!(matches!(err, EngineError::InvalidRequest(_)));

    platform.shutdown().await;
}

#[tokio::test]
async fn mutations_invalidate_cached_account_and_balance_keys() {
    let platform = Platform::new().await;
    platform
        .open_system(AccountPurpose::Liquidity, "USD", 100_000_000)
        .await;
    let wallet = platform.open_user("u1", "USD").await;

    // First credit warms the account cache during pre-validation.
    platform
        .engine
        .credit(credit_request(&wallet, 1_000, true))
        .await
        .expect("first credit");
    platform.settle_side_effects().await;

    // Post-commit invalidation removed the account and balance keys,
    // so a second credit re-resolves from the store and still works.
    platform
        .engine
        .credit(credit_request(&wallet, 2_000, true))
        .await
        .expect("second credit");
    assert_eq!(platform.available(&wallet).await, 3_000);

    platform.shutdown().await;
}
