//! Contract tests for the `JournalStore` commit path: atomicity,
//! idempotency, per-currency double entry, and the admissibility
//! re-check under lock. Any conforming backend must pass these.

use std::sync::Arc;

use pesa_accounts::Account;
use pesa_accounts::AccountKind;
use pesa_accounts::AccountPurpose;
use pesa_accounts::AccountStore;
use pesa_accounts::BalanceStore;
use pesa_accounts::NewAccount;
use pesa_ledger::BalanceGuard;
use pesa_ledger::InMemoryLedger;
use pesa_ledger::JournalDraft;
use pesa_ledger::JournalStore;
use pesa_ledger::LedgerError;
use pesa_ledger::NewJournal;
use pesa_ledger::NewLedgerEntry;
use pesa_protocol::AccountScope;
use pesa_protocol::DrCr;
use pesa_protocol::OwnerType;
use pesa_protocol::TransactionType;
use pretty_assertions::assert_eq;

async fn open_wallet(ledger: &InMemoryLedger, owner: &str, currency: &str) -> Account {
    ledger
        .open(NewAccount::new(
            OwnerType::User,
            owner,
            currency,
            AccountPurpose::Wallet,
            AccountKind::Real,
        ))
        .await
        .expect("open wallet")
}

fn entry(account_id: i64, dr_cr: DrCr, amount_minor: i64, currency: &str) -> NewLedgerEntry {
    NewLedgerEntry {
        account_id,
        dr_cr,
        amount_minor,
        currency: currency.into(),
        receipt_code: None,
        metadata: serde_json::Value::Null,
    }
}

fn draft(key: &str, transaction_type: TransactionType, entries: Vec<NewLedgerEntry>) -> JournalDraft {
    JournalDraft {
        journal: NewJournal {
            idempotency_key: key.into(),
            external_reference: Some(format!("RCPT-{key}")),
            transaction_type,
            scope: AccountScope::Real,
            created_by: "contract".into(),
            creator_type: OwnerType::System,
        },
        entries,
        fees: Vec::new(),
    }
}

#[tokio::test]
async fn committed_journals_balance_per_currency() {
    let ledger = InMemoryLedger::new();
    let usd = open_wallet(&ledger, "u1", "USD").await;
    let usd_peer = open_wallet(&ledger, "u2", "USD").await;
    let kes = open_wallet(&ledger, "u3", "KES").await;
    let kes_peer = open_wallet(&ledger, "u4", "KES").await;
    ledger.seed_balance(usd.id, 100_000).await.expect("seed");
    ledger.seed_balance(kes.id, 5_000_000).await.expect("seed");

    // A multi-currency journal is admissible as long as each currency
    // balances independently.
    let committed = ledger
        .commit(
            draft(
                "multi",
                TransactionType::Adjustment,
                vec![
                    entry(usd.id, DrCr::Dr, 10_000, "USD"),
                    entry(usd_peer.id, DrCr::Cr, 10_000, "USD"),
                    entry(kes.id, DrCr::Dr, 1_300_000, "KES"),
                    entry(kes_peer.id, DrCr::Cr, 1_300_000, "KES"),
                ],
            ),
            Vec::new(),
        )
        .await
        .expect("commit");
    assert_eq!(committed.entries.len(), 4);

    // Skewing one currency is rejected before anything persists.
    let err = ledger
        .commit(
            draft(
                "skewed",
                TransactionType::Adjustment,
                vec![
                    entry(usd.id, DrCr::Dr, 10_000, "USD"),
                    entry(usd_peer.id, DrCr::Cr, 10_000, "USD"),
                    entry(kes.id, DrCr::Dr, 1_300_000, "KES"),
                    entry(kes_peer.id, DrCr::Cr, 1_299_999, "KES"),
                ],
            ),
            Vec::new(),
        )
        .await
        .expect_err("imbalance must be rejected");
    assert!(matches!(err, LedgerError::Validation(_)));
    assert_eq!(
        ledger
            .journal_by_idempotency_key("skewed")
            .await
            .expect("query"),
        None
    );
}

#[tokio::test]
async fn failed_commits_leave_no_partial_state() {
    let ledger = InMemoryLedger::new();
    let from = open_wallet(&ledger, "u1", "USD").await;
    let to = open_wallet(&ledger, "u2", "USD").await;
    ledger.seed_balance(from.id, 4_000).await.expect("seed");

    let err = ledger
        .commit(
            draft(
                "rollback",
                TransactionType::Transfer,
                vec![
                    entry(from.id, DrCr::Dr, 5_000, "USD"),
                    entry(to.id, DrCr::Cr, 5_000, "USD"),
                ],
            ),
            vec![BalanceGuard {
                account_id: from.id,
                debit_total_minor: 5_000,
                floor_minor: 0,
            }],
        )
        .await
        .expect_err("guard rejects the debit");
    assert!(matches!(err, LedgerError::InsufficientFunds { .. }));

    // No journal, no entries, untouched balances.
    assert_eq!(
        ledger
            .journal_by_external_reference("RCPT-rollback")
            .await
            .expect("query"),
        None
    );
    assert_eq!(
        ledger
            .balance(from.id)
            .await
            .expect("query")
            .expect("row")
            .available_minor,
        4_000
    );
    assert_eq!(
        ledger
            .balance(to.id)
            .await
            .expect("query")
            .expect("row")
            .available_minor,
        0
    );
}

#[tokio::test]
async fn idempotency_keys_admit_exactly_one_journal() {
    let ledger = Arc::new(InMemoryLedger::new());
    let from = open_wallet(&ledger, "u1", "USD").await;
    let to = open_wallet(&ledger, "u2", "USD").await;
    ledger.seed_balance(from.id, 100_000).await.expect("seed");

    // Many concurrent commits racing on one key: exactly one wins.
    let mut handles = Vec::new();
    for index in 0..8 {
        let ledger = Arc::clone(&ledger);
        let mut racing = draft(
            "race",
            TransactionType::Transfer,
            vec![
                entry(from.id, DrCr::Dr, 1_000, "USD"),
                entry(to.id, DrCr::Cr, 1_000, "USD"),
            ],
        );
        racing.journal.external_reference = Some(format!("RCPT-race-{index}"));
        handles.push(tokio::spawn(async move {
            ledger.commit(racing, Vec::new()).await
        }));
    }

    let mut committed = 0;
    let mut replayed = 0;
    for handle in handles {
        match handle.await.expect("join") {
            Ok(_) => committed += 1,
            Err(LedgerError::DuplicateIdempotencyKey(key)) => {
                assert_eq!(key, "race");
                replayed += 1;
            }
            Err(other) => panic!("unexpected error {other:?}"),
        }
    }
    assert_eq!(committed, 1);
    assert_eq!(replayed, 7);

    // Only one transfer moved money.
    assert_eq!(
        ledger
            .balance(from.id)
            .await
            .expect("query")
            .expect("row")
            .available_minor,
        99_000
    );
}

#[tokio::test]
async fn balance_after_snapshots_replay_the_running_balance() {
    let ledger = InMemoryLedger::new();
    let from = open_wallet(&ledger, "u1", "USD").await;
    let to = open_wallet(&ledger, "u2", "USD").await;
    ledger.seed_balance(from.id, 10_000).await.expect("seed");

    for (key, amount) in [("a", 1_000), ("b", 2_000), ("c", 3_000)] {
        ledger
            .commit(
                draft(
                    key,
                    TransactionType::Transfer,
                    vec![
                        entry(from.id, DrCr::Dr, amount, "USD"),
                        entry(to.id, DrCr::Cr, amount, "USD"),
                    ],
                ),
                Vec::new(),
            )
            .await
            .expect("commit");
    }

    let entries = ledger
        .entries_for_account(from.id, pesa_ledger::PeriodQuery::default())
        .await
        .expect("entries");
    let snapshots: Vec<Option<i64>> = entries
        .iter()
        .map(|entry| entry.balance_after_minor)
        .collect();
    assert_eq!(snapshots, vec![Some(9_000), Some(7_000), Some(4_000)]);
}
