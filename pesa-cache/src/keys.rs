//! Stable cache key conventions. Every component derives its keys from
//! these builders so invalidation scans stay exact.

/// `accounts:id:<id>`
#[must_use]
pub fn account_id(id: i64) -> String {
    format!("accounts:id:{id}")
}

/// `accounts:number:<n>`
#[must_use]
pub fn account_number(number: &str) -> String {
    format!("accounts:number:{number}")
}

/// `accounts:owner:<otype>:<oid>:<atype>`
#[must_use]
pub fn account_owner(owner_type: &str, owner_id: &str, kind: &str) -> String {
    format!("accounts:owner:{owner_type}:{owner_id}:{kind}")
}

/// `balance:account:<n>`
#[must_use]
pub fn balance(number: &str) -> String {
    format!("balance:account:{number}")
}

/// `journal:id:<id>`
#[must_use]
pub fn journal_id(id: i64) -> String {
    format!("journal:id:{id}")
}

/// `journal:idempotency:<key>`
#[must_use]
pub fn journal_idempotency(key: &str) -> String {
    format!("journal:idempotency:{key}")
}

/// `fee_rule:<type>:<src>:<tgt>` — absent currencies render as `-`.
#[must_use]
pub fn fee_rule(transaction_type: &str, source: Option<&str>, target: Option<&str>) -> String {
    format!(
        "fee_rule:{transaction_type}:{}:{}",
        source.unwrap_or("-"),
        target.unwrap_or("-")
    )
}

/// `transaction:status:<code>`
#[must_use]
pub fn transaction_status(receipt_code: &str) -> String {
    format!("transaction:status:{receipt_code}")
}

/// `idempotency:<key>` — the cached transaction result.
#[must_use]
pub fn idempotency(key: &str) -> String {
    format!("idempotency:{key}")
}
