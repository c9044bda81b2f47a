#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Fee rule engine. Rules are looked up by
//! `(transaction_type, source_currency, target_currency)` — the pair
//! is null for non-conversion types — and the first active match wins.
//! Calculations run in minor units; min/max clamps apply after the
//! calculation. Rules are cached in the shared store and invalidated
//! on every write.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pesa_cache::SharedStore;
use pesa_cache::keys;
use pesa_ledger::FeeType;
use pesa_protocol::TransactionType;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::warn;

pub type FeeRuleId = i64;

pub type FeesResult<T> = Result<T, FeesError>;

#[derive(Debug, thiserror::Error)]
pub enum FeesError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeRuleKind {
    Fixed,
    Percentage,
    Tiered,
    Combined,
}

/// One component of a tiered or combined rule. For tiered rules
/// `up_to_minor` bounds the tier (the last tier is open-ended); for
/// combined rules every component applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeComponent {
    pub kind: FeeComponentKind,
    /// Atomic units for fixed components, basis points for percentage
    /// components.
    pub value: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub up_to_minor: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeComponentKind {
    Fixed,
    Percentage,
}

impl FeeComponent {
    fn amount_for(&self, amount_minor: i64) -> i64 {
        match self.kind {
            FeeComponentKind::Fixed => self.value,
            FeeComponentKind::Percentage => amount_minor * self.value / 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeeRule {
    pub id: FeeRuleId,
    pub transaction_type: TransactionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_currency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_currency: Option<String>,
    pub kind: FeeRuleKind,
    /// Atomic units for fixed rules, basis points for percentage rules.
    /// Unused for tiered/combined rules, which read their components.
    pub value: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub components: Vec<FeeComponent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_fee_minor: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_fee_minor: Option<i64>,
    pub is_active: bool,
}

impl FeeRule {
    /// Raw fee before clamping, in minor units of the fee currency.
    #[must_use]
    pub fn raw_fee_minor(&self, amount_minor: i64) -> i64 {
        match self.kind {
            FeeRuleKind::Fixed => self.value,
            FeeRuleKind::Percentage => amount_minor * self.value / 10_000,
            FeeRuleKind::Tiered => self
                .components
                .iter()
                .find(|component| {
                    component
                        .up_to_minor
                        .map(|bound| amount_minor <= bound)
                        .unwrap_or(true)
                })
                .map(|component| component.amount_for(amount_minor))
                .unwrap_or(0),
            FeeRuleKind::Combined => self
                .components
                .iter()
                .map(|component| component.amount_for(amount_minor))
                .sum(),
        }
    }

    /// Fee with min/max clamps applied.
    #[must_use]
    pub fn fee_minor(&self, amount_minor: i64) -> i64 {
        let mut fee = self.raw_fee_minor(amount_minor);
        if let Some(min) = self.min_fee_minor {
            fee = fee.max(min);
        }
        if let Some(max) = self.max_fee_minor {
            fee = fee.min(max);
        }
        fee
    }

    /// The fee-row type this rule produces.
    #[must_use]
    pub fn fee_type(&self) -> FeeType {
        match self.kind {
            FeeRuleKind::Percentage => FeeType::Percentage,
            FeeRuleKind::Fixed | FeeRuleKind::Tiered | FeeRuleKind::Combined => FeeType::Flat,
        }
    }

    fn lookup_key(&self) -> String {
        keys::fee_rule(
            self.transaction_type.as_str(),
            self.source_currency.as_deref(),
            self.target_currency.as_deref(),
        )
    }
}

/// Transaction context a rule is evaluated against.
#[derive(Debug, Clone, PartialEq)]
pub struct FeeContext {
    pub transaction_type: TransactionType,
    pub source_currency: String,
    pub target_currency: Option<String>,
    pub amount_minor: i64,
}

/// A calculated fee, ready to become a fee leg plus a fee row. The fee
/// is charged in the source currency.
#[derive(Debug, Clone, PartialEq)]
pub struct FeeCalculation {
    pub rule_id: FeeRuleId,
    pub fee_type: FeeType,
    pub amount_minor: i64,
    pub currency: String,
}

#[async_trait]
pub trait FeeRuleStore: Send + Sync {
    /// The single active rule for the lookup triple, if any.
    async fn active_rule(
        &self,
        transaction_type: TransactionType,
        source_currency: Option<&str>,
        target_currency: Option<&str>,
    ) -> FeesResult<Option<FeeRule>>;

    /// Inserts or replaces a rule. At most one active rule may match a
    /// given triple.
    async fn upsert(&self, rule: FeeRule) -> FeesResult<FeeRule>;
}

#[derive(Default)]
pub struct InMemoryFeeRuleStore {
    rules: RwLock<HashMap<FeeRuleId, FeeRule>>,
}

impl InMemoryFeeRuleStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FeeRuleStore for InMemoryFeeRuleStore {
    async fn active_rule(
        &self,
        transaction_type: TransactionType,
        source_currency: Option<&str>,
        target_currency: Option<&str>,
    ) -> FeesResult<Option<FeeRule>> {
        let guard = self.rules.read().await;
        let mut matches: Vec<&FeeRule> = guard
            .values()
            .filter(|rule| {
                rule.is_active
                    && rule.transaction_type == transaction_type
                    && rule.source_currency.as_deref() == source_currency
                    && rule.target_currency.as_deref() == target_currency
            })
            .collect();
        matches.sort_by_key(|rule| rule.id);
        Ok(matches.first().map(|rule| (*rule).clone()))
    }

    async fn upsert(&self, rule: FeeRule) -> FeesResult<FeeRule> {
        let mut guard = self.rules.write().await;
        if rule.is_active
            && guard.values().any(|existing| {
                existing.id != rule.id
                    && existing.is_active
                    && existing.transaction_type == rule.transaction_type
                    && existing.source_currency == rule.source_currency
                    && existing.target_currency == rule.target_currency
            })
        {
            return Err(FeesError::Validation(format!(
                "an active rule already matches {}",
                rule.lookup_key()
            )));
        }
        guard.insert(rule.id, rule.clone());
        Ok(rule)
    }
}

/// Evaluates fee rules for a transaction context, caching rule lookups
/// in the shared store.
#[derive(Clone)]
pub struct FeeEngine {
    store: Arc<dyn FeeRuleStore>,
    cache: Arc<dyn SharedStore>,
    cache_ttl: Duration,
}

impl FeeEngine {
    pub fn new(store: Arc<dyn FeeRuleStore>, cache: Arc<dyn SharedStore>) -> Self {
        Self::with_cache_ttl(store, cache, Duration::from_secs(10 * 60))
    }

    pub fn with_cache_ttl(
        store: Arc<dyn FeeRuleStore>,
        cache: Arc<dyn SharedStore>,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            cache_ttl,
        }
    }

    /// Evaluates the context and returns zero or more fee calculations.
    /// Conversions look up the `(type, src, tgt)` pair; everything else
    /// uses the nullable pair.
    pub async fn evaluate(&self, context: &FeeContext) -> FeesResult<Vec<FeeCalculation>> {
        if context.amount_minor <= 0 {
            return Err(FeesError::Validation(
                "fee context amount must be positive".into(),
            ));
        }

        let (source, target) = match context.transaction_type {
            TransactionType::Conversion => (
                Some(context.source_currency.as_str()),
                context.target_currency.as_deref(),
            ),
            _ => (None, None),
        };

        let rule = match self
            .lookup_cached(context.transaction_type, source, target)
            .await?
        {
            Some(rule) => rule,
            None => return Ok(Vec::new()),
        };

        let fee_minor = rule.fee_minor(context.amount_minor);
        if fee_minor <= 0 {
            return Ok(Vec::new());
        }

        Ok(vec![FeeCalculation {
            rule_id: rule.id,
            fee_type: rule.fee_type(),
            amount_minor: fee_minor,
            currency: context.source_currency.clone(),
        }])
    }

    /// Writes a rule through to the store and invalidates its cache
    /// slot.
    pub async fn upsert_rule(&self, rule: FeeRule) -> FeesResult<FeeRule> {
        let key = rule.lookup_key();
        let stored = self.store.upsert(rule).await?;
        if let Err(err) = self.cache.delete(&key).await {
            warn!(key = %key, error = %err, "failed to invalidate fee rule cache");
        }
        Ok(stored)
    }

    async fn lookup_cached(
        &self,
        transaction_type: TransactionType,
        source: Option<&str>,
        target: Option<&str>,
    ) -> FeesResult<Option<FeeRule>> {
        let key = keys::fee_rule(transaction_type.as_str(), source, target);
        match pesa_cache::get_json::<FeeRule>(self.cache.as_ref(), &key).await {
            Ok(Some(rule)) => return Ok(Some(rule)),
            Ok(None) => {}
            Err(err) => {
                warn!(key = %key, error = %err, "fee rule cache read failed; falling back to store");
            }
        }

        let rule = self.store.active_rule(transaction_type, source, target).await?;
        if let Some(rule) = &rule
            && let Err(err) =
                pesa_cache::set_json(self.cache.as_ref(), &key, rule, Some(self.cache_ttl)).await
        {
            warn!(key = %key, error = %err, "failed to cache fee rule");
        }
        Ok(rule)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pesa_cache::InMemorySharedStore;
    use pretty_assertions::assert_eq;

    fn percentage_rule(id: FeeRuleId, bps: i64) -> FeeRule {
        FeeRule {
            id,
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

    fn conversion_rule(id: FeeRuleId, value_minor: i64) -> FeeRule {
        FeeRule {
            id,
            transaction_type: TransactionType::Conversion,
            source_currency: Some("USD".into()),
            target_currency: Some("KES".into()),
            kind: FeeRuleKind::Fixed,
            value: value_minor,
            components: Vec::new(),
            min_fee_minor: None,
            max_fee_minor: None,
            is_active: true,
        }
    }

    async fn engine_with(rules: Vec<FeeRule>) -> FeeEngine {
        let store = Arc::new(InMemoryFeeRuleStore::new());
        let cache = Arc::new(InMemorySharedStore::new());
        let engine = FeeEngine::new(store, cache);
        for rule in rules {
            engine.upsert_rule(rule).await.expect("seed rule");
        }
        engine
    }

    fn transfer_context(amount_minor: i64) -> FeeContext {
        FeeContext {
            transaction_type: TransactionType::Transfer,
            source_currency: "USD".into(),
            target_currency: None,
            amount_minor,
        }
    }

    #[test]
    fn fixed_rule_value_is_atomic_units() {
        let rule = conversion_rule(1, 500);
        assert_eq!(rule.fee_minor(10_000), 500);
    }

    #[test]
    fn percentage_rule_value_is_basis_points() {
        let rule = percentage_rule(1, 100);
        assert_eq!(rule.fee_minor(10_000), 100);
        assert_eq!(rule.fee_minor(33), 0);
    }

    #[test]
    fn clamps_apply_after_calculation() {
        let mut rule = percentage_rule(1, 100);
        rule.min_fee_minor = Some(50);
        rule.max_fee_minor = Some(150);
        assert_eq!(rule.fee_minor(1_000), 50);
        assert_eq!(rule.fee_minor(10_000), 100);
        assert_eq!(rule.fee_minor(100_000), 150);
    }

    #[test]
    fn tiered_rule_selects_covering_tier() {
        let rule = FeeRule {
            id: 1,
            transaction_type: TransactionType::Withdrawal,
            source_currency: None,
            target_currency: None,
            kind: FeeRuleKind::Tiered,
            value: 0,
            components: vec![
                FeeComponent {
                    kind: FeeComponentKind::Fixed,
                    value: 100,
                    up_to_minor: Some(10_000),
                },
                FeeComponent {
                    kind: FeeComponentKind::Percentage,
                    value: 200,
                    up_to_minor: None,
                },
            ],
            min_fee_minor: None,
            max_fee_minor: None,
            is_active: true,
        };
        assert_eq!(rule.fee_minor(5_000), 100);
        assert_eq!(rule.fee_minor(10_000), 100);
        assert_eq!(rule.fee_minor(50_000), 1_000);
    }

    #[test]
    fn combined_rule_sums_components() {
        let rule = FeeRule {
            id: 1,
            transaction_type: TransactionType::Withdrawal,
            source_currency: None,
            target_currency: None,
            kind: FeeRuleKind::Combined,
            value: 0,
            components: vec![
                FeeComponent {
                    kind: FeeComponentKind::Fixed,
                    value: 30,
                    up_to_minor: None,
                },
                FeeComponent {
                    kind: FeeComponentKind::Percentage,
                    value: 290,
                    up_to_minor: None,
                },
            ],
            min_fee_minor: None,
            max_fee_minor: None,
            is_active: true,
        };
        // 30 + 2.9% of 10_000
        assert_eq!(rule.fee_minor(10_000), 320);
    }

    #[tokio::test]
    async fn evaluate_matches_transfer_rule() {
        let engine = engine_with(vec![percentage_rule(1, 100)]).await;
        let fees = engine
            .evaluate(&transfer_context(10_000))
            .await
            .expect("evaluate");
        assert_eq!(
            fees,
            vec![FeeCalculation {
                rule_id: 1,
                fee_type: FeeType::Percentage,
                amount_minor: 100,
                currency: "USD".into(),
            }]
        );
    }

    #[tokio::test]
    async fn evaluate_returns_empty_without_matching_rule() {
        let engine = engine_with(vec![conversion_rule(1, 500)]).await;
        let fees = engine
            .evaluate(&transfer_context(10_000))
            .await
            .expect("evaluate");
        assert!(fees.is_empty());
    }

    #[tokio::test]
    async fn conversion_lookup_uses_currency_pair() {
        let engine = engine_with(vec![conversion_rule(1, 500)]).await;
        let fees = engine
            .evaluate(&FeeContext {
                transaction_type: TransactionType::Conversion,
                source_currency: "USD".into(),
                target_currency: Some("KES".into()),
                amount_minor: 10_000,
            })
            .await
            .expect("evaluate");
        assert_eq!(fees.len(), 1);
        assert_eq!(fees[0].amount_minor, 500);
        assert_eq!(fees[0].currency, "USD");

        let other_pair = engine
            .evaluate(&FeeContext {
                transaction_type: TransactionType::Conversion,
                source_currency: "USD".into(),
                target_currency: Some("EUR".into()),
                amount_minor: 10_000,
            })
            .await
            .expect("evaluate");
        assert!(other_pair.is_empty());
    }

    #[tokio::test]
    async fn store_rejects_second_active_rule_for_triple() {
        let store = InMemoryFeeRuleStore::new();
        store.upsert(percentage_rule(1, 100)).await.expect("first");
        let err = store
            .upsert(percentage_rule(2, 200))
            .await
            .expect_err("second active rule must be rejected");
        assert!(matches!(err, FeesError::Validation(_)));

        // An inactive shadow rule is allowed.
        let mut inactive = percentage_rule(2, 200);
        inactive.is_active = false;
        store.upsert(inactive).await.expect("inactive rule");
    }

    #[tokio::test]
    async fn upsert_invalidates_cached_rule() {
        let store = Arc::new(InMemoryFeeRuleStore::new());
        let cache = Arc::new(InMemorySharedStore::new());
        let engine = FeeEngine::new(store, cache.clone());

        engine
            .upsert_rule(percentage_rule(1, 100))
            .await
            .expect("seed");
        // Prime the cache.
        let fees = engine
            .evaluate(&transfer_context(10_000))
            .await
            .expect("evaluate");
        assert_eq!(fees[0].amount_minor, 100);
        assert!(
            cache
                .exists("fee_rule:transfer:-:-")
                .await
                .expect("exists")
        );

        // Replacing the rule drops the cached copy and the next read
        // sees the new value.
        let mut updated = percentage_rule(1, 250);
        updated.id = 1;
        engine.upsert_rule(updated).await.expect("update");
        assert!(
            !cache
                .exists("fee_rule:transfer:-:-")
                .await
                .expect("exists")
        );
        let fees = engine
            .evaluate(&transfer_context(10_000))
            .await
            .expect("evaluate");
        assert_eq!(fees[0].amount_minor, 250);
    }
}
