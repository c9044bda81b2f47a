use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::EngineError;
use crate::EngineResult;

/// Source of exchange rates for cross-currency conversions. Rates are
/// applied as `converted = (source - source_side_fee) * rate`, rounded
/// to minor units at the conversion boundary.
#[async_trait]
pub trait FxRateProvider: Send + Sync {
    async fn rate(&self, source: &str, target: &str) -> EngineResult<f64>;
}

/// Table-backed provider for tests and embedded deployments.
#[derive(Default)]
pub struct FixedFxRates {
    rates: RwLock<HashMap<(String, String), f64>>,
}

impl FixedFxRates {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, source: impl Into<String>, target: impl Into<String>, rate: f64) {
        let mut guard = self.rates.write().await;
        guard.insert((source.into(), target.into()), rate);
    }
}

#[async_trait]
impl FxRateProvider for FixedFxRates {
    async fn rate(&self, source: &str, target: &str) -> EngineResult<f64> {
        if source == target {
            return Ok(1.0);
        }
        let guard = self.rates.read().await;
        guard
            .get(&(source.to_string(), target.to_string()))
            .copied()
            .ok_or_else(|| EngineError::NotFound(format!("fx rate {source}->{target}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn identity_pairs_are_always_one() {
        let rates = FixedFxRates::new();
        assert_eq!(rates.rate("USD", "USD").await.expect("rate"), 1.0);
    }

    #[tokio::test]
    async fn missing_pairs_are_not_found() {
        let rates = FixedFxRates::new();
        rates.set("USD", "KES", 130.0).await;

        assert_eq!(rates.rate("USD", "KES").await.expect("rate"), 130.0);
        assert!(matches!(
            rates.rate("KES", "USD").await,
            Err(EngineError::NotFound(_))
        ));
    }
}
