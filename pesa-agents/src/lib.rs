#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Agent registry. Agents earn commissions on transactions initiated
//! by or under their hierarchy; they soft-delete (status `deleted`)
//! so historical fee rows keep a valid reference.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use pesa_protocol::AccountNumber;
use pesa_protocol::ExternalId;
use pesa_protocol::TransactionType;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::RwLock;

pub type AgentsResult<T> = Result<T, AgentsError>;

#[derive(Debug, thiserror::Error)]
pub enum AgentsError {
    #[error("agent not found: {0}")]
    NotFound(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Active,
    Inactive,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRelationship {
    Direct,
    SubAgent,
    Aggregator,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: ExternalId,
    pub user_id: ExternalId,
    pub service: String,
    /// Generic commission rate in basis points.
    pub commission_rate_bps: i64,
    /// Deposit-specific rate; wins over the generic rate for deposits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deposit_commission_rate_bps: Option<i64>,
    pub relationship: AgentRelationship,
    pub status: AgentStatus,
    /// Country code to enablement flag.
    #[serde(default)]
    pub locations: HashMap<String, bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_method: Option<String>,
    #[serde(default)]
    pub account_numbers: Vec<AccountNumber>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Agent {
    /// The commission rate that applies to a transaction type, or
    /// `None` when the agent earns nothing (inactive or deleted).
    #[must_use]
    pub fn commission_rate_for(&self, transaction_type: TransactionType) -> Option<i64> {
        if self.status != AgentStatus::Active {
            return None;
        }
        match transaction_type {
            TransactionType::Deposit => Some(
                self.deposit_commission_rate_bps
                    .unwrap_or(self.commission_rate_bps),
            ),
            _ => Some(self.commission_rate_bps),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegisterAgent {
    pub id: ExternalId,
    pub user_id: ExternalId,
    pub service: String,
    pub commission_rate_bps: i64,
    pub deposit_commission_rate_bps: Option<i64>,
    pub relationship: AgentRelationship,
    pub locations: HashMap<String, bool>,
    pub payment_method: Option<String>,
}

impl RegisterAgent {
    pub fn validate(&self) -> AgentsResult<()> {
        if self.id.trim().is_empty() {
            return Err(AgentsError::Validation("agent id must be provided".into()));
        }
        if self.user_id.trim().is_empty() {
            return Err(AgentsError::Validation(
                "agent user id must be provided".into(),
            ));
        }
        if self.commission_rate_bps < 0 {
            return Err(AgentsError::Validation(
                "commission rate must be non-negative".into(),
            ));
        }
        if let Some(rate) = self.deposit_commission_rate_bps
            && rate < 0
        {
            return Err(AgentsError::Validation(
                "deposit commission rate must be non-negative".into(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
pub trait AgentStore: Send + Sync {
    async fn register(&self, agent: RegisterAgent) -> AgentsResult<Agent>;

    async fn agent(&self, id: &str) -> AgentsResult<Option<Agent>>;

    async fn set_status(&self, id: &str, status: AgentStatus) -> AgentsResult<Agent>;

    /// Soft delete: the row stays, status moves to `deleted`.
    async fn soft_delete(&self, id: &str) -> AgentsResult<Agent>;

    async fn attach_account(&self, id: &str, account_number: AccountNumber)
    -> AgentsResult<Agent>;

    async fn list_active(&self) -> AgentsResult<Vec<Agent>>;
}

#[derive(Default)]
pub struct InMemoryAgentStore {
    agents: RwLock<HashMap<ExternalId, Agent>>,
}

impl InMemoryAgentStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AgentStore for InMemoryAgentStore {
    async fn register(&self, agent: RegisterAgent) -> AgentsResult<Agent> {
        agent.validate()?;
        let mut guard = self.agents.write().await;
        if guard.contains_key(&agent.id) {
            return Err(AgentsError::Validation(format!(
                "agent {} already registered",
                agent.id
            )));
        }
        let now = Utc::now();
        let stored = Agent {
            id: agent.id.clone(),
            user_id: agent.user_id,
            service: agent.service,
            commission_rate_bps: agent.commission_rate_bps,
            deposit_commission_rate_bps: agent.deposit_commission_rate_bps,
            relationship: agent.relationship,
            status: AgentStatus::Active,
            locations: agent.locations,
            payment_method: agent.payment_method,
            account_numbers: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        guard.insert(agent.id, stored.clone());
        Ok(stored)
    }

    async fn agent(&self, id: &str) -> AgentsResult<Option<Agent>> {
        let guard = self.agents.read().await;
        Ok(guard.get(id).cloned())
    }

    async fn set_status(&self, id: &str, status: AgentStatus) -> AgentsResult<Agent> {
        let mut guard = self.agents.write().await;
        let agent = guard
            .get_mut(id)
            .ok_or_else(|| AgentsError::NotFound(id.to_string()))?;
        agent.status = status;
        agent.updated_at = Utc::now();
        Ok(agent.clone())
    }

    async fn soft_delete(&self, id: &str) -> AgentsResult<Agent> {
        self.set_status(id, AgentStatus::Deleted).await
    }

    async fn attach_account(
        &self,
        id: &str,
        account_number: AccountNumber,
    ) -> AgentsResult<Agent> {
        let mut guard = self.agents.write().await;
        let agent = guard
            .get_mut(id)
            .ok_or_else(|| AgentsError::NotFound(id.to_string()))?;
        if !agent.account_numbers.contains(&account_number) {
            agent.account_numbers.push(account_number);
            agent.updated_at = Utc::now();
        }
        Ok(agent.clone())
    }

    async fn list_active(&self) -> AgentsResult<Vec<Agent>> {
        let guard = self.agents.read().await;
        let mut active: Vec<Agent> = guard
            .values()
            .filter(|agent| agent.status == AgentStatus::Active)
            .cloned()
            .collect();
        active.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn registration(id: &str) -> RegisterAgent {
        RegisterAgent {
            id: id.into(),
            user_id: format!("user-{id}"),
            service: "cash-in".into(),
            commission_rate_bps: 150,
            deposit_commission_rate_bps: Some(200),
            relationship: AgentRelationship::Direct,
            locations: HashMap::from([("KE".to_string(), true)]),
            payment_method: Some("mobile".into()),
        }
    }

    #[tokio::test]
    async fn register_and_fetch() {
        let store = InMemoryAgentStore::new();
        let agent = store.register(registration("agent-1")).await.expect("register");
        assert_eq!(agent.status, AgentStatus::Active);

        let fetched = store
            .agent("agent-1")
            .await
            .expect("fetch")
            .expect("exists");
        assert_eq!(fetched, agent);

        let err = store
            .register(registration("agent-1"))
            .await
            .expect_err("duplicate id must be rejected");
        assert!(matches!(err, AgentsError::Validation(_)));
    }

    #[tokio::test]
    async fn soft_delete_keeps_the_row() {
        let store = InMemoryAgentStore::new();
        store.register(registration("agent-1")).await.expect("register");
        let deleted = store.soft_delete("agent-1").await.expect("delete");
        assert_eq!(deleted.status, AgentStatus::Deleted);

        // Still retrievable, no longer listed as active.
        assert!(store.agent("agent-1").await.expect("fetch").is_some());
        assert!(store.list_active().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn attach_account_is_idempotent() {
        let store = InMemoryAgentStore::new();
        store.register(registration("agent-1")).await.expect("register");
        store
            .attach_account("agent-1", "ACC-1".into())
            .await
            .expect("attach");
        let agent = store
            .attach_account("agent-1", "ACC-1".into())
            .await
            .expect("attach again");
        assert_eq!(agent.account_numbers, vec!["ACC-1".to_string()]);
    }

    #[test]
    fn deposit_rate_wins_for_deposits_only() {
        let agent = Agent {
            id: "agent-1".into(),
            user_id: "user-1".into(),
            service: "cash-in".into(),
            commission_rate_bps: 150,
            deposit_commission_rate_bps: Some(200),
            relationship: AgentRelationship::Direct,
            status: AgentStatus::Active,
            locations: HashMap::new(),
            payment_method: None,
            account_numbers: Vec::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(
            agent.commission_rate_for(TransactionType::Deposit),
            Some(200)
        );
        assert_eq!(
            agent.commission_rate_for(TransactionType::Transfer),
            Some(150)
        );

        let generic_only = Agent {
            deposit_commission_rate_bps: None,
            ..agent.clone()
        };
        assert_eq!(
            generic_only.commission_rate_for(TransactionType::Deposit),
            Some(150)
        );

        let inactive = Agent {
            status: AgentStatus::Inactive,
            ..agent
        };
        assert_eq!(inactive.commission_rate_for(TransactionType::Deposit), None);
    }
}
