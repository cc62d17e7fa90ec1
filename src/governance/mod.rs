//! Virtual-key governance: the entity store, the policy evaluator, and the
//! write-through persistence that backs them.
//!
//! Build one [`Governance`] per process from a [`ConfigStore`], hand it around
//! by `Arc`, and call [`Governance::shutdown`] on teardown so pending usage
//! deltas reach the store.

pub mod entities;
pub mod evaluator;
pub mod flush;
pub mod persistence;
pub mod store;

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{GatewayError, Result};
use crate::types::ModelRef;

use entities::{
    Budget, Customer, ProviderConfig, RateLimit, Team, VirtualKey, new_entity_id,
    parse_reset_duration,
};
use flush::{TouchedQuotas, UsageFlusher};
use persistence::ConfigStore;
use store::{GovernanceDelta, GovernanceDump, GovernanceStore, ResolvedRequest};

pub trait Clock: Send + Sync {
    fn now_epoch_seconds(&self) -> u64;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_epoch_seconds(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0)
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct BudgetSpec {
    pub max_limit: f64,
    #[serde(default)]
    pub reset_duration: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct RateLimitSpec {
    #[serde(default)]
    pub token_max_limit: Option<u64>,
    #[serde(default)]
    pub token_reset_duration: Option<String>,
    #[serde(default)]
    pub request_max_limit: Option<u64>,
    #[serde(default)]
    pub request_reset_duration: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ProviderConfigSpec {
    pub provider: String,
    #[serde(default = "default_pc_weight")]
    pub weight: f64,
    #[serde(default)]
    pub budget: Option<BudgetSpec>,
    #[serde(default)]
    pub rate_limit: Option<RateLimitSpec>,
    #[serde(default)]
    pub allowed_models: Option<Vec<String>>,
}

fn default_pc_weight() -> f64 {
    1.0
}

#[derive(Clone, Debug, Deserialize)]
pub struct CreateCustomerRequest {
    pub name: String,
    #[serde(default)]
    pub budget: Option<BudgetSpec>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct UpdateCustomerRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub budget: Option<BudgetSpec>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct CreateTeamRequest {
    pub name: String,
    #[serde(default)]
    pub customer_id: Option<String>,
    #[serde(default)]
    pub budget: Option<BudgetSpec>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct UpdateTeamRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub customer_id: Option<String>,
    #[serde(default)]
    pub budget: Option<BudgetSpec>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct CreateVirtualKeyRequest {
    pub name: String,
    /// Client-presented secret; generated when omitted.
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub team_id: Option<String>,
    #[serde(default)]
    pub budget: Option<BudgetSpec>,
    #[serde(default)]
    pub rate_limit: Option<RateLimitSpec>,
    #[serde(default)]
    pub provider_configs: Vec<ProviderConfigSpec>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct UpdateVirtualKeyRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub team_id: Option<String>,
    #[serde(default)]
    pub budget: Option<BudgetSpec>,
    #[serde(default)]
    pub rate_limit: Option<RateLimitSpec>,
    #[serde(default)]
    pub provider_configs: Option<Vec<ProviderConfigSpec>>,
}

/// Process-wide governance component: authoritative in-memory state plus
/// write-through persistence and the usage write-behind.
pub struct Governance {
    store: Arc<GovernanceStore>,
    config_store: Arc<dyn ConfigStore>,
    flusher: std::sync::Mutex<Option<UsageFlusher>>,
    clock: Arc<dyn Clock>,
}

impl Governance {
    /// Rebuilds the runtime store from persisted state and starts the usage
    /// flusher.
    pub async fn load(
        config_store: Arc<dyn ConfigStore>,
        clock: Arc<dyn Clock>,
        flush_interval: Duration,
    ) -> Result<Self> {
        let store = Arc::new(GovernanceStore::new());
        let deltas = config_store.load_all().await?;
        store.apply_all(&deltas);

        let flusher = UsageFlusher::spawn(store.clone(), config_store.clone(), flush_interval);
        Ok(Self {
            store,
            config_store,
            flusher: std::sync::Mutex::new(Some(flusher)),
            clock,
        })
    }

    pub fn store(&self) -> &Arc<GovernanceStore> {
        &self.store
    }

    pub fn config_store(&self) -> &Arc<dyn ConfigStore> {
        &self.config_store
    }

    pub fn now(&self) -> u64 {
        self.clock.now_epoch_seconds()
    }

    /// Flushes pending usage deltas and stops the write-behind task.
    pub async fn shutdown(&self) {
        let flusher = self.flusher.lock().expect("flusher lock").take();
        if let Some(flusher) = flusher {
            flusher.shutdown().await;
        }
    }

    // ---- data plane ----

    /// Resolves the presented VK and checks every quota on its chain.
    pub fn admit(&self, vk_value: &str, model: &ModelRef) -> Result<ResolvedRequest> {
        let resolved = self.store.resolve(vk_value, model)?;
        evaluator::admit(&resolved, self.now())?;
        Ok(resolved)
    }

    /// Applies usage after a successful response (or terminal stream chunk)
    /// and schedules the coalesced persistence write. Returns the charged
    /// cost.
    pub fn record_usage(
        &self,
        resolved: &ResolvedRequest,
        tokens: u64,
        reported_cost: Option<f64>,
    ) -> f64 {
        let cost = evaluator::record(resolved, self.now(), tokens, reported_cost);
        let (budget_ids, rate_limit_ids) = resolved.touched_quota_ids();
        if let Some(flusher) = self.flusher.lock().expect("flusher lock").as_ref() {
            flusher.notify(TouchedQuotas {
                budget_ids,
                rate_limit_ids,
            });
        }
        cost
    }

    pub fn dump(&self) -> GovernanceDump {
        self.store.dump(self.now())
    }

    // ---- control plane ----

    async fn persist_and_apply(&self, deltas: Vec<GovernanceDelta>) -> Result<()> {
        // Write-through: the config store must accept the batch before the
        // in-memory state changes.
        self.config_store.apply(&deltas).await?;
        self.store.apply_all(&deltas);
        Ok(())
    }

    fn build_budget(&self, spec: &BudgetSpec, now: u64) -> Result<Budget> {
        let reset_duration = match &spec.reset_duration {
            Some(raw) => parse_reset_duration(raw)?,
            None => 0,
        };
        Ok(Budget::new(spec.max_limit, reset_duration, now))
    }

    /// Applies a spec to an existing budget, preserving reset-on-shrink.
    fn rebuild_budget(&self, existing: Option<Budget>, spec: &BudgetSpec, now: u64) -> Result<Budget> {
        let mut budget = match existing {
            Some(budget) => budget,
            None => return self.build_budget(spec, now),
        };
        budget.apply_max_limit(spec.max_limit);
        if let Some(raw) = &spec.reset_duration {
            budget.reset_duration = parse_reset_duration(raw)?;
        }
        Ok(budget)
    }

    fn rebuild_rate_limit(
        &self,
        existing: Option<RateLimit>,
        spec: &RateLimitSpec,
        now: u64,
    ) -> Result<RateLimit> {
        let mut rate_limit = existing.unwrap_or_else(|| RateLimit::new(now));
        rate_limit.apply_token_max_limit(spec.token_max_limit);
        rate_limit.apply_request_max_limit(spec.request_max_limit);
        rate_limit.token_reset_duration = spec
            .token_reset_duration
            .as_deref()
            .map(parse_reset_duration)
            .transpose()?
            .filter(|seconds| *seconds > 0);
        rate_limit.request_reset_duration = spec
            .request_reset_duration
            .as_deref()
            .map(parse_reset_duration)
            .transpose()?
            .filter(|seconds| *seconds > 0);
        Ok(rate_limit)
    }

    fn build_provider_config(
        &self,
        spec: &ProviderConfigSpec,
        now: u64,
        deltas: &mut Vec<GovernanceDelta>,
    ) -> Result<ProviderConfig> {
        if spec.weight <= 0.0 {
            return Err(GatewayError::InvalidRequest {
                reason: format!("provider config {}: weight must be > 0", spec.provider),
            });
        }
        let budget_id = match &spec.budget {
            Some(budget_spec) => {
                let budget = self.build_budget(budget_spec, now)?;
                let id = budget.id.clone();
                deltas.push(GovernanceDelta::UpsertBudget(budget));
                Some(id)
            }
            None => None,
        };
        let rate_limit_id = match &spec.rate_limit {
            Some(rate_limit_spec) => {
                let rate_limit = self.rebuild_rate_limit(None, rate_limit_spec, now)?;
                let id = rate_limit.id.clone();
                deltas.push(GovernanceDelta::UpsertRateLimit(rate_limit));
                Some(id)
            }
            None => None,
        };
        Ok(ProviderConfig {
            id: new_entity_id(),
            provider: spec.provider.clone(),
            weight: spec.weight,
            budget_id,
            rate_limit_id,
            allowed_models: spec.allowed_models.clone(),
        })
    }

    pub async fn create_customer(&self, request: CreateCustomerRequest) -> Result<Customer> {
        let now = self.now();
        let mut deltas = Vec::new();
        let budget_id = match &request.budget {
            Some(spec) => {
                let budget = self.build_budget(spec, now)?;
                let id = budget.id.clone();
                deltas.push(GovernanceDelta::UpsertBudget(budget));
                Some(id)
            }
            None => None,
        };
        let customer = Customer {
            id: new_entity_id(),
            name: request.name,
            budget_id,
        };
        deltas.push(GovernanceDelta::UpsertCustomer(customer.clone()));
        self.persist_and_apply(deltas).await?;
        Ok(customer)
    }

    pub async fn update_customer(
        &self,
        id: &str,
        request: UpdateCustomerRequest,
    ) -> Result<Customer> {
        let now = self.now();
        let mut customer = self
            .store
            .customer(id)
            .ok_or_else(|| not_found("customer", id))?;
        let mut deltas = Vec::new();

        if let Some(name) = request.name {
            customer.name = name;
        }
        if let Some(spec) = &request.budget {
            let existing = customer
                .budget_id
                .as_deref()
                .and_then(|budget_id| self.store.budget_record(budget_id));
            let budget = self.rebuild_budget(existing, spec, now)?;
            customer.budget_id = Some(budget.id.clone());
            deltas.push(GovernanceDelta::UpsertBudget(budget));
        }

        deltas.push(GovernanceDelta::UpsertCustomer(customer.clone()));
        self.persist_and_apply(deltas).await?;
        Ok(customer)
    }

    pub async fn delete_customer(&self, id: &str) -> Result<()> {
        self.store
            .customer(id)
            .ok_or_else(|| not_found("customer", id))?;
        let deltas = self.store.cascade_delete_customer(id);
        self.persist_and_apply(deltas).await
    }

    pub async fn create_team(&self, request: CreateTeamRequest) -> Result<Team> {
        let now = self.now();
        if let Some(customer_id) = &request.customer_id {
            self.store
                .customer(customer_id)
                .ok_or_else(|| not_found("customer", customer_id))?;
        }
        let mut deltas = Vec::new();
        let budget_id = match &request.budget {
            Some(spec) => {
                let budget = self.build_budget(spec, now)?;
                let id = budget.id.clone();
                deltas.push(GovernanceDelta::UpsertBudget(budget));
                Some(id)
            }
            None => None,
        };
        let team = Team {
            id: new_entity_id(),
            name: request.name,
            customer_id: request.customer_id,
            budget_id,
        };
        deltas.push(GovernanceDelta::UpsertTeam(team.clone()));
        self.persist_and_apply(deltas).await?;
        Ok(team)
    }

    pub async fn update_team(&self, id: &str, request: UpdateTeamRequest) -> Result<Team> {
        let now = self.now();
        let mut team = self.store.team(id).ok_or_else(|| not_found("team", id))?;
        let mut deltas = Vec::new();

        if let Some(name) = request.name {
            team.name = name;
        }
        if let Some(customer_id) = request.customer_id {
            self.store
                .customer(&customer_id)
                .ok_or_else(|| not_found("customer", &customer_id))?;
            team.customer_id = Some(customer_id);
        }
        if let Some(spec) = &request.budget {
            let existing = team
                .budget_id
                .as_deref()
                .and_then(|budget_id| self.store.budget_record(budget_id));
            let budget = self.rebuild_budget(existing, spec, now)?;
            team.budget_id = Some(budget.id.clone());
            deltas.push(GovernanceDelta::UpsertBudget(budget));
        }

        deltas.push(GovernanceDelta::UpsertTeam(team.clone()));
        self.persist_and_apply(deltas).await?;
        Ok(team)
    }

    pub async fn delete_team(&self, id: &str) -> Result<()> {
        self.store.team(id).ok_or_else(|| not_found("team", id))?;
        let deltas = self.store.cascade_delete_team(id);
        self.persist_and_apply(deltas).await
    }

    pub async fn create_virtual_key(
        &self,
        request: CreateVirtualKeyRequest,
    ) -> Result<VirtualKey> {
        let now = self.now();
        if let Some(team_id) = &request.team_id {
            self.store
                .team(team_id)
                .ok_or_else(|| not_found("team", team_id))?;
        }

        let value = request
            .value
            .unwrap_or_else(|| format!("vk-{}", new_entity_id()));
        self.store.check_vk_value_unique(&value, "")?;

        let mut deltas = Vec::new();
        let budget_id = match &request.budget {
            Some(spec) => {
                let budget = self.build_budget(spec, now)?;
                let id = budget.id.clone();
                deltas.push(GovernanceDelta::UpsertBudget(budget));
                Some(id)
            }
            None => None,
        };
        let rate_limit_id = match &request.rate_limit {
            Some(spec) => {
                let rate_limit = self.rebuild_rate_limit(None, spec, now)?;
                let id = rate_limit.id.clone();
                deltas.push(GovernanceDelta::UpsertRateLimit(rate_limit));
                Some(id)
            }
            None => None,
        };
        let mut provider_configs = Vec::with_capacity(request.provider_configs.len());
        for spec in &request.provider_configs {
            provider_configs.push(self.build_provider_config(spec, now, &mut deltas)?);
        }

        let vk = VirtualKey {
            id: new_entity_id(),
            value,
            name: request.name,
            enabled: true,
            team_id: request.team_id,
            budget_id,
            rate_limit_id,
            provider_configs,
        };
        deltas.push(GovernanceDelta::UpsertVirtualKey(vk.clone()));
        self.persist_and_apply(deltas).await?;
        Ok(vk)
    }

    pub async fn update_virtual_key(
        &self,
        id: &str,
        request: UpdateVirtualKeyRequest,
    ) -> Result<VirtualKey> {
        let now = self.now();
        let mut vk = self
            .store
            .virtual_key(id)
            .ok_or_else(|| not_found("virtual key", id))?;
        let mut deltas = Vec::new();

        if let Some(name) = request.name {
            vk.name = name;
        }
        if let Some(enabled) = request.enabled {
            vk.enabled = enabled;
        }
        if let Some(team_id) = request.team_id {
            self.store
                .team(&team_id)
                .ok_or_else(|| not_found("team", &team_id))?;
            vk.team_id = Some(team_id);
        }
        if let Some(spec) = &request.budget {
            let existing = vk
                .budget_id
                .as_deref()
                .and_then(|budget_id| self.store.budget_record(budget_id));
            let budget = self.rebuild_budget(existing, spec, now)?;
            vk.budget_id = Some(budget.id.clone());
            deltas.push(GovernanceDelta::UpsertBudget(budget));
        }
        if let Some(spec) = &request.rate_limit {
            let existing = vk
                .rate_limit_id
                .as_deref()
                .and_then(|rate_limit_id| self.store.rate_limit_record(rate_limit_id));
            let rate_limit = self.rebuild_rate_limit(existing, spec, now)?;
            vk.rate_limit_id = Some(rate_limit.id.clone());
            deltas.push(GovernanceDelta::UpsertRateLimit(rate_limit));
        }
        if let Some(specs) = &request.provider_configs {
            // Replaced bindings' quota records have no other parent; reap
            // them in the same batch as the rewrite.
            for old in &vk.provider_configs {
                if let Some(id) = &old.budget_id {
                    deltas.push(GovernanceDelta::DeleteBudget { id: id.clone() });
                }
                if let Some(id) = &old.rate_limit_id {
                    deltas.push(GovernanceDelta::DeleteRateLimit { id: id.clone() });
                }
            }
            let mut provider_configs = Vec::with_capacity(specs.len());
            for spec in specs {
                provider_configs.push(self.build_provider_config(spec, now, &mut deltas)?);
            }
            vk.provider_configs = provider_configs;
        }

        deltas.push(GovernanceDelta::UpsertVirtualKey(vk.clone()));
        self.persist_and_apply(deltas).await?;
        Ok(vk)
    }

    pub async fn delete_virtual_key(&self, id: &str) -> Result<()> {
        self.store
            .virtual_key(id)
            .ok_or_else(|| not_found("virtual key", id))?;
        let deltas = self.store.cascade_delete_virtual_key(id);
        self.persist_and_apply(deltas).await
    }

    pub async fn update_budget(&self, id: &str, spec: BudgetSpec) -> Result<Budget> {
        let now = self.now();
        let existing = self
            .store
            .budget_record(id)
            .ok_or_else(|| not_found("budget", id))?;
        let budget = self.rebuild_budget(Some(existing), &spec, now)?;
        self.persist_and_apply(vec![GovernanceDelta::UpsertBudget(budget.clone())])
            .await?;
        Ok(budget)
    }

    pub async fn update_rate_limit(&self, id: &str, spec: RateLimitSpec) -> Result<RateLimit> {
        let now = self.now();
        let existing = self
            .store
            .rate_limit_record(id)
            .ok_or_else(|| not_found("rate limit", id))?;
        let rate_limit = self.rebuild_rate_limit(Some(existing), &spec, now)?;
        self.persist_and_apply(vec![GovernanceDelta::UpsertRateLimit(rate_limit.clone())])
            .await?;
        Ok(rate_limit)
    }
}

fn not_found(kind: &str, id: &str) -> GatewayError {
    GatewayError::EntityNotFound {
        kind: kind.to_string(),
        id: id.to_string(),
    }
}
