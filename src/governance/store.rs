use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, QuotaScope, Result};
use crate::types::ModelRef;

use super::entities::{Budget, Customer, ProviderConfig, RateLimit, Team, VirtualKey};

/// One structural or quota mutation, as persisted and as applied in memory.
/// Control-plane writes persist a batch of these before the store applies
/// them; startup replays the persisted set.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum GovernanceDelta {
    UpsertCustomer(Customer),
    DeleteCustomer { id: String },
    UpsertTeam(Team),
    DeleteTeam { id: String },
    UpsertVirtualKey(VirtualKey),
    DeleteVirtualKey { id: String },
    UpsertBudget(Budget),
    DeleteBudget { id: String },
    UpsertRateLimit(RateLimit),
    DeleteRateLimit { id: String },
}

/// Quota records are individually locked so data-plane usage increments
/// serialize per entity while the structural tables stay readable.
type Shared<T> = Arc<Mutex<T>>;

#[derive(Default)]
struct Tables {
    customers: HashMap<String, Customer>,
    teams: HashMap<String, Team>,
    virtual_keys: HashMap<String, VirtualKey>,
    budgets: HashMap<String, Shared<Budget>>,
    rate_limits: HashMap<String, Shared<RateLimit>>,
    // Derived indices, rebuilt on any hierarchy mutation.
    vk_id_by_value: HashMap<String, String>,
    team_ids_by_customer: HashMap<String, Vec<String>>,
    vk_ids_by_team: HashMap<String, Vec<String>>,
}

impl Tables {
    fn rebuild_indices(&mut self) {
        self.vk_id_by_value.clear();
        self.team_ids_by_customer.clear();
        self.vk_ids_by_team.clear();

        for team in self.teams.values() {
            if let Some(customer_id) = &team.customer_id {
                self.team_ids_by_customer
                    .entry(customer_id.clone())
                    .or_default()
                    .push(team.id.clone());
            }
        }
        for vk in self.virtual_keys.values() {
            self.vk_id_by_value.insert(vk.value.clone(), vk.id.clone());
            if let Some(team_id) = &vk.team_id {
                self.vk_ids_by_team
                    .entry(team_id.clone())
                    .or_default()
                    .push(vk.id.clone());
            }
        }
    }

}

/// One level of the quota hierarchy a request inherits.
#[derive(Clone, Debug)]
pub struct QuotaChainEntry {
    pub scope: QuotaScope,
    pub budget: Option<Shared<Budget>>,
    pub rate_limit: Option<Shared<RateLimit>>,
}

/// Everything the data plane needs after VK resolution: the identity, the
/// provider binding chosen for this request, and the quota chain ordered
/// most-specific-first.
#[derive(Clone, Debug)]
pub struct ResolvedRequest {
    pub vk_id: String,
    pub provider: String,
    pub model: String,
    pub provider_config_id: Option<String>,
    pub chain: Vec<QuotaChainEntry>,
}

impl ResolvedRequest {
    /// IDs of every quota record on the chain, for coalesced flushing.
    pub fn touched_quota_ids(&self) -> (Vec<String>, Vec<String>) {
        let mut budgets = Vec::new();
        let mut rate_limits = Vec::new();
        for entry in &self.chain {
            if let Some(budget) = &entry.budget {
                budgets.push(budget.lock().expect("budget lock").id.clone());
            }
            if let Some(rate_limit) = &entry.rate_limit {
                rate_limits.push(rate_limit.lock().expect("rate limit lock").id.clone());
            }
        }
        (budgets, rate_limits)
    }
}

/// Administrative snapshot; keyed maps use the §6 wire names.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GovernanceDump {
    pub virtual_keys: BTreeMap<String, VirtualKey>,
    pub teams: BTreeMap<String, Team>,
    pub customers: BTreeMap<String, Customer>,
    pub budgets: BTreeMap<String, Budget>,
    pub rate_limits: BTreeMap<String, RateLimit>,
}

/// The authoritative runtime copy of all governance entities. Single writer
/// per entity: structural mutations take the outer write lock, usage
/// increments take the per-record mutex under the outer read lock. The outer
/// lock is never held across `.await`.
#[derive(Default)]
pub struct GovernanceStore {
    tables: RwLock<Tables>,
}

impl GovernanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&self, delta: &GovernanceDelta) {
        let mut tables = self.tables.write().expect("governance tables poisoned");
        match delta {
            GovernanceDelta::UpsertCustomer(customer) => {
                tables.customers.insert(customer.id.clone(), customer.clone());
            }
            GovernanceDelta::DeleteCustomer { id } => {
                tables.customers.remove(id);
            }
            GovernanceDelta::UpsertTeam(team) => {
                tables.teams.insert(team.id.clone(), team.clone());
            }
            GovernanceDelta::DeleteTeam { id } => {
                tables.teams.remove(id);
            }
            GovernanceDelta::UpsertVirtualKey(vk) => {
                tables.virtual_keys.insert(vk.id.clone(), vk.clone());
            }
            GovernanceDelta::DeleteVirtualKey { id } => {
                tables.virtual_keys.remove(id);
            }
            GovernanceDelta::UpsertBudget(budget) => {
                match tables.budgets.get(&budget.id) {
                    Some(existing) => {
                        *existing.lock().expect("budget lock") = budget.clone();
                    }
                    None => {
                        tables
                            .budgets
                            .insert(budget.id.clone(), Arc::new(Mutex::new(budget.clone())));
                    }
                }
            }
            GovernanceDelta::DeleteBudget { id } => {
                tables.budgets.remove(id);
            }
            GovernanceDelta::UpsertRateLimit(rate_limit) => {
                match tables.rate_limits.get(&rate_limit.id) {
                    Some(existing) => {
                        *existing.lock().expect("rate limit lock") = rate_limit.clone();
                    }
                    None => {
                        tables.rate_limits.insert(
                            rate_limit.id.clone(),
                            Arc::new(Mutex::new(rate_limit.clone())),
                        );
                    }
                }
            }
            GovernanceDelta::DeleteRateLimit { id } => {
                tables.rate_limits.remove(id);
            }
        }
        tables.rebuild_indices();
    }

    pub fn apply_all(&self, deltas: &[GovernanceDelta]) {
        for delta in deltas {
            self.apply(delta);
        }
    }

    /// The VK value must be globally unique; rejects an insert that would
    /// shadow another key's value.
    pub fn check_vk_value_unique(&self, value: &str, own_id: &str) -> Result<()> {
        let tables = self.tables.read().expect("governance tables poisoned");
        match tables.vk_id_by_value.get(value) {
            Some(existing) if existing != own_id => Err(GatewayError::InvalidRequest {
                reason: "virtual key value already in use".to_string(),
            }),
            _ => Ok(()),
        }
    }

    pub fn customer(&self, id: &str) -> Option<Customer> {
        let tables = self.tables.read().expect("governance tables poisoned");
        tables.customers.get(id).cloned()
    }

    pub fn team(&self, id: &str) -> Option<Team> {
        let tables = self.tables.read().expect("governance tables poisoned");
        tables.teams.get(id).cloned()
    }

    pub fn virtual_key(&self, id: &str) -> Option<VirtualKey> {
        let tables = self.tables.read().expect("governance tables poisoned");
        tables.virtual_keys.get(id).cloned()
    }

    pub fn virtual_key_by_value(&self, value: &str) -> Option<VirtualKey> {
        let tables = self.tables.read().expect("governance tables poisoned");
        let id = tables.vk_id_by_value.get(value)?;
        tables.virtual_keys.get(id).cloned()
    }

    pub fn budget_record(&self, id: &str) -> Option<Budget> {
        let tables = self.tables.read().expect("governance tables poisoned");
        let record = tables.budgets.get(id)?;
        Some(record.lock().expect("budget lock").clone())
    }

    pub fn rate_limit_record(&self, id: &str) -> Option<RateLimit> {
        let tables = self.tables.read().expect("governance tables poisoned");
        let record = tables.rate_limits.get(id)?;
        Some(record.lock().expect("rate limit lock").clone())
    }

    /// Resolves the presented VK value and picks the provider config that will
    /// serve this request, returning the quota chain most-specific-first
    /// (provider-config, VK, team, customer).
    pub fn resolve(&self, vk_value: &str, model: &ModelRef) -> Result<ResolvedRequest> {
        let tables = self.tables.read().expect("governance tables poisoned");

        let vk_id = tables
            .vk_id_by_value
            .get(vk_value)
            .ok_or(GatewayError::Unauthorized)?;
        let vk = tables
            .virtual_keys
            .get(vk_id)
            .ok_or(GatewayError::Unauthorized)?;
        if !vk.enabled {
            return Err(GatewayError::Unauthorized);
        }

        let provider_config = select_provider_config(vk, model)?;

        let mut chain = Vec::with_capacity(4);
        if let Some(pc) = provider_config {
            chain.push(QuotaChainEntry {
                scope: QuotaScope::ProviderConfig,
                budget: lookup_quota(&tables.budgets, pc.budget_id.as_deref()),
                rate_limit: lookup_quota(&tables.rate_limits, pc.rate_limit_id.as_deref()),
            });
        }
        chain.push(QuotaChainEntry {
            scope: QuotaScope::VirtualKey,
            budget: lookup_quota(&tables.budgets, vk.budget_id.as_deref()),
            rate_limit: lookup_quota(&tables.rate_limits, vk.rate_limit_id.as_deref()),
        });

        let team = vk
            .team_id
            .as_deref()
            .and_then(|team_id| tables.teams.get(team_id));
        if let Some(team) = team {
            chain.push(QuotaChainEntry {
                scope: QuotaScope::Team,
                budget: lookup_quota(&tables.budgets, team.budget_id.as_deref()),
                rate_limit: None,
            });
            let customer = team
                .customer_id
                .as_deref()
                .and_then(|customer_id| tables.customers.get(customer_id));
            if let Some(customer) = customer {
                chain.push(QuotaChainEntry {
                    scope: QuotaScope::Customer,
                    budget: lookup_quota(&tables.budgets, customer.budget_id.as_deref()),
                    rate_limit: None,
                });
            }
        }

        Ok(ResolvedRequest {
            vk_id: vk.id.clone(),
            provider: model.provider.clone(),
            model: model.model.clone(),
            provider_config_id: provider_config.map(|pc| pc.id.clone()),
            chain,
        })
    }

    /// Deltas that remove an entity and everything hanging off it, including
    /// quota records no parent references afterwards. The caller persists the
    /// batch before applying it.
    pub fn cascade_delete_customer(&self, id: &str) -> Vec<GovernanceDelta> {
        let tables = self.tables.read().expect("governance tables poisoned");
        let mut deltas = Vec::new();
        for team_id in tables.team_ids_by_customer.get(id).into_iter().flatten() {
            for vk_id in tables.vk_ids_by_team.get(team_id).into_iter().flatten() {
                deltas.push(GovernanceDelta::DeleteVirtualKey { id: vk_id.clone() });
            }
            deltas.push(GovernanceDelta::DeleteTeam { id: team_id.clone() });
        }
        deltas.push(GovernanceDelta::DeleteCustomer { id: id.to_string() });
        drop(tables);
        self.append_orphan_reaps(&mut deltas);
        deltas
    }

    pub fn cascade_delete_team(&self, id: &str) -> Vec<GovernanceDelta> {
        let tables = self.tables.read().expect("governance tables poisoned");
        let mut deltas = Vec::new();
        for vk_id in tables.vk_ids_by_team.get(id).into_iter().flatten() {
            deltas.push(GovernanceDelta::DeleteVirtualKey { id: vk_id.clone() });
        }
        deltas.push(GovernanceDelta::DeleteTeam { id: id.to_string() });
        drop(tables);
        self.append_orphan_reaps(&mut deltas);
        deltas
    }

    pub fn cascade_delete_virtual_key(&self, id: &str) -> Vec<GovernanceDelta> {
        let mut deltas = vec![GovernanceDelta::DeleteVirtualKey { id: id.to_string() }];
        self.append_orphan_reaps(&mut deltas);
        deltas
    }

    /// Quota records orphaned once `pending` is applied are reaped in the
    /// same batch.
    fn append_orphan_reaps(&self, pending: &mut Vec<GovernanceDelta>) {
        let tables = self.tables.read().expect("governance tables poisoned");

        let removed_customers: HashSet<String> = pending
            .iter()
            .filter_map(|d| match d {
                GovernanceDelta::DeleteCustomer { id } => Some(id.clone()),
                _ => None,
            })
            .collect();
        let removed_teams: HashSet<String> = pending
            .iter()
            .filter_map(|d| match d {
                GovernanceDelta::DeleteTeam { id } => Some(id.clone()),
                _ => None,
            })
            .collect();
        let removed_vks: HashSet<String> = pending
            .iter()
            .filter_map(|d| match d {
                GovernanceDelta::DeleteVirtualKey { id } => Some(id.clone()),
                _ => None,
            })
            .collect();

        let mut budgets = HashSet::new();
        let mut rate_limits = HashSet::new();
        for customer in tables.customers.values() {
            if removed_customers.contains(customer.id.as_str()) {
                continue;
            }
            budgets.extend(customer.budget_id.iter().cloned());
        }
        for team in tables.teams.values() {
            if removed_teams.contains(team.id.as_str()) {
                continue;
            }
            budgets.extend(team.budget_id.iter().cloned());
        }
        for vk in tables.virtual_keys.values() {
            if removed_vks.contains(vk.id.as_str()) {
                continue;
            }
            budgets.extend(vk.budget_id.iter().cloned());
            rate_limits.extend(vk.rate_limit_id.iter().cloned());
            for pc in &vk.provider_configs {
                budgets.extend(pc.budget_id.iter().cloned());
                rate_limits.extend(pc.rate_limit_id.iter().cloned());
            }
        }

        for id in tables.budgets.keys() {
            if !budgets.contains(id) {
                pending.push(GovernanceDelta::DeleteBudget { id: id.clone() });
            }
        }
        for id in tables.rate_limits.keys() {
            if !rate_limits.contains(id) {
                pending.push(GovernanceDelta::DeleteRateLimit { id: id.clone() });
            }
        }
    }

    /// A consistent point-in-time snapshot. Takes the writer side of the
    /// table lock so no usage increment or structural write can interleave.
    pub fn dump(&self, now: u64) -> GovernanceDump {
        let tables = self.tables.write().expect("governance tables poisoned");
        let mut dump = GovernanceDump::default();

        for (id, customer) in &tables.customers {
            dump.customers.insert(id.clone(), customer.clone());
        }
        for (id, team) in &tables.teams {
            dump.teams.insert(id.clone(), team.clone());
        }
        for vk in tables.virtual_keys.values() {
            dump.virtual_keys.insert(vk.value.clone(), vk.clone());
        }
        for (id, budget) in &tables.budgets {
            let mut budget = budget.lock().expect("budget lock").clone();
            budget.refresh(now);
            dump.budgets.insert(id.clone(), budget);
        }
        for (id, rate_limit) in &tables.rate_limits {
            let mut rate_limit = rate_limit.lock().expect("rate limit lock").clone();
            rate_limit.refresh(now);
            dump.rate_limits.insert(id.clone(), rate_limit);
        }
        dump
    }

    /// Full persisted state as a delta batch, for seeding a fresh config
    /// store or a state file.
    pub fn export_deltas(&self) -> Vec<GovernanceDelta> {
        let tables = self.tables.read().expect("governance tables poisoned");
        let mut deltas = Vec::new();
        for customer in tables.customers.values() {
            deltas.push(GovernanceDelta::UpsertCustomer(customer.clone()));
        }
        for team in tables.teams.values() {
            deltas.push(GovernanceDelta::UpsertTeam(team.clone()));
        }
        for vk in tables.virtual_keys.values() {
            deltas.push(GovernanceDelta::UpsertVirtualKey(vk.clone()));
        }
        for budget in tables.budgets.values() {
            deltas.push(GovernanceDelta::UpsertBudget(
                budget.lock().expect("budget lock").clone(),
            ));
        }
        for rate_limit in tables.rate_limits.values() {
            deltas.push(GovernanceDelta::UpsertRateLimit(
                rate_limit.lock().expect("rate limit lock").clone(),
            ));
        }
        deltas
    }
}

fn lookup_quota<T>(table: &HashMap<String, Shared<T>>, id: Option<&str>) -> Option<Shared<T>> {
    table.get(id?).cloned()
}

/// Weighted-random choice among the VK's provider configs that can serve the
/// requested model. A VK with no provider configs is unconstrained; a VK
/// whose configs all exclude the request is rejected.
fn select_provider_config<'a>(
    vk: &'a VirtualKey,
    model: &ModelRef,
) -> Result<Option<&'a ProviderConfig>> {
    if vk.provider_configs.is_empty() {
        return Ok(None);
    }

    let candidates: Vec<&ProviderConfig> = vk
        .provider_configs
        .iter()
        .filter(|pc| pc.provider == model.provider && pc.weight > 0.0)
        .filter(|pc| pc.serves_model(&model.model))
        .collect();

    if candidates.is_empty() {
        return Err(GatewayError::InvalidRequest {
            reason: format!("virtual key has no provider config serving {model}"),
        });
    }
    if candidates.len() == 1 {
        return Ok(Some(candidates[0]));
    }

    let total: f64 = candidates.iter().map(|pc| pc.weight).sum();
    let mut pick = rand::random::<f64>() * total;
    for pc in candidates.iter().copied() {
        if pick < pc.weight {
            return Ok(Some(pc));
        }
        pick -= pc.weight;
    }
    Ok(Some(candidates[candidates.len() - 1]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::governance::entities::new_entity_id;

    fn vk_with_value(value: &str) -> VirtualKey {
        VirtualKey {
            id: new_entity_id(),
            value: value.to_string(),
            name: format!("vk-{value}"),
            enabled: true,
            team_id: None,
            budget_id: None,
            rate_limit_id: None,
            provider_configs: Vec::new(),
        }
    }

    #[test]
    fn resolve_unknown_value_is_unauthorized() {
        let store = GovernanceStore::new();
        let model = ModelRef::parse("openai/gpt-4o").unwrap();
        let err = store.resolve("nope", &model).unwrap_err();
        assert!(matches!(err, GatewayError::Unauthorized));
    }

    #[test]
    fn resolve_disabled_key_is_unauthorized() {
        let store = GovernanceStore::new();
        let mut vk = vk_with_value("vk-disabled");
        vk.enabled = false;
        store.apply(&GovernanceDelta::UpsertVirtualKey(vk));

        let model = ModelRef::parse("openai/gpt-4o").unwrap();
        let err = store.resolve("vk-disabled", &model).unwrap_err();
        assert!(matches!(err, GatewayError::Unauthorized));
    }

    #[test]
    fn resolve_walks_the_ancestor_chain() {
        let store = GovernanceStore::new();
        let customer_budget = Budget::new(100.0, 0, 0);
        let team_budget = Budget::new(50.0, 0, 0);
        let customer = Customer {
            id: "cust-1".to_string(),
            name: "acme".to_string(),
            budget_id: Some(customer_budget.id.clone()),
        };
        let team = Team {
            id: "team-1".to_string(),
            name: "search".to_string(),
            customer_id: Some(customer.id.clone()),
            budget_id: Some(team_budget.id.clone()),
        };
        let mut vk = vk_with_value("vk-chain");
        vk.team_id = Some(team.id.clone());

        store.apply_all(&[
            GovernanceDelta::UpsertBudget(customer_budget),
            GovernanceDelta::UpsertBudget(team_budget),
            GovernanceDelta::UpsertCustomer(customer),
            GovernanceDelta::UpsertTeam(team),
            GovernanceDelta::UpsertVirtualKey(vk),
        ]);

        let model = ModelRef::parse("openai/gpt-4o").unwrap();
        let resolved = store.resolve("vk-chain", &model).unwrap();
        let scopes: Vec<QuotaScope> = resolved.chain.iter().map(|entry| entry.scope).collect();
        assert_eq!(
            scopes,
            vec![QuotaScope::VirtualKey, QuotaScope::Team, QuotaScope::Customer]
        );
        assert!(resolved.chain[1].budget.is_some());
        assert!(resolved.chain[2].budget.is_some());
    }

    #[test]
    fn provider_config_allow_list_rejects_unlisted_model() {
        let store = GovernanceStore::new();
        let mut vk = vk_with_value("vk-pc");
        vk.provider_configs.push(ProviderConfig {
            id: new_entity_id(),
            provider: "openai".to_string(),
            weight: 1.0,
            budget_id: None,
            rate_limit_id: None,
            allowed_models: Some(vec!["gpt-4o-mini".to_string()]),
        });
        store.apply(&GovernanceDelta::UpsertVirtualKey(vk));

        let allowed = ModelRef::parse("openai/gpt-4o-mini").unwrap();
        assert!(store.resolve("vk-pc", &allowed).is_ok());

        let denied = ModelRef::parse("openai/gpt-4o").unwrap();
        assert!(store.resolve("vk-pc", &denied).is_err());
    }

    #[test]
    fn cascade_team_delete_reaps_orphaned_quotas() {
        let store = GovernanceStore::new();
        let vk_limit = RateLimit::new(0);
        let team = Team {
            id: "team-1".to_string(),
            name: "search".to_string(),
            customer_id: None,
            budget_id: None,
        };
        let mut vk = vk_with_value("vk-cascade");
        vk.team_id = Some(team.id.clone());
        vk.rate_limit_id = Some(vk_limit.id.clone());
        let limit_id = vk_limit.id.clone();

        store.apply_all(&[
            GovernanceDelta::UpsertRateLimit(vk_limit),
            GovernanceDelta::UpsertTeam(team),
            GovernanceDelta::UpsertVirtualKey(vk),
        ]);

        let deltas = store.cascade_delete_team("team-1");
        store.apply_all(&deltas);

        assert!(store.team("team-1").is_none());
        assert!(store.virtual_key_by_value("vk-cascade").is_none());
        assert!(store.rate_limit_record(&limit_id).is_none());
        assert!(
            deltas
                .iter()
                .any(|d| matches!(d, GovernanceDelta::DeleteRateLimit { id } if *id == limit_id))
        );
    }

    #[test]
    fn dump_is_keyed_by_vk_value_and_refreshes_windows() {
        let store = GovernanceStore::new();
        let mut limit = RateLimit::new(0);
        limit.token_max_limit = Some(100);
        limit.token_reset_duration = Some(60);
        limit.token_current_usage = 40;
        let limit_id = limit.id.clone();
        let mut vk = vk_with_value("vk-dump");
        vk.rate_limit_id = Some(limit_id.clone());

        store.apply_all(&[
            GovernanceDelta::UpsertRateLimit(limit),
            GovernanceDelta::UpsertVirtualKey(vk),
        ]);

        let stale = store.dump(59);
        assert_eq!(stale.rate_limits[&limit_id].token_current_usage, 40);
        assert!(stale.virtual_keys.contains_key("vk-dump"));

        let fresh = store.dump(60);
        assert_eq!(fresh.rate_limits[&limit_id].token_current_usage, 0);
    }

    #[test]
    fn vk_value_uniqueness_is_enforced() {
        let store = GovernanceStore::new();
        let vk = vk_with_value("shared-value");
        let vk_id = vk.id.clone();
        store.apply(&GovernanceDelta::UpsertVirtualKey(vk));

        assert!(store.check_vk_value_unique("shared-value", &vk_id).is_ok());
        assert!(store.check_vk_value_unique("shared-value", "other-id").is_err());
        assert!(store.check_vk_value_unique("fresh-value", "other-id").is_ok());
    }
}
