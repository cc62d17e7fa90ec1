//! Admission and usage recording over a resolved quota chain.
//!
//! Enforcement is post-hoc: counters are compared before admission but only
//! incremented after the response (or terminal stream chunk) arrives, so the
//! request that crosses a limit is still served and its successor is denied.

use crate::Result;

use super::store::ResolvedRequest;

/// Flat per-token rate used when the upstream reports no cost. Deliberately a
/// single constant so the same token count always produces the same charge.
pub const FALLBACK_COST_PER_TOKEN: f64 = 2e-6;

pub fn estimate_cost(total_tokens: u64) -> f64 {
    total_tokens as f64 * FALLBACK_COST_PER_TOKEN
}

/// Checks every quota on the chain, most specific scope first. The first
/// exhausted quota denies the request with its scope; budgets are checked
/// before rate limits at the same level, and the two rate dimensions are
/// independent.
pub fn admit(resolved: &ResolvedRequest, now: u64) -> Result<()> {
    for entry in &resolved.chain {
        if let Some(budget) = &entry.budget {
            budget.lock().expect("budget lock").check(now, entry.scope)?;
        }
        if let Some(rate_limit) = &entry.rate_limit {
            rate_limit
                .lock()
                .expect("rate limit lock")
                .check(now, entry.scope)?;
        }
    }
    Ok(())
}

/// Applies usage to every quota on the chain after a successful response.
/// Returns the cost charged (reported by the upstream, or estimated from
/// tokens when the upstream is silent).
pub fn record(resolved: &ResolvedRequest, now: u64, tokens: u64, cost: Option<f64>) -> f64 {
    let cost = cost.unwrap_or_else(|| estimate_cost(tokens));
    for entry in &resolved.chain {
        if let Some(budget) = &entry.budget {
            budget.lock().expect("budget lock").spend(now, cost);
        }
        if let Some(rate_limit) = &entry.rate_limit {
            rate_limit.lock().expect("rate limit lock").record(now, tokens);
        }
    }
    cost
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{GatewayError, QuotaScope};
    use crate::governance::entities::{Budget, ProviderConfig, RateLimit, Team, VirtualKey, new_entity_id};
    use crate::governance::store::{GovernanceDelta, GovernanceStore};
    use crate::types::ModelRef;

    fn model() -> ModelRef {
        ModelRef::parse("openai/gpt-4o").unwrap()
    }

    fn base_vk(value: &str) -> VirtualKey {
        VirtualKey {
            id: new_entity_id(),
            value: value.to_string(),
            name: value.to_string(),
            enabled: true,
            team_id: None,
            budget_id: None,
            rate_limit_id: None,
            provider_configs: Vec::new(),
        }
    }

    #[test]
    fn crossing_request_is_admitted_and_successor_denied() {
        let store = GovernanceStore::new();
        let mut limit = RateLimit::new(0);
        limit.token_max_limit = Some(100);
        let mut vk = base_vk("vk-posthoc");
        vk.rate_limit_id = Some(limit.id.clone());
        store.apply_all(&[
            GovernanceDelta::UpsertRateLimit(limit),
            GovernanceDelta::UpsertVirtualKey(vk),
        ]);

        let resolved = store.resolve("vk-posthoc", &model()).unwrap();
        assert!(admit(&resolved, 0).is_ok());
        // This single response blows straight through the limit.
        record(&resolved, 0, 250, None);

        let err = admit(&resolved, 1).unwrap_err();
        assert!(matches!(
            err,
            GatewayError::RateLimited {
                scope: QuotaScope::VirtualKey,
                ..
            }
        ));
    }

    #[test]
    fn exhausted_team_budget_reports_team_scope() {
        let store = GovernanceStore::new();
        let vk_budget = Budget::new(100.0, 0, 0);
        let mut team_budget = Budget::new(0.5, 0, 0);
        team_budget.current_usage = 0.5;
        let customer_budget = Budget::new(100.0, 0, 0);

        let customer = crate::governance::entities::Customer {
            id: "cust".to_string(),
            name: "cust".to_string(),
            budget_id: Some(customer_budget.id.clone()),
        };
        let team = Team {
            id: "team".to_string(),
            name: "team".to_string(),
            customer_id: Some(customer.id.clone()),
            budget_id: Some(team_budget.id.clone()),
        };
        let mut vk = base_vk("vk-team-budget");
        vk.team_id = Some(team.id.clone());
        vk.budget_id = Some(vk_budget.id.clone());

        store.apply_all(&[
            GovernanceDelta::UpsertBudget(vk_budget),
            GovernanceDelta::UpsertBudget(team_budget),
            GovernanceDelta::UpsertBudget(customer_budget),
            GovernanceDelta::UpsertCustomer(customer),
            GovernanceDelta::UpsertTeam(team),
            GovernanceDelta::UpsertVirtualKey(vk),
        ]);

        let resolved = store.resolve("vk-team-budget", &model()).unwrap();
        let err = admit(&resolved, 0).unwrap_err();
        assert!(matches!(
            err,
            GatewayError::BudgetExceeded {
                scope: QuotaScope::Team,
                ..
            }
        ));
    }

    #[test]
    fn provider_config_limit_trips_before_vk_limit() {
        let store = GovernanceStore::new();
        let mut vk_limit = RateLimit::new(0);
        vk_limit.request_max_limit = Some(5);
        let mut pc_limit = RateLimit::new(0);
        pc_limit.request_max_limit = Some(2);

        let mut vk = base_vk("vk-both");
        vk.rate_limit_id = Some(vk_limit.id.clone());
        vk.provider_configs.push(ProviderConfig {
            id: new_entity_id(),
            provider: "openai".to_string(),
            weight: 1.0,
            budget_id: None,
            rate_limit_id: Some(pc_limit.id.clone()),
            allowed_models: None,
        });

        store.apply_all(&[
            GovernanceDelta::UpsertRateLimit(vk_limit),
            GovernanceDelta::UpsertRateLimit(pc_limit),
            GovernanceDelta::UpsertVirtualKey(vk),
        ]);

        for _ in 0..2 {
            let resolved = store.resolve("vk-both", &model()).unwrap();
            admit(&resolved, 0).unwrap();
            record(&resolved, 0, 10, None);
        }

        let resolved = store.resolve("vk-both", &model()).unwrap();
        let err = admit(&resolved, 0).unwrap_err();
        assert!(matches!(
            err,
            GatewayError::RateLimited {
                scope: QuotaScope::ProviderConfig,
                ..
            }
        ));
    }

    #[test]
    fn record_charges_reported_cost_over_estimate() {
        let store = GovernanceStore::new();
        let budget = Budget::new(10.0, 0, 0);
        let budget_id = budget.id.clone();
        let mut vk = base_vk("vk-cost");
        vk.budget_id = Some(budget_id.clone());
        store.apply_all(&[
            GovernanceDelta::UpsertBudget(budget),
            GovernanceDelta::UpsertVirtualKey(vk),
        ]);

        let resolved = store.resolve("vk-cost", &model()).unwrap();
        let charged = record(&resolved, 0, 1000, Some(0.25));
        assert_eq!(charged, 0.25);
        assert_eq!(store.budget_record(&budget_id).unwrap().current_usage, 0.25);

        let estimated = record(&resolved, 0, 1000, None);
        assert_eq!(estimated, estimate_cost(1000));
    }
}
