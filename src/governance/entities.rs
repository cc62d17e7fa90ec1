use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, QuotaScope, RateDimension, Result};

pub fn new_entity_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Parses a Go-style duration string (`"45s"`, `"30m"`, `"1h"`, `"1h30m"`)
/// into whole seconds. `"0"` means "never reset".
pub fn parse_reset_duration(raw: &str) -> Result<u64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(GatewayError::InvalidRequest {
            reason: "empty reset duration".to_string(),
        });
    }
    if raw == "0" {
        return Ok(0);
    }

    let mut total: u64 = 0;
    let mut digits = String::new();
    let mut saw_unit = false;
    for ch in raw.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        let value: u64 = digits.parse().map_err(|_| GatewayError::InvalidRequest {
            reason: format!("invalid reset duration: {raw}"),
        })?;
        digits.clear();
        saw_unit = true;
        let multiplier = match ch {
            's' => 1,
            'm' => 60,
            'h' => 3600,
            _ => {
                return Err(GatewayError::InvalidRequest {
                    reason: format!("invalid reset duration unit in: {raw}"),
                });
            }
        };
        total = total.saturating_add(value.saturating_mul(multiplier));
    }
    if !digits.is_empty() || !saw_unit {
        return Err(GatewayError::InvalidRequest {
            reason: format!("invalid reset duration: {raw}"),
        });
    }
    Ok(total)
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Customer {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_id: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Team {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_id: Option<String>,
}

/// Per-VK binding to one upstream provider, with its own quotas and weight.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    pub provider: String,
    pub weight: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_models: Option<Vec<String>>,
}

impl ProviderConfig {
    pub fn serves_model(&self, model: &str) -> bool {
        match &self.allowed_models {
            None => true,
            Some(models) => models.iter().any(|allowed| allowed == model),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct VirtualKey {
    pub id: String,
    /// The secret presented by clients. Globally unique.
    pub value: String,
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_id: Option<String>,
    #[serde(default)]
    pub provider_configs: Vec<ProviderConfig>,
}

fn default_enabled() -> bool {
    true
}

impl std::fmt::Debug for VirtualKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualKey")
            .field("id", &self.id)
            .field("value", &"<redacted>")
            .field("name", &self.name)
            .field("enabled", &self.enabled)
            .field("team_id", &self.team_id)
            .field("budget_id", &self.budget_id)
            .field("rate_limit_id", &self.rate_limit_id)
            .field("provider_configs", &self.provider_configs)
            .finish()
    }
}

/// Currency-denominated quota over a lazily-reset window.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Budget {
    pub id: String,
    pub max_limit: f64,
    #[serde(default)]
    pub current_usage: f64,
    /// Seconds; 0 means the window never resets.
    #[serde(default)]
    pub reset_duration: u64,
    #[serde(default)]
    pub last_reset_at: u64,
}

impl Budget {
    pub fn new(max_limit: f64, reset_duration: u64, now: u64) -> Self {
        Self {
            id: new_entity_id(),
            max_limit,
            current_usage: 0.0,
            reset_duration,
            last_reset_at: now,
        }
    }

    /// Stale windows always reset before any read.
    pub fn refresh(&mut self, now: u64) {
        if self.reset_duration > 0 && now.saturating_sub(self.last_reset_at) >= self.reset_duration
        {
            self.current_usage = 0.0;
            self.last_reset_at = now;
        }
    }

    pub fn check(&mut self, now: u64, scope: QuotaScope) -> Result<()> {
        self.refresh(now);
        if self.current_usage >= self.max_limit {
            return Err(GatewayError::BudgetExceeded {
                scope,
                limit: self.max_limit,
                usage: self.current_usage,
            });
        }
        Ok(())
    }

    pub fn spend(&mut self, now: u64, cost: f64) {
        self.refresh(now);
        self.current_usage += cost.max(0.0);
    }

    /// A max shrunk below current usage zeroes the usage in the same step.
    pub fn apply_max_limit(&mut self, new_max: f64) {
        if new_max < self.current_usage {
            self.current_usage = 0.0;
        }
        self.max_limit = new_max;
    }
}

/// Two independent counters (tokens, requests) with independent windows.
/// An unset dimension is unlimited.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RateLimit {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_max_limit: Option<u64>,
    #[serde(default)]
    pub token_current_usage: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_reset_duration: Option<u64>,
    #[serde(default)]
    pub token_last_reset_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_max_limit: Option<u64>,
    #[serde(default)]
    pub request_current_usage: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_reset_duration: Option<u64>,
    #[serde(default)]
    pub request_last_reset_at: u64,
}

impl RateLimit {
    pub fn new(now: u64) -> Self {
        Self {
            id: new_entity_id(),
            token_last_reset_at: now,
            request_last_reset_at: now,
            ..Self::default()
        }
    }

    fn window_elapsed(last_reset_at: u64, duration: Option<u64>, now: u64) -> bool {
        match duration {
            Some(duration) if duration > 0 => now.saturating_sub(last_reset_at) >= duration,
            _ => false,
        }
    }

    pub fn refresh(&mut self, now: u64) {
        if Self::window_elapsed(self.token_last_reset_at, self.token_reset_duration, now) {
            self.token_current_usage = 0;
            self.token_last_reset_at = now;
        }
        if Self::window_elapsed(self.request_last_reset_at, self.request_reset_duration, now) {
            self.request_current_usage = 0;
            self.request_last_reset_at = now;
        }
    }

    /// Seconds until the request window rolls over, for `Retry-After` hints.
    fn request_window_remaining(&self, now: u64) -> Option<u64> {
        let duration = self.request_reset_duration.filter(|d| *d > 0)?;
        let end = self.request_last_reset_at.saturating_add(duration);
        Some(end.saturating_sub(now))
    }

    /// Post-hoc check: compares counters accumulated by *previous* requests,
    /// so the request that crosses a limit is still admitted.
    pub fn check(&mut self, now: u64, scope: QuotaScope) -> Result<()> {
        self.refresh(now);

        if let Some(limit) = self.request_max_limit {
            if self.request_current_usage >= limit {
                return Err(GatewayError::RateLimited {
                    scope,
                    dimension: RateDimension::Requests,
                    limit,
                    usage: self.request_current_usage,
                    retry_after_seconds: self.request_window_remaining(now),
                });
            }
        }

        if let Some(limit) = self.token_max_limit {
            if self.token_current_usage >= limit {
                return Err(GatewayError::RateLimited {
                    scope,
                    dimension: RateDimension::Tokens,
                    limit,
                    usage: self.token_current_usage,
                    retry_after_seconds: None,
                });
            }
        }

        Ok(())
    }

    pub fn record(&mut self, now: u64, tokens: u64) {
        self.refresh(now);
        self.request_current_usage = self.request_current_usage.saturating_add(1);
        self.token_current_usage = self.token_current_usage.saturating_add(tokens);
    }

    pub fn apply_token_max_limit(&mut self, new_max: Option<u64>) {
        if let Some(new_max) = new_max {
            if new_max < self.token_current_usage {
                self.token_current_usage = 0;
            }
        }
        self.token_max_limit = new_max;
    }

    pub fn apply_request_max_limit(&mut self, new_max: Option<u64>) {
        if let Some(new_max) = new_max {
            if new_max < self.request_current_usage {
                self.request_current_usage = 0;
            }
        }
        self.request_max_limit = new_max;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_and_compound_durations() {
        assert_eq!(parse_reset_duration("45s").unwrap(), 45);
        assert_eq!(parse_reset_duration("30m").unwrap(), 1800);
        assert_eq!(parse_reset_duration("1h").unwrap(), 3600);
        assert_eq!(parse_reset_duration("1h30m").unwrap(), 5400);
        assert_eq!(parse_reset_duration("0").unwrap(), 0);
        assert!(parse_reset_duration("1d").is_err());
        assert!(parse_reset_duration("90").is_err());
        assert!(parse_reset_duration("").is_err());
    }

    #[test]
    fn budget_resets_after_window_elapses() {
        let mut budget = Budget::new(10.0, 3600, 100);
        budget.spend(100, 4.0);
        assert_eq!(budget.current_usage, 4.0);

        budget.refresh(100 + 3599);
        assert_eq!(budget.current_usage, 4.0);

        budget.refresh(100 + 3600);
        assert_eq!(budget.current_usage, 0.0);
        assert_eq!(budget.last_reset_at, 3700);
    }

    #[test]
    fn zero_duration_budget_never_resets() {
        let mut budget = Budget::new(10.0, 0, 100);
        budget.spend(100, 4.0);
        budget.refresh(u64::MAX);
        assert_eq!(budget.current_usage, 4.0);
    }

    #[test]
    fn budget_shrink_below_usage_resets_usage() {
        let mut budget = Budget::new(10.0, 3600, 0);
        budget.spend(0, 6.0);

        budget.apply_max_limit(5.0);
        assert_eq!(budget.max_limit, 5.0);
        assert_eq!(budget.current_usage, 0.0);
    }

    #[test]
    fn budget_grow_or_equal_keeps_usage() {
        let mut budget = Budget::new(10.0, 3600, 0);
        budget.spend(0, 6.0);

        budget.apply_max_limit(6.0);
        assert_eq!(budget.current_usage, 6.0);
        budget.apply_max_limit(20.0);
        assert_eq!(budget.current_usage, 6.0);
    }

    #[test]
    fn rate_limit_dimensions_reset_independently() {
        let mut limit = RateLimit::new(0);
        limit.token_max_limit = Some(100);
        limit.token_reset_duration = Some(60);
        limit.request_max_limit = Some(10);
        limit.request_reset_duration = Some(3600);
        limit.record(0, 50);

        limit.refresh(60);
        assert_eq!(limit.token_current_usage, 0);
        assert_eq!(limit.request_current_usage, 1);
    }

    #[test]
    fn rate_limit_check_is_post_hoc() {
        let mut limit = RateLimit::new(0);
        limit.request_max_limit = Some(1);
        limit.request_reset_duration = Some(3600);

        // Counter is still zero: first request passes even though it will
        // bring usage to the limit.
        assert!(limit.check(0, QuotaScope::VirtualKey).is_ok());
        limit.record(0, 10);

        let err = limit.check(1, QuotaScope::VirtualKey).unwrap_err();
        match err {
            GatewayError::RateLimited {
                dimension,
                retry_after_seconds,
                ..
            } => {
                assert_eq!(dimension, RateDimension::Requests);
                assert_eq!(retry_after_seconds, Some(3599));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn token_shrink_resets_only_token_dimension() {
        let mut limit = RateLimit::new(0);
        limit.token_max_limit = Some(10_000);
        limit.request_max_limit = Some(100);
        limit.record(0, 50);

        limit.apply_token_max_limit(Some(40));
        assert_eq!(limit.token_current_usage, 0);
        assert_eq!(limit.token_max_limit, Some(40));
        assert_eq!(limit.request_current_usage, 1);

        limit.apply_request_max_limit(Some(100));
        assert_eq!(limit.request_current_usage, 1);
    }

    #[test]
    fn request_shrink_resets_only_request_dimension() {
        let mut limit = RateLimit::new(0);
        limit.token_max_limit = Some(10_000);
        limit.request_max_limit = Some(100);
        limit.record(0, 50);
        limit.record(0, 50);

        limit.apply_request_max_limit(Some(1));
        assert_eq!(limit.request_current_usage, 0);
        assert_eq!(limit.request_max_limit, Some(1));
        assert_eq!(limit.token_current_usage, 100);
    }
}
