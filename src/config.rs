use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};

fn default_concurrency() -> usize {
    4
}

fn default_buffer_size() -> usize {
    64
}

fn default_request_timeout() -> u64 {
    30
}

/// Tunable surface of one upstream provider. Unknown fields are rejected so a
/// typo in an ops config fails loudly instead of silently using a default.
#[derive(Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderRuntimeConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_request_timeout")]
    pub default_request_timeout_in_seconds: u64,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub extra_headers: BTreeMap<String, String>,
    #[serde(default)]
    pub send_back_raw_response: bool,
    /// Operation gate, e.g. `{"chat_completion": true, "responses": false}`.
    /// Missing key = allowed.
    #[serde(default)]
    pub allowed_requests: BTreeMap<String, bool>,
    #[serde(default)]
    pub drop_excess_requests: bool,
}

impl Default for ProviderRuntimeConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            buffer_size: default_buffer_size(),
            default_request_timeout_in_seconds: default_request_timeout(),
            base_url: String::new(),
            extra_headers: BTreeMap::new(),
            send_back_raw_response: false,
            allowed_requests: BTreeMap::new(),
            drop_excess_requests: false,
        }
    }
}

impl std::fmt::Debug for ProviderRuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRuntimeConfig")
            .field("concurrency", &self.concurrency)
            .field("buffer_size", &self.buffer_size)
            .field(
                "default_request_timeout_in_seconds",
                &self.default_request_timeout_in_seconds,
            )
            .field("base_url", &self.base_url)
            .field("extra_headers", &"<redacted>")
            .field("send_back_raw_response", &self.send_back_raw_response)
            .field("allowed_requests", &self.allowed_requests)
            .field("drop_excess_requests", &self.drop_excess_requests)
            .finish()
    }
}

impl ProviderRuntimeConfig {
    pub fn validate(&self, provider: &str) -> Result<()> {
        if self.concurrency == 0 {
            return Err(GatewayError::InvalidRequest {
                reason: format!("provider {provider}: concurrency must be > 0"),
            });
        }
        if self.buffer_size < self.concurrency {
            return Err(GatewayError::InvalidRequest {
                reason: format!("provider {provider}: buffer_size must be >= concurrency"),
            });
        }
        if self.default_request_timeout_in_seconds == 0 {
            return Err(GatewayError::InvalidRequest {
                reason: format!(
                    "provider {provider}: default_request_timeout_in_seconds must be > 0"
                ),
            });
        }
        Ok(())
    }

    pub fn allows_operation(&self, operation: &str) -> bool {
        self.allowed_requests.get(operation).copied().unwrap_or(true)
    }
}

/// One upstream credential as configured: the secret plus its selection
/// weight and optional model allow-list.
#[derive(Clone, Serialize, Deserialize)]
pub struct CredentialKeyConfig {
    pub id: String,
    pub secret: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_models: Option<Vec<String>>,
}

fn default_weight() -> u32 {
    1
}

impl std::fmt::Debug for CredentialKeyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialKeyConfig")
            .field("id", &self.id)
            .field("secret", &"<redacted>")
            .field("weight", &self.weight)
            .field("allowed_models", &self.allowed_models)
            .finish()
    }
}

impl CredentialKeyConfig {
    pub fn new(id: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            secret: secret.into(),
            weight: 1,
            allowed_models: None,
        }
    }

    pub fn serves_model(&self, model: &str) -> bool {
        match &self.allowed_models {
            None => true,
            Some(models) => models.iter().any(|allowed| allowed == model),
        }
    }
}

/// Static configuration for one provider: runtime tunables plus its keys.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProviderEntryConfig {
    pub name: String,
    /// Wire dialect the upstream natively speaks: `chat_completions`
    /// (default) or `responses`.
    #[serde(default)]
    pub dialect: Option<String>,
    #[serde(default)]
    pub runtime: ProviderRuntimeConfig,
    #[serde(default)]
    pub keys: Vec<CredentialKeyConfig>,
}

/// Top-level gateway configuration loaded by the binary.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub providers: Vec<ProviderEntryConfig>,
    /// Bounded-latency usage flush interval, milliseconds.
    #[serde(default = "default_flush_interval_ms")]
    pub usage_flush_interval_ms: u64,
}

fn default_flush_interval_ms() -> u64 {
    1000
}

impl GatewayConfig {
    pub fn validate(&self) -> Result<()> {
        for provider in &self.providers {
            provider.runtime.validate(&provider.name)?;
            for key in &provider.keys {
                if key.weight == 0 {
                    return Err(GatewayError::InvalidRequest {
                        reason: format!(
                            "provider {}: key {} has zero weight",
                            provider.name, key.id
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}
