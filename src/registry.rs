use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;

use crate::Result;
use crate::config::{CredentialKeyConfig, ProviderRuntimeConfig};
use crate::error::GatewayError;
use crate::providers::Provider;

pub struct RegisteredProvider {
    pub adapter: Arc<dyn Provider>,
    pub runtime: ProviderRuntimeConfig,
    pub keys: Vec<CredentialKeyConfig>,
}

/// Maps provider names to their wire adapter, runtime tunables, and
/// credential keys. Key selection is weighted random over the keys whose
/// allow-list admits the requested model; key saturation is the dispatcher's
/// concern, not the registry's.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, RegisteredProvider>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        adapter: Arc<dyn Provider>,
        runtime: ProviderRuntimeConfig,
        keys: Vec<CredentialKeyConfig>,
    ) -> Result<()> {
        let name = name.into();
        runtime.validate(&name)?;
        for key in &keys {
            if key.weight == 0 {
                return Err(GatewayError::InvalidRequest {
                    reason: format!("provider {name}: key {} has zero weight", key.id),
                });
            }
        }
        self.providers.insert(
            name,
            RegisteredProvider {
                adapter,
                runtime,
                keys,
            },
        );
        Ok(())
    }

    pub fn get(&self, provider: &str) -> Result<&RegisteredProvider> {
        self.providers
            .get(provider)
            .ok_or_else(|| GatewayError::ProviderNotFound {
                provider: provider.to_string(),
            })
    }

    pub fn provider_names(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }

    /// Weighted-random pick among the keys that can serve `model`. An empty
    /// candidate set is fatal for this provider; only a fallback can rescue
    /// the request.
    pub fn select_key(&self, provider: &str, model: &str) -> Result<CredentialKeyConfig> {
        let registered = self.get(provider)?;
        let candidates: Vec<&CredentialKeyConfig> = registered
            .keys
            .iter()
            .filter(|key| key.weight > 0)
            .filter(|key| key.serves_model(model))
            .collect();

        if candidates.is_empty() {
            return Err(GatewayError::NoKeyForModel {
                provider: provider.to_string(),
                model: model.to_string(),
            });
        }
        if candidates.len() == 1 {
            return Ok(candidates[0].clone());
        }

        let total: u64 = candidates.iter().map(|key| u64::from(key.weight)).sum();
        let mut pick = rand::rng().random_range(0..total);
        for key in &candidates {
            let weight = u64::from(key.weight);
            if pick < weight {
                return Ok((*key).clone());
            }
            pick -= weight;
        }
        Ok(candidates[candidates.len() - 1].clone())
    }
}
