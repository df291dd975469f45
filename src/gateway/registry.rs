//! Provider registry: deterministic model-to-provider routing.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use super::canned::{CannedProvider, DEFAULT_MODEL};
use super::provider::Provider;
use super::upstream::OpenAiUpstream;
use crate::config::ProvidersConfig;
use crate::error::GatewayError;

struct RegisteredProvider {
    provider: Arc<dyn Provider>,
    /// Declared model ids. Empty means catch-all.
    models: Vec<String>,
}

/// Entry for the `/v1/models` listing.
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub id: String,
    pub created: u64,
    pub owned_by: String,
}

/// All registered providers, in declaration order.
///
/// Routing is deterministic: providers declaring the exact model id win
/// first, in registration order; catch-all providers come after, in
/// registration order. The resulting sequence doubles as the failover
/// chain.
pub struct ProviderRegistry {
    entries: Vec<RegisteredProvider>,
    created: u64,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            created: Utc::now().timestamp().max(0) as u64,
        }
    }

    pub fn register(&mut self, provider: Arc<dyn Provider>, models: Vec<String>) {
        self.entries.push(RegisteredProvider { provider, models });
    }

    /// Build the registry from `PROVIDER_{NAME}_*` configuration.
    ///
    /// Providers without a base URL, and a fully provider-less
    /// configuration, fall back to the deterministic canned backend so
    /// the gateway stays serviceable offline.
    pub fn from_config(config: &ProvidersConfig) -> Result<Self, GatewayError> {
        let mut registry = Self::new();
        for provider_config in &config.providers {
            let models = provider_config.models.clone();
            match &provider_config.base_url {
                Some(base_url) => {
                    let provider = OpenAiUpstream::new(
                        provider_config.name.clone(),
                        base_url.clone(),
                        provider_config.api_key.clone(),
                    )?;
                    registry.register(Arc::new(provider), models);
                }
                None => {
                    tracing::warn!(
                        provider = %provider_config.name,
                        "provider has no base URL, serving it from the canned backend"
                    );
                    let models = if models.is_empty() {
                        vec![DEFAULT_MODEL.to_string()]
                    } else {
                        models
                    };
                    registry.register(
                        Arc::new(CannedProvider::new(provider_config.name.clone())),
                        models,
                    );
                }
            }
        }

        if registry.entries.is_empty() {
            tracing::warn!(
                "no providers configured, routing all models to the canned backend"
            );
            registry.register(Arc::new(CannedProvider::new("local")), Vec::new());
        }
        Ok(registry)
    }

    /// The failover chain for a model: exact matches first, then
    /// catch-alls.
    pub fn resolve(&self, model: &str) -> Vec<Arc<dyn Provider>> {
        let exact = self
            .entries
            .iter()
            .filter(|e| e.models.iter().any(|m| m == model));
        let catch_all = self.entries.iter().filter(|e| e.models.is_empty());
        exact
            .chain(catch_all)
            .map(|e| Arc::clone(&e.provider))
            .collect()
    }

    /// Declared models for the listing endpoint.
    pub fn models(&self) -> Vec<ModelInfo> {
        let mut models: Vec<ModelInfo> = self
            .entries
            .iter()
            .flat_map(|entry| {
                let owner = entry.provider.name().to_string();
                let declared: Vec<String> = if entry.models.is_empty() {
                    vec![DEFAULT_MODEL.to_string()]
                } else {
                    entry.models.clone()
                };
                declared.into_iter().map(move |id| ModelInfo {
                    id,
                    created: self.created,
                    owned_by: owner.clone(),
                })
            })
            .collect();
        models.dedup_by(|a, b| a.id == b.id);
        models
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}
