use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use parley_core::errors::ProviderError;
use parley_core::provider::ChatProvider;

use crate::directory::ModelDirectory;
use crate::{AnthropicProvider, OpenAiProvider};

/// Lazily constructs and memoizes one provider client per provider name.
/// Credentials come from the directory at first use, so clients are only
/// built for providers that are actually configured.
pub struct ProviderCache {
    directory: Arc<dyn ModelDirectory>,
    providers: DashMap<String, Arc<dyn ChatProvider>>,
}

impl ProviderCache {
    pub fn new(directory: Arc<dyn ModelDirectory>) -> Self {
        Self {
            directory,
            providers: DashMap::new(),
        }
    }

    /// Get or build the client for a provider name.
    pub fn resolve(&self, provider: &str) -> Result<Arc<dyn ChatProvider>, ProviderError> {
        if let Some(existing) = self.providers.get(provider) {
            return Ok(existing.clone());
        }

        let credential = self.directory.provider_credential(provider).ok_or_else(|| {
            ProviderError::AuthenticationFailed(format!("no credential configured for {provider}"))
        })?;

        let built: Arc<dyn ChatProvider> = match provider {
            "anthropic" => Arc::new(AnthropicProvider::new(credential)?),
            "openai" => Arc::new(OpenAiProvider::new(credential)?),
            other => {
                return Err(ProviderError::InvalidRequest(format!(
                    "unsupported provider: {other}"
                )))
            }
        };

        debug!(provider, "constructed provider client");
        self.providers.insert(provider.to_string(), built.clone());
        Ok(built)
    }

    /// Install a pre-built provider under a name. Tests use this to route
    /// a model through a mock instead of a real HTTP client.
    pub fn install(&self, provider: impl Into<String>, client: Arc<dyn ChatProvider>) {
        self.providers.insert(provider.into(), client);
    }
}
