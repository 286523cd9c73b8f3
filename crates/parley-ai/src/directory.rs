use std::collections::HashMap;

use parking_lot::RwLock;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use parley_core::identity::Role;

/// Configuration for one selectable model, owned by an external store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model_id: String,
    /// Provider name used for credential lookup and dispatch ("anthropic", "openai").
    pub provider: String,
    /// The provider-side model identifier ("claude-sonnet-4-5", "gpt-4o").
    pub api_identifier: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    pub supports_tools: bool,
    pub allowed_roles: Vec<Role>,
    pub visible_to_client: bool,
}

impl ModelConfig {
    pub fn is_available_to(&self, role: Role) -> bool {
        self.visible_to_client && self.allowed_roles.contains(&role)
    }
}

/// External collaborator: resolves model configuration and provider
/// credentials. The core never stores credentials itself.
pub trait ModelDirectory: Send + Sync {
    fn model_config(&self, model_id: &str) -> Option<ModelConfig>;
    fn provider_credential(&self, provider: &str) -> Option<SecretString>;
    /// All configured models; handlers filter by role before exposing.
    fn list_models(&self) -> Vec<ModelConfig>;
}

/// In-process directory backed by maps. Used by the binary (populated from
/// the environment) and by tests.
#[derive(Default)]
pub struct StaticModelDirectory {
    models: RwLock<HashMap<String, ModelConfig>>,
    credentials: RwLock<HashMap<String, SecretString>>,
}

impl StaticModelDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_model(&self, config: ModelConfig) {
        self.models.write().insert(config.model_id.clone(), config);
    }

    pub fn add_credential(&self, provider: impl Into<String>, secret: SecretString) {
        self.credentials.write().insert(provider.into(), secret);
    }
}

impl ModelDirectory for StaticModelDirectory {
    fn model_config(&self, model_id: &str) -> Option<ModelConfig> {
        self.models.read().get(model_id).cloned()
    }

    fn provider_credential(&self, provider: &str) -> Option<SecretString> {
        self.credentials.read().get(provider).cloned()
    }

    fn list_models(&self) -> Vec<ModelConfig> {
        let mut models: Vec<ModelConfig> = self.models.read().values().cloned().collect();
        models.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        models
    }
}
