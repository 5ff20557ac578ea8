//! Adapter registry: provider type string -> concrete adapter.
//!
//! The provider family is the prefix left of the first hyphen
//! (`kiro-oauth` -> `kiro`), matching how the dialect strategies dispatch.

use std::sync::Arc;

use async_trait::async_trait;

use aigw_common::GatewayConfig;
use aigw_provider_core::{
    AdapterError, AdapterResult, CredentialConfig, HealthProbe, ProviderPoolManager,
    ServiceAdapter,
};

use crate::providers::claude::ClaudeAdapter;
use crate::providers::gemini::GeminiAdapter;
use crate::providers::kiro::KiroAdapter;
use crate::providers::openai::OpenAIAdapter;
use crate::providers::orchids::{OrchidsAdapter, OrchidsSettings};
use crate::providers::qwen::QwenAdapter;
use crate::providers::warp::WarpAdapter;

pub fn provider_family(provider_type: &str) -> &str {
    provider_type.split('-').next().unwrap_or(provider_type)
}

pub struct AdapterRegistry {
    config: Arc<GatewayConfig>,
}

impl AdapterRegistry {
    pub fn new(config: Arc<GatewayConfig>) -> Self {
        Self { config }
    }

    pub fn build(
        &self,
        provider_type: &str,
        mut credential: CredentialConfig,
    ) -> AdapterResult<Arc<dyn ServiceAdapter>> {
        // Per-provider proxy from the gateway config unless the entry pins
        // its own.
        if credential.proxy_url.is_none()
            && let Some(proxy) = self.config.provider_proxies.get(provider_type)
        {
            credential.proxy_url = Some(proxy.clone());
        }
        let system_proxy = self.config.use_system_proxy;
        let credentials_dir = self.config.credentials_dir.as_path();

        let adapter: Arc<dyn ServiceAdapter> = match provider_family(provider_type) {
            "openai" => Arc::new(OpenAIAdapter::new(credential, system_proxy)),
            "claude" => Arc::new(ClaudeAdapter::new(credential, system_proxy)),
            "gemini" => Arc::new(GeminiAdapter::new(credential, system_proxy)),
            "qwen" => Arc::new(QwenAdapter::new(credential, credentials_dir, system_proxy)),
            "kiro" => Arc::new(KiroAdapter::new(credential, credentials_dir, system_proxy)),
            "warp" => Arc::new(WarpAdapter::new(credential, credentials_dir, system_proxy)),
            "orchids" => Arc::new(OrchidsAdapter::new(
                credential,
                credentials_dir,
                OrchidsSettings {
                    emit_fs_tool_use: self.config.emit_fs_tool_use,
                    allow_run_command: self.config.allow_run_command,
                    fs_working_dir: self.config.fs_working_dir.clone(),
                    system_proxy,
                },
            )),
            other => {
                return Err(AdapterError::Other(format!(
                    "no adapter for provider type {other}"
                )));
            }
        };
        Ok(adapter)
    }
}

/// Health probe backed by the registry: build the adapter for the pool entry
/// and ask it for its model catalog.
pub struct RegistryHealthProbe {
    registry: Arc<AdapterRegistry>,
    pool: Arc<ProviderPoolManager>,
}

impl RegistryHealthProbe {
    pub fn new(registry: Arc<AdapterRegistry>, pool: Arc<ProviderPoolManager>) -> Self {
        Self { registry, pool }
    }
}

#[async_trait]
impl HealthProbe for RegistryHealthProbe {
    async fn probe(&self, provider_type: &str, uuid: &str) -> AdapterResult<String> {
        let credential = self
            .pool
            .get(provider_type, uuid)
            .await
            .ok_or_else(|| AdapterError::Other(format!("unknown credential {uuid}")))?;
        let adapter = self.registry.build(provider_type, credential)?;
        let models = adapter.list_models().await?;
        models
            .into_iter()
            .next()
            .ok_or_else(|| AdapterError::Other("provider returned no models".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn family_is_the_prefix_left_of_the_first_hyphen() {
        assert_eq!(provider_family("kiro-oauth"), "kiro");
        assert_eq!(provider_family("openai-custom"), "openai");
        assert_eq!(provider_family("warp"), "warp");
    }
}
