//! Direct Gemini GenerateContent upstream.

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use aigw_protocol::Dialect;
use aigw_provider_core::{
    AdapterError, AdapterResult, ChunkReceiver, CredentialConfig, ServiceAdapter,
};

use crate::http_client::{client_for, request_json, request_sse};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

pub struct GeminiAdapter {
    config: CredentialConfig,
    system_proxy: bool,
}

impl GeminiAdapter {
    pub fn new(config: CredentialConfig, system_proxy: bool) -> Self {
        Self {
            config,
            system_proxy,
        }
    }

    fn base_url(&self) -> &str {
        self.config
            .base_url
            .as_deref()
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/')
    }

    fn api_key(&self) -> AdapterResult<&str> {
        self.config
            .api_key
            .as_deref()
            .filter(|key| !key.is_empty())
            .ok_or_else(|| AdapterError::Auth("gemini credential has no api key".to_string()))
    }

    fn client(&self) -> AdapterResult<wreq::Client> {
        client_for(self.config.proxy_url.as_deref(), self.system_proxy)
    }
}

#[async_trait]
impl ServiceAdapter for GeminiAdapter {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn dialect(&self) -> Dialect {
        Dialect::Gemini
    }

    async fn list_models(&self) -> AdapterResult<Vec<String>> {
        let url = format!("{}/v1beta/models", self.base_url());
        let response = request_json(
            self.client()?
                .get(url)
                .header("x-goog-api-key", self.api_key()?),
            "gemini.models",
        )
        .await?;
        Ok(response["models"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item["name"].as_str())
                    .map(|name| name.trim_start_matches("models/").to_string())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn generate_content(&self, model: &str, body: &JsonValue) -> AdapterResult<JsonValue> {
        let url = format!("{}/v1beta/models/{model}:generateContent", self.base_url());
        request_json(
            self.client()?
                .post(url)
                .header("x-goog-api-key", self.api_key()?)
                .json(body),
            "gemini.generate",
        )
        .await
    }

    async fn generate_content_stream(
        &self,
        model: &str,
        body: &JsonValue,
    ) -> AdapterResult<ChunkReceiver> {
        let url = format!(
            "{}/v1beta/models/{model}:streamGenerateContent?alt=sse",
            self.base_url()
        );
        request_sse(
            self.client()?
                .post(url)
                .header("x-goog-api-key", self.api_key()?)
                .json(body),
            "gemini.generate_stream",
        )
        .await
    }
}
