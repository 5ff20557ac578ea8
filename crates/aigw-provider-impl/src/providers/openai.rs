//! Direct OpenAI-compatible upstream (bearer key).

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use aigw_protocol::Dialect;
use aigw_provider_core::{
    AdapterError, AdapterResult, ChunkReceiver, CredentialConfig, ServiceAdapter,
};

use crate::http_client::{client_for, request_json, request_sse};

const DEFAULT_BASE_URL: &str = "https://api.openai.com";

pub struct OpenAIAdapter {
    config: CredentialConfig,
    system_proxy: bool,
}

impl OpenAIAdapter {
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
            .ok_or_else(|| AdapterError::Auth("openai credential has no api key".to_string()))
    }

    fn client(&self) -> AdapterResult<wreq::Client> {
        client_for(self.config.proxy_url.as_deref(), self.system_proxy)
    }

    fn prepare(&self, model: &str, body: &JsonValue, stream: bool) -> JsonValue {
        let mut body = body.clone();
        body["model"] = JsonValue::String(model.to_string());
        if stream {
            body["stream"] = JsonValue::Bool(true);
        } else if let Some(map) = body.as_object_mut() {
            map.remove("stream");
        }
        body
    }
}

#[async_trait]
impl ServiceAdapter for OpenAIAdapter {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn dialect(&self) -> Dialect {
        Dialect::OpenAI
    }

    async fn list_models(&self) -> AdapterResult<Vec<String>> {
        let url = format!("{}/v1/models", self.base_url());
        let response = request_json(
            self.client()?
                .get(url)
                .bearer_auth(self.api_key()?),
            "openai.models",
        )
        .await?;
        Ok(response["data"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item["id"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn generate_content(&self, model: &str, body: &JsonValue) -> AdapterResult<JsonValue> {
        let url = format!("{}/v1/chat/completions", self.base_url());
        request_json(
            self.client()?
                .post(url)
                .bearer_auth(self.api_key()?)
                .json(&self.prepare(model, body, false)),
            "openai.chat",
        )
        .await
    }

    async fn generate_content_stream(
        &self,
        model: &str,
        body: &JsonValue,
    ) -> AdapterResult<ChunkReceiver> {
        let url = format!("{}/v1/chat/completions", self.base_url());
        request_sse(
            self.client()?
                .post(url)
                .bearer_auth(self.api_key()?)
                .json(&self.prepare(model, body, true)),
            "openai.chat_stream",
        )
        .await
    }
}
