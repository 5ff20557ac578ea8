//! Warp upstream: an HTTP/2 agent service with its own request envelope and
//! a fixed model catalog.
//!
//! The wire schema is owned by the service; this adapter only builds the
//! request envelope and unwraps streamed events back into OpenAI-shaped
//! chunks, so everything above it treats Warp as an OpenAI dialect.

use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use aigw_protocol::Dialect;
use aigw_provider_core::{
    AdapterError, AdapterResult, ChunkReceiver, CredentialConfig, ServiceAdapter,
};

use crate::credential_file::{expires_within, get_str, read_credential_file};
use crate::http_client::{client_for, request_json, request_sse};

const DEFAULT_BASE_URL: &str = "https://app.warp.dev/ai/multi-agent";

/// Catalog is fixed; routing consults it first when resolving bare model
/// names.
pub const CATALOG: &[&str] = &[
    "auto",
    "gpt-5",
    "gpt-5-mini",
    "claude-4-sonnet",
    "claude-4-opus",
    "claude-4.5-sonnet",
    "gemini-2.5-pro",
    "o3",
    "o4-mini",
];

pub fn catalog_contains(model: &str) -> bool {
    CATALOG.iter().any(|known| *known == model)
}

pub struct WarpAdapter {
    config: CredentialConfig,
    credential_path: PathBuf,
    system_proxy: bool,
}

impl WarpAdapter {
    pub fn new(
        config: CredentialConfig,
        credentials_dir: &std::path::Path,
        system_proxy: bool,
    ) -> Self {
        let credential_path = config
            .credential_file
            .as_deref()
            .map(PathBuf::from)
            .unwrap_or_else(|| credentials_dir.join("warp-auth.json"));
        Self {
            config,
            credential_path,
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

    fn client(&self) -> AdapterResult<wreq::Client> {
        client_for(self.config.proxy_url.as_deref(), self.system_proxy)
    }

    async fn token(&self) -> AdapterResult<String> {
        let doc = read_credential_file(&self.credential_path).await?;
        let token = get_str(&doc, &["accessToken", "access_token", "idToken"])
            .ok_or_else(|| AdapterError::Auth("warp credential has no access token".to_string()))?;
        if expires_within(&doc, 0) {
            return Err(AdapterError::Auth("warp access token expired".to_string()));
        }
        Ok(token.to_string())
    }

    /// The service accepts one task envelope per request; the OpenAI body
    /// travels inside it and the conversation id is fresh per call.
    fn envelope(&self, model: &str, body: &JsonValue, stream: bool) -> JsonValue {
        let mut inner = body.clone();
        inner["model"] = JsonValue::String(model.to_string());
        if let Some(map) = inner.as_object_mut() {
            map.remove("stream");
        }
        serde_json::json!({
            "task_context": {
                "conversation_id": Uuid::new_v4().to_string(),
                "active_task_id": Uuid::new_v4().to_string(),
            },
            "settings": {
                "model": model,
                "streaming": stream,
            },
            "input": inner,
        })
    }

    fn request(&self, builder: wreq::RequestBuilder, token: &str) -> wreq::RequestBuilder {
        builder
            .bearer_auth(token)
            .header("content-type", "application/json")
            .header("x-warp-client-version", "v0.2025.09")
            .header("x-warp-os-category", "Linux")
    }
}

/// Streamed events arrive wrapped; unwrap down to the OpenAI chunk the rest
/// of the pipeline understands.  Unknown envelope shapes pass through
/// untouched so the stream lift can drop them.
pub(crate) fn unwrap_event(data: &str) -> Option<String> {
    let value: JsonValue = serde_json::from_str(data).ok()?;
    if let Some(chunk) = value.get("chunk").or_else(|| value.get("payload")) {
        return Some(chunk.to_string());
    }
    Some(data.to_string())
}

#[async_trait]
impl ServiceAdapter for WarpAdapter {
    fn name(&self) -> &'static str {
        "warp"
    }

    fn dialect(&self) -> Dialect {
        Dialect::Warp
    }

    async fn list_models(&self) -> AdapterResult<Vec<String>> {
        Ok(CATALOG.iter().map(|model| model.to_string()).collect())
    }

    async fn generate_content(&self, model: &str, body: &JsonValue) -> AdapterResult<JsonValue> {
        let token = self.token().await?;
        let response = request_json(
            self.request(self.client()?.post(self.base_url()), &token)
                .json(&self.envelope(model, body, false)),
            "warp.agent",
        )
        .await?;
        Ok(response
            .get("result")
            .or_else(|| response.get("payload"))
            .cloned()
            .unwrap_or(response))
    }

    async fn generate_content_stream(
        &self,
        model: &str,
        body: &JsonValue,
    ) -> AdapterResult<ChunkReceiver> {
        let token = self.token().await?;
        let upstream = request_sse(
            self.request(self.client()?.post(self.base_url()), &token)
                .header("accept", "text/event-stream")
                .json(&self.envelope(model, body, true)),
            "warp.agent_stream",
        )
        .await?;

        // Re-wrap the channel so consumers only ever see unwrapped chunks.
        let (tx, rx) = tokio::sync::mpsc::channel(32);
        tokio::spawn(async move {
            let mut upstream = upstream;
            while let Some(item) = upstream.recv().await {
                let forwarded = match item {
                    Ok(data) => match unwrap_event(&data) {
                        Some(chunk) => Ok(chunk),
                        None => continue,
                    },
                    Err(err) => Err(err),
                };
                if tx.send(forwarded).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_lookup_is_exact() {
        assert!(catalog_contains("gpt-5"));
        assert!(catalog_contains("claude-4.5-sonnet"));
        assert!(!catalog_contains("gpt-5-turbo-preview"));
    }

    #[test]
    fn unwrap_prefers_inner_chunk() {
        let wrapped = r#"{"chunk": {"id": "c1", "choices": []}}"#;
        let inner = unwrap_event(wrapped).unwrap();
        assert!(inner.contains("\"id\":\"c1\""));

        let bare = r#"{"id": "c2", "choices": []}"#;
        assert_eq!(unwrap_event(bare).unwrap(), bare);
    }
}
