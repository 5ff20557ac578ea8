//! Qwen OAuth upstream: token refresh before use, OpenAI-compatible wire.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::OnceLock;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use time::OffsetDateTime;
use tracing::warn;

use aigw_protocol::Dialect;
use aigw_provider_core::{
    AdapterError, AdapterResult, ChunkReceiver, CredentialConfig, ServiceAdapter,
};

use crate::credential_file::{
    expires_within, format_expires_at, get_str, read_credential_file, update_credential_file,
};
use crate::http_client::{client_for, request_json, request_sse};

const DEFAULT_BASE_URL: &str = "https://portal.qwen.ai";
const TOKEN_URL: &str = "https://chat.qwen.ai/api/v1/oauth2/token";
const CLIENT_ID: &str = "f0304373b74a44d2b584a3fb70ca9e56";
/// Refresh when the stored token expires within this window.
const REFRESH_THRESHOLD_SECS: i64 = 120;

#[derive(Clone, Debug)]
struct CachedToken {
    access_token: String,
    expires_at: Option<OffsetDateTime>,
}

static TOKEN_CACHE: OnceLock<tokio::sync::RwLock<HashMap<String, CachedToken>>> = OnceLock::new();

fn token_cache() -> &'static tokio::sync::RwLock<HashMap<String, CachedToken>> {
    TOKEN_CACHE.get_or_init(|| tokio::sync::RwLock::new(HashMap::new()))
}

fn token_fresh(token: &CachedToken) -> bool {
    match token.expires_at {
        Some(at) => at - OffsetDateTime::now_utc() > time::Duration::seconds(REFRESH_THRESHOLD_SECS),
        None => false,
    }
}

pub struct QwenAdapter {
    config: CredentialConfig,
    credential_path: PathBuf,
    system_proxy: bool,
}

impl QwenAdapter {
    pub fn new(
        config: CredentialConfig,
        credentials_dir: &std::path::Path,
        system_proxy: bool,
    ) -> Self {
        let credential_path = config
            .credential_file
            .as_deref()
            .map(PathBuf::from)
            .unwrap_or_else(|| credentials_dir.join("qwen-oauth.json"));
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

    /// Serve from the in-process cache, fall back to the credential file, and
    /// refresh through the OAuth endpoint when near expiry.  A pending
    /// `needs_refresh` flag on the pool entry bypasses both shortcuts.
    async fn ensure_token(&self) -> AdapterResult<String> {
        let forced = self.config.counters.needs_refresh;
        if !forced
            && let Some(cached) = token_cache().read().await.get(&self.config.uuid).cloned()
            && token_fresh(&cached)
        {
            return Ok(cached.access_token);
        }

        let doc = read_credential_file(&self.credential_path).await?;
        if !forced
            && !expires_within(&doc, REFRESH_THRESHOLD_SECS)
            && let Some(token) = get_str(&doc, &["access_token", "accessToken"])
        {
            let cached = CachedToken {
                access_token: token.to_string(),
                expires_at: crate::credential_file::get_expires_at(&doc),
            };
            token_cache()
                .write()
                .await
                .insert(self.config.uuid.clone(), cached.clone());
            return Ok(cached.access_token);
        }

        let refresh_token = get_str(&doc, &["refresh_token", "refreshToken"])
            .ok_or_else(|| AdapterError::Auth("qwen credential has no refresh token".to_string()))?
            .to_string();
        self.refresh(&refresh_token).await
    }

    async fn refresh(&self, refresh_token: &str) -> AdapterResult<String> {
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", CLIENT_ID),
        ];
        let response = request_json(
            self.client()?.post(TOKEN_URL).form(&form),
            "qwen.oauth_token",
        )
        .await
        .map_err(|err| match err {
            // A rejected refresh token is an auth failure, not an upstream 4xx.
            AdapterError::Http { status: 400, body, .. } => {
                AdapterError::Auth(format!("qwen refresh rejected: {body}"))
            }
            other => other,
        })?;

        let access_token = response["access_token"]
            .as_str()
            .ok_or_else(|| {
                AdapterError::Auth("qwen refresh response missing access_token".to_string())
            })?
            .to_string();
        let expires_at = response["expires_in"]
            .as_i64()
            .map(|seconds| OffsetDateTime::now_utc() + time::Duration::seconds(seconds));
        let new_refresh = response["refresh_token"].as_str().map(str::to_string);

        let persist_token = access_token.clone();
        let result = update_credential_file(&self.credential_path, |doc| {
            doc["access_token"] = JsonValue::String(persist_token);
            if let Some(refresh) = new_refresh {
                doc["refresh_token"] = JsonValue::String(refresh);
            }
            if let Some(at) = expires_at {
                doc["expiresAt"] = JsonValue::String(format_expires_at(at));
            }
        })
        .await;
        if let Err(err) = result {
            warn!(event = "qwen.persist_failed", error = %err);
        }

        token_cache().write().await.insert(
            self.config.uuid.clone(),
            CachedToken {
                access_token: access_token.clone(),
                expires_at,
            },
        );
        Ok(access_token)
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
impl ServiceAdapter for QwenAdapter {
    fn name(&self) -> &'static str {
        "qwen"
    }

    fn dialect(&self) -> Dialect {
        Dialect::OpenAI
    }

    async fn list_models(&self) -> AdapterResult<Vec<String>> {
        // The portal has no model-listing endpoint worth trusting; the
        // catalog is stable.
        Ok(vec![
            "qwen3-coder-plus".to_string(),
            "qwen3-coder-flash".to_string(),
            "vision-model".to_string(),
        ])
    }

    async fn generate_content(&self, model: &str, body: &JsonValue) -> AdapterResult<JsonValue> {
        let token = self.ensure_token().await?;
        let url = format!("{}/v1/chat/completions", self.base_url());
        request_json(
            self.client()?
                .post(url)
                .bearer_auth(token)
                .json(&self.prepare(model, body, false)),
            "qwen.chat",
        )
        .await
    }

    async fn generate_content_stream(
        &self,
        model: &str,
        body: &JsonValue,
    ) -> AdapterResult<ChunkReceiver> {
        let token = self.ensure_token().await?;
        let url = format!("{}/v1/chat/completions", self.base_url());
        request_sse(
            self.client()?
                .post(url)
                .bearer_auth(token)
                .json(&self.prepare(model, body, true)),
            "qwen.chat_stream",
        )
        .await
    }
}
