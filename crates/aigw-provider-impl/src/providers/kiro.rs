//! Kiro OAuth upstream.  Auth method decides the refresh route (social
//! broker vs IdC); the wire is Claude Messages behind a bearer token.

use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tracing::warn;

use aigw_protocol::Dialect;
use aigw_provider_core::{
    AdapterError, AdapterResult, AuthMethod, ChunkReceiver, CredentialConfig, ServiceAdapter,
};

use crate::credential_file::{
    expires_within, format_expires_at, get_str, read_credential_file, update_credential_file,
};
use crate::http_client::{client_for, request_json, request_sse};

const DEFAULT_BASE_URL: &str = "https://codewhisperer.us-east-1.amazonaws.com";
const SOCIAL_REFRESH_URL: &str = "https://prod.us-east-1.auth.desktop.kiro.dev/refreshToken";
const IDC_REFRESH_URL: &str = "https://oidc.us-east-1.amazonaws.com/token";
const REFRESH_THRESHOLD_SECS: i64 = 300;

const MODELS: &[&str] = &[
    "claude-sonnet-4-5-20250929",
    "claude-sonnet-4-20250514",
    "claude-3-7-sonnet-20250219",
    "claude-haiku-4-5-20251001",
];

pub struct KiroAdapter {
    config: CredentialConfig,
    credential_path: PathBuf,
    system_proxy: bool,
}

impl KiroAdapter {
    pub fn new(
        config: CredentialConfig,
        credentials_dir: &std::path::Path,
        system_proxy: bool,
    ) -> Self {
        let credential_path = config
            .credential_file
            .as_deref()
            .map(PathBuf::from)
            .unwrap_or_else(|| credentials_dir.join("kiro-auth-token.json"));
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

    async fn ensure_token(&self) -> AdapterResult<String> {
        let doc = read_credential_file(&self.credential_path).await?;
        if !self.config.counters.needs_refresh
            && !expires_within(&doc, REFRESH_THRESHOLD_SECS)
            && let Some(token) = get_str(&doc, &["accessToken", "access_token"])
        {
            return Ok(token.to_string());
        }
        let refresh_token = get_str(&doc, &["refreshToken", "refresh_token"])
            .ok_or_else(|| AdapterError::Auth("kiro credential has no refresh token".to_string()))?
            .to_string();
        self.refresh(&doc, &refresh_token).await
    }

    async fn refresh(&self, doc: &JsonValue, refresh_token: &str) -> AdapterResult<String> {
        let response = match self.config.auth_method {
            AuthMethod::Idc => {
                let client_id = get_str(doc, &["clientId", "client_id"]).ok_or_else(|| {
                    AdapterError::Auth("kiro idc credential has no clientId".to_string())
                })?;
                let client_secret =
                    get_str(doc, &["clientSecret", "client_secret"]).ok_or_else(|| {
                        AdapterError::Auth("kiro idc credential has no clientSecret".to_string())
                    })?;
                request_json(
                    self.client()?.post(IDC_REFRESH_URL).json(&serde_json::json!({
                        "grantType": "refresh_token",
                        "clientId": client_id,
                        "clientSecret": client_secret,
                        "refreshToken": refresh_token,
                    })),
                    "kiro.idc_refresh",
                )
                .await?
            }
            _ => {
                request_json(
                    self.client()?
                        .post(SOCIAL_REFRESH_URL)
                        .json(&serde_json::json!({ "refreshToken": refresh_token })),
                    "kiro.social_refresh",
                )
                .await?
            }
        };

        let access_token = get_str(&response, &["accessToken", "access_token"])
            .ok_or_else(|| {
                AdapterError::Auth("kiro refresh response missing accessToken".to_string())
            })?
            .to_string();
        let expires_at = response["expiresIn"]
            .as_i64()
            .or_else(|| response["expires_in"].as_i64())
            .map(|seconds| time::OffsetDateTime::now_utc() + time::Duration::seconds(seconds));
        let new_refresh = get_str(&response, &["refreshToken", "refresh_token"]).map(str::to_string);

        let persist = access_token.clone();
        let result = update_credential_file(&self.credential_path, |doc| {
            doc["accessToken"] = JsonValue::String(persist);
            if let Some(refresh) = new_refresh {
                doc["refreshToken"] = JsonValue::String(refresh);
            }
            if let Some(at) = expires_at {
                doc["expiresAt"] = JsonValue::String(format_expires_at(at));
            }
        })
        .await;
        if let Err(err) = result {
            warn!(event = "kiro.persist_failed", error = %err);
        }
        Ok(access_token)
    }

    fn request(&self, builder: wreq::RequestBuilder, token: &str) -> wreq::RequestBuilder {
        let mut builder = builder.bearer_auth(token);
        if let Some(arn) = &self.config.profile_arn {
            builder = builder.header("x-amzn-codewhisperer-profile-arn", arn);
        }
        if let Some(machine) = &self.config.machine_code {
            builder = builder.header("x-amzn-kiro-agent-machine-id", machine);
        }
        builder
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
impl ServiceAdapter for KiroAdapter {
    fn name(&self) -> &'static str {
        "kiro"
    }

    fn dialect(&self) -> Dialect {
        Dialect::Claude
    }

    async fn list_models(&self) -> AdapterResult<Vec<String>> {
        Ok(MODELS.iter().map(|model| model.to_string()).collect())
    }

    async fn generate_content(&self, model: &str, body: &JsonValue) -> AdapterResult<JsonValue> {
        let token = self.ensure_token().await?;
        let url = format!("{}/v1/messages", self.base_url());
        request_json(
            self.request(self.client()?.post(url), &token)
                .json(&self.prepare(model, body, false)),
            "kiro.messages",
        )
        .await
    }

    async fn generate_content_stream(
        &self,
        model: &str,
        body: &JsonValue,
    ) -> AdapterResult<ChunkReceiver> {
        let token = self.ensure_token().await?;
        let url = format!("{}/v1/messages", self.base_url());
        request_sse(
            self.request(self.client()?.post(url), &token)
                .json(&self.prepare(model, body, true)),
            "kiro.messages_stream",
        )
        .await
    }
}
