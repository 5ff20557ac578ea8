//! The WebSocket coding-agent upstream.
//!
//! Each request refreshes the browser session, opens a single-use socket,
//! translates agent events into the Anthropic streaming grammar and answers
//! `fs_operation` requests inline over the same socket.

pub mod fsops;
pub mod glob;
pub mod session;
pub mod stream;
pub mod tools;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, Stream, StreamExt};
use serde_json::Value as JsonValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};
use uuid::Uuid;

use aigw_protocol::{Dialect, claude};
use aigw_provider_core::{
    AdapterError, AdapterResult, ChunkReceiver, ChunkSender, CredentialConfig, ServiceAdapter,
};

use crate::http_client::client_for;
use fsops::FsOpExecutor;
use session::refresh_session;
use stream::{FsOpRequest, TranslationState};
use tools::{ClientTool, ToolNameMapper};

const DEFAULT_WS_BASE: &str = "wss://api.orchids.app/agent";
const DEFAULT_SESSION_BASE: &str = "https://clerk.orchids.app";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const IDLE_TIMEOUT: Duration = Duration::from_secs(120);

const MODELS: &[&str] = &["orchids-agent", "claude-4.5-sonnet", "gpt-5-codex"];

/// Operator-facing knobs the registry copies out of the gateway config.
#[derive(Debug, Clone)]
pub struct OrchidsSettings {
    pub emit_fs_tool_use: bool,
    pub allow_run_command: bool,
    pub fs_working_dir: Option<PathBuf>,
    pub system_proxy: bool,
}

pub struct OrchidsAdapter {
    config: CredentialConfig,
    credential_path: PathBuf,
    settings: OrchidsSettings,
}

impl OrchidsAdapter {
    pub fn new(
        config: CredentialConfig,
        credentials_dir: &std::path::Path,
        settings: OrchidsSettings,
    ) -> Self {
        let credential_path = config
            .credential_file
            .as_deref()
            .map(PathBuf::from)
            .unwrap_or_else(|| credentials_dir.join("orchids-auth.json"));
        Self {
            config,
            credential_path,
            settings,
        }
    }

    fn ws_base(&self) -> String {
        self.config
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_WS_BASE.to_string())
    }

    fn client(&self) -> AdapterResult<wreq::Client> {
        client_for(
            self.config.proxy_url.as_deref(),
            self.settings.system_proxy,
        )
    }

    fn mapper_from_body(body: &JsonValue) -> ToolNameMapper {
        let tools = body["tools"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|tool| {
                        let name = tool["name"].as_str()?;
                        Some(ClientTool::from_schema(name, &tool["input_schema"]))
                    })
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        ToolNameMapper::new(tools)
    }

    fn executor(&self) -> Option<Arc<FsOpExecutor>> {
        self.settings.fs_working_dir.as_ref().map(|dir| {
            Arc::new(FsOpExecutor::new(
                dir.clone(),
                self.settings.allow_run_command,
            ))
        })
    }

    fn request_envelope(&self, model: &str, body: &JsonValue) -> JsonValue {
        serde_json::json!({
            "type": "request",
            "id": Uuid::new_v4().to_string(),
            "model": model,
            "payload": body,
        })
    }
}

#[async_trait]
impl ServiceAdapter for OrchidsAdapter {
    fn name(&self) -> &'static str {
        "orchids"
    }

    fn dialect(&self) -> Dialect {
        Dialect::Claude
    }

    async fn list_models(&self) -> AdapterResult<Vec<String>> {
        Ok(MODELS.iter().map(|model| model.to_string()).collect())
    }

    async fn generate_content(&self, model: &str, body: &JsonValue) -> AdapterResult<JsonValue> {
        let mut rx = self.generate_content_stream(model, body).await?;
        let mut response = claude::MessageResponse::new(format!("msg_orc_{}", Uuid::new_v4()), model);
        let mut text = String::new();
        let mut tools: Vec<(String, String, String)> = Vec::new();
        while let Some(item) = rx.recv().await {
            let data = item?;
            let Ok(event) = serde_json::from_str::<claude::StreamEvent>(&data) else {
                continue;
            };
            match event {
                claude::StreamEvent::ContentBlockStart {
                    content_block: claude::StreamContentBlock::ToolUse { id, name, .. },
                    ..
                } => tools.push((id, name, String::new())),
                claude::StreamEvent::ContentBlockDelta { delta, .. } => match delta {
                    claude::BlockDelta::TextDelta { text: chunk } => text.push_str(&chunk),
                    claude::BlockDelta::InputJsonDelta { partial_json } => {
                        if let Some(tool) = tools.last_mut() {
                            tool.2.push_str(&partial_json);
                        }
                    }
                    _ => {}
                },
                claude::StreamEvent::MessageDelta { delta, usage } => {
                    response.stop_reason = delta.stop_reason;
                    if let Some(usage) = usage {
                        response.usage = usage;
                    }
                }
                _ => {}
            }
        }
        if !text.is_empty() {
            response.content.push(claude::ContentBlock::Text { text });
        }
        for (id, name, input) in tools {
            response.content.push(claude::ContentBlock::ToolUse {
                id,
                name,
                input: serde_json::from_str(&input).unwrap_or_else(|_| serde_json::json!({})),
            });
        }
        if response.stop_reason.is_none() {
            response.stop_reason = Some(claude::StopReason::EndTurn);
        }
        serde_json::to_value(&response)
            .map_err(|err| AdapterError::Other(format!("orchids aggregate: {err}")))
    }

    async fn generate_content_stream(
        &self,
        model: &str,
        body: &JsonValue,
    ) -> AdapterResult<ChunkReceiver> {
        let session = refresh_session(&self.client()?, &self.credential_path, DEFAULT_SESSION_BASE)
            .await?;

        let (tx, rx) = tokio::sync::mpsc::channel::<Result<String, AdapterError>>(32);
        let url = format!("{}?token={}", self.ws_base(), session.ws_token);
        let envelope = self.request_envelope(model, body);
        let mapper = Self::mapper_from_body(body);
        let executor = self.executor();
        let emit_fs_tool_use = self.settings.emit_fs_tool_use;
        let model = model.to_string();

        tokio::spawn(async move {
            run_socket(url, envelope, mapper, executor, emit_fs_tool_use, model, tx).await;
        });
        Ok(rx)
    }
}

async fn send_event(tx: &ChunkSender, event: &claude::StreamEvent) -> bool {
    let Ok(data) = serde_json::to_string(event) else {
        return true;
    };
    tx.send(Ok(data)).await.is_ok()
}

async fn run_socket(
    url: String,
    envelope: JsonValue,
    mapper: ToolNameMapper,
    executor: Option<Arc<FsOpExecutor>>,
    emit_fs_tool_use: bool,
    model: String,
    tx: ChunkSender,
) {
    // The client hears message_start before we even dial; a connect failure
    // still produces a well-formed (empty) message.
    let start = claude::StreamEvent::MessageStart {
        message: claude::StreamMessageStart::synthetic(
            format!("msg_orc_{}", Uuid::new_v4()),
            model,
        ),
    };
    if !send_event(&tx, &start).await {
        return;
    }

    let mut state = TranslationState::new();
    let connect = tokio::time::timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(url.as_str()));
    let mut socket = match connect.await {
        Ok(Ok((socket, _response))) => socket,
        Ok(Err(err)) => {
            fail(&tx, &mut state, format!("websocket connect failed: {err}")).await;
            return;
        }
        Err(_) => {
            fail(&tx, &mut state, "websocket connect timed out".to_string()).await;
            return;
        }
    };

    // Handshake: the server says `connected` before accepting work.
    match tokio::time::timeout(CONNECT_TIMEOUT, wait_for_connected(&mut socket)).await {
        Ok(true) => {}
        _ => {
            fail(&tx, &mut state, "no connected handshake".to_string()).await;
            let _ = socket.close(None).await;
            return;
        }
    }

    if let Err(err) = socket.send(Message::Text(envelope.to_string().into())).await {
        fail(&tx, &mut state, format!("request send failed: {err}")).await;
        let _ = socket.close(None).await;
        return;
    }

    loop {
        let next = tokio::time::timeout(IDLE_TIMEOUT, socket.next()).await;
        let frame = match next {
            Ok(frame) => frame,
            Err(_) => {
                debug!(event = "orchids.idle_timeout");
                break;
            }
        };
        let Some(frame) = frame else { break };
        let message = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                warn!(event = "orchids.socket_error", error = %err);
                break;
            }
        };
        let Ok(value) = serde_json::from_str::<JsonValue>(message.as_str()) else {
            continue;
        };

        let outcome = state.handle(&value, &mapper, emit_fs_tool_use);
        for event in &outcome.events {
            if !send_event(&tx, event).await {
                // Consumer went away: close the socket and stop.
                let _ = socket.close(None).await;
                return;
            }
        }
        if let Some(request) = outcome.fs_request {
            let reply = answer_fs_operation(&request, executor.as_deref()).await;
            if let Err(err) = socket.send(Message::Text(reply.to_string().into())).await {
                warn!(event = "orchids.fs_reply_failed", error = %err);
                break;
            }
        }
        if outcome.done {
            break;
        }
    }

    // Whatever happened above, the outbound stream ends in message_stop.
    let mut tail = Vec::new();
    state.terminate(&mut tail);
    for event in &tail {
        if !send_event(&tx, event).await {
            break;
        }
    }
    let _ = socket.close(None).await;
}

async fn fail(tx: &ChunkSender, state: &mut TranslationState, message: String) {
    let error = claude::StreamEvent::Error {
        error: claude::ErrorDetail {
            r#type: "upstream_error".to_string(),
            message,
        },
    };
    let _ = send_event(tx, &error).await;
    let mut tail = Vec::new();
    state.terminate(&mut tail);
    for event in &tail {
        if !send_event(tx, event).await {
            return;
        }
    }
}

async fn wait_for_connected<S>(socket: &mut S) -> bool
where
    S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(Ok(frame)) = socket.next().await {
        match frame {
            Message::Text(text) => {
                let Ok(value) = serde_json::from_str::<JsonValue>(text.as_str()) else {
                    continue;
                };
                if value["type"] == "connected" {
                    return true;
                }
            }
            Message::Close(_) => return false,
            _ => continue,
        }
    }
    false
}

async fn answer_fs_operation(
    request: &FsOpRequest,
    executor: Option<&FsOpExecutor>,
) -> JsonValue {
    if request.ack_only {
        return serde_json::json!({
            "type": "fs_operation_response",
            "id": request.id,
            "success": true,
        });
    }
    match executor {
        Some(executor) => {
            let outcome = executor.execute(&request.operation, &request.params).await;
            serde_json::json!({
                "type": "fs_operation_response",
                "id": request.id,
                "success": outcome.success,
                "data": outcome.data,
                "error": outcome.error,
            })
        }
        None => serde_json::json!({
            "type": "fs_operation_response",
            "id": request.id,
            "success": false,
            "error": "filesystem operations are disabled",
        }),
    }
}
