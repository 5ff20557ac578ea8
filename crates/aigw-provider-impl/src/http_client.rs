//! Shared `wreq` client cache plus the JSON / SSE call helpers every HTTP
//! adapter goes through.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use serde_json::Value as JsonValue;
use tracing::debug;

use aigw_protocol::sse::SseParser;
use aigw_provider_core::{AdapterError, AdapterResult, ChunkReceiver};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ClientKey {
    proxy: Option<String>,
    system_proxy: bool,
}

static CLIENT_CACHE: OnceLock<Mutex<HashMap<ClientKey, wreq::Client>>> = OnceLock::new();

pub(crate) fn client_for(proxy: Option<&str>, system_proxy: bool) -> AdapterResult<wreq::Client> {
    let key = ClientKey {
        proxy: proxy
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty()),
        system_proxy,
    };
    let cache = CLIENT_CACHE.get_or_init(|| Mutex::new(HashMap::new()));
    let mut guard = cache
        .lock()
        .map_err(|_| AdapterError::Other("http client cache lock failed".to_string()))?;
    if let Some(client) = guard.get(&key) {
        return Ok(client.clone());
    }

    let mut builder = wreq::Client::builder().connect_timeout(CONNECT_TIMEOUT);
    if let Some(proxy) = key.proxy.as_deref() {
        builder = builder.proxy(wreq::Proxy::all(proxy).map_err(map_transport)?);
    }
    let client = builder.build().map_err(map_transport)?;
    guard.insert(key, client.clone());
    Ok(client)
}

pub(crate) fn map_transport(err: wreq::Error) -> AdapterError {
    let code = if err.is_timeout() {
        "timeout"
    } else if err.is_connect() {
        "connect"
    } else if err.is_connection_reset() {
        "connection reset"
    } else {
        "transport"
    };
    AdapterError::Transport {
        code: code.to_string(),
        message: err.to_string(),
    }
}

fn lower_headers(map: &wreq::header::HeaderMap) -> Vec<(String, String)> {
    map.iter()
        .filter_map(|(key, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (key.as_str().to_ascii_lowercase(), value.to_string()))
        })
        .collect()
}

async fn send_checked(builder: wreq::RequestBuilder) -> AdapterResult<wreq::Response> {
    let response = builder.send().await.map_err(map_transport)?;
    let status = response.status().as_u16();
    if (200..300).contains(&status) {
        return Ok(response);
    }
    let headers = lower_headers(response.headers());
    let body = response
        .text()
        .await
        .unwrap_or_else(|err| format!("<body read failed: {err}>"));
    Err(AdapterError::Http {
        status,
        headers,
        body,
    })
}

/// Unary JSON call.
pub(crate) async fn request_json(
    builder: wreq::RequestBuilder,
    label: &'static str,
) -> AdapterResult<JsonValue> {
    let response = send_checked(builder).await?;
    let body = response.bytes().await.map_err(map_transport)?;
    serde_json::from_slice(&body)
        .map_err(|err| AdapterError::Other(format!("{label}: invalid upstream json: {err}")))
}

/// Open an SSE stream and forward each `data:` payload into a bounded
/// channel.  `[DONE]` markers are swallowed; the channel closing is the
/// end-of-stream signal.  Dropping the receiver cancels the upstream read.
pub(crate) async fn request_sse(
    builder: wreq::RequestBuilder,
    label: &'static str,
) -> AdapterResult<ChunkReceiver> {
    use futures_util::StreamExt;

    let response = send_checked(builder).await?;
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<String, AdapterError>>(32);
    tokio::spawn(async move {
        let mut stream = response.bytes_stream();
        let mut parser = SseParser::new();
        loop {
            let next = tokio::time::timeout(STREAM_IDLE_TIMEOUT, stream.next()).await;
            let item = match next {
                Ok(item) => item,
                Err(_) => {
                    let _ = tx
                        .send(Err(AdapterError::Transport {
                            code: "timeout".to_string(),
                            message: format!("{label}: stream idle timeout"),
                        }))
                        .await;
                    return;
                }
            };
            let Some(item) = item else { break };
            let chunk = match item {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = tx.send(Err(map_transport(err))).await;
                    return;
                }
            };
            for event in parser.push_bytes(&chunk) {
                if event.data.is_empty() || event.data == "[DONE]" {
                    continue;
                }
                if tx.send(Ok(event.data)).await.is_err() {
                    debug!(event = "adapter.stream_consumer_gone", label);
                    return;
                }
            }
        }
        for event in parser.finish() {
            if event.data.is_empty() || event.data == "[DONE]" {
                continue;
            }
            if tx.send(Ok(event.data)).await.is_err() {
                return;
            }
        }
    });
    Ok(rx)
}
