//! The uniform upstream contract every provider adapter implements.

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use aigw_protocol::Dialect;
use aigw_risk::{ErrorShape, SignalType};

/// One upstream-native data payload per item: the `data:` value of an SSE
/// event, or one JSON object for JSON-stream upstreams.  The stream is lazy,
/// finite and non-restartable; dropping the receiver cancels the upstream
/// connection.
pub type ChunkReceiver = tokio::sync::mpsc::Receiver<Result<String, AdapterError>>;
pub type ChunkSender = tokio::sync::mpsc::Sender<Result<String, AdapterError>>;

pub type AdapterResult<T> = Result<T, AdapterError>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum AdapterError {
    #[error("upstream returned {status}")]
    Http {
        status: u16,
        /// Lower-cased header pairs; carries retry hints.
        headers: Vec<(String, String)>,
        body: String,
    },
    #[error("transport failure {code}: {message}")]
    Transport { code: String, message: String },
    #[error("credential unusable: {0}")]
    Auth(String),
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),
    #[error("{0}")]
    Other(String),
}

impl AdapterError {
    pub fn status(&self) -> Option<u16> {
        match self {
            AdapterError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        match self {
            AdapterError::Http { headers, .. } => headers
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(_, value)| value.as_str()),
            _ => None,
        }
    }

    /// Shape this error for the risk normalizer.
    pub fn to_error_shape(&self) -> ErrorShape {
        match self {
            AdapterError::Http { status, body, .. } => ErrorShape::from_status(*status, body.clone()),
            AdapterError::Transport { code, message } => {
                ErrorShape::transport(code.clone(), message.clone())
            }
            AdapterError::Auth(message) => ErrorShape {
                preset: Some(SignalType::AuthInvalid),
                message: Some(message.clone()),
                ..Default::default()
            },
            AdapterError::Unsupported(what) => ErrorShape {
                message: Some(format!("unsupported: {what}")),
                ..Default::default()
            },
            AdapterError::Other(message) => ErrorShape {
                message: Some(message.clone()),
                ..Default::default()
            },
        }
    }
}

/// Uniform upstream surface.  Request and response bodies are in the
/// adapter's native [`Dialect`]; the dispatcher converts at the boundary.
#[async_trait]
pub trait ServiceAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Wire dialect this adapter speaks upstream.
    fn dialect(&self) -> Dialect;

    async fn list_models(&self) -> AdapterResult<Vec<String>>;

    async fn generate_content(&self, model: &str, body: &JsonValue) -> AdapterResult<JsonValue>;

    async fn generate_content_stream(
        &self,
        model: &str,
        body: &JsonValue,
    ) -> AdapterResult<ChunkReceiver>;
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct HealthCheckResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Constructed by the adapter registry; lets the pool manager probe a single
/// credential without knowing adapter internals.  Returns the model name the
/// probe answered with.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, provider_type: &str, uuid: &str) -> AdapterResult<String>;
}
