//! Wire types for the four chat-completion dialects the gateway speaks.
//!
//! Requests are deserialized leniently (unknown fields preserved where they
//! must round-trip, dropped otherwise); responses are serialized exactly in
//! each upstream's shape.

pub mod claude;
pub mod gemini;
pub mod openai_chat;
pub mod openai_responses;
pub mod sse;

use serde::{Deserialize, Serialize};

pub type JsonValue = serde_json::Value;
pub type JsonObject = serde_json::Map<String, serde_json::Value>;

/// Dialect family of an endpoint or upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    OpenAI,
    OpenAIResponses,
    Claude,
    Gemini,
    Warp,
}

impl Dialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::OpenAI => "openai",
            Dialect::OpenAIResponses => "openai_responses",
            Dialect::Claude => "claude",
            Dialect::Gemini => "gemini",
            Dialect::Warp => "warp",
        }
    }

    /// Wire dialect actually spoken on the stream.  Warp rides the OpenAI
    /// chunk shape once decoded from its envelope.
    pub fn wire(&self) -> Dialect {
        match self {
            Dialect::Warp => Dialect::OpenAI,
            other => *other,
        }
    }
}
