//! The canonical message model every dialect is lifted into.

use serde_json::Value as JsonValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Attachment payload: either inline base64 data or a URL.
#[derive(Debug, Clone, PartialEq)]
pub enum Attachment {
    Inline { media_type: String, data: String },
    Url { url: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Content {
    Text {
        text: String,
    },
    Thinking {
        text: String,
        signature: Option<String>,
    },
    ToolUse {
        id: String,
        name: String,
        /// Parsed argument object, not the JSON-string encoding.
        input: JsonValue,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        ok: bool,
    },
    Image {
        source: Attachment,
    },
    Document {
        source: Attachment,
        title: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalMessage {
    pub role: Role,
    pub content: Vec<Content>,
}

impl CanonicalMessage {
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: vec![Content::Text { text: text.into() }],
        }
    }

    pub fn flattened_text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                Content::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: Option<String>,
    /// JSON schema of the tool input.
    pub input_schema: JsonValue,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalRequest {
    pub model: String,
    pub system: Option<String>,
    pub messages: Vec<CanonicalMessage>,
    pub tools: Vec<ToolSpec>,
    pub stream: bool,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub max_tokens: Option<u32>,
    pub stop_sequences: Vec<String>,
}

impl CanonicalRequest {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system: None,
            messages: Vec::new(),
            tools: Vec::new(),
            stream: false,
            temperature: None,
            top_p: None,
            max_tokens: None,
            stop_sequences: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StopKind {
    EndTurn,
    MaxTokens,
    ToolUse,
    StopSequence,
    ContentFilter,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TokenUsage {
    pub input: u32,
    pub output: u32,
    pub cached_input: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalResponse {
    pub id: String,
    pub model: String,
    pub content: Vec<Content>,
    pub stop: StopKind,
    pub usage: TokenUsage,
}

/// Parse an OpenAI-style JSON-string tool argument payload.  Empty and
/// whitespace-only strings become an empty object; unparseable strings are
/// preserved under a `raw` key so nothing is silently dropped.
pub fn parse_tool_arguments(arguments: &str) -> JsonValue {
    let trimmed = arguments.trim();
    if trimmed.is_empty() {
        return JsonValue::Object(serde_json::Map::new());
    }
    serde_json::from_str(trimmed)
        .unwrap_or_else(|_| serde_json::json!({ "raw": trimmed }))
}

/// Inverse of [`parse_tool_arguments`] for dialects that want a JSON string.
pub fn encode_tool_arguments(input: &JsonValue) -> String {
    serde_json::to_string(input).unwrap_or_else(|_| "{}".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_arguments_parse_and_encode() {
        let parsed = parse_tool_arguments("{\"q\": \"rust\"}");
        assert_eq!(parsed["q"], "rust");
        assert_eq!(encode_tool_arguments(&parsed), "{\"q\":\"rust\"}");
    }

    #[test]
    fn empty_arguments_become_empty_object() {
        assert_eq!(parse_tool_arguments("  "), serde_json::json!({}));
    }

    #[test]
    fn malformed_arguments_are_preserved() {
        let parsed = parse_tool_arguments("not json");
        assert_eq!(parsed["raw"], "not json");
    }
}
