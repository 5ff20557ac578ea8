//! Per-dialect-family request introspection: model/stream extraction, prompt
//! flattening for the logs, and system-prompt management.

use serde_json::Value as JsonValue;

use aigw_common::SystemPromptMode;
use aigw_protocol::Dialect;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Strategy {
    dialect: Dialect,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelStreamInfo {
    pub model: Option<String>,
    pub is_stream: bool,
}

impl Strategy {
    pub fn for_dialect(dialect: Dialect) -> Self {
        Self {
            // Warp speaks OpenAI shapes once unwrapped.
            dialect: dialect.wire(),
        }
    }

    /// Select by the protocol prefix of a provider string: everything left
    /// of the first hyphen (`gemini-web` -> gemini).
    pub fn for_provider(provider: &str) -> Self {
        let family = provider.split('-').next().unwrap_or(provider);
        let dialect = match family {
            "claude" | "kiro" | "orchids" => Dialect::Claude,
            "gemini" => Dialect::Gemini,
            // warp is aliased to openai, as are the openai-compatible brokers.
            _ => Dialect::OpenAI,
        };
        Self { dialect }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn extract_model_and_stream_info(&self, body: &JsonValue) -> ModelStreamInfo {
        ModelStreamInfo {
            model: body["model"].as_str().map(str::to_string),
            is_stream: body["stream"].as_bool().unwrap_or(false),
        }
    }

    /// User-visible prompt, flattened for the prompt log.
    pub fn extract_prompt_text(&self, body: &JsonValue) -> String {
        match self.dialect {
            Dialect::Claude => collect_text(body["messages"].as_array(), |message| {
                message_text(message, "content")
            }),
            Dialect::OpenAI | Dialect::Warp => {
                collect_text(body["messages"].as_array(), |message| {
                    message_text(message, "content")
                })
            }
            Dialect::OpenAIResponses => match &body["input"] {
                JsonValue::String(text) => text.clone(),
                JsonValue::Array(items) => collect_text(Some(items), |item| {
                    message_text(item, "content")
                }),
                _ => String::new(),
            },
            Dialect::Gemini => collect_text(body["contents"].as_array(), |content| {
                content["parts"]
                    .as_array()
                    .map(|parts| {
                        parts
                            .iter()
                            .filter_map(|part| part["text"].as_str())
                            .collect::<Vec<_>>()
                            .join("\n")
                    })
                    .unwrap_or_default()
            }),
        }
    }

    /// Assistant-visible text of a unary response, for the output log.
    pub fn extract_response_text(&self, response: &JsonValue) -> String {
        match self.dialect {
            Dialect::Claude => response["content"]
                .as_array()
                .map(|blocks| {
                    blocks
                        .iter()
                        .filter_map(|block| block["text"].as_str())
                        .collect::<Vec<_>>()
                        .join("")
                })
                .unwrap_or_default(),
            Dialect::OpenAI | Dialect::Warp => response["choices"][0]["message"]["content"]
                .as_str()
                .unwrap_or_default()
                .to_string(),
            Dialect::OpenAIResponses => response["output"]
                .as_array()
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|item| item["content"].as_array())
                        .flatten()
                        .filter_map(|part| part["text"].as_str())
                        .collect::<Vec<_>>()
                        .join("")
                })
                .unwrap_or_default(),
            Dialect::Gemini => response["candidates"][0]["content"]["parts"]
                .as_array()
                .map(|parts| {
                    parts
                        .iter()
                        .filter_map(|part| part["text"].as_str())
                        .collect::<Vec<_>>()
                        .join("")
                })
                .unwrap_or_default(),
        }
    }

    /// Merge or replace the system prompt with file-provided text, using the
    /// dialect-appropriate field.
    pub fn apply_system_prompt(
        &self,
        body: &mut JsonValue,
        text: &str,
        mode: SystemPromptMode,
    ) {
        if text.is_empty() {
            return;
        }
        match self.dialect {
            Dialect::Claude => {
                apply_string_field(body, "system", text, mode);
            }
            Dialect::OpenAI | Dialect::Warp => {
                let messages = body["messages"].as_array().cloned().unwrap_or_default();
                let existing_index = messages
                    .iter()
                    .position(|message| message["role"] == "system");
                let mut messages = messages;
                match (existing_index, mode) {
                    (Some(index), SystemPromptMode::Append) => {
                        let old = messages[index]["content"].as_str().unwrap_or_default();
                        messages[index]["content"] =
                            JsonValue::String(format!("{old}\n{text}"));
                    }
                    (Some(index), SystemPromptMode::Overwrite) => {
                        messages[index]["content"] = JsonValue::String(text.to_string());
                    }
                    (None, _) => {
                        messages.insert(
                            0,
                            serde_json::json!({"role": "system", "content": text}),
                        );
                    }
                }
                body["messages"] = JsonValue::Array(messages);
            }
            Dialect::OpenAIResponses => {
                apply_string_field(body, "instructions", text, mode);
            }
            Dialect::Gemini => {
                let existing = body["systemInstruction"]["parts"][0]["text"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string();
                let merged = match mode {
                    SystemPromptMode::Append if !existing.is_empty() => {
                        format!("{existing}\n{text}")
                    }
                    _ => text.to_string(),
                };
                body["systemInstruction"] = serde_json::json!({
                    "parts": [{"text": merged}]
                });
            }
        }
    }

    /// The inbound system prompt, for persistence to the operator-inspectable
    /// file.
    pub fn extract_system_prompt(&self, body: &JsonValue) -> Option<String> {
        match self.dialect {
            Dialect::Claude => match &body["system"] {
                JsonValue::String(text) => Some(text.clone()),
                JsonValue::Array(blocks) => Some(
                    blocks
                        .iter()
                        .filter_map(|block| block["text"].as_str())
                        .collect::<Vec<_>>()
                        .join("\n"),
                ),
                _ => None,
            },
            Dialect::OpenAI | Dialect::Warp => body["messages"]
                .as_array()
                .and_then(|messages| {
                    messages
                        .iter()
                        .find(|message| message["role"] == "system")
                })
                .and_then(|message| message["content"].as_str())
                .map(str::to_string),
            Dialect::OpenAIResponses => body["instructions"].as_str().map(str::to_string),
            Dialect::Gemini => {
                let text = body["systemInstruction"]["parts"]
                    .as_array()?
                    .iter()
                    .filter_map(|part| part["text"].as_str())
                    .collect::<Vec<_>>()
                    .join("\n");
                if text.is_empty() { None } else { Some(text) }
            }
        }
    }
}

fn apply_string_field(body: &mut JsonValue, field: &str, text: &str, mode: SystemPromptMode) {
    let existing = body[field].as_str().unwrap_or_default();
    let merged = match mode {
        SystemPromptMode::Append if !existing.is_empty() => format!("{existing}\n{text}"),
        _ => text.to_string(),
    };
    body[field] = JsonValue::String(merged);
}

fn collect_text<F>(items: Option<&Vec<JsonValue>>, extract: F) -> String
where
    F: Fn(&JsonValue) -> String,
{
    items
        .map(|items| {
            items
                .iter()
                .map(extract)
                .filter(|text| !text.is_empty())
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default()
}

fn message_text(message: &JsonValue, field: &str) -> String {
    match &message[field] {
        JsonValue::String(text) => text.clone(),
        JsonValue::Array(parts) => parts
            .iter()
            .filter_map(|part| part["text"].as_str())
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_prefix_selects_the_family() {
        assert_eq!(Strategy::for_provider("kiro-oauth").dialect(), Dialect::Claude);
        assert_eq!(Strategy::for_provider("gemini-web").dialect(), Dialect::Gemini);
        assert_eq!(Strategy::for_provider("qwen-oauth").dialect(), Dialect::OpenAI);
        // Warp is aliased to openai.
        assert_eq!(Strategy::for_provider("warp").dialect(), Dialect::OpenAI);
    }

    #[test]
    fn prompt_text_flattens_openai_parts() {
        let body = serde_json::json!({
            "messages": [
                {"role": "system", "content": "rules"},
                {"role": "user", "content": [{"type": "text", "text": "question"}]}
            ]
        });
        let text = Strategy::for_dialect(Dialect::OpenAI).extract_prompt_text(&body);
        assert!(text.contains("rules"));
        assert!(text.contains("question"));
    }

    #[test]
    fn system_prompt_lands_in_the_dialect_field() {
        let strategy = Strategy::for_dialect(Dialect::Gemini);
        let mut body = serde_json::json!({"contents": []});
        strategy.apply_system_prompt(&mut body, "obey", SystemPromptMode::Overwrite);
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "obey");

        let strategy = Strategy::for_dialect(Dialect::OpenAI);
        let mut body = serde_json::json!({"messages": [{"role": "user", "content": "hi"}]});
        strategy.apply_system_prompt(&mut body, "obey", SystemPromptMode::Overwrite);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][0]["content"], "obey");
    }

    #[test]
    fn append_mode_preserves_the_inbound_prompt() {
        let strategy = Strategy::for_dialect(Dialect::Claude);
        let mut body = serde_json::json!({"system": "inbound"});
        strategy.apply_system_prompt(&mut body, "extra", SystemPromptMode::Append);
        assert_eq!(body["system"], "inbound\nextra");
    }

    #[test]
    fn system_prompt_extraction_round_trips() {
        let strategy = Strategy::for_dialect(Dialect::Claude);
        let body = serde_json::json!({
            "system": [{"type": "text", "text": "a"}, {"type": "text", "text": "b"}]
        });
        assert_eq!(strategy.extract_system_prompt(&body).as_deref(), Some("a\nb"));
    }
}
