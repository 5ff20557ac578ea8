//! Unary response translation: upstream dialect in, endpoint dialect out.

use serde_json::Value as JsonValue;
use time::OffsetDateTime;

use aigw_protocol::{Dialect, claude, gemini, openai_chat, openai_responses};

use crate::TransformError;
use crate::message::{
    CanonicalResponse, Content, StopKind, TokenUsage, encode_tool_arguments, parse_tool_arguments,
};

/// Convert a unary response body between dialects.
pub fn convert_response(
    from: Dialect,
    to: Dialect,
    body: &JsonValue,
) -> Result<JsonValue, TransformError> {
    if from.wire() == to.wire() {
        return Ok(body.clone());
    }
    let canonical = lift_response(from, body)?;
    lower_response(&canonical, to)
}

pub fn lift_response(from: Dialect, body: &JsonValue) -> Result<CanonicalResponse, TransformError> {
    match from.wire() {
        Dialect::Claude => lift_claude(body),
        Dialect::OpenAI => lift_openai_chat(body),
        Dialect::OpenAIResponses => lift_openai_responses(body),
        Dialect::Gemini => lift_gemini(body),
        Dialect::Warp => unreachable!("warp wire dialect is openai"),
    }
}

pub fn lower_response(
    response: &CanonicalResponse,
    to: Dialect,
) -> Result<JsonValue, TransformError> {
    let value = match to.wire() {
        Dialect::Claude => serde_json::to_value(lower_claude(response)),
        Dialect::OpenAI => serde_json::to_value(lower_openai_chat(response)),
        Dialect::OpenAIResponses => serde_json::to_value(lower_openai_responses(response)),
        Dialect::Gemini => serde_json::to_value(lower_gemini(response)),
        Dialect::Warp => unreachable!("warp wire dialect is openai"),
    };
    value.map_err(|err| TransformError::invalid(to.as_str(), err.to_string()))
}

fn lift_claude(body: &JsonValue) -> Result<CanonicalResponse, TransformError> {
    let resp: claude::MessageResponse = serde_json::from_value(body.clone())
        .map_err(|err| TransformError::invalid("claude", err.to_string()))?;
    let mut content = Vec::new();
    for block in resp.content {
        match block {
            claude::ContentBlock::Text { text } => content.push(Content::Text { text }),
            claude::ContentBlock::Thinking {
                thinking,
                signature,
            } => content.push(Content::Thinking {
                text: thinking,
                signature,
            }),
            claude::ContentBlock::ToolUse { id, name, input } => {
                content.push(Content::ToolUse { id, name, input })
            }
            _ => {}
        }
    }
    Ok(CanonicalResponse {
        id: resp.id,
        model: resp.model,
        content,
        stop: match resp.stop_reason {
            Some(claude::StopReason::MaxTokens) => StopKind::MaxTokens,
            Some(claude::StopReason::ToolUse) => StopKind::ToolUse,
            Some(claude::StopReason::StopSequence) => StopKind::StopSequence,
            Some(claude::StopReason::Refusal) => StopKind::ContentFilter,
            _ => StopKind::EndTurn,
        },
        usage: TokenUsage {
            input: resp.usage.input_tokens.unwrap_or(0),
            output: resp.usage.output_tokens.unwrap_or(0),
            cached_input: resp.usage.cache_read_input_tokens.unwrap_or(0),
        },
    })
}

fn lower_claude(response: &CanonicalResponse) -> claude::MessageResponse {
    let mut out = claude::MessageResponse::new(response.id.clone(), response.model.clone());
    for block in &response.content {
        match block {
            Content::Text { text } => out
                .content
                .push(claude::ContentBlock::Text { text: text.clone() }),
            Content::Thinking { text, signature } => {
                out.content.push(claude::ContentBlock::Thinking {
                    thinking: text.clone(),
                    signature: signature.clone(),
                })
            }
            Content::ToolUse { id, name, input } => {
                out.content.push(claude::ContentBlock::ToolUse {
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                })
            }
            _ => {}
        }
    }
    out.stop_reason = Some(match response.stop {
        StopKind::EndTurn => claude::StopReason::EndTurn,
        StopKind::MaxTokens => claude::StopReason::MaxTokens,
        StopKind::ToolUse => claude::StopReason::ToolUse,
        StopKind::StopSequence => claude::StopReason::StopSequence,
        StopKind::ContentFilter => claude::StopReason::Refusal,
    });
    out.usage = claude::Usage {
        input_tokens: Some(response.usage.input),
        output_tokens: Some(response.usage.output),
        cache_read_input_tokens: if response.usage.cached_input > 0 {
            Some(response.usage.cached_input)
        } else {
            None
        },
    };
    out
}

fn lift_openai_chat(body: &JsonValue) -> Result<CanonicalResponse, TransformError> {
    let resp: openai_chat::ChatCompletionResponse = serde_json::from_value(body.clone())
        .map_err(|err| TransformError::invalid("openai", err.to_string()))?;
    let choice = resp
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| TransformError::invalid("openai", "response has no choices"))?;

    let mut content = Vec::new();
    if let Some(reasoning) = &choice.message.reasoning_content
        && !reasoning.is_empty()
    {
        content.push(Content::Thinking {
            text: reasoning.clone(),
            signature: None,
        });
    }
    if let Some(text) = &choice.message.content {
        let text = text.flattened();
        if !text.is_empty() {
            content.push(Content::Text { text });
        }
    }
    for call in choice.message.tool_calls.unwrap_or_default() {
        content.push(Content::ToolUse {
            id: call.id,
            name: call.function.name,
            input: parse_tool_arguments(&call.function.arguments),
        });
    }

    Ok(CanonicalResponse {
        id: resp.id,
        model: resp.model,
        content,
        stop: match choice.finish_reason {
            Some(openai_chat::FinishReason::Length) => StopKind::MaxTokens,
            Some(openai_chat::FinishReason::ToolCalls) => StopKind::ToolUse,
            Some(openai_chat::FinishReason::ContentFilter) => StopKind::ContentFilter,
            _ => StopKind::EndTurn,
        },
        usage: resp
            .usage
            .map(|usage| TokenUsage {
                input: usage.prompt_tokens,
                output: usage.completion_tokens,
                cached_input: 0,
            })
            .unwrap_or_default(),
    })
}

fn lower_openai_chat(response: &CanonicalResponse) -> openai_chat::ChatCompletionResponse {
    let mut text_parts = Vec::new();
    let mut reasoning_parts = Vec::new();
    let mut tool_calls = Vec::new();
    for block in &response.content {
        match block {
            Content::Text { text } => text_parts.push(text.clone()),
            Content::Thinking { text, .. } => reasoning_parts.push(text.clone()),
            Content::ToolUse { id, name, input } => tool_calls.push(openai_chat::ToolCall {
                id: id.clone(),
                r#type: "function".to_string(),
                function: openai_chat::FunctionCall {
                    name: name.clone(),
                    arguments: encode_tool_arguments(input),
                },
            }),
            _ => {}
        }
    }

    openai_chat::ChatCompletionResponse {
        id: response.id.clone(),
        object: "chat.completion".to_string(),
        created: OffsetDateTime::now_utc().unix_timestamp(),
        model: response.model.clone(),
        choices: vec![openai_chat::ChatChoice {
            index: 0,
            message: openai_chat::ChatMessage {
                role: openai_chat::ChatRole::Assistant,
                content: if text_parts.is_empty() {
                    None
                } else {
                    Some(openai_chat::ChatContent::Text(text_parts.join("")))
                },
                name: None,
                tool_calls: if tool_calls.is_empty() {
                    None
                } else {
                    Some(tool_calls)
                },
                tool_call_id: None,
                reasoning_content: if reasoning_parts.is_empty() {
                    None
                } else {
                    Some(reasoning_parts.join(""))
                },
            },
            finish_reason: Some(lower_finish_reason(response.stop)),
        }],
        usage: Some(openai_chat::CompletionUsage {
            prompt_tokens: response.usage.input,
            completion_tokens: response.usage.output,
            total_tokens: response.usage.input + response.usage.output,
        }),
    }
}

pub(crate) fn lower_finish_reason(stop: StopKind) -> openai_chat::FinishReason {
    match stop {
        StopKind::MaxTokens => openai_chat::FinishReason::Length,
        StopKind::ToolUse => openai_chat::FinishReason::ToolCalls,
        StopKind::ContentFilter => openai_chat::FinishReason::ContentFilter,
        StopKind::EndTurn | StopKind::StopSequence => openai_chat::FinishReason::Stop,
    }
}

fn lift_openai_responses(body: &JsonValue) -> Result<CanonicalResponse, TransformError> {
    let resp: openai_responses::ResponseObject = serde_json::from_value(body.clone())
        .map_err(|err| TransformError::invalid("openai_responses", err.to_string()))?;

    let mut content = Vec::new();
    let mut has_tool_use = false;
    for item in resp.output {
        match item {
            openai_responses::OutputItem::Message { content: parts, .. } => {
                let text = parts
                    .iter()
                    .filter_map(|part| match part {
                        openai_responses::InputContentPart::OutputText { text }
                        | openai_responses::InputContentPart::InputText { text } => {
                            Some(text.as_str())
                        }
                        _ => None,
                    })
                    .collect::<Vec<_>>()
                    .join("");
                if !text.is_empty() {
                    content.push(Content::Text { text });
                }
            }
            openai_responses::OutputItem::FunctionCall {
                call_id,
                name,
                arguments,
                ..
            } => {
                has_tool_use = true;
                content.push(Content::ToolUse {
                    id: call_id,
                    name,
                    input: parse_tool_arguments(&arguments),
                });
            }
            openai_responses::OutputItem::Reasoning { .. } => {}
        }
    }

    Ok(CanonicalResponse {
        id: resp.id,
        model: resp.model,
        content,
        stop: if has_tool_use {
            StopKind::ToolUse
        } else {
            StopKind::EndTurn
        },
        usage: resp
            .usage
            .map(|usage| TokenUsage {
                input: usage.input_tokens,
                output: usage.output_tokens,
                cached_input: 0,
            })
            .unwrap_or_default(),
    })
}

fn lower_openai_responses(response: &CanonicalResponse) -> openai_responses::ResponseObject {
    let mut out = openai_responses::ResponseObject::new(
        response.id.clone(),
        response.model.clone(),
        OffsetDateTime::now_utc().unix_timestamp(),
    );
    let mut text_parts = Vec::new();
    for block in &response.content {
        match block {
            Content::Text { text } => {
                text_parts.push(openai_responses::InputContentPart::OutputText {
                    text: text.clone(),
                })
            }
            Content::ToolUse { id, name, input } => {
                out.output.push(openai_responses::OutputItem::FunctionCall {
                    id: format!("fc_{id}"),
                    call_id: id.clone(),
                    name: name.clone(),
                    arguments: encode_tool_arguments(input),
                    status: "completed".to_string(),
                });
            }
            _ => {}
        }
    }
    if !text_parts.is_empty() {
        out.output.insert(
            0,
            openai_responses::OutputItem::Message {
                id: format!("msg_{}", response.id),
                role: "assistant".to_string(),
                status: "completed".to_string(),
                content: text_parts,
            },
        );
    }
    out.usage = Some(openai_responses::ResponseUsage {
        input_tokens: response.usage.input,
        output_tokens: response.usage.output,
        total_tokens: response.usage.input + response.usage.output,
    });
    out
}

fn lift_gemini(body: &JsonValue) -> Result<CanonicalResponse, TransformError> {
    let resp: gemini::GenerateContentResponse = serde_json::from_value(body.clone())
        .map_err(|err| TransformError::invalid("gemini", err.to_string()))?;
    let candidate = resp
        .candidates
        .into_iter()
        .next()
        .ok_or_else(|| TransformError::invalid("gemini", "response has no candidates"))?;

    let mut content = Vec::new();
    let mut has_tool_use = false;
    for (index, part) in candidate.content.parts.iter().enumerate() {
        match part {
            gemini::Part::Text(text) => content.push(Content::Text { text: text.clone() }),
            gemini::Part::FunctionCall(call) => {
                has_tool_use = true;
                content.push(Content::ToolUse {
                    id: call
                        .id
                        .clone()
                        .unwrap_or_else(|| format!("call_{}_{}", call.name, index)),
                    name: call.name.clone(),
                    input: call.args.clone(),
                });
            }
            _ => {}
        }
    }

    Ok(CanonicalResponse {
        id: format!("gen-{}", resp.model_version.as_deref().unwrap_or("gemini")),
        model: resp.model_version.unwrap_or_default(),
        content,
        stop: if has_tool_use {
            StopKind::ToolUse
        } else {
            match candidate.finish_reason {
                Some(gemini::FinishReason::MaxTokens) => StopKind::MaxTokens,
                Some(gemini::FinishReason::Safety) => StopKind::ContentFilter,
                _ => StopKind::EndTurn,
            }
        },
        usage: resp
            .usage_metadata
            .map(|usage| TokenUsage {
                input: usage.prompt_token_count.unwrap_or(0),
                output: usage.candidates_token_count.unwrap_or(0),
                cached_input: usage.cached_content_token_count.unwrap_or(0),
            })
            .unwrap_or_default(),
    })
}

fn lower_gemini(response: &CanonicalResponse) -> gemini::GenerateContentResponse {
    let mut parts = Vec::new();
    for block in &response.content {
        match block {
            Content::Text { text } => parts.push(gemini::Part::Text(text.clone())),
            Content::ToolUse { id, name, input } => {
                parts.push(gemini::Part::FunctionCall(gemini::FunctionCall {
                    name: name.clone(),
                    args: input.clone(),
                    id: Some(id.clone()),
                }))
            }
            _ => {}
        }
    }

    gemini::GenerateContentResponse {
        candidates: vec![gemini::Candidate {
            content: gemini::Content {
                role: Some("model".to_string()),
                parts,
            },
            finish_reason: Some(match response.stop {
                StopKind::MaxTokens => gemini::FinishReason::MaxTokens,
                StopKind::ContentFilter => gemini::FinishReason::Safety,
                _ => gemini::FinishReason::Stop,
            }),
            index: Some(0),
        }],
        usage_metadata: Some(gemini::UsageMetadata {
            prompt_token_count: Some(response.usage.input),
            candidates_token_count: Some(response.usage.output),
            total_token_count: Some(response.usage.input + response.usage.output),
            cached_content_token_count: if response.usage.cached_input > 0 {
                Some(response.usage.cached_input)
            } else {
                None
            },
        }),
        model_version: Some(response.model.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gemini_text_becomes_openai_choice() {
        let body = serde_json::json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "Hi"}]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 2, "candidatesTokenCount": 1}
        });
        let out = convert_response(Dialect::Gemini, Dialect::OpenAI, &body).unwrap();
        assert_eq!(out["choices"][0]["message"]["content"], "Hi");
        assert_eq!(out["choices"][0]["finish_reason"], "stop");
        assert_eq!(out["usage"]["prompt_tokens"], 2);
    }

    #[test]
    fn openai_tool_calls_become_claude_tool_use() {
        let body = serde_json::json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "created": 1,
            "model": "gpt-4o",
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "tool_calls": [{
                        "id": "call_9",
                        "type": "function",
                        "function": {"name": "search", "arguments": "{\"q\":\"x\"}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }]
        });
        let out = convert_response(Dialect::OpenAI, Dialect::Claude, &body).unwrap();
        assert_eq!(out["stop_reason"], "tool_use");
        assert_eq!(out["content"][0]["type"], "tool_use");
        assert_eq!(out["content"][0]["input"]["q"], "x");
    }

    #[test]
    fn claude_response_lowers_to_responses_object() {
        let body = serde_json::json!({
            "id": "msg_1",
            "type": "message",
            "role": "assistant",
            "model": "claude-sonnet-4",
            "content": [{"type": "text", "text": "done"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 5, "output_tokens": 2}
        });
        let out = convert_response(Dialect::Claude, Dialect::OpenAIResponses, &body).unwrap();
        assert_eq!(out["object"], "response");
        assert_eq!(out["output"][0]["type"], "message");
        assert_eq!(out["output"][0]["content"][0]["text"], "done");
    }
}
