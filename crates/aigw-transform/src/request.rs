//! Request translation: lift a dialect-specific body into the canonical
//! model, lower the canonical model back into a dialect-specific body.

use serde_json::Value as JsonValue;

use aigw_protocol::{Dialect, claude, gemini, openai_chat, openai_responses};

use crate::TransformError;
use crate::message::{
    Attachment, CanonicalMessage, CanonicalRequest, Content, Role, ToolSpec, encode_tool_arguments,
    parse_tool_arguments,
};

/// Convert a request body between dialects.  Identity wire dialects pass
/// through untouched.
pub fn convert_request(
    from: Dialect,
    to: Dialect,
    body: &JsonValue,
) -> Result<JsonValue, TransformError> {
    if from.wire() == to.wire() {
        return Ok(body.clone());
    }
    let canonical = lift_request(from, body)?;
    lower_request(&canonical, to)
}

pub fn lift_request(from: Dialect, body: &JsonValue) -> Result<CanonicalRequest, TransformError> {
    match from.wire() {
        Dialect::Claude => lift_claude(body),
        Dialect::OpenAI => lift_openai_chat(body),
        Dialect::OpenAIResponses => lift_openai_responses(body),
        Dialect::Gemini => lift_gemini(body),
        Dialect::Warp => unreachable!("warp wire dialect is openai"),
    }
}

pub fn lower_request(
    request: &CanonicalRequest,
    to: Dialect,
) -> Result<JsonValue, TransformError> {
    let value = match to.wire() {
        Dialect::Claude => serde_json::to_value(lower_claude(request)),
        Dialect::OpenAI => serde_json::to_value(lower_openai_chat(request)),
        Dialect::OpenAIResponses => serde_json::to_value(lower_openai_responses(request)),
        Dialect::Gemini => serde_json::to_value(lower_gemini(request)),
        Dialect::Warp => unreachable!("warp wire dialect is openai"),
    };
    value.map_err(|err| TransformError::invalid(to.as_str(), err.to_string()))
}

// ---- claude ----

fn lift_claude(body: &JsonValue) -> Result<CanonicalRequest, TransformError> {
    let req: claude::CreateMessageRequest = serde_json::from_value(body.clone())
        .map_err(|err| TransformError::invalid("claude", err.to_string()))?;

    let mut out = CanonicalRequest::new(req.model);
    out.system = req.system.as_ref().map(|s| s.flattened());
    out.stream = req.stream.unwrap_or(false);
    out.temperature = req.temperature;
    out.top_p = req.top_p;
    out.max_tokens = Some(req.max_tokens);
    out.stop_sequences = req.stop_sequences.unwrap_or_default();
    out.tools = req
        .tools
        .unwrap_or_default()
        .into_iter()
        .map(|tool| ToolSpec {
            name: tool.name,
            description: tool.description,
            input_schema: tool.input_schema,
        })
        .collect();

    for message in req.messages {
        let role = match message.role {
            claude::Role::User => Role::User,
            claude::Role::Assistant => Role::Assistant,
        };
        let blocks = match message.content {
            claude::MessageContent::Text(text) => vec![claude::ContentBlock::Text { text }],
            claude::MessageContent::Blocks(blocks) => blocks,
        };

        // Tool results ride in user messages on the Claude wire; split them
        // into their own tool-role messages so every dialect sees one shape.
        let mut regular = Vec::new();
        for block in blocks {
            match block {
                claude::ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                } => {
                    out.messages.push(CanonicalMessage {
                        role: Role::Tool,
                        content: vec![Content::ToolResult {
                            tool_use_id,
                            content: flatten_tool_result(content),
                            ok: !is_error.unwrap_or(false),
                        }],
                    });
                }
                other => regular.push(lift_claude_block(other)),
            }
        }
        if !regular.is_empty() {
            out.messages.push(CanonicalMessage {
                role,
                content: regular,
            });
        }
    }
    Ok(out)
}

fn lift_claude_block(block: claude::ContentBlock) -> Content {
    match block {
        claude::ContentBlock::Text { text } => Content::Text { text },
        claude::ContentBlock::Thinking {
            thinking,
            signature,
        } => Content::Thinking {
            text: thinking,
            signature,
        },
        claude::ContentBlock::ToolUse { id, name, input } => Content::ToolUse { id, name, input },
        claude::ContentBlock::Image { source } => Content::Image {
            source: lift_claude_image(source),
        },
        claude::ContentBlock::Document { source, title } => Content::Document {
            source: match source {
                claude::DocumentSource::Base64 { media_type, data }
                | claude::DocumentSource::Text { media_type, data } => Attachment::Inline {
                    media_type,
                    data,
                },
            },
            title,
        },
        claude::ContentBlock::ToolResult { .. } => unreachable!("split before lifting"),
    }
}

fn lift_claude_image(source: claude::ImageSource) -> Attachment {
    match source {
        claude::ImageSource::Base64 { media_type, data } => {
            Attachment::Inline { media_type, data }
        }
        claude::ImageSource::Url { url } => Attachment::Url { url },
    }
}

fn flatten_tool_result(content: Option<claude::ToolResultContent>) -> String {
    match content {
        None => String::new(),
        Some(claude::ToolResultContent::Text(text)) => text,
        Some(claude::ToolResultContent::Blocks(blocks)) => blocks
            .iter()
            .filter_map(|block| match block {
                claude::ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

fn lower_claude(request: &CanonicalRequest) -> claude::CreateMessageRequest {
    let mut messages: Vec<claude::Message> = Vec::new();
    for message in &request.messages {
        match message.role {
            Role::System => continue,
            Role::Tool => {
                let blocks: Vec<claude::ContentBlock> = message
                    .content
                    .iter()
                    .filter_map(|block| match block {
                        Content::ToolResult {
                            tool_use_id,
                            content,
                            ok,
                        } => Some(claude::ContentBlock::ToolResult {
                            tool_use_id: tool_use_id.clone(),
                            content: Some(claude::ToolResultContent::Text(content.clone())),
                            is_error: if *ok { None } else { Some(true) },
                        }),
                        _ => None,
                    })
                    .collect();
                push_claude_blocks(&mut messages, claude::Role::User, blocks);
            }
            Role::User | Role::Assistant => {
                let role = if message.role == Role::User {
                    claude::Role::User
                } else {
                    claude::Role::Assistant
                };
                let blocks: Vec<claude::ContentBlock> = message
                    .content
                    .iter()
                    .map(lower_claude_block)
                    .collect();
                push_claude_blocks(&mut messages, role, blocks);
            }
        }
    }

    claude::CreateMessageRequest {
        model: request.model.clone(),
        messages,
        max_tokens: request.max_tokens.unwrap_or(4096),
        system: request
            .system
            .clone()
            .map(claude::SystemPrompt::Text),
        stream: if request.stream { Some(true) } else { None },
        temperature: request.temperature,
        top_p: request.top_p,
        top_k: None,
        stop_sequences: if request.stop_sequences.is_empty() {
            None
        } else {
            Some(request.stop_sequences.clone())
        },
        tools: if request.tools.is_empty() {
            None
        } else {
            Some(
                request
                    .tools
                    .iter()
                    .map(|tool| claude::Tool {
                        name: tool.name.clone(),
                        description: tool.description.clone(),
                        input_schema: tool.input_schema.clone(),
                    })
                    .collect(),
            )
        },
        tool_choice: None,
        metadata: None,
    }
}

/// Consecutive same-role messages are merged; the Claude API rejects
/// back-to-back user turns.
fn push_claude_blocks(
    messages: &mut Vec<claude::Message>,
    role: claude::Role,
    blocks: Vec<claude::ContentBlock>,
) {
    if blocks.is_empty() {
        return;
    }
    if let Some(last) = messages.last_mut()
        && last.role == role
    {
        if let claude::MessageContent::Blocks(existing) = &mut last.content {
            existing.extend(blocks);
            return;
        }
    }
    messages.push(claude::Message {
        role,
        content: claude::MessageContent::Blocks(blocks),
    });
}

fn lower_claude_block(block: &Content) -> claude::ContentBlock {
    match block {
        Content::Text { text } => claude::ContentBlock::Text { text: text.clone() },
        Content::Thinking { text, signature } => claude::ContentBlock::Thinking {
            thinking: text.clone(),
            signature: signature.clone(),
        },
        Content::ToolUse { id, name, input } => claude::ContentBlock::ToolUse {
            id: id.clone(),
            name: name.clone(),
            input: input.clone(),
        },
        Content::ToolResult {
            tool_use_id,
            content,
            ok,
        } => claude::ContentBlock::ToolResult {
            tool_use_id: tool_use_id.clone(),
            content: Some(claude::ToolResultContent::Text(content.clone())),
            is_error: if *ok { None } else { Some(true) },
        },
        Content::Image { source } => claude::ContentBlock::Image {
            source: match source {
                Attachment::Inline { media_type, data } => claude::ImageSource::Base64 {
                    media_type: media_type.clone(),
                    data: data.clone(),
                },
                Attachment::Url { url } => claude::ImageSource::Url { url: url.clone() },
            },
        },
        Content::Document { source, title } => claude::ContentBlock::Document {
            source: match source {
                Attachment::Inline { media_type, data } => claude::DocumentSource::Base64 {
                    media_type: media_type.clone(),
                    data: data.clone(),
                },
                Attachment::Url { url } => claude::DocumentSource::Text {
                    media_type: "text/plain".to_string(),
                    data: url.clone(),
                },
            },
            title: title.clone(),
        },
    }
}

// ---- openai chat ----

fn lift_openai_chat(body: &JsonValue) -> Result<CanonicalRequest, TransformError> {
    let req: openai_chat::ChatCompletionRequest = serde_json::from_value(body.clone())
        .map_err(|err| TransformError::invalid("openai", err.to_string()))?;

    let mut out = CanonicalRequest::new(req.model);
    out.stream = req.stream.unwrap_or(false);
    out.temperature = req.temperature;
    out.top_p = req.top_p;
    out.max_tokens = req.max_completion_tokens.or(req.max_tokens);
    out.stop_sequences = match req.stop {
        Some(JsonValue::String(s)) => vec![s],
        Some(JsonValue::Array(items)) => items
            .into_iter()
            .filter_map(|item| item.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    };
    out.tools = req
        .tools
        .unwrap_or_default()
        .into_iter()
        .map(|tool| ToolSpec {
            name: tool.function.name,
            description: tool.function.description,
            input_schema: tool
                .function
                .parameters
                .unwrap_or_else(|| serde_json::json!({"type": "object"})),
        })
        .collect();

    let mut system_parts: Vec<String> = Vec::new();
    for message in req.messages {
        match message.role {
            openai_chat::ChatRole::System | openai_chat::ChatRole::Developer => {
                if let Some(content) = &message.content {
                    system_parts.push(content.flattened());
                }
            }
            openai_chat::ChatRole::User => {
                out.messages.push(CanonicalMessage {
                    role: Role::User,
                    content: lift_openai_content(message.content),
                });
            }
            openai_chat::ChatRole::Assistant => {
                let mut blocks = lift_openai_content(message.content);
                for call in message.tool_calls.unwrap_or_default() {
                    blocks.push(Content::ToolUse {
                        id: call.id,
                        name: call.function.name,
                        input: parse_tool_arguments(&call.function.arguments),
                    });
                }
                out.messages.push(CanonicalMessage {
                    role: Role::Assistant,
                    content: blocks,
                });
            }
            openai_chat::ChatRole::Tool => {
                out.messages.push(CanonicalMessage {
                    role: Role::Tool,
                    content: vec![Content::ToolResult {
                        tool_use_id: message.tool_call_id.unwrap_or_default(),
                        content: message
                            .content
                            .as_ref()
                            .map(|c| c.flattened())
                            .unwrap_or_default(),
                        ok: true,
                    }],
                });
            }
        }
    }
    if !system_parts.is_empty() {
        out.system = Some(system_parts.join("\n"));
    }
    Ok(out)
}

fn lift_openai_content(content: Option<openai_chat::ChatContent>) -> Vec<Content> {
    match content {
        None => Vec::new(),
        Some(openai_chat::ChatContent::Text(text)) => {
            if text.is_empty() {
                Vec::new()
            } else {
                vec![Content::Text { text }]
            }
        }
        Some(openai_chat::ChatContent::Parts(parts)) => parts
            .into_iter()
            .map(|part| match part {
                openai_chat::ContentPart::Text { text } => Content::Text { text },
                openai_chat::ContentPart::ImageUrl { image_url } => Content::Image {
                    source: lift_data_url(&image_url.url),
                },
            })
            .collect(),
    }
}

/// `data:` URLs carry inline payloads; anything else stays a URL reference.
fn lift_data_url(url: &str) -> Attachment {
    if let Some(rest) = url.strip_prefix("data:")
        && let Some((meta, data)) = rest.split_once(",")
    {
        let media_type = meta.strip_suffix(";base64").unwrap_or(meta);
        return Attachment::Inline {
            media_type: media_type.to_string(),
            data: data.to_string(),
        };
    }
    Attachment::Url {
        url: url.to_string(),
    }
}

fn lower_data_url(source: &Attachment) -> String {
    match source {
        Attachment::Inline { media_type, data } => {
            format!("data:{media_type};base64,{data}")
        }
        Attachment::Url { url } => url.clone(),
    }
}

fn lower_openai_chat(request: &CanonicalRequest) -> openai_chat::ChatCompletionRequest {
    let mut messages = Vec::new();
    if let Some(system) = &request.system {
        messages.push(openai_chat::ChatMessage::text(
            openai_chat::ChatRole::System,
            system.clone(),
        ));
    }

    for message in &request.messages {
        match message.role {
            Role::System => {
                messages.push(openai_chat::ChatMessage::text(
                    openai_chat::ChatRole::System,
                    message.flattened_text(),
                ));
            }
            Role::User => {
                messages.push(lower_openai_user(message));
            }
            Role::Assistant => {
                messages.push(lower_openai_assistant(message));
            }
            Role::Tool => {
                for block in &message.content {
                    if let Content::ToolResult {
                        tool_use_id,
                        content,
                        ..
                    } = block
                    {
                        messages.push(openai_chat::ChatMessage {
                            role: openai_chat::ChatRole::Tool,
                            content: Some(openai_chat::ChatContent::Text(content.clone())),
                            name: None,
                            tool_calls: None,
                            tool_call_id: Some(tool_use_id.clone()),
                            reasoning_content: None,
                        });
                    }
                }
            }
        }
    }

    openai_chat::ChatCompletionRequest {
        model: request.model.clone(),
        messages,
        stream: if request.stream { Some(true) } else { None },
        stream_options: None,
        temperature: request.temperature,
        top_p: request.top_p,
        max_tokens: request.max_tokens,
        max_completion_tokens: None,
        stop: if request.stop_sequences.is_empty() {
            None
        } else {
            Some(serde_json::json!(request.stop_sequences))
        },
        tools: if request.tools.is_empty() {
            None
        } else {
            Some(
                request
                    .tools
                    .iter()
                    .map(|tool| openai_chat::ToolDef {
                        r#type: "function".to_string(),
                        function: openai_chat::FunctionDef {
                            name: tool.name.clone(),
                            description: tool.description.clone(),
                            parameters: Some(tool.input_schema.clone()),
                        },
                    })
                    .collect(),
            )
        },
        tool_choice: None,
        user: None,
    }
}

fn lower_openai_user(message: &CanonicalMessage) -> openai_chat::ChatMessage {
    let mut parts = Vec::new();
    let mut only_text: Option<String> = None;
    let mut simple = true;
    for block in &message.content {
        match block {
            Content::Text { text } => {
                if only_text.is_none() && parts.is_empty() {
                    only_text = Some(text.clone());
                } else {
                    simple = false;
                }
                parts.push(openai_chat::ContentPart::Text { text: text.clone() });
            }
            Content::Image { source } | Content::Document { source, .. } => {
                simple = false;
                parts.push(openai_chat::ContentPart::ImageUrl {
                    image_url: openai_chat::ImageUrl {
                        url: lower_data_url(source),
                        detail: None,
                    },
                });
            }
            _ => {}
        }
    }
    let content = if simple && only_text.is_some() {
        openai_chat::ChatContent::Text(only_text.unwrap_or_default())
    } else {
        openai_chat::ChatContent::Parts(parts)
    };
    openai_chat::ChatMessage {
        role: openai_chat::ChatRole::User,
        content: Some(content),
        name: None,
        tool_calls: None,
        tool_call_id: None,
        reasoning_content: None,
    }
}

fn lower_openai_assistant(message: &CanonicalMessage) -> openai_chat::ChatMessage {
    let mut text_parts = Vec::new();
    let mut reasoning_parts = Vec::new();
    let mut tool_calls = Vec::new();
    for block in &message.content {
        match block {
            Content::Text { text } => text_parts.push(text.clone()),
            Content::Thinking { text, .. } => reasoning_parts.push(text.clone()),
            Content::ToolUse { id, name, input } => {
                tool_calls.push(openai_chat::ToolCall {
                    id: id.clone(),
                    r#type: "function".to_string(),
                    function: openai_chat::FunctionCall {
                        name: name.clone(),
                        arguments: encode_tool_arguments(input),
                    },
                });
            }
            _ => {}
        }
    }
    openai_chat::ChatMessage {
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
    }
}

// ---- openai responses ----

fn lift_openai_responses(body: &JsonValue) -> Result<CanonicalRequest, TransformError> {
    let req: openai_responses::CreateResponseRequest = serde_json::from_value(body.clone())
        .map_err(|err| TransformError::invalid("openai_responses", err.to_string()))?;

    let mut out = CanonicalRequest::new(req.model);
    out.system = req.instructions;
    out.stream = req.stream.unwrap_or(false);
    out.temperature = req.temperature;
    out.top_p = req.top_p;
    out.max_tokens = req.max_output_tokens;
    out.tools = req
        .tools
        .unwrap_or_default()
        .into_iter()
        .filter(|tool| tool.r#type == "function")
        .map(|tool| ToolSpec {
            name: tool.name,
            description: tool.description,
            input_schema: tool
                .parameters
                .unwrap_or_else(|| serde_json::json!({"type": "object"})),
        })
        .collect();

    match req.input {
        openai_responses::ResponseInput::Text(text) => {
            out.messages.push(CanonicalMessage::text(Role::User, text));
        }
        openai_responses::ResponseInput::Items(items) => {
            for item in items {
                match item {
                    openai_responses::InputItem::Message { role, content } => {
                        let role = match role.as_str() {
                            "system" | "developer" => Role::System,
                            "assistant" => Role::Assistant,
                            _ => Role::User,
                        };
                        if role == Role::System {
                            let text = content.flattened();
                            out.system = Some(match out.system.take() {
                                Some(existing) => format!("{existing}\n{text}"),
                                None => text,
                            });
                        } else {
                            out.messages
                                .push(CanonicalMessage::text(role, content.flattened()));
                        }
                    }
                    openai_responses::InputItem::FunctionCall {
                        call_id,
                        name,
                        arguments,
                        ..
                    } => {
                        out.messages.push(CanonicalMessage {
                            role: Role::Assistant,
                            content: vec![Content::ToolUse {
                                id: call_id,
                                name,
                                input: parse_tool_arguments(&arguments),
                            }],
                        });
                    }
                    openai_responses::InputItem::FunctionCallOutput { call_id, output } => {
                        out.messages.push(CanonicalMessage {
                            role: Role::Tool,
                            content: vec![Content::ToolResult {
                                tool_use_id: call_id,
                                content: output,
                                ok: true,
                            }],
                        });
                    }
                }
            }
        }
    }
    Ok(out)
}

fn lower_openai_responses(request: &CanonicalRequest) -> openai_responses::CreateResponseRequest {
    let mut items = Vec::new();
    for message in &request.messages {
        match message.role {
            Role::System => items.push(openai_responses::InputItem::Message {
                role: "system".to_string(),
                content: openai_responses::ItemContent::Text(message.flattened_text()),
            }),
            Role::User => items.push(openai_responses::InputItem::Message {
                role: "user".to_string(),
                content: openai_responses::ItemContent::Text(message.flattened_text()),
            }),
            Role::Assistant => {
                let text = message.flattened_text();
                if !text.is_empty() {
                    items.push(openai_responses::InputItem::Message {
                        role: "assistant".to_string(),
                        content: openai_responses::ItemContent::Text(text),
                    });
                }
                for block in &message.content {
                    if let Content::ToolUse { id, name, input } = block {
                        items.push(openai_responses::InputItem::FunctionCall {
                            id: None,
                            call_id: id.clone(),
                            name: name.clone(),
                            arguments: encode_tool_arguments(input),
                        });
                    }
                }
            }
            Role::Tool => {
                for block in &message.content {
                    if let Content::ToolResult {
                        tool_use_id,
                        content,
                        ..
                    } = block
                    {
                        items.push(openai_responses::InputItem::FunctionCallOutput {
                            call_id: tool_use_id.clone(),
                            output: content.clone(),
                        });
                    }
                }
            }
        }
    }

    openai_responses::CreateResponseRequest {
        model: request.model.clone(),
        input: openai_responses::ResponseInput::Items(items),
        instructions: request.system.clone(),
        stream: if request.stream { Some(true) } else { None },
        temperature: request.temperature,
        top_p: request.top_p,
        max_output_tokens: request.max_tokens,
        tools: if request.tools.is_empty() {
            None
        } else {
            Some(
                request
                    .tools
                    .iter()
                    .map(|tool| openai_responses::ResponsesToolDef {
                        r#type: "function".to_string(),
                        name: tool.name.clone(),
                        description: tool.description.clone(),
                        parameters: Some(tool.input_schema.clone()),
                    })
                    .collect(),
            )
        },
        tool_choice: None,
    }
}

// ---- gemini ----

fn lift_gemini(body: &JsonValue) -> Result<CanonicalRequest, TransformError> {
    let req: gemini::GenerateContentRequest = serde_json::from_value(body.clone())
        .map_err(|err| TransformError::invalid("gemini", err.to_string()))?;

    // Gemini carries the model in the URL path; the dispatcher fills it in.
    let mut out = CanonicalRequest::new(String::new());
    out.system = req
        .system_instruction
        .as_ref()
        .map(|content| content.flattened_text());
    if let Some(config) = &req.generation_config {
        out.temperature = config.temperature;
        out.top_p = config.top_p;
        out.max_tokens = config.max_output_tokens;
        out.stop_sequences = config.stop_sequences.clone().unwrap_or_default();
    }
    out.tools = req
        .tools
        .unwrap_or_default()
        .into_iter()
        .flat_map(|tool| tool.function_declarations.unwrap_or_default())
        .map(|decl| ToolSpec {
            name: decl.name,
            description: decl.description,
            input_schema: decl
                .parameters
                .unwrap_or_else(|| serde_json::json!({"type": "object"})),
        })
        .collect();

    for (index, content) in req.contents.iter().enumerate() {
        let role = match content.role.as_deref() {
            Some("model") => Role::Assistant,
            _ => Role::User,
        };
        let mut blocks = Vec::new();
        for part in &content.parts {
            match part {
                gemini::Part::Text(text) => blocks.push(Content::Text { text: text.clone() }),
                gemini::Part::InlineData(data) => blocks.push(Content::Image {
                    source: Attachment::Inline {
                        media_type: data.mime_type.clone(),
                        data: data.data.clone(),
                    },
                }),
                gemini::Part::FileData(data) => blocks.push(Content::Image {
                    source: Attachment::Url {
                        url: data.file_uri.clone(),
                    },
                }),
                gemini::Part::FunctionCall(call) => blocks.push(Content::ToolUse {
                    id: call
                        .id
                        .clone()
                        .unwrap_or_else(|| format!("call_{}_{}", call.name, index)),
                    name: call.name.clone(),
                    input: call.args.clone(),
                }),
                gemini::Part::FunctionResponse(resp) => {
                    out.messages.push(CanonicalMessage {
                        role: Role::Tool,
                        content: vec![Content::ToolResult {
                            tool_use_id: resp
                                .id
                                .clone()
                                .unwrap_or_else(|| format!("call_{}_{}", resp.name, index)),
                            content: flatten_function_response(&resp.response),
                            ok: true,
                        }],
                    });
                }
            }
        }
        if !blocks.is_empty() {
            out.messages.push(CanonicalMessage {
                role,
                content: blocks,
            });
        }
    }
    Ok(out)
}

fn flatten_function_response(response: &JsonValue) -> String {
    match response {
        JsonValue::String(text) => text.clone(),
        other => other
            .get("result")
            .or_else(|| other.get("output"))
            .and_then(|value| value.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| other.to_string()),
    }
}

fn lower_gemini(request: &CanonicalRequest) -> gemini::GenerateContentRequest {
    // functionResponse needs the tool name back; recover it from the
    // preceding tool_use blocks.
    let mut names: std::collections::HashMap<&str, &str> = std::collections::HashMap::new();
    for message in &request.messages {
        for block in &message.content {
            if let Content::ToolUse { id, name, .. } = block {
                names.insert(id.as_str(), name.as_str());
            }
        }
    }

    let mut contents = Vec::new();
    for message in &request.messages {
        let (role, parts): (&str, Vec<gemini::Part>) = match message.role {
            Role::System => continue,
            Role::User => (
                "user",
                message
                    .content
                    .iter()
                    .filter_map(lower_gemini_user_part)
                    .collect(),
            ),
            Role::Assistant => (
                "model",
                message
                    .content
                    .iter()
                    .filter_map(lower_gemini_model_part)
                    .collect(),
            ),
            Role::Tool => (
                "user",
                message
                    .content
                    .iter()
                    .filter_map(|block| match block {
                        Content::ToolResult {
                            tool_use_id,
                            content,
                            ok,
                        } => Some(gemini::Part::FunctionResponse(gemini::FunctionResponse {
                            name: names
                                .get(tool_use_id.as_str())
                                .map(|name| name.to_string())
                                .unwrap_or_else(|| tool_use_id.clone()),
                            response: if *ok {
                                serde_json::json!({ "result": content })
                            } else {
                                serde_json::json!({ "error": content })
                            },
                            id: Some(tool_use_id.clone()),
                        })),
                        _ => None,
                    })
                    .collect(),
            ),
        };
        if !parts.is_empty() {
            contents.push(gemini::Content {
                role: Some(role.to_string()),
                parts,
            });
        }
    }

    gemini::GenerateContentRequest {
        contents,
        system_instruction: request.system.as_ref().map(|system| gemini::Content {
            role: None,
            parts: vec![gemini::Part::Text(system.clone())],
        }),
        tools: if request.tools.is_empty() {
            None
        } else {
            Some(vec![gemini::ToolDecl {
                function_declarations: Some(
                    request
                        .tools
                        .iter()
                        .map(|tool| gemini::FunctionDeclaration {
                            name: tool.name.clone(),
                            description: tool.description.clone(),
                            parameters: Some(tool.input_schema.clone()),
                        })
                        .collect(),
                ),
            }])
        },
        generation_config: Some(gemini::GenerationConfig {
            temperature: request.temperature,
            top_p: request.top_p,
            top_k: None,
            max_output_tokens: request.max_tokens,
            stop_sequences: if request.stop_sequences.is_empty() {
                None
            } else {
                Some(request.stop_sequences.clone())
            },
        }),
    }
}

fn lower_gemini_user_part(block: &Content) -> Option<gemini::Part> {
    match block {
        Content::Text { text } => Some(gemini::Part::Text(text.clone())),
        Content::Image { source } | Content::Document { source, .. } => Some(match source {
            Attachment::Inline { media_type, data } => {
                gemini::Part::InlineData(gemini::InlineData {
                    mime_type: media_type.clone(),
                    data: data.clone(),
                })
            }
            Attachment::Url { url } => gemini::Part::FileData(gemini::FileData {
                mime_type: "application/octet-stream".to_string(),
                file_uri: url.clone(),
            }),
        }),
        _ => None,
    }
}

fn lower_gemini_model_part(block: &Content) -> Option<gemini::Part> {
    match block {
        Content::Text { text } => Some(gemini::Part::Text(text.clone())),
        Content::Thinking { text, .. } => Some(gemini::Part::Text(text.clone())),
        Content::ToolUse { id, name, input } => {
            Some(gemini::Part::FunctionCall(gemini::FunctionCall {
                name: name.clone(),
                args: input.clone(),
                id: Some(id.clone()),
            }))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aigw_protocol::Dialect;

    fn claude_fixture() -> JsonValue {
        serde_json::json!({
            "model": "claude-sonnet-4",
            "max_tokens": 512,
            "system": "be helpful",
            "messages": [
                {"role": "user", "content": "find foo"},
                {"role": "assistant", "content": [
                    {"type": "text", "text": "searching"},
                    {"type": "tool_use", "id": "toolu_1", "name": "search", "input": {"q": "foo"}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_1", "content": "found 3"}
                ]}
            ]
        })
    }

    #[test]
    fn claude_to_openai_carries_tool_round() {
        let body = convert_request(Dialect::Claude, Dialect::OpenAI, &claude_fixture()).unwrap();
        let req: openai_chat::ChatCompletionRequest = serde_json::from_value(body).unwrap();
        assert_eq!(req.messages[0].role, openai_chat::ChatRole::System);
        let assistant = &req.messages[2];
        let calls = assistant.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].id, "toolu_1");
        assert_eq!(calls[0].function.arguments, "{\"q\":\"foo\"}");
        let tool = &req.messages[3];
        assert_eq!(tool.role, openai_chat::ChatRole::Tool);
        assert_eq!(tool.tool_call_id.as_deref(), Some("toolu_1"));
    }

    #[test]
    fn claude_round_trip_is_semantically_idempotent() {
        let once = convert_request(Dialect::Claude, Dialect::OpenAI, &claude_fixture()).unwrap();
        let back = convert_request(Dialect::OpenAI, Dialect::Claude, &once).unwrap();
        let lifted_original = lift_request(Dialect::Claude, &claude_fixture()).unwrap();
        let lifted_back = lift_request(Dialect::Claude, &back).unwrap();
        assert_eq!(lifted_original.system, lifted_back.system);
        assert_eq!(lifted_original.messages, lifted_back.messages);
    }

    #[test]
    fn claude_to_gemini_maps_tool_results_to_function_responses() {
        let body = convert_request(Dialect::Claude, Dialect::Gemini, &claude_fixture()).unwrap();
        let req: gemini::GenerateContentRequest = serde_json::from_value(body).unwrap();
        assert!(req.system_instruction.is_some());
        let last = req.contents.last().unwrap();
        match &last.parts[0] {
            gemini::Part::FunctionResponse(resp) => {
                assert_eq!(resp.name, "search");
                assert_eq!(resp.response["result"], "found 3");
            }
            other => panic!("expected functionResponse, got {other:?}"),
        }
    }

    #[test]
    fn openai_responses_items_lift_to_tool_blocks() {
        let body = serde_json::json!({
            "model": "gpt-5",
            "instructions": "be brief",
            "input": [
                {"type": "message", "role": "user", "content": "hi"},
                {"type": "function_call", "call_id": "call_1", "name": "search", "arguments": "{\"q\":1}"},
                {"type": "function_call_output", "call_id": "call_1", "output": "ok"}
            ]
        });
        let lifted = lift_request(Dialect::OpenAIResponses, &body).unwrap();
        assert_eq!(lifted.system.as_deref(), Some("be brief"));
        assert_eq!(lifted.messages.len(), 3);
        assert!(matches!(
            lifted.messages[1].content[0],
            Content::ToolUse { ref id, .. } if id == "call_1"
        ));
        assert!(matches!(lifted.messages[2].role, Role::Tool));
    }

    #[test]
    fn same_wire_dialect_passes_through() {
        let body = serde_json::json!({"model": "gpt-5", "messages": []});
        let out = convert_request(Dialect::Warp, Dialect::OpenAI, &body).unwrap();
        assert_eq!(out, body);
    }
}
