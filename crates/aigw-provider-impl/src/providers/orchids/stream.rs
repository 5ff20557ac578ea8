//! Translation of coding-agent socket messages into the Anthropic streaming
//! event grammar.
//!
//! Two parallel event families arrive on the socket: high-level
//! `coding_agent.*` events and low-level model events.  The first high-level
//! event wins; duplicated low-level reasoning/text events are dropped from
//! then on.

use std::collections::BTreeMap;

use serde_json::Value as JsonValue;

use aigw_protocol::claude;

use super::tools::ToolNameMapper;

#[derive(Debug, Clone, PartialEq)]
pub struct FsOpRequest {
    pub id: String,
    pub operation: String,
    pub params: JsonValue,
    /// `edit` operations are acknowledged, never executed locally.
    pub ack_only: bool,
}

#[derive(Debug, Default)]
pub struct Outcome {
    pub events: Vec<claude::StreamEvent>,
    pub fs_request: Option<FsOpRequest>,
    pub done: bool,
}

#[derive(Debug, Clone)]
struct PendingTool {
    name: String,
    input: JsonValue,
}

#[derive(Debug)]
struct ToolSession {
    id: String,
    index: u32,
    accumulated: String,
    had_delta: bool,
}

#[derive(Debug)]
struct EditCapture {
    id: String,
    index: u32,
    file_path: String,
    new_text: String,
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct UsageCounters {
    pub input: u32,
    pub output: u32,
    pub cached_input: u32,
}

pub struct TranslationState {
    reasoning_started: bool,
    reasoning_ended: bool,
    thinking_index: Option<u32>,
    text_index: Option<u32>,
    next_index: u32,
    tool_use_count: u32,
    pending_tools: BTreeMap<String, PendingTool>,
    current_tool: Option<ToolSession>,
    current_edit: Option<EditCapture>,
    accumulated_text: String,
    last_text_delta: Option<String>,
    saw_high_level_text: bool,
    saw_low_level_text: bool,
    prefer_high_level: bool,
    finish_reason: Option<claude::StopReason>,
    usage: UsageCounters,
    finished: bool,
}

impl TranslationState {
    pub fn new() -> Self {
        Self {
            reasoning_started: false,
            reasoning_ended: false,
            thinking_index: None,
            text_index: None,
            next_index: 0,
            tool_use_count: 0,
            pending_tools: BTreeMap::new(),
            current_tool: None,
            current_edit: None,
            accumulated_text: String::new(),
            last_text_delta: None,
            saw_high_level_text: false,
            saw_low_level_text: false,
            prefer_high_level: false,
            finish_reason: None,
            usage: UsageCounters::default(),
            finished: false,
        }
    }

    pub fn accumulated_text(&self) -> &str {
        &self.accumulated_text
    }

    pub fn pending_tools(&self) -> Vec<(String, String, JsonValue)> {
        self.pending_tools
            .iter()
            .map(|(id, tool)| (id.clone(), tool.name.clone(), tool.input.clone()))
            .collect()
    }

    pub fn usage(&self) -> UsageCounters {
        self.usage
    }

    pub fn handle(
        &mut self,
        message: &JsonValue,
        mapper: &ToolNameMapper,
        emit_fs_tool_use: bool,
    ) -> Outcome {
        let mut outcome = Outcome::default();
        let Some(full_kind) = message["type"]
            .as_str()
            .or_else(|| message["event"].as_str())
        else {
            return outcome;
        };

        let high_level = full_kind.starts_with("coding_agent.");
        let kind = full_kind.trim_start_matches("coding_agent.");
        if high_level && !self.prefer_high_level {
            self.prefer_high_level = true;
        }

        match kind {
            "reasoning.started" | "reasoning-start" => {
                if self.duplicate_low_level(high_level) {
                    return outcome;
                }
                self.start_reasoning(&mut outcome.events);
            }
            "reasoning.chunk" | "reasoning-delta" => {
                if self.duplicate_low_level(high_level) || self.reasoning_ended {
                    return outcome;
                }
                if let Some(text) = delta_text(message)
                    && !text.is_empty()
                {
                    self.start_reasoning(&mut outcome.events);
                    outcome.events.push(claude::StreamEvent::ContentBlockDelta {
                        index: self.thinking_index.unwrap_or(0),
                        delta: claude::BlockDelta::ThinkingDelta { thinking: text },
                    });
                }
            }
            "reasoning.completed" | "reasoning-end" => {
                if self.duplicate_low_level(high_level) {
                    return outcome;
                }
                self.close_reasoning(&mut outcome.events);
            }
            "output_text_delta" | "text-delta" | "response.chunk" => {
                let low_level_text = !high_level && kind != "response.chunk";
                if low_level_text {
                    self.saw_low_level_text = true;
                } else {
                    self.saw_high_level_text = true;
                }
                if self.prefer_high_level && low_level_text {
                    return outcome;
                }
                let Some(text) = delta_text(message) else {
                    return outcome;
                };
                if text.is_empty() {
                    return outcome;
                }
                // Both families present and the delta repeats verbatim:
                // it is the same token arriving twice.
                if self.saw_high_level_text
                    && self.saw_low_level_text
                    && self.last_text_delta.as_deref() == Some(text.as_str())
                {
                    return outcome;
                }
                self.last_text_delta = Some(text.clone());
                self.close_reasoning(&mut outcome.events);
                self.start_text(&mut outcome.events);
                self.accumulated_text.push_str(&text);
                outcome.events.push(claude::StreamEvent::ContentBlockDelta {
                    index: self.text_index.unwrap_or(0),
                    delta: claude::BlockDelta::TextDelta { text },
                });
            }
            "tool-input-start" => {
                let id = tool_id(message).unwrap_or_else(|| self.synthesize_tool_id());
                let raw_name = message["name"]
                    .as_str()
                    .or_else(|| message["toolName"].as_str())
                    .unwrap_or("tool");
                let name = mapper.resolve(raw_name, None);
                self.close_text(&mut outcome.events);
                self.close_reasoning(&mut outcome.events);
                let index = self.allocate_index();
                outcome.events.push(claude::StreamEvent::ContentBlockStart {
                    index,
                    content_block: claude::StreamContentBlock::ToolUse {
                        id: id.clone(),
                        name: name.clone(),
                        input: JsonValue::Object(serde_json::Map::new()),
                    },
                });
                self.pending_tools.insert(
                    id.clone(),
                    PendingTool {
                        name,
                        input: JsonValue::Null,
                    },
                );
                self.current_tool = Some(ToolSession {
                    id,
                    index,
                    accumulated: String::new(),
                    had_delta: false,
                });
            }
            "tool-input-delta" => {
                let Some(session) = self.current_tool.as_mut() else {
                    return outcome;
                };
                if let Some(id) = tool_id(message)
                    && id != session.id
                {
                    return outcome;
                }
                if let Some(delta) = delta_text(message)
                    && !delta.is_empty()
                {
                    session.accumulated.push_str(&delta);
                    session.had_delta = true;
                    outcome.events.push(claude::StreamEvent::ContentBlockDelta {
                        index: session.index,
                        delta: claude::BlockDelta::InputJsonDelta {
                            partial_json: delta,
                        },
                    });
                }
            }
            "tool-input-end" => {
                let Some(session) = self.current_tool.take() else {
                    return outcome;
                };
                let mut accumulated = session.accumulated;
                if !session.had_delta {
                    // The whole input arrived on the end event.
                    let full = message["input"]
                        .as_object()
                        .map(|map| JsonValue::Object(map.clone()))
                        .unwrap_or_else(|| serde_json::json!({}));
                    accumulated = full.to_string();
                    outcome.events.push(claude::StreamEvent::ContentBlockDelta {
                        index: session.index,
                        delta: claude::BlockDelta::InputJsonDelta {
                            partial_json: accumulated.clone(),
                        },
                    });
                }
                outcome.events.push(claude::StreamEvent::ContentBlockStop {
                    index: session.index,
                });
                if let Some(tool) = self.pending_tools.get_mut(&session.id) {
                    tool.input = serde_json::from_str(&accumulated)
                        .unwrap_or_else(|_| serde_json::json!({ "raw": accumulated }));
                }
            }
            "tool-call" => {
                // A different id than the open input session means a
                // duplicate announcement; drop it.
                if let Some(session) = &self.current_tool {
                    if tool_id(message).is_some_and(|id| id != session.id) {
                        return outcome;
                    }
                    return outcome;
                }
                let id = tool_id(message).unwrap_or_else(|| self.synthesize_tool_id());
                let raw_name = message["name"]
                    .as_str()
                    .or_else(|| message["toolName"].as_str())
                    .unwrap_or("tool");
                let input = message["input"]
                    .as_object()
                    .map(|map| JsonValue::Object(map.clone()))
                    .unwrap_or_else(|| serde_json::json!({}));
                let name = mapper.resolve(raw_name, Some(&input));
                self.emit_complete_tool(&mut outcome.events, id, name, input);
            }
            "edit.started" | "edit_file.started" | "Edit.edit.started" => {
                let file_path = message["file_path"]
                    .as_str()
                    .or_else(|| message["path"].as_str())
                    .or_else(|| message["params"]["file_path"].as_str())
                    .unwrap_or_default()
                    .to_string();
                let id = self.synthesize_tool_id();
                let name = mapper.resolve("edit", None);
                self.close_text(&mut outcome.events);
                self.close_reasoning(&mut outcome.events);
                let index = self.allocate_index();
                outcome.events.push(claude::StreamEvent::ContentBlockStart {
                    index,
                    content_block: claude::StreamContentBlock::ToolUse {
                        id: id.clone(),
                        name: name.clone(),
                        input: serde_json::json!({ "file_path": file_path }),
                    },
                });
                self.pending_tools.insert(
                    id.clone(),
                    PendingTool {
                        name,
                        input: JsonValue::Null,
                    },
                );
                self.current_edit = Some(EditCapture {
                    id,
                    index,
                    file_path,
                    new_text: String::new(),
                });
            }
            "edit.chunk" | "edit_file.chunk" | "edit.delta" => {
                if let Some(edit) = self.current_edit.as_mut()
                    && let Some(text) = delta_text(message)
                {
                    edit.new_text.push_str(&text);
                }
            }
            "edit.completed" | "edit_file.completed" => {
                if let Some(edit) = self.current_edit.take() {
                    let old_string = message["old_string"]
                        .as_str()
                        .or_else(|| message["old_str"].as_str())
                        .unwrap_or_default()
                        .to_string();
                    let new_string = message["new_string"]
                        .as_str()
                        .or_else(|| message["new_str"].as_str())
                        .map(str::to_string)
                        .unwrap_or(edit.new_text);
                    let input = serde_json::json!({
                        "file_path": edit.file_path,
                        "old_string": old_string,
                        "new_string": new_string,
                    });
                    outcome.events.push(claude::StreamEvent::ContentBlockDelta {
                        index: edit.index,
                        delta: claude::BlockDelta::InputJsonDelta {
                            partial_json: input.to_string(),
                        },
                    });
                    outcome.events.push(claude::StreamEvent::ContentBlockStop {
                        index: edit.index,
                    });
                    if let Some(tool) = self.pending_tools.get_mut(&edit.id) {
                        tool.input = input;
                    }
                }
            }
            "todo_write.started" | "todo_write" => {
                let todos = message["todos"]
                    .as_array()
                    .cloned()
                    .or_else(|| message["params"]["todos"].as_array().cloned())
                    .unwrap_or_default();
                let id = self.synthesize_tool_id();
                let name = mapper.resolve("TodoWrite", None);
                self.emit_complete_tool(
                    &mut outcome.events,
                    id,
                    name,
                    serde_json::json!({ "todos": todos }),
                );
            }
            "fs_operation" => {
                let id = message["id"]
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| self.synthesize_tool_id());
                let operation = message["operation"]
                    .as_str()
                    .or_else(|| message["op"].as_str())
                    .unwrap_or_default()
                    .to_string();
                let params = message["params"]
                    .as_object()
                    .map(|map| JsonValue::Object(map.clone()))
                    .unwrap_or_else(|| serde_json::json!({}));
                if emit_fs_tool_use && !operation.is_empty() {
                    let name = mapper.resolve(&operation, Some(&params));
                    self.emit_complete_tool(
                        &mut outcome.events,
                        id.clone(),
                        name,
                        params.clone(),
                    );
                }
                if !operation.is_empty() {
                    outcome.fs_request = Some(FsOpRequest {
                        id,
                        ack_only: operation == "edit",
                        operation,
                        params,
                    });
                }
            }
            "tokens_used" => {
                self.merge_usage(message);
            }
            "finish" => {
                let reason = message["finishReason"]
                    .as_str()
                    .or_else(|| message["finish_reason"].as_str())
                    .or_else(|| message["reason"].as_str());
                self.finish_reason = match reason {
                    Some("tool-calls") | Some("tool_use") => Some(claude::StopReason::ToolUse),
                    Some("length") | Some("max-tokens") => Some(claude::StopReason::MaxTokens),
                    Some(_) => Some(claude::StopReason::EndTurn),
                    None => self.finish_reason,
                };
            }
            "response_done" | "end" | "complete" | "done" => {
                if let Some(usage) = message.get("usage") {
                    self.merge_usage(usage);
                }
                self.terminate(&mut outcome.events);
                outcome.done = true;
            }
            "error" => {
                let detail = message["message"]
                    .as_str()
                    .or_else(|| message["error"].as_str())
                    .unwrap_or("upstream error");
                outcome.events.push(claude::StreamEvent::Error {
                    error: claude::ErrorDetail {
                        r#type: "upstream_error".to_string(),
                        message: detail.to_string(),
                    },
                });
                self.terminate(&mut outcome.events);
                outcome.done = true;
            }
            _ => {}
        }
        outcome
    }

    /// Close anything still open and emit the terminal pair.  Idempotent.
    pub fn terminate(&mut self, events: &mut Vec<claude::StreamEvent>) {
        if self.finished {
            return;
        }
        self.finished = true;
        if let Some(session) = self.current_tool.take() {
            events.push(claude::StreamEvent::ContentBlockStop {
                index: session.index,
            });
        }
        if let Some(edit) = self.current_edit.take() {
            events.push(claude::StreamEvent::ContentBlockStop { index: edit.index });
        }
        self.close_text(events);
        self.close_reasoning(events);

        let stop_reason = if !self.pending_tools.is_empty() {
            claude::StopReason::ToolUse
        } else {
            self.finish_reason.unwrap_or(claude::StopReason::EndTurn)
        };
        events.push(claude::StreamEvent::MessageDelta {
            delta: claude::MessageDelta {
                stop_reason: Some(stop_reason),
                stop_sequence: None,
            },
            usage: Some(claude::Usage {
                input_tokens: Some(self.usage.input),
                output_tokens: Some(self.usage.output),
                cache_read_input_tokens: if self.usage.cached_input > 0 {
                    Some(self.usage.cached_input)
                } else {
                    None
                },
            }),
        });
        events.push(claude::StreamEvent::MessageStop);
    }

    fn duplicate_low_level(&self, high_level: bool) -> bool {
        self.prefer_high_level && !high_level
    }

    fn allocate_index(&mut self) -> u32 {
        let index = self.next_index;
        self.next_index += 1;
        index
    }

    fn synthesize_tool_id(&mut self) -> String {
        self.tool_use_count += 1;
        format!("toolu_orc_{:03}", self.tool_use_count)
    }

    fn start_reasoning(&mut self, events: &mut Vec<claude::StreamEvent>) {
        if self.reasoning_started {
            return;
        }
        self.reasoning_started = true;
        let index = self.allocate_index();
        self.thinking_index = Some(index);
        events.push(claude::StreamEvent::ContentBlockStart {
            index,
            content_block: claude::StreamContentBlock::Thinking {
                thinking: String::new(),
                signature: None,
            },
        });
    }

    fn close_reasoning(&mut self, events: &mut Vec<claude::StreamEvent>) {
        if let Some(index) = self.thinking_index.take() {
            self.reasoning_ended = true;
            events.push(claude::StreamEvent::ContentBlockStop { index });
        }
    }

    fn start_text(&mut self, events: &mut Vec<claude::StreamEvent>) {
        if self.text_index.is_some() {
            return;
        }
        let index = self.allocate_index();
        self.text_index = Some(index);
        events.push(claude::StreamEvent::ContentBlockStart {
            index,
            content_block: claude::StreamContentBlock::Text {
                text: String::new(),
            },
        });
    }

    fn close_text(&mut self, events: &mut Vec<claude::StreamEvent>) {
        if let Some(index) = self.text_index.take() {
            events.push(claude::StreamEvent::ContentBlockStop { index });
        }
    }

    fn emit_complete_tool(
        &mut self,
        events: &mut Vec<claude::StreamEvent>,
        id: String,
        name: String,
        input: JsonValue,
    ) {
        self.close_text(events);
        self.close_reasoning(events);
        let index = self.allocate_index();
        events.push(claude::StreamEvent::ContentBlockStart {
            index,
            content_block: claude::StreamContentBlock::ToolUse {
                id: id.clone(),
                name: name.clone(),
                input: JsonValue::Object(serde_json::Map::new()),
            },
        });
        events.push(claude::StreamEvent::ContentBlockDelta {
            index,
            delta: claude::BlockDelta::InputJsonDelta {
                partial_json: input.to_string(),
            },
        });
        events.push(claude::StreamEvent::ContentBlockStop { index });
        self.pending_tools.insert(id, PendingTool { name, input });
    }

    fn merge_usage(&mut self, value: &JsonValue) {
        let read = |keys: &[&str]| -> Option<u32> {
            keys.iter()
                .find_map(|key| value.get(*key).and_then(JsonValue::as_u64))
                .map(|count| count as u32)
        };
        if let Some(input) = read(&["input", "input_tokens", "prompt_tokens"]) {
            self.usage.input = input;
        }
        if let Some(output) = read(&["output", "output_tokens", "completion_tokens"]) {
            self.usage.output = output;
        }
        if let Some(cached) = read(&["cached_input", "cache_read_input_tokens"]) {
            self.usage.cached_input = cached;
        }
    }
}

impl Default for TranslationState {
    fn default() -> Self {
        Self::new()
    }
}

fn delta_text(message: &JsonValue) -> Option<String> {
    message["delta"]
        .as_str()
        .or_else(|| message["text"].as_str())
        .or_else(|| message["content"].as_str())
        .map(str::to_string)
}

fn tool_id(message: &JsonValue) -> Option<String> {
    message["id"]
        .as_str()
        .or_else(|| message["toolCallId"].as_str())
        .or_else(|| message["tool_call_id"].as_str())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::orchids::tools::ClientTool;

    fn mapper() -> ToolNameMapper {
        ToolNameMapper::new(vec![ClientTool::from_schema(
            "search_files",
            &serde_json::json!({"properties": {"pattern": {}}}),
        )])
    }

    fn run(messages: &[JsonValue]) -> Vec<claude::StreamEvent> {
        let mut state = TranslationState::new();
        let mapper = mapper();
        let mut events = Vec::new();
        for message in messages {
            events.extend(state.handle(message, &mapper, true).events);
        }
        events
    }

    #[test]
    fn reasoning_then_tool_then_done_produces_the_full_grammar() {
        let events = run(&[
            serde_json::json!({"type": "reasoning.started"}),
            serde_json::json!({"type": "reasoning.chunk", "delta": "thinking…"}),
            serde_json::json!({"type": "reasoning.completed"}),
            serde_json::json!({"type": "tool-input-start", "id": "t1", "name": "search_files"}),
            serde_json::json!({"type": "tool-input-delta", "id": "t1", "delta": "{\"pattern\":\"foo\"}"}),
            serde_json::json!({"type": "tool-input-end", "id": "t1"}),
            serde_json::json!({"type": "response_done", "usage": {"input": 12, "output": 34}}),
        ]);

        let kinds: Vec<&'static str> = events.iter().map(|event| event.event_name()).collect();
        assert_eq!(
            kinds,
            vec![
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );

        match &events[0] {
            claude::StreamEvent::ContentBlockStart {
                index,
                content_block: claude::StreamContentBlock::Thinking { .. },
            } => assert_eq!(*index, 0),
            other => panic!("expected thinking start, got {other:?}"),
        }
        match &events[3] {
            claude::StreamEvent::ContentBlockStart {
                index,
                content_block: claude::StreamContentBlock::ToolUse { name, .. },
            } => {
                assert_eq!(*index, 1);
                assert_eq!(name, "search_files");
            }
            other => panic!("expected tool start, got {other:?}"),
        }
        match &events[6] {
            claude::StreamEvent::MessageDelta { delta, usage } => {
                assert_eq!(delta.stop_reason, Some(claude::StopReason::ToolUse));
                let usage = usage.as_ref().unwrap();
                assert_eq!(usage.input_tokens, Some(12));
                assert_eq!(usage.output_tokens, Some(34));
            }
            other => panic!("expected message_delta, got {other:?}"),
        }
    }

    #[test]
    fn high_level_events_suppress_low_level_duplicates() {
        let events = run(&[
            serde_json::json!({"type": "coding_agent.response.chunk", "delta": "Hello"}),
            serde_json::json!({"type": "text-delta", "delta": "Hello"}),
            serde_json::json!({"type": "coding_agent.response.chunk", "delta": " world"}),
            serde_json::json!({"type": "response_done"}),
        ]);
        let text: String = events
            .iter()
            .filter_map(|event| match event {
                claude::StreamEvent::ContentBlockDelta {
                    delta: claude::BlockDelta::TextDelta { text },
                    ..
                } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "Hello world");
    }

    #[test]
    fn tool_input_end_without_deltas_emits_one_full_delta() {
        let events = run(&[
            serde_json::json!({"type": "tool-input-start", "id": "t1", "name": "search_files"}),
            serde_json::json!({"type": "tool-input-end", "id": "t1", "input": {"pattern": "x"}}),
            serde_json::json!({"type": "response_done"}),
        ]);
        let json: String = events
            .iter()
            .filter_map(|event| match event {
                claude::StreamEvent::ContentBlockDelta {
                    delta: claude::BlockDelta::InputJsonDelta { partial_json },
                    ..
                } => Some(partial_json.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(json, "{\"pattern\":\"x\"}");
    }

    #[test]
    fn tool_call_with_foreign_id_is_ignored_mid_session() {
        let events = run(&[
            serde_json::json!({"type": "tool-input-start", "id": "t1", "name": "search_files"}),
            serde_json::json!({"type": "tool-call", "id": "t2", "name": "other", "input": {}}),
            serde_json::json!({"type": "tool-input-delta", "id": "t1", "delta": "{}"}),
            serde_json::json!({"type": "tool-input-end", "id": "t1"}),
            serde_json::json!({"type": "response_done"}),
        ]);
        let tool_starts = events
            .iter()
            .filter(|event| {
                matches!(
                    event,
                    claude::StreamEvent::ContentBlockStart {
                        content_block: claude::StreamContentBlock::ToolUse { .. },
                        ..
                    }
                )
            })
            .count();
        assert_eq!(tool_starts, 1);
    }

    #[test]
    fn edit_flow_materializes_one_resolved_input_delta() {
        let events = run(&[
            serde_json::json!({"type": "edit_file.started", "file_path": "src/main.rs"}),
            serde_json::json!({"type": "edit_file.chunk", "delta": "fn main() {}"}),
            serde_json::json!({
                "type": "edit_file.completed",
                "old_string": "fn old() {}",
            }),
            serde_json::json!({"type": "response_done"}),
        ]);
        let delta = events
            .iter()
            .find_map(|event| match event {
                claude::StreamEvent::ContentBlockDelta {
                    delta: claude::BlockDelta::InputJsonDelta { partial_json },
                    ..
                } => Some(partial_json.clone()),
                _ => None,
            })
            .unwrap();
        let parsed: JsonValue = serde_json::from_str(&delta).unwrap();
        assert_eq!(parsed["file_path"], "src/main.rs");
        assert_eq!(parsed["old_string"], "fn old() {}");
        assert_eq!(parsed["new_string"], "fn main() {}");
    }

    #[test]
    fn fs_operation_yields_request_and_observability_block() {
        let mut state = TranslationState::new();
        let outcome = state.handle(
            &serde_json::json!({
                "type": "fs_operation",
                "id": "op1",
                "operation": "read",
                "params": {"path": "a.txt"}
            }),
            &mapper(),
            true,
        );
        let request = outcome.fs_request.unwrap();
        assert_eq!(request.operation, "read");
        assert!(!request.ack_only);
        assert!(!outcome.events.is_empty());

        let edit = state.handle(
            &serde_json::json!({
                "type": "fs_operation",
                "id": "op2",
                "operation": "edit",
                "params": {}
            }),
            &mapper(),
            false,
        );
        assert!(edit.fs_request.unwrap().ack_only);
        assert!(edit.events.is_empty());
    }

    #[test]
    fn plain_text_turn_ends_with_end_turn() {
        let events = run(&[
            serde_json::json!({"type": "output_text_delta", "delta": "done"}),
            serde_json::json!({"type": "finish", "finishReason": "stop"}),
            serde_json::json!({"type": "response_done"}),
        ]);
        let stop = events.iter().find_map(|event| match event {
            claude::StreamEvent::MessageDelta { delta, .. } => delta.stop_reason,
            _ => None,
        });
        assert_eq!(stop, Some(claude::StopReason::EndTurn));
    }
}
