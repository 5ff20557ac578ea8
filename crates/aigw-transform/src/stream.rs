//! Streaming translation.
//!
//! The Claude event grammar is the canonical superset: upstream chunks are
//! *lifted* into it, endpoint chunks are *lowered* out of it.  Both sides are
//! stateful per connection.

use std::collections::HashMap;

use serde_json::Value as JsonValue;
use time::OffsetDateTime;

use aigw_protocol::{Dialect, claude, gemini, openai_chat, openai_responses};

use crate::TransformError;
use crate::message::{StopKind, encode_tool_arguments, parse_tool_arguments};
use crate::response::lower_finish_reason;

/// One outbound frame produced by a [`StreamLower`].
#[derive(Debug, Clone, PartialEq)]
pub enum StreamPiece {
    Event {
        /// SSE `event:` name; `None` for dialects that frame data-only.
        name: Option<&'static str>,
        data: String,
    },
    /// OpenAI `data: [DONE]` terminator.
    Done,
}

fn piece<T: serde::Serialize>(name: Option<&'static str>, value: &T) -> StreamPiece {
    StreamPiece::Event {
        name,
        data: serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string()),
    }
}

// ---------------------------------------------------------------------------
// lift: upstream dialect -> claude events
// ---------------------------------------------------------------------------

pub struct StreamLift {
    inner: LiftInner,
}

enum LiftInner {
    Claude,
    OpenAI(OpenAILift),
    Responses(ResponsesLift),
    Gemini(GeminiLift),
}

impl StreamLift {
    pub fn new(from: Dialect) -> Self {
        let inner = match from.wire() {
            Dialect::Claude => LiftInner::Claude,
            Dialect::OpenAI => LiftInner::OpenAI(OpenAILift::default()),
            Dialect::OpenAIResponses => LiftInner::Responses(ResponsesLift::default()),
            Dialect::Gemini => LiftInner::Gemini(GeminiLift::default()),
            Dialect::Warp => unreachable!("warp wire dialect is openai"),
        };
        Self { inner }
    }

    /// Feed one upstream data payload (the `data:` value of an SSE event, or
    /// one JSON object for JSON-stream dialects).  `[DONE]` markers are
    /// handled by the caller via [`StreamLift::finish`].
    pub fn push(&mut self, data: &str) -> Result<Vec<claude::StreamEvent>, TransformError> {
        match &mut self.inner {
            LiftInner::Claude => {
                // Unknown event shapes are dropped, not errors: upstreams add
                // event types faster than we care about them.
                Ok(serde_json::from_str::<claude::StreamEvent>(data)
                    .map(|event| vec![event])
                    .unwrap_or_default())
            }
            LiftInner::OpenAI(state) => state.push(data),
            LiftInner::Responses(state) => state.push(data),
            LiftInner::Gemini(state) => state.push(data),
        }
    }

    /// Close any open blocks and emit the terminal events the upstream never
    /// sent explicitly.
    pub fn finish(&mut self) -> Vec<claude::StreamEvent> {
        match &mut self.inner {
            LiftInner::Claude => Vec::new(),
            LiftInner::OpenAI(state) => state.finish(),
            LiftInner::Responses(state) => state.finish(),
            LiftInner::Gemini(state) => state.finish(),
        }
    }
}

/// Shared block bookkeeping for lifts that reconstruct the Claude grammar.
#[derive(Default)]
struct BlockTracker {
    started: bool,
    next_index: u32,
    open_index: Option<u32>,
    finished: bool,
}

impl BlockTracker {
    fn ensure_message_start(
        &mut self,
        events: &mut Vec<claude::StreamEvent>,
        id: &str,
        model: &str,
    ) {
        if self.started {
            return;
        }
        self.started = true;
        events.push(claude::StreamEvent::MessageStart {
            message: claude::StreamMessageStart::synthetic(id, model),
        });
    }

    fn close_open(&mut self, events: &mut Vec<claude::StreamEvent>) {
        if let Some(index) = self.open_index.take() {
            events.push(claude::StreamEvent::ContentBlockStop { index });
        }
    }

    fn open(&mut self, events: &mut Vec<claude::StreamEvent>, block: claude::StreamContentBlock) -> u32 {
        self.close_open(events);
        let index = self.next_index;
        self.next_index += 1;
        self.open_index = Some(index);
        events.push(claude::StreamEvent::ContentBlockStart {
            index,
            content_block: block,
        });
        index
    }

    fn terminate(
        &mut self,
        events: &mut Vec<claude::StreamEvent>,
        stop: StopKind,
        usage: Option<claude::Usage>,
    ) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.close_open(events);
        events.push(claude::StreamEvent::MessageDelta {
            delta: claude::MessageDelta {
                stop_reason: Some(match stop {
                    StopKind::EndTurn => claude::StopReason::EndTurn,
                    StopKind::MaxTokens => claude::StopReason::MaxTokens,
                    StopKind::ToolUse => claude::StopReason::ToolUse,
                    StopKind::StopSequence => claude::StopReason::StopSequence,
                    StopKind::ContentFilter => claude::StopReason::Refusal,
                }),
                stop_sequence: None,
            },
            usage,
        });
        events.push(claude::StreamEvent::MessageStop);
    }
}

#[derive(Default)]
struct OpenAILift {
    tracker: BlockTracker,
    /// Claude block index per OpenAI tool_calls index.
    tools: HashMap<u32, u32>,
    current_kind: BlockKind,
    finish: Option<StopKind>,
    usage: Option<claude::Usage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum BlockKind {
    #[default]
    None,
    Text,
    Thinking,
    Tool(u32),
}

impl OpenAILift {
    fn push(&mut self, data: &str) -> Result<Vec<claude::StreamEvent>, TransformError> {
        let chunk: openai_chat::ChatCompletionChunk = match serde_json::from_str(data) {
            Ok(chunk) => chunk,
            Err(_) => return Ok(Vec::new()),
        };
        let mut events = Vec::new();
        self.tracker
            .ensure_message_start(&mut events, &chunk.id, &chunk.model);

        if let Some(usage) = &chunk.usage {
            self.usage = Some(claude::Usage {
                input_tokens: Some(usage.prompt_tokens),
                output_tokens: Some(usage.completion_tokens),
                cache_read_input_tokens: None,
            });
        }

        let Some(choice) = chunk.choices.into_iter().next() else {
            return Ok(events);
        };

        if let Some(reasoning) = choice.delta.reasoning_content
            && !reasoning.is_empty()
        {
            if self.current_kind != BlockKind::Thinking {
                self.tracker.open(
                    &mut events,
                    claude::StreamContentBlock::Thinking {
                        thinking: String::new(),
                        signature: None,
                    },
                );
                self.current_kind = BlockKind::Thinking;
            }
            events.push(claude::StreamEvent::ContentBlockDelta {
                index: self.tracker.open_index.unwrap_or(0),
                delta: claude::BlockDelta::ThinkingDelta {
                    thinking: reasoning,
                },
            });
        }

        if let Some(text) = choice.delta.content
            && !text.is_empty()
        {
            if self.current_kind != BlockKind::Text {
                self.tracker.open(
                    &mut events,
                    claude::StreamContentBlock::Text {
                        text: String::new(),
                    },
                );
                self.current_kind = BlockKind::Text;
            }
            events.push(claude::StreamEvent::ContentBlockDelta {
                index: self.tracker.open_index.unwrap_or(0),
                delta: claude::BlockDelta::TextDelta { text },
            });
        }

        for call in choice.delta.tool_calls.unwrap_or_default() {
            if let Some(name) = call.function.as_ref().and_then(|f| f.name.clone()) {
                let id = call
                    .id
                    .clone()
                    .unwrap_or_else(|| format!("call_{}", call.index));
                let index = self.tracker.open(
                    &mut events,
                    claude::StreamContentBlock::ToolUse {
                        id,
                        name,
                        input: JsonValue::Object(serde_json::Map::new()),
                    },
                );
                self.tools.insert(call.index, index);
                self.current_kind = BlockKind::Tool(call.index);
            }
            if let Some(arguments) = call.function.as_ref().and_then(|f| f.arguments.clone())
                && !arguments.is_empty()
            {
                let index = self
                    .tools
                    .get(&call.index)
                    .copied()
                    .unwrap_or_else(|| self.tracker.open_index.unwrap_or(0));
                events.push(claude::StreamEvent::ContentBlockDelta {
                    index,
                    delta: claude::BlockDelta::InputJsonDelta {
                        partial_json: arguments,
                    },
                });
            }
        }

        if let Some(reason) = choice.finish_reason {
            self.finish = Some(match reason {
                openai_chat::FinishReason::Stop => StopKind::EndTurn,
                openai_chat::FinishReason::Length => StopKind::MaxTokens,
                openai_chat::FinishReason::ToolCalls => StopKind::ToolUse,
                openai_chat::FinishReason::ContentFilter => StopKind::ContentFilter,
            });
        }

        Ok(events)
    }

    fn finish(&mut self) -> Vec<claude::StreamEvent> {
        let mut events = Vec::new();
        if !self.tracker.started {
            return events;
        }
        self.tracker.terminate(
            &mut events,
            self.finish.unwrap_or(StopKind::EndTurn),
            self.usage.take(),
        );
        events
    }
}

#[derive(Default)]
struct ResponsesLift {
    tracker: BlockTracker,
    /// Claude block index per Responses output_index.
    items: HashMap<u32, u32>,
    usage: Option<claude::Usage>,
    saw_tool: bool,
}

impl ResponsesLift {
    fn push(&mut self, data: &str) -> Result<Vec<claude::StreamEvent>, TransformError> {
        let event: openai_responses::ResponseStreamEvent = match serde_json::from_str(data) {
            Ok(event) => event,
            Err(_) => return Ok(Vec::new()),
        };
        let mut events = Vec::new();
        match event {
            openai_responses::ResponseStreamEvent::Created { response } => {
                self.tracker
                    .ensure_message_start(&mut events, &response.id, &response.model);
            }
            openai_responses::ResponseStreamEvent::OutputItemAdded { output_index, item } => {
                self.tracker
                    .ensure_message_start(&mut events, "resp", "unknown");
                match item {
                    openai_responses::OutputItem::FunctionCall { call_id, name, .. } => {
                        self.saw_tool = true;
                        let index = self.tracker.open(
                            &mut events,
                            claude::StreamContentBlock::ToolUse {
                                id: call_id,
                                name,
                                input: JsonValue::Object(serde_json::Map::new()),
                            },
                        );
                        self.items.insert(output_index, index);
                    }
                    openai_responses::OutputItem::Message { .. } => {
                        let index = self.tracker.open(
                            &mut events,
                            claude::StreamContentBlock::Text {
                                text: String::new(),
                            },
                        );
                        self.items.insert(output_index, index);
                    }
                    openai_responses::OutputItem::Reasoning { .. } => {}
                }
            }
            openai_responses::ResponseStreamEvent::OutputTextDelta {
                output_index,
                delta,
                ..
            } => {
                self.tracker
                    .ensure_message_start(&mut events, "resp", "unknown");
                if self.items.get(&output_index).is_none() {
                    let index = self.tracker.open(
                        &mut events,
                        claude::StreamContentBlock::Text {
                            text: String::new(),
                        },
                    );
                    self.items.insert(output_index, index);
                }
                events.push(claude::StreamEvent::ContentBlockDelta {
                    index: self.items[&output_index],
                    delta: claude::BlockDelta::TextDelta { text: delta },
                });
            }
            openai_responses::ResponseStreamEvent::FunctionCallArgumentsDelta {
                output_index,
                delta,
                ..
            } => {
                if let Some(index) = self.items.get(&output_index) {
                    events.push(claude::StreamEvent::ContentBlockDelta {
                        index: *index,
                        delta: claude::BlockDelta::InputJsonDelta {
                            partial_json: delta,
                        },
                    });
                }
            }
            openai_responses::ResponseStreamEvent::OutputItemDone { .. } => {
                self.tracker.close_open(&mut events);
            }
            openai_responses::ResponseStreamEvent::Completed { response }
            | openai_responses::ResponseStreamEvent::Failed { response } => {
                if let Some(usage) = response.usage {
                    self.usage = Some(claude::Usage {
                        input_tokens: Some(usage.input_tokens),
                        output_tokens: Some(usage.output_tokens),
                        cache_read_input_tokens: None,
                    });
                }
                let stop = if self.saw_tool {
                    StopKind::ToolUse
                } else {
                    StopKind::EndTurn
                };
                self.tracker.terminate(&mut events, stop, self.usage.take());
            }
        }
        Ok(events)
    }

    fn finish(&mut self) -> Vec<claude::StreamEvent> {
        let mut events = Vec::new();
        if !self.tracker.started {
            return events;
        }
        let stop = if self.saw_tool {
            StopKind::ToolUse
        } else {
            StopKind::EndTurn
        };
        self.tracker.terminate(&mut events, stop, self.usage.take());
        events
    }
}

#[derive(Default)]
struct GeminiLift {
    tracker: BlockTracker,
    text_open: bool,
    tool_counter: u32,
    finish: Option<StopKind>,
    saw_tool: bool,
    usage: Option<claude::Usage>,
}

impl GeminiLift {
    fn push(&mut self, data: &str) -> Result<Vec<claude::StreamEvent>, TransformError> {
        let chunk: gemini::GenerateContentResponse = match serde_json::from_str(data) {
            Ok(chunk) => chunk,
            Err(_) => return Ok(Vec::new()),
        };
        let mut events = Vec::new();
        let model = chunk.model_version.clone().unwrap_or_default();
        self.tracker
            .ensure_message_start(&mut events, "gen", &model);

        if let Some(usage) = &chunk.usage_metadata {
            self.usage = Some(claude::Usage {
                input_tokens: usage.prompt_token_count,
                output_tokens: usage.candidates_token_count,
                cache_read_input_tokens: usage.cached_content_token_count,
            });
        }

        let Some(candidate) = chunk.candidates.into_iter().next() else {
            return Ok(events);
        };

        for part in candidate.content.parts {
            match part {
                gemini::Part::Text(text) => {
                    if text.is_empty() {
                        continue;
                    }
                    if !self.text_open {
                        self.tracker.open(
                            &mut events,
                            claude::StreamContentBlock::Text {
                                text: String::new(),
                            },
                        );
                        self.text_open = true;
                    }
                    events.push(claude::StreamEvent::ContentBlockDelta {
                        index: self.tracker.open_index.unwrap_or(0),
                        delta: claude::BlockDelta::TextDelta { text },
                    });
                }
                gemini::Part::FunctionCall(call) => {
                    // Gemini delivers complete calls, not argument deltas.
                    self.saw_tool = true;
                    self.text_open = false;
                    let id = call.id.clone().unwrap_or_else(|| {
                        self.tool_counter += 1;
                        format!("call_{}_{}", call.name, self.tool_counter)
                    });
                    let index = self.tracker.open(
                        &mut events,
                        claude::StreamContentBlock::ToolUse {
                            id,
                            name: call.name,
                            input: JsonValue::Object(serde_json::Map::new()),
                        },
                    );
                    events.push(claude::StreamEvent::ContentBlockDelta {
                        index,
                        delta: claude::BlockDelta::InputJsonDelta {
                            partial_json: encode_tool_arguments(&call.args),
                        },
                    });
                    self.tracker.close_open(&mut events);
                }
                _ => {}
            }
        }

        if let Some(reason) = candidate.finish_reason {
            self.finish = Some(match reason {
                gemini::FinishReason::MaxTokens => StopKind::MaxTokens,
                gemini::FinishReason::Safety => StopKind::ContentFilter,
                _ => StopKind::EndTurn,
            });
        }

        Ok(events)
    }

    fn finish(&mut self) -> Vec<claude::StreamEvent> {
        let mut events = Vec::new();
        if !self.tracker.started {
            return events;
        }
        let stop = if self.saw_tool {
            StopKind::ToolUse
        } else {
            self.finish.unwrap_or(StopKind::EndTurn)
        };
        self.tracker.terminate(&mut events, stop, self.usage.take());
        events
    }
}

// ---------------------------------------------------------------------------
// lower: claude events -> endpoint dialect
// ---------------------------------------------------------------------------

pub struct StreamLower {
    inner: LowerInner,
}

enum LowerInner {
    Claude,
    OpenAI(OpenAILower),
    Responses(ResponsesLower),
    Gemini(GeminiLower),
}

impl StreamLower {
    pub fn new(to: Dialect, model: &str) -> Self {
        let created = OffsetDateTime::now_utc().unix_timestamp();
        let inner = match to.wire() {
            Dialect::Claude => LowerInner::Claude,
            Dialect::OpenAI => LowerInner::OpenAI(OpenAILower::new(model, created)),
            Dialect::OpenAIResponses => LowerInner::Responses(ResponsesLower::new(model, created)),
            Dialect::Gemini => LowerInner::Gemini(GeminiLower::new(model)),
            Dialect::Warp => unreachable!("warp wire dialect is openai"),
        };
        Self { inner }
    }

    pub fn push(&mut self, event: &claude::StreamEvent) -> Vec<StreamPiece> {
        match &mut self.inner {
            LowerInner::Claude => vec![piece(Some(event.event_name()), event)],
            LowerInner::OpenAI(state) => state.push(event),
            LowerInner::Responses(state) => state.push(event),
            LowerInner::Gemini(state) => state.push(event),
        }
    }

    /// Emit whatever terminal framing the dialect still owes.
    pub fn finish(&mut self) -> Vec<StreamPiece> {
        match &mut self.inner {
            LowerInner::Claude => Vec::new(),
            LowerInner::OpenAI(state) => state.finish(),
            LowerInner::Responses(state) => state.finish(),
            LowerInner::Gemini(_) => Vec::new(),
        }
    }
}

struct OpenAILower {
    id: String,
    model: String,
    created: i64,
    /// OpenAI tool_calls index per Claude block index.
    tools: HashMap<u32, u32>,
    next_tool: u32,
    role_emitted: bool,
    finish_emitted: bool,
    done_emitted: bool,
}

impl OpenAILower {
    fn new(model: &str, created: i64) -> Self {
        Self {
            id: "chatcmpl-unknown".to_string(),
            model: model.to_string(),
            created,
            tools: HashMap::new(),
            next_tool: 0,
            role_emitted: false,
            finish_emitted: false,
            done_emitted: false,
        }
    }

    fn chunk(&self, delta: openai_chat::ChunkDelta, finish: Option<openai_chat::FinishReason>, usage: Option<openai_chat::CompletionUsage>) -> StreamPiece {
        let mut chunk = openai_chat::ChatCompletionChunk::new(
            self.id.clone(),
            self.model.clone(),
            self.created,
        );
        chunk.choices.push(openai_chat::ChunkChoice {
            index: 0,
            delta,
            finish_reason: finish,
        });
        chunk.usage = usage;
        piece(None, &chunk)
    }

    fn push(&mut self, event: &claude::StreamEvent) -> Vec<StreamPiece> {
        match event {
            claude::StreamEvent::MessageStart { message } => {
                self.id = message.id.clone();
                if !message.model.is_empty() && message.model != "unknown" {
                    self.model = message.model.clone();
                }
                self.role_emitted = true;
                vec![self.chunk(
                    openai_chat::ChunkDelta {
                        role: Some(openai_chat::ChatRole::Assistant),
                        ..Default::default()
                    },
                    None,
                    None,
                )]
            }
            claude::StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => match content_block {
                claude::StreamContentBlock::ToolUse { id, name, .. } => {
                    let tool_index = self.next_tool;
                    self.next_tool += 1;
                    self.tools.insert(*index, tool_index);
                    vec![self.chunk(
                        openai_chat::ChunkDelta {
                            tool_calls: Some(vec![openai_chat::ToolCallChunk {
                                index: tool_index,
                                id: Some(id.clone()),
                                r#type: Some("function".to_string()),
                                function: Some(openai_chat::ToolCallChunkFunction {
                                    name: Some(name.clone()),
                                    arguments: None,
                                }),
                            }]),
                            ..Default::default()
                        },
                        None,
                        None,
                    )]
                }
                claude::StreamContentBlock::Text { text } if !text.is_empty() => {
                    vec![self.text_chunk(text.clone())]
                }
                _ => Vec::new(),
            },
            claude::StreamEvent::ContentBlockDelta { index, delta } => match delta {
                claude::BlockDelta::TextDelta { text } if !text.is_empty() => {
                    vec![self.text_chunk(text.clone())]
                }
                claude::BlockDelta::ThinkingDelta { thinking } if !thinking.is_empty() => {
                    vec![self.chunk(
                        openai_chat::ChunkDelta {
                            reasoning_content: Some(thinking.clone()),
                            ..Default::default()
                        },
                        None,
                        None,
                    )]
                }
                claude::BlockDelta::InputJsonDelta { partial_json } if !partial_json.is_empty() => {
                    let tool_index = self.tools.get(index).copied().unwrap_or(0);
                    vec![self.chunk(
                        openai_chat::ChunkDelta {
                            tool_calls: Some(vec![openai_chat::ToolCallChunk {
                                index: tool_index,
                                id: None,
                                r#type: None,
                                function: Some(openai_chat::ToolCallChunkFunction {
                                    name: None,
                                    arguments: Some(partial_json.clone()),
                                }),
                            }]),
                            ..Default::default()
                        },
                        None,
                        None,
                    )]
                }
                _ => Vec::new(),
            },
            claude::StreamEvent::MessageDelta { delta, usage } => {
                let finish = delta.stop_reason.map(|reason| {
                    lower_finish_reason(match reason {
                        claude::StopReason::EndTurn => StopKind::EndTurn,
                        claude::StopReason::MaxTokens => StopKind::MaxTokens,
                        claude::StopReason::ToolUse => StopKind::ToolUse,
                        claude::StopReason::StopSequence => StopKind::StopSequence,
                        claude::StopReason::Refusal => StopKind::ContentFilter,
                    })
                });
                if finish.is_some() {
                    self.finish_emitted = true;
                }
                let usage = usage.as_ref().map(|usage| openai_chat::CompletionUsage {
                    prompt_tokens: usage.input_tokens.unwrap_or(0),
                    completion_tokens: usage.output_tokens.unwrap_or(0),
                    total_tokens: usage.input_tokens.unwrap_or(0)
                        + usage.output_tokens.unwrap_or(0),
                });
                if finish.is_none() && usage.is_none() {
                    Vec::new()
                } else {
                    vec![self.chunk(openai_chat::ChunkDelta::default(), finish, usage)]
                }
            }
            claude::StreamEvent::MessageStop => self.finish(),
            claude::StreamEvent::Error { error } => {
                vec![StreamPiece::Event {
                    name: None,
                    data: serde_json::json!({
                        "error": {"type": error.r#type, "message": error.message}
                    })
                    .to_string(),
                }]
            }
            claude::StreamEvent::ContentBlockStop { .. } | claude::StreamEvent::Ping => Vec::new(),
        }
    }

    fn text_chunk(&self, text: String) -> StreamPiece {
        self.chunk(
            openai_chat::ChunkDelta {
                content: Some(text),
                ..Default::default()
            },
            None,
            None,
        )
    }

    fn finish(&mut self) -> Vec<StreamPiece> {
        let mut out = Vec::new();
        if !self.finish_emitted {
            self.finish_emitted = true;
            out.push(self.chunk(
                openai_chat::ChunkDelta::default(),
                Some(openai_chat::FinishReason::Stop),
                None,
            ));
        }
        if !self.done_emitted {
            self.done_emitted = true;
            out.push(StreamPiece::Done);
        }
        out
    }
}

struct ResponsesLower {
    id: String,
    model: String,
    created: i64,
    /// Responses output_index per Claude block index.
    items: HashMap<u32, u32>,
    next_output: u32,
    /// Pending function-call metadata per Claude block index.
    calls: HashMap<u32, (String, String, String)>,
    started: bool,
    completed: bool,
    usage: Option<openai_responses::ResponseUsage>,
}

impl ResponsesLower {
    fn new(model: &str, created: i64) -> Self {
        Self {
            id: "resp-unknown".to_string(),
            model: model.to_string(),
            created,
            items: HashMap::new(),
            next_output: 0,
            calls: HashMap::new(),
            started: false,
            completed: false,
            usage: None,
        }
    }

    fn response_object(&self, status: &str) -> openai_responses::ResponseObject {
        let mut response =
            openai_responses::ResponseObject::new(self.id.clone(), self.model.clone(), self.created);
        response.status = status.to_string();
        response.usage = self.usage.clone();
        response
    }

    fn push(&mut self, event: &claude::StreamEvent) -> Vec<StreamPiece> {
        match event {
            claude::StreamEvent::MessageStart { message } => {
                self.id = message.id.clone();
                if !message.model.is_empty() && message.model != "unknown" {
                    self.model = message.model.clone();
                }
                self.started = true;
                let response = self.response_object("in_progress");
                vec![piece(
                    Some("response.created"),
                    &openai_responses::ResponseStreamEvent::Created { response },
                )]
            }
            claude::StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => {
                let output_index = self.next_output;
                self.next_output += 1;
                self.items.insert(*index, output_index);
                match content_block {
                    claude::StreamContentBlock::ToolUse { id, name, .. } => {
                        self.calls
                            .insert(*index, (id.clone(), name.clone(), String::new()));
                        let item = openai_responses::OutputItem::FunctionCall {
                            id: format!("fc_{id}"),
                            call_id: id.clone(),
                            name: name.clone(),
                            arguments: String::new(),
                            status: "in_progress".to_string(),
                        };
                        vec![piece(
                            Some("response.output_item.added"),
                            &openai_responses::ResponseStreamEvent::OutputItemAdded {
                                output_index,
                                item,
                            },
                        )]
                    }
                    _ => {
                        let item = openai_responses::OutputItem::Message {
                            id: format!("msg_{output_index}"),
                            role: "assistant".to_string(),
                            status: "in_progress".to_string(),
                            content: Vec::new(),
                        };
                        vec![piece(
                            Some("response.output_item.added"),
                            &openai_responses::ResponseStreamEvent::OutputItemAdded {
                                output_index,
                                item,
                            },
                        )]
                    }
                }
            }
            claude::StreamEvent::ContentBlockDelta { index, delta } => {
                let output_index = self.items.get(index).copied().unwrap_or(0);
                match delta {
                    claude::BlockDelta::TextDelta { text } if !text.is_empty() => {
                        vec![piece(
                            Some("response.output_text.delta"),
                            &openai_responses::ResponseStreamEvent::OutputTextDelta {
                                item_id: format!("msg_{output_index}"),
                                output_index,
                                delta: text.clone(),
                            },
                        )]
                    }
                    claude::BlockDelta::InputJsonDelta { partial_json }
                        if !partial_json.is_empty() =>
                    {
                        if let Some(call) = self.calls.get_mut(index) {
                            call.2.push_str(partial_json);
                        }
                        vec![piece(
                            Some("response.function_call_arguments.delta"),
                            &openai_responses::ResponseStreamEvent::FunctionCallArgumentsDelta {
                                item_id: format!("fc_{output_index}"),
                                output_index,
                                delta: partial_json.clone(),
                            },
                        )]
                    }
                    _ => Vec::new(),
                }
            }
            claude::StreamEvent::ContentBlockStop { index } => {
                let output_index = self.items.get(index).copied().unwrap_or(0);
                if let Some((call_id, name, arguments)) = self.calls.remove(index) {
                    let item = openai_responses::OutputItem::FunctionCall {
                        id: format!("fc_{call_id}"),
                        call_id,
                        name,
                        arguments,
                        status: "completed".to_string(),
                    };
                    vec![piece(
                        Some("response.output_item.done"),
                        &openai_responses::ResponseStreamEvent::OutputItemDone {
                            output_index,
                            item,
                        },
                    )]
                } else {
                    Vec::new()
                }
            }
            claude::StreamEvent::MessageDelta { usage, .. } => {
                if let Some(usage) = usage {
                    self.usage = Some(openai_responses::ResponseUsage {
                        input_tokens: usage.input_tokens.unwrap_or(0),
                        output_tokens: usage.output_tokens.unwrap_or(0),
                        total_tokens: usage.input_tokens.unwrap_or(0)
                            + usage.output_tokens.unwrap_or(0),
                    });
                }
                Vec::new()
            }
            claude::StreamEvent::MessageStop => self.finish(),
            claude::StreamEvent::Error { .. } => {
                self.completed = true;
                let response = self.response_object("failed");
                vec![piece(
                    Some("response.failed"),
                    &openai_responses::ResponseStreamEvent::Failed { response },
                )]
            }
            claude::StreamEvent::Ping => Vec::new(),
        }
    }

    fn finish(&mut self) -> Vec<StreamPiece> {
        if self.completed || !self.started {
            return Vec::new();
        }
        self.completed = true;
        let response = self.response_object("completed");
        vec![piece(
            Some("response.completed"),
            &openai_responses::ResponseStreamEvent::Completed { response },
        )]
    }
}

struct GeminiLower {
    model: String,
    /// Accumulated tool input per open Claude block index.
    pending_tool: Option<(String, String, String)>,
    usage: Option<gemini::UsageMetadata>,
}

impl GeminiLower {
    fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            pending_tool: None,
            usage: None,
        }
    }

    fn chunk(&self, parts: Vec<gemini::Part>, finish: Option<gemini::FinishReason>) -> StreamPiece {
        piece(
            None,
            &gemini::GenerateContentResponse {
                candidates: vec![gemini::Candidate {
                    content: gemini::Content {
                        role: Some("model".to_string()),
                        parts,
                    },
                    finish_reason: finish,
                    index: Some(0),
                }],
                usage_metadata: if finish.is_some() {
                    self.usage.clone()
                } else {
                    None
                },
                model_version: Some(self.model.clone()),
            },
        )
    }

    fn push(&mut self, event: &claude::StreamEvent) -> Vec<StreamPiece> {
        match event {
            claude::StreamEvent::ContentBlockStart {
                content_block: claude::StreamContentBlock::ToolUse { id, name, .. },
                ..
            } => {
                self.pending_tool = Some((id.clone(), name.clone(), String::new()));
                Vec::new()
            }
            claude::StreamEvent::ContentBlockDelta { delta, .. } => match delta {
                claude::BlockDelta::TextDelta { text } if !text.is_empty() => {
                    vec![self.chunk(vec![gemini::Part::Text(text.clone())], None)]
                }
                claude::BlockDelta::InputJsonDelta { partial_json } => {
                    if let Some(tool) = self.pending_tool.as_mut() {
                        tool.2.push_str(partial_json);
                    }
                    Vec::new()
                }
                _ => Vec::new(),
            },
            claude::StreamEvent::ContentBlockStop { .. } => {
                if let Some((id, name, arguments)) = self.pending_tool.take() {
                    vec![self.chunk(
                        vec![gemini::Part::FunctionCall(gemini::FunctionCall {
                            name,
                            args: parse_tool_arguments(&arguments),
                            id: Some(id),
                        })],
                        None,
                    )]
                } else {
                    Vec::new()
                }
            }
            claude::StreamEvent::MessageDelta { delta, usage } => {
                if let Some(usage) = usage {
                    self.usage = Some(gemini::UsageMetadata {
                        prompt_token_count: usage.input_tokens,
                        candidates_token_count: usage.output_tokens,
                        total_token_count: Some(
                            usage.input_tokens.unwrap_or(0) + usage.output_tokens.unwrap_or(0),
                        ),
                        cached_content_token_count: usage.cache_read_input_tokens,
                    });
                }
                let finish = delta.stop_reason.map(|reason| match reason {
                    claude::StopReason::MaxTokens => gemini::FinishReason::MaxTokens,
                    claude::StopReason::Refusal => gemini::FinishReason::Safety,
                    _ => gemini::FinishReason::Stop,
                });
                match finish {
                    Some(finish) => vec![self.chunk(Vec::new(), Some(finish))],
                    None => Vec::new(),
                }
            }
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claude_text_stream() -> Vec<claude::StreamEvent> {
        vec![
            claude::StreamEvent::MessageStart {
                message: claude::StreamMessageStart::synthetic("msg_1", "claude-sonnet-4"),
            },
            claude::StreamEvent::ContentBlockStart {
                index: 0,
                content_block: claude::StreamContentBlock::Text {
                    text: String::new(),
                },
            },
            claude::StreamEvent::ContentBlockDelta {
                index: 0,
                delta: claude::BlockDelta::TextDelta {
                    text: "Hello".to_string(),
                },
            },
            claude::StreamEvent::ContentBlockStop { index: 0 },
            claude::StreamEvent::MessageDelta {
                delta: claude::MessageDelta {
                    stop_reason: Some(claude::StopReason::EndTurn),
                    stop_sequence: None,
                },
                usage: Some(claude::Usage {
                    input_tokens: Some(3),
                    output_tokens: Some(1),
                    cache_read_input_tokens: None,
                }),
            },
            claude::StreamEvent::MessageStop,
        ]
    }

    #[test]
    fn gemini_chunk_lowers_to_openai_chunk() {
        let mut lift = StreamLift::new(Dialect::Gemini);
        let mut lower = StreamLower::new(Dialect::OpenAI, "gemini-2.5-pro");

        let chunk = serde_json::json!({
            "candidates": [{"content": {"role": "model", "parts": [{"text": "Hi"}]}}]
        });
        let events = lift.push(&chunk.to_string()).unwrap();
        let pieces: Vec<StreamPiece> = events.iter().flat_map(|e| lower.push(e)).collect();

        let text_piece = pieces
            .iter()
            .find_map(|piece| match piece {
                StreamPiece::Event { data, .. } => {
                    let value: JsonValue = serde_json::from_str(data).unwrap();
                    value["choices"][0]["delta"]["content"]
                        .as_str()
                        .map(str::to_string)
                }
                StreamPiece::Done => None,
            })
            .unwrap();
        assert_eq!(text_piece, "Hi");

        // Terminal chunk carries finish_reason stop and the stream ends with [DONE].
        let tail: Vec<StreamPiece> = lift
            .finish()
            .iter()
            .flat_map(|e| lower.push(e))
            .collect();
        let finish = tail.iter().any(|piece| match piece {
            StreamPiece::Event { data, .. } => data.contains("\"finish_reason\":\"stop\""),
            StreamPiece::Done => false,
        });
        assert!(finish);
        assert!(matches!(tail.last(), Some(StreamPiece::Done)));
    }

    #[test]
    fn claude_round_trip_through_openai_preserves_semantics() {
        // claude -> openai chunks -> claude again
        let mut lower = StreamLower::new(Dialect::OpenAI, "claude-sonnet-4");
        let mut lift = StreamLift::new(Dialect::OpenAI);

        let source = vec![
            claude::StreamEvent::MessageStart {
                message: claude::StreamMessageStart::synthetic("msg_1", "claude-sonnet-4"),
            },
            claude::StreamEvent::ContentBlockStart {
                index: 0,
                content_block: claude::StreamContentBlock::Text {
                    text: String::new(),
                },
            },
            claude::StreamEvent::ContentBlockDelta {
                index: 0,
                delta: claude::BlockDelta::TextDelta {
                    text: "let me check".to_string(),
                },
            },
            claude::StreamEvent::ContentBlockStop { index: 0 },
            claude::StreamEvent::ContentBlockStart {
                index: 1,
                content_block: claude::StreamContentBlock::ToolUse {
                    id: "toolu_1".to_string(),
                    name: "search".to_string(),
                    input: serde_json::json!({}),
                },
            },
            claude::StreamEvent::ContentBlockDelta {
                index: 1,
                delta: claude::BlockDelta::InputJsonDelta {
                    partial_json: "{\"q\":\"foo\"}".to_string(),
                },
            },
            claude::StreamEvent::ContentBlockStop { index: 1 },
            claude::StreamEvent::MessageDelta {
                delta: claude::MessageDelta {
                    stop_reason: Some(claude::StopReason::ToolUse),
                    stop_sequence: None,
                },
                usage: None,
            },
            claude::StreamEvent::MessageStop,
        ];

        let mut round_tripped = Vec::new();
        for event in &source {
            for piece in lower.push(event) {
                if let StreamPiece::Event { data, .. } = piece {
                    round_tripped.extend(lift.push(&data).unwrap());
                }
            }
        }
        round_tripped.extend(lift.finish());

        let text: String = round_tripped
            .iter()
            .filter_map(|event| match event {
                claude::StreamEvent::ContentBlockDelta {
                    delta: claude::BlockDelta::TextDelta { text },
                    ..
                } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "let me check");

        let tools: Vec<(String, String)> = round_tripped
            .iter()
            .filter_map(|event| match event {
                claude::StreamEvent::ContentBlockStart {
                    content_block: claude::StreamContentBlock::ToolUse { id, name, .. },
                    ..
                } => Some((id.clone(), name.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(tools, vec![("toolu_1".to_string(), "search".to_string())]);

        let json: String = round_tripped
            .iter()
            .filter_map(|event| match event {
                claude::StreamEvent::ContentBlockDelta {
                    delta: claude::BlockDelta::InputJsonDelta { partial_json },
                    ..
                } => Some(partial_json.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(json, "{\"q\":\"foo\"}");

        let stop = round_tripped.iter().find_map(|event| match event {
            claude::StreamEvent::MessageDelta { delta, .. } => delta.stop_reason,
            _ => None,
        });
        assert_eq!(stop, Some(claude::StopReason::ToolUse));
    }

    #[test]
    fn claude_lower_is_identity_with_event_names() {
        let mut lower = StreamLower::new(Dialect::Claude, "claude-sonnet-4");
        for event in claude_text_stream() {
            let pieces = lower.push(&event);
            assert_eq!(pieces.len(), 1);
            match &pieces[0] {
                StreamPiece::Event { name, .. } => {
                    assert_eq!(*name, Some(event.event_name()));
                }
                StreamPiece::Done => panic!("claude lower never emits [DONE]"),
            }
        }
    }

    #[test]
    fn responses_lower_emits_lifecycle_events() {
        let mut lower = StreamLower::new(Dialect::OpenAIResponses, "gpt-5");
        let mut names = Vec::new();
        for event in claude_text_stream() {
            for piece in lower.push(&event) {
                if let StreamPiece::Event { name, .. } = piece {
                    names.push(name.unwrap());
                }
            }
        }
        assert_eq!(names.first().copied(), Some("response.created"));
        assert!(names.contains(&"response.output_text.delta"));
        assert_eq!(names.last().copied(), Some("response.completed"));
    }
}
