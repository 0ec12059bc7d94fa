//! Anthropic Messages ⇄ unified.
//!
//! `system` is a top-level field, tool results live in user messages as
//! `tool_result` blocks, and streaming uses named events with
//! block-indexed deltas.

use std::collections::HashMap;

use serde_json::Value as JsonValue;

use plexus_protocol::messages::request::{
    ContentBlockParam, CreateMessageRequest, ImageSource as WireImageSource, MessageContent,
    MessageParam, MessageRole, SystemBlock, SystemParam, ThinkingConfig, ToolChoiceParam,
    ToolParam, ToolResultBlock, ToolResultContent,
};
use plexus_protocol::messages::response::{
    AssistantRole, ContentBlock, Message, MessageType, MessagesUsage, StopReason,
};
use plexus_protocol::messages::stream::{
    ContentBlockDelta, DeltaUsage, KnownStreamEvent, MessageDeltaBody, StreamEvent,
};
use plexus_protocol::sse::SseFrame;

use crate::dialect::{Dialect, StreamIds};
use crate::error::ParseError;
use crate::unified::{
    ContentPart, FinishReason, ImageSource, ReasoningConfig, Role, ThinkingBlock, ToolCall,
    ToolChoice, ToolDefinition, UnifiedMessage, UnifiedRequest, UnifiedResponse,
    UnifiedStreamChunk, UnifiedUsage,
};

const DIALECT: Dialect = Dialect::Messages;

/// The messages dialect requires `max_tokens`; used when a unified
/// request arrives without one.
pub const DEFAULT_MAX_TOKENS: u32 = 4096;

pub fn parse_request(raw: &[u8]) -> Result<UnifiedRequest, ParseError> {
    let request: CreateMessageRequest =
        serde_json::from_slice(raw).map_err(|err| ParseError::invalid_json(DIALECT, err))?;

    let mut messages = Vec::new();
    if let Some(system) = &request.system {
        messages.push(UnifiedMessage {
            role: Role::System,
            content: system_parts(system),
            name: None,
            tool_call_id: None,
            tool_calls: Vec::new(),
            thinking: None,
        });
    }
    for message in &request.messages {
        map_wire_message(message, &mut messages)?;
    }

    let tools = request
        .tools
        .unwrap_or_default()
        .into_iter()
        .map(|tool| ToolDefinition {
            name: tool.name,
            description: tool.description,
            parameters: Some(tool.input_schema),
        })
        .collect();

    Ok(UnifiedRequest {
        model: request.model,
        messages,
        tools,
        tool_choice: request.tool_choice.map(|choice| match choice {
            ToolChoiceParam::Auto => ToolChoice::Auto,
            ToolChoiceParam::Any => ToolChoice::Required,
            ToolChoiceParam::None => ToolChoice::None,
            ToolChoiceParam::Tool { name } => ToolChoice::Function { name },
        }),
        max_tokens: Some(request.max_tokens),
        temperature: request.temperature,
        top_p: request.top_p,
        stop: request.stop_sequences.unwrap_or_default(),
        stream: request.stream.unwrap_or(false),
        response_format: None,
        reasoning: request.thinking.map(|thinking| match thinking {
            ThinkingConfig::Enabled { budget_tokens } => ReasoningConfig {
                enabled: true,
                max_tokens: budget_tokens,
            },
            ThinkingConfig::Disabled => ReasoningConfig {
                enabled: false,
                max_tokens: None,
            },
        }),
        modalities: Vec::new(),
        image_config: None,
    })
}

fn system_parts(system: &SystemParam) -> Vec<ContentPart> {
    match system {
        SystemParam::Text(text) => vec![ContentPart::Text { text: text.clone() }],
        SystemParam::Blocks(blocks) => blocks
            .iter()
            .map(|SystemBlock::Text { text, .. }| ContentPart::Text { text: text.clone() })
            .collect(),
    }
}

/// A user message may interleave tool results with regular content; runs
/// of `tool_result` blocks split off into `Role::Tool` messages, in
/// order.
fn map_wire_message(
    message: &MessageParam,
    out: &mut Vec<UnifiedMessage>,
) -> Result<(), ParseError> {
    let blocks = match &message.content {
        MessageContent::Text(text) => {
            out.push(UnifiedMessage::text(role_of(message.role), text.clone()));
            return Ok(());
        }
        MessageContent::Blocks(blocks) => blocks,
    };

    match message.role {
        MessageRole::User => {
            let mut pending: Vec<ContentPart> = Vec::new();
            for block in blocks {
                match block {
                    ContentBlockParam::ToolResult {
                        tool_use_id,
                        content,
                        ..
                    } => {
                        flush_user_parts(&mut pending, out);
                        out.push(UnifiedMessage {
                            role: Role::Tool,
                            content: tool_result_parts(content.as_ref()),
                            name: None,
                            tool_call_id: Some(tool_use_id.clone()),
                            tool_calls: Vec::new(),
                            thinking: None,
                        });
                    }
                    ContentBlockParam::Text { text } => {
                        pending.push(ContentPart::Text { text: text.clone() });
                    }
                    ContentBlockParam::Image { source } => {
                        pending.push(image_part(source));
                    }
                    other => {
                        return Err(ParseError::new(
                            DIALECT,
                            "messages[].content",
                            format!("unexpected block in user message: {other:?}"),
                        ));
                    }
                }
            }
            flush_user_parts(&mut pending, out);
        }
        MessageRole::Assistant => {
            let mut unified = UnifiedMessage {
                role: Role::Assistant,
                content: Vec::new(),
                name: None,
                tool_call_id: None,
                tool_calls: Vec::new(),
                thinking: None,
            };
            for block in blocks {
                match block {
                    ContentBlockParam::Text { text } => {
                        unified.content.push(ContentPart::Text { text: text.clone() });
                    }
                    ContentBlockParam::ToolUse { id, name, input } => {
                        unified.tool_calls.push(ToolCall {
                            id: id.clone(),
                            name: name.clone(),
                            arguments: input.to_string(),
                        });
                    }
                    ContentBlockParam::Thinking {
                        thinking,
                        signature,
                    } => {
                        unified.thinking = Some(ThinkingBlock {
                            content: thinking.clone(),
                            signature: signature.clone().filter(|s| !s.is_empty()),
                        });
                    }
                    // Redacted thinking cannot survive a dialect hop.
                    ContentBlockParam::RedactedThinking { .. } => {}
                    other => {
                        return Err(ParseError::new(
                            DIALECT,
                            "messages[].content",
                            format!("unexpected block in assistant message: {other:?}"),
                        ));
                    }
                }
            }
            out.push(unified);
        }
    }
    Ok(())
}

fn flush_user_parts(pending: &mut Vec<ContentPart>, out: &mut Vec<UnifiedMessage>) {
    if pending.is_empty() {
        return;
    }
    out.push(UnifiedMessage {
        role: Role::User,
        content: std::mem::take(pending),
        name: None,
        tool_call_id: None,
        tool_calls: Vec::new(),
        thinking: None,
    });
}

fn role_of(role: MessageRole) -> Role {
    match role {
        MessageRole::User => Role::User,
        MessageRole::Assistant => Role::Assistant,
    }
}

fn tool_result_parts(content: Option<&ToolResultContent>) -> Vec<ContentPart> {
    match content {
        None => Vec::new(),
        Some(ToolResultContent::Text(text)) => vec![ContentPart::Text { text: text.clone() }],
        Some(ToolResultContent::Blocks(blocks)) => blocks
            .iter()
            .map(|block| match block {
                ToolResultBlock::Text { text } => ContentPart::Text { text: text.clone() },
                ToolResultBlock::Image { source } => image_part(source),
            })
            .collect(),
    }
}

fn image_part(source: &WireImageSource) -> ContentPart {
    match source {
        WireImageSource::Base64 { media_type, data } => ContentPart::Image {
            media_type: Some(media_type.clone()),
            source: ImageSource::Base64(data.clone()),
        },
        WireImageSource::Url { url } => ContentPart::Image {
            media_type: None,
            source: ImageSource::Url(url.clone()),
        },
    }
}

fn wire_image_source(media_type: Option<&str>, source: &ImageSource) -> WireImageSource {
    match source {
        ImageSource::Base64(data) => WireImageSource::Base64 {
            media_type: media_type.unwrap_or("image/png").to_string(),
            data: data.clone(),
        },
        ImageSource::Url(url) => WireImageSource::Url { url: url.clone() },
    }
}

pub fn emit_request(request: &UnifiedRequest) -> Result<Vec<u8>, ParseError> {
    let mut system_blocks: Vec<SystemBlock> = Vec::new();
    let mut messages: Vec<MessageParam> = Vec::new();
    let mut pending_tool_results: Vec<ContentBlockParam> = Vec::new();

    for message in &request.messages {
        if message.role != Role::Tool && !pending_tool_results.is_empty() {
            messages.push(MessageParam {
                role: MessageRole::User,
                content: MessageContent::Blocks(std::mem::take(&mut pending_tool_results)),
            });
        }
        match message.role {
            Role::System => {
                for part in &message.content {
                    if let ContentPart::Text { text } = part {
                        system_blocks.push(SystemBlock::Text {
                            text: text.clone(),
                            cache_control: None,
                        });
                    }
                }
            }
            Role::User => {
                let blocks: Vec<ContentBlockParam> = message
                    .content
                    .iter()
                    .map(|part| match part {
                        ContentPart::Text { text } => {
                            ContentBlockParam::Text { text: text.clone() }
                        }
                        ContentPart::Image { media_type, source } => ContentBlockParam::Image {
                            source: wire_image_source(media_type.as_deref(), source),
                        },
                    })
                    .collect();
                let content = match blocks.as_slice() {
                    [ContentBlockParam::Text { text }] => MessageContent::Text(text.clone()),
                    _ => MessageContent::Blocks(blocks),
                };
                messages.push(MessageParam {
                    role: MessageRole::User,
                    content,
                });
            }
            Role::Assistant => {
                let mut blocks = Vec::new();
                if let Some(thinking) = &message.thinking {
                    blocks.push(ContentBlockParam::Thinking {
                        thinking: thinking.content.clone(),
                        signature: thinking.signature.clone(),
                    });
                }
                for part in &message.content {
                    if let ContentPart::Text { text } = part {
                        blocks.push(ContentBlockParam::Text { text: text.clone() });
                    }
                }
                for call in &message.tool_calls {
                    blocks.push(ContentBlockParam::ToolUse {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        input: parse_arguments(&call.arguments),
                    });
                }
                let content = match blocks.as_slice() {
                    [ContentBlockParam::Text { text }] => MessageContent::Text(text.clone()),
                    _ => MessageContent::Blocks(blocks),
                };
                messages.push(MessageParam {
                    role: MessageRole::Assistant,
                    content,
                });
            }
            Role::Tool => {
                let parts = &message.content;
                let content = match parts.as_slice() {
                    [] => None,
                    [ContentPart::Text { text }] => Some(ToolResultContent::Text(text.clone())),
                    _ => Some(ToolResultContent::Blocks(
                        parts
                            .iter()
                            .map(|part| match part {
                                ContentPart::Text { text } => {
                                    ToolResultBlock::Text { text: text.clone() }
                                }
                                ContentPart::Image { media_type, source } => {
                                    ToolResultBlock::Image {
                                        source: wire_image_source(media_type.as_deref(), source),
                                    }
                                }
                            })
                            .collect(),
                    )),
                };
                pending_tool_results.push(ContentBlockParam::ToolResult {
                    tool_use_id: message.tool_call_id.clone().unwrap_or_default(),
                    content,
                    is_error: None,
                });
            }
        }
    }
    if !pending_tool_results.is_empty() {
        messages.push(MessageParam {
            role: MessageRole::User,
            content: MessageContent::Blocks(pending_tool_results),
        });
    }

    let system = match system_blocks.as_slice() {
        [] => None,
        [SystemBlock::Text { text, .. }] => Some(SystemParam::Text(text.clone())),
        _ => Some(SystemParam::Blocks(system_blocks)),
    };

    let tools: Vec<ToolParam> = request
        .tools
        .iter()
        .map(|tool| ToolParam {
            name: tool.name.clone(),
            description: tool.description.clone(),
            input_schema: tool
                .parameters
                .clone()
                .unwrap_or_else(|| serde_json::json!({ "type": "object" })),
        })
        .collect();

    let document = CreateMessageRequest {
        model: request.model.clone(),
        max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        messages,
        system,
        tools: (!tools.is_empty()).then_some(tools),
        tool_choice: request.tool_choice.as_ref().map(|choice| match choice {
            ToolChoice::Auto => ToolChoiceParam::Auto,
            ToolChoice::Required => ToolChoiceParam::Any,
            ToolChoice::None => ToolChoiceParam::None,
            ToolChoice::Function { name } => ToolChoiceParam::Tool { name: name.clone() },
        }),
        temperature: request.temperature,
        top_p: request.top_p,
        top_k: None,
        stop_sequences: (!request.stop.is_empty()).then(|| request.stop.clone()),
        stream: request.stream.then_some(true),
        metadata: None,
        thinking: request.reasoning.as_ref().map(|reasoning| {
            if reasoning.enabled {
                ThinkingConfig::Enabled {
                    budget_tokens: reasoning.max_tokens,
                }
            } else {
                ThinkingConfig::Disabled
            }
        }),
    };

    serde_json::to_vec(&document).map_err(|err| ParseError::new(DIALECT, "$", err.to_string()))
}

fn parse_arguments(arguments: &str) -> JsonValue {
    serde_json::from_str(arguments).unwrap_or_else(|_| serde_json::json!({}))
}

pub fn parse_response(raw: &[u8]) -> Result<UnifiedResponse, ParseError> {
    let message: Message =
        serde_json::from_slice(raw).map_err(|err| ParseError::invalid_json(DIALECT, err))?;
    Ok(unify_message(message))
}

fn unify_message(message: Message) -> UnifiedResponse {
    let mut content = Vec::new();
    let mut tool_calls = Vec::new();
    let mut thinking = None;
    for block in message.content {
        match block {
            ContentBlock::Text { text } => content.push(ContentPart::Text { text }),
            ContentBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                id,
                name,
                arguments: input.to_string(),
            }),
            ContentBlock::Thinking {
                thinking: text,
                signature,
            } => {
                thinking = Some(ThinkingBlock {
                    content: text,
                    signature: (!signature.is_empty()).then_some(signature),
                });
            }
            ContentBlock::RedactedThinking { .. } => {}
        }
    }

    UnifiedResponse {
        id: message.id,
        model: message.model,
        created: None,
        content,
        thinking,
        tool_calls,
        images: Vec::new(),
        finish_reason: message
            .stop_reason
            .map(finish_from_wire)
            .unwrap_or(FinishReason::Stop),
        usage: usage_from_wire(&message.usage),
    }
}

pub fn emit_response(response: &UnifiedResponse) -> Result<Vec<u8>, ParseError> {
    let message = Message {
        id: response.id.clone(),
        r#type: MessageType::Message,
        role: AssistantRole::Assistant,
        model: response.model.clone(),
        content: emit_content_blocks(response),
        stop_reason: Some(finish_to_wire(response.finish_reason)),
        stop_sequence: None,
        usage: usage_to_wire(&response.usage),
    };
    serde_json::to_vec(&message).map_err(|err| ParseError::new(DIALECT, "$", err.to_string()))
}

fn emit_content_blocks(response: &UnifiedResponse) -> Vec<ContentBlock> {
    let mut blocks = Vec::new();
    if let Some(thinking) = &response.thinking {
        blocks.push(ContentBlock::Thinking {
            thinking: thinking.content.clone(),
            signature: thinking.signature.clone().unwrap_or_default(),
        });
    }
    for part in &response.content {
        if let ContentPart::Text { text } = part {
            blocks.push(ContentBlock::Text { text: text.clone() });
        }
    }
    for call in &response.tool_calls {
        blocks.push(ContentBlock::ToolUse {
            id: call.id.clone(),
            name: call.name.clone(),
            input: parse_arguments(&call.arguments),
        });
    }
    blocks
}

fn finish_from_wire(reason: StopReason) -> FinishReason {
    match reason {
        StopReason::EndTurn | StopReason::StopSequence | StopReason::PauseTurn => {
            FinishReason::Stop
        }
        StopReason::MaxTokens => FinishReason::Length,
        StopReason::ToolUse => FinishReason::ToolCalls,
        StopReason::Refusal => FinishReason::ContentFilter,
    }
}

fn finish_to_wire(reason: FinishReason) -> StopReason {
    match reason {
        FinishReason::Stop | FinishReason::Error => StopReason::EndTurn,
        FinishReason::Length => StopReason::MaxTokens,
        FinishReason::ToolCalls => StopReason::ToolUse,
        FinishReason::ContentFilter => StopReason::Refusal,
    }
}

fn usage_from_wire(usage: &MessagesUsage) -> UnifiedUsage {
    UnifiedUsage {
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
        reasoning_tokens: 0,
        cache_read_tokens: usage.cache_read_input_tokens.unwrap_or(0),
        cache_creation_tokens: usage.cache_creation_input_tokens.unwrap_or(0),
        total_tokens: usage.input_tokens + usage.output_tokens,
    }
}

fn usage_to_wire(usage: &UnifiedUsage) -> MessagesUsage {
    MessagesUsage {
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
        cache_creation_input_tokens: (usage.cache_creation_tokens > 0)
            .then_some(usage.cache_creation_tokens),
        cache_read_input_tokens: (usage.cache_read_tokens > 0).then_some(usage.cache_read_tokens),
    }
}

/// Upstream messages SSE → unified chunks. Tracks which block index is
/// which tool call so `input_json_delta` fragments keep their index.
#[derive(Debug, Default)]
pub struct MessagesStreamDecoder {
    tool_by_block: HashMap<u32, u32>,
    next_tool_index: u32,
    usage: UnifiedUsage,
    done: bool,
}

impl MessagesStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, frame: &SseFrame) -> Result<Vec<UnifiedStreamChunk>, ParseError> {
        if frame.data.is_empty() {
            return Ok(Vec::new());
        }
        let event: StreamEvent = serde_json::from_str(&frame.data)
            .map_err(|err| ParseError::invalid_json(DIALECT, err))?;
        let StreamEvent::Known(event) = event else {
            return Ok(Vec::new());
        };

        Ok(match event {
            KnownStreamEvent::MessageStart { message } => {
                let usage = usage_from_wire(&message.usage);
                self.usage.input_tokens = usage.input_tokens;
                self.usage.cache_read_tokens = usage.cache_read_tokens;
                self.usage.cache_creation_tokens = usage.cache_creation_tokens;
                Vec::new()
            }
            KnownStreamEvent::ContentBlockStart {
                index,
                content_block,
            } => match content_block {
                ContentBlock::ToolUse { id, name, .. } => {
                    let tool_index = self.next_tool_index;
                    self.next_tool_index += 1;
                    self.tool_by_block.insert(index, tool_index);
                    vec![UnifiedStreamChunk::ToolCallDelta {
                        index: tool_index,
                        id: Some(id),
                        name: Some(name),
                        args_delta: None,
                    }]
                }
                ContentBlock::Text { text } if !text.is_empty() => {
                    vec![UnifiedStreamChunk::DeltaText { text }]
                }
                ContentBlock::Thinking { thinking, .. } if !thinking.is_empty() => {
                    vec![UnifiedStreamChunk::DeltaThinking {
                        text: thinking,
                        signature: None,
                    }]
                }
                _ => Vec::new(),
            },
            KnownStreamEvent::ContentBlockDelta { index, delta } => match delta {
                ContentBlockDelta::TextDelta { text } => {
                    vec![UnifiedStreamChunk::DeltaText { text }]
                }
                ContentBlockDelta::ThinkingDelta { thinking } => {
                    vec![UnifiedStreamChunk::DeltaThinking {
                        text: thinking,
                        signature: None,
                    }]
                }
                ContentBlockDelta::SignatureDelta { signature } => {
                    vec![UnifiedStreamChunk::DeltaThinking {
                        text: String::new(),
                        signature: Some(signature),
                    }]
                }
                ContentBlockDelta::InputJsonDelta { partial_json } => {
                    let tool_index = self.tool_by_block.get(&index).copied().unwrap_or(0);
                    vec![UnifiedStreamChunk::ToolCallDelta {
                        index: tool_index,
                        id: None,
                        name: None,
                        args_delta: Some(partial_json),
                    }]
                }
            },
            KnownStreamEvent::ContentBlockStop { .. } => Vec::new(),
            KnownStreamEvent::MessageDelta { delta, usage } => {
                if let Some(usage) = usage {
                    self.merge_delta_usage(&usage);
                }
                let mut out = vec![UnifiedStreamChunk::Usage(self.totaled_usage())];
                if let Some(stop_reason) = delta.stop_reason {
                    self.done = true;
                    out.push(UnifiedStreamChunk::Done {
                        finish_reason: finish_from_wire(stop_reason),
                    });
                }
                out
            }
            KnownStreamEvent::MessageStop => {
                if self.done {
                    Vec::new()
                } else {
                    self.done = true;
                    vec![UnifiedStreamChunk::Done {
                        finish_reason: FinishReason::Stop,
                    }]
                }
            }
            KnownStreamEvent::Ping => Vec::new(),
            KnownStreamEvent::Error { .. } => {
                self.done = true;
                vec![UnifiedStreamChunk::Done {
                    finish_reason: FinishReason::Error,
                }]
            }
        })
    }

    fn merge_delta_usage(&mut self, usage: &DeltaUsage) {
        if let Some(input) = usage.input_tokens {
            self.usage.input_tokens = input;
        }
        if let Some(output) = usage.output_tokens {
            self.usage.output_tokens = output;
        }
        if let Some(read) = usage.cache_read_input_tokens {
            self.usage.cache_read_tokens = read;
        }
        if let Some(creation) = usage.cache_creation_input_tokens {
            self.usage.cache_creation_tokens = creation;
        }
    }

    fn totaled_usage(&self) -> UnifiedUsage {
        let mut usage = self.usage;
        usage.total_tokens = usage.input_tokens + usage.output_tokens;
        usage
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenKind {
    Text,
    Thinking,
    Tool(u32),
}

/// Unified chunks → client messages SSE. Owns the block lifecycle:
/// `message_start`, per-block start/delta/stop, `message_delta` with the
/// final usage, `message_stop`.
#[derive(Debug)]
pub struct MessagesStreamEncoder {
    ids: StreamIds,
    started: bool,
    open: Option<(u32, OpenKind)>,
    next_index: u32,
    usage: UnifiedUsage,
    finish: Option<FinishReason>,
}

impl MessagesStreamEncoder {
    pub fn new(ids: StreamIds) -> Self {
        Self {
            ids,
            started: false,
            open: None,
            next_index: 0,
            usage: UnifiedUsage::default(),
            finish: None,
        }
    }

    fn event_frame(event: &KnownStreamEvent) -> SseFrame {
        let name = match event {
            KnownStreamEvent::MessageStart { .. } => "message_start",
            KnownStreamEvent::ContentBlockStart { .. } => "content_block_start",
            KnownStreamEvent::ContentBlockDelta { .. } => "content_block_delta",
            KnownStreamEvent::ContentBlockStop { .. } => "content_block_stop",
            KnownStreamEvent::MessageDelta { .. } => "message_delta",
            KnownStreamEvent::MessageStop => "message_stop",
            KnownStreamEvent::Ping => "ping",
            KnownStreamEvent::Error { .. } => "error",
        };
        SseFrame::named(name, serde_json::to_string(event).unwrap_or_default())
    }

    fn ensure_started(&mut self, frames: &mut Vec<SseFrame>) {
        if self.started {
            return;
        }
        self.started = true;
        frames.push(Self::event_frame(&KnownStreamEvent::MessageStart {
            message: Message {
                id: self.ids.response_id.clone(),
                r#type: MessageType::Message,
                role: AssistantRole::Assistant,
                model: self.ids.model.clone(),
                content: Vec::new(),
                stop_reason: None,
                stop_sequence: None,
                usage: MessagesUsage::default(),
            },
        }));
    }

    fn close_open(&mut self, frames: &mut Vec<SseFrame>) {
        if let Some((index, _)) = self.open.take() {
            frames.push(Self::event_frame(&KnownStreamEvent::ContentBlockStop {
                index,
            }));
        }
    }

    fn open_block(&mut self, kind: OpenKind, block: ContentBlock, frames: &mut Vec<SseFrame>) -> u32 {
        self.close_open(frames);
        let index = self.next_index;
        self.next_index += 1;
        self.open = Some((index, kind));
        frames.push(Self::event_frame(&KnownStreamEvent::ContentBlockStart {
            index,
            content_block: block,
        }));
        index
    }

    fn ensure_block(&mut self, kind: OpenKind, frames: &mut Vec<SseFrame>) -> u32 {
        if let Some((index, open_kind)) = self.open
            && open_kind == kind
        {
            return index;
        }
        let block = match kind {
            OpenKind::Text => ContentBlock::Text {
                text: String::new(),
            },
            OpenKind::Thinking => ContentBlock::Thinking {
                thinking: String::new(),
                signature: String::new(),
            },
            // Tool blocks are opened explicitly with id/name.
            OpenKind::Tool(_) => ContentBlock::Text {
                text: String::new(),
            },
        };
        self.open_block(kind, block, frames)
    }

    pub fn encode(&mut self, chunk: &UnifiedStreamChunk) -> Vec<SseFrame> {
        let mut frames = Vec::new();
        self.ensure_started(&mut frames);
        match chunk {
            UnifiedStreamChunk::DeltaText { text } => {
                let index = self.ensure_block(OpenKind::Text, &mut frames);
                frames.push(Self::event_frame(&KnownStreamEvent::ContentBlockDelta {
                    index,
                    delta: ContentBlockDelta::TextDelta { text: text.clone() },
                }));
            }
            UnifiedStreamChunk::DeltaThinking { text, signature } => {
                let index = self.ensure_block(OpenKind::Thinking, &mut frames);
                if !text.is_empty() {
                    frames.push(Self::event_frame(&KnownStreamEvent::ContentBlockDelta {
                        index,
                        delta: ContentBlockDelta::ThinkingDelta {
                            thinking: text.clone(),
                        },
                    }));
                }
                if let Some(signature) = signature {
                    frames.push(Self::event_frame(&KnownStreamEvent::ContentBlockDelta {
                        index,
                        delta: ContentBlockDelta::SignatureDelta {
                            signature: signature.clone(),
                        },
                    }));
                }
            }
            UnifiedStreamChunk::ToolCallDelta {
                index: tool_index,
                id,
                name,
                args_delta,
            } => {
                let open_tool = matches!(self.open, Some((_, OpenKind::Tool(open)))
                    if open == *tool_index);
                let block_index = if open_tool {
                    self.open.map(|(index, _)| index).unwrap_or(0)
                } else {
                    self.open_block(
                        OpenKind::Tool(*tool_index),
                        ContentBlock::ToolUse {
                            id: id
                                .clone()
                                .unwrap_or_else(|| format!("toolu_{tool_index}")),
                            name: name.clone().unwrap_or_default(),
                            input: serde_json::json!({}),
                        },
                        &mut frames,
                    )
                };
                if let Some(args) = args_delta
                    && !args.is_empty()
                {
                    frames.push(Self::event_frame(&KnownStreamEvent::ContentBlockDelta {
                        index: block_index,
                        delta: ContentBlockDelta::InputJsonDelta {
                            partial_json: args.clone(),
                        },
                    }));
                }
            }
            // Messages streams do not carry inline image parts.
            UnifiedStreamChunk::ImagePart { .. } => {}
            UnifiedStreamChunk::Usage(usage) => {
                self.usage = *usage;
            }
            UnifiedStreamChunk::Done { finish_reason } => {
                self.finish = Some(*finish_reason);
            }
        }
        frames
    }

    pub fn finish(&mut self) -> Vec<SseFrame> {
        let mut frames = Vec::new();
        self.ensure_started(&mut frames);
        self.close_open(&mut frames);
        frames.push(Self::event_frame(&KnownStreamEvent::MessageDelta {
            delta: MessageDeltaBody {
                stop_reason: Some(finish_to_wire(self.finish.unwrap_or(FinishReason::Stop))),
                stop_sequence: None,
            },
            usage: Some(DeltaUsage {
                input_tokens: Some(self.usage.input_tokens),
                output_tokens: Some(self.usage.output_tokens),
                cache_creation_input_tokens: (self.usage.cache_creation_tokens > 0)
                    .then_some(self.usage.cache_creation_tokens),
                cache_read_input_tokens: (self.usage.cache_read_tokens > 0)
                    .then_some(self.usage.cache_read_tokens),
            }),
        }));
        frames.push(Self::event_frame(&KnownStreamEvent::MessageStop));
        frames
    }

    pub fn encode_error(&mut self, message: &str) -> Vec<SseFrame> {
        let mut frames = Vec::new();
        self.ensure_started(&mut frames);
        self.close_open(&mut frames);
        frames.push(Self::event_frame(&KnownStreamEvent::Error {
            error: serde_json::json!({ "type": "api_error", "message": message }),
        }));
        frames.push(Self::event_frame(&KnownStreamEvent::MessageStop));
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips_with_system_and_tool_results() {
        let raw = serde_json::json!({
            "model": "claude-sonnet-4",
            "max_tokens": 512,
            "system": "stay terse",
            "messages": [
                {"role": "user", "content": "ping"},
                {"role": "assistant", "content": [
                    {"type": "thinking", "thinking": "hmm", "signature": "sig=="},
                    {"type": "text", "text": "let me check"},
                    {"type": "tool_use", "id": "toolu_1", "name": "probe", "input": {"t": 1}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_1", "content": "pong"},
                    {"type": "text", "text": "and now?"}
                ]}
            ],
            "tool_choice": {"type": "any"},
            "thinking": {"type": "enabled", "budget_tokens": 128}
        })
        .to_string();

        let unified = parse_request(raw.as_bytes()).unwrap();
        assert_eq!(unified.messages[0].role, Role::System);
        assert_eq!(unified.messages[2].tool_calls[0].name, "probe");
        assert_eq!(unified.messages[3].role, Role::Tool);
        assert_eq!(unified.messages[4].role, Role::User);
        assert_eq!(unified.tool_choice, Some(ToolChoice::Required));
        assert_eq!(
            unified.reasoning,
            Some(ReasoningConfig {
                enabled: true,
                max_tokens: Some(128)
            })
        );

        let reparsed = parse_request(&emit_request(&unified).unwrap()).unwrap();
        assert_eq!(unified, reparsed);
    }

    #[test]
    fn response_round_trips_and_keeps_cache_lines_distinct() {
        let raw = serde_json::json!({
            "id": "msg_1", "type": "message", "role": "assistant",
            "model": "claude-sonnet-4",
            "content": [{"type": "text", "text": "hi"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 9, "output_tokens": 3,
                      "cache_read_input_tokens": 100, "cache_creation_input_tokens": 20}
        })
        .to_string();
        let unified = parse_response(raw.as_bytes()).unwrap();
        assert_eq!(unified.usage.cache_read_tokens, 100);
        assert_eq!(unified.usage.cache_creation_tokens, 20);
        assert_eq!(unified.usage.input_tokens, 9);

        let reparsed = parse_response(&emit_response(&unified).unwrap()).unwrap();
        assert_eq!(unified, reparsed);
    }

    fn frame(event: &str, data: serde_json::Value) -> SseFrame {
        SseFrame::named(event, data.to_string())
    }

    #[test]
    fn decoder_tracks_tool_indices_and_usage() {
        let mut decoder = MessagesStreamDecoder::new();
        decoder
            .push(&frame(
                "message_start",
                serde_json::json!({"type": "message_start", "message": {
                    "id": "msg_1", "type": "message", "role": "assistant",
                    "model": "m", "content": [],
                    "usage": {"input_tokens": 7, "output_tokens": 0}}}),
            ))
            .unwrap();
        let chunks = decoder
            .push(&frame(
                "content_block_start",
                serde_json::json!({"type": "content_block_start", "index": 2,
                    "content_block": {"type": "tool_use", "id": "t1", "name": "probe", "input": {}}}),
            ))
            .unwrap();
        assert_eq!(
            chunks[0],
            UnifiedStreamChunk::ToolCallDelta {
                index: 0,
                id: Some("t1".into()),
                name: Some("probe".into()),
                args_delta: None,
            }
        );
        let chunks = decoder
            .push(&frame(
                "content_block_delta",
                serde_json::json!({"type": "content_block_delta", "index": 2,
                    "delta": {"type": "input_json_delta", "partial_json": "{\"t\":"}}),
            ))
            .unwrap();
        assert_eq!(
            chunks[0],
            UnifiedStreamChunk::ToolCallDelta {
                index: 0,
                id: None,
                name: None,
                args_delta: Some("{\"t\":".into()),
            }
        );

        let chunks = decoder
            .push(&frame(
                "message_delta",
                serde_json::json!({"type": "message_delta",
                    "delta": {"stop_reason": "tool_use"},
                    "usage": {"output_tokens": 5}}),
            ))
            .unwrap();
        assert_eq!(
            chunks[0],
            UnifiedStreamChunk::Usage(UnifiedUsage {
                input_tokens: 7,
                output_tokens: 5,
                total_tokens: 12,
                ..Default::default()
            })
        );
        assert_eq!(
            chunks[1],
            UnifiedStreamChunk::Done {
                finish_reason: FinishReason::ToolCalls
            }
        );
        assert!(
            decoder
                .push(&frame("message_stop", serde_json::json!({"type": "message_stop"})))
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn encoder_produces_the_named_event_lifecycle() {
        let mut encoder = MessagesStreamEncoder::new(StreamIds {
            response_id: "msg_9".into(),
            model: "claude-sonnet-4".into(),
            created: 0,
        });
        let first = encoder.encode(&UnifiedStreamChunk::DeltaText { text: "he".into() });
        let names: Vec<_> = first.iter().filter_map(|f| f.event.clone()).collect();
        assert_eq!(
            names,
            vec!["message_start", "content_block_start", "content_block_delta"]
        );

        encoder.encode(&UnifiedStreamChunk::Usage(UnifiedUsage {
            input_tokens: 2,
            output_tokens: 6,
            total_tokens: 8,
            ..Default::default()
        }));
        encoder.encode(&UnifiedStreamChunk::Done {
            finish_reason: FinishReason::Stop,
        });
        let tail = encoder.finish();
        let names: Vec<_> = tail.iter().filter_map(|f| f.event.clone()).collect();
        assert_eq!(
            names,
            vec!["content_block_stop", "message_delta", "message_stop"]
        );
        assert!(tail[1].data.contains("\"end_turn\""));
        assert!(tail[1].data.contains("\"output_tokens\":6"));
    }
}
