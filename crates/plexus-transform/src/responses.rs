//! OpenAI Responses ⇄ unified.
//!
//! `input` is a string or structured item list; streaming is a typed
//! event lifecycle from `response.created` through `response.completed`.
//! Usage rule: `input_tokens` stays "uncached input" even when
//! `cached_tokens` exceeds it; `total_tokens` is authoritative.

use std::collections::BTreeMap;

use plexus_protocol::responses::request::{
    CreateResponseRequest, InputContentPart, InputItem, ItemContent, ItemRole, NamedToolChoice,
    ReasoningParam, ResponseInput, ResponsesTool, ResponsesToolChoice, TextConfig, TextFormat,
    ToolChoiceMode,
};
use plexus_protocol::responses::response::{
    IncompleteDetails, InputTokensDetails, OutputContent, OutputItem, OutputTokensDetails,
    Response, ResponseStatus, ResponsesUsage, SummaryPart,
};
use plexus_protocol::responses::stream::{KnownStreamEvent, StreamEvent};
use plexus_protocol::sse::SseFrame;

use crate::dialect::{Dialect, StreamIds};
use crate::error::ParseError;
use crate::unified::{
    ContentPart, FinishReason, ImageSource, ReasoningConfig, ResponseFormat, Role, ThinkingBlock,
    ToolCall, ToolChoice, ToolDefinition, UnifiedMessage, UnifiedRequest, UnifiedResponse,
    UnifiedStreamChunk, UnifiedUsage,
};

const DIALECT: Dialect = Dialect::Responses;

pub fn parse_request(raw: &[u8]) -> Result<UnifiedRequest, ParseError> {
    let request: CreateResponseRequest =
        serde_json::from_slice(raw).map_err(|err| ParseError::invalid_json(DIALECT, err))?;

    let mut messages = Vec::new();
    if let Some(instructions) = &request.instructions {
        messages.push(UnifiedMessage::text(Role::System, instructions.clone()));
    }
    match &request.input {
        ResponseInput::Text(text) => {
            messages.push(UnifiedMessage::text(Role::User, text.clone()));
        }
        ResponseInput::Items(items) => {
            for item in items {
                map_input_item(item, &mut messages);
            }
        }
    }

    let tools = request
        .tools
        .unwrap_or_default()
        .into_iter()
        .map(|tool| {
            let ResponsesTool::Function {
                name,
                description,
                parameters,
                ..
            } = tool;
            ToolDefinition {
                name,
                description,
                parameters,
            }
        })
        .collect();

    Ok(UnifiedRequest {
        model: request.model,
        messages,
        tools,
        tool_choice: request.tool_choice.map(|choice| match choice {
            ResponsesToolChoice::Mode(ToolChoiceMode::Auto) => ToolChoice::Auto,
            ResponsesToolChoice::Mode(ToolChoiceMode::None) => ToolChoice::None,
            ResponsesToolChoice::Mode(ToolChoiceMode::Required) => ToolChoice::Required,
            ResponsesToolChoice::Named(NamedToolChoice::Function { name }) => {
                ToolChoice::Function { name }
            }
        }),
        max_tokens: request.max_output_tokens,
        temperature: request.temperature,
        top_p: request.top_p,
        stop: Vec::new(),
        stream: request.stream.unwrap_or(false),
        response_format: request
            .text
            .and_then(|text| text.format)
            .map(|format| match format {
                TextFormat::Text => ResponseFormat::Text,
                TextFormat::JsonObject => ResponseFormat::JsonObject,
                TextFormat::JsonSchema { name, schema, .. } => {
                    ResponseFormat::JsonSchema { name, schema }
                }
            }),
        reasoning: request.reasoning.map(|reasoning| ReasoningConfig {
            enabled: true,
            max_tokens: reasoning.max_tokens,
        }),
        modalities: Vec::new(),
        image_config: None,
    })
}

fn map_input_item(item: &InputItem, out: &mut Vec<UnifiedMessage>) {
    match item {
        InputItem::Message { role, content } => {
            let unified_role = match role {
                ItemRole::System | ItemRole::Developer => Role::System,
                ItemRole::User => Role::User,
                ItemRole::Assistant => Role::Assistant,
            };
            out.push(UnifiedMessage {
                role: unified_role,
                content: item_content_parts(content),
                name: None,
                tool_call_id: None,
                tool_calls: Vec::new(),
                thinking: None,
            });
        }
        InputItem::FunctionCall {
            call_id,
            name,
            arguments,
            ..
        } => {
            let call = ToolCall {
                id: call_id.clone(),
                name: name.clone(),
                arguments: arguments.clone(),
            };
            // Consecutive call items attach to the assistant turn above.
            match out.last_mut() {
                Some(last) if last.role == Role::Assistant => last.tool_calls.push(call),
                _ => out.push(UnifiedMessage {
                    role: Role::Assistant,
                    content: Vec::new(),
                    name: None,
                    tool_call_id: None,
                    tool_calls: vec![call],
                    thinking: None,
                }),
            }
        }
        InputItem::FunctionCallOutput { call_id, output } => {
            out.push(UnifiedMessage {
                role: Role::Tool,
                content: vec![ContentPart::Text {
                    text: output.clone(),
                }],
                name: None,
                tool_call_id: Some(call_id.clone()),
                tool_calls: Vec::new(),
                thinking: None,
            });
        }
        // Encrypted reasoning items cannot be carried across providers.
        InputItem::Reasoning { .. } => {}
    }
}

fn item_content_parts(content: &ItemContent) -> Vec<ContentPart> {
    match content {
        ItemContent::Text(text) => vec![ContentPart::Text { text: text.clone() }],
        ItemContent::Parts(parts) => parts
            .iter()
            .filter_map(|part| match part {
                InputContentPart::InputText { text } | InputContentPart::OutputText { text } => {
                    Some(ContentPart::Text { text: text.clone() })
                }
                InputContentPart::InputImage { image_url, .. } => {
                    image_url.as_ref().map(|url| image_part_from_url(url))
                }
                InputContentPart::Refusal { .. } => None,
            })
            .collect(),
    }
}

fn image_part_from_url(url: &str) -> ContentPart {
    if let Some(rest) = url.strip_prefix("data:")
        && let Some((meta, payload)) = rest.split_once(";base64,")
    {
        return ContentPart::Image {
            media_type: (!meta.is_empty()).then(|| meta.to_string()),
            source: ImageSource::Base64(payload.to_string()),
        };
    }
    ContentPart::Image {
        media_type: None,
        source: ImageSource::Url(url.to_string()),
    }
}

pub fn emit_request(request: &UnifiedRequest) -> Result<Vec<u8>, ParseError> {
    let mut instructions = None;
    let mut items: Vec<InputItem> = Vec::new();

    for message in &request.messages {
        match message.role {
            Role::System => {
                if instructions.is_none() {
                    instructions = Some(message.joined_text());
                } else {
                    items.push(InputItem::Message {
                        role: ItemRole::System,
                        content: emit_item_content(message, ItemRole::System),
                    });
                }
            }
            Role::User => items.push(InputItem::Message {
                role: ItemRole::User,
                content: emit_item_content(message, ItemRole::User),
            }),
            Role::Assistant => {
                if !message.content.is_empty() {
                    items.push(InputItem::Message {
                        role: ItemRole::Assistant,
                        content: emit_item_content(message, ItemRole::Assistant),
                    });
                }
                for call in &message.tool_calls {
                    items.push(InputItem::FunctionCall {
                        id: None,
                        call_id: call.id.clone(),
                        name: call.name.clone(),
                        arguments: call.arguments.clone(),
                    });
                }
            }
            Role::Tool => items.push(InputItem::FunctionCallOutput {
                call_id: message.tool_call_id.clone().unwrap_or_default(),
                output: message.joined_text(),
            }),
        }
    }

    let tools: Vec<ResponsesTool> = request
        .tools
        .iter()
        .map(|tool| ResponsesTool::Function {
            name: tool.name.clone(),
            description: tool.description.clone(),
            parameters: tool.parameters.clone(),
            strict: None,
        })
        .collect();

    let document = CreateResponseRequest {
        model: request.model.clone(),
        input: ResponseInput::Items(items),
        instructions,
        tools: (!tools.is_empty()).then_some(tools),
        tool_choice: request.tool_choice.as_ref().map(|choice| match choice {
            ToolChoice::Auto => ResponsesToolChoice::Mode(ToolChoiceMode::Auto),
            ToolChoice::None => ResponsesToolChoice::Mode(ToolChoiceMode::None),
            ToolChoice::Required => ResponsesToolChoice::Mode(ToolChoiceMode::Required),
            ToolChoice::Function { name } => {
                ResponsesToolChoice::Named(NamedToolChoice::Function { name: name.clone() })
            }
        }),
        max_output_tokens: request.max_tokens,
        temperature: request.temperature,
        top_p: request.top_p,
        stream: request.stream.then_some(true),
        reasoning: request.reasoning.as_ref().map(|reasoning| ReasoningParam {
            effort: None,
            max_tokens: reasoning.max_tokens,
        }),
        text: request.response_format.as_ref().map(|format| TextConfig {
            format: Some(match format {
                ResponseFormat::Text => TextFormat::Text,
                ResponseFormat::JsonObject => TextFormat::JsonObject,
                ResponseFormat::JsonSchema { name, schema } => TextFormat::JsonSchema {
                    name: name.clone(),
                    schema: schema.clone(),
                    strict: None,
                },
            }),
        }),
    };

    serde_json::to_vec(&document).map_err(|err| ParseError::new(DIALECT, "$", err.to_string()))
}

fn emit_item_content(message: &UnifiedMessage, role: ItemRole) -> ItemContent {
    let parts: Vec<InputContentPart> = message
        .content
        .iter()
        .map(|part| match part {
            ContentPart::Text { text } => match role {
                ItemRole::Assistant => InputContentPart::OutputText { text: text.clone() },
                _ => InputContentPart::InputText { text: text.clone() },
            },
            ContentPart::Image { media_type, source } => InputContentPart::InputImage {
                image_url: Some(match source {
                    ImageSource::Url(url) => url.clone(),
                    ImageSource::Base64(data) => {
                        format!("data:{};base64,{data}", media_type.as_deref().unwrap_or(""))
                    }
                }),
                detail: None,
            },
        })
        .collect();
    match parts.as_slice() {
        [InputContentPart::InputText { text }] => ItemContent::Text(text.clone()),
        _ => ItemContent::Parts(parts),
    }
}

pub fn parse_response(raw: &[u8]) -> Result<UnifiedResponse, ParseError> {
    let response: Response =
        serde_json::from_slice(raw).map_err(|err| ParseError::invalid_json(DIALECT, err))?;
    Ok(unify_response(&response))
}

fn unify_response(response: &Response) -> UnifiedResponse {
    let mut content = Vec::new();
    let mut tool_calls = Vec::new();
    let mut thinking: Option<ThinkingBlock> = None;

    for item in &response.output {
        match item {
            OutputItem::Message {
                content: item_content,
                ..
            } => {
                for part in item_content {
                    if let OutputContent::OutputText { text, .. } = part {
                        content.push(ContentPart::Text { text: text.clone() });
                    }
                }
            }
            OutputItem::FunctionCall {
                call_id,
                name,
                arguments,
                ..
            } => tool_calls.push(ToolCall {
                id: call_id.clone(),
                name: name.clone(),
                arguments: arguments.clone(),
            }),
            OutputItem::Reasoning { summary, .. } => {
                let text: String = summary
                    .iter()
                    .flatten()
                    .map(|SummaryPart::SummaryText { text }| text.as_str())
                    .collect();
                if !text.is_empty() {
                    thinking = Some(ThinkingBlock {
                        content: text,
                        signature: None,
                    });
                }
            }
        }
    }

    UnifiedResponse {
        id: response.id.clone(),
        model: response.model.clone(),
        created: Some(response.created_at),
        content,
        thinking,
        tool_calls: tool_calls.clone(),
        images: Vec::new(),
        finish_reason: finish_from_status(response, !tool_calls.is_empty()),
        usage: response.usage.as_ref().map(usage_from_wire).unwrap_or_default(),
    }
}

fn finish_from_status(response: &Response, has_tools: bool) -> FinishReason {
    match response.status {
        ResponseStatus::Completed => {
            if has_tools {
                FinishReason::ToolCalls
            } else {
                FinishReason::Stop
            }
        }
        ResponseStatus::Incomplete => {
            match response
                .incomplete_details
                .as_ref()
                .and_then(|details| details.reason.as_deref())
            {
                Some("max_output_tokens") => FinishReason::Length,
                Some("content_filter") => FinishReason::ContentFilter,
                _ => FinishReason::Stop,
            }
        }
        ResponseStatus::Failed => FinishReason::Error,
        ResponseStatus::InProgress | ResponseStatus::Queued => FinishReason::Stop,
    }
}

pub fn emit_response(response: &UnifiedResponse) -> Result<Vec<u8>, ParseError> {
    let document = build_wire_response(response);
    serde_json::to_vec(&document).map_err(|err| ParseError::new(DIALECT, "$", err.to_string()))
}

fn build_wire_response(response: &UnifiedResponse) -> Response {
    let mut output = Vec::new();
    if let Some(thinking) = &response.thinking {
        output.push(OutputItem::Reasoning {
            id: None,
            summary: Some(vec![SummaryPart::SummaryText {
                text: thinking.content.clone(),
            }]),
            content: None,
            encrypted_content: None,
        });
    }
    let text = response.joined_text();
    if !text.is_empty() {
        output.push(OutputItem::Message {
            id: None,
            role: "assistant".to_string(),
            status: Some("completed".to_string()),
            content: vec![OutputContent::OutputText {
                text,
                annotations: Vec::new(),
            }],
        });
    }
    for call in &response.tool_calls {
        output.push(OutputItem::FunctionCall {
            id: None,
            call_id: call.id.clone(),
            name: call.name.clone(),
            arguments: call.arguments.clone(),
            status: Some("completed".to_string()),
        });
    }

    let (status, incomplete_details) = match response.finish_reason {
        FinishReason::Stop | FinishReason::ToolCalls => (ResponseStatus::Completed, None),
        FinishReason::Length => (
            ResponseStatus::Incomplete,
            Some(IncompleteDetails {
                reason: Some("max_output_tokens".to_string()),
            }),
        ),
        FinishReason::ContentFilter => (
            ResponseStatus::Incomplete,
            Some(IncompleteDetails {
                reason: Some("content_filter".to_string()),
            }),
        ),
        FinishReason::Error => (ResponseStatus::Failed, None),
    };

    Response {
        id: response.id.clone(),
        object: "response".to_string(),
        created_at: response.created.unwrap_or(0),
        model: response.model.clone(),
        status,
        output,
        usage: Some(usage_to_wire(&response.usage)),
        incomplete_details,
        error: None,
    }
}

/// No subtraction: `input_tokens` is already "uncached input" on this
/// wire; `cached_tokens` may legitimately exceed it.
fn usage_from_wire(usage: &ResponsesUsage) -> UnifiedUsage {
    UnifiedUsage {
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
        total_tokens: usage.total_tokens,
        cache_read_tokens: usage
            .input_tokens_details
            .as_ref()
            .map(|details| details.cached_tokens)
            .unwrap_or(0),
        reasoning_tokens: usage
            .output_tokens_details
            .as_ref()
            .map(|details| details.reasoning_tokens)
            .unwrap_or(0),
        cache_creation_tokens: 0,
    }
}

fn usage_to_wire(usage: &UnifiedUsage) -> ResponsesUsage {
    ResponsesUsage {
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
        total_tokens: usage.total_tokens,
        input_tokens_details: Some(InputTokensDetails {
            cached_tokens: usage.cache_read_tokens,
        }),
        output_tokens_details: Some(OutputTokensDetails {
            reasoning_tokens: usage.reasoning_tokens,
        }),
    }
}

/// Upstream responses SSE → unified chunks.
#[derive(Debug, Default)]
pub struct ResponsesStreamDecoder {
    tool_by_output: BTreeMap<u32, u32>,
    saw_args_delta: BTreeMap<u32, bool>,
    next_tool_index: u32,
    done: bool,
}

impl ResponsesStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, frame: &SseFrame) -> Result<Vec<UnifiedStreamChunk>, ParseError> {
        if frame.data.is_empty() || frame.data == "[DONE]" {
            return Ok(Vec::new());
        }
        let event: StreamEvent = serde_json::from_str(&frame.data)
            .map_err(|err| ParseError::invalid_json(DIALECT, err))?;
        let StreamEvent::Known(event) = event else {
            return Ok(Vec::new());
        };

        Ok(match event {
            KnownStreamEvent::OutputItemAdded { output_index, item } => match item {
                OutputItem::FunctionCall { call_id, name, .. } => {
                    let tool_index = self.next_tool_index;
                    self.next_tool_index += 1;
                    self.tool_by_output.insert(output_index, tool_index);
                    vec![UnifiedStreamChunk::ToolCallDelta {
                        index: tool_index,
                        id: Some(call_id),
                        name: Some(name),
                        args_delta: None,
                    }]
                }
                _ => Vec::new(),
            },
            KnownStreamEvent::OutputTextDelta { delta, .. } => {
                if delta.is_empty() {
                    Vec::new()
                } else {
                    vec![UnifiedStreamChunk::DeltaText { text: delta }]
                }
            }
            KnownStreamEvent::ReasoningSummaryTextDelta { delta, .. } => {
                vec![UnifiedStreamChunk::DeltaThinking {
                    text: delta,
                    signature: None,
                }]
            }
            KnownStreamEvent::FunctionCallArgumentsDelta {
                output_index,
                delta,
            } => {
                let tool_index = self.tool_by_output.get(&output_index).copied().unwrap_or(0);
                self.saw_args_delta.insert(tool_index, true);
                vec![UnifiedStreamChunk::ToolCallDelta {
                    index: tool_index,
                    id: None,
                    name: None,
                    args_delta: Some(delta),
                }]
            }
            KnownStreamEvent::FunctionCallArgumentsDone {
                output_index,
                arguments,
            } => {
                let tool_index = self.tool_by_output.get(&output_index).copied().unwrap_or(0);
                if self.saw_args_delta.get(&tool_index).copied().unwrap_or(false) {
                    Vec::new()
                } else {
                    vec![UnifiedStreamChunk::ToolCallDelta {
                        index: tool_index,
                        id: None,
                        name: None,
                        args_delta: Some(arguments),
                    }]
                }
            }
            KnownStreamEvent::Completed { response }
            | KnownStreamEvent::Incomplete { response } => {
                self.done = true;
                let mut out = Vec::new();
                if let Some(usage) = response.usage.as_ref() {
                    out.push(UnifiedStreamChunk::Usage(usage_from_wire(usage)));
                }
                out.push(UnifiedStreamChunk::Done {
                    finish_reason: finish_from_status(&response, self.next_tool_index > 0),
                });
                out
            }
            KnownStreamEvent::Failed { response } => {
                self.done = true;
                let mut out = Vec::new();
                if let Some(usage) = response.usage.as_ref() {
                    out.push(UnifiedStreamChunk::Usage(usage_from_wire(usage)));
                }
                out.push(UnifiedStreamChunk::Done {
                    finish_reason: FinishReason::Error,
                });
                out
            }
            KnownStreamEvent::Created { .. }
            | KnownStreamEvent::InProgress { .. }
            | KnownStreamEvent::ContentPartAdded { .. }
            | KnownStreamEvent::OutputTextDone { .. }
            | KnownStreamEvent::ContentPartDone { .. }
            | KnownStreamEvent::OutputItemDone { .. } => Vec::new(),
        })
    }
}

#[derive(Debug)]
struct StreamingToolItem {
    output_index: u32,
    call_id: String,
    name: String,
    arguments: String,
    opened: bool,
}

/// Unified chunks → client responses SSE: the full event lifecycle from
/// `response.created` to `response.completed`.
#[derive(Debug)]
pub struct ResponsesStreamEncoder {
    ids: StreamIds,
    started: bool,
    message_index: Option<u32>,
    text: String,
    reasoning_index: Option<u32>,
    reasoning_text: String,
    tools: BTreeMap<u32, StreamingToolItem>,
    next_output_index: u32,
    usage: Option<UnifiedUsage>,
    finish: Option<FinishReason>,
}

impl ResponsesStreamEncoder {
    pub fn new(ids: StreamIds) -> Self {
        Self {
            ids,
            started: false,
            message_index: None,
            text: String::new(),
            reasoning_index: None,
            reasoning_text: String::new(),
            tools: BTreeMap::new(),
            next_output_index: 0,
            usage: None,
            finish: None,
        }
    }

    fn event_frame(name: &str, mut body: serde_json::Value) -> SseFrame {
        if let Some(object) = body.as_object_mut() {
            object.insert("type".to_string(), serde_json::Value::String(name.into()));
        }
        SseFrame::named(name, body.to_string())
    }

    fn skeleton(&self, status: ResponseStatus) -> Response {
        Response {
            id: self.ids.response_id.clone(),
            object: "response".to_string(),
            created_at: self.ids.created,
            model: self.ids.model.clone(),
            status,
            output: Vec::new(),
            usage: None,
            incomplete_details: None,
            error: None,
        }
    }

    fn ensure_started(&mut self, frames: &mut Vec<SseFrame>) {
        if self.started {
            return;
        }
        self.started = true;
        let skeleton = self.skeleton(ResponseStatus::InProgress);
        frames.push(Self::event_frame(
            "response.created",
            serde_json::json!({ "response": &skeleton }),
        ));
        frames.push(Self::event_frame(
            "response.in_progress",
            serde_json::json!({ "response": &skeleton }),
        ));
    }

    fn ensure_message_item(&mut self, frames: &mut Vec<SseFrame>) -> u32 {
        if let Some(index) = self.message_index {
            return index;
        }
        let index = self.next_output_index;
        self.next_output_index += 1;
        self.message_index = Some(index);
        frames.push(Self::event_frame(
            "response.output_item.added",
            serde_json::json!({
                "output_index": index,
                "item": { "type": "message", "role": "assistant",
                          "status": "in_progress", "content": [] }
            }),
        ));
        frames.push(Self::event_frame(
            "response.content_part.added",
            serde_json::json!({
                "output_index": index,
                "content_index": 0,
                "part": { "type": "output_text", "text": "", "annotations": [] }
            }),
        ));
        index
    }

    pub fn encode(&mut self, chunk: &UnifiedStreamChunk) -> Vec<SseFrame> {
        let mut frames = Vec::new();
        self.ensure_started(&mut frames);
        match chunk {
            UnifiedStreamChunk::DeltaText { text } => {
                let index = self.ensure_message_item(&mut frames);
                self.text.push_str(text);
                frames.push(Self::event_frame(
                    "response.output_text.delta",
                    serde_json::json!({
                        "output_index": index,
                        "content_index": 0,
                        "delta": text,
                    }),
                ));
            }
            UnifiedStreamChunk::DeltaThinking { text, .. } => {
                if text.is_empty() {
                    return frames;
                }
                let index = match self.reasoning_index {
                    Some(index) => index,
                    None => {
                        let index = self.next_output_index;
                        self.next_output_index += 1;
                        self.reasoning_index = Some(index);
                        frames.push(Self::event_frame(
                            "response.output_item.added",
                            serde_json::json!({
                                "output_index": index,
                                "item": { "type": "reasoning", "summary": [] }
                            }),
                        ));
                        index
                    }
                };
                self.reasoning_text.push_str(text);
                frames.push(Self::event_frame(
                    "response.reasoning_summary_text.delta",
                    serde_json::json!({ "output_index": index, "delta": text }),
                ));
            }
            UnifiedStreamChunk::ToolCallDelta {
                index,
                id,
                name,
                args_delta,
            } => {
                let next_output_index = &mut self.next_output_index;
                let item = self.tools.entry(*index).or_insert_with(|| {
                    let output_index = *next_output_index;
                    *next_output_index += 1;
                    StreamingToolItem {
                        output_index,
                        call_id: id.clone().unwrap_or_else(|| format!("call_{index}")),
                        name: name.clone().unwrap_or_default(),
                        arguments: String::new(),
                        opened: false,
                    }
                });
                if let Some(name) = name {
                    item.name = name.clone();
                }
                if let Some(id) = id {
                    item.call_id = id.clone();
                }
                if !item.opened && !item.name.is_empty() {
                    item.opened = true;
                    frames.push(Self::event_frame(
                        "response.output_item.added",
                        serde_json::json!({
                            "output_index": item.output_index,
                            "item": { "type": "function_call", "call_id": item.call_id,
                                      "name": item.name, "arguments": "",
                                      "status": "in_progress" }
                        }),
                    ));
                }
                if let Some(args) = args_delta
                    && !args.is_empty()
                {
                    item.arguments.push_str(args);
                    frames.push(Self::event_frame(
                        "response.function_call_arguments.delta",
                        serde_json::json!({
                            "output_index": item.output_index,
                            "delta": args,
                        }),
                    ));
                }
            }
            // Responses image output rides dedicated tooling, not chat
            // deltas; nothing to frame here.
            UnifiedStreamChunk::ImagePart { .. } => {}
            UnifiedStreamChunk::Usage(usage) => {
                self.usage = Some(*usage);
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

        if let Some(index) = self.message_index {
            frames.push(Self::event_frame(
                "response.output_text.done",
                serde_json::json!({
                    "output_index": index,
                    "content_index": 0,
                    "text": self.text,
                }),
            ));
            frames.push(Self::event_frame(
                "response.content_part.done",
                serde_json::json!({
                    "output_index": index,
                    "content_index": 0,
                    "part": { "type": "output_text", "text": self.text, "annotations": [] }
                }),
            ));
            frames.push(Self::event_frame(
                "response.output_item.done",
                serde_json::json!({
                    "output_index": index,
                    "item": { "type": "message", "role": "assistant", "status": "completed",
                              "content": [{ "type": "output_text", "text": self.text,
                                            "annotations": [] }] }
                }),
            ));
        }
        for item in self.tools.values() {
            frames.push(Self::event_frame(
                "response.function_call_arguments.done",
                serde_json::json!({
                    "output_index": item.output_index,
                    "arguments": item.arguments,
                }),
            ));
            frames.push(Self::event_frame(
                "response.output_item.done",
                serde_json::json!({
                    "output_index": item.output_index,
                    "item": { "type": "function_call", "call_id": item.call_id,
                              "name": item.name, "arguments": item.arguments,
                              "status": "completed" }
                }),
            ));
        }

        let unified = UnifiedResponse {
            id: self.ids.response_id.clone(),
            model: self.ids.model.clone(),
            created: Some(self.ids.created),
            content: (!self.text.is_empty())
                .then(|| {
                    vec![ContentPart::Text {
                        text: self.text.clone(),
                    }]
                })
                .unwrap_or_default(),
            thinking: (!self.reasoning_text.is_empty()).then(|| ThinkingBlock {
                content: self.reasoning_text.clone(),
                signature: None,
            }),
            tool_calls: self
                .tools
                .values()
                .map(|item| ToolCall {
                    id: item.call_id.clone(),
                    name: item.name.clone(),
                    arguments: item.arguments.clone(),
                })
                .collect(),
            images: Vec::new(),
            finish_reason: self.finish.unwrap_or(FinishReason::Stop),
            usage: self.usage.unwrap_or_default(),
        };
        let full = build_wire_response(&unified);
        let terminal_event = match full.status {
            ResponseStatus::Failed => "response.failed",
            ResponseStatus::Incomplete => "response.incomplete",
            _ => "response.completed",
        };
        frames.push(Self::event_frame(
            terminal_event,
            serde_json::json!({ "response": full }),
        ));
        frames
    }

    pub fn encode_error(&mut self, message: &str) -> Vec<SseFrame> {
        let mut frames = Vec::new();
        self.ensure_started(&mut frames);
        let mut failed = self.skeleton(ResponseStatus::Failed);
        failed.error = Some(serde_json::json!({
            "code": "upstream_error", "message": message
        }));
        frames.push(Self::event_frame(
            "response.failed",
            serde_json::json!({ "response": failed }),
        ));
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_input_round_trips() {
        let raw = serde_json::json!({
            "model": "gpt-5",
            "input": "hello",
            "instructions": "be direct",
            "max_output_tokens": 64
        })
        .to_string();
        let unified = parse_request(raw.as_bytes()).unwrap();
        assert_eq!(unified.messages[0].role, Role::System);
        assert_eq!(unified.messages[1].role, Role::User);
        let reparsed = parse_request(&emit_request(&unified).unwrap()).unwrap();
        assert_eq!(unified, reparsed);
    }

    #[test]
    fn item_input_round_trips_with_function_calls() {
        let raw = serde_json::json!({
            "model": "gpt-5",
            "input": [
                {"type": "message", "role": "user", "content": "run it"},
                {"type": "function_call", "call_id": "call_1", "name": "run",
                 "arguments": "{\"x\":1}"},
                {"type": "function_call_output", "call_id": "call_1", "output": "done"}
            ],
            "tools": [{"type": "function", "name": "run"}],
            "tool_choice": "required"
        })
        .to_string();
        let unified = parse_request(raw.as_bytes()).unwrap();
        assert_eq!(unified.messages[1].role, Role::Assistant);
        assert_eq!(unified.messages[1].tool_calls[0].id, "call_1");
        assert_eq!(unified.messages[2].role, Role::Tool);
        assert_eq!(unified.tool_choice, Some(ToolChoice::Required));
        let reparsed = parse_request(&emit_request(&unified).unwrap()).unwrap();
        assert_eq!(unified, reparsed);
    }

    #[test]
    fn cached_tokens_larger_than_input_are_not_subtracted() {
        let raw = serde_json::json!({
            "id": "resp_1", "object": "response", "created_at": 7, "model": "gpt-5",
            "status": "completed",
            "output": [{"type": "message", "role": "assistant",
                "content": [{"type": "output_text", "text": "ok", "annotations": []}]}],
            "usage": {"input_tokens": 5233, "output_tokens": 2643, "total_tokens": 62660,
                "input_tokens_details": {"cached_tokens": 54784}}
        })
        .to_string();
        let unified = parse_response(raw.as_bytes()).unwrap();
        assert_eq!(unified.usage.input_tokens, 5233);
        assert_eq!(unified.usage.cache_read_tokens, 54784);
        assert_eq!(unified.usage.output_tokens, 2643);
        assert_eq!(unified.usage.total_tokens, 62660);
        assert_eq!(unified.usage.reasoning_tokens, 0);

        let reparsed = parse_response(&emit_response(&unified).unwrap()).unwrap();
        assert_eq!(unified, reparsed);
    }

    #[test]
    fn decoder_handles_argument_fragments_and_completion() {
        let mut decoder = ResponsesStreamDecoder::new();
        let chunks = decoder
            .push(&SseFrame::named(
                "response.output_item.added",
                serde_json::json!({"type": "response.output_item.added", "output_index": 0,
                    "item": {"type": "function_call", "call_id": "call_9",
                             "name": "run", "arguments": ""}})
                .to_string(),
            ))
            .unwrap();
        assert_eq!(
            chunks[0],
            UnifiedStreamChunk::ToolCallDelta {
                index: 0,
                id: Some("call_9".into()),
                name: Some("run".into()),
                args_delta: None,
            }
        );
        let chunks = decoder
            .push(&SseFrame::named(
                "response.function_call_arguments.delta",
                serde_json::json!({"type": "response.function_call_arguments.delta",
                    "output_index": 0, "delta": "{\"x\""})
                .to_string(),
            ))
            .unwrap();
        assert_eq!(
            chunks[0],
            UnifiedStreamChunk::ToolCallDelta {
                index: 0,
                id: None,
                name: None,
                args_delta: Some("{\"x\"".into()),
            }
        );
        // Arguments already streamed: done is a no-op.
        assert!(decoder
            .push(&SseFrame::named(
                "response.function_call_arguments.done",
                serde_json::json!({"type": "response.function_call_arguments.done",
                    "output_index": 0, "arguments": "{\"x\":1}"})
                .to_string(),
            ))
            .unwrap()
            .is_empty());

        let chunks = decoder
            .push(&SseFrame::named(
                "response.completed",
                serde_json::json!({"type": "response.completed", "response": {
                    "id": "resp_1", "object": "response", "created_at": 1, "model": "m",
                    "status": "completed", "output": [],
                    "usage": {"input_tokens": 3, "output_tokens": 4, "total_tokens": 7}}})
                .to_string(),
            ))
            .unwrap();
        assert!(matches!(chunks[0], UnifiedStreamChunk::Usage(_)));
        assert_eq!(
            chunks[1],
            UnifiedStreamChunk::Done {
                finish_reason: FinishReason::ToolCalls
            }
        );
    }

    #[test]
    fn encoder_runs_the_event_lifecycle() {
        let mut encoder = ResponsesStreamEncoder::new(StreamIds {
            response_id: "resp_9".into(),
            model: "gpt-5".into(),
            created: 4,
        });
        let first = encoder.encode(&UnifiedStreamChunk::DeltaText { text: "hi".into() });
        let names: Vec<_> = first.iter().filter_map(|f| f.event.clone()).collect();
        assert_eq!(
            names,
            vec![
                "response.created",
                "response.in_progress",
                "response.output_item.added",
                "response.content_part.added",
                "response.output_text.delta",
            ]
        );
        encoder.encode(&UnifiedStreamChunk::Done {
            finish_reason: FinishReason::Stop,
        });
        let tail = encoder.finish();
        let names: Vec<_> = tail.iter().filter_map(|f| f.event.clone()).collect();
        assert_eq!(
            names,
            vec![
                "response.output_text.done",
                "response.content_part.done",
                "response.output_item.done",
                "response.completed",
            ]
        );
        assert!(tail[3].data.contains("\"status\":\"completed\""));
    }
}
