//! OpenAI Chat Completions ⇄ unified.

use plexus_protocol::chat::request::{
    AssistantMessage, ChatCompletionRequest, ChatMessage, ChatResponseFormat, ChatToolCall,
    ChatToolCallType, ChatToolChoice, ChatToolChoiceMode, ChatToolDefinition, FunctionCall,
    FunctionObject, ImageUrl, JsonSchemaFormat, NamedFunction, NamedToolChoice, StopSequences,
    StreamOptions, SystemMessage, TextContent, TextPart, ToolMessage, UserContent,
    UserContentPart, UserMessage,
};
use plexus_protocol::chat::response::{
    AssistantRole, ChatChoice, ChatCompletion, ChatFinishReason, ChatUsage, ChoiceMessage,
    CompletionTokensDetails, PromptTokensDetails,
};
use plexus_protocol::chat::stream::{
    ChatCompletionChunk, ChunkChoice, ChunkDelta, FunctionChunk, ToolCallChunk,
};
use plexus_protocol::sse::SseFrame;

use crate::dialect::{Dialect, StreamIds};
use crate::error::ParseError;
use crate::unified::{
    ContentPart, FinishReason, ImageSource, ResponseFormat, Role, ThinkingBlock, ToolCall,
    ToolChoice, ToolDefinition, UnifiedMessage, UnifiedRequest, UnifiedResponse,
    UnifiedStreamChunk, UnifiedUsage,
};

const DIALECT: Dialect = Dialect::Chat;

pub fn parse_request(raw: &[u8]) -> Result<UnifiedRequest, ParseError> {
    let request: ChatCompletionRequest =
        serde_json::from_slice(raw).map_err(|err| ParseError::invalid_json(DIALECT, err))?;

    let mut messages = Vec::with_capacity(request.messages.len());
    for message in &request.messages {
        messages.push(map_wire_message(message)?);
    }

    let tools = request
        .tools
        .unwrap_or_default()
        .into_iter()
        .map(|tool| ToolDefinition {
            name: tool.function.name,
            description: tool.function.description,
            parameters: tool.function.parameters,
        })
        .collect();

    let tool_choice = request.tool_choice.map(|choice| match choice {
        ChatToolChoice::Mode(ChatToolChoiceMode::Auto) => ToolChoice::Auto,
        ChatToolChoice::Mode(ChatToolChoiceMode::None) => ToolChoice::None,
        ChatToolChoice::Mode(ChatToolChoiceMode::Required) => ToolChoice::Required,
        ChatToolChoice::Named(named) => ToolChoice::Function {
            name: named.function.name,
        },
    });

    Ok(UnifiedRequest {
        model: request.model,
        messages,
        tools,
        tool_choice,
        max_tokens: request.max_completion_tokens.or(request.max_tokens),
        temperature: request.temperature,
        top_p: request.top_p,
        stop: match request.stop {
            Some(StopSequences::One(stop)) => vec![stop],
            Some(StopSequences::Many(stops)) => stops,
            None => Vec::new(),
        },
        stream: request.stream.unwrap_or(false),
        response_format: request.response_format.map(|format| match format {
            ChatResponseFormat::Text => ResponseFormat::Text,
            ChatResponseFormat::JsonObject => ResponseFormat::JsonObject,
            ChatResponseFormat::JsonSchema { json_schema } => ResponseFormat::JsonSchema {
                name: json_schema.name,
                schema: json_schema.schema,
            },
        }),
        reasoning: None,
        modalities: request.modalities.unwrap_or_default(),
        image_config: None,
    })
}

fn map_wire_message(message: &ChatMessage) -> Result<UnifiedMessage, ParseError> {
    Ok(match message {
        ChatMessage::System(system) | ChatMessage::Developer(system) => UnifiedMessage {
            role: Role::System,
            content: text_content_parts(&system.content),
            name: system.name.clone(),
            tool_call_id: None,
            tool_calls: Vec::new(),
            thinking: None,
        },
        ChatMessage::User(user) => UnifiedMessage {
            role: Role::User,
            content: user_content_parts(&user.content),
            name: user.name.clone(),
            tool_call_id: None,
            tool_calls: Vec::new(),
            thinking: None,
        },
        ChatMessage::Assistant(assistant) => UnifiedMessage {
            role: Role::Assistant,
            content: assistant
                .content
                .as_ref()
                .map(text_content_parts)
                .unwrap_or_default(),
            name: assistant.name.clone(),
            tool_call_id: None,
            tool_calls: assistant
                .tool_calls
                .clone()
                .unwrap_or_default()
                .into_iter()
                .map(|call| ToolCall {
                    id: call.id,
                    name: call.function.name,
                    arguments: call.function.arguments,
                })
                .collect(),
            thinking: assistant
                .reasoning_content
                .clone()
                .map(|content| ThinkingBlock {
                    content,
                    signature: None,
                }),
        },
        ChatMessage::Tool(tool) => UnifiedMessage {
            role: Role::Tool,
            content: text_content_parts(&tool.content),
            name: None,
            tool_call_id: Some(tool.tool_call_id.clone()),
            tool_calls: Vec::new(),
            thinking: None,
        },
    })
}

fn text_content_parts(content: &TextContent) -> Vec<ContentPart> {
    match content {
        TextContent::Text(text) => vec![ContentPart::Text { text: text.clone() }],
        TextContent::Parts(parts) => parts
            .iter()
            .map(|TextPart::Text { text }| ContentPart::Text { text: text.clone() })
            .collect(),
    }
}

fn user_content_parts(content: &UserContent) -> Vec<ContentPart> {
    match content {
        UserContent::Text(text) => vec![ContentPart::Text { text: text.clone() }],
        UserContent::Parts(parts) => parts
            .iter()
            .map(|part| match part {
                UserContentPart::Text { text } => ContentPart::Text { text: text.clone() },
                UserContentPart::ImageUrl { image_url } => image_part_from_url(&image_url.url),
            })
            .collect(),
    }
}

/// `data:<mime>;base64,<payload>` URLs become inline base64 parts; the
/// inverse happens in [`image_url_from_part`].
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

fn image_url_from_part(media_type: Option<&str>, source: &ImageSource) -> String {
    match source {
        ImageSource::Url(url) => url.clone(),
        ImageSource::Base64(data) => {
            format!("data:{};base64,{data}", media_type.unwrap_or(""))
        }
    }
}

pub fn emit_request(request: &UnifiedRequest) -> Result<Vec<u8>, ParseError> {
    let mut messages = Vec::with_capacity(request.messages.len());
    for message in &request.messages {
        messages.push(emit_wire_message(message));
    }

    let tools: Vec<ChatToolDefinition> = request
        .tools
        .iter()
        .map(|tool| ChatToolDefinition {
            r#type: ChatToolCallType::Function,
            function: FunctionObject {
                name: tool.name.clone(),
                description: tool.description.clone(),
                parameters: tool.parameters.clone(),
            },
        })
        .collect();

    let document = ChatCompletionRequest {
        model: request.model.clone(),
        messages,
        tools: (!tools.is_empty()).then_some(tools),
        tool_choice: request.tool_choice.as_ref().map(|choice| match choice {
            ToolChoice::Auto => ChatToolChoice::Mode(ChatToolChoiceMode::Auto),
            ToolChoice::None => ChatToolChoice::Mode(ChatToolChoiceMode::None),
            ToolChoice::Required => ChatToolChoice::Mode(ChatToolChoiceMode::Required),
            ToolChoice::Function { name } => ChatToolChoice::Named(NamedToolChoice {
                r#type: ChatToolCallType::Function,
                function: NamedFunction { name: name.clone() },
            }),
        }),
        max_tokens: request.max_tokens,
        max_completion_tokens: None,
        temperature: request.temperature,
        top_p: request.top_p,
        stop: match request.stop.len() {
            0 => None,
            1 => Some(StopSequences::One(request.stop[0].clone())),
            _ => Some(StopSequences::Many(request.stop.clone())),
        },
        stream: request.stream.then_some(true),
        stream_options: request.stream.then_some(StreamOptions {
            include_usage: Some(true),
        }),
        response_format: request.response_format.as_ref().map(|format| match format {
            ResponseFormat::Text => ChatResponseFormat::Text,
            ResponseFormat::JsonObject => ChatResponseFormat::JsonObject,
            ResponseFormat::JsonSchema { name, schema } => ChatResponseFormat::JsonSchema {
                json_schema: JsonSchemaFormat {
                    name: name.clone(),
                    schema: schema.clone(),
                    strict: None,
                },
            },
        }),
        modalities: (!request.modalities.is_empty()).then(|| request.modalities.clone()),
    };

    serde_json::to_vec(&document).map_err(|err| ParseError::new(DIALECT, "$", err.to_string()))
}

fn emit_wire_message(message: &UnifiedMessage) -> ChatMessage {
    match message.role {
        Role::System => ChatMessage::System(SystemMessage {
            content: emit_text_content(&message.content),
            name: message.name.clone(),
        }),
        Role::User => {
            let parts: Vec<UserContentPart> = message
                .content
                .iter()
                .map(|part| match part {
                    ContentPart::Text { text } => UserContentPart::Text { text: text.clone() },
                    ContentPart::Image { media_type, source } => UserContentPart::ImageUrl {
                        image_url: ImageUrl {
                            url: image_url_from_part(media_type.as_deref(), source),
                            detail: None,
                        },
                    },
                })
                .collect();
            let content = match parts.as_slice() {
                [UserContentPart::Text { text }] => UserContent::Text(text.clone()),
                _ => UserContent::Parts(parts),
            };
            ChatMessage::User(UserMessage {
                content,
                name: message.name.clone(),
            })
        }
        Role::Assistant => ChatMessage::Assistant(AssistantMessage {
            content: (!message.content.is_empty())
                .then(|| emit_text_content(&message.content)),
            tool_calls: (!message.tool_calls.is_empty()).then(|| {
                message
                    .tool_calls
                    .iter()
                    .map(|call| ChatToolCall {
                        id: call.id.clone(),
                        r#type: ChatToolCallType::Function,
                        function: FunctionCall {
                            name: call.name.clone(),
                            arguments: call.arguments.clone(),
                        },
                    })
                    .collect()
            }),
            reasoning_content: message.thinking.as_ref().map(|block| block.content.clone()),
            name: message.name.clone(),
        }),
        Role::Tool => ChatMessage::Tool(ToolMessage {
            content: emit_text_content(&message.content),
            tool_call_id: message.tool_call_id.clone().unwrap_or_default(),
        }),
    }
}

fn emit_text_content(parts: &[ContentPart]) -> TextContent {
    let texts: Vec<&str> = parts
        .iter()
        .filter_map(|part| match part {
            ContentPart::Text { text } => Some(text.as_str()),
            ContentPart::Image { .. } => None,
        })
        .collect();
    match texts.as_slice() {
        [only] => TextContent::Text((*only).to_string()),
        _ => TextContent::Parts(
            texts
                .into_iter()
                .map(|text| TextPart::Text {
                    text: text.to_string(),
                })
                .collect(),
        ),
    }
}

pub fn parse_response(raw: &[u8]) -> Result<UnifiedResponse, ParseError> {
    let completion: ChatCompletion =
        serde_json::from_slice(raw).map_err(|err| ParseError::invalid_json(DIALECT, err))?;

    let choice = completion
        .choices
        .first()
        .ok_or_else(|| ParseError::new(DIALECT, "choices", "empty choices array"))?;

    let content = choice
        .message
        .content
        .as_ref()
        .map(|text| vec![ContentPart::Text { text: text.clone() }])
        .unwrap_or_default();

    let tool_calls = choice
        .message
        .tool_calls
        .clone()
        .unwrap_or_default()
        .into_iter()
        .map(|call| ToolCall {
            id: call.id,
            name: call.function.name,
            arguments: call.function.arguments,
        })
        .collect();

    Ok(UnifiedResponse {
        id: completion.id,
        model: completion.model,
        created: Some(completion.created),
        content,
        thinking: choice
            .message
            .reasoning_content
            .clone()
            .map(|content| ThinkingBlock {
                content,
                signature: None,
            }),
        tool_calls,
        images: Vec::new(),
        finish_reason: choice
            .finish_reason
            .map(finish_from_wire)
            .unwrap_or(FinishReason::Stop),
        usage: completion.usage.map(usage_from_wire).unwrap_or_default(),
    })
}

pub fn emit_response(response: &UnifiedResponse) -> Result<Vec<u8>, ParseError> {
    let text = response.joined_text();
    let completion = ChatCompletion {
        id: response.id.clone(),
        object: "chat.completion".to_string(),
        created: response.created.unwrap_or(0),
        model: response.model.clone(),
        choices: vec![ChatChoice {
            index: 0,
            message: ChoiceMessage {
                role: AssistantRole::Assistant,
                content: (!text.is_empty() || response.tool_calls.is_empty()).then_some(text),
                reasoning_content: response.thinking.as_ref().map(|block| block.content.clone()),
                tool_calls: (!response.tool_calls.is_empty()).then(|| {
                    response
                        .tool_calls
                        .iter()
                        .map(|call| ChatToolCall {
                            id: call.id.clone(),
                            r#type: ChatToolCallType::Function,
                            function: FunctionCall {
                                name: call.name.clone(),
                                arguments: call.arguments.clone(),
                            },
                        })
                        .collect()
                }),
            },
            finish_reason: Some(finish_to_wire(response.finish_reason)),
        }],
        usage: Some(usage_to_wire(&response.usage)),
    };
    serde_json::to_vec(&completion).map_err(|err| ParseError::new(DIALECT, "$", err.to_string()))
}

fn finish_from_wire(reason: ChatFinishReason) -> FinishReason {
    match reason {
        ChatFinishReason::Stop => FinishReason::Stop,
        ChatFinishReason::Length => FinishReason::Length,
        ChatFinishReason::ToolCalls => FinishReason::ToolCalls,
        ChatFinishReason::ContentFilter => FinishReason::ContentFilter,
    }
}

fn finish_to_wire(reason: FinishReason) -> ChatFinishReason {
    match reason {
        FinishReason::Stop | FinishReason::Error => ChatFinishReason::Stop,
        FinishReason::Length => ChatFinishReason::Length,
        FinishReason::ToolCalls => ChatFinishReason::ToolCalls,
        FinishReason::ContentFilter => ChatFinishReason::ContentFilter,
    }
}

fn usage_from_wire(usage: ChatUsage) -> UnifiedUsage {
    UnifiedUsage {
        input_tokens: usage.prompt_tokens,
        output_tokens: usage.completion_tokens,
        total_tokens: usage.total_tokens,
        cache_read_tokens: usage
            .prompt_tokens_details
            .as_ref()
            .map(|details| details.cached_tokens)
            .unwrap_or(0),
        reasoning_tokens: usage
            .completion_tokens_details
            .as_ref()
            .map(|details| details.reasoning_tokens)
            .unwrap_or(0),
        cache_creation_tokens: 0,
    }
}

fn usage_to_wire(usage: &UnifiedUsage) -> ChatUsage {
    ChatUsage {
        prompt_tokens: usage.input_tokens,
        completion_tokens: usage.output_tokens,
        total_tokens: usage.total_tokens,
        prompt_tokens_details: (usage.cache_read_tokens > 0).then(|| PromptTokensDetails {
            cached_tokens: usage.cache_read_tokens,
        }),
        completion_tokens_details: (usage.reasoning_tokens > 0).then(|| {
            CompletionTokensDetails {
                reasoning_tokens: usage.reasoning_tokens,
            }
        }),
    }
}

/// Upstream chat SSE → unified chunks. The `[DONE]` sentinel yields
/// nothing; termination is signaled by `finish_reason`.
#[derive(Debug, Default)]
pub struct ChatStreamDecoder;

impl ChatStreamDecoder {
    pub fn new() -> Self {
        Self
    }

    pub fn push(&mut self, frame: &SseFrame) -> Result<Vec<UnifiedStreamChunk>, ParseError> {
        if frame.data.is_empty() || frame.data == "[DONE]" {
            return Ok(Vec::new());
        }
        let chunk: ChatCompletionChunk = serde_json::from_str(&frame.data)
            .map_err(|err| ParseError::invalid_json(DIALECT, err))?;

        let mut out = Vec::new();
        if let Some(choice) = chunk.choices.first() {
            if let Some(text) = &choice.delta.reasoning_content
                && !text.is_empty()
            {
                out.push(UnifiedStreamChunk::DeltaThinking {
                    text: text.clone(),
                    signature: None,
                });
            }
            if let Some(text) = &choice.delta.content
                && !text.is_empty()
            {
                out.push(UnifiedStreamChunk::DeltaText { text: text.clone() });
            }
            for call in choice.delta.tool_calls.iter().flatten() {
                out.push(UnifiedStreamChunk::ToolCallDelta {
                    index: call.index,
                    id: call.id.clone(),
                    name: call.function.as_ref().and_then(|f| f.name.clone()),
                    args_delta: call.function.as_ref().and_then(|f| f.arguments.clone()),
                });
            }
            if let Some(reason) = choice.finish_reason {
                if let Some(usage) = chunk.usage.clone() {
                    out.push(UnifiedStreamChunk::Usage(usage_from_wire(usage)));
                }
                out.push(UnifiedStreamChunk::Done {
                    finish_reason: finish_from_wire(reason),
                });
                return Ok(out);
            }
        }
        if let Some(usage) = chunk.usage {
            out.push(UnifiedStreamChunk::Usage(usage_from_wire(usage)));
        }
        Ok(out)
    }
}

/// Unified chunks → client chat SSE. Framing contract: `data: {json}` per
/// chunk, a usage-only chunk when usage is known, `data: [DONE]` last.
#[derive(Debug)]
pub struct ChatStreamEncoder {
    ids: StreamIds,
    sent_role: bool,
    usage: Option<UnifiedUsage>,
}

impl ChatStreamEncoder {
    pub fn new(ids: StreamIds) -> Self {
        Self {
            ids,
            sent_role: false,
            usage: None,
        }
    }

    fn frame(&self, choices: Vec<ChunkChoice>, usage: Option<ChatUsage>) -> SseFrame {
        let chunk = ChatCompletionChunk {
            id: self.ids.response_id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.ids.created,
            model: self.ids.model.clone(),
            choices,
            usage,
        };
        SseFrame::data(serde_json::to_string(&chunk).unwrap_or_default())
    }

    fn delta_frame(&mut self, delta: ChunkDelta, finish: Option<ChatFinishReason>) -> SseFrame {
        let mut delta = delta;
        if !self.sent_role {
            delta.role = Some("assistant".to_string());
            self.sent_role = true;
        }
        self.frame(
            vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason: finish,
            }],
            None,
        )
    }

    pub fn encode(&mut self, chunk: &UnifiedStreamChunk) -> Vec<SseFrame> {
        match chunk {
            UnifiedStreamChunk::DeltaText { text } => vec![self.delta_frame(
                ChunkDelta {
                    content: Some(text.clone()),
                    ..Default::default()
                },
                None,
            )],
            UnifiedStreamChunk::DeltaThinking { text, .. } => {
                if text.is_empty() {
                    return Vec::new();
                }
                vec![self.delta_frame(
                    ChunkDelta {
                        reasoning_content: Some(text.clone()),
                        ..Default::default()
                    },
                    None,
                )]
            }
            UnifiedStreamChunk::ToolCallDelta {
                index,
                id,
                name,
                args_delta,
            } => vec![self.delta_frame(
                ChunkDelta {
                    tool_calls: Some(vec![ToolCallChunk {
                        index: *index,
                        id: id.clone(),
                        r#type: id.is_some().then(|| "function".to_string()),
                        function: Some(FunctionChunk {
                            name: name.clone(),
                            arguments: args_delta.clone(),
                        }),
                    }]),
                    ..Default::default()
                },
                None,
            )],
            // No standard chat framing for inline image output.
            UnifiedStreamChunk::ImagePart { .. } => Vec::new(),
            UnifiedStreamChunk::Usage(usage) => {
                self.usage = Some(*usage);
                Vec::new()
            }
            UnifiedStreamChunk::Done { finish_reason } => {
                vec![self.delta_frame(ChunkDelta::default(), Some(finish_to_wire(*finish_reason)))]
            }
        }
    }

    pub fn finish(&mut self) -> Vec<SseFrame> {
        let mut frames = Vec::new();
        if let Some(usage) = self.usage.take() {
            frames.push(self.frame(Vec::new(), Some(usage_to_wire(&usage))));
        }
        frames.push(SseFrame::data("[DONE]"));
        frames
    }

    pub fn encode_error(&mut self, message: &str) -> Vec<SseFrame> {
        let payload = serde_json::json!({
            "error": { "message": message, "type": "upstream_error" }
        });
        vec![SseFrame::data(payload.to_string()), SseFrame::data("[DONE]")]
    }
}
