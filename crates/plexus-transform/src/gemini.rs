//! Google Gemini generateContent ⇄ unified.
//!
//! The model travels in the URL (with `models/` / `tunedModels/`
//! prefixes preserved), `system` folds into `systemInstruction`, and
//! streaming is plain `data:` frames each carrying a response document.

use std::collections::BTreeMap;

use serde_json::Value as JsonValue;

use plexus_protocol::gemini::request::{
    Blob, Content, ContentRole, FunctionCall, FunctionCallingConfig, FunctionCallingMode,
    FunctionDeclaration, FunctionResponse, GenerateContentRequest, GenerationConfig, ImageConfig,
    Part, ThinkingConfig, Tool, ToolConfig, block_none_safety_settings,
};
use plexus_protocol::gemini::response::{
    Candidate, GeminiFinishReason, GenerateContentResponse, UsageMetadata,
};
use plexus_protocol::sse::SseFrame;

use crate::dialect::{Dialect, RawRequest, StreamIds};
use crate::error::ParseError;
use crate::unified::{
    ContentPart, FinishReason, GeneratedImage, ImageOutputConfig, ImageSource, ReasoningConfig,
    ResponseFormat, Role, ThinkingBlock, ToolCall, ToolChoice, ToolDefinition, UnifiedMessage,
    UnifiedRequest, UnifiedResponse, UnifiedStreamChunk, UnifiedUsage,
};

const DIALECT: Dialect = Dialect::Gemini;

/// Schema name used when a JSON schema arrives via `responseJsonSchema`,
/// which carries no name of its own.
const SCHEMA_NAME: &str = "response";

pub fn endpoint_path(model: &str, stream: bool) -> String {
    let prefixed = if model.contains('/') {
        model.to_string()
    } else {
        format!("models/{model}")
    };
    if stream {
        format!("/v1beta/{prefixed}:streamGenerateContent?alt=sse")
    } else {
        format!("/v1beta/{prefixed}:generateContent")
    }
}

pub fn parse_request(raw: RawRequest<'_>) -> Result<UnifiedRequest, ParseError> {
    let model = raw
        .path_model
        .ok_or_else(|| ParseError::new(DIALECT, "model", "missing model in request path"))?;
    let request: GenerateContentRequest =
        serde_json::from_slice(raw.body).map_err(|err| ParseError::invalid_json(DIALECT, err))?;

    let mut messages = Vec::new();
    if let Some(system) = &request.system_instruction {
        let mut parts = Vec::new();
        for part in &system.parts {
            if let Some(text) = &part.text {
                parts.push(ContentPart::Text { text: text.clone() });
            }
        }
        messages.push(UnifiedMessage {
            role: Role::System,
            content: parts,
            name: None,
            tool_call_id: None,
            tool_calls: Vec::new(),
            thinking: None,
        });
    }
    for content in &request.contents {
        map_wire_content(content, &mut messages);
    }

    let tools: Vec<ToolDefinition> = request
        .tools
        .unwrap_or_default()
        .into_iter()
        .flat_map(|tool| tool.function_declarations.unwrap_or_default())
        .map(|declaration| ToolDefinition {
            name: declaration.name,
            description: declaration.description,
            parameters: declaration.parameters,
        })
        .collect();

    let tool_choice = request
        .tool_config
        .as_ref()
        .and_then(|config| config.function_calling_config.as_ref())
        .and_then(|config| {
            let mode = config.mode?;
            Some(match mode {
                FunctionCallingMode::None => ToolChoice::None,
                FunctionCallingMode::Auto => ToolChoice::Auto,
                FunctionCallingMode::Any => match config.allowed_function_names.as_deref() {
                    Some([name]) => ToolChoice::Function { name: name.clone() },
                    _ => ToolChoice::Required,
                },
            })
        });

    let generation = request.generation_config.unwrap_or_default();
    let response_format = if generation.response_json_schema.is_some() {
        Some(ResponseFormat::JsonSchema {
            name: SCHEMA_NAME.to_string(),
            schema: generation.response_json_schema,
        })
    } else if generation.response_mime_type.as_deref() == Some("application/json") {
        Some(ResponseFormat::JsonObject)
    } else {
        None
    };
    let reasoning = generation.thinking_config.map(|thinking| ReasoningConfig {
        enabled: thinking
            .include_thoughts
            .unwrap_or(thinking.thinking_budget.is_some()),
        max_tokens: thinking.thinking_budget,
    });

    Ok(UnifiedRequest {
        model: model.to_string(),
        messages,
        tools,
        tool_choice,
        max_tokens: generation.max_output_tokens,
        temperature: generation.temperature,
        top_p: generation.top_p,
        stop: generation.stop_sequences.unwrap_or_default(),
        stream: raw.path_stream,
        response_format,
        reasoning,
        modalities: generation.response_modalities.unwrap_or_default(),
        image_config: generation.image_config.map(|config| ImageOutputConfig {
            aspect_ratio: config.aspect_ratio,
        }),
    })
}

fn map_wire_content(content: &Content, out: &mut Vec<UnifiedMessage>) {
    match content.role {
        Some(ContentRole::Model) => {
            let mut unified = UnifiedMessage {
                role: Role::Assistant,
                content: Vec::new(),
                name: None,
                tool_call_id: None,
                tool_calls: Vec::new(),
                thinking: None,
            };
            for part in &content.parts {
                if let Some(call) = &part.function_call {
                    unified.tool_calls.push(ToolCall {
                        id: call.name.clone(),
                        name: call.name.clone(),
                        arguments: call
                            .args
                            .as_ref()
                            .map(|args| args.to_string())
                            .unwrap_or_else(|| "{}".to_string()),
                    });
                } else if let Some(text) = &part.text {
                    if part.thought.unwrap_or(false) {
                        unified.thinking = Some(ThinkingBlock {
                            content: text.clone(),
                            signature: part.thought_signature.clone(),
                        });
                    } else {
                        unified.content.push(ContentPart::Text { text: text.clone() });
                    }
                }
            }
            out.push(unified);
        }
        // Absent role is read as user, matching vendor behavior.
        Some(ContentRole::User) | None => {
            let mut pending: Vec<ContentPart> = Vec::new();
            for part in &content.parts {
                if let Some(response) = &part.function_response {
                    if !pending.is_empty() {
                        out.push(user_message(std::mem::take(&mut pending)));
                    }
                    out.push(UnifiedMessage {
                        role: Role::Tool,
                        content: vec![ContentPart::Text {
                            text: response.response.to_string(),
                        }],
                        name: Some(response.name.clone()),
                        tool_call_id: Some(response.name.clone()),
                        tool_calls: Vec::new(),
                        thinking: None,
                    });
                } else if let Some(text) = &part.text {
                    pending.push(ContentPart::Text { text: text.clone() });
                } else if let Some(blob) = &part.inline_data {
                    pending.push(ContentPart::Image {
                        media_type: Some(blob.mime_type.clone()),
                        source: ImageSource::Base64(blob.data.clone()),
                    });
                } else if let Some(file) = &part.file_data {
                    pending.push(ContentPart::Image {
                        media_type: file.mime_type.clone(),
                        source: ImageSource::Url(file.file_uri.clone()),
                    });
                }
            }
            if !pending.is_empty() {
                out.push(user_message(pending));
            }
        }
    }
}

fn user_message(content: Vec<ContentPart>) -> UnifiedMessage {
    UnifiedMessage {
        role: Role::User,
        content,
        name: None,
        tool_call_id: None,
        tool_calls: Vec::new(),
        thinking: None,
    }
}

pub fn emit_request(request: &UnifiedRequest) -> Result<Vec<u8>, ParseError> {
    let mut system_parts: Vec<Part> = Vec::new();
    let mut contents: Vec<Content> = Vec::new();
    let mut pending_responses: Vec<Part> = Vec::new();

    for message in &request.messages {
        if message.role != Role::Tool && !pending_responses.is_empty() {
            contents.push(Content {
                role: Some(ContentRole::User),
                parts: std::mem::take(&mut pending_responses),
            });
        }
        match message.role {
            Role::System => {
                for part in &message.content {
                    if let ContentPart::Text { text } = part {
                        system_parts.push(Part {
                            text: Some(text.clone()),
                            ..Default::default()
                        });
                    }
                }
            }
            Role::User => {
                contents.push(Content {
                    role: Some(ContentRole::User),
                    parts: message.content.iter().map(emit_user_part).collect(),
                });
            }
            Role::Assistant => {
                let mut parts = Vec::new();
                if let Some(thinking) = &message.thinking {
                    parts.push(Part {
                        text: Some(thinking.content.clone()),
                        thought: Some(true),
                        thought_signature: thinking.signature.clone(),
                        ..Default::default()
                    });
                }
                for part in &message.content {
                    if let ContentPart::Text { text } = part {
                        parts.push(Part {
                            text: Some(text.clone()),
                            ..Default::default()
                        });
                    }
                }
                for call in &message.tool_calls {
                    parts.push(Part {
                        function_call: Some(FunctionCall {
                            name: call.name.clone(),
                            args: Some(parse_args(&call.arguments)),
                        }),
                        ..Default::default()
                    });
                }
                contents.push(Content {
                    role: Some(ContentRole::Model),
                    parts,
                });
            }
            Role::Tool => {
                pending_responses.push(Part {
                    function_response: Some(FunctionResponse {
                        name: message
                            .name
                            .clone()
                            .or_else(|| message.tool_call_id.clone())
                            .unwrap_or_default(),
                        response: parse_args(&message.joined_text()),
                    }),
                    ..Default::default()
                });
            }
        }
    }
    if !pending_responses.is_empty() {
        contents.push(Content {
            role: Some(ContentRole::User),
            parts: pending_responses,
        });
    }

    let declarations: Vec<FunctionDeclaration> = request
        .tools
        .iter()
        .map(|tool| FunctionDeclaration {
            name: tool.name.clone(),
            description: tool.description.clone(),
            parameters: tool.parameters.clone(),
        })
        .collect();

    let tool_config = request.tool_choice.as_ref().map(|choice| ToolConfig {
        function_calling_config: Some(match choice {
            ToolChoice::Auto => FunctionCallingConfig {
                mode: Some(FunctionCallingMode::Auto),
                allowed_function_names: None,
            },
            ToolChoice::None => FunctionCallingConfig {
                mode: Some(FunctionCallingMode::None),
                allowed_function_names: None,
            },
            ToolChoice::Required => FunctionCallingConfig {
                mode: Some(FunctionCallingMode::Any),
                allowed_function_names: None,
            },
            ToolChoice::Function { name } => FunctionCallingConfig {
                mode: Some(FunctionCallingMode::Any),
                allowed_function_names: Some(vec![name.clone()]),
            },
        }),
    });

    let generation_config = build_generation_config(request);

    let document = GenerateContentRequest {
        contents,
        system_instruction: (!system_parts.is_empty()).then(|| Content {
            role: None,
            parts: system_parts,
        }),
        tools: (!declarations.is_empty()).then(|| {
            vec![Tool {
                function_declarations: Some(declarations),
            }]
        }),
        tool_config,
        generation_config,
        safety_settings: Some(block_none_safety_settings()),
    };

    serde_json::to_vec(&document).map_err(|err| ParseError::new(DIALECT, "$", err.to_string()))
}

fn build_generation_config(request: &UnifiedRequest) -> Option<GenerationConfig> {
    let mut config = GenerationConfig {
        max_output_tokens: request.max_tokens,
        temperature: request.temperature,
        top_p: request.top_p,
        stop_sequences: (!request.stop.is_empty()).then(|| request.stop.clone()),
        ..Default::default()
    };
    match &request.response_format {
        Some(ResponseFormat::JsonObject) => {
            config.response_mime_type = Some("application/json".to_string());
        }
        Some(ResponseFormat::JsonSchema { schema, .. }) => {
            config.response_mime_type = Some("application/json".to_string());
            config.response_json_schema = schema.clone();
        }
        Some(ResponseFormat::Text) | None => {}
    }
    if let Some(reasoning) = &request.reasoning {
        config.thinking_config = Some(ThinkingConfig {
            include_thoughts: Some(reasoning.enabled),
            thinking_budget: reasoning.max_tokens,
        });
    }
    if !request.modalities.is_empty() {
        config.response_modalities = Some(request.modalities.clone());
    }
    if let Some(image) = &request.image_config {
        config.image_config = Some(ImageConfig {
            aspect_ratio: image.aspect_ratio.clone(),
        });
    }
    (config != GenerationConfig::default()).then_some(config)
}

fn emit_user_part(part: &ContentPart) -> Part {
    match part {
        ContentPart::Text { text } => Part {
            text: Some(text.clone()),
            ..Default::default()
        },
        ContentPart::Image { media_type, source } => match source {
            ImageSource::Base64(data) => Part {
                inline_data: Some(Blob {
                    mime_type: media_type.clone().unwrap_or_else(|| "image/png".to_string()),
                    data: data.clone(),
                }),
                ..Default::default()
            },
            ImageSource::Url(url) => Part {
                file_data: Some(plexus_protocol::gemini::request::FileData {
                    mime_type: media_type.clone(),
                    file_uri: url.clone(),
                }),
                ..Default::default()
            },
        },
    }
}

fn parse_args(raw: &str) -> JsonValue {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::json!({ "result": raw }))
}

pub fn parse_response(raw: &[u8]) -> Result<UnifiedResponse, ParseError> {
    let response: GenerateContentResponse =
        serde_json::from_slice(raw).map_err(|err| ParseError::invalid_json(DIALECT, err))?;
    Ok(unify_response(&response))
}

fn unify_response(response: &GenerateContentResponse) -> UnifiedResponse {
    let mut content = Vec::new();
    let mut tool_calls = Vec::new();
    let mut thinking: Option<ThinkingBlock> = None;
    let mut images = Vec::new();
    let mut finish = None;

    if let Some(candidate) = response.candidates.first() {
        if let Some(candidate_content) = &candidate.content {
            for part in &candidate_content.parts {
                if let Some(call) = &part.function_call {
                    tool_calls.push(ToolCall {
                        id: call.name.clone(),
                        name: call.name.clone(),
                        arguments: call
                            .args
                            .as_ref()
                            .map(|args| args.to_string())
                            .unwrap_or_else(|| "{}".to_string()),
                    });
                } else if let Some(text) = &part.text {
                    if part.thought.unwrap_or(false) {
                        match &mut thinking {
                            Some(block) => block.content.push_str(text),
                            None => {
                                thinking = Some(ThinkingBlock {
                                    content: text.clone(),
                                    signature: part.thought_signature.clone(),
                                });
                            }
                        }
                    } else {
                        content.push(ContentPart::Text { text: text.clone() });
                    }
                } else if let Some(blob) = &part.inline_data {
                    images.push(GeneratedImage {
                        media_type: blob.mime_type.clone(),
                        data: blob.data.clone(),
                    });
                }
            }
        }
        finish = candidate.finish_reason;
    }

    let finish_reason = match finish {
        Some(GeminiFinishReason::Stop) | None => {
            if tool_calls.is_empty() {
                FinishReason::Stop
            } else {
                FinishReason::ToolCalls
            }
        }
        Some(GeminiFinishReason::MaxTokens) => FinishReason::Length,
        Some(
            GeminiFinishReason::Safety
            | GeminiFinishReason::Recitation
            | GeminiFinishReason::Blocklist
            | GeminiFinishReason::ProhibitedContent
            | GeminiFinishReason::Spii,
        ) => FinishReason::ContentFilter,
        Some(GeminiFinishReason::MalformedFunctionCall | GeminiFinishReason::Other) => {
            FinishReason::Error
        }
    };

    UnifiedResponse {
        id: response.response_id.clone().unwrap_or_default(),
        model: response.model_version.clone().unwrap_or_default(),
        created: None,
        content,
        thinking,
        tool_calls,
        images,
        finish_reason,
        usage: response
            .usage_metadata
            .as_ref()
            .map(usage_from_wire)
            .unwrap_or_default(),
    }
}

pub fn emit_response(response: &UnifiedResponse) -> Result<Vec<u8>, ParseError> {
    let document = GenerateContentResponse {
        candidates: vec![Candidate {
            content: Some(Content {
                role: Some(ContentRole::Model),
                parts: emit_response_parts(response),
            }),
            finish_reason: Some(finish_to_wire(response.finish_reason)),
            index: Some(0),
        }],
        usage_metadata: Some(usage_to_wire(&response.usage)),
        model_version: (!response.model.is_empty()).then(|| response.model.clone()),
        response_id: (!response.id.is_empty()).then(|| response.id.clone()),
    };
    serde_json::to_vec(&document).map_err(|err| ParseError::new(DIALECT, "$", err.to_string()))
}

fn emit_response_parts(response: &UnifiedResponse) -> Vec<Part> {
    let mut parts = Vec::new();
    if let Some(thinking) = &response.thinking {
        parts.push(Part {
            text: Some(thinking.content.clone()),
            thought: Some(true),
            thought_signature: thinking.signature.clone(),
            ..Default::default()
        });
    }
    for part in &response.content {
        if let ContentPart::Text { text } = part {
            parts.push(Part {
                text: Some(text.clone()),
                ..Default::default()
            });
        }
    }
    for call in &response.tool_calls {
        parts.push(Part {
            function_call: Some(FunctionCall {
                name: call.name.clone(),
                args: Some(parse_args(&call.arguments)),
            }),
            ..Default::default()
        });
    }
    for image in &response.images {
        parts.push(Part {
            inline_data: Some(Blob {
                mime_type: image.media_type.clone(),
                data: image.data.clone(),
            }),
            ..Default::default()
        });
    }
    parts
}

fn finish_to_wire(reason: FinishReason) -> GeminiFinishReason {
    match reason {
        FinishReason::Stop | FinishReason::ToolCalls => GeminiFinishReason::Stop,
        FinishReason::Length => GeminiFinishReason::MaxTokens,
        FinishReason::ContentFilter => GeminiFinishReason::Safety,
        FinishReason::Error => GeminiFinishReason::Other,
    }
}

fn usage_from_wire(usage: &UsageMetadata) -> UnifiedUsage {
    UnifiedUsage {
        input_tokens: usage.prompt_token_count.unwrap_or(0),
        output_tokens: usage.candidates_token_count.unwrap_or(0),
        reasoning_tokens: usage.thoughts_token_count.unwrap_or(0),
        cache_read_tokens: usage.cached_content_token_count.unwrap_or(0),
        cache_creation_tokens: 0,
        total_tokens: usage.total_token_count.unwrap_or(0),
    }
}

fn usage_to_wire(usage: &UnifiedUsage) -> UsageMetadata {
    UsageMetadata {
        prompt_token_count: Some(usage.input_tokens),
        candidates_token_count: Some(usage.output_tokens),
        total_token_count: Some(usage.total_tokens),
        cached_content_token_count: (usage.cache_read_tokens > 0)
            .then_some(usage.cache_read_tokens),
        thoughts_token_count: (usage.reasoning_tokens > 0).then_some(usage.reasoning_tokens),
    }
}

/// Upstream gemini SSE → unified chunks. Each frame is a full response
/// document carrying incremental candidate parts.
#[derive(Debug, Default)]
pub struct GeminiStreamDecoder {
    next_tool_index: u32,
    done: bool,
}

impl GeminiStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, frame: &SseFrame) -> Result<Vec<UnifiedStreamChunk>, ParseError> {
        if frame.data.is_empty() || frame.data == "[DONE]" {
            return Ok(Vec::new());
        }
        let response: GenerateContentResponse = serde_json::from_str(&frame.data)
            .map_err(|err| ParseError::invalid_json(DIALECT, err))?;

        let mut out = Vec::new();
        let mut finish = None;
        if let Some(candidate) = response.candidates.first() {
            if let Some(content) = &candidate.content {
                for part in &content.parts {
                    if let Some(call) = &part.function_call {
                        let index = self.next_tool_index;
                        self.next_tool_index += 1;
                        out.push(UnifiedStreamChunk::ToolCallDelta {
                            index,
                            id: Some(call.name.clone()),
                            name: Some(call.name.clone()),
                            args_delta: Some(
                                call.args
                                    .as_ref()
                                    .map(|args| args.to_string())
                                    .unwrap_or_else(|| "{}".to_string()),
                            ),
                        });
                    } else if let Some(text) = &part.text {
                        if text.is_empty() {
                            continue;
                        }
                        if part.thought.unwrap_or(false) {
                            out.push(UnifiedStreamChunk::DeltaThinking {
                                text: text.clone(),
                                signature: part.thought_signature.clone(),
                            });
                        } else {
                            out.push(UnifiedStreamChunk::DeltaText { text: text.clone() });
                        }
                    } else if let Some(blob) = &part.inline_data {
                        out.push(UnifiedStreamChunk::ImagePart {
                            media_type: blob.mime_type.clone(),
                            data: blob.data.clone(),
                        });
                    }
                }
            }
            finish = candidate.finish_reason;
        }
        if let Some(usage) = response.usage_metadata.as_ref() {
            out.push(UnifiedStreamChunk::Usage(usage_from_wire(usage)));
        }
        if let Some(reason) = finish
            && !self.done
        {
            self.done = true;
            let had_tools = self.next_tool_index > 0;
            out.push(UnifiedStreamChunk::Done {
                finish_reason: match reason {
                    GeminiFinishReason::Stop if had_tools => FinishReason::ToolCalls,
                    GeminiFinishReason::Stop => FinishReason::Stop,
                    GeminiFinishReason::MaxTokens => FinishReason::Length,
                    GeminiFinishReason::Safety
                    | GeminiFinishReason::Recitation
                    | GeminiFinishReason::Blocklist
                    | GeminiFinishReason::ProhibitedContent
                    | GeminiFinishReason::Spii => FinishReason::ContentFilter,
                    GeminiFinishReason::MalformedFunctionCall | GeminiFinishReason::Other => {
                        FinishReason::Error
                    }
                },
            });
        }
        Ok(out)
    }
}

/// Unified chunks → client gemini SSE. Text/thinking/image parts stream
/// as they come; function calls are whole-call on this wire, so buffered
/// argument fragments flush with the terminal frame.
#[derive(Debug)]
pub struct GeminiStreamEncoder {
    ids: StreamIds,
    tool_calls: BTreeMap<u32, (String, String)>,
    usage: Option<UnifiedUsage>,
    finish: Option<FinishReason>,
}

impl GeminiStreamEncoder {
    pub fn new(ids: StreamIds) -> Self {
        Self {
            ids,
            tool_calls: BTreeMap::new(),
            usage: None,
            finish: None,
        }
    }

    fn frame_with(&self, parts: Vec<Part>) -> SseFrame {
        let response = GenerateContentResponse {
            candidates: vec![Candidate {
                content: Some(Content {
                    role: Some(ContentRole::Model),
                    parts,
                }),
                finish_reason: None,
                index: Some(0),
            }],
            usage_metadata: None,
            model_version: Some(self.ids.model.clone()),
            response_id: Some(self.ids.response_id.clone()),
        };
        SseFrame::data(serde_json::to_string(&response).unwrap_or_default())
    }

    pub fn encode(&mut self, chunk: &UnifiedStreamChunk) -> Vec<SseFrame> {
        match chunk {
            UnifiedStreamChunk::DeltaText { text } => vec![self.frame_with(vec![Part {
                text: Some(text.clone()),
                ..Default::default()
            }])],
            UnifiedStreamChunk::DeltaThinking { text, signature } => {
                if text.is_empty() && signature.is_none() {
                    return Vec::new();
                }
                vec![self.frame_with(vec![Part {
                    text: Some(text.clone()),
                    thought: Some(true),
                    thought_signature: signature.clone(),
                    ..Default::default()
                }])]
            }
            UnifiedStreamChunk::ToolCallDelta {
                index,
                name,
                args_delta,
                ..
            } => {
                let entry = self
                    .tool_calls
                    .entry(*index)
                    .or_insert_with(|| (String::new(), String::new()));
                if let Some(name) = name {
                    entry.0 = name.clone();
                }
                if let Some(args) = args_delta {
                    entry.1.push_str(args);
                }
                Vec::new()
            }
            UnifiedStreamChunk::ImagePart { media_type, data } => {
                vec![self.frame_with(vec![Part {
                    inline_data: Some(Blob {
                        mime_type: media_type.clone(),
                        data: data.clone(),
                    }),
                    ..Default::default()
                }])]
            }
            UnifiedStreamChunk::Usage(usage) => {
                self.usage = Some(*usage);
                Vec::new()
            }
            UnifiedStreamChunk::Done { finish_reason } => {
                self.finish = Some(*finish_reason);
                Vec::new()
            }
        }
    }

    pub fn finish(&mut self) -> Vec<SseFrame> {
        let parts: Vec<Part> = std::mem::take(&mut self.tool_calls)
            .into_values()
            .map(|(name, args)| Part {
                function_call: Some(FunctionCall {
                    name,
                    args: Some(parse_args(&args)),
                }),
                ..Default::default()
            })
            .collect();
        let response = GenerateContentResponse {
            candidates: vec![Candidate {
                content: (!parts.is_empty()).then(|| Content {
                    role: Some(ContentRole::Model),
                    parts,
                }),
                finish_reason: Some(finish_to_wire(self.finish.unwrap_or(FinishReason::Stop))),
                index: Some(0),
            }],
            usage_metadata: self.usage.map(|usage| usage_to_wire(&usage)),
            model_version: Some(self.ids.model.clone()),
            response_id: Some(self.ids.response_id.clone()),
        };
        vec![SseFrame::data(
            serde_json::to_string(&response).unwrap_or_default(),
        )]
    }

    pub fn encode_error(&mut self, message: &str) -> Vec<SseFrame> {
        let payload = serde_json::json!({
            "error": { "code": 502, "message": message, "status": "UNAVAILABLE" }
        });
        vec![SseFrame::data(payload.to_string())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_preserves_model_prefixes() {
        assert_eq!(
            endpoint_path("gemini-2.0-flash", false),
            "/v1beta/models/gemini-2.0-flash:generateContent"
        );
        assert_eq!(
            endpoint_path("tunedModels/mine", true),
            "/v1beta/tunedModels/mine:streamGenerateContent?alt=sse"
        );
    }

    #[test]
    fn request_round_trips_with_system_fold_and_tools() {
        let raw = serde_json::json!({
            "systemInstruction": {"parts": [{"text": "be kind"}]},
            "contents": [
                {"role": "user", "parts": [{"text": "hello"}]},
                {"role": "model", "parts": [
                    {"text": "think", "thought": true, "thoughtSignature": "s1"},
                    {"functionCall": {"name": "probe", "args": {"d": 2}}}
                ]},
                {"role": "user", "parts": [
                    {"functionResponse": {"name": "probe", "response": {"ok": true}}}
                ]}
            ],
            "tools": [{"functionDeclarations": [{"name": "probe",
                "parameters": {"type": "object"}}]}],
            "toolConfig": {"functionCallingConfig":
                {"mode": "ANY", "allowedFunctionNames": ["probe"]}},
            "generationConfig": {"maxOutputTokens": 99, "temperature": 0.5,
                "thinkingConfig": {"includeThoughts": true, "thinkingBudget": 64}}
        })
        .to_string();
        let unified = parse_request(RawRequest {
            body: raw.as_bytes(),
            path_model: Some("gemini-2.0-flash"),
            path_stream: true,
        })
        .unwrap();
        assert_eq!(unified.model, "gemini-2.0-flash");
        assert!(unified.stream);
        assert_eq!(unified.messages[0].role, Role::System);
        assert_eq!(unified.messages[2].thinking.as_ref().unwrap().content, "think");
        assert_eq!(unified.messages[3].role, Role::Tool);
        assert_eq!(
            unified.tool_choice,
            Some(ToolChoice::Function {
                name: "probe".into()
            })
        );

        let emitted = emit_request(&unified).unwrap();
        let reparsed = parse_request(RawRequest {
            body: &emitted,
            path_model: Some("gemini-2.0-flash"),
            path_stream: true,
        })
        .unwrap();
        assert_eq!(unified, reparsed);
    }

    #[test]
    fn emitted_requests_carry_block_none_safety() {
        let unified = parse_request(RawRequest {
            body: br#"{"contents":[{"role":"user","parts":[{"text":"x"}]}]}"#,
            path_model: Some("gemini-2.0-flash"),
            path_stream: false,
        })
        .unwrap();
        let emitted: serde_json::Value =
            serde_json::from_slice(&emit_request(&unified).unwrap()).unwrap();
        let settings = emitted["safetySettings"].as_array().unwrap();
        assert_eq!(settings.len(), 5);
        assert!(settings.iter().all(|s| s["threshold"] == "BLOCK_NONE"));
    }

    #[test]
    fn max_tokens_finish_maps_to_length() {
        let raw = serde_json::json!({
            "candidates": [{"content": {"role": "model", "parts": [{"text": "trunc"}]},
                "finishReason": "MAX_TOKENS", "index": 0}],
            "usageMetadata": {"promptTokenCount": 5, "candidatesTokenCount": 9,
                "totalTokenCount": 14}
        })
        .to_string();
        let unified = parse_response(raw.as_bytes()).unwrap();
        assert_eq!(unified.finish_reason, FinishReason::Length);
        let reparsed = parse_response(&emit_response(&unified).unwrap()).unwrap();
        assert_eq!(unified, reparsed);
    }

    #[test]
    fn decoder_streams_text_then_finish() {
        let mut decoder = GeminiStreamDecoder::new();
        let chunks = decoder
            .push(&SseFrame::data(
                serde_json::json!({"candidates": [{"content":
                    {"role": "model", "parts": [{"text": "par"}]}, "index": 0}]})
                .to_string(),
            ))
            .unwrap();
        assert_eq!(chunks, vec![UnifiedStreamChunk::DeltaText { text: "par".into() }]);

        let chunks = decoder
            .push(&SseFrame::data(
                serde_json::json!({"candidates": [{"content":
                    {"role": "model", "parts": [{"text": "t"}]},
                    "finishReason": "STOP", "index": 0}],
                    "usageMetadata": {"promptTokenCount": 1, "candidatesTokenCount": 2,
                        "totalTokenCount": 3}})
                .to_string(),
            ))
            .unwrap();
        assert_eq!(chunks.len(), 3);
        assert!(matches!(chunks[1], UnifiedStreamChunk::Usage(_)));
        assert!(matches!(
            chunks[2],
            UnifiedStreamChunk::Done {
                finish_reason: FinishReason::Stop
            }
        ));
    }

    #[test]
    fn encoder_buffers_tool_calls_until_finish() {
        let mut encoder = GeminiStreamEncoder::new(StreamIds {
            response_id: "r1".into(),
            model: "gemini-2.0-flash".into(),
            created: 0,
        });
        assert!(encoder
            .encode(&UnifiedStreamChunk::ToolCallDelta {
                index: 0,
                id: Some("probe".into()),
                name: Some("probe".into()),
                args_delta: Some("{\"d\":".into()),
            })
            .is_empty());
        assert!(encoder
            .encode(&UnifiedStreamChunk::ToolCallDelta {
                index: 0,
                id: None,
                name: None,
                args_delta: Some("2}".into()),
            })
            .is_empty());
        encoder.encode(&UnifiedStreamChunk::Done {
            finish_reason: FinishReason::ToolCalls,
        });
        let frames = encoder.finish();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].data.contains("\"functionCall\""));
        assert!(frames[0].data.contains("\"d\":2"));
    }
}
