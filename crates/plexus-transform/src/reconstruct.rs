//! Rebuild a complete unified response from a raw SSE capture.
//!
//! Pure and deterministic: the same bytes always produce the same
//! response. Used for usage fallback when a stream never carried a usage
//! chunk, and for the debug trace path.

use std::collections::BTreeMap;

use plexus_protocol::sse::SseSplitter;

use crate::dialect::Dialect;
use crate::error::ParseError;
use crate::unified::{
    ContentPart, FinishReason, GeneratedImage, ThinkingBlock, ToolCall, UnifiedResponse,
    UnifiedStreamChunk, UnifiedUsage,
};

#[derive(Debug, Default)]
struct ToolAccumulator {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

/// Folds unified chunks into a response: text and thinking concatenate,
/// tool argument fragments join by index, the last usage and finish
/// reason win.
#[derive(Debug, Default)]
pub struct ChunkAccumulator {
    text: String,
    thinking: String,
    thinking_signature: Option<String>,
    tools: BTreeMap<u32, ToolAccumulator>,
    images: Vec<GeneratedImage>,
    usage: Option<UnifiedUsage>,
    finish: Option<FinishReason>,
}

impl ChunkAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &UnifiedStreamChunk) {
        match chunk {
            UnifiedStreamChunk::DeltaText { text } => self.text.push_str(text),
            UnifiedStreamChunk::DeltaThinking { text, signature } => {
                self.thinking.push_str(text);
                if let Some(signature) = signature {
                    self.thinking_signature = Some(signature.clone());
                }
            }
            UnifiedStreamChunk::ToolCallDelta {
                index,
                id,
                name,
                args_delta,
            } => {
                let tool = self.tools.entry(*index).or_default();
                if let Some(id) = id {
                    tool.id = Some(id.clone());
                }
                if let Some(name) = name {
                    tool.name = Some(name.clone());
                }
                if let Some(args) = args_delta {
                    tool.arguments.push_str(args);
                }
            }
            UnifiedStreamChunk::ImagePart { media_type, data } => {
                self.images.push(GeneratedImage {
                    media_type: media_type.clone(),
                    data: data.clone(),
                });
            }
            UnifiedStreamChunk::Usage(usage) => self.usage = Some(*usage),
            UnifiedStreamChunk::Done { finish_reason } => self.finish = Some(*finish_reason),
        }
    }

    pub fn usage(&self) -> Option<UnifiedUsage> {
        self.usage
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish
    }

    pub fn into_response(self, id: String, model: String) -> UnifiedResponse {
        UnifiedResponse {
            id,
            model,
            created: None,
            content: (!self.text.is_empty())
                .then(|| vec![ContentPart::Text { text: self.text }])
                .unwrap_or_default(),
            thinking: (!self.thinking.is_empty() || self.thinking_signature.is_some()).then(
                || ThinkingBlock {
                    content: self.thinking,
                    signature: self.thinking_signature,
                },
            ),
            tool_calls: self
                .tools
                .into_values()
                .map(|tool| ToolCall {
                    id: tool.id.unwrap_or_default(),
                    name: tool.name.unwrap_or_default(),
                    arguments: tool.arguments,
                })
                .collect(),
            images: self.images,
            finish_reason: self.finish.unwrap_or(FinishReason::Stop),
            usage: self.usage.unwrap_or_default(),
        }
    }
}

/// Replay a raw SSE body through the dialect's decoder. Frames that fail
/// to decode are skipped; reconstruction is best-effort over whatever
/// the upstream actually sent.
pub fn reconstruct_from_stream(
    dialect: Dialect,
    raw: &[u8],
) -> Result<UnifiedResponse, ParseError> {
    let text = std::str::from_utf8(raw)
        .map_err(|err| ParseError::new(dialect, "$", format!("invalid utf-8: {err}")))?;

    let mut splitter = SseSplitter::new();
    let mut decoder = dialect.decoder();
    let mut accumulator = ChunkAccumulator::new();

    let mut frames = splitter.push_str(text);
    frames.extend(splitter.finish());
    for frame in &frames {
        if let Ok(chunks) = decoder.push(frame) {
            for chunk in &chunks {
                accumulator.push(chunk);
            }
        }
    }
    Ok(accumulator.into_response(String::new(), String::new()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_stream_reconstructs_text_and_usage() {
        let raw = concat!(
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"Hel\"}}]}\n\n",
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"lo\"}}]}\n\n",
            "data: {\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}],",
            "\"usage\":{\"prompt_tokens\":4,\"completion_tokens\":2,\"total_tokens\":6}}\n\n",
            "data: [DONE]\n\n",
        );
        let response = reconstruct_from_stream(Dialect::Chat, raw.as_bytes()).unwrap();
        assert_eq!(response.joined_text(), "Hello");
        assert_eq!(response.finish_reason, FinishReason::Stop);
        assert_eq!(response.usage.input_tokens, 4);
        assert_eq!(response.usage.total_tokens, 6);
    }

    #[test]
    fn messages_stream_reconstructs_tool_arguments_across_fragments() {
        let raw = concat!(
            "event: message_start\n",
            "data: {\"type\":\"message_start\",\"message\":{\"id\":\"m1\",\"type\":\"message\",",
            "\"role\":\"assistant\",\"model\":\"c\",\"content\":[],",
            "\"usage\":{\"input_tokens\":11,\"output_tokens\":0}}}\n\n",
            "event: content_block_start\n",
            "data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":",
            "{\"type\":\"tool_use\",\"id\":\"t1\",\"name\":\"probe\",\"input\":{}}}\n\n",
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":",
            "{\"type\":\"input_json_delta\",\"partial_json\":\"{\\\"a\\\":\"}}\n\n",
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":",
            "{\"type\":\"input_json_delta\",\"partial_json\":\"1}\"}}\n\n",
            "event: content_block_stop\n",
            "data: {\"type\":\"content_block_stop\",\"index\":0}\n\n",
            "event: message_delta\n",
            "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"tool_use\"},",
            "\"usage\":{\"output_tokens\":9}}\n\n",
            "event: message_stop\n",
            "data: {\"type\":\"message_stop\"}\n\n",
        );
        let response = reconstruct_from_stream(Dialect::Messages, raw.as_bytes()).unwrap();
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].arguments, "{\"a\":1}");
        assert_eq!(response.finish_reason, FinishReason::ToolCalls);
        assert_eq!(response.usage.input_tokens, 11);
        assert_eq!(response.usage.output_tokens, 9);
    }

    #[test]
    fn reconstruction_is_deterministic() {
        let raw = concat!(
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"x\"}}]}\n\n",
            "data: [DONE]\n\n",
        );
        let first = reconstruct_from_stream(Dialect::Chat, raw.as_bytes()).unwrap();
        let second = reconstruct_from_stream(Dialect::Chat, raw.as_bytes()).unwrap();
        assert_eq!(first, second);
    }
}
