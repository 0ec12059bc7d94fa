use serde::{Deserialize, Serialize};

use plexus_protocol::sse::SseFrame;

use crate::error::ParseError;
use crate::unified::{UnifiedRequest, UnifiedResponse, UnifiedStreamChunk};
use crate::{chat, gemini, messages, responses};

/// The four public wire dialects. Every request carries its client
/// dialect and its provider dialect explicitly; dispatch is a match, not
/// a vtable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// OpenAI Chat Completions.
    Chat,
    /// Anthropic Messages.
    Messages,
    /// Google Gemini generateContent.
    Gemini,
    /// OpenAI Responses.
    Responses,
}

impl Dialect {
    pub const ALL: [Dialect; 4] = [
        Dialect::Chat,
        Dialect::Messages,
        Dialect::Gemini,
        Dialect::Responses,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::Chat => "chat",
            Dialect::Messages => "messages",
            Dialect::Gemini => "gemini",
            Dialect::Responses => "responses",
        }
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw ingress payload. Gemini carries the model and the streaming switch
/// in the URL rather than the body; the HTTP layer extracts both.
#[derive(Debug, Clone, Copy)]
pub struct RawRequest<'a> {
    pub body: &'a [u8],
    pub path_model: Option<&'a str>,
    pub path_stream: bool,
}

impl<'a> RawRequest<'a> {
    pub fn body(body: &'a [u8]) -> Self {
        Self {
            body,
            path_model: None,
            path_stream: false,
        }
    }
}

/// Identity under which a client-side stream is re-emitted.
#[derive(Debug, Clone)]
pub struct StreamIds {
    pub response_id: String,
    pub model: String,
    pub created: i64,
}

impl Dialect {
    pub fn parse_request(&self, raw: RawRequest<'_>) -> Result<UnifiedRequest, ParseError> {
        match self {
            Dialect::Chat => chat::parse_request(raw.body),
            Dialect::Messages => messages::parse_request(raw.body),
            Dialect::Gemini => gemini::parse_request(raw),
            Dialect::Responses => responses::parse_request(raw.body),
        }
    }

    pub fn emit_request(&self, request: &UnifiedRequest) -> Result<Vec<u8>, ParseError> {
        match self {
            Dialect::Chat => chat::emit_request(request),
            Dialect::Messages => messages::emit_request(request),
            Dialect::Gemini => gemini::emit_request(request),
            Dialect::Responses => responses::emit_request(request),
        }
    }

    pub fn parse_response(&self, raw: &[u8]) -> Result<UnifiedResponse, ParseError> {
        match self {
            Dialect::Chat => chat::parse_response(raw),
            Dialect::Messages => messages::parse_response(raw),
            Dialect::Gemini => gemini::parse_response(raw),
            Dialect::Responses => responses::parse_response(raw),
        }
    }

    /// Normalized token counts from a unary response document.
    pub fn parse_usage(&self, raw: &[u8]) -> Result<crate::unified::UnifiedUsage, ParseError> {
        self.parse_response(raw).map(|response| response.usage)
    }

    pub fn emit_response(&self, response: &UnifiedResponse) -> Result<Vec<u8>, ParseError> {
        match self {
            Dialect::Chat => chat::emit_response(response),
            Dialect::Messages => messages::emit_response(response),
            Dialect::Gemini => gemini::emit_response(response),
            Dialect::Responses => responses::emit_response(response),
        }
    }

    /// Provider-side path for this request, relative to the dialect's
    /// base URL. Streaming switches the Gemini action and query.
    pub fn endpoint_path(&self, request: &UnifiedRequest) -> String {
        match self {
            Dialect::Chat => "/v1/chat/completions".to_string(),
            Dialect::Messages => "/v1/messages".to_string(),
            Dialect::Responses => "/v1/responses".to_string(),
            Dialect::Gemini => gemini::endpoint_path(&request.model, request.stream),
        }
    }

    pub fn decoder(&self) -> StreamDecoder {
        match self {
            Dialect::Chat => StreamDecoder::Chat(chat::ChatStreamDecoder::new()),
            Dialect::Messages => StreamDecoder::Messages(messages::MessagesStreamDecoder::new()),
            Dialect::Gemini => StreamDecoder::Gemini(gemini::GeminiStreamDecoder::new()),
            Dialect::Responses => {
                StreamDecoder::Responses(responses::ResponsesStreamDecoder::new())
            }
        }
    }

    pub fn encoder(&self, ids: StreamIds) -> StreamEncoder {
        match self {
            Dialect::Chat => StreamEncoder::Chat(chat::ChatStreamEncoder::new(ids)),
            Dialect::Messages => StreamEncoder::Messages(messages::MessagesStreamEncoder::new(ids)),
            Dialect::Gemini => StreamEncoder::Gemini(gemini::GeminiStreamEncoder::new(ids)),
            Dialect::Responses => {
                StreamEncoder::Responses(responses::ResponsesStreamEncoder::new(ids))
            }
        }
    }
}

/// Provider-side SSE frames → unified chunks. Stateful: dialects that
/// index content blocks need the index → tool-ordinal mapping across
/// frames.
#[derive(Debug)]
pub enum StreamDecoder {
    Chat(chat::ChatStreamDecoder),
    Messages(messages::MessagesStreamDecoder),
    Gemini(gemini::GeminiStreamDecoder),
    Responses(responses::ResponsesStreamDecoder),
}

impl StreamDecoder {
    pub fn push(&mut self, frame: &SseFrame) -> Result<Vec<UnifiedStreamChunk>, ParseError> {
        match self {
            StreamDecoder::Chat(decoder) => decoder.push(frame),
            StreamDecoder::Messages(decoder) => decoder.push(frame),
            StreamDecoder::Gemini(decoder) => decoder.push(frame),
            StreamDecoder::Responses(decoder) => decoder.push(frame),
        }
    }
}

/// Unified chunks → client-dialect SSE frames. Stateful: the encoder
/// owns the event framing contract of its dialect (block open/close,
/// lifecycle events, terminator sentinels).
#[derive(Debug)]
pub enum StreamEncoder {
    Chat(chat::ChatStreamEncoder),
    Messages(messages::MessagesStreamEncoder),
    Gemini(gemini::GeminiStreamEncoder),
    Responses(responses::ResponsesStreamEncoder),
}

impl StreamEncoder {
    pub fn encode(&mut self, chunk: &UnifiedStreamChunk) -> Vec<SseFrame> {
        match self {
            StreamEncoder::Chat(encoder) => encoder.encode(chunk),
            StreamEncoder::Messages(encoder) => encoder.encode(chunk),
            StreamEncoder::Gemini(encoder) => encoder.encode(chunk),
            StreamEncoder::Responses(encoder) => encoder.encode(chunk),
        }
    }

    /// Terminal frames for an orderly end of stream.
    pub fn finish(&mut self) -> Vec<SseFrame> {
        match self {
            StreamEncoder::Chat(encoder) => encoder.finish(),
            StreamEncoder::Messages(encoder) => encoder.finish(),
            StreamEncoder::Gemini(encoder) => encoder.finish(),
            StreamEncoder::Responses(encoder) => encoder.finish(),
        }
    }

    /// Mid-stream failure after headers already went out: one
    /// dialect-shaped error event, then orderly termination.
    pub fn encode_error(&mut self, message: &str) -> Vec<SseFrame> {
        match self {
            StreamEncoder::Chat(encoder) => encoder.encode_error(message),
            StreamEncoder::Messages(encoder) => encoder.encode_error(message),
            StreamEncoder::Gemini(encoder) => encoder.encode_error(message),
            StreamEncoder::Responses(encoder) => encoder.encode_error(message),
        }
    }
}
