pub mod chat;
pub mod dialect;
pub mod error;
pub mod gemini;
pub mod messages;
pub mod reconstruct;
pub mod responses;
pub mod unified;

pub use dialect::{Dialect, RawRequest, StreamDecoder, StreamEncoder};
pub use error::ParseError;
pub use reconstruct::reconstruct_from_stream;
pub use unified::{
    ContentPart, FinishReason, GeneratedImage, ImageSource, Role, ThinkingBlock, ToolCall,
    ToolChoice, ToolDefinition, UnifiedMessage, UnifiedRequest, UnifiedResponse,
    UnifiedStreamChunk, UnifiedUsage,
};
