pub mod chat;
pub mod gemini;
pub mod messages;
pub mod responses;
pub mod sse;
