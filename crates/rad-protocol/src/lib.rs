pub mod anthropic;
pub mod chunk;
pub mod gemini;
pub mod openai;
pub mod sse;

pub use chunk::{Chunk, ChunkChoice, ChunkDelta, ChunkUsage, FinishReason};
pub use sse::{SseEvent, SseParser};
