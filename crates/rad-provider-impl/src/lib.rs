pub mod anthropic;
pub mod client;
pub mod gemini;
pub mod mock;
pub mod openai;
pub mod retry;
pub mod upstream;

pub use anthropic::AnthropicAdapter;
pub use gemini::GeminiAdapter;
pub use mock::MockAdapter;
pub use openai::OpenAIAdapter;
pub use retry::RetryPolicy;
