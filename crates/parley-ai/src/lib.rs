pub mod anthropic;
pub mod cache;
pub mod directory;
pub mod mock;
pub mod openai;

pub use anthropic::AnthropicProvider;
pub use cache::ProviderCache;
pub use directory::{ModelConfig, ModelDirectory, StaticModelDirectory};
pub use mock::{MockProvider, MockReply};
pub use openai::OpenAiProvider;
