//! LLM 层：客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）、重试包装、结构化输出与嵌入

pub mod deepseek;
pub mod embedding;
pub mod mock;
pub mod openai;
pub mod retrying;
pub mod structured;
pub mod traits;

pub use deepseek::{create_deepseek_client, DEEPSEEK_CHAT, DEEPSEEK_REASONER};
pub use embedding::{
    create_embedder_from_config, CachedEmbedder, EmbeddingError, EmbeddingProvider,
    OpenAiEmbedder,
};
pub use mock::MockLlmClient;
pub use openai::{OpenAiClient, TokenUsage};
pub use retrying::RetryingLlmClient;
pub use structured::{complete_structured, complete_structured_or, parse_as, parse_structured};
pub use traits::{CompletionRequest, FragmentStream, LlmClient, LlmError};
