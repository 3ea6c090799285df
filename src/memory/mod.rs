//! 记忆层：对话轮次、相关性选择、摘要与持久化

pub mod conversation;
pub mod persistence;
pub mod relevance;
pub mod summarizer;

use thiserror::Error;

pub use conversation::{window_turns, ConversationMemory, MemoryBuilder, MemoryConfig, StoreFactory, Turn};
pub use persistence::{FileMessageStore, InMemoryMessageStore, MessageStore};
pub use relevance::{cosine_similarity, RelevanceConfig, RelevanceSelector};
pub use summarizer::{LlmSummarizer, SimpleSummarizer, Summarizer};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MemoryError {
    #[error("query must not be empty")]
    EmptyQuery,

    #[error("answer must not be empty")]
    EmptyAnswer,

    #[error("persistence error: {0}")]
    Persistence(String),
}
