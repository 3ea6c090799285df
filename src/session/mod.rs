//! 会话层：按 key 管理对话记忆，可选外部持久化后端
//!
//! - **store**: SessionStore（按 key 加锁的记忆注册表）
//! - **backend**: SessionBackend 抽象、内存实现与 SQLite 实现（`async-sqlite` feature）

pub mod backend;
pub mod store;

pub use backend::{InMemoryBackend, SessionBackend};
#[cfg(feature = "async-sqlite")]
pub use backend::SqliteBackend;
pub use store::{SessionRecord, SessionStore, StoredTurn};
