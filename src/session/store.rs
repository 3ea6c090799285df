//! 会话存储：key → 对话记忆 + 互斥锁
//!
//! 每个 key 的锁在首次访问时惰性创建且永不回收；不同 key 的调用互不阻塞。
//! 注册表为每个 key 只保留一个共享记忆句柄，同一 key 的并发运行写入同一份记忆。
//! 配置了后端时，首次访问从后端恢复（记录缺失 / 为空 / 损坏时新建会话），保存失败只记日志。

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::memory::{ConversationMemory, MemoryBuilder, Turn};
use crate::session::SessionBackend;

/// 后端中保存的会话记录
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub messages: Vec<StoredTurn>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredTurn {
    pub id: u64,
    pub query: String,
    pub answer: String,
    #[serde(default)]
    pub summary: String,
}

impl From<&Turn> for StoredTurn {
    fn from(t: &Turn) -> Self {
        Self {
            id: t.id,
            query: t.query.clone(),
            answer: t.answer.clone(),
            summary: t.summary.clone(),
        }
    }
}

impl SessionRecord {
    pub async fn from_memory(memory: &ConversationMemory) -> Self {
        Self {
            model: memory.model().await,
            messages: memory.turns().await.iter().map(StoredTurn::from).collect(),
        }
    }

    /// 还原为轮次；记录中没有创建时间，以加载时刻为准
    pub fn into_turns(self) -> (Vec<Turn>, Option<String>) {
        let now = Utc::now();
        let turns = self
            .messages
            .into_iter()
            .map(|m| Turn {
                id: m.id,
                query: m.query,
                answer: m.answer,
                summary: m.summary,
                created_at: now,
            })
            .collect();
        (turns, self.model)
    }
}

fn lock_map<T>(m: &StdMutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct SessionStore {
    builder: MemoryBuilder,
    backend: Option<Arc<dyn SessionBackend>>,
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
    memories: StdMutex<HashMap<String, ConversationMemory>>,
}

impl SessionStore {
    /// 纯内存会话存储
    pub fn new(builder: MemoryBuilder) -> Self {
        Self {
            builder,
            backend: None,
            locks: StdMutex::new(HashMap::new()),
            memories: StdMutex::new(HashMap::new()),
        }
    }

    pub fn with_backend(builder: MemoryBuilder, backend: Arc<dyn SessionBackend>) -> Self {
        Self {
            backend: Some(backend),
            ..Self::new(builder)
        }
    }

    pub fn builder(&self) -> &MemoryBuilder {
        &self.builder
    }

    /// 该 key 的互斥锁（惰性创建，永不回收）
    pub fn get_lock(&self, key: &str) -> Arc<Mutex<()>> {
        lock_map(&self.locks)
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// 取得或创建会话记忆（持有该 key 的锁）
    pub async fn get_or_create(&self, key: &str) -> ConversationMemory {
        let lock = self.get_lock(key);
        let _guard = lock.lock().await;

        if let Some(memory) = lock_map(&self.memories).get(key).cloned() {
            return memory;
        }

        let memory = match self.restore(key).await {
            Some(record) => {
                let (turns, model) = record.into_turns();
                tracing::info!(session = %key, turns = turns.len(), "session restored");
                self.builder.restore_session(key, turns, model)
            }
            None => {
                let memory = self.builder.build_session(key);
                match memory.initialize().await {
                    Ok(0) => tracing::debug!(session = %key, "new session"),
                    Ok(n) => tracing::info!(session = %key, turns = n, "session loaded from message store"),
                    Err(e) => tracing::warn!(session = %key, error = %e, "message store load failed, starting new"),
                }
                memory
            }
        };
        lock_map(&self.memories).insert(key.to_string(), memory.clone());
        memory
    }

    async fn restore(&self, key: &str) -> Option<SessionRecord> {
        let backend = self.backend.as_ref()?;
        let raw = match backend.get(key).await {
            Ok(Some(raw)) if !raw.trim().is_empty() => raw,
            Ok(_) => return None,
            Err(e) => {
                tracing::warn!(session = %key, error = %format!("{e:#}"), "session load failed, starting new");
                return None;
            }
        };
        match serde_json::from_str::<SessionRecord>(&raw) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(session = %key, error = %e, "session record corrupt, starting new");
                None
            }
        }
    }

    /// 保存会话（持有该 key 的锁）；后端写入失败只记日志
    pub async fn save(&self, key: &str, memory: &ConversationMemory) {
        let lock = self.get_lock(key);
        let _guard = lock.lock().await;

        lock_map(&self.memories).insert(key.to_string(), memory.clone());

        let Some(backend) = &self.backend else {
            return;
        };
        let record = SessionRecord::from_memory(memory).await;
        let value = match serde_json::to_string(&record) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(session = %key, error = %e, "session serialize failed");
                return;
            }
        };
        match backend.set(key, value).await {
            Ok(()) => tracing::debug!(session = %key, turns = record.messages.len(), "session saved"),
            Err(e) => {
                tracing::warn!(session = %key, error = %format!("{e:#}"), "session save failed, keeping in-memory copy")
            }
        }
    }

    /// 删除会话（注册表、该会话的 MessageStore 与后端）；锁保留
    pub async fn delete(&self, key: &str) {
        let lock = self.get_lock(key);
        let _guard = lock.lock().await;

        lock_map(&self.memories).remove(key);
        if let Some(store) = self.builder.message_store(key) {
            if let Err(e) = store.clear().await {
                tracing::warn!(session = %key, error = %e, "message store clear failed");
            }
        }
        if let Some(backend) = &self.backend {
            if let Err(e) = backend.delete(key).await {
                tracing::warn!(session = %key, error = %format!("{e:#}"), "session delete failed");
            }
        }
    }

    pub async fn exists(&self, key: &str) -> bool {
        if lock_map(&self.memories).contains_key(key) {
            return true;
        }
        match &self.backend {
            Some(backend) => matches!(backend.get(key).await, Ok(Some(raw)) if !raw.trim().is_empty()),
            None => false,
        }
    }

    /// 已加载的会话数
    pub fn len(&self) -> usize {
        lock_map(&self.memories).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::memory::{FileMessageStore, MemoryConfig, MessageStore};
    use crate::session::InMemoryBackend;

    fn store() -> SessionStore {
        SessionStore::new(MemoryBuilder::new(MemoryConfig::default()))
    }

    #[tokio::test]
    async fn test_same_key_shares_memory() {
        let store = store();
        let a = store.get_or_create("s1").await;
        let b = store.get_or_create("s1").await;
        assert!(a.same_as(&b));

        a.add_turn("q", "a", None).await.unwrap();
        assert_eq!(b.len().await, 1);

        let other = store.get_or_create("s2").await;
        assert!(!other.same_as(&a));
        assert!(other.is_empty().await);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_block() {
        let store = store();
        let lock = store.get_lock("busy");
        let _held = lock.lock().await;

        let other = tokio::time::timeout(Duration::from_secs(1), store.get_or_create("free")).await;
        assert!(other.is_ok());

        let blocked = tokio::time::timeout(Duration::from_millis(50), store.get_or_create("busy")).await;
        assert!(blocked.is_err());
    }

    #[tokio::test]
    async fn test_backend_round_trip_restores_turns() {
        let backend = Arc::new(InMemoryBackend::new());
        let builder = MemoryBuilder::new(MemoryConfig::default());

        let first = SessionStore::with_backend(builder.clone(), backend.clone());
        let memory = first.get_or_create("user-1").await;
        memory.set_model("deepseek-chat").await;
        memory.add_turn("q0", "a0", None).await.unwrap();
        memory.add_turn("q1", "a1", Some("custom".into())).await.unwrap();
        first.save("user-1", &memory).await;

        let second = SessionStore::with_backend(builder, backend);
        assert!(second.exists("user-1").await);
        let restored = second.get_or_create("user-1").await;
        let turns = restored.turns().await;
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[1].summary, "custom");
        assert_eq!(restored.model().await.as_deref(), Some("deepseek-chat"));

        let next = restored.add_turn("q2", "a2", None).await.unwrap();
        assert_eq!(next.id, 2);
    }

    #[tokio::test]
    async fn test_corrupt_or_empty_record_starts_new_session() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.set("bad", "{not json".into()).await.unwrap();
        backend.set("blank", "  ".into()).await.unwrap();
        let store = SessionStore::with_backend(MemoryBuilder::new(MemoryConfig::default()), backend);

        assert!(store.get_or_create("bad").await.is_empty().await);
        assert!(store.get_or_create("blank").await.is_empty().await);
    }

    #[tokio::test]
    async fn test_file_stores_keep_sessions_apart_across_restarts() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().to_path_buf();
        let builder = MemoryBuilder::new(MemoryConfig::default()).store_factory(move |key: &str| {
            Arc::new(FileMessageStore::for_session(&path, key)) as Arc<dyn MessageStore>
        });

        let first = SessionStore::new(builder.clone());
        let alice = first.get_or_create("alice").await;
        alice.add_turn("alice q1", "a1", None).await.unwrap();
        alice.add_turn("alice q2", "a2", None).await.unwrap();
        first.get_or_create("bob").await.add_turn("bob q", "b", None).await.unwrap();

        let second = SessionStore::new(builder);
        let alice = second.get_or_create("alice").await;
        let queries: Vec<String> = alice.turns().await.into_iter().map(|t| t.query).collect();
        assert_eq!(queries, vec!["alice q1", "alice q2"]);
        assert_eq!(alice.add_turn("alice q3", "a3", None).await.unwrap().id, 2);
        assert_eq!(second.get_or_create("bob").await.len().await, 1);

        second.delete("bob").await;
        assert!(second.get_or_create("bob").await.is_empty().await);
        assert_eq!(second.get_or_create("alice").await.len().await, 3);
    }

    struct BrokenBackend;

    #[async_trait]
    impl SessionBackend for BrokenBackend {
        async fn get(&self, _key: &str) -> anyhow::Result<Option<String>> {
            anyhow::bail!("backend offline")
        }
        async fn set(&self, _key: &str, _value: String) -> anyhow::Result<()> {
            anyhow::bail!("backend offline")
        }
        async fn delete(&self, _key: &str) -> anyhow::Result<()> {
            anyhow::bail!("backend offline")
        }
    }

    #[tokio::test]
    async fn test_backend_failures_keep_in_memory_copy() {
        let store = SessionStore::with_backend(
            MemoryBuilder::new(MemoryConfig::default()),
            Arc::new(BrokenBackend),
        );
        let memory = store.get_or_create("k").await;
        memory.add_turn("q", "a", None).await.unwrap();
        store.save("k", &memory).await;

        assert_eq!(store.get_or_create("k").await.len().await, 1);
    }

    #[tokio::test]
    async fn test_delete_forgets_session() {
        let backend = Arc::new(InMemoryBackend::new());
        let store = SessionStore::with_backend(MemoryBuilder::new(MemoryConfig::default()), backend.clone());
        let memory = store.get_or_create("k").await;
        memory.add_turn("q", "a", None).await.unwrap();
        store.save("k", &memory).await;

        store.delete("k").await;
        assert!(!store.exists("k").await);
        assert_eq!(backend.get("k").await.unwrap(), None);
        assert!(store.get_or_create("k").await.is_empty().await);
    }
}
