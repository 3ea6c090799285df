//! 对话记忆：有序轮次、单调 id、相关性选择与有界剪枝
//!
//! ConversationMemory 是廉价克隆的句柄（内部 Arc），同一会话的多个运行共享同一份轮次。
//! 剪枝规则：长度达到 prune_threshold 时触发，此后每次追加都保持最近 prune_to 轮；clear 后重新计数。
//! id 在实例生命周期内严格递增（剪枝与 clear 都不回退）。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::llm::EmbeddingProvider;
use crate::memory::persistence::{InMemoryMessageStore, MessageStore};
use crate::memory::relevance::{RelevanceConfig, RelevanceSelector};
use crate::memory::summarizer::{SimpleSummarizer, Summarizer};
use crate::memory::MemoryError;

/// 一轮问答（创建后不可变）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub id: u64,
    pub query: String,
    pub answer: String,
    pub summary: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MemoryConfig {
    pub prune_threshold: usize,
    pub prune_to: usize,
    /// format_for_planning 中每条回答保留的最大字符数
    pub per_message_token_limit: usize,
    pub relevance: RelevanceConfig,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            prune_threshold: 120,
            prune_to: 80,
            per_message_token_limit: 400,
            relevance: RelevanceConfig::default(),
        }
    }
}

impl MemoryConfig {
    /// 保证 1 <= prune_to <= prune_threshold
    fn normalized(mut self) -> Self {
        self.prune_threshold = self.prune_threshold.max(1);
        self.prune_to = self.prune_to.clamp(1, self.prune_threshold);
        self
    }
}

/// 按会话 key 创建 MessageStore；同一个 key 应当总是指向同一个持久化位置
pub type StoreFactory = Arc<dyn Fn(&str) -> Arc<dyn MessageStore> + Send + Sync>;

/// 记忆构造器：会话存储用它为每个新会话创建同构的记忆
///
/// 摘要器与嵌入提供方在所有记忆间共享；MessageStore 按会话 key 各建一个，互不覆盖。
#[derive(Clone)]
pub struct MemoryBuilder {
    config: MemoryConfig,
    summarizer: Arc<dyn Summarizer>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    stores: Option<StoreFactory>,
}

impl MemoryBuilder {
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            config: config.normalized(),
            summarizer: Arc::new(SimpleSummarizer::default()),
            embedder: None,
            stores: None,
        }
    }

    pub fn summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = summarizer;
        self
    }

    pub fn embedder(mut self, embedder: Option<Arc<dyn EmbeddingProvider>>) -> Self {
        self.embedder = embedder;
        self
    }

    /// 会话记忆的持久化；未指定时每个实例各用一个进程内存储
    pub fn store_factory(
        mut self,
        factory: impl Fn(&str) -> Arc<dyn MessageStore> + Send + Sync + 'static,
    ) -> Self {
        self.stores = Some(Arc::new(factory));
        self
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// 该会话的 MessageStore；未配置工厂时为 None
    pub fn message_store(&self, key: &str) -> Option<Arc<dyn MessageStore>> {
        self.stores.as_ref().map(|factory| factory(key))
    }

    /// 临时记忆（不属于任何会话，只用进程内存储）
    pub fn build(&self) -> ConversationMemory {
        self.build_with(Vec::new(), None)
    }

    /// 用已有轮次构造临时记忆（上下文窗口视图等）；id 计数从最大 id + 1 继续
    pub fn build_with(&self, turns: Vec<Turn>, model: Option<String>) -> ConversationMemory {
        self.assemble(turns, model, Arc::new(InMemoryMessageStore::new()))
    }

    /// 会话 key 对应的新记忆，持久化到该会话自己的 MessageStore
    pub fn build_session(&self, key: &str) -> ConversationMemory {
        self.restore_session(key, Vec::new(), None)
    }

    /// 用已有轮次构造会话记忆（从会话后端恢复）
    pub fn restore_session(
        &self,
        key: &str,
        turns: Vec<Turn>,
        model: Option<String>,
    ) -> ConversationMemory {
        let store = self
            .message_store(key)
            .unwrap_or_else(|| Arc::new(InMemoryMessageStore::new()));
        self.assemble(turns, model, store)
    }

    fn assemble(
        &self,
        turns: Vec<Turn>,
        model: Option<String>,
        store: Arc<dyn MessageStore>,
    ) -> ConversationMemory {
        let next_id = turns.iter().map(|t| t.id + 1).max().unwrap_or(0);
        ConversationMemory {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    turns,
                    next_id,
                    pruning: false,
                    model,
                }),
                selector: RelevanceSelector::new(
                    self.config.relevance.clone(),
                    self.embedder.clone(),
                ),
                config: self.config.clone(),
                summarizer: self.summarizer.clone(),
                store,
            }),
        }
    }
}

/// 对一组按时间排序的轮次开窗：最近 k 轮原样保留，更早的合并为一条摘要轮（id 取被合并的最后一轮）
pub fn window_turns(turns: &[Turn], k: usize) -> Vec<Turn> {
    if turns.len() <= k {
        return turns.to_vec();
    }
    let (older, recent) = turns.split_at(turns.len() - k);
    let mut windowed = Vec::with_capacity(k + 1);
    if let Some(last_old) = older.last() {
        let digest: Vec<String> = older.iter().map(|t| format!("- {}", t.summary)).collect();
        windowed.push(Turn {
            id: last_old.id,
            query: format!("(summary of {} earlier turns)", older.len()),
            answer: digest.join("\n"),
            summary: format!("Summary of {} earlier turns", older.len()),
            created_at: last_old.created_at,
        });
    }
    windowed.extend_from_slice(recent);
    windowed
}

struct State {
    turns: Vec<Turn>,
    next_id: u64,
    /// 已触发过剪枝：之后保持 prune_to 长度
    pruning: bool,
    model: Option<String>,
}

struct Inner {
    state: Mutex<State>,
    config: MemoryConfig,
    summarizer: Arc<dyn Summarizer>,
    selector: RelevanceSelector,
    store: Arc<dyn MessageStore>,
}

#[derive(Clone)]
pub struct ConversationMemory {
    inner: Arc<Inner>,
}

impl ConversationMemory {
    pub fn new(config: MemoryConfig) -> Self {
        MemoryBuilder::new(config).build()
    }

    pub fn builder(config: MemoryConfig) -> MemoryBuilder {
        MemoryBuilder::new(config)
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.inner.config
    }

    /// 从 MessageStore 加载已有轮次，返回加载条数
    pub async fn initialize(&self) -> Result<usize, MemoryError> {
        let loaded = self.inner.store.load().await?;
        let mut state = self.inner.state.lock().await;
        let max_next = loaded.iter().map(|t| t.id + 1).max().unwrap_or(0);
        state.next_id = state.next_id.max(max_next);
        state.turns = loaded;
        self.prune_locked(&mut state);
        tracing::debug!(count = state.turns.len(), next_id = state.next_id, "memory initialized");
        Ok(state.turns.len())
    }

    /// 追加一轮：校验非空、生成摘要、分配 id、必要时剪枝，然后持久化（失败只记日志）
    pub async fn add_turn(
        &self,
        query: &str,
        answer: &str,
        summary: Option<String>,
    ) -> Result<Turn, MemoryError> {
        if query.trim().is_empty() {
            return Err(MemoryError::EmptyQuery);
        }
        if answer.trim().is_empty() {
            return Err(MemoryError::EmptyAnswer);
        }
        let summary = match summary {
            Some(s) if !s.trim().is_empty() => s,
            _ => self.inner.summarizer.summarize(query, answer).await,
        };

        let mut state = self.inner.state.lock().await;
        let turn = Turn {
            id: state.next_id,
            query: query.to_string(),
            answer: answer.to_string(),
            summary,
            created_at: Utc::now(),
        };
        state.next_id += 1;
        state.turns.push(turn.clone());
        self.prune_locked(&mut state);

        if let Err(e) = self.inner.store.save(&state.turns).await {
            tracing::warn!(error = %e, "memory persistence failed, continuing in memory");
        }
        tracing::debug!(turn_id = turn.id, total = state.turns.len(), "turn added");
        Ok(turn)
    }

    fn prune_locked(&self, state: &mut State) {
        let cfg = &self.inner.config;
        if !state.pruning && state.turns.len() < cfg.prune_threshold {
            return;
        }
        state.pruning = true;
        if state.turns.len() > cfg.prune_to {
            let removed = state.turns.len() - cfg.prune_to;
            state.turns.drain(..removed);
            tracing::debug!(removed, remaining = state.turns.len(), "turns pruned");
        }
    }

    /// 与 query 相关的轮次（时间顺序）
    pub async fn select_relevant(&self, query: &str) -> Vec<Turn> {
        let turns = self.turns().await;
        self.inner.selector.select(query, &turns).await
    }

    /// 渲染为规划 prompt 的上下文段落；回答超出 per_message_token_limit 时截断并标注
    pub fn format_for_planning(&self, turns: &[Turn]) -> String {
        if turns.is_empty() {
            return String::new();
        }
        let limit = self.inner.config.per_message_token_limit;
        let mut out = String::from("## Previous Conversation Context\n");
        for (i, t) in turns.iter().enumerate() {
            let answer = if t.answer.chars().count() > limit {
                let cut: String = t.answer.chars().take(limit).collect();
                format!("{cut}... [truncated]")
            } else {
                t.answer.clone()
            };
            out.push_str(&format!(
                "\nTurn {}:\nUser: {}\nAgent: {}\n",
                i + 1,
                t.query,
                answer
            ));
        }
        out.push_str("\n---\n");
        out
    }

    /// 全部轮次的摘要视图
    pub async fn format_for_context(&self) -> String {
        let turns = self.turns().await;
        if turns.is_empty() {
            return String::new();
        }
        let mut out = String::from("## Conversation History\n");
        for t in &turns {
            out.push_str(&format!(
                "\nTurn {}:\nQuery: {}\nSummary: {}\n",
                t.id + 1,
                t.query,
                t.summary
            ));
        }
        out
    }

    /// 上下文窗口视图：最近 k 轮原样保留，更早的轮次合并为一条摘要轮。
    /// 返回独立的临时记忆，不修改本实例。
    pub async fn window(&self, k: usize) -> ConversationMemory {
        let (turns, model) = {
            let state = self.inner.state.lock().await;
            (state.turns.clone(), state.model.clone())
        };
        let view = MemoryBuilder {
            config: self.inner.config.clone(),
            summarizer: self.inner.summarizer.clone(),
            embedder: self.inner.selector.embedder(),
            stores: None,
        };
        view.build_with(window_turns(&turns, k), model)
    }

    /// 清空轮次与存储；id 计数不回退
    pub async fn clear(&self) -> Result<(), MemoryError> {
        {
            let mut state = self.inner.state.lock().await;
            state.turns.clear();
            state.pruning = false;
        }
        self.inner.store.clear().await?;
        tracing::info!("memory cleared");
        Ok(())
    }

    pub async fn turns(&self) -> Vec<Turn> {
        self.inner.state.lock().await.turns.clone()
    }

    pub async fn len(&self) -> usize {
        self.inner.state.lock().await.turns.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn last(&self) -> Option<Turn> {
        self.inner.state.lock().await.turns.last().cloned()
    }

    pub async fn get(&self, id: u64) -> Option<Turn> {
        self.inner
            .state
            .lock()
            .await
            .turns
            .iter()
            .find(|t| t.id == id)
            .cloned()
    }

    pub async fn model(&self) -> Option<String> {
        self.inner.state.lock().await.model.clone()
    }

    pub async fn set_model(&self, model: impl Into<String>) {
        self.inner.state.lock().await.model = Some(model.into());
    }

    /// 是否与 other 指向同一份记忆
    pub fn same_as(&self, other: &ConversationMemory) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for ConversationMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationMemory")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    fn small(threshold: usize, to: usize) -> ConversationMemory {
        ConversationMemory::new(MemoryConfig {
            prune_threshold: threshold,
            prune_to: to,
            ..Default::default()
        })
    }

    fn ids(ts: &[Turn]) -> Vec<u64> {
        ts.iter().map(|t| t.id).collect()
    }

    #[tokio::test]
    async fn test_twelve_turns_keep_last_five() {
        let mem = small(10, 5);
        for i in 0..12 {
            mem.add_turn(&format!("Q{i}"), &format!("A{i}"), None)
                .await
                .unwrap();
            assert!(mem.len().await <= 10);
        }
        let turns = mem.turns().await;
        assert_eq!(ids(&turns), vec![7, 8, 9, 10, 11]);
        assert_eq!(turns[0].query, "Q7");
    }

    #[tokio::test]
    async fn test_length_is_prune_to_once_triggered() {
        let mem = small(4, 2);
        let mut triggered = false;
        for i in 0..9 {
            mem.add_turn(&format!("q{i}"), "a", None).await.unwrap();
            let len = mem.len().await;
            assert!(len <= 4);
            if i + 1 >= 4 {
                triggered = true;
            }
            if triggered {
                assert_eq!(len, 2);
                let turns = mem.turns().await;
                assert_eq!(turns.last().unwrap().id, i as u64);
            }
        }
    }

    #[tokio::test]
    async fn test_ids_strictly_increase_across_prune_and_clear() {
        let mem = small(3, 1);
        let mut last: Option<u64> = None;
        for round in 0..3 {
            for i in 0..5 {
                let t = mem.add_turn(&format!("q{round}{i}"), "a", None).await.unwrap();
                if let Some(prev) = last {
                    assert!(t.id > prev);
                }
                last = Some(t.id);
            }
            mem.clear().await.unwrap();
            assert!(mem.is_empty().await);
        }
    }

    #[tokio::test]
    async fn test_rejects_empty_query_or_answer() {
        let mem = small(10, 5);
        assert!(matches!(
            mem.add_turn("  ", "a", None).await,
            Err(MemoryError::EmptyQuery)
        ));
        assert!(matches!(
            mem.add_turn("q", "\n", None).await,
            Err(MemoryError::EmptyAnswer)
        ));
        assert!(mem.is_empty().await);
    }

    #[tokio::test]
    async fn test_summary_is_generated_when_missing() {
        let mem = small(10, 5);
        let t = mem.add_turn("what is 2+2", "4", None).await.unwrap();
        assert_eq!(t.summary, "what is 2+2 → 4");
        let t = mem
            .add_turn("q", "a", Some("custom".to_string()))
            .await
            .unwrap();
        assert_eq!(t.summary, "custom");
    }

    #[tokio::test]
    async fn test_select_relevant_small_history_returns_all_in_order() {
        let mem = small(100, 50);
        for i in 0..4 {
            mem.add_turn(&format!("q{i}"), "a", None).await.unwrap();
        }
        assert_eq!(ids(&mem.select_relevant("anything").await), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_format_for_planning_truncates_long_answers() {
        let mem = ConversationMemory::new(MemoryConfig {
            per_message_token_limit: 10,
            ..Default::default()
        });
        mem.add_turn("first", "short", None).await.unwrap();
        mem.add_turn("second", &"x".repeat(50), None).await.unwrap();
        let text = mem.format_for_planning(&mem.turns().await);
        assert!(text.starts_with("## Previous Conversation Context"));
        assert!(text.contains("Turn 1:\nUser: first\nAgent: short"));
        assert!(text.contains(&format!("Turn 2:\nUser: second\nAgent: {}... [truncated]", "x".repeat(10))));
        assert!(mem.format_for_planning(&[]).is_empty());
    }

    #[tokio::test]
    async fn test_window_keeps_recent_and_summarizes_older() {
        let mem = small(100, 50);
        for i in 0..5 {
            mem.add_turn(&format!("q{i}"), &format!("a{i}"), None).await.unwrap();
        }
        let view = mem.window(2).await;
        let turns = view.turns().await;
        assert_eq!(turns.len(), 3);
        assert!(turns[0].answer.contains("q0 → a0"));
        assert!(turns[0].answer.contains("q2 → a2"));
        assert_eq!(ids(&turns[1..]), vec![3, 4]);

        // 视图独立：写入视图不影响原记忆
        view.add_turn("extra", "x", None).await.unwrap();
        assert_eq!(mem.len().await, 5);
        assert!(!view.same_as(&mem));
    }

    struct FailingStore;

    #[async_trait]
    impl MessageStore for FailingStore {
        async fn save(&self, _turns: &[Turn]) -> Result<(), MemoryError> {
            Err(MemoryError::Persistence("disk full".into()))
        }
        async fn load(&self) -> Result<Vec<Turn>, MemoryError> {
            Ok(Vec::new())
        }
        async fn clear(&self) -> Result<(), MemoryError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_persistence_failure_does_not_fail_add() {
        let mem = ConversationMemory::builder(MemoryConfig::default())
            .store_factory(|_| -> Arc<dyn MessageStore> { Arc::new(FailingStore) })
            .build_session("s");
        mem.add_turn("q", "a", None).await.unwrap();
        assert_eq!(mem.len().await, 1);
    }

    #[tokio::test]
    async fn test_initialize_continues_ids_from_store() {
        let store: Arc<dyn MessageStore> = Arc::new(InMemoryMessageStore::new());
        let builder = ConversationMemory::builder(MemoryConfig::default()).store_factory({
            let store = store.clone();
            move |_| store.clone()
        });
        let first = builder.build_session("s");
        first.add_turn("q0", "a0", None).await.unwrap();
        first.add_turn("q1", "a1", None).await.unwrap();

        let second = builder.build_session("s");
        assert_eq!(second.initialize().await.unwrap(), 2);
        let t = second.add_turn("q2", "a2", None).await.unwrap();
        assert_eq!(t.id, 2);
    }

    #[tokio::test]
    async fn test_sessions_persist_to_their_own_stores() {
        type Stores = std::sync::Mutex<std::collections::HashMap<String, Arc<InMemoryMessageStore>>>;
        let stores: Arc<Stores> = Arc::default();
        let builder = ConversationMemory::builder(MemoryConfig::default()).store_factory({
            let stores = stores.clone();
            move |key: &str| -> Arc<dyn MessageStore> {
                stores
                    .lock()
                    .unwrap()
                    .entry(key.to_string())
                    .or_insert_with(|| Arc::new(InMemoryMessageStore::new()))
                    .clone()
            }
        });

        let alice = builder.build_session("alice");
        let bob = builder.build_session("bob");
        alice.add_turn("alice q1", "a", None).await.unwrap();
        alice.add_turn("alice q2", "a", None).await.unwrap();
        bob.add_turn("bob q", "b", None).await.unwrap();

        let saved = |key: &str| stores.lock().unwrap().get(key).cloned().unwrap();
        let alice_saved: Vec<String> = saved("alice")
            .load()
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.query)
            .collect();
        assert_eq!(alice_saved, vec!["alice q1", "alice q2"]);
        assert_eq!(saved("bob").load().await.unwrap().len(), 1);

        bob.clear().await.unwrap();
        assert_eq!(saved("alice").load().await.unwrap().len(), 2);
        assert!(saved("bob").load().await.unwrap().is_empty());
    }
}
