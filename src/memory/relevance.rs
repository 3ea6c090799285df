//! 相关性选择：相似度 + 新近度混合打分
//!
//! score = (1 - w) * cos(embed(query), embed(summary)) + w * recency，recency 按位置线性（最旧 0，最新 1）。
//! 相似度低于阈值的轮次被过滤；无一通过或嵌入不可用时退回「最近 max_messages 轮」。
//! 返回结果始终按时间顺序排列。

use std::sync::Arc;

use crate::llm::EmbeddingProvider;
use crate::memory::Turn;

#[derive(Debug, Clone, PartialEq)]
pub struct RelevanceConfig {
    /// 最多选出的轮次
    pub max_messages: usize,
    pub similarity_threshold: f32,
    /// 新近度权重 w
    pub recency_weight: f32,
    pub use_embeddings: bool,
}

impl Default for RelevanceConfig {
    fn default() -> Self {
        Self {
            max_messages: 10,
            similarity_threshold: 0.3,
            recency_weight: 0.3,
            use_embeddings: true,
        }
    }
}

/// 余弦相似度；长度不一致或零向量时为 0
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[derive(Clone)]
pub struct RelevanceSelector {
    config: RelevanceConfig,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
}

impl RelevanceSelector {
    pub fn new(config: RelevanceConfig, embedder: Option<Arc<dyn EmbeddingProvider>>) -> Self {
        Self { config, embedder }
    }

    pub fn config(&self) -> &RelevanceConfig {
        &self.config
    }

    pub fn embedder(&self) -> Option<Arc<dyn EmbeddingProvider>> {
        self.embedder.clone()
    }

    /// 从按时间排序的 turns 中选出与 query 相关的轮次（按时间顺序返回）
    pub async fn select(&self, query: &str, turns: &[Turn]) -> Vec<Turn> {
        let max = self.config.max_messages;
        if turns.len() <= max {
            return turns.to_vec();
        }
        let embedder = match (&self.embedder, self.config.use_embeddings) {
            (Some(e), true) => e,
            _ => return most_recent(turns, max),
        };

        let query_vec = match embedder.embed(query).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "query embedding failed, falling back to recency");
                return most_recent(turns, max);
            }
        };
        let summaries: Vec<String> = turns.iter().map(|t| t.summary.clone()).collect();
        let turn_vecs = match embedder.embed_batch(&summaries).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "summary embedding failed, falling back to recency");
                return most_recent(turns, max);
            }
        };

        let w = self.config.recency_weight.clamp(0.0, 1.0);
        let last = (turns.len() - 1) as f32;
        let mut scored: Vec<(usize, f32)> = turn_vecs
            .iter()
            .enumerate()
            .filter_map(|(i, v)| {
                let sim = cosine_similarity(&query_vec, v);
                if sim < self.config.similarity_threshold {
                    return None;
                }
                let recency = i as f32 / last;
                Some((i, (1.0 - w) * sim + w * recency))
            })
            .collect();

        if scored.is_empty() {
            tracing::debug!("no turn passed similarity threshold, using recency");
            return most_recent(turns, max);
        }

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(max);
        scored.sort_by_key(|(i, _)| *i);
        scored.into_iter().map(|(i, _)| turns[i].clone()).collect()
    }
}

fn most_recent(turns: &[Turn], max: usize) -> Vec<Turn> {
    turns[turns.len().saturating_sub(max)..].to_vec()
}
