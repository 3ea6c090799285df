//! 嵌入 API：供对话记忆的相关性选择使用，调用 OpenAI 兼容的 /embeddings 端点
//!
//! CachedEmbedder 以内容 SHA-256 为键缓存向量；批量嵌入只计算未命中的文本，
//! 未命中部分并发计算，单个失败不影响其他结果写入缓存。

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_openai::config::OpenAIConfig;
use async_openai::types::embeddings::{CreateEmbeddingRequestArgs, EmbeddingInput};
use async_openai::Client;
use async_trait::async_trait;
use futures_util::future::join_all;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EmbeddingError {
    #[error("embedding request failed: {0}")]
    Request(String),

    #[error("{failed} of {total} embeddings failed: {first}")]
    Partial {
        failed: usize,
        total: usize,
        first: String,
    },
}

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// 将文本编码为向量
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// 逐条返回结果；默认并发调用 embed，互不取消
    async fn embed_each(&self, texts: &[String]) -> Vec<Result<Vec<f32>, EmbeddingError>> {
        join_all(texts.iter().map(|t| self.embed(t))).await
    }

    /// 批量嵌入：全部成功才返回 Ok，否则汇总失败数
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        collect_batch(self.embed_each(texts).await)
    }
}

/// 部分失败汇总
pub fn collect_batch(
    results: Vec<Result<Vec<f32>, EmbeddingError>>,
) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    let total = results.len();
    let mut vectors = Vec::with_capacity(total);
    let mut failed = 0usize;
    let mut first: Option<String> = None;
    for r in results {
        match r {
            Ok(v) => vectors.push(v),
            Err(e) => {
                failed += 1;
                first.get_or_insert_with(|| e.to_string());
            }
        }
    }
    match first {
        None => Ok(vectors),
        Some(first) => Err(EmbeddingError::Partial {
            failed,
            total,
            first,
        }),
    }
}

/// 使用 async-openai 调用 OpenAI 兼容的 embeddings API
#[derive(Clone)]
pub struct OpenAiEmbedder {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiEmbedder {
    /// 从环境变量与可选 base_url 创建（与 LLM 共用 OPENAI_API_KEY / base_url）
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = match base_url {
            Some(url) => OpenAIConfig::new().with_api_base(url).with_api_key(api_key),
            None => OpenAIConfig::new().with_api_key(api_key),
        };

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
        }
    }

    async fn request(&self, input: EmbeddingInput) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let request = CreateEmbeddingRequestArgs::default()
            .model(&self.model)
            .input(input)
            .build()
            .map_err(|e| EmbeddingError::Request(e.to_string()))?;
        let response = self
            .client
            .embeddings()
            .create(request)
            .await
            .map_err(|e| EmbeddingError::Request(e.to_string()))?;
        let mut data = response.data;
        data.sort_by_key(|e| e.index);
        Ok(data.into_iter().map(|e| e.embedding).collect())
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(vec![]);
        }
        let mut vectors = self
            .request(EmbeddingInput::String(text.to_string()))
            .await?;
        if vectors.is_empty() {
            return Err(EmbeddingError::Request("empty embedding response".into()));
        }
        Ok(vectors.swap_remove(0))
    }

    /// 原生批量接口：一次请求；失败时每条都带同一个错误
    async fn embed_each(&self, texts: &[String]) -> Vec<Result<Vec<f32>, EmbeddingError>> {
        if texts.is_empty() {
            return Vec::new();
        }
        match self.request(EmbeddingInput::StringArray(texts.to_vec())).await {
            Ok(vectors) if vectors.len() == texts.len() => vectors.into_iter().map(Ok).collect(),
            Ok(vectors) => {
                let e = EmbeddingError::Request(format!(
                    "expected {} embeddings, got {}",
                    texts.len(),
                    vectors.len()
                ));
                texts.iter().map(|_| Err(e.clone())).collect()
            }
            Err(e) => texts.iter().map(|_| Err(e.clone())).collect(),
        }
    }
}

/// 内容哈希（十六进制 SHA-256）
pub fn content_hash(text: &str) -> String {
    Sha256::digest(text.as_bytes())
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// 带缓存的嵌入提供方；缓存读多写少
pub struct CachedEmbedder {
    inner: Arc<dyn EmbeddingProvider>,
    cache: RwLock<HashMap<String, Vec<f32>>>,
}

impl CachedEmbedder {
    pub fn new(inner: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            inner,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn cache_len(&self) -> usize {
        self.cache.read().map(|c| c.len()).unwrap_or_else(|e| e.into_inner().len())
    }

    pub fn clear_cache(&self) {
        match self.cache.write() {
            Ok(mut c) => c.clear(),
            Err(e) => e.into_inner().clear(),
        }
        tracing::debug!("embedding cache cleared");
    }

    fn lookup(&self, key: &str) -> Option<Vec<f32>> {
        match self.cache.read() {
            Ok(c) => c.get(key).cloned(),
            Err(e) => e.into_inner().get(key).cloned(),
        }
    }

    fn store(&self, key: String, vector: Vec<f32>) {
        match self.cache.write() {
            Ok(mut c) => {
                c.insert(key, vector);
            }
            Err(e) => {
                e.into_inner().insert(key, vector);
            }
        }
    }
}

#[async_trait]
impl EmbeddingProvider for CachedEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let key = content_hash(text);
        if let Some(v) = self.lookup(&key) {
            return Ok(v);
        }
        let v = self.inner.embed(text).await?;
        self.store(key, v.clone());
        Ok(v)
    }

    async fn embed_each(&self, texts: &[String]) -> Vec<Result<Vec<f32>, EmbeddingError>> {
        let keys: Vec<String> = texts.iter().map(|t| content_hash(t)).collect();
        let mut results: Vec<Option<Result<Vec<f32>, EmbeddingError>>> =
            keys.iter().map(|k| self.lookup(k).map(Ok)).collect();

        // 同一批内重复文本只算一次
        let mut miss_index: HashMap<&str, usize> = HashMap::new();
        let mut misses: Vec<String> = Vec::new();
        for (i, slot) in results.iter().enumerate() {
            if slot.is_none() && !miss_index.contains_key(keys[i].as_str()) {
                miss_index.insert(keys[i].as_str(), misses.len());
                misses.push(texts[i].clone());
            }
        }

        if !misses.is_empty() {
            tracing::debug!(
                hits = texts.len() - misses.len(),
                misses = misses.len(),
                "embedding batch"
            );
            let computed = self.inner.embed_each(&misses).await;
            for (i, slot) in results.iter_mut().enumerate() {
                if slot.is_some() {
                    continue;
                }
                if let Some(r) = miss_index
                    .get(keys[i].as_str())
                    .and_then(|&j| computed.get(j))
                {
                    if let Ok(v) = r {
                        self.store(keys[i].clone(), v.clone());
                    }
                    *slot = Some(r.clone());
                }
            }
        }

        results
            .into_iter()
            .map(|r| r.unwrap_or_else(|| Err(EmbeddingError::Request("missing result".into()))))
            .collect()
    }
}

/// 从应用配置创建嵌入提供方（自动包一层缓存）；未配置 Key 时返回 None
pub fn create_embedder_from_config(
    base_url: Option<&str>,
    model: &str,
    api_key: Option<&str>,
) -> Option<Arc<dyn EmbeddingProvider>> {
    let key = api_key
        .map(String::from)
        .or_else(|| std::env::var("OPENAI_API_KEY").ok());
    if key.as_deref().unwrap_or("").is_empty() || key.as_deref() == Some("sk-placeholder") {
        tracing::debug!("embedding skipped: no OPENAI_API_KEY");
        return None;
    }
    let raw: Arc<dyn EmbeddingProvider> =
        Arc::new(OpenAiEmbedder::new(base_url, model, key.as_deref()));
    Some(Arc::new(CachedEmbedder::new(raw)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// 记录每次实际计算的文本；包含 "fail" 的文本返回错误
    #[derive(Default)]
    struct CountingEmbedder {
        seen: Mutex<Vec<String>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for CountingEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(text.to_string());
            if text.contains("fail") {
                return Err(EmbeddingError::Request("boom".into()));
            }
            Ok(vec![text.len() as f32, 1.0])
        }
    }

    fn texts(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_content_hash_is_stable_hex() {
        let h = content_hash("hello");
        assert_eq!(h.len(), 64);
        assert_eq!(h, content_hash("hello"));
        assert_ne!(h, content_hash("hello "));
    }

    #[tokio::test]
    async fn test_batch_only_computes_misses() {
        let inner = Arc::new(CountingEmbedder::default());
        let cached = CachedEmbedder::new(inner.clone());

        cached.embed("alpha").await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);

        let out = cached
            .embed_batch(&texts(&["alpha", "beta", "beta", "gamma"]))
            .await
            .unwrap();
        assert_eq!(out.len(), 4);
        assert_eq!(out[0], vec![5.0, 1.0]);
        assert_eq!(out[1], out[2]);
        // alpha 命中缓存，beta 只算一次
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
        assert_eq!(cached.cache_len(), 3);
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_successes_cached() {
        let inner = Arc::new(CountingEmbedder::default());
        let cached = CachedEmbedder::new(inner.clone());

        let err = cached
            .embed_batch(&texts(&["ok one", "fail", "ok two"]))
            .await
            .unwrap_err();
        assert!(matches!(err, EmbeddingError::Partial { failed: 1, total: 3, .. }));
        assert_eq!(cached.cache_len(), 2);

        cached.embed("ok two").await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }
}
